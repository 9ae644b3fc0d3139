use super::DeviceStats;
use crate::kernel::BufferView;
use common::{validation, Result};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    ptr::{copy, copy_nonoverlapping, NonNull},
    sync::{atomic::Ordering::Relaxed, Arc},
};

const ALIGN: usize = 64;

/// 设备上的一块存储。
///
/// 多个命令可以同时持有同一块存储，最后一个持有者释放时归还。
pub(crate) struct Region {
    ptr: NonNull<u8>,
    len: usize,
    stats: Arc<DeviceStats>,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn new(len: usize, stats: &Arc<DeviceStats>) -> Result<Arc<Self>> {
        let layout = Layout::from_size_align(len, ALIGN)
            .ok()
            .filter(|l| l.size() > 0)
            .ok_or_else(|| validation(format!("cannot allocate {len} bytes")))?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or_else(|| validation(format!("out of device memory allocating {len} bytes")))?;
        stats.allocations.fetch_add(1, Relaxed);
        stats.bytes.fetch_add(len, Relaxed);
        Ok(Arc::new(Self {
            ptr,
            len,
            stats: stats.clone(),
        }))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn view(&self, offset: usize, len: usize) -> BufferView {
        debug_assert!(offset + len <= self.len);
        BufferView::new(unsafe { self.as_ptr().add(offset) }, len)
    }

    pub unsafe fn read(&self, offset: usize, dst: &mut [u8]) {
        copy_nonoverlapping(self.as_ptr().add(offset), dst.as_mut_ptr(), dst.len())
    }

    pub unsafe fn write(&self, offset: usize, src: &[u8]) {
        copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(offset), src.len())
    }

    /// 允许源与目标重叠。
    pub unsafe fn copy_from(&self, dst_offset: usize, src: &Region, src_offset: usize, size: usize) {
        copy(
            src.as_ptr().add(src_offset),
            self.as_ptr().add(dst_offset),
            size,
        )
    }

    pub unsafe fn fill(&self, offset: usize, size: usize, pattern: &[u8]) {
        let dst = self.as_ptr().add(offset);
        if let [byte] = pattern {
            dst.write_bytes(*byte, size)
        } else {
            for i in (0..size).step_by(pattern.len()) {
                copy_nonoverlapping(pattern.as_ptr(), dst.add(i), pattern.len())
            }
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let &mut Region { ptr, len, .. } = self;
        unsafe { dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(len, ALIGN)) };
        self.stats.allocations.fetch_sub(1, Relaxed);
        self.stats.bytes.fetch_sub(len, Relaxed);
    }
}
