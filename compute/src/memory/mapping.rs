use super::{Memory, Region};
use crate::queue::Queue;
use bytemuck::Pod;
use common::{MapFlags, Result};
use std::{
    ops::{Deref, DerefMut},
    ptr,
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::Arc,
};

/// 资源的一段主机可见映射。
///
/// 映射借用资源，离开作用域或交给 `unmap` 时解除。
pub struct Mapping<'a> {
    memory: &'a Memory,
    region: Arc<Region>,
    offset: usize,
    len: usize,
    flags: MapFlags,
    id: u64,
}

/// 尚未同步的非阻塞映射，只能通过 [`PendingMapping::synchronize`] 取得内容。
pub struct PendingMapping<'a>(Mapping<'a>);

impl<'a> PendingMapping<'a> {
    /// 等待队列中已提交的工作完成。失败时映射随之解除。
    pub fn synchronize(self, queue: &Queue) -> Result<Mapping<'a>> {
        self.0.memory.check_queue(queue)?;
        queue.finish()?;
        self.0.memory.check_idle(self.0.flags.writes())?;
        Ok(self.0)
    }
}

impl<'a> Mapping<'a> {
    pub(super) fn new(
        memory: &'a Memory,
        region: Arc<Region>,
        offset: usize,
        len: usize,
        flags: MapFlags,
        id: u64,
    ) -> Self {
        Self {
            memory,
            region,
            offset,
            len,
            flags,
            id,
        }
    }

    #[inline]
    pub(super) fn pending(self) -> PendingMapping<'a> {
        PendingMapping(self)
    }

    #[inline]
    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// 按 `T` 解释映射内容，长度或对齐不符时返回 `None`。
    pub fn as_slice_of<T: Pod>(&self) -> Option<&[T]> {
        bytemuck::try_cast_slice(&self[..]).ok()
    }

    pub fn as_mut_slice_of<T: Pod>(&mut self) -> Option<&mut [T]> {
        bytemuck::try_cast_slice_mut(&mut self[..]).ok()
    }

    #[inline]
    pub(super) fn belongs_to(&self, memory: &Memory) -> bool {
        ptr::eq(self.memory, memory)
    }
}

impl Deref for Mapping<'_> {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { from_raw_parts(self.region.as_ptr().add(self.offset), self.len) }
    }
}

impl DerefMut for Mapping<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        assert!(self.flags.writes(), "mapping is read-only");
        unsafe { from_raw_parts_mut(self.region.as_ptr().add(self.offset), self.len) }
    }
}

impl Drop for Mapping<'_> {
    fn drop(&mut self) {
        self.memory.forget_map(self.id)
    }
}
