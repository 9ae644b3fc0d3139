use super::{HostMemory, InteropHandle, Mapping, Memory, PendingMapping};
use crate::{device::DeviceId, queue::Queue};
use bytemuck::Pod;
use common::{MapFlags, MemoryFlags, Result};
use std::sync::Arc;

/// 线性设备存储，最后一个引用释放时销毁。
#[derive(Clone)]
pub struct Buffer(pub(crate) Arc<Memory>);

impl Buffer {
    pub(crate) fn new(
        queue: &Queue,
        size: usize,
        flags: MemoryFlags,
        host: Option<HostMemory>,
        interop: Option<InteropHandle>,
    ) -> Result<Self> {
        Memory::new(queue, size, flags, host, interop).map(|m| Self(Arc::new(m)))
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.0.device()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    #[inline]
    pub fn flags(&self) -> MemoryFlags {
        self.0.flags()
    }

    #[inline]
    pub fn interop_handle(&self) -> Option<InteropHandle> {
        self.0.interop_handle()
    }

    /// 阻塞读取 `[offset, offset + size)` 到 `dst`，`size == 0` 表示到末尾，返回读取的字节数。
    #[inline]
    pub fn read(&self, queue: &Queue, dst: &mut [u8], size: usize, offset: usize) -> Result<usize> {
        self.0.read(queue, dst, size, offset)
    }

    /// 读取整个缓冲并按 `T` 解释。
    #[inline]
    pub fn read_as<T: Pod>(&self, queue: &Queue) -> Result<Vec<T>> {
        self.0.read_as(queue)
    }

    /// 在队列上异步写入，数据在调用时复制。
    #[inline]
    pub fn write(&self, queue: &Queue, src: &[u8], size: usize, offset: usize) -> Result<()> {
        self.0.write(queue, src, size, offset)
    }

    #[inline]
    pub fn write_from<T: Pod>(&self, queue: &Queue, src: &[T], offset: usize) -> Result<()> {
        let src = bytemuck::cast_slice(src);
        self.0.write(queue, src, src.len(), offset)
    }

    /// 读回到创建时引用的主机内存。
    #[inline]
    pub fn read_to_host(&self, queue: &Queue, size: usize, offset: usize) -> Result<()> {
        self.0.read_to_host(queue, size, offset)
    }

    /// 从创建时引用的主机内存写入。
    #[inline]
    pub fn write_from_host(&self, queue: &Queue, size: usize, offset: usize) -> Result<()> {
        self.0.write_from_host(queue, size, offset)
    }

    #[inline]
    pub fn copy(
        &self,
        queue: &Queue,
        src: &Buffer,
        size: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> Result<()> {
        self.0.copy(queue, &src.0, size, src_offset, dst_offset)
    }

    /// 以 `pattern` 重复填充，`size` 必须是模式长度的整数倍。
    #[inline]
    pub fn fill(&self, queue: &Queue, pattern: &[u8], size: usize, offset: usize) -> Result<()> {
        self.0.fill(queue, pattern, size, offset)
    }

    #[inline]
    pub fn zero(&self, queue: &Queue) -> Result<()> {
        self.0.fill(queue, &[0], 0, 0)
    }

    /// 映射 `[offset, offset + size)`，先等待队列中已提交的工作完成。
    #[inline]
    pub fn map(&self, queue: &Queue, flags: MapFlags, size: usize, offset: usize) -> Result<Mapping<'_>> {
        self.0.map(queue, flags, size, offset)
    }

    /// 非阻塞映射，同步后才能访问内容。
    #[inline]
    pub fn map_pending(
        &self,
        queue: &Queue,
        flags: MapFlags,
        size: usize,
        offset: usize,
    ) -> Result<PendingMapping<'_>> {
        self.0.map_pending(queue, flags, size, offset)
    }

    #[inline]
    pub fn unmap(&self, queue: &Queue, mapping: Mapping<'_>) -> Result<()> {
        self.0.unmap(queue, mapping)
    }

    /// 改变大小。已提交的命令继续使用旧存储。
    #[inline]
    pub fn resize(
        &self,
        queue: &Queue,
        new_size: usize,
        copy_old_data: bool,
        copy_host_data: bool,
        new_host: Option<HostMemory>,
    ) -> Result<()> {
        self.0
            .resize(queue, new_size, copy_old_data, copy_host_data, new_host)
    }

    #[inline]
    pub fn acquire_interop(&self, queue: &Queue) -> Result<()> {
        self.0.acquire(queue)
    }

    #[inline]
    pub fn release_interop(&self, queue: &Queue) -> Result<()> {
        self.0.release(queue)
    }
}
