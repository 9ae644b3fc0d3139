mod buffer;
mod image;
mod mapping;
mod region;

pub use buffer::Buffer;
pub use image::{Image, ImageDesc, ImageDim, ImageFormat, ImageLayout};
pub use mapping::{Mapping, PendingMapping};

pub(crate) use image::ImageCore;
pub(crate) use region::Region;

use crate::{
    device::DeviceId,
    queue::{Command, Queue, Submission},
};
use bytemuck::{Pod, Zeroable};
use common::{
    check_range, device_mismatch, synchronization, validation, MapFlags, MemoryFlags, Result,
};
use std::{
    ops::Range,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed},
        Arc, Mutex, MutexGuard, RwLock,
    },
};

/// 调用方持有的主机内存，可在多个资源间共享。
#[derive(Clone, Default, Debug)]
pub struct HostMemory(Arc<Mutex<Vec<u8>>>);

impl HostMemory {
    #[inline]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(bytes)))
    }

    pub fn from_slice<T: Pod>(data: &[T]) -> Self {
        Self::new(bytemuck::cast_slice(data).to_vec())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<Vec<u8>> {
        self.0.lock().unwrap()
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }
}

/// 外部图形 API 中对象的不透明句柄。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct InteropHandle(pub u64);

/// 某个设备上存活的分配。
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct MemoryStats {
    pub allocations: usize,
    pub bytes: usize,
}

#[derive(Default, Debug)]
pub(crate) struct DeviceStats {
    allocations: AtomicUsize,
    bytes: AtomicUsize,
}

impl DeviceStats {
    pub fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            allocations: self.allocations.load(Relaxed),
            bytes: self.bytes.load(Relaxed),
        }
    }
}

struct MapRecord {
    id: u64,
    range: Range<usize>,
    write: bool,
}

/// 主机映射与设备使用，同一把锁下互斥。
#[derive(Default)]
struct MapState {
    records: Vec<MapRecord>,
    device_reads: usize,
    device_writes: usize,
}

impl MapState {
    /// 设备侧的使用与主机映射冲突。
    fn device_busy(&self, write: bool) -> bool {
        self.device_writes > 0 || (write && self.device_reads > 0)
    }
}

/// 已提交命令对资源的使用，命令完成后释放。
pub(crate) struct DeviceUse {
    memory: Arc<Memory>,
    write: bool,
}

impl Drop for DeviceUse {
    fn drop(&mut self) {
        let mut maps = self.memory.maps.lock().unwrap();
        if self.write {
            maps.device_writes -= 1
        } else {
            maps.device_reads -= 1
        }
    }
}

static MAP_ID: AtomicU64 = AtomicU64::new(0);

struct Interop {
    handle: InteropHandle,
    acquired: Mutex<bool>,
}

/// 缓冲和图像共用的存储状态。
pub(crate) struct Memory {
    device: DeviceId,
    flags: MemoryFlags,
    storage: RwLock<Arc<Region>>,
    host: Mutex<Option<HostMemory>>,
    maps: Mutex<MapState>,
    interop: Option<Interop>,
}

impl Memory {
    pub fn new(
        queue: &Queue,
        size: usize,
        mut flags: MemoryFlags,
        host: Option<HostMemory>,
        interop: Option<InteropHandle>,
    ) -> Result<Self> {
        let info = queue.device_info();
        if size == 0 {
            return Err(validation("resource size must not be 0"));
        }
        if size > info.limits.max_alloc {
            return Err(validation(format!(
                "{size} bytes exceeds max allocation {} of {}",
                info.limits.max_alloc, info.name,
            )));
        }
        if interop.is_some() {
            if !info.features.interop {
                return Err(validation(format!("{} does not support interop", info.name)));
            }
            flags = flags | MemoryFlags::INTEROP_SHARING;
        }
        if flags.contains(MemoryFlags::USE_HOST_MEMORY) && host.is_none() {
            return Err(validation("USE_HOST_MEMORY requires host memory"));
        }

        let region = Region::new(size, queue.stats())?;
        if let Some(host) = &host {
            let host = host.lock();
            let n = host.len().min(size);
            unsafe { region.write(0, &host[..n]) }
        }
        Ok(Self {
            device: queue.device(),
            flags,
            storage: RwLock::new(region),
            host: Mutex::new(host.filter(|_| flags.contains(MemoryFlags::USE_HOST_MEMORY))),
            maps: Default::default(),
            interop: interop.map(|handle| Interop {
                handle,
                acquired: Mutex::new(false),
            }),
        })
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.region().len()
    }

    #[inline]
    pub fn region(&self) -> Arc<Region> {
        self.storage.read().unwrap().clone()
    }

    #[inline]
    pub fn interop_handle(&self) -> Option<InteropHandle> {
        self.interop.as_ref().map(|i| i.handle)
    }

    pub fn check_queue(&self, queue: &Queue) -> Result<()> {
        if queue.device() == self.device {
            Ok(())
        } else {
            Err(device_mismatch(format!(
                "resource lives on {:?} but queue targets {:?}",
                self.device,
                queue.device(),
            )))
        }
    }

    fn check_acquired(&self) -> Result<()> {
        match &self.interop {
            Some(i) if !*i.acquired.lock().unwrap() => Err(synchronization(format!(
                "interop resource {:?} is owned by the foreign API",
                i.handle,
            ))),
            _ => Ok(()),
        }
    }

    /// 登记一次设备侧使用：互操作对象已获取，且没有与之冲突的映射。
    ///
    /// 登记存活期间，冲突的映射和互操作交还都会被拒绝。
    pub fn claim(self: &Arc<Self>, write: bool) -> Result<DeviceUse> {
        let interop = self.interop.as_ref().map(|i| (i.handle, i.acquired.lock().unwrap()));
        if let Some((handle, acquired)) = &interop {
            if !**acquired {
                return Err(synchronization(format!(
                    "interop resource {handle:?} is owned by the foreign API",
                )));
            }
        }
        let mut maps = self.maps.lock().unwrap();
        if maps.records.iter().any(|m| write || m.write) {
            return Err(synchronization(if write {
                "resource is mapped by the host"
            } else {
                "resource is mapped for writing"
            }));
        }
        if write {
            maps.device_writes += 1
        } else {
            maps.device_reads += 1
        }
        Ok(DeviceUse {
            memory: self.clone(),
            write,
        })
    }

    /// 提交命令，完成后释放登记的使用。
    fn submit(queue: &Queue, commands: Vec<Command>, uses: Vec<DeviceUse>) -> Result<()> {
        queue.submit(Submission {
            commands,
            on_complete: Some(Box::new(move |_| drop(uses))),
        })
    }

    pub fn read(&self, queue: &Queue, dst: &mut [u8], size: usize, offset: usize) -> Result<usize> {
        self.check_queue(queue)?;
        self.check_acquired()?;
        let region = self.region();
        let size = check_range("read", region.len(), size, offset)?;
        if dst.len() < size {
            return Err(validation(format!(
                "destination holds {} bytes, {size} requested",
                dst.len(),
            )));
        }
        queue.finish()?;
        unsafe { region.read(offset, &mut dst[..size]) };
        Ok(size)
    }

    /// 读取全部内容并按 `T` 解释。
    pub fn read_as<T: Pod>(&self, queue: &Queue) -> Result<Vec<T>> {
        let size = self.size();
        let item = size_of::<T>();
        if item == 0 || size % item != 0 {
            return Err(validation(format!(
                "{size} bytes is not a whole number of {}",
                std::any::type_name::<T>(),
            )));
        }
        let mut ans = vec![T::zeroed(); size / item];
        self.read(queue, bytemuck::cast_slice_mut(&mut ans), size, 0)?;
        Ok(ans)
    }

    pub fn write(self: &Arc<Self>, queue: &Queue, src: &[u8], size: usize, offset: usize) -> Result<()> {
        self.check_queue(queue)?;
        let dst = self.region();
        let size = check_range("write", dst.len(), size, offset)?;
        if src.len() < size {
            return Err(validation(format!(
                "source holds {} bytes, {size} requested",
                src.len(),
            )));
        }
        let uses = vec![self.claim(true)?];
        let data = src[..size].to_vec();
        Self::submit(queue, vec![Command::Write { dst, offset, data }], uses)
    }

    pub fn copy(
        self: &Arc<Self>,
        queue: &Queue,
        src: &Arc<Memory>,
        size: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> Result<()> {
        self.check_queue(queue)?;
        src.check_queue(queue)?;
        let src_region = src.region();
        let dst = self.region();
        let size = check_range("copy source", src_region.len(), size, src_offset)?;
        if size > 0 {
            check_range("copy destination", dst.len(), size, dst_offset)?;
        }
        let uses = vec![src.claim(false)?, self.claim(true)?];
        let copy = Command::Copy {
            src: src_region,
            src_offset,
            dst,
            dst_offset,
            size,
        };
        Self::submit(queue, vec![copy], uses)
    }

    pub fn fill(self: &Arc<Self>, queue: &Queue, pattern: &[u8], size: usize, offset: usize) -> Result<()> {
        self.check_queue(queue)?;
        if pattern.is_empty() {
            return Err(validation("fill pattern is empty"));
        }
        let dst = self.region();
        let size = check_range("fill", dst.len(), size, offset)?;
        if size % pattern.len() != 0 {
            return Err(validation(format!(
                "fill size {size} is not a multiple of pattern size {}",
                pattern.len(),
            )));
        }
        let uses = vec![self.claim(true)?];
        let fill = Command::Fill {
            dst,
            offset,
            size,
            pattern: pattern.to_vec(),
        };
        Self::submit(queue, vec![fill], uses)
    }

    /// 阻塞映射：等待队列中已提交的工作完成后返回。
    pub fn map(&self, queue: &Queue, flags: MapFlags, size: usize, offset: usize) -> Result<Mapping<'_>> {
        if flags.contains(MapFlags::NON_BLOCKING) {
            return Err(validation("non-blocking maps are made with map_pending"));
        }
        self.check_queue(queue)?;
        queue.finish()?;
        self.map_region(flags, size, offset, true)
    }

    /// 非阻塞映射，使用前需要同步。
    pub fn map_pending(
        &self,
        queue: &Queue,
        flags: MapFlags,
        size: usize,
        offset: usize,
    ) -> Result<PendingMapping<'_>> {
        self.check_queue(queue)?;
        self.map_region(flags | MapFlags::NON_BLOCKING, size, offset, false)
            .map(Mapping::pending)
    }

    fn map_region(&self, flags: MapFlags, size: usize, offset: usize, idle: bool) -> Result<Mapping<'_>> {
        self.check_acquired()?;
        let write = flags.writes();
        if !write && !flags.contains(MapFlags::READ) {
            return Err(validation("map flags must request read or write access"));
        }
        if flags.contains(MapFlags::READ) && !self.flags.contains(MemoryFlags::HOST_READ) {
            return Err(validation("resource was not created with HOST_READ"));
        }
        if write && !self.flags.contains(MemoryFlags::HOST_WRITE) {
            return Err(validation("resource was not created with HOST_WRITE"));
        }
        let region = self.region();
        let size = check_range("map", region.len(), size, offset)?;
        let range = offset..offset + size;

        let mut maps = self.maps.lock().unwrap();
        let overlap = |m: &&MapRecord| m.range.start < range.end && range.start < m.range.end;
        if maps.records.iter().filter(overlap).any(|m| write || m.write) {
            return Err(synchronization(format!(
                "map {range:?} conflicts with a live mapping"
            )));
        }
        if idle && maps.device_busy(write) {
            return Err(synchronization("resource is in use by the device"));
        }
        let id = MAP_ID.fetch_add(1, Relaxed);
        maps.records.push(MapRecord { id, range, write });
        Ok(Mapping::new(self, region, offset, size, flags, id))
    }

    /// 非阻塞映射同步后的检查。
    fn check_idle(&self, write: bool) -> Result<()> {
        if self.maps.lock().unwrap().device_busy(write) {
            Err(synchronization("resource is in use by the device"))
        } else {
            Ok(())
        }
    }

    pub fn unmap(&self, queue: &Queue, mapping: Mapping<'_>) -> Result<()> {
        self.check_queue(queue)?;
        if !mapping.belongs_to(self) {
            return Err(synchronization("mapping belongs to another resource"));
        }
        drop(mapping);
        Ok(())
    }

    pub(super) fn forget_map(&self, id: u64) {
        self.maps.lock().unwrap().records.retain(|m| m.id != id)
    }

    pub fn resize(
        &self,
        queue: &Queue,
        new_size: usize,
        copy_old_data: bool,
        copy_host_data: bool,
        new_host: Option<HostMemory>,
    ) -> Result<()> {
        self.check_queue(queue)?;
        if self.interop.is_some() {
            return Err(validation("interop resources cannot be resized"));
        }
        if !self.maps.lock().unwrap().records.is_empty() {
            return Err(synchronization("cannot resize a mapped resource"));
        }
        if new_size == 0 || new_size > queue.device_info().limits.max_alloc {
            return Err(validation(format!("invalid resize to {new_size} bytes")));
        }

        let mut host = self.host.lock().unwrap();
        let source = new_host.clone().or_else(|| host.clone());
        if copy_host_data && !copy_old_data && source.is_none() {
            return Err(validation("no host memory to copy from"));
        }

        let region = Region::new(new_size, queue.stats())?;
        let mut storage = self.storage.write().unwrap();
        if copy_old_data {
            let old = storage.clone();
            let size = old.len().min(new_size);
            queue.submit_commands(vec![Command::Copy {
                src: old,
                src_offset: 0,
                dst: region.clone(),
                dst_offset: 0,
                size,
            }])?;
        } else if let Some(source) = source.filter(|_| copy_host_data) {
            let source = source.lock();
            let n = source.len().min(new_size);
            unsafe { region.write(0, &source[..n]) }
        }
        *storage = region;
        if new_host.is_some() && self.flags.contains(MemoryFlags::USE_HOST_MEMORY) {
            *host = new_host;
        }
        Ok(())
    }

    fn shadow(&self) -> Result<HostMemory> {
        self.host
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| validation("resource does not reference host memory"))
    }

    pub fn read_to_host(&self, queue: &Queue, size: usize, offset: usize) -> Result<()> {
        let shadow = self.shadow()?;
        let mut host = shadow.lock();
        let size = check_range("read", self.size(), size, offset)?;
        check_range("host memory", host.len(), size, offset)?;
        self.read(queue, &mut host[offset..offset + size], size, offset)
            .map(drop)
    }

    pub fn write_from_host(self: &Arc<Self>, queue: &Queue, size: usize, offset: usize) -> Result<()> {
        let shadow = self.shadow()?;
        let host = shadow.lock();
        let size = check_range("write", self.size(), size, offset)?;
        check_range("host memory", host.len(), size, offset)?;
        self.write(queue, &host[offset..offset + size], size, offset)
    }

    pub fn acquire(&self, queue: &Queue) -> Result<()> {
        self.check_queue(queue)?;
        let Some(interop) = &self.interop else {
            return Ok(());
        };
        let mut acquired = interop.acquired.lock().unwrap();
        if *acquired {
            return Err(synchronization(format!(
                "{:?} is already acquired",
                interop.handle
            )));
        }
        *acquired = true;
        log::trace!("acquired {:?}", interop.handle);
        Ok(())
    }

    pub fn release(&self, queue: &Queue) -> Result<()> {
        self.check_queue(queue)?;
        let Some(interop) = &self.interop else {
            return Ok(());
        };
        let mut acquired = interop.acquired.lock().unwrap();
        if !*acquired {
            return Err(synchronization(format!(
                "{:?} is not acquired",
                interop.handle
            )));
        }
        if !self.maps.lock().unwrap().records.is_empty() {
            return Err(synchronization("cannot release a mapped resource"));
        }
        // 交还前等待设备侧使用结束
        queue.finish()?;
        if self.maps.lock().unwrap().device_busy(true) {
            return Err(synchronization(format!(
                "{:?} is in use by another queue",
                interop.handle
            )));
        }
        *acquired = false;
        log::trace!("released {:?}", interop.handle);
        Ok(())
    }
}
