use crate::{
    device::{DeviceId, DeviceInfo, Registry},
    handle::common_cpu::{Config, Cpu},
    memory::{Buffer, DeviceStats, HostMemory, Image, ImageDesc, InteropHandle, MemoryStats},
    queue::Queue,
};
use bytemuck::Pod;
use common::{device_mismatch, validation, MemoryFlags, Result};
use std::sync::Arc;

pub(crate) struct ContextInner {
    registry: Registry,
    pub engine: Arc<Cpu>,
    stats: Vec<Arc<DeviceStats>>,
}

impl ContextInner {
    /// 上下文内的设备号都来自同一注册表。
    #[inline]
    pub fn info(&self, id: DeviceId) -> &DeviceInfo {
        self.registry.info(id)
    }

    #[inline]
    pub fn stats(&self, id: DeviceId) -> &Arc<DeviceStats> {
        &self.stats[id.index()]
    }
}

/// 设备、队列和资源的工厂。
#[derive(Clone)]
pub struct Context(Arc<ContextInner>);

impl Context {
    pub fn new(registry: Registry, config: Config) -> Result<Self> {
        if registry.is_empty() {
            return Err(validation("context needs at least one device"));
        }
        let engine = Arc::new(Cpu::new(&config)?);
        let stats = (0..registry.len()).map(|_| Default::default()).collect();
        for (id, info) in registry.devices() {
            log::debug!("{id:?}: {} ({:?}, {:?})", info.name, info.kind, info.binding);
        }
        Ok(Self(Arc::new(ContextInner {
            registry,
            engine,
            stats,
        })))
    }

    /// 只含宿主 CPU 的上下文，配置取自环境变量。
    pub fn host() -> Result<Self> {
        let config = Config::from_env();
        Self::new(Registry::new([DeviceInfo::host(&config)]), config)
    }

    #[inline]
    pub fn devices(&self) -> impl Iterator<Item = (DeviceId, &DeviceInfo)> + '_ {
        self.0.registry.devices()
    }

    #[inline]
    pub fn device(&self, id: DeviceId) -> Option<&DeviceInfo> {
        self.0.registry.get(id)
    }

    /// 注册表中的第一个设备。
    #[inline]
    pub fn default_device(&self) -> DeviceId {
        self.0.registry.first()
    }

    pub fn create_queue(&self, device: DeviceId) -> Result<Queue> {
        if self.device(device).is_none() {
            return Err(device_mismatch(format!("{device:?} is not in this context")));
        }
        Queue::new(self.0.clone(), device)
    }

    pub fn memory_stats(&self, device: DeviceId) -> MemoryStats {
        match self.device(device) {
            Some(_) => self.0.stats(device).snapshot(),
            None => MemoryStats::default(),
        }
    }

    fn check_queue(&self, queue: &Queue) -> Result<()> {
        if Arc::ptr_eq(queue.context(), &self.0) {
            Ok(())
        } else {
            Err(device_mismatch(format!(
                "queue on {:?} belongs to another context",
                queue.device(),
            )))
        }
    }

    pub fn create_buffer(&self, queue: &Queue, size: usize, flags: MemoryFlags) -> Result<Buffer> {
        self.check_queue(queue)?;
        Buffer::new(queue, size, flags, None, None)
    }

    /// 创建缓冲并复制初始数据。
    pub fn create_buffer_with_data<T: Pod>(
        &self,
        queue: &Queue,
        data: &[T],
        flags: MemoryFlags,
    ) -> Result<Buffer> {
        self.check_queue(queue)?;
        let host = HostMemory::from_slice(data);
        Buffer::new(queue, host.len(), flags, Some(host), None)
    }

    /// 以主机内存为初始内容创建缓冲，带 `USE_HOST_MEMORY` 时保持对主机内存的引用。
    pub fn create_buffer_with_host(
        &self,
        queue: &Queue,
        host: HostMemory,
        flags: MemoryFlags,
    ) -> Result<Buffer> {
        self.check_queue(queue)?;
        Buffer::new(queue, host.len(), flags, Some(host), None)
    }

    /// 包装外部图形 API 的缓冲对象。
    pub fn wrap_buffer(
        &self,
        queue: &Queue,
        handle: InteropHandle,
        size: usize,
        flags: MemoryFlags,
    ) -> Result<Buffer> {
        self.check_queue(queue)?;
        Buffer::new(queue, size, flags, None, Some(handle))
    }

    pub fn create_image(&self, queue: &Queue, desc: ImageDesc, flags: MemoryFlags) -> Result<Image> {
        self.check_queue(queue)?;
        Image::new(queue, desc, flags, None, None)
    }

    pub fn create_image_with_data<T: Pod>(
        &self,
        queue: &Queue,
        desc: ImageDesc,
        data: &[T],
        flags: MemoryFlags,
    ) -> Result<Image> {
        self.check_queue(queue)?;
        let size = desc.check(&queue.device_info().limits)?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() != size {
            return Err(validation(format!(
                "{} bytes given for an image of {size} bytes",
                bytes.len(),
            )));
        }
        Image::new(queue, desc, flags, Some(HostMemory::new(bytes.to_vec())), None)
    }

    pub fn wrap_image(
        &self,
        queue: &Queue,
        handle: InteropHandle,
        desc: ImageDesc,
        flags: MemoryFlags,
    ) -> Result<Image> {
        self.check_queue(queue)?;
        Image::new(queue, desc, flags, None, Some(handle))
    }
}
