use super::{HostMemory, InteropHandle, Mapping, Memory, PendingMapping};
use crate::{device::DeviceId, device::Limits, queue::Queue};
use bytemuck::Pod;
use common::{validation, Dim3, MapFlags, MemoryFlags, Result};
use digit_layout::{types as ty, DigitLayout};
use half::f16;
use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc, Mutex,
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ImageDim {
    D1(u32),
    D2(u32, u32),
    D3(u32, u32, u32),
}

impl ImageDim {
    #[inline]
    pub const fn rank(&self) -> usize {
        match self {
            Self::D1(..) => 1,
            Self::D2(..) => 2,
            Self::D3(..) => 3,
        }
    }

    #[inline]
    pub const fn extent(&self) -> Dim3 {
        match *self {
            Self::D1(w) => Dim3::new(w, 1, 1),
            Self::D2(w, h) => Dim3::new(w, h, 1),
            Self::D3(w, h, d) => Dim3::new(w, h, d),
        }
    }
}

/// 纹素格式：1 到 4 个同类型通道。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ImageFormat {
    pub channels: u8,
    pub ty: DigitLayout,
}

impl ImageFormat {
    #[inline]
    pub const fn new(channels: u8, ty: DigitLayout) -> Self {
        Self { channels, ty }
    }

    pub fn channel_size(&self) -> Option<usize> {
        match self.ty {
            ty::U8 => Some(1),
            ty::F16 => Some(2),
            ty::F32 => Some(4),
            _ => None,
        }
    }

    pub fn texel_size(&self) -> Option<usize> {
        if (1..=4).contains(&self.channels) {
            self.channel_size().map(|s| s * self.channels as usize)
        } else {
            None
        }
    }

    /// 把纹素解码为归一化的 RGBA，缺失的通道补 `(0, 0, 0, 1)`。
    pub(crate) fn decode(&self, src: &[u8]) -> [f32; 4] {
        let mut ans = [0., 0., 0., 1.];
        for (c, x) in ans.iter_mut().take(self.channels as _).enumerate() {
            *x = match self.ty {
                ty::U8 => src[c] as f32 / 255.,
                ty::F16 => f16::from_ne_bytes([src[2 * c], src[2 * c + 1]]).to_f32(),
                ty::F32 => f32::from_ne_bytes([
                    src[4 * c],
                    src[4 * c + 1],
                    src[4 * c + 2],
                    src[4 * c + 3],
                ]),
                _ => unreachable!(),
            }
        }
        ans
    }

    pub(crate) fn encode(&self, texel: [f32; 4], dst: &mut [u8]) {
        for (c, x) in texel.into_iter().take(self.channels as _).enumerate() {
            match self.ty {
                ty::U8 => dst[c] = (x.clamp(0., 1.) * 255.).round() as u8,
                ty::F16 => dst[2 * c..][..2].copy_from_slice(&f16::from_f32(x).to_ne_bytes()),
                ty::F32 => dst[4 * c..][..4].copy_from_slice(&x.to_ne_bytes()),
                _ => unreachable!(),
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ImageDesc {
    pub dim: ImageDim,
    pub layers: u32,
    pub format: ImageFormat,
}

impl ImageDesc {
    #[inline]
    pub const fn new(dim: ImageDim, format: ImageFormat) -> Self {
        Self {
            dim,
            layers: 1,
            format,
        }
    }

    #[inline]
    pub const fn with_layers(self, layers: u32) -> Self {
        Self { layers, ..self }
    }

    #[inline]
    pub const fn extent(&self) -> Dim3 {
        self.dim.extent()
    }

    /// 纹素在存储中的字节偏移，越界时返回 `None`。
    pub fn offset_of(&self, coord: Dim3, layer: u32) -> Option<usize> {
        let e = self.extent();
        if coord.x >= e.x || coord.y >= e.y || coord.z >= e.z || layer >= self.layers {
            return None;
        }
        let i = ((layer as u64 * e.z as u64 + coord.z as u64) * e.y as u64 + coord.y as u64)
            * e.x as u64
            + coord.x as u64;
        self.format.texel_size().map(|s| i as usize * s)
    }

    /// 检查描述符并返回存储大小。
    pub(crate) fn check(&self, limits: &Limits) -> Result<usize> {
        let texel = self.format.texel_size().ok_or_else(|| {
            validation(format!("unsupported image format {:?}", self.format))
        })?;
        let max = limits.max_image_dim[self.dim.rank() - 1];
        let extent = self.extent();
        if extent.to_array().iter().any(|&n| n == 0 || n > max) {
            return Err(validation(format!(
                "image extent {extent} out of [1, {max}]"
            )));
        }
        if self.layers == 0 || self.layers > limits.max_image_layers {
            return Err(validation(format!(
                "image layer count {} out of [1, {}]",
                self.layers, limits.max_image_layers,
            )));
        }
        Ok(extent.product() as usize * self.layers as usize * texel)
    }
}

/// 图像当前允许的访问方式，由屏障转换。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ImageLayout {
    Undefined,
    /// 只读采样。
    Sampled,
    /// 可读写的存储图像。
    Storage,
}

pub(crate) struct ImageCore {
    pub memory: Arc<Memory>,
    pub desc: ImageDesc,
    layout: Mutex<ImageLayout>,
    transitions: AtomicU64,
}

impl ImageCore {
    /// 记录期的布局跟踪，需要屏障时返回 `(from, to)`。
    pub fn transition(&self, write: bool) -> Option<(ImageLayout, ImageLayout)> {
        let target = if write {
            ImageLayout::Storage
        } else {
            ImageLayout::Sampled
        };
        let mut layout = self.layout.lock().unwrap();
        if *layout == target {
            None
        } else {
            Some((std::mem::replace(&mut *layout, target), target))
        }
    }

    /// 撤销未能提交的转换。之后已有别的转换时保持不变。
    pub fn restore(&self, from: ImageLayout, to: ImageLayout) {
        let mut layout = self.layout.lock().unwrap();
        if *layout == to {
            *layout = from
        }
    }

    /// 屏障在设备上执行。
    #[inline]
    pub fn barrier_executed(&self) {
        self.transitions.fetch_add(1, Relaxed);
    }
}

/// 带格式的多维设备存储，最后一个引用释放时销毁。
#[derive(Clone)]
pub struct Image(pub(crate) Arc<ImageCore>);

impl Image {
    pub(crate) fn new(
        queue: &Queue,
        desc: ImageDesc,
        flags: MemoryFlags,
        host: Option<HostMemory>,
        interop: Option<InteropHandle>,
    ) -> Result<Self> {
        let info = queue.device_info();
        if !info.features.images {
            return Err(validation(format!("{} does not support images", info.name)));
        }
        let size = desc.check(&info.limits)?;
        Ok(Self(Arc::new(ImageCore {
            memory: Arc::new(Memory::new(queue, size, flags, host, interop)?),
            desc,
            layout: Mutex::new(ImageLayout::Undefined),
            transitions: AtomicU64::new(0),
        })))
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.0.memory.device()
    }

    #[inline]
    pub fn desc(&self) -> &ImageDesc {
        &self.0.desc
    }

    #[inline]
    pub fn flags(&self) -> MemoryFlags {
        self.0.memory.flags()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.0.memory.size()
    }

    #[inline]
    pub fn layout(&self) -> ImageLayout {
        *self.0.layout.lock().unwrap()
    }

    /// 已在设备上执行的布局转换次数。
    #[inline]
    pub fn transitions(&self) -> u64 {
        self.0.transitions.load(Relaxed)
    }

    #[inline]
    pub fn interop_handle(&self) -> Option<InteropHandle> {
        self.0.memory.interop_handle()
    }

    #[inline]
    pub fn read(&self, queue: &Queue, dst: &mut [u8]) -> Result<()> {
        self.0.memory.read(queue, dst, 0, 0).map(drop)
    }

    #[inline]
    pub fn read_as<T: Pod>(&self, queue: &Queue) -> Result<Vec<T>> {
        self.0.memory.read_as(queue)
    }

    #[inline]
    pub fn write(&self, queue: &Queue, src: &[u8]) -> Result<()> {
        self.0.memory.write(queue, src, 0, 0)
    }

    #[inline]
    pub fn write_from<T: Pod>(&self, queue: &Queue, src: &[T]) -> Result<()> {
        self.write(queue, bytemuck::cast_slice(src))
    }

    pub fn copy(&self, queue: &Queue, src: &Image) -> Result<()> {
        if src.desc() != self.desc() {
            return Err(validation(format!(
                "cannot copy {:?} into {:?}",
                src.desc(),
                self.desc(),
            )));
        }
        self.0.memory.copy(queue, &src.0.memory, 0, 0, 0)
    }

    /// 以同一个纹素填充整个图像。
    pub fn fill(&self, queue: &Queue, texel: [f32; 4]) -> Result<()> {
        let format = self.desc().format;
        let mut pattern = vec![0u8; format.texel_size().unwrap_or(0)];
        format.encode(texel, &mut pattern);
        self.0.memory.fill(queue, &pattern, 0, 0)
    }

    #[inline]
    pub fn zero(&self, queue: &Queue) -> Result<()> {
        self.0.memory.fill(queue, &[0], 0, 0)
    }

    #[inline]
    pub fn map(&self, queue: &Queue, flags: MapFlags) -> Result<Mapping<'_>> {
        self.0.memory.map(queue, flags, 0, 0)
    }

    #[inline]
    pub fn map_pending(&self, queue: &Queue, flags: MapFlags) -> Result<PendingMapping<'_>> {
        self.0.memory.map_pending(queue, flags, 0, 0)
    }

    #[inline]
    pub fn unmap(&self, queue: &Queue, mapping: Mapping<'_>) -> Result<()> {
        self.0.memory.unmap(queue, mapping)
    }

    #[inline]
    pub fn acquire_interop(&self, queue: &Queue) -> Result<()> {
        self.0.memory.acquire(queue)
    }

    #[inline]
    pub fn release_interop(&self, queue: &Queue) -> Result<()> {
        self.0.memory.release(queue)
    }
}
