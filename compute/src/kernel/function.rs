use crate::memory::ImageDesc;
use bytemuck::Pod;
use common::Dim3;
use std::{fmt, sync::Arc};

/// 工作项在一次分发中的位置。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WorkItem {
    pub global_id: Dim3,
    pub local_id: Dim3,
    pub group_id: Dim3,
    pub global_size: Dim3,
    pub local_size: Dim3,
    pub group_count: Dim3,
}

impl WorkItem {
    /// x 最快变化的全局线性序号。
    #[inline]
    pub fn linear_id(&self) -> usize {
        let Dim3 { x, y, z } = self.global_id;
        let size = self.global_size;
        ((z as usize * size.y.max(1) as usize) + y as usize) * size.x.max(1) as usize + x as usize
    }
}

pub type KernelFn = dyn Fn(&WorkItem, &Args) + Send + Sync;

/// 宿主端编译产物：对每个工作项调用一次的函数。
#[derive(Clone)]
pub struct HostFunction(Arc<KernelFn>);

impl HostFunction {
    #[inline]
    pub fn new(f: impl Fn(&WorkItem, &Args) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    #[inline]
    pub(crate) fn call(&self, item: &WorkItem, args: &Args) {
        (self.0)(item, args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HostFunction({:p})", Arc::as_ptr(&self.0))
    }
}

/// 内核看到的一段设备存储。
#[derive(Clone, Copy, Debug)]
pub struct BufferView {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for BufferView {}
unsafe impl Sync for BufferView {}

impl BufferView {
    #[inline]
    pub(crate) const fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 能容纳的 `T` 个数。
    #[inline]
    pub const fn count<T>(&self) -> usize {
        self.len / size_of::<T>()
    }

    #[inline]
    fn at<T>(&self, index: usize) -> *mut T {
        assert!(
            index < self.count::<T>(),
            "index {index} out of bounds for {} bytes",
            self.len,
        );
        unsafe { self.ptr.cast::<T>().add(index) }
    }

    /// # Safety
    ///
    /// 不得与其他工作项对同一位置的写入并发。
    #[inline]
    pub unsafe fn read<T: Pod>(&self, index: usize) -> T {
        self.at::<T>(index).read_unaligned()
    }

    /// # Safety
    ///
    /// 不得与其他工作项对同一位置的访问并发。
    #[inline]
    pub unsafe fn write<T: Pod>(&self, index: usize, value: T) {
        self.at::<T>(index).write_unaligned(value)
    }
}

/// 图像的一个视图。
#[derive(Clone, Copy, Debug)]
pub struct ImageView {
    ptr: *mut u8,
    desc: ImageDesc,
}

unsafe impl Send for ImageView {}
unsafe impl Sync for ImageView {}

impl ImageView {
    #[inline]
    pub(crate) const fn new(ptr: *mut u8, desc: ImageDesc) -> Self {
        Self { ptr, desc }
    }

    #[cfg(test)]
    pub(crate) fn same(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }

    fn texel(&self, coord: Dim3, layer: u32) -> *mut u8 {
        let Some(offset) = self.desc.offset_of(coord, layer) else {
            panic!("texel {coord}[{layer}] out of bounds of {:?}", self.desc)
        };
        unsafe { self.ptr.add(offset) }
    }
}

/// 内核看到的图像参数，按声明的访问方向提供读视图和写视图。
#[derive(Clone, Copy, Debug)]
pub struct ImageArg {
    pub(crate) read: Option<ImageView>,
    pub(crate) write: Option<ImageView>,
}

impl ImageArg {
    pub fn desc(&self) -> &ImageDesc {
        match (&self.read, &self.write) {
            (Some(v), _) | (None, Some(v)) => &v.desc,
            (None, None) => unreachable!(),
        }
    }

    #[inline]
    pub fn readable(&self) -> bool {
        self.read.is_some()
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.write.is_some()
    }

    /// 读取归一化的 RGBA 纹素。
    ///
    /// # Safety
    ///
    /// 不得与其他工作项对同一纹素的写入并发。
    pub unsafe fn read(&self, coord: Dim3, layer: u32) -> [f32; 4] {
        let Some(view) = &self.read else {
            panic!("image is not bound for reading")
        };
        let size = view.desc.format.texel_size().unwrap_or(0);
        let src = std::slice::from_raw_parts(view.texel(coord, layer), size);
        view.desc.format.decode(src)
    }

    /// # Safety
    ///
    /// 不得与其他工作项对同一纹素的访问并发。
    pub unsafe fn write(&self, coord: Dim3, layer: u32, texel: [f32; 4]) {
        let Some(view) = &self.write else {
            panic!("image is not bound for writing")
        };
        let size = view.desc.format.texel_size().unwrap_or(0);
        let dst = std::slice::from_raw_parts_mut(view.texel(coord, layer), size);
        view.desc.format.encode(texel, dst)
    }
}

pub(crate) enum ArgValue {
    Pod(BufferView),
    Buffer(BufferView),
    Image(ImageArg),
    Images(Vec<ImageArg>),
    StageInput(BufferView),
}

/// 一个阶段的全部参数，下标与该阶段签名中的槽一致。
pub struct Args {
    values: Vec<ArgValue>,
    outputs: Vec<BufferView>,
}

impl Args {
    #[inline]
    pub(crate) fn new(values: Vec<ArgValue>, outputs: Vec<BufferView>) -> Self {
        Self { values, outputs }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn pod<T: Pod>(&self, i: usize) -> T {
        match &self.values[i] {
            ArgValue::Pod(v) if v.len == size_of::<T>() => {
                bytemuck::pod_read_unaligned(unsafe { std::slice::from_raw_parts(v.ptr, v.len) })
            }
            _ => panic!("argument {i} is not a {}-byte value", size_of::<T>()),
        }
    }

    pub fn buffer(&self, i: usize) -> &BufferView {
        match &self.values[i] {
            ArgValue::Buffer(v) => v,
            _ => panic!("argument {i} is not a buffer"),
        }
    }

    pub fn image(&self, i: usize) -> &ImageArg {
        match &self.values[i] {
            ArgValue::Image(v) => v,
            _ => panic!("argument {i} is not an image"),
        }
    }

    pub fn images(&self, i: usize) -> &[ImageArg] {
        match &self.values[i] {
            ArgValue::Images(v) => v,
            _ => panic!("argument {i} is not an image array"),
        }
    }

    /// 前一阶段写入的数据。
    pub fn stage_input(&self, i: usize) -> &BufferView {
        match &self.values[i] {
            ArgValue::StageInput(v) => v,
            _ => panic!("argument {i} is not a stage input"),
        }
    }

    /// 本阶段的输出，对应下一阶段第 `j` 个阶段输入。
    pub fn stage_output(&self, j: usize) -> &BufferView {
        &self.outputs[j]
    }
}
