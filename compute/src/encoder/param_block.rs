use super::{ArgSink, Bindings, Plan};
use crate::kernel::{ArgKind, ArgValue, BufferView, ImageArg, Slot};
use std::ops::Range;

/// 扁平参数区：值参数按字节复制，缓冲和图像句柄按值写入。
pub(crate) struct Params {
    data: Box<[u8]>,
    params: Vec<Range<usize>>,
}

pub(super) struct ParamBlock {
    params: Params,
    cursor: usize,
}

impl ParamBlock {
    /// 参数区大小在校验时已确定。
    pub fn new(plan: &Plan, slots: usize) -> Self {
        Self {
            params: Params {
                data: vec![0; plan.param_bytes].into_boxed_slice(),
                params: vec![0..0; slots],
            },
            cursor: 0,
        }
    }

    fn push(&mut self, at: usize, bytes: &[u8]) {
        let range = self.cursor..self.cursor + bytes.len();
        self.params.data[range.clone()].copy_from_slice(bytes);
        self.params.params[at] = range;
        self.cursor += bytes.len();
    }

    /// 句柄按值写入，只会以同一类型读回。
    fn push_value<T: Copy>(&mut self, at: usize, value: &[T]) {
        let range = self.cursor..self.cursor + size_of_val(value);
        assert!(range.end <= self.params.data.len());
        let dst = unsafe { self.params.data.as_mut_ptr().add(range.start).cast::<T>() };
        for (i, v) in value.iter().enumerate() {
            unsafe { dst.add(i).write_unaligned(*v) }
        }
        self.params.params[at] = range;
        self.cursor += size_of_val(value);
    }
}

impl ArgSink for ParamBlock {
    fn pod(&mut self, at: usize, bytes: &[u8]) {
        self.push(at, bytes)
    }

    fn buffer(&mut self, at: usize, view: BufferView) {
        self.push_value(at, &[view])
    }

    fn image(&mut self, at: usize, image: ImageArg) {
        self.push_value(at, &[image])
    }

    fn images(&mut self, at: usize, images: Vec<ImageArg>) {
        self.push_value(at, &images)
    }

    fn stage_input(&mut self, at: usize, view: BufferView) {
        self.push_value(at, &[view])
    }

    fn finish(self) -> Bindings {
        debug_assert_eq!(self.cursor, self.params.data.len());
        Bindings::Params(self.params)
    }
}

impl Params {
    /// 参数区的大小。
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn read<T: Copy>(&self, range: &Range<usize>, i: usize) -> T {
        let offset = range.start + i * size_of::<T>();
        debug_assert!(offset + size_of::<T>() <= range.end);
        unsafe { self.data.as_ptr().add(offset).cast::<T>().read_unaligned() }
    }

    pub fn decode(&self, at: usize, slot: &Slot) -> ArgValue {
        let range = &self.params[at];
        match slot.kind {
            ArgKind::Pod { .. } => ArgValue::Pod(BufferView::new(
                unsafe { self.data.as_ptr().add(range.start).cast_mut() },
                range.len(),
            )),
            ArgKind::Buffer => ArgValue::Buffer(self.read(range, 0)),
            ArgKind::Image => ArgValue::Image(self.read(range, 0)),
            ArgKind::ImageArray { len } => {
                ArgValue::Images((0..len).map(|i| self.read(range, i)).collect())
            }
            ArgKind::StageInput { .. } => ArgValue::StageInput(self.read(range, 0)),
        }
    }
}
