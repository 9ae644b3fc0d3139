use super::{ArgSink, Bindings};
use crate::kernel::{ArgValue, BufferView, ImageArg};

#[derive(Clone, Default, Debug)]
pub(crate) enum StagedValue {
    #[default]
    Unset,
    Pod(Vec<u8>),
    Buffer(BufferView),
    Image(ImageArg),
    Images(Vec<ImageArg>),
    Link(BufferView),
}

/// 内核持有的暂存参数表，跨分发复用。
///
/// 逐槽改写，只能在内核的绑定互斥区内访问。
#[derive(Default, Debug)]
pub(crate) struct ArgStage {
    slots: Vec<StagedValue>,
}

pub(super) struct Staged<'a> {
    stage: &'a mut ArgStage,
}

impl<'a> Staged<'a> {
    pub fn new(stage: &'a mut ArgStage, slots: usize) -> Self {
        stage.slots.resize(slots, StagedValue::Unset);
        Self { stage }
    }
}

impl ArgSink for Staged<'_> {
    fn pod(&mut self, at: usize, bytes: &[u8]) {
        match &mut self.stage.slots[at] {
            // 复用上次的值存储
            StagedValue::Pod(value) => {
                value.clear();
                value.extend_from_slice(bytes)
            }
            slot => *slot = StagedValue::Pod(bytes.to_vec()),
        }
    }

    fn buffer(&mut self, at: usize, view: BufferView) {
        self.stage.slots[at] = StagedValue::Buffer(view)
    }

    fn image(&mut self, at: usize, image: ImageArg) {
        self.stage.slots[at] = StagedValue::Image(image)
    }

    fn images(&mut self, at: usize, images: Vec<ImageArg>) {
        self.stage.slots[at] = StagedValue::Images(images)
    }

    fn stage_input(&mut self, at: usize, view: BufferView) {
        self.stage.slots[at] = StagedValue::Link(view)
    }

    /// 取快照后清除句柄，暂存表不延长资源的生命周期。
    fn finish(self) -> Bindings {
        let snapshot = self.stage.slots.clone();
        for slot in &mut self.stage.slots {
            if !matches!(slot, StagedValue::Pod(_)) {
                *slot = StagedValue::Unset
            }
        }
        Bindings::Staged(StagedArgs(snapshot))
    }
}

/// 提交时的暂存表快照。
pub(crate) struct StagedArgs(Vec<StagedValue>);

impl StagedArgs {
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn decode(&self, at: usize) -> ArgValue {
        match &self.0[at] {
            StagedValue::Unset => unreachable!("slot {at} was never staged"),
            StagedValue::Pod(bytes) => {
                ArgValue::Pod(BufferView::new(bytes.as_ptr().cast_mut(), bytes.len()))
            }
            StagedValue::Buffer(view) => ArgValue::Buffer(*view),
            StagedValue::Image(image) => ArgValue::Image(*image),
            StagedValue::Images(images) => ArgValue::Images(images.clone()),
            StagedValue::Link(view) => ArgValue::StageInput(*view),
        }
    }
}
