use super::{ArgSink, Bindings, Plan};
use crate::{
    kernel::{Access, ArgKind, ArgValue, BufferView, ImageArg, ImageView, Slot},
    memory::Region,
    queue::Queue,
};
use common::Result;
use std::{ops::Range, sync::Arc};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    StageLink,
}

pub(crate) struct DescriptorWrite {
    pub binding: u32,
    pub ty: DescriptorType,
    buffer: Option<BufferView>,
    images: Vec<ImageView>,
}

/// 一次分发的描述符集合。
pub(crate) struct DescriptorSet {
    writes: Vec<DescriptorWrite>,
    slots: Vec<Range<usize>>,
    constants: Option<Arc<Region>>,
}

pub(super) struct DescriptorTable {
    set: DescriptorSet,
    combined: bool,
    cursor: usize,
    align: usize,
}

impl DescriptorTable {
    /// 一次分发的所有值参数共用一块常量缓冲。
    pub fn new(queue: &Queue, plan: &Plan, slots: usize, combined: bool) -> Result<Self> {
        let constants = if plan.uniform_bytes > 0 {
            Some(Region::new(plan.uniform_bytes, queue.stats())?)
        } else {
            None
        };
        Ok(Self {
            set: DescriptorSet {
                writes: Vec::new(),
                slots: vec![0..0; slots],
                constants,
            },
            combined,
            cursor: 0,
            align: queue.device_info().limits.uniform_alignment.max(1),
        })
    }

    fn push(&mut self, at: usize, ty: DescriptorType, buffer: Option<BufferView>, images: Vec<ImageView>) {
        let binding = self.set.writes.len();
        let range = &mut self.set.slots[at];
        if range.is_empty() {
            *range = binding..binding;
        }
        range.end = binding + 1;
        self.set.writes.push(DescriptorWrite {
            binding: binding as _,
            ty,
            buffer,
            images,
        })
    }

    /// 读写图像在不支持合并对象时拆成写视图和读视图两个绑定。
    fn push_images(&mut self, at: usize, images: &[ImageArg]) {
        let write = images.iter().filter_map(|i| i.write).collect::<Vec<_>>();
        let read = images.iter().filter_map(|i| i.read).collect::<Vec<_>>();
        match (read.is_empty(), write.is_empty()) {
            (false, true) => self.push(at, DescriptorType::SampledImage, None, read),
            (true, false) => self.push(at, DescriptorType::StorageImage, None, write),
            (false, false) if self.combined => {
                self.push(at, DescriptorType::StorageImage, None, write)
            }
            (false, false) => {
                self.push(at, DescriptorType::StorageImage, None, write);
                self.push(at, DescriptorType::SampledImage, None, read)
            }
            (true, true) => unreachable!(),
        }
    }
}

impl ArgSink for DescriptorTable {
    fn pod(&mut self, at: usize, bytes: &[u8]) {
        let Some(constants) = &self.set.constants else {
            unreachable!("constant buffer was sized during validation")
        };
        unsafe { constants.write(self.cursor, bytes) };
        let view = constants.view(self.cursor, bytes.len());
        self.cursor += bytes.len().next_multiple_of(self.align);
        self.push(at, DescriptorType::UniformBuffer, Some(view), vec![])
    }

    fn buffer(&mut self, at: usize, view: BufferView) {
        self.push(at, DescriptorType::StorageBuffer, Some(view), vec![])
    }

    fn image(&mut self, at: usize, image: ImageArg) {
        self.push_images(at, &[image])
    }

    fn images(&mut self, at: usize, images: Vec<ImageArg>) {
        self.push_images(at, &images)
    }

    fn stage_input(&mut self, at: usize, view: BufferView) {
        self.push(at, DescriptorType::StageLink, Some(view), vec![])
    }

    fn finish(self) -> Bindings {
        Bindings::Table(self.set)
    }
}

impl DescriptorSet {
    #[inline]
    pub fn writes(&self) -> &[DescriptorWrite] {
        &self.writes
    }

    /// 槽对应的绑定。
    #[inline]
    pub fn bindings_of(&self, at: usize) -> &[DescriptorWrite] {
        &self.writes[self.slots[at].clone()]
    }

    pub fn decode(&self, at: usize, slot: &Slot) -> ArgValue {
        let writes = self.bindings_of(at);
        let buffer = || writes[0].buffer.unwrap_or_else(|| unreachable!());
        match slot.kind {
            ArgKind::Pod { .. } => ArgValue::Pod(buffer()),
            ArgKind::Buffer => ArgValue::Buffer(buffer()),
            ArgKind::StageInput { .. } => ArgValue::StageInput(buffer()),
            ArgKind::Image => ArgValue::Image(image_arg(writes, slot.access, 0)),
            ArgKind::ImageArray { len } => {
                ArgValue::Images((0..len).map(|i| image_arg(writes, slot.access, i)).collect())
            }
        }
    }
}

fn image_arg(writes: &[DescriptorWrite], access: Access, i: usize) -> ImageArg {
    let view = |w: &DescriptorWrite| w.images[i];
    match (writes, access) {
        ([w], Access::Read) => ImageArg {
            read: Some(view(w)),
            write: None,
        },
        ([w], Access::Write) => ImageArg {
            read: None,
            write: Some(view(w)),
        },
        // 合并的读写对象
        ([w], Access::ReadWrite) => ImageArg {
            read: Some(view(w)),
            write: Some(view(w)),
        },
        ([w, r], _) => ImageArg {
            read: Some(view(r)),
            write: Some(view(w)),
        },
        _ => unreachable!(),
    }
}
