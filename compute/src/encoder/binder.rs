use super::{ArgSink, Encoder, EncoderState};
use crate::{
    device::{DeviceId, DeviceInfo},
    kernel::{Access, Arg, ArgKind, BufferView, ImageArg, ImageView, KernelEntry},
    memory::{DeviceUse, Image, Memory},
    queue::Command,
    record::BindStep,
};
use common::{device_mismatch, synchronization, validation, Dim3, MemoryFlags, Result};
use std::sync::Arc;

/// 校验阶段得出的存储需求。
#[derive(Default)]
pub(crate) struct Plan {
    /// 扁平参数区的字节数。
    pub param_bytes: usize,
    /// 按常量对齐累加的值参数字节数。
    pub uniform_bytes: usize,
    /// 参数引用的资源，随分发完成释放。
    pub uses: Vec<DeviceUse>,
}

/// 不需要特化变体的设备在分发时检查工作组尺寸。
pub(crate) fn check_local_size(info: &DeviceInfo, block: Dim3) -> Result<()> {
    let limits = &info.limits;
    let max = limits.max_local_size;
    if block.x > max.x
        || block.y > max.y
        || block.z > max.z
        || block.product() > limits.max_total_local_size as u64
    {
        Err(validation(format!(
            "work-group {block} exceeds {max} / {} on {}",
            limits.max_total_local_size, info.name,
        )))
    } else {
        Ok(())
    }
}

/// 在写入任何绑定之前检查全部参数。
pub(crate) fn validate(
    entry: &KernelEntry,
    info: &DeviceInfo,
    device: DeviceId,
    args: &[Arg],
) -> Result<Plan> {
    let expected = entry.arg_count();
    if args.len() != expected {
        return Err(validation(format!(
            "{} expects {expected} arguments, got {}",
            entry.name(),
            args.len(),
        )));
    }

    let align = info.limits.uniform_alignment.max(1);
    let mut plan = Plan::default();
    let mut args = args.iter();
    for (i, stage) in entry.stages().iter().enumerate() {
        for (j, slot) in stage.signature.slots().iter().enumerate() {
            let at = || format!("{} stage {i} slot {j}", entry.name());
            if slot.is_stage_input() {
                plan.param_bytes += size_of::<BufferView>();
                continue;
            }
            let Some(arg) = args.next() else {
                return Err(validation(format!("{}: missing argument", at())));
            };
            match (slot.kind, *arg) {
                (ArgKind::Pod { size }, Arg::Pod(bytes)) => {
                    if bytes.len() != size {
                        return Err(validation(format!(
                            "{}: {} bytes given, {size} declared",
                            at(),
                            bytes.len(),
                        )));
                    }
                    plan.param_bytes += size;
                    plan.uniform_bytes += size.next_multiple_of(align);
                }
                (ArgKind::Buffer, Arg::Buffer(buffer)) => {
                    let claim = check_memory(&buffer.0, slot.access, device, &at)?;
                    plan.uses.push(claim);
                    plan.param_bytes += size_of::<BufferView>();
                }
                (ArgKind::Image, Arg::Image(image, access)) => {
                    let claim = check_image(image, slot.access, access, info, device, &at)?;
                    plan.uses.push(claim);
                    plan.param_bytes += size_of::<ImageArg>();
                }
                (ArgKind::ImageArray { len }, Arg::ImageArray(images, access)) => {
                    if images.len() != len {
                        return Err(validation(format!(
                            "{}: {} images given, {len} declared",
                            at(),
                            images.len(),
                        )));
                    }
                    for image in images {
                        let claim = check_image(image, slot.access, access, info, device, &at)?;
                        plan.uses.push(claim);
                    }
                    plan.param_bytes += len * size_of::<ImageArg>();
                }
                (kind, arg) => {
                    return Err(validation(format!(
                        "{}: {} given, {kind:?} declared",
                        at(),
                        arg.describe(),
                    )))
                }
            }
        }
    }
    Ok(plan)
}

/// 检查资源能否以 `access` 绑定，并登记这次设备侧使用。
fn check_memory(
    memory: &Arc<Memory>,
    access: Access,
    device: DeviceId,
    at: &dyn Fn() -> String,
) -> Result<DeviceUse> {
    if memory.device() != device {
        return Err(device_mismatch(format!(
            "{}: resource lives on {:?}, dispatch targets {device:?}",
            at(),
            memory.device(),
        )));
    }
    let flags = memory.flags().device_access();
    if access.reads() && !flags.contains(MemoryFlags::READ) {
        return Err(validation(format!("{}: resource is not device-readable", at())));
    }
    if access.writes() && !flags.contains(MemoryFlags::WRITE) {
        return Err(validation(format!("{}: resource is not device-writable", at())));
    }
    memory
        .claim(access.writes())
        .map_err(|e| synchronization(format!("{}: {}", at(), e.info)))
}

fn check_image(
    image: &Image,
    declared: Access,
    given: Access,
    info: &DeviceInfo,
    device: DeviceId,
    at: &dyn Fn() -> String,
) -> Result<DeviceUse> {
    if declared != given {
        return Err(validation(format!(
            "{}: image bound as {given:?}, declared {declared:?}",
            at(),
        )));
    }
    if !info.features.images {
        return Err(validation(format!("{}: {} has no image support", at(), info.name)));
    }
    check_memory(&image.0.memory, given, device, at)
}

/// 按签名顺序遍历所有阶段写入绑定，阶段输入槽不消耗调用方参数。
///
/// 参数已经过 [`validate`]。
pub(super) fn bind<S: ArgSink>(enc: &mut Encoder<S>, args: &[Arg]) {
    let entry = enc.entry;
    let mut args = args.iter();
    for (i, stage) in entry.stages().iter().enumerate() {
        let mut link = 0;
        for (j, slot) in stage.signature.slots().iter().enumerate() {
            let at = entry.flat(i, j);
            if slot.is_stage_input() {
                let view = {
                    let region = &enc.links[i][link];
                    region.view(0, region.len())
                };
                link += 1;
                enc.sink.stage_input(at, view);
                continue;
            }
            let Some(arg) = args.next() else {
                break;
            };
            match *arg {
                Arg::Pod(bytes) => enc.sink.pod(at, bytes),
                Arg::Buffer(buffer) => {
                    let region = buffer.0.region();
                    let view = region.view(0, region.len());
                    enc.retained.regions.push(region);
                    enc.sink.buffer(at, view)
                }
                Arg::Image(image, access) => {
                    let image = enc.image(image, access);
                    enc.sink.image(at, image)
                }
                Arg::ImageArray(images, access) => {
                    let images = images.iter().map(|it| enc.image(it, access)).collect();
                    enc.sink.images(at, images)
                }
            }
            if enc.state == EncoderState::Created {
                enc.advance(EncoderState::Recording)
            }
            enc.record(BindStep::Slot(at));
        }
    }
}

impl<S: ArgSink> Encoder<'_, S> {
    /// 先按访问方向记录布局转换，再给出视图。提交失败时转换被撤销。
    fn image(&mut self, image: &Image, access: Access) -> ImageArg {
        let core = &image.0;
        if let Some((from, to)) = core.transition(access.writes()) {
            log::trace!("{}: image {from:?} -> {to:?}", self.entry.name());
            self.layouts.push((core.clone(), from, to));
            self.commands.push(Command::Transition {
                image: core.clone(),
                from,
                to,
            });
        }
        let region = core.memory.region();
        let view = ImageView::new(region.as_ptr(), core.desc);
        self.retained.regions.push(region);
        ImageArg {
            read: access.reads().then_some(view),
            write: access.writes().then_some(view),
        }
    }
}
