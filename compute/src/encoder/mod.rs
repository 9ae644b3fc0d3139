mod binder;
mod descriptor;
mod param_block;
mod staged;

pub(crate) use binder::{check_local_size, validate, Plan};
pub(crate) use staged::ArgStage;

use crate::{
    kernel::{Arg, ArgKind, Args, BufferView, HostFunction, ImageArg, KernelEntry, Variant},
    memory::{DeviceUse, ImageCore, ImageLayout, Region},
    queue::{Command, Queue, Submission},
    record::{is_recording, next_dispatch_id, BindEvent, BindStep},
};
use common::{submission, validation, Launch3, Result};
use descriptor::{DescriptorSet, DescriptorTable};
use param_block::{ParamBlock, Params};
use staged::{Staged, StagedArgs};
use std::sync::{Arc, Condvar, Mutex};

/// 设备绑定参数的方式。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BindingModel {
    /// 所有参数打包进一块扁平参数区，句柄按值存放。
    ParamBlock,
    /// 每个内核持有一份可变的暂存参数表，逐槽设置。
    Staged,
    /// 描述符表：值参数放入常量缓冲，图像需要布局转换和特化变体。
    DescriptorTable { combined_rw_images: bool },
}

impl BindingModel {
    /// 读写图像占用的绑定槽数。
    #[inline]
    pub const fn rw_image_slots(self) -> usize {
        match self {
            Self::DescriptorTable {
                combined_rw_images: false,
            } => 2,
            _ => 1,
        }
    }

    /// 分发前是否需要按工作组形状构建特化变体。
    #[inline]
    pub const fn requires_specialization(self) -> bool {
        matches!(self, Self::DescriptorTable { .. })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EncoderState {
    Created,
    Recording,
    Finalized,
    Submitted,
    Completed,
    Failed,
}

impl EncoderState {
    #[inline]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_become(self, next: Self) -> bool {
        use EncoderState::*;
        matches!(
            (self, next),
            (Created, Recording)
                | (Created | Recording, Finalized)
                | (Finalized, Submitted)
                | (Submitted, Completed)
                | (Created | Recording | Finalized | Submitted, Failed)
        )
    }
}

pub(crate) struct DispatchStatus {
    state: Mutex<EncoderState>,
    cond: Condvar,
}

impl DispatchStatus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EncoderState::Created),
            cond: Condvar::new(),
        })
    }

    fn get(&self) -> EncoderState {
        *self.state.lock().unwrap()
    }

    fn set(&self, next: EncoderState) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.can_become(next), "{:?} -> {next:?}", *state);
        *state = next;
        self.cond.notify_all();
    }
}

/// 一次已提交的分发。
pub struct Dispatch {
    id: u64,
    status: Arc<DispatchStatus>,
}

impl Dispatch {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> EncoderState {
        self.status.get()
    }

    /// 阻塞到这次分发完成。
    pub fn wait(&self) -> Result<()> {
        let state = self.status.state.lock().unwrap();
        let state = self
            .status
            .cond
            .wait_while(state, |s| !s.is_done())
            .unwrap();
        match *state {
            EncoderState::Completed => Ok(()),
            _ => Err(submission(format!("dispatch {} failed", self.id))),
        }
    }
}

/// 绑定模型产生的原生绑定。
pub(crate) enum Bindings {
    Params(Params),
    Staged(StagedArgs),
    Table(DescriptorSet),
}

impl Bindings {
    fn describe(&self) -> String {
        match self {
            Self::Params(p) => format!("param block of {} bytes", p.size()),
            Self::Staged(s) => format!("{} staged slots", s.len()),
            Self::Table(t) => {
                let writes = t.writes();
                let uniforms = writes
                    .iter()
                    .filter(|w| w.ty == descriptor::DescriptorType::UniformBuffer)
                    .count();
                let last = writes.last().map_or(0, |w| w.binding + 1);
                format!("{last} descriptors, {uniforms} uniform")
            }
        }
    }

    /// 把原生绑定解码成某个阶段的参数视图。
    fn resolve(&self, entry: &KernelEntry, stage: usize, outputs: Vec<BufferView>) -> Args {
        let slots = entry.stages()[stage].signature.slots();
        let values = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let at = entry.flat(stage, i);
                match self {
                    Self::Params(p) => p.decode(at, slot),
                    Self::Staged(s) => s.decode(at),
                    Self::Table(t) => t.decode(at, slot),
                }
            })
            .collect();
        Args::new(values, outputs)
    }
}

/// 交给执行引擎的一次内核启动。
pub(crate) struct Launch {
    pub name: Arc<str>,
    pub shape: Launch3,
    entry: Arc<KernelEntry>,
    variant: Option<Arc<Variant>>,
    bindings: Arc<Bindings>,
    links: Vec<Vec<BufferView>>,
}

impl Launch {
    #[inline]
    pub fn stages(&self) -> usize {
        self.entry.stages().len()
    }

    pub fn function(&self, stage: usize) -> &HostFunction {
        match &self.variant {
            Some(v) => &v.pipeline[stage],
            None => &self.entry.stages()[stage].function,
        }
    }

    pub fn resolve(&self, stage: usize) -> Args {
        let outputs = self.links.get(stage + 1).cloned().unwrap_or_default();
        self.bindings.resolve(&self.entry, stage, outputs)
    }
}

/// 原生绑定的写入端，每种绑定模型一个实现。
pub(crate) trait ArgSink {
    fn pod(&mut self, at: usize, bytes: &[u8]);
    fn buffer(&mut self, at: usize, view: BufferView);
    fn image(&mut self, at: usize, image: ImageArg);
    fn images(&mut self, at: usize, images: Vec<ImageArg>);
    fn stage_input(&mut self, at: usize, view: BufferView);
    fn finish(self) -> Bindings;
}

/// 分发期间持有、完成时释放的存储。
#[derive(Default)]
struct Retained {
    regions: Vec<Arc<Region>>,
    bindings: Option<Arc<Bindings>>,
    uses: Vec<DeviceUse>,
}

/// 记录期已改变的图像布局，提交失败时逆序撤销。
type Layouts = Vec<(Arc<ImageCore>, ImageLayout, ImageLayout)>;

/// 一次分发的记录器。
pub(crate) struct Encoder<'a, S> {
    id: u64,
    queue: &'a Queue,
    entry: &'a Arc<KernelEntry>,
    shape: Launch3,
    state: EncoderState,
    status: Arc<DispatchStatus>,
    sink: S,
    commands: Vec<Command>,
    layouts: Layouts,
    links: Vec<Vec<Arc<Region>>>,
    retained: Retained,
    trace: Option<&'a Mutex<Vec<BindEvent>>>,
}

/// 分发的目标。
pub(crate) struct Target<'a> {
    pub queue: &'a Queue,
    pub entry: &'a Arc<KernelEntry>,
    pub shape: Launch3,
    pub variant: Option<Arc<Variant>>,
}

/// 按设备的绑定模型记录并提交一次分发，模型在这里选定一次。
pub(crate) fn encode(
    target: Target,
    mut plan: Plan,
    args: &[Arg],
    stage: &mut ArgStage,
    trace: &Mutex<Vec<BindEvent>>,
) -> Result<Dispatch> {
    let Target {
        queue,
        entry,
        shape,
        variant,
    } = target;
    let uses = std::mem::take(&mut plan.uses);
    let plan = &plan;
    let slots = entry.slot_count();
    let status = DispatchStatus::new();
    let trace = is_recording().then_some(trace);
    let fail = |e| {
        status.set(EncoderState::Failed);
        e
    };
    match queue.device_info().binding {
        BindingModel::ParamBlock => {
            let sink = ParamBlock::new(plan, slots);
            Encoder::new(queue, entry, shape, status.clone(), sink, uses, trace)
                .map_err(fail)?
                .run(args, variant)
        }
        BindingModel::Staged => {
            let sink = Staged::new(stage, slots);
            Encoder::new(queue, entry, shape, status.clone(), sink, uses, trace)
                .map_err(fail)?
                .run(args, variant)
        }
        BindingModel::DescriptorTable { combined_rw_images } => {
            let sink = DescriptorTable::new(queue, plan, slots, combined_rw_images).map_err(fail)?;
            Encoder::new(queue, entry, shape, status.clone(), sink, uses, trace)
                .map_err(fail)?
                .run(args, variant)
        }
    }
}

impl<'a, S: ArgSink> Encoder<'a, S> {
    fn new(
        queue: &'a Queue,
        entry: &'a Arc<KernelEntry>,
        shape: Launch3,
        status: Arc<DispatchStatus>,
        sink: S,
        uses: Vec<DeviceUse>,
        trace: Option<&'a Mutex<Vec<BindEvent>>>,
    ) -> Result<Self> {
        // 阶段之间的链接存储，每个阶段输入一块
        let items = shape.global.max(1).product();
        let link = |size: usize| {
            usize::try_from(items)
                .ok()
                .and_then(|items| size.checked_mul(items))
                .ok_or_else(|| validation(format!("{items} items of {size} bytes overflow")))
                .and_then(|len| Region::new(len, queue.stats()))
        };
        let links = entry
            .stages()
            .iter()
            .map(|stage| {
                stage
                    .signature
                    .slots()
                    .iter()
                    .filter_map(|slot| match slot.kind {
                        ArgKind::StageInput { size } => Some(link(size)),
                        _ => None,
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: next_dispatch_id(),
            queue,
            entry,
            shape,
            state: EncoderState::Created,
            status,
            sink,
            commands: Vec::new(),
            layouts: Vec::new(),
            links,
            retained: Retained {
                uses,
                ..Default::default()
            },
            trace,
        })
    }

    fn advance(&mut self, next: EncoderState) {
        debug_assert!(self.state.can_become(next), "{:?} -> {next:?}", self.state);
        self.state = next;
        self.status.set(next);
    }

    fn record(&mut self, step: BindStep) {
        if let Some(trace) = self.trace {
            trace.lock().unwrap().push(BindEvent {
                dispatch: self.id,
                step,
            })
        }
    }

    fn run(mut self, args: &[Arg], variant: Option<Arc<Variant>>) -> Result<Dispatch> {
        self.record(BindStep::Begin);
        binder::bind(&mut self, args);
        self.record(BindStep::End);
        self.finalize(variant).submit()
    }

    /// 所有槽已绑定，附上执行形状。
    fn finalize(mut self, variant: Option<Arc<Variant>>) -> Finalized<'a> {
        self.advance(EncoderState::Finalized);
        let Self {
            id,
            queue,
            entry,
            shape,
            status,
            sink,
            mut commands,
            layouts,
            links,
            mut retained,
            ..
        } = self;
        let bindings = Arc::new(sink.finish());
        log::trace!("{} #{id}: {}", entry.name(), bindings.describe());
        let views = links
            .iter()
            .map(|stage| stage.iter().map(|r| r.view(0, r.len())).collect())
            .collect();
        commands.push(Command::Launch(Launch {
            name: entry.name_arc().clone(),
            shape,
            entry: entry.clone(),
            variant,
            bindings: bindings.clone(),
            links: views,
        }));
        retained.bindings = Some(bindings);
        retained.regions.extend(links.into_iter().flatten());
        Finalized {
            id,
            queue,
            status,
            commands,
            layouts,
            retained,
        }
    }
}

struct Finalized<'a> {
    id: u64,
    queue: &'a Queue,
    status: Arc<DispatchStatus>,
    commands: Vec<Command>,
    layouts: Layouts,
    retained: Retained,
}

impl Finalized<'_> {
    fn submit(self) -> Result<Dispatch> {
        let Self {
            id,
            queue,
            status,
            commands,
            layouts,
            retained,
        } = self;
        status.set(EncoderState::Submitted);
        let on_complete = {
            let status = status.clone();
            Box::new(move |result: Result<()>| {
                drop(retained);
                status.set(match result {
                    Ok(()) => EncoderState::Completed,
                    Err(_) => EncoderState::Failed,
                })
            })
        };
        match queue.submit(Submission {
            commands,
            on_complete: Some(on_complete),
        }) {
            Ok(()) => Ok(Dispatch { id, status }),
            Err(e) => {
                for (image, from, to) in layouts.iter().rev() {
                    image.restore(*from, *to)
                }
                status.set(EncoderState::Failed);
                Err(e)
            }
        }
    }
}
