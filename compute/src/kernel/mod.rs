mod arg;
mod function;
mod signature;
mod specialize;

pub use arg::Arg;
pub use function::{Args, BufferView, HostFunction, ImageArg, ImageView, KernelFn, WorkItem};
pub use signature::{Access, ArgKind, Signature, Slot};
pub use specialize::{SpecKey, Variant};

pub(crate) use function::ArgValue;

use crate::{
    device::{DeviceId, DeviceInfo},
    encoder::{self, ArgStage, Dispatch},
    queue::Queue,
    record::BindEvent,
};
use common::{build_failed, device_mismatch, normalize, validation, Dim3, Result, WorkSize};
use specialize::SpecCache;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

/// 内核的一个阶段。
#[derive(Clone, Debug)]
pub struct Stage {
    pub function: HostFunction,
    pub signature: Signature,
}

impl Stage {
    #[inline]
    pub fn new(function: HostFunction, signature: Signature) -> Self {
        Self {
            function,
            signature,
        }
    }
}

/// 内核在一个设备上的编译结果，加载时构建一次。
pub struct KernelEntry {
    device: DeviceId,
    name: Arc<str>,
    stages: Vec<Stage>,
    slot_base: Vec<usize>,
    specializations: SpecCache,
}

impl KernelEntry {
    #[inline]
    pub fn new(
        device: DeviceId,
        name: &str,
        function: HostFunction,
        signature: Signature,
    ) -> Result<Self> {
        Self::composed(device, name, [Stage::new(function, signature)])
    }

    /// 多阶段内核，后一阶段的阶段输入由前一阶段写出。
    pub fn composed(
        device: DeviceId,
        name: &str,
        stages: impl IntoIterator<Item = Stage>,
    ) -> Result<Self> {
        let stages = stages.into_iter().collect::<Vec<_>>();
        if stages.is_empty() {
            return Err(validation(format!("kernel {name} has no stage")));
        }
        let mut slot_base = Vec::with_capacity(stages.len());
        let mut base = 0;
        for (i, stage) in stages.iter().enumerate() {
            for slot in stage.signature.slots() {
                let bad = match slot.kind {
                    ArgKind::Pod { size } => size == 0,
                    ArgKind::ImageArray { len } => len == 0,
                    ArgKind::StageInput { size } => i == 0 || size == 0,
                    ArgKind::Buffer | ArgKind::Image => false,
                };
                if bad {
                    return Err(validation(format!(
                        "kernel {name} stage {i} declares invalid slot {slot:?}"
                    )));
                }
            }
            slot_base.push(base);
            base += stage.signature.len();
        }
        Ok(Self {
            device,
            name: name.into(),
            stages,
            slot_base,
            specializations: SpecCache::default(),
        })
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    #[inline]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// 调用方需要提供的参数个数。
    pub fn arg_count(&self) -> usize {
        self.stages.iter().map(|s| s.signature.arg_count()).sum()
    }

    /// 所有阶段的槽总数。
    pub fn slot_count(&self) -> usize {
        self.stages.iter().map(|s| s.signature.len()).sum()
    }

    /// 阶段内槽号在全部槽中的序号。
    #[inline]
    pub(crate) fn flat(&self, stage: usize, slot: usize) -> usize {
        self.slot_base[stage] + slot
    }

    /// 取得或构建指定工作组形状的特化变体。
    pub fn specialization(&self, info: &DeviceInfo, shape: Dim3) -> Result<Arc<Variant>> {
        let key = SpecKey::new(shape)?;
        self.specializations.get_or_build(key, || {
            let time = Instant::now();
            let limits = &info.limits;
            let max = limits.max_local_size;
            if shape.x > max.x
                || shape.y > max.y
                || shape.z > max.z
                || shape.product() > limits.max_total_local_size as u64
            {
                let e = build_failed(format!(
                    "{}: work-group {shape} exceeds {max} / {} on {}",
                    self.name, limits.max_total_local_size, info.name,
                ));
                log::warn!("{e}");
                return Err(e);
            }
            let pipeline = self.stages.iter().map(|s| s.function.clone()).collect();
            log::debug!(
                "{}: specialized for {shape} in {:?}",
                self.name,
                time.elapsed()
            );
            Ok(Variant::new(key, pipeline))
        })
    }

    /// 已构建的特化变体数。
    #[inline]
    pub fn specializations(&self) -> usize {
        self.specializations.len()
    }
}

struct KernelInner {
    name: String,
    entries: Vec<Option<Arc<KernelEntry>>>,
    staging: Mutex<HashMap<DeviceId, ArgStage>>,
    trace: Mutex<Vec<BindEvent>>,
}

/// 跨设备的内核，每个设备至多一个 [`KernelEntry`]。
#[derive(Clone)]
pub struct Kernel(Arc<KernelInner>);

impl Kernel {
    pub fn new(name: &str, entries: impl IntoIterator<Item = KernelEntry>) -> Result<Self> {
        let mut table = Vec::<Option<Arc<KernelEntry>>>::new();
        for entry in entries {
            let i = entry.device.index();
            if table.len() <= i {
                table.resize(i + 1, None);
            }
            if table[i].is_some() {
                return Err(validation(format!(
                    "kernel {name} has two entries for {:?}",
                    entry.device,
                )));
            }
            table[i] = Some(Arc::new(entry));
        }
        Ok(Self(Arc::new(KernelInner {
            name: name.into(),
            entries: table,
            staging: Default::default(),
            trace: Default::default(),
        })))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn entry(&self, device: DeviceId) -> Option<&Arc<KernelEntry>> {
        self.0
            .entries
            .get(device.index())
            .and_then(Option::as_ref)
            .filter(|e| e.device == device)
    }

    /// 取出记录开启期间的绑定事件。
    pub fn take_trace(&self) -> Vec<BindEvent> {
        std::mem::take(&mut *self.0.trace.lock().unwrap())
    }

    /// 在队列上分发，返回可等待的句柄。
    ///
    /// 参数在写入任何绑定之前完整校验，失败时不会提交任何命令。
    pub fn dispatch(
        &self,
        queue: &Queue,
        global: impl Into<WorkSize>,
        local: impl Into<WorkSize>,
        args: &[Arg],
    ) -> Result<Dispatch> {
        let Some(entry) = self.entry(queue.device()) else {
            return Err(device_mismatch(format!(
                "kernel {} has no entry for {:?}",
                self.0.name,
                queue.device(),
            )));
        };
        queue.check_health()?;
        let shape = normalize(global.into(), local.into())?;
        let info = queue.device_info();
        let plan = encoder::validate(entry, info, queue.device(), args)?;

        let variant = if info.binding.requires_specialization() {
            Some(entry.specialization(info, shape.block)?)
        } else {
            encoder::check_local_size(info, shape.block)?;
            None
        };

        // 同一内核的绑定在此串行
        let mut staging = self.0.staging.lock().unwrap();
        let stage = staging.entry(queue.device()).or_default();
        encoder::encode(
            encoder::Target {
                queue,
                entry,
                shape,
                variant,
            },
            plan,
            args,
            stage,
            &self.0.trace,
        )
    }
}
