use crate::{encoder::BindingModel, handle::common_cpu::Config};
use common::Dim3;
use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicU32, Ordering::Relaxed},
};

/// 设备在注册表中的稳定标识。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DeviceId {
    registry: u32,
    index: u32,
}

impl DeviceId {
    #[inline]
    pub const fn index(&self) -> usize {
        self.index as _
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DeviceKind {
    Cpu,
    IntegratedGpu,
    DiscreteGpu,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Vendor {
    Host,
    Nvidia,
    Amd,
    Intel,
    Apple,
    Unknown,
}

impl Vendor {
    /// 根据设备名称猜测厂商。
    pub fn detect(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("nvidia") || name.contains("geforce") {
            Self::Nvidia
        } else if name.contains("amd") || name.contains("radeon") {
            Self::Amd
        } else if name.contains("intel") {
            Self::Intel
        } else if name.contains("apple") {
            Self::Apple
        } else {
            Self::Unknown
        }
    }
}

#[derive(Clone, Debug)]
pub struct Limits {
    /// 每个维度上工作组的最大尺寸。
    pub max_local_size: Dim3,
    /// 单个工作组的最大工作项数。
    pub max_total_local_size: u32,
    /// 单个资源的最大字节数。
    pub max_alloc: usize,
    /// 1D、2D、3D 图像每个维度的最大尺寸。
    pub max_image_dim: [u32; 3],
    pub max_image_layers: u32,
    /// 常量缓冲中每个值的对齐。
    pub uniform_alignment: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct Features {
    pub images: bool,
    pub cooperative: bool,
    pub interop: bool,
}

/// 外部发现层提供的设备描述。
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    pub vendor: Vendor,
    pub units: usize,
    pub limits: Limits,
    pub features: Features,
    pub binding: BindingModel,
}

impl DeviceInfo {
    /// 描述宿主 CPU。
    pub fn host(config: &Config) -> Self {
        let units = match config.threads {
            0 => std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            n => n,
        };
        Self {
            name: "Host CPU".into(),
            kind: DeviceKind::Cpu,
            vendor: Vendor::Host,
            units,
            limits: Limits {
                max_local_size: config.max_local_size,
                max_total_local_size: config.max_total_local_size,
                max_alloc: isize::MAX as _,
                max_image_dim: [65536; 3],
                max_image_layers: 2048,
                uniform_alignment: config.uniform_alignment,
            },
            features: Features {
                images: true,
                cooperative: true,
                interop: true,
            },
            binding: BindingModel::ParamBlock,
        }
    }
}

static REGISTRY: AtomicU32 = AtomicU32::new(0);

/// 设备的竞技场，下标在注册表的生命周期内保持稳定。
pub struct Registry {
    id: u32,
    devices: Vec<DeviceInfo>,
}

impl Registry {
    pub fn new(devices: impl IntoIterator<Item = DeviceInfo>) -> Self {
        Self {
            id: REGISTRY.fetch_add(1, Relaxed),
            devices: devices.into_iter().collect(),
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = (DeviceId, &DeviceInfo)> + '_ {
        self.devices.iter().enumerate().map(|(i, info)| {
            (
                DeviceId {
                    registry: self.id,
                    index: i as _,
                },
                info,
            )
        })
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceInfo> {
        if id.registry == self.id {
            self.devices.get(id.index())
        } else {
            None
        }
    }

    /// 第一个设备，注册表不能为空。
    #[inline]
    pub(crate) fn first(&self) -> DeviceId {
        debug_assert!(!self.devices.is_empty());
        DeviceId {
            registry: self.id,
            index: 0,
        }
    }

    /// 按下标取设备信息，标识需已经过 [`Registry::get`] 的检查。
    #[inline]
    pub(crate) fn info(&self, id: DeviceId) -> &DeviceInfo {
        &self.devices[id.index()]
    }

    /// 第一个指定类型的设备。
    pub fn find(&self, kind: DeviceKind) -> Option<DeviceId> {
        self.devices()
            .find(|(_, info)| info.kind == kind)
            .map(|(id, _)| id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
