//! 跨后端的内核执行与参数绑定运行时。
//!
//! 设备按绑定模型区分，所有设备上的命令都由进程内的宿主引擎执行。

// #![deny(warnings)]

mod context;
mod device;
mod encoder;
mod handle;
mod kernel;
mod memory;
mod queue;
mod record;

#[cfg(test)]
mod test;

pub use common::*;
pub use context::Context;
pub use device::{DeviceId, DeviceInfo, DeviceKind, Features, Limits, Registry, Vendor};
pub use encoder::{BindingModel, Dispatch, EncoderState};
pub use handle::common_cpu;
pub use kernel::{
    Access, Arg, ArgKind, Args, BufferView, HostFunction, ImageArg, ImageView, Kernel,
    KernelEntry, KernelFn, Signature, Slot, SpecKey, Stage, Variant, WorkItem,
};
pub use memory::{
    Buffer, HostMemory, Image, ImageDesc, ImageDim, ImageFormat, ImageLayout, InteropHandle,
    Mapping, MemoryStats, PendingMapping,
};
pub use queue::Queue;
pub use record::{is_recording, start_record, stop_record, BindEvent, BindStep};
