use std::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{Relaxed, SeqCst},
};

static RECORD: AtomicBool = AtomicBool::new(false);
static DISPATCH: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn start_record() {
    RECORD.store(true, Relaxed);
}

#[inline]
pub fn stop_record() {
    RECORD.store(false, SeqCst);
}

#[inline]
pub fn is_recording() -> bool {
    RECORD.load(Relaxed)
}

/// 绑定过程中的一步。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BindStep {
    Begin,
    Slot(usize),
    End,
}

/// 记录开启时每个内核按顺序追加的绑定事件。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BindEvent {
    pub dispatch: u64,
    pub step: BindStep,
}

#[inline]
pub(crate) fn next_dispatch_id() -> u64 {
    DISPATCH.fetch_add(1, Relaxed)
}
