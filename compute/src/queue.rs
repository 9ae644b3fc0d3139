use crate::{
    context::ContextInner,
    device::{DeviceId, DeviceInfo},
    encoder::Launch,
    handle::common_cpu::Cpu,
    kernel::{Arg, Kernel},
    memory::{DeviceStats, ImageCore, ImageLayout, Region},
};
use common::{submission, validation, Result, WorkSize};
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
};

/// 队列上按序执行的命令。
pub(crate) enum Command {
    Write {
        dst: Arc<Region>,
        offset: usize,
        data: Vec<u8>,
    },
    Copy {
        src: Arc<Region>,
        src_offset: usize,
        dst: Arc<Region>,
        dst_offset: usize,
        size: usize,
    },
    Fill {
        dst: Arc<Region>,
        offset: usize,
        size: usize,
        pattern: Vec<u8>,
    },
    Transition {
        image: Arc<ImageCore>,
        from: ImageLayout,
        to: ImageLayout,
    },
    Launch(Launch),
}

pub(crate) type Completion = Box<dyn FnOnce(Result<()>) + Send>;

/// 一次原子提交。命令执行完毕并释放后才触发完成回调。
pub(crate) struct Submission {
    pub commands: Vec<Command>,
    pub on_complete: Option<Completion>,
}

#[derive(Default)]
struct State {
    submitted: u64,
    completed: u64,
    commands: u64,
    fault: Option<String>,
}

#[derive(Default)]
struct Progress {
    state: Mutex<State>,
    cond: Condvar,
}

pub(crate) struct QueueInner {
    ctx: Arc<ContextInner>,
    device: DeviceId,
    sender: Mutex<Option<Sender<Submission>>>,
    progress: Arc<Progress>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// 绑定到一个设备的有序命令队列。
///
/// 提交不等待完成，完成顺序与提交顺序一致。
#[derive(Clone)]
pub struct Queue(Arc<QueueInner>);

impl Queue {
    pub(crate) fn new(ctx: Arc<ContextInner>, device: DeviceId) -> Result<Self> {
        let (sender, receiver) = channel();
        let progress = Arc::new(Progress::default());
        let worker = thread::Builder::new()
            .name(format!("compute-queue-{}", device.index()))
            .spawn({
                let engine = ctx.engine.clone();
                let progress = progress.clone();
                move || serve(&engine, &progress, receiver)
            })
            .map_err(|e| submission(format!("failed to start queue worker: {e}")))?;
        log::debug!("queue created on {:?}", device);
        Ok(Self(Arc::new(QueueInner {
            ctx,
            device,
            sender: Mutex::new(Some(sender)),
            progress,
            worker: Mutex::new(Some(worker)),
        })))
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.0.device
    }

    #[inline]
    pub fn device_info(&self) -> &DeviceInfo {
        self.0.ctx.info(self.0.device)
    }

    #[inline]
    pub(crate) fn context(&self) -> &Arc<ContextInner> {
        &self.0.ctx
    }

    #[inline]
    pub(crate) fn stats(&self) -> &Arc<DeviceStats> {
        self.0.ctx.stats(self.0.device)
    }

    /// 在队列上分发内核。
    pub fn execute(
        &self,
        kernel: &Kernel,
        global: impl Into<WorkSize>,
        local: impl Into<WorkSize>,
        args: &[Arg],
    ) -> Result<()> {
        kernel.dispatch(self, global, local, args).map(drop)
    }

    /// 以协作方式分发，所有工作组需要同时驻留。
    pub fn execute_cooperative(
        &self,
        kernel: &Kernel,
        global: impl Into<WorkSize>,
        local: impl Into<WorkSize>,
        args: &[Arg],
    ) -> Result<()> {
        let info = self.device_info();
        if !info.features.cooperative {
            return Err(validation(format!(
                "{} does not support cooperative launch",
                info.name,
            )));
        }
        self.execute(kernel, global, local, args)
    }

    /// 阻塞到此前提交的所有工作完成。
    pub fn finish(&self) -> Result<()> {
        let progress = &self.0.progress;
        let state = progress.state.lock().unwrap();
        let state = progress
            .cond
            .wait_while(state, |s| s.completed < s.submitted)
            .unwrap();
        match &state.fault {
            Some(msg) => Err(submission(format!("device fault: {msg}"))),
            None => Ok(()),
        }
    }

    /// 保证已提交的工作送达执行引擎，不等待完成。
    ///
    /// 提交时即直接送达工作线程，这里只检查队列状态。
    pub fn flush(&self) -> Result<()> {
        self.check_health()?;
        if self.0.sender.lock().unwrap().is_none() {
            return Err(submission("queue worker has stopped"));
        }
        log::trace!("flushed queue on {:?}", self.0.device);
        Ok(())
    }

    /// 尚未完成的提交数。
    pub fn pending(&self) -> u64 {
        let state = self.0.progress.state.lock().unwrap();
        state.submitted - state.completed
    }

    /// 送达执行引擎的命令总数。
    pub fn submitted_commands(&self) -> u64 {
        self.0.progress.state.lock().unwrap().commands
    }

    pub fn is_faulted(&self) -> bool {
        self.0.progress.state.lock().unwrap().fault.is_some()
    }

    pub(crate) fn check_health(&self) -> Result<()> {
        match &self.0.progress.state.lock().unwrap().fault {
            Some(msg) => Err(submission(format!("queue is faulted: {msg}"))),
            None => Ok(()),
        }
    }

    /// 停止工作线程，之后的提交都会失败。
    #[cfg(test)]
    pub(crate) fn shut_down(&self) {
        self.0.shut_down()
    }

    #[inline]
    pub(crate) fn submit_commands(&self, commands: Vec<Command>) -> Result<()> {
        self.submit(Submission {
            commands,
            on_complete: None,
        })
    }

    /// 原子地交给工作线程。失败时回调不会被调用，提交被原样丢弃。
    pub(crate) fn submit(&self, sub: Submission) -> Result<()> {
        let sender = self.0.sender.lock().unwrap();
        let Some(sender) = &*sender else {
            return Err(submission("queue worker has stopped"));
        };
        let n = sub.commands.len() as u64;
        {
            let mut state = self.0.progress.state.lock().unwrap();
            if let Some(msg) = &state.fault {
                return Err(submission(format!("queue is faulted: {msg}")));
            }
            state.submitted += 1;
            state.commands += n;
        }
        log::trace!("submit {n} commands to {:?}", self.0.device);
        sender.send(sub).map_err(|_| {
            let mut state = self.0.progress.state.lock().unwrap();
            state.submitted -= 1;
            state.commands -= n;
            submission("queue worker has stopped")
        })
    }
}

impl QueueInner {
    /// 关闭通道，工作线程处理完剩余提交后退出。
    fn shut_down(&self) {
        self.sender.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.shut_down()
    }
}

fn serve(engine: &Cpu, progress: &Progress, receiver: Receiver<Submission>) {
    for Submission {
        commands,
        on_complete,
    } in receiver
    {
        let fault = progress.state.lock().unwrap().fault.clone();
        let result = match fault {
            Some(msg) => Err(submission(format!("discarded after device fault: {msg}"))),
            None => match catch_unwind(AssertUnwindSafe(|| {
                commands.iter().for_each(|cmd| engine.run(cmd))
            })) {
                Ok(()) => Ok(()),
                Err(payload) => {
                    let msg = panic_message(&*payload);
                    log::warn!("device fault: {msg}");
                    progress.state.lock().unwrap().fault = Some(msg.clone());
                    Err(submission(format!("device fault: {msg}")))
                }
            },
        };
        drop(commands);
        if let Some(f) = on_complete {
            if catch_unwind(AssertUnwindSafe(|| f(result))).is_err() {
                log::warn!("completion callback panicked");
            }
        }
        progress.state.lock().unwrap().completed += 1;
        progress.cond.notify_all();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "kernel panicked".into()
    }
}
