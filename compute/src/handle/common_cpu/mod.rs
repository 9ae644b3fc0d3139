use crate::{kernel::WorkItem, queue::Command};
use common::{submission, Dim3, Result};
use rayon::{
    iter::{IntoParallelIterator, ParallelIterator},
    ThreadPool, ThreadPoolBuilder,
};
use std::env::var;

/// 宿主执行引擎的配置。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Config {
    /// 工作组并行的线程数，0 表示按可用核数。
    pub threads: usize,
    pub max_local_size: Dim3,
    pub max_total_local_size: u32,
    /// 常量缓冲中值参数的对齐。
    pub uniform_alignment: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 0,
            max_local_size: Dim3::new(1024, 1024, 64),
            max_total_local_size: 1024,
            uniform_alignment: 16,
        }
    }
}

impl Config {
    pub const THREADS_ENV: &'static str = "COMPUTE_HOST_THREADS";

    /// 在默认配置上应用环境变量。
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = var(Self::THREADS_ENV) {
            match value.trim().parse() {
                Ok(n) => config.threads = n,
                Err(_) => log::warn!("ignore invalid {}={value:?}", Self::THREADS_ENV),
            }
        }
        config
    }
}

/// 在进程内执行命令的引擎。工作组分给线程池并行，组内工作项顺序执行。
pub struct Cpu {
    pool: ThreadPool,
}

impl Cpu {
    pub fn new(config: &Config) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("compute-host-{i}"))
            .build()
            .map_err(|e| submission(format!("failed to build thread pool: {e}")))?;
        log::debug!("host engine with {} threads", pool.current_num_threads());
        Ok(Self { pool })
    }

    #[inline]
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub(crate) fn run(&self, cmd: &Command) {
        match cmd {
            Command::Write { dst, offset, data } => unsafe { dst.write(*offset, data) },
            Command::Copy {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => unsafe { dst.copy_from(*dst_offset, src, *src_offset, *size) },
            Command::Fill {
                dst,
                offset,
                size,
                pattern,
            } => unsafe { dst.fill(*offset, *size, pattern) },
            Command::Transition { image, from, to } => {
                log::trace!("barrier {from:?} -> {to:?}");
                image.barrier_executed()
            }
            Command::Launch(launch) => {
                let shape = launch.shape;
                let groups = shape.grid.product();
                let group_size = shape.block.product();
                for stage in 0..launch.stages() {
                    let args = launch.resolve(stage);
                    let function = launch.function(stage);
                    let run_group = |g: u64| {
                        let group_id = shape.grid.unflatten(g);
                        for l in 0..group_size {
                            let local_id = shape.block.unflatten(l);
                            let global_id = Dim3::new(
                                group_id.x * shape.block.x + local_id.x,
                                group_id.y * shape.block.y + local_id.y,
                                group_id.z * shape.block.z + local_id.z,
                            );
                            if global_id.x >= shape.global.x
                                || global_id.y >= shape.global.y
                                || global_id.z >= shape.global.z
                            {
                                continue;
                            }
                            let item = WorkItem {
                                global_id,
                                local_id,
                                group_id,
                                global_size: shape.global,
                                local_size: shape.block,
                                group_count: shape.grid,
                            };
                            function.call(&item, &args)
                        }
                    };
                    log::trace!("{} stage {stage}: {groups} groups", launch.name);
                    self.pool
                        .install(|| (0..groups).into_par_iter().for_each(run_group))
                }
            }
        }
    }
}
