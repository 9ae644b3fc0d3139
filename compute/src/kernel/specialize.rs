use super::HostFunction;
use common::{validation, Dim3, Result};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc, Mutex, RwLock,
    },
};

/// 工作组形状打包成的键，每个分量占 16 位。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SpecKey(u64);

impl SpecKey {
    pub fn new(shape: Dim3) -> Result<Self> {
        let Dim3 { x, y, z } = shape;
        if [x, y, z].iter().any(|&n| n > u16::MAX as u32) {
            return Err(validation(format!(
                "work-group shape {shape} does not fit in 16-bit components"
            )));
        }
        Ok(Self(x as u64 | (y as u64) << 16 | (z as u64) << 32))
    }

    #[inline]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn shape(&self) -> Dim3 {
        let mask = u16::MAX as u64;
        Dim3::new(
            (self.0 & mask) as _,
            (self.0 >> 16 & mask) as _,
            (self.0 >> 32 & mask) as _,
        )
    }
}

/// 为某个工作组形状构建的可执行体。
#[derive(Debug)]
pub struct Variant {
    key: SpecKey,
    pub(crate) pipeline: Vec<HostFunction>,
}

impl Variant {
    #[inline]
    pub(crate) fn new(key: SpecKey, pipeline: Vec<HostFunction>) -> Self {
        Self { key, pipeline }
    }

    #[inline]
    pub fn key(&self) -> SpecKey {
        self.key
    }

    #[inline]
    pub fn shape(&self) -> Dim3 {
        self.key.shape()
    }
}

type Cell = Arc<Mutex<Option<Arc<Variant>>>>;

/// 只增不减的特化缓存。
///
/// 同一个键并发未命中时只有一个线程构建，其余等待其结果；构建失败不留下条目。
#[derive(Default)]
pub(crate) struct SpecCache {
    cells: RwLock<HashMap<SpecKey, Cell>>,
    builds: AtomicUsize,
}

impl SpecCache {
    pub fn get_or_build(
        &self,
        key: SpecKey,
        build: impl FnOnce() -> Result<Variant>,
    ) -> Result<Arc<Variant>> {
        loop {
            let cell = self.cells.read().unwrap().get(&key).cloned();
            let cell = match cell {
                Some(cell) => cell,
                None => self.cells.write().unwrap().entry(key).or_default().clone(),
            };

            let mut slot = cell.lock().unwrap();
            if let Some(variant) = &*slot {
                return Ok(variant.clone());
            }
            // 等待期间构建失败的格子已被移除
            if !self.is_current(key, &cell) {
                continue;
            }
            return match build() {
                Ok(variant) => {
                    let variant = Arc::new(variant);
                    self.builds.fetch_add(1, Relaxed);
                    *slot = Some(variant.clone());
                    Ok(variant)
                }
                Err(e) => {
                    self.cells.write().unwrap().remove(&key);
                    Err(e)
                }
            };
        }
    }

    fn is_current(&self, key: SpecKey, cell: &Cell) -> bool {
        self.cells
            .read()
            .unwrap()
            .get(&key)
            .is_some_and(|c| Arc::ptr_eq(c, cell))
    }

    /// 已构建的变体数。
    pub fn len(&self) -> usize {
        self.cells
            .read()
            .unwrap()
            .values()
            .filter(|cell| cell.lock().unwrap().is_some())
            .count()
    }

    #[inline]
    pub fn builds(&self) -> usize {
        self.builds.load(Relaxed)
    }
}
