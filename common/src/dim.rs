use crate::{validation, Result};
use std::fmt;

/// 三维尺寸或坐标。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const ONE: Self = Self::new(1, 1, 1);

    #[inline]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// 逐分量取较大值。
    #[inline]
    pub fn max(self, min: u32) -> Self {
        Self::new(self.x.max(min), self.y.max(min), self.z.max(min))
    }

    /// 分量之积，调用方保证不溢出。
    #[inline]
    pub const fn product(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    #[inline]
    pub fn checked_product(&self) -> Option<u64> {
        (self.x as u64)
            .checked_mul(self.y as u64)?
            .checked_mul(self.z as u64)
    }

    #[inline]
    pub const fn to_array(self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    /// 按 x 最快变化的顺序把线性序号展开为坐标。
    #[inline]
    pub const fn unflatten(&self, i: u64) -> Self {
        let x = self.x as u64;
        let y = self.y as u64;
        Self::new((i % x) as _, (i / x % y) as _, (i / (x * y)) as _)
    }
}

impl From<u32> for Dim3 {
    #[inline]
    fn from(x: u32) -> Self {
        Self::new(x, 1, 1)
    }
}

impl From<[u32; 3]> for Dim3 {
    #[inline]
    fn from([x, y, z]: [u32; 3]) -> Self {
        Self::new(x, y, z)
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// 带维数的工作尺寸，维数为 1、2 或 3，未使用的分量为 1。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WorkSize {
    dims: u8,
    size: Dim3,
}

impl WorkSize {
    #[inline]
    pub const fn dims(&self) -> usize {
        self.dims as _
    }

    #[inline]
    pub const fn size(&self) -> Dim3 {
        self.size
    }
}

impl From<u32> for WorkSize {
    #[inline]
    fn from(x: u32) -> Self {
        Self {
            dims: 1,
            size: Dim3::new(x, 1, 1),
        }
    }
}

impl From<[u32; 1]> for WorkSize {
    #[inline]
    fn from([x]: [u32; 1]) -> Self {
        x.into()
    }
}

impl From<[u32; 2]> for WorkSize {
    #[inline]
    fn from([x, y]: [u32; 2]) -> Self {
        Self {
            dims: 2,
            size: Dim3::new(x, y, 1),
        }
    }
}

impl From<[u32; 3]> for WorkSize {
    #[inline]
    fn from([x, y, z]: [u32; 3]) -> Self {
        Self {
            dims: 3,
            size: Dim3::new(x, y, z),
        }
    }
}

/// 规范化后的一次分发的执行形状。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Launch3 {
    pub global: Dim3,
    pub block: Dim3,
    pub grid: Dim3,
}

/// 组数：非零分量向上取整，零分量为 0，最后逐分量下限为 1。
pub fn grid_count(global: Dim3, block: Dim3) -> Dim3 {
    let block = block.max(1);
    let div = |g: u32, b: u32| if g == 0 { 0 } else { g.div_ceil(b) };
    Dim3::new(
        div(global.x, block.x),
        div(global.y, block.y),
        div(global.z, block.z),
    )
    .max(1)
}

/// 校验全局与局部尺寸的维数一致，局部尺寸逐分量下限为 1，并计算组数。
///
/// 组数乘局部尺寸的每个分量必须能用 `u32` 表示，工作项总数必须能用 `u64` 表示。
pub fn normalize(global: WorkSize, local: WorkSize) -> Result<Launch3> {
    if global.dims != local.dims {
        return Err(validation(format!(
            "work size dimensionality mismatch: global is {}d, local is {}d",
            global.dims, local.dims,
        )));
    }
    let block = local.size.max(1);
    let grid = grid_count(global.size, block);
    let covered = [
        grid.x.checked_mul(block.x),
        grid.y.checked_mul(block.y),
        grid.z.checked_mul(block.z),
    ];
    let [Some(x), Some(y), Some(z)] = covered else {
        return Err(validation(format!(
            "work size {} rounded up to groups of {block} overflows",
            global.size,
        )));
    };
    if Dim3::new(x, y, z).checked_product().is_none() {
        return Err(validation(format!(
            "work size {} has too many work items",
            global.size,
        )));
    }
    Ok(Launch3 {
        global: global.size,
        block,
        grid,
    })
}
