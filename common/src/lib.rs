#![deny(warnings)]

mod dim;
mod error;
mod flags;

pub use dim::{grid_count, normalize, Dim3, Launch3, WorkSize};
pub use error::{check_range, functions::*, Error, ErrorKind, Result};
pub use flags::{MapFlags, MemoryFlags};
