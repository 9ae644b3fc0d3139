use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ErrorKind {
    /// 调用方提供的参数与签名、资源或范围不符。
    Validation,
    /// 偏移或长度越过资源边界，属于 [`ErrorKind::Validation`] 的细分。
    OutOfBounds,
    /// 资源、队列、设备三者不一致。
    DeviceMismatch,
    /// 特化变体构建失败。
    Build,
    /// 映射、互操作状态误用。
    Synchronization,
    /// 命令提交失败或设备故障。
    Submission,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub info: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    #[inline]
    pub const fn is_validation(&self) -> bool {
        matches!(self.kind, ErrorKind::Validation | ErrorKind::OutOfBounds)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Validation => "validation",
            ErrorKind::OutOfBounds => "out of bounds",
            ErrorKind::DeviceMismatch => "device mismatch",
            ErrorKind::Build => "build",
            ErrorKind::Synchronization => "synchronization",
            ErrorKind::Submission => "submission",
        };
        write!(f, "{kind} error: {}", self.info)
    }
}

impl std::error::Error for Error {}

pub(super) mod functions {
    use super::{Error, ErrorKind::*};

    macro_rules! builder {
        ($ty:ident: $name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> $ty {
                $ty {
                    kind: $kind,
                    info: info.into(),
                }
            }
        };
    }

    builder!(Error: validation      Validation     );
    builder!(Error: out_of_bounds   OutOfBounds    );
    builder!(Error: device_mismatch DeviceMismatch );
    builder!(Error: build_failed    Build          );
    builder!(Error: synchronization Synchronization);
    builder!(Error: submission      Submission     );
}

/// 检查 `[offset, offset + size)` 是否落在长度为 `extent` 的资源内，`size == 0` 表示到末尾。
///
/// 返回实际的访问长度。
pub fn check_range(what: &str, extent: usize, size: usize, offset: usize) -> Result<usize> {
    use functions::out_of_bounds;

    if offset > extent {
        return Err(out_of_bounds(format!(
            "{what}: offset {offset} exceeds extent {extent}"
        )));
    }
    let size = if size == 0 { extent - offset } else { size };
    match offset.checked_add(size) {
        Some(end) if end <= extent => Ok(size),
        _ => Err(out_of_bounds(format!(
            "{what}: [{offset}, {offset} + {size}) exceeds extent {extent}"
        ))),
    }
}
