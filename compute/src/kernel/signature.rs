/// 参数的访问方向。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    #[inline]
    pub const fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    #[inline]
    pub const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ArgKind {
    /// 按值传递的字节。
    Pod { size: usize },
    Buffer,
    Image,
    ImageArray { len: usize },
    /// 由前一阶段的输出填充，调用方不提供参数。
    StageInput { size: usize },
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Slot {
    pub kind: ArgKind,
    pub access: Access,
}

impl Slot {
    #[inline]
    pub const fn pod<T>() -> Self {
        Self::pod_bytes(size_of::<T>())
    }

    #[inline]
    pub const fn pod_bytes(size: usize) -> Self {
        Self {
            kind: ArgKind::Pod { size },
            access: Access::Read,
        }
    }

    #[inline]
    pub const fn buffer(access: Access) -> Self {
        Self {
            kind: ArgKind::Buffer,
            access,
        }
    }

    #[inline]
    pub const fn image(access: Access) -> Self {
        Self {
            kind: ArgKind::Image,
            access,
        }
    }

    #[inline]
    pub const fn image_array(len: usize, access: Access) -> Self {
        Self {
            kind: ArgKind::ImageArray { len },
            access,
        }
    }

    /// 每个工作项 `size` 字节的阶段输入。
    #[inline]
    pub const fn stage_input(size: usize) -> Self {
        Self {
            kind: ArgKind::StageInput { size },
            access: Access::Read,
        }
    }

    #[inline]
    pub const fn is_stage_input(&self) -> bool {
        matches!(self.kind, ArgKind::StageInput { .. })
    }
}

/// 编译器给出的内核参数签名。
#[derive(Clone, PartialEq, Eq, Hash, Default, Debug)]
pub struct Signature(Vec<Slot>);

impl Signature {
    #[inline]
    pub fn new(slots: impl IntoIterator<Item = Slot>) -> Self {
        Self(slots.into_iter().collect())
    }

    #[inline]
    pub fn slots(&self) -> &[Slot] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 调用方需要提供的参数个数。
    pub fn arg_count(&self) -> usize {
        self.0.iter().filter(|s| !s.is_stage_input()).count()
    }
}
