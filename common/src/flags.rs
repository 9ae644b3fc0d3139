use std::{fmt, ops::BitOr};

macro_rules! flags {
    ($(#[$meta:meta])* $ty:ident { $($(#[$doc:meta])* $name:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(transparent)]
        pub struct $ty(u32);

        impl $ty {
            $($(#[$doc])* pub const $name: Self = Self($value);)*

            #[inline]
            pub const fn empty() -> Self {
                Self(0)
            }

            #[inline]
            pub const fn bits(self) -> u32 {
                self.0
            }

            /// 包含 `other` 的全部位。
            #[inline]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// 与 `other` 有交集。
            #[inline]
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            #[inline]
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }
        }

        impl BitOr for $ty {
            type Output = Self;
            #[inline]
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let mut list = f.debug_set();
                $(if $value != 0 && $value & !self.0 == 0 && ($value as u32).count_ones() == 1 {
                    list.entry(&stringify!($name));
                })*
                list.finish()
            }
        }
    };
}

flags! {
    /// 资源的访问方式与来源。
    MemoryFlags {
        /// 设备只读。
        READ = 1 << 0;
        /// 设备只写。
        WRITE = 1 << 1;
        READ_WRITE = (1 << 0) | (1 << 1);
        /// 主机可映射读取。
        HOST_READ = 1 << 2;
        /// 主机可映射写入。
        HOST_WRITE = 1 << 3;
        HOST_READ_WRITE = (1 << 2) | (1 << 3);
        /// 保留对创建时传入的主机内存的引用。
        USE_HOST_MEMORY = 1 << 4;
        /// 与外部图形 API 共享。
        INTEROP_SHARING = 1 << 5;
    }
}

flags! {
    /// 映射方式。
    MapFlags {
        READ = 1 << 0;
        WRITE = 1 << 1;
        READ_WRITE = (1 << 0) | (1 << 1);
        /// 写入前不保留原内容。
        WRITE_INVALIDATE = 1 << 2;
        /// 不等待队列中已提交的工作，使用前需要同步。
        NON_BLOCKING = 1 << 3;
    }
}

impl MapFlags {
    /// 映射是否需要写权限。
    #[inline]
    pub const fn writes(self) -> bool {
        self.intersects(Self::WRITE.union(Self::WRITE_INVALIDATE))
    }
}

impl MemoryFlags {
    /// 在未指定任何设备访问位时按读写处理。
    #[inline]
    pub const fn device_access(self) -> Self {
        if self.intersects(Self::READ_WRITE) {
            Self(self.0 & Self::READ_WRITE.0)
        } else {
            Self::READ_WRITE
        }
    }
}
