use super::Access;
use crate::memory::{Buffer, Image};
use bytemuck::Pod;

/// 调用处提供的一个参数。
#[derive(Clone, Copy)]
pub enum Arg<'a> {
    Pod(&'a [u8]),
    Buffer(&'a Buffer),
    Image(&'a Image, Access),
    ImageArray(&'a [Image], Access),
}

impl<'a> Arg<'a> {
    /// 按字节传递一个值。
    #[inline]
    pub fn pod<T: Pod>(value: &'a T) -> Self {
        Self::Pod(bytemuck::bytes_of(value))
    }

    #[inline]
    pub fn read(image: &'a Image) -> Self {
        Self::Image(image, Access::Read)
    }

    #[inline]
    pub fn write(image: &'a Image) -> Self {
        Self::Image(image, Access::Write)
    }

    #[inline]
    pub fn read_write(image: &'a Image) -> Self {
        Self::Image(image, Access::ReadWrite)
    }

    pub(crate) fn describe(&self) -> &'static str {
        match self {
            Self::Pod(_) => "pod",
            Self::Buffer(_) => "buffer",
            Self::Image(..) => "image",
            Self::ImageArray(..) => "image array",
        }
    }
}

impl<'a> From<&'a Buffer> for Arg<'a> {
    #[inline]
    fn from(buffer: &'a Buffer) -> Self {
        Self::Buffer(buffer)
    }
}
