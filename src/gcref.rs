use std::{fmt, num::NonZeroUsize};

/// Untyped reference to a managed object. The collector never dereferences it: object contents
/// are only ever reached through [`ObjectModel`](crate::runtime::ObjectModel).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    #[inline]
    pub const fn from_address(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// # Safety
    ///
    /// `addr` must not be zero.
    #[inline]
    pub const unsafe fn from_address_unchecked(addr: usize) -> Self {
        Self(NonZeroUsize::new_unchecked(addr))
    }

    #[inline]
    pub const fn address(self) -> usize {
        self.0.get()
    }

    #[inline]
    pub fn as_ptr(self) -> *const u8 {
        self.0.get() as *const u8
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

impl fmt::Pointer for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Byte offset of a reference field inside its owner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct MemberOffset(pub u32);

impl MemberOffset {
    #[inline]
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MemberOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
