//! `Address` represents an arbitrary address and supports address arithmetic
//! in a mostly-safe way, mirroring the newtype style used throughout MMTk's
//! `util::address` module. `ObjectRef` is a distinguished `Address` that is
//! known to point at the start of a live slot.

use std::fmt;
use std::ops::{Add, AddAssign, BitAnd, Sub, SubAssign};

use static_assertions::assert_eq_size;

/// An arbitrary address, possibly not pointing at anything meaningful.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq)]
pub struct Address(usize);

// Both newtypes must stay exactly pointer-sized: slot headers and page
// descriptors round-trip them through raw `usize` link words (`util::slot`,
// `util::page`), which would silently truncate if either grew past a word.
assert_eq_size!(Address, usize);
assert_eq_size!(ObjectRef, usize);

impl Address {
    pub const ZERO: Address = Address(0);

    #[inline(always)]
    pub const fn from_usize(v: usize) -> Self {
        Address(v)
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// # Safety
    /// The caller must ensure `ptr` is a value obtained from a pointer this
    /// crate allocated, or from a root/slot that the host otherwise
    /// guarantees is addressable.
    #[inline(always)]
    pub unsafe fn from_ptr<T>(ptr: *const T) -> Self {
        Address(ptr as usize)
    }

    #[inline(always)]
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline(always)]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn is_aligned_to(self, align: usize) -> bool {
        debug_assert!(align.is_power_of_two());
        (self.0 & (align - 1)) == 0
    }

    #[inline(always)]
    pub fn align_down(self, align: usize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address(self.0 & !(align - 1))
    }

    #[inline(always)]
    pub fn align_up(self, align: usize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address((self.0 + align - 1) & !(align - 1))
    }
}

impl Add<usize> for Address {
    type Output = Address;
    #[inline(always)]
    fn add(self, offset: usize) -> Address {
        Address(self.0 + offset)
    }
}

impl AddAssign<usize> for Address {
    #[inline(always)]
    fn add_assign(&mut self, offset: usize) {
        self.0 += offset;
    }
}

impl Sub<usize> for Address {
    type Output = Address;
    #[inline(always)]
    fn sub(self, offset: usize) -> Address {
        Address(self.0 - offset)
    }
}

impl SubAssign<usize> for Address {
    #[inline(always)]
    fn sub_assign(&mut self, offset: usize) {
        self.0 -= offset;
    }
}

/// `Address - Address` (the first address must not be lower than the second).
impl Sub<Address> for Address {
    type Output = usize;
    #[inline(always)]
    fn sub(self, other: Address) -> usize {
        debug_assert!(self.0 >= other.0, "{} - {}: underflow", self, other);
        self.0 - other.0
    }
}

impl BitAnd<usize> for Address {
    type Output = usize;
    #[inline(always)]
    fn bitand(self, mask: usize) -> usize {
        self.0 & mask
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A reference to the start of a slot that, at the time it was obtained, held
/// a live managed object. Distinguished from a bare `Address` so that call
/// sites which require "this really is an object" are type-checked.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq)]
pub struct ObjectRef(Address);

impl ObjectRef {
    /// # Safety
    /// `addr` must point at the start of a slot inside a page owned by this
    /// collector's heap.
    #[inline(always)]
    pub unsafe fn from_address(addr: Address) -> Self {
        ObjectRef(addr)
    }

    #[inline(always)]
    pub fn addr(self) -> Address {
        self.0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ObjectRef({:?})", self.0)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        let a = Address::from_usize(0x4010);
        assert!(!a.is_aligned_to(0x1000));
        assert_eq!(a.align_down(0x1000), Address::from_usize(0x4000));
        assert_eq!(a.align_up(0x1000), Address::from_usize(0x5000));
    }

    #[test]
    fn arithmetic() {
        let a = Address::from_usize(100);
        let b = a + 50usize;
        assert_eq!(b.as_usize(), 150);
        assert_eq!(b - a, 50);
    }
}
