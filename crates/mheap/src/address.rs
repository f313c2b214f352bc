//! Address arithmetic and corruption tags.

use core::{fmt, ptr};

/// Alignment of every block header and free node, in bytes.
///
/// Requested alignments must be multiples of this value.
pub const HEADER_ALIGNMENT: usize = 16;

/// Allocation granularity in bytes.
///
/// Every allocation reserves at least this many payload bytes so that the
/// block can later be turned back into a free node.
pub const BLOCK_SIZE: usize = 16;

macro_rules! impl_hex {
    ($ty:ty) => {
        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl fmt::UpperHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::UpperHex::fmt(&self.0, f)
            }
        }
    };
}

/// Address of a byte inside a heap's backing buffer.
///
/// The value is the real memory address (buffer base plus offset), so
/// alignment checks on it reflect the alignment of the memory itself and
/// addresses from different heaps never compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HeapAddr(usize);
impl_hex!(HeapAddr);

impl HeapAddr {
    /// Wraps a raw address value.
    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the raw address value.
    #[must_use]
    pub const fn value(self) -> usize {
        self.0
    }

    /// Returns `true` if the address is a multiple of `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is zero.
    #[must_use]
    pub const fn is_aligned(self, align: usize) -> bool {
        assert!(align > 0, "alignment must be non-zero");
        self.0.is_multiple_of(align)
    }

    /// Returns the address `count` bytes further, or `None` on overflow.
    #[must_use]
    pub const fn checked_add(self, count: usize) -> Option<Self> {
        match self.0.checked_add(count) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl fmt::Pointer for HeapAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ptr = &ptr::without_provenance::<u8>(self.0);
        fmt::Pointer::fmt(ptr, f)
    }
}

/// Rounds `addr` up to the next multiple of `align`.
///
/// `align` does not need to be a power of two. Returns `None` if the result
/// would overflow.
///
/// # Panics
///
/// Panics if `align` is zero.
///
/// # Examples
///
/// ```
/// use mheap::address::align_up;
///
/// assert_eq!(align_up(0x1001, 16), Some(0x1010));
/// assert_eq!(align_up(0x1010, 16), Some(0x1010));
/// assert_eq!(align_up(100, 48), Some(144));
/// ```
#[must_use]
pub const fn align_up(addr: usize, align: usize) -> Option<usize> {
    assert!(align >= 1, "alignment must be non-zero");
    addr.checked_next_multiple_of(align)
}

/// Corruption tag stored next to the size of every free node and block
/// header.
///
/// The tag is derived from the record's own offset inside the heap and the
/// size it describes. It is a cheap heuristic, not an integrity guarantee;
/// implement this trait to plug in a stronger check.
pub trait Checksum {
    /// Computes the tag of a record located at `offset` describing `size`
    /// bytes.
    fn tag(offset: u32, size: u32) -> u32;
}

/// The classic `offset ^ size` tag.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AddressXor;

impl Checksum for AddressXor {
    fn tag(offset: u32, size: u32) -> u32 {
        offset ^ size
    }
}
