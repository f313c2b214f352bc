//! In-buffer record layouts.
//!
//! The free list and the allocation headers are not separate objects: they
//! are 16-byte records written into the very memory the heap manages. Both
//! records use 4-byte fields holding *offsets* from the start of the heap's
//! backing buffer, and are materialized on demand through [`dataview`].
//!
//! ```text
//! Free fragment:
//! ┌──────────┬──────────┬──────────┬──────────┬──────────────────────┐
//! │ prev u32 │ next u32 │ size u32 │ tag u32  │ unused ...           │
//! └──────────┴──────────┴──────────┴──────────┴──────────────────────┘
//!
//! Allocated block:
//! ┌──────────────┬──────────┬──────────┬──────────┬─────────┬─────────┐
//! │ slack ...    │ size u32 │ begin u32│ tag u32  │ !tag u32│ payload │
//! └──────────────┴──────────┴──────────┴──────────┴─────────┴─────────┘
//! ^ begin                                                   ^ returned
//! ```

use dataview::Pod;
use platform_cast::CastFrom as _;

use crate::address::{BLOCK_SIZE, Checksum, HEADER_ALIGNMENT, align_up};

/// Link value meaning "no neighbour".
const NIL: u32 = u32::MAX;

/// Size of a [`FreeNode`] record.
pub(crate) const FREE_NODE_SIZE: usize = size_of::<FreeNode>();

/// Size of a [`BlockHeader`] record.
pub(crate) const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// A free node is only split off when more than this many bytes remain.
pub(crate) const MIN_FREE_FRAGMENT: usize = FREE_NODE_SIZE + BLOCK_SIZE;

const _: () = assert!(FREE_NODE_SIZE == HEADER_ALIGNMENT);
const _: () = assert!(HEADER_SIZE == BLOCK_SIZE);

/// Record stored at the start of every free fragment.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
pub(crate) struct FreeNode {
    prev: u32,
    next: u32,
    size: u32,
    tag: u32,
}

/// Decoded neighbours of a free node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Links {
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
}

impl FreeNode {
    /// Builds the record for a node at `offset` covering `size` bytes.
    pub(crate) fn seal<C>(offset: usize, links: Links, size: usize) -> Self
    where
        C: Checksum,
    {
        let size = narrow(size);
        Self {
            prev: links.prev.map_or(NIL, narrow),
            next: links.next.map_or(NIL, narrow),
            size,
            tag: C::tag(narrow(offset), size),
        }
    }

    /// Decodes the record read at `offset`, or `None` if its tag does not
    /// match.
    pub(crate) fn open<C>(&self, offset: usize) -> Option<(Links, usize)>
    where
        C: Checksum,
    {
        if C::tag(narrow(offset), self.size) != self.tag {
            return None;
        }
        let link = |raw: u32| (raw != NIL).then(|| widen(raw));
        let links = Links {
            prev: link(self.prev),
            next: link(self.next),
        };
        Some((links, widen(self.size)))
    }
}

/// Record stored immediately before every allocation's payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
pub(crate) struct BlockHeader {
    size: u32,
    begin: u32,
    tag: u32,
    padding: u32,
}

impl BlockHeader {
    /// Builds the header at `offset` for a block occupying `size` bytes from
    /// `begin`.
    pub(crate) fn seal<C>(offset: usize, begin: usize, size: usize) -> Self
    where
        C: Checksum,
    {
        let size = narrow(size);
        let tag = C::tag(narrow(offset), size);
        Self {
            size,
            begin: narrow(begin),
            tag,
            padding: !tag,
        }
    }

    /// Returns `(begin, size)` of the block if both the tag and its
    /// complement match.
    pub(crate) fn open<C>(&self, offset: usize) -> Option<(usize, usize)>
    where
        C: Checksum,
    {
        let tag = C::tag(narrow(offset), self.size);
        if tag != self.tag || self.padding != !tag {
            return None;
        }
        Some((widen(self.begin), widen(self.size)))
    }
}

/// Positions computed for carving an allocation out of a free fragment.
///
/// All values are real addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AllocBlock {
    /// Start of the free fragment the block is carved from.
    pub(crate) begin: usize,
    /// Location of the block header.
    pub(crate) header: usize,
    /// Address handed out to the caller.
    pub(crate) alloc: usize,
    /// End of the occupied span, aligned to [`HEADER_ALIGNMENT`].
    pub(crate) end: usize,
}

impl AllocBlock {
    /// Lays out a `size`-byte allocation aligned to `align` in a fragment
    /// starting at `begin`.
    ///
    /// Returns `None` on address overflow.
    pub(crate) fn compute(begin: usize, size: usize, align: usize) -> Option<Self> {
        let mut header = align_up(begin, HEADER_ALIGNMENT)?;
        let alloc = align_up(header.checked_add(HEADER_SIZE)?, align)?;
        let end = align_up(alloc.checked_add(size)?, HEADER_ALIGNMENT)?;

        // Pack the header against the payload instead of leaving the
        // alignment slack between them.
        if alloc - header > BLOCK_SIZE {
            header = alloc - BLOCK_SIZE;
        }

        Some(Self {
            begin,
            header,
            alloc,
            end,
        })
    }

    /// Number of bytes between the fragment start and the block end.
    pub(crate) fn span(&self) -> usize {
        self.end - self.begin
    }
}

/// Narrows an in-heap offset or size to its stored width.
///
/// Heaps are limited to `u32::MAX` bytes, so this never truncates.
#[expect(clippy::cast_possible_truncation)]
fn narrow(value: usize) -> u32 {
    debug_assert!(u32::try_from(value).is_ok(), "{value:#x} exceeds u32");
    value as u32
}

fn widen(value: u32) -> usize {
    usize::cast_from(value)
}
