//! Single-heap allocation engine.
//!
//! A [`Heap`] owns one backing buffer and serves allocations out of it with
//! an intrusive, address-ordered, doubly linked free list.
//!
//! # Algorithm
//!
//! - **Free list**: every free fragment starts with a free node holding its
//!   size, its neighbours and a corruption tag. Nodes are kept sorted by
//!   address and adjacent nodes are always merged.
//! - **Allocation**: the free list is searched with the heap's
//!   [`FitStrategy`]. The chosen fragment is either shrunk from the front or,
//!   when the remainder would be too small to be useful, consumed entirely.
//!   A block header recording the true start and size of the occupied span
//!   is written right before the returned address.
//! - **Deallocation**: the block header is verified, then the block is
//!   merged into the free node that follows it, the free node that precedes
//!   it (and, transitively, the one after that), or inserted as a new node.
//!
//! # Memory Layout
//!
//! ```text
//! buffer:  ┌───────┬──────────────┬─────────────────┬──────────────┬─────┐
//!          │ waste │ block A      │ free fragment   │ block B      │ ... │
//!          └───────┴──────────────┴─────────────────┴──────────────┴─────┘
//!          ^ base  ^ start (aligned to 16)
//! ```
//!
//! Free nodes and block headers store offsets from `base`, so a heap can be
//! at most `u32::MAX` bytes large.

use alloc::{boxed::Box, string::String};
use core::{fmt, marker::PhantomData, str::FromStr};

use arrayvec::ArrayString;
use dataview::DataView;
use snafu::{OptionExt as _, Snafu, ensure};

use crate::{
    address::{AddressXor, BLOCK_SIZE, Checksum, HEADER_ALIGNMENT, HeapAddr, align_up},
    dump::HeapDump,
    error::Location,
    layout::{
        AllocBlock, BlockHeader, FREE_NODE_SIZE, FreeNode, HEADER_SIZE, Links, MIN_FREE_FRAGMENT,
    },
};

/// Maximum length of a heap name in bytes.
pub const NAME_CAPACITY: usize = 32;

/// Largest backing buffer a heap can manage.
pub const MAX_HEAP_SIZE: usize = u32::MAX as usize;

/// Bounded heap name.
pub type HeapName = ArrayString<NAME_CAPACITY>;

/// Policy used to pick the free fragment that serves a request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum FitStrategy {
    /// Take the first fragment, in address order, that fits.
    #[display("first-fit")]
    FirstFit,
    /// Take the smallest fragment that fits.
    #[default]
    #[display("best-fit")]
    BestFit,
}

/// Error returned when parsing a [`FitStrategy`] fails.
#[derive(Debug, Snafu)]
#[snafu(display("unknown fit strategy {input:?}, expected `first-fit` or `best-fit`"))]
pub struct ParseFitStrategyError {
    input: String,
    #[snafu(implicit)]
    location: Location,
}

impl FromStr for FitStrategy {
    type Err = ParseFitStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" | "first-fit" => Ok(Self::FirstFit),
            "best" | "best-fit" => Ok(Self::BestFit),
            _ => ParseFitStrategySnafu { input: s }.fail(),
        }
    }
}

/// In-buffer record kinds checked for corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Record {
    #[display("free node")]
    FreeNode,
    #[display("block header")]
    BlockHeader,
}

/// Why a free request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum InvalidFreeReason {
    #[display("address outside the heap")]
    OutOfBounds,
    #[display("address not aligned to 16 bytes")]
    Misaligned,
    #[display("block is already free")]
    DoubleFree,
}

/// Errors raised while creating a heap.
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum HeapInitError {
    #[snafu(display("heap name {name:?} is longer than 32 bytes"))]
    NameTooLong {
        name: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("buffer of {size} bytes cannot hold a free node once aligned"))]
    BufferTooSmall {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("buffer of {size} bytes is larger than a heap can address"))]
    BufferTooLarge {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Errors raised by heap operations.
///
/// Only [`OutOfMemory`](HeapError::OutOfMemory) is an expected outcome;
/// every other variant means the caller or the heap contents are broken.
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum HeapError {
    #[snafu(display("heap {heap}: no free fragment fits {size} bytes aligned to {align}"))]
    OutOfMemory {
        heap: HeapName,
        size: usize,
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap {heap}: corrupted {record} at {addr:#x}"))]
    Corrupted {
        heap: HeapName,
        record: Record,
        addr: HeapAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap {heap}: invalid free of {addr:#x}: {reason}"))]
    InvalidFree {
        heap: HeapName,
        addr: HeapAddr,
        reason: InvalidFreeReason,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap {heap} is unusable after earlier corruption"))]
    Poisoned {
        heap: HeapName,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap {heap}: free list inconsistent: {detail}"))]
    Inconsistent {
        heap: HeapName,
        detail: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
}

impl HeapError {
    /// Returns `false` only for errors the caller is expected to recover
    /// from.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::OutOfMemory { .. })
    }
}

/// A free fragment as seen while walking the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    addr: HeapAddr,
    size: usize,
    offset: usize,
    links: Links,
}

impl Fragment {
    /// Address of the first byte of the fragment.
    #[must_use]
    pub fn addr(&self) -> HeapAddr {
        self.addr
    }

    /// Size of the fragment in bytes, node included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Address one past the last byte of the fragment.
    #[must_use]
    pub fn end(&self) -> HeapAddr {
        HeapAddr::new(self.addr.value() + self.size)
    }
}

/// Where a freed block goes in the free list.
enum Placement {
    /// The block ends where this fragment starts.
    Forward(Fragment),
    /// The block starts where this fragment ends; the second fragment, if
    /// any, starts where the block ends.
    Backward(Fragment, Option<Fragment>),
    /// The block becomes a new fragment between these neighbours.
    Insert(Links),
}

/// An independently managed memory pool backed by a single buffer.
///
/// `C` selects the corruption tag written into every record.
pub struct Heap<C = AddressXor> {
    name: HeapName,
    buffer: Box<[u8]>,
    /// Address of `buffer[0]`.
    base: usize,
    /// Offset of the first usable byte.
    start: usize,
    free_bytes: usize,
    fragments: usize,
    head: Option<usize>,
    strategy: FitStrategy,
    poisoned: bool,
    checksum: PhantomData<fn() -> C>,
}

impl<C> fmt::Debug for Heap<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("name", &self.name)
            .field("base", &HeapAddr::new(self.base))
            .field("size", &self.buffer.len())
            .field("free_bytes", &self.free_bytes)
            .field("fragments", &self.fragments)
            .field("strategy", &self.strategy)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl<C> Heap<C>
where
    C: Checksum,
{
    /// Creates a heap managing `buffer`.
    ///
    /// The start of the buffer is aligned up to 16 bytes; the skipped bytes
    /// are never used. The rest becomes a single free fragment.
    ///
    /// # Examples
    ///
    /// ```
    /// use mheap::heap::Heap;
    ///
    /// let heap: Heap = Heap::new("scratch", vec![0; 4096].into_boxed_slice()).unwrap();
    /// assert_eq!(heap.fragment_count(), 1);
    /// assert_eq!(heap.free_bytes(), heap.usable_size());
    /// ```
    pub fn new(name: &str, buffer: Box<[u8]>) -> Result<Self, HeapInitError> {
        #[expect(clippy::wildcard_imports)]
        use self::heap_init_error::*;

        let heap_name = HeapName::from(name).ok().context(NameTooLongSnafu { name })?;

        let size = buffer.len();
        ensure!(size <= MAX_HEAP_SIZE, BufferTooLargeSnafu { size });

        let base = buffer.as_ptr().addr();
        let start = align_up(base, HEADER_ALIGNMENT)
            .map(|aligned| aligned - base)
            .filter(|&start| start + FREE_NODE_SIZE <= size)
            .context(BufferTooSmallSnafu { size })?;
        let usable = size - start;

        let mut heap = Self {
            name: heap_name,
            buffer,
            base,
            start,
            free_bytes: usable,
            fragments: 1,
            head: Some(start),
            strategy: FitStrategy::default(),
            poisoned: false,
            checksum: PhantomData,
        };
        heap.write_node(start, Links::default(), usable);
        Ok(heap)
    }

    /// Returns the heap with its fit strategy replaced.
    #[must_use]
    pub fn with_strategy(mut self, strategy: FitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Returns the heap name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the size of the backing buffer.
    #[must_use]
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the backing buffer.
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Returns the address of the first byte of the backing buffer.
    #[must_use]
    pub fn base(&self) -> HeapAddr {
        HeapAddr::new(self.base)
    }

    /// Returns the buffer size minus the bytes lost to aligning its start.
    #[must_use]
    pub fn usable_size(&self) -> usize {
        self.buffer.len() - self.start
    }

    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    #[must_use]
    pub fn strategy(&self) -> FitStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: FitStrategy) {
        self.strategy = strategy;
    }

    /// Returns `true` once corruption has been detected in this heap.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Gives the backing buffer back, discarding the heap.
    #[must_use]
    pub fn into_buffer(self) -> Box<[u8]> {
        self.buffer
    }

    /// Returns `true` if `addr` lies strictly after the buffer start and
    /// before its end.
    #[must_use]
    pub fn inside_heap(&self, addr: HeapAddr) -> bool {
        addr.value() > self.base && addr.value() < self.base + self.buffer.len()
    }

    /// Iterates over the free fragments in address order.
    #[must_use]
    pub fn fragments(&self) -> Fragments<'_, C> {
        Fragments {
            heap: self,
            cursor: self.head,
            remaining: self.buffer.len() / FREE_NODE_SIZE + 1,
        }
    }

    /// Returns a printable listing of the free fragments.
    #[must_use]
    pub fn dump(&self) -> HeapDump<'_, C> {
        HeapDump::new(self)
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a non-zero multiple of 16.
    ///
    /// # Examples
    ///
    /// ```
    /// use mheap::heap::Heap;
    ///
    /// let mut heap: Heap = Heap::new("scratch", vec![0; 4096].into_boxed_slice()).unwrap();
    /// let addr = heap.alloc(100, 64).unwrap();
    /// assert!(addr.is_aligned(64));
    /// heap.free(addr).unwrap();
    /// assert_eq!(heap.free_bytes(), heap.usable_size());
    /// ```
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<HeapAddr, HeapError> {
        assert!(
            align > 0 && align.is_multiple_of(HEADER_ALIGNMENT),
            "alignment {align} must be a non-zero multiple of {HEADER_ALIGNMENT}"
        );
        self.guard(|heap| heap.alloc_block(size, align))
    }

    /// Returns the block starting at payload address `addr` to the heap.
    pub fn free(&mut self, addr: HeapAddr) -> Result<(), HeapError> {
        self.guard(|heap| heap.free_block(addr))
    }

    /// Returns the number of bytes the live allocation at `addr` occupies,
    /// header and alignment slack included.
    pub fn occupied_size(&self, addr: HeapAddr) -> Result<usize, HeapError> {
        let offset = self.payload_offset(addr)?;
        let (_begin, size) = self.read_header(addr, offset - HEADER_SIZE)?;
        Ok(size)
    }

    /// Returns `len` bytes of heap memory starting at `addr`, or `None` if
    /// the range is not inside the usable part of the heap.
    #[must_use]
    pub fn payload(&self, addr: HeapAddr, len: usize) -> Option<&[u8]> {
        let offset = self.payload_range_start(addr)?;
        self.buffer.get(offset..offset.checked_add(len)?)
    }

    /// Mutable variant of [`payload`](Self::payload).
    #[must_use]
    pub fn payload_mut(&mut self, addr: HeapAddr, len: usize) -> Option<&mut [u8]> {
        let offset = self.payload_range_start(addr)?;
        self.buffer.get_mut(offset..offset.checked_add(len)?)
    }

    /// Recounts the free list and compares it with the tracked counters.
    #[must_use]
    pub fn valid_heap(&self) -> bool {
        let mut count = 0;
        let mut bytes = 0;
        for fragment in self.fragments() {
            let Ok(fragment) = fragment else {
                return false;
            };
            count += 1;
            bytes += fragment.size;
        }
        count == self.fragments && bytes == self.free_bytes
    }

    /// Verifies every structural property of the free list: tags, back
    /// links, address order, coalescing and counters.
    pub fn check_invariants(&self) -> Result<(), HeapError> {
        #[expect(clippy::wildcard_imports)]
        use self::heap_error::*;

        let inconsistent = |detail| InconsistentSnafu {
            heap: self.name,
            detail,
        };

        let mut previous: Option<Fragment> = None;
        let mut count = 0;
        let mut bytes = 0;
        for fragment in self.fragments() {
            let fragment = fragment?;
            ensure!(
                fragment.links.prev == previous.map(|p| p.offset),
                inconsistent("broken back link")
            );
            if let Some(previous) = previous {
                let previous_end = previous.offset + previous.size;
                ensure!(
                    previous_end <= fragment.offset,
                    inconsistent("fragments out of order")
                );
                ensure!(
                    previous_end != fragment.offset,
                    inconsistent("adjacent fragments not merged")
                );
            }
            count += 1;
            bytes += fragment.size;
            previous = Some(fragment);
        }
        ensure!(
            count == self.fragments,
            inconsistent("fragment count mismatch")
        );
        ensure!(
            bytes == self.free_bytes,
            inconsistent("free byte count mismatch")
        );
        Ok(())
    }

    fn guard<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, HeapError>,
    ) -> Result<T, HeapError> {
        ensure!(!self.poisoned, heap_error::PoisonedSnafu { heap: self.name });
        let result = op(self);
        if matches!(result, Err(HeapError::Corrupted { .. })) {
            self.poisoned = true;
        }
        result
    }

    fn alloc_block(&mut self, size: usize, align: usize) -> Result<HeapAddr, HeapError> {
        let Some((fragment, block)) = self.select(size.max(BLOCK_SIZE), align)? else {
            return heap_error::OutOfMemorySnafu {
                heap: self.name,
                size,
                align,
            }
            .fail();
        };

        let begin = fragment.offset;
        let mut occupied = block.span();
        let left = fragment.size - occupied;
        if left > MIN_FREE_FRAGMENT {
            // shrink the fragment from the front
            let rest = begin + occupied;
            self.write_node(rest, fragment.links, left);
            self.relink(fragment.links, Some(rest))?;
        } else {
            occupied = fragment.size;
            self.relink(fragment.links, None)?;
            self.fragments -= 1;
        }

        self.write_header(block.header - self.base, begin, occupied);
        self.free_bytes -= occupied;
        Ok(HeapAddr::new(block.alloc))
    }

    fn select(
        &self,
        size: usize,
        align: usize,
    ) -> Result<Option<(Fragment, AllocBlock)>, HeapError> {
        let mut selected: Option<(Fragment, AllocBlock)> = None;
        for fragment in self.fragments() {
            let fragment = fragment?;
            let Some(block) = Self::fit(&fragment, size, align) else {
                continue;
            };
            match self.strategy {
                FitStrategy::FirstFit => return Ok(Some((fragment, block))),
                FitStrategy::BestFit => {
                    if selected.is_none_or(|(best, _)| fragment.size < best.size) {
                        selected = Some((fragment, block));
                    }
                }
            }
        }
        Ok(selected)
    }

    fn fit(fragment: &Fragment, size: usize, align: usize) -> Option<AllocBlock> {
        if size > fragment.size {
            return None;
        }
        let block = AllocBlock::compute(fragment.addr.value(), size, align)?;
        (block.span() <= fragment.size).then_some(block)
    }

    fn free_block(&mut self, addr: HeapAddr) -> Result<(), HeapError> {
        let offset = self.payload_offset(addr)?;
        let (begin, size) = self.read_header(addr, offset - HEADER_SIZE)?;

        match self.place(addr, begin, size)? {
            Placement::Forward(next) => {
                self.write_node(begin, next.links, size + next.size);
                self.relink(next.links, Some(begin))?;
            }
            Placement::Backward(prev, follower) => {
                let mut links = prev.links;
                let mut merged = prev.size + size;
                if let Some(follower) = follower {
                    merged += follower.size;
                    links.next = follower.links.next;
                    if let Some(after) = follower.links.next {
                        self.update_links(after, |l| l.prev = Some(prev.offset))?;
                    }
                    self.fragments -= 1;
                }
                self.write_node(prev.offset, links, merged);
            }
            Placement::Insert(links) => {
                self.write_node(begin, links, size);
                match links.prev {
                    Some(prev) => self.update_links(prev, |l| l.next = Some(begin))?,
                    None => self.head = Some(begin),
                }
                if let Some(next) = links.next {
                    self.update_links(next, |l| l.prev = Some(begin))?;
                }
                self.fragments += 1;
            }
        }

        self.free_bytes += size;
        Ok(())
    }

    fn place(&self, addr: HeapAddr, begin: usize, size: usize) -> Result<Placement, HeapError> {
        let end = begin + size;
        let mut last = None;
        for fragment in self.fragments() {
            let fragment = fragment?;
            let fragment_end = fragment.offset + fragment.size;
            ensure!(
                end <= fragment.offset || fragment_end <= begin,
                heap_error::InvalidFreeSnafu {
                    heap: self.name,
                    addr,
                    reason: InvalidFreeReason::DoubleFree,
                }
            );

            if fragment.offset == end {
                return Ok(Placement::Forward(fragment));
            }
            if fragment_end == begin {
                let follower = fragment
                    .links
                    .next
                    .filter(|&next| next == end)
                    .map(|next| self.read_node(next))
                    .transpose()?;
                return Ok(Placement::Backward(fragment, follower));
            }
            if fragment.offset > begin {
                return Ok(Placement::Insert(Links {
                    prev: fragment.links.prev,
                    next: Some(fragment.offset),
                }));
            }
            last = Some(fragment.offset);
        }
        Ok(Placement::Insert(Links {
            prev: last,
            next: None,
        }))
    }

    /// Points the neighbours in `links` at `node`, or at each other when
    /// `node` is `None`.
    fn relink(&mut self, links: Links, node: Option<usize>) -> Result<(), HeapError> {
        match links.prev {
            Some(prev) => self.update_links(prev, |l| l.next = node.or(links.next))?,
            None => self.head = node.or(links.next),
        }
        if let Some(next) = links.next {
            self.update_links(next, |l| l.prev = node.or(links.prev))?;
        }
        Ok(())
    }

    fn update_links(
        &mut self,
        offset: usize,
        update: impl FnOnce(&mut Links),
    ) -> Result<(), HeapError> {
        let mut fragment = self.read_node(offset)?;
        update(&mut fragment.links);
        self.write_node(offset, fragment.links, fragment.size);
        Ok(())
    }

    fn read_node(&self, offset: usize) -> Result<Fragment, HeapError> {
        let (links, size) = DataView::from(&*self.buffer)
            .try_read::<FreeNode>(offset)
            .filter(|_| offset >= self.start)
            .and_then(|node| node.open::<C>(offset))
            .filter(|&(_, size)| {
                size >= FREE_NODE_SIZE
                    && offset
                        .checked_add(size)
                        .is_some_and(|end| end <= self.buffer.len())
            })
            .context(heap_error::CorruptedSnafu {
                heap: self.name,
                record: Record::FreeNode,
                addr: self.addr_of(offset),
            })?;
        Ok(Fragment {
            addr: self.addr_of(offset),
            size,
            offset,
            links,
        })
    }

    fn write_node(&mut self, offset: usize, links: Links, size: usize) {
        let node = FreeNode::seal::<C>(offset, links, size);
        DataView::from_mut(&mut *self.buffer).write(offset, &node);
    }

    /// Reads and verifies the header at `offset` belonging to payload `addr`.
    fn read_header(&self, addr: HeapAddr, offset: usize) -> Result<(usize, usize), HeapError> {
        let payload = offset + HEADER_SIZE;
        let header = DataView::from(&*self.buffer)
            .try_read::<BlockHeader>(offset)
            .and_then(|header| header.open::<C>(offset))
            .filter(|&(begin, size)| {
                begin >= self.start
                    && begin <= offset
                    && self.addr_of(begin).is_aligned(HEADER_ALIGNMENT)
                    && begin
                        .checked_add(size)
                        .is_some_and(|end| end > payload && end <= self.buffer.len())
            });
        if let Some(header) = header {
            return Ok(header);
        }

        // A header overwritten by a free node means the block was freed
        // already.
        let freed = self.fragments().try_fold(false, |found, fragment| {
            let fragment = fragment?;
            Ok::<_, HeapError>(
                found || (fragment.offset <= offset && offset < fragment.offset + fragment.size),
            )
        })?;
        if freed {
            return heap_error::InvalidFreeSnafu {
                heap: self.name,
                addr,
                reason: InvalidFreeReason::DoubleFree,
            }
            .fail();
        }
        heap_error::CorruptedSnafu {
            heap: self.name,
            record: Record::BlockHeader,
            addr: self.addr_of(offset),
        }
        .fail()
    }

    fn write_header(&mut self, offset: usize, begin: usize, size: usize) {
        let header = BlockHeader::seal::<C>(offset, begin, size);
        DataView::from_mut(&mut *self.buffer).write(offset, &header);
    }

    /// Validates a payload address handed to `free` and returns its offset.
    fn payload_offset(&self, addr: HeapAddr) -> Result<usize, HeapError> {
        let invalid = |reason| heap_error::InvalidFreeSnafu {
            heap: self.name,
            addr,
            reason,
        };
        let offset = addr
            .value()
            .checked_sub(self.base)
            .filter(|&offset| offset >= self.start + HEADER_SIZE && offset < self.buffer.len())
            .context(invalid(InvalidFreeReason::OutOfBounds))?;
        ensure!(
            addr.is_aligned(HEADER_ALIGNMENT),
            invalid(InvalidFreeReason::Misaligned)
        );
        Ok(offset)
    }

    fn payload_range_start(&self, addr: HeapAddr) -> Option<usize> {
        addr.value()
            .checked_sub(self.base)
            .filter(|&offset| offset >= self.start + HEADER_SIZE)
    }

    fn addr_of(&self, offset: usize) -> HeapAddr {
        HeapAddr::new(self.base + offset)
    }
}

/// Iterator over the free fragments of a heap, created by
/// [`Heap::fragments`].
///
/// Yields an error and stops when a corrupted free node is reached or the
/// list does not terminate.
pub struct Fragments<'a, C> {
    heap: &'a Heap<C>,
    cursor: Option<usize>,
    remaining: usize,
}

impl<C> Iterator for Fragments<'_, C>
where
    C: Checksum,
{
    type Item = Result<Fragment, HeapError>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.cursor.take()?;
        if self.remaining == 0 {
            return Some(
                heap_error::InconsistentSnafu {
                    heap: self.heap.name,
                    detail: "free list does not terminate",
                }
                .fail(),
            );
        }
        self.remaining -= 1;

        let fragment = self.heap.read_node(offset);
        if let Ok(fragment) = &fragment {
            self.cursor = fragment.links.next;
        }
        Some(fragment)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn test_heap(size: usize) -> Heap {
        let buffer = vec![0x11; size].into_boxed_slice();
        Heap::new("test", buffer).unwrap()
    }

    fn with_test_heap<F>(size: usize, strategy: FitStrategy, test_fn: F)
    where
        F: FnOnce(&mut Heap),
    {
        let mut heap = test_heap(size).with_strategy(strategy);
        test_fn(&mut heap);
        heap.check_invariants().unwrap();
        assert!(heap.valid_heap());
    }

    fn fill(heap: &mut Heap, addr: HeapAddr, len: usize, byte: u8) {
        heap.payload_mut(addr, len).unwrap().fill(byte);
    }

    fn assert_filled(heap: &Heap, addr: HeapAddr, len: usize, byte: u8) {
        assert!(heap.payload(addr, len).unwrap().iter().all(|&b| b == byte));
    }

    fn fragment_spans(heap: &Heap) -> Vec<(HeapAddr, usize)> {
        heap.fragments()
            .map(|fragment| fragment.map(|f| (f.addr(), f.size())).unwrap())
            .collect()
    }

    #[test]
    fn test_new_heap() {
        let heap = test_heap(1024);
        assert_eq!(heap.name(), "test");
        assert_eq!(heap.size(), 1024);
        assert_eq!(heap.fragment_count(), 1);
        assert!(heap.size() - heap.usable_size() < HEADER_ALIGNMENT);
        assert_eq!(heap.free_bytes(), heap.usable_size());
        assert_eq!(heap.strategy(), FitStrategy::BestFit);
        assert!(heap.valid_heap());
        heap.check_invariants().unwrap();

        let spans = fragment_spans(&heap);
        assert_eq!(spans.len(), 1);
        assert!(spans[0].0.is_aligned(HEADER_ALIGNMENT));
        assert_eq!(spans[0].1, heap.usable_size());
    }

    #[test]
    fn test_new_heap_rejects_tiny_buffer() {
        let err = Heap::<AddressXor>::new("tiny", vec![0; 8].into_boxed_slice()).unwrap_err();
        assert!(matches!(err, HeapInitError::BufferTooSmall { size: 8, .. }));
    }

    #[test]
    fn test_new_heap_rejects_long_name() {
        let name = "x".repeat(NAME_CAPACITY + 1);
        let err = Heap::<AddressXor>::new(&name, vec![0; 64].into_boxed_slice()).unwrap_err();
        assert!(matches!(err, HeapInitError::NameTooLong { .. }));

        let name = "x".repeat(NAME_CAPACITY);
        let heap = Heap::<AddressXor>::new(&name, vec![0; 64].into_boxed_slice()).unwrap();
        assert_eq!(heap.name(), name);
    }

    #[test]
    fn test_alloc_free_round_trip() {
        with_test_heap(1040, FitStrategy::BestFit, |heap| {
            let usable = heap.usable_size();
            let addr = heap.alloc(100, 16).unwrap();
            assert!(addr.is_aligned(16));
            assert_eq!(heap.occupied_size(addr).unwrap(), 128);
            assert_eq!(heap.free_bytes(), usable - 128);
            assert_eq!(heap.fragment_count(), 1);

            heap.free(addr).unwrap();
            assert_eq!(heap.fragment_count(), 1);
            assert_eq!(heap.free_bytes(), usable);
        });
    }

    #[test]
    fn test_round_trip_small_sizes() {
        with_test_heap(1024, FitStrategy::FirstFit, |heap| {
            let usable = heap.usable_size();
            for size in 0..=64 {
                let addr = heap.alloc(size, 16).unwrap();
                assert!(heap.occupied_size(addr).unwrap() >= HEADER_SIZE + BLOCK_SIZE);
                heap.free(addr).unwrap();
                assert_eq!(heap.fragment_count(), 1);
                assert_eq!(heap.free_bytes(), usable);
            }
        });
    }

    #[test]
    fn test_free_gap_between_allocations() {
        with_test_heap(2048, FitStrategy::BestFit, |heap| {
            let usable = heap.usable_size();
            let first = heap.alloc(200, 16).unwrap();
            let second = heap.alloc(300, 16).unwrap();
            assert_eq!(heap.occupied_size(first).unwrap(), 224);
            assert_eq!(heap.occupied_size(second).unwrap(), 320);
            assert_eq!(heap.fragment_count(), 1);

            heap.free(first).unwrap();
            assert_eq!(heap.fragment_count(), 2);
            assert_eq!(heap.free_bytes(), usable - 320);

            heap.free(second).unwrap();
            assert_eq!(heap.fragment_count(), 1);
            assert_eq!(heap.free_bytes(), usable);
            assert_eq!(fragment_spans(heap)[0].1, usable);
        });
    }

    #[test]
    fn test_alignment() {
        with_test_heap(4096, FitStrategy::FirstFit, |heap| {
            let usable = heap.usable_size();
            let mut addrs = Vec::new();
            for align in [16, 32, 48, 64, 128, 256] {
                let addr = heap.alloc(24, align).unwrap();
                assert!(addr.is_aligned(align), "{addr:#x} not aligned to {align}");
                fill(heap, addr, 24, 0x33);
                addrs.push(addr);
            }
            for addr in addrs {
                assert_filled(heap, addr, 24, 0x33);
                heap.free(addr).unwrap();
            }
            assert_eq!(heap.free_bytes(), usable);
            assert_eq!(heap.fragment_count(), 1);
        });
    }

    #[test]
    #[should_panic(expected = "must be a non-zero multiple of 16")]
    fn test_alloc_rejects_small_alignment() {
        let mut heap = test_heap(1024);
        let _ = heap.alloc(16, 8);
    }

    #[test]
    #[should_panic(expected = "must be a non-zero multiple of 16")]
    fn test_alloc_rejects_zero_alignment() {
        let mut heap = test_heap(1024);
        let _ = heap.alloc(16, 0);
    }

    #[test]
    fn test_multiple_allocations_do_not_overlap() {
        with_test_heap(4096, FitStrategy::BestFit, |heap| {
            let sizes = [1, 17, 64, 100, 250, 31];
            let addrs: Vec<_> = sizes
                .iter()
                .map(|&size| heap.alloc(size, 16).unwrap())
                .collect();
            for (i, (&addr, &size)) in addrs.iter().zip(&sizes).enumerate() {
                fill(heap, addr, size, u8::try_from(i).unwrap());
            }
            for (i, (&addr, &size)) in addrs.iter().zip(&sizes).enumerate() {
                assert_filled(heap, addr, size, u8::try_from(i).unwrap());
            }
            for addr in addrs {
                heap.free(addr).unwrap();
            }
            assert_eq!(heap.fragment_count(), 1);
        });
    }

    #[test]
    fn test_best_fit_picks_smallest_fragment() {
        with_test_heap(2048, FitStrategy::BestFit, |heap| {
            let _a = heap.alloc(64, 16).unwrap();
            let b = heap.alloc(400, 16).unwrap();
            let _c = heap.alloc(64, 16).unwrap();
            let d = heap.alloc(100, 16).unwrap();
            let _e = heap.alloc(64, 16).unwrap();
            heap.free(b).unwrap();
            heap.free(d).unwrap();
            assert_eq!(heap.fragment_count(), 3);

            let addr = heap.alloc(90, 16).unwrap();
            assert_eq!(addr, d);
            assert_eq!(heap.fragment_count(), 2);
        });
    }

    #[test]
    fn test_first_fit_picks_lowest_fragment() {
        with_test_heap(2048, FitStrategy::FirstFit, |heap| {
            let _a = heap.alloc(64, 16).unwrap();
            let b = heap.alloc(400, 16).unwrap();
            let _c = heap.alloc(64, 16).unwrap();
            let d = heap.alloc(100, 16).unwrap();
            let _e = heap.alloc(64, 16).unwrap();
            heap.free(b).unwrap();
            heap.free(d).unwrap();

            let addr = heap.alloc(90, 16).unwrap();
            assert_eq!(addr, b);
            assert_eq!(heap.fragment_count(), 3);
        });
    }

    #[test]
    fn test_out_of_memory_leaves_heap_untouched() {
        with_test_heap(1024, FitStrategy::BestFit, |heap| {
            let _live = heap.alloc(200, 16).unwrap();
            let free_bytes = heap.free_bytes();
            let fragments = heap.fragment_count();
            let spans = fragment_spans(heap);

            let err = heap.alloc(free_bytes + 1, 16).unwrap_err();
            assert!(matches!(err, HeapError::OutOfMemory { .. }));
            assert!(!err.is_fatal());
            assert_eq!(heap.free_bytes(), free_bytes);
            assert_eq!(heap.fragment_count(), fragments);
            assert_eq!(fragment_spans(heap), spans);

            heap.alloc(usize::MAX, 16).unwrap_err();
            assert!(!heap.is_poisoned());
        });
    }

    #[test]
    fn test_allocate_entire_heap() {
        with_test_heap(1024, FitStrategy::BestFit, |heap| {
            let usable = heap.usable_size();
            let size = usable / HEADER_ALIGNMENT * HEADER_ALIGNMENT - HEADER_SIZE;
            let addr = heap.alloc(size, 16).unwrap();
            assert_eq!(heap.fragment_count(), 0);
            assert_eq!(heap.free_bytes(), 0);
            assert_eq!(heap.fragments().count(), 0);
            heap.alloc(1, 16).unwrap_err();

            heap.free(addr).unwrap();
            assert_eq!(heap.fragment_count(), 1);
            assert_eq!(heap.free_bytes(), usable);

            let addr = heap.alloc(size, 16).unwrap();
            heap.free(addr).unwrap();
        });
    }

    #[test]
    fn test_refill_exhausted_heap() {
        with_test_heap(1024, FitStrategy::FirstFit, |heap| {
            let usable = heap.usable_size();
            let first = heap.alloc(100, 16).unwrap();
            let rest = heap.free_bytes() / HEADER_ALIGNMENT * HEADER_ALIGNMENT - HEADER_SIZE;
            let second = heap.alloc(rest, 16).unwrap();
            assert_eq!(heap.fragment_count(), 0);

            heap.free(first).unwrap();
            assert_eq!(heap.fragment_count(), 1);
            heap.free(second).unwrap();
            assert_eq!(heap.fragment_count(), 1);
            assert_eq!(heap.free_bytes(), usable);
        });
    }

    #[test]
    fn test_coalescing_is_order_independent() {
        with_test_heap(2048, FitStrategy::BestFit, |heap| {
            let a = heap.alloc(200, 16).unwrap();
            let b = heap.alloc(300, 16).unwrap();
            heap.free(a).unwrap();
            heap.free(b).unwrap();
            let forward = fragment_spans(heap);

            assert_eq!(heap.alloc(200, 16).unwrap(), a);
            assert_eq!(heap.alloc(300, 16).unwrap(), b);
            heap.free(b).unwrap();
            heap.free(a).unwrap();
            let backward = fragment_spans(heap);

            assert_eq!(forward.len(), 1);
            assert_eq!(forward, backward);
        });
    }

    #[test]
    fn test_free_merges_both_neighbours() {
        with_test_heap(2048, FitStrategy::FirstFit, |heap| {
            let a = heap.alloc(64, 16).unwrap();
            let b = heap.alloc(64, 16).unwrap();
            let c = heap.alloc(64, 16).unwrap();
            let _d = heap.alloc(64, 16).unwrap();

            heap.free(a).unwrap();
            heap.free(c).unwrap();
            assert_eq!(heap.fragment_count(), 3);

            heap.free(b).unwrap();
            assert_eq!(heap.fragment_count(), 2);
            let spans = fragment_spans(heap);
            assert_eq!(spans[0].0.value(), a.value() - HEADER_SIZE);
            assert_eq!(spans[0].1, 3 * 80);
        });
    }

    #[test]
    fn test_fragments_are_sorted() {
        with_test_heap(4096, FitStrategy::FirstFit, |heap| {
            let addrs: Vec<_> = (0..8).map(|_| heap.alloc(48, 16).unwrap()).collect();
            for addr in addrs.iter().rev().step_by(2) {
                heap.free(*addr).unwrap();
            }
            let spans = fragment_spans(heap);
            assert_eq!(spans.len(), heap.fragment_count());
            assert!(spans.windows(2).all(|w| w[0].0.value() + w[0].1 < w[1].0.value()));
            assert_eq!(
                spans.iter().map(|&(_, size)| size).sum::<usize>(),
                heap.free_bytes()
            );
        });
    }

    #[test]
    fn test_reuse_after_free() {
        with_test_heap(1024, FitStrategy::FirstFit, |heap| {
            let a = heap.alloc(64, 16).unwrap();
            let b = heap.alloc(64, 16).unwrap();
            fill(heap, b, 64, 0x55);
            heap.free(a).unwrap();

            let c = heap.alloc(32, 16).unwrap();
            assert_eq!(c, a);
            assert_filled(heap, b, 64, 0x55);
            heap.free(b).unwrap();
            heap.free(c).unwrap();
        });
    }

    #[test]
    fn test_corrupted_tag_is_detected() {
        with_test_heap(1024, FitStrategy::BestFit, |heap| {
            let addr = heap.alloc(64, 16).unwrap();
            let free_bytes = heap.free_bytes();
            let spans = fragment_spans(heap);

            let tag = addr.value() - heap.base - HEADER_SIZE + 8;
            heap.buffer[tag] ^= 0x01;

            let err = heap.free(addr).unwrap_err();
            assert!(matches!(
                err,
                HeapError::Corrupted {
                    record: Record::BlockHeader,
                    ..
                }
            ));
            assert!(err.is_fatal());
            assert!(heap.is_poisoned());
            assert_eq!(heap.free_bytes(), free_bytes);
            assert_eq!(fragment_spans(heap), spans);

            assert!(matches!(
                heap.alloc(16, 16),
                Err(HeapError::Poisoned { .. })
            ));
            assert!(matches!(heap.free(addr), Err(HeapError::Poisoned { .. })));
        });
    }

    #[test]
    fn test_corrupted_padding_is_detected() {
        with_test_heap(1024, FitStrategy::BestFit, |heap| {
            let addr = heap.alloc(64, 16).unwrap();
            let padding = addr.value() - heap.base - HEADER_SIZE + 12;
            heap.buffer[padding + 3] ^= 0x80;

            assert!(matches!(
                heap.free(addr),
                Err(HeapError::Corrupted {
                    record: Record::BlockHeader,
                    ..
                })
            ));
            assert_eq!(heap.fragment_count(), 1);
        });
    }

    #[test]
    fn test_corrupted_free_node_is_detected() {
        let mut heap = test_heap(1024);
        let head = heap.head.unwrap();
        heap.buffer[head + 8] ^= 0x10;

        assert!(!heap.valid_heap());
        heap.check_invariants().unwrap_err();
        assert!(matches!(
            heap.alloc(16, 16),
            Err(HeapError::Corrupted {
                record: Record::FreeNode,
                ..
            })
        ));
        assert!(heap.is_poisoned());
    }

    #[test]
    fn test_invalid_free_addresses() {
        with_test_heap(1024, FitStrategy::BestFit, |heap| {
            let addr = heap.alloc(64, 16).unwrap();

            let misaligned = addr.checked_add(1).unwrap();
            assert!(matches!(
                heap.free(misaligned),
                Err(HeapError::InvalidFree {
                    reason: InvalidFreeReason::Misaligned,
                    ..
                })
            ));

            let outside = HeapAddr::new(heap.base().value() + heap.size() + 16);
            assert!(matches!(
                heap.free(outside),
                Err(HeapError::InvalidFree {
                    reason: InvalidFreeReason::OutOfBounds,
                    ..
                })
            ));

            assert!(matches!(
                heap.free(heap.base()),
                Err(HeapError::InvalidFree {
                    reason: InvalidFreeReason::OutOfBounds,
                    ..
                })
            ));

            assert!(!heap.is_poisoned());
            heap.free(addr).unwrap();
        });
    }

    #[test]
    fn test_double_free_is_rejected() {
        with_test_heap(1024, FitStrategy::FirstFit, |heap| {
            let a = heap.alloc(64, 16).unwrap();
            let b = heap.alloc(64, 16).unwrap();
            let c = heap.alloc(64, 16).unwrap();

            heap.free(a).unwrap();
            assert!(matches!(
                heap.free(a),
                Err(HeapError::InvalidFree {
                    reason: InvalidFreeReason::DoubleFree,
                    ..
                })
            ));

            heap.free(b).unwrap();
            assert!(matches!(
                heap.free(b),
                Err(HeapError::InvalidFree {
                    reason: InvalidFreeReason::DoubleFree,
                    ..
                })
            ));

            assert!(!heap.is_poisoned());
            heap.free(c).unwrap();
            assert_eq!(heap.fragment_count(), 1);
        });
    }

    #[test]
    fn test_inside_heap_is_strict() {
        let heap = test_heap(256);
        let base = heap.base().value();
        assert!(!heap.inside_heap(heap.base()));
        assert!(heap.inside_heap(HeapAddr::new(base + 1)));
        assert!(heap.inside_heap(HeapAddr::new(base + 255)));
        assert!(!heap.inside_heap(HeapAddr::new(base + 256)));
        assert!(!heap.inside_heap(HeapAddr::new(base - 1)));
    }

    #[test]
    fn test_payload_bounds() {
        let heap = test_heap(256);
        let start = heap.base().value() + heap.start + HEADER_SIZE;
        assert!(heap.payload(HeapAddr::new(start), 16).is_some());
        assert!(heap.payload(HeapAddr::new(start - 1), 1).is_none());
        assert!(heap.payload(HeapAddr::new(start), 256).is_none());
        assert!(heap.payload(HeapAddr::new(start), usize::MAX).is_none());
    }

    #[test]
    fn test_into_buffer() {
        let heap = test_heap(256);
        let base = heap.base();
        let buffer = heap.into_buffer();
        assert_eq!(buffer.len(), 256);
        assert_eq!(buffer.as_ptr().addr(), base.value());
    }

    #[test]
    fn test_parse_fit_strategy() {
        assert_eq!("first-fit".parse::<FitStrategy>().unwrap(), FitStrategy::FirstFit);
        assert_eq!("first".parse::<FitStrategy>().unwrap(), FitStrategy::FirstFit);
        assert_eq!("best-fit".parse::<FitStrategy>().unwrap(), FitStrategy::BestFit);
        assert_eq!("best".parse::<FitStrategy>().unwrap(), FitStrategy::BestFit);
        "worst".parse::<FitStrategy>().unwrap_err();
        assert_eq!(FitStrategy::FirstFit.to_string(), "first-fit");
    }
}
