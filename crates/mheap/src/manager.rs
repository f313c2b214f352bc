//! A fixed collection of heaps with an active-heap context.
//!
//! [`HeapManager`] owns up to [`MAX_HEAPS`] heaps. Allocations are served by
//! the *active* heap; frees can either target the active heap or let the
//! manager find the heap that owns the address. The active heap can be
//! switched directly, saved and restored through a bounded LIFO stack, or
//! switched for the lifetime of a [`HeapScope`] guard.

use alloc::{boxed::Box, collections::TryReserveError, string::String, vec::Vec};
use core::ops::{Deref, DerefMut};

use arrayvec::ArrayVec;
use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};

use crate::{
    address::{AddressXor, Checksum, HeapAddr},
    error::Location,
    heap::{FitStrategy, Heap, HeapError, HeapInitError, MAX_HEAP_SIZE},
};

/// Maximum number of heaps a manager can own.
pub const MAX_HEAPS: usize = 16;

/// Maximum number of saved contexts.
pub const CONTEXT_STACK_DEPTH: usize = 16;

/// Description of one heap to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig<'a> {
    pub name: &'a str,
    pub size: usize,
    pub strategy: FitStrategy,
}

impl<'a> HeapConfig<'a> {
    /// Creates a best-fit heap configuration.
    #[must_use]
    pub const fn new(name: &'a str, size: usize) -> Self {
        Self {
            name,
            size,
            strategy: FitStrategy::BestFit,
        }
    }

    #[must_use]
    pub const fn with_strategy(self, strategy: FitStrategy) -> Self {
        Self { strategy, ..self }
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ManagerInitError {
    #[snafu(display("at least one heap is required"))]
    NoHeaps {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{count} heaps requested, at most 16 are supported"))]
    TooManyHeaps {
        count: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap name {name:?} is used more than once"))]
    DuplicateName {
        name: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap {index} ({name:?}) of {size} bytes is larger than a heap can address"))]
    HeapTooLarge {
        index: usize,
        name: String,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to allocate {size} bytes for heap {index}"))]
    AllocBuffer {
        index: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
        source: TryReserveError,
    },
    #[snafu(display("failed to initialize heap {index}"))]
    InitHeap {
        index: usize,
        #[snafu(implicit)]
        location: Location,
        source: HeapInitError,
    },
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ManagerError {
    #[snafu(display("heap index {index} is out of range, {len} heaps exist"))]
    InvalidIndex {
        index: usize,
        len: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no heap named {name:?}"))]
    HeapNotFound {
        name: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no heap owns address {addr:#x}"))]
    OwnerNotFound {
        addr: HeapAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap context stack is full"))]
    ContextStackOverflow {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap context stack is empty"))]
    ContextStackUnderflow {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("operation on heap {index} failed"))]
    Heap {
        index: usize,
        #[snafu(implicit)]
        location: Location,
        source: HeapError,
    },
}

impl ManagerError {
    /// Returns `false` only when a heap ran out of memory.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Heap { source, .. } => source.is_fatal(),
            _ => true,
        }
    }
}

/// Owner of a fixed set of heaps.
///
/// # Examples
///
/// ```
/// use mheap::manager::{HeapConfig, HeapManager};
///
/// let mut manager: HeapManager =
///     HeapManager::new(&[HeapConfig::new("a", 4096), HeapConfig::new("b", 4096)]).unwrap();
/// assert_eq!(manager.active(), 1);
///
/// manager.use_heap(0).unwrap();
/// let addr = manager.alloc(64, 16).unwrap();
///
/// manager.use_heap(1).unwrap();
/// manager.free(addr).unwrap();
/// assert_eq!(manager.active(), 1);
/// assert_eq!(manager.last_owner(), 0);
/// ```
#[derive(Debug)]
pub struct HeapManager<C = AddressXor> {
    heaps: ArrayVec<Heap<C>, MAX_HEAPS>,
    active: usize,
    last_owner: usize,
    stack: ArrayVec<usize, CONTEXT_STACK_DEPTH>,
}

impl<C> HeapManager<C>
where
    C: Checksum,
{
    /// Allocates a buffer for every configuration and builds the heaps.
    ///
    /// The last heap is active afterwards. On failure everything created so
    /// far is released.
    pub fn new(configs: &[HeapConfig<'_>]) -> Result<Self, ManagerInitError> {
        #[expect(clippy::wildcard_imports)]
        use self::manager_init_error::*;

        ensure!(!configs.is_empty(), NoHeapsSnafu);
        ensure!(
            configs.len() <= MAX_HEAPS,
            TooManyHeapsSnafu {
                count: configs.len()
            }
        );
        for (index, config) in configs.iter().enumerate() {
            ensure!(
                config.size <= MAX_HEAP_SIZE,
                HeapTooLargeSnafu {
                    index,
                    name: config.name,
                    size: config.size,
                }
            );
            ensure!(
                !configs[..index].iter().any(|other| other.name == config.name),
                DuplicateNameSnafu { name: config.name }
            );
        }

        let mut heaps = ArrayVec::new();
        for (index, config) in configs.iter().enumerate() {
            let buffer = allocate_buffer(config.size).context(AllocBufferSnafu {
                index,
                size: config.size,
            })?;
            let heap = Heap::new(config.name, buffer)
                .context(InitHeapSnafu { index })?
                .with_strategy(config.strategy);
            heaps.push(heap);
        }

        let active = heaps.len() - 1;
        Ok(Self {
            heaps,
            active,
            last_owner: 0,
            stack: ArrayVec::new(),
        })
    }

    /// Releases every heap and its buffer.
    pub fn release(self) {
        drop(self);
    }

    #[must_use]
    pub fn heaps(&self) -> &[Heap<C>] {
        &self.heaps
    }

    #[must_use]
    pub fn heap(&self, index: usize) -> Option<&Heap<C>> {
        self.heaps.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heaps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heaps.is_empty()
    }

    /// Index of the heap serving allocations.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active
    }

    #[must_use]
    pub fn active_heap(&self) -> &Heap<C> {
        &self.heaps[self.active]
    }

    /// Index where the next owner lookup starts.
    #[must_use]
    pub fn last_owner(&self) -> usize {
        self.last_owner
    }

    /// Number of saved contexts.
    #[must_use]
    pub fn context_depth(&self) -> usize {
        self.stack.len()
    }

    /// Makes heap `index` the active heap.
    pub fn use_heap(&mut self, index: usize) -> Result<(), ManagerError> {
        self.check_index(index)?;
        self.active = index;
        Ok(())
    }

    /// Makes the heap called `name` the active heap and returns its index.
    pub fn use_heap_named(&mut self, name: &str) -> Result<usize, ManagerError> {
        let index = self
            .heaps
            .iter()
            .position(|heap| heap.name() == name)
            .context(manager_error::HeapNotFoundSnafu { name })?;
        self.active = index;
        Ok(index)
    }

    /// Saves the active index on the context stack and returns it.
    pub fn push_heap(&mut self) -> Result<usize, ManagerError> {
        self.stack
            .try_push(self.active)
            .ok()
            .context(manager_error::ContextStackOverflowSnafu)?;
        Ok(self.active)
    }

    /// Restores the most recently saved active index and returns it.
    pub fn pop_heap(&mut self) -> Result<usize, ManagerError> {
        let index = self
            .stack
            .pop()
            .context(manager_error::ContextStackUnderflowSnafu)?;
        self.active = index;
        Ok(index)
    }

    /// Switches to heap `index` until the returned guard is dropped.
    ///
    /// ```
    /// use mheap::manager::{HeapConfig, HeapManager};
    ///
    /// let mut manager: HeapManager =
    ///     HeapManager::new(&[HeapConfig::new("a", 1024), HeapConfig::new("b", 1024)]).unwrap();
    /// {
    ///     let scope = manager.enter_heap(0).unwrap();
    ///     assert_eq!(scope.active(), 0);
    /// }
    /// assert_eq!(manager.active(), 1);
    /// ```
    pub fn enter_heap(&mut self, index: usize) -> Result<HeapScope<'_, C>, ManagerError> {
        self.check_index(index)?;
        let depth = self.stack.len();
        self.push_heap()?;
        self.active = index;
        Ok(HeapScope {
            manager: self,
            depth,
        })
    }

    /// Returns the index of the heap containing `addr`.
    ///
    /// The scan starts at the last owner found and wraps around.
    #[must_use]
    pub fn find_heap(&self, addr: HeapAddr) -> Option<usize> {
        let count = self.heaps.len();
        (0..count)
            .map(|step| (self.last_owner + step) % count)
            .find(|&index| self.heaps[index].inside_heap(addr))
    }

    /// Allocates from the active heap.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a non-zero multiple of 16.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<HeapAddr, ManagerError> {
        let index = self.active;
        self.heaps[index]
            .alloc(size, align)
            .context(manager_error::HeapSnafu { index })
    }

    /// Frees `addr` in whichever heap owns it.
    ///
    /// The active heap is the same before and after the call.
    pub fn free(&mut self, addr: HeapAddr) -> Result<(), ManagerError> {
        let owner = self
            .find_heap(addr)
            .context(manager_error::OwnerNotFoundSnafu { addr })?;
        self.last_owner = owner;
        let mut scope = self.enter_heap(owner)?;
        scope.free_in_active(addr)
    }

    /// Frees `addr` in the active heap.
    pub fn free_in_active(&mut self, addr: HeapAddr) -> Result<(), ManagerError> {
        let index = self.active;
        self.heaps[index]
            .free(addr)
            .context(manager_error::HeapSnafu { index })
    }

    /// Returns `len` bytes at `addr` in the heap that owns it.
    #[must_use]
    pub fn payload(&self, addr: HeapAddr, len: usize) -> Option<&[u8]> {
        let index = self.find_heap(addr)?;
        self.heaps[index].payload(addr, len)
    }

    /// Mutable variant of [`payload`](Self::payload).
    #[must_use]
    pub fn payload_mut(&mut self, addr: HeapAddr, len: usize) -> Option<&mut [u8]> {
        let index = self.find_heap(addr)?;
        self.heaps[index].payload_mut(addr, len)
    }

    fn check_index(&self, index: usize) -> Result<(), ManagerError> {
        ensure!(
            index < self.heaps.len(),
            manager_error::InvalidIndexSnafu {
                index,
                len: self.heaps.len(),
            }
        );
        Ok(())
    }
}

fn allocate_buffer(size: usize) -> Result<Box<[u8]>, TryReserveError> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(size)?;
    buffer.resize(size, 0);
    Ok(buffer.into_boxed_slice())
}

/// Guard returned by [`HeapManager::enter_heap`].
///
/// Dereferences to the manager. Dropping it restores the active heap that
/// was current when the scope was entered.
#[derive(Debug)]
pub struct HeapScope<'a, C> {
    manager: &'a mut HeapManager<C>,
    depth: usize,
}

impl<C> Deref for HeapScope<'_, C> {
    type Target = HeapManager<C>;

    fn deref(&self) -> &Self::Target {
        self.manager
    }
}

impl<C> DerefMut for HeapScope<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.manager
    }
}

impl<C> Drop for HeapScope<'_, C> {
    fn drop(&mut self) {
        let stack = &mut self.manager.stack;
        if stack.len() > self.depth {
            stack.truncate(self.depth + 1);
            if let Some(active) = stack.pop() {
                self.manager.active = active;
            }
        }
    }
}
