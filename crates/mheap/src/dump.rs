//! Human-readable listing of a heap's free fragments.

use core::fmt;

use crate::{address::Checksum, heap::Heap};

/// [`Display`](fmt::Display) adapter returned by [`Heap::dump`].
///
/// ```text
/// heap main, 2 fragments
/// {
///   block(0) address:0x55d0c2a1f010 size:(224 bytes, 0 KiB, 0.000 MiB)
///   block(1) address:0x55d0c2a1f230 size:(3552 bytes, 3 KiB, 0.003 MiB)
/// }
/// ```
///
/// When walking the list disagrees with the heap's counters, or the walk
/// hits a corrupted node, a line starting with `!!` is emitted before the
/// closing brace.
pub struct HeapDump<'a, C> {
    heap: &'a Heap<C>,
}

impl<'a, C> HeapDump<'a, C> {
    pub(crate) fn new(heap: &'a Heap<C>) -> Self {
        Self { heap }
    }
}

impl<C> fmt::Display for HeapDump<'_, C>
where
    C: Checksum,
{
    #[expect(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.heap;
        writeln!(
            f,
            "heap {}, {} fragments",
            heap.name(),
            heap.fragment_count()
        )?;
        writeln!(f, "{{")?;

        let mut count = 0;
        let mut bytes = 0;
        for fragment in heap.fragments() {
            let fragment = match fragment {
                Ok(fragment) => fragment,
                Err(err) => {
                    writeln!(f, "  !! {err}")?;
                    return writeln!(f, "}}");
                }
            };
            let size = fragment.size();
            writeln!(
                f,
                "  block({count}) address:{:#x} size:({size} bytes, {} KiB, {:6.3} MiB)",
                fragment.addr(),
                size / 1024,
                size as f64 / (1024.0 * 1024.0),
            )?;
            count += 1;
            bytes += size;
        }

        if count != heap.fragment_count() || bytes != heap.free_bytes() {
            writeln!(
                f,
                "  !! walked {count} fragments / {bytes} bytes, expected {} / {}",
                heap.fragment_count(),
                heap.free_bytes()
            )?;
        }
        writeln!(f, "}}")
    }
}
