//! Barrier-guarded state cells.
//!
//! All communication state is sharded: per-process slots ([PerProc]) and a
//! P×P matrix of per-direction cells ([CommMatrix]). Exclusive access to a
//! cell is a protocol property, not a lock: during a superstep a cell is
//! touched only by the process the protocol assigns it to, and the barrier
//! between phases publishes every write before the consuming side reads.
//! Each cell sits in its own [UnsafeCell], so handing out disjoint `&mut`s
//! to different cells from a shared reference stays within the aliasing
//! rules.

use crate::sync::{AtomicUsize, Ordering};
use core::cell::UnsafeCell;

/// One slot per process, indexed by pid.
pub(crate) struct PerProc<T> {
    slots: UnsafeCell<Vec<UnsafeCell<T>>>,
}

// Safety: slot access is serialized by the superstep protocol; see the
// safety contracts on the accessors.
unsafe impl<T: Send> Sync for PerProc<T> {}

impl<T> PerProc<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: UnsafeCell::new(Vec::new()),
        }
    }

    /// Drops all slots and builds `count` fresh ones.
    ///
    /// # Safety
    /// Callers must hold exclusive access to the whole array, i.e. call this
    /// only from the single-threaded window before workers are spawned.
    pub(crate) unsafe fn reset_resize_with(&self, count: usize, fill: impl FnMut() -> T) {
        let slots = &mut *self.slots.get();
        slots.clear();
        slots.extend(std::iter::repeat_with(fill).map(UnsafeCell::new).take(count));
    }

    /// # Safety
    /// See [reset_resize_with](PerProc::reset_resize_with).
    pub(crate) unsafe fn reset_resize(&self, count: usize)
    where
        T: Default,
    {
        self.reset_resize_with(count, T::default);
    }

    /// # Safety
    /// The slot must currently be owned by the caller under the superstep
    /// protocol, and no other reference to it may exist.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get_mut(&self, pid: usize) -> &mut T {
        let slots = &*self.slots.get();
        &mut *slots[pid].get()
    }

    /// # Safety
    /// No process may mutate the slot for as long as the reference lives;
    /// the barrier preceding the current phase must have published all
    /// writes to it.
    pub(crate) unsafe fn get(&self, pid: usize) -> &T {
        let slots = &*self.slots.get();
        &*slots[pid].get()
    }
}

/// A P×P matrix of per-direction cells, indexed by (from, to).
///
/// Cell `(from, to)` is owned by `from` while requests accumulate and by
/// `to` while they drain; the barrier between the two halves transfers
/// ownership. [from_me](CommMatrix::from_me) addresses the accumulating
/// side, [to_me](CommMatrix::to_me) the draining side.
pub(crate) struct CommMatrix<T> {
    cells: UnsafeCell<Vec<UnsafeCell<T>>>,
    procs: AtomicUsize,
}

// Safety: cell access is serialized by the superstep protocol; see the
// safety contracts on the accessors.
unsafe impl<T: Send> Sync for CommMatrix<T> {}

impl<T> CommMatrix<T> {
    pub(crate) fn new() -> Self {
        Self {
            cells: UnsafeCell::new(Vec::new()),
            procs: AtomicUsize::new(0),
        }
    }

    /// Drops all cells and builds a fresh `procs` × `procs` matrix.
    ///
    /// # Safety
    /// Callers must hold exclusive access to the whole matrix, i.e. call
    /// this only from the single-threaded window before workers are spawned.
    pub(crate) unsafe fn reset_resize(&self, procs: usize)
    where
        T: Default,
    {
        let cells = &mut *self.cells.get();
        cells.clear();
        cells.extend(
            std::iter::repeat_with(|| UnsafeCell::new(T::default())).take(procs * procs),
        );
        self.procs.store(procs, Ordering::Release);
    }

    /// The queue of requests this process is accumulating toward `to`.
    ///
    /// # Safety
    /// `my_pid` must be the calling process's pid, and the protocol must
    /// currently assign the cell to the accumulating side.
    pub(crate) unsafe fn from_me(&self, to: usize, my_pid: usize) -> &mut T {
        self.cell(my_pid, to)
    }

    /// The queue of requests `from` accumulated toward this process.
    ///
    /// # Safety
    /// `my_pid` must be the calling process's pid, and a barrier must have
    /// transferred the cell to the draining side.
    pub(crate) unsafe fn to_me(&self, from: usize, my_pid: usize) -> &mut T {
        self.cell(from, my_pid)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn cell(&self, from: usize, to: usize) -> &mut T {
        let procs = self.procs.load(Ordering::Acquire);
        debug_assert!(from < procs && to < procs);
        let cells = &*self.cells.get();
        &mut *cells[from * procs + to].get()
    }
}

#[cfg(all(test, not(feature = "shuttle")))]
mod tests {
    use super::{CommMatrix, PerProc};

    #[test]
    fn matrix_directions_agree() {
        let matrix: CommMatrix<Vec<u32>> = CommMatrix::new();
        unsafe {
            matrix.reset_resize(3);
            // process 1 accumulates toward process 2
            matrix.from_me(2, 1).push(42);
            // process 2 drains what process 1 accumulated
            assert_eq!(matrix.to_me(1, 2).as_slice(), &[42]);
            // the opposite direction is a different cell
            assert!(matrix.to_me(2, 1).is_empty());
        }
    }

    #[test]
    fn reset_resize_discards_old_cells() {
        let matrix: CommMatrix<Vec<u32>> = CommMatrix::new();
        unsafe {
            matrix.reset_resize(2);
            matrix.from_me(0, 1).push(7);
            matrix.reset_resize(4);
            assert!(matrix.to_me(1, 0).is_empty());
        }
    }

    #[test]
    fn per_proc_slots_are_independent() {
        let slots: PerProc<Vec<u8>> = PerProc::new();
        unsafe {
            slots.reset_resize(2);
            slots.get_mut(0).push(1);
            slots.get_mut(1).push(2);
            assert_eq!(slots.get(0).as_slice(), &[1]);
            assert_eq!(slots.get(1).as_slice(), &[2]);
        }
    }
}
