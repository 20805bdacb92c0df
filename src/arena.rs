/// An append-only staging buffer for bytes that must survive a barrier
/// crossing.
///
/// Payload bytes for puts and sends are copied in at issue time with [alloc]
/// and read back out after the rendezvous with [extract]. Offsets returned by
/// [alloc] are plain indices into the buffer, so amortized growth never
/// invalidates them; they stay meaningful until the next [clear].
///
/// An arena is owned by exactly one process between barriers. Other processes
/// read it only during the drain phase that the preceding barrier ordered
/// after all writes.
///
/// [alloc]: StackArena::alloc
/// [extract]: StackArena::extract
/// [clear]: StackArena::clear
#[derive(Debug, Default)]
pub(crate) struct StackArena {
    bytes: Vec<u8>,
}

impl StackArena {
    pub(crate) fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    /// Appends a copy of `src` and returns the offset it was placed at.
    pub(crate) fn alloc(&mut self, src: &[u8]) -> usize {
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(src);
        offset
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    pub(crate) fn extract(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(
            offset + dst.len() <= self.bytes.len(),
            "extract of {} bytes at offset {offset} overruns arena of {} bytes",
            dst.len(),
            self.bytes.len()
        );
        dst.copy_from_slice(&self.bytes[offset..offset + dst.len()]);
    }

    /// The current high-water mark, which is also the offset the next
    /// [alloc](StackArena::alloc) will return.
    pub(crate) fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Appends the full contents of `other`. Offsets into `other` stay valid
    /// in `self` once shifted by `self.size()` as observed before the merge.
    pub(crate) fn merge(&mut self, other: &StackArena) {
        self.bytes.extend_from_slice(&other.bytes);
    }

    /// Resets the size to zero. Capacity is retained, so a recycled arena
    /// does not reallocate for same-sized supersteps.
    pub(crate) fn clear(&mut self) {
        self.bytes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::StackArena;

    #[test]
    fn alloc_returns_stable_offsets() {
        let mut arena: StackArena = StackArena::new();
        let first: usize = arena.alloc(&[1, 2, 3]);
        let second: usize = arena.alloc(&[4, 5]);
        assert_eq!(first, 0);
        assert_eq!(second, 3);
        assert_eq!(arena.size(), 5);

        // grow well past any initial capacity
        let big: Vec<u8> = vec![9; 4096];
        let third: usize = arena.alloc(&big);
        assert_eq!(third, 5);

        let mut out = [0u8; 2];
        arena.extract(second, &mut out);
        assert_eq!(out, [4, 5]);
        let mut out = [0u8; 3];
        arena.extract(first, &mut out);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn merge_shifts_by_size_at_merge_time() {
        let mut receiver: StackArena = StackArena::new();
        receiver.alloc(&[0xEE; 7]);

        let mut staged: StackArena = StackArena::new();
        let offset: usize = staged.alloc(&[10, 20, 30]);

        let base: usize = receiver.size();
        receiver.merge(&staged);

        let mut out = [0u8; 3];
        receiver.extract(base + offset, &mut out);
        assert_eq!(out, [10, 20, 30]);
    }

    #[test]
    fn clear_resets_offsets() {
        let mut arena: StackArena = StackArena::with_capacity(64);
        arena.alloc(&[1, 2, 3, 4]);
        arena.clear();
        assert_eq!(arena.size(), 0);
        assert_eq!(arena.alloc(&[5]), 0);
    }
}
