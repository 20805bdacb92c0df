//! The registration service: binds process-local addresses to globally
//! consistent register indices.
//!
//! Each process keeps a [RegisterTable] mapping its own registered addresses
//! to `{size, index}`, plus an append-only list of [RegisterSlot]s mapping
//! each global index back to the address this process advertised for it.
//! Under SPMD discipline every process pushes registrations in the same
//! sequence, so the i-th push everywhere lands on the same global index;
//! the library does not verify this.

use crate::requests::{PopRequest, PushRequest};
use std::collections::BTreeMap;

/// What a process knows about one of its own registered regions.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct RegisterInfo {
    pub(crate) size: usize,
    pub(crate) index: usize,
}

/// One entry of the global-index-to-local-address direction: the address a
/// process advertised for a register slot, with the advertised size riding
/// along for destination checks.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RegisterSlot {
    pub(crate) addr: usize,
    pub(crate) size: usize,
}

/// The local-address-to-index direction of one process's registrations.
///
/// The push counter is monotone within a Begin cycle: popping a region frees
/// its map entry but never recycles its index, so in-flight requests that
/// resolved before the pop keep addressing the right slot.
#[derive(Debug, Default)]
pub(crate) struct RegisterTable {
    entries: BTreeMap<usize, RegisterInfo>,
    push_count: usize,
}

impl RegisterTable {
    /// Assigns the next global index to `ident` and returns the deferred
    /// request to queue. The index takes effect at the next Sync; the
    /// counter advances immediately.
    pub(crate) fn stage_push(&mut self, ident: usize, size: usize) -> PushRequest {
        let index = self.push_count;
        self.push_count += 1;
        PushRequest {
            ident,
            info: RegisterInfo { size, index },
        }
    }

    /// Resolves a registered local address to its `{size, index}`.
    ///
    /// Addressing an unregistered region is a programming error.
    pub(crate) fn resolve(&self, ident: usize) -> RegisterInfo {
        match self.entries.get(&ident) {
            Some(info) => *info,
            None => panic!("address {ident:#x} is not a registered region"),
        }
    }

    pub(crate) fn apply_push(&mut self, request: &PushRequest) {
        self.entries.insert(request.ident, request.info);
    }

    pub(crate) fn apply_pop(&mut self, request: &PopRequest) {
        self.entries.remove(&request.ident);
    }
}

#[cfg(test)]
mod tests {
    use super::{RegisterInfo, RegisterTable};
    use crate::requests::{PopRequest, PushRequest};

    #[test]
    fn indices_are_assigned_in_push_order() {
        let mut table: RegisterTable = RegisterTable::default();
        let first: PushRequest = table.stage_push(0x1000, 16);
        let second: PushRequest = table.stage_push(0x2000, 32);
        assert_eq!(first.info, RegisterInfo { size: 16, index: 0 });
        assert_eq!(second.info, RegisterInfo { size: 32, index: 1 });
    }

    #[test]
    fn pop_frees_the_entry_but_not_the_index() {
        let mut table: RegisterTable = RegisterTable::default();
        let first: PushRequest = table.stage_push(0x1000, 16);
        table.apply_push(&first);
        table.apply_pop(&PopRequest { ident: 0x1000 });

        // the counter keeps advancing; index 0 is never reused
        let second: PushRequest = table.stage_push(0x3000, 8);
        assert_eq!(second.info.index, 1);
    }

    #[test]
    fn repush_of_the_same_address_rebinds_it() {
        let mut table: RegisterTable = RegisterTable::default();
        let first: PushRequest = table.stage_push(0x1000, 16);
        table.apply_push(&first);
        let again: PushRequest = table.stage_push(0x1000, 64);
        table.apply_push(&again);
        assert_eq!(table.resolve(0x1000), RegisterInfo { size: 64, index: 1 });
    }
}
