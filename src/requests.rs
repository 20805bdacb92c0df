//! Deferred communication request records.
//!
//! Every communication primitive turns into one of these at issue time and
//! is applied during a Sync drain phase. Remote and local addresses are
//! stored as plain `usize` so the records move across threads as ordinary
//! data; they are only turned back into pointers inside the drain phase the
//! protocol schedules them for.

use crate::registry::RegisterInfo;

/// A deferred one-sided write: `size` bytes staged in the owner's put arena
/// at `offset`, bound for `destination` in the receiving process.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PutRequest {
    pub(crate) offset: usize,
    pub(crate) destination: usize,
    pub(crate) size: usize,
}

/// A deferred one-sided read of `size` bytes from `source` in the data
/// owner's address space into `destination` in the requester's.
#[derive(Clone, Copy, Debug)]
pub(crate) struct GetRequest {
    pub(crate) destination: usize,
    pub(crate) source: usize,
    pub(crate) size: usize,
}

/// A staged tagged message. Offsets index the staging arena of the issuing
/// direction until delivery merges them into the receiver's arena, shifting
/// both by the merge base.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SendRequest {
    pub(crate) payload_offset: usize,
    pub(crate) payload_size: usize,
    pub(crate) tag_offset: usize,
    pub(crate) tag_size: usize,
}

/// A registration deferred to the next Sync. The global index in `info` was
/// assigned when the push was issued.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PushRequest {
    pub(crate) ident: usize,
    pub(crate) info: RegisterInfo,
}

/// A deregistration deferred to the next Sync.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PopRequest {
    pub(crate) ident: usize,
}
