//! The Sync drain phases.
//!
//! Each function applies one class of deferred requests for one process and
//! runs between two barrier gates of [Bsp::sync]. The gate before a phase
//! publishes every write the phase reads; the gate after it fences the phase
//! off from the state it must not touch yet. Order matters: gets become puts
//! before puts apply, puts apply before staging clears, registrations apply
//! last so that indices assigned this superstep resolve in the next.

use crate::registry::RegisterSlot;
use crate::requests::PutRequest;
use crate::runtime::Bsp;
use crate::sync::Ordering;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Converts every get addressed to `pid` into a put.
///
/// This process owns the requested bytes, so it snapshots them into its own
/// put staging (before any put of this superstep can overwrite them) and
/// queues a put back toward the requester. Queues are walked in reverse
/// issuance order, matching the put phase.
#[cfg_attr(feature = "tracing", instrument(skip(bsp)))]
pub(super) fn process_get_requests(bsp: &Bsp, pid: usize) {
    let procs = bsp.proc_count.load(Ordering::Acquire);
    for owner in 0..procs {
        // Safety: the phase-A gate transferred the inbound cells to us.
        let queue = unsafe { bsp.get_requests.to_me(owner, pid) };
        for request in queue.iter().rev() {
            // Safety: the requester resolved `source` against a region this
            // process registered; registration guarantees readability.
            let source =
                unsafe { core::slice::from_raw_parts(request.source as *const u8, request.size) };
            // Safety: own arena during this phase.
            let location = unsafe { bsp.put_staging.get_mut(pid) }.alloc(source);
            // Safety: cell (pid, owner) is ours to accumulate into.
            unsafe { bsp.put_requests.from_me(owner, pid) }.push(PutRequest {
                offset: location,
                destination: request.destination,
                size: request.size,
            });
        }
        queue.clear();
    }
}

/// Applies this process's deferred deregistrations. The index list is left
/// alone so historical indices keep resolving.
#[cfg_attr(feature = "tracing", instrument(skip(bsp)))]
pub(super) fn process_pop_requests(bsp: &Bsp, pid: usize) {
    // Safety: own slot.
    let state = unsafe { bsp.processes.get_mut(pid) };
    for request in &state.pending_pops {
        state.registers.apply_pop(request);
    }
    state.pending_pops.clear();
}

/// Materializes this process's delivered-message queue.
///
/// The previous superstep's queue is dropped wholesale, then every inbound
/// staging direction is merged in owner order 0..P. Each merged request's
/// offsets shift by the bytes merged before it, so they index the combined
/// buffer; within one owner, issuance order is preserved.
#[cfg_attr(feature = "tracing", instrument(skip(bsp)))]
pub(super) fn process_send_requests(bsp: &Bsp, pid: usize) {
    // Safety: own slot.
    let state = unsafe { bsp.processes.get_mut(pid) };
    state.delivered_sends.clear();
    state.receive_cursor = 0;
    state.delivered_bytes.clear();

    let procs = bsp.proc_count.load(Ordering::Acquire);
    let mut base = 0usize;
    for owner in 0..procs {
        // Safety: the phase-B gate transferred the inbound cells to us; the
        // owner will not touch them again before the next superstep.
        let staged = unsafe { bsp.send_staging.to_me(owner, pid) };
        if staged.is_empty() {
            continue;
        }
        for request in staged.iter_mut() {
            request.payload_offset += base;
            request.tag_offset += base;
        }
        state.delivered_sends.append(staged);

        // Safety: as above, the byte cell of the same direction.
        let bytes = unsafe { bsp.send_staging_bytes.to_me(owner, pid) };
        base += bytes.size();
        state.delivered_bytes.merge(bytes);
        bytes.clear();
    }
}

/// Writes out every put addressed to `pid`.
///
/// Owners are drained in pid order; within one owner the queue is walked in
/// reverse issuance order, so of two overlapping puts from the same owner
/// the first-issued one lands last and wins.
#[cfg_attr(feature = "tracing", instrument(skip(bsp)))]
pub(super) fn process_put_requests(bsp: &Bsp, pid: usize) {
    let procs = bsp.proc_count.load(Ordering::Acquire);
    for owner in 0..procs {
        // Safety: the phase-B gate transferred the inbound cells to us.
        let queue = unsafe { bsp.put_requests.to_me(owner, pid) };
        if queue.is_empty() {
            continue;
        }
        // Safety: shared read; the owner neither grows nor clears its
        // staging until the phase-C gate.
        let staging = unsafe { bsp.put_staging.get(owner) };
        for request in queue.iter().rev() {
            // Safety: the destination lies in a region this process
            // registered, and user references to it are excluded across
            // Sync by the contract on Bsp::put.
            let dst = unsafe {
                core::slice::from_raw_parts_mut(request.destination as *mut u8, request.size)
            };
            staging.extract(request.offset, dst);
        }
        queue.clear();
    }
}

/// Applies this process's deferred registrations: the local table learns the
/// address, and the shared slot list grows by one entry per push, keeping
/// slot position equal to assigned index.
#[cfg_attr(feature = "tracing", instrument(skip(bsp)))]
pub(super) fn process_push_requests(bsp: &Bsp, pid: usize) {
    // Safety: own slot.
    let state = unsafe { bsp.processes.get_mut(pid) };
    if state.pending_pushes.is_empty() {
        return;
    }
    // Safety: own slot list; readers are fenced off until the next gate.
    let slots = unsafe { bsp.register_slots.get_mut(pid) };
    for request in &state.pending_pushes {
        state.registers.apply_push(request);
        slots.push(RegisterSlot {
            addr: request.ident,
            size: request.info.size,
        });
    }
    state.pending_pushes.clear();
}
