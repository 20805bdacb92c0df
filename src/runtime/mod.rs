//! The superstep engine.
//!
//! A fixed group of processes (one native thread each, indexed `0..P`)
//! alternates between local computation and global synchronization. All
//! communication primitives only queue work against process-local state;
//! [Sync](Bsp::sync) rendezvouses the whole group and drains the queues in a
//! fixed phase order, so nothing a process communicates is observable before
//! the superstep boundary and everything is observable after it.

use core::cell::{Cell, UnsafeCell};
use core::fmt;
use std::io::{self, Write};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::arena::StackArena;
use crate::barrier::MixedBarrier;
use crate::err::Aborted;
use crate::queues::{CommMatrix, PerProc};
use crate::registry::{RegisterSlot, RegisterTable};
use crate::requests::{GetRequest, PopRequest, PushRequest, PutRequest, SendRequest};
use crate::sync::{thread, AtomicBool, AtomicUsize, Ordering};

#[cfg(feature = "tracing")]
use tracing::instrument;

mod drain;

/// Initial capacity of each per-process put-staging arena.
const PUT_STAGING_CAPACITY: usize = 9064;

/// The function every process runs for the duration of a computation.
type EntryFn = Arc<dyn Fn() -> Result<(), Aborted> + Send + Sync>;

crate::sync::thread_local! {
    /// The process index carried by each worker thread. `None` until
    /// [Bsp::init] (main thread) or the worker wrapper (spawned threads)
    /// assigns it.
    static PROCESS_ID: Cell<Option<usize>> = Cell::new(None);
}

/// State owned by a single process and never touched by any other.
#[derive(Debug, Default)]
struct ProcessState {
    registers: RegisterTable,
    pending_pushes: Vec<PushRequest>,
    pending_pops: Vec<PopRequest>,
    /// Messages delivered to this process for the current superstep, in
    /// owner order 0..P, issuance order within an owner.
    delivered_sends: Vec<SendRequest>,
    /// Backing bytes of `delivered_sends`, merged from every inbound
    /// staging arena at Sync.
    delivered_bytes: StackArena,
    /// Next message [move_payload](Bsp::move_payload) will consume.
    receive_cursor: usize,
    /// Tag size this process proposed; adopted from process 0's slot at the
    /// next Sync.
    proposed_tag_size: usize,
    start_time: Option<Instant>,
}

/// The shared-memory BSP runtime.
///
/// There is one instance per program, obtained with [Bsp::instance]; it is
/// lazily constructed on first access and lives for the process lifetime.
/// A computation is an `init` / `begin` / supersteps / `end` cycle: process 0
/// is the thread that called [init](Bsp::init), and [begin](Bsp::begin)
/// spawns the remaining workers, each running the registered entry function.
///
/// Communication state is sharded per process and per direction; the only
/// cross-process synchronization is the barrier inside [sync](Bsp::sync)
/// and [end](Bsp::end). Every queue cell, staging arena, and registration
/// table is owned by exactly one process at every point of the protocol,
/// with the barrier's happens-before publishing writes to the phase that
/// consumes them.
pub struct Bsp {
    barrier: MixedBarrier,
    abort_flag: AtomicBool,
    ended: AtomicBool,
    proc_count: AtomicUsize,
    tag_size: AtomicUsize,
    entry: UnsafeCell<Option<EntryFn>>,
    workers: UnsafeCell<Vec<thread::JoinHandle<()>>>,

    processes: PerProc<ProcessState>,
    /// Global index -> advertised address, one list per advertising process.
    /// Readable by every process between Syncs; appended by the owner in the
    /// push-application phase.
    register_slots: PerProc<Vec<RegisterSlot>>,
    /// Staged source bytes for outgoing puts, one arena per owner. Receivers
    /// extract from it in the put phase; the owner clears it afterwards.
    put_staging: PerProc<StackArena>,

    put_requests: CommMatrix<Vec<PutRequest>>,
    get_requests: CommMatrix<Vec<GetRequest>>,
    send_staging: CommMatrix<Vec<SendRequest>>,
    send_staging_bytes: CommMatrix<StackArena>,
}

// Safety: all interior state is either atomic or sharded into cells whose
// exclusive owner is fixed by the superstep protocol; the barrier publishes
// writes before ownership transfers. See the module docs of `queues`.
unsafe impl Sync for Bsp {}

impl Bsp {
    /// The program-wide runtime instance.
    pub fn instance() -> &'static Bsp {
        static INSTANCE: OnceLock<Bsp> = OnceLock::new();
        INSTANCE.get_or_init(Bsp::new)
    }

    fn new() -> Self {
        Self {
            barrier: MixedBarrier::new(0),
            abort_flag: AtomicBool::new(false),
            ended: AtomicBool::new(true),
            proc_count: AtomicUsize::new(0),
            tag_size: AtomicUsize::new(0),
            entry: UnsafeCell::new(None),
            workers: UnsafeCell::new(Vec::new()),
            processes: PerProc::new(),
            register_slots: PerProc::new(),
            put_staging: PerProc::new(),
            put_requests: CommMatrix::new(),
            get_requests: CommMatrix::new(),
            send_staging: CommMatrix::new(),
            send_staging_bytes: CommMatrix::new(),
        }
    }

    /// Registers the entry function and makes the calling thread process 0.
    ///
    /// Warns on stderr when state from a previous computation is found that
    /// neither ended nor aborted; nothing is recovered in that case, the
    /// next [begin](Bsp::begin) resets it wholesale.
    pub fn init<F>(&self, entry: F)
    where
        F: Fn() -> Result<(), Aborted> + Send + Sync + 'static,
    {
        if !self.ended.load(Ordering::Acquire) && !self.abort_flag.load(Ordering::Acquire) {
            eprintln!("warning: state of another BSP computation is still live;");
            eprintln!("         that computation did not end (gracefully).");
        }

        // Safety: init precedes begin, so no worker exists to race with.
        unsafe {
            *self.entry.get() = Some(Arc::new(entry));
        }
        self.tag_size.store(0, Ordering::Release);
        PROCESS_ID.with(|slot| slot.set(Some(0)));
    }

    /// Starts a computation over `processes` processes.
    ///
    /// On process 0 this resets all runtime state, spawns `processes - 1`
    /// workers each running the entry function, and starts this process's
    /// timer. On every other process it checks that `processes` matches the
    /// running group and starts that process's timer. Workers left over
    /// from a previous computation are joined before anything is reset.
    #[cfg_attr(feature = "tracing", instrument(skip(self)))]
    pub fn begin(&self, processes: usize) {
        assert!(processes > 0, "a computation needs at least one process");
        let pid = self.pid();

        if pid != 0 {
            debug_assert_eq!(
                processes,
                self.proc_count.load(Ordering::Acquire),
                "begin() was called with a process count that does not match the running group"
            );
            debug_assert!(pid < processes);
            self.start_timer(pid);
            return;
        }

        self.join_workers();

        self.abort_flag.store(false, Ordering::Release);
        self.ended.store(false, Ordering::Release);
        self.proc_count.store(processes, Ordering::Release);
        self.barrier.set_size(processes);

        // Safety: no workers exist yet; this thread has exclusive access.
        unsafe {
            self.processes.reset_resize(processes);
            self.register_slots.reset_resize(processes);
            self.put_staging
                .reset_resize_with(processes, || StackArena::with_capacity(PUT_STAGING_CAPACITY));
            self.put_requests.reset_resize(processes);
            self.get_requests.reset_resize(processes);
            self.send_staging.reset_resize(processes);
            self.send_staging_bytes.reset_resize(processes);
        }

        // Safety: still single-threaded, as above.
        let entry: Option<EntryFn> = unsafe { (*self.entry.get()).clone() };
        let workers = unsafe { &mut *self.workers.get() };
        for worker_pid in 1..processes {
            let entry = entry
                .clone()
                .expect("begin() with more than one process requires an entry registered through init()");
            let handle = thread::Builder::new()
                .name(format!("bsp-{worker_pid}"))
                .spawn(move || {
                    PROCESS_ID.with(|slot| slot.set(Some(worker_pid)));
                    // The abort sentinel ends a worker cleanly. A panic
                    // raises the abort flag first, so the rest of the group
                    // unwinds instead of waiting for an arrival that will
                    // never come, then resurfaces at the join.
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let _ = entry.as_ref()();
                    }));
                    if let Err(panic) = outcome {
                        Bsp::instance().abort_flag.store(true, Ordering::Release);
                        std::panic::resume_unwind(panic);
                    }
                })
                .expect("failed to spawn a worker thread");
            workers.push(handle);
        }

        self.start_timer(0);
    }

    /// Ends the computation.
    ///
    /// All processes rendezvous one final time; process 0 then joins every
    /// worker. The rendezvous tolerates a raised abort flag, so `end()`
    /// returns normally on the spawning thread even after an aborted run
    /// (the workers have already unwound by then).
    #[cfg_attr(feature = "tracing", instrument(skip(self)))]
    pub fn end(&self) {
        self.ended.store(true, Ordering::Release);
        let _ = self.barrier.wait(&self.abort_flag);
        if self.pid() == 0 {
            self.join_workers();
        }
    }

    /// Executes the superstep boundary.
    ///
    /// Four barrier gates delimit three drain phases with a fixed order:
    ///
    /// 1. after the first gate, process 0 adopts its proposed tag size and
    ///    every process converts the gets addressed to it into puts, staging
    ///    the requested bytes from its own memory;
    /// 2. after the second gate, deregistrations apply, inbound sends merge
    ///    into the delivered queue, and inbound puts (including those the
    ///    gets synthesized) are written out;
    /// 3. after the third gate, each process clears its put staging and
    ///    applies its deferred registrations, making the indices assigned
    ///    this superstep addressable in the next one.
    ///
    /// Returns `Err(Aborted)` as soon as any gate observes the abort flag.
    #[cfg_attr(feature = "tracing", instrument(skip(self)))]
    pub fn sync(&self) -> Result<(), Aborted> {
        let pid = self.pid();

        self.barrier.wait(&self.abort_flag)?;

        if pid == 0 {
            // Safety: slot 0 is this process's own state.
            let proposed = unsafe { self.processes.get(0) }.proposed_tag_size;
            if proposed != self.tag_size.load(Ordering::Acquire) {
                self.tag_size.store(proposed, Ordering::Release);
            }
        }
        drain::process_get_requests(self, pid);

        self.barrier.wait(&self.abort_flag)?;

        drain::process_pop_requests(self, pid);
        drain::process_send_requests(self, pid);
        drain::process_put_requests(self, pid);

        self.barrier.wait(&self.abort_flag)?;

        // Safety: every receiver finished extracting at the gate above.
        unsafe { self.put_staging.get_mut(pid) }.clear();
        drain::process_push_requests(self, pid);

        self.barrier.wait(&self.abort_flag)
    }

    /// The number of processes in the running computation, or the hardware
    /// concurrency when no computation has begun.
    pub fn nprocs(&self) -> usize {
        let procs = self.proc_count.load(Ordering::Acquire);
        if procs > 0 {
            procs
        } else {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        }
    }

    /// The calling process's index, in `0..nprocs()`.
    ///
    /// Panics when the calling thread carries no process index, which means
    /// [init](Bsp::init) was never called on it and it was not spawned by
    /// [begin](Bsp::begin).
    pub fn pid(&self) -> usize {
        PROCESS_ID
            .with(|slot| slot.get())
            .expect("no process id on this thread: call init() first, or reach this code through begin()")
    }

    /// Seconds since this process's [begin](Bsp::begin). Checks the abort
    /// flag first, so a long-running computation polls for aborts by timing
    /// itself.
    pub fn time(&self) -> Result<f64, Aborted> {
        self.check_abort()?;
        let pid = self.pid();
        // Safety: the slot is this process's own state.
        let started = unsafe { self.processes.get(pid) }
            .start_time
            .expect("time() before begin()");
        Ok(started.elapsed().as_secs_f64())
    }

    /// Queues the registration of the `size`-byte region at `ident`,
    /// effective at the next [sync](Bsp::sync). The region's global index is
    /// assigned now, so pushes issued within one superstep get consecutive
    /// indices in issue order.
    ///
    /// # Safety
    /// `ident` must point to a region of at least `size` bytes that stays
    /// valid until the registration is popped (or the computation ends), and
    /// the caller must uphold the SPMD discipline: every process pushes its
    /// registrations in the same order.
    pub unsafe fn push_reg(&self, ident: *const u8, size: usize) {
        let pid = self.pid();
        debug_assert!(pid < self.proc_count.load(Ordering::Acquire));
        // Safety: own slot, and the caller promises `ident` as above.
        let state = self.processes.get_mut(pid);
        let request = state.registers.stage_push(ident as usize, size);
        state.pending_pushes.push(request);
    }

    /// Queues the deregistration of the region at `ident`, effective at the
    /// next [sync](Bsp::sync). The region's historical index stays valid for
    /// requests already in flight.
    ///
    /// # Safety
    /// `ident` must be a currently registered address on this process, and
    /// the SPMD discipline applies as for [push_reg](Bsp::push_reg).
    pub unsafe fn pop_reg(&self, ident: *const u8) {
        let pid = self.pid();
        debug_assert!(pid < self.proc_count.load(Ordering::Acquire));
        // Safety: own slot.
        let state = self.processes.get_mut(pid);
        state.pending_pops.push(PopRequest {
            ident: ident as usize,
        });
    }

    /// Queues a one-sided write of `nbytes` bytes from `src` into the region
    /// `target` registered under the same global index as this process's
    /// `dst`, starting `offset` bytes in. The source bytes are captured now;
    /// the write lands at the next [sync](Bsp::sync).
    ///
    /// Overlapping puts resolve deterministically: within one issuing
    /// process the *first* issued put wins (requests apply in reverse
    /// issuance order), and across issuing processes the highest pid wins
    /// (receivers apply owners in pid order).
    ///
    /// # Safety
    /// `src` must be readable for `nbytes` bytes. `dst` must be an address
    /// this process registered, the matching region on `target` must admit
    /// `offset + nbytes` bytes, and no Rust reference to the written range
    /// may be live across the Sync that applies the put.
    pub unsafe fn put(
        &self,
        target: usize,
        src: *const u8,
        dst: *const u8,
        offset: isize,
        nbytes: usize,
    ) {
        let pid = self.pid();
        debug_assert!(target < self.proc_count.load(Ordering::Acquire));

        // Safety: own slot; resolution reads only this process's table.
        let info = self.processes.get_mut(pid).registers.resolve(dst as usize);
        // Safety: slot lists only change in the push phase, which a barrier
        // separates from user code.
        let slots = self.register_slots.get(target);
        debug_assert!(
            info.index < slots.len(),
            "register {} is not yet visible on process {target}",
            info.index
        );
        let slot = slots[info.index];
        debug_assert!(
            nbytes <= slot.size,
            "put of {nbytes} bytes into a {}-byte region",
            slot.size
        );

        // Safety: the caller promises `src` is readable for `nbytes`.
        let source = core::slice::from_raw_parts(src, nbytes);
        // Safety: own arena until the barrier.
        let location = self.put_staging.get_mut(pid).alloc(source);
        // Safety: cell (pid, target) is owned by this process until the
        // barrier.
        self.put_requests.from_me(target, pid).push(PutRequest {
            offset: location,
            destination: slot.addr.wrapping_add_signed(offset),
            size: nbytes,
        });
    }

    /// Queues a one-sided read of `nbytes` bytes, starting `offset` bytes
    /// into the region `target` registered under the same global index as
    /// this process's `src`, into the local buffer at `dst`. The remote
    /// bytes are captured at the start of the next [sync](Bsp::sync), before
    /// any put of that superstep lands.
    ///
    /// # Safety
    /// `src` must be an address this process registered and the matching
    /// region on `target` must admit `offset + nbytes` bytes. `dst` must be
    /// writable for `nbytes` bytes and no Rust reference to that range may
    /// be live across the Sync that applies the get.
    pub unsafe fn get(
        &self,
        target: usize,
        src: *const u8,
        offset: isize,
        dst: *mut u8,
        nbytes: usize,
    ) {
        let pid = self.pid();
        debug_assert!(target < self.proc_count.load(Ordering::Acquire));

        // Safety: own slot; see put().
        let info = self.processes.get_mut(pid).registers.resolve(src as usize);
        // Safety: see put().
        let slots = self.register_slots.get(target);
        debug_assert!(
            info.index < slots.len(),
            "register {} is not yet visible on process {target}",
            info.index
        );
        let slot = slots[info.index];
        debug_assert!(
            nbytes <= slot.size,
            "get of {nbytes} bytes from a {}-byte region",
            slot.size
        );

        // Safety: cell (pid, target) is owned by this process until the
        // barrier.
        self.get_requests.from_me(target, pid).push(GetRequest {
            destination: dst as usize,
            source: slot.addr.wrapping_add_signed(offset),
            size: nbytes,
        });
    }

    /// Queues a tagged message for `target`, delivered at the next
    /// [sync](Bsp::sync). Payload and tag are copied now; `tag` must be
    /// exactly the current tag size long.
    pub fn send(&self, target: usize, tag: &[u8], payload: &[u8]) {
        let pid = self.pid();
        let tag_size = self.tag_size.load(Ordering::Acquire);
        debug_assert!(target < self.proc_count.load(Ordering::Acquire));
        debug_assert_eq!(
            tag.len(),
            tag_size,
            "tag length must equal the current tag size"
        );
        // Safety: own slot.
        debug_assert_eq!(
            unsafe { self.processes.get(pid) }.proposed_tag_size,
            tag_size,
            "send() between proposing a new tag size and the sync that adopts it"
        );

        // Safety: cells (pid, target) are owned by this process until the
        // barrier.
        let staging = unsafe { self.send_staging_bytes.from_me(target, pid) };
        let payload_offset = staging.alloc(payload);
        let tag_offset = staging.alloc(tag);
        unsafe { self.send_staging.from_me(target, pid) }.push(SendRequest {
            payload_offset,
            payload_size: payload.len(),
            tag_offset,
            tag_size,
        });
    }

    /// Consumes the head of the delivered-message queue, copying at most
    /// `max_copy_size` bytes of its payload to `payload`. Does nothing when
    /// the queue is exhausted.
    ///
    /// # Safety
    /// `payload` must be writable for `min(max_copy_size, head payload
    /// size)` bytes.
    pub unsafe fn move_payload(&self, payload: *mut u8, max_copy_size: usize) {
        let pid = self.pid();
        // Safety: own slot.
        let state = self.processes.get_mut(pid);
        if state.receive_cursor >= state.delivered_sends.len() {
            return;
        }
        let request = state.delivered_sends[state.receive_cursor];
        state.receive_cursor += 1;

        let copy_size = request.payload_size.min(max_copy_size);
        if copy_size == 0 {
            return;
        }
        // Safety: the caller promises `payload` is writable for `copy_size`.
        let dst = core::slice::from_raw_parts_mut(payload, copy_size);
        state.delivered_bytes.extract(request.payload_offset, dst);
    }

    /// Peeks the head of the delivered-message queue without consuming it:
    /// returns the payload size and copies the tag bytes to `tag`, or
    /// returns `usize::MAX` when the queue is exhausted.
    ///
    /// # Safety
    /// `tag` must be writable for the current tag size in bytes.
    pub unsafe fn get_tag(&self, tag: *mut u8) -> usize {
        let pid = self.pid();
        // Safety: own slot.
        let state = self.processes.get(pid);
        let index = state.receive_cursor;
        if index >= state.delivered_sends.len() {
            return usize::MAX;
        }
        let request = state.delivered_sends[index];
        debug_assert_eq!(request.tag_size, self.tag_size.load(Ordering::Acquire));

        if request.tag_size > 0 {
            // Safety: the caller promises `tag` is writable for the tag size.
            let dst = core::slice::from_raw_parts_mut(tag, request.tag_size);
            state.delivered_bytes.extract(request.tag_offset, dst);
        }
        request.payload_size
    }

    /// Proposes `*size` as the tag size of the next superstep and writes the
    /// current tag size back into `*size`. Every process must propose the
    /// same value; only process 0's proposal is adopted, at the next
    /// [sync](Bsp::sync).
    pub fn set_tag_size(&self, size: &mut usize) {
        let proposed = *size;
        *size = self.tag_size.load(Ordering::Acquire);
        // Safety: own slot.
        unsafe { self.processes.get_mut(self.pid()) }.proposed_tag_size = proposed;
    }

    /// The number of messages delivered to this process this superstep and
    /// their accumulated payload bytes. Messages already consumed by
    /// [move_payload](Bsp::move_payload) keep counting until the next Sync
    /// replaces the queue.
    pub fn qsize(&self) -> (usize, usize) {
        let pid = self.pid();
        // Safety: own slot.
        let state = unsafe { self.processes.get(pid) };
        let packets = state.delivered_sends.len();
        let bytes = state.delivered_sends.iter().map(|r| r.payload_size).sum();
        (packets, bytes)
    }

    /// Whether the last computation has ended.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Aborts the computation: writes `message` to stderr, raises the abort
    /// flag, and returns the sentinel for the caller to propagate. Every
    /// other process observes the flag at its next barrier gate (or
    /// [time](Bsp::time) call) and unwinds the same way.
    ///
    /// ```ignore
    /// return Err(bsp.abort(format_args!("solver diverged at row {row}")));
    /// ```
    pub fn abort(&self, message: fmt::Arguments<'_>) -> Aborted {
        self.abort_flag.store(true, Ordering::Release);
        let mut stderr = io::stderr().lock();
        let _ = stderr.write_fmt(message);
        let _ = writeln!(stderr);
        Aborted
    }

    fn check_abort(&self) -> Result<(), Aborted> {
        if self.abort_flag.load(Ordering::Acquire) {
            Err(Aborted)
        } else {
            Ok(())
        }
    }

    fn start_timer(&self, pid: usize) {
        // Safety: the slot is this process's own state.
        unsafe { self.processes.get_mut(pid) }.start_time = Some(Instant::now());
    }

    /// Joins every worker of the previous computation. A worker that
    /// panicked re-raises its panic here; a worker that aborted joined
    /// cleanly.
    fn join_workers(&self) {
        // Safety: only process 0 reaches this, outside the parallel section.
        let workers = unsafe { &mut *self.workers.get() };
        for handle in workers.drain(..) {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

impl fmt::Debug for Bsp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bsp")
            .field("proc_count", &self.proc_count.load(Ordering::Acquire))
            .field("tag_size", &self.tag_size.load(Ordering::Acquire))
            .field("ended", &self.ended.load(Ordering::Acquire))
            .field("aborted", &self.abort_flag.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
