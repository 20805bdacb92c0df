use crate::err::Aborted;
use crate::sync::{hint, AtomicBool, AtomicUsize, Condvar, Mutex, Ordering};
use std::time::Duration;

/// How many times a waiter polls the generation before it goes to sleep.
const SPIN_ROUNDS: usize = 4096;

/// Sleep granularity of the slow path. Sleepers re-check the abort flag at
/// this interval, which bounds how long an abort can go unobserved.
const SLEEP_POLL: Duration = Duration::from_millis(1);

/// A reusable rendezvous for a fixed group of processes, with a mixed
/// wait policy: a bounded spin on the generation counter, then a
/// condvar sleep.
///
/// The spin path keeps superstep-per-microsecond programs off the scheduler;
/// the condvar path keeps unbalanced programs off a core. Both paths poll the
/// abort flag, so once any process raises it, every waiter returns
/// `Err(Aborted)` within bounded delay and a gate entered after the flag is
/// up releases immediately. This is what lets an aborting run drain: the
/// processes already parked at a gate wake up and unwind instead of waiting
/// for arrivals that will never come.
///
/// Reuse is generation-based. The last arrival resets the arrival counter
/// *before* bumping the generation, so a process that re-enters the next
/// round immediately counts toward the new round and never corrupts the old
/// one.
pub(crate) struct MixedBarrier {
    parties: AtomicUsize,
    arrived: AtomicUsize,
    generation: AtomicUsize,
    lock: Mutex<()>,
    sleepers: Condvar,
}

impl MixedBarrier {
    pub(crate) fn new(parties: usize) -> Self {
        Self {
            parties: AtomicUsize::new(parties),
            arrived: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
            lock: Mutex::new(()),
            sleepers: Condvar::new(),
        }
    }

    /// Resizes the barrier for the next computation.
    ///
    /// Must only be called while no process can be waiting, i.e. in the
    /// single-threaded window before workers are spawned. Stale arrivals
    /// left behind by an aborted round are discarded here.
    pub(crate) fn set_size(&self, parties: usize) {
        self.parties.store(parties, Ordering::Release);
        self.arrived.store(0, Ordering::Release);
    }

    /// Blocks until all parties have called `wait` on this round, or until
    /// `abort` is observed true.
    pub(crate) fn wait(&self, abort: &AtomicBool) -> Result<(), Aborted> {
        if abort.load(Ordering::Acquire) {
            return Err(Aborted);
        }

        let parties = self.parties.load(Ordering::Acquire);
        debug_assert!(parties > 0, "barrier used before set_size()");
        let generation = self.generation.load(Ordering::Acquire);

        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == parties {
            // Last arrival: reset for the next round, then release this one.
            // The counter must go down before the generation goes up so that
            // immediate re-entrants count toward the next round.
            self.arrived.store(0, Ordering::Release);
            self.generation.fetch_add(1, Ordering::AcqRel);
            drop(self.lock.lock().expect("barrier mutex poisoned"));
            self.sleepers.notify_all();
            return self.outcome(abort);
        }

        for _ in 0..SPIN_ROUNDS {
            if self.generation.load(Ordering::Acquire) != generation {
                return self.outcome(abort);
            }
            if abort.load(Ordering::Acquire) {
                return Err(Aborted);
            }
            hint::spin_loop();
        }

        let mut guard = self.lock.lock().expect("barrier mutex poisoned");
        while self.generation.load(Ordering::Acquire) == generation
            && !abort.load(Ordering::Acquire)
        {
            let (next, _) = self
                .sleepers
                .wait_timeout(guard, SLEEP_POLL)
                .expect("barrier mutex poisoned");
            guard = next;
        }
        drop(guard);
        self.outcome(abort)
    }

    fn outcome(&self, abort: &AtomicBool) -> Result<(), Aborted> {
        if abort.load(Ordering::Acquire) {
            Err(Aborted)
        } else {
            Ok(())
        }
    }
}
