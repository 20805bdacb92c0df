use bsp::{Aborted, Bsp};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// The runtime is process-wide, so SPMD tests must not overlap. Every test
/// takes this lock for its whole body; a test that failed while holding it
/// must not poison the next one.
static RUNTIME_LOCK: Mutex<()> = Mutex::new(());

pub fn runtime_guard() -> MutexGuard<'static, ()> {
    RUNTIME_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `program` as an SPMD computation: registers it as the entry every
/// worker executes and invokes it on the calling thread as process 0.
///
/// The program is responsible for its own `begin`/`end` bracket, like any
/// BSP program.
pub fn run_spmd(program: fn() -> Result<(), Aborted>) -> Result<(), Aborted> {
    let bsp = Bsp::instance();
    bsp.init(program);
    program()
}
