//! # BSP
//!
//! A shared-memory runtime for the Bulk Synchronous Parallel programming
//! model. A fixed group of processes (native threads, indexed `0..P`)
//! alternates between local computation supersteps and global
//! synchronization points at which all deferred communication takes effect
//! atomically: one-sided [put](Bsp::put)/[get](Bsp::get) on registered
//! memory regions, tagged message passing with [send](Bsp::send) /
//! [move_payload](Bsp::move_payload) / [get_tag](Bsp::get_tag), and barrier
//! synchronization with [sync](Bsp::sync).
//!
//! # Usage
//! ## Example
//! The runtime is SPMD: one entry function runs on every process. The
//! thread that calls [init](Bsp::init) is process 0 and invokes the entry
//! itself; [begin](Bsp::begin) spawns the others.
//!
//! ```edition2021
//! use bsp::{Aborted, Bsp};
//!
//! const PROCESSES: usize = 4;
//!
//! fn program() -> Result<(), Aborted> {
//!     let bsp = Bsp::instance();
//!     bsp.begin(PROCESSES);
//!     let pid = bsp.pid();
//!
//!     // every process greets its right-hand neighbour
//!     let to = (pid + 1) % PROCESSES;
//!     bsp.send(to, &[], &(pid as u32).to_ne_bytes());
//!     bsp.sync()?;
//!
//!     let mut raw = [0u8; 4];
//!     unsafe { bsp.move_payload(raw.as_mut_ptr(), raw.len()) };
//!     assert_eq!(u32::from_ne_bytes(raw) as usize, (pid + PROCESSES - 1) % PROCESSES);
//!
//!     bsp.end();
//!     Ok(())
//! }
//!
//! Bsp::instance().init(program);
//! program().unwrap();
//! ```
//!
//! ## Details
//! Communication primitives never block and never synchronize: they only
//! queue requests against state owned by the calling process. The whole
//! exchange happens inside [sync](Bsp::sync), whose fixed phase order gives
//! the model its guarantees: a [get](Bsp::get) observes the remote bytes as
//! they were when the superstep ended, before any [put](Bsp::put) of the
//! same superstep lands, and messages from one sender arrive in issuance
//! order.
//!
//! One-sided operations address remote memory through *registrations*: each
//! process calls [push_reg](Bsp::push_reg) on a local region, and because
//! every process pushes in the same order (the SPMD discipline), the i-th
//! registration everywhere denotes the same logical region. Registration
//! keys are raw addresses, which makes the one-sided operations `unsafe`;
//! the safety contracts spell out what the caller must keep alive.
//!
//! Cooperative cancellation goes through [abort](Bsp::abort): the aborting
//! process returns the [Aborted] sentinel and every other process receives
//! it from its next [sync](Bsp::sync), unwinding the whole group within one
//! barrier gate.
//!
//! # Limitations
//! The runtime is single-machine by design: processes are threads of one
//! address space, and nothing here speaks to a network. The process group is
//! fixed for the lifetime of a [begin](Bsp::begin)/[end](Bsp::end) cycle,
//! and registrations do not survive into the next cycle.
#![warn(missing_debug_implementations, missing_docs)]

mod arena;
mod barrier;
mod err;
mod queues;
mod registry;
mod requests;
mod runtime;
mod sync;

pub use err::Aborted;
pub use runtime::Bsp;
