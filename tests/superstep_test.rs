#![cfg(not(feature = "shuttle"))]

mod common;

use bsp::{Aborted, Bsp};
use std::mem::size_of;
use test_log::test;
use tracing::debug;

fn ring_shift_program() -> Result<(), Aborted> {
    const PROCESSES: usize = 20;
    const SHIFT: usize = 7;

    let bsp = Bsp::instance();
    bsp.begin(PROCESSES);
    let pid: usize = bsp.pid();
    assert_eq!(bsp.nprocs(), PROCESSES);

    let mut value: u32 = pid as u32;
    unsafe { bsp.push_reg(&value as *const u32 as *const u8, size_of::<u32>()) };
    bsp.sync()?;

    bsp.send((pid + SHIFT) % PROCESSES, &[], &value.to_ne_bytes());
    bsp.sync()?;

    unsafe { bsp.move_payload(&mut value as *mut u32 as *mut u8, size_of::<u32>()) };
    assert_eq!(value as usize, (pid + PROCESSES - SHIFT) % PROCESSES);

    assert!(bsp.time()? >= 0.0);
    bsp.end();
    Ok(())
}

#[test]
fn ring_shift_of_pid() {
    let _guard = common::runtime_guard();
    common::run_spmd(ring_shift_program).unwrap();
}

fn put_window_program() -> Result<(), Aborted> {
    const PROCESSES: usize = 8;
    const SHIFT: usize = 7;
    const ELEMENTS: usize = 100;

    let bsp = Bsp::instance();
    bsp.begin(PROCESSES);
    let pid: usize = bsp.pid();

    let mut values: Vec<u32> = vec![0u32; ELEMENTS];
    unsafe { bsp.push_reg(values.as_mut_ptr() as *const u8, ELEMENTS * size_of::<u32>()) };
    bsp.sync()?;

    values[25] = pid as u32;
    // write elements [10, 40) of our vector onto the same window of the
    // neighbour's vector
    unsafe {
        bsp.put(
            (pid + SHIFT) % PROCESSES,
            values.as_ptr().add(10) as *const u8,
            values.as_ptr() as *const u8,
            (10 * size_of::<u32>()) as isize,
            30 * size_of::<u32>(),
        )
    };
    bsp.sync()?;

    let source_pid: usize = (pid + PROCESSES - SHIFT) % PROCESSES;
    assert_eq!(values[25], source_pid as u32);
    // bytes outside the window were not touched
    assert_eq!(values[5], 0);
    assert_eq!(values[45], 0);

    bsp.end();
    Ok(())
}

#[test]
fn put_into_registered_window() {
    let _guard = common::runtime_guard();
    common::run_spmd(put_window_program).unwrap();
}

fn counter_ping(iterations: u64) -> Result<(), Aborted> {
    const PROCESSES: usize = 8;

    let bsp = Bsp::instance();
    bsp.begin(PROCESSES);
    let pid: usize = bsp.pid();

    let mut counter: u64 = 0;
    unsafe { bsp.push_reg(&mut counter as *mut u64 as *const u8, size_of::<u64>()) };
    bsp.sync()?;

    for i in 0..iterations {
        unsafe {
            bsp.put(
                (pid + 1) % PROCESSES,
                &counter as *const u64 as *const u8,
                &counter as *const u64 as *const u8,
                0,
                size_of::<u64>(),
            )
        };
        bsp.sync()?;
        assert_eq!(counter, i);
        counter += 1;
    }
    assert_eq!(counter, iterations);

    bsp.end();
    Ok(())
}

fn counter_ping_short() -> Result<(), Aborted> {
    counter_ping(10_000)
}

fn counter_ping_million() -> Result<(), Aborted> {
    counter_ping(1_000_000)
}

#[test]
fn ping_counter_ten_thousand_rounds() {
    let _guard = common::runtime_guard();
    common::run_spmd(counter_ping_short).unwrap();
}

#[test]
#[ignore = "a million supersteps; run explicitly"]
fn ping_counter_million_rounds() {
    let _guard = common::runtime_guard();
    common::run_spmd(counter_ping_million).unwrap();
}

fn abort_program() -> Result<(), Aborted> {
    const PROCESSES: usize = 4;

    let bsp = Bsp::instance();
    bsp.begin(PROCESSES);
    if bsp.pid() == 2 {
        return Err(bsp.abort(format_args!("boom")));
    }
    // every other process unwinds out of its next gate
    loop {
        bsp.sync()?;
    }
}

#[test]
fn abort_unwinds_every_process() {
    let _guard = common::runtime_guard();
    let result: Result<(), Aborted> = common::run_spmd(abort_program);
    assert_eq!(result, Err(Aborted));
    debug!("all processes unwound: {result:?}");

    // the spawning thread's end() returns normally and joins the workers
    Bsp::instance().end();
    assert!(Bsp::instance().is_ended());
}

fn tag_size_program() -> Result<(), Aborted> {
    const PROCESSES: usize = 4;

    let bsp = Bsp::instance();
    bsp.begin(PROCESSES);
    let pid: usize = bsp.pid();

    let mut size: usize = size_of::<u64>();
    bsp.set_tag_size(&mut size);
    assert_eq!(size, 0, "the out-parameter reports the prior tag size");
    bsp.sync()?;

    let tag: [u8; 8] = (pid as u64).to_ne_bytes();
    let payload: [u8; 3] = [0xAB, 0xCD, 0xEF];
    bsp.send((pid + 1) % PROCESSES, &tag, &payload);
    bsp.sync()?;

    let mut received_tag = [0u8; 8];
    let status: usize = unsafe { bsp.get_tag(received_tag.as_mut_ptr()) };
    assert_eq!(status, payload.len());
    assert_eq!(
        u64::from_ne_bytes(received_tag) as usize,
        (pid + PROCESSES - 1) % PROCESSES
    );

    let mut received = [0u8; 3];
    unsafe { bsp.move_payload(received.as_mut_ptr(), received.len()) };
    assert_eq!(received, payload);

    bsp.end();
    Ok(())
}

#[test]
fn tag_size_change_takes_effect_at_sync() {
    let _guard = common::runtime_guard();
    common::run_spmd(tag_size_program).unwrap();
}

fn idempotent_tag_size_program() -> Result<(), Aborted> {
    const PROCESSES: usize = 2;

    let bsp = Bsp::instance();
    bsp.begin(PROCESSES);
    let pid: usize = bsp.pid();

    // proposing the current tag size changes nothing
    let mut size: usize = 0;
    bsp.set_tag_size(&mut size);
    assert_eq!(size, 0);
    bsp.sync()?;

    // empty tags still flow, even to ourselves
    bsp.send(pid, &[], &[42]);
    bsp.sync()?;
    let mut empty_tag = [0u8; 0];
    let status: usize = unsafe { bsp.get_tag(empty_tag.as_mut_ptr()) };
    assert_eq!(status, 1);

    bsp.end();
    Ok(())
}

#[test]
fn set_tag_size_is_idempotent() {
    let _guard = common::runtime_guard();
    common::run_spmd(idempotent_tag_size_program).unwrap();
}

fn reverse_put_program() -> Result<(), Aborted> {
    let bsp = Bsp::instance();
    bsp.begin(2);
    let pid: usize = bsp.pid();

    let mut byte: u8 = 0;
    unsafe { bsp.push_reg(&mut byte as *mut u8 as *const u8, 1) };
    bsp.sync()?;

    if pid == 0 {
        let first: u8 = 0xAA;
        let second: u8 = 0xBB;
        unsafe {
            bsp.put(1, &first as *const u8, &byte as *const u8, 0, 1);
            bsp.put(1, &second as *const u8, &byte as *const u8, 0, 1);
        }
    }
    bsp.sync()?;

    if pid == 1 {
        assert_eq!(byte, 0xAA, "the first-issued put wins");
    }
    bsp.end();
    Ok(())
}

#[test]
fn overlapping_puts_resolve_to_the_first_issued() {
    let _guard = common::runtime_guard();
    common::run_spmd(reverse_put_program).unwrap();
}

fn send_fifo_program() -> Result<(), Aborted> {
    const PROCESSES: usize = 4;

    let bsp = Bsp::instance();
    bsp.begin(PROCESSES);
    let pid: usize = bsp.pid();

    let to: usize = (pid + 1) % PROCESSES;
    for message in 1u8..=3 {
        bsp.send(to, &[], &[message]);
    }
    bsp.sync()?;

    assert_eq!(bsp.qsize(), (3, 3));
    for expected in 1u8..=3 {
        let mut empty_tag = [0u8; 0];
        let status: usize = unsafe { bsp.get_tag(empty_tag.as_mut_ptr()) };
        assert_eq!(status, 1);
        let mut received: u8 = 0;
        unsafe { bsp.move_payload(&mut received as *mut u8, 1) };
        assert_eq!(received, expected, "messages arrive in issuance order");
    }
    // the queue is exhausted but still counted until the next sync
    let mut empty_tag = [0u8; 0];
    assert_eq!(unsafe { bsp.get_tag(empty_tag.as_mut_ptr()) }, usize::MAX);
    assert_eq!(bsp.qsize(), (3, 3));

    // the next sync drops the delivered queue
    bsp.sync()?;
    assert_eq!(bsp.qsize(), (0, 0));

    bsp.end();
    Ok(())
}

#[test]
fn sends_are_fifo_per_direction() {
    let _guard = common::runtime_guard();
    common::run_spmd(send_fifo_program).unwrap();
}

fn get_before_put_program() -> Result<(), Aborted> {
    let bsp = Bsp::instance();
    bsp.begin(2);
    let pid: usize = bsp.pid();
    let other: usize = 1 - pid;

    let mut shared: u32 = (pid as u32 + 1) * 7;
    unsafe { bsp.push_reg(&mut shared as *mut u32 as *const u8, size_of::<u32>()) };
    bsp.sync()?;

    let mut fetched: u32 = 0;
    let replacement: u32 = 99 + pid as u32;
    unsafe {
        bsp.get(
            other,
            &shared as *const u32 as *const u8,
            0,
            &mut fetched as *mut u32 as *mut u8,
            size_of::<u32>(),
        );
        bsp.put(
            other,
            &replacement as *const u32 as *const u8,
            &shared as *const u32 as *const u8,
            0,
            size_of::<u32>(),
        );
    }
    bsp.sync()?;

    // the get snapshotted the neighbour's value before any put landed
    assert_eq!(fetched, (other as u32 + 1) * 7);
    // and the neighbour's put still reached us afterwards
    assert_eq!(shared, 99 + other as u32);

    bsp.end();
    Ok(())
}

#[test]
fn gets_observe_pre_put_values() {
    let _guard = common::runtime_guard();
    common::run_spmd(get_before_put_program).unwrap();
}

fn reregister_program() -> Result<(), Aborted> {
    let bsp = Bsp::instance();
    bsp.begin(2);
    let pid: usize = bsp.pid();
    let other: usize = 1 - pid;

    let mut first: u32 = 0;
    let mut second: u32 = 0;
    unsafe { bsp.push_reg(&mut first as *mut u32 as *const u8, size_of::<u32>()) };
    bsp.sync()?;

    // swap the binding and, in the same superstep, put through the old one
    let five: u32 = 5;
    unsafe {
        bsp.pop_reg(&first as *const u32 as *const u8);
        bsp.push_reg(&mut second as *mut u32 as *const u8, size_of::<u32>());
        bsp.put(
            other,
            &five as *const u32 as *const u8,
            &first as *const u32 as *const u8,
            0,
            size_of::<u32>(),
        );
    }
    bsp.sync()?;
    assert_eq!(first, 5, "in-flight puts use the binding they resolved");

    let nine: u32 = 9;
    unsafe {
        bsp.put(
            other,
            &nine as *const u32 as *const u8,
            &second as *const u32 as *const u8,
            0,
            size_of::<u32>(),
        )
    };
    bsp.sync()?;
    assert_eq!(second, 9, "the new registration is addressable after its sync");

    bsp.end();
    Ok(())
}

#[test]
fn popped_indices_stay_valid_for_in_flight_puts() {
    let _guard = common::runtime_guard();
    common::run_spmd(reregister_program).unwrap();
}

fn partial_move_program() -> Result<(), Aborted> {
    let bsp = Bsp::instance();
    bsp.begin(2);
    let pid: usize = bsp.pid();

    let payload: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
    bsp.send(1 - pid, &[], &payload);
    bsp.sync()?;

    let mut empty_tag = [0u8; 0];
    assert_eq!(unsafe { bsp.get_tag(empty_tag.as_mut_ptr()) }, 8);

    let mut received: [u8; 8] = [0; 8];
    unsafe { bsp.move_payload(received.as_mut_ptr(), 4) };
    assert_eq!(received, [1, 2, 3, 4, 0, 0, 0, 0], "only min(max, size) bytes move");

    bsp.end();
    Ok(())
}

#[test]
fn move_copies_at_most_the_requested_bytes() {
    let _guard = common::runtime_guard();
    common::run_spmd(partial_move_program).unwrap();
}
