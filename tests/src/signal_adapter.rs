//! Signal classification, RIP reconstruction, and scenario S3
//! (guest SIGILL delivered from inside emitted code).
#![cfg(target_arch = "x86_64")]

use crate::harness::*;
use dbt_exec::signals::{classify_pc, handle_guest_fault, reconstruct_guest_rip, PcClass, StubKind};
use dbt_exec::{StopReason, ThreadCore};
use dbt_exec::frame::{greg, greg_offset};
use dbt_ir::types::FaultKind;
use dbt_ir::IrBuilder;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn stub_addresses_classify() {
    let fe = MapFrontend::new().with_exit_block();
    let rt = make_runtime(test_config());
    let t = make_thread(&rt, fe);
    let stubs = rt.stubs();

    assert_eq!(
        classify_pc(&t, stubs.signal_return),
        PcClass::Stub(StubKind::SignalReturn)
    );
    assert_eq!(
        classify_pc(&t, stubs.pause_return),
        PcClass::Stub(StubKind::PauseReturn)
    );
    assert_eq!(
        classify_pc(&t, stubs.unimplemented),
        PcClass::Stub(StubKind::Unimplemented)
    );
    assert_eq!(
        classify_pc(&t, stubs.overflow),
        PcClass::Stub(StubKind::Overflow)
    );
    assert_eq!(
        classify_pc(&t, stubs.loop_top),
        PcClass::Stub(StubKind::Dispatcher)
    );
    // The four fault stubs are distinct addresses.
    let mut addrs = [
        stubs.signal_return,
        stubs.pause_return,
        stubs.unimplemented,
        stubs.overflow,
    ];
    addrs.sort_unstable();
    addrs.windows(2).for_each(|w| assert_ne!(w[0], w[1]));

    assert_eq!(classify_pc(&t, 0x1234_5678), PcClass::Foreign);
}

/// Property 5: every host PC inside an emitted block maps back to a
/// recorded guest RIP.
#[test]
fn rip_map_reconstruction() {
    const A: u64 = 0x6000;
    let mut fe = MapFrontend::new().with_exit_block();
    let mut b = IrBuilder::new(A);
    b.insn_start(0);
    let c1 = b.constant(8, 1);
    b.store_context(8, greg_offset(greg::RAX), c1);
    b.insn_start(4);
    let c2 = b.constant(8, 2);
    b.store_context(8, greg_offset(greg::RBX), c2);
    b.insn_start(9);
    let rip = b.constant(8, EXIT_RIP);
    b.exit_block(rip);
    fe.insert(b.finish());

    let rt = make_runtime(test_config());
    let mut t = make_thread(&rt, fe);
    t.find_or_compile(A);

    let info = *t.cache.block_info(A).unwrap();
    // The block prologue precedes the first guest instruction.
    assert_eq!(reconstruct_guest_rip(&t, info.begin), Some(A));
    // Every mapped PC reconstructs to one of the recorded RIPs.
    let mut seen = std::collections::BTreeSet::new();
    for pc in info.begin..info.begin + info.size as u64 {
        let rip = reconstruct_guest_rip(&t, pc).expect("pc inside block must map");
        seen.insert(rip);
    }
    assert_eq!(
        seen.into_iter().collect::<Vec<_>>(),
        vec![A, A + 4, A + 9]
    );
    // One byte past the block no longer maps through the cache scan.
    assert_eq!(classify_pc(&t, info.begin + info.size as u64), PcClass::Foreign);
}

// Scenario S3 needs a real SIGILL round trip; the handler recovers
// the thread through a process-global slot, standing in for the
// external signal framework's per-thread registry.
static THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

extern "C" fn sigill_trampoline(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let thread = THREAD_SLOT.load(Ordering::Acquire) as *mut ThreadCore;
    // SAFETY: the test installs a live thread pointer before raising
    // and the kernel hands us valid siginfo/ucontext.
    unsafe {
        let handled = handle_guest_fault(
            &mut *thread,
            signo,
            &*info,
            &mut *(ctx as *mut libc::ucontext_t),
        );
        assert!(handled, "fault in emitted code must be consumed");
    }
}

#[test]
fn s3_guest_sigill_delivery() {
    const A: u64 = 0x6100;
    let mut fe = MapFrontend::new().with_exit_block();
    let mut b = IrBuilder::new(A);
    b.insn_start(0);
    b.break_fault(FaultKind::IllegalInstruction, 0);
    fe.insert(b.finish());

    let rt = make_runtime(test_config());
    let mut t = make_thread(&rt, fe);
    THREAD_SLOT.store(t.as_mut() as *mut ThreadCore as usize, Ordering::Release);

    // Stand-in signal framework: route SIGILL to the adapter.
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = sigill_trampoline as usize;
    sa.sa_flags = libc::SA_SIGINFO;
    unsafe {
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGILL, &sa, &mut old);
    }

    let reason = run_from(&mut t, A);

    unsafe {
        libc::sigaction(libc::SIGILL, &old, std::ptr::null_mut());
    }
    THREAD_SLOT.store(0, Ordering::Release);

    assert_eq!(reason, StopReason::GuestFault(libc::SIGILL));
    assert_eq!(t.frame.fault.active, 1);
    assert_eq!(t.frame.fault.trapno, 6);
    assert_eq!(t.frame.fault.fault_rip, A);
    assert_eq!(t.frame.state.rip, A);
    assert_eq!(t.telemetry.signals_classified, 1);
}
