//! Signal classification and guest-RIP reconstruction.
//!
//! The external signal framework owns signal registration and
//! delivery; the core contributes three callbacks with the contract
//! `(thread, signo, siginfo, ucontext) -> handled`. A faulting host PC
//! is classified as dispatcher stub, emitted code, or foreign; faults
//! in emitted code are rewritten into guest faults using the block's
//! RIP map.

use crate::thread::{StopReason, ThreadCore};
use dbt_jit::CODE_HEADER_MAGIC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcClass {
    /// One of the fixed fault stubs in the dispatcher region.
    Stub(StubKind),
    /// Inside a compiled block of the current cache generation.
    Emitted,
    /// Anywhere else (host libraries, the runtime itself).
    Foreign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    SignalReturn,
    PauseReturn,
    Unimplemented,
    Overflow,
    Dispatcher,
}

pub fn classify_pc(thread: &ThreadCore, pc: u64) -> PcClass {
    let stubs = thread.runtime().stubs();
    if pc == stubs.signal_return {
        return PcClass::Stub(StubKind::SignalReturn);
    }
    if pc == stubs.pause_return {
        return PcClass::Stub(StubKind::PauseReturn);
    }
    if pc == stubs.unimplemented {
        return PcClass::Stub(StubKind::Unimplemented);
    }
    if pc == stubs.overflow {
        return PcClass::Stub(StubKind::Overflow);
    }
    if stubs.contains(pc) {
        return PcClass::Stub(StubKind::Dispatcher);
    }
    if reconstruct_guest_rip(thread, pc).is_some() {
        return PcClass::Emitted;
    }
    PcClass::Foreign
}

/// Map a host PC inside an emitted block back to the guest RIP of the
/// instruction that produced it, via the code-header back-offset and
/// the trailing RIP map.
pub fn reconstruct_guest_rip(thread: &ThreadCore, host_pc: u64) -> Option<u64> {
    // Fast path: the block the thread last entered, published through
    // the frame by every block prologue.
    let header = thread.frame.state.inline_block_header;
    if header != 0 {
        if let Some(rip) = rip_from_header(header, host_pc) {
            return Some(rip);
        }
    }
    // Slow path: scan the installed blocks.
    let info = thread.cache.find_block_by_host_pc(host_pc)?;
    rip_from_header(info.begin, host_pc)
}

fn rip_from_header(header: u64, host_pc: u64) -> Option<u64> {
    // SAFETY: `header` points at an emitted code header in a live
    // buffer; all reads stay inside the block it describes.
    unsafe {
        let tail_offset = (header as *const u64).read_unaligned();
        let magic = ((header + 8) as *const u64).read_unaligned();
        if magic != CODE_HEADER_MAGIC {
            return None;
        }
        let tail = header + tail_offset;
        let guest_rip = (tail as *const u64).read_unaligned();
        let size = ((tail + 8) as *const u64).read_unaligned();
        let map_off = ((tail + 16) as *const u32).read_unaligned() as u64;
        let entries = ((tail + 20) as *const u32).read_unaligned();

        if host_pc < header || host_pc >= header + size {
            return None;
        }
        let rel = (host_pc - header) as u32;
        let mut guest_off = 0u32;
        for i in 0..entries as u64 {
            let e = tail + map_off + i * 8;
            let host_off = (e as *const u32).read_unaligned();
            if host_off > rel {
                break;
            }
            guest_off = ((e + 4) as *const u32).read_unaligned();
        }
        Some(guest_rip.wrapping_add(guest_off as u64))
    }
}

// -- ucontext accessors ----------------------------------------------

#[cfg(target_arch = "x86_64")]
pub fn uc_pc(uctx: &libc::ucontext_t) -> u64 {
    uctx.uc_mcontext.gregs[libc::REG_RIP as usize] as u64
}

#[cfg(target_arch = "x86_64")]
pub fn set_uc_pc(uctx: &mut libc::ucontext_t, pc: u64) {
    uctx.uc_mcontext.gregs[libc::REG_RIP as usize] = pc as i64;
}

#[cfg(target_arch = "aarch64")]
pub fn uc_pc(uctx: &libc::ucontext_t) -> u64 {
    uctx.uc_mcontext.pc
}

#[cfg(target_arch = "aarch64")]
pub fn set_uc_pc(uctx: &mut libc::ucontext_t, pc: u64) {
    uctx.uc_mcontext.pc = pc;
}

fn trapno_for_signal(signo: i32) -> u32 {
    match signo {
        libc::SIGILL => 6,
        libc::SIGTRAP => 3,
        libc::SIGFPE => 0,
        libc::SIGSEGV => 14,
        _ => 0,
    }
}

/// Redirect the interrupted context to the registered guest-signal
/// entry. The default entry unwinds through the stop anchor, so the
/// dispatcher returns `GuestFault`.
fn deliver_to_guest(thread: &mut ThreadCore, signo: i32, uctx: &mut libc::ucontext_t) {
    thread.frame.stop_reason = StopReason::GuestFault(signo).encode();
    let entry = thread.frame.pointers.guest_signal_entry;
    set_uc_pc(uctx, entry);
    thread.telemetry.signals_classified += 1;
}

/// Synchronous-fault callback (SIGILL/SIGSEGV/SIGTRAP/SIGFPE).
///
/// Returns whether the fault was consumed; `false` asks the framework
/// to forward it (fault in host code).
pub fn handle_guest_fault(
    thread: &mut ThreadCore,
    signo: i32,
    info: &libc::siginfo_t,
    uctx: &mut libc::ucontext_t,
) -> bool {
    let pc = uc_pc(uctx);
    match classify_pc(thread, pc) {
        PcClass::Stub(StubKind::Unimplemented) | PcClass::Stub(StubKind::Overflow) => {
            // The Break lowering already filled the fault record and
            // synchronized RIP; just deliver.
            deliver_to_guest(thread, signo, uctx);
            true
        }
        PcClass::Stub(_) => {
            // Return-site markers and dispatcher internals belong to
            // the framework.
            false
        }
        PcClass::Emitted => {
            let rip = reconstruct_guest_rip(thread, pc)
                .expect("classified as emitted code without a RIP mapping");
            thread.frame.state.rip = rip;
            thread.frame.fault.active = 1;
            thread.frame.fault.trapno = trapno_for_signal(signo);
            thread.frame.fault.err_code = 0;
            thread.frame.fault.si_code = info.si_code as u32;
            thread.frame.fault.fault_rip = rip;
            deliver_to_guest(thread, signo, uctx);
            true
        }
        PcClass::Foreign => false,
    }
}

/// SIGILL callback: same classification, fixed signal number.
pub fn handle_sigill(
    thread: &mut ThreadCore,
    _signo: i32,
    info: &libc::siginfo_t,
    uctx: &mut libc::ucontext_t,
) -> bool {
    handle_guest_fault(thread, libc::SIGILL, info, uctx)
}

/// Pause-signal callback: raise the cooperative pause bit so every
/// block prologue diverts, and stop immediately if the signal landed
/// on emitted or dispatcher code.
pub fn handle_pause_signal(
    thread: &mut ThreadCore,
    _signo: i32,
    _info: &libc::siginfo_t,
    uctx: &mut libc::ucontext_t,
) -> bool {
    thread.runtime().set_running_mode(1);
    let pc = uc_pc(uctx);
    if classify_pc(thread, pc) == PcClass::Emitted {
        if let Some(rip) = reconstruct_guest_rip(thread, pc) {
            thread.frame.state.rip = rip;
        }
    }
    thread.request_stop(StopReason::Paused);
    true
}
