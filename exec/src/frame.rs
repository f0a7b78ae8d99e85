//! Per-thread CPU state frame.
//!
//! The layout is an ABI contract: emitted code addresses every field
//! through the pinned frame register using the offsets exported by
//! [`frame_offsets`], and the dispatcher stubs use the same values.

use dbt_jit::fallback::FALLBACK_FN_COUNT;
use dbt_jit::FrameOffsets;
use std::mem::offset_of;

/// Architectural guest state (x86-64 guest).
#[repr(C)]
pub struct CpuState {
    pub rip: u64,
    pub gregs: [u64; 16],
    pub rflags: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    /// 256-bit vector register slots.
    pub xmm: [[u64; 4]; 16],
    /// Address of the code header of the currently executing block;
    /// written by every block prologue, read by the signal adapter.
    pub inline_block_header: u64,
}

/// Guest register indices into `CpuState::gregs`.
pub mod greg {
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
}

/// Addresses emitted code reaches through the frame register. All are
/// opaque u64s: the JIT patches and branches through them but never
/// dereferences them as typed pointers.
#[repr(C)]
pub struct CommonPointers {
    pub dispatcher_loop_top: u64,
    pub exit_function_linker: u64,
    pub thread_stop_handler: u64,
    pub thread_pause_handler: u64,
    pub unimplemented_instruction: u64,
    pub overflow_exception: u64,
    pub signal_return: u64,
    pub callback_return: u64,
    pub guest_signal_entry: u64,
    pub l1_base: u64,
    pub telemetry_base: u64,
    pub cpuid_obj: u64,
    pub cpuid_fn: u64,
    pub xcr_fn: u64,
    pub syscall_obj: u64,
    pub syscall_fn: u64,
    pub fragment_executer: u64,
    pub signal_handler_refcount: u64,
    pub fallback_handlers: [u64; FALLBACK_FN_COUNT],
}

/// Structured unwinding anchor: the dispatcher records its stack
/// pointer and a resume address here on entry; the stop path restores
/// them instead of longjmp.
#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct JumpAnchor {
    pub sp: u64,
    pub pc: u64,
}

/// Synchronous fault scratch filled by `Break` lowering before
/// diverting to a fault stub.
#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct FaultScratch {
    pub active: u32,
    pub trapno: u32,
    pub err_code: u32,
    pub si_code: u32,
    pub fault_rip: u64,
}

#[repr(C)]
pub struct CpuStateFrame {
    pub state: CpuState,
    pub pointers: CommonPointers,
    pub stop_anchor: JumpAnchor,
    pub callback_anchor: JumpAnchor,
    pub fault: FaultScratch,
    /// Staging area for syscall arguments and similar marshaling.
    pub scratch_args: [u64; 8],
    pub stop_reason: u64,
    /// Opaque pointer back to the owning ThreadCore.
    pub thread: u64,
}

impl Default for CpuStateFrame {
    fn default() -> Self {
        // SAFETY: every field is plain-old-data and all-zeroes is a
        // valid (empty) state.
        unsafe { std::mem::zeroed() }
    }
}

/// Offsets handed to the JIT and the dispatcher emitter.
pub fn frame_offsets() -> FrameOffsets {
    const STATE: usize = offset_of!(CpuStateFrame, state);
    const PTRS: usize = offset_of!(CpuStateFrame, pointers);
    const FAULT: usize = offset_of!(CpuStateFrame, fault);
    FrameOffsets {
        rip: (STATE + offset_of!(CpuState, rip)) as u32,
        inline_block_header: (STATE + offset_of!(CpuState, inline_block_header)) as u32,

        loop_top: (PTRS + offset_of!(CommonPointers, dispatcher_loop_top)) as u32,
        exit_linker: (PTRS + offset_of!(CommonPointers, exit_function_linker)) as u32,
        thread_stop: (PTRS + offset_of!(CommonPointers, thread_stop_handler)) as u32,
        thread_pause: (PTRS + offset_of!(CommonPointers, thread_pause_handler)) as u32,
        unimplemented: (PTRS + offset_of!(CommonPointers, unimplemented_instruction)) as u32,
        overflow: (PTRS + offset_of!(CommonPointers, overflow_exception)) as u32,
        signal_return: (PTRS + offset_of!(CommonPointers, signal_return)) as u32,
        callback_return: (PTRS + offset_of!(CommonPointers, callback_return)) as u32,
        l1_base: (PTRS + offset_of!(CommonPointers, l1_base)) as u32,
        telemetry_base: (PTRS + offset_of!(CommonPointers, telemetry_base)) as u32,
        cpuid_obj: (PTRS + offset_of!(CommonPointers, cpuid_obj)) as u32,
        cpuid_fn: (PTRS + offset_of!(CommonPointers, cpuid_fn)) as u32,
        xcr_fn: (PTRS + offset_of!(CommonPointers, xcr_fn)) as u32,
        syscall_obj: (PTRS + offset_of!(CommonPointers, syscall_obj)) as u32,
        syscall_fn: (PTRS + offset_of!(CommonPointers, syscall_fn)) as u32,
        fragment_executer: (PTRS + offset_of!(CommonPointers, fragment_executer)) as u32,
        fallback_table: (PTRS + offset_of!(CommonPointers, fallback_handlers)) as u32,
        signal_refcount: (PTRS + offset_of!(CommonPointers, signal_handler_refcount)) as u32,

        stop_anchor: offset_of!(CpuStateFrame, stop_anchor) as u32,
        callback_anchor: offset_of!(CpuStateFrame, callback_anchor) as u32,
        stop_reason: offset_of!(CpuStateFrame, stop_reason) as u32,

        fault_active: (FAULT + offset_of!(FaultScratch, active)) as u32,
        fault_trapno: (FAULT + offset_of!(FaultScratch, trapno)) as u32,
        fault_err_code: (FAULT + offset_of!(FaultScratch, err_code)) as u32,
        fault_si_code: (FAULT + offset_of!(FaultScratch, si_code)) as u32,
        fault_rip: (FAULT + offset_of!(FaultScratch, fault_rip)) as u32,
    }
}

/// Context offset of a guest GPR, for frontends building
/// `LoadContext`/`StoreContext`.
pub fn greg_offset(index: usize) -> u64 {
    (offset_of!(CpuStateFrame, state) + offset_of!(CpuState, gregs) + index * 8) as u64
}

pub fn rip_offset() -> u64 {
    (offset_of!(CpuStateFrame, state) + offset_of!(CpuState, rip)) as u64
}

pub fn xmm_offset(index: usize) -> u64 {
    (offset_of!(CpuStateFrame, state) + offset_of!(CpuState, xmm) + index * 32) as u64
}

pub fn scratch_args_offset(index: usize) -> u64 {
    (offset_of!(CpuStateFrame, scratch_args) + index * 8) as u64
}
