//! Host code emission: code buffers, the shared per-opcode dispatch
//! machinery, and the x86-64 and AArch64 backends.
//!
//! Each backend lowers the same IR op set. Lowering is driven by the
//! shared block compiler (`compiler`), which walks regions in frontend
//! order and dispatches every node through the backend's opcode table.
//! Ops without a handler route through the fallback shim (`fallback`).

pub mod aarch64;
pub mod code_buffer;
pub mod compiler;
pub mod dispatch;
pub mod fallback;
pub mod x86_64;

pub use code_buffer::{CodeAllocator, CodeBuffer};
pub use compiler::{BlockCx, CompileRequest, CompiledBlock, DebugData};
pub use dispatch::DispatchTable;

use dbt_ir::IrBlock;

/// Compilation failures. Only `OutOfCodeSpace` is recoverable (the
/// thread clears its cache and re-emits); everything else terminates
/// the thread with a diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("backend cannot lower `{op}` at size {size}")]
    UnsupportedOp { op: &'static str, size: u8 },
    #[error("code buffer exhausted")]
    OutOfCodeSpace,
}

bitflags::bitflags! {
    /// Host ISA capabilities probed once at startup.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostFeatures: u32 {
        /// AArch64 SVE with a 256-bit vector length; enables the
        /// 32-byte vector paths.
        const SVE256 = 1 << 0;
    }
}

/// Byte offsets into the per-thread CpuStateFrame, filled in by the
/// runtime from the real layout. The emitted code hard-codes these, so
/// the same values must be used by the dispatcher stubs and the JIT.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameOffsets {
    // Guest state
    pub rip: u32,
    pub inline_block_header: u32,

    // Common pointer block
    pub loop_top: u32,
    pub exit_linker: u32,
    pub thread_stop: u32,
    pub thread_pause: u32,
    pub unimplemented: u32,
    pub overflow: u32,
    pub signal_return: u32,
    pub callback_return: u32,
    pub l1_base: u32,
    pub telemetry_base: u32,
    pub cpuid_obj: u32,
    pub cpuid_fn: u32,
    pub xcr_fn: u32,
    pub syscall_obj: u32,
    pub syscall_fn: u32,
    pub fragment_executer: u32,
    pub fallback_table: u32,
    pub signal_refcount: u32,

    // Unwind anchors
    pub stop_anchor: u32,
    pub callback_anchor: u32,
    pub stop_reason: u32,

    // Synchronous fault scratch
    pub fault_active: u32,
    pub fault_trapno: u32,
    pub fault_err_code: u32,
    pub fault_si_code: u32,
    pub fault_rip: u32,
}

/// Per-compilation configuration handed to a backend.
#[derive(Debug, Clone, Copy)]
pub struct CompileConfig {
    pub offsets: FrameOffsets,
    pub features: HostFeatures,
    /// Emit the running-mode pause check at block entry.
    pub pause_check: bool,
    /// Address of the process-wide running-mode word.
    pub running_mode_addr: u64,
    /// Address of the exit-linker trampoline; initial target of every
    /// block-link record.
    pub exit_linker_stub: u64,
}

/// Host-code entry points for the dispatcher's C-ABI callees, provided
/// by the runtime when the stubs are emitted.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherEntryPoints {
    /// `extern "C" fn(*mut Frame) -> u64` — find-or-compile.
    pub find_or_compile: u64,
    /// `extern "C" fn(*mut Frame, *mut u64) -> u64` — exit linker.
    pub exit_linker: u64,
    /// `extern "C" fn(*mut Frame)` — cooperative pause.
    pub pause: u64,
}

/// Addresses of the per-runtime dispatcher stubs. All live inside one
/// dedicated RWX region and are never modified after emission.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherStubs {
    pub enter: u64,
    pub loop_top: u64,
    pub exit_linker: u64,
    pub thread_stop: u64,
    pub thread_pause: u64,
    pub signal_return: u64,
    pub pause_return: u64,
    pub unimplemented: u64,
    pub overflow: u64,
    pub callback_return: u64,
    pub region_base: u64,
    pub region_size: usize,
}

impl DispatcherStubs {
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.region_base && pc < self.region_base + self.region_size as u64
    }
}

/// The backend surface the runtime drives.
pub trait CpuBackend {
    fn name(&self) -> &'static str;

    /// Lower one block. The buffer cursor advances past the emitted
    /// code; the returned record points into the buffer.
    fn compile(
        &mut self,
        buf: &mut CodeBuffer,
        req: &CompileRequest<'_>,
        debug: Option<&mut DebugData>,
    ) -> Result<CompiledBlock, CompileError>;

    /// Emit the dispatcher stub set into its dedicated region.
    fn emit_dispatcher(
        &mut self,
        buf: &mut CodeBuffer,
        offsets: &FrameOffsets,
        entries: &DispatcherEntryPoints,
    ) -> DispatcherStubs;

    /// Emit a trampoline that keeps `block` in IR form: calls the
    /// registered fragment-executer with the frame and a pointer to the
    /// serialized IR, then re-enters the dispatcher loop.
    fn emit_interpreter_trampoline(
        &mut self,
        buf: &mut CodeBuffer,
        block: &IrBlock,
        offsets: &FrameOffsets,
    ) -> Result<CompiledBlock, CompileError>;
}

/// Fixed 16-byte marker at the start of every emitted block. Holds the
/// forward offset to the `CodeTail`; read by the signal adapter.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CodeHeader {
    pub tail_offset: u64,
    pub magic: u64,
}

pub const CODE_HEADER_MAGIC: u64 = 0x4b4c_4254_424a_4444; // "DDJBTBLK"

/// Trailing block record: identity plus the RIP reconstruction map.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CodeTail {
    pub guest_rip: u64,
    pub size: u64,
    pub rip_map_offset: u32,
    pub rip_map_entries: u32,
}

/// One RIP map entry: host offset (from block begin) at which the
/// guest instruction starting at `guest_off` (from entry RIP) begins.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipMapEntry {
    pub host_off: u32,
    pub guest_off: u32,
}
