//! Execution core: dispatcher, lookup cache, block linking, signal
//! classification, and the per-thread compile-lookup-execute loop.
//!
//! Process-wide immutable state lives in [`Runtime`], created once and
//! shared by reference. Everything mutable (caches, code buffers,
//! frame) is owned by a [`ThreadCore`], one per guest thread.

pub mod frame;
pub mod lookup_cache;
pub mod signals;
pub mod telemetry;
pub mod thread;

pub use frame::{frame_offsets, CpuStateFrame};
pub use lookup_cache::{BlockInfo, CacheError, LinkRecord, LookupCache};
pub use telemetry::Telemetry;
pub use thread::{StopReason, ThreadCore};

use dbt_jit::code_buffer::{CodeAllocator, CodeBuffer};
use dbt_jit::{CpuBackend, DispatcherEntryPoints, DispatcherStubs, HostFeatures};
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(target_arch = "x86_64")]
pub type HostBackend = dbt_jit::x86_64::X86_64Backend;
#[cfg(target_arch = "aarch64")]
pub type HostBackend = dbt_jit::aarch64::Aarch64Backend;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("only x86-64 and AArch64 hosts are supported");

/// CPUID result as emitted code receives it: 16-byte POD returned in
/// the first two return registers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuIdResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// CPUID/XCR emulation; thread-safe by contract.
pub trait CpuIdHandler: Send + Sync {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult;
    fn xcr(&self, index: u32) -> u64;
}

/// What the syscall handler wants the thread to do next.
#[derive(Debug, Clone, Copy)]
pub enum SyscallOutcome {
    /// Continue with this return value in the destination register.
    Ret(i64),
    /// Stop the thread at the next dispatcher entry.
    Stop(StopReason),
}

pub trait SyscallHandler: Send {
    /// Guest arguments are read from the frame (the frontend stores
    /// them to the scratch area or guest registers before the op).
    fn syscall(&mut self, frame: &mut CpuStateFrame, nr: u64) -> SyscallOutcome;
}

/// Frontend contract: decode guest code at `rip` into an IR block plus
/// the register-allocation oracle data.
pub trait Frontend: Send {
    fn build_block(&mut self, rip: u64) -> (dbt_ir::IrBlock, dbt_ir::RaData);
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Emit the running-mode pause check at every block entry.
    pub pause_check: bool,
    /// Keep blocks in IR form and run them through the interpreter
    /// trampoline instead of lowering.
    pub force_interpreter: bool,
    /// Map code buffers W^X and toggle with mprotect.
    pub wx_exclusive: bool,
    pub initial_code_size: usize,
    pub max_code_size: usize,
    pub features: HostFeatures,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pause_check: false,
            force_interpreter: false,
            wx_exclusive: false,
            initial_code_size: dbt_jit::code_buffer::INITIAL_CODE_SIZE,
            max_code_size: dbt_jit::code_buffer::MAX_CODE_SIZE,
            features: HostFeatures::empty(),
        }
    }
}

/// Process-wide immutable runtime: configuration, the running-mode
/// word, and the dispatcher stub region (emitted once, never modified
/// afterwards).
pub struct Runtime {
    pub config: RuntimeConfig,
    running_mode: AtomicU32,
    stubs: DispatcherStubs,
    /// Keeps the stub region mapped for the process lifetime.
    _dispatcher_buf: CodeBuffer,
}

// SAFETY: the stub region is emitted once in `new` and never written
// again; every other field is immutable or atomic.
unsafe impl Sync for Runtime {}

/// Dispatcher stub region size; generous for both backends.
const DISPATCHER_REGION_SIZE: usize = 4096;

impl Runtime {
    pub fn new(config: RuntimeConfig) -> std::io::Result<std::sync::Arc<Runtime>> {
        let allocator = CodeAllocator::new(false);
        let mut buf = allocator.acquire(DISPATCHER_REGION_SIZE)?;
        let entries = DispatcherEntryPoints {
            find_or_compile: thread::find_or_compile_entry as usize as u64,
            exit_linker: thread::exit_linker_entry as usize as u64,
            pause: thread::pause_entry as usize as u64,
        };
        let mut backend = HostBackend::new();
        let stubs = backend.emit_dispatcher(&mut buf, &frame_offsets(), &entries);
        tracing::debug!(
            base = format_args!("{:#x}", stubs.region_base),
            size = stubs.region_size,
            backend = backend.name(),
            "dispatcher stubs emitted"
        );
        Ok(std::sync::Arc::new(Runtime {
            config,
            running_mode: AtomicU32::new(0),
            stubs,
            _dispatcher_buf: buf,
        }))
    }

    pub fn stubs(&self) -> &DispatcherStubs {
        &self.stubs
    }

    /// Address of the running-mode word emitted blocks poll.
    pub fn running_mode_addr(&self) -> u64 {
        &self.running_mode as *const AtomicU32 as u64
    }

    /// Cooperative pause bit. Writes go through here; JIT code only
    /// reads.
    pub fn set_running_mode(&self, val: u32) {
        self.running_mode.store(val, Ordering::Release);
    }

    pub fn running_mode(&self) -> u32 {
        self.running_mode.load(Ordering::Acquire)
    }
}
