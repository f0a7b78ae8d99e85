//! Per-thread execution core.
//!
//! One `ThreadCore` per guest thread owns the frame, lookup cache,
//! code buffer, backend and emitter state; nothing here is shared
//! across threads. The dispatcher stubs call back into this module
//! through the C-ABI entry points at the bottom.

use crate::frame::{frame_offsets, CpuStateFrame};
use crate::lookup_cache::{BlockInfo, CacheError, L1Entry, LinkRecord, LookupCache, L1_MASK};
use crate::telemetry::Telemetry;
use crate::{
    CpuIdHandler, CpuIdResult, Frontend, HostBackend, Runtime, SyscallHandler, SyscallOutcome,
};
use dbt_ir::interp::{self, InterpExit, InterpServices};
use dbt_ir::types::FaultKind;
use dbt_jit::code_buffer::{CodeAllocator, CodeBuffer};
use dbt_jit::compiler::CompileRequest;
use dbt_jit::fallback::fill_fallback_table;
use dbt_jit::{CompileConfig, CompileError, CpuBackend, FrameOffsets};
use std::sync::Arc;

/// Why the dispatcher's enter stub returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Guest requested exit with this code.
    Exit(i32),
    /// Cooperative pause (running-mode word or pause signal).
    Paused,
    /// Synchronous guest fault awaiting delivery; signal number.
    GuestFault(i32),
    /// External stop request.
    Requested,
}

impl StopReason {
    pub fn encode(self) -> u64 {
        match self {
            StopReason::Exit(code) => (1u64 << 32) | code as u32 as u64,
            StopReason::Paused => 2u64 << 32,
            StopReason::GuestFault(signo) => (3u64 << 32) | signo as u32 as u64,
            StopReason::Requested => 4u64 << 32,
        }
    }

    pub fn decode(raw: u64) -> StopReason {
        match raw >> 32 {
            1 => StopReason::Exit(raw as u32 as i32),
            2 => StopReason::Paused,
            3 => StopReason::GuestFault(raw as u32 as i32),
            _ => StopReason::Requested,
        }
    }
}

/// Signal-safe compile critical section: all signals masked for the
/// guard's lifetime. The emitter allocates from non-reentrant
/// allocators, so a handler that tried to translate or clear the cache
/// mid-compile would corrupt state; pending signals deliver on drop.
pub struct SignalMaskGuard {
    old: libc::sigset_t,
}

impl SignalMaskGuard {
    pub fn new() -> Self {
        // SAFETY: plain sigprocmask bookkeeping on this thread.
        unsafe {
            let mut all: libc::sigset_t = std::mem::zeroed();
            let mut old: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut all);
            libc::sigprocmask(libc::SIG_SETMASK, &all, &mut old);
            Self { old }
        }
    }
}

impl Default for SignalMaskGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalMaskGuard {
    fn drop(&mut self) {
        // SAFETY: restores the mask captured in new().
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}

pub struct ThreadCore {
    pub frame: Box<CpuStateFrame>,
    pub cache: LookupCache,
    pub telemetry: Box<Telemetry>,
    runtime: Arc<Runtime>,
    backend: HostBackend,
    allocator: CodeAllocator,
    code_buf: CodeBuffer,
    offsets: FrameOffsets,
    frontend: Box<dyn Frontend>,
    syscall: Box<dyn SyscallHandler>,
    cpuid: Box<dyn CpuIdHandler>,
    pause_hook: Option<Box<dyn FnMut(&mut CpuStateFrame) + Send>>,
    stop_requested: Option<StopReason>,
}

impl ThreadCore {
    pub fn new(
        runtime: Arc<Runtime>,
        frontend: Box<dyn Frontend>,
        syscall: Box<dyn SyscallHandler>,
        cpuid: Box<dyn CpuIdHandler>,
    ) -> std::io::Result<Box<ThreadCore>> {
        let allocator = CodeAllocator::new(runtime.config.wx_exclusive);
        let code_buf = allocator.acquire(runtime.config.initial_code_size)?;
        let mut thread = Box::new(ThreadCore {
            frame: Box::new(CpuStateFrame::default()),
            cache: LookupCache::new(),
            telemetry: Box::new(Telemetry::default()),
            runtime,
            backend: HostBackend::new(),
            allocator,
            code_buf,
            offsets: frame_offsets(),
            frontend,
            syscall,
            cpuid,
            pause_hook: None,
            stop_requested: None,
        });
        thread.wire_frame();
        thread.emit_detection_string()?;
        Ok(thread)
    }

    /// Fill the frame's pointer block. Must run after boxing so every
    /// address stays stable for the thread's lifetime.
    fn wire_frame(&mut self) {
        let stubs = *self.runtime.stubs();
        let p = &mut self.frame.pointers;
        p.dispatcher_loop_top = stubs.loop_top;
        p.exit_function_linker = stubs.exit_linker;
        p.thread_stop_handler = stubs.thread_stop;
        p.thread_pause_handler = stubs.thread_pause;
        p.unimplemented_instruction = stubs.unimplemented;
        p.overflow_exception = stubs.overflow;
        p.signal_return = stubs.signal_return;
        p.callback_return = stubs.callback_return;
        // Until the thread-lifecycle framework registers a guest
        // signal entry, faults unwind cleanly through the stop path.
        p.guest_signal_entry = stubs.thread_stop;
        p.l1_base = self.cache.l1_base();
        p.telemetry_base = self.telemetry.as_ref() as *const Telemetry as u64;
        p.cpuid_obj = &mut self.cpuid as *mut Box<dyn CpuIdHandler> as u64;
        p.cpuid_fn = cpuid_shim as usize as u64;
        p.xcr_fn = xcr_shim as usize as u64;
        p.syscall_obj = &mut self.syscall as *mut Box<dyn SyscallHandler> as u64;
        p.syscall_fn = syscall_shim as usize as u64;
        p.fragment_executer = fragment_executer_entry as usize as u64;
        p.signal_handler_refcount = 0;
        fill_fallback_table(&mut p.fallback_handlers);
        self.frame.thread = self.as_thread_ptr();
    }

    fn as_thread_ptr(&mut self) -> u64 {
        self as *mut ThreadCore as u64
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn code_buffer(&self) -> &CodeBuffer {
        &self.code_buf
    }

    pub fn set_guest_signal_entry(&mut self, addr: u64) {
        self.frame.pointers.guest_signal_entry = addr;
    }

    pub fn set_pause_hook(&mut self, hook: Box<dyn FnMut(&mut CpuStateFrame) + Send>) {
        self.pause_hook = Some(hook);
    }

    pub fn request_stop(&mut self, reason: StopReason) {
        self.stop_requested = Some(reason);
    }

    /// Enter the dispatcher and run guest code until the thread stops.
    pub fn run(&mut self) -> StopReason {
        let enter: extern "C" fn(*mut CpuStateFrame) -> u64 =
            // SAFETY: the enter stub was emitted with exactly this ABI.
            unsafe { std::mem::transmute(self.runtime.stubs().enter as usize) };
        let frame = self.frame.as_mut() as *mut CpuStateFrame;
        let raw = enter(frame);
        self.stop_requested = None;
        StopReason::decode(raw)
    }

    fn compile_config(&self) -> CompileConfig {
        CompileConfig {
            offsets: self.offsets,
            features: self.runtime.config.features,
            pause_check: self.runtime.config.pause_check,
            running_mode_addr: self.runtime.running_mode_addr(),
            exit_linker_stub: self.runtime.stubs().exit_linker,
        }
    }

    /// Resolve a guest RIP to host code, compiling on miss. Public
    /// form of the dispatcher's find-or-compile path.
    pub fn find_or_compile(&mut self, rip: u64) -> u64 {
        match self.cache.find(rip) {
            Ok(Some(host)) => host,
            _ => {
                self.telemetry.l1_misses += 1;
                self.lookup_slow(rip)
            }
        }
    }

    /// Secondary-tier lookup with compile-on-miss. The L1 probe has
    /// already missed when this runs.
    fn lookup_slow(&mut self, rip: u64) -> u64 {
        match self.cache.find(rip) {
            Ok(Some(host)) => {
                self.telemetry.secondary_hits += 1;
                return host;
            }
            Ok(None) => {}
            // Stale handle from a retired buffer: treated as a miss.
            Err(CacheError::CacheCleared) => {}
        }
        {
            let _mask = SignalMaskGuard::new();
            self.compile_block(rip);
        }
        match self.cache.find(rip) {
            Ok(Some(host)) => host,
            _ => unreachable!("freshly compiled block missing from cache"),
        }
    }

    /// Translate the block at `rip` and install it. Must run inside
    /// the signal-safe critical section.
    fn compile_block(&mut self, rip: u64) {
        let (block, ra) = self.frontend.build_block(rip);
        debug_assert_eq!(block.entry_rip, rip);

        let mut cleared = false;
        loop {
            if self.code_buf.set_writable().is_err() {
                fatal(rip, "cannot make code buffer writable");
            }
            let result = if self.runtime.config.force_interpreter {
                self.backend
                    .emit_interpreter_trampoline(&mut self.code_buf, &block, &self.offsets)
            } else {
                let config = self.compile_config();
                let req = CompileRequest {
                    block: &block,
                    ra: &ra,
                    config: &config,
                };
                self.backend.compile(&mut self.code_buf, &req, None)
            };
            if self.code_buf.set_executable().is_err() {
                fatal(rip, "cannot make code buffer executable");
            }

            match result {
                Ok(compiled) => {
                    self.cache.install(
                        rip,
                        BlockInfo {
                            host_entry: self.code_buf.addr_at(compiled.entry),
                            begin: self.code_buf.addr_at(compiled.begin),
                            size: compiled.size,
                            generation: 0,
                        },
                    );
                    self.telemetry.blocks_compiled += 1;
                    return;
                }
                Err(CompileError::OutOfCodeSpace) if !cleared => {
                    self.clear_cache();
                    cleared = true;
                }
                Err(err) => {
                    tracing::error!(
                        rip = format_args!("{rip:#x}"),
                        %err,
                        "unrecoverable compile failure"
                    );
                    std::process::abort();
                }
            }
        }
    }

    /// Retire the current code contents: undo every block link, empty
    /// both cache tiers, and rewind (or grow) the buffer.
    pub fn clear_cache(&mut self) {
        self.cache.clear();

        let cap = self.code_buf.capacity();
        let max = self.runtime.config.max_code_size;
        if cap < max {
            match self.allocator.acquire((cap * 2).min(max)) {
                Ok(new_buf) => {
                    let old = std::mem::replace(&mut self.code_buf, new_buf);
                    self.allocator.release(old);
                }
                // Growth is opportunistic; reuse in place on failure.
                Err(_) => self.code_buf.clear(),
            }
        } else {
            self.code_buf.clear();
        }

        if self.emit_detection_string().is_err() {
            fatal(0, "cannot reinitialize code buffer");
        }
        self.telemetry.cache_clears += 1;
    }

    /// ASCII marker at the start of every fresh buffer, so raw dumps
    /// identify the producing JIT.
    fn emit_detection_string(&mut self) -> std::io::Result<()> {
        self.code_buf.set_writable()?;
        self.code_buf.emit_bytes(b"DBTJIT::");
        self.code_buf.emit_bytes(self.backend.name().as_bytes());
        self.code_buf.emit_bytes(b"::");
        self.code_buf.set_executable()?;
        Ok(())
    }
}

fn fatal(rip: u64, msg: &str) -> ! {
    tracing::error!(rip = format_args!("{rip:#x}"), "{msg}");
    std::process::abort();
}

// -- Dispatcher C-ABI entry points -----------------------------------

/// Find-or-compile, called from the dispatcher loop top. Probes the L1
/// through the frame pointer first (the common re-entry case), then
/// falls into the slow path.
pub(crate) extern "C" fn find_or_compile_entry(frame: *mut CpuStateFrame) -> u64 {
    // SAFETY: the dispatcher only runs with a live frame wired to its
    // owning ThreadCore; the thread reference is the single live path
    // to both.
    unsafe {
        let thread = &mut *((*frame).thread as *mut ThreadCore);
        if let Some(reason) = thread.stop_requested {
            thread.frame.stop_reason = reason.encode();
            return thread.runtime.stubs().thread_stop;
        }
        let rip = thread.frame.state.rip;
        let l1 = thread.frame.pointers.l1_base as *const L1Entry;
        let slot = &*l1.add((rip & L1_MASK) as usize);
        if slot.guest == rip {
            return slot.host;
        }
        thread.telemetry.l1_misses += 1;
        thread.lookup_slow(rip)
    }
}

/// Exit linker: resolve the callee of a just-taken direct branch and
/// back-patch the call site's target word.
pub(crate) extern "C" fn exit_linker_entry(frame: *mut CpuStateFrame, record: *mut u64) -> u64 {
    // SAFETY: `record` points at the 16-byte link record the branch
    // was emitted with.
    unsafe {
        let thread = &mut *((*frame).thread as *mut ThreadCore);
        let callee_rip = record.add(1).read();

        if let Some(reason) = thread.stop_requested {
            thread.frame.state.rip = callee_rip;
            thread.frame.stop_reason = reason.encode();
            return thread.runtime.stubs().thread_stop;
        }

        let linker = thread.runtime.stubs().exit_linker;
        let current = record.read();
        if current != linker {
            // Another path already linked this site.
            return current;
        }

        // Mask across the whole resolve-and-patch: both the compile
        // and the registry mutation allocate.
        let _mask = SignalMaskGuard::new();
        let host = match thread.cache.find(callee_rip) {
            Ok(Some(h)) => h,
            _ => {
                thread.telemetry.l1_misses += 1;
                thread.compile_block(callee_rip);
                match thread.cache.find(callee_rip) {
                    Ok(Some(h)) => h,
                    _ => unreachable!("freshly compiled block missing from cache"),
                }
            }
        };

        let wx = thread.runtime.config.wx_exclusive;
        if wx {
            let _ = thread.code_buf.set_writable();
        }
        record.write(host);
        if wx {
            let _ = thread.code_buf.set_executable();
        }
        thread.cache.register_link(
            callee_rip,
            LinkRecord {
                record_addr: record as u64,
                restore: linker,
            },
        );
        thread.telemetry.links_installed += 1;
        host
    }
}

/// Cooperative pause: sync-point reached via the running-mode check.
pub(crate) extern "C" fn pause_entry(frame: *mut CpuStateFrame) {
    // SAFETY: as for find_or_compile_entry.
    unsafe {
        let thread = &mut *((*frame).thread as *mut ThreadCore);
        if let Some(mut hook) = thread.pause_hook.take() {
            hook(&mut thread.frame);
            thread.pause_hook = Some(hook);
        }
        let reason = thread.stop_requested.unwrap_or(StopReason::Paused);
        thread.stop_requested = Some(reason);
        thread.frame.stop_reason = reason.encode();
    }
}

struct ThreadServices(*mut ThreadCore);

impl InterpServices for ThreadServices {
    fn syscall(&mut self, ctx: *mut u8, nr: u64) -> i64 {
        // SAFETY: ctx is the frame of the thread we were built from.
        unsafe {
            let thread = &mut *self.0;
            let frame = &mut *(ctx as *mut CpuStateFrame);
            match thread.syscall.syscall(frame, nr) {
                SyscallOutcome::Ret(v) => v,
                SyscallOutcome::Stop(reason) => {
                    thread.stop_requested = Some(reason);
                    0
                }
            }
        }
    }

    fn cpuid(&mut self, leaf: u32, subleaf: u32) -> (u64, u64) {
        let thread = unsafe { &mut *self.0 };
        let r = thread.cpuid.cpuid(leaf, subleaf);
        (
            r.eax as u64 | ((r.ebx as u64) << 32),
            r.ecx as u64 | ((r.edx as u64) << 32),
        )
    }

    fn xcr(&mut self, index: u32) -> u64 {
        let thread = unsafe { &mut *self.0 };
        thread.cpuid.xcr(index)
    }
}

/// Fragment executer: target of the interpreter trampoline. Decodes
/// the inline serialized IR and interprets it against the frame.
pub(crate) extern "C" fn fragment_executer_entry(frame: *mut CpuStateFrame, data: *const u8) {
    // SAFETY: `data` is the length-prefixed stream the trampoline was
    // emitted with; the frame belongs to the running thread.
    unsafe {
        let thread = (*frame).thread as *mut ThreadCore;
        let block = match dbt_ir::serialize::decode_embedded(data) {
            Ok(b) => b,
            Err(err) => {
                tracing::error!(%err, "corrupt inline IR fragment");
                std::process::abort();
            }
        };
        let mut services = ThreadServices(thread);
        let exit = interp::run(&block, frame as *mut u8, &mut services);
        let thread = &mut *thread;
        match exit {
            InterpExit::Next(rip) | InterpExit::DirectLink(rip) => {
                thread.frame.state.rip = rip;
            }
            InterpExit::Fault { kind, rip } => {
                thread.frame.state.rip = rip;
                thread.frame.fault.active = 1;
                thread.frame.fault.trapno = kind.trapno();
                thread.frame.fault.err_code = 0;
                thread.frame.fault.si_code = 1;
                thread.frame.fault.fault_rip = rip;
                let signo = match kind {
                    FaultKind::IllegalInstruction => libc::SIGILL,
                    FaultKind::Overflow => libc::SIGSEGV,
                    FaultKind::Breakpoint => libc::SIGTRAP,
                };
                thread.stop_requested = Some(StopReason::GuestFault(signo));
            }
        }
    }
}

// -- Service shims (C ABI between emitted code and trait objects) ----

pub(crate) extern "C" fn syscall_shim(
    obj: *mut libc::c_void,
    frame: *mut CpuStateFrame,
    nr: u64,
) -> i64 {
    // SAFETY: obj is the thread's boxed handler, wired in wire_frame.
    unsafe {
        let thread_ptr = (*frame).thread as *mut ThreadCore;
        let handler = &mut *(obj as *mut Box<dyn SyscallHandler>);
        match handler.syscall(&mut *frame, nr) {
            SyscallOutcome::Ret(v) => v,
            SyscallOutcome::Stop(reason) => {
                (*thread_ptr).stop_requested = Some(reason);
                0
            }
        }
    }
}

pub(crate) extern "C" fn cpuid_shim(
    obj: *mut libc::c_void,
    leaf: u32,
    subleaf: u32,
) -> CpuIdResult {
    // SAFETY: obj is the thread's boxed CPUID handler.
    unsafe {
        let handler = &*(obj as *const Box<dyn CpuIdHandler>);
        handler.cpuid(leaf, subleaf)
    }
}

pub(crate) extern "C" fn xcr_shim(obj: *mut libc::c_void, index: u32) -> u64 {
    // SAFETY: obj is the thread's boxed CPUID handler.
    unsafe {
        let handler = &*(obj as *const Box<dyn CpuIdHandler>);
        handler.xcr(index)
    }
}
