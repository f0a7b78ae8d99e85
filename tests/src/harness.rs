//! Shared fixtures: a map-backed frontend, service test doubles, and
//! runtime/thread constructors.

use dbt_exec::{
    CpuIdHandler, CpuIdResult, CpuStateFrame, Frontend, Runtime, RuntimeConfig, StopReason,
    SyscallHandler, SyscallOutcome, ThreadCore,
};
use dbt_ir::ra::{allocate, RaData, DEFAULT_REG_FILE};
use dbt_ir::{IrBlock, IrBuilder};
use std::collections::HashMap;
use std::sync::Arc;

/// Guest RIP of the conventional "stop the thread" block.
pub const EXIT_RIP: u64 = 0x5000_0000;
/// Exit code the stop block reports.
pub const EXIT_CODE: i32 = 42;

/// Frontend serving pre-built blocks from a map.
pub struct MapFrontend {
    blocks: HashMap<u64, (IrBlock, RaData)>,
}

impl MapFrontend {
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
        }
    }

    pub fn insert(&mut self, block: IrBlock) {
        let ra = allocate(&block, &DEFAULT_REG_FILE).expect("test block exceeds register file");
        self.blocks.insert(block.entry_rip, (block, ra));
    }

    /// Add the conventional stop block at `EXIT_RIP`.
    pub fn with_exit_block(mut self) -> Self {
        let mut b = IrBuilder::new(EXIT_RIP);
        b.insn_start(0);
        let nr = b.constant(8, EXIT_CODE as u64);
        b.syscall(nr);
        let rip = b.constant(8, EXIT_RIP);
        b.exit_block(rip);
        self.insert(b.finish());
        self
    }
}

impl Default for MapFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl Frontend for MapFrontend {
    fn build_block(&mut self, rip: u64) -> (IrBlock, RaData) {
        let (block, ra) = self
            .blocks
            .get(&rip)
            .unwrap_or_else(|| panic!("no test block at {rip:#x}"));
        (block.clone(), ra.clone())
    }
}

/// Syscall double: nr 1 returns 1234, everything else stops the
/// thread with the syscall number as exit code.
pub struct StopSyscall;

impl SyscallHandler for StopSyscall {
    fn syscall(&mut self, _frame: &mut CpuStateFrame, nr: u64) -> SyscallOutcome {
        if nr == 1 {
            SyscallOutcome::Ret(1234)
        } else {
            SyscallOutcome::Stop(StopReason::Exit(nr as i32))
        }
    }
}

/// Deterministic CPUID double.
pub struct TestCpuId;

impl CpuIdHandler for TestCpuId {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult {
        CpuIdResult {
            eax: leaf ^ 0xA5A5_0000,
            ebx: subleaf.wrapping_add(1),
            ecx: 0x0000_1234,
            edx: 0x0000_5678,
        }
    }

    fn xcr(&self, index: u32) -> u64 {
        0xE000_0000_0000 | index as u64
    }
}

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        // Equal sizes so a clear reuses the mapping in place and
        // recorded link addresses stay readable.
        initial_code_size: 1 << 20,
        max_code_size: 1 << 20,
        ..RuntimeConfig::default()
    }
}

pub fn make_runtime(config: RuntimeConfig) -> Arc<Runtime> {
    Runtime::new(config).expect("runtime init failed")
}

pub fn make_thread(runtime: &Arc<Runtime>, frontend: MapFrontend) -> Box<ThreadCore> {
    ThreadCore::new(
        runtime.clone(),
        Box::new(frontend),
        Box::new(StopSyscall),
        Box::new(TestCpuId),
    )
    .expect("thread init failed")
}

/// Run the thread from `rip` until it stops.
pub fn run_from(thread: &mut ThreadCore, rip: u64) -> StopReason {
    thread.frame.state.rip = rip;
    thread.run()
}
