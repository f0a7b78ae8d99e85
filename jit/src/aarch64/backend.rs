//! AArch64 backend.
//!
//! Register plan: x28 pins the frame, x15-x17 are backend scratch,
//! x0-x3 stay free for C-call marshaling, x4-x13 and v4-v13 belong to
//! the RA. Vector state uses Advanced SIMD for 16-byte ops and SVE for
//! the 32-byte paths when the host advertises a 256-bit vector length.

use crate::aarch64::emitter::*;
use crate::aarch64::regs::*;
use crate::aarch64::{alu_ops, atomic_ops, branch_ops, memory_ops, vector_ops};
use crate::code_buffer::CodeBuffer;
use crate::compiler::{self, BlockCx, CompileRequest, CompiledBlock, DebugData};
use crate::dispatch::{DispatchTable, OpHandler};
use crate::fallback::{fallback_info, FallbackAbi};
use crate::{
    CompileError, CpuBackend, DispatcherEntryPoints, DispatcherStubs, FrameOffsets,
};
use dbt_ir::node::IrNode;
use dbt_ir::ra::RegClass;
use dbt_ir::{CondCode, IrBlock, NodeId, Opcode};

pub struct Aarch64Backend {
    table: DispatchTable<Self>,
    /// Set once the current block has emitted PTRUE into p0.
    pub(crate) ptrue_ready: bool,
}

impl Default for Aarch64Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Aarch64Backend {
    pub fn new() -> Self {
        let mut table = DispatchTable::new(Self::op_unhandled as OpHandler<Self>);
        alu_ops::register(&mut table);
        memory_ops::register(&mut table);
        atomic_ops::register(&mut table);
        vector_ops::register(&mut table);
        branch_ops::register(&mut table);
        Self {
            table,
            ptrue_ready: false,
        }
    }

    /// Lazily establish the all-true governing predicate the SVE
    /// paths use.
    pub(crate) fn ensure_ptrue(&mut self, cx: &mut BlockCx<'_>) {
        if !self.ptrue_ready {
            sve_ptrue_all(cx.buf, 0);
            self.ptrue_ready = true;
        }
    }

    fn op_unhandled(
        &mut self,
        cx: &mut BlockCx<'_>,
        id: NodeId,
        node: &IrNode,
    ) -> Result<(), CompileError> {
        let Some(info) = fallback_info(node.op) else {
            return Err(CompileError::UnsupportedOp {
                op: node.op.name(),
                size: node.size,
            });
        };
        let slot = cx.config.offsets.fallback_table + 8 * info.index as u32;

        push_regs(cx.buf);
        match info.abi {
            FallbackAbi::VoidU16 => {
                let src = gpr(cx, node.arg(0));
                uxth(cx.buf, XReg(0), src);
                ldr_imm(cx.buf, 8, TMP1, STATE, slot);
                blr(cx.buf, TMP1);
                pop_regs(cx.buf);
            }
            FallbackAbi::F64F64 => {
                let src = fpr(cx, node.arg(0));
                v_mov(cx.buf, VReg(0), src);
                ldr_imm(cx.buf, 8, TMP1, STATE, slot);
                blr(cx.buf, TMP1);
                pop_regs(cx.buf);
                let dst = fpr(cx, id);
                v_mov(cx.buf, dst, VReg(0));
            }
            FallbackAbi::F64F64F64 => {
                let a = fpr(cx, node.arg(0));
                let b = fpr(cx, node.arg(1));
                v_mov(cx.buf, VReg(1), b);
                v_mov(cx.buf, VReg(0), a);
                ldr_imm(cx.buf, 8, TMP1, STATE, slot);
                blr(cx.buf, TMP1);
                pop_regs(cx.buf);
                let dst = fpr(cx, id);
                v_mov(cx.buf, dst, VReg(0));
            }
        }
        Ok(())
    }
}

impl compiler::BlockEmitter for Aarch64Backend {
    fn handler(&self, op: Opcode) -> OpHandler<Self> {
        self.table.get(op)
    }

    fn emit_block_entry(&mut self, cx: &mut BlockCx<'_>) {
        self.ptrue_ready = false;
        let site = adr_placeholder(cx.buf, TMP1);
        patch_adr(cx.buf, site, cx.block_begin);
        str_imm(
            cx.buf,
            8,
            TMP1,
            STATE,
            cx.config.offsets.inline_block_header,
        );
    }

    fn emit_pause_check(&mut self, cx: &mut BlockCx<'_>) {
        mov_imm64(cx.buf, TMP1, cx.config.running_mode_addr);
        ldr_imm(cx.buf, 4, TMP1, TMP1, 0);
        let run = cbz_placeholder(cx.buf, false, TMP1);
        mov_imm64(cx.buf, TMP1, cx.block.entry_rip);
        str_imm(cx.buf, 8, TMP1, STATE, cx.config.offsets.rip);
        ldr_imm(cx.buf, 8, TMP2, STATE, cx.config.offsets.thread_pause);
        br(cx.buf, TMP2);
        let target = cx.buf.offset();
        patch_cond19(cx.buf, run, target);
    }

    fn emit_spill_reserve(&mut self, cx: &mut BlockCx<'_>) {
        sub_imm(cx.buf, true, XReg(31), XReg(31), cx.spill_bytes);
    }

    fn emit_region_jump(&mut self, cx: &mut BlockCx<'_>, region: u32) {
        let site = b_placeholder(cx.buf);
        if let Some(target) = cx.branch_target(region, site, compiler::FixupKind::A64Branch26) {
            patch_branch26(cx.buf, site, target);
        }
    }

    fn flush_code(&mut self, buf: &CodeBuffer, begin: usize, len: usize) {
        flush_icache(buf.ptr_at(begin), len);
    }
}

impl CpuBackend for Aarch64Backend {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn compile(
        &mut self,
        buf: &mut CodeBuffer,
        req: &CompileRequest<'_>,
        debug: Option<&mut DebugData>,
    ) -> Result<CompiledBlock, CompileError> {
        compiler::compile_block(self, buf, req, debug)
    }

    fn emit_dispatcher(
        &mut self,
        buf: &mut CodeBuffer,
        offs: &FrameOffsets,
        entries: &DispatcherEntryPoints,
    ) -> DispatcherStubs {
        emit_dispatcher_stubs(buf, offs, entries)
    }

    fn emit_interpreter_trampoline(
        &mut self,
        buf: &mut CodeBuffer,
        block: &IrBlock,
        offs: &FrameOffsets,
    ) -> Result<CompiledBlock, CompileError> {
        let data = dbt_ir::serialize::encode_embedded(block);
        if buf.remaining() < data.len() + 64 {
            return Err(CompileError::OutOfCodeSpace);
        }
        buf.align(16);
        let begin = buf.offset();
        mov_rr(buf, true, XReg(0), STATE);
        let data_site = adr_placeholder(buf, XReg(1));
        ldr_imm(buf, 8, TMP1, STATE, offs.fragment_executer);
        blr(buf, TMP1);
        ldr_imm(buf, 8, TMP1, STATE, offs.loop_top);
        br(buf, TMP1);
        buf.align(8);
        let data_off = buf.offset();
        patch_adr(buf, data_site, data_off);
        buf.emit_bytes(&data);
        let size = buf.offset() - begin;
        flush_icache(buf.ptr_at(begin), size);
        Ok(CompiledBlock {
            begin,
            entry: begin,
            size,
            generation: buf.generation(),
        })
    }
}

// -- Register access -------------------------------------------------

pub(crate) fn gpr(cx: &BlockCx<'_>, id: NodeId) -> XReg {
    let p = cx.ra.get(id);
    assert!(
        p.class == RegClass::Gpr,
        "node %{} not allocated to a GPR ({:?})",
        id.0,
        p.class
    );
    RA_GPR[p.index as usize]
}

pub(crate) fn fpr(cx: &BlockCx<'_>, id: NodeId) -> VReg {
    let p = cx.ra.get(id);
    assert!(
        p.class == RegClass::Fpr,
        "node %{} not allocated to an FPR ({:?})",
        id.0,
        p.class
    );
    RA_VEC[p.index as usize]
}

pub(crate) fn pair(cx: &BlockCx<'_>, id: NodeId) -> (XReg, XReg) {
    let p = cx.ra.get(id);
    assert!(
        p.class == RegClass::GprPair,
        "node %{} not allocated to a GPR pair ({:?})",
        id.0,
        p.class
    );
    RA_PAIR[p.index as usize]
}

pub(crate) enum SrcOp {
    R(XReg),
    Imm(u64),
}

pub(crate) fn operand(cx: &BlockCx<'_>, id: NodeId) -> SrcOp {
    let node = cx.block.node(id);
    if node.op == Opcode::InlineConstant {
        SrcOp::Imm(node.imm)
    } else {
        SrcOp::R(gpr(cx, id))
    }
}

pub(crate) fn operand_reg(cx: &mut BlockCx<'_>, id: NodeId, tmp: XReg) -> XReg {
    match operand(cx, id) {
        SrcOp::R(r) => r,
        SrcOp::Imm(v) => {
            mov_imm64(cx.buf, tmp, v);
            tmp
        }
    }
}

// -- Caller-save spill around helper calls ---------------------------

const SAVE_BYTES: u32 = 80 + 160; // x4-x13 + q4-q13

pub(crate) fn push_regs(buf: &mut CodeBuffer) {
    sub_imm(buf, true, XReg(31), XReg(31), SAVE_BYTES);
    for (i, &r) in RA_GPR.iter().enumerate() {
        str_imm(buf, 8, r, XReg(31), (i * 8) as u32);
    }
    for (i, &v) in RA_VEC.iter().enumerate() {
        str_q_imm(buf, v, XReg(31), 80 + (i * 16) as u32);
    }
}

pub(crate) fn pop_regs(buf: &mut CodeBuffer) {
    for (i, &r) in RA_GPR.iter().enumerate() {
        ldr_imm(buf, 8, r, XReg(31), (i * 8) as u32);
    }
    for (i, &v) in RA_VEC.iter().enumerate() {
        ldr_q_imm(buf, v, XReg(31), 80 + (i * 16) as u32);
    }
    add_imm(buf, true, XReg(31), XReg(31), SAVE_BYTES);
}

// -- Comparison helper -----------------------------------------------

pub(crate) fn emit_cmp(
    cx: &mut BlockCx<'_>,
    size: u8,
    cond: CondCode,
    a: NodeId,
    b: NodeId,
) -> A64Cond {
    let signed = matches!(
        cond,
        CondCode::Slt | CondCode::Sge | CondCode::Sgt | CondCode::Sle
    );
    let ra = operand_reg(cx, a, TMP1);
    let rb = operand_reg(cx, b, TMP2);
    if size < 4 && signed {
        if size == 1 {
            sxtb(cx.buf, false, TMP1, ra);
            sxtb(cx.buf, false, TMP2, rb);
        } else {
            sxth(cx.buf, false, TMP1, ra);
            sxth(cx.buf, false, TMP2, rb);
        }
        cmp_rr(cx.buf, false, TMP1, TMP2);
    } else {
        cmp_rr(cx.buf, size == 8, ra, rb);
    }
    A64Cond::from_cond(cond)
}

/// Re-establish the canonical zero-extended form.
pub(crate) fn canonicalize(buf: &mut CodeBuffer, size: u8, reg: XReg) {
    match size {
        1 => uxtb(buf, reg, reg),
        2 => uxth(buf, reg, reg),
        4 => mov_rr(buf, false, reg, reg),
        _ => {}
    }
}

pub(crate) fn release_spill(cx: &mut BlockCx<'_>) {
    if cx.spill_bytes != 0 {
        add_imm(cx.buf, true, XReg(31), XReg(31), cx.spill_bytes);
    }
}

// -- Instruction cache maintenance -----------------------------------

#[cfg(target_arch = "aarch64")]
pub(crate) fn flush_icache(start: *const u8, len: usize) {
    // Clean the data cache to the point of unification, then
    // invalidate the instruction cache over the same range.
    unsafe {
        let line = 64usize;
        let mut p = (start as usize) & !(line - 1);
        let end = start as usize + len;
        while p < end {
            core::arch::asm!("dc cvau, {0}", in(reg) p);
            p += line;
        }
        core::arch::asm!("dsb ish");
        let mut p = (start as usize) & !(line - 1);
        while p < end {
            core::arch::asm!("ic ivau, {0}", in(reg) p);
            p += line;
        }
        core::arch::asm!("dsb ish");
        core::arch::asm!("isb");
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub(crate) fn flush_icache(_start: *const u8, _len: usize) {
    // Cross-emission only; nothing executes this code here.
}

// -- Dispatcher stubs ------------------------------------------------

const ANCHOR_SP: u32 = 0;
const ANCHOR_PC: u32 = 8;

fn emit_dispatcher_stubs(
    buf: &mut CodeBuffer,
    offs: &FrameOffsets,
    entries: &DispatcherEntryPoints,
) -> DispatcherStubs {
    let mut stubs = DispatcherStubs::default();
    let sp = XReg(31);

    // ENTER: extern "C" fn(*mut CpuStateFrame) -> u64.
    let enter = buf.offset();
    stp_pre(buf, XReg(29), XReg(30), sp, -16);
    stp_pre(buf, XReg(27), XReg(28), sp, -16);
    stp_pre(buf, XReg(25), XReg(26), sp, -16);
    stp_pre(buf, XReg(23), XReg(24), sp, -16);
    stp_pre(buf, XReg(21), XReg(22), sp, -16);
    stp_pre(buf, XReg(19), XReg(20), sp, -16);
    mov_rr(buf, true, STATE, XReg(0));
    let stopped_site = adr_placeholder(buf, TMP1);
    str_imm(buf, 8, TMP1, STATE, offs.stop_anchor + ANCHOR_PC);
    mov_sp(buf, TMP1, sp);
    str_imm(buf, 8, TMP1, STATE, offs.stop_anchor + ANCHOR_SP);

    let loop_top = buf.offset();
    mov_rr(buf, true, XReg(0), STATE);
    mov_imm64(buf, TMP1, entries.find_or_compile);
    blr(buf, TMP1);
    br(buf, XReg(0));

    let stopped = buf.offset();
    patch_adr(buf, stopped_site, stopped);
    ldr_imm(buf, 8, XReg(0), STATE, offs.stop_reason);
    ldp_post(buf, XReg(19), XReg(20), sp, 16);
    ldp_post(buf, XReg(21), XReg(22), sp, 16);
    ldp_post(buf, XReg(23), XReg(24), sp, 16);
    ldp_post(buf, XReg(25), XReg(26), sp, 16);
    ldp_post(buf, XReg(27), XReg(28), sp, 16);
    ldp_post(buf, XReg(29), XReg(30), sp, 16);
    ret(buf);

    let thread_stop = buf.offset();
    ldr_imm(buf, 8, TMP1, STATE, offs.stop_anchor + ANCHOR_SP);
    mov_sp(buf, sp, TMP1);
    ldr_imm(buf, 8, TMP1, STATE, offs.stop_anchor + ANCHOR_PC);
    br(buf, TMP1);

    let thread_pause = buf.offset();
    mov_rr(buf, true, XReg(0), STATE);
    mov_imm64(buf, TMP1, entries.pause);
    blr(buf, TMP1);
    b_to(buf, thread_stop);

    // Emitted code arrives with the link record address in x1.
    let exit_linker = buf.offset();
    mov_rr(buf, true, XReg(0), STATE);
    mov_imm64(buf, TMP1, entries.exit_linker);
    blr(buf, TMP1);
    br(buf, XReg(0));

    let callback_return = buf.offset();
    ldr_imm(buf, 8, TMP1, STATE, offs.callback_anchor + ANCHOR_SP);
    mov_sp(buf, sp, TMP1);
    ldr_imm(buf, 8, TMP1, STATE, offs.callback_anchor + ANCHOR_PC);
    br(buf, TMP1);

    let signal_return = buf.offset();
    udf(buf);
    let pause_return = buf.offset();
    udf(buf);
    let unimplemented = buf.offset();
    udf(buf);
    let overflow = buf.offset();
    udf(buf);

    let total = buf.offset();
    flush_icache(buf.ptr_at(enter), total - enter);

    stubs.enter = buf.addr_at(enter);
    stubs.loop_top = buf.addr_at(loop_top);
    stubs.thread_stop = buf.addr_at(thread_stop);
    stubs.thread_pause = buf.addr_at(thread_pause);
    stubs.exit_linker = buf.addr_at(exit_linker);
    stubs.callback_return = buf.addr_at(callback_return);
    stubs.signal_return = buf.addr_at(signal_return);
    stubs.pause_return = buf.addr_at(pause_return);
    stubs.unimplemented = buf.addr_at(unimplemented);
    stubs.overflow = buf.addr_at(overflow);
    stubs.region_base = buf.addr_at(0);
    stubs.region_size = buf.offset();
    stubs
}
