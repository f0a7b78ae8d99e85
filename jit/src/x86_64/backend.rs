//! x86-64 backend: op table wiring, JIT↔runtime ABI helpers, and the
//! dispatcher stub set.
//!
//! Register plan: r14 pins the frame, rax/rcx/rdx are backend scratch,
//! everything else is handed to the RA. Emitted code runs with rsp
//! 16-byte aligned at every op boundary so helper calls need no extra
//! adjustment.

use crate::code_buffer::CodeBuffer;
use crate::compiler::{self, BlockCx, CompileRequest, CompiledBlock, DebugData};
use crate::dispatch::{DispatchTable, OpHandler};
use crate::fallback::{fallback_info, FallbackAbi};
use crate::x86_64::emitter::*;
use crate::x86_64::regs::*;
use crate::x86_64::{alu_ops, atomic_ops, branch_ops, memory_ops, vector_ops};
use crate::{
    CompileError, CpuBackend, DispatcherEntryPoints, DispatcherStubs, FrameOffsets,
};
use dbt_ir::node::IrNode;
use dbt_ir::ra::RegClass;
use dbt_ir::{CondCode, IrBlock, NodeId, Opcode};

pub struct X86_64Backend {
    table: DispatchTable<Self>,
}

impl Default for X86_64Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl X86_64Backend {
    pub fn new() -> Self {
        let mut table = DispatchTable::new(Self::op_unhandled as OpHandler<Self>);
        alu_ops::register(&mut table);
        memory_ops::register(&mut table);
        atomic_ops::register(&mut table);
        vector_ops::register(&mut table);
        branch_ops::register(&mut table);
        Self { table }
    }

    /// Fallback shim: spill every RA register, marshal per the helper's
    /// ABI tag, call through the frame table, restore, repack.
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
        let slot = cx.config.offsets.fallback_table as i32 + 8 * info.index as i32;

        push_regs(cx.buf);
        match info.abi {
            FallbackAbi::VoidU16 => {
                let src = gpr(cx, node.arg(0));
                movzx16(cx.buf, Reg::Rdi, src);
                call_mem(cx.buf, STATE, slot);
                pop_regs(cx.buf);
            }
            FallbackAbi::F64F64 => {
                let src = fpr(cx, node.arg(0));
                movaps_rr(cx.buf, Xmm(0), src);
                call_mem(cx.buf, STATE, slot);
                pop_regs(cx.buf);
                let dst = fpr(cx, id);
                movaps_rr(cx.buf, dst, Xmm(0));
            }
            FallbackAbi::F64F64F64 => {
                let a = fpr(cx, node.arg(0));
                let b = fpr(cx, node.arg(1));
                movaps_rr(cx.buf, Xmm(1), b);
                movaps_rr(cx.buf, Xmm(0), a);
                call_mem(cx.buf, STATE, slot);
                pop_regs(cx.buf);
                let dst = fpr(cx, id);
                movaps_rr(cx.buf, dst, Xmm(0));
            }
        }
        Ok(())
    }
}

impl compiler::BlockEmitter for X86_64Backend {
    fn handler(&self, op: Opcode) -> OpHandler<Self> {
        self.table.get(op)
    }

    fn emit_block_entry(&mut self, cx: &mut BlockCx<'_>) {
        // Publish the block's code header so the signal adapter can
        // find the RIP map from a fault inside this block.
        let site = lea_rip(cx.buf, TMP1);
        patch_rel32(cx.buf, site, cx.block_begin);
        st(
            cx.buf,
            8,
            TMP1,
            STATE,
            cx.config.offsets.inline_block_header as i32,
        );
    }

    fn emit_pause_check(&mut self, cx: &mut BlockCx<'_>) {
        mov_ri(cx.buf, TMP1, cx.config.running_mode_addr);
        ld(cx.buf, 4, TMP1, TMP1, 0);
        test_rr(cx.buf, false, TMP1, TMP1);
        let run = jcc_rel32(cx.buf, Cc::E);
        // Synchronize RIP, then divert to the pause handler.
        mov_ri(cx.buf, TMP1, cx.block.entry_rip);
        st(cx.buf, 8, TMP1, STATE, cx.config.offsets.rip as i32);
        jmp_mem(cx.buf, STATE, cx.config.offsets.thread_pause as i32);
        let target = cx.buf.offset();
        patch_rel32(cx.buf, run, target);
    }

    fn emit_spill_reserve(&mut self, cx: &mut BlockCx<'_>) {
        arith_ri(cx.buf, Alu::Sub, true, Reg::Rsp, cx.spill_bytes as i32);
    }

    fn emit_region_jump(&mut self, cx: &mut BlockCx<'_>, region: u32) {
        let site = jmp_rel32(cx.buf);
        if let Some(target) = cx.branch_target(region, site, compiler::FixupKind::Rel32) {
            patch_rel32(cx.buf, site, target);
        }
    }

    fn flush_code(&mut self, _buf: &CodeBuffer, _begin: usize, _len: usize) {
        // x86 keeps instruction fetch coherent with stores.
    }
}

impl CpuBackend for X86_64Backend {
    fn name(&self) -> &'static str {
        "x86_64"
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
        mov_rr(buf, true, Reg::Rdi, STATE);
        let data_site = lea_rip(buf, Reg::Rsi);
        call_mem(buf, STATE, offs.fragment_executer as i32);
        jmp_mem(buf, STATE, offs.loop_top as i32);
        buf.align(8);
        let data_off = buf.offset();
        patch_rel32(buf, data_site, data_off);
        buf.emit_bytes(&data);
        Ok(CompiledBlock {
            begin,
            entry: begin,
            size: buf.offset() - begin,
            generation: buf.generation(),
        })
    }
}

// -- Register access -------------------------------------------------

pub(crate) fn gpr(cx: &BlockCx<'_>, id: NodeId) -> Reg {
    let p = cx.ra.get(id);
    assert!(
        p.class == RegClass::Gpr,
        "node %{} not allocated to a GPR ({:?})",
        id.0,
        p.class
    );
    RA_GPR[p.index as usize]
}

pub(crate) fn fpr(cx: &BlockCx<'_>, id: NodeId) -> Xmm {
    let p = cx.ra.get(id);
    assert!(
        p.class == RegClass::Fpr,
        "node %{} not allocated to an FPR ({:?})",
        id.0,
        p.class
    );
    RA_XMM[p.index as usize]
}

pub(crate) fn pair(cx: &BlockCx<'_>, id: NodeId) -> (Reg, Reg) {
    let p = cx.ra.get(id);
    assert!(
        p.class == RegClass::GprPair,
        "node %{} not allocated to a GPR pair ({:?})",
        id.0,
        p.class
    );
    RA_PAIR[p.index as usize]
}

/// GPR source that may fold an inline constant.
pub(crate) enum SrcOp {
    R(Reg),
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

/// Materialize an operand into `tmp` when it is a constant.
pub(crate) fn operand_reg(cx: &mut BlockCx<'_>, id: NodeId, tmp: Reg) -> Reg {
    match operand(cx, id) {
        SrcOp::R(r) => r,
        SrcOp::Imm(v) => {
            mov_ri(cx.buf, tmp, v);
            tmp
        }
    }
}

// -- Caller-save spill around helper calls ---------------------------

const XMM_SAVE_BYTES: i32 = (RA_XMM.len() * 16) as i32;

/// Save every RA register around a C call. Keeps rsp 16-byte aligned:
/// 160 bytes of vector saves plus ten pushes.
pub(crate) fn push_regs(buf: &mut CodeBuffer) {
    arith_ri(buf, Alu::Sub, true, Reg::Rsp, XMM_SAVE_BYTES);
    for (i, &x) in RA_XMM.iter().enumerate() {
        movdqu_store(buf, x, Reg::Rsp, (i * 16) as i32);
    }
    for &r in RA_GPR.iter() {
        push(buf, r);
    }
}

pub(crate) fn pop_regs(buf: &mut CodeBuffer) {
    for &r in RA_GPR.iter().rev() {
        pop(buf, r);
    }
    for (i, &x) in RA_XMM.iter().enumerate() {
        movdqu_load(buf, x, Reg::Rsp, (i * 16) as i32);
    }
    arith_ri(buf, Alu::Add, true, Reg::Rsp, XMM_SAVE_BYTES);
}

// -- Comparison helper -----------------------------------------------

/// Emit the flags-setting compare for `cond` at `size`, honoring the
/// canonical zero-extension invariant: sub-32-bit signed compares
/// sign-extend both operands into scratch first.
pub(crate) fn emit_cmp(
    cx: &mut BlockCx<'_>,
    size: u8,
    cond: CondCode,
    a: NodeId,
    b: NodeId,
) -> Cc {
    let signed = matches!(
        cond,
        CondCode::Slt | CondCode::Sge | CondCode::Sgt | CondCode::Sle
    );
    let ra = operand_reg(cx, a, TMP1);
    if size < 4 && signed {
        let sx = |buf: &mut CodeBuffer, dst: Reg, src: Reg| {
            if size == 1 {
                movsx8(buf, false, dst, src);
            } else {
                movsx16(buf, false, dst, src);
            }
        };
        sx(cx.buf, TMP1, ra);
        match operand(cx, b) {
            SrcOp::R(rb) => {
                sx(cx.buf, TMP2, rb);
                arith_rr(cx.buf, Alu::Cmp, false, TMP1, TMP2);
            }
            SrcOp::Imm(v) => {
                let v = match size {
                    1 => v as u8 as i8 as i32,
                    _ => v as u16 as i16 as i32,
                };
                arith_ri(cx.buf, Alu::Cmp, false, TMP1, v);
            }
        }
    } else {
        let w = size == 8;
        match operand(cx, b) {
            SrcOp::R(rb) => arith_rr(cx.buf, Alu::Cmp, w, ra, rb),
            SrcOp::Imm(v) => {
                if v as i64 >= i32::MIN as i64 && v as i64 <= i32::MAX as i64 {
                    arith_ri(cx.buf, Alu::Cmp, w, ra, v as i32);
                } else {
                    mov_ri(cx.buf, TMP2, v);
                    arith_rr(cx.buf, Alu::Cmp, w, ra, TMP2);
                }
            }
        }
    }
    Cc::from_cond(cond)
}

/// Truncate `reg` in place to the canonical zero-extended form for
/// `size`.
pub(crate) fn canonicalize(buf: &mut CodeBuffer, size: u8, reg: Reg) {
    match size {
        1 => movzx8(buf, reg, reg),
        2 => movzx16(buf, reg, reg),
        4 => mov_rr(buf, false, reg, reg),
        _ => {}
    }
}

/// Release the spill area before leaving the block.
pub(crate) fn release_spill(cx: &mut BlockCx<'_>) {
    if cx.spill_bytes != 0 {
        arith_ri(cx.buf, Alu::Add, true, Reg::Rsp, cx.spill_bytes as i32);
    }
}

// -- Dispatcher stubs ------------------------------------------------

/// Anchor layout inside the frame: `[0] = rsp`, `[1] = resume pc`.
const ANCHOR_SP: i32 = 0;
const ANCHOR_PC: i32 = 8;

fn emit_dispatcher_stubs(
    buf: &mut CodeBuffer,
    offs: &FrameOffsets,
    entries: &DispatcherEntryPoints,
) -> DispatcherStubs {
    let mut stubs = DispatcherStubs::default();
    let stop_anchor = offs.stop_anchor as i32;

    // ENTER: extern "C" fn(*mut CpuStateFrame) -> u64.
    // Saves the callee-saved set, pins the frame register, records the
    // unwind anchor, then falls into the loop.
    let enter = buf.offset();
    for &r in CALLEE_SAVED.iter() {
        push(buf, r);
    }
    mov_rr(buf, true, STATE, Reg::Rdi);
    // Ret addr + 6 pushes leaves rsp 8 mod 16; drop 8 more so the
    // loop-top call site sits at 0 mod 16.
    arith_ri(buf, Alu::Sub, true, Reg::Rsp, 8);
    let stopped_site = lea_rip(buf, TMP1);
    st(buf, 8, TMP1, STATE, stop_anchor + ANCHOR_PC);
    st(buf, 8, Reg::Rsp, STATE, stop_anchor + ANCHOR_SP);

    // LOOP: resolve the current RIP and jump into emitted code.
    let loop_top = buf.offset();
    mov_rr(buf, true, Reg::Rdi, STATE);
    mov_ri(buf, TMP1, entries.find_or_compile);
    call_reg(buf, TMP1);
    jmp_reg(buf, TMP1);

    // STOPPED: unwound here by the thread-stop stub.
    let stopped = buf.offset();
    patch_rel32(buf, stopped_site, stopped);
    ld(buf, 8, TMP1, STATE, offs.stop_reason as i32);
    arith_ri(buf, Alu::Add, true, Reg::Rsp, 8);
    for &r in CALLEE_SAVED.iter().rev() {
        pop(buf, r);
    }
    ret(buf);

    // THREAD_STOP: restore the anchor registers and resume at STOPPED.
    let thread_stop = buf.offset();
    ld(buf, 8, Reg::Rsp, STATE, stop_anchor + ANCHOR_SP);
    jmp_mem(buf, STATE, stop_anchor + ANCHOR_PC);

    // THREAD_PAUSE: entered from the pause check in emitted code.
    let thread_pause = buf.offset();
    mov_rr(buf, true, Reg::Rdi, STATE);
    mov_ri(buf, TMP1, entries.pause);
    call_reg(buf, TMP1);
    jmp_to(buf, thread_stop);

    // EXIT_LINKER: emitted code arrives with the link record address
    // already in rsi.
    let exit_linker = buf.offset();
    mov_rr(buf, true, Reg::Rdi, STATE);
    mov_ri(buf, TMP1, entries.exit_linker);
    call_reg(buf, TMP1);
    jmp_reg(buf, TMP1);

    // CALLBACK_RETURN: unwind through the callback anchor.
    let callback_return = buf.offset();
    let cb_anchor = offs.callback_anchor as i32;
    ld(buf, 8, Reg::Rsp, STATE, cb_anchor + ANCHOR_SP);
    jmp_mem(buf, STATE, cb_anchor + ANCHOR_PC);

    // Distinctive fault sites, one address each so the signal adapter
    // can classify by PC.
    let signal_return = buf.offset();
    ud2(buf);
    let pause_return = buf.offset();
    ud2(buf);
    let unimplemented = buf.offset();
    ud2(buf);
    let overflow = buf.offset();
    ud2(buf);

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
