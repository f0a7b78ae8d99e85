//! Control flow, block exits, and runtime service calls (AArch64).

use crate::aarch64::backend::{
    emit_cmp, gpr, operand, pair, pop_regs, push_regs, release_spill, Aarch64Backend, SrcOp,
};
use crate::aarch64::emitter::*;
use crate::aarch64::regs::*;
use crate::compiler::{BlockCx, FixupKind};
use crate::dispatch::DispatchTable;
use crate::CompileError;
use dbt_ir::node::IrNode;
use dbt_ir::types::FaultKind;
use dbt_ir::{CondCode, NodeId, Opcode};

type B = Aarch64Backend;
type R = Result<(), CompileError>;

pub fn register(t: &mut DispatchTable<B>) {
    t.set(Opcode::Jump, op_jump);
    t.set(Opcode::CondJump, op_cond_jump);
    t.set(Opcode::GotoBlock, op_goto_block);
    t.set(Opcode::IndirectBranch, op_exit);
    t.set(Opcode::ExitBlock, op_exit);
    t.set(Opcode::Break, op_break);
    t.set(Opcode::Syscall, op_syscall);
    t.set(Opcode::CpuId, op_cpuid);
    t.set(Opcode::Xcr, op_xcr);
}

fn op_jump(_b: &mut B, cx: &mut BlockCx<'_>, _id: NodeId, node: &IrNode) -> R {
    cx.set_pending_target(node.imm as u32);
    Ok(())
}

fn op_cond_jump(_b: &mut B, cx: &mut BlockCx<'_>, _id: NodeId, node: &IrNode) -> R {
    let cond = CondCode::from_u32(node.misc);
    let cc = emit_cmp(cx, node.size, cond, node.arg(0), node.arg(1));
    let true_region = node.imm as u32;
    let false_region = (node.imm >> 32) as u32;

    let site = b_cond_placeholder(cx.buf, cc);
    if let Some(target) = cx.branch_target(true_region, site, FixupKind::A64Cond19) {
        patch_cond19(cx.buf, site, target);
    }
    cx.set_pending_target(false_region);
    Ok(())
}

fn op_exit(_b: &mut B, cx: &mut BlockCx<'_>, _id: NodeId, node: &IrNode) -> R {
    let rip_off = cx.config.offsets.rip;
    match operand(cx, node.arg(0)) {
        SrcOp::R(r) => str_imm(cx.buf, 8, r, STATE, rip_off),
        SrcOp::Imm(v) => {
            mov_imm64(cx.buf, TMP1, v);
            str_imm(cx.buf, 8, TMP1, STATE, rip_off);
        }
    }
    release_spill(cx);
    ldr_imm(cx.buf, 8, TMP1, STATE, cx.config.offsets.loop_top);
    br(cx.buf, TMP1);
    Ok(())
}

fn op_goto_block(_b: &mut B, cx: &mut BlockCx<'_>, _id: NodeId, node: &IrNode) -> R {
    release_spill(cx);
    // adr x1, record; ldr x17, [x1]; br x17; .quad linker; .quad rip
    let adr_site = adr_placeholder(cx.buf, XReg(1));
    ldr_imm(cx.buf, 8, TMP2, XReg(1), 0);
    br(cx.buf, TMP2);
    cx.buf.align(8);
    let record = cx.buf.offset();
    cx.buf.emit_u64(cx.config.exit_linker_stub);
    cx.buf.emit_u64(node.imm);
    patch_adr(cx.buf, adr_site, record);
    Ok(())
}

fn op_break(_b: &mut B, cx: &mut BlockCx<'_>, _id: NodeId, node: &IrNode) -> R {
    let offs = cx.config.offsets;
    let kind = FaultKind::from_u32(node.misc);
    let si_code: u32 = match kind {
        FaultKind::IllegalInstruction => 1,
        FaultKind::Overflow => 0x80,
        FaultKind::Breakpoint => 1,
    };

    let store32 = |cx: &mut BlockCx<'_>, off: u32, val: u32| {
        mov_imm64(cx.buf, TMP1, val as u64);
        str_imm(cx.buf, 4, TMP1, STATE, off);
    };
    store32(cx, offs.fault_active, 1);
    store32(cx, offs.fault_trapno, kind.trapno());
    store32(cx, offs.fault_err_code, 0);
    store32(cx, offs.fault_si_code, si_code);

    let rip = cx.block.entry_rip.wrapping_add(node.imm);
    mov_imm64(cx.buf, TMP1, rip);
    str_imm(cx.buf, 8, TMP1, STATE, offs.fault_rip);
    str_imm(cx.buf, 8, TMP1, STATE, offs.rip);

    release_spill(cx);
    let stub = match kind {
        FaultKind::Overflow => offs.overflow,
        _ => offs.unimplemented,
    };
    ldr_imm(cx.buf, 8, TMP1, STATE, stub);
    br(cx.buf, TMP1);
    Ok(())
}

fn op_syscall(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let offs = cx.config.offsets;
    let dst = gpr(cx, id);
    let nr = gpr(cx, node.arg(0));

    push_regs(cx.buf);
    mov_rr(cx.buf, true, XReg(2), nr);
    ldr_imm(cx.buf, 8, XReg(0), STATE, offs.syscall_obj);
    mov_rr(cx.buf, true, XReg(1), STATE);
    ldr_imm(cx.buf, 8, TMP1, STATE, offs.syscall_fn);
    blr(cx.buf, TMP1);
    pop_regs(cx.buf);
    mov_rr(cx.buf, true, dst, XReg(0));
    Ok(())
}

fn op_cpuid(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let offs = cx.config.offsets;
    let (d_lo, d_hi) = pair(cx, id);
    let leaf = gpr(cx, node.arg(0));
    let subleaf = gpr(cx, node.arg(1));

    push_regs(cx.buf);
    mov_rr(cx.buf, false, TMP2, leaf);
    mov_rr(cx.buf, false, TMP3, subleaf);
    ldr_imm(cx.buf, 8, XReg(0), STATE, offs.cpuid_obj);
    mov_rr(cx.buf, false, XReg(1), TMP2);
    mov_rr(cx.buf, false, XReg(2), TMP3);
    ldr_imm(cx.buf, 8, TMP1, STATE, offs.cpuid_fn);
    blr(cx.buf, TMP1);
    pop_regs(cx.buf);
    mov_rr(cx.buf, true, d_lo, XReg(0));
    mov_rr(cx.buf, true, d_hi, XReg(1));
    Ok(())
}

fn op_xcr(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let offs = cx.config.offsets;
    let dst = gpr(cx, id);
    let index = gpr(cx, node.arg(0));

    push_regs(cx.buf);
    mov_rr(cx.buf, false, TMP2, index);
    ldr_imm(cx.buf, 8, XReg(0), STATE, offs.cpuid_obj);
    mov_rr(cx.buf, false, XReg(1), TMP2);
    ldr_imm(cx.buf, 8, TMP1, STATE, offs.xcr_fn);
    blr(cx.buf, TMP1);
    pop_regs(cx.buf);
    mov_rr(cx.buf, true, dst, XReg(0));
    Ok(())
}
