//! Control flow, block exits, and runtime service calls.
//!
//! Inter-block direct branches emit a 16-byte link record inline:
//! `[target_word, callee_rip]`. The target word starts at the
//! exit-linker trampoline; the linker back-patches it with the callee's
//! host entry. Everything else leaves through the dispatcher loop.

use crate::compiler::{BlockCx, FixupKind};
use crate::dispatch::DispatchTable;
use crate::x86_64::backend::{
    emit_cmp, gpr, operand, pair, pop_regs, push_regs, release_spill, SrcOp, X86_64Backend,
};
use crate::x86_64::emitter::*;
use crate::x86_64::regs::*;
use crate::CompileError;
use dbt_ir::node::IrNode;
use dbt_ir::types::FaultKind;
use dbt_ir::{CondCode, NodeId, Opcode};

type B = X86_64Backend;
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

    let site = jcc_rel32(cx.buf, cc);
    if let Some(target) = cx.branch_target(true_region, site, FixupKind::Rel32) {
        patch_rel32(cx.buf, site, target);
    }
    cx.set_pending_target(false_region);
    Ok(())
}

/// Write RIP into the frame and re-enter the dispatcher loop.
fn op_exit(_b: &mut B, cx: &mut BlockCx<'_>, _id: NodeId, node: &IrNode) -> R {
    let rip_off = cx.config.offsets.rip as i32;
    match operand(cx, node.arg(0)) {
        SrcOp::R(r) => st(cx.buf, 8, r, STATE, rip_off),
        SrcOp::Imm(v) => {
            mov_ri(cx.buf, TMP1, v);
            st(cx.buf, 8, TMP1, STATE, rip_off);
        }
    }
    release_spill(cx);
    jmp_mem(cx.buf, STATE, cx.config.offsets.loop_top as i32);
    Ok(())
}

fn op_goto_block(_b: &mut B, cx: &mut BlockCx<'_>, _id: NodeId, node: &IrNode) -> R {
    release_spill(cx);
    // lea rsi, [rip + record]; jmp [rip + record]. The record doubles
    // as the branch target slot and the linker's argument.
    let lea_site = lea_rip(cx.buf, Reg::Rsi);
    let jmp_site = jmp_rip_mem(cx.buf);
    cx.buf.align(8);
    let record = cx.buf.offset();
    cx.buf.emit_u64(cx.config.exit_linker_stub);
    cx.buf.emit_u64(node.imm);
    patch_rel32(cx.buf, lea_site, record);
    patch_rel32(cx.buf, jmp_site, record);
    Ok(())
}

fn op_break(_b: &mut B, cx: &mut BlockCx<'_>, _id: NodeId, node: &IrNode) -> R {
    let offs = cx.config.offsets;
    let kind = FaultKind::from_u32(node.misc);
    let si_code: u32 = match kind {
        FaultKind::IllegalInstruction => 1, // ILL_ILLOPC
        FaultKind::Overflow => 0x80,        // SI_KERNEL
        FaultKind::Breakpoint => 1,         // TRAP_BRKPT
    };

    st_imm32(cx.buf, STATE, offs.fault_active as i32, 1);
    st_imm32(cx.buf, STATE, offs.fault_trapno as i32, kind.trapno());
    st_imm32(cx.buf, STATE, offs.fault_err_code as i32, 0);
    st_imm32(cx.buf, STATE, offs.fault_si_code as i32, si_code);

    let rip = cx.block.entry_rip.wrapping_add(node.imm);
    mov_ri(cx.buf, TMP1, rip);
    st(cx.buf, 8, TMP1, STATE, offs.fault_rip as i32);
    st(cx.buf, 8, TMP1, STATE, offs.rip as i32);

    release_spill(cx);
    let stub = match kind {
        FaultKind::Overflow => offs.overflow,
        _ => offs.unimplemented,
    };
    jmp_mem(cx.buf, STATE, stub as i32);
    Ok(())
}

fn op_syscall(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let offs = cx.config.offsets;
    let dst = gpr(cx, id);
    let nr = gpr(cx, node.arg(0));

    push_regs(cx.buf);
    mov_rr(cx.buf, true, Reg::Rdx, nr);
    ld(cx.buf, 8, Reg::Rdi, STATE, offs.syscall_obj as i32);
    mov_rr(cx.buf, true, Reg::Rsi, STATE);
    call_mem(cx.buf, STATE, offs.syscall_fn as i32);
    pop_regs(cx.buf);
    mov_rr(cx.buf, true, dst, TMP1);
    Ok(())
}

fn op_cpuid(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let offs = cx.config.offsets;
    let (d_lo, d_hi) = pair(cx, id);
    let leaf = gpr(cx, node.arg(0));
    let subleaf = gpr(cx, node.arg(1));

    push_regs(cx.buf);
    // Stage into scratch first: rdi/rsi may themselves be RA
    // registers.
    mov_rr(cx.buf, false, TMP2, leaf);
    mov_rr(cx.buf, false, TMP3, subleaf);
    ld(cx.buf, 8, Reg::Rdi, STATE, offs.cpuid_obj as i32);
    mov_rr(cx.buf, false, Reg::Rsi, TMP2);
    mov_rr(cx.buf, false, Reg::Rdx, TMP3);
    call_mem(cx.buf, STATE, offs.cpuid_fn as i32);
    pop_regs(cx.buf);
    // 16-byte POD return: rax = eax|ebx<<32, rdx = ecx|edx<<32.
    mov_rr(cx.buf, true, d_lo, TMP1);
    mov_rr(cx.buf, true, d_hi, TMP3);
    Ok(())
}

fn op_xcr(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let offs = cx.config.offsets;
    let dst = gpr(cx, id);
    let index = gpr(cx, node.arg(0));

    push_regs(cx.buf);
    mov_rr(cx.buf, false, TMP2, index);
    ld(cx.buf, 8, Reg::Rdi, STATE, offs.cpuid_obj as i32);
    mov_rr(cx.buf, false, Reg::Rsi, TMP2);
    call_mem(cx.buf, STATE, offs.xcr_fn as i32);
    pop_regs(cx.buf);
    mov_rr(cx.buf, true, dst, TMP1);
    Ok(())
}
