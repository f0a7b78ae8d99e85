//! Context and guest-memory access (AArch64).
//!
//! Ordered accesses lower to LDAR/STLR; 32-byte vectors go through the
//! SVE contiguous forms when the host has a 256-bit vector length.

use crate::aarch64::backend::{fpr, gpr, operand_reg, Aarch64Backend};
use crate::aarch64::emitter::*;
use crate::aarch64::regs::*;
use crate::compiler::BlockCx;
use crate::dispatch::DispatchTable;
use crate::{CompileError, HostFeatures};
use dbt_ir::node::IrNode;
use dbt_ir::types::MEMFLAG_ORDERED;
use dbt_ir::{NodeId, Opcode};

type B = Aarch64Backend;
type R = Result<(), CompileError>;

pub fn register(t: &mut DispatchTable<B>) {
    t.set(Opcode::LoadContext, op_load_context);
    t.set(Opcode::StoreContext, op_store_context);
    t.set(Opcode::LoadMem, op_load_mem);
    t.set(Opcode::StoreMem, op_store_mem);
}

fn unsupported(node: &IrNode) -> CompileError {
    CompileError::UnsupportedOp {
        op: node.op.name(),
        size: node.size,
    }
}

fn has_sve(cx: &BlockCx<'_>) -> bool {
    cx.config.features.contains(HostFeatures::SVE256)
}

fn op_load_context(b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let off = node.imm as u32;
    match node.size {
        1 | 2 | 4 | 8 => {
            let dst = gpr(cx, id);
            ldr_imm(cx.buf, node.size, dst, STATE, off);
        }
        16 => {
            let dst = fpr(cx, id);
            ldr_q_imm(cx.buf, dst, STATE, off);
        }
        32 if has_sve(cx) => {
            b.ensure_ptrue(cx);
            let dst = fpr(cx, id);
            add_imm(cx.buf, true, TMP1, STATE, off);
            sve_ld1b(cx.buf, dst, 0, TMP1);
        }
        _ => return Err(unsupported(node)),
    }
    Ok(())
}

fn op_store_context(b: &mut B, cx: &mut BlockCx<'_>, _id: NodeId, node: &IrNode) -> R {
    let off = node.imm as u32;
    match node.size {
        1 | 2 | 4 | 8 => {
            let src = operand_reg(cx, node.arg(0), TMP1);
            str_imm(cx.buf, node.size, src, STATE, off);
        }
        16 => {
            let src = fpr(cx, node.arg(0));
            str_q_imm(cx.buf, src, STATE, off);
        }
        32 if has_sve(cx) => {
            b.ensure_ptrue(cx);
            let src = fpr(cx, node.arg(0));
            add_imm(cx.buf, true, TMP1, STATE, off);
            sve_st1b(cx.buf, src, 0, TMP1);
        }
        _ => return Err(unsupported(node)),
    }
    Ok(())
}

fn op_load_mem(b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let addr = gpr(cx, node.arg(0));
    let ordered = node.misc & MEMFLAG_ORDERED != 0;
    match node.size {
        1 | 2 | 4 | 8 => {
            let dst = gpr(cx, id);
            if ordered {
                ldar(cx.buf, node.size, dst, addr);
            } else {
                ldr_imm(cx.buf, node.size, dst, addr, 0);
            }
        }
        16 => {
            let dst = fpr(cx, id);
            ldr_q_imm(cx.buf, dst, addr, 0);
        }
        32 if has_sve(cx) => {
            b.ensure_ptrue(cx);
            let dst = fpr(cx, id);
            sve_ld1b(cx.buf, dst, 0, addr);
        }
        _ => return Err(unsupported(node)),
    }
    Ok(())
}

fn op_store_mem(b: &mut B, cx: &mut BlockCx<'_>, _id: NodeId, node: &IrNode) -> R {
    let addr = gpr(cx, node.arg(0));
    let ordered = node.misc & MEMFLAG_ORDERED != 0;
    match node.size {
        1 | 2 | 4 | 8 => {
            let src = operand_reg(cx, node.arg(1), TMP1);
            if ordered {
                stlr(cx.buf, node.size, src, addr);
            } else {
                str_imm(cx.buf, node.size, src, addr, 0);
            }
        }
        16 => {
            let src = fpr(cx, node.arg(1));
            str_q_imm(cx.buf, src, addr, 0);
        }
        32 if has_sve(cx) => {
            b.ensure_ptrue(cx);
            let src = fpr(cx, node.arg(1));
            sve_st1b(cx.buf, src, 0, addr);
        }
        _ => return Err(unsupported(node)),
    }
    Ok(())
}
