//! Context and guest-memory access lowering.
//!
//! Guest addresses are host addresses (flat user-space mapping), so
//! loads and stores address memory directly. x86's TSO already gives
//! acquire/release semantics, so the ordered forms emit plain moves.

use crate::compiler::BlockCx;
use crate::dispatch::DispatchTable;
use crate::x86_64::backend::{fpr, gpr, operand_reg, X86_64Backend};
use crate::x86_64::emitter::*;
use crate::x86_64::regs::*;
use crate::CompileError;
use dbt_ir::node::IrNode;
use dbt_ir::{NodeId, Opcode};

type B = X86_64Backend;
type R = Result<(), CompileError>;

pub fn register(t: &mut DispatchTable<B>) {
    t.set(Opcode::LoadContext, op_load_context);
    t.set(Opcode::StoreContext, op_store_context);
    t.set(Opcode::LoadMem, op_load_mem);
    t.set(Opcode::StoreMem, op_store_mem);
}

fn op_load_context(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let off = node.imm as i32;
    match node.size {
        1 | 2 | 4 | 8 => {
            let dst = gpr(cx, id);
            ld(cx.buf, node.size, dst, STATE, off);
        }
        16 => {
            let dst = fpr(cx, id);
            movdqu_load(cx.buf, dst, STATE, off);
        }
        _ => {
            return Err(CompileError::UnsupportedOp {
                op: node.op.name(),
                size: node.size,
            })
        }
    }
    Ok(())
}

fn op_store_context(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let _ = id;
    let off = node.imm as i32;
    match node.size {
        1 | 2 | 4 | 8 => {
            let src = operand_reg(cx, node.arg(0), TMP1);
            st(cx.buf, node.size, src, STATE, off);
        }
        16 => {
            let src = fpr(cx, node.arg(0));
            movdqu_store(cx.buf, src, STATE, off);
        }
        _ => {
            return Err(CompileError::UnsupportedOp {
                op: node.op.name(),
                size: node.size,
            })
        }
    }
    Ok(())
}

fn op_load_mem(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let addr = gpr(cx, node.arg(0));
    match node.size {
        1 | 2 | 4 | 8 => {
            let dst = gpr(cx, id);
            ld(cx.buf, node.size, dst, addr, 0);
        }
        16 => {
            let dst = fpr(cx, id);
            movdqu_load(cx.buf, dst, addr, 0);
        }
        _ => {
            return Err(CompileError::UnsupportedOp {
                op: node.op.name(),
                size: node.size,
            })
        }
    }
    Ok(())
}

fn op_store_mem(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let _ = id;
    let addr = gpr(cx, node.arg(0));
    match node.size {
        1 | 2 | 4 | 8 => {
            let src = operand_reg(cx, node.arg(1), TMP1);
            st(cx.buf, node.size, src, addr, 0);
        }
        16 => {
            let src = fpr(cx, node.arg(1));
            movdqu_store(cx.buf, src, addr, 0);
        }
        _ => {
            return Err(CompileError::UnsupportedOp {
                op: node.op.name(),
                size: node.size,
            })
        }
    }
    Ok(())
}
