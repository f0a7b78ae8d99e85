//! Atomic op lowering: LOCK-prefixed RMW forms, with CMPXCHG retry
//! loops for the fetch-logic group the ISA has no single instruction
//! for.

use crate::compiler::BlockCx;
use crate::dispatch::DispatchTable;
use crate::x86_64::backend::{canonicalize, gpr, operand_reg, X86_64Backend};
use crate::x86_64::emitter::*;
use crate::x86_64::regs::*;
use crate::CompileError;
use dbt_ir::node::IrNode;
use dbt_ir::{NodeId, Opcode};

type B = X86_64Backend;
type R = Result<(), CompileError>;

pub fn register(t: &mut DispatchTable<B>) {
    t.set(Opcode::Cas, op_cas);
    t.set(Opcode::AtomicSwap, op_swap);
    t.set(Opcode::AtomicFetchAdd, op_fetch_add);
    t.set(Opcode::AtomicFetchSub, op_fetch_add);
    t.set(Opcode::AtomicFetchAnd, op_fetch_logic);
    t.set(Opcode::AtomicFetchOr, op_fetch_logic);
    t.set(Opcode::AtomicFetchXor, op_fetch_logic);
}

fn op_cas(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let elem = node.elem_size;
    let dst = gpr(cx, id);
    let addr = gpr(cx, node.arg(0));
    let expected = gpr(cx, node.arg(1));
    let desired = gpr(cx, node.arg(2));

    // CMPXCHG compares against rax and leaves the observed value
    // there.
    mov_rr(cx.buf, elem == 8, TMP1, expected);
    lock_cmpxchg(cx.buf, elem, addr, desired);
    mov_rr(cx.buf, elem == 8, dst, TMP1);
    canonicalize(cx.buf, elem, dst);
    Ok(())
}

fn op_swap(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let elem = node.elem_size;
    let dst = gpr(cx, id);
    let addr = gpr(cx, node.arg(0));
    let val = operand_reg(cx, node.arg(1), TMP1);

    mov_rr(cx.buf, elem == 8, TMP1, val);
    xchg_mem(cx.buf, elem, addr, TMP1);
    mov_rr(cx.buf, elem == 8, dst, TMP1);
    canonicalize(cx.buf, elem, dst);
    Ok(())
}

fn op_fetch_add(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let elem = node.elem_size;
    let dst = gpr(cx, id);
    let addr = gpr(cx, node.arg(0));
    let val = operand_reg(cx, node.arg(1), TMP1);

    mov_rr(cx.buf, elem == 8, TMP1, val);
    if node.op == Opcode::AtomicFetchSub {
        grp3(cx.buf, Grp3::Neg, elem == 8, TMP1);
    }
    lock_xadd(cx.buf, elem, addr, TMP1);
    mov_rr(cx.buf, elem == 8, dst, TMP1);
    canonicalize(cx.buf, elem, dst);
    Ok(())
}

/// Fetch-and/or/xor have no direct fetch form; loop on CMPXCHG.
fn op_fetch_logic(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let elem = node.elem_size;
    let alu = match node.op {
        Opcode::AtomicFetchAnd => Alu::And,
        Opcode::AtomicFetchOr => Alu::Or,
        Opcode::AtomicFetchXor => Alu::Xor,
        _ => unreachable!(),
    };
    let w = elem == 8;
    let dst = gpr(cx, id);
    let addr = gpr(cx, node.arg(0));
    let val = gpr(cx, node.arg(1));

    ld(cx.buf, elem, TMP1, addr, 0);
    let retry = cx.buf.offset();
    mov_rr(cx.buf, w, TMP2, TMP1);
    arith_rr(cx.buf, alu, w, TMP2, val);
    lock_cmpxchg(cx.buf, elem, addr, TMP2);
    jcc_to(cx.buf, Cc::NZ, retry);
    mov_rr(cx.buf, w, dst, TMP1);
    canonicalize(cx.buf, elem, dst);
    Ok(())
}
