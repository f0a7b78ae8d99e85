//! Atomic op lowering: exclusive-monitor loops (LDAXR/STLXR), the
//! AArch64 rendition of the x86 LOCK-prefixed forms.

use crate::aarch64::backend::{canonicalize, gpr, Aarch64Backend};
use crate::aarch64::emitter::*;
use crate::aarch64::regs::*;
use crate::compiler::BlockCx;
use crate::dispatch::DispatchTable;
use crate::CompileError;
use dbt_ir::node::IrNode;
use dbt_ir::{NodeId, Opcode};

type B = Aarch64Backend;
type R = Result<(), CompileError>;

pub fn register(t: &mut DispatchTable<B>) {
    t.set(Opcode::Cas, op_cas);
    t.set(Opcode::AtomicSwap, op_rmw);
    t.set(Opcode::AtomicFetchAdd, op_rmw);
    t.set(Opcode::AtomicFetchSub, op_rmw);
    t.set(Opcode::AtomicFetchAnd, op_rmw);
    t.set(Opcode::AtomicFetchOr, op_rmw);
    t.set(Opcode::AtomicFetchXor, op_rmw);
}

fn op_cas(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let elem = node.elem_size;
    let w = elem == 8;
    let dst = gpr(cx, id);
    let addr = gpr(cx, node.arg(0));
    let expected = gpr(cx, node.arg(1));
    let desired = gpr(cx, node.arg(2));

    // retry: ldaxr old; cmp old, expected; b.ne fail;
    //        stlxr status, desired; cbnz status, retry
    let retry = cx.buf.offset();
    ldaxr(cx.buf, elem, TMP1, addr);
    cmp_rr(cx.buf, w, TMP1, expected);
    let fail = b_cond_placeholder(cx.buf, A64Cond::NE);
    stlxr(cx.buf, elem, TMP2, desired, addr);
    cbnz_to(cx.buf, false, TMP2, retry);
    let done = b_placeholder(cx.buf);
    let fail_target = cx.buf.offset();
    patch_cond19(cx.buf, fail, fail_target);
    clrex(cx.buf);
    let done_target = cx.buf.offset();
    patch_branch26(cx.buf, done, done_target);
    mov_rr(cx.buf, true, dst, TMP1);
    canonicalize(cx.buf, elem, dst);
    Ok(())
}

fn op_rmw(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let elem = node.elem_size;
    let w = elem == 8;
    let dst = gpr(cx, id);
    let addr = gpr(cx, node.arg(0));
    let val = gpr(cx, node.arg(1));

    let retry = cx.buf.offset();
    ldaxr(cx.buf, elem, TMP1, addr);
    match node.op {
        Opcode::AtomicSwap => mov_rr(cx.buf, w, TMP3, val),
        Opcode::AtomicFetchAdd => add_rr(cx.buf, w, TMP3, TMP1, val),
        Opcode::AtomicFetchSub => sub_rr(cx.buf, w, TMP3, TMP1, val),
        Opcode::AtomicFetchAnd => and_rr(cx.buf, w, TMP3, TMP1, val),
        Opcode::AtomicFetchOr => orr_rr(cx.buf, w, TMP3, TMP1, val),
        Opcode::AtomicFetchXor => eor_rr(cx.buf, w, TMP3, TMP1, val),
        _ => unreachable!(),
    }
    stlxr(cx.buf, elem, TMP2, TMP3, addr);
    cbnz_to(cx.buf, false, TMP2, retry);
    mov_rr(cx.buf, true, dst, TMP1);
    canonicalize(cx.buf, elem, dst);
    Ok(())
}
