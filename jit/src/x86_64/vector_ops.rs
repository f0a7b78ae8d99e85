//! Vector op lowering over the 16-byte SSE register file.
//!
//! 32-byte vectors are an SVE-only path on the AArch64 backend; here
//! they abort compilation as unsupported.

use crate::compiler::BlockCx;
use crate::dispatch::DispatchTable;
use crate::x86_64::backend::{fpr, gpr, X86_64Backend};
use crate::x86_64::emitter::*;
use crate::x86_64::regs::*;
use crate::CompileError;
use dbt_ir::node::IrNode;
use dbt_ir::{NodeId, Opcode};

type B = X86_64Backend;
type R = Result<(), CompileError>;

pub fn register(t: &mut DispatchTable<B>) {
    t.set(Opcode::VAdd, op_vbinop);
    t.set(Opcode::VSub, op_vbinop);
    t.set(Opcode::VAnd, op_vbinop);
    t.set(Opcode::VOr, op_vbinop);
    t.set(Opcode::VXor, op_vbinop);
    t.set(Opcode::VSMin, op_vbinop);
    t.set(Opcode::VSMax, op_vbinop);
    t.set(Opcode::VUMin, op_vbinop);
    t.set(Opcode::VUMax, op_vbinop);
    t.set(Opcode::VCmpEq, op_vbinop);
    t.set(Opcode::VCmpGt, op_vbinop);
    t.set(Opcode::VNeg, op_vneg);
    t.set(Opcode::VDup, op_vdup);
    t.set(Opcode::VShlI, op_vshift);
    t.set(Opcode::VUShrI, op_vshift);
    t.set(Opcode::VSShrI, op_vshift);
    t.set(Opcode::VExtract, op_vextract);
}

fn unsupported(node: &IrNode) -> CompileError {
    CompileError::UnsupportedOp {
        op: node.op.name(),
        size: node.size,
    }
}

fn binop_opc(node: &IrNode) -> Option<u32> {
    let elem = node.elem_size;
    match node.op {
        Opcode::VAdd => Some(opc_padd(elem)),
        Opcode::VSub => Some(opc_psub(elem)),
        Opcode::VAnd => Some(OPC_PAND),
        Opcode::VOr => Some(OPC_POR),
        Opcode::VXor => Some(OPC_PXOR),
        Opcode::VSMin => opc_pminmax(elem, true, false),
        Opcode::VSMax => opc_pminmax(elem, true, true),
        Opcode::VUMin => opc_pminmax(elem, false, false),
        Opcode::VUMax => opc_pminmax(elem, false, true),
        Opcode::VCmpEq => Some(opc_pcmpeq(elem)),
        Opcode::VCmpGt => Some(opc_pcmpgt(elem)),
        _ => unreachable!(),
    }
}

fn op_vbinop(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    if node.size != 16 {
        return Err(unsupported(node));
    }
    let opc = binop_opc(node).ok_or_else(|| unsupported(node))?;
    let dst = fpr(cx, id);
    let a = fpr(cx, node.arg(0));
    let b = fpr(cx, node.arg(1));

    // SSE forms are destructive; route through a scratch register when
    // the destination aliases the second source.
    if dst == b && dst != a {
        movaps_rr(cx.buf, VTMP1, a);
        sse_rr(cx.buf, opc, VTMP1, b);
        movaps_rr(cx.buf, dst, VTMP1);
    } else {
        if dst != a {
            movaps_rr(cx.buf, dst, a);
        }
        sse_rr(cx.buf, opc, dst, b);
    }
    Ok(())
}

fn op_vneg(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    if node.size != 16 {
        return Err(unsupported(node));
    }
    let dst = fpr(cx, id);
    let a = fpr(cx, node.arg(0));
    let sub = opc_psub(node.elem_size);
    if dst == a {
        sse_rr(cx.buf, OPC_PXOR, VTMP1, VTMP1);
        sse_rr(cx.buf, sub, VTMP1, a);
        movaps_rr(cx.buf, dst, VTMP1);
    } else {
        sse_rr(cx.buf, OPC_PXOR, dst, dst);
        sse_rr(cx.buf, sub, dst, a);
    }
    Ok(())
}

fn op_vdup(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    if node.size != 16 {
        return Err(unsupported(node));
    }
    let dst = fpr(cx, id);
    let src = gpr(cx, node.arg(0));
    match node.elem_size {
        1 => {
            movd_to_xmm(cx.buf, false, dst, src);
            sse_rr(cx.buf, OPC_PXOR, VTMP1, VTMP1);
            sse_rr(cx.buf, OPC_PSHUFB, dst, VTMP1);
        }
        2 => {
            movd_to_xmm(cx.buf, false, dst, src);
            sse_rr_imm(cx.buf, OPC_PSHUFLW, dst, dst, 0x00);
            sse_rr_imm(cx.buf, OPC_PSHUFD, dst, dst, 0x00);
        }
        4 => {
            movd_to_xmm(cx.buf, false, dst, src);
            sse_rr_imm(cx.buf, OPC_PSHUFD, dst, dst, 0x00);
        }
        8 => {
            movd_to_xmm(cx.buf, true, dst, src);
            sse_rr_imm(cx.buf, OPC_PSHUFD, dst, dst, 0x44);
        }
        _ => return Err(unsupported(node)),
    }
    Ok(())
}

fn op_vshift(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    if node.size != 16 {
        return Err(unsupported(node));
    }
    let elem = node.elem_size;
    // No byte-lane shifts, and no 64-bit arithmetic right shift, in
    // SSE.
    if elem == 1 || (elem == 8 && node.op == Opcode::VSShrI) {
        return Err(unsupported(node));
    }
    let ext = match node.op {
        Opcode::VShlI => 6,
        Opcode::VUShrI => 2,
        Opcode::VSShrI => 4,
        _ => unreachable!(),
    };
    let dst = fpr(cx, id);
    let a = fpr(cx, node.arg(0));
    if dst != a {
        movaps_rr(cx.buf, dst, a);
    }
    pshift_imm(cx.buf, elem, ext, dst, node.misc as u8);
    Ok(())
}

fn op_vextract(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let dst = gpr(cx, id);
    let src = fpr(cx, node.arg(0));
    pextr(cx.buf, node.elem_size, dst, src, node.misc as u8);
    Ok(())
}
