//! Vector op lowering (AArch64).
//!
//! 16-byte ops use Advanced SIMD. 32-byte ops use SVE and are only
//! available when the host advertises a 256-bit vector length; the
//! predicated SVE min/max forms are destructive, so they run through a
//! move-to-temp idiom to keep the IR's non-destructive semantics.

use crate::aarch64::backend::{fpr, gpr, Aarch64Backend};
use crate::aarch64::emitter::*;
use crate::aarch64::regs::*;
use crate::compiler::BlockCx;
use crate::dispatch::DispatchTable;
use crate::{CompileError, HostFeatures};
use dbt_ir::node::IrNode;
use dbt_ir::{NodeId, Opcode};

type B = Aarch64Backend;
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

fn has_sve(cx: &BlockCx<'_>) -> bool {
    cx.config.features.contains(HostFeatures::SVE256)
}

fn op_vbinop(b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let elem = node.elem_size;
    let dst = fpr(cx, id);
    let a = fpr(cx, node.arg(0));
    let rb = fpr(cx, node.arg(1));

    match node.size {
        16 => {
            match node.op {
                Opcode::VAdd => v_add(cx.buf, elem, dst, a, rb),
                Opcode::VSub => v_sub(cx.buf, elem, dst, a, rb),
                Opcode::VAnd => v_and(cx.buf, dst, a, rb),
                Opcode::VOr => v_orr(cx.buf, dst, a, rb),
                Opcode::VXor => v_eor(cx.buf, dst, a, rb),
                Opcode::VSMin => v_smin(cx.buf, elem, dst, a, rb),
                Opcode::VSMax => v_smax(cx.buf, elem, dst, a, rb),
                Opcode::VUMin => v_umin(cx.buf, elem, dst, a, rb),
                Opcode::VUMax => v_umax(cx.buf, elem, dst, a, rb),
                Opcode::VCmpEq => v_cmeq(cx.buf, elem, dst, a, rb),
                Opcode::VCmpGt => v_cmgt(cx.buf, elem, dst, a, rb),
                _ => unreachable!(),
            }
            Ok(())
        }
        32 if has_sve(cx) => {
            match node.op {
                Opcode::VAdd => sve_add(cx.buf, elem, dst, a, rb),
                Opcode::VSub => sve_sub(cx.buf, elem, dst, a, rb),
                Opcode::VAnd => sve_and(cx.buf, dst, a, rb),
                Opcode::VOr => sve_orr(cx.buf, dst, a, rb),
                Opcode::VXor => sve_eor(cx.buf, dst, a, rb),
                Opcode::VSMin | Opcode::VSMax | Opcode::VUMin | Opcode::VUMax => {
                    // Destructive predicated form: compute in a temp,
                    // then move to the destination.
                    b.ensure_ptrue(cx);
                    sve_mov(cx.buf, VTMP1, a);
                    match node.op {
                        Opcode::VSMin => sve_smin(cx.buf, elem, 0, VTMP1, rb),
                        Opcode::VSMax => sve_smax(cx.buf, elem, 0, VTMP1, rb),
                        Opcode::VUMin => sve_umin(cx.buf, elem, 0, VTMP1, rb),
                        Opcode::VUMax => sve_umax(cx.buf, elem, 0, VTMP1, rb),
                        _ => unreachable!(),
                    }
                    sve_mov(cx.buf, dst, VTMP1);
                }
                _ => return Err(unsupported(node)),
            }
            Ok(())
        }
        _ => Err(unsupported(node)),
    }
}

fn op_vneg(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let dst = fpr(cx, id);
    let a = fpr(cx, node.arg(0));
    match node.size {
        16 => {
            v_neg(cx.buf, node.elem_size, dst, a);
            Ok(())
        }
        32 if has_sve(cx) => {
            // No unpredicated NEG; subtract from zero instead.
            sve_eor(cx.buf, VTMP1, VTMP1, VTMP1);
            sve_sub(cx.buf, node.elem_size, dst, VTMP1, a);
            Ok(())
        }
        _ => Err(unsupported(node)),
    }
}

fn op_vdup(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let dst = fpr(cx, id);
    let src = gpr(cx, node.arg(0));
    match node.size {
        16 => {
            v_dup_gen(cx.buf, node.elem_size, dst, src);
            Ok(())
        }
        32 if has_sve(cx) => {
            sve_dup_gen(cx.buf, node.elem_size, dst, src);
            Ok(())
        }
        _ => Err(unsupported(node)),
    }
}

fn op_vshift(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    if node.size != 16 {
        return Err(unsupported(node));
    }
    let dst = fpr(cx, id);
    let a = fpr(cx, node.arg(0));
    let sh = node.misc as u8;
    match node.op {
        Opcode::VShlI => v_shl_imm(cx.buf, node.elem_size, dst, a, sh),
        Opcode::VUShrI => {
            if sh == 0 {
                if dst != a {
                    v_mov(cx.buf, dst, a);
                }
            } else {
                v_ushr_imm(cx.buf, node.elem_size, dst, a, sh);
            }
        }
        Opcode::VSShrI => {
            if sh == 0 {
                if dst != a {
                    v_mov(cx.buf, dst, a);
                }
            } else {
                v_sshr_imm(cx.buf, node.elem_size, dst, a, sh);
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn op_vextract(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let dst = gpr(cx, id);
    let src = fpr(cx, node.arg(0));
    v_umov(cx.buf, node.elem_size, dst, src, node.misc as u8);
    Ok(())
}
