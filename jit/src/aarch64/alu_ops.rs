//! Scalar ALU lowering (AArch64).
//!
//! Same canonical zero-extension invariant as the x86-64 backend:
//! values live zero-extended to 64 bits at their operation size.

use crate::aarch64::backend::{
    canonicalize, emit_cmp, fpr, gpr, operand, operand_reg, Aarch64Backend, SrcOp,
};
use crate::aarch64::emitter::*;
use crate::aarch64::regs::*;
use crate::compiler::BlockCx;
use crate::dispatch::DispatchTable;
use crate::CompileError;
use dbt_ir::node::IrNode;
use dbt_ir::ra::RegClass;
use dbt_ir::{CondCode, NodeId, Opcode};

type B = Aarch64Backend;
type R = Result<(), CompileError>;

pub fn register(t: &mut DispatchTable<B>) {
    t.set(Opcode::Constant, op_constant);
    t.set(Opcode::Mov, op_mov);
    t.set(Opcode::Add, op_binop);
    t.set(Opcode::Sub, op_binop);
    t.set(Opcode::Mul, op_binop);
    t.set(Opcode::And, op_binop);
    t.set(Opcode::Or, op_binop);
    t.set(Opcode::Xor, op_binop);
    t.set(Opcode::Div, op_div);
    t.set(Opcode::UDiv, op_div);
    t.set(Opcode::Rem, op_rem);
    t.set(Opcode::URem, op_rem);
    t.set(Opcode::Not, op_not);
    t.set(Opcode::Neg, op_neg);
    t.set(Opcode::Shl, op_shift);
    t.set(Opcode::Shr, op_shift);
    t.set(Opcode::Ashr, op_shift);
    t.set(Opcode::Ror, op_shift);
    t.set(Opcode::Sbfe, op_sbfe);
    t.set(Opcode::Ubfe, op_ubfe);
    t.set(Opcode::Bfi, op_bfi);
    t.set(Opcode::Popcount, op_popcount);
    t.set(Opcode::Clz, op_clz);
    t.set(Opcode::Ctz, op_ctz);
    t.set(Opcode::Rev, op_rev);
    t.set(Opcode::Select, op_select);
    t.set(Opcode::PairExtract, op_pair_extract);
}

fn trunc_imm(val: u64, size: u8) -> u64 {
    match size {
        1 => val as u8 as u64,
        2 => val as u16 as u64,
        4 => val as u32 as u64,
        _ => val,
    }
}

fn op_constant(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let dst = gpr(cx, id);
    mov_imm64(cx.buf, dst, trunc_imm(node.imm, node.size));
    Ok(())
}

fn op_mov(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    if node.op.dest_class(node.size) == RegClass::Fpr {
        let dst = fpr(cx, id);
        let src = fpr(cx, node.arg(0));
        if dst != src {
            v_mov(cx.buf, dst, src);
        }
        return Ok(());
    }
    let dst = gpr(cx, id);
    let src = operand_reg(cx, node.arg(0), TMP1);
    if dst != src {
        mov_rr(cx.buf, node.size == 8, dst, src);
    }
    Ok(())
}

/// Three-address forms make aliasing a non-issue; pick the width and
/// re-canonicalize below 32 bits.
fn op_binop(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let w = size == 8;
    let dst = gpr(cx, id);
    let a = operand_reg(cx, node.arg(0), TMP1);
    let b = operand_reg(cx, node.arg(1), TMP2);
    match node.op {
        Opcode::Add => add_rr(cx.buf, w, dst, a, b),
        Opcode::Sub => sub_rr(cx.buf, w, dst, a, b),
        Opcode::Mul => mul_rr(cx.buf, w, dst, a, b),
        Opcode::And => and_rr(cx.buf, w, dst, a, b),
        Opcode::Or => orr_rr(cx.buf, w, dst, a, b),
        Opcode::Xor => eor_rr(cx.buf, w, dst, a, b),
        _ => unreachable!(),
    }
    if size < 4 {
        canonicalize(cx.buf, size, dst);
    }
    Ok(())
}

fn op_div(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let signed = node.op == Opcode::Div;
    let dst = gpr(cx, id);
    let mut a = gpr(cx, node.arg(0));
    let mut b = gpr(cx, node.arg(1));
    if signed && size < 4 {
        if size == 1 {
            sxtb(cx.buf, false, TMP1, a);
            sxtb(cx.buf, false, TMP2, b);
        } else {
            sxth(cx.buf, false, TMP1, a);
            sxth(cx.buf, false, TMP2, b);
        }
        a = TMP1;
        b = TMP2;
    }
    let w = size == 8;
    if signed {
        sdiv(cx.buf, w, dst, a, b);
    } else {
        udiv(cx.buf, w, dst, a, b);
    }
    if size < 4 {
        canonicalize(cx.buf, size, dst);
    }
    Ok(())
}

fn op_rem(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let signed = node.op == Opcode::Rem;
    let dst = gpr(cx, id);
    let mut a = gpr(cx, node.arg(0));
    let mut b = gpr(cx, node.arg(1));
    if signed && size < 4 {
        if size == 1 {
            sxtb(cx.buf, false, TMP1, a);
            sxtb(cx.buf, false, TMP2, b);
        } else {
            sxth(cx.buf, false, TMP1, a);
            sxth(cx.buf, false, TMP2, b);
        }
        a = TMP1;
        b = TMP2;
    }
    let w = size == 8;
    if signed {
        sdiv(cx.buf, w, TMP3, a, b);
    } else {
        udiv(cx.buf, w, TMP3, a, b);
    }
    msub(cx.buf, w, dst, TMP3, b, a);
    if size < 4 {
        canonicalize(cx.buf, size, dst);
    }
    Ok(())
}

fn op_not(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    mvn_rr(cx.buf, size == 8, dst, a);
    if size < 4 {
        canonicalize(cx.buf, size, dst);
    }
    Ok(())
}

fn op_neg(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let w = size == 8;
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    sub_rr(cx.buf, w, dst, XZR, a);
    if size < 4 {
        canonicalize(cx.buf, size, dst);
    }
    Ok(())
}

fn op_shift(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let bits = size as u32 * 8;
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));

    if let SrcOp::Imm(v) = operand(cx, node.arg(1)) {
        let sh = (v as u32 % bits) as u8;
        return emit_shift_imm(cx, node.op, size, dst, a, sh);
    }

    let cnt = gpr(cx, node.arg(1));
    // Mask the count to the operation width; LSLV and friends mask at
    // the register width instead.
    mov_rr(cx.buf, false, TMP2, cnt);
    if size < 4 {
        mov_imm64(cx.buf, TMP3, bits as u64 - 1);
        and_rr(cx.buf, false, TMP2, TMP2, TMP3);
    }
    let w = size == 8;
    match node.op {
        Opcode::Shl => {
            lslv(cx.buf, w, dst, a, TMP2);
            canonicalize(cx.buf, size, dst);
        }
        Opcode::Shr => {
            lsrv(cx.buf, w, dst, a, TMP2);
        }
        Opcode::Ashr => {
            if size < 4 {
                if size == 1 {
                    sxtb(cx.buf, false, TMP1, a);
                } else {
                    sxth(cx.buf, false, TMP1, a);
                }
                asrv(cx.buf, false, dst, TMP1, TMP2);
                canonicalize(cx.buf, size, dst);
            } else {
                asrv(cx.buf, w, dst, a, TMP2);
            }
        }
        Opcode::Ror => {
            if size < 4 {
                // Compose from shifts: (a >> c) | (a << ((bits-c) & mask)).
                mov_imm64(cx.buf, TMP1, bits as u64);
                sub_rr(cx.buf, false, TMP1, TMP1, TMP2);
                mov_imm64(cx.buf, TMP3, bits as u64 - 1);
                and_rr(cx.buf, false, TMP1, TMP1, TMP3);
                lslv(cx.buf, false, TMP1, a, TMP1);
                lsrv(cx.buf, false, TMP3, a, TMP2);
                orr_rr(cx.buf, false, dst, TMP1, TMP3);
                canonicalize(cx.buf, size, dst);
            } else {
                rorv(cx.buf, w, dst, a, TMP2);
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn emit_shift_imm(
    cx: &mut BlockCx<'_>,
    op: Opcode,
    size: u8,
    dst: XReg,
    a: XReg,
    sh: u8,
) -> R {
    let w = size == 8;
    match op {
        Opcode::Shl => {
            lsl_imm(cx.buf, w, dst, a, sh);
            canonicalize(cx.buf, size, dst);
        }
        Opcode::Shr => lsr_imm(cx.buf, w, dst, a, sh),
        Opcode::Ashr => {
            if size < 4 {
                if size == 1 {
                    sxtb(cx.buf, false, TMP1, a);
                } else {
                    sxth(cx.buf, false, TMP1, a);
                }
                asr_imm(cx.buf, false, dst, TMP1, sh);
                canonicalize(cx.buf, size, dst);
            } else {
                asr_imm(cx.buf, w, dst, a, sh);
            }
        }
        Opcode::Ror => {
            if size < 4 {
                let bits = size as u32 * 8;
                lsr_imm(cx.buf, false, TMP1, a, sh);
                lsl_imm(cx.buf, false, TMP3, a, ((bits - sh as u32) % bits) as u8);
                orr_rr(cx.buf, false, dst, TMP1, TMP3);
                canonicalize(cx.buf, size, dst);
            } else if sh == 0 {
                mov_rr(cx.buf, w, dst, a);
            } else {
                // ROR immediate via EXTR would also work; compose from
                // shifts to keep the encoder surface small.
                lsr_imm(cx.buf, w, TMP1, a, sh);
                let bits = size as u32 * 8;
                lsl_imm(cx.buf, w, TMP3, a, (bits - sh as u32) as u8);
                orr_rr(cx.buf, w, dst, TMP1, TMP3);
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn op_ubfe(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    let lsb = (node.misc & 0xff) as u8;
    let width = ((node.misc >> 8) & 0xff) as u8;
    if width >= 64 {
        if lsb == 0 {
            mov_rr(cx.buf, true, dst, a);
        } else {
            lsr_imm(cx.buf, true, dst, a, lsb);
        }
    } else {
        ubfm(cx.buf, true, dst, a, lsb, lsb + width - 1);
    }
    Ok(())
}

fn op_sbfe(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    let lsb = (node.misc & 0xff) as u8;
    let width = ((node.misc >> 8) & 0xff) as u8;
    sbfm(cx.buf, true, dst, a, lsb, lsb + width - 1);
    if size < 8 {
        canonicalize(cx.buf, size, dst);
    }
    Ok(())
}

fn op_bfi(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let dst = gpr(cx, id);
    let base = gpr(cx, node.arg(0));
    let field = gpr(cx, node.arg(1));
    let lsb = (node.misc & 0xff) as u32;
    let width = ((node.misc >> 8) & 0xff) as u8;
    if dst != base {
        mov_rr(cx.buf, true, dst, base);
    }
    let f = if dst == field {
        mov_rr(cx.buf, true, TMP1, field);
        TMP1
    } else {
        field
    };
    // BFI dst, f, #lsb, #width.
    bfm(cx.buf, true, dst, f, ((64 - lsb) % 64) as u8, width - 1);
    if size < 8 {
        canonicalize(cx.buf, size, dst);
    }
    Ok(())
}

fn op_popcount(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    fmov_d_from_x(cx.buf, VTMP1, a);
    v_cnt8(cx.buf, false, VTMP1, VTMP1);
    v_addv8(cx.buf, false, VTMP1, VTMP1);
    fmov_w_from_s(cx.buf, dst, VTMP1);
    Ok(())
}

fn op_clz(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    clz(cx.buf, size == 8, dst, a);
    if size < 4 {
        sub_imm(cx.buf, false, dst, dst, 32 - size as u32 * 8);
    }
    Ok(())
}

fn op_ctz(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    if size < 4 {
        // Bound the all-zero case at the value width.
        mov_imm64(cx.buf, TMP1, 1 << (size as u32 * 8));
        orr_rr(cx.buf, false, TMP1, TMP1, a);
        rbit(cx.buf, false, TMP1, TMP1);
        clz(cx.buf, false, dst, TMP1);
    } else {
        rbit(cx.buf, size == 8, TMP1, a);
        clz(cx.buf, size == 8, dst, TMP1);
    }
    Ok(())
}

fn op_rev(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    match node.size {
        2 => {
            rev16(cx.buf, false, dst, a);
            uxth(cx.buf, dst, dst);
        }
        4 => rev(cx.buf, false, dst, a),
        8 => rev(cx.buf, true, dst, a),
        _ => unreachable!("rev size {}", node.size),
    }
    Ok(())
}

fn op_pair_extract(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let dst = gpr(cx, id);
    let (lo, hi) = crate::aarch64::backend::pair(cx, node.arg(0));
    let src = if node.misc & 1 == 0 { lo } else { hi };
    if dst != src {
        mov_rr(cx.buf, true, dst, src);
    }
    Ok(())
}

fn op_select(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let cond = CondCode::from_u32(node.misc);
    let dst = gpr(cx, id);
    let cc = emit_cmp(cx, size, cond, node.arg(0), node.arg(1));
    let tv = operand_reg(cx, node.arg(2), TMP1);
    let fv = operand_reg(cx, node.arg(3), TMP2);
    csel(cx.buf, size == 8, dst, tv, fv, cc);
    Ok(())
}
