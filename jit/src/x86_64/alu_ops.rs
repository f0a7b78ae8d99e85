//! Scalar ALU lowering.
//!
//! Invariant: every GPR value is kept zero-extended to 64 bits at its
//! operation size, so sub-32-bit ops can run at their natural width
//! without re-masking inputs.

use crate::compiler::BlockCx;
use crate::dispatch::DispatchTable;
use crate::x86_64::backend::{
    canonicalize, emit_cmp, fpr, gpr, operand, operand_reg, SrcOp, X86_64Backend,
};
use crate::x86_64::emitter::*;
use crate::x86_64::regs::*;
use crate::CompileError;
use dbt_ir::node::IrNode;
use dbt_ir::ra::RegClass;
use dbt_ir::{CondCode, NodeId, Opcode};

type B = X86_64Backend;
type R = Result<(), CompileError>;

pub fn register(t: &mut DispatchTable<B>) {
    t.set(Opcode::Constant, op_constant);
    t.set(Opcode::Mov, op_mov);
    t.set(Opcode::Add, op_add);
    t.set(Opcode::Sub, op_sub);
    t.set(Opcode::Mul, op_mul);
    t.set(Opcode::Div, op_div);
    t.set(Opcode::UDiv, op_div);
    t.set(Opcode::Rem, op_div);
    t.set(Opcode::URem, op_div);
    t.set(Opcode::And, op_and);
    t.set(Opcode::Or, op_or);
    t.set(Opcode::Xor, op_xor);
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
    mov_ri(cx.buf, dst, trunc_imm(node.imm, node.size));
    Ok(())
}

fn op_mov(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    if node.op.dest_class(node.size) == RegClass::Fpr {
        let dst = fpr(cx, id);
        let src = fpr(cx, node.arg(0));
        if dst != src {
            movaps_rr(cx.buf, dst, src);
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

/// Move `a` into the op's working register, tolerating `dst` aliasing
/// either source. Returns the register the 2-address op should mutate
/// (always `dst` or TMP1) plus whether a final move into `dst` is
/// needed.
fn setup_dst(cx: &mut BlockCx<'_>, w: bool, dst: Reg, a: Reg, b: Option<Reg>) -> (Reg, bool) {
    if dst == a {
        (dst, false)
    } else if Some(dst) == b {
        mov_rr(cx.buf, w, TMP1, a);
        (TMP1, true)
    } else {
        mov_rr(cx.buf, w, dst, a);
        (dst, false)
    }
}

fn finish_dst(cx: &mut BlockCx<'_>, size: u8, dst: Reg, work: Reg, moved: bool) {
    if moved {
        mov_rr(cx.buf, size == 8, dst, work);
    }
    if size < 4 {
        canonicalize(cx.buf, size, dst);
    }
}

fn alu_common(cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode, op: Alu) -> R {
    let size = node.size;
    let w = size == 8;
    let dst = gpr(cx, id);
    let a = operand_reg(cx, node.arg(0), TMP2);
    match operand(cx, node.arg(1)) {
        SrcOp::Imm(v) if (v as i64) >= i32::MIN as i64 && (v as i64) <= i32::MAX as i64 => {
            let (work, moved) = setup_dst(cx, w, dst, a, None);
            arith_ri(cx.buf, op, w, work, v as i32);
            finish_dst(cx, size, dst, work, moved);
        }
        other => {
            let b = match other {
                SrcOp::R(r) => r,
                SrcOp::Imm(v) => {
                    mov_ri(cx.buf, TMP3, v);
                    TMP3
                }
            };
            let (work, moved) = setup_dst(cx, w, dst, a, Some(b));
            arith_rr(cx.buf, op, w, work, b);
            finish_dst(cx, size, dst, work, moved);
        }
    }
    Ok(())
}

fn op_add(b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let _ = b;
    alu_common(cx, id, node, Alu::Add)
}

fn op_sub(b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let _ = b;
    alu_common(cx, id, node, Alu::Sub)
}

fn op_and(b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let _ = b;
    alu_common(cx, id, node, Alu::And)
}

fn op_or(b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let _ = b;
    alu_common(cx, id, node, Alu::Or)
}

fn op_xor(b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let _ = b;
    alu_common(cx, id, node, Alu::Xor)
}

fn op_mul(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let w = size == 8;
    let dst = gpr(cx, id);
    let a = operand_reg(cx, node.arg(0), TMP2);
    let b = operand_reg(cx, node.arg(1), TMP3);
    let (work, moved) = setup_dst(cx, w, dst, a, Some(b));
    imul_rr(cx.buf, w, work, b);
    finish_dst(cx, size, dst, work, moved);
    Ok(())
}

/// Shared idiv/div lowering; quotient ops read rax, remainder ops rdx.
fn op_div(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let signed = matches!(node.op, Opcode::Div | Opcode::Rem);
    let want_rem = matches!(node.op, Opcode::Rem | Opcode::URem);
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    let b = gpr(cx, node.arg(1));

    if signed && size < 4 {
        // Widen to 32 bits; the quotient fits its natural width.
        if size == 1 {
            movsx8(cx.buf, false, TMP1, a);
            movsx8(cx.buf, false, TMP2, b);
        } else {
            movsx16(cx.buf, false, TMP1, a);
            movsx16(cx.buf, false, TMP2, b);
        }
        cdq(cx.buf, false);
        grp3(cx.buf, Grp3::Idiv, false, TMP2);
    } else {
        let w = size == 8;
        mov_rr(cx.buf, w, TMP1, a);
        if signed {
            cdq(cx.buf, w);
            grp3(cx.buf, Grp3::Idiv, w, b);
        } else {
            arith_rr(cx.buf, Alu::Xor, false, TMP3, TMP3);
            grp3(cx.buf, Grp3::Div, w, b);
        }
    }

    let res = if want_rem { TMP3 } else { TMP1 };
    mov_rr(cx.buf, size == 8, dst, res);
    if size < 4 {
        canonicalize(cx.buf, size, dst);
    }
    Ok(())
}

fn op_not(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let w = size == 8;
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    if dst != a {
        mov_rr(cx.buf, w, dst, a);
    }
    grp3(cx.buf, Grp3::Not, w, dst);
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
    if dst != a {
        mov_rr(cx.buf, w, dst, a);
    }
    grp3(cx.buf, Grp3::Neg, w, dst);
    if size < 4 {
        canonicalize(cx.buf, size, dst);
    }
    Ok(())
}

fn op_shift(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let bits = size as u32 * 8;
    let sh = match node.op {
        Opcode::Shl => Shift::Shl,
        Opcode::Shr => Shift::Shr,
        Opcode::Ashr => Shift::Sar,
        Opcode::Ror => Shift::Ror,
        _ => unreachable!(),
    };
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));

    match operand(cx, node.arg(1)) {
        SrcOp::Imm(v) => {
            if dst != a {
                mov_rr(cx.buf, size == 8, dst, a);
            }
            shift_ri(cx.buf, size, sh, dst, (v as u32 % bits) as u8);
        }
        SrcOp::R(cnt) => {
            // Count goes through CL; mask sub-32-bit widths where the
            // hardware masks by 31 instead of the operand width.
            mov_rr(cx.buf, false, TMP2, cnt);
            if size < 4 {
                arith_ri(cx.buf, Alu::And, false, TMP2, bits as i32 - 1);
            }
            if dst != a {
                mov_rr(cx.buf, size == 8, dst, a);
            }
            shift_cl(cx.buf, size, sh, dst);
        }
    }
    Ok(())
}

fn op_ubfe(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    let lsb = (node.misc & 0xff) as u8;
    let width = ((node.misc >> 8) & 0xff) as u32;
    if dst != a {
        mov_rr(cx.buf, true, dst, a);
    }
    if lsb != 0 {
        shift_ri(cx.buf, 8, Shift::Shr, dst, lsb);
    }
    if width < 64 {
        let mask = (1u64 << width) - 1;
        if mask <= i32::MAX as u64 {
            arith_ri(cx.buf, Alu::And, true, dst, mask as i32);
        } else {
            mov_ri(cx.buf, TMP1, mask);
            arith_rr(cx.buf, Alu::And, true, dst, TMP1);
        }
    }
    Ok(())
}

fn op_sbfe(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    let lsb = (node.misc & 0xff) as u8;
    let width = ((node.misc >> 8) & 0xff) as u8;
    if dst != a {
        mov_rr(cx.buf, true, dst, a);
    }
    let up = 64 - lsb - width;
    if up != 0 {
        shift_ri(cx.buf, 8, Shift::Shl, dst, up);
    }
    shift_ri(cx.buf, 8, Shift::Sar, dst, 64 - width);
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
    let width = ((node.misc >> 8) & 0xff) as u32;
    let mask = if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };

    mov_rr(cx.buf, true, TMP1, field);
    mov_ri(cx.buf, TMP2, mask);
    arith_rr(cx.buf, Alu::And, true, TMP1, TMP2);
    if lsb != 0 {
        shift_ri(cx.buf, 8, Shift::Shl, TMP1, lsb as u8);
    }
    if dst != base {
        mov_rr(cx.buf, true, dst, base);
    }
    mov_ri(cx.buf, TMP2, !(mask << lsb));
    arith_rr(cx.buf, Alu::And, true, dst, TMP2);
    arith_rr(cx.buf, Alu::Or, true, dst, TMP1);
    if size < 8 {
        canonicalize(cx.buf, size, dst);
    }
    Ok(())
}

fn op_popcount(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    popcnt(cx.buf, node.size == 8, dst, a);
    Ok(())
}

fn op_clz(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    lzcnt(cx.buf, size == 8, dst, a);
    if size < 4 {
        // lzcnt32 counted the 32-bit field; trim to the value width.
        arith_ri(cx.buf, Alu::Sub, false, dst, 32 - size as i32 * 8);
    }
    Ok(())
}

fn op_ctz(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    if size < 4 {
        // Bound the zero case at the value width.
        mov_rr(cx.buf, false, TMP1, a);
        bts_ri(cx.buf, false, TMP1, size * 8);
        tzcnt(cx.buf, false, dst, TMP1);
    } else {
        tzcnt(cx.buf, size == 8, dst, a);
    }
    Ok(())
}

fn op_rev(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let size = node.size;
    let dst = gpr(cx, id);
    let a = gpr(cx, node.arg(0));
    if dst != a {
        mov_rr(cx.buf, size == 8, dst, a);
    }
    match size {
        2 => shift_ri(cx.buf, 2, Shift::Ror, dst, 8),
        4 => bswap(cx.buf, false, dst),
        8 => bswap(cx.buf, true, dst),
        _ => unreachable!("rev size {size}"),
    }
    Ok(())
}

fn op_pair_extract(_b: &mut B, cx: &mut BlockCx<'_>, id: NodeId, node: &IrNode) -> R {
    let dst = gpr(cx, id);
    let (lo, hi) = crate::x86_64::backend::pair(cx, node.arg(0));
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
    let w = size == 8;
    if dst == tv {
        cmovcc(cx.buf, cc.invert(), w, dst, fv);
    } else {
        if dst != fv {
            mov_rr(cx.buf, w, dst, fv);
        }
        cmovcc(cx.buf, cc, w, dst, tv);
    }
    Ok(())
}
