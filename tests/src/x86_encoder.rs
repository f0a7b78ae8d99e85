//! Golden encodings for the x86-64 emitter.

use dbt_jit::code_buffer::{CodeAllocator, CodeBuffer};
use dbt_jit::x86_64::emitter::*;
use dbt_jit::x86_64::regs::{Reg, Xmm};

fn with_buf(f: impl FnOnce(&mut CodeBuffer)) -> Vec<u8> {
    let mut b = CodeAllocator::new(false).acquire(4096).unwrap();
    f(&mut b);
    b.as_slice().to_vec()
}

#[test]
fn mov_register_forms() {
    assert_eq!(
        with_buf(|b| mov_rr(b, true, Reg::Rax, Reg::Rbx)),
        vec![0x48, 0x8B, 0xC3]
    );
    assert_eq!(
        with_buf(|b| mov_rr(b, false, Reg::Rsi, Reg::R9)),
        vec![0x41, 0x8B, 0xF1]
    );
}

#[test]
fn mov_immediate_forms() {
    // 32-bit immediate zero-extends.
    assert_eq!(
        with_buf(|b| mov_ri(b, Reg::Rax, 0x1234)),
        vec![0xB8, 0x34, 0x12, 0x00, 0x00]
    );
    // Negative values sign-extend through REX.W C7.
    assert_eq!(
        with_buf(|b| mov_ri(b, Reg::Rcx, (-2i64) as u64)),
        vec![0x48, 0xC7, 0xC1, 0xFE, 0xFF, 0xFF, 0xFF]
    );
    // Full 64-bit constants take the movabs form.
    assert_eq!(
        with_buf(|b| mov_ri(b, Reg::Rdx, 0x1122_3344_5566_7788)),
        vec![0x48, 0xBA, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
    );
}

#[test]
fn loads_handle_special_bases() {
    // r13 as base forces a disp8 even at offset zero.
    assert_eq!(
        with_buf(|b| ld(b, 8, Reg::Rax, Reg::R13, 0)),
        vec![0x49, 0x8B, 0x45, 0x00]
    );
    // r12 as base needs a SIB byte.
    assert_eq!(
        with_buf(|b| ld(b, 8, Reg::Rax, Reg::R12, 0)),
        vec![0x49, 0x8B, 0x04, 0x24]
    );
    // Byte loads zero-extend via movzx.
    assert_eq!(
        with_buf(|b| ld(b, 1, Reg::Rcx, Reg::Rsi, 2)),
        vec![0x0F, 0xB6, 0x4E, 0x02]
    );
}

#[test]
fn stores_pick_width_prefixes() {
    assert_eq!(
        with_buf(|b| st(b, 2, Reg::Rcx, Reg::Rsi, 8)),
        vec![0x66, 0x89, 0x4E, 0x08]
    );
    assert_eq!(
        with_buf(|b| st(b, 4, Reg::Rcx, Reg::Rsi, 8)),
        vec![0x89, 0x4E, 0x08]
    );
    // Byte store of sil needs a bare REX.
    assert_eq!(
        with_buf(|b| st(b, 1, Reg::Rsi, Reg::Rax, 0)),
        vec![0x40, 0x88, 0x30]
    );
}

#[test]
fn arithmetic_forms() {
    assert_eq!(
        with_buf(|b| arith_rr(b, Alu::Add, true, Reg::Rax, Reg::Rcx)),
        vec![0x48, 0x03, 0xC1]
    );
    assert_eq!(
        with_buf(|b| arith_ri(b, Alu::Sub, true, Reg::Rsp, 8)),
        vec![0x48, 0x83, 0xEC, 0x08]
    );
    assert_eq!(
        with_buf(|b| arith_ri(b, Alu::And, false, Reg::Rcx, 0x1234)),
        vec![0x81, 0xE1, 0x34, 0x12, 0x00, 0x00]
    );
}

#[test]
fn shifts_at_each_width() {
    assert_eq!(
        with_buf(|b| shift_cl(b, 8, Shift::Shl, Reg::Rax)),
        vec![0x48, 0xD3, 0xE0]
    );
    assert_eq!(
        with_buf(|b| shift_cl(b, 2, Shift::Ror, Reg::Rbx)),
        vec![0x66, 0xD3, 0xCB]
    );
    assert_eq!(
        with_buf(|b| shift_ri(b, 4, Shift::Sar, Reg::Rdx, 3)),
        vec![0xC1, 0xFA, 0x03]
    );
}

#[test]
fn push_pop_extended_registers() {
    assert_eq!(with_buf(|b| push(b, Reg::R12)), vec![0x41, 0x54]);
    assert_eq!(with_buf(|b| pop(b, Reg::Rbx)), vec![0x5B]);
}

#[test]
fn condition_material() {
    assert_eq!(
        with_buf(|b| setcc(b, Cc::E, Reg::Rsi)),
        vec![0x40, 0x0F, 0x94, 0xC6]
    );
    assert_eq!(
        with_buf(|b| cmovcc(b, Cc::B, true, Reg::Rax, Reg::Rdx)),
        vec![0x48, 0x0F, 0x42, 0xC2]
    );
}

#[test]
fn branch_patching() {
    let bytes = with_buf(|b| {
        let site = jcc_rel32(b, Cc::NE);
        // Land 16 bytes past the displacement field.
        patch_rel32(b, site, site + 4 + 16);
    });
    assert_eq!(bytes, vec![0x0F, 0x85, 0x10, 0x00, 0x00, 0x00]);
}

#[test]
fn indirect_control_flow() {
    assert_eq!(with_buf(|b| jmp_reg(b, Reg::Rax)), vec![0xFF, 0xE0]);
    assert_eq!(
        with_buf(|b| jmp_mem(b, Reg::R14, 0x18)),
        vec![0x41, 0xFF, 0x66, 0x18]
    );
    assert_eq!(
        with_buf(|b| call_mem(b, Reg::R14, 0x40)),
        vec![0x41, 0xFF, 0x56, 0x40]
    );
}

#[test]
fn rip_relative_lea_and_jmp() {
    let bytes = with_buf(|b| {
        let site = lea_rip(b, Reg::Rax);
        // Point the lea back at the start of the buffer.
        patch_rel32(b, site, 0);
    });
    // lea rax, [rip - 7]: instruction is 7 bytes long.
    assert_eq!(bytes, vec![0x48, 0x8D, 0x05, 0xF9, 0xFF, 0xFF, 0xFF]);

    let bytes = with_buf(|b| {
        let site = jmp_rip_mem(b);
        patch_rel32(b, site, 8);
    });
    assert_eq!(bytes, vec![0xFF, 0x25, 0x02, 0x00, 0x00, 0x00]);
}

#[test]
fn locked_atomics() {
    assert_eq!(
        with_buf(|b| lock_cmpxchg(b, 8, Reg::Rsi, Reg::R8)),
        vec![0xF0, 0x4C, 0x0F, 0xB1, 0x06]
    );
    assert_eq!(
        with_buf(|b| lock_xadd(b, 4, Reg::Rsi, Reg::Rax)),
        vec![0xF0, 0x0F, 0xC1, 0x06]
    );
    assert_eq!(
        with_buf(|b| xchg_mem(b, 8, Reg::Rsi, Reg::Rax)),
        vec![0x48, 0x87, 0x06]
    );
}

#[test]
fn sse_forms() {
    assert_eq!(
        with_buf(|b| movdqu_load(b, Xmm(4), Reg::Rsp, 16)),
        vec![0xF3, 0x0F, 0x6F, 0x64, 0x24, 0x10]
    );
    assert_eq!(
        with_buf(|b| movaps_rr(b, Xmm(1), Xmm(2))),
        vec![0x0F, 0x28, 0xCA]
    );
    assert_eq!(
        with_buf(|b| movd_to_xmm(b, true, Xmm(0), Reg::Rax)),
        vec![0x66, 0x48, 0x0F, 0x6E, 0xC0]
    );
    assert_eq!(
        with_buf(|b| sse_rr(b, opc_padd(4), Xmm(1), Xmm(2))),
        vec![0x66, 0x0F, 0xFE, 0xCA]
    );
    assert_eq!(
        with_buf(|b| sse_rr(b, OPC_PXOR, Xmm(0), Xmm(0))),
        vec![0x66, 0x0F, 0xEF, 0xC0]
    );
    assert_eq!(
        with_buf(|b| sse_rr_imm(b, OPC_PSHUFD, Xmm(3), Xmm(3), 0)),
        vec![0x66, 0x0F, 0x70, 0xDB, 0x00]
    );
    // Packed shift: /6 selector encodes in the reg field.
    assert_eq!(
        with_buf(|b| pshift_imm(b, 4, 6, Xmm(2), 5)),
        vec![0x66, 0x0F, 0x72, 0xF2, 0x05]
    );
    assert_eq!(
        with_buf(|b| pextr(b, 4, Reg::Rax, Xmm(4), 1)),
        vec![0x66, 0x0F, 0x3A, 0x16, 0xE0, 0x01]
    );
}

#[test]
fn grp3_and_counting() {
    assert_eq!(
        with_buf(|b| grp3(b, Grp3::Neg, true, Reg::Rax)),
        vec![0x48, 0xF7, 0xD8]
    );
    assert_eq!(
        with_buf(|b| popcnt(b, false, Reg::Rax, Reg::Rcx)),
        vec![0xF3, 0x0F, 0xB8, 0xC1]
    );
    assert_eq!(
        with_buf(|b| bswap(b, true, Reg::Rax)),
        vec![0x48, 0x0F, 0xC8]
    );
    assert_eq!(with_buf(|b| cdq(b, true)), vec![0x48, 0x99]);
    assert_eq!(with_buf(ud2), vec![0x0F, 0x0B]);
}
