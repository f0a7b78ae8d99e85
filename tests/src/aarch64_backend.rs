//! Golden encodings for the AArch64 emitter, plus compile-only checks
//! of the backend (runs on any host: emission never executes here).

use dbt_exec::frame_offsets;
use dbt_jit::aarch64::emitter::*;
use dbt_jit::aarch64::regs::{VReg, XReg};
use dbt_jit::aarch64::Aarch64Backend;
use dbt_jit::code_buffer::{CodeAllocator, CodeBuffer};
use dbt_jit::compiler::CompileRequest;
use dbt_jit::{CompileConfig, CpuBackend, HostFeatures, CODE_HEADER_MAGIC};
use dbt_ir::ra::{allocate, DEFAULT_REG_FILE};
use dbt_ir::{IrBuilder, Opcode};

fn words(f: impl FnOnce(&mut CodeBuffer)) -> Vec<u32> {
    let mut b = CodeAllocator::new(false).acquire(4096).unwrap();
    f(&mut b);
    b.as_slice()
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

fn word(f: impl FnOnce(&mut CodeBuffer)) -> u32 {
    let w = words(f);
    assert_eq!(w.len(), 1);
    w[0]
}

#[test]
fn data_processing_register() {
    assert_eq!(
        word(|b| add_rr(b, true, XReg(0), XReg(1), XReg(2))),
        0x8B02_0020
    );
    assert_eq!(
        word(|b| sub_rr(b, false, XReg(3), XReg(4), XReg(5))),
        0x4B05_0083
    );
    assert_eq!(word(|b| cmp_rr(b, true, XReg(1), XReg(2))), 0xEB02_003F);
    assert_eq!(
        word(|b| mul_rr(b, true, XReg(0), XReg(1), XReg(2))),
        0x9B02_7C20
    );
    assert_eq!(
        word(|b| sdiv(b, true, XReg(0), XReg(1), XReg(2))),
        0x9AC2_0C20
    );
    assert_eq!(
        word(|b| csel(b, true, XReg(0), XReg(1), XReg(2), A64Cond::EQ)),
        0x9A82_0020
    );
    assert_eq!(word(|b| mov_rr(b, true, XReg(5), XReg(9))), 0xAA09_03E5);
}

#[test]
fn immediates() {
    assert_eq!(
        word(|b| movz(b, true, XReg(16), 0x1234, 0)),
        0xD282_4690
    );
    assert_eq!(
        word(|b| movk(b, true, XReg(16), 0xBEEF, 1)),
        0xF2B7_DDF0
    );
    // mov_imm64 composes movz + movk per nonzero halfword.
    let seq = words(|b| mov_imm64(b, XReg(0), 0x0001_0000_0002));
    assert_eq!(seq.len(), 2);
    assert_eq!(
        word(|b| add_imm(b, true, XReg(31), XReg(31), 16)),
        0x9100_43FF
    );
    assert_eq!(
        word(|b| lsr_imm(b, true, XReg(0), XReg(1), 8)),
        0xD348_FC20
    );
}

#[test]
fn loads_and_stores() {
    assert_eq!(
        word(|b| ldr_imm(b, 8, XReg(0), XReg(28), 16)),
        0xF940_0B80
    );
    assert_eq!(
        word(|b| str_imm(b, 4, XReg(1), XReg(2), 8)),
        0xB900_0841
    );
    assert_eq!(
        word(|b| stp_pre(b, XReg(29), XReg(30), XReg(31), -16)),
        0xA9BF_7BFD
    );
    assert_eq!(
        word(|b| ldp_post(b, XReg(19), XReg(20), XReg(31), 16)),
        0xA8C1_53F3
    );
    assert_eq!(word(|b| ldar(b, 8, XReg(1), XReg(2))), 0xC8DF_FC41);
    assert_eq!(word(|b| stlr(b, 4, XReg(1), XReg(2))), 0x889F_FC41);
    assert_eq!(word(|b| ldaxr(b, 8, XReg(1), XReg(2))), 0xC85F_FC41);
    assert_eq!(
        word(|b| stlxr(b, 8, XReg(3), XReg(1), XReg(2))),
        0xC803_FC41
    );
}

#[test]
fn branches() {
    assert_eq!(word(|b| br(b, XReg(0))), 0xD61F_0000);
    assert_eq!(word(|b| blr(b, XReg(16))), 0xD63F_0200);
    assert_eq!(word(ret), 0xD65F_03C0);
    // Forward branch over one word.
    assert_eq!(
        word(|b| {
            let site = b_placeholder(b);
            patch_branch26(b, site, site + 8);
        }),
        0x1400_0002
    );
    let w = word(|b| {
        let site = b_cond_placeholder(b, A64Cond::NE);
        patch_cond19(b, site, site + 12);
    });
    assert_eq!(w, 0x5400_0061);
}

#[test]
fn simd_forms() {
    assert_eq!(
        word(|b| v_add(b, 4, VReg(0), VReg(1), VReg(2))),
        0x4EA2_8420
    );
    assert_eq!(
        word(|b| v_dup_gen(b, 4, VReg(0), XReg(1))),
        0x4E04_0C20
    );
    assert_eq!(
        word(|b| v_umov(b, 8, XReg(0), VReg(1), 0)),
        0x4E08_3C20
    );
    assert_eq!(word(|b| v_eor(b, VReg(0), VReg(0), VReg(0))), 0x6E20_1C00);
    assert_eq!(
        word(|b| ldr_q_imm(b, VReg(4), XReg(31), 16)),
        0x3DC0_07E4
    );
}

#[test]
fn sve_forms() {
    assert_eq!(word(|b| sve_ptrue_all(b, 0)), 0x2518_E3E0);
    assert_eq!(
        word(|b| sve_add(b, 4, VReg(0), VReg(1), VReg(2))),
        0x04A2_0020
    );
    assert_eq!(
        word(|b| sve_and(b, VReg(3), VReg(4), VReg(5))),
        0x0425_3083
    );
    assert_eq!(
        word(|b| sve_dup_gen(b, 4, VReg(0), XReg(1))),
        0x05A0_3820
    );
    assert_eq!(word(|b| sve_ld1b(b, VReg(1), 0, XReg(2))), 0xA400_A041);
    assert_eq!(word(|b| sve_st1b(b, VReg(1), 0, XReg(2))), 0xE400_E041);
}

// -- Compile-only backend checks ------------------------------------

fn compile_cfg(features: HostFeatures) -> CompileConfig {
    CompileConfig {
        offsets: frame_offsets(),
        features,
        pause_check: false,
        running_mode_addr: 0,
        exit_linker_stub: 0x7777_0000,
    }
}

fn compile_block_words(block: dbt_ir::IrBlock, features: HostFeatures) -> Vec<u32> {
    let ra = allocate(&block, &DEFAULT_REG_FILE).unwrap();
    let mut backend = Aarch64Backend::new();
    let mut buf = CodeAllocator::new(false).acquire(1 << 20).unwrap();
    let config = compile_cfg(features);
    let req = CompileRequest {
        block: &block,
        ra: &ra,
        config: &config,
    };
    let compiled = backend.compile(&mut buf, &req, None).expect("compile failed");
    assert_eq!(buf.read_u64(compiled.begin + 8), CODE_HEADER_MAGIC);
    buf.as_slice()[compiled.begin..compiled.begin + compiled.size]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

#[test]
fn cas_lowering_uses_exclusive_loop() {
    let mut b = IrBuilder::new(0x4000);
    let addr = b.constant(8, 0x9000);
    let exp = b.constant(8, 7);
    let des = b.constant(8, 9);
    let old = b.cas(8, addr, exp, des);
    b.store_context(8, 8, old);
    let rip = b.constant(8, 0);
    b.exit_block(rip);
    let words = compile_block_words(b.finish(), HostFeatures::empty());

    let has_ldaxr = words.iter().any(|w| w & 0xFFFF_FC00 == 0xC85F_FC00);
    let has_stlxr = words.iter().any(|w| w & 0xFFE0_FC00 == 0xC800_FC00);
    let has_clrex = words.contains(&0xD503_3F5F);
    assert!(has_ldaxr, "no LDAXR in CAS lowering");
    assert!(has_stlxr, "no STLXR in CAS lowering");
    assert!(has_clrex, "no CLREX on the mismatch path");
}

#[test]
fn ordered_access_lowers_to_ldar_stlr() {
    let mut b = IrBuilder::new(0x4000);
    let addr = b.constant(8, 0x9000);
    let v = b.load_mem(8, addr, dbt_ir::MEMFLAG_ORDERED);
    b.store_mem(8, addr, v, dbt_ir::MEMFLAG_ORDERED);
    let rip = b.constant(8, 0);
    b.exit_block(rip);
    let words = compile_block_words(b.finish(), HostFeatures::empty());

    assert!(words.iter().any(|w| w & 0xFFFF_FC00 == 0xC8DF_FC00), "no LDAR");
    assert!(words.iter().any(|w| w & 0xFFFF_FC00 == 0xC89F_FC00), "no STLR");
}

#[test]
fn wide_vectors_need_sve() {
    let make = || {
        let mut b = IrBuilder::new(0x4000);
        let s = b.constant(4, 1);
        let v = b.vdup(32, 4, s);
        let w = b.vbinop(Opcode::VAdd, 32, 4, v, v);
        b.store_context(32, 0x40, w);
        let rip = b.constant(8, 0);
        b.exit_block(rip);
        b.finish()
    };

    // Without SVE256 the 32-byte path must abort compilation.
    let block = make();
    let ra = allocate(&block, &DEFAULT_REG_FILE).unwrap();
    let mut backend = Aarch64Backend::new();
    let mut buf = CodeAllocator::new(false).acquire(1 << 20).unwrap();
    let config = compile_cfg(HostFeatures::empty());
    let req = CompileRequest {
        block: &block,
        ra: &ra,
        config: &config,
    };
    assert!(backend.compile(&mut buf, &req, None).is_err());

    // With SVE256 it lowers through z-register forms.
    let words = compile_block_words(make(), HostFeatures::SVE256);
    let has_sve_add = words.iter().any(|w| w & 0xFF20_FC00 == 0x0420_0000);
    let has_sve_dup = words.iter().any(|w| w & 0xFF3F_FC00 == 0x0520_3800);
    assert!(has_sve_add, "no SVE ADD in 32-byte lowering");
    assert!(has_sve_dup, "no SVE DUP in 32-byte lowering");
}

#[test]
fn sve_destructive_minmax_goes_through_temp() {
    let mut b = IrBuilder::new(0x4000);
    let s = b.constant(4, 1);
    let v1 = b.vdup(32, 4, s);
    let v2 = b.vdup(32, 4, s);
    let m = b.vbinop(Opcode::VSMin, 32, 4, v1, v2);
    b.store_context(32, 0x40, m);
    let rip = b.constant(8, 0);
    b.exit_block(rip);
    let words = compile_block_words(b.finish(), HostFeatures::SVE256);

    // PTRUE for the governing predicate plus the predicated SMIN.
    assert!(words.contains(&0x2518_E3E0), "no PTRUE");
    let has_smin = words.iter().any(|w| w & 0xFF3F_E000 == 0x040A_0000);
    assert!(has_smin, "no predicated SMIN");
    // The move-to-temp idiom shows up as SVE ORR (MOV) with z16.
    let has_zmov = words
        .iter()
        .any(|w| w & 0xFFE0_FC00 == 0x0460_3000 && (w & 0x1F) == 16);
    assert!(has_zmov, "destructive form not staged through a temp");
}

#[test]
fn goto_block_embeds_link_record() {
    let mut b = IrBuilder::new(0x4000);
    b.goto_block(0x5000);
    let words = compile_block_words(b.finish(), HostFeatures::empty());

    // The record's first word is the exit-linker address, second the
    // callee RIP.
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let mut found = false;
    for off in (0..bytes.len().saturating_sub(16)).step_by(8) {
        let a = u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        let c = u64::from_le_bytes(bytes[off + 8..off + 16].try_into().unwrap());
        if a == 0x7777_0000 && c == 0x5000 {
            found = true;
            break;
        }
    }
    assert!(found, "link record [linker, callee_rip] not found");
}
