//! End-to-end dispatcher tests: compile-lookup-execute on the host
//! JIT. Execution requires an x86-64 host; compile-only paths are
//! covered elsewhere.
#![cfg(target_arch = "x86_64")]

use crate::harness::*;
use dbt_exec::frame::{greg, greg_offset, scratch_args_offset, xmm_offset};
use dbt_exec::{RuntimeConfig, StopReason};
use dbt_ir::{CondCode, IrBuilder, Opcode};

/// Scenario S1: `mov eax, 1; ret` with the return address on the
/// guest stack.
#[test]
fn s1_mov_ret_round_trip() {
    const A: u64 = 0x1000;
    let mut fe = MapFrontend::new().with_exit_block();
    let mut b = IrBuilder::new(A);
    b.insn_start(0); // mov eax, 1
    let one = b.constant(8, 1);
    b.store_context(8, greg_offset(greg::RAX), one);
    b.insn_start(5); // ret
    let rsp = b.load_context(8, greg_offset(greg::RSP));
    let ret_addr = b.load_mem(8, rsp, 0);
    let eight = b.constant(8, 8);
    let nsp = b.add(8, rsp, eight);
    b.store_context(8, greg_offset(greg::RSP), nsp);
    b.exit_block(ret_addr);
    fe.insert(b.finish());

    let rt = make_runtime(test_config());
    let mut t = make_thread(&rt, fe);

    let guest_stack: Vec<u64> = vec![EXIT_RIP];
    t.frame.state.gregs[greg::RSP] = guest_stack.as_ptr() as u64;

    let reason = run_from(&mut t, A);
    assert_eq!(reason, StopReason::Exit(EXIT_CODE));
    assert_eq!(t.frame.state.gregs[greg::RAX], 1);
    assert_eq!(
        t.frame.state.gregs[greg::RSP],
        guest_stack.as_ptr() as u64 + 8
    );
    assert_eq!(t.telemetry.blocks_compiled, 2); // A + exit block
}

/// Scenario S2 plus properties 3 and 4: block linking, link
/// stability, and clear-time unlinking.
#[test]
fn s2_block_link_lifecycle() {
    const A: u64 = 0x1000;
    const B: u64 = 0x2000;
    let mut fe = MapFrontend::new().with_exit_block();

    let mut ba = IrBuilder::new(A);
    ba.insn_start(0);
    let m = ba.constant(8, 0xA);
    ba.store_context(8, greg_offset(greg::RBX), m);
    ba.goto_block(B);
    fe.insert(ba.finish());

    let mut bb = IrBuilder::new(B);
    bb.insn_start(0);
    let m = bb.constant(8, 0xB);
    bb.store_context(8, greg_offset(greg::RCX), m);
    let rip = bb.constant(8, EXIT_RIP);
    bb.exit_block(rip);
    fe.insert(bb.finish());

    let rt = make_runtime(test_config());
    let mut t = make_thread(&rt, fe);

    assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));
    assert_eq!(t.frame.state.gregs[greg::RBX], 0xA);
    assert_eq!(t.frame.state.gregs[greg::RCX], 0xB);
    assert_eq!(t.telemetry.links_installed, 1);

    // The call-site target word now holds B's host entry.
    let links = t.cache.links_to(B);
    assert_eq!(links.len(), 1);
    let record_addr = links[0].record_addr;
    let b_entry = t.cache.block_info(B).unwrap().host_entry;
    let target = unsafe { (record_addr as *const u64).read() };
    assert_eq!(target, b_entry);

    // Property 4: a second run takes the patched branch; the linker
    // must not run again for this (site, callee) pair.
    assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));
    assert_eq!(t.telemetry.links_installed, 1);

    // Property 3: clearing restores the slot to the exit linker and
    // drops every record.
    t.clear_cache();
    let restored = unsafe { (record_addr as *const u64).read() };
    assert_eq!(restored, rt.stubs().exit_linker);
    assert_eq!(t.cache.link_count(), 0);

    // The program still runs after the clear (everything recompiles).
    assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));
    assert!(t.telemetry.cache_clears >= 1);
}

/// Property 2: stable host entries until a clear, recompile after.
#[test]
fn find_is_stable_until_clear() {
    const A: u64 = 0x1000;
    let mut fe = MapFrontend::new().with_exit_block();
    let mut b = IrBuilder::new(A);
    let rip = b.constant(8, EXIT_RIP);
    b.exit_block(rip);
    fe.insert(b.finish());

    let rt = make_runtime(test_config());
    let mut t = make_thread(&rt, fe);

    let h1 = t.find_or_compile(A);
    let h2 = t.find_or_compile(A);
    assert_eq!(h1, h2);
    assert_eq!(t.telemetry.blocks_compiled, 1);

    t.clear_cache();
    let _h3 = t.find_or_compile(A);
    assert_eq!(t.telemetry.blocks_compiled, 2);
}

/// Scenario S4: emitting past the buffer's pessimistic limit clears
/// the cache, and previously compiled RIPs recompile afterwards.
#[test]
fn s4_code_buffer_overflow_clears() {
    let mut fe = MapFrontend::new().with_exit_block();
    let base = 0x10_0000u64;
    let count = 64u64;
    for i in 0..count {
        let mut b = IrBuilder::new(base + i * 0x100);
        b.insn_start(0);
        // Enough nodes that the pessimistic estimate is nontrivial.
        let mut acc = b.constant(8, i);
        for k in 0..20 {
            let c = b.constant(8, k);
            acc = b.add(8, acc, c);
        }
        b.store_context(8, greg_offset(greg::RAX), acc);
        let rip = b.constant(8, EXIT_RIP);
        b.exit_block(rip);
        fe.insert(b.finish());
    }

    let config = RuntimeConfig {
        initial_code_size: 64 * 1024,
        max_code_size: 64 * 1024,
        ..test_config()
    };
    let rt = make_runtime(config);
    let mut t = make_thread(&rt, fe);

    let first = base;
    let h_first = t.find_or_compile(first);
    for i in 1..count {
        t.find_or_compile(base + i * 0x100);
    }
    assert!(t.telemetry.cache_clears >= 1, "no clear after overflow");

    // The early block was evicted; resolving it again recompiles.
    let before = t.telemetry.blocks_compiled;
    let h_again = t.find_or_compile(first);
    assert_eq!(t.telemetry.blocks_compiled, before + 1);
    let _ = (h_first, h_again);
}

/// Property 1 (sample): the JIT advances guest state exactly like the
/// reference interpreter for an ALU-heavy block.
#[test]
fn jit_matches_interpreter_on_alu_block() {
    const A: u64 = 0x3000;
    let build = || {
        let mut b = IrBuilder::new(A);
        b.insn_start(0);
        // Stores are interleaved so values die quickly; the naive
        // linear-scan oracle has ten registers to work with.
        let x = b.load_context(8, greg_offset(greg::RDI));
        let y = b.load_context(8, greg_offset(greg::RSI));
        let sum = b.add(8, x, y);
        let dif = b.sub(4, x, y);
        b.store_context(8, scratch_args_offset(1), dif);
        let prod = b.mul(8, x, y);
        let sh = {
            let c = b.constant(8, 5);
            b.shl(8, x, c)
        };
        b.store_context(8, scratch_args_offset(3), sh);
        let sr = b.ashr(4, y, x);
        b.store_context(8, scratch_args_offset(4), sr);
        let rot = {
            let c = b.constant(8, 9);
            b.ror(2, x, c)
        };
        b.store_context(8, scratch_args_offset(5), rot);
        let bits = b.popcount(8, y);
        b.store_context(8, scratch_args_offset(6), bits);
        let lead = b.clz(8, y);
        b.store_context(8, scratch_args_offset(7), lead);
        let sel = b.select(8, CondCode::Sgt, x, y, sum, prod);
        b.store_context(8, greg_offset(greg::RAX), sel);
        let q = b.udiv(8, y, x);
        b.store_context(8, scratch_args_offset(0), sum);
        b.store_context(8, scratch_args_offset(2), prod);
        b.store_context(8, greg_offset(greg::RBX), q);
        let rip = b.constant(8, EXIT_RIP);
        b.exit_block(rip);
        b.finish()
    };

    let inputs = [(3u64, 1000u64), (0xFFFF_FFFF_FFFF_FFF0, 7)];
    for (rdi, rsi) in inputs {
        // Interpreter reference.
        let mut ref_frame = dbt_exec::CpuStateFrame::default();
        ref_frame.state.gregs[greg::RDI] = rdi;
        ref_frame.state.gregs[greg::RSI] = rsi;
        let block = build();
        unsafe {
            dbt_ir::interp::run(
                &block,
                &mut ref_frame as *mut _ as *mut u8,
                &mut dbt_ir::interp::NullServices,
            );
        }

        // JIT under the dispatcher.
        let mut fe = MapFrontend::new().with_exit_block();
        fe.insert(build());
        let rt = make_runtime(test_config());
        let mut t = make_thread(&rt, fe);
        t.frame.state.gregs[greg::RDI] = rdi;
        t.frame.state.gregs[greg::RSI] = rsi;
        assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));

        assert_eq!(t.frame.scratch_args, ref_frame.scratch_args);
        assert_eq!(
            t.frame.state.gregs[greg::RAX],
            ref_frame.state.gregs[greg::RAX]
        );
        assert_eq!(
            t.frame.state.gregs[greg::RBX],
            ref_frame.state.gregs[greg::RBX]
        );
    }
}

/// Scenario S5 on the JIT: LOCK CMPXCHG semantics.
#[test]
fn s5_cas_on_jit() {
    const A: u64 = 0x4000;
    for (initial, expect_mem, expect_res) in [(7u64, 9u64, 7u64), (5, 5, 5)] {
        let cell = Box::new(initial);
        let addr = &*cell as *const u64 as u64;

        let mut fe = MapFrontend::new().with_exit_block();
        let mut b = IrBuilder::new(A);
        b.insn_start(0);
        let pa = b.constant(8, addr);
        let exp = b.constant(8, 7);
        let des = b.constant(8, 9);
        let old = b.cas(8, pa, exp, des);
        b.store_context(8, greg_offset(greg::RAX), old);
        let rip = b.constant(8, EXIT_RIP);
        b.exit_block(rip);
        fe.insert(b.finish());

        let rt = make_runtime(test_config());
        let mut t = make_thread(&rt, fe);
        assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));
        assert_eq!(*cell, expect_mem);
        assert_eq!(t.frame.state.gregs[greg::RAX], expect_res);
    }
}

/// Scenario S6 on the JIT: 4-byte-lane vector add.
#[test]
fn s6_vadd_on_jit() {
    const A: u64 = 0x4100;
    let lanes_a: [u32; 4] = [1, 2, 3, 4];
    let lanes_b: [u32; 4] = [10, 20, 30, 40];

    let mut fe = MapFrontend::new().with_exit_block();
    let mut b = IrBuilder::new(A);
    b.insn_start(0);
    let pa = b.constant(8, lanes_a.as_ptr() as u64);
    let pb = b.constant(8, lanes_b.as_ptr() as u64);
    let va = b.load_mem(16, pa, 0);
    let vb = b.load_mem(16, pb, 0);
    let sum = b.vbinop(Opcode::VAdd, 16, 4, va, vb);
    b.store_context(16, xmm_offset(0), sum);
    let rip = b.constant(8, EXIT_RIP);
    b.exit_block(rip);
    fe.insert(b.finish());

    let rt = make_runtime(test_config());
    let mut t = make_thread(&rt, fe);
    assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));

    let lane0 = t.frame.state.xmm[0][0];
    let lane1 = t.frame.state.xmm[0][1];
    assert_eq!(lane0 as u32, 11);
    assert_eq!((lane0 >> 32) as u32, 22);
    assert_eq!(lane1 as u32, 33);
    assert_eq!((lane1 >> 32) as u32, 44);
}

/// Vector compares, min/max, dup, shifts and extract on the JIT.
#[test]
fn vector_family_on_jit() {
    const A: u64 = 0x4200;
    let mut fe = MapFrontend::new().with_exit_block();
    let mut b = IrBuilder::new(A);
    b.insn_start(0);
    let five = b.constant(4, 5);
    let neg5 = b.constant(4, 0xFFFF_FFFB);
    let v1 = b.vdup(16, 4, five);
    let v2 = b.vdup(16, 4, neg5);
    let gt = b.vbinop(Opcode::VCmpGt, 16, 4, v1, v2);
    let smin = b.vbinop(Opcode::VSMin, 16, 4, v1, v2);
    let umax = b.vbinop(Opcode::VUMax, 16, 4, v1, v2);
    let shifted = b.vshift_imm(Opcode::VShlI, 16, 4, v1, 3);
    let g = b.vextract(4, gt, 2);
    let sm = b.vextract(4, smin, 0);
    let um = b.vextract(4, umax, 1);
    let sh = b.vextract(4, shifted, 3);
    b.store_context(8, scratch_args_offset(0), g);
    b.store_context(8, scratch_args_offset(1), sm);
    b.store_context(8, scratch_args_offset(2), um);
    b.store_context(8, scratch_args_offset(3), sh);
    let rip = b.constant(8, EXIT_RIP);
    b.exit_block(rip);
    fe.insert(b.finish());

    let rt = make_runtime(test_config());
    let mut t = make_thread(&rt, fe);
    assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));
    assert_eq!(t.frame.scratch_args[0], 0xFFFF_FFFF);
    assert_eq!(t.frame.scratch_args[1], 0xFFFF_FFFB);
    assert_eq!(t.frame.scratch_args[2], 0xFFFF_FFFB);
    assert_eq!(t.frame.scratch_args[3], 40);
}

/// Branch lowering through region labels and fall-through elision.
#[test]
fn cond_jump_takes_both_arms() {
    const A: u64 = 0x4300;
    for (input, expected) in [(5u64, 111u64), (50, 222)] {
        let mut fe = MapFrontend::new().with_exit_block();
        let mut b = IrBuilder::new(A);
        b.insn_start(0);
        let x = b.load_context(8, greg_offset(greg::RDI));
        let ten = b.constant(8, 10);
        b.cond_jump(CondCode::Ult, 8, x, ten, 1, 2);
        b.region();
        let v1 = b.constant(8, 111);
        b.store_context(8, greg_offset(greg::RAX), v1);
        b.jump(3);
        b.region();
        let v2 = b.constant(8, 222);
        b.store_context(8, greg_offset(greg::RAX), v2);
        b.jump(3);
        b.region();
        let rip = b.constant(8, EXIT_RIP);
        b.exit_block(rip);
        fe.insert(b.finish());

        let rt = make_runtime(test_config());
        let mut t = make_thread(&rt, fe);
        t.frame.state.gregs[greg::RDI] = input;
        assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));
        assert_eq!(t.frame.state.gregs[greg::RAX], expected);
    }
}

/// Syscall, CPUID, XCR and pair extraction through the frame's
/// service pointers.
#[test]
fn runtime_services_via_frame_pointers() {
    const A: u64 = 0x4400;
    let mut fe = MapFrontend::new().with_exit_block();
    let mut b = IrBuilder::new(A);
    b.insn_start(0);
    let nr = b.constant(8, 1);
    let ret = b.syscall(nr);
    b.store_context(8, greg_offset(greg::RDX), ret);
    let leaf = b.constant(4, 7);
    let sub = b.constant(4, 2);
    let p = b.cpuid(leaf, sub);
    let lo = b.pair_extract(p, 0);
    let hi = b.pair_extract(p, 1);
    b.store_context(8, greg_offset(greg::RAX), lo);
    b.store_context(8, greg_offset(greg::RBX), hi);
    let xi = b.constant(4, 3);
    let x = b.xcr(xi);
    b.store_context(8, greg_offset(greg::RCX), x);
    let rip = b.constant(8, EXIT_RIP);
    b.exit_block(rip);
    fe.insert(b.finish());

    let rt = make_runtime(test_config());
    let mut t = make_thread(&rt, fe);
    assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));
    assert_eq!(t.frame.state.gregs[greg::RDX], 1234);
    // TestCpuId: eax = leaf ^ 0xA5A50000, ebx = subleaf + 1.
    assert_eq!(
        t.frame.state.gregs[greg::RAX],
        (7u64 ^ 0xA5A5_0000) | (3u64 << 32)
    );
    assert_eq!(
        t.frame.state.gregs[greg::RBX],
        0x0000_1234u64 | (0x0000_5678u64 << 32)
    );
    assert_eq!(t.frame.state.gregs[greg::RCX], 0xE000_0000_0003);
}

/// Fallback shim: ops with no backend lowering route through the
/// tabulated helper table.
#[test]
fn fallback_shim_calls_tabulated_helpers() {
    const A: u64 = 0x4500;
    let mut fe = MapFrontend::new().with_exit_block();
    let mut b = IrBuilder::new(A);
    b.insn_start(0);
    let v = b.load_context(16, xmm_offset(0));
    let s = b.f64_unary(Opcode::F64Sin, v);
    let p = b.f64_binary(Opcode::F64Pow, v, v);
    b.store_context(16, xmm_offset(1), s);
    b.store_context(16, xmm_offset(2), p);
    let mode = b.constant(2, 0x1F80);
    b.set_rounding_mode(mode);
    let rip = b.constant(8, EXIT_RIP);
    b.exit_block(rip);
    fe.insert(b.finish());

    let rt = make_runtime(test_config());
    let mut t = make_thread(&rt, fe);
    t.frame.state.xmm[0][0] = 2.0f64.to_bits();
    assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));
    assert_eq!(f64::from_bits(t.frame.state.xmm[1][0]), 2.0f64.sin());
    assert_eq!(f64::from_bits(t.frame.state.xmm[2][0]), 4.0f64);
}

/// Cooperative pause: the running-mode word diverts the block
/// prologue before any guest work happens.
#[test]
fn pause_check_diverts_before_block_body() {
    const A: u64 = 0x4600;
    let mut fe = MapFrontend::new().with_exit_block();
    let mut b = IrBuilder::new(A);
    b.insn_start(0);
    let v = b.constant(8, 0xBAD);
    b.store_context(8, greg_offset(greg::RAX), v);
    let rip = b.constant(8, EXIT_RIP);
    b.exit_block(rip);
    fe.insert(b.finish());

    let config = RuntimeConfig {
        pause_check: true,
        ..test_config()
    };
    let rt = make_runtime(config);
    let mut t = make_thread(&rt, fe);
    rt.set_running_mode(1);

    assert_eq!(run_from(&mut t, A), StopReason::Paused);
    assert_eq!(t.frame.state.gregs[greg::RAX], 0, "block body must not run");
    assert_eq!(t.frame.state.rip, A, "RIP must be synchronized");

    // Dropping the pause bit lets the same blocks run normally.
    rt.set_running_mode(0);
    assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));
    assert_eq!(t.frame.state.gregs[greg::RAX], 0xBAD);
}

/// Interpreter trampoline: blocks kept in IR form behave like their
/// lowered counterparts.
#[test]
fn interpreter_trampoline_runs_ir_blocks() {
    const A: u64 = 0x4700;
    let mut fe = MapFrontend::new().with_exit_block();
    let mut b = IrBuilder::new(A);
    b.insn_start(0);
    let x = b.load_context(8, greg_offset(greg::RDI));
    let y = b.constant(8, 100);
    let s = b.add(8, x, y);
    b.store_context(8, greg_offset(greg::RAX), s);
    let rip = b.constant(8, EXIT_RIP);
    b.exit_block(rip);
    fe.insert(b.finish());

    let config = RuntimeConfig {
        force_interpreter: true,
        ..test_config()
    };
    let rt = make_runtime(config);
    let mut t = make_thread(&rt, fe);
    t.frame.state.gregs[greg::RDI] = 23;
    assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));
    assert_eq!(t.frame.state.gregs[greg::RAX], 123);
    // Trampolines are cached like compiled blocks.
    assert_eq!(t.telemetry.blocks_compiled, 2);
}

/// Atomic fetch ops through the JIT's LOCK-prefixed lowering.
#[test]
fn atomic_rmw_on_jit() {
    const A: u64 = 0x4800;
    let cell = Box::new(0x0Fu64);
    let addr = &*cell as *const u64 as u64;

    let mut fe = MapFrontend::new().with_exit_block();
    let mut b = IrBuilder::new(A);
    b.insn_start(0);
    let pa = b.constant(8, addr);
    let v3 = b.constant(8, 3);
    let old1 = b.atomic_rmw(Opcode::AtomicFetchAdd, 8, pa, v3);
    let old2 = b.atomic_rmw(Opcode::AtomicFetchAnd, 8, pa, v3);
    let old3 = b.atomic_rmw(Opcode::AtomicFetchXor, 8, pa, v3);
    let old4 = b.atomic_rmw(Opcode::AtomicSwap, 8, pa, v3);
    b.store_context(8, scratch_args_offset(0), old1);
    b.store_context(8, scratch_args_offset(1), old2);
    b.store_context(8, scratch_args_offset(2), old3);
    b.store_context(8, scratch_args_offset(3), old4);
    let rip = b.constant(8, EXIT_RIP);
    b.exit_block(rip);
    fe.insert(b.finish());

    let rt = make_runtime(test_config());
    let mut t = make_thread(&rt, fe);
    assert_eq!(run_from(&mut t, A), StopReason::Exit(EXIT_CODE));
    // 0x0F +3 = 0x12; &3 = 0x02; ^3 = 0x01; swap -> 3.
    assert_eq!(t.frame.scratch_args[0], 0x0F);
    assert_eq!(t.frame.scratch_args[1], 0x12);
    assert_eq!(t.frame.scratch_args[2], 0x02);
    assert_eq!(t.frame.scratch_args[3], 0x01);
    assert_eq!(*cell, 3);
}
