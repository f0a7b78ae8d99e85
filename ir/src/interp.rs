//! Reference interpreter.
//!
//! Executes an `IrBlock` directly against a CPU context (raw base
//! pointer, same layout the JIT hard-codes) and flat guest memory
//! (guest addresses are host addresses in this user-space design). It
//! defines the semantics the backends must match, backs the
//! interpreter trampoline, and provides the bodies of the tabulated
//! fallback helpers.

use crate::block::IrBlock;
use crate::node::{IrNode, NodeId};
use crate::opcode::Opcode;
use crate::types::{CondCode, FaultKind};
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Runtime services the interpreter needs from its host. The JIT
/// reaches these through function pointers in the frame; the
/// interpreter takes a trait object.
pub trait InterpServices {
    fn syscall(&mut self, ctx: *mut u8, nr: u64) -> i64;
    fn cpuid(&mut self, leaf: u32, subleaf: u32) -> (u64, u64);
    fn xcr(&mut self, index: u32) -> u64;
    fn set_rounding_mode(&mut self, _mode: u16) {}
}

/// Services stub for pure-compute blocks.
pub struct NullServices;

impl InterpServices for NullServices {
    fn syscall(&mut self, _ctx: *mut u8, _nr: u64) -> i64 {
        -38 // -ENOSYS
    }

    fn cpuid(&mut self, _leaf: u32, _subleaf: u32) -> (u64, u64) {
        (0, 0)
    }

    fn xcr(&mut self, _index: u32) -> u64 {
        0
    }
}

/// How the block left the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpExit {
    /// Continue at this guest RIP via the dispatcher.
    Next(u64),
    /// Continue at this guest RIP; the JIT form of this exit is a
    /// linkable direct branch.
    DirectLink(u64),
    /// Synchronous guest fault at this RIP.
    Fault { kind: FaultKind, rip: u64 },
}

/// 256-bit value slot; scalars live in lane 0.
type Value = [u64; 4];

/// Execute `block` against the context at `ctx`.
///
/// # Safety
/// `ctx` must point at a live CPU context of the layout the block's
/// context offsets assume, and every guest address the block touches
/// must be mapped host memory.
pub unsafe fn run(
    block: &IrBlock,
    ctx: *mut u8,
    services: &mut dyn InterpServices,
) -> InterpExit {
    let mut values: Vec<Value> = vec![[0; 4]; block.num_nodes()];
    let mut region = 0u32;

    loop {
        let mut next_region: Option<u32> = None;
        for id in block.region_nodes(region) {
            let node = block.node(id);
            match step(block, node, id, &mut values, ctx, services) {
                StepResult::Continue => {}
                StepResult::Branch(target) => {
                    next_region = Some(target);
                    break;
                }
                StepResult::Exit(exit) => return exit,
            }
        }
        region = next_region.expect("region fell through without terminator");
    }
}

enum StepResult {
    Continue,
    Branch(u32),
    Exit(InterpExit),
}

fn trunc(val: u64, size: u8) -> u64 {
    match size {
        1 => val as u8 as u64,
        2 => val as u16 as u64,
        4 => val as u32 as u64,
        _ => val,
    }
}

fn sext_to_64(val: u64, size: u8) -> u64 {
    match size {
        1 => val as u8 as i8 as i64 as u64,
        2 => val as u16 as i16 as i64 as u64,
        4 => val as u32 as i32 as i64 as u64,
        _ => val,
    }
}

unsafe fn step(
    block: &IrBlock,
    node: &IrNode,
    id: NodeId,
    values: &mut [Value],
    ctx: *mut u8,
    services: &mut dyn InterpServices,
) -> StepResult {
    let scalar = |values: &[Value], arg: NodeId| -> u64 { values[arg.0 as usize][0] };
    let size = node.size;
    let bits = (size as u32) * 8;

    let result: Option<Value> = match node.op {
        Opcode::Nop | Opcode::InsnStart => None,
        Opcode::InlineConstant | Opcode::Constant => Some([trunc(node.imm, size), 0, 0, 0]),
        Opcode::Mov => Some(values[node.arg(0).0 as usize]),
        Opcode::LoadContext => {
            let p = ctx.add(node.imm as usize);
            let mut v: Value = [0; 4];
            match size {
                1 => v[0] = p.read() as u64,
                2 => v[0] = (p as *const u16).read_unaligned() as u64,
                4 => v[0] = (p as *const u32).read_unaligned() as u64,
                8 => v[0] = (p as *const u64).read_unaligned(),
                16 | 32 => {
                    for (i, lane) in v.iter_mut().enumerate().take(size as usize / 8) {
                        *lane = (p as *const u64).add(i).read_unaligned();
                    }
                }
                _ => unreachable!("load_ctx size {size}"),
            }
            Some(v)
        }
        Opcode::StoreContext => {
            let v = values[node.arg(0).0 as usize];
            let p = ctx.add(node.imm as usize);
            match size {
                1 => p.write(v[0] as u8),
                2 => (p as *mut u16).write_unaligned(v[0] as u16),
                4 => (p as *mut u32).write_unaligned(v[0] as u32),
                8 => (p as *mut u64).write_unaligned(v[0]),
                16 | 32 => {
                    for (i, lane) in v.iter().enumerate().take(size as usize / 8) {
                        (p as *mut u64).add(i).write_unaligned(*lane);
                    }
                }
                _ => unreachable!("store_ctx size {size}"),
            }
            None
        }

        // -- ALU --
        Opcode::Add => Some(scalar_binop(values, node, |a, b| a.wrapping_add(b), size)),
        Opcode::Sub => Some(scalar_binop(values, node, |a, b| a.wrapping_sub(b), size)),
        Opcode::Mul => Some(scalar_binop(values, node, |a, b| a.wrapping_mul(b), size)),
        Opcode::Div => {
            let a = sext_to_64(trunc(scalar(values, node.arg(0)), size), size) as i64;
            let b = sext_to_64(trunc(scalar(values, node.arg(1)), size), size) as i64;
            assert!(b != 0, "division by zero must be guarded by the frontend");
            Some([trunc(a.wrapping_div(b) as u64, size), 0, 0, 0])
        }
        Opcode::UDiv => {
            let a = trunc(scalar(values, node.arg(0)), size);
            let b = trunc(scalar(values, node.arg(1)), size);
            assert!(b != 0, "division by zero must be guarded by the frontend");
            Some([trunc(a / b, size), 0, 0, 0])
        }
        Opcode::Rem => {
            let a = sext_to_64(trunc(scalar(values, node.arg(0)), size), size) as i64;
            let b = sext_to_64(trunc(scalar(values, node.arg(1)), size), size) as i64;
            assert!(b != 0, "division by zero must be guarded by the frontend");
            Some([trunc(a.wrapping_rem(b) as u64, size), 0, 0, 0])
        }
        Opcode::URem => {
            let a = trunc(scalar(values, node.arg(0)), size);
            let b = trunc(scalar(values, node.arg(1)), size);
            assert!(b != 0, "division by zero must be guarded by the frontend");
            Some([trunc(a % b, size), 0, 0, 0])
        }
        Opcode::And => Some(scalar_binop(values, node, |a, b| a & b, size)),
        Opcode::Or => Some(scalar_binop(values, node, |a, b| a | b, size)),
        Opcode::Xor => Some(scalar_binop(values, node, |a, b| a ^ b, size)),
        Opcode::Not => {
            let a = scalar(values, node.arg(0));
            Some([trunc(!a, size), 0, 0, 0])
        }
        Opcode::Neg => {
            let a = scalar(values, node.arg(0));
            Some([trunc(a.wrapping_neg(), size), 0, 0, 0])
        }
        Opcode::Shl => {
            let a = trunc(scalar(values, node.arg(0)), size);
            let c = scalar(values, node.arg(1)) as u32 % bits;
            Some([trunc(a << c, size), 0, 0, 0])
        }
        Opcode::Shr => {
            let a = trunc(scalar(values, node.arg(0)), size);
            let c = scalar(values, node.arg(1)) as u32 % bits;
            Some([trunc(a >> c, size), 0, 0, 0])
        }
        Opcode::Ashr => {
            let a = sext_to_64(trunc(scalar(values, node.arg(0)), size), size) as i64;
            let c = scalar(values, node.arg(1)) as u32 % bits;
            Some([trunc((a >> c) as u64, size), 0, 0, 0])
        }
        Opcode::Ror => {
            let a = trunc(scalar(values, node.arg(0)), size);
            let c = scalar(values, node.arg(1)) as u32 % bits;
            let r = if c == 0 {
                a
            } else {
                trunc((a >> c) | (a << (bits - c)), size)
            };
            Some([r, 0, 0, 0])
        }
        Opcode::Sbfe | Opcode::Ubfe => {
            let a = scalar(values, node.arg(0));
            let lsb = (node.misc & 0xff) as u32;
            let width = ((node.misc >> 8) & 0xff) as u32;
            let field = if width >= 64 {
                a >> lsb
            } else {
                (a >> lsb) & ((1u64 << width) - 1)
            };
            let v = if node.op == Opcode::Sbfe {
                let shift = 64 - width;
                trunc((((field << shift) as i64) >> shift) as u64, size)
            } else {
                field
            };
            Some([v, 0, 0, 0])
        }
        Opcode::Bfi => {
            let base = scalar(values, node.arg(0));
            let field = scalar(values, node.arg(1));
            let lsb = (node.misc & 0xff) as u32;
            let width = ((node.misc >> 8) & 0xff) as u32;
            let mask = if width >= 64 {
                u64::MAX
            } else {
                (1u64 << width) - 1
            };
            let v = (base & !(mask << lsb)) | ((field & mask) << lsb);
            Some([trunc(v, size), 0, 0, 0])
        }
        Opcode::Popcount => {
            let a = trunc(scalar(values, node.arg(0)), size);
            Some([a.count_ones() as u64, 0, 0, 0])
        }
        Opcode::Clz => {
            let a = trunc(scalar(values, node.arg(0)), size);
            let lz = a.leading_zeros().saturating_sub(64 - bits);
            Some([lz as u64, 0, 0, 0])
        }
        Opcode::Ctz => {
            let a = trunc(scalar(values, node.arg(0)), size);
            let tz = a.trailing_zeros().min(bits);
            Some([tz as u64, 0, 0, 0])
        }
        Opcode::Rev => {
            let a = trunc(scalar(values, node.arg(0)), size);
            let v = match size {
                2 => (a as u16).swap_bytes() as u64,
                4 => (a as u32).swap_bytes() as u64,
                8 => a.swap_bytes(),
                _ => unreachable!("rev size {size}"),
            };
            Some([v, 0, 0, 0])
        }
        Opcode::Select => {
            let cond = CondCode::from_u32(node.misc);
            let a = trunc(scalar(values, node.arg(0)), size);
            let b = trunc(scalar(values, node.arg(1)), size);
            let v = if cond.eval(a, b, size) {
                scalar(values, node.arg(2))
            } else {
                scalar(values, node.arg(3))
            };
            Some([trunc(v, size), 0, 0, 0])
        }

        // -- Memory --
        Opcode::LoadMem => {
            let addr = scalar(values, node.arg(0)) as usize as *const u8;
            let mut v: Value = [0; 4];
            match size {
                1 => v[0] = addr.read() as u64,
                2 => v[0] = (addr as *const u16).read_unaligned() as u64,
                4 => v[0] = (addr as *const u32).read_unaligned() as u64,
                8 => v[0] = (addr as *const u64).read_unaligned(),
                16 | 32 => {
                    for (i, lane) in v.iter_mut().enumerate().take(size as usize / 8) {
                        *lane = (addr as *const u64).add(i).read_unaligned();
                    }
                }
                _ => unreachable!("load_mem size {size}"),
            }
            Some(v)
        }
        Opcode::StoreMem => {
            let addr = scalar(values, node.arg(0)) as usize as *mut u8;
            let v = values[node.arg(1).0 as usize];
            match size {
                1 => addr.write(v[0] as u8),
                2 => (addr as *mut u16).write_unaligned(v[0] as u16),
                4 => (addr as *mut u32).write_unaligned(v[0] as u32),
                8 => (addr as *mut u64).write_unaligned(v[0]),
                16 | 32 => {
                    for (i, lane) in v.iter().enumerate().take(size as usize / 8) {
                        (addr as *mut u64).add(i).write_unaligned(*lane);
                    }
                }
                _ => unreachable!("store_mem size {size}"),
            }
            None
        }

        // -- Atomics --
        Opcode::Cas => {
            let addr = scalar(values, node.arg(0)) as usize;
            let expected = scalar(values, node.arg(1));
            let desired = scalar(values, node.arg(2));
            let old = atomic_cas(addr, expected, desired, node.elem_size);
            Some([old, 0, 0, 0])
        }
        Opcode::AtomicSwap
        | Opcode::AtomicFetchAdd
        | Opcode::AtomicFetchSub
        | Opcode::AtomicFetchAnd
        | Opcode::AtomicFetchOr
        | Opcode::AtomicFetchXor => {
            let addr = scalar(values, node.arg(0)) as usize;
            let val = scalar(values, node.arg(1));
            let old = atomic_rmw(node.op, addr, val, node.elem_size);
            Some([old, 0, 0, 0])
        }

        // -- Vector --
        Opcode::VAdd => Some(lane_binop(values, node, |a, b, eb| {
            trunc(a.wrapping_add(b), eb)
        })),
        Opcode::VSub => Some(lane_binop(values, node, |a, b, eb| {
            trunc(a.wrapping_sub(b), eb)
        })),
        Opcode::VAnd => Some(lane_binop(values, node, |a, b, _| a & b)),
        Opcode::VOr => Some(lane_binop(values, node, |a, b, _| a | b)),
        Opcode::VXor => Some(lane_binop(values, node, |a, b, _| a ^ b)),
        Opcode::VNeg => {
            let a = values[node.arg(0).0 as usize];
            Some(lane_map(a, node, |x, eb| trunc(x.wrapping_neg(), eb)))
        }
        Opcode::VSMin => Some(lane_binop(values, node, |a, b, eb| {
            let (sa, sb) = (sext_to_64(a, eb) as i64, sext_to_64(b, eb) as i64);
            trunc(sa.min(sb) as u64, eb)
        })),
        Opcode::VSMax => Some(lane_binop(values, node, |a, b, eb| {
            let (sa, sb) = (sext_to_64(a, eb) as i64, sext_to_64(b, eb) as i64);
            trunc(sa.max(sb) as u64, eb)
        })),
        Opcode::VUMin => Some(lane_binop(values, node, |a, b, _| a.min(b))),
        Opcode::VUMax => Some(lane_binop(values, node, |a, b, _| a.max(b))),
        Opcode::VCmpEq => Some(lane_binop(values, node, |a, b, eb| {
            if a == b {
                trunc(u64::MAX, eb)
            } else {
                0
            }
        })),
        Opcode::VCmpGt => Some(lane_binop(values, node, |a, b, eb| {
            if (sext_to_64(a, eb) as i64) > (sext_to_64(b, eb) as i64) {
                trunc(u64::MAX, eb)
            } else {
                0
            }
        })),
        Opcode::VDup => {
            let s = trunc(scalar(values, node.arg(0)), node.elem_size);
            let mut v: Value = [0; 4];
            write_lanes(&mut v, node, |_| s);
            Some(v)
        }
        Opcode::VShlI => {
            let a = values[node.arg(0).0 as usize];
            let sh = node.misc;
            Some(lane_map(a, node, |x, eb| trunc(x << sh, eb)))
        }
        Opcode::VUShrI => {
            let a = values[node.arg(0).0 as usize];
            let sh = node.misc;
            Some(lane_map(a, node, |x, eb| trunc(x, eb) >> sh))
        }
        Opcode::VSShrI => {
            let a = values[node.arg(0).0 as usize];
            let sh = node.misc;
            Some(lane_map(a, node, |x, eb| {
                trunc(((sext_to_64(trunc(x, eb), eb) as i64) >> sh) as u64, eb)
            }))
        }
        Opcode::VExtract => {
            let a = values[node.arg(0).0 as usize];
            let lane = node.misc as usize;
            Some([read_lane(&a, node.elem_size, lane), 0, 0, 0])
        }

        // -- Control flow --
        Opcode::Jump => return StepResult::Branch(node.imm as u32),
        Opcode::CondJump => {
            let cond = CondCode::from_u32(node.misc);
            let a = trunc(scalar(values, node.arg(0)), size);
            let b = trunc(scalar(values, node.arg(1)), size);
            let target = if cond.eval(a, b, size) {
                node.imm as u32
            } else {
                (node.imm >> 32) as u32
            };
            return StepResult::Branch(target);
        }
        Opcode::GotoBlock => {
            return StepResult::Exit(InterpExit::DirectLink(node.imm));
        }
        Opcode::IndirectBranch | Opcode::ExitBlock => {
            let rip = scalar(values, node.arg(0));
            return StepResult::Exit(InterpExit::Next(rip));
        }
        Opcode::Break => {
            return StepResult::Exit(InterpExit::Fault {
                kind: FaultKind::from_u32(node.misc),
                rip: block.entry_rip.wrapping_add(node.imm),
            });
        }

        // -- Runtime services --
        Opcode::Syscall => {
            let nr = scalar(values, node.arg(0));
            let ret = services.syscall(ctx, nr);
            Some([ret as u64, 0, 0, 0])
        }
        Opcode::CpuId => {
            let leaf = scalar(values, node.arg(0)) as u32;
            let subleaf = scalar(values, node.arg(1)) as u32;
            let (lo, hi) = services.cpuid(leaf, subleaf);
            Some([lo, hi, 0, 0])
        }
        Opcode::Xcr => {
            let index = scalar(values, node.arg(0)) as u32;
            Some([services.xcr(index), 0, 0, 0])
        }
        Opcode::PairExtract => {
            let v = values[node.arg(0).0 as usize];
            Some([v[node.misc as usize & 1], 0, 0, 0])
        }

        // -- Tabulated helpers --
        Opcode::F64Sin => Some(f64_unary(values, node, f64::sin)),
        Opcode::F64Cos => Some(f64_unary(values, node, f64::cos)),
        Opcode::F64Tan => Some(f64_unary(values, node, f64::tan)),
        Opcode::F64Log2 => Some(f64_unary(values, node, f64::log2)),
        Opcode::F64Exp2 => Some(f64_unary(values, node, f64::exp2)),
        Opcode::F64Pow => Some(f64_binary(values, node, f64::powf)),
        Opcode::F64Atan2 => Some(f64_binary(values, node, f64::atan2)),
        Opcode::F64Mod => Some(f64_binary(values, node, |a, b| a % b)),
        Opcode::SetRoundingMode => {
            let mode = scalar(values, node.arg(0)) as u16;
            services.set_rounding_mode(mode);
            None
        }

        Opcode::Count => unreachable!(),
    };

    if let Some(v) = result {
        values[id.0 as usize] = v;
    }
    StepResult::Continue
}

fn scalar_binop(
    values: &[Value],
    node: &IrNode,
    f: impl Fn(u64, u64) -> u64,
    size: u8,
) -> Value {
    let a = trunc(values[node.arg(0).0 as usize][0], size);
    let b = trunc(values[node.arg(1).0 as usize][0], size);
    [trunc(f(a, b), size), 0, 0, 0]
}

fn read_lane(v: &Value, elem: u8, lane: usize) -> u64 {
    let per_word = 8 / elem as usize;
    let word = v[lane / per_word];
    let shift = (lane % per_word) * elem as usize * 8;
    trunc(word >> shift, elem)
}

fn write_lane(v: &mut Value, elem: u8, lane: usize, val: u64) {
    let per_word = 8 / elem as usize;
    let shift = (lane % per_word) * elem as usize * 8;
    let mask = if elem == 8 {
        u64::MAX
    } else {
        ((1u64 << (elem as u32 * 8)) - 1) << shift
    };
    let w = &mut v[lane / per_word];
    *w = (*w & !mask) | ((trunc(val, elem)) << shift);
}

fn lane_binop(values: &[Value], node: &IrNode, f: impl Fn(u64, u64, u8) -> u64) -> Value {
    let a = values[node.arg(0).0 as usize];
    let b = values[node.arg(1).0 as usize];
    let elem = node.elem_size;
    let mut out: Value = [0; 4];
    for lane in 0..node.lanes() {
        let r = f(read_lane(&a, elem, lane), read_lane(&b, elem, lane), elem);
        write_lane(&mut out, elem, lane, r);
    }
    out
}

fn lane_map(a: Value, node: &IrNode, f: impl Fn(u64, u8) -> u64) -> Value {
    let elem = node.elem_size;
    let mut out: Value = [0; 4];
    for lane in 0..node.lanes() {
        write_lane(&mut out, elem, lane, f(read_lane(&a, elem, lane), elem));
    }
    out
}

fn write_lanes(v: &mut Value, node: &IrNode, f: impl Fn(usize) -> u64) {
    for lane in 0..node.lanes() {
        write_lane(v, node.elem_size, lane, f(lane));
    }
}

fn f64_unary(values: &[Value], node: &IrNode, f: impl Fn(f64) -> f64) -> Value {
    let a = f64::from_bits(values[node.arg(0).0 as usize][0]);
    [f(a).to_bits(), 0, 0, 0]
}

fn f64_binary(values: &[Value], node: &IrNode, f: impl Fn(f64, f64) -> f64) -> Value {
    let a = f64::from_bits(values[node.arg(0).0 as usize][0]);
    let b = f64::from_bits(values[node.arg(1).0 as usize][0]);
    [f(a, b).to_bits(), 0, 0, 0]
}

unsafe fn atomic_cas(addr: usize, expected: u64, desired: u64, elem: u8) -> u64 {
    match elem {
        1 => {
            let a = AtomicU8::from_ptr(addr as *mut u8);
            match a.compare_exchange(
                expected as u8,
                desired as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(v) | Err(v) => v as u64,
            }
        }
        2 => {
            let a = AtomicU16::from_ptr(addr as *mut u16);
            match a.compare_exchange(
                expected as u16,
                desired as u16,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(v) | Err(v) => v as u64,
            }
        }
        4 => {
            let a = AtomicU32::from_ptr(addr as *mut u32);
            match a.compare_exchange(
                expected as u32,
                desired as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(v) | Err(v) => v as u64,
            }
        }
        8 => {
            let a = AtomicU64::from_ptr(addr as *mut u64);
            match a.compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(v) | Err(v) => v,
            }
        }
        _ => unreachable!("cas elem_size {elem}"),
    }
}

unsafe fn atomic_rmw(op: Opcode, addr: usize, val: u64, elem: u8) -> u64 {
    macro_rules! rmw {
        ($atomic:ty, $ptr_ty:ty, $val:expr) => {{
            let a = <$atomic>::from_ptr(addr as *mut $ptr_ty);
            let v = $val;
            (match op {
                Opcode::AtomicSwap => a.swap(v, Ordering::SeqCst),
                Opcode::AtomicFetchAdd => a.fetch_add(v, Ordering::SeqCst),
                Opcode::AtomicFetchSub => a.fetch_sub(v, Ordering::SeqCst),
                Opcode::AtomicFetchAnd => a.fetch_and(v, Ordering::SeqCst),
                Opcode::AtomicFetchOr => a.fetch_or(v, Ordering::SeqCst),
                Opcode::AtomicFetchXor => a.fetch_xor(v, Ordering::SeqCst),
                _ => unreachable!(),
            }) as u64
        }};
    }
    match elem {
        1 => rmw!(AtomicU8, u8, val as u8),
        2 => rmw!(AtomicU16, u16, val as u16),
        4 => rmw!(AtomicU32, u32, val as u32),
        8 => rmw!(AtomicU64, u64, val),
        _ => unreachable!("atomic elem_size {elem}"),
    }
}
