//! Fallback shim: routes IR ops with no backend lowering into
//! tabulated C-ABI helpers reached through the frame's handler table.
//!
//! Each helper's argument/return shape is described by a `FallbackAbi`
//! tag; the backends match on the tag to emit the correct
//! spill/marshal/call/repack sequence.

use dbt_ir::Opcode;

/// Argument/return shape of a tabulated helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAbi {
    /// `fn(u16)`
    VoidU16,
    /// `fn(f64) -> f64`
    F64F64,
    /// `fn(f64, f64) -> f64`
    F64F64F64,
}

/// Slot in the frame's fallback handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum FallbackFn {
    Sin = 0,
    Cos,
    Tan,
    Log2,
    Exp2,
    Pow,
    Atan2,
    Fmod,
    SetRoundingMode,
}

pub const FALLBACK_FN_COUNT: usize = FallbackFn::SetRoundingMode as usize + 1;

#[derive(Debug, Clone, Copy)]
pub struct FallbackInfo {
    pub abi: FallbackAbi,
    pub index: FallbackFn,
}

/// Helper descriptor for an opcode, or `None` when the op has no
/// tabulated helper (a missing backend handler is then a hard
/// `UnsupportedOp`).
pub fn fallback_info(op: Opcode) -> Option<FallbackInfo> {
    use FallbackAbi::*;
    let (abi, index) = match op {
        Opcode::F64Sin => (F64F64, FallbackFn::Sin),
        Opcode::F64Cos => (F64F64, FallbackFn::Cos),
        Opcode::F64Tan => (F64F64, FallbackFn::Tan),
        Opcode::F64Log2 => (F64F64, FallbackFn::Log2),
        Opcode::F64Exp2 => (F64F64, FallbackFn::Exp2),
        Opcode::F64Pow => (F64F64F64, FallbackFn::Pow),
        Opcode::F64Atan2 => (F64F64F64, FallbackFn::Atan2),
        Opcode::F64Mod => (F64F64F64, FallbackFn::Fmod),
        Opcode::SetRoundingMode => (VoidU16, FallbackFn::SetRoundingMode),
        _ => return None,
    };
    Some(FallbackInfo { abi, index })
}

// -- Helper bodies --
//
// These define the same semantics the reference interpreter computes
// inline. Emitted code calls them through the frame table with all
// caller-saved registers spilled.

extern "C" fn helper_sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn helper_cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn helper_tan(x: f64) -> f64 {
    x.tan()
}

extern "C" fn helper_log2(x: f64) -> f64 {
    x.log2()
}

extern "C" fn helper_exp2(x: f64) -> f64 {
    x.exp2()
}

extern "C" fn helper_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

extern "C" fn helper_atan2(x: f64, y: f64) -> f64 {
    x.atan2(y)
}

extern "C" fn helper_fmod(x: f64, y: f64) -> f64 {
    x % y
}

extern "C" fn helper_set_rounding_mode(_mode: u16) {
    // Rounding control is tracked per-thread by the frontend's FP
    // emulation; nothing to do on the host side yet.
}

/// Fill the frame's handler table, indexed by `FallbackFn`.
pub fn fill_fallback_table(table: &mut [u64; FALLBACK_FN_COUNT]) {
    table[FallbackFn::Sin as usize] = helper_sin as usize as u64;
    table[FallbackFn::Cos as usize] = helper_cos as usize as u64;
    table[FallbackFn::Tan as usize] = helper_tan as usize as u64;
    table[FallbackFn::Log2 as usize] = helper_log2 as usize as u64;
    table[FallbackFn::Exp2 as usize] = helper_exp2 as usize as u64;
    table[FallbackFn::Pow as usize] = helper_pow as usize as u64;
    table[FallbackFn::Atan2 as usize] = helper_atan2 as usize as u64;
    table[FallbackFn::Fmod as usize] = helper_fmod as usize as u64;
    table[FallbackFn::SetRoundingMode as usize] = helper_set_rounding_mode as usize as u64;
}
