/// Comparison condition carried in the `misc` field of `CondJump`,
/// `Select` and the vector compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CondCode {
    Eq = 0,
    Ne,
    Slt,
    Sge,
    Sgt,
    Sle,
    Ult,
    Uge,
    Ugt,
    Ule,
}

impl CondCode {
    pub fn from_u32(val: u32) -> CondCode {
        match val {
            0 => CondCode::Eq,
            1 => CondCode::Ne,
            2 => CondCode::Slt,
            3 => CondCode::Sge,
            4 => CondCode::Sgt,
            5 => CondCode::Sle,
            6 => CondCode::Ult,
            7 => CondCode::Uge,
            8 => CondCode::Ugt,
            9 => CondCode::Ule,
            _ => panic!("invalid CondCode value: {val}"),
        }
    }

    /// Evaluate the condition over two scalars already truncated to the
    /// operation width.
    pub fn eval(self, a: u64, b: u64, size: u8) -> bool {
        let (sa, sb) = (sext(a, size), sext(b, size));
        match self {
            CondCode::Eq => a == b,
            CondCode::Ne => a != b,
            CondCode::Slt => sa < sb,
            CondCode::Sge => sa >= sb,
            CondCode::Sgt => sa > sb,
            CondCode::Sle => sa <= sb,
            CondCode::Ult => a < b,
            CondCode::Uge => a >= b,
            CondCode::Ugt => a > b,
            CondCode::Ule => a <= b,
        }
    }
}

fn sext(val: u64, size: u8) -> i64 {
    let bits = size as u32 * 8;
    if bits >= 64 {
        return val as i64;
    }
    let shift = 64 - bits;
    ((val << shift) as i64) >> shift
}

/// Synchronous guest fault classification for the `Break` op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultKind {
    /// Guest executed an invalid/unimplemented instruction (SIGILL).
    IllegalInstruction = 0,
    /// Guest INTO/#OF overflow exception.
    Overflow,
    /// Guest int3 breakpoint (SIGTRAP).
    Breakpoint,
}

impl FaultKind {
    pub fn from_u32(val: u32) -> FaultKind {
        match val {
            0 => FaultKind::IllegalInstruction,
            1 => FaultKind::Overflow,
            2 => FaultKind::Breakpoint,
            _ => panic!("invalid FaultKind value: {val}"),
        }
    }

    /// Guest trap number written into the fault record (x86 numbering).
    pub fn trapno(self) -> u32 {
        match self {
            FaultKind::IllegalInstruction => 6,
            FaultKind::Overflow => 4,
            FaultKind::Breakpoint => 3,
        }
    }
}

/// `misc` bit on `LoadMem`/`StoreMem`: acquire/release ordering is
/// required. Plain MOV on x86 (TSO), LDAR/STLR on AArch64.
pub const MEMFLAG_ORDERED: u32 = 1 << 0;
