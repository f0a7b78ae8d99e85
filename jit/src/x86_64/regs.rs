/// x86-64 general-purpose register numbers (ModR/M + REX encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn from_u8(val: u8) -> Reg {
        assert!(val < 16);
        // SAFETY: repr(u8) with dense discriminants 0..16.
        unsafe { core::mem::transmute(val) }
    }
}

/// SSE register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Xmm(pub u8);

/// Frame pointer register: pinned to the CpuStateFrame for the whole
/// JIT run. Callee-saved so helper calls do not disturb it.
pub const STATE: Reg = Reg::R14;

/// Scratch registers owned by the backend; never handed to the RA.
pub const TMP1: Reg = Reg::Rax;
pub const TMP2: Reg = Reg::Rcx;
pub const TMP3: Reg = Reg::Rdx;

pub const VTMP1: Xmm = Xmm(0);
pub const VTMP2: Xmm = Xmm(1);

/// Allocatable GPRs, indexed by `PhysicalRegister::index`.
pub const RA_GPR: [Reg; 10] = [
    Reg::Rsi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::Rbx,
    Reg::Rbp,
    Reg::R12,
    Reg::R13,
    Reg::R15,
];

/// Allocatable SSE registers. xmm0-xmm3 stay backend scratch.
pub const RA_XMM: [Xmm; 10] = [
    Xmm(4),
    Xmm(5),
    Xmm(6),
    Xmm(7),
    Xmm(8),
    Xmm(9),
    Xmm(10),
    Xmm(11),
    Xmm(12),
    Xmm(13),
];

/// GPR pairs: pair `i` aliases GPRs `2i` and `2i+1`.
pub const RA_PAIR: [(Reg, Reg); 4] = [
    (Reg::Rsi, Reg::R8),
    (Reg::R9, Reg::R10),
    (Reg::R11, Reg::Rbx),
    (Reg::Rbp, Reg::R12),
];

/// Callee-saved registers the dispatcher enter stub preserves.
pub const CALLEE_SAVED: [Reg; 6] = [
    Reg::Rbx,
    Reg::Rbp,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];
