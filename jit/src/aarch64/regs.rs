/// AArch64 general register number. 31 encodes XZR or SP depending on
/// the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XReg(pub u8);

/// SIMD/SVE register number (v/z views share the file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VReg(pub u8);

pub const XZR: XReg = XReg(31);

/// Frame pointer register, pinned for the whole JIT run.
pub const STATE: XReg = XReg(28);

/// Backend scratch; x0-x3 are left free for C-call marshaling.
pub const TMP1: XReg = XReg(16);
pub const TMP2: XReg = XReg(17);
pub const TMP3: XReg = XReg(15);

pub const VTMP1: VReg = VReg(16);
pub const VTMP2: VReg = VReg(17);

/// Allocatable GPRs, indexed by `PhysicalRegister::index`.
pub const RA_GPR: [XReg; 10] = [
    XReg(4),
    XReg(5),
    XReg(6),
    XReg(7),
    XReg(8),
    XReg(9),
    XReg(10),
    XReg(11),
    XReg(12),
    XReg(13),
];

pub const RA_VEC: [VReg; 10] = [
    VReg(4),
    VReg(5),
    VReg(6),
    VReg(7),
    VReg(8),
    VReg(9),
    VReg(10),
    VReg(11),
    VReg(12),
    VReg(13),
];

pub const RA_PAIR: [(XReg, XReg); 4] = [
    (XReg(4), XReg(5)),
    (XReg(6), XReg(7)),
    (XReg(8), XReg(9)),
    (XReg(10), XReg(11)),
];
