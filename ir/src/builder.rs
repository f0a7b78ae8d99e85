use crate::block::IrBlock;
use crate::node::{IrNode, NodeId};
use crate::opcode::Opcode;
use crate::types::{CondCode, FaultKind};

/// Convenience wrapper for constructing blocks by hand (tests, simple
/// frontends). Thin typed layer over `IrBlock::push`.
pub struct IrBuilder {
    block: IrBlock,
}

impl IrBuilder {
    pub fn new(entry_rip: u64) -> Self {
        let mut block = IrBlock::new(entry_rip);
        block.begin_region();
        Self { block }
    }

    pub fn finish(mut self) -> IrBlock {
        self.block.finish();
        debug_assert_eq!(self.block.validate(), Ok(()));
        self.block
    }

    /// Start a new region; returns its index for branch targets.
    pub fn region(&mut self) -> u32 {
        self.block.begin_region()
    }

    fn push(&mut self, node: IrNode) -> NodeId {
        self.block.push(node)
    }

    // -- Meta --

    pub fn insn_start(&mut self, rip_offset: u64) {
        let mut n = IrNode::new(Opcode::InsnStart, 0, 0);
        n.imm = rip_offset;
        self.push(n);
    }

    pub fn inline_const(&mut self, val: u64) -> NodeId {
        let mut n = IrNode::new(Opcode::InlineConstant, 8, 0);
        n.imm = val;
        self.push(n)
    }

    pub fn constant(&mut self, size: u8, val: u64) -> NodeId {
        let mut n = IrNode::new(Opcode::Constant, size, 0);
        n.imm = val;
        self.push(n)
    }

    pub fn mov(&mut self, size: u8, src: NodeId) -> NodeId {
        let mut n = IrNode::new(Opcode::Mov, size, 0);
        n.args[0] = src;
        self.push(n)
    }

    // -- Context --

    pub fn load_context(&mut self, size: u8, offset: u64) -> NodeId {
        let mut n = IrNode::new(Opcode::LoadContext, size, 0);
        n.imm = offset;
        self.push(n)
    }

    pub fn store_context(&mut self, size: u8, offset: u64, val: NodeId) {
        let mut n = IrNode::new(Opcode::StoreContext, size, 0);
        n.imm = offset;
        n.args[0] = val;
        self.push(n);
    }

    // -- ALU --

    fn binop(&mut self, op: Opcode, size: u8, a: NodeId, b: NodeId) -> NodeId {
        let mut n = IrNode::new(op, size, 0);
        n.args[0] = a;
        n.args[1] = b;
        self.push(n)
    }

    fn unop(&mut self, op: Opcode, size: u8, a: NodeId) -> NodeId {
        let mut n = IrNode::new(op, size, 0);
        n.args[0] = a;
        self.push(n)
    }

    pub fn add(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::Add, size, a, b)
    }

    pub fn sub(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::Sub, size, a, b)
    }

    pub fn mul(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::Mul, size, a, b)
    }

    pub fn div(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::Div, size, a, b)
    }

    pub fn udiv(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::UDiv, size, a, b)
    }

    pub fn rem(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::Rem, size, a, b)
    }

    pub fn urem(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::URem, size, a, b)
    }

    pub fn and(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::And, size, a, b)
    }

    pub fn or(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::Or, size, a, b)
    }

    pub fn xor(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::Xor, size, a, b)
    }

    pub fn not(&mut self, size: u8, a: NodeId) -> NodeId {
        self.unop(Opcode::Not, size, a)
    }

    pub fn neg(&mut self, size: u8, a: NodeId) -> NodeId {
        self.unop(Opcode::Neg, size, a)
    }

    pub fn shl(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::Shl, size, a, b)
    }

    pub fn shr(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::Shr, size, a, b)
    }

    pub fn ashr(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::Ashr, size, a, b)
    }

    pub fn ror(&mut self, size: u8, a: NodeId, b: NodeId) -> NodeId {
        self.binop(Opcode::Ror, size, a, b)
    }

    pub fn sbfe(&mut self, size: u8, a: NodeId, lsb: u8, width: u8) -> NodeId {
        let mut n = IrNode::new(Opcode::Sbfe, size, 0);
        n.args[0] = a;
        n.misc = lsb as u32 | ((width as u32) << 8);
        self.push(n)
    }

    pub fn ubfe(&mut self, size: u8, a: NodeId, lsb: u8, width: u8) -> NodeId {
        let mut n = IrNode::new(Opcode::Ubfe, size, 0);
        n.args[0] = a;
        n.misc = lsb as u32 | ((width as u32) << 8);
        self.push(n)
    }

    pub fn bfi(&mut self, size: u8, base: NodeId, field: NodeId, lsb: u8, width: u8) -> NodeId {
        let mut n = IrNode::new(Opcode::Bfi, size, 0);
        n.args[0] = base;
        n.args[1] = field;
        n.misc = lsb as u32 | ((width as u32) << 8);
        self.push(n)
    }

    pub fn popcount(&mut self, size: u8, a: NodeId) -> NodeId {
        self.unop(Opcode::Popcount, size, a)
    }

    pub fn clz(&mut self, size: u8, a: NodeId) -> NodeId {
        self.unop(Opcode::Clz, size, a)
    }

    pub fn ctz(&mut self, size: u8, a: NodeId) -> NodeId {
        self.unop(Opcode::Ctz, size, a)
    }

    pub fn rev(&mut self, size: u8, a: NodeId) -> NodeId {
        self.unop(Opcode::Rev, size, a)
    }

    pub fn select(
        &mut self,
        size: u8,
        cond: CondCode,
        cmp_a: NodeId,
        cmp_b: NodeId,
        true_val: NodeId,
        false_val: NodeId,
    ) -> NodeId {
        let mut n = IrNode::new(Opcode::Select, size, 0);
        n.args = [cmp_a, cmp_b, true_val, false_val];
        n.misc = cond as u32;
        self.push(n)
    }

    // -- Memory --

    pub fn load_mem(&mut self, size: u8, addr: NodeId, flags: u32) -> NodeId {
        let mut n = IrNode::new(Opcode::LoadMem, size, 0);
        n.args[0] = addr;
        n.misc = flags;
        self.push(n)
    }

    pub fn store_mem(&mut self, size: u8, addr: NodeId, val: NodeId, flags: u32) {
        let mut n = IrNode::new(Opcode::StoreMem, size, 0);
        n.args[0] = addr;
        n.args[1] = val;
        n.misc = flags;
        self.push(n);
    }

    // -- Atomics --

    pub fn cas(&mut self, elem: u8, addr: NodeId, expected: NodeId, desired: NodeId) -> NodeId {
        let mut n = IrNode::new(Opcode::Cas, elem, elem);
        n.args[0] = addr;
        n.args[1] = expected;
        n.args[2] = desired;
        self.push(n)
    }

    pub fn atomic_rmw(&mut self, op: Opcode, elem: u8, addr: NodeId, val: NodeId) -> NodeId {
        debug_assert!(matches!(
            op,
            Opcode::AtomicSwap
                | Opcode::AtomicFetchAdd
                | Opcode::AtomicFetchSub
                | Opcode::AtomicFetchAnd
                | Opcode::AtomicFetchOr
                | Opcode::AtomicFetchXor
        ));
        let mut n = IrNode::new(op, elem, elem);
        n.args[0] = addr;
        n.args[1] = val;
        self.push(n)
    }

    // -- Vector --

    pub fn vbinop(&mut self, op: Opcode, size: u8, elem: u8, a: NodeId, b: NodeId) -> NodeId {
        let mut n = IrNode::new(op, size, elem);
        n.args[0] = a;
        n.args[1] = b;
        self.push(n)
    }

    pub fn vneg(&mut self, size: u8, elem: u8, a: NodeId) -> NodeId {
        let mut n = IrNode::new(Opcode::VNeg, size, elem);
        n.args[0] = a;
        self.push(n)
    }

    pub fn vdup(&mut self, size: u8, elem: u8, scalar: NodeId) -> NodeId {
        let mut n = IrNode::new(Opcode::VDup, size, elem);
        n.args[0] = scalar;
        self.push(n)
    }

    pub fn vshift_imm(&mut self, op: Opcode, size: u8, elem: u8, a: NodeId, shift: u8) -> NodeId {
        let mut n = IrNode::new(op, size, elem);
        n.args[0] = a;
        n.misc = shift as u32;
        self.push(n)
    }

    pub fn vextract(&mut self, elem: u8, vec: NodeId, lane: u8) -> NodeId {
        let mut n = IrNode::new(Opcode::VExtract, 16, elem);
        n.args[0] = vec;
        n.misc = lane as u32;
        self.push(n)
    }

    // -- Control flow --

    pub fn jump(&mut self, target: u32) {
        let mut n = IrNode::new(Opcode::Jump, 0, 0);
        n.imm = target as u64;
        self.push(n);
    }

    pub fn cond_jump(
        &mut self,
        cond: CondCode,
        size: u8,
        a: NodeId,
        b: NodeId,
        true_region: u32,
        false_region: u32,
    ) {
        let mut n = IrNode::new(Opcode::CondJump, size, 0);
        n.args[0] = a;
        n.args[1] = b;
        n.misc = cond as u32;
        n.imm = true_region as u64 | ((false_region as u64) << 32);
        self.push(n);
    }

    pub fn goto_block(&mut self, callee_rip: u64) {
        let mut n = IrNode::new(Opcode::GotoBlock, 0, 0);
        n.imm = callee_rip;
        self.push(n);
    }

    pub fn indirect_branch(&mut self, rip: NodeId) {
        let mut n = IrNode::new(Opcode::IndirectBranch, 8, 0);
        n.args[0] = rip;
        self.push(n);
    }

    pub fn exit_block(&mut self, rip: NodeId) {
        let mut n = IrNode::new(Opcode::ExitBlock, 8, 0);
        n.args[0] = rip;
        self.push(n);
    }

    pub fn break_fault(&mut self, kind: FaultKind, rip_offset: u64) {
        let mut n = IrNode::new(Opcode::Break, 0, 0);
        n.misc = kind as u32;
        n.imm = rip_offset;
        self.push(n);
    }

    // -- Runtime services --

    pub fn syscall(&mut self, nr: NodeId) -> NodeId {
        let mut n = IrNode::new(Opcode::Syscall, 8, 0);
        n.args[0] = nr;
        self.push(n)
    }

    pub fn cpuid(&mut self, leaf: NodeId, subleaf: NodeId) -> NodeId {
        let mut n = IrNode::new(Opcode::CpuId, 16, 0);
        n.args[0] = leaf;
        n.args[1] = subleaf;
        self.push(n)
    }

    pub fn xcr(&mut self, index: NodeId) -> NodeId {
        let mut n = IrNode::new(Opcode::Xcr, 8, 0);
        n.args[0] = index;
        self.push(n)
    }

    pub fn pair_extract(&mut self, pair: NodeId, half: u8) -> NodeId {
        let mut n = IrNode::new(Opcode::PairExtract, 8, 0);
        n.args[0] = pair;
        n.misc = half as u32;
        self.push(n)
    }

    // -- Tabulated helpers --

    pub fn f64_unary(&mut self, op: Opcode, a: NodeId) -> NodeId {
        let mut n = IrNode::new(op, 16, 8);
        n.args[0] = a;
        self.push(n)
    }

    pub fn f64_binary(&mut self, op: Opcode, a: NodeId, b: NodeId) -> NodeId {
        let mut n = IrNode::new(op, 16, 8);
        n.args[0] = a;
        n.args[1] = b;
        self.push(n)
    }

    pub fn set_rounding_mode(&mut self, mode: NodeId) {
        let mut n = IrNode::new(Opcode::SetRoundingMode, 2, 0);
        n.args[0] = mode;
        self.push(n);
    }
}
