use dbt_ir::node::{IrNode, NO_NODE};
use dbt_ir::types::FaultKind;
use dbt_ir::{CondCode, IrBuilder, Opcode};

#[test]
fn node_record_is_32_bytes() {
    assert_eq!(core::mem::size_of::<IrNode>(), 32);
}

#[test]
fn builder_produces_valid_block() {
    let mut b = IrBuilder::new(0x1000);
    b.insn_start(0);
    let x = b.constant(8, 5);
    let y = b.constant(8, 7);
    let s = b.add(8, x, y);
    b.store_context(8, 0x10, s);
    let rip = b.constant(8, 0x2000);
    b.exit_block(rip);
    let block = b.finish();
    assert_eq!(block.regions().len(), 1);
    assert_eq!(block.validate(), Ok(()));
}

#[test]
fn multi_region_blocks_track_targets() {
    let mut b = IrBuilder::new(0x1000);
    let x = b.constant(8, 1);
    let y = b.constant(8, 2);
    // Region indices are handed out in emission order.
    b.cond_jump(CondCode::Ult, 8, x, y, 1, 2);
    let then_r = b.region();
    assert_eq!(then_r, 1);
    b.jump(3);
    let else_r = b.region();
    assert_eq!(else_r, 2);
    b.jump(3);
    let exit_r = b.region();
    assert_eq!(exit_r, 3);
    let rip = b.constant(8, 0);
    b.exit_block(rip);
    let block = b.finish();
    assert_eq!(block.regions().len(), 4);
    assert_eq!(block.validate(), Ok(()));
}

#[test]
fn validate_rejects_missing_terminator() {
    let mut block = dbt_ir::IrBlock::new(0x1000);
    block.begin_region();
    block.push(IrNode::new(Opcode::Nop, 0, 0));
    block.finish();
    assert!(block.validate().is_err());
}

#[test]
fn validate_rejects_forward_references() {
    let mut block = dbt_ir::IrBlock::new(0x1000);
    block.begin_region();
    let mut add = IrNode::new(Opcode::Add, 8, 0);
    add.args[0] = dbt_ir::NodeId(5);
    add.args[1] = dbt_ir::NodeId(6);
    block.push(add);
    let mut exit = IrNode::new(Opcode::ExitBlock, 8, 0);
    exit.args[0] = dbt_ir::NodeId(0);
    block.push(exit);
    block.finish();
    assert!(block.validate().is_err());
}

#[test]
fn opcode_metadata_is_consistent() {
    for raw in 0..Opcode::Count as u16 {
        let op = Opcode::from_u16(raw).unwrap();
        assert!(!op.name().is_empty());
        assert!(op.num_args() <= 4);
    }
    assert!(Opcode::from_u16(Opcode::Count as u16).is_none());
    assert!(Opcode::ExitBlock.is_terminator());
    assert!(Opcode::Break.is_terminator());
    assert!(!Opcode::Add.is_terminator());
}

#[test]
fn break_carries_fault_kind() {
    let mut b = IrBuilder::new(0x4000);
    b.insn_start(0);
    b.break_fault(FaultKind::IllegalInstruction, 0);
    let block = b.finish();
    let last = block.node(dbt_ir::NodeId(block.num_nodes() as u32 - 1));
    assert_eq!(last.op, Opcode::Break);
    assert_eq!(FaultKind::from_u32(last.misc), FaultKind::IllegalInstruction);
    assert_eq!(FaultKind::IllegalInstruction.trapno(), 6);
    assert_eq!(FaultKind::Overflow.trapno(), 4);
}

#[test]
fn unused_arg_slots_hold_sentinel() {
    let mut b = IrBuilder::new(0);
    let c = b.constant(8, 1);
    let n = b.not(8, c);
    let rip = b.constant(8, 0);
    b.exit_block(rip);
    let block = b.finish();
    let node = block.node(n);
    assert_eq!(node.args[0], c);
    assert_eq!(node.args[1], NO_NODE);
}
