use dbt_ir::node::{IrNode, NodeId};
use dbt_ir::serialize::{decode, decode_embedded, encode, encode_embedded, DecodeError};
use dbt_ir::{IrBlock, IrBuilder, Opcode};

/// Round-trip every opcode with distinctive header fields; the decoded
/// op header must match bit for bit.
#[test]
fn round_trip_preserves_every_op_header() {
    let mut block = IrBlock::new(0xDEAD_1000);
    block.begin_region();
    for raw in 0..Opcode::Count as u16 {
        let op = Opcode::from_u16(raw).unwrap();
        let mut node = IrNode::new(op, (raw % 32) as u8, (raw % 8) as u8);
        for (i, slot) in node.args.iter_mut().enumerate() {
            *slot = NodeId(raw as u32 * 7 + i as u32);
        }
        node.misc = 0x00C0_FFEE ^ raw as u32;
        node.imm = 0x0123_4567_89AB_CDEF ^ raw as u64;
        block.push(node);
    }
    block.finish();

    let bytes = encode(&block);
    let decoded = decode(&bytes).expect("decode failed");
    assert_eq!(decoded.entry_rip, block.entry_rip);
    assert_eq!(decoded.num_nodes(), block.num_nodes());
    assert_eq!(decoded.regions(), block.regions());
    for (a, b) in block.nodes().iter().zip(decoded.nodes()) {
        assert_eq!(a, b);
    }
}

#[test]
fn round_trip_preserves_regions() {
    let mut b = IrBuilder::new(0x7000);
    let x = b.constant(8, 3);
    b.jump(1);
    b.region();
    b.exit_block(x);
    let block = b.finish();

    let decoded = decode(&encode(&block)).unwrap();
    assert_eq!(decoded.regions(), block.regions());
    assert_eq!(decoded.validate(), Ok(()));
}

#[test]
fn decode_rejects_bad_magic() {
    let mut bytes = encode(&IrBuilder::new(0).finish_trivial());
    bytes[0] ^= 0xFF;
    assert!(matches!(decode(&bytes), Err(DecodeError::BadMagic(_))));
}

#[test]
fn decode_rejects_truncation() {
    let bytes = encode(&IrBuilder::new(0).finish_trivial());
    assert!(matches!(
        decode(&bytes[..bytes.len() - 3]),
        Err(DecodeError::Truncated { .. })
    ));
}

#[test]
fn decode_rejects_unknown_opcode() {
    let mut bytes = encode(&IrBuilder::new(0).finish_trivial());
    // First node's opcode field sits right after the 24-byte header.
    bytes[24] = 0xFF;
    bytes[25] = 0x7F;
    assert!(matches!(decode(&bytes), Err(DecodeError::BadOpcode(..))));
}

#[test]
fn embedded_form_round_trips() {
    let mut b = IrBuilder::new(0x9000);
    let c = b.constant(8, 0x1234);
    b.store_context(8, 8, c);
    b.exit_block(c);
    let block = b.finish();

    let bytes = encode_embedded(&block);
    let decoded = unsafe { decode_embedded(bytes.as_ptr()) }.unwrap();
    assert_eq!(decoded.entry_rip, block.entry_rip);
    assert_eq!(decoded.num_nodes(), block.num_nodes());
}

trait FinishTrivial {
    fn finish_trivial(self) -> IrBlock;
}

impl FinishTrivial for IrBuilder {
    fn finish_trivial(mut self) -> IrBlock {
        let rip = self.constant(8, 0);
        self.exit_block(rip);
        self.finish()
    }
}
