//! Flat byte-stream encoding of IR blocks.
//!
//! Used by the interpreter trampoline, which embeds a serialized block
//! directly after its call sequence in the code buffer. The encoding is
//! little-endian and position-independent: header, node array, region
//! table.

use crate::block::{IrBlock, Region};
use crate::node::{IrNode, NodeId};
use crate::opcode::Opcode;

const MAGIC: u32 = 0x4252_4944; // "DIRB"
const VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 24;
pub const NODE_SIZE: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported version {0}")]
    BadVersion(u32),
    #[error("truncated stream: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("invalid opcode {0} at node {1}")]
    BadOpcode(u16, u32),
}

pub fn encoded_size(block: &IrBlock) -> usize {
    HEADER_SIZE + block.num_nodes() * NODE_SIZE + block.regions().len() * 8
}

pub fn encode(block: &IrBlock) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_size(block));
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&block.entry_rip.to_le_bytes());
    out.extend_from_slice(&(block.num_nodes() as u32).to_le_bytes());
    out.extend_from_slice(&(block.regions().len() as u32).to_le_bytes());
    for node in block.nodes() {
        out.extend_from_slice(&(node.op as u16).to_le_bytes());
        out.push(node.size);
        out.push(node.elem_size);
        for arg in node.args {
            out.extend_from_slice(&arg.0.to_le_bytes());
        }
        out.extend_from_slice(&node.misc.to_le_bytes());
        out.extend_from_slice(&node.imm.to_le_bytes());
    }
    for region in block.regions() {
        out.extend_from_slice(&region.start.to_le_bytes());
        out.extend_from_slice(&region.end.to_le_bytes());
    }
    out
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + n > self.data.len() {
            return Err(DecodeError::Truncated {
                need: self.pos + n,
                have: self.data.len(),
            });
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }
}

pub fn decode(data: &[u8]) -> Result<IrBlock, DecodeError> {
    let mut r = Reader { data, pos: 0 };
    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(DecodeError::BadVersion(version));
    }
    let entry_rip = r.u64()?;
    let node_count = r.u32()?;
    let region_count = r.u32()?;

    let mut nodes = Vec::with_capacity(node_count as usize);
    for i in 0..node_count {
        let raw_op = r.u16()?;
        let op = Opcode::from_u16(raw_op).ok_or(DecodeError::BadOpcode(raw_op, i))?;
        let size = r.u8()?;
        let elem_size = r.u8()?;
        let mut node = IrNode::new(op, size, elem_size);
        for slot in 0..4 {
            node.args[slot] = NodeId(r.u32()?);
        }
        node.misc = r.u32()?;
        node.imm = r.u64()?;
        nodes.push(node);
    }

    let mut regions = Vec::with_capacity(region_count as usize);
    for _ in 0..region_count {
        let start = r.u32()?;
        let end = r.u32()?;
        regions.push(Region { start, end });
    }

    Ok(IrBlock::from_parts(entry_rip, nodes, regions))
}

/// Decode a block that was embedded in a code buffer (length prefix
/// followed by the stream).
///
/// # Safety
/// `ptr` must point at a length-prefixed stream previously produced by
/// [`encode_embedded`].
pub unsafe fn decode_embedded(ptr: *const u8) -> Result<IrBlock, DecodeError> {
    let len = u32::from_le_bytes(core::slice::from_raw_parts(ptr, 4).try_into().unwrap());
    let data = core::slice::from_raw_parts(ptr.add(4), len as usize);
    decode(data)
}

/// Length-prefixed form for embedding after an interpreter trampoline.
pub fn encode_embedded(block: &IrBlock) -> Vec<u8> {
    let body = encode(block);
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}
