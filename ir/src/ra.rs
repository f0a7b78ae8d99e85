//! Register-allocation oracle data.
//!
//! The real allocation pass lives outside this repository; the JIT
//! consumes its output read-only through `RaData`. A plain linear-scan
//! allocator is provided for tests and simple frontends.

use crate::block::IrBlock;
use crate::node::{IrNode, NodeId, NO_NODE};
use crate::opcode::Opcode;

/// Register class of an allocated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegClass {
    Invalid = 0,
    Gpr,
    Fpr,
    GprPair,
}

/// One allocated register: class plus index into the backend's
/// class-specific register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRegister {
    pub class: RegClass,
    pub index: u8,
}

impl PhysicalRegister {
    pub const INVALID: PhysicalRegister = PhysicalRegister {
        class: RegClass::Invalid,
        index: 0,
    };

    pub fn is_valid(&self) -> bool {
        self.class != RegClass::Invalid
    }
}

/// Side-band register assignment for one block, indexed by node id.
/// The JIT never mutates this.
#[derive(Debug, Clone)]
pub struct RaData {
    pub spill_slots: u32,
    map: Vec<PhysicalRegister>,
}

impl RaData {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            spill_slots: 0,
            map: vec![PhysicalRegister::INVALID; num_nodes],
        }
    }

    pub fn set(&mut self, node: NodeId, reg: PhysicalRegister) {
        self.map[node.0 as usize] = reg;
    }

    pub fn get(&self, node: NodeId) -> PhysicalRegister {
        self.map[node.0 as usize]
    }
}

/// Register-file shape the allocator works against. Matches the counts
/// both backends expose: pair `i` conflicts with GPRs `2i` and `2i+1`.
#[derive(Debug, Clone, Copy)]
pub struct RegFileLayout {
    pub num_gprs: u8,
    pub num_fprs: u8,
    pub num_pairs: u8,
}

pub const DEFAULT_REG_FILE: RegFileLayout = RegFileLayout {
    num_gprs: 10,
    num_fprs: 10,
    num_pairs: 4,
};

#[derive(Debug, thiserror::Error)]
pub enum RaError {
    #[error("out of {0:?} registers at node {1}")]
    OutOfRegisters(RegClass, u32),
}

/// Naive linear scan over the dense node array: assign at definition,
/// free after the last use. Values that never get used are freed
/// immediately after their defining op.
pub fn allocate(block: &IrBlock, layout: &RegFileLayout) -> Result<RaData, RaError> {
    let nodes = block.nodes();
    let mut last_use = vec![0u32; nodes.len()];
    for (idx, node) in nodes.iter().enumerate() {
        for &arg in node.args.iter() {
            if arg != NO_NODE {
                last_use[arg.0 as usize] = idx as u32;
            }
        }
    }

    let mut data = RaData::new(nodes.len());
    let mut gpr_free: Vec<u8> = (0..layout.num_gprs).rev().collect();
    let mut fpr_free: Vec<u8> = (0..layout.num_fprs).rev().collect();

    // expire[i] lists nodes whose register dies after op i.
    let mut expire: Vec<Vec<u32>> = vec![Vec::new(); nodes.len()];
    for (idx, &lu) in last_use.iter().enumerate() {
        if nodes[idx].op.dest_class(nodes[idx].size) != RegClass::Invalid {
            let at = lu.max(idx as u32);
            expire[at as usize].push(idx as u32);
        }
    }

    for (idx, node) in nodes.iter().enumerate() {
        let class = dest_class_of(node);
        match class {
            RegClass::Gpr => {
                let reg = gpr_free
                    .pop()
                    .ok_or(RaError::OutOfRegisters(RegClass::Gpr, idx as u32))?;
                data.set(NodeId(idx as u32), PhysicalRegister {
                    class: RegClass::Gpr,
                    index: reg,
                });
            }
            RegClass::Fpr => {
                let reg = fpr_free
                    .pop()
                    .ok_or(RaError::OutOfRegisters(RegClass::Fpr, idx as u32))?;
                data.set(NodeId(idx as u32), PhysicalRegister {
                    class: RegClass::Fpr,
                    index: reg,
                });
            }
            RegClass::GprPair => {
                // Pair i needs GPRs 2i and 2i+1 simultaneously free.
                let pair = (0..layout.num_pairs).find(|&p| {
                    gpr_free.contains(&(p * 2)) && gpr_free.contains(&(p * 2 + 1))
                });
                let pair = pair
                    .ok_or(RaError::OutOfRegisters(RegClass::GprPair, idx as u32))?;
                gpr_free.retain(|&r| r != pair * 2 && r != pair * 2 + 1);
                data.set(NodeId(idx as u32), PhysicalRegister {
                    class: RegClass::GprPair,
                    index: pair,
                });
            }
            RegClass::Invalid => {}
        }

        for &dead in &expire[idx] {
            let reg = data.get(NodeId(dead));
            match reg.class {
                RegClass::Gpr => gpr_free.push(reg.index),
                RegClass::Fpr => fpr_free.push(reg.index),
                RegClass::GprPair => {
                    gpr_free.push(reg.index * 2);
                    gpr_free.push(reg.index * 2 + 1);
                }
                RegClass::Invalid => {}
            }
        }
    }

    Ok(data)
}

fn dest_class_of(node: &IrNode) -> RegClass {
    if node.op == Opcode::InlineConstant {
        // Folded into the consumer; never materialized.
        return RegClass::Invalid;
    }
    node.op.dest_class(node.size)
}
