use crate::node::{IrNode, NodeId, NO_NODE};
use crate::opcode::Opcode;

/// Half-open node range forming one basic block (region) of an
/// `IrBlock`. Regions are kept in frontend emission order; region 0 is
/// the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: u32,
    pub end: u32,
}

/// The unit of translation: all IR for one guest block, flat node array
/// plus the region table.
#[derive(Debug, Clone)]
pub struct IrBlock {
    pub entry_rip: u64,
    nodes: Vec<IrNode>,
    regions: Vec<Region>,
}

impl IrBlock {
    pub fn new(entry_rip: u64) -> Self {
        Self {
            entry_rip,
            nodes: Vec::with_capacity(64),
            regions: Vec::with_capacity(4),
        }
    }

    pub(crate) fn from_parts(
        entry_rip: u64,
        nodes: Vec<IrNode>,
        regions: Vec<Region>,
    ) -> Self {
        Self {
            entry_rip,
            nodes,
            regions,
        }
    }

    pub fn push(&mut self, node: IrNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn begin_region(&mut self) -> u32 {
        let start = self.nodes.len() as u32;
        // Close the previous region at the current node.
        if let Some(last) = self.regions.last_mut() {
            last.end = start;
        }
        self.regions.push(Region { start, end: start });
        (self.regions.len() - 1) as u32
    }

    pub fn finish(&mut self) {
        let end = self.nodes.len() as u32;
        if let Some(last) = self.regions.last_mut() {
            last.end = end;
        }
    }

    pub fn node(&self, id: NodeId) -> &IrNode {
        &self.nodes[id.0 as usize]
    }

    pub fn nodes(&self) -> &[IrNode] {
        &self.nodes
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region_nodes(&self, region: u32) -> impl Iterator<Item = NodeId> {
        let r = self.regions[region as usize];
        (r.start..r.end).map(NodeId)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Structural sanity checks: every region ends in a terminator,
    /// argument references point backwards at defined nodes, argument
    /// counts match the opcode.
    pub fn validate(&self) -> Result<(), String> {
        if self.regions.is_empty() {
            return Err("block has no regions".into());
        }
        for (ri, r) in self.regions.iter().enumerate() {
            if r.start >= r.end {
                return Err(format!("region {ri} is empty"));
            }
            if r.end as usize > self.nodes.len() {
                return Err(format!("region {ri} exceeds node array"));
            }
            let last = &self.nodes[r.end as usize - 1];
            if !last.op.is_terminator() {
                return Err(format!(
                    "region {ri} ends in non-terminator {}",
                    last.op.name()
                ));
            }
            for idx in r.start..r.end {
                let node = &self.nodes[idx as usize];
                let nargs = node.op.num_args();
                for (ai, &arg) in node.args.iter().enumerate() {
                    if ai < nargs {
                        if arg == NO_NODE {
                            return Err(format!(
                                "node {idx}: missing arg {ai} on {}",
                                node.op.name()
                            ));
                        }
                        if arg.0 >= idx {
                            return Err(format!(
                                "node {idx}: forward arg reference to {}",
                                arg.0
                            ));
                        }
                    } else if arg != NO_NODE {
                        return Err(format!(
                            "node {idx}: excess arg {ai} on {}",
                            node.op.name()
                        ));
                    }
                }
                if node.op == Opcode::Jump && node.imm as usize >= self.regions.len() {
                    return Err(format!("node {idx}: jump target out of range"));
                }
                if node.op == Opcode::CondJump {
                    let t = node.imm as u32 as usize;
                    let f = (node.imm >> 32) as usize;
                    if t >= self.regions.len() || f >= self.regions.len() {
                        return Err(format!("node {idx}: cond_jump target out of range"));
                    }
                }
            }
        }
        Ok(())
    }
}
