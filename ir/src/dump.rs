//! Human-readable IR printer for debugging and the tracing sites.

use crate::block::IrBlock;
use crate::node::{NodeId, NO_NODE};
use crate::opcode::Opcode;
use std::fmt::Write;

pub fn dump_block(block: &IrBlock) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "block @ {:#x}:", block.entry_rip);
    for (ri, _) in block.regions().iter().enumerate() {
        let _ = writeln!(out, " region {ri}:");
        for id in block.region_nodes(ri as u32) {
            let _ = writeln!(out, "  {}", format_node(block, id));
        }
    }
    out
}

pub fn format_node(block: &IrBlock, id: NodeId) -> String {
    let node = block.node(id);
    let mut s = String::new();
    if node.op.dest_class(node.size) != crate::ra::RegClass::Invalid {
        let _ = write!(s, "%{} = ", id.0);
    }
    let _ = write!(s, "{}", node.op.name());
    if node.size != 0 {
        let _ = write!(s, ".{}", node.size);
    }
    if node.elem_size != 0 {
        let _ = write!(s, "x{}", node.elem_size);
    }
    for &arg in node.args.iter().filter(|&&a| a != NO_NODE) {
        let _ = write!(s, " %{}", arg.0);
    }
    match node.op {
        Opcode::Constant | Opcode::InlineConstant => {
            let _ = write!(s, " {:#x}", node.imm);
        }
        Opcode::LoadContext | Opcode::StoreContext => {
            let _ = write!(s, " [ctx+{:#x}]", node.imm);
        }
        Opcode::Jump => {
            let _ = write!(s, " -> region {}", node.imm);
        }
        Opcode::CondJump => {
            let _ = write!(
                s,
                " cond={} -> region {} else {}",
                node.misc,
                node.imm as u32,
                node.imm >> 32
            );
        }
        Opcode::GotoBlock => {
            let _ = write!(s, " -> rip {:#x}", node.imm);
        }
        Opcode::InsnStart | Opcode::Break => {
            let _ = write!(s, " rip+{:#x}", node.imm);
        }
        _ => {
            if node.misc != 0 {
                let _ = write!(s, " misc={:#x}", node.misc);
            }
        }
    }
    s
}
