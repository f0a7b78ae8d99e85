use crate::compiler::BlockCx;
use crate::CompileError;
use dbt_ir::node::IrNode;
use dbt_ir::opcode::OPCODE_COUNT;
use dbt_ir::{NodeId, Opcode};

/// Per-opcode emitter function.
pub type OpHandler<B> =
    fn(&mut B, &mut BlockCx<'_>, NodeId, &IrNode) -> Result<(), CompileError>;

/// Per-opcode handler table. One instance per backend, filled once at
/// construction and read-only afterwards; unfilled slots resolve to the
/// backend's fallback handler.
pub struct DispatchTable<B> {
    slots: Box<[OpHandler<B>; OPCODE_COUNT]>,
}

impl<B> DispatchTable<B> {
    pub fn new(fallback: OpHandler<B>) -> Self {
        Self {
            slots: Box::new([fallback; OPCODE_COUNT]),
        }
    }

    pub fn set(&mut self, op: Opcode, handler: OpHandler<B>) {
        self.slots[op as usize] = handler;
    }

    #[inline]
    pub fn get(&self, op: Opcode) -> OpHandler<B> {
        self.slots[op as usize]
    }
}
