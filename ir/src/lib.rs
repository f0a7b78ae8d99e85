//! IR data model for the binary translation core.
//!
//! A guest block is decoded by an external frontend into a flat array of
//! opcode-tagged nodes (`IrBlock`), register-allocated by an external RA
//! pass (`RaData`), and then either lowered to host code by one of the
//! JIT backends or executed directly by the reference interpreter.

pub mod block;
pub mod builder;
pub mod dump;
pub mod interp;
pub mod node;
pub mod opcode;
pub mod ra;
pub mod serialize;
pub mod types;

pub use block::{IrBlock, Region};
pub use builder::IrBuilder;
pub use node::{IrNode, NodeId};
pub use opcode::Opcode;
pub use ra::{RaData, RegClass, PhysicalRegister};
pub use types::{CondCode, FaultKind, MEMFLAG_ORDERED};
