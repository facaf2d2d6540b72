//! This module defines the representation of a disassembled firmware module
//! that all analyses work on.
//!
//! The analyses never decode machine code themselves.
//! Instead they query the [`BinaryFacts`] trait for decoded instructions, function boundaries,
//! memory segments and cross references.
//! The [`FirmwareModule`] struct implements the trait for modules exported by an external disassembler.
//! To learn how individual instructions are encoded,
//! you should first take a look at the [`Operand`] type and then at the [`Instruction`] type.

mod instruction;
pub use instruction::*;
mod segment;
pub use segment::*;
mod module;
pub use module::*;
mod facts;
pub use facts::*;
mod macros;
pub use macros::*;
