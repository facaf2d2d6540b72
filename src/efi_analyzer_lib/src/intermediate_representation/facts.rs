use super::{Function, Instruction, ModuleInfo, Segment};
use crate::uefi::{ServiceTable, TypeLayout};
use std::ops::Range;

/// The facts about a firmware module that the analyses consume.
///
/// The trait is the boundary to the disassembler:
/// every analysis reads instructions, functions, segments and cross references only through it.
/// Implementations must be safe to share between the worker threads of the analysis.
pub trait BinaryFacts: Sync {
    /// General information about the module, most importantly the machine type.
    fn module_info(&self) -> &ModuleInfo;

    /// The memory segments of the loaded module image.
    fn segments(&self) -> &[Segment];

    /// All functions whose start address lies in the given range, sorted by start address.
    fn list_functions(&self, range: Range<u64>) -> Vec<Function>;

    /// Decode the instruction at the given address.
    fn decode_instruction(&self, address: u64) -> Option<Instruction>;

    /// Addresses of all instructions referencing the given address.
    fn cross_references_to(&self, address: u64) -> Vec<u64>;

    /// The start addresses of the module entry points.
    fn entry_points(&self) -> Vec<u64>;

    /// All functions of the module, sorted by start address.
    fn functions(&self) -> Vec<Function> {
        self.list_functions(0..u64::MAX)
    }

    /// The function containing the given address.
    fn function_containing(&self, address: u64) -> Option<Function> {
        self.functions()
            .into_iter()
            .find(|function| function.contains(address))
    }

    /// Read `length` bytes of the module image starting at `address`.
    fn read_bytes(&self, address: u64, length: usize) -> Option<Vec<u8>> {
        self.segments()
            .iter()
            .find_map(|segment| segment.read(address, length))
            .map(|bytes| bytes.to_vec())
    }

    /// Returns `true` if the address lies inside one of the segments.
    fn is_mapped(&self, address: u64) -> bool {
        self.segments()
            .iter()
            .any(|segment| segment.contains(address))
    }

    /// The field layout of a service table type for the given pointer size.
    ///
    /// The default returns the built-in firmware type layouts.
    fn type_layout(&self, table: ServiceTable, pointer_size: u64) -> TypeLayout {
        TypeLayout::builtin(table, pointer_size)
    }
}

/// An iterator over consecutive decoded instructions, stopping at the first undecodable address,
/// at the end address or after a maximum number of instructions.
pub struct InstructionIter<'a> {
    facts: &'a dyn BinaryFacts,
    next: u64,
    end: u64,
    remaining: usize,
}

impl<'a> InstructionIter<'a> {
    pub fn new(facts: &'a dyn BinaryFacts, range: Range<u64>, max_instructions: usize) -> Self {
        InstructionIter {
            facts,
            next: range.start,
            end: range.end,
            remaining: max_instructions,
        }
    }

    /// Returns `true` if the iterator stopped because of the instruction bound.
    pub fn bound_reached(&self) -> bool {
        self.remaining == 0 && self.next < self.end
    }
}

impl<'a> Iterator for InstructionIter<'a> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Instruction> {
        if self.remaining == 0 || self.next >= self.end {
            return None;
        }
        let instruction = self.facts.decode_instruction(self.next)?;
        if instruction.size == 0 {
            self.next = self.end;
        } else {
            self.next = instruction.next_address();
        }
        self.remaining -= 1;
        Some(instruction)
    }
}
