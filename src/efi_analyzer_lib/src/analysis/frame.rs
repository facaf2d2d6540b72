//! Decoded function bodies with a linear stack frame model.

use super::{ArchProfile, ArgumentSlot};
use crate::intermediate_representation::{
    BinaryFacts, Function, InstructionIter, MemoryOperand, Mnemonic,
};
use crate::prelude::*;

/// A storage location whose value the analyses track.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub enum Location {
    /// A register, identified by its register family.
    Register(Register),
    /// A stack slot, relative to the value of the stack pointer at function entry.
    Stack(i64),
    /// A global memory address.
    Global(u64),
}

impl Location {
    /// The register location of the family of the given register.
    pub fn register(register: &Register) -> Location {
        Location::Register(register.family())
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Register(register) => write!(formatter, "{}", register),
            Location::Stack(offset) if *offset < 0 => write!(formatter, "stack[-{:#x}]", -offset),
            Location::Stack(offset) => write!(formatter, "stack[{:#x}]", offset),
            Location::Global(address) => write!(formatter, "[{:#x}]", address),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
struct FrameState {
    /// Stack pointer relative to its value at function entry.
    /// `None` once an adjustment leaves the representable range.
    stack_delta: Option<i64>,
    /// Frame pointer relative to the stack pointer at function entry, if it holds a frame address.
    frame_base: Option<i64>,
}

/// The decoded instructions of a function.
///
/// The stack pointer offset before each instruction is computed in a single linear pass,
/// which is exact for the usual prologue/epilogue code generated for firmware modules.
#[derive(Debug, Clone)]
pub struct FunctionBody {
    pub function: Function,
    pub instructions: Vec<Instruction>,
    frames: Vec<FrameState>,
    /// Set if decoding stopped at the instruction bound before the function end.
    pub truncated: bool,
    pointer_size: u64,
}

impl Default for FrameState {
    fn default() -> FrameState {
        FrameState {
            stack_delta: Some(0),
            frame_base: None,
        }
    }
}

impl FrameState {
    fn shift_stack(&mut self, amount: i64) {
        self.stack_delta = self.stack_delta.and_then(|delta| delta.checked_add(amount));
    }
}

impl FunctionBody {
    /// Decode the instructions of a function.
    pub fn decode(
        facts: &dyn BinaryFacts,
        function: &Function,
        profile: &ArchProfile,
        max_instructions: usize,
    ) -> FunctionBody {
        let mut iter = InstructionIter::new(facts, function.start..function.end, max_instructions);
        let instructions: Vec<Instruction> = iter.by_ref().collect();
        let truncated = iter.bound_reached();
        FunctionBody::from_instructions(function.clone(), instructions, profile, truncated)
    }

    /// Build a function body from already decoded instructions.
    pub fn from_instructions(
        function: Function,
        instructions: Vec<Instruction>,
        profile: &ArchProfile,
        truncated: bool,
    ) -> FunctionBody {
        let mut frames = Vec::with_capacity(instructions.len());
        let mut state = FrameState::default();
        for instruction in &instructions {
            frames.push(state);
            state = next_frame_state(state, instruction, profile);
        }
        FunctionBody {
            function,
            instructions,
            frames,
            truncated,
            pointer_size: profile.pointer_size,
        }
    }

    pub fn start(&self) -> u64 {
        self.function.start
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn pointer_size(&self) -> u64 {
        self.pointer_size
    }

    /// The index of the instruction at the given address.
    pub fn index_of(&self, address: u64) -> Option<usize> {
        self.instructions
            .binary_search_by_key(&address, |instruction| instruction.address)
            .ok()
    }

    /// The stack pointer offset before the instruction at `index`, if it is known.
    pub fn stack_delta(&self, index: usize) -> Option<i64> {
        match self.frames.get(index) {
            Some(frame) => frame.stack_delta,
            None => Some(0),
        }
    }

    /// Normalize a memory operand of the instruction at `index` to a stack slot or a global address.
    ///
    /// Returns `None` if the address depends on a register other than the stack or frame pointer.
    pub fn normalize(&self, index: usize, memory: &MemoryOperand, profile: &ArchProfile) -> Option<Location> {
        let instruction = self.instructions.get(index)?;
        if let Some(address) = memory.absolute_address(instruction.next_address()) {
            return Some(Location::Global(address));
        }
        if memory.index.is_some() {
            return None;
        }
        let base = memory.base.as_ref()?;
        let frame = self.frames[index];
        if profile.is_stack_pointer(base) {
            frame
                .stack_delta?
                .checked_add(memory.displacement)
                .map(Location::Stack)
        } else if profile.is_frame_pointer(base) {
            frame
                .frame_base?
                .checked_add(memory.displacement)
                .map(Location::Stack)
        } else {
            None
        }
    }

    /// The location of an argument of the call instruction at `index`.
    ///
    /// Returns `None` for a stack argument if the stack pointer offset is unknown.
    pub fn call_argument(&self, index: usize, argument: usize, profile: &ArchProfile) -> Option<Location> {
        match profile.argument_at_call(argument) {
            ArgumentSlot::Register(register) => Some(Location::register(&register)),
            ArgumentSlot::Stack(offset) => self
                .stack_delta(index)?
                .checked_add(offset)
                .map(Location::Stack),
        }
    }

    /// The location of an argument of the function at its entry.
    pub fn entry_argument(argument: usize, profile: &ArchProfile) -> Location {
        match profile.argument_at_entry(argument) {
            ArgumentSlot::Register(register) => Location::register(&register),
            ArgumentSlot::Stack(offset) => Location::Stack(offset),
        }
    }

    /// The location written by an operand of the instruction at `index`.
    pub fn operand_location(&self, index: usize, operand: &Operand, profile: &ArchProfile) -> Option<Location> {
        match operand {
            Operand::Register(register) => Some(Location::register(register)),
            Operand::Memory(memory) => self.normalize(index, memory, profile),
            _ => None,
        }
    }
}

/// Compute the frame state after the given instruction.
fn next_frame_state(mut state: FrameState, instruction: &Instruction, profile: &ArchProfile) -> FrameState {
    let pointer_size = profile.pointer_size as i64;
    let operands = &instruction.operands;
    let is_sp = |index: usize| {
        operands
            .get(index)
            .and_then(Operand::as_register)
            .map(|register| profile.is_stack_pointer(register))
            .unwrap_or(false)
    };
    let immediate = |index: usize| match operands.get(index) {
        Some(Operand::Immediate(value)) => Some(*value as i64),
        _ => None,
    };
    for operand in operands {
        if let Operand::Memory(memory) = operand {
            if memory.writeback && memory.base.as_ref().map(|base| profile.is_stack_pointer(base)).unwrap_or(false) {
                state.shift_stack(memory.displacement);
            }
        }
    }
    // Post-indexed AArch64 addressing: `ldp x29, x30, [sp], #0x10`
    if let [.., Operand::Memory(memory), Operand::Immediate(increment)] = &operands[..] {
        let is_load_store = matches!(
            instruction.mnemonic,
            Mnemonic::Ldr | Mnemonic::Ldp | Mnemonic::Str | Mnemonic::Stp
        );
        if is_load_store && memory.base.as_ref().map(|base| profile.is_stack_pointer(base)).unwrap_or(false) {
            state.shift_stack(*increment as i64);
        }
    }
    match instruction.mnemonic {
        Mnemonic::Push => state.shift_stack(-pointer_size),
        Mnemonic::Pop => {
            state.shift_stack(pointer_size);
            if let Some(register) = operands.first().and_then(Operand::as_register) {
                if profile.is_frame_pointer(register) {
                    state.frame_base = None;
                }
            }
        }
        Mnemonic::Sub | Mnemonic::Add if is_sp(0) => {
            let amount = if operands.len() == 3 && is_sp(1) {
                immediate(2)
            } else {
                immediate(1)
            };
            if let Some(amount) = amount {
                if instruction.mnemonic == Mnemonic::Sub {
                    state.stack_delta = state.stack_delta.and_then(|delta| delta.checked_sub(amount));
                } else {
                    state.shift_stack(amount);
                }
            }
        }
        Mnemonic::Mov if is_sp(1) => {
            if let Some(register) = operands.first().and_then(Operand::as_register) {
                if profile.is_frame_pointer(register) {
                    state.frame_base = state.stack_delta;
                }
            }
        }
        Mnemonic::Mov if is_sp(0) => {
            // `mov rsp, rbp` restores the stack pointer from the frame.
            if let Some(register) = operands.get(1).and_then(Operand::as_register) {
                if let (true, Some(frame_base)) = (profile.is_frame_pointer(register), state.frame_base) {
                    state.stack_delta = Some(frame_base);
                }
            }
        }
        Mnemonic::Add if is_sp(1) => {
            if let Some(register) = operands.first().and_then(Operand::as_register) {
                if profile.is_frame_pointer(register) {
                    state.frame_base = state
                        .stack_delta
                        .and_then(|delta| delta.checked_add(immediate(2).unwrap_or(0)));
                }
            }
        }
        Mnemonic::Other(ref name) if name == "leave" => {
            if let Some(frame_base) = state.frame_base {
                state.stack_delta = frame_base.checked_add(pointer_size);
                state.frame_base = None;
            }
        }
        _ => (),
    }
    state
}
