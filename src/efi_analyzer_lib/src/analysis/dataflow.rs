//! A bounded backward tracer recovering the values of call arguments,
//! and helpers reading firmware data from the module image.
//!
//! The tracer walks the instructions of a function backwards in address order
//! and follows simple register and stack slot copies until it finds the instruction that produced the value.
//! It never follows branches, so the result is the value on the fall-through path
//! that is closest to the queried instruction.

use super::{ArchProfile, FunctionBody, Location};
use crate::intermediate_representation::{BinaryFacts, Mnemonic};
use crate::prelude::*;
use crate::uefi::Guid;

/// A statically recovered value.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Value {
    /// An immediate value. May still denote an address, e.g. on 32-bit x86.
    Constant(u64),
    /// An address computed by `lea`, `adr` or `adrp`.
    Address(u64),
    /// The address of a stack slot, relative to the stack pointer at function entry.
    StackAddress(i64),
    /// The content of the global at the given address.
    Loaded(u64),
}

impl Value {
    /// The value as an address in the module image.
    pub fn as_address(&self) -> Option<u64> {
        match self {
            Value::Constant(value) | Value::Address(value) => Some(*value),
            _ => None,
        }
    }

    /// Add an offset to the value. Loaded values cannot be offset.
    fn offset(self, addend: i64) -> Option<Value> {
        match self {
            Value::Constant(value) => Some(Value::Constant(value.wrapping_add(addend as u64))),
            Value::Address(value) => Some(Value::Address(value.wrapping_add(addend as u64))),
            Value::StackAddress(slot) => slot.checked_add(addend).map(Value::StackAddress),
            Value::Loaded(_) if addend == 0 => Some(self),
            Value::Loaded(_) => None,
        }
    }
}

/// A recovered value together with the address of the instruction that produced it.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Traced {
    pub value: Value,
    pub origin: u64,
}

/// A constant written to a stack slot by a single instruction.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct StackStore {
    pub slot: i64,
    /// The number of written bytes.
    pub width: u64,
    pub value: u64,
    pub address: u64,
}

/// A GUID operand resolved to its value.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ResolvedGuid {
    pub guid: Guid,
    /// The address of the GUID in the module image,
    /// or the address of the first store instruction for GUIDs built on the stack.
    pub address: u64,
    pub on_stack: bool,
}

enum Step {
    Continue,
    Retarget(Location),
    Found(Value),
    Lost,
}

/// The backward tracer for one function.
pub struct Tracer<'a> {
    body: &'a FunctionBody,
    profile: &'a ArchProfile,
    window: usize,
}

impl<'a> Tracer<'a> {
    /// Create a tracer that looks at most `window` instructions backwards.
    pub fn new(body: &'a FunctionBody, profile: &'a ArchProfile, window: usize) -> Tracer<'a> {
        Tracer {
            body,
            profile,
            window,
        }
    }

    pub fn body(&self) -> &FunctionBody {
        self.body
    }

    /// Trace the value of an argument of the call instruction at `call_index`.
    pub fn trace_argument(&self, call_index: usize, argument: usize) -> Option<Traced> {
        let location = self.body.call_argument(call_index, argument, self.profile)?;
        self.trace(call_index, location)
    }

    /// Trace the value held by `target` right before the instruction at `before`.
    pub fn trace(&self, before: usize, target: Location) -> Option<Traced> {
        let mut target = target;
        let mut addend: i64 = 0;
        let end = before.min(self.body.len());
        let start = end.saturating_sub(self.window);
        for index in (start..end).rev() {
            match self.step(index, &target, &mut addend) {
                Step::Continue => (),
                Step::Retarget(location) => target = location,
                Step::Found(value) => {
                    return value.offset(addend).map(|value| Traced {
                        value,
                        origin: self.body.instructions[index].address,
                    })
                }
                Step::Lost => return None,
            }
        }
        None
    }

    /// The location written by the operand of the instruction at `index`.
    fn location(&self, index: usize, operand: Option<&Operand>) -> Option<Location> {
        self.body
            .operand_location(index, operand?, self.profile)
    }

    fn step(&self, index: usize, target: &Location, addend: &mut i64) -> Step {
        let instruction = &self.body.instructions[index];
        let operands = &instruction.operands;
        let writes_target = |operand: usize| self.location(index, operands.get(operand)).as_ref() == Some(target);
        match &instruction.mnemonic {
            mnemonic if mnemonic.is_call() => match target {
                Location::Register(register) if self.profile.is_volatile(register) => Step::Lost,
                _ => Step::Continue,
            },
            Mnemonic::Push => {
                let slot = self
                    .body
                    .stack_delta(index)
                    .and_then(|delta| delta.checked_sub(self.profile.pointer_size as i64))
                    .map(Location::Stack);
                match operands.first() {
                    Some(source) if slot.as_ref() == Some(target) => self.source(index, source),
                    _ => Step::Continue,
                }
            }
            Mnemonic::Mov | Mnemonic::Ldr if writes_target(0) => match operands.get(1) {
                Some(source) => self.source(index, source),
                None => Step::Lost,
            },
            Mnemonic::Str if writes_target(1) => match operands.first() {
                Some(source) => self.source(index, source),
                None => Step::Lost,
            },
            Mnemonic::Stp => {
                let first = self.location(index, operands.get(2));
                let width = operands
                    .first()
                    .and_then(Operand::as_register)
                    .map(|register| register.byte_width() as i64)
                    .unwrap_or(self.profile.pointer_size as i64);
                match (first, operands.first(), operands.get(1)) {
                    (Some(location), Some(source), _) if location == *target => self.source(index, source),
                    (Some(Location::Stack(slot)), _, Some(source))
                        if slot.checked_add(width).map(Location::Stack).as_ref() == Some(target) =>
                    {
                        self.source(index, source)
                    }
                    _ => Step::Continue,
                }
            }
            Mnemonic::Ldp => {
                let first = self.location(index, operands.get(2));
                let width = operands
                    .first()
                    .and_then(Operand::as_register)
                    .map(|register| register.byte_width() as i64)
                    .unwrap_or(self.profile.pointer_size as i64);
                if writes_target(0) {
                    first.map(Step::Retarget).unwrap_or(Step::Lost)
                } else if writes_target(1) {
                    match first {
                        Some(Location::Stack(slot)) => match slot.checked_add(width) {
                            Some(slot) => Step::Retarget(Location::Stack(slot)),
                            None => Step::Lost,
                        },
                        Some(Location::Global(address)) => {
                            Step::Found(Value::Loaded(address.wrapping_add(width as u64)))
                        }
                        _ => Step::Lost,
                    }
                } else {
                    Step::Continue
                }
            }
            Mnemonic::Lea if writes_target(0) => {
                let Some(memory) = operands.get(1).and_then(Operand::as_memory) else {
                    return Step::Lost;
                };
                if let Some(address) = memory.absolute_address(instruction.next_address()) {
                    return Step::Found(Value::Address(address));
                }
                match self.body.normalize(index, memory, self.profile) {
                    Some(Location::Stack(slot)) => Step::Found(Value::StackAddress(slot)),
                    _ => match (&memory.base, &memory.index) {
                        (Some(base), None) if !self.profile.is_stack_pointer(base) => {
                            match addend.checked_add(memory.displacement) {
                                Some(sum) => {
                                    *addend = sum;
                                    Step::Retarget(Location::register(base))
                                }
                                None => Step::Lost,
                            }
                        }
                        _ => Step::Lost,
                    },
                }
            }
            Mnemonic::Adr | Mnemonic::Adrp if writes_target(0) => match operands.get(1) {
                Some(Operand::Address(address)) | Some(Operand::Immediate(address)) => {
                    Step::Found(Value::Address(*address))
                }
                _ => Step::Lost,
            },
            Mnemonic::Add | Mnemonic::Sub if writes_target(0) => {
                let (source, value) = match (operands.len(), operands.get(1), operands.get(2)) {
                    (3, Some(Operand::Register(source)), Some(Operand::Immediate(value))) => (Some(source), *value),
                    (2, Some(Operand::Immediate(value)), _) => (None, *value),
                    _ => return Step::Lost,
                };
                let shifted = if instruction.mnemonic == Mnemonic::Add {
                    addend.checked_add(value as i64)
                } else {
                    addend.checked_sub(value as i64)
                };
                let Some(shifted) = shifted else {
                    return Step::Lost;
                };
                *addend = shifted;
                match source {
                    None => Step::Continue,
                    Some(source) if self.profile.is_stack_pointer(source) => match self.body.stack_delta(index) {
                        Some(delta) => Step::Found(Value::StackAddress(delta)),
                        None => Step::Lost,
                    },
                    Some(source) => Step::Retarget(Location::register(source)),
                }
            }
            Mnemonic::Xor if writes_target(0) => match (operands.first(), operands.get(1)) {
                (Some(Operand::Register(first)), Some(Operand::Register(second)))
                    if first.same_family(second) =>
                {
                    Step::Found(Value::Constant(0))
                }
                _ => Step::Lost,
            },
            Mnemonic::Cmp
            | Mnemonic::Test
            | Mnemonic::Jcc(_)
            | Mnemonic::BCond(_)
            | Mnemonic::Cbz
            | Mnemonic::Cbnz
            | Mnemonic::Jmp
            | Mnemonic::B
            | Mnemonic::Br
            | Mnemonic::Ret
            | Mnemonic::Str
            | Mnemonic::Mov
            | Mnemonic::Ldr
            | Mnemonic::Lea
            | Mnemonic::Adr
            | Mnemonic::Adrp
            | Mnemonic::Add
            | Mnemonic::Sub
            | Mnemonic::Xor => Step::Continue,
            _ if writes_target(0) => Step::Lost,
            _ => Step::Continue,
        }
    }

    /// The step for a value copied from `source` by the instruction at `index`.
    fn source(&self, index: usize, source: &Operand) -> Step {
        match source {
            Operand::Immediate(value) => Step::Found(Value::Constant(*value)),
            Operand::Address(address) => Step::Found(Value::Address(*address)),
            Operand::Register(register) if register.is_zero_register() => Step::Found(Value::Constant(0)),
            Operand::Register(register) if self.profile.is_stack_pointer(register) => {
                match self.body.stack_delta(index) {
                    Some(delta) => Step::Found(Value::StackAddress(delta)),
                    None => Step::Lost,
                }
            }
            Operand::Register(register) => Step::Retarget(Location::register(register)),
            Operand::Memory(memory) => match self.body.normalize(index, memory, self.profile) {
                Some(Location::Global(address)) => Step::Found(Value::Loaded(address)),
                Some(location) => Step::Retarget(location),
                None => Step::Lost,
            },
        }
    }

    /// The constants written to stack slots by the instruction at `index`.
    pub fn stack_stores(&self, index: usize) -> Vec<StackStore> {
        let Some(instruction) = self.body.instructions.get(index) else {
            return Vec::new();
        };
        let operands = &instruction.operands;
        let pointer_size = self.profile.pointer_size;
        let mut stores = Vec::new();
        let mut push_store = |slot: i64, width: u64, source: &Operand| {
            let value = match source {
                Operand::Immediate(value) => Some(*value),
                Operand::Register(register) if register.is_zero_register() => Some(0),
                Operand::Register(register) => match self.trace(index, Location::register(register)) {
                    Some(Traced {
                        value: Value::Constant(value),
                        ..
                    }) => Some(value),
                    _ => None,
                },
                _ => None,
            };
            if let Some(value) = value {
                stores.push(StackStore {
                    slot,
                    width,
                    value,
                    address: instruction.address,
                });
            }
        };
        let register_width = |operand: Option<&Operand>| {
            operand
                .and_then(Operand::as_register)
                .map(Register::byte_width)
        };
        match instruction.mnemonic {
            Mnemonic::Mov => {
                if let (Some(Operand::Memory(memory)), Some(source)) = (operands.first(), operands.get(1)) {
                    if let Some(Location::Stack(slot)) = self.body.normalize(index, memory, self.profile) {
                        let width = match memory.size {
                            0 => register_width(Some(source)).unwrap_or(pointer_size),
                            size => size as u64,
                        };
                        push_store(slot, width, source);
                    }
                }
            }
            Mnemonic::Str => {
                if let (Some(source), Some(Operand::Memory(memory))) = (operands.first(), operands.get(1)) {
                    if let Some(Location::Stack(slot)) = self.body.normalize(index, memory, self.profile) {
                        let width = register_width(Some(source)).unwrap_or(pointer_size);
                        push_store(slot, width, source);
                    }
                }
            }
            Mnemonic::Stp => {
                if let (Some(first), Some(second), Some(Operand::Memory(memory))) =
                    (operands.first(), operands.get(1), operands.get(2))
                {
                    if let Some(Location::Stack(slot)) = self.body.normalize(index, memory, self.profile) {
                        let width = register_width(Some(first)).unwrap_or(pointer_size);
                        push_store(slot, width, first);
                        if let Some(next) = slot.checked_add(width as i64) {
                            push_store(next, width, second);
                        }
                    }
                }
            }
            _ => (),
        }
        stores
    }

    /// Rebuild a GUID assembled in the stack slot `slot` by immediate stores before the instruction at `before`.
    pub fn reconstruct_stack_guid(&self, before: usize, slot: i64) -> Option<ResolvedGuid> {
        let mut bytes: [Option<u8>; 16] = [None; 16];
        let mut first_store = None;
        let end = before.min(self.body.len());
        for index in (end.saturating_sub(self.window)..end).rev() {
            for store in self.stack_stores(index) {
                if fill_bytes(&mut bytes, &store, slot, false) {
                    first_store = Some(store.address);
                }
            }
            if bytes.iter().all(Option::is_some) {
                break;
            }
        }
        let guid = guid_from_partial_bytes(&bytes)?;
        Some(ResolvedGuid {
            guid,
            address: first_store?,
            on_stack: true,
        })
    }
}

/// Write the bytes of `store` that fall into the 16 bytes starting at `slot`.
/// Existing bytes are only overwritten if `overwrite` is set.
/// Returns `true` if at least one byte was written.
pub(crate) fn fill_bytes(bytes: &mut [Option<u8>; 16], store: &StackStore, slot: i64, overwrite: bool) -> bool {
    let mut written = false;
    for byte_index in 0..store.width.min(8) {
        let position = store
            .slot
            .checked_add(byte_index as i64)
            .and_then(|position| position.checked_sub(slot));
        if let Some(position) = position.filter(|position| (0..16).contains(position)) {
            let entry = &mut bytes[position as usize];
            if overwrite || entry.is_none() {
                *entry = Some((store.value >> (8 * byte_index)) as u8);
                written = true;
            }
        }
    }
    written
}

/// Build a GUID if all 16 bytes are known.
pub(crate) fn guid_from_partial_bytes(bytes: &[Option<u8>; 16]) -> Option<Guid> {
    let bytes: Vec<u8> = bytes.iter().copied().collect::<Option<Vec<u8>>>()?;
    Guid::from_bytes(&bytes)
}

/// Read a little-endian pointer of the given size.
pub fn read_pointer(facts: &dyn BinaryFacts, address: u64, pointer_size: u64) -> Option<u64> {
    let bytes = facts.read_bytes(address, pointer_size as usize)?;
    let mut buffer = [0u8; 8];
    buffer[..bytes.len()].copy_from_slice(&bytes);
    Some(u64::from_le_bytes(buffer))
}

/// Read the GUID at the given address.
pub fn read_guid(facts: &dyn BinaryFacts, address: u64) -> Option<Guid> {
    Guid::from_bytes(&facts.read_bytes(address, 16)?)
}

/// Read a NUL-terminated UTF-16 string of at most `max_characters` characters.
/// Returns `None` for empty strings, missing terminators and invalid UTF-16.
pub fn read_utf16_string(facts: &dyn BinaryFacts, address: u64, max_characters: usize) -> Option<String> {
    let mut units = Vec::new();
    for index in 0..=max_characters as u64 {
        let bytes = facts.read_bytes(address + 2 * index, 2)?;
        let unit = u16::from_le_bytes([bytes[0], bytes[1]]);
        if unit == 0 {
            return if units.is_empty() {
                None
            } else {
                String::from_utf16(&units).ok()
            };
        }
        units.push(unit);
    }
    None
}

/// Resolve a traced GUID pointer to the GUID value.
///
/// Pointers into the module image are read directly,
/// stack addresses are resolved by rebuilding the GUID from the stores preceding the instruction at `before`,
/// loaded globals are dereferenced once.
pub fn resolve_guid(
    facts: &dyn BinaryFacts,
    tracer: &Tracer,
    before: usize,
    traced: &Traced,
) -> Option<ResolvedGuid> {
    match traced.value {
        Value::Constant(address) | Value::Address(address) => {
            read_guid(facts, address).map(|guid| ResolvedGuid {
                guid,
                address,
                on_stack: false,
            })
        }
        Value::StackAddress(slot) => tracer.reconstruct_stack_guid(before, slot),
        Value::Loaded(global) => {
            let address = read_pointer(facts, global, tracer.body().pointer_size())?;
            read_guid(facts, address).map(|guid| ResolvedGuid {
                guid,
                address,
                on_stack: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AARCH64_PROFILE, X64_PROFILE, X86_PROFILE};
    use crate::intermediate_representation::Function;
    use crate::insns;

    fn body(profile: &ArchProfile, instructions: Vec<Instruction>) -> FunctionBody {
        let start = instructions[0].address;
        let end = instructions.last().unwrap().next_address();
        FunctionBody::from_instructions(Function::new(start, end), instructions, profile, false)
    }

    #[test]
    fn trace_x64_arguments() {
        let body = body(
            &X64_PROFILE,
            insns![
                "0x1000: sub rsp, 0x48",
                "0x1004: lea rdx, [rip+0x1ff9]",
                "0x100b: mov rcx, rdx",
                "0x100e: lea r8, [rsp+0x30]",
                "0x1013: xor r9d, r9d",
                "0x1016: mov qword ptr [rsp+0x20], 0x12",
                "0x101f: call qword ptr [rax+0x140]",
            ],
        );
        let tracer = Tracer::new(&body, &X64_PROFILE, 64);
        assert_eq!(
            tracer.trace_argument(6, 0),
            Some(Traced {
                value: Value::Address(0x3004),
                origin: 0x1004
            })
        );
        assert_eq!(
            tracer.trace_argument(6, 2).unwrap().value,
            Value::StackAddress(-0x18)
        );
        assert_eq!(tracer.trace_argument(6, 3).unwrap().value, Value::Constant(0));
        assert_eq!(tracer.trace_argument(6, 4).unwrap().value, Value::Constant(0x12));
        assert_eq!(tracer.trace_argument(6, 5), None);
    }

    #[test]
    fn call_clobbers_volatile_registers() {
        let body = body(
            &X64_PROFILE,
            insns![
                "0x1000: lea rcx, [0x3000]",
                "0x1007: lea rbx, [0x3010]",
                "0x100e: call 0x2000",
                "0x1013: call 0x2000",
            ],
        );
        let tracer = Tracer::new(&body, &X64_PROFILE, 64);
        assert_eq!(tracer.trace_argument(3, 0), None);
        assert_eq!(
            tracer.trace(3, Location::register(&Register::new("rbx"))).unwrap().value,
            Value::Address(0x3010)
        );
    }

    #[test]
    fn out_of_range_addend_is_lost() {
        let body = body(
            &X64_PROFILE,
            insns![
                "0x1000: lea rcx, [0x3000]",
                "0x1007: add rcx, 0x7fffffffffffffff",
                "0x100e: add rcx, 0x7fffffffffffffff",
                "0x1015: call qword ptr [rax+0x140]",
                "0x101b: lea rdx, [0x3000]",
                "0x1022: sub rdx, 0x10",
                "0x1026: call qword ptr [rax+0x140]",
            ],
        );
        let tracer = Tracer::new(&body, &X64_PROFILE, 64);
        assert_eq!(tracer.trace_argument(3, 0), None);
        assert_eq!(tracer.trace_argument(6, 1).unwrap().value, Value::Address(0x2ff0));
    }

    #[test]
    fn unknown_stack_offset_is_lost() {
        let body = body(
            &X64_PROFILE,
            insns![
                "0x1000: sub rsp, 0x5000000000000000",
                "0x1007: sub rsp, 0x5000000000000000",
                "0x100e: mov qword ptr [rsp+0x20], 0x12",
                "0x1017: lea rdx, [rsp+0x30]",
                "0x101c: mov r8, rsp",
                "0x101f: call qword ptr [rax+0x140]",
            ],
        );
        let tracer = Tracer::new(&body, &X64_PROFILE, 64);
        assert_eq!(tracer.trace_argument(5, 1), None);
        assert_eq!(tracer.trace_argument(5, 2), None);
        assert_eq!(tracer.trace_argument(5, 4), None);
        assert!(tracer.stack_stores(2).is_empty());
    }

    #[test]
    fn trace_window_is_bounded() {
        let body = body(
            &X64_PROFILE,
            insns![
                "0x1000: lea rcx, [0x3000]",
                "0x1007: nop",
                "0x1008: nop",
                "0x1009: call 0x2000",
            ],
        );
        assert!(Tracer::new(&body, &X64_PROFILE, 3).trace_argument(3, 0).is_some());
        assert!(Tracer::new(&body, &X64_PROFILE, 2).trace_argument(3, 0).is_none());
    }

    #[test]
    fn trace_x86_pushed_arguments() {
        let body = body(
            &X86_PROFILE,
            insns![
                "0x1000: mov eax, 0x3000",
                "0x1005: push 0x0",
                "0x1007: push eax",
                "0x1008: push esi",
                "0x1009: call dword ptr [ecx+0x20]",
            ],
        );
        let tracer = Tracer::new(&body, &X86_PROFILE, 64);
        assert_eq!(tracer.trace_argument(4, 1).unwrap().value, Value::Constant(0x3000));
        assert_eq!(tracer.trace_argument(4, 2).unwrap().value, Value::Constant(0));
        assert_eq!(tracer.trace_argument(4, 0), None);
    }

    #[test]
    fn trace_aarch64_adrp_add() {
        let body = body(
            &AARCH64_PROFILE,
            insns![
                "0x1000: adrp x0, 0x5000",
                "0x1004: add x0, x0, #0x120",
                "0x1008: add x2, sp, #0x10",
                "0x100c: blr x8",
            ],
        );
        let tracer = Tracer::new(&body, &AARCH64_PROFILE, 64);
        assert_eq!(tracer.trace_argument(3, 0).unwrap().value, Value::Address(0x5120));
        assert_eq!(tracer.trace_argument(3, 2).unwrap().value, Value::StackAddress(0x10));
    }

    #[test]
    fn rebuild_stack_guid() {
        let body = body(
            &X64_PROFILE,
            insns![
                "0x1000: sub rsp, 0x48",
                "0x1004: mov dword ptr [rsp+0x30], 0xf4ccbfb7",
                "0x100c: mov dword ptr [rsp+0x34], 0x47fdf6e0",
                "0x1014: mov rax, 0x91c150f1a810d49d",
                "0x101e: mov qword ptr [rsp+0x38], rax",
                "0x1023: lea rcx, [rsp+0x30]",
                "0x1028: call qword ptr [rbx+0xd0]",
            ],
        );
        let tracer = Tracer::new(&body, &X64_PROFILE, 64);
        let traced = tracer.trace_argument(6, 0).unwrap();
        assert_eq!(traced.value, Value::StackAddress(-0x18));
        let resolved = tracer.reconstruct_stack_guid(6, -0x18).unwrap();
        assert_eq!(resolved.guid, crate::uefi::EFI_SMM_BASE2_PROTOCOL_GUID);
        assert_eq!(resolved.address, 0x1004);
        assert!(resolved.on_stack);
    }
}
