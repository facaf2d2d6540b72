use crate::prelude::*;
use derive_more::Display;

/// A CPU register, identified by its lower-case name.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord, Display)]
#[serde(from = "String", into = "String")]
pub struct Register(String);

impl From<String> for Register {
    fn from(name: String) -> Register {
        Register::new(name)
    }
}

impl From<Register> for String {
    fn from(register: Register) -> String {
        register.0
    }
}

impl Register {
    /// Create a register from its (case-insensitive) name.
    pub fn new(name: impl AsRef<str>) -> Register {
        Register(name.as_ref().to_ascii_lowercase())
    }

    /// The name of the register.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Return the full-width register that this register is a part of.
    ///
    /// E.g. `eax`, `ax` and `al` all belong to the family `rax`
    /// and the AArch64 registers `w8` and `x8` belong to the family `x8`.
    pub fn family(&self) -> Register {
        Register(family_name(&self.0))
    }

    /// Returns `true` if both registers belong to the same register family.
    pub fn same_family(&self, other: &Register) -> bool {
        family_name(&self.0) == family_name(&other.0)
    }

    /// The width of the register in bytes.
    pub fn byte_width(&self) -> u64 {
        let name = self.0.as_str();
        match name {
            "al" | "bl" | "cl" | "dl" | "ah" | "bh" | "ch" | "dh" | "sil" | "dil" | "spl"
            | "bpl" => 1,
            "ax" | "bx" | "cx" | "dx" | "si" | "di" | "bp" => 2,
            "sp" | "xzr" | "fp" | "lr" => 8,
            "wsp" | "wzr" => 4,
            _ if name.starts_with('e') => 4,
            _ if name.starts_with('w') => 4,
            _ if name.starts_with("r") && name[1..].starts_with(|c: char| c.is_ascii_digit()) => {
                match name.chars().last() {
                    Some('d') => 4,
                    Some('w') => 2,
                    Some('b') => 1,
                    _ => 8,
                }
            }
            _ => 8,
        }
    }

    /// Returns `true` for the AArch64 zero registers.
    pub fn is_zero_register(&self) -> bool {
        matches!(self.0.as_str(), "xzr" | "wzr")
    }
}

/// Compute the name of the register family of the given register name.
fn family_name(name: &str) -> String {
    let family = match name {
        "al" | "ah" | "ax" | "eax" | "rax" => "rax",
        "bl" | "bh" | "bx" | "ebx" | "rbx" => "rbx",
        "cl" | "ch" | "cx" | "ecx" | "rcx" => "rcx",
        "dl" | "dh" | "dx" | "edx" | "rdx" => "rdx",
        "sil" | "si" | "esi" | "rsi" => "rsi",
        "dil" | "di" | "edi" | "rdi" => "rdi",
        "bpl" | "bp" | "ebp" | "rbp" => "rbp",
        "spl" | "esp" | "rsp" => "rsp",
        "sp" | "wsp" => "sp",
        "ip" | "eip" | "rip" => "rip",
        "wzr" | "xzr" => "xzr",
        "fp" => "x29",
        "lr" => "x30",
        _ => {
            if let Some(number) = name.strip_prefix('r') {
                let digits = number.trim_end_matches(['d', 'w', 'b']);
                if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                    return format!("r{}", digits);
                }
            }
            if let Some(number) = name.strip_prefix('w') {
                if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
                    return format!("x{}", number);
                }
            }
            name
        }
    };
    family.to_string()
}

/// The mnemonic of an instruction.
///
/// Only mnemonics with a meaning for the analyses get their own variant,
/// all other mnemonics are kept as [`Mnemonic::Other`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
#[serde(from = "String", into = "String")]
pub enum Mnemonic {
    Mov,
    Lea,
    Push,
    Pop,
    Call,
    Jmp,
    /// A conditional jump on x86, e.g. `jbe`.
    Jcc(String),
    Ret,
    Cmp,
    Test,
    Xor,
    Add,
    Sub,
    Ldr,
    Str,
    Ldp,
    Stp,
    Adr,
    Adrp,
    Bl,
    Blr,
    Br,
    B,
    /// A conditional branch on AArch64, e.g. `b.hi`.
    BCond(String),
    Cbz,
    Cbnz,
    Sidt,
    Other(String),
}

impl From<String> for Mnemonic {
    fn from(name: String) -> Mnemonic {
        Mnemonic::from(name.as_str())
    }
}

impl From<&str> for Mnemonic {
    fn from(name: &str) -> Mnemonic {
        let name = name.to_ascii_lowercase();
        match name.as_str() {
            "mov" | "movabs" | "movq" | "movd" => Mnemonic::Mov,
            "lea" => Mnemonic::Lea,
            "push" => Mnemonic::Push,
            "pop" => Mnemonic::Pop,
            "call" => Mnemonic::Call,
            "jmp" => Mnemonic::Jmp,
            "ret" | "retn" | "retf" => Mnemonic::Ret,
            "cmp" => Mnemonic::Cmp,
            "test" => Mnemonic::Test,
            "xor" => Mnemonic::Xor,
            "add" => Mnemonic::Add,
            "sub" => Mnemonic::Sub,
            "ldr" | "ldur" => Mnemonic::Ldr,
            "str" | "stur" => Mnemonic::Str,
            "ldp" => Mnemonic::Ldp,
            "stp" => Mnemonic::Stp,
            "adr" => Mnemonic::Adr,
            "adrp" => Mnemonic::Adrp,
            "bl" => Mnemonic::Bl,
            "blr" => Mnemonic::Blr,
            "br" => Mnemonic::Br,
            "b" => Mnemonic::B,
            "cbz" => Mnemonic::Cbz,
            "cbnz" => Mnemonic::Cbnz,
            "sidt" => Mnemonic::Sidt,
            _ if name.starts_with("b.") => Mnemonic::BCond(name),
            _ if name.starts_with('j') => Mnemonic::Jcc(name),
            _ => Mnemonic::Other(name),
        }
    }
}

impl From<Mnemonic> for String {
    fn from(mnemonic: Mnemonic) -> String {
        match mnemonic {
            Mnemonic::Jcc(name) | Mnemonic::BCond(name) | Mnemonic::Other(name) => name,
            named => format!("{:?}", named).to_ascii_lowercase(),
        }
    }
}

impl Mnemonic {
    /// Returns `true` for direct and indirect calls.
    pub fn is_call(&self) -> bool {
        matches!(self, Mnemonic::Call | Mnemonic::Bl | Mnemonic::Blr)
    }

    /// Returns `true` for conditional branches.
    pub fn is_conditional_branch(&self) -> bool {
        matches!(
            self,
            Mnemonic::Jcc(_) | Mnemonic::BCond(_) | Mnemonic::Cbz | Mnemonic::Cbnz
        )
    }

    /// Returns `true` for unconditional jumps that are not calls.
    pub fn is_unconditional_jump(&self) -> bool {
        matches!(self, Mnemonic::Jmp | Mnemonic::B | Mnemonic::Br)
    }

    /// Returns `true` for return instructions.
    pub fn is_return(&self) -> bool {
        matches!(self, Mnemonic::Ret)
    }
}

/// A memory operand of the form `[base + index * scale + displacement]`.
///
/// An operand without base and index register denotes an absolute address.
/// A RIP-relative operand has `rip` as its base register
/// and is relative to the address of the next instruction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord, Default)]
pub struct MemoryOperand {
    #[serde(default)]
    pub base: Option<Register>,
    #[serde(default)]
    pub index: Option<Register>,
    /// The scale of the index register. Zero is treated as one.
    #[serde(default)]
    pub scale: u8,
    #[serde(default)]
    pub displacement: i64,
    /// The accessed number of bytes, zero if unknown.
    #[serde(default)]
    pub size: u8,
    /// Set for AArch64 pre-indexed addressing (`[sp, #-0x10]!`),
    /// which writes the computed address back to the base register.
    #[serde(default)]
    pub writeback: bool,
}

impl MemoryOperand {
    /// A memory operand referencing an absolute address.
    pub fn absolute(address: u64) -> MemoryOperand {
        MemoryOperand {
            displacement: address as i64,
            ..Default::default()
        }
    }

    /// A memory operand `[base + displacement]`.
    pub fn based(base: &str, displacement: i64) -> MemoryOperand {
        MemoryOperand {
            base: Some(Register::new(base)),
            displacement,
            ..Default::default()
        }
    }

    /// Set the access size of the operand.
    pub fn with_size(mut self, size: u8) -> MemoryOperand {
        self.size = size;
        self
    }

    /// Return the absolute address referenced by the operand if it does not depend on register values.
    /// RIP-relative operands are resolved relative to `next_address`.
    pub fn absolute_address(&self, next_address: u64) -> Option<u64> {
        if self.index.is_some() {
            return None;
        }
        match &self.base {
            None => Some(self.displacement as u64),
            Some(base) if base.family().name() == "rip" => {
                Some(next_address.wrapping_add(self.displacement as u64))
            }
            Some(_) => None,
        }
    }
}

/// An instruction operand.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub enum Operand {
    Register(Register),
    Immediate(u64),
    Memory(MemoryOperand),
    /// A code or data address, e.g. the target of a direct call.
    Address(u64),
}

impl Operand {
    /// Shorthand for a register operand.
    pub fn register(name: &str) -> Operand {
        Operand::Register(Register::new(name))
    }

    /// Return the register if the operand is a register operand.
    pub fn as_register(&self) -> Option<&Register> {
        match self {
            Operand::Register(register) => Some(register),
            _ => None,
        }
    }

    /// Return the memory operand if the operand is a memory operand.
    pub fn as_memory(&self) -> Option<&MemoryOperand> {
        match self {
            Operand::Memory(memory) => Some(memory),
            _ => None,
        }
    }
}

/// The statically resolved value of an operand.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub enum ResolvedOperand {
    Value(u64),
    Address(u64),
    Register(Register),
}

/// A decoded machine instruction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct Instruction {
    pub address: u64,
    /// The length of the instruction in bytes.
    pub size: u64,
    pub mnemonic: Mnemonic,
    #[serde(default)]
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(address: u64, size: u64, mnemonic: Mnemonic, operands: Vec<Operand>) -> Instruction {
        Instruction {
            address,
            size,
            mnemonic,
            operands,
        }
    }

    /// The address of the instruction following this one.
    pub fn next_address(&self) -> u64 {
        self.address + self.size
    }

    pub fn operand(&self, index: usize) -> Option<&Operand> {
        self.operands.get(index)
    }

    /// The target of a direct call or branch.
    pub fn branch_target(&self) -> Option<u64> {
        if !(self.mnemonic.is_call()
            || self.mnemonic.is_conditional_branch()
            || self.mnemonic.is_unconditional_jump())
        {
            return None;
        }
        match self.operands.last()? {
            Operand::Address(target) | Operand::Immediate(target) => Some(*target),
            _ => None,
        }
    }

    /// Resolve the operand at the given index to an immediate value, an address or a register.
    ///
    /// Memory operands are only resolved if they reference an absolute (or RIP-relative) address.
    pub fn resolve_operand(&self, index: usize) -> Option<ResolvedOperand> {
        match self.operands.get(index)? {
            Operand::Immediate(value) => Some(ResolvedOperand::Value(*value)),
            Operand::Address(address) => Some(ResolvedOperand::Address(*address)),
            Operand::Register(register) => Some(ResolvedOperand::Register(register.clone())),
            Operand::Memory(memory) => memory
                .absolute_address(self.next_address())
                .map(ResolvedOperand::Address),
        }
    }

    /// All statically known addresses that the instruction references, used to derive cross references.
    pub fn referenced_addresses(&self) -> Vec<u64> {
        let mut addresses = Vec::new();
        for operand in &self.operands {
            match operand {
                Operand::Address(address) => addresses.push(*address),
                Operand::Memory(memory) => {
                    if let Some(address) = memory.absolute_address(self.next_address()) {
                        addresses.push(address)
                    }
                }
                Operand::Immediate(value) if matches!(self.mnemonic, Mnemonic::Push | Mnemonic::Mov) => {
                    addresses.push(*value)
                }
                _ => (),
            }
        }
        addresses
    }
}
