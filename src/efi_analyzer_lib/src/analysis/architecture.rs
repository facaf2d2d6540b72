//! Architecture resolution and the calling conventions of the supported architectures.

use crate::intermediate_representation::{FileType, MachineType, ModuleInfo};
use crate::prelude::*;
use crate::uefi::ServiceTable;
use derive_more::Display;

use super::Pointer;

/// The architectures supported by the analyses.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Display)]
pub enum Architecture {
    #[display(fmt = "x86")]
    X86,
    #[display(fmt = "x64")]
    X64,
    #[display(fmt = "aarch64")]
    Aarch64,
}

/// Errors that abort the analysis of a module.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum AnalysisError {
    /// The machine type of the module is not supported.
    UnsupportedArchitecture { machine: u16 },
    /// An architecture-specific entry point was called for a module of another architecture.
    ArchitectureMismatch {
        expected: Architecture,
        found: Architecture,
    },
}

impl std::fmt::Display for AnalysisError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisError::UnsupportedArchitecture { machine } => {
                write!(formatter, "Unsupported machine type {:#06x}", machine)
            }
            AnalysisError::ArchitectureMismatch { expected, found } => write!(
                formatter,
                "Expected a module for {} but found a module for {}",
                expected, found
            ),
        }
    }
}

impl std::error::Error for AnalysisError {}

/// The location of a function argument.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ArgumentSlot {
    Register(Register),
    /// An offset relative to the stack pointer.
    Stack(i64),
}

/// The calling convention and register naming of an architecture.
#[derive(Debug, PartialEq, Eq)]
pub struct ArchProfile {
    pub architecture: Architecture,
    pub pointer_size: u64,
    /// The family name of the stack pointer.
    pub stack_pointer: &'static str,
    /// The family name of the frame pointer.
    pub frame_pointer: &'static str,
    pub return_register: &'static str,
    pub argument_registers: &'static [&'static str],
    /// Offset of the first stack argument relative to the stack pointer at the call instruction.
    pub stack_arguments_offset: i64,
    /// Set if the call instruction pushes the return address.
    pub return_address_on_stack: bool,
    /// Registers that a call may overwrite.
    pub volatile_registers: &'static [&'static str],
    /// The number of arguments that are forwarded to callees during table propagation.
    pub propagated_arguments: usize,
}

pub static X64_PROFILE: ArchProfile = ArchProfile {
    architecture: Architecture::X64,
    pointer_size: 8,
    stack_pointer: "rsp",
    frame_pointer: "rbp",
    return_register: "rax",
    argument_registers: &["rcx", "rdx", "r8", "r9"],
    stack_arguments_offset: 0x20,
    return_address_on_stack: true,
    volatile_registers: &["rax", "rcx", "rdx", "r8", "r9", "r10", "r11"],
    propagated_arguments: 4,
};

pub static X86_PROFILE: ArchProfile = ArchProfile {
    architecture: Architecture::X86,
    pointer_size: 4,
    stack_pointer: "rsp",
    frame_pointer: "rbp",
    return_register: "rax",
    argument_registers: &[],
    stack_arguments_offset: 0,
    return_address_on_stack: true,
    volatile_registers: &["rax", "rcx", "rdx"],
    propagated_arguments: 4,
};

pub static AARCH64_PROFILE: ArchProfile = ArchProfile {
    architecture: Architecture::Aarch64,
    pointer_size: 8,
    stack_pointer: "sp",
    frame_pointer: "x29",
    return_register: "x0",
    argument_registers: &["x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7"],
    stack_arguments_offset: 0,
    return_address_on_stack: false,
    volatile_registers: &[
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x30",
    ],
    propagated_arguments: 4,
};

impl ArchProfile {
    /// The location of an argument at the call instruction.
    pub fn argument_at_call(&self, index: usize) -> ArgumentSlot {
        match self.argument_registers.get(index) {
            Some(register) => ArgumentSlot::Register(Register::new(register)),
            None => {
                let stack_index = (index - self.argument_registers.len()) as i64;
                ArgumentSlot::Stack(
                    self.stack_arguments_offset + stack_index * self.pointer_size as i64,
                )
            }
        }
    }

    /// The location of an argument at the entry of the called function.
    pub fn argument_at_entry(&self, index: usize) -> ArgumentSlot {
        match self.argument_at_call(index) {
            ArgumentSlot::Stack(offset) if self.return_address_on_stack => {
                ArgumentSlot::Stack(offset + self.pointer_size as i64)
            }
            slot => slot,
        }
    }

    pub fn is_volatile(&self, register: &Register) -> bool {
        let family = register.family();
        self.volatile_registers
            .iter()
            .any(|name| *name == family.name())
    }

    pub fn is_stack_pointer(&self, register: &Register) -> bool {
        register.family().name() == self.stack_pointer
    }

    pub fn is_frame_pointer(&self, register: &Register) -> bool {
        register.family().name() == self.frame_pointer
    }

    pub fn return_register(&self) -> Register {
        Register::new(self.return_register)
    }
}

/// The architecture-specific strategy used to analyze a module.
///
/// Each strategy provides the calling convention of its architecture
/// and the firmware pointers known at the module entry point.
/// The pipeline stages are implemented once and parameterized by the strategy.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Strategy {
    X86,
    X64,
    Aarch64,
}

impl Strategy {
    /// Select the strategy for the machine type of the module.
    pub fn resolve(info: &ModuleInfo) -> Result<Strategy, AnalysisError> {
        match info.machine {
            MachineType::I386 => Ok(Strategy::X86),
            MachineType::Amd64 => Ok(Strategy::X64),
            MachineType::Arm64 => Ok(Strategy::Aarch64),
            MachineType::Other(machine) => Err(AnalysisError::UnsupportedArchitecture { machine }),
        }
    }

    pub fn architecture(&self) -> Architecture {
        self.profile().architecture
    }

    pub fn profile(&self) -> &'static ArchProfile {
        match self {
            Strategy::X86 => &X86_PROFILE,
            Strategy::X64 => &X64_PROFILE,
            Strategy::Aarch64 => &AARCH64_PROFILE,
        }
    }

    /// Returns `true` if SMM modules of this architecture can locate the SMST
    /// by matching calls through unresolved globals against the SMST layout.
    pub fn supports_smst_post_processing(&self) -> bool {
        matches!(self, Strategy::X64)
    }

    /// Returns `true` if PEI modules of this architecture obtain the PEI services
    /// through a getter reading the pointer stored below the IDT.
    pub fn supports_pei_services_getter(&self) -> bool {
        matches!(self, Strategy::X86)
    }

    /// The firmware pointers passed as arguments to a module entry point.
    pub fn entry_arguments(&self, file_type: FileType) -> Vec<(usize, Pointer)> {
        match file_type {
            FileType::Pei => vec![(1, Pointer::TablePointer(ServiceTable::PeiServices))],
            FileType::Dxe | FileType::Smm | FileType::Unknown => vec![
                (0, Pointer::ImageHandle),
                (1, Pointer::Table(ServiceTable::SystemTable)),
            ],
        }
    }

    /// Guess the file type of a module whose type is unknown.
    ///
    /// 32-bit x86 modules are PEI modules, all other modules are DXE drivers
    /// unless they reference one of the SMM marker GUIDs.
    pub fn infer_file_type(&self, has_smm_markers: bool) -> FileType {
        match self {
            Strategy::X86 => FileType::Pei,
            _ if has_smm_markers => FileType::Smm,
            _ => FileType::Dxe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_slots() {
        assert_eq!(
            X64_PROFILE.argument_at_call(1),
            ArgumentSlot::Register(Register::new("rdx"))
        );
        assert_eq!(X64_PROFILE.argument_at_call(4), ArgumentSlot::Stack(0x20));
        assert_eq!(X64_PROFILE.argument_at_call(5), ArgumentSlot::Stack(0x28));
        assert_eq!(X64_PROFILE.argument_at_entry(4), ArgumentSlot::Stack(0x28));
        assert_eq!(X86_PROFILE.argument_at_call(1), ArgumentSlot::Stack(4));
        assert_eq!(X86_PROFILE.argument_at_entry(1), ArgumentSlot::Stack(8));
        assert_eq!(
            AARCH64_PROFILE.argument_at_entry(7),
            ArgumentSlot::Register(Register::new("x7"))
        );
        assert_eq!(AARCH64_PROFILE.argument_at_call(8), ArgumentSlot::Stack(0));
        assert!(X64_PROFILE.is_volatile(&Register::new("r8d")));
        assert!(!X64_PROFILE.is_volatile(&Register::new("rbx")));
        assert!(AARCH64_PROFILE.is_volatile(&Register::new("w9")));
    }

    #[test]
    fn strategy_resolution() {
        let mut info = ModuleInfo::new(MachineType::Arm64);
        assert_eq!(Strategy::resolve(&info), Ok(Strategy::Aarch64));
        info.machine = MachineType::from_coff(0x01c4);
        assert_eq!(
            Strategy::resolve(&info),
            Err(AnalysisError::UnsupportedArchitecture { machine: 0x01c4 })
        );
        assert_eq!(Strategy::X86.infer_file_type(true), FileType::Pei);
        assert_eq!(Strategy::X64.infer_file_type(true), FileType::Smm);
        assert_eq!(Strategy::Aarch64.infer_file_type(false), FileType::Dxe);
    }
}
