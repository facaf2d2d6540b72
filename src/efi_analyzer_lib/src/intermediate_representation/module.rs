use super::{BinaryFacts, Instruction, Segment};
use crate::prelude::*;
use std::collections::BTreeMap;
use std::ops::Range;

/// The boundaries of a function as reported by the disassembler.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct Function {
    pub start: u64,
    /// The address one past the last byte of the function.
    pub end: u64,
    #[serde(default)]
    pub name: Option<String>,
}

impl Function {
    pub fn new(start: u64, end: u64) -> Function {
        Function {
            start,
            end,
            name: None,
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

/// The machine type of a module, taken from the `Machine` field of the COFF header.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum MachineType {
    I386,
    Amd64,
    Arm64,
    Other(u16),
}

impl MachineType {
    /// Classify the raw COFF machine value.
    pub fn from_coff(machine: u16) -> MachineType {
        match machine {
            0x014c => MachineType::I386,
            0x8664 => MachineType::Amd64,
            0xaa64 => MachineType::Arm64,
            other => MachineType::Other(other),
        }
    }

    /// The raw COFF machine value.
    pub fn coff_value(&self) -> u16 {
        match self {
            MachineType::I386 => 0x014c,
            MachineType::Amd64 => 0x8664,
            MachineType::Arm64 => 0xaa64,
            MachineType::Other(value) => *value,
        }
    }
}

/// The firmware phase a module belongs to.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Default)]
pub enum FileType {
    Dxe,
    Smm,
    Pei,
    #[default]
    Unknown,
}

impl std::fmt::Display for FileType {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FileType::Dxe => "DXE",
            FileType::Smm => "SMM",
            FileType::Pei => "PEI",
            FileType::Unknown => "unknown",
        };
        write!(formatter, "{}", name)
    }
}

/// The PE subsystem value of EFI runtime drivers.
pub const SUBSYSTEM_EFI_RUNTIME_DRIVER: u16 = 12;

/// General information about a firmware module.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct ModuleInfo {
    pub machine: MachineType,
    #[serde(default)]
    pub file_type: FileType,
    /// The PE subsystem, if known.
    #[serde(default)]
    pub subsystem: Option<u16>,
    #[serde(default)]
    pub image_base: u64,
}

impl ModuleInfo {
    pub fn new(machine: MachineType) -> ModuleInfo {
        ModuleInfo {
            machine,
            file_type: FileType::Unknown,
            subsystem: None,
            image_base: 0,
        }
    }

    /// Returns `true` if the module is an EFI runtime driver.
    pub fn is_runtime_driver(&self) -> bool {
        self.subsystem == Some(SUBSYSTEM_EFI_RUNTIME_DRIVER)
    }
}

/// The JSON export format of a disassembled firmware module.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct ModuleExport {
    pub info: ModuleInfo,
    #[serde(default)]
    pub segments: Vec<Segment>,
    pub functions: Vec<Function>,
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub entry_points: Vec<u64>,
}

/// An in-memory firmware module implementing [`BinaryFacts`].
///
/// Cross references are derived from the statically known addresses referenced by the instructions.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FirmwareModule {
    info: ModuleInfo,
    segments: Vec<Segment>,
    functions: Vec<Function>,
    instructions: BTreeMap<u64, Instruction>,
    entry_points: Vec<u64>,
    cross_references: BTreeMap<u64, Vec<u64>>,
}

impl From<ModuleExport> for FirmwareModule {
    fn from(export: ModuleExport) -> FirmwareModule {
        FirmwareModule::new(
            export.info,
            export.segments,
            export.functions,
            export.instructions,
            export.entry_points,
        )
    }
}

impl FirmwareModule {
    /// Create a new module.
    /// If no entry points are given, the start of the first function is used.
    pub fn new(
        info: ModuleInfo,
        segments: Vec<Segment>,
        mut functions: Vec<Function>,
        instructions: Vec<Instruction>,
        mut entry_points: Vec<u64>,
    ) -> FirmwareModule {
        functions.sort();
        functions.dedup_by_key(|function| function.start);
        if entry_points.is_empty() {
            entry_points.extend(functions.first().map(|function| function.start));
        }
        let mut cross_references: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for instruction in &instructions {
            for target in instruction.referenced_addresses() {
                cross_references
                    .entry(target)
                    .or_default()
                    .push(instruction.address);
            }
        }
        for references in cross_references.values_mut() {
            references.sort_unstable();
            references.dedup();
        }
        FirmwareModule {
            info,
            segments,
            functions,
            instructions: instructions
                .into_iter()
                .map(|instruction| (instruction.address, instruction))
                .collect(),
            entry_points,
            cross_references,
        }
    }

    /// Parse a module from its JSON export.
    pub fn from_json(json: &str) -> Result<FirmwareModule, Error> {
        let export: ModuleExport =
            serde_json::from_str(json).context("Could not parse the module export")?;
        Ok(export.into())
    }

    /// Replace the segments and the module information gathered from the raw binary.
    ///
    /// The entry point of the image header replaces the entry points of the export
    /// if a function of the export starts there.
    pub fn set_image(&mut self, info: ModuleInfo, segments: Vec<Segment>, entry_point: u64) {
        self.info = info;
        self.segments = segments;
        if self
            .functions
            .binary_search_by_key(&entry_point, |function| function.start)
            .is_ok()
        {
            self.entry_points = vec![entry_point];
        }
    }

    /// Returns `true` if the export came without segments.
    pub fn has_segments(&self) -> bool {
        !self.segments.is_empty()
    }

    /// Override the firmware phase of the module.
    pub fn set_file_type(&mut self, file_type: super::FileType) {
        self.info.file_type = file_type;
    }
}

impl BinaryFacts for FirmwareModule {
    fn module_info(&self) -> &ModuleInfo {
        &self.info
    }

    fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn list_functions(&self, range: Range<u64>) -> Vec<Function> {
        self.functions
            .iter()
            .filter(|function| range.contains(&function.start))
            .cloned()
            .collect()
    }

    fn decode_instruction(&self, address: u64) -> Option<Instruction> {
        self.instructions.get(&address).cloned()
    }

    fn cross_references_to(&self, address: u64) -> Vec<u64> {
        self.cross_references
            .get(&address)
            .cloned()
            .unwrap_or_default()
    }

    fn entry_points(&self) -> Vec<u64> {
        self.entry_points.clone()
    }

    fn function_containing(&self, address: u64) -> Option<Function> {
        let index = self
            .functions
            .partition_point(|function| function.start <= address);
        let candidate = self.functions.get(index.checked_sub(1)?)?;
        candidate.contains(address).then(|| candidate.clone())
    }
}

#[cfg(test)]
impl FirmwareModule {
    /// A module without image data whose function boundaries follow the given instruction lists.
    pub fn mock(machine: MachineType, file_type: FileType, functions: Vec<Vec<Instruction>>) -> FirmwareModule {
        FirmwareModule::mock_with_data(machine, file_type, functions, Vec::new())
    }

    /// Like [`FirmwareModule::mock`], each data block becomes a readable and writable segment.
    pub fn mock_with_data(
        machine: MachineType,
        file_type: FileType,
        functions: Vec<Vec<Instruction>>,
        data: Vec<(u64, Vec<u8>)>,
    ) -> FirmwareModule {
        let mut info = ModuleInfo::new(machine);
        info.file_type = file_type;
        let segments = data
            .into_iter()
            .map(|(start, bytes)| {
                let permissions = super::Permissions {
                    read: true,
                    write: true,
                    execute: false,
                };
                Segment::new(".data", start, bytes, permissions)
            })
            .collect();
        let mut bounds = Vec::new();
        let mut instructions = Vec::new();
        for function in functions {
            if let (Some(first), Some(last)) = (function.first(), function.last()) {
                bounds.push(Function::new(first.address, last.next_address()));
            }
            instructions.extend(function);
        }
        FirmwareModule::new(info, segments, bounds, instructions, Vec::new())
    }
}
