//! The firmware service tables and protocol interfaces together with their field layouts.

use super::{Guid, SmiDispatchKind};
use crate::prelude::*;
use crate::utils::log::{DiagnosticKind, LogMessage};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// A firmware table or protocol interface that is called through a table of function pointers.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum ServiceTable {
    SystemTable,
    BootServices,
    RuntimeServices,
    /// The SMM System Table (`EFI_SMM_SYSTEM_TABLE2`).
    SmmServices,
    PeiServices,
    SmmBase2,
    SmmVariable,
    SmmCpu,
    /// The read-only variable PPI of the PEI phase.
    ReadOnlyVariable2,
    SmmDispatch(SmiDispatchKind),
}

/// The kind of a table field.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum FieldKind {
    /// A function pointer.
    Method,
    /// A pointer-sized data field.
    Data,
    /// A 32-bit data field.
    Word32,
    /// A pointer to another service table.
    Table(ServiceTable),
    /// An embedded structure of the given number of pointers.
    Embedded(u8),
}

/// A field of a table definition.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
struct Field {
    name: &'static str,
    kind: FieldKind,
}

const fn method(name: &'static str) -> Field {
    Field {
        name,
        kind: FieldKind::Method,
    }
}

const fn data(name: &'static str) -> Field {
    Field {
        name,
        kind: FieldKind::Data,
    }
}

const fn word32(name: &'static str) -> Field {
    Field {
        name,
        kind: FieldKind::Word32,
    }
}

const fn table(name: &'static str, points_to: ServiceTable) -> Field {
    Field {
        name,
        kind: FieldKind::Table(points_to),
    }
}

/// The size of `EFI_TABLE_HEADER`, which is the same for all pointer sizes.
pub const TABLE_HEADER_SIZE: u64 = 24;

const SYSTEM_TABLE_FIELDS: &[Field] = &[
    data("FirmwareVendor"),
    word32("FirmwareRevision"),
    data("ConsoleInHandle"),
    data("ConIn"),
    data("ConsoleOutHandle"),
    data("ConOut"),
    data("StandardErrorHandle"),
    data("StdErr"),
    table("RuntimeServices", ServiceTable::RuntimeServices),
    table("BootServices", ServiceTable::BootServices),
    data("NumberOfTableEntries"),
    data("ConfigurationTable"),
];

const BOOT_SERVICES_FIELDS: &[Field] = &[
    method("RaiseTPL"),
    method("RestoreTPL"),
    method("AllocatePages"),
    method("FreePages"),
    method("GetMemoryMap"),
    method("AllocatePool"),
    method("FreePool"),
    method("CreateEvent"),
    method("SetTimer"),
    method("WaitForEvent"),
    method("SignalEvent"),
    method("CloseEvent"),
    method("CheckEvent"),
    method("InstallProtocolInterface"),
    method("ReinstallProtocolInterface"),
    method("UninstallProtocolInterface"),
    method("HandleProtocol"),
    data("Reserved"),
    method("RegisterProtocolNotify"),
    method("LocateHandle"),
    method("LocateDevicePath"),
    method("InstallConfigurationTable"),
    method("LoadImage"),
    method("StartImage"),
    method("Exit"),
    method("UnloadImage"),
    method("ExitBootServices"),
    method("GetNextMonotonicCount"),
    method("Stall"),
    method("SetWatchdogTimer"),
    method("ConnectController"),
    method("DisconnectController"),
    method("OpenProtocol"),
    method("CloseProtocol"),
    method("OpenProtocolInformation"),
    method("ProtocolsPerHandle"),
    method("LocateHandleBuffer"),
    method("LocateProtocol"),
    method("InstallMultipleProtocolInterfaces"),
    method("UninstallMultipleProtocolInterfaces"),
    method("CalculateCrc32"),
    method("CopyMem"),
    method("SetMem"),
    method("CreateEventEx"),
];

const RUNTIME_SERVICES_FIELDS: &[Field] = &[
    method("GetTime"),
    method("SetTime"),
    method("GetWakeupTime"),
    method("SetWakeupTime"),
    method("SetVirtualAddressMap"),
    method("ConvertPointer"),
    method("GetVariable"),
    method("GetNextVariableName"),
    method("SetVariable"),
    method("GetNextHighMonotonicCount"),
    method("ResetSystem"),
    method("UpdateCapsule"),
    method("QueryCapsuleCapabilities"),
    method("QueryVariableInfo"),
];

const SMM_SERVICES_FIELDS: &[Field] = &[
    data("SmmFirmwareVendor"),
    word32("SmmFirmwareRevision"),
    method("SmmInstallConfigurationTable"),
    Field {
        name: "SmmIo",
        kind: FieldKind::Embedded(4),
    },
    method("SmmAllocatePool"),
    method("SmmFreePool"),
    method("SmmAllocatePages"),
    method("SmmFreePages"),
    method("SmmStartupThisAp"),
    data("CurrentlyExecutingCpu"),
    data("NumberOfCpus"),
    data("CpuSaveStateSize"),
    data("CpuSaveState"),
    data("NumberOfTableEntries"),
    data("SmmConfigurationTable"),
    method("SmmInstallProtocolInterface"),
    method("SmmUninstallProtocolInterface"),
    method("SmmHandleProtocol"),
    method("SmmRegisterProtocolNotify"),
    method("SmmLocateHandle"),
    method("SmmLocateProtocol"),
    method("SmiManage"),
    method("SmiHandlerRegister"),
    method("SmiHandlerUnRegister"),
];

const PEI_SERVICES_FIELDS: &[Field] = &[
    method("InstallPpi"),
    method("ReInstallPpi"),
    method("LocatePpi"),
    method("NotifyPpi"),
    method("GetBootMode"),
    method("SetBootMode"),
    method("GetHobList"),
    method("CreateHob"),
    method("FfsFindNextVolume"),
    method("FfsFindNextFile"),
    method("FfsFindSectionData"),
    method("InstallPeiMemory"),
    method("AllocatePages"),
    method("AllocatePool"),
    method("CopyMem"),
    method("SetMem"),
    method("ReportStatusCode"),
    method("ResetSystem"),
    data("CpuIo"),
    data("PciCfg"),
    method("FfsFindFileByName"),
    method("FfsGetFileInfo"),
    method("FfsGetVolumeInfo"),
    method("RegisterForShadow"),
    method("FindSectionData3"),
    method("FfsGetFileInfo2"),
    method("ResetSystem2"),
    method("FreePages"),
];

const SMM_BASE2_FIELDS: &[Field] = &[method("InSmm"), method("GetSmstLocation")];

const SMM_VARIABLE_FIELDS: &[Field] = &[
    method("SmmGetVariable"),
    method("SmmGetNextVariableName"),
    method("SmmSetVariable"),
    method("SmmQueryVariableInfo"),
];

const SMM_CPU_FIELDS: &[Field] = &[method("ReadSaveState"), method("WriteSaveState")];

const READ_ONLY_VARIABLE2_FIELDS: &[Field] = &[method("GetVariable"), method("NextVariableName")];

const SMM_DISPATCH_FIELDS: &[Field] = &[method("Register"), method("UnRegister")];

impl ServiceTable {
    /// All tables, including every SMI dispatch protocol.
    pub fn all() -> Vec<ServiceTable> {
        let mut tables = vec![
            ServiceTable::SystemTable,
            ServiceTable::BootServices,
            ServiceTable::RuntimeServices,
            ServiceTable::SmmServices,
            ServiceTable::PeiServices,
            ServiceTable::SmmBase2,
            ServiceTable::SmmVariable,
            ServiceTable::SmmCpu,
            ServiceTable::ReadOnlyVariable2,
        ];
        tables.extend(SmiDispatchKind::ALL.into_iter().map(ServiceTable::SmmDispatch));
        tables
    }

    /// The name of the firmware type describing the table.
    pub fn type_name(&self) -> &'static str {
        match self {
            ServiceTable::SystemTable => "EFI_SYSTEM_TABLE",
            ServiceTable::BootServices => "EFI_BOOT_SERVICES",
            ServiceTable::RuntimeServices => "EFI_RUNTIME_SERVICES",
            ServiceTable::SmmServices => "EFI_SMM_SYSTEM_TABLE2",
            ServiceTable::PeiServices => "EFI_PEI_SERVICES",
            ServiceTable::SmmBase2 => "EFI_SMM_BASE2_PROTOCOL",
            ServiceTable::SmmVariable => "EFI_SMM_VARIABLE_PROTOCOL",
            ServiceTable::SmmCpu => "EFI_SMM_CPU_PROTOCOL",
            ServiceTable::ReadOnlyVariable2 => "EFI_PEI_READ_ONLY_VARIABLE2_PPI",
            ServiceTable::SmmDispatch(kind) => kind.guid_name().trim_end_matches("_GUID"),
        }
    }

    /// The conventional name of a global variable holding a pointer to the table.
    pub fn global_name(&self) -> String {
        match self {
            ServiceTable::SystemTable => "gST".to_string(),
            ServiceTable::BootServices => "gBS".to_string(),
            ServiceTable::RuntimeServices => "gRT".to_string(),
            ServiceTable::SmmServices => "gSmst".to_string(),
            ServiceTable::PeiServices => "gPeiServices".to_string(),
            ServiceTable::SmmBase2 => "gSmmBase2".to_string(),
            ServiceTable::SmmVariable => "gSmmVariable".to_string(),
            ServiceTable::SmmCpu => "gSmmCpu".to_string(),
            ServiceTable::ReadOnlyVariable2 => "gVariablePpi".to_string(),
            ServiceTable::SmmDispatch(kind) => format!("gSmm{:?}Dispatch", kind),
        }
    }

    /// Returns `true` for the tables that begin with an `EFI_TABLE_HEADER`.
    pub fn has_header(&self) -> bool {
        matches!(
            self,
            ServiceTable::SystemTable
                | ServiceTable::BootServices
                | ServiceTable::RuntimeServices
                | ServiceTable::SmmServices
                | ServiceTable::PeiServices
        )
    }

    /// The GUID identifying a protocol or PPI interface.
    pub fn interface_guid(&self) -> Option<Guid> {
        match self {
            ServiceTable::SmmBase2 => Some(super::EFI_SMM_BASE2_PROTOCOL_GUID),
            ServiceTable::SmmVariable => Some(super::EFI_SMM_VARIABLE_PROTOCOL_GUID),
            ServiceTable::SmmCpu => Some(super::EFI_SMM_CPU_PROTOCOL_GUID),
            ServiceTable::ReadOnlyVariable2 => Some(super::EFI_PEI_READ_ONLY_VARIABLE2_PPI_GUID),
            ServiceTable::SmmDispatch(kind) => Some(kind.guid()),
            _ => None,
        }
    }

    /// Find the interface table identified by the given protocol or PPI GUID.
    pub fn for_interface_guid(guid: &Guid) -> Option<ServiceTable> {
        ServiceTable::all()
            .into_iter()
            .find(|table| table.interface_guid().as_ref() == Some(guid))
    }

    /// Returns `true` for the tables whose services live outside of SMRAM.
    pub fn is_outside_smram(&self) -> bool {
        matches!(
            self,
            ServiceTable::BootServices | ServiceTable::RuntimeServices
        )
    }

    fn fields(&self) -> &'static [Field] {
        match self {
            ServiceTable::SystemTable => SYSTEM_TABLE_FIELDS,
            ServiceTable::BootServices => BOOT_SERVICES_FIELDS,
            ServiceTable::RuntimeServices => RUNTIME_SERVICES_FIELDS,
            ServiceTable::SmmServices => SMM_SERVICES_FIELDS,
            ServiceTable::PeiServices => PEI_SERVICES_FIELDS,
            ServiceTable::SmmBase2 => SMM_BASE2_FIELDS,
            ServiceTable::SmmVariable => SMM_VARIABLE_FIELDS,
            ServiceTable::SmmCpu => SMM_CPU_FIELDS,
            ServiceTable::ReadOnlyVariable2 => READ_ONLY_VARIABLE2_FIELDS,
            ServiceTable::SmmDispatch(_) => SMM_DISPATCH_FIELDS,
        }
    }
}

impl std::fmt::Display for ServiceTable {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.type_name())
    }
}

/// A field of a [`TypeLayout`] at its byte offset.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct FieldLayout {
    pub name: String,
    pub offset: u64,
    pub kind: FieldKind,
}

/// The field offsets of a table type for one pointer size.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct TypeLayout {
    pub type_name: String,
    pub pointer_size: u64,
    fields: Vec<FieldLayout>,
}

impl TypeLayout {
    /// Build a layout from fields with explicit offsets.
    ///
    /// Fields sharing an offset with another field are removed, except for the lexicographically smallest name.
    /// Each removed field generates an `AliasedServiceOffset` diagnostic.
    pub fn from_fields(
        type_name: impl Into<String>,
        pointer_size: u64,
        mut fields: Vec<FieldLayout>,
    ) -> (TypeLayout, Vec<LogMessage>) {
        let type_name = type_name.into();
        fields.sort_by(|first, second| {
            (first.offset, &first.name).cmp(&(second.offset, &second.name))
        });
        let mut logs = Vec::new();
        let mut unique_fields: Vec<FieldLayout> = Vec::with_capacity(fields.len());
        for field in fields {
            match unique_fields.last() {
                Some(previous) if previous.offset == field.offset => {
                    logs.push(
                        LogMessage::new_debug(format!(
                            "{}: {} aliases {} at offset {:#x}",
                            type_name, field.name, previous.name, field.offset
                        ))
                        .source("Type Layouts")
                        .kind(DiagnosticKind::AliasedServiceOffset),
                    );
                }
                _ => unique_fields.push(field),
            }
        }
        (
            TypeLayout {
                type_name,
                pointer_size,
                fields: unique_fields,
            },
            logs,
        )
    }

    /// Compute the layout of a built-in table type.
    ///
    /// Fields are laid out in declaration order with natural alignment.
    pub fn compute(table: ServiceTable, pointer_size: u64) -> TypeLayout {
        let mut offset = if table.has_header() {
            TABLE_HEADER_SIZE
        } else {
            0
        };
        let mut fields = Vec::new();
        for field in table.fields() {
            let (size, alignment) = match field.kind {
                FieldKind::Word32 => (4, 4),
                FieldKind::Embedded(count) => (pointer_size * count as u64, pointer_size),
                FieldKind::Method | FieldKind::Data | FieldKind::Table(_) => {
                    (pointer_size, pointer_size)
                }
            };
            offset = offset.div_ceil(alignment) * alignment;
            fields.push(FieldLayout {
                name: field.name.to_string(),
                offset,
                kind: field.kind,
            });
            offset += size;
        }
        TypeLayout {
            type_name: table.type_name().to_string(),
            pointer_size,
            fields,
        }
    }

    /// The built-in layout of a table type.
    /// Layouts for pointer sizes 4 and 8 are computed once and cached.
    pub fn builtin(table: ServiceTable, pointer_size: u64) -> TypeLayout {
        static LAYOUTS: OnceLock<BTreeMap<(ServiceTable, u64), TypeLayout>> = OnceLock::new();
        let layouts = LAYOUTS.get_or_init(|| {
            let mut layouts = BTreeMap::new();
            for table in ServiceTable::all() {
                for pointer_size in [4, 8] {
                    layouts.insert(
                        (table, pointer_size),
                        TypeLayout::compute(table, pointer_size),
                    );
                }
            }
            layouts
        });
        match layouts.get(&(table, pointer_size)) {
            Some(layout) => layout.clone(),
            None => TypeLayout::compute(table, pointer_size),
        }
    }

    /// All fields sorted by offset.
    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    /// The field starting at the given offset.
    pub fn field_at(&self, offset: u64) -> Option<&FieldLayout> {
        self.fields
            .binary_search_by_key(&offset, |field| field.offset)
            .ok()
            .map(|index| &self.fields[index])
    }

    /// The name of the method at the given offset.
    pub fn method_at(&self, offset: u64) -> Option<&str> {
        self.field_at(offset)
            .filter(|field| field.kind == FieldKind::Method)
            .map(|field| field.name.as_str())
    }

    /// The offset of the named field.
    pub fn offset_of(&self, name: &str) -> Option<u64> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| field.offset)
    }
}
