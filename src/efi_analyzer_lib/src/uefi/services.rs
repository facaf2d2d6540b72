//! Argument conventions of the services that take protocol or PPI GUIDs.

use super::ServiceTable;
use crate::prelude::*;

/// Where the GUID operands of a service call are found.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum GuidArgument {
    /// The argument with the given index is a pointer to a GUID.
    Direct(usize),
    /// Starting at the given index the arguments form `(GUID pointer, interface)` pairs until a NULL terminator.
    Pairs(usize),
    /// The argument with the given index points to a list of `EFI_PEI_PPI_DESCRIPTOR` structures.
    PpiDescriptors(usize),
}

/// The GUID related argument conventions of a service.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct InterfaceService {
    pub table: ServiceTable,
    pub name: &'static str,
    pub guid: Option<GuidArgument>,
    /// The index of the out-parameter receiving a pointer to the interface.
    pub interface_out: Option<usize>,
}

const fn service(
    table: ServiceTable,
    name: &'static str,
    guid: Option<GuidArgument>,
    interface_out: Option<usize>,
) -> InterfaceService {
    InterfaceService {
        table,
        name,
        guid,
        interface_out,
    }
}

use GuidArgument::*;
use ServiceTable::{BootServices, PeiServices, SmmServices};

/// All services working with protocols or PPIs.
pub const INTERFACE_SERVICES: &[InterfaceService] = &[
    service(BootServices, "InstallProtocolInterface", Some(Direct(1)), None),
    service(BootServices, "ReinstallProtocolInterface", Some(Direct(1)), None),
    service(BootServices, "UninstallProtocolInterface", Some(Direct(1)), None),
    service(BootServices, "HandleProtocol", Some(Direct(1)), Some(2)),
    service(BootServices, "RegisterProtocolNotify", Some(Direct(0)), None),
    service(BootServices, "OpenProtocol", Some(Direct(1)), Some(2)),
    service(BootServices, "CloseProtocol", Some(Direct(1)), None),
    service(BootServices, "OpenProtocolInformation", Some(Direct(1)), None),
    service(BootServices, "ProtocolsPerHandle", None, None),
    service(BootServices, "LocateHandleBuffer", None, None),
    service(BootServices, "LocateProtocol", Some(Direct(0)), Some(2)),
    service(BootServices, "InstallMultipleProtocolInterfaces", Some(Pairs(1)), None),
    service(BootServices, "UninstallMultipleProtocolInterfaces", Some(Pairs(1)), None),
    service(SmmServices, "SmmInstallProtocolInterface", Some(Direct(1)), None),
    service(SmmServices, "SmmUninstallProtocolInterface", Some(Direct(1)), None),
    service(SmmServices, "SmmHandleProtocol", Some(Direct(1)), Some(2)),
    service(SmmServices, "SmmRegisterProtocolNotify", Some(Direct(0)), None),
    service(SmmServices, "SmmLocateHandle", Some(Direct(1)), None),
    service(SmmServices, "SmmLocateProtocol", Some(Direct(0)), Some(2)),
    service(PeiServices, "InstallPpi", Some(PpiDescriptors(1)), None),
    service(PeiServices, "ReInstallPpi", Some(PpiDescriptors(2)), None),
    service(PeiServices, "LocatePpi", Some(Direct(1)), Some(4)),
    service(PeiServices, "NotifyPpi", Some(PpiDescriptors(1)), None),
];

/// Look up the conventions of a protocol or PPI service.
pub fn interface_service(table: ServiceTable, name: &str) -> Option<&'static InterfaceService> {
    INTERFACE_SERVICES
        .iter()
        .find(|service| service.table == table && service.name == name)
}

/// The flag marking the last entry of a PPI descriptor list.
pub const PPI_DESCRIPTOR_TERMINATE_LIST: u64 = 0x8000_0000;

/// The argument positions of a `GetVariable`-like service.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct VariableService {
    pub table: ServiceTable,
    pub name: &'static str,
    pub name_argument: usize,
    pub guid_argument: usize,
    pub size_argument: usize,
    pub data_argument: usize,
}

/// The services reading NVRAM variables.
pub const VARIABLE_SERVICES: &[VariableService] = &[
    VariableService {
        table: ServiceTable::RuntimeServices,
        name: "GetVariable",
        name_argument: 0,
        guid_argument: 1,
        size_argument: 3,
        data_argument: 4,
    },
    VariableService {
        table: ServiceTable::SmmVariable,
        name: "SmmGetVariable",
        name_argument: 0,
        guid_argument: 1,
        size_argument: 3,
        data_argument: 4,
    },
    VariableService {
        table: ServiceTable::ReadOnlyVariable2,
        name: "GetVariable",
        name_argument: 1,
        guid_argument: 2,
        size_argument: 4,
        data_argument: 5,
    },
];

/// Look up the argument positions of a variable service.
pub fn variable_service(table: ServiceTable, name: &str) -> Option<&'static VariableService> {
    VARIABLE_SERVICES
        .iter()
        .find(|service| service.table == table && service.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uefi::TypeLayout;

    #[test]
    fn services_exist_in_layouts() {
        for service in INTERFACE_SERVICES {
            let layout = TypeLayout::builtin(service.table, 8);
            assert!(layout.offset_of(service.name).is_some(), "{}", service.name);
        }
        for service in VARIABLE_SERVICES {
            let layout = TypeLayout::builtin(service.table, 8);
            assert!(layout.offset_of(service.name).is_some(), "{}", service.name);
        }
    }

    #[test]
    fn guid_positions() {
        assert_eq!(
            interface_service(ServiceTable::BootServices, "LocateProtocol")
                .unwrap()
                .guid,
            Some(GuidArgument::Direct(0))
        );
        assert_eq!(
            interface_service(ServiceTable::PeiServices, "ReInstallPpi")
                .unwrap()
                .guid,
            Some(GuidArgument::PpiDescriptors(2))
        );
        assert!(interface_service(ServiceTable::RuntimeServices, "GetVariable").is_none());
        assert_eq!(
            variable_service(ServiceTable::ReadOnlyVariable2, "GetVariable")
                .unwrap()
                .size_argument,
            4
        );
    }
}
