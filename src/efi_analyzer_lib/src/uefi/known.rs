//! GUIDs the analyses depend on independently of the GUID database.

use super::Guid;
use crate::prelude::*;

/// A GUID together with its symbolic name.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct KnownGuid {
    pub name: &'static str,
    pub guid: Guid,
}

pub const EFI_SMM_BASE2_PROTOCOL_GUID: Guid = Guid::new(
    0xf4ccbfb7,
    0xf6e0,
    0x47fd,
    [0x9d, 0xd4, 0x10, 0xa8, 0xf1, 0x50, 0xc1, 0x91],
);

pub const EFI_SMM_VARIABLE_PROTOCOL_GUID: Guid = Guid::new(
    0xed32d533,
    0x99e6,
    0x4209,
    [0x9c, 0xc0, 0x2d, 0x72, 0xcd, 0xd9, 0x98, 0xa7],
);

pub const EFI_SMM_CPU_PROTOCOL_GUID: Guid = Guid::new(
    0xeb346b97,
    0x975f,
    0x4a9f,
    [0x8b, 0x22, 0xf8, 0xe9, 0x2b, 0xb3, 0xd5, 0x69],
);

pub const EFI_PEI_READ_ONLY_VARIABLE2_PPI_GUID: Guid = Guid::new(
    0x2ab86ef5,
    0xecb5,
    0x4134,
    [0xb5, 0x56, 0x38, 0x54, 0xca, 0x1f, 0xe1, 0xb4],
);

pub const EFI_GLOBAL_VARIABLE_GUID: Guid = Guid::new(
    0x8be4df61,
    0x93ca,
    0x11d2,
    [0xaa, 0x0d, 0x00, 0xe0, 0x98, 0x03, 0x2b, 0x8c],
);

/// The well-known GUIDs that are always part of the GUID database.
pub const WELL_KNOWN_GUIDS: &[KnownGuid] = &[
    KnownGuid {
        name: "EFI_SMM_BASE2_PROTOCOL_GUID",
        guid: EFI_SMM_BASE2_PROTOCOL_GUID,
    },
    KnownGuid {
        name: "EFI_SMM_VARIABLE_PROTOCOL_GUID",
        guid: EFI_SMM_VARIABLE_PROTOCOL_GUID,
    },
    KnownGuid {
        name: "EFI_SMM_CPU_PROTOCOL_GUID",
        guid: EFI_SMM_CPU_PROTOCOL_GUID,
    },
    KnownGuid {
        name: "EFI_PEI_READ_ONLY_VARIABLE2_PPI_GUID",
        guid: EFI_PEI_READ_ONLY_VARIABLE2_PPI_GUID,
    },
    KnownGuid {
        name: "EFI_GLOBAL_VARIABLE",
        guid: EFI_GLOBAL_VARIABLE_GUID,
    },
];

/// The SMI dispatch protocols through which child SMI handlers are registered.
///
/// Both revisions of a protocol share the `Register`/`UnRegister` interface layout.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum SmiDispatchKind {
    Sw,
    Sw2,
    Sx,
    Sx2,
    IoTrap,
    IoTrap2,
    Gpi,
    Gpi2,
    Usb,
    Usb2,
    StandbyButton,
    StandbyButton2,
    PeriodicTimer,
    PeriodicTimer2,
    PowerButton,
    PowerButton2,
}

impl SmiDispatchKind {
    pub const ALL: [SmiDispatchKind; 16] = [
        SmiDispatchKind::Sw,
        SmiDispatchKind::Sw2,
        SmiDispatchKind::Sx,
        SmiDispatchKind::Sx2,
        SmiDispatchKind::IoTrap,
        SmiDispatchKind::IoTrap2,
        SmiDispatchKind::Gpi,
        SmiDispatchKind::Gpi2,
        SmiDispatchKind::Usb,
        SmiDispatchKind::Usb2,
        SmiDispatchKind::StandbyButton,
        SmiDispatchKind::StandbyButton2,
        SmiDispatchKind::PeriodicTimer,
        SmiDispatchKind::PeriodicTimer2,
        SmiDispatchKind::PowerButton,
        SmiDispatchKind::PowerButton2,
    ];

    /// The GUID of the dispatch protocol.
    pub fn guid(&self) -> Guid {
        use SmiDispatchKind::*;
        match self {
            Sw2 => Guid::new(0x18a3c6dc, 0x5eea, 0x48c8, [0xa1, 0xc1, 0xb5, 0x33, 0x89, 0xf9, 0x89, 0x99]),
            Sw => Guid::new(0xe541b773, 0xdd11, 0x420c, [0xb0, 0x26, 0xdf, 0x99, 0x36, 0x53, 0xf8, 0xbf]),
            Sx2 => Guid::new(0x456d2859, 0xa84b, 0x4e47, [0xa2, 0xee, 0x32, 0x76, 0xd8, 0x86, 0x99, 0x7d]),
            Sx => Guid::new(0x14fc52be, 0x01dc, 0x426c, [0x91, 0xae, 0xa2, 0x3c, 0x3e, 0x22, 0x0a, 0xe8]),
            IoTrap2 => Guid::new(0x58dc368d, 0x7bfa, 0x4e77, [0xab, 0xbc, 0x0e, 0x29, 0x41, 0x8d, 0xf9, 0x30]),
            IoTrap => Guid::new(0xdb7f536b, 0xede4, 0x4714, [0xa5, 0xc8, 0xe3, 0x46, 0xeb, 0xaa, 0x20, 0x1d]),
            Gpi2 => Guid::new(0x25566b03, 0xb577, 0x4cbf, [0x95, 0x8c, 0xed, 0x66, 0x3e, 0xa2, 0x43, 0x80]),
            Gpi => Guid::new(0xe0744b81, 0x9513, 0x49cd, [0x8c, 0xea, 0xe9, 0x24, 0x5e, 0x70, 0x39, 0xda]),
            Usb2 => Guid::new(0xee9b8d90, 0xc5a6, 0x40a2, [0xbd, 0xe2, 0x52, 0x55, 0x8d, 0x33, 0xcc, 0xa1]),
            Usb => Guid::new(0xa05b6ffd, 0x87af, 0x4e42, [0x95, 0xc9, 0x62, 0x28, 0xb6, 0x3c, 0xf3, 0xf3]),
            StandbyButton2 => Guid::new(0x7300c4a1, 0x43f2, 0x4017, [0xa5, 0x1b, 0xc8, 0x1a, 0x7f, 0x40, 0x58, 0x5b]),
            StandbyButton => Guid::new(0x78965b98, 0xb0bf, 0x449e, [0x8b, 0x22, 0xd2, 0x91, 0x4e, 0x49, 0x8a, 0x98]),
            PeriodicTimer2 => Guid::new(0x4cec368e, 0x8e8e, 0x4d71, [0x8b, 0xe1, 0x95, 0x8c, 0x45, 0xfc, 0x8a, 0x53]),
            PeriodicTimer => Guid::new(0x9cca03fc, 0x4c9e, 0x4a19, [0x9b, 0x06, 0xed, 0x7b, 0x47, 0x9b, 0xde, 0x55]),
            PowerButton2 => Guid::new(0x1b1183fa, 0x1823, 0x46a7, [0x88, 0x72, 0x9c, 0x57, 0x87, 0x55, 0x40, 0x9d]),
            PowerButton => Guid::new(0xb709efa0, 0x47a6, 0x4b41, [0xb9, 0x31, 0x12, 0xec, 0xe7, 0xa8, 0xee, 0x56]),
        }
    }

    /// The name of the dispatch protocol GUID, e.g. `EFI_SMM_SW_DISPATCH2_PROTOCOL_GUID`.
    pub fn guid_name(&self) -> &'static str {
        use SmiDispatchKind::*;
        match self {
            Sw => "EFI_SMM_SW_DISPATCH_PROTOCOL_GUID",
            Sw2 => "EFI_SMM_SW_DISPATCH2_PROTOCOL_GUID",
            Sx => "EFI_SMM_SX_DISPATCH_PROTOCOL_GUID",
            Sx2 => "EFI_SMM_SX_DISPATCH2_PROTOCOL_GUID",
            IoTrap => "EFI_SMM_IO_TRAP_DISPATCH_PROTOCOL_GUID",
            IoTrap2 => "EFI_SMM_IO_TRAP_DISPATCH2_PROTOCOL_GUID",
            Gpi => "EFI_SMM_GPI_DISPATCH_PROTOCOL_GUID",
            Gpi2 => "EFI_SMM_GPI_DISPATCH2_PROTOCOL_GUID",
            Usb => "EFI_SMM_USB_DISPATCH_PROTOCOL_GUID",
            Usb2 => "EFI_SMM_USB_DISPATCH2_PROTOCOL_GUID",
            StandbyButton => "EFI_SMM_STANDBY_BUTTON_DISPATCH_PROTOCOL_GUID",
            StandbyButton2 => "EFI_SMM_STANDBY_BUTTON_DISPATCH2_PROTOCOL_GUID",
            PeriodicTimer => "EFI_SMM_PERIODIC_TIMER_DISPATCH_PROTOCOL_GUID",
            PeriodicTimer2 => "EFI_SMM_PERIODIC_TIMER_DISPATCH2_PROTOCOL_GUID",
            PowerButton => "EFI_SMM_POWER_BUTTON_DISPATCH_PROTOCOL_GUID",
            PowerButton2 => "EFI_SMM_POWER_BUTTON_DISPATCH2_PROTOCOL_GUID",
        }
    }

    /// Find the dispatch protocol with the given GUID.
    pub fn from_guid(guid: &Guid) -> Option<SmiDispatchKind> {
        SmiDispatchKind::ALL
            .into_iter()
            .find(|kind| kind.guid() == *guid)
    }
}

/// Returns `true` if the presence of the GUID in a module marks it as an SMM driver.
pub fn is_smm_marker(guid: &Guid) -> bool {
    [
        EFI_SMM_BASE2_PROTOCOL_GUID,
        EFI_SMM_VARIABLE_PROTOCOL_GUID,
        EFI_SMM_CPU_PROTOCOL_GUID,
    ]
    .contains(guid)
        || SmiDispatchKind::from_guid(guid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_guids_are_distinct() {
        let mut guids: Vec<Guid> = SmiDispatchKind::ALL.iter().map(|kind| kind.guid()).collect();
        guids.sort();
        guids.dedup();
        assert_eq!(guids.len(), 16);
        assert_eq!(
            SmiDispatchKind::from_guid(&SmiDispatchKind::Sw2.guid()),
            Some(SmiDispatchKind::Sw2)
        );
        assert!(is_smm_marker(&SmiDispatchKind::PowerButton.guid()));
        assert!(!is_smm_marker(&EFI_GLOBAL_VARIABLE_GUID));
    }
}
