//! Resolve the GUID arguments of protocol and PPI related service calls.
//!
//! The GUID pointer of each call is recovered by the backward tracer
//! and the GUID is read from the module image or rebuilt from stack stores.
//! Services taking lists of GUIDs are resolved entry by entry:
//! * `InstallMultipleProtocolInterfaces` and `UninstallMultipleProtocolInterfaces` take
//!   `(GUID pointer, interface)` argument pairs terminated by a NULL pointer or the all-zero GUID,
//! * `InstallPpi`, `ReInstallPpi` and `NotifyPpi` take a list of `EFI_PEI_PPI_DESCRIPTOR` structures
//!   whose last entry is marked by the `TERMINATE_LIST` flag.

use super::services::ServiceCall;
use super::{parallel_map, read_guid, read_pointer, resolve_guid, AnalysisContext, ResolvedGuid, Traced, Tracer, Value};
use crate::prelude::*;
use crate::uefi::{interface_service, Guid, GuidArgument, ServiceTable, PPI_DESCRIPTOR_TERMINATE_LIST};
use crate::utils::log::{DiagnosticKind, LogMessage};

const SOURCE: &str = "Protocol Resolver";

/// Whether an interface is a DXE/SMM protocol or a PEI PPI.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum InterfaceKind {
    Protocol,
    Ppi,
}

/// A call of a protocol or PPI service with a resolved GUID argument.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct InterfaceUse {
    pub call_address: u64,
    pub service_name: String,
    pub guid_address: u64,
    pub guid: Guid,
    /// The name of the GUID in the GUID database.
    pub name: Option<String>,
    /// The address of the instruction loading the GUID pointer.
    pub xref_address: u64,
    pub kind: InterfaceKind,
    pub function: u64,
}

/// Resolve the GUID arguments of all protocol and PPI service calls.
///
/// The returned interface uses are sorted and unique per call address, service name and GUID address.
pub fn resolve_protocols(context: &AnalysisContext, calls: &[ServiceCall]) -> (Vec<InterfaceUse>, Vec<LogMessage>) {
    let results = parallel_map(calls, context.config.worker_threads, |call| {
        match context.body(call.function) {
            Some(body) => {
                let mut resolver = CallResolver {
                    context,
                    call,
                    tracer: context.tracer(body),
                    uses: Vec::new(),
                    logs: Vec::new(),
                };
                resolver.resolve();
                (resolver.uses, resolver.logs)
            }
            None => (Vec::new(), Vec::new()),
        }
    });
    let mut uses = Vec::new();
    let mut logs = Vec::new();
    for (call_uses, call_logs) in results {
        uses.extend(call_uses);
        logs.extend(call_logs);
    }
    uses.sort();
    uses.dedup_by(|first, second| {
        (first.call_address, &first.service_name, first.guid_address)
            == (second.call_address, &second.service_name, second.guid_address)
    });
    (uses, logs)
}

struct CallResolver<'a> {
    context: &'a AnalysisContext<'a>,
    call: &'a ServiceCall,
    tracer: Tracer<'a>,
    uses: Vec<InterfaceUse>,
    logs: Vec<LogMessage>,
}

impl<'a> CallResolver<'a> {
    fn resolve(&mut self) {
        let Some(service) = interface_service(self.call.table, &self.call.service_name) else {
            return;
        };
        match service.guid {
            Some(GuidArgument::Direct(argument)) => {
                if let Some(traced) = self.trace(argument) {
                    self.resolve_pointer(&traced);
                }
            }
            Some(GuidArgument::Pairs(first_argument)) => self.resolve_pairs(first_argument),
            Some(GuidArgument::PpiDescriptors(argument)) => self.resolve_descriptors(argument),
            None => (),
        }
    }

    fn kind(&self) -> InterfaceKind {
        if self.call.table == ServiceTable::PeiServices {
            InterfaceKind::Ppi
        } else {
            InterfaceKind::Protocol
        }
    }

    fn trace(&mut self, argument: usize) -> Option<Traced> {
        let traced = self.tracer.trace_argument(self.call.call_index, argument);
        if traced.is_none() {
            self.log(
                DiagnosticKind::UnresolvedOperand,
                format!("GUID argument {} of {} not resolved", argument, self.call.service_name),
            );
        }
        traced
    }

    /// Resolve a traced GUID pointer and record the interface use.
    fn resolve_pointer(&mut self, traced: &Traced) {
        if let Some(resolved) = self.pointed_guid(traced) {
            self.record(&resolved, traced.origin);
        }
    }

    /// Read the GUID a traced pointer points to without recording it.
    fn pointed_guid(&mut self, traced: &Traced) -> Option<ResolvedGuid> {
        let resolved = resolve_guid(self.context.facts, &self.tracer, self.call.call_index, traced);
        if resolved.is_none() {
            self.log(
                DiagnosticKind::UnresolvedOperand,
                format!("GUID of {} could not be read", self.call.service_name),
            );
        }
        resolved
    }

    fn record(&mut self, resolved: &ResolvedGuid, xref_address: u64) {
        let name = self.context.guids.name_of(&resolved.guid).map(str::to_string);
        if name.is_none() {
            self.log(
                DiagnosticKind::UnresolvedGuid,
                format!("Unknown GUID {} used by {}", resolved.guid, self.call.service_name),
            );
        }
        self.uses.push(InterfaceUse {
            call_address: self.call.call_address,
            service_name: self.call.service_name.clone(),
            guid_address: resolved.address,
            guid: resolved.guid,
            name,
            xref_address,
            kind: self.kind(),
            function: self.call.function,
        });
    }

    /// Resolve the `(GUID pointer, interface)` argument pairs up to the terminator,
    /// either a NULL pointer or a pointer to the all-zero GUID.
    fn resolve_pairs(&mut self, first_argument: usize) {
        let max_pairs = self.context.config.max_interface_pairs;
        for pair in 0..max_pairs {
            let Some(traced) = self.trace(first_argument + 2 * pair) else {
                return;
            };
            if traced.value == Value::Constant(0) {
                return;
            }
            match self.pointed_guid(&traced) {
                Some(resolved) if resolved.guid.is_zero() => return,
                Some(resolved) => self.record(&resolved, traced.origin),
                None => return,
            }
        }
        self.log(
            DiagnosticKind::MalformedGuidTableEntry,
            format!("No terminator within the first {} interface pairs", max_pairs),
        );
    }

    /// Resolve the entries of a PPI descriptor list.
    fn resolve_descriptors(&mut self, argument: usize) {
        let Some(traced) = self.trace(argument) else {
            return;
        };
        let Some(list) = traced.value.as_address() else {
            self.log(
                DiagnosticKind::UnresolvedOperand,
                format!("PPI descriptor list of {} is not in the module image", self.call.service_name),
            );
            return;
        };
        let facts = self.context.facts;
        let pointer_size = self.context.profile.pointer_size;
        let max_descriptors = self.context.config.max_ppi_descriptors;
        for index in 0..max_descriptors as u64 {
            let descriptor = list + 3 * pointer_size * index;
            let entry = read_pointer(facts, descriptor, pointer_size).and_then(|flags| {
                let guid_address = read_pointer(facts, descriptor + pointer_size, pointer_size)?;
                Some((flags, guid_address, read_guid(facts, guid_address)?))
            });
            let Some((flags, guid_address, guid)) = entry else {
                self.log(
                    DiagnosticKind::MalformedGuidTableEntry,
                    format!("Invalid PPI descriptor at {:#x}", descriptor),
                );
                return;
            };
            let resolved = ResolvedGuid {
                guid,
                address: guid_address,
                on_stack: false,
            };
            self.record(&resolved, traced.origin);
            if flags & PPI_DESCRIPTOR_TERMINATE_LIST != 0 {
                return;
            }
        }
        self.log(
            DiagnosticKind::MalformedGuidTableEntry,
            format!("No terminator within the first {} PPI descriptors", max_descriptors),
        );
    }

    fn log(&mut self, kind: DiagnosticKind, text: String) {
        self.logs.push(
            LogMessage::new_debug(text)
                .location(self.call.call_address)
                .source(SOURCE)
                .kind(kind),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::services::resolve_services;
    use crate::analysis::table_anchors::locate_tables;
    use crate::analysis::tests::mock_context;
    use crate::analysis::{AnalysisConfig, AnalysisContext};
    use crate::insns;
    use crate::intermediate_representation::{FileType, FirmwareModule, Instruction, MachineType};
    use crate::uefi::{
        GuidDb, EFI_SMM_BASE2_PROTOCOL_GUID, EFI_SMM_CPU_PROTOCOL_GUID, EFI_SMM_VARIABLE_PROTOCOL_GUID,
    };

    fn image(guids: &[(usize, Guid)], extra: &[(usize, &[u8])]) -> Vec<(u64, Vec<u8>)> {
        let mut bytes = vec![0u8; 0x100];
        for (offset, guid) in guids {
            bytes[*offset..*offset + 16].copy_from_slice(&guid.to_bytes());
        }
        for (offset, data) in extra {
            bytes[*offset..*offset + data.len()].copy_from_slice(data);
        }
        vec![(0x3000, bytes)]
    }

    fn interface_uses(module: &FirmwareModule, guids: &GuidDb, config: AnalysisConfig) -> (Vec<InterfaceUse>, Vec<LogMessage>) {
        let (context, _) = AnalysisContext::new(module, guids, config).unwrap();
        let tables = locate_tables(&context);
        let (calls, _) = resolve_services(&context, &tables);
        resolve_protocols(&context, &calls)
    }

    fn single_threaded() -> AnalysisConfig {
        AnalysisConfig {
            worker_threads: 1,
            ..Default::default()
        }
    }

    fn dxe_module(instructions: Vec<Instruction>, data: Vec<(u64, Vec<u8>)>) -> FirmwareModule {
        FirmwareModule::mock_with_data(MachineType::Amd64, FileType::Dxe, vec![instructions], data)
    }

    #[test]
    fn locate_protocol_guid() {
        let guids = GuidDb::with_well_known();
        let unknown = Guid::new(0x1234_5678, 0x9abc, 0xdef0, [1, 2, 3, 4, 5, 6, 7, 8]);
        let module = dxe_module(
            insns![
                "0x1000: mov rbx, qword ptr [rdx+0x60]",
                "0x1004: lea rcx, [0x3010]",
                "0x100b: xor edx, edx",
                "0x100d: lea r8, [0x3080]",
                "0x1014: call qword ptr [rbx+0x140]",
                "0x101a: lea rcx, [0x3020]",
                "0x1021: xor edx, edx",
                "0x1023: lea r8, [0x3088]",
                "0x102a: call qword ptr [rbx+0x140]",
                "0x1030: call qword ptr [rbx+0x140]",
                "0x1036: ret",
            ],
            image(&[(0x10, EFI_SMM_VARIABLE_PROTOCOL_GUID), (0x20, unknown)], &[]),
        );
        let (uses, logs) = interface_uses(&module, &guids, single_threaded());
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].guid, EFI_SMM_VARIABLE_PROTOCOL_GUID);
        assert_eq!(uses[0].name.as_deref(), Some("EFI_SMM_VARIABLE_PROTOCOL_GUID"));
        assert_eq!(uses[0].guid_address, 0x3010);
        assert_eq!(uses[0].xref_address, 0x1004);
        assert_eq!(uses[0].service_name, "LocateProtocol");
        assert_eq!(uses[0].kind, InterfaceKind::Protocol);
        assert_eq!(uses[1].guid, unknown);
        assert_eq!(uses[1].name, None);
        let kinds: Vec<(Option<u64>, Option<DiagnosticKind>)> =
            logs.iter().map(|log| (log.location, log.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (Some(0x102a), Some(DiagnosticKind::UnresolvedGuid)),
                (Some(0x1030), Some(DiagnosticKind::UnresolvedOperand)),
            ]
        );
    }

    #[test]
    fn install_multiple_protocol_interfaces() {
        let guids = GuidDb::with_well_known();
        let module = dxe_module(
            insns![
                "0x1000: sub rsp, 0x48",
                "0x1004: mov rbx, qword ptr [rdx+0x60]",
                "0x1008: lea rax, [0x3030]",
                "0x100f: mov qword ptr [rsp+0x28], rax",
                "0x1014: mov qword ptr [rsp+0x38], 0x0",
                "0x101d: mov qword ptr [rsp+0x30], 0x0",
                "0x1026: mov qword ptr [rsp+0x20], 0x0",
                "0x102f: lea r9, [0x3020]",
                "0x1036: lea rdx, [0x3010]",
                "0x103d: lea rcx, [0x3080]",
                "0x1044: xor r8d, r8d",
                "0x1047: call qword ptr [rbx+0x148]",
                "0x104d: add rsp, 0x48",
                "0x1051: ret",
            ],
            image(
                &[
                    (0x10, EFI_SMM_BASE2_PROTOCOL_GUID),
                    (0x20, EFI_SMM_VARIABLE_PROTOCOL_GUID),
                    (0x30, EFI_SMM_CPU_PROTOCOL_GUID),
                ],
                &[],
            ),
        );
        let (uses, logs) = interface_uses(&module, &guids, single_threaded());
        assert!(logs.is_empty());
        let found: Vec<(u64, u64, Guid)> = uses
            .iter()
            .map(|interface| (interface.guid_address, interface.xref_address, interface.guid))
            .collect();
        assert_eq!(
            found,
            vec![
                (0x3010, 0x1036, EFI_SMM_BASE2_PROTOCOL_GUID),
                (0x3020, 0x102f, EFI_SMM_VARIABLE_PROTOCOL_GUID),
                (0x3030, 0x1008, EFI_SMM_CPU_PROTOCOL_GUID),
            ]
        );
        assert!(uses
            .iter()
            .all(|interface| interface.service_name == "InstallMultipleProtocolInterfaces"));
    }

    #[test]
    fn zero_guid_terminates_interface_pairs() {
        let guids = GuidDb::with_well_known();
        let module = dxe_module(
            insns![
                "0x1000: sub rsp, 0x48",
                "0x1004: mov rbx, qword ptr [rdx+0x60]",
                "0x1008: lea rax, [0x3030]",
                "0x100f: mov qword ptr [rsp+0x28], rax",
                "0x1014: lea rax, [0x3050]",
                "0x101b: mov qword ptr [rsp+0x38], rax",
                "0x1020: mov qword ptr [rsp+0x30], 0x0",
                "0x1029: mov qword ptr [rsp+0x20], 0x0",
                "0x1032: lea r9, [0x3020]",
                "0x1039: lea rdx, [0x3010]",
                "0x1040: lea rcx, [0x3080]",
                "0x1047: xor r8d, r8d",
                "0x104a: call qword ptr [rbx+0x148]",
                "0x1050: add rsp, 0x48",
                "0x1054: ret",
            ],
            image(
                &[
                    (0x10, EFI_SMM_BASE2_PROTOCOL_GUID),
                    (0x20, EFI_SMM_VARIABLE_PROTOCOL_GUID),
                    (0x30, EFI_SMM_CPU_PROTOCOL_GUID),
                ],
                &[],
            ),
        );
        let (uses, logs) = interface_uses(&module, &guids, single_threaded());
        assert!(logs.is_empty());
        assert_eq!(uses.len(), 3);
        assert!(uses.iter().all(|interface| !interface.guid.is_zero()));
        assert_eq!(uses[2].guid_address, 0x3030);
    }

    fn pei_module(descriptors: &[u8]) -> FirmwareModule {
        FirmwareModule::mock_with_data(
            MachineType::I386,
            FileType::Pei,
            vec![insns![
                "0x1000: mov eax, dword ptr [esp+0x8]",
                "0x1004: mov ecx, dword ptr [eax]",
                "0x1006: push 0x3040",
                "0x100b: push eax",
                "0x100c: call dword ptr [ecx+0x18]",
                "0x100f: add esp, 0x8",
                "0x1012: ret",
            ]],
            image(
                &[
                    (0x10, EFI_SMM_BASE2_PROTOCOL_GUID),
                    (0x20, EFI_SMM_VARIABLE_PROTOCOL_GUID),
                ],
                &[(0x40, descriptors)],
            ),
        )
    }

    const DESCRIPTORS: [u8; 24] = [
        0x10, 0, 0, 0, 0x10, 0x30, 0, 0, 0, 0, 0, 0, //
        0x10, 0, 0, 0x80, 0x20, 0x30, 0, 0, 0, 0, 0, 0,
    ];

    #[test]
    fn ppi_descriptor_list() {
        let guids = GuidDb::with_well_known();
        let module = pei_module(&DESCRIPTORS);
        let (uses, logs) = interface_uses(&module, &guids, single_threaded());
        assert!(logs.is_empty());
        assert_eq!(uses.len(), 2);
        assert!(uses.iter().all(|interface| interface.kind == InterfaceKind::Ppi
            && interface.service_name == "InstallPpi"
            && interface.xref_address == 0x1006));
        assert_eq!(uses[0].guid_address, 0x3010);
        assert_eq!(uses[1].guid, EFI_SMM_VARIABLE_PROTOCOL_GUID);
    }

    #[test]
    fn unterminated_ppi_descriptor_list() {
        let guids = GuidDb::with_well_known();
        let module = pei_module(&DESCRIPTORS);
        let config = AnalysisConfig {
            max_ppi_descriptors: 1,
            ..single_threaded()
        };
        let (uses, logs) = interface_uses(&module, &guids, config);
        assert_eq!(uses.len(), 1);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, Some(DiagnosticKind::MalformedGuidTableEntry));
    }

    #[test]
    fn parallel_resolution_is_deterministic() {
        let guids = GuidDb::with_well_known();
        let module = pei_module(&DESCRIPTORS);
        let config = AnalysisConfig {
            worker_threads: 4,
            ..Default::default()
        };
        let (parallel, _) = interface_uses(&module, &guids, config);
        let context = mock_context(&module, &guids);
        let tables = locate_tables(&context);
        let (calls, _) = resolve_services(&context, &tables);
        let (sequential, _) = resolve_protocols(&context, &calls);
        assert_eq!(parallel, sequential);
    }
}
