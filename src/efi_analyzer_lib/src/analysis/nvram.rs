//! Analysis of the `GetVariable` calls of a module.
//!
//! For every call of a variable reading service the variable name, the vendor GUID
//! and the location of the `DataSize` variable are recovered.
//! The value of the `DataSize` variable before the call is classified by its origin:
//! A constant written to it, the result of a previous `GetVariable` call using the same variable,
//! or unknown.
//! A size comparison followed by a conditional branch between the origin and the call is recorded as guard.

use std::collections::BTreeMap;

use super::services::ServiceCall;
use super::{
    parallel_map, read_utf16_string, resolve_guid, AnalysisContext, FunctionBody, Location, Tracer, Value,
};
use crate::intermediate_representation::{FileType, Mnemonic};
use crate::prelude::*;
use crate::uefi::{variable_service, Guid, ServiceTable, VariableService};
use crate::utils::log::{DiagnosticKind, LogMessage};

const SOURCE: &str = "NVRAM Analyzer";

/// The firmware phase in which a `GetVariable` call is executed.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum CallContext {
    Boot,
    Runtime,
    Smm,
    Pei,
}

impl std::fmt::Display for CallContext {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallContext::Boot => write!(formatter, "boot"),
            CallContext::Runtime => write!(formatter, "runtime"),
            CallContext::Smm => write!(formatter, "SMM"),
            CallContext::Pei => write!(formatter, "PEI"),
        }
    }
}

/// The origin of the value of the `DataSize` variable right before a `GetVariable` call.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum SizeOrigin {
    /// The constant was written to the variable by the instruction at `address`.
    Constant { value: u64, address: u64 },
    /// The variable was last set by the `GetVariable` call at `call_address`.
    PreviousGetVariable { call_address: u64 },
    Unknown,
}

/// A `GetVariable` call site.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct NvramVariable {
    pub call_address: u64,
    pub service_name: String,
    /// The variable name, read from the module image.
    pub name: Option<String>,
    pub guid: Option<Guid>,
    pub guid_name: Option<String>,
    /// The location of the `DataSize` variable.
    pub size_argument: Option<Location>,
    pub size_origin: SizeOrigin,
    /// The address of the comparison guarding the size before the call.
    pub size_guard: Option<u64>,
    pub function: u64,
    pub context: CallContext,
}

/// Analyze all calls of variable reading services.
///
/// The result is sorted by call address.
pub fn analyze_variables(context: &AnalysisContext, calls: &[ServiceCall]) -> (Vec<NvramVariable>, Vec<LogMessage>) {
    let mut by_function: BTreeMap<u64, Vec<(&ServiceCall, &'static VariableService)>> = BTreeMap::new();
    for call in calls {
        if let Some(service) = variable_service(call.table, &call.service_name) {
            by_function.entry(call.function).or_default().push((call, service));
        }
    }
    let groups: Vec<_> = by_function.into_iter().collect();
    let results = parallel_map(&groups, context.config.worker_threads, |(function, calls)| {
        match context.body(*function) {
            Some(body) => analyze_function(context, body, calls),
            None => (Vec::new(), Vec::new()),
        }
    });
    let mut variables = Vec::new();
    let mut logs = Vec::new();
    for (function_variables, function_logs) in results {
        variables.extend(function_variables);
        logs.extend(function_logs);
    }
    variables.sort();
    (variables, logs)
}

/// The phase a variable service call is executed in.
fn call_context(context: &AnalysisContext, table: ServiceTable) -> CallContext {
    match table {
        ServiceTable::ReadOnlyVariable2 => CallContext::Pei,
        ServiceTable::SmmVariable => CallContext::Smm,
        _ => match context.file_type {
            FileType::Smm => CallContext::Smm,
            FileType::Pei => CallContext::Pei,
            _ if context.is_runtime_driver() => CallContext::Runtime,
            _ => CallContext::Boot,
        },
    }
}

fn analyze_function(
    context: &AnalysisContext,
    body: &FunctionBody,
    calls: &[(&ServiceCall, &VariableService)],
) -> (Vec<NvramVariable>, Vec<LogMessage>) {
    let tracer = context.tracer(body);
    let origin_tracer = Tracer::new(body, context.profile, context.config.size_origin_window);
    let mut logs = Vec::new();
    let size_locations: Vec<Option<Location>> = calls
        .iter()
        .map(|(call, service)| {
            let traced = tracer.trace_argument(call.call_index, service.size_argument)?;
            match traced.value {
                Value::StackAddress(slot) => Some(Location::Stack(slot)),
                Value::Address(address) | Value::Constant(address) if context.facts.is_mapped(address) => {
                    Some(Location::Global(address))
                }
                _ => None,
            }
        })
        .collect();

    let mut variables = Vec::new();
    for (index, (call, service)) in calls.iter().enumerate() {
        let name = tracer
            .trace_argument(call.call_index, service.name_argument)
            .and_then(|traced| traced.value.as_address())
            .and_then(|address| {
                read_utf16_string(context.facts, address, context.config.max_variable_name_length)
            });
        let guid = tracer
            .trace_argument(call.call_index, service.guid_argument)
            .and_then(|traced| resolve_guid(context.facts, &tracer, call.call_index, &traced))
            .map(|resolved| resolved.guid);
        let guid_name = guid
            .as_ref()
            .and_then(|guid| context.guids.name_of(guid))
            .map(str::to_string);
        let size_argument = size_locations[index].clone();
        let (size_origin, size_guard) = match &size_argument {
            Some(location) => {
                let previous = calls
                    .iter()
                    .zip(&size_locations)
                    .filter(|((other, _), other_location)| {
                        other.call_index < call.call_index
                            && call.call_index - other.call_index <= context.config.size_origin_window
                            && other_location.as_ref() == Some(location)
                    })
                    .map(|((other, _), _)| *other)
                    .max_by_key(|other| other.call_index);
                let (origin, origin_index) =
                    classify_size_origin(body, &origin_tracer, call.call_index, location, previous);
                let start = origin_index.unwrap_or_else(|| {
                    call.call_index.saturating_sub(context.config.size_origin_window)
                });
                let guard = find_guard(
                    context,
                    body,
                    start..call.call_index,
                    location,
                    context.config.guard_branch_distance,
                );
                (origin, guard)
            }
            None => {
                logs.push(
                    LogMessage::new_debug(format!(
                        "DataSize argument of {} not resolved, cannot assess the call",
                        call.service_name
                    ))
                    .location(call.call_address)
                    .source(SOURCE)
                    .kind(DiagnosticKind::UnresolvedOperand),
                );
                (SizeOrigin::Unknown, None)
            }
        };
        variables.push(NvramVariable {
            call_address: call.call_address,
            service_name: call.service_name.clone(),
            name,
            guid,
            guid_name,
            size_argument,
            size_origin,
            size_guard,
            function: call.function,
            context: call_context(context, call.table),
        });
    }
    (variables, logs)
}

/// Classify the value of the size variable before the call at `call_index`.
/// Also returns the index of the instruction after which the value is unchanged up to the call.
fn classify_size_origin(
    body: &FunctionBody,
    tracer: &Tracer,
    call_index: usize,
    location: &Location,
    previous: Option<&ServiceCall>,
) -> (SizeOrigin, Option<usize>) {
    let constant = tracer
        .trace(call_index, location.clone())
        .and_then(|traced| match traced.value {
            Value::Constant(value) => Some((body.index_of(traced.origin)?, value, traced.origin)),
            _ => None,
        });
    match (constant, previous) {
        (Some((constant_index, _, _)), Some(previous)) if previous.call_index < constant_index => {
            constant_origin(constant)
        }
        (_, Some(previous)) => (
            SizeOrigin::PreviousGetVariable {
                call_address: previous.call_address,
            },
            Some(previous.call_index + 1),
        ),
        (Some(_), None) => constant_origin(constant),
        (None, None) => (SizeOrigin::Unknown, None),
    }
}

fn constant_origin(constant: Option<(usize, u64, u64)>) -> (SizeOrigin, Option<usize>) {
    match constant {
        Some((index, value, address)) => (SizeOrigin::Constant { value, address }, Some(index + 1)),
        None => (SizeOrigin::Unknown, None),
    }
}

/// Find a comparison of the size variable that is followed by a conditional branch
/// within `distance` instructions. Only instructions in `range` are considered.
fn find_guard(
    context: &AnalysisContext,
    body: &FunctionBody,
    range: std::ops::Range<usize>,
    location: &Location,
    distance: usize,
) -> Option<u64> {
    let end = range.end;
    range.clone().find_map(|index| {
        let instruction = &body.instructions[index];
        if !matches!(instruction.mnemonic, Mnemonic::Cmp | Mnemonic::Test) {
            return None;
        }
        let compares_size = instruction.operands.iter().any(|operand| match operand {
            Operand::Memory(memory) => body.normalize(index, memory, context.profile).as_ref() == Some(location),
            Operand::Register(register) => loads_from(context, body, range.start, index, register, location),
            _ => false,
        });
        let branches = (index + 1..end.min(index + 1 + distance))
            .any(|branch| body.instructions[branch].mnemonic.is_conditional_branch());
        (compares_size && branches).then_some(instruction.address)
    })
}

/// Returns `true` if the register was last loaded from `location` before the instruction at `index`.
fn loads_from(
    context: &AnalysisContext,
    body: &FunctionBody,
    start: usize,
    index: usize,
    register: &Register,
    location: &Location,
) -> bool {
    let target = Location::register(register);
    for previous in (start..index).rev() {
        let instruction = &body.instructions[previous];
        if instruction.mnemonic.is_call() {
            return false;
        }
        let Some(destination) = instruction.operands.first() else {
            continue;
        };
        if body.operand_location(previous, destination, context.profile) == Some(target.clone())
            && !matches!(instruction.mnemonic, Mnemonic::Cmp | Mnemonic::Test | Mnemonic::Push)
        {
            return match (&instruction.mnemonic, instruction.operands.get(1)) {
                (Mnemonic::Mov | Mnemonic::Ldr, Some(Operand::Memory(memory))) => {
                    body.normalize(previous, memory, context.profile).as_ref() == Some(location)
                }
                _ => false,
            };
        }
    }
    false
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::analysis::services::resolve_services;
    use crate::analysis::table_anchors::locate_tables;
    use crate::analysis::tests::mock_context;
    use crate::intermediate_representation::{parsing, FirmwareModule, Instruction, MachineType};
    use crate::uefi::{GuidDb, EFI_GLOBAL_VARIABLE_GUID};

    /// Assemble the lines at consecutive addresses with 8 bytes per instruction starting at `0x1000`.
    /// The placeholder `{N}` is replaced by the address of the instruction with index `N`.
    pub fn assemble(lines: &[&str]) -> Vec<Instruction> {
        let address = |index: usize| 0x1000 + 8 * index as u64;
        let lines: Vec<String> = lines
            .iter()
            .enumerate()
            .map(|(index, line)| {
                let mut line = line.to_string();
                for target in 0..lines.len() {
                    line = line.replace(&format!("{{{}}}", target), &format!("{:#x}", address(target)));
                }
                format!("{:#x}: {}", address(index), line)
            })
            .collect();
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        parsing::parse_instructions(&lines)
    }

    /// The image data: the global variable GUID at `0x3010` and the name "Setup" at `0x3020`.
    pub fn variable_data() -> Vec<(u64, Vec<u8>)> {
        let mut bytes = vec![0u8; 0x100];
        bytes[0x10..0x20].copy_from_slice(&EFI_GLOBAL_VARIABLE_GUID.to_bytes());
        for (index, unit) in "Setup".encode_utf16().enumerate() {
            bytes[0x20 + 2 * index..0x22 + 2 * index].copy_from_slice(&unit.to_le_bytes());
        }
        vec![(0x3000, bytes)]
    }

    /// A DXE entry point calling `gRT->GetVariable` twice with the same `DataSize` variable.
    pub fn double_get_variable(guarded: bool) -> Vec<Instruction> {
        let mut lines = vec![
            "sub rsp, 0x48",
            "mov rbx, qword ptr [rdx+0x58]",
            "mov qword ptr [rsp+0x40], 0x8",
            "lea rax, [rsp+0x30]",
            "mov qword ptr [rsp+0x20], rax",
            "lea r9, [rsp+0x40]",
            "xor r8d, r8d",
            "lea rdx, [0x3010]",
            "lea rcx, [0x3020]",
            "call qword ptr [rbx+0x48]",
        ];
        if guarded {
            lines.extend(["cmp qword ptr [rsp+0x40], 0x8", "ja {19}"]);
        } else {
            lines.extend(["nop", "nop"]);
        }
        lines.extend([
            "lea rax, [rsp+0x30]",
            "mov qword ptr [rsp+0x20], rax",
            "lea r9, [rsp+0x40]",
            "xor r8d, r8d",
            "lea rdx, [0x3010]",
            "lea rcx, [0x3020]",
            "call qword ptr [rbx+0x48]",
            "add rsp, 0x48",
            "ret",
        ]);
        assemble(&lines)
    }

    fn variables(module: &FirmwareModule) -> (Vec<NvramVariable>, Vec<LogMessage>) {
        let guids = GuidDb::with_well_known();
        let context = mock_context(module, &guids);
        let tables = locate_tables(&context);
        let (calls, _) = resolve_services(&context, &tables);
        analyze_variables(&context, &calls)
    }

    #[test]
    fn size_origins() {
        let module = FirmwareModule::mock_with_data(
            MachineType::Amd64,
            FileType::Dxe,
            vec![double_get_variable(false)],
            variable_data(),
        );
        let (variables, logs) = variables(&module);
        assert!(logs.is_empty());
        assert_eq!(variables.len(), 2);
        for variable in &variables {
            assert_eq!(variable.name.as_deref(), Some("Setup"));
            assert_eq!(variable.guid, Some(EFI_GLOBAL_VARIABLE_GUID));
            assert_eq!(variable.guid_name.as_deref(), Some("EFI_GLOBAL_VARIABLE"));
            assert_eq!(variable.size_argument, Some(Location::Stack(-8)));
            assert_eq!(variable.size_guard, None);
            assert_eq!(variable.context, CallContext::Boot);
        }
        assert_eq!(
            variables[0].size_origin,
            SizeOrigin::Constant {
                value: 8,
                address: 0x1010
            }
        );
        assert_eq!(
            variables[1].size_origin,
            SizeOrigin::PreviousGetVariable { call_address: 0x1048 }
        );
    }

    #[test]
    fn size_guard() {
        let module = FirmwareModule::mock_with_data(
            MachineType::Amd64,
            FileType::Dxe,
            vec![double_get_variable(true)],
            variable_data(),
        );
        let (variables, _) = variables(&module);
        assert_eq!(variables[0].size_guard, None);
        assert_eq!(variables[1].size_guard, Some(0x1050));
    }

    #[test]
    fn guard_through_register() {
        let instructions = assemble(&[
            "sub rsp, 0x48",
            "mov rbx, qword ptr [rdx+0x58]",
            "lea r9, [rsp+0x40]",
            "mov rax, qword ptr [rsp+0x40]",
            "cmp rax, 0x10",
            "jbe {7}",
            "ret",
            "call qword ptr [rbx+0x48]",
            "add rsp, 0x48",
            "ret",
        ]);
        let module = FirmwareModule::mock(MachineType::Amd64, FileType::Smm, vec![instructions]);
        let (variables, _) = variables(&module);
        assert_eq!(variables.len(), 1);
        assert_eq!(variables[0].size_origin, SizeOrigin::Unknown);
        assert_eq!(variables[0].size_guard, Some(0x1020));
        assert_eq!(variables[0].context, CallContext::Smm);
        assert_eq!(variables[0].name, None);
    }

    #[test]
    fn unresolved_size_argument() {
        let instructions = assemble(&[
            "mov rbx, qword ptr [rdx+0x58]",
            "mov r9, qword ptr [rsi]",
            "call qword ptr [rbx+0x48]",
            "ret",
        ]);
        let module = FirmwareModule::mock(MachineType::Amd64, FileType::Dxe, vec![instructions]);
        let (variables, logs) = variables(&module);
        assert_eq!(variables.len(), 1);
        assert_eq!(variables[0].size_argument, None);
        assert_eq!(variables[0].size_origin, SizeOrigin::Unknown);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, Some(DiagnosticKind::UnresolvedOperand));
        assert_eq!(logs[0].location, Some(0x1010));
    }
}
