//! Locate the firmware service tables in the functions of a module.
//!
//! Each function is scanned forward, starting with the pointers known at its entry,
//! and the registers, stack slots and globals holding a table pointer are tracked.
//! Loading a table field that points to another table yields a new anchor,
//! e.g. `mov rax, [rdx+0x60]` loads the Boot Services pointer from the System Table.
//! Calls through a method field of a tracked table are recorded as [`TableCall`]s.
//!
//! Table pointers stored to globals and table pointers passed to direct callees
//! are propagated to all other functions.
//! The scan is repeated until no new global or callee argument is found
//! or the configured number of rounds is reached.
//!
//! SMM modules usually obtain the SMM System Table through `EFI_SMM_BASE2_PROTOCOL.GetSmstLocation`,
//! which is recognized directly.
//! If this fails on x64, globals whose content is called at the offsets of `SmmLocateProtocol`
//! or `SmiHandlerRegister` with a known GUID argument are assumed to hold the SMST.

use super::{parallel_map, resolve_guid, AnalysisContext, FunctionBody, Location, Tracer, Value};
use crate::intermediate_representation::{FileType, MemoryOperand, Mnemonic};
use crate::prelude::*;
use crate::uefi::{interface_service, FieldKind, GuidArgument, ServiceTable};
use crate::utils::log::{DiagnosticKind, LogMessage};
use std::collections::{BTreeMap, BTreeSet};

const SOURCE: &str = "Table Anchors";

/// The maximum number of instructions of the PEI services getter.
const PEI_GETTER_MAX_INSTRUCTIONS: usize = 32;

/// A firmware pointer tracked by the table-anchor locator.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum Pointer {
    ImageHandle,
    /// A pointer to a service table or protocol interface.
    Table(ServiceTable),
    /// A pointer to a pointer to a service table, e.g. `EFI_PEI_SERVICES**`.
    TablePointer(ServiceTable),
    /// A method of a table, loaded from the field at the given offset.
    Method(ServiceTable, u64),
    /// The content of a global that is not known to hold a table pointer.
    GlobalContent(u64),
    /// A function pointer loaded from the given offset of the object pointed to by a global.
    GlobalContentMethod(u64, u64),
}

impl Pointer {
    /// Returns `true` for pointers that are tracked through memory.
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            Pointer::ImageHandle | Pointer::Table(_) | Pointer::TablePointer(_)
        )
    }
}

/// A location holding a pointer to a table in a function.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct TableAnchor {
    pub function: u64,
    /// The address of the instruction defining the anchor,
    /// or the function start for anchors passed as arguments.
    pub address: u64,
    pub table: ServiceTable,
    pub location: Location,
}

/// A global variable holding a firmware pointer.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct GlobalTable {
    pub address: u64,
    /// The conventional name of the global, e.g. `gBS`.
    pub name: String,
    pub pointer: Pointer,
    /// The address of the instruction writing the global.
    pub set_at: u64,
}

impl GlobalTable {
    pub fn new(address: u64, pointer: Pointer, set_at: u64) -> GlobalTable {
        let name = match pointer {
            Pointer::Table(table) | Pointer::TablePointer(table) => table.global_name(),
            _ => "gImageHandle".to_string(),
        };
        GlobalTable {
            address,
            name,
            pointer,
            set_at,
        }
    }

    /// The table the global points to.
    pub fn table(&self) -> Option<ServiceTable> {
        match self.pointer {
            Pointer::Table(table) | Pointer::TablePointer(table) => Some(table),
            _ => None,
        }
    }
}

/// A call through the method field of a tracked table.
#[derive(Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct TableCall {
    pub function: u64,
    /// The index of the call instruction in the function body.
    pub call_index: usize,
    pub call_address: u64,
    pub table: ServiceTable,
    pub offset: u64,
    /// The location holding the table or method pointer at the call.
    pub base: Option<Location>,
}

/// A call through a function pointer read from the object pointed to by an untracked global.
#[derive(Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct GlobalCall {
    pub function: u64,
    pub call_index: usize,
    pub call_address: u64,
    pub global: u64,
    pub offset: u64,
}

/// The result of the table-anchor locator.
#[derive(Debug, Clone, Default)]
pub struct TableAnalysis {
    pub anchors: Vec<TableAnchor>,
    pub globals: Vec<GlobalTable>,
    pub calls: Vec<TableCall>,
    /// The start addresses of the functions returning the PEI services pointer.
    pub pei_getters: BTreeSet<u64>,
    /// Set if the SMST was located by the post-processing of calls through untracked globals.
    pub smst_post_processed: bool,
    pub logs: Vec<LogMessage>,
}

#[derive(Debug, Default)]
struct FunctionScan {
    function: u64,
    anchors: Vec<TableAnchor>,
    calls: Vec<TableCall>,
    global_calls: Vec<GlobalCall>,
    globals: Vec<GlobalTable>,
    /// Persistent pointers passed to direct callees as `(callee, argument index, pointer)`.
    callee_arguments: Vec<(u64, usize, Pointer)>,
    bound_reached: bool,
}

type State = BTreeMap<Location, Pointer>;

/// The forward scan of one function.
struct Scanner<'a> {
    context: &'a AnalysisContext<'a>,
    body: &'a FunctionBody,
    tracer: Tracer<'a>,
    globals: &'a BTreeMap<u64, GlobalTable>,
    pei_getters: &'a BTreeSet<u64>,
    scan: FunctionScan,
    recorded_anchors: BTreeSet<(Location, ServiceTable)>,
}

impl<'a> Scanner<'a> {
    fn new(
        context: &'a AnalysisContext<'a>,
        body: &'a FunctionBody,
        globals: &'a BTreeMap<u64, GlobalTable>,
        pei_getters: &'a BTreeSet<u64>,
    ) -> Scanner<'a> {
        Scanner {
            context,
            body,
            tracer: context.tracer(body),
            globals,
            pei_getters,
            scan: FunctionScan {
                function: body.start(),
                ..Default::default()
            },
            recorded_anchors: BTreeSet::new(),
        }
    }

    /// Scan all paths through the function.
    ///
    /// Every instruction is visited at most once.
    /// Conditional branches fork the state, unconditional jumps are followed inside of the function.
    /// Instructions not reachable from the function start are scanned afterwards with an empty state.
    fn run(mut self, entry_arguments: Option<&BTreeMap<usize, Pointer>>) -> FunctionScan {
        let body = self.body;
        let mut entry_state = State::new();
        for (argument, pointer) in entry_arguments.into_iter().flatten() {
            let location = FunctionBody::entry_argument(*argument, self.context.profile);
            self.assign(&mut entry_state, None, location, *pointer);
        }
        let budget = self.context.config.max_scan_instructions;
        let mut visited = vec![false; body.len()];
        let mut worklist = vec![(0, entry_state)];
        let mut steps = 0;
        'paths: loop {
            let Some((mut index, mut state)) = worklist.pop() else {
                match visited.iter().position(|visited| !visited) {
                    Some(index) => {
                        worklist.push((index, State::new()));
                        continue;
                    }
                    None => break,
                }
            };
            while index < body.len() && !visited[index] {
                if steps >= budget {
                    self.scan.bound_reached = true;
                    break 'paths;
                }
                steps += 1;
                visited[index] = true;
                self.step(&mut state, index);
                let instruction = &body.instructions[index];
                let target = instruction
                    .branch_target()
                    .and_then(|target| body.index_of(target));
                if instruction.mnemonic.is_return() {
                    continue 'paths;
                } else if instruction.mnemonic.is_conditional_branch() {
                    if let Some(target) = target.filter(|target| !visited[*target]) {
                        worklist.push((target, state.clone()));
                    }
                } else if instruction.mnemonic.is_unconditional_jump() {
                    match target {
                        Some(target) => {
                            index = target;
                            continue;
                        }
                        None => continue 'paths,
                    }
                }
                index += 1;
            }
        }
        self.scan
    }

    fn step(&mut self, state: &mut State, index: usize) {
        let body = self.body;
        let profile = self.context.profile;
        let instruction = &body.instructions[index];
        let operands = &instruction.operands;
        if instruction.mnemonic.is_call() {
            self.call(state, index);
            return;
        }
        match instruction.mnemonic {
            Mnemonic::Mov | Mnemonic::Ldr => match (operands.first(), operands.get(1)) {
                (Some(Operand::Register(target)), Some(source)) => {
                    let value = self.value_of(state, index, source);
                    self.define(state, index, Location::register(target), value);
                }
                (Some(Operand::Memory(target)), Some(source)) => {
                    let value = self.value_of(state, index, source);
                    let location = body.normalize(index, target, profile);
                    self.store(state, index, location, value);
                }
                _ => (),
            },
            Mnemonic::Str => {
                if let (Some(source), Some(Operand::Memory(target))) = (operands.first(), operands.get(1)) {
                    let value = self.value_of(state, index, source);
                    let location = body.normalize(index, target, profile);
                    self.store(state, index, location, value);
                }
            }
            Mnemonic::Stp => {
                if let (Some(first), Some(second), Some(Operand::Memory(target))) =
                    (operands.first(), operands.get(1), operands.get(2))
                {
                    let width = register_width(first, profile.pointer_size);
                    let location = body.normalize(index, target, profile);
                    let first_value = self.value_of(state, index, first);
                    let second_value = self.value_of(state, index, second);
                    self.store(state, index, location.clone(), first_value);
                    self.store(state, index, location.and_then(|l| next_slot(l, width)), second_value);
                }
            }
            Mnemonic::Ldp => {
                if let (Some(Operand::Register(first)), Some(Operand::Register(second)), Some(Operand::Memory(source))) =
                    (operands.first(), operands.get(1), operands.get(2))
                {
                    let width = first.byte_width();
                    let location = body.normalize(index, source, profile);
                    let first_value = location.as_ref().and_then(|l| self.lookup(state, l));
                    let second_value = location
                        .and_then(|l| next_slot(l, width))
                        .and_then(|l| self.lookup(state, &l));
                    self.define(state, index, Location::register(first), first_value);
                    self.define(state, index, Location::register(second), second_value);
                }
            }
            Mnemonic::Push => {
                let value = operands
                    .first()
                    .and_then(|source| self.value_of(state, index, source));
                let slot = body
                    .stack_delta(index)
                    .and_then(|delta| delta.checked_sub(profile.pointer_size as i64))
                    .map(Location::Stack);
                self.store(state, index, slot, value);
            }
            Mnemonic::Pop => {
                if let Some(Operand::Register(target)) = operands.first() {
                    let value = body
                        .stack_delta(index)
                        .and_then(|delta| state.get(&Location::Stack(delta)).copied());
                    self.define(state, index, Location::register(target), value);
                }
            }
            Mnemonic::Cmp | Mnemonic::Test => (),
            _ => {
                // Any other instruction overwrites its register target with an unknown value.
                if let Some(Operand::Register(target)) = operands.first() {
                    state.remove(&Location::register(target));
                }
            }
        }
    }

    /// Handle a call instruction.
    fn call(&mut self, state: &mut State, index: usize) {
        let body = self.body;
        let profile = self.context.profile;
        let instruction = &body.instructions[index];
        let (pointer, base) = match instruction.operands.first() {
            Some(Operand::Memory(memory)) => {
                let base = match &memory.base {
                    Some(register) if register.family().name() != "rip" => Some(Location::register(register)),
                    _ => body.normalize(index, memory, profile),
                };
                (self.load(state, index, memory), base)
            }
            Some(Operand::Register(register)) => (
                state.get(&Location::register(register)).copied(),
                Some(Location::register(register)),
            ),
            _ => (None, None),
        };
        let mut results = Vec::new();
        match pointer {
            Some(Pointer::Method(table, offset)) => {
                self.scan.calls.push(TableCall {
                    function: body.start(),
                    call_index: index,
                    call_address: instruction.address,
                    table,
                    offset,
                    base,
                });
                results = self.interface_results(index, table, offset);
            }
            Some(Pointer::GlobalContentMethod(global, offset)) => {
                self.scan.global_calls.push(GlobalCall {
                    function: body.start(),
                    call_index: index,
                    call_address: instruction.address,
                    global,
                    offset,
                });
            }
            _ => (),
        }
        let callee = instruction.branch_target();
        if let Some(callee) = callee {
            for argument in 0..profile.propagated_arguments {
                let Some(location) = body.call_argument(index, argument, profile) else {
                    continue;
                };
                if let Some(pointer) = state.get(&location).filter(|pointer| pointer.is_persistent()) {
                    self.scan.callee_arguments.push((callee, argument, *pointer));
                }
            }
        }
        state.retain(|location, _| match location {
            Location::Register(register) => !profile.is_volatile(register),
            _ => true,
        });
        if callee.map_or(false, |callee| self.pei_getters.contains(&callee)) {
            let location = Location::register(&profile.return_register());
            self.assign(state, Some(index), location, Pointer::TablePointer(ServiceTable::PeiServices));
        }
        for (location, pointer) in results {
            self.assign(state, Some(index), location, pointer);
        }
    }

    /// The interface pointers written by a call to a protocol or PPI service.
    ///
    /// Only interfaces with a known method table are returned, i.e. the SMST for `GetSmstLocation`
    /// and the interfaces identified by their GUID for the locate and handle services.
    fn interface_results(&self, index: usize, table: ServiceTable, offset: u64) -> Vec<(Location, Pointer)> {
        let Some(name) = self.context.layouts.method_at(table, offset) else {
            return Vec::new();
        };
        if table == ServiceTable::SmmBase2 && name == "GetSmstLocation" {
            return self
                .out_location(index, 1)
                .map(|location| vec![(location, Pointer::Table(ServiceTable::SmmServices))])
                .unwrap_or_default();
        }
        let Some(service) = interface_service(table, name) else {
            return Vec::new();
        };
        let (Some(GuidArgument::Direct(guid_argument)), Some(out_argument)) = (service.guid, service.interface_out) else {
            return Vec::new();
        };
        let interface = self
            .tracer
            .trace_argument(index, guid_argument)
            .and_then(|traced| resolve_guid(self.context.facts, &self.tracer, index, &traced))
            .and_then(|resolved| ServiceTable::for_interface_guid(&resolved.guid));
        match (interface, self.out_location(index, out_argument)) {
            (Some(interface), Some(location)) => vec![(location, Pointer::Table(interface))],
            _ => Vec::new(),
        }
    }

    /// The memory location an out-parameter of a call points to.
    fn out_location(&self, index: usize, argument: usize) -> Option<Location> {
        match self.tracer.trace_argument(index, argument)?.value {
            Value::StackAddress(slot) => Some(Location::Stack(slot)),
            Value::Address(address) | Value::Constant(address) if self.context.facts.is_mapped(address) => {
                Some(Location::Global(address))
            }
            _ => None,
        }
    }

    fn value_of(&self, state: &State, index: usize, operand: &Operand) -> Option<Pointer> {
        match operand {
            Operand::Register(register) => state.get(&Location::register(register)).copied(),
            Operand::Memory(memory) => self.load(state, index, memory),
            Operand::Immediate(_) | Operand::Address(_) => None,
        }
    }

    /// The pointer loaded by a memory operand.
    fn load(&self, state: &State, index: usize, memory: &MemoryOperand) -> Option<Pointer> {
        if let Some(location) = self.body.normalize(index, memory, self.context.profile) {
            return self.lookup(state, &location);
        }
        if memory.index.is_some() {
            return None;
        }
        let base = memory.base.as_ref()?;
        let pointer = *state.get(&Location::register(base))?;
        self.dereference(pointer, memory.displacement)
    }

    /// The pointer held by a stack slot or a global.
    fn lookup(&self, state: &State, location: &Location) -> Option<Pointer> {
        if let Some(pointer) = state.get(location) {
            return Some(*pointer);
        }
        match location {
            Location::Global(address) => match self.globals.get(address) {
                Some(global) => Some(global.pointer),
                None if self.context.facts.is_mapped(*address) => Some(Pointer::GlobalContent(*address)),
                None => None,
            },
            _ => None,
        }
    }

    /// The pointer loaded from the given offset of the object a pointer points to.
    fn dereference(&self, pointer: Pointer, displacement: i64) -> Option<Pointer> {
        let offset = u64::try_from(displacement).ok()?;
        match pointer {
            Pointer::Table(table) => match self.context.layouts.get(table)?.field_at(offset) {
                Some(field) => match field.kind {
                    FieldKind::Table(target) => Some(Pointer::Table(target)),
                    FieldKind::Method => Some(Pointer::Method(table, offset)),
                    _ => None,
                },
                // Unknown offsets are kept to report calls through them.
                None if offset % self.context.profile.pointer_size == 0 => Some(Pointer::Method(table, offset)),
                None => None,
            },
            Pointer::TablePointer(table) if offset == 0 => Some(Pointer::Table(table)),
            Pointer::GlobalContent(global) => Some(Pointer::GlobalContentMethod(global, offset)),
            _ => None,
        }
    }

    fn define(&mut self, state: &mut State, index: usize, location: Location, value: Option<Pointer>) {
        match value {
            Some(pointer) => self.assign(state, Some(index), location, pointer),
            None => {
                state.remove(&location);
            }
        }
    }

    /// Write a value to memory. Only persistent pointers are tracked in memory.
    fn store(&mut self, state: &mut State, index: usize, location: Option<Location>, value: Option<Pointer>) {
        let Some(location) = location else {
            return;
        };
        match value {
            Some(pointer) if pointer.is_persistent() => self.assign(state, Some(index), location, pointer),
            _ => {
                state.remove(&location);
            }
        }
    }

    /// Assign a pointer to a location and record new anchors and globals.
    fn assign(&mut self, state: &mut State, index: Option<usize>, location: Location, pointer: Pointer) {
        let address = index
            .and_then(|index| self.body.instructions.get(index))
            .map_or(self.body.start(), |instruction| instruction.address);
        if let Location::Global(global) = location {
            let is_new = !self.globals.contains_key(&global)
                && !self.scan.globals.iter().any(|known| known.address == global);
            if is_new && pointer.is_persistent() {
                self.scan.globals.push(GlobalTable::new(global, pointer, address));
            }
        }
        if let Pointer::Table(table) = pointer {
            if self.recorded_anchors.insert((location.clone(), table)) {
                self.scan.anchors.push(TableAnchor {
                    function: self.body.start(),
                    address,
                    table,
                    location: location.clone(),
                });
            }
        }
        state.insert(location, pointer);
    }
}

fn register_width(operand: &Operand, pointer_size: u64) -> u64 {
    operand
        .as_register()
        .map(Register::byte_width)
        .unwrap_or(pointer_size)
}

/// The location directly following a stack slot or global.
fn next_slot(location: Location, width: u64) -> Option<Location> {
    match location {
        Location::Stack(slot) => slot.checked_add(width as i64).map(Location::Stack),
        Location::Global(address) => address.checked_add(width).map(Location::Global),
        Location::Register(_) => None,
    }
}

/// Find the functions returning the PEI services pointer stored below the IDT.
///
/// These are small functions executing `sidt` and loading the pointer-sized value
/// right below the IDT base into the return register.
pub fn find_pei_services_getters(context: &AnalysisContext) -> BTreeSet<u64> {
    let profile = context.profile;
    let below = -(profile.pointer_size as i64);
    context
        .bodies
        .iter()
        .filter(|body| body.len() <= PEI_GETTER_MAX_INSTRUCTIONS)
        .filter(|body| {
            body.instructions
                .iter()
                .any(|instruction| instruction.mnemonic == Mnemonic::Sidt)
        })
        .filter(|body| {
            body.instructions.iter().any(|instruction| {
                match (&instruction.mnemonic, instruction.operand(0), instruction.operand(1)) {
                    (Mnemonic::Mov, Some(Operand::Register(target)), Some(Operand::Memory(source))) => {
                        target.same_family(&profile.return_register())
                            && source.base.is_some()
                            && source.index.is_none()
                            && source.displacement == below
                    }
                    _ => false,
                }
            })
        })
        .map(FunctionBody::start)
        .collect()
}

/// Scan all functions once.
fn scan_round(
    context: &AnalysisContext,
    globals: &BTreeMap<u64, GlobalTable>,
    arguments: &BTreeMap<u64, BTreeMap<usize, Pointer>>,
    pei_getters: &BTreeSet<u64>,
) -> Vec<FunctionScan> {
    parallel_map(&context.bodies, context.config.worker_threads, |body| {
        Scanner::new(context, body, globals, pei_getters).run(arguments.get(&body.start()))
    })
}

/// Merge the new globals and callee arguments of a round.
/// The first pointer found for a global or an argument is kept.
/// Returns `true` if anything new was found.
fn merge_round(
    scans: &[FunctionScan],
    globals: &mut BTreeMap<u64, GlobalTable>,
    arguments: &mut BTreeMap<u64, BTreeMap<usize, Pointer>>,
) -> bool {
    let mut changed = false;
    for scan in scans {
        for global in &scan.globals {
            if !globals.contains_key(&global.address) {
                globals.insert(global.address, global.clone());
                changed = true;
            }
        }
        for (callee, argument, pointer) in &scan.callee_arguments {
            let callee_arguments = arguments.entry(*callee).or_default();
            if !callee_arguments.contains_key(argument) {
                callee_arguments.insert(*argument, *pointer);
                changed = true;
            }
        }
    }
    changed
}

/// Find the globals holding the SMST by the calls through their content.
fn smst_from_global_calls(context: &AnalysisContext, scans: &[FunctionScan]) -> Vec<GlobalTable> {
    let services = [("SmmLocateProtocol", 0), ("SmiHandlerRegister", 1)];
    let candidates: Vec<(u64, usize)> = services
        .iter()
        .filter_map(|(name, guid_argument)| {
            context
                .layouts
                .offset_of(ServiceTable::SmmServices, name)
                .map(|offset| (offset, *guid_argument))
        })
        .collect();
    let mut found: BTreeMap<u64, u64> = BTreeMap::new();
    for scan in scans {
        let Some(body) = context.body(scan.function) else {
            continue;
        };
        let tracer = context.tracer(body);
        for call in &scan.global_calls {
            let Some((_, guid_argument)) = candidates.iter().find(|(offset, _)| *offset == call.offset) else {
                continue;
            };
            let is_known_guid = tracer
                .trace_argument(call.call_index, *guid_argument)
                .and_then(|traced| resolve_guid(context.facts, &tracer, call.call_index, &traced))
                .map_or(false, |resolved| context.guids.name_of(&resolved.guid).is_some());
            if is_known_guid {
                found.entry(call.global).or_insert(call.call_address);
            }
        }
    }
    found
        .into_iter()
        .map(|(address, set_at)| GlobalTable::new(address, Pointer::Table(ServiceTable::SmmServices), set_at))
        .collect()
}

fn has_smst_anchor(scans: &[FunctionScan]) -> bool {
    scans.iter().any(|scan| {
        scan.anchors
            .iter()
            .any(|anchor| anchor.table == ServiceTable::SmmServices)
    })
}

/// Locate the table anchors in all functions of the module.
pub fn locate_tables(context: &AnalysisContext) -> TableAnalysis {
    let mut logs = Vec::new();
    let pei_getters = if context.strategy.supports_pei_services_getter() && context.file_type == FileType::Pei {
        find_pei_services_getters(context)
    } else {
        BTreeSet::new()
    };
    let mut arguments: BTreeMap<u64, BTreeMap<usize, Pointer>> = BTreeMap::new();
    for entry_point in context.facts.entry_points() {
        let entry_arguments = arguments.entry(entry_point).or_default();
        for (argument, pointer) in context.strategy.entry_arguments(context.file_type) {
            entry_arguments.insert(argument, pointer);
        }
    }
    let mut globals = BTreeMap::new();
    let mut scans = scan_round(context, &globals, &arguments, &pei_getters);
    let mut smst_post_processed = false;
    let mut post_processing_done = false;
    let mut round = 1;
    loop {
        let mut changed = merge_round(&scans, &mut globals, &mut arguments);
        let needs_post_processing = !changed
            && !post_processing_done
            && context.file_type == FileType::Smm
            && context.strategy.supports_smst_post_processing()
            && !has_smst_anchor(&scans);
        if needs_post_processing {
            post_processing_done = true;
            for global in smst_from_global_calls(context, &scans) {
                logs.push(
                    LogMessage::new_info(format!("Assuming that {:#x} holds the SMST", global.address))
                        .location(global.set_at)
                        .source(SOURCE),
                );
                globals.entry(global.address).or_insert(global);
                smst_post_processed = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        if round >= context.config.max_anchor_rounds {
            logs.push(
                LogMessage::new_debug(format!(
                    "Table propagation stopped after {} rounds",
                    round
                ))
                .source(SOURCE)
                .kind(DiagnosticKind::ScanBoundReached),
            );
            break;
        }
        scans = scan_round(context, &globals, &arguments, &pei_getters);
        round += 1;
    }
    let mut analysis = TableAnalysis {
        globals: globals.into_values().collect(),
        pei_getters,
        smst_post_processed,
        ..Default::default()
    };
    for scan in scans {
        if scan.bound_reached {
            logs.push(
                LogMessage::new_debug("Forward scan stopped at the instruction bound")
                    .location(scan.function)
                    .source(SOURCE)
                    .kind(DiagnosticKind::ScanBoundReached),
            );
        }
        if scan.anchors.is_empty() && scan.calls.is_empty() {
            logs.push(
                LogMessage::new_debug("No service table anchor found")
                    .location(scan.function)
                    .source(SOURCE)
                    .kind(DiagnosticKind::TableAnchorNotFound),
            );
        }
        analysis.anchors.extend(scan.anchors);
        analysis.calls.extend(scan.calls);
    }
    analysis.logs = logs;
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tests::mock_context;
    use crate::analysis::AnalysisConfig;
    use crate::analysis::AnalysisContext;
    use crate::insns;
    use crate::intermediate_representation::{FirmwareModule, MachineType};
    use crate::uefi::{GuidDb, EFI_SMM_BASE2_PROTOCOL_GUID, EFI_SMM_VARIABLE_PROTOCOL_GUID};

    fn data_with_guids(guids: &[(u64, crate::uefi::Guid)]) -> Vec<(u64, Vec<u8>)> {
        let mut bytes = vec![0u8; 0x100];
        for (offset, guid) in guids {
            bytes[*offset as usize..*offset as usize + 16].copy_from_slice(&guid.to_bytes());
        }
        vec![(0x3000, bytes)]
    }

    fn dxe_module() -> FirmwareModule {
        FirmwareModule::mock_with_data(
            MachineType::Amd64,
            FileType::Dxe,
            vec![
                insns![
                    "0x1000: sub rsp, 0x28",
                    "0x1004: mov rax, qword ptr [rdx+0x60]",
                    "0x1008: mov qword ptr [0x3000], rax",
                    "0x1010: mov rbx, qword ptr [rdx+0x58]",
                    "0x1014: call 0x2000",
                    "0x1019: call qword ptr [rbx+0x48]",
                    "0x101c: add rsp, 0x28",
                    "0x1020: ret",
                ],
                insns![
                    "0x2000: mov rax, qword ptr [0x3000]",
                    "0x2008: call qword ptr [rax+0x140]",
                    "0x200e: ret",
                ],
            ],
            vec![(0x3000, vec![0; 0x100])],
        )
    }

    #[test]
    fn dxe_entry_point_anchors() {
        let guids = GuidDb::new();
        let module = dxe_module();
        let context = mock_context(&module, &guids);
        let analysis = locate_tables(&context);
        assert!(analysis.anchors.contains(&TableAnchor {
            function: 0x1000,
            address: 0x1000,
            table: ServiceTable::SystemTable,
            location: Location::register(&Register::new("rdx")),
        }));
        assert!(analysis.anchors.contains(&TableAnchor {
            function: 0x1000,
            address: 0x1004,
            table: ServiceTable::BootServices,
            location: Location::register(&Register::new("rax")),
        }));
        assert_eq!(analysis.globals.len(), 1);
        assert_eq!(analysis.globals[0].name, "gBS");
        assert_eq!(analysis.globals[0].set_at, 0x1008);
        let offsets: Vec<(u64, ServiceTable, u64)> = analysis
            .calls
            .iter()
            .map(|call| (call.call_address, call.table, call.offset))
            .collect();
        assert_eq!(
            offsets,
            vec![
                (0x1019, ServiceTable::RuntimeServices, 0x48),
                (0x2008, ServiceTable::BootServices, 0x140),
            ]
        );
        assert_eq!(
            analysis.calls[0].base,
            Some(Location::register(&Register::new("rbx")))
        );
    }

    #[test]
    fn callee_arguments_are_propagated() {
        let guids = GuidDb::new();
        let module = FirmwareModule::mock(
            MachineType::Amd64,
            FileType::Dxe,
            vec![
                insns![
                    "0x1000: mov rcx, rdx",
                    "0x1003: call 0x2000",
                    "0x1008: ret",
                ],
                insns![
                    "0x2000: mov rax, qword ptr [rcx+0x60]",
                    "0x2004: call qword ptr [rax+0x98]",
                    "0x200a: ret",
                ],
            ],
        );
        let context = mock_context(&module, &guids);
        let analysis = locate_tables(&context);
        assert!(analysis.anchors.iter().any(|anchor| anchor.function == 0x2000
            && anchor.table == ServiceTable::SystemTable
            && anchor.address == 0x2000));
        assert_eq!(analysis.calls.len(), 1);
        assert_eq!(analysis.calls[0].offset, 0x98);
    }

    #[test]
    fn cyclic_jump_terminates() {
        let guids = GuidDb::new();
        let module = FirmwareModule::mock(
            MachineType::Amd64,
            FileType::Dxe,
            vec![
                insns!["0x1000: ret"],
                insns![
                    "0x2000: mov rax, qword ptr [rbx]",
                    "0x2003: jne 0x2008",
                    "0x2005: jmp 0x2000",
                    "0x2008: jmp 0x2003",
                ],
            ],
        );
        let config = AnalysisConfig {
            worker_threads: 1,
            max_scan_instructions: 16,
            ..Default::default()
        };
        let (context, _) = AnalysisContext::new(&module, &guids, config).unwrap();
        let analysis = locate_tables(&context);
        assert!(analysis.calls.is_empty());
        assert!(analysis.logs.iter().any(|log| log.location == Some(0x2000)
            && log.kind == Some(DiagnosticKind::TableAnchorNotFound)));
        assert!(!analysis
            .logs
            .iter()
            .any(|log| log.kind == Some(DiagnosticKind::ScanBoundReached)));
    }

    #[test]
    fn scan_budget_is_reported() {
        let guids = GuidDb::new();
        let module = FirmwareModule::mock(
            MachineType::Amd64,
            FileType::Dxe,
            vec![insns!["0x1000: nop", "0x1001: nop", "0x1002: nop", "0x1003: ret"]],
        );
        let config = AnalysisConfig {
            worker_threads: 1,
            max_scan_instructions: 2,
            ..Default::default()
        };
        let (context, _) = AnalysisContext::new(&module, &guids, config).unwrap();
        let analysis = locate_tables(&context);
        assert!(analysis.logs.iter().any(|log| log.location == Some(0x1000)
            && log.kind == Some(DiagnosticKind::ScanBoundReached)));
    }

    #[test]
    fn smst_from_get_smst_location() {
        let guids = GuidDb::with_well_known();
        let module = FirmwareModule::mock_with_data(
            MachineType::Amd64,
            FileType::Smm,
            vec![insns![
                "0x1000: sub rsp, 0x28",
                "0x1004: mov rbx, qword ptr [rdx+0x60]",
                "0x1008: lea rcx, [0x3010]",
                "0x100f: xor edx, edx",
                "0x1011: lea r8, [0x3080]",
                "0x1018: call qword ptr [rbx+0x140]",
                "0x101e: mov rcx, qword ptr [0x3080]",
                "0x1025: lea rdx, [0x3088]",
                "0x102c: call qword ptr [rcx+0x8]",
                "0x102f: mov rax, qword ptr [0x3088]",
                "0x1036: lea rcx, [0x3020]",
                "0x103d: xor edx, edx",
                "0x103f: lea r8, [0x3090]",
                "0x1046: call qword ptr [rax+0xd0]",
                "0x104c: add rsp, 0x28",
                "0x1050: ret",
            ]],
            data_with_guids(&[
                (0x10, EFI_SMM_BASE2_PROTOCOL_GUID),
                (0x20, EFI_SMM_VARIABLE_PROTOCOL_GUID),
            ]),
        );
        let context = mock_context(&module, &guids);
        let analysis = locate_tables(&context);
        let names: Vec<&str> = analysis.globals.iter().map(|global| global.name.as_str()).collect();
        assert_eq!(names, vec!["gSmmBase2", "gSmst", "gSmmVariable"]);
        assert!(!analysis.smst_post_processed);
        let calls: Vec<(ServiceTable, u64)> = analysis
            .calls
            .iter()
            .map(|call| (call.table, call.offset))
            .collect();
        assert_eq!(
            calls,
            vec![
                (ServiceTable::BootServices, 0x140),
                (ServiceTable::SmmBase2, 0x8),
                (ServiceTable::SmmServices, 0xd0),
            ]
        );
    }

    #[test]
    fn smst_from_post_processing() {
        let guids = GuidDb::with_well_known();
        let module = FirmwareModule::mock_with_data(
            MachineType::Amd64,
            FileType::Smm,
            vec![
                insns!["0x1000: ret"],
                insns![
                    "0x2000: mov rax, qword ptr [0x3080]",
                    "0x2007: lea rcx, [0x3020]",
                    "0x200e: xor edx, edx",
                    "0x2010: lea r8, [0x3090]",
                    "0x2017: call qword ptr [rax+0xd0]",
                    "0x201d: mov rax, qword ptr [0x3080]",
                    "0x2024: call qword ptr [rax+0x50]",
                    "0x202a: ret",
                ],
            ],
            data_with_guids(&[(0x20, EFI_SMM_VARIABLE_PROTOCOL_GUID)]),
        );
        let context = mock_context(&module, &guids);
        let analysis = locate_tables(&context);
        assert!(analysis.smst_post_processed);
        assert_eq!(analysis.globals[0].address, 0x3080);
        assert_eq!(analysis.globals[0].name, "gSmst");
        assert_eq!(analysis.globals[0].set_at, 0x2017);
        let calls: Vec<(u64, u64)> = analysis
            .calls
            .iter()
            .map(|call| (call.call_address, call.offset))
            .collect();
        assert_eq!(calls, vec![(0x2017, 0xd0), (0x2024, 0x50)]);
    }

    #[test]
    fn pei_services_on_x86() {
        let guids = GuidDb::new();
        let module = FirmwareModule::mock(
            MachineType::I386,
            FileType::Pei,
            vec![
                insns![
                    "0x1000: push ebp",
                    "0x1001: mov ebp, esp",
                    "0x1003: mov eax, dword ptr [ebp+0xc]",
                    "0x1006: mov ecx, dword ptr [eax]",
                    "0x1008: push eax",
                    "0x1009: call dword ptr [ecx+0x20]",
                    "0x100c: call 0x2000",
                    "0x1011: mov edx, dword ptr [eax]",
                    "0x1013: call dword ptr [edx+0x18]",
                    "0x1016: leave",
                    "0x1017: ret",
                ],
                insns![
                    "0x2000: sub esp, 0x8",
                    "0x2003: sidt [esp]",
                    "0x2007: mov eax, dword ptr [esp+0x2]",
                    "0x200b: mov eax, dword ptr [eax-0x4]",
                    "0x200e: add esp, 0x8",
                    "0x2011: ret",
                ],
            ],
        );
        let context = mock_context(&module, &guids);
        let analysis = locate_tables(&context);
        assert_eq!(analysis.pei_getters, BTreeSet::from([0x2000]));
        let calls: Vec<(u64, ServiceTable, u64)> = analysis
            .calls
            .iter()
            .map(|call| (call.call_address, call.table, call.offset))
            .collect();
        assert_eq!(
            calls,
            vec![
                (0x1009, ServiceTable::PeiServices, 0x20),
                (0x1013, ServiceTable::PeiServices, 0x18),
            ]
        );
    }

    #[test]
    fn aarch64_entry_point() {
        let guids = GuidDb::new();
        let module = FirmwareModule::mock(
            MachineType::Arm64,
            FileType::Dxe,
            vec![insns![
                "0x1000: stp x29, x30, [sp, #-0x10]!",
                "0x1004: mov x29, sp",
                "0x1008: ldr x8, [x1, #0x60]",
                "0x100c: ldr x9, [x8, #0x140]",
                "0x1010: blr x9",
                "0x1014: ldp x29, x30, [sp], #0x10",
                "0x1018: ret",
            ]],
        );
        let context = mock_context(&module, &guids);
        let analysis = locate_tables(&context);
        assert!(analysis.anchors.iter().any(|anchor| anchor.table == ServiceTable::BootServices
            && anchor.location == Location::register(&Register::new("x8"))));
        assert_eq!(analysis.calls.len(), 1);
        assert_eq!(analysis.calls[0].offset, 0x140);
        assert_eq!(
            analysis.calls[0].base,
            Some(Location::register(&Register::new("x9")))
        );
    }
}
