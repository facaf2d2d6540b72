//! The stages of the UEFI interface analysis.
//!
//! The stages form a linear pipeline:
//! 1. The [architecture resolver](Strategy::resolve) selects the strategy for the machine type of the module.
//! 2. The [table-anchor locator](table_anchors) finds the registers, stack slots and globals holding
//!    pointers to the firmware service tables.
//! 3. The [service resolver](services) matches calls through these pointers against the table layouts,
//!    the [protocol resolver](protocols) resolves the GUID arguments of protocol and PPI related services.
//! 4. The [NVRAM analyzer](nvram) and the [SMI handler discovery](smi_handlers) specialize the resolved service calls.
//!
//! All stages operate on the read-only [`AnalysisContext`] of a module
//! and return their results together with the generated log messages.
//! The per-function work of the stages is distributed over a [worker pool](parallel_map).

use crate::intermediate_representation::{BinaryFacts, FileType};
use crate::prelude::*;
use crate::uefi::{FieldLayout, GuidDatabase, ServiceTable, TypeLayout};
use crate::utils::log::{DiagnosticKind, LogMessage};
use std::collections::BTreeMap;

mod architecture;
pub use architecture::*;
mod frame;
pub use frame::*;
mod dataflow;
pub use dataflow::*;
mod worker;
pub use worker::*;

pub mod callgraph;
pub use callgraph::CallGraph;
pub mod guids;
pub mod nvram;
pub mod protocols;
pub mod services;
pub mod smi_handlers;
pub mod table_anchors;
pub use table_anchors::Pointer;

/// The configuration of the analysis stages, read from the `Analysis` section of the configuration file.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Maximum number of instructions decoded per function.
    pub max_function_instructions: usize,
    /// Maximum number of instructions visited by the forward scan of the table-anchor locator per function.
    pub max_scan_instructions: usize,
    /// Maximum number of instructions the backward tracer looks at.
    pub backward_window: usize,
    /// Maximum number of propagation rounds of the table-anchor locator.
    pub max_anchor_rounds: usize,
    /// Maximum number of (GUID, interface) pairs read from a variadic protocol service call.
    pub max_interface_pairs: usize,
    /// Maximum number of entries read from a PPI descriptor list.
    pub max_ppi_descriptors: usize,
    /// Alignment of the GUIDs searched in the data segments.
    pub guid_scan_alignment: u64,
    /// Number of instructions after the first store that may contribute to a GUID built on the stack.
    pub local_guid_window: usize,
    /// Maximum number of UTF-16 characters of a variable name.
    pub max_variable_name_length: usize,
    /// Number of instructions searched backwards for the initialization of a `GetVariable` data size.
    pub size_origin_window: usize,
    /// Maximum distance between a size comparison and the conditional branch using its result.
    pub guard_branch_distance: usize,
    /// Number of worker threads. Zero uses all available cores.
    pub worker_threads: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            max_function_instructions: 4096,
            max_scan_instructions: 8192,
            backward_window: 64,
            max_anchor_rounds: 4,
            max_interface_pairs: 16,
            max_ppi_descriptors: 16,
            guid_scan_alignment: 4,
            local_guid_window: 8,
            max_variable_name_length: 128,
            size_origin_window: 256,
            guard_branch_distance: 4,
            worker_threads: 0,
        }
    }
}

impl AnalysisConfig {
    /// Read the `Analysis` section of the configuration.
    /// Missing values are replaced by their defaults.
    pub fn from_config(config: &serde_json::Value) -> Result<AnalysisConfig, Error> {
        match config.get("Analysis") {
            Some(section) => serde_json::from_value(section.clone())
                .context("Invalid Analysis section in the configuration"),
            None => Ok(AnalysisConfig::default()),
        }
    }
}

/// The table layouts used by one analysis run.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Layouts {
    layouts: BTreeMap<ServiceTable, TypeLayout>,
}

impl Layouts {
    /// Import the layouts of all known tables from the binary facts.
    ///
    /// Imported layouts are normalized, so that each offset maps to exactly one field.
    pub fn import(facts: &dyn BinaryFacts, pointer_size: u64) -> (Layouts, Vec<LogMessage>) {
        let mut layouts = BTreeMap::new();
        let mut logs = Vec::new();
        for table in ServiceTable::all() {
            let imported = facts.type_layout(table, pointer_size);
            let fields: Vec<FieldLayout> = imported.fields().to_vec();
            let (layout, layout_logs) = TypeLayout::from_fields(imported.type_name, pointer_size, fields);
            logs.extend(layout_logs);
            layouts.insert(table, layout);
        }
        (Layouts { layouts }, logs)
    }

    pub fn get(&self, table: ServiceTable) -> Option<&TypeLayout> {
        self.layouts.get(&table)
    }

    /// The name of the method at the given offset of a table.
    pub fn method_at(&self, table: ServiceTable, offset: u64) -> Option<&str> {
        self.get(table)?.method_at(offset)
    }

    /// The offset of the named field of a table.
    pub fn offset_of(&self, table: ServiceTable, name: &str) -> Option<u64> {
        self.get(table)?.offset_of(name)
    }
}

/// Everything the analysis stages need to know about the analyzed module.
pub struct AnalysisContext<'a> {
    pub facts: &'a dyn BinaryFacts,
    pub guids: &'a dyn GuidDatabase,
    pub strategy: Strategy,
    pub profile: &'static ArchProfile,
    /// The firmware phase of the module, inferred if the binary facts do not know it.
    pub file_type: FileType,
    pub layouts: Layouts,
    /// The decoded functions of the module, sorted by start address.
    pub bodies: Vec<FunctionBody>,
    pub config: AnalysisConfig,
}

impl<'a> AnalysisContext<'a> {
    /// Resolve the strategy for the module and decode all of its functions.
    pub fn new(
        facts: &'a dyn BinaryFacts,
        guids: &'a dyn GuidDatabase,
        config: AnalysisConfig,
    ) -> Result<(AnalysisContext<'a>, Vec<LogMessage>), AnalysisError> {
        let strategy = Strategy::resolve(facts.module_info())?;
        Ok(AnalysisContext::with_strategy(facts, guids, strategy, config))
    }

    /// Create the context for an already selected strategy.
    pub fn with_strategy(
        facts: &'a dyn BinaryFacts,
        guids: &'a dyn GuidDatabase,
        strategy: Strategy,
        config: AnalysisConfig,
    ) -> (AnalysisContext<'a>, Vec<LogMessage>) {
        let profile = strategy.profile();
        let mut logs = Vec::new();
        let file_type = match facts.module_info().file_type {
            FileType::Unknown => {
                let file_type = strategy.infer_file_type(guids::has_smm_markers(facts));
                logs.push(
                    LogMessage::new_info(format!("Assuming a {} module", file_type))
                        .source("Architecture Resolver"),
                );
                file_type
            }
            file_type => file_type,
        };
        let (layouts, layout_logs) = Layouts::import(facts, profile.pointer_size);
        logs.extend(layout_logs);
        let functions = facts.functions();
        let bodies = parallel_map(&functions, config.worker_threads, |function| {
            FunctionBody::decode(facts, function, profile, config.max_function_instructions)
        });
        for body in bodies.iter().filter(|body| body.truncated) {
            logs.push(
                LogMessage::new_debug(format!(
                    "Decoding stopped after {} instructions",
                    body.len()
                ))
                .location(body.start())
                .source("Function Decoder")
                .kind(DiagnosticKind::ScanBoundReached),
            );
        }
        let context = AnalysisContext {
            facts,
            guids,
            strategy,
            profile,
            file_type,
            layouts,
            bodies,
            config,
        };
        (context, logs)
    }

    /// The decoded function starting at the given address.
    pub fn body(&self, start: u64) -> Option<&FunctionBody> {
        self.bodies
            .binary_search_by_key(&start, FunctionBody::start)
            .ok()
            .map(|index| &self.bodies[index])
    }

    /// A backward tracer for the given function using the configured window.
    pub fn tracer<'b>(&self, body: &'b FunctionBody) -> Tracer<'b> {
        Tracer::new(body, self.profile, self.config.backward_window)
    }

    /// Returns `true` if the module is an EFI runtime driver.
    pub fn is_runtime_driver(&self) -> bool {
        self.facts.module_info().is_runtime_driver()
    }
}

/// The capabilities shared by all strategies.
///
/// Each stage is implemented once and parameterized by the calling convention
/// and the entry point conventions of the strategy.
impl Strategy {
    /// Find the table anchors of all functions.
    pub fn locate_tables(&self, context: &AnalysisContext) -> table_anchors::TableAnalysis {
        table_anchors::locate_tables(context)
    }

    /// Name the calls through the located tables.
    pub fn resolve_services(
        &self,
        context: &AnalysisContext,
        tables: &table_anchors::TableAnalysis,
    ) -> (Vec<services::ServiceCall>, Vec<LogMessage>) {
        services::resolve_services(context, tables)
    }

    /// Resolve the GUID arguments of protocol and PPI related service calls.
    pub fn resolve_protocols(
        &self,
        context: &AnalysisContext,
        calls: &[services::ServiceCall],
    ) -> (Vec<protocols::InterfaceUse>, Vec<LogMessage>) {
        protocols::resolve_protocols(context, calls)
    }

    /// Find the functions registered as SMI handlers.
    pub fn detect_smi_handlers(
        &self,
        context: &AnalysisContext,
        calls: &[services::ServiceCall],
    ) -> (Vec<smi_handlers::SmiHandler>, Vec<LogMessage>) {
        smi_handlers::detect_smi_handlers(context, calls)
    }

    /// Analyze the arguments of the `GetVariable`-like service calls.
    pub fn analyze_variables(
        &self,
        context: &AnalysisContext,
        calls: &[services::ServiceCall],
    ) -> (Vec<nvram::NvramVariable>, Vec<LogMessage>) {
        nvram::analyze_variables(context, calls)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::intermediate_representation::{FirmwareModule, MachineType};
    use crate::uefi::GuidDb;

    /// Create the context of a mock module using a single worker thread.
    pub fn mock_context<'a>(module: &'a FirmwareModule, guids: &'a GuidDb) -> AnalysisContext<'a> {
        let config = AnalysisConfig {
            worker_threads: 1,
            ..Default::default()
        };
        AnalysisContext::new(module, guids, config).unwrap().0
    }

    #[test]
    fn config_section() {
        let config = serde_json::json!({
            "Analysis": { "backward_window": 16, "worker_threads": 2 }
        });
        let config = AnalysisConfig::from_config(&config).unwrap();
        assert_eq!(config.backward_window, 16);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.max_anchor_rounds, 4);
        let config = AnalysisConfig::from_config(&serde_json::json!({})).unwrap();
        assert_eq!(config, AnalysisConfig::default());
        assert!(AnalysisConfig::from_config(&serde_json::json!({ "Analysis": { "backward_window": "x" } })).is_err());
    }

    #[test]
    fn context_infers_file_type() {
        let guids = GuidDb::with_well_known();
        let module = FirmwareModule::mock(MachineType::I386, FileType::Unknown, Vec::new());
        let (context, logs) = AnalysisContext::new(&module, &guids, AnalysisConfig::default()).unwrap();
        assert_eq!(context.file_type, FileType::Pei);
        assert_eq!(context.strategy, Strategy::X86);
        assert_eq!(logs.len(), 1);
        let module = FirmwareModule::mock(MachineType::Other(0x1c2), FileType::Dxe, Vec::new());
        assert!(matches!(
            AnalysisContext::new(&module, &guids, AnalysisConfig::default()),
            Err(AnalysisError::UnsupportedArchitecture { machine: 0x1c2 })
        ));
    }

    #[test]
    fn context_decodes_functions() {
        let guids = GuidDb::new();
        let module = FirmwareModule::mock(
            MachineType::Amd64,
            FileType::Dxe,
            vec![
                crate::insns!["0x2000: nop", "0x2001: ret"],
                crate::insns!["0x1000: ret"],
            ],
        );
        let context = mock_context(&module, &guids);
        assert_eq!(context.bodies.len(), 2);
        assert_eq!(context.body(0x2000).unwrap().len(), 2);
        assert!(context.body(0x2001).is_none());
        assert_eq!(
            context.layouts.method_at(ServiceTable::BootServices, 0x140),
            Some("LocateProtocol")
        );
    }
}
