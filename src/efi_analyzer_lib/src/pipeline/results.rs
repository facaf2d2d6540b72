use crate::analysis::guids::GuidRecord;
use crate::analysis::nvram::NvramVariable;
use crate::analysis::protocols::InterfaceUse;
use crate::analysis::services::ServiceCall;
use crate::analysis::smi_handlers::SmiHandler;
use crate::analysis::table_anchors::GlobalTable;
use crate::analysis::{AnalysisContext, CallGraph};
use crate::intermediate_representation::FileType;
use std::collections::BTreeSet;

/// A struct containing pointers to all analysis results
/// that the detectors may need as input.
#[derive(Clone, Copy)]
pub struct AnalysisResults<'a> {
    /// The context of the analyzed module.
    pub context: &'a AnalysisContext<'a>,
    /// The call graph over the direct calls of the module.
    pub call_graph: &'a CallGraph,
    pub guids: &'a [GuidRecord],
    /// Globals holding firmware table pointers.
    pub globals: &'a [GlobalTable],
    /// All named service calls, sorted by call address.
    pub service_calls: &'a [ServiceCall],
    pub interface_uses: &'a [InterfaceUse],
    pub smi_handlers: &'a [SmiHandler],
    pub nvram_variables: &'a [NvramVariable],
}

impl<'a> AnalysisResults<'a> {
    /// Create a new `AnalysisResults` struct with only the context and the call graph known.
    pub fn new(context: &'a AnalysisContext<'a>, call_graph: &'a CallGraph) -> AnalysisResults<'a> {
        AnalysisResults {
            context,
            call_graph,
            guids: &[],
            globals: &[],
            service_calls: &[],
            interface_uses: &[],
            smi_handlers: &[],
            nvram_variables: &[],
        }
    }

    /// Create a new `AnalysisResults` struct containing the given service calls and interface uses.
    pub fn with_services(
        self,
        service_calls: &'a [ServiceCall],
        interface_uses: &'a [InterfaceUse],
    ) -> AnalysisResults<'a> {
        AnalysisResults {
            service_calls,
            interface_uses,
            ..self
        }
    }

    /// Create a new `AnalysisResults` struct containing the given GUIDs and globals.
    pub fn with_guids(self, guids: &'a [GuidRecord], globals: &'a [GlobalTable]) -> AnalysisResults<'a> {
        AnalysisResults {
            guids,
            globals,
            ..self
        }
    }

    /// Create a new `AnalysisResults` struct containing the given SMI handlers.
    pub fn with_smi_handlers(self, smi_handlers: &'a [SmiHandler]) -> AnalysisResults<'a> {
        AnalysisResults { smi_handlers, ..self }
    }

    /// Create a new `AnalysisResults` struct containing the given `GetVariable` calls.
    pub fn with_nvram_variables(self, nvram_variables: &'a [NvramVariable]) -> AnalysisResults<'a> {
        AnalysisResults {
            nvram_variables,
            ..self
        }
    }

    pub fn file_type(&self) -> FileType {
        self.context.file_type
    }

    /// The functions executed in SMM context:
    /// the SMI handlers and all functions reachable from them within `max_call_depth` direct calls.
    pub fn smm_context_functions(&self, max_call_depth: usize) -> BTreeSet<u64> {
        self.call_graph.reachable_within(
            self.smi_handlers.iter().map(|handler| handler.function),
            max_call_depth,
        )
    }
}
