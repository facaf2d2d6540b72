use crate::analysis::guids::GuidRecord;
use crate::analysis::nvram::NvramVariable;
use crate::analysis::protocols::InterfaceUse;
use crate::analysis::services::ServiceCall;
use crate::analysis::smi_handlers::{SmiHandler, SmiHandlerKind};
use crate::analysis::table_anchors::GlobalTable;
use crate::analysis::Architecture;
use crate::intermediate_representation::FileType;
use crate::prelude::*;
use crate::utils::log::{Finding, LogMessage};

/// The result of the analysis of one firmware module.
///
/// All collections are sorted by address and unique per identity key after [`AnalysisReport::finalize`],
/// so that two runs on the same input produce identical reports.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct AnalysisReport {
    pub architecture: Architecture,
    pub file_type: FileType,
    /// GUIDs found in the image or assembled on the stack.
    pub guids: Vec<GuidRecord>,
    /// Globals holding firmware table or interface pointers.
    pub globals: Vec<GlobalTable>,
    pub service_calls: Vec<ServiceCall>,
    /// Uses of DXE and SMM protocols.
    pub protocols: Vec<InterfaceUse>,
    /// Uses of PEI PPIs.
    pub ppis: Vec<InterfaceUse>,
    pub smi_handlers: Vec<SmiHandler>,
    pub nvram_variables: Vec<NvramVariable>,
    pub findings: Vec<Finding>,
    /// The non-fatal problems encountered during the analysis.
    pub diagnostics: Vec<LogMessage>,
}

/// A name for an address of the module, e.g. for labeling it in a disassembler.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct Annotation {
    pub address: u64,
    pub name: String,
}

impl Annotation {
    fn new(address: u64, name: impl Into<String>) -> Annotation {
        Annotation {
            address,
            name: name.into(),
        }
    }
}

impl AnalysisReport {
    /// An empty report.
    pub fn new(architecture: Architecture, file_type: FileType) -> AnalysisReport {
        AnalysisReport {
            architecture,
            file_type,
            guids: Vec::new(),
            globals: Vec::new(),
            service_calls: Vec::new(),
            protocols: Vec::new(),
            ppis: Vec::new(),
            smi_handlers: Vec::new(),
            nvram_variables: Vec::new(),
            findings: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Sort all collections by address and remove duplicates.
    pub fn finalize(&mut self) {
        self.guids.sort();
        self.guids.dedup_by_key(|record| record.found_address);
        self.globals
            .sort_by(|a, b| (a.address, a.set_at, &a.name).cmp(&(b.address, b.set_at, &b.name)));
        self.globals.dedup_by_key(|global| global.address);
        self.service_calls.sort();
        self.service_calls
            .dedup_by(|a, b| a.call_address == b.call_address && a.service_name == b.service_name);
        for uses in [&mut self.protocols, &mut self.ppis] {
            uses.sort();
            uses.dedup_by(|a, b| {
                a.call_address == b.call_address
                    && a.service_name == b.service_name
                    && a.guid_address == b.guid_address
            });
        }
        self.smi_handlers.sort();
        self.smi_handlers
            .dedup_by_key(|handler| (handler.function, handler.register_call));
        self.nvram_variables.sort();
        self.nvram_variables.dedup_by_key(|variable| variable.call_address);
        self.findings
            .sort_by(|a, b| (a.address, a.kind).cmp(&(b.address, b.kind)));
        self.findings
            .dedup_by(|a, b| a.address == b.address && a.kind == b.kind);
        self.diagnostics.sort();
        self.diagnostics.dedup();
    }

    /// The names of all addresses resolved by the analysis, sorted by address.
    pub fn annotations(&self) -> Vec<Annotation> {
        let mut annotations = Vec::new();
        for record in &self.guids {
            let name = match &record.name {
                Some(name) => name.clone(),
                None => format!("GUID_{}", record.value),
            };
            annotations.push(Annotation::new(record.found_address, name));
        }
        for global in &self.globals {
            annotations.push(Annotation::new(global.address, global.name.clone()));
        }
        for call in &self.service_calls {
            annotations.push(Annotation::new(
                call.call_address,
                format!("{}->{}", call.table.global_name(), call.service_name),
            ));
        }
        for interface in self.protocols.iter().chain(self.ppis.iter()) {
            if let Some(name) = &interface.name {
                annotations.push(Annotation::new(interface.guid_address, name.clone()));
            }
        }
        for handler in &self.smi_handlers {
            let name = match handler.kind {
                SmiHandlerKind::Dispatch(kind) => format!("{:?}SmiHandler_{:x}", kind, handler.function),
                SmiHandlerKind::Root => format!("RootSmiHandler_{:x}", handler.function),
                SmiHandlerKind::Child => format!("ChildSmiHandler_{:x}", handler.function),
            };
            annotations.push(Annotation::new(handler.function, name));
        }
        for finding in &self.findings {
            annotations.push(Annotation::new(finding.address, finding.kind.to_string()));
        }
        annotations.sort();
        annotations.dedup();
        annotations
    }

    /// Serialize the report to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self).context("Could not serialize the analysis report")
    }
}

#[cfg(test)]
impl AnalysisReport {
    /// A report of an SMM module with one call, one handler and one finding, each contained twice.
    pub fn mock() -> AnalysisReport {
        use crate::analysis::Location;
        use crate::uefi::ServiceTable;
        use crate::utils::log::FindingKind;

        let mut report = AnalysisReport::new(Architecture::X64, FileType::Smm);
        let call = ServiceCall {
            call_address: 0x1010,
            service_name: "LocateProtocol".to_string(),
            table: ServiceTable::BootServices,
            offset: 0x140,
            function: 0x1000,
            table_base: Some(Location::Global(0x3000)),
            call_index: 1,
        };
        report.service_calls = vec![call.clone(), call];
        let handler = SmiHandler {
            function: 0x1000,
            kind: SmiHandlerKind::Root,
            dispatch_guid: None,
            guid_name: None,
            register_call: 0x2010,
        };
        report.smi_handlers = vec![handler.clone(), handler];
        let finding = Finding::new(FindingKind::SmmCallout, "SmmCallout", "0.1", 0x1010, "callout");
        report.findings = vec![finding.clone(), finding];
        report
    }
}
