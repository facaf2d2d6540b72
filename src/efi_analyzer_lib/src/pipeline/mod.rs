//! This module contains the end-to-end analysis of a firmware module.
//!
//! The stages run strictly one after another:
//! table anchors, service calls, protocol and PPI uses, then SMI handlers and `GetVariable` calls,
//! and finally the detectors on the frozen results.
//! No stage re-invokes an earlier one.

mod results;
pub use results::AnalysisResults;
mod report;
pub use report::*;

use crate::analysis::guids::find_guids;
use crate::analysis::protocols::{InterfaceKind, InterfaceUse};
use crate::analysis::{AnalysisConfig, AnalysisContext, AnalysisError, Architecture, CallGraph, Strategy};
use crate::intermediate_representation::BinaryFacts;
use crate::prelude::*;
use crate::uefi::GuidDatabase;
use crate::utils::log::{Finding, LogMessage, LogThread};
use crate::DetectorModule;

/// Analyze a module with all known detectors.
///
/// Fails only if the machine type of the module is not supported
/// or if the `Analysis` section of the configuration is invalid.
pub fn analyze_module(
    facts: &dyn BinaryFacts,
    guids: &dyn GuidDatabase,
    config: &serde_json::Value,
) -> Result<AnalysisReport, Error> {
    let strategy = Strategy::resolve(facts.module_info())?;
    analyze_module_with(facts, guids, strategy, config, &crate::get_modules())
}

/// Analyze a 64-bit x86 module.
pub fn analyze_x64(
    facts: &dyn BinaryFacts,
    guids: &dyn GuidDatabase,
    config: &serde_json::Value,
) -> Result<AnalysisReport, Error> {
    analyze_architecture(facts, guids, config, Architecture::X64)
}

/// Analyze a 32-bit x86 module, usually a PEI module.
pub fn analyze_x86(
    facts: &dyn BinaryFacts,
    guids: &dyn GuidDatabase,
    config: &serde_json::Value,
) -> Result<AnalysisReport, Error> {
    analyze_architecture(facts, guids, config, Architecture::X86)
}

/// Analyze an AArch64 module.
pub fn analyze_arm(
    facts: &dyn BinaryFacts,
    guids: &dyn GuidDatabase,
    config: &serde_json::Value,
) -> Result<AnalysisReport, Error> {
    analyze_architecture(facts, guids, config, Architecture::Aarch64)
}

fn analyze_architecture(
    facts: &dyn BinaryFacts,
    guids: &dyn GuidDatabase,
    config: &serde_json::Value,
    expected: Architecture,
) -> Result<AnalysisReport, Error> {
    let strategy = Strategy::resolve(facts.module_info())?;
    if strategy.architecture() != expected {
        return Err(AnalysisError::ArchitectureMismatch {
            expected,
            found: strategy.architecture(),
        }
        .into());
    }
    analyze_module_with(facts, guids, strategy, config, &crate::get_modules())
}

/// Run all analysis stages with the given strategy and the given detectors.
pub fn analyze_module_with(
    facts: &dyn BinaryFacts,
    guids: &dyn GuidDatabase,
    strategy: Strategy,
    config: &serde_json::Value,
    modules: &[&DetectorModule],
) -> Result<AnalysisReport, Error> {
    let analysis_config = AnalysisConfig::from_config(config)?;
    let (context, mut diagnostics) = AnalysisContext::with_strategy(facts, guids, strategy, analysis_config);
    let guid_records = find_guids(&context);

    let tables = strategy.locate_tables(&context);
    diagnostics.extend(tables.logs.iter().cloned());
    let (service_calls, mut logs) = strategy.resolve_services(&context, &tables);
    diagnostics.append(&mut logs);
    let (interface_uses, mut logs) = strategy.resolve_protocols(&context, &service_calls);
    diagnostics.append(&mut logs);
    let (smi_handlers, mut logs) = strategy.detect_smi_handlers(&context, &service_calls);
    diagnostics.append(&mut logs);
    let (nvram_variables, mut logs) = strategy.analyze_variables(&context, &service_calls);
    diagnostics.append(&mut logs);

    let call_graph = CallGraph::new(&context.bodies);
    let results = AnalysisResults::new(&context, &call_graph)
        .with_guids(&guid_records, &tables.globals)
        .with_services(&service_calls, &interface_uses)
        .with_smi_handlers(&smi_handlers)
        .with_nvram_variables(&nvram_variables);
    let (mut logs, findings) = strategy.detect_vulnerabilities(&results, config, modules);
    diagnostics.append(&mut logs);

    let (protocols, ppis): (Vec<InterfaceUse>, Vec<InterfaceUse>) = interface_uses
        .into_iter()
        .partition(|interface| interface.kind == InterfaceKind::Protocol);
    let mut report = AnalysisReport {
        architecture: strategy.architecture(),
        file_type: context.file_type,
        guids: guid_records,
        globals: tables.globals,
        service_calls,
        protocols,
        ppis,
        smi_handlers,
        nvram_variables,
        findings,
        diagnostics,
    };
    report.finalize();
    Ok(report)
}

/// The configuration section of a detector.
///
/// This is the section named after the detector or, if there is none,
/// the section whose name is a prefix of the detector name,
/// e.g. `VariableOverflow` for `VariableOverflowSmm`.
fn module_config(config: &serde_json::Value, module_name: &str) -> serde_json::Value {
    if let Some(section) = config.get(module_name) {
        return section.clone();
    }
    config
        .as_object()
        .and_then(|sections| {
            sections
                .iter()
                .filter(|(name, _)| module_name.starts_with(name.as_str()))
                .max_by_key(|(name, _)| name.len())
                .map(|(_, section)| section.clone())
        })
        .unwrap_or_else(|| serde_json::json!({}))
}

impl Strategy {
    /// Run the given detectors on the analysis results.
    ///
    /// The logs and findings of all detectors are collected by a [`LogThread`],
    /// which removes duplicate findings.
    pub fn detect_vulnerabilities(
        &self,
        results: &AnalysisResults,
        config: &serde_json::Value,
        modules: &[&DetectorModule],
    ) -> (Vec<LogMessage>, Vec<Finding>) {
        let log_thread = LogThread::spawn(LogThread::collect_and_deduplicate);
        let sender = log_thread.get_msg_sender();
        for module in modules {
            let (logs, findings) = (module.run)(results, &module_config(config, module.name));
            for log in logs {
                let _ = sender.send(log.into());
            }
            for finding in findings {
                let _ = sender.send(finding.into());
            }
        }
        log_thread.collect()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::analysis::nvram::NvramVariable;
    use crate::analysis::services::ServiceCall;
    use crate::analysis::smi_handlers::tests::{smm_driver_data, smm_driver_entry};
    use crate::analysis::smi_handlers::SmiHandler;
    use crate::analysis::tests::mock_context;
    use crate::insns;
    use crate::intermediate_representation::{FileType, FirmwareModule, MachineType, Mnemonic};
    use crate::uefi::{GuidDb, ServiceTable};
    use crate::utils::log::FindingKind;
    use crate::DetectorModuleFn;

    /// Analysis results assembled by hand for testing the detectors.
    ///
    /// The module consists of the given functions, each calling the given callees and returning.
    pub struct MockResults {
        module: FirmwareModule,
        guids: GuidDb,
        pub service_calls: Vec<ServiceCall>,
        pub interface_uses: Vec<InterfaceUse>,
        pub smi_handlers: Vec<SmiHandler>,
        pub nvram_variables: Vec<NvramVariable>,
    }

    impl MockResults {
        pub fn new(functions: Vec<(u64, Vec<u64>)>) -> MockResults {
            let functions = functions
                .into_iter()
                .map(|(start, callees)| {
                    let mut instructions: Vec<Instruction> = callees
                        .iter()
                        .enumerate()
                        .map(|(index, callee)| {
                            Instruction::new(
                                start + 5 * index as u64,
                                5,
                                Mnemonic::Call,
                                vec![Operand::Address(*callee)],
                            )
                        })
                        .collect();
                    let ret_address = start + 5 * callees.len() as u64;
                    instructions.push(Instruction::new(ret_address, 1, Mnemonic::Ret, Vec::new()));
                    instructions
                })
                .collect();
            MockResults {
                module: FirmwareModule::mock(MachineType::Amd64, FileType::Smm, functions),
                guids: GuidDb::with_well_known(),
                service_calls: Vec::new(),
                interface_uses: Vec::new(),
                smi_handlers: Vec::new(),
                nvram_variables: Vec::new(),
            }
        }

        /// Add a service call.
        pub fn call(&mut self, call_address: u64, function: u64, table: ServiceTable, service_name: &str) {
            self.service_calls.push(ServiceCall {
                call_address,
                service_name: service_name.to_string(),
                table,
                offset: 0,
                function,
                table_base: None,
                call_index: 0,
            });
            self.service_calls.sort();
        }

        /// Run a detector on the mock results.
        pub fn run(&self, detector: DetectorModuleFn, params: &serde_json::Value) -> (Vec<LogMessage>, Vec<Finding>) {
            let context = mock_context(&self.module, &self.guids);
            let call_graph = CallGraph::new(&context.bodies);
            let results = AnalysisResults::new(&context, &call_graph)
                .with_services(&self.service_calls, &self.interface_uses)
                .with_smi_handlers(&self.smi_handlers)
                .with_nvram_variables(&self.nvram_variables);
            detector(&results, params)
        }
    }

    /// The SMM driver of the SMI handler tests, additionally storing `gBS` to `0x30c0`.
    /// The software SMI handler at `0x1100` calls `gBS->LocateProtocol`.
    fn smm_driver_with_callout() -> FirmwareModule {
        let mut entry = smm_driver_entry();
        entry.truncate(entry.len() - 2);
        entry.extend(insns![
            "0x10a9: mov qword ptr [0x30c0], rbx",
            "0x10b0: add rsp, 0x28",
            "0x10b4: ret",
        ]);
        FirmwareModule::mock_with_data(
            MachineType::Amd64,
            FileType::Smm,
            vec![
                entry,
                insns![
                    "0x1100: sub rsp, 0x28",
                    "0x1104: mov rax, qword ptr [0x30c0]",
                    "0x110b: lea rcx, [0x3010]",
                    "0x1112: xor edx, edx",
                    "0x1114: lea r8, [0x30c8]",
                    "0x111b: call qword ptr [rax+0x140]",
                    "0x1121: add rsp, 0x28",
                    "0x1125: ret",
                ],
                insns!["0x1200: ret"],
                insns!["0x1300: ret"],
            ],
            smm_driver_data(),
        )
    }

    #[test]
    fn smm_callout_end_to_end() {
        let module = smm_driver_with_callout();
        let guids = GuidDb::with_well_known();
        let config = serde_json::json!({ "Analysis": { "worker_threads": 2 } });
        let report = analyze_x64(&module, &guids, &config).unwrap();
        assert_eq!(report.architecture, Architecture::X64);
        assert_eq!(report.file_type, FileType::Smm);
        assert!(report
            .globals
            .iter()
            .any(|global| global.address == 0x30c0 && global.name == "gBS"));
        assert_eq!(report.smi_handlers.len(), 3);
        let callouts: Vec<u64> = report
            .findings
            .iter()
            .filter(|finding| finding.kind == FindingKind::SmmCallout)
            .map(|finding| finding.address)
            .collect();
        assert_eq!(callouts, vec![0x111b]);
        assert!(report
            .annotations()
            .contains(&Annotation {
                address: 0x111b,
                name: "gBS->LocateProtocol".to_string()
            }));
    }

    #[test]
    fn repeated_runs_are_identical() {
        let module = smm_driver_with_callout();
        let guids = GuidDb::with_well_known();
        let parallel = serde_json::json!({ "Analysis": { "worker_threads": 4 } });
        let sequential = serde_json::json!({ "Analysis": { "worker_threads": 1 } });
        let first = analyze_module(&module, &guids, &parallel).unwrap();
        let second = analyze_module(&module, &guids, &parallel).unwrap();
        let third = analyze_module(&module, &guids, &sequential).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn architecture_entry_points() {
        let guids = GuidDb::with_well_known();
        let config = serde_json::json!({});
        let module = FirmwareModule::mock(MachineType::Amd64, FileType::Dxe, vec![insns!["0x1000: ret"]]);
        let err = analyze_x86(&module, &guids, &config).unwrap_err();
        assert_eq!(
            err.downcast_ref::<AnalysisError>(),
            Some(&AnalysisError::ArchitectureMismatch {
                expected: Architecture::X86,
                found: Architecture::X64
            })
        );
        assert!(analyze_arm(&module, &guids, &config).is_err());
        assert!(analyze_x64(&module, &guids, &config).is_ok());

        let module = FirmwareModule::mock(MachineType::Other(0x1c2), FileType::Dxe, vec![insns!["0x1000: ret"]]);
        let err = analyze_module(&module, &guids, &config).unwrap_err();
        assert_eq!(
            err.downcast_ref::<AnalysisError>(),
            Some(&AnalysisError::UnsupportedArchitecture { machine: 0x1c2 })
        );
    }

    #[test]
    fn invalid_analysis_section() {
        let guids = GuidDb::with_well_known();
        let module = FirmwareModule::mock(MachineType::Amd64, FileType::Dxe, vec![insns!["0x1000: ret"]]);
        let config = serde_json::json!({ "Analysis": { "backward_window": -1 } });
        assert!(analyze_module(&module, &guids, &config).is_err());
    }

    #[test]
    fn detector_config_sections() {
        let config = serde_json::json!({
            "SmmCallout": { "max_call_depth": 2 },
            "VariableOverflow": { "report_unknown_origin": false },
            "VariableOverflowPei": { "report_unknown_origin": true },
        });
        assert_eq!(module_config(&config, "SmmCallout"), serde_json::json!({ "max_call_depth": 2 }));
        assert_eq!(
            module_config(&config, "VariableOverflowSmm"),
            serde_json::json!({ "report_unknown_origin": false })
        );
        assert_eq!(
            module_config(&config, "VariableOverflowPei"),
            serde_json::json!({ "report_unknown_origin": true })
        );
        assert_eq!(module_config(&config, "Other"), serde_json::json!({}));
    }
}
