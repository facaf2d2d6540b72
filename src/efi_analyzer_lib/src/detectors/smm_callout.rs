/*!
This module implements a detector for SMM callouts.

Code running in System Management Mode must not call code outside of SMRAM.
The Boot Services and the Runtime Services live in normal memory that the OS can modify,
so an SMI handler calling through them executes attacker-controlled code with SMM privileges.

How the detector works:

* The SMM context of the module consists of the registered SMI handlers
and all functions reachable from them within `max_call_depth` direct calls.
* Every call through the Boot Services or the Runtime Services
that lies in a function of the SMM context is flagged.

False Positives

* A call through a global that was overwritten with a pointer into SMRAM before the handler runs.
* Calls on paths that are only taken before the SMM handlers are locked, e.g. guarded by a boot phase flag.

False Negatives

* Callouts through function pointers, indirect calls or interfaces located with `LocateProtocol`.
* Handlers that are registered through an indirect call, and callees reached through indirect calls.
* Callouts deeper than `max_call_depth` calls below a handler.
*/
use crate::prelude::*;
use crate::utils::log::{Finding, FindingKind, LogMessage};
use itertools::Itertools;

const VERSION: &str = "0.1";

/// The module name and version
pub static DETECTOR_MODULE: crate::DetectorModule = crate::DetectorModule {
    name: "SmmCallout",
    version: VERSION,
    run: check_smm_callouts,
};

/// The configuration of the detector, read from the `SmmCallout` section of the configuration file.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
#[serde(default)]
pub struct Config {
    /// Maximum number of direct calls between an SMI handler and a function of the SMM context.
    pub max_call_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config { max_call_depth: 8 }
    }
}

/// Flag all calls through Boot or Runtime Services in the SMM context of the module.
pub fn check_smm_callouts(
    analysis_results: &AnalysisResults,
    detector_params: &serde_json::Value,
) -> (Vec<LogMessage>, Vec<Finding>) {
    let config: Config = match serde_json::from_value(detector_params.clone()) {
        Ok(config) => config,
        Err(err) => {
            let log = LogMessage::new_error(format!("Invalid configuration: {}", err)).source(DETECTOR_MODULE.name);
            return (vec![log], Vec::new());
        }
    };
    let smm_functions = analysis_results.smm_context_functions(config.max_call_depth);
    let findings = analysis_results
        .service_calls
        .iter()
        .filter(|call| call.is_outside_smram() && smm_functions.contains(&call.function))
        .map(|call| {
            let handlers = analysis_results
                .smi_handlers
                .iter()
                .filter(|handler| {
                    analysis_results
                        .call_graph
                        .reachable_within([handler.function], config.max_call_depth)
                        .contains(&call.function)
                })
                .map(|handler| format!("{:#x}", handler.function))
                .unique()
                .join(", ");
            Finding::new(
                FindingKind::SmmCallout,
                DETECTOR_MODULE.name,
                DETECTOR_MODULE.version,
                call.call_address,
                format!(
                    "(SMM Callout) {} -> {} at {:#x} reachable from SMI handler {}",
                    call.table.global_name(),
                    call.service_name,
                    call.call_address,
                    handlers
                ),
            )
            .function(call.function)
            .evidence(vec![
                format!("{:#x}", call.call_address),
                call.service_name.clone(),
                call.table.type_name().to_string(),
            ])
        })
        .collect();
    (Vec::new(), findings)
}
