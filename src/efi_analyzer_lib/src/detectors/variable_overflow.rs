/*!
This module implements the detectors for buffer overflows caused by `GetVariable` calls.

`GetVariable` writes up to `*DataSize` bytes into the data buffer and updates `*DataSize`
to the size of the variable.
If the `DataSize` variable is reused for a second call without being reset,
or if it is not initialized with the size of the buffer,
a variable controlled by an attacker overflows the buffer.
Since the variable store is writable from the OS in many configurations,
this is exploitable in boot time code, runtime drivers, SMI handlers and PEI modules alike.

How the detectors work:

* The NVRAM analysis classifies the value of the `DataSize` variable before each call:
  a constant written to it, the result of a previous `GetVariable` call, or unknown.
* A call is flagged if the value is not a constant and no comparison of the size
  followed by a conditional branch lies between the origin of the value and the call.
* Calls whose `DataSize` argument could not be resolved at all are not flagged,
  the NVRAM analysis reports them as diagnostics instead.
* There is one detector per calling context (boot, runtime, SMM and PEI),
  so that each can be enabled separately.

False Positives

* The size is checked with a pattern that is not a comparison followed by a conditional branch,
  e.g. by a call to a helper function.
* The buffer is large enough for all possible values of the variable.
* The second call reads a variable that only firmware can write.

False Negatives

* The constant written to the size variable is larger than the buffer.
* The size variable is reset on a path the backward tracer does not follow.
* A present comparison does not actually bound the size.
*/
use crate::analysis::nvram::{CallContext, NvramVariable, SizeOrigin};
use crate::prelude::*;
use crate::utils::log::{Finding, FindingKind, LogMessage};

const VERSION: &str = "0.1";

/// The detector for boot time `gRT->GetVariable` calls.
pub static BOOT_MODULE: crate::DetectorModule = crate::DetectorModule {
    name: "VariableOverflowBoot",
    version: VERSION,
    run: check_boot_variables,
};

/// The detector for `gRT->GetVariable` calls of runtime drivers.
pub static RUNTIME_MODULE: crate::DetectorModule = crate::DetectorModule {
    name: "VariableOverflowRuntime",
    version: VERSION,
    run: check_runtime_variables,
};

/// The detector for `GetVariable` calls in SMM code.
pub static SMM_MODULE: crate::DetectorModule = crate::DetectorModule {
    name: "VariableOverflowSmm",
    version: VERSION,
    run: check_smm_variables,
};

/// The detector for `EFI_PEI_READ_ONLY_VARIABLE2_PPI.GetVariable` calls.
pub static PEI_MODULE: crate::DetectorModule = crate::DetectorModule {
    name: "VariableOverflowPei",
    version: VERSION,
    run: check_pei_variables,
};

/// The configuration of the detectors, read from the `VariableOverflow` section of the configuration file.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
#[serde(default)]
pub struct Config {
    /// Report calls whose `DataSize` value has an unknown origin.
    pub report_unknown_origin: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            report_unknown_origin: true,
        }
    }
}

fn check_boot_variables(results: &AnalysisResults, params: &serde_json::Value) -> (Vec<LogMessage>, Vec<Finding>) {
    check_variables(results, params, CallContext::Boot)
}

fn check_runtime_variables(results: &AnalysisResults, params: &serde_json::Value) -> (Vec<LogMessage>, Vec<Finding>) {
    check_variables(results, params, CallContext::Runtime)
}

fn check_smm_variables(results: &AnalysisResults, params: &serde_json::Value) -> (Vec<LogMessage>, Vec<Finding>) {
    check_variables(results, params, CallContext::Smm)
}

fn check_pei_variables(results: &AnalysisResults, params: &serde_json::Value) -> (Vec<LogMessage>, Vec<Finding>) {
    check_variables(results, params, CallContext::Pei)
}

fn module_for(context: CallContext) -> (&'static crate::DetectorModule, FindingKind) {
    match context {
        CallContext::Boot => (&BOOT_MODULE, FindingKind::VariableOverflowBoot),
        CallContext::Runtime => (&RUNTIME_MODULE, FindingKind::VariableOverflowRuntime),
        CallContext::Smm => (&SMM_MODULE, FindingKind::VariableOverflowSmm),
        CallContext::Pei => (&PEI_MODULE, FindingKind::VariableOverflowPei),
    }
}

/// Returns `true` if the size of the call is neither a constant nor guarded.
fn is_unchecked(variable: &NvramVariable, config: &Config) -> bool {
    if variable.size_argument.is_none() || variable.size_guard.is_some() {
        return false;
    }
    match variable.size_origin {
        SizeOrigin::Constant { .. } => false,
        SizeOrigin::PreviousGetVariable { .. } => true,
        SizeOrigin::Unknown => config.report_unknown_origin,
    }
}

/// Flag the unchecked `GetVariable` calls of the given calling context.
pub fn check_variables(
    results: &AnalysisResults,
    params: &serde_json::Value,
    context: CallContext,
) -> (Vec<LogMessage>, Vec<Finding>) {
    let (module, kind) = module_for(context);
    let config: Config = match serde_json::from_value(params.clone()) {
        Ok(config) => config,
        Err(err) => {
            let log = LogMessage::new_error(format!("Invalid configuration: {}", err)).source(module.name);
            return (vec![log], Vec::new());
        }
    };
    let findings = results
        .nvram_variables
        .iter()
        .filter(|variable| variable.context == context && is_unchecked(variable, &config))
        .map(|variable| {
            let name = variable.name.as_deref().unwrap_or("<unknown>");
            let origin = match variable.size_origin {
                SizeOrigin::PreviousGetVariable { call_address } => {
                    format!("DataSize reused from the GetVariable call at {:#x}", call_address)
                }
                _ => "DataSize of unknown origin".to_string(),
            };
            let mut evidence = vec![format!("{:#x}", variable.call_address), name.to_string()];
            if let SizeOrigin::PreviousGetVariable { call_address } = variable.size_origin {
                evidence.push(format!("{:#x}", call_address));
            }
            if let Some(guid) = &variable.guid {
                evidence.push(guid.to_string());
            }
            Finding::new(
                kind,
                module.name,
                module.version,
                variable.call_address,
                format!(
                    "(Variable Overflow) {} of variable {} at {:#x} in {} code: {}",
                    variable.service_name, name, variable.call_address, context, origin
                ),
            )
            .function(variable.function)
            .evidence(evidence)
        })
        .collect();
    (Vec::new(), findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Location;
    use crate::pipeline::tests::MockResults;

    fn variable(call_address: u64, context: CallContext, origin: SizeOrigin, guard: Option<u64>) -> NvramVariable {
        NvramVariable {
            call_address,
            service_name: "GetVariable".to_string(),
            name: Some("Setup".to_string()),
            guid: None,
            guid_name: None,
            size_argument: Some(Location::Stack(-8)),
            size_origin: origin,
            size_guard: guard,
            function: 0x1000,
            context,
        }
    }

    #[test]
    fn finding_per_context() {
        let mut mock = MockResults::new(Vec::new());
        let reused = SizeOrigin::PreviousGetVariable { call_address: 0x1010 };
        mock.nvram_variables = vec![
            variable(0x1020, CallContext::Boot, reused, None),
            variable(0x1030, CallContext::Smm, reused, None),
            variable(0x1040, CallContext::Smm, reused, Some(0x1038)),
            variable(0x1050, CallContext::Pei, SizeOrigin::Constant { value: 8, address: 0x1048 }, None),
            variable(0x1060, CallContext::Runtime, SizeOrigin::Unknown, None),
        ];
        let params = serde_json::json!({});
        let (_, boot) = mock.run(check_boot_variables, &params);
        assert_eq!(boot.len(), 1);
        assert_eq!(boot[0].kind, FindingKind::VariableOverflowBoot);
        assert_eq!(boot[0].address, 0x1020);
        assert_eq!(boot[0].evidence, vec!["0x1020", "Setup", "0x1010"]);
        let (_, smm) = mock.run(check_smm_variables, &params);
        assert_eq!(smm.len(), 1);
        assert_eq!(smm[0].kind, FindingKind::VariableOverflowSmm);
        assert_eq!(smm[0].address, 0x1030);
        let (_, pei) = mock.run(check_pei_variables, &params);
        assert!(pei.is_empty());
        let (_, runtime) = mock.run(check_runtime_variables, &params);
        assert_eq!(runtime.len(), 1);
        let (_, runtime) =
            mock.run(check_runtime_variables, &serde_json::json!({ "report_unknown_origin": false }));
        assert!(runtime.is_empty());
    }

    #[test]
    fn unresolved_size_is_not_flagged() {
        let mut mock = MockResults::new(Vec::new());
        let mut unresolved = variable(0x1020, CallContext::Boot, SizeOrigin::Unknown, None);
        unresolved.size_argument = None;
        mock.nvram_variables = vec![unresolved];
        let (logs, findings) = mock.run(check_boot_variables, &serde_json::json!({}));
        assert!(logs.is_empty());
        assert!(findings.is_empty());
    }
}
