/*!
The main library of the efi_analyzer containing the UEFI interface analyses and all vulnerability detectors.

# What is the efi_analyzer

The efi_analyzer reconstructs how a compiled UEFI firmware module (a DXE driver, an SMM driver or a PEI module)
uses the firmware service tables and protocol interfaces at runtime.
It locates the well-known service tables (Boot Services, Runtime Services, the SMM System Table and the PEI Services),
resolves which services are called through them,
resolves the GUIDs passed to protocol and PPI related services against a GUID database
and then runs heuristic detectors over the result to flag known firmware vulnerability classes:
* SMM callouts, i.e. code running in SMM that calls into Boot or Runtime Services,
* buffer overflows caused by unchecked `GetVariable` data sizes in boot, runtime, SMM and PEI code.

The disassembly itself is not part of this library.
Decoded instructions, function boundaries and memory segments are consumed through the
[`BinaryFacts`](crate::intermediate_representation::BinaryFacts) trait,
which is implemented for JSON exports of an external disassembler by
[`FirmwareModule`](crate::intermediate_representation::FirmwareModule).

# Usage

```sh
efi_analyzer FACTS_JSON --guids guids.json
```
The behaviour of the analyses and of each detector can be adjusted through a configuration file
given by the `--config` command line option.
Start by taking a look at the standard configuration file located at `src/config.json`
and read the [detector-specific documentation](crate::detectors) for details about each section.

# Further documentation

The individual stages of the analysis are documented in the [`analysis`] module,
the assembled pipeline in the [`pipeline`] module.
Known false positives and false negatives of each detector are listed in the module documentation
of the [`detectors`].
*/

pub mod analysis;
pub mod detectors;
pub mod intermediate_representation;
pub mod pipeline;
pub mod uefi;
pub mod utils;

use pipeline::AnalysisResults;
use utils::log::{Finding, LogMessage};

mod prelude {
    pub use serde::{Deserialize, Serialize};

    pub use crate::intermediate_representation::{Instruction, Operand, Register};
    pub use crate::pipeline::AnalysisResults;
    pub use anyhow::Context as _;
    pub use anyhow::{anyhow, Error};
}

/// The generic function signature for the main function of a detector module
pub type DetectorModuleFn =
    fn(&AnalysisResults, &serde_json::Value) -> (Vec<LogMessage>, Vec<Finding>);

/// A structure containing general information about a detector module,
/// including the function to be called to run the detector.
pub struct DetectorModule {
    /// The name of the detector.
    pub name: &'static str,
    /// The version number of the detector.
    /// Should be incremented whenever significant changes are made to the detector.
    pub version: &'static str,
    /// The function that executes the detector and returns the findings.
    pub run: DetectorModuleFn,
}

impl std::fmt::Display for DetectorModule {
    /// Print the module name and its version number.
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, r#""{}": "{}""#, self.name, self.version)
    }
}

/// Get a list of all known detector modules.
pub fn get_modules() -> Vec<&'static DetectorModule> {
    vec![
        &crate::detectors::smm_callout::DETECTOR_MODULE,
        &crate::detectors::variable_overflow::BOOT_MODULE,
        &crate::detectors::variable_overflow::RUNTIME_MODULE,
        &crate::detectors::variable_overflow::SMM_MODULE,
        &crate::detectors::variable_overflow::PEI_MODULE,
    ]
}
