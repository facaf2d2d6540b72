//! This module contains various utility modules and helper functions.

pub mod binary;
pub mod log;

use crate::prelude::*;

/// The standard configuration, used if the user has no configuration file.
const DEFAULT_CONFIG: &str = include_str!("../../../config.json");

/// Get the contents of a configuration file in the configuration directory of the efi_analyzer.
pub fn read_config_file(filename: &str) -> Result<serde_json::Value, Error> {
    let project_dirs = directories::ProjectDirs::from("", "", "efi_analyzer")
        .context("Could not discern location of configuration files.")?;
    let config_dir = project_dirs.config_dir();
    let config_path = config_dir.join(filename);
    let config_file =
        std::fs::read_to_string(config_path).context("Could not read configuration file")?;
    Ok(serde_json::from_str(&config_file)?)
}

/// The standard configuration bundled with the library.
pub fn default_config() -> Result<serde_json::Value, Error> {
    serde_json::from_str(DEFAULT_CONFIG).context("Invalid standard configuration")
}

/// Get the configuration for a run.
///
/// A given path is read and parsed, errors are returned.
/// Without a path the `config.json` in the configuration directory is used if it exists,
/// otherwise the standard configuration.
pub fn get_config(config_path: Option<&str>) -> Result<serde_json::Value, Error> {
    match config_path {
        Some(path) => {
            let config_file = std::fs::read_to_string(path)
                .with_context(|| format!("Could not read configuration file {}", path))?;
            serde_json::from_str(&config_file).context("Parsing of the configuration file failed")
        }
        None => read_config_file("config.json").or_else(|_| default_config()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisConfig;

    #[test]
    fn standard_configuration() {
        let config = default_config().unwrap();
        assert_eq!(AnalysisConfig::from_config(&config).unwrap(), AnalysisConfig::default());
        assert_eq!(config["SmmCallout"]["max_call_depth"], 8);
        assert_eq!(config["VariableOverflow"]["report_unknown_origin"], true);
        for module in crate::get_modules() {
            assert!(config
                .as_object()
                .unwrap()
                .keys()
                .any(|section| module.name.starts_with(section.as_str())));
        }
    }

    #[test]
    fn missing_configuration_file() {
        assert!(get_config(Some("/nonexistent/efi_analyzer/config.json")).is_err());
    }
}
