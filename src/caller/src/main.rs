//! This crate defines the command line interface for the efi_analyzer.
//! General documentation about the efi_analyzer is contained in the [`efi_analyzer_lib`] crate.

extern crate efi_analyzer_lib; // Needed for the docstring-link to work

use anyhow::{anyhow, Context, Error};
use efi_analyzer_lib::analysis::Strategy;
use efi_analyzer_lib::intermediate_representation::{BinaryFacts, FileType, FirmwareModule};
use efi_analyzer_lib::pipeline::analyze_module_with;
use efi_analyzer_lib::uefi::GuidDb;
use efi_analyzer_lib::utils::binary::read_pe_header;
use efi_analyzer_lib::utils::get_config;
use efi_analyzer_lib::utils::log::{add_debug_log_statistics, print_all_messages, LogLevel};
use efi_analyzer_lib::DetectorModule;
use std::collections::HashSet;
use std::path::Path;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
/// Find vulnerable patterns in UEFI firmware modules
struct CmdlineArgs {
    /// The path to the JSON export of the disassembled module.
    #[structopt(required_unless("module-versions"), validator(check_file_existence))]
    facts: Option<String>,

    /// The path to the PE image of the module.
    /// Its headers replace the module information, segments and entry point of the export.
    #[structopt(long, short, validator(check_file_existence))]
    binary: Option<String>,

    /// Path to a JSON GUID database, merged into the built-in well-known GUIDs.
    #[structopt(long, short, validator(check_file_existence))]
    guids: Option<String>,

    /// Override the firmware phase of the module: dxe, smm or pei.
    #[structopt(long, parse(try_from_str = parse_file_type))]
    file_type: Option<FileType>,

    /// Path to a custom configuration file to use instead of the standard one.
    #[structopt(long, short, validator(check_file_existence))]
    config: Option<String>,

    /// Write the findings to a file instead of stdout.
    /// This only affects findings. Log messages are still printed to stdout.
    #[structopt(long, short)]
    out: Option<String>,

    /// Write the complete analysis report as JSON to the given file.
    #[structopt(long)]
    report: Option<String>,

    /// Write the address to name associations of the report as JSON to the given file.
    #[structopt(long)]
    annotations: Option<String>,

    /// Specify a specific set of detectors to be run as a comma separated list, e.g. 'SmmCallout,VariableOverflowSmm'.
    ///
    /// Use the "--module-versions" command line option to get a list of all valid detector names.
    #[structopt(long, short)]
    partial: Option<String>,

    /// Generate JSON output.
    #[structopt(long, short)]
    json: bool,

    /// Do not print log messages. This prevents polluting stdout for json output.
    #[structopt(long, short)]
    quiet: bool,

    /// Also print the debug log messages of the analysis stages.
    #[structopt(long, short)]
    verbose: bool,

    /// Prints out the version numbers of all known modules.
    #[structopt(long)]
    module_versions: bool,
}

fn main() -> Result<(), Error> {
    let cmdline_args = CmdlineArgs::from_args();

    run(cmdline_args)
}

/// Check the existence of a file
fn check_file_existence(file_path: String) -> Result<(), String> {
    if std::fs::metadata(&file_path)
        .map_err(|err| format!("{}", err))?
        .is_file()
    {
        Ok(())
    } else {
        Err(format!("{} is not a file.", file_path))
    }
}

fn parse_file_type(name: &str) -> Result<FileType, String> {
    match name.to_lowercase().as_str() {
        "dxe" => Ok(FileType::Dxe),
        "smm" => Ok(FileType::Smm),
        "pei" => Ok(FileType::Pei),
        _ => Err(format!("{} is not a valid file type.", name)),
    }
}

/// Run the efi_analyzer on the given module export.
fn run(args: CmdlineArgs) -> Result<(), Error> {
    let mut modules = efi_analyzer_lib::get_modules();
    if args.module_versions {
        // Only print the module versions and then quit.
        println!("[efi_analyzer] module_versions:");
        for module in modules.iter() {
            println!("{}", module);
        }
        return Ok(());
    }

    let config = get_config(args.config.as_deref())?;

    // Filter the modules to be executed if the `--partial` parameter is set.
    if let Some(ref partial_module_list) = args.partial {
        filter_modules_for_partial_run(&mut modules, partial_module_list)?;
    }

    let facts_path = args
        .facts
        .as_deref()
        .ok_or_else(|| anyhow!("No module export given"))?;
    let export = std::fs::read_to_string(facts_path)
        .with_context(|| format!("Could not read from file path {}", facts_path))?;
    let mut module = FirmwareModule::from_json(&export)?;
    if let Some(binary_path) = &args.binary {
        let binary = std::fs::read(binary_path)
            .with_context(|| format!("Could not read from file path {}", binary_path))?;
        let image = read_pe_header(&binary)?;
        let mut info = image.info;
        info.file_type = module.module_info().file_type;
        module.set_image(info, image.segments, image.entry_point);
    }
    if let Some(file_type) = args.file_type {
        module.set_file_type(file_type);
    }

    let mut guids = GuidDb::with_well_known();
    if let Some(guid_path) = &args.guids {
        guids.merge(GuidDb::from_file(Path::new(guid_path))?);
    }

    let strategy = Strategy::resolve(module.module_info())?;
    let report = analyze_module_with(&module, &guids, strategy, &config, &modules)?;

    if let Some(report_path) = &args.report {
        std::fs::write(report_path, report.to_json()?)
            .with_context(|| format!("Writing to report path {} failed", report_path))?;
    }
    if let Some(annotation_path) = &args.annotations {
        let annotations = serde_json::to_string_pretty(&report.annotations())?;
        std::fs::write(annotation_path, annotations)
            .with_context(|| format!("Writing to annotation path {} failed", annotation_path))?;
    }

    // Print the results of the modules.
    let mut all_logs = if args.quiet {
        Vec::new() // Suppress all log messages since the `--quiet` flag is set.
    } else if args.verbose {
        report.diagnostics.clone()
    } else {
        let mut logs = report.diagnostics.clone();
        add_debug_log_statistics(&mut logs);
        logs.into_iter()
            .filter(|log| log.level != LogLevel::Debug)
            .collect()
    };
    if args.verbose {
        add_debug_log_statistics(&mut all_logs);
    }
    print_all_messages(all_logs, report.findings, args.out.as_deref(), args.json)
}

/// Only keep the modules specified by the `--partial` parameter in the `modules` list.
/// The parameter is a comma-separated list of module names, e.g. 'SmmCallout,VariableOverflowSmm'.
fn filter_modules_for_partial_run(
    modules: &mut Vec<&DetectorModule>,
    partial_param: &str,
) -> Result<(), Error> {
    let module_names: HashSet<&str> = partial_param.split(',').collect();
    let mut selected = Vec::new();
    for module_name in module_names {
        if let Some(module) = modules.iter().find(|module| module.name == module_name) {
            selected.push(*module);
        } else if !module_name.is_empty() {
            return Err(anyhow!("{} is not a valid module name.", module_name));
        }
    }
    selected.sort_by_key(|module| module.name);
    *modules = selected;
    Ok(())
}
