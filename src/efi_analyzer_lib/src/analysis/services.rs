//! Name the calls through the located service tables.

use super::table_anchors::TableAnalysis;
use super::{AnalysisContext, Location};
use crate::prelude::*;
use crate::uefi::ServiceTable;
use crate::utils::log::{DiagnosticKind, LogMessage};

/// A call through a known offset of a service table.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct ServiceCall {
    pub call_address: u64,
    pub service_name: String,
    pub table: ServiceTable,
    pub offset: u64,
    /// The start of the function containing the call.
    pub function: u64,
    /// The location holding the table or method pointer at the call.
    pub table_base: Option<Location>,
    /// The index of the call instruction in the function body.
    #[serde(skip)]
    pub call_index: usize,
}

impl ServiceCall {
    /// Returns `true` if the called service lives outside of SMRAM.
    pub fn is_outside_smram(&self) -> bool {
        self.table.is_outside_smram()
    }
}

/// Resolve the service names of all table calls.
///
/// Calls through offsets without a method in the table layout generate an `UnknownServiceOffset` diagnostic
/// and no `ServiceCall`.
pub fn resolve_services(context: &AnalysisContext, tables: &TableAnalysis) -> (Vec<ServiceCall>, Vec<LogMessage>) {
    let mut calls = Vec::new();
    let mut logs = Vec::new();
    for call in &tables.calls {
        match context.layouts.method_at(call.table, call.offset) {
            Some(name) => calls.push(ServiceCall {
                call_address: call.call_address,
                service_name: name.to_string(),
                table: call.table,
                offset: call.offset,
                function: call.function,
                table_base: call.base.clone(),
                call_index: call.call_index,
            }),
            None => logs.push(
                LogMessage::new_debug(format!(
                    "Call through unknown offset {:#x} of {}",
                    call.offset, call.table
                ))
                .location(call.call_address)
                .source("Service Resolver")
                .kind(DiagnosticKind::UnknownServiceOffset),
            ),
        }
    }
    calls.sort();
    calls.dedup_by(|first, second| {
        first.call_address == second.call_address && first.service_name == second.service_name
    });
    (calls, logs)
}
