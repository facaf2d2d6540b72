//! Discovery of the SMI handlers registered by a module.
//!
//! Handlers are registered either through the `Register` method of one of the SMM dispatch protocols
//! or through `gSmst->SmiHandlerRegister`.
//! The handlers are the roots of the SMM context used by the detectors.

use super::services::ServiceCall;
use super::{parallel_map, resolve_guid, AnalysisContext, Value};
use crate::prelude::*;
use crate::uefi::{Guid, ServiceTable, SmiDispatchKind};
use crate::utils::log::{DiagnosticKind, LogMessage};

const SOURCE: &str = "SMI Handlers";

/// How an SMI handler was registered.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum SmiHandlerKind {
    /// Through the `Register` method of an SMM dispatch protocol.
    Dispatch(SmiDispatchKind),
    /// Through `SmiHandlerRegister` with a `NULL` handler type.
    Root,
    /// Through `SmiHandlerRegister` with a handler type GUID.
    Child,
}

/// A function registered as SMI handler.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct SmiHandler {
    pub function: u64,
    pub kind: SmiHandlerKind,
    /// The GUID of the dispatch protocol or the handler type GUID of a child handler.
    pub dispatch_guid: Option<Guid>,
    pub guid_name: Option<String>,
    /// The address of the registering call.
    pub register_call: u64,
}

/// Find the SMI handlers registered by the given service calls.
///
/// The result is sorted by handler address and unique per handler and registering call.
pub fn detect_smi_handlers(context: &AnalysisContext, calls: &[ServiceCall]) -> (Vec<SmiHandler>, Vec<LogMessage>) {
    let results = parallel_map(calls, context.config.worker_threads, |call| handler_of_call(context, call));
    let mut handlers = Vec::new();
    let mut logs = Vec::new();
    for result in results {
        match result {
            Some(Ok(handler)) => handlers.push(handler),
            Some(Err(log)) => logs.push(log),
            None => (),
        }
    }
    handlers.sort();
    handlers.dedup_by_key(|handler| (handler.function, handler.register_call));
    (handlers, logs)
}

/// Returns `None` if the call does not register an SMI handler.
fn handler_of_call(context: &AnalysisContext, call: &ServiceCall) -> Option<Result<SmiHandler, LogMessage>> {
    let (handler_argument, dispatch) = match (call.table, call.service_name.as_str()) {
        (ServiceTable::SmmDispatch(kind), "Register") => (1, Some(kind)),
        (ServiceTable::SmmServices, "SmiHandlerRegister") => (0, None),
        _ => return None,
    };
    let body = context.body(call.function)?;
    let tracer = context.tracer(body);
    let unresolved = |what: &str| {
        LogMessage::new_debug(format!("{} of {} not resolved", what, call.service_name))
            .location(call.call_address)
            .source(SOURCE)
            .kind(DiagnosticKind::UnresolvedOperand)
    };
    let function = match tracer
        .trace_argument(call.call_index, handler_argument)
        .and_then(|traced| traced.value.as_address())
    {
        Some(function) => function,
        None => return Some(Err(unresolved("Handler"))),
    };
    let (kind, dispatch_guid) = match dispatch {
        Some(kind) => (SmiHandlerKind::Dispatch(kind), Some(kind.guid())),
        None => match tracer.trace_argument(call.call_index, 1) {
            Some(traced) if traced.value == Value::Constant(0) => (SmiHandlerKind::Root, None),
            Some(traced) => (
                SmiHandlerKind::Child,
                resolve_guid(context.facts, &tracer, call.call_index, &traced).map(|resolved| resolved.guid),
            ),
            None => (SmiHandlerKind::Child, None),
        },
    };
    let guid_name = dispatch_guid
        .as_ref()
        .and_then(|guid| context.guids.name_of(guid))
        .map(str::to_string);
    Some(Ok(SmiHandler {
        function,
        kind,
        dispatch_guid,
        guid_name,
        register_call: call.call_address,
    }))
}
