//! Structs and functions for generating log messages and vulnerability findings.

use crate::prelude::*;
use std::{collections::BTreeMap, thread::JoinHandle};

/// The vulnerability class of a [`Finding`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum FindingKind {
    /// Code reachable from an SMI handler calls a Boot or Runtime Service.
    SmmCallout,
    /// Unchecked `GetVariable` data size in boot time code.
    VariableOverflowBoot,
    /// Unchecked `GetVariable` data size in a runtime driver.
    VariableOverflowRuntime,
    /// Unchecked `SmmGetVariable` data size.
    VariableOverflowSmm,
    /// Unchecked `GetVariable` data size of the read-only variable PPI.
    VariableOverflowPei,
}

impl std::fmt::Display for FindingKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FindingKind::SmmCallout => "SmmCallout",
            FindingKind::VariableOverflowBoot => "VariableOverflow_Boot",
            FindingKind::VariableOverflowRuntime => "VariableOverflow_Runtime",
            FindingKind::VariableOverflowSmm => "VariableOverflow_Smm",
            FindingKind::VariableOverflowPei => "VariableOverflow_Pei",
        };
        write!(formatter, "{}", name)
    }
}

/// A vulnerability finding generated by a detector.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct Finding {
    /// The vulnerability class.
    pub kind: FindingKind,
    /// The address of the call instruction the finding was generated for.
    pub address: u64,
    /// The start address of the function containing the call.
    pub function: Option<u64>,
    /// The name of the detector, e.g. `SmmCallout`.
    pub name: String,
    /// The version number of the detector.
    pub version: String,
    /// Additional addresses and facts supporting the finding.
    /// Content depends on the detector that generated the finding.
    pub evidence: Vec<String>,
    /// A short description of the finding that is presented to the user.
    pub description: String,
}

impl Finding {
    /// Creates a new finding without evidence.
    pub fn new(
        kind: FindingKind,
        name: impl ToString,
        version: impl ToString,
        address: u64,
        description: impl ToString,
    ) -> Finding {
        Finding {
            kind,
            address,
            function: None,
            name: name.to_string(),
            version: version.to_string(),
            evidence: Vec::new(),
            description: description.to_string(),
        }
    }

    /// Sets the function field of the finding
    pub fn function(mut self, function: u64) -> Finding {
        self.function = Some(function);
        self
    }

    /// Sets the evidence field of the finding
    pub fn evidence(mut self, evidence: Vec<String>) -> Finding {
        self.evidence = evidence;
        self
    }
}

impl std::fmt::Display for Finding {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "[{}] ({}) {}",
            self.kind, self.version, self.description
        )
    }
}

/// The class of a non-fatal problem encountered during the analysis.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum DiagnosticKind {
    /// No service table could be attached to a function.
    TableAnchorNotFound,
    /// A GUID operand could not be read or has no name in the GUID database.
    UnresolvedGuid,
    /// An operand could not be traced back to a value.
    UnresolvedOperand,
    /// A GUID table or PPI descriptor list has no terminator within the configured bound.
    MalformedGuidTableEntry,
    /// Two fields of a service table layout share the same offset.
    AliasedServiceOffset,
    /// A call through a service table uses an offset without a method at it.
    UnknownServiceOffset,
    /// A scan was stopped by its instruction or round budget.
    ScanBoundReached,
}

/// A generic log message.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct LogMessage {
    /// The log message.
    pub text: String,
    /// The severity/type of the log message.
    pub level: LogLevel,
    /// The address inside the binary that the message is related to.
    pub location: Option<u64>,
    /// The analysis where the message originated.
    pub source: Option<String>,
    /// Set for diagnostics that belong to a known problem class.
    pub kind: Option<DiagnosticKind>,
}

impl LogMessage {
    /// Create a new `Info`-level log message
    pub fn new_info(text: impl Into<String>) -> LogMessage {
        LogMessage {
            text: text.into(),
            level: LogLevel::Info,
            location: None,
            source: None,
            kind: None,
        }
    }

    /// Create a new `Debug`-level log message
    pub fn new_debug(text: impl Into<String>) -> LogMessage {
        LogMessage {
            text: text.into(),
            level: LogLevel::Debug,
            location: None,
            source: None,
            kind: None,
        }
    }

    /// Create a new `Error`-level log message
    pub fn new_error(text: impl Into<String>) -> LogMessage {
        LogMessage {
            text: text.into(),
            level: LogLevel::Error,
            location: None,
            source: None,
            kind: None,
        }
    }

    /// Associate a specific address to the log message.
    pub fn location(mut self, address: u64) -> LogMessage {
        self.location = Some(address);
        self
    }

    /// Set the name of the source analysis for the log message.
    pub fn source(mut self, source: impl Into<String>) -> LogMessage {
        self.source = Some(source.into());
        self
    }

    /// Mark the message as a diagnostic of the given kind.
    pub fn kind(mut self, kind: DiagnosticKind) -> LogMessage {
        self.kind = Some(kind);
        self
    }
}

/// The severity/type of a log message.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub enum LogLevel {
    /// Messages intended for debugging.
    Debug,
    /// Errors encountered during analysis.
    Error,
    /// Non-error messages intended for the user.
    Info,
}

impl std::fmt::Display for LogMessage {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.level {
            LogLevel::Debug => write!(formatter, "DEBUG: ")?,
            LogLevel::Error => write!(formatter, "ERROR: ")?,
            LogLevel::Info => write!(formatter, "INFO: ")?,
        };
        match (&self.source, &self.location) {
            (Some(source), Some(location)) => {
                write!(formatter, "{} @ {:#x}: ", source, location)?
            }
            (Some(source), None) => write!(formatter, "{}: ", source)?,
            (None, Some(location)) => write!(formatter, "{:#x}: ", location)?,
            (None, None) => (),
        };
        if let Some(kind) = &self.kind {
            write!(formatter, "{:?}: ", kind)?;
        }
        write!(formatter, "{}", self.text)
    }
}

/// Print all provided log messages and findings.
///
/// Log-messages will always be printed to `stdout`.
/// Findings will either be printed to `stdout` or to the file path provided in `out_path`.
///
/// If `emit_json` is set, the findings will be converted to json for the output.
pub fn print_all_messages(
    logs: Vec<LogMessage>,
    findings: Vec<Finding>,
    out_path: Option<&str>,
    emit_json: bool,
) -> Result<(), Error> {
    for log in logs {
        println!("{}", log);
    }
    let output: String = if emit_json {
        serde_json::to_string_pretty(&findings)?
    } else {
        findings
            .iter()
            .map(|finding| format!("{}", finding))
            .collect::<Vec<String>>()
            .join("\n")
            + "\n"
    };
    if let Some(file_path) = out_path {
        std::fs::write(file_path, output)
            .with_context(|| format!("Writing to output path {} failed", file_path))?;
    } else {
        print!("{}", output);
    }
    Ok(())
}

/// For each analysis count the number of debug log messages in `all_logs`
/// and add a (INFO level) log message with the resulting number to `all_logs`.
/// Also count and log the number of general debug log messages.
pub fn add_debug_log_statistics(all_logs: &mut Vec<LogMessage>) {
    let mut analysis_debug_log_count = BTreeMap::new();
    let mut general_debug_log_count = 0u64;
    for log in all_logs.iter().filter(|log| log.level == LogLevel::Debug) {
        if let Some(analysis) = &log.source {
            analysis_debug_log_count
                .entry(analysis.clone())
                .and_modify(|count| *count += 1)
                .or_insert(1u64);
        } else {
            general_debug_log_count += 1;
        }
    }
    for (analysis, count) in analysis_debug_log_count {
        all_logs.push(LogMessage::new_info(format!("Logged {} debug log messages.", count)).source(analysis));
    }
    if general_debug_log_count > 0 {
        all_logs.push(LogMessage::new_info(format!(
            "Logged {} general debug log messages.",
            general_debug_log_count
        )));
    }
}

/// The message types a logging thread can receive.
/// See the [`LogThread`] type for more information.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub enum LogThreadMsg {
    /// A normal log message.
    Log(LogMessage),
    /// A vulnerability finding.
    Finding(Finding),
    /// If the log collector thread receives this signal,
    /// it should stop receiving new messages
    /// and instead terminate and return the collected messages prior to receiving the termination signal.
    Terminate,
}

impl From<LogMessage> for LogThreadMsg {
    fn from(msg: LogMessage) -> Self {
        Self::Log(msg)
    }
}

impl From<Finding> for LogThreadMsg {
    fn from(finding: Finding) -> Self {
        Self::Finding(finding)
    }
}

/// A type for managing threads for collecting log messages.
///
/// With [`LogThread::spawn()`] one can create a new log thread
/// whose handle is contained in the returned `LogThread` struct.
/// By calling the [`collect()`](LogThread::collect()) method
/// one can tell the log thread to shut down
/// and return the logs collected to this point.
/// If the `LogThread` object gets dropped before calling `collect()`,
/// the corresponding logging thread will be stopped
/// and all collected logs will be discarded.
pub struct LogThread {
    msg_sender: crossbeam_channel::Sender<LogThreadMsg>,
    thread_handle: Option<JoinHandle<(Vec<LogMessage>, Vec<Finding>)>>,
}

impl Drop for LogThread {
    /// If the logging thread still exists,
    /// send it the `Terminate` signal.
    /// Then wait until the logging thread stopped.
    fn drop(&mut self) {
        let _ = self.msg_sender.send(LogThreadMsg::Terminate);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl LogThread {
    /// Create a new `LogThread` object with a handle to a freshly spawned logging collector thread.
    ///
    /// The parameter is the function containing the actual log collection logic.
    /// I.e. the function should receive messages through the given receiver until the channel disconnects
    /// or until it receives a [`LogThreadMsg::Terminate`] message.
    /// After that it should return the logs collected up to that point.
    ///
    /// See [`LogThread::collect_and_deduplicate`] for a standard collector function that can be used here.
    pub fn spawn<F>(collector_func: F) -> LogThread
    where
        F: FnOnce(crossbeam_channel::Receiver<LogThreadMsg>) -> (Vec<LogMessage>, Vec<Finding>)
            + Send
            + 'static,
    {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let thread_handle = std::thread::spawn(move || collector_func(receiver));
        LogThread {
            msg_sender: sender,
            thread_handle: Some(thread_handle),
        }
    }

    /// Get a sender that can be used to send messages to the logging thread corresponding to this `LogThread` instance.
    pub fn get_msg_sender(&self) -> crossbeam_channel::Sender<LogThreadMsg> {
        self.msg_sender.clone()
    }

    /// Stop the logging thread by sending it the `Terminate` signal
    /// and then return all logs collected until that point.
    ///
    /// If the logging thread panicked, an error log message is returned instead of the collected messages.
    pub fn collect(mut self) -> (Vec<LogMessage>, Vec<Finding>) {
        let _ = self.msg_sender.send(LogThreadMsg::Terminate);
        match self.thread_handle.take().map(|handle| handle.join()) {
            Some(Ok(collected)) => collected,
            Some(Err(_)) => (
                vec![LogMessage::new_error("The log collector thread panicked.")],
                Vec::new(),
            ),
            None => (Vec::new(), Vec::new()),
        }
    }

    /// This function collects logs from the given receiver until a [`LogThreadMsg::Terminate`] signal is received.
    /// All collected messages are deduplicated before being returned.
    ///
    /// Findings are deduplicated if two findings share the same kind and call address.
    /// Log messages are deduplicated if they are equal.
    /// The returned messages are sorted.
    ///
    /// This function can be used as a standard collector function for [`LogThread::spawn`].
    pub fn collect_and_deduplicate(
        receiver: crossbeam_channel::Receiver<LogThreadMsg>,
    ) -> (Vec<LogMessage>, Vec<Finding>) {
        let mut logs = std::collections::BTreeSet::new();
        let mut collected_findings = BTreeMap::new();

        while let Ok(log_thread_msg) = receiver.recv() {
            match log_thread_msg {
                LogThreadMsg::Log(log_message) => {
                    logs.insert(log_message);
                }
                LogThreadMsg::Finding(finding) => {
                    collected_findings.insert((finding.kind, finding.address), finding);
                }
                LogThreadMsg::Terminate => break,
            }
        }
        (
            logs.into_iter().collect(),
            collected_findings.into_values().collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_statistics_count_per_source() {
        let mut logs = vec![
            LogMessage::new_debug("a").source("Anchors"),
            LogMessage::new_debug("b").source("Anchors"),
            LogMessage::new_debug("c"),
            LogMessage::new_info("d").source("Anchors"),
        ];
        add_debug_log_statistics(&mut logs);
        assert_eq!(logs.len(), 6);
        assert_eq!(
            logs[4],
            LogMessage::new_info("Logged 2 debug log messages.").source("Anchors")
        );
        assert_eq!(
            logs[5],
            LogMessage::new_info("Logged 1 general debug log messages.")
        );
    }

    #[test]
    fn log_message_display() {
        let log = LogMessage::new_debug("no table")
            .source("Anchors")
            .location(0x1000)
            .kind(DiagnosticKind::TableAnchorNotFound);
        assert_eq!(
            format!("{}", log),
            "DEBUG: Anchors @ 0x1000: TableAnchorNotFound: no table"
        );
    }

    #[test]
    fn log_thread_deduplicates_findings() {
        let log_thread = LogThread::spawn(LogThread::collect_and_deduplicate);
        let sender = log_thread.get_msg_sender();
        let finding = Finding::new(FindingKind::SmmCallout, "SmmCallout", "0.1", 0x10, "test");
        sender.send(finding.clone().into()).unwrap();
        sender.send(finding.clone().into()).unwrap();
        sender
            .send(
                Finding::new(FindingKind::VariableOverflowSmm, "VariableOverflowSmm", "0.1", 0x10, "other")
                    .into(),
            )
            .unwrap();
        sender.send(LogMessage::new_info("x").into()).unwrap();
        sender.send(LogMessage::new_info("x").into()).unwrap();
        let (logs, findings) = log_thread.collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0], finding);
    }
}
