//! Typed payloads for the protocol methods.
//!
//! Both sides build and parse these through [`Message::with_params`] and
//! [`Message::parse_params`], so the field names here are the wire format.
//!
//! [`Message::with_params`]: crate::Message::with_params
//! [`Message::parse_params`]: crate::Message::parse_params

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Announcement a debuggee sends as its first message after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcIdInfo {
    pub pid: i32,
    /// Absolute path of the script being debugged.
    pub filename: String,
    /// Module name derived from the script (file stem).
    pub module: String,
    /// Protocol revision the client speaks.
    pub version: String,
    /// Authentication token, when a password file was provided at spawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Sent once the debuggee is ready to run and is holding for the
/// controller's go-ahead, giving the controller a deterministic window to
/// install breakpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugStartup {
    pub filename: String,
    pub args: Vec<String>,
    /// User definitions that shadow built-in names; surfaced as a warning.
    #[serde(default)]
    pub conflicts: Vec<String>,
}

/// One frame of a reported stack, innermost first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackEntry {
    pub filename: String,
    pub line: u32,
    pub function: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineEvent {
    pub filename: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackEvent {
    pub stack: Vec<StackEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub stack: Vec<StackEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyntaxErrorEvent {
    pub message: String,
    pub filename: String,
    pub line: u32,
    pub character_number: u32,
}

/// `setBP`: create or replace the breakpoint at (filename, line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpoint {
    pub filename: String,
    pub line: u32,
    #[serde(default)]
    pub temporary: bool,
    /// `None`, the empty string and the literal `"None"` all mean
    /// unconditional.
    #[serde(default)]
    pub condition: Option<String>,
}

/// Identifies a breakpoint by location, for `clearBP` and
/// `bpConditionError`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointRef {
    pub filename: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointEnable {
    pub filename: String,
    pub line: u32,
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointIgnore {
    pub filename: String,
    pub line: u32,
    pub count: u32,
}

/// `setWP`: install a watch expression. The condition text may carry a
/// trailing `??created??` or `??changed??` marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetWatch {
    pub condition: String,
    #[serde(default)]
    pub temporary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRef {
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEnable {
    pub condition: String,
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchIgnore {
    pub condition: String,
    pub count: u32,
}

/// `bpConditionError`: a breakpoint condition failed to compile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointConditionError {
    pub filename: String,
    pub line: u32,
    #[serde(default)]
    pub message: String,
}

/// `wpConditionError`: a watch condition failed to compile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConditionError {
    pub condition: String,
    #[serde(default)]
    pub message: String,
}

/// Which namespace of a frame an introspection request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarScope {
    Global,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesRequest {
    /// Offset into the halted stack, 0 = innermost.
    pub frame_number: usize,
    pub scope: VarScope,
}

/// One rendered variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableItem {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Short display rendering; large containers render as a length
    /// shortcut rather than full content.
    pub value: String,
    pub has_children: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesReply {
    pub frame_number: usize,
    pub scope: VarScope,
    pub variables: Vec<VariableItem>,
}

/// `variable`: expand one container variable a single level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableRequest {
    /// Path from the scope root to the container, outermost name first.
    pub var: Vec<String>,
    pub frame_number: usize,
    pub scope: VarScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableReply {
    pub var: Vec<String>,
    pub scope: VarScope,
    pub variables: Vec<VariableItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadInfo {
    pub id: u64,
    pub name: String,
    pub broken: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadListReply {
    pub threads: Vec<ThreadInfo>,
    pub current_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSet {
    pub thread_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkTarget {
    Child,
    Parent,
}

/// Controller's answer to a `forkTo` query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkToReply {
    pub target: ForkTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTraceToggle {
    pub enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallTraceDirection {
    Call,
    Return,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTraceEvent {
    #[serde(rename = "event")]
    pub direction: CallTraceDirection,
    pub from: StackEntry,
    pub to: StackEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteStatement {
    pub statement: String,
    pub frame_number: usize,
}

/// Carries free text: `stdout`, `stderr`, `execStatementOutput`,
/// `execStatementError`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    pub text: String,
}

/// Client asks the controller for one line of user input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdinRequest {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdinReply {
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEvent {
    pub signal: i32,
    pub filename: String,
    pub line: u32,
    pub function: String,
}

/// Move the instruction pointer within the innermost frame while halted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveIp {
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpilogueExitCode {
    pub exit_code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetEnvironment {
    pub environment: BTreeMap<String, String>,
}

/// Variable visibility filters, pushed by the controller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetFilter {
    /// Regex patterns hiding matching names in the global scope.
    #[serde(default)]
    pub global_patterns: Vec<String>,
    /// Regex patterns hiding matching names in the local scope.
    #[serde(default)]
    pub local_patterns: Vec<String>,
    /// Type names whose variables are omitted entirely.
    #[serde(default)]
    pub hide_types: Vec<String>,
    /// When set, double-underscore names are listed despite the default rule.
    #[serde(default)]
    pub show_hidden: bool,
}

#[cfg(test)]
mod tests {
    use crate::{Message, Method};

    use super::*;

    #[test]
    fn proc_id_info_round_trips_through_a_message() {
        let info = ProcIdInfo {
            pid: 4242,
            filename: "/tmp/job.scr".to_owned(),
            module: "job".to_owned(),
            version: "1".to_owned(),
            auth: Some("s3cret".to_owned()),
        };
        let message = Message::with_params(Method::ProcIdInfo, "p1", &info).expect("building");
        let line = message.encode().expect("encoding");
        let decoded = Message::decode(line.trim_end()).expect("decoding");
        assert_eq!(decoded.parse_params::<ProcIdInfo>().expect("params"), info);
    }

    #[test]
    fn set_breakpoint_defaults_apply() {
        let message = Message::decode(
            r#"{"method":"setBP","params":{"procuuid":"p","filename":"a.scr","line":3}}"#,
        )
        .expect("decoding");
        let params: SetBreakpoint = message.parse_params().expect("params");
        assert!(!params.temporary);
        assert!(params.condition.is_none());
    }

    #[test]
    fn exit_code_uses_camel_case_on_the_wire() {
        let message = Message::with_params(
            Method::EpilogueExitCode,
            "p",
            &EpilogueExitCode {
                exit_code: 3,
                message: String::new(),
            },
        )
        .expect("building");
        assert_eq!(message.params["exitCode"], 3);
    }
}
