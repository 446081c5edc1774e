//! The protocol method vocabulary.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! methods {
    ($($variant:ident => $name:literal,)+) => {
        /// A protocol method name.
        ///
        /// The vocabulary is closed for everything this build understands;
        /// anything else decodes to [`Method::Unknown`] so that a peer
        /// speaking a newer protocol revision degrades to a logged no-op
        /// instead of a broken session.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum Method {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )+
            /// A method name this build does not recognize.
            Unknown(String),
        }

        impl Method {
            /// Parse a wire-format method name. Never fails: unrecognized
            /// names are preserved in [`Method::Unknown`].
            pub fn from_name(name: &str) -> Self {
                match name {
                    $($name => Self::$variant,)+
                    other => Self::Unknown(other.to_owned()),
                }
            }

            /// The wire-format name of this method.
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $name,)+
                    Self::Unknown(name) => name,
                }
            }
        }

        #[cfg(test)]
        const ALL_KNOWN: &[(&str, Method)] = &[
            $(($name, Method::$variant),)+
        ];
    };
}

methods! {
    ProcIdInfo => "procIDInfo",
    PrologueContinue => "prologueContinue",
    DebugStartup => "debugStartup",
    Stdin => "stdin",
    Stdout => "stdout",
    Stderr => "stderr",
    Variables => "variables",
    Variable => "variable",
    ThreadList => "threadList",
    ThreadSet => "threadSet",
    ForkTo => "forkTo",
    Continue => "continue",
    Step => "step",
    StepOver => "stepOver",
    StepOut => "stepOut",
    StepQuit => "stepQuit",
    MoveIp => "moveIP",
    Line => "line",
    Stack => "stack",
    Exception => "exception",
    SyntaxError => "syntaxError",
    CallTrace => "callTrace",
    SetBreakpoint => "setBP",
    ClearBreakpoint => "clearBP",
    BreakpointEnable => "bpEnable",
    BreakpointIgnore => "bpIgnore",
    BreakpointConditionError => "bpConditionError",
    SetWatch => "setWP",
    ClearWatch => "clearWP",
    WatchEnable => "wpEnable",
    WatchIgnore => "wpIgnore",
    WatchConditionError => "wpConditionError",
    SetEnvironment => "setEnvironment",
    SetFilter => "setFilter",
    ExecuteStatement => "executeStatement",
    ExecStatementOutput => "execStatementOutput",
    ExecStatementError => "execStatementError",
    Signal => "signal",
    Shutdown => "shutdown",
    EpilogueExitCode => "epilogueExitCode",
    EpilogueExit => "epilogueExit",
}

impl Method {
    /// Whether this method fell through the vocabulary.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl Serialize for Method {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_round_trip() {
        for (name, method) in ALL_KNOWN {
            assert_eq!(&Method::from_name(name), method, "parsing {name}");
            assert_eq!(method.as_str(), *name, "rendering {method:?}");
            assert!(!method.is_unknown());
        }
    }

    #[test]
    fn unknown_name_is_preserved() {
        let method = Method::from_name("framePoke");
        assert!(method.is_unknown());
        assert_eq!(method.as_str(), "framePoke");
    }

    #[test]
    fn serde_uses_wire_names() {
        let encoded = serde_json::to_string(&Method::SetBreakpoint).unwrap();
        assert_eq!(encoded, "\"setBP\"");

        let decoded: Method = serde_json::from_str("\"stepOver\"").unwrap();
        assert_eq!(decoded, Method::StepOver);
    }
}
