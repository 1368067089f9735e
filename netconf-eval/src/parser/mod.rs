//! Output parsing: raw model responses into policy sets and artifacts
//!
//! Parsing is pure. Nothing in this module logs; diagnostics travel back to
//! the caller as [`Parsed::warnings`] or as a [`ParseError`].

pub mod artifacts;
pub mod batch;
pub mod calls;
pub mod json;

pub use artifacts::{extract_code, parse_conflict_answer, parse_low_level_config, CandidateSource, ConflictAnswer};
pub use batch::split_batch;
pub use calls::{parse_calls, scan_text_calls};
pub use json::{decode_policy_document, extract_json};

use serde::{Deserialize, Serialize};

use crate::policy::{LowLevelConfig, PolicyFilter, PolicySet};

/// A function call emitted by a model, natively or written out as text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Object, positional array, or a JSON string holding either
    pub arguments: serde_json::Value,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// What a model handed back: free text plus any structured calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOutput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<FunctionCall>,
}

impl RawOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            calls: Vec::new(),
        }
    }

    pub fn calls(calls: Vec<FunctionCall>) -> Self {
        Self {
            text: String::new(),
            calls,
        }
    }

    /// Printable form stored in trial records
    pub fn render(&self) -> String {
        if self.calls.is_empty() {
            return self.text.clone();
        }
        let calls: Vec<String> = self
            .calls
            .iter()
            .map(|c| format!("{}({})", c.name, c.arguments))
            .collect();
        if self.text.trim().is_empty() {
            calls.join("\n")
        } else {
            format!("{}\n{}", self.text, calls.join("\n"))
        }
    }
}

/// A parsed value together with the non-fatal diagnostics met on the way
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub value: T,
    pub warnings: Vec<String>,
}

impl<T> Parsed<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(value: T, warnings: Vec<String>) -> Self {
        Self { value, warnings }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Parsed<U> {
        Parsed {
            value: f(self.value),
            warnings: self.warnings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ParseError {
    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("unknown policy type: {0}")]
    UnknownPolicyType(String),
}

impl ParseError {
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::MalformedOutput(_) => "malformed_output",
            ParseError::UnknownPolicyType(_) => "unknown_policy_type",
        }
    }
}

pub type ParseResult<T> = Result<Parsed<T>, ParseError>;

/// Everything the parser can recover from a response, by experiment
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedOutput {
    Policies(PolicySet),
    ConflictReport(String),
    Code(CandidateSource),
    Config(LowLevelConfig),
}

/// Strategy turning a raw response into a policy set
pub trait PolicyParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, output: &RawOutput, filter: &PolicyFilter) -> ParseResult<PolicySet>;
}

/// Reads policies out of free text: a JSON document, or calls written inline
/// such as `add_reachability("A", "B", true)`
#[derive(Debug, Clone, Copy, Default)]
pub struct AdHocParser;

impl PolicyParser for AdHocParser {
    fn name(&self) -> &'static str {
        "ad-hoc"
    }

    fn parse(&self, output: &RawOutput, filter: &PolicyFilter) -> ParseResult<PolicySet> {
        let json_attempt = extract_json(&output.text).and_then(|doc| decode_policy_document(&doc, filter));
        if json_attempt.is_ok() {
            return json_attempt;
        }

        let text_calls = scan_text_calls(&output.text);
        if !text_calls.is_empty() {
            return parse_calls(&text_calls, filter);
        }

        json_attempt
    }
}

/// Reads the structured tool-call payload of models with native function calling
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCallParser;

impl PolicyParser for NativeCallParser {
    fn name(&self) -> &'static str {
        "native"
    }

    fn parse(&self, output: &RawOutput, filter: &PolicyFilter) -> ParseResult<PolicySet> {
        if output.calls.is_empty() {
            let mut parsed = AdHocParser.parse(output, filter)?;
            parsed
                .warnings
                .insert(0, "no native function calls in response; parsed text instead".to_string());
            return Ok(parsed);
        }
        parse_calls(&output.calls, filter)
    }
}

/// Select the parsing strategy matching a model's capability
pub fn parser_for(native_function_calling: bool) -> Box<dyn PolicyParser> {
    if native_function_calling {
        Box::new(NativeCallParser)
    } else {
        Box::new(AdHocParser)
    }
}
