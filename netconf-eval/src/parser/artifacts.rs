//! Non-policy artifacts: candidate source code, device configurations and
//! conflict reports

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::calls::{scan_text_calls, REPORT_CONFLICT};
use super::json::{extract_json, fenced_blocks};
use super::{FunctionCall, ParseError, ParseResult, Parsed, PolicyParser, RawOutput};
use crate::policy::{LowLevelConfig, PolicyFilter, PolicySet};

/// Program text recovered from a code-generation answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSource {
    pub language: Option<String>,
    pub source: String,
}

const NON_CODE_FENCES: &[&str] = &["json", "text", "txt", "markdown", "md"];

/// Pull the program out of a response
///
/// The first fenced block tagged with a programming language wins, then the
/// first fenced block of any kind, then the whole response.
pub fn extract_code(output: &RawOutput) -> ParseResult<CandidateSource> {
    let blocks = fenced_blocks(&output.text);

    let chosen = blocks
        .iter()
        .find(|(lang, _)| !lang.is_empty() && !NON_CODE_FENCES.contains(&lang.as_str()))
        .or_else(|| blocks.first());

    let candidate = match chosen {
        Some((lang, body)) => CandidateSource {
            language: (!lang.is_empty()).then(|| lang.clone()),
            source: body.trim_end().to_string(),
        },
        None => CandidateSource {
            language: None,
            source: output.text.trim().to_string(),
        },
    };

    if candidate.source.trim().is_empty() {
        return Err(ParseError::MalformedOutput("response contains no code".to_string()));
    }

    let mut warnings = Vec::new();
    if blocks.len() > 1 {
        warnings.push(format!("{} code blocks in response; using one", blocks.len()));
    }
    Ok(Parsed::with_warnings(candidate, warnings))
}

/// Read a device-to-configuration mapping
///
/// Accepts `{"r1": "router ospf ..."}`, per-device line arrays, and the same
/// under a `configs` or `devices` wrapper.
pub fn parse_low_level_config(output: &RawOutput) -> ParseResult<LowLevelConfig> {
    let doc = extract_json(&output.text)?;
    let obj = match &doc {
        Value::Object(obj) => obj,
        other => {
            return Err(ParseError::MalformedOutput(format!(
                "expected a device map, got {}",
                other
            )))
        }
    };
    let devices = ["configs", "devices"]
        .iter()
        .find_map(|wrapper| obj.get(*wrapper).and_then(Value::as_object))
        .filter(|_| obj.len() == 1)
        .unwrap_or(obj);

    let mut config = LowLevelConfig::new();
    for (device, text) in devices {
        let text = match text {
            Value::String(s) => s.clone(),
            Value::Array(lines) => lines
                .iter()
                .map(|line| line.as_str().map(str::to_string).unwrap_or_else(|| line.to_string()))
                .collect::<Vec<_>>()
                .join("\n"),
            other => {
                return Err(ParseError::MalformedOutput(format!(
                    "configuration of `{}` must be text, got {}",
                    device, other
                )))
            }
        };
        config.insert(device.as_str(), text);
    }

    if config.is_empty() {
        return Err(ParseError::MalformedOutput("no device configurations in response".to_string()));
    }
    Ok(Parsed::new(config))
}

/// Answer to a conflict-detection prompt
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictAnswer {
    /// The model refused to translate and explained the contradiction
    Conflict(String),
    Policies(PolicySet),
}

/// Read either a conflict report or a translated policy set
pub fn parse_conflict_answer(
    parser: &dyn PolicyParser,
    output: &RawOutput,
    filter: &PolicyFilter,
) -> ParseResult<ConflictAnswer> {
    if let Some(call) = output.calls.iter().find(|c| c.name == REPORT_CONFLICT) {
        return Ok(Parsed::new(ConflictAnswer::Conflict(conflict_reason(call))));
    }
    if let Some(call) = scan_text_calls(&output.text)
        .into_iter()
        .find(|c| c.name == REPORT_CONFLICT)
    {
        return Ok(Parsed::new(ConflictAnswer::Conflict(conflict_reason(&call))));
    }
    if let Ok(Value::Object(obj)) = extract_json(&output.text) {
        if let Some(flag) = obj.get("conflict") {
            let reason = obj
                .get("reason")
                .or_else(|| obj.get("explanation"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            match flag {
                Value::Bool(false) => {}
                Value::String(s) => return Ok(Parsed::new(ConflictAnswer::Conflict(s.clone()))),
                _ => return Ok(Parsed::new(ConflictAnswer::Conflict(reason))),
            }
        }
    }

    parser
        .parse(output, filter)
        .map(|parsed| parsed.map(ConflictAnswer::Policies))
}

fn conflict_reason(call: &FunctionCall) -> String {
    match &call.arguments {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("reason")
            .or_else(|| obj.get("explanation"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Value::Array(items) => items
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}
