//! Function-call decoding, for native tool calls and calls written as text

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::json::decode_entry;
use super::{FunctionCall, ParseError, ParseResult, Parsed};
use crate::policy::{PolicyFilter, PolicySet, PolicyType};

/// Call name a model uses to flag contradicting requirements
pub const REPORT_CONFLICT: &str = "report_conflict";

fn call_regex() -> &'static Regex {
    static CALL: OnceLock<Regex> = OnceLock::new();
    CALL.get_or_init(|| {
        Regex::new(r"\b((?:add|report)_[A-Za-z0-9_]*)\s*\(([^()]*)\)").expect("call pattern is valid")
    })
}

/// Turn a list of calls into a policy set
///
/// Each known call name maps to one policy constructor. Unknown names are
/// skipped with a warning; if nothing but unknown names was seen the whole
/// answer is an [`ParseError::UnknownPolicyType`].
pub fn parse_calls(calls: &[FunctionCall], filter: &PolicyFilter) -> ParseResult<PolicySet> {
    if calls.is_empty() {
        return Err(ParseError::MalformedOutput("no function calls in response".to_string()));
    }

    let mut set = PolicySet::new();
    let mut warnings = Vec::new();
    let mut unknown = Vec::new();

    for call in calls {
        if call.name == REPORT_CONFLICT {
            warnings.push("ignored conflict report in a policy answer".to_string());
            continue;
        }
        let Some(policy_type) = PolicyType::from_call_name(&call.name) else {
            warnings.push(format!("ignored unknown function call `{}`", call.name));
            unknown.push(call.name.clone());
            continue;
        };
        if !filter.allows(policy_type) {
            warnings.push(format!("dropped `{}` call outside the requested types", call.name));
            continue;
        }
        let policy = decode_entry(policy_type, &call.arguments).map_err(|e| match e {
            ParseError::MalformedOutput(detail) => {
                ParseError::MalformedOutput(format!("arguments of `{}`: {}", call.name, detail))
            }
            other => other,
        })?;
        if !set.insert(policy) {
            warnings.push(format!("duplicate `{}` call collapsed", call.name));
        }
    }

    if set.is_empty() && !unknown.is_empty() {
        return Err(ParseError::UnknownPolicyType(unknown.join(", ")));
    }

    Ok(Parsed::with_warnings(set, warnings))
}

/// Find calls written inline in prose, e.g. `add_waypoint("A", "C", via="D")`
pub fn scan_text_calls(text: &str) -> Vec<FunctionCall> {
    call_regex()
        .captures_iter(text)
        .map(|caps| FunctionCall::new(&caps[1], parse_arguments(&caps[2])))
        .collect()
}

/// Arguments become a positional array, or an object when all are `key=value`
fn parse_arguments(raw: &str) -> Value {
    let parts = split_top_level(raw);
    let keyed: Vec<(String, &str)> = parts
        .iter()
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            let key = key.trim();
            let is_ident = !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_');
            is_ident.then(|| (key.to_string(), value.trim()))
        })
        .collect();

    if !parts.is_empty() && keyed.len() == parts.len() {
        let map: Map<String, Value> = keyed
            .into_iter()
            .map(|(key, value)| (key, literal(value)))
            .collect();
        Value::Object(map)
    } else {
        Value::Array(parts.iter().map(|part| literal(part)).collect())
    }
}

/// Split on commas outside quotes and brackets
fn split_top_level(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for c in raw.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '[' | '{' => depth += 1,
                ']' | '}' => depth -= 1,
                ',' if depth == 0 => {
                    parts.push(current.trim().to_string());
                    current.clear();
                    continue;
                }
                _ => {}
            },
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn literal(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return value;
    }
    if raw.starts_with('[') || raw.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(&raw.replace('\'', "\"")) {
            return value;
        }
    }
    match raw {
        "True" => Value::Bool(true),
        "False" => Value::Bool(false),
        _ => Value::String(raw.trim_matches(['"', '\'']).to_string()),
    }
}
