//! JSON recovery and policy-document decoding

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::{calls, ParseError, ParseResult, Parsed};
use crate::policy::{NodeId, Policy, PolicyFilter, PolicySet, PolicyType};

/// Keys models like to add next to the answer; skipped with a warning
const COMMENTARY_KEYS: &[&str] = &["explanation", "reasoning", "notes", "comment", "comments", "conflict"];

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```([A-Za-z0-9_+.-]*)[ \t]*\r?\n(.*?)```").expect("fence pattern is valid")
    })
}

/// Fenced code blocks in a markdown response, as (language, body)
pub(crate) fn fenced_blocks(text: &str) -> Vec<(String, String)> {
    fence_regex()
        .captures_iter(text)
        .map(|caps| (caps[1].to_lowercase(), caps[2].to_string()))
        .collect()
}

/// Recover a JSON value from model output
///
/// Strict decoding first, then the first fenced block, then the first
/// balanced `{...}` or `[...]` substring that decodes.
pub fn extract_json(text: &str) -> Result<Value, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::MalformedOutput("empty response".to_string()));
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    for (_, body) in fenced_blocks(trimmed) {
        if let Ok(value) = serde_json::from_str(body.trim()) {
            return Ok(value);
        }
    }

    for candidate in balanced_candidates(trimmed) {
        if let Ok(value) = serde_json::from_str(candidate) {
            return Ok(value);
        }
    }

    Err(ParseError::MalformedOutput(
        "no decodable JSON object or array in response".to_string(),
    ))
}

/// Every balanced bracket span, in order of its opening position
fn balanced_candidates(text: &str) -> impl Iterator<Item = &str> {
    text.char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .filter_map(move |(start, _)| balanced_end(&text[start..]).map(|end| &text[start..start + end]))
}

/// Byte length of the balanced span opening at the start of `text`
fn balanced_end(text: &str) -> Option<usize> {
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (idx, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                if closers.pop() != Some(c) {
                    return None;
                }
                if closers.is_empty() {
                    return Some(idx + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Decode a JSON policy document into a policy set
///
/// Accepts the keyed form (`{"reachability": [...], "waypoint": {...}}`),
/// a list of tagged objects (`[{"type": "waypoint", ...}]`) and a list of
/// call objects (`[{"name": "add_waypoint", "arguments": {...}}]`).
pub fn decode_policy_document(doc: &Value, filter: &PolicyFilter) -> ParseResult<PolicySet> {
    let mut set = PolicySet::new();
    let mut warnings = Vec::new();

    match doc {
        Value::Object(obj) if is_call_object(obj) => {
            let call = call_from_object(obj)?;
            return calls::parse_calls(&[call], filter);
        }
        Value::Object(obj) if obj.contains_key("type") => {
            decode_tagged(obj, filter, &mut set, &mut warnings)?;
        }
        Value::Object(obj) if obj.len() == 1 && obj.contains_key("policies") => {
            return decode_policy_document(&obj["policies"], filter);
        }
        Value::Object(obj) => {
            for (key, entries) in obj {
                if COMMENTARY_KEYS.contains(&key.to_lowercase().as_str()) {
                    warnings.push(format!("ignored commentary key `{}`", key));
                    continue;
                }
                let policy_type: PolicyType = key
                    .parse()
                    .map_err(|_| ParseError::UnknownPolicyType(key.clone()))?;
                if !filter.allows(policy_type) {
                    warnings.push(format!("dropped `{}` policies outside the requested types", policy_type));
                    continue;
                }
                for policy in decode_entries(policy_type, entries)? {
                    set.insert(policy);
                }
            }
        }
        Value::Array(items) => {
            let mut call_list = Vec::new();
            for item in items {
                match item {
                    Value::Object(obj) if is_call_object(obj) => call_list.push(call_from_object(obj)?),
                    Value::Object(obj) if obj.contains_key("type") => {
                        decode_tagged(obj, filter, &mut set, &mut warnings)?;
                    }
                    other => {
                        return Err(ParseError::MalformedOutput(format!(
                            "unrecognised policy entry: {}",
                            other
                        )))
                    }
                }
            }
            if !call_list.is_empty() {
                let parsed = calls::parse_calls(&call_list, filter)?;
                warnings.extend(parsed.warnings);
                set.extend(parsed.value);
            }
        }
        other => {
            return Err(ParseError::MalformedOutput(format!(
                "expected a JSON object or array, got {}",
                other
            )))
        }
    }

    Ok(Parsed::with_warnings(set, warnings))
}

fn is_call_object(obj: &Map<String, Value>) -> bool {
    (obj.contains_key("name") || obj.contains_key("function")) && obj.contains_key("arguments")
}

fn call_from_object(obj: &Map<String, Value>) -> Result<super::FunctionCall, ParseError> {
    let name = obj
        .get("name")
        .or_else(|| obj.get("function"))
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::MalformedOutput("function call without a name".to_string()))?;
    Ok(super::FunctionCall::new(name, obj["arguments"].clone()))
}

fn decode_tagged(
    obj: &Map<String, Value>,
    filter: &PolicyFilter,
    set: &mut PolicySet,
    warnings: &mut Vec<String>,
) -> Result<(), ParseError> {
    let tag = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::MalformedOutput("policy `type` must be a string".to_string()))?;
    let policy_type: PolicyType = tag
        .parse()
        .map_err(|_| ParseError::UnknownPolicyType(tag.to_string()))?;
    if !filter.allows(policy_type) {
        warnings.push(format!("dropped `{}` policy outside the requested types", policy_type));
        return Ok(());
    }
    set.insert(decode_entry(policy_type, &Value::Object(obj.clone()))?);
    Ok(())
}

/// Decode the value under a policy-type key: a list of entries or a map form
fn decode_entries(policy_type: PolicyType, entries: &Value) -> Result<Vec<Policy>, ParseError> {
    match entries {
        Value::Array(items) => items.iter().map(|item| decode_entry(policy_type, item)).collect(),
        Value::Object(map) => decode_map_form(policy_type, map),
        Value::Null => Ok(Vec::new()),
        other => Err(ParseError::MalformedOutput(format!(
            "`{}` entries must be a list or a map, got {}",
            policy_type, other
        ))),
    }
}

/// Map forms: `{"A": ["B"]}` for reachability, `{"(A,C)": ...}` for the rest
fn decode_map_form(policy_type: PolicyType, map: &Map<String, Value>) -> Result<Vec<Policy>, ParseError> {
    let mut policies = Vec::new();
    for (key, value) in map {
        if let Some((source, destination)) = parse_pair_key(key) {
            match policy_type {
                PolicyType::Reachability => {
                    policies.push(Policy::reachability(source, destination, as_bool(value).unwrap_or(true)));
                }
                PolicyType::Waypoint => {
                    for via in node_list(value)? {
                        policies.push(Policy::waypoint(source.clone(), destination.clone(), via));
                    }
                }
                PolicyType::LoadBalance => {
                    policies.push(Policy::load_balance(source, destination, weights(value)?));
                }
                PolicyType::ShortestPath => {
                    policies.push(Policy::shortest_path(source, destination, node_list(value)?));
                }
            }
        } else if policy_type == PolicyType::Reachability {
            for destination in node_list(value)? {
                policies.push(Policy::reachability(key.as_str(), destination, true));
            }
        } else {
            return Err(ParseError::MalformedOutput(format!(
                "`{}` map key `{}` is not a (source, destination) pair",
                policy_type, key
            )));
        }
    }
    Ok(policies)
}

/// Parse `(A, B)`, `A,B` or `A->B` into its two endpoints
fn parse_pair_key(key: &str) -> Option<(NodeId, NodeId)> {
    let compact: String = key.chars().filter(|c| !c.is_whitespace()).collect();
    let inner = compact
        .trim_start_matches(['(', '['])
        .trim_end_matches([')', ']'])
        .replace('\'', "")
        .replace('"', "");
    let (source, destination) = inner.split_once("->").or_else(|| inner.split_once(','))?;
    if source.is_empty() || destination.is_empty() || destination.contains(',') {
        return None;
    }
    Some((NodeId::new(source), NodeId::new(destination)))
}

/// Decode one entry, positional (`["A", "B", true]`) or keyed (`{"source": ...}`)
pub(crate) fn decode_entry(policy_type: PolicyType, entry: &Value) -> Result<Policy, ParseError> {
    match entry {
        Value::Array(fields) => decode_positional(policy_type, fields),
        Value::Object(fields) => decode_keyed(policy_type, fields),
        Value::String(s) => {
            let inner: Value = serde_json::from_str(s).map_err(|_| {
                ParseError::MalformedOutput(format!("`{}` entry is not structured: {}", policy_type, s))
            })?;
            decode_entry(policy_type, &inner)
        }
        other => Err(ParseError::MalformedOutput(format!(
            "`{}` entry must be a list or an object, got {}",
            policy_type, other
        ))),
    }
}

fn decode_positional(policy_type: PolicyType, fields: &[Value]) -> Result<Policy, ParseError> {
    let arity_error = || {
        ParseError::MalformedOutput(format!(
            "`{}` entry has {} fields",
            policy_type,
            fields.len()
        ))
    };
    let source = fields.first().ok_or_else(arity_error).and_then(node)?;
    let destination = fields.get(1).ok_or_else(arity_error).and_then(node)?;

    match policy_type {
        PolicyType::Reachability => {
            let allowed = match fields.get(2) {
                Some(value) => as_bool(value).ok_or_else(|| {
                    ParseError::MalformedOutput(format!("reachability flag must be boolean, got {}", value))
                })?,
                None => true,
            };
            Ok(Policy::reachability(source, destination, allowed))
        }
        PolicyType::Waypoint => {
            let via = fields.get(2).ok_or_else(arity_error).and_then(node)?;
            Ok(Policy::waypoint(source, destination, via))
        }
        PolicyType::LoadBalance => {
            let hops = fields.get(2).ok_or_else(arity_error)?;
            Ok(Policy::load_balance(source, destination, weights(hops)?))
        }
        PolicyType::ShortestPath => {
            let hops = match fields.get(2) {
                Some(Value::Array(_)) => node_list(&fields[2])?,
                Some(_) => fields[2..].iter().map(node).collect::<Result<Vec<_>, _>>()?,
                None => return Err(arity_error()),
            };
            Ok(Policy::shortest_path(source, destination, hops))
        }
    }
}

fn decode_keyed(policy_type: PolicyType, fields: &Map<String, Value>) -> Result<Policy, ParseError> {
    let pick = |names: &[&str]| names.iter().find_map(|name| fields.get(*name));
    let missing = |what: &str| ParseError::MalformedOutput(format!("`{}` entry has no {}", policy_type, what));

    let source = pick(&["source", "src", "from"]).ok_or_else(|| missing("source")).and_then(node)?;
    let destination = pick(&["destination", "dst", "dest", "to"])
        .ok_or_else(|| missing("destination"))
        .and_then(node)?;

    match policy_type {
        PolicyType::Reachability => {
            let allowed = match pick(&["allowed", "reachable", "allow", "action"]) {
                Some(value) => as_bool(value).ok_or_else(|| {
                    ParseError::MalformedOutput(format!("reachability flag must be boolean, got {}", value))
                })?,
                None => true,
            };
            Ok(Policy::reachability(source, destination, allowed))
        }
        PolicyType::Waypoint => {
            let via = pick(&["via", "waypoint", "through"]).ok_or_else(|| missing("waypoint")).and_then(node)?;
            Ok(Policy::waypoint(source, destination, via))
        }
        PolicyType::LoadBalance => {
            let hops = pick(&["next_hops", "weights", "hops", "paths"]).ok_or_else(|| missing("next hops"))?;
            Ok(Policy::load_balance(source, destination, weights(hops)?))
        }
        PolicyType::ShortestPath => {
            let hops = pick(&["hops", "path"]).ok_or_else(|| missing("path"))?;
            Ok(Policy::shortest_path(source, destination, node_list(hops)?))
        }
    }
}

fn node(value: &Value) -> Result<NodeId, ParseError> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(NodeId::new(s)),
        Value::Number(n) => Ok(NodeId::new(n.to_string())),
        other => Err(ParseError::MalformedOutput(format!("expected a node name, got {}", other))),
    }
}

fn node_list(value: &Value) -> Result<Vec<NodeId>, ParseError> {
    match value {
        Value::Array(items) => items.iter().map(node).collect(),
        single => Ok(vec![node(single)?]),
    }
}

/// Next-hop weights: `{"B": 0.5}`, `[["B", 0.5]]` or `["B", "C"]` (equal split)
fn weights(value: &Value) -> Result<Vec<(NodeId, f64)>, ParseError> {
    let bad = |v: &Value| ParseError::MalformedOutput(format!("invalid next-hop weight entry: {}", v));
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(hop, w)| w.as_f64().map(|w| (NodeId::new(hop), w)).ok_or_else(|| bad(w)))
            .collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Array(pair) if pair.len() == 2 => {
                    let hop = node(&pair[0])?;
                    let w = pair[1].as_f64().ok_or_else(|| bad(item))?;
                    Ok((hop, w))
                }
                other => node(other).map(|hop| (hop, 1.0)),
            })
            .collect(),
        other => Err(bad(other)),
    }
}

pub(crate) fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "allow" | "allowed" | "permit" => Some(true),
            "false" | "no" | "deny" | "denied" | "block" | "blocked" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_strict() {
        assert_eq!(extract_json(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_extract_from_fence() {
        let text = "Here you go:\n```json\n{\"reachability\": []}\n```\nAnything else?";
        assert_eq!(extract_json(text).unwrap(), json!({"reachability": []}));
    }

    #[test]
    fn test_extract_first_balanced_span() {
        let text = r#"The answer is {"waypoint": [["A", "C", "D"]]} and {"x": 2}"#;
        assert_eq!(extract_json(text).unwrap(), json!({"waypoint": [["A", "C", "D"]]}));
    }

    #[test]
    fn test_extract_skips_braces_inside_strings() {
        let text = r#"note: {"reason": "uses } and { inside", "ok": true} trailing"#;
        assert_eq!(
            extract_json(text).unwrap(),
            json!({"reason": "uses } and { inside", "ok": true})
        );
    }

    #[test]
    fn test_extract_fails_without_json() {
        assert!(matches!(
            extract_json("{ not json at all"),
            Err(ParseError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_original_map_forms() {
        let doc = json!({
            "reachability": {"h1": ["h2", "h3"]},
            "waypoint": {"(h1, h2)": ["fw"]},
            "loadbalancing": {"(h1, h3)": ["r1", "r2"]}
        });
        let parsed = decode_policy_document(&doc, &PolicyFilter::all()).unwrap();
        let set = parsed.value;
        assert_eq!(set.len(), 4);
        assert!(set.contains(&Policy::waypoint("h1", "h2", "fw")));
        assert!(set.contains(&Policy::load_balance("h1", "h3", [("r1", 0.5), ("r2", 0.5)])));
    }

    #[test]
    fn test_tagged_list() {
        let doc = json!([
            {"type": "reachability", "source": "A", "destination": "B", "allowed": "deny"},
            {"type": "shortest_path", "source": "A", "destination": "C", "path": ["A", "B", "C"]}
        ]);
        let set = decode_policy_document(&doc, &PolicyFilter::all()).unwrap().value;
        assert!(set.contains(&Policy::reachability("A", "B", false)));
        assert!(set.contains(&Policy::shortest_path("A", "C", ["A", "B", "C"])));
    }

    #[test]
    fn test_unknown_key_is_unknown_policy_type() {
        let doc = json!({"firewall": [["A", "B"]]});
        assert_eq!(
            decode_policy_document(&doc, &PolicyFilter::all()).unwrap_err(),
            ParseError::UnknownPolicyType("firewall".to_string())
        );

        let tagged = json!([{"type": "nat", "source": "A", "destination": "B"}]);
        assert!(matches!(
            decode_policy_document(&tagged, &PolicyFilter::all()),
            Err(ParseError::UnknownPolicyType(_))
        ));
    }

    #[test]
    fn test_filter_drops_with_warning() {
        let doc = json!({"reachability": [["A", "B", true]], "waypoint": [["A", "B", "C"]], "explanation": "done"});
        let filter = PolicyFilter::new([PolicyType::Reachability]);
        let parsed = decode_policy_document(&doc, &filter).unwrap();
        assert_eq!(parsed.value.len(), 1);
        assert_eq!(parsed.warnings.len(), 2);
    }

    #[test]
    fn test_malformed_entries() {
        let doc = json!({"reachability": [["A"]]});
        assert!(matches!(
            decode_policy_document(&doc, &PolicyFilter::all()),
            Err(ParseError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_pair_keys() {
        assert_eq!(
            parse_pair_key("(A, B)"),
            Some((NodeId::new("A"), NodeId::new("B")))
        );
        assert_eq!(parse_pair_key("A->B"), Some((NodeId::new("A"), NodeId::new("B"))));
        assert_eq!(parse_pair_key("A"), None);
    }
}
