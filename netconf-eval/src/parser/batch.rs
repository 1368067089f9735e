//! Splitting one batched response back into per-request answers

use std::collections::BTreeSet;

use serde_json::Value;

use super::json::decode_policy_document;
use super::{ParseError, ParseResult, Parsed, PolicyParser, RawOutput};
use crate::policy::{PolicyFilter, PolicyKey, PolicySet};

/// Split a response covering `request_keys.len()` requests
///
/// `request_keys[i]` holds the keys of the policies request `i` expects.
/// When the response is itemised (a JSON array with one element per request,
/// or one answer line per request) each item is parsed on its own. Decoded
/// policies are routed to requests by key, and an item that fails to parse
/// fails the request at its position. Otherwise the response is parsed once;
/// a failure then fails every request and a success is partitioned by key.
pub fn split_batch(
    parser: &dyn PolicyParser,
    output: &RawOutput,
    request_keys: &[BTreeSet<PolicyKey>],
    filter: &PolicyFilter,
) -> Vec<ParseResult<PolicySet>> {
    let n = request_keys.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![parser.parse(output, filter)];
    }

    if output.calls.is_empty() {
        if let Some(items) = itemised_array(&output.text, n) {
            let parsed = items
                .iter()
                .map(|item| match item {
                    Value::String(text) => parser.parse(&RawOutput::text(text.as_str()), filter),
                    other => decode_policy_document(other, filter),
                })
                .collect();
            return route_items(parsed, request_keys);
        }

        let whole = parser.parse(output, filter);
        if let Some(lines) = itemised_lines(&output.text, n, &whole, request_keys) {
            let parsed = lines
                .into_iter()
                .map(|line| parser.parse(&RawOutput::text(line), filter))
                .collect();
            return route_items(parsed, request_keys);
        }
        return split_whole(whole, request_keys);
    }

    split_whole(parser.parse(output, filter), request_keys)
}

fn split_whole(whole: ParseResult<PolicySet>, request_keys: &[BTreeSet<PolicyKey>]) -> Vec<ParseResult<PolicySet>> {
    match whole {
        Ok(parsed) => partition(parsed, request_keys).into_iter().map(Ok).collect(),
        Err(e) => vec![Err(e); request_keys.len()],
    }
}

fn itemised_array(text: &str, n: usize) -> Option<Vec<Value>> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    match value {
        Value::Array(items)
            if items.len() == n
                && items
                    .iter()
                    .all(|item| matches!(item, Value::Object(_) | Value::String(_))) =>
        {
            Some(items)
        }
        _ => None,
    }
}

/// One answer per line, unless the lines are the layout of a single document
///
/// Fence markers rule itemisation out, and so does a whole-response parse
/// that already answers more than one request.
fn itemised_lines<'a>(
    text: &'a str,
    n: usize,
    whole: &ParseResult<PolicySet>,
    request_keys: &[BTreeSet<PolicyKey>],
) -> Option<Vec<&'a str>> {
    if serde_json::from_str::<Value>(text.trim()).is_ok() {
        return None;
    }
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.len() != n || lines.iter().any(|line| line.starts_with("```")) {
        return None;
    }
    if let Ok(parsed) = whole {
        let answered: BTreeSet<usize> = parsed
            .value
            .iter()
            .filter_map(|policy| target_request(&policy.key(), request_keys))
            .collect();
        if answered.len() > 1 {
            return None;
        }
    }
    Some(lines)
}

/// Merge the decoded items and route them by key; a failed item fails the
/// request at its own position
fn route_items(items: Vec<ParseResult<PolicySet>>, request_keys: &[BTreeSet<PolicyKey>]) -> Vec<ParseResult<PolicySet>> {
    let mut merged = PolicySet::new();
    let mut warnings = Vec::new();
    let mut failures: Vec<Option<ParseError>> = vec![None; request_keys.len()];

    for (idx, item) in items.into_iter().enumerate() {
        match item {
            Ok(parsed) => {
                warnings.extend(parsed.warnings);
                merged.extend(parsed.value);
            }
            Err(e) => failures[idx] = Some(e),
        }
    }

    partition(Parsed::with_warnings(merged, warnings), request_keys)
        .into_iter()
        .zip(failures)
        .map(|(parsed, failure)| match failure {
            Some(e) => Err(e),
            None => Ok(parsed),
        })
        .collect()
}

/// The request expecting `key`; failing that, the request about the same endpoints
fn target_request(key: &PolicyKey, request_keys: &[BTreeSet<PolicyKey>]) -> Option<usize> {
    request_keys.iter().position(|keys| keys.contains(key)).or_else(|| {
        request_keys.iter().position(|keys| {
            keys.iter()
                .any(|k| k.source == key.source && k.destination == key.destination)
        })
    })
}

fn partition(parsed: Parsed<PolicySet>, request_keys: &[BTreeSet<PolicyKey>]) -> Vec<Parsed<PolicySet>> {
    let mut buckets: Vec<PolicySet> = vec![PolicySet::new(); request_keys.len()];
    let mut stray = Vec::new();

    for policy in parsed.value.into_vec() {
        match target_request(&policy.key(), request_keys) {
            Some(idx) => {
                buckets[idx].insert(policy);
            }
            None => stray.push(format!("no request matches {}", policy)),
        }
    }

    buckets
        .into_iter()
        .map(|set| {
            let mut warnings = parsed.warnings.clone();
            warnings.extend(stray.iter().cloned());
            Parsed::with_warnings(set, warnings)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::AdHocParser;
    use crate::policy::Policy;

    fn keys_for(policies: &[Policy]) -> Vec<BTreeSet<PolicyKey>> {
        policies.iter().map(|p| BTreeSet::from([p.key()])).collect()
    }

    fn requests() -> Vec<Policy> {
        vec![
            Policy::reachability("A", "B", true),
            Policy::reachability("C", "D", false),
            Policy::reachability("E", "F", true),
        ]
    }

    #[test]
    fn test_per_line_isolation() {
        let text = "{\"reachability\": [[\"A\",\"B\",true]]}\n\
                    {\"reachability\": [[\"C\",\"D\",false]]\n\
                    {\"reachability\": [[\"E\",\"F\",true]]}";
        let results = split_batch(&AdHocParser, &RawOutput::text(text), &keys_for(&requests()), &PolicyFilter::all());

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ParseError::MalformedOutput(_))));
        assert_eq!(
            results[2].as_ref().unwrap().value,
            PolicySet::from(vec![Policy::reachability("E", "F", true)])
        );
    }

    #[test]
    fn test_array_items() {
        let text = r#"[{"reachability": [["A","B",true]]}, "garbage", {"reachability": [["E","F",true]]}]"#;
        let results = split_batch(&AdHocParser, &RawOutput::text(text), &keys_for(&requests()), &PolicyFilter::all());
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_whole_document_partitioned() {
        let text = r#"{"reachability": [["E","F",true], ["A","B",true], ["C","D",true]]}"#;
        let results = split_batch(&AdHocParser, &RawOutput::text(text), &keys_for(&requests()), &PolicyFilter::all());
        let sets: Vec<PolicySet> = results.into_iter().map(|r| r.unwrap().value).collect();
        assert_eq!(sets[0], PolicySet::from(vec![Policy::reachability("A", "B", true)]));
        // wrong verdict still lands on its request and fails scoring there
        assert_eq!(sets[1], PolicySet::from(vec![Policy::reachability("C", "D", true)]));
        assert_eq!(sets[2], PolicySet::from(vec![Policy::reachability("E", "F", true)]));
    }

    #[test]
    fn test_whole_batch_failure() {
        let results = split_batch(
            &AdHocParser,
            &RawOutput::text("I cannot help with that."),
            &keys_for(&requests()),
            &PolicyFilter::all(),
        );
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_err()));
    }

    #[test]
    fn test_array_items_routed_by_key() {
        let text = r#"[
            {"type": "reachability", "source": "E", "destination": "F", "allowed": true},
            {"type": "reachability", "source": "A", "destination": "B", "allowed": true},
            {"type": "reachability", "source": "C", "destination": "D", "allowed": false}
        ]"#;
        let results = split_batch(&AdHocParser, &RawOutput::text(text), &keys_for(&requests()), &PolicyFilter::all());
        let sets: Vec<PolicySet> = results.into_iter().map(|r| r.unwrap().value).collect();
        for (set, policy) in sets.iter().zip(requests()) {
            assert_eq!(set, &PolicySet::from(vec![policy]));
        }
    }

    #[test]
    fn test_fenced_whole_document() {
        let text = "```json\n{\"reachability\": [[\"A\",\"B\",true],[\"C\",\"D\",false],[\"E\",\"F\",true]]}\n```";
        let results = split_batch(&AdHocParser, &RawOutput::text(text), &keys_for(&requests()), &PolicyFilter::all());
        let sets: Vec<PolicySet> = results.into_iter().map(|r| r.unwrap().value).collect();
        for (set, policy) in sets.iter().zip(requests()) {
            assert_eq!(set, &PolicySet::from(vec![policy]));
        }
    }

    #[test]
    fn test_prose_wrapped_whole_document() {
        let requests = &requests()[..2];
        let text = "Here is the result:\n{\"reachability\": [[\"A\",\"B\",true],[\"C\",\"D\",false]]}";
        let results = split_batch(&AdHocParser, &RawOutput::text(text), &keys_for(requests), &PolicyFilter::all());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().value, PolicySet::from(vec![requests[0].clone()]));
        assert_eq!(results[1].as_ref().unwrap().value, PolicySet::from(vec![requests[1].clone()]));
    }

    #[test]
    fn test_pretty_printed_whole_document() {
        let text = "{\n  \"reachability\": [\n    [\"A\", \"B\", true],\n    [\"C\", \"D\", false],\n    [\"E\", \"F\", true]\n  ]\n}";
        let results = split_batch(&AdHocParser, &RawOutput::text(text), &keys_for(&requests()), &PolicyFilter::all());
        assert!(results.iter().all(|r| r.as_ref().map(|p| p.value.len() == 1).unwrap_or(false)));
    }
}
