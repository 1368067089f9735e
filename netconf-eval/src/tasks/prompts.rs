//! Fixed prompt builder for the benchmark experiments
//!
//! Prompts are deliberately plain. System prompts are emitted as separate
//! messages; clients whose models take one system prompt merge them.

use serde_json::json;

use super::categories::RagMode;
use super::loader::ConfigScenario;
use crate::parser::calls::REPORT_CONFLICT;
use crate::policy::{PolicyFilter, PolicyType};
use crate::providers::{FunctionSchema, Message};

pub const SETUP_PROMPT: &str = "You are a network operator assistant. You turn requirements written \
in natural language into formal network policies. Node names are case sensitive and must be copied \
exactly as they appear in the requirements.";

pub const ASK_FOR_RESULT_PROMPT: &str = "Answer with a single JSON object and nothing else. Each key is \
a policy type and each value is the list of policies of that type.";

pub const CONFLICT_PROMPT: &str = "Some batches contain requirements that contradict each other, for \
example the same traffic being both allowed and blocked. If you find such a contradiction do not \
translate anything; instead answer {\"conflict\": true, \"reason\": \"<which requirements clash>\"} \
or call report_conflict(reason).";

pub const CODE_SETUP_PROMPT: &str = "You are a network software engineer. Write a Python 3 function \
`solve(topology, query)` using only the standard library. `topology` is a dictionary with a `nodes` \
list and a `links` list whose items are {\"a\": node, \"b\": node, \"cost\": integer}; links are \
undirected. `query` is a dictionary whose `query` key names the question and which carries `source` \
and `destination` keys. Return a JSON-serialisable dictionary. Reply with one ```python fenced block.";

pub const CONFIG_SETUP_PROMPT: &str = "You are a network engineer. Write the configuration of every \
device in the topology so that the requirements hold. Answer with a JSON object mapping each device \
name to its full configuration text.";

/// Per-type wording of the policy function the model may call
fn function_description(policy_type: PolicyType) -> &'static str {
    match policy_type {
        PolicyType::Reachability => {
            "add_reachability(source, destination, allowed): traffic from source to destination is \
             allowed (true) or blocked (false). JSON key `reachability`, entries [source, destination, allowed]."
        }
        PolicyType::Waypoint => {
            "add_waypoint(source, destination, via): traffic from source to destination must traverse via. \
             JSON key `waypoint`, entries [source, destination, via]."
        }
        PolicyType::LoadBalance => {
            "add_load_balance(source, destination, next_hops): traffic from source to destination is split \
             across next hops with the given weights. JSON key `loadbalancing`, entries \
             [source, destination, {next_hop: weight}]."
        }
        PolicyType::ShortestPath => {
            "add_shortest_path(source, destination, hops): traffic from source to destination follows \
             exactly the given hop sequence. JSON key `shortest_path`, entries [source, destination, [hops]]."
        }
    }
}

/// Prompt listing the functions available for the selected policy types
pub fn function_prompt(filter: &PolicyFilter) -> String {
    let mut prompt = String::from("You can express policies with these functions:\n");
    for policy_type in filter.iter() {
        prompt.push_str("- ");
        prompt.push_str(function_description(policy_type));
        prompt.push('\n');
    }
    prompt
}

fn parameters(policy_type: PolicyType) -> serde_json::Value {
    let node = json!({"type": "string"});
    let (third_name, third) = match policy_type {
        PolicyType::Reachability => ("allowed", json!({"type": "boolean"})),
        PolicyType::Waypoint => ("via", node.clone()),
        PolicyType::LoadBalance => (
            "next_hops",
            json!({"type": "object", "additionalProperties": {"type": "number"}}),
        ),
        PolicyType::ShortestPath => ("hops", json!({"type": "array", "items": {"type": "string"}})),
    };
    json!({
        "type": "object",
        "properties": {
            "source": node,
            "destination": node,
            third_name: third,
        },
        "required": ["source", "destination", third_name],
    })
}

/// Tool schemas for models with native function calling
pub fn function_schemas(filter: &PolicyFilter) -> Vec<FunctionSchema> {
    filter
        .iter()
        .map(|policy_type| FunctionSchema {
            name: policy_type.call_name().to_string(),
            description: function_description(policy_type).to_string(),
            parameters: parameters(policy_type),
        })
        .collect()
}

pub fn report_conflict_schema() -> FunctionSchema {
    FunctionSchema {
        name: REPORT_CONFLICT.to_string(),
        description: "Report that the requirements contradict each other instead of translating them".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {"reason": {"type": "string"}},
            "required": ["reason"],
        }),
    }
}

/// Messages for a translation batch: one requirement per line
pub fn translation_messages(filter: &PolicyFilter, requirements: &[&str]) -> Vec<Message> {
    vec![
        Message::system(SETUP_PROMPT),
        Message::system(function_prompt(filter)),
        Message::user(requirements.join("\n")),
        Message::system(ASK_FOR_RESULT_PROMPT),
    ]
}

pub fn conflict_messages(filter: &PolicyFilter, requirements: &[&str]) -> Vec<Message> {
    vec![
        Message::system(SETUP_PROMPT),
        Message::system(function_prompt(filter)),
        Message::system(CONFLICT_PROMPT),
        Message::user(requirements.join(" ")),
        Message::system(ASK_FOR_RESULT_PROMPT),
    ]
}

fn code_task(kind: PolicyType) -> &'static str {
    match kind {
        PolicyType::Reachability => {
            "Implement reachability: for query \"reachability\" return {\"reachable\": true} when a path \
             exists between source and destination and {\"reachable\": false} otherwise."
        }
        PolicyType::ShortestPath => {
            "Implement Dijkstra's algorithm: for query \"shortest_path\" return {\"path\": [source, ..., \
             destination]}, the minimum-cost path including both endpoints."
        }
        PolicyType::Waypoint => {
            "Implement waypoint routing: for query \"waypoint\" with a `via` key return {\"path\": [...]}, \
             the shortest path from source to via followed by the shortest path from via to destination, \
             with via listed once."
        }
        PolicyType::LoadBalance => {
            "Implement ECMP load balancing: for query \"load_balance\" return {\"next_hops\": {neighbor: \
             share}} where the shares split traffic evenly across every equal-cost shortest path leaving \
             the source."
        }
    }
}

pub fn code_messages(kind: PolicyType) -> Vec<Message> {
    vec![Message::system(CODE_SETUP_PROMPT), Message::user(code_task(kind))]
}

/// Messages for a configuration task, with optional reference context
pub fn config_messages(scenario: &ConfigScenario, context: Option<&str>) -> Vec<Message> {
    let mut messages = vec![Message::system(CONFIG_SETUP_PROMPT)];
    if let Some(context) = context {
        messages.push(Message::system(format!("Reference documentation:\n{}", context)));
    }

    let links: Vec<String> = scenario
        .topology
        .links
        .iter()
        .map(|link| format!("{} -- {} (cost {})", link.a, link.b, link.cost))
        .collect();
    let nodes: Vec<&str> = scenario.topology.nodes.iter().map(|n| n.as_str()).collect();
    messages.push(Message::user(format!(
        "Devices: {}\nLinks:\n{}\nRequirements:\n{}",
        nodes.join(", "),
        links.join("\n"),
        scenario.requirements
    )));
    messages
}

/// Split documentation into chunks of at most `chunk_size` characters,
/// breaking on paragraph boundaries where possible
pub fn chunk_documents(docs: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in docs.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if !current.is_empty() && current.len() + paragraph.len() + 2 > chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
        if paragraph.len() > chunk_size {
            let chars: Vec<char> = paragraph.chars().collect();
            for piece in chars.chunks(chunk_size) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn terms(text: &str) -> std::collections::BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Reference documentation attached to configuration prompts
#[derive(Debug, Clone, Default)]
pub struct RagContext {
    mode: RagMode,
    full: String,
    chunks: Vec<String>,
    top_k: usize,
}

impl RagContext {
    pub fn new(mode: RagMode, docs: impl Into<String>, chunk_size: usize) -> Self {
        let full = docs.into();
        let chunks = match mode {
            RagMode::Chunked => chunk_documents(&full, chunk_size),
            _ => Vec::new(),
        };
        Self {
            mode,
            full,
            chunks,
            top_k: 3,
        }
    }

    pub fn off() -> Self {
        Self::default()
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn mode(&self) -> RagMode {
        self.mode
    }

    /// Context for a query; chunks ranked by shared terms, ties in document order
    pub fn context_for(&self, query: &str) -> Option<String> {
        match self.mode {
            RagMode::Off => None,
            RagMode::Full => (!self.full.trim().is_empty()).then(|| self.full.clone()),
            RagMode::Chunked => {
                let wanted = terms(query);
                let mut scored: Vec<(usize, usize)> = self
                    .chunks
                    .iter()
                    .enumerate()
                    .map(|(idx, chunk)| (terms(chunk).intersection(&wanted).count(), idx))
                    .filter(|(score, _)| *score > 0)
                    .collect();
                scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                let picked: Vec<&str> = scored
                    .iter()
                    .take(self.top_k)
                    .map(|(_, idx)| self.chunks[*idx].as_str())
                    .collect();
                (!picked.is_empty()).then(|| picked.join("\n\n"))
            }
        }
    }
}
