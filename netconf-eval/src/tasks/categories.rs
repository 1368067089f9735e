//! Experiment and prompt-augmentation categories

use serde::{Deserialize, Serialize};

/// Benchmark experiment families
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Experiment {
    /// Natural-language requirements to formal policies
    Translation,
    /// Translation with a contradicting requirement planted in half the batches
    Conflict,
    /// Routing-algorithm code generation
    Code,
    /// Low-level device configuration generation
    Config,
}

impl Experiment {
    pub fn all() -> Vec<Experiment> {
        vec![
            Experiment::Translation,
            Experiment::Conflict,
            Experiment::Code,
            Experiment::Config,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Experiment::Translation => "translation",
            Experiment::Conflict => "conflict",
            Experiment::Code => "code",
            Experiment::Config => "config",
        }
    }

    /// Whether answers are policy sets split across a batch
    pub fn is_batched(&self) -> bool {
        matches!(self, Experiment::Translation)
    }
}

impl std::fmt::Display for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Experiment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "translation" | "translate" => Ok(Experiment::Translation),
            "conflict" | "conflict_detection" => Ok(Experiment::Conflict),
            "code" | "codegen" => Ok(Experiment::Code),
            "config" | "configuration" => Ok(Experiment::Config),
            _ => Err(format!("Unknown experiment: {}", s)),
        }
    }
}

/// How reference documentation is attached to configuration prompts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RagMode {
    #[default]
    Off,
    /// The whole document set goes into the prompt
    Full,
    /// Only the chunks sharing the most terms with the request
    Chunked,
}

impl RagMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RagMode::Off => "off",
            RagMode::Full => "full",
            RagMode::Chunked => "chunked",
        }
    }
}

impl std::str::FromStr for RagMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "no" => Ok(RagMode::Off),
            "full" | "all" => Ok(RagMode::Full),
            "chunked" | "chunks" | "retrieval" => Ok(RagMode::Chunked),
            _ => Err(format!("Unknown RAG mode: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experiment_names_round_trip() {
        for experiment in Experiment::all() {
            assert_eq!(experiment.as_str().parse::<Experiment>().unwrap(), experiment);
        }
        assert_eq!("conflict_detection".parse::<Experiment>().unwrap(), Experiment::Conflict);
        assert!("routing".parse::<Experiment>().is_err());
    }

    #[test]
    fn test_rag_mode_parsing() {
        assert_eq!("chunked".parse::<RagMode>().unwrap(), RagMode::Chunked);
        assert_eq!("NONE".parse::<RagMode>().unwrap(), RagMode::Off);
        assert!("partial".parse::<RagMode>().is_err());
    }
}
