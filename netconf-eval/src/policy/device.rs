//! Low-level device configuration produced for a fixed topology

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::NodeId;

/// Device identifier to configuration text (OSPF/RIP/BGP stanzas and so on)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LowLevelConfig {
    devices: BTreeMap<NodeId, String>,
}

impl LowLevelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: impl Into<NodeId>, config: impl Into<String>) -> Self {
        self.insert(device, config);
        self
    }

    pub fn insert(&mut self, device: impl Into<NodeId>, config: impl Into<String>) {
        self.devices.insert(device.into(), config.into());
    }

    pub fn get(&self, device: &NodeId) -> Option<&str> {
        self.devices.get(device).map(String::as_str)
    }

    pub fn devices(&self) -> impl Iterator<Item = (&NodeId, &str)> {
        self.devices.iter().map(|(node, text)| (node, text.as_str()))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices whose normalised configuration differs between the two
    pub fn text_diff(&self, other: &LowLevelConfig) -> Vec<String> {
        let mut diffs = Vec::new();
        for (device, text) in &self.devices {
            match other.devices.get(device) {
                None => diffs.push(format!("{}: missing", device)),
                Some(theirs) if normalize_config_text(text) != normalize_config_text(theirs) => {
                    diffs.push(format!("{}: configuration differs", device));
                }
                Some(_) => {}
            }
        }
        for device in other.devices.keys() {
            if !self.devices.contains_key(device) {
                diffs.push(format!("{}: unexpected device", device));
            }
        }
        diffs
    }
}

/// Canonical text of a device stanza: comment and blank lines dropped,
/// whitespace collapsed
pub fn normalize_config_text(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('!') && !line.starts_with('#'))
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalisation_ignores_layout() {
        let a = "router ospf\n  network 10.0.0.0/24   area 0\n!\n";
        let b = "! generated\nrouter ospf\nnetwork 10.0.0.0/24 area 0";
        assert_eq!(normalize_config_text(a), normalize_config_text(b));
    }

    #[test]
    fn test_text_diff() {
        let expected = LowLevelConfig::new()
            .with_device("r1", "router rip\n network 10.0.0.0")
            .with_device("r2", "router rip");
        let produced = LowLevelConfig::new()
            .with_device("r1", "router rip\nnetwork 10.0.0.0")
            .with_device("r3", "router rip");

        let diff = expected.text_diff(&produced);
        assert_eq!(diff.len(), 2);
        assert!(diff.iter().any(|d| d.starts_with("r2")));
        assert!(diff.iter().any(|d| d.starts_with("r3")));
    }
}
