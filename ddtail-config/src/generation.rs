// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{AgentConfig, ConfigError, DestinationConfig, SourceConfig};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// An immutable, validated set of source and destination configs.
///
/// Readers and sender queues hold `Arc`s into the generation that created
/// them; publishing a new generation never mutates an old one, so in-flight
/// work drains under the config it started with.
#[derive(Debug, Clone)]
pub struct Generation {
    pub id: u64,
    sources: Vec<Arc<SourceConfig>>,
    destinations: HashMap<String, Arc<DestinationConfig>>,
}

impl Generation {
    /// Validate `config` and build the next generation. Invalid sources are
    /// reported in the error list and omitted; destinations must all be well
    /// formed for the file to be usable at all.
    pub fn build(config: &AgentConfig) -> (Generation, Vec<ConfigError>) {
        let mut errors = Vec::new();
        let destinations: HashMap<String, Arc<DestinationConfig>> = config
            .destinations
            .iter()
            .map(|d| (d.name.clone(), Arc::new(d.clone())))
            .collect();

        let mut seen = HashSet::new();
        let mut sources = Vec::new();
        for source in &config.sources {
            if !seen.insert(source.name.clone()) {
                errors.push(ConfigError::DuplicateSource(source.name.clone()));
                continue;
            }
            if !destinations.contains_key(&source.destination) {
                errors.push(ConfigError::UnknownDestination {
                    source_name: source.name.clone(),
                    destination: source.destination.clone(),
                });
                continue;
            }
            match source.validate() {
                Ok(()) => sources.push(Arc::new(source.clone())),
                Err(e) => {
                    warn!(source = %source.name, error = %e, "omitting invalid source");
                    errors.push(e);
                }
            }
        }

        let generation = Generation {
            id: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            sources,
            destinations,
        };
        (generation, errors)
    }

    pub fn sources(&self) -> &[Arc<SourceConfig>] {
        &self.sources
    }

    pub fn source(&self, name: &str) -> Option<&Arc<SourceConfig>> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn destination(&self, name: &str) -> Option<&Arc<DestinationConfig>> {
        self.destinations.get(name)
    }

    pub fn destinations(&self) -> impl Iterator<Item = &Arc<DestinationConfig>> {
        self.destinations.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_config(json: serde_json::Value) -> AgentConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_invalid_source_omitted_not_fatal() {
        let config = agent_config(serde_json::json!({
            "sources": [
                {
                    "name": "good",
                    "path_glob": "/var/log/*.log",
                    "destination": "main"
                },
                {
                    "name": "bad-regex",
                    "path_glob": "/var/log/*.log",
                    "destination": "main",
                    "multiline": { "mode": "start", "start": "^([" }
                },
                {
                    "name": "bad-dest",
                    "path_glob": "/var/log/*.log",
                    "destination": "nowhere"
                }
            ],
            "destinations": [
                { "name": "main", "endpoint": "https://intake.example.com/v1" }
            ]
        }));
        let (generation, errors) = Generation::build(&config);
        assert_eq!(generation.sources().len(), 1);
        assert_eq!(generation.sources()[0].name, "good");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_duplicate_source_names() {
        let config = agent_config(serde_json::json!({
            "sources": [
                { "name": "a", "path_glob": "/x/*.log", "destination": "main" },
                { "name": "a", "path_glob": "/y/*.log", "destination": "main" }
            ],
            "destinations": [
                { "name": "main", "endpoint": "https://intake.example.com/v1" }
            ]
        }));
        let (generation, errors) = Generation::build(&config);
        assert_eq!(generation.sources().len(), 1);
        assert!(matches!(errors[0], ConfigError::DuplicateSource(_)));
    }

    #[test]
    fn test_generations_are_monotonic() {
        let config = agent_config(serde_json::json!({
            "sources": [],
            "destinations": []
        }));
        let (g1, _) = Generation::build(&config);
        let (g2, _) = Generation::build(&config);
        assert!(g2.id > g1.id);
    }
}
