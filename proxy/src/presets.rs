use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::HashSet;

const EMBEDDED_PRESETS: &str = include_str!("presets.yaml");

/// A named bundle of allow-http entries. `matchers` are project files the
/// launcher uses to suggest a preset; the proxy carries them opaquely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preset {
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub matchers: Vec<String>,
    #[serde(default)]
    pub includes: Vec<String>,
}

/// Immutable registry of the embedded preset bundles, keyed by name.
#[derive(Debug)]
pub struct PresetRegistry {
    presets: Vec<Preset>,
    by_name: HashMap<String, usize>,
}

impl PresetRegistry {
    pub fn embedded() -> Result<Self> {
        Self::from_yaml(EMBEDDED_PRESETS)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let presets: Vec<Preset> =
            serde_yaml::from_str(raw).context("failed to parse preset document")?;
        let by_name = presets
            .iter()
            .enumerate()
            .map(|(idx, preset)| (preset.name.clone(), idx))
            .collect();
        Ok(Self { presets, by_name })
    }

    pub fn all(&self) -> &[Preset] {
        &self.presets
    }

    pub fn get(&self, name: &str) -> Option<&Preset> {
        self.by_name.get(name).map(|idx| &self.presets[*idx])
    }

    /// Expand preset names into a flat, ordered, deduplicated list of
    /// allow-http entries. Includes are expanded depth-first before the
    /// preset's own domains; unknown names are silently skipped.
    pub fn expand(&self, names: &[String]) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for name in names {
            self.expand_into(name, &mut visited, &mut seen, &mut out);
        }
        out
    }

    fn expand_into(
        &self,
        name: &str,
        visited: &mut HashSet<String>,
        seen: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        if !visited.insert(name.to_string()) {
            return;
        }
        let Some(preset) = self.get(name) else {
            return;
        };
        for include in &preset.includes {
            self.expand_into(include, visited, seen, out);
        }
        for domain in &preset.domains {
            if seen.insert(domain.clone()) {
                out.push(domain.clone());
            }
        }
    }
}
