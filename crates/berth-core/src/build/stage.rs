//! Build stage definitions and fingerprinting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;
use crate::fingerprint::Fingerprint;

/// A named unit of build work, the equivalent of one stage of a multi-stage
/// image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStage {
    pub name: String,
    /// Stages whose artifacts this stage consumes.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Declared inputs: literal values or content hashes of files.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Command handed to the build backend.
    #[serde(default)]
    pub command: Vec<String>,
}

impl BuildStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            inputs: BTreeMap::new(),
            command: Vec::new(),
        }
    }

    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Fingerprint over this stage's declared inputs and the fingerprints of
    /// its direct dependencies.
    ///
    /// `dependency_fingerprints` must contain every entry of `depends_on`;
    /// a change anywhere upstream therefore changes every downstream
    /// fingerprint.
    pub fn fingerprint(
        &self,
        dependency_fingerprints: &BTreeMap<String, Fingerprint>,
    ) -> Result<Fingerprint> {
        let deps: BTreeMap<&str, &str> = self
            .depends_on
            .iter()
            .filter_map(|dep| {
                dependency_fingerprints
                    .get(dep)
                    .map(|fp| (dep.as_str(), fp.as_str()))
            })
            .collect();

        Fingerprint::of_json(&json!({
            "stage": self.name,
            "inputs": self.inputs,
            "command": self.command,
            "deps": deps,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_changes_with_inputs() {
        let a = BuildStage::new("deps").with_input("requirements", "flask==3.0");
        let b = BuildStage::new("deps").with_input("requirements", "flask==3.1");
        let none = BTreeMap::new();
        assert_ne!(a.fingerprint(&none).unwrap(), b.fingerprint(&none).unwrap());
    }

    #[test]
    fn test_fingerprint_changes_with_upstream() {
        let app = BuildStage::new("app").depends_on("deps");
        let mut up1 = BTreeMap::new();
        up1.insert("deps".to_string(), Fingerprint::from_bytes(b"v1"));
        let mut up2 = BTreeMap::new();
        up2.insert("deps".to_string(), Fingerprint::from_bytes(b"v2"));
        assert_ne!(app.fingerprint(&up1).unwrap(), app.fingerprint(&up2).unwrap());
    }

    #[test]
    fn test_fingerprint_ignores_dependency_declaration_order() {
        let mut ups = BTreeMap::new();
        ups.insert("a".to_string(), Fingerprint::from_bytes(b"a"));
        ups.insert("b".to_string(), Fingerprint::from_bytes(b"b"));
        let ab = BuildStage::new("app").depends_on("a").depends_on("b");
        let ba = BuildStage::new("app").depends_on("b").depends_on("a");
        assert_eq!(ab.fingerprint(&ups).unwrap(), ba.fingerprint(&ups).unwrap());
    }

    #[test]
    fn test_fingerprint_includes_stage_name() {
        let none = BTreeMap::new();
        assert_ne!(
            BuildStage::new("a").fingerprint(&none).unwrap(),
            BuildStage::new("b").fingerprint(&none).unwrap()
        );
    }
}
