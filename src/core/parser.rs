//! Blueprint loading: structured declaration documents.
//!
//! A blueprint is a YAML (or JSON) document listing resource declarations.
//! Only deserialization happens here; names, types and references are
//! validated by the resolver.

use super::error::BlueprintError;
use super::types::Declaration;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A set of declarations loaded from one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Blueprint {
    #[serde(default)]
    pub resources: Vec<Declaration>,
}

/// Parse a blueprint from a string.
pub fn parse_blueprint(yaml: &str) -> Result<Blueprint, BlueprintError> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Parse a blueprint file from disk.
pub fn parse_blueprint_file(path: &Path) -> Result<Blueprint, BlueprintError> {
    let content = std::fs::read_to_string(path).map_err(|source| BlueprintError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_blueprint(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_blueprint() {
        let yaml = r#"
resources:
  - type: network
    name: onprem
    attributes:
      subnet: 10.6.0.0/16
  - type: container
    name: consul
    depends_on: [network.onprem]
    attributes:
      image: consul:1.16
      networks: [network.onprem]
  - type: sidecar
    name: envoy
    disabled: true
    attributes:
      target: container.consul
"#;
        let bp = parse_blueprint(yaml).unwrap();
        assert_eq!(bp.resources.len(), 3);
        assert_eq!(bp.resources[1].depends_on, vec!["network.onprem"]);
        assert!(bp.resources[2].disabled);
        assert_eq!(bp.resources[2].attributes["target"], "container.consul");
    }

    #[test]
    fn test_parse_blueprint_json_is_yaml() {
        let json = r#"{"resources": [{"type": "network", "name": "n"}]}"#;
        let bp = parse_blueprint(json).unwrap();
        assert_eq!(bp.resources[0].kind, "network");
    }

    #[test]
    fn test_parse_empty_blueprint() {
        let bp = parse_blueprint("{}").unwrap();
        assert!(bp.resources.is_empty());
    }

    #[test]
    fn test_parse_blueprint_missing_name() {
        let result = parse_blueprint("resources:\n  - type: network\n");
        assert!(matches!(result, Err(BlueprintError::Parse(_))));
    }

    #[test]
    fn test_parse_blueprint_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.yaml");
        std::fs::write(&path, "resources:\n  - type: container\n    name: web\n").unwrap();
        let bp = parse_blueprint_file(&path).unwrap();
        assert_eq!(bp.resources[0].name, "web");

        let missing = parse_blueprint_file(&dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(BlueprintError::Io { .. })));
    }
}
