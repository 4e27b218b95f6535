//! # Manifest Rendering
//!
//! Loads the manifest set at a unit's path inside a fetched source artifact
//! and turns each YAML document into a [`RenderedObject`] with a resolved
//! identity. The engine treats manifests as opaque declarative input: the
//! only fields it interprets are `kind` and `metadata.name`/`namespace`.
//!
//! Multi-document files are split on `---` separator lines, matching the
//! YAML stream convention used by kustomize output.

use crate::store::{ObjectRef, RenderedObject};
use crate::substitute::SubstituteError;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Rendering failures. Recorded on the unit and retried per policy; a
/// rendering failure never results in a partial apply.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("manifest path does not exist: {0}")]
    MissingPath(PathBuf),

    #[error("no manifest documents found under {0}")]
    EmptyManifestSet(PathBuf),

    #[error("failed to read {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("malformed manifest in {path}: {message}")]
    MalformedManifest { path: PathBuf, message: String },

    #[error("manifest in {path} is missing '{field}'")]
    MissingField { path: PathBuf, field: String },

    #[error(transparent)]
    Substitution(#[from] SubstituteError),

    #[error("required substitution provider '{name}' not found")]
    MissingProvider { name: String },

    #[error("substitution provider '{name}' has malformed data: {message}")]
    MalformedProvider { name: String, message: String },
}

/// Collect manifest files (`.yaml`/`.yml`) under `unit_path` inside the
/// artifact, sorted by path so render order is deterministic.
pub fn collect_manifest_files(
    artifact_path: &Path,
    unit_path: &str,
) -> Result<Vec<PathBuf>, RenderError> {
    // "." and "" mean the artifact root
    let full_path = match unit_path.trim_start_matches("./") {
        "" | "." => artifact_path.to_path_buf(),
        trimmed => artifact_path.join(trimmed),
    };

    if !full_path.exists() {
        return Err(RenderError::MissingPath(full_path));
    }

    let mut files: Vec<PathBuf> = WalkDir::new(&full_path)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            matches!(
                e.path().extension().and_then(|s| s.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(RenderError::EmptyManifestSet(full_path));
    }

    Ok(files)
}

/// Split a YAML stream into documents on `---` separator lines.
///
/// A separator must be alone on its line; `---` embedded in a scalar value
/// does not split the stream. Empty documents are dropped.
pub fn split_documents(content: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        if line.trim_end() == "---" {
            if !current.trim().is_empty() {
                documents.push(std::mem::take(&mut current));
            }
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }

    if !current.trim().is_empty() {
        documents.push(current);
    }

    documents
}

/// Parse one YAML document into a [`RenderedObject`].
///
/// Returns `Ok(None)` for comment-only documents. Objects without a
/// namespace inherit `default_namespace` (the owning unit's namespace).
pub fn parse_object(
    document: &str,
    source: &Path,
    default_namespace: &str,
) -> Result<Option<RenderedObject>, RenderError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(document).map_err(|e| RenderError::MalformedManifest {
            path: source.to_path_buf(),
            message: e.to_string(),
        })?;

    if value.is_null() {
        return Ok(None);
    }

    let mut manifest: serde_json::Value =
        serde_json::to_value(&value).map_err(|e| RenderError::MalformedManifest {
            path: source.to_path_buf(),
            message: e.to_string(),
        })?;

    let kind = manifest
        .get("kind")
        .and_then(|k| k.as_str())
        .ok_or_else(|| RenderError::MissingField {
            path: source.to_path_buf(),
            field: "kind".to_string(),
        })?
        .to_string();

    let name = manifest
        .pointer("/metadata/name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| RenderError::MissingField {
            path: source.to_path_buf(),
            field: "metadata.name".to_string(),
        })?
        .to_string();

    let namespace = manifest
        .pointer("/metadata/namespace")
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| default_namespace.to_string());

    // Record the resolved namespace back into the manifest so the stored
    // object matches its identity
    if let Some(metadata) = manifest.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        metadata
            .entry("namespace")
            .or_insert_with(|| serde_json::Value::String(namespace.clone()));
    }

    debug!(kind = %kind, name = %name, namespace = %namespace, "parsed manifest document");

    Ok(Some(RenderedObject {
        reference: ObjectRef::new(&kind, &name, Some(&namespace)),
        manifest,
    }))
}

/// Read one manifest file, failing with a render error on I/O problems.
pub fn read_manifest_file(path: &Path) -> Result<String, RenderError> {
    std::fs::read_to_string(path).map_err(|e| RenderError::Unreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_documents_on_separator_lines() {
        let stream = "a: 1\n---\nb: 2\n---\nc: 3\n";
        let docs = split_documents(stream);
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].trim(), "a: 1");
        assert_eq!(docs[2].trim(), "c: 3");
    }

    #[test]
    fn test_split_documents_ignores_embedded_separator() {
        let stream = "a: \"x --- y\"\nb: 2\n";
        let docs = split_documents(stream);
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn test_split_documents_drops_empty() {
        let stream = "---\n---\na: 1\n---\n";
        assert_eq!(split_documents(stream).len(), 1);
    }

    #[test]
    fn test_parse_object_extracts_identity() {
        let doc = "kind: ConfigMap\nmetadata:\n  name: app-config\n";
        let object = parse_object(doc, Path::new("test.yaml"), "team-a")
            .unwrap()
            .unwrap();
        assert_eq!(object.reference.kind, "ConfigMap");
        assert_eq!(object.reference.name, "app-config");
        assert_eq!(object.reference.namespace.as_deref(), Some("team-a"));
        // The inherited namespace is recorded on the manifest itself
        assert_eq!(
            object.manifest.pointer("/metadata/namespace").and_then(|v| v.as_str()),
            Some("team-a")
        );
    }

    #[test]
    fn test_parse_object_keeps_explicit_namespace() {
        let doc = "kind: ConfigMap\nmetadata:\n  name: app-config\n  namespace: team-b\n";
        let object = parse_object(doc, Path::new("test.yaml"), "team-a")
            .unwrap()
            .unwrap();
        assert_eq!(object.reference.namespace.as_deref(), Some("team-b"));
    }

    #[test]
    fn test_parse_object_missing_kind() {
        let doc = "metadata:\n  name: app-config\n";
        let err = parse_object(doc, Path::new("test.yaml"), "default").unwrap_err();
        assert!(matches!(err, RenderError::MissingField { field, .. } if field == "kind"));
    }

    #[test]
    fn test_parse_object_empty_document() {
        assert!(parse_object("# nothing here\n", Path::new("t.yaml"), "default")
            .unwrap()
            .is_none());
    }
}
