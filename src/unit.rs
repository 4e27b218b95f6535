//! # Reconciliation Units
//!
//! Declarative input for the engine: `Kustomization` documents describing a
//! named, independently reconciled manifest set with its own interval,
//! source reference and dependency edges. Declarations are loaded from a
//! directory of YAML files once at startup, validated, and never re-derived
//! from storage layout at runtime.

use crate::constants;
use crate::render::split_documents;
use crate::source::{SourceDecl, SourceId, SourceKind, SourceManifest};
use crate::validation::{parse_duration, validate_duration_interval, validate_name};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// The declaration kind the engine reconciles.
pub const UNIT_KIND: &str = "Kustomization";

/// Fatal load-time errors. Never retried: the engine refuses to start and no
/// units reconcile.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("declarations path does not exist: {0}")]
    MissingPath(PathBuf),

    #[error("malformed declaration in {path}: {message}")]
    MalformedDeclaration { path: PathBuf, message: String },

    #[error("invalid field on unit '{unit}': {message}")]
    InvalidField { unit: String, message: String },

    #[error("duplicate unit declaration: {0}")]
    DuplicateUnit(UnitId),

    #[error("duplicate source declaration: {0}")]
    DuplicateSource(SourceId),

    #[error("unit '{unit}' depends on undeclared unit '{dependency}'")]
    UnknownDependency { unit: UnitId, dependency: UnitId },

    #[error("unit '{unit}' references undeclared source '{source_id}'")]
    UnknownSource { unit: UnitId, source_id: SourceId },

    #[error("dependency cycle detected: {}", format_cycle(.0))]
    DependencyCycle(Vec<UnitId>),
}

fn format_cycle(cycle: &[UnitId]) -> String {
    let mut parts: Vec<String> = cycle.iter().map(UnitId::to_string).collect();
    if let Some(first) = parts.first().cloned() {
        parts.push(first);
    }
    parts.join(" -> ")
}

/// Identity of a reconciliation unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    pub name: String,
    pub namespace: String,
}

impl UnitId {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Declaration metadata shared by units and sources.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Reference to the source a unit renders from.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_source_kind() -> SourceKind {
    SourceKind::GitRepository
}

/// Reference to another unit this one depends on.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Reference to a live object whose readiness gates the unit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckTarget {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Kind of a substitution provider object in the resource store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ProviderKind {
    ConfigMap,
    Secret,
}

/// Reference to a substitution provider, in override order.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRef {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,
    pub name: String,
    #[serde(default)]
    pub optional: bool,
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::ConfigMap
}

/// Raw declarative spec of a unit, as it appears in YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitSpec {
    /// Path to the rendered manifest set, relative to the source artifact root
    pub path: String,
    pub source_ref: SourceRef,
    #[serde(default)]
    pub depends_on: Vec<DependencyRef>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub retry_interval: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub prune: bool,
    /// Bounded retry budget for upgrade-path failures. Install-path failures
    /// (unit never Ready at any revision) retry without bound.
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub cleanup_on_fail: bool,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default)]
    pub health_checks: Vec<HealthCheckTarget>,
    #[serde(default)]
    pub substitute_from: Vec<ProviderRef>,
}

/// A full unit declaration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: UnitSpec,
}

/// A validated reconciliation unit with parsed intervals and resolved
/// identities. Status fields live in
/// [`UnitStatus`](crate::reconciler::UnitStatus), owned by the reconciler.
#[derive(Debug, Clone)]
pub struct ReconciliationUnit {
    pub id: UnitId,
    /// Position in declaration order; breaks topological-order ties so the
    /// reconcile order is reproducible across runs
    pub declaration_index: usize,
    pub path: String,
    pub source: SourceId,
    pub depends_on: Vec<UnitId>,
    pub interval: Duration,
    pub retry_interval: Duration,
    pub timeout: Duration,
    pub prune: bool,
    pub retries: u32,
    pub cleanup_on_fail: bool,
    pub suspend: bool,
    pub health_checks: Vec<HealthCheckTarget>,
    pub substitute_from: Vec<ProviderRef>,
    pub substitution_enabled: bool,
}

impl ReconciliationUnit {
    /// Validate a raw manifest into a unit.
    pub fn from_manifest(
        manifest: UnitManifest,
        declaration_index: usize,
    ) -> Result<Self, ConfigurationError> {
        let namespace = manifest
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let id = UnitId::new(&manifest.metadata.name, &namespace);

        let invalid = |message: String| ConfigurationError::InvalidField {
            unit: id.to_string(),
            message,
        };

        validate_name(&id.name, "metadata.name").map_err(|e| invalid(e.to_string()))?;
        validate_name(&id.namespace, "metadata.namespace").map_err(|e| invalid(e.to_string()))?;

        let interval_str = manifest
            .spec
            .interval
            .as_deref()
            .unwrap_or(constants::DEFAULT_RECONCILE_INTERVAL);
        validate_duration_interval(
            interval_str,
            "interval",
            constants::MIN_RECONCILE_INTERVAL_SECS,
        )
        .map_err(|e| invalid(e.to_string()))?;
        let interval = parse_duration(interval_str).map_err(|e| invalid(e.to_string()))?;

        let retry_interval = parse_duration(
            manifest
                .spec
                .retry_interval
                .as_deref()
                .unwrap_or(constants::DEFAULT_RETRY_INTERVAL),
        )
        .map_err(|e| invalid(format!("retryInterval: {e}")))?;

        let timeout = parse_duration(
            manifest
                .spec
                .timeout
                .as_deref()
                .unwrap_or(constants::DEFAULT_TIMEOUT),
        )
        .map_err(|e| invalid(format!("timeout: {e}")))?;

        let depends_on = manifest
            .spec
            .depends_on
            .iter()
            .map(|d| UnitId::new(&d.name, d.namespace.as_deref().unwrap_or(&namespace)))
            .collect();

        let source = SourceId {
            kind: manifest.spec.source_ref.kind,
            name: manifest.spec.source_ref.name.clone(),
            namespace: manifest
                .spec
                .source_ref
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.clone()),
        };

        let substitution_enabled = manifest
            .metadata
            .labels
            .get(constants::SUBSTITUTE_LABEL)
            .map(|v| v == constants::SUBSTITUTE_ENABLED)
            .unwrap_or(false);

        Ok(Self {
            id,
            declaration_index,
            path: manifest.spec.path,
            source,
            depends_on,
            interval,
            retry_interval,
            timeout,
            prune: manifest.spec.prune,
            retries: manifest.spec.retries.unwrap_or(constants::DEFAULT_UPGRADE_RETRIES),
            cleanup_on_fail: manifest.spec.cleanup_on_fail,
            suspend: manifest.spec.suspend,
            health_checks: manifest.spec.health_checks,
            substitute_from: manifest.spec.substitute_from,
            substitution_enabled,
        })
    }
}

/// Everything the engine loads at startup.
#[derive(Debug, Default)]
pub struct Declarations {
    pub units: Vec<ReconciliationUnit>,
    pub sources: Vec<SourceDecl>,
}

impl Declarations {
    /// Cross-declaration validation: duplicates, unknown dependencies,
    /// unknown source references. Cycle detection happens when the
    /// dependency graph is built, still before any unit reconciles.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut unit_ids = HashSet::new();
        for unit in &self.units {
            if !unit_ids.insert(unit.id.clone()) {
                return Err(ConfigurationError::DuplicateUnit(unit.id.clone()));
            }
        }

        let mut source_ids = HashSet::new();
        for source in &self.sources {
            if !source_ids.insert(source.id.clone()) {
                return Err(ConfigurationError::DuplicateSource(source.id.clone()));
            }
        }

        for unit in &self.units {
            for dependency in &unit.depends_on {
                if !unit_ids.contains(dependency) {
                    return Err(ConfigurationError::UnknownDependency {
                        unit: unit.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }

            if !source_ids.contains(&unit.source) {
                return Err(ConfigurationError::UnknownSource {
                    unit: unit.id.clone(),
                    source_id: unit.source.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Load unit and source declarations from a directory of YAML files.
///
/// Files are visited in sorted order and documents in file order, which
/// fixes the declaration order used for topological tie-breaking.
pub fn load_declarations(dir: &Path) -> Result<Declarations, ConfigurationError> {
    if !dir.exists() {
        return Err(ConfigurationError::MissingPath(dir.to_path_buf()));
    }

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
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

    let mut declarations = Declarations::default();
    let mut unit_index = 0usize;
    let mut source_index = 0usize;

    for file in files {
        let content = std::fs::read_to_string(&file).map_err(|e| {
            ConfigurationError::MalformedDeclaration {
                path: file.clone(),
                message: e.to_string(),
            }
        })?;

        for document in split_documents(&content) {
            let value: serde_yaml::Value = serde_yaml::from_str(&document).map_err(|e| {
                ConfigurationError::MalformedDeclaration {
                    path: file.clone(),
                    message: e.to_string(),
                }
            })?;

            let Some(kind) = value.get("kind").and_then(|k| k.as_str()) else {
                debug!(path = %file.display(), "skipping document without a kind");
                continue;
            };

            if kind == UNIT_KIND {
                let manifest: UnitManifest = serde_yaml::from_str(&document).map_err(|e| {
                    ConfigurationError::MalformedDeclaration {
                        path: file.clone(),
                        message: e.to_string(),
                    }
                })?;
                declarations
                    .units
                    .push(ReconciliationUnit::from_manifest(manifest, unit_index)?);
                unit_index += 1;
            } else if SourceKind::from_kind(kind).is_some() {
                let manifest: SourceManifest = serde_yaml::from_str(&document).map_err(|e| {
                    ConfigurationError::MalformedDeclaration {
                        path: file.clone(),
                        message: e.to_string(),
                    }
                })?;
                declarations
                    .sources
                    .push(SourceDecl::from_manifest(manifest, source_index)?);
                source_index += 1;
            } else {
                debug!(path = %file.display(), kind = %kind, "skipping unrecognized declaration kind");
            }
        }
    }

    declarations.validate()?;
    Ok(declarations)
}
