//! # Source Tracking
//!
//! Tracks the resolved revision of each declared upstream artifact source
//! and broadcasts change events. Revision changes are the primary trigger
//! for dependent units, alongside per-unit timers.
//!
//! Fetching is an external boundary ([`ArtifactFetcher`]); the crate ships a
//! filesystem fetcher whose revision is a SHA-256 digest over the artifact
//! tree, so any content change is a revision change.

use crate::unit::Metadata;
use crate::validation::{parse_duration, validate_duration_interval, validate_name};
use crate::{constants, unit::ConfigurationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Kinds of upstream artifact sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum SourceKind {
    GitRepository,
    OciRepository,
    HelmRepository,
}

impl SourceKind {
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "GitRepository" => Some(Self::GitRepository),
            "OciRepository" => Some(Self::OciRepository),
            "HelmRepository" => Some(Self::HelmRepository),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GitRepository => "GitRepository",
            Self::OciRepository => "OciRepository",
            Self::HelmRepository => "HelmRepository",
        }
    }
}

/// Identity of a declared source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId {
    pub kind: SourceKind,
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind.as_str(), self.namespace, self.name)
    }
}

/// Raw source declaration spec, as it appears in YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Artifact origin. The filesystem fetcher treats this as a local path
    /// (an optional `file://` prefix is stripped).
    pub url: String,
    #[serde(default)]
    pub interval: Option<String>,
}

/// A full source declaration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: SourceSpec,
}

/// A validated source declaration.
#[derive(Debug, Clone)]
pub struct SourceDecl {
    pub id: SourceId,
    pub declaration_index: usize,
    pub url: String,
    pub interval: Duration,
}

impl SourceDecl {
    pub fn from_manifest(
        manifest: SourceManifest,
        declaration_index: usize,
    ) -> Result<Self, ConfigurationError> {
        let kind = SourceKind::from_kind(&manifest.kind).ok_or_else(|| {
            ConfigurationError::MalformedDeclaration {
                path: PathBuf::new(),
                message: format!("unrecognized source kind '{}'", manifest.kind),
            }
        })?;

        let namespace = manifest
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let id = SourceId {
            kind,
            name: manifest.metadata.name.clone(),
            namespace,
        };

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
            constants::MIN_SOURCE_POLL_INTERVAL_SECS,
        )
        .map_err(|e| invalid(e.to_string()))?;
        let interval = parse_duration(interval_str).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            id,
            declaration_index,
            url: manifest.spec.url,
            interval,
        })
    }
}

/// Errors from the source boundary. Unit-local: recorded on units that
/// render from the failing source, retried per policy.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("failed to fetch source '{source_id}': {message}")]
    FetchFailed { source_id: SourceId, message: String },

    #[error("no artifact available yet for source '{0}'")]
    NotYetFetched(SourceId),
}

/// A fetched source artifact: resolved revision plus local path.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub revision: String,
    pub path: PathBuf,
    pub fetched_at: chrono::DateTime<chrono::Utc>,
}

/// External source boundary: resolve a declaration to a local artifact.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceDecl) -> Result<Artifact, SourceError>;
}

/// Fetcher for artifacts already on the local filesystem (a checked-out
/// repository, an unpacked OCI artifact). Revision is a digest over the
/// sorted file tree: path and contents both feed the hash.
#[derive(Debug, Default)]
pub struct FilesystemFetcher;

impl FilesystemFetcher {
    pub fn new() -> Self {
        Self
    }

    fn digest_tree(root: &std::path::Path) -> Result<String, std::io::Error> {
        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect();
        files.sort();

        let mut hasher = Sha256::new();
        for file in files {
            let relative = file.strip_prefix(root).unwrap_or(&file);
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(std::fs::read(&file)?);
            hasher.update([0u8]);
        }

        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Ok(format!("sha256:{hex}"))
    }
}

#[async_trait]
impl ArtifactFetcher for FilesystemFetcher {
    async fn fetch(&self, source: &SourceDecl) -> Result<Artifact, SourceError> {
        let path = PathBuf::from(source.url.trim_start_matches("file://"));

        if !path.exists() {
            return Err(SourceError::FetchFailed {
                source_id: source.id.clone(),
                message: format!("artifact path does not exist: {}", path.display()),
            });
        }

        let revision =
            Self::digest_tree(&path).map_err(|e| SourceError::FetchFailed {
                source_id: source.id.clone(),
                message: e.to_string(),
            })?;

        Ok(Artifact {
            revision,
            path,
            fetched_at: chrono::Utc::now(),
        })
    }
}

/// Revision-change event broadcast to unit tasks.
#[derive(Debug, Clone)]
pub struct SourceEvent {
    pub source: SourceId,
    pub revision: String,
}

/// Tracks current artifacts per source and broadcasts revision changes.
#[derive(Debug)]
pub struct SourceTracker {
    artifacts: RwLock<HashMap<SourceId, Artifact>>,
    events: broadcast::Sender<SourceEvent>,
}

impl Default for SourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            artifacts: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    /// Latest fetched artifact for a source, if any.
    pub async fn current(&self, id: &SourceId) -> Option<Artifact> {
        self.artifacts.read().await.get(id).cloned()
    }

    /// Fetch once and record the result. Returns the change event when the
    /// revision moved (including the very first fetch).
    pub async fn poll_once(
        &self,
        decl: &SourceDecl,
        fetcher: &dyn ArtifactFetcher,
    ) -> Result<Option<SourceEvent>, SourceError> {
        let artifact = fetcher.fetch(decl).await?;
        let revision = artifact.revision.clone();

        let changed = {
            let mut artifacts = self.artifacts.write().await;
            let changed = artifacts
                .get(&decl.id)
                .map(|previous| previous.revision != revision)
                .unwrap_or(true);
            artifacts.insert(decl.id.clone(), artifact);
            changed
        };

        if !changed {
            return Ok(None);
        }

        let event = SourceEvent {
            source: decl.id.clone(),
            revision,
        };
        // Send fails only when no unit task is listening yet; the artifact
        // map already has the revision, so nothing is lost
        let _ = self.events.send(event.clone());
        Ok(Some(event))
    }

    /// Spawn the polling task for one source. Runs until shutdown flips.
    pub fn spawn(
        self: &Arc<Self>,
        decl: SourceDecl,
        fetcher: Arc<dyn ArtifactFetcher>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);

        tokio::spawn(async move {
            info!(source = %decl.id, interval = ?decl.interval, "source tracking started");

            loop {
                match tracker.poll_once(&decl, fetcher.as_ref()).await {
                    Ok(Some(event)) => {
                        info!(source = %event.source, revision = %event.revision, "source revision changed");
                    }
                    Ok(None) => {
                        debug!(source = %decl.id, "source unchanged");
                    }
                    Err(e) => {
                        warn!(source = %decl.id, "source fetch failed: {e}");
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(decl.interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!(source = %decl.id, "source tracking stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(url: &str) -> SourceDecl {
        SourceDecl {
            id: SourceId {
                kind: SourceKind::GitRepository,
                name: "repo".to_string(),
                namespace: "default".to_string(),
            },
            declaration_index: 0,
            url: url.to_string(),
            interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_first_poll_emits_event() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "kind: ConfigMap\n").unwrap();

        let tracker = SourceTracker::new();
        let fetcher = FilesystemFetcher::new();
        let source = decl(dir.path().to_str().unwrap());

        let event = tracker.poll_once(&source, &fetcher).await.unwrap();
        assert!(event.is_some());
        assert!(tracker.current(&source.id).await.is_some());
    }

    #[tokio::test]
    async fn test_unchanged_tree_is_quiet_changed_tree_fires() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "kind: ConfigMap\n").unwrap();

        let tracker = SourceTracker::new();
        let fetcher = FilesystemFetcher::new();
        let source = decl(dir.path().to_str().unwrap());

        let first = tracker.poll_once(&source, &fetcher).await.unwrap().unwrap();
        assert!(tracker.poll_once(&source, &fetcher).await.unwrap().is_none());

        std::fs::write(dir.path().join("a.yaml"), "kind: Secret\n").unwrap();
        let second = tracker.poll_once(&source, &fetcher).await.unwrap().unwrap();
        assert_ne!(first.revision, second.revision);
    }

    #[tokio::test]
    async fn test_missing_path_is_fetch_error() {
        let tracker = SourceTracker::new();
        let fetcher = FilesystemFetcher::new();
        let source = decl("/nonexistent/artifact/root");

        let err = tracker.poll_once(&source, &fetcher).await.unwrap_err();
        assert!(matches!(err, SourceError::FetchFailed { .. }));
    }

    #[test]
    fn test_source_kind_parsing() {
        assert_eq!(
            SourceKind::from_kind("GitRepository"),
            Some(SourceKind::GitRepository)
        );
        assert_eq!(
            SourceKind::from_kind("HelmRepository"),
            Some(SourceKind::HelmRepository)
        );
        assert_eq!(SourceKind::from_kind("Kustomization"), None);
    }
}
