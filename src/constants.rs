//! # Constants
//!
//! Shared constants used throughout the engine.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default reconcile interval applied when a unit declares none
pub const DEFAULT_RECONCILE_INTERVAL: &str = "10m";

/// Default retry interval applied when a unit declares none
pub const DEFAULT_RETRY_INTERVAL: &str = "1m";

/// Default per-pass timeout applied when a unit declares none
pub const DEFAULT_TIMEOUT: &str = "5m";

/// Default bounded retry budget for upgrade-path failures
pub const DEFAULT_UPGRADE_RETRIES: u32 = 3;

/// Sub-interval between health-check polls while a unit awaits readiness (seconds)
pub const HEALTH_POLL_INTERVAL_SECS: u64 = 2;

/// Minimum reconcile interval (seconds)
/// Shorter intervals would hammer the source and store boundaries
pub const MIN_RECONCILE_INTERVAL_SECS: u64 = 60;

/// Minimum source poll interval (seconds)
pub const MIN_SOURCE_POLL_INTERVAL_SECS: u64 = 60;

/// Default sealed-field pattern: the SOPS creation-rule convention for
/// Kubernetes Secret documents. Process-wide, overridable by flag.
pub const DEFAULT_SEALED_FIELD_PATTERN: &str = "^(data|stringData)$";

/// Metadata label that opts a unit into variable substitution
pub const SUBSTITUTE_LABEL: &str = "gitops.microscaler.io/substitute";

/// Value of [`SUBSTITUTE_LABEL`] that enables substitution
pub const SUBSTITUTE_ENABLED: &str = "enabled";
