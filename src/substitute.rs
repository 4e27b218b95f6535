//! # Variable Substitution
//!
//! Builds the substitution environment for a unit from its ordered provider
//! references and expands `${VAR}` placeholders in rendered manifests.
//!
//! Resolution is a pure function of (unit, ordered provider list): later
//! providers override earlier ones on key collision, `${VAR:=default}` never
//! fails, `${VAR}` without a value fails with
//! [`SubstituteError::MissingRequiredVariable`]. Sensitive provider values
//! are substituted normally but excluded from any diagnostic rendering.

use crate::sealed::{DecryptionError, SecretResolver};
use crate::store::{ObjectRef, ResourceStore};
use crate::unit::{ProviderKind, ReconciliationUnit};
use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};

static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(?P<name>[A-Za-z_][A-Za-z0-9_]*)(?::=(?P<default>[^}]*))?\}")
        .expect("substitution regex is valid")
});

/// Substitution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstituteError {
    #[error("missing required variable '${{{0}}}' and no default provided")]
    MissingRequiredVariable(String),
}

/// Provider loading failures. Mapped into the reconciler's render/decryption
/// error classes by the caller.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("required substitution provider '{name}' not found")]
    Missing { name: String },

    #[error("substitution provider '{name}' has malformed data: {message}")]
    Malformed { name: String, message: String },

    #[error(transparent)]
    Decryption(#[from] DecryptionError),
}

/// A named key/value provider, tagged sensitive when its values must never
/// be logged.
#[derive(Clone)]
pub struct Provider {
    pub name: String,
    pub sensitive: bool,
    pub data: BTreeMap<String, String>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Provider");
        s.field("name", &self.name).field("sensitive", &self.sensitive);
        if self.sensitive {
            s.field("data", &format!("*** {} entries", self.data.len()));
        } else {
            s.field("data", &self.data);
        }
        s.finish()
    }
}

/// Merged substitution environment for one unit.
#[derive(Clone, Default)]
pub struct Environment {
    values: BTreeMap<String, String>,
    sensitive: BTreeSet<String>,
}

// Debug goes through the redacted view so sensitive values cannot leak
// into logs or error messages
impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("values", &self.redacted())
            .finish()
    }
}

impl Environment {
    /// Merge ordered providers, later providers overriding earlier ones on
    /// identical keys. Sensitivity follows the provider that supplied the
    /// winning value.
    pub fn from_providers(providers: &[Provider]) -> Self {
        let mut env = Self::default();

        for provider in providers {
            for (key, value) in &provider.data {
                env.values.insert(key.clone(), value.clone());
                if provider.sensitive {
                    env.sensitive.insert(key.clone());
                } else {
                    env.sensitive.remove(key);
                }
            }
        }

        env
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Diagnostic rendering with sensitive values masked. This is the only
    /// form of the environment that may be logged.
    pub fn redacted(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| {
                if self.sensitive.contains(k) {
                    (k.clone(), "***".to_string())
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }
}

/// Expand `${VAR}` and `${VAR:=default}` placeholders in `input`.
pub fn substitute(input: &str, env: &Environment) -> Result<String, SubstituteError> {
    let mut output = String::with_capacity(input.len());
    let mut last_end = 0;

    for captures in VAR_RE.captures_iter(input) {
        let Some(matched) = captures.get(0) else {
            continue;
        };
        let Some(name) = captures.name("name") else {
            continue;
        };

        output.push_str(&input[last_end..matched.start()]);

        match env.get(name.as_str()) {
            Some(value) => output.push_str(value),
            None => match captures.name("default") {
                Some(default) => output.push_str(default.as_str()),
                None => {
                    return Err(SubstituteError::MissingRequiredVariable(
                        name.as_str().to_string(),
                    ));
                }
            },
        }

        last_end = matched.end();
    }

    output.push_str(&input[last_end..]);
    Ok(output)
}

/// Load a unit's providers from the resource store, in declaration order.
///
/// ConfigMap-like providers contribute `.data` verbatim; Secret-like
/// providers base64-decode `.data` (and take `.stringData` verbatim) and are
/// marked sensitive. Data keys ending in `.env` are parsed as dotenv-format
/// payloads and contribute their contained pairs instead of the key itself.
/// Sealed values inside provider data are decrypted just-in-time.
///
/// Missing optional providers are skipped; missing required providers fail.
pub async fn load_providers(
    unit: &ReconciliationUnit,
    store: &dyn ResourceStore,
    secrets: &SecretResolver,
) -> Result<Vec<Provider>, ProviderError> {
    let mut providers = Vec::with_capacity(unit.substitute_from.len());

    for reference in &unit.substitute_from {
        let kind = match reference.kind {
            ProviderKind::ConfigMap => "ConfigMap",
            ProviderKind::Secret => "Secret",
        };
        let object_ref = ObjectRef::new(kind, &reference.name, Some(&unit.id.namespace));

        let Some(manifest) = store.get(&object_ref).await else {
            if reference.optional {
                debug!(provider = %object_ref, "optional substitution provider absent, skipping");
                continue;
            }
            return Err(ProviderError::Missing {
                name: reference.name.clone(),
            });
        };

        let sensitive = matches!(reference.kind, ProviderKind::Secret);
        let data = extract_provider_data(&reference.name, &manifest, sensitive, secrets)?;

        providers.push(Provider {
            name: reference.name.clone(),
            sensitive,
            data,
        });
    }

    Ok(providers)
}

fn extract_provider_data(
    provider_name: &str,
    manifest: &serde_json::Value,
    base64_encoded: bool,
    secrets: &SecretResolver,
) -> Result<BTreeMap<String, String>, ProviderError> {
    let mut data = BTreeMap::new();

    if let Some(entries) = manifest.get("data").and_then(|d| d.as_object()) {
        for (key, value) in entries {
            let Some(raw) = value.as_str() else {
                return Err(ProviderError::Malformed {
                    name: provider_name.to_string(),
                    message: format!("data key '{key}' is not a string"),
                });
            };

            let decoded = if base64_encoded {
                match general_purpose::STANDARD.decode(raw) {
                    Ok(bytes) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(
                                "Failed to decode provider value for {} as UTF-8: {}",
                                key, e
                            );
                            continue;
                        }
                    },
                    Err(e) => {
                        warn!("Failed to decode base64 provider value for {}: {}", key, e);
                        continue;
                    }
                }
            } else {
                raw.to_string()
            };

            let plaintext = if decoded.starts_with("ENC[") {
                secrets.decrypt_value(key, &decoded)?
            } else {
                decoded
            };

            insert_provider_entry(&mut data, key, &plaintext, provider_name)?;
        }
    }

    // stringData entries are plain text regardless of provider kind
    if let Some(entries) = manifest.get("stringData").and_then(|d| d.as_object()) {
        for (key, value) in entries {
            let Some(raw) = value.as_str() else {
                return Err(ProviderError::Malformed {
                    name: provider_name.to_string(),
                    message: format!("stringData key '{key}' is not a string"),
                });
            };

            let plaintext = if raw.starts_with("ENC[") {
                secrets.decrypt_value(key, raw)?
            } else {
                raw.to_string()
            };

            insert_provider_entry(&mut data, key, &plaintext, provider_name)?;
        }
    }

    Ok(data)
}

/// Keys ending in `.env` carry a dotenv-format payload; their contained
/// pairs are merged instead of the payload key itself.
fn insert_provider_entry(
    data: &mut BTreeMap<String, String>,
    key: &str,
    value: &str,
    provider_name: &str,
) -> Result<(), ProviderError> {
    if key.ends_with(".env") {
        for item in dotenvy::from_read_iter(value.as_bytes()) {
            let (k, v) = item.map_err(|e| ProviderError::Malformed {
                name: provider_name.to_string(),
                message: format!("invalid dotenv payload in '{key}': {e}"),
            })?;
            data.insert(k, v);
        }
    } else {
        data.insert(key.to_string(), value.to_string());
    }

    Ok(())
}
