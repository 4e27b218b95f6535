//! # Sealed Secrets
//!
//! Just-in-time decryption of sealed document fields. Only top-level fields
//! whose name matches the process-wide sealed-field pattern are treated as
//! ciphertext; every other field passes through untouched. Decryption
//! produces a new document and never mutates its input.
//!
//! Sealed values are `ENC[AGE,data:<base64>]` envelopes wrapping an
//! age-encrypted payload (X25519 recipients). The AEAD inside age provides
//! the integrity check: a tampered envelope or a wrong key fails with a
//! [`DecryptionError`] and never yields partial plaintext.
//!
//! **SECURITY**: plaintext is never persisted to any durable store by this
//! module - callers own retention. Intermediate buffers are zeroized.

use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

static ENVELOPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ENC\[AGE,data:(?P<data>[A-Za-z0-9+/=]+)\]$").expect("envelope regex is valid")
});

/// Decryption failures. Recorded on the unit and retried per policy; a unit
/// with an undecryptable secret never applies a partial configuration.
#[derive(Debug, Error)]
pub enum DecryptionError {
    #[error("no decryption key material configured")]
    MissingKey,

    #[error("key material source '{name}' is unreadable: {message}")]
    UnreadableKey { name: String, message: String },

    #[error("sealed value in field '{field}' is malformed: {message}")]
    MalformedEnvelope { field: String, message: String },

    #[error("no configured key can decrypt field '{field}'")]
    NoMatchingKey { field: String },

    #[error("integrity check failed for field '{field}': {message}")]
    Integrity { field: String, message: String },

    #[error("decrypted value in field '{field}' is not valid UTF-8")]
    NotUtf8 { field: String },
}

/// Named key material source holding one or more X25519 identities.
/// Read-only and shared across all reconcile passes.
pub struct KeySource {
    name: String,
    identities: Vec<age::x25519::Identity>,
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySource")
            .field("name", &self.name)
            .field("identities", &self.identities.len())
            .finish()
    }
}

impl KeySource {
    /// Load identities from an age key file: one `AGE-SECRET-KEY-1...` per
    /// line, `#` comments and blank lines ignored (the `age-keygen` format).
    pub fn from_file(name: &str, path: &Path) -> Result<Self, DecryptionError> {
        let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            DecryptionError::UnreadableKey {
                name: name.to_string(),
                message: e.to_string(),
            }
        })?);

        Self::from_reader(name, contents.as_str())
    }

    /// Parse identities from key-file contents already in memory.
    pub fn from_reader(name: &str, contents: &str) -> Result<Self, DecryptionError> {
        let mut identities = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let identity = age::x25519::Identity::from_str(line).map_err(|e| {
                DecryptionError::UnreadableKey {
                    name: name.to_string(),
                    message: e.to_string(),
                }
            })?;
            identities.push(identity);
        }

        if identities.is_empty() {
            return Err(DecryptionError::UnreadableKey {
                name: name.to_string(),
                message: "no identities found in key material".to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            identities,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Public recipients for the held identities, for sealing tooling.
    pub fn recipients(&self) -> Vec<age::x25519::Recipient> {
        self.identities.iter().map(|i| i.to_public()).collect()
    }
}

/// Check whether a string value is a sealed envelope.
pub fn is_sealed_value(value: &str) -> bool {
    ENVELOPE_RE.is_match(value)
}

/// Check whether a document carries any sealed value under a field matching
/// the sealed-field pattern.
pub fn is_sealed_document(document: &serde_json::Value, pattern: &Regex) -> bool {
    let Some(map) = document.as_object() else {
        return false;
    };

    map.iter()
        .filter(|(field, _)| pattern.is_match(field))
        .any(|(_, value)| subtree_has_sealed_value(value))
}

fn subtree_has_sealed_value(value: &serde_json::Value) -> bool {
    match value {
        // Loose prefix match so malformed envelopes are still routed into
        // decryption, where they fail with a typed error
        serde_json::Value::String(s) => s.starts_with("ENC["),
        serde_json::Value::Object(map) => map.values().any(subtree_has_sealed_value),
        serde_json::Value::Array(items) => items.iter().any(subtree_has_sealed_value),
        _ => false,
    }
}

/// Field-by-field decryptor for sealed documents.
#[derive(Debug)]
pub struct SecretResolver {
    pattern: Regex,
    key: Option<KeySource>,
}

impl SecretResolver {
    pub fn new(pattern: Regex, key: Option<KeySource>) -> Self {
        Self { pattern, key }
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    /// Produce a new document with every sealed value under a matching
    /// top-level field decrypted. The input document is never mutated.
    ///
    /// Decryption is deterministic: the same key material and ciphertext
    /// always yield identical plaintext.
    pub fn decrypt_document(
        &self,
        document: &serde_json::Value,
    ) -> Result<serde_json::Value, DecryptionError> {
        let mut output = document.clone();

        let Some(map) = output.as_object_mut() else {
            return Ok(output);
        };

        for (field, value) in map.iter_mut() {
            if !self.pattern.is_match(field) {
                continue;
            }
            self.decrypt_subtree(field, value)?;
        }

        Ok(output)
    }

    fn decrypt_subtree(
        &self,
        field: &str,
        value: &mut serde_json::Value,
    ) -> Result<(), DecryptionError> {
        match value {
            serde_json::Value::String(s) => {
                if s.starts_with("ENC[") {
                    let plaintext = self.decrypt_value(field, s)?;
                    *s = plaintext;
                }
                Ok(())
            }
            serde_json::Value::Object(map) => {
                for (_, child) in map.iter_mut() {
                    self.decrypt_subtree(field, child)?;
                }
                Ok(())
            }
            serde_json::Value::Array(items) => {
                for child in items.iter_mut() {
                    self.decrypt_subtree(field, child)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Decrypt a single sealed envelope.
    pub fn decrypt_value(&self, field: &str, envelope: &str) -> Result<String, DecryptionError> {
        let key = self.key.as_ref().ok_or(DecryptionError::MissingKey)?;

        let captures =
            ENVELOPE_RE
                .captures(envelope)
                .ok_or_else(|| DecryptionError::MalformedEnvelope {
                    field: field.to_string(),
                    message: "value does not match ENC[AGE,data:...] envelope".to_string(),
                })?;

        let data = captures
            .name("data")
            .ok_or_else(|| DecryptionError::MalformedEnvelope {
                field: field.to_string(),
                message: "envelope has no data segment".to_string(),
            })?
            .as_str();

        let ciphertext =
            general_purpose::STANDARD
                .decode(data)
                .map_err(|e| DecryptionError::MalformedEnvelope {
                    field: field.to_string(),
                    message: format!("invalid base64: {e}"),
                })?;

        let decryptor = match age::Decryptor::new(ciphertext.as_slice()) {
            Ok(age::Decryptor::Recipients(d)) => d,
            Ok(age::Decryptor::Passphrase(_)) => {
                return Err(DecryptionError::MalformedEnvelope {
                    field: field.to_string(),
                    message: "passphrase-encrypted payloads are not supported".to_string(),
                });
            }
            Err(e) => {
                return Err(DecryptionError::MalformedEnvelope {
                    field: field.to_string(),
                    message: e.to_string(),
                });
            }
        };

        let mut reader = decryptor
            .decrypt(key.identities.iter().map(|i| i as &dyn age::Identity))
            .map_err(|e| match e {
                age::DecryptError::NoMatchingKeys => DecryptionError::NoMatchingKey {
                    field: field.to_string(),
                },
                other => DecryptionError::Integrity {
                    field: field.to_string(),
                    message: other.to_string(),
                },
            })?;

        let mut plaintext = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| DecryptionError::Integrity {
                field: field.to_string(),
                message: e.to_string(),
            })?;

        let text = std::str::from_utf8(&plaintext).map_err(|_| DecryptionError::NotUtf8 {
            field: field.to_string(),
        })?;

        debug!(field = %field, key_source = %key.name, "decrypted sealed field");

        Ok(text.to_string())
    }
}

/// Seal a plaintext value into an `ENC[AGE,data:...]` envelope for the given
/// recipients. Used by sealing tooling and tests; the engine itself only
/// decrypts.
pub fn seal_value(
    recipients: &[age::x25519::Recipient],
    plaintext: &str,
) -> Result<String, anyhow::Error> {
    let boxed: Vec<Box<dyn age::Recipient + Send>> = recipients
        .iter()
        .map(|r| Box::new(r.clone()) as Box<dyn age::Recipient + Send>)
        .collect();

    let encryptor = age::Encryptor::with_recipients(boxed)
        .ok_or_else(|| anyhow::anyhow!("at least one recipient is required"))?;

    let mut ciphertext = Vec::new();
    let mut writer = encryptor.wrap_output(&mut ciphertext)?;
    writer.write_all(plaintext.as_bytes())?;
    writer.finish()?;

    Ok(format!(
        "ENC[AGE,data:{}]",
        general_purpose::STANDARD.encode(&ciphertext)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver_with_key() -> (SecretResolver, age::x25519::Recipient) {
        use age::secrecy::ExposeSecret;

        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();
        let key_text = identity.to_string();
        let key = KeySource::from_reader("test-key", key_text.expose_secret()).unwrap();
        let pattern = Regex::new("^(data|stringData)$").unwrap();
        (SecretResolver::new(pattern, Some(key)), recipient)
    }

    #[test]
    fn test_round_trip_is_idempotent() {
        let (resolver, recipient) = resolver_with_key();
        let sealed = seal_value(&[recipient], "s3cr3t").unwrap();
        assert!(is_sealed_value(&sealed));

        let first = resolver.decrypt_value("data", &sealed).unwrap();
        let second = resolver.decrypt_value("data", &sealed).unwrap();
        assert_eq!(first, "s3cr3t");
        // Same key material and ciphertext, byte-identical plaintext
        assert_eq!(first, second);
    }

    #[test]
    fn test_wrong_key_fails_without_partial_plaintext() {
        let (resolver, _) = resolver_with_key();
        let other = age::x25519::Identity::generate().to_public();
        let sealed = seal_value(&[other], "s3cr3t").unwrap();

        let err = resolver.decrypt_value("data", &sealed).unwrap_err();
        assert!(matches!(err, DecryptionError::NoMatchingKey { .. }));
    }

    #[test]
    fn test_tampered_ciphertext_fails_integrity() {
        let (resolver, recipient) = resolver_with_key();
        let sealed = seal_value(&[recipient], "s3cr3t").unwrap();

        // Flip a character inside the base64 payload
        let mut tampered = sealed.clone();
        let idx = tampered.len() - 10;
        let original = tampered.remove(idx);
        let replacement = if original == 'A' { 'B' } else { 'A' };
        tampered.insert(idx, replacement);

        let err = resolver.decrypt_value("data", &tampered).unwrap_err();
        assert!(
            matches!(
                err,
                DecryptionError::Integrity { .. }
                    | DecryptionError::MalformedEnvelope { .. }
                    | DecryptionError::NoMatchingKey { .. }
            ),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn test_missing_key_material() {
        let pattern = Regex::new("^(data|stringData)$").unwrap();
        let resolver = SecretResolver::new(pattern, None);
        let err = resolver.decrypt_value("data", "ENC[AGE,data:aaaa]").unwrap_err();
        assert!(matches!(err, DecryptionError::MissingKey));
    }

    #[test]
    fn test_decrypt_document_leaves_other_fields_untouched() {
        let (resolver, recipient) = resolver_with_key();
        let sealed = seal_value(&[recipient], "hunter2").unwrap();

        let document = json!({
            "kind": "Secret",
            "metadata": {"name": "db-credentials"},
            "data": {"password": sealed},
            "annotations": {"note": "ENC[AGE,data:bm90IHJlYWxseQ==]"}
        });

        let decrypted = resolver.decrypt_document(&document).unwrap();

        assert_eq!(
            decrypted.pointer("/data/password").and_then(|v| v.as_str()),
            Some("hunter2")
        );
        // Fields not matching the pattern pass through even if they look sealed
        assert_eq!(
            decrypted.pointer("/annotations/note").and_then(|v| v.as_str()),
            Some("ENC[AGE,data:bm90IHJlYWxseQ==]")
        );
        // Source document is unchanged
        assert!(document
            .pointer("/data/password")
            .and_then(|v| v.as_str())
            .map(is_sealed_value)
            .unwrap_or(false));
    }

    #[test]
    fn test_is_sealed_document() {
        let pattern = Regex::new("^(data|stringData)$").unwrap();
        let sealed = json!({"data": {"k": "ENC[AGE,data:aaaa]"}});
        let plain = json!({"data": {"k": "plaintext"}});
        let elsewhere = json!({"other": {"k": "ENC[AGE,data:aaaa]"}});

        assert!(is_sealed_document(&sealed, &pattern));
        assert!(!is_sealed_document(&plain, &pattern));
        assert!(!is_sealed_document(&elsewhere, &pattern));
    }

    #[test]
    fn test_malformed_envelope_in_matching_field() {
        let (resolver, _) = resolver_with_key();
        let document = json!({"data": {"k": "ENC[AGE,data:!!not-base64!!]"}});
        let err = resolver.decrypt_document(&document).unwrap_err();
        assert!(matches!(err, DecryptionError::MalformedEnvelope { .. }));
    }
}
