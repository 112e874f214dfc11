use std::fmt;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{HASH_DOMAIN, MAX_CONTENT_BYTES};
use crate::error::{Result, SpineError};
use crate::rights::RightsClass;

type HmacSha256 = Hmac<Sha256>;

/// One immutable record of the ledger.
///
/// `entry_hash` covers `{content, author_rights, timestamp, previous_hash}`;
/// `sequence_number` is bound by position and checked separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub sequence_number: u64,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub content: String,
    pub author_rights: RightsClass,
    pub previous_hash: String,
    pub entry_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl MemoryEntry {
    /// Build a new entry linked to `previous_hash`, hashing and optionally signing it.
    pub fn seal(
        sequence_number: u64,
        timestamp: u64,
        content: &str,
        author_rights: RightsClass,
        previous_hash: &str,
        signer: Option<&EntrySigner>,
    ) -> Self {
        let entry_hash = compute_entry_hash(content, author_rights, timestamp, previous_hash);
        let signature = signer.map(|s| s.sign(&entry_hash));
        Self {
            sequence_number,
            timestamp,
            content: content.to_string(),
            author_rights,
            previous_hash: previous_hash.to_string(),
            entry_hash,
            signature,
        }
    }

    /// Hash recomputed from the entry's stated fields.
    pub fn recompute_hash(&self) -> String {
        compute_entry_hash(
            &self.content,
            self.author_rights,
            self.timestamp,
            &self.previous_hash,
        )
    }
}

/// Deterministic SHA-256 over the hashed fields, hex encoded.
///
/// Each field is length-prefixed so no two field tuples share an encoding.
pub fn compute_entry_hash(
    content: &str,
    author_rights: RightsClass,
    timestamp: u64,
    previous_hash: &str,
) -> String {
    let ts = timestamp.to_be_bytes();
    let fields: [&[u8]; 4] = [
        content.as_bytes(),
        author_rights.as_str().as_bytes(),
        &ts,
        previous_hash.as_bytes(),
    ];

    let mut hasher = Sha256::new();
    hasher.update(HASH_DOMAIN.as_bytes());
    for field in fields {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    hex::encode(hasher.finalize())
}

/// Reject malformed content before it is hashed.
pub fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(SpineError::validation("content is empty"));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(SpineError::validation(format!(
            "content is {} bytes, limit is {MAX_CONTENT_BYTES}",
            content.len()
        )));
    }
    if content.contains('\0') {
        return Err(SpineError::validation("content contains a NUL byte"));
    }
    Ok(())
}

/// HMAC-SHA256 signer proving an entry was sealed by a holder of the ledger key.
#[derive(Clone)]
pub struct EntrySigner {
    mac: HmacSha256,
}

impl EntrySigner {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(SpineError::validation("signing key is empty"));
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| SpineError::validation(format!("signing key rejected: {e}")))?;
        Ok(Self { mac })
    }

    pub fn sign(&self, entry_hash: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(entry_hash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of `signature` against `entry_hash`.
    pub fn verify(&self, entry_hash: &str, signature: &str) -> bool {
        let Ok(bytes) = hex::decode(signature) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(entry_hash.as_bytes());
        mac.verify_slice(&bytes).is_ok()
    }
}

impl fmt::Debug for EntrySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EntrySigner(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::GENESIS_HASH;

    fn entry() -> MemoryEntry {
        MemoryEntry::seal(0, 1_700_000_000_000, "hello", RightsClass::Agent, GENESIS_HASH, None)
    }

    #[test]
    fn test_hash_is_deterministic_hex() {
        let a = entry();
        let b = entry();
        assert_eq!(a.entry_hash, b.entry_hash);
        assert_eq!(a.entry_hash.len(), 64);
        assert!(a.entry_hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.recompute_hash(), a.entry_hash);
    }

    #[test]
    fn test_every_hashed_field_matters() {
        let base = entry();
        let variants = [
            compute_entry_hash("hellp", base.author_rights, base.timestamp, &base.previous_hash),
            compute_entry_hash(&base.content, RightsClass::System, base.timestamp, &base.previous_hash),
            compute_entry_hash(&base.content, base.author_rights, base.timestamp + 1, &base.previous_hash),
            compute_entry_hash(&base.content, base.author_rights, base.timestamp, "1"),
        ];
        for hash in variants {
            assert_ne!(hash, base.entry_hash);
        }
    }

    #[test]
    fn test_length_prefix_prevents_field_shifting() {
        let a = compute_entry_hash("ab", RightsClass::Agent, 1, "c");
        let b = compute_entry_hash("a", RightsClass::Agent, 1, "bc");
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate_content() {
        assert!(validate_content("hello").is_ok());
        assert!(validate_content("   ").is_err());
        assert!(validate_content("a\0b").is_err());
        assert!(validate_content(&"x".repeat(MAX_CONTENT_BYTES + 1)).is_err());
    }

    #[test]
    fn test_signature_roundtrip_and_rejection() {
        let signer = EntrySigner::new(b"ledger-key").unwrap();
        let sealed = MemoryEntry::seal(0, 5, "hi", RightsClass::Agent, GENESIS_HASH, Some(&signer));
        let sig = sealed.signature.clone().unwrap();
        assert!(signer.verify(&sealed.entry_hash, &sig));
        assert!(!signer.verify(&entry().entry_hash, &sig));
        assert!(!signer.verify(&sealed.entry_hash, "not-hex"));

        let other = EntrySigner::new(b"other-key").unwrap();
        assert!(!other.verify(&sealed.entry_hash, &sig));
    }

    #[test]
    fn test_empty_signing_key_rejected() {
        assert!(EntrySigner::new(b"").is_err());
    }

    #[test]
    fn test_serde_omits_missing_signature() {
        let json = serde_json::to_string(&entry()).unwrap();
        assert!(!json.contains("signature"));
        assert!(json.contains("\"author_rights\":\"agent\""));
        let back: MemoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry());
    }
}
