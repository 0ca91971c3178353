//! Compact handles for facts and files.
//!
//! Grounded in the "arena+index for facts" design note: components pass
//! around these small copyable handles instead of references into the
//! structural store, so ownership stays local to the store and
//! serialization is trivial.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable integer identity for an indexable file. Survives renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub i64);

/// A build unit: the minimal "semantic world" that owns a file for one
/// language family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(pub i64);

/// Stable 16-byte identifier of a definition, hex-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DefUid(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub i64);

/// Full SHA-256 of LF-normalized bytes, hex-encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let normalized = normalize_crlf(bytes);
    let mut hasher = Sha256::new();
    hasher.update(&normalized);
    hex::encode(hasher.finalize())
}

/// Strip `\r` preceding `\n` so hashing is line-ending agnostic, per the
/// Reconciler's "CRLF normalized only for hashing" guarantee.
pub fn normalize_crlf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\r' && i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
            i += 1;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// `def_uid = trunc_sha256(unit_id | kind | lexical_path | signature_hash |
/// disambiguator, 16 bytes)`.
pub fn compute_def_uid(
    unit_id: UnitId,
    kind: &str,
    lexical_path: &str,
    signature_hash: &str,
    disambiguator: u32,
) -> DefUid {
    let mut hasher = Sha256::new();
    hasher.update(unit_id.0.to_le_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_bytes());
    hasher.update(b"|");
    hasher.update(lexical_path.as_bytes());
    hasher.update(b"|");
    hasher.update(signature_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(disambiguator.to_le_bytes());
    let digest = hasher.finalize();
    DefUid(hex::encode(&digest[..16]))
}

/// Hash of a definition's parameter/return syntax, used as part of `def_uid`
/// and for rename detection in the Semantic-Diff Engine.
pub fn signature_hash(signature_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signature_text.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let bytes = bytes.as_ref();
        let mut s = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_crlf_insensitive() {
        let a = content_hash(b"line one\nline two\n");
        let b = content_hash(b"line one\r\nline two\r\n");
        assert_eq!(a, b);
    }

    #[test]
    fn def_uid_stable_across_identical_inputs() {
        let a = compute_def_uid(UnitId(1), "function", "foo", "abc123", 0);
        let b = compute_def_uid(UnitId(1), "function", "foo", "abc123", 0);
        assert_eq!(a, b);
    }

    #[test]
    fn def_uid_changes_with_signature() {
        let a = compute_def_uid(UnitId(1), "function", "foo", "abc123", 0);
        let b = compute_def_uid(UnitId(1), "function", "foo", "def456", 0);
        assert_ne!(a, b);
    }
}
