//! Collations and collation-aware document identity hashing.
//!
//! The partitioner fingerprints documents so that all writes to one logical
//! document land on one worker. Identities that compare equal under the
//! collection's collation must hash equal, so hashing goes through the same
//! normalization the comparator uses.

use serde_json::Value;
use std::cmp::Ordering;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x1_0000_0001_b3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Collation {
    /// Raw byte comparison. The default for collections with no collation.
    #[default]
    Binary,
    /// ASCII case-insensitive. Only folds `A-Z`; non-ASCII bytes compare
    /// as-is.
    CaseInsensitiveAscii,
}

impl Collation {
    pub fn compare_str(&self, left: &str, right: &str) -> Ordering {
        match self {
            Collation::Binary => left.cmp(right),
            Collation::CaseInsensitiveAscii => {
                let l = left.bytes().map(|b| b.to_ascii_lowercase());
                let r = right.bytes().map(|b| b.to_ascii_lowercase());
                l.cmp(r)
            }
        }
    }

    /// Deterministic 64-bit hash of a document identity. Stable across runs
    /// and platforms; identities equal under this collation hash equal.
    pub fn identity_hash(&self, id: &Value) -> u64 {
        let mut h = FNV_OFFSET;
        hash_value(&mut h, id, *self);
        h
    }

    /// Normalized form of an identity, usable as a storage map key with the
    /// same equality relation as `identity_hash`.
    pub fn identity_key(&self, id: &Value) -> String {
        normalize(id, *self).to_string()
    }
}

fn fold(h: &mut u64, bytes: &[u8]) {
    for &b in bytes {
        *h ^= b as u64;
        *h = h.wrapping_mul(FNV_PRIME);
    }
}

// Type-tagged so that e.g. the string "1" and the number 1 never collide.
fn hash_value(h: &mut u64, v: &Value, collation: Collation) {
    match v {
        Value::Null => fold(h, b"\x00"),
        Value::Bool(b) => fold(h, if *b { b"\x01t" } else { b"\x01f" }),
        Value::Number(n) => {
            fold(h, b"\x02");
            fold(h, n.to_string().as_bytes());
        }
        Value::String(s) => {
            fold(h, b"\x03");
            match collation {
                Collation::Binary => fold(h, s.as_bytes()),
                Collation::CaseInsensitiveAscii => {
                    for b in s.bytes() {
                        fold(h, &[b.to_ascii_lowercase()]);
                    }
                }
            }
        }
        Value::Array(items) => {
            fold(h, b"\x04");
            for item in items {
                hash_value(h, item, collation);
            }
            fold(h, b"\x05");
        }
        Value::Object(map) => {
            // serde_json maps iterate in sorted key order, so structurally
            // equal objects hash equal regardless of construction order.
            fold(h, b"\x06");
            for (k, v) in map {
                fold(h, k.as_bytes());
                fold(h, b"\x07");
                hash_value(h, v, collation);
            }
            fold(h, b"\x08");
        }
    }
}

fn normalize(v: &Value, collation: Collation) -> Value {
    match (v, collation) {
        (Value::String(s), Collation::CaseInsensitiveAscii) => {
            Value::String(s.to_ascii_lowercase())
        }
        (Value::Array(items), _) => {
            Value::Array(items.iter().map(|i| normalize(i, collation)).collect())
        }
        (Value::Object(map), _) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize(v, collation)))
                .collect(),
        ),
        (other, _) => other.clone(),
    }
}
