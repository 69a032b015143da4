//! Change tokens identify the content state of a document.
//!
//! A persisted token is derived from observable attributes of the item on
//! disk; an in-memory token is minted whenever the in-memory content moves
//! away from what was read or written. Tokens from different attribute sets
//! cannot be compared.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::Path;
use std::time::UNIX_EPOCH;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::TokenError;

/// Item attributes that may participate in a persisted token.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenAttribute {
    ModificationDate,
    Size,
    /// Identity of the on-disk node (device and inode on unix).
    Generation,
}

impl TokenAttribute {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenAttribute::ModificationDate => "ModificationDate",
            TokenAttribute::Size => "Size",
            TokenAttribute::Generation => "Generation",
        }
    }
}

/// A versioned list of attributes used to build persisted tokens.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributeSet {
    identifier: String,
    attributes: Vec<TokenAttribute>,
}

impl AttributeSet {
    pub fn new(identifier: impl Into<String>, attributes: Vec<TokenAttribute>) -> Self {
        let mut attributes = attributes;
        attributes.sort();
        attributes.dedup();
        Self {
            identifier: identifier.into(),
            attributes,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn attributes(&self) -> &[TokenAttribute] {
        &self.attributes
    }
}

impl Default for AttributeSet {
    fn default() -> Self {
        Self::new(
            "default/1",
            vec![
                TokenAttribute::ModificationDate,
                TokenAttribute::Size,
                TokenAttribute::Generation,
            ],
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ChangeToken {
    Persisted {
        attribute_set: String,
        values: BTreeMap<String, String>,
    },
    InMemory {
        id: Uuid,
    },
}

impl ChangeToken {
    /// A fresh token for content that exists only in memory.
    pub fn in_memory() -> Self {
        ChangeToken::InMemory { id: Uuid::new_v4() }
    }

    /// Derive a persisted token from the item at `location` without
    /// coordinating access. Packages aggregate over every contained file.
    pub fn for_location(location: &Path, set: &AttributeSet) -> Result<Self, TokenError> {
        let unavailable = |reason: std::io::Error| TokenError::Unavailable {
            path: location.display().to_string(),
            reason: reason.to_string(),
        };
        let root = std::fs::metadata(location).map_err(unavailable)?;

        let mut modified = modified_nanos(&root);
        let mut size = root.len();
        if root.is_dir() {
            size = 0;
            for entry in WalkDir::new(location).min_depth(1) {
                let entry = entry.map_err(|e| TokenError::Unavailable {
                    path: location.display().to_string(),
                    reason: e.to_string(),
                })?;
                let meta = entry.metadata().map_err(|e| TokenError::Unavailable {
                    path: entry.path().display().to_string(),
                    reason: e.to_string(),
                })?;
                modified = modified.max(modified_nanos(&meta));
                if meta.is_file() {
                    size += meta.len();
                }
            }
        }

        let mut values = BTreeMap::new();
        for attribute in set.attributes() {
            let value = match attribute {
                TokenAttribute::ModificationDate => modified.to_string(),
                TokenAttribute::Size => size.to_string(),
                TokenAttribute::Generation => generation(&root),
            };
            values.insert(attribute.as_str().to_string(), value);
        }
        Ok(ChangeToken::Persisted {
            attribute_set: set.identifier().to_string(),
            values,
        })
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, ChangeToken::Persisted { .. })
    }

    pub fn attribute_set(&self) -> Option<&str> {
        match self {
            ChangeToken::Persisted { attribute_set, .. } => Some(attribute_set),
            ChangeToken::InMemory { .. } => None,
        }
    }

    /// Whether both tokens denote the same content state.
    ///
    /// Persisted tokens built from different attribute sets fail instead of
    /// reporting `false`.
    pub fn matches(&self, other: &ChangeToken) -> Result<bool, TokenError> {
        match (self, other) {
            (
                ChangeToken::Persisted {
                    attribute_set: left,
                    values: lv,
                },
                ChangeToken::Persisted {
                    attribute_set: right,
                    values: rv,
                },
            ) => {
                if left != right {
                    return Err(TokenError::IncompatibleVersions {
                        left: left.clone(),
                        right: right.clone(),
                    });
                }
                Ok(lv == rv)
            }
            (ChangeToken::InMemory { id: a }, ChangeToken::InMemory { id: b }) => Ok(a == b),
            _ => Ok(false),
        }
    }
}

impl std::fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeToken::Persisted {
                attribute_set,
                values,
            } => {
                write!(f, "{attribute_set}")?;
                for (attribute, value) in values {
                    write!(f, " {attribute}={value}")?;
                }
                Ok(())
            }
            ChangeToken::InMemory { id } => write!(f, "memory:{id}"),
        }
    }
}

fn modified_nanos(meta: &Metadata) -> u128 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[cfg(unix)]
fn generation(meta: &Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    format!("{}:{}", meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn generation(meta: &Metadata) -> String {
    meta.created()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_set() -> AttributeSet {
        AttributeSet::new(
            "full/1",
            vec![
                TokenAttribute::Size,
                TokenAttribute::ModificationDate,
                TokenAttribute::Generation,
            ],
        )
    }

    #[test]
    fn token_is_deterministic_for_unchanged_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "hello").unwrap();

        let a = ChangeToken::for_location(&path, &full_set()).unwrap();
        let b = ChangeToken::for_location(&path, &full_set()).unwrap();
        assert!(a.matches(&b).unwrap());
    }

    #[test]
    fn token_changes_with_tracked_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "hello").unwrap();
        let before = ChangeToken::for_location(&path, &full_set()).unwrap();

        std::fs::write(&path, "hello, world").unwrap();
        let after = ChangeToken::for_location(&path, &full_set()).unwrap();
        assert!(!before.matches(&after).unwrap());
    }

    #[test]
    fn incompatible_attribute_sets_fail_comparison() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "hello").unwrap();

        let a = ChangeToken::for_location(&path, &AttributeSet::default()).unwrap();
        let b = ChangeToken::for_location(&path, &full_set()).unwrap();
        assert_eq!(
            a.matches(&b),
            Err(TokenError::IncompatibleVersions {
                left: "default/1".to_string(),
                right: "full/1".to_string(),
            })
        );
    }

    #[test]
    fn in_memory_tokens_compare_by_identity() {
        let a = ChangeToken::in_memory();
        let b = ChangeToken::in_memory();
        assert!(a.matches(&a.clone()).unwrap());
        assert!(!a.matches(&b).unwrap());
    }

    #[test]
    fn persisted_never_matches_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "x").unwrap();
        let persisted = ChangeToken::for_location(&path, &AttributeSet::default()).unwrap();
        assert!(!persisted.matches(&ChangeToken::in_memory()).unwrap());
    }

    #[test]
    fn package_size_covers_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("doc.pkg");
        std::fs::create_dir_all(package.join("assets")).unwrap();
        std::fs::write(package.join("index.txt"), "abc").unwrap();
        std::fs::write(package.join("assets/a.bin"), [0u8; 7]).unwrap();

        let set = AttributeSet::new("size/1", vec![TokenAttribute::Size]);
        let token = ChangeToken::for_location(&package, &set).unwrap();
        match token {
            ChangeToken::Persisted { values, .. } => {
                assert_eq!(values.get("Size").map(String::as_str), Some("10"));
            }
            other => panic!("unexpected token {other}"),
        }
    }

    #[test]
    fn tokens_survive_serialization() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "x").unwrap();
        let token = ChangeToken::for_location(&path, &full_set()).unwrap();
        let json = serde_json::to_string(&token).unwrap();
        let back: ChangeToken = serde_json::from_str(&json).unwrap();
        assert!(token.matches(&back).unwrap());
    }

    #[test]
    fn missing_item_has_no_token() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChangeToken::for_location(&dir.path().join("gone"), &AttributeSet::default());
        assert!(matches!(err, Err(TokenError::Unavailable { .. })));
    }
}
