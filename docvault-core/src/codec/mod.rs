//! Format codecs turn persisted representations into document content.
//!
//! A codec works on one of two shapes: a flat byte stream (a single file) or
//! a package (a directory treated as one item, given as relative paths mapped
//! to bytes). The document core only ever talks to [`FormatCodec`].

use anyhow::Result;
use bytes::Bytes;
use std::collections::BTreeMap;

use crate::token::AttributeSet;

pub mod text;

pub use text::{JsonCodec, PlainTextCodec};

/// Raw persisted form of a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Representation {
    Flat(Bytes),
    /// Relative `/`-separated paths to file contents.
    Package(BTreeMap<String, Bytes>),
}

impl Representation {
    pub fn flat(bytes: impl Into<Bytes>) -> Self {
        Representation::Flat(bytes.into())
    }

    pub fn is_package(&self) -> bool {
        matches!(self, Representation::Package(_))
    }

    /// Flat bytes, or an error naming the unexpected package shape.
    pub fn into_flat(self) -> Result<Bytes> {
        match self {
            Representation::Flat(bytes) => Ok(bytes),
            Representation::Package(_) => anyhow::bail!("expected a file, found a package"),
        }
    }

    pub fn into_package(self) -> Result<BTreeMap<String, Bytes>> {
        match self {
            Representation::Package(entries) => Ok(entries),
            Representation::Flat(_) => anyhow::bail!("expected a package, found a file"),
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            Representation::Flat(bytes) => bytes.len(),
            Representation::Package(entries) => entries.values().map(Bytes::len).sum(),
        }
    }
}

/// Format strategy supplied per document kind.
pub trait FormatCodec: Send + Sync + 'static {
    type Content: Send + Sync + 'static;

    /// Type identifier recorded on documents using this codec.
    fn file_type(&self) -> &str;

    /// Extension used when composing save locations.
    fn default_extension(&self) -> &str;

    fn read(&self, representation: Representation) -> Result<Self::Content>;

    fn write(&self, content: &Self::Content) -> Result<Representation>;

    /// Whether writing then re-reading reproduces the in-memory state.
    ///
    /// Lossy formats return `false`; the document then keeps its in-memory
    /// change token after a save.
    fn is_round_trip_consistent(&self) -> bool {
        true
    }

    /// Attributes used to derive persisted change tokens.
    fn token_attributes(&self) -> AttributeSet {
        AttributeSet::default()
    }

    /// Treat changes to items inside a package as changes to the package.
    fn handles_subitem_changes(&self) -> bool {
        false
    }
}
