use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;

use super::{FormatCodec, Representation};

/// UTF-8 text documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextCodec;

impl FormatCodec for PlainTextCodec {
    type Content = String;

    fn file_type(&self) -> &str {
        "public.plain-text"
    }

    fn default_extension(&self) -> &str {
        "txt"
    }

    fn read(&self, representation: Representation) -> Result<String> {
        let bytes = representation.into_flat()?;
        String::from_utf8(bytes.to_vec()).context("document is not valid UTF-8")
    }

    fn write(&self, content: &String) -> Result<Representation> {
        Ok(Representation::flat(content.clone().into_bytes()))
    }
}

/// Documents holding a single serde value stored as pretty JSON.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FormatCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Content = T;

    fn file_type(&self) -> &str {
        "public.json"
    }

    fn default_extension(&self) -> &str {
        "json"
    }

    fn read(&self, representation: Representation) -> Result<T> {
        let bytes = representation.into_flat()?;
        serde_json::from_slice(&bytes).context("malformed JSON document")
    }

    fn write(&self, content: &T) -> Result<Representation> {
        let bytes = serde_json::to_vec_pretty(content)?;
        Ok(Representation::flat(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn plain_text_rejects_invalid_utf8() {
        let err = PlainTextCodec
            .read(Representation::flat(vec![0xff, 0xfe]))
            .unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn plain_text_rejects_packages() {
        let err = PlainTextCodec
            .read(Representation::Package(Default::default()))
            .unwrap_err();
        assert!(err.to_string().contains("package"));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Outline {
        title: String,
        items: Vec<String>,
    }

    #[test]
    fn json_codec_reads_what_it_writes() {
        let codec = JsonCodec::<Outline>::new();
        let outline = Outline {
            title: "plan".to_string(),
            items: vec!["a".to_string(), "b".to_string()],
        };
        let repr = codec.write(&outline).unwrap();
        assert_eq!(codec.read(repr).unwrap(), outline);
    }

    #[test]
    fn json_codec_reports_malformed_input() {
        let codec = JsonCodec::<Outline>::new();
        let err = codec.read(Representation::flat("{not json")).unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }
}
