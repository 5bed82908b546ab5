use crate::format::OutputFormat;
use crate::transform::TransformSpec;
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex digest identifying one (transform, scale, cast, URL) combination.
/// Doubles as the base name of the stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(
        transform: &TransformSpec,
        scale: u8,
        cast: Option<&str>,
        requested_url: &str,
    ) -> Self {
        let cast_segment = cast
            .map(|cast| format!("{}/", canonical_cast(cast)))
            .unwrap_or_default();
        let material = format!(
            "{}/{scale}/{cast_segment}{requested_url}",
            transform.canonical()
        );
        Self(sha256_hex(material.as_bytes()))
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn object_name(&self, extension: &str) -> String {
        format!("{}.{extension}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical_cast(cast: &str) -> String {
    match OutputFormat::from_extension(cast) {
        Some(format) => format.extension().to_string(),
        None => cast.to_ascii_lowercase(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
