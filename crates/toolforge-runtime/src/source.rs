//! Module references and artifact fetching.
//!
//! A load reference is either a bare registry identifier (`json-formatter`)
//! or a fully-qualified location of a compiled `.wasm` artifact
//! (`file:///opt/modules/crc32.wasm`, `https://cdn.example.com/crc32.wasm`).
//! Anything else is rejected up front rather than guessed at.

use sha2::{Digest, Sha256};
use url::Url;

use crate::descriptor::{ModuleDescriptor, ModuleSource};
use crate::error::{ModuleError, Result, SandboxError};

/// A parsed load reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleRef {
    /// Resolved through the registry.
    Id(String),
    /// A `.wasm` artifact fetched directly.
    Location(Url),
}

impl ModuleRef {
    /// Parse a reference.  Unrecognized shapes fail with `LOAD_FAILED`.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();

        if reference.contains("://") {
            let url = Url::parse(reference).map_err(|e| {
                ModuleError::load_failed(reference, format!("invalid module location: {e}"))
            })?;
            if !matches!(url.scheme(), "file" | "http" | "https") {
                return Err(ModuleError::load_failed(
                    reference,
                    format!("unsupported module location scheme '{}'", url.scheme()),
                ));
            }
            if !url.path().ends_with(".wasm") {
                return Err(ModuleError::load_failed(
                    reference,
                    "module location must point to a .wasm artifact",
                ));
            }
            return Ok(Self::Location(url));
        }

        let valid_id = !reference.is_empty()
            && !reference.starts_with('.')
            && reference
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid_id {
            Ok(Self::Id(reference.to_owned()))
        } else {
            Err(ModuleError::load_failed(
                reference,
                format!("unrecognized module reference '{reference}'"),
            ))
        }
    }

    /// The key this reference occupies in the loader's instance table.
    pub fn key(&self) -> String {
        match self {
            Self::Id(id) => id.clone(),
            Self::Location(url) => url.to_string(),
        }
    }
}

/// Synthesize a descriptor for a module loaded directly by location.
///
/// The instance is keyed by the full location so two artifacts with the same
/// file name never collide.
pub fn descriptor_for_location(url: &Url) -> ModuleDescriptor {
    let stem = url
        .path_segments()
        .and_then(|mut segs| segs.next_back())
        .and_then(|file| file.strip_suffix(".wasm"))
        .filter(|s| !s.is_empty())
        .unwrap_or("module")
        .to_owned();

    ModuleDescriptor::new(
        url.to_string(),
        stem,
        "0.0.0",
        "wasm",
        ModuleSource::Wasm {
            location: url.to_string(),
        },
    )
}

/// Fetch artifact bytes from a `file://` or `http(s)://` location.
pub async fn fetch_artifact(location: &str) -> std::result::Result<Vec<u8>, SandboxError> {
    let url = Url::parse(location).map_err(|e| {
        SandboxError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid location '{location}': {e}"),
        ))
    })?;

    match url.scheme() {
        "file" => {
            let path = url.to_file_path().map_err(|()| {
                SandboxError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("not a local path: {location}"),
                ))
            })?;
            let bytes = tokio::fs::read(&path).await?;
            tracing::debug!(path = %path.display(), size_bytes = bytes.len(), "read wasm artifact from disk");
            Ok(bytes)
        }
        "http" | "https" => {
            let response = reqwest::get(url.clone()).await?.error_for_status()?;
            let bytes = response.bytes().await?;
            tracing::debug!(%url, size_bytes = bytes.len(), "downloaded wasm artifact");
            Ok(bytes.to_vec())
        }
        other => Err(SandboxError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("unsupported scheme '{other}'"),
        ))),
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Check `bytes` against an expected checksum (`"<hex>"` or `"sha256:<hex>"`).
/// A missing checksum always passes.
pub fn verify_checksum(
    bytes: &[u8],
    expected: Option<&str>,
) -> std::result::Result<(), SandboxError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let expected = expected.trim();
    let expected = expected.strip_prefix("sha256:").unwrap_or(expected);
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(SandboxError::ChecksumMismatch {
            expected: expected.to_owned(),
            actual,
        })
    }
}
