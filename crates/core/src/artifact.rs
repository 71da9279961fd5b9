//! Locator of an uploaded report artifact (`scheme://bucket/key`).

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Remote location of a stored artifact; this is what `result_path` holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactUri {
    scheme: String,
    bucket: String,
    key: String,
}

impl ArtifactUri {
    pub fn new(
        scheme: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let uri = Self {
            scheme: scheme.into(),
            bucket: bucket.into(),
            key: key.into(),
        };
        uri.validate()?;
        Ok(uri)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate(&self) -> Result<(), DomainError> {
        let scheme_ok = !self.scheme.is_empty()
            && self
                .scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !scheme_ok {
            return Err(DomainError::validation(format!(
                "invalid artifact scheme: {:?}",
                self.scheme
            )));
        }
        if self.bucket.is_empty() || self.bucket.contains('/') {
            return Err(DomainError::validation(format!(
                "invalid artifact bucket: {:?}",
                self.bucket
            )));
        }
        if self.key.is_empty() || self.key.starts_with('/') {
            return Err(DomainError::validation(format!(
                "invalid artifact key: {:?}",
                self.key
            )));
        }
        Ok(())
    }
}

impl core::fmt::Display for ArtifactUri {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

impl FromStr for ArtifactUri {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| DomainError::validation(format!("artifact uri without scheme: {s}")))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| DomainError::validation(format!("artifact uri without key: {s}")))?;
        Self::new(scheme, bucket, key)
    }
}

impl TryFrom<String> for ArtifactUri {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArtifactUri> for String {
    fn from(value: ArtifactUri) -> Self {
        value.to_string()
    }
}
