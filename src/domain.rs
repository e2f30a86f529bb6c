use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::UploadError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalRunId(String);

impl LocalRunId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for LocalRunId {
    fn from(value: Uuid) -> Self {
        Self(value.hyphenated().to_string())
    }
}

impl FromStr for LocalRunId {
    type Err = UploadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if normalized.is_empty() {
            return Err(UploadError::ConfigInvalid("empty local run id".to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDescriptor {
    pub owner: String,
    pub id: LocalRunId,
    pub name: String,
    pub flowcell: String,
    pub kit: String,
    pub barcode_kit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Fast5,
    Pod5,
}

impl DataFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::Fast5 => "fast5",
            DataFormat::Pod5 => "pod5",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DataFormat {
    type Err = UploadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim_start_matches('.') {
            "fast5" => Ok(DataFormat::Fast5),
            "pod5" => Ok(DataFormat::Pod5),
            other => Err(UploadError::Filesystem(format!(
                "unsupported data format: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

pub const SUPPORTED_WEB_API: VersionInfo = VersionInfo {
    major: 0,
    minor: 2,
    patch: 0,
};

pub const SUPPORTED_FILE_API: VersionInfo = VersionInfo {
    major: 0,
    minor: 1,
    patch: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    UpdateAvailable,
    NewerMinor,
}

impl VersionInfo {
    pub fn check_against(&self, supported: &VersionInfo) -> Result<Compatibility, UploadError> {
        if self.major != supported.major {
            return Err(UploadError::UnsupportedApi {
                remote: self.to_string(),
                supported: supported.to_string(),
            });
        }
        if self.minor > supported.minor {
            return Ok(Compatibility::NewerMinor);
        }
        if self.patch > supported.patch {
            return Ok(Compatibility::UpdateAvailable);
        }
        Ok(Compatibility::Compatible)
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
