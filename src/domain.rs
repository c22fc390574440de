use std::fmt;
use std::str::FromStr;

use camino::{Utf8Component, Utf8Path};
use serde::{Deserialize, Serialize};

use crate::error::MetadataError;

/// Request target: a run folder on a given host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunFolderRef {
    host: String,
    runfolder: String,
}

impl RunFolderRef {
    /// Both values end up inside a filesystem path, so each must be a single
    /// plain path segment.
    pub fn new(host: &str, runfolder: &str) -> Result<Self, MetadataError> {
        if !is_plain_segment(host) {
            return Err(MetadataError::InvalidHost(host.to_string()));
        }
        if !is_plain_segment(runfolder) {
            return Err(MetadataError::InvalidRunFolderName(runfolder.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            runfolder: runfolder.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn runfolder(&self) -> &str {
        &self.runfolder
    }
}

impl fmt::Display for RunFolderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.runfolder)
    }
}

/// Flowcell identifier derived from a run-folder name.
///
/// The id is the last `_`-separated segment of the name with a leading
/// flowcell position letter (`A` or `B`) removed:
/// `210415_A00001_0123_BXYZ321XY` resolves to `XYZ321XY`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowcellId(String);

impl FlowcellId {
    pub fn from_runfolder_path(path: &Utf8Path) -> Result<Self, MetadataError> {
        let name = path
            .file_name()
            .ok_or_else(|| MetadataError::InvalidRunFolderName(path.to_string()))?;
        name.parse()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowcellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FlowcellId {
    type Err = MetadataError;

    fn from_str(runfolder_name: &str) -> Result<Self, Self::Err> {
        let segment = runfolder_name.rsplit('_').next().unwrap_or_default();
        let id = segment
            .strip_prefix(['A', 'B'])
            .unwrap_or(segment);
        if id.is_empty() {
            return Err(MetadataError::InvalidRunFolderName(
                runfolder_name.to_string(),
            ));
        }
        Ok(Self(id.to_string()))
    }
}

/// File name of a LIMS export kept in a run folder's metadata directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLimsFile(String);

impl CachedLimsFile {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CachedLimsFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CachedLimsFile {
    type Err = MetadataError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if !is_plain_segment(value) {
            return Err(MetadataError::InvalidCachedLimsFilename(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }
}

fn is_plain_segment(value: &str) -> bool {
    if value.is_empty() || value.contains(['/', '\\']) {
        return false;
    }
    let mut components = Utf8Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Utf8Component::Normal(_)), None)
    )
}
