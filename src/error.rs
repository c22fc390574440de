use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MetadataError {
    #[error("invalid run folder name: {0:?}")]
    InvalidRunFolderName(String),

    #[error("invalid host: {0:?}")]
    InvalidHost(String),

    #[error("invalid cached LIMS file name: {0:?}")]
    #[diagnostic(help("lims_data must be a plain file name inside the run folder's metadata directory"))]
    InvalidCachedLimsFilename(String),

    #[error("run folder not found: {}", .0.display())]
    RunFolderNotFound(PathBuf),

    #[error("LIMS request to {url} failed with status {status}: {message}")]
    UpstreamFetch {
        status: u16,
        url: String,
        message: String,
    },

    #[error("LIMS request to {url} failed: {message}")]
    UpstreamHttp { url: String, message: String },

    #[error("cached LIMS file not found: {}", .0.display())]
    CachedLimsFileNotFound(PathBuf),

    #[error("`{command}` exited with exit code {exit_code}: {stderr}")]
    ExternalTool {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("failed to start `{command}`: {message}")]
    #[diagnostic(help("check that snpseq_metadata_executable points to an executable file"))]
    ToolSpawn { command: String, message: String },

    #[error("`{command}` did not finish within {timeout:?}")]
    ToolTimeout { command: String, timeout: Duration },

    #[error("{step} reported success but did not produce {}", path.display())]
    MissingExpectedOutput { step: String, path: PathBuf },

    #[error("failed to read config file at {}", .0.display())]
    ConfigRead(PathBuf),

    #[error("failed to parse config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("{0}")]
    Internal(String),
}

impl MetadataError {
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            MetadataError::InvalidRunFolderName(_)
                | MetadataError::InvalidHost(_)
                | MetadataError::InvalidCachedLimsFilename(_)
        )
    }
}
