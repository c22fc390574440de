use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::config::DataDirTemplate;
use crate::domain::{CachedLimsFile, FlowcellId, RunFolderRef};
use crate::error::MetadataError;
use crate::fs_util;
use crate::lims::LimsClient;
use crate::tool::MetadataTool;

pub const METADATA_DIR: &str = "metadata";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportResult {
    pub metadata: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub datadir: DataDirTemplate,
    /// Parent of per-request working directories; system temp dir if unset.
    pub workdir_root: Option<Utf8PathBuf>,
}

pub struct Exporter<L: LimsClient, T: MetadataTool> {
    lims: L,
    tool: T,
    options: ExportOptions,
    locks: RunFolderLocks,
}

impl<L: LimsClient, T: MetadataTool> Exporter<L, T> {
    pub fn new(lims: L, tool: T, options: ExportOptions) -> Self {
        Self {
            lims,
            tool,
            options,
            locks: RunFolderLocks::default(),
        }
    }

    pub fn runfolder_path(&self, target: &RunFolderRef) -> Utf8PathBuf {
        self.options.datadir.resolve(target)
    }

    /// Produces the export files for a run folder.
    ///
    /// LIMS metadata comes from the LIMS service unless `lims_data` names a
    /// previous LIMS export in the run folder's `metadata` directory. All
    /// intermediate files live in a working directory that is removed before
    /// this returns, whatever the outcome.
    pub fn export(
        &self,
        target: &RunFolderRef,
        lims_data: Option<&CachedLimsFile>,
    ) -> Result<ExportResult, MetadataError> {
        let start = Instant::now();
        let result = self.run_pipeline(target, lims_data);
        match &result {
            Ok(export) => info!(
                runfolder = %target,
                files = export.metadata.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "export finished"
            ),
            Err(err) => error!(runfolder = %target, error = %err, "export failed"),
        }
        result
    }

    fn run_pipeline(
        &self,
        target: &RunFolderRef,
        lims_data: Option<&CachedLimsFile>,
    ) -> Result<ExportResult, MetadataError> {
        let runfolder_path = self.runfolder_path(target);
        if !runfolder_path.is_dir() {
            return Err(MetadataError::RunFolderNotFound(
                runfolder_path.into_std_path_buf(),
            ));
        }
        let metadata_export_path = runfolder_path.join(METADATA_DIR);

        let lock = self.locks.get(&runfolder_path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let work_dir = self.create_work_dir()?;
        let work_path = fs_util::utf8_path(work_dir.path().to_path_buf())?;

        let lims_path = match lims_data {
            None => {
                let flowcell = FlowcellId::from_runfolder_path(&runfolder_path)?;
                info!(flowcell = %flowcell, "fetching LIMS metadata");
                self.lims.fetch_metadata(&flowcell, &work_path)?
            }
            Some(cached) => copy_cached_lims(&metadata_export_path, cached, &work_path)?,
        };
        require_output("LIMS fetch", &lims_path)?;

        let (runfolder_extract, lims_extract) = thread::scope(|scope| {
            let runfolder = scope.spawn(|| {
                self.tool
                    .extract_runfolder_metadata(&runfolder_path, &work_path)
            });
            let lims = self
                .tool
                .extract_snpseq_data_metadata(&lims_path, &work_path);
            let runfolder = runfolder.join().map_err(|_| {
                MetadataError::Internal("runfolder extraction panicked".to_string())
            })?;
            Ok::<_, MetadataError>((runfolder?, lims?))
        })?;
        require_output("runfolder extraction", &runfolder_extract)?;
        require_output("snpseq-data extraction", &lims_extract)?;

        let mut metadata = self.tool.export_runfolder_metadata(
            &runfolder_extract,
            &lims_extract,
            &metadata_export_path,
        )?;
        metadata.sort();

        if let Err(err) = work_dir.close() {
            warn!(path = %work_path, error = %err, "failed to remove working directory");
        }
        Ok(ExportResult { metadata })
    }

    fn create_work_dir(&self) -> Result<TempDir, MetadataError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("extract").suffix("runfolder");
        let work_dir = match &self.options.workdir_root {
            Some(root) => {
                fs_util::ensure_dir(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        };
        work_dir.map_err(|err| MetadataError::Filesystem(format!("create working directory: {err}")))
    }
}

fn copy_cached_lims(
    metadata_export_path: &Utf8Path,
    cached: &CachedLimsFile,
    work_path: &Utf8Path,
) -> Result<Utf8PathBuf, MetadataError> {
    let source = metadata_export_path.join(cached.as_str());
    if !source.is_file() {
        return Err(MetadataError::CachedLimsFileNotFound(
            source.into_std_path_buf(),
        ));
    }
    let destination = work_path.join(cached.as_str());
    info!(source = %source, "using cached LIMS metadata");
    fs_util::copy_file(&source, &destination)?;
    Ok(destination)
}

fn require_output(step: &str, path: &Utf8Path) -> Result<(), MetadataError> {
    if path.is_file() {
        return Ok(());
    }
    Err(MetadataError::MissingExpectedOutput {
        step: step.to_string(),
        path: path.to_path_buf().into_std_path_buf(),
    })
}

/// One mutex per run-folder path; exports of the same run folder write to the
/// same metadata directory and must not overlap.
#[derive(Default)]
struct RunFolderLocks {
    inner: Mutex<HashMap<Utf8PathBuf, Arc<Mutex<()>>>>,
}

impl RunFolderLocks {
    fn get(&self, runfolder_path: &Utf8Path) -> Arc<Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(runfolder_path.to_path_buf()).or_default())
    }
}
