// Shared by several test binaries; each uses a different subset.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::oneshot;

use metadata_service::app::{ExportOptions, Exporter};
use metadata_service::config::DataDirTemplate;
use metadata_service::domain::FlowcellId;
use metadata_service::error::MetadataError;
use metadata_service::fs_util;
use metadata_service::lims::{LimsClient, lims_file_name};
use metadata_service::tool::{MetadataTool, runfolder_extract_path, snpseq_data_extract_path};

pub const HOST: &str = "test_host";
pub const RUNFOLDER: &str = "210415_A00001_0123_BXYZ321XY";
pub const FLOWCELL: &str = "XYZ321XY";

pub fn fixture_path(name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Sorted, de-duplicated project ids mentioned in a LIMS export or extract.
pub fn projects_in(path: &Utf8Path) -> Vec<String> {
    let pattern = Regex::new(r#""project(?:_id)?":\s*"(\w{2}-\d{4})""#).unwrap();
    let content = fs::read_to_string(path).unwrap();
    pattern
        .captures_iter(&content)
        .map(|caps| caps[1].to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Scratch layout: `<root>/data/{host}/{runfolder}` plus a dedicated
/// working-directory root.
pub struct Workspace {
    _temp: TempDir,
    pub root: Utf8PathBuf,
    pub workdir_root: Utf8PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let workdir_root = root.join("work");
        fs::create_dir_all(&workdir_root).unwrap();
        let workspace = Self {
            _temp: temp,
            root,
            workdir_root,
        };
        fs::create_dir_all(workspace.runfolder_path()).unwrap();
        workspace
    }

    pub fn datadir(&self) -> DataDirTemplate {
        DataDirTemplate::new(&format!("{}/data/{{host}}/{{runfolder}}", self.root))
    }

    pub fn runfolder_path(&self) -> Utf8PathBuf {
        self.root.join("data").join(HOST).join(RUNFOLDER)
    }

    /// Creates another run folder next to `RUNFOLDER` on the same host.
    pub fn add_runfolder(&self, name: &str) -> Utf8PathBuf {
        let path = self.root.join("data").join(HOST).join(name);
        fs::create_dir_all(&path).unwrap();
        path
    }

    pub fn metadata_dir(&self) -> Utf8PathBuf {
        self.runfolder_path().join("metadata")
    }

    pub fn options(&self) -> ExportOptions {
        ExportOptions {
            datadir: self.datadir(),
            workdir_root: Some(self.workdir_root.clone()),
        }
    }

    pub fn exporter<L: LimsClient, T: MetadataTool>(&self, lims: L, tool: T) -> Exporter<L, T> {
        Exporter::new(lims, tool, self.options())
    }

    pub fn leftover_workdirs(&self) -> usize {
        fs::read_dir(&self.workdir_root).unwrap().count()
    }

    /// Copies the LIMS fixture into the metadata directory with every
    /// project id reversed (`AB-1234` becomes `BA-4321`), so exports made
    /// from the cache are distinguishable from ones made from the LIMS.
    pub fn write_cached_lims(&self) -> (String, Vec<String>) {
        let name = format!("{FLOWCELL}.lims.json");
        let source = fixture_path(&name);
        let mut content = fs::read_to_string(&source).unwrap();
        let mut tweaked = Vec::new();
        for project in projects_in(&source) {
            let (prefix, number) = project.split_once('-').unwrap();
            let reversed = format!(
                "{}-{}",
                prefix.chars().rev().collect::<String>(),
                number.chars().rev().collect::<String>()
            );
            content = content.replace(&project, &reversed);
            tweaked.push(reversed);
        }
        fs::create_dir_all(self.metadata_dir()).unwrap();
        fs::write(self.metadata_dir().join(&name), content).unwrap();
        tweaked.sort();
        (name, tweaked)
    }

    pub fn expected_xml(&self, projects: &[&str]) -> Vec<Utf8PathBuf> {
        let mut expected = Vec::new();
        for project in projects {
            for kind in ["experiment", "run"] {
                expected.push(self.metadata_dir().join(format!("{project}-{kind}.xml")));
            }
        }
        expected.sort();
        expected
    }
}

/// LIMS client serving `tests/fixtures/<flowcell>.lims.json`.
#[derive(Default)]
pub struct FixtureLims {
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl LimsClient for FixtureLims {
    fn fetch_metadata(
        &self,
        flowcell: &FlowcellId,
        destination_dir: &Utf8Path,
    ) -> Result<Utf8PathBuf, MetadataError> {
        self.calls.lock().unwrap().push(flowcell.to_string());
        let source = fixture_path(&lims_file_name(flowcell));
        if !source.is_file() {
            return Err(MetadataError::UpstreamFetch {
                status: 404,
                url: format!("fixture://{flowcell}"),
                message: "Not Found".to_string(),
            });
        }
        fs_util::ensure_dir(destination_dir)?;
        let destination = destination_dir.join(lims_file_name(flowcell));
        fs_util::copy_file(&source, &destination)?;
        Ok(destination)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Runfolder,
    SnpseqData,
    Export,
}

/// Conversion tool double that follows the real tool's file naming.
///
/// Runfolder extracts come from fixtures, snpseq-data extracts are copies of
/// the LIMS input, and the export writes `<project>-experiment.xml`,
/// `<project>-run.xml` and `<project>.metadata.ena.tsv` per project found in
/// the snpseq-data extract. Run folders without their own fixture share the
/// `RUNFOLDER` extract.
#[derive(Default)]
pub struct FixtureTool {
    pub fail: Option<Step>,
    pub skip_output: Option<Step>,
    pub calls: Arc<Mutex<Vec<Step>>>,
    pub export_delay: Option<Duration>,
    pub export_spans: Arc<Mutex<Vec<ExportSpan>>>,
}

/// When one export step ran, and into which directory.
#[derive(Debug, Clone)]
pub struct ExportSpan {
    pub outdir: Utf8PathBuf,
    pub entered: Instant,
    pub exited: Instant,
}

impl ExportSpan {
    pub fn overlaps(&self, other: &ExportSpan) -> bool {
        self.entered < other.exited && other.entered < self.exited
    }
}

impl FixtureTool {
    pub fn failing(step: Step) -> Self {
        Self {
            fail: Some(step),
            ..Self::default()
        }
    }

    pub fn silent(step: Step) -> Self {
        Self {
            skip_output: Some(step),
            ..Self::default()
        }
    }

    pub fn slow_export(delay: Duration) -> Self {
        Self {
            export_delay: Some(delay),
            ..Self::default()
        }
    }

    fn enter(&self, step: Step) -> Result<bool, MetadataError> {
        self.calls.lock().unwrap().push(step);
        if self.fail == Some(step) {
            return Err(MetadataError::ExternalTool {
                command: format!("snpseq_metadata {step:?}"),
                exit_code: 1,
                stderr: "simulated failure".to_string(),
            });
        }
        Ok(self.skip_output != Some(step))
    }
}

impl MetadataTool for FixtureTool {
    fn extract_runfolder_metadata(
        &self,
        runfolder_path: &Utf8Path,
        outdir: &Utf8Path,
    ) -> Result<Utf8PathBuf, MetadataError> {
        fs_util::ensure_dir(outdir)?;
        let extract = runfolder_extract_path(runfolder_path, outdir);
        if self.enter(Step::Runfolder)? {
            let mut fixture = fixture_path(extract.file_name().unwrap());
            if !fixture.is_file() {
                fixture = fixture_path(&format!("{RUNFOLDER}.ngi.json"));
            }
            fs_util::copy_file(&fixture, &extract)?;
        }
        Ok(extract)
    }

    fn extract_snpseq_data_metadata(
        &self,
        data_path: &Utf8Path,
        outdir: &Utf8Path,
    ) -> Result<Utf8PathBuf, MetadataError> {
        fs_util::ensure_dir(outdir)?;
        let extract = snpseq_data_extract_path(data_path, outdir);
        if self.enter(Step::SnpseqData)? {
            fs_util::copy_file(data_path, &extract)?;
        }
        Ok(extract)
    }

    fn export_runfolder_metadata(
        &self,
        runfolder_extract: &Utf8Path,
        snpseq_data_extract: &Utf8Path,
        outdir: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, MetadataError> {
        fs_util::ensure_dir(outdir)?;
        let entered = Instant::now();
        if let Some(delay) = self.export_delay {
            thread::sleep(delay);
        }
        if self.enter(Step::Export)? {
            let run = fs::read_to_string(runfolder_extract).unwrap();
            for project in projects_in(snpseq_data_extract) {
                fs::write(
                    outdir.join(format!("{project}-experiment.xml")),
                    format!("<EXPERIMENT_SET project=\"{project}\"/>\n"),
                )
                .unwrap();
                fs::write(
                    outdir.join(format!("{project}-run.xml")),
                    format!("<RUN_SET project=\"{project}\">\n{run}</RUN_SET>\n"),
                )
                .unwrap();
                fs::write(
                    outdir.join(format!("{project}.metadata.ena.tsv")),
                    format!("project\t{project}\n"),
                )
                .unwrap();
            }
        }
        self.export_spans.lock().unwrap().push(ExportSpan {
            outdir: outdir.to_path_buf(),
            entered,
            exited: Instant::now(),
        });
        fs_util::files_with_ext(outdir, "xml")
    }
}

#[derive(Debug, Clone)]
pub struct LimsBehavior {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Option<String>,
}

impl Default for LimsBehavior {
    fn default() -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContainersQuery {
    name: String,
}

#[derive(Clone)]
struct MockLimsState {
    behavior: LimsBehavior,
    requests: Arc<Mutex<Vec<String>>>,
}

/// LIMS stand-in serving `/api/containers?name=<flowcell>` from fixtures on a
/// background runtime.
pub struct MockLimsServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockLimsServer {
    pub fn start(behavior: LimsBehavior) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = MockLimsState {
            behavior,
            requests: Arc::clone(&requests),
        };
        let app = Router::new()
            .route("/api/containers", get(containers))
            .with_state(state);

        let (addr_tx, addr_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                addr_tx.send(listener.local_addr().unwrap()).unwrap();
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await
                    .unwrap();
            });
        });
        let addr = addr_rx.recv().unwrap();

        Self {
            addr,
            requests,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockLimsServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

async fn containers(
    State(state): State<MockLimsState>,
    Query(query): Query<ContainersQuery>,
) -> Response {
    state.requests.lock().unwrap().push(query.name.clone());
    let status = StatusCode::from_u16(state.behavior.status).unwrap();
    let body = match &state.behavior.body {
        Some(body) => body.clone(),
        None => match fs::read_to_string(fixture_path(&format!("{}.lims.json", query.name))) {
            Ok(body) => body,
            Err(_) => {
                let body = json!({ "error_message": format!("no container named {}", query.name) });
                return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
            }
        },
    };
    (status, [(header::CONTENT_TYPE, state.behavior.content_type)], body).into_response()
}
