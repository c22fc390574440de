use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info};

use crate::error::MetadataError;
use crate::fs_util;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long output readers may lag behind the tool's exit.
const READER_GRACE: Duration = Duration::from_secs(2);

/// The external metadata conversion tool (`snpseq_metadata`).
///
/// Every operation creates `outdir` before running and returns the path(s)
/// the tool is expected to write there. Implementations do not check that the
/// files actually exist; callers do.
pub trait MetadataTool: Send + Sync {
    fn extract_runfolder_metadata(
        &self,
        runfolder_path: &Utf8Path,
        outdir: &Utf8Path,
    ) -> Result<Utf8PathBuf, MetadataError>;

    fn extract_snpseq_data_metadata(
        &self,
        data_path: &Utf8Path,
        outdir: &Utf8Path,
    ) -> Result<Utf8PathBuf, MetadataError>;

    /// Returns every `.xml` file in `outdir` after the export.
    fn export_runfolder_metadata(
        &self,
        runfolder_extract: &Utf8Path,
        snpseq_data_extract: &Utf8Path,
        outdir: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, MetadataError>;
}

/// `<outdir>/<basename>.ngi.json`
pub fn runfolder_extract_path(runfolder_path: &Utf8Path, outdir: &Utf8Path) -> Utf8PathBuf {
    let name = runfolder_path.file_name().unwrap_or(runfolder_path.as_str());
    outdir.join(format!("{name}.ngi.json"))
}

/// `<outdir>/<basename without last extension>.ngi.json`
pub fn snpseq_data_extract_path(data_path: &Utf8Path, outdir: &Utf8Path) -> Utf8PathBuf {
    let name = data_path.file_name().unwrap_or(data_path.as_str());
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => name,
    };
    outdir.join(format!("{stem}.ngi.json"))
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct MetadataProcessRunner {
    executable: String,
    timeout: Duration,
}

impl MetadataProcessRunner {
    pub fn new(executable: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            timeout,
        }
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// Runs the tool once. A non-zero exit is an error; stdout is logged
    /// either way.
    pub fn run_process(&self, args: &[&str]) -> Result<ProcessOutput, MetadataError> {
        let command = command_line(&self.executable, args);
        let start = Instant::now();
        let mut process = Command::new(&self.executable);
        process
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own group, so a timeout also reaches anything the tool forks.
            process.process_group(0);
        }
        let mut child = process.spawn().map_err(|err| {
            error!(%command, error = %err, "failed to start metadata tool");
            MetadataError::ToolSpawn {
                command: command.clone(),
                message: err.to_string(),
            }
        })?;

        let stdout = child.stdout.take().map(|pipe| spawn_reader(pipe, "stdout"));
        let stderr = child.stderr.take().map(|pipe| spawn_reader(pipe, "stderr"));

        let status = wait_with_timeout(&mut child, self.timeout).map_err(|err| {
            MetadataError::Internal(format!("waiting for `{command}`: {err}"))
        })?;
        let output = ProcessOutput {
            exit_code: status.and_then(|status| status.code()).unwrap_or(-1),
            stdout: collect_reader(stdout),
            stderr: collect_reader(stderr),
        };
        debug!(%command, stdout = %output.stdout, "metadata tool output");

        let Some(status) = status else {
            error!(%command, timeout = ?self.timeout, "metadata tool timed out");
            return Err(MetadataError::ToolTimeout {
                command,
                timeout: self.timeout,
            });
        };
        if !status.success() {
            error!(%command, exit_code = output.exit_code, "metadata tool failed");
            error!(stderr = %output.stderr);
            return Err(MetadataError::ExternalTool {
                command,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        info!(
            %command,
            exit_code = output.exit_code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "metadata tool finished"
        );
        Ok(output)
    }
}

impl MetadataTool for MetadataProcessRunner {
    fn extract_runfolder_metadata(
        &self,
        runfolder_path: &Utf8Path,
        outdir: &Utf8Path,
    ) -> Result<Utf8PathBuf, MetadataError> {
        fs_util::ensure_dir(outdir)?;
        self.run_process(&[
            "extract",
            "runfolder",
            "--outdir",
            outdir.as_str(),
            runfolder_path.as_str(),
            "json",
        ])?;
        Ok(runfolder_extract_path(runfolder_path, outdir))
    }

    fn extract_snpseq_data_metadata(
        &self,
        data_path: &Utf8Path,
        outdir: &Utf8Path,
    ) -> Result<Utf8PathBuf, MetadataError> {
        fs_util::ensure_dir(outdir)?;
        self.run_process(&[
            "extract",
            "snpseq-data",
            "--outdir",
            outdir.as_str(),
            data_path.as_str(),
            "json",
        ])?;
        Ok(snpseq_data_extract_path(data_path, outdir))
    }

    fn export_runfolder_metadata(
        &self,
        runfolder_extract: &Utf8Path,
        snpseq_data_extract: &Utf8Path,
        outdir: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, MetadataError> {
        fs_util::ensure_dir(outdir)?;
        self.run_process(&[
            "export",
            "--outdir",
            outdir.as_str(),
            runfolder_extract.as_str(),
            snpseq_data_extract.as_str(),
            "xml",
        ])?;
        fs_util::files_with_ext(outdir, "xml")
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// `Ok(None)` means the child was killed after `timeout`.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            kill_process_group(child)?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// The child has not been reaped yet, so its pid still names its group.
fn kill_process_group(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        let pgid = child.id() as libc::pid_t;
        // SAFETY: killpg only sends a signal; it touches no memory.
        if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
    }
    child.kill()
}

fn spawn_reader<R: Read + Send + 'static>(
    pipe: R,
    stream: &'static str,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(drain(pipe, stream));
    });
    rx
}

fn drain<R: Read>(mut pipe: R, stream: &'static str) -> String {
    let mut buf = Vec::new();
    if let Err(err) = pipe.read_to_end(&mut buf) {
        debug!(stream, error = %err, "failed to read metadata tool output");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// A pipe still held open by a detached descendant is abandoned after
/// `READER_GRACE`.
fn collect_reader(reader: Option<mpsc::Receiver<String>>) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    match reader.recv_timeout(READER_GRACE) {
        Ok(output) => output,
        Err(err) => {
            debug!(error = %err, "metadata tool output not collected");
            String::new()
        }
    }
}
