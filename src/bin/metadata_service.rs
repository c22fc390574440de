use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use metadata_service::app::{ExportOptions, Exporter};
use metadata_service::config::{AppConfig, ConfigLoader};
use metadata_service::domain::{CachedLimsFile, RunFolderRef};
use metadata_service::error::MetadataError;
use metadata_service::fs_util;
use metadata_service::lims::{LimsClient, LimsHttpClient};
use metadata_service::output::JsonOutput;
use metadata_service::server::{self, VersionResponse};
use metadata_service::tool::{MetadataProcessRunner, MetadataTool};

#[derive(Parser)]
#[command(name = "metadata-service")]
#[command(about = "Export sequencing run-folder metadata combined with LIMS data")]
#[command(version, author)]
struct Cli {
    /// Directory holding app.yaml
    #[arg(short = 'c', long, global = true, default_value = "config")]
    configroot: PathBuf,

    /// Overrides snpseq_metadata_executable from the config
    #[arg(long, global = true)]
    executable: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the HTTP service (default)")]
    Serve(ServeArgs),
    #[command(about = "Export metadata for one run folder and print the result")]
    Export(ExportArgs),
    #[command(about = "Print the service version")]
    Version,
}

#[derive(Args, Default)]
struct ServeArgs {
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args)]
struct ExportArgs {
    host: String,
    runfolder: String,

    /// LIMS export in the run folder's metadata directory to use instead of
    /// querying the LIMS
    #[arg(long)]
    lims_data: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<MetadataError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MetadataError) -> u8 {
    match error {
        MetadataError::InvalidRunFolderName(_)
        | MetadataError::InvalidHost(_)
        | MetadataError::InvalidCachedLimsFilename(_)
        | MetadataError::RunFolderNotFound(_)
        | MetadataError::CachedLimsFileNotFound(_)
        | MetadataError::ConfigRead(_)
        | MetadataError::ConfigParse(_) => 2,
        MetadataError::UpstreamFetch { .. }
        | MetadataError::UpstreamHttp { .. }
        | MetadataError::ExternalTool { .. }
        | MetadataError::ToolSpawn { .. }
        | MetadataError::ToolTimeout { .. }
        | MetadataError::MissingExpectedOutput { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let mut config = ConfigLoader::load(&cli.configroot)?;
    if let Some(executable) = cli.executable {
        config.snpseq_metadata_executable = executable;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .into_diagnostic()?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(Commands::Version) = cli.command {
        return JsonOutput::print_version(&VersionResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
        .into_diagnostic();
    }

    let lims = LimsHttpClient::new(&config.snpseq_data_url, config.lims_timeout())?;
    let tool = MetadataProcessRunner::new(
        config.snpseq_metadata_executable.clone(),
        config.tool_timeout(),
    );
    let options = ExportOptions {
        datadir: config.datadir_template(),
        workdir_root: config
            .workdir_root
            .clone()
            .map(fs_util::utf8_path)
            .transpose()?,
    };
    let exporter = Arc::new(Exporter::new(lims, tool, options));

    match cli.command {
        Some(Commands::Export(args)) => {
            let target = RunFolderRef::new(&args.host, &args.runfolder)?;
            let lims_data = args
                .lims_data
                .map(|value| value.parse::<CachedLimsFile>())
                .transpose()?;
            let result = exporter.export(&target, lims_data.as_ref())?;
            JsonOutput::print_export(&result).into_diagnostic()
        }
        Some(Commands::Serve(args)) => serve(exporter, config, args),
        Some(Commands::Version) | None => serve(exporter, config, ServeArgs::default()),
    }
}

fn serve<L, T>(
    exporter: Arc<Exporter<L, T>>,
    config: AppConfig,
    args: ServeArgs,
) -> miette::Result<()>
where
    L: LimsClient + 'static,
    T: MetadataTool + 'static,
{
    let addr = format!("{}:{}", config.host, args.port.unwrap_or(config.port));
    let app = server::router(Arc::clone(&exporter), &config.route_prefix());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await.into_diagnostic()?;
        info!(
            %addr,
            executable = %config.snpseq_metadata_executable,
            lims = %config.snpseq_data_url,
            "starting metadata-service"
        );
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .into_diagnostic()
    })
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}
