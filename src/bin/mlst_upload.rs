use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mlst_upload::config::{ConfigContext, DEFAULT_CONFIG_PATH};
use mlst_upload::daemon::Daemon;
use mlst_upload::domain::{Compatibility, SUPPORTED_FILE_API, SUPPORTED_WEB_API, VersionInfo};
use mlst_upload::error::UploadError;
use mlst_upload::resolver::NoInstrument;
use mlst_upload::session::{Credentials, SessionClient};
use mlst_upload::transport::ReqwestTransport;

#[derive(Parser)]
#[command(name = "mlst-upload")]
#[command(about = "Watch the sequencer output tree and upload fast5/pod5 files to the MLSTverse cloud")]
#[command(version, author)]
struct Cli {
    #[arg(short, long, help = "Path to the JSON config file")]
    config: Option<String>,

    #[arg(short, long, help = "Enable debug logging")]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Watch and upload until SIGINT/SIGTERM (default)")]
    Run,
    #[command(about = "Log in and check both service API versions")]
    Check,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<UploadError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &UploadError) -> u8 {
    match error {
        UploadError::MissingConfig(_)
        | UploadError::ConfigRead(_)
        | UploadError::ConfigParse(_)
        | UploadError::ConfigInvalid(_) => 2,
        UploadError::Credential(_)
        | UploadError::Http(_)
        | UploadError::RemoteStatus { .. }
        | UploadError::RemotePayload { .. }
        | UploadError::UnsupportedApi { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
    let context = Arc::new(ConfigContext::load(Path::new(config_path))?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(context),
        Commands::Check => run_check(&context),
    }
}

fn run_daemon(context: Arc<ConfigContext>) -> miette::Result<()> {
    let transport = ReqwestTransport::new()?;
    let daemon = Daemon::new(context, transport, NoInstrument)?;
    let shutdown = daemon.shutdown_handle();

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|err| UploadError::Filesystem(format!("signal handler: {err}")))?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "signal received");
                shutdown.trigger();
            }
        })
        .map_err(|err| UploadError::Filesystem(format!("signal thread: {err}")))?;

    let report = daemon.run()?;
    info!(
        uploaded = report.uploaded,
        skipped = report.skipped,
        failed = report.failed,
        "shutdown complete"
    );
    Ok(())
}

fn run_check(context: &ConfigContext) -> miette::Result<()> {
    let config = context.current();
    let mut client = SessionClient::new(ReqwestTransport::new()?, Credentials::from(&config.cloud));
    let mut api = client.scoped()?;

    let web = api.web_version()?;
    report_version("web", &web, &SUPPORTED_WEB_API)?;
    let file = api.file_version()?;
    report_version("file", &file, &SUPPORTED_FILE_API)?;
    println!("login ok: {}", config.cloud.user);
    Ok(())
}

fn report_version(
    service: &str,
    remote: &VersionInfo,
    supported: &VersionInfo,
) -> Result<(), UploadError> {
    match remote.check_against(supported)? {
        Compatibility::Compatible => {}
        Compatibility::UpdateAvailable => {
            info!(service, remote = %remote, "client update available")
        }
        Compatibility::NewerMinor => {
            warn!(service, remote = %remote, supported = %supported, "server API is newer than this client")
        }
    }
    println!("{service} API {remote} (client supports {supported})");
    Ok(())
}
