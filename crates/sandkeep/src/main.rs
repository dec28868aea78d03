use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sandkeep::api;
use sandkeep::config::{self, APP_NAME, AppConfig};
use sandkeep::gateway::{GatewayCli, GatewayLaunch, WaitOptions, probe_for};
use sandkeep::persist::{RestoreDecision, RestorePolicy, SyncRun, transfer_from_config};
use sandkeep::secrets::ProcessEnv;
use sandkeep::supervisor::{StatusReport, Supervisor};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Serve => handle_serve(&ctx).await,
        Command::Status => handle_status(&ctx).await,
        Command::Sync => handle_sync(&ctx).await,
        Command::Ensure => handle_ensure(&ctx).await,
        Command::Restore => handle_restore(&ctx).await,
        Command::GatewayCli(cmd) => handle_gateway_cli(&ctx, cmd).await,
        Command::Config { .. } | Command::Completions { .. } => Ok(()),
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        command => async_main(ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sandkeep - gateway lifecycle and durable state for assistant containers.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Mount, restore, start the gateway, then sync periodically and serve
    /// the control surface
    Serve,
    /// Show mount, sync and gateway status
    Status,
    /// Trigger a manual sync
    Sync,
    /// Make sure the gateway is running and ready
    Ensure,
    /// Restore remote state to local (use --dry-run to only show the decision)
    Restore,
    /// Run a gateway CLI command once the gateway is ready
    GatewayCli(GatewayCliCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct GatewayCliCommand {
    /// Arguments passed to the gateway binary, e.g. `devices list --json`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    args: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = config::resolve_config_file(common.config.clone())?;
        let config = config::load_or_init(&config_file, !common.dry_run)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::from_str(&self.config.logging.level).unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn control_url(&self, path: &str) -> String {
        format!("http://{}{}", self.config.control.bind, path)
    }
}

async fn handle_serve(ctx: &RuntimeContext) -> Result<()> {
    let supervisor = Arc::new(Supervisor::from_config(&ctx.config, Arc::new(ProcessEnv))?);

    let addr: SocketAddr = ctx
        .config
        .control
        .bind
        .parse()
        .context("invalid control bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("binding control address")?;
    info!("Control surface listening on http://{}", addr);

    let stop = CancellationToken::new();
    let app = api::create_router(supervisor.clone());
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(stop.clone()));
    let server = tokio::spawn(async move { server.await });

    match supervisor.boot().await {
        Ok(report) => info!(
            "Boot finished: mounted={}, restore={:?}, gateway_ready={}",
            report.mounted, report.restore.action, report.gateway_ready
        ),
        Err(e) => {
            stop.cancel();
            let _ = server.await;
            return Err(anyhow!(e).context("boot failed"));
        }
    }
    supervisor.spawn_periodic_sync();

    server
        .await
        .context("control server task failed")?
        .context("running control server")?;

    info!("Shutting down");
    if let Some(run) = supervisor.shutdown().await {
        info!("Final sync: {:?}", run.outcome);
    }
    info!("Shutdown complete (gateway left running)");
    Ok(())
}

async fn shutdown_signal(stop: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Interrupt received"),
        _ = terminate => info!("SIGTERM received"),
        _ = stop.cancelled() => {}
    }
}

async fn control_request<T: DeserializeOwned>(
    ctx: &RuntimeContext,
    method: reqwest::Method,
    path: &str,
) -> Result<T> {
    let url = ctx.control_url(path);
    let response = reqwest::Client::new()
        .request(method, &url)
        .send()
        .await
        .with_context(|| format!("contacting {url} (is `{APP_NAME} serve` running?)"))?;

    let status = response.status();
    if !status.is_success() {
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("request failed");
        bail!("{} ({})", message, status);
    }
    response.json().await.context("decoding control response")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing output to JSON")?
    );
    Ok(())
}

async fn handle_status(ctx: &RuntimeContext) -> Result<()> {
    let report: StatusReport = control_request(ctx, reqwest::Method::GET, "/status").await?;
    if ctx.common.json {
        return print_json(&report);
    }

    println!(
        "mount:    {:?} at {} ({} attempt(s))",
        report.mount.status,
        report.mount.path.display(),
        report.mount.attempts
    );
    match report.restore {
        Some(ref decision) => println!(
            "restore:  {:?} ({:?})",
            decision.action, decision.freshness
        ),
        None => println!("restore:  pending"),
    }
    match report.sync.last_run {
        Some(ref run) => println!("sync:     last run #{} {:?}", run.id, run.outcome),
        None => println!("sync:     no runs yet"),
    }
    if report.sync.restore_failed {
        println!("sync:     held, startup restore did not complete");
    }
    match report.gateway.process {
        Some(ref process) => println!(
            "gateway:  {:?} (pid {}, port {})",
            report.gateway.state, process.pid, process.port
        ),
        None => println!("gateway:  {:?}", report.gateway.state),
    }
    for failure in &report.failures {
        println!(
            "failure:  [{}] {} at {}",
            failure.category,
            failure.summary,
            failure.at.to_rfc3339()
        );
    }
    Ok(())
}

async fn handle_sync(ctx: &RuntimeContext) -> Result<()> {
    let run: SyncRun = control_request(ctx, reqwest::Method::POST, "/sync").await?;
    print_json(&run)
}

async fn handle_ensure(ctx: &RuntimeContext) -> Result<()> {
    let process: serde_json::Value =
        control_request(ctx, reqwest::Method::POST, "/gateway/ensure").await?;
    print_json(&process)
}

async fn handle_restore(ctx: &RuntimeContext) -> Result<()> {
    let decision: RestoreDecision = if ctx.common.dry_run {
        let transfer = transfer_from_config(&ctx.config.sync)?;
        let policy = RestorePolicy::new(ctx.config.sync.marker_file.clone(), transfer);
        policy
            .decide(&ctx.config.local_state_dir(), &ctx.config.remote_state_dir())
            .await?
    } else {
        let supervisor = Supervisor::from_config(&ctx.config, Arc::new(ProcessEnv))?;
        supervisor.prepare_state().await?.clone()
    };
    print_json(&decision)
}

async fn handle_gateway_cli(ctx: &RuntimeContext, cmd: GatewayCliCommand) -> Result<()> {
    let launch = GatewayLaunch::new(&ctx.config.gateway, &ProcessEnv);
    let cli = GatewayCli::new(
        ctx.config.gateway.binary.clone(),
        launch.endpoint,
        probe_for(&ctx.config.readiness),
        WaitOptions::from_config(&ctx.config.readiness),
        Duration::from_secs(ctx.config.gateway.cli_timeout_secs),
    );

    let output = cli.run(&cmd.args, &CancellationToken::new()).await?;
    if ctx.common.json {
        print_json(&output)?;
    } else {
        print!("{}", output.stdout);
        eprint!("{}", output.stderr);
    }
    if !output.success() {
        bail!("gateway cli exited with {:?}", output.code);
    }
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                print_json(&ctx.config)
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
                Ok(())
            }
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.config_file.display()
                );
                return Ok(());
            }
            config::write_default_config(&ctx.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
