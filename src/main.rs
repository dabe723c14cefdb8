use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
};

use ccenv::{
    client::{
        SessionClient,
        launch::{CLIENT_PROGRAM, run_client},
        session_client::HEARTBEAT_INTERVAL,
    },
    config::{
        ConfigSnapshot, ServerConfigValidator, default_config_path, default_log_path,
        load_config_or_write_example, load_config_unchecked, write_example_config,
    },
    error::{ConfigError, ProxyError},
    tracing_setup::{self, LogHandle, LogTarget},
    FileConfigSource, GracefulShutdown, Orchestrator, SessionTracker,
    ports::config_provider::ConfigSource,
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Settings file (default: ~/.claude-code-env/settings.json)
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Run the proxy in the foreground (default)
    Start,
    /// Launch the client through the proxy, starting the proxy if none is running
    #[clap(disable_help_flag = true)]
    Code {
        /// Arguments passed through to the client unchanged
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },
    /// Validate the settings file and print a summary
    Validate,
    /// Write an example settings file
    Init,
    /// Show the log file (arguments are passed to `tail`)
    #[clap(disable_help_flag = true)]
    Logs {
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(default_config_path);

    match args.command.unwrap_or(Commands::Start) {
        Commands::Start => start_command(&config_path).await,
        Commands::Code { args } => code_command(&config_path, args).await,
        Commands::Validate => validate_config_command(&config_path),
        Commands::Init => init_config_command(&config_path),
        Commands::Logs { args } => logs_command(args).await,
    }
}

/// Load the settings, then start watching them. A missing file is replaced
/// by the example so the user has something to edit.
fn open_config(config_path: &Path) -> Result<(FileConfigSource, ConfigSnapshot)> {
    match load_config_or_write_example(config_path) {
        Ok(_) => {}
        Err(ConfigError::ExampleWritten { path }) => bail!(
            "No configuration found. An example was written to {}; add your providers and run again",
            path.display()
        ),
        Err(e) => {
            return Err(e).wrap_err_with(|| {
                format!("Failed to load configuration from {}", config_path.display())
            });
        }
    }

    let source = FileConfigSource::new(config_path).wrap_err("Failed to watch configuration")?;
    // Reload through the source so change detection starts from this content.
    let snapshot = source.load().wrap_err_with(|| {
        format!("Failed to load configuration from {}", config_path.display())
    })?;
    Ok((source, snapshot))
}

fn new_orchestrator(log: &LogHandle) -> Arc<Orchestrator> {
    let orchestrator = Orchestrator::new(
        Arc::new(SessionTracker::new()),
        GracefulShutdown::new(),
        Some(log.clone()),
    );
    orchestrator.install_auto_shutdown();
    orchestrator
}

fn spawn_signal_handler(orchestrator: &Orchestrator) {
    let shutdown = orchestrator.shutdown_handle().clone();
    tokio::spawn(async move { shutdown.run_signal_handler().await });
}

fn port_hint(err: ProxyError) -> color_eyre::Report {
    match err {
        e @ ProxyError::PortBind { .. } => eyre!(e).wrap_err(
            "Port already in use. If another ccenv is running, use `ccenv code` to share it, \
             or change CCENV_PORT in the settings file",
        ),
        e => eyre!(e).wrap_err("Failed to start proxy service"),
    }
}

async fn start_command(config_path: &Path) -> Result<()> {
    let (source, snapshot) = open_config(config_path)?;
    let log = tracing_setup::init_logging(&snapshot.log_level, LogTarget::Stderr)
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

    tracing::info!("Loaded configuration from {}", config_path.display());
    let orchestrator = new_orchestrator(&log);
    orchestrator
        .start(Arc::new(snapshot))
        .await
        .map_err(port_hint)?;
    spawn_signal_handler(&orchestrator);

    if let Some(graph) = orchestrator.current() {
        println!(
            "ccenv proxy listening on http://{} (status page http://{}), press Ctrl+C to stop",
            graph.api_addr(),
            graph.status_addr()
        );
    }

    let reason = orchestrator.run(source.watch()).await;
    tracing::debug!("Proxy exited: {:?}", reason);
    Ok(())
}

async fn code_command(config_path: &Path, args: Vec<OsString>) -> Result<()> {
    let (source, snapshot) = open_config(config_path)?;
    // The terminal belongs to the client; logs go to the file.
    let log = tracing_setup::init_logging(&snapshot.log_level, LogTarget::File(default_log_path()))
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

    let client = SessionClient::new(snapshot.local_base_url())?;
    let hosted = match client.register().await {
        Ok(count) => {
            tracing::info!(
                "Joined running proxy at {} ({} client(s))",
                snapshot.local_base_url(),
                count
            );
            None
        }
        Err(e) => {
            tracing::info!("No proxy answered ({}), starting one", e);
            let orchestrator = new_orchestrator(&log);
            orchestrator
                .start(Arc::new(snapshot.clone()))
                .await
                .map_err(port_hint)?;
            if let Err(e) = client.register().await {
                tracing::warn!("Failed to register with the new proxy: {}", e);
            }
            let runner = {
                let orchestrator = orchestrator.clone();
                let watch = source.watch();
                tokio::spawn(async move { orchestrator.run(watch).await })
            };
            Some((orchestrator, runner))
        }
    };

    let cancel = CancellationToken::new();
    let heartbeat = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run_heartbeat(HEARTBEAT_INTERVAL, cancel).await })
    };

    let outcome = run_client(CLIENT_PROGRAM, &args, &snapshot).await;

    cancel.cancel();
    let _ = heartbeat.await;
    if let Err(e) = client.unregister().await {
        tracing::warn!("Failed to unregister {}: {}", client.client_id(), e);
    }

    match hosted {
        Some((orchestrator, runner)) => {
            // Also covers a host whose own registration never went through,
            // where no "last client left" event will ever fire.
            if !orchestrator.shutdown_if_idle() {
                eprintln!(
                    "ccenv: proxy keeps serving {} other client(s) and stops when they exit, \
                     press Ctrl+C to stop now",
                    orchestrator.sessions().count()
                );
            }
            spawn_signal_handler(&orchestrator);
            runner.await.wrap_err("Proxy task failed")?;
        }
        None => log.shutdown(),
    }

    outcome.wrap_err("Client session ended with an error")
}

/// Validate configuration file and exit
fn validate_config_command(config_path: &Path) -> Result<()> {
    println!("🔍 Validating configuration file: {}", config_path.display());

    let snapshot = match load_config_unchecked(config_path) {
        Ok(snapshot) => {
            println!("✅ Configuration parsing: OK");
            snapshot
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&snapshot) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • API endpoint: {}", snapshot.local_base_url());
            println!("   • Status page: http://{}:{}", snapshot.host, snapshot.status_port);
            println!("   • Routing: {}", snapshot.strategy);
            println!("   • Upstream timeout: {:?}", snapshot.upstream_timeout);
            println!(
                "   • API proxy: {}",
                snapshot.api_proxy.as_deref().unwrap_or("none")
            );
            println!("   • Log level: {}", snapshot.log_level);
            println!(
                "   • Providers: {} active / {} configured",
                snapshot.active_providers().count(),
                snapshot.providers.len()
            );
            for provider in &snapshot.providers {
                let state = if provider.enabled { "on" } else { "off" };
                let auth = provider
                    .credential
                    .as_ref()
                    .map(|c| format!("{} {}", c.auth_type(), c.masked()))
                    .unwrap_or_else(|| "no credentials".to_string());
                println!(
                    "     - {} [{}] {} ({}) model: {}",
                    provider.name,
                    state,
                    provider.base_url.as_deref().unwrap_or("-"),
                    auth,
                    provider.target_model.as_deref().unwrap_or("unchanged")
                );
            }
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(errors) => {
            eprintln!("❌ Configuration validation failed:");
            for error in &errors {
                eprintln!("   • {error}");
            }
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure every enabled provider has ANTHROPIC_BASE_URL starting with http:// or https://");
            println!("   • Give every provider a unique, non-empty name");
            println!("   • Use different values for CCENV_PORT and CCENV_STATUS_PORT");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
fn init_config_command(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        eprintln!(
            "❌ Error: Configuration file '{}' already exists",
            config_path.display()
        );
        std::process::exit(1);
    }

    write_example_config(config_path).wrap_err("Failed to write config file")?;
    println!(
        "✅ Created example configuration at: {}",
        config_path.display()
    );
    println!("   Add your provider credentials, then run 'ccenv code' or 'ccenv start'");
    Ok(())
}

async fn logs_command(args: Vec<OsString>) -> Result<()> {
    let log_path = default_log_path();
    if !log_path.is_file() {
        bail!(
            "Log file {} does not exist yet, run 'ccenv start' or 'ccenv code' first",
            log_path.display()
        );
    }

    let status = tokio::process::Command::new("tail")
        .args(&args)
        .arg(&log_path)
        .status()
        .await
        .wrap_err("Failed to run tail")?;
    if !status.success() {
        bail!("tail exited with {}", status);
    }
    Ok(())
}
