//! Spawning the interactive client with its environment pointed at the proxy.
use std::{ffi::OsString, io, process::ExitStatus};

use thiserror::Error;
use tokio::process::Command;

use crate::config::ConfigSnapshot;

/// Executable started by `ccenv code`.
pub const CLIENT_PROGRAM: &str = "claude";

/// Token handed to the client. The proxy swaps in the provider's real
/// credential on every forwarded request.
pub const PLACEHOLDER_TOKEN: &str = "dummy-token";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LaunchError {
    #[error("{program} not found, make sure the client is installed and on PATH")]
    NotInstalled { program: String },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited abnormally (exit code {code})")]
    Abnormal { program: String, code: i32 },

    #[error("{program} was terminated by a signal")]
    Killed { program: String },
}

/// Environment variables that point the client at the local proxy.
pub fn launch_env(snapshot: &ConfigSnapshot) -> Vec<(String, String)> {
    let mut env = vec![
        ("ANTHROPIC_BASE_URL".to_string(), snapshot.local_base_url()),
        (
            "ANTHROPIC_AUTH_TOKEN".to_string(),
            PLACEHOLDER_TOKEN.to_string(),
        ),
    ];
    if let Some(proxy) = &snapshot.api_proxy {
        if proxy.starts_with("https://") {
            env.push(("HTTPS_PROXY".to_string(), proxy.clone()));
        } else if proxy.starts_with("http://") {
            env.push(("HTTP_PROXY".to_string(), proxy.clone()));
        }
    }
    env
}

/// Map the child's exit to a result. Exit codes 1, 2 and 130 are how the
/// client reports a user-initiated quit and count as success.
pub fn classify_exit(program: &str, status: ExitStatus) -> Result<(), LaunchError> {
    match status.code() {
        Some(0 | 1 | 2 | 130) => Ok(()),
        Some(127) => Err(LaunchError::NotInstalled {
            program: program.to_string(),
        }),
        Some(code) => Err(LaunchError::Abnormal {
            program: program.to_string(),
            code,
        }),
        None => Err(LaunchError::Killed {
            program: program.to_string(),
        }),
    }
}

/// Run `program args…` with inherited stdio and the proxy environment and
/// wait for it to exit.
pub async fn run_client(
    program: &str,
    args: &[OsString],
    snapshot: &ConfigSnapshot,
) -> Result<(), LaunchError> {
    let mut command = Command::new(program);
    command.args(args).envs(launch_env(snapshot));

    tracing::info!("Starting {} against {}", program, snapshot.local_base_url());
    let mut child = command.spawn().map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => LaunchError::NotInstalled {
            program: program.to_string(),
        },
        _ => LaunchError::Spawn {
            program: program.to_string(),
            source,
        },
    })?;

    let status = child.wait().await.map_err(|source| LaunchError::Spawn {
        program: program.to_string(),
        source,
    })?;
    tracing::info!("{} exited with {}", program, status);
    classify_exit(program, status)
}
