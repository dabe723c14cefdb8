pub mod launch;
pub mod session_client;

pub use launch::{LaunchError, launch_env, run_client};
pub use session_client::{SessionClient, SessionClientError};
