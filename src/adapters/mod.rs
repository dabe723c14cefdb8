pub mod file_config_source;
pub mod forwarder;
pub mod status_page;
pub mod upstream_client;

/// Re-export commonly used types from adapters
pub use file_config_source::FileConfigSource;
pub use forwarder::Forwarder;
pub use status_page::StatusPage;
pub use upstream_client::UpstreamClient;
