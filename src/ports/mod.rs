pub mod config_provider;
pub mod http_client;

pub use config_provider::{ConfigSource, ConfigWatch};
pub use http_client::{
    HttpClient, HttpClientError, HttpClientResult, UpstreamBody, UpstreamResponse,
};
