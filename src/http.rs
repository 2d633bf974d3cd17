use crate::config::env_or;
use reqwest::Client;
use std::time::Duration;

const USER_AGENT: &str = concat!("sealed-auction-api/", env!("CARGO_PKG_VERSION"));

pub fn build_client() -> Client {
    build_client_with_timeout(env_or("HTTP_TIMEOUT_SECS", 15))
}

/// Client with a custom request timeout, used for short-lived fetches such as
/// thumbnail downloads and long vision calls.
pub fn build_client_with_timeout(timeout_secs: u64) -> Client {
    let connect = env_or("HTTP_CONNECT_TIMEOUT_SECS", 5u64);
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}
