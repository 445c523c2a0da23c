use std::time::Duration;

/// Build the shared reqwest client. System proxy discovery can panic inside
/// platform libraries on some desktops, so it is opt-in via
/// AETHERIA_ENABLE_SYSTEM_PROXY; the default client skips it entirely.
pub fn build_http_client(timeout: Option<Duration>) -> reqwest::Client {
    if proxy_discovery_enabled() {
        match std::panic::catch_unwind(|| configure(timeout, false).build()) {
            Ok(Ok(client)) => return client,
            _ => {
                tracing::warn!("System proxy discovery failed; falling back to no_proxy");
            }
        }
    }

    match configure(timeout, true).build() {
        Ok(client) => client,
        Err(error) => panic!("Failed to initialize HTTP client: {}", error),
    }
}

fn proxy_discovery_enabled() -> bool {
    std::env::var("AETHERIA_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn configure(timeout: Option<Duration>, no_proxy: bool) -> reqwest::ClientBuilder {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder
}
