use std::time::Duration;

use reqwest::Client;

/// Build the shared upstream client used for proxying and health probes.
/// Connections are pooled per host; HTTP/2 is negotiated over TLS via ALPN.
/// Redirects are never followed, upstream responses pass through untouched.
pub fn build_client(insecure_skip_verify: bool) -> reqwest::Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(insecure_skip_verify)
        .user_agent(concat!("warpgate/", env!("CARGO_PKG_VERSION")))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_and_without_verification() {
        assert!(build_client(false).is_ok());
        assert!(build_client(true).is_ok());
    }
}
