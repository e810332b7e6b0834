use reqwest::Client;
use std::time::Duration;

pub struct HttpClientFactory;

impl HttpClientFactory {
    /// Creates the shared HTTP client. Retry lives in the REST client so it
    /// can feed the circuit-breaker registry and honor `Retry-After`; the
    /// client here only carries pooling and per-request timeouts.
    pub fn create_client(connect_timeout: Duration, request_timeout: Duration) -> Client {
        Client::builder()
            .pool_max_idle_per_host(5)
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new())
    }
}
