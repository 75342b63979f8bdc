use super::HealthChecker;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;

/// Connection pool shared by every HTTP probe. Requests set their own
/// timeout; the client-level one is only a fallback.
static SHARED_HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn shared_client() -> &'static Client {
    SHARED_HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_else(|_| Client::new())
    })
}

/// Probes a URL; any 2xx/3xx answer counts as healthy.
///
/// Web UIs commonly redirect `/` to their app page, so redirects are
/// accepted as-is.
pub struct HttpChecker {
    url: String,
    timeout: Duration,
}

impl HttpChecker {
    /// # Errors
    ///
    /// Returns error if the URL is malformed or not http/https.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        Self::validate_url(&url)?;
        Ok(Self { url, timeout })
    }

    /// Probe `http://127.0.0.1:<port>/`.
    pub fn for_port(port: u16, timeout: Duration) -> Self {
        Self {
            url: format!("http://127.0.0.1:{}/", port),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn validate_url(url: &str) -> Result<()> {
        match url::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
            Ok(parsed) => Err(Error::Config(format!(
                "Invalid health probe URL '{}': scheme must be http or https, got '{}'",
                url,
                parsed.scheme()
            ))),
            Err(e) => Err(Error::Config(format!(
                "Invalid health probe URL '{}': {}",
                url, e
            ))),
        }
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self) -> Result<bool> {
        match shared_client()
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status();
                Ok(status.is_success() || status.is_redirection())
            }
            Err(e) => {
                tracing::trace!(url = %self.url, "Probe failed: {}", e);
                Ok(false)
            }
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn describe(&self) -> String {
        format!("GET {}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_port_is_unhealthy() {
        let checker = HttpChecker::new("http://127.0.0.1:59999/", Duration::from_secs(1)).unwrap();
        assert!(!checker.check().await.unwrap());
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(HttpChecker::new("not-a-url", Duration::from_secs(1)).is_err());
        assert!(HttpChecker::new("ftp://localhost/", Duration::from_secs(1)).is_err());
        assert!(HttpChecker::new("https://localhost/health", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_for_port() {
        let checker = HttpChecker::for_port(7860, Duration::from_secs(2));
        assert_eq!(checker.url(), "http://127.0.0.1:7860/");
        assert_eq!(checker.timeout(), Duration::from_secs(2));
    }
}
