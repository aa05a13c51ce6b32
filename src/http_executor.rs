//! HTTP execution: the engine's only outbound I/O contract.
//!
//! The engine never reaches into `reqwest` directly — every dispatch goes
//! through the [`HttpExecutor`] trait, so tests can substitute a fake that
//! returns canned responses without touching the network.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::Method;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub duration_ms: u64,
}

#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<HttpResponse, String>;
}

/// Default executor backed by `reqwest`, rustls-tls, no cookie jar or
/// connection reuse settings beyond the client defaults.
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<HttpResponse, String> {
        let reqwest_method = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
        };

        let started = std::time::Instant::now();
        let mut builder = self.client.request(reqwest_method, url).timeout(timeout);
        for (k, v) in headers {
            builder = builder.header(k, v);
        }
        if let Some(b) = body {
            builder = builder.body(b.to_vec());
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let duration_ms = started.elapsed().as_millis() as u64;
        let status_code = response.status().as_u16();
        let mut resp_headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                resp_headers.insert(name.to_string(), v.to_string());
            }
        }
        // Drain the body so the connection can be reused; the engine only
        // needs status code and headers, not the body.
        let _ = response.bytes().await;

        Ok(HttpResponse {
            status_code,
            headers: resp_headers,
            duration_ms,
        })
    }
}

/// Exposed outside `#[cfg(test)]` under the `test-util` feature so
/// integration tests in `tests/` (a separate compilation unit) can script
/// HTTP outcomes without a real network call.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// A scripted sequence of responses, returned one per call. Panics if
    /// exhausted — tests should script exactly as many calls as they expect.
    pub struct FakeExecutor {
        responses: Mutex<Vec<Result<HttpResponse, String>>>,
        calls: AtomicUsize,
    }

    impl FakeExecutor {
        pub fn new(responses: Vec<Result<HttpResponse, String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpExecutor for FakeExecutor {
        async fn execute(
            &self,
            _method: Method,
            _url: &str,
            _headers: &HashMap<String, String>,
            _body: Option<&[u8]>,
            _timeout: Duration,
        ) -> Result<HttpResponse, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                panic!("FakeExecutor exhausted: no more scripted responses");
            }
            responses.remove(0)
        }
    }

    pub fn ok(status_code: u16) -> Result<HttpResponse, String> {
        Ok(HttpResponse {
            status_code,
            headers: HashMap::new(),
            duration_ms: 1,
        })
    }

    pub fn err(message: &str) -> Result<HttpResponse, String> {
        Err(message.to_string())
    }
}
