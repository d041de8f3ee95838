//! The driver boundary between the reconciler and a cloud's orchestration API.
//!
//! One [`CloudStackDriver`] instance is bound per configured cloud. Calls are
//! blocking from the orchestration client's point of view, so implementations
//! are expected to do their own network I/O inside the async methods; the
//! scheduler is responsible for bounding how many run concurrently.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("stack {0:?} not found")]
    NotFound(String),

    #[error("cloud unreachable: {0}")]
    Unreachable(String),

    #[error("driver error: {0}")]
    Other(String),
}

/// One adapter per registered cloud. `get` returns the cloud's current view
/// of the stack's parameters; `update` merge-updates them (existing
/// parameters not named in the call are left untouched).
#[async_trait]
pub trait CloudStackDriver: Send + Sync + std::fmt::Debug {
    async fn get(&self, stack_name: &str) -> Result<HashMap<String, String>, DriverError>;

    async fn update(
        &self,
        stack_name: &str,
        parameters: HashMap<String, String>,
    ) -> Result<(), DriverError>;
}

// ─── Reference REST driver ────────────────────────────────────────────────────

/// Generic REST reference driver: `GET {base_url}/stacks/{name}` returns a
/// JSON object of string parameters, `PATCH {base_url}/stacks/{name}` merges
/// the given parameters into the stack. Not a production orchestration
/// client — just enough to run `spreaderd` end to end against an HTTP
/// endpoint that exposes stacks this way.
#[derive(Debug)]
pub struct RestDriver {
    base_url: String,
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl RestDriver {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("failed to build HTTP client"),
            auth_token: None,
        }
    }

    /// Attaches a bearer token to every request this driver issues.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn stack_url(&self, stack_name: &str) -> String {
        format!("{}/stacks/{}", self.base_url.trim_end_matches('/'), stack_name)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl CloudStackDriver for RestDriver {
    async fn get(&self, stack_name: &str) -> Result<HashMap<String, String>, DriverError> {
        let resp = self
            .authed(self.client.get(self.stack_url(stack_name)))
            .send()
            .await
            .map_err(classify_transport_error)?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DriverError::NotFound(stack_name.to_string()));
        }

        if !resp.status().is_success() {
            return Err(DriverError::Other(format!(
                "unexpected status {}",
                resp.status()
            )));
        }

        resp.json::<HashMap<String, String>>()
            .await
            .map_err(|e| DriverError::Other(e.to_string()))
    }

    async fn update(
        &self,
        stack_name: &str,
        parameters: HashMap<String, String>,
    ) -> Result<(), DriverError> {
        let resp = self
            .authed(self.client.patch(self.stack_url(stack_name)))
            .json(&parameters)
            .send()
            .await
            .map_err(classify_transport_error)?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DriverError::NotFound(stack_name.to_string()));
        }

        if !resp.status().is_success() {
            return Err(DriverError::Other(format!(
                "unexpected status {}",
                resp.status()
            )));
        }

        Ok(())
    }
}

fn classify_transport_error(e: reqwest::Error) -> DriverError {
    if e.is_connect() || e.is_timeout() {
        DriverError::Unreachable(e.to_string())
    } else {
        DriverError::Other(e.to_string())
    }
}

// ─── Fake driver for tests ────────────────────────────────────────────────────

/// In-memory driver used by the reconciler/scheduler's own tests and by the
/// workspace's scenario tests. Not behind a feature flag: exercising the
/// reconciliation loop against a fake that can be steered into each error
/// outcome is cheaper and more deterministic than mocking HTTP.
#[derive(Debug, Default)]
pub struct FakeDriver {
    stacks: parking_lot::RwLock<HashMap<String, HashMap<String, String>>>,
    unreachable: std::sync::atomic::AtomicBool,
    delay_ms: std::sync::atomic::AtomicU64,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stack(
        self,
        stack_name: impl Into<String>,
        parameters: HashMap<String, String>,
    ) -> Self {
        self.stacks.write().insert(stack_name.into(), parameters);
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable
            .store(unreachable, std::sync::atomic::Ordering::SeqCst);
    }

    /// Makes every call take at least `delay_ms` before returning, so tests
    /// can exercise stop-mid-tick behavior deterministically.
    pub fn set_delay_ms(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn current_count(&self, stack_name: &str, count_parameter: &str) -> Option<u64> {
        self.stacks
            .read()
            .get(stack_name)
            .and_then(|p| p.get(count_parameter))
            .and_then(|v| v.parse().ok())
    }

    async fn delay(&self) {
        let ms = self.delay_ms.load(std::sync::atomic::Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl CloudStackDriver for FakeDriver {
    async fn get(&self, stack_name: &str) -> Result<HashMap<String, String>, DriverError> {
        self.delay().await;

        if self.unreachable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DriverError::Unreachable("fake driver is offline".to_string()));
        }

        self.stacks
            .read()
            .get(stack_name)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(stack_name.to_string()))
    }

    async fn update(
        &self,
        stack_name: &str,
        parameters: HashMap<String, String>,
    ) -> Result<(), DriverError> {
        self.delay().await;

        if self.unreachable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DriverError::Unreachable("fake driver is offline".to_string()));
        }

        let mut stacks = self.stacks.write();
        let existing = stacks
            .get_mut(stack_name)
            .ok_or_else(|| DriverError::NotFound(stack_name.to_string()))?;
        existing.extend(parameters);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(count: &str) -> HashMap<String, String> {
        [("instance_count".to_string(), count.to_string())]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn fake_driver_get_returns_missing_stack_as_not_found() {
        let driver = FakeDriver::new();
        let err = driver.get("web").await.unwrap_err();
        assert!(matches!(err, DriverError::NotFound(name) if name == "web"));
    }

    #[tokio::test]
    async fn fake_driver_get_and_update_round_trip() {
        let driver = FakeDriver::new().with_stack("web", params("3"));
        let got = driver.get("web").await.unwrap();
        assert_eq!(got.get("instance_count"), Some(&"3".to_string()));

        driver.update("web", params("5")).await.unwrap();
        let got = driver.get("web").await.unwrap();
        assert_eq!(got.get("instance_count"), Some(&"5".to_string()));
    }

    #[tokio::test]
    async fn fake_driver_reports_unreachable_when_toggled() {
        let driver = FakeDriver::new().with_stack("web", params("3"));
        driver.set_unreachable(true);
        let err = driver.get("web").await.unwrap_err();
        assert!(matches!(err, DriverError::Unreachable(_)));
    }
}
