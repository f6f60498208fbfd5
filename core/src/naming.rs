//! Client for the head node's naming service.
//!
//! Service locations are cached per service name. The head node's address can
//! change after a failover, so callers never hold on to a resolved URI: any
//! failed round-trip invalidates the cache and the next resolve re-fetches.

use crate::{url_ensure_trailing_slash, Error};
use backoff::{backoff::Backoff, ExponentialBackoff};
use rand::{thread_rng, Rng};
use std::{
    collections::HashMap,
    sync::Mutex as StdMutex,
    time::Duration,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Naming-service lookups retry forever: the interval starts at the
/// configured value and doubles per failure, clamped at 300 seconds.
fn lookup_backoff(initial_interval: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: Duration::from_secs(300),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Cache of service names to resolved locations, filled lazily by blocking
/// lookups against a pool of naming-service endpoints.
#[derive(Debug)]
pub struct NamingClient {
    // We use a std::sync::Mutex for the cache because we won't hold it across
    // `.await` boundaries; the tokio Mutex below serializes cache-miss
    // fetches so concurrent resolvers of one name coalesce into one request.
    locations: StdMutex<HashMap<String, Url>>,
    fetch_gate: Mutex<()>,
    pool: Vec<Url>,
    initial_backoff: Duration,
    http_client: reqwest::Client,
    cancel: CancellationToken,
}

impl NamingClient {
    pub fn new(
        pool: Vec<Url>,
        initial_backoff: Duration,
        http_client: reqwest::Client,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            locations: StdMutex::new(HashMap::new()),
            fetch_gate: Mutex::new(()),
            pool,
            initial_backoff,
            http_client,
            cancel,
        }
    }

    /// Resolves a service name to its current location.
    ///
    /// A cache hit returns immediately. On a miss this blocks, retrying the
    /// naming-service pool until a location is known; the only error it can
    /// return is cancellation.
    pub async fn resolve(&self, service_name: &str) -> Result<Url, Error> {
        if let Some(location) = self.locations.lock().unwrap().get(service_name) {
            return Ok(location.clone());
        }

        let _gate = tokio::select! {
            guard = self.fetch_gate.lock() => guard,
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        };

        // Another caller may have fetched this name while we waited.
        if let Some(location) = self.locations.lock().unwrap().get(service_name) {
            return Ok(location.clone());
        }

        let location = self.request_service_location(service_name).await?;
        debug!(service_name, %location, "resolved service location");
        self.locations
            .lock()
            .unwrap()
            .insert(service_name.to_string(), location.clone());
        Ok(location)
    }

    /// Drops every cached location. Entries are re-fetched lazily on the next
    /// [`Self::resolve`].
    pub fn invalidate(&self) {
        let mut locations = self.locations.lock().unwrap();
        if !locations.is_empty() {
            debug!(entries = locations.len(), "invalidating naming cache");
        }
        locations.clear();
    }

    async fn request_service_location(&self, service_name: &str) -> Result<Url, Error> {
        if self.pool.is_empty() {
            return Err(Error::NoNamingServices);
        }

        let mut backoff = lookup_backoff(self.initial_backoff);
        let mut selected = thread_rng().gen_range(0..self.pool.len());

        loop {
            let base = url_ensure_trailing_slash(self.pool[selected % self.pool.len()].clone());
            selected += 1;

            match self.fetch_location(&base, service_name).await {
                Ok(location) => return Ok(location),
                Err(error) => {
                    warn!(%base, service_name, %error, "naming lookup failed");
                }
            }

            // Unwrap safety: no max_elapsed_time is configured, so the
            // backoff never reports exhaustion.
            let delay = backoff.next_backoff().unwrap();
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn fetch_location(&self, base: &Url, service_name: &str) -> Result<Url, Error> {
        let uri = base
            .join(service_name)
            .map_err(|e| Error::InvalidUri(format!("{base}{service_name}"), e))?;
        let response = self.http_client.get(uri.clone()).send().await?;
        let status = response.status();
        if status != http::StatusCode::OK {
            return Err(Error::HttpStatus(status, uri));
        }
        // The body is a JSON-encoded string holding the location URI.
        let location: String = response.json().await?;
        Url::parse(&location).map_err(|e| Error::InvalidUri(location, e))
    }
}
