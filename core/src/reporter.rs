//! Generic periodic push loop used for registration, heartbeat and metric
//! reporting.
//!
//! A reporter owns one background worker that paces itself by a fixed period,
//! resolves its target URI on every tick (the head node's address can move),
//! fetches a payload and hands it to a sink. Failures invoke an optional
//! `on_error` hook and the loop continues; the hook is how the executor wires
//! send failures to resynchronization and naming-cache invalidation.

use crate::{http::post_json, Error};
use async_trait::async_trait;
use serde::Serialize;
use std::{future::Future, time::Duration};
use tokio::{net::UdpSocket, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Destination for a reporter's payloads.
#[async_trait]
pub trait ReportSink<T: Send + 'static>: Send + Sync {
    async fn send(&self, target: &Url, payload: T) -> Result<(), Error>;
}

/// POSTs JSON payloads; any non-2xx status or transport error is a send
/// failure.
pub struct HttpSink {
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<T: Serialize + Send + Sync + 'static> ReportSink<T> for HttpSink {
    async fn send(&self, target: &Url, payload: T) -> Result<(), Error> {
        post_json(&self.client, target, &payload).await
    }
}

/// Best-effort datagram sink; only a send error counts as failure.
pub struct UdpSink {
    socket: UdpSocket,
}

impl UdpSink {
    pub async fn bind() -> Result<Self, std::io::Error> {
        Ok(Self {
            socket: UdpSocket::bind(("0.0.0.0", 0)).await?,
        })
    }
}

#[async_trait]
impl ReportSink<Vec<u8>> for UdpSink {
    async fn send(&self, target: &Url, payload: Vec<u8>) -> Result<(), Error> {
        let host = target
            .host_str()
            .ok_or_else(|| Error::InvalidTarget(target.clone()))?;
        let port = target
            .port()
            .ok_or_else(|| Error::InvalidTarget(target.clone()))?;
        self.socket.send_to(&payload, (host, port)).await?;
        Ok(())
    }
}

/// Handle to a running reporter. Dropping it tears the worker down; use
/// [`Reporter::stop`] to wait for the in-flight tick to wind down first.
pub struct Reporter {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Reporter {
    /// Starts a reporter worker.
    ///
    /// `hold` initial ticks elapse before the first send, debouncing rapid
    /// reconfiguration. A zero `period` disables the reporter entirely and
    /// returns `None`. A fetcher returning `None` skips that tick.
    pub fn spawn<T, Resolver, ResolverFut, Fetcher, Sink, OnError>(
        name: &str,
        resolver: Resolver,
        hold: u32,
        period: Duration,
        fetcher: Fetcher,
        sink: Sink,
        on_error: OnError,
    ) -> Option<Self>
    where
        T: Send + 'static,
        Resolver: Fn() -> ResolverFut + Send + Sync + 'static,
        ResolverFut: Future<Output = Result<Url, Error>> + Send + 'static,
        Fetcher: Fn() -> Option<T> + Send + Sync + 'static,
        Sink: ReportSink<T> + 'static,
        OnError: Fn() + Send + Sync + 'static,
    {
        if period.is_zero() {
            info!(reporter = %name, "zero report period, reporter disabled");
            return None;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            name.to_string(),
            resolver,
            hold,
            period,
            fetcher,
            sink,
            on_error,
            cancel.clone(),
        ));
        Some(Self {
            name: name.to_string(),
            cancel,
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancels the worker and joins it.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run<T, Resolver, ResolverFut, Fetcher, Sink, OnError>(
    name: String,
    resolver: Resolver,
    mut hold: u32,
    period: Duration,
    fetcher: Fetcher,
    sink: Sink,
    on_error: OnError,
    cancel: CancellationToken,
) where
    T: Send + 'static,
    Resolver: Fn() -> ResolverFut + Send + Sync + 'static,
    ResolverFut: Future<Output = Result<Url, Error>> + Send,
    Fetcher: Fn() -> Option<T> + Send + Sync + 'static,
    Sink: ReportSink<T> + 'static,
    OnError: Fn() + Send + Sync + 'static,
{
    debug!(reporter = %name, ?period, hold, "reporter started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }

        if hold > 0 {
            hold -= 1;
            continue;
        }

        // Resolution may block inside the naming client; it observes the
        // cancellation token so Stop is never delayed by a dead head node.
        let target = tokio::select! {
            _ = cancel.cancelled() => break,
            resolved = resolver() => match resolved {
                Ok(url) => url,
                Err(Error::Cancelled) => break,
                Err(error) => {
                    warn!(reporter = %name, %error, "failed to resolve report target");
                    on_error();
                    continue;
                }
            }
        };

        let Some(payload) = fetcher() else { continue };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = sink.send(&target, payload) => sent,
        };
        if let Err(error) = sent {
            warn!(reporter = %name, %target, %error, "report send failed");
            on_error();
        }
    }

    debug!(reporter = %name, "reporter stopped");
}
