//! Periodic fetch-and-apply of the cluster hosts file.
//!
//! The head node publishes a cluster-wide hosts file; each agent fetches it
//! on an interval and atomically replaces the node's own hosts file so that
//! node names resolve during MPI startup. The manager is not started when no
//! hosts URI is configured.

use gridagent_core::Error;
use std::{
    fs,
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Floor applied to the configured fetch interval.
pub const MIN_HOSTS_FETCH_INTERVAL: Duration = Duration::from_secs(60);
/// Interval used when the configuration does not specify one.
pub const DEFAULT_HOSTS_FETCH_INTERVAL: Duration = Duration::from_secs(300);

pub const DEFAULT_HOSTS_FILE: &str = "/etc/hosts";

pub struct HostsManager {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HostsManager {
    /// Starts the fetch loop. The caller is responsible for clamping the
    /// interval to [`MIN_HOSTS_FETCH_INTERVAL`].
    pub fn spawn<Resolver, ResolverFut>(
        resolver: Resolver,
        interval: Duration,
        hosts_path: impl Into<PathBuf>,
        client: reqwest::Client,
    ) -> Self
    where
        Resolver: Fn() -> ResolverFut + Send + Sync + 'static,
        ResolverFut: Future<Output = Result<Url, Error>> + Send,
    {
        let cancel = CancellationToken::new();
        let hosts_path = hosts_path.into();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                debug!(?interval, ?hosts_path, "hosts manager started");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }

                    let url = tokio::select! {
                        _ = cancel.cancelled() => break,
                        resolved = resolver() => match resolved {
                            Ok(url) => url,
                            Err(Error::Cancelled) => break,
                            Err(error) => {
                                warn!(%error, "could not resolve hosts file URI");
                                continue;
                            }
                        }
                    };

                    if let Err(error) = fetch_and_apply(&client, &url, &hosts_path).await {
                        warn!(%url, %error, "hosts file update failed");
                    }
                }
                debug!("hosts manager stopped");
            }
        });
        Self { cancel, handle }
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for HostsManager {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Fetches the published hosts file and atomically replaces the local one:
/// the body lands in a sibling temp file that is renamed over the target.
async fn fetch_and_apply(client: &reqwest::Client, url: &Url, hosts_path: &Path) -> Result<(), Error> {
    let response = client.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus(status, url.clone()));
    }
    let body = response.text().await?;

    let temp_path = hosts_path.with_extension("gridagent-tmp");
    fs::write(&temp_path, body)?;
    fs::rename(&temp_path, hosts_path)?;
    debug!(?hosts_path, "hosts file replaced");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::install_test_trace_subscriber;

    #[tokio::test]
    async fn fetch_replaces_hosts_file() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/hostsfile")
            .with_status(200)
            .with_body("10.0.0.1 head\n10.0.0.2 cn-01\n")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let hosts_path = dir.path().join("hosts");
        fs::write(&hosts_path, "127.0.0.1 localhost\n").unwrap();

        let url = Url::parse(&format!("{}/hostsfile", server.url())).unwrap();
        fetch_and_apply(&reqwest::Client::new(), &url, &hosts_path)
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(&hosts_path).unwrap(),
            "10.0.0.1 head\n10.0.0.2 cn-01\n"
        );
        assert!(!hosts_path.with_extension("gridagent-tmp").exists());
    }

    #[tokio::test]
    async fn failed_fetch_leaves_hosts_file_alone() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/hostsfile")
            .with_status(500)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let hosts_path = dir.path().join("hosts");
        fs::write(&hosts_path, "127.0.0.1 localhost\n").unwrap();

        let url = Url::parse(&format!("{}/hostsfile", server.url())).unwrap();
        assert!(fetch_and_apply(&reqwest::Client::new(), &url, &hosts_path)
            .await
            .is_err());
        assert_eq!(
            fs::read_to_string(&hosts_path).unwrap(),
            "127.0.0.1 localhost\n"
        );
    }

    #[tokio::test]
    async fn loop_fetches_periodically_until_stopped() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/hostsfile")
            .with_status(200)
            .with_body("10.0.0.1 head\n")
            .expect_at_least(2)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let hosts_path = dir.path().join("hosts");

        let url = Url::parse(&format!("{}/hostsfile", server.url())).unwrap();
        let manager = HostsManager::spawn(
            move || std::future::ready(Ok(url.clone())),
            Duration::from_millis(30),
            hosts_path.clone(),
            reqwest::Client::new(),
        );

        for _ in 0..100 {
            if hosts_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.stop().await;

        mock.assert_async().await;
        assert_eq!(fs::read_to_string(&hosts_path).unwrap(), "10.0.0.1 head\n");
    }
}
