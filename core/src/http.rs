//! HTTP client construction and URI resolution.

use crate::{naming::NamingClient, Error};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Request timeout applied to every client this factory builds.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the agent's HTTP client with TLS and timeout defaults.
pub fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
}

/// Extracts the `{servicename}` token embedded in a URI, if any.
fn service_token(uri: &str) -> Option<&str> {
    let start = uri.find('{')?;
    let end = uri[start..].find('}')? + start;
    Some(&uri[start + 1..end])
}

/// Normalizes a URI that may carry an embedded `{servicename}` token by
/// resolving that service through the naming client and substituting its
/// location. Plain URIs pass through unchanged.
pub async fn resolve_uri(template: &str, naming: &NamingClient) -> Result<Url, Error> {
    let resolved = match service_token(template) {
        Some(name) => {
            let location = naming.resolve(name).await?;
            let substituted = template.replacen(
                &format!("{{{name}}}"),
                location.as_str().trim_end_matches('/'),
                1,
            );
            debug!(template, %location, "substituted service location");
            substituted
        }
        None => template.to_string(),
    };
    Url::parse(&resolved).map_err(|e| Error::InvalidUri(resolved, e))
}

/// POSTs a JSON payload, treating any non-2xx status as an error.
pub async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &Url,
    body: &T,
) -> Result<(), Error> {
    let response = client.post(url.clone()).json(body).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus(status, url.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::install_test_trace_subscriber;
    use assert_matches::assert_matches;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn token_extraction() {
        assert_eq!(
            service_token("{SchedulerNode}/api/cn-01/taskcompleted"),
            Some("SchedulerNode")
        );
        assert_eq!(service_token("https://head:40300/api/cn-01"), None);
        assert_eq!(service_token("https://head/{"), None);
    }

    #[tokio::test]
    async fn resolve_plain_uri_skips_naming() {
        install_test_trace_subscriber();
        // An empty pool would make any naming lookup fail, proving the plain
        // path never consults it.
        let naming = NamingClient::new(
            Vec::new(),
            Duration::from_millis(5),
            reqwest::Client::new(),
            CancellationToken::new(),
        );
        let url = resolve_uri("https://head:40300/api/cn-01/taskcompleted", &naming)
            .await
            .unwrap();
        assert_eq!(url.as_str(), "https://head:40300/api/cn-01/taskcompleted");
    }

    #[tokio::test]
    async fn resolve_substitutes_service_location() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/SchedulerNode")
            .with_status(200)
            .with_body("\"https://head.cluster:40300\"")
            .create_async()
            .await;

        let naming = NamingClient::new(
            Vec::from([Url::parse(&server.url()).unwrap()]),
            Duration::from_millis(5),
            reqwest::Client::new(),
            CancellationToken::new(),
        );
        let url = resolve_uri("{SchedulerNode}/api/cn-01/computenodereported", &naming)
            .await
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://head.cluster:40300/api/cn-01/computenodereported"
        );
    }

    #[tokio::test]
    async fn post_json_classifies_statuses() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("POST", "/ok")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let broken = server
            .mock("POST", "/broken")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let client = http_client().unwrap();
        let base = Url::parse(&server.url()).unwrap();

        post_json(&client, &base.join("/ok").unwrap(), &serde_json::json!({}))
            .await
            .unwrap();
        assert_matches!(
            post_json(&client, &base.join("/broken").unwrap(), &serde_json::json!({})).await,
            Err(Error::HttpStatus(status, _)) => assert_eq!(status.as_u16(), 500)
        );

        ok.assert_async().await;
        broken.assert_async().await;
    }
}
