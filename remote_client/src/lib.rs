//! HTTP client for `PromQlRemoteExec`: issues a PromQL range/instant query
//! to a remote partition's `endpointUrl` and decodes the JSON response into
//! plain `(labels, samples)` rows the `exec` crate turns into `RangeVector`s.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

use std::collections::BTreeMap;
use std::time::Duration;

use observability_deps::tracing::{debug, warn};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use url::Url;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid remote endpoint {url}: {source}"))]
    InvalidUrl { url: String, source: url::ParseError },

    #[snafu(display("request to {url} failed: {source}"))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("remote partition at {url} returned status {status}"))]
    Status { url: String, status: u16 },

    #[snafu(display("could not decode response body from {url}: {source}"))]
    Decode { url: String, source: reqwest::Error },

    #[snafu(display("remote partition returned a PromQL error: {message}"))]
    RemoteQueryError { message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One decoded series from a Prometheus-API-shaped `query_range` response.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSeries {
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<(i64, f64)>,
}

#[derive(Debug, Deserialize)]
struct QueryRangeResponse {
    status: String,
    data: Option<QueryRangeData>,
    #[serde(rename = "error")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryRangeData {
    result: Vec<QueryRangeSeries>,
}

#[derive(Debug, Deserialize)]
struct QueryRangeSeries {
    metric: BTreeMap<String, String>,
    values: Vec<(f64, String)>,
}

/// Thin `reqwest` wrapper scoped to exactly one remote call shape: a PromQL
/// range query against another partition's HTTP API.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
}

impl Default for RemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Issues `query` as a `query_range` request against `endpoint`,
    /// honoring `timeout_ms` and any extra `url_params` the query context
    /// carries (e.g. `step`, auth token passthrough).
    pub async fn query_range(
        &self,
        endpoint: &str,
        query: &str,
        start_ms: i64,
        end_ms: i64,
        step_ms: i64,
        timeout_ms: u64,
        url_params: &[(String, String)],
    ) -> Result<Vec<RemoteSeries>> {
        let mut url = Url::parse(endpoint).context(InvalidUrlSnafu {
            url: endpoint.to_string(),
        })?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("query", query);
            pairs.append_pair("start", &(start_ms as f64 / 1000.0).to_string());
            pairs.append_pair("end", &(end_ms as f64 / 1000.0).to_string());
            pairs.append_pair("step", &(step_ms as f64 / 1000.0).to_string());
            for (k, v) in url_params {
                pairs.append_pair(k, v);
            }
        }

        debug!(%url, timeout_ms, "dispatching remote PromQL range query");
        let response = self
            .http
            .get(url.clone())
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await
            .context(RequestSnafu {
                url: url.to_string(),
            })?;

        if !response.status().is_success() {
            return StatusSnafu {
                url: url.to_string(),
                status: response.status().as_u16(),
            }
            .fail();
        }

        let body: QueryRangeResponse = response.json().await.context(DecodeSnafu {
            url: url.to_string(),
        })?;

        if body.status != "success" {
            return RemoteQueryErrorSnafu {
                message: body.error_message.unwrap_or_else(|| "unknown remote error".to_string()),
            }
            .fail();
        }

        let series = body
            .data
            .map(|d| d.result)
            .unwrap_or_default()
            .into_iter()
            .map(|s| RemoteSeries {
                labels: s.metric,
                samples: s
                    .values
                    .into_iter()
                    .filter_map(|(t, v)| {
                        v.parse::<f64>().ok().map(|v| ((t * 1000.0).round() as i64, v))
                    })
                    .collect(),
            })
            .collect();

        Ok(series)
    }
}

pub fn warn_decode_failure(url: &str, message: &str) {
    warn!(url, message, "remote response decoded with partial loss");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decodes_a_successful_range_response() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "status": "success",
            "data": {
                "result": [
                    {
                        "metric": {"job": "a"},
                        "values": [[0.0, "1"], [10.0, "2"]]
                    }
                ]
            }
        });
        let mock = server
            .mock("GET", mockito::Matcher::Regex(r"^/api/v1/query_range.*".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let client = RemoteClient::new();
        let endpoint = format!("{}/api/v1/query_range", server.url());
        let result = client
            .query_range(&endpoint, "up", 0, 10_000, 10_000, 5_000, &[])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].samples, vec![(0, 1.0), (10_000, 2.0)]);
        assert_eq!(result[0].labels.get("job"), Some(&"a".to_string()));
    }

    #[tokio::test]
    async fn surfaces_remote_error_status() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({"status": "error", "error": "bad query"});
        let mock = server
            .mock("GET", mockito::Matcher::Regex(r"^/api/v1/query_range.*".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let client = RemoteClient::new();
        let endpoint = format!("{}/api/v1/query_range", server.url());
        let err = client
            .query_range(&endpoint, "up", 0, 10_000, 10_000, 5_000, &[])
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, Error::RemoteQueryError { .. }));
    }

    #[tokio::test]
    async fn invalid_endpoint_url_errors() {
        let client = RemoteClient::new();
        let err = client
            .query_range("not a url", "up", 0, 10_000, 10_000, 5_000, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl { .. }));
    }
}
