//! `PromQlRemoteExec`: the leaf that serializes a logical-plan fragment as
//! PromQL text and issues it to a remote partition.
use data_types::RangeVectorKey;
use remote_client::RemoteClient;

use crate::error::{QueryError, Result};
use crate::range_vector::RangeVector;

#[derive(Debug, Clone)]
pub struct PromQlRemoteExec {
    pub endpoint: String,
    pub query: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub step_ms: i64,
    pub timeout_ms: u64,
    pub url_params: Vec<(String, String)>,
}

impl PromQlRemoteExec {
    pub async fn execute(&self, client: &RemoteClient) -> Result<Vec<RangeVector>> {
        let series = client
            .query_range(
                &self.endpoint,
                &self.query,
                self.start_ms,
                self.end_ms,
                self.step_ms,
                self.timeout_ms,
                &self.url_params,
            )
            .await
            .map_err(|e| QueryError::RemoteError {
                message: e.to_string(),
            })?;

        Ok(series
            .into_iter()
            .map(|s| RangeVector::from_rows(RangeVectorKey::new(s.labels), s.samples))
            .collect())
    }
}
