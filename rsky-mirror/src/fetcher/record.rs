use crate::http;
use crate::identity::IdentityResolver;
use crate::metrics;
use crate::record::Record;
use crate::types::{MirrorError, RecordFetchError};
use crate::uri::AtUri;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct GetRecordOutput {
    #[serde(default)]
    cid: Option<String>,
    value: serde_json::Value,
}

/// Fetches single records from their author's PDS via
/// `com.atproto.repo.getRecord`.
pub struct RecordFetcher {
    resolver: Arc<dyn IdentityResolver>,
    client: reqwest::Client,
}

impl RecordFetcher {
    pub fn new(resolver: Arc<dyn IdentityResolver>, timeout: Duration) -> Result<Self, MirrorError> {
        Ok(Self {
            resolver,
            client: http::client(timeout)?,
        })
    }

    /// Not-found, unreachable hosts and invalid payloads all surface as
    /// [`RecordFetchError`]; identity failures stay [`MirrorError::DidResolution`].
    pub async fn fetch(&self, uri: &AtUri) -> Result<Record, MirrorError> {
        let result = self.fetch_inner(uri).await;
        match &result {
            Ok(_) => metrics::FETCHER_RECORDS_FETCHED_TOTAL.inc(),
            Err(MirrorError::RecordFetch(e)) => {
                let kind = match e {
                    RecordFetchError::NotFound(_) => "not_found",
                    RecordFetchError::Unreachable { .. } => "unreachable",
                    RecordFetchError::Invalid { .. } => "invalid",
                };
                metrics::FETCHER_RECORD_ERRORS_TOTAL
                    .with_label_values(&[kind])
                    .inc();
            }
            Err(_) => metrics::FETCHER_RECORD_ERRORS_TOTAL
                .with_label_values(&["other"])
                .inc(),
        }
        result
    }

    async fn fetch_inner(&self, uri: &AtUri) -> Result<Record, MirrorError> {
        let identity = self.resolver.resolve(uri.did()).await?;
        let host_error = |reason: String| RecordFetchError::Unreachable {
            uri: uri.to_string(),
            reason,
        };

        let url = format!(
            "{}/xrpc/com.atproto.repo.getRecord",
            identity.pds.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .query(&[
                ("repo", uri.did()),
                ("collection", uri.collection()),
                ("rkey", uri.rkey()),
            ])
            .send()
            .await
            .map_err(|e| host_error(e.to_string()))?;

        let status = response.status();
        // PDSes answer a missing record with 400 RecordNotFound
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::BAD_REQUEST {
            return Err(RecordFetchError::NotFound(uri.to_string()).into());
        }
        if !status.is_success() {
            return Err(host_error(format!("getRecord returned {status}")).into());
        }

        let output: GetRecordOutput = response
            .json()
            .await
            .map_err(|e| host_error(format!("malformed getRecord response: {e}")))?;
        let cid = output
            .cid
            .ok_or_else(|| host_error("getRecord response carries no cid".to_owned()))?;

        Record::new(uri.clone(), cid, output.value).map_err(|e| match e {
            MirrorError::Validation(source) => RecordFetchError::Invalid {
                uri: uri.to_string(),
                source,
            }
            .into(),
            other => other,
        })
    }
}
