use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{AuditFilter, AuditLedger, AuditRecord, RecordId};
use crate::codec::format_timestamp;
use crate::error::{Error, Result};

/// Remote ledger service.
///
/// - `POST {base}/v1/records` with an [`AuditRecord`] body, answered by `{"record_id": ...}`
/// - `GET {base}/v1/records?offset=..&limit=..[&filter fields]`, answered by a JSON array of
///   records in append order
pub struct HttpLedger {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct AppendResponse {
    record_id: RecordId,
}

impl HttpLedger {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("ledger client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn records_url(&self) -> String {
        format!("{}/v1/records", self.base_url)
    }
}

fn query_pairs(filter: &AuditFilter, offset: usize, limit: usize) -> Vec<(&'static str, String)> {
    let mut pairs = vec![("offset", offset.to_string()), ("limit", limit.to_string())];
    if let Some(signer) = &filter.signer_id {
        pairs.push(("signer_id", signer.to_string()));
    }
    if let Some(agent_id) = &filter.agent_id {
        pairs.push(("agent_id", agent_id.to_string()));
    }
    if let Some(verified) = filter.verified {
        pairs.push(("verified", verified.to_string()));
    }
    if let Some(since) = filter.since {
        pairs.push(("since", format_timestamp(&since)));
    }
    if let Some(until) = filter.until {
        pairs.push(("until", format_timestamp(&until)));
    }
    pairs
}

fn unavailable(context: &str, e: impl std::fmt::Display) -> Error {
    Error::LedgerUnavailable(format!("{context}: {e}"))
}

#[async_trait]
impl AuditLedger for HttpLedger {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn append(&self, record: AuditRecord) -> Result<RecordId> {
        let resp = self
            .client
            .post(self.records_url())
            .json(&record)
            .send()
            .await
            .map_err(|e| unavailable("append request failed", e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::LedgerUnavailable(format!(
                "append returned {status}: {body}"
            )));
        }
        let body: AppendResponse = resp
            .json()
            .await
            .map_err(|e| unavailable("bad append response", e))?;
        Ok(body.record_id)
    }

    async fn fetch_page(
        &self,
        filter: &AuditFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AuditRecord>> {
        let resp = self
            .client
            .get(self.records_url())
            .query(&query_pairs(filter, offset, limit))
            .send()
            .await
            .map_err(|e| unavailable("fetch request failed", e))?;
        if !resp.status().is_success() {
            return Err(Error::LedgerUnavailable(format!(
                "fetch returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| unavailable("bad fetch response", e))
    }
}
