use std::time::Duration;

use reqwest::{StatusCode, Url};

use super::LedgerError;
use crate::domain::{RemotePatch, RemoteRecord};

/// JSON-over-HTTPS client for one account node of a realtime-database style
/// ledger (`{database_url}/Rooms/{room_id}.json`).
///
/// Every request is bounded by the client timeout; a timeout surfaces as
/// [`LedgerError::Unavailable`].
#[derive(Debug, Clone)]
pub struct RtdbClient {
    http: reqwest::Client,
    node_url: Url,
    auth_token: Option<String>,
}

impl RtdbClient {
    pub fn new(
        database_url: &str,
        room_id: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let mut node_url = Url::parse(database_url)
            .map_err(|e| LedgerError::Config(format!("invalid database url: {e}")))?;
        node_url
            .path_segments_mut()
            .map_err(|_| LedgerError::Config("database url cannot be a base".to_string()))?
            .pop_if_empty()
            .push("Rooms")
            .push(&format!("{room_id}.json"));

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            node_url,
            auth_token,
        })
    }

    pub fn node_url(&self) -> &Url {
        &self.node_url
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.query(&[("auth", token.as_str())]),
            None => req,
        }
    }

    /// Reads the whole account node.
    pub async fn fetch(&self) -> Result<RemoteRecord, LedgerError> {
        let resp = self
            .with_auth(self.http.get(self.node_url.clone()))
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        check_status(resp.status())?;

        let body = resp
            .bytes()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        let record: Option<RemoteRecord> =
            serde_json::from_slice(&body).map_err(|e| LedgerError::Malformed(e.to_string()))?;

        record.ok_or_else(|| LedgerError::Malformed("account node is empty".to_string()))
    }

    /// Merge-patches the populated fields of `patch` into the account node.
    pub async fn update(&self, patch: &RemotePatch) -> Result<(), LedgerError> {
        if patch.is_empty() {
            return Ok(());
        }

        let resp = self
            .with_auth(self.http.patch(self.node_url.clone()))
            .json(patch)
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        check_status(resp.status())
    }
}

fn check_status(status: StatusCode) -> Result<(), LedgerError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(LedgerError::Unavailable(format!("server responded {status}")))
    } else {
        tracing::debug!(%status, "ledger request rejected");
        Err(LedgerError::Rejected {
            status: status.as_u16(),
        })
    }
}
