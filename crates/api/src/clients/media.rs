//! Media storage client
//!
//! Blob storage is a black box: bytes in, public URL out.

use async_trait::async_trait;
use serde::Deserialize;

use sketchforge_ledger::{LedgerError, LedgerResult, MediaStore};

#[derive(Debug, Deserialize)]
struct PutResponse {
    url: String,
}

pub struct HttpMediaStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMediaStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MediaStore for HttpMediaStore {
    async fn put(&self, bytes: &[u8], content_type: &str) -> LedgerResult<String> {
        let response = self
            .client
            .post(format!("{}/objects", self.base_url))
            .header("content-type", content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| LedgerError::StorageFailed(format!("transport: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::StorageFailed(format!(
                "storage returned {status}"
            )));
        }

        let stored: PutResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::StorageFailed(format!("bad response body: {e}")))?;

        Ok(stored.url)
    }
}
