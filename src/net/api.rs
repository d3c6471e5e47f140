//! HTTP client for the companion backend.

use crate::messages::wire::{FamilyInbox, MemoryChest};
use crate::{CompaniaError, Result};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin wrapper over the REST endpoints. All calls carry the device id as
/// a query parameter.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    device_id: String,
}

impl ApiClient {
    pub fn new(base: impl Into<String>, device_id: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CompaniaError::ApiError(e.to_string()))?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            device_id: device_id.into(),
        })
    }

    /// Fetch the memory chest contents.
    pub async fn fetch_memory_chest(&self) -> Result<MemoryChest> {
        let url = format!("{}/memory/cofre", self.base);
        let chest = self
            .http
            .get(&url)
            .query(&[("device_id", &self.device_id)])
            .send()
            .await
            .map_err(|e| CompaniaError::ApiError(e.to_string()))?
            .error_for_status()
            .map_err(|e| CompaniaError::ApiError(e.to_string()))?
            .json::<MemoryChest>()
            .await
            .map_err(|e| CompaniaError::ApiError(e.to_string()))?;
        debug!(memories = chest.important_memories.len(), "memory chest fetched");
        Ok(chest)
    }

    /// Fetch the family inbox.
    pub async fn fetch_family_messages(&self) -> Result<FamilyInbox> {
        let url = format!("{}/family/messages", self.base);
        let inbox = self
            .http
            .get(&url)
            .query(&[("device_id", &self.device_id)])
            .send()
            .await
            .map_err(|e| CompaniaError::ApiError(e.to_string()))?
            .error_for_status()
            .map_err(|e| CompaniaError::ApiError(e.to_string()))?
            .json::<FamilyInbox>()
            .await
            .map_err(|e| CompaniaError::ApiError(e.to_string()))?;
        debug!(
            total = inbox.all_messages.len(),
            unread = inbox.unread_count(),
            "family inbox fetched"
        );
        Ok(inbox)
    }

    /// Mark one message as read.
    pub async fn mark_message_read(&self, message_id: i64) -> Result<()> {
        let url = format!("{}/family/messages/{}/read", self.base, message_id);
        self.http
            .post(&url)
            .query(&[("device_id", &self.device_id)])
            .send()
            .await
            .map_err(|e| CompaniaError::ApiError(e.to_string()))?
            .error_for_status()
            .map_err(|e| CompaniaError::ApiError(e.to_string()))?;
        debug!(message_id, "message marked read");
        Ok(())
    }
}
