//! Persistent device identity.
//!
//! Each install owns a random device id and a six-digit pairing code,
//! both minted once and kept across restarts in a JSON file next to the
//! binary. Server-pushed data updates overwrite memory and history but
//! never the identity fields.

use crate::{CompaniaError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Everything the device remembers about itself and its user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_code: String,
    #[serde(default)]
    pub user_memory: Value,
    #[serde(default)]
    pub conversation_history: Value,
    /// Chat id of the paired contact, once a connection is approved.
    #[serde(default)]
    pub connected_chat: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl DeviceRecord {
    fn mint() -> Self {
        let now = Utc::now();
        Self {
            device_id: mint_device_id(),
            device_code: mint_device_code(),
            user_memory: Value::Object(Default::default()),
            conversation_history: Value::Array(Default::default()),
            connected_chat: None,
            created_at: now,
            last_updated: now,
        }
    }
}

fn mint_device_id() -> String {
    let mut rng = rand::thread_rng();
    format!("device_{:06}", rng.gen_range(0..1_000_000u32))
}

fn mint_device_code() -> String {
    let mut rng = rand::thread_rng();
    format!("{:06}", rng.gen_range(0..1_000_000u32))
}

/// File-backed store shared between the coordinator and the network tasks.
#[derive(Debug, Clone)]
pub struct DeviceStore {
    path: PathBuf,
    record: Arc<RwLock<DeviceRecord>>,
}

impl DeviceStore {
    /// Load the record from `path`, or mint and persist a fresh one. A
    /// corrupt file is treated as a fresh install.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let record = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<DeviceRecord>(&raw) {
                Ok(record) => {
                    debug!(device_id = %record.device_id, "device record loaded");
                    record
                }
                Err(e) => {
                    info!("device record unreadable ({}), minting a new one", e);
                    DeviceRecord::mint()
                }
            },
            Err(_) => {
                info!("no device record found, minting a new one");
                DeviceRecord::mint()
            }
        };
        let store = Self {
            path,
            record: Arc::new(RwLock::new(record)),
        };
        store.save()?;
        Ok(store)
    }

    pub fn record(&self) -> DeviceRecord {
        self.record.read().clone()
    }

    pub fn device_id(&self) -> String {
        self.record.read().device_id.clone()
    }

    pub fn device_code(&self) -> String {
        self.record.read().device_code.clone()
    }

    /// Apply a server data update. Identity fields are preserved.
    pub fn apply_update(&self, user_memory: Value, conversation_history: Value) -> Result<()> {
        {
            let mut record = self.record.write();
            if !user_memory.is_null() {
                record.user_memory = user_memory;
            }
            if !conversation_history.is_null() {
                record.conversation_history = conversation_history;
            }
            record.last_updated = Utc::now();
        }
        self.save()
    }

    /// The server is authoritative for pairing: adopt the identity it
    /// reports when it differs from the local record.
    pub fn adopt_identity(
        &self,
        device_id: &str,
        device_code: &str,
        connected_chat: Option<i64>,
    ) -> Result<()> {
        {
            let mut record = self.record.write();
            if record.device_id == device_id
                && record.device_code == device_code
                && record.connected_chat == connected_chat
            {
                return Ok(());
            }
            record.device_id = device_id.to_string();
            record.device_code = device_code.to_string();
            record.connected_chat = connected_chat;
            record.last_updated = Utc::now();
        }
        self.save()
    }

    /// Remember the chat this device is paired with.
    pub fn set_connected_chat(&self, chat_id: Option<i64>) -> Result<()> {
        {
            let mut record = self.record.write();
            if record.connected_chat == chat_id {
                return Ok(());
            }
            record.connected_chat = chat_id;
            record.last_updated = Utc::now();
        }
        self.save()
    }

    /// Mint a new pairing code, keeping the device id.
    pub fn regenerate_code(&self) -> Result<String> {
        let code = mint_device_code();
        {
            let mut record = self.record.write();
            record.device_code = code.clone();
            record.last_updated = Utc::now();
        }
        self.save()?;
        Ok(code)
    }

    fn save(&self) -> Result<()> {
        let record = self.record.read().clone();
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| CompaniaError::StorageError(e.to_string()))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}
