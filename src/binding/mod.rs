//! Channel binding
//!
//! Maps a channel key to a live model configuration and a channel id to the
//! transport that carries its messages.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::{ChannelsConfig, ModelConfig};
use crate::transport::{Ack, ChatTransport, OutboundMessage, TransportError};

/// Live per-key model configuration.
///
/// Every key has its own watch channel; subscribers see the current value
/// immediately and every later change. Setting an equal value does not
/// notify anyone.
pub struct ConfigStore {
    default: Option<ModelConfig>,
    entries: Mutex<HashMap<String, watch::Sender<Option<ModelConfig>>>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            default: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: ChannelsConfig) -> Self {
        let store = Self {
            default: config.default,
            entries: Mutex::new(HashMap::new()),
        };
        for (key, model) in config.channels {
            store.set(&key, model);
        }
        store
    }

    /// Returns true when subscribers were notified
    pub fn set(&self, key: &str, config: ModelConfig) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(tx) => tx.send_if_modified(|current| {
                if current.as_ref() == Some(&config) {
                    false
                } else {
                    *current = Some(config);
                    true
                }
            }),
            None => {
                let (tx, _) = watch::channel(Some(config));
                entries.insert(key.to_string(), tx);
                true
            }
        }
    }

    /// Mark a key as having no configuration
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(tx) => tx.send_if_modified(|current| current.take().is_some()),
            None => {
                let (tx, _) = watch::channel(None);
                entries.insert(key.to_string(), tx);
                false
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<ModelConfig> {
        match self.entries.lock().get(key) {
            Some(tx) => tx.borrow().clone(),
            None => self.default.clone(),
        }
    }

    pub fn subscribe(&self, key: &str) -> watch::Receiver<Option<ModelConfig>> {
        self.entries
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(self.default.clone()).0)
            .subscribe()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A conversation on the transport
#[derive(Clone)]
pub struct ChannelHandle {
    channel_id: String,
    transport: Arc<dyn ChatTransport>,
}

impl ChannelHandle {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub async fn send(&self, message: &OutboundMessage) -> Result<Ack, TransportError> {
        self.transport.send_message(message).await
    }

    pub fn watch_has_messages(&self) -> watch::Receiver<bool> {
        self.transport.watch_has_messages(&self.channel_id)
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

pub struct ChannelBinding {
    configs: Arc<ConfigStore>,
    transport: Arc<dyn ChatTransport>,
}

impl ChannelBinding {
    pub fn new(configs: Arc<ConfigStore>, transport: Arc<dyn ChatTransport>) -> Self {
        Self { configs, transport }
    }

    /// Subscribe to the model configuration of a channel key.
    /// `None` means no configuration is available.
    pub fn resolve(&self, channel_key: &str) -> watch::Receiver<Option<ModelConfig>> {
        self.configs.subscribe(channel_key)
    }

    pub fn channel_handle(&self, channel_id: &str) -> ChannelHandle {
        ChannelHandle {
            channel_id: channel_id.to_string(),
            transport: self.transport.clone(),
        }
    }

    pub fn configs(&self) -> &Arc<ConfigStore> {
        &self.configs
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }
}
