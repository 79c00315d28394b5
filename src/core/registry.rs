//! Open relays, one per channel id

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::binding::ChannelBinding;
use crate::providers::ModelConnector;

use super::relay::{Channel, RelayOrchestrator};

pub struct RelayRegistry {
    binding: Arc<ChannelBinding>,
    connector: Arc<dyn ModelConnector>,
    relays: RwLock<HashMap<String, Arc<RelayOrchestrator>>>,
}

impl RelayRegistry {
    pub fn new(binding: Arc<ChannelBinding>, connector: Arc<dyn ModelConnector>) -> Self {
        Self {
            binding,
            connector,
            relays: RwLock::new(HashMap::new()),
        }
    }

    /// Return the relay for `channel`, starting it if needed
    pub fn open(&self, channel: Channel) -> Arc<RelayOrchestrator> {
        let mut relays = self.relays.write();
        if let Some(existing) = relays.get(&channel.channel_id) {
            if existing.channel().channel_key != channel.channel_key {
                tracing::warn!(
                    channel_id = %channel.channel_id,
                    open_key = %existing.channel().channel_key,
                    requested_key = %channel.channel_key,
                    "Channel already open with a different key"
                );
            }
            return existing.clone();
        }

        let channel_id = channel.channel_id.clone();
        let relay = RelayOrchestrator::new(channel, self.binding.clone(), self.connector.clone());
        relay.start();
        relays.insert(channel_id, relay.clone());
        relay
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<RelayOrchestrator>> {
        self.relays.read().get(channel_id).cloned()
    }

    /// Tear down a relay, abandoning its in-flight requests
    pub async fn close(&self, channel_id: &str) -> bool {
        let relay = self.relays.write().remove(channel_id);
        match relay {
            Some(relay) => {
                relay.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let relays: Vec<_> = self.relays.write().drain().map(|(_, r)| r).collect();
        for relay in relays {
            relay.shutdown().await;
        }
    }

    pub fn binding(&self) -> &Arc<ChannelBinding> {
        &self.binding
    }

    pub fn len(&self) -> usize {
        self.relays.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.read().is_empty()
    }
}
