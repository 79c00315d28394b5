//! Model session
//!
//! Holds the connected model for one channel and the conversation running on
//! it. Reconfiguration is latest-wins: every build takes a ticket from a
//! counter, and a build that finishes after a newer one was requested is
//! thrown away. A new model always starts a new conversation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::ModelConfig;
use crate::conversation::ConversationContext;
use crate::core::Signal;
use crate::media::ImageInput;
use crate::providers::{GenerativeModel, ModelConnector, ProviderError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no model is configured for this channel")]
    Unavailable,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// A built model together with the configuration it was built from
#[derive(Clone)]
pub struct ModelHandle {
    generation: u64,
    config: ModelConfig,
    model: Arc<dyn GenerativeModel>,
}

impl ModelHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("generation", &self.generation)
            .field("model", &self.model.name())
            .finish()
    }
}

#[derive(Default)]
struct SessionState {
    handle: Option<ModelHandle>,
    context: Option<ConversationContext>,
}

pub struct ModelSession {
    connector: Arc<dyn ModelConnector>,
    latest: AtomicU64,
    state: Mutex<SessionState>,
    ready: Signal<bool>,
}

impl ModelSession {
    pub fn new(connector: Arc<dyn ModelConnector>) -> Self {
        Self {
            connector,
            latest: AtomicU64::new(0),
            state: Mutex::new(SessionState::default()),
            ready: Signal::new(false),
        }
    }

    /// Build a model for `config` and make it current.
    ///
    /// Returns `Ok(None)` when a newer configuration arrived while this one
    /// was being built.
    pub async fn configure(&self, config: ModelConfig) -> Result<Option<ModelHandle>, SessionError> {
        let generation = {
            let state = self.state.lock();
            let ticket = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(handle) = state.handle.as_ref().filter(|h| h.config == config) {
                tracing::debug!(model = %config.model, "Model configuration unchanged");
                return Ok(Some(handle.clone()));
            }
            ticket
        };

        let built = self.connector.connect(&config).await;

        let mut state = self.state.lock();
        if self.latest.load(Ordering::SeqCst) != generation {
            tracing::debug!(model = %config.model, generation, "Discarding stale model build");
            return Ok(None);
        }

        let model = match built {
            Ok(model) => model,
            Err(e) => {
                state.handle = None;
                state.context = None;
                self.ready.set(false);
                return Err(e.into());
            }
        };

        let handle = ModelHandle {
            generation,
            config,
            model,
        };
        state.handle = Some(handle.clone());
        state.context = None;
        self.ready.set(false);
        tracing::info!(model = %handle.config.model, generation, "Model session configured");
        Ok(Some(handle))
    }

    /// Start the conversation for `handle`, or return the one already running on it.
    ///
    /// Returns `None` if `handle` has been superseded.
    pub fn start_conversation(&self, handle: &ModelHandle) -> Option<ConversationContext> {
        let mut state = self.state.lock();
        if state.handle.as_ref().map(ModelHandle::generation) != Some(handle.generation) {
            return None;
        }

        let context = match &state.context {
            Some(ctx) if ctx.generation() == handle.generation => ctx.clone(),
            _ => {
                let ctx = ConversationContext::new(handle.generation);
                state.context = Some(ctx.clone());
                ctx
            }
        };
        self.ready.set(true);
        Some(context)
    }

    /// One turn of the running conversation
    pub async fn converse(&self, text: &str) -> Result<Option<String>, SessionError> {
        let (model, history, generation) = {
            let state = self.state.lock();
            let handle = state.handle.as_ref().ok_or(SessionError::Unavailable)?;
            let context = state.context.as_ref().ok_or(SessionError::Unavailable)?;
            (
                handle.model.clone(),
                context.messages().to_vec(),
                context.generation(),
            )
        };

        let reply = model.converse(&history, text).await?;

        if let Some(reply) = &reply {
            let mut state = self.state.lock();
            // The context may have been replaced by a new model meanwhile
            if let Some(context) = state
                .context
                .as_mut()
                .filter(|c| c.generation() == generation)
            {
                context.push_turn(text, reply);
            }
        }

        Ok(reply)
    }

    /// Stateless multimodal request; the conversation is not touched
    pub async fn generate(
        &self,
        prompt: &str,
        images: &[ImageInput],
    ) -> Result<Option<String>, SessionError> {
        let model = self
            .state
            .lock()
            .handle
            .as_ref()
            .map(|h| h.model.clone())
            .ok_or(SessionError::Unavailable)?;

        Ok(model.generate(prompt, images).await?)
    }

    /// Drop the model and conversation, cancelling any build in progress
    pub fn clear(&self) {
        let mut state = self.state.lock();
        self.latest.fetch_add(1, Ordering::SeqCst);
        state.handle = None;
        state.context = None;
        self.ready.set(false);
    }

    pub fn current(&self) -> Option<ModelHandle> {
        self.state.lock().handle.clone()
    }

    pub fn context(&self) -> Option<ConversationContext> {
        self.state.lock().context.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.get()
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }
}
