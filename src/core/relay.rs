//! Relay orchestrator
//!
//! The RelayOrchestrator is the core of a relayed channel. For every inbound
//! user message it:
//! 1. Marks the message as pending
//! 2. Preprocesses image attachments, if any
//! 3. Asks the model (a conversation turn for text, a one-off multimodal
//!    request for images)
//! 4. Posts the reply back into the channel, marked as generated
//! 5. Settles the pending marker and the error state
//!
//! It also follows the channel's model configuration and rebuilds the model
//! session whenever that configuration changes.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::binding::{ChannelBinding, ChannelHandle};
use crate::config::ModelConfig;
use crate::media::{Attachment, AttachmentPreprocessor, MediaError};
use crate::providers::{ModelConnector, ProviderError};
use crate::session::{ModelSession, SessionError};
use crate::transport::{OutboundMessage, TransportError};

use super::pending::PendingSet;
use super::signal::Signal;

const MULTIMODAL_PROMPT: &str = "Look at the image(s), and then answer the following question: ";

/// A relayed conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Conversation id on the transport
    pub channel_id: String,
    /// Key used to look up the model configuration
    pub channel_key: String,
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, channel_key: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_key: channel_key.into(),
        }
    }
}

/// A user message arriving from the channel
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Transport message id; also the pending and idempotency key
    pub id: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl InboundMessage {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Errors from a single dispatch
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no model configuration is available")]
    ConfigUnavailable,

    #[error(transparent)]
    Decode(#[from] MediaError),

    #[error(transparent)]
    Backend(ProviderError),

    #[error(transparent)]
    Publish(#[from] TransportError),

    #[error("request cancelled")]
    Cancelled,
}

impl From<SessionError> for RelayError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Unavailable => RelayError::ConfigUnavailable,
            SessionError::Provider(e) => RelayError::Backend(e),
        }
    }
}

/// How a dispatch ended
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The reply was posted to the channel
    Published(OutboundMessage),
    /// The model produced no text
    NoContent,
    /// No model session exists for the channel
    Unavailable,
    /// A request with the same id is already in flight
    Duplicate,
    /// The error message now shown to the user
    Failed(String),
    /// The channel was torn down
    Cancelled,
}

pub struct RelayOrchestrator {
    channel: Channel,
    handle: ChannelHandle,
    binding: Arc<ChannelBinding>,
    session: Arc<ModelSession>,
    preprocessor: AttachmentPreprocessor,
    pending: PendingSet,
    error_message: Signal<String>,
    has_no_messages: Signal<bool>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl RelayOrchestrator {
    pub fn new(
        channel: Channel,
        binding: Arc<ChannelBinding>,
        connector: Arc<dyn ModelConnector>,
    ) -> Arc<Self> {
        let handle = binding.channel_handle(&channel.channel_id);
        Arc::new(Self {
            channel,
            handle,
            binding,
            session: Arc::new(ModelSession::new(connector)),
            preprocessor: AttachmentPreprocessor::new(),
            pending: PendingSet::new(),
            error_message: Signal::new(String::new()),
            has_no_messages: Signal::new(false),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start following the channel's model configuration and message state
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut configs = self.binding.resolve(&self.channel.channel_key);
        // Builds run on this task, so a newer configuration always drops the
        // build of an older one
        self.tasks.spawn(async move {
            loop {
                let config = configs.borrow_and_update().clone();
                tokio::select! {
                    biased;
                    _ = this.cancel.cancelled() => break,
                    changed = configs.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = this.apply_config(config) => {}
                }

                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    changed = configs.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let this = self.clone();
        let mut has_messages = self.handle.watch_has_messages();
        self.tasks.spawn(async move {
            loop {
                let has = *has_messages.borrow_and_update();
                this.has_no_messages.set(!has);
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    changed = has_messages.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tracing::info!(
            channel_id = %self.channel.channel_id,
            channel_key = %self.channel.channel_key,
            "Relay started"
        );
    }

    async fn apply_config(&self, config: Option<ModelConfig>) {
        let Some(config) = config else {
            tracing::info!(channel_key = %self.channel.channel_key, "No model configuration, session cleared");
            self.session.clear();
            self.pending.set_ready(false);
            return;
        };

        let configured = self.session.configure(config).await;
        match configured {
            Ok(Some(handle)) => {
                self.session.start_conversation(&handle);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    channel_key = %self.channel.channel_key,
                    error = %e,
                    "Failed to configure model"
                );
            }
        }
        self.pending.set_ready(self.session.is_ready());
    }

    /// Dispatch on the relay's task group
    pub fn dispatch(self: &Arc<Self>, message: InboundMessage) -> JoinHandle<DispatchOutcome> {
        let this = self.clone();
        self.tasks.spawn(async move { this.dispatch_now(message).await })
    }

    /// Dispatch and wait for the outcome
    pub async fn dispatch_now(&self, message: InboundMessage) -> DispatchOutcome {
        if self.cancel.is_cancelled() {
            return DispatchOutcome::Cancelled;
        }
        if !self.session.is_ready() {
            tracing::debug!(message_id = %message.id, "No model session, ignoring message");
            return DispatchOutcome::Unavailable;
        }
        if !self.pending.add(&message.id) {
            tracing::debug!(message_id = %message.id, "Message already in flight");
            return DispatchOutcome::Duplicate;
        }

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RelayError::Cancelled),
            result = self.relay(&message) => result,
        };

        let outcome = match result {
            Ok(Some(reply)) => {
                self.pending.remove(&message.id);
                self.error_message.set(String::new());
                DispatchOutcome::Published(reply)
            }
            Ok(None) => {
                self.pending.remove(&message.id);
                tracing::debug!(message_id = %message.id, "Model returned no content");
                DispatchOutcome::NoContent
            }
            Err(RelayError::Cancelled) => {
                self.pending.remove(&message.id);
                DispatchOutcome::Cancelled
            }
            Err(RelayError::ConfigUnavailable) => {
                self.pending.remove(&message.id);
                DispatchOutcome::Unavailable
            }
            Err(e) => {
                // Every pending marker goes, including those of unrelated requests
                self.pending.clear_all();
                let message_text = e.to_string();
                tracing::warn!(
                    channel_id = %self.channel.channel_id,
                    message_id = %message.id,
                    error = %message_text,
                    "Relay failed"
                );
                self.error_message.replace(message_text.clone());
                DispatchOutcome::Failed(message_text)
            }
        };

        outcome
    }

    async fn relay(&self, message: &InboundMessage) -> Result<Option<OutboundMessage>, RelayError> {
        let reply = if message.attachments.is_empty() {
            self.session.converse(&message.text).await?
        } else {
            let images = self.preprocessor.process_all(&message.attachments)?;
            let prompt = format!("{}{}", MULTIMODAL_PROMPT, message.text);
            self.session.generate(&prompt, &images).await?
        };

        let Some(text) = reply else {
            return Ok(None);
        };

        let outbound = OutboundMessage::generated(self.handle.channel_id(), text);
        self.handle.send(&outbound).await?;

        tracing::info!(
            channel_id = %self.channel.channel_id,
            message_id = %message.id,
            reply_id = %outbound.id,
            "Relayed model reply"
        );
        Ok(Some(outbound))
    }

    /// Cancel all in-flight work and wait for it to stop
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!(channel_id = %self.channel.channel_id, "Relay stopped");
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn session(&self) -> &ModelSession {
        &self.session
    }

    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_loading()
    }

    pub fn error_message(&self) -> String {
        self.error_message.get()
    }

    pub fn has_no_messages(&self) -> bool {
        self.has_no_messages.get()
    }

    pub fn subscribe_loading(&self) -> watch::Receiver<bool> {
        self.pending.subscribe_loading()
    }

    pub fn subscribe_error(&self) -> watch::Receiver<String> {
        self.error_message.subscribe()
    }

    pub fn subscribe_has_no_messages(&self) -> watch::Receiver<bool> {
        self.has_no_messages.subscribe()
    }

    /// Resolves once a model session is ready
    pub async fn ready(&self) {
        let mut ready = self.session.subscribe_ready();
        let _ = ready.wait_for(|r| *r).await;
    }
}
