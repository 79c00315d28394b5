//! Scriptable fakes for the model and transport seams

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::config::ModelConfig;
use crate::conversation::Message;
use crate::media::ImageInput;
use crate::providers::{GenerativeModel, ModelConnector, ProviderError};
use crate::transport::{Ack, ChatTransport, InMemoryTransport, OutboundMessage, TransportError};

/// How a [`MockModel`] answers a given text or prompt
#[derive(Clone)]
pub enum Reply {
    Text(String),
    Empty,
    Fail(String),
    /// Wait for the gate, then answer
    Gated(Arc<Notify>, String),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Reply::Fail(message.into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Converse { history_len: usize, text: String },
    Generate { prompt: String, images: Vec<ImageInput> },
}

pub struct MockModel {
    name: String,
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<Call>>,
    started: watch::Sender<usize>,
}

impl MockModel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            started: watch::channel(0).0,
        }
    }

    /// Script the answer for a converse text or generate prompt
    pub fn reply(&self, key: &str, reply: Reply) -> &Self {
        self.replies.lock().insert(key.to_string(), reply);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn converse_history_lens(&self) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Converse { history_len, .. } => Some(history_len),
                Call::Generate { .. } => None,
            })
            .collect()
    }

    pub fn generate_prompts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Generate { prompt, .. } => Some(prompt),
                Call::Converse { .. } => None,
            })
            .collect()
    }

    /// Resolves once `n` calls have reached the model
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.started.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    async fn answer(&self, key: &str, call: Call) -> Result<Option<String>, ProviderError> {
        self.calls.lock().push(call);
        self.started.send_modify(|count| *count += 1);

        let reply = self.replies.lock().get(key).cloned();
        match reply {
            None => Ok(Some(format!("echo: {}", key))),
            Some(Reply::Text(text)) => Ok(Some(text)),
            Some(Reply::Empty) => Ok(None),
            Some(Reply::Fail(message)) => Err(ProviderError::Backend(message)),
            Some(Reply::Gated(gate, text)) => {
                gate.notified().await;
                Ok(Some(text))
            }
        }
    }
}

#[async_trait]
impl GenerativeModel for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn converse(
        &self,
        history: &[Message],
        text: &str,
    ) -> Result<Option<String>, ProviderError> {
        let call = Call::Converse {
            history_len: history.len(),
            text: text.to_string(),
        };
        self.answer(text, call).await
    }

    async fn generate(
        &self,
        prompt: &str,
        images: &[ImageInput],
    ) -> Result<Option<String>, ProviderError> {
        let call = Call::Generate {
            prompt: prompt.to_string(),
            images: images.to_vec(),
        };
        self.answer(prompt, call).await
    }
}

/// Hands out one [`MockModel`] per model name and counts builds
pub struct MockConnector {
    models: Mutex<HashMap<String, Arc<MockModel>>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    failing: Mutex<HashSet<String>>,
    builds: watch::Sender<usize>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            models: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            builds: watch::channel(0).0,
        }
    }

    pub fn model(&self, name: &str) -> Arc<MockModel> {
        self.models
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MockModel::new(name)))
            .clone()
    }

    /// Builds of `name` block until the returned gate is notified
    pub fn gate(&self, name: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().insert(name.to_string(), gate.clone());
        gate
    }

    pub fn fail_builds(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    pub fn builds(&self) -> usize {
        *self.builds.borrow()
    }

    pub async fn wait_for_builds(&self, n: usize) {
        let mut rx = self.builds.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

#[async_trait]
impl ModelConnector for MockConnector {
    async fn connect(
        &self,
        config: &ModelConfig,
    ) -> Result<Arc<dyn GenerativeModel>, ProviderError> {
        self.builds.send_modify(|count| *count += 1);

        let gate = self.gates.lock().get(&config.model).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.failing.lock().contains(&config.model) {
            return Err(ProviderError::NotConfigured(config.model.clone()));
        }
        Ok(self.model(&config.model))
    }
}

/// Records messages like [`InMemoryTransport`] but can be told to reject sends
#[derive(Default)]
pub struct FlakyTransport {
    inner: InMemoryTransport,
    reject: Mutex<Option<String>>,
}

impl FlakyTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_with(&self, reason: &str) {
        *self.reject.lock() = Some(reason.to_string());
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<OutboundMessage> {
        self.inner.messages(conversation_id)
    }
}

#[async_trait]
impl ChatTransport for FlakyTransport {
    async fn send_message(&self, message: &OutboundMessage) -> Result<Ack, TransportError> {
        let reject = self.reject.lock().clone();
        if let Some(reason) = reject {
            return Err(TransportError::Rejected {
                message_id: message.id.clone(),
                reason,
            });
        }
        self.inner.send_message(message).await
    }

    fn watch_has_messages(&self, conversation_id: &str) -> watch::Receiver<bool> {
        self.inner.watch_has_messages(conversation_id)
    }
}

/// Poll `condition` until it holds, panicking after two seconds
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

/// An encoded PNG of the given size
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 120, 40, 255]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("png encoding");
    out.into_inner()
}
