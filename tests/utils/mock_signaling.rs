use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_call::signaling::{SignalingChannel, SignalingError, SignalingMessage};
use std::collections::HashSet;
use std::sync::Arc;

/// Umhüllt einen echten Kanal, protokolliert Sendungen, lässt gewählte Arten fehlschlagen
#[derive(Clone)]
pub struct ScriptedSignaling {
    inner: Arc<dyn SignalingChannel>,
    sent: Arc<Mutex<Vec<SignalingMessage>>>,
    failing: Arc<Mutex<HashSet<&'static str>>>,
}

impl ScriptedSignaling {
    pub fn new(inner: impl SignalingChannel + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
            sent: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Sendungen dieser Art schlagen ab jetzt fehl
    pub fn fail_kind(&self, kind: &'static str) {
        self.failing.lock().insert(kind);
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|m| m.payload.kind()).collect()
    }
}

#[async_trait]
impl SignalingChannel for ScriptedSignaling {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let kind = message.payload.kind();
        if self.failing.lock().contains(kind) {
            tracing::debug!("[ScriptedSignaling] dropping {}", kind);
            return Err(SignalingError::SendFailed(format!("{} rejected", kind)));
        }

        self.sent.lock().push(message.clone());
        self.inner.send(message).await
    }
}
