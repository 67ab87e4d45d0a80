use async_trait::async_trait;
use pulse_call::call_engine::{
    LocalStream, LocalTrack, MediaAcquisitionError, MediaCaptureProvider, MediaKind, TrackKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBehavior {
    Grant,
    /// Erste Aufnahme gelingt, jede weitere wird verweigert
    GrantOnce,
    Deny,
    /// Berechtigungsdialog, der nie beantwortet wird
    Hang,
}

/// Capture-Provider mit synthetischen Tracks und Zählern für Aufnahme/Freigabe
#[derive(Clone)]
pub struct MockCapture {
    behavior: CaptureBehavior,
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl MockCapture {
    pub fn new(behavior: CaptureBehavior) -> Self {
        Self {
            behavior,
            acquired: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCaptureProvider for MockCapture {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalStream, MediaAcquisitionError> {
        let behavior = match self.behavior {
            CaptureBehavior::GrantOnce if self.acquired() > 0 => CaptureBehavior::Deny,
            CaptureBehavior::GrantOnce => CaptureBehavior::Grant,
            other => other,
        };
        match behavior {
            CaptureBehavior::Grant => {
                self.acquired.fetch_add(1, Ordering::SeqCst);
                let tracks = kind
                    .track_kinds()
                    .iter()
                    .map(|k| match k {
                        TrackKind::Audio => LocalTrack::new_audio("mock-mic"),
                        TrackKind::Video => LocalTrack::new_video("mock-camera"),
                    })
                    .collect();
                Ok(LocalStream::new(tracks))
            }
            CaptureBehavior::Deny => Err(MediaAcquisitionError::PermissionDenied),
            CaptureBehavior::Hang => std::future::pending().await,
            CaptureBehavior::GrantOnce => Err(MediaAcquisitionError::PermissionDenied),
        }
    }

    async fn release(&self, _stream: LocalStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
