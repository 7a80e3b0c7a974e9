//! The recording session shared by all requests.
//!
//! There is exactly one [`SessionController`] per process. It cycles between
//! [`SessionState::Idle`] and [`SessionState::Recording`], and is the only
//! place that creates, swaps or retires an [`EncoderAdapter`].
//!
//! Locking:
//! - `state` (std mutex) guards the state enum, which carries the adapter.
//!   It is only held for short, synchronous sections and never across an
//!   await.
//! - `control` (async mutex) serialises `begin`, `end` and `shutdown`, so
//!   the old adapter is fully retired before a new one is spawned.
//!
//! Frames never take `control`: they snapshot the current adapter under
//! `state`, release it, and then queue for the adapter's write slot.
//! Control operations and frame writes run in spawned tasks, so a client
//! going away cannot interrupt them halfway.

use log::{debug, info, trace, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinError;

use crate::encoder::{EncoderAdapter, EncoderError, EncoderSettings, Geometry, Placement};
use crate::frame::{FrameError, FramePayload};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No recording in progress")]
    NotRecording,
    #[error("{0}")]
    Frame(#[from] FrameError),
    #[error("{0}")]
    Encoder(#[from] EncoderError),
    #[error("Session state lock poisoned")]
    Poisoned,
    #[error("Session task failed: {0}")]
    Task(#[from] JoinError),
}

/// Lifecycle of the session; the adapter only exists while recording.
#[derive(Debug, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Recording { adapter: Arc<EncoderAdapter> },
}

/// Answer to a `ping`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionStatus {
    pub recording: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
}

pub type SharedSession = Arc<SessionController>;

pub struct SessionController {
    settings: EncoderSettings,
    state: Mutex<SessionState>,
    control: tokio::sync::Mutex<()>,
}

impl SessionController {
    pub fn new(settings: EncoderSettings) -> Self {
        SessionController {
            settings,
            state: Mutex::new(SessionState::Idle),
            control: tokio::sync::Mutex::new(()),
        }
    }

    pub fn shared(settings: EncoderSettings) -> SharedSession {
        Arc::new(Self::new(settings))
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, SessionState>, SessionError> {
        self.state.lock().map_err(|_| SessionError::Poisoned)
    }

    fn take_adapter(&self) -> Result<Option<Arc<EncoderAdapter>>, SessionError> {
        let mut state = self.lock_state()?;
        match std::mem::take(&mut *state) {
            SessionState::Idle => Ok(None),
            SessionState::Recording { adapter } => Ok(Some(adapter)),
        }
    }

    fn current_adapter(&self) -> Result<Option<Arc<EncoderAdapter>>, SessionError> {
        let state = self.lock_state()?;
        match &*state {
            SessionState::Idle => Ok(None),
            SessionState::Recording { adapter } => Ok(Some(adapter.clone())),
        }
    }

    /// Liveness query; never changes state.
    pub fn ping(&self) -> Result<SessionStatus, SessionError> {
        let adapter = self.current_adapter()?;
        Ok(SessionStatus {
            recording: adapter.is_some(),
            geometry: adapter.map(|a| *a.geometry()),
        })
    }

    pub fn is_idle(&self) -> Result<bool, SessionError> {
        Ok(self.current_adapter()?.is_none())
    }

    /// Start a new recording, retiring the current one first.
    ///
    /// The retired recording's output path is logged and not returned.
    pub async fn begin(self: &Arc<Self>, geometry: Geometry) -> Result<(), SessionError> {
        let session = self.clone();
        tokio::spawn(async move { session.start_recording(geometry).await }).await?
    }

    /// Finish the current recording and return its output path.
    ///
    /// Idle sessions return `None` and nothing is created.
    pub async fn end(self: &Arc<Self>) -> Result<Option<PathBuf>, SessionError> {
        let session = self.clone();
        tokio::spawn(async move { session.finish_recording().await }).await?
    }

    /// Hand one frame to the active recording.
    ///
    /// The adapter's write slot is taken before decoding, so frames reach
    /// the encoder in the order they arrived regardless of how long each
    /// takes to decode.
    pub async fn feed(&self, payload: FramePayload) -> Result<Placement, SessionError> {
        let adapter = self.current_adapter()?.ok_or(SessionError::NotRecording)?;

        let slot = adapter.reserve().await;
        let geometry = *slot.geometry();
        let pixels =
            tokio::task::spawn_blocking(move || payload.into_pixels(&geometry)).await??;

        let placement = slot.write(pixels).await;
        trace!("Frame {:?} for {}", placement, adapter.output_path().display());
        Ok(placement)
    }

    /// Retire any active recording; used when the server stops.
    pub async fn shutdown(self: &Arc<Self>) -> Result<Option<PathBuf>, SessionError> {
        let session = self.clone();
        tokio::spawn(async move { session.stop_recording().await }).await?
    }

    // The control operations below run in tasks of their own: once an
    // adapter is taken out of the state it is always finalized and reaped,
    // even if the request that asked for it goes away.

    async fn start_recording(&self, geometry: Geometry) -> Result<(), SessionError> {
        let _control = self.control.lock().await;

        if let Some(previous) = self.take_adapter()? {
            match previous.finalize().await {
                Ok(Some(path)) => warn!(
                    "Recording {} superseded by a new begin, output left at {}",
                    previous.geometry(),
                    path.display()
                ),
                Ok(None) => {}
                Err(e) => warn!("Superseded encoder did not finish cleanly: {}", e),
            }
        }

        let adapter = Arc::new(EncoderAdapter::spawn(&self.settings, geometry)?);
        let mut state = self.lock_state()?;
        *state = SessionState::Recording { adapter };
        info!("Recording started at {}", geometry);
        Ok(())
    }

    async fn finish_recording(&self) -> Result<Option<PathBuf>, SessionError> {
        let _control = self.control.lock().await;

        let Some(adapter) = self.take_adapter()? else {
            debug!("End requested while idle");
            return Ok(None);
        };
        let path = adapter.finalize().await?;
        if let Some(path) = &path {
            info!(
                "Recording finished: {} frames in {}",
                adapter.frames_written(),
                path.display()
            );
        }
        Ok(path)
    }

    async fn stop_recording(&self) -> Result<Option<PathBuf>, SessionError> {
        let _control = self.control.lock().await;

        let Some(adapter) = self.take_adapter()? else {
            return Ok(None);
        };
        let path = adapter.finalize().await?;
        if let Some(path) = &path {
            info!(
                "Recording in progress at shutdown saved to {} ({} frames)",
                path.display(),
                adapter.frames_written()
            );
        }
        Ok(path)
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> Option<Arc<EncoderAdapter>> {
        self.current_adapter().unwrap()
    }
}
