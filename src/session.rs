//! Render sessions: one exclusive lease on a remote browser connection
//!
//! A [`RenderBackend`] opens sessions; a [`RenderSession`] drives one page
//! through navigation, settlement, and capture. [`SessionLease`] wraps a
//! session so that its release runs exactly once on every exit path.

use crate::{ByteStream, GenerateError};
use async_trait::async_trait;
use std::fmt;
use tracing::{debug, warn};
use url::Url;

/// Lifecycle of a render session
///
/// ```text
/// Idle -> Connecting -> PageReady -> Navigating -> AwaitingSettlement
///      -> Capturing -> Streaming -> Closed
/// ```
///
/// `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    PageReady,
    Navigating,
    AwaitingSettlement,
    Capturing,
    Streaming,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            // release() still closes the connection of a failed session
            return *self == Failed && next == Closed;
        }

        match (self, next) {
            (_, Failed) | (_, Closed) => true,
            (Idle, Connecting)
            | (Connecting, PageReady)
            | (PageReady, Navigating)
            | (Navigating, AwaitingSettlement)
            | (AwaitingSettlement, Capturing)
            | (Capturing, Streaming) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Opens render sessions against a remote browser-automation service.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    /// Connect, create a page, apply the render profile, and navigate to
    /// `url`. On failure the partially opened session has already been
    /// released.
    async fn open(&self, url: &Url) -> Result<Box<dyn RenderSession>, GenerateError>;
}

#[async_trait]
pub trait RenderSession: Send {
    fn state(&self) -> SessionState;

    /// Await settlement, switch to print rendering, and start streaming the
    /// document. The page must stay alive until the stream is drained, so
    /// only call `release` after the consumers are done.
    async fn capture(&mut self) -> Result<ByteStream, GenerateError>;

    /// Close the connection and detach observers. Idempotent.
    async fn release(&mut self);
}

/// Exclusive owner of an open session.
///
/// [`SessionLease::release`] consumes the lease. A lease dropped without
/// being released schedules the release on the runtime instead.
pub struct SessionLease {
    session: Option<Box<dyn RenderSession>>,
    label: String,
}

impl SessionLease {
    pub fn new(session: Box<dyn RenderSession>, label: impl Into<String>) -> Self {
        Self {
            session: Some(session),
            label: label.into(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(SessionState::Closed)
    }

    pub async fn capture(&mut self) -> Result<ByteStream, GenerateError> {
        match self.session.as_mut() {
            Some(session) => session.capture().await,
            None => Err(GenerateError::Render("session already released".into())),
        }
    }

    pub async fn release(mut self) {
        if let Some(mut session) = self.session.take() {
            debug!("Releasing render session for {}", self.label);
            session.release().await;
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            warn!("Render session for {} dropped without release", self.label);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        session.release().await;
                    });
                }
                Err(_) => warn!("No runtime available to release session for {}", self.label),
            }
        }
    }
}
