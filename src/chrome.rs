//! Remote Chrome backend built on chromiumoxide
//!
//! Connects to a remote browser-automation endpoint over the DevTools
//! protocol, renders one page per session, and streams the printed document
//! back through `IO.read` so it is never buffered whole.

use crate::session::{RenderBackend, RenderSession, SessionState};
use crate::settlement::{ObserverTap, ResourceEvent, SettlementDetector};
use crate::{ByteStream, Config, GenerateError, RenderProfile, READ_CHUNK_SIZE};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetEmulatedMediaParams,
};
use chromiumoxide::cdp::browser_protocol::io::{CloseParams, ReadParams, StreamHandle};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, ResourceType,
    SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{PrintToPdfParams, PrintToPdfTransferMode};
use chromiumoxide::page::Page;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use url::Url;

/// Opens [`ChromeSession`]s against the configured remote endpoint.
pub struct ChromeBackend {
    connection_url: Url,
    profile: RenderProfile,
}

impl ChromeBackend {
    /// Fails with [`GenerateError::Configuration`] when the endpoint or token
    /// is missing.
    pub fn new(config: &Config) -> Result<Self, GenerateError> {
        Ok(Self {
            connection_url: config.browser.connection_url()?,
            profile: config.render.clone(),
        })
    }

    pub fn endpoint_host(&self) -> Option<&str> {
        self.connection_url.host_str()
    }
}

#[async_trait]
impl RenderBackend for ChromeBackend {
    async fn open(&self, url: &Url) -> Result<Box<dyn RenderSession>, GenerateError> {
        let mut session = ChromeSession::new(self.profile.clone(), url.clone());

        match session.open(&self.connection_url).await {
            Ok(()) => Ok(Box::new(session)),
            Err(e) => {
                session.set_state(SessionState::Failed);
                session.release().await;
                Err(e)
            }
        }
    }
}

pub struct ChromeSession {
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
    page: Option<Page>,
    state: SessionState,
    profile: RenderProfile,
    url: Url,
}

impl ChromeSession {
    fn new(profile: RenderProfile, url: Url) -> Self {
        Self {
            browser: None,
            handler: None,
            page: None,
            state: SessionState::Idle,
            profile,
            url,
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!("Unexpected session transition {} -> {}", self.state, next);
        }
        debug!("Session for {}: {} -> {}", self.url, self.state, next);
        self.state = next;
    }

    async fn open(&mut self, connection_url: &Url) -> Result<(), GenerateError> {
        self.set_state(SessionState::Connecting);
        info!(
            "Connecting to remote browser at {}",
            connection_url.host_str().unwrap_or("<unknown>")
        );

        let (browser, mut handler) = Browser::connect(connection_url.as_str())
            .await
            .map_err(|e| GenerateError::UpstreamConnection(e.to_string()))?;

        // The handler must be polled for the connection to make progress
        self.handler = Some(tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Browser handler error: {}", e);
                    break;
                }
            }
            debug!("Browser handler stream ended");
        }));

        let page = browser.new_page("about:blank").await;
        self.browser = Some(browser);
        let page = page.map_err(|e| GenerateError::UpstreamConnection(e.to_string()))?;

        self.apply_profile(&page).await?;
        self.page = Some(page.clone());
        self.set_state(SessionState::PageReady);

        self.set_state(SessionState::Navigating);
        let limit = self.profile.navigation_timeout;
        match timeout(limit, page.goto(self.url.as_str())).await {
            Ok(Ok(_)) => {
                debug!("Navigated to {}", self.url);
                Ok(())
            }
            Ok(Err(e)) => Err(GenerateError::Navigation(e.to_string())),
            Err(_) => Err(GenerateError::NavigationTimeout {
                url: self.url.to_string(),
                timeout: limit,
            }),
        }
    }

    async fn apply_profile(&self, page: &Page) -> Result<(), GenerateError> {
        let viewport = &self.profile.viewport;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(false)
            .build()
            .map_err(GenerateError::UpstreamConnection)?;

        page.execute(metrics)
            .await
            .map_err(|e| GenerateError::UpstreamConnection(e.to_string()))?;

        page.execute(SetUserAgentOverrideParams::new(self.profile.user_agent.clone()))
            .await
            .map_err(|e| GenerateError::UpstreamConnection(e.to_string()))?;

        Ok(())
    }

    async fn print(&self, page: &Page) -> Result<StreamHandle, GenerateError> {
        page.execute(SetEmulatedMediaParams {
            media: Some("print".to_string()),
            ..Default::default()
        })
        .await
        .map_err(|e| GenerateError::Render(e.to_string()))?;

        let params = PrintToPdfParams {
            print_background: Some(self.profile.print_background),
            prefer_css_page_size: Some(true),
            transfer_mode: Some(PrintToPdfTransferMode::ReturnAsStream),
            ..Default::default()
        };

        let response = page
            .execute(params)
            .await
            .map_err(|e| GenerateError::Render(e.to_string()))?;

        response
            .result
            .stream
            .ok_or_else(|| GenerateError::Render("remote service returned no stream handle".into()))
    }
}

#[async_trait]
impl RenderSession for ChromeSession {
    fn state(&self) -> SessionState {
        self.state
    }

    async fn capture(&mut self) -> Result<ByteStream, GenerateError> {
        let Some(page) = self.page.clone() else {
            return Err(GenerateError::Render("session has no open page".into()));
        };

        self.set_state(SessionState::AwaitingSettlement);
        let detector = SettlementDetector::new(
            self.profile.settlement_timeout,
            self.profile.settlement_debounce,
        );
        match ChromeNetworkTap::attach(&page).await {
            Ok(mut tap) => {
                detector.wait(&mut tap).await;
            }
            Err(e) => warn!("Could not observe network for {}: {}", self.url, e),
        }
        sleep(self.profile.settle_delay).await;

        self.set_state(SessionState::Capturing);
        match self.print(&page).await {
            Ok(handle) => {
                self.set_state(SessionState::Streaming);
                Ok(read_stream(page, handle))
            }
            Err(e) => {
                self.set_state(SessionState::Failed);
                Err(e)
            }
        }
    }

    async fn release(&mut self) {
        self.page = None;

        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                debug!("Remote browser close for {} failed: {}", self.url, e);
            }
        }

        if let Some(handler) = self.handler.take() {
            handler.abort();
        }

        if self.state != SessionState::Closed {
            self.set_state(SessionState::Closed);
            info!("Render session for {} closed", self.url);
        }
    }
}

/// Image request observer scoped to one settlement wait.
///
/// Listeners are dropped on `detach` or, failing that, with the tap itself.
pub struct ChromeNetworkTap {
    events: Option<BoxStream<'static, ResourceEvent>>,
}

impl ChromeNetworkTap {
    pub async fn attach(page: &Page) -> Result<Self, GenerateError> {
        let started = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|e| GenerateError::Render(e.to_string()))?
            .map(|e| request_started(e.request_id.inner().clone(), e.r#type.as_ref()));

        let finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(|e| GenerateError::Render(e.to_string()))?
            .map(|e| ResourceEvent::Finished {
                id: e.request_id.inner().clone(),
            });

        let failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(|e| GenerateError::Render(e.to_string()))?
            .map(|e| ResourceEvent::Failed {
                id: e.request_id.inner().clone(),
            });

        let events = stream::select_all(vec![started.boxed(), finished.boxed(), failed.boxed()]);

        Ok(Self {
            events: Some(events.boxed()),
        })
    }
}

/// Only requests Chrome reports as images are tracked for settlement.
fn request_started(id: String, kind: Option<&ResourceType>) -> ResourceEvent {
    ResourceEvent::Started {
        id,
        image: matches!(kind, Some(ResourceType::Image)),
    }
}

#[async_trait]
impl ObserverTap for ChromeNetworkTap {
    async fn next_event(&mut self) -> Option<ResourceEvent> {
        match self.events.as_mut() {
            Some(events) => events.next().await,
            None => None,
        }
    }

    async fn detach(&mut self) {
        self.events = None;
    }
}

/// Pull the printed document through `IO.read` one chunk at a time.
fn read_stream(page: Page, handle: StreamHandle) -> ByteStream {
    Box::pin(stream::unfold(Some((page, handle)), |state| async move {
        let (page, handle) = state?;

        loop {
            match read_chunk(&page, &handle).await {
                Ok((chunk, eof)) if eof => {
                    close_stream(&page, handle).await;
                    return if chunk.is_empty() {
                        None
                    } else {
                        Some((Ok(chunk), None))
                    };
                }
                Ok((chunk, _)) if chunk.is_empty() => continue,
                Ok((chunk, _)) => return Some((Ok(chunk), Some((page, handle)))),
                Err(e) => {
                    close_stream(&page, handle).await;
                    return Some((Err(e), None));
                }
            }
        }
    }))
}

async fn read_chunk(page: &Page, handle: &StreamHandle) -> Result<(Vec<u8>, bool), GenerateError> {
    let params = ReadParams {
        handle: handle.clone(),
        offset: None,
        size: Some(READ_CHUNK_SIZE as i64),
    };

    let read = page
        .execute(params)
        .await
        .map_err(|e| GenerateError::Stream(e.to_string()))?
        .result;

    let chunk = if read.base64_encoded.unwrap_or(false) {
        base64::engine::general_purpose::STANDARD
            .decode(read.data.as_bytes())
            .map_err(|e| GenerateError::Stream(format!("invalid base64 chunk: {e}")))?
    } else {
        read.data.into_bytes()
    };

    Ok((chunk, read.eof))
}

async fn close_stream(page: &Page, handle: StreamHandle) {
    if let Err(e) = page.execute(CloseParams::new(handle)).await {
        debug!("IO.close failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_requires_endpoint_and_token() {
        let mut config = Config::default();
        let err = ChromeBackend::new(&config).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);

        config.browser.endpoint = Some("wss://chrome.example.net".into());
        config.browser.token = Some("secret".into());
        let backend = ChromeBackend::new(&config).unwrap();
        assert_eq!(backend.endpoint_host(), Some("chrome.example.net"));
    }

    #[tokio::test]
    async fn test_release_without_connection_is_idempotent() {
        let url = Url::parse("https://example.com").unwrap();
        let mut session = ChromeSession::new(RenderProfile::default(), url);

        session.release().await;
        session.release().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_capture_before_open_is_render_error() {
        let url = Url::parse("https://example.com").unwrap();
        let mut session = ChromeSession::new(RenderProfile::default(), url);

        let err = match session.capture().await {
            Ok(_) => panic!("capture without a page must fail"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), crate::ErrorKind::Render);
    }

    #[tokio::test]
    async fn test_detached_tap_yields_nothing() {
        let mut tap = ChromeNetworkTap {
            events: Some(stream::iter(vec![ResourceEvent::Finished { id: "1".into() }]).boxed()),
        };
        tap.detach().await;
        assert!(tap.next_event().await.is_none());
    }

    #[test]
    fn test_only_image_requests_are_tracked() {
        let is_image = |kind: Option<ResourceType>| {
            match request_started("7".into(), kind.as_ref()) {
                ResourceEvent::Started { id, image } => {
                    assert_eq!(id, "7");
                    image
                }
                other => panic!("unexpected event {:?}", other),
            }
        };

        assert!(is_image(Some(ResourceType::Image)));
        assert!(!is_image(Some(ResourceType::Xhr)));
        assert!(!is_image(Some(ResourceType::Stylesheet)));
        assert!(!is_image(None));
    }
}
