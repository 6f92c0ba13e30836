//! Render service orchestrating cache lookup, rendering, and fan-out
//!
//! ```text
//! Start -> CacheLookup -> Hit  -> ServeFromCache -> Done
//!                      -> Miss -> OpenSession -> Capture -> Tee
//!                              -> RespondToCaller -> AwaitBothSinks
//!                              -> ReleaseSession -> Done
//! ```
//!
//! The caller gets its stream as soon as the tee is wired. The cache write,
//! the wait for both sinks, and the session release continue in a
//! background task whose outcome never affects the response.

use crate::cache::HybridCache;
use crate::chrome::ChromeBackend;
use crate::request::{content_disposition, RenderRequest, PDF_CONTENT_TYPE};
use crate::session::{RenderBackend, SessionLease};
use crate::tee::{tee, TeeReport};
use crate::{ByteStream, Config, GenerateError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactSource {
    Cache,
    Render,
}

impl ArtifactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactSource::Cache => "cache",
            ArtifactSource::Render => "render",
        }
    }
}

/// The caller-facing result of [`RenderService::generate`].
pub struct Artifact {
    pub body: ByteStream,
    pub content_type: &'static str,
    pub filename: String,
    pub source: ArtifactSource,
    pub completion: Completion,
}

impl Artifact {
    pub fn content_disposition(&self) -> String {
        content_disposition(&self.filename)
    }
}

/// What happened in the background after the response was handed out.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub tee: Option<TeeReport>,
    pub cache_write: Option<Result<PathBuf, GenerateError>>,
    pub session_released: bool,
}

impl CompletionReport {
    fn served_from_cache() -> Self {
        Self {
            tee: None,
            cache_write: None,
            session_released: false,
        }
    }
}

/// Handle on the background half of a request.
pub struct Completion {
    task: Option<JoinHandle<CompletionReport>>,
}

impl Completion {
    fn ready() -> Self {
        Self { task: None }
    }

    pub async fn wait(self) -> CompletionReport {
        match self.task {
            None => CompletionReport::served_from_cache(),
            Some(task) => match task.await {
                Ok(report) => report,
                Err(e) => {
                    error!("Background render task failed: {}", e);
                    CompletionReport {
                        tee: None,
                        cache_write: None,
                        session_released: false,
                    }
                }
            },
        }
    }
}

/// Serves render requests from the cache or a fresh render session.
///
/// Constructed once at startup and shared by reference.
pub struct RenderService {
    cache: Arc<HybridCache>,
    backend: Result<Arc<dyn RenderBackend>, GenerateError>,
    tee_buffer_chunks: usize,
}

impl RenderService {
    /// `backend` may be a configuration error; every request then fails
    /// with that error until the process is restarted with valid settings.
    pub fn new(
        cache: Arc<HybridCache>,
        backend: Result<Arc<dyn RenderBackend>, GenerateError>,
        tee_buffer_chunks: usize,
    ) -> Self {
        if let Err(e) = &backend {
            error!("Document generation is disabled: {}", e);
        }

        Self {
            cache,
            backend,
            tee_buffer_chunks,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let cache = Arc::new(HybridCache::with_directory(
            config.cache.directory.clone(),
            config.cache.ttl,
        ));
        let backend =
            ChromeBackend::new(config).map(|b| Arc::new(b) as Arc<dyn RenderBackend>);

        Self::new(cache, backend, config.tee_buffer_chunks)
    }

    pub fn cache(&self) -> &Arc<HybridCache> {
        &self.cache
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_ok()
    }

    pub async fn generate(&self, request: &RenderRequest) -> Result<Artifact, GenerateError> {
        let result = self.run(request).await;

        match &result {
            Ok(artifact) => {
                metrics::increment_counter!(
                    crate::metrics::REQUESTS,
                    "source" => artifact.source.as_str()
                );
            }
            Err(e) => {
                error!("Generation for {} failed: {}", request.cache_key(), e);
                metrics::increment_counter!(
                    crate::metrics::FAILURES,
                    "kind" => e.kind().as_str()
                );
            }
        }

        result
    }

    async fn run(&self, request: &RenderRequest) -> Result<Artifact, GenerateError> {
        let backend = self.backend.as_ref().map_err(Clone::clone)?;
        let key = request.cache_key();

        if let Some(hit) = self.cache.get(key).await {
            return Ok(Artifact {
                body: hit.stream,
                content_type: PDF_CONTENT_TYPE,
                filename: request.suggested_filename(),
                source: ArtifactSource::Cache,
                completion: Completion::ready(),
            });
        }

        let started = Instant::now();
        info!("Rendering {}", request.url());

        let session = backend.open(request.url()).await?;
        let mut lease = SessionLease::new(session, key);

        let stream = match lease.capture().await {
            Ok(stream) => stream,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        let (caller, cache_sink, drain) = tee(stream, self.tee_buffer_chunks);
        let cache = self.cache.clone();
        let key = key.to_string();

        let task = tokio::spawn(async move {
            let cache_write = cache.set(&key, cache_sink.into_byte_stream(), cache.ttl()).await;
            if let Err(e) = &cache_write {
                warn!("Background cache write for {} failed: {}", key, e);
            }

            let tee = drain.drained().await;
            debug!(
                "Tee for {} drained: {:?}, {} bytes, sinks {:?}",
                key, tee.source, tee.bytes, tee.sinks
            );

            lease.release().await;

            CompletionReport {
                tee: Some(tee),
                cache_write: Some(cache_write),
                session_released: true,
            }
        });

        metrics::histogram!(crate::metrics::RENDER_DURATION, started.elapsed().as_secs_f64());

        Ok(Artifact {
            body: caller.into_byte_stream(),
            content_type: PDF_CONTENT_TYPE,
            filename: request.suggested_filename(),
            source: ArtifactSource::Render,
            completion: Completion { task: Some(task) },
        })
    }
}
