use crate::photos::{PhotoError, PhotoStore};
use attendance_core::{
    decode, extract_enrollment, DecodeError, Embedding, EmbeddingCache, EmbeddingExtractor,
    ExtractError, LivenessDecision, LivenessDetector,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),
    #[error("photo store: {0}")]
    Photo(#[from] PhotoError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine workers exited")]
    ChannelClosed,
}

/// Worker pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub workers: usize,
    pub queue_depth: usize,
    /// Soft limit on queueing plus execution of one request.
    pub timeout: Duration,
}

/// Messages sent from request handlers to the worker threads.
enum EngineRequest {
    Liveness {
        frames: Vec<Vec<u8>>,
        reply: oneshot::Sender<LivenessDecision>,
    },
    ExtractQuery {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<Embedding>, EngineError>>,
    },
    EnrollmentEmbedding {
        photo_ref: String,
        reply: oneshot::Sender<Result<Option<Arc<Embedding>>, EngineError>>,
    },
}

/// Everything a worker needs; shared by all workers.
struct Worker {
    extractor: Arc<dyn EmbeddingExtractor>,
    liveness: Arc<dyn LivenessDetector>,
    cache: Arc<EmbeddingCache>,
    photos: Arc<dyn PhotoStore>,
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    cache: Arc<EmbeddingCache>,
    timeout: Duration,
    workers: usize,
}

impl EngineHandle {
    /// Run the liveness check on encoded frames.
    pub async fn liveness(&self, frames: Vec<Vec<u8>>) -> Result<LivenessDecision, EngineError> {
        self.submit(|reply| EngineRequest::Liveness { frames, reply })
            .await
    }

    /// Decode a query image and extract one embedding per face.
    pub async fn extract_query(&self, image: Vec<u8>) -> Result<Vec<Embedding>, EngineError> {
        self.submit(|reply| EngineRequest::ExtractQuery { image, reply })
            .await?
    }

    /// Embedding of a stored enrollment photo, through the cache.
    ///
    /// Cache hits are answered without queueing. `Ok(None)` means the photo has no face.
    pub async fn enrollment_embedding(
        &self,
        photo_ref: &str,
    ) -> Result<Option<Arc<Embedding>>, EngineError> {
        if let Some(hit) = self.cache.get(photo_ref) {
            return Ok(Some(hit));
        }
        let photo_ref = photo_ref.to_string();
        self.submit(|reply| EngineRequest::EnrollmentEmbedding { photo_ref, reply })
            .await?
    }

    /// Compute and cache a photo's embedding in the background.
    pub fn warm(&self, photo_ref: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.enrollment_embedding(&photo_ref).await {
                Ok(Some(_)) => tracing::debug!(photo_ref = %photo_ref, "embedding cache warmed"),
                Ok(None) => {
                    tracing::warn!(photo_ref = %photo_ref, "no face found in enrollment photo")
                }
                Err(e) => {
                    tracing::warn!(photo_ref = %photo_ref, error = %e, "cache warm-up failed")
                }
            }
        });
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    async fn submit<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let round_trip = async {
            if self.tx.send(request(reply_tx)).await.is_err() {
                return Err(EngineError::ChannelClosed);
            }
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };
        tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| {
                tracing::warn!(timeout = ?self.timeout, "engine request timed out");
                EngineError::Timeout(self.timeout)
            })?
    }
}

/// Spawn the worker pool on dedicated OS threads.
///
/// Workers share one bounded queue; a full queue makes callers wait, which
/// counts against their timeout. A request that times out keeps running to
/// completion on its worker and its reply is dropped.
pub fn spawn_engine(
    config: EngineConfig,
    extractor: Arc<dyn EmbeddingExtractor>,
    liveness: Arc<dyn LivenessDetector>,
    cache: Arc<EmbeddingCache>,
    photos: Arc<dyn PhotoStore>,
) -> Result<EngineHandle, EngineError> {
    let workers = config.workers.max(1);
    let (tx, rx) = mpsc::channel::<EngineRequest>(config.queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let worker = Arc::new(Worker {
        extractor,
        liveness,
        cache: Arc::clone(&cache),
        photos,
    });

    for id in 0..workers {
        let rx = Arc::clone(&rx);
        let worker = Arc::clone(&worker);
        std::thread::Builder::new()
            .name(format!("attendance-worker-{id}"))
            .spawn(move || {
                tracing::debug!(worker = id, "engine worker started");
                loop {
                    // Only one idle worker waits on the channel at a time.
                    let next = rx.lock().unwrap_or_else(PoisonError::into_inner).blocking_recv();
                    let Some(req) = next else { break };
                    worker.handle(req);
                }
                tracing::debug!(worker = id, "engine worker exiting");
            })
            .map_err(EngineError::Spawn)?;
    }

    tracing::info!(
        workers,
        queue_depth = config.queue_depth,
        timeout = ?config.timeout,
        "engine started"
    );

    Ok(EngineHandle {
        tx,
        cache,
        timeout: config.timeout,
        workers,
    })
}

impl Worker {
    fn handle(&self, req: EngineRequest) {
        match req {
            EngineRequest::Liveness { frames, reply } => {
                let decision = self.liveness.check(&frames);
                tracing::debug!(
                    frames = frames.len(),
                    is_live = decision.is_live,
                    motion_pixels = decision.motion_pixels,
                    "liveness evaluated"
                );
                let _ = reply.send(decision);
            }
            EngineRequest::ExtractQuery { image, reply } => {
                let _ = reply.send(self.extract_query(&image));
            }
            EngineRequest::EnrollmentEmbedding { photo_ref, reply } => {
                let _ = reply.send(self.enrollment_embedding(&photo_ref));
            }
        }
    }

    fn extract_query(&self, image: &[u8]) -> Result<Vec<Embedding>, EngineError> {
        let rgb = decode::decode_rgb(image)?;
        let faces = self.extractor.extract(&rgb)?;
        tracing::debug!(faces = faces.len(), "query embeddings extracted");
        Ok(faces)
    }

    fn enrollment_embedding(&self, photo_ref: &str) -> Result<Option<Arc<Embedding>>, EngineError> {
        self.cache.get_or_compute(photo_ref, || -> Result<_, EngineError> {
            let bytes = self.photos.load(photo_ref)?;
            let rgb = decode::decode_rgb(&bytes)?;
            Ok(extract_enrollment(self.extractor.as_ref(), &rgb)?)
        })
    }
}
