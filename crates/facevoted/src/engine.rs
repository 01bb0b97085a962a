use facevote_core::{Descriptor, DescriptorExtractor, ExtractMode, ExtractorError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error("extraction workers exited")]
    ChannelClosed,
    #[error("failed to spawn extraction worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from request handlers to the extraction workers.
struct ExtractRequest {
    image: Vec<u8>,
    mode: ExtractMode,
    reply: oneshot::Sender<Result<Vec<Descriptor>, ExtractorError>>,
}

/// Clone-safe handle to the extraction worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<ExtractRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Queue one image for extraction and wait for its descriptors.
    ///
    /// The timeout covers time spent queued as well as the extraction itself.
    pub async fn extract(
        &self,
        image: Vec<u8>,
        mode: ExtractMode,
    ) -> Result<Vec<Descriptor>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = async {
            self.tx
                .send(ExtractRequest {
                    image,
                    mode,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            let descriptors = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
            Ok::<_, EngineError>(descriptors)
        };

        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, ?mode, "extraction timed out");
                Err(ExtractorError::Timeout(self.timeout).into())
            }
        }
    }
}

/// Spawn `workers` extraction threads sharing one bounded request queue.
///
/// The extractor is built once by the caller and shared read-only. At most
/// `workers` extractions run at a time; up to `queue_depth` more wait in the
/// queue, after which callers wait on `send`.
pub fn spawn_engine(
    extractor: Arc<dyn DescriptorExtractor>,
    workers: usize,
    queue_depth: usize,
    timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    let (tx, rx) = mpsc::channel::<ExtractRequest>(queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));

    for n in 0..workers.max(1) {
        let rx = Arc::clone(&rx);
        let extractor = Arc::clone(&extractor);
        std::thread::Builder::new()
            .name(format!("facevote-extract-{n}"))
            .spawn(move || {
                tracing::debug!(worker = n, "extraction worker started");
                loop {
                    // Only one idle worker waits on the queue at a time.
                    let next = match rx.lock() {
                        Ok(mut queue) => queue.blocking_recv(),
                        Err(_) => None,
                    };
                    let Some(req) = next else {
                        break;
                    };
                    if req.reply.is_closed() {
                        tracing::debug!(worker = n, "caller gone; skipping extraction");
                        continue;
                    }

                    let result = extractor.extract(&req.image, req.mode);
                    match &result {
                        Ok(faces) => tracing::debug!(
                            worker = n,
                            mode = ?req.mode,
                            faces = faces.len(),
                            "extraction finished"
                        ),
                        Err(e) => tracing::debug!(
                            worker = n,
                            mode = ?req.mode,
                            error = %e,
                            "extraction failed"
                        ),
                    }
                    let _ = req.reply.send(result);
                }
                tracing::debug!(worker = n, "extraction worker exiting");
            })?;
    }

    tracing::info!(
        workers,
        queue_depth,
        dimension = extractor.dimension(),
        "extraction engine started"
    );

    Ok(EngineHandle { tx, timeout })
}
