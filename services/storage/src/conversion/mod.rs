//! Asynchronous derived-format conversion.
//!
//! Uploads hand a [`ConversionJob`] to a bounded queue consumed by a fixed
//! number of workers. Each job encodes WebP and AVIF concurrently, stores the
//! results and attaches both to the record in one metadata update. A full
//! queue drops the job; failed encodes leave the format absent for good.

pub mod encoder;

pub use encoder::{CommandEncoder, ConversionError, Encoder};

use crate::blob_store::BlobStore;
use crate::error::ImageError;
use crate::layout::derived_key;
use crate::metadata::MetadataStore;
use crate::model::{DerivedArtifact, Orientation, Rendition, SourceFormat};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// One original waiting for its derived formats
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub id: String,
    pub orientation: Orientation,
    pub source_format: SourceFormat,
    pub data: Bytes,
}

#[derive(Debug, Default, Clone)]
pub struct ConversionStats {
    pub jobs_submitted: u64,
    pub jobs_dropped: u64,
    pub jobs_completed: u64,
    pub formats_stored: u64,
    pub formats_failed: u64,
    /// Records deleted while their conversion ran
    pub orphans_removed: u64,
}

struct Worker {
    encoder: Arc<dyn Encoder>,
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    stats: Arc<RwLock<ConversionStats>>,
}

impl Worker {
    #[instrument(skip(self, job), fields(id = %job.id))]
    async fn process(&self, job: ConversionJob) {
        let start = Instant::now();

        let (webp, avif) = tokio::join!(
            self.derive(&job, Rendition::Webp),
            self.derive(&job, Rendition::Avif)
        );
        let artifacts: Vec<DerivedArtifact> = [webp, avif].into_iter().flatten().collect();

        if !artifacts.is_empty() {
            match self.metadata.attach_derived(&job.id, &artifacts).await {
                Ok(()) => {
                    self.stats.write().formats_stored += artifacts.len() as u64;
                }
                Err(ImageError::NotFound(_)) => {
                    debug!("Record deleted during conversion, removing derived blobs");
                    let keys: Vec<String> = artifacts.iter().map(|a| a.path.clone()).collect();
                    for (key, result) in self.blobs.delete_many(&keys).await {
                        if let Err(e) = result {
                            warn!(key = %key, error = %e, "Failed to remove orphaned blob");
                        }
                    }
                    self.stats.write().orphans_removed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to record derived formats");
                    self.stats.write().formats_failed += artifacts.len() as u64;
                }
            }
        }

        self.stats.write().jobs_completed += 1;
        metrics::histogram!("imgpool.conversion.job_seconds").record(start.elapsed().as_secs_f64());
        debug!(
            formats = artifacts.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Conversion job finished"
        );
    }

    /// Encode and store one format. `None` means it stays absent.
    async fn derive(&self, job: &ConversionJob, rendition: Rendition) -> Option<DerivedArtifact> {
        let key = derived_key(&job.id, rendition, job.orientation)?;

        let encoded = match self
            .encoder
            .encode(rendition, job.data.clone(), job.source_format)
            .await
        {
            Ok(encoded) => encoded,
            Err(e) => {
                metrics::counter!("imgpool.conversion.failed").increment(1);
                warn!(id = %job.id, format = %rendition, error = %e, "Conversion failed");
                self.stats.write().formats_failed += 1;
                return None;
            }
        };

        let size = encoded.len() as u64;
        if let Err(e) = self.blobs.put(&key, encoded).await {
            warn!(id = %job.id, key = %key, error = %e, "Failed to store derived format");
            self.stats.write().formats_failed += 1;
            return None;
        }

        Some(DerivedArtifact {
            rendition,
            path: key,
            size,
        })
    }
}

/// Bounded worker pool producing derived formats
pub struct ConversionPipeline {
    sender: Mutex<Option<mpsc::Sender<ConversionJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<RwLock<ConversionStats>>,
}

impl ConversionPipeline {
    /// Spawn `workers` tasks sharing a queue of `queue_capacity` jobs
    pub fn start(
        workers: usize,
        queue_capacity: usize,
        encoder: Arc<dyn Encoder>,
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(RwLock::new(ConversionStats::default()));

        let worker = Arc::new(Worker {
            encoder,
            blobs,
            metadata,
            stats: stats.clone(),
        });

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let worker = worker.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    debug!(worker_id = worker_id, "Conversion worker started");
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => worker.process(job).await,
                            None => break,
                        }
                    }
                    debug!(worker_id = worker_id, "Conversion worker stopped");
                })
            })
            .collect();

        info!(
            workers = workers.max(1),
            queue_capacity = queue_capacity.max(1),
            "Conversion pipeline started"
        );

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            stats,
        }
    }

    /// Queue a job without waiting. A full queue drops the job.
    pub fn submit(&self, job: ConversionJob) -> Result<(), ConversionError> {
        let sender = self.sender.lock().clone().ok_or(ConversionError::Shutdown)?;
        let id = job.id.clone();

        match sender.try_send(job) {
            Ok(()) => {
                self.stats.write().jobs_submitted += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.write().jobs_dropped += 1;
                metrics::counter!("imgpool.conversion.dropped").increment(1);
                warn!(id = %id, "Conversion queue full, job dropped");
                Err(ConversionError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ConversionError::Shutdown),
        }
    }

    pub fn stats(&self) -> ConversionStats {
        self.stats.read().clone()
    }

    pub fn is_accepting(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stop accepting jobs and wait up to `grace` for queued and in-flight
    /// jobs. Returns whether the drain finished in time; stragglers are aborted.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.sender.lock().take();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!("Conversion pipeline drained");
                true
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Conversion drain timed out, aborting workers");
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}
