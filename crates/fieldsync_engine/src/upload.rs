//! Attachment upload pipeline.
//!
//! Each transfer reads the device-owned binary in chunks, hashing as it goes
//! and reporting progress on the event bus, then hands the bytes to the
//! transport. Concurrency is bounded by a fair semaphore, so queued uploads
//! start in submission order.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::transport::SyncTransport;
use fieldsync_protocol::{ContentHash, ContentHasher, UploadRequest};
use fieldsync_store::{Attachment, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;

/// Default read size when staging an attachment.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A verified upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAttachment {
    /// Remote URL of the stored object.
    pub url: String,
    /// Digest confirmed by both sides.
    pub hash: ContentHash,
    /// Bytes sent.
    pub size_bytes: u64,
}

/// Bounded-concurrency attachment uploader.
pub struct UploadPipeline<T: SyncTransport + ?Sized> {
    transport: Arc<T>,
    bus: EventBus,
    permits: Semaphore,
    concurrency: usize,
    request_timeout: Duration,
    chunk_size: usize,
}

impl<T: SyncTransport + ?Sized> UploadPipeline<T> {
    /// Creates a pipeline sized from the configuration.
    pub fn new(transport: Arc<T>, bus: EventBus, config: &SyncConfig) -> Self {
        let concurrency = config.effective_upload_concurrency();
        Self {
            transport,
            bus,
            permits: Semaphore::new(concurrency),
            concurrency,
            request_timeout: config.request_timeout,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the staging read size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Maximum number of concurrent transfers.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of transfer slots currently free.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Uploads one attachment and verifies the digest the server reports.
    ///
    /// Waits for a free slot first. If `cancel` is set by the time a slot is
    /// granted the transfer is not started and [`SyncError::Cancelled`] is
    /// returned.
    pub async fn upload(
        &self,
        attachment: &Attachment,
        cancel: &AtomicBool,
    ) -> SyncResult<UploadedAttachment> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;
        if cancel.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }

        tracing::debug!(
            attachment_id = %attachment.id,
            record_id = %attachment.record_id,
            size = attachment.size_bytes,
            "uploading attachment"
        );

        let (content, local_hash) = self.stage(attachment).await?;
        if local_hash != attachment.content_hash {
            tracing::warn!(
                attachment_id = %attachment.id,
                "local binary changed since capture"
            );
            return Err(SyncError::Integrity {
                expected: attachment.content_hash.clone(),
                actual: local_hash,
            });
        }

        let size_bytes = content.len() as u64;
        let request = UploadRequest {
            attachment_id: attachment.id.clone(),
            record_id: attachment.record_id.clone(),
            content_type: attachment.content_type.clone(),
            content_hash: local_hash.clone(),
            content,
        };

        let response = tokio::time::timeout(
            self.request_timeout,
            self.transport.upload_attachment(&request),
        )
        .await
        .map_err(|_| SyncError::Timeout)??;

        if response.hash != local_hash {
            tracing::warn!(
                attachment_id = %attachment.id,
                expected = %local_hash,
                actual = %response.hash,
                "upload integrity check failed"
            );
            return Err(SyncError::Integrity {
                expected: local_hash,
                actual: response.hash,
            });
        }

        self.report(attachment, 1.0);
        Ok(UploadedAttachment {
            url: response.url,
            hash: local_hash,
            size_bytes,
        })
    }

    async fn stage(&self, attachment: &Attachment) -> SyncResult<(Vec<u8>, ContentHash)> {
        let mut file = tokio::fs::File::open(&attachment.local_ref)
            .await
            .map_err(StoreError::from)?;
        let expected = attachment.size_bytes.max(1) as f32;

        let mut hasher = ContentHasher::new();
        let mut content = Vec::with_capacity(attachment.size_bytes as usize);
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            let read = file.read(&mut chunk).await.map_err(StoreError::from)?;
            if read == 0 {
                break;
            }
            hasher.update(&chunk[..read]);
            content.extend_from_slice(&chunk[..read]);
            // Staging covers the first 90%; the confirmed upload completes it
            self.report(attachment, (content.len() as f32 / expected).min(1.0) * 0.9);
        }

        Ok((content, hasher.finalize()))
    }

    fn report(&self, attachment: &Attachment, progress: f32) {
        self.bus.emit(&SyncEvent::PhotoUploadProgress {
            attachment_id: attachment.id.clone(),
            progress,
        });
    }
}

impl<T: SyncTransport + ?Sized> std::fmt::Debug for UploadPipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadPipeline")
            .field("concurrency", &self.concurrency)
            .field("request_timeout", &self.request_timeout)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}
