//! Paste record reconciliation
//!
//! Every mutation, local or remote, funnels through the reconciler so
//! conflict resolution happens in exactly one place. Applying the same
//! message twice is a no-op, and two stores that exchange their full
//! change sets converge regardless of delivery order.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::directory::PeerDirectory;
use crate::paste::{BlobStore, PasteContent, PasteRecord, PasteStore, StoreError};
use crate::transport::protocol::SyncMessage;

/// What applying a remote record did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Record was new here
    Inserted,
    /// Record replaced an older local version
    Updated,
    /// Record merged into an existing one with the same content hash
    Merged,
    /// Record was older than what we have
    Ignored,
}

/// A request to fetch missing blobs for a record
#[derive(Debug, Clone)]
pub struct PullJob {
    /// Peer that sent the record (and holds the blobs)
    pub source: Uuid,
    /// Record waiting on the blobs
    pub record_id: Uuid,
    /// Missing blob hashes
    pub hashes: Vec<String>,
}

/// Single apply path for record mutations
pub struct Reconciler {
    device_id: Uuid,
    store: Arc<PasteStore>,
    blobs: BlobStore,
    local_tx: broadcast::Sender<SyncMessage>,
    pull_tx: mpsc::UnboundedSender<PullJob>,
}

impl Reconciler {
    /// Create a reconciler; the returned receiver yields blob pull jobs
    pub fn new(
        device_id: Uuid,
        store: Arc<PasteStore>,
        blobs: BlobStore,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PullJob>) {
        let (local_tx, _) = broadcast::channel(256);
        let (pull_tx, pull_rx) = mpsc::unbounded_channel();

        (
            Arc::new(Self {
                device_id,
                store,
                blobs,
                local_tx,
                pull_tx,
            }),
            pull_rx,
        )
    }

    /// Subscribe to local mutations for outbound propagation
    pub fn subscribe_local(&self) -> broadcast::Receiver<SyncMessage> {
        self.local_tx.subscribe()
    }

    fn emit_local(&self, message: SyncMessage) {
        // No listeners during catch-up-only operation is fine.
        let _ = self.local_tx.send(message);
    }

    /// Create a record from local content.
    ///
    /// If a live record with the same content hash already exists, it is
    /// touched instead of duplicated.
    pub async fn create_local(&self, content: PasteContent) -> Result<PasteRecord, StoreError> {
        let hash = content.content_hash();

        if let Some(mut existing) = self.store.get_live_by_hash(&hash).await? {
            existing.updated_at = Utc::now();
            existing.seq = self.store.upsert(&existing).await?;
            debug!("Local content matched record {}, touched", existing.id);
            self.emit_local(SyncMessage::Update {
                record: existing.clone(),
            });
            return Ok(existing);
        }

        let mut record = PasteRecord::new(self.device_id, content);
        record.seq = self.store.upsert(&record).await?;
        self.emit_local(SyncMessage::Create {
            record: record.clone(),
        });
        Ok(record)
    }

    /// Toggle a record's favorite flag
    pub async fn set_favorite(&self, id: &Uuid, favorite: bool) -> Result<PasteRecord, StoreError> {
        let mut record = self.store.get(id).await?.ok_or(StoreError::NotFound(*id))?;
        if record.deleted {
            return Err(StoreError::NotFound(*id));
        }

        record.favorite = favorite;
        record.updated_at = Utc::now();
        record.seq = self.store.upsert(&record).await?;
        self.emit_local(SyncMessage::Update {
            record: record.clone(),
        });
        Ok(record)
    }

    /// Delete a record, leaving a tombstone
    pub async fn delete_local(&self, id: &Uuid) -> Result<(), StoreError> {
        let mut record = self.store.get(id).await?.ok_or(StoreError::NotFound(*id))?;
        if record.deleted {
            return Ok(());
        }

        record.tombstone();
        record.seq = self.store.upsert(&record).await?;
        self.emit_local(SyncMessage::Delete { record });
        Ok(())
    }

    /// Apply a batch of messages from a peer
    pub async fn apply_batch(
        &self,
        source: Uuid,
        messages: &[SyncMessage],
    ) -> Result<usize, StoreError> {
        let mut applied = 0;
        for message in messages {
            match self.apply_remote(source, message.record().clone()).await {
                Ok(Applied::Ignored) => {}
                Ok(_) => applied += 1,
                Err(e) => warn!("Failed to apply record from {}: {}", source, e),
            }
        }
        Ok(applied)
    }

    /// Apply one record received from a peer
    pub async fn apply_remote(
        &self,
        source: Uuid,
        mut record: PasteRecord,
    ) -> Result<Applied, StoreError> {
        // A live record must hash to what it claims; a mismatch means
        // corruption or tampering somewhere along the way.
        if !record.deleted && record.content.content_hash() != record.hash {
            warn!(
                "Record {} from {} fails its own content hash, ignoring",
                record.id, source
            );
            return Ok(Applied::Ignored);
        }

        if let Some(local) = self.store.get(&record.id).await? {
            if !record.wins_over(&local) {
                return Ok(Applied::Ignored);
            }
            self.prepare_blobs(source, &mut record);
            record.seq = self.store.upsert(&record).await?;
            return Ok(Applied::Updated);
        }

        // Content-hash dedup: same content under a different id merges
        // into the record we already have.
        if !record.deleted {
            if let Some(mut existing) = self.store.get_live_by_hash(&record.hash).await? {
                if record.updated_at > existing.updated_at {
                    existing.updated_at = record.updated_at;
                    existing.favorite |= record.favorite;
                    existing.seq = self.store.upsert(&existing).await?;
                }
                debug!(
                    "Record {} from {} merged into {} by content hash",
                    record.id, source, existing.id
                );
                return Ok(Applied::Merged);
            }
        }

        // Unknown tombstones are kept so a late-arriving create cannot
        // resurrect the record.
        self.prepare_blobs(source, &mut record);
        record.seq = self.store.upsert(&record).await?;
        Ok(Applied::Inserted)
    }

    /// Check blob availability for a record and queue pulls for anything
    /// missing.
    fn prepare_blobs(&self, source: Uuid, record: &mut PasteRecord) {
        if record.deleted {
            record.complete = true;
            return;
        }

        let missing: Vec<String> = record
            .content
            .file_refs()
            .iter()
            .filter(|f| !self.blobs.has(&f.hash))
            .map(|f| f.hash.clone())
            .collect();

        record.complete = missing.is_empty();
        if !missing.is_empty() {
            let _ = self.pull_tx.send(PullJob {
                source,
                record_id: record.id,
                hashes: missing,
            });
        }
    }

    /// Re-check a record after blob pulls and mark it complete once
    /// every referenced blob is present.
    pub async fn finish_blob_pull(&self, record_id: &Uuid) -> Result<bool, StoreError> {
        let Some(record) = self.store.get(record_id).await? else {
            return Ok(false);
        };

        let all_present = record
            .content
            .file_refs()
            .iter()
            .all(|f| self.blobs.has(&f.hash));

        if all_present && !record.complete {
            self.store.mark_complete(record_id).await?;
        }
        Ok(all_present)
    }

    /// Fetch the blobs named by a pull job and close out the record if
    /// everything arrived.
    pub async fn run_pull_job(
        &self,
        client: &crate::transport::PeerClient,
        job: &PullJob,
        chunk_retries: u32,
    ) -> Result<bool, crate::transport::TransportError> {
        for hash in &job.hashes {
            client.pull_blob(hash, &self.blobs, chunk_retries).await?;
        }
        Ok(self.finish_blob_pull(&job.record_id).await?)
    }

    /// Retry blob pulls for every incomplete record against a connected
    /// peer. Returns how many records were completed.
    pub async fn pull_incomplete(
        &self,
        client: &crate::transport::PeerClient,
        chunk_retries: u32,
    ) -> usize {
        let records = match self.store.incomplete().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to list incomplete records: {}", e);
                return 0;
            }
        };

        let mut completed = 0;
        for record in records {
            let job = PullJob {
                source: client.peer_id(),
                record_id: record.id,
                hashes: record
                    .content
                    .file_refs()
                    .iter()
                    .filter(|f| !self.blobs.has(&f.hash))
                    .map(|f| f.hash.clone())
                    .collect(),
            };
            match self.run_pull_job(client, &job, chunk_retries).await {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => debug!("Blob pull for record {} failed: {}", record.id, e),
            }
        }
        completed
    }

    /// Pull the changes a peer has past our cursor, applying them and
    /// advancing the cursor. Returns the number of records applied.
    pub async fn catch_up(
        &self,
        client: &crate::transport::PeerClient,
        directory: &PeerDirectory,
    ) -> Result<usize, crate::transport::TransportError> {
        use crate::transport::protocol::ChangesRequest;

        let peer_id = client.peer_id();
        let mut total = 0;

        loop {
            let since = directory.cursor(&peer_id).await;
            let response = client
                .changes(&ChangesRequest { since, limit: 200 })
                .await?;

            for record in response.records {
                match self.apply_remote(peer_id, record).await {
                    Ok(Applied::Ignored) => {}
                    Ok(_) => total += 1,
                    Err(e) => warn!("Catch-up apply failed: {}", e),
                }
            }

            directory.set_cursor(&peer_id, response.cursor).await?;
            if !response.more {
                break;
            }
        }

        if total > 0 {
            debug!("Caught up {} records from {}", total, peer_id);
        }
        Ok(total)
    }
}
