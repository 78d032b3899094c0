//! Reliable-delivery glue: the batcher seam and an interval-driven reference
//! batcher.
//!
//! Messages appended for a peer are flushed on every tick as one or more
//! batches, each handed back to the sender through a [`DataSyncDispatcher`].
//! Received batches are acknowledged on the next tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use missive_shared::types::PublicKey;

use crate::error::SenderError;

/// Identifier of one message inside the datasync layer.
pub type DataSyncId = [u8; 32];

pub const DATASYNC_MAGIC: &[u8; 4] = b"MDSY";

/// Per-record framing overhead assumed when packing batches.
const RECORD_OVERHEAD: usize = 48;

#[derive(Error, Debug)]
pub enum DataSyncError {
    #[error("Payload is not a datasync batch")]
    NotDataSync,

    #[error("Malformed datasync batch: {0}")]
    Malformed(String),
}

/// A batch ready to be encrypted and sent to `recipient`.
#[derive(Debug, Clone)]
pub struct DataSyncBatch {
    pub recipient: PublicKey,
    /// Serialized batch, the plaintext handed to the encryption layer.
    pub payload: Vec<u8>,
    /// Wrapped messages carried by the batch.
    pub messages: Vec<Vec<u8>>,
}

/// Callback into the sender for batches the datasync layer wants sent.
#[async_trait]
pub trait DataSyncDispatcher: Send + Sync {
    async fn dispatch_batch(&self, batch: DataSyncBatch) -> Result<(), SenderError>;
}

pub trait DataSync: Send + Sync {
    fn append_message(&self, recipient: &PublicKey, wrapped: &[u8]) -> Result<DataSyncId, DataSyncError>;

    /// Split a received batch into its messages and the acknowledgements it
    /// carries. Fails with [`DataSyncError::NotDataSync`] for anything else.
    fn unwrap_payloads_and_acks(
        &self,
        sender: &PublicKey,
        payload: &[u8],
    ) -> Result<(Vec<Vec<u8>>, Vec<DataSyncId>), DataSyncError>;

    fn start(&self, dispatcher: Weak<dyn DataSyncDispatcher>, max_batch_bytes: usize);

    /// Stop dispatching. Idempotent.
    fn stop(&self);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Record {
    id: DataSyncId,
    body: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct WireBatch {
    messages: Vec<Record>,
    acks: Vec<DataSyncId>,
}

impl WireBatch {
    fn to_bytes(&self) -> Result<Vec<u8>, DataSyncError> {
        let body = bincode::serialize(self).map_err(|e| DataSyncError::Malformed(e.to_string()))?;
        let mut out = Vec::with_capacity(DATASYNC_MAGIC.len() + body.len());
        out.extend_from_slice(DATASYNC_MAGIC);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn from_bytes(data: &[u8]) -> Result<Self, DataSyncError> {
        let body = data
            .strip_prefix(DATASYNC_MAGIC.as_slice())
            .ok_or(DataSyncError::NotDataSync)?;
        bincode::deserialize(body).map_err(|e| DataSyncError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Default)]
struct Outbox {
    messages: HashMap<PublicKey, Vec<Record>>,
    acks: HashMap<PublicKey, Vec<DataSyncId>>,
}

impl Outbox {
    /// Take everything queued and pack it into batches no larger than
    /// `max_batch_bytes`. A single oversized message still gets its own batch.
    fn drain(&mut self, max_batch_bytes: usize) -> Vec<(PublicKey, WireBatch)> {
        let mut peers: Vec<PublicKey> = self.messages.keys().chain(self.acks.keys()).copied().collect();
        peers.sort();
        peers.dedup();

        let mut batches = Vec::new();
        for peer in peers {
            let records = self.messages.remove(&peer).unwrap_or_default();
            let acks = self.acks.remove(&peer).unwrap_or_default();

            let mut current = WireBatch {
                messages: Vec::new(),
                acks,
            };
            let mut size = current.acks.len() * 32;
            for record in records {
                let record_size = record.body.len() + RECORD_OVERHEAD;
                if !current.messages.is_empty() && size + record_size > max_batch_bytes {
                    batches.push((peer, std::mem::take(&mut current)));
                    size = 0;
                }
                size += record_size;
                current.messages.push(record);
            }
            if !current.messages.is_empty() || !current.acks.is_empty() {
                batches.push((peer, current));
            }
        }
        batches
    }

    fn requeue(&mut self, peer: PublicKey, batch: WireBatch) {
        let messages = self.messages.entry(peer).or_default();
        let mut restored = batch.messages;
        restored.append(messages);
        *messages = restored;
        self.acks.entry(peer).or_default().extend(batch.acks);
    }
}

/// Reference datasync layer: an in-memory outbox flushed on a tokio interval.
///
/// Failed dispatches are requeued for the next tick; there is no
/// acknowledgement-driven retransmission.
pub struct BatchingDataSync {
    local: PublicKey,
    interval: Duration,
    outbox: Arc<Mutex<Outbox>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingDataSync {
    pub fn new(local: PublicKey, interval: Duration) -> Self {
        Self {
            local,
            interval,
            outbox: Arc::new(Mutex::new(Outbox::default())),
            task: Mutex::new(None),
        }
    }

    /// Messages and acknowledgements waiting for the next tick.
    pub fn pending(&self) -> usize {
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        outbox.messages.values().map(Vec::len).sum::<usize>()
            + outbox.acks.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Dispatch everything queued right now.
    pub async fn flush(&self, dispatcher: &dyn DataSyncDispatcher, max_batch_bytes: usize) {
        flush_outbox(&self.outbox, dispatcher, max_batch_bytes).await;
    }
}

async fn flush_outbox(
    outbox: &Mutex<Outbox>,
    dispatcher: &dyn DataSyncDispatcher,
    max_batch_bytes: usize,
) {
    let batches = outbox
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain(max_batch_bytes);

    for (peer, wire) in batches {
        let payload = match wire.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "dropping datasync batch that failed to encode");
                continue;
            }
        };
        let batch = DataSyncBatch {
            recipient: peer,
            payload,
            messages: wire.messages.iter().map(|r| r.body.clone()).collect(),
        };

        debug!(
            peer = %peer.short(),
            messages = wire.messages.len(),
            acks = wire.acks.len(),
            "dispatching datasync batch"
        );
        if let Err(e) = dispatcher.dispatch_batch(batch).await {
            warn!(peer = %peer.short(), error = %e, "datasync dispatch failed, requeueing");
            outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .requeue(peer, wire);
        }
    }
}

impl DataSync for BatchingDataSync {
    fn append_message(&self, recipient: &PublicKey, wrapped: &[u8]) -> Result<DataSyncId, DataSyncError> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.local.as_bytes());
        hasher.update(recipient.as_bytes());
        hasher.update(&chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        hasher.update(wrapped);
        let id = *hasher.finalize().as_bytes();

        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .messages
            .entry(*recipient)
            .or_default()
            .push(Record {
                id,
                body: wrapped.to_vec(),
            });
        Ok(id)
    }

    fn unwrap_payloads_and_acks(
        &self,
        sender: &PublicKey,
        payload: &[u8],
    ) -> Result<(Vec<Vec<u8>>, Vec<DataSyncId>), DataSyncError> {
        let batch = WireBatch::from_bytes(payload)?;

        if !batch.messages.is_empty() {
            self.outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .acks
                .entry(*sender)
                .or_default()
                .extend(batch.messages.iter().map(|r| r.id));
        }

        let payloads = batch.messages.into_iter().map(|r| r.body).collect();
        Ok((payloads, batch.acks))
    }

    fn start(&self, dispatcher: Weak<dyn DataSyncDispatcher>, max_batch_bytes: usize) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let outbox = Arc::clone(&self.outbox);
        let period = self.interval;
        info!(interval_ms = period.as_millis() as u64, max_batch_bytes, "starting datasync");

        *task = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(dispatcher) = dispatcher.upgrade() else {
                    debug!("datasync dispatcher gone, stopping");
                    break;
                };
                flush_outbox(&outbox, dispatcher.as_ref(), max_batch_bytes).await;
            }
        }));
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
            info!("datasync stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        batches: Mutex<Vec<DataSyncBatch>>,
        fail: bool,
    }

    #[async_trait]
    impl DataSyncDispatcher for Collect {
        async fn dispatch_batch(&self, batch: DataSyncBatch) -> Result<(), SenderError> {
            if self.fail {
                return Err(SenderError::Configuration("offline".into()));
            }
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn key(b: u8) -> PublicKey {
        PublicKey([b; 32])
    }

    #[tokio::test]
    async fn batches_respect_size_limit() {
        let ds = BatchingDataSync::new(key(1), Duration::from_secs(60));
        for _ in 0..3 {
            ds.append_message(&key(2), &[0u8; 100]).unwrap();
        }

        let sink = Collect::default();
        ds.flush(&sink, 300).await;

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].messages.len(), 2);
        assert_eq!(batches[1].messages.len(), 1);
        assert_eq!(ds.pending(), 0);
    }

    #[tokio::test]
    async fn received_batch_is_acked_back() {
        let alice = BatchingDataSync::new(key(1), Duration::from_secs(60));
        let bob = BatchingDataSync::new(key(2), Duration::from_secs(60));
        let id = alice.append_message(&key(2), b"wrapped").unwrap();

        let sink = Collect::default();
        alice.flush(&sink, 1024).await;
        let batch = sink.batches.lock().unwrap().remove(0);

        let (payloads, acks) = bob.unwrap_payloads_and_acks(&key(1), &batch.payload).unwrap();
        assert_eq!(payloads, vec![b"wrapped".to_vec()]);
        assert!(acks.is_empty());
        assert_eq!(bob.pending(), 1);

        let sink = Collect::default();
        bob.flush(&sink, 1024).await;
        let ack_batch = sink.batches.lock().unwrap().remove(0);
        assert_eq!(ack_batch.recipient, key(1));
        assert!(ack_batch.messages.is_empty());

        let (payloads, acks) = alice.unwrap_payloads_and_acks(&key(2), &ack_batch.payload).unwrap();
        assert!(payloads.is_empty());
        assert_eq!(acks, vec![id]);
    }

    #[tokio::test]
    async fn failed_dispatch_is_requeued() {
        let ds = BatchingDataSync::new(key(1), Duration::from_secs(60));
        ds.append_message(&key(2), b"a").unwrap();

        let failing = Collect {
            fail: true,
            ..Default::default()
        };
        ds.flush(&failing, 1024).await;
        assert_eq!(ds.pending(), 1);
    }

    #[test]
    fn foreign_payload_is_not_datasync() {
        let ds = BatchingDataSync::new(key(1), Duration::from_secs(60));
        assert!(matches!(
            ds.unwrap_payloads_and_acks(&key(2), b"plain"),
            Err(DataSyncError::NotDataSync)
        ));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let ds = BatchingDataSync::new(key(1), Duration::from_millis(10));
        let sink: Arc<dyn DataSyncDispatcher> = Arc::new(Collect::default());
        let weak = Arc::downgrade(&sink);

        ds.start(weak.clone(), 1024);
        ds.start(weak, 1024);
        assert!(ds.is_running());

        ds.stop();
        ds.stop();
        assert!(!ds.is_running());
    }
}
