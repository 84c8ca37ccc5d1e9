use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use shared::domain::{ConversationEvent, ConversationId, Sequence};
use storage::{
    MemoryStore, RecordOp, RecordStore, RecordWrite, ScanDirection, StorageUnsupported,
    StoredRecord,
};
use tokio::{sync::OnceCell, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    error::{to_position, to_sequence, SyncError, SyncResult},
    exclusive::ExclusiveTaskQueue,
};

pub const CONTINUATION_TOKENS: &str = "continuation_tokens";
pub const ORPHANED_EVENTS: &str = "orphaned_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Durable,
    Volatile,
}

#[derive(Debug, Clone)]
enum InitOutcome {
    Durable,
    Volatile { reason: String },
    Failed { detail: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenRecord {
    conversation_id: ConversationId,
    sequence: Sequence,
}

#[derive(Debug, Clone, Copy)]
pub struct CycleCommit<'a> {
    pub conversation_id: &'a ConversationId,
    /// The token the cycle started from; a different stored value aborts the commit.
    pub expected_token: Option<Sequence>,
    pub new_token: Option<Sequence>,
    pub retained: &'a [ConversationEvent],
    pub discarded: &'a [ConversationEvent],
}

/// The backing store is opened once, by whichever operation comes first.
pub struct EventReconciliationStore {
    durable: Arc<dyn RecordStore>,
    volatile: MemoryStore,
    init: OnceCell<InitOutcome>,
    maintenance: ExclusiveTaskQueue,
}

impl EventReconciliationStore {
    pub fn new(durable: Arc<dyn RecordStore>) -> Self {
        Self {
            durable,
            volatile: MemoryStore::new(),
            init: OnceCell::new(),
            maintenance: ExclusiveTaskQueue::new(),
        }
    }

    pub fn without_durable_storage(reason: impl Into<String>) -> Self {
        Self {
            durable: Arc::new(MemoryStore::new()),
            volatile: MemoryStore::new(),
            init: OnceCell::new_with(Some(InitOutcome::Volatile {
                reason: reason.into(),
            })),
            maintenance: ExclusiveTaskQueue::new(),
        }
    }

    async fn outcome(&self) -> &InitOutcome {
        self.init
            .get_or_init(|| async {
                match self.durable.open().await {
                    Ok(()) => {
                        info!("store: durable reconciliation store ready");
                        InitOutcome::Durable
                    }
                    Err(err) => match err.downcast_ref::<StorageUnsupported>() {
                        Some(unsupported) => {
                            error!(
                                reason = %unsupported.reason,
                                "store: durable storage unsupported; continuing with volatile state"
                            );
                            InitOutcome::Volatile {
                                reason: unsupported.reason.clone(),
                            }
                        }
                        None => {
                            error!("store: initialization failed: {err:#}");
                            InitOutcome::Failed {
                                detail: format!("{err:#}"),
                            }
                        }
                    },
                }
            })
            .await
    }

    async fn backend(&self) -> SyncResult<&dyn RecordStore> {
        match self.outcome().await {
            InitOutcome::Durable => Ok(self.durable.as_ref()),
            InitOutcome::Volatile { .. } => Ok(&self.volatile),
            InitOutcome::Failed { detail } => Err(SyncError::Storage(anyhow!(
                "reconciliation store unavailable: {detail}"
            ))),
        }
    }

    /// Unsupported durable storage is reported here only; data operations
    /// fall back to volatile state.
    pub async fn initialize(&self) -> SyncResult<StoreMode> {
        match self.outcome().await {
            InitOutcome::Durable => Ok(StoreMode::Durable),
            InitOutcome::Volatile { reason } => {
                Err(SyncError::UnsupportedPlatform(reason.clone()))
            }
            InitOutcome::Failed { detail } => Err(SyncError::Storage(anyhow!(
                "reconciliation store unavailable: {detail}"
            ))),
        }
    }

    pub fn mode(&self) -> Option<StoreMode> {
        self.init.get().and_then(|outcome| match outcome {
            InitOutcome::Durable => Some(StoreMode::Durable),
            InitOutcome::Volatile { .. } => Some(StoreMode::Volatile),
            InitOutcome::Failed { .. } => None,
        })
    }

    pub async fn get_continuation_token(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Option<Sequence>> {
        let record = self
            .backend()
            .await?
            .get(CONTINUATION_TOKENS, conversation_id.as_str())
            .await
            .map_err(|err| SyncError::from_store(Some(conversation_id), err))?;
        Ok(record.map(|record| to_sequence(record.position)))
    }

    pub async fn set_continuation_token(
        &self,
        conversation_id: &ConversationId,
        sequence: Sequence,
    ) -> SyncResult<()> {
        let record = token_write(conversation_id, sequence)?;
        self.backend()
            .await?
            .upsert(CONTINUATION_TOKENS, record)
            .await
            .map_err(|err| SyncError::from_store(Some(conversation_id), err))?;
        debug!(conversation_id = %conversation_id, sequence, "store: continuation token set");
        Ok(())
    }

    pub async fn add_orphaned_event(&self, event: &ConversationEvent) -> SyncResult<()> {
        let record = orphan_write(event)?;
        self.backend()
            .await?
            .upsert(ORPHANED_EVENTS, record)
            .await
            .map_err(|err| SyncError::from_store(Some(&event.conversation_id), err))?;
        debug!(
            conversation_id = %event.conversation_id,
            event_id = %event.event_id,
            sequence = event.sequence,
            "store: orphaned event buffered"
        );
        Ok(())
    }

    pub async fn remove_orphaned_event(&self, event: &ConversationEvent) -> SyncResult<()> {
        self.backend()
            .await?
            .delete(ORPHANED_EVENTS, event.event_id.as_str())
            .await
            .map_err(|err| SyncError::from_store(Some(&event.conversation_id), err))?;
        Ok(())
    }

    /// Buffered events for one conversation, ascending by sequence.
    pub async fn get_orphaned_events(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<ConversationEvent>> {
        let records = self
            .backend()
            .await?
            .scan_partition(
                ORPHANED_EVENTS,
                conversation_id.as_str(),
                ScanDirection::Ascending,
            )
            .await
            .map_err(|err| SyncError::from_store(Some(conversation_id), err))?;

        let mut events = records
            .iter()
            .map(decode_orphan)
            .collect::<SyncResult<Vec<_>>>()?;
        events.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        Ok(events)
    }

    pub async fn clear(&self, conversation_id: &ConversationId) -> SyncResult<()> {
        let backend = self.backend().await?;
        backend
            .delete(CONTINUATION_TOKENS, conversation_id.as_str())
            .await
            .map_err(|err| SyncError::from_store(Some(conversation_id), err))?;
        let removed = backend
            .delete_partition(ORPHANED_EVENTS, conversation_id.as_str())
            .await
            .map_err(|err| SyncError::from_store(Some(conversation_id), err))?;
        info!(conversation_id = %conversation_id, removed, "store: conversation state cleared");
        Ok(())
    }

    pub async fn clear_all(&self) -> SyncResult<()> {
        let backend = self.backend().await?;
        let tokens = backend
            .clear_collection(CONTINUATION_TOKENS)
            .await
            .map_err(|err| SyncError::from_store(None, err))?;
        let orphans = backend
            .clear_collection(ORPHANED_EVENTS)
            .await
            .map_err(|err| SyncError::from_store(None, err))?;
        info!(tokens, orphans, "store: all reconciliation state cleared");
        Ok(())
    }

    /// Fails with [`SyncError::Conflict`] when the stored token moved.
    pub async fn commit_cycle(&self, commit: CycleCommit<'_>) -> SyncResult<()> {
        let conversation_id = commit.conversation_id;
        let mut ops = vec![RecordOp::ExpectPosition {
            collection: CONTINUATION_TOKENS.to_string(),
            key: conversation_id.to_string(),
            position: commit.expected_token.map(to_position).transpose()?,
        }];

        if let Some(sequence) = commit.new_token {
            ops.push(RecordOp::Upsert {
                collection: CONTINUATION_TOKENS.to_string(),
                record: token_write(conversation_id, sequence)?,
            });
        }
        for event in commit.retained {
            ops.push(RecordOp::Upsert {
                collection: ORPHANED_EVENTS.to_string(),
                record: orphan_write(event)?,
            });
        }
        for event in commit.discarded {
            ops.push(RecordOp::Delete {
                collection: ORPHANED_EVENTS.to_string(),
                key: event.event_id.to_string(),
            });
        }

        self.backend()
            .await?
            .apply_batch(ops)
            .await
            .map_err(|err| SyncError::from_store(Some(conversation_id), err))
    }

    pub async fn purge_stale_orphans(&self, max_age: Duration) -> SyncResult<u64> {
        self.maintenance
            .run_exclusive(|| async {
                let max_age = chrono::Duration::from_std(max_age)
                    .context("purge retention out of range")
                    .map_err(SyncError::Storage)?;
                let cutoff = chrono::Utc::now() - max_age;
                let purged = self
                    .backend()
                    .await?
                    .purge_older_than(ORPHANED_EVENTS, cutoff)
                    .await
                    .map_err(|err| SyncError::from_store(None, err))?;
                if purged > 0 {
                    info!(purged, "store: stale orphaned events purged");
                }
                Ok::<_, SyncError>(purged)
            })
            .await
    }

    pub fn spawn_purge_task(
        self: &Arc<Self>,
        every: Duration,
        max_age: Duration,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so startup is not a purge.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = store.purge_stale_orphans(max_age).await {
                    warn!("store: scheduled purge failed: {err}");
                }
            }
        })
    }
}

fn token_write(conversation_id: &ConversationId, sequence: Sequence) -> SyncResult<RecordWrite> {
    let value = serde_json::to_string(&TokenRecord {
        conversation_id: conversation_id.clone(),
        sequence,
    })
    .context("failed to encode continuation token")
    .map_err(SyncError::Storage)?;
    Ok(RecordWrite {
        key: conversation_id.to_string(),
        partition: conversation_id.to_string(),
        position: to_position(sequence)?,
        value,
    })
}

fn orphan_write(event: &ConversationEvent) -> SyncResult<RecordWrite> {
    let value = serde_json::to_string(event)
        .with_context(|| format!("failed to encode event {}", event.event_id))
        .map_err(SyncError::Storage)?;
    Ok(RecordWrite {
        key: event.event_id.to_string(),
        partition: event.conversation_id.to_string(),
        position: to_position(event.sequence)?,
        value,
    })
}

fn decode_orphan(record: &StoredRecord) -> SyncResult<ConversationEvent> {
    serde_json::from_str(&record.value)
        .with_context(|| format!("corrupt orphaned event record '{}'", record.key))
        .map_err(SyncError::Storage)
}

#[cfg(test)]
#[path = "tests/reconciliation_tests.rs"]
mod tests;
