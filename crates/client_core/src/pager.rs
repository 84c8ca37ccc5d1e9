use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationEvent, ConversationId, EventKind, Message, Sequence},
    protocol::HistoryPage,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    error::{SyncError, SyncResult},
    exclusive::KeyedTaskQueues,
    reconciliation::{CycleCommit, EventReconciliationStore},
    ClientEvent,
};

pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    #[default]
    HoldOnGap,
    ContiguousPrefix,
}

#[async_trait]
pub trait HistoryClient: Send + Sync {
    /// `before` is an exclusive sequence cursor; `None` asks for the newest page.
    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        page_size: u32,
        before: Option<Sequence>,
    ) -> Result<HistoryPage>;
}

pub struct MissingHistoryClient;

#[async_trait]
impl HistoryClient for MissingHistoryClient {
    async fn fetch_page(
        &self,
        _conversation_id: &ConversationId,
        _page_size: u32,
        _before: Option<Sequence>,
    ) -> Result<HistoryPage> {
        Err(anyhow!("history client unavailable"))
    }
}

#[derive(Debug, Clone, Default)]
struct ConversationView {
    messages: Vec<Message>,
    earliest: Option<Sequence>,
    exhausted: bool,
}

impl ConversationView {
    fn position_of(&self, message: &Message) -> Option<usize> {
        self.messages
            .iter()
            .position(|existing| existing.message_id == message.message_id)
    }

    fn insert_sorted(&mut self, message: Message) {
        let index = self
            .messages
            .partition_point(|existing| existing.sequence <= message.sequence);
        self.messages.insert(index, message);
    }

    fn upsert_page_message(&mut self, message: Message) {
        match self.position_of(&message) {
            Some(index) => {
                let existing = &mut self.messages[index];
                existing.parts = message.parts;
                for (participant_id, entries) in message.statuses {
                    for entry in entries {
                        existing.record_status(participant_id.clone(), entry.status, entry.at);
                    }
                }
            }
            None => self.insert_sorted(message),
        }
    }

    fn note_cursor(&mut self, earliest: Sequence) {
        if earliest == 0 {
            return;
        }
        self.earliest = Some(self.earliest.map_or(earliest, |known| known.min(earliest)));
    }

    fn apply(&mut self, event: &ConversationEvent) {
        match &event.kind {
            EventKind::MessageCreated {
                message_id,
                sender_id,
                parts,
                sent_at,
            } => {
                if self.messages.iter().any(|m| &m.message_id == message_id) {
                    return;
                }
                self.insert_sorted(Message {
                    message_id: message_id.clone(),
                    conversation_id: event.conversation_id.clone(),
                    sender_id: sender_id.clone(),
                    sequence: event.sequence,
                    parts: parts.clone(),
                    sent_at: *sent_at,
                    statuses: Default::default(),
                });
            }
            EventKind::MessageEdited { message_id, parts } => {
                match self.messages.iter_mut().find(|m| &m.message_id == message_id) {
                    Some(message) => message.parts = parts.clone(),
                    None => debug!(message_id = %message_id, "sync: edit for unknown message"),
                }
            }
            EventKind::MessageDeleted { message_id } => {
                self.messages.retain(|m| &m.message_id != message_id);
            }
            EventKind::StatusChanged {
                message_id,
                participant_id,
                status,
                at,
            } => match self.messages.iter_mut().find(|m| &m.message_id == message_id) {
                Some(message) => {
                    message.record_status(participant_id.clone(), *status, *at);
                }
                None => debug!(message_id = %message_id, "sync: status for unknown message"),
            },
            EventKind::Unrecognized => {
                debug!(event_id = %event.event_id, "sync: unrecognized event kind skipped");
            }
        }
    }
}

#[derive(Debug, Default)]
struct CyclePlan {
    apply: Vec<ConversationEvent>,
    retain: Vec<ConversationEvent>,
    new_token: Sequence,
}

// Positions at or below `skip_through` need no event.
fn plan_cycle(
    token: Sequence,
    skip_through: Sequence,
    fresh: Vec<ConversationEvent>,
    policy: GapPolicy,
) -> CyclePlan {
    let floor = skip_through.max(token);
    let mut high = token;
    let mut run = 0;
    for event in &fresh {
        if event.sequence > high.max(floor) + 1 {
            break;
        }
        high = event.sequence;
        run += 1;
    }

    let mut apply = fresh;
    let retain = apply.split_off(run);
    if retain.is_empty() || policy == GapPolicy::ContiguousPrefix {
        return CyclePlan {
            apply,
            retain,
            new_token: high.max(floor),
        };
    }

    // Held gap: only what an explicit skip already covers goes through.
    let covered = apply.partition_point(|event| event.sequence <= floor);
    let mut held = apply.split_off(covered);
    held.extend(retain);
    CyclePlan {
        apply,
        retain: held,
        new_token: floor,
    }
}

pub struct ConversationHistoryPager {
    store: Arc<EventReconciliationStore>,
    history: Arc<dyn HistoryClient>,
    queues: KeyedTaskQueues<ConversationId>,
    views: Mutex<HashMap<ConversationId, ConversationView>>,
    page_size: u32,
    gap_policy: GapPolicy,
    events: broadcast::Sender<ClientEvent>,
}

impl ConversationHistoryPager {
    pub fn new(
        store: Arc<EventReconciliationStore>,
        history: Arc<dyn HistoryClient>,
        page_size: u32,
        gap_policy: GapPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            history,
            queues: KeyedTaskQueues::new(),
            views: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
            gap_policy,
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<ClientEvent> {
        self.events.clone()
    }

    pub fn gap_policy(&self) -> GapPolicy {
        self.gap_policy
    }

    pub fn store(&self) -> &Arc<EventReconciliationStore> {
        &self.store
    }

    /// A failed cycle leaves both view and token as they were.
    pub async fn fetch_next_page(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<Message>> {
        self.queues
            .run_exclusive(conversation_id, || async {
                let token = self.store.get_continuation_token(conversation_id).await?;
                let page = self
                    .history
                    .fetch_page(conversation_id, self.page_size, None)
                    .await
                    .map_err(SyncError::transport)?;
                self.reconcile_locked(conversation_id, token, Some(page), 0)
                    .await
            })
            .await
    }

    pub async fn apply_buffered(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<Message>> {
        self.queues
            .run_exclusive(conversation_id, || async {
                let token = self.store.get_continuation_token(conversation_id).await?;
                self.reconcile_locked(conversation_id, token, None, 0).await
            })
            .await
    }

    /// Returns `false` when the event is already covered by the token.
    pub async fn ingest_push_event(&self, event: &ConversationEvent) -> SyncResult<bool> {
        let conversation_id = &event.conversation_id;
        self.queues
            .run_exclusive(conversation_id, || async {
                let token = self
                    .store
                    .get_continuation_token(conversation_id)
                    .await?
                    .unwrap_or(0);
                if event.sequence <= token {
                    debug!(
                        conversation_id = %conversation_id,
                        sequence = event.sequence,
                        token,
                        "sync: replayed push event dropped"
                    );
                    return Ok(false);
                }
                self.store.add_orphaned_event(event).await?;
                Ok(true)
            })
            .await
    }

    pub async fn skip_missing(
        &self,
        conversation_id: &ConversationId,
        through: Sequence,
    ) -> SyncResult<Vec<Message>> {
        self.queues
            .run_exclusive(conversation_id, || async {
                let token = self.store.get_continuation_token(conversation_id).await?;
                if through <= token.unwrap_or(0) {
                    return Ok(self.snapshot(conversation_id).await);
                }
                warn!(
                    conversation_id = %conversation_id,
                    from = token.unwrap_or(0) + 1,
                    through,
                    "sync: skipping missing sequence range"
                );
                self.reconcile_locked(conversation_id, token, None, through)
                    .await
            })
            .await
    }

    /// Never touches the continuation token.
    pub async fn load_older(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<Message>> {
        self.queues
            .run_exclusive(conversation_id, || async {
                let mut view = self
                    .views
                    .lock()
                    .await
                    .get(conversation_id)
                    .cloned()
                    .unwrap_or_default();
                if view.exhausted {
                    return Ok(view.messages);
                }

                let page = self
                    .history
                    .fetch_page(conversation_id, self.page_size, view.earliest)
                    .await
                    .map_err(SyncError::transport)?;
                if !page.orphaned_events.is_empty() {
                    debug!(
                        conversation_id = %conversation_id,
                        ignored = page.orphaned_events.len(),
                        "sync: events on older page left to forward cycles"
                    );
                }

                let fetched = page.messages.len();
                let previous = view.earliest;
                for message in page.messages {
                    view.upsert_page_message(message);
                }
                view.note_cursor(page.earliest_event_id);
                view.exhausted = fetched == 0 || view.earliest == previous;

                let messages = view.messages.clone();
                let earliest = view.earliest;
                let exhausted = view.exhausted;
                self.views
                    .lock()
                    .await
                    .insert(conversation_id.clone(), view);

                info!(
                    conversation_id = %conversation_id,
                    fetched,
                    earliest = ?earliest,
                    exhausted,
                    "sync: older history loaded"
                );
                let _ = self.events.send(ClientEvent::HistoryExtended {
                    conversation_id: conversation_id.clone(),
                    earliest,
                    exhausted,
                });
                Ok(messages)
            })
            .await
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.snapshot(conversation_id).await
    }

    pub async fn forget(&self, conversation_id: &ConversationId) -> SyncResult<()> {
        self.queues
            .run_exclusive(conversation_id, || async {
                self.views.lock().await.remove(conversation_id);
                self.store.clear(conversation_id).await
            })
            .await
    }

    async fn snapshot(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.views
            .lock()
            .await
            .get(conversation_id)
            .map(|view| view.messages.clone())
            .unwrap_or_default()
    }

    async fn reconcile_locked(
        &self,
        conversation_id: &ConversationId,
        token: Option<Sequence>,
        page: Option<HistoryPage>,
        skip_through: Sequence,
    ) -> SyncResult<Vec<Message>> {
        let current = token.unwrap_or(0);
        let buffered = self.store.get_orphaned_events(conversation_id).await?;
        let buffered_ids: HashSet<_> = buffered.iter().map(|e| e.event_id.clone()).collect();

        let (page_messages, page_events, page_earliest) = match page {
            Some(page) => (page.messages, page.orphaned_events, page.earliest_event_id),
            None => (Vec::new(), Vec::new(), 0),
        };

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for event in buffered.into_iter().chain(page_events) {
            if &event.conversation_id != conversation_id {
                warn!(
                    conversation_id = %conversation_id,
                    foreign = %event.conversation_id,
                    event_id = %event.event_id,
                    "sync: page carried an event for another conversation"
                );
                continue;
            }
            if seen.insert(event.event_id.clone()) {
                merged.push(event);
            }
        }
        merged.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });

        // Covered by the token, or a second event claiming a taken sequence.
        let mut discarded = Vec::new();
        let mut fresh: Vec<ConversationEvent> = Vec::new();
        for event in merged {
            let duplicate = fresh
                .last()
                .is_some_and(|last| last.sequence == event.sequence);
            if event.sequence <= current || duplicate {
                discarded.push(event);
            } else {
                fresh.push(event);
            }
        }

        let plan = plan_cycle(current, skip_through, fresh, self.gap_policy);

        let mut view = self
            .views
            .lock()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        for message in page_messages {
            view.upsert_page_message(message);
        }
        view.note_cursor(page_earliest);
        for event in &plan.apply {
            view.apply(event);
        }

        discarded.retain(|event| buffered_ids.contains(&event.event_id));
        discarded.extend(
            plan.apply
                .iter()
                .filter(|event| buffered_ids.contains(&event.event_id))
                .cloned(),
        );
        let retained: Vec<_> = plan
            .retain
            .iter()
            .filter(|event| !buffered_ids.contains(&event.event_id))
            .cloned()
            .collect();
        let advanced = plan.new_token > current;

        self.store
            .commit_cycle(CycleCommit {
                conversation_id,
                expected_token: token,
                new_token: advanced.then_some(plan.new_token),
                retained: &retained,
                discarded: &discarded,
            })
            .await?;

        let messages = view.messages.clone();
        self.views
            .lock()
            .await
            .insert(conversation_id.clone(), view);

        let token = if advanced { plan.new_token } else { current };
        let pending = plan.retain.len();
        if pending > 0 {
            info!(
                conversation_id = %conversation_id,
                token,
                pending,
                next_missing = token + 1,
                "sync: gap holds buffered events"
            );
        }
        info!(
            conversation_id = %conversation_id,
            token,
            applied = plan.apply.len(),
            "sync: cycle committed"
        );
        let _ = self.events.send(ClientEvent::ConversationUpdated {
            conversation_id: conversation_id.clone(),
            token,
            applied: plan.apply.len(),
            pending,
        });
        Ok(messages)
    }
}

#[cfg(test)]
#[path = "tests/pager_tests.rs"]
mod tests;
