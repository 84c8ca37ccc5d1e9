use super::*;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex as StdMutex,
    },
};

use chrono::Utc;
use shared::domain::{ContentPart, DeliveryStatus, EventId, MessageId, ParticipantId};
use storage::MemoryStore;

const CONV: &str = "myConv";

fn text(body: &str) -> Vec<ContentPart> {
    vec![ContentPart::Text {
        text: body.to_string(),
    }]
}

fn event_with(sequence: Sequence, kind: EventKind) -> ConversationEvent {
    ConversationEvent {
        conversation_id: ConversationId::from(CONV),
        event_id: EventId::new(format!("evt-{sequence}")),
        sequence,
        kind,
    }
}

fn created(sequence: Sequence) -> ConversationEvent {
    event_with(
        sequence,
        EventKind::MessageCreated {
            message_id: MessageId::new(format!("msg-{sequence}")),
            sender_id: ParticipantId::from("alice"),
            parts: text(&format!("hello {sequence}")),
            sent_at: Utc::now(),
        },
    )
}

fn pulled_message(sequence: Sequence) -> Message {
    Message {
        message_id: MessageId::new(format!("msg-{sequence}")),
        conversation_id: ConversationId::from(CONV),
        sender_id: ParticipantId::from("bob"),
        sequence,
        parts: text(&format!("pulled {sequence}")),
        sent_at: Utc::now(),
        statuses: Default::default(),
    }
}

#[derive(Default)]
struct ScriptedHistory {
    pages: StdMutex<VecDeque<HistoryPage>>,
    cursors: StdMutex<Vec<Option<Sequence>>>,
    fail: AtomicBool,
}

impl ScriptedHistory {
    fn push_page(&self, page: HistoryPage) {
        self.pages.lock().expect("pages").push_back(page);
    }

    fn cursors(&self) -> Vec<Option<Sequence>> {
        self.cursors.lock().expect("cursors").clone()
    }
}

#[async_trait]
impl HistoryClient for ScriptedHistory {
    async fn fetch_page(
        &self,
        _conversation_id: &ConversationId,
        _page_size: u32,
        before: Option<Sequence>,
    ) -> Result<HistoryPage> {
        self.cursors.lock().expect("cursors").push(before);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("conversation not found"));
        }
        Ok(self
            .pages
            .lock()
            .expect("pages")
            .pop_front()
            .unwrap_or_default())
    }
}

/// Moves the stored token while the cycle is waiting on the network.
struct RacingHistory {
    store: Arc<EventReconciliationStore>,
}

#[async_trait]
impl HistoryClient for RacingHistory {
    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        _page_size: u32,
        _before: Option<Sequence>,
    ) -> Result<HistoryPage> {
        self.store
            .set_continuation_token(conversation_id, 9)
            .await
            .map_err(|err| anyhow!("{err}"))?;
        Ok(HistoryPage {
            orphaned_events: vec![created(1)],
            ..HistoryPage::default()
        })
    }
}

struct Fixture {
    store: Arc<EventReconciliationStore>,
    history: Arc<ScriptedHistory>,
    pager: ConversationHistoryPager,
}

fn fixture(policy: GapPolicy) -> Fixture {
    let store = Arc::new(EventReconciliationStore::new(Arc::new(MemoryStore::new())));
    let history = Arc::new(ScriptedHistory::default());
    let pager = ConversationHistoryPager::new(Arc::clone(&store), history.clone(), 20, policy);
    Fixture {
        store,
        history,
        pager,
    }
}

fn conv() -> ConversationId {
    ConversationId::from(CONV)
}

fn sequences_of(messages: &[Message]) -> Vec<Sequence> {
    messages.iter().map(|message| message.sequence).collect()
}

async fn orphan_sequences(store: &EventReconciliationStore) -> Vec<Sequence> {
    store
        .get_orphaned_events(&conv())
        .await
        .expect("orphans")
        .into_iter()
        .map(|event| event.sequence)
        .collect()
}

#[tokio::test]
async fn push_then_cycle_applies_contiguous_run_end_to_end() {
    let f = fixture(GapPolicy::HoldOnGap);

    assert!(f.pager.ingest_push_event(&created(2)).await.expect("push 2"));
    assert!(f.pager.ingest_push_event(&created(1)).await.expect("push 1"));
    assert_eq!(orphan_sequences(&f.store).await, vec![1, 2]);

    let messages = f.pager.fetch_next_page(&conv()).await.expect("cycle");

    assert_eq!(sequences_of(&messages), vec![1, 2]);
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        Some(2)
    );
    assert!(orphan_sequences(&f.store).await.is_empty());
}

#[tokio::test]
async fn contiguous_events_apply_in_either_arrival_order() {
    for order in [[1, 2], [2, 1]] {
        let f = fixture(GapPolicy::HoldOnGap);
        for sequence in order {
            f.pager
                .ingest_push_event(&created(sequence))
                .await
                .expect("push");
        }

        let messages = f.pager.apply_buffered(&conv()).await.expect("cycle");

        assert_eq!(sequences_of(&messages), vec![1, 2]);
        assert_eq!(
            f.store.get_continuation_token(&conv()).await.expect("token"),
            Some(2)
        );
        assert!(orphan_sequences(&f.store).await.is_empty());
    }
}

#[tokio::test]
async fn gap_holds_token_and_buffered_events() {
    let f = fixture(GapPolicy::HoldOnGap);
    f.store
        .set_continuation_token(&conv(), 2)
        .await
        .expect("seed token");
    f.pager.ingest_push_event(&created(3)).await.expect("push 3");
    f.pager.ingest_push_event(&created(5)).await.expect("push 5");

    let messages = f.pager.fetch_next_page(&conv()).await.expect("cycle");

    assert!(messages.iter().all(|message| message.sequence != 5));
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        Some(2)
    );
    assert_eq!(orphan_sequences(&f.store).await, vec![3, 5]);

    f.pager.ingest_push_event(&created(4)).await.expect("push 4");
    let messages = f.pager.apply_buffered(&conv()).await.expect("cycle");

    assert_eq!(sequences_of(&messages), vec![3, 4, 5]);
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        Some(5)
    );
    assert!(orphan_sequences(&f.store).await.is_empty());
}

#[tokio::test]
async fn contiguous_prefix_policy_applies_up_to_the_gap() {
    let f = fixture(GapPolicy::ContiguousPrefix);
    for sequence in [1, 2, 4] {
        f.pager
            .ingest_push_event(&created(sequence))
            .await
            .expect("push");
    }

    let messages = f.pager.apply_buffered(&conv()).await.expect("cycle");

    assert_eq!(sequences_of(&messages), vec![1, 2]);
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        Some(2)
    );
    assert_eq!(orphan_sequences(&f.store).await, vec![4]);
}

#[tokio::test]
async fn replayed_push_events_are_dropped() {
    let f = fixture(GapPolicy::HoldOnGap);
    f.store
        .set_continuation_token(&conv(), 4)
        .await
        .expect("seed token");

    assert!(!f.pager.ingest_push_event(&created(3)).await.expect("old"));
    assert!(!f.pager.ingest_push_event(&created(4)).await.expect("equal"));
    assert!(orphan_sequences(&f.store).await.is_empty());
}

#[tokio::test]
async fn page_events_merge_with_buffered_events_without_duplicates() {
    let f = fixture(GapPolicy::HoldOnGap);
    f.pager.ingest_push_event(&created(2)).await.expect("push 2");
    f.pager.ingest_push_event(&created(3)).await.expect("push 3");
    f.history.push_page(HistoryPage {
        messages: Vec::new(),
        earliest_event_id: 1,
        orphaned_events: vec![created(1), created(2)],
    });

    let messages = f.pager.fetch_next_page(&conv()).await.expect("cycle");

    assert_eq!(sequences_of(&messages), vec![1, 2, 3]);
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        Some(3)
    );
    assert!(orphan_sequences(&f.store).await.is_empty());
}

#[tokio::test]
async fn page_only_events_with_gap_are_persisted_for_later() {
    let f = fixture(GapPolicy::HoldOnGap);
    f.history.push_page(HistoryPage {
        orphaned_events: vec![created(2)],
        ..HistoryPage::default()
    });

    f.pager.fetch_next_page(&conv()).await.expect("cycle");

    assert_eq!(orphan_sequences(&f.store).await, vec![2]);
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        None
    );
}

#[tokio::test]
async fn failed_fetch_changes_nothing() {
    let f = fixture(GapPolicy::HoldOnGap);
    f.pager.ingest_push_event(&created(1)).await.expect("push");
    f.pager.apply_buffered(&conv()).await.expect("first cycle");
    f.pager.ingest_push_event(&created(2)).await.expect("push");
    f.history.fail.store(true, Ordering::SeqCst);

    let err = f
        .pager
        .fetch_next_page(&conv())
        .await
        .expect_err("fetch fails");

    assert!(matches!(err, SyncError::Transport(_)));
    assert_eq!(err.to_string(), "conversation not found");
    assert_eq!(sequences_of(&f.pager.messages(&conv()).await), vec![1]);
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        Some(1)
    );
    assert_eq!(orphan_sequences(&f.store).await, vec![2]);
}

#[tokio::test]
async fn token_moved_during_cycle_is_a_conflict() {
    let store = Arc::new(EventReconciliationStore::new(Arc::new(MemoryStore::new())));
    let history = Arc::new(RacingHistory {
        store: Arc::clone(&store),
    });
    let pager =
        ConversationHistoryPager::new(Arc::clone(&store), history, 20, GapPolicy::HoldOnGap);

    let err = pager
        .fetch_next_page(&conv())
        .await
        .expect_err("stale token");

    assert!(err.is_conflict());
    assert!(pager.messages(&conv()).await.is_empty());
    assert_eq!(
        store.get_continuation_token(&conv()).await.expect("token"),
        Some(9)
    );
    assert!(orphan_sequences(&store).await.is_empty());
}

#[tokio::test]
async fn skip_missing_unblocks_held_events() {
    let f = fixture(GapPolicy::HoldOnGap);
    f.store
        .set_continuation_token(&conv(), 2)
        .await
        .expect("seed token");
    f.pager.ingest_push_event(&created(3)).await.expect("push 3");
    f.pager.ingest_push_event(&created(5)).await.expect("push 5");

    let messages = f.pager.skip_missing(&conv(), 4).await.expect("skip");

    assert_eq!(sequences_of(&messages), vec![3, 5]);
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        Some(5)
    );
    assert!(orphan_sequences(&f.store).await.is_empty());

    // Already covered: nothing changes.
    f.pager.skip_missing(&conv(), 1).await.expect("no-op skip");
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        Some(5)
    );
}

#[tokio::test]
async fn event_kinds_shape_the_view() {
    let f = fixture(GapPolicy::HoldOnGap);
    let first = MessageId::from("msg-1");
    let reader = ParticipantId::from("bob");
    let read_at = Utc::now();
    let events = vec![
        created(1),
        created(2),
        event_with(
            3,
            EventKind::StatusChanged {
                message_id: first.clone(),
                participant_id: reader.clone(),
                status: DeliveryStatus::Read,
                at: read_at,
            },
        ),
        event_with(
            4,
            EventKind::MessageEdited {
                message_id: first.clone(),
                parts: text("edited"),
            },
        ),
        event_with(
            5,
            EventKind::MessageDeleted {
                message_id: MessageId::from("msg-2"),
            },
        ),
        event_with(6, EventKind::Unrecognized),
    ];
    for event in events.iter().rev() {
        f.pager.ingest_push_event(event).await.expect("push");
    }

    let messages = f.pager.apply_buffered(&conv()).await.expect("cycle");

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_id, first);
    assert_eq!(messages[0].parts, text("edited"));
    assert_eq!(
        messages[0].status_of(&reader, DeliveryStatus::Read),
        Some(read_at)
    );
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        Some(6)
    );
}

#[tokio::test]
async fn unknown_kind_from_the_wire_fills_its_sequence_slot() {
    let f = fixture(GapPolicy::HoldOnGap);
    let unknown = r#"{
        "conversation_id": "myConv",
        "event_id": "evt-2",
        "sequence": 2,
        "kind": {"type": "participant_added", "payload": {"participant_id": "carol"}}
    }"#;
    let pushed: ConversationEvent = serde_json::from_str(unknown).expect("decode push");
    assert!(f.pager.ingest_push_event(&pushed).await.expect("push 2"));
    // Buffered through the store's JSON records and read back.
    assert_eq!(
        f.store.get_orphaned_events(&conv()).await.expect("orphans")[0].kind,
        EventKind::Unrecognized
    );

    let page_json = format!(
        r#"{{"messages": [], "earliest_event_id": 1, "orphaned_events": [{}, {}]}}"#,
        serde_json::to_string(&created(1)).expect("encode 1"),
        serde_json::to_string(&created(3)).expect("encode 3"),
    );
    f.history
        .push_page(serde_json::from_str(&page_json).expect("decode page"));

    let messages = f.pager.fetch_next_page(&conv()).await.expect("cycle");

    assert_eq!(sequences_of(&messages), vec![1, 3]);
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        Some(3)
    );
    assert!(orphan_sequences(&f.store).await.is_empty());
}

#[tokio::test]
async fn load_older_pages_backwards_without_touching_token() {
    let f = fixture(GapPolicy::HoldOnGap);
    f.history.push_page(HistoryPage {
        messages: vec![pulled_message(10), pulled_message(11)],
        earliest_event_id: 10,
        orphaned_events: Vec::new(),
    });
    f.history.push_page(HistoryPage {
        messages: vec![pulled_message(4), pulled_message(7)],
        earliest_event_id: 4,
        orphaned_events: Vec::new(),
    });

    f.pager.fetch_next_page(&conv()).await.expect("cycle");
    let messages = f.pager.load_older(&conv()).await.expect("older");
    assert_eq!(sequences_of(&messages), vec![4, 7, 10, 11]);

    // The scripted history is now empty: that page ends the backlog.
    f.pager.load_older(&conv()).await.expect("older again");
    f.pager.load_older(&conv()).await.expect("exhausted");

    assert_eq!(f.history.cursors(), vec![None, Some(10), Some(4)]);
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        None
    );
}

#[tokio::test]
async fn pulled_messages_merge_statuses_into_existing_entries() {
    let f = fixture(GapPolicy::HoldOnGap);
    f.pager.ingest_push_event(&created(1)).await.expect("push");
    f.pager.apply_buffered(&conv()).await.expect("cycle");

    let delivered_at = Utc::now();
    let mut pulled = pulled_message(1);
    pulled.record_status(
        ParticipantId::from("carol"),
        DeliveryStatus::Delivered,
        delivered_at,
    );
    f.history.push_page(HistoryPage {
        messages: vec![pulled],
        ..HistoryPage::default()
    });

    let messages = f.pager.fetch_next_page(&conv()).await.expect("cycle");

    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0].status_of(&ParticipantId::from("carol"), DeliveryStatus::Delivered),
        Some(delivered_at)
    );
}

#[tokio::test]
async fn successful_cycle_broadcasts_update() {
    let f = fixture(GapPolicy::HoldOnGap);
    let mut events = f.pager.subscribe_events();
    f.pager.ingest_push_event(&created(1)).await.expect("push");
    f.pager.ingest_push_event(&created(3)).await.expect("push");

    f.pager.apply_buffered(&conv()).await.expect("cycle");

    match events.recv().await.expect("event") {
        ClientEvent::ConversationUpdated {
            conversation_id,
            token,
            applied,
            pending,
        } => {
            assert_eq!(conversation_id, conv());
            assert_eq!(token, 0);
            assert_eq!(applied, 0);
            assert_eq!(pending, 2);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn forget_drops_view_and_stored_state() {
    let f = fixture(GapPolicy::HoldOnGap);
    f.pager.ingest_push_event(&created(1)).await.expect("push");
    f.pager.apply_buffered(&conv()).await.expect("cycle");
    f.pager.ingest_push_event(&created(3)).await.expect("push");

    f.pager.forget(&conv()).await.expect("forget");

    assert!(f.pager.messages(&conv()).await.is_empty());
    assert_eq!(
        f.store.get_continuation_token(&conv()).await.expect("token"),
        None
    );
    assert!(orphan_sequences(&f.store).await.is_empty());
}

#[test]
fn plan_holds_whole_set_on_gap_unless_skipped() {
    let held = plan_cycle(2, 0, vec![created(3), created(5)], GapPolicy::HoldOnGap);
    assert!(held.apply.is_empty());
    assert_eq!(held.new_token, 2);
    assert_eq!(held.retain.len(), 2);

    let skipped = plan_cycle(2, 3, vec![created(3), created(5)], GapPolicy::HoldOnGap);
    assert_eq!(skipped.apply.len(), 1);
    assert_eq!(skipped.new_token, 3);
    assert_eq!(skipped.retain.len(), 1);
}
