use shared::domain::{ConversationId, Sequence};

pub mod config;
pub mod error;
pub mod exclusive;
pub mod pager;
pub mod reconciliation;
pub mod runtime;
pub mod session;
pub mod transport;

pub use config::{load_settings, load_settings_from, ClientSettings};
pub use error::{SyncError, SyncResult};
pub use exclusive::{ExclusiveTaskQueue, ExclusiveTicket, KeyedTaskQueues};
pub use pager::{ConversationHistoryPager, GapPolicy, HistoryClient, MissingHistoryClient};
pub use reconciliation::{EventReconciliationStore, StoreMode};
pub use runtime::{ConversationStatus, RuntimeParts, SyncRuntime};
pub use session::{
    ConnectionState, MissingSocket, SessionConnectionManager, SessionProvider, SocketConnection,
};
pub use transport::{HttpHistoryClient, HttpSessionProvider, WsSocket};

/// Notifications for application consumers, delivered over a broadcast channel.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConversationUpdated {
        conversation_id: ConversationId,
        token: Sequence,
        applied: usize,
        /// Events still buffered behind a gap.
        pending: usize,
    },
    HistoryExtended {
        conversation_id: ConversationId,
        earliest: Option<Sequence>,
        exhausted: bool,
    },
    SessionExpired,
    Error(String),
}
