//! PALAVER Storage - Conversation State Store
//!
//! Defines the storage abstraction for conversation state records and QUD
//! rows, plus the in-memory reference implementation used in tests and
//! single-process deployments.
//!
//! Every mutation goes through [`ConversationStore::transact`]: an exclusive
//! per-conversation lock is acquired within a bounded wait, the closure runs
//! against a staged copy of the record, and the result commits all-or-nothing.
//! Operations on different conversations never block each other.

use palaver_core::{
    ConversationId, ConversationState, MoveKind, PalaverResult, Qud, QudId, QudStatus,
    StorageError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::{Duration, Instant};

// ============================================================================
// TRANSACTION VIEW
// ============================================================================

/// Mutable view over one conversation's state record and QUD rows, staged
/// inside a transaction. Changes become visible only when the transaction
/// closure returns `Ok`.
pub struct StateTxn<'a> {
    state: &'a mut ConversationState,
    quds: &'a mut HashMap<QudId, Qud>,
}

impl<'a> StateTxn<'a> {
    pub fn state(&self) -> &ConversationState {
        self.state
    }

    pub fn state_mut(&mut self) -> &mut ConversationState {
        self.state
    }

    pub fn qud(&self, qud_id: QudId) -> Option<&Qud> {
        self.quds.get(&qud_id)
    }

    pub fn qud_mut(&mut self, qud_id: QudId) -> Option<&mut Qud> {
        self.quds.get_mut(&qud_id)
    }

    /// Stage a new QUD row.
    pub fn insert_qud(&mut self, qud: Qud) {
        self.quds.insert(qud.qud_id, qud);
    }

    /// Append a structured event to the conversation's move ring buffer.
    pub fn record(&mut self, kind: MoveKind) {
        self.state.last_moves.push(kind);
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Storage abstraction for conversation state.
///
/// Implementations must serialize all mutation per conversation id and keep
/// independent conversations independent. Read accessors have no side
/// effects; state records are created lazily by [`state_get_or_create`] and
/// by transactions, and never deleted.
///
/// [`state_get_or_create`]: ConversationStore::state_get_or_create
pub trait ConversationStore: Send + Sync {
    /// Get a conversation's state, or `None` if it was never referenced.
    fn state_get(&self, conversation_id: ConversationId)
        -> PalaverResult<Option<ConversationState>>;

    /// Get a conversation's state, creating an empty record on first
    /// reference.
    fn state_get_or_create(
        &self,
        conversation_id: ConversationId,
    ) -> PalaverResult<ConversationState>;

    /// Get a QUD row by id.
    fn qud_get(
        &self,
        conversation_id: ConversationId,
        qud_id: QudId,
    ) -> PalaverResult<Option<Qud>>;

    /// All QUDs still `Open` for the conversation, ordered by turn index
    /// ascending. This includes open questions no longer on the bounded
    /// stack; the stack is a visibility window, not the full open set.
    fn open_quds(&self, conversation_id: ConversationId) -> PalaverResult<Vec<Qud>>;

    /// Run `f` as one atomic read-modify-write against the conversation's
    /// record. An `Err` from the closure discards every staged change and is
    /// propagated unchanged.
    fn transact(
        &self,
        conversation_id: ConversationId,
        f: &mut dyn FnMut(&mut StateTxn<'_>) -> PalaverResult<()>,
    ) -> PalaverResult<()>;

    /// Add a mutually-known fact to common ground. Additive only: a new
    /// value for an existing key replaces it, keys are never removed.
    fn add_common_ground(
        &self,
        conversation_id: ConversationId,
        key: &str,
        value: serde_json::Value,
    ) -> PalaverResult<()> {
        self.transact(conversation_id, &mut |txn| {
            txn.state_mut()
                .common_ground
                .insert(key.to_string(), value.clone());
            txn.record(MoveKind::CommonGroundAdded {
                key: key.to_string(),
            });
            Ok(())
        })
    }

    /// Append a standalone structured event to the move ring buffer.
    fn record_move(&self, conversation_id: ConversationId, kind: MoveKind) -> PalaverResult<()> {
        self.transact(conversation_id, &mut |txn| {
            txn.record(kind.clone());
            Ok(())
        })
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// One conversation's persistent record: the state row plus its QUD rows.
#[derive(Debug, Clone)]
struct Record {
    state: ConversationState,
    quds: HashMap<QudId, Qud>,
}

impl Record {
    fn new(conversation_id: ConversationId, move_log_capacity: usize) -> Self {
        Self {
            state: ConversationState::new(conversation_id, move_log_capacity),
            quds: HashMap::new(),
        }
    }
}

/// In-memory conversation store.
///
/// The outer map is only held long enough to fetch or insert the
/// per-conversation mutex; all real work happens under the inner lock, so
/// transactions on different conversations proceed concurrently.
#[derive(Debug)]
pub struct InMemoryStore {
    conversations: RwLock<HashMap<ConversationId, Arc<Mutex<Record>>>>,
    lock_timeout: Duration,
    move_log_capacity: usize,
}

impl InMemoryStore {
    pub fn new(lock_timeout: Duration, move_log_capacity: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            lock_timeout,
            move_log_capacity,
        }
    }

    /// Number of conversations ever referenced.
    pub fn conversation_count(&self) -> usize {
        self.conversations.read().map(|m| m.len()).unwrap_or(0)
    }

    fn record_handle(
        &self,
        conversation_id: ConversationId,
    ) -> PalaverResult<Option<Arc<Mutex<Record>>>> {
        let map = self
            .conversations
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(map.get(&conversation_id).map(Arc::clone))
    }

    fn record_handle_or_create(
        &self,
        conversation_id: ConversationId,
    ) -> PalaverResult<Arc<Mutex<Record>>> {
        if let Some(handle) = self.record_handle(conversation_id)? {
            return Ok(handle);
        }
        let mut map = self
            .conversations
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let handle = map.entry(conversation_id).or_insert_with(|| {
            tracing::debug!(%conversation_id, "created conversation state record");
            Arc::new(Mutex::new(Record::new(
                conversation_id,
                self.move_log_capacity,
            )))
        });
        Ok(Arc::clone(handle))
    }

    /// Acquire the per-conversation lock within the configured bounded wait.
    fn lock_record<'a>(
        &self,
        handle: &'a Arc<Mutex<Record>>,
        conversation_id: ConversationId,
    ) -> PalaverResult<MutexGuard<'a, Record>> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match handle.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(_)) => {
                    return Err(StorageError::LockPoisoned.into());
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(StorageError::ConcurrencyConflict {
                            conversation_id,
                            waited_ms: self.lock_timeout.as_millis() as u64,
                        }
                        .into());
                    }
                    std::thread::sleep(Duration::from_micros(100));
                }
            }
        }
    }
}

impl ConversationStore for InMemoryStore {
    fn state_get(
        &self,
        conversation_id: ConversationId,
    ) -> PalaverResult<Option<ConversationState>> {
        match self.record_handle(conversation_id)? {
            None => Ok(None),
            Some(handle) => {
                let guard = self.lock_record(&handle, conversation_id)?;
                Ok(Some(guard.state.clone()))
            }
        }
    }

    fn state_get_or_create(
        &self,
        conversation_id: ConversationId,
    ) -> PalaverResult<ConversationState> {
        let handle = self.record_handle_or_create(conversation_id)?;
        let guard = self.lock_record(&handle, conversation_id)?;
        Ok(guard.state.clone())
    }

    fn qud_get(
        &self,
        conversation_id: ConversationId,
        qud_id: QudId,
    ) -> PalaverResult<Option<Qud>> {
        match self.record_handle(conversation_id)? {
            None => Ok(None),
            Some(handle) => {
                let guard = self.lock_record(&handle, conversation_id)?;
                Ok(guard.quds.get(&qud_id).cloned())
            }
        }
    }

    fn open_quds(&self, conversation_id: ConversationId) -> PalaverResult<Vec<Qud>> {
        match self.record_handle(conversation_id)? {
            None => Ok(Vec::new()),
            Some(handle) => {
                let guard = self.lock_record(&handle, conversation_id)?;
                let mut open: Vec<Qud> = guard
                    .quds
                    .values()
                    .filter(|q| q.status == QudStatus::Open)
                    .cloned()
                    .collect();
                open.sort_by_key(|q| q.turn_index);
                Ok(open)
            }
        }
    }

    fn transact(
        &self,
        conversation_id: ConversationId,
        f: &mut dyn FnMut(&mut StateTxn<'_>) -> PalaverResult<()>,
    ) -> PalaverResult<()> {
        let handle = self.record_handle_or_create(conversation_id)?;
        let mut guard = self.lock_record(&handle, conversation_id)?;

        // Stage against a copy so a failed closure leaves the committed
        // record untouched.
        let mut staged = guard.clone();
        let mut txn = StateTxn {
            state: &mut staged.state,
            quds: &mut staged.quds,
        };
        f(&mut txn)?;

        staged.state.touch();
        *guard = staged;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::{new_entity_id, PalaverError, Qud, ValidationError};
    use serde_json::json;

    fn store() -> InMemoryStore {
        InMemoryStore::new(Duration::from_millis(200), 10)
    }

    #[test]
    fn test_state_created_lazily() {
        let store = store();
        let conversation = new_entity_id();

        assert!(store.state_get(conversation).unwrap().is_none());
        assert_eq!(store.conversation_count(), 0);

        let state = store.state_get_or_create(conversation).unwrap();
        assert_eq!(state.conversation_id, conversation);
        assert!(state.qud_stack.is_empty());
        assert_eq!(store.conversation_count(), 1);
        assert!(store.state_get(conversation).unwrap().is_some());
    }

    #[test]
    fn test_transact_commits_on_ok() {
        let store = store();
        let conversation = new_entity_id();

        store
            .transact(conversation, &mut |txn| {
                txn.state_mut().current_topic = Some("weather".to_string());
                Ok(())
            })
            .unwrap();

        let state = store.state_get(conversation).unwrap().unwrap();
        assert_eq!(state.current_topic.as_deref(), Some("weather"));
        assert!(state.updated_at >= state.created_at);
    }

    #[test]
    fn test_transact_discards_on_err() {
        let store = store();
        let conversation = new_entity_id();
        store.state_get_or_create(conversation).unwrap();

        let result = store.transact(conversation, &mut |txn| {
            txn.state_mut().current_topic = Some("weather".to_string());
            txn.insert_qud(Qud::new(conversation, "directive.ask", "?", "user", 1));
            txn.record(MoveKind::ExpectationCleared);
            Err(ValidationError::InvalidArgument {
                field: "test".to_string(),
                value: "test".to_string(),
                reason: "injected failure".to_string(),
            }
            .into())
        });
        assert!(matches!(result, Err(PalaverError::Validation(_))));

        let state = store.state_get(conversation).unwrap().unwrap();
        assert_eq!(state.current_topic, None);
        assert!(state.last_moves.is_empty());
        assert!(store.open_quds(conversation).unwrap().is_empty());
    }

    #[test]
    fn test_open_quds_sorted_and_off_stack_included() {
        let store = store();
        let conversation = new_entity_id();

        let late = Qud::new(conversation, "directive.ask", "later?", "user", 9);
        let early = Qud::new(conversation, "directive.ask", "first?", "user", 2);
        let late_id = late.qud_id;
        let early_id = early.qud_id;

        store
            .transact(conversation, &mut |txn| {
                txn.insert_qud(late.clone());
                txn.insert_qud(early.clone());
                // Only one of them is on the visibility window.
                txn.state_mut().qud_stack = vec![late_id];
                Ok(())
            })
            .unwrap();

        let open = store.open_quds(conversation).unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].qud_id, early_id);
        assert_eq!(open[1].qud_id, late_id);
    }

    #[test]
    fn test_add_common_ground_is_additive() {
        let store = store();
        let conversation = new_entity_id();

        store
            .add_common_ground(conversation, "user_name", json!("Ari"))
            .unwrap();
        store
            .add_common_ground(conversation, "favorite_color", json!("green"))
            .unwrap();

        let state = store.state_get(conversation).unwrap().unwrap();
        assert_eq!(state.common_ground.len(), 2);
        assert_eq!(state.common_ground["user_name"], json!("Ari"));
        assert_eq!(state.last_moves.len(), 2);
    }

    #[test]
    fn test_reentrant_transact_times_out_with_conflict() {
        let store = InMemoryStore::new(Duration::from_millis(30), 10);
        let conversation = new_entity_id();

        let result = store.transact(conversation, &mut |_txn| {
            // The inner attempt contends on the same conversation lock and
            // must fail with a bounded-wait conflict, not deadlock.
            store.transact(conversation, &mut |_| Ok(()))
        });
        assert!(matches!(
            result,
            Err(PalaverError::Storage(StorageError::ConcurrencyConflict { .. }))
        ));
    }

    #[test]
    fn test_concurrent_transactions_serialize() {
        let store = Arc::new(InMemoryStore::new(Duration::from_secs(2), 100));
        let conversation = new_entity_id();
        store.state_get_or_create(conversation).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    store
                        .transact(conversation, &mut |txn| {
                            txn.record(MoveKind::ExpectationCleared);
                            Ok(())
                        })
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // No lost updates: all 80 appends landed in the (large) ring buffer.
        let state = store.state_get(conversation).unwrap().unwrap();
        assert_eq!(state.last_moves.len(), 80);
    }
}
