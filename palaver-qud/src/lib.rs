//! PALAVER QUD - Question Under Discussion Stack Manager
//!
//! Tracks which discourse questions are currently live for a conversation,
//! under a bounded working-set depth that models working-memory limits.
//! Overflow is absorbed, never rejected: the oldest question is demoted into
//! a surviving question's sub-question list, so push cannot fail for
//! capacity reasons and no question is silently dropped.

use chrono::Utc;
use palaver_core::{
    ConversationId, ConversationState, EntityKind, MoveKind, PalaverResult, Qud, QudId,
    Resolution, SequencePosition, StorageError, SubQuestionOrigin, SubQuestionRef, TrackerConfig,
    TurnIndex,
};
use palaver_storage::ConversationStore;
use std::sync::Arc;

// ============================================================================
// INPUTS AND OUTPUTS
// ============================================================================

/// Input for pushing a new discourse question.
#[derive(Debug, Clone)]
pub struct NewQud {
    pub act_code: String,
    pub question_text: String,
    pub speaker: String,
    pub topic: Option<String>,
    pub entities: Vec<String>,
    pub turn_index: TurnIndex,
}

impl NewQud {
    pub fn new(
        act_code: impl Into<String>,
        question_text: impl Into<String>,
        turn_index: TurnIndex,
    ) -> Self {
        Self {
            act_code: act_code.into(),
            question_text: question_text.into(),
            speaker: "user".to_string(),
            topic: None,
            entities: Vec::new(),
            turn_index,
        }
    }

    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        self.speaker = speaker.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_entities(mut self, entities: Vec<String>) -> Self {
        self.entities = entities;
        self
    }
}

/// Outcome of a resolve operation. `on_stack` is false when the QUD was
/// resolved out of order, i.e. its id was no longer on the visibility
/// window. That is permitted, only flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub on_stack: bool,
}

// ============================================================================
// STACK MANAGER
// ============================================================================

/// Service object for QUD stack operations. Constructed with its store and
/// configuration injected; holds no ambient global state.
pub struct QudStackManager {
    store: Arc<dyn ConversationStore>,
    config: TrackerConfig,
}

impl QudStackManager {
    pub fn new(store: Arc<dyn ConversationStore>, config: TrackerConfig) -> PalaverResult<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// Push a new open QUD onto the conversation's stack.
    ///
    /// When the stack is already at `max_qud_depth`, the oldest entry is
    /// evicted first: a merged sub-question reference to it is appended to
    /// the now-new-oldest survivor (or to the incoming QUD itself in the
    /// degenerate depth-1 configuration). Eviction, stack rewrite and topic
    /// update commit atomically; a failure leaves the conversation state
    /// unchanged.
    pub fn push(&self, conversation_id: ConversationId, new: NewQud) -> PalaverResult<QudId> {
        let qud = Qud {
            topic: new.topic.clone(),
            entities: new.entities.clone(),
            ..Qud::new(
                conversation_id,
                new.act_code.clone(),
                new.question_text.clone(),
                new.speaker.clone(),
                new.turn_index,
            )
        };
        let qud_id = qud.qud_id;

        self.store.transact(conversation_id, &mut |txn| {
            let mut incoming = qud.clone();
            let mut stack = txn.state().qud_stack.clone();

            if stack.len() >= self.config.max_qud_depth {
                let evicted = stack.remove(0);
                let reference = SubQuestionRef {
                    qud_id: evicted,
                    origin: SubQuestionOrigin::Merged,
                };
                match stack.first().copied() {
                    Some(target) => {
                        let parent =
                            txn.qud_mut(target)
                                .ok_or(StorageError::NotFound {
                                    entity: EntityKind::Qud,
                                    id: target,
                                })?;
                        parent.sub_questions.push(reference);
                        tracing::info!(
                            %evicted,
                            merged_into = %target,
                            "QUD stack overflow, demoted oldest to sub-question"
                        );
                    }
                    None => {
                        // max_qud_depth == 1: no surviving older entry, so
                        // the reference rides on the incoming question.
                        incoming.sub_questions.push(reference);
                        tracing::info!(
                            %evicted,
                            merged_into = %qud_id,
                            "QUD stack overflow, demoted oldest to sub-question"
                        );
                    }
                }
            }

            stack.push(qud_id);
            txn.insert_qud(incoming);

            let state = txn.state_mut();
            state.qud_stack = stack;
            state.current_topic = new.topic.clone();
            let depth = state.qud_stack.len();
            txn.record(MoveKind::QudPushed {
                qud_id,
                act_code: new.act_code.clone(),
                stack_depth: depth,
            });
            Ok(())
        })?;

        tracing::debug!(%conversation_id, %qud_id, "pushed QUD");
        Ok(qud_id)
    }

    /// Mark a QUD resolved and drop it from the stack if present.
    ///
    /// The QUD row itself must exist; a row-level miss is a genuine
    /// `NotFound`. A row that is open but no longer on the bounded stack is
    /// the soft case: the operation succeeds and flags `on_stack: false`.
    /// Idempotent: re-resolving a terminal QUD changes nothing and does not
    /// re-add it to the stack.
    pub fn resolve(
        &self,
        conversation_id: ConversationId,
        qud_id: QudId,
        resolution: Resolution,
    ) -> PalaverResult<ResolveOutcome> {
        let mut outcome = ResolveOutcome { on_stack: false };
        self.store.transact(conversation_id, &mut |txn| {
            let resolution_type = resolution.resolution_type;
            {
                let qud = txn.qud_mut(qud_id).ok_or(StorageError::NotFound {
                    entity: EntityKind::Qud,
                    id: qud_id,
                })?;
                if !qud.resolve(resolution.clone(), Utc::now()) {
                    tracing::debug!(%qud_id, status = ?qud.status, "resolve on terminal QUD");
                }
            }

            let on_stack = txn.state().qud_stack.contains(&qud_id);
            if !on_stack {
                tracing::warn!(%conversation_id, %qud_id, "resolving QUD not on stack");
            }
            txn.state_mut().qud_stack.retain(|id| *id != qud_id);
            txn.record(MoveKind::QudResolved {
                qud_id,
                resolution_type,
                on_stack,
            });
            outcome = ResolveOutcome { on_stack };
            Ok(())
        })?;
        Ok(outcome)
    }

    /// Mark a QUD abandoned and drop it from the stack if present.
    pub fn abandon(&self, conversation_id: ConversationId, qud_id: QudId) -> PalaverResult<()> {
        self.store.transact(conversation_id, &mut |txn| {
            {
                let qud = txn.qud_mut(qud_id).ok_or(StorageError::NotFound {
                    entity: EntityKind::Qud,
                    id: qud_id,
                })?;
                if !qud.abandon(Utc::now()) {
                    tracing::debug!(%qud_id, status = ?qud.status, "abandon on terminal QUD");
                }
            }
            txn.state_mut().qud_stack.retain(|id| *id != qud_id);
            txn.record(MoveKind::QudAbandoned { qud_id });
            Ok(())
        })?;
        tracing::debug!(%conversation_id, %qud_id, "abandoned QUD");
        Ok(())
    }

    /// The most recently pushed QUD still on the stack: the discourse focus.
    pub fn top_qud(&self, conversation_id: ConversationId) -> PalaverResult<Option<Qud>> {
        let Some(state) = self.store.state_get(conversation_id)? else {
            return Ok(None);
        };
        let Some(&top_id) = state.qud_stack.last() else {
            return Ok(None);
        };
        self.store.qud_get(conversation_id, top_id)
    }

    /// All open QUDs, by turn index ascending, including questions that have
    /// scrolled off the bounded stack without being resolved or abandoned.
    pub fn open_quds(&self, conversation_id: ConversationId) -> PalaverResult<Vec<Qud>> {
        self.store.open_quds(conversation_id)
    }

    /// Update the coarse position in the conversation's overall structure.
    /// Callers holding a raw string go through `SequencePosition::from_str`,
    /// which rejects unknown values with `InvalidArgument`.
    pub fn set_sequence_position(
        &self,
        conversation_id: ConversationId,
        position: SequencePosition,
    ) -> PalaverResult<()> {
        self.store.transact(conversation_id, &mut |txn| {
            txn.state_mut().sequence_position = position;
            txn.record(MoveKind::SequencePositionSet { position });
            Ok(())
        })?;
        tracing::info!(%conversation_id, %position, "sequence position updated");
        Ok(())
    }

    /// Read accessor for the full conversation state record.
    pub fn state(&self, conversation_id: ConversationId) -> PalaverResult<Option<ConversationState>> {
        self.store.state_get(conversation_id)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::{new_entity_id, PalaverError, QudStatus, ResolutionType};
    use palaver_storage::InMemoryStore;
    use std::time::Duration;

    fn manager() -> QudStackManager {
        let store = Arc::new(InMemoryStore::new(Duration::from_millis(500), 10));
        QudStackManager::new(store, TrackerConfig::default()).unwrap()
    }

    fn push_question(
        manager: &QudStackManager,
        conversation: ConversationId,
        text: &str,
        turn: TurnIndex,
    ) -> QudId {
        manager
            .push(
                conversation,
                NewQud::new("directive.ask", text, turn).with_topic(text.to_string()),
            )
            .unwrap()
    }

    #[test]
    fn test_push_sets_focus_and_topic() {
        let manager = manager();
        let conversation = new_entity_id();

        let first = push_question(&manager, conversation, "weather", 1);
        let second = push_question(&manager, conversation, "travel", 2);

        let top = manager.top_qud(conversation).unwrap().unwrap();
        assert_eq!(top.qud_id, second);
        assert_ne!(first, second);

        let state = manager.state(conversation).unwrap().unwrap();
        assert_eq!(state.qud_stack, vec![first, second]);
        assert_eq!(state.current_topic.as_deref(), Some("travel"));
    }

    #[test]
    fn test_overflow_merges_oldest_into_new_oldest() {
        let manager = manager();
        let conversation = new_entity_id();

        // Push A..F; the default depth is 5, so F evicts A into B.
        let ids: Vec<QudId> = ["a", "b", "c", "d", "e", "f"]
            .iter()
            .enumerate()
            .map(|(i, text)| push_question(&manager, conversation, text, i as i64 + 1))
            .collect();

        let state = manager.state(conversation).unwrap().unwrap();
        assert_eq!(state.qud_stack, ids[1..].to_vec());

        let parent = manager
            .open_quds(conversation)
            .unwrap()
            .into_iter()
            .find(|q| q.qud_id == ids[1])
            .unwrap();
        assert_eq!(
            parent.sub_questions,
            vec![SubQuestionRef {
                qud_id: ids[0],
                origin: SubQuestionOrigin::Merged,
            }]
        );

        // The evicted question is still open: demoted, not dropped.
        let evicted = manager
            .open_quds(conversation)
            .unwrap()
            .into_iter()
            .find(|q| q.qud_id == ids[0])
            .unwrap();
        assert_eq!(evicted.status, QudStatus::Open);
    }

    #[test]
    fn test_stack_bounded_after_every_push() {
        let manager = manager();
        let conversation = new_entity_id();

        for turn in 0..20 {
            push_question(&manager, conversation, "q", turn);
            let state = manager.state(conversation).unwrap().unwrap();
            assert!(state.qud_stack.len() <= 5);
        }
    }

    #[test]
    fn test_depth_one_overflow_rides_on_incoming() {
        let store = Arc::new(InMemoryStore::new(Duration::from_millis(500), 10));
        let config = TrackerConfig {
            max_qud_depth: 1,
            ..TrackerConfig::default()
        };
        let manager = QudStackManager::new(store, config).unwrap();
        let conversation = new_entity_id();

        let first = push_question(&manager, conversation, "first", 1);
        let second = push_question(&manager, conversation, "second", 2);

        let top = manager.top_qud(conversation).unwrap().unwrap();
        assert_eq!(top.qud_id, second);
        assert_eq!(
            top.sub_questions,
            vec![SubQuestionRef {
                qud_id: first,
                origin: SubQuestionOrigin::Merged,
            }]
        );
    }

    #[test]
    fn test_resolve_removes_from_stack_and_is_idempotent() {
        let manager = manager();
        let conversation = new_entity_id();

        let qud_id = push_question(&manager, conversation, "weather", 1);
        push_question(&manager, conversation, "travel", 2);

        let outcome = manager
            .resolve(conversation, qud_id, Resolution::default())
            .unwrap();
        assert!(outcome.on_stack);

        let resolved = manager.store.qud_get(conversation, qud_id).unwrap().unwrap();
        assert_eq!(resolved.status, QudStatus::Resolved);
        assert_eq!(
            resolved.resolution.as_ref().unwrap().resolution_type,
            ResolutionType::Full
        );
        assert!(resolved.resolved_at.is_some());

        // Second resolve: no error, flagged off-stack, not re-added.
        let again = manager
            .resolve(conversation, qud_id, Resolution::default())
            .unwrap();
        assert!(!again.on_stack);
        let state = manager.state(conversation).unwrap().unwrap();
        assert!(!state.qud_stack.contains(&qud_id));
        assert_eq!(state.qud_stack.len(), 1);
    }

    #[test]
    fn test_resolve_missing_row_is_not_found() {
        let manager = manager();
        let conversation = new_entity_id();
        push_question(&manager, conversation, "weather", 1);

        let result = manager.resolve(conversation, new_entity_id(), Resolution::default());
        assert!(matches!(
            result,
            Err(PalaverError::Storage(StorageError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_resolve_off_window_qud_succeeds_flagged() {
        let manager = manager();
        let conversation = new_entity_id();

        // Overflow pushes the first question off the window while open.
        let ids: Vec<QudId> = (0..6)
            .map(|turn| push_question(&manager, conversation, "q", turn))
            .collect();

        let outcome = manager
            .resolve(conversation, ids[0], Resolution::default())
            .unwrap();
        assert!(!outcome.on_stack);
        let row = manager.store.qud_get(conversation, ids[0]).unwrap().unwrap();
        assert_eq!(row.status, QudStatus::Resolved);
    }

    #[test]
    fn test_abandon() {
        let manager = manager();
        let conversation = new_entity_id();

        let qud_id = push_question(&manager, conversation, "weather", 1);
        manager.abandon(conversation, qud_id).unwrap();

        let row = manager.store.qud_get(conversation, qud_id).unwrap().unwrap();
        assert_eq!(row.status, QudStatus::Abandoned);
        assert!(row.resolved_at.is_some());
        let state = manager.state(conversation).unwrap().unwrap();
        assert!(state.qud_stack.is_empty());
        assert!(manager.top_qud(conversation).unwrap().is_none());
    }

    #[test]
    fn test_failed_push_leaves_state_unchanged() {
        let manager = manager();
        let conversation = new_entity_id();

        // A full stack of ids with no backing rows: the eviction-merge step
        // cannot find its target and the whole push must roll back.
        let bogus: Vec<QudId> = (0..5).map(|_| new_entity_id()).collect();
        let stack = bogus.clone();
        manager
            .store
            .transact(conversation, &mut |txn| {
                txn.state_mut().qud_stack = stack.clone();
                Ok(())
            })
            .unwrap();

        let result = manager.push(conversation, NewQud::new("directive.ask", "q", 7));
        assert!(matches!(
            result,
            Err(PalaverError::Storage(StorageError::NotFound { .. }))
        ));

        let state = manager.state(conversation).unwrap().unwrap();
        assert_eq!(state.qud_stack, bogus);
        assert!(manager.open_quds(conversation).unwrap().is_empty());
    }

    #[test]
    fn test_set_sequence_position_records_move() {
        let manager = manager();
        let conversation = new_entity_id();

        manager
            .set_sequence_position(conversation, SequencePosition::PreClosing)
            .unwrap();

        let state = manager.state(conversation).unwrap().unwrap();
        assert_eq!(state.sequence_position, SequencePosition::PreClosing);
        assert!(state.last_moves.iter().any(|m| matches!(
            m.kind,
            MoveKind::SequencePositionSet {
                position: SequencePosition::PreClosing
            }
        )));
    }

    #[test]
    fn test_sequence_position_from_string_path() {
        // Callers with raw strings hit the InvalidArgument taxonomy.
        let parsed: PalaverResult<SequencePosition> = "pre_closing".parse();
        assert_eq!(parsed.unwrap(), SequencePosition::PreClosing);
        assert!("wrapping_up".parse::<SequencePosition>().is_err());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use palaver_core::new_entity_id;
    use palaver_storage::InMemoryStore;
    use proptest::prelude::*;
    use std::time::Duration;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// The stack never exceeds the configured depth for any push
        /// sequence, and every evicted question remains reachable through
        /// some survivor's sub-question list.
        #[test]
        fn prop_stack_bounded_and_lossless(depth in 1usize..6, pushes in 1usize..16) {
            let store = Arc::new(InMemoryStore::new(Duration::from_millis(500), 10));
            let config = TrackerConfig { max_qud_depth: depth, ..TrackerConfig::default() };
            let manager = QudStackManager::new(store, config).unwrap();
            let conversation = new_entity_id();

            let mut pushed = Vec::new();
            for turn in 0..pushes {
                let id = manager
                    .push(conversation, NewQud::new("directive.ask", "q", turn as i64))
                    .unwrap();
                pushed.push(id);

                let state = manager.state(conversation).unwrap().unwrap();
                prop_assert!(state.qud_stack.len() <= depth);
            }

            // Everything pushed is either on the stack or referenced as a
            // merged sub-question of an open QUD.
            let state = manager.state(conversation).unwrap().unwrap();
            let open = manager.open_quds(conversation).unwrap();
            for id in pushed {
                let on_stack = state.qud_stack.contains(&id);
                let merged = open
                    .iter()
                    .any(|q| q.sub_questions.iter().any(|r| r.qud_id == id));
                prop_assert!(on_stack || merged);
            }
        }
    }
}
