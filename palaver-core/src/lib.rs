//! PALAVER Core - Entity Types
//!
//! Pure data structures with no behavior beyond invariant-preserving
//! constructors and accessors. All other crates depend on this.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Conversation identifier. Supplied by the surrounding application.
pub type ConversationId = Uuid;

/// QUD identifier using UUIDv7 for timestamp-sortable IDs.
pub type QudId = Uuid;

/// Adjacency pair definition identifier.
pub type PairId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Turn index within a conversation. Caller-supplied and only
/// monotonic-ish: derived quantities must clamp, not error.
pub type TurnIndex = i64;

/// Generate a new UUIDv7 entity id (timestamp-sortable).
pub fn new_entity_id() -> Uuid {
    Uuid::now_v7()
}

// ============================================================================
// ENUMS
// ============================================================================

/// Coarse position in the conversation's overall structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SequencePosition {
    #[default]
    Opening,
    FirstTopic,
    Middle,
    PreClosing,
    Closing,
}

impl SequencePosition {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SequencePosition::Opening => "opening",
            SequencePosition::FirstTopic => "first_topic",
            SequencePosition::Middle => "middle",
            SequencePosition::PreClosing => "pre_closing",
            SequencePosition::Closing => "closing",
        }
    }
}

impl fmt::Display for SequencePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SequencePosition {
    type Err = PalaverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opening" => Ok(SequencePosition::Opening),
            "first_topic" => Ok(SequencePosition::FirstTopic),
            "middle" => Ok(SequencePosition::Middle),
            "pre_closing" => Ok(SequencePosition::PreClosing),
            "closing" => Ok(SequencePosition::Closing),
            other => Err(ValidationError::InvalidArgument {
                field: "sequence_position".to_string(),
                value: other.to_string(),
                reason: "expected one of opening, first_topic, middle, pre_closing, closing"
                    .to_string(),
            }
            .into()),
        }
    }
}

/// Status of a discourse question. Transitions only `Open -> Resolved`
/// and `Open -> Abandoned`; both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QudStatus {
    Open,
    Resolved,
    Abandoned,
}

/// How completely a QUD was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    #[default]
    Full,
    Partial,
    Deferred,
}

/// How a sub-question reference came to be attached to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubQuestionOrigin {
    /// Demoted from the stack by overflow eviction.
    Merged,
    /// Asked directly as a sub-question.
    Direct,
}

/// Conversation-analysis repair taxonomy (Schegloff, Jefferson & Sacks 1977),
/// ordered by conversational preference. These describe who signaled trouble
/// and who is expected to fix it - never a blame assignment. The detector
/// only ever assigns the two self-repair variants; the other two require
/// information a pattern matcher does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairType {
    SelfInitiatedSelfRepair,
    OtherInitiatedSelfRepair,
    SelfInitiatedOtherRepair,
    OtherInitiatedOtherRepair,
}

/// Surface-pattern category of an other-initiated repair signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairCategory {
    OpenClass,
    WhQuestion,
    PartialRepeat,
    CandidateUnderstanding,
}

impl RepairCategory {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RepairCategory::OpenClass => "open_class",
            RepairCategory::WhQuestion => "wh_question",
            RepairCategory::PartialRepeat => "partial_repeat",
            RepairCategory::CandidateUnderstanding => "candidate_understanding",
        }
    }
}

impl fmt::Display for RepairCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating mode for the pair tracker and repair detector.
///
/// Only `Observe` behavior is implemented today; the enum is threaded through
/// every decision point so enforcement can be added without restructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackerMode {
    #[default]
    Observe,
    Enforce,
}

impl TrackerMode {
    pub const fn is_observe(&self) -> bool {
        matches!(self, TrackerMode::Observe)
    }
}

/// Outcome of checking a candidate second pair part against the pending
/// expectation. Exactly one of these is produced per check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectationStatus {
    Expired,
    SatisfiedPreferred,
    SatisfiedDispreferred,
    Violated,
}

impl ExpectationStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ExpectationStatus::Expired => "expired",
            ExpectationStatus::SatisfiedPreferred => "satisfied_preferred",
            ExpectationStatus::SatisfiedDispreferred => "satisfied_dispreferred",
            ExpectationStatus::Violated => "violated",
        }
    }
}

impl fmt::Display for ExpectationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// QUD ENTITIES
// ============================================================================

/// Structured reference to a sub-question. An overflow-merged reference is
/// distinguishable from a directly-asked one so later tooling can tell the
/// difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQuestionRef {
    pub qud_id: QudId,
    pub origin: SubQuestionOrigin,
}

/// Resolution metadata for a resolved QUD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Resolution {
    pub resolution_type: ResolutionType,
    /// Dialogue-act code of the turn that resolved the question.
    pub resolved_by_act: Option<String>,
    pub summary: Option<String>,
}

/// A discourse question ever pushed for a conversation. Never physically
/// deleted; resolution and abandonment are status transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qud {
    pub qud_id: QudId,
    pub conversation_id: ConversationId,
    /// Dialogue-act code of the turn that raised the question.
    pub act_code: String,
    pub question_text: String,
    pub speaker: String,
    pub topic: Option<String>,
    pub entities: Vec<String>,
    pub turn_index: TurnIndex,
    pub status: QudStatus,
    pub resolution: Option<Resolution>,
    pub sub_questions: Vec<SubQuestionRef>,
    pub raised_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
}

impl Qud {
    /// Create a new open QUD raised at the given turn.
    pub fn new(
        conversation_id: ConversationId,
        act_code: impl Into<String>,
        question_text: impl Into<String>,
        speaker: impl Into<String>,
        turn_index: TurnIndex,
    ) -> Self {
        Self {
            qud_id: new_entity_id(),
            conversation_id,
            act_code: act_code.into(),
            question_text: question_text.into(),
            speaker: speaker.into(),
            topic: None,
            entities: Vec::new(),
            turn_index,
            status: QudStatus::Open,
            resolution: None,
            sub_questions: Vec::new(),
            raised_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_entities(mut self, entities: Vec<String>) -> Self {
        self.entities = entities;
        self
    }

    /// Mark resolved. Returns false (and changes nothing) if the QUD is
    /// already in a terminal status.
    pub fn resolve(&mut self, resolution: Resolution, at: Timestamp) -> bool {
        if self.status != QudStatus::Open {
            return false;
        }
        self.status = QudStatus::Resolved;
        self.resolution = Some(resolution);
        self.resolved_at = Some(at);
        true
    }

    /// Mark abandoned. Returns false (and changes nothing) if the QUD is
    /// already in a terminal status.
    pub fn abandon(&mut self, at: Timestamp) -> bool {
        if self.status != QudStatus::Open {
            return false;
        }
        self.status = QudStatus::Abandoned;
        self.resolved_at = Some(at);
        true
    }
}

// ============================================================================
// ADJACENCY PAIRS
// ============================================================================

/// Static reference data: the normative pairing for a first pair part act
/// code. Loaded from configuration, not created at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjacencyPairDef {
    pub pair_id: PairId,
    pub fpp_act_code: String,
    pub preferred_spp_code: String,
    pub dispreferred_spp_codes: Vec<String>,
    /// Relevance weight in (0, 1].
    pub relevance_strength: f64,
    /// Expectation lifetime in turns.
    pub expectation_timeout: i64,
}

impl AdjacencyPairDef {
    pub fn new(
        fpp_act_code: impl Into<String>,
        preferred_spp_code: impl Into<String>,
        relevance_strength: f64,
        expectation_timeout: i64,
    ) -> Self {
        Self {
            pair_id: new_entity_id(),
            fpp_act_code: fpp_act_code.into(),
            preferred_spp_code: preferred_spp_code.into(),
            dispreferred_spp_codes: Vec::new(),
            relevance_strength,
            expectation_timeout,
        }
    }

    pub fn with_dispreferred(mut self, codes: Vec<String>) -> Self {
        self.dispreferred_spp_codes = codes;
        self
    }

    pub fn validate(&self) -> PalaverResult<()> {
        if !(self.relevance_strength > 0.0 && self.relevance_strength <= 1.0) {
            return Err(ValidationError::InvalidArgument {
                field: "relevance_strength".to_string(),
                value: self.relevance_strength.to_string(),
                reason: "must be in (0, 1]".to_string(),
            }
            .into());
        }
        if self.expectation_timeout < 1 {
            return Err(ValidationError::InvalidArgument {
                field: "expectation_timeout".to_string(),
                value: self.expectation_timeout.to_string(),
                reason: "must be at least one turn".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// A live normative expectation for the next turn, snapshotted from its
/// pair definition at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    pub pair_id: PairId,
    pub fpp_act_code: String,
    pub preferred_spp_code: String,
    pub dispreferred_spp_codes: Vec<String>,
    pub relevance_strength: f64,
    pub expectation_timeout: i64,
    pub created_at_turn: TurnIndex,
    /// Always >= 0; clamped against out-of-order turn indices.
    pub turns_elapsed: i64,
}

impl Expectation {
    /// Snapshot a pair definition into a fresh expectation.
    pub fn from_pair(pair: &AdjacencyPairDef, turn_index: TurnIndex) -> Self {
        Self {
            pair_id: pair.pair_id,
            fpp_act_code: pair.fpp_act_code.clone(),
            preferred_spp_code: pair.preferred_spp_code.clone(),
            dispreferred_spp_codes: pair.dispreferred_spp_codes.clone(),
            relevance_strength: pair.relevance_strength,
            expectation_timeout: pair.expectation_timeout,
            created_at_turn: turn_index,
            turns_elapsed: 0,
        }
    }

    /// Turns elapsed relative to a caller-supplied turn index, clamped to
    /// zero for out-of-order indices.
    pub fn turns_elapsed_at(&self, current_turn: TurnIndex) -> i64 {
        (current_turn - self.created_at_turn).max(0)
    }
}

// ============================================================================
// REPAIR CONTEXT
// ============================================================================

/// Metadata describing what triggered an active repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairSource {
    pub category: RepairCategory,
    pub original_text: String,
    /// Heuristic pattern weight, not an empirical probability.
    pub confidence: f64,
    pub initiated_at: Timestamp,
}

/// An active repair sequence. Presence of this context IS the
/// repair-in-progress flag; there is no separate boolean to keep in sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairContext {
    pub repair_type: RepairType,
    pub source: RepairSource,
}

// ============================================================================
// MOVE LOG (wire format)
// ============================================================================

/// Type-specific payload of a recorded move. This is the only wire format
/// the subsystem defines; every mutating operation appends exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MoveKind {
    QudPushed {
        qud_id: QudId,
        act_code: String,
        stack_depth: usize,
    },
    QudResolved {
        qud_id: QudId,
        resolution_type: ResolutionType,
        on_stack: bool,
    },
    QudAbandoned {
        qud_id: QudId,
    },
    SequencePositionSet {
        position: SequencePosition,
    },
    CommonGroundAdded {
        key: String,
    },
    ExpectationCreated {
        fpp_act_code: String,
        preferred_spp_code: String,
    },
    AdjacencyEvent {
        outcome: ExpectationStatus,
        fpp_act_code: String,
        expected_spp_code: String,
        actual_spp_code: String,
        turns_elapsed: i64,
        relevance_strength: f64,
        observe_mode: bool,
    },
    ExpectationCleared,
    RepairInitiated {
        repair_type: RepairType,
        category: RepairCategory,
        confidence: f64,
        observe_mode: bool,
    },
    RepairCompleted {
        method: String,
        success: bool,
        observe_mode: bool,
    },
}

/// A recorded structured event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Move {
    pub recorded_at: Timestamp,
    #[serde(flatten)]
    pub kind: MoveKind,
}

/// Fixed-capacity FIFO ring buffer of recent moves. Statistics computed over
/// it are sliding-window figures, not lifetime totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveLog {
    capacity: usize,
    moves: VecDeque<Move>,
}

impl MoveLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            moves: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a move, evicting the oldest entry when full.
    pub fn push(&mut self, kind: MoveKind) {
        if self.moves.len() >= self.capacity {
            self.moves.pop_front();
        }
        self.moves.push_back(Move {
            recorded_at: Utc::now(),
            kind,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &Move> {
        self.moves.iter()
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ============================================================================
// CONVERSATION STATE
// ============================================================================

/// The single persistent record per conversation. All components read and
/// mutate it through serialized, transaction-guarded store operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: ConversationId,
    /// Open-question visibility window, oldest first, newest last.
    /// `len <= max_qud_depth` after every completed operation.
    pub qud_stack: Vec<QudId>,
    pub current_topic: Option<String>,
    pub pending_expectation: Option<Expectation>,
    pub repair: Option<RepairContext>,
    pub sequence_position: SequencePosition,
    /// Accumulated mutually-known facts. Additive only.
    pub common_ground: serde_json::Map<String, serde_json::Value>,
    pub last_moves: MoveLog,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ConversationState {
    pub fn new(conversation_id: ConversationId, move_log_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            qud_stack: Vec::new(),
            current_topic: None,
            pending_expectation: None,
            repair: None,
            sequence_position: SequencePosition::default(),
            common_ground: serde_json::Map::new(),
            last_moves: MoveLog::new(move_log_capacity),
            created_at: now,
            updated_at: now,
        }
    }

    /// The expected second pair part code, derived from the pending
    /// expectation rather than mirrored into a second field.
    pub fn expected_spp_code(&self) -> Option<&str> {
        self.pending_expectation
            .as_ref()
            .map(|e| e.preferred_spp_code.as_str())
    }

    pub fn repair_in_progress(&self) -> bool {
        self.repair.is_some()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tunables for the tracker components. Constructed at startup and injected;
/// no ambient global state.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Bounded QUD working set depth.
    pub max_qud_depth: usize,
    /// Ring buffer capacity for recent moves.
    pub move_log_capacity: usize,
    /// How long the adjacency pair reference table is served before a
    /// refresh from its source.
    pub pair_cache_ttl: Duration,
    /// Bounded wait for the per-conversation lock.
    pub lock_timeout: Duration,
    pub mode: TrackerMode,
    /// Whether a terminal check outcome clears the expectation. Only
    /// consulted in enforcing mode; observe mode leaves expectations in
    /// place so repeated post-hoc checks remain possible.
    pub clear_on_terminal: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_qud_depth: 5,
            move_log_capacity: 10,
            pair_cache_ttl: Duration::from_secs(300),
            lock_timeout: Duration::from_secs(2),
            mode: TrackerMode::Observe,
            clear_on_terminal: true,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> PalaverResult<()> {
        if self.max_qud_depth == 0 {
            return Err(ValidationError::InvalidArgument {
                field: "max_qud_depth".to_string(),
                value: "0".to_string(),
                reason: "stack must hold at least one question".to_string(),
            }
            .into());
        }
        if self.move_log_capacity == 0 {
            return Err(ValidationError::InvalidArgument {
                field: "move_log_capacity".to_string(),
                value: "0".to_string(),
                reason: "move log must hold at least one entry".to_string(),
            }
            .into());
        }
        if self.lock_timeout.is_zero() {
            return Err(ValidationError::InvalidArgument {
                field: "lock_timeout".to_string(),
                value: "0".to_string(),
                reason: "bounded lock wait must be non-zero".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Entity discriminator for not-found reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Conversation,
    Qud,
    AdjacencyPair,
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    #[error("Entity not found: {entity:?} with id {id}")]
    NotFound { entity: EntityKind, id: Uuid },

    #[error("Lock on conversation {conversation_id} not acquired within {waited_ms}ms")]
    ConcurrencyConflict {
        conversation_id: ConversationId,
        waited_ms: u64,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidArgument {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all PALAVER operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PalaverError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Result type alias for PALAVER operations.
pub type PalaverResult<T> = Result<T, PalaverError>;

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// The move log never exceeds its capacity, for any push count.
        #[test]
        fn prop_move_log_bounded(capacity in 1usize..20, pushes in 0usize..100) {
            let mut log = MoveLog::new(capacity);
            for _ in 0..pushes {
                log.push(MoveKind::ExpectationCleared);
            }
            prop_assert!(log.len() <= capacity);
            prop_assert_eq!(log.len(), pushes.min(capacity));
        }

        /// Clamped elapsed turns are never negative.
        #[test]
        fn prop_turns_elapsed_non_negative(created in -1000i64..1000, current in -1000i64..1000) {
            let pair = AdjacencyPairDef::new("a", "b", 0.5, 2);
            let expectation = Expectation::from_pair(&pair, created);
            prop_assert!(expectation.turns_elapsed_at(current) >= 0);
        }
    }
}
