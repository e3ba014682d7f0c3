//! PALAVER Repair - Conversational Repair Detection
//!
//! Surface-pattern detection of repair sequences: moments where one party
//! signals trouble hearing or understanding the prior turn (other-initiated)
//! or corrects their own turn in flight (self-initiated). Detection is a
//! heuristic signal over the literal utterance text, not ground truth about
//! the speaker's intent; confidences are fixed per pattern category and
//! carry no probabilistic meaning beyond relative ordering.
//!
//! Categories are checked in a fixed priority order so an utterance that
//! matches several (e.g. "what?") is always attributed to the strongest
//! signal class.

use chrono::Utc;
use once_cell::sync::Lazy;
use palaver_core::{
    ConversationId, MoveKind, PalaverResult, RepairCategory, RepairContext, RepairSource,
    RepairType, TrackerConfig, TrackerMode,
};
use palaver_storage::ConversationStore;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

// ============================================================================
// PATTERN TABLES
// ============================================================================

/// A single surface pattern with a stable identifier for logging and tests.
pub struct RepairRule {
    pub id: &'static str,
    pub pattern: Regex,
}

impl RepairRule {
    fn new(id: &'static str, pattern: &str) -> Self {
        Self {
            id,
            pattern: Regex::new(pattern).unwrap(),
        }
    }
}

/// One category's rules plus the confidence every match in it receives.
pub struct CategoryRules {
    pub category: RepairCategory,
    pub confidence: f64,
    pub rules: Vec<RepairRule>,
}

/// Other-initiated repair patterns, strongest category first. Order is
/// load-bearing: detection returns the first category with any match.
pub static OTHER_INITIATED_RULES: Lazy<Vec<CategoryRules>> = Lazy::new(|| {
    vec![
        CategoryRules {
            category: RepairCategory::OpenClass,
            confidence: 0.95,
            rules: vec![
                RepairRule::new(
                    "open_class.generic",
                    r"(?i)^(huh|what|sorry|pardon|excuse me|come again)\??$",
                ),
                RepairRule::new(
                    "open_class.apology",
                    r"(?i)^(i('m| am) sorry|beg your pardon)\??$",
                ),
                RepairRule::new("open_class.what_is_that", r"(?i)^what('s| is) that\??$"),
                RepairRule::new("open_class.say_again", r"(?i)^say (that )?again\??$"),
            ],
        },
        CategoryRules {
            category: RepairCategory::WhQuestion,
            confidence: 0.85,
            rules: vec![
                RepairRule::new(
                    "wh_question.bare",
                    r"(?i)^(who|what|where|when|why|how|which)(\s+.{1,20})?\??$",
                ),
                RepairRule::new("wh_question.what_do_you_mean", r"(?i)^what do you mean"),
                RepairRule::new("wh_question.what_did_you", r"(?i)^what did you (say|mean)"),
                RepairRule::new("wh_question.who_is_that", r"(?i)^who('s| is) that\??$"),
                RepairRule::new("wh_question.where_is_that", r"(?i)^where('s| is) that\??$"),
            ],
        },
        CategoryRules {
            category: RepairCategory::PartialRepeat,
            confidence: 0.75,
            rules: vec![
                RepairRule::new("partial_repeat.the_fragment", r"(?i)^the (.{1,30})\??$"),
                RepairRule::new("partial_repeat.trailing_what", r"(?i)^(.{1,20}) what\??$"),
                RepairRule::new(
                    "partial_repeat.you_said",
                    r"(?i)^you (said|mean) (.{1,30})\??$",
                ),
            ],
        },
        CategoryRules {
            category: RepairCategory::CandidateUnderstanding,
            confidence: 0.70,
            rules: vec![
                RepairRule::new(
                    "candidate_understanding.discourse_marker",
                    r"(?i)^(so |oh |wait ).{5,}",
                ),
                RepairRule::new("candidate_understanding.you_mean", r"(?i)^you mean .{5,}"),
                RepairRule::new(
                    "candidate_understanding.do_you_mean",
                    r"(?i)^do you mean .{5,}",
                ),
                RepairRule::new(
                    "candidate_understanding.are_you_saying",
                    r"(?i)^are you saying .{5,}",
                ),
                RepairRule::new("candidate_understanding.is_that", r"(?i)^is that .{5,}"),
            ],
        },
    ]
});

/// Confidence assigned to every self-repair marker match.
pub const SELF_REPAIR_CONFIDENCE: f64 = 0.90;

/// Markers a speaker uses when restarting or amending their own turn.
/// Over-inclusive on purpose: "well" and "actually" also open plain hedged
/// statements, which is acceptable for a heuristic signal.
pub static SELF_REPAIR_RULES: Lazy<Vec<RepairRule>> = Lazy::new(|| {
    vec![
        RepairRule::new(
            "self_repair.marker",
            r"(?i)^(i mean|that is|rather|actually|well|sorry|correction)",
        ),
        RepairRule::new(
            "self_repair.rephrase",
            r"(?i)^(let me (rephrase|clarify|try again))",
        ),
        RepairRule::new(
            "self_repair.what_i_meant",
            r"(?i)^(what i meant (was|to say))",
        ),
    ]
});

// ============================================================================
// DETECTION
// ============================================================================

/// Caveat attached to every detection, for downstream consumers reading
/// logged moves out of context.
pub const INTERPRETATION_NOTE: &str = "heuristic signal, not ground truth";

/// Self-repair markers double as ordinary hedges, so their caveat is wider.
pub const SELF_REPAIR_NOTE: &str =
    "heuristic signal, not ground truth; may be a stylistic hedge";

/// An other-initiated repair signal found in an utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairDetection {
    pub repair_type: RepairType,
    pub category: RepairCategory,
    /// Fixed per-category weight; see module docs.
    pub confidence: f64,
    pub pattern_id: &'static str,
    pub original_text: String,
    pub note: &'static str,
}

/// A self-initiated repair marker found in an utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct SelfRepairDetection {
    pub repair_type: RepairType,
    pub confidence: f64,
    pub pattern_id: &'static str,
    pub original_text: String,
    pub note: &'static str,
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Scan an utterance for an other-initiated repair signal.
///
/// Categories are tried strongest-first and the first matching rule wins, so
/// "what?" is classified open-class even though the bare wh-question pattern
/// also matches it.
pub fn detect_other_initiated(text: &str) -> Option<RepairDetection> {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return None;
    }
    for category in OTHER_INITIATED_RULES.iter() {
        for rule in &category.rules {
            if rule.pattern.is_match(&normalized) {
                return Some(RepairDetection {
                    repair_type: RepairType::OtherInitiatedSelfRepair,
                    category: category.category,
                    confidence: category.confidence,
                    pattern_id: rule.id,
                    original_text: text.trim().to_string(),
                    note: INTERPRETATION_NOTE,
                });
            }
        }
    }
    None
}

/// Scan an utterance for a self-repair marker ("i mean", "let me rephrase").
pub fn detect_self_repair(text: &str) -> Option<SelfRepairDetection> {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return None;
    }
    for rule in SELF_REPAIR_RULES.iter() {
        if rule.pattern.is_match(&normalized) {
            return Some(SelfRepairDetection {
                repair_type: RepairType::SelfInitiatedSelfRepair,
                confidence: SELF_REPAIR_CONFIDENCE,
                pattern_id: rule.id,
                original_text: text.trim().to_string(),
                note: SELF_REPAIR_NOTE,
            });
        }
    }
    None
}

// ============================================================================
// RESPONSE RECOMMENDATIONS
// ============================================================================

/// How the repaired party should respond to each initiation category, as a
/// dialogue function the upstream planner understands.
pub const fn recommended_dialogue_function(category: RepairCategory) -> &'static str {
    match category {
        RepairCategory::OpenClass => "own_communication_management.self_repair",
        RepairCategory::WhQuestion => "allo_feedback.request_clarification",
        RepairCategory::PartialRepeat => "own_communication_management.self_correction",
        RepairCategory::CandidateUnderstanding => {
            "partner_communication_management.confirm_partner_state"
        }
    }
}

/// Speech act the recommended response should be tagged with.
pub const fn recommended_speech_act(category: RepairCategory) -> &'static str {
    match category {
        RepairCategory::OpenClass => "assertive.explain",
        RepairCategory::WhQuestion => "assertive.inform",
        RepairCategory::PartialRepeat => "assertive.correction_acceptance",
        RepairCategory::CandidateUnderstanding => "feedback_elicitation.elicit_confirmation",
    }
}

/// Response guidance derived from an initiated repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairPlan {
    pub dialogue_function: &'static str,
    pub speech_act: &'static str,
}

// ============================================================================
// COMPLETION
// ============================================================================

/// How an in-progress repair was closed out. Defaults describe the common
/// case: a clarification that landed.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairCompletion {
    pub method: String,
    pub success: bool,
}

impl Default for RepairCompletion {
    fn default() -> Self {
        Self {
            method: "clarification".to_string(),
            success: true,
        }
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Repair activity over a conversation's recent move window. Sliding-window
/// figures over the bounded move log, not lifetime totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub initiated: usize,
    pub completed: usize,
    pub by_category: HashMap<RepairCategory, usize>,
}

// ============================================================================
// DETECTOR
// ============================================================================

/// Stateful side of repair handling: marks a conversation as being in a
/// repair sequence, closes the sequence out, and reports on recent activity.
/// At most one repair is in progress per conversation; initiating again
/// replaces the previous context, mirroring how an unanswered "huh?" is
/// superseded by a sharper follow-up.
pub struct RepairDetector {
    store: Arc<dyn ConversationStore>,
    mode: RwLock<TrackerMode>,
}

impl RepairDetector {
    pub fn new(store: Arc<dyn ConversationStore>, config: TrackerConfig) -> PalaverResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            mode: RwLock::new(config.mode),
        })
    }

    pub fn mode(&self) -> TrackerMode {
        *self.mode.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_mode(&self, mode: TrackerMode) {
        *self.mode.write().unwrap_or_else(|e| e.into_inner()) = mode;
        tracing::info!(?mode, "repair detector mode set");
    }

    /// Mark a conversation as being in a repair sequence and return response
    /// guidance for the detected category.
    pub fn initiate_repair(
        &self,
        conversation_id: ConversationId,
        detection: &RepairDetection,
    ) -> PalaverResult<RepairPlan> {
        let mode = self.mode();
        self.store.transact(conversation_id, &mut |txn| {
            txn.state_mut().repair = Some(RepairContext {
                repair_type: detection.repair_type,
                source: RepairSource {
                    category: detection.category,
                    original_text: detection.original_text.clone(),
                    confidence: detection.confidence,
                    initiated_at: Utc::now(),
                },
            });
            txn.record(MoveKind::RepairInitiated {
                repair_type: detection.repair_type,
                category: detection.category,
                confidence: detection.confidence,
                observe_mode: mode.is_observe(),
            });
            Ok(())
        })?;
        tracing::info!(
            %conversation_id,
            category = %detection.category,
            pattern = detection.pattern_id,
            confidence = detection.confidence,
            "repair initiated"
        );
        Ok(RepairPlan {
            dialogue_function: recommended_dialogue_function(detection.category),
            speech_act: recommended_speech_act(detection.category),
        })
    }

    /// Close out the in-progress repair, if any. Completing with no repair in
    /// progress is a no-op apart from the logged move, so callers need not
    /// check first.
    pub fn complete_repair(
        &self,
        conversation_id: ConversationId,
        completion: RepairCompletion,
    ) -> PalaverResult<()> {
        let mode = self.mode();
        self.store.transact(conversation_id, &mut |txn| {
            txn.state_mut().repair = None;
            txn.record(MoveKind::RepairCompleted {
                method: completion.method.clone(),
                success: completion.success,
                observe_mode: mode.is_observe(),
            });
            Ok(())
        })?;
        tracing::info!(
            %conversation_id,
            method = %completion.method,
            success = completion.success,
            "repair completed"
        );
        Ok(())
    }

    /// The active repair context, if a sequence is in progress.
    pub fn repair_context(
        &self,
        conversation_id: ConversationId,
    ) -> PalaverResult<Option<RepairContext>> {
        Ok(self
            .store
            .state_get(conversation_id)?
            .and_then(|state| state.repair))
    }

    pub fn is_repair_in_progress(&self, conversation_id: ConversationId) -> PalaverResult<bool> {
        Ok(self
            .store
            .state_get(conversation_id)?
            .map(|state| state.repair_in_progress())
            .unwrap_or(false))
    }

    /// Repair activity over the conversation's recent move window.
    pub fn repair_stats(&self, conversation_id: ConversationId) -> PalaverResult<RepairStats> {
        let mut stats = RepairStats::default();
        let Some(state) = self.store.state_get(conversation_id)? else {
            return Ok(stats);
        };
        for entry in state.last_moves.iter() {
            match &entry.kind {
                MoveKind::RepairInitiated { category, .. } => {
                    stats.initiated += 1;
                    *stats.by_category.entry(*category).or_insert(0) += 1;
                }
                MoveKind::RepairCompleted { .. } => stats.completed += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}

// ============================================================================
// TESTS
// ============================================================================
