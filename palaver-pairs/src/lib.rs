//! PALAVER Pairs - Adjacency Pair Expectation Tracker
//!
//! Detects when a turn creates a normative expectation for the next turn
//! (first pair part -> preferred/dispreferred second pair part) and
//! classifies how, or whether, that expectation was met.
//!
//! Expiry and decay are computed lazily at check time; there is no
//! background tick. Callers must run `check_expectation` or
//! `increment_turns_elapsed` on every turn for the model to stay accurate.

use palaver_core::{
    AdjacencyPairDef, ConversationId, Expectation, ExpectationStatus, MoveKind, PalaverResult,
    StorageError, TrackerConfig, TrackerMode, TurnIndex,
};
use palaver_storage::ConversationStore;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

// ============================================================================
// DECAY
// ============================================================================

/// Per-turn decay factor applied past the expectation deadline. Chosen so
/// strength roughly halves every two turns past expiry: relevance fades
/// smoothly rather than snapping to zero at the timeout boundary.
pub const DECAY_BASE: f64 = 0.7;

/// Relevance strength after decay: `base * 0.7^max(0, turns_elapsed - timeout)`.
pub fn decayed_strength(base: f64, turns_elapsed: i64, timeout: i64) -> f64 {
    let excess = (turns_elapsed - timeout).max(0);
    base * DECAY_BASE.powi(excess as i32)
}

// ============================================================================
// PAIR REFERENCE TABLE
// ============================================================================

/// Source of the static adjacency pair reference data. Implementations load
/// the full table; the tracker caches it with a time-based refresh so
/// administrative edits are picked up without a restart.
pub trait PairSource: Send + Sync {
    fn load(&self) -> PalaverResult<Vec<AdjacencyPairDef>>;
}

/// In-process pair source backed by a fixed list, validated up front.
pub struct StaticPairSource {
    pairs: Vec<AdjacencyPairDef>,
}

impl StaticPairSource {
    pub fn new(pairs: Vec<AdjacencyPairDef>) -> PalaverResult<Self> {
        for pair in &pairs {
            pair.validate()?;
        }
        Ok(Self { pairs })
    }
}

impl PairSource for StaticPairSource {
    fn load(&self) -> PalaverResult<Vec<AdjacencyPairDef>> {
        Ok(self.pairs.clone())
    }
}

#[derive(Default)]
struct PairCache {
    pairs: HashMap<String, AdjacencyPairDef>,
    refreshed_at: Option<Instant>,
}

/// TTL cache over a [`PairSource`], keyed by first-pair-part act code.
///
/// A failed refresh keeps serving the previous snapshot with a warning; only
/// a failure before any snapshot exists propagates, since there is then no
/// fallback source of truth.
pub struct PairTable {
    source: Arc<dyn PairSource>,
    ttl: Duration,
    cache: RwLock<PairCache>,
}

impl PairTable {
    pub fn new(source: Arc<dyn PairSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: RwLock::new(PairCache::default()),
        }
    }

    fn refresh_if_stale(&self) -> PalaverResult<()> {
        {
            let cache = self.cache.read().map_err(|_| StorageError::LockPoisoned)?;
            if let Some(refreshed_at) = cache.refreshed_at {
                if refreshed_at.elapsed() < self.ttl {
                    return Ok(());
                }
            }
        }

        let mut cache = self.cache.write().map_err(|_| StorageError::LockPoisoned)?;
        // Another thread may have refreshed while we waited for the lock.
        if let Some(refreshed_at) = cache.refreshed_at {
            if refreshed_at.elapsed() < self.ttl {
                return Ok(());
            }
        }

        match self.source.load() {
            Ok(pairs) => {
                cache.pairs = pairs
                    .into_iter()
                    .map(|p| (p.fpp_act_code.clone(), p))
                    .collect();
                cache.refreshed_at = Some(Instant::now());
                tracing::debug!(pairs = cache.pairs.len(), "adjacency pair table refreshed");
                Ok(())
            }
            Err(err) if cache.refreshed_at.is_some() => {
                tracing::warn!(error = %err, "pair table refresh failed, serving stale snapshot");
                // Push the next retry one TTL out rather than hammering a
                // failing source on every lookup.
                cache.refreshed_at = Some(Instant::now());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Look up the pair definition for a first-pair-part act code.
    pub fn get(&self, fpp_act_code: &str) -> PalaverResult<Option<AdjacencyPairDef>> {
        self.refresh_if_stale()?;
        let cache = self.cache.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(cache.pairs.get(fpp_act_code).cloned())
    }
}

// ============================================================================
// CHECK RESULTS
// ============================================================================

/// Result of checking a candidate second pair part. Either no expectation is
/// pending, or exactly one classification outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpectationCheck {
    NoExpectation,
    Outcome(ExpectationOutcome),
}

/// A single classification outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectationOutcome {
    pub status: ExpectationStatus,
    pub expectation: Expectation,
    pub candidate_spp_code: String,
    pub turns_elapsed: i64,
    /// Present only when the expectation expired.
    pub decayed_strength: Option<f64>,
}

/// Sliding-window outcome counts from the move ring buffer. These are
/// bounded to the last few events, not lifetime totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViolationStats {
    pub total: usize,
    pub violations: usize,
    pub expirations: usize,
    pub satisfied_preferred: usize,
    pub satisfied_dispreferred: usize,
}

// ============================================================================
// TRACKER
// ============================================================================

/// Service object for adjacency pair expectation tracking. Holds its store,
/// pair table and configuration; no ambient global state.
pub struct PairTracker {
    store: Arc<dyn ConversationStore>,
    pairs: PairTable,
    config: TrackerConfig,
    mode: RwLock<TrackerMode>,
}

impl PairTracker {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        source: Arc<dyn PairSource>,
        config: TrackerConfig,
    ) -> PalaverResult<Self> {
        config.validate()?;
        let pairs = PairTable::new(source, config.pair_cache_ttl);
        let mode = RwLock::new(config.mode);
        Ok(Self {
            store,
            pairs,
            config,
            mode,
        })
    }

    pub fn mode(&self) -> TrackerMode {
        *self.mode.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_mode(&self, mode: TrackerMode) {
        *self.mode.write().unwrap_or_else(|e| e.into_inner()) = mode;
        tracing::info!(?mode, "pair tracker mode set");
    }

    /// Look up the static definition for a first-pair-part act code.
    pub fn pair_for(&self, fpp_act_code: &str) -> PalaverResult<Option<AdjacencyPairDef>> {
        self.pairs.get(fpp_act_code)
    }

    /// Create an expectation from a recognized first pair part, replacing
    /// any prior expectation unconditionally. Returns `None` (a logged
    /// no-op) when no pair is defined for the act code.
    pub fn create_expectation(
        &self,
        conversation_id: ConversationId,
        fpp_act_code: &str,
        turn_index: TurnIndex,
    ) -> PalaverResult<Option<Expectation>> {
        let Some(pair) = self.pairs.get(fpp_act_code)? else {
            tracing::info!(fpp_act_code, "no adjacency pair defined");
            return Ok(None);
        };

        let expectation = Expectation::from_pair(&pair, turn_index);
        self.store.transact(conversation_id, &mut |txn| {
            txn.state_mut().pending_expectation = Some(expectation.clone());
            txn.record(MoveKind::ExpectationCreated {
                fpp_act_code: expectation.fpp_act_code.clone(),
                preferred_spp_code: expectation.preferred_spp_code.clone(),
            });
            Ok(())
        })?;

        tracing::debug!(
            %conversation_id,
            fpp_act_code,
            preferred = %expectation.preferred_spp_code,
            "expectation created"
        );
        Ok(Some(expectation))
    }

    /// Classify a candidate second pair part against the pending
    /// expectation.
    ///
    /// Classification order: expired first (with decayed strength), then
    /// preferred, then dispreferred, then violated. Every outcome records an
    /// adjacency event before returning. In observe mode the expectation is
    /// intentionally left pending so repeated post-hoc checks are possible;
    /// in enforcing mode a terminal outcome clears it when
    /// `clear_on_terminal` is set.
    pub fn check_expectation(
        &self,
        conversation_id: ConversationId,
        candidate_spp_code: &str,
        current_turn: TurnIndex,
    ) -> PalaverResult<ExpectationCheck> {
        // Avoid creating a state record for conversations never seen.
        match self.store.state_get(conversation_id)? {
            None => return Ok(ExpectationCheck::NoExpectation),
            Some(state) if state.pending_expectation.is_none() => {
                return Ok(ExpectationCheck::NoExpectation)
            }
            Some(_) => {}
        }

        let mode = self.mode();
        let mut check = ExpectationCheck::NoExpectation;
        self.store.transact(conversation_id, &mut |txn| {
            let Some(expectation) = txn.state().pending_expectation.clone() else {
                check = ExpectationCheck::NoExpectation;
                return Ok(());
            };

            let turns_elapsed = expectation.turns_elapsed_at(current_turn);
            let status = if turns_elapsed >= expectation.expectation_timeout {
                ExpectationStatus::Expired
            } else if candidate_spp_code == expectation.preferred_spp_code {
                ExpectationStatus::SatisfiedPreferred
            } else if expectation
                .dispreferred_spp_codes
                .iter()
                .any(|code| code == candidate_spp_code)
            {
                ExpectationStatus::SatisfiedDispreferred
            } else {
                ExpectationStatus::Violated
            };

            let decayed = match status {
                ExpectationStatus::Expired => Some(decayed_strength(
                    expectation.relevance_strength,
                    turns_elapsed,
                    expectation.expectation_timeout,
                )),
                _ => None,
            };

            txn.record(MoveKind::AdjacencyEvent {
                outcome: status,
                fpp_act_code: expectation.fpp_act_code.clone(),
                expected_spp_code: expectation.preferred_spp_code.clone(),
                actual_spp_code: candidate_spp_code.to_string(),
                turns_elapsed,
                relevance_strength: expectation.relevance_strength,
                observe_mode: mode.is_observe(),
            });

            if !mode.is_observe() && self.config.clear_on_terminal {
                txn.state_mut().pending_expectation = None;
            }

            check = ExpectationCheck::Outcome(ExpectationOutcome {
                status,
                expectation,
                candidate_spp_code: candidate_spp_code.to_string(),
                turns_elapsed,
                decayed_strength: decayed,
            });
            Ok(())
        })?;

        if let ExpectationCheck::Outcome(outcome) = &check {
            tracing::debug!(
                %conversation_id,
                outcome = %outcome.status,
                turns_elapsed = outcome.turns_elapsed,
                "expectation checked"
            );
        }
        Ok(check)
    }

    /// Bump the pending expectation's elapsed-turn counter without
    /// classifying; used when a turn is irrelevant to the expectation.
    pub fn increment_turns_elapsed(
        &self,
        conversation_id: ConversationId,
    ) -> PalaverResult<Option<Expectation>> {
        if self.store.state_get(conversation_id)?.is_none() {
            return Ok(None);
        }

        let mut updated = None;
        self.store.transact(conversation_id, &mut |txn| {
            if let Some(expectation) = txn.state_mut().pending_expectation.as_mut() {
                expectation.turns_elapsed += 1;
                updated = Some(expectation.clone());
            }
            Ok(())
        })?;
        Ok(updated)
    }

    /// Unconditionally drop the pending expectation.
    pub fn clear_expectation(&self, conversation_id: ConversationId) -> PalaverResult<()> {
        self.store.transact(conversation_id, &mut |txn| {
            txn.state_mut().pending_expectation = None;
            txn.record(MoveKind::ExpectationCleared);
            Ok(())
        })?;
        tracing::debug!(%conversation_id, "expectation cleared");
        Ok(())
    }

    /// Read accessor for the pending expectation.
    pub fn pending_expectation(
        &self,
        conversation_id: ConversationId,
    ) -> PalaverResult<Option<Expectation>> {
        Ok(self
            .store
            .state_get(conversation_id)?
            .and_then(|state| state.pending_expectation))
    }

    /// Outcome counts over the sliding move window.
    pub fn violation_stats(&self, conversation_id: ConversationId) -> PalaverResult<ViolationStats> {
        let Some(state) = self.store.state_get(conversation_id)? else {
            return Ok(ViolationStats::default());
        };

        let mut stats = ViolationStats::default();
        for recorded in state.last_moves.iter() {
            if let MoveKind::AdjacencyEvent { outcome, .. } = &recorded.kind {
                stats.total += 1;
                match outcome {
                    ExpectationStatus::Violated => stats.violations += 1,
                    ExpectationStatus::Expired => stats.expirations += 1,
                    ExpectationStatus::SatisfiedPreferred => stats.satisfied_preferred += 1,
                    ExpectationStatus::SatisfiedDispreferred => stats.satisfied_dispreferred += 1,
                }
            }
        }
        Ok(stats)
    }
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Decayed strength is non-increasing as turns elapse past timeout.
        #[test]
        fn prop_decay_monotone(
            base in 0.01f64..=1.0,
            timeout in 1i64..10,
            turns in 0i64..50,
        ) {
            let now = decayed_strength(base, turns, timeout);
            let later = decayed_strength(base, turns + 1, timeout);
            prop_assert!(later <= now + 1e-12);
        }

        /// Decay never exceeds the base strength and never goes negative.
        #[test]
        fn prop_decay_bounded(
            base in 0.01f64..=1.0,
            timeout in 1i64..10,
            turns in 0i64..200,
        ) {
            let decayed = decayed_strength(base, turns, timeout);
            prop_assert!(decayed >= 0.0);
            prop_assert!(decayed <= base + 1e-12);
        }
    }
}
