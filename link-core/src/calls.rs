//! Call state tracker for phonelink.
//!
//! This module keeps the phone's view of ringing/active calls and decides
//! what must be published so that paired devices show exactly one incoming
//! call notification per physical call. It performs no I/O: every method
//! returns [`CallEffect`]s that the client crate executes against the
//! transport and the telephony layer.
//!
//! Two sources drive the state:
//! - local telephony events (`ring`, `off_hook`, `idle`)
//! - remote commands from paired devices (`apply_command`)
//!
//! Both go through the single "current call" slot held here.

use crate::cache::BoundedIdSet;
use crate::phone;
use link_types::{CallCommand, CallCommandKind, CallId, CallRecord, CallState};
use std::collections::HashMap;
use std::time::Duration;

/// Records older than this are removed regardless of state.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

/// Commands older than this are discarded.
pub const DEFAULT_COMMAND_FRESHNESS: Duration = Duration::from_secs(10);

/// A ringing record for the same number within this window is reused.
pub const DEFAULT_RINGING_DEDUP_WINDOW: Duration = Duration::from_secs(30);

/// Capacity of the processed-command and handled-call caches.
pub const DEFAULT_ID_CACHE_CAPACITY: usize = 256;

/// Tuning for [`CallTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTrackerConfig {
    /// Staleness ceiling for visible records.
    pub stale_after: Duration,
    /// Freshness ceiling for commands.
    pub command_freshness: Duration,
    /// Ringing dedup window.
    pub ringing_dedup_window: Duration,
    /// Capacity of the id caches.
    pub id_cache_capacity: usize,
}

impl Default for CallTrackerConfig {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
            command_freshness: DEFAULT_COMMAND_FRESHNESS,
            ringing_dedup_window: DEFAULT_RINGING_DEDUP_WINDOW,
            id_cache_capacity: DEFAULT_ID_CACHE_CAPACITY,
        }
    }
}

/// Telephony operation to perform on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelephonyAction {
    /// Pick up whatever call is ringing.
    AcceptRingingCall,
    /// Hang up or decline whatever call is in progress.
    EndCall,
}

impl From<CallCommandKind> for TelephonyAction {
    fn from(kind: CallCommandKind) -> Self {
        match kind {
            CallCommandKind::Answer => TelephonyAction::AcceptRingingCall,
            CallCommandKind::Reject | CallCommandKind::End => TelephonyAction::EndCall,
        }
    }
}

/// Side effects for the client crate to execute, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEffect {
    /// Write the record to `active_calls/{callId}`.
    Publish(CallRecord),
    /// Delete `active_calls/{callId}`.
    Remove(CallId),
    /// Write the final record to `calls/{callId}` (history).
    Archive(CallRecord),
    /// Perform a telephony operation.
    Telephony {
        /// Operation.
        action: TelephonyAction,
        /// Call the operation is meant for.
        target: CallId,
    },
    /// Set `processed = true` on `call_commands/{commandId}`.
    MarkProcessed(String),
}

/// How an inbound command was judged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandDecision {
    /// Execute the command against `target`.
    Apply {
        /// Call the telephony action targets (locally tracked id wins).
        target: CallId,
        /// Operation.
        action: TelephonyAction,
        /// The command named a different call id than the tracked one.
        mismatched: bool,
    },
    /// Older than the freshness ceiling.
    Stale {
        /// Age of the command in milliseconds.
        age_ms: u64,
    },
    /// Already processed.
    Duplicate,
}

/// The phone's call state. NO I/O, just transitions.
#[derive(Debug)]
pub struct CallTracker {
    config: CallTrackerConfig,
    current: Option<CallRecord>,
    records: HashMap<CallId, CallRecord>,
    processed_commands: BoundedIdSet<String>,
    handled_calls: BoundedIdSet<CallId>,
}

impl CallTracker {
    /// Create an empty tracker.
    pub fn new(config: CallTrackerConfig) -> Self {
        Self {
            config,
            current: None,
            records: HashMap::new(),
            processed_commands: BoundedIdSet::new(config.id_cache_capacity),
            handled_calls: BoundedIdSet::new(config.id_cache_capacity),
        }
    }

    /// The call currently held in the slot.
    pub fn current(&self) -> Option<&CallRecord> {
        self.current.as_ref()
    }

    /// Whether a call is ringing or in progress.
    pub fn is_busy(&self) -> bool {
        self.current
            .as_ref()
            .map(|c| c.state != CallState::Ended)
            .unwrap_or(false)
    }

    /// Records currently visible to paired devices (as far as we know).
    pub fn visible(&self) -> impl Iterator<Item = &CallRecord> {
        self.records.values()
    }

    /// Number of visible records in `state`.
    pub fn count_in_state(&self, state: CallState) -> usize {
        self.records.values().filter(|r| r.state == state).count()
    }

    /// Whether a call id has already been ended by this tracker.
    pub fn was_handled(&self, id: &CallId) -> bool {
        self.handled_calls.contains(id)
    }

    // ------------------------------------------------------------------
    // Local telephony events
    // ------------------------------------------------------------------

    /// An incoming call started ringing.
    ///
    /// Reuses a ringing record for the same number inside the dedup window
    /// instead of publishing a second one. `fresh_id` is used only when a
    /// new record is needed.
    pub fn ring(
        &mut self,
        number: &str,
        contact_name: Option<String>,
        fresh_id: CallId,
        now_ms: u64,
    ) -> Vec<CallEffect> {
        if let Some(existing) = self.find_recent_ringing(number, now_ms) {
            self.current = Some(existing);
            return Vec::new();
        }

        let record = CallRecord {
            call_id: fresh_id,
            phone_number: number.to_string(),
            contact_name,
            state: CallState::Ringing,
            timestamp: now_ms,
        };
        self.records.insert(record.call_id.clone(), record.clone());
        self.current = Some(record.clone());
        vec![CallEffect::Publish(record)]
    }

    /// The phone went off-hook (answered, or an outgoing call started).
    pub fn off_hook(&mut self, number: Option<&str>, fresh_id: CallId, now_ms: u64) -> Vec<CallEffect> {
        if self.current.is_some() {
            return self.mark_active(now_ms);
        }
        let record = CallRecord {
            call_id: fresh_id,
            phone_number: number.unwrap_or_default().to_string(),
            contact_name: None,
            state: CallState::Active,
            timestamp: now_ms,
        };
        self.records.insert(record.call_id.clone(), record.clone());
        self.current = Some(record.clone());
        vec![CallEffect::Publish(record)]
    }

    /// Move the tracked ringing call to active.
    pub fn mark_active(&mut self, now_ms: u64) -> Vec<CallEffect> {
        let Some(current) = self.current.as_mut() else {
            return Vec::new();
        };
        if current.state != CallState::Ringing {
            return Vec::new();
        }
        current.state = CallState::Active;
        current.timestamp = now_ms;
        let record = current.clone();
        self.records.insert(record.call_id.clone(), record.clone());
        vec![CallEffect::Publish(record)]
    }

    /// The phone returned to idle: the tracked call ended.
    pub fn idle(&mut self, now_ms: u64) -> Vec<CallEffect> {
        let Some(mut record) = self.current.take() else {
            return Vec::new();
        };
        record.state = CallState::Ended;
        record.timestamp = now_ms;
        self.records.remove(&record.call_id);
        self.handled_calls.insert(record.call_id.clone());
        vec![
            CallEffect::Remove(record.call_id.clone()),
            CallEffect::Archive(record),
        ]
    }

    // ------------------------------------------------------------------
    // Remote state
    // ------------------------------------------------------------------

    /// Merge a record seen under `active_calls` (written by any writer).
    pub fn observe_remote(&mut self, record: CallRecord, now_ms: u64) {
        if self.handled_calls.contains(&record.call_id) || self.is_stale(&record, now_ms) {
            return;
        }
        let newer = self
            .records
            .get(&record.call_id)
            .map(|known| record.timestamp >= known.timestamp)
            .unwrap_or(true);
        if newer {
            self.records.insert(record.call_id.clone(), record);
        }
    }

    /// A record disappeared from `active_calls`.
    pub fn forget_remote(&mut self, id: &CallId) {
        self.records.remove(id);
    }

    /// Decide what to do with an inbound command.
    ///
    /// Every command id is judged once; repeats are `Duplicate`. Stale and
    /// applied commands are both marked processed.
    pub fn apply_command(
        &mut self,
        command_id: &str,
        command: &CallCommand,
        now_ms: u64,
    ) -> (CommandDecision, Vec<CallEffect>) {
        if command.processed || !self.processed_commands.insert(command_id.to_string()) {
            return (CommandDecision::Duplicate, Vec::new());
        }

        let mark = CallEffect::MarkProcessed(command_id.to_string());
        let age_ms = now_ms.saturating_sub(command.timestamp);
        if age_ms > self.config.command_freshness.as_millis() as u64 {
            return (CommandDecision::Stale { age_ms }, vec![mark]);
        }

        let (target, mismatched) = match &self.current {
            Some(current) => (
                current.call_id.clone(),
                current.call_id != command.call_id,
            ),
            None => (command.call_id.clone(), false),
        };
        let action = TelephonyAction::from(command.command);

        (
            CommandDecision::Apply {
                target: target.clone(),
                action,
                mismatched,
            },
            vec![mark, CallEffect::Telephony { action, target }],
        )
    }

    // ------------------------------------------------------------------
    // Sweep
    // ------------------------------------------------------------------

    /// Remove ringing records that are not the current call, and anything
    /// older than the staleness ceiling.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<CallEffect> {
        let keep = self.current.as_ref().map(|c| c.call_id.clone());
        let doomed: Vec<CallId> = self
            .records
            .values()
            .filter(|r| {
                let orphan_ringing =
                    r.state == CallState::Ringing && keep.as_ref() != Some(&r.call_id);
                orphan_ringing || self.is_stale(r, now_ms)
            })
            .map(|r| r.call_id.clone())
            .collect();

        doomed
            .into_iter()
            .map(|id| {
                self.records.remove(&id);
                CallEffect::Remove(id)
            })
            .collect()
    }

    /// Forget everything (sign-out).
    pub fn clear(&mut self) {
        self.current = None;
        self.records.clear();
        self.processed_commands.clear();
        self.handled_calls.clear();
    }

    fn is_stale(&self, record: &CallRecord, now_ms: u64) -> bool {
        now_ms.saturating_sub(record.timestamp) > self.config.stale_after.as_millis() as u64
    }

    fn find_recent_ringing(&self, number: &str, now_ms: u64) -> Option<CallRecord> {
        let window = self.config.ringing_dedup_window.as_millis() as u64;
        self.records
            .values()
            .filter(|r| {
                r.state == CallState::Ringing
                    && now_ms.saturating_sub(r.timestamp) <= window
                    && phone::same_number(&r.phone_number, number)
            })
            .max_by_key(|r| r.timestamp)
            .cloned()
    }
}

impl Default for CallTracker {
    fn default() -> Self {
        Self::new(CallTrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NUMBER: &str = "+15551234567";

    fn command(call_id: &str, kind: CallCommandKind, timestamp: u64) -> CallCommand {
        CallCommand {
            call_id: CallId::new(call_id),
            command: kind,
            timestamp,
            processed: false,
        }
    }

    fn remote(id: &str, number: &str, state: CallState, timestamp: u64) -> CallRecord {
        CallRecord {
            call_id: CallId::new(id),
            phone_number: number.into(),
            contact_name: None,
            state,
            timestamp,
        }
    }

    // ==========================================================================
    // Ringing and dedup
    // ==========================================================================

    #[test]
    fn ring_publishes_new_record() {
        let mut tracker = CallTracker::default();
        let effects = tracker.ring(NUMBER, Some("Alice".into()), CallId::new("c1"), 1_000);
        assert_eq!(effects.len(), 1);
        assert!(matches!(&effects[0], CallEffect::Publish(r) if r.state == CallState::Ringing));
        assert!(tracker.is_busy());
    }

    #[test]
    fn duplicate_ring_within_window_reuses_id() {
        let mut tracker = CallTracker::default();
        tracker.ring(NUMBER, None, CallId::new("c1"), 1_000);
        let effects = tracker.ring("5551234567", None, CallId::new("c2"), 5_000);

        assert!(effects.is_empty());
        assert_eq!(tracker.current().unwrap().call_id, CallId::new("c1"));
        assert_eq!(tracker.count_in_state(CallState::Ringing), 1);
    }

    #[test]
    fn ring_after_window_creates_new_record() {
        let mut tracker = CallTracker::default();
        tracker.ring(NUMBER, None, CallId::new("c1"), 0);
        let effects = tracker.ring(NUMBER, None, CallId::new("c2"), 31_000);
        assert_eq!(effects.len(), 1);
        assert_eq!(tracker.current().unwrap().call_id, CallId::new("c2"));
    }

    #[test]
    fn remote_ringing_record_is_reused_after_restart() {
        let mut tracker = CallTracker::default();
        tracker.observe_remote(remote("old", NUMBER, CallState::Ringing, 1_000), 2_000);
        let effects = tracker.ring(NUMBER, None, CallId::new("fresh"), 3_000);
        assert!(effects.is_empty());
        assert_eq!(tracker.current().unwrap().call_id, CallId::new("old"));
    }

    #[test]
    fn different_number_is_not_deduplicated() {
        let mut tracker = CallTracker::default();
        tracker.ring(NUMBER, None, CallId::new("c1"), 0);
        let effects = tracker.ring("+15559990000", None, CallId::new("c2"), 100);
        assert_eq!(effects.len(), 1);
    }

    // ==========================================================================
    // Transitions
    // ==========================================================================

    #[test]
    fn answer_then_hang_up() {
        let mut tracker = CallTracker::default();
        tracker.ring(NUMBER, None, CallId::new("c1"), 0);

        let effects = tracker.off_hook(None, CallId::new("unused"), 2_000);
        assert!(matches!(&effects[0], CallEffect::Publish(r) if r.state == CallState::Active));

        let effects = tracker.idle(9_000);
        assert_eq!(effects[0], CallEffect::Remove(CallId::new("c1")));
        assert!(matches!(&effects[1], CallEffect::Archive(r) if r.state == CallState::Ended));
        assert!(!tracker.is_busy());
        assert!(tracker.was_handled(&CallId::new("c1")));
    }

    #[test]
    fn outgoing_call_goes_straight_to_active() {
        let mut tracker = CallTracker::default();
        let effects = tracker.off_hook(Some(NUMBER), CallId::new("out"), 0);
        assert!(matches!(&effects[0], CallEffect::Publish(r) if r.call_id == CallId::new("out")));
        assert_eq!(tracker.count_in_state(CallState::Active), 1);
    }

    #[test]
    fn idle_without_call_is_noop() {
        let mut tracker = CallTracker::default();
        assert!(tracker.idle(0).is_empty());
    }

    #[test]
    fn handled_call_is_not_resurrected_by_remote_record() {
        let mut tracker = CallTracker::default();
        tracker.ring(NUMBER, None, CallId::new("c1"), 0);
        tracker.idle(1_000);
        tracker.observe_remote(remote("c1", NUMBER, CallState::Ringing, 500), 1_500);
        assert_eq!(tracker.visible().count(), 0);
    }

    // ==========================================================================
    // Commands
    // ==========================================================================

    #[test]
    fn fresh_command_targets_tracked_call() {
        let mut tracker = CallTracker::default();
        tracker.ring(NUMBER, None, CallId::new("local"), 0);
        let (decision, effects) =
            tracker.apply_command("cmd1", &command("local", CallCommandKind::Answer, 1_000), 2_000);
        assert_eq!(
            decision,
            CommandDecision::Apply {
                target: CallId::new("local"),
                action: TelephonyAction::AcceptRingingCall,
                mismatched: false,
            }
        );
        assert_eq!(effects[0], CallEffect::MarkProcessed("cmd1".into()));
    }

    #[test]
    fn mismatched_call_id_still_applies_to_local_call() {
        let mut tracker = CallTracker::default();
        tracker.ring(NUMBER, None, CallId::new("local"), 0);
        let (decision, effects) =
            tracker.apply_command("cmd1", &command("remote", CallCommandKind::Reject, 500), 1_000);
        match decision {
            CommandDecision::Apply {
                target, mismatched, ..
            } => {
                assert_eq!(target, CallId::new("local"));
                assert!(mismatched);
            }
            other => panic!("expected Apply, got {:?}", other),
        }
        assert!(effects.contains(&CallEffect::Telephony {
            action: TelephonyAction::EndCall,
            target: CallId::new("local"),
        }));
    }

    #[test]
    fn remote_id_used_when_nothing_tracked() {
        let mut tracker = CallTracker::default();
        let (decision, _) =
            tracker.apply_command("cmd1", &command("remote", CallCommandKind::End, 0), 0);
        assert!(matches!(
            decision,
            CommandDecision::Apply { ref target, mismatched: false, .. } if *target == CallId::new("remote")
        ));
    }

    #[test]
    fn stale_command_is_not_applied() {
        let mut tracker = CallTracker::default();
        tracker.ring(NUMBER, None, CallId::new("c1"), 0);
        let (decision, effects) =
            tracker.apply_command("cmd1", &command("c1", CallCommandKind::Answer, 1_000), 11_001);
        assert_eq!(decision, CommandDecision::Stale { age_ms: 10_001 });
        assert_eq!(effects, vec![CallEffect::MarkProcessed("cmd1".into())]);
    }

    #[test]
    fn command_exactly_at_freshness_limit_applies() {
        let mut tracker = CallTracker::default();
        let (decision, _) =
            tracker.apply_command("cmd1", &command("c1", CallCommandKind::End, 1_000), 11_000);
        assert!(matches!(decision, CommandDecision::Apply { .. }));
    }

    #[test]
    fn command_is_processed_once() {
        let mut tracker = CallTracker::default();
        let cmd = command("c1", CallCommandKind::End, 0);
        tracker.apply_command("cmd1", &cmd, 0);
        let (decision, effects) = tracker.apply_command("cmd1", &cmd, 0);
        assert_eq!(decision, CommandDecision::Duplicate);
        assert!(effects.is_empty());
    }

    #[test]
    fn already_processed_flag_is_duplicate() {
        let mut tracker = CallTracker::default();
        let mut cmd = command("c1", CallCommandKind::End, 0);
        cmd.processed = true;
        let (decision, _) = tracker.apply_command("cmd9", &cmd, 0);
        assert_eq!(decision, CommandDecision::Duplicate);
    }

    // ==========================================================================
    // Sweep
    // ==========================================================================

    #[test]
    fn sweep_removes_orphan_ringing_records() {
        let mut tracker = CallTracker::default();
        tracker.observe_remote(remote("ghost", "+15550000000", CallState::Ringing, 1_000), 1_000);
        tracker.ring(NUMBER, None, CallId::new("c1"), 2_000);

        let effects = tracker.sweep(3_000);
        assert_eq!(effects, vec![CallEffect::Remove(CallId::new("ghost"))]);
        assert_eq!(tracker.count_in_state(CallState::Ringing), 1);
    }

    #[test]
    fn sweep_removes_stale_records_regardless_of_state() {
        let mut tracker = CallTracker::default();
        tracker.observe_remote(remote("a", NUMBER, CallState::Active, 0), 0);
        tracker.observe_remote(remote("e", NUMBER, CallState::Ended, 0), 0);
        let mut removed: Vec<_> = tracker
            .sweep(60_001)
            .into_iter()
            .filter_map(|e| match e {
                CallEffect::Remove(id) => Some(id.to_string()),
                _ => None,
            })
            .collect();
        removed.sort();
        assert_eq!(removed, vec!["a", "e"]);
    }

    #[test]
    fn sweep_keeps_current_ringing_call() {
        let mut tracker = CallTracker::default();
        tracker.ring(NUMBER, None, CallId::new("c1"), 0);
        assert!(tracker.sweep(30_000).is_empty());
    }

    #[test]
    fn stale_remote_records_are_ignored() {
        let mut tracker = CallTracker::default();
        tracker.observe_remote(remote("old", NUMBER, CallState::Ringing, 0), 61_000);
        assert_eq!(tracker.visible().count(), 0);
    }

    #[test]
    fn clear_resets_everything() {
        let mut tracker = CallTracker::default();
        tracker.ring(NUMBER, None, CallId::new("c1"), 0);
        tracker.apply_command("cmd", &command("c1", CallCommandKind::End, 0), 0);
        tracker.clear();
        assert!(tracker.current().is_none());
        assert_eq!(tracker.visible().count(), 0);
        let (decision, _) =
            tracker.apply_command("cmd", &command("c1", CallCommandKind::End, 0), 0);
        assert!(matches!(decision, CommandDecision::Apply { .. }));
    }
}
