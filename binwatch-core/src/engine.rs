//! Per-bin state machine.
//!
//! Every function here is pure: it takes the current [`BinState`] and an
//! input, and returns the next state together with whatever alert, command
//! intent, and transition log entries the step produced. Persistence and
//! publishing belong to the caller.
//!
//! ```text
//!   Normal ──▶ Warning ──▶ Critical ──▶ EmptyingInProgress
//!     ▲  └──────────────────▲  │               │   │
//!     └──── below reset ────┴──┘   ◀── failed ─┘   │
//!     └──────────────────── emptied ───────────────┘
//!   any ──▶ Offline (staleness sweep) ──▶ prior status on next reading
//! ```

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::EngineConfig;
use crate::model::{
    AlertEvent, AlertId, AlertSeverity, BinReading, BinState, BinStatus, CommandIntent,
    CommandKind, Transition,
};

#[derive(Debug, Clone, PartialEq)]
/// Result of one state machine step.
pub struct Outcome {
    /// State after the step.
    pub state: BinState,
    /// Alert raised by an upward transition or by going offline.
    pub alert: Option<AlertEvent>,
    /// Emptying request, present only on entry into `EmptyingInProgress`.
    pub intent: Option<CommandIntent>,
    /// Status changes in the order they happened.
    pub transitions: Vec<Transition>,
}

impl Outcome {
    fn unchanged(state: BinState) -> Self {
        Self {
            state,
            alert: None,
            intent: None,
            transitions: Vec::new(),
        }
    }
}

/// Applies thresholds, hysteresis, and debouncing to bin states.
#[derive(Debug, Clone)]
pub struct StateEngine {
    config: EngineConfig,
}

impl StateEngine {
    /// Create an engine with the given thresholds.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Thresholds in use.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fold a reading into a bin's state.
    ///
    /// `current` is `None` for a bin never seen before, which starts out
    /// `Normal`. An offline bin is evaluated from the status it had before
    /// going offline, so coming back at the same severity raises no alert.
    #[must_use]
    pub fn apply(&self, current: Option<&BinState>, reading: &BinReading) -> Outcome {
        let mut state = current
            .cloned()
            .unwrap_or_else(|| BinState::new(reading.bin_id.clone(), reading.timestamp));

        let observed = state.status;
        let baseline = match observed {
            BinStatus::Offline => state.status_before_offline.unwrap_or(BinStatus::Normal),
            other => other,
        };
        let fill = reading.fill_percent;

        state.last_fill_percent = fill;
        state.last_reading_timestamp = state.last_reading_timestamp.max(reading.timestamp);
        state.status_before_offline = None;
        state.consecutive_high_readings = if fill >= self.config.warn_threshold {
            state.consecutive_high_readings.saturating_add(1)
        } else {
            0
        };

        let level = self.level_for(baseline, fill);
        let mut next = level;
        let mut intent = None;
        if level == BinStatus::Critical
            && state.consecutive_high_readings >= self.config.debounce_count
            && state
                .retry_not_before
                .is_none_or(|not_before| reading.timestamp >= not_before)
        {
            next = BinStatus::EmptyingInProgress;
            intent = Some(CommandIntent {
                bin_id: state.bin_id.clone(),
                kind: CommandKind::EmptyBin,
                requested_at: reading.timestamp,
                triggering_fill_percent: fill,
            });
        }

        if next == BinStatus::Normal {
            state.failed_attempts = 0;
            state.retry_not_before = None;
        }

        let alert = (level.rank() > baseline.rank()).then(|| {
            let severity = if level == BinStatus::Critical {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            AlertEvent {
                alert_id: AlertId::derive(
                    &state.bin_id,
                    &format!("reading-{}", reading.source_sequence),
                    severity,
                ),
                bin_id: state.bin_id.clone(),
                severity,
                triggering_fill_percent: fill,
                created_at: reading.timestamp,
                acknowledged: false,
            }
        });

        let mut transitions = Vec::new();
        record(&mut transitions, &mut state, observed, level, reading.timestamp);
        record(&mut transitions, &mut state, level, next, reading.timestamp);

        Outcome {
            state,
            alert,
            intent,
            transitions,
        }
    }

    /// Flip a bin to `Offline` if it has been silent past the staleness window.
    ///
    /// Returns `None` when the bin is fresh or already offline.
    #[must_use]
    pub fn mark_offline(&self, current: &BinState, now: DateTime<Utc>) -> Option<Outcome> {
        if current.status == BinStatus::Offline {
            return None;
        }
        let deadline = current
            .last_reading_timestamp
            .checked_add_signed(self.config.staleness_window())?;
        if now <= deadline {
            return None;
        }

        let mut state = current.clone();
        state.status_before_offline = Some(current.status);

        let alert = AlertEvent {
            alert_id: AlertId::derive(
                &state.bin_id,
                &format!("offline-{}", current.last_reading_timestamp.timestamp_millis()),
                AlertSeverity::Offline,
            ),
            bin_id: state.bin_id.clone(),
            severity: AlertSeverity::Offline,
            triggering_fill_percent: current.last_fill_percent,
            created_at: now,
            acknowledged: false,
        };

        let mut transitions = Vec::new();
        record(
            &mut transitions,
            &mut state,
            current.status,
            BinStatus::Offline,
            now,
        );

        Some(Outcome {
            state,
            alert: Some(alert),
            intent: None,
            transitions,
        })
    }

    /// The actuator confirmed the bin was emptied.
    ///
    /// An offline bin stays offline but will come back as `Normal`.
    #[must_use]
    pub fn on_emptied(&self, current: &BinState, at: DateTime<Utc>) -> Outcome {
        let mut state = current.clone();
        state.last_fill_percent = 0.0;
        state.consecutive_high_readings = 0;
        state.failed_attempts = 0;
        state.retry_not_before = None;

        if state.status == BinStatus::Offline {
            state.status_before_offline = Some(BinStatus::Normal);
            return Outcome::unchanged(state);
        }

        let mut transitions = Vec::new();
        record(&mut transitions, &mut state, current.status, BinStatus::Normal, at);
        Outcome {
            state,
            alert: None,
            intent: None,
            transitions,
        }
    }

    /// The in-flight command timed out or the actuator reported failure.
    ///
    /// The bin re-enters `Critical` and may not request another emptying
    /// before `at + backoff`.
    #[must_use]
    pub fn on_command_failed(
        &self,
        current: &BinState,
        at: DateTime<Utc>,
        backoff: TimeDelta,
    ) -> Outcome {
        let mut state = current.clone();
        state.failed_attempts = state.failed_attempts.saturating_add(1);
        state.retry_not_before = at.checked_add_signed(backoff).or(Some(DateTime::<Utc>::MAX_UTC));

        match state.status {
            BinStatus::EmptyingInProgress => {
                let mut transitions = Vec::new();
                record(
                    &mut transitions,
                    &mut state,
                    BinStatus::EmptyingInProgress,
                    BinStatus::Critical,
                    at,
                );
                Outcome {
                    state,
                    alert: None,
                    intent: None,
                    transitions,
                }
            }
            BinStatus::Offline => {
                if state.status_before_offline == Some(BinStatus::EmptyingInProgress) {
                    state.status_before_offline = Some(BinStatus::Critical);
                }
                Outcome::unchanged(state)
            }
            _ => Outcome::unchanged(state),
        }
    }

    /// Withdraw the command intent of an outcome, leaving the bin `Critical`.
    ///
    /// Used when dispatch is halted or the command record cannot be written;
    /// the next qualifying reading produces the intent again.
    #[must_use]
    pub fn defer_intent(&self, mut outcome: Outcome) -> Outcome {
        if outcome.intent.take().is_none() {
            return outcome;
        }
        outcome.state.status = BinStatus::Critical;
        if outcome
            .transitions
            .last()
            .is_some_and(|last| last.to == BinStatus::EmptyingInProgress)
        {
            outcome.transitions.pop();
        }
        outcome
    }

    fn level_for(&self, baseline: BinStatus, fill: f64) -> BinStatus {
        let warn = self.config.warn_threshold;
        let critical = self.config.critical_threshold;
        let reset = self.config.reset_level();

        match baseline {
            BinStatus::EmptyingInProgress => BinStatus::EmptyingInProgress,
            BinStatus::Normal | BinStatus::Offline => {
                if fill >= critical {
                    BinStatus::Critical
                } else if fill >= warn {
                    BinStatus::Warning
                } else {
                    BinStatus::Normal
                }
            }
            BinStatus::Warning => {
                if fill >= critical {
                    BinStatus::Critical
                } else if fill < reset {
                    BinStatus::Normal
                } else {
                    BinStatus::Warning
                }
            }
            BinStatus::Critical => {
                if fill < reset {
                    BinStatus::Normal
                } else {
                    BinStatus::Critical
                }
            }
        }
    }
}

fn record(
    transitions: &mut Vec<Transition>,
    state: &mut BinState,
    from: BinStatus,
    to: BinStatus,
    at: DateTime<Utc>,
) {
    if from == to {
        return;
    }
    state.status = to;
    state.last_transition_timestamp = at;
    transitions.push(Transition {
        bin_id: state.bin_id.clone(),
        from,
        to,
        at,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BinId;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap_or_default()
    }

    fn reading(seq: u64, fill: f64) -> BinReading {
        BinReading {
            bin_id: BinId::new("B1"),
            fill_percent: fill,
            timestamp: at(i64::try_from(seq).unwrap_or_default() * 10),
            source_sequence: seq,
        }
    }

    fn run(engine: &StateEngine, fills: &[f64]) -> (BinState, Vec<Outcome>) {
        let mut state: Option<BinState> = None;
        let mut outcomes = Vec::new();
        for (index, fill) in fills.iter().enumerate() {
            let seq = u64::try_from(index).unwrap_or_default() + 1;
            let outcome = engine.apply(state.as_ref(), &reading(seq, *fill));
            state = Some(outcome.state.clone());
            outcomes.push(outcome);
        }
        (state.unwrap_or_else(|| BinState::new(BinId::new("B1"), at(0))), outcomes)
    }

    #[test]
    fn unseen_bin_starts_normal() {
        let engine = StateEngine::new(EngineConfig::default());
        let outcome = engine.apply(None, &reading(1, 40.0));

        assert_eq!(outcome.state.status, BinStatus::Normal);
        assert!(outcome.alert.is_none());
        assert!(outcome.transitions.is_empty());
    }

    #[test]
    fn reference_sequence_raises_two_alerts_and_one_intent() {
        let engine = StateEngine::new(EngineConfig::default());
        let (state, outcomes) = run(&engine, &[50.0, 72.0, 91.0]);

        let severities: Vec<_> = outcomes
            .iter()
            .filter_map(|outcome| outcome.alert.as_ref().map(|alert| alert.severity))
            .collect();
        assert_eq!(severities, vec![AlertSeverity::Warning, AlertSeverity::Critical]);
        assert_eq!(
            outcomes.iter().filter(|outcome| outcome.intent.is_some()).count(),
            1
        );
        assert_eq!(state.status, BinStatus::EmptyingInProgress);

        let emptied = engine.on_emptied(&state, at(100));
        assert_eq!(emptied.state.status, BinStatus::Normal);
        let after = engine.apply(Some(&emptied.state), &reading(4, 35.0));
        assert_eq!(after.state.status, BinStatus::Normal);
    }

    #[test]
    fn single_spike_is_debounced() {
        let engine = StateEngine::new(EngineConfig::default());
        let (state, outcomes) = run(&engine, &[20.0, 95.0]);

        assert_eq!(state.status, BinStatus::Critical, "jumps straight to critical");
        assert!(outcomes.iter().all(|outcome| outcome.intent.is_none()));

        let confirmed = engine.apply(Some(&state), &reading(3, 96.0));
        assert!(confirmed.intent.is_some(), "second high reading confirms");
    }

    #[test]
    fn hysteresis_holds_warning_inside_band() {
        let engine = StateEngine::new(EngineConfig::default());
        let (state, outcomes) = run(&engine, &[70.0, 69.0, 70.0, 61.0, 70.0]);

        assert_eq!(state.status, BinStatus::Warning);
        assert_eq!(
            outcomes.iter().filter(|outcome| outcome.alert.is_some()).count(),
            1,
            "only the first crossing alerts"
        );

        let dropped = engine.apply(Some(&state), &reading(6, 59.0));
        assert_eq!(dropped.state.status, BinStatus::Normal);
    }

    #[test]
    fn critical_does_not_step_down_to_warning() {
        let engine = StateEngine::new(EngineConfig {
            debounce_count: 10,
            ..EngineConfig::default()
        });
        let (state, _) = run(&engine, &[95.0, 75.0]);
        assert_eq!(state.status, BinStatus::Critical);
    }

    #[test]
    fn readings_while_emptying_change_nothing_but_fill() {
        let engine = StateEngine::new(EngineConfig::default());
        let (state, _) = run(&engine, &[95.0, 95.0]);
        assert_eq!(state.status, BinStatus::EmptyingInProgress);

        let outcome = engine.apply(Some(&state), &reading(3, 99.0));
        assert_eq!(outcome.state.status, BinStatus::EmptyingInProgress);
        assert!(outcome.intent.is_none(), "no second command while one is in flight");
        assert!(outcome.alert.is_none());
    }

    #[test]
    fn failed_command_backs_off_before_retrying() {
        let engine = StateEngine::new(EngineConfig::default());
        let (state, _) = run(&engine, &[95.0, 95.0]);

        let failed = engine.on_command_failed(&state, at(20), TimeDelta::seconds(60));
        assert_eq!(failed.state.status, BinStatus::Critical);
        assert_eq!(failed.state.failed_attempts, 1);

        let early = engine.apply(Some(&failed.state), &reading(3, 95.0));
        assert!(early.intent.is_none(), "reading at t=30 is inside the backoff");

        let late = engine.apply(Some(&early.state), &reading(9, 95.0));
        assert!(late.intent.is_some(), "reading at t=90 is past the backoff");
    }

    #[test]
    fn offline_round_trip_restores_severity_without_new_alert() {
        let engine = StateEngine::new(EngineConfig::default());
        let (state, _) = run(&engine, &[75.0]);
        assert_eq!(state.status, BinStatus::Warning);

        assert!(engine.mark_offline(&state, at(60)).is_none(), "still fresh");

        let offline = engine
            .mark_offline(&state, at(400))
            .expect("stale after five minutes");
        assert_eq!(offline.state.status, BinStatus::Offline);
        assert_eq!(
            offline.alert.as_ref().map(|alert| alert.severity),
            Some(AlertSeverity::Offline)
        );
        assert!(engine.mark_offline(&offline.state, at(900)).is_none(), "alerts once");

        let back = engine.apply(Some(&offline.state), &reading(50, 76.0));
        assert_eq!(back.state.status, BinStatus::Warning);
        assert!(back.alert.is_none(), "same severity as before going offline");
    }

    #[test]
    fn deferring_an_intent_keeps_the_bin_critical() {
        let engine = StateEngine::new(EngineConfig::default());
        let (state, _) = run(&engine, &[95.0]);
        let outcome = engine.apply(Some(&state), &reading(2, 95.0));
        assert!(outcome.intent.is_some());

        let deferred = engine.defer_intent(outcome);
        assert!(deferred.intent.is_none());
        assert_eq!(deferred.state.status, BinStatus::Critical);
        assert!(deferred.transitions.is_empty());
    }
}
