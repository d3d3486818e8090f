//! Decoding, validation, and deduplication of fill-level messages.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::IngestConfig;
use crate::model::{BinId, BinReading};
use crate::wire::{FillPayload, InboundTopic, RawMessage};

#[derive(Error, Debug, Clone, PartialEq)]
/// Reasons a raw message does not become a reading.
pub enum IngestError {
    /// Missing or out-of-range fields; the sample is dropped.
    #[error("Malformed reading: {0}")]
    Malformed(String),
    /// Sequence already seen; expected under at-least-once delivery.
    #[error("Duplicate reading {sequence} for bin {bin_id}")]
    Duplicate {
        /// Bin the reading belongs to.
        bin_id: BinId,
        /// Repeated sequence number.
        sequence: u64,
    },
}

#[derive(Debug, Default)]
struct RecentWindow {
    sequences: VecDeque<u64>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl RecentWindow {
    fn contains(&self, sequence: u64) -> bool {
        self.sequences.contains(&sequence)
    }

    fn remember(&mut self, sequence: u64, timestamp: DateTime<Utc>, capacity: usize) {
        self.sequences.push_back(sequence);
        while self.sequences.len() > capacity {
            self.sequences.pop_front();
        }
        self.last_timestamp = Some(
            self.last_timestamp
                .map_or(timestamp, |last| last.max(timestamp)),
        );
    }
}

/// Turns raw `bins/{binId}/fill` messages into validated readings.
pub struct ReadingIngestor {
    config: IngestConfig,
    windows: DashMap<BinId, RecentWindow>,
}

impl ReadingIngestor {
    /// Create an ingestor with empty dedup windows.
    #[must_use]
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Decode and validate a fill message.
    ///
    /// A reading that passes is remembered in its bin's window, so the same
    /// `sourceSequence` arriving again yields [`IngestError::Duplicate`].
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Malformed`] for undecodable or out-of-range
    /// input and [`IngestError::Duplicate`] for a repeated sequence.
    pub fn ingest(&self, raw: &RawMessage, now: DateTime<Utc>) -> Result<BinReading, IngestError> {
        let bin_id = match InboundTopic::parse(&raw.topic) {
            Some(InboundTopic::Fill(bin_id)) => bin_id,
            _ => {
                return Err(malformed(&raw.topic, "not a fill topic"));
            }
        };

        let payload: FillPayload = serde_json::from_slice(&raw.payload)
            .map_err(|err| malformed(&raw.topic, &format!("invalid JSON: {err}")))?;

        let fill_percent = payload
            .fill_percent
            .ok_or_else(|| malformed(&raw.topic, "missing fillPercent"))?;
        if !fill_percent.is_finite() || !(0.0..=100.0).contains(&fill_percent) {
            return Err(malformed(
                &raw.topic,
                &format!("fillPercent {fill_percent} outside 0..=100"),
            ));
        }

        let sequence = payload
            .source_sequence
            .ok_or_else(|| malformed(&raw.topic, "missing sourceSequence"))?;

        let timestamp = payload
            .timestamp
            .ok_or_else(|| malformed(&raw.topic, "missing timestamp"))
            .and_then(|secs| {
                epoch_to_datetime(secs)
                    .ok_or_else(|| malformed(&raw.topic, "timestamp out of range"))
            })?;

        let skew = self.config.skew_tolerance();
        if now.checked_add_signed(skew).is_some_and(|limit| timestamp > limit) {
            return Err(malformed(&raw.topic, "timestamp too far in the future"));
        }

        let mut window = self.windows.entry(bin_id.clone()).or_default();
        if window.contains(sequence) {
            debug!(bin = %bin_id, sequence, "dropping duplicate reading");
            return Err(IngestError::Duplicate { bin_id, sequence });
        }
        if let Some(last) = window.last_timestamp
            && last.checked_sub_signed(skew).is_some_and(|floor| timestamp < floor)
        {
            drop(window);
            return Err(malformed(&raw.topic, "timestamp older than previous reading"));
        }
        window.remember(sequence, timestamp, self.config.dedup_window.max(1));
        drop(window);

        Ok(BinReading {
            bin_id,
            fill_percent,
            timestamp,
            source_sequence: sequence,
        })
    }

    /// Un-see a reading whose processing was rolled back.
    pub fn forget(&self, bin_id: &BinId, sequence: u64) {
        if let Some(mut window) = self.windows.get_mut(bin_id) {
            window.sequences.retain(|seen| *seen != sequence);
        }
    }

    /// Seed a bin's window from persisted history, oldest first.
    pub fn prime(&self, bin_id: &BinId, readings: &[BinReading]) {
        let capacity = self.config.dedup_window.max(1);
        let mut window = self.windows.entry(bin_id.clone()).or_default();
        for reading in readings {
            if !window.contains(reading.source_sequence) {
                window.remember(reading.source_sequence, reading.timestamp, capacity);
            }
        }
    }

    /// Discard everything remembered about a bin.
    pub fn drop_bin(&self, bin_id: &BinId) {
        self.windows.remove(bin_id);
    }
}

fn malformed(topic: &str, reason: &str) -> IngestError {
    warn!(topic, reason, "malformed reading dropped");
    IngestError::Malformed(format!("{topic}: {reason}"))
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "epoch milliseconds fit in i64 for any valid timestamp"
)]
fn epoch_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let millis = (secs * 1_000.0).round();
    if millis > 9.0e15 {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64)
}
