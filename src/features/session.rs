//! Per-session event window. Insertion keeps the buffer ordered by timestamp,
//! accumulators update on every insert and evict, and vector construction
//! touches only the bounded window.

use super::behavioral::{is_exec_action, BehavioralAccum};
use super::network::NetworkAccum;
use super::{activity_symbol, FeatureVector, FEATURE_COUNT, FEATURE_SCHEMA_VERSION};
use crate::config::FeatureConfig;
use crate::error::PipelineError;
use crate::normalizer::SessionEvent;
use chrono::{DateTime, Timelike, Utc};
use std::collections::VecDeque;
use std::time::Instant;

/// Running mean/std over consecutive inter-event delays (seconds).
#[derive(Debug, Default)]
pub struct DelayAccum {
    count: u64,
    sum: f64,
    sumsq: f64,
}

impl DelayAccum {
    fn add(&mut self, delta: f64) {
        self.count += 1;
        self.sum += delta;
        self.sumsq += delta * delta;
    }

    fn remove(&mut self, delta: f64) {
        self.count = self.count.saturating_sub(1);
        self.sum -= delta;
        self.sumsq -= delta * delta;
        if self.count == 0 {
            self.sum = 0.0;
            self.sumsq = 0.0;
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Population standard deviation; 0 with fewer than two delays.
    pub fn std(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sumsq / self.count as f64 - mean * mean).max(0.0).sqrt()
    }
}

pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub source_ip: String,
    pub opened_at: DateTime<Utc>,
    /// Newest event timestamp
    pub last_seen: DateTime<Utc>,
    /// Arrival clock, drives the idle sweep
    pub last_touched: Instant,
    /// Any event carried a training-time malicious label
    pub labeled_malicious: bool,
    pub events_total: u64,
    window: VecDeque<SessionEvent>,
    capacity: usize,
    behavioral: BehavioralAccum,
    network: NetworkAccum,
    delays: DelayAccum,
}

impl Session {
    pub fn new(event: &SessionEvent, capacity: usize) -> Self {
        Self {
            session_id: event.session_id.clone(),
            user_id: event.user_id.clone(),
            source_ip: event.source_ip.clone(),
            opened_at: event.timestamp,
            last_seen: event.timestamp,
            last_touched: Instant::now(),
            labeled_malicious: false,
            events_total: 0,
            window: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            behavioral: BehavioralAccum::default(),
            network: NetworkAccum::default(),
            delays: DelayAccum::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    fn delta_secs(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
        (later.timestamp_millis() - earlier.timestamp_millis()) as f64 / 1000.0
    }

    /// Insert keeping timestamps non-decreasing. Late arrivals slot into their
    /// canonical position; the two affected neighbor delays are patched rather
    /// than rescanned.
    pub fn insert(&mut self, event: SessionEvent) {
        self.last_touched = Instant::now();
        self.events_total += 1;
        if event.is_malicious == Some(true) {
            self.labeled_malicious = true;
        }
        if event.timestamp > self.last_seen {
            self.last_seen = event.timestamp;
        }
        if event.timestamp < self.opened_at {
            self.opened_at = event.timestamp;
        }

        let idx = self
            .window
            .partition_point(|e| e.timestamp <= event.timestamp);
        if idx > 0 {
            self.delays
                .add(Self::delta_secs(self.window[idx - 1].timestamp, event.timestamp));
        }
        if idx < self.window.len() {
            self.delays
                .add(Self::delta_secs(event.timestamp, self.window[idx].timestamp));
            if idx > 0 {
                self.delays.remove(Self::delta_secs(
                    self.window[idx - 1].timestamp,
                    self.window[idx].timestamp,
                ));
            }
        }

        self.behavioral.add(&event);
        self.network.add(&event);
        self.window.insert(idx, event);

        while self.window.len() > self.capacity {
            self.evict_front();
        }
    }

    fn evict_front(&mut self) {
        let Some(old) = self.window.pop_front() else {
            return;
        };
        if let Some(next) = self.window.front() {
            self.delays
                .remove(Self::delta_secs(old.timestamp, next.timestamp));
        }
        self.behavioral.remove(&old);
        self.network.remove(&old);
    }

    fn window_duration_secs(&self) -> f64 {
        match (self.window.front(), self.window.back()) {
            (Some(first), Some(last)) => Self::delta_secs(first.timestamp, last.timestamp),
            _ => 0.0,
        }
    }

    /// Circular mean of event hours, for the user's time-of-day baseline.
    pub fn mean_hour(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let (mut sin_sum, mut cos_sum) = (0.0f64, 0.0f64);
        for event in &self.window {
            let hour = event.timestamp.hour() as f64
                + f64::from(event.timestamp.minute()) / 60.0;
            let angle = hour / 24.0 * std::f64::consts::TAU;
            sin_sum += angle.sin();
            cos_sum += angle.cos();
        }
        let angle = sin_sum.atan2(cos_sum);
        let hour = angle / std::f64::consts::TAU * 24.0;
        Some(if hour < 0.0 { hour + 24.0 } else { hour })
    }

    /// Build the feature vector for the current window.
    ///
    /// `baseline_hour` is the user's historical mean activity hour; deviation
    /// is 0 when no baseline exists yet. Fails only on a zero-event session.
    pub fn build_vector(
        &self,
        config: &FeatureConfig,
        baseline_hour: Option<f64>,
    ) -> Result<FeatureVector, PipelineError> {
        if self.window.is_empty() {
            return Err(PipelineError::InsufficientData);
        }

        let duration = self.window_duration_secs();
        let bytes_rate = if duration > 0.0 {
            self.network.bytes as f64 / duration
        } else {
            0.0
        };

        let (exec_bursts, burst_flag, trace) = self.window_pass(config);

        let deviation = match (baseline_hour, self.mean_hour()) {
            (Some(base), Some(now)) => {
                let diff = (now - base).abs();
                diff.min(24.0 - diff)
            }
            _ => 0.0,
        };

        let mut values = Vec::with_capacity(FEATURE_COUNT);
        values.push(f64::from(self.behavioral.failed_auth));
        values.push(f64::from(self.behavioral.escalation));
        values.push(self.behavioral.unique_resources() as f64);
        values.push(exec_bursts as f64);
        values.push(self.behavioral.error_rate());
        values.push(self.network.unique_destinations() as f64);
        values.push(bytes_rate);
        values.push(self.network.port_entropy());
        values.push(self.network.internal_ratio());
        values.push(duration);
        values.push(self.delays.mean());
        values.push(self.delays.std());
        values.push(deviation);
        values.push(if burst_flag { 1.0 } else { 0.0 });

        Ok(FeatureVector {
            session_id: self.session_id.clone(),
            as_of: self.last_seen,
            schema_version: FEATURE_SCHEMA_VERSION,
            values,
            trace,
        })
    }

    /// One bounded pass over the ordered window: exec bursts, the burst-activity
    /// flag, and the sub-window activity trace.
    fn window_pass(&self, config: &FeatureConfig) -> (u32, bool, Vec<u8>) {
        let burst_ms = config.burst_window_secs.max(1) * 1000;
        let first_ms = self
            .window
            .front()
            .map(|e| e.timestamp.timestamp_millis())
            .unwrap_or(0);

        let mut exec_bursts = 0u32;
        let mut last_exec_ms: Option<i64> = None;
        let mut counts: Vec<usize> = Vec::new();
        let mut burst_flag = false;
        let mut tail = 0usize;
        let timestamps: Vec<i64> = self
            .window
            .iter()
            .map(|e| e.timestamp.timestamp_millis())
            .collect();

        for (i, event) in self.window.iter().enumerate() {
            let ts = timestamps[i];

            if is_exec_action(&event.action) {
                if matches!(last_exec_ms, Some(prev) if ts - prev <= burst_ms) {
                    exec_bursts += 1;
                }
                last_exec_ms = Some(ts);
            }

            // trailing sub-window occupancy for the burst flag
            while timestamps[tail] < ts - burst_ms {
                tail += 1;
            }
            if i - tail + 1 >= config.burst_events {
                burst_flag = true;
            }

            let bucket = ((ts - first_ms) / burst_ms) as usize;
            if counts.len() <= bucket {
                counts.resize(bucket + 1, 0);
            }
            counts[bucket] += 1;
        }

        let trace = counts.into_iter().map(activity_symbol).collect();
        (exec_bursts, burst_flag, trace)
    }
}
