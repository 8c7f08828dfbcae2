//! Raw signal validation and timestamp normalization

use super::event::{Edge, InputEvent, RawSignal, SignalSource, SourceItem, VALUE_PRESS, VALUE_RELEASE, VALUE_REPEAT};
use super::KeyCode;
use crate::entry::Timestamp;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Output of the normalizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    Event(InputEvent),
    /// Source was idle; carries the normalized clock
    Tick(Timestamp),
}

/// A recoverable capture problem. Logged and counted, never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureAnomaly {
    Malformed { code: u16, value: i32, timestamp_us: i64 },
    ClockRegression { last: Timestamp, got: Timestamp },
}

impl fmt::Display for CaptureAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { code, value, timestamp_us } => write!(
                f,
                "malformed signal code={} value={} ts={}",
                code, value, timestamp_us
            ),
            Self::ClockRegression { last, got } => write!(
                f,
                "clock went backwards by {}us",
                last.micros_since(*got)
            ),
        }
    }
}

/// Capture counters, shared with whoever wants to watch them
#[derive(Debug, Default)]
pub struct CaptureCounters {
    events: AtomicU64,
    malformed: AtomicU64,
    clock_anomalies: AtomicU64,
}

impl CaptureCounters {
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn clock_anomalies(&self) -> u64 {
        self.clock_anomalies.load(Ordering::Relaxed)
    }

    fn record(&self, anomaly: &CaptureAnomaly) {
        log::debug!("capture anomaly: {}", anomaly);
        match anomaly {
            CaptureAnomaly::Malformed { .. } => self.malformed.fetch_add(1, Ordering::Relaxed),
            CaptureAnomaly::ClockRegression { .. } => {
                self.clock_anomalies.fetch_add(1, Ordering::Relaxed)
            }
        };
    }
}

/// Turns a [`SignalSource`] into an ordered stream of [`Capture`]s
///
/// Timestamps never decrease: a regressed timestamp is clamped to the last
/// one seen. The iterator ends only when the source closes.
pub struct Normalizer<S> {
    source: S,
    tag: Arc<str>,
    last: Option<Timestamp>,
    counters: Arc<CaptureCounters>,
}

impl<S: SignalSource> Normalizer<S> {
    pub fn new(source: S) -> Self {
        Self::with_counters(source, Arc::new(CaptureCounters::default()))
    }

    pub fn with_counters(source: S, counters: Arc<CaptureCounters>) -> Self {
        let tag: Arc<str> = Arc::from(source.tag());
        Self {
            source,
            tag,
            last: None,
            counters,
        }
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        Arc::clone(&self.counters)
    }

    pub fn source_tag(&self) -> &Arc<str> {
        &self.tag
    }

    fn normalize(&mut self, signal: RawSignal) -> Option<InputEvent> {
        let edge = match signal.value {
            VALUE_RELEASE => Edge::Release,
            VALUE_PRESS | VALUE_REPEAT => Edge::Press,
            _ => return None,
        };
        if signal.code == 0 || signal.timestamp_us < 0 {
            return None;
        }

        let mut timestamp = Timestamp::from_micros(signal.timestamp_us as u64);
        if let Some(last) = self.last {
            if timestamp < last {
                self.counters.record(&CaptureAnomaly::ClockRegression {
                    last,
                    got: timestamp,
                });
                timestamp = last;
            }
        }
        self.last = Some(timestamp);

        let mut event = InputEvent::new(KeyCode(signal.code), edge, timestamp, Arc::clone(&self.tag));
        event.chord_marker = signal.chord_marker;
        Some(event)
    }

    fn tick(&self, now_us: i64) -> Timestamp {
        let now = Timestamp::from_micros(now_us.max(0) as u64);
        match self.last {
            Some(last) => now.max(last),
            None => now,
        }
    }
}

impl<S: SignalSource> Iterator for Normalizer<S> {
    type Item = Capture;

    fn next(&mut self) -> Option<Capture> {
        loop {
            match self.source.next_item()? {
                SourceItem::Tick(now_us) => return Some(Capture::Tick(self.tick(now_us))),
                SourceItem::Signal(signal) => match self.normalize(signal) {
                    Some(event) => {
                        self.counters.events.fetch_add(1, Ordering::Relaxed);
                        return Some(Capture::Event(event));
                    }
                    None => self.counters.record(&CaptureAnomaly::Malformed {
                        code: signal.code,
                        value: signal.value,
                        timestamp_us: signal.timestamp_us,
                    }),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyboard::event::ReplaySource;

    fn normalize(items: Vec<SourceItem>) -> (Vec<Capture>, Arc<CaptureCounters>) {
        let normalizer = Normalizer::new(ReplaySource::new("test", items));
        let counters = normalizer.counters();
        (normalizer.collect(), counters)
    }

    fn sig(signal: RawSignal) -> SourceItem {
        SourceItem::Signal(signal)
    }

    #[test]
    fn valid_signals_become_events() {
        let (out, counters) = normalize(vec![sig(RawSignal::press(30, 100)), sig(RawSignal::release(30, 150))]);
        assert_eq!(out.len(), 2);
        match &out[0] {
            Capture::Event(e) => {
                assert_eq!(e.key, KeyCode(30));
                assert!(e.is_press());
                assert_eq!(e.timestamp, Timestamp(100));
                assert_eq!(&*e.source, "test");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(counters.events(), 2);
        assert_eq!(counters.malformed(), 0);
    }

    #[test]
    fn autorepeat_is_a_press() {
        let repeat = RawSignal { value: VALUE_REPEAT, ..RawSignal::press(30, 1) };
        let (out, _) = normalize(vec![sig(repeat)]);
        assert!(matches!(&out[0], Capture::Event(e) if e.edge == Edge::Press));
    }

    #[test]
    fn malformed_signals_are_dropped_and_counted() {
        let bad_value = RawSignal { value: 7, ..RawSignal::press(30, 1) };
        let (out, counters) = normalize(vec![
            sig(RawSignal::press(0, 1)),
            sig(bad_value),
            sig(RawSignal::press(30, -5)),
            sig(RawSignal::press(30, 10)),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(counters.malformed(), 3);
        assert_eq!(counters.events(), 1);
    }

    #[test]
    fn regressed_timestamps_are_clamped() {
        let (out, counters) = normalize(vec![
            sig(RawSignal::press(30, 1_000)),
            sig(RawSignal::release(30, 900)),
            sig(RawSignal::press(31, 1_200)),
        ]);
        let stamps: Vec<u64> = out
            .iter()
            .filter_map(|c| match c {
                Capture::Event(e) => Some(e.timestamp.as_micros()),
                Capture::Tick(_) => None,
            })
            .collect();
        assert_eq!(stamps, vec![1_000, 1_000, 1_200]);
        assert_eq!(counters.clock_anomalies(), 1);
    }

    #[test]
    fn ticks_never_run_behind_events() {
        let (out, counters) = normalize(vec![sig(RawSignal::press(30, 500)), SourceItem::Tick(100)]);
        assert_eq!(out[1], Capture::Tick(Timestamp(500)));
        assert_eq!(counters.clock_anomalies(), 0);
    }

    #[test]
    fn chord_marker_is_carried() {
        let (out, _) = normalize(vec![sig(RawSignal::press(30, 1).with_chord_marker())]);
        assert!(matches!(&out[0], Capture::Event(e) if e.chord_marker));
    }
}
