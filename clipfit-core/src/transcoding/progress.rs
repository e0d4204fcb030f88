//! Status and progress side channel.

use bytes::Bytes;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;

/// Events emitted by a run, in order, ending with exactly one of `Done` or
/// `Error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TranscodeEvent {
    Status {
        message: String,
    },
    Progress {
        value: u8,
    },
    Done {
        #[serde(rename = "bytes", serialize_with = "serialize_len")]
        payload: Bytes,
    },
    Error {
        message: String,
    },
}

impl TranscodeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TranscodeEvent::Done { .. } | TranscodeEvent::Error { .. })
    }
}

fn serialize_len<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(payload.len() as u64)
}

/// Driver-side emitter that keeps progress monotonic.
///
/// Progress computed from encoded chunks never reports 100; that value is
/// reserved for [`complete`](Self::complete), after the sink has finalized.
/// A dropped receiver is ignored: nobody is listening, the run goes on.
#[derive(Debug)]
pub struct ProgressReporter {
    events: mpsc::UnboundedSender<TranscodeEvent>,
    total: u64,
    granularity: u64,
    last_value: u8,
    started: bool,
    finished: bool,
}

impl ProgressReporter {
    pub fn new(events: mpsc::UnboundedSender<TranscodeEvent>, total: u64, granularity: u64) -> Self {
        Self {
            events,
            total,
            granularity: granularity.max(1),
            last_value: 0,
            started: false,
            finished: false,
        }
    }

    /// Emits progress 0 once, when the first sample is about to be submitted.
    pub fn start(&mut self) {
        if self.started || self.finished {
            return;
        }
        self.started = true;
        let _ = self.events.send(TranscodeEvent::Progress { value: 0 });
    }

    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        let _ = self.events.send(TranscodeEvent::Status { message });
    }

    /// Called after each chunk reaches the sink with the running count.
    pub fn chunk_written(&mut self, written: u64) {
        if self.finished || self.total == 0 {
            return;
        }
        if written % self.granularity != 0 && written != self.total {
            return;
        }

        let percent = (100.0 * written as f64 / self.total as f64).round();
        let value = percent.clamp(0.0, 99.0) as u8;
        if value > self.last_value {
            self.last_value = value;
            let _ = self.events.send(TranscodeEvent::Progress { value });
        }
    }

    /// Emits the final 100 followed by `Done`.
    pub fn complete(&mut self, payload: Bytes) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.last_value = 100;
        let _ = self.events.send(TranscodeEvent::Progress { value: 100 });
        let _ = self.events.send(TranscodeEvent::Done { payload });
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        if self.finished {
            return;
        }
        self.finished = true;
        let _ = self.events.send(TranscodeEvent::Error {
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TranscodeEvent>) -> Vec<TranscodeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn progress_values(events: &[TranscodeEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                TranscodeEvent::Progress { value } => Some(*value),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_granularity_and_total() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = ProgressReporter::new(tx, 25, 10);
        for written in 1..=25 {
            reporter.chunk_written(written);
        }
        assert_eq!(progress_values(&drain(&mut rx)), vec![40, 80, 99]);
    }

    #[test]
    fn test_complete_reaches_100_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = ProgressReporter::new(tx, 10, 1);
        for written in 1..=10 {
            reporter.chunk_written(written);
        }
        reporter.complete(Bytes::from_static(b"out"));
        reporter.complete(Bytes::from_static(b"again"));
        reporter.fail("late");

        let events = drain(&mut rx);
        let values = progress_values(&events);
        assert!(values.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(values.iter().filter(|&&value| value == 100).count(), 1);
        assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
        assert!(matches!(events.last(), Some(TranscodeEvent::Done { .. })));
    }

    #[test]
    fn test_more_chunks_than_samples() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = ProgressReporter::new(tx, 4, 1);
        for written in 1..=8 {
            reporter.chunk_written(written);
        }
        assert_eq!(progress_values(&drain(&mut rx)), vec![25, 50, 75, 99]);
    }

    #[test]
    fn test_event_json_shape() {
        let done = TranscodeEvent::Done {
            payload: Bytes::from_static(b"12345"),
        };
        assert_eq!(
            serde_json::to_string(&done).unwrap(),
            r#"{"type":"done","bytes":5}"#
        );
        let progress = TranscodeEvent::Progress { value: 42 };
        assert_eq!(
            serde_json::to_string(&progress).unwrap(),
            r#"{"type":"progress","value":42}"#
        );
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut reporter = ProgressReporter::new(tx, 1, 1);
        reporter.status("nobody listening");
        reporter.chunk_written(1);
        reporter.complete(Bytes::new());
        reporter.fail("still nobody");
    }

    #[test]
    fn test_start_reports_zero_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = ProgressReporter::new(tx, 20, 10);
        reporter.start();
        reporter.start();
        for written in 1..=20 {
            reporter.chunk_written(written);
        }
        reporter.complete(Bytes::from_static(b"out"));
        reporter.start();

        let events = drain(&mut rx);
        assert_eq!(progress_values(&events), vec![0, 50, 99, 100]);
        assert!(matches!(events.last(), Some(TranscodeEvent::Done { .. })));
    }
}
