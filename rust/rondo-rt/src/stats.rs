//! Per-worker loop counters and the statistics sink.

use rondo_core::Report;

/// Counters one worker accumulates over a run.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LoopStats {
    pub committed: usize,
    pub conflicts: usize,
}

/// Destination for the run report.
///
/// A sink only sees runs that were given a statistics name; unnamed runs
/// stay silent (the report is still returned from `run` either way).
pub trait StatSink: Send + Sync {
    /// Deliver the report for the named loop.
    fn report(&self, name: &str, report: &Report);
}

/// The default sink: emits the report as a `tracing` debug event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl StatSink for TracingSink {
    fn report(&self, name: &str, report: &Report) {
        tracing::debug!(
            name,
            rounds = report.rounds,
            outer_rounds = report.outer_rounds,
            committed = report.total_committed(),
            conflicts = report.total_conflicts(),
            "loop statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CaptureSink(Mutex<Vec<(String, usize)>>);

    impl StatSink for CaptureSink {
        fn report(&self, name: &str, report: &Report) {
            self.0
                .lock()
                .unwrap()
                .push((name.to_string(), report.total_committed()));
        }
    }

    #[test]
    fn custom_sinks_receive_the_report() {
        let sink = CaptureSink(Mutex::new(Vec::new()));
        let report = Report {
            rounds: 2,
            outer_rounds: 1,
            committed: vec![3, 4],
            conflicts: vec![0, 1],
        };
        sink.report("bfs", &report);
        assert_eq!(sink.0.lock().unwrap()[0], ("bfs".to_string(), 7));
    }

    #[test]
    fn tracing_sink_is_quiet_without_a_subscriber() {
        TracingSink.report("noop", &Report::default());
    }
}
