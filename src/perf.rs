//! Per-rank timing of compute iterations, the load metric fed to the balancer

use std::time::{Duration, Instant};

/// Iteration timer with a history since the last reset.
/// After every `period` iterations the period flag is raised.
#[derive(Clone, Debug)]
pub struct PerfMeasure {
    period: usize,
    counter: usize,
    started: Option<Instant>,
    history: Vec<Duration>,
    last: Duration,
    iter_total: Duration,
    balance_started: Option<Instant>,
    balance_total: Duration,
    period_elapsed: bool,
}

impl PerfMeasure {
    pub fn new(period: usize) -> Self {
        PerfMeasure {
            period: period.max(1),
            counter: 0,
            started: None,
            history: Vec::new(),
            last: Duration::ZERO,
            iter_total: Duration::ZERO,
            balance_started: None,
            balance_total: Duration::ZERO,
            period_elapsed: false,
        }
    }

    pub fn iter_start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Ends the iteration opened by `iter_start`; a stop without a start
    /// records nothing.
    pub fn iter_stop(&mut self) -> Duration {
        match self.started.take() {
            Some(t) => {
                let elapsed = t.elapsed();
                self.record(elapsed);
                elapsed
            },
            None => Duration::ZERO,
        }
    }

    /// Adds an externally measured iteration
    pub fn record(&mut self, elapsed: Duration) {
        self.last = elapsed;
        self.iter_total += elapsed;
        self.history.push(elapsed);
        self.counter += 1;
        if self.counter % self.period == 0 {
            self.period_elapsed = true;
        }
    }

    pub fn balance_start(&mut self) {
        self.balance_started = Some(Instant::now());
    }

    pub fn balance_stop(&mut self) {
        if let Some(t) = self.balance_started.take() {
            self.balance_total += t.elapsed();
        }
    }

    pub fn period_elapsed(&self) -> bool {
        self.period_elapsed
    }

    /// Mean iteration time in seconds since the last reset
    pub fn average(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        let sum: f64 = self.history.iter().map(Duration::as_secs_f64).sum();
        Some(sum / self.history.len() as f64)
    }

    pub fn history(&self) -> &[Duration] {
        &self.history
    }

    pub fn last(&self) -> Duration {
        self.last
    }

    pub fn iterations(&self) -> usize {
        self.counter
    }

    pub fn iter_total(&self) -> Duration {
        self.iter_total
    }

    pub fn balance_total(&self) -> Duration {
        self.balance_total
    }

    /// Starts a new measurement period. Totals are kept.
    pub fn reset(&mut self) {
        self.period_elapsed = false;
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_and_average() {
        let mut p = PerfMeasure::new(3);
        assert_eq!(p.average(), None);
        p.record(Duration::from_millis(10));
        p.record(Duration::from_millis(20));
        assert!(!p.period_elapsed());
        p.record(Duration::from_millis(30));
        assert!(p.period_elapsed());
        assert!((p.average().unwrap() - 0.020).abs() < 1e-9);
        assert_eq!(p.last(), Duration::from_millis(30));

        p.reset();
        assert!(!p.period_elapsed());
        assert_eq!(p.average(), None);
        assert_eq!(p.iter_total(), Duration::from_millis(60));
        assert_eq!(p.iterations(), 3);
    }

    #[test]
    fn stop_without_start() {
        let mut p = PerfMeasure::new(1);
        assert_eq!(p.iter_stop(), Duration::ZERO);
        assert_eq!(p.iterations(), 0);
        p.iter_start();
        p.iter_stop();
        assert!(p.period_elapsed());
    }
}
