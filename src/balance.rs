//! Moving tile boundaries towards under-loaded ranks

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::block::DynamicBlock;
use crate::error::Result;
use crate::geometry::Region;

/// Condition that makes `should_rebalance` fire
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// max/mean load ratio above the threshold
    Threshold,
    /// every `interval` steps regardless of load
    Interval,
    /// whichever comes first
    Either,
}

impl From<&str> for Trigger {
    fn from(s: &str) -> Self {
        match s {
            "interval" | "periodic" => Trigger::Interval,
            "either" | "both" => Trigger::Either,
            _ => Trigger::Threshold,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Trigger::Threshold => write!(f, "threshold"),
            Trigger::Interval => write!(f, "interval"),
            Trigger::Either => write!(f, "either"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BalancePolicy {
    pub enabled: bool,
    pub trigger: Trigger,
    /// Largest tolerated max/mean load ratio
    pub threshold: f64,
    /// Steps between load checks
    pub interval: usize,
    /// Fraction of its current extent a tile boundary may move per rebalance
    pub max_displacement: f64,
    /// Smallest predicted drop of the max/mean ratio worth redistributing for
    pub min_improvement: f64,
    /// Axis along which boundaries move; strategy default if `None`
    pub axis: Option<usize>,
}

impl Default for BalancePolicy {
    fn default() -> Self {
        BalancePolicy {
            enabled: true,
            trigger: Trigger::Threshold,
            threshold: 1.5,
            interval: 10,
            max_displacement: 0.25,
            min_improvement: 0.01,
            axis: None,
        }
    }
}

/// Outcome of a balancing attempt
#[derive(Debug)]
pub enum Proposal {
    Keep,
    Replace(DynamicBlock),
}

/// Ratio of the largest load to the mean load; 1 means perfectly balanced
pub fn imbalance(metrics: &[f64]) -> f64 {
    if metrics.is_empty() {
        return 1.0;
    }
    let mean = metrics.iter().sum::<f64>() / metrics.len() as f64;
    let max = metrics.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if mean > 0.0 { max / mean } else { 1.0 }
}

/// Pure function of the gathered metrics and the current block: every rank
/// runs it on identical inputs and arrives at the same partition.
#[derive(Clone, Debug, Default)]
pub struct LoadBalancer {
    policy: BalancePolicy,
}

impl LoadBalancer {
    pub fn new(policy: BalancePolicy) -> Self {
        LoadBalancer { policy }
    }

    pub fn policy(&self) -> &BalancePolicy {
        &self.policy
    }

    /// `step` counts completed steps since the start of the run.
    pub fn should_rebalance(&self, metrics: &[f64], current: &DynamicBlock, step: usize) -> bool {
        if !self.policy.enabled || current.size() < 2 {
            return false;
        }
        if metrics.len() != current.size() {
            warn!(got = metrics.len(), ranks = current.size(), "load metrics do not match the partition");
            return false;
        }
        let interval = self.policy.interval.max(1);
        let periodic = step > 0 && step % interval == 0;
        let ratio = imbalance(metrics);
        let imbalanced = ratio > self.policy.threshold;
        debug!(step, ratio, "load check");
        match self.policy.trigger {
            Trigger::Threshold => imbalanced,
            Trigger::Interval => periodic,
            Trigger::Either => imbalanced || periodic,
        }
    }

    /// New partition for the measured loads, or the current one (same `Arc`)
    /// when no admissible move improves the balance enough. Never fails: a
    /// proposal that breaks the partition invariant is logged and dropped.
    pub fn get_partition(&self, metrics: &[f64], current: &Arc<DynamicBlock>) -> Arc<DynamicBlock> {
        match self.propose(metrics, current) {
            Ok(Proposal::Replace(next)) => Arc::new(next),
            Ok(Proposal::Keep) => Arc::clone(current),
            Err(e) => {
                warn!(version = current.version(), "discarding proposed partition: {}", e);
                Arc::clone(current)
            },
        }
    }

    /// Like `get_partition` but reports why the current block is kept.
    ///
    /// Boundaries move along one axis only. Tiles that share the same
    /// cross-section and sit end to end along that axis form a run; within
    /// each run the cuts shift so that each tile's share of the run tends
    /// towards its measured speed (cells per unit load).
    pub fn propose(&self, metrics: &[f64], current: &DynamicBlock) -> Result<Proposal> {
        if metrics.len() != current.size() {
            warn!(got = metrics.len(), ranks = current.size(), "load metrics do not match the partition");
            return Ok(Proposal::Keep);
        }
        if metrics.iter().any(|m| !m.is_finite() || *m <= 0.0) {
            warn!(?metrics, "unusable load metrics, keeping partition");
            return Ok(Proposal::Keep);
        }
        let axis = self.policy.axis.unwrap_or_else(|| current.strategy().balance_axis(current.topology()));
        if axis >= current.ndim() {
            warn!(axis, ndim = current.ndim(), "balance axis out of range, keeping partition");
            return Ok(Proposal::Keep);
        }

        let fraction = self.policy.max_displacement.max(0.0).min(1.0);
        let min = current.stencil().min_extent();
        let speeds: Vec<f64> = current.tiles().iter().zip(metrics).map(|(t, m)| t.area() as f64 / m).collect();

        let mut regions: Vec<Region> = current.tiles().iter().map(|t| t.region().clone()).collect();
        let mut moved = false;
        for run in runs_along(current, axis) {
            if run.len() < 2 {
                continue;
            }
            let extents: Vec<usize> = run.iter().map(|&r| regions[r].extent()[axis]).collect();
            let run_speeds: Vec<f64> = run.iter().map(|&r| speeds[r]).collect();
            let resized = shift_cuts(&extents, &run_speeds, fraction, min);
            if resized == extents {
                continue;
            }
            moved = true;
            let mut origin = regions[run[0]].origin()[axis];
            for (&r, &n) in run.iter().zip(resized.iter()) {
                regions[r] = regions[r].with_axis(axis, origin, n);
                origin += n;
            }
        }
        if !moved {
            debug!(version = current.version(), "no admissible boundary move");
            return Ok(Proposal::Keep);
        }

        let predicted: Vec<f64> = current.tiles().iter().zip(regions.iter()).zip(metrics)
            .map(|((t, r), m)| m * r.volume() as f64 / t.area() as f64)
            .collect();
        let before = imbalance(metrics);
        let after = imbalance(&predicted);
        let gain = before - after;
        if gain <= 0.0 || gain < self.policy.min_improvement {
            debug!(before, after, "predicted gain below threshold");
            return Ok(Proposal::Keep);
        }

        let next = current.successor(regions)?;
        info!(version = next.version(), axis, before, after, "new partition");
        Ok(Proposal::Replace(next))
    }
}

/// Ranks grouped into runs along `axis`, each run ordered by position.
/// Grouping key is the cross-section, so runs are the same on every rank.
fn runs_along(block: &DynamicBlock, axis: usize) -> Vec<Vec<usize>> {
    let mut groups: BTreeMap<Vec<(usize, usize)>, Vec<usize>> = BTreeMap::new();
    for t in block.tiles() {
        let key = (0..block.ndim())
            .filter(|&a| a != axis)
            .map(|a| (t.origin()[a], t.extent()[a]))
            .collect();
        groups.entry(key).or_default().push(t.rank());
    }

    let mut runs = Vec::new();
    for (_, mut ranks) in groups {
        ranks.sort_by_key(|&r| block.tiles()[r].origin()[axis]);
        let mut run: Vec<usize> = Vec::new();
        for r in ranks {
            if let Some(&last) = run.last() {
                let t = &block.tiles()[last];
                if t.origin()[axis] + t.extent()[axis] != block.tiles()[r].origin()[axis] {
                    runs.push(std::mem::take(&mut run));
                }
            }
            run.push(r);
        }
        if !run.is_empty() {
            runs.push(run);
        }
    }
    runs
}

// Displacements below this are treated as zero when truncating,
// so rounding noise does not move a boundary by a whole cell.
const EPSILON: f64 = 1.0e-9;
const MAX_HALVINGS: usize = 8;

/// New extents for one run of tiles.
///
/// Each tile aims at a share proportional to its speed; the change is
/// clamped to `fraction` of its extent, then positive and negative changes
/// are scaled to cancel. Every internal cut may move by at most `fraction`
/// of the thinner of the two tiles beside it. Displacements are truncated
/// towards zero, so equally loaded neighbours never trade cells. If the
/// result leaves a tile thinner than `min`, the move is halved; the
/// original extents come back if that never succeeds.
pub fn shift_cuts(extents: &[usize], speeds: &[f64], fraction: f64, min: usize) -> Vec<usize> {
    let n = extents.len();
    let total: usize = extents.iter().sum();
    let speed_sum: f64 = speeds.iter().sum();
    if n < 2 || speed_sum <= 0.0 || !speed_sum.is_finite() {
        return extents.to_vec();
    }

    let mut delta: Vec<f64> = (0..n)
        .map(|i| {
            let target = total as f64 * speeds[i] / speed_sum;
            let bound = fraction * extents[i] as f64;
            (target - extents[i] as f64).max(-bound).min(bound)
        })
        .collect();

    let gain: f64 = delta.iter().filter(|d| **d > 0.0).sum();
    let loss: f64 = -delta.iter().filter(|d| **d < 0.0).sum::<f64>();
    if gain > loss {
        let scale = if gain > 0.0 { loss / gain } else { 0.0 };
        delta.iter_mut().filter(|d| **d > 0.0).for_each(|d| *d *= scale);
    } else if loss > gain {
        let scale = if loss > 0.0 { gain / loss } else { 0.0 };
        delta.iter_mut().filter(|d| **d < 0.0).for_each(|d| *d *= scale);
    }

    // cut k sits between tiles k-1 and k
    let mut shift: Vec<f64> = (1..n).map(|k| delta[..k].iter().sum()).collect();
    let mut scale: f64 = 1.0;
    for (k, s) in shift.iter().enumerate() {
        let bound = fraction * extents[k].min(extents[k + 1]) as f64;
        if s.abs() > bound {
            scale = scale.min(bound / s.abs());
        }
    }
    shift.iter_mut().for_each(|s| *s *= scale);

    for _ in 0..MAX_HALVINGS {
        let mut cuts = Vec::with_capacity(n + 1);
        cuts.push(0isize);
        let mut base = 0isize;
        for k in 0..n - 1 {
            base += extents[k] as isize;
            let s = shift[k];
            let step = ((s.abs() + EPSILON).floor() * s.signum()) as isize;
            cuts.push(base + step);
        }
        cuts.push(total as isize);

        let resized: Vec<isize> = cuts.windows(2).map(|w| w[1] - w[0]).collect();
        if resized.iter().all(|&e| e >= min as isize) {
            return resized.into_iter().map(|e| e as usize).collect();
        }
        shift.iter_mut().for_each(|s| *s *= 0.5);
    }
    extents.to_vec()
}
