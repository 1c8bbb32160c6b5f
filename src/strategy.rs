//! Initial assignment of the domain to ranks

use std::fmt;
use std::ops::Range;

use crate::error::{Error, Result};
use crate::geometry::Region;
use crate::topology::Topology;

/// How the first partition is laid out. Closed set, chosen at start-up.
#[derive(Clone, Debug, PartialEq)]
pub enum AssignmentStrategy {
    /// Near-equal blocks on the topology grid
    Uniform,
    /// Slabs along one axis, ranks in order
    Striped { axis: usize },
    /// Recursive bisection of the longest axis
    Bisection,
    /// Blocks on the topology grid, sized in proportion to per-rank weights
    Weighted { weights: Vec<f64> },
}

impl AssignmentStrategy {
    /// One region per rank, in rank order. The regions tile `domain`;
    /// the minimum-extent check is left to the caller.
    pub fn assign(&self, topology: &Topology, domain: &[usize]) -> Result<Vec<Region>> {
        match self {
            AssignmentStrategy::Uniform => {
                let splits = (0..domain.len())
                    .map(|a| balanced_split(domain[a], topology.shape()[a]))
                    .collect();
                Ok(tensor_regions(topology, splits))
            },
            AssignmentStrategy::Striped { axis } => {
                let axis = *axis;
                if axis >= domain.len() {
                    return Err(Error::InvalidStrategy(format!("stripe axis {} outside a {}-d domain", axis, domain.len())));
                }
                let whole = Region::from_shape(domain);
                let mut origin = 0;
                Ok(balanced_split(domain[axis], topology.size())
                    .into_iter()
                    .map(|n| {
                        let r = whole.with_axis(axis, origin, n);
                        origin += n;
                        r
                    })
                    .collect())
            },
            AssignmentStrategy::Bisection => {
                let mut out = vec![Region::default(); topology.size()];
                bisect(Region::from_shape(domain), 0..topology.size(), &mut out);
                Ok(out)
            },
            AssignmentStrategy::Weighted { weights } => {
                if weights.len() != topology.size() {
                    return Err(Error::InvalidStrategy(format!("{} weights given for {} ranks", weights.len(), topology.size())));
                }
                if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
                    return Err(Error::InvalidStrategy("weights must be positive and finite".to_owned()));
                }
                let mut splits = Vec::with_capacity(domain.len());
                for a in 0..domain.len() {
                    let mut slice = vec![0.0; topology.shape()[a]];
                    for (rank, w) in weights.iter().enumerate() {
                        if let Some(c) = topology.coordinates_of(rank) {
                            slice[c[a]] += w;
                        }
                    }
                    splits.push(weighted_split(domain[a], &slice));
                }
                Ok(tensor_regions(topology, splits))
            },
        }
    }

    /// Axis along which the balancer moves boundaries when none is configured:
    /// the stripe axis, otherwise the topology axis holding the most ranks
    /// (the last such axis on ties).
    pub fn balance_axis(&self, topology: &Topology) -> usize {
        match self {
            AssignmentStrategy::Striped { axis } => *axis,
            _ => {
                let shape = topology.shape();
                (0..shape.len()).max_by_key(|&a| shape[a]).unwrap_or(0)
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AssignmentStrategy::Uniform => "uniform",
            AssignmentStrategy::Striped { .. } => "striped",
            AssignmentStrategy::Bisection => "bisection",
            AssignmentStrategy::Weighted { .. } => "weighted",
        }
    }
}

impl fmt::Display for AssignmentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AssignmentStrategy::Striped { axis } => write!(f, "striped along axis {}", axis),
            AssignmentStrategy::Weighted { weights } => write!(f, "weighted {:?}", weights),
            s => write!(f, "{}", s.name()),
        }
    }
}

/// Splits `n` cells into `k` parts differing by at most one,
/// larger parts first.
pub fn balanced_split(n: usize, k: usize) -> Vec<usize> {
    if k == 0 {
        return Vec::new();
    }
    let base = n / k;
    let rem = n % k;
    (0..k).map(|i| base + usize::from(i < rem)).collect()
}

/// Splits `n` cells in proportion to `weights` by largest remainder.
/// Ties go to the lower index, so every rank computes the same split.
pub fn weighted_split(n: usize, weights: &[f64]) -> Vec<usize> {
    let total: f64 = weights.iter().sum();
    if weights.is_empty() || total <= 0.0 {
        return balanced_split(n, weights.len());
    }
    let ideal: Vec<f64> = weights.iter().map(|w| n as f64 * w / total).collect();
    let mut parts: Vec<usize> = ideal.iter().map(|x| x.floor() as usize).collect();
    let assigned: usize = parts.iter().sum();

    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by(|&i, &j| {
        let fi = ideal[i] - ideal[i].floor();
        let fj = ideal[j] - ideal[j].floor();
        fj.partial_cmp(&fi).unwrap_or(std::cmp::Ordering::Equal).then(i.cmp(&j))
    });
    for &i in order.iter().take(n.saturating_sub(assigned)) {
        parts[i] += 1;
    }
    parts
}

// Cartesian product of per-axis splits, indexed by topology coordinates
fn tensor_regions(topology: &Topology, splits: Vec<Vec<usize>>) -> Vec<Region> {
    let starts: Vec<Vec<usize>> = splits
        .iter()
        .map(|s| s.iter().scan(0, |acc, &n| { let o = *acc; *acc += n; Some(o) }).collect())
        .collect();
    (0..topology.size())
        .map(|rank| {
            let coords = topology.coordinates_of(rank).unwrap_or_default();
            let origin = coords.iter().enumerate().map(|(a, &c)| starts[a][c]).collect();
            let extent = coords.iter().enumerate().map(|(a, &c)| splits[a][c]).collect();
            Region::new(origin, extent)
        })
        .collect()
}

fn bisect(region: Region, ranks: Range<usize>, out: &mut [Region]) {
    let count = ranks.len();
    if count == 1 {
        out[ranks.start] = region;
        return;
    }
    let extent = region.extent();
    let axis = (0..region.ndim()).fold(0, |best, a| if extent[a] > extent[best] {a} else {best});
    let lower = count / 2;
    let cut = extent[axis] * lower / count;

    let origin = region.origin()[axis];
    let first = region.with_axis(axis, origin, cut);
    let second = region.with_axis(axis, origin + cut, extent[axis] - cut);
    bisect(first, ranks.start..ranks.start + lower, out);
    bisect(second, ranks.start + lower..ranks.end, out);
}
