//! Virtual process grid: where each rank sits and who borders whom

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};
use crate::geometry::{Connectivity, Direction, MAX_DIMS};

/// Ranks laid out in row-major order on an N-dimensional grid.
/// Coordinates are computed from the shape, never stored, so
/// the rank <-> coordinate mapping is a bijection by construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    shape: Vec<usize>,
    strides: Vec<usize>,
    hosts: Vec<u64>,
}

impl Topology {
    /// Fails if the shape is empty, has a zero extent, exceeds the
    /// supported dimensionality, or does not multiply out to `participants`.
    pub fn build(participants: usize, shape: &[usize]) -> Result<Self> {
        let invalid = || Error::InvalidShape { participants, shape: shape.to_vec() };
        if shape.is_empty() || shape.len() > MAX_DIMS || shape.iter().any(|&n| n == 0) {
            return Err(invalid());
        }
        if shape.iter().product::<usize>() != participants {
            return Err(invalid());
        }

        let mut strides = vec![1; shape.len()];
        for a in (0..shape.len() - 1).rev() {
            strides[a] = strides[a + 1] * shape[a + 1];
        }

        Ok(Topology {
            shape: shape.to_vec(),
            strides,
            hosts: vec![0; participants],
        })
    }

    /// Most nearly cubic factorisation of `participants` into `ndim` extents,
    /// largest first.
    pub fn balanced_shape(participants: usize, ndim: usize) -> Vec<usize> {
        let ndim = ndim.max(1);
        let mut factors = Vec::new();
        let mut n = participants.max(1);
        let mut p = 2;
        while p * p <= n {
            while n % p == 0 {
                factors.push(p);
                n /= p;
            }
            p += 1;
        }
        if n > 1 {
            factors.push(n);
        }

        let mut shape = vec![1; ndim];
        for f in factors.into_iter().rev() {
            let smallest = (0..ndim).min_by_key(|&a| shape[a]).unwrap_or(0);
            shape[smallest] *= f;
        }
        shape.sort_unstable_by(|a, b| b.cmp(a));
        shape
    }

    /// Attaches the host identity of every rank, in rank order
    pub fn with_hosts(mut self, hosts: Vec<u64>) -> Result<Self> {
        if hosts.len() != self.size() {
            return Err(Error::InvalidShape { participants: hosts.len(), shape: self.shape.clone() });
        }
        self.hosts = hosts;
        Ok(self)
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn host_of(&self, rank: usize) -> u64 {
        self.hosts.get(rank).copied().unwrap_or(0)
    }

    pub fn coordinates_of(&self, rank: usize) -> Option<Vec<usize>> {
        if rank >= self.size() {
            return None;
        }
        Some(self.strides.iter().zip(self.shape.iter()).map(|(s, n)| (rank / s) % n).collect())
    }

    pub fn rank_at(&self, coords: &[usize]) -> Option<usize> {
        if coords.len() != self.ndim() || coords.iter().zip(self.shape.iter()).any(|(c, n)| c >= n) {
            return None;
        }
        Some(coords.iter().zip(self.strides.iter()).map(|(c, s)| c * s).sum())
    }

    /// Rank one step away in `direction`, if the grid extends that far.
    /// No wrapping: outward-facing sides at the domain edge have no neighbour.
    pub fn rank_towards(&self, rank: usize, direction: &Direction) -> Option<usize> {
        let coords = self.coordinates_of(rank)?;
        let mut next = Vec::with_capacity(coords.len());
        for (a, &c) in coords.iter().enumerate() {
            let moved = c as isize + direction.offset(a) as isize;
            if moved < 0 || moved as usize >= self.shape[a] {
                return None;
            }
            next.push(moved as usize);
        }
        self.rank_at(&next)
    }

    /// Grid neighbours of `rank`, ascending. With `Connectivity::Faces` only
    /// ranks one step along a single axis; with `Full` the diagonals too.
    pub fn neighbors_of(&self, rank: usize, connectivity: Connectivity) -> Vec<usize> {
        let mut ranks: Vec<usize> = Direction::all(self.ndim(), connectivity)
            .iter()
            .filter_map(|d| self.rank_towards(rank, d))
            .collect();
        ranks.sort_unstable();
        ranks.dedup();
        ranks
    }
}

/// Stable identity of a machine, for diagnostics
pub fn host_identity(processor_name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    processor_name.hash(&mut hasher);
    hasher.finish()
}
