//! The authoritative global partition

use std::fmt;
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};

use crate::error::{Error, Result};
use crate::field::{region_view, region_view_mut};
use crate::geometry::{for_each_index, linear_index, Connectivity, Direction, Region};
use crate::strategy::AssignmentStrategy;
use crate::tile::Tile;
use crate::topology::Topology;

/// Shape of the numerical stencil: how deep the ghost layers are and
/// whether diagonal neighbours contribute.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Stencil {
    pub halo: usize,
    pub connectivity: Connectivity,
}

impl Stencil {
    pub fn new(halo: usize, connectivity: Connectivity) -> Self {
        Stencil { halo, connectivity }
    }

    /// Smallest interior extent a tile may have along any axis. Thinner
    /// tiles would let the ghost layers of non-adjacent tiles overlap.
    pub fn min_extent(&self) -> usize {
        self.halo.max(1)
    }
}

/// Data that changes hands when the partition is replaced, seen from one rank
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Migration {
    /// Cells owned before and after
    pub persist: Option<Region>,
    /// Cells this rank hands to each new owner, ascending rank
    pub export: Vec<(usize, Region)>,
    /// Cells this rank takes over from each old owner, ascending rank
    pub import: Vec<(usize, Region)>,
}

const UNOWNED: usize = usize::MAX;

/// Owner of every cell of the grid refined by all tile boundaries.
/// Building it is the coverage/no-overlap check; afterwards it answers
/// coordinate lookups with one binary search per axis.
#[derive(Clone, Debug)]
struct OwnerTable {
    cuts: Vec<Vec<usize>>,
    shape: Vec<usize>,
    owner: Vec<usize>,
}

impl OwnerTable {
    fn build(tiles: &[Tile], domain: &[usize]) -> Result<Self> {
        let ndim = domain.len();
        for t in tiles {
            if t.ndim() != ndim {
                return Err(Error::PartitionInvariant(format!("tile of rank {} has {} axes, domain has {}", t.rank(), t.ndim(), ndim)));
            }
            if t.region().is_empty() {
                return Err(Error::PartitionInvariant(format!("tile of rank {} is empty", t.rank())));
            }
            if !Region::from_shape(domain).contains_region(t.region()) {
                return Err(Error::PartitionInvariant(format!("tile of rank {} leaves the domain {:?}", t.rank(), domain)));
            }
        }

        let mut cuts = Vec::with_capacity(ndim);
        for a in 0..ndim {
            let mut c = vec![0, domain[a]];
            for t in tiles {
                c.push(t.origin()[a]);
                c.push(t.origin()[a] + t.extent()[a]);
            }
            c.sort_unstable();
            c.dedup();
            cuts.push(c);
        }
        let shape: Vec<usize> = cuts.iter().map(|c| c.len() - 1).collect();
        let mut owner = vec![UNOWNED; shape.iter().product()];

        for t in tiles {
            let end = t.region().end();
            let mut lo = Vec::with_capacity(ndim);
            let mut span = Vec::with_capacity(ndim);
            for a in 0..ndim {
                // both present by construction of the cut lists
                let first = cuts[a].partition_point(|&c| c < t.origin()[a]);
                let last = cuts[a].partition_point(|&c| c < end[a]);
                lo.push(first);
                span.push(last - first);
            }
            let mut clash = None;
            for_each_index(&span, |idx| {
                let cell: Vec<usize> = idx.iter().zip(lo.iter()).map(|(i, l)| i + l).collect();
                let slot = &mut owner[linear_index(&cell, &shape)];
                if *slot != UNOWNED && clash.is_none() {
                    clash = Some((*slot, cell.clone()));
                }
                *slot = t.rank();
            });
            if let Some((other, cell)) = clash {
                let at: Vec<usize> = cell.iter().enumerate().map(|(a, &i)| cuts[a][i]).collect();
                return Err(Error::PartitionInvariant(format!("tiles of ranks {} and {} overlap at {:?}", other, t.rank(), at)));
            }
        }

        if let Some(hole) = owner.iter().position(|&o| o == UNOWNED) {
            let mut at = vec![0; ndim];
            let mut rest = hole;
            for a in (0..ndim).rev() {
                at[a] = cuts[a][rest % shape[a]];
                rest /= shape[a];
            }
            return Err(Error::PartitionInvariant(format!("no tile covers {:?}", at)));
        }

        Ok(OwnerTable { cuts, shape, owner })
    }

    fn lookup(&self, coords: &[usize]) -> Option<usize> {
        if coords.len() != self.cuts.len() {
            return None;
        }
        let mut idx = Vec::with_capacity(coords.len());
        for (a, &x) in coords.iter().enumerate() {
            let cuts = &self.cuts[a];
            if x >= cuts[cuts.len() - 1] {
                return None;
            }
            idx.push(cuts.partition_point(|&c| c <= x) - 1);
        }
        Some(self.owner[linear_index(&idx, &self.shape)])
    }
}

/// One tile per rank, exactly covering the global domain.
///
/// Immutable once built: a rebalance produces a new block with a
/// higher version number, and the old one is dropped once every
/// transfer referencing it is done.
#[derive(Clone, Debug)]
pub struct DynamicBlock {
    version: u64,
    topology: Arc<Topology>,
    domain: Vec<usize>,
    stencil: Stencil,
    strategy: AssignmentStrategy,
    tiles: Vec<Tile>,
    owners: OwnerTable,
    displs: Vec<usize>,
}

impl DynamicBlock {
    /// Lays out the first partition with `strategy`.
    pub fn build(topology: Arc<Topology>, domain: &[usize], stencil: Stencil, strategy: AssignmentStrategy) -> Result<Self> {
        let unpartitionable = |reason: String| Error::UnpartitionableDomain {
            domain: domain.to_vec(),
            participants: topology.size(),
            halo: stencil.halo,
            reason,
        };
        if domain.len() != topology.ndim() {
            return Err(unpartitionable(format!("domain has {} axes, topology has {}", domain.len(), topology.ndim())));
        }
        if let Some(a) = domain.iter().position(|&n| n == 0) {
            return Err(unpartitionable(format!("empty along axis {}", a)));
        }

        let regions = strategy.assign(&topology, domain)?;
        let min = stencil.min_extent();
        for (rank, r) in regions.iter().enumerate() {
            if let Some(a) = (0..r.ndim()).find(|&a| r.extent()[a] < min) {
                return Err(unpartitionable(format!(
                    "rank {} would get extent {} along axis {}, minimum is {}",
                    rank, r.extent()[a], a, min)));
            }
        }

        DynamicBlock::from_regions(topology, domain, stencil, strategy, regions, 0)
    }

    /// Wraps a set of regions, one per rank, after checking that they
    /// partition the domain and respect the minimum extent.
    pub fn from_regions(
        topology: Arc<Topology>,
        domain: &[usize],
        stencil: Stencil,
        strategy: AssignmentStrategy,
        regions: Vec<Region>,
        version: u64,
    ) -> Result<Self> {
        if regions.len() != topology.size() {
            return Err(Error::PartitionInvariant(format!("{} tiles for {} ranks", regions.len(), topology.size())));
        }
        let min = stencil.min_extent();
        if let Some(rank) = regions.iter().position(|r| r.extent().iter().any(|&e| e < min)) {
            return Err(Error::PartitionInvariant(format!("tile of rank {} thinner than {} cells", rank, min)));
        }

        let tiles: Vec<Tile> = regions
            .into_iter()
            .enumerate()
            .map(|(rank, r)| Tile::new(rank, r, stencil.halo, domain).with_host(topology.host_of(rank)))
            .collect();
        let owners = OwnerTable::build(&tiles, domain)?;
        let displs = tiles
            .iter()
            .scan(0, |acc, t| { let d = *acc; *acc += t.area(); Some(d) })
            .collect();

        Ok(DynamicBlock {
            version,
            topology,
            domain: domain.to_vec(),
            stencil,
            strategy,
            tiles,
            owners,
            displs,
        })
    }

    /// Same topology, stencil and strategy with new tile regions
    pub fn successor(&self, regions: Vec<Region>) -> Result<Self> {
        DynamicBlock::from_regions(
            Arc::clone(&self.topology),
            &self.domain,
            self.stencil,
            self.strategy.clone(),
            regions,
            self.version + 1,
        )
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn domain(&self) -> &[usize] {
        &self.domain
    }

    pub fn ndim(&self) -> usize {
        self.domain.len()
    }

    pub fn stencil(&self) -> Stencil {
        self.stencil
    }

    pub fn strategy(&self) -> &AssignmentStrategy {
        &self.strategy
    }

    pub fn size(&self) -> usize {
        self.tiles.len()
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn tile(&self, rank: usize) -> Option<&Tile> {
        self.tiles.get(rank)
    }

    pub fn total_area(&self) -> usize {
        self.domain.iter().product()
    }

    /// Rank owning the cell at `coords`, `None` outside the domain
    pub fn gid_by_coords(&self, coords: &[usize]) -> Option<usize> {
        self.owners.lookup(coords)
    }

    /// Interior box of `rank`
    pub fn coords_by_gid(&self, rank: usize) -> Option<&Region> {
        self.tiles.get(rank).map(Tile::region)
    }

    /// Interior cell count of each rank
    pub fn counts_vect(&self) -> Vec<usize> {
        self.tiles.iter().map(Tile::area).collect()
    }

    /// Offset of each rank's interior in the rank-ordered global buffer
    pub fn displs_vect(&self) -> &[usize] {
        &self.displs
    }

    /// Counts as MPI-style element counts
    pub fn counts_arr(&self) -> Vec<i32> {
        self.tiles.iter().map(|t| t.area() as i32).collect()
    }

    /// Displacements as MPI-style element offsets
    pub fn displs_arr(&self) -> Vec<i32> {
        self.displs.iter().map(|&d| d as i32).collect()
    }

    /// Ranks that share ghost cells with `rank` in either direction,
    /// ascending: some tile's interior lands in a ghost slab of the other
    /// that the stencil's connectivity admits. After a rebalance these need
    /// not be neighbours on the topology grid, and with a halo wider than
    /// one cell they need not touch `rank`'s tile at all.
    pub fn adj_ranks(&self, rank: usize) -> Vec<usize> {
        let me = match self.tiles.get(rank) {
            Some(t) => t,
            None => return Vec::new(),
        };
        let directions = Direction::all(self.ndim(), self.stencil.connectivity);
        let reach = me.ext_region();
        self.tiles
            .iter()
            .filter(|t| t.rank() != rank)
            .filter(|t| reach.intersect(t.region()).is_some() || t.ext_region().intersect(me.region()).is_some())
            .filter(|t| {
                directions
                    .iter()
                    .any(|d| me.shared_region(t, d).is_some() || t.shared_region(me, d).is_some())
            })
            .map(Tile::rank)
            .collect()
    }

    /// True if both blocks assign the same region to every rank
    pub fn same_tiles(&self, other: &DynamicBlock) -> bool {
        self.tiles.len() == other.tiles.len()
            && self.tiles.iter().zip(other.tiles.iter()).all(|(a, b)| a.region() == b.region())
    }

    /// What `rank` keeps, sends and receives when `next` replaces this block
    pub fn migration(&self, next: &DynamicBlock, rank: usize) -> Migration {
        let mut plan = Migration::default();
        let (old, new) = match (self.tile(rank), next.tile(rank)) {
            (Some(o), Some(n)) => (o.region(), n.region()),
            _ => return plan,
        };
        plan.persist = old.intersect(new);
        for peer in 0..self.size().min(next.size()) {
            if peer == rank {
                continue;
            }
            if let Some(r) = old.intersect(next.tiles[peer].region()) {
                plan.export.push((peer, r));
            }
            if let Some(r) = self.tiles[peer].region().intersect(new) {
                plan.import.push((peer, r));
            }
        }
        plan
    }

    /// Global array flattened rank by rank, each interior in row-major order;
    /// rank `r`'s cells start at `displs_vect()[r]`.
    pub fn linearize<T: Clone>(&self, global: &ArrayD<T>) -> Result<Vec<T>> {
        if global.shape() != self.domain.as_slice() {
            return Err(Error::MalformedTransfer {
                peer: 0,
                detail: format!("global array of shape {:?}, domain is {:?}", global.shape(), self.domain),
            });
        }
        let origin = vec![0; self.ndim()];
        let mut out = Vec::with_capacity(self.total_area());
        for t in &self.tiles {
            out.extend(region_view(global, t.region(), &origin).iter().cloned());
        }
        Ok(out)
    }

    /// Inverse of [`DynamicBlock::linearize`]
    pub fn assemble<T: Clone + Default>(&self, linear: &[T]) -> Result<ArrayD<T>> {
        if linear.len() != self.total_area() {
            return Err(Error::MalformedTransfer {
                peer: 0,
                detail: format!("buffer of {} cells for a domain of {}", linear.len(), self.total_area()),
            });
        }
        let origin = vec![0; self.ndim()];
        let mut global = ArrayD::<T>::default(IxDyn(&self.domain));
        for (t, &start) in self.tiles.iter().zip(self.displs.iter()) {
            let chunk = &linear[start..start + t.area()];
            let src = ndarray::ArrayViewD::from_shape(IxDyn(t.extent()), chunk).map_err(|e| Error::MalformedTransfer {
                peer: t.rank(),
                detail: e.to_string(),
            })?;
            region_view_mut(&mut global, t.region(), &origin).assign(&src);
        }
        Ok(global)
    }
}

impl fmt::Display for DynamicBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "partition v{} of {:?} ({}, halo {})", self.version, self.domain, self.strategy, self.stencil.halo)?;
        for t in &self.tiles {
            writeln!(f, "  {}", t)?;
        }
        Ok(())
    }
}
