//! One rank's piece of the domain

use std::fmt;

#[cfg(feature = "mpi")]
use mpi::{datatype::UserDatatype, traits::*};
#[cfg(feature = "mpi")]
use memoffset::offset_of;

use crate::geometry::{Direction, Region, MAX_DIMS};

/// Interior box plus ghost layers of a single rank.
///
/// The halo width is the same for every tile, but the ghost layers are
/// clipped at the global domain boundary: a tile touching the lower edge
/// along some axis has no ghost cells on that side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tile {
    rank: usize,
    host: u64,
    region: Region,
    halo: usize,
    halo_lo: Vec<usize>,
    halo_hi: Vec<usize>,
}

impl Tile {
    pub fn new(rank: usize, region: Region, halo: usize, domain: &[usize]) -> Self {
        let end = region.end();
        let halo_lo = region.origin().iter().map(|&o| halo.min(o)).collect();
        let halo_hi = end.iter().zip(domain).map(|(&e, &n)| halo.min(n.saturating_sub(e))).collect();
        Tile { rank, host: 0, region, halo, halo_lo, halo_hi }
    }

    pub fn with_host(mut self, host: u64) -> Self {
        self.host = host;
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn host(&self) -> u64 {
        self.host
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn origin(&self) -> &[usize] {
        self.region.origin()
    }

    pub fn extent(&self) -> &[usize] {
        self.region.extent()
    }

    pub fn ndim(&self) -> usize {
        self.region.ndim()
    }

    pub fn halo(&self) -> usize {
        self.halo
    }

    /// Ghost layers actually present below the interior, per axis
    pub fn halo_lo(&self) -> &[usize] {
        &self.halo_lo
    }

    /// Ghost layers actually present above the interior, per axis
    pub fn halo_hi(&self) -> &[usize] {
        &self.halo_hi
    }

    /// Number of interior cells
    pub fn area(&self) -> usize {
        self.region.volume()
    }

    /// Shape of the local buffer, interior plus ghosts
    pub fn ext_extent(&self) -> Vec<usize> {
        (0..self.ndim()).map(|a| self.extent()[a] + self.halo_lo[a] + self.halo_hi[a]).collect()
    }

    /// Number of cells in the local buffer
    pub fn ext_area(&self) -> usize {
        self.ext_extent().iter().product()
    }

    /// The local buffer's footprint in global coordinates
    pub fn ext_region(&self) -> Region {
        self.region.grow(&self.halo_lo, &self.halo_hi)
    }

    /// Global coordinates of local index zero
    pub fn local_offset(&self) -> Vec<usize> {
        self.ext_region().origin().to_vec()
    }

    pub fn to_local(&self, global: &[usize]) -> Option<Vec<usize>> {
        let ext = self.ext_region();
        if !ext.contains(global) {
            return None;
        }
        Some(global.iter().zip(ext.origin()).map(|(g, o)| g - o).collect())
    }

    pub fn to_global(&self, local: &[usize]) -> Vec<usize> {
        local.iter().zip(self.local_offset()).map(|(l, o)| l + o).collect()
    }

    /// Ghost cells lying in `direction`, `None` where the tile sits on the
    /// domain boundary on that side.
    pub fn ghost_region(&self, direction: &Direction) -> Option<Region> {
        let (origin, extent) = self.slab(direction, |a, upper| {
            if upper {
                (self.origin()[a] + self.extent()[a], self.halo_hi[a])
            } else {
                (self.origin()[a] - self.halo_lo[a], self.halo_lo[a])
            }
        })?;
        Some(Region::new(origin, extent))
    }

    /// Interior cells a neighbour in `direction` would need as its ghosts
    pub fn boundary_region(&self, direction: &Direction) -> Option<Region> {
        let (origin, extent) = self.slab(direction, |a, upper| {
            if upper {
                let depth = self.halo_hi[a];
                (self.origin()[a] + self.extent()[a] - depth, depth)
            } else {
                (self.origin()[a], self.halo_lo[a])
            }
        })?;
        Some(Region::new(origin, extent))
    }

    fn slab<F>(&self, direction: &Direction, side: F) -> Option<(Vec<usize>, Vec<usize>)>
    where
        F: Fn(usize, bool) -> (usize, usize),
    {
        let mut origin = Vec::with_capacity(self.ndim());
        let mut extent = Vec::with_capacity(self.ndim());
        for a in 0..self.ndim() {
            let (o, e) = match direction.offset(a) {
                0 => (self.origin()[a], self.extent()[a]),
                d => side(a, d > 0),
            };
            if e == 0 {
                return None;
            }
            origin.push(o);
            extent.push(e);
        }
        Some((origin, extent))
    }

    /// Extent of the ghost slab in `direction`; the exchange buffer for a
    /// neighbour covering the whole face holds exactly this many cells.
    pub fn shared_edge(&self, direction: &Direction) -> Option<Vec<usize>> {
        self.ghost_region(direction).map(|r| r.extent().to_vec())
    }

    /// Local index at which the ghost slab in `direction` starts
    pub fn overlap_offset(&self, direction: &Direction) -> Option<Vec<usize>> {
        let ext = self.ext_region();
        self.ghost_region(direction).map(|r| r.offset_within(&ext))
    }

    /// Part of `other`'s interior that lands in this tile's ghost slab
    /// in `direction`.
    pub fn shared_region(&self, other: &Tile, direction: &Direction) -> Option<Region> {
        self.ghost_region(direction)?.intersect(other.region())
    }

    pub fn to_msg(&self) -> TileMsg {
        let mut msg = TileMsg { rank: self.rank as u64, host: self.host, ..TileMsg::default() };
        for a in 0..self.ndim() {
            msg.origin[a] = self.origin()[a] as u64;
            msg.extent[a] = self.extent()[a] as u64;
        }
        msg
    }

    pub fn from_msg(msg: &TileMsg, halo: usize, domain: &[usize]) -> Self {
        let ndim = domain.len();
        let origin = msg.origin[..ndim].iter().map(|&o| o as usize).collect();
        let extent = msg.extent[..ndim].iter().map(|&e| e as usize).collect();
        Tile::new(msg.rank as usize, Region::new(origin, extent), halo, domain).with_host(msg.host)
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rank {} (host {:016x}): {} halo {}", self.rank, self.host, self.region, self.halo)
    }
}

/// Fixed-size wire form of a tile, used to check that all ranks
/// derived the same partition.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TileMsg {
    pub origin: [u64; MAX_DIMS],
    pub extent: [u64; MAX_DIMS],
    pub rank: u64,
    pub host: u64,
}

#[cfg(feature = "mpi")]
unsafe impl Equivalence for TileMsg {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        let blocklengths = [MAX_DIMS as mpi::Count, MAX_DIMS as mpi::Count, 1, 1];
        let displacements = [
            offset_of!(TileMsg, origin) as mpi::Address,
            offset_of!(TileMsg, extent) as mpi::Address,
            offset_of!(TileMsg, rank) as mpi::Address,
            offset_of!(TileMsg, host) as mpi::Address,
        ];
        let mpi_u64 = u64::equivalent_datatype();
        let types: [&dyn Datatype; 4] = [&mpi_u64; 4];
        UserDatatype::structured(4, &blocklengths, &displacements, &types)
    }
}
