//! Ghost layer exchange, redistribution after a rebalance, and
//! whole-field gather/scatter through the displacement tables

use ndarray::ArrayD;
use tracing::{debug, error, trace, warn};

use crate::block::DynamicBlock;
use crate::comm::{Communicator, Element, Message, TAG_GATHER, TAG_HALO, TAG_MIGRATE};
use crate::error::{Error, Result};
use crate::field::LocalField;
use crate::geometry::{Direction, Region};
use crate::tile::Tile;

/// Everything one rank ships to, or takes from, one peer in a single
/// message: the regions are concatenated in order, each row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub peer: usize,
    pub regions: Vec<Region>,
}

impl Transfer {
    pub fn volume(&self) -> usize {
        self.regions.iter().map(Region::volume).sum()
    }
}

/// Who exchanges which cells with whom, for one rank and one block version.
///
/// For each direction the stencil needs, the ghost slab of the receiving
/// tile is cut against the interior of every tile it reaches. With a halo
/// wider than one cell that includes tiles which don't touch the receiver.
/// Sender and receiver evaluate the same intersections in the same
/// direction order, so both sides agree on the message layout without
/// negotiating it.
#[derive(Clone, Debug)]
pub struct HaloPlan {
    rank: usize,
    version: u64,
    ghosts: usize,
    sends: Vec<Transfer>,
    recvs: Vec<Transfer>,
}

impl HaloPlan {
    pub fn new(block: &DynamicBlock, rank: usize) -> Self {
        let mut plan = HaloPlan { rank, version: block.version(), ghosts: 0, sends: Vec::new(), recvs: Vec::new() };
        let me = match block.tile(rank) {
            Some(t) => t,
            None => return plan,
        };
        let connectivity = block.stencil().connectivity;
        let directions = Direction::all(block.ndim(), connectivity);

        for d in &directions {
            if let Some(edge) = me.shared_edge(d) {
                plan.ghosts += edge.iter().product::<usize>();
                trace!(rank, direction = %d, offset = ?me.overlap_offset(d), edge = ?edge, "ghost slab");
            }
        }

        for peer in block.adj_ranks(rank) {
            let other = &block.tiles()[peer];
            let recv: Vec<Region> = directions.iter().filter_map(|d| me.shared_region(other, d)).collect();
            let send: Vec<Region> = directions.iter().filter_map(|d| other.shared_region(me, d)).collect();
            if !send.is_empty() {
                plan.sends.push(Transfer { peer, regions: send });
            }
            if !recv.is_empty() {
                plan.recvs.push(Transfer { peer, regions: recv });
            }
        }

        let grid = block.topology().neighbors_of(rank, connectivity);
        let peers: Vec<usize> = plan.recvs.iter().map(|t| t.peer).collect();
        if peers != grid {
            debug!(rank, version = plan.version, ?grid, ?peers, "halo peers differ from grid neighbours");
        }
        if !plan.is_complete() {
            warn!(rank, version = plan.version, ghosts = plan.ghosts, received = plan.volume(), "halo plan leaves ghost cells unfilled");
        }
        plan
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn sends(&self) -> &[Transfer] {
        &self.sends
    }

    pub fn recvs(&self) -> &[Transfer] {
        &self.recvs
    }

    /// Cells received per exchange
    pub fn volume(&self) -> usize {
        self.recvs.iter().map(Transfer::volume).sum()
    }

    /// Ghost cells of this rank's tile the stencil reads
    pub fn ghosts(&self) -> usize {
        self.ghosts
    }

    /// True if every such ghost cell is written by exactly one transfer,
    /// which holds for any valid partition
    pub fn is_complete(&self) -> bool {
        self.volume() == self.ghosts
    }
}

fn local_tile<'b, C: Communicator>(block: &'b DynamicBlock, comm: &C) -> Result<&'b Tile> {
    if comm.size() != block.size() {
        return Err(Error::InvalidShape { participants: comm.size(), shape: block.topology().shape().to_vec() });
    }
    block.tile(comm.rank()).ok_or_else(|| Error::InvalidShape {
        participants: comm.size(),
        shape: block.topology().shape().to_vec(),
    })
}

fn check_field<T: Element>(tile: &Tile, field: &LocalField<T>, version: u64) -> Result<()> {
    if field.tile().region() != tile.region() {
        return Err(Error::MalformedTransfer {
            peer: tile.rank(),
            detail: format!("local field covers {}, partition v{} assigns {}", field.tile().region(), version, tile.region()),
        });
    }
    Ok(())
}

fn unpack_transfer<T: Element>(field: &mut LocalField<T>, transfer: &Transfer, msg: Message<T>) -> Result<()> {
    if msg.peer != transfer.peer || msg.payload.len() != transfer.volume() {
        return Err(Error::MalformedTransfer {
            peer: msg.peer,
            detail: format!("{} values where {} were expected from rank {}", msg.payload.len(), transfer.volume(), transfer.peer),
        });
    }
    let mut at = 0;
    for r in &transfer.regions {
        let n = r.volume();
        field.unpack(r, &msg.payload[at..at + n])?;
        at += n;
    }
    Ok(())
}

/// Refreshes the ghost layers of `field` from the neighbouring ranks.
/// Must be called on all ranks. Returns once every rank has its ghosts.
pub fn exchange<T, C>(block: &DynamicBlock, comm: &C, field: &mut LocalField<T>) -> Result<()>
where
    T: Element,
    C: Communicator,
{
    let plan = HaloPlan::new(block, comm.rank());
    exchange_planned(&plan, block, comm, field)
}

/// As [`exchange`], reusing a plan built for this block version
pub fn exchange_planned<T, C>(plan: &HaloPlan, block: &DynamicBlock, comm: &C, field: &mut LocalField<T>) -> Result<()>
where
    T: Element,
    C: Communicator,
{
    let me = local_tile(block, comm)?;
    check_field(me, field, block.version())?;
    if plan.version() != block.version() || plan.rank() != comm.rank() {
        return Err(Error::MalformedTransfer {
            peer: comm.rank(),
            detail: format!("halo plan for rank {} v{} used with rank {} v{}", plan.rank(), plan.version(), comm.rank(), block.version()),
        });
    }

    /* Pack every outgoing slab first; the transport posts all sends
       before it waits on any receive. */

    let mut outgoing = Vec::with_capacity(plan.sends().len());
    for t in plan.sends() {
        let mut payload = Vec::with_capacity(t.volume());
        for r in &t.regions {
            payload.extend(field.pack(r)?);
        }
        outgoing.push(Message::new(t.peer, payload));
    }
    let peers: Vec<usize> = plan.recvs().iter().map(|t| t.peer).collect();

    let received = comm.exchange(TAG_HALO, outgoing, &peers).map_err(|e| {
        error!(rank = comm.rank(), version = block.version(), "halo exchange failed: {}", e);
        e
    })?;

    for (t, msg) in plan.recvs().iter().zip(received) {
        unpack_transfer(field, t, msg).map_err(|e| {
            error!(rank = comm.rank(), "bad halo payload: {}", e);
            e
        })?;
    }

    // nobody reads ghosts before all ranks are done
    comm.barrier()
}

/// Moves ownership from `old` to `new`: every rank sends exactly the
/// intersection of its old interior with each other rank's new interior.
/// Returns the rank's buffer for the new tile with interior filled and
/// ghosts defaulted; run a halo exchange before reading them.
pub fn redistribute<T, C>(old: &DynamicBlock, new: &DynamicBlock, comm: &C, field: &LocalField<T>) -> Result<LocalField<T>>
where
    T: Element,
    C: Communicator,
{
    let before = local_tile(old, comm)?;
    let after = local_tile(new, comm)?;
    check_field(before, field, old.version())?;

    let plan = old.migration(new, comm.rank());
    let mut next = LocalField::new(after);
    if let Some(r) = &plan.persist {
        next.unpack(r, &field.pack(r)?)?;
    }

    let mut outgoing = Vec::with_capacity(plan.export.len());
    for (peer, r) in &plan.export {
        outgoing.push(Message::new(*peer, field.pack(r)?));
    }
    let peers: Vec<usize> = plan.import.iter().map(|(p, _)| *p).collect();
    debug!(
        rank = comm.rank(),
        from = old.version(),
        to = new.version(),
        exports = outgoing.len(),
        imports = peers.len(),
        "redistributing"
    );

    let received = comm.exchange(TAG_MIGRATE, outgoing, &peers).map_err(|e| {
        error!(rank = comm.rank(), "redistribution failed: {}", e);
        e
    })?;
    for ((peer, r), msg) in plan.import.iter().zip(received) {
        let transfer = Transfer { peer: *peer, regions: vec![r.clone()] };
        unpack_transfer(&mut next, &transfer, msg)?;
    }

    comm.barrier()?;
    Ok(next)
}

/// Collects every interior on `root`, in global layout. Other ranks get `None`.
pub fn gather<T, C>(block: &DynamicBlock, comm: &C, field: &LocalField<T>, root: usize) -> Result<Option<ArrayD<T>>>
where
    T: Element,
    C: Communicator,
{
    let me = local_tile(block, comm)?;
    check_field(me, field, block.version())?;
    let interior = field.pack(me.region())?;

    if comm.rank() != root {
        comm.exchange(TAG_GATHER, vec![Message::new(root, interior)], &[])?;
        return Ok(None);
    }

    let counts = block.counts_vect();
    let displs = block.displs_vect();
    let mut linear = vec![T::default(); block.total_area()];
    linear[displs[root]..displs[root] + counts[root]].copy_from_slice(&interior);

    let peers: Vec<usize> = (0..comm.size()).filter(|&p| p != root).collect();
    for msg in comm.exchange::<T>(TAG_GATHER, Vec::new(), &peers)? {
        if msg.payload.len() != counts[msg.peer] {
            return Err(Error::MalformedTransfer {
                peer: msg.peer,
                detail: format!("{} cells gathered, tile holds {}", msg.payload.len(), counts[msg.peer]),
            });
        }
        linear[displs[msg.peer]..displs[msg.peer] + counts[msg.peer]].copy_from_slice(&msg.payload);
    }
    block.assemble(&linear).map(Some)
}

/// Hands each rank its interior of `global`, which only `root` needs to
/// supply. Ghosts are left defaulted.
pub fn scatter<T, C>(block: &DynamicBlock, comm: &C, global: Option<&ArrayD<T>>, root: usize) -> Result<LocalField<T>>
where
    T: Element,
    C: Communicator,
{
    let me = local_tile(block, comm)?;
    let mut field = LocalField::new(me);

    if comm.rank() == root {
        let global = global.ok_or_else(|| Error::MalformedTransfer {
            peer: root,
            detail: "no global array on the scattering rank".to_owned(),
        })?;
        let linear = block.linearize(global)?;
        let counts = block.counts_vect();
        let displs = block.displs_vect();
        let outgoing = (0..comm.size())
            .filter(|&p| p != root)
            .map(|p| Message::new(p, linear[displs[p]..displs[p] + counts[p]].to_vec()))
            .collect();
        comm.exchange(TAG_GATHER, outgoing, &[])?;
        field.unpack(me.region(), &linear[displs[root]..displs[root] + counts[root]])?;
    } else {
        let transfer = Transfer { peer: root, regions: vec![me.region().clone()] };
        let mut received = comm.exchange::<T>(TAG_GATHER, Vec::new(), &[root])?;
        let msg = received.pop().ok_or_else(|| Error::PeerUnavailable {
            rank: root,
            reason: "no scatter payload".to_owned(),
        })?;
        unpack_transfer(&mut field, &transfer, msg)?;
    }
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::block::Stencil;
    use crate::geometry::Connectivity;
    use crate::strategy::AssignmentStrategy;
    use crate::topology::Topology;

    fn quad(connectivity: Connectivity) -> DynamicBlock {
        let topology = Arc::new(Topology::build(4, &[2, 2]).unwrap());
        DynamicBlock::build(topology, &[8, 8], Stencil::new(1, connectivity), AssignmentStrategy::Uniform).unwrap()
    }

    #[test]
    fn face_plan() {
        let block = quad(Connectivity::Faces);
        let plan = HaloPlan::new(&block, 0);
        let peers: Vec<usize> = plan.recvs().iter().map(|t| t.peer).collect();
        assert_eq!(peers, vec![1, 2]);
        assert_eq!(plan.recvs()[0].regions, vec![Region::new(vec![0, 4], vec![4, 1])]);
        assert_eq!(plan.sends()[0].regions, vec![Region::new(vec![0, 3], vec![4, 1])]);
        assert_eq!(plan.recvs()[1].regions, vec![Region::new(vec![4, 0], vec![1, 4])]);
        assert_eq!(plan.volume(), 8);
    }

    #[test]
    fn corner_plan() {
        let block = quad(Connectivity::Full);
        let plan = HaloPlan::new(&block, 0);
        let peers: Vec<usize> = plan.recvs().iter().map(|t| t.peer).collect();
        assert_eq!(peers, vec![1, 2, 3]);
        assert_eq!(plan.recvs()[2].regions, vec![Region::new(vec![4, 4], vec![1, 1])]);
        assert_eq!(plan.volume(), 9);
    }

    /// 8x8, halo 2, with the lower cut one cell right of the upper one
    fn wide_skewed(connectivity: Connectivity) -> DynamicBlock {
        let topology = Arc::new(Topology::build(4, &[2, 2]).unwrap());
        let block = DynamicBlock::build(topology, &[8, 8], Stencil::new(2, connectivity), AssignmentStrategy::Uniform).unwrap();
        block.successor(vec![
            Region::new(vec![0, 0], vec![4, 4]),
            Region::new(vec![0, 4], vec![4, 4]),
            Region::new(vec![4, 0], vec![4, 5]),
            Region::new(vec![4, 5], vec![4, 3]),
        ]).unwrap()
    }

    fn assert_mirrored(block: &DynamicBlock) {
        for rank in 0..block.size() {
            let plan = HaloPlan::new(block, rank);
            assert!(plan.is_complete(), "rank {} reads {} ghosts, receives {}", rank, plan.ghosts(), plan.volume());
            for send in plan.sends() {
                let theirs = HaloPlan::new(block, send.peer);
                let recv = theirs.recvs().iter().find(|t| t.peer == rank).unwrap();
                assert_eq!(recv.regions, send.regions);
            }
        }
    }

    #[test]
    fn plans_are_mirror_images() {
        assert_mirrored(&quad(Connectivity::Full));
        assert_mirrored(&quad(Connectivity::Faces));
        assert_mirrored(&wide_skewed(Connectivity::Full));
        assert_mirrored(&wide_skewed(Connectivity::Faces));
    }

    #[test]
    fn wide_corner_reaches_a_tile_it_does_not_touch() {
        let block = wide_skewed(Connectivity::Full);
        let plan = HaloPlan::new(&block, 0);
        let peers: Vec<usize> = plan.recvs().iter().map(|t| t.peer).collect();
        assert_eq!(peers, vec![1, 2, 3]);
        assert_eq!(plan.recvs()[1].regions, vec![
            Region::new(vec![4, 0], vec![2, 4]),
            Region::new(vec![4, 4], vec![2, 1]),
        ]);
        assert_eq!(plan.recvs()[2].regions, vec![Region::new(vec![4, 5], vec![2, 1])]);
        assert_eq!(plan.ghosts(), 20);
        assert!(plan.is_complete());

        let theirs = HaloPlan::new(&block, 3);
        assert!(theirs.sends().iter().any(|t| t.peer == 0));

        // without corners rank 0 never reads from rank 3
        let faces = HaloPlan::new(&wide_skewed(Connectivity::Faces), 0);
        assert!(faces.recvs().iter().all(|t| t.peer != 3));
        assert!(faces.is_complete());
    }
}
