//! The owning simulation loop: steps, halo refresh, and the
//! STABLE -> REBALANCING -> REDISTRIBUTING -> STABLE cycle

use std::fmt;
use std::sync::Arc;

use ndarray::ArrayD;
use tracing::{error, info, warn};

use crate::balance::{LoadBalancer, Proposal};
use crate::block::DynamicBlock;
use crate::comm::{Communicator, Element};
use crate::error::{Error, Result};
use crate::field::LocalField;
use crate::halo::{self, HaloPlan};
use crate::perf::PerfMeasure;
use crate::tile::TileMsg;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Stable,
    Rebalancing,
    Redistributing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Phase::Stable => write!(f, "stable"),
            Phase::Rebalancing => write!(f, "rebalancing"),
            Phase::Redistributing => write!(f, "redistributing"),
        }
    }
}

/// Checks that every rank derived the same tile set for `block`.
/// Must be called on all ranks.
pub fn verify_agreement<C: Communicator>(comm: &C, block: &DynamicBlock) -> Result<()> {
    let mine = block.tile(comm.rank()).map(|t| t.to_msg()).unwrap_or_default();
    let gathered: Vec<TileMsg> = comm.all_gather(mine)?;
    for (rank, (theirs, tile)) in gathered.iter().zip(block.tiles()).enumerate() {
        if *theirs != tile.to_msg() {
            error!(rank = comm.rank(), peer = rank, version = block.version(), "partition disagreement");
            return Err(Error::Disagreement { version: block.version(), rank });
        }
    }
    Ok(())
}

/// One rank's view of a running simulation.
///
/// Holds the current partition as a shared, versioned value. A rebalance
/// swaps in a new block; the old one is kept alive until the
/// redistribution that reads from it has finished.
pub struct Simulation<'c, C: Communicator, T: Element> {
    comm: &'c C,
    current: Arc<DynamicBlock>,
    retired: Option<Arc<DynamicBlock>>,
    plan: HaloPlan,
    field: LocalField<T>,
    balancer: LoadBalancer,
    perf: PerfMeasure,
    phase: Phase,
    steps: usize,
    rebalances: usize,
}

impl<'c, C: Communicator, T: Element> Simulation<'c, C, T> {
    /// Fills the interior from `init` and performs the first halo exchange.
    /// Must be called on all ranks.
    pub fn new<F>(comm: &'c C, block: Arc<DynamicBlock>, balancer: LoadBalancer, init: F) -> Result<Self>
    where
        F: Fn(&[usize]) -> T,
    {
        if comm.size() != block.size() {
            return Err(Error::InvalidShape { participants: comm.size(), shape: block.topology().shape().to_vec() });
        }
        let tile = block.tile(comm.rank()).ok_or_else(|| Error::InvalidShape {
            participants: comm.size(),
            shape: block.topology().shape().to_vec(),
        })?;
        let field = LocalField::from_fn(tile, init);
        let plan = HaloPlan::new(&block, comm.rank());
        let perf = PerfMeasure::new(balancer.policy().interval);

        let mut sim = Simulation {
            comm,
            current: block,
            retired: None,
            plan,
            field,
            balancer,
            perf,
            phase: Phase::Stable,
            steps: 0,
            rebalances: 0,
        };
        halo::exchange_planned(&sim.plan, &sim.current, sim.comm, &mut sim.field)?;
        Ok(sim)
    }

    pub fn block(&self) -> &Arc<DynamicBlock> {
        &self.current
    }

    pub fn field(&self) -> &LocalField<T> {
        &self.field
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn rebalances(&self) -> usize {
        self.rebalances
    }

    pub fn perf(&self) -> &PerfMeasure {
        &self.perf
    }

    /// Runs `compute` on the local field, refreshes the halo, and at the end
    /// of each measurement period checks the load. Returns whether the
    /// partition changed. Must be called on all ranks.
    pub fn step<F>(&mut self, compute: F) -> Result<bool>
    where
        F: FnOnce(&mut LocalField<T>),
    {
        self.perf.iter_start();
        compute(&mut self.field);
        self.perf.iter_stop();

        halo::exchange_planned(&self.plan, &self.current, self.comm, &mut self.field)?;
        self.steps += 1;

        if self.perf.period_elapsed() {
            let metric = self.perf.average().unwrap_or(0.0);
            self.perf.reset();
            return self.rebalance(metric);
        }
        Ok(false)
    }

    /// Gathers `local_metric` from every rank and, if the balancer asks for
    /// it, replaces the partition and moves the data. A proposal that
    /// breaks the partition invariant leaves the old block in place.
    /// Must be called on all ranks.
    pub fn rebalance(&mut self, local_metric: f64) -> Result<bool> {
        let metrics = self.comm.all_gather(local_metric)?;
        if !self.balancer.should_rebalance(&metrics, &self.current, self.steps) {
            return Ok(false);
        }

        self.perf.balance_start();
        self.phase = Phase::Rebalancing;
        let next = match self.balancer.propose(&metrics, &self.current) {
            Ok(Proposal::Replace(next)) => next,
            Ok(Proposal::Keep) => {
                self.phase = Phase::Stable;
                self.perf.balance_stop();
                return Ok(false);
            },
            Err(e) if !e.is_fatal() => {
                warn!(version = self.current.version(), "keeping partition: {}", e);
                self.phase = Phase::Stable;
                self.perf.balance_stop();
                return Ok(false);
            },
            Err(e) => {
                self.phase = Phase::Stable;
                return Err(e);
            },
        };
        verify_agreement(self.comm, &next)?;

        self.phase = Phase::Redistributing;
        let next = Arc::new(next);
        // block and field only change together
        let field = halo::redistribute(&self.current, &next, self.comm, &self.field)?;
        self.retired = Some(std::mem::replace(&mut self.current, Arc::clone(&next)));
        self.field = field;
        self.plan = HaloPlan::new(&next, self.comm.rank());
        halo::exchange_planned(&self.plan, &self.current, self.comm, &mut self.field)?;
        self.retired = None;

        self.phase = Phase::Stable;
        self.rebalances += 1;
        self.perf.balance_stop();
        if self.comm.rank() == 0 {
            info!(version = next.version(), step = self.steps, "partition replaced\n{}", next);
        }
        Ok(true)
    }

    /// Whole field on `root`. Must be called on all ranks.
    pub fn gather(&self, root: usize) -> Result<Option<ArrayD<T>>> {
        halo::gather(&self.current, self.comm, &self.field, root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::balance::BalancePolicy;
    use crate::block::Stencil;
    use crate::comm::{run_local, run_local_with_timeout};
    use crate::geometry::{Connectivity, Region};
    use crate::strategy::AssignmentStrategy;
    use crate::topology::Topology;

    fn stripes() -> DynamicBlock {
        let topology = Arc::new(Topology::build(2, &[2]).unwrap());
        DynamicBlock::build(topology, &[8], Stencil::new(1, Connectivity::Faces), AssignmentStrategy::Uniform).unwrap()
    }

    #[test]
    fn identical_blocks_agree() {
        let results = run_local(2, |comm| verify_agreement(&comm, &stripes()).is_ok());
        assert_eq!(results, vec![true, true]);
    }

    #[test]
    fn divergent_blocks_are_fatal() {
        let results = run_local(2, |comm| {
            let block = stripes();
            let block = if comm.rank() == 0 {
                block.successor(vec![Region::new(vec![0], vec![5]), Region::new(vec![5], vec![3])]).unwrap()
            } else {
                block
            };
            verify_agreement(&comm, &block).err()
        });
        for r in results {
            assert!(matches!(r, Some(Error::Disagreement { .. })));
        }
    }

    #[test]
    fn failed_redistribution_keeps_the_old_block() {
        let metrics = [1.0, 10.0];
        run_local_with_timeout(2, Duration::from_millis(200), |comm| {
            let block = Arc::new(stripes());
            let balancer = LoadBalancer::new(BalancePolicy::default());
            let mut sim = Simulation::new(&comm, Arc::clone(&block), balancer.clone(), |_| 1.0f64).unwrap();
            if comm.rank() == 0 {
                let err = sim.rebalance(metrics[0]).unwrap_err();
                assert!(matches!(err, Error::PeerUnavailable { .. }));
                assert_eq!(sim.block().version(), 0);
                assert_eq!(sim.field().tile().region(), sim.block().tile(0).unwrap().region());
            } else {
                // joins the load and agreement collectives, then leaves
                comm.all_gather(metrics[1]).unwrap();
                let next = balancer.get_partition(&metrics, &block);
                assert_eq!(next.version(), 1);
                verify_agreement(&comm, &next).unwrap();
            }
        });
    }
}
