use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dlb::balance::{imbalance, LoadBalancer};
use dlb::comm::Communicator;
use dlb::block::DynamicBlock;
use dlb::driver::Simulation;
use dlb::setup::{ettc, Imbalance, InputError, PrettyDuration, RunConfig};
use dlb::stepper;
use dlb::topology::{host_identity, Topology};

/// Multiplies the time a rank spends computing, so that the balancer
/// has something to correct
struct Slowdown {
    factor: f64,
    jitter: f64,
    rng: Xoshiro256PlusPlus,
}

impl Slowdown {
    fn for_rank(imbalance: &Option<Imbalance>, rank: usize) -> Option<Self> {
        let imb = imbalance.as_ref()?;
        if !imb.ranks.contains(&rank) {
            return None;
        }
        Some(Slowdown {
            factor: imb.factor,
            jitter: imb.jitter,
            rng: Xoshiro256PlusPlus::seed_from_u64(imb.seed.wrapping_add(rank as u64)),
        })
    }

    fn delay(&mut self, elapsed: Duration) -> Duration {
        let z: f64 = self.rng.sample(StandardNormal);
        let factor = (self.factor * (1.0 + self.jitter * z)).max(1.0);
        elapsed.mul_f64(factor - 1.0)
    }
}

fn run<C: Communicator>(comm: &C, cfg: &RunConfig) -> dlb::Result<()> {
    let id = comm.rank();
    let hosts = comm.all_gather(host_identity(&comm.processor_name()))?;

    let topology = Topology::build(comm.size(), &cfg.topology_shape_for(comm.size()))?.with_hosts(hosts)?;
    let block = DynamicBlock::build(Arc::new(topology), &cfg.domain, cfg.stencil, cfg.strategy.clone())?;
    if id == 0 {
        info!(strategy = %cfg.strategy, "initial partition\n{}", block);
    }

    let balancer = LoadBalancer::new(cfg.policy.clone());
    let mut sim = Simulation::new(comm, Arc::new(block), balancer, stepper::hot_spot(&cfg.domain))?;
    let mut slowdown = Slowdown::for_rank(&cfg.imbalance, id);

    if id == 0 {
        println!("Running on {} ranks with {} threads per rank...", comm.size(), rayon::current_num_threads());
    }

    let runtime = Instant::now();
    for i in 1..=cfg.steps {
        let alpha = cfg.alpha;
        let slow = &mut slowdown;
        sim.step(|field| {
            let start = Instant::now();
            stepper::diffuse(field, alpha);
            if let Some(slow) = slow {
                std::thread::sleep(slow.delay(start.elapsed()));
            }
        })?;

        if i % cfg.output_every == 0 || i == cfg.steps {
            let total: f64 = comm.all_gather(sim.field().interior_sum())?.iter().sum();
            let mean = total / sim.block().total_area() as f64;
            let last = comm.all_gather(sim.perf().last().as_secs_f64())?;
            if id == 0 {
                println!(
                    "Step {: >6} of {}, mean = {:.6e}, imbalance = {:.3}, version = {}, ETTC = {}...",
                    i, cfg.steps, mean, imbalance(&last), sim.block().version(),
                    PrettyDuration::from(ettc(runtime, i, cfg.steps)),
                );
            }
        }
    }

    let field = sim.gather(0)?;
    if let Some(field) = field {
        let peak = field.iter().cloned().fold(f64::MIN, f64::max);
        println!(
            "Finished {} steps in {}: {} rebalances, final version {}, peak value {:.6}",
            sim.steps(), PrettyDuration::from(runtime.elapsed()), sim.rebalances(), sim.block().version(), peak,
        );
        info!("final partition\n{}", sim.block());
    }
    info!(
        rank = id,
        compute = ?sim.perf().iter_total(),
        balancing = ?sim.perf().balance_total(),
        "time spent"
    );
    Ok(())
}

#[cfg(feature = "mpi")]
fn launch(cfg: &RunConfig) -> Result<(), Box<dyn Error>> {
    use mpi::traits::Communicator as _;

    let universe = mpi::initialize().ok_or("unable to initialize MPI")?;
    let comm = dlb::MpiComm::new(universe.world());
    if let Err(e) = run(&comm, cfg) {
        error!(rank = comm.rank(), "{}", e);
        comm.world().abort(1);
    }
    Ok(())
}

#[cfg(not(feature = "mpi"))]
fn launch(cfg: &RunConfig) -> Result<(), Box<dyn Error>> {
    let results = dlb::run_local(cfg.ranks, |comm| {
        let rank = comm.rank();
        run(&comm, cfg).map_err(|e| {
            error!(rank, "{}", e);
            e
        })
    });
    for result in results {
        result?;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    // Prepare configuration file

    let args: Vec<String> = std::env::args().collect();
    let path = args
        .get(1)
        .ok_or(dlb::Error::Config(InputError::InvalidInputFile("no file supplied")))?;
    let path = PathBuf::from(path);

    let cfg = RunConfig::load(&path)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    launch(&cfg)
}
