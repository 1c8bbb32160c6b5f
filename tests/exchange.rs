use std::sync::Arc;

use ndarray::{ArrayD, Dimension, IxDyn};

use dlb::balance::{BalancePolicy, LoadBalancer};
use dlb::comm::run_local;
use dlb::halo;
use dlb::stepper;
use dlb::{
    AssignmentStrategy, Communicator, Connectivity, DynamicBlock, Error, HaloPlan, LocalField, Phase, Region, Simulation,
    Stencil, Tile, Topology,
};

fn value(g: &[usize]) -> f64 {
    (g.iter().fold(0, |acc, &x| acc * 100 + x) + 1) as f64
}

fn quad(connectivity: Connectivity) -> DynamicBlock {
    let topology = Arc::new(Topology::build(4, &[2, 2]).unwrap());
    DynamicBlock::build(topology, &[8, 8], Stencil::new(1, connectivity), AssignmentStrategy::Uniform).unwrap()
}

/// Lower row of tiles with its vertical cut moved one cell to the right
fn skewed(block: &DynamicBlock) -> DynamicBlock {
    block.successor(vec![
        Region::new(vec![0, 0], vec![4, 4]),
        Region::new(vec![0, 4], vec![4, 4]),
        Region::new(vec![4, 0], vec![4, 5]),
        Region::new(vec![4, 5], vec![4, 3]),
    ]).unwrap()
}

/// Uniform layout with ghost layers two cells deep
fn wide(shape: &[usize], domain: &[usize], connectivity: Connectivity) -> Arc<DynamicBlock> {
    let topology = Arc::new(Topology::build(shape.iter().product(), shape).unwrap());
    Arc::new(DynamicBlock::build(topology, domain, Stencil::new(2, connectivity), AssignmentStrategy::Uniform).unwrap())
}

/// Slows each of `slow` in turn, so that runs of tiles along the last
/// axis end up cut at different places. Returns every block on the way.
fn rebalanced(block: &Arc<DynamicBlock>, slow: &[usize]) -> Vec<Arc<DynamicBlock>> {
    let balancer = LoadBalancer::new(BalancePolicy { axis: Some(block.ndim() - 1), ..BalancePolicy::default() });
    let mut blocks = vec![Arc::clone(block)];
    for &s in slow {
        let last = Arc::clone(&blocks[blocks.len() - 1]);
        let metrics: Vec<f64> = (0..last.size()).map(|r| if r == s { 4.0 } else { 1.0 }).collect();
        let next = balancer.get_partition(&metrics, &last);
        assert_eq!(next.version(), last.version() + 1);
        blocks.push(next);
    }
    blocks
}

fn stripes(ranks: usize, width: usize) -> DynamicBlock {
    let topology = Arc::new(Topology::build(ranks, &[1, ranks]).unwrap());
    DynamicBlock::build(topology, &[8, width], Stencil::new(1, Connectivity::Faces), AssignmentStrategy::Striped { axis: 1 }).unwrap()
}

/// Every interior and face ghost cell holds the global value; corner
/// ghosts do too with full connectivity, and stay zero otherwise.
fn check_ghosts(field: &LocalField<f64>, connectivity: Connectivity) {
    let tile: &Tile = field.tile();
    tile.ext_region().for_each_cell(|g| {
        let outside = (0..g.len())
            .filter(|&a| g[a] < tile.origin()[a] || g[a] >= tile.origin()[a] + tile.extent()[a])
            .count();
        let expected = if outside <= 1 || connectivity == Connectivity::Full { value(g) } else { 0.0 };
        assert_eq!(field.get(g), Some(expected), "rank {} cell {:?}", tile.rank(), g);
    });
}

#[test]
fn face_ghosts_are_filled() {
    run_local(4, |comm| {
        let block = quad(Connectivity::Faces);
        let mut field = LocalField::from_fn(block.tile(comm.rank()).unwrap(), value);
        halo::exchange(&block, &comm, &mut field).unwrap();
        check_ghosts(&field, Connectivity::Faces);
    });
}

#[test]
fn corner_ghosts_are_filled() {
    run_local(4, |comm| {
        let block = quad(Connectivity::Full);
        let mut field = LocalField::from_fn(block.tile(comm.rank()).unwrap(), value);
        halo::exchange(&block, &comm, &mut field).unwrap();
        check_ghosts(&field, Connectivity::Full);
    });
}

#[test]
fn misaligned_tiles_exchange() {
    for connectivity in [Connectivity::Faces, Connectivity::Full] {
        run_local(4, |comm| {
            let block = skewed(&quad(connectivity));
            let mut field = LocalField::from_fn(block.tile(comm.rank()).unwrap(), value);
            halo::exchange(&block, &comm, &mut field).unwrap();
            check_ghosts(&field, connectivity);
        });
    }
}

#[test]
fn wide_halo_after_shifted_cut() {
    for connectivity in [Connectivity::Faces, Connectivity::Full] {
        let block = skewed(&wide(&[2, 2], &[8, 8], connectivity));
        run_local(4, |comm| {
            let mut field = LocalField::from_fn(block.tile(comm.rank()).unwrap(), value);
            halo::exchange(&block, &comm, &mut field).unwrap();
            check_ghosts(&field, connectivity);
        });
    }
}

#[test]
fn wide_halo_after_rebalance() {
    for connectivity in [Connectivity::Faces, Connectivity::Full] {
        let blocks = rebalanced(&wide(&[2, 2], &[8, 8], connectivity), &[0]);
        let block = &blocks[1];
        // upper and lower rows are now cut at different columns
        assert_ne!(block.tile(0).unwrap().extent()[1], block.tile(2).unwrap().extent()[1]);

        run_local(4, |comm| {
            let mut field = LocalField::from_fn(block.tile(comm.rank()).unwrap(), value);
            halo::exchange(block, &comm, &mut field).unwrap();
            check_ghosts(&field, connectivity);
        });
    }
}

#[test]
fn wide_halo_in_three_dimensions() {
    for connectivity in [Connectivity::Faces, Connectivity::Full] {
        let blocks = rebalanced(&wide(&[2, 2, 2], &[8, 8, 12], connectivity), &[0, 6]);
        let last = &blocks[2];
        assert_ne!(last.tile(0).unwrap().extent()[2], last.tile(2).unwrap().extent()[2]);
        for rank in 0..8 {
            assert!(HaloPlan::new(last, rank).is_complete());
        }

        run_local(8, |comm| {
            let mut field = LocalField::from_fn(blocks[0].tile(comm.rank()).unwrap(), value);
            for pair in blocks.windows(2) {
                field = halo::redistribute(&pair[0], &pair[1], &comm, &field).unwrap();
            }
            halo::exchange(last, &comm, &mut field).unwrap();
            check_ghosts(&field, connectivity);
        });
    }
}

#[test]
fn redistribution_keeps_every_cell() {
    run_local(4, |comm| {
        let old = quad(Connectivity::Full);
        let new = skewed(&old);
        let field = LocalField::from_fn(old.tile(comm.rank()).unwrap(), value);

        let mut moved = halo::redistribute(&old, &new, &comm, &field).unwrap();
        assert_eq!(moved.tile().region(), new.tile(comm.rank()).unwrap().region());
        halo::exchange(&new, &comm, &mut moved).unwrap();
        check_ghosts(&moved, Connectivity::Full);
    });
}

#[test]
fn scatter_then_gather() {
    let results = run_local(4, |comm| {
        let block = skewed(&quad(Connectivity::Faces));
        let global = ArrayD::from_shape_fn(IxDyn(&[8, 8]), |idx| value(idx.slice()));
        let supplied = if comm.rank() == 2 { Some(&global) } else { None };

        let field = halo::scatter(&block, &comm, supplied, 2).unwrap();
        let tile = block.tile(comm.rank()).unwrap();
        tile.region().for_each_cell(|g| assert_eq!(field.get(g), Some(value(g))));

        let back = halo::gather(&block, &comm, &field, 2).unwrap();
        (back, global)
    });
    for (rank, (back, global)) in results.into_iter().enumerate() {
        if rank == 2 {
            assert_eq!(back, Some(global));
        } else {
            assert_eq!(back, None);
        }
    }
}

#[test]
fn displacement_tables() {
    let block = skewed(&quad(Connectivity::Faces));
    assert_eq!(block.counts_vect(), vec![16, 16, 20, 12]);
    assert_eq!(block.displs_vect(), &[0, 16, 32, 52]);
    assert_eq!(block.displs_arr(), vec![0, 16, 32, 52]);
    assert_eq!(block.gid_by_coords(&[4, 4]), Some(2));
    assert_eq!(block.gid_by_coords(&[4, 5]), Some(3));
    assert_eq!(block.gid_by_coords(&[8, 0]), None);
}

#[test]
fn rebalance_moves_boundaries_and_data() {
    let results = run_local(4, |comm| {
        let balancer = LoadBalancer::new(BalancePolicy { threshold: 2.0, ..BalancePolicy::default() });
        let mut sim = Simulation::new(&comm, Arc::new(stripes(4, 64)), balancer, value).unwrap();
        let metric = [10.0, 10.0, 10.0, 100.0][comm.rank()];

        assert!(sim.rebalance(metric).unwrap());
        assert_eq!(sim.phase(), Phase::Stable);
        assert_eq!(sim.rebalances(), 1);
        check_ghosts(sim.field(), Connectivity::Faces);

        // equal loads leave the partition alone
        assert!(!sim.rebalance(1.0).unwrap());
        assert_eq!(sim.block().version(), 1);

        sim.block().tiles().iter().map(|t| t.extent()[1]).collect::<Vec<_>>()
    });
    for widths in results {
        assert_eq!(widths, vec![17, 17, 18, 12]);
    }
}

#[test]
fn distributed_steps_match_a_single_rank() {
    let domain = [16, 16];
    let steps = 5;

    let whole = Tile::new(0, Region::from_shape(&domain), 1, &domain);
    let mut serial = LocalField::from_fn(&whole, stepper::hot_spot(&domain));
    for _ in 0..steps {
        stepper::diffuse(&mut serial, 0.2);
    }

    let results = run_local(4, |comm| {
        let topology = Arc::new(Topology::build(4, &[2, 2]).unwrap());
        let block = DynamicBlock::build(topology, &domain, Stencil::new(1, Connectivity::Faces), AssignmentStrategy::Uniform).unwrap();
        let balancer = LoadBalancer::new(BalancePolicy { enabled: false, ..BalancePolicy::default() });
        let mut sim = Simulation::new(&comm, Arc::new(block), balancer, stepper::hot_spot(&domain)).unwrap();
        for _ in 0..steps {
            assert!(!sim.step(|f| stepper::diffuse(f, 0.2)).unwrap());
        }
        assert_eq!(sim.steps(), steps);
        sim.gather(0).unwrap()
    });

    let gathered = results.into_iter().next().flatten().unwrap();
    let expected = serial.interior().to_owned();
    for (a, b) in gathered.iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1e-12);
    }
    assert!((gathered.sum() - 16.0).abs() < 1e-9);
}

#[test]
fn tiny_domain_is_unpartitionable() {
    let topology = Arc::new(Topology::build(4, &[2, 2]).unwrap());
    let result = DynamicBlock::build(topology, &[1, 1], Stencil::new(2, Connectivity::Faces), AssignmentStrategy::Uniform);
    assert!(matches!(result, Err(Error::UnpartitionableDomain { .. })));
}

#[test]
fn wrong_world_size_is_refused() {
    run_local(2, |comm| {
        let block = quad(Connectivity::Faces);
        let mut field = LocalField::<f64>::new(block.tile(0).unwrap());
        assert!(matches!(halo::exchange(&block, &comm, &mut field), Err(Error::InvalidShape { .. })));
    });
}
