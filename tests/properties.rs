use std::sync::Arc;

use proptest::prelude::*;

use dlb::balance::{shift_cuts, BalancePolicy, LoadBalancer};
use dlb::{AssignmentStrategy, Connectivity, DynamicBlock, Stencil, Topology};

fn strategy_for(pick: usize, ndim: usize, ranks: usize) -> AssignmentStrategy {
    match pick % 4 {
        0 => AssignmentStrategy::Uniform,
        1 => AssignmentStrategy::Striped { axis: ranks % ndim },
        2 => AssignmentStrategy::Bisection,
        _ => AssignmentStrategy::Weighted { weights: (0..ranks).map(|r| 1.0 + (r % 3) as f64).collect() },
    }
}

fn topology_shape(strategy: &AssignmentStrategy, ranks: usize, ndim: usize) -> Vec<usize> {
    match strategy {
        AssignmentStrategy::Striped { axis } => {
            let mut shape = vec![1; ndim];
            shape[*axis] = ranks;
            shape
        },
        _ => Topology::balanced_shape(ranks, ndim),
    }
}

proptest! {
    #[test]
    fn coordinates_round_trip(shape in prop::collection::vec(1usize..5, 1..=3)) {
        let n: usize = shape.iter().product();
        let topology = Topology::build(n, &shape).unwrap();
        for rank in 0..n {
            let coords = topology.coordinates_of(rank).unwrap();
            prop_assert_eq!(topology.rank_at(&coords), Some(rank));
        }
        prop_assert_eq!(topology.coordinates_of(n), None);
    }

    #[test]
    fn topology_builds_iff_shape_fits(shape in prop::collection::vec(1usize..5, 1..=3), participants in 1usize..70) {
        let fits = shape.iter().product::<usize>() == participants;
        prop_assert_eq!(Topology::build(participants, &shape).is_ok(), fits);
    }

    #[test]
    fn every_cell_has_one_owner(
        domain in prop::collection::vec(4usize..20, 1..=3),
        ranks in 1usize..9,
        pick in 0usize..4,
        halo in 0usize..2,
    ) {
        let ndim = domain.len();
        let strategy = strategy_for(pick, ndim, ranks);
        let shape = topology_shape(&strategy, ranks, ndim);
        let topology = Arc::new(Topology::build(ranks, &shape).unwrap());

        match DynamicBlock::build(topology, &domain, Stencil::new(halo, Connectivity::Faces), strategy) {
            Ok(block) => {
                prop_assert_eq!(block.total_area(), domain.iter().product::<usize>());
                let counts = block.counts_vect();
                let displs = block.displs_vect();
                for r in 1..ranks {
                    prop_assert_eq!(displs[r], displs[r - 1] + counts[r - 1]);
                }
                for (t, &c) in block.tiles().iter().zip(counts.iter()) {
                    prop_assert_eq!(t.area(), c);
                }
                for t in block.tiles() {
                    let mut owned = true;
                    t.region().for_each_cell(|g| owned &= block.gid_by_coords(g) == Some(t.rank()));
                    prop_assert!(owned);
                }
            },
            Err(e) => prop_assert!(e.is_fatal()),
        }
    }

    #[test]
    fn cut_moves_stay_bounded(
        extents in prop::collection::vec(2usize..40, 2..8),
        loads in prop::collection::vec(0.1f64..10.0, 8),
        fraction in 0.05f64..1.0,
    ) {
        let speeds: Vec<f64> = extents.iter().zip(loads.iter()).map(|(&e, l)| e as f64 / l).collect();
        let out = shift_cuts(&extents, &speeds, fraction, 1);

        prop_assert_eq!(out.len(), extents.len());
        prop_assert_eq!(out.iter().sum::<usize>(), extents.iter().sum::<usize>());
        prop_assert!(out.iter().all(|&e| e >= 1));

        let mut before = 0;
        let mut after = 0;
        for i in 0..extents.len() - 1 {
            before += extents[i];
            after += out[i];
            let bound = fraction * extents[i].min(extents[i + 1]) as f64;
            prop_assert!((after as f64 - before as f64).abs() <= bound + 1e-9);
        }
    }

    #[test]
    fn balanced_loads_keep_the_block(ranks in 2usize..7, width in 16usize..64, load in 0.5f64..5.0) {
        let topology = Arc::new(Topology::build(ranks, &[1, ranks]).unwrap());
        let block = Arc::new(DynamicBlock::build(
            topology,
            &[4, width],
            Stencil::new(1, Connectivity::Faces),
            AssignmentStrategy::Striped { axis: 1 },
        ).unwrap());
        // loads proportional to area, so every rank is equally fast
        let metrics: Vec<f64> = block.tiles().iter().map(|t| load * t.area() as f64).collect();
        let balancer = LoadBalancer::new(BalancePolicy::default());
        let next = balancer.get_partition(&metrics, &block);
        prop_assert!(Arc::ptr_eq(&next, &block));
    }

    #[test]
    fn proposals_are_valid_partitions(ranks in 2usize..7, width in 16usize..64, slow in 0usize..7, factor in 1.5f64..20.0) {
        let topology = Arc::new(Topology::build(ranks, &[1, ranks]).unwrap());
        let block = Arc::new(DynamicBlock::build(
            topology,
            &[4, width],
            Stencil::new(1, Connectivity::Faces),
            AssignmentStrategy::Striped { axis: 1 },
        ).unwrap());
        let metrics: Vec<f64> = (0..ranks).map(|r| if r == slow % ranks { factor } else { 1.0 }).collect();
        let policy = BalancePolicy::default();
        let fraction = policy.max_displacement;
        let next = LoadBalancer::new(policy).get_partition(&metrics, &block);

        prop_assert!(next.version() == block.version() || next.version() == block.version() + 1);
        prop_assert_eq!(next.total_area(), block.total_area());
        for (old, new) in block.tiles().iter().zip(next.tiles()) {
            prop_assert!(new.extent()[1] >= 1);
            let moved = (new.origin()[1] as f64 - old.origin()[1] as f64).abs();
            prop_assert!(moved <= fraction * old.extent()[1] as f64 + 1e-9);
        }
        prop_assert!(next.tiles()[slow % ranks].area() <= block.tiles()[slow % ranks].area());
    }

    #[test]
    fn identical_metrics_give_identical_partitions(ranks in 2usize..7, width in 16usize..64, slow in 0usize..7, factor in 1.5f64..20.0) {
        let topology = Arc::new(Topology::build(ranks, &[1, ranks]).unwrap());
        let block = Arc::new(DynamicBlock::build(
            topology,
            &[4, width],
            Stencil::new(1, Connectivity::Faces),
            AssignmentStrategy::Striped { axis: 1 },
        ).unwrap());
        let metrics: Vec<f64> = (0..ranks).map(|r| if r == slow % ranks { factor } else { 1.0 }).collect();
        let balancer = LoadBalancer::new(BalancePolicy::default());

        let first = balancer.get_partition(&metrics, &block);
        let second = balancer.get_partition(&metrics, &block);
        prop_assert!(first.same_tiles(&second));
        prop_assert_eq!(first.version(), second.version());
    }
}
