//! Dynamic load balancing for distributed-memory grid simulations.
//!
//! A global N-dimensional domain is split into one rectangular [`Tile`] per
//! rank. Each rank advances its tile, refreshes ghost layers from its
//! neighbours, and reports how long a step took. From those timings the
//! [`LoadBalancer`] proposes new tile boundaries, and the data is moved so
//! that every cell stays owned by exactly one rank.
//!
//! Ranks talk through the [`Communicator`] trait: in-process threads by
//! default ([`LocalComm`]), or MPI processes with the `mpi` feature.

pub mod balance;
pub mod block;
pub mod comm;
pub mod driver;
pub mod error;
pub mod field;
pub mod geometry;
pub mod halo;
pub mod perf;
pub mod setup;
pub mod stepper;
pub mod strategy;
pub mod tile;
pub mod topology;

pub use balance::{BalancePolicy, LoadBalancer, Proposal, Trigger};
pub use block::{DynamicBlock, Migration, Stencil};
pub use comm::{run_local, Communicator, Element, LocalComm};
#[cfg(feature = "mpi")]
pub use comm::MpiComm;
pub use driver::{Phase, Simulation};
pub use error::{Error, Result};
pub use field::LocalField;
pub use geometry::{Connectivity, Direction, Region, MAX_DIMS};
pub use halo::HaloPlan;
pub use perf::PerfMeasure;
pub use strategy::AssignmentStrategy;
pub use tile::{Tile, TileMsg};
pub use topology::Topology;
