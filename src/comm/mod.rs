//! Message passing between ranks

use std::fmt;

use crate::error::Result;

mod local;
pub use local::{run_local, run_local_with_timeout, LocalComm};

#[cfg(feature = "mpi")]
mod mpi_backend;
#[cfg(feature = "mpi")]
pub use mpi_backend::MpiComm;

pub type Tag = i32;

/// Ghost layer refresh after a step
pub const TAG_HALO: Tag = 11;
/// Ownership transfer after a rebalance
pub const TAG_MIGRATE: Tag = 12;
/// Whole-field gather and scatter through the root
pub const TAG_GATHER: Tag = 13;
/// Reserved for `all_gather` and `barrier`
pub const TAG_COLLECTIVE: Tag = 14;

/// Plain-old-data that can be shipped between ranks
#[cfg(not(feature = "mpi"))]
pub trait Element: Copy + Default + Send + Sync + fmt::Debug + 'static {}

#[cfg(not(feature = "mpi"))]
impl<T> Element for T where T: Copy + Default + Send + Sync + fmt::Debug + 'static {}

/// Plain-old-data that can be shipped between ranks
#[cfg(feature = "mpi")]
pub trait Element: Copy + Default + Send + Sync + fmt::Debug + 'static + mpi::datatype::Equivalence {}

#[cfg(feature = "mpi")]
impl<T> Element for T where T: Copy + Default + Send + Sync + fmt::Debug + 'static + mpi::datatype::Equivalence {}

/// Payload addressed to, or received from, one peer
#[derive(Clone, Debug, PartialEq)]
pub struct Message<T> {
    pub peer: usize,
    pub payload: Vec<T>,
}

impl<T> Message<T> {
    pub fn new(peer: usize, payload: Vec<T>) -> Self {
        Message { peer, payload }
    }
}

/// The operations decomposition and balancing need from the transport.
///
/// Every method is collective in the sense that all ranks taking part must
/// call it with matching arguments, in the same order.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Name of the machine this rank runs on
    fn processor_name(&self) -> String;

    /// Sends every outgoing message, then waits for one message with `tag`
    /// from each rank in `incoming`. Received messages come back in the
    /// order of `incoming`.
    ///
    /// No receive is awaited before all sends are posted, so symmetric
    /// neighbour exchanges cannot deadlock.
    fn exchange<T: Element>(&self, tag: Tag, outgoing: Vec<Message<T>>, incoming: &[usize]) -> Result<Vec<Message<T>>>;

    /// Every rank's `value`, indexed by rank
    fn all_gather<T: Element>(&self, value: T) -> Result<Vec<T>>;

    fn barrier(&self) -> Result<()>;
}
