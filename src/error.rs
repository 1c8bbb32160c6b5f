//! Failure classes of decomposition, balancing and exchange

use thiserror::Error;

use crate::setup::InputError;

#[derive(Error, Debug)]
pub enum Error {
    /// Topology shape and participant count are inconsistent
    #[error("topology shape {shape:?} cannot hold {participants} participants")]
    InvalidShape { participants: usize, shape: Vec<usize> },

    /// Global domain too small to give every rank at least a halo width of cells
    #[error("domain {domain:?} cannot be split among {participants} ranks with halo width {halo}: {reason}")]
    UnpartitionableDomain { domain: Vec<usize>, participants: usize, halo: usize, reason: String },

    /// Strategy parameters do not fit the topology
    #[error("invalid assignment strategy: {0}")]
    InvalidStrategy(String),

    /// Proposed tiles leave a gap, overlap, or leave the domain.
    /// Recoverable: the previous partition stays in force.
    #[error("partition invariant violated: {0}")]
    PartitionInvariant(String),

    #[error("rank {rank} unavailable: {reason}")]
    PeerUnavailable { rank: usize, reason: String },

    #[error("malformed transfer from rank {peer}: {detail}")]
    MalformedTransfer { peer: usize, detail: String },

    /// Ranks computed different tile sets for the same partition version
    #[error("ranks disagree on partition version {version}: tile of rank {rank} differs")]
    Disagreement { version: u64, rank: usize },

    #[error("configuration error: {0}")]
    Config(#[from] InputError),
}

impl Error {
    /// Whether the run must stop. Only a rejected partition proposal
    /// is survivable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::PartitionInvariant(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invariant_failures_are_recoverable() {
        assert!(!Error::PartitionInvariant("gap".to_owned()).is_fatal());
        assert!(Error::PeerUnavailable { rank: 2, reason: "timeout".to_owned() }.is_fatal());
        assert!(Error::Disagreement { version: 3, rank: 1 }.is_fatal());
        assert!(Error::InvalidShape { participants: 3, shape: vec![2, 2] }.is_fatal());
    }

    #[test]
    fn messages_name_the_offending_values() {
        let e = Error::UnpartitionableDomain {
            domain: vec![1, 1],
            participants: 4,
            halo: 2,
            reason: "extent 0 along axis 0".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("[1, 1]"));
        assert!(msg.contains("4 ranks"));
    }
}
