//! Ranks as MPI processes

use mpi::request::scope;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use super::{Communicator, Element, Message, Tag};
use crate::error::Result;

/// Wraps the world communicator. MPI aborts the job on transport
/// failure, so errors from here only concern local bookkeeping.
pub struct MpiComm {
    world: SimpleCommunicator,
}

impl MpiComm {
    pub fn new(world: SimpleCommunicator) -> Self {
        MpiComm { world }
    }

    pub fn world(&self) -> &SimpleCommunicator {
        &self.world
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn processor_name(&self) -> String {
        mpi::environment::processor_name().unwrap_or_else(|_| "unknown".to_owned())
    }

    fn exchange<T: Element>(&self, tag: Tag, outgoing: Vec<Message<T>>, incoming: &[usize]) -> Result<Vec<Message<T>>> {
        let mut received = Vec::with_capacity(incoming.len());
        scope(|scope| {
            let requests: Vec<_> = outgoing
                .iter()
                .map(|msg| {
                    self.world
                        .process_at_rank(msg.peer as i32)
                        .immediate_send_with_tag(scope, &msg.payload[..], tag)
                })
                .collect();

            for &peer in incoming {
                let (payload, _status) = self.world.process_at_rank(peer as i32).receive_vec_with_tag::<T>(tag);
                received.push(Message { peer, payload });
            }

            for request in requests {
                request.wait();
            }
        });
        Ok(received)
    }

    fn all_gather<T: Element>(&self, value: T) -> Result<Vec<T>> {
        let mut out = vec![T::default(); self.size()];
        self.world.all_gather_into(&value, &mut out[..]);
        Ok(out)
    }

    fn barrier(&self) -> Result<()> {
        self.world.barrier();
        Ok(())
    }
}
