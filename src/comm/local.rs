//! In-process ranks: one thread each, talking over channels

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::trace;

use super::{Communicator, Element, Message, Tag, TAG_COLLECTIVE};
use crate::error::{Error, Result};

struct Envelope {
    source: usize,
    tag: Tag,
    payload: Box<dyn Any + Send>,
}

/// One rank of an in-process world.
///
/// Messages from the same source with the same tag arrive in the order
/// they were sent; anything received while waiting for a different
/// (source, tag) pair is parked until asked for.
pub struct LocalComm {
    rank: usize,
    outboxes: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    parked: RefCell<VecDeque<Envelope>>,
    timeout: Duration,
}

impl LocalComm {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// A fully connected world of `size` ranks
    pub fn world(size: usize) -> Vec<LocalComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalComm {
                rank,
                outboxes: senders.clone(),
                inbox,
                parked: RefCell::new(VecDeque::new()),
                timeout: LocalComm::DEFAULT_TIMEOUT,
            })
            .collect()
    }

    /// How long a receive waits before the peer is declared lost
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn post<T: Element>(&self, peer: usize, tag: Tag, payload: Vec<T>) -> Result<()> {
        let outbox = self.outboxes.get(peer).ok_or_else(|| Error::PeerUnavailable {
            rank: peer,
            reason: format!("no such rank in a world of {}", self.outboxes.len()),
        })?;
        trace!(from = self.rank, to = peer, tag, len = payload.len(), "post");
        outbox
            .send(Envelope { source: self.rank, tag, payload: Box::new(payload) })
            .map_err(|_| Error::PeerUnavailable { rank: peer, reason: "rank has exited".to_owned() })
    }

    fn take<T: Element>(&self, peer: usize, tag: Tag) -> Result<Vec<T>> {
        let parked = {
            let mut parked = self.parked.borrow_mut();
            parked
                .iter()
                .position(|e| e.source == peer && e.tag == tag)
                .and_then(|i| parked.remove(i))
        };
        let envelope = match parked {
            Some(e) => e,
            None => self.wait_for(peer, tag)?,
        };
        envelope
            .payload
            .downcast::<Vec<T>>()
            .map(|b| *b)
            .map_err(|_| Error::MalformedTransfer {
                peer,
                detail: format!("payload with tag {} is not a sequence of {}", tag, std::any::type_name::<T>()),
            })
    }

    fn wait_for(&self, peer: usize, tag: Tag) -> Result<Envelope> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.inbox.recv_deadline(deadline) {
                Ok(e) if e.source == peer && e.tag == tag => return Ok(e),
                Ok(e) => self.parked.borrow_mut().push_back(e),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::PeerUnavailable {
                        rank: peer,
                        reason: format!("nothing with tag {} after {:?}", tag, self.timeout),
                    })
                },
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::PeerUnavailable { rank: peer, reason: "channel closed".to_owned() })
                },
            }
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.outboxes.len()
    }

    fn processor_name(&self) -> String {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned())
    }

    fn exchange<T: Element>(&self, tag: Tag, outgoing: Vec<Message<T>>, incoming: &[usize]) -> Result<Vec<Message<T>>> {
        for msg in outgoing {
            self.post(msg.peer, tag, msg.payload)?;
        }
        incoming
            .iter()
            .map(|&peer| self.take(peer, tag).map(|payload| Message { peer, payload }))
            .collect()
    }

    fn all_gather<T: Element>(&self, value: T) -> Result<Vec<T>> {
        for peer in (0..self.size()).filter(|&p| p != self.rank) {
            self.post(peer, TAG_COLLECTIVE, vec![value])?;
        }
        let mut out = Vec::with_capacity(self.size());
        for peer in 0..self.size() {
            if peer == self.rank {
                out.push(value);
                continue;
            }
            let got: Vec<T> = self.take(peer, TAG_COLLECTIVE)?;
            match got.as_slice() {
                [v] => out.push(*v),
                _ => {
                    return Err(Error::MalformedTransfer {
                        peer,
                        detail: format!("expected one value in all-gather, got {}", got.len()),
                    })
                },
            }
        }
        Ok(out)
    }

    fn barrier(&self) -> Result<()> {
        self.all_gather(0u8).map(|_| ())
    }
}

/// Runs `f` once per rank on its own thread and returns the results in
/// rank order. A panic on any rank is re-raised here.
pub fn run_local<R, F>(size: usize, f: F) -> Vec<R>
where
    F: Fn(LocalComm) -> R + Sync,
    R: Send,
{
    run_local_with_timeout(size, LocalComm::DEFAULT_TIMEOUT, f)
}

pub fn run_local_with_timeout<R, F>(size: usize, timeout: Duration, f: F) -> Vec<R>
where
    F: Fn(LocalComm) -> R + Sync,
    R: Send,
{
    let comms = LocalComm::world(size);
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| s.spawn(move || f(comm.with_timeout(timeout))))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_exchange() {
        let results = run_local(3, |comm| {
            let right = (comm.rank() + 1) % comm.size();
            let left = (comm.rank() + comm.size() - 1) % comm.size();
            let out = vec![Message::new(right, vec![comm.rank() as u32; 2])];
            comm.exchange(7, out, &[left]).unwrap()
        });
        assert_eq!(results[0], vec![Message::new(2, vec![2, 2])]);
        assert_eq!(results[1], vec![Message::new(0, vec![0, 0])]);
    }

    #[test]
    fn out_of_order_arrivals_are_parked() {
        let results = run_local(2, |comm| {
            if comm.rank() == 0 {
                comm.exchange(1, vec![Message::new(1, vec![1.0f64])], &[]).unwrap();
                comm.exchange(2, vec![Message::new(1, vec![2.0f64])], &[]).unwrap();
                Vec::new()
            } else {
                let second = comm.exchange::<f64>(2, Vec::new(), &[0]).unwrap();
                let first = comm.exchange::<f64>(1, Vec::new(), &[0]).unwrap();
                vec![first[0].payload[0], second[0].payload[0]]
            }
        });
        assert_eq!(results[1], vec![1.0, 2.0]);
    }

    #[test]
    fn gather_and_barrier() {
        let results = run_local(4, |comm| {
            comm.barrier().unwrap();
            comm.all_gather(10 * comm.rank() as u64).unwrap()
        });
        for r in results {
            assert_eq!(r, vec![0, 10, 20, 30]);
        }
    }

    #[test]
    fn silent_peer_times_out() {
        let results = run_local_with_timeout(2, Duration::from_millis(50), |comm| {
            if comm.rank() == 1 {
                comm.exchange::<u8>(3, Vec::new(), &[0]).err()
            } else {
                None
            }
        });
        assert!(matches!(results[1], Some(Error::PeerUnavailable { rank: 0, .. })));
    }

    #[test]
    fn wrong_payload_type_is_malformed() {
        let results = run_local(2, |comm| {
            if comm.rank() == 0 {
                comm.exchange(4, vec![Message::new(1, vec![1u8])], &[]).unwrap();
                None
            } else {
                comm.exchange::<f64>(4, Vec::new(), &[0]).err()
            }
        });
        assert!(matches!(results[1], Some(Error::MalformedTransfer { peer: 0, .. })));
    }

    #[test]
    fn unknown_peer() {
        let comm = LocalComm::world(1).pop().unwrap();
        let err = comm.exchange(1, vec![Message::new(5, vec![0u8])], &[]);
        assert!(matches!(err, Err(Error::PeerUnavailable { rank: 5, .. })));
    }
}
