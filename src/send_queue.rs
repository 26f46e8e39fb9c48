use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rustc_hash::FxHashMap;

use crate::error::SessionViolation;
use crate::packets::{ConnectionId, Packet};

/// Bucket key for the sending rotation.
///
/// `AllConfirmed` holds the connections with an empty unconfirmed queue and always
///  orders first - an idle connection is the best candidate for the next send. The
///  remaining buckets order by pick stamp, oldest first, so the head of the rotation is
///  the connection that has waited longest since it was last picked.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) enum RotationKey {
    AllConfirmed,
    LastPicked(u64),
}

/// Fair round-robin over the connections that are eligible for sending.
///
/// Membership contract: a connection is in the rotation iff it has a live stream, is
///  not shut down, and has not had a local `Finish` recorded (no new packets may be
///  scheduled onto a finishing connection). Moving a connection after a send is
///  O(log n).
pub(crate) struct SendRotation {
    buckets: BTreeMap<RotationKey, BTreeSet<ConnectionId>>,
    positions: FxHashMap<ConnectionId, RotationKey>,
}

impl SendRotation {
    pub fn new() -> SendRotation {
        SendRotation {
            buckets: BTreeMap::new(),
            positions: FxHashMap::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.positions.contains_key(&connection_id)
    }

    pub fn key_of(&self, connection_id: ConnectionId) -> Option<RotationKey> {
        self.positions.get(&connection_id).copied()
    }

    /// insert or reposition
    pub fn insert(&mut self, connection_id: ConnectionId, key: RotationKey) {
        self.remove(connection_id);
        self.buckets.entry(key).or_default().insert(connection_id);
        self.positions.insert(connection_id, key);
    }

    pub fn remove(&mut self, connection_id: ConnectionId) -> bool {
        if let Some(key) = self.positions.remove(&connection_id) {
            if let Some(bucket) = self.buckets.get_mut(&key) {
                bucket.remove(&connection_id);
                if bucket.is_empty() {
                    self.buckets.remove(&key);
                }
            }
            true
        }
        else {
            false
        }
    }

    /// the least-recently-used sender (all-confirmed connections first)
    pub fn head(&self) -> Option<ConnectionId> {
        self.buckets.values()
            .next()
            .and_then(|bucket| bucket.iter().next())
            .copied()
    }
}

/// Where outgoing packets go: while at least one connection is usable, the rotation
///  schedules them; while none is, they are buffered up to `max_offline_packets`.
pub(crate) enum SendingQueue {
    Offline(VecDeque<Packet>),
    Online(SendRotation),
}

impl SendingQueue {
    pub fn new() -> SendingQueue {
        SendingQueue::Offline(VecDeque::new())
    }

    pub fn is_online(&self) -> bool {
        matches!(self, SendingQueue::Online(_))
    }

    /// buffer a packet while no connection is attached; overflow is a session-level
    ///  violation (the caller interrupts the session)
    pub fn push_offline(&mut self, packet: Packet, max_offline_packets: usize) -> Result<(), SessionViolation> {
        match self {
            SendingQueue::Offline(buffered) => {
                if buffered.len() >= max_offline_packets {
                    return Err(SessionViolation::OfflineBufferOverflow { max: max_offline_packets });
                }
                buffered.push_back(packet);
                Ok(())
            }
            SendingQueue::Online(_) => {
                panic!("this is a bug: offline buffering while connections are attached");
            }
        }
    }
}
