use std::collections::VecDeque;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::id_set::IdSet;
use crate::packets::{ConnectionId, Packet, PacketId};
use crate::stream_io::PacketWriter;

/// Client-side liveness classification of one connection, driving connection-count
///  adaptation: a connection is `Busy` while it has unacknowledged packets, and
///  becomes `Slow` when it stays busy beyond the busy timeout.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Liveness {
    Idle,
    Busy,
    Slow,
}

/// Protocol state of one connection inside a session.
///
/// A record outlives its stream: after the stream is lost, the record is kept as long
///  as it still has undelivered inbound ids or unacknowledged outbound packets, so a
///  retransmission arriving via another connection can be de-duplicated against it.
pub(crate) struct Connection {
    pub id: ConnectionId,

    /// write queue of the attached stream; `None` while the connection is disconnected
    pub writer: Option<Arc<dyn PacketWriter>>,
    pub reader_task: Option<JoinHandle<()>>,

    /// `Data` packets sent on this connection (monotone)
    pub num_data_sent: u64,
    /// `Data` packets acknowledged by the peer (monotone, never above `num_data_sent`)
    pub num_acknowledge_received_for_data: u64,
    /// `Data` packets received on this connection (monotone); the low 32 bits are the
    ///  packet id of the next inbound data packet
    pub num_data_received: u64,

    /// which inbound packet ids were already delivered upstream
    pub receive_id_set: IdSet,

    /// once set, the peer will send no further packets addressed to this connection
    pub finish_id_received: Option<PacketId>,
    /// a local `Finish` is recorded for this connection (written or pending redelivery)
    pub is_finish_sent: bool,
    pub is_shut_down: bool,

    /// packets written but not yet acknowledged, in send order; retransmission draws
    ///  from here when the stream dies
    pub unconfirmed_packets: VecDeque<Packet>,

    pub liveness: Liveness,
    pub busy_timer: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(id: ConnectionId) -> Connection {
        Connection {
            id,
            writer: None,
            reader_task: None,
            num_data_sent: 0,
            num_acknowledge_received_for_data: 0,
            num_data_received: 0,
            receive_id_set: IdSet::new(),
            finish_id_received: None,
            is_finish_sent: false,
            is_shut_down: false,
            unconfirmed_packets: VecDeque::new(),
            liveness: Liveness::Idle,
            busy_timer: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some() && !self.is_shut_down
    }

    /// open and still accepting new outbound packets
    pub fn is_schedulable(&self) -> bool {
        self.is_open() && !self.is_finish_sent
    }

    /// id under which the next inbound `Data` packet is delivered
    pub fn next_receive_packet_id(&mut self) -> PacketId {
        let id = PacketId::from_raw(self.num_data_received as u32);
        self.num_data_received += 1;
        id
    }

    /// the packet id the peer will use for a `Finish` received right now
    pub fn current_receive_packet_id(&self) -> PacketId {
        PacketId::from_raw(self.num_data_received as u32)
    }

    /// Process one `Acknowledge`: it confirms the oldest unconfirmed packet on this
    ///  connection. Returns the confirmed packet, or `None` if nothing was outstanding
    ///  (a stray ack, tolerated).
    pub fn acknowledge_head(&mut self) -> Option<Packet> {
        let confirmed = self.unconfirmed_packets.pop_front()?;
        if matches!(confirmed, Packet::Data { .. }) {
            self.num_acknowledge_received_for_data += 1;
        }
        Some(confirmed)
    }

    /// Rewrite the unconfirmed queue as retransmission-flavored packets for redelivery
    ///  via other connections. `Data` packets get consecutive ids starting at the
    ///  acknowledged count (that is where the peer's receive counter stands); packets
    ///  that are already retransmissions keep their original addressing.
    pub fn unconfirmed_as_retransmissions(&self) -> Vec<Packet> {
        let mut position = PacketId::from_raw(self.num_acknowledge_received_for_data as u32);

        self.unconfirmed_packets.iter()
            .map(|packet| match packet {
                Packet::Data { buffers } => {
                    let packet_id = position;
                    position = position.wrapping_next();
                    Packet::RetransmissionData {
                        connection_id: self.id,
                        packet_id,
                        buffers: buffers.clone(),
                    }
                }
                Packet::Finish => Packet::RetransmissionFinish {
                    connection_id: self.id,
                    packet_id: position,
                },
                retransmission @ (Packet::RetransmissionData { .. } | Packet::RetransmissionFinish { .. }) => {
                    retransmission.clone()
                }
                other => {
                    panic!("this is a bug: {:?} must not be in the unconfirmed queue", other);
                }
            })
            .collect()
    }

    /// A connection record can be dropped once both directions are finished and fully
    ///  drained: local finish recorded, remote finish received, every inbound id below
    ///  the finish delivered, and nothing left unacknowledged.
    pub fn can_be_removed(&self) -> bool {
        self.is_finish_sent
            && self.finish_id_received
                .is_some_and(|finish_id| self.receive_id_set.all_received_below(finish_id))
            && self.unconfirmed_packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;

    fn data(payload: &[u8]) -> Packet {
        Packet::Data { buffers: vec![Bytes::copy_from_slice(payload)] }
    }

    #[test]
    fn test_acknowledge_head_confirms_in_send_order() {
        let mut conn = Connection::new(ConnectionId::from_raw(1));
        conn.unconfirmed_packets.push_back(data(b"a"));
        conn.unconfirmed_packets.push_back(Packet::Finish);
        conn.num_data_sent = 1;

        assert_eq!(conn.acknowledge_head(), Some(data(b"a")));
        assert_eq!(conn.num_acknowledge_received_for_data, 1);

        assert_eq!(conn.acknowledge_head(), Some(Packet::Finish));
        assert_eq!(conn.num_acknowledge_received_for_data, 1);

        assert_eq!(conn.acknowledge_head(), None);
    }

    #[test]
    fn test_retransmission_rewrite_numbers_data_from_the_acknowledged_count() {
        let mut conn = Connection::new(ConnectionId::from_raw(3));
        conn.num_data_sent = 5;
        conn.num_acknowledge_received_for_data = 3;
        conn.unconfirmed_packets.push_back(data(b"x"));
        conn.unconfirmed_packets.push_back(data(b"y"));
        conn.unconfirmed_packets.push_back(Packet::Finish);

        let rewritten = conn.unconfirmed_as_retransmissions();
        assert_eq!(rewritten, vec![
            Packet::RetransmissionData {
                connection_id: ConnectionId::from_raw(3),
                packet_id: PacketId::from_raw(3),
                buffers: vec![Bytes::from_static(b"x")],
            },
            Packet::RetransmissionData {
                connection_id: ConnectionId::from_raw(3),
                packet_id: PacketId::from_raw(4),
                buffers: vec![Bytes::from_static(b"y")],
            },
            Packet::RetransmissionFinish {
                connection_id: ConnectionId::from_raw(3),
                packet_id: PacketId::from_raw(5),
            },
        ]);
    }

    #[test]
    fn test_retransmission_rewrite_keeps_foreign_addressing() {
        let foreign = Packet::RetransmissionData {
            connection_id: ConnectionId::from_raw(9),
            packet_id: PacketId::from_raw(2),
            buffers: vec![Bytes::from_static(b"z")],
        };

        let mut conn = Connection::new(ConnectionId::from_raw(4));
        conn.unconfirmed_packets.push_back(foreign.clone());
        conn.unconfirmed_packets.push_back(data(b"own"));

        let rewritten = conn.unconfirmed_as_retransmissions();
        assert_eq!(rewritten[0], foreign);
        assert_eq!(rewritten[1], Packet::RetransmissionData {
            connection_id: ConnectionId::from_raw(4),
            packet_id: PacketId::ZERO,
            buffers: vec![Bytes::from_static(b"own")],
        });
    }

    #[test]
    fn test_retransmission_rewrite_wraps_packet_ids() {
        let mut conn = Connection::new(ConnectionId::from_raw(1));
        conn.num_acknowledge_received_for_data = 0xffff_ffff;
        conn.unconfirmed_packets.push_back(data(b"a"));
        conn.unconfirmed_packets.push_back(data(b"b"));

        let rewritten = conn.unconfirmed_as_retransmissions();
        match (&rewritten[0], &rewritten[1]) {
            (
                Packet::RetransmissionData { packet_id: first, .. },
                Packet::RetransmissionData { packet_id: second, .. },
            ) => {
                assert_eq!(*first, PacketId::from_raw(0xffff_ffff));
                assert_eq!(*second, PacketId::ZERO);
            }
            other => panic!("unexpected rewrite: {:?}", other),
        }
    }

    #[rstest]
    #[case::fresh(false, None, false, false)]
    #[case::only_finish_sent(true, None, false, false)]
    #[case::only_finish_received(false, Some(0), false, false)]
    #[case::both_finished_drained(true, Some(0), false, true)]
    #[case::both_finished_but_unconfirmed(true, Some(0), true, false)]
    fn test_can_be_removed(
        #[case] is_finish_sent: bool,
        #[case] finish_id_received: Option<u32>,
        #[case] has_unconfirmed: bool,
        #[case] expected: bool,
    ) {
        let mut conn = Connection::new(ConnectionId::from_raw(1));
        conn.is_finish_sent = is_finish_sent;
        conn.finish_id_received = finish_id_received.map(PacketId::from_raw);
        if has_unconfirmed {
            conn.unconfirmed_packets.push_back(data(b"pending"));
        }

        assert_eq!(conn.can_be_removed(), expected);
    }

    #[test]
    fn test_removal_requires_all_inbound_ids_delivered() {
        let mut conn = Connection::new(ConnectionId::from_raw(1));
        conn.is_finish_sent = true;

        // two data packets received, then the finish
        let first_id = conn.next_receive_packet_id();
        conn.receive_id_set.add(first_id);
        let _skipped = conn.next_receive_packet_id();
        conn.finish_id_received = Some(conn.current_receive_packet_id());

        // packet id 1 was counted but never delivered (it is still in flight on
        //  another connection), so the record must stay
        assert!(!conn.can_be_removed());

        conn.receive_id_set.add(PacketId::from_raw(1));
        assert!(conn.can_be_removed());
    }
}
