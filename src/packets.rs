use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::error::CodecError;
use crate::safe_converter::SafeCast;

/// Opaque identifier of a session. Two ids are the same session iff their byte content
///  is equal - servers key their session table by value.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct SessionId([u8; Self::NUM_BYTES]);

impl SessionId {
    pub const NUM_BYTES: usize = 16;

    /// mint a fresh random id (client side)
    pub fn mint() -> SessionId {
        SessionId(Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; Self::NUM_BYTES]) -> SessionId {
        SessionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::NUM_BYTES] {
        &self.0
    }
}
impl Debug for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Session-unique id of one underlying stream. Ids are minted by the client in strictly
///  increasing order; the id space is not reused within a session.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ConnectionId(u32);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl ConnectionId {
    pub const ZERO: ConnectionId = ConnectionId(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Option<ConnectionId> {
        self.0.checked_add(1).map(ConnectionId)
    }
}

/// Position of a data packet in one connection's stream of `Data` packets. Ids wrap
///  around the full 32-bit space, so all arithmetic and comparisons are modular.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct PacketId(u32);

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl PacketId {
    pub const ZERO: PacketId = PacketId(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn wrapping_next(&self) -> PacketId {
        PacketId(self.0.wrapping_add(1))
    }

    pub fn wrapping_add(&self, n: u32) -> PacketId {
        PacketId(self.0.wrapping_add(n))
    }

    /// offset of `self` above `base` in modular id space
    pub fn wrapping_offset_from(&self, base: PacketId) -> u32 {
        self.0.wrapping_sub(base.0)
    }
}

/// The 1-byte wire discriminator at the start of every frame after the handshake.
#[derive(Clone, Copy, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum PacketTag {
    HeartBeat = 0,
    Data = 1,
    Acknowledge = 2,
    Finish = 3,
    RetransmissionData = 4,
    RetransmissionFinish = 5,
    ShutDown = 6,
}

/// One frame on the wire (after the per-stream `ConnectionHead` handshake).
///
/// A message consists of one or more buffers; the buffers travel together in a single
///  `Data` frame and are delivered together. `RetransmissionData` / `RetransmissionFinish`
///  carry the (connection id, packet id) coordinates of the original send so the receiver
///  can de-duplicate across connections.
#[derive(Clone, PartialEq, Eq)]
pub enum Packet {
    HeartBeat,
    Data {
        buffers: Vec<Bytes>,
    },
    Acknowledge,
    Finish,
    RetransmissionData {
        connection_id: ConnectionId,
        packet_id: PacketId,
        buffers: Vec<Bytes>,
    },
    RetransmissionFinish {
        connection_id: ConnectionId,
        packet_id: PacketId,
    },
    ShutDown,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Packet::HeartBeat => write!(f, "HeartBeat"),
            Packet::Data { buffers } => {
                write!(f, "Data[{} buffers, {} bytes]", buffers.len(), buffers.iter().map(|b| b.len()).sum::<usize>())
            }
            Packet::Acknowledge => write!(f, "Acknowledge"),
            Packet::Finish => write!(f, "Finish"),
            Packet::RetransmissionData { connection_id, packet_id, buffers } => {
                write!(f, "RetransmissionData[conn {}, packet {}, {} buffers, {} bytes]",
                    connection_id, packet_id, buffers.len(), buffers.iter().map(|b| b.len()).sum::<usize>())
            }
            Packet::RetransmissionFinish { connection_id, packet_id } => {
                write!(f, "RetransmissionFinish[conn {}, packet {}]", connection_id, packet_id)
            }
            Packet::ShutDown => write!(f, "ShutDown"),
        }
    }
}

impl Packet {
    /// true iff the receiver must answer this frame with exactly one `Acknowledge`
    pub fn is_acknowledge_required(&self) -> bool {
        matches!(
            self,
            Packet::Data { .. }
                | Packet::Finish
                | Packet::RetransmissionData { .. }
                | Packet::RetransmissionFinish { .. }
        )
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Packet::HeartBeat => buf.put_u8(PacketTag::HeartBeat.into()),
            Packet::Data { buffers } => {
                buf.put_u8(PacketTag::Data.into());
                Self::ser_buffers(buffers, buf);
            }
            Packet::Acknowledge => buf.put_u8(PacketTag::Acknowledge.into()),
            Packet::Finish => buf.put_u8(PacketTag::Finish.into()),
            Packet::RetransmissionData { connection_id, packet_id, buffers } => {
                buf.put_u8(PacketTag::RetransmissionData.into());
                buf.put_u32_varint(connection_id.to_raw());
                buf.put_u32_varint(packet_id.to_raw());
                Self::ser_buffers(buffers, buf);
            }
            Packet::RetransmissionFinish { connection_id, packet_id } => {
                buf.put_u8(PacketTag::RetransmissionFinish.into());
                buf.put_u32_varint(connection_id.to_raw());
                buf.put_u32_varint(packet_id.to_raw());
            }
            Packet::ShutDown => buf.put_u8(PacketTag::ShutDown.into()),
        }
    }

    fn ser_buffers(buffers: &[Bytes], buf: &mut BytesMut) {
        buf.put_usize_varint(buffers.len());
        for b in buffers {
            buf.put_usize_varint(b.len());
            buf.put_slice(b);
        }
    }

    /// Decode one frame from the start of `buf`, consuming exactly the frame's bytes.
    ///  Fails with `Truncated` if the buffer ends before the frame does - the caller is
    ///  expected to read more bytes and retry from the same position.
    pub fn deser(buf: &mut impl Buf, max_data_size: u32) -> Result<Packet, CodecError> {
        let head_byte = take_u8(buf)?;
        let tag = PacketTag::try_from(head_byte)
            .map_err(|_| CodecError::UnknownHeadByte(head_byte))?;

        match tag {
            PacketTag::HeartBeat => Ok(Packet::HeartBeat),
            PacketTag::Data => Ok(Packet::Data {
                buffers: Self::deser_buffers(buf, max_data_size)?,
            }),
            PacketTag::Acknowledge => Ok(Packet::Acknowledge),
            PacketTag::Finish => Ok(Packet::Finish),
            PacketTag::RetransmissionData => {
                let connection_id = ConnectionId::from_raw(buf.try_get_u32_varint().map_err(CodecError::from)?);
                let packet_id = PacketId::from_raw(buf.try_get_u32_varint().map_err(CodecError::from)?);
                Ok(Packet::RetransmissionData {
                    connection_id,
                    packet_id,
                    buffers: Self::deser_buffers(buf, max_data_size)?,
                })
            }
            PacketTag::RetransmissionFinish => {
                let connection_id = ConnectionId::from_raw(buf.try_get_u32_varint().map_err(CodecError::from)?);
                let packet_id = PacketId::from_raw(buf.try_get_u32_varint().map_err(CodecError::from)?);
                Ok(Packet::RetransmissionFinish { connection_id, packet_id })
            }
            PacketTag::ShutDown => Ok(Packet::ShutDown),
        }
    }

    fn deser_buffers(buf: &mut impl Buf, max_data_size: u32) -> Result<Vec<Bytes>, CodecError> {
        let num_buffers = buf.try_get_u32_varint().map_err(CodecError::from)?;

        // each buffer costs at least its length byte on the wire, so a count above the
        //  payload bound cannot be legitimate and must not drive allocation
        if num_buffers > max_data_size {
            return Err(CodecError::DataTooBig { declared: num_buffers.safe_cast(), max: max_data_size });
        }

        let mut total_len: u64 = 0;
        let mut buffers = Vec::with_capacity(num_buffers as usize);
        for _ in 0..num_buffers {
            let len = buf.try_get_u32_varint().map_err(CodecError::from)?;
            total_len += <u32 as SafeCast<u64>>::safe_cast(len);
            if total_len > max_data_size.safe_cast() {
                return Err(CodecError::DataTooBig { declared: total_len, max: max_data_size });
            }
            if buf.remaining() < len.safe_cast() {
                return Err(CodecError::Truncated);
            }
            buffers.push(buf.copy_to_bytes(len.safe_cast()));
        }
        Ok(buffers)
    }
}

fn take_u8(buf: &mut impl Buf) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u8())
}

/// The first frame on every new stream: `[16 bytes session id][1 byte is_renew][varint connection id]`.
///
/// `is_renew = true` instructs the receiving session to discard all existing connections
///  and counters (full restart) before installing the new stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionHead {
    pub session_id: SessionId,
    pub is_renew: bool,
    pub connection_id: ConnectionId,
}

impl ConnectionHead {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(self.session_id.as_bytes());
        buf.put_u8(if self.is_renew { 1 } else { 0 });
        buf.put_u32_varint(self.connection_id.to_raw());
    }

    pub fn deser(buf: &mut impl Buf) -> Result<ConnectionHead, CodecError> {
        if buf.remaining() < SessionId::NUM_BYTES {
            return Err(CodecError::Truncated);
        }
        let mut id_bytes = [0u8; SessionId::NUM_BYTES];
        buf.copy_to_slice(&mut id_bytes);

        let is_renew = match take_u8(buf)? {
            0 => false,
            1 => true,
            other => return Err(CodecError::UnknownHeadByte(other)),
        };
        let connection_id = ConnectionId::from_raw(buf.try_get_u32_varint().map_err(CodecError::from)?);

        Ok(ConnectionHead {
            session_id: SessionId::from_bytes(id_bytes),
            is_renew,
            connection_id,
        })
    }
}
