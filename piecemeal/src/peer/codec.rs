use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{bitfield::BitField, PeerId, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The length of the handshake: 1 byte protocol string length prefix, the
/// protocol string, 8 reserved bytes, the info hash and the peer id.
pub(crate) const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// The largest message we accept: a block message with the largest block we
/// would ever serve or request, with room for its header.
const MAX_MSG_LEN: usize = 1024 * 1024 + 13;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, which must equal "BitTorrent protocol", as
    /// otherwise the connetion is aborted.
    pub prot: [u8; 19],
    /// A reserved field, currently all zeros. This is where the client's
    /// supported extensions are announced.
    pub reserved: [u8; 8],
    /// The torrent's SHA1 info hash, used to identify the torrent in the
    /// handshake and to verify the peer.
    pub info_hash: Sha1Hash,
    /// The arbitrary peer id, usually used to identify the torrent client.
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;

        buf.reserve(HANDSHAKE_LEN);
        // protocol length prefix
        buf.put_u8(prot.len() as u8);
        // we should only be sending the bittorrent protocol string
        debug_assert_eq!(prot, PROTOCOL_STRING.as_bytes());
        // payload
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at the length prefix without consuming it, so that nothing is
        // consumed until the whole handshake is in the buffer
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Handshake must have the string \"BitTorrent protocol\"",
            ));
        }

        // check that we got the full payload in the buffer
        if buf.len() < HANDSHAKE_LEN {
            buf.reserve(HANDSHAKE_LEN - buf.len());
            return Ok(None);
        }
        if &buf[1..1 + prot_len] != PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Handshake must have the string \"BitTorrent protocol\"",
            ));
        }
        buf.advance(1);

        // protocol string
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        // reserved field
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        // info hash
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        // peer id
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match k {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Block),
            8 => Ok(Cancel),
            9 => Ok(Port),
            k => Err(k),
        }
    }
}

impl MessageId {
    /// Returns whether a message of this type may have the given length,
    /// which includes the id byte.
    fn is_valid_len(self, msg_len: usize) -> bool {
        use MessageId::*;
        match self {
            Choke | Unchoke | Interested | NotInterested => msg_len == 1,
            Have => msg_len == 1 + 4,
            Bitfield => msg_len >= 1,
            Request | Cancel => msg_len == 1 + 4 + 4 + 4,
            Block => msg_len > 1 + 4 + 4,
            Port => msg_len == 1 + 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Bitfield(BitField),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: u32,
    },
    Request {
        piece_index: u32,
        offset: u32,
        length: u32,
    },
    Block {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel {
        piece_index: u32,
        offset: u32,
        length: u32,
    },
    Port(u16),
}

impl Message {
    /// Returns the message's id, or `None` for keep alive messages which don't
    /// have one.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Request { .. } => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel { .. } => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
        }
    }

    /// Returns the length of the message's payload, including the id but not
    /// the length prefix.
    fn len(&self) -> usize {
        match self {
            Self::KeepAlive => 0,
            Self::Bitfield(bitfield) => 1 + bitfield.as_bytes().len(),
            Self::Choke
            | Self::Unchoke
            | Self::Interested
            | Self::NotInterested => 1,
            Self::Have { .. } => 1 + 4,
            Self::Request { .. } | Self::Cancel { .. } => 1 + 4 + 4 + 4,
            Self::Block { data, .. } => 1 + 4 + 4 + data.len(),
            Self::Port(_) => 1 + 2,
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        let msg_len = msg.len();
        buf.reserve(4 + msg_len);
        // message length prefix
        buf.put_u32(msg_len as u32);
        // message id, if any
        if let Some(id) = msg.id() {
            buf.put_u8(id as u8);
        }

        // payload
        match msg {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Bitfield(bitfield) => {
                buf.extend_from_slice(bitfield.as_bytes());
            }
            Message::Have { piece_index } => {
                buf.put_u32(piece_index);
            }
            Message::Request {
                piece_index,
                offset,
                length,
            }
            | Message::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(piece_index);
                buf.put_u32(offset);
                buf.put_u32(length);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(piece_index);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Message::Port(port) => {
                buf.put_u16(port);
            }
        }

        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        // messages with an unknown id are skipped, after which the next
        // message in the buffer is decoded
        loop {
            // the message length header must be present at the minimum,
            // otherwise we can't determine the message type
            if buf.len() < 4 {
                return Ok(None);
            }

            // peek at the length prefix: nothing is consumed until the whole
            // message is in the buffer
            let mut len_prefix = [0; 4];
            len_prefix.copy_from_slice(&buf[..4]);
            let msg_len = u32::from_be_bytes(len_prefix) as usize;

            // the message length is only 0 if this is a keep alive message
            // (all other message types have at least one more field, the
            // message id)
            if msg_len == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            if msg_len > MAX_MSG_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Message length {} too large", msg_len),
                ));
            }

            // check that we got the full payload in the buffer
            if buf.len() < 4 + msg_len {
                buf.reserve(4 + msg_len - buf.len());
                return Ok(None);
            }
            buf.advance(4);

            let id = match MessageId::try_from(buf[0]) {
                Ok(id) => id,
                Err(id) => {
                    log::debug!("Skipping message with unknown id {}", id);
                    buf.advance(msg_len);
                    continue;
                }
            };
            if !id.is_valid_len(msg_len) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid {:?} message length {}", id, msg_len),
                ));
            }
            buf.advance(1);

            let msg = match id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => Message::Have {
                    piece_index: buf.get_u32(),
                },
                MessageId::Bitfield => {
                    let bitfield = BitField::from_bytes(&buf[..msg_len - 1]);
                    buf.advance(msg_len - 1);
                    Message::Bitfield(bitfield)
                }
                MessageId::Request => Message::Request {
                    piece_index: buf.get_u32(),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                },
                MessageId::Block => {
                    let piece_index = buf.get_u32();
                    let offset = buf.get_u32();
                    // the id, piece index and offset precede the block
                    let data = buf.split_to(msg_len - 9).to_vec();
                    Message::Block {
                        piece_index,
                        offset,
                        data,
                    }
                }
                MessageId::Cancel => Message::Cancel {
                    piece_index: buf.get_u32(),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                },
                MessageId::Port => Message::Port(buf.get_u16()),
            };

            return Ok(Some(msg));
        }
    }
}
