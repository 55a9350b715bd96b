use std::collections::HashMap;
use std::fmt::Display;
use std::io::Read;

use anyhow::{anyhow, ensure, Context};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;

use crate::bitfield::BitField;
use crate::pieces::Block;
use crate::CLIENT_NAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id: [u8; 20] = rand::random();
        id[..8].copy_from_slice(b"-TE0100-");
        Self(id)
    }

    /// Best-effort client name from Azureus-style encoding.
    pub fn client_name(&self) -> &'static str {
        if self.0[0] != b'-' || self.0[7] != b'-' {
            return "unknown";
        }
        match &self.0[1..3] {
            b"AZ" => "Azureus",
            b"BC" => "BitComet",
            b"DE" => "Deluge",
            b"LT" => "libtorrent",
            b"TE" => CLIENT_NAME,
            b"TR" => "Transmission",
            b"UT" => "uTorrent",
            b"lt" => "rTorrent",
            b"qB" => "qBittorrent",
            _ => "unknown",
        }
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

#[derive(Debug, Clone)]
pub struct HandShake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
}

impl HandShake {
    pub const SIZE: usize = 68;

    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        let mut reserved = [0_u8; 8];
        // extended protocol (BEP 10)
        reserved[5] = 0x10;
        // fast extension (BEP 6)
        reserved[7] |= 0x04;
        Self {
            info_hash,
            reserved,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & 0x04 != 0
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let length = bytes.first().context("length byte is not set")?;
        ensure!(*length == 19);
        ensure!(bytes.len() == Self::SIZE);
        ensure!(&bytes[1..20] == b"BitTorrent protocol");
        let mut bytes = &bytes[20..];

        let mut reserved = [0; 8];
        let mut info_hash = [0; 20];
        let mut peer_id = [0; 20];
        bytes.read_exact(&mut reserved).context("reserved bytes")?;
        bytes.read_exact(&mut info_hash).context("hash bytes")?;
        bytes.read_exact(&mut peer_id).context("peer_id bytes")?;

        Ok(Self {
            reserved,
            info_hash,
            peer_id: PeerId(peer_id),
        })
    }

    pub fn as_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0] = 19;
        out[1..20].copy_from_slice(b"BitTorrent protocol");
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(&self.info_hash);
        out[48..68].copy_from_slice(&self.peer_id.0);
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtensionHandshake {
    #[serde(rename = "m")]
    pub dict: HashMap<String, u8>,
    #[serde(flatten)]
    pub fields: HashMap<String, serde_bencode::value::Value>,
}

impl ExtensionHandshake {
    pub fn from_bytes(bytes: &[u8]) -> serde_bencode::Result<Self> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> Bytes {
        serde_bencode::to_bytes(self)
            .expect("extension handshake serialization is infallible")
            .into()
    }

    pub fn ours(reqq: usize) -> Self {
        use super::ut_metadata::UtMessage;
        use crate::protocol::extension::Extension;
        let mut dict = HashMap::new();
        dict.insert(UtMessage::NAME.to_string(), UtMessage::CLIENT_ID);
        let mut fields = HashMap::new();
        fields.insert(
            "reqq".to_string(),
            serde_bencode::value::Value::Int(reqq as i64),
        );
        fields.insert(
            "v".to_string(),
            serde_bencode::value::Value::Bytes(CLIENT_NAME.as_bytes().to_vec()),
        );
        Self { dict, fields }
    }

    /// Metadata size if the peer supports ut_metadata
    pub fn ut_metadata_size(&self) -> Option<usize> {
        self.fields.get("metadata_size").and_then(|size| match size {
            serde_bencode::value::Value::Int(size) => usize::try_from(*size).ok(),
            _ => None,
        })
    }

    /// ut_metadata's extension id if the peer supports it
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.dict.get("ut_metadata").copied()
    }

    /// Outstanding request queue depth the peer is willing to hold.
    pub fn request_queue_size(&self) -> Option<usize> {
        let serde_bencode::value::Value::Int(size) = self.fields.get("reqq")? else {
            return None;
        };
        usize::try_from(*size).ok()
    }

    /// Client name and version, far more reliable than peer-id parsing.
    pub fn client_name(&self) -> Option<&str> {
        let serde_bencode::value::Value::Bytes(bytes) = self.fields.get("v")? else {
            return None;
        };
        std::str::from_utf8(bytes).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    HeartBeat,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        index: u32,
    },
    Bitfield {
        payload: Bytes,
    },
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Bytes,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    HaveAll,
    HaveNone,
    ExtensionHandshake {
        payload: Box<ExtensionHandshake>,
    },
    Extension {
        extension_id: u8,
        payload: Bytes,
    },
}

impl Display for PeerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMessage::HeartBeat => write!(f, "HeartBeat"),
            PeerMessage::Choke => write!(f, "Choke"),
            PeerMessage::Unchoke => write!(f, "Unchoke"),
            PeerMessage::Interested => write!(f, "Interested"),
            PeerMessage::NotInterested => write!(f, "NotInterested"),
            PeerMessage::Have { index } => write!(f, "Have {index}"),
            PeerMessage::Bitfield { payload } => {
                write!(f, "Bitfield with length {}", payload.len())
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            } => write!(
                f,
                "Request for piece {index} with offset {begin} and length {length}"
            ),
            PeerMessage::Piece { index, begin, block } => write!(
                f,
                "Block for piece {index} with offset {begin} and length {}",
                block.len()
            ),
            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => write!(
                f,
                "Cancel for piece {index} with offset {begin} and length {length}"
            ),
            PeerMessage::HaveAll => write!(f, "HaveAll"),
            PeerMessage::HaveNone => write!(f, "HaveNone"),
            PeerMessage::ExtensionHandshake { .. } => write!(f, "Extension handshake"),
            PeerMessage::Extension { extension_id, .. } => {
                write!(f, "Extension with id {extension_id}")
            }
        }
    }
}

impl PeerMessage {
    pub fn from_frame(frame: Bytes) -> anyhow::Result<Self> {
        if frame.is_empty() {
            return Ok(Self::HeartBeat);
        }
        let request_payload = |mut b: &[u8]| -> anyhow::Result<_> {
            let mut index_buffer = [0; 4];
            let mut begin_buffer = [0; 4];
            let mut length_buffer = [0; 4];
            b.read_exact(&mut index_buffer).context("index buffer")?;
            b.read_exact(&mut begin_buffer).context("begin buffer")?;
            b.read_exact(&mut length_buffer).context("length buffer")?;
            Ok((
                u32::from_be_bytes(index_buffer),
                u32::from_be_bytes(begin_buffer),
                u32::from_be_bytes(length_buffer),
            ))
        };
        let tag = frame[0];
        let payload = &frame[1..];
        match tag {
            0 => Ok(PeerMessage::Choke),
            1 => Ok(PeerMessage::Unchoke),
            2 => Ok(PeerMessage::Interested),
            3 => Ok(PeerMessage::NotInterested),
            4 => {
                let index_buffer = payload.get(0..4).context("have payload")?.try_into()?;
                Ok(PeerMessage::Have {
                    index: u32::from_be_bytes(index_buffer),
                })
            }
            5 => Ok(PeerMessage::Bitfield {
                payload: frame.slice(1..),
            }),
            6 => {
                let (index, begin, length) = request_payload(payload)?;
                Ok(PeerMessage::Request {
                    index,
                    begin,
                    length,
                })
            }
            7 => {
                ensure!(payload.len() >= 8, "piece payload too short");
                let index = u32::from_be_bytes(payload[0..4].try_into()?);
                let begin = u32::from_be_bytes(payload[4..8].try_into()?);
                let block = frame.slice(9..);
                Ok(PeerMessage::Piece {
                    index,
                    begin,
                    block,
                })
            }
            8 => {
                let (index, begin, length) = request_payload(payload)?;
                Ok(PeerMessage::Cancel {
                    index,
                    begin,
                    length,
                })
            }
            0x0e => Ok(PeerMessage::HaveAll),
            0x0f => Ok(PeerMessage::HaveNone),
            20 => {
                let extension_id = *payload.first().context("extension id")?;
                if extension_id == 0 {
                    Ok(PeerMessage::ExtensionHandshake {
                        payload: Box::new(ExtensionHandshake::from_bytes(&payload[1..])?),
                    })
                } else {
                    Ok(PeerMessage::Extension {
                        extension_id,
                        payload: frame.slice(2..),
                    })
                }
            }
            t => Err(anyhow!("unsupported tag: {t}")),
        }
    }

    pub async fn write_to<T: AsyncWrite + Unpin>(&self, mut writer: T) -> std::io::Result<()> {
        async fn write_len(mut writer: impl AsyncWrite + Unpin, len: u32) -> std::io::Result<()> {
            writer.write_u32(len).await
        }
        match self {
            PeerMessage::HeartBeat => write_len(&mut writer, 0).await,
            PeerMessage::Choke => {
                write_len(&mut writer, 1).await?;
                writer.write_u8(0).await
            }
            PeerMessage::Unchoke => {
                write_len(&mut writer, 1).await?;
                writer.write_u8(1).await
            }
            PeerMessage::Interested => {
                write_len(&mut writer, 1).await?;
                writer.write_u8(2).await
            }
            PeerMessage::NotInterested => {
                write_len(&mut writer, 1).await?;
                writer.write_u8(3).await
            }
            PeerMessage::Have { index } => {
                write_len(&mut writer, 1 + 4).await?;
                writer.write_u8(4).await?;
                writer.write_u32(*index).await
            }
            PeerMessage::Bitfield { payload } => {
                write_len(&mut writer, 1 + payload.len() as u32).await?;
                writer.write_u8(5).await?;
                writer.write_all(payload).await
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            } => {
                write_len(&mut writer, 1 + 12).await?;
                writer.write_u8(6).await?;
                writer.write_u32(*index).await?;
                writer.write_u32(*begin).await?;
                writer.write_u32(*length).await
            }
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                write_len(&mut writer, 1 + 8 + block.len() as u32).await?;
                writer.write_u8(7).await?;
                writer.write_u32(*index).await?;
                writer.write_u32(*begin).await?;
                writer.write_all(block).await
            }
            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => {
                write_len(&mut writer, 1 + 12).await?;
                writer.write_u8(8).await?;
                writer.write_u32(*index).await?;
                writer.write_u32(*begin).await?;
                writer.write_u32(*length).await
            }
            PeerMessage::HaveAll => {
                write_len(&mut writer, 1).await?;
                writer.write_u8(0x0e).await
            }
            PeerMessage::HaveNone => {
                write_len(&mut writer, 1).await?;
                writer.write_u8(0x0f).await
            }
            PeerMessage::ExtensionHandshake { payload } => {
                let payload = payload.as_bytes();
                write_len(&mut writer, 2 + payload.len() as u32).await?;
                writer.write_u8(20).await?;
                writer.write_u8(0).await?;
                writer.write_all(&payload).await
            }
            PeerMessage::Extension {
                extension_id,
                payload,
            } => {
                write_len(&mut writer, 2 + payload.len() as u32).await?;
                writer.write_u8(20).await?;
                writer.write_u8(*extension_id).await?;
                writer.write_all(payload).await
            }
        }
    }

    pub fn request(block: Block) -> Self {
        Self::Request {
            index: block.piece,
            begin: block.offset,
            length: block.length,
        }
    }

    pub fn cancel(block: Block) -> Self {
        Self::Cancel {
            index: block.piece,
            begin: block.offset,
            length: block.length,
        }
    }

    pub fn bitfield(bf: &BitField) -> Self {
        Self::Bitfield {
            payload: Bytes::copy_from_slice(bf.as_bytes()),
        }
    }

    /// Wire length of the frame this message encodes to, including the
    /// length prefix. Feeds the bandwidth tracker.
    pub fn frame_len(&self) -> usize {
        4 + match self {
            PeerMessage::HeartBeat => 0,
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested
            | PeerMessage::HaveAll
            | PeerMessage::HaveNone => 1,
            PeerMessage::Have { .. } => 5,
            PeerMessage::Bitfield { payload } => 1 + payload.len(),
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => 13,
            PeerMessage::Piece { block, .. } => 9 + block.len(),
            PeerMessage::ExtensionHandshake { payload } => 2 + payload.as_bytes().len(),
            PeerMessage::Extension { payload, .. } => 2 + payload.len(),
        }
    }
}

#[derive(Debug)]
pub struct MessageFramer;

/// Upper bound on a single frame; a block (16 KiB) plus headers fits with
/// plenty of slack, anything bigger is a protocol violation.
const MAX_FRAME: usize = 1 << 16;

impl Decoder for MessageFramer {
    type Item = PeerMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            // Not enough data to read length marker.
            return Ok(None);
        }
        let length = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
        if length == 0 {
            src.advance(4);
            return Ok(Some(PeerMessage::HeartBeat));
        }

        // Check that the length is not too large to avoid a denial of
        // service attack where the server runs out of memory.
        if length > MAX_FRAME {
            return Err(anyhow!("frame length {length} exceeds {MAX_FRAME}"));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(4 + length);
        frame.advance(4);
        let message = PeerMessage::from_frame(frame.freeze())
            .map_err(|e| anyhow!("failed to construct peer message: {e}"))?;
        Ok(Some(message))
    }
}
