use bytes::Bytes;
use serde::{de::Visitor, ser::SerializeMap, Deserialize, Serialize};

use super::extension::Extension;
use super::peer::ExtensionHandshake;
use super::Info;

/// Metadata exchange messages (BEP 9). The wire form is a bencoded dict,
/// with `Data` followed by the raw block bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtMessage {
    Request { piece: usize },
    Data { piece: usize, total_size: usize },
    Reject { piece: usize },
}

impl UtMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        serde_bencode::to_bytes(self).expect("serialization is infallible")
    }
}

struct UtMessageVisitor;

impl<'v> Visitor<'v> for UtMessageVisitor {
    type Value = UtMessage;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "bencoded map")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::MapAccess<'v>,
    {
        let mut msg_type: Option<u8> = None;
        let mut piece: Option<usize> = None;
        let mut total_size: Option<usize> = None;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_ref() {
                "msg_type" => msg_type = Some(map.next_value()?),
                "piece" => piece = Some(map.next_value()?),
                "total_size" => total_size = Some(map.next_value()?),
                _ => {
                    return Err(serde::de::Error::unknown_variant(
                        &key,
                        &["msg_type", "piece", "total_size"],
                    ))
                }
            };
        }
        let msg_type = msg_type.ok_or(serde::de::Error::missing_field("msg_type"))?;
        let piece = piece.ok_or(serde::de::Error::missing_field("piece"))?;
        match msg_type {
            0 => Ok(UtMessage::Request { piece }),
            1 => Ok(UtMessage::Data {
                piece,
                total_size: total_size.ok_or(serde::de::Error::missing_field("total_size"))?,
            }),
            2 => Ok(UtMessage::Reject { piece }),
            rest => Err(serde::de::Error::custom(format!("unknown msg_type: {rest}"))),
        }
    }
}

impl<'de> Deserialize<'de> for UtMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(UtMessageVisitor)
    }
}

impl Serialize for UtMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let length_hint = match self {
            UtMessage::Data { .. } => 3,
            _ => 2,
        };
        let mut map = serializer.serialize_map(Some(length_hint))?;
        match self {
            UtMessage::Request { piece } => {
                map.serialize_entry("msg_type", &0)?;
                map.serialize_entry("piece", piece)?;
            }
            UtMessage::Data { piece, total_size } => {
                map.serialize_entry("msg_type", &1)?;
                map.serialize_entry("piece", piece)?;
                map.serialize_entry("total_size", total_size)?;
            }
            UtMessage::Reject { piece } => {
                map.serialize_entry("msg_type", &2)?;
                map.serialize_entry("piece", piece)?;
            }
        };
        map.end()
    }
}

impl From<UtMessage> for Bytes {
    fn from(value: UtMessage) -> Self {
        value.as_bytes().into()
    }
}

impl TryFrom<&[u8]> for UtMessage {
    type Error = anyhow::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self::from_bytes(value)?)
    }
}

impl Extension<'_> for UtMessage {
    const CLIENT_ID: u8 = 1;
    const NAME: &'static str = "ut_metadata";
}

/// Info-dictionary download buffer. Blocks accumulate here, never in the
/// piece machinery; nothing is trusted until the SHA-1 matches the
/// info-hash.
#[derive(Debug, Clone)]
pub struct UtMetadata {
    size: usize,
    remote_id: u8,
    blocks: Vec<Option<Bytes>>,
}

impl UtMetadata {
    pub const BLOCK_SIZE: usize = 1024 * 16;

    pub fn from_handshake(handshake: &ExtensionHandshake) -> Option<Self> {
        let remote_id = handshake.ut_metadata_id()?;
        let size = handshake.ut_metadata_size().filter(|size| *size > 0)?;
        Some(Self {
            size,
            remote_id,
            blocks: vec![None; size.div_ceil(Self::BLOCK_SIZE)],
        })
    }

    /// The id to tag outgoing ut_metadata messages with, as the remote
    /// picked it.
    pub fn remote_id(&self) -> u8 {
        self.remote_id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn block_len(&self, piece: usize) -> usize {
        if piece == self.blocks.len() - 1 {
            self.size - piece * Self::BLOCK_SIZE
        } else {
            Self::BLOCK_SIZE
        }
    }

    pub fn is_full(&self) -> bool {
        self.blocks.iter().all(Option::is_some)
    }

    pub fn next_request(&self) -> Option<UtMessage> {
        let piece = self.blocks.iter().position(Option::is_none)?;
        Some(UtMessage::Request { piece })
    }

    pub fn save_block(&mut self, piece: usize, data: Bytes) -> anyhow::Result<()> {
        anyhow::ensure!(piece < self.blocks.len(), "metadata piece {piece} out of range");
        anyhow::ensure!(
            data.len() == self.block_len(piece),
            "metadata piece {piece} has wrong length {}",
            data.len()
        );
        let block = &mut self.blocks[piece];
        if block.is_none() {
            *block = Some(data);
        }
        Ok(())
    }

    /// Check the buffer against the torrent's info-hash and parse it. On a
    /// mismatch the buffer is reset so the fetch can restart from another
    /// peer.
    pub fn verify(&mut self, info_hash: [u8; 20]) -> anyhow::Result<Option<Info>> {
        use sha1::{Digest, Sha1};
        if !self.is_full() {
            return Ok(None);
        }
        let mut hasher = Sha1::new();
        for block in self.blocks.iter().flatten() {
            hasher.update(block);
        }
        let digest: [u8; 20] = hasher.finalize().into();
        if digest != info_hash {
            self.blocks.fill(None);
            anyhow::bail!("metadata does not hash to the info-hash");
        }
        let bytes: Vec<u8> = self
            .blocks
            .iter()
            .flatten()
            .flat_map(|b| b.iter().copied())
            .collect();
        Ok(Some(Info::from_bytes(&bytes)?))
    }
}

#[cfg(test)]
mod test {
    use super::UtMessage;

    #[test]
    fn ut_message_wire_form() {
        let request = b"d8:msg_typei0e5:piecei0ee";
        let unsupported = b"d8:msg_typei9e5:piecei0ee";
        let data = b"d8:msg_typei1e5:piecei0e10:total_sizei34256eexxxxxxxx";

        let message = UtMessage::from_bytes(request).unwrap();
        assert_eq!(message, UtMessage::Request { piece: 0 });
        assert_eq!(message.as_bytes(), request);
        assert!(UtMessage::from_bytes(unsupported).is_err());
        // data payload trails the bencoded dict
        let data_message = UtMessage::from_bytes(data).unwrap();
        assert_eq!(
            data_message,
            UtMessage::Data {
                piece: 0,
                total_size: 34256
            }
        );
        assert!(String::from_utf8(data.to_vec())
            .unwrap()
            .starts_with(std::str::from_utf8(&data_message.as_bytes()).unwrap()));
    }
}
