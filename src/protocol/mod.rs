use std::fmt::Display;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{de::Visitor, Deserialize, Serialize};
use sha1::{Digest, Sha1};

pub mod extension;
pub mod peer;
/// Extension for Peers to Send Metadata Files (BEP 9): lets a client join
/// a swarm from a magnet link and pull the info dictionary from peers.
pub mod ut_metadata;

/// Single file entry of a multi-file torrent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeDescriptor {
    Files(Vec<File>),
    Length(u64),
}

/// Torrent output file, normalized and safe against path traversal.
#[derive(Clone, Debug)]
pub struct OutputFile {
    offset: u64,
    length: u64,
    path: PathBuf,
}

impl OutputFile {
    pub fn new(offset: u64, length: u64, path: PathBuf) -> Self {
        Self {
            offset,
            length,
            path,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_piece(&self, piece_length: u64) -> usize {
        (self.offset / piece_length) as usize
    }

    pub fn end_piece(&self, piece_length: u64) -> usize {
        ((self.end().max(1) - 1) / piece_length) as usize
    }
}

/// Info dictionary: the unique descriptor of a torrent. Its SHA-1 over the
/// exact bencoded span is the torrent's identity, so the raw bytes are kept
/// alongside the parsed form.
#[derive(Debug, Clone, Deserialize)]
pub struct Info {
    #[serde(skip)]
    pub raw: bytes::Bytes,
    #[serde(flatten)]
    pub file_descriptor: SizeDescriptor,
    /// Single-file case: the file name. Multi-file case: the directory.
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub pieces: Hashes,
}

impl bendy::decoding::FromBencode for Info {
    fn decode_bencode_object(
        object: bendy::decoding::Object,
    ) -> Result<Self, bendy::decoding::Error> {
        let dict = object.try_into_dictionary()?;
        let raw = bytes::Bytes::copy_from_slice(dict.into_raw()?);
        let mut info: Info = serde_bencode::from_bytes(&raw)?;
        info.raw = raw;
        Ok(info)
    }
}

impl Display for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Name: {}", self.name)?;
        writeln!(
            f,
            "Pieces: {} x {} = {} bytes",
            self.pieces.len(),
            self.piece_length,
            self.total_size()
        )
    }
}

impl Info {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        bendy::decoding::FromBencode::from_bencode(bytes).map_err(|e| anyhow::anyhow!("{e}"))
    }

    pub fn as_bytes(&self) -> bytes::Bytes {
        self.raw.clone()
    }

    pub fn total_size(&self) -> u64 {
        match &self.file_descriptor {
            SizeDescriptor::Files(files) => files.iter().map(|f| f.length).sum(),
            SizeDescriptor::Length(length) => *length,
        }
    }

    pub fn files_amount(&self) -> usize {
        match &self.file_descriptor {
            SizeDescriptor::Files(files) => files.len(),
            SizeDescriptor::Length(_) => 1,
        }
    }

    pub fn output_files(&self, output_dir: impl AsRef<Path>) -> Vec<OutputFile> {
        let base = output_dir.as_ref().join(&self.name);
        match &self.file_descriptor {
            SizeDescriptor::Files(files) => {
                let mut offset = 0;
                files
                    .iter()
                    .map(|f| {
                        let file = OutputFile::new(
                            offset,
                            f.length,
                            base.join(sanitize_path(PathBuf::from_iter(f.path.iter()))),
                        );
                        offset += f.length;
                        file
                    })
                    .collect()
            }
            SizeDescriptor::Length(length) => {
                vec![OutputFile::new(0, *length, base)]
            }
        }
    }

    pub fn hash(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(&self.raw);
        hasher.finalize().into()
    }

    pub fn hex_hash(&self) -> String {
        hex::encode(self.hash())
    }

    /// Length of piece `piece_i`, accounting for the short last piece.
    pub fn piece_len(&self, piece_i: usize) -> u32 {
        crate::utils::piece_size(piece_i, self.piece_length, self.total_size())
    }
}

/// List of 20-byte piece hashes.
#[derive(Debug, Clone)]
pub struct Hashes(pub Arc<[[u8; 20]]>);

impl Hashes {
    pub fn get_hash(&self, piece: usize) -> Option<&[u8; 20]> {
        self.0.get(piece)
    }
}

impl Deref for Hashes {
    type Target = [[u8; 20]];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

struct HashesVisitor;

impl Visitor<'_> for HashesVisitor {
    type Value = Hashes;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("byte payload with length divisible by 20")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        if v.len() % 20 != 0 {
            return Err(serde::de::Error::custom(
                "payload is not a multiple of 20 bytes",
            ));
        }
        let chunks = v
            .chunks_exact(20)
            .map(|chunk| <[u8; 20]>::try_from(chunk).unwrap())
            .collect();
        Ok(Hashes(chunks))
    }

    fn visit_borrowed_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        self.visit_bytes(v)
    }
}

impl<'de> Deserialize<'de> for Hashes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_seq(HashesVisitor)
    }
}

impl Serialize for Hashes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0.concat())
    }
}

/// Prevent traversal attacks by dropping suspicious path components.
fn sanitize_path(path: PathBuf) -> PathBuf {
    use std::path::Component;
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                tracing::warn!("Path contains absolute component");
            }
            Component::CurDir | Component::ParentDir => {
                tracing::warn!("Path contains relative component");
            }
            Component::Normal(component) => normalized.push(component),
        }
    }
    normalized
}

#[cfg(test)]
mod test {
    use super::{Hashes, Info};

    fn single_file_info() -> Vec<u8> {
        let hashes = [1u8; 40];
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"d6:lengthi100000e4:name8:test.bin12:piece lengthi65536e6:pieces40:");
        bytes.extend_from_slice(&hashes);
        bytes.push(b'e');
        bytes
    }

    #[test]
    fn parse_single_file_info() {
        let bytes = single_file_info();
        let info = Info::from_bytes(&bytes).unwrap();
        assert_eq!(info.name, "test.bin");
        assert_eq!(info.piece_length, 65536);
        assert_eq!(info.total_size(), 100_000);
        assert_eq!(info.pieces.len(), 2);
        assert_eq!(info.files_amount(), 1);
        // raw span must round-trip exactly for the hash to be stable
        assert_eq!(info.as_bytes(), bytes);
        assert_eq!(info.piece_len(0), 65536);
        assert_eq!(info.piece_len(1), 100_000 - 65536);
    }

    #[test]
    fn output_files_strip_traversal() {
        let hashes = [0u8; 20];
        let mut bytes = Vec::new();
        bytes.extend_from_slice(
            b"d5:filesld6:lengthi10e4:pathl2:..6:../../8:evil.binee"
        );
        bytes.extend_from_slice(b"d6:lengthi20e4:pathl3:sub8:good.bineee");
        bytes.extend_from_slice(b"4:name3:dir12:piece lengthi16384e6:pieces20:");
        bytes.extend_from_slice(&hashes);
        bytes.push(b'e');
        let info = Info::from_bytes(&bytes).unwrap();
        let files = info.output_files("/tmp");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path(), std::path::Path::new("/tmp/dir/evil.bin"));
        assert_eq!(files[1].path(), std::path::Path::new("/tmp/dir/sub/good.bin"));
        assert_eq!(files[0].offset(), 0);
        assert_eq!(files[1].offset(), 10);
        assert_eq!(info.total_size(), 30);
    }

    #[test]
    fn hashes_round_trip() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[7; 20]);
        payload.extend_from_slice(&[9; 20]);
        let hashes: Hashes = serde_bencode::from_bytes(
            &[b"40:".to_vec(), payload.clone()].concat(),
        )
        .unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes.get_hash(0), Some(&[7; 20]));
        assert_eq!(hashes.get_hash(2), None);
        let back = serde_bencode::to_bytes(&hashes).unwrap();
        assert_eq!(back, [b"40:".to_vec(), payload].concat());
    }
}
