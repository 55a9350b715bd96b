use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// What the user asked this torrent to do, independent of what the network
/// is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    Active,
    Stopped,
    Queued,
}

/// Everything needed to restore a torrent across sessions. The actual
/// serialization format belongs to the host; this struct only guarantees a
/// lossless serde round trip (bencode included, hence no bare `None`
/// fields on the wire).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTorrent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torrent_file: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_dict: Option<Bytes>,
    /// Unix seconds.
    pub added_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    pub user_state: UserState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
    pub completed_pieces: Vec<u32>,
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::{PersistedTorrent, UserState};

    fn state() -> PersistedTorrent {
        PersistedTorrent {
            magnet: Some("magnet:?xt=urn:btih:deadbeef".to_string()),
            torrent_file: None,
            info_dict: Some(Bytes::from_static(b"d4:name4:teste")),
            added_at: 1_700_000_000,
            completed_at: None,
            user_state: UserState::Active,
            queue_position: Some(2),
            total_downloaded: 123_456,
            total_uploaded: 654,
            completed_pieces: vec![0, 3, 17],
        }
    }

    #[test]
    fn bencode_round_trip() {
        let original = state();
        let bytes = serde_bencode::to_bytes(&original).unwrap();
        let restored: PersistedTorrent = serde_bencode::from_bytes(&bytes).unwrap();
        assert_eq!(restored, original);
        // re-serializing the restored state yields identical bytes
        assert_eq!(serde_bencode::to_bytes(&restored).unwrap(), bytes);
    }

    #[test]
    fn missing_optionals_default() {
        let mut original = state();
        original.magnet = None;
        original.queue_position = None;
        let bytes = serde_bencode::to_bytes(&original).unwrap();
        let restored: PersistedTorrent = serde_bencode::from_bytes(&bytes).unwrap();
        assert_eq!(restored, original);
    }
}
