/// Piece length with consideration of the short last piece.
pub fn piece_size(piece_i: usize, piece_length: u32, total_length: u64) -> u32 {
    let start = piece_i as u64 * piece_length as u64;
    debug_assert!(start < total_length);
    (total_length - start).min(piece_length as u64) as u32
}

pub fn verify_sha1(hash: [u8; 20], input: &[u8]) -> bool {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(input);
    let result: [u8; 20] = hasher.finalize().into();
    hash == result
}
