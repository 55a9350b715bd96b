use anyhow::Context;

/// Packed boolean vector over pieces.
///
/// The set-bit count is maintained incrementally so `count` is O(1); every
/// mutation goes through [`Self::set`] / [`Self::clear`] to keep it honest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    bytes: Vec<u8>,
    num_pieces: usize,
    count: usize,
}

impl BitField {
    pub fn empty(num_pieces: usize) -> Self {
        Self {
            bytes: vec![0; num_pieces.div_ceil(8)],
            num_pieces,
            count: 0,
        }
    }

    /// Restore from raw wire bytes. Fails if the payload cannot hold
    /// `num_pieces` bits or any spare bit after the end is set.
    pub fn from_bytes(data: &[u8], num_pieces: usize) -> anyhow::Result<Self> {
        let capacity = data.len() * 8;
        let leftover = capacity
            .checked_sub(num_pieces)
            .context("bitfield has less capacity than needed")?;
        if leftover >= 8 {
            anyhow::bail!("bitfield is larger than needed");
        }
        for bit in num_pieces..capacity {
            let mask = 1u8.rotate_right(bit as u32 % 8 + 1);
            anyhow::ensure!(data[bit / 8] & mask == 0, "spare bit {bit} is set");
        }
        let count = data.iter().map(|b| b.count_ones() as usize).sum();
        Ok(Self {
            bytes: data.to_vec(),
            num_pieces,
            count,
        })
    }

    pub fn full(num_pieces: usize) -> Self {
        let mut this = Self::empty(num_pieces);
        for piece in 0..num_pieces {
            this.set(piece);
        }
        this
    }

    pub fn has(&self, piece: usize) -> bool {
        if piece >= self.num_pieces {
            return false;
        }
        let mask = 1u8.rotate_right(piece as u32 % 8 + 1);
        self.bytes[piece / 8] & mask != 0
    }

    /// Set a bit. Returns `false` when it was already set or out of range.
    pub fn set(&mut self, piece: usize) -> bool {
        if piece >= self.num_pieces || self.has(piece) {
            return false;
        }
        let mask = 1u8.rotate_right(piece as u32 % 8 + 1);
        self.bytes[piece / 8] |= mask;
        self.count += 1;
        true
    }

    /// Clear a bit. Returns `false` when it was already clear or out of range.
    pub fn clear(&mut self, piece: usize) -> bool {
        if piece >= self.num_pieces || !self.has(piece) {
            return false;
        }
        let mask = 1u8.rotate_right(piece as u32 % 8 + 1);
        self.bytes[piece / 8] &= !mask;
        self.count -= 1;
        true
    }

    pub fn clear_all(&mut self) {
        self.bytes.fill(0);
        self.count = 0;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.num_pieces
    }

    pub fn is_empty(&self) -> bool {
        self.num_pieces == 0
    }

    pub fn has_all(&self) -> bool {
        self.num_pieces != 0 && self.count == self.num_pieces
    }

    pub fn has_none(&self) -> bool {
        self.count == 0
    }

    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        let total = self.num_pieces;
        self.bytes.iter().enumerate().flat_map(move |(i, byte)| {
            (0..8u32).filter_map(move |position| {
                let piece = i * 8 + position as usize;
                if piece >= total {
                    return None;
                }
                let mask = 1u8.rotate_right(position + 1);
                (byte & mask != 0).then_some(piece)
            })
        })
    }

    pub fn missing_pieces(&self) -> impl Iterator<Item = usize> + '_ {
        let total = self.num_pieces;
        self.bytes.iter().enumerate().flat_map(move |(i, byte)| {
            (0..8u32).filter_map(move |position| {
                let piece = i * 8 + position as usize;
                if piece >= total {
                    return None;
                }
                let mask = 1u8.rotate_right(position + 1);
                (byte & mask == 0).then_some(piece)
            })
        })
    }

    /// First piece we still miss, `None` once complete.
    pub fn first_missing(&self) -> Option<usize> {
        self.missing_pieces().next()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Restore from the hex form produced by [`Self::as_hex`].
    pub fn from_hex(hex_str: &str, num_pieces: usize) -> anyhow::Result<Self> {
        let bytes = hex::decode(hex_str).context("decode bitfield hex")?;
        Self::from_bytes(&bytes, num_pieces)
    }
}
