//! Claim bookkeeping for crtcs, connectors and output ids.

/// Growable bitset of claimed indices
///
/// Crtcs are claimed by their index in the device's crtc list, connectors by
/// their id. A claim is held by at most one owner at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceAllocator {
    words: Vec<u64>,
}

impl ResourceAllocator {
    /// An allocator with nothing claimed
    pub fn new() -> ResourceAllocator {
        ResourceAllocator::default()
    }

    fn locate(index: u32) -> (usize, u64) {
        ((index / 64) as usize, 1 << (index % 64))
    }

    /// Whether `index` is claimed
    pub fn is_claimed(&self, index: u32) -> bool {
        let (word, bit) = Self::locate(index);
        self.words.get(word).map_or(false, |w| w & bit != 0)
    }

    /// Claim `index`, returns `false` if someone holds it already
    pub fn try_claim(&mut self, index: u32) -> bool {
        if self.is_claimed(index) {
            return false;
        }
        let (word, bit) = Self::locate(index);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= bit;
        true
    }

    /// Give `index` back
    pub fn release(&mut self, index: u32) {
        let (word, bit) = Self::locate(index);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !bit;
        }
    }

    /// Lowest index not claimed
    pub fn first_free(&self) -> u32 {
        let mut index = 0;
        while self.is_claimed(index) {
            index += 1;
        }
        index
    }

    /// Whether nothing is claimed
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// All claimed indices, ascending
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(word, bits)| {
            (0..64u32)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| word as u32 * 64 + bit)
        })
    }
}
