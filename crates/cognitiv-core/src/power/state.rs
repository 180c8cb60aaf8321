//! Schedule record kept in retained RTC memory.
//!
//! The record is four little-endian words. The checksum covers the three
//! words after it, so a record left behind by other firmware, or plain
//! uninitialized memory after flashing, fails validation.

use crc::{CRC_32_ISO_HDLC, Crc};
use thiserror_no_std::Error;

/// Number of `u32` words the record occupies.
pub const STATE_WORDS: usize = 4;

/// Sentinel stored in the marker word of every record this firmware writes.
pub const STATE_MARKER: u32 = 0xC06E_5EED;

/// CRC-32 (IEEE 802.3, reflected, poly 0xEDB88320).
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("marker 0x{found:08X} is not ours")]
    Marker { found: u32 },
    #[error("checksum 0x{stored:08X} does not match contents (0x{computed:08X})")]
    Checksum { stored: u32, computed: u32 },
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistentScheduleState {
    pub checksum: u32,
    pub marker: u32,
    /// Unix seconds at which normal measurement resumes.
    pub wake_target: u32,
    /// Chained sleep segments still owed before `wake_target`.
    pub remaining_chunks: u32,
}

impl PersistentScheduleState {
    /// A marked record with a fresh checksum.
    pub fn sealed(wake_target: u32, remaining_chunks: u32) -> Self {
        let mut state = Self {
            checksum: 0,
            marker: STATE_MARKER,
            wake_target,
            remaining_chunks,
        };
        state.checksum = state.compute_checksum();
        state
    }

    pub fn compute_checksum(&self) -> u32 {
        let mut payload = [0u8; (STATE_WORDS - 1) * 4];
        for (chunk, word) in payload
            .chunks_exact_mut(4)
            .zip([self.marker, self.wake_target, self.remaining_chunks])
        {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        crc32(&payload)
    }

    pub fn validate(&self) -> Result<(), StateError> {
        if self.marker != STATE_MARKER {
            return Err(StateError::Marker { found: self.marker });
        }
        let computed = self.compute_checksum();
        if self.checksum != computed {
            return Err(StateError::Checksum {
                stored: self.checksum,
                computed,
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn to_words(&self) -> [u32; STATE_WORDS] {
        [
            self.checksum,
            self.marker,
            self.wake_target,
            self.remaining_chunks,
        ]
    }

    pub fn from_words(words: [u32; STATE_WORDS]) -> Self {
        let [checksum, marker, wake_target, remaining_chunks] = words;
        Self {
            checksum,
            marker,
            wake_target,
            remaining_chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_layout_is_four_words() {
        assert_eq!(core::mem::size_of::<PersistentScheduleState>(), STATE_WORDS * 4);
    }

    #[test]
    fn test_sealed_state_validates() {
        let state = PersistentScheduleState::sealed(1_718_000_000, 7);
        assert!(state.is_valid());
        assert_eq!(PersistentScheduleState::from_words(state.to_words()), state);
    }

    #[test]
    fn test_any_flipped_bit_invalidates() {
        let words = PersistentScheduleState::sealed(1_718_000_000, 7).to_words();
        for word in 0..STATE_WORDS {
            for bit in 0..32 {
                let mut corrupt = words;
                corrupt[word] ^= 1 << bit;
                assert!(
                    !PersistentScheduleState::from_words(corrupt).is_valid(),
                    "word {} bit {} not detected",
                    word,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_validate_names_the_fault() {
        let mut state = PersistentScheduleState::sealed(1_718_000_000, 3);
        state.remaining_chunks = 2;
        assert!(matches!(state.validate(), Err(StateError::Checksum { .. })));

        let foreign = PersistentScheduleState::from_words([0, 0xFFFF_0000, 0, 0]);
        assert_eq!(
            foreign.validate(),
            Err(StateError::Marker { found: 0xFFFF_0000 })
        );
    }

    #[test]
    fn test_blank_memory_is_invalid() {
        assert!(!PersistentScheduleState::from_words([0; STATE_WORDS]).is_valid());
        assert!(!PersistentScheduleState::from_words([u32::MAX; STATE_WORDS]).is_valid());
    }
}
