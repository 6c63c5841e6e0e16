//! Frame error control field (FECF) helpers.
use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISO_HDLC};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// CRC-16 CCITT-FALSE as used by TM, AOS, USLP and TC frames.
pub const CRC_CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
/// CRC-32 as used by USLP frames with a four byte FECF.
pub const CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Error detection scheme of a frame.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ErrorDetection {
    #[default]
    None,
    Crc16,
    Crc32,
}

impl ErrorDetection {
    /// Length of the trailer in bytes.
    pub const fn trailer_len(&self) -> usize {
        match self {
            ErrorDetection::None => 0,
            ErrorDetection::Crc16 => 2,
            ErrorDetection::Crc32 => 4,
        }
    }

    /// Computes the checksum over all bytes but the trailer and writes it into the trailer.
    ///
    /// # Panics
    ///
    /// The frame must be at least as long as the trailer.
    pub fn write_trailer(&self, frame: &mut [u8]) {
        let data_len = frame.len() - self.trailer_len();
        match self {
            ErrorDetection::None => (),
            ErrorDetection::Crc16 => {
                let crc = CRC_CCITT_FALSE.checksum(&frame[..data_len]);
                frame[data_len..].copy_from_slice(&crc.to_be_bytes());
            }
            ErrorDetection::Crc32 => {
                let crc = CRC_32.checksum(&frame[..data_len]);
                frame[data_len..].copy_from_slice(&crc.to_be_bytes());
            }
        }
    }

    /// Returns `true` if the trailer matches the checksum over the rest of the frame.
    pub fn check_trailer(&self, frame: &[u8]) -> bool {
        if frame.len() < self.trailer_len() {
            return false;
        }
        let data_len = frame.len() - self.trailer_len();
        match self {
            ErrorDetection::None => true,
            ErrorDetection::Crc16 => {
                CRC_CCITT_FALSE.checksum(&frame[..data_len]).to_be_bytes() == frame[data_len..]
            }
            ErrorDetection::Crc32 => {
                CRC_32.checksum(&frame[..data_len]).to_be_bytes() == frame[data_len..]
            }
        }
    }
}
