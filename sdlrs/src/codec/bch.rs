//! BCH(63,56) encoding of TC transfer frames into Communications Link Transmission Units
//! (CCSDS 231.0-B).
#[cfg(feature = "alloc")]
use alloc::vec::Vec;

pub const CLTU_START_SEQUENCE: [u8; 2] = [0xEB, 0x90];
pub const CLTU_TAIL_SEQUENCE: [u8; 8] = [0xC5, 0xC5, 0xC5, 0xC5, 0xC5, 0xC5, 0xC5, 0x79];
pub const CLTU_FILL_BYTE: u8 = 0x55;
/// Information bytes per code block.
pub const CODE_BLOCK_DATA_LEN: usize = 7;
pub const CODE_BLOCK_LEN: usize = CODE_BLOCK_DATA_LEN + 1;

// Lower terms of g(x) = x^7 + x^6 + x^2 + 1.
const GENERATOR_MASK: u8 = 0x45;

/// Computes the parity byte of one code block: the complemented seven parity bits followed by
/// the filler bit 0.
pub fn code_block_parity(data: &[u8; CODE_BLOCK_DATA_LEN]) -> u8 {
    let mut shift_reg = 0_u8;
    for byte in data {
        for bit_idx in (0..8).rev() {
            let feedback = ((shift_reg >> 6) ^ (byte >> bit_idx)) & 1;
            shift_reg = (shift_reg << 1) & 0x7F;
            if feedback == 1 {
                shift_reg ^= GENERATOR_MASK;
            }
        }
    }
    ((!shift_reg) & 0x7F) << 1
}

/// Length of the CLTU generated for a TC frame of the given length.
pub const fn cltu_len(frame_len: usize) -> usize {
    CLTU_START_SEQUENCE.len()
        + frame_len.div_ceil(CODE_BLOCK_DATA_LEN) * CODE_BLOCK_LEN
        + CLTU_TAIL_SEQUENCE.len()
}

/// Encodes a TC frame into a CLTU. If `randomize` is set, the frame is randomized before
/// it is split into code blocks.
#[cfg(feature = "alloc")]
pub fn encode_cltu(frame: &[u8], randomize: bool) -> Vec<u8> {
    let mut cltu = Vec::with_capacity(cltu_len(frame.len()));
    cltu.extend_from_slice(&CLTU_START_SEQUENCE);
    let mut rand_iter = super::randomizer::SEQUENCE.iter().cycle();
    for chunk in frame.chunks(CODE_BLOCK_DATA_LEN) {
        let mut block = [CLTU_FILL_BYTE; CODE_BLOCK_DATA_LEN];
        block[..chunk.len()].copy_from_slice(chunk);
        if randomize {
            for byte in block[..chunk.len()].iter_mut() {
                // The cycled sequence never ends.
                *byte ^= rand_iter.next().copied().unwrap_or(0);
            }
        }
        cltu.extend_from_slice(&block);
        cltu.push(code_block_parity(&block));
    }
    cltu.extend_from_slice(&CLTU_TAIL_SEQUENCE);
    cltu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_block() {
        assert_eq!(code_block_parity(&[0; 7]), 0xFE);
    }

    #[test]
    fn test_parity_is_linear() {
        let a = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE];
        let b = [0xF0, 0x0F, 0x33, 0xCC, 0x55, 0xAA, 0x01];
        let mut sum = [0; 7];
        for idx in 0..7 {
            sum[idx] = a[idx] ^ b[idx];
        }
        // The complement and filler bit cancel out in pairs.
        let zero = code_block_parity(&[0; 7]);
        assert_eq!(
            code_block_parity(&a) ^ code_block_parity(&b) ^ zero,
            code_block_parity(&sum)
        );
    }

    #[test]
    fn test_cltu_layout() {
        let frame = [0xAB; 9];
        let cltu = encode_cltu(&frame, false);
        assert_eq!(cltu.len(), cltu_len(frame.len()));
        assert_eq!(cltu.len(), 2 + 16 + 8);
        assert_eq!(cltu[..2], CLTU_START_SEQUENCE);
        assert_eq!(cltu[2..9], [0xAB; 7]);
        assert_eq!(cltu[10..12], [0xAB; 2]);
        assert_eq!(cltu[12..17], [CLTU_FILL_BYTE; 5]);
        assert_eq!(cltu[18..], CLTU_TAIL_SEQUENCE);
        for block in cltu[2..18].chunks(8) {
            let data: [u8; 7] = block[..7].try_into().unwrap();
            assert_eq!(block[7], code_block_parity(&data));
            assert_eq!(block[7] & 1, 0);
        }
    }

    #[test]
    fn test_cltu_randomized() {
        let frame = [0x00; 7];
        let cltu = encode_cltu(&frame, true);
        assert_eq!(cltu[2..9], crate::codec::randomizer::SEQUENCE[..7]);
    }
}
