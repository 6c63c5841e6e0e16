//! CCSDS pseudo-randomizer (CCSDS 131.0-B section 10).
//!
//! The randomizer XORs the frame with the output of the LFSR `h(x) = x^8 + x^7 + x^5 + x^3 + 1`
//! which is seeded with all ones at the start of each frame. The sequence repeats after 255
//! bytes.

/// Length of the pseudo-random sequence in bytes.
pub const SEQUENCE_LEN: usize = 255;

/// The pseudo-random sequence, generated at compile time.
pub const SEQUENCE: [u8; SEQUENCE_LEN] = generate_sequence();

const fn generate_sequence() -> [u8; SEQUENCE_LEN] {
    let mut seq = [0; SEQUENCE_LEN];
    let mut shift_reg: u8 = 0xFF;
    let mut idx = 0;
    while idx < SEQUENCE_LEN {
        let mut byte = 0_u8;
        let mut bit = 0;
        while bit < 8 {
            byte = (byte << 1) | (shift_reg & 1);
            let feedback =
                (shift_reg ^ (shift_reg >> 3) ^ (shift_reg >> 5) ^ (shift_reg >> 7)) & 1;
            shift_reg = (shift_reg >> 1) | (feedback << 7);
            bit += 1;
        }
        seq[idx] = byte;
        idx += 1;
    }
    seq
}

/// Randomizes or de-randomizes the buffer in place. The operation is its own inverse.
pub fn randomize(buf: &mut [u8]) {
    for (byte, rand) in buf.iter_mut().zip(SEQUENCE.iter().cycle()) {
        *byte ^= rand;
    }
}
