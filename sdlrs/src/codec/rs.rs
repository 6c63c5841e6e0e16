//! Reed-Solomon codec over GF(2^m) with m <= 8.
//!
//! The codec follows the classic shift register encoder and the Berlekamp-Massey decoder with
//! Chien search and Forney algorithm. All tables are fixed size so no allocation is required.
//! Shortened codes are supported with the `pad` parameter: the first `pad` symbols of the full
//! length code word are implicitly zero and never transmitted.

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RsError {
    #[error("invalid code parameters")]
    InvalidParameters,
    #[error("invalid block length, expected {expected}, found {found}")]
    InvalidLength { expected: usize, found: usize },
    #[error("too many symbol errors, block can not be corrected")]
    Uncorrectable,
}

const TABLE_LEN: usize = 256;

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[derive(Debug, Clone)]
pub struct ReedSolomon {
    symsize: u8,
    nn: usize,
    fcr: usize,
    prim: usize,
    iprim: usize,
    nroots: usize,
    pad: usize,
    alpha_to: [u8; TABLE_LEN],
    index_of: [u8; TABLE_LEN],
    genpoly: [u8; TABLE_LEN],
}

impl ReedSolomon {
    /// Creates a codec.
    ///
    /// # Arguments
    ///
    /// * `symsize` - Symbol size in bits, 1 to 8.
    /// * `gfpoly` - Field generator polynomial, must be primitive.
    /// * `fcr` - First consecutive root of the code generator polynomial, index form.
    /// * `prim` - Primitive element used to generate the roots, index form.
    /// * `nroots` - Number of parity symbols. Up to `nroots / 2` symbol errors are corrected.
    /// * `pad` - Number of leading zero symbols of the shortened code.
    pub fn new(
        symsize: u8,
        gfpoly: u16,
        fcr: usize,
        prim: usize,
        nroots: usize,
        pad: usize,
    ) -> Result<Self, RsError> {
        if symsize == 0 || symsize > 8 {
            return Err(RsError::InvalidParameters);
        }
        let nn = (1_usize << symsize) - 1;
        if fcr > nn
            || prim == 0
            || prim > nn
            || gcd(prim, nn) != 1
            || nroots == 0
            || nroots >= nn
            || pad >= nn - nroots
        {
            return Err(RsError::InvalidParameters);
        }
        let codec = Self::build(symsize, gfpoly, fcr, prim, nroots, pad);
        if !codec.field_is_primitive(gfpoly) {
            return Err(RsError::InvalidParameters);
        }
        Ok(codec)
    }

    /// RS(255,223) with the CCSDS code generator polynomial, conventional symbol basis.
    pub fn ccsds() -> Self {
        Self::build(8, 0x187, 112, 11, 32, 0)
    }

    /// Shortened CCSDS RS(255,223) code, for example used with smaller frame lengths.
    pub fn ccsds_shortened(pad: u8) -> Self {
        Self::build(8, 0x187, 112, 11, 32, (pad as usize).min(222))
    }

    /// RS(10,6) over GF(16) protecting the AOS frame header error control fields.
    pub fn aos_frame_header() -> Self {
        Self::build(4, 0x13, 6, 1, 4, 5)
    }

    fn build(symsize: u8, gfpoly: u16, fcr: usize, prim: usize, nroots: usize, pad: usize) -> Self {
        let nn = (1_usize << symsize) - 1;
        let mut alpha_to = [0_u8; TABLE_LEN];
        let mut index_of = [0_u8; TABLE_LEN];
        index_of[0] = nn as u8;
        alpha_to[nn] = 0;
        let mut shift_reg: usize = 1;
        for idx in 0..nn {
            index_of[shift_reg] = idx as u8;
            alpha_to[idx] = shift_reg as u8;
            shift_reg <<= 1;
            if shift_reg & (1 << symsize) != 0 {
                shift_reg ^= gfpoly as usize;
            }
            shift_reg &= nn;
        }
        let mut iprim = 1;
        while iprim % prim != 0 {
            iprim += nn;
        }
        let mut codec = Self {
            symsize,
            nn,
            fcr,
            prim,
            iprim: iprim / prim,
            nroots,
            pad,
            alpha_to,
            index_of,
            genpoly: [0; TABLE_LEN],
        };
        let mut genpoly = [0_u8; TABLE_LEN];
        genpoly[0] = 1;
        let mut root = fcr * prim;
        for i in 0..nroots {
            genpoly[i + 1] = 1;
            for j in (1..=i).rev() {
                genpoly[j] = if genpoly[j] != 0 {
                    genpoly[j - 1] ^ codec.alpha(codec.index(genpoly[j]) + root)
                } else {
                    genpoly[j - 1]
                };
            }
            genpoly[0] = codec.alpha(codec.index(genpoly[0]) + root);
            root += prim;
        }
        for (dest, coeff) in codec.genpoly.iter_mut().zip(genpoly.iter()).take(nroots + 1) {
            *dest = index_of[*coeff as usize];
        }
        codec
    }

    fn field_is_primitive(&self, gfpoly: u16) -> bool {
        // Running the generator once more must bring the register back to one.
        let mut shift_reg = self.alpha_to[self.nn - 1] as usize;
        shift_reg <<= 1;
        if shift_reg & (1 << self.symsize) != 0 {
            shift_reg ^= gfpoly as usize;
        }
        shift_reg & self.nn == 1
            && (1..self.nn).all(|value| self.alpha_to[self.index(value as u8)] as usize == value)
    }

    #[inline]
    fn modnn(&self, value: usize) -> usize {
        value % self.nn
    }

    #[inline]
    fn alpha(&self, exp: usize) -> u8 {
        self.alpha_to[self.modnn(exp)]
    }

    #[inline]
    fn index(&self, value: u8) -> usize {
        self.index_of[value as usize] as usize
    }

    #[inline]
    fn a0(&self) -> usize {
        self.nn
    }

    pub fn symbol_size(&self) -> u8 {
        self.symsize
    }

    pub fn parity_len(&self) -> usize {
        self.nroots
    }

    /// Number of information symbols per code block.
    pub fn data_len(&self) -> usize {
        self.nn - self.nroots - self.pad
    }

    /// Number of symbols of a complete (shortened) code block.
    pub fn block_len(&self) -> usize {
        self.nn - self.pad
    }

    /// Calculates the parity symbols for the given information symbols.
    pub fn encode(&self, data: &[u8], parity: &mut [u8]) -> Result<(), RsError> {
        if data.len() != self.data_len() {
            return Err(RsError::InvalidLength {
                expected: self.data_len(),
                found: data.len(),
            });
        }
        if parity.len() != self.nroots {
            return Err(RsError::InvalidLength {
                expected: self.nroots,
                found: parity.len(),
            });
        }
        let a0 = self.a0();
        let nroots = self.nroots;
        parity.fill(0);
        for symbol in data {
            let feedback = self.index((*symbol & self.nn as u8) ^ parity[0]);
            if feedback != a0 {
                for j in 1..nroots {
                    parity[j] ^= self.alpha(feedback + self.genpoly[nroots - j] as usize);
                }
            }
            parity.copy_within(1.., 0);
            parity[nroots - 1] = if feedback != a0 {
                self.alpha(feedback + self.genpoly[0] as usize)
            } else {
                0
            };
        }
        Ok(())
    }

    /// Encodes a complete code block in place: the parity is written behind the information
    /// symbols.
    pub fn encode_block(&self, block: &mut [u8]) -> Result<(), RsError> {
        if block.len() != self.block_len() {
            return Err(RsError::InvalidLength {
                expected: self.block_len(),
                found: block.len(),
            });
        }
        let (data, parity) = block.split_at_mut(self.data_len());
        self.encode(data, parity)
    }

    /// Corrects a code block (information symbols followed by the parity) in place.
    ///
    /// Returns the number of corrected symbols.
    pub fn decode(&self, block: &mut [u8]) -> Result<usize, RsError> {
        if block.len() != self.block_len() {
            return Err(RsError::InvalidLength {
                expected: self.block_len(),
                found: block.len(),
            });
        }
        let nn = self.nn;
        let nroots = self.nroots;
        let a0 = self.a0();
        let mask = nn as u8;

        // Syndromes, evaluated with Horner's scheme.
        let mut syn = [block[0] & mask; TABLE_LEN];
        for symbol in block.iter().skip(1) {
            let symbol = *symbol & mask;
            for (i, syn_val) in syn.iter_mut().enumerate().take(nroots) {
                *syn_val = if *syn_val == 0 {
                    symbol
                } else {
                    symbol ^ self.alpha(self.index(*syn_val) + (self.fcr + i) * self.prim)
                };
            }
        }
        if syn[..nroots].iter().all(|s| *s == 0) {
            return Ok(0);
        }
        let mut syn_idx = [0_usize; TABLE_LEN];
        for i in 0..nroots {
            syn_idx[i] = self.index(syn[i]);
        }

        // Berlekamp-Massey for the error locator polynomial.
        let mut lambda = [0_u8; TABLE_LEN];
        lambda[0] = 1;
        let mut b = [a0; TABLE_LEN];
        b[0] = self.index(1);
        let mut t = [0_u8; TABLE_LEN];
        let mut el = 0;
        for r in 1..=nroots {
            let mut discr = 0_u8;
            for i in 0..r {
                if lambda[i] != 0 && syn_idx[r - i - 1] != a0 {
                    discr ^= self.alpha(self.index(lambda[i]) + syn_idx[r - i - 1]);
                }
            }
            let discr = self.index(discr);
            if discr == a0 {
                b.copy_within(0..nroots, 1);
                b[0] = a0;
                continue;
            }
            t[0] = lambda[0];
            for i in 0..nroots {
                t[i + 1] = if b[i] != a0 {
                    lambda[i + 1] ^ self.alpha(discr + b[i])
                } else {
                    lambda[i + 1]
                };
            }
            if 2 * el < r {
                el = r - el;
                for i in 0..=nroots {
                    b[i] = if lambda[i] == 0 {
                        a0
                    } else {
                        self.modnn(self.index(lambda[i]) + nn - discr)
                    };
                }
            } else {
                b.copy_within(0..nroots, 1);
                b[0] = a0;
            }
            lambda[..=nroots].copy_from_slice(&t[..=nroots]);
        }

        let mut lambda_idx = [a0; TABLE_LEN];
        let mut deg_lambda = 0;
        for i in 0..=nroots {
            lambda_idx[i] = self.index(lambda[i]);
            if lambda_idx[i] != a0 {
                deg_lambda = i;
            }
        }
        if deg_lambda == 0 || el > nroots / 2 {
            return Err(RsError::Uncorrectable);
        }

        // Chien search for the roots of the error locator polynomial.
        let mut reg = lambda_idx;
        let mut roots = [0_usize; TABLE_LEN];
        let mut locs = [0_usize; TABLE_LEN];
        let mut count = 0;
        let mut k = self.iprim - 1;
        for i in 1..=nn {
            let mut q = 1_u8;
            for j in (1..=deg_lambda).rev() {
                if reg[j] != a0 {
                    reg[j] = self.modnn(reg[j] + j);
                    q ^= self.alpha_to[reg[j]];
                }
            }
            if q == 0 {
                roots[count] = i;
                locs[count] = k;
                count += 1;
                if count == deg_lambda {
                    break;
                }
            }
            k = self.modnn(k + self.iprim);
        }
        if count != deg_lambda || locs[..count].iter().any(|loc| *loc < self.pad) {
            return Err(RsError::Uncorrectable);
        }

        // Error evaluator polynomial.
        let deg_omega = deg_lambda - 1;
        let mut omega = [a0; TABLE_LEN];
        for i in 0..=deg_omega {
            let mut tmp = 0_u8;
            for j in (0..=i).rev() {
                if syn_idx[i - j] != a0 && lambda_idx[j] != a0 {
                    tmp ^= self.alpha(syn_idx[i - j] + lambda_idx[j]);
                }
            }
            omega[i] = self.index(tmp);
        }

        // Forney algorithm for the error values.
        let mut corrections = [0_u8; TABLE_LEN];
        for j in 0..count {
            let root = roots[j];
            let mut num1 = 0_u8;
            for i in (0..=deg_omega).rev() {
                if omega[i] != a0 {
                    num1 ^= self.alpha(omega[i] + i * root);
                }
            }
            let num2 = self.alpha(root * (self.fcr + nn - 1) + nn);
            let mut den = 0_u8;
            let start = deg_lambda.min(nroots - 1) & !1;
            for i in (0..=start).rev().step_by(2) {
                if lambda_idx[i + 1] != a0 {
                    den ^= self.alpha(lambda_idx[i + 1] + i * root);
                }
            }
            if den == 0 {
                return Err(RsError::Uncorrectable);
            }
            if num1 != 0 {
                corrections[j] =
                    self.alpha(self.index(num1) + self.index(num2) + nn - self.index(den));
            }
        }
        for j in 0..count {
            block[locs[j] - self.pad] ^= corrections[j];
        }
        Ok(count)
    }
}
