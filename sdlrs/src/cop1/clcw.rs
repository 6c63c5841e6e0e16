//! Command Link Control Word (CLCW) as specified in CCSDS 232.0-B, section 4.2.
//!
//! The CLCW is the 32 bit report of the FARM-1 on board. It is transported in the operational
//! control field of TM, AOS or USLP frames.

/// Raw CLCW with bit field accessors.
///
/// ```text
/// 31     control word type (0)
/// 30..29 version number (0)
/// 28..26 status field
/// 25..24 COP in effect (1)
/// 23..18 virtual channel ID
/// 15     no RF available
/// 14     no bit lock
/// 13     lockout
/// 12     wait
/// 11     retransmit
/// 10..9  FARM-B counter
/// 7..0   report value N(R)
/// ```
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Clcw(u32);

impl Clcw {
    /// CLCW of a FARM-1 for the given virtual channel with COP-1 in effect and no flags set.
    pub const fn new(vc_id: u8, report_value: u8) -> Self {
        Self((1 << 24) | (((vc_id & 0x3F) as u32) << 18) | report_value as u32)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn control_word_type(&self) -> bool {
        (self.0 >> 31) & 1 == 1
    }

    pub const fn version(&self) -> u8 {
        ((self.0 >> 29) & 0b11) as u8
    }

    pub const fn status(&self) -> u8 {
        ((self.0 >> 26) & 0b111) as u8
    }

    pub const fn cop_in_effect(&self) -> u8 {
        ((self.0 >> 24) & 0b11) as u8
    }

    pub const fn vc_id(&self) -> u8 {
        ((self.0 >> 18) & 0x3F) as u8
    }

    pub const fn no_rf_available(&self) -> bool {
        (self.0 >> 15) & 1 == 1
    }

    pub const fn no_bit_lock(&self) -> bool {
        (self.0 >> 14) & 1 == 1
    }

    pub const fn lockout(&self) -> bool {
        (self.0 >> 13) & 1 == 1
    }

    pub const fn wait(&self) -> bool {
        (self.0 >> 12) & 1 == 1
    }

    pub const fn retransmit(&self) -> bool {
        (self.0 >> 11) & 1 == 1
    }

    pub const fn farm_b_counter(&self) -> u8 {
        ((self.0 >> 9) & 0b11) as u8
    }

    /// N(R), the sequence number of the next expected AD frame.
    pub const fn report_value(&self) -> u8 {
        self.0 as u8
    }

    const fn with_flag(self, bit: u32, value: bool) -> Self {
        if value {
            Self(self.0 | (1 << bit))
        } else {
            Self(self.0 & !(1 << bit))
        }
    }

    pub const fn with_lockout(self, lockout: bool) -> Self {
        self.with_flag(13, lockout)
    }

    pub const fn with_wait(self, wait: bool) -> Self {
        self.with_flag(12, wait)
    }

    pub const fn with_retransmit(self, retransmit: bool) -> Self {
        self.with_flag(11, retransmit)
    }

    pub const fn with_farm_b_counter(self, counter: u8) -> Self {
        Self((self.0 & !(0b11 << 9)) | (((counter & 0b11) as u32) << 9))
    }
}

impl From<u32> for Clcw {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Clcw> for u32 {
    fn from(clcw: Clcw) -> Self {
        clcw.0
    }
}
