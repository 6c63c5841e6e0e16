//! Unified Space Data Link Protocol frames (CCSDS 732.1-B-2).
//!
//! USLP frames have a variable length which is declared in the primary header. Truncated
//! frames only carry the first four bytes of the primary header and have a fixed, configured
//! length.
use crate::{
    codec::{
        crc::ErrorDetection, read_be_u16, read_be_u32, read_be_uint, write_be_u16, write_be_u32,
        write_be_uint,
    },
    config::{FrameDecoderConfig, FrameFormat},
    VcId,
};

use super::{
    check_trailer, resolve_first_header_pointer, tm::check_width, DataZone, FormatDecoder,
    FrameDecodeError, FrameEncodeError, FrameHeader, FrameZones,
};

pub const USLP_TRUNCATED_HEADER_LEN: usize = 4;
pub const USLP_MIN_HEADER_LEN: usize = 7;
pub const USLP_MAX_VC_FRAME_COUNT_LEN: u8 = 7;
/// First header pointer or last valid octet value which signals "not applicable".
pub const USLP_POINTER_NONE: u16 = 0xFFFF;
/// User protocol identifier of idle data.
pub const UPID_IDLE: u8 = 0x1F;

/// Construction rule of the transfer frame data field.
pub mod construction_rule {
    /// Packets spanning multiple frames, with a first header pointer.
    pub const PACKETS: u8 = 0b000;
    /// Start of a MAP access SDU, with a last valid octet pointer.
    pub const MAPA_SDU_START: u8 = 0b001;
    /// Continuing segment of a MAP access SDU, with a last valid octet pointer.
    pub const MAPA_SDU_CONTINUATION: u8 = 0b010;
    /// Octet stream without pointer.
    pub const OCTET_STREAM: u8 = 0b011;
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct UslpPrimaryHeader {
    pub spacecraft_id: u16,
    pub source_or_dest_id: bool,
    /// 6 bits.
    pub vc_id: VcId,
    /// 4 bits.
    pub map_id: u8,
    /// Truncated frames only contain the first four header bytes. All following fields are
    /// zero for truncated frames.
    pub truncated: bool,
    /// Total length of the frame in bytes.
    pub frame_length: usize,
    pub bypass_flag: bool,
    pub protocol_control_flag: bool,
    pub ocf_flag: bool,
    /// Length of the frame count in bytes, 0 to 7.
    pub vc_frame_count_len: u8,
    pub vc_frame_count: u64,
}

impl UslpPrimaryHeader {
    pub fn new(spacecraft_id: u16, vc_id: VcId, map_id: u8) -> Self {
        Self {
            spacecraft_id,
            vc_id,
            map_id,
            ..Default::default()
        }
    }

    pub fn header_len(&self) -> usize {
        if self.truncated {
            USLP_TRUNCATED_HEADER_LEN
        } else {
            USLP_MIN_HEADER_LEN + self.vc_frame_count_len as usize
        }
    }

    pub fn vc_frame_count_modulus(&self) -> u64 {
        if self.vc_frame_count_len == 0 {
            1
        } else {
            1 << (8 * self.vc_frame_count_len as u64)
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameDecodeError> {
        if buf.len() < USLP_TRUNCATED_HEADER_LEN {
            return Err(FrameDecodeError::BufferTooShort {
                expected: USLP_TRUNCATED_HEADER_LEN,
                found: buf.len(),
            });
        }
        let first_word = read_be_u32(buf);
        let version = (first_word >> 28) as u8;
        if version != FrameFormat::Uslp.version() {
            return Err(FrameDecodeError::WrongVersion {
                expected: FrameFormat::Uslp.version(),
                found: version,
            });
        }
        let mut header = Self {
            spacecraft_id: ((first_word >> 12) & 0xFFFF) as u16,
            source_or_dest_id: (first_word >> 11) & 1 == 1,
            vc_id: ((first_word >> 5) & 0x3F) as u8,
            map_id: ((first_word >> 1) & 0x0F) as u8,
            truncated: first_word & 1 == 1,
            ..Default::default()
        };
        if header.truncated {
            return Ok(header);
        }
        if buf.len() < USLP_MIN_HEADER_LEN {
            return Err(FrameDecodeError::BufferTooShort {
                expected: USLP_MIN_HEADER_LEN,
                found: buf.len(),
            });
        }
        header.frame_length = read_be_u16(&buf[4..6]) as usize + 1;
        let flags = buf[6];
        header.bypass_flag = (flags >> 7) & 1 == 1;
        header.protocol_control_flag = (flags >> 6) & 1 == 1;
        header.ocf_flag = (flags >> 3) & 1 == 1;
        header.vc_frame_count_len = flags & 0b111;
        if buf.len() < header.header_len() {
            return Err(FrameDecodeError::BufferTooShort {
                expected: header.header_len(),
                found: buf.len(),
            });
        }
        header.vc_frame_count = read_be_uint(
            &buf[USLP_MIN_HEADER_LEN..],
            header.vc_frame_count_len as usize,
        );
        Ok(header)
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, FrameEncodeError> {
        if buf.len() < self.header_len() {
            return Err(FrameEncodeError::BufferTooSmall {
                expected: self.header_len(),
                found: buf.len(),
            });
        }
        check_width("virtual channel ID", self.vc_id as u64, 6)?;
        check_width("MAP ID", self.map_id as u64, 4)?;
        let first_word = ((FrameFormat::Uslp.version() as u32) << 28)
            | ((self.spacecraft_id as u32) << 12)
            | ((self.source_or_dest_id as u32) << 11)
            | ((self.vc_id as u32) << 5)
            | ((self.map_id as u32) << 1)
            | self.truncated as u32;
        write_be_u32(buf, first_word);
        if self.truncated {
            return Ok(USLP_TRUNCATED_HEADER_LEN);
        }
        if self.frame_length == 0 || self.frame_length > u16::MAX as usize + 1 {
            return Err(FrameEncodeError::FieldOverflow {
                field: "frame length",
                value: self.frame_length as u64,
            });
        }
        if self.vc_frame_count_len > USLP_MAX_VC_FRAME_COUNT_LEN {
            return Err(FrameEncodeError::FieldOverflow {
                field: "frame count length",
                value: self.vc_frame_count_len as u64,
            });
        }
        check_width(
            "frame count",
            self.vc_frame_count,
            8 * self.vc_frame_count_len as u32,
        )?;
        write_be_u16(&mut buf[4..6], (self.frame_length - 1) as u16);
        buf[6] = ((self.bypass_flag as u8) << 7)
            | ((self.protocol_control_flag as u8) << 6)
            | ((self.ocf_flag as u8) << 3)
            | self.vc_frame_count_len;
        write_be_uint(
            &mut buf[USLP_MIN_HEADER_LEN..],
            self.vc_frame_count_len as usize,
            self.vc_frame_count,
        );
        Ok(self.header_len())
    }
}

/// Header of the transfer frame data field.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TfdfHeader {
    /// 3 bits, see [construction_rule].
    pub construction_rule: u8,
    /// User protocol identifier, 5 bits.
    pub upid: u8,
    /// First header pointer or last valid octet. Only present for the construction rules
    /// which use a pointer.
    pub pointer: Option<u16>,
}

impl TfdfHeader {
    pub fn new_packets(upid: u8, first_header_pointer: u16) -> Self {
        Self {
            construction_rule: construction_rule::PACKETS,
            upid,
            pointer: Some(first_header_pointer),
        }
    }

    pub fn has_pointer(rule: u8) -> bool {
        rule <= construction_rule::MAPA_SDU_CONTINUATION
    }

    pub fn header_len(&self) -> usize {
        if Self::has_pointer(self.construction_rule) {
            3
        } else {
            1
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameDecodeError> {
        if buf.is_empty() {
            return Err(FrameDecodeError::BufferTooShort {
                expected: 1,
                found: 0,
            });
        }
        let construction_rule = buf[0] >> 5;
        let mut header = Self {
            construction_rule,
            upid: buf[0] & 0x1F,
            pointer: None,
        };
        if Self::has_pointer(construction_rule) {
            if buf.len() < 3 {
                return Err(FrameDecodeError::BufferTooShort {
                    expected: 3,
                    found: buf.len(),
                });
            }
            header.pointer = Some(read_be_u16(&buf[1..3]));
        }
        Ok(header)
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, FrameEncodeError> {
        if buf.len() < self.header_len() {
            return Err(FrameEncodeError::BufferTooSmall {
                expected: self.header_len(),
                found: buf.len(),
            });
        }
        check_width("construction rule", self.construction_rule as u64, 3)?;
        check_width("UPID", self.upid as u64, 5)?;
        buf[0] = (self.construction_rule << 5) | self.upid;
        if Self::has_pointer(self.construction_rule) {
            write_be_u16(&mut buf[1..3], self.pointer.unwrap_or(USLP_POINTER_NONE));
        }
        Ok(self.header_len())
    }
}

#[derive(Debug, Clone)]
pub struct UslpFrameDecoder {
    config: FrameDecoderConfig,
}

impl UslpFrameDecoder {
    pub fn new(config: FrameDecoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FrameDecoderConfig {
        &self.config
    }
}

impl FormatDecoder for UslpFrameDecoder {
    fn decode_zones(&self, frame: &[u8]) -> Result<FrameZones, FrameDecodeError> {
        let header = UslpPrimaryHeader::from_bytes(frame)?;
        let mut data_field_start = header.header_len();
        let mut extra_zone = None;
        if header.truncated {
            if frame.len() != self.config.uslp_truncated_frame_length {
                return Err(FrameDecodeError::LengthMismatch {
                    expected: self.config.uslp_truncated_frame_length,
                    found: frame.len(),
                });
            }
        } else {
            if header.frame_length != frame.len() {
                return Err(FrameDecodeError::LengthMismatch {
                    expected: header.frame_length,
                    found: frame.len(),
                });
            }
            if frame.len() > self.config.frame_length {
                return Err(FrameDecodeError::LengthMismatch {
                    expected: self.config.frame_length,
                    found: frame.len(),
                });
            }
            if self.config.insert_zone_length > 0 {
                extra_zone = Some((
                    data_field_start,
                    data_field_start + self.config.insert_zone_length,
                ));
                data_field_start += self.config.insert_zone_length;
            }
        }
        let mut data_field_end = check_trailer(frame, self.config.error_detection)?;
        let mut ocf = None;
        if header.ocf_flag {
            if data_field_end < data_field_start + 4 {
                return Err(FrameDecodeError::BufferTooShort {
                    expected: data_field_start + 4,
                    found: data_field_end,
                });
            }
            data_field_end -= 4;
            ocf = Some(read_be_u32(&frame[data_field_end..]));
        }
        if data_field_end < data_field_start {
            return Err(FrameDecodeError::BufferTooShort {
                expected: data_field_start,
                found: data_field_end,
            });
        }
        Ok(FrameZones {
            idle_vc: header.vc_id == self.config.idle_vc_id,
            header: FrameHeader::Uslp(header),
            data_field_start,
            data_field_end,
            ocf,
            extra_zone,
        })
    }

    fn decode_data_field(
        &self,
        frame: &[u8],
        zones: &FrameZones,
    ) -> Result<DataZone, FrameDecodeError> {
        let mut data_zone = DataZone {
            data_start: zones.data_field_start,
            data_end: zones.data_field_end,
            first_header_pointer: None,
            idle: false,
        };
        if zones.idle_vc {
            return Ok(data_zone);
        }
        let tfdf_header =
            TfdfHeader::from_bytes(&frame[zones.data_field_start..zones.data_field_end])?;
        data_zone.data_start += tfdf_header.header_len();
        if tfdf_header.upid == UPID_IDLE {
            data_zone.idle = true;
            return Ok(data_zone);
        }
        match (tfdf_header.construction_rule, tfdf_header.pointer) {
            (_, None) | (_, Some(USLP_POINTER_NONE)) => (),
            (construction_rule::PACKETS, Some(fhp)) => {
                data_zone.first_header_pointer = Some(resolve_first_header_pointer(
                    fhp,
                    data_zone.data_start,
                    data_zone.data_end,
                )?);
            }
            (_, Some(last_valid_octet)) => {
                let data_end = data_zone.data_start + last_valid_octet as usize + 1;
                if data_end > data_zone.data_end {
                    return Err(FrameDecodeError::InvalidFirstHeaderPointer(last_valid_octet));
                }
                data_zone.data_end = data_end;
            }
        }
        Ok(data_zone)
    }
}

/// Writes complete USLP frames.
#[derive(Debug, Copy, Clone)]
pub struct UslpFrameEncoder {
    max_frame_length: usize,
    truncated_frame_length: usize,
    insert_zone_length: usize,
    error_detection: ErrorDetection,
}

impl UslpFrameEncoder {
    pub fn new(config: &FrameDecoderConfig) -> Self {
        Self {
            max_frame_length: config.frame_length,
            truncated_frame_length: config.uslp_truncated_frame_length,
            insert_zone_length: config.insert_zone_length,
            error_detection: config.error_detection,
        }
    }

    /// Length of the frame which carries the given amount of user data.
    pub fn frame_len(
        &self,
        header: &UslpPrimaryHeader,
        tfdf_header: &TfdfHeader,
        data_len: usize,
        with_ocf: bool,
    ) -> usize {
        if header.truncated {
            return self.truncated_frame_length;
        }
        header.header_len()
            + self.insert_zone_length
            + tfdf_header.header_len()
            + data_len
            + if with_ocf { 4 } else { 0 }
            + self.error_detection.trailer_len()
    }

    /// Writes a frame and returns its length. The frame length and OCF flag of the header are
    /// set by the encoder. Truncated frames have neither an insert zone nor an OCF, and the data
    /// must fill their data field completely.
    pub fn encode(
        &self,
        header: &UslpPrimaryHeader,
        insert_zone: &[u8],
        tfdf_header: &TfdfHeader,
        data: &[u8],
        ocf: Option<u32>,
        buf: &mut [u8],
    ) -> Result<usize, FrameEncodeError> {
        let mut header = *header;
        let frame_len = self.frame_len(&header, tfdf_header, data.len(), ocf.is_some());
        if header.truncated {
            if ocf.is_some() {
                return Err(FrameEncodeError::OcfMismatch);
            }
            let data_field_len = self.truncated_frame_length.saturating_sub(
                USLP_TRUNCATED_HEADER_LEN + tfdf_header.header_len() + self.error_detection.trailer_len(),
            );
            if data.len() != data_field_len {
                return Err(FrameEncodeError::DataLengthMismatch {
                    expected: data_field_len,
                    found: data.len(),
                });
            }
        } else {
            if insert_zone.len() != self.insert_zone_length {
                return Err(FrameEncodeError::DataLengthMismatch {
                    expected: self.insert_zone_length,
                    found: insert_zone.len(),
                });
            }
            if frame_len > self.max_frame_length {
                return Err(FrameEncodeError::DataLengthMismatch {
                    expected: self.max_frame_length - (frame_len - data.len()).min(self.max_frame_length),
                    found: data.len(),
                });
            }
            header.frame_length = frame_len;
            header.ocf_flag = ocf.is_some();
        }
        if buf.len() < frame_len {
            return Err(FrameEncodeError::BufferTooSmall {
                expected: frame_len,
                found: buf.len(),
            });
        }
        let mut current_idx = header.write_to_bytes(buf)?;
        if !header.truncated {
            buf[current_idx..current_idx + insert_zone.len()].copy_from_slice(insert_zone);
            current_idx += insert_zone.len();
        }
        current_idx += tfdf_header.write_to_bytes(&mut buf[current_idx..])?;
        buf[current_idx..current_idx + data.len()].copy_from_slice(data);
        current_idx += data.len();
        if let Some(ocf) = ocf {
            write_be_u32(&mut buf[current_idx..], ocf);
        }
        self.error_detection.write_trailer(&mut buf[..frame_len]);
        Ok(frame_len)
    }
}
