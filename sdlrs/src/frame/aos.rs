//! AOS Space Data Link Protocol frames (CCSDS 732.0-B-4).
use crate::{
    codec::{
        crc::ErrorDetection, read_be_u16, read_be_u24, read_be_u32, rs::ReedSolomon,
        write_be_u16, write_be_u24, write_be_u32,
    },
    config::{FrameDecoderConfig, FrameFormat},
    VcId,
};

use super::{
    check_trailer, resolve_first_header_pointer, tm::check_width, DataZone, FormatDecoder,
    FrameDecodeError, FrameEncodeError, FrameHeader, FrameZones,
};

pub const AOS_PRIMARY_HEADER_LEN: usize = 6;
pub const AOS_FHEC_LEN: usize = 2;
pub const M_PDU_HEADER_LEN: usize = 2;
pub const AOS_FHP_NO_PACKET_START: u16 = 0x7FF;
pub const AOS_FHP_IDLE_DATA: u16 = 0x7FE;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AosPrimaryHeader {
    pub spacecraft_id: u8,
    /// 6 bits.
    pub vc_id: VcId,
    /// 24 bits.
    pub vc_frame_count: u32,
    pub replay_flag: bool,
    /// If set, the frame count cycle extends the frame count to 28 bits.
    pub vc_frame_count_usage_flag: bool,
    /// 4 bits.
    pub vc_frame_count_cycle: u8,
}

impl AosPrimaryHeader {
    pub fn new(spacecraft_id: u8, vc_id: VcId, vc_frame_count: u32) -> Self {
        Self {
            spacecraft_id,
            vc_id,
            vc_frame_count,
            ..Default::default()
        }
    }

    /// Frame count including the frame count cycle, if it is used.
    pub fn extended_vc_frame_count(&self) -> u32 {
        if self.vc_frame_count_usage_flag {
            ((self.vc_frame_count_cycle as u32 & 0x0F) << 24) | self.vc_frame_count
        } else {
            self.vc_frame_count
        }
    }

    pub fn vc_frame_count_modulus(&self) -> u64 {
        if self.vc_frame_count_usage_flag {
            1 << 28
        } else {
            1 << 24
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameDecodeError> {
        if buf.len() < AOS_PRIMARY_HEADER_LEN {
            return Err(FrameDecodeError::BufferTooShort {
                expected: AOS_PRIMARY_HEADER_LEN,
                found: buf.len(),
            });
        }
        let first_word = read_be_u16(buf);
        let version = (first_word >> 14) as u8;
        if version != FrameFormat::Aos.version() {
            return Err(FrameDecodeError::WrongVersion {
                expected: FrameFormat::Aos.version(),
                found: version,
            });
        }
        let signalling = buf[5];
        Ok(Self {
            spacecraft_id: (first_word >> 6) as u8,
            vc_id: (first_word & 0x3F) as u8,
            vc_frame_count: read_be_u24(&buf[2..5]),
            replay_flag: (signalling >> 7) & 1 == 1,
            vc_frame_count_usage_flag: (signalling >> 6) & 1 == 1,
            vc_frame_count_cycle: signalling & 0x0F,
        })
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, FrameEncodeError> {
        if buf.len() < AOS_PRIMARY_HEADER_LEN {
            return Err(FrameEncodeError::BufferTooSmall {
                expected: AOS_PRIMARY_HEADER_LEN,
                found: buf.len(),
            });
        }
        check_width("virtual channel ID", self.vc_id as u64, 6)?;
        check_width("frame count", self.vc_frame_count as u64, 24)?;
        check_width("frame count cycle", self.vc_frame_count_cycle as u64, 4)?;
        let first_word = ((FrameFormat::Aos.version() as u16) << 14)
            | ((self.spacecraft_id as u16) << 6)
            | self.vc_id as u16;
        write_be_u16(buf, first_word);
        write_be_u24(&mut buf[2..5], self.vc_frame_count);
        buf[5] = ((self.replay_flag as u8) << 7)
            | ((self.vc_frame_count_usage_flag as u8) << 6)
            | self.vc_frame_count_cycle;
        Ok(AOS_PRIMARY_HEADER_LEN)
    }
}

// The header error control protects the first two bytes (master channel and virtual channel ID)
// and the signalling field, as six 4 bit symbols.
fn header_fec_block(header: &[u8]) -> [u8; 10] {
    [
        header[0] >> 4,
        header[0] & 0x0F,
        header[1] >> 4,
        header[1] & 0x0F,
        header[5] >> 4,
        header[5] & 0x0F,
        header[6] >> 4,
        header[6] & 0x0F,
        header[7] >> 4,
        header[7] & 0x0F,
    ]
}

#[derive(Debug, Clone)]
pub struct AosFrameDecoder {
    config: FrameDecoderConfig,
    vc_access: u64,
    header_codec: Option<ReedSolomon>,
}

impl AosFrameDecoder {
    pub fn new(config: FrameDecoderConfig) -> Self {
        Self {
            header_codec: config.aos_header_fec.then(ReedSolomon::aos_frame_header),
            config,
            vc_access: 0,
        }
    }

    pub fn config(&self) -> &FrameDecoderConfig {
        &self.config
    }

    pub fn set_vc_access(&mut self, vc_id: VcId, vc_access: bool) {
        let mask = 1_u64 << (vc_id & 0x3F);
        if vc_access {
            self.vc_access |= mask;
        } else {
            self.vc_access &= !mask;
        }
    }

    pub fn is_vc_access(&self, vc_id: VcId) -> bool {
        (self.vc_access >> (vc_id & 0x3F)) & 1 == 1
    }

    fn header_len(&self) -> usize {
        AOS_PRIMARY_HEADER_LEN + if self.header_codec.is_some() { AOS_FHEC_LEN } else { 0 }
    }

    fn decode_header(&self, frame: &[u8]) -> Result<AosPrimaryHeader, FrameDecodeError> {
        let codec = match &self.header_codec {
            Some(codec) => codec,
            None => return AosPrimaryHeader::from_bytes(frame),
        };
        let mut block = header_fec_block(frame);
        let corrected = codec
            .decode(&mut block)
            .map_err(|_| FrameDecodeError::HeaderFecUncorrectable)?;
        if corrected == 0 {
            return AosPrimaryHeader::from_bytes(frame);
        }
        log::debug!("corrected {} symbols in AOS frame header", corrected);
        let mut header = [0; AOS_PRIMARY_HEADER_LEN];
        header.copy_from_slice(&frame[..AOS_PRIMARY_HEADER_LEN]);
        header[0] = (block[0] << 4) | block[1];
        header[1] = (block[2] << 4) | block[3];
        header[5] = (block[4] << 4) | block[5];
        AosPrimaryHeader::from_bytes(&header)
    }
}

impl FormatDecoder for AosFrameDecoder {
    fn decode_zones(&self, frame: &[u8]) -> Result<FrameZones, FrameDecodeError> {
        let header_len = self.header_len();
        let min_len = header_len + self.config.insert_zone_length;
        if frame.len() < min_len {
            return Err(FrameDecodeError::BufferTooShort {
                expected: min_len,
                found: frame.len(),
            });
        }
        let header = self.decode_header(frame)?;
        if frame.len() != self.config.frame_length {
            return Err(FrameDecodeError::LengthMismatch {
                expected: self.config.frame_length,
                found: frame.len(),
            });
        }
        let mut data_field_end = check_trailer(frame, self.config.error_detection)?;
        let mut ocf = None;
        if self.config.ocf_present {
            if data_field_end < min_len + 4 {
                return Err(FrameDecodeError::BufferTooShort {
                    expected: min_len + 4,
                    found: data_field_end,
                });
            }
            data_field_end -= 4;
            ocf = Some(read_be_u32(&frame[data_field_end..]));
        }
        if data_field_end < min_len {
            return Err(FrameDecodeError::BufferTooShort {
                expected: min_len,
                found: data_field_end,
            });
        }
        let extra_zone =
            (self.config.insert_zone_length > 0).then_some((header_len, min_len));
        Ok(FrameZones {
            idle_vc: header.vc_id == self.config.idle_vc_id,
            header: FrameHeader::Aos(header),
            data_field_start: min_len,
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
        if zones.idle_vc || self.is_vc_access(zones.header.vc_id()) {
            return Ok(data_zone);
        }
        if zones.data_field_end < zones.data_field_start + M_PDU_HEADER_LEN {
            return Err(FrameDecodeError::BufferTooShort {
                expected: zones.data_field_start + M_PDU_HEADER_LEN,
                found: zones.data_field_end,
            });
        }
        let fhp = read_be_u16(&frame[zones.data_field_start..]) & 0x7FF;
        data_zone.data_start += M_PDU_HEADER_LEN;
        match fhp {
            AOS_FHP_NO_PACKET_START => (),
            AOS_FHP_IDLE_DATA => data_zone.idle = true,
            fhp => {
                data_zone.first_header_pointer = Some(resolve_first_header_pointer(
                    fhp,
                    data_zone.data_start,
                    data_zone.data_end,
                )?)
            }
        }
        Ok(data_zone)
    }
}

/// Writes complete AOS frames with a fixed length.
#[derive(Debug, Clone)]
pub struct AosFrameEncoder {
    frame_length: usize,
    error_detection: ErrorDetection,
    insert_zone_length: usize,
    ocf_present: bool,
    header_codec: Option<ReedSolomon>,
}

impl AosFrameEncoder {
    pub fn new(config: &FrameDecoderConfig) -> Self {
        Self {
            frame_length: config.frame_length,
            error_detection: config.error_detection,
            insert_zone_length: config.insert_zone_length,
            ocf_present: config.ocf_present,
            header_codec: config.aos_header_fec.then(ReedSolomon::aos_frame_header),
        }
    }

    fn header_len(&self) -> usize {
        AOS_PRIMARY_HEADER_LEN + if self.header_codec.is_some() { AOS_FHEC_LEN } else { 0 }
    }

    /// Length of the data field available for user data. The multiplexing header is only
    /// present for the packet service.
    pub fn data_field_len(&self, packet_service: bool) -> usize {
        self.frame_length.saturating_sub(
            self.header_len()
                + self.insert_zone_length
                + if packet_service { M_PDU_HEADER_LEN } else { 0 }
                + if self.ocf_present { 4 } else { 0 }
                + self.error_detection.trailer_len(),
        )
    }

    /// Writes a frame into the buffer. If a first header pointer is passed, a multiplexing
    /// header is written in front of the data (packet service), otherwise the data fills the
    /// complete data field (VC access service).
    pub fn encode(
        &self,
        header: &AosPrimaryHeader,
        insert_zone: &[u8],
        first_header_pointer: Option<u16>,
        data: &[u8],
        ocf: Option<u32>,
        buf: &mut [u8],
    ) -> Result<usize, FrameEncodeError> {
        if buf.len() < self.frame_length {
            return Err(FrameEncodeError::BufferTooSmall {
                expected: self.frame_length,
                found: buf.len(),
            });
        }
        if ocf.is_some() != self.ocf_present {
            return Err(FrameEncodeError::OcfMismatch);
        }
        if insert_zone.len() != self.insert_zone_length {
            return Err(FrameEncodeError::DataLengthMismatch {
                expected: self.insert_zone_length,
                found: insert_zone.len(),
            });
        }
        let data_field_len = self.data_field_len(first_header_pointer.is_some());
        if data.len() != data_field_len {
            return Err(FrameEncodeError::DataLengthMismatch {
                expected: data_field_len,
                found: data.len(),
            });
        }
        let mut current_idx = header.write_to_bytes(buf)?;
        if let Some(codec) = &self.header_codec {
            buf[6] = 0;
            buf[7] = 0;
            let block = header_fec_block(buf);
            let mut parity = [0; 4];
            codec
                .encode(&block[..6], &mut parity)
                .map_err(|_| FrameEncodeError::BufferTooSmall {
                    expected: AOS_PRIMARY_HEADER_LEN + AOS_FHEC_LEN,
                    found: buf.len(),
                })?;
            buf[6] = (parity[0] << 4) | parity[1];
            buf[7] = (parity[2] << 4) | parity[3];
            current_idx += AOS_FHEC_LEN;
        }
        buf[current_idx..current_idx + insert_zone.len()].copy_from_slice(insert_zone);
        current_idx += insert_zone.len();
        if let Some(fhp) = first_header_pointer {
            check_width("first header pointer", fhp as u64, 11)?;
            write_be_u16(&mut buf[current_idx..], fhp);
            current_idx += M_PDU_HEADER_LEN;
        }
        buf[current_idx..current_idx + data.len()].copy_from_slice(data);
        current_idx += data.len();
        if let Some(ocf) = ocf {
            write_be_u32(&mut buf[current_idx..], ocf);
        }
        self.error_detection
            .write_trailer(&mut buf[..self.frame_length]);
        Ok(self.frame_length)
    }
}

#[cfg(test)]
mod tests {
    use std::vec;
    use std::vec::Vec;

    use super::*;
    use crate::frame::{FrameDecoder, LostFrames};

    fn config(header_fec: bool) -> FrameDecoderConfig {
        let mut config = FrameDecoderConfig::new_aos(128, ErrorDetection::Crc16, true);
        config.aos_header_fec = header_fec;
        config.insert_zone_length = 3;
        config
    }

    fn build(config: &FrameDecoderConfig, header: &AosPrimaryHeader, fhp: Option<u16>) -> Vec<u8> {
        let encoder = AosFrameEncoder::new(config);
        let data: Vec<u8> = (0..encoder.data_field_len(fhp.is_some()))
            .map(|idx| idx as u8)
            .collect();
        let mut buf = vec![0; config.frame_length];
        encoder
            .encode(header, &[7, 8, 9], fhp, &data, Some(0xAABB_CCDD), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_roundtrip() {
        let config = config(true);
        let mut header = AosPrimaryHeader::new(0xAB, 12, 0x12_3456);
        header.replay_flag = true;
        let raw = build(&config, &header, Some(5));
        let frame = FrameDecoder::new(config).decode(&raw).unwrap();
        assert_eq!(frame.header(), &FrameHeader::Aos(header));
        assert_eq!(frame.vc_frame_count(), 0x12_3456);
        assert_eq!(frame.extra_zone(), Some(&[7_u8, 8, 9][..]));
        assert_eq!(frame.ocf(), Some(0xAABB_CCDD));
        // 6 header, 2 FHEC, 3 insert zone, 2 M_PDU header.
        assert_eq!(frame.data_start(), 13);
        assert_eq!(frame.data_end(), 128 - 6);
        assert_eq!(frame.first_header_pointer(), Some(18));
        assert_eq!(frame.data()[0], 0);
    }

    #[test]
    fn test_header_correction() {
        let mut config = config(true);
        config.error_detection = ErrorDetection::None;
        let header = AosPrimaryHeader::new(0x42, 5, 77);
        let mut raw = build(&config, &header, Some(0));
        // Corrupt the VC ID and the signalling field, one symbol each.
        raw[1] ^= 0x02;
        raw[5] ^= 0x40;
        let frame = FrameDecoder::new(config).decode(&raw).unwrap();
        assert_eq!(frame.header(), &FrameHeader::Aos(header));

        raw[0] ^= 0x80;
        assert_eq!(
            FrameDecoder::new(config).decode(&raw).unwrap_err(),
            FrameDecodeError::HeaderFecUncorrectable
        );
    }

    #[test]
    fn test_frame_count_cycle() {
        let mut header = AosPrimaryHeader::new(1, 1, 0xFF_FFFF);
        header.vc_frame_count_usage_flag = true;
        header.vc_frame_count_cycle = 0x3;
        assert_eq!(header.extended_vc_frame_count(), 0x3FF_FFFF);
        let mut next = header;
        next.vc_frame_count = 0;
        next.vc_frame_count_cycle = 0x4;
        let next = FrameHeader::Aos(next);
        assert_eq!(next.vc_frame_count(), 0x400_0000);
        assert_eq!(
            next.lost_frames_count(Some(0x3FF_FFFF)),
            LostFrames::Known(0)
        );
    }

    #[test]
    fn test_lost_frames_threshold() {
        let header = FrameHeader::Aos(AosPrimaryHeader::new(1, 1, 20_000));
        assert_eq!(header.lost_frames_count(Some(19_990)), LostFrames::Known(9));
        assert_eq!(header.lost_frames_count(Some(1)), LostFrames::Indeterminate);
        let wrapped = FrameHeader::Aos(AosPrimaryHeader::new(1, 1, 2));
        assert_eq!(
            wrapped.lost_frames_count(Some(0xFF_FFFF)),
            LostFrames::Known(2)
        );
    }

    #[test]
    fn test_vc_access_and_idle() {
        let config = config(false);
        let mut decoder = FrameDecoder::new(config);
        decoder.set_vc_access(4, true);
        let raw = build(&config, &AosPrimaryHeader::new(1, 4, 0), None);
        let frame = decoder.decode(&raw).unwrap();
        assert_eq!(frame.data_start(), 9);
        assert_eq!(frame.first_header_pointer(), None);
        assert!(!frame.is_idle());

        let raw = build(&config, &AosPrimaryHeader::new(1, 63, 0), None);
        assert!(decoder.decode(&raw).unwrap().is_idle());

        let raw = build(&config, &AosPrimaryHeader::new(1, 2, 0), Some(AOS_FHP_IDLE_DATA));
        assert!(decoder.decode(&raw).unwrap().is_idle());
    }

    #[test]
    fn test_wrong_version() {
        let config = config(false);
        let mut raw = build(&config, &AosPrimaryHeader::new(1, 2, 0), Some(0));
        raw[0] &= 0x3F;
        assert_eq!(
            FrameDecoder::new(config).decode(&raw).unwrap_err(),
            FrameDecodeError::WrongVersion {
                expected: 1,
                found: 0
            }
        );
    }
}
