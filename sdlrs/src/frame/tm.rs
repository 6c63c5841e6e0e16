//! TM Space Data Link Protocol frames (CCSDS 132.0-B-3).
use crate::{
    codec::{read_be_u16, read_be_u32, write_be_u16, write_be_u32},
    config::{FrameDecoderConfig, FrameFormat},
    VcId,
};

use super::{
    check_trailer, resolve_first_header_pointer, DataZone, FormatDecoder, FrameDecodeError,
    FrameEncodeError, FrameHeader, FrameZones,
};

pub const TM_PRIMARY_HEADER_LEN: usize = 6;
/// First header pointer value: no packet starts in this frame.
pub const TM_FHP_NO_PACKET_START: u16 = 0x7FF;
/// First header pointer value: the data field only contains idle data.
pub const TM_FHP_IDLE_DATA: u16 = 0x7FE;
pub const TM_MAX_SECONDARY_HEADER_DATA_LEN: usize = 63;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TmPrimaryHeader {
    /// 10 bits.
    pub spacecraft_id: u16,
    /// 3 bits.
    pub vc_id: VcId,
    pub ocf_flag: bool,
    pub mc_frame_count: u8,
    pub vc_frame_count: u8,
    pub secondary_header_flag: bool,
    pub sync_flag: bool,
    pub packet_order_flag: bool,
    /// 2 bits.
    pub segment_length_id: u8,
    /// 11 bits.
    pub first_header_pointer: u16,
}

impl TmPrimaryHeader {
    /// Header for a frame of the packet service, which is what most spacecraft send.
    pub fn new_packet_service(spacecraft_id: u16, vc_id: VcId, first_header_pointer: u16) -> Self {
        Self {
            spacecraft_id,
            vc_id,
            // Value for synchronous packet insertion without segmentation.
            segment_length_id: 0b11,
            first_header_pointer,
            ..Default::default()
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameDecodeError> {
        if buf.len() < TM_PRIMARY_HEADER_LEN {
            return Err(FrameDecodeError::BufferTooShort {
                expected: TM_PRIMARY_HEADER_LEN,
                found: buf.len(),
            });
        }
        let first_word = read_be_u16(buf);
        let version = (first_word >> 14) as u8;
        if version != FrameFormat::Tm.version() {
            return Err(FrameDecodeError::WrongVersion {
                expected: FrameFormat::Tm.version(),
                found: version,
            });
        }
        let status = read_be_u16(&buf[4..6]);
        Ok(Self {
            spacecraft_id: (first_word >> 4) & 0x3FF,
            vc_id: ((first_word >> 1) & 0b111) as u8,
            ocf_flag: first_word & 1 == 1,
            mc_frame_count: buf[2],
            vc_frame_count: buf[3],
            secondary_header_flag: (status >> 15) & 1 == 1,
            sync_flag: (status >> 14) & 1 == 1,
            packet_order_flag: (status >> 13) & 1 == 1,
            segment_length_id: ((status >> 11) & 0b11) as u8,
            first_header_pointer: status & 0x7FF,
        })
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, FrameEncodeError> {
        if buf.len() < TM_PRIMARY_HEADER_LEN {
            return Err(FrameEncodeError::BufferTooSmall {
                expected: TM_PRIMARY_HEADER_LEN,
                found: buf.len(),
            });
        }
        check_width("spacecraft ID", self.spacecraft_id as u64, 10)?;
        check_width("virtual channel ID", self.vc_id as u64, 3)?;
        check_width("segment length ID", self.segment_length_id as u64, 2)?;
        check_width("first header pointer", self.first_header_pointer as u64, 11)?;
        let first_word = (self.spacecraft_id << 4) | ((self.vc_id as u16) << 1) | self.ocf_flag as u16;
        write_be_u16(buf, first_word);
        buf[2] = self.mc_frame_count;
        buf[3] = self.vc_frame_count;
        let status = ((self.secondary_header_flag as u16) << 15)
            | ((self.sync_flag as u16) << 14)
            | ((self.packet_order_flag as u16) << 13)
            | ((self.segment_length_id as u16) << 11)
            | self.first_header_pointer;
        write_be_u16(&mut buf[4..6], status);
        Ok(TM_PRIMARY_HEADER_LEN)
    }
}

pub(crate) fn check_width(
    field: &'static str,
    value: u64,
    bits: u32,
) -> Result<(), FrameEncodeError> {
    if bits < 64 && value >> bits != 0 {
        return Err(FrameEncodeError::FieldOverflow { field, value });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct TmFrameDecoder {
    config: FrameDecoderConfig,
}

impl TmFrameDecoder {
    pub fn new(config: FrameDecoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FrameDecoderConfig {
        &self.config
    }
}

impl FormatDecoder for TmFrameDecoder {
    fn decode_zones(&self, frame: &[u8]) -> Result<FrameZones, FrameDecodeError> {
        let header = TmPrimaryHeader::from_bytes(frame)?;
        if frame.len() != self.config.frame_length {
            return Err(FrameDecodeError::LengthMismatch {
                expected: self.config.frame_length,
                found: frame.len(),
            });
        }
        let mut data_field_end = check_trailer(frame, self.config.error_detection)?;
        let mut ocf = None;
        if header.ocf_flag {
            if data_field_end < TM_PRIMARY_HEADER_LEN + 4 {
                return Err(FrameDecodeError::BufferTooShort {
                    expected: TM_PRIMARY_HEADER_LEN + 4,
                    found: data_field_end,
                });
            }
            data_field_end -= 4;
            ocf = Some(read_be_u32(&frame[data_field_end..]));
        }
        let mut data_field_start = TM_PRIMARY_HEADER_LEN;
        let mut extra_zone = None;
        if header.secondary_header_flag {
            if data_field_end <= TM_PRIMARY_HEADER_LEN {
                return Err(FrameDecodeError::BufferTooShort {
                    expected: TM_PRIMARY_HEADER_LEN + 1,
                    found: data_field_end,
                });
            }
            let secondary_header_len = (frame[TM_PRIMARY_HEADER_LEN] & 0x3F) as usize + 1;
            data_field_start += secondary_header_len;
            if data_field_start > data_field_end {
                return Err(FrameDecodeError::BufferTooShort {
                    expected: data_field_start,
                    found: data_field_end,
                });
            }
            extra_zone = Some((TM_PRIMARY_HEADER_LEN + 1, data_field_start));
        }
        Ok(FrameZones {
            idle_vc: header.vc_id == self.config.idle_vc_id,
            header: FrameHeader::Tm(header),
            data_field_start,
            data_field_end,
            ocf,
            extra_zone,
        })
    }

    fn decode_data_field(
        &self,
        _frame: &[u8],
        zones: &FrameZones,
    ) -> Result<DataZone, FrameDecodeError> {
        let mut data_zone = DataZone {
            data_start: zones.data_field_start,
            data_end: zones.data_field_end,
            first_header_pointer: None,
            idle: false,
        };
        let header = match zones.header {
            FrameHeader::Tm(header) => header,
            _ => return Ok(data_zone),
        };
        // Frames of the VC access service do not use the pointer.
        if header.sync_flag || zones.idle_vc {
            return Ok(data_zone);
        }
        match header.first_header_pointer {
            TM_FHP_NO_PACKET_START => (),
            TM_FHP_IDLE_DATA => data_zone.idle = true,
            fhp => {
                data_zone.first_header_pointer = Some(resolve_first_header_pointer(
                    fhp,
                    zones.data_field_start,
                    zones.data_field_end,
                )?)
            }
        }
        Ok(data_zone)
    }
}

/// Writes complete TM frames with a fixed length.
#[derive(Debug, Copy, Clone)]
pub struct TmFrameEncoder {
    pub frame_length: usize,
    pub error_detection: crate::codec::crc::ErrorDetection,
}

impl TmFrameEncoder {
    pub fn new(frame_length: usize, error_detection: crate::codec::crc::ErrorDetection) -> Self {
        Self {
            frame_length,
            error_detection,
        }
    }

    /// Length of the data field for the given frame layout.
    pub fn data_field_len(&self, with_ocf: bool, secondary_header_data_len: Option<usize>) -> usize {
        let secondary_header_len = secondary_header_data_len.map(|len| len + 1).unwrap_or(0);
        self.frame_length.saturating_sub(
            TM_PRIMARY_HEADER_LEN
                + secondary_header_len
                + if with_ocf { 4 } else { 0 }
                + self.error_detection.trailer_len(),
        )
    }

    /// Writes a frame into the buffer and returns the frame length. The data must fill the
    /// data field completely. The OCF and secondary header flags of the header are set from
    /// the passed arguments.
    pub fn encode(
        &self,
        header: &TmPrimaryHeader,
        secondary_header: Option<&[u8]>,
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
        let data_field_len = self.data_field_len(ocf.is_some(), secondary_header.map(|s| s.len()));
        if data.len() != data_field_len {
            return Err(FrameEncodeError::DataLengthMismatch {
                expected: data_field_len,
                found: data.len(),
            });
        }
        let mut header = *header;
        header.ocf_flag = ocf.is_some();
        header.secondary_header_flag = secondary_header.is_some();
        let mut current_idx = header.write_to_bytes(buf)?;
        if let Some(secondary_header) = secondary_header {
            check_width(
                "secondary header length",
                secondary_header.len() as u64,
                6,
            )?;
            buf[current_idx] = secondary_header.len() as u8;
            current_idx += 1;
            buf[current_idx..current_idx + secondary_header.len()].copy_from_slice(secondary_header);
            current_idx += secondary_header.len();
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
