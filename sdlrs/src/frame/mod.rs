//! Downlink transfer frames: TM (CCSDS 132.0-B), AOS (CCSDS 732.0-B) and USLP (CCSDS 732.1-B).
//!
//! A raw frame is decoded with a [FrameDecoder] which is created from a [FrameDecoderConfig].
//! The result is a [TransferFrame] which borrows the raw frame buffer and exposes the fields
//! common to all formats, plus the format specific [FrameHeader].
//!
//! Decoding happens in two steps. First the primary header, the trailer and the zones which
//! are not part of the data field are validated and located. After that, an optional security
//! transform may verify the data field before the data field header (first header pointer)
//! is interpreted.
//!
//! Each format module also contains an encoder which writes complete frames. These are used to
//! build frame simulators and in tests.
use crate::{
    config::{FrameDecoderConfig, FrameFormat},
    security::{SecurityError, SecurityTransform},
    SpacecraftId, VcId,
};

pub mod aos;
pub mod tm;
pub mod uslp;

pub use aos::{AosFrameDecoder, AosFrameEncoder, AosPrimaryHeader};
pub use tm::{TmFrameDecoder, TmFrameEncoder, TmPrimaryHeader};
pub use uslp::{TfdfHeader, UslpFrameDecoder, UslpFrameEncoder, UslpPrimaryHeader};

/// Errors when decoding a transfer frame. All of them mark the frame as corrupted: it is dropped
/// and the stream continues with the next frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("buffer too short, expected at least {expected} bytes, found {found}")]
    BufferTooShort { expected: usize, found: usize },
    #[error("wrong transfer frame version number {found}, expected {expected}")]
    WrongVersion { expected: u8, found: u8 },
    #[error("frame length {found} does not match expected length {expected}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("frame error control field mismatch")]
    CrcMismatch,
    #[error("uncorrectable error in frame header")]
    HeaderFecUncorrectable,
    #[error("first header pointer {0} outside of the data field")]
    InvalidFirstHeaderPointer(u16),
    #[error("security verification failed: {0}")]
    Security(#[from] SecurityError),
}

/// Errors when encoding a transfer frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("buffer too small, expected at least {expected} bytes, found {found}")]
    BufferTooSmall { expected: usize, found: usize },
    #[error("data length {found} does not fit the data field length {expected}")]
    DataLengthMismatch { expected: usize, found: usize },
    #[error("field value {value} exceeds the width of the {field} field")]
    FieldOverflow { field: &'static str, value: u64 },
    #[error("operational control field presence does not match the configuration")]
    OcfMismatch,
}

/// Number of frames lost between two consecutive frames of a virtual channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LostFrames {
    Known(u64),
    /// The gap exceeds the interruption threshold of the format or no previous frame count is
    /// known. The number of lost frames can not be determined.
    Indeterminate,
}

impl LostFrames {
    /// Returns `true` unless the frames were provably consecutive.
    pub fn frames_lost(&self) -> bool {
        !matches!(self, LostFrames::Known(0))
    }
}

/// Gap threshold above which a TM frame count gap is treated as an interruption.
pub const TM_INTERRUPTION_THRESHOLD: u64 = 128;
/// Gap threshold for AOS and USLP frame counts.
pub const LARGE_COUNT_INTERRUPTION_THRESHOLD: u64 = 10_000;

pub(crate) fn lost_frames(previous: u64, current: u64, modulus: u64, threshold: u64) -> LostFrames {
    let delta = crate::codec::seq_distance(previous, current, modulus);
    if delta == 0 || delta > threshold {
        return LostFrames::Indeterminate;
    }
    LostFrames::Known(delta - 1)
}

/// Format specific primary header of a decoded frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameHeader {
    Tm(TmPrimaryHeader),
    Aos(AosPrimaryHeader),
    Uslp(UslpPrimaryHeader),
}

impl FrameHeader {
    pub fn format(&self) -> FrameFormat {
        match self {
            FrameHeader::Tm(_) => FrameFormat::Tm,
            FrameHeader::Aos(_) => FrameFormat::Aos,
            FrameHeader::Uslp(_) => FrameFormat::Uslp,
        }
    }

    pub fn spacecraft_id(&self) -> SpacecraftId {
        match self {
            FrameHeader::Tm(hdr) => hdr.spacecraft_id,
            FrameHeader::Aos(hdr) => hdr.spacecraft_id as SpacecraftId,
            FrameHeader::Uslp(hdr) => hdr.spacecraft_id,
        }
    }

    pub fn vc_id(&self) -> VcId {
        match self {
            FrameHeader::Tm(hdr) => hdr.vc_id,
            FrameHeader::Aos(hdr) => hdr.vc_id,
            FrameHeader::Uslp(hdr) => hdr.vc_id,
        }
    }

    /// Virtual channel frame count.
    pub fn vc_frame_count(&self) -> u64 {
        match self {
            FrameHeader::Tm(hdr) => hdr.vc_frame_count as u64,
            FrameHeader::Aos(hdr) => hdr.extended_vc_frame_count() as u64,
            FrameHeader::Uslp(hdr) => hdr.vc_frame_count,
        }
    }

    /// Modulus of the virtual channel frame count. USLP frames without a frame count return 1.
    pub fn vc_frame_count_modulus(&self) -> u64 {
        match self {
            FrameHeader::Tm(_) => 256,
            FrameHeader::Aos(hdr) => hdr.vc_frame_count_modulus(),
            FrameHeader::Uslp(hdr) => hdr.vc_frame_count_modulus(),
        }
    }

    /// Frames lost between the frame with the `previous` count and this frame.
    pub fn lost_frames_count(&self, previous: Option<u64>) -> LostFrames {
        let previous = match previous {
            Some(previous) => previous,
            None => return LostFrames::Indeterminate,
        };
        let modulus = self.vc_frame_count_modulus();
        let threshold = match self {
            FrameHeader::Tm(_) => TM_INTERRUPTION_THRESHOLD,
            FrameHeader::Aos(_) => LARGE_COUNT_INTERRUPTION_THRESHOLD,
            FrameHeader::Uslp(hdr) => {
                if hdr.vc_frame_count_len == 0 {
                    // Without a frame count, losses can not be detected.
                    return LostFrames::Known(0);
                }
                (modulus / 2).min(LARGE_COUNT_INTERRUPTION_THRESHOLD)
            }
        };
        lost_frames(previous, self.vc_frame_count(), modulus, threshold)
    }
}

/// Location of the zones of a frame which were found by validating the frame envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameZones {
    pub header: FrameHeader,
    /// Start of the data field, including a data field header.
    pub data_field_start: usize,
    /// End of the data field, excluding the OCF and the trailer.
    pub data_field_end: usize,
    pub ocf: Option<u32>,
    /// TM secondary header or AOS/USLP insert zone.
    pub extra_zone: Option<(usize, usize)>,
    /// The frame belongs to the idle virtual channel.
    pub idle_vc: bool,
}

/// Bounds of the user data inside the data field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DataZone {
    pub data_start: usize,
    pub data_end: usize,
    pub first_header_pointer: Option<usize>,
    pub idle: bool,
}

/// Frame format specific decoding steps.
pub trait FormatDecoder {
    /// Validates the length, version and trailer of a frame and locates its zones.
    fn decode_zones(&self, frame: &[u8]) -> Result<FrameZones, FrameDecodeError>;

    /// Interprets the data field header, if there is one.
    fn decode_data_field(
        &self,
        frame: &[u8],
        zones: &FrameZones,
    ) -> Result<DataZone, FrameDecodeError>;
}

/// Checks that the trailer of the frame matches and returns the length without the trailer.
pub(crate) fn check_trailer(
    frame: &[u8],
    error_detection: crate::codec::crc::ErrorDetection,
) -> Result<usize, FrameDecodeError> {
    if !error_detection.check_trailer(frame) {
        return Err(FrameDecodeError::CrcMismatch);
    }
    Ok(frame.len() - error_detection.trailer_len())
}

/// Resolves a first header pointer relative to the data start.
pub(crate) fn resolve_first_header_pointer(
    fhp: u16,
    data_start: usize,
    data_end: usize,
) -> Result<usize, FrameDecodeError> {
    let packet_start = data_start + fhp as usize;
    if packet_start >= data_end {
        return Err(FrameDecodeError::InvalidFirstHeaderPointer(fhp));
    }
    Ok(packet_start)
}

/// Logical transfer frame. It borrows the raw frame and is only valid during the processing of
/// that frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferFrame<'raw> {
    raw: &'raw [u8],
    zones: FrameZones,
    data_zone: DataZone,
}

impl<'raw> TransferFrame<'raw> {
    pub fn new(raw: &'raw [u8], zones: FrameZones, data_zone: DataZone) -> Self {
        Self {
            raw,
            zones,
            data_zone,
        }
    }

    pub fn header(&self) -> &FrameHeader {
        &self.zones.header
    }

    pub fn format(&self) -> FrameFormat {
        self.zones.header.format()
    }

    pub fn spacecraft_id(&self) -> SpacecraftId {
        self.zones.header.spacecraft_id()
    }

    pub fn vc_id(&self) -> VcId {
        self.zones.header.vc_id()
    }

    pub fn vc_frame_count(&self) -> u64 {
        self.zones.header.vc_frame_count()
    }

    pub fn lost_frames_count(&self, previous: Option<u64>) -> LostFrames {
        self.zones.header.lost_frames_count(previous)
    }

    /// The complete raw frame.
    pub fn raw(&self) -> &'raw [u8] {
        self.raw
    }

    pub fn data_start(&self) -> usize {
        self.data_zone.data_start
    }

    pub fn data_end(&self) -> usize {
        self.data_zone.data_end
    }

    /// User data of the frame.
    pub fn data(&self) -> &'raw [u8] {
        &self.raw[self.data_zone.data_start..self.data_zone.data_end]
    }

    /// Absolute offset inside [Self::raw] where the first packet of this frame starts.
    pub fn first_header_pointer(&self) -> Option<usize> {
        self.data_zone.first_header_pointer
    }

    /// The frame only contains idle data, either because it belongs to the idle virtual channel
    /// or because the data field is filled with idle data.
    pub fn is_idle(&self) -> bool {
        self.zones.idle_vc || self.data_zone.idle
    }

    pub fn ocf(&self) -> Option<u32> {
        self.zones.ocf
    }

    /// TM secondary header or AOS/USLP insert zone, if present.
    pub fn extra_zone(&self) -> Option<&'raw [u8]> {
        self.zones
            .extra_zone
            .map(|(start, end)| &self.raw[start..end])
    }
}

/// Decoder for one of the downlink frame formats, selected by configuration.
#[derive(Debug, Clone)]
pub enum FrameDecoder {
    Tm(TmFrameDecoder),
    Aos(AosFrameDecoder),
    Uslp(UslpFrameDecoder),
}

impl FrameDecoder {
    pub fn new(config: FrameDecoderConfig) -> Self {
        match config.format {
            FrameFormat::Tm => FrameDecoder::Tm(TmFrameDecoder::new(config)),
            FrameFormat::Aos => FrameDecoder::Aos(AosFrameDecoder::new(config)),
            FrameFormat::Uslp => FrameDecoder::Uslp(UslpFrameDecoder::new(config)),
        }
    }

    pub fn config(&self) -> &FrameDecoderConfig {
        match self {
            FrameDecoder::Tm(decoder) => decoder.config(),
            FrameDecoder::Aos(decoder) => decoder.config(),
            FrameDecoder::Uslp(decoder) => decoder.config(),
        }
    }

    fn format_decoder(&self) -> &dyn FormatDecoder {
        match self {
            FrameDecoder::Tm(decoder) => decoder,
            FrameDecoder::Aos(decoder) => decoder,
            FrameDecoder::Uslp(decoder) => decoder,
        }
    }

    /// Marks a virtual channel as using the VC access service. Only relevant for AOS, where
    /// these frames do not carry a multiplexing header.
    pub fn set_vc_access(&mut self, vc_id: VcId, vc_access: bool) {
        if let FrameDecoder::Aos(decoder) = self {
            decoder.set_vc_access(vc_id, vc_access);
        }
    }

    /// Decodes a frame.
    pub fn decode<'raw>(&self, frame: &'raw [u8]) -> Result<TransferFrame<'raw>, FrameDecodeError> {
        let decoder = self.format_decoder();
        let zones = decoder.decode_zones(frame)?;
        let data_zone = decoder.decode_data_field(frame, &zones)?;
        Ok(TransferFrame::new(frame, zones, data_zone))
    }

    /// Decodes a frame which is protected by the given security transform. The data field is
    /// verified and decrypted in place before it is interpreted. Frames of the idle virtual
    /// channel are not protected.
    pub fn decode_secured<'raw>(
        &self,
        frame: &'raw mut [u8],
        security: &(impl SecurityTransform + ?Sized),
    ) -> Result<TransferFrame<'raw>, FrameDecodeError> {
        let decoder = self.format_decoder();
        let mut zones = decoder.decode_zones(frame)?;
        if !zones.idle_vc {
            let (start, end) = security.verify(
                zones.header.vc_id(),
                frame,
                zones.data_field_start,
                zones.data_field_end,
            )?;
            zones.data_field_start = start;
            zones.data_field_end = end;
        }
        let frame: &'raw [u8] = frame;
        let data_zone = decoder.decode_data_field(frame, &zones)?;
        Ok(TransferFrame::new(frame, zones, data_zone))
    }
}
