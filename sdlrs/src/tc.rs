//! TC Space Data Link Protocol frames (CCSDS 232.0-B-4).
//!
//! Uplink frames are created with a [TcFrameFactory]: [TcFrameFactory::make_frame] allocates a
//! frame with room for the header, the optional security header and trailer and the frame
//! error control field. The caller fills the data field and passes the frame to
//! [TcFrameFactory::encode_frame] once the frame sequence number is known.
use alloc::{sync::Arc, vec, vec::Vec};
use core::fmt::Debug;

use smallvec::SmallVec;

use crate::{
    codec::{bch, crc::ErrorDetection, read_be_u16, write_be_u16},
    security::{SecurityError, SecurityTransform},
    CommandId, SpacecraftId, VcId,
};

pub const TC_PRIMARY_HEADER_LEN: usize = 5;
/// The frame length field has 10 bits.
pub const TC_MAX_FRAME_LENGTH: usize = 1024;

/// Control command data of the Unlock directive.
pub const BC_UNLOCK: [u8; 1] = [0x00];
/// First two bytes of the Set V(R) directive, followed by the new V(R).
pub const BC_SET_VR_PREFIX: [u8; 2] = [0x82, 0x00];

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TcFrameError {
    #[error("frame length {length} exceeds maximum frame length {max}")]
    FrameTooLong { length: usize, max: usize },
    #[error("invalid virtual channel ID {0}")]
    InvalidVcId(VcId),
    #[error("security error: {0}")]
    Security(#[from] SecurityError),
}

/// Uplink transfer frame.
#[derive(Clone, PartialEq, Eq)]
pub struct TcTransferFrame {
    spacecraft_id: SpacecraftId,
    vc_id: VcId,
    frame_seq: u8,
    bypass: bool,
    cmd_control: bool,
    buf: Vec<u8>,
    data_start: usize,
    data_end: usize,
    commands: SmallVec<[CommandId; 4]>,
    generation_time: u64,
}

impl Debug for TcTransferFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcTransferFrame")
            .field("vc_id", &self.vc_id)
            .field("frame_seq", &self.frame_seq)
            .field("bypass", &self.bypass)
            .field("cmd_control", &self.cmd_control)
            .field("len", &self.buf.len())
            .field("commands", &self.commands)
            .finish()
    }
}

impl TcTransferFrame {
    pub fn spacecraft_id(&self) -> SpacecraftId {
        self.spacecraft_id
    }

    pub fn vc_id(&self) -> VcId {
        self.vc_id
    }

    pub fn frame_seq(&self) -> u8 {
        self.frame_seq
    }

    pub fn set_frame_seq(&mut self, frame_seq: u8) {
        self.frame_seq = frame_seq;
    }

    /// BD (type B) frames bypass the FARM acceptance checks on board.
    pub fn bypass(&self) -> bool {
        self.bypass
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    /// BC frames carry control commands for the FARM.
    pub fn cmd_control(&self) -> bool {
        self.cmd_control
    }

    pub fn set_cmd_control(&mut self, cmd_control: bool) {
        self.cmd_control = cmd_control;
    }

    /// Creation time of the frame in milliseconds. Used by the multiplexer to send the oldest
    /// frame first.
    pub fn generation_time(&self) -> u64 {
        self.generation_time
    }

    pub fn data_start(&self) -> usize {
        self.data_start
    }

    pub fn data_end(&self) -> usize {
        self.data_end
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.data_start..self.data_end]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data_start..self.data_end]
    }

    /// Complete frame. Only valid after the frame was encoded.
    pub fn raw(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Commands carried by this frame. Empty for BC frames.
    pub fn commands(&self) -> &[CommandId] {
        &self.commands
    }

    pub fn add_command(&mut self, command_id: CommandId) {
        self.commands.push(command_id);
    }

    /// Encodes the (already encoded) frame into a CLTU for the physical layer.
    pub fn to_cltu(&self, randomize: bool) -> Vec<u8> {
        bch::encode_cltu(&self.buf, randomize)
    }
}

/// Reads the fields of an encoded TC frame header. Returns the spacecraft ID, virtual channel
/// ID, bypass flag, command control flag, frame length and frame sequence number.
pub fn parse_tc_header(buf: &[u8]) -> Option<(SpacecraftId, VcId, bool, bool, usize, u8)> {
    if buf.len() < TC_PRIMARY_HEADER_LEN {
        return None;
    }
    let first_word = read_be_u16(buf);
    let second_word = read_be_u16(&buf[2..4]);
    Some((
        first_word & 0x3FF,
        (second_word >> 10) as u8,
        (first_word >> 13) & 1 == 1,
        (first_word >> 12) & 1 == 1,
        (second_word & 0x3FF) as usize + 1,
        buf[4],
    ))
}

/// Creates and encodes TC transfer frames of one master channel.
#[derive(Clone)]
pub struct TcFrameFactory {
    spacecraft_id: SpacecraftId,
    error_detection: ErrorDetection,
    max_frame_length: usize,
    security: Option<Arc<dyn SecurityTransform>>,
}

impl Debug for TcFrameFactory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcFrameFactory")
            .field("spacecraft_id", &self.spacecraft_id)
            .field("error_detection", &self.error_detection)
            .field("max_frame_length", &self.max_frame_length)
            .field("security", &self.security.is_some())
            .finish()
    }
}

impl TcFrameFactory {
    /// Creates a factory. TC frames only support CRC-16 as frame error control, so
    /// [ErrorDetection::Crc32] is treated like [ErrorDetection::Crc16].
    pub fn new(spacecraft_id: SpacecraftId, error_detection: ErrorDetection) -> Self {
        let error_detection = match error_detection {
            ErrorDetection::None => ErrorDetection::None,
            _ => ErrorDetection::Crc16,
        };
        Self {
            spacecraft_id: spacecraft_id & 0x3FF,
            error_detection,
            max_frame_length: TC_MAX_FRAME_LENGTH,
            security: None,
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length.min(TC_MAX_FRAME_LENGTH);
        self
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityTransform>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn spacecraft_id(&self) -> SpacecraftId {
        self.spacecraft_id
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    fn security_lens(&self, vc_id: VcId) -> (usize, usize) {
        match &self.security {
            Some(security) => (security.header_len(vc_id), security.trailer_len(vc_id)),
            None => (0, 0),
        }
    }

    /// Number of bytes a frame adds on top of its data: header, security header and trailer and
    /// frame error control field.
    pub fn framing_length(&self, vc_id: VcId) -> usize {
        let (sec_header_len, sec_trailer_len) = self.security_lens(vc_id);
        TC_PRIMARY_HEADER_LEN + sec_header_len + sec_trailer_len + self.error_detection.trailer_len()
    }

    /// Allocates a frame for the given data length. The data field is zero initialized.
    pub fn make_frame(&self, vc_id: VcId, data_len: usize, generation_time: u64) -> TcTransferFrame {
        let (sec_header_len, _) = self.security_lens(vc_id);
        let data_start = TC_PRIMARY_HEADER_LEN + sec_header_len;
        TcTransferFrame {
            spacecraft_id: self.spacecraft_id,
            vc_id,
            frame_seq: 0,
            bypass: false,
            cmd_control: false,
            buf: vec![0; data_len + self.framing_length(vc_id)],
            data_start,
            data_end: data_start + data_len,
            commands: SmallVec::new(),
            generation_time,
        }
    }

    /// Creates a BC frame with the Unlock directive.
    pub fn make_unlock_frame(&self, vc_id: VcId, generation_time: u64) -> TcTransferFrame {
        self.make_bc_frame(vc_id, &BC_UNLOCK, generation_time)
    }

    /// Creates a BC frame with the Set V(R) directive.
    pub fn make_set_vr_frame(&self, vc_id: VcId, vr: u8, generation_time: u64) -> TcTransferFrame {
        let data = [BC_SET_VR_PREFIX[0], BC_SET_VR_PREFIX[1], vr];
        self.make_bc_frame(vc_id, &data, generation_time)
    }

    fn make_bc_frame(&self, vc_id: VcId, data: &[u8], generation_time: u64) -> TcTransferFrame {
        let mut frame = self.make_frame(vc_id, data.len(), generation_time);
        frame.data_mut().copy_from_slice(data);
        frame.bypass = true;
        frame.cmd_control = true;
        frame
    }

    /// Writes the primary header, applies the security transform and computes the frame error
    /// control field.
    pub fn encode_frame(&self, frame: &mut TcTransferFrame) -> Result<(), TcFrameError> {
        let length = frame.buf.len();
        if length > self.max_frame_length {
            return Err(TcFrameError::FrameTooLong {
                length,
                max: self.max_frame_length,
            });
        }
        if frame.vc_id > 0x3F {
            return Err(TcFrameError::InvalidVcId(frame.vc_id));
        }
        // Version number 00 and two spare bits.
        let first_word = ((frame.bypass as u16) << 13)
            | ((frame.cmd_control as u16) << 12)
            | (self.spacecraft_id & 0x3FF);
        write_be_u16(&mut frame.buf, first_word);
        let second_word = ((frame.vc_id as u16) << 10) | ((length - 1) as u16 & 0x3FF);
        write_be_u16(&mut frame.buf[2..4], second_word);
        frame.buf[4] = frame.frame_seq;
        if let Some(security) = &self.security {
            let (sec_header_len, sec_trailer_len) = self.security_lens(frame.vc_id);
            security.apply(
                frame.vc_id,
                &mut frame.buf,
                frame.data_start - sec_header_len,
                frame.data_end + sec_trailer_len,
            )?;
        }
        self.error_detection.write_trailer(&mut frame.buf);
        Ok(())
    }
}
