//! Managed parameters of the downlink and uplink channels.
//!
//! The configuration is read-only once the components were created, with the exception of the
//! FOP-1 parameters which can be changed at run time through the FOP-1 engine handle.
use core::time::Duration;

#[cfg(feature = "alloc")]
use alloc::vec::Vec;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{codec::crc::ErrorDetection, VcId};

/// Virtual channel ID of idle frames for AOS and USLP.
pub const IDLE_VC_ID: VcId = 63;
/// Virtual channel ID 7 is commonly used for idle frames on TM links.
pub const TM_IDLE_VC_ID: VcId = 7;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FrameFormat {
    #[default]
    Tm,
    Aos,
    Uslp,
}

impl FrameFormat {
    /// Transfer frame version number of the format.
    pub const fn version(&self) -> u8 {
        match self {
            FrameFormat::Tm => 0,
            FrameFormat::Aos => 1,
            FrameFormat::Uslp => 12,
        }
    }
}

/// Data carried by a downlink virtual channel.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ServiceType {
    /// Space packets or encapsulation packets, possibly spanning multiple frames.
    #[default]
    Packet,
    /// Frames are idle fill only and are dropped.
    Idle,
    /// The complete data field is handed to the user without interpretation.
    VcAccess,
}

/// How the packets of a [ServiceType::Packet] virtual channel are laid out in the frames.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PacketDecoding {
    /// Packets may span multiple frames.
    #[default]
    Segmented,
    /// One packet per frame, starting at the first header pointer.
    Single,
    /// Multiple packets per frame, none of them continues in the next frame.
    Multiple,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct VirtualChannelConfig {
    pub vc_id: VcId,
    pub service: ServiceType,
    /// Maximum length of a reassembled packet including its header.
    pub max_packet_length: usize,
    /// Remove the header of encapsulation packets before handing them to the packet sink.
    pub strip_encapsulation_header: bool,
    pub decoding: PacketDecoding,
}

impl VirtualChannelConfig {
    pub fn new(vc_id: VcId, service: ServiceType) -> Self {
        Self {
            vc_id,
            service,
            ..Default::default()
        }
    }
}

impl Default for VirtualChannelConfig {
    fn default() -> Self {
        Self {
            vc_id: 0,
            service: ServiceType::Packet,
            max_packet_length: 65542,
            strip_encapsulation_header: false,
            decoding: PacketDecoding::Segmented,
        }
    }
}

/// Parameters required to decode the frames of one downlink master channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FrameDecoderConfig {
    pub format: FrameFormat,
    /// Fixed frame length for TM and AOS. For USLP this is the maximum frame length, the
    /// actual length is taken from the frame header.
    pub frame_length: usize,
    pub error_detection: ErrorDetection,
    /// AOS only: the frame header error control field is present.
    pub aos_header_fec: bool,
    /// AOS and USLP: length of the insert zone which is skipped.
    pub insert_zone_length: usize,
    /// AOS only: the operational control field is present. TM and USLP signal it in the header.
    pub ocf_present: bool,
    /// USLP only: length of truncated frames.
    pub uslp_truncated_frame_length: usize,
    pub idle_vc_id: VcId,
}

impl Default for FrameDecoderConfig {
    fn default() -> Self {
        Self {
            format: FrameFormat::Tm,
            frame_length: 1115,
            error_detection: ErrorDetection::Crc16,
            aos_header_fec: false,
            insert_zone_length: 0,
            ocf_present: false,
            uslp_truncated_frame_length: 0,
            idle_vc_id: TM_IDLE_VC_ID,
        }
    }
}

impl FrameDecoderConfig {
    pub fn new_tm(frame_length: usize, error_detection: ErrorDetection) -> Self {
        Self {
            format: FrameFormat::Tm,
            frame_length,
            error_detection,
            ..Default::default()
        }
    }

    pub fn new_aos(frame_length: usize, error_detection: ErrorDetection, ocf_present: bool) -> Self {
        Self {
            format: FrameFormat::Aos,
            frame_length,
            error_detection,
            ocf_present,
            idle_vc_id: IDLE_VC_ID,
            ..Default::default()
        }
    }

    pub fn new_uslp(max_frame_length: usize, error_detection: ErrorDetection) -> Self {
        Self {
            format: FrameFormat::Uslp,
            frame_length: max_frame_length,
            error_detection,
            idle_vc_id: IDLE_VC_ID,
            ..Default::default()
        }
    }
}

/// Configuration of a downlink master channel and its virtual channels.
#[cfg(feature = "alloc")]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DownlinkConfig {
    pub decoder: FrameDecoderConfig,
    pub virtual_channels: Vec<VirtualChannelConfig>,
}

/// Behaviour of the FOP-1 when the timer expires and the transmission limit was reached.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TimeoutType {
    /// Raise the T1 alert and go back to the initial state.
    #[default]
    GoToInitial,
    /// Suspend the FOP-1. It can be resumed later without loss of sequence synchronization.
    Suspend,
}

/// Managed parameters of one uplink virtual channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct UplinkVcConfig {
    pub vc_id: VcId,
    pub max_frame_length: usize,
    /// Use the COP-1 for this virtual channel. Without it, all frames are sent as they are.
    pub cop1_enabled: bool,
    /// When the COP-1 is not active, send all commands as BD frames.
    pub bypass_all: bool,
    /// BD frames always overtake the AD frames waiting in the queue.
    pub bd_absolute_priority: bool,
    /// Allow packing more than one command into one frame.
    pub multiple_commands_per_frame: bool,
    /// FOP sliding window width K.
    pub window_width: u8,
    /// Initial value of the retransmission timer.
    pub t1_initial: Duration,
    pub tx_limit: u32,
    pub timeout_type: TimeoutType,
    /// Initiate AD with CLCW check when the engine starts, waiting for the given time.
    pub initial_clcw_wait: Option<Duration>,
    /// Priority or polling vector weight used by the multiplexer.
    pub priority: u32,
}

impl UplinkVcConfig {
    pub fn new(vc_id: VcId) -> Self {
        Self {
            vc_id,
            ..Default::default()
        }
    }
}

impl Default for UplinkVcConfig {
    fn default() -> Self {
        Self {
            vc_id: 0,
            max_frame_length: 1024,
            cop1_enabled: true,
            bypass_all: false,
            bd_absolute_priority: false,
            multiple_commands_per_frame: false,
            window_width: 10,
            t1_initial: Duration::from_secs(3),
            tx_limit: 3,
            timeout_type: TimeoutType::GoToInitial,
            initial_clcw_wait: None,
            priority: 1,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MultiplexingScheme {
    /// The frame with the oldest generation time is sent first.
    #[default]
    Fifo,
    /// The virtual channel with the highest priority is served first.
    AbsolutePriority,
    /// Each virtual channel may send `priority` consecutive frames before the next one is polled.
    PollingVector,
}

/// Configuration of the uplink master channel.
#[cfg(feature = "alloc")]
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct UplinkConfig {
    pub spacecraft_id: crate::SpacecraftId,
    pub error_detection: ErrorDetection,
    pub scheme: MultiplexingScheme,
    pub virtual_channels: Vec<UplinkVcConfig>,
}

#[cfg(feature = "alloc")]
impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            spacecraft_id: 0,
            error_detection: ErrorDetection::Crc16,
            scheme: MultiplexingScheme::Fifo,
            virtual_channels: Vec::new(),
        }
    }
}
