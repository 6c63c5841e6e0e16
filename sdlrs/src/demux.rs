//! Downlink demultiplexer.
//!
//! The [DownlinkDemultiplexer] is the entry point for raw frames of one downlink master channel.
//! It decodes each frame, hands the CLCW found in the operational control field to the
//! registered [ClcwConsumer]s and routes the frame to the packet reassembler of its virtual
//! channel.
use std::boxed::Box;
use std::sync::Arc;
use std::vec::Vec;

use hashbrown::HashMap;

use crate::{
    config::{DownlinkConfig, ServiceType},
    cop1::Clcw,
    frame::FrameDecoder,
    packet::{PacketSink, ReassemblerStats, VcPacketReassembler},
    security::SecurityTransform,
    VcId,
};

/// Receiver of the CLCWs found in downlink frames.
pub trait ClcwConsumer: Send + Sync {
    fn on_clcw(&self, clcw: u32);
}

impl ClcwConsumer for crossbeam_channel::Sender<u32> {
    fn on_clcw(&self, clcw: u32) {
        if self.try_send(clcw).is_err() {
            log::warn!("CLCW {:#010x} dropped, consumer queue full or closed", clcw);
        }
    }
}

/// Counters of a [DownlinkDemultiplexer].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DemuxStats {
    pub frames: u64,
    pub corrupted_frames: u64,
    /// Idle frames which do not belong to a configured virtual channel.
    pub idle_frames: u64,
    pub unknown_vc_frames: u64,
    pub clcws: u64,
    pub sync_losses: u64,
}

pub struct DownlinkDemultiplexer<Sink: PacketSink> {
    decoder: FrameDecoder,
    security: Option<Arc<dyn SecurityTransform>>,
    reassemblers: HashMap<VcId, VcPacketReassembler<Sink>>,
    clcw_consumers: Vec<Box<dyn ClcwConsumer>>,
    stats: DemuxStats,
}

impl<Sink: PacketSink + Clone> DownlinkDemultiplexer<Sink> {
    /// Creates a demultiplexer with one reassembler per configured virtual channel. All of them
    /// deliver their packets to a clone of the passed sink.
    pub fn new(config: &DownlinkConfig, sink: Sink) -> Self {
        let mut decoder = FrameDecoder::new(config.decoder);
        let mut reassemblers = HashMap::new();
        for vc_config in &config.virtual_channels {
            if vc_config.service == ServiceType::VcAccess {
                decoder.set_vc_access(vc_config.vc_id, true);
            }
            reassemblers.insert(
                vc_config.vc_id,
                VcPacketReassembler::new(vc_config, sink.clone()),
            );
        }
        Self {
            decoder,
            security: None,
            reassemblers,
            clcw_consumers: Vec::new(),
            stats: DemuxStats::default(),
        }
    }
}

impl<Sink: PacketSink> DownlinkDemultiplexer<Sink> {
    /// Verifies and decrypts the data field of all frames except idle frames.
    pub fn with_security(mut self, security: Arc<dyn SecurityTransform>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn add_clcw_consumer(&mut self, consumer: Box<dyn ClcwConsumer>) {
        self.clcw_consumers.push(consumer);
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    pub fn reassembler(&self, vc_id: VcId) -> Option<&VcPacketReassembler<Sink>> {
        self.reassemblers.get(&vc_id)
    }

    pub fn reassembler_stats(&self, vc_id: VcId) -> Option<ReassemblerStats> {
        self.reassemblers.get(&vc_id).map(|r| r.stats())
    }

    /// Enables or disables the packet extraction of a virtual channel. Returns false if the
    /// virtual channel is not configured.
    pub fn set_vc_enabled(&mut self, vc_id: VcId, enabled: bool) -> bool {
        match self.reassemblers.get_mut(&vc_id) {
            Some(reassembler) => {
                reassembler.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Handles one raw frame. Corrupted frames are counted and dropped. The buffer is modified in
    /// place if a security transform is used.
    pub fn handle_frame(&mut self, raw: &mut [u8]) {
        self.stats.frames += 1;
        let decoded = match &self.security {
            Some(security) => self.decoder.decode_secured(raw, security.as_ref()),
            None => self.decoder.decode(raw),
        };
        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.corrupted_frames += 1;
                log::warn!("dropping corrupted frame: {}", e);
                // The frame may belong to any virtual channel.
                for reassembler in self.reassemblers.values_mut() {
                    if !reassembler.detects_frame_loss() {
                        reassembler.reset();
                    }
                }
                return;
            }
        };
        if let Some(ocf) = frame.ocf() {
            if Clcw::from(ocf).control_word_type() {
                log::trace!("ignoring OCF {:#010x} which is not a CLCW", ocf);
            } else {
                self.stats.clcws += 1;
                for consumer in &self.clcw_consumers {
                    consumer.on_clcw(ocf);
                }
            }
        }
        match self.reassemblers.get_mut(&frame.vc_id()) {
            Some(reassembler) => reassembler.handle_frame(&frame),
            None if frame.is_idle() => self.stats.idle_frames += 1,
            None => {
                self.stats.unknown_vc_frames += 1;
                log::debug!("dropping frame of unconfigured VC {}", frame.vc_id());
            }
        }
    }

    /// Drops all incomplete packets after the frame synchronization was lost.
    pub fn sync_lost(&mut self) {
        log::info!("frame synchronization lost");
        self.stats.sync_losses += 1;
        for reassembler in self.reassemblers.values_mut() {
            reassembler.reset();
        }
    }
}
