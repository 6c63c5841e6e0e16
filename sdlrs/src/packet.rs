//! Packet reassembly for downlink virtual channels.
//!
//! Packets are carried in the data field of consecutive frames of a virtual channel and may
//! span multiple frames. The [PacketDecoder] reconstructs packets from a byte stream and the
//! [VcPacketReassembler] feeds the data of each frame to the decoder, using the first header
//! pointer of the frame to resynchronize and the frame count to detect frame loss.
//!
//! Two packet formats are supported, distinguished by the packet version number in the three
//! most significant bits of the first byte:
//!
//!  - CCSDS space packets (version `000`) with a 6 byte header.
//!  - Encapsulation packets (version `111`, CCSDS 133.1-B) with a 1, 2, 4 or 8 byte header.
use alloc::vec::Vec;

use spacepackets::{CcsdsPacket, SpHeader};

use crate::{
    config::{PacketDecoding, ServiceType, VirtualChannelConfig},
    frame::TransferFrame,
    VcId,
};

/// APID of idle space packets.
pub const IDLE_APID: u16 = 0x7FF;
pub const SPACE_PACKET_VERSION: u8 = 0b000;
pub const ENCAPSULATION_PACKET_VERSION: u8 = 0b111;
/// Header lengths of encapsulation packets, indexed by the length of length field.
pub const ENCAPSULATION_HEADER_LENGTHS: [usize; 4] = [1, 2, 4, 8];

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketDecodeError {
    #[error("unsupported packet version number {0:#05b}")]
    UnsupportedPacketVersion(u8),
    #[error("packet length {length} exceeds maximum packet length {max}")]
    PacketTooLong { length: usize, max: usize },
    #[error("packet length {length} is shorter than the packet header")]
    PacketTooShort { length: usize },
}

/// Generic trait for objects which accept reassembled packets.
pub trait PacketSink: Send {
    type Error: core::fmt::Debug;
    fn send_packet(&self, vc_id: VcId, packet: &[u8]) -> Result<(), Self::Error>;
}

/// Packet reassembled from a downlink virtual channel, stored on the heap.
#[derive(Debug, PartialEq, Eq, Clone, derive_new::new)]
pub struct PacketFromVc {
    pub vc_id: VcId,
    pub packet: Vec<u8>,
}

#[cfg(feature = "std")]
pub mod std_mod {
    use std::sync::mpsc;

    use super::*;
    use crate::queue::GenericSendError;

    impl PacketSink for mpsc::Sender<PacketFromVc> {
        type Error = GenericSendError;

        fn send_packet(&self, vc_id: VcId, packet: &[u8]) -> Result<(), Self::Error> {
            self.send(PacketFromVc::new(vc_id, packet.to_vec()))?;
            Ok(())
        }
    }

    impl PacketSink for mpsc::SyncSender<PacketFromVc> {
        type Error = GenericSendError;

        fn send_packet(&self, vc_id: VcId, packet: &[u8]) -> Result<(), Self::Error> {
            self.try_send(PacketFromVc::new(vc_id, packet.to_vec()))?;
            Ok(())
        }
    }

    impl PacketSink for crossbeam_channel::Sender<PacketFromVc> {
        type Error = GenericSendError;

        fn send_packet(&self, vc_id: VcId, packet: &[u8]) -> Result<(), Self::Error> {
            self.try_send(PacketFromVc::new(vc_id, packet.to_vec()))?;
            Ok(())
        }
    }
}

/// Header length of the packet which starts with the given byte.
pub fn packet_header_len(first_byte: u8) -> Result<usize, PacketDecodeError> {
    match first_byte >> 5 {
        SPACE_PACKET_VERSION => Ok(6),
        ENCAPSULATION_PACKET_VERSION => Ok(ENCAPSULATION_HEADER_LENGTHS[(first_byte & 0b11) as usize]),
        version => Err(PacketDecodeError::UnsupportedPacketVersion(version)),
    }
}

/// Reconstructs packets from a byte stream which is passed in arbitrary chunks.
#[derive(Debug)]
pub struct PacketDecoder {
    max_packet_length: usize,
    strip_encapsulation_header: bool,
    buf: Vec<u8>,
    header_len: usize,
    packet_len: Option<usize>,
}

impl PacketDecoder {
    pub fn new(max_packet_length: usize) -> Self {
        Self {
            max_packet_length,
            strip_encapsulation_header: false,
            buf: Vec::new(),
            header_len: 0,
            packet_len: None,
        }
    }

    pub fn max_packet_length(&self) -> usize {
        self.max_packet_length
    }

    /// Deliver encapsulation packets without their header.
    pub fn set_strip_encapsulation_header(&mut self, strip: bool) {
        self.strip_encapsulation_header = strip;
    }

    pub fn strip_encapsulation_header(&self) -> bool {
        self.strip_encapsulation_header
    }

    /// A packet was started but is not complete yet.
    pub fn has_incomplete_packet(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drops the incomplete packet.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.header_len = 0;
        self.packet_len = None;
    }

    /// Processes the next chunk of the stream. The callback is invoked for each complete packet
    /// which is not an idle packet.
    ///
    /// On error, the decoder is reset and the stream is out of sync until the next packet start
    /// is known.
    pub fn process(
        &mut self,
        data: &[u8],
        on_packet: &mut dyn FnMut(&[u8]),
    ) -> Result<(), PacketDecodeError> {
        let result = self.process_inner(data, on_packet);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn process_inner(
        &mut self,
        mut data: &[u8],
        on_packet: &mut dyn FnMut(&[u8]),
    ) -> Result<(), PacketDecodeError> {
        while !data.is_empty() {
            let packet_len = match self.packet_len {
                Some(packet_len) => packet_len,
                None => {
                    if self.buf.is_empty() {
                        self.header_len = packet_header_len(data[0])?;
                    }
                    let take = (self.header_len - self.buf.len()).min(data.len());
                    self.buf.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.buf.len() < self.header_len {
                        return Ok(());
                    }
                    let packet_len = self.decode_packet_len()?;
                    self.packet_len = Some(packet_len);
                    packet_len
                }
            };
            let take = (packet_len - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == packet_len {
                self.deliver(on_packet);
            }
        }
        Ok(())
    }

    fn is_space_packet(&self) -> bool {
        self.buf[0] >> 5 == SPACE_PACKET_VERSION
    }

    fn decode_packet_len(&self) -> Result<usize, PacketDecodeError> {
        let packet_len = if self.is_space_packet() {
            let (sp_header, _) = SpHeader::from_be_bytes(&self.buf)
                .map_err(|_| PacketDecodeError::PacketTooShort { length: self.buf.len() })?;
            sp_header.total_len()
        } else {
            match self.buf[0] & 0b11 {
                0 => 1,
                1 => self.buf[1] as usize,
                2 => u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize,
                _ => u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                    as usize,
            }
        };
        if packet_len < self.header_len {
            return Err(PacketDecodeError::PacketTooShort { length: packet_len });
        }
        if packet_len > self.max_packet_length {
            return Err(PacketDecodeError::PacketTooLong {
                length: packet_len,
                max: self.max_packet_length,
            });
        }
        Ok(packet_len)
    }

    fn is_idle_packet(&self) -> bool {
        if self.is_space_packet() {
            match SpHeader::from_be_bytes(&self.buf) {
                Ok((sp_header, _)) => sp_header.apid() == IDLE_APID,
                Err(_) => false,
            }
        } else {
            // Protocol ID 0 marks fill data.
            (self.buf[0] >> 2) & 0b111 == 0
        }
    }

    fn deliver(&mut self, on_packet: &mut dyn FnMut(&[u8])) {
        if !self.is_idle_packet() {
            if self.strip_encapsulation_header && !self.is_space_packet() {
                on_packet(&self.buf[self.header_len..]);
            } else {
                on_packet(&self.buf);
            }
        }
        self.reset();
    }
}

/// Counters of a [VcPacketReassembler].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ReassemblerStats {
    pub frames: u64,
    pub idle_frames: u64,
    pub packets: u64,
    /// Frame loss events, including gaps with an indeterminate number of lost frames.
    pub frame_loss_events: u64,
    pub dropped_incomplete_packets: u64,
    pub decode_errors: u64,
    pub sink_errors: u64,
    /// Frames dropped while the virtual channel was disabled.
    pub disabled_frames: u64,
}

/// Reassembles the packets of one downlink virtual channel.
pub struct VcPacketReassembler<Sink: PacketSink> {
    vc_id: VcId,
    service: ServiceType,
    decoding: PacketDecoding,
    enabled: bool,
    /// The last frame carried a frame count.
    counts_frames: bool,
    decoder: PacketDecoder,
    sink: Sink,
    last_frame_count: Option<u64>,
    stats: ReassemblerStats,
}

impl<Sink: PacketSink> VcPacketReassembler<Sink> {
    pub fn new(config: &VirtualChannelConfig, sink: Sink) -> Self {
        let mut decoder = PacketDecoder::new(config.max_packet_length);
        decoder.set_strip_encapsulation_header(config.strip_encapsulation_header);
        Self {
            vc_id: config.vc_id,
            service: config.service,
            decoding: config.decoding,
            enabled: true,
            counts_frames: true,
            decoder,
            sink,
            last_frame_count: None,
            stats: ReassemblerStats::default(),
        }
    }

    delegate::delegate! {
        to self.decoder {
            pub fn max_packet_length(&self) -> usize;
            pub fn has_incomplete_packet(&self) -> bool;
        }
    }

    pub fn vc_id(&self) -> VcId {
        self.vc_id
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Frames of a disabled virtual channel are dropped without being looked at.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            log::info!(
                "VC {}: packet reassembly {}",
                self.vc_id,
                if enabled { "enabled" } else { "disabled" }
            );
        }
        self.enabled = enabled;
    }

    pub fn sink(&self) -> &Sink {
        &self.sink
    }

    pub fn last_frame_count(&self) -> Option<u64> {
        self.last_frame_count
    }

    /// Returns false if the frames of the virtual channel carry no frame count, which is allowed
    /// for USLP. Lost frames then go unnoticed.
    pub fn detects_frame_loss(&self) -> bool {
        self.counts_frames
    }

    /// Drops the incomplete packet, for example because the frame synchronization was lost.
    pub fn reset(&mut self) {
        if self.decoder.has_incomplete_packet() {
            log::warn!(
                "VC {}: incomplete packet dropped after loss of synchronization",
                self.vc_id
            );
            self.stats.dropped_incomplete_packets += 1;
        }
        self.decoder.reset();
        self.last_frame_count = None;
    }

    pub fn handle_frame(&mut self, frame: &TransferFrame) {
        if !self.enabled {
            log::trace!(
                "VC {}: dropping frame with count {}, the virtual channel is disabled",
                self.vc_id,
                frame.vc_frame_count()
            );
            self.stats.disabled_frames += 1;
            return;
        }
        self.stats.frames += 1;
        self.counts_frames = frame.header().vc_frame_count_modulus() > 1;
        if frame.is_idle() {
            log::trace!(
                "VC {}: dropping idle frame with count {}",
                self.vc_id,
                frame.vc_frame_count()
            );
            self.last_frame_count = Some(frame.vc_frame_count());
            self.stats.idle_frames += 1;
            return;
        }
        log::trace!(
            "VC {}: processing frame with count {}, FHP {:?}, data {}..{}",
            self.vc_id,
            frame.vc_frame_count(),
            frame.first_header_pointer(),
            frame.data_start(),
            frame.data_end()
        );
        let frame_loss = frame.lost_frames_count(self.last_frame_count);
        if self.last_frame_count.is_some() && frame_loss.frames_lost() {
            self.stats.frame_loss_events += 1;
        }
        self.last_frame_count = Some(frame.vc_frame_count());
        match self.service {
            ServiceType::Idle => {
                self.stats.idle_frames += 1;
            }
            ServiceType::VcAccess => {
                self.stats.packets += 1;
                if let Err(e) = self.sink.send_packet(self.vc_id, frame.data()) {
                    log::warn!("VC {}: sending frame data failed: {:?}", self.vc_id, e);
                    self.stats.sink_errors += 1;
                }
            }
            ServiceType::Packet => {
                let result = match self.decoding {
                    PacketDecoding::Segmented => self.reassemble(frame, frame_loss.frames_lost()),
                    PacketDecoding::Single | PacketDecoding::Multiple => {
                        self.decode_unsegmented(frame)
                    }
                };
                if let Err(e) = result {
                    log::warn!("VC {}: packet decoding failed: {}", self.vc_id, e);
                    self.stats.decode_errors += 1;
                    self.decoder.reset();
                }
            }
        }
    }

    fn reassemble(
        &mut self,
        frame: &TransferFrame,
        frames_lost: bool,
    ) -> Result<(), PacketDecodeError> {
        let Self {
            vc_id,
            decoder,
            sink,
            stats,
            ..
        } = self;
        let vc_id = *vc_id;
        let raw = frame.raw();
        let mut on_packet = |packet: &[u8]| {
            stats.packets += 1;
            if let Err(e) = sink.send_packet(vc_id, packet) {
                log::warn!("VC {}: sending packet failed: {:?}", vc_id, e);
                stats.sink_errors += 1;
            }
        };
        let mut dropped = 0;
        if decoder.has_incomplete_packet() {
            if frames_lost {
                log::warn!("VC {}: incomplete packet dropped because of frame loss", vc_id);
                decoder.reset();
                dropped += 1;
            } else {
                let end = frame.first_header_pointer().unwrap_or(frame.data_end());
                decoder.process(&raw[frame.data_start()..end], &mut on_packet)?;
            }
        }
        if let Some(packet_start) = frame.first_header_pointer() {
            if decoder.has_incomplete_packet() {
                log::warn!(
                    "VC {}: incomplete packet decoded when reaching the beginning of another packet",
                    vc_id
                );
                decoder.reset();
                dropped += 1;
            }
            decoder.process(&raw[packet_start..frame.data_end()], &mut on_packet)?;
        }
        stats.dropped_incomplete_packets += dropped;
        Ok(())
    }

    /// Decodes the packets of a frame whose packets never continue in the next frame.
    fn decode_unsegmented(&mut self, frame: &TransferFrame) -> Result<(), PacketDecodeError> {
        let Some(packet_start) = frame.first_header_pointer() else {
            return Ok(());
        };
        let single = self.decoding == PacketDecoding::Single;
        let Self {
            vc_id,
            decoder,
            sink,
            stats,
            ..
        } = self;
        let vc_id = *vc_id;
        let mut delivered = 0;
        let mut on_packet = |packet: &[u8]| {
            if single && delivered > 0 {
                return;
            }
            delivered += 1;
            stats.packets += 1;
            if let Err(e) = sink.send_packet(vc_id, packet) {
                log::warn!("VC {}: sending packet failed: {:?}", vc_id, e);
                stats.sink_errors += 1;
            }
        };
        let result = decoder.process(&frame.raw()[packet_start..frame.data_end()], &mut on_packet);
        if single && delivered > 0 {
            // Whatever follows the packet is fill.
            decoder.reset();
            return Ok(());
        }
        if decoder.has_incomplete_packet() {
            log::warn!("VC {}: packet truncated at the end of the frame", vc_id);
            stats.dropped_incomplete_packets += 1;
        }
        decoder.reset();
        result
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;
    use std::sync::Mutex;
    use std::vec;
    use std::vec::Vec;

    use super::*;
    use crate::{
        codec::crc::ErrorDetection,
        config::FrameDecoderConfig,
        frame::{tm::TM_FHP_NO_PACKET_START, FrameDecoder, TmFrameEncoder, TmPrimaryHeader},
    };

    #[derive(Default)]
    struct PacketCollector(Mutex<Vec<(VcId, Vec<u8>)>>);

    impl PacketSink for PacketCollector {
        type Error = ();

        fn send_packet(&self, vc_id: VcId, packet: &[u8]) -> Result<(), Self::Error> {
            self.0.lock().unwrap().push((vc_id, packet.to_vec()));
            Ok(())
        }
    }

    impl PacketCollector {
        fn packets(&self) -> Vec<Vec<u8>> {
            self.0.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
        }
    }

    fn space_packet(apid: u16, data_len: usize, fill: u8) -> Vec<u8> {
        let mut packet = vec![fill; 6 + data_len];
        packet[0] = ((apid >> 8) & 0x07) as u8 | 0x08;
        packet[1] = apid as u8;
        packet[2] = 0xC0;
        packet[3] = 0;
        packet[4..6].copy_from_slice(&((data_len - 1) as u16).to_be_bytes());
        packet
    }

    fn collect(decoder: &mut PacketDecoder, chunks: &[&[u8]]) -> Result<Vec<Vec<u8>>, PacketDecodeError> {
        let packets = RefCell::new(Vec::new());
        for chunk in chunks {
            decoder.process(chunk, &mut |p| packets.borrow_mut().push(p.to_vec()))?;
        }
        Ok(packets.into_inner())
    }

    #[test]
    fn test_space_packets_in_chunks() {
        let mut decoder = PacketDecoder::new(1024);
        let first = space_packet(0x10, 20, 1);
        let second = space_packet(0x11, 3, 2);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        let packets = collect(&mut decoder, &[&stream[..4], &stream[4..22], &stream[22..]]).unwrap();
        assert_eq!(packets, vec![first, second]);
        assert!(!decoder.has_incomplete_packet());
    }

    #[test]
    fn test_idle_space_packet_dropped() {
        let mut decoder = PacketDecoder::new(1024);
        let idle = space_packet(IDLE_APID, 10, 0);
        let packet = space_packet(3, 2, 7);
        let packets = collect(&mut decoder, &[&idle, &packet]).unwrap();
        assert_eq!(packets, vec![packet]);
    }

    #[test]
    fn test_encapsulation_packets() {
        let mut decoder = PacketDecoder::new(1024);
        // One byte idle packet, then a packet with protocol ID 2 and a one byte length field.
        let idle = [0xE0];
        let short = [0xE0 | (2 << 2) | 1, 5, 0xA, 0xB, 0xC];
        let long = [0xE0 | (2 << 2) | 2, 0, 0, 6, 0x1, 0x2];
        let packets = collect(&mut decoder, &[&idle, &short, &long]).unwrap();
        assert_eq!(packets, vec![short.to_vec(), long.to_vec()]);

        decoder.set_strip_encapsulation_header(true);
        let packets = collect(&mut decoder, &[&short, &long]).unwrap();
        assert_eq!(packets, vec![vec![0xA, 0xB, 0xC], vec![0x1, 0x2]]);
    }

    #[test]
    fn test_decode_errors() {
        let mut decoder = PacketDecoder::new(16);
        assert_eq!(
            collect(&mut decoder, &[&[0x40, 0, 0]]).unwrap_err(),
            PacketDecodeError::UnsupportedPacketVersion(0b010)
        );
        assert!(!decoder.has_incomplete_packet());
        let too_long = space_packet(1, 20, 0);
        assert_eq!(
            collect(&mut decoder, &[&too_long]).unwrap_err(),
            PacketDecodeError::PacketTooLong {
                length: 26,
                max: 16
            }
        );
        assert!(!decoder.has_incomplete_packet());
        assert_eq!(
            collect(&mut decoder, &[&[0xE1, 1]]).unwrap_err(),
            PacketDecodeError::PacketTooShort { length: 1 }
        );
    }

    const FRAME_LEN: usize = 32;
    // 32 - 6 header - 2 CRC
    const DATA_LEN: usize = 24;

    struct FrameBuilder {
        encoder: TmFrameEncoder,
        decoder: FrameDecoder,
        count: u8,
    }

    impl FrameBuilder {
        fn new() -> Self {
            Self {
                encoder: TmFrameEncoder::new(FRAME_LEN, ErrorDetection::Crc16),
                decoder: FrameDecoder::new(FrameDecoderConfig::new_tm(
                    FRAME_LEN,
                    ErrorDetection::Crc16,
                )),
                count: 0,
            }
        }

        fn build(&mut self, data: &[u8], fhp: u16) -> Vec<u8> {
            let mut header = TmPrimaryHeader::new_packet_service(1, 2, fhp);
            header.vc_frame_count = self.count;
            self.count = self.count.wrapping_add(1);
            let mut buf = vec![0; FRAME_LEN];
            self.encoder
                .encode(&header, None, data, None, &mut buf)
                .unwrap();
            buf
        }
    }

    #[test]
    fn test_packet_spanning_frames() {
        let mut builder = FrameBuilder::new();
        let mut reassembler =
            VcPacketReassembler::new(&VirtualChannelConfig::new(2, ServiceType::Packet), PacketCollector::default());
        // 40 byte packet followed by a 6 byte packet which starts in the second frame.
        let first = space_packet(5, 34, 0x11);
        let second = space_packet(6, 2, 0x22);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        stream.resize(2 * DATA_LEN, 0);
        let frame_one = builder.build(&stream[..DATA_LEN], 0);
        let frame_two = builder.build(&stream[DATA_LEN..], 16);
        reassembler.handle_frame(&builder.decoder.decode(&frame_one).unwrap());
        assert!(reassembler.has_incomplete_packet());
        reassembler.handle_frame(&builder.decoder.decode(&frame_two).unwrap());
        assert_eq!(reassembler.sink().packets(), vec![first, second]);
        let stats = reassembler.stats();
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.decode_errors, 0);
    }

    #[test]
    fn test_incomplete_packet_dropped_on_frame_loss() {
        let mut builder = FrameBuilder::new();
        let mut reassembler =
            VcPacketReassembler::new(&VirtualChannelConfig::new(2, ServiceType::Packet), PacketCollector::default());
        let long = space_packet(5, 54, 0x11);
        let frame_one = builder.build(&long[..DATA_LEN], 0);
        // Skip one frame.
        let _ = builder.build(&long[DATA_LEN..2 * DATA_LEN], TM_FHP_NO_PACKET_START);
        let mut data = long[2 * DATA_LEN..].to_vec();
        let next = space_packet(7, 1, 0x33);
        let next_start = data.len();
        data.extend_from_slice(&next);
        data.resize(DATA_LEN, 0);
        let frame_three = builder.build(&data, next_start as u16);
        reassembler.handle_frame(&builder.decoder.decode(&frame_one).unwrap());
        reassembler.handle_frame(&builder.decoder.decode(&frame_three).unwrap());
        assert_eq!(reassembler.sink().packets(), vec![next]);
        let stats = reassembler.stats();
        assert_eq!(stats.dropped_incomplete_packets, 1);
        assert_eq!(stats.frame_loss_events, 1);
    }

    #[test]
    fn test_premature_packet_start() {
        let mut builder = FrameBuilder::new();
        let mut reassembler =
            VcPacketReassembler::new(&VirtualChannelConfig::new(2, ServiceType::Packet), PacketCollector::default());
        let long = space_packet(5, 60, 0x11);
        let frame_one = builder.build(&long[..DATA_LEN], 0);
        // The next frame claims a new packet starts at offset 4, while 42 bytes are missing.
        let mut data = long[DATA_LEN..DATA_LEN + 4].to_vec();
        let next = space_packet(7, 1, 0x33);
        data.extend_from_slice(&next);
        data.resize(DATA_LEN, 0);
        let frame_two = builder.build(&data, 4);
        reassembler.handle_frame(&builder.decoder.decode(&frame_one).unwrap());
        reassembler.handle_frame(&builder.decoder.decode(&frame_two).unwrap());
        assert_eq!(reassembler.sink().packets(), vec![next]);
        assert_eq!(reassembler.stats().dropped_incomplete_packets, 1);
    }

    #[test]
    fn test_idle_frame_updates_count() {
        let mut builder = FrameBuilder::new();
        let mut reassembler =
            VcPacketReassembler::new(&VirtualChannelConfig::new(2, ServiceType::Packet), PacketCollector::default());
        let idle = builder.build(&[0; DATA_LEN], crate::frame::tm::TM_FHP_IDLE_DATA);
        reassembler.handle_frame(&builder.decoder.decode(&idle).unwrap());
        assert_eq!(reassembler.last_frame_count(), Some(0));
        assert_eq!(reassembler.stats().idle_frames, 1);
        assert!(reassembler.sink().packets().is_empty());
    }

    #[test]
    fn test_vc_access_service() {
        let mut builder = FrameBuilder::new();
        let mut reassembler =
            VcPacketReassembler::new(&VirtualChannelConfig::new(2, ServiceType::VcAccess), PacketCollector::default());
        let data: Vec<u8> = (0..DATA_LEN as u8).collect();
        let raw = builder.build(&data, TM_FHP_NO_PACKET_START);
        reassembler.handle_frame(&builder.decoder.decode(&raw).unwrap());
        assert_eq!(reassembler.sink().packets(), vec![data]);
    }

    fn unsegmented_reassembler(decoding: PacketDecoding) -> VcPacketReassembler<PacketCollector> {
        let mut config = VirtualChannelConfig::new(2, ServiceType::Packet);
        config.decoding = decoding;
        VcPacketReassembler::new(&config, PacketCollector::default())
    }

    #[test]
    fn test_single_packet_per_frame() {
        let mut builder = FrameBuilder::new();
        let mut reassembler = unsegmented_reassembler(PacketDecoding::Single);
        let first = space_packet(5, 4, 0x11);
        let mut data = first.clone();
        data.extend_from_slice(&space_packet(6, 8, 0x22));
        let raw = builder.build(&data, 0);
        reassembler.handle_frame(&builder.decoder.decode(&raw).unwrap());
        // Only the packet at the first header pointer is extracted.
        assert_eq!(reassembler.sink().packets(), vec![first]);
        assert!(!reassembler.has_incomplete_packet());
        assert_eq!(reassembler.stats().decode_errors, 0);
    }

    #[test]
    fn test_multiple_packets_per_frame() {
        let mut builder = FrameBuilder::new();
        let mut reassembler = unsegmented_reassembler(PacketDecoding::Multiple);
        let first = space_packet(5, 4, 0x11);
        let second = space_packet(6, 8, 0x22);
        let mut data = first.clone();
        data.extend_from_slice(&second);
        let raw = builder.build(&data, 0);
        reassembler.handle_frame(&builder.decoder.decode(&raw).unwrap());
        assert_eq!(reassembler.sink().packets(), vec![first.clone(), second.clone()]);

        // A packet running over the end of the frame is dropped, it is not continued in the next
        // frame.
        let mut data = first.clone();
        data.extend_from_slice(&space_packet(7, 14, 0x33)[..14]);
        let raw = builder.build(&data, 0);
        reassembler.handle_frame(&builder.decoder.decode(&raw).unwrap());
        assert!(!reassembler.has_incomplete_packet());
        let raw = builder.build(&[second.clone(), first.clone()].concat(), 0);
        reassembler.handle_frame(&builder.decoder.decode(&raw).unwrap());
        assert_eq!(
            reassembler.sink().packets(),
            vec![first.clone(), second.clone(), first.clone(), second, first]
        );
        assert_eq!(reassembler.stats().dropped_incomplete_packets, 1);
    }

    #[test]
    fn test_disabled_vc_drops_frames() {
        let mut builder = FrameBuilder::new();
        let mut reassembler =
            VcPacketReassembler::new(&VirtualChannelConfig::new(2, ServiceType::Packet), PacketCollector::default());
        assert!(reassembler.is_enabled());
        reassembler.set_enabled(false);
        let packet = space_packet(5, 18, 0x11);
        let raw = builder.build(&packet, 0);
        reassembler.handle_frame(&builder.decoder.decode(&raw).unwrap());
        assert!(reassembler.sink().packets().is_empty());
        assert_eq!(reassembler.stats().disabled_frames, 1);
        assert_eq!(reassembler.stats().frames, 0);
        assert_eq!(reassembler.last_frame_count(), None);

        reassembler.set_enabled(true);
        let raw = builder.build(&packet, 0);
        reassembler.handle_frame(&builder.decoder.decode(&raw).unwrap());
        assert_eq!(reassembler.sink().packets(), vec![packet]);
    }
}
