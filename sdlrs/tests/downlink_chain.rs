//! Downlink chain: AOS frames carrying space packets and CLCWs go through the demultiplexer. The
//! packets come out of the reassemblers, the CLCWs synchronize a FOP-1 engine which waits for
//! its first CLCW.
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use sdlrs::codec::crc::ErrorDetection;
use sdlrs::config::{
    DownlinkConfig, FrameDecoderConfig, ServiceType, UplinkVcConfig, VirtualChannelConfig,
};
use sdlrs::cop1::{Clcw, CommandAck, Fop1Engine, Fop1State};
use sdlrs::demux::DownlinkDemultiplexer;
use sdlrs::frame::aos::AOS_FHP_NO_PACKET_START;
use sdlrs::frame::{AosFrameEncoder, AosPrimaryHeader};
use sdlrs::packet::PacketFromVc;
use sdlrs::tc::TcFrameFactory;

const FRAME_LEN: usize = 64;
const VC: u8 = 5;

fn space_packet(apid: u16, len: usize) -> Vec<u8> {
    let mut packet = vec![apid as u8; len];
    packet[0] = ((apid >> 8) & 0x07) as u8 | 0x08;
    packet[1] = apid as u8;
    packet[2] = 0xC0;
    packet[3] = 0;
    packet[4..6].copy_from_slice(&((len - 7) as u16).to_be_bytes());
    packet
}

struct AosSource {
    encoder: AosFrameEncoder,
}

impl AosSource {
    fn new(config: &FrameDecoderConfig) -> Self {
        Self {
            encoder: AosFrameEncoder::new(config),
        }
    }

    fn data_len(&self) -> usize {
        self.encoder.data_field_len(true)
    }

    fn frame(&self, count: u32, fhp: u16, data: &[u8], clcw: Clcw) -> Vec<u8> {
        let header = AosPrimaryHeader::new(0x4D, VC, count);
        let mut buf = vec![0; FRAME_LEN];
        self.encoder
            .encode(&header, &[], Some(fhp), data, Some(clcw.raw()), &mut buf)
            .unwrap();
        buf
    }
}

fn downlink_config() -> DownlinkConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    DownlinkConfig {
        decoder: FrameDecoderConfig::new_aos(FRAME_LEN, ErrorDetection::Crc16, true),
        virtual_channels: vec![VirtualChannelConfig::new(VC, ServiceType::Packet)],
    }
}

fn packets(rx: &Receiver<PacketFromVc>) -> Vec<Vec<u8>> {
    rx.try_iter()
        .map(|packet| {
            assert_eq!(packet.vc_id, VC);
            packet.packet
        })
        .collect()
}

#[test]
fn test_packets_across_frames_and_frame_loss() {
    let config = downlink_config();
    let source = AosSource::new(&config.decoder);
    // 64 - 6 header - 2 M_PDU header - 4 OCF - 2 CRC
    assert_eq!(source.data_len(), 50);
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut demux = DownlinkDemultiplexer::new(&config, tx);
    let clcw = Clcw::new(0, 0);

    let p1 = space_packet(0x10, 30);
    let p2 = space_packet(0x11, 60);
    let p3 = space_packet(0x12, 10);
    let stream: Vec<u8> = [p1.clone(), p2.clone(), p3.clone()].concat();
    demux.handle_frame(&mut source.frame(0, 0, &stream[..50], clcw));
    demux.handle_frame(&mut source.frame(1, 40, &stream[50..], clcw));
    assert_eq!(packets(&rx), vec![p1, p2, p3]);

    // The frame with count 4 which completes the first packet is lost.
    let p4 = space_packet(0x13, 70);
    let p5 = space_packet(0x14, 50);
    demux.handle_frame(&mut source.frame(3, 0, &p4[..50], clcw));
    demux.handle_frame(&mut source.frame(5, 0, &p5, clcw));
    assert_eq!(packets(&rx), vec![p5]);

    // A frame without packet start continues nothing after the decoder was reset.
    demux.sync_lost();
    demux.handle_frame(&mut source.frame(6, AOS_FHP_NO_PACKET_START, &[0xAB; 50], clcw));
    assert!(packets(&rx).is_empty());

    let stats = demux.reassembler_stats(VC).unwrap();
    assert_eq!(stats.frames, 5);
    assert_eq!(stats.packets, 4);
    assert_eq!(stats.frame_loss_events, 2);
    assert_eq!(stats.dropped_incomplete_packets, 1);
    assert_eq!(stats.decode_errors, 0);
    let demux_stats = demux.stats();
    assert_eq!(demux_stats.frames, 5);
    assert_eq!(demux_stats.clcws, 5);
    assert_eq!(demux_stats.sync_losses, 1);
    assert_eq!(demux_stats.corrupted_frames, 0);
}

#[test]
fn test_clcw_feedback_synchronizes_fop1() {
    let config = downlink_config();
    let source = AosSource::new(&config.decoder);
    let (tx, _rx) = crossbeam_channel::unbounded();
    let mut demux = DownlinkDemultiplexer::new(&config, tx);

    let mut uplink_config = UplinkVcConfig::new(0);
    uplink_config.initial_clcw_wait = Some(Duration::from_secs(10));
    let (ack_tx, _ack_rx) = crossbeam_channel::unbounded::<CommandAck>();
    let (handle, join_handle) = Fop1Engine::spawn(
        &uplink_config,
        TcFrameFactory::new(0x4D, ErrorDetection::Crc16),
        ack_tx,
    )
    .unwrap();
    demux.add_clcw_consumer(Box::new(handle.clone()));

    let filler = space_packet(0x7FF, 50);
    let mut corrupted = source.frame(0, 0, &filler, Clcw::new(0, 99));
    corrupted[20] ^= 0x01;
    demux.handle_frame(&mut corrupted);
    demux.handle_frame(&mut source.frame(1, 0, &filler, Clcw::new(0, 42)));

    let start = Instant::now();
    loop {
        let status = handle.status().wait().unwrap();
        if status.state == Fop1State::Active {
            assert_eq!(status.v_s, 42);
            assert_eq!(status.nn_r, 42);
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(demux.stats().corrupted_frames, 1);
    assert_eq!(demux.reassembler_stats(VC).unwrap().packets, 0);
    handle.shutdown();
    join_handle.join().unwrap();
}
