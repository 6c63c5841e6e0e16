//! Downlink side: raw frames from UDP go through the demultiplexer, reassembled packets are
//! forwarded over UDP and CLCWs are passed to the FOP-1 engines.
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{info, warn};
use sdlrs::config::DownlinkConfig;
use sdlrs::cop1::Fop1Handle;
use sdlrs::demux::DownlinkDemultiplexer;
use sdlrs::packet::PacketFromVc;

const STATS_INTERVAL: Duration = Duration::from_secs(60);
/// Without a frame for this time the frame synchronization is considered lost.
const SYNC_TIMEOUT: Duration = Duration::from_secs(2);

pub struct DownlinkReader {
    socket: UdpSocket,
    demux: DownlinkDemultiplexer<Sender<PacketFromVc>>,
    in_sync: bool,
}

impl DownlinkReader {
    pub fn new(
        config: &DownlinkConfig,
        socket: UdpSocket,
        clcw_consumers: &[Fop1Handle],
        packet_tx: Sender<PacketFromVc>,
    ) -> io::Result<Self> {
        socket.set_read_timeout(Some(SYNC_TIMEOUT))?;
        let mut demux = DownlinkDemultiplexer::new(config, packet_tx);
        for handle in clcw_consumers {
            demux.add_clcw_consumer(Box::new(handle.clone()));
        }
        Ok(Self {
            socket,
            demux,
            in_sync: false,
        })
    }

    /// Waits for one frame. Returns false if none arrived within the synchronization timeout.
    pub fn poll(&mut self, buf: &mut [u8]) -> bool {
        match self.socket.recv(buf) {
            Ok(len) => {
                self.in_sync = true;
                self.demux.handle_frame(&mut buf[..len]);
                true
            }
            Err(e) => {
                if !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
                    warn!("receiving downlink frame failed: {e}");
                } else if self.in_sync {
                    self.in_sync = false;
                    self.demux.sync_lost();
                }
                false
            }
        }
    }

    pub fn run(mut self) {
        let mut buf = vec![0; 65535];
        let mut last_report = Instant::now();
        loop {
            self.poll(&mut buf);
            if last_report.elapsed() >= STATS_INTERVAL {
                info!("downlink statistics: {:?}", self.demux.stats());
                last_report = Instant::now();
            }
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("downlink-reader".into())
            .spawn(move || self.run())
    }
}

pub fn spawn_packet_forwarder(
    packets: Receiver<PacketFromVc>,
    socket: UdpSocket,
    dest: SocketAddr,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("packet-forwarder".into())
        .spawn(move || {
            for packet in packets {
                if let Err(e) = socket.send_to(&packet.packet, dest) {
                    warn!("forwarding packet of VC {} failed: {e}", packet.vc_id);
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use sdlrs::codec::crc::ErrorDetection;
    use sdlrs::config::{FrameDecoderConfig, ServiceType, VirtualChannelConfig};
    use sdlrs::frame::{TmFrameEncoder, TmPrimaryHeader};

    use super::*;

    #[test]
    fn test_frames_over_udp() {
        let config = DownlinkConfig {
            decoder: FrameDecoderConfig::new_tm(32, ErrorDetection::Crc16),
            virtual_channels: vec![VirtualChannelConfig::new(1, ServiceType::VcAccess)],
        };
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let (packet_tx, packet_rx) = crossbeam_channel::unbounded();
        let mut reader = DownlinkReader::new(&config, socket, &[], packet_tx).unwrap();

        let encoder = TmFrameEncoder::new(32, ErrorDetection::Crc16);
        let data = [0x11; 24];
        let mut frame = [0; 32];
        encoder
            .encode(
                &TmPrimaryHeader::new_packet_service(0x2B, 1, 0),
                None,
                &data,
                None,
                &mut frame,
            )
            .unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&frame, addr).unwrap();

        let mut buf = [0; 256];
        assert!(reader.poll(&mut buf));
        assert_eq!(
            packet_rx.try_recv().unwrap(),
            PacketFromVc::new(1, data.to_vec())
        );
        assert_eq!(reader.demux.stats().frames, 1);
    }
}
