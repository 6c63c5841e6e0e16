//! Closed COP-1 loops: FOP-1 engines feed a frame multiplexer, a simulated FARM-1 on board checks
//! the frame sequence numbers and reports its state back in CLCWs, which are passed to the engines
//! like the downlink would do it.
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use sdlrs::codec::crc::ErrorDetection;
use sdlrs::config::{MultiplexingScheme, UplinkVcConfig};
use sdlrs::cop1::{AlertType, Clcw, CommandAck, Fop1Engine, Fop1Error, Fop1Handle, Fop1State, Telecommand};
use sdlrs::mux::{FrameMultiplexer, VcUplinkHandler};
use sdlrs::tc::{parse_tc_header, TcFrameFactory, TcTransferFrame};
use sdlrs::VcId;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Minimal FARM-1: accepts AD frames in sequence, BD frames always.
struct Farm1 {
    vc_id: VcId,
    v_r: u8,
    lockout: bool,
    retransmit: bool,
    accepted: Vec<Vec<u8>>,
}

impl Farm1 {
    fn new(vc_id: VcId) -> Self {
        Self {
            vc_id,
            v_r: 0,
            lockout: false,
            retransmit: false,
            accepted: Vec::new(),
        }
    }

    fn handle_frame(&mut self, frame: &TcTransferFrame) -> Clcw {
        let (_, vc_id, bypass, cmd_control, length, seq) = parse_tc_header(frame.raw()).unwrap();
        assert_eq!(vc_id, self.vc_id);
        assert_eq!(length, frame.len());
        if cmd_control {
            match frame.data() {
                [0x00] => {
                    self.lockout = false;
                    self.retransmit = false;
                }
                [0x82, 0x00, v_r] if !self.lockout => {
                    self.v_r = *v_r;
                    self.retransmit = false;
                }
                _ => (),
            }
        } else if bypass {
            self.accepted.push(frame.data().to_vec());
        } else if !self.lockout {
            if seq == self.v_r {
                self.accepted.push(frame.data().to_vec());
                self.v_r = self.v_r.wrapping_add(1);
                self.retransmit = false;
            } else if seq.wrapping_sub(self.v_r) < 128 {
                // Positive window: a frame was lost.
                self.retransmit = true;
            }
        }
        self.clcw()
    }

    fn clcw(&self) -> Clcw {
        Clcw::new(self.vc_id, self.v_r)
            .with_lockout(self.lockout)
            .with_retransmit(self.retransmit)
    }
}

struct Link {
    farm: Farm1,
    handle: Fop1Handle,
    join_handle: Option<JoinHandle<()>>,
}

struct Testbench {
    links: Vec<Link>,
    mux: FrameMultiplexer,
    acks: Receiver<CommandAck>,
    transmissions: usize,
}

impl Testbench {
    fn new(scheme: MultiplexingScheme, configs: &[UplinkVcConfig]) -> Self {
        init_logger();
        let (ack_tx, ack_rx) = crossbeam_channel::unbounded();
        let factory = TcFrameFactory::new(0x1AB, ErrorDetection::Crc16);
        let mut links = Vec::new();
        for config in configs {
            let (handle, join_handle) =
                Fop1Engine::spawn(config, factory.clone(), ack_tx.clone()).unwrap();
            links.push(Link {
                farm: Farm1::new(config.vc_id),
                handle,
                join_handle: Some(join_handle),
            });
        }
        let mux = FrameMultiplexer::new(
            scheme,
            links
                .iter()
                .map(|link| Arc::new(link.handle.clone()) as Arc<dyn VcUplinkHandler>)
                .collect(),
        );
        Self {
            links,
            mux,
            acks: ack_rx,
            transmissions: 0,
        }
    }

    fn link(&mut self, vc_id: VcId) -> &mut Link {
        self.links
            .iter_mut()
            .find(|link| link.farm.vc_id == vc_id)
            .unwrap()
    }

    /// Moves frames from the multiplexer to the FARM-1 until `done` returns true. Frames for
    /// which `lose` returns true never arrive.
    fn pump(
        &mut self,
        mut lose: impl FnMut(usize, &TcTransferFrame) -> bool,
        mut done: impl FnMut(&mut Self) -> bool,
    ) {
        let start = Instant::now();
        while !done(self) {
            assert!(start.elapsed() < TIMEOUT, "timeout while pumping frames");
            let Some(frame) = self.mux.get_frame_timeout(Duration::from_millis(10)) else {
                continue;
            };
            let transmission = self.transmissions;
            self.transmissions += 1;
            if lose(transmission, &frame) {
                continue;
            }
            let link = self.link(frame.vc_id());
            let clcw = link.farm.handle_frame(&frame);
            link.handle.on_clcw(clcw.raw());
        }
    }

    fn shutdown(&mut self) {
        self.mux.quit();
        for link in &mut self.links {
            link.handle.shutdown();
            if let Some(join_handle) = link.join_handle.take() {
                join_handle.join().unwrap();
            }
        }
    }
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn vc_config(vc_id: VcId) -> UplinkVcConfig {
    let mut config = UplinkVcConfig::new(vc_id);
    config.window_width = 5;
    config.t1_initial = Duration::from_millis(200);
    config.tx_limit = 10;
    config
}

fn command(vc_id: VcId, idx: u64) -> Telecommand {
    Telecommand::new(vc_id as u64 * 100 + idx, vec![vc_id, idx as u8], false, idx)
}

#[test]
fn test_lossy_uplink_delivers_all_commands_in_order() {
    let mut bench = Testbench::new(MultiplexingScheme::Fifo, &[vc_config(1), vc_config(2)]);
    for link in &bench.links {
        link.handle.initiate_ad(false).wait().unwrap();
    }
    for idx in 0..20 {
        bench.links[0].handle.send_command(command(1, idx)).unwrap();
        bench.links[1].handle.send_command(command(2, idx)).unwrap();
    }
    let mut acks = Vec::new();
    // The third and the ninth transmission on VC 1 are lost.
    let mut vc1_transmissions = 0;
    bench.pump(
        |_, frame| {
            if frame.vc_id() != 1 {
                return false;
            }
            vc1_transmissions += 1;
            vc1_transmissions == 3 || vc1_transmissions == 9
        },
        |bench| {
            acks.extend(bench.acks.try_iter());
            acks.len() == 40
        },
    );
    assert!(acks.iter().all(|ack| ack.result.is_ok()), "{:?}", acks);
    for vc_id in [1, 2] {
        let expected: Vec<Vec<u8>> = (0..20).map(|idx| vec![vc_id, idx]).collect();
        assert_eq!(bench.link(vc_id).farm.accepted, expected);
        let status = bench.link(vc_id).handle.status().wait().unwrap();
        assert_eq!(status.state, Fop1State::Active);
        assert_eq!(status.v_s, 20);
        assert_eq!(status.nn_r, 20);
        assert_eq!(status.sent_queue_len, 0);
        assert_eq!(status.wait_queue_len, 0);
    }
    bench.shutdown();
}

#[test]
fn test_lockout_and_unlock() {
    let mut bench = Testbench::new(MultiplexingScheme::Fifo, &[vc_config(3)]);
    let handle = bench.links[0].handle.clone();
    let events = handle.subscribe();
    bench.link(3).farm.lockout = true;
    handle.initiate_ad(false).wait().unwrap();
    handle.send_command(command(3, 0)).unwrap();
    let mut acks = Vec::new();
    bench.pump(
        |_, _| false,
        |bench| {
            acks.extend(bench.acks.try_iter());
            !acks.is_empty()
        },
    );
    assert_eq!(acks[0].result, Err(Fop1Error::Alert(AlertType::Lockout)));
    assert!(events
        .try_iter()
        .any(|event| event == sdlrs::cop1::Cop1Event::Alert(AlertType::Lockout)));

    // The command was never accepted, so V(R) is still 0 and matches V(S) after the unlock.
    handle.set_vs(0).wait().unwrap();
    handle.initiate_ad_with_unlock().wait().unwrap();
    bench.pump(
        |_, _| false,
        |_| handle.status().wait().unwrap().state == Fop1State::Active,
    );
    assert!(!bench.link(3).farm.lockout);

    handle.send_command(command(3, 1)).unwrap();
    let mut acks = Vec::new();
    bench.pump(
        |_, _| false,
        |bench| {
            acks.extend(bench.acks.try_iter());
            !acks.is_empty()
        },
    );
    assert_eq!(acks[0], CommandAck { command_id: 301, result: Ok(()) });
    assert_eq!(bench.link(3).farm.accepted, vec![vec![3, 1]]);
    bench.shutdown();
}

#[test]
fn test_disabled_cop1_sends_bd_frames() {
    let mut bench = Testbench::new(MultiplexingScheme::AbsolutePriority, &[vc_config(4)]);
    let handle = bench.links[0].handle.clone();
    handle.disable_cop1(true).wait().unwrap();
    for idx in 0..3 {
        handle.send_command(command(4, idx)).unwrap();
    }
    let mut acks = Vec::new();
    bench.pump(
        |_, _| false,
        |bench| {
            acks.extend(bench.acks.try_iter());
            acks.len() == 3
        },
    );
    let ids: Vec<u64> = acks.iter().map(|ack| ack.command_id).collect();
    assert_eq!(ids, vec![400, 401, 402]);
    assert!(acks.iter().all(|ack| ack.result.is_ok()));
    let status = handle.status().wait().unwrap();
    assert!(!status.cop1_active);
    assert!(status.bypass_all);
    assert_eq!(bench.link(4).farm.v_r, 0);
    assert_eq!(bench.link(4).farm.accepted.len(), 3);
    bench.shutdown();
}

#[test]
fn test_shutdown_completes_every_command() {
    let mut bench = Testbench::new(MultiplexingScheme::Fifo, &[vc_config(5)]);
    let handle = bench.links[0].handle.clone();
    // Not initiated yet, so the BD frame goes straight to the out queue.
    handle
        .send_command(Telecommand::new(509, vec![5, 9], true, 0))
        .unwrap();
    handle.initiate_ad(false).wait().unwrap();
    for idx in 0..3 {
        handle.send_command(command(5, idx)).unwrap();
    }
    handle.shutdown();
    // Either refused right away or failed by the engine, never lost.
    let late = handle.send_command(command(5, 7));
    bench.shutdown();

    let mut expected = vec![500, 501, 502, 509];
    match late {
        Ok(()) => expected.push(507),
        Err(e) => assert_eq!(e, Fop1Error::LinkDisabled),
    }
    expected.sort_unstable();
    let acks: Vec<CommandAck> = bench.acks.try_iter().collect();
    let mut ids: Vec<u64> = acks.iter().map(|ack| ack.command_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, expected);
    assert!(acks
        .iter()
        .all(|ack| ack.result == Err(Fop1Error::LinkDisabled)));

    assert_eq!(handle.out_queue_len(), 0);
    assert!(handle.get_frame().is_none());
    assert!(bench.mux.try_get_frame().is_none());
    assert_eq!(
        handle.send_command(command(5, 8)),
        Err(Fop1Error::LinkDisabled)
    );
}
