//! FOP-1 engine: one thread per uplink virtual channel.
//!
//! All state of the [Fop1] is owned by the engine thread. The [Fop1Handle] posts requests to that
//! thread over a channel and can be cloned freely. Directives return a [Completion] which is
//! resolved by the engine thread. Frames produced by the FOP-1 are put into an out queue which is
//! emptied by the [crate::mux::FrameMultiplexer] through the [VcUplinkHandler] implementation of
//! the handle.
//!
//! When the engine stops, every command it accepted is completed: commands still waiting in the
//! FOP-1 or in the request channel and commands of frames left in the out queue are failed with
//! [Fop1Error::LinkDisabled]. Handles refuse new commands and hand out no more frames afterwards.
use core::time::Duration;
use std::collections::VecDeque;
use std::format;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use std::vec::Vec;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use smallvec::SmallVec;

use super::{
    fop1::OutFrameKind, Clcw, CommandAck, CommandAckSender, Cop1Config, Cop1Event, Cop1Status,
    Fop1, Fop1Error, Fop1Sink, Telecommand,
};
use crate::{
    config::UplinkVcConfig,
    demux::ClcwConsumer,
    mux::{DataAvailable, VcUplinkHandler},
    tc::{TcFrameFactory, TcTransferFrame},
    CommandId, VcId,
};

/// Maximum number of frames waiting to be taken by the multiplexer.
pub const OUT_QUEUE_CAPACITY: usize = 20;
/// Depth of the event queue of each monitor. Events are dropped when it is full.
pub const MONITOR_QUEUE_DEPTH: usize = 64;

const NO_CLCW: u64 = u64::MAX;

type Reply<T> = Sender<Result<T, Fop1Error>>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("invalid FOP-1 configuration: {0}")]
    Config(#[from] Fop1Error),
    #[error("creating the engine thread failed: {0}")]
    Io(#[from] io::Error),
}

/// Result of a request which is processed asynchronously by the engine thread.
#[derive(Debug)]
pub struct Completion<T> {
    rx: Receiver<Result<T, Fop1Error>>,
}

impl<T> Completion<T> {
    fn new() -> (Reply<T>, Self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (tx, Self { rx })
    }

    /// Blocks until the request was processed. Fails with [Fop1Error::LinkDisabled] if the engine
    /// stopped before.
    pub fn wait(self) -> Result<T, Fop1Error> {
        self.rx.recv().unwrap_or(Err(Fop1Error::LinkDisabled))
    }

    /// Returns [None] if the request was not processed within the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Fop1Error>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Fop1Error::LinkDisabled)),
        }
    }
}

#[derive(Debug)]
struct OutFrame {
    frame: TcTransferFrame,
    kind: OutFrameKind,
}

/// State shared between the engine thread and its handles.
#[derive(Debug)]
struct Shared {
    vc_id: VcId,
    priority: u32,
    /// Most recent unprocessed CLCW or [NO_CLCW].
    clcw_slot: AtomicU64,
    out_queue: Mutex<VecDeque<OutFrame>>,
    data_available: OnceLock<DataAvailable>,
    /// Set once by the engine thread after its last request.
    stopped: RwLock<bool>,
}

impl Shared {
    fn out_queue(&self) -> MutexGuard<'_, VecDeque<OutFrame>> {
        self.out_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Holding the guard keeps the engine from stopping.
    fn stopped(&self) -> RwLockReadGuard<'_, bool> {
        self.stopped.read().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Request {
    Command(Telecommand),
    ClcwAvailable,
    FrameTaken {
        kind: OutFrameKind,
        commands: SmallVec<[CommandId; 4]>,
    },
    InitiateAd {
        clcw_check: bool,
        wait: Option<Duration>,
        reply: Reply<()>,
    },
    InitiateAdWithVr {
        v_r: u8,
        reply: Reply<()>,
    },
    InitiateAdWithUnlock(Reply<()>),
    TerminateAd(Reply<()>),
    Resume(Reply<()>),
    SetVs {
        v_s: u8,
        reply: Reply<()>,
    },
    DisableCop1 {
        bypass_all: bool,
        reply: Reply<()>,
    },
    SetConfig {
        config: Cop1Config,
        reply: Reply<()>,
    },
    GetConfig(Reply<Cop1Config>),
    GetStatus(Reply<Cop1Status>),
    AddMonitor(Sender<Cop1Event>),
    Shutdown,
}

/// Outputs of the FOP-1 as seen from the engine thread.
struct EngineSink<'a, Ack> {
    shared: &'a Shared,
    ack_sender: &'a Ack,
    monitors: &'a mut Vec<Sender<Cop1Event>>,
    timer_deadline: &'a mut Option<Instant>,
}

impl<Ack: CommandAckSender> Fop1Sink for EngineSink<'_, Ack> {
    fn queue_frame(&mut self, frame: TcTransferFrame, kind: OutFrameKind) -> Result<(), Fop1Error> {
        {
            let mut out_queue = self.shared.out_queue();
            if out_queue.len() >= OUT_QUEUE_CAPACITY {
                return Err(Fop1Error::OutQueueFull);
            }
            out_queue.push_back(OutFrame { frame, kind });
        }
        if let Some(data_available) = self.shared.data_available.get() {
            data_available.signal();
        }
        Ok(())
    }

    fn start_timer(&mut self, timeout: Duration) {
        *self.timer_deadline = Some(Instant::now() + timeout);
    }

    fn cancel_timer(&mut self) {
        *self.timer_deadline = None;
    }

    fn command_done(&mut self, command_id: CommandId, result: Result<(), Fop1Error>) {
        if let Err(e) = self.ack_sender.send_ack(CommandAck { command_id, result }) {
            log::warn!(
                "VC {}: acknowledgement of command {} lost: {}",
                self.shared.vc_id,
                command_id,
                e
            );
        }
    }

    fn event(&mut self, event: Cop1Event) {
        self.monitors.retain(|monitor| match monitor.try_send(event) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

/// Owns the [Fop1] of one uplink virtual channel and processes the requests of its handles.
pub struct Fop1Engine<Ack: CommandAckSender> {
    fop: Fop1,
    shared: Arc<Shared>,
    requests: Receiver<Request>,
    ack_sender: Ack,
    monitors: Vec<Sender<Cop1Event>>,
    timer_deadline: Option<Instant>,
    initial_clcw_wait: Option<Duration>,
}

impl<Ack: CommandAckSender + 'static> Fop1Engine<Ack> {
    pub fn new(
        config: &UplinkVcConfig,
        factory: TcFrameFactory,
        ack_sender: Ack,
    ) -> Result<(Self, Fop1Handle), Fop1Error> {
        let fop = Fop1::new(config, factory)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            vc_id: config.vc_id,
            priority: config.priority,
            clcw_slot: AtomicU64::new(NO_CLCW),
            out_queue: Mutex::new(VecDeque::with_capacity(OUT_QUEUE_CAPACITY)),
            data_available: OnceLock::new(),
            stopped: RwLock::new(false),
        });
        let engine = Self {
            fop,
            shared: shared.clone(),
            requests: rx,
            ack_sender,
            monitors: Vec::new(),
            timer_deadline: None,
            initial_clcw_wait: config.initial_clcw_wait,
        };
        Ok((
            engine,
            Fop1Handle {
                shared,
                requests: tx,
            },
        ))
    }

    /// Creates an engine and runs it on a new thread.
    pub fn spawn(
        config: &UplinkVcConfig,
        factory: TcFrameFactory,
        ack_sender: Ack,
    ) -> Result<(Fop1Handle, JoinHandle<()>), SpawnError> {
        let (engine, handle) = Self::new(config, factory, ack_sender)?;
        let join_handle = thread::Builder::new()
            .name(format!("fop1-vc{}", config.vc_id))
            .spawn(move || engine.run())?;
        Ok((handle, join_handle))
    }

    fn split(&mut self) -> (&mut Fop1, EngineSink<'_, Ack>) {
        (
            &mut self.fop,
            EngineSink {
                shared: &self.shared,
                ack_sender: &self.ack_sender,
                monitors: &mut self.monitors,
                timer_deadline: &mut self.timer_deadline,
            },
        )
    }

    /// Processes requests until [Fop1Handle::shutdown] is called or all handles are dropped.
    /// Commands still queued afterwards are failed with [Fop1Error::LinkDisabled].
    pub fn run(mut self) {
        log::info!("VC {}: FOP-1 engine started", self.shared.vc_id);
        if let Some(wait) = self.initial_clcw_wait {
            let (fop, mut sink) = self.split();
            if let Err(e) = fop.initiate_ad(true, wait, &mut sink) {
                log::warn!("VC {}: initial CLCW check failed: {}", fop.vc_id(), e);
            }
        }
        loop {
            let request = match self.timer_deadline {
                Some(deadline) => match self.requests.recv_deadline(deadline) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) => {
                        self.timer_deadline = None;
                        let (fop, mut sink) = self.split();
                        fop.on_timer_expired(&mut sink);
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.requests.recv() {
                    Ok(request) => request,
                    Err(_) => break,
                },
            };
            if !self.handle_request(request) {
                break;
            }
        }
        self.stop();
        log::info!("VC {}: FOP-1 engine stopped", self.shared.vc_id);
    }

    fn stop(&mut self) {
        *self
            .shared
            .stopped
            .write()
            .unwrap_or_else(PoisonError::into_inner) = true;
        // No command or taken frame can be posted anymore.
        let pending: Vec<Request> = self.requests.try_iter().collect();
        let (fop, mut sink) = self.split();
        fop.shutdown(&mut sink);
        for request in pending {
            match request {
                Request::Command(tc) => {
                    log::debug!(
                        "VC {}: command {} dropped on shutdown",
                        sink.shared.vc_id,
                        tc.id
                    );
                    sink.command_done(tc.id, Err(Fop1Error::LinkDisabled));
                }
                Request::FrameTaken {
                    kind: OutFrameKind::Direct,
                    commands,
                } => {
                    for command_id in commands {
                        sink.command_done(command_id, Ok(()));
                    }
                }
                // Replies are dropped, which resolves the completions with a link disabled error.
                _ => (),
            }
        }
        // Commands of AD frames were failed by the FOP-1 together with its sent queue.
        let out_queue = core::mem::take(&mut *sink.shared.out_queue());
        if !out_queue.is_empty() {
            log::info!(
                "VC {}: {} frames discarded from the out queue",
                sink.shared.vc_id,
                out_queue.len()
            );
        }
        for out in out_queue {
            if out.kind == OutFrameKind::Direct {
                for &command_id in out.frame.commands() {
                    sink.command_done(command_id, Err(Fop1Error::LinkDisabled));
                }
            }
        }
    }

    fn handle_request(&mut self, request: Request) -> bool {
        let (fop, mut sink) = self.split();
        match request {
            Request::Command(tc) => fop.send_command(tc, &mut sink),
            Request::ClcwAvailable => {
                let raw = sink.shared.clcw_slot.swap(NO_CLCW, Ordering::AcqRel);
                if raw != NO_CLCW {
                    fop.on_clcw(Clcw::from(raw as u32), &mut sink);
                }
            }
            Request::FrameTaken { kind, commands } => match kind {
                OutFrameKind::Ad => fop.on_ad_frame_taken(&mut sink),
                OutFrameKind::Bc => fop.on_bc_frame_taken(&mut sink),
                OutFrameKind::Direct => {
                    for command_id in commands {
                        sink.command_done(command_id, Ok(()));
                    }
                }
            },
            Request::InitiateAd {
                clcw_check,
                wait,
                reply,
            } => {
                let wait = wait.unwrap_or(fop.config().t1_initial);
                let _ = reply.send(fop.initiate_ad(clcw_check, wait, &mut sink));
            }
            Request::InitiateAdWithVr { v_r, reply } => {
                let _ = reply.send(fop.initiate_ad_with_vr(v_r, &mut sink));
            }
            Request::InitiateAdWithUnlock(reply) => {
                let _ = reply.send(fop.initiate_ad_with_unlock(&mut sink));
            }
            Request::TerminateAd(reply) => {
                fop.terminate_ad(&mut sink);
                let _ = reply.send(Ok(()));
            }
            Request::Resume(reply) => {
                let _ = reply.send(fop.resume(&mut sink));
            }
            Request::SetVs { v_s, reply } => {
                let _ = reply.send(fop.set_vs(v_s));
            }
            Request::DisableCop1 { bypass_all, reply } => {
                fop.disable_cop1(bypass_all, &mut sink);
                let _ = reply.send(Ok(()));
            }
            Request::SetConfig { config, reply } => {
                let _ = reply.send(fop.set_config(&config));
            }
            Request::GetConfig(reply) => {
                let _ = reply.send(Ok(fop.config()));
            }
            Request::GetStatus(reply) => {
                let mut status = fop.status();
                status.out_queue_len = sink.shared.out_queue().len();
                let _ = reply.send(Ok(status));
            }
            Request::AddMonitor(monitor) => sink.monitors.push(monitor),
            Request::Shutdown => return false,
        }
        true
    }
}

/// Thread-safe front end of a [Fop1Engine].
#[derive(Debug, Clone)]
pub struct Fop1Handle {
    shared: Arc<Shared>,
    requests: Sender<Request>,
}

impl core::fmt::Debug for Request {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Request::Command(_) => "Command",
            Request::ClcwAvailable => "ClcwAvailable",
            Request::FrameTaken { .. } => "FrameTaken",
            Request::InitiateAd { .. } => "InitiateAd",
            Request::InitiateAdWithVr { .. } => "InitiateAdWithVr",
            Request::InitiateAdWithUnlock(_) => "InitiateAdWithUnlock",
            Request::TerminateAd(_) => "TerminateAd",
            Request::Resume(_) => "Resume",
            Request::SetVs { .. } => "SetVs",
            Request::DisableCop1 { .. } => "DisableCop1",
            Request::SetConfig { .. } => "SetConfig",
            Request::GetConfig(_) => "GetConfig",
            Request::GetStatus(_) => "GetStatus",
            Request::AddMonitor(_) => "AddMonitor",
            Request::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl Fop1Handle {
    pub fn vc_id(&self) -> VcId {
        self.shared.vc_id
    }

    fn request<T>(&self, make_request: impl FnOnce(Reply<T>) -> Request) -> Completion<T> {
        let (reply, completion) = Completion::new();
        // If the engine is gone the reply sender is dropped together with the request, which
        // resolves the completion with a link disabled error.
        let _ = self.requests.send(make_request(reply));
        completion
    }

    /// Passes a telecommand to the FOP-1. The outcome is reported to the acknowledgement sender
    /// of the engine.
    pub fn send_command(&self, tc: Telecommand) -> Result<(), Fop1Error> {
        let stopped = self.shared.stopped();
        if *stopped {
            return Err(Fop1Error::LinkDisabled);
        }
        self.requests
            .send(Request::Command(tc))
            .map_err(|_| Fop1Error::LinkDisabled)
    }

    /// Passes a received CLCW to the engine. If the engine did not process the previous CLCW yet,
    /// the previous one is replaced.
    pub fn on_clcw(&self, clcw: u32) {
        if self.shared.clcw_slot.swap(clcw as u64, Ordering::AcqRel) == NO_CLCW {
            let _ = self.requests.send(Request::ClcwAvailable);
        }
    }

    /// Initiates the AD service. With CLCW check the engine waits up to the initial timer value
    /// for a CLCW.
    pub fn initiate_ad(&self, clcw_check: bool) -> Completion<()> {
        self.request(|reply| Request::InitiateAd {
            clcw_check,
            wait: None,
            reply,
        })
    }

    /// Initiates the AD service with CLCW check, waiting up to the given time for a CLCW.
    pub fn initiate_ad_with_clcw_wait(&self, wait: Duration) -> Completion<()> {
        self.request(|reply| Request::InitiateAd {
            clcw_check: true,
            wait: Some(wait),
            reply,
        })
    }

    pub fn initiate_ad_with_vr(&self, v_r: u8) -> Completion<()> {
        self.request(|reply| Request::InitiateAdWithVr { v_r, reply })
    }

    pub fn initiate_ad_with_unlock(&self) -> Completion<()> {
        self.request(Request::InitiateAdWithUnlock)
    }

    pub fn terminate_ad(&self) -> Completion<()> {
        self.request(Request::TerminateAd)
    }

    pub fn resume(&self) -> Completion<()> {
        self.request(Request::Resume)
    }

    pub fn set_vs(&self, v_s: u8) -> Completion<()> {
        self.request(|reply| Request::SetVs { v_s, reply })
    }

    pub fn disable_cop1(&self, bypass_all: bool) -> Completion<()> {
        self.request(|reply| Request::DisableCop1 { bypass_all, reply })
    }

    pub fn set_config(&self, config: Cop1Config) -> Completion<()> {
        self.request(|reply| Request::SetConfig { config, reply })
    }

    pub fn config(&self) -> Completion<Cop1Config> {
        self.request(Request::GetConfig)
    }

    pub fn status(&self) -> Completion<Cop1Status> {
        self.request(Request::GetStatus)
    }

    /// Registers a new monitor. Events which do not fit into the queue of the monitor are dropped.
    pub fn subscribe(&self) -> Receiver<Cop1Event> {
        let (tx, rx) = crossbeam_channel::bounded(MONITOR_QUEUE_DEPTH);
        let _ = self.requests.send(Request::AddMonitor(tx));
        rx
    }

    /// Stops the engine thread.
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }

    pub fn out_queue_len(&self) -> usize {
        self.shared.out_queue().len()
    }
}

impl VcUplinkHandler for Fop1Handle {
    fn vc_id(&self) -> VcId {
        self.shared.vc_id
    }

    fn priority(&self) -> u32 {
        self.shared.priority
    }

    fn first_frame_timestamp(&self) -> Option<u64> {
        self.shared
            .out_queue()
            .front()
            .map(|out| out.frame.generation_time())
    }

    fn get_frame(&self) -> Option<TcTransferFrame> {
        let stopped = self.shared.stopped();
        if *stopped {
            return None;
        }
        let out = self.shared.out_queue().pop_front()?;
        let _ = self.requests.send(Request::FrameTaken {
            kind: out.kind,
            commands: SmallVec::from_slice(out.frame.commands()),
        });
        Some(out.frame)
    }

    fn set_data_available(&self, data_available: DataAvailable) {
        if self.shared.data_available.set(data_available).is_err() {
            log::warn!(
                "VC {}: the handler is already attached to a multiplexer",
                self.shared.vc_id
            );
        }
    }
}

impl ClcwConsumer for Fop1Handle {
    fn on_clcw(&self, clcw: u32) {
        Fop1Handle::on_clcw(self, clcw)
    }
}

#[cfg(test)]
mod tests {
    use std::vec;

    use super::*;
    use crate::{
        codec::crc::ErrorDetection,
        config::TimeoutType,
        cop1::{AlertType, Fop1State},
        tc::parse_tc_header,
    };

    const VC: VcId = 2;
    const TIMEOUT: Duration = Duration::from_secs(2);

    fn spawn(config: &UplinkVcConfig) -> (Fop1Handle, JoinHandle<()>, Receiver<CommandAck>) {
        let (ack_tx, ack_rx) = crossbeam_channel::unbounded();
        let (handle, join_handle) = Fop1Engine::spawn(
            config,
            TcFrameFactory::new(0x55, ErrorDetection::Crc16),
            ack_tx,
        )
        .unwrap();
        (handle, join_handle, ack_rx)
    }

    fn wait_for_frame(handle: &Fop1Handle) -> TcTransferFrame {
        let start = Instant::now();
        loop {
            if let Some(frame) = handle.get_frame() {
                return frame;
            }
            assert!(start.elapsed() < TIMEOUT, "no frame received");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_command_acknowledged_by_clcw() {
        let (handle, join_handle, acks) = spawn(&UplinkVcConfig::new(VC));
        handle.initiate_ad(false).wait().unwrap();
        handle
            .send_command(Telecommand::new(11, vec![1, 2, 3], false, 100))
            .unwrap();
        let frame = wait_for_frame(&handle);
        assert_eq!(frame.commands(), &[11]);
        assert_eq!(frame.generation_time(), 100);
        let (_, vc, bypass, _, _, seq) = parse_tc_header(frame.raw()).unwrap();
        assert_eq!(vc, VC);
        assert!(!bypass);
        assert_eq!(seq, 0);

        handle.on_clcw(Clcw::new(VC, 1).raw());
        let ack = acks.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(ack, CommandAck { command_id: 11, result: Ok(()) });
        let status = handle.status().wait().unwrap();
        assert_eq!(status.state, Fop1State::Active);
        assert_eq!(status.v_s, 1);
        assert_eq!(status.nn_r, 1);
        assert_eq!(status.sent_queue_len, 0);
        assert_eq!(status.last_clcw.unwrap().clcw.report_value(), 1);

        handle.shutdown();
        join_handle.join().unwrap();
    }

    #[test]
    fn test_timer_retransmission_and_alert() {
        let mut config = UplinkVcConfig::new(VC);
        config.t1_initial = Duration::from_millis(20);
        config.tx_limit = 2;
        config.timeout_type = TimeoutType::GoToInitial;
        let (handle, join_handle, acks) = spawn(&config);
        let events = handle.subscribe();
        handle.initiate_ad(false).wait().unwrap();
        handle
            .send_command(Telecommand::new(1, vec![0xAA], false, 0))
            .unwrap();
        let first = wait_for_frame(&handle);
        let second = wait_for_frame(&handle);
        assert_eq!(first.raw(), second.raw());
        let ack = acks.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(ack.result, Err(Fop1Error::Alert(AlertType::T1)));
        assert_eq!(
            handle.status().wait().unwrap().state,
            Fop1State::Initial
        );
        let received: Vec<Cop1Event> = events.try_iter().collect();
        assert!(received.contains(&Cop1Event::Alert(AlertType::T1)));
        handle.shutdown();
        join_handle.join().unwrap();
    }

    #[test]
    fn test_initial_clcw_wait() {
        let mut config = UplinkVcConfig::new(VC);
        config.initial_clcw_wait = Some(Duration::from_secs(10));
        let (handle, join_handle, _acks) = spawn(&config);
        assert_eq!(
            handle.status().wait().unwrap().state,
            Fop1State::InitialisingWithoutBc
        );
        // CLCWs of other virtual channels are ignored.
        handle.on_clcw(Clcw::new(VC + 1, 9).raw());
        handle.on_clcw(Clcw::new(VC, 9).raw());
        let start = Instant::now();
        loop {
            let status = handle.status().wait().unwrap();
            if status.state == Fop1State::Active {
                assert_eq!(status.v_s, 9);
                break;
            }
            assert!(start.elapsed() < TIMEOUT);
            thread::sleep(Duration::from_millis(2));
        }
        handle.shutdown();
        join_handle.join().unwrap();
    }

    #[test]
    fn test_bd_frame_acknowledged_when_taken() {
        let (handle, join_handle, acks) = spawn(&UplinkVcConfig::new(VC));
        handle
            .send_command(Telecommand::new(4, vec![9; 4], true, 0))
            .unwrap();
        let frame = wait_for_frame(&handle);
        assert!(frame.bypass());
        assert_eq!(
            acks.recv_timeout(TIMEOUT).unwrap(),
            CommandAck { command_id: 4, result: Ok(()) }
        );
        handle.shutdown();
        join_handle.join().unwrap();
    }

    #[test]
    fn test_shutdown_fails_queued_commands() {
        let (handle, join_handle, acks) = spawn(&UplinkVcConfig::new(VC));
        // Not initiated, the command waits in the queue.
        handle
            .send_command(Telecommand::new(8, vec![1], false, 0))
            .unwrap();
        handle.shutdown();
        join_handle.join().unwrap();
        assert_eq!(
            acks.recv_timeout(TIMEOUT).unwrap(),
            CommandAck {
                command_id: 8,
                result: Err(Fop1Error::LinkDisabled)
            }
        );
        assert_eq!(handle.resume().wait(), Err(Fop1Error::LinkDisabled));
        assert_eq!(
            handle.send_command(Telecommand::new(9, vec![1], false, 0)),
            Err(Fop1Error::LinkDisabled)
        );
    }

    /// Posts the requests before the engine runs, then runs it on the current thread until the
    /// shutdown request.
    fn run_engine(
        config: &UplinkVcConfig,
        requests: impl FnOnce(&Fop1Handle),
    ) -> (Fop1Handle, Vec<CommandAck>) {
        let (ack_tx, ack_rx) = crossbeam_channel::unbounded::<CommandAck>();
        let (engine, handle) = Fop1Engine::new(
            config,
            TcFrameFactory::new(0x55, ErrorDetection::Crc16),
            ack_tx,
        )
        .unwrap();
        requests(&handle);
        engine.run();
        (handle, ack_rx.try_iter().collect())
    }

    fn ack(command_id: CommandId, result: Result<(), Fop1Error>) -> CommandAck {
        CommandAck { command_id, result }
    }

    #[test]
    fn test_shutdown_fails_commands_behind_it() {
        let (handle, acks) = run_engine(&UplinkVcConfig::new(VC), |handle| {
            // The BD frame is queued for the multiplexer but never taken.
            handle
                .send_command(Telecommand::new(9, vec![1], true, 0))
                .unwrap();
            handle.shutdown();
            handle
                .send_command(Telecommand::new(7, vec![2], false, 0))
                .unwrap();
        });
        assert_eq!(
            acks,
            vec![
                ack(7, Err(Fop1Error::LinkDisabled)),
                ack(9, Err(Fop1Error::LinkDisabled))
            ]
        );
        assert_eq!(handle.out_queue_len(), 0);
        assert!(handle.get_frame().is_none());
        assert_eq!(
            handle.send_command(Telecommand::new(10, vec![3], true, 0)),
            Err(Fop1Error::LinkDisabled)
        );
    }

    #[test]
    fn test_terminate_ad_with_frames_in_flight() {
        let (handle, acks) = run_engine(&UplinkVcConfig::new(VC), |handle| {
            let _ = handle.initiate_ad(false);
            // The first command goes out in an AD frame, the second one waits for it to be taken.
            handle
                .send_command(Telecommand::new(1, vec![1], false, 0))
                .unwrap();
            handle
                .send_command(Telecommand::new(2, vec![2], false, 0))
                .unwrap();
            let _ = handle.terminate_ad();
            handle.shutdown();
        });
        assert_eq!(
            acks,
            vec![
                ack(1, Err(Fop1Error::Alert(AlertType::Term))),
                ack(2, Err(Fop1Error::LinkDisabled))
            ]
        );
        assert_eq!(handle.out_queue_len(), 0);
    }

    #[test]
    fn test_disable_cop1_with_frames_in_flight() {
        let (handle, acks) = run_engine(&UplinkVcConfig::new(VC), |handle| {
            let _ = handle.initiate_ad(false);
            handle
                .send_command(Telecommand::new(1, vec![1], false, 0))
                .unwrap();
            handle
                .send_command(Telecommand::new(2, vec![2], false, 0))
                .unwrap();
            // The waiting command is sent without sequence control.
            let _ = handle.disable_cop1(false);
            handle.shutdown();
        });
        assert_eq!(
            acks,
            vec![
                ack(1, Err(Fop1Error::Purged)),
                ack(2, Err(Fop1Error::LinkDisabled))
            ]
        );
        assert!(handle.get_frame().is_none());
    }

    #[test]
    fn test_frame_taken_before_shutdown() {
        let (handle, join_handle, acks) = spawn(&UplinkVcConfig::new(VC));
        handle
            .send_command(Telecommand::new(5, vec![5], true, 0))
            .unwrap();
        handle
            .send_command(Telecommand::new(6, vec![6], true, 0))
            .unwrap();
        let frame = wait_for_frame(&handle);
        assert_eq!(frame.commands(), &[5]);
        handle.shutdown();
        join_handle.join().unwrap();
        let acks: Vec<CommandAck> = acks.try_iter().collect();
        assert_eq!(
            acks,
            vec![ack(5, Ok(())), ack(6, Err(Fop1Error::LinkDisabled))]
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = UplinkVcConfig::new(VC);
        config.tx_limit = 0;
        let (ack_tx, _ack_rx) = crossbeam_channel::unbounded::<CommandAck>();
        let result = Fop1Engine::spawn(
            &config,
            TcFrameFactory::new(0x55, ErrorDetection::Crc16),
            ack_tx,
        );
        assert!(matches!(
            result,
            Err(SpawnError::Config(Fop1Error::InvalidTxLimit))
        ));
    }

    #[test]
    fn test_config_roundtrip() {
        let (handle, join_handle, _acks) = spawn(&UplinkVcConfig::new(VC));
        let mut config = handle.config().wait().unwrap();
        config.window_width = 3;
        config.tx_limit = 7;
        handle.set_config(config).wait().unwrap();
        assert_eq!(handle.config().wait().unwrap(), config);
        handle.shutdown();
        join_handle.join().unwrap();
    }
}
