//! Uplink side: one FOP-1 engine per virtual channel, the frame multiplexer and the UDP servers.
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Select, Sender};
use log::{debug, info, trace, warn};
use sdlrs::config::UplinkConfig;
use sdlrs::cop1::{
    CommandAck, Cop1Event, Fop1Engine, Fop1Error, Fop1Handle, SpawnError, Telecommand,
};
use sdlrs::mux::{FrameMultiplexer, VcUplinkHandler};
use sdlrs::tc::TcFrameFactory;
use sdlrs::{CommandId, VcId};

pub const BYPASS_FLAG: u8 = 1;

pub struct Uplink {
    pub handles: Vec<Fop1Handle>,
    pub mux: FrameMultiplexer,
    pub engine_threads: Vec<JoinHandle<()>>,
}

impl Uplink {
    pub fn new(config: &UplinkConfig, ack_tx: Sender<CommandAck>) -> Result<Self, SpawnError> {
        let factory = TcFrameFactory::new(config.spacecraft_id, config.error_detection);
        let mut handles = Vec::new();
        let mut engine_threads = Vec::new();
        for vc_config in &config.virtual_channels {
            let factory = factory
                .clone()
                .with_max_frame_length(vc_config.max_frame_length);
            let (handle, join_handle) = Fop1Engine::spawn(vc_config, factory, ack_tx.clone())?;
            handles.push(handle);
            engine_threads.push(join_handle);
        }
        let mux = FrameMultiplexer::new(
            config.scheme,
            handles
                .iter()
                .map(|handle| Arc::new(handle.clone()) as Arc<dyn VcUplinkHandler>)
                .collect(),
        );
        Ok(Self {
            handles,
            mux,
            engine_threads,
        })
    }
}

/// Sends the frames selected by the multiplexer until the multiplexer quits.
pub fn spawn_frame_writer(
    mut mux: FrameMultiplexer,
    socket: UdpSocket,
    dest: SocketAddr,
    cltu: bool,
    randomize: bool,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("uplink-writer".into())
        .spawn(move || {
            while let Some(frame) = mux.get_frame() {
                debug!(
                    "sending frame VC {} seq {} with {} bytes",
                    frame.vc_id(),
                    frame.frame_seq(),
                    frame.len()
                );
                let result = if cltu {
                    socket.send_to(&frame.to_cltu(randomize), dest)
                } else {
                    socket.send_to(frame.raw(), dest)
                };
                if let Err(e) = result {
                    warn!("sending uplink frame failed: {e}");
                }
            }
            info!("uplink writer stopped");
        })
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TcServerError {
    #[error("command datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("no uplink virtual channel {0}")]
    UnknownVc(VcId),
    #[error("FOP-1 error: {0}")]
    Fop1(#[from] Fop1Error),
}

/// Splits a command datagram into virtual channel, bypass flag and command data.
pub fn parse_command(datagram: &[u8]) -> Result<(VcId, bool, &[u8]), TcServerError> {
    if datagram.len() < 3 {
        return Err(TcServerError::TooShort(datagram.len()));
    }
    Ok((
        datagram[0],
        datagram[1] & BYPASS_FLAG != 0,
        &datagram[2..],
    ))
}

/// Receives telecommands over UDP and passes them to the FOP-1 engines.
pub struct TcServer {
    socket: UdpSocket,
    handles: Vec<Fop1Handle>,
    next_id: CommandId,
}

impl TcServer {
    pub fn new(socket: UdpSocket, handles: Vec<Fop1Handle>) -> Self {
        Self {
            socket,
            handles,
            next_id: 0,
        }
    }

    pub fn handle_datagram(&mut self, datagram: &[u8]) -> Result<CommandId, TcServerError> {
        let (vc_id, bypass, data) = parse_command(datagram)?;
        let handle = self
            .handles
            .iter()
            .find(|handle| handle.vc_id() == vc_id)
            .ok_or(TcServerError::UnknownVc(vc_id))?;
        let generation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let id = self.next_id;
        handle.send_command(Telecommand::new(id, data.to_vec(), bypass, generation_time))?;
        self.next_id += 1;
        Ok(id)
    }

    pub fn run(mut self) {
        let mut buf = [0; 65535];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, sender)) => match self.handle_datagram(&buf[..len]) {
                    Ok(id) => debug!("command {id} with {len} bytes received from {sender}"),
                    Err(e) => warn!("rejecting command from {sender}: {e}"),
                },
                Err(e) => warn!("receiving command failed: {e}"),
            }
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("tc-server".into())
            .spawn(move || self.run())
    }
}

pub fn spawn_ack_logger(acks: Receiver<CommandAck>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("ack-logger".into())
        .spawn(move || {
            for ack in acks {
                match ack.result {
                    Ok(()) => info!("command {} completed", ack.command_id),
                    Err(e) => warn!("command {} failed: {e}", ack.command_id),
                }
            }
        })
}

fn log_event(vc_id: VcId, event: Cop1Event) {
    match event {
        Cop1Event::StateChanged { old, new } => {
            info!("VC {vc_id}: FOP-1 state {} -> {}", old.name(), new.name())
        }
        Cop1Event::Alert(alert) => warn!("VC {vc_id}: FOP-1 alert {alert:?}"),
        Cop1Event::Suspended(state) => warn!("VC {vc_id}: FOP-1 suspended in state {}", state.name()),
        Cop1Event::ClcwReceived(clcw) => trace!("VC {vc_id}: CLCW {clcw:#010x}"),
        Cop1Event::TcQueued | Cop1Event::TcSent => debug!("VC {vc_id}: {event:?}"),
        Cop1Event::Disabled => info!("VC {vc_id}: COP-1 disabled"),
    }
}

/// Logs the monitoring events of all engines.
pub fn spawn_cop1_monitor(handles: &[Fop1Handle]) -> io::Result<JoinHandle<()>> {
    let monitors: Vec<(VcId, Receiver<Cop1Event>)> = handles
        .iter()
        .map(|handle| (handle.vc_id(), handle.subscribe()))
        .collect();
    thread::Builder::new()
        .name("cop1-monitor".into())
        .spawn(move || {
            let mut select = Select::new();
            for (_, rx) in &monitors {
                select.recv(rx);
            }
            let mut open = monitors.len();
            while open > 0 {
                let op = select.select();
                let idx = op.index();
                let (vc_id, rx) = &monitors[idx];
                match op.recv(rx) {
                    Ok(event) => log_event(*vc_id, event),
                    Err(_) => {
                        select.remove(idx);
                        open -= 1;
                    }
                }
            }
        })
}
