//! # Communications Operation Procedure-1 (COP-1)
//!
//! This module implements the sending side of the COP-1 as specified in CCSDS 232.1-B-2, the
//! Frame Operation Procedure (FOP-1). It guarantees in-order delivery of telecommands over a
//! lossy uplink by retransmitting sequence-controlled (AD) frames until the receiving side
//! acknowledges them in the Command Link Control Word (CLCW) of the downlink.
//!
//! The module is split into three layers:
//!
//!  - [clcw]: the CLCW wire format.
//!  - [fop1]: the FOP-1 state machine. It does not spawn threads or own timers. All of its
//!    outputs are passed to a [fop1::Fop1Sink].
//!  - [engine]: an actor which owns one state machine per uplink virtual channel and runs it on a
//!    dedicated thread. The [engine::Fop1Handle] is the thread-safe front end and is also the
//!    [crate::mux::VcUplinkHandler] of its virtual channel.
//!
//! The FOP-1 deviates from the standard in one point: "Initiate AD service with CLCW check" waits
//! for the first CLCW and seeds V(S) with the N(R) found in it, instead of requiring the operator to
//! set V(S) to an observed value first.
use core::time::Duration;
use std::vec::Vec;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{config::TimeoutType, tc::TcFrameError, CommandId};

pub mod clcw;
pub mod engine;
pub mod fop1;

pub use clcw::Clcw;
pub use engine::{Completion, Fop1Engine, Fop1Handle, SpawnError};
pub use fop1::{Fop1, Fop1Sink};

/// States of the FOP-1. The ordering follows the state numbers of CCSDS 232.1-B.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, IntoPrimitive, TryFromPrimitive,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Fop1State {
    Active = 1,
    RetransmitWithoutWait = 2,
    RetransmitWithWait = 3,
    InitialisingWithoutBc = 4,
    InitialisingWithBc = 5,
    Initial = 6,
}

impl Fop1State {
    pub const fn name(&self) -> &'static str {
        match self {
            Fop1State::Active => "Active",
            Fop1State::RetransmitWithoutWait => "Retransmit without wait",
            Fop1State::RetransmitWithWait => "Retransmit with wait",
            Fop1State::InitialisingWithoutBc => "Initialising without BC frame",
            Fop1State::InitialisingWithBc => "Initialising with BC frame",
            Fop1State::Initial => "Initial",
        }
    }
}

/// Alerts raised by the FOP-1. Each of them terminates the AD service.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AlertType {
    /// The FARM-1 reported lockout.
    Lockout,
    /// The CLCW is inconsistent with the FOP-1 state.
    Synch,
    /// The wait flag was set while no frames were outstanding.
    Clcw,
    /// A retransmission was requested but the transmission limit is 1.
    Limit,
    /// N(R) is outside of the range of outstanding frames.
    Nnr,
    /// The retransmission timer expired and the transmission limit was reached.
    T1,
    /// The AD service was terminated by a directive.
    Term,
    /// The lower layer did not accept a frame.
    Llif,
}

/// Events for monitoring and display purposes. Delivering them never blocks the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cop1Event {
    StateChanged { old: Fop1State, new: Fop1State },
    Alert(AlertType),
    /// The FOP-1 was suspended in the given state.
    Suspended(Fop1State),
    ClcwReceived(u32),
    TcQueued,
    TcSent,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fop1Error {
    #[error("operation not allowed in state {}", .0.name())]
    InvalidState(Fop1State),
    #[error("operation not allowed while the FOP-1 is suspended")]
    Suspended,
    #[error("the FOP-1 is not suspended")]
    NotSuspended,
    #[error("the previous BC frame was not sent yet")]
    BcOutNotReady,
    #[error("invalid sliding window width {0}, must be between 1 and 255")]
    InvalidWindowWidth(u16),
    #[error("invalid transmission limit 0, must be at least 1")]
    InvalidTxLimit,
    #[error("FOP-1 alert {0:?}")]
    Alert(AlertType),
    #[error("the link is disabled")]
    LinkDisabled,
    #[error("command of {length} bytes does not fit into a frame with {framing} bytes overhead and a maximum length of {max}")]
    CommandTooLarge {
        length: usize,
        framing: usize,
        max: usize,
    },
    #[error("the out queue is full")]
    OutQueueFull,
    #[error("the command was purged from the queue")]
    Purged,
    #[error("frame encoding failed: {0}")]
    Frame(#[from] TcFrameError),
}

/// Telecommand which is passed to the FOP-1. The data is put into the data field of a TC frame
/// as it is.
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new)]
pub struct Telecommand {
    pub id: CommandId,
    pub data: Vec<u8>,
    /// Send the command in a BD frame, bypassing the sequence control of the FOP-1.
    pub bypass: bool,
    /// Generation time in milliseconds. It is used to order frames in the multiplexer.
    pub generation_time: u64,
}

/// Outcome of a telecommand.
///
/// A command sent in an AD frame is successful once the receiving side acknowledged the frame. A
/// command sent in a BD frame, or while the COP-1 is disabled, is successful once the frame was
/// handed to the lower layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAck {
    pub command_id: CommandId,
    pub result: Result<(), Fop1Error>,
}

/// Receiver of command acknowledgements.
pub trait CommandAckSender: Send {
    fn send_ack(&self, ack: CommandAck) -> Result<(), crate::queue::GenericSendError>;
}

impl CommandAckSender for std::sync::mpsc::Sender<CommandAck> {
    fn send_ack(&self, ack: CommandAck) -> Result<(), crate::queue::GenericSendError> {
        self.send(ack)?;
        Ok(())
    }
}

impl CommandAckSender for crossbeam_channel::Sender<CommandAck> {
    fn send_ack(&self, ack: CommandAck) -> Result<(), crate::queue::GenericSendError> {
        self.send(ack)?;
        Ok(())
    }
}

/// Run-time configurable FOP-1 parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cop1Config {
    pub bd_absolute_priority: bool,
    pub tx_limit: u32,
    pub timeout_type: TimeoutType,
    pub window_width: u8,
    pub t1_initial: Duration,
}

/// CLCW together with the time it was received.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReceivedClcw {
    pub clcw: Clcw,
    pub reception_time: std::time::SystemTime,
}

/// Snapshot of the FOP-1 state of one virtual channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cop1Status {
    pub cop1_active: bool,
    /// Only relevant if the COP-1 is not active.
    pub bypass_all: bool,
    pub state: Fop1State,
    pub suspend_state: Option<Fop1State>,
    pub v_s: u8,
    pub nn_r: u8,
    pub tx_count: u32,
    pub wait_queue_len: usize,
    pub sent_queue_len: usize,
    pub out_queue_len: usize,
    pub last_clcw: Option<ReceivedClcw>,
}

impl Cop1Status {
    pub fn is_suspended(&self) -> bool {
        self.suspend_state.is_some()
    }
}

/// Current time in milliseconds since the UNIX epoch, used as generation time of BC frames.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
