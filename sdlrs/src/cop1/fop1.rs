//! FOP-1 state machine.
//!
//! The event names used in the trace output (E1 to E104) refer to the state table in CCSDS
//! 232.1-B-2, section 5.
use core::time::Duration;
use std::boxed::Box;
use std::collections::VecDeque;
use std::vec::Vec;

use crate::{
    config::{TimeoutType, UplinkVcConfig},
    tc::{TcFrameFactory, TcTransferFrame},
    CommandId, VcId,
};

use super::{
    now_millis, AlertType, Clcw, Cop1Config, Cop1Event, Cop1Status, Fop1Error, Fop1State,
    ReceivedClcw, Telecommand,
};

/// Kind of a frame handed to the lower layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutFrameKind {
    /// Sequence-controlled frame. The next AD frame is released once it was taken.
    Ad,
    /// Control command frame.
    Bc,
    /// Frame sent outside of the sequence control: a BD frame or any frame sent while the COP-1
    /// is disabled. Its commands are complete once it was taken.
    Direct,
}

/// Outputs of the FOP-1 state machine.
pub trait Fop1Sink {
    /// Hands an encoded frame to the lower layer. Fails with [Fop1Error::OutQueueFull] if the
    /// frame can not be accepted.
    fn queue_frame(&mut self, frame: TcTransferFrame, kind: OutFrameKind) -> Result<(), Fop1Error>;
    /// Starts the retransmission timer, replacing a running one.
    fn start_timer(&mut self, timeout: Duration);
    fn cancel_timer(&mut self);
    fn command_done(&mut self, command_id: CommandId, result: Result<(), Fop1Error>);
    fn event(&mut self, event: Cop1Event);
}

#[derive(Debug, Clone)]
struct SentFrame {
    frame: TcTransferFrame,
    to_be_retransmitted: bool,
}

impl SentFrame {
    fn new(frame: TcTransferFrame) -> Self {
        Self {
            frame,
            to_be_retransmitted: false,
        }
    }
}

/// FOP-1 of one uplink virtual channel.
pub struct Fop1 {
    vc_id: VcId,
    factory: TcFrameFactory,
    max_frame_length: usize,
    multiple_commands_per_frame: bool,
    bd_absolute_priority: bool,
    /// K
    window_width: u8,
    t1_initial: Duration,
    tx_limit: u32,
    timeout_type: TimeoutType,
    cop1_active: bool,
    bypass_all: bool,
    state: Fop1State,
    suspend_state: Option<Fop1State>,
    /// V(S), the sequence number of the next new AD frame.
    v_s: u8,
    /// NN(R), the N(R) of the previous CLCW which is also the oldest unacknowledged frame.
    nn_r: u8,
    /// N(R) of the last CLCW.
    n_r: u8,
    tx_count: u32,
    sent_queue: Box<[Option<SentFrame>; 256]>,
    wait_queue: VecDeque<Telecommand>,
    ad_out_ready: bool,
    bc_out_ready: bool,
    pending_bc_frame: Option<SentFrame>,
    last_clcw: Option<ReceivedClcw>,
}

impl Fop1 {
    /// Fails if the sliding window width or the transmission limit is 0.
    pub fn new(config: &UplinkVcConfig, factory: TcFrameFactory) -> Result<Self, Fop1Error> {
        check_limits(config.window_width, config.tx_limit)?;
        Ok(Self {
            vc_id: config.vc_id,
            factory,
            max_frame_length: config.max_frame_length,
            multiple_commands_per_frame: config.multiple_commands_per_frame,
            bd_absolute_priority: config.bd_absolute_priority,
            window_width: config.window_width,
            t1_initial: config.t1_initial,
            tx_limit: config.tx_limit,
            timeout_type: config.timeout_type,
            cop1_active: config.cop1_enabled,
            bypass_all: config.bypass_all,
            state: Fop1State::Initial,
            suspend_state: None,
            v_s: 0,
            nn_r: 0,
            n_r: 0,
            tx_count: 1,
            sent_queue: Box::new(core::array::from_fn(|_| None)),
            wait_queue: VecDeque::new(),
            ad_out_ready: true,
            bc_out_ready: true,
            pending_bc_frame: None,
            last_clcw: None,
        })
    }

    pub fn vc_id(&self) -> VcId {
        self.vc_id
    }

    pub fn state(&self) -> Fop1State {
        self.state
    }

    pub fn suspend_state(&self) -> Option<Fop1State> {
        self.suspend_state
    }

    pub fn v_s(&self) -> u8 {
        self.v_s
    }

    pub fn nn_r(&self) -> u8 {
        self.nn_r
    }

    pub fn tx_count(&self) -> u32 {
        self.tx_count
    }

    pub fn is_cop1_active(&self) -> bool {
        self.cop1_active
    }

    /// Number of frames waiting for an acknowledgement.
    pub fn sent_queue_len(&self) -> usize {
        self.v_s.wrapping_sub(self.nn_r) as usize
    }

    pub fn wait_queue_len(&self) -> usize {
        self.wait_queue.len()
    }

    pub fn config(&self) -> Cop1Config {
        Cop1Config {
            bd_absolute_priority: self.bd_absolute_priority,
            tx_limit: self.tx_limit,
            timeout_type: self.timeout_type,
            window_width: self.window_width,
            t1_initial: self.t1_initial,
        }
    }

    /// E36 to E39: changes the FOP-1 parameters. They are used starting with the next event.
    pub fn set_config(&mut self, config: &Cop1Config) -> Result<(), Fop1Error> {
        check_limits(config.window_width, config.tx_limit)?;
        self.trace_event("E39");
        self.bd_absolute_priority = config.bd_absolute_priority;
        self.tx_limit = config.tx_limit;
        self.timeout_type = config.timeout_type;
        self.window_width = config.window_width;
        self.t1_initial = config.t1_initial;
        Ok(())
    }

    pub fn status(&self) -> Cop1Status {
        Cop1Status {
            cop1_active: self.cop1_active,
            bypass_all: self.bypass_all,
            state: self.state,
            suspend_state: self.suspend_state,
            v_s: self.v_s,
            nn_r: self.nn_r,
            tx_count: self.tx_count,
            wait_queue_len: self.wait_queue.len(),
            sent_queue_len: self.sent_queue_len(),
            out_queue_len: 0,
            last_clcw: self.last_clcw,
        }
    }

    /// Accepts a new telecommand from the higher layer.
    pub fn send_command(&mut self, tc: Telecommand, sink: &mut impl Fop1Sink) {
        log::debug!(
            "VC {} state: {}; received TC {}, bypass: {}, bypass all: {}",
            self.vc_id,
            self.state.name(),
            tc.id,
            tc.bypass,
            self.bypass_all
        );
        let framing = self.factory.framing_length(self.vc_id);
        if framing + tc.data.len() > self.max_frame_length {
            log::warn!(
                "VC {}: command {} does not fit into a frame ({} + {} > {})",
                self.vc_id,
                tc.id,
                framing,
                tc.data.len(),
                self.max_frame_length
            );
            sink.command_done(
                tc.id,
                Err(Fop1Error::CommandTooLarge {
                    length: tc.data.len(),
                    framing,
                    max: self.max_frame_length,
                }),
            );
            return;
        }
        if !self.cop1_active {
            let bypass = self.bypass_all || tc.bypass;
            self.send_single_tc(tc, bypass, sink);
        } else if tc.bypass
            && (self.bd_absolute_priority || self.state >= Fop1State::RetransmitWithWait)
        {
            self.send_single_tc(tc, true, sink);
        } else {
            log::debug!("VC {}: adding command {} to the wait queue", self.vc_id, tc.id);
            self.wait_queue.push_back(tc);
            sink.event(Cop1Event::TcQueued);
            if self.state <= Fop1State::RetransmitWithoutWait {
                self.look_for_fdu(sink);
            }
        }
    }

    /// E35: sets V(S) and NN(R). Only allowed in the initial state when not suspended.
    pub fn set_vs(&mut self, v_s: u8) -> Result<(), Fop1Error> {
        self.trace_event("E35");
        if self.state != Fop1State::Initial {
            return Err(Fop1Error::InvalidState(self.state));
        }
        if self.suspend_state.is_some() {
            return Err(Fop1Error::Suspended);
        }
        self.v_s = v_s;
        self.nn_r = v_s;
        Ok(())
    }

    /// Initiates the AD service. Without CLCW check the FOP-1 becomes active immediately.
    /// Otherwise it waits up to `wait` for a CLCW to synchronize V(S) with the N(R) reported by
    /// the receiving side.
    pub fn initiate_ad(
        &mut self,
        clcw_check: bool,
        wait: Duration,
        sink: &mut impl Fop1Sink,
    ) -> Result<(), Fop1Error> {
        self.pre_init_check(sink)?;
        log::info!(
            "VC {} state: {}; initiating AD {} CLCW check",
            self.vc_id,
            self.state.name(),
            if clcw_check { "with" } else { "without" }
        );
        self.initialize(sink);
        if clcw_check {
            self.trace_event("E24");
            sink.start_timer(wait);
            self.change_state(Fop1State::InitialisingWithoutBc, sink);
        } else {
            self.trace_event("E23");
            self.change_state(Fop1State::Active, sink);
        }
        Ok(())
    }

    /// Initiates the AD service by sending a Set V(R) control command.
    pub fn initiate_ad_with_vr(&mut self, v_r: u8, sink: &mut impl Fop1Sink) -> Result<(), Fop1Error> {
        self.pre_init_check(sink)?;
        log::info!(
            "VC {} state: {}; initiating AD with V(R) {}",
            self.vc_id,
            self.state.name(),
            v_r
        );
        if !self.bc_out_ready {
            self.trace_event("E28");
            return Err(Fop1Error::BcOutNotReady);
        }
        self.trace_event("E27");
        self.initialize(sink);
        self.v_s = v_r;
        self.nn_r = v_r;
        let frame = self.factory.make_set_vr_frame(self.vc_id, v_r, now_millis());
        self.start_bc_frame(frame, sink)
    }

    /// Initiates the AD service by sending an Unlock control command.
    pub fn initiate_ad_with_unlock(&mut self, sink: &mut impl Fop1Sink) -> Result<(), Fop1Error> {
        self.pre_init_check(sink)?;
        log::info!(
            "VC {} state: {}; initiating AD with Unlock",
            self.vc_id,
            self.state.name()
        );
        if !self.bc_out_ready {
            self.trace_event("E26");
            return Err(Fop1Error::BcOutNotReady);
        }
        self.trace_event("E25");
        self.initialize(sink);
        let frame = self.factory.make_unlock_frame(self.vc_id, now_millis());
        self.start_bc_frame(frame, sink)
    }

    /// E29: terminates the AD service.
    pub fn terminate_ad(&mut self, sink: &mut impl Fop1Sink) {
        self.trace_event("E29");
        if self.state != Fop1State::Initial {
            log::info!(
                "VC {} state: {}; terminating AD service",
                self.vc_id,
                self.state.name()
            );
            self.alert(AlertType::Term, sink);
        }
    }

    /// E30 to E34: resumes the AD service in the state it was suspended in.
    pub fn resume(&mut self, sink: &mut impl Fop1Sink) -> Result<(), Fop1Error> {
        let Some(suspend_state) = self.suspend_state else {
            self.trace_event("E30");
            return Err(Fop1Error::NotSuspended);
        };
        if self.state != Fop1State::Initial {
            return Err(Fop1Error::InvalidState(self.state));
        }
        self.trace_event("E31-E34");
        sink.start_timer(self.t1_initial);
        self.suspend_state = None;
        self.change_state(suspend_state, sink);
        Ok(())
    }

    /// Stops using the FOP-1. Commands are then sent as they come, in BD frames if `bypass_all`
    /// is set or if they request it, otherwise in AD frames without sequence control. Any
    /// initiate directive activates the FOP-1 again.
    pub fn disable_cop1(&mut self, bypass_all: bool, sink: &mut impl Fop1Sink) {
        log::info!("VC {}: disabling COP-1, bypass all: {}", self.vc_id, bypass_all);
        self.purge_sent_queue(Fop1Error::Purged, sink);
        self.pending_bc_frame = None;
        self.suspend_state = None;
        self.change_state(Fop1State::Initial, sink);
        self.cop1_active = false;
        self.bypass_all = bypass_all;
        while let Some(tc) = self.wait_queue.pop_front() {
            let bypass = bypass_all || tc.bypass;
            self.send_single_tc(tc, bypass, sink);
        }
        sink.event(Cop1Event::Disabled);
    }

    /// Processes a CLCW received from the remote side.
    pub fn on_clcw(&mut self, clcw: Clcw, sink: &mut impl Fop1Sink) {
        if clcw.vc_id() != self.vc_id {
            log::debug!("VC {}: ignoring CLCW for VC {}", self.vc_id, clcw.vc_id());
            return;
        }
        self.n_r = clcw.report_value();
        self.last_clcw = Some(ReceivedClcw {
            clcw,
            reception_time: std::time::SystemTime::now(),
        });
        if self.state == Fop1State::InitialisingWithoutBc {
            self.v_s = self.n_r;
            self.nn_r = self.n_r;
        }
        log::trace!(
            "VC {} state: {}; received CLCW: lockout: {}, wait: {}, retransmit: {}, N(R): {}",
            self.vc_id,
            self.state.name(),
            clcw.lockout(),
            clcw.wait(),
            clcw.retransmit(),
            self.n_r
        );
        if self.state == Fop1State::Initial {
            return;
        }
        self.process_clcw(clcw, sink);
        sink.event(Cop1Event::ClcwReceived(clcw.raw()));
    }

    fn process_clcw(&mut self, clcw: Clcw, sink: &mut impl Fop1Sink) {
        use Fop1State::*;

        let state = self.state;
        if clcw.lockout() {
            self.trace_event("E14");
            if state <= InitialisingWithoutBc {
                self.alert(AlertType::Lockout, sink);
            }
            return;
        }
        let n_r = self.n_r;
        if n_r == self.v_s {
            if clcw.retransmit() {
                self.trace_event("E4");
                if state <= InitialisingWithoutBc {
                    self.alert(AlertType::Synch, sink);
                }
            } else if clcw.wait() {
                self.trace_event("E3");
                self.alert(AlertType::Clcw, sink);
            } else if state == InitialisingWithoutBc {
                self.trace_event("E1");
                sink.cancel_timer();
                self.change_state(Active, sink);
            } else if state == InitialisingWithBc {
                self.trace_event("E1");
                sink.cancel_timer();
                self.pending_bc_frame = None;
                self.change_state(Active, sink);
            } else if n_r == self.nn_r {
                self.trace_event("E1");
                if state == RetransmitWithoutWait || state == RetransmitWithWait {
                    self.alert(AlertType::Synch, sink);
                }
            } else {
                self.trace_event("E2");
                sink.cancel_timer();
                self.remove_acknowledged_frames(sink);
                self.look_for_fdu(sink);
                self.change_state(Active, sink);
            }
        } else if self.is_n_r_outstanding(n_r) {
            if !clcw.retransmit() {
                if clcw.wait() {
                    self.trace_event("E7");
                    if state <= RetransmitWithWait {
                        self.alert(AlertType::Clcw, sink);
                    }
                } else if n_r == self.nn_r {
                    self.trace_event("E5");
                    if state == RetransmitWithoutWait || state == RetransmitWithWait {
                        self.alert(AlertType::Synch, sink);
                    }
                } else {
                    self.trace_event("E6");
                    if state <= RetransmitWithWait {
                        self.remove_acknowledged_frames(sink);
                        self.look_for_fdu(sink);
                        self.change_state(Active, sink);
                    }
                }
            } else if self.tx_limit == 1 {
                self.trace_event("E101/E102");
                if state <= RetransmitWithWait {
                    self.remove_acknowledged_frames(sink);
                    self.alert(AlertType::Limit, sink);
                }
            } else if n_r != self.nn_r {
                if !clcw.wait() {
                    self.trace_event("E8");
                    if state <= RetransmitWithWait {
                        self.remove_acknowledged_frames(sink);
                        self.initiate_ad_retransmission();
                        self.look_for_fdu(sink);
                        self.change_state(RetransmitWithoutWait, sink);
                    }
                } else {
                    self.trace_event("E9");
                    if state <= RetransmitWithWait {
                        self.remove_acknowledged_frames(sink);
                        self.change_state(RetransmitWithWait, sink);
                    }
                }
            } else if self.tx_count < self.tx_limit {
                if !clcw.wait() {
                    self.trace_event("E10");
                    if state == Active || state == RetransmitWithWait {
                        self.initiate_ad_retransmission();
                        self.look_for_fdu(sink);
                        self.change_state(RetransmitWithoutWait, sink);
                    }
                } else {
                    self.trace_event("E11");
                    if state < RetransmitWithWait {
                        self.change_state(RetransmitWithWait, sink);
                    }
                }
            } else if !clcw.wait() {
                self.trace_event("E12");
                if state == Active || state == RetransmitWithWait {
                    self.change_state(RetransmitWithoutWait, sink);
                }
            } else {
                self.trace_event("E103");
                if state < RetransmitWithWait {
                    self.change_state(RetransmitWithWait, sink);
                }
            }
        } else {
            self.trace_event("E13");
            if state <= InitialisingWithoutBc {
                self.alert(AlertType::Nnr, sink);
            }
        }
    }

    /// Handles the expiry of the retransmission timer.
    pub fn on_timer_expired(&mut self, sink: &mut impl Fop1Sink) {
        use Fop1State::*;

        log::debug!(
            "VC {} state: {}; timer expired, tx count: {}, tx limit: {}",
            self.vc_id,
            self.state.name(),
            self.tx_count,
            self.tx_limit
        );
        let state = self.state;
        if state == Initial {
            return;
        }
        if self.tx_count < self.tx_limit {
            self.trace_event(match self.timeout_type {
                TimeoutType::GoToInitial => "E16",
                TimeoutType::Suspend => "E104",
            });
            match state {
                Active | RetransmitWithoutWait => {
                    self.initiate_ad_retransmission();
                    self.look_for_fdu(sink);
                }
                InitialisingWithoutBc => match self.timeout_type {
                    TimeoutType::GoToInitial => self.alert(AlertType::T1, sink),
                    TimeoutType::Suspend => self.suspend(sink),
                },
                InitialisingWithBc => {
                    self.initiate_bc_retransmission();
                    self.look_for_directive(sink);
                }
                _ => (),
            }
        } else {
            match self.timeout_type {
                TimeoutType::GoToInitial => {
                    self.trace_event("E17");
                    self.alert(AlertType::T1, sink);
                }
                TimeoutType::Suspend => {
                    self.trace_event("E18");
                    if state <= InitialisingWithoutBc {
                        self.suspend(sink);
                    } else {
                        self.alert(AlertType::T1, sink);
                    }
                }
            }
        }
    }

    /// E41: the last AD frame was taken by the lower layer.
    pub fn on_ad_frame_taken(&mut self, sink: &mut impl Fop1Sink) {
        self.trace_event("E41");
        self.ad_out_ready = true;
        if self.state <= Fop1State::RetransmitWithoutWait {
            self.look_for_fdu(sink);
        }
    }

    /// E43: the BC frame was taken by the lower layer.
    pub fn on_bc_frame_taken(&mut self, sink: &mut impl Fop1Sink) {
        self.trace_event("E43");
        self.bc_out_ready = true;
        if self.state == Fop1State::InitialisingWithBc {
            self.look_for_directive(sink);
        }
    }

    /// Fails all commands which are still queued. Called when the engine stops.
    pub fn shutdown(&mut self, sink: &mut impl Fop1Sink) {
        self.purge_sent_queue(Fop1Error::LinkDisabled, sink);
        self.purge_wait_queue(Fop1Error::LinkDisabled, sink);
        self.pending_bc_frame = None;
        sink.cancel_timer();
    }

    fn pre_init_check(&mut self, sink: &mut impl Fop1Sink) -> Result<(), Fop1Error> {
        if !self.cop1_active {
            self.cop1_active = true;
            self.change_state(Fop1State::Initial, sink);
            return Ok(());
        }
        if self.state != Fop1State::Initial {
            return Err(Fop1Error::InvalidState(self.state));
        }
        Ok(())
    }

    fn initialize(&mut self, sink: &mut impl Fop1Sink) {
        self.purge_sent_queue(Fop1Error::Purged, sink);
        self.purge_wait_queue(Fop1Error::Purged, sink);
        self.pending_bc_frame = None;
        self.tx_count = 1;
        self.suspend_state = None;
    }

    fn start_bc_frame(
        &mut self,
        mut frame: TcTransferFrame,
        sink: &mut impl Fop1Sink,
    ) -> Result<(), Fop1Error> {
        self.factory.encode_frame(&mut frame)?;
        self.change_state(Fop1State::InitialisingWithBc, sink);
        self.pending_bc_frame = Some(SentFrame::new(frame));
        self.tx_count = 1;
        self.send_bc_downstream(sink);
        // The lower layer may have refused the frame.
        if self.state == Fop1State::Initial {
            return Err(Fop1Error::Alert(AlertType::Llif));
        }
        Ok(())
    }

    fn suspend(&mut self, sink: &mut impl Fop1Sink) {
        log::debug!("VC {}: FOP-1 suspended in state {}", self.vc_id, self.state.name());
        self.suspend_state = Some(self.state);
        sink.event(Cop1Event::Suspended(self.state));
        self.change_state(Fop1State::Initial, sink);
    }

    fn change_state(&mut self, new: Fop1State, sink: &mut impl Fop1Sink) {
        let old = self.state;
        if old == new {
            return;
        }
        log::debug!("VC {}: state {} -> {}", self.vc_id, old.name(), new.name());
        self.state = new;
        if new == Fop1State::Initial {
            sink.cancel_timer();
        }
        sink.event(Cop1Event::StateChanged { old, new });
    }

    fn alert(&mut self, alert: AlertType, sink: &mut impl Fop1Sink) {
        log::warn!(
            "VC {} state: {}; FOP-1 alert {:?}",
            self.vc_id,
            self.state.name(),
            alert
        );
        self.purge_sent_queue(Fop1Error::Alert(alert), sink);
        self.pending_bc_frame = None;
        sink.event(Cop1Event::Alert(alert));
        self.change_state(Fop1State::Initial, sink);
    }

    /// Removes all outstanding frames and fails their commands.
    fn purge_sent_queue(&mut self, reason: Fop1Error, sink: &mut impl Fop1Sink) {
        let mut seq = self.nn_r;
        while seq != self.v_s {
            if let Some(sent) = self.sent_queue[seq as usize].take() {
                for command_id in sent.frame.commands() {
                    sink.command_done(*command_id, Err(reason.clone()));
                }
            }
            seq = seq.wrapping_add(1);
        }
        self.nn_r = self.v_s;
    }

    fn purge_wait_queue(&mut self, reason: Fop1Error, sink: &mut impl Fop1Sink) {
        for tc in self.wait_queue.drain(..) {
            sink.command_done(tc.id, Err(reason.clone()));
        }
    }

    /// N(R) lies in the range NN(R) to V(S), both inclusive.
    fn is_n_r_outstanding(&self, n_r: u8) -> bool {
        n_r.wrapping_sub(self.nn_r) <= self.v_s.wrapping_sub(self.nn_r)
    }

    fn remove_acknowledged_frames(&mut self, sink: &mut impl Fop1Sink) {
        while self.nn_r != self.n_r {
            if let Some(sent) = self.sent_queue[self.nn_r as usize].take() {
                for command_id in sent.frame.commands() {
                    sink.command_done(*command_id, Ok(()));
                }
            }
            self.nn_r = self.nn_r.wrapping_add(1);
        }
        self.tx_count = 1;
    }

    fn initiate_ad_retransmission(&mut self) {
        self.tx_count += 1;
        let mut seq = self.nn_r;
        while seq != self.v_s {
            if let Some(sent) = self.sent_queue[seq as usize].as_mut() {
                log::debug!(
                    "VC {}: retransmitting frame {}, tx count: {}, tx limit: {}",
                    self.vc_id,
                    seq,
                    self.tx_count,
                    self.tx_limit
                );
                sent.to_be_retransmitted = true;
            }
            seq = seq.wrapping_add(1);
        }
    }

    fn initiate_bc_retransmission(&mut self) {
        self.tx_count += 1;
        if let Some(pending) = self.pending_bc_frame.as_mut() {
            pending.to_be_retransmitted = true;
        }
    }

    /// Sends the next frame which is marked for retransmission or, if there is none and the
    /// window is not full, a new frame built from the wait queue.
    fn look_for_fdu(&mut self, sink: &mut impl Fop1Sink) {
        if !self.ad_out_ready {
            return;
        }
        let mut seq = self.nn_r;
        while seq != self.v_s {
            if let Some(sent) = self.sent_queue[seq as usize].as_mut() {
                if sent.to_be_retransmitted {
                    sent.to_be_retransmitted = false;
                    self.send_ad_downstream(seq, sink);
                    return;
                }
            }
            seq = seq.wrapping_add(1);
        }
        if self.sent_queue_len() >= self.window_width as usize {
            return;
        }
        let Some(mut frame) = self.next_queued_frame(sink) else {
            return;
        };
        frame.set_frame_seq(self.v_s);
        if self.nn_r == self.v_s {
            self.tx_count = 1;
        }
        let seq = self.v_s;
        self.sent_queue[seq as usize] = Some(SentFrame::new(frame));
        self.v_s = self.v_s.wrapping_add(1);
        self.send_ad_downstream(seq, sink);
        sink.event(Cop1Event::TcSent);
    }

    fn look_for_directive(&mut self, sink: &mut impl Fop1Sink) {
        if !self.bc_out_ready {
            return;
        }
        if let Some(pending) = self.pending_bc_frame.as_mut() {
            if pending.to_be_retransmitted {
                pending.to_be_retransmitted = false;
                self.send_bc_downstream(sink);
            }
        }
    }

    fn send_ad_downstream(&mut self, seq: u8, sink: &mut impl Fop1Sink) {
        let Some(sent) = self.sent_queue[seq as usize].as_ref() else {
            return;
        };
        let mut frame = sent.frame.clone();
        self.ad_out_ready = false;
        sink.start_timer(self.t1_initial);
        let result = self
            .factory
            .encode_frame(&mut frame)
            .map_err(Fop1Error::from)
            .and_then(|_| sink.queue_frame(frame, OutFrameKind::Ad));
        if let Err(e) = result {
            log::warn!("VC {}: AD frame {} not accepted: {}", self.vc_id, seq, e);
            self.ad_out_ready = true;
            self.alert(AlertType::Llif, sink);
        }
    }

    fn send_bc_downstream(&mut self, sink: &mut impl Fop1Sink) {
        let Some(pending) = self.pending_bc_frame.as_ref() else {
            return;
        };
        let frame = pending.frame.clone();
        self.bc_out_ready = false;
        sink.start_timer(self.t1_initial);
        if let Err(e) = sink.queue_frame(frame, OutFrameKind::Bc) {
            self.trace_event("E44");
            log::warn!("VC {}: BC frame not accepted: {}", self.vc_id, e);
            self.bc_out_ready = true;
            self.alert(AlertType::Llif, sink);
        }
    }

    fn send_single_tc(&mut self, tc: Telecommand, bypass: bool, sink: &mut impl Fop1Sink) {
        let mut frame = self
            .factory
            .make_frame(self.vc_id, tc.data.len(), tc.generation_time);
        frame.data_mut().copy_from_slice(&tc.data);
        frame.set_bypass(bypass);
        frame.add_command(tc.id);
        let result = self
            .factory
            .encode_frame(&mut frame)
            .map_err(Fop1Error::from)
            .and_then(|_| sink.queue_frame(frame, OutFrameKind::Direct));
        if let Err(e) = result {
            log::warn!("VC {}: command {} could not be sent: {}", self.vc_id, tc.id, e);
            sink.command_done(tc.id, Err(e));
        }
    }

    /// Packs commands from the wait queue into a new AD frame. Bypass commands found on the way
    /// are sent on their own.
    fn next_queued_frame(&mut self, sink: &mut impl Fop1Sink) -> Option<TcTransferFrame> {
        let framing = self.factory.framing_length(self.vc_id);
        let mut data_len = 0;
        let mut commands: Vec<Telecommand> = Vec::new();
        while let Some(tc) = self.wait_queue.pop_front() {
            if tc.bypass {
                self.send_single_tc(tc, true, sink);
                continue;
            }
            if framing + data_len + tc.data.len() > self.max_frame_length {
                self.wait_queue.push_front(tc);
                break;
            }
            data_len += tc.data.len();
            commands.push(tc);
            if !self.multiple_commands_per_frame {
                break;
            }
        }
        let first = commands.first()?;
        let mut frame = self
            .factory
            .make_frame(self.vc_id, data_len, first.generation_time);
        let mut offset = 0;
        for tc in &commands {
            frame.data_mut()[offset..offset + tc.data.len()].copy_from_slice(&tc.data);
            offset += tc.data.len();
            frame.add_command(tc.id);
        }
        Some(frame)
    }

    fn trace_event(&self, event: &str) {
        log::trace!(
            "VC {} state: {}, N(R): {}, NN(R): {}, V(S): {}, event: {}",
            self.vc_id,
            self.state.name(),
            self.n_r,
            self.nn_r,
            self.v_s,
            event
        );
    }
}

fn check_limits(window_width: u8, tx_limit: u32) -> Result<(), Fop1Error> {
    if window_width == 0 {
        return Err(Fop1Error::InvalidWindowWidth(0));
    }
    if tx_limit == 0 {
        return Err(Fop1Error::InvalidTxLimit);
    }
    Ok(())
}
