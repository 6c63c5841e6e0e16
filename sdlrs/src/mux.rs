//! Uplink frame multiplexer.
//!
//! The [FrameMultiplexer] selects the next TC transfer frame to be sent across the uplink
//! virtual channels of one master channel. Each virtual channel is represented by a
//! [VcUplinkHandler], usually a [crate::cop1::Fop1Handle]. The handlers signal new frames through
//! a shared [DataAvailable] notifier, so the consumer of the multiplexer can block until a frame
//! is ready.
use core::cmp::Reverse;
use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use std::vec::Vec;

use crossbeam_channel::{Receiver, Sender};

use crate::{config::MultiplexingScheme, tc::TcTransferFrame, VcId};

/// Source of uplink frames for one virtual channel.
pub trait VcUplinkHandler: Send + Sync {
    fn vc_id(&self) -> VcId;
    /// Priority for [MultiplexingScheme::AbsolutePriority], higher is served first. For
    /// [MultiplexingScheme::PollingVector] this is the number of consecutive frames the virtual
    /// channel may send.
    fn priority(&self) -> u32;
    /// Generation time of the next frame, [None] if no frame is ready.
    fn first_frame_timestamp(&self) -> Option<u64>;
    fn get_frame(&self) -> Option<TcTransferFrame>;
    /// Called once by the multiplexer. The handler must signal the notifier whenever a new frame
    /// becomes ready.
    fn set_data_available(&self, data_available: DataAvailable);
}

/// Wake-up notifier shared by the multiplexer and its handlers. Signals are coalesced.
#[derive(Debug, Clone)]
pub struct DataAvailable {
    tx: Sender<()>,
    rx: Receiver<()>,
    quit: Arc<AtomicBool>,
}

impl Default for DataAvailable {
    fn default() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self {
            tx,
            rx,
            quit: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl DataAvailable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        // A full channel already holds a pending signal.
        let _ = self.tx.try_send(());
    }

    /// Blocks until a signal arrives. Returns false once [Self::quit] was called.
    pub fn wait(&self) -> bool {
        if self.is_quit() {
            return false;
        }
        let _ = self.rx.recv();
        self.check_quit()
    }

    /// Returns true if a signal arrived within the timeout and [Self::quit] was not called.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_quit() {
            return false;
        }
        if self.rx.recv_timeout(timeout).is_err() {
            return false;
        }
        self.check_quit()
    }

    /// Wakes up all waiters permanently.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        self.signal();
    }

    pub fn is_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    fn check_quit(&self) -> bool {
        if self.is_quit() {
            // Pass the wake-up on to the next waiter.
            self.signal();
            return false;
        }
        true
    }
}

/// Selects uplink frames across virtual channels according to a [MultiplexingScheme].
pub struct FrameMultiplexer {
    scheme: MultiplexingScheme,
    handlers: Vec<Arc<dyn VcUplinkHandler>>,
    data_available: DataAvailable,
    // Polling vector state.
    position: usize,
    sent_in_slot: u32,
}

impl FrameMultiplexer {
    pub fn new(scheme: MultiplexingScheme, mut handlers: Vec<Arc<dyn VcUplinkHandler>>) -> Self {
        let data_available = DataAvailable::new();
        for handler in &handlers {
            handler.set_data_available(data_available.clone());
        }
        if scheme == MultiplexingScheme::AbsolutePriority {
            handlers.sort_by_key(|handler| Reverse(handler.priority()));
        }
        Self {
            scheme,
            handlers,
            data_available,
            position: 0,
            sent_in_slot: 0,
        }
    }

    pub fn scheme(&self) -> MultiplexingScheme {
        self.scheme
    }

    pub fn num_handlers(&self) -> usize {
        self.handlers.len()
    }

    pub fn data_available(&self) -> &DataAvailable {
        &self.data_available
    }

    /// Unblocks [Self::get_frame]. Subsequent calls return [None] immediately.
    pub fn quit(&self) {
        self.data_available.quit();
    }

    /// Returns the next frame without blocking.
    pub fn try_get_frame(&mut self) -> Option<TcTransferFrame> {
        match self.scheme {
            MultiplexingScheme::Fifo => self.next_fifo(),
            MultiplexingScheme::AbsolutePriority => self
                .handlers
                .iter()
                .find_map(|handler| handler.get_frame()),
            MultiplexingScheme::PollingVector => self.next_polling_vector(),
        }
    }

    /// Blocks until a frame is available. Returns [None] after [Self::quit] was called.
    pub fn get_frame(&mut self) -> Option<TcTransferFrame> {
        loop {
            if self.data_available.is_quit() {
                return None;
            }
            if let Some(frame) = self.try_get_frame() {
                return Some(frame);
            }
            if !self.data_available.wait() {
                return None;
            }
        }
    }

    /// Like [Self::get_frame] but gives up after the timeout.
    pub fn get_frame_timeout(&mut self, timeout: Duration) -> Option<TcTransferFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.data_available.is_quit() {
                return None;
            }
            if let Some(frame) = self.try_get_frame() {
                return Some(frame);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if !self.data_available.wait_timeout(remaining) && self.data_available.is_quit() {
                return None;
            }
        }
    }

    fn next_fifo(&self) -> Option<TcTransferFrame> {
        let mut candidates: Vec<(u64, VcId, &Arc<dyn VcUplinkHandler>)> = self
            .handlers
            .iter()
            .filter_map(|handler| {
                handler
                    .first_frame_timestamp()
                    .map(|time| (time, handler.vc_id(), handler))
            })
            .collect();
        // Ties go to the lower virtual channel ID.
        candidates.sort_by_key(|(time, vc_id, _)| (*time, *vc_id));
        candidates
            .into_iter()
            .find_map(|(_, _, handler)| handler.get_frame())
    }

    fn next_polling_vector(&mut self) -> Option<TcTransferFrame> {
        for _ in 0..self.handlers.len() {
            let handler = self.handlers[self.position].clone();
            if let Some(frame) = handler.get_frame() {
                self.sent_in_slot += 1;
                if self.sent_in_slot >= handler.priority().max(1) {
                    self.advance();
                }
                return Some(frame);
            }
            self.advance();
        }
        None
    }

    fn advance(&mut self) {
        self.position = (self.position + 1) % self.handlers.len();
        self.sent_in_slot = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::thread;
    use std::vec;

    use super::*;
    use crate::{codec::crc::ErrorDetection, tc::TcFrameFactory};

    struct TestHandler {
        vc_id: VcId,
        priority: u32,
        frames: Mutex<VecDeque<TcTransferFrame>>,
        data_available: Mutex<Option<DataAvailable>>,
    }

    impl TestHandler {
        fn new(vc_id: VcId, priority: u32) -> Arc<Self> {
            Arc::new(Self {
                vc_id,
                priority,
                frames: Mutex::new(VecDeque::new()),
                data_available: Mutex::new(None),
            })
        }

        fn push(&self, generation_time: u64) {
            let factory = TcFrameFactory::new(0x10, ErrorDetection::None);
            let frame = factory.make_frame(self.vc_id, 1, generation_time);
            self.frames.lock().unwrap().push_back(frame);
            if let Some(data_available) = self.data_available.lock().unwrap().as_ref() {
                data_available.signal();
            }
        }
    }

    impl VcUplinkHandler for TestHandler {
        fn vc_id(&self) -> VcId {
            self.vc_id
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        fn first_frame_timestamp(&self) -> Option<u64> {
            self.frames
                .lock()
                .unwrap()
                .front()
                .map(|frame| frame.generation_time())
        }

        fn get_frame(&self) -> Option<TcTransferFrame> {
            self.frames.lock().unwrap().pop_front()
        }

        fn set_data_available(&self, data_available: DataAvailable) {
            *self.data_available.lock().unwrap() = Some(data_available);
        }
    }

    fn mux(scheme: MultiplexingScheme, handlers: &[Arc<TestHandler>]) -> FrameMultiplexer {
        FrameMultiplexer::new(
            scheme,
            handlers
                .iter()
                .map(|handler| handler.clone() as Arc<dyn VcUplinkHandler>)
                .collect(),
        )
    }

    fn drain(mux: &mut FrameMultiplexer) -> Vec<(VcId, u64)> {
        let mut frames = Vec::new();
        while let Some(frame) = mux.try_get_frame() {
            frames.push((frame.vc_id(), frame.generation_time()));
        }
        frames
    }

    #[test]
    fn test_fifo() {
        let vc1 = TestHandler::new(1, 0);
        let vc2 = TestHandler::new(2, 0);
        vc2.push(5);
        vc2.push(20);
        vc1.push(10);
        vc1.push(20);
        let mut mux = mux(MultiplexingScheme::Fifo, &[vc2.clone(), vc1.clone()]);
        assert_eq!(
            drain(&mut mux),
            vec![(2, 5), (1, 10), (1, 20), (2, 20)]
        );
    }

    #[test]
    fn test_absolute_priority() {
        let low = TestHandler::new(1, 1);
        let high = TestHandler::new(2, 7);
        let also_low = TestHandler::new(3, 1);
        for time in 0..2 {
            low.push(time);
            high.push(time + 10);
            also_low.push(time + 20);
        }
        let mut mux = mux(
            MultiplexingScheme::AbsolutePriority,
            &[also_low.clone(), low.clone(), high.clone()],
        );
        assert_eq!(
            drain(&mut mux),
            vec![(2, 10), (2, 11), (3, 20), (3, 21), (1, 0), (1, 1)]
        );
    }

    #[test]
    fn test_polling_vector() {
        let a = TestHandler::new(1, 2);
        let b = TestHandler::new(2, 1);
        for time in 0..4 {
            a.push(time);
            b.push(time);
        }
        let mut mux = mux(MultiplexingScheme::PollingVector, &[a.clone(), b.clone()]);
        let vcs: Vec<VcId> = (0..6)
            .map(|_| mux.try_get_frame().unwrap().vc_id())
            .collect();
        assert_eq!(vcs, vec![1, 1, 2, 1, 1, 2]);
        // A is empty now, B continues.
        let vcs: Vec<VcId> = drain(&mut mux).into_iter().map(|(vc, _)| vc).collect();
        assert_eq!(vcs, vec![2, 2]);
        assert!(mux.try_get_frame().is_none());
    }

    #[test]
    fn test_blocking_get_frame() {
        let vc = TestHandler::new(4, 0);
        let mut mux = mux(MultiplexingScheme::Fifo, &[vc.clone()]);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            vc.push(33);
        });
        let frame = mux.get_frame().unwrap();
        assert_eq!(frame.generation_time(), 33);
        producer.join().unwrap();
    }

    #[test]
    fn test_quit_unblocks() {
        let vc = TestHandler::new(4, 0);
        let mut mux = mux(MultiplexingScheme::Fifo, &[vc]);
        let data_available = mux.data_available().clone();
        let quitter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            data_available.quit();
        });
        assert!(mux.get_frame().is_none());
        quitter.join().unwrap();
        assert!(mux.get_frame().is_none());
        assert!(!mux.data_available().wait());
    }

    #[test]
    fn test_get_frame_timeout() {
        let vc = TestHandler::new(4, 0);
        let mut mux = mux(MultiplexingScheme::Fifo, &[vc.clone()]);
        assert!(mux.get_frame_timeout(Duration::from_millis(10)).is_none());
        vc.push(1);
        assert!(mux.get_frame_timeout(Duration::from_millis(10)).is_some());
    }
}
