//! Streaming points to an Ether Dream DAC.
//!
//! A `Stream` owns a supervisor thread which maintains one TCP session with
//! its DAC at a time, replacing the session whenever the connection becomes
//! unusable. Point blocks are queued via the stream handle and paced onto the
//! wire against a model of the DAC's remote buffer fullness.

mod session;

use crate::dac::DetectedDac;
use crate::point::PointBlock;
use session::{Session, SharedState};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Timeout applied to every read and write on the DAC control channel.
pub const COMM_TIMEOUT: Duration = Duration::from_millis(500);
/// Timeout for establishing the TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// The smallest DATA payload worth the per-command overhead.
pub const MIN_POINTS_PER_SEND: u16 = 40;
/// The largest DATA payload; fits an Ethernet MTU with header overhead.
pub const MAX_POINTS_PER_SEND: u16 = 80;
/// The modeled fullness the sender drives the DAC buffer towards
/// (~75 ms at 48 kpps).
pub const TARGET_FULLNESS: u16 = 3600;
/// The reported fullness at which BEGIN is issued for a play session.
pub const START_THRESHOLD: u16 = 3000;
/// Most point blocks retained in the send queue; later arrivals are dropped.
pub(crate) const MAX_QUEUED_FRAMES: usize = 3;

/// The error returned by stream operations once the stream has been closed.
#[derive(Debug, Error)]
#[error("the DAC stream has been closed")]
pub struct StreamClosed;

/// A handle to a point stream targeting one DAC.
///
/// Dropping the handle closes the stream and joins its supervisor thread.
pub struct Stream {
    dac: DetectedDac,
    shared: Arc<SharedState>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Stream {
    pub(crate) fn new(dac: DetectedDac) -> Stream {
        let shared = Arc::new(SharedState::new());
        let shared2 = shared.clone();
        let dac2 = dac.clone();
        let thread = std::thread::Builder::new()
            .name("laser_wav-dac-stream".to_string())
            .spawn(move || run_dac_stream(dac2, shared2))
            .expect("failed to spawn DAC stream thread");
        Stream {
            dac,
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// The DAC this stream was built for.
    pub fn dac(&self) -> &DetectedDac {
        &self.dac
    }

    /// Queue a block of points for transmission.
    ///
    /// At most three blocks are retained; when the queue is full the incoming
    /// block is dropped and a warning logged, so callers are never blocked on
    /// the DAC.
    pub fn add_frame(&self, block: PointBlock) -> Result<(), StreamClosed> {
        if self.shared.is_shutting_down() {
            return Err(StreamClosed);
        }
        self.shared.add_frame(block);
        Ok(())
    }

    /// Whether the send queue has drained enough to accept another block
    /// without dropping it.
    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Block until at most one block remains queued, or the stream closes.
    pub fn wait_for_ready(&self) -> Result<(), StreamClosed> {
        if self.shared.wait_for_ready() {
            Ok(())
        } else {
            Err(StreamClosed)
        }
    }

    /// Request termination without waiting: queued `wait_for_ready` calls
    /// unblock and later operations return `StreamClosed`.
    pub fn shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Close the stream and wait for the supervisor thread to join.
    pub fn close(self) {
        self.close_inner()
    }

    // Shared between the `close` and `Drop` implementations.
    fn close_inner(&self) {
        self.shared.request_shutdown();
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(thread) = guard.take() {
                thread.join().ok();
            }
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close_inner();
    }
}

// The supervisor: owns one session at a time and replaces it for as long as
// the stream is open. Networks come back, so there is no retry limit.
fn run_dac_stream(dac: DetectedDac, shared: Arc<SharedState>) {
    loop {
        if shared.is_shutting_down() {
            return;
        }
        let mut session = match Session::connect(&dac, shared.clone()) {
            Ok(session) => session,
            Err(err) => {
                log::warn!("failed to connect to DAC {}: {}", dac.id, err);
                std::thread::sleep(COMM_TIMEOUT);
                continue;
            }
        };
        match session.run_sender() {
            Ok(()) => return,
            Err(err) => {
                log::warn!("session with DAC {} ended: {}; reconnecting", dac.id, err);
                std::thread::sleep(COMM_TIMEOUT);
            }
        }
    }
}
