//! A single TCP session with a DAC: handshake, response reader and the
//! pacing sender.

use crate::dac::DetectedDac;
use crate::point::PointBlock;
use crate::protocol::{
    self, command, response, DacResponse, DacStatus, PlaybackState, RESPONSE_BYTES, VERSION_BYTES,
};
use crate::stream::{
    COMM_TIMEOUT, CONNECT_TIMEOUT, MAX_POINTS_PER_SEND, MAX_QUEUED_FRAMES, MIN_POINTS_PER_SEND,
    START_THRESHOLD, TARGET_FULLNESS,
};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that end a DAC session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("control channel I/O failed: {err}")]
    Io {
        #[from]
        err: io::Error,
    },
    /// The DAC answered with something other than ACK or NAK-invalid.
    #[error("DAC rejected command {command:?} with response 0x{response:02x}")]
    Rejected { response: u8, command: u8 },
    /// A response arrived that no outstanding command accounts for.
    #[error("response for command {command:?} matches no outstanding command")]
    UnmatchedResponse { command: u8 },
    /// No response within the communication timeout while data was queued.
    #[error("DAC stopped responding while data was queued")]
    ResponseTimedOut,
    #[error("prepare was not acknowledged in time")]
    PrepareTimedOut,
}

// Book-keeping shared by the sender, the reader and the stream handle. One
// lock guards all of it; network writes happen with the lock released.
pub(crate) struct State {
    /// Most recent status block read from the DAC.
    pub(crate) status: DacStatus,
    /// When `status` was read.
    pub(crate) status_received_at: Instant,
    /// Point counts of DATA commands awaiting their ACK, oldest first.
    pub(crate) unacked_blocks: VecDeque<u16>,
    /// Point blocks awaiting transmission.
    pub(crate) frames: VecDeque<PointBlock>,
    /// Points of the head block already transmitted.
    pub(crate) frame_cursor: usize,
    /// Outstanding ACKs for non-data commands.
    pub(crate) pending_meta_acks: u32,
    /// Whether BEGIN has been issued for the current play session.
    pub(crate) begin_sent: bool,
    /// Terminal shutdown requested via the stream handle.
    pub(crate) shutting_down: bool,
    /// The current session is unusable and must be replaced.
    pub(crate) dead: bool,
    /// What killed the session, held for the sender to surface.
    pub(crate) fatal: Option<SessionError>,
}

pub(crate) struct SharedState {
    state: Mutex<State>,
    cond: Condvar,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        SharedState {
            state: Mutex::new(State {
                status: DacStatus::default(),
                status_received_at: Instant::now(),
                unacked_blocks: VecDeque::new(),
                frames: VecDeque::new(),
                frame_cursor: 0,
                pending_meta_acks: 0,
                begin_sent: false,
                shutting_down: false,
                dead: false,
                fatal: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.cond.wait(guard).unwrap_or_else(|err| err.into_inner())
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, State>,
        timeout: Duration,
    ) -> MutexGuard<'a, State> {
        self.cond
            .wait_timeout(guard, timeout)
            .map(|(guard, _)| guard)
            .unwrap_or_else(|err| err.into_inner().0)
    }

    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Queue a block for transmission, dropping it if the queue is full.
    pub(crate) fn add_frame(&self, block: PointBlock) {
        let mut state = self.lock();
        if state.frames.len() >= MAX_QUEUED_FRAMES {
            log::warn!(
                "send queue is full; dropping a {}-point block",
                block.len()
            );
            return;
        }
        state.frames.push_back(block);
        drop(state);
        self.notify_all();
    }

    /// Whether the queue has drained enough for another block.
    pub(crate) fn is_ready(&self) -> bool {
        self.lock().frames.len() <= 1
    }

    /// Block until `is_ready` or shutdown. Returns `false` on shutdown.
    pub(crate) fn wait_for_ready(&self) -> bool {
        let mut state = self.lock();
        while state.frames.len() > 1 && !state.shutting_down {
            state = self.wait(state);
        }
        !state.shutting_down
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub(crate) fn request_shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify_all();
    }

    // Reset the per-session fields for a fresh connection. Queued frames
    // survive the swap; the partially sent head block is not replayed.
    fn reset_for_session(&self, status: DacStatus) {
        let mut state = self.lock();
        state.status = status;
        state.status_received_at = Instant::now();
        state.unacked_blocks.clear();
        state.pending_meta_acks = 0;
        state.begin_sent = false;
        state.dead = false;
        state.fatal = None;
    }
}

/// One live TCP connection to a DAC.
pub(crate) struct Session {
    tcp: TcpStream,
    shared: Arc<SharedState>,
    reader: Option<std::thread::JoinHandle<()>>,
    last_rate: Option<u32>,
}

impl Session {
    /// Connect, read the unsolicited status, query the firmware version and
    /// start the response reader.
    pub(crate) fn connect(
        dac: &DetectedDac,
        shared: Arc<SharedState>,
    ) -> Result<Session, SessionError> {
        let tcp = TcpStream::connect_timeout(&dac.stream_addr(), CONNECT_TIMEOUT)?;
        tcp.set_read_timeout(Some(COMM_TIMEOUT))?;
        tcp.set_write_timeout(Some(COMM_TIMEOUT))?;

        // The DAC sends one unsolicited response on connect.
        let mut bytes = [0u8; RESPONSE_BYTES];
        (&tcp).read_exact(&mut bytes)?;
        let initial = DacResponse::read_from(&bytes);
        tcp.set_nodelay(true)?;

        let firmware_version = if dac.sw_revision >= 2 {
            (&tcp).write_all(&[command::VERSION])?;
            let mut bytes = [0u8; VERSION_BYTES];
            (&tcp).read_exact(&mut bytes)?;
            let end = bytes
                .iter()
                .rposition(|&b| b != b' ' && b != 0)
                .map(|i| i + 1)
                .unwrap_or(0);
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        } else {
            "[old]".to_string()
        };
        log::info!("connected to DAC {} (firmware {})", dac.id, firmware_version);

        shared.reset_for_session(initial.status);

        let reader_tcp = tcp.try_clone()?;
        let reader_shared = shared.clone();
        let reader = std::thread::Builder::new()
            .name("laser_wav-dac-session-reader".to_string())
            .spawn(move || run_reader(reader_tcp, reader_shared))
            .expect("failed to spawn DAC session reader thread");

        Ok(Session {
            tcp,
            shared,
            reader: Some(reader),
            last_rate: None,
        })
    }

    /// Run the sender until the session dies or shutdown is requested.
    ///
    /// Returns `Ok(())` on shutdown; any error means the connection must be
    /// discarded.
    pub(crate) fn run_sender(&mut self) -> Result<(), SessionError> {
        let result = self.sender_loop();
        self.teardown();
        result
    }

    fn sender_loop(&mut self) -> Result<(), SessionError> {
        loop {
            let mut state = self.shared.lock();
            while state.frames.is_empty() && !state.shutting_down && !state.dead {
                state = self.shared.wait(state);
            }
            if state.shutting_down {
                return Ok(());
            }
            if state.dead {
                return Err(state.fatal.take().unwrap_or(SessionError::ResponseTimedOut));
            }

            // Exhausted blocks leave nothing to send.
            if state.frames[0].len() == state.frame_cursor {
                state.frames.pop_front();
                state.frame_cursor = 0;
                drop(state);
                self.shared.notify_all();
                continue;
            }

            let rate = state.frames[0].rate();

            // Start the play session once the DAC reports enough buffered.
            if !state.begin_sent && state.status.buffer_fullness >= START_THRESHOLD {
                state.pending_meta_acks += 1;
                state.begin_sent = true;
                self.last_rate = Some(rate);
                drop(state);
                (&self.tcp).write_all(&protocol::begin_bytes(rate))?;
                log::debug!("sent begin at {} pps", rate);
                continue;
            }

            // Model the DAC buffer from the last status, the wall clock and
            // the in-flight point counts.
            let unacked: i64 = state.unacked_blocks.iter().map(|&n| n as i64).sum();
            let capacity = send_capacity(
                &state.status,
                state.status_received_at.elapsed(),
                unacked,
                rate,
            );

            // Too little room for a worthwhile write; sleep until the DAC
            // should have drained past it.
            if capacity < MIN_POINTS_PER_SEND as i64 {
                let state = self.shared.wait_timeout(state, pacing_wait(capacity, rate));
                drop(state);
                continue;
            }

            // The DAC will not accept data until prepared.
            if state.status.playback() == PlaybackState::Idle {
                state.pending_meta_acks += 1;
                drop(state);
                (&self.tcp).write_all(&[command::PREPARE])?;
                log::debug!("sent prepare");
                state = self.shared.lock();
                let deadline = Instant::now() + COMM_TIMEOUT;
                while state.pending_meta_acks > 0 && !state.shutting_down && !state.dead {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SessionError::PrepareTimedOut);
                    }
                    state = self.shared.wait_timeout(state, deadline - now);
                }
                if state.shutting_down {
                    return Ok(());
                }
                if state.dead {
                    return Err(state.fatal.take().unwrap_or(SessionError::ResponseTimedOut));
                }
                drop(state);
                continue;
            }

            // Slice the next run of points off the head block.
            let remaining = state.frames[0].len() - state.frame_cursor;
            let n_points = (capacity as usize)
                .min(remaining)
                .min(MAX_POINTS_PER_SEND as usize);
            let queue_rate = if self.last_rate != Some(rate) {
                state.pending_meta_acks += 1;
                self.last_rate = Some(rate);
                true
            } else {
                false
            };
            let points = state
                .frames[0]
                .point_bytes(state.frame_cursor, n_points)
                .to_vec();
            state.frame_cursor += n_points;
            if state.frame_cursor == state.frames[0].len() {
                state.frames.pop_front();
                state.frame_cursor = 0;
            }
            state.unacked_blocks.push_back(n_points as u16);
            drop(state);
            self.shared.notify_all();

            let mut message =
                Vec::with_capacity(5 + 3 + points.len());
            if queue_rate {
                message.extend_from_slice(&protocol::point_rate_bytes(rate));
            }
            message.extend_from_slice(&protocol::data_header_bytes(n_points as u16));
            let payload_start = message.len();
            message.extend_from_slice(&points);
            if queue_rate {
                // The first point after a QUEUE carries the rate-change flag
                // in the high byte of its control field.
                message[payload_start + 1] |= 0x80;
            }
            (&self.tcp).write_all(&message)?;
        }
    }

    fn teardown(&mut self) {
        {
            let mut state = self.shared.lock();
            state.dead = true;
        }
        self.shared.notify_all();
        self.tcp.shutdown(std::net::Shutdown::Both).ok();
        if let Some(reader) = self.reader.take() {
            reader.join().ok();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// How many points may be written before the modeled DAC buffer would exceed
/// its target fullness. `status_age` is the time since the status was read;
/// points are only assumed consumed while the DAC reports PLAYING.
fn send_capacity(status: &DacStatus, status_age: Duration, unacked: i64, rate: u32) -> i64 {
    let expected_used = if status.playback() == PlaybackState::Playing {
        (status_age.as_secs_f64() * rate as f64) as i64
    } else {
        0
    };
    let expected_fullness = status.buffer_fullness as i64 + unacked - expected_used;
    TARGET_FULLNESS as i64 - expected_fullness
}

/// How long to wait before re-checking capacity: the time the DAC needs to
/// consume down to a full maximum-size write.
fn pacing_wait(capacity: i64, rate: u32) -> Duration {
    let deficit = (MAX_POINTS_PER_SEND as i64 - capacity).max(0) as u64;
    Duration::from_nanos(deficit.saturating_mul(1_000_000_000) / rate.max(1) as u64)
}

// Mark the session dead and wake everyone waiting on it.
fn fail(shared: &SharedState, err: SessionError) {
    let mut state = shared.lock();
    if !state.dead {
        state.dead = true;
        state.fatal = Some(err);
    }
    drop(state);
    shared.notify_all();
}

// Reads 22-byte responses for the lifetime of the session.
fn run_reader(tcp: TcpStream, shared: Arc<SharedState>) {
    let mut bytes = [0u8; RESPONSE_BYTES];
    let mut filled = 0;
    loop {
        {
            let state = shared.lock();
            if state.shutting_down || state.dead {
                return;
            }
        }
        match (&tcp).read(&mut bytes[filled..]) {
            Ok(0) => {
                let err = io::Error::new(io::ErrorKind::UnexpectedEof, "DAC closed the connection");
                fail(&shared, SessionError::Io { err });
                return;
            }
            Ok(n) => {
                filled += n;
                if filled < RESPONSE_BYTES {
                    continue;
                }
                filled = 0;
                let response = DacResponse::read_from(&bytes);
                if !process_response(&shared, &response) {
                    return;
                }
            }
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                // An idle DAC has nothing to say; a silent one that still
                // owes us data is gone.
                let state = shared.lock();
                if state.shutting_down || state.dead {
                    return;
                }
                if state.frames.is_empty() {
                    continue;
                }
                drop(state);
                fail(&shared, SessionError::ResponseTimedOut);
                return;
            }
            Err(err) => {
                fail(&shared, SessionError::Io { err });
                return;
            }
        }
    }
}

// Apply one response to the shared state. Returns `false` if it was fatal.
fn process_response(shared: &SharedState, response: &DacResponse) -> bool {
    let mut state = shared.lock();
    state.status = response.status;
    state.status_received_at = Instant::now();
    if state.status.playback() == PlaybackState::Idle {
        state.begin_sent = false;
    }
    let fatal = if response.command == command::DATA {
        match state.unacked_blocks.pop_front() {
            Some(_) => None,
            None => Some(SessionError::UnmatchedResponse {
                command: response.command,
            }),
        }
    } else if state.pending_meta_acks > 0 {
        state.pending_meta_acks -= 1;
        None
    } else {
        Some(SessionError::UnmatchedResponse {
            command: response.command,
        })
    };
    let fatal = fatal.or(match response.response {
        response::ACK | response::NAK_INVALID => None,
        other => Some(SessionError::Rejected {
            response: other,
            command: response.command,
        }),
    });
    let ok = fatal.is_none();
    if let Some(err) = fatal {
        state.dead = true;
        state.fatal = Some(err);
    }
    drop(state);
    shared.notify_all();
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_retains_three_blocks_and_drops_the_rest() {
        let shared = SharedState::new();
        for _ in 0..4 {
            shared.add_frame(PointBlock::new(10, 30_000));
        }
        let state = shared.lock();
        assert_eq!(state.frames.len(), 3);
    }

    #[test]
    fn ready_with_at_most_one_block_queued() {
        let shared = SharedState::new();
        assert!(shared.is_ready());
        shared.add_frame(PointBlock::new(10, 30_000));
        assert!(shared.is_ready());
        shared.add_frame(PointBlock::new(10, 30_000));
        assert!(!shared.is_ready());
    }

    #[test]
    fn shutdown_releases_wait_for_ready() {
        let shared = Arc::new(SharedState::new());
        shared.add_frame(PointBlock::new(10, 30_000));
        shared.add_frame(PointBlock::new(10, 30_000));
        let shared2 = shared.clone();
        let waiter = std::thread::spawn(move || shared2.wait_for_ready());
        std::thread::sleep(Duration::from_millis(50));
        shared.request_shutdown();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn capacity_accounts_for_in_flight_and_elapsed_points() {
        let mut status = DacStatus::default();
        status.playback_state = 2;
        status.buffer_fullness = 3600;
        // After 75 ms at 48 kpps the whole target's worth has drained.
        let age = Duration::from_millis(75);
        assert_eq!(send_capacity(&status, age, 0, 48_000), 3600);
        // In-flight points count as buffered.
        assert_eq!(send_capacity(&status, age, 600, 48_000), 3000);

        // A DAC that is not playing consumes nothing.
        status.playback_state = 1;
        assert_eq!(send_capacity(&status, age, 0, 48_000), 0);
        assert_eq!(send_capacity(&status, Duration::ZERO, 100, 48_000), -100);
    }

    #[test]
    fn pacing_wait_scales_with_the_deficit() {
        assert_eq!(pacing_wait(40, 40_000), Duration::from_millis(1));
        assert_eq!(pacing_wait(0, 40_000), Duration::from_millis(2));
        assert_eq!(pacing_wait(-120, 40_000), Duration::from_millis(5));
    }

    #[test]
    fn data_ack_pops_one_unacked_block() {
        let shared = SharedState::new();
        {
            let mut state = shared.lock();
            state.unacked_blocks.push_back(80);
            state.unacked_blocks.push_back(40);
        }
        let mut status = DacStatus::default();
        status.playback_state = 2;
        status.buffer_fullness = 100;
        let response = DacResponse {
            response: response::ACK,
            command: command::DATA,
            status,
        };
        assert!(process_response(&shared, &response));
        let state = shared.lock();
        assert_eq!(state.unacked_blocks.len(), 1);
        assert_eq!(state.status.buffer_fullness, 100);
        assert!(!state.dead);
    }

    #[test]
    fn unmatched_data_ack_is_fatal() {
        let shared = SharedState::new();
        let response = DacResponse {
            response: response::ACK,
            command: command::DATA,
            status: DacStatus::default(),
        };
        assert!(!process_response(&shared, &response));
        let state = shared.lock();
        assert!(state.dead);
        assert!(matches!(
            state.fatal,
            Some(SessionError::UnmatchedResponse { command: b'd' })
        ));
    }

    #[test]
    fn unknown_response_code_is_fatal() {
        let shared = SharedState::new();
        shared.lock().pending_meta_acks = 1;
        let response = DacResponse {
            response: response::NAK_FULL,
            command: command::PREPARE,
            status: DacStatus::default(),
        };
        assert!(!process_response(&shared, &response));
        assert!(matches!(
            shared.lock().fatal,
            Some(SessionError::Rejected {
                response: b'F',
                command: b'p',
            })
        ));
    }

    #[test]
    fn nak_invalid_is_tolerated() {
        let shared = SharedState::new();
        shared.lock().pending_meta_acks = 1;
        let response = DacResponse {
            response: response::NAK_INVALID,
            command: command::POINT_RATE,
            status: DacStatus::default(),
        };
        assert!(process_response(&shared, &response));
        let state = shared.lock();
        assert_eq!(state.pending_meta_acks, 0);
        assert!(!state.dead);
    }

    #[test]
    fn idle_status_clears_begin_sent() {
        let shared = SharedState::new();
        {
            let mut state = shared.lock();
            state.begin_sent = true;
            state.pending_meta_acks = 1;
        }
        let response = DacResponse {
            response: response::ACK,
            command: command::PREPARE,
            status: DacStatus::default(),
        };
        assert!(process_response(&shared, &response));
        assert!(!shared.lock().begin_sent);
    }
}
