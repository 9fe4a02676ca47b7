//! The WAV playback engine.
//!
//! A worker thread decodes the 8-channel interleave one block at a time,
//! splitting it three ways: laser points for the DAC, stereo PCM for the
//! audio sink, and a preview frame for the display callback. The blocking
//! audio write is the pacing clock while playback is requested.

use crate::audio::AudioSink;
use crate::point::PointBlock;
use crate::wav::{IldaWavReader, ILDA_WAV_CHANNELS};
use byteorder::{ByteOrder, LittleEndian};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// The number of inter-channel frames decoded per block.
pub const FRAME_SAMPLES: usize = 1600;
/// Channels of the outgoing audio PCM.
pub const STEREO: usize = 2;
/// The zero-indexed channel where the stereo audio pair begins.
pub const ILDA_WAV_AUDIO_CHANNEL: usize = 6;

/// One preview point decoded from the laser channels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisplayPoint {
    pub x: i32,
    pub y: i32,
    pub color: [u8; 3],
}

/// A block of preview points, always `FRAME_SAMPLES` entries.
///
/// The engine reuses one frame across blocks and hands each subscriber a
/// clone, so entries past the decoded count of a short block hold whatever
/// the previous block left there.
#[derive(Clone, Debug)]
pub struct DisplayFrame {
    points: Vec<DisplayPoint>,
}

impl DisplayFrame {
    fn new() -> Self {
        DisplayFrame {
            points: vec![DisplayPoint::default(); FRAME_SAMPLES],
        }
    }
}

impl Deref for DisplayFrame {
    type Target = [DisplayPoint];
    fn deref(&self) -> &Self::Target {
        &self.points
    }
}

/// The function called with each decoded preview frame: the playback position
/// in `[0, 1]`, the frame, and whether the block came from a seek.
pub trait DisplayCallback: FnMut(f32, DisplayFrame, bool) + Send {}
impl<F> DisplayCallback for F where F: FnMut(f32, DisplayFrame, bool) + Send {}

/// The function receiving decoded point blocks while playback is running.
pub trait PointCallback: FnMut(PointBlock) + Send {}
impl<F> PointCallback for F where F: FnMut(PointBlock) + Send {}

/// A type allowing to configure a `Player` before starting its worker thread.
pub struct Builder {
    pub(crate) reader: IldaWavReader,
    pub(crate) display: Option<Box<dyn DisplayCallback>>,
    pub(crate) points: Option<Box<dyn PointCallback>>,
}

impl Builder {
    pub fn sample_rate(&self) -> u32 {
        self.reader.sample_rate()
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.reader.bits_per_sample()
    }

    /// The function called with each decoded preview frame.
    pub fn display<F>(mut self, callback: F) -> Self
    where
        F: 'static + DisplayCallback,
    {
        self.display = Some(Box::new(callback));
        self
    }

    /// The function receiving decoded point blocks while playing.
    pub fn points<F>(mut self, callback: F) -> Self
    where
        F: 'static + PointCallback,
    {
        self.points = Some(Box::new(callback));
        self
    }

    /// Start the worker thread. The player begins paused; audio written to
    /// `audio_sink` paces the decode loop whenever playback is requested.
    pub fn build(self, audio_sink: Box<dyn AudioSink>) -> Player {
        let Builder {
            reader,
            display,
            points,
        } = self;
        Player::new(reader, audio_sink, display, points)
    }
}

// Requests shared between the handle and the worker.
struct Requests {
    seek: Option<f32>,
    play: bool,
    shutdown: bool,
}

struct PlayerShared {
    state: Mutex<Requests>,
    cond: Condvar,
    // Relaxed mirror of `play` for lock-free polling; the locked field stays
    // authoritative.
    play_requested: AtomicBool,
}

impl PlayerShared {
    fn lock(&self) -> MutexGuard<'_, Requests> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// A handle to the playback engine for one open file.
///
/// Dropping the handle shuts the worker down and joins it.
pub struct Player {
    shared: Arc<PlayerShared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    sample_rate: u32,
    len_frames: u32,
}

impl Player {
    fn new(
        reader: IldaWavReader,
        audio_sink: Box<dyn AudioSink>,
        display: Option<Box<dyn DisplayCallback>>,
        points: Option<Box<dyn PointCallback>>,
    ) -> Player {
        let sample_rate = reader.sample_rate();
        let len_frames = reader.len_frames();
        let shared = Arc::new(PlayerShared {
            state: Mutex::new(Requests {
                seek: None,
                play: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
            play_requested: AtomicBool::new(false),
        });
        let shared2 = shared.clone();
        let thread = std::thread::Builder::new()
            .name("laser_wav-playback".to_string())
            .spawn(move || run_player(reader, audio_sink, display, points, shared2))
            .expect("failed to spawn playback thread");
        Player {
            shared,
            thread: Mutex::new(Some(thread)),
            sample_rate,
            len_frames,
        }
    }

    /// Reposition playback to the given fraction of the stream, applied on
    /// the worker's next iteration. Values outside `[0, 1]` are clamped.
    pub fn seek(&self, position: f32) {
        let mut requests = self.shared.lock();
        requests.seek = Some(position.clamp(0.0, 1.0));
        drop(requests);
        self.shared.cond.notify_all();
    }

    /// Request playback or pause.
    pub fn request_playback(&self, play: bool) {
        let mut requests = self.shared.lock();
        requests.play = play;
        self.shared.play_requested.store(play, Ordering::Relaxed);
        drop(requests);
        self.shared.cond.notify_all();
    }

    /// The most recent playback request, readable without taking the lock.
    pub fn is_playback_requested(&self) -> bool {
        self.shared.play_requested.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len_frames(&self) -> u32 {
        self.len_frames
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.len_frames as f64 / self.sample_rate as f64)
    }

    /// Stop the worker and wait for it to join.
    pub fn close(self) {
        self.close_inner()
    }

    // Shared between the `close` and `Drop` implementations.
    fn close_inner(&self) {
        {
            let mut requests = self.shared.lock();
            requests.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(thread) = guard.take() {
                thread.join().ok();
            }
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close_inner();
    }
}

fn run_player(
    mut reader: IldaWavReader,
    mut audio_sink: Box<dyn AudioSink>,
    mut display: Option<Box<dyn DisplayCallback>>,
    mut points: Option<Box<dyn PointCallback>>,
    shared: Arc<PlayerShared>,
) {
    let sample_rate = reader.sample_rate();
    let bytes_per_sample = reader.bytes_per_sample();
    let len_frames = reader.len_frames();
    let channels = ILDA_WAV_CHANNELS as usize;
    // 24-bit samples contribute their top two bytes.
    let shift = if bytes_per_sample == 3 { 8 } else { 0 };

    let mut samples = vec![0i32; FRAME_SAMPLES * channels];
    let mut pcm = vec![0u8; FRAME_SAMPLES * STEREO * bytes_per_sample];
    let mut display_frame = DisplayFrame::new();
    let mut position_samples: u64 = 0;

    loop {
        // Wait for a reason to run an iteration.
        let seek = {
            let mut requests = shared.lock();
            loop {
                if requests.shutdown {
                    return;
                }
                if requests.play || requests.seek.is_some() {
                    break;
                }
                requests = shared
                    .cond
                    .wait(requests)
                    .unwrap_or_else(|err| err.into_inner());
            }
            requests.seek.take()
        };

        if let Some(fraction) = seek {
            let target = ((len_frames as f64 * fraction as f64).round() as u32).min(len_frames);
            if let Err(err) = reader.seek_to_frame(target) {
                log::error!("seek failed: {}", err);
                return;
            }
            position_samples = target as u64;
        }

        let frames_read = match reader.read_frames(&mut samples, FRAME_SAMPLES) {
            Ok(n) => n,
            Err(err) => {
                log::error!("WAV decode failed: {}", err);
                return;
            }
        };

        let mut block = PointBlock::new(frames_read, sample_rate);
        for i in 0..frames_read {
            let frame = &samples[i * channels..(i + 1) * channels];
            // The ILDA signed convention maps onto the wire with inverted
            // sign, and colors doubled onto the full u16 range; the point
            // layer clamps.
            let x = -(frame[0] >> shift);
            let y = -(frame[1] >> shift);
            let r = -(frame[2] >> shift) * 2;
            let g = -(frame[3] >> shift) * 2;
            let b = -(frame[4] >> shift) * 2;
            block.set_point(i, x, y, r, g, b);
            display_frame.points[i] = DisplayPoint {
                x,
                y,
                color: [
                    (r >> 8).clamp(0, 255) as u8,
                    (g >> 8).clamp(0, 255) as u8,
                    (b >> 8).clamp(0, 255) as u8,
                ],
            };

            // The audio pair passes through at its source width.
            for channel in 0..STEREO {
                let value = frame[ILDA_WAV_AUDIO_CHANNEL + channel];
                let o = (i * STEREO + channel) * bytes_per_sample;
                match bytes_per_sample {
                    2 => LittleEndian::write_i16(&mut pcm[o..o + 2], value as i16),
                    _ => LittleEndian::write_i24(&mut pcm[o..o + 3], value),
                }
            }
        }

        let is_seek = seek.is_some();
        let position = match seek {
            Some(fraction) => fraction,
            None if len_frames > 0 => position_samples as f32 / len_frames as f32,
            None => 0.0,
        };
        if let Some(ref mut callback) = display {
            callback(position, display_frame.clone(), is_seek);
        }

        let play = shared.lock().play;
        if play && frames_read > 0 {
            let n_bytes = frames_read * STEREO * bytes_per_sample;
            if let Err(err) = audio_sink.write(&pcm[..n_bytes]) {
                log::error!("audio output failed: {}", err);
                return;
            }
            if let Some(ref mut callback) = points {
                callback(block);
            }
        }
        position_samples += frames_read as u64;

        if frames_read == 0 {
            // End of the stream; pause rather than spin.
            let mut requests = shared.lock();
            if requests.play {
                log::info!("end of stream");
                requests.play = false;
                shared.play_requested.store(false, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wav::IldaWavReader;
    use std::io;
    use std::path::PathBuf;
    use std::sync::mpsc;

    // Records every write it receives.
    struct RecordingSink {
        tx: mpsc::Sender<Vec<u8>>,
    }

    impl AudioSink for RecordingSink {
        fn write(&mut self, pcm: &[u8]) -> io::Result<()> {
            self.tx.send(pcm.to_vec()).ok();
            Ok(())
        }
    }

    fn temp_wav_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("laser_wav-play-{}-{}.wav", name, std::process::id()));
        path
    }

    // 16-bit, 8 channels; every sample identifies its frame and channel as
    // `frame * 8 + channel`, wrapped into i16 range.
    fn write_fixture(path: &std::path::Path, frames: u32) {
        let spec = hound::WavSpec {
            channels: 8,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for frame in 0..frames {
            for channel in 0..8u32 {
                writer
                    .write_sample((frame * 8 + channel) as i16)
                    .unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    fn open_player(
        path: &std::path::Path,
    ) -> (
        Player,
        mpsc::Receiver<(f32, DisplayFrame, bool)>,
        mpsc::Receiver<PointBlock>,
        mpsc::Receiver<Vec<u8>>,
    ) {
        let reader = IldaWavReader::open(path).unwrap();
        let (display_tx, display_rx) = mpsc::channel();
        let (points_tx, points_rx) = mpsc::channel();
        let (audio_tx, audio_rx) = mpsc::channel();
        let builder = Builder {
            reader,
            display: None,
            points: None,
        };
        let player = builder
            .display(move |position, frame, is_seek| {
                display_tx.send((position, frame, is_seek)).ok();
            })
            .points(move |block| {
                points_tx.send(block).ok();
            })
            .build(Box::new(RecordingSink { tx: audio_tx }));
        (player, display_rx, points_rx, audio_rx)
    }

    #[test]
    fn paused_seek_emits_one_display_frame_and_nothing_else() {
        let path = temp_wav_path("pausedseek");
        write_fixture(&path, 4000);
        let (player, display_rx, points_rx, audio_rx) = open_player(&path);

        player.seek(0.5);
        let (position, frame, is_seek) = display_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("no display frame after seek");
        assert_eq!(position, 0.5);
        assert!(is_seek);
        assert_eq!(frame.len(), FRAME_SAMPLES);

        // The block decoded by the seek starts at frame 2000: channel 0
        // carries 2000 * 8 = 16000, negated on the way through.
        assert_eq!(frame[0].x, -16_000);
        assert_eq!(frame[0].y, -16_001);

        // Still paused: no audio, no DAC block, no further display frames.
        assert!(display_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(points_rx.try_recv().is_err());
        assert!(audio_rx.try_recv().is_err());

        player.close();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn playing_writes_audio_before_forwarding_points() {
        let path = temp_wav_path("playing");
        write_fixture(&path, 3200);
        let (player, display_rx, points_rx, audio_rx) = open_player(&path);

        player.request_playback(true);
        assert!(player.is_playback_requested());

        let pcm = audio_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("no audio was written");
        // 1600 frames of 2 channels at 2 bytes.
        assert_eq!(pcm.len(), FRAME_SAMPLES * STEREO * 2);
        // Frame 0 audio: channels 6 and 7 carry 6 and 7.
        assert_eq!(&pcm[0..4], &[6, 0, 7, 0]);

        let block = points_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("no point block was forwarded");
        assert_eq!(block.len(), FRAME_SAMPLES);
        assert_eq!(block.rate(), 48_000);
        let point = block.point(0);
        assert_eq!(point.x, 0);
        assert_eq!(point.y, -1);
        // Color channels double onto the u16 range; negative results clamp.
        assert_eq!(point.r, 0);

        // Position advances block by block.
        let (p0, _, is_seek) = display_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!is_seek);
        assert_eq!(p0, 0.0);
        let (p1, _, _) = display_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(p1, 0.5);

        player.close();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn pauses_at_the_end_of_the_stream() {
        let path = temp_wav_path("eof");
        write_fixture(&path, 1600);
        let (player, display_rx, _points_rx, audio_rx) = open_player(&path);

        player.request_playback(true);
        // One full block, then the end of the stream clears the request.
        assert!(audio_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while player.is_playback_requested() {
            assert!(std::time::Instant::now() < deadline, "player kept playing");
            std::thread::sleep(Duration::from_millis(10));
        }
        // Paused at the end: the display stream goes quiet.
        while display_rx.recv_timeout(Duration::from_millis(200)).is_ok() {}
        assert!(audio_rx.try_recv().is_err());

        player.close();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn point_and_color_mapping_clamps_and_scales() {
        let path = temp_wav_path("mapping");
        let spec = hound::WavSpec {
            channels: 8,
            sample_rate: 30_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        // One frame: x = -32768 (negation clamps), colors at full negative
        // scale so they double onto u16 max.
        let frame: [i16; 8] = [-32768, 100, -32768, 16384, 0, 0, -123, 456];
        for value in frame.iter() {
            writer.write_sample(*value).unwrap();
        }
        writer.finalize().unwrap();

        let (player, display_rx, points_rx, _audio_rx) = open_player(&path);
        player.request_playback(true);
        let block = points_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(block.rate(), 30_000);
        let point = block.point(0);
        // -(-32768) saturates the i16 coordinate range.
        assert_eq!(point.x, 32_767);
        assert_eq!(point.y, -100);
        // -(-32768) * 2 clamps to 65535; -(16384) * 2 clamps to 0.
        assert_eq!(point.r, 65_535);
        assert_eq!(point.g, 0);
        assert_eq!(point.b, 0);

        let (_, frame, _) = display_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame[0].x, 32_768);
        assert_eq!(frame[0].color, [255, 0, 0]);

        player.close();
        std::fs::remove_file(&path).ok();
    }
}
