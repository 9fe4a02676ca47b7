//! The blocking PCM sink the playback engine writes decoded audio into.

use byteorder::{ByteOrder, LittleEndian};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::io;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A blocking, interleaved-PCM audio output.
///
/// `write` accepts little-endian signed PCM at the sink's configured sample
/// width and returns once the sink has drained enough to accept more. This
/// back-pressure is the pacing clock for playback.
pub trait AudioSink: Send {
    fn write(&mut self, pcm: &[u8]) -> io::Result<()>;
}

/// How long `write` may go without the device consuming anything before the
/// sink is considered broken.
const STALL_TIMEOUT: Duration = Duration::from_secs(1);
/// How long `write` sleeps between attempts while the ring is full.
const FULL_RING_POLL: Duration = Duration::from_millis(5);

/// Errors that may occur while opening the system audio output.
#[derive(Debug, Error)]
pub enum AudioSinkError {
    #[error("no audio output device available")]
    NoDevice,
    #[error("unsupported sample width: {bits}-bit")]
    UnsupportedSampleWidth { bits: u16 },
    #[error("failed to build the audio output stream: {err}")]
    BuildStream {
        #[from]
        err: cpal::BuildStreamError,
    },
    #[error("failed to start the audio output stream: {err}")]
    PlayStream {
        #[from]
        err: cpal::PlayStreamError,
    },
    #[error("the audio output thread exited before the stream started")]
    OutputThread,
}

/// A stereo `AudioSink` on the system's default output device.
///
/// Samples travel through a bounded ring buffer holding a quarter second of
/// audio; `write` backs off while the ring is full, which is what makes it
/// blocking. The `cpal` stream lives on a dedicated thread (it cannot move
/// between threads) and is dropped when the sink handle is.
pub struct CpalSink {
    producer: HeapProducer<f32>,
    bytes_per_sample: usize,
    _handle: StreamHandle,
}

// Dropping the guard sender tells the stream thread to drop the stream and
// exit.
struct StreamHandle {
    _guard: mpsc::SyncSender<()>,
}

impl CpalSink {
    /// Open the default output device at the given rate and sample width.
    pub fn new(sample_rate: u32, bits_per_sample: u16) -> Result<Self, AudioSinkError> {
        let bytes_per_sample = match bits_per_sample {
            16 => 2,
            24 => 3,
            bits => return Err(AudioSinkError::UnsupportedSampleWidth { bits }),
        };
        let ring = HeapRb::<f32>::new((sample_rate as usize / 4) * 2);
        let (producer, consumer) = ring.split();
        let handle = start_stream_thread(sample_rate, consumer)?;
        Ok(CpalSink {
            producer,
            bytes_per_sample,
            _handle: handle,
        })
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, pcm: &[u8]) -> io::Result<()> {
        let bytes_per_sample = self.bytes_per_sample;
        let samples: Vec<f32> = pcm
            .chunks_exact(bytes_per_sample)
            .map(|sample| match bytes_per_sample {
                2 => LittleEndian::read_i16(sample) as f32 / 32_768.0,
                _ => LittleEndian::read_i24(sample) as f32 / 8_388_608.0,
            })
            .collect();

        let mut written = 0;
        let mut last_progress = Instant::now();
        while written < samples.len() {
            let pushed = self.producer.push_slice(&samples[written..]);
            written += pushed;
            if pushed > 0 {
                last_progress = Instant::now();
            } else {
                if last_progress.elapsed() >= STALL_TIMEOUT {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "audio output stalled",
                    ));
                }
                std::thread::sleep(FULL_RING_POLL);
            }
        }
        Ok(())
    }
}

// `cpal::Stream` is not `Send` on every platform, so it is built, held and
// dropped on one thread. The guard channel keeps it alive for exactly as
// long as the sink handle exists.
fn start_stream_thread(
    sample_rate: u32,
    consumer: HeapConsumer<f32>,
) -> Result<StreamHandle, AudioSinkError> {
    let (result_tx, result_rx) = mpsc::sync_channel(0);
    let (guard_tx, guard_rx) = mpsc::sync_channel::<()>(0);
    std::thread::Builder::new()
        .name("laser_wav-audio-output".to_string())
        .spawn(move || match start_stream(sample_rate, consumer) {
            Err(err) => {
                let _ = result_tx.send(Err(err));
            }
            Ok(stream) => {
                let _ = result_tx.send(Ok(()));
                let _ = guard_rx.recv();
                drop(stream);
            }
        })
        .expect("failed to spawn audio output thread");
    match result_rx.recv() {
        Ok(Ok(())) => Ok(StreamHandle { _guard: guard_tx }),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(AudioSinkError::OutputThread),
    }
}

fn start_stream(
    sample_rate: u32,
    mut consumer: HeapConsumer<f32>,
) -> Result<cpal::Stream, AudioSinkError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioSinkError::NoDevice)?;
    let config = cpal::StreamConfig {
        channels: 2,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let n = consumer.pop_slice(data);
            // Underruns play silence.
            data[n..].fill(0.0);
        },
        |err| log::error!("audio output stream error: {}", err),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}
