//! Reading the 8-channel ILDA-WAV interleave.
//!
//! Channels 0..5 carry X, Y, R, G, B at the PCM sample rate, channel 5 is
//! unused, and channels 6 and 7 are a synchronized stereo audio pair. The
//! sample rate doubles as the DAC point rate.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// The channel count required of an ILDA-WAV file.
pub const ILDA_WAV_CHANNELS: u16 = 8;

/// Errors raised when opening or reading an ILDA-WAV file.
#[derive(Debug, Error)]
pub enum WavError {
    #[error("failed to decode WAV: {err}")]
    Decode {
        #[from]
        err: hound::Error,
    },
    #[error("failed to read WAV: {err}")]
    Io {
        #[from]
        err: std::io::Error,
    },
    #[error("expected an 8-channel ILDA-WAV file, found {found} channels")]
    ChannelCount { found: u16 },
    #[error("unsupported sample width: {bits}-bit (expected 16- or 24-bit)")]
    UnsupportedSampleWidth { bits: u16 },
    #[error("unsupported sample format: float (expected signed integer PCM)")]
    FloatSamples,
}

/// A validated reader over an ILDA-WAV file.
pub struct IldaWavReader {
    reader: hound::WavReader<BufReader<File>>,
    spec: hound::WavSpec,
}

impl IldaWavReader {
    /// Open a file and validate that it carries the ILDA-WAV interleave:
    /// exactly 8 channels of 16- or 24-bit signed little-endian PCM.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WavError> {
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        if spec.channels != ILDA_WAV_CHANNELS {
            return Err(WavError::ChannelCount {
                found: spec.channels,
            });
        }
        if spec.sample_format != hound::SampleFormat::Int {
            return Err(WavError::FloatSamples);
        }
        match spec.bits_per_sample {
            16 | 24 => (),
            bits => return Err(WavError::UnsupportedSampleWidth { bits }),
        }
        Ok(IldaWavReader { reader, spec })
    }

    pub fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.spec.bits_per_sample
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.spec.bits_per_sample / 8) as usize
    }

    /// The total number of inter-channel frames in the file.
    pub fn len_frames(&self) -> u32 {
        self.reader.duration()
    }

    pub fn duration(&self) -> Duration {
        let secs = self.len_frames() as f64 / self.sample_rate() as f64;
        Duration::from_secs_f64(secs)
    }

    /// Reposition the stream so the next read starts at `frame`.
    pub fn seek_to_frame(&mut self, frame: u32) -> Result<(), WavError> {
        self.reader.seek(frame)?;
        Ok(())
    }

    /// Read up to `max_frames` interleaved frames into `out`, which must hold
    /// at least `max_frames * 8` samples. 24-bit samples arrive sign-extended
    /// in the low 24 bits. Returns the number of whole frames read; a short
    /// count means the end of the stream, and any trailing partial frame is
    /// discarded.
    pub fn read_frames(&mut self, out: &mut [i32], max_frames: usize) -> Result<usize, WavError> {
        let channels = ILDA_WAV_CHANNELS as usize;
        let wanted = max_frames * channels;
        let mut n = 0;
        let mut samples = self.reader.samples::<i32>();
        while n < wanted {
            match samples.next() {
                Some(sample) => {
                    out[n] = sample?;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n / channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_wav_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("laser_wav-{}-{}.wav", name, std::process::id()));
        path
    }

    fn write_wav(path: &Path, channels: u16, bits: u16, frames: u32) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 48_000,
            bits_per_sample: bits,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for frame in 0..frames {
            for channel in 0..channels {
                // A value that identifies its frame and channel.
                let value = frame as i32 * 10 + channel as i32;
                match bits {
                    16 => writer.write_sample(value as i16).unwrap(),
                    _ => writer.write_sample(value).unwrap(),
                }
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn opens_and_reads_16_bit() {
        let path = temp_wav_path("read16");
        write_wav(&path, 8, 16, 100);
        let mut reader = IldaWavReader::open(&path).unwrap();
        assert_eq!(reader.sample_rate(), 48_000);
        assert_eq!(reader.bytes_per_sample(), 2);
        assert_eq!(reader.len_frames(), 100);

        let mut out = vec![0i32; 10 * 8];
        let frames = reader.read_frames(&mut out, 10).unwrap();
        assert_eq!(frames, 10);
        assert_eq!(out[0], 0);
        assert_eq!(out[7], 7);
        assert_eq!(out[8], 10);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn seek_repositions_the_stream() {
        let path = temp_wav_path("seek");
        write_wav(&path, 8, 16, 100);
        let mut reader = IldaWavReader::open(&path).unwrap();
        reader.seek_to_frame(42).unwrap();
        let mut out = vec![0i32; 8];
        assert_eq!(reader.read_frames(&mut out, 1).unwrap(), 1);
        assert_eq!(out[0], 420);

        // A short read at the end of the stream.
        reader.seek_to_frame(99).unwrap();
        let mut out = vec![0i32; 4 * 8];
        assert_eq!(reader.read_frames(&mut out, 4).unwrap(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn reads_24_bit_samples() {
        let path = temp_wav_path("read24");
        write_wav(&path, 8, 24, 4);
        let mut reader = IldaWavReader::open(&path).unwrap();
        assert_eq!(reader.bytes_per_sample(), 3);
        let mut out = vec![0i32; 4 * 8];
        assert_eq!(reader.read_frames(&mut out, 4).unwrap(), 4);
        assert_eq!(out[9], 11);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let path = temp_wav_path("stereo");
        write_wav(&path, 2, 16, 10);
        match IldaWavReader::open(&path) {
            Err(WavError::ChannelCount { found: 2 }) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_unsupported_sample_width() {
        let path = temp_wav_path("w8bit");
        let spec = hound::WavSpec {
            channels: 8,
            sample_rate: 48_000,
            bits_per_sample: 8,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..8 {
            writer.write_sample(0i8).unwrap();
        }
        writer.finalize().unwrap();
        match IldaWavReader::open(&path) {
            Err(WavError::UnsupportedSampleWidth { bits: 8 }) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        std::fs::remove_file(&path).ok();
    }
}
