//! An Ether Dream laser DAC discovery and ILDA-WAV playback streaming API.
//!
//! ILDA-WAV is an 8-channel WAV convention: channels 0..5 encode X, Y, R, G
//! and B point data at the PCM sample rate, and channels 6 and 7 carry a
//! synchronized stereo audio pair. The playback engine demultiplexes the
//! interleave into audio for a blocking sink and point blocks for a DAC
//! stream, while DACs on the LAN are discovered from their UDP broadcasts.
//!
//! Everything runs on plain blocking worker threads: a broadcast listener, a
//! playback worker, and per-stream supervisor and reader threads.

pub mod audio;
pub mod dac;
pub mod playback;
pub mod point;
pub mod protocol;
pub mod stream;
pub mod wav;

pub use audio::{AudioSink, AudioSinkError, CpalSink};
pub use dac::{DacDirectoryCallback, DacSnapshot, DetectedDac};
pub use playback::{
    DisplayCallback, DisplayFrame, DisplayPoint, Player, PointCallback, FRAME_SAMPLES,
};
pub use point::PointBlock;
pub use stream::{Stream, StreamClosed};
pub use wav::{IldaWavReader, WavError, ILDA_WAV_CHANNELS};

use std::path::Path;
use std::sync::Arc;

/// A general API that allows for discovering DACs on the network and wiring
/// ILDA-WAV playback up to them.
pub struct Api {
    inner: Arc<Inner>,
}

// The inner state of the `Api`, shared between handles in an `Arc`.
pub(crate) struct Inner {
    discovery: dac::Discovery,
}

impl Api {
    /// Instantiate the API.
    pub fn new() -> Self {
        Api {
            inner: Arc::new(Inner {
                discovery: dac::Discovery::new(),
            }),
        }
    }

    /// Register a callback invoked with a snapshot of the DAC directory
    /// whenever it changes: a DAC appears, or one has not broadcast for a
    /// few seconds and is dropped.
    ///
    /// The first subscription starts the broadcast listener, which then runs
    /// for the lifetime of the process.
    pub fn subscribe_dacs<F>(&self, callback: F)
    where
        F: 'static + DacDirectoryCallback,
    {
        self.inner.discovery.subscribe(Box::new(callback));
    }

    /// Establish a point stream to the given DAC.
    ///
    /// The stream's supervisor thread connects and, whenever the session
    /// becomes unusable, replaces it, retrying for as long as the stream is
    /// open.
    pub fn new_dac_stream(&self, dac: DetectedDac) -> Stream {
        Stream::new(dac)
    }

    /// Open an ILDA-WAV file and begin building a player for it.
    ///
    /// Fails immediately if the file is not an 8-channel, 16- or 24-bit
    /// signed PCM WAV.
    pub fn new_player<P: AsRef<Path>>(&self, path: P) -> Result<playback::Builder, WavError> {
        let reader = IldaWavReader::open(path)?;
        Ok(playback::Builder {
            reader,
            display: None,
            points: None,
        })
    }
}
