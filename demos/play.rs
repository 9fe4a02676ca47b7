//! Stream an ILDA-WAV file to an Ether Dream DAC found on the network while
//! playing its audio channels on the default output device.
//!
//! Usage: `play <file.wav> [dac-id]`
//!
//! Once playing, `p` toggles play/pause, `s <fraction>` seeks and `q` quits.

use laser_wav::{Api, CpalSink};
use std::io::BufRead;
use std::sync::mpsc;

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let path = match args.next() {
        Some(path) => path,
        None => {
            eprintln!("usage: play <file.wav> [dac-id]");
            std::process::exit(2);
        }
    };
    let wanted_id = args.next();

    let api = Api::new();

    // Wait for a matching DAC to broadcast.
    let (dac_tx, dac_rx) = mpsc::channel();
    let mut sent = false;
    api.subscribe_dacs(move |dacs| {
        if sent {
            return;
        }
        let found = match &wanted_id {
            Some(id) => dacs.get(id.as_str()).cloned(),
            None => dacs.values().next().cloned(),
        };
        if let Some(dac) = found {
            sent = dac_tx.send(dac).is_ok();
        }
    });
    println!("waiting for a DAC broadcast...");
    let dac = dac_rx.recv().expect("DAC discovery ended unexpectedly");
    println!(
        "using DAC {} at {} (hw rev {}, sw rev {}, buffer {})",
        dac.id, dac.ip_addr, dac.hw_revision, dac.sw_revision, dac.buffer_capacity
    );

    let builder = api.new_player(&path).unwrap_or_else(|err| {
        eprintln!("{}: {}", path, err);
        std::process::exit(1);
    });
    let sink = CpalSink::new(builder.sample_rate(), builder.bits_per_sample())
        .expect("failed to open the audio output");

    let stream = api.new_dac_stream(dac);
    let player = builder
        .points(move |block| {
            // The stream bounds its own queue and drops the excess, so
            // playback never blocks on the network.
            stream.add_frame(block).ok();
        })
        .build(Box::new(sink));

    println!(
        "playing {} ({} pps, {:.1} s); 'p' toggles, 's <fraction>' seeks, 'q' quits",
        path,
        player.sample_rate(),
        player.duration().as_secs_f64()
    );
    player.request_playback(true);

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let line = line.trim();
        if line == "q" {
            break;
        }
        if line == "p" {
            player.request_playback(!player.is_playback_requested());
            continue;
        }
        if let Some(rest) = line.strip_prefix("s ") {
            match rest.parse::<f32>() {
                Ok(fraction) => player.seek(fraction),
                Err(_) => eprintln!("seek wants a fraction in [0, 1]"),
            }
        }
    }

    // Joining the playback worker drops its point callback, which closes
    // the stream it owns.
    player.close();
}
