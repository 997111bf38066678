use anyhow::{bail, Context};
use screenrec::container::Mp4TrackReader;
use screenrec::merge_tracks;
use serde::Serialize;
use std::env;

#[derive(Debug, Serialize)]
struct TrackInfo {
    index: usize,
    format: String,
    samples: usize,
}

fn main() -> anyhow::Result<()> {
    screenrec::init_logging();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: screenrec-mux <merge|inspect> [args] [--json]");
        std::process::exit(1);
    }

    let json = args.iter().any(|a| a == "--json");
    let positional: Vec<&String> = args[2..].iter().filter(|a| !a.starts_with("--")).collect();

    match args[1].as_str() {
        "merge" => cmd_merge(&positional, json),
        "inspect" => cmd_inspect(&positional, json),
        other => {
            eprintln!("Unknown command: {}", other);
            std::process::exit(1);
        }
    }
}

fn cmd_merge(args: &[&String], json: bool) -> anyhow::Result<()> {
    let [audio, video, output] = args else {
        bail!("Usage: screenrec-mux merge <audio.mp4> <video.mp4> <output.mp4> [--json]");
    };
    let stats = merge_tracks(audio.as_str(), video.as_str(), output.as_str())
        .with_context(|| format!("merging {} + {} into {}", audio, video, output))?;
    if json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        println!(
            "{}: {} audio + {} video samples, {:.3}s, {} bytes",
            output,
            stats.audio_samples,
            stats.video_samples,
            stats.duration_us as f64 / 1_000_000.0,
            stats.bytes_written
        );
    }
    Ok(())
}

fn cmd_inspect(args: &[&String], json: bool) -> anyhow::Result<()> {
    let [file] = args else {
        bail!("Usage: screenrec-mux inspect <file.mp4> [--json]");
    };
    let reader = Mp4TrackReader::open(file.as_str()).with_context(|| format!("opening {}", file))?;
    let tracks = (0..reader.track_count())
        .map(|index| {
            Ok(TrackInfo {
                index,
                format: reader.track_format(index)?.to_string(),
                samples: reader.sample_count(index)?,
            })
        })
        .collect::<screenrec::Result<Vec<_>>>()?;

    if json {
        println!("{}", serde_json::to_string(&tracks)?);
    } else {
        for t in tracks {
            println!("#{} {} ({} samples)", t.index, t.format, t.samples);
        }
    }
    Ok(())
}
