use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use crossbeam::channel;
use log::info;

use synth_transport::backend::{NullAudioBackend, RealtimeConfig};
use synth_transport::engine::MockSynthEngine;
use synth_transport::transport::Transport;

/// Exercises the transport end to end against a mock synthesis engine:
/// either a realtime performance for a fixed duration, or an offline render
/// captured to a WAV file.
#[derive(Parser, Debug)]
#[command(name = "synth-transport-demo", version, about)]
struct Args {
    /// Sample rate, in Hz.
    #[arg(long, default_value_t = 48_000)]
    sample_rate: i32,

    /// Hardware ring size, in frames per channel.
    #[arg(long, default_value_t = 512)]
    hw_buffer_frames: i32,

    /// Software (engine) block size, in frames per channel.
    #[arg(long, default_value_t = 128)]
    sw_buffer_frames: i32,

    /// Output channel count.
    #[arg(long, default_value_t = 2)]
    nchnls: i32,

    /// How long to let the realtime performance run before stopping it.
    /// Ignored when `--render-wav` is given.
    #[arg(long, default_value_t = 2)]
    run_seconds: u64,

    /// Instead of a realtime performance, run an offline render of this many
    /// blocks and write the captured output to the given WAV path.
    #[arg(long)]
    render_wav: Option<PathBuf>,

    /// Block count for `--render-wav`.
    #[arg(long, default_value_t = 100)]
    render_blocks: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match &args.render_wav {
        Some(path) => run_render_demo(&args, path),
        None => run_realtime_demo(&args),
    }
}

fn build_transport(args: &Args, end_after_blocks: Option<u64>) -> Result<Transport> {
    let mut engine = MockSynthEngine::new(args.sample_rate, args.sw_buffer_frames, args.nchnls, args.nchnls);
    if let Some(n) = end_after_blocks {
        engine = engine.ending_after(n);
    }
    let backend = Box::new(NullAudioBackend::default());
    let mut transport = Transport::new(Box::new(engine), backend);
    transport.initialize(args.hw_buffer_frames, args.sw_buffer_frames)?;
    transport.add_message_callback(|line| info!("engine log: {line}"));
    transport.add_play_state_callback(|state| info!("play state -> {state:?}"));
    Ok(transport)
}

fn run_realtime_demo(args: &Args) -> Result<()> {
    let transport = build_transport(args, None)?;

    let config = RealtimeConfig {
        nchnls_out: args.nchnls,
        nchnls_in: 0,
        sample_rate: args.sample_rate,
        hw_buffer_frames: args.hw_buffer_frames,
        sw_buffer_frames: args.sw_buffer_frames,
        wants_midi: false,
    };

    info!("starting realtime performance for {}s", args.run_seconds);
    if transport.start(config)? != 0 {
        anyhow::bail!("transport refused to start from a non-stopped state");
    }

    std::thread::sleep(Duration::from_secs(args.run_seconds));

    if transport.stop()? != 0 {
        anyhow::bail!("transport refused to stop from a non-stopable state");
    }

    info!("performance stopped");
    Ok(())
}

fn run_render_demo(args: &Args, path: &PathBuf) -> Result<()> {
    let transport = build_transport(args, Some(args.render_blocks))?;

    let (sink, blocks) = channel::unbounded();
    info!("starting offline render of {} blocks to {path:?}", args.render_blocks);
    if transport.start_render(Some(sink))? != 0 {
        anyhow::bail!("transport refused to start a render from a non-stopped state");
    }

    let spec = hound::WavSpec {
        channels: args.nchnls as u16,
        sample_rate: args.sample_rate as u32,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for block in blocks {
        for sample in block {
            writer.write_sample(sample as f32)?;
        }
    }
    writer.finalize()?;

    info!("render complete");
    Ok(())
}
