use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use narrator::audio::{AudioBackend, CpalBackend, VirtualBackend};
use narrator::kernel::event::{CooldownReason, PipelineEvent, RetryCause};
use narrator::services::synth::http::HttpSynthesizer;
use narrator::{Coordinator, NarratorConfig, SessionControl, SessionStatus, VoiceParams};

/// Read long text aloud through a rate-limited speech endpoint.
#[derive(Parser, Debug)]
#[command(name = "narrator", version)]
struct Args {
    /// Text file to read. Reads stdin when omitted or "-".
    input: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "Kore")]
    voice: String,

    /// Delivery instruction, e.g. "calm, unhurried narration"
    #[arg(long)]
    style: Option<String>,

    /// Language directive, e.g. "en-US"
    #[arg(long)]
    language: Option<String>,

    /// Override segmenter.max_length
    #[arg(long)]
    max_length: Option<usize>,

    /// Override pipeline.look_ahead
    #[arg(long)]
    look_ahead: Option<usize>,

    /// Don't open an audio device; run on a virtual clock
    #[arg(long)]
    no_playback: bool,

    /// Write everything that was generated to a WAV file at the end
    #[arg(long, value_name = "FILE")]
    export: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("narrator=info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = NarratorConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(max_length) = args.max_length {
        config.segmenter.max_length = max_length;
    }
    if let Some(look_ahead) = args.look_ahead {
        config.pipeline.look_ahead = look_ahead;
    }
    if args.export.is_some() {
        config.pipeline.retain_audio = true;
    }
    config.validate().context("invalid configuration")?;
    if config.endpoint.api_keys.is_empty() {
        bail!("no API keys configured (set NARRATOR_API_KEYS or endpoint.api_keys)");
    }

    let (text, interactive) = read_input(args.input.as_ref())?;
    if text.trim().is_empty() {
        bail!("input is empty");
    }

    let backend: Box<dyn AudioBackend> = if args.no_playback {
        Box::new(VirtualBackend::new())
    } else {
        let output = CpalBackend::open(config.playback.sample_rate).context("opening audio output")?;
        if output.device_rate() != config.playback.sample_rate {
            tracing::info!(
                "Device runs at {}Hz, resampling from {}Hz",
                output.device_rate(),
                config.playback.sample_rate
            );
        }
        Box::new(output)
    };

    let voice = VoiceParams {
        voice: args.voice,
        style: args.style,
        language: args.language,
    };
    let sample_rate = config.playback.sample_rate;
    let synthesizer = Arc::new(HttpSynthesizer::new(&config.endpoint));
    let coordinator = Coordinator::new(config, synthesizer);
    tracing::info!("Narrator starting with {} credential(s)", coordinator.pool().len());

    let mut session = coordinator.start(text, voice, backend);

    let control = session.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted");
            control.stop();
        }
    });

    if interactive {
        println!("Commands: p = pause, r = resume, s = stop, k = skip credential");
        tokio::spawn(read_commands(session.control()));
    }

    while let Some(event) = session.next_event().await {
        if let PipelineEvent::Status(update) = &event {
            if update.status == SessionStatus::Error && !interactive {
                // Nobody can resume a non-interactive run
                session.stop();
            }
        }
        render(&event);
    }

    let report = session.join().await.context("session task failed")?;

    if let Some(path) = args.export {
        let written = report
            .export_wav(&path, sample_rate)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote {} segment(s) to {}", written, path.display());
    }

    match report.status {
        SessionStatus::Completed => Ok(()),
        SessionStatus::Idle => {
            println!("Stopped.");
            Ok(())
        }
        other => bail!("session ended in {:?}", other),
    }
}

/// Text plus whether stdin is free for commands.
fn read_input(path: Option<&PathBuf>) -> Result<(String, bool)> {
    match path {
        Some(p) if p.as_os_str() != "-" => {
            let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            Ok((text, true))
        }
        _ => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text).context("reading stdin")?;
            Ok((text, false))
        }
    }
}

async fn read_commands(control: SessionControl) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "p" => control.pause(),
            "r" => control.resume(),
            "s" => {
                control.stop();
                break;
            }
            "k" => control.skip_credential(),
            "" => {}
            other => println!("Unknown command '{}'", other),
        }
    }
}

fn render(event: &PipelineEvent) {
    match event {
        PipelineEvent::Status(update) => {
            println!("[{:>3}%] {:?}: {}", update.progress, update.status, update.message);
        }
        PipelineEvent::Cooldown {
            segment,
            reason,
            remaining,
            ..
        } => {
            let why = match reason {
                CooldownReason::PoolSaturated => "all keys at their limit",
                CooldownReason::RateLimited => "rate limited",
            };
            println!("  {} waiting {}s ({})", segment, remaining.as_secs().max(1), why);
        }
        PipelineEvent::Retrying {
            segment,
            attempt,
            delay,
            cause,
            ..
        } => {
            let why = match cause {
                RetryCause::RateLimited => "rate limit",
                RetryCause::Transient => "transient error",
            };
            println!("  {} attempt {} hit a {}, retrying in {:.1}s", segment, attempt, why, delay.as_secs_f64());
        }
        PipelineEvent::SegmentFailed { segment, error } => {
            println!("  {} failed: {}", segment, error);
        }
        PipelineEvent::CredentialSkipped { credential } => {
            println!("  skipped {}", credential);
        }
        PipelineEvent::Summary(summary) => {
            println!(
                "Done: {} request(s), {} rate limit hit(s), {:.1}s of audio",
                summary.requests.sent,
                summary.requests.rate_limited,
                summary.playback.audio_ms as f64 / 1000.0
            );
        }
        PipelineEvent::RequestSent { .. }
        | PipelineEvent::SegmentReady { .. }
        | PipelineEvent::SegmentStarted { .. }
        | PipelineEvent::SegmentEnded { .. } => {}
    }
}
