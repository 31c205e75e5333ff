use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand, ValueEnum};
use tapscope_core::{
    AppConfig, PlaybackDelegate, PlaybackSession, PlaybackStatus, SampleFormat, SessionState,
    SpectrumFrame, SynthEngine, SynthSource, TapScopeError,
};
use tracing_subscriber::EnvFilter;

const LEVELS: &[u8] = b" .:-=+*#%@";

fn main() -> tapscope_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play(args) => run_play(args),
    }
}

fn run_play(args: PlayArgs) -> tapscope_core::Result<()> {
    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    tracing::info!(?config, "starting tone playback");

    let source = SynthSource {
        sample_rate: args.sample_rate,
        channels: args.channels,
        sample_format: args.format.into(),
        interleaved: !args.planar,
        frequencies: args.tone.clone(),
        duration_secs: Some(args.seconds),
        ..SynthSource::default()
    };

    let mut session = PlaybackSession::with_config(
        SynthEngine::realtime(),
        &config,
        ConsoleDelegate::new(args.json),
    );
    session.play(&source)?;

    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds);
    while Instant::now() < deadline {
        session.pump_timeout(Duration::from_millis(50));
        if session.state() == SessionState::Failed {
            break;
        }
        if let Some(err) = session.delegate_mut().take_error() {
            session.stop();
            return Err(err);
        }
    }

    let failed = session.state() == SessionState::Failed;
    session.stop();
    tracing::info!(
        frames = session.delegate().frames,
        stats = ?session.tap_stats(),
        "playback finished"
    );

    if failed {
        return Err(TapScopeError::msg("playback failed"));
    }
    Ok(())
}

/// Prints spectra either as JSON lines or as one bar row per channel.
struct ConsoleDelegate {
    json: bool,
    frames: u64,
    error: Option<TapScopeError>,
}

impl ConsoleDelegate {
    fn new(json: bool) -> Self {
        Self {
            json,
            frames: 0,
            error: None,
        }
    }

    fn take_error(&mut self) -> Option<TapScopeError> {
        self.error.take()
    }
}

impl PlaybackDelegate for ConsoleDelegate {
    fn on_spectrum_updated(&mut self, spectrum: &SpectrumFrame) {
        self.frames += 1;
        if self.json {
            match serde_json::to_string(spectrum) {
                Ok(line) => println!("{line}"),
                Err(err) => self.error = Some(err.into()),
            }
            return;
        }

        for (channel, bins) in spectrum.channels().iter().enumerate() {
            println!("ch{channel} |{}|", render_bars(bins));
        }
    }

    fn on_status_changed(&mut self, status: &PlaybackStatus) {
        tracing::info!(?status, "playback status changed");
    }

    fn on_tap_error(&mut self, error: &TapScopeError) {
        tracing::warn!(%error, "audio tap not installed yet");
    }
}

fn render_bars(bins: &[f32]) -> String {
    bins.iter()
        .map(|value| {
            let level = (value.clamp(0.0, 1.0) * (LEVELS.len() - 1) as f32).round() as usize;
            LEVELS[level] as char
        })
        .collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live spectrum of intercepted player audio", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play synthesized tones and print their live spectrum.
    Play(PlayArgs),
}

#[derive(clap::Args, Debug)]
struct PlayArgs {
    /// Tone frequencies in Hz, one per channel (reused when fewer).
    #[arg(long, value_delimiter = ',', default_value = "440,660")]
    tone: Vec<f32>,
    #[arg(long, default_value_t = 2)]
    channels: usize,
    #[arg(long, default_value_t = 48_000.0)]
    sample_rate: f64,
    /// Native sample representation the engine renders.
    #[arg(long, value_enum, default_value_t = SampleKind::F32)]
    format: SampleKind,
    /// Render one buffer per channel instead of interleaved samples.
    #[arg(long)]
    planar: bool,
    /// Playback length in seconds.
    #[arg(long, default_value_t = 3.0)]
    seconds: f64,
    /// Emit spectra as JSON lines.
    #[arg(long)]
    json: bool,
    /// Optional JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SampleKind {
    F32,
    I16,
    I32,
}

impl From<SampleKind> for SampleFormat {
    fn from(kind: SampleKind) -> Self {
        match kind {
            SampleKind::F32 => SampleFormat::F32,
            SampleKind::I16 => SampleFormat::I16,
            SampleKind::I32 => SampleFormat::I32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bars_scale_with_magnitude() {
        assert_eq!(render_bars(&[0.0, 1.0, 2.0, -1.0]), " @@ ");
    }

    #[test]
    fn parses_play_arguments() {
        let cli = Cli::parse_from([
            "tapscope", "play", "--tone", "100,200,300", "--format", "i16", "--planar", "--json",
        ]);
        let Commands::Play(args) = cli.command;

        assert_eq!(args.tone, vec![100.0, 200.0, 300.0]);
        assert!(matches!(args.format, SampleKind::I16));
        assert!(args.planar);
        assert!(args.json);
        assert_eq!(args.channels, 2);
    }
}
