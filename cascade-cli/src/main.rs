mod args;
mod error;
mod input;
mod output;

use std::io::IsTerminal;
use std::process;

use cascade_engine::{CascadeError, MemorySink, PlayerEvent, Session, StreamType};
use clap::Parser;
use mimalloc::MiMalloc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::args::Args;
use crate::error::CliError;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _guard = match init_logging(&args) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(e.exit_code());
        }
    };

    if let Err(e) = run(args).await {
        error!(error = %e, "Playback failed");
        eprintln!("Error: {e}");
        process::exit(e.exit_code());
    }
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>, CliError> {
    let filter = EnvFilter::try_new(&args.log_level)
        .map_err(|e| CliError::Logging(format!("invalid filter {:?}: {e}", args.log_level)))?;

    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "cascade.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let (json_layer, text_layer) = if args.json_logs {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (
            None,
            Some(fmt::layer().with_target(false).with_writer(std::io::stderr)),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| CliError::Logging(e.to_string()))?;
    Ok(guard)
}

async fn run(args: Args) -> Result<(), CliError> {
    let config = args.session_config()?;
    let token = CancellationToken::new();

    let mut sink = MemorySink::new(args.quota_mb.saturating_mul(1 << 20))
        .with_realtime_playback(!args.no_realtime);
    let writer = match args.output.clone() {
        Some(dir) => {
            let (tap_tx, tap_rx) = mpsc::unbounded_channel();
            sink = sink.with_tap(tap_tx);
            Some(tokio::spawn(output::write_streams(dir, tap_rx)))
        }
        None => None,
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = Session::builder(config, sink)
        .events(events_tx)
        .cancellation_token(token.clone())
        .build()?;

    let input = std::io::stdin().is_terminal().then(|| {
        let handle = session.handle();
        let token = token.clone();
        tokio::task::spawn_blocking(move || input::input_handler(handle, token))
    });
    let ctrl_c = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted. Shutting down gracefully...");
                token.cancel();
            }
        })
    };
    let events = tokio::spawn(log_events(events_rx));

    info!(url = %args.url, "Starting playback");
    let result = session.run(&args.url).await;

    token.cancel();
    ctrl_c.abort();
    if let Some(input) = input
        && let Err(e) = input.await
    {
        warn!(error = %e, "Input handler failed");
    }
    if let Err(e) = events.await {
        warn!(error = %e, "Event logger failed");
    }

    let outcome = match result {
        Ok(sink) => {
            summarize(&sink);
            Ok(())
        }
        Err(CascadeError::Cancelled) => {
            info!("Playback cancelled");
            Ok(())
        }
        Err(e) => Err(CliError::from(e)),
    };

    // The tap sender lives in the sink, which is gone by now.
    if let Some(writer) = writer {
        match writer.await {
            Ok(Ok(bytes)) => info!(bytes, "Output written"),
            Ok(Err(e)) => return Err(e),
            Err(e) => warn!(error = %e, "Output writer failed"),
        }
    }
    outcome
}

fn summarize(sink: &MemorySink) {
    for stream in [StreamType::Audio, StreamType::Video, StreamType::AudioVideo] {
        let bytes = sink.buffered_bytes(stream);
        if bytes > 0 {
            info!(%stream, bytes, mime = sink.mime(stream).unwrap_or(""), "Buffered");
        }
    }
    info!(ended = sink.is_ended(), buffered = ?sink.media_buffered(), "Playback finished");
}

async fn log_events(mut events: mpsc::UnboundedReceiver<PlayerEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            PlayerEvent::ManifestLoaded {
                tracks,
                audio_tracks,
            } => info!(tracks, audio_tracks, "Manifest loaded"),
            PlayerEvent::TrackLoaded {
                kind,
                level,
                live,
                fragments,
                ..
            } => info!(%kind, level, live, fragments, "Playlist loaded"),
            PlayerEvent::TrackSwitched { kind, level } => info!(%kind, level, "Track switched"),
            PlayerEvent::FragBuffered { frag } => {
                debug!(frag = %frag.label(), start = frag.start, duration = frag.duration, "Fragment buffered")
            }
            PlayerEvent::Ended => info!("End of stream"),
            PlayerEvent::Error(err) if err.fatal => error!(%err, "Fatal error"),
            PlayerEvent::Error(err) => warn!(%err, "Recoverable error"),
            other => debug!(event = other.name(), "Player event"),
        }
    }
}
