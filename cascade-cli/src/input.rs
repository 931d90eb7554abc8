use std::time::Duration;

use cascade_engine::{SessionCommand, SessionHandle};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyModifiers},
    terminal,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Listens for key presses until `token` is cancelled.
///
/// `q` cancels playback, space toggles pause. Raw mode is enabled for the
/// duration of the loop, so this must run on a blocking thread.
pub fn input_handler(handle: SessionHandle, token: CancellationToken) {
    if terminal::enable_raw_mode().is_err() {
        info!("Failed to enable raw mode. Input handling will be disabled.");
        return;
    }

    let mut paused = false;
    while !token.is_cancelled() {
        let Ok(true) = event::poll(Duration::from_millis(100)) else {
            continue;
        };
        let Ok(Event::Key(KeyEvent {
            code, modifiers, ..
        })) = event::read()
        else {
            continue;
        };
        let command = match (code, modifiers) {
            // Raw mode swallows SIGINT, so Ctrl-C arrives as a key press.
            (KeyCode::Char('q'), KeyModifiers::NONE) | (KeyCode::Char('c'), KeyModifiers::CONTROL) => {
                println!("Cancellation requested. Shutting down gracefully...");
                token.cancel();
                break;
            }
            (KeyCode::Char(' '), _) => {
                paused = !paused;
                if paused {
                    SessionCommand::Pause
                } else {
                    SessionCommand::Resume
                }
            }
            _ => continue,
        };
        if let Err(e) = handle.send(command) {
            warn!(error = %e, "Session no longer accepts commands");
            break;
        }
    }

    if terminal::disable_raw_mode().is_err() {
        info!("Failed to disable raw mode.");
    }
}
