use crate::error::{ClawkerError, Result};
use std::io::IsTerminal;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Restores the terminal mode when dropped
pub struct RawModeGuard {
    restore: Option<Box<dyn FnOnce() + Send>>,
}

impl RawModeGuard {
    pub fn new(restore: impl FnOnce() + Send + 'static) -> Self {
        Self {
            restore: Some(Box::new(restore)),
        }
    }

    /// A guard with nothing to restore
    pub fn noop() -> Self {
        Self { restore: None }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            restore();
        }
    }
}

/// Host terminal controller: raw mode, size query and resize events
pub trait Terminal: Send + Sync {
    fn stdin_is_terminal(&self) -> bool;

    /// Current size as (rows, cols)
    fn size(&self) -> Result<(u16, u16)>;

    fn enable_raw_mode(&self) -> Result<RawModeGuard>;

    /// Stream of (rows, cols) after every host resize; ends when dropped
    fn resize_events(&self) -> Result<mpsc::Receiver<(u16, u16)>>;
}

pub struct CrosstermTerminal;

impl Terminal for CrosstermTerminal {
    fn stdin_is_terminal(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    fn size(&self) -> Result<(u16, u16)> {
        let (cols, rows) = crossterm::terminal::size()?;
        Ok((rows, cols))
    }

    fn enable_raw_mode(&self) -> Result<RawModeGuard> {
        crossterm::terminal::enable_raw_mode()?;
        debug!("Terminal switched to raw mode");
        Ok(RawModeGuard::new(|| {
            if let Err(e) = crossterm::terminal::disable_raw_mode() {
                warn!("Failed to restore terminal mode: {}", e);
            }
        }))
    }

    #[cfg(unix)]
    fn resize_events(&self) -> Result<mpsc::Receiver<(u16, u16)>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut winch = signal(SignalKind::window_change())?;
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while winch.recv().await.is_some() {
                let Ok((cols, rows)) = crossterm::terminal::size() else {
                    continue;
                };
                if tx.send((rows, cols)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    #[cfg(not(unix))]
    fn resize_events(&self) -> Result<mpsc::Receiver<(u16, u16)>> {
        Err(ClawkerError::Unavailable(
            "terminal resize events are not supported on this platform".to_string(),
        ))
    }
}

/// Fails with a clear message when stdin is not usable as a TTY
pub fn require_terminal(terminal: &dyn Terminal) -> Result<()> {
    if terminal.stdin_is_terminal() {
        Ok(())
    } else {
        Err(ClawkerError::Validation(
            "the input device is not a TTY; drop -t or run from a terminal".to_string(),
        ))
    }
}

#[cfg(test)]
pub use fake::FakeTerminal;
