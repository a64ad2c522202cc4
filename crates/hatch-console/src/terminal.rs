//! Local terminal access and scoped raw mode.

use crate::error::Result;

/// Geometry used when the local terminal cannot report its size.
pub const DEFAULT_SIZE: (u16, u16) = (80, 24);

/// The local terminal a text console session runs on.
///
/// Raw mode is process-wide state. Implementations must refuse a second
/// [`Terminal::enable_raw_mode`] until [`Terminal::restore`] has run, which is
/// what keeps a process to one active session.
pub trait Terminal: Send + Sync {
    type Input: tokio::io::AsyncRead + Send + Unpin + 'static;
    type Output: tokio::io::AsyncWrite + Send + Unpin + 'static;

    fn enable_raw_mode(&self) -> Result<()>;

    fn restore(&self) -> std::io::Result<()>;

    /// Current `(width, height)` in cells, if known.
    fn size(&self) -> Option<(u16, u16)>;

    fn input(&self) -> Self::Input;

    fn output(&self) -> Self::Output;
}

/// Raw mode held for the lifetime of the guard.
pub struct RawModeGuard<'a, T: Terminal> {
    terminal: &'a T,
}

impl<'a, T: Terminal> RawModeGuard<'a, T> {
    pub fn acquire(terminal: &'a T) -> Result<Self> {
        terminal.enable_raw_mode()?;
        tracing::debug!("terminal in raw mode");
        Ok(Self { terminal })
    }
}

impl<T: Terminal> Drop for RawModeGuard<'_, T> {
    fn drop(&mut self) {
        match self.terminal.restore() {
            Ok(()) => tracing::debug!("terminal restored"),
            Err(e) => tracing::warn!("failed to restore terminal: {e}"),
        }
    }
}

/// The process's own stdin/stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostTerminal;

impl Terminal for HostTerminal {
    type Input = tokio::io::Stdin;
    type Output = tokio::io::Stdout;

    fn enable_raw_mode(&self) -> Result<()> {
        host::enable_raw_mode()
    }

    fn restore(&self) -> std::io::Result<()> {
        host::restore()
    }

    fn size(&self) -> Option<(u16, u16)> {
        match crossterm::terminal::size() {
            Ok((width, height)) if width > 0 && height > 0 => Some((width, height)),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("failed to read terminal size: {e}");
                None
            }
        }
    }

    fn input(&self) -> Self::Input {
        tokio::io::stdin()
    }

    fn output(&self) -> Self::Output {
        tokio::io::stdout()
    }
}

#[cfg(unix)]
mod host {
    use nix::sys::termios;

    use crate::error::{Error, Result};

    /// Attributes to put back, present while raw mode is active.
    static SAVED_TERMIOS: parking_lot::Mutex<Option<termios::Termios>> =
        parking_lot::Mutex::new(None);
    static PANIC_HOOK_INSTALLED: std::sync::Once = std::sync::Once::new();

    pub(super) fn enable_raw_mode() -> Result<()> {
        let mut saved = SAVED_TERMIOS.lock();
        if saved.is_some() {
            return Err(Error::SessionActive);
        }

        let stdin = std::io::stdin();
        let orig = termios::tcgetattr(&stdin).map_err(|e| Error::RawMode(e.into()))?;
        let mut raw = orig.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin, termios::SetArg::TCSANOW, &raw)
            .map_err(|e| Error::RawMode(e.into()))?;
        *saved = Some(orig);
        drop(saved);

        install_panic_hook();
        Ok(())
    }

    pub(super) fn restore() -> std::io::Result<()> {
        let Some(orig) = SAVED_TERMIOS.lock().take() else {
            return Ok(());
        };
        termios::tcsetattr(std::io::stdin(), termios::SetArg::TCSANOW, &orig)?;
        Ok(())
    }

    /// Restore the terminal before the panic message is printed.
    fn install_panic_hook() {
        PANIC_HOOK_INSTALLED.call_once(|| {
            let prev_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                if let Some(mut saved) = SAVED_TERMIOS.try_lock()
                    && let Some(orig) = saved.take()
                {
                    let _ = termios::tcsetattr(std::io::stdin(), termios::SetArg::TCSANOW, &orig);
                }
                prev_hook(info);
            }));
        });
    }
}

#[cfg(not(unix))]
mod host {
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::error::{Error, Result};

    static RAW_ACTIVE: AtomicBool = AtomicBool::new(false);

    pub(super) fn enable_raw_mode() -> Result<()> {
        if RAW_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::SessionActive);
        }
        if let Err(e) = crossterm::terminal::enable_raw_mode() {
            RAW_ACTIVE.store(false, Ordering::Release);
            return Err(Error::RawMode(e));
        }
        Ok(())
    }

    pub(super) fn restore() -> std::io::Result<()> {
        if RAW_ACTIVE.swap(false, Ordering::AcqRel) {
            crossterm::terminal::disable_raw_mode()?;
        }
        Ok(())
    }
}

/// Terminal size or [`DEFAULT_SIZE`].
pub fn size_or_default<T: Terminal>(terminal: &T) -> (u16, u16) {
    terminal.size().unwrap_or_else(|| {
        tracing::debug!("terminal size unavailable, using {DEFAULT_SIZE:?}");
        DEFAULT_SIZE
    })
}
