//! Detach sequence detection on raw keyboard input.

use crate::signal::{DisconnectReason, DisconnectSignal};

const CTRL_A: u8 = 0x01;

/// The two-key detach sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachKeys {
    /// First key, normally a control byte.
    pub prefix: u8,
    /// Second key, compared case-insensitively.
    pub key: u8,
}

impl Default for DetachKeys {
    fn default() -> Self {
        Self {
            prefix: CTRL_A,
            key: b'q',
        }
    }
}

impl TryFrom<&hatch_config::KeybindConfig> for DetachKeys {
    type Error = eyre::Report;

    fn try_from(config: &hatch_config::KeybindConfig) -> eyre::Result<Self> {
        let (prefix, key) = config.detach_bytes()?;
        Ok(Self { prefix, key })
    }
}

/// What happened to one input byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keystroke {
    /// Pass this byte through to the remote console.
    Forward(u8),
    /// Byte consumed by the detector.
    Suppressed,
    /// Detach sequence completed.
    Detach,
}

/// Streaming filter watching for the detach sequence.
///
/// Holds a single pending bit. A prefix seen while already pending keeps the
/// detector pending and is swallowed; any other byte clears it and is
/// forwarded without replaying the swallowed prefix.
pub struct EscapeDetector {
    keys: DetachKeys,
    signal: DisconnectSignal,
    pending: bool,
}

impl EscapeDetector {
    #[must_use]
    pub fn new(keys: DetachKeys, signal: DisconnectSignal) -> Self {
        Self {
            keys,
            signal,
            pending: false,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Classify a single byte.
    pub fn feed(&mut self, byte: u8) -> Keystroke {
        if byte == self.keys.prefix {
            self.pending = true;
            return Keystroke::Suppressed;
        }

        if self.pending {
            self.pending = false;
            if byte.eq_ignore_ascii_case(&self.keys.key) {
                self.signal.close(DisconnectReason::Detached);
                return Keystroke::Detach;
            }
        }

        Keystroke::Forward(byte)
    }

    /// Filter a chunk read from the terminal, returning the bytes to forward.
    ///
    /// Everything after a completed detach sequence is dropped.
    pub fn filter(&mut self, input: &[u8]) -> Vec<u8> {
        let mut forward = Vec::with_capacity(input.len());
        for &byte in input {
            match self.feed(byte) {
                Keystroke::Forward(b) => forward.push(b),
                Keystroke::Suppressed => {}
                Keystroke::Detach => {
                    tracing::debug!("detach sequence received");
                    break;
                }
            }
        }
        forward
    }
}
