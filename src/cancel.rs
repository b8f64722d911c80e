//! Per-stream cancellation signals.
//!
//! A signal is single-use: once triggered it stays triggered. The controller
//! hands out a fresh signal for every stream, so a cancel aimed at one reply
//! can never leak into the next.

use tokio_util::sync::CancellationToken;

/// Handle observed by the streaming loop between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Owns the signal for the connection's current (or next) stream.
#[derive(Debug, Default)]
pub struct CancellationController {
    current: CancelSignal,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The signal the next stream should observe.
    pub fn signal(&self) -> CancelSignal {
        self.current.clone()
    }

    pub fn cancel(&self) {
        self.current.set();
    }

    /// Retire the current signal and issue an unset one. Called after every
    /// stream, however it ended.
    pub fn reset(&mut self) -> CancelSignal {
        self.current = CancelSignal::new();
        self.current.clone()
    }
}
