//! Cancellation plumbing for interrupting a trial run.

use crate::errors::RigError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag that flips once an interrupt has been requested.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Installs a Ctrl-C handler that cancels the returned token.
///
/// Only one handler may be installed per process.
pub fn install_ctrl_c_handler() -> Result<CancelToken, RigError> {
    let token = CancelToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .map_err(|e| RigError::Io(format!("failed to install interrupt handler: {e}")))?;
    Ok(token)
}
