//! Engine client errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Session bus unreachable or the engine service is not running.
    #[error("engine bus error: {0}")]
    Bus(#[from] zbus::Error),

    #[error("failed to encode reply body: {0}")]
    Encode(#[from] serde_json::Error),
}
