use thiserror::Error;

/// Error type for the experiment runner.
#[derive(Error, Debug)]
pub enum Error {
    /// A stimulus variant came out silent; RMS matching would divide by zero.
    #[error("degenerate stimulus: variant {variant} has zero RMS")]
    DegenerateSignal { variant: usize },

    /// `run` was invoked without a prior `init`.
    #[error("no active session (run `init` first)")]
    NoActiveSession,

    /// Every trial in the pairing sequence has been presented. Terminal
    /// signal, not a fault.
    #[error("session complete: all {total} trials presented")]
    SessionComplete { total: usize },

    /// Session or results file could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Audio output device failure.
    #[error("playback error: {0}")]
    Playback(String),

    /// Source recording could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Configuration file errors.
    #[error("config error: {0}")]
    Config(String),

    /// Judgment outside the 5-point scale.
    #[error("invalid judgment {0}: expected a value in -2..=2")]
    InvalidJudgment(i64),

    /// Controller event received in a state that does not accept it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
