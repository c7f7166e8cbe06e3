//! Paired-comparison ("A vs B") listening experiment runner.
//!
//! One source recording is turned into a fixed set of filtered,
//! loudness-matched stimulus variants; a randomized, repetition-free
//! schedule of ordered pairs is drawn once per session and persisted; a
//! trial controller presents each pair with fixed silence gaps and records
//! a 5-point preference judgment per trial. Both the schedule and the
//! results live on disk, so a killed session resumes where it left off.

#[cfg(not(target_arch = "wasm32"))]
pub mod audio_io;
pub mod config;
pub mod dsp;
pub mod error;
pub mod pairing;
pub mod session;
pub mod stimulus;
pub mod trial;

pub use config::ExperimentConfig;
pub use error::{Error, Result};
pub use pairing::PairingSequence;
pub use session::{SessionState, SessionStore, TrialRecord};
pub use stimulus::{StimulusBank, StimulusSet};
pub use trial::{AudioSink, Judgment, TrialController, TrialPhase};
