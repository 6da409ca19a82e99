//! Tripwire: BLAKE3 fingerprints, run journal, drift detection.

pub mod drift;
pub mod eventlog;
pub mod hasher;
