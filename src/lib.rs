//! Rate-distortion analysis of video encodes.
//!
//! `engine` holds the ffmpeg-facing pipeline (inspection, normalization,
//! metric passes, bitrate profiling, encode matrices, BD-Rate) and the job
//! state machine; `config` holds user configuration.

pub mod config;
pub mod engine;
