//! Batch submission of document images to handwritten-text-recognition
//! backends, with constraint-aware normalization, concurrent dispatch and
//! ground-truth scoring.

pub mod annotate;
pub mod compare;
pub mod config;
pub mod credentials;
pub mod error;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod runner;
pub mod services;
