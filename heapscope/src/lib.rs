// Expose modules for testing
pub mod analysis;
pub mod cli;
pub mod domain;
pub mod export;
pub mod fragments;
pub mod frames;
pub mod input;
pub mod metadata;
pub mod pipeline;
pub mod replay;
pub mod trace_data;
