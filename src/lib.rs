// Copyright 2025 Cornell University
// released under MIT License

pub mod bt;
pub mod channels;
pub mod clock;
pub mod compose;
pub mod config;
pub mod diagnostic;
pub mod errors;
pub mod eval;
pub mod explore;
pub mod flatten;
pub mod handlers;
pub mod input;
pub mod model;
pub mod network;
pub mod parser;
pub mod properties;
pub mod ros;
pub mod serialize;
pub mod translate;
pub mod types;
