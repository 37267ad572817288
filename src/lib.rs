#![forbid(unsafe_code)]

pub mod app;
pub mod cli;
pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod generator;
pub mod logging;
pub mod manuscript;
pub mod model;
pub mod openai;
pub mod orchestrator;
pub mod quality;
pub mod recovery;
pub mod text;
