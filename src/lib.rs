pub mod audio;
pub mod bluetooth;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod jukebox;
pub mod library;
pub mod model;
pub mod pipeline;
pub mod radio;
pub mod sequencer;
pub mod storage;

pub use error::{Error, Result};
