pub mod audio;
pub mod config;
pub mod conversation;
pub mod error;
pub mod gate;
pub mod history;
pub mod orchestrator;
pub mod panel;
pub mod playback;
pub mod round_trip;

#[cfg(test)]
mod testing;
