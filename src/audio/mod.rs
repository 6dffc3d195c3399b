pub mod buffer;
pub mod capture;
pub mod level;
pub mod session;
pub mod silence;

use std::sync::Arc;

use crate::error::Result;

/// Native layout of the frames an input delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Anything that can report the loudness of the live input right now.
pub trait LevelSource: Send + Sync {
    /// RMS of the most recent audio, normalized to `0.0..=1.0`.
    fn current_rms(&self) -> f32;
}

/// A microphone that can be acquired.
pub trait InputDevice: Send {
    /// Acquire the device. Fails with `PermissionDenied` or `DeviceUnavailable`.
    fn open(&self) -> Result<Box<dyn LiveInput>>;
}

/// An acquired microphone. Dropping it releases the device.
pub trait LiveInput: Send {
    fn format(&self) -> InputFormat;

    /// Shared by the recorder and the energy sampler.
    fn level(&self) -> Arc<dyn LevelSource>;

    /// Begin delivering frames.
    fn resume(&mut self) -> Result<()>;

    /// Stop delivering frames; the device stays acquired.
    fn pause(&mut self) -> Result<()>;

    /// Every interleaved frame delivered since the previous call.
    fn drain(&mut self) -> Vec<Vec<f32>>;
}
