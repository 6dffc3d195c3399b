use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use super::level::{LevelMeter, rms};
use super::{InputDevice, InputFormat, LevelSource, LiveInput};
use crate::config::AudioConfig;
use crate::error::{Result, VoxError};

/// Microphone backed by cpal. The stream lives on its own thread because cpal
/// streams cannot move between threads.
pub struct CpalInputDevice {
    device_name: Option<String>,
}

impl CpalInputDevice {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.device.clone(),
        }
    }
}

impl InputDevice for CpalInputDevice {
    fn open(&self) -> Result<Box<dyn LiveInput>> {
        let (ready_tx, ready_rx) = bounded::<Result<InputFormat>>(1);
        let (control_tx, control_rx) = unbounded::<Control>();
        let (frame_tx, frame_rx) = unbounded::<Vec<f32>>();
        let meter = Arc::new(LevelMeter::default());

        let name = self.device_name.clone();
        let thread_meter = Arc::clone(&meter);
        let thread = std::thread::Builder::new()
            .name("voxloop-mic".to_string())
            .spawn(move || run_input_thread(name, &ready_tx, &control_rx, frame_tx, thread_meter))?;

        let format = ready_rx
            .recv()
            .map_err(|_| VoxError::DeviceUnavailable("microphone thread exited".to_string()))??;

        tracing::info!(
            "microphone open: {} Hz, {} channel(s)",
            format.sample_rate,
            format.channels
        );

        Ok(Box::new(CpalInput {
            control: Some(control_tx),
            frames: frame_rx,
            meter,
            format,
            thread: Some(thread),
        }))
    }
}

enum Control {
    Resume(Sender<Result<()>>),
    Pause(Sender<Result<()>>),
}

struct CpalInput {
    control: Option<Sender<Control>>,
    frames: Receiver<Vec<f32>>,
    meter: Arc<LevelMeter>,
    format: InputFormat,
    thread: Option<JoinHandle<()>>,
}

impl CpalInput {
    fn send(&self, make: fn(Sender<Result<()>>) -> Control) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| VoxError::Audio("microphone already released".to_string()))?;
        let (reply_tx, reply_rx) = bounded(1);
        control
            .send(make(reply_tx))
            .map_err(|_| VoxError::Audio("microphone thread is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| VoxError::Audio("microphone thread did not answer".to_string()))?
    }
}

impl LiveInput for CpalInput {
    fn format(&self) -> InputFormat {
        self.format
    }

    fn level(&self) -> Arc<dyn LevelSource> {
        Arc::clone(&self.meter) as Arc<dyn LevelSource>
    }

    fn resume(&mut self) -> Result<()> {
        self.send(Control::Resume)
    }

    fn pause(&mut self) -> Result<()> {
        let result = self.send(Control::Pause);
        self.meter.reset();
        result
    }

    fn drain(&mut self) -> Vec<Vec<f32>> {
        self.frames.try_iter().collect()
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        // Closing the control channel ends the thread, which drops the stream.
        self.control.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("microphone thread panicked");
        }
        tracing::info!("microphone released");
    }
}

fn run_input_thread(
    device_name: Option<String>,
    ready_tx: &Sender<Result<InputFormat>>,
    control_rx: &Receiver<Control>,
    frame_tx: Sender<Vec<f32>>,
    meter: Arc<LevelMeter>,
) {
    let (stream, format) = match build_stream(device_name.as_deref(), frame_tx, meter) {
        Ok(built) => built,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Some hosts start streams on build; stay quiet until asked to record.
    if let Err(e) = stream.pause() {
        tracing::debug!("initial pause not supported: {e}");
    }

    if ready_tx.send(Ok(format)).is_err() {
        return;
    }

    while let Ok(control) = control_rx.recv() {
        match control {
            Control::Resume(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| classify_open_error(&format!("failed to start microphone: {e}")));
                let _ = reply.send(result);
            }
            Control::Pause(reply) => {
                let result = stream
                    .pause()
                    .map_err(|e| VoxError::Audio(format!("failed to pause microphone: {e}")));
                let _ = reply.send(result);
            }
        }
    }

    tracing::debug!("microphone thread exiting");
}

fn find_device(device_name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(name) = device_name {
        return host
            .input_devices()
            .map_err(|e| classify_open_error(&format!("failed to enumerate input devices: {e}")))?
            .find(|d| device_label(d).as_deref() == Some(name))
            .ok_or_else(|| VoxError::DeviceUnavailable(format!("input device not found: {name}")));
    }

    host.default_input_device()
        .ok_or_else(|| VoxError::DeviceUnavailable("no default input device".to_string()))
}

fn build_stream(
    device_name: Option<&str>,
    frame_tx: Sender<Vec<f32>>,
    meter: Arc<LevelMeter>,
) -> Result<(Stream, InputFormat)> {
    let device = find_device(device_name)?;

    let supported = device
        .default_input_config()
        .map_err(|e| classify_open_error(&format!("failed to get default input config: {e}")))?;

    let format = InputFormat {
        sample_rate: supported.sample_rate(),
        channels: supported.channels(),
    };

    let stream_config = StreamConfig {
        channels: format.channels,
        sample_rate: format.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = |err: cpal::StreamError| {
        tracing::error!("microphone stream error: {err}");
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                deliver(data, &meter, &frame_tx);
            },
            err_fn,
            None,
        )
        .map_err(|e| classify_open_error(&format!("failed to build input stream: {e}")))?;

    Ok((stream, format))
}

/// Audio callback body. The frame queue is unbounded: frames only flow between
/// `resume` and `pause`, so one listening window bounds it whatever the host's
/// callback size.
fn deliver(data: &[f32], meter: &LevelMeter, frame_tx: &Sender<Vec<f32>>) {
    meter.store(rms(data));
    if frame_tx.send(data.to_vec()).is_err() {
        tracing::trace!("microphone frame dropped: recorder is gone");
    }
}

/// Hosts report a declined permission prompt as a backend-specific error; pick
/// it out by message so the user gets actionable text.
fn classify_open_error(message: &str) -> VoxError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        VoxError::PermissionDenied(message.to_string())
    } else {
        VoxError::DeviceUnavailable(message.to_string())
    }
}

fn device_label(device: &Device) -> Option<String> {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
}

/// Names of every input device the host can see.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| VoxError::Audio(format!("failed to enumerate input devices: {e}")))?;
    Ok(devices.filter_map(|d| device_label(&d)).collect())
}

#[must_use]
pub fn default_input_device_name() -> Option<String> {
    cpal::default_host()
        .default_input_device()
        .and_then(|d| device_label(&d))
}
