use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use tracing::{error, info, warn};

use super::backend::AudioBackend;
use super::codec::resample;
use crate::error::AudioError;
use crate::kernel::segment::SegmentId;

const COMMAND_CAPACITY: usize = 256;

enum Command {
    Play { start_frame: u64, samples: Arc<[f32]> },
    Clear,
}

struct Voice {
    start_frame: u64,
    samples: Arc<[f32]>,
}

/// Default output device. The clock is the number of frames the device has
/// pulled, so it advances only while audio is actually being rendered.
///
/// `cpal::Stream` isn't `Send` on every platform, so the stream lives on its
/// own thread; this handle only talks to it through a lock-free queue and
/// two atomics.
pub struct CpalBackend {
    commands: HeapProd<Command>,
    frames: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    device_rate: u32,
    shutdown: Option<mpsc::Sender<()>>,
}

impl CpalBackend {
    /// Open the default output device, preferring `preferred_rate` (the
    /// synthesis rate) so segments don't need resampling.
    pub fn open(preferred_rate: u32) -> Result<Self, AudioError> {
        let rb = HeapRb::<Command>::new(COMMAND_CAPACITY);
        let (producer, consumer) = rb.split();
        let frames = Arc::new(AtomicU64::new(0));
        let paused = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32, AudioError>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread_frames = frames.clone();
        let thread_paused = paused.clone();
        std::thread::Builder::new()
            .name("narrator-audio".into())
            .spawn(move || {
                match build_stream(preferred_rate, consumer, thread_frames, thread_paused) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        // Park until the handle is dropped; the stream dies with this thread
                        let _ = shutdown_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        let device_rate = ready_rx
            .recv()
            .map_err(|_| AudioError::Device("audio thread exited during setup".into()))??;

        Ok(Self {
            commands: producer,
            frames,
            paused,
            device_rate,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    fn push(&mut self, command: Command) -> Result<(), AudioError> {
        self.commands
            .try_push(command)
            .map_err(|_| AudioError::Device("audio command queue full".into()))
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl AudioBackend for CpalBackend {
    fn now(&self) -> f64 {
        self.frames.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn play_at(&mut self, id: SegmentId, samples: Arc<[f32]>, sample_rate: u32, start_secs: f64) -> Result<(), AudioError> {
        let samples: Arc<[f32]> = if sample_rate == self.device_rate {
            samples
        } else {
            resample(&samples, sample_rate, self.device_rate)?.into()
        };
        let start_frame = (start_secs.max(0.0) * self.device_rate as f64).round() as u64;
        tracing::debug!("{} -> frame {}", id, start_frame);
        self.push(Command::Play { start_frame, samples })
    }

    fn suspend(&mut self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&mut self) {
        self.paused.store(false, Ordering::Release);
    }

    fn clear(&mut self) {
        if let Err(e) = self.push(Command::Clear) {
            warn!("Failed to clear output: {}", e);
        }
    }
}

fn build_stream(
    preferred_rate: u32,
    consumer: HeapCons<Command>,
    frames: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
) -> Result<(cpal::Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    info!("Audio Output Device: {}", device.name().unwrap_or_default());

    // Prefer a config that runs at the synthesis rate
    let mut selected = None;
    let ranges = device
        .supported_output_configs()
        .map_err(|e| AudioError::Device(e.to_string()))?;
    for range in ranges {
        let format_ok = matches!(range.sample_format(), cpal::SampleFormat::F32 | cpal::SampleFormat::I16);
        if format_ok && range.min_sample_rate().0 <= preferred_rate && range.max_sample_rate().0 >= preferred_rate {
            selected = Some(range.with_sample_rate(cpal::SampleRate(preferred_rate)));
            break;
        }
    }
    let config = match selected {
        Some(c) => c,
        None => device
            .default_output_config()
            .map_err(|e| AudioError::Device(e.to_string()))?,
    };
    let rate = config.sample_rate().0;
    info!("Audio Output Config: Rate={}Hz, Channels={}", rate, config.channels());

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build::<f32>(&device, &config.into(), consumer, frames, paused)?,
        cpal::SampleFormat::I16 => build::<i16>(&device, &config.into(), consumer, frames, paused)?,
        other => return Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
    };
    stream.play().map_err(|e| AudioError::Device(e.to_string()))?;

    Ok((stream, rate))
}

fn build<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: HeapCons<Command>,
    frames: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut voices: Vec<Voice> = Vec::with_capacity(64);
    let err_fn = |err| error!("an error occurred on output stream: {}", err);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                while let Some(command) = consumer.try_pop() {
                    match command {
                        Command::Play { start_frame, samples } => voices.push(Voice { start_frame, samples }),
                        Command::Clear => voices.clear(),
                    }
                }

                if paused.load(Ordering::Acquire) {
                    data.fill(T::EQUILIBRIUM);
                    return;
                }

                let base = frames.load(Ordering::Acquire);
                let frame_count = data.len() / channels;
                for (offset, frame) in data.chunks_mut(channels).enumerate() {
                    let t = base + offset as u64;
                    let mut mixed = 0.0f32;
                    for voice in &voices {
                        if t >= voice.start_frame {
                            if let Some(s) = voice.samples.get((t - voice.start_frame) as usize) {
                                mixed += *s;
                            }
                        }
                    }
                    let value = T::from_sample(mixed.clamp(-1.0, 1.0));
                    frame.fill(value);
                }

                let end = base + frame_count as u64;
                frames.store(end, Ordering::Release);
                voices.retain(|v| v.start_frame + v.samples.len() as u64 > end);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::Device(e.to_string()))
}
