use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use crossbeam::channel::bounded;
use parking_lot::Mutex;
use tracing::error;

use crate::error::{Error, Result};
use crate::trial::AudioSink;

struct PlayCursor {
    samples: Vec<f32>,
    pos: usize,
    done_tx: Option<crossbeam::channel::Sender<()>>,
}

/// Blocking one-shot playback on the default output device. Each `play`
/// builds a stream at the stimulus rate, feeds the mono buffer to every
/// output channel, and returns once the buffer has drained.
pub struct CpalSink {
    device: cpal::Device,
    channels: u16,
}

impl CpalSink {
    pub fn open_default() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Playback("no output device available".into()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| Error::Playback(format!("no default output config: {e}")))?;
        if supported.sample_format() != SampleFormat::F32 {
            return Err(Error::Playback(format!(
                "unsupported sample format {:?}",
                supported.sample_format()
            )));
        }
        let channels = supported.channels();
        Ok(Self { device, channels })
    }
}

impl AudioSink for CpalSink {
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        let config = StreamConfig {
            channels: self.channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let duration = Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64);

        let (done_tx, done_rx) = bounded(1);
        let cursor = Arc::new(Mutex::new(PlayCursor {
            samples: samples.to_vec(),
            pos: 0,
            done_tx: Some(done_tx),
        }));
        let channels = self.channels as usize;
        let cb_cursor = cursor.clone();
        let audio_callback = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut cursor = cb_cursor.lock();
            for frame in data.chunks_mut(channels) {
                let s = cursor.samples.get(cursor.pos).copied().unwrap_or(0.0);
                cursor.pos += 1;
                for out in frame.iter_mut() {
                    *out = s;
                }
            }
            if cursor.pos >= cursor.samples.len() {
                if let Some(tx) = cursor.done_tx.take() {
                    let _ = tx.send(());
                }
            }
        };
        let err_fn = |err| error!(%err, "output stream error");

        let stream = self
            .device
            .build_output_stream(&config, audio_callback, err_fn, None)
            .map_err(|e| Error::Playback(format!("cannot open stream: {e}")))?;
        stream
            .play()
            .map_err(|e| Error::Playback(format!("cannot start stream: {e}")))?;

        // The callback signals when the last sample has been handed to the
        // device; the timeout guards against a stalled stream.
        done_rx
            .recv_timeout(duration + Duration::from_secs(2))
            .map_err(|_| Error::Playback("stream stalled before finishing".into()))?;
        drop(stream);
        Ok(())
    }
}
