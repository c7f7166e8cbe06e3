use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};
use tracing::info;

use crate::dsp::{self, FilterSpec};
use crate::error::{Error, Result};

/// Mono source recording at its native sample rate.
#[derive(Debug)]
pub struct SourceSignal {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// The fixed set of stimulus variants for one session. All buffers share the
/// source's length and sample rate, and every variant's RMS matches
/// variant 0's.
#[derive(Debug)]
pub struct StimulusSet {
    variants: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl StimulusSet {
    /// Assemble a set from prebuilt variant buffers. All buffers must share
    /// one length.
    pub fn from_variants(variants: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        debug_assert!(variants.windows(2).all(|w| w[0].len() == w[1].len()));
        Self {
            variants,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn variant(&self, index: usize) -> Option<&[f32]> {
        self.variants.get(index).map(Vec::as_slice)
    }

    /// Stimulus duration in seconds (all variants are equal length).
    pub fn duration_secs(&self) -> f64 {
        match self.variants.first() {
            Some(v) => v.len() as f64 / self.sample_rate as f64,
            None => 0.0,
        }
    }
}

/// Decode a source recording and keep channel 0.
pub fn load_source(path: &Path) -> Result<SourceSignal> {
    let file = File::open(path)
        .map_err(|e| Error::Decode(format!("{}: {e}", path.display())))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::Decode(e.to_string()))?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| Error::Decode("no default track".into()))?;
    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| Error::Decode(e.to_string()))?;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| Error::Decode("unknown sample rate".into()))?;
    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| Error::Decode("unknown channel count".into()))?
        .count();

    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(_)) => break,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(Error::Decode(e.to_string())),
        };
        let decoded = decoder
            .decode(&packet)
            .map_err(|e| Error::Decode(e.to_string()))?;
        if sample_buf.is_none() {
            sample_buf = Some(SampleBuffer::<f32>::new(
                decoded.capacity() as u64,
                *decoded.spec(),
            ));
        }
        let sbuf = sample_buf.as_mut().expect("sample buffer just initialized");
        sbuf.copy_interleaved_ref(decoded);
        for frame in sbuf.samples().chunks(channels) {
            samples.push(frame[0]);
        }
    }
    if samples.is_empty() {
        return Err(Error::Decode(format!(
            "{}: decoded no samples",
            path.display()
        )));
    }
    info!(
        path = %path.display(),
        samples = samples.len(),
        sample_rate,
        "loaded source recording"
    );
    Ok(SourceSignal {
        samples,
        sample_rate,
    })
}

pub struct StimulusBank;

impl StimulusBank {
    /// Build the stimulus set: variant 0 is the source peak-normalized to
    /// `target_peak`; every other variant filters the raw (pre-normalization)
    /// source per its spec and is then rescaled so its RMS equals variant 0's.
    /// Filtering is causal, so lengths never change; any variant that still
    /// differs is truncated or zero-padded to the source length.
    pub fn build(
        source: &SourceSignal,
        specs: &[FilterSpec],
        target_peak: f32,
        taper_ms: u32,
    ) -> Result<StimulusSet> {
        let src_len = source.samples.len();
        let ramp_len = (source.sample_rate as u64 * taper_ms as u64 / 1000) as usize;

        // Taper before RMS matching so the loudness match is exact on the
        // signals actually presented.
        let mut reference = source.samples.clone();
        dsp::peak_normalize(&mut reference, target_peak);
        dsp::taper(&mut reference, ramp_len);
        let rms_ref = dsp::rms(&reference);
        if rms_ref == 0.0 {
            return Err(Error::DegenerateSignal { variant: 0 });
        }

        let mut variants = Vec::with_capacity(specs.len());
        for (i, &spec) in specs.iter().enumerate() {
            let v = if i == 0 {
                reference.clone()
            } else {
                let mut filtered = dsp::apply_spec(spec, &source.samples, source.sample_rate)?;
                filtered.resize(src_len, 0.0);
                dsp::taper(&mut filtered, ramp_len);
                let rms_v = dsp::rms(&filtered);
                if rms_v == 0.0 {
                    return Err(Error::DegenerateSignal { variant: i });
                }
                let gain = (rms_ref / rms_v) as f32;
                for s in &mut filtered {
                    *s *= gain;
                }
                filtered
            };
            variants.push(v);
        }
        info!(variants = variants.len(), "stimulus bank ready");
        Ok(StimulusSet {
            variants,
            sample_rate: source.sample_rate,
        })
    }
}

/// Write every variant as `stim1.wav .. stimN.wav` (16-bit mono) into `dir`
/// for offline spectrum checks.
pub fn export_wav(set: &StimulusSet, dir: &Path) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: set.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    for i in 0..set.len() {
        let path = dir.join(format!("stim{}.wav", i + 1));
        let mut writer = hound::WavWriter::create(&path, spec)
            .map_err(|e| Error::Persistence(format!("{}: {e}", path.display())))?;
        for &sample in set.variant(i).expect("index in range") {
            let s = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(s)
                .map_err(|e| Error::Persistence(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        info!(path = %path.display(), "exported stimulus");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise_source(len: usize, sample_rate: u32) -> SourceSignal {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        SourceSignal {
            samples: (0..len).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect(),
            sample_rate,
        }
    }

    fn six_specs() -> Vec<FilterSpec> {
        crate::config::ExperimentConfig::default().stimuli
    }

    #[test]
    fn variants_share_length_and_rms() {
        let source = noise_source(48_000, 48_000);
        let set = StimulusBank::build(&source, &six_specs(), 0.75, 0).unwrap();
        assert_eq!(set.len(), 6);
        let rms_ref = dsp::rms(set.variant(0).unwrap());
        for i in 0..set.len() {
            let v = set.variant(i).unwrap();
            assert_eq!(v.len(), source.samples.len());
            let rel = (dsp::rms(v) - rms_ref).abs() / rms_ref;
            assert!(rel < 1e-6, "variant {i} RMS off by {rel}");
        }
    }

    #[test]
    fn variant_zero_is_peak_normalized() {
        let source = noise_source(4800, 48_000);
        let set = StimulusBank::build(&source, &six_specs(), 0.75, 0).unwrap();
        let peak = set
            .variant(0)
            .unwrap()
            .iter()
            .fold(0.0f32, |a, &b| a.max(b.abs()));
        assert!((peak - 0.75).abs() < 1e-5);
    }

    #[test]
    fn silent_source_is_degenerate() {
        let source = SourceSignal {
            samples: vec![0.0; 4800],
            sample_rate: 48_000,
        };
        let err = StimulusBank::build(&source, &six_specs(), 0.75, 0).unwrap_err();
        assert!(matches!(err, Error::DegenerateSignal { variant: 0 }));
    }

    #[test]
    fn taper_applies_to_every_variant() {
        let source = SourceSignal {
            samples: vec![0.5; 48_000],
            sample_rate: 48_000,
        };
        let specs = [FilterSpec::Source, FilterSpec::Source];
        let set = StimulusBank::build(&source, &specs, 0.75, 50).unwrap();
        for i in 0..set.len() {
            let v = set.variant(i).unwrap();
            assert_eq!(v[0], 0.0);
            assert!(v[v.len() - 1].abs() < 1e-6);
        }
    }

    #[test]
    fn duration_reflects_sample_count() {
        let source = noise_source(24_000, 48_000);
        let set = StimulusBank::build(&source, &six_specs(), 0.75, 0).unwrap();
        assert!((set.duration_secs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn export_writes_one_wav_per_variant() {
        let dir = tempfile::tempdir().unwrap();
        let source = noise_source(4800, 48_000);
        let set = StimulusBank::build(&source, &six_specs(), 0.75, 0).unwrap();
        export_wav(&set, dir.path()).unwrap();
        for i in 1..=6 {
            assert!(dir.path().join(format!("stim{i}.wav")).exists());
        }
    }

    #[test]
    fn missing_source_file_is_a_decode_error() {
        let err = load_source(Path::new("definitely-missing.mp3")).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
