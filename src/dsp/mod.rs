pub mod spectrum;

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Offset between the passband edge and the stopband edge used when a filter
/// order is derived from gain specifications rather than given directly.
pub const GUARD_BAND_HZ: f32 = 300.0;

/// How the Butterworth order of a filter stage is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOrder {
    /// Use this order as given.
    Fixed(u32),
    /// Derive the minimum order meeting the gain spec, with the stopband
    /// edge sitting [`GUARD_BAND_HZ`] beyond the passband edge.
    PassStop {
        passband_ripple_db: f32,
        stopband_atten_db: f32,
    },
}

/// One stimulus condition: how the source recording is filtered for a
/// variant. Cutoffs in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FilterSpec {
    /// The unmodified source.
    Source,
    Lowpass { cutoff_hz: f32, order: FilterOrder },
    Highpass { cutoff_hz: f32, order: FilterOrder },
    /// Lowpass at `high_hz` followed by highpass at `low_hz`.
    Band {
        low_hz: f32,
        high_hz: f32,
        order: FilterOrder,
    },
}

/// Minimum Butterworth order meeting `stopband_atten_db` at `stop_hz` while
/// keeping attenuation below `passband_ripple_db` at `pass_hz`. Works for
/// both lowpass (`stop > pass`) and highpass (`stop < pass`) transitions.
/// Edges are bilinear-prewarped before applying the analog order formula,
/// matching scipy's `buttord`.
pub fn butter_order(
    sample_rate: u32,
    pass_hz: f32,
    stop_hz: f32,
    passband_ripple_db: f32,
    stopband_atten_db: f32,
) -> Result<u32> {
    let nyquist = sample_rate as f64 / 2.0;
    let in_range = |f: f32| f > 0.0 && (f as f64) < nyquist;
    if !in_range(pass_hz) || !in_range(stop_hz) || pass_hz == stop_hz {
        return Err(Error::Config(format!(
            "cannot derive filter order for pass {pass_hz} Hz / stop {stop_hz} Hz at {sample_rate} Hz"
        )));
    }
    let wp = (std::f64::consts::FRAC_PI_2 * pass_hz as f64 / nyquist).tan();
    let ws = (std::f64::consts::FRAC_PI_2 * stop_hz as f64 / nyquist).tan();
    let ratio = if ws > wp { ws / wp } else { wp / ws };
    let gpass = 10f64.powf(0.1 * passband_ripple_db as f64) - 1.0;
    let gstop = 10f64.powf(0.1 * stopband_atten_db as f64) - 1.0;
    let n = ((gstop / gpass).log10() / (2.0 * ratio.log10())).ceil();
    Ok(n.max(1.0) as u32)
}

fn resolve_order(
    sample_rate: u32,
    cutoff_hz: f32,
    order: FilterOrder,
    lowpass: bool,
) -> Result<u32> {
    match order {
        FilterOrder::Fixed(n) => Ok(n.max(1)),
        FilterOrder::PassStop {
            passband_ripple_db,
            stopband_atten_db,
        } => {
            let stop_hz = if lowpass {
                cutoff_hz + GUARD_BAND_HZ
            } else {
                cutoff_hz - GUARD_BAND_HZ
            };
            butter_order(
                sample_rate,
                cutoff_hz,
                stop_hz,
                passband_ripple_db,
                stopband_atten_db,
            )
        }
    }
}

/// Q values for the second-order sections of an order-`n` Butterworth
/// cascade, from the pole angles; an odd `n` also needs one first-order
/// section.
fn butterworth_qs(n: u32) -> Vec<f32> {
    let pairs = n / 2;
    (1..=pairs)
        .map(|k| {
            let theta = (2 * k - 1) as f64 * std::f64::consts::PI / (2.0 * n as f64);
            (1.0 / (2.0 * theta.sin())) as f32
        })
        .collect()
}

/// One-pole lowpass/highpass stage used for odd-order cascades.
struct FirstOrder {
    b0: f32,
    b1: f32,
    a1: f32,
    x1: f32,
    y1: f32,
}

impl FirstOrder {
    fn new(sample_rate: u32, cutoff_hz: f32, lowpass: bool) -> Self {
        // Bilinear transform of the analog one-pole prototype.
        let k = (std::f64::consts::PI * cutoff_hz as f64 / sample_rate as f64).tan();
        let a0 = k + 1.0;
        let a1 = ((k - 1.0) / a0) as f32;
        let (b0, b1) = if lowpass {
            ((k / a0) as f32, (k / a0) as f32)
        } else {
            ((1.0 / a0) as f32, (-1.0 / a0) as f32)
        };
        Self {
            b0,
            b1,
            a1,
            x1: 0.0,
            y1: 0.0,
        }
    }

    fn run(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 - self.a1 * self.y1;
        self.x1 = x;
        self.y1 = y;
        y
    }
}

/// Causal Butterworth filter of arbitrary order, realized as a cascade of
/// biquad sections. Output length equals input length; no phase
/// compensation (this is `lfilter`, not `filtfilt`).
pub struct ButterworthFilter {
    sections: Vec<DirectForm2Transposed<f32>>,
    first_order: Option<FirstOrder>,
}

impl ButterworthFilter {
    pub fn design(
        sample_rate: u32,
        cutoff_hz: f32,
        order: FilterOrder,
        lowpass: bool,
    ) -> Result<Self> {
        let nyquist = sample_rate as f32 / 2.0;
        if cutoff_hz <= 0.0 || cutoff_hz >= nyquist {
            return Err(Error::Config(format!(
                "cutoff {cutoff_hz} Hz outside (0, {nyquist}) at {sample_rate} Hz"
            )));
        }
        let n = resolve_order(sample_rate, cutoff_hz, order, lowpass)?;
        let kind = if lowpass {
            Type::LowPass
        } else {
            Type::HighPass
        };
        let sections = butterworth_qs(n)
            .into_iter()
            .map(|q| {
                Coefficients::<f32>::from_params(kind, (sample_rate as f32).hz(), cutoff_hz.hz(), q)
                    .map(DirectForm2Transposed::<f32>::new)
                    .map_err(|e| Error::Config(format!("biquad design failed: {e:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let first_order = if n % 2 == 1 {
            Some(FirstOrder::new(sample_rate, cutoff_hz, lowpass))
        } else {
            None
        };
        Ok(Self {
            sections,
            first_order,
        })
    }

    pub fn apply(&mut self, signal: &[f32]) -> Vec<f32> {
        signal
            .iter()
            .map(|&x| {
                let mut y = x;
                if let Some(fo) = self.first_order.as_mut() {
                    y = fo.run(y);
                }
                for s in &mut self.sections {
                    y = s.run(y);
                }
                y
            })
            .collect()
    }
}

/// Apply a stimulus filter spec to `signal`. `Source` passes through.
pub fn apply_spec(spec: FilterSpec, signal: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
    match spec {
        FilterSpec::Source => Ok(signal.to_vec()),
        FilterSpec::Lowpass { cutoff_hz, order } => {
            Ok(ButterworthFilter::design(sample_rate, cutoff_hz, order, true)?.apply(signal))
        }
        FilterSpec::Highpass { cutoff_hz, order } => {
            Ok(ButterworthFilter::design(sample_rate, cutoff_hz, order, false)?.apply(signal))
        }
        FilterSpec::Band {
            low_hz,
            high_hz,
            order,
        } => {
            let lp = ButterworthFilter::design(sample_rate, high_hz, order, true)?.apply(signal);
            Ok(ButterworthFilter::design(sample_rate, low_hz, order, false)?.apply(&lp))
        }
    }
}

/// Root-mean-square amplitude, accumulated in f64.
pub fn rms(signal: &[f32]) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    let sum: f64 = signal.iter().map(|&x| (x as f64) * (x as f64)).sum();
    (sum / signal.len() as f64).sqrt()
}

/// Scale `signal` in place so its peak magnitude equals `target_peak`.
/// A silent signal is left untouched.
pub fn peak_normalize(signal: &mut [f32], target_peak: f32) {
    let peak = signal.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
    if peak > 0.0 {
        let gain = target_peak / peak;
        for v in signal.iter_mut() {
            *v *= gain;
        }
    }
}

/// Half-sine onset/offset ramps over `ramp_len` samples at each end,
/// suppressing clicks at stimulus edges.
pub fn taper(signal: &mut [f32], ramp_len: usize) {
    let n = signal.len();
    if ramp_len == 0 || 2 * ramp_len > n {
        return;
    }
    for i in 0..ramp_len {
        let g = (std::f32::consts::FRAC_PI_2 * i as f32 / ramp_len as f32).sin();
        signal[i] *= g;
        signal[n - 1 - i] *= g;
    }
}
