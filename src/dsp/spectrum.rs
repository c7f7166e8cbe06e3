use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Amplitude spectrum of a mono signal: relative level in dB (0 dB at the
/// strongest bin), positive frequencies only.
pub struct Spectrum {
    pub freqs_hz: Vec<f32>,
    pub level_db: Vec<f32>,
}

impl Spectrum {
    /// Relative level of the bin nearest `hz`.
    pub fn level_at(&self, hz: f32) -> f32 {
        let mut best = 0;
        let mut best_dist = f32::MAX;
        for (i, &f) in self.freqs_hz.iter().enumerate() {
            let d = (f - hz).abs();
            if d < best_dist {
                best_dist = d;
                best = i;
            }
        }
        self.level_db[best]
    }
}

const SILENCE_FLOOR_DB: f32 = -200.0;

/// FFT of the whole signal, magnitudes normalized to the peak bin and
/// converted to dB.
pub fn amplitude_spectrum(signal: &[f32], sample_rate: u32) -> Spectrum {
    let n = signal.len();
    if n == 0 {
        return Spectrum {
            freqs_hz: Vec::new(),
            level_db: Vec::new(),
        };
    }
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n);
    let mut buf: Vec<Complex<f32>> = signal.iter().map(|&x| Complex::new(x, 0.0)).collect();
    fft.process(&mut buf);

    let half = n / 2;
    let mags: Vec<f32> = buf[..half.max(1)].iter().map(|c| c.norm()).collect();
    let max = mags.iter().fold(0.0f32, |a, &b| a.max(b));
    let level_db = mags
        .iter()
        .map(|&m| {
            if max > 0.0 && m > 0.0 {
                20.0 * (m / max).log10()
            } else {
                SILENCE_FLOOR_DB
            }
        })
        .collect();
    let freqs_hz = (0..half.max(1))
        .map(|i| i as f32 * sample_rate as f32 / n as f32)
        .collect();
    Spectrum { freqs_hz, level_db }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_peaks_at_its_frequency() {
        let sample_rate = 48_000;
        let n = 4800;
        let tone: Vec<f32> = (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / sample_rate as f32).sin())
            .collect();
        let sp = amplitude_spectrum(&tone, sample_rate);
        assert!(sp.level_at(1000.0) > -1.0);
        assert!(sp.level_at(5000.0) < -40.0);
    }

    #[test]
    fn lowpassed_noise_drops_above_cutoff() {
        use crate::dsp::{ButterworthFilter, FilterOrder};
        use rand::Rng;
        let sample_rate = 48_000;
        let mut rng = rand::thread_rng();
        let noise: Vec<f32> = (0..48_000).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
        let mut lp =
            ButterworthFilter::design(sample_rate, 2000.0, FilterOrder::Fixed(8), true).unwrap();
        let filtered = lp.apply(&noise);
        let sp = amplitude_spectrum(&filtered, sample_rate);
        // Order-8 rolloff is 48 dB/octave; average over a band to smooth the
        // per-bin fluctuation of the noise excitation.
        let band_mean = |lo: f32, hi: f32| {
            let mut sum = 0.0f32;
            let mut count = 0usize;
            for (f, l) in sp.freqs_hz.iter().zip(&sp.level_db) {
                if (lo..hi).contains(f) {
                    sum += l;
                    count += 1;
                }
            }
            sum / count as f32
        };
        assert!(band_mean(7500.0, 8500.0) < band_mean(800.0, 1200.0) - 40.0);
    }

    #[test]
    fn empty_signal_yields_empty_spectrum() {
        let sp = amplitude_spectrum(&[], 48_000);
        assert!(sp.freqs_hz.is_empty());
    }
}
