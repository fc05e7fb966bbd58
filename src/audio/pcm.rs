//! Pure sample-rate conversion and PCM encoding.
//!
//! Capture produces native-rate f32 blocks; the transport carries 16kHz
//! little-endian i16 mono. Both transforms here are allocation-per-block,
//! no shared state, so they can run inside the frame pump without locking.

/// Linearly resample one block of mono f32 samples.
///
/// Identity when the rates match. Output length is
/// `floor(len * target_rate / native_rate)`; each output sample interpolates
/// between its two nearest source samples, with the last source sample passed
/// through where no upper neighbor exists.
pub fn resample(input: &[f32], native_rate: u32, target_rate: u32) -> Vec<f32> {
    if native_rate == target_rate || input.is_empty() {
        return input.to_vec();
    }

    let out_len = (input.len() as u64 * target_rate as u64 / native_rate as u64) as usize;
    if out_len == 0 {
        return Vec::new();
    }
    if input.len() == 1 || out_len == 1 {
        return vec![input[0]];
    }

    let span = (input.len() - 1) as f64;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let t = i as f64 * span / (out_len - 1) as f64;
        let lower = t.floor() as usize;
        let frac = t - lower as f64;
        let sample = match input.get(lower + 1) {
            Some(&upper) => input[lower] as f64 * (1.0 - frac) + upper as f64 * frac,
            None => input[lower] as f64,
        };
        out.push(sample as f32);
    }
    out
}

/// Convert one f32 sample in [-1, 1] to a signed 16-bit value.
///
/// Negative values scale by 32768 and non-negative by 32767, using the full
/// asymmetric signed range. Out-of-range inputs are clamped first.
pub fn encode_sample(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encode a block of f32 samples as little-endian i16 PCM bytes.
pub fn encode_block(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&encode_sample(s).to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_identity_when_rates_match() {
        let input = vec![0.1, -0.2, 0.3, 0.4];
        assert_eq!(resample(&input, 48_000, 48_000), input);
        assert_eq!(resample(&input, 16_000, 16_000), input);
    }

    #[test]
    fn resample_output_length() {
        let input = vec![0.0; 480];
        assert_eq!(resample(&input, 48_000, 16_000).len(), 160);

        let input = vec![0.0; 441];
        // floor(441 * 16000 / 44100) = 160
        assert_eq!(resample(&input, 44_100, 16_000).len(), 160);
    }

    #[test]
    fn resample_empty_input() {
        assert!(resample(&[], 48_000, 16_000).is_empty());
    }

    #[test]
    fn resample_single_sample_passthrough() {
        assert_eq!(resample(&[0.5], 48_000, 16_000), vec![0.5]);
        assert_eq!(resample(&[0.5], 8_000, 48_000), vec![0.5]);
    }

    #[test]
    fn resample_endpoints_preserved() {
        let input = vec![-1.0, -0.5, 0.0, 0.5, 1.0, 0.5, 0.0, -0.5, -1.0];
        let out = resample(&input, 48_000, 16_000);
        assert_eq!(out.first().copied(), Some(-1.0));
        assert_eq!(out.last().copied(), Some(-1.0));
    }

    #[test]
    fn resample_interpolates_between_neighbors() {
        // Ramp stays a ramp under linear interpolation.
        let input: Vec<f32> = (0..10).map(|i| i as f32 / 9.0).collect();
        let out = resample(&input, 30_000, 15_000);
        for window in out.windows(2) {
            assert!(window[1] >= window[0]);
        }
    }

    #[test]
    fn encode_full_scale() {
        assert_eq!(encode_sample(1.0), 32767);
        assert_eq!(encode_sample(-1.0), -32768);
        assert_eq!(encode_sample(0.0), 0);
    }

    #[test]
    fn encode_clamps_out_of_range() {
        assert_eq!(encode_sample(1.5), 32767);
        assert_eq!(encode_sample(-2.0), -32768);
    }

    #[test]
    fn encode_block_little_endian() {
        let bytes = encode_block(&[0.0, 1.0]);
        assert_eq!(bytes, vec![0x00, 0x00, 0xFF, 0x7F]);
    }
}
