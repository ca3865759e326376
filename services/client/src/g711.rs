//! G.711 µ-law (PCMU) codec.
//!
//! The voice server negotiates PCMU at 8 kHz, so microphone audio is encoded
//! here before it is packetised and remote packets are decoded back to f32.

/// Sample rate of every PCMU stream.
pub const PCMU_SAMPLE_RATE: u32 = 8000;
/// Samples in one 20 ms packet.
pub const PCMU_FRAME_SAMPLES: usize = 160;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Encodes one linear PCM16 sample.
pub fn encode_sample(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };
    magnitude = magnitude.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

/// Decodes one µ-law byte to linear PCM16.
pub fn decode_sample(code: u8) -> i16 {
    let code = !code;
    let exponent = (code >> 4) & 0x07;
    let mantissa = (code & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if code & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encodes normalised f32 samples, clamping anything outside [-1.0, 1.0].
pub fn encode(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|&s| encode_sample((s * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16))
        .collect()
}

pub fn decode(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|&code| decode_sample(code) as f32 / 32768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_known_codes() {
        assert_eq!(encode_sample(0), 0xFF);
        assert_eq!(decode_sample(0xFF), 0);
        assert_eq!(decode_sample(0x7F), 0);
        assert_eq!(decode_sample(0x80), 32124);
        assert_eq!(decode_sample(0x00), -32124);
        assert_eq!(encode_sample(i16::MAX), 0x80);
        assert_eq!(encode_sample(i16::MIN), 0x00);
    }

    #[test]
    fn test_quantisation_error_scales_with_magnitude() {
        for sample in (-32000i32..32000).step_by(97) {
            let decoded = decode_sample(encode_sample(sample as i16)) as i32;
            let error = (decoded - sample).abs();
            assert!(
                error <= (sample.abs() + BIAS) / 32 + 1,
                "sample {sample} decoded to {decoded}"
            );
        }
    }

    #[test]
    fn test_decoding_is_monotonic_in_magnitude() {
        let positive: Vec<i16> = (0x80..=0xFFu8).rev().map(decode_sample).collect();
        assert!(positive.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_f32_helpers_clamp_and_normalise() {
        let payload = encode(&[0.5, -0.5, 2.0, -2.0, 0.0]);
        assert_eq!(payload.len(), 5);

        let decoded = decode(&payload);
        assert_abs_diff_eq!(decoded[0], 0.5, epsilon = 0.02);
        assert_abs_diff_eq!(decoded[1], -0.5, epsilon = 0.02);
        assert!(decoded[2] <= 1.0 && decoded[2] > 0.95);
        assert!(decoded[3] >= -1.0 && decoded[3] < -0.95);
        assert_eq!(decoded[4], 0.0);
    }
}
