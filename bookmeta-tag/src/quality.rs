//! Encoding quality resolution
//!
//! Maps bitrate, sample rate and VBR percent onto one shared scale so that
//! "128k" and "VBR 80%" produce the same acoustic target whichever backend
//! encodes. Backends translate the shared 0-100 percent into their own
//! encoder knob with `percent_to_value`.

use crate::options::ConversionOptions;
use tracing::debug;

/// Sample rate (Hz) → recommended bitrate (kbps), ascending
pub const SAMPLE_RATE_TO_BITRATE: &[(u32, u32)] = &[
    (8000, 24),
    (11025, 32),
    (12000, 32),
    (16000, 48),
    (22050, 64),
    (32000, 96),
    (44100, 128),
];

/// VBR percent threshold → recommended sample rate (Hz), ascending
pub const VBR_PERCENT_TO_SAMPLE_RATE: &[(u32, u32)] = &[
    (0, 8000),
    (20, 16000),
    (40, 22050),
    (60, 32000),
    (80, 44100),
];

/// Bitrate for sample rates below the table
pub const LOW_BITRATE_KBPS: u32 = 16;

/// Bitrate for sample rates above the table
pub const HIGH_BITRATE_KBPS: u32 = 192;

/// Linear interpolation of a 0-100 percent onto `[min, max]`
///
/// The result is clamped into the range and rounded to `decimals` places.
/// `min` may be larger than `max` for encoder knobs where lower is better.
///
/// # Examples
///
/// ```
/// use bookmeta_tag::quality::percent_to_value;
///
/// assert_eq!(percent_to_value(0.0, 1.0, 5.0, 0), 1.0);
/// assert_eq!(percent_to_value(50.0, 1.0, 5.0, 0), 3.0);
/// assert_eq!(percent_to_value(100.0, 0.1, 2.0, 1), 2.0);
/// ```
pub fn percent_to_value(percent: f64, min: f64, max: f64, decimals: u32) -> f64 {
    let (low, high) = if min <= max { (min, max) } else { (max, min) };
    let raw = percent * (max - min) / 100.0 + min;
    let clamped = if raw.is_nan() { min } else { raw.clamp(low, high) };
    let factor = 10f64.powi(decimals as i32);
    ((clamped * factor).round() / factor).clamp(low, high)
}

/// Staircase lookup: bitrate of the highest table rate not above `sample_rate`
pub fn bitrate_for_sample_rate(sample_rate: u32) -> u32 {
    let (lowest_rate, _) = SAMPLE_RATE_TO_BITRATE[0];
    let (highest_rate, _) = SAMPLE_RATE_TO_BITRATE[SAMPLE_RATE_TO_BITRATE.len() - 1];
    if sample_rate < lowest_rate {
        return LOW_BITRATE_KBPS;
    }
    if sample_rate > highest_rate {
        return HIGH_BITRATE_KBPS;
    }
    SAMPLE_RATE_TO_BITRATE
        .iter()
        .rev()
        .find(|(rate, _)| *rate <= sample_rate)
        .map(|(_, kbps)| *kbps)
        .unwrap_or(LOW_BITRATE_KBPS)
}

/// Highest table sample rate whose bitrate does not exceed `bitrate_kbps`
///
/// Targets below the cheapest entry get the lowest sample rate.
pub fn sample_rate_for_bitrate(bitrate_kbps: u32) -> u32 {
    SAMPLE_RATE_TO_BITRATE
        .iter()
        .rev()
        .find(|(_, kbps)| *kbps <= bitrate_kbps)
        .unwrap_or(&SAMPLE_RATE_TO_BITRATE[0])
        .0
}

/// Sample rate of the highest VBR threshold not above `percent`
pub fn sample_rate_for_vbr(percent: f64) -> u32 {
    VBR_PERCENT_TO_SAMPLE_RATE
        .iter()
        .rev()
        .find(|(threshold, _)| *threshold as f64 <= percent)
        .unwrap_or(&VBR_PERCENT_TO_SAMPLE_RATE[0])
        .1
}

/// Fill in bitrate and/or sample rate from whatever the request specifies
///
/// **Algorithm:**
/// 1. Both set: nothing to do
/// 2. CBR: derive bitrate from sample rate, or both from the target bitrate
///    (explicit, else `default_bitrate_kbps`)
/// 3. VBR: derive the sample rate from the quality percent unless set
pub fn resolve_quality(options: &mut ConversionOptions, default_bitrate_kbps: u32) {
    if options.bitrate_kbps.is_some() && options.sample_rate.is_some() {
        return;
    }

    if !options.is_vbr() {
        match options.sample_rate {
            Some(rate) => {
                options.bitrate_kbps = Some(bitrate_for_sample_rate(rate));
            }
            None => {
                let target = options.bitrate_kbps.unwrap_or(default_bitrate_kbps);
                options.sample_rate = Some(sample_rate_for_bitrate(target));
                options.bitrate_kbps = Some(target);
            }
        }
    } else if options.sample_rate.is_none() {
        options.sample_rate = Some(sample_rate_for_vbr(options.vbr_quality));
    }

    debug!(
        bitrate_kbps = ?options.bitrate_kbps,
        sample_rate = ?options.sample_rate,
        vbr_quality = options.vbr_quality,
        "Resolved encoding quality"
    );
}
