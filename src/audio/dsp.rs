//! Post-decode sample processing: dynamic range compression and stereo downmix

use crate::constants::{DOWNMIX_MIX_LEVEL, DRC_THRESHOLD};
use crate::frame::AudioBlock;
use crate::types::{AudioControls, DownmixPolicy};

/// Two-segment gain: unity up to the threshold, `1 / ratio` slope above it.
pub fn compress(samples: &mut [f32], ratio: f32) {
    let ratio = ratio.max(1.0);
    for sample in samples.iter_mut() {
        let magnitude = sample.abs();
        if magnitude > DRC_THRESHOLD {
            let compressed = DRC_THRESHOLD + (magnitude - DRC_THRESHOLD) / ratio;
            *sample = compressed.copysign(*sample);
        }
    }
}

/// Folds a multichannel block down to two channels. LFE is discarded.
pub fn downmix_to_stereo(block: &AudioBlock) -> AudioBlock {
    let channels = block.channels as usize;
    let m = DOWNMIX_MIX_LEVEL;
    let mut samples = Vec::with_capacity(block.frames() * 2);

    for frame in block.samples.chunks_exact(channels.max(1)) {
        let at = |i: usize| frame.get(i).copied().unwrap_or(0.0);
        // channel order follows the coded acmod layout
        let (l, r) = match block.channel_mode {
            0 | 2 => (at(0), at(1)),
            1 => (at(0), at(0)),
            3 => (at(0) + m * at(1), at(2) + m * at(1)),
            4 => (at(0) + m * at(2), at(1) + m * at(2)),
            5 => (at(0) + m * at(1) + m * at(3), at(2) + m * at(1) + m * at(3)),
            6 => (at(0) + m * at(2), at(1) + m * at(3)),
            _ => (at(0) + m * at(1) + m * at(3), at(2) + m * at(1) + m * at(4)),
        };
        samples.push(l.clamp(-1.0, 1.0));
        samples.push(r.clamp(-1.0, 1.0));
    }

    AudioBlock {
        samples,
        sample_rate: block.sample_rate,
        channels: 2,
        channel_mode: 2,
        lfe: false,
        pts_us: block.pts_us,
    }
}

/// Applies the active controls to a decoded block
pub fn process(mut block: AudioBlock, controls: &AudioControls) -> AudioBlock {
    if controls.downmix == DownmixPolicy::Stereo && (block.channels > 2 || block.lfe) {
        block = downmix_to_stereo(&block);
    }
    if controls.drc_enabled {
        compress(&mut block.samples, controls.drc_ratio);
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(channel_mode: u8, lfe: bool, frame: &[f32]) -> AudioBlock {
        AudioBlock {
            samples: frame.repeat(4),
            sample_rate: 48_000,
            channels: frame.len() as u8,
            channel_mode,
            lfe,
            pts_us: 0,
        }
    }

    #[test]
    fn compression_above_threshold_only() {
        let mut samples = vec![0.25, -0.5, 0.9, -1.0];
        compress(&mut samples, 2.0);
        for (got, want) in samples.iter().zip([0.25, -0.5, 0.7, -0.75]) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
    }

    #[test]
    fn ratio_below_one_is_unity() {
        let mut samples = vec![0.8];
        compress(&mut samples, 0.5);
        assert_eq!(samples, vec![0.8]);
    }

    #[test]
    fn five_one_folds_to_stereo() {
        // L C R SL SR LFE
        let input = block(7, true, &[0.1, 0.2, 0.3, 0.0, 0.0, 0.9]);
        let out = downmix_to_stereo(&input);
        assert_eq!(out.channels, 2);
        assert_eq!(out.frames(), 4);
        let expected_l = 0.1 + DOWNMIX_MIX_LEVEL * 0.2;
        let expected_r = 0.3 + DOWNMIX_MIX_LEVEL * 0.2;
        assert!((out.samples[0] - expected_l).abs() < 1e-6);
        assert!((out.samples[1] - expected_r).abs() < 1e-6);
    }

    #[test]
    fn mono_is_duplicated() {
        let out = downmix_to_stereo(&block(1, false, &[0.4]));
        assert_eq!(&out.samples[..2], &[0.4, 0.4]);
    }

    #[test]
    fn passthrough_leaves_layout() {
        let input = block(7, false, &[0.0; 5]);
        let out = process(input.clone(), &AudioControls::default());
        assert_eq!(out, input);
    }
}
