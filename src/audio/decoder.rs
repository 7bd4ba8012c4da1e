use std::{fs::File, path::Path};

use dasp::{interpolate::sinc::Sinc, ring_buffer, signal, Signal};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::{MediaSource, MediaSourceStream},
    meta::MetadataOptions,
    probe::Hint,
};

use super::buffer::{DecodedAudio, CANONICAL_FORMAT};
use crate::error::DecodeError;

/// Taps kept by the sinc interpolator (per channel).
const SINC_DEPTH: usize = 64;

/// Decode `path` completely into canonical 48 kHz stereo f32.
pub fn decode_file(path: &Path) -> Result<DecodedAudio, DecodeError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DecodeError::NotFound(path.to_path_buf()),
        _ => DecodeError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;
    let ext = path.extension().and_then(|e| e.to_str());
    decode_source(Box::new(file), ext)
}

/// Decode any symphonia media source. `extension` is a probe hint only.
pub fn decode_source(
    source: Box<dyn MediaSource>,
    extension: Option<&str>,
) -> Result<DecodedAudio, DecodeError> {
    let mss = MediaSourceStream::new(source, Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| DecodeError::Probe(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoTrack)?
        .clone();
    let track_id = track.id;
    let mut source_rate = track.codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Codec(e.to_string()))?;

    // The 48 kHz result is sized from the container's frame count plus 5 %
    // headroom, then trimmed or grown as packets actually arrive. Sources at
    // another rate stage their stereo at the source rate first.
    let output_capacity = estimate_samples(
        track.codec_params.n_frames,
        source_rate,
        Some(CANONICAL_FORMAT.sample_rate),
    );
    let staging = source_rate.is_some_and(|r| r != CANONICAL_FORMAT.sample_rate);
    let mut stereo: Vec<f32> = if staging {
        Vec::with_capacity(track.codec_params.n_frames.map_or(0, |n| n as usize * 2))
    } else {
        Vec::with_capacity(output_capacity)
    };
    let mut sample_buf: Option<(SampleBuffer<f32>, usize)> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => {
                log::warn!("Format read: {e}");
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                log::warn!("Decode error (skip): {e}");
                continue;
            }
            Err(e) => return Err(DecodeError::Codec(e.to_string())),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        source_rate.get_or_insert(spec.rate);

        let frames_cap = decoded.capacity();
        let needs_new = match &sample_buf {
            Some((_, cap)) => *cap < frames_cap,
            None => true,
        };
        if needs_new {
            sample_buf = Some((SampleBuffer::<f32>::new(frames_cap as u64, spec), frames_cap));
        }
        if let Some((buf, _)) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            remix_to_stereo(buf.samples(), channels, &mut stereo);
        }
    }

    if stereo.is_empty() {
        return Err(DecodeError::Empty);
    }

    let from_hz = source_rate.unwrap_or(CANONICAL_FORMAT.sample_rate);
    let mut samples = if from_hz == CANONICAL_FORMAT.sample_rate {
        stereo
    } else {
        log::debug!("resampling {} frames {from_hz} Hz -> {} Hz", stereo.len() / 2, CANONICAL_FORMAT.sample_rate);
        let mut out = Vec::with_capacity(output_capacity);
        resample_stereo(&stereo, from_hz, CANONICAL_FORMAT.sample_rate, &mut out);
        out
    };
    samples.shrink_to_fit();

    Ok(DecodedAudio::canonical(samples))
}

/// Expected interleaved stereo sample count at `to_hz`, plus 5 % headroom.
pub(crate) fn estimate_samples(n_frames: Option<u64>, from_hz: Option<u32>, to_hz: Option<u32>) -> usize {
    match (n_frames, from_hz, to_hz) {
        (Some(n), Some(from), Some(to)) if from > 0 => {
            let frames = (n as f64 * to as f64 / from as f64).ceil() as usize;
            let samples = frames * 2;
            samples + samples / 20
        }
        _ => 0,
    }
}

/// Append `interleaved` (with `channels` channels) to `out` as stereo:
/// mono is duplicated to both sides, layouts wider than stereo keep their
/// first two channels.
pub(crate) fn remix_to_stereo(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    match channels {
        0 => {}
        1 => {
            out.reserve(interleaved.len() * 2);
            for &s in interleaved {
                out.push(s);
                out.push(s);
            }
        }
        2 => out.extend_from_slice(interleaved),
        n => {
            out.reserve(interleaved.len() / n * 2);
            for frame in interleaved.chunks_exact(n) {
                out.push(frame[0]);
                out.push(frame[1]);
            }
        }
    }
}

/// Band-limited sample-rate conversion of interleaved stereo, appended to
/// `out`. Exactly `round(in_frames * to_hz / from_hz)` frames are produced.
pub(crate) fn resample_stereo(input: &[f32], from_hz: u32, to_hz: u32, out: &mut Vec<f32>) {
    if from_hz == to_hz || input.is_empty() || from_hz == 0 {
        out.extend_from_slice(input);
        return;
    }
    let in_frames = input.len() / 2;
    let out_frames = (in_frames as f64 * to_hz as f64 / from_hz as f64).round() as usize;

    // Past the last input frame the source yields silence, which lets the
    // interpolator flush its window.
    let source = signal::from_iter(input.chunks_exact(2).map(|lr| [lr[0], lr[1]]));
    let sinc = Sinc::new(ring_buffer::Fixed::from([[0.0_f32; 2]; SINC_DEPTH]));
    let converted = source.from_hz_to_hz(sinc, from_hz as f64, to_hz as f64);

    out.reserve(out_frames * 2);
    for frame in converted.take(out_frames) {
        out.extend_from_slice(&frame);
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let s = (2.0 * PI * 440.0 * t).sin() * 0.5;
            for _ in 0..channels {
                writer
                    .write_sample((s * i16::MAX as f32) as i16)
                    .expect("write sample");
            }
        }
        writer.finalize().expect("finalize wav");
    }

    #[test]
    fn mono_44k_decodes_to_canonical_with_same_duration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mono.wav");
        write_wav(&path, 44_100, 1, 44_100);

        let buf = decode_file(&path).expect("decode");
        assert_eq!(buf.format(), CANONICAL_FORMAT);
        assert_eq!(buf.format().channels, 2);
        assert!(
            (buf.duration().as_secs_f64() - 1.0).abs() < 0.005,
            "duration should be ~1 s, got {:?}",
            buf.duration()
        );
        assert_eq!(buf.frames(), 48_000);
    }

    #[test]
    fn stereo_48k_is_copied_without_resampling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 48_000, 2, 4800);

        let buf = decode_file(&path).expect("decode");
        assert_eq!(buf.frames(), 4800);
        let s = buf.samples();
        // Both channels carry the same sine.
        assert!(s.chunks_exact(2).all(|lr| lr[0] == lr[1]));
        assert!(s.iter().any(|&x| x.abs() > 0.4));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = decode_file(Path::new("/definitely/not/here.wav")).unwrap_err();
        assert!(matches!(err, DecodeError::NotFound(_)));
    }

    #[test]
    fn garbage_fails_to_probe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("noise.wav");
        std::fs::write(&path, b"this is not audio at all").expect("write");
        assert!(decode_file(&path).is_err());
    }

    #[test]
    fn remix_mono_duplicates() {
        let mut out = Vec::new();
        remix_to_stereo(&[0.1, 0.2], 1, &mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn remix_surround_keeps_front_pair() {
        let mut out = Vec::new();
        let six = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        remix_to_stereo(&six, 6, &mut out);
        assert_eq!(out, vec![1.0, 2.0, 7.0, 8.0]);
    }

    #[test]
    fn resample_length_is_exact() {
        let input = vec![0.0; 22_050 * 2];
        let mut out = Vec::new();
        resample_stereo(&input, 22_050, 48_000, &mut out);
        assert_eq!(out.len(), 48_000);
    }

    #[test]
    fn resample_fits_the_output_estimate() {
        let input = vec![0.0; 44_100 * 2];
        let mut out = Vec::with_capacity(estimate_samples(Some(44_100), Some(44_100), Some(48_000)));
        let capacity = out.capacity();
        resample_stereo(&input, 44_100, 48_000, &mut out);
        assert_eq!(out.len(), 96_000);
        assert_eq!(out.capacity(), capacity, "output buffer regrew");
    }

    #[test]
    fn resample_preserves_dc_level() {
        let input = vec![0.5; 4410 * 2];
        let mut out = Vec::new();
        resample_stereo(&input, 44_100, 48_000, &mut out);
        // Skip the interpolator's warm-up and tail.
        let mid = &out[out.len() / 4..out.len() * 3 / 4];
        for &s in mid {
            assert!((s - 0.5).abs() < 0.05, "DC drifted: {s}");
        }
    }

    #[test]
    fn estimate_adds_five_percent() {
        assert_eq!(estimate_samples(Some(48_000), Some(48_000), Some(48_000)), 96_000 + 4_800);
        assert_eq!(estimate_samples(Some(44_100), Some(44_100), Some(48_000)), 96_000 + 4_800);
        assert_eq!(estimate_samples(None, Some(44_100), Some(48_000)), 0);
    }
}
