//! Parsers for ab-av1's crf-search and encode output streams.
//!
//! The sample and progress line shapes are the stable contract with the
//! binary; everything else on the stream is ignored.

use regex::Regex;
use std::sync::OnceLock;

/// One `crf N VMAF S ...` sample reported by `ab-av1 crf-search`.
#[derive(Debug, Clone, PartialEq)]
pub struct CrfSample {
    pub crf: f64,
    pub score: f64,
    /// Predicted output size as percent of the input.
    pub percent: f64,
    /// Predicted output size in bytes, when reported.
    pub size: Option<i64>,
    /// Predicted encode time in seconds, when reported.
    pub time_seconds: Option<i64>,
}

/// Events on an `ab-av1 encode` stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeEvent {
    /// `... encoding <id>.mkv` — the temp filename carries the video id.
    Started { video_id: i64 },
    Progress {
        percent: f64,
        fps: f64,
        eta_seconds: u64,
    },
    /// `Encoded <size> <unit> (<pct>%)` — observed but unused downstream.
    SizeProgress { bytes: i64, percent: f64 },
}

fn crf_sample_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"crf (\d+(?:\.\d+)?) VMAF (\d+(?:\.\d+)?)(?: predicted video stream size (\d+(?:\.\d+)?) ([A-Za-z]+))? \((\d+(?:\.\d+)?)%\)(?: taking (\d+) (second|minute|hour)s?)?",
        )
        .unwrap()
    })
}

fn encode_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"encoding (\d+)\.mkv").unwrap())
}

fn encode_progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(\d+(?:\.\d+)?)%, (\d+(?:\.\d+)?) fps, eta (\d+) (second|minute|hour|day|week|month|year)s?",
        )
        .unwrap()
    })
}

fn encode_size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Encoded (\d+(?:\.\d+)?) ([A-Za-z]+) \((\d+(?:\.\d+)?)%\)").unwrap()
    })
}

pub fn parse_crf_sample(line: &str) -> Option<CrfSample> {
    let caps = crf_sample_re().captures(line)?;

    let crf: f64 = caps.get(1)?.as_str().parse().ok()?;
    let score: f64 = caps.get(2)?.as_str().parse().ok()?;
    let size = match (caps.get(3), caps.get(4)) {
        (Some(value), Some(unit)) => {
            let value: f64 = value.as_str().parse().ok()?;
            Some(to_bytes(value, unit.as_str())?)
        }
        _ => None,
    };
    let percent: f64 = caps.get(5)?.as_str().parse().ok()?;
    let time_seconds = match (caps.get(6), caps.get(7)) {
        (Some(value), Some(unit)) => {
            let value: i64 = value.as_str().parse().ok()?;
            Some(value * time_unit_seconds(unit.as_str())?)
        }
        _ => None,
    };

    Some(CrfSample {
        crf,
        score,
        percent,
        size,
        time_seconds,
    })
}

/// Canonical form of a sample line; `parse_crf_sample` reads it back
/// losslessly.
pub fn render_crf_sample(sample: &CrfSample) -> String {
    let mut line = format!("crf {} VMAF {}", sample.crf, sample.score);
    if let Some(size) = sample.size {
        line.push_str(&format!(" predicted video stream size {} B", size));
    }
    line.push_str(&format!(" ({}%)", sample.percent));
    if let Some(time) = sample.time_seconds {
        line.push_str(&format!(" taking {} seconds", time));
    }
    line
}

pub fn parse_encode_line(line: &str) -> Option<EncodeEvent> {
    if let Some(caps) = encode_progress_re().captures(line) {
        let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
        let fps: f64 = caps.get(2)?.as_str().parse().ok()?;
        let value: u64 = caps.get(3)?.as_str().parse().ok()?;
        let unit = caps.get(4)?.as_str();
        return Some(EncodeEvent::Progress {
            percent,
            fps,
            eta_seconds: value * eta_unit_seconds(unit)?,
        });
    }

    if let Some(caps) = encode_start_re().captures(line) {
        let video_id: i64 = caps.get(1)?.as_str().parse().ok()?;
        return Some(EncodeEvent::Started { video_id });
    }

    if let Some(caps) = encode_size_re().captures(line) {
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let unit = caps.get(2)?.as_str();
        let percent: f64 = caps.get(3)?.as_str().parse().ok()?;
        return Some(EncodeEvent::SizeProgress {
            bytes: to_bytes(value, unit)?,
            percent,
        });
    }

    None
}

fn to_bytes(value: f64, unit: &str) -> Option<i64> {
    let factor: f64 = match unit {
        "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * factor) as i64)
}

fn time_unit_seconds(unit: &str) -> Option<i64> {
    match unit {
        "second" => Some(1),
        "minute" => Some(60),
        "hour" => Some(3600),
        _ => None,
    }
}

fn eta_unit_seconds(unit: &str) -> Option<u64> {
    match unit {
        "second" => Some(1),
        "minute" => Some(60),
        "hour" => Some(3_600),
        "day" => Some(86_400),
        "week" => Some(604_800),
        "month" => Some(2_592_000),
        "year" => Some(31_536_000),
        _ => None,
    }
}

/// Known FFmpeg failure phrases surfaced through ab-av1's output.
const FFMPEG_ERROR_PHRASES: &[&str] = &[
    "invalid channel layout",
    "unknown encoder",
    "cannot allocate memory",
    "no space left on device",
    "permission denied",
    "invalid data found when processing input",
    "conversion failed",
];

fn ffmpeg_exit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Error: ffmpeg encode exit code (\d+)").unwrap())
}

/// Scan captured output for the wrapped FFmpeg failure, to enrich a
/// failure message beyond ab-av1's own exit code.
pub fn extract_ffmpeg_error(output: &str) -> Option<String> {
    if let Some(caps) = ffmpeg_exit_re().captures(output) {
        let code = caps.get(1)?.as_str();
        let detail = FFMPEG_ERROR_PHRASES
            .iter()
            .find(|phrase| output.to_lowercase().contains(*phrase))
            .map(|phrase| format!(": {}", phrase))
            .unwrap_or_default();
        return Some(format!("ffmpeg exited with code {}{}", code, detail));
    }

    FFMPEG_ERROR_PHRASES
        .iter()
        .find(|phrase| output.to_lowercase().contains(*phrase))
        .map(|phrase| phrase.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_sample_line_parses() {
        let line =
            "- crf 28 VMAF 95.32 predicted video stream size 743.61 MiB (22%) taking 31 minutes";
        let sample = parse_crf_sample(line).unwrap();
        assert_eq!(sample.crf, 28.0);
        assert_eq!(sample.score, 95.32);
        assert_eq!(sample.percent, 22.0);
        assert_eq!(sample.size, Some((743.61 * 1024.0 * 1024.0) as i64));
        assert_eq!(sample.time_seconds, Some(31 * 60));
    }

    #[test]
    fn minimal_sample_line_parses() {
        let sample = parse_crf_sample("crf 24.5 VMAF 96.1 (35%)").unwrap();
        assert_eq!(sample.crf, 24.5);
        assert_eq!(sample.score, 96.1);
        assert_eq!(sample.percent, 35.0);
        assert_eq!(sample.size, None);
        assert_eq!(sample.time_seconds, None);
    }

    #[test]
    fn trailing_predicted_marker_is_tolerated() {
        let line = "crf 26 VMAF 94.9 predicted video stream size 1.2 GiB (40%) taking 2 hours predicted";
        let sample = parse_crf_sample(line).unwrap();
        assert_eq!(sample.time_seconds, Some(7200));
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        assert_eq!(parse_crf_sample("sampling 5 segments"), None);
        assert_eq!(parse_crf_sample(""), None);
    }

    #[test]
    fn sample_round_trips_through_render() {
        let samples = [
            CrfSample {
                crf: 28.0,
                score: 95.32,
                percent: 22.0,
                size: Some(779_680_000),
                time_seconds: Some(1860),
            },
            CrfSample {
                crf: 24.5,
                score: 96.1,
                percent: 35.0,
                size: None,
                time_seconds: None,
            },
        ];
        for sample in samples {
            let parsed = parse_crf_sample(&render_crf_sample(&sample)).unwrap();
            assert_eq!(parsed, sample);
        }
    }

    #[test]
    fn encode_start_line_carries_the_video_id() {
        let line = "[2024-05-02T10:00:00Z INFO] encoding 42.mkv";
        assert_eq!(
            parse_encode_line(line),
            Some(EncodeEvent::Started { video_id: 42 })
        );
    }

    #[test]
    fn encode_progress_line_parses_with_eta_units() {
        let line = "⠙ 00:01:23 12%, 31.5 fps, eta 14 minutes";
        match parse_encode_line(line).unwrap() {
            EncodeEvent::Progress {
                percent,
                fps,
                eta_seconds,
            } => {
                assert_eq!(percent, 12.0);
                assert_eq!(fps, 31.5);
                assert_eq!(eta_seconds, 14 * 60);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let line = "99%, 3 fps, eta 2 days";
        match parse_encode_line(line).unwrap() {
            EncodeEvent::Progress { eta_seconds, .. } => assert_eq!(eta_seconds, 2 * 86_400),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn encode_size_line_is_recognized() {
        let line = "Encoded 1.5 GiB (48%)";
        match parse_encode_line(line).unwrap() {
            EncodeEvent::SizeProgress { bytes, percent } => {
                assert_eq!(bytes, (1.5 * 1024.0 * 1024.0 * 1024.0) as i64);
                assert_eq!(percent, 48.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn ffmpeg_errors_are_extracted_from_output_tails() {
        let output = "noise\nError: ffmpeg encode exit code 234\nInvalid channel layout 5.1(side)";
        let message = extract_ffmpeg_error(output).unwrap();
        assert!(message.contains("234"));
        assert!(message.contains("invalid channel layout"));

        assert_eq!(extract_ffmpeg_error("all fine here"), None);
    }
}
