//! Model of the JSON document printed by `mediainfo --Output=JSON`.
//!
//! mediainfo reports one `{media: {@ref, track: [...]}}` object per input
//! file, wrapped in an array when invoked with several paths. Track
//! values arrive as strings.

use crate::error::{ReforgeError, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Report {
    Many(Vec<FileReport>),
    One(FileReport),
}

#[derive(Debug, Deserialize)]
struct FileReport {
    media: Option<Media>,
}

#[derive(Debug, Deserialize)]
struct Media {
    #[serde(rename = "@ref")]
    reference: String,
    #[serde(default)]
    track: Vec<Track>,
}

#[derive(Debug, Default, Deserialize)]
struct Track {
    #[serde(rename = "@type", default)]
    kind: String,
    #[serde(rename = "FileSize")]
    file_size: Option<String>,
    #[serde(rename = "Duration")]
    duration: Option<String>,
    #[serde(rename = "OverallBitRate")]
    overall_bit_rate: Option<String>,
    #[serde(rename = "BitRate")]
    bit_rate: Option<String>,
    #[serde(rename = "Width")]
    width: Option<String>,
    #[serde(rename = "Height")]
    height: Option<String>,
    #[serde(rename = "FrameRate")]
    frame_rate: Option<String>,
    #[serde(rename = "Format")]
    format: Option<String>,
    #[serde(rename = "HDR_Format")]
    hdr_format: Option<String>,
    #[serde(rename = "colour_primaries")]
    colour_primaries: Option<String>,
    #[serde(rename = "Channels")]
    channels: Option<String>,
    #[serde(rename = "Format_Commercial_IfAny")]
    format_commercial: Option<String>,
}

/// Everything the analyzer wants to know about one probed file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaProbe {
    pub path: String,
    pub file_size: Option<i64>,
    pub duration: Option<f64>,
    pub overall_bitrate: Option<i64>,
    pub video_bitrate: Option<i64>,
    pub audio_bitrate: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub frame_rate: Option<f64>,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
    pub max_audio_channels: Option<i64>,
    pub atmos: bool,
    pub hdr: Option<String>,
}

impl MediaProbe {
    /// Overall container bitrate when mediainfo reports one, otherwise
    /// the sum of the stream bitrates.
    pub fn derived_bitrate(&self) -> i64 {
        match self.overall_bitrate {
            Some(overall) if overall > 0 => overall,
            _ => self.video_bitrate.unwrap_or(0) + self.audio_bitrate.unwrap_or(0),
        }
    }
}

/// Parse the full document into one probe per reported file.
pub fn parse(json: &str) -> Result<Vec<MediaProbe>> {
    let report: Report = serde_json::from_str(json).map_err(|e| ReforgeError::Parse {
        context: "mediainfo JSON".into(),
        message: e.to_string(),
    })?;

    let files = match report {
        Report::Many(files) => files,
        Report::One(file) => vec![file],
    };

    Ok(files
        .into_iter()
        .filter_map(|file| file.media)
        .map(probe_from_media)
        .collect())
}

fn probe_from_media(media: Media) -> MediaProbe {
    let mut probe = MediaProbe {
        path: media.reference,
        ..Default::default()
    };

    for track in &media.track {
        match track.kind.as_str() {
            "General" => {
                if probe.file_size.is_none() {
                    probe.file_size = parse_int(&track.file_size);
                    probe.duration = parse_float(&track.duration);
                    probe.overall_bitrate = parse_int(&track.overall_bit_rate);
                }
            }
            "Video" => {
                if probe.width.is_none() {
                    probe.width = parse_int(&track.width);
                    probe.height = parse_int(&track.height);
                    probe.frame_rate = parse_float(&track.frame_rate);
                    probe.video_bitrate = parse_int(&track.bit_rate);
                }
                if let Some(format) = &track.format {
                    probe.video_codecs.push(format.clone());
                }
                if probe.hdr.is_none() {
                    probe.hdr = track
                        .hdr_format
                        .clone()
                        .or_else(|| track.colour_primaries.clone());
                }
            }
            "Audio" => {
                if let Some(format) = &track.format {
                    probe.audio_codecs.push(format.clone());
                }
                if let Some(bitrate) = parse_int(&track.bit_rate) {
                    probe.audio_bitrate = Some(probe.audio_bitrate.unwrap_or(0) + bitrate);
                }
                if let Some(channels) = parse_int(&track.channels) {
                    if channels > probe.max_audio_channels.unwrap_or(0) {
                        probe.max_audio_channels = Some(channels);
                    }
                }
                if track_mentions_atmos(track) {
                    probe.atmos = true;
                }
            }
            _ => {}
        }
    }

    probe
}

fn track_mentions_atmos(track: &Track) -> bool {
    [&track.format, &track.format_commercial]
        .iter()
        .any(|field| {
            field
                .as_deref()
                .map(|s| s.contains("Atmos"))
                .unwrap_or(false)
        })
}

fn parse_int(field: &Option<String>) -> Option<i64> {
    field.as_deref().and_then(first_number).map(|f| f as i64)
}

fn parse_float(field: &Option<String>) -> Option<f64> {
    field.as_deref().and_then(first_number)
}

/// mediainfo occasionally reports compound values ("8 / 6 channels");
/// the first numeric token is the one that matters.
fn first_number(s: &str) -> Option<f64> {
    s.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .find(|token| !token.is_empty())
        .and_then(|token| token.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = r#"{
        "media": {
            "@ref": "/tv/Show/S01/e1.mkv",
            "track": [
                {
                    "@type": "General",
                    "FileSize": "4294967296",
                    "Duration": "2640.192",
                    "OverallBitRate": "13014000"
                },
                {
                    "@type": "Video",
                    "Format": "HEVC",
                    "Width": "3840",
                    "Height": "2160",
                    "FrameRate": "23.976",
                    "BitRate": "12000000",
                    "HDR_Format": "Dolby Vision"
                },
                {
                    "@type": "Audio",
                    "Format": "E-AC-3",
                    "Format_Commercial_IfAny": "Dolby Digital Plus with Dolby Atmos",
                    "Channels": "6",
                    "BitRate": "768000"
                },
                {
                    "@type": "Audio",
                    "Format": "AAC",
                    "Channels": "2",
                    "BitRate": "128000"
                }
            ]
        }
    }"#;

    #[test]
    fn extracts_all_fields_from_a_single_file() {
        let probes = parse(SINGLE).unwrap();
        assert_eq!(probes.len(), 1);
        let probe = &probes[0];

        assert_eq!(probe.path, "/tv/Show/S01/e1.mkv");
        assert_eq!(probe.file_size, Some(4_294_967_296));
        assert_eq!(probe.duration, Some(2640.192));
        assert_eq!(probe.overall_bitrate, Some(13_014_000));
        assert_eq!(probe.width, Some(3840));
        assert_eq!(probe.height, Some(2160));
        assert_eq!(probe.frame_rate, Some(23.976));
        assert_eq!(probe.video_codecs, vec!["HEVC"]);
        assert_eq!(probe.audio_codecs, vec!["E-AC-3", "AAC"]);
        assert_eq!(probe.max_audio_channels, Some(6));
        assert!(probe.atmos);
        assert_eq!(probe.hdr.as_deref(), Some("Dolby Vision"));
        assert_eq!(probe.derived_bitrate(), 13_014_000);
    }

    #[test]
    fn parses_an_array_of_files() {
        let doc = format!("[{}, {}]", SINGLE, SINGLE.replace("e1.mkv", "e2.mkv"));
        let probes = parse(&doc).unwrap();
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[1].path, "/tv/Show/S01/e2.mkv");
    }

    #[test]
    fn bitrate_falls_back_to_stream_sum() {
        let doc = r#"{
            "media": {
                "@ref": "/x.mkv",
                "track": [
                    {"@type": "General", "FileSize": "1000"},
                    {"@type": "Video", "Format": "AVC", "Width": "1280",
                     "Height": "720", "FrameRate": "25.000", "BitRate": "900000"},
                    {"@type": "Audio", "Format": "AC-3", "Channels": "6", "BitRate": "384000"}
                ]
            }
        }"#;
        let probes = parse(doc).unwrap();
        assert_eq!(probes[0].overall_bitrate, None);
        assert_eq!(probes[0].derived_bitrate(), 1_284_000);
    }

    #[test]
    fn colour_primaries_alone_marks_hdr() {
        let doc = r#"{
            "media": {
                "@ref": "/x.mkv",
                "track": [
                    {"@type": "Video", "Format": "HEVC", "Width": "3840",
                     "Height": "2160", "FrameRate": "24.000",
                     "colour_primaries": "BT.2020"}
                ]
            }
        }"#;
        let probes = parse(doc).unwrap();
        assert_eq!(probes[0].hdr.as_deref(), Some("BT.2020"));
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        assert!(parse("not json at all").is_err());
    }

    #[test]
    fn missing_file_size_survives_parsing() {
        let doc = r#"{"media": {"@ref": "/gone.mkv", "track": [{"@type": "General"}]}}"#;
        let probes = parse(doc).unwrap();
        assert_eq!(probes[0].file_size, None);
    }
}
