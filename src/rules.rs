//! Deterministic assembly of ab-av1 argument lists from video attributes
//! and per-video overrides.
//!
//! Arguments move through three shapes: flat strings in, `(flag, value)`
//! tuples for filtering and dedup, flat strings out. Dedup keeps the
//! first occurrence of each canonical flag; `--svt` and `--enc` may
//! repeat with different values.

use crate::store::Video;
use regex::Regex;
use std::sync::OnceLock;

const GIB: i64 = 1024 * 1024 * 1024;

/// Which ab-av1 subcommand the arguments are being built for. Audio rules
/// apply only to encodes; a crf-search measures the video stream alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgContext {
    CrfSearch,
    Encode,
}

type Arg = (String, Option<String>);

/// Flags stripped from overrides before a crf-search: bounds and temp dir
/// are owned by the pipeline, audio flags don't apply.
const CRF_SEARCH_DROPPED: &[&str] = &[
    "--temp-dir",
    "--min-vmaf",
    "--max-vmaf",
    "--acodec",
    "--downmix-to-stereo",
    "--video-only",
];

/// Flags stripped from overrides before an encode: bounds belong to the
/// search that already ran.
const ENCODE_DROPPED: &[&str] = &[
    "--temp-dir",
    "--min-vmaf",
    "--max-vmaf",
    "--min-crf",
    "--max-crf",
];

/// Build the full argument list for one invocation.
///
/// Concatenation order: subcommands from `base_args`, base flags,
/// filtered `overrides`, then the attribute-derived rules.
pub fn build_args(
    video: &Video,
    context: ArgContext,
    overrides: &[String],
    base_args: &[String],
) -> Vec<String> {
    let (heads, base) = to_tuples(base_args);
    let (_, raw_overrides) = to_tuples(overrides);
    let overrides = filter_overrides(context, raw_overrides);
    let rules = rule_tuples(video, context);

    let mut combined = base;
    combined.extend(overrides);
    combined.extend(rules);

    let mut out = heads;
    flatten(dedup(combined), &mut out);
    out
}

/// The argv fragment recorded next to each VMAF sample: filtered
/// overrides plus rules, without subcommand or pipeline-bound flags.
pub fn build_fragment(video: &Video, context: ArgContext, overrides: &[String]) -> Vec<String> {
    build_args(video, context, overrides, &[])
}

fn to_tuples(args: &[String]) -> (Vec<String>, Vec<Arg>) {
    let mut heads = Vec::new();
    let mut tuples = Vec::new();
    let mut iter = args.iter().peekable();

    while let Some(token) = iter.next() {
        if token.starts_with('-') {
            let value = match iter.peek() {
                Some(next) if !next.starts_with('-') => Some(iter.next().unwrap().clone()),
                _ => None,
            };
            tuples.push((token.clone(), value));
        } else if tuples.is_empty() {
            heads.push(token.clone());
        }
        // Stray positional tokens after the first flag are dropped.
    }

    (heads, tuples)
}

fn filter_overrides(context: ArgContext, overrides: Vec<Arg>) -> Vec<Arg> {
    let dropped = match context {
        ArgContext::CrfSearch => CRF_SEARCH_DROPPED,
        ArgContext::Encode => ENCODE_DROPPED,
    };

    overrides
        .into_iter()
        .filter(|(flag, value)| {
            if dropped.contains(&flag.as_str()) {
                return false;
            }
            if context == ArgContext::CrfSearch && flag == "--enc" {
                if let Some(value) = value {
                    if value.starts_with("b:a=") || value.starts_with("ac=") {
                        return false;
                    }
                }
            }
            true
        })
        .collect()
}

fn rule_tuples(video: &Video, context: ArgContext) -> Vec<Arg> {
    let mut rules = Vec::new();

    if video.height.unwrap_or(0) > 1080 {
        rules.push(("--vfilter".into(), Some("scale=1920:-2".into())));
    }

    rules.push(("--pix-format".into(), Some("yuv420p10le".into())));

    if context == ArgContext::Encode {
        rules.push(("--acodec".into(), Some("copy".into())));
    }

    rules.push(("--svt".into(), Some("tune=0".into())));
    if video.hdr.is_some() {
        rules.push(("--svt".into(), Some("dolbyvision=1".into())));
    }

    if effective_year(video).map(|y| y < 2009).unwrap_or(false) {
        rules.push(("--svt".into(), Some("film-grain=8".into())));
    }

    rules
}

fn canonical(flag: &str) -> &str {
    match flag {
        "-i" => "--input",
        "-o" => "--output",
        other => other,
    }
}

fn dedup(args: Vec<Arg>) -> Vec<Arg> {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();

    for (flag, value) in args {
        let name = canonical(&flag).to_string();
        if name == "--svt" || name == "--enc" {
            out.push((name, value));
            continue;
        }
        if seen.contains(&name) {
            continue;
        }
        seen.push(name.clone());
        out.push((name, value));
    }

    out
}

fn flatten(args: Vec<Arg>, out: &mut Vec<String>) {
    for (flag, value) in args {
        out.push(flag);
        if let Some(value) = value {
            out.push(value);
        }
    }
}

/// The VMAF score an encode of this video must preserve. Very large files
/// may trade a little quality for tractable search times.
pub fn vmaf_target(video: &Video) -> u32 {
    if video.size > 60 * GIB {
        91
    } else if video.size > 40 * GIB {
        92
    } else if video.size > 25 * GIB {
        94
    } else {
        95
    }
}

fn effective_year(video: &Video) -> Option<i64> {
    video.content_year.or_else(|| extract_year(&video.path))
}

fn delimited_year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\((\d{4})\)|\[(\d{4})\]|\.(\d{4})\.| (\d{4}) ").unwrap()
    })
}

fn bare_year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4})\b").unwrap())
}

fn plausible_year(y: i64) -> bool {
    (1950..=2030).contains(&y)
}

/// Find a release year in a filename or title. Delimited forms win by
/// position in the text; a bare four-digit run is the last resort.
pub fn extract_year(text: &str) -> Option<i64> {
    for caps in delimited_year_re().captures_iter(text) {
        let year = (1..=4)
            .find_map(|i| caps.get(i))
            .and_then(|m| m.as_str().parse::<i64>().ok());
        if let Some(year) = year {
            if plausible_year(year) {
                return Some(year);
            }
        }
    }

    for caps in bare_year_re().captures_iter(text) {
        if let Some(year) = caps.get(1).and_then(|m| m.as_str().parse::<i64>().ok()) {
            if plausible_year(year) {
                return Some(year);
            }
        }
    }

    None
}
