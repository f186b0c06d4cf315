//! Legacy playurl response serialization.
//!
//! Old clients parse one of two shapes: a flat object with the archaic
//! playurl fields, or the newer `code/message/ttl/data` envelope. The body
//! produced here carries both at once so either parser finds what it expects.

use serde::Serialize;

use crate::media::MediaDescriptor;

pub const DEFAULT_QUALITY: i32 = 2;

const NOT_FOUND_CODE: i32 = -404;
const FORMAT: &str = "mp4";
const UNKNOWN: &str = "unknown";
const VIDEO_CODEC_ID: i32 = 7;

#[derive(Debug, Clone, Serialize)]
struct DurlEntry<'a> {
    order: i32,
    length: i64,
    size: i64,
    url: &'a str,
    backup_url: [&'a str; 0],
}

#[derive(Debug, Clone, Serialize)]
struct SupportFormat {
    quality: i32,
    format: &'static str,
    new_description: &'static str,
    display_desc: &'static str,
    superscript: &'static str,
}

/// Fields shared by the flat object and the `data` envelope.
#[derive(Debug, Clone, Serialize)]
struct Playurl<'a> {
    quality: i32,
    format: &'static str,
    timelength: i64,
    accept_format: &'static str,
    accept_description: [&'static str; 1],
    accept_quality: [i32; 1],
    video_codecid: i32,
    seek_param: &'static str,
    seek_type: &'static str,
    durl: Vec<DurlEntry<'a>>,
    support_formats: [SupportFormat; 1],
}

#[derive(Debug, Serialize)]
struct EnvelopeData<'a> {
    from: &'static str,
    result: &'static str,
    code: i32,
    #[serde(flatten)]
    playurl: Playurl<'a>,
}

#[derive(Debug, Serialize)]
struct LegacyBody<'a> {
    #[serde(flatten)]
    playurl: Playurl<'a>,
    code: i32,
    message: &'static str,
    ttl: i32,
    data: EnvelopeData<'a>,
}

/// Builds the legacy body. `None` (or a blank URL) produces the "not found"
/// answer with an empty `durl`.
pub fn build(media: Option<&MediaDescriptor>, qn: i32) -> Vec<u8> {
    let media = media.filter(|media| !media.url.trim().is_empty());
    let ok = media.is_some();
    let quality = if qn > 0 { qn } else { DEFAULT_QUALITY };

    let durl = media
        .map(|media| DurlEntry {
            order: 1,
            length: non_negative(media.byte_length),
            size: non_negative(media.byte_size),
            url: &media.url,
            backup_url: [],
        })
        .into_iter()
        .collect();

    let playurl = Playurl {
        quality,
        format: FORMAT,
        timelength: non_negative(media.and_then(|media| media.timelength_ms)),
        accept_format: FORMAT,
        accept_description: [UNKNOWN],
        accept_quality: [quality],
        video_codecid: VIDEO_CODEC_ID,
        seek_param: "start",
        seek_type: "second",
        durl,
        support_formats: [SupportFormat {
            quality,
            format: FORMAT,
            new_description: UNKNOWN,
            display_desc: UNKNOWN,
            superscript: "",
        }],
    };

    let code = if ok { 0 } else { NOT_FOUND_CODE };
    let body = LegacyBody {
        playurl: playurl.clone(),
        code,
        message: if ok { "0" } else { "not found" },
        ttl: 1,
        data: EnvelopeData {
            from: "local",
            result: if ok { "suee" } else { "error" },
            code,
            playurl,
        },
    };

    // Every field is a plain number, string or array of those.
    serde_json::to_vec(&body).unwrap_or_default()
}

/// Unreported or negative numbers are sent as 0.
fn non_negative(value: Option<i64>) -> i64 {
    value.filter(|v| *v > 0).unwrap_or(0)
}
