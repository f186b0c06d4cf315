//! Extraction of a playable stream from a modern playurl response.

use serde::Deserialize;

/// A playable stream pulled out of the upstream response. Numbers the
/// upstream did not report stay `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescriptor {
    pub url: String,
    pub timelength_ms: Option<i64>,
    pub byte_length: Option<i64>,
    pub byte_size: Option<i64>,
}

impl MediaDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timelength_ms: None,
            byte_length: None,
            byte_size: None,
        }
    }
}

#[derive(Deserialize)]
struct PlayurlResponse {
    #[serde(default)]
    data: Option<PlayurlData>,
}

#[derive(Deserialize)]
struct PlayurlData {
    #[serde(default)]
    timelength: Option<i64>,
    #[serde(default)]
    durl: Option<Vec<Durl>>,
    #[serde(default)]
    dash: Option<Dash>,
}

#[derive(Deserialize)]
struct Durl {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    size: Option<i64>,
}

#[derive(Deserialize)]
struct Dash {
    #[serde(default)]
    video: Option<Vec<DashTrack>>,
}

/// Upstream sends both spellings on the same track, so they are separate
/// fields rather than aliases.
#[derive(Deserialize)]
struct DashTrack {
    #[serde(default, rename = "baseUrl")]
    base_url: Option<String>,
    #[serde(default, rename = "base_url")]
    base_url_snake: Option<String>,
}

impl DashTrack {
    fn url(self) -> Option<String> {
        let non_blank = |url: &String| !url.trim().is_empty();
        self.base_url
            .filter(non_blank)
            .or_else(|| self.base_url_snake.filter(non_blank))
    }
}

/// Prefers the first direct-play `durl` entry, falling back to the first
/// adaptive video track. Returns `None` for unparseable bodies or when neither
/// carries a URL.
pub fn extract_media(body: &str) -> Option<MediaDescriptor> {
    let response: PlayurlResponse = serde_json::from_str(body).ok()?;
    let data = response.data?;

    if let Some(first) = data.durl.into_iter().flatten().next()
        && let Some(url) = first.url.filter(|url| !url.trim().is_empty())
    {
        return Some(MediaDescriptor {
            url,
            timelength_ms: data.timelength,
            byte_length: first.length,
            byte_size: first.size,
        });
    }

    let track = data.dash?.video?.into_iter().next()?;
    let url = track.url()?;
    Some(MediaDescriptor {
        url,
        timelength_ms: data.timelength,
        // Adaptive tracks report no per-segment length; the duration stands in.
        byte_length: data.timelength,
        byte_size: None,
    })
}
