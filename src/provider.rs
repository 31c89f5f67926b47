//! Lyrics provider seam: LRCLIB and Musixmatch clients, and a fallback
//! chain over them.
//!
//! A provider answers one query with found text, a confirmed "not found", or
//! a `FetchError`. Retries, rate limiting and text cleanup happen in the
//! fetch stage, not here.

use crate::config::{FetchConfig, ProviderKind};
use crate::error::FetchError;
use crate::models::{ProviderMeta, TrackRef};
use crate::normalize::{match_key, normalize_query_artist, normalize_query_title, strip_lrc_timestamps};
use crate::retry::RateLimiter;
use anyhow::bail;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use std::cmp::Ordering;
use std::time::Duration;
use tracing::debug;

/// Minimum title similarity for a search candidate to count as a match.
pub const TITLE_SIMILARITY_THRESHOLD: f64 = 0.85;
/// Minimum artist similarity for a search candidate to count as a match.
pub const ARTIST_SIMILARITY_THRESHOLD: f64 = 0.70;

/// A normalized provider query for one track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LyricsQuery {
    pub artist: String,
    pub title: String,
    /// Only ranks candidates; never sent as a search filter.
    pub album: Option<String>,
    /// Title as it appears in the library, used for response cleanup.
    pub display_title: String,
}

impl LyricsQuery {
    pub fn for_track(t: TrackRef<'_>) -> Self {
        Self {
            artist: normalize_query_artist(&t.album.artist),
            title: normalize_query_title(&t.track.title),
            album: Some(normalize_query_title(&t.album.title)).filter(|a| !a.is_empty()),
            display_title: t.track.title.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderResponse {
    Found { text: String, meta: ProviderMeta },
    /// Confirmed absence (no match, instrumental, or empty lyrics). Terminal.
    NotFound { meta: ProviderMeta },
}

pub trait LyricsProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Issue exactly one request for `query`.
    fn fetch(&self, query: &LyricsQuery) -> Result<ProviderResponse, FetchError>;
}

fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&match_key(a), &match_key(b))
}

/// Similarity of a candidate to the query, or `None` below either threshold.
fn verified_score(query: &LyricsQuery, title: &str, artist: &str) -> Option<f64> {
    let title_sim = similarity(&query.title, &normalize_query_title(title));
    let artist_sim = similarity(&query.artist, &normalize_query_artist(artist));
    (title_sim >= TITLE_SIMILARITY_THRESHOLD && artist_sim >= ARTIST_SIMILARITY_THRESHOLD)
        .then_some(title_sim + artist_sim)
}

fn http_client(user_agent: &str, timeout: Duration) -> anyhow::Result<Client> {
    Ok(Client::builder().user_agent(user_agent).timeout(timeout).build()?)
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map an HTTP status to a fetch error. `Ok(None)` means 404.
fn check_status(response: Response) -> Result<Option<Response>, FetchError> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::RateLimited {
            retry_after: retry_after(&response),
        });
    }
    if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        return Err(FetchError::Server(status.as_u16()));
    }
    if !status.is_success() {
        return Err(FetchError::Rejected(status.as_u16()));
    }
    Ok(Some(response))
}

fn read_json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, FetchError> {
    let body = response.text().map_err(|e| FetchError::Transport(e.to_string()))?;
    serde_json::from_str(&body).map_err(|e| FetchError::Malformed(e.to_string()))
}

fn get(client: &Client, url: String, params: &[(&str, &str)]) -> Result<Option<Response>, FetchError> {
    let response = client
        .get(url)
        .query(params)
        .send()
        .map_err(|e| FetchError::Transport(e.to_string()))?;
    check_status(response)
}

// ============================================================================
// LRCLIB
// ============================================================================

pub const LRCLIB_NAME: &str = "lrclib";

/// One search hit from `GET /search`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LrclibCandidate {
    pub id: i64,
    #[serde(default)]
    pub track_name: String,
    #[serde(default)]
    pub artist_name: String,
    #[serde(default)]
    pub album_name: Option<String>,
    #[serde(default)]
    pub instrumental: bool,
    #[serde(default)]
    pub plain_lyrics: Option<String>,
    #[serde(default)]
    pub synced_lyrics: Option<String>,
}

impl LrclibCandidate {
    fn plain(&self) -> Option<&str> {
        self.plain_lyrics.as_deref().filter(|s| !s.trim().is_empty())
    }

    fn synced(&self) -> Option<&str> {
        self.synced_lyrics.as_deref().filter(|s| !s.trim().is_empty())
    }

    fn has_answer(&self) -> bool {
        self.instrumental || self.plain().is_some() || self.synced().is_some()
    }
}

pub struct LrclibProvider {
    client: Client,
    base_url: String,
}

/// `/search` parameters. Artist and title only: an album filter would hide
/// deluxe editions and re-releases.
pub fn lrclib_search_params(query: &LyricsQuery) -> [(&'static str, &str); 2] {
    [("track_name", query.title.as_str()), ("artist_name", query.artist.as_str())]
}

impl LrclibProvider {
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(user_agent, timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(cfg: &FetchConfig) -> anyhow::Result<Self> {
        Self::new(&cfg.provider_url, &cfg.user_agent, cfg.timeout())
    }

    fn search(&self, query: &LyricsQuery) -> Result<Vec<LrclibCandidate>, FetchError> {
        match get(&self.client, format!("{}/search", self.base_url), &lrclib_search_params(query))? {
            Some(response) => read_json(response),
            None => Ok(Vec::new()),
        }
    }
}

impl LyricsProvider for LrclibProvider {
    fn name(&self) -> &str {
        LRCLIB_NAME
    }

    fn fetch(&self, query: &LyricsQuery) -> Result<ProviderResponse, FetchError> {
        let candidates = self.search(query)?;
        Ok(response_from_candidates(query, &candidates))
    }
}

fn same_album(query: &LyricsQuery, c: &LrclibCandidate) -> bool {
    match (&query.album, &c.album_name) {
        (Some(wanted), Some(theirs)) => match_key(wanted) == match_key(&normalize_query_title(theirs)),
        _ => false,
    }
}

/// Pick the best verified candidate.
///
/// Candidates must clear both similarity thresholds. Candidates that carry
/// an answer (lyrics or the instrumental flag) beat those that don't; then
/// higher combined similarity wins; then a candidate from the track's own
/// album; remaining ties go to the lowest provider id.
pub fn select_candidate<'a>(query: &LyricsQuery, candidates: &'a [LrclibCandidate]) -> Option<&'a LrclibCandidate> {
    let mut verified: Vec<(&LrclibCandidate, f64, bool)> = candidates
        .iter()
        .filter_map(|c| {
            verified_score(query, &c.track_name, &c.artist_name).map(|score| (c, score, same_album(query, c)))
        })
        .collect();

    verified.sort_by(|(a, sa, album_a), (b, sb, album_b)| {
        b.has_answer()
            .cmp(&a.has_answer())
            .then(sb.partial_cmp(sa).unwrap_or(Ordering::Equal))
            .then(album_b.cmp(album_a))
            .then(a.id.cmp(&b.id))
    });
    verified.first().map(|(c, _, _)| *c)
}

/// Turn a search result set into a provider answer.
pub fn response_from_candidates(query: &LyricsQuery, candidates: &[LrclibCandidate]) -> ProviderResponse {
    let Some(best) = select_candidate(query, candidates) else {
        return ProviderResponse::NotFound {
            meta: ProviderMeta {
                provider: LRCLIB_NAME.to_string(),
                ..Default::default()
            },
        };
    };

    let mut meta = ProviderMeta {
        provider: LRCLIB_NAME.to_string(),
        provider_id: Some(best.id),
        matched_artist: Some(best.artist_name.clone()),
        matched_title: Some(best.track_name.clone()),
        instrumental: best.instrumental,
        synced_only: false,
    };

    if best.instrumental {
        return ProviderResponse::NotFound { meta };
    }
    if let Some(plain) = best.plain() {
        return ProviderResponse::Found { text: plain.to_string(), meta };
    }
    if let Some(synced) = best.synced() {
        let text = strip_lrc_timestamps(synced);
        if !text.is_empty() {
            meta.synced_only = true;
            return ProviderResponse::Found { text, meta };
        }
    }
    ProviderResponse::NotFound { meta }
}

// ============================================================================
// Musixmatch
// ============================================================================

pub const MUSIXMATCH_NAME: &str = "musixmatch";

/// Musixmatch wraps every answer in `{"message": {"header", "body"}}` and
/// reports errors in the header, usually with HTTP 200 and `"body": []`.
#[derive(Debug, Deserialize)]
struct MxmEnvelope {
    message: MxmMessage,
}

#[derive(Debug, Deserialize)]
struct MxmMessage {
    header: MxmHeader,
    #[serde(default)]
    body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MxmHeader {
    status_code: u16,
}

#[derive(Debug, Default, Deserialize)]
struct MxmSearchBody {
    #[serde(default)]
    track_list: Vec<MxmTrackItem>,
}

#[derive(Debug, Deserialize)]
struct MxmTrackItem {
    track: MxmTrack,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MxmTrack {
    pub track_id: i64,
    #[serde(default)]
    pub track_name: String,
    #[serde(default)]
    pub artist_name: String,
    #[serde(default)]
    pub has_lyrics: u8,
    #[serde(default)]
    pub instrumental: u8,
}

#[derive(Debug, Deserialize)]
struct MxmLyricsBody {
    lyrics: Option<MxmLyrics>,
}

#[derive(Debug, Deserialize)]
struct MxmLyrics {
    #[serde(default)]
    lyrics_body: String,
}

/// Header status to outcome. `Ok(false)` means "no such resource".
fn mxm_status(code: u16) -> Result<bool, FetchError> {
    match code {
        200 => Ok(true),
        404 => Ok(false),
        429 => Err(FetchError::RateLimited { retry_after: None }),
        500..=599 => Err(FetchError::Server(code)),
        _ => Err(FetchError::Rejected(code)),
    }
}

/// Pick the best verified track: an answer (lyrics or instrumental) first,
/// then similarity, then the lowest id.
pub fn select_mxm_track<'a>(query: &LyricsQuery, tracks: &'a [MxmTrack]) -> Option<&'a MxmTrack> {
    let mut verified: Vec<(&MxmTrack, f64)> = tracks
        .iter()
        .filter_map(|t| verified_score(query, &t.track_name, &t.artist_name).map(|score| (t, score)))
        .collect();
    verified.sort_by(|(a, sa), (b, sb)| {
        let answer = |t: &MxmTrack| t.has_lyrics != 0 || t.instrumental != 0;
        answer(b)
            .cmp(&answer(a))
            .then(sb.partial_cmp(sa).unwrap_or(Ordering::Equal))
            .then(a.track_id.cmp(&b.track_id))
    });
    verified.first().map(|(t, _)| *t)
}

/// Drop the usage notice (and the tracking id after it) that Musixmatch
/// appends to lyric bodies.
pub fn strip_mxm_notice(body: &str) -> String {
    let cut = body.find("*******").unwrap_or(body.len());
    body[..cut].trim_end().to_string()
}

pub struct MusixmatchProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl MusixmatchProvider {
    pub fn new(base_url: &str, api_key: &str, user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(user_agent, timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(cfg: &FetchConfig) -> anyhow::Result<Self> {
        let Some(key) = cfg.musixmatch_api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            bail!("fetch.musixmatch_api_key is not set");
        };
        Self::new(&cfg.musixmatch_url, key, &cfg.user_agent, cfg.timeout())
    }

    fn call<B: for<'de> Deserialize<'de>>(&self, method: &str, params: &[(&str, &str)]) -> Result<Option<B>, FetchError> {
        let mut params = params.to_vec();
        params.push(("apikey", self.api_key.as_str()));
        let Some(response) = get(&self.client, format!("{}/{}", self.base_url, method), &params)? else {
            return Ok(None);
        };
        let envelope: MxmEnvelope = read_json(response)?;
        if !mxm_status(envelope.message.header.status_code)? {
            return Ok(None);
        }
        serde_json::from_value(envelope.message.body)
            .map(Some)
            .map_err(|e| FetchError::Malformed(e.to_string()))
    }

    fn not_found(meta: ProviderMeta) -> ProviderResponse {
        ProviderResponse::NotFound { meta }
    }
}

impl LyricsProvider for MusixmatchProvider {
    fn name(&self) -> &str {
        MUSIXMATCH_NAME
    }

    fn fetch(&self, query: &LyricsQuery) -> Result<ProviderResponse, FetchError> {
        let mut meta = ProviderMeta {
            provider: MUSIXMATCH_NAME.to_string(),
            ..Default::default()
        };
        let search: Option<MxmSearchBody> = self.call(
            "track.search",
            &[
                ("q_track", query.title.as_str()),
                ("q_artist", query.artist.as_str()),
                ("page_size", "10"),
            ],
        )?;
        let tracks: Vec<MxmTrack> = search
            .map(|b| b.track_list.into_iter().map(|i| i.track).collect())
            .unwrap_or_default();
        let Some(best) = select_mxm_track(query, &tracks) else {
            return Ok(Self::not_found(meta));
        };

        meta.provider_id = Some(best.track_id);
        meta.matched_artist = Some(best.artist_name.clone());
        meta.matched_title = Some(best.track_name.clone());
        meta.instrumental = best.instrumental != 0;
        if meta.instrumental || best.has_lyrics == 0 {
            return Ok(Self::not_found(meta));
        }

        let track_id = best.track_id.to_string();
        let lyrics: Option<MxmLyricsBody> = self.call("track.lyrics.get", &[("track_id", track_id.as_str())])?;
        let text = lyrics
            .and_then(|b| b.lyrics)
            .map(|l| strip_mxm_notice(&l.lyrics_body))
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(Self::not_found(meta));
        }
        Ok(ProviderResponse::Found { text, meta })
    }
}

// ============================================================================
// Fallback chain
// ============================================================================

/// Providers tried in order; the first `Found` wins.
///
/// The answer is `NotFound` only when every member says so. If no member
/// finds the lyrics and any member failed, the failure is returned instead
/// (a transient one in preference), so the track stays retryable. The first
/// member is paced by the fetcher; later members share `pacer`.
pub struct FallbackProvider {
    name: String,
    members: Vec<Box<dyn LyricsProvider>>,
    pacer: RateLimiter,
}

impl FallbackProvider {
    pub fn new(members: Vec<Box<dyn LyricsProvider>>, interval: Duration) -> anyhow::Result<Self> {
        if members.is_empty() {
            bail!("provider chain is empty");
        }
        let name = members.iter().map(|m| m.name()).collect::<Vec<_>>().join("+");
        Ok(Self {
            name,
            members,
            pacer: RateLimiter::new(interval),
        })
    }

    pub fn from_config(cfg: &FetchConfig) -> anyhow::Result<Self> {
        let mut members: Vec<Box<dyn LyricsProvider>> = Vec::with_capacity(cfg.providers.len());
        for kind in &cfg.providers {
            let member: Box<dyn LyricsProvider> = match kind {
                ProviderKind::Lrclib => Box::new(LrclibProvider::from_config(cfg)?),
                ProviderKind::Musixmatch => Box::new(MusixmatchProvider::from_config(cfg)?),
            };
            members.push(member);
        }
        Self::new(members, cfg.min_request_interval())
    }
}

impl LyricsProvider for FallbackProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, query: &LyricsQuery) -> Result<ProviderResponse, FetchError> {
        let mut not_found: Option<ProviderMeta> = None;
        let mut failure: Option<FetchError> = None;

        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                self.pacer.acquire();
            }
            match member.fetch(query) {
                Ok(found @ ProviderResponse::Found { .. }) => return Ok(found),
                Ok(ProviderResponse::NotFound { meta }) => {
                    debug!("{}: no lyrics for {} / {}", member.name(), query.artist, query.title);
                    not_found.get_or_insert(meta);
                }
                Err(e) => {
                    debug!("{}: {} / {} failed: {}", member.name(), query.artist, query.title, e);
                    let replace = match &failure {
                        None => true,
                        Some(prev) => e.is_transient() && !prev.is_transient(),
                    };
                    if replace {
                        failure = Some(e);
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(ProviderResponse::NotFound {
                meta: not_found.unwrap_or_default(),
            }),
        }
    }
}
