//! Templated-URL scraper sources (weather + geology)
//!
//! Guardrails, applied before any network contact:
//! 1. domain allow-list, 2. government-domain block, 3. rolling-window
//! request budget, 4. per-host cooldown (in FetchClient), 5. slug
//! resolution (override table, then city-index map, then at most one
//! conservative URL variant), 6. per-run URL-collision refusal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::watch;

use crate::config::Config;
use crate::models::{
    error_kinds, Channel, DataMode, Observation, RawPayload, RegionInput, SourceError,
};
use crate::services::cache::CacheService;
use crate::services::scraper_runtime::ScraperRuntime;

use super::http::{FetchClient, FetchOptions};
use super::{lithology_risk_of, value_f64};

const NUM: &str = r"([0-9]+(?:\.[0-9]+)?)";

/// Regex-based metric extraction from scraped pages.
pub struct PageParser {
    re_script: Regex,
    re_style: Regex,
    re_tags: Regex,
    re_ws: Regex,
    re_rain_24h: Vec<Regex>,
    re_rain_1h: Vec<Regex>,
    re_wind: Vec<Regex>,
    re_humidity: Vec<Regex>,
    re_wind_level: Regex,
    re_slope: Vec<Regex>,
    re_fault: Vec<Regex>,
}

impl PageParser {
    pub fn new() -> Result<Self, regex::Error> {
        let build = |patterns: &[String]| -> Result<Vec<Regex>, regex::Error> {
            patterns.iter().map(|p| Regex::new(p)).collect()
        };

        Ok(Self {
            re_script: Regex::new(r"(?is)<script.*?>.*?</script>")?,
            re_style: Regex::new(r"(?is)<style.*?>.*?</style>")?,
            re_tags: Regex::new(r"(?is)<[^>]+>")?,
            re_ws: Regex::new(r"\s+")?,
            re_rain_24h: build(&[
                format!(r"(?i)(?:24\s*h|24\s*hours?)[^0-9]{{0,16}}{NUM}\s*(?:mm|millimeter)"),
                format!(r"(?:24小时(?:降水|降雨)?|日降雨量)[^0-9]{{0,16}}{NUM}\s*(?:mm|毫米)?"),
                format!(r"(?:降水量|雨量)[^0-9]{{0,16}}{NUM}\s*(?:mm|毫米)"),
            ])?,
            re_rain_1h: build(&[
                format!(r"(?i)(?:1\s*h|1\s*hour)[^0-9]{{0,16}}{NUM}\s*(?:mm|millimeter)"),
                format!(r"(?:1小时(?:降水|降雨)?|小时雨量)[^0-9]{{0,16}}{NUM}\s*(?:mm|毫米)?"),
            ])?,
            re_wind: build(&[
                format!(r"(?i)(?:wind\s*speed)[^0-9]{{0,16}}{NUM}\s*(?:m/s|mps)"),
                format!(r"(?:风速|平均风速)[^0-9]{{0,16}}{NUM}\s*(?:m/s|米/秒)"),
            ])?,
            re_humidity: build(&[
                format!(r"(?i)(?:relative\s*humidity|humidity)[^0-9]{{0,16}}{NUM}\s*%"),
                format!(r"(?:湿度|相对湿度)[^0-9]{{0,16}}{NUM}\s*%"),
            ])?,
            re_wind_level: Regex::new(r"([0-9]{1,2})\s*级")?,
            re_slope: build(&[
                format!(r"(?i)(?:slope(?:\s*angle)?)[^0-9]{{0,16}}{NUM}\s*(?:deg|degree|°)"),
                format!(r"(?:坡度|坡角)[^0-9]{{0,16}}{NUM}\s*(?:°|度)?"),
            ])?,
            re_fault: build(&[
                format!(
                    r"(?i)(?:fault\s*distance|distance\s*to\s*fault)[^0-9]{{0,16}}{NUM}\s*(?:km|kilometers?)"
                ),
                format!(r"(?:断层距离|距离断层)[^0-9]{{0,16}}{NUM}\s*(?:km|公里)?"),
            ])?,
        })
    }

    pub fn strip_html(&self, raw: &str) -> String {
        let text = self.re_script.replace_all(raw, " ");
        let text = self.re_style.replace_all(&text, " ");
        let text = self.re_tags.replace_all(&text, " ");
        self.re_ws.replace_all(&text, " ").trim().to_string()
    }

    fn first_number(&self, patterns: &[Regex], text: &str) -> Option<f64> {
        for pattern in patterns {
            if let Some(captures) = pattern.captures(text) {
                if let Some(value) = captures.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Weather metrics from page text. Explicit millimetre readings win;
    /// when none exist the condition text yields `_est` fields only.
    pub fn parse_weather(&self, raw: &str) -> Observation {
        let text = self.strip_html(raw);

        let rain_24h = self.first_number(&self.re_rain_24h, &text);
        let rain_1h = self.first_number(&self.re_rain_1h, &text);
        let humidity = self.first_number(&self.re_humidity, &text);
        let wind_speed = self.first_number(&self.re_wind, &text).or_else(|| {
            self.re_wind_level
                .captures(&text)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<i64>().ok())
                .map(beaufort_to_mps)
        });

        let mut obs = Observation {
            rain_24h,
            rain_1h,
            humidity,
            wind_speed,
            data_mode: DataMode::Scraped,
            ..Observation::default()
        };

        if rain_24h.is_none() && rain_1h.is_none() {
            if let Some((est_24h, est_1h)) = condition_rain_estimate(&text) {
                obs.rain_24h_est = Some(est_24h);
                obs.rain_1h_est = Some(est_1h);
                obs.data_quality_note = Some("precipitation_estimated".to_string());
            }
        }
        obs
    }

    /// Geology metrics from page text.
    pub fn parse_geology(&self, raw: &str) -> Observation {
        let text = self.strip_html(raw);

        let slope = self.first_number(&self.re_slope, &text);
        let fault_distance = self.first_number(&self.re_fault, &text);
        let lithology = detect_lithology(&text);

        Observation {
            slope,
            fault_distance,
            lithology_risk: lithology.as_deref().and_then(lithology_risk_of),
            lithology,
            data_mode: DataMode::Scraped,
            ..Observation::default()
        }
    }
}

/// Beaufort level to m/s (band midpoints).
pub fn beaufort_to_mps(level: i64) -> f64 {
    const TABLE: [f64; 13] = [
        0.2, 1.5, 3.3, 5.4, 7.9, 10.7, 13.8, 17.1, 20.7, 24.4, 28.4, 32.6, 36.9,
    ];
    TABLE[level.clamp(0, 12) as usize]
}

/// Condition-text (rain_24h, rain_1h) estimate; None when no token matched.
pub fn condition_rain_estimate(text: &str) -> Option<(f64, f64)> {
    const TABLE: [(&str, f64, f64); 14] = [
        ("特大暴雨", 250.0, 35.0),
        ("大暴雨", 180.0, 25.0),
        ("暴雨", 100.0, 15.0),
        ("大雨", 50.0, 8.0),
        ("中雨", 22.0, 3.6),
        ("小雨", 8.0, 1.1),
        ("雷阵雨", 16.0, 2.4),
        ("阵雨", 9.0, 1.2),
        ("雨夹雪", 6.0, 0.7),
        ("冻雨", 8.0, 1.0),
        ("暴雪", 15.0, 1.5),
        ("大雪", 8.0, 0.8),
        ("中雪", 4.0, 0.4),
        ("小雪", 1.8, 0.2),
    ];
    let mut best: Option<(f64, f64)> = None;
    for (token, rain_24h, rain_1h) in TABLE {
        if text.contains(token) {
            let (b24, b1) = best.unwrap_or((0.0, 0.0));
            best = Some((b24.max(rain_24h), b1.max(rain_1h)));
        }
    }
    best
}

fn detect_lithology(text: &str) -> Option<String> {
    const TABLE: [(&str, &str); 8] = [
        ("granite", "granite"),
        ("sandstone", "sandstone"),
        ("shale", "shale"),
        ("limestone", "limestone"),
        ("花岗岩", "granite"),
        ("砂岩", "sandstone"),
        ("页岩", "shale"),
        ("石灰岩", "limestone"),
    ];
    let lowered = text.to_lowercase();
    TABLE
        .iter()
        .find(|(token, _)| lowered.contains(token))
        .map(|(_, mapped)| mapped.to_string())
}

const SLUG_BLOCKLIST: [&str; 14] = [
    "news",
    "air",
    "video",
    "plugin",
    "alarmnews",
    "worldcity",
    "chinacity",
    "province",
    "jingdian",
    "toutiao",
    "tag",
    "latest",
    "zhuanti",
    "changshi",
];

/// Administrative suffixes, longest first so the longest suffix wins.
const REGION_SUFFIXES: [&str; 19] = [
    "特别行政区",
    "自治州",
    "自治县",
    "高新区",
    "开发区",
    "市辖区",
    "自治区",
    "自治旗",
    "新区",
    "矿区",
    "林区",
    "地区",
    "省",
    "市",
    "区",
    "县",
    "州",
    "盟",
    "旗",
];

struct IndexState {
    fetched_at: Instant,
    map: HashMap<String, String>,
}

/// Region name -> URL slug resolution: curated overrides, then a city-index
/// map built once from the index page, then (outside city-level-only mode)
/// a containment fallback.
pub struct SlugResolver {
    config: Arc<Config>,
    http: Arc<FetchClient>,
    overrides: HashMap<String, String>,
    index: tokio::sync::Mutex<Option<IndexState>>,
    link_pattern: Option<Regex>,
    tag_pattern: Option<Regex>,
}

impl SlugResolver {
    pub fn new(config: Arc<Config>, http: Arc<FetchClient>) -> Self {
        let overrides = load_overrides(&config.scraper_slug_overrides_path);
        Self {
            config,
            http,
            overrides,
            index: tokio::sync::Mutex::new(None),
            link_pattern: Regex::new(r#"(?is)<a[^>]+href=['"]([^'"]+)['"][^>]*>(.*?)</a>"#).ok(),
            tag_pattern: Regex::new(r"(?is)<[^>]+>").ok(),
        }
    }

    /// Strips separators and one administrative suffix (longest match).
    pub fn normalize_name(name: &str) -> String {
        let mut text: String = name
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '\u{3000}' | '.' | '_' | '/' | '-' | '·' | '•'))
            .collect();
        for suffix in REGION_SUFFIXES {
            if text.ends_with(suffix) && text.chars().count() > suffix.chars().count() {
                text = text[..text.len() - suffix.len()].to_string();
                break;
            }
        }
        text.to_lowercase()
    }

    pub fn is_valid_slug(slug: &str) -> bool {
        let s = slug.trim();
        if s.len() < 2 || s.len() > 64 {
            return false;
        }
        if SLUG_BLOCKLIST.contains(&s) {
            return false;
        }
        s.chars().any(|c| c.is_ascii_lowercase())
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    }

    fn slug_from_href(href: &str) -> Option<String> {
        let lowered = href.trim().to_lowercase();
        let path = if let Some(idx) = lowered.find("://") {
            let after = &lowered[idx + 3..];
            after.find('/').map(|i| &after[i..]).unwrap_or("")
        } else {
            lowered.as_str()
        };
        path.split('/')
            .filter(|part| !part.is_empty())
            .rev()
            .find(|part| Self::is_valid_slug(part))
            .map(|part| part.to_string())
    }

    async fn index_map(&self, cancel: &watch::Receiver<bool>) -> HashMap<String, String> {
        let ttl = Duration::from_secs(self.config.scraper_index_ttl_minutes.max(30) as u64 * 60);

        let mut guard = self.index.lock().await;
        if let Some(state) = guard.as_ref() {
            if state.fetched_at.elapsed() <= ttl {
                return state.map.clone();
            }
        }

        let url = self.config.scraper_city_index_url.trim();
        let (Some(link_pattern), Some(tag_pattern)) = (&self.link_pattern, &self.tag_pattern)
        else {
            return guard.as_ref().map(|s| s.map.clone()).unwrap_or_default();
        };
        if url.is_empty() {
            return guard.as_ref().map(|s| s.map.clone()).unwrap_or_default();
        }

        let opts = FetchOptions {
            max_retries: self.config.scraper_max_retries.max(1),
            timeout_seconds: self.config.scraper_timeout_seconds.max(2.0),
            require_allowlist: true,
            ..FetchOptions::default()
        };
        let Ok(body) = self.http.fetch_with_retry(url, opts, cancel).await else {
            return guard.as_ref().map(|s| s.map.clone()).unwrap_or_default();
        };
        let Some(text) = body.as_text().map(|t| t.to_string()) else {
            return guard.as_ref().map(|s| s.map.clone()).unwrap_or_default();
        };

        let mut map: HashMap<String, String> = HashMap::new();
        for captures in link_pattern.captures_iter(&text) {
            let href = captures.get(1).map(|m| m.as_str()).unwrap_or("");
            if href.to_lowercase().contains("/province/") {
                continue;
            }
            let Some(slug) = Self::slug_from_href(href) else {
                continue;
            };
            let label = tag_pattern
                .replace_all(captures.get(2).map(|m| m.as_str()).unwrap_or(""), " ")
                .trim()
                .to_string();
            if label.is_empty()
                || ["天气", "全国天气", "国际天气", "天气网", "首页"].contains(&label.as_str())
            {
                continue;
            }
            map.entry(slug.clone()).or_insert_with(|| slug.clone());
            map.entry(label.clone()).or_insert_with(|| slug.clone());
            let normalized = Self::normalize_name(&label);
            if !normalized.is_empty() {
                map.entry(normalized).or_insert(slug);
            }
        }

        if !map.is_empty() {
            *guard = Some(IndexState {
                fetched_at: Instant::now(),
                map: map.clone(),
            });
            return map;
        }
        guard.as_ref().map(|s| s.map.clone()).unwrap_or_default()
    }

    pub fn clear_index(&self) {
        if let Ok(mut guard) = self.index.try_lock() {
            *guard = None;
        }
    }

    pub async fn resolve(
        &self,
        region_name: &str,
        cancel: &watch::Receiver<bool>,
    ) -> Option<String> {
        let raw = region_name.trim();
        if raw.is_empty() {
            return None;
        }
        let normalized = Self::normalize_name(raw);

        if let Some(slug) = self
            .overrides
            .get(raw)
            .or_else(|| self.overrides.get(&normalized))
        {
            return Some(slug.clone());
        }

        let district = raw.ends_with('区') || raw.ends_with('县') || raw.ends_with('旗');
        let skip_heuristics = self.config.scraper_city_level_only && district;

        let map = self.index_map(cancel).await;
        if let Some(slug) = map.get(raw).or_else(|| map.get(&normalized)) {
            return Some(slug.clone());
        }
        if skip_heuristics {
            return None;
        }

        // Containment fallback for county names that differ from index labels.
        if normalized.chars().count() >= 2 {
            let mut best: Option<(usize, &String)> = None;
            for (key, slug) in &map {
                let key_norm = Self::normalize_name(key);
                if key_norm.is_empty() {
                    continue;
                }
                if normalized.contains(&key_norm) || key_norm.contains(&normalized) {
                    let score = normalized.chars().count().min(key_norm.chars().count());
                    if best.map(|(s, _)| score > s).unwrap_or(true) {
                        best = Some((score, slug));
                    }
                }
            }
            if let Some((_, slug)) = best {
                return Some(slug.clone());
            }
        }

        let lowered = raw.to_lowercase();
        if Self::is_valid_slug(&lowered) {
            return Some(lowered);
        }
        None
    }
}

fn load_overrides(path: &str) -> HashMap<String, String> {
    let path = path.trim();
    if path.is_empty() {
        return HashMap::new();
    }
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    let Ok(parsed) = serde_json::from_str::<HashMap<String, String>>(&raw) else {
        tracing::warn!(path, "slug override file is not a JSON object of strings");
        return HashMap::new();
    };
    let mut cleaned = HashMap::new();
    for (key, value) in parsed {
        let key = key.trim().to_string();
        let value = value.trim().to_lowercase();
        if key.is_empty() || !SlugResolver::is_valid_slug(&value) {
            continue;
        }
        let normalized = SlugResolver::normalize_name(&key);
        cleaned.insert(key, value.clone());
        if !normalized.is_empty() {
            cleaned.entry(normalized).or_insert(value);
        }
    }
    cleaned
}

/// Canonical form used for the per-run collision map: lowercase, no
/// query/fragment, trailing slash.
pub fn canonical_url(url: &str) -> String {
    let mut text = url.trim().to_lowercase();
    if let Some(idx) = text.find(['?', '#']) {
        text.truncate(idx);
    }
    if !text.ends_with('/') {
        text.push('/');
    }
    text
}

/// Percent-encodes a UTF-8 string for use inside a URL path.
pub fn percent_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 3);
    for byte in text.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// One conservative alternate: last path segment with trailing digits
/// stripped, HTTPS, trailing slash.
pub fn fallback_variant(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let idx = trimmed.find("://")?;
    let after = &trimmed[idx + 3..];
    let slash = after.find('/')?;
    let host = &after[..slash];
    let segment = after.rsplit('/').next()?;
    let stripped = segment.trim_end_matches(|c: char| c.is_ascii_digit());
    if stripped.is_empty() || stripped == segment {
        return None;
    }
    Some(format!("https://{host}/{stripped}/"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScraperKind {
    Weather,
    Geology,
}

#[derive(Default)]
struct ParserCooldown {
    fail_count: u32,
    disabled_until: Option<Instant>,
}

pub struct ScraperSource {
    kind: ScraperKind,
    config: Arc<Config>,
    http: Arc<FetchClient>,
    cache: Arc<CacheService>,
    runtime: Arc<ScraperRuntime>,
    slugs: Arc<SlugResolver>,
    parser: Arc<PageParser>,
    cooldown: Mutex<ParserCooldown>,
}

impl ScraperSource {
    pub const WEATHER_NAME: &'static str = "weather_scraper";
    pub const GEOLOGY_NAME: &'static str = "geology_scraper";

    pub fn new(
        kind: ScraperKind,
        config: Arc<Config>,
        http: Arc<FetchClient>,
        cache: Arc<CacheService>,
        runtime: Arc<ScraperRuntime>,
        slugs: Arc<SlugResolver>,
        parser: Arc<PageParser>,
    ) -> Self {
        Self {
            kind,
            config,
            http,
            cache,
            runtime,
            slugs,
            parser,
            cooldown: Mutex::new(ParserCooldown::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            ScraperKind::Weather => Self::WEATHER_NAME,
            ScraperKind::Geology => Self::GEOLOGY_NAME,
        }
    }

    pub fn channel(&self) -> Channel {
        match self.kind {
            ScraperKind::Weather => Channel::Meteorology,
            ScraperKind::Geology => Channel::Geology,
        }
    }

    pub fn reliability(&self) -> f64 {
        match self.kind {
            ScraperKind::Weather => 0.45,
            ScraperKind::Geology => 0.40,
        }
    }

    fn enabled(&self) -> bool {
        match self.kind {
            ScraperKind::Weather => self.config.scraper_enabled,
            ScraperKind::Geology => self.config.geology_scraper_enabled,
        }
    }

    fn template(&self) -> &str {
        match self.kind {
            ScraperKind::Weather => self.config.scraper_url_template.trim(),
            ScraperKind::Geology => self.config.geology_scraper_url_template.trim(),
        }
    }

    fn parser_disabled(&self) -> bool {
        self.cooldown
            .lock()
            .map(|state| {
                state
                    .disabled_until
                    .map(|until| until > Instant::now())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn register_parse_failure(&self) {
        if let Ok(mut state) = self.cooldown.lock() {
            state.fail_count += 1;
            if state.fail_count >= 5 {
                let minutes = self.config.scraper_parser_cooldown_minutes.max(1) as u64;
                state.disabled_until = Some(Instant::now() + Duration::from_secs(minutes * 60));
                state.fail_count = 0;
            }
        }
    }

    fn register_parse_success(&self) {
        if let Ok(mut state) = self.cooldown.lock() {
            state.fail_count = 0;
        }
    }

    pub fn reset_parser_state(&self) {
        if let Ok(mut state) = self.cooldown.lock() {
            *state = ParserCooldown::default();
        }
        self.slugs.clear_index();
    }

    fn stale_ttl(&self) -> Duration {
        let fresh = self.config.scraper_cache_minutes.max(1) as u64 * 60;
        Duration::from_secs((fresh + 300).max(fresh * 3))
    }

    pub async fn fetch(&self, region: &RegionInput, cancel: &watch::Receiver<bool>) -> RawPayload {
        let name = self.name();
        let code = region.code.as_str();

        if !self.enabled() || self.template().is_empty() {
            return RawPayload::err(name, code, SourceError::of(error_kinds::DISABLED));
        }
        if self.parser_disabled() {
            return RawPayload::err(
                name,
                code,
                SourceError::with_message(error_kinds::DISABLED, "parser_cooldown"),
            );
        }

        let cache_key = CacheService::scraper_key(name, code);
        let fresh_ttl = (self.config.scraper_cache_minutes.max(1) * 60) as f64;
        if let Ok(Some(hit)) = self.cache.get_json::<serde_json::Value>(&cache_key).await {
            if hit.age_seconds <= fresh_ttl {
                let mut payload = RawPayload::ok(name, code, hit.value);
                payload.cache_hit = true;
                return payload;
            }
        }

        let mut url = self.template().to_string();
        if url.contains("{tianqi_slug}") {
            match self.slugs.resolve(&region.name, cancel).await {
                Some(slug) => url = url.replace("{tianqi_slug}", &slug),
                None => {
                    return RawPayload::err(
                        name,
                        code,
                        SourceError::with_message(error_kinds::SLUG_NOT_FOUND, region.name.clone()),
                    );
                }
            }
        }
        url = url
            .replace("{region_code}", code)
            .replace("{region_name_url}", &percent_encode(&region.name))
            .replace("{region_name}", &region.name);

        // Domain gate first: a URL that is never allowed to be fetched must
        // not consume the window budget or register URL ownership.
        if FetchClient::is_government_domain(&url) || !self.http.domain_allowed(&url) {
            return RawPayload::err(
                name,
                code,
                SourceError::of(error_kinds::DOMAIN_NOT_ALLOWED).with_url(url),
            );
        }

        if !self.runtime.acquire_budget() {
            return RawPayload::err(
                name,
                code,
                SourceError::with_message(error_kinds::RATE_LIMITED, "window_budget_exceeded"),
            );
        }

        let canonical = canonical_url(&url);
        if let Err(owner) = self.runtime.claim_url(&canonical, code) {
            return RawPayload::err(
                name,
                code,
                SourceError::with_message(
                    error_kinds::URL_COLLISION,
                    format!("url_already_owned_by:{owner}"),
                )
                .with_url(canonical),
            );
        }

        let opts = FetchOptions {
            max_retries: self.config.scraper_max_retries.max(1),
            timeout_seconds: self.config.scraper_timeout_seconds.max(2.0),
            require_allowlist: true,
            ..FetchOptions::default()
        };

        let _permit = self.runtime.acquire_slot().await;
        if self.runtime.pace(cancel).await {
            return RawPayload::err(name, code, SourceError::of(error_kinds::CANCELLED));
        }

        let mut outcome = self.http.fetch_with_retry(&url, opts.clone(), cancel).await;
        let fallback = match &outcome {
            Err(err)
                if err.status_code == Some(403)
                    || err.error == error_kinds::TIMEOUT
                    || err.error == error_kinds::CONNECT_ERROR =>
            {
                fallback_variant(&url)
            }
            _ => None,
        };
        if let Some(alt) = fallback {
            let alt_opts = FetchOptions {
                max_retries: 1,
                ..opts
            };
            outcome = self.http.fetch_with_retry(&alt, alt_opts, cancel).await;
        }

        match outcome {
            Ok(body) => {
                let value = body.into_value();
                let _ = self.cache.put_json(&cache_key, &value, self.stale_ttl()).await;
                RawPayload::ok(name, code, value)
            }
            Err(err) => {
                if let Ok(Some(hit)) = self.cache.get_json::<serde_json::Value>(&cache_key).await {
                    let mut payload = RawPayload::ok(name, code, hit.value);
                    payload.cache_hit = true;
                    payload.stale_cache = true;
                    return payload;
                }
                tracing::warn!(
                    source = name,
                    region = code,
                    error = %err.error,
                    status = ?err.status_code,
                    "scraper fetch failed"
                );
                RawPayload::err(name, code, err)
            }
        }
    }

    pub fn normalize(&self, raw: &RawPayload) -> Result<Observation, SourceError> {
        if let Some(err) = &raw.error {
            return Err(err.clone());
        }

        let parsed = match self.kind {
            ScraperKind::Weather => self.normalize_weather(&raw.body),
            ScraperKind::Geology => self.normalize_geology(&raw.body),
        };

        match parsed {
            Some(mut obs) => {
                self.register_parse_success();
                obs.notes.insert(
                    "source_note".to_string(),
                    serde_json::Value::String("unofficial_scraper".to_string()),
                );
                Ok(obs)
            }
            None => {
                self.register_parse_failure();
                Err(SourceError::of(error_kinds::HTML_PARSE_NO_METRICS))
            }
        }
    }

    fn normalize_weather(&self, body: &serde_json::Value) -> Option<Observation> {
        // JSON endpoints that expose metrics directly.
        let direct = Observation {
            rain_24h: body
                .get("rain_24h")
                .or_else(|| body.get("precipitation_24h"))
                .and_then(value_f64),
            rain_1h: body
                .get("rain_1h")
                .or_else(|| body.get("precipitation_1h"))
                .and_then(value_f64),
            humidity: body.get("humidity").and_then(value_f64),
            wind_speed: body.get("wind_speed").and_then(value_f64),
            data_mode: DataMode::Scraped,
            ..Observation::default()
        };
        if direct.has_any_numeric() {
            return Some(direct);
        }

        let text = body.get("raw_text").and_then(|v| v.as_str())?;
        let obs = self.parser.parse_weather(text);
        obs.has_any_numeric().then_some(obs)
    }

    fn normalize_geology(&self, body: &serde_json::Value) -> Option<Observation> {
        let direct_slope = body
            .get("terrain_slope")
            .or_else(|| body.get("slope"))
            .and_then(value_f64);
        let direct_fault = body
            .get("fault_distance_km")
            .or_else(|| body.get("fault_distance"))
            .and_then(value_f64);
        let direct_lith = body
            .get("lithology")
            .or_else(|| body.get("rock_type"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        if direct_slope.is_some() || direct_fault.is_some() || direct_lith.is_some() {
            return Some(Observation {
                slope: direct_slope,
                fault_distance: direct_fault,
                lithology_risk: direct_lith.as_deref().and_then(lithology_risk_of),
                lithology: direct_lith,
                data_mode: DataMode::Scraped,
                ..Observation::default()
            });
        }

        let text = body.get("raw_text").and_then(|v| v.as_str())?;
        let obs = self.parser.parse_geology(text);
        (obs.has_any_numeric() || obs.lithology.is_some()).then_some(obs)
    }
}
