//! Record normalization + profile page extraction.
//!
//! Everything here is pure with respect to the page text and a reference
//! instant, except [`PageFetcher`], which is the single HTTP boundary.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, FixedOffset, TimeDelta};
use profsync_core::{FieldKey, ProfileRecord, DATETIME_FORMAT, DATE_FORMAT};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "profsync-adapters";

/// Raw field map handed over by extraction, keyed by column header.
pub type RawProfile = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("selector parse failed: {0}")]
    Selector(String),
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unknown field: {0}")]
    UnknownField(String),
}

/// Values the site renders where it has nothing to say; all map to blank.
const BLANK_SENTINELS: [&str; 10] = [
    "no city",
    "not set",
    "[no posts]",
    "n/a",
    "[no post url]",
    "[error]",
    "no set",
    "none",
    "null",
    "no age",
];

/// Collapses whitespace and control characters (including `\u{a0}`) and trims.
pub fn clean_text(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_control() || c.is_whitespace() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// [`clean_text`] plus sentinel-phrase removal.
pub fn clean_value(input: &str) -> String {
    let cleaned = clean_text(input);
    let lower = cleaned.to_lowercase();
    if BLANK_SENTINELS.iter().any(|sentinel| *sentinel == lower) {
        String::new()
    } else {
        cleaned
    }
}

/// Resolves relative time expressions ("3 days ago", "a week ago",
/// "yesterday", "just now") to an absolute calendar date at the reference
/// instant. Unrecognized text passes through unchanged.
pub fn resolve_relative_date(input: &str, now: DateTime<FixedOffset>) -> String {
    let cleaned = clean_text(input);
    if cleaned.is_empty() {
        return cleaned;
    }
    let lower = cleaned.to_lowercase();
    if lower == "just now" || lower == "now" {
        return now.format(DATE_FORMAT).to_string();
    }
    if lower == "yesterday" {
        return (now - TimeDelta::days(1)).format(DATE_FORMAT).to_string();
    }
    match parse_relative_delta(&lower) {
        Some(delta) => (now - delta).format(DATE_FORMAT).to_string(),
        None => cleaned,
    }
}

fn parse_relative_delta(text: &str) -> Option<TimeDelta> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() != 3 || tokens[2] != "ago" {
        return None;
    }
    let amount: i64 = match tokens[0] {
        "a" | "an" => 1,
        n => n.parse().ok()?,
    };
    match tokens[1] {
        "sec" | "secs" | "second" | "seconds" => TimeDelta::try_seconds(amount),
        "min" | "mins" | "minute" | "minutes" => TimeDelta::try_minutes(amount),
        "hr" | "hrs" | "hour" | "hours" => TimeDelta::try_hours(amount),
        "day" | "days" => TimeDelta::try_days(amount),
        "wk" | "wks" | "week" | "weeks" => TimeDelta::try_weeks(amount),
        "mon" | "mons" | "month" | "months" => TimeDelta::try_days(amount.checked_mul(30)?),
        "yr" | "yrs" | "year" | "years" => TimeDelta::try_days(amount.checked_mul(365)?),
        _ => None,
    }
}

/// Builds a [`ProfileRecord`] from a raw field map: every declared field
/// present (blank when absent), values cleaned, date-bearing fields resolved
/// against the reference instant. Unknown keys are rejected here, at the
/// normalization boundary.
pub fn normalize_record(
    raw: &RawProfile,
    now: DateTime<FixedOffset>,
) -> Result<ProfileRecord, NormalizeError> {
    let mut record = ProfileRecord::new();
    for (name, value) in raw {
        let key = FieldKey::from_header(name)
            .ok_or_else(|| NormalizeError::UnknownField(name.clone()))?;
        let cleaned = clean_value(value);
        let resolved = match key {
            FieldKey::Joined | FieldKey::LastPostTime => resolve_relative_date(&cleaned, now),
            _ => cleaned,
        };
        record.set(key, resolved);
    }
    Ok(record)
}

/// URL construction for the scraped site.
#[derive(Debug, Clone)]
pub struct SiteUrls {
    base: String,
}

impl SiteUrls {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn profile(&self, handle: &str) -> String {
        format!("{}/users/{}/", self.base, handle)
    }

    pub fn public_posts(&self, handle: &str) -> String {
        format!("{}/profile/public/{}", self.base, handle)
    }

    pub fn online(&self) -> String {
        format!("{}/online_kon/", self.base)
    }

    pub fn absolute(&self, href: &str) -> String {
        let href = href.trim();
        if href.starts_with('/') {
            format!("{}{}", self.base, href)
        } else if !href.starts_with("http") {
            format!("{}/{}", self.base, href)
        } else {
            href.to_string()
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn selector_matches(document: &Html, selector: &str) -> Result<bool, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(document.select(&sel).next().is_some())
}

/// First run of ASCII digits in the text, kept as a string.
fn first_integer(text: &str) -> Option<String> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Reads the `<span>` following a `<b>` label such as `City:`.
fn labeled_value(document: &Html, label: &str) -> Result<Option<String>, ExtractError> {
    let b_sel = parse_selector("b")?;
    for bold in document.select(&b_sel) {
        let text = bold.text().collect::<String>();
        if !text.contains(label) {
            continue;
        }
        for sibling in bold.next_siblings() {
            if let Some(element) = ElementRef::wrap(sibling) {
                if element.value().name() == "span" {
                    return Ok(text_or_none(element.text().collect::<String>()));
                }
            }
        }
    }
    Ok(None)
}

/// Profile pages always carry the handle heading; anything without it is a
/// login redirect, an error page, or a deleted account.
pub fn is_profile_page(html: &str) -> bool {
    let document = Html::parse_document(html);
    matches!(selector_matches(&document, "h1.cxl.clb.lsp"), Ok(true))
}

/// Extracts the raw field map from a profile page. Optional fields that are
/// absent simply stay out of the map; absence is not an error.
pub fn extract_profile(
    html: &str,
    handle: &str,
    urls: &SiteUrls,
    now: DateTime<FixedOffset>,
) -> Result<RawProfile, ExtractError> {
    let document = Html::parse_document(html);
    let mut raw = RawProfile::new();
    raw.insert(FieldKey::Handle.header().to_string(), handle.to_string());
    raw.insert(
        FieldKey::CapturedAt.header().to_string(),
        now.format(DATETIME_FORMAT).to_string(),
    );
    raw.insert(FieldKey::ProfileLink.header().to_string(), urls.profile(handle));

    let lower = html.to_lowercase();
    let status = if lower.contains("account suspended") {
        "Suspended"
    } else if html.contains("background:tomato") || selector_matches(&document, "div[style*='tomato']")? {
        "Unverified"
    } else {
        "Verified"
    };
    raw.insert(FieldKey::Status.header().to_string(), status.to_string());

    let friend = if html.contains("action=\"/follow/remove/\"") || html.contains("unfollow.svg") {
        "Yes"
    } else if html.contains("follow.svg") && !html.contains("unfollow") {
        "No"
    } else {
        ""
    };
    raw.insert(FieldKey::Friend.header().to_string(), friend.to_string());

    for selector in ["span.cl.sp.lsp.nos", "span.cl", ".ow span.nos"] {
        if let Some(intro) = select_first_text(&document, selector)? {
            raw.insert(FieldKey::Intro.header().to_string(), clean_text(&intro));
            break;
        }
    }

    let labeled = [
        ("City:", FieldKey::City),
        ("Gender:", FieldKey::Gender),
        ("Married:", FieldKey::Married),
        ("Age:", FieldKey::Age),
        ("Joined:", FieldKey::Joined),
    ];
    for (label, key) in labeled {
        let Some(value) = labeled_value(&document, label)? else {
            continue;
        };
        let presented = match key {
            FieldKey::Gender => match value.to_lowercase().as_str() {
                "female" => "💃".to_string(),
                "male" => "🕺".to_string(),
                _ => value,
            },
            FieldKey::Married => match value.to_lowercase().as_str() {
                "yes" | "married" => "💍".to_string(),
                "no" | "single" | "unmarried" => "❎".to_string(),
                _ => value,
            },
            _ => value,
        };
        raw.insert(key.header().to_string(), presented);
    }

    for selector in ["span.cl.sp.clb", ".cl.sp.clb"] {
        if let Some(count) = select_first_text(&document, selector)?
            .as_deref()
            .and_then(first_integer)
        {
            raw.insert(FieldKey::Followers.header().to_string(), count);
            break;
        }
    }

    for selector in [
        "a[href*='/profile/public/'] button div:first-child",
        "a[href*='/profile/public/'] button div",
    ] {
        if let Some(count) = select_first_text(&document, selector)?
            .as_deref()
            .and_then(first_integer)
        {
            raw.insert(FieldKey::Posts.header().to_string(), count);
            break;
        }
    }

    for selector in [
        "img[src*='avatar-imgs']",
        "img[src*='avatar']",
        "div[style*='whitesmoke'] img[src*='cloudfront.net']",
    ] {
        if let Some(src) = select_first_attr(&document, selector, "src")? {
            if src.contains("avatar") || src.contains("cloudfront.net") {
                raw.insert(
                    FieldKey::Image.header().to_string(),
                    src.replace("/thumbnail/", "/"),
                );
                break;
            }
        }
    }

    Ok(raw)
}

/// Most recent post: its canonical URL and the raw timestamp text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentPost {
    pub url: String,
    pub taken_at: String,
}

fn digits_after(href: &str, marker: &str) -> Option<String> {
    let rest = href.split(marker).nth(1)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Canonical URL for a text-comment permalink.
pub fn text_comment_url(urls: &SiteUrls, href: &str) -> String {
    match digits_after(href, "/comments/text/") {
        Some(id) => urls
            .absolute(&format!("/comments/text/{id}/"))
            .trim_end_matches('/')
            .to_string(),
        None => urls.absolute(href),
    }
}

/// Image-comment permalinks resolve to the content gallery page.
pub fn image_comment_url(urls: &SiteUrls, href: &str) -> String {
    match digits_after(href, "/comments/image/") {
        Some(id) => urls.absolute(&format!("/content/{id}/g/")),
        None => urls.absolute(href),
    }
}

pub fn extract_recent_post(
    html: &str,
    urls: &SiteUrls,
) -> Result<Option<RecentPost>, ExtractError> {
    let document = Html::parse_document(html);
    let article_sel = parse_selector("article.mbl")?;
    let Some(article) = document.select(&article_sel).next() else {
        return Ok(None);
    };

    let mut url = String::new();
    let link_rules: [(&str, fn(&SiteUrls, &str) -> String); 3] = [
        ("a[href*='/content/']", |urls, href| urls.absolute(href)),
        ("a[href*='/comments/text/']", text_comment_url),
        ("a[href*='/comments/image/']", image_comment_url),
    ];
    for (selector, format_url) in link_rules {
        let sel = parse_selector(selector)?;
        if let Some(href) = article
            .select(&sel)
            .next()
            .and_then(|n| n.value().attr("href"))
        {
            let formatted = format_url(urls, href);
            if !formatted.is_empty() {
                url = formatted;
                break;
            }
        }
    }

    let mut taken_at = String::new();
    for selector in [
        "span[itemprop='datePublished']",
        "time[itemprop='datePublished']",
        "span.cxs.cgy",
        "time",
    ] {
        let sel = parse_selector(selector)?;
        if let Some(text) = article
            .select(&sel)
            .next()
            .and_then(|n| text_or_none(n.text().collect::<String>()))
        {
            taken_at = text;
            break;
        }
    }

    Ok(Some(RecentPost { url, taken_at }))
}

/// Handles listed on the online-users page, de-duplicated in page order.
pub fn extract_online_handles(html: &str) -> Result<Vec<String>, ExtractError> {
    let document = Html::parse_document(html);
    let mut handles: Vec<String> = Vec::new();

    let li_sel = parse_selector("li.mbl.cl.sp")?;
    let b_sel = parse_selector("b")?;
    for item in document.select(&li_sel) {
        if let Some(bold) = item.select(&b_sel).next() {
            let nick = clean_text(&bold.text().collect::<String>());
            if plausible_handle(&nick) && !handles.contains(&nick) {
                handles.push(nick);
            }
        }
    }

    // Fallback: pull handles straight from profile links.
    if handles.is_empty() {
        let link_sel = parse_selector("a[href*='/users/']")?;
        for link in document.select(&link_sel) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let Some(rest) = href.split("/users/").nth(1) else {
                continue;
            };
            let nick = rest.trim_end_matches('/').to_string();
            if plausible_handle(&nick) && !handles.contains(&nick) {
                handles.push(nick);
            }
        }
    }

    Ok(handles)
}

pub fn plausible_handle(nick: &str) -> bool {
    nick.chars().count() >= 3
        && !nick.chars().all(|c| c.is_ascii_digit())
        && nick.chars().any(|c| c.is_alphabetic())
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub site_base_url: String,
    pub session_cookie: String,
    pub user_agent: String,
    pub timeout: Duration,
}

/// HTTP page fetcher carrying an already-valid session cookie. Timeouts and
/// non-success statuses read as "page absent" — a skippable per-record
/// failure, never fatal.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    http: reqwest::Client,
    urls: SiteUrls,
    session_cookie: String,
}

impl PageFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building page fetcher client")?;
        Ok(Self {
            http,
            urls: SiteUrls::new(config.site_base_url),
            session_cookie: config.session_cookie,
        })
    }

    pub fn urls(&self) -> &SiteUrls {
        &self.urls
    }

    pub async fn fetch_html(&self, url: &str) -> anyhow::Result<Option<String>> {
        let mut request = self.http.get(url);
        if !self.session_cookie.is_empty() {
            request = request.header(reqwest::header::COOKIE, self.session_cookie.clone());
        }
        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                Ok(Some(resp.text().await.context("reading page body")?))
            }
            Ok(resp) => {
                warn!(url, status = resp.status().as_u16(), "page fetch returned non-success");
                Ok(None)
            }
            Err(err) if err.is_timeout() || err.is_connect() => {
                warn!(url, error = %err, "page fetch timed out");
                Ok(None)
            }
            Err(err) => Err(err).context("page fetch failed"),
        }
    }

    pub async fn fetch_online_page(&self) -> anyhow::Result<Option<String>> {
        self.fetch_html(&self.urls.online()).await
    }
}

/// Fetches, extracts, and normalizes one subject's record. `Ok(None)` means
/// the profile page was unavailable; the recent-post page is best-effort.
pub async fn collect_profile(
    fetcher: &PageFetcher,
    handle: &str,
    now: DateTime<FixedOffset>,
) -> anyhow::Result<Option<ProfileRecord>> {
    let Some(html) = fetcher.fetch_html(&fetcher.urls().profile(handle)).await? else {
        return Ok(None);
    };
    if !is_profile_page(&html) {
        warn!(handle, "fetched page is not a profile");
        return Ok(None);
    }

    let mut raw = extract_profile(&html, handle, fetcher.urls(), now)?;

    let posts = raw
        .get(FieldKey::Posts.header())
        .cloned()
        .unwrap_or_default();
    if !posts.is_empty() && posts != "0" {
        if let Some(post_html) = fetcher
            .fetch_html(&fetcher.urls().public_posts(handle))
            .await?
        {
            if let Some(post) = extract_recent_post(&post_html, fetcher.urls())? {
                raw.insert(FieldKey::LastPost.header().to_string(), post.url);
                raw.insert(FieldKey::LastPostTime.header().to_string(), post.taken_at);
            }
        }
    }

    Ok(Some(normalize_record(&raw, now)?))
}
