//! Free-text date parsing for scraped pages.
//!
//! Pages print dates in every format imaginable ("Posted 3 days ago",
//! "24 Nov 2025", "11/24/25 3:04 PM", Unix timestamps). [`parse_date_at`]
//! runs an ordered cascade of format-specific stages and returns the first
//! success; `None` means "no date", which callers store as an absent
//! publication date rather than treating as an error.

use chrono::{DateTime, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use scraper::{ElementRef, Selector};
use std::sync::OnceLock;

use crate::util::collapse_whitespace;

/// Month names recognised in written dates. Abbreviations are matched by
/// prefix (minimum three letters), so "Sept" and "Sep." both resolve.
const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Labels commonly printed before a date on blog index pages.
const PREFIX_PATTERN: &str =
    r"(?i)^(?:(?:last\s+)?updated|published|posted|date|created|on)\b\s*(?:on|at)?\s*[:\-]?\s*";

const TZ_ABBREVIATION_PATTERN: &str =
    r"\b(?:UTC|GMT|EST|EDT|CST|CDT|MST|MDT|PST|PDT|BST|CET|CEST|EET|EEST|IST|JST|KST|AEST|AEDT)\b";

/// Inputs shared by every stage of the cascade.
struct DateInput<'a> {
    /// Whitespace-collapsed original text
    raw: &'a str,
    /// `raw` with label prefixes and timezone abbreviations removed
    cleaned: &'a str,
    now: DateTime<Utc>,
}

type Stage = fn(&DateInput<'_>) -> Option<DateTime<Utc>>;

/// Ordered cascade. First stage to return `Some` wins; no later stage
/// re-validates an earlier stage's result.
const STAGES: &[(&str, Stage)] = &[
    ("native", stage_native),
    ("relative", stage_relative),
    ("written", stage_written),
    ("numeric", stage_numeric),
    ("date_time", stage_date_time),
    ("unix", stage_unix),
    ("fallback", stage_fallback),
];

/// Parses a free-text date against the current clock.
///
/// ```
/// use news_aggregator::feed::parse_date;
///
/// let date = parse_date("November 24, 2025").unwrap();
/// assert_eq!(date.format("%Y-%m-%d").to_string(), "2025-11-24");
/// assert!(parse_date("not a date").is_none());
/// ```
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    parse_date_at(text, Utc::now())
}

/// Parses a free-text date, resolving relative expressions against `now`.
pub fn parse_date_at(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let raw = collapse_whitespace(text).into_owned();
    if raw.is_empty() {
        return None;
    }
    let cleaned = strip_noise(&raw);
    let input = DateInput {
        raw: raw.as_str(),
        cleaned: cleaned.as_str(),
        now,
    };

    STAGES.iter().find_map(|(name, stage)| {
        let parsed = stage(&input);
        if let Some(date) = parsed {
            tracing::trace!(stage = *name, input = %raw, parsed = %date, "Parsed date");
        }
        parsed
    })
}

// ============================================================================
// Stages
// ============================================================================

/// Stage 1: ISO 8601 / RFC 3339 / RFC 2822, on the raw then cleaned text.
fn stage_native(input: &DateInput<'_>) -> Option<DateTime<Utc>> {
    parse_native(input.raw).or_else(|| parse_native(input.cleaned))
}

/// Stage 2: "3 hours ago", "an hour ago", "yesterday", "today", "now".
fn stage_relative(input: &DateInput<'_>) -> Option<DateTime<Utc>> {
    let lower = input.cleaned.to_lowercase();
    let now = input.now;

    match lower.as_str() {
        "now" | "just now" | "today" => return Some(now),
        "yesterday" => return now.checked_sub_signed(Duration::try_days(1)?),
        _ => {}
    }

    let caps = relative_re().captures(&lower)?;
    let amount: u32 = match &caps[1] {
        "a" | "an" | "one" => 1,
        n => n.parse().ok()?,
    };
    let unit = &caps[2];

    // Scraped amounts are untrusted; anything outside chrono's range is no date
    let amount = i64::from(amount);
    let offset = match unit {
        "second" | "sec" => Duration::try_seconds(amount)?,
        "minute" | "min" => Duration::try_minutes(amount)?,
        "hour" | "hr" => Duration::try_hours(amount)?,
        "day" => Duration::try_days(amount)?,
        "week" => Duration::try_weeks(amount)?,
        "month" => return now.checked_sub_months(Months::new(u32::try_from(amount).ok()?)),
        "year" => {
            let months = u32::try_from(amount).ok()?.checked_mul(12)?;
            return now.checked_sub_months(Months::new(months));
        }
        _ => return None,
    };
    now.checked_sub_signed(offset)
}

/// Stage 3: "Month D, YYYY", "D Month YYYY", "D-Month-YYYY".
fn stage_written(input: &DateInput<'_>) -> Option<DateTime<Utc>> {
    parse_written(input.cleaned).map(midnight)
}

/// Stage 4: YYYY-MM-DD, MM/DD/YYYY, DD/MM/YYYY, two-digit years.
fn stage_numeric(input: &DateInput<'_>) -> Option<DateTime<Utc>> {
    parse_numeric(input.cleaned).map(midnight)
}

/// Stage 5: any calendar date followed by a time, with 12-hour conversion.
fn stage_date_time(input: &DateInput<'_>) -> Option<DateTime<Utc>> {
    let caps = date_time_re().captures(input.cleaned)?;
    let date = parse_calendar_date(caps.get(1)?.as_str().trim_end_matches(','))?;

    let mut hour: u32 = caps[2].parse().ok()?;
    let minute: u32 = caps[3].parse().ok()?;
    let second: u32 = caps.get(4).map_or(Some(0), |m| m.as_str().parse().ok())?;

    if let Some(meridiem) = caps.get(5) {
        let is_pm = meridiem.as_str().to_lowercase().starts_with('p');
        if hour == 0 || hour > 12 {
            return None;
        }
        if is_pm && hour < 12 {
            hour += 12;
        } else if !is_pm && hour == 12 {
            hour = 0;
        }
    }

    let time = NaiveTime::from_hms_opt(hour, minute, second)?;
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

/// Stage 6: 10-digit seconds or 13-digit milliseconds since the epoch.
fn stage_unix(input: &DateInput<'_>) -> Option<DateTime<Utc>> {
    let s = input.cleaned;
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match s.len() {
        10 => DateTime::from_timestamp(s.parse().ok()?, 0),
        13 => DateTime::from_timestamp_millis(s.parse().ok()?),
        _ => None,
    }
}

/// Stage 7: a written date embedded anywhere in the text, then lenient
/// formats that the stricter stages do not cover.
fn stage_fallback(input: &DateInput<'_>) -> Option<DateTime<Utc>> {
    if let Some(m) = embedded_written_re().find(input.cleaned) {
        if let Some(date) = parse_written(m.as_str()) {
            return Some(midnight(date));
        }
    }

    const LENIENT_DATETIME: &[&str] = &[
        "%a %b %d %H:%M:%S %Y",
        "%A, %d %B %Y %H:%M",
        "%d %B %Y %H:%M",
        "%B %d %Y %H:%M",
        "%Y%m%dT%H%M%S",
    ];
    const LENIENT_DATE: &[&str] = &["%a %b %d %Y", "%A %d %B %Y", "%Y%m%d"];

    for fmt in LENIENT_DATETIME {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input.cleaned, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    for fmt in LENIENT_DATE {
        if let Ok(d) = NaiveDate::parse_from_str(input.cleaned, fmt) {
            return Some(midnight(d));
        }
    }
    None
}

// ============================================================================
// Format helpers
// ============================================================================

fn parse_native(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }

    const NAIVE_DATETIME: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    for fmt in NAIVE_DATETIME {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(midnight)
}

/// Calendar-date-only parsers, used for the date half of date+time text.
fn parse_calendar_date(s: &str) -> Option<NaiveDate> {
    parse_written(s)
        .or_else(|| parse_numeric(s))
        .or_else(|| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

fn parse_written(s: &str) -> Option<NaiveDate> {
    if let Some(caps) = month_day_year_re().captures(s) {
        let month = month_from_name(&caps[1])?;
        return NaiveDate::from_ymd_opt(caps[3].parse().ok()?, month, caps[2].parse().ok()?);
    }
    if let Some(caps) = day_month_year_re().captures(s) {
        let month = month_from_name(&caps[2])?;
        return NaiveDate::from_ymd_opt(caps[3].parse().ok()?, month, caps[1].parse().ok()?);
    }
    if let Some(caps) = dashed_day_month_year_re().captures(s) {
        let month = month_from_name(&caps[2])?;
        let year = expand_year(&caps[3])?;
        return NaiveDate::from_ymd_opt(year, month, caps[1].parse().ok()?);
    }
    None
}

fn parse_numeric(s: &str) -> Option<NaiveDate> {
    if let Some(caps) = year_first_re().captures(s) {
        return NaiveDate::from_ymd_opt(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        );
    }

    let caps = year_last_re().captures(s)?;
    let first: u32 = caps[1].parse().ok()?;
    let second: u32 = caps[2].parse().ok()?;
    let year = expand_year(&caps[3])?;

    // Ambiguous inputs such as 03/04/2025 resolve as DD/MM. Stored items
    // were parsed with this bias, so it must not change.
    let (day, month) = if first <= 31 && second <= 12 {
        (first, second)
    } else {
        (second, first)
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Two-digit years are assumed to be in the 2000s.
fn expand_year(s: &str) -> Option<i32> {
    let year: i32 = s.parse().ok()?;
    match s.len() {
        2 => Some(2000 + year),
        4 => Some(year),
        _ => None,
    }
}

fn month_from_name(name: &str) -> Option<u32> {
    let lower = name.trim_end_matches('.').to_lowercase();
    if lower.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|full| full.starts_with(&lower))
        .map(|idx| idx as u32 + 1)
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))
}

fn strip_noise(raw: &str) -> String {
    let without_prefix = prefix_re().replace(raw, "");
    let without_tz = tz_re().replace_all(&without_prefix, "");
    collapse_whitespace(&without_tz)
        .trim_matches(|c: char| c == ',' || c == '|' || c == '-' || c.is_whitespace())
        .to_owned()
}

// ============================================================================
// Element-level extraction
// ============================================================================

/// Extracts a date from a scraped article element.
///
/// Tries, in order: the supplied selector's text (then its `datetime`
/// attribute), a descendant `<time datetime>`, descendants whose class
/// contains "date" or "published", and finally a month-name date anywhere
/// in the element's text. First hit wins.
pub fn extract_date_from_element(
    element: ElementRef<'_>,
    selector: Option<&str>,
) -> Option<DateTime<Utc>> {
    extract_date_from_element_at(element, selector, Utc::now())
}

/// [`extract_date_from_element`] with an explicit clock.
pub fn extract_date_from_element_at(
    element: ElementRef<'_>,
    selector: Option<&str>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(sel) = selector.and_then(|s| Selector::parse(s).ok()) {
        if let Some(found) = element.select(&sel).next() {
            let text = found.text().collect::<String>();
            if let Some(date) = parse_date_at(&text, now) {
                return Some(date);
            }
            if let Some(date) = found
                .value()
                .attr("datetime")
                .and_then(|attr| parse_date_at(attr, now))
            {
                return Some(date);
            }
        }
    }

    if let Some(date) = time_datetime_selector()
        .and_then(|sel| element.select(sel).next())
        .and_then(|time| time.value().attr("datetime"))
        .and_then(|attr| parse_date_at(attr, now))
    {
        return Some(date);
    }

    let dated_descendant = element
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| {
            el.value().classes().any(|class| {
                let lower = class.to_lowercase();
                lower.contains("date") || lower.contains("published")
            })
        })
        .find_map(|el| {
            let text = el.text().collect::<String>();
            parse_date_at(&text, now).or_else(|| {
                el.value()
                    .attr("datetime")
                    .and_then(|attr| parse_date_at(attr, now))
            })
        });
    if dated_descendant.is_some() {
        return dated_descendant;
    }

    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = collapse_whitespace(&text).into_owned();
    let found = embedded_written_re()
        .find(&text)
        .and_then(|m| parse_written(m.as_str()))
        .map(midnight);
    found
}

fn time_datetime_selector() -> Option<&'static Selector> {
    static SEL: OnceLock<Option<Selector>> = OnceLock::new();
    SEL.get_or_init(|| Selector::parse("time[datetime]").ok())
        .as_ref()
}

// ============================================================================
// Compiled patterns
// ============================================================================

macro_rules! cached_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("date pattern is valid"))
        }
    };
}

cached_regex!(prefix_re, PREFIX_PATTERN);
cached_regex!(tz_re, TZ_ABBREVIATION_PATTERN);
cached_regex!(
    relative_re,
    r"^(\d+|a|an|one)\s+(second|sec|minute|min|hour|hr|day|week|month|year)s?\s+ago$"
);
cached_regex!(
    month_day_year_re,
    r"(?i)^(?:[a-z]+,?\s+)?([a-z]{3,9}\.?)\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})$"
);
cached_regex!(
    day_month_year_re,
    r"(?i)^(?:[a-z]+,?\s+)?(\d{1,2})(?:st|nd|rd|th)?\s+(?:of\s+)?([a-z]{3,9}\.?),?\s+(\d{4})$"
);
cached_regex!(
    dashed_day_month_year_re,
    r"(?i)^(\d{1,2})-([a-z]{3,9})-(\d{4}|\d{2})$"
);
cached_regex!(year_first_re, r"^(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})$");
cached_regex!(year_last_re, r"^(\d{1,2})[-/.](\d{1,2})[-/.](\d{4}|\d{2})$");
cached_regex!(
    date_time_re,
    r"(?i)^(.+?)[,\s]+(?:at\s+)?(\d{1,2}):(\d{2})(?::(\d{2}))?\s*([ap]\.?m\.?)?$"
);
cached_regex!(
    embedded_written_re,
    r"(?i)\b(?:jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sept?(?:ember)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\.?\s+\d{1,2}(?:st|nd|rd|th)?,?\s+\d{4}\b"
);
