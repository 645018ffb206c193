//! Timespan parsing/formatting for both data models.
//!
//! SCORM 1.2 uses `HHHH:MM:SS.SS`; SCORM 2004 uses ISO-8601 durations such as
//! `PT1H2M5.5S`. Everything is normalised to whole seconds (rounded).

use chrono::{DateTime, NaiveDate, NaiveDateTime};

const SECS_PER_DAY: f64 = 86_400.0;

/// Longest span either data model can carry: `9999:59:59`.
pub const MAX_SPAN_SECONDS: i64 = 9999 * 3600 + 59 * 60 + 59;

pub fn parse_timespan_12(value: &str) -> Option<i64> {
    let mut parts = value.trim().split(':');
    let (h, m, s) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    if !(2..=4).contains(&h.len()) || !h.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if m.len() != 2 || !m.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i64 = h.parse().ok()?;
    let minutes: i64 = m.parse().ok()?;
    let seconds = parse_seconds_12(s)?;
    if minutes > 59 || seconds >= 60.0 {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds.round() as i64)
}

fn parse_seconds_12(s: &str) -> Option<f64> {
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (s, None),
    };
    if whole.len() != 2 || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if let Some(f) = frac {
        if f.is_empty() || f.len() > 2 || !f.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    s.parse().ok()
}

/// CMITime (`HH:MM:SS`, 1.2 interactions) is a clock time, not a span, but shares the grammar.
pub fn is_time_12(value: &str) -> bool {
    let v = value.trim();
    v.split(':').next().map(|h| h.len() == 2).unwrap_or(false)
        && parse_timespan_12(v).map(|s| s < 24 * 3600).unwrap_or(false)
}

pub fn format_timespan_12(secs: i64) -> String {
    let secs = secs.clamp(0, MAX_SPAN_SECONDS);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

pub fn parse_duration_2004(value: &str) -> Option<i64> {
    let rest = value.trim().strip_prefix('P')?;
    let (date, time) = match rest.split_once('T') {
        Some((d, t)) => {
            if t.is_empty() {
                return None;
            }
            (d, Some(t))
        }
        None => (rest, None),
    };
    let mut total = 0.0;
    let mut seen = false;
    for (n, unit) in components(date)? {
        total += n * match unit {
            'Y' => 365.0 * SECS_PER_DAY,
            'M' => 30.0 * SECS_PER_DAY,
            'W' => 7.0 * SECS_PER_DAY,
            'D' => SECS_PER_DAY,
            _ => return None,
        };
        seen = true;
    }
    if let Some(t) = time {
        for (n, unit) in components(t)? {
            total += n * match unit {
                'H' => 3600.0,
                'M' => 60.0,
                'S' => 1.0,
                _ => return None,
            };
            seen = true;
        }
    }
    seen.then(|| total.round() as i64)
}

fn components(s: &str) -> Option<Vec<(f64, char)>> {
    let mut out = Vec::new();
    let mut num = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
        } else {
            if num.is_empty() {
                return None;
            }
            out.push((num.parse().ok()?, c));
            num.clear();
        }
    }
    num.is_empty().then_some(out)
}

pub fn format_duration_2004(secs: i64) -> String {
    let secs = secs.max(0);
    format!("PT{}H{}M{}S", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Loose ISO-8601 timestamp check (`YYYY[-MM[-DD[Thh[:mm[:ss[.s]]]]]][TZD]`).
pub fn is_timestamp_2004(value: &str) -> bool {
    let v = value.trim();
    if DateTime::parse_from_rfc3339(v).is_ok() {
        return true;
    }
    let local = v.trim_end_matches('Z');
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .any(|f| NaiveDateTime::parse_from_str(local, f).is_ok())
        || NaiveDate::parse_from_str(local, "%Y-%m-%d").is_ok()
        || (local.len() == 4 && local.bytes().all(|b| b.is_ascii_digit()))
}
