//! Window and slide-bucket arithmetic, plus the ISO-8601 text forms used in
//! remote key segments.
//!
//! All bucketing is done at millisecond resolution: a window length below one
//! millisecond is not meaningful here.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

/// Start of the fixed window containing `event`:
/// `floor(event / window) * window`.
///
/// Degenerate zero-length windows collapse to the event instant itself.
pub fn window_start(event: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    align(event, window)
}

/// End of the fixed window containing `event`. Buckets are evicted once this
/// instant is no longer in the future.
pub fn window_end(event: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    window_start(event, window) + chrono_duration(window)
}

/// Start of the slide bucket containing `event`. Same alignment rule as
/// [`window_start`], applied to the slide granularity.
pub fn slide_start(event: DateTime<Utc>, slide_size: Duration) -> DateTime<Utc> {
    align(event, slide_size)
}

fn align(event: DateTime<Utc>, length: Duration) -> DateTime<Utc> {
    let length_millis = length.as_millis() as i64;
    if length_millis == 0 {
        return event;
    }
    let aligned = event.timestamp_millis().div_euclid(length_millis) * length_millis;
    DateTime::from_timestamp_millis(aligned).unwrap_or(event)
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::TimeDelta::MAX)
}

/// Formats an instant the way it appears inside a remote key segment, e.g.
/// `2020-01-01T00:00:00Z`. Sub-second precision is kept only when present.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parses a key-segment instant. Accepts anything RFC 3339 accepts.
pub fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text).ok().map(|t| t.with_timezone(&Utc))
}

/// Formats a window length as an ISO-8601 duration (`PT1H`, `PT90S`,
/// `PT0.5S`). Whole hours and minutes use the larger unit so key segments
/// stay compatible with what existing deployments have stored.
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.subsec_nanos();
    let secs = duration.as_secs();
    if nanos == 0 {
        if secs > 0 && secs % 3600 == 0 {
            return format!("PT{}H", secs / 3600);
        }
        if secs > 0 && secs % 60 == 0 {
            return format!("PT{}M", secs / 60);
        }
        return format!("PT{secs}S");
    }
    let mut fraction = format!("{nanos:09}");
    while fraction.ends_with('0') {
        fraction.pop();
    }
    format!("PT{secs}.{fraction}S")
}

/// Parses the ISO-8601 duration subset used in key segments:
/// `P[nD][T[nH][nM][n[.n]S]]`.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let rest = text.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut total = Duration::ZERO;
    for (component, unit_secs) in parse_components(date_part, &[('D', 86_400)])?
        .into_iter()
        .chain(parse_components(time_part, &[('H', 3_600), ('M', 60), ('S', 1)])?)
    {
        total += Duration::try_from_secs_f64(component * unit_secs as f64).ok()?;
    }
    if date_part.is_empty() && time_part.is_empty() {
        return None;
    }
    Some(total)
}

fn parse_components(text: &str, units: &[(char, u64)]) -> Option<Vec<(f64, u64)>> {
    let mut out = Vec::new();
    let mut number = String::new();
    let mut allowed = units;
    for c in text.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        // Units must appear in order, each at most once.
        let position = allowed.iter().position(|(unit, _)| *unit == c)?;
        if number.is_empty() {
            return None;
        }
        out.push((number.parse().ok()?, allowed[position].1));
        number.clear();
        allowed = &allowed[position + 1..];
    }
    if number.is_empty() {
        Some(out)
    } else {
        // Trailing digits with no unit designator.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).expect("valid timestamp")
    }

    #[test]
    fn window_start_floors_to_window_boundary() {
        let window = Duration::from_secs(1);
        assert_eq!(window_start(at(100), window), at(0));
        assert_eq!(window_start(at(400), window), at(0));
        assert_eq!(window_start(at(1200), window), at(1000));
        assert_eq!(window_start(at(1000), window), at(1000));
    }

    #[test]
    fn window_end_is_one_window_past_the_start() {
        let window = Duration::from_secs(60);
        assert_eq!(window_end(at(61_000), window), at(120_000));
    }

    #[test]
    fn pre_epoch_events_floor_downwards() {
        let window = Duration::from_secs(1);
        assert_eq!(window_start(at(-500), window), at(-1000));
    }

    #[test]
    fn zero_length_window_is_the_event_itself() {
        assert_eq!(window_start(at(1234), Duration::ZERO), at(1234));
    }

    #[test]
    fn slide_start_uses_slide_granularity() {
        let slide = Duration::from_millis(250);
        assert_eq!(slide_start(at(1100), slide), at(1000));
        assert_eq!(slide_start(at(1260), slide), at(1250));
    }

    #[test]
    fn instant_format_matches_remote_key_shape() {
        assert_eq!(format_instant(at(1_577_836_800_000)), "2020-01-01T00:00:00Z");
        assert_eq!(parse_instant("2020-01-01T00:00:00Z"), Some(at(1_577_836_800_000)));
        assert_eq!(parse_instant("not a time"), None);
    }

    #[test]
    fn duration_format_prefers_larger_whole_units() {
        assert_eq!(format_duration(Duration::from_secs(3600)), "PT1H");
        assert_eq!(format_duration(Duration::from_secs(120)), "PT2M");
        assert_eq!(format_duration(Duration::from_secs(90)), "PT90S");
        assert_eq!(format_duration(Duration::from_millis(500)), "PT0.5S");
    }

    #[test]
    fn duration_parse_accepts_the_formats_we_emit() {
        for duration in [
            Duration::from_secs(3600),
            Duration::from_secs(120),
            Duration::from_secs(90),
            Duration::from_millis(500),
        ] {
            assert_eq!(parse_duration(&format_duration(duration)), Some(duration));
        }
    }

    #[test]
    fn duration_parse_accepts_combined_components() {
        assert_eq!(parse_duration("PT1H30M"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("P1DT1S"), Some(Duration::from_secs(86_401)));
    }

    #[test]
    fn duration_parse_rejects_garbage() {
        assert_eq!(parse_duration("PT"), None);
        assert_eq!(parse_duration("1H"), None);
        assert_eq!(parse_duration("PT5"), None);
        assert_eq!(parse_duration("PT5X"), None);
        assert_eq!(parse_duration("PT1M1H"), None);
    }
}
