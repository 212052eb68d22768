use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};

/// Weekday codes as stored in the catalog (`time_slots.weekday`).
pub fn weekday_code(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

pub fn parse_weekday_code(code: &str) -> Option<Weekday> {
    match code.trim().to_ascii_lowercase().as_str() {
        "mon" => Some(Weekday::Mon),
        "tue" => Some(Weekday::Tue),
        "wed" => Some(Weekday::Wed),
        "thu" => Some(Weekday::Thu),
        "fri" => Some(Weekday::Fri),
        "sat" => Some(Weekday::Sat),
        "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Chronological index for sorting rows whose weekday is stored as a code.
pub fn weekday_index(code: &str) -> u32 {
    parse_weekday_code(code)
        .map(|w| w.num_days_from_monday())
        .unwrap_or(7)
}

/// Accepts a plain `YYYY-MM-DD` or a full RFC3339 timestamp; either way the
/// result is day-granular (attendance is daily, not per-instant).
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Some(d);
    }
    DateTime::parse_from_rfc3339(t)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).date_naive())
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

pub fn format_hhmm(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

/// `YYYY-MM` -> inclusive first/last day of that calendar month.
pub fn month_range(raw: &str) -> Option<(NaiveDate, NaiveDate)> {
    let (y, m) = raw.trim().split_once('-')?;
    let year = y.parse::<i32>().ok()?;
    let month = m.parse::<u32>().ok()?;
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((first, next.pred_opt()?))
}

pub fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_date_accepts_plain_and_rfc3339() {
        let d = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(parse_date("2024-05-01"), Some(d));
        assert_eq!(parse_date("2024-05-01T09:30:00Z"), Some(d));
        assert_eq!(parse_date("not a date"), None);
    }

    #[test]
    fn month_range_covers_full_month_inclusive() {
        let (first, last) = month_range("2024-02").unwrap();
        assert_eq!(first, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(last, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());

        let (first, last) = month_range("2023-12").unwrap();
        assert_eq!(first, NaiveDate::from_ymd_opt(2023, 12, 1).unwrap());
        assert_eq!(last, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());

        assert!(month_range("2023-13").is_none());
        assert!(month_range("december").is_none());
    }

    #[test]
    fn weekday_codes_round_trip() {
        for w in [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ] {
            assert_eq!(parse_weekday_code(weekday_code(w)), Some(w));
        }
        assert_eq!(parse_weekday_code("MON"), Some(Weekday::Mon));
        assert_eq!(parse_weekday_code("monday"), None);
    }
}
