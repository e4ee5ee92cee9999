//! Parses the `DATE` argument accepted by `show`, `validate`, and
//! `delete`: a prefix of `YYYYMMDDHHMISS` at one of six fixed lengths
//! (year, month, day, hour, minute, second), denoting the half-open
//! range it's the common prefix of. Two tokens make an inclusive range
//! spanning both; one token means `[start, start + 1 unit)`.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use utils::error::{args_error, RmanResult};

/// `(start, end)`, end exclusive.
pub fn parse_token(token: &str) -> RmanResult<(DateTime<Utc>, DateTime<Utc>)> {
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(args_error(format!("'{token}' is not a valid date: expected only digits")));
    }
    let digits = token.len();
    let field = |start: usize, len: usize, default: u32| -> RmanResult<u32> {
        if token.len() < start + len {
            return Ok(default);
        }
        token[start..start + len]
            .parse()
            .map_err(|_| args_error(format!("'{token}' is not a valid date")))
    };

    let year: i32 = field(0, 4, 0)? as i32;
    if digits < 4 {
        return Err(args_error(format!("'{token}' is too short to be a date; need at least a 4-digit year")));
    }
    let month = if digits >= 6 { field(4, 2, 1)? } else { 1 };
    let day = if digits >= 8 { field(6, 2, 1)? } else { 1 };
    let hour = if digits >= 10 { field(8, 2, 0)? } else { 0 };
    let minute = if digits >= 12 { field(10, 2, 0)? } else { 0 };
    let second = if digits >= 14 { field(12, 2, 0)? } else { 0 };
    if ![4, 6, 8, 10, 12, 14].contains(&digits) {
        return Err(args_error(format!(
            "'{token}' must be exactly 4, 6, 8, 10, 12, or 14 digits (YYYY[MM[DD[HH[MI[SS]]]]])"
        )));
    }

    let start = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .ok_or_else(|| args_error(format!("'{token}' is not a valid date")))?;
    let start = Utc.from_utc_datetime(&start);

    let end = match digits {
        4 => Utc.from_utc_datetime(&NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()),
        6 => {
            let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
            Utc.from_utc_datetime(&NaiveDate::from_ymd_opt(ny, nm, 1).unwrap().and_hms_opt(0, 0, 0).unwrap())
        }
        8 => start + chrono::Duration::days(1),
        10 => start + chrono::Duration::hours(1),
        12 => start + chrono::Duration::minutes(1),
        14 => start + chrono::Duration::seconds(1),
        _ => unreachable!(),
    };

    Ok((start, end))
}

/// One or two `DATE` tokens: one means its own implicit range, two mean
/// the inclusive span from the first token's start to the second
/// token's end.
pub fn parse_range(tokens: &[String]) -> RmanResult<(DateTime<Utc>, DateTime<Utc>)> {
    match tokens {
        [single] => parse_token(single),
        [first, second] => {
            let (start, _) = parse_token(first)?;
            let (_, end) = parse_token(second)?;
            if end <= start {
                return Err(args_error("date range end must be after its start"));
            }
            Ok((start, end))
        }
        _ => Err(args_error("expected one or two DATE arguments")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn year_only_spans_the_whole_year() {
        let (start, end) = parse_token("2026").unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn month_rolls_over_into_next_year() {
        let (start, end) = parse_token("202612").unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn full_precision_spans_one_second() {
        let (start, end) = parse_token("20260729143000").unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 7, 29, 14, 30, 0).unwrap());
        assert_eq!(end - start, chrono::Duration::seconds(1));
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(parse_token("202").is_err());
        assert!(parse_token("20260729143").is_err());
    }

    #[test]
    fn two_tokens_span_from_first_start_to_second_end() {
        let (start, end) = parse_range(&["2026".to_string(), "2026".to_string()]).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }
}
