//! Schedule expression parsing and evaluation.
//!
//! The schedule language is an 8-field cron-like grammar in positional order
//! `second minute hour day_of_week week day month year`. Trailing positions
//! may be omitted and match every value in their range. The `?` wildcard is
//! permitted in the first three positions and is resolved to a concrete
//! random value before a schedule is stored; [`Schedule::parse`] therefore
//! only ever sees fully resolved expressions.
//!
//! The `day` field additionally accepts occurrence forms (`2nd_mon`,
//! `last_fri`, `last`). Underscores stand in for spaces so the expression
//! still splits into one token per field; they are replaced at parse time
//! only and the stored string keeps the underscore form.

use std::collections::BTreeSet;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use rand::Rng;

/// Positional field names, matching the grammar order.
pub const FIELD_NAMES: [&str; 8] = [
    "second",
    "minute",
    "hour",
    "day_of_week",
    "week",
    "day",
    "month",
    "year",
];

const WILDCARD: &str = "?";

/// Inclusive ranges for the `?`-eligible time fields.
const WILDCARD_RANGES: [(u32, u32); 3] = [(0, 59), (0, 59), (0, 23)];

/// How many years past a specified year bound the evaluator will search
/// before concluding a schedule has no next firing instant.
const SEARCH_YEARS: i32 = 4;

const WEEKDAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

// ── Field value sets ─────────────────────────────────────────────────

/// The values a single numeric field matches.
#[derive(Debug, Clone, PartialEq)]
enum ValueSet {
    /// `*` — every value in the field's range.
    Any,
    Values(BTreeSet<u32>),
}

impl ValueSet {
    fn contains(&self, v: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Values(set) => set.contains(&v),
        }
    }

    /// Members of the set within `[floor, max]`, ascending.
    fn members_from(&self, floor: u32, max: u32) -> Vec<u32> {
        match self {
            Self::Any => (floor..=max).collect(),
            Self::Values(set) => set.range(floor..=max).copied().collect(),
        }
    }

    /// Smallest member at or above `floor`, up to `max`.
    fn first_at_or_above(&self, floor: u32, max: u32) -> Option<u32> {
        match self {
            Self::Any => (floor <= max).then_some(floor),
            Self::Values(set) => set.range(floor..=max).next().copied(),
        }
    }
}

/// Occurrence-based day-of-month rules (`2nd mon`, `last fri`, `last`).
#[derive(Debug, Clone, PartialEq)]
enum DayRule {
    /// `Nth <weekday>` — the Nth occurrence of a weekday in the month.
    Nth(u32, u32),
    /// `last <weekday>` — the final occurrence of a weekday in the month.
    LastWeekday(u32),
    /// `last` — the final day of the month.
    LastDay,
}

/// The `day` field: plain day numbers and/or occurrence rules.
#[derive(Debug, Clone, PartialEq)]
struct DayField {
    numeric: Option<ValueSet>,
    rules: Vec<DayRule>,
}

impl DayField {
    fn any() -> Self {
        Self {
            numeric: Some(ValueSet::Any),
            rules: Vec::new(),
        }
    }

    fn matches(&self, date: NaiveDate) -> bool {
        if let Some(ref set) = self.numeric {
            if set.contains(date.day()) {
                return true;
            }
        }
        let last = days_in_month(date.year(), date.month());
        let weekday = date.weekday().num_days_from_monday();
        self.rules.iter().any(|rule| match rule {
            DayRule::Nth(n, wd) => weekday == *wd && (date.day() - 1) / 7 + 1 == *n,
            DayRule::LastWeekday(wd) => weekday == *wd && date.day() + 7 > last,
            DayRule::LastDay => date.day() == last,
        })
    }
}

// ── Schedule ─────────────────────────────────────────────────────────

/// A fully parsed 8-field schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    second: ValueSet,
    minute: ValueSet,
    hour: ValueSet,
    day_of_week: ValueSet,
    week: ValueSet,
    day: DayField,
    month: ValueSet,
    year: ValueSet,
}

impl Schedule {
    /// Parse a schedule expression, validating every field against the
    /// current year. Returns every offending token with a reason.
    pub fn parse(expr: &str) -> Result<Self, Vec<String>> {
        Self::parse_with_year(expr, Utc::now().year())
    }

    /// Parse against an explicit "current year" lower bound for the `year`
    /// field. Split out for deterministic tests.
    pub fn parse_with_year(expr: &str, current_year: i32) -> Result<Self, Vec<String>> {
        let tokens: Vec<&str> = expr.split_whitespace().collect();
        let mut errors = Vec::new();
        if tokens.is_empty() {
            return Err(vec!["expression is empty".to_string()]);
        }
        if tokens.len() > FIELD_NAMES.len() {
            return Err(vec![format!(
                "expression has {} fields, at most {} are allowed",
                tokens.len(),
                FIELD_NAMES.len()
            )]);
        }
        for (position, token) in tokens.iter().enumerate() {
            if *token == WILDCARD {
                errors.push(format!(
                    "{}: unresolved wildcard '?'",
                    FIELD_NAMES[position]
                ));
            }
        }

        let second = parse_position(&tokens, 0, 0, 59, false, &mut errors);
        let minute = parse_position(&tokens, 1, 0, 59, false, &mut errors);
        let hour = parse_position(&tokens, 2, 0, 23, false, &mut errors);
        let day_of_week = parse_position(&tokens, 3, 0, 6, true, &mut errors);
        let week = parse_position(&tokens, 4, 1, 53, false, &mut errors);
        let day = match tokens.get(5) {
            None => DayField::any(),
            Some(token) => match parse_day_field(token) {
                Ok(day) => day,
                Err(reason) => {
                    errors.push(format!("day: {}", reason));
                    DayField::any()
                }
            },
        };
        let month = parse_position(&tokens, 6, 1, 12, false, &mut errors);
        let year = parse_position(
            &tokens,
            7,
            current_year as u32,
            current_year as u32 + 100,
            false,
            &mut errors,
        );

        if errors.is_empty() {
            Ok(Self {
                second,
                minute,
                hour,
                day_of_week,
                week,
                day,
                month,
                year,
            })
        } else {
            Err(errors)
        }
    }

    /// Compute the next firing instant strictly after `after`, interpreting
    /// the schedule in `tz`. Returns `None` when the schedule has no further
    /// instants within the search horizon (e.g. an exhausted `year` field).
    ///
    /// Local times that fall in a DST gap roll forward to the next valid
    /// instant; ambiguous local times resolve to the earlier offset.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let start = after.with_timezone(&tz) + Duration::seconds(1);
        let horizon = self.horizon_year(start.year());
        let mut date = start.date_naive();
        let mut time_floor = Some(start.time());

        while date.year() <= horizon {
            if self.date_matches(date) {
                let mut floor = time_floor;
                while let Some(time) = self.next_time(floor) {
                    match tz.from_local_datetime(&date.and_time(time)) {
                        LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                        LocalResult::Ambiguous(earlier, _) => {
                            return Some(earlier.with_timezone(&Utc))
                        }
                        LocalResult::None => {
                            // DST gap — advance one second and keep scanning.
                            let next = time.num_seconds_from_midnight() + 1;
                            if next >= 86_400 {
                                break;
                            }
                            floor = NaiveTime::from_num_seconds_from_midnight_opt(next, 0);
                        }
                    }
                }
            }
            date = date.succ_opt()?;
            time_floor = None;
        }
        None
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        self.year.contains(date.year() as u32)
            && self.month.contains(date.month())
            && self.week.contains(date.iso_week().week())
            && self
                .day_of_week
                .contains(date.weekday().num_days_from_monday())
            && self.day.matches(date)
    }

    /// Smallest matching time of day at or after `floor` (midnight if `None`).
    fn next_time(&self, floor: Option<NaiveTime>) -> Option<NaiveTime> {
        let (fh, fm, fs) = match floor {
            Some(t) => (t.hour(), t.minute(), t.second()),
            None => (0, 0, 0),
        };
        for h in self.hour.members_from(fh, 23) {
            let m_floor = if h == fh { fm } else { 0 };
            for m in self.minute.members_from(m_floor, 59) {
                let s_floor = if h == fh && m == fm { fs } else { 0 };
                if let Some(s) = self.second.first_at_or_above(s_floor, 59) {
                    return NaiveTime::from_hms_opt(h, m, s);
                }
            }
        }
        None
    }

    fn horizon_year(&self, start_year: i32) -> i32 {
        match &self.year {
            ValueSet::Any => start_year + SEARCH_YEARS,
            ValueSet::Values(set) => set
                .iter()
                .next_back()
                .map(|y| *y as i32)
                .unwrap_or(start_year),
        }
    }
}

// ── Wildcard resolution ──────────────────────────────────────────────

/// Replace every `?` wildcard with a uniformly random in-range value.
///
/// Only the `second`, `minute`, and `hour` positions may carry a wildcard;
/// a `?` anywhere else is an error. The resolved string is what gets stored,
/// so resolution happens exactly once per write.
pub fn resolve_wildcards(expr: &str) -> Result<String, Vec<String>> {
    resolve_wildcards_with(expr, &mut rand::thread_rng())
}

fn resolve_wildcards_with<R: Rng>(expr: &str, rng: &mut R) -> Result<String, Vec<String>> {
    let mut errors = Vec::new();
    let mut tokens: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    for (position, token) in tokens.iter_mut().enumerate() {
        if token != WILDCARD {
            continue;
        }
        match WILDCARD_RANGES.get(position) {
            Some(&(min, max)) => *token = rng.gen_range(min..=max).to_string(),
            None => errors.push(format!(
                "{}: the '?' wildcard is only allowed in the second, minute, and hour positions",
                FIELD_NAMES.get(position).unwrap_or(&"field")
            )),
        }
    }
    if errors.is_empty() {
        Ok(tokens.join(" "))
    } else {
        Err(errors)
    }
}

// ── Token parsers ────────────────────────────────────────────────────

/// Parse the token at `position`, recording any problem under the field's
/// name. An omitted trailing position matches every value.
fn parse_position(
    tokens: &[&str],
    position: usize,
    min: u32,
    max: u32,
    names: bool,
    errors: &mut Vec<String>,
) -> ValueSet {
    match tokens.get(position) {
        None => ValueSet::Any,
        Some(token) => match parse_value_set(token, min, max, names) {
            Ok(set) => set,
            Err(reason) => {
                errors.push(format!("{}: {}", FIELD_NAMES[position], reason));
                ValueSet::Any
            }
        },
    }
}

fn parse_value_set(token: &str, min: u32, max: u32, names: bool) -> Result<ValueSet, String> {
    if token == "*" {
        return Ok(ValueSet::Any);
    }
    let mut values = BTreeSet::new();
    for item in token.split(',') {
        parse_item(item, min, max, names, &mut values)?;
    }
    Ok(ValueSet::Values(values))
}

fn parse_item(
    item: &str,
    min: u32,
    max: u32,
    names: bool,
    values: &mut BTreeSet<u32>,
) -> Result<(), String> {
    if item.is_empty() {
        return Err("empty list item".to_string());
    }
    if item == "*" {
        values.extend(min..=max);
        return Ok(());
    }
    if let Some(step) = item.strip_prefix("*/") {
        let step: u32 = step
            .parse()
            .map_err(|_| format!("invalid interval '{}'", item))?;
        if step == 0 {
            return Err(format!("interval in '{}' must be at least 1", item));
        }
        values.extend((min..=max).step_by(step as usize));
        return Ok(());
    }
    if let Some((lo, hi)) = item.split_once('-') {
        let lo = parse_single(lo, min, max, names)?;
        let hi = parse_single(hi, min, max, names)?;
        if lo > hi {
            return Err(format!("range '{}' is inverted", item));
        }
        values.extend(lo..=hi);
        return Ok(());
    }
    values.insert(parse_single(item, min, max, names)?);
    Ok(())
}

fn parse_single(raw: &str, min: u32, max: u32, names: bool) -> Result<u32, String> {
    if names {
        if let Some(wd) = weekday_number(raw) {
            return Ok(wd);
        }
    }
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("invalid value '{}'", raw))?;
    if value < min || value > max {
        return Err(format!("value {} out of range {}-{}", value, min, max));
    }
    Ok(value)
}

/// Parse the `day` field: plain numeric items plus occurrence rules.
/// Underscores are treated as spaces so single-token forms like `2nd_mon`
/// and their already-normalized `2nd mon` equivalents both parse.
fn parse_day_field(token: &str) -> Result<DayField, String> {
    if token == "*" {
        return Ok(DayField::any());
    }
    let mut numeric = BTreeSet::new();
    let mut saw_numeric = false;
    let mut saw_any = false;
    let mut rules = Vec::new();
    for item in token.split(',') {
        let item = item.replace('_', " ");
        if item == "*" {
            saw_any = true;
            continue;
        }
        if let Some(rule) = parse_day_rule(&item)? {
            rules.push(rule);
            continue;
        }
        parse_item(&item, 1, 31, false, &mut numeric)?;
        saw_numeric = true;
    }
    let numeric = if saw_any {
        Some(ValueSet::Any)
    } else if saw_numeric {
        Some(ValueSet::Values(numeric))
    } else {
        None
    };
    Ok(DayField { numeric, rules })
}

/// Recognize `last`, `last <weekday>`, and `Nth <weekday>` items.
/// Returns `Ok(None)` when the item is not an occurrence form.
fn parse_day_rule(item: &str) -> Result<Option<DayRule>, String> {
    if item == "last" {
        return Ok(Some(DayRule::LastDay));
    }
    let Some((head, tail)) = item.split_once(' ') else {
        return Ok(None);
    };
    let weekday = weekday_number(tail)
        .ok_or_else(|| format!("unknown weekday '{}' in '{}'", tail, item))?;
    if head == "last" {
        return Ok(Some(DayRule::LastWeekday(weekday)));
    }
    let ordinal = head
        .strip_suffix("st")
        .or_else(|| head.strip_suffix("nd"))
        .or_else(|| head.strip_suffix("rd"))
        .or_else(|| head.strip_suffix("th"))
        .ok_or_else(|| format!("invalid day item '{}'", item))?;
    let n: u32 = ordinal
        .parse()
        .map_err(|_| format!("invalid ordinal in '{}'", item))?;
    if !(1..=5).contains(&n) {
        return Err(format!("ordinal in '{}' must be between 1st and 5th", item));
    }
    Ok(Some(DayRule::Nth(n, weekday)))
}

fn weekday_number(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    WEEKDAY_NAMES
        .iter()
        .position(|wd| *wd == lower)
        .map(|p| p as u32)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_y, next_m) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_y, next_m, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(31)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn parse(expr: &str) -> Schedule {
        Schedule::parse_with_year(expr, 2030).unwrap()
    }

    #[test]
    fn test_parse_minimal_expression() {
        let schedule = parse("25 */5");
        let next = schedule
            .next_after(utc(2030, 6, 1, 12, 0, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2030, 6, 1, 12, 0, 25));

        // From just past the fire instant, the next slot is 5 minutes later.
        let next = schedule
            .next_after(utc(2030, 6, 1, 12, 0, 25), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2030, 6, 1, 12, 5, 25));
    }

    #[test]
    fn test_parse_rejects_bad_tokens_per_field() {
        let errors = Schedule::parse_with_year("75 0 0 8 99 40 13 1999", 2030).unwrap_err();
        assert_eq!(errors.len(), 6);
        assert!(errors[0].starts_with("second:"));
        assert!(errors.iter().any(|e| e.starts_with("day_of_week:")));
        assert!(errors.iter().any(|e| e.starts_with("year:")));
    }

    #[test]
    fn test_parse_rejects_too_many_fields() {
        let errors = Schedule::parse_with_year("0 0 0 * * * * 2031 9", 2030).unwrap_err();
        assert!(errors[0].contains("at most 8"));
    }

    #[test]
    fn test_parse_rejects_unresolved_wildcard() {
        let errors = Schedule::parse_with_year("? */5", 2030).unwrap_err();
        assert!(errors[0].contains("unresolved wildcard"));
    }

    #[test]
    fn test_daily_time() {
        let schedule = parse("0 30 9");
        let next = schedule
            .next_after(utc(2030, 3, 10, 10, 0, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2030, 3, 11, 9, 30, 0));
    }

    #[test]
    fn test_day_of_week_field() {
        // Noon on Fridays. 2030-06-07 is a Friday.
        let schedule = parse("0 0 12 fri");
        let next = schedule
            .next_after(utc(2030, 6, 3, 0, 0, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2030, 6, 7, 12, 0, 0));
    }

    #[test]
    fn test_day_of_week_numeric_and_range() {
        let by_name = parse("0 0 12 mon-wed");
        let by_number = parse("0 0 12 0-2");
        assert_eq!(by_name, by_number);
    }

    #[test]
    fn test_iso_week_field() {
        // Week 1 of 2031 starts Monday 2030-12-30.
        let schedule = parse("0 0 0 * 1");
        let next = schedule
            .next_after(utc(2030, 12, 1, 0, 0, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2030, 12, 30, 0, 0, 0));
    }

    #[test]
    fn test_month_and_day_fields() {
        let schedule = parse("0 0 0 * * 1 1");
        let next = schedule
            .next_after(utc(2030, 2, 1, 0, 0, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2031, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_year_field() {
        let schedule = parse("0 0 0 * * 1 1 2032");
        let next = schedule
            .next_after(utc(2030, 1, 1, 0, 0, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2032, 1, 1, 0, 0, 0));
        // Exhausted year — nothing after the last instant.
        assert!(schedule
            .next_after(utc(2032, 1, 1, 0, 0, 0), chrono_tz::UTC)
            .is_none());
    }

    #[test]
    fn test_last_day_of_month() {
        let schedule = parse("0 0 0 * * last");
        let next = schedule
            .next_after(utc(2030, 2, 1, 0, 0, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2030, 2, 28, 0, 0, 0));
    }

    #[test]
    fn test_nth_weekday_of_month() {
        // Second Monday of June 2030 is the 10th.
        let schedule = parse("0 0 0 * * 2nd_mon");
        let next = schedule
            .next_after(utc(2030, 6, 1, 0, 0, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2030, 6, 10, 0, 0, 0));
    }

    #[test]
    fn test_last_weekday_of_month() {
        // Last Friday of June 2030 is the 28th.
        let schedule = parse("0 0 0 * * last_fri");
        let next = schedule
            .next_after(utc(2030, 6, 1, 0, 0, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2030, 6, 28, 0, 0, 0));
    }

    #[test]
    fn test_day_underscore_parse_is_idempotent() {
        // Parsing the stored (underscore) form twice must agree with the
        // space form — no double substitution on re-evaluation.
        let stored = parse("0 0 0 * * 2nd_mon");
        let reparsed = parse("0 0 0 * * 2nd_mon");
        let spaced = Schedule::parse_with_year("0 0 0 * * 2nd mon 12", 2030);
        assert_eq!(stored, reparsed);
        // A literal space splits the token stream and shifts every later
        // field, so the spaced form is not an equivalent spelling.
        assert!(spaced.is_err() || spaced.unwrap() != stored);
    }

    #[test]
    fn test_timezone_interpretation() {
        // 12:00 in New York during winter (UTC-5) is 17:00 UTC.
        let schedule = parse("0 0 12");
        let tz: Tz = "America/New_York".parse().unwrap();
        let next = schedule.next_after(utc(2030, 1, 15, 0, 0, 0), tz).unwrap();
        assert_eq!(next, utc(2030, 1, 15, 17, 0, 0));
    }

    #[test]
    fn test_dst_gap_rolls_forward() {
        // US DST spring-forward 2030-03-10: 02:30 local does not exist.
        let schedule = parse("0 30 2 * * 10 3 2030");
        let tz: Tz = "America/New_York".parse().unwrap();
        let next = schedule.next_after(utc(2030, 3, 9, 0, 0, 0), tz);
        // The gap rolls to the next representable instant that day (03:00
        // EDT would not match minute 30 / hour 2, so no fire remains).
        assert!(next.is_none());
    }

    #[test]
    fn test_comma_lists_and_steps() {
        let schedule = parse("0 0,15,30-32 */6");
        let next = schedule
            .next_after(utc(2030, 6, 1, 0, 16, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2030, 6, 1, 0, 30, 0));
        let next = schedule
            .next_after(utc(2030, 6, 1, 0, 32, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2030, 6, 1, 6, 0, 0));
    }

    #[test]
    fn test_resolve_wildcards_in_range() {
        for _ in 0..50 {
            let resolved = resolve_wildcards("? ? ? * * * * 2031").unwrap();
            let tokens: Vec<u32> = resolved
                .split_whitespace()
                .take(3)
                .map(|t| t.parse().unwrap())
                .collect();
            assert!(tokens[0] <= 59);
            assert!(tokens[1] <= 59);
            assert!(tokens[2] <= 23);
            assert!(Schedule::parse_with_year(&resolved, 2030).is_ok());
        }
    }

    #[test]
    fn test_resolve_wildcards_rejects_later_positions() {
        let errors = resolve_wildcards("0 0 0 ?").unwrap_err();
        assert!(errors[0].starts_with("day_of_week:"));
    }

    #[test]
    fn test_resolve_is_stable_once_resolved() {
        let mut rng = StepRng::new(7, 13);
        let resolved = resolve_wildcards_with("? */5", &mut rng).unwrap();
        // No wildcards remain, so resolving again is the identity.
        assert_eq!(resolve_wildcards(&resolved).unwrap(), resolved);
    }

    #[test]
    fn test_omitted_fields_match_everything() {
        let short = parse("0 0 0");
        let long = parse("0 0 0 * * * *");
        assert_eq!(short, long);
    }

    #[test]
    fn test_interval_of_zero_rejected() {
        let errors = Schedule::parse_with_year("*/0", 2030).unwrap_err();
        assert!(errors[0].contains("at least 1"));
    }
}
