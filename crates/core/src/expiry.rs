use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc,
};
use chrono_tz::Tz;

/// Computes certificate expiry dates in a site timezone.
///
/// Interval arithmetic happens on the local calendar so that a 30 day
/// certificate issued at 09:00 expires at 09:00 local time, across DST
/// changes and month boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryCalculator {
    timezone: Tz,
}

impl Default for ExpiryCalculator {
    fn default() -> Self {
        Self { timezone: Tz::UTC }
    }
}

impl ExpiryCalculator {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Returns the expiry for an issue timestamp.
    ///
    /// Negative intervals return `issued_at` untouched.
    pub fn compute(
        &self,
        issued_at: DateTime<Utc>,
        valid_interval_days: i64,
        extend_to_month_end: bool,
    ) -> DateTime<Utc> {
        let Ok(days) = u64::try_from(valid_interval_days) else {
            return issued_at;
        };

        let local = issued_at.with_timezone(&self.timezone).naive_local();
        let Some(shifted) = local.checked_add_days(Days::new(days)) else {
            return issued_at;
        };

        let target = if extend_to_month_end {
            last_day_of_month(shifted.date())
                .and_then(|day| day.and_hms_opt(0, 0, 0))
                .unwrap_or(shifted)
        } else {
            shifted
        };

        resolve_local(&self.timezone, target).unwrap_or(issued_at)
    }

    /// Same as [`compute`](Self::compute) for an interval that may be missing.
    pub fn compute_optional(
        &self,
        issued_at: DateTime<Utc>,
        valid_interval_days: Option<i64>,
        extend_to_month_end: bool,
    ) -> DateTime<Utc> {
        match valid_interval_days {
            Some(days) => self.compute(issued_at, days, extend_to_month_end),
            None => issued_at,
        }
    }
}

/// UTC expiry computation.
pub fn compute_expiry(
    issued_at: DateTime<Utc>,
    valid_interval_days: i64,
    extend_to_month_end: bool,
) -> DateTime<Utc> {
    ExpiryCalculator::default().compute(issued_at, valid_interval_days, extend_to_month_end)
}

/// Parses a stored interval such as `"365"`; anything else is `None`.
pub fn parse_interval_days(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

fn last_day_of_month(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.pred_opt()
}

const MAX_GAP_MINUTES: i64 = 48 * 60;

fn resolve_local(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(value) => Some(value.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        // Inside a gap: walk forward minute by minute until the wall clock
        // exists again. Whole skipped days need up to 48 hours.
        LocalResult::None => (1..=MAX_GAP_MINUTES)
            .filter_map(|step| local.checked_add_signed(Duration::minutes(step)))
            .find_map(|candidate| tz.from_local_datetime(&candidate).earliest())
            .map(|value| value.with_timezone(&Utc)),
    }
}
