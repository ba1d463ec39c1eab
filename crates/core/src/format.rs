use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Printed date style on a certificate, stored as its numeric option code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum DateFormat {
    #[default]
    Hidden,
    /// `January 15, 2024`
    MonthDayYear,
    /// `January 15th, 2024`
    MonthOrdinalYear,
    /// `15 January 2024`
    DayMonthYear,
    /// `January 2024`
    MonthYear,
    /// Site default, `15 January 2024`.
    SiteDefault,
}

impl From<i64> for DateFormat {
    fn from(code: i64) -> Self {
        match code {
            1 => Self::MonthDayYear,
            2 => Self::MonthOrdinalYear,
            3 => Self::DayMonthYear,
            4 => Self::MonthYear,
            5 => Self::SiteDefault,
            _ => Self::Hidden,
        }
    }
}

impl From<DateFormat> for i64 {
    fn from(format: DateFormat) -> Self {
        match format {
            DateFormat::Hidden => 0,
            DateFormat::MonthDayYear => 1,
            DateFormat::MonthOrdinalYear => 2,
            DateFormat::DayMonthYear => 3,
            DateFormat::MonthYear => 4,
            DateFormat::SiteDefault => 5,
        }
    }
}

impl DateFormat {
    /// Renders `value` in `timezone`; hidden formats render as an empty string.
    pub fn render(self, value: DateTime<Utc>, timezone: Tz) -> String {
        let local = value.with_timezone(&timezone);
        match self {
            Self::Hidden => String::new(),
            Self::MonthDayYear => local.format("%B %d, %Y").to_string(),
            Self::MonthOrdinalYear => {
                let day = local.day();
                format!(
                    "{} {}{}, {}",
                    local.format("%B"),
                    day,
                    ordinal_suffix(day),
                    local.year()
                )
            }
            Self::DayMonthYear => local.format("%d %B %Y").to_string(),
            Self::MonthYear => local.format("%B %Y").to_string(),
            Self::SiteDefault => local.format("%-d %B %Y").to_string(),
        }
    }
}

/// English ordinal suffix for a day of month.
pub fn ordinal_suffix(day: u32) -> &'static str {
    if (11..=13).contains(&(day % 100)) {
        return "th";
    }
    match day % 10 {
        1 => "st",
        2 => "nd",
        3 => "rd",
        _ => "th",
    }
}
