//! Reporting calendars used to align series sampled at different frequencies

use crate::config::{CalendarConfig, CalendarFrequency};
use crate::error::{LiquidityError, Result};
use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Calendar onto which every input series is aligned before combination
pub trait ReportingCalendar: Send + Sync {
    /// Check if a date is a reporting session
    fn is_session(&self, date: NaiveDate) -> bool;

    /// Version string persisted alongside every composite built on this calendar
    fn version(&self) -> &str;

    /// Short human-readable description ("weekly:Wed")
    fn describe(&self) -> String;

    /// Get the next session after the given date
    fn next_session(&self, date: NaiveDate) -> Result<NaiveDate> {
        let mut current = date + Duration::days(1);
        for _ in 0..366 {
            if self.is_session(current) {
                return Ok(current);
            }
            current = current + Duration::days(1);
        }
        Err(LiquidityError::ConfigError(format!(
            "calendar {} has no session within a year after {}",
            self.describe(),
            date
        )))
    }

    /// Latest session on or before the given date
    fn session_on_or_before(&self, date: NaiveDate) -> Result<NaiveDate> {
        let mut current = date;
        for _ in 0..366 {
            if self.is_session(current) {
                return Ok(current);
            }
            current = current - Duration::days(1);
        }
        Err(LiquidityError::ConfigError(format!(
            "calendar {} has no session within a year before {}",
            self.describe(),
            date
        )))
    }

    /// All sessions between two dates (inclusive)
    fn sessions_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut sessions = Vec::new();
        let mut current = start;

        while current <= end {
            if self.is_session(current) {
                sessions.push(current);
            }
            current = current + Duration::days(1);
        }

        sessions
    }
}

/// One session per week on a fixed weekday (Fed H.4.1 levels are Wednesday values)
#[derive(Debug, Clone)]
pub struct WeeklyCalendar {
    anchor: Weekday,
    version: String,
}

impl WeeklyCalendar {
    pub fn new(anchor: Weekday, version: impl Into<String>) -> Self {
        Self {
            anchor,
            version: version.into(),
        }
    }

    pub fn anchor(&self) -> Weekday {
        self.anchor
    }
}

impl ReportingCalendar for WeeklyCalendar {
    fn is_session(&self, date: NaiveDate) -> bool {
        date.weekday() == self.anchor
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn describe(&self) -> String {
        format!("weekly:{}", self.anchor)
    }

    fn sessions_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let offset = (7 + self.anchor.num_days_from_monday() as i64
            - start.weekday().num_days_from_monday() as i64)
            % 7;
        let mut sessions = Vec::new();
        let mut current = start + Duration::days(offset);
        while current <= end {
            sessions.push(current);
            current = current + Duration::days(7);
        }
        sessions
    }
}

/// Weekdays minus an explicit holiday list
#[derive(Debug, Clone)]
pub struct BusinessDayCalendar {
    holidays: Vec<NaiveDate>,
    version: String,
}

impl BusinessDayCalendar {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            holidays: Vec::new(),
            version: version.into(),
        }
    }

    /// Add a holiday
    pub fn add_holiday(&mut self, date: NaiveDate) {
        if let Err(idx) = self.holidays.binary_search(&date) {
            self.holidays.insert(idx, date);
        }
    }

    fn is_weekend(date: NaiveDate) -> bool {
        matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

impl ReportingCalendar for BusinessDayCalendar {
    fn is_session(&self, date: NaiveDate) -> bool {
        !Self::is_weekend(date) && self.holidays.binary_search(&date).is_err()
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn describe(&self) -> String {
        format!("business({} holidays)", self.holidays.len())
    }
}

/// Every calendar day
#[derive(Debug, Clone)]
pub struct DailyCalendar {
    version: String,
}

impl DailyCalendar {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl ReportingCalendar for DailyCalendar {
    fn is_session(&self, _date: NaiveDate) -> bool {
        true
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn describe(&self) -> String {
        "daily".to_string()
    }
}

/// Build the configured calendar
pub fn from_config(config: &CalendarConfig) -> Result<Box<dyn ReportingCalendar>> {
    match config.frequency {
        CalendarFrequency::Weekly => {
            let anchor = config.anchor.as_deref().ok_or_else(|| {
                LiquidityError::ConfigError("weekly calendar requires an anchor weekday".to_string())
            })?;
            let anchor: Weekday = anchor.parse().map_err(|_| {
                LiquidityError::ConfigError(format!("invalid calendar anchor '{}'", anchor))
            })?;
            Ok(Box::new(WeeklyCalendar::new(anchor, config.version.clone())))
        }
        CalendarFrequency::Business => {
            let mut calendar = BusinessDayCalendar::new(config.version.clone());
            for holiday in &config.holidays {
                calendar.add_holiday(*holiday);
            }
            Ok(Box::new(calendar))
        }
        CalendarFrequency::Daily => Ok(Box::new(DailyCalendar::new(config.version.clone()))),
    }
}
