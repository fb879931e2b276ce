//! Lightweight Trip projection for list views

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

use super::trip::{TripId, TripPrivacy, TripRights};

/// Trip summary without day item bodies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripInfo {
    pub id: TripId,
    pub name: String,
    pub version: i64,
    pub start_date: Option<NaiveDate>,
    /// Last update timestamp (Unix ms)
    pub last_update: Option<i64>,
    pub days_count: usize,
    pub is_trashed: bool,
    pub privacy: TripPrivacy,
    pub rights: TripRights,
    pub owner_id: Option<String>,
    pub changed: bool,
}

impl TripInfo {
    /// Last planned day; a scheduled Trip without days lasts its start day.
    pub fn end_date(&self) -> Option<NaiveDate> {
        let start = self.start_date?;
        let extra = u64::try_from(self.days_count.saturating_sub(1)).unwrap_or(u64::MAX);
        start.checked_add_days(Days::new(extra)).or(Some(start))
    }

    pub const fn is_unscheduled(&self) -> bool {
        self.start_date.is_none()
    }

    /// Starts strictly after `today`
    pub fn is_future(&self, today: NaiveDate) -> bool {
        self.start_date.is_some_and(|start| start > today)
    }

    /// Ended before `today`
    pub fn is_past(&self, today: NaiveDate) -> bool {
        self.end_date().is_some_and(|end| end < today)
    }

    /// Scheduled and not yet over (ongoing or future)
    pub fn is_upcoming(&self, today: NaiveDate) -> bool {
        self.end_date().is_some_and(|end| end >= today)
    }

    pub fn is_in_year(&self, year: i32) -> bool {
        self.start_date.is_some_and(|start| start.year() == year)
    }

    /// Whether the Trip falls into the given (optionally open) date range.
    ///
    /// Without `include_overlapping` the whole Trip must fit inside the range.
    pub fn is_within(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        include_overlapping: bool,
    ) -> bool {
        let (Some(trip_start), Some(trip_end)) = (self.start_date, self.end_date()) else {
            return false;
        };
        let after_start = |date: NaiveDate| start.is_none_or(|bound| date >= bound);
        let before_end = |date: NaiveDate| end.is_none_or(|bound| date <= bound);

        if include_overlapping {
            after_start(trip_end) && before_end(trip_start)
        } else {
            after_start(trip_start) && before_end(trip_end)
        }
    }
}
