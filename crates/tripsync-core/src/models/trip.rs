//! Trip model: trips, days, day items, and transport legs

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::trip_info::TripInfo;

/// Prefix reserved for client-minted trip identifiers.
pub const LOCAL_TRIP_PREFIX: &str = "*";

/// Identifier of a Trip, either provisional (client-minted) or server-issued.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TripId(String);

impl TripId {
    /// Mint a new provisional ID for a Trip the server has not seen yet.
    #[must_use]
    pub fn provisional() -> Self {
        Self(format!("{LOCAL_TRIP_PREFIX}{}", Uuid::now_v7().simple()))
    }

    /// Get the string representation of this ID
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this ID was minted locally and still awaits a server ID.
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(LOCAL_TRIP_PREFIX)
    }
}

impl fmt::Display for TripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TripId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Trip ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for TripId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TripId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Who can see a Trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TripPrivacy {
    #[default]
    Private,
    Shareable,
    Public,
}

impl TripPrivacy {
    pub const fn code(self) -> i64 {
        match self {
            Self::Private => 0,
            Self::Shareable => 1,
            Self::Public => 2,
        }
    }

    pub const fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Shareable,
            2 => Self::Public,
            _ => Self::Private,
        }
    }
}

bitflags! {
    /// What the current user may do with a Trip
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TripRights: u8 {
        const EDIT   = 1 << 0;
        const MANAGE = 1 << 1;
        const DELETE = 1 << 2;
    }
}

impl Default for TripRights {
    fn default() -> Self {
        Self::all()
    }
}

/// Mode of travel for a transport leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Unknown,
    Walk,
    Car,
    Flight,
    Bike,
    Bus,
    Train,
    Boat,
}

impl TransportMode {
    pub const fn code(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Walk => 1,
            Self::Car => 2,
            Self::Flight => 3,
            Self::Bike => 4,
            Self::Bus => 5,
            Self::Train => 6,
            Self::Boat => 7,
        }
    }

    pub const fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Walk,
            2 => Self::Car,
            3 => Self::Flight,
            4 => Self::Bike,
            5 => Self::Bus,
            6 => Self::Train,
            7 => Self::Boat,
            _ => Self::Unknown,
        }
    }
}

/// Route preference for a transport leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    Fastest,
    Shortest,
    Economic,
}

impl TransportType {
    pub const fn code(self) -> i64 {
        match self {
            Self::Fastest => 0,
            Self::Shortest => 1,
            Self::Economic => 2,
        }
    }

    pub const fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Shortest,
            2 => Self::Economic,
            _ => Self::Fastest,
        }
    }
}

bitflags! {
    /// Road features a transport leg should avoid
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct TransportAvoid: u8 {
        const TOLLS    = 1 << 0;
        const HIGHWAYS = 1 << 1;
        const FERRIES  = 1 << 2;
        const UNPAVED  = 1 << 3;
    }
}

/// Travel from one day item to the next
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportLeg {
    pub mode: TransportMode,
    pub kind: TransportType,
    pub avoid: TransportAvoid,
    /// Departure, in seconds from local midnight
    pub start_time: Option<i64>,
    /// Duration in seconds
    pub duration: Option<i64>,
    pub note: Option<String>,
    /// Encoded polyline of the route
    pub polyline: Option<String>,
}

/// A single stop in a Trip day, referencing an external place
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripDayItem {
    /// Referenced place/activity ID (not owned by this crate)
    pub item_id: String,
    /// Seconds from local midnight
    pub start_time: Option<i64>,
    /// Duration in seconds
    pub duration: Option<i64>,
    pub note: Option<String>,
    /// Transport to the next item
    pub transport: Option<TransportLeg>,
}

impl TripDayItem {
    /// Create an item referencing the given place ID
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            start_time: None,
            duration: None,
            note: None,
            transport: None,
        }
    }
}

/// Ordered list of items planned for one day of a Trip
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TripDay {
    pub items: Vec<TripDayItem>,
    pub note: Option<String>,
}

impl TripDay {
    /// Place IDs of the items in this day, in order
    pub fn item_ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.item_id.as_str()).collect()
    }

    fn contains_item(&self, item_id: &str) -> bool {
        self.items.iter().any(|item| item.item_id == item_id)
    }
}

/// A Trip itinerary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub name: String,
    /// Local monotone version; bumped by every committed mutation
    pub version: i64,
    pub start_date: Option<NaiveDate>,
    /// Last update timestamp (Unix ms)
    pub last_update: Option<i64>,
    pub is_trashed: bool,
    pub days: Vec<TripDay>,
    pub privacy: TripPrivacy,
    pub rights: TripRights,
    /// Trip owner and local record holder
    pub owner_id: Option<String>,
    /// Changed since last sync
    pub changed: bool,
    /// Last server version this replica observed; maintained by the repository
    #[serde(default)]
    pub server_version: i64,
}

impl Trip {
    /// Create a new Trip with a provisional ID and a single empty day
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TripId::provisional(),
            name: name.into(),
            version: 0,
            start_date: None,
            last_update: None,
            is_trashed: false,
            days: vec![TripDay::default()],
            privacy: TripPrivacy::default(),
            rights: TripRights::all(),
            owner_id: None,
            changed: false,
            server_version: 0,
        }
    }

    pub fn is_editable(&self) -> bool {
        self.rights.contains(TripRights::EDIT)
    }

    pub fn is_manageable(&self) -> bool {
        self.rights.contains(TripRights::MANAGE)
    }

    pub fn is_deletable(&self) -> bool {
        self.rights.contains(TripRights::DELETE)
    }

    /// Lightweight projection used by list views
    pub fn info(&self) -> TripInfo {
        TripInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version,
            start_date: self.start_date,
            last_update: self.last_update,
            days_count: self.days.len(),
            is_trashed: self.is_trashed,
            privacy: self.privacy,
            rights: self.rights,
            owner_id: self.owner_id.clone(),
            changed: self.changed,
        }
    }

    // Day workers

    pub fn add_new_day(&mut self) {
        self.days.push(TripDay::default());
    }

    /// Remove the day at `index`; returns the removed day
    pub fn remove_day(&mut self, index: usize) -> Option<TripDay> {
        (index < self.days.len()).then(|| self.days.remove(index))
    }

    // Item workers

    /// Append a place to the given day; returns false when the day does not exist
    pub fn add_item(&mut self, item_id: impl Into<String>, day_index: usize) -> bool {
        let Some(day) = self.days.get_mut(day_index) else {
            return false;
        };
        day.items.push(TripDayItem::new(item_id));
        true
    }

    /// Remove every occurrence of a place from one day
    pub fn remove_item_from_day(&mut self, item_id: &str, day_index: usize) -> bool {
        let Some(day) = self.days.get_mut(day_index) else {
            return false;
        };
        let before = day.items.len();
        day.items.retain(|item| item.item_id != item_id);
        day.items.len() != before
    }

    /// Remove every occurrence of a place from all days
    pub fn remove_item(&mut self, item_id: &str) -> bool {
        let mut removed = false;
        for index in 0..self.days.len() {
            removed |= self.remove_item_from_day(item_id, index);
        }
        removed
    }

    pub fn occurrences_of_item(&self, item_id: &str) -> Vec<&TripDayItem> {
        self.days
            .iter()
            .flat_map(|day| day.items.iter())
            .filter(|item| item.item_id == item_id)
            .collect()
    }

    // Information providers

    pub fn item_ids_in_trip(&self) -> BTreeSet<&str> {
        self.days
            .iter()
            .flat_map(|day| day.items.iter())
            .map(|item| item.item_id.as_str())
            .collect()
    }

    pub fn contains_item(&self, item_id: &str) -> bool {
        self.days.iter().any(|day| day.contains_item(item_id))
    }

    pub fn indexes_of_days_containing_item(&self, item_id: &str) -> Vec<usize> {
        self.days
            .iter()
            .enumerate()
            .filter(|(_, day)| day.contains_item(item_id))
            .map(|(index, _)| index)
            .collect()
    }

    /// A Trip with no planned items
    pub fn is_empty(&self) -> bool {
        self.days.iter().all(|day| day.items.is_empty())
    }

    // Manipulation methods

    pub fn move_day(&mut self, source: usize, destination: usize) -> bool {
        if source >= self.days.len() || destination >= self.days.len() {
            return false;
        }
        let day = self.days.remove(source);
        self.days.insert(destination, day);
        true
    }

    pub fn move_activity(
        &mut self,
        day_index: usize,
        activity_index: usize,
        dest_day_index: usize,
        dest_index: usize,
    ) -> bool {
        let source_len = match self.days.get(day_index) {
            Some(day) => day.items.len(),
            None => return false,
        };
        let dest_len = match self.days.get(dest_day_index) {
            Some(day) => day.items.len(),
            None => return false,
        };
        if activity_index >= source_len {
            return false;
        }
        // Moving within one day shifts the destination bound by the removed item
        let max_dest = if day_index == dest_day_index {
            dest_len - 1
        } else {
            dest_len
        };
        if dest_index > max_dest {
            return false;
        }

        let item = self.days[day_index].items.remove(activity_index);
        self.days[dest_day_index].items.insert(dest_index, item);
        true
    }

    pub fn remove_activity(&mut self, day_index: usize, activity_index: usize) -> bool {
        match self.days.get_mut(day_index) {
            Some(day) if activity_index < day.items.len() => {
                day.items.remove(activity_index);
                true
            }
            _ => false,
        }
    }
}
