//! Data models for tripsync

mod favorite;
mod session;
mod settings;
mod sync_conflict;
mod sync_result;
mod trip;
mod trip_info;

pub use favorite::{FavoriteIntent, FavoritesDiff};
pub use session::Session;
pub use settings::AccountSettings;
pub use sync_conflict::TripConflict;
pub use sync_result::{EntityFailure, SynchronizationResult};
pub use trip::{
    TransportAvoid, TransportLeg, TransportMode, TransportType, Trip, TripDay, TripDayItem,
    TripId, TripPrivacy, TripRights, LOCAL_TRIP_PREFIX,
};
pub use trip_info::TripInfo;
