//! Application-facing services

mod trip_sync;

pub use trip_sync::TripSync;
