//! Registries of live holders and tracks
//!
//! Managers are plain objects created by the engine at startup and handed
//! around by reference; there is no global registry.

mod group;
mod track;
mod user;

pub use group::GroupManager;
pub use track::TrackManager;
pub use user::UserManager;
