//! Track registry

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::storage::TrackData;
use crate::track::Track;

/// Live tracks keyed by lowercase name
#[derive(Debug, Default)]
pub struct TrackManager {
    tracks: RwLock<HashMap<String, Arc<Track>>>,
}

impl TrackManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Track>> {
        self.tracks.read().get(&name.to_lowercase()).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.tracks.read().contains_key(&name.to_lowercase())
    }

    /// Register a new empty track; `None` if the name is taken
    pub fn create(&self, name: &str) -> Option<Arc<Track>> {
        let key = name.to_lowercase();
        let mut tracks = self.tracks.write();
        if tracks.contains_key(&key) {
            return None;
        }
        let track = Arc::new(Track::new(&key));
        tracks.insert(key, track.clone());
        Some(track)
    }

    /// Apply a full storage read, dropping tracks storage no longer has
    pub fn load_all(&self, stored: Vec<TrackData>) {
        let names: Vec<String> = stored.iter().map(|t| t.name.clone()).collect();
        for data in stored {
            self.insert(&data.name, data.groups);
        }
        self.retain(&names);
    }

    /// Register a track, replacing the group list of an existing one
    pub fn insert(&self, name: &str, groups: Vec<String>) -> Arc<Track> {
        let key = name.to_lowercase();
        let mut tracks = self.tracks.write();
        match tracks.get(&key) {
            Some(existing) => {
                existing.set_groups(groups);
                existing.clone()
            }
            None => {
                let track = Arc::new(Track::with_groups(&key, groups));
                tracks.insert(key, track.clone());
                track
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Track>> {
        self.tracks.write().remove(&name.to_lowercase())
    }

    /// Snapshot of every track, sorted by name
    pub fn all(&self) -> Vec<Arc<Track>> {
        let mut tracks: Vec<Arc<Track>> = self.tracks.read().values().cloned().collect();
        tracks.sort_by(|a, b| a.name().cmp(b.name()));
        tracks
    }

    /// Drop every track not named in `keep`
    pub fn retain(&self, keep: &[String]) {
        self.tracks
            .write()
            .retain(|name, _| keep.iter().any(|k| k.eq_ignore_ascii_case(name)));
    }
}
