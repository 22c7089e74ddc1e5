//! Tracks - ordered promotion ladders
//!
//! A track is an ordered list of group names. Group existence is only
//! checked when the track is walked: a group deleted after being added to a
//! track shows up as a broken link to the caller.

use parking_lot::RwLock;
use thiserror::Error;

use crate::managers::GroupManager;

/// Track validation and traversal errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackError {
    #[error("group '{0}' is already on the track")]
    AlreadyContains(String),

    #[error("group '{0}' is not on the track")]
    NotOnTrack(String),

    #[error("track references group '{0}', which no longer exists")]
    BrokenLink(String),

    #[error("position {0} is out of range")]
    InvalidPosition(usize),

    #[error("holder is on more than one group of track '{0}'")]
    AmbiguousPosition(String),
}

/// An ordered, duplicate-free list of group names
#[derive(Debug)]
pub struct Track {
    name: String,
    groups: RwLock<Vec<String>>,
}

impl Track {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            groups: RwLock::new(Vec::new()),
        }
    }

    /// Build a track from stored data, dropping duplicate entries
    pub fn with_groups(name: &str, groups: Vec<String>) -> Self {
        let track = Self::new(name);
        track.set_groups(groups);
        track
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.read().clone()
    }

    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }

    pub fn contains(&self, group: &str) -> bool {
        let group = group.to_lowercase();
        self.groups.read().iter().any(|g| *g == group)
    }

    /// Replace the whole list, keeping the first occurrence of each name
    pub fn set_groups(&self, groups: Vec<String>) {
        let mut deduped: Vec<String> = Vec::with_capacity(groups.len());
        for group in groups {
            let group = group.to_lowercase();
            if !deduped.contains(&group) {
                deduped.push(group);
            }
        }
        *self.groups.write() = deduped;
    }

    pub fn append(&self, group: &str) -> Result<(), TrackError> {
        let group = group.to_lowercase();
        let mut groups = self.groups.write();
        if groups.contains(&group) {
            return Err(TrackError::AlreadyContains(group));
        }
        groups.push(group);
        Ok(())
    }

    /// Insert at a zero-based position (`position == len` appends)
    pub fn insert(&self, group: &str, position: usize) -> Result<(), TrackError> {
        let group = group.to_lowercase();
        let mut groups = self.groups.write();
        if groups.contains(&group) {
            return Err(TrackError::AlreadyContains(group));
        }
        if position > groups.len() {
            return Err(TrackError::InvalidPosition(position));
        }
        groups.insert(position, group);
        Ok(())
    }

    pub fn remove(&self, group: &str) -> Result<(), TrackError> {
        let group = group.to_lowercase();
        let mut groups = self.groups.write();
        let before = groups.len();
        groups.retain(|g| *g != group);
        if groups.len() == before {
            return Err(TrackError::NotOnTrack(group));
        }
        Ok(())
    }

    pub fn clear(&self) {
        self.groups.write().clear();
    }

    /// The group after `current`, or `None` at the end of the track
    pub fn next_group(
        &self,
        current: &str,
        groups: &GroupManager,
    ) -> Result<Option<String>, TrackError> {
        self.step(current, groups, |index, len| {
            (index + 1 < len).then_some(index + 1)
        })
    }

    /// The group before `current`, or `None` at the start of the track
    pub fn previous_group(
        &self,
        current: &str,
        groups: &GroupManager,
    ) -> Result<Option<String>, TrackError> {
        self.step(current, groups, |index, _| index.checked_sub(1))
    }

    fn step<F>(
        &self,
        current: &str,
        groups: &GroupManager,
        pick: F,
    ) -> Result<Option<String>, TrackError>
    where
        F: FnOnce(usize, usize) -> Option<usize>,
    {
        let current = current.to_lowercase();
        let list = self.groups();
        let index = list
            .iter()
            .position(|g| *g == current)
            .ok_or_else(|| TrackError::NotOnTrack(current.clone()))?;

        let Some(target) = pick(index, list.len()).map(|i| list[i].clone()) else {
            return Ok(None);
        };
        if !groups.exists(&target) {
            return Err(TrackError::BrokenLink(target));
        }
        Ok(Some(target))
    }
}
