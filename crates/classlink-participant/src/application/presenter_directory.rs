//! Directory of presenters heard on the presence channel.
//!
//! Presenters announce themselves every few seconds, on both the multicast
//! group and the broadcast address, so the same presenter is heard many
//! times.  Entries are keyed by the presenter's session address (source IP
//! plus announced port); the first sighting is reported as
//! [`Sighting::New`], every later one refreshes the entry in place.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use classlink_core::protocol::messages::PresenceAnnouncement;

/// One presenter the participant can connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenterEntry {
    pub name: String,
    pub channel: u32,
    /// Session address: announcing host plus announced TCP port.
    pub address: SocketAddr,
    pub last_seen: Instant,
}

/// Whether an announcement introduced a presenter or refreshed a known one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    New,
    Refreshed,
}

#[derive(Debug, Default)]
pub struct PresenterDirectory {
    entries: HashMap<SocketAddr, PresenterEntry>,
}

impl PresenterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an announcement received from `source`.
    pub fn observe(
        &mut self,
        source: IpAddr,
        announcement: PresenceAnnouncement,
        now: Instant,
    ) -> (Sighting, PresenterEntry) {
        let address = SocketAddr::new(source, announcement.port);
        let entry = PresenterEntry {
            name: announcement.presenter_name,
            channel: announcement.channel,
            address,
            last_seen: now,
        };
        let sighting = match self.entries.insert(address, entry.clone()) {
            Some(_) => Sighting::Refreshed,
            None => Sighting::New,
        };
        (sighting, entry)
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&PresenterEntry> {
        self.entries.get(address)
    }

    /// Looks a presenter up by its announced channel number.
    pub fn by_channel(&self, channel: u32) -> Option<&PresenterEntry> {
        self.entries.values().find(|e| e.channel == channel)
    }

    /// All presenters, ordered by channel then name.
    pub fn list(&self) -> Vec<PresenterEntry> {
        let mut all: Vec<PresenterEntry> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| a.channel.cmp(&b.channel).then_with(|| a.name.cmp(&b.name)));
        all
    }

    /// Drops presenters not heard from within `max_age`.  Returns how many
    /// were removed.
    pub fn forget_older_than(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_seen) <= max_age);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
