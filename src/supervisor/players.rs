//! Online player tracking from console output.

use std::collections::BTreeSet;

use crate::engine::EngineProfile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    Joined(String),
    Left(String),
    /// Full list from a `list` command response.
    Listed(Vec<String>),
}

impl PlayerEvent {
    pub fn parse(profile: &EngineProfile, text: &str) -> Option<Self> {
        if let Some(caps) = profile.list.captures(text) {
            let names = caps
                .name("names")
                .map(|m| {
                    m.as_str()
                        .split(',')
                        .map(str::trim)
                        .filter(|n| !n.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            return Some(PlayerEvent::Listed(names));
        }
        if let Some(name) = profile.join.captures(text).and_then(|c| c.name("name")) {
            return Some(PlayerEvent::Joined(name.as_str().to_string()));
        }
        if let Some(name) = profile.leave.captures(text).and_then(|c| c.name("name")) {
            return Some(PlayerEvent::Left(name.as_str().to_string()));
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct PlayerRoster {
    players: BTreeSet<String>,
}

impl PlayerRoster {
    /// Returns true if the roster changed.
    pub fn apply(&mut self, event: PlayerEvent) -> bool {
        match event {
            PlayerEvent::Joined(name) => self.players.insert(name),
            PlayerEvent::Left(name) => self.players.remove(&name),
            PlayerEvent::Listed(names) => {
                let next: BTreeSet<String> = names.into_iter().collect();
                if next == self.players {
                    false
                } else {
                    self.players = next;
                    true
                }
            }
        }
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.players.is_empty();
        self.players.clear();
        changed
    }

    pub fn names(&self) -> Vec<String> {
        self.players.iter().cloned().collect()
    }
}
