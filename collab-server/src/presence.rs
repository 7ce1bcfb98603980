//! Presence (awareness) records for the peers of a room.
//!
//! Presence is ephemeral: it is broadcast to the other connections of the
//! room, it is never merged into the document, and it disappears as soon as
//! its connection closes. Each update from a peer replaces that peer's
//! previous record wholesale.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Presence record of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    /// Display name.
    pub name: String,
    /// CSS hex color (`#rrggbb`) for cursor/selection rendering.
    pub color: String,
    /// Free-form fields (cursor, selection, focused file, ...).
    pub metadata: BTreeMap<String, String>,
}

impl PresenceState {
    /// Initial presence for a peer: the handshake name and a stable color.
    pub fn for_peer(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color_for(peer_id),
            metadata: BTreeMap::new(),
        }
    }

    /// Placeholder name for peers that did not announce one.
    pub fn anonymous(peer_id: Uuid) -> Self {
        let simple = peer_id.simple().to_string();
        Self::for_peer(peer_id, format!("Peer-{}", &simple[..8]))
    }
}

/// Stable, visually distinct `#rrggbb` color derived from a peer id.
///
/// The hue comes from the id, saturation and lightness are fixed for vivid
/// cursors.
pub fn color_for(peer_id: Uuid) -> String {
    let hue = ((peer_id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Presence of every live connection in one room.
#[derive(Debug, Default)]
pub struct PresenceTable {
    peers: HashMap<Uuid, PresenceState>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `state` as the current presence of `peer_id`.
    ///
    /// Returns the record it replaced, if any.
    pub fn update(&mut self, peer_id: Uuid, state: PresenceState) -> Option<PresenceState> {
        self.peers.insert(peer_id, state)
    }

    /// Drop a peer's presence (on disconnect).
    pub fn remove(&mut self, peer_id: &Uuid) -> Option<PresenceState> {
        self.peers.remove(peer_id)
    }

    pub fn get(&self, peer_id: &Uuid) -> Option<&PresenceState> {
        self.peers.get(peer_id)
    }

    /// Presence of every peer except `peer_id`, for a newcomer's initial view.
    pub fn others(&self, peer_id: &Uuid) -> Vec<(Uuid, PresenceState)> {
        self.peers
            .iter()
            .filter(|(id, _)| *id != peer_id)
            .map(|(id, state)| (*id, state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_stable_per_peer() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(color_for(id), color_for(id));
    }

    #[test]
    fn test_color_is_hex() {
        let color = color_for(Uuid::new_v4());
        assert_eq!(color.len(), 7);
        assert!(color.starts_with('#'));
        assert!(color[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_hsl_to_rgb_achromatic() {
        let (r, g, b) = hsl_to_rgb(0.0, 0.0, 0.5);
        assert!((r - 0.5).abs() < 0.01);
        assert!((g - 0.5).abs() < 0.01);
        assert!((b - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_anonymous_name() {
        let id = Uuid::new_v4();
        let state = PresenceState::anonymous(id);
        assert!(state.name.starts_with("Peer-"));
        assert_eq!(state.name.len(), "Peer-".len() + 8);
    }

    #[test]
    fn test_update_replaces_wholesale() {
        let mut table = PresenceTable::new();
        let id = Uuid::new_v4();

        let mut first = PresenceState::for_peer(id, "Alice");
        first.metadata.insert("cursor".into(), "3".into());
        first.metadata.insert("file".into(), "main.tex".into());
        assert!(table.update(id, first.clone()).is_none());

        let mut second = PresenceState::for_peer(id, "Alice");
        second.metadata.insert("cursor".into(), "9".into());
        assert_eq!(table.update(id, second.clone()), Some(first));

        // Fields absent from the new record are gone, not merged.
        let current = table.get(&id).unwrap();
        assert_eq!(current, &second);
        assert!(!current.metadata.contains_key("file"));
    }

    #[test]
    fn test_others_excludes_self() {
        let mut table = PresenceTable::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        table.update(alice, PresenceState::for_peer(alice, "Alice"));
        table.update(bob, PresenceState::for_peer(bob, "Bob"));

        let others = table.others(&alice);
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].0, bob);
        assert_eq!(others[0].1.name, "Bob");
    }

    #[test]
    fn test_remove_clears_presence() {
        let mut table = PresenceTable::new();
        let id = Uuid::new_v4();
        table.update(id, PresenceState::for_peer(id, "Alice"));
        assert_eq!(table.len(), 1);

        assert!(table.remove(&id).is_some());
        assert!(table.is_empty());
        assert!(table.remove(&id).is_none());
    }
}
