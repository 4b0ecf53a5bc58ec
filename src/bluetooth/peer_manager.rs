//! Peer Management Module
//!
//! Tracks radios discovered by the scanner and merges them with private
//! channels remembered in message history.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::watch;

use crate::message::message_types::ChannelProfile;

/// Signal strength recorded when the backend reports a radio without RSSI.
/// Zero is reserved for offline peers rebuilt from history.
pub const UNKNOWN_RSSI: i16 = -127;

/// A radio seen by the scanner, or a historical peer rebuilt from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub address: String,
    pub display_name: String,
    /// dBm; zero marks an offline/historical entry.
    pub signal_strength: i16,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl PeerDescriptor {
    pub fn discovered(address: &str, name: Option<&str>, rssi: Option<i16>) -> Self {
        let display_name = match name {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => format!("Unknown ({address})"),
        };

        Self {
            address: address.to_string(),
            display_name,
            signal_strength: match rssi {
                Some(0) | None => UNKNOWN_RSSI,
                Some(rssi) => rssi,
            },
            last_seen_at: Some(Utc::now()),
        }
    }

    fn offline(profile: &ChannelProfile) -> Self {
        Self {
            address: profile
                .last_address
                .clone()
                .unwrap_or_else(|| profile.channel_id.clone()),
            display_name: profile.display_name.clone(),
            signal_strength: 0,
            last_seen_at: None,
        }
    }

    /// Currently heard by the scanner.
    pub fn is_active(&self) -> bool {
        self.signal_strength != 0
    }
}

/// Live-scan registry keyed by radio address.
pub struct PeerManager {
    peers: DashMap<String, PeerDescriptor>,
    scanned: watch::Sender<Vec<PeerDescriptor>>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            scanned: watch::channel(Vec::new()).0,
        }
    }

    /// Add or replace a discovered radio. Last write wins per address.
    pub fn on_discovered(&self, peer: PeerDescriptor) {
        match self.peers.insert(peer.address.clone(), peer.clone()) {
            None => info!("Discovered new peer: {} ({})", peer.display_name, peer.address),
            Some(_) => debug!(
                "Updated peer: {} ({}) rssi={}",
                peer.display_name, peer.address, peer.signal_strength
            ),
        }
        self.publish();
    }

    /// Merge the live scan with `history` into the user-visible peer list.
    pub fn on_history_loaded(&self, history: &[ChannelProfile]) -> Vec<PeerDescriptor> {
        merge_peers(&self.live_peers(), history)
    }

    /// Drop the live scan. History is re-derived from the message store.
    pub fn clear(&self) {
        self.peers.clear();
        self.publish();
        debug!("Cleared live peer list");
    }

    /// Radios from the current scan, most recently seen first.
    pub fn live_peers(&self) -> Vec<PeerDescriptor> {
        let mut peers: Vec<_> = self.peers.iter().map(|entry| entry.value().clone()).collect();
        peers.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        peers
    }

    /// Live view of the scan, updated on every discovery and clear.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PeerDescriptor>> {
        self.scanned.subscribe()
    }

    pub fn get_peer(&self, address: &str) -> Option<PeerDescriptor> {
        self.peers.get(address).map(|entry| entry.value().clone())
    }

    fn publish(&self) {
        self.scanned.send_replace(self.live_peers());
    }

    /// Get peer statistics
    pub fn get_statistics(&self) -> serde_json::Value {
        let live = self.live_peers();
        let unique_names: HashSet<_> = live.iter().map(|p| p.display_name.as_str()).collect();

        serde_json::json!({
            "live_peers": live.len(),
            "unique_names": unique_names.len(),
        })
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Live peers plus one offline entry per historical channel that no live
/// peer accounts for, sorted by display name without regard to case.
pub fn merge_peers(live: &[PeerDescriptor], history: &[ChannelProfile]) -> Vec<PeerDescriptor> {
    let live_addresses: HashSet<&str> = live.iter().map(|p| p.address.as_str()).collect();
    let live_names: HashSet<&str> = live.iter().map(|p| p.display_name.as_str()).collect();

    let mut merged = live.to_vec();

    for profile in history {
        let known = live_addresses.contains(profile.channel_id.as_str())
            || profile
                .last_address
                .as_deref()
                .is_some_and(|addr| live_addresses.contains(addr))
            || live_names.contains(profile.display_name.as_str());

        if !known {
            merged.push(PeerDescriptor::offline(profile));
        }
    }

    merged.sort_by_key(|p| p.display_name.to_lowercase());
    merged
}

/// Address to deliver to for the peer named `name`; live peers are
/// preferred over historical ones.
pub fn resolve_address(peers: &[PeerDescriptor], name: &str) -> Option<String> {
    peers
        .iter()
        .filter(|p| p.display_name == name)
        .max_by_key(|p| p.is_active())
        .map(|p| p.address.clone())
}
