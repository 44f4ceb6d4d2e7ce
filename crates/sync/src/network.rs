//! Connectivity state tracking.
//!
//! The platform reports raw link information; the monitor collapses it into a
//! binary online/offline state and reports each change exactly once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Raw link information as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkState {
    pub is_connected: bool,
    /// `None` while the platform has not determined reachability yet.
    pub is_internet_reachable: Option<bool>,
}

impl LinkState {
    pub fn online() -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: Some(true),
        }
    }

    pub fn offline() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: Some(false),
        }
    }

    /// Connected with confirmed reachability. Unknown reachability (captive
    /// portal, still probing) counts as offline.
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable == Some(true)
    }
}

/// Coarse connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn from_link(link: LinkState) -> Self {
        if link.is_online() {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

/// A change of connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityTransition {
    WentOnline,
    WentOffline,
}

/// Online/offline signal with de-duplicated transitions.
#[derive(Debug)]
pub struct NetworkMonitor {
    state: watch::Sender<ConnectivityState>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Offline)
    }
}

impl NetworkMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state }
    }

    /// Feed a platform link report. Returns the transition, if any.
    pub fn update(&self, link: LinkState) -> Option<ConnectivityTransition> {
        let next = ConnectivityState::from_link(link);
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });

        if !changed {
            return None;
        }

        let transition = match next {
            ConnectivityState::Online => ConnectivityTransition::WentOnline,
            ConnectivityState::Offline => ConnectivityTransition::WentOffline,
        };
        tracing::info!(
            is_connected = link.is_connected,
            is_internet_reachable = ?link.is_internet_reachable,
            ?transition,
            "connectivity changed"
        );
        Some(transition)
    }

    /// Mark the client as online.
    pub fn set_online(&self) -> Option<ConnectivityTransition> {
        self.update(LinkState::online())
    }

    /// Mark the client as offline.
    pub fn set_offline(&self) -> Option<ConnectivityTransition> {
        self.update(LinkState::offline())
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }
}

/// Active connectivity check run by the background worker on each poll.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> LinkState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_reachability_is_offline() {
        let link = LinkState {
            is_connected: true,
            is_internet_reachable: None,
        };
        assert!(!link.is_online());
        assert!(LinkState::online().is_online());
    }

    #[test]
    fn emits_each_transition_once() {
        let monitor = NetworkMonitor::default();
        assert!(!monitor.is_online());

        assert_eq!(monitor.set_online(), Some(ConnectivityTransition::WentOnline));
        assert_eq!(monitor.set_online(), None);
        assert_eq!(
            monitor.update(LinkState {
                is_connected: true,
                is_internet_reachable: Some(true),
            }),
            None
        );
        assert_eq!(monitor.set_offline(), Some(ConnectivityTransition::WentOffline));
        assert_eq!(monitor.set_offline(), None);
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let monitor = NetworkMonitor::default();
        let mut rx = monitor.subscribe();

        monitor.set_online();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Online);

        monitor.set_online();
        assert!(!rx.has_changed().unwrap());
    }
}
