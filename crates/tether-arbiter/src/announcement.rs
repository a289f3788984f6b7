use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Start,
    Active,
    Closing,
    Closed,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

/// What an instance broadcasts about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAnnouncement {
    pub uid: String,
    pub state: InstanceState,
    pub timestamp: u64,
    pub is_background: bool,
}

impl InstanceAnnouncement {
    /// Later startup wins; equal timestamps fall back to the larger uid.
    pub fn outranks(&self, other: &InstanceAnnouncement) -> bool {
        (self.timestamp, self.uid.as_str()) > (other.timestamp, other.uid.as_str())
    }
}

/// Reaction of an instance to one peer announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing to do.
    Ignore,
    /// Peer finished shutting down; stop waiting for it.
    PeerClosed,
    /// Peer is shutting down; wait for its `closed` without re-announcing.
    Wait,
    /// Self must give way to the peer.
    Lose,
    /// Self keeps priority; wait for the peer and re-announce.
    Win,
}

/// Decides how `me` reacts to `peer`.
///
/// A `closing` or `closed` peer is always waited on or released before the
/// tie-break runs, so nobody activates while a peer still holds the backend.
pub fn judge(me: &InstanceAnnouncement, peer: &InstanceAnnouncement) -> Verdict {
    if peer.uid == me.uid || me.state.is_terminal() {
        return Verdict::Ignore;
    }
    match peer.state {
        InstanceState::Closed => return Verdict::PeerClosed,
        InstanceState::Closing => return Verdict::Wait,
        InstanceState::Start | InstanceState::Active => {}
    }
    let loses = if me.is_background != peer.is_background {
        me.is_background
    } else {
        peer.outranks(me)
    };
    if loses {
        Verdict::Lose
    } else {
        Verdict::Win
    }
}
