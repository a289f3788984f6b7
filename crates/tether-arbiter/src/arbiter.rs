use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tether_core::MessageKind;
use tether_transport::{Channel, ChannelOptions, ListenerId, MessageHandler, Platform, TransportError};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::announcement::{judge, InstanceAnnouncement, InstanceState, Verdict};

#[derive(Debug, Clone)]
pub struct ArbiterOptions {
    /// Channel every sibling instance announces itself on.
    pub channel_name: String,
    pub is_background: bool,
    /// Time allowed for competing announcements to arrive.
    pub settle_window: Duration,
    pub channel: ChannelOptions,
}

impl Default for ArbiterOptions {
    fn default() -> Self {
        Self {
            channel_name: "tether".to_string(),
            is_background: false,
            settle_window: Duration::from_millis(300),
            channel: ChannelOptions::default(),
        }
    }
}

/// Outcome of [`InstanceArbiter::arbitrate`]. Losing is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    Won,
    Lost,
}

struct ArbiterState {
    me: InstanceAnnouncement,
    wait_set: HashSet<String>,
    lost: bool,
}

struct ArbiterCore {
    channel: Channel,
    state: Mutex<ArbiterState>,
    changed: Notify,
    state_tx: watch::Sender<InstanceState>,
    takeover_tx: watch::Sender<bool>,
}

impl ArbiterCore {
    fn lock(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn announce(&self, announcement: &InstanceAnnouncement) {
        let payload = match serde_json::to_value(announcement) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(uid = %announcement.uid, "cannot encode announcement: {err}");
                return;
            }
        };
        if let Err(err) = self.channel.post_message(payload) {
            warn!(uid = %announcement.uid, state = %announcement.state, "announcement not sent: {err}");
        }
    }

    fn on_announcement(&self, data: &Value) {
        let peer: InstanceAnnouncement = match serde_json::from_value(data.clone()) {
            Ok(peer) => peer,
            Err(err) => {
                debug!("ignoring non-announcement on instance channel: {err}");
                return;
            }
        };

        let outgoing = {
            let mut st = self.lock();
            let verdict = judge(&st.me, &peer);
            debug!(uid = %st.me.uid, peer = %peer.uid, peer_state = %peer.state, ?verdict, "peer announcement");
            match verdict {
                Verdict::Ignore => None,
                Verdict::PeerClosed => {
                    st.wait_set.remove(&peer.uid);
                    None
                }
                Verdict::Wait => {
                    st.wait_set.insert(peer.uid.clone());
                    None
                }
                Verdict::Win => {
                    st.wait_set.insert(peer.uid.clone());
                    Some(st.me.clone())
                }
                Verdict::Lose => match st.me.state {
                    InstanceState::Start => {
                        info!(uid = %st.me.uid, winner = %peer.uid, "instance lost arbitration");
                        st.lost = true;
                        st.me.state = InstanceState::Closed;
                        self.state_tx.send_replace(InstanceState::Closed);
                        Some(st.me.clone())
                    }
                    InstanceState::Active => {
                        info!(uid = %st.me.uid, successor = %peer.uid, "active instance taken over");
                        st.me.state = InstanceState::Closing;
                        self.state_tx.send_replace(InstanceState::Closing);
                        self.takeover_tx.send_replace(true);
                        Some(st.me.clone())
                    }
                    InstanceState::Closing | InstanceState::Closed => None,
                },
            }
        };

        if let Some(announcement) = outgoing {
            self.announce(&announcement);
        }
        self.changed.notify_waiters();
    }

    /// Waits until `done` holds or the instance has lost.
    async fn wait_until(&self, done: impl Fn(&ArbiterState) -> bool) -> bool {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.lock();
                if st.lost {
                    return false;
                }
                if done(&st) {
                    return true;
                }
            }
            notified.await;
        }
    }
}

/// Decides, together with every sibling on the same channel, which single
/// instance may run the backend.
pub struct InstanceArbiter {
    core: Arc<ArbiterCore>,
    listener: ListenerId,
    settle_window: Duration,
}

impl InstanceArbiter {
    pub fn new(platform: &Platform, options: ArbiterOptions) -> Result<Self, TransportError> {
        let uid = Uuid::new_v4().to_string();
        let timestamp = platform.clock.now_ms();
        Self::with_identity(platform, options, uid, timestamp)
    }

    /// Builds an arbiter with a fixed uid and startup timestamp.
    pub fn with_identity(
        platform: &Platform,
        options: ArbiterOptions,
        uid: impl Into<String>,
        timestamp: u64,
    ) -> Result<Self, TransportError> {
        let channel_options = ChannelOptions {
            worker_support: false,
            ..options.channel
        };
        let channel = Channel::open(&options.channel_name, platform, channel_options)?;
        let (state_tx, _) = watch::channel(InstanceState::Start);
        let (takeover_tx, _) = watch::channel(false);
        let core = Arc::new(ArbiterCore {
            channel,
            state: Mutex::new(ArbiterState {
                me: InstanceAnnouncement {
                    uid: uid.into(),
                    state: InstanceState::Start,
                    timestamp,
                    is_background: options.is_background,
                },
                wait_set: HashSet::new(),
                lost: false,
            }),
            changed: Notify::new(),
            state_tx,
            takeover_tx,
        });

        let weak: Weak<ArbiterCore> = Arc::downgrade(&core);
        let handler: MessageHandler = Arc::new(move |data: &Value| {
            if let Some(core) = weak.upgrade() {
                core.on_announcement(data);
            }
        });
        let listener = core.channel.add_listener(MessageKind::Message, handler)?;

        Ok(Self {
            core,
            listener,
            settle_window: options.settle_window,
        })
    }

    pub fn uid(&self) -> String {
        self.core.lock().me.uid.clone()
    }

    pub fn timestamp(&self) -> u64 {
        self.core.lock().me.timestamp
    }

    pub fn state(&self) -> InstanceState {
        self.core.lock().me.state
    }

    /// Peers this instance still waits to see closed.
    pub fn pending_peers(&self) -> usize {
        self.core.lock().wait_set.len()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<InstanceState> {
        self.core.state_tx.subscribe()
    }

    /// Flips to `true` when a newer instance takes over after activation.
    pub fn watch_takeover(&self) -> watch::Receiver<bool> {
        self.core.takeover_tx.subscribe()
    }

    /// Runs the announcement protocol to completion.
    ///
    /// Returns `Won` after moving to `active`; returns `Lost` as soon as a
    /// higher-priority peer is seen or [`close`](Self::close) is called.
    pub async fn arbitrate(&self) -> Result<Arbitration, TransportError> {
        let announcement = {
            let st = self.core.lock();
            if st.lost || st.me.state != InstanceState::Start {
                return Ok(Arbitration::Lost);
            }
            st.me.clone()
        };
        info!(uid = %announcement.uid, timestamp = announcement.timestamp, background = announcement.is_background, "arbitration started");
        let payload = serde_json::to_value(&announcement)?;
        self.core.channel.post_message(payload)?;

        let settle = tokio::time::sleep(self.settle_window);
        tokio::pin!(settle);
        tokio::select! {
            _ = &mut settle => {}
            _ = self.core.wait_until(|_| false) => {}
        }

        if !self.core.wait_until(|st| st.wait_set.is_empty()).await {
            return Ok(Arbitration::Lost);
        }

        let active = {
            let mut st = self.core.lock();
            if st.lost {
                return Ok(Arbitration::Lost);
            }
            st.me.state = InstanceState::Active;
            self.core.state_tx.send_replace(InstanceState::Active);
            st.me.clone()
        };
        self.core.announce(&active);
        info!(uid = %active.uid, "instance active");
        Ok(Arbitration::Won)
    }

    /// Moves to `state` and announces it.
    pub fn set_state(&self, state: InstanceState) {
        let announcement = {
            let mut st = self.core.lock();
            if st.me.state == state || st.me.state == InstanceState::Closed {
                return;
            }
            st.me.state = state;
            self.core.state_tx.send_replace(state);
            st.me.clone()
        };
        debug!(uid = %announcement.uid, %state, "instance state changed");
        self.core.announce(&announcement);
        self.core.changed.notify_waiters();
    }

    /// Announces `closed` and leaves the channel.
    ///
    /// Closing before activation makes a pending [`arbitrate`](Self::arbitrate)
    /// return `Lost`.
    pub fn close(&self) {
        {
            let mut st = self.core.lock();
            if st.me.state == InstanceState::Start {
                st.lost = true;
            }
        }
        self.set_state(InstanceState::Closed);
        self.core.channel.remove_listener(self.listener);
        self.core.channel.close();
        self.core.changed.notify_waiters();
    }
}

impl Drop for InstanceArbiter {
    fn drop(&mut self) {
        self.close();
    }
}
