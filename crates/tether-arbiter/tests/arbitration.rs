use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tether_arbiter::{ArbiterOptions, Arbitration, InstanceAnnouncement, InstanceArbiter, InstanceState};
use tether_core::MessageKind;
use tether_transport::native::BroadcastHub;
use tether_transport::{Channel, ChannelOptions, MessageHandler, Platform};

fn options(is_background: bool) -> ArbiterOptions {
    ArbiterOptions {
        is_background,
        ..ArbiterOptions::default()
    }
}

/// Records every announcement seen on the instance channel.
fn observer(platform: &Platform) -> (Channel, Arc<Mutex<Vec<InstanceAnnouncement>>>) {
    let channel =
        Channel::open("tether", platform, ChannelOptions::default()).expect("observer channel");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: MessageHandler = Arc::new(move |data: &Value| {
        if let Ok(ann) = serde_json::from_value::<InstanceAnnouncement>(data.clone()) {
            sink.lock().expect("observer lock").push(ann);
        }
    });
    channel
        .add_listener(MessageKind::Message, handler)
        .expect("observer listener");
    (channel, seen)
}

async fn race(
    first: (&str, u64, bool),
    second: (&str, u64, bool),
) -> (Arbitration, Arbitration) {
    let platform = Platform::window().with_native(BroadcastHub::new());
    let a = InstanceArbiter::with_identity(&platform, options(first.2), first.0, first.1)
        .expect("first arbiter");
    let b = InstanceArbiter::with_identity(&platform, options(second.2), second.0, second.1)
        .expect("second arbiter");
    let (ra, rb) = tokio::join!(a.arbitrate(), b.arbitrate());
    (ra.expect("first arbitrate"), rb.expect("second arbitrate"))
}

#[tokio::test(start_paused = true)]
async fn later_timestamp_wins_regardless_of_delivery_order() {
    let (newer, older) = race(("a", 200, false), ("b", 100, false)).await;
    assert_eq!((newer, older), (Arbitration::Won, Arbitration::Lost));

    let (older, newer) = race(("b", 100, false), ("a", 200, false)).await;
    assert_eq!((older, newer), (Arbitration::Lost, Arbitration::Won));
}

#[tokio::test(start_paused = true)]
async fn foreground_wins_over_background_irrespective_of_timestamps() {
    let (fg, bg) = race(("fg", 1, false), ("bg", 9_999, true)).await;
    assert_eq!((fg, bg), (Arbitration::Won, Arbitration::Lost));

    let (bg, fg) = race(("bg", 9_999, true), ("fg", 1, false)).await;
    assert_eq!((bg, fg), (Arbitration::Lost, Arbitration::Won));
}

#[tokio::test(start_paused = true)]
async fn loser_closes_before_winner_activates() {
    let platform = Platform::window().with_native(BroadcastHub::new());
    let (_observer, seen) = observer(&platform);

    let a = InstanceArbiter::with_identity(&platform, options(false), "A", 100).expect("A");
    let b = InstanceArbiter::with_identity(&platform, options(false), "B", 50).expect("B");
    let (ra, rb) = tokio::join!(a.arbitrate(), b.arbitrate());

    assert_eq!(ra.expect("A arbitrate"), Arbitration::Won);
    assert_eq!(rb.expect("B arbitrate"), Arbitration::Lost);
    assert_eq!(a.state(), InstanceState::Active);
    assert_eq!(b.state(), InstanceState::Closed);
    assert_eq!(a.pending_peers(), 0);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let seen = seen.lock().expect("seen").clone();
    let position = |uid: &str, state: InstanceState| {
        seen.iter()
            .position(|ann| ann.uid == uid && ann.state == state)
            .unwrap_or_else(|| panic!("{uid} never announced {state}"))
    };
    assert!(position("B", InstanceState::Closed) < position("A", InstanceState::Active));
}

#[tokio::test(start_paused = true)]
async fn newer_instance_takes_over_an_active_one() {
    let platform = Platform::window().with_native(BroadcastHub::new());
    let old = InstanceArbiter::with_identity(&platform, options(false), "old", 10).expect("old");
    assert_eq!(old.arbitrate().await.expect("old arbitrate"), Arbitration::Won);
    let mut takeover = old.watch_takeover();

    let new = InstanceArbiter::with_identity(&platform, options(false), "new", 20).expect("new");
    let (outcome, ()) = tokio::join!(new.arbitrate(), async {
        takeover.changed().await.expect("takeover signal");
        assert!(*takeover.borrow());
        assert_eq!(old.state(), InstanceState::Closing);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(new.state(), InstanceState::Start);
        old.close();
    });

    assert_eq!(outcome.expect("new arbitrate"), Arbitration::Won);
    assert_eq!(new.state(), InstanceState::Active);
    assert_eq!(old.state(), InstanceState::Closed);
}

#[tokio::test(start_paused = true)]
async fn state_watch_follows_transitions() {
    let platform = Platform::window().with_native(BroadcastHub::new());
    let arbiter = InstanceArbiter::new(&platform, options(false)).expect("arbiter");
    let states = arbiter.subscribe_state();
    assert_eq!(*states.borrow(), InstanceState::Start);

    arbiter.arbitrate().await.expect("arbitrate");
    assert_eq!(*states.borrow(), InstanceState::Active);
    arbiter.set_state(InstanceState::Closing);
    assert_eq!(*states.borrow(), InstanceState::Closing);
    arbiter.close();
    assert_eq!(*states.borrow(), InstanceState::Closed);
}

#[tokio::test(start_paused = true)]
async fn foreground_waits_for_an_active_background_instance_to_close() {
    let platform = Platform::window().with_native(BroadcastHub::new());
    let bg = InstanceArbiter::with_identity(&platform, options(true), "bg", 9_999).expect("bg");
    assert_eq!(bg.arbitrate().await.expect("bg arbitrate"), Arbitration::Won);
    let mut takeover = bg.watch_takeover();

    let fg = InstanceArbiter::with_identity(&platform, options(false), "fg", 1).expect("fg");
    let (outcome, ()) = tokio::join!(fg.arbitrate(), async {
        takeover.changed().await.expect("takeover signal");
        assert_eq!(bg.state(), InstanceState::Closing);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fg.state(), InstanceState::Start);
        assert_eq!(fg.pending_peers(), 1);
        bg.close();
    });

    assert_eq!(outcome.expect("fg arbitrate"), Arbitration::Won);
    assert_eq!(fg.state(), InstanceState::Active);
    assert_eq!(bg.state(), InstanceState::Closed);
    assert_eq!(fg.pending_peers(), 0);
}
