mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Connection, RecordingCache, Refresh, Script, ScriptedEvents, TASK_REGIONS};
use kaji_core::CacheRegion;
use kaji_sync::{Backoff, Coalescer, StreamHandle, StreamState, StreamStatus};

const WINDOW: Duration = Duration::from_millis(300);

struct Harness {
    events: Arc<ScriptedEvents>,
    cache: Arc<RecordingCache>,
    coalescer: Coalescer,
    stream: StreamHandle,
}

impl Harness {
    fn start(connections: Vec<Connection>) -> Self {
        let events = ScriptedEvents::new(connections);
        let cache = RecordingCache::new();
        let coalescer = Coalescer::spawn(cache.clone(), WINDOW);
        let stream = StreamHandle::spawn(events.clone(), coalescer.handle(), Backoff::default());
        Self {
            events,
            cache,
            coalescer,
            stream,
        }
    }

    async fn shutdown(mut self) {
        self.stream.stop().await;
        self.coalescer.shutdown().await;
    }
}

#[tokio::test(start_paused = true, flavor = "current_thread")]
async fn in_order_event_refreshes_task_regions_then_gap_refreshes_everything() {
    let harness = Harness::start(vec![Script::new()
        .connected(42)
        .changed(43, "task")
        .pause(Duration::from_secs(1))
        .changed(46, "task")
        .then_hold()]);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(harness.cache.calls(), TASK_REGIONS.to_vec());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut expected = TASK_REGIONS.to_vec();
    expected.push(Refresh::All);
    assert_eq!(harness.cache.calls(), expected, "gap must not refresh task regions only");
    assert_eq!(
        harness.stream.status(),
        StreamStatus {
            state: StreamState::Connected,
            last_seen: 46
        }
    );
    harness.shutdown().await;
}

#[tokio::test(start_paused = true, flavor = "current_thread")]
async fn gap_discards_pending_partial_set() {
    let harness = Harness::start(vec![Script::new()
        .connected(10)
        .changed(11, "task")
        .changed(13, "penalty_rule")
        .then_hold()]);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.cache.calls(), vec![Refresh::All]);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true, flavor = "current_thread")]
async fn duplicate_and_stale_revisions_are_ignored() {
    let harness = Harness::start(vec![Script::new()
        .connected(20)
        .changed(20, "task")
        .changed(19, "invite")
        .changed(21, "penalty_rule")
        .changed(21, "penalty_rule")
        .then_hold()]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        harness.cache.calls(),
        vec![
            Refresh::Region(CacheRegion::PenaltyRules),
            Refresh::Region(CacheRegion::MonthlySummary),
        ]
    );
    assert_eq!(harness.stream.status().last_seen, 21);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true, flavor = "current_thread")]
async fn malformed_messages_are_dropped_without_consuming_a_revision() {
    let harness = Harness::start(vec![Script::new()
        .connected(1)
        .event("team-state-changed", "{not json")
        .event("team-state-changed", r#"{"entity":"task"}"#)
        .event("presence", r#"{"revision":2}"#)
        .raw(": keep-alive")
        .raw("")
        .event("heartbeat", r#"{"at":"2026-10-16T09:00:25Z"}"#)
        .changed(2, "invite")
        .then_hold()]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        harness.cache.calls(),
        vec![
            Refresh::Region(CacheRegion::Profile),
            Refresh::Region(CacheRegion::TeamMembers),
            Refresh::Region(CacheRegion::CurrentInvite),
        ]
    );
    assert_eq!(harness.stream.status().state, StreamState::Connected);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true, flavor = "current_thread")]
async fn reconnect_delays_double_and_reset_after_connected() {
    let harness = Harness::start(vec![
        Connection::Refused,
        Connection::Refused,
        Connection::Refused,
        Script::new().connected(1).then_close(),
        Script::new().connected(1).then_hold(),
    ]);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(harness.events.gaps_secs(), vec![1, 2, 4, 1]);
    assert_eq!(harness.stream.status().state, StreamState::Connected);
    assert_eq!(harness.cache.full_refreshes(), 0, "same revision across epochs");
    harness.shutdown().await;
}

#[tokio::test(start_paused = true, flavor = "current_thread")]
async fn backoff_is_capped_and_never_gives_up() {
    let harness = Harness::start(Vec::new());

    tokio::time::sleep(Duration::from_secs(200)).await;
    let gaps = harness.events.gaps_secs();
    assert_eq!(&gaps[..7], &[1, 2, 4, 8, 16, 30, 30]);
    assert!(gaps.iter().all(|gap| *gap <= 30));
    assert_eq!(harness.stream.status().state, StreamState::ReconnectScheduled);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true, flavor = "current_thread")]
async fn revision_moved_while_disconnected_forces_resync() {
    let harness = Harness::start(vec![
        Script::new()
            .connected(5)
            .changed(6, "task")
            .pause(Duration::from_secs(1))
            .then_fail(),
        Script::new().connected(9).then_hold(),
    ]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let mut expected = TASK_REGIONS.to_vec();
    expected.push(Refresh::All);
    assert_eq!(harness.cache.calls(), expected);
    assert_eq!(harness.stream.status().last_seen, 9);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true, flavor = "current_thread")]
async fn reconnect_at_same_revision_does_not_resync() {
    let harness = Harness::start(vec![
        Script::new()
            .connected(5)
            .changed(6, "task")
            .pause(Duration::from_secs(1))
            .then_fail(),
        Script::new().connected(6).changed(7, "task").then_hold(),
    ]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let mut expected = TASK_REGIONS.to_vec();
    expected.extend(TASK_REGIONS);
    assert_eq!(harness.cache.calls(), expected);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true, flavor = "current_thread")]
async fn stop_cancels_pending_reconnect_and_is_idempotent() {
    let mut harness = Harness::start(Vec::new());

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(harness.events.opens().len(), 2);

    harness.stream.stop().await;
    harness.stream.stop().await;
    assert_eq!(
        harness.stream.status(),
        StreamStatus {
            state: StreamState::Disconnected,
            last_seen: 0
        }
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.events.opens().len(), 2, "no attempts after stop");
    harness.shutdown().await;
}
