//! End-to-end playback scenarios driving a [`PlaybackController`]
//! against an in-memory source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use logplay_core::{
    BackfillArgs, DataRecord, Error, Initialization, IteratorArgs, MemorySource, Problem, Record,
    RecordCursor, Result, Severity, Source, Time, TopicInfo,
};
use logplay_player::{PlaybackController, PlayerConfig, PlayerSnapshot, Presence};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn rec(topic: &str, millis: u64) -> DataRecord {
    DataRecord::new(topic, Time::from_millis(millis), Bytes::from_static(b"payload"))
}

fn test_config() -> PlayerConfig {
    PlayerConfig { start_delay: Duration::from_millis(10), ..PlayerConfig::default() }
}

fn start_player(
    source: Arc<dyn Source>,
    topics: &[&str],
) -> (PlaybackController, UnboundedReceiver<PlayerSnapshot>) {
    let controller = PlaybackController::new(source, test_config()).unwrap();
    controller.set_subscriptions(topics.iter().map(|t| t.to_string()).collect());
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    controller.set_listener(tx).unwrap();
    (controller, rx)
}

async fn recv_matching(
    rx: &mut UnboundedReceiver<PlayerSnapshot>,
    records: &mut Vec<DataRecord>,
    mut pred: impl FnMut(&PlayerSnapshot) -> bool,
) -> PlayerSnapshot {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            let snapshot = rx.recv().await.expect("player dropped its listener");
            records.extend(snapshot.records.iter().cloned());
            if pred(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("expected snapshot never arrived")
}

fn drain(rx: &mut UnboundedReceiver<PlayerSnapshot>) -> Vec<PlayerSnapshot> {
    let mut out = Vec::new();
    while let Ok(s) = rx.try_recv() {
        out.push(s);
    }
    out
}

#[tokio::test]
async fn initializes_and_primes_the_first_frame() {
    let source = MemorySource::new(
        Time::from_millis(0),
        Time::from_millis(1000),
        vec![rec("/a", 0), rec("/a", 50), rec("/a", 500)],
    )
    .with_init_problem(Problem::new(Severity::Warn, "index rebuilt"));
    let (controller, mut rx) = start_player(Arc::new(source), &["/a"]);

    let mut records = Vec::new();
    let snapshot = recv_matching(&mut rx, &mut records, |s| {
        s.presence == Presence::Present && s.current_time == Some(Time::from_millis(99))
    })
    .await;

    assert_eq!(snapshot.start, Some(Time::from_millis(0)));
    assert_eq!(snapshot.end, Some(Time::from_millis(1000)));
    assert!(!snapshot.is_playing);
    assert!(snapshot.topics.iter().any(|t: &TopicInfo| t.name == "/a"));
    assert!(snapshot.problems.iter().any(|p| p.message == "index rebuilt"));
    // Only records inside the priming window became current.
    let times: Vec<Time> = records.iter().map(|r| r.time).collect();
    assert_eq!(times, vec![Time::from_millis(0), Time::from_millis(50)]);

    controller.close();
    controller.wait_closed().await;
}

#[tokio::test]
async fn plays_to_the_end_and_returns_to_idle() {
    let end = Time::from_millis(200);
    let source = MemorySource::new(
        Time::from_millis(0),
        end,
        (0..=4).map(|i| rec("/a", i * 50)).collect(),
    );
    let (controller, mut rx) = start_player(Arc::new(source), &["/a"]);

    let mut records = Vec::new();
    recv_matching(&mut rx, &mut records, |s| s.presence == Presence::Present).await;
    controller.play();

    let mut last_time = Time::MIN;
    let finished = recv_matching(&mut rx, &mut records, |s| {
        if let Some(t) = s.current_time {
            assert!(t >= last_time, "current time went backwards");
            last_time = t;
        }
        s.current_time == Some(end) && !s.is_playing
    })
    .await;
    assert_eq!(finished.presence, Presence::Present);

    // Every record was delivered exactly once, in order.
    let times: Vec<Time> = records.iter().map(|r| r.time).collect();
    assert_eq!(
        times,
        (0..=4).map(|i| Time::from_millis(i * 50)).collect::<Vec<_>>()
    );

    controller.close();
    controller.wait_closed().await;
}

#[tokio::test]
async fn pause_freezes_the_position() {
    let source = MemorySource::new(
        Time::from_millis(0),
        Time::from_secs(60),
        (0..600).map(|i| rec("/a", i * 100)).collect(),
    );
    let (controller, mut rx) = start_player(Arc::new(source), &["/a"]);

    let mut records = Vec::new();
    recv_matching(&mut rx, &mut records, |s| s.presence == Presence::Present).await;
    controller.play();
    recv_matching(&mut rx, &mut records, |s| s.is_playing).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.pause();

    let paused = recv_matching(&mut rx, &mut records, |s| !s.is_playing).await;
    let frozen = paused.current_time;
    tokio::time::sleep(Duration::from_millis(300)).await;
    for s in drain(&mut rx) {
        assert_eq!(s.current_time, frozen, "position moved while paused");
    }

    controller.close();
    controller.wait_closed().await;
}

#[tokio::test]
async fn resumes_after_a_rapid_play_pause() {
    let source = MemorySource::new(
        Time::from_millis(0),
        Time::from_secs(60),
        (0..600).map(|i| rec("/a", i * 100)).collect(),
    );
    let (controller, mut rx) = start_player(Arc::new(source), &["/a"]);

    let mut records = Vec::new();
    recv_matching(&mut rx, &mut records, |s| s.presence == Presence::Present).await;
    controller.play();
    controller.pause();
    // Let the driver enter and leave the cancelled play first.
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.play();

    recv_matching(&mut rx, &mut records, |s| {
        s.is_playing && s.current_time.is_some_and(|t| t > Time::from_millis(99))
    })
    .await;

    controller.close();
    controller.wait_closed().await;
}

#[tokio::test]
async fn seeking_to_the_current_position_resolves() {
    let source = MemorySource::new(
        Time::from_millis(0),
        Time::from_millis(1000),
        vec![rec("/a", 10)],
    );
    let (controller, mut rx) = start_player(Arc::new(source), &["/a"]);

    let mut records = Vec::new();
    recv_matching(&mut rx, &mut records, |s| {
        s.presence == Presence::Present && s.current_time == Some(Time::from_millis(99))
    })
    .await;

    // The position has not moved, but the seek must still resolve
    // with a backfilled snapshot.
    controller.seek(Time::from_millis(99));
    let mut backfilled = Vec::new();
    let resolved = recv_matching(&mut rx, &mut backfilled, |s| !s.records.is_empty()).await;
    assert_eq!(resolved.current_time, Some(Time::from_millis(99)));
    assert_eq!(resolved.records[0].time, Time::from_millis(10));

    controller.close();
    controller.wait_closed().await;
}

#[tokio::test]
async fn seek_resolves_with_backfilled_records() {
    let source = MemorySource::new(
        Time::from_millis(0),
        Time::from_millis(1000),
        vec![rec("/a", 10), rec("/b", 20), rec("/a", 300)],
    );
    let (controller, mut rx) = start_player(Arc::new(source), &["/a", "/b"]);

    let mut records = Vec::new();
    recv_matching(&mut rx, &mut records, |s| s.presence == Presence::Present).await;
    controller.seek(Time::from_millis(500));

    let mut backfilled = Vec::new();
    let resolved = recv_matching(&mut rx, &mut backfilled, |s| {
        s.current_time == Some(Time::from_millis(500)) && !s.records.is_empty()
    })
    .await;
    assert_eq!(resolved.presence, Presence::Present);
    let times: Vec<Time> = resolved.records.iter().map(|r| r.time).collect();
    assert_eq!(times, vec![Time::from_millis(20), Time::from_millis(300)]);

    controller.close();
    controller.wait_closed().await;
}

#[tokio::test]
async fn rapid_seeks_resolve_only_the_last_target() {
    let source = MemorySource::new(
        Time::from_millis(0),
        Time::from_millis(1000),
        vec![rec("/a", 100), rec("/a", 600)],
    );
    source.set_backfill_delay(Duration::from_millis(150));
    let source = Arc::new(source);
    let (controller, mut rx) = start_player(source.clone(), &["/a"]);

    let mut records = Vec::new();
    recv_matching(&mut rx, &mut records, |s| {
        s.presence == Presence::Present && s.current_time.is_some()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    drain(&mut rx);

    controller.seek(Time::from_millis(300));
    tokio::time::sleep(Duration::from_millis(10)).await;
    controller.seek(Time::from_millis(700));

    let mut resolved_records = Vec::new();
    let resolved = recv_matching(&mut rx, &mut resolved_records, |s| !s.records.is_empty()).await;
    // The superseded 300ms seek never produced records.
    assert_eq!(resolved.current_time, Some(Time::from_millis(700)));
    assert_eq!(resolved.records[0].time, Time::from_millis(600));

    controller.close();
    controller.wait_closed().await;
}

#[tokio::test]
async fn adding_a_subscription_while_idle_backfills_it() {
    let source = MemorySource::new(
        Time::from_millis(0),
        Time::from_millis(1000),
        vec![rec("/a", 10), rec("/b", 20)],
    );
    let (controller, mut rx) = start_player(Arc::new(source), &["/a"]);

    let mut records = Vec::new();
    recv_matching(&mut rx, &mut records, |s| {
        s.presence == Presence::Present && s.current_time == Some(Time::from_millis(99))
    })
    .await;

    controller.set_subscriptions(vec!["/a".into(), "/b".into()]);
    let mut backfilled = Vec::new();
    recv_matching(&mut rx, &mut backfilled, |s| {
        s.records.iter().any(|r| r.topic == "/b")
    })
    .await;
    assert!(backfilled.iter().any(|r| r.time == Time::from_millis(20)));

    controller.close();
    controller.wait_closed().await;
}

#[tokio::test]
async fn listener_can_only_be_registered_once() {
    let source = Arc::new(MemorySource::new(Time::MIN, Time::from_secs(1), vec![]));
    let controller = PlaybackController::new(source, test_config()).unwrap();
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    controller.set_listener(tx).unwrap();
    let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel();
    assert!(controller.set_listener(tx2).is_err());
    controller.close();
    controller.wait_closed().await;
}

/// A source whose reads fail after a successful initialization.
struct BrokenSource;

struct BrokenCursor;

#[async_trait]
impl RecordCursor for BrokenCursor {
    async fn next(&mut self) -> Result<Option<Record>> {
        Err(Error::source("read failed: device gone"))
    }
}

#[async_trait]
impl Source for BrokenSource {
    async fn initialize(&self) -> Result<Initialization> {
        Ok(Initialization {
            start: Time::from_millis(0),
            end: Time::from_millis(1000),
            topics: vec![TopicInfo { name: "/a".into(), schema_name: None }],
            topic_stats: Default::default(),
            problems: vec![],
        })
    }

    fn message_iterator(&self, _args: IteratorArgs) -> Box<dyn RecordCursor> {
        Box::new(BrokenCursor)
    }

    async fn get_backfill_messages(&self, _args: BackfillArgs) -> Result<Vec<DataRecord>> {
        Ok(vec![])
    }
}

#[tokio::test]
async fn read_errors_are_terminal_but_close_still_works() {
    let (controller, mut rx) = start_player(Arc::new(BrokenSource), &["/a"]);

    let mut records = Vec::new();
    let failed = recv_matching(&mut rx, &mut records, |s| s.presence == Presence::Error).await;
    assert!(failed.problems.iter().any(|p| p.message.contains("device gone")));
    assert!(!failed.is_playing);

    // Commands after a fatal error only re-emit the error snapshot.
    controller.play();
    let again = recv_matching(&mut rx, &mut records, |s| s.presence == Presence::Error).await;
    assert!(!again.problems.is_empty());

    controller.close();
    controller.wait_closed().await;
}
