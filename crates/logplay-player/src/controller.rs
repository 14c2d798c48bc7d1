//! Playback Controller
//!
//! Owns the whole pipeline: a [`ReadAheadBuffer`] for interactive
//! reads, an optional [`BlockPreloader`] sweeping the full log, and a
//! driver task running the playback state machine. Snapshots flow to a
//! single listener channel.
//!
//! ```text
//!  Init ──> LoadMetadata ──> PrimeFirstFrame ──> Idle <────> Play
//!                                  │              ▲            │
//!                            seek()│       resume │      seek()│
//!                                  ▼              │  topics    ▼
//!                                  SeekBackfill ──┴── ResetIterator
//!
//!  any state ── error ──> Errored        close() ──> Close (final)
//! ```
//!
//! ## Command / driver split
//!
//! Commands (`play`, `pause`, `seek`, ...) are plain non-async methods
//! callable from anywhere. They mutate a small shared section and
//! request a state; the driver task owns everything else. A request
//! overwrites any not-yet-started request (last one wins) and cancels
//! the running state's token, so a long-running state yields at its
//! next suspension point. `Close` can never be overridden, and after
//! an error only `Close` does anything.
//!
//! ## Ticks
//!
//! While playing, each tick advances the window by elapsed wall time
//! times speed, capped at 300 ms and exponentially smoothed (0.9 of
//! the previous window, 0.1 of the new). The first tick after a resume
//! uses a 20 ms window. The loop is paced to at least 16 ms per frame;
//! a tick that stalls past 500 ms flips presence to Buffering until
//! the read completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use logplay_core::{
    BackfillArgs, ConsumptionHint, Error, IteratorArgs, Problem, ProblemStore, Record, Result,
    Severity, Source, Time, TopicInfo,
};

use crate::config::PlayerConfig;
use crate::preloader::{BlockPreloader, PreloadProgress};
use crate::read_ahead::{ReadAheadBuffer, ReadAheadIterator};
use crate::snapshot::{PlayerSnapshot, Presence, Progress};

const FIRST_TICK_MS: f64 = 20.0;
const MAX_TICK_MS: f64 = 300.0;
const TICK_SMOOTHING: f64 = 0.9;
const FRAME_DURATION: Duration = Duration::from_millis(16);
const SEEK_ACK_DELAY: Duration = Duration::from_millis(100);
const PRIME_ACK_DELAY: Duration = Duration::from_millis(100);
const TICK_STALL: Duration = Duration::from_millis(500);
const IDLE_RANGE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    LoadMetadata,
    PrimeFirstFrame,
    Idle,
    Play,
    SeekBackfill,
    ResetIterator,
    Close,
    Errored,
}

#[derive(Default)]
struct TickTracker {
    last_tick: Option<Instant>,
    smoothed_window_ms: Option<f64>,
}

#[derive(Default)]
struct TopicSet {
    all: Vec<String>,
    /// Bumped on every change; the play loop compares generations.
    generation: u64,
}

struct ControlShared {
    next_state: StdMutex<Option<State>>,
    current_state: StdMutex<State>,
    wake: Notify,
    /// Idle-state re-emit requests (pause, speed changes).
    emit_request: Notify,
    /// Token of the currently running state, cancelled on any request.
    abort: StdMutex<Option<CancellationToken>>,
    listener: StdMutex<Option<UnboundedSender<PlayerSnapshot>>>,
    is_playing: AtomicBool,
    speed: StdMutex<f64>,
    seek_target: StdMutex<Option<Time>>,
    current_time: StdMutex<Option<Time>>,
    bounds: StdMutex<Option<(Time, Time)>>,
    topics: StdMutex<TopicSet>,
    tick: StdMutex<TickTracker>,
    preloader: StdMutex<Option<Arc<BlockPreloader>>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl ControlShared {
    fn request_state(&self, state: State) {
        {
            let mut next = lock(&self.next_state);
            if *next == Some(State::Close) {
                return;
            }
            debug!(state = ?state, "state requested");
            *next = Some(state);
        }
        if let Some(token) = lock(&self.abort).take() {
            token.cancel();
        }
        self.wake.notify_one();
    }

    fn pending(&self) -> bool {
        lock(&self.next_state).is_some()
    }

    fn reset_tick(&self) {
        let mut tick = lock(&self.tick);
        tick.last_tick = None;
        tick.smoothed_window_ms = None;
    }
}

/// Handle to a running player. Commands are cheap and non-blocking;
/// all work happens on the driver task spawned by [`new`](Self::new)
/// (which therefore must be called within a tokio runtime).
pub struct PlaybackController {
    shared: Arc<ControlShared>,
}

impl PlaybackController {
    pub fn new(source: Arc<dyn Source>, config: PlayerConfig) -> Result<Self> {
        let buffer = Arc::new(ReadAheadBuffer::new(
            source.clone(),
            &config.cache,
            &config.read_ahead,
        )?);
        let shared = Arc::new(ControlShared {
            next_state: StdMutex::new(Some(State::Init)),
            current_state: StdMutex::new(State::Init),
            wake: Notify::new(),
            emit_request: Notify::new(),
            abort: StdMutex::new(None),
            listener: StdMutex::new(None),
            is_playing: AtomicBool::new(false),
            speed: StdMutex::new(1.0),
            seek_target: StdMutex::new(None),
            current_time: StdMutex::new(None),
            bounds: StdMutex::new(None),
            topics: StdMutex::new(TopicSet::default()),
            tick: StdMutex::new(TickTracker::default()),
            preloader: StdMutex::new(None),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        let driver = Driver {
            source,
            buffer,
            shared: shared.clone(),
            config,
            problems: Arc::new(ProblemStore::new()),
            start: None,
            end: None,
            topics: Vec::new(),
            current_time: None,
            iterator: None,
            saved_record: None,
            records: Vec::new(),
            presence: Presence::Initializing,
            progress: Progress::default(),
            preloader: None,
            preload_task: None,
            progress_rx: None,
            has_error: false,
        };
        tokio::spawn(driver.run());
        Ok(PlaybackController { shared })
    }

    /// Registers the snapshot channel and starts loading. May only be
    /// called once.
    pub fn set_listener(&self, listener: UnboundedSender<PlayerSnapshot>) -> Result<()> {
        {
            let mut slot = lock(&self.shared.listener);
            if slot.is_some() {
                return Err(Error::invariant("listener already registered"));
            }
            *slot = Some(listener);
        }
        self.shared.request_state(State::LoadMetadata);
        Ok(())
    }

    pub fn play(&self) {
        if lock(&self.shared.bounds).is_none() {
            return;
        }
        if self.shared.is_playing.swap(true, Ordering::SeqCst) {
            return;
        }
        let current = *lock(&self.shared.current_state);
        let next = *lock(&self.shared.next_state);
        let startable = match next {
            // A parked driver only re-checks state on a request, so a
            // resting Idle or Play must be restarted explicitly.
            None => matches!(current, State::Idle | State::Play),
            Some(State::Idle) => true,
            Some(_) => false,
        };
        if startable {
            self.shared.request_state(State::Play);
        } else {
            // Another state is in flight; it will land in Play itself.
            self.shared.emit_request.notify_one();
        }
    }

    pub fn pause(&self) {
        if !self.shared.is_playing.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.reset_tick();
        if *lock(&self.shared.current_state) == State::Play {
            self.shared.request_state(State::Idle);
        } else {
            self.shared.emit_request.notify_one();
        }
    }

    pub fn set_speed(&self, speed: f64) {
        *lock(&self.shared.speed) = speed;
        lock(&self.shared.tick).smoothed_window_ms = None;
        self.shared.emit_request.notify_one();
    }

    /// Jumps to `time` (clamped to the log bounds). Seeks issued before
    /// initialization are applied once metadata is loaded; rapid seeks
    /// cancel each other and only the last one resolves.
    pub fn seek(&self, time: Time) {
        let Some((start, end)) = *lock(&self.shared.bounds) else {
            *lock(&self.shared.seek_target) = Some(time);
            debug!(target = %time, "seek stored until metadata loads");
            return;
        };
        let target = time.clamp(start, end);
        if *lock(&self.shared.seek_target) == Some(target) {
            return;
        }
        *lock(&self.shared.seek_target) = Some(target);
        self.shared.reset_tick();
        self.shared.request_state(State::SeekBackfill);
    }

    /// Replaces the subscribed topic set. While playing, the iterator
    /// is rebuilt mid-stream; while paused, the current frame is
    /// backfilled so new topics show data immediately.
    pub fn set_subscriptions(&self, mut topics: Vec<String>) {
        topics.sort();
        topics.dedup();
        {
            let mut set = lock(&self.shared.topics);
            if set.all == topics {
                return;
            }
            set.all = topics.clone();
            set.generation += 1;
        }
        if let Some(preloader) = lock(&self.shared.preloader).clone() {
            preloader.set_topics(topics);
        }
        if !self.shared.is_playing.load(Ordering::SeqCst) {
            if let Some(current) = *lock(&self.shared.current_time) {
                let mut target = lock(&self.shared.seek_target);
                if target.is_none() {
                    *target = Some(current);
                }
                drop(target);
                self.shared.reset_tick();
                self.shared.request_state(State::SeekBackfill);
            }
        }
    }

    pub fn close(&self) {
        self.shared.request_state(State::Close);
    }

    /// Resolves once the driver task has fully shut down.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.shared.close_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

struct Driver {
    source: Arc<dyn Source>,
    buffer: Arc<ReadAheadBuffer>,
    shared: Arc<ControlShared>,
    config: PlayerConfig,
    problems: Arc<ProblemStore>,
    start: Option<Time>,
    end: Option<Time>,
    topics: Vec<TopicInfo>,
    current_time: Option<Time>,
    iterator: Option<ReadAheadIterator>,
    /// Record read past the last tick window, replayed next tick.
    saved_record: Option<Record>,
    records: Vec<Record>,
    presence: Presence,
    progress: Progress,
    preloader: Option<Arc<BlockPreloader>>,
    preload_task: Option<tokio::task::JoinHandle<()>>,
    progress_rx: Option<UnboundedReceiver<PreloadProgress>>,
    has_error: bool,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let Some(state) = lock(&self.shared.next_state).take() else {
                self.shared.wake.notified().await;
                continue;
            };
            *lock(&self.shared.current_state) = state;
            debug!(state = ?state, "entering state");

            if self.has_error && state != State::Close {
                self.emit();
                continue;
            }
            if !matches!(state, State::Idle | State::Play) && self.iterator.take().is_some() {
                debug!("dropped playback iterator");
            }

            let result = match state {
                State::Init => {
                    self.emit();
                    Ok(())
                }
                State::LoadMetadata => self.state_load_metadata().await,
                State::PrimeFirstFrame => self.state_prime_first_frame().await,
                State::Idle => self.state_idle().await,
                State::Play => self.state_play().await,
                State::SeekBackfill => self.state_seek_backfill().await,
                State::ResetIterator => self.state_reset_iterator().await,
                State::Close => {
                    self.state_close().await;
                    break;
                }
                // Never requested; recorded only after a failure.
                State::Errored => Ok(()),
            };
            if let Err(e) = result {
                self.enter_error(e);
            }
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.close_notify.notify_waiters();
    }

    fn enter_error(&mut self, e: Error) {
        error!(error = %e, "playback failed");
        self.has_error = true;
        self.presence = Presence::Error;
        self.shared.is_playing.store(false, Ordering::SeqCst);
        *lock(&self.shared.current_state) = State::Errored;
        self.problems.insert("fatal", Problem::new(Severity::Error, e.to_string()));
        self.emit();
    }

    fn emit(&mut self) {
        let Some(listener) = lock(&self.shared.listener).clone() else {
            return;
        };
        *lock(&self.shared.current_time) = self.current_time;
        let mut records = Vec::new();
        for record in std::mem::take(&mut self.records) {
            match record {
                Record::Data(d) => records.push(d),
                Record::Problem(p) => {
                    self.problems.insert(p.message.clone(), p);
                }
            }
        }
        let snapshot = PlayerSnapshot {
            presence: self.presence,
            start: self.start,
            end: self.end,
            current_time: self.current_time,
            is_playing: self.shared.is_playing.load(Ordering::SeqCst),
            speed: *lock(&self.shared.speed),
            records,
            progress: self.progress.clone(),
            problems: self.problems.snapshot(),
            topics: self.topics.clone(),
        };
        let _ = listener.send(snapshot);
    }

    fn bounds(&self) -> Result<(Time, Time)> {
        self.start
            .zip(self.end)
            .ok_or_else(|| Error::invariant("metadata not loaded"))
    }

    fn subscribed(&self) -> Vec<String> {
        lock(&self.shared.topics).all.clone()
    }

    async fn state_load_metadata(&mut self) -> Result<()> {
        self.presence = Presence::Initializing;
        self.emit();

        let init = self.buffer.initialize().await?;
        debug!(start = %init.start, end = %init.end, topics = init.topics.len(), "metadata loaded");
        self.start = Some(init.start);
        self.end = Some(init.end);
        *lock(&self.shared.bounds) = Some((init.start, init.end));
        {
            // A seek stored before initialization can now be clamped.
            let mut target = lock(&self.shared.seek_target);
            if let Some(t) = *target {
                *target = Some(t.clamp(init.start, init.end));
            }
        }
        let stored_seek = *lock(&self.shared.seek_target);
        self.current_time = Some(stored_seek.unwrap_or(init.start));

        let mut topics: Vec<TopicInfo> = Vec::new();
        for topic in init.topics {
            if topics.iter().any(|t| t.name == topic.name) {
                self.problems.insert(
                    format!("duplicate-topic:{}", topic.name),
                    Problem::new(
                        Severity::Warn,
                        format!("source advertises topic {} more than once", topic.name),
                    ),
                );
                continue;
            }
            topics.push(topic);
        }
        self.topics = topics;
        for (i, problem) in init.problems.into_iter().enumerate() {
            self.problems.insert(format!("init:{i}"), problem);
        }

        if self.config.enable_preload {
            match BlockPreloader::new(
                self.source.clone(),
                self.problems.clone(),
                init.start,
                init.end,
                &self.config.preload,
            ) {
                Ok(preloader) => {
                    let preloader = Arc::new(preloader);
                    self.preloader = Some(preloader.clone());
                    *lock(&self.shared.preloader) = Some(preloader);
                }
                Err(e) => {
                    warn!(error = %e, "preloader unavailable");
                    self.problems
                        .insert("preload", Problem::new(Severity::Warn, e.to_string()));
                }
            }
        }

        self.presence = Presence::Present;
        self.emit();
        // Give subscribers a beat to attach before reading data.
        tokio::time::sleep(self.config.start_delay).await;

        if let Some(preloader) = &self.preloader {
            preloader.set_topics(self.subscribed());
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            self.progress_rx = Some(rx);
            let task_preloader = preloader.clone();
            let task_problems = self.problems.clone();
            self.preload_task = Some(tokio::spawn(async move {
                if let Err(e) = task_preloader.start(move |p| { let _ = tx.send(p); }).await {
                    error!(error = %e, "preload loop failed");
                    task_problems.insert("preload", Problem::new(Severity::Error, e.to_string()));
                }
            }));
        }

        self.shared.request_state(State::PrimeFirstFrame);
        Ok(())
    }

    async fn state_prime_first_frame(&mut self) -> Result<()> {
        let (start, end) = self.bounds()?;
        if lock(&self.shared.seek_target).is_some() {
            // An early seek replaces the initial frame entirely.
            self.shared.request_state(State::SeekBackfill);
            return Ok(());
        }
        let stop_time = start.saturating_add(self.config.prime_lookahead).min(end);
        if self.iterator.is_some() {
            return Err(Error::invariant("playback iterator already open"));
        }
        debug!(until = %stop_time, "priming first frame");
        let mut iterator = self
            .buffer
            .iterate(IteratorArgs {
                topics: self.subscribed(),
                start: Some(start),
                end: None,
                hint: ConsumptionHint::Partial,
            })
            .await?;

        self.saved_record = None;
        let mut collected: Vec<Record> = Vec::new();
        let ack = tokio::time::sleep(PRIME_ACK_DELAY);
        tokio::pin!(ack);
        let mut slow = false;
        let outcome = loop {
            tokio::select! {
                _ = &mut ack, if !slow => {
                    slow = true;
                    self.presence = Presence::Buffering;
                    self.emit();
                }
                next = iterator.next() => match next {
                    Err(e) => break Err(e),
                    Ok(None) => break Ok(()),
                    Ok(Some(record)) => {
                        if self.shared.pending() {
                            break Ok(());
                        }
                        match record.time() {
                            Some(t) if t > stop_time => {
                                self.saved_record = Some(record);
                                break Ok(());
                            }
                            _ => collected.push(record),
                        }
                    }
                }
            }
        };
        self.iterator = Some(iterator);
        outcome?;
        if self.shared.pending() {
            return Ok(());
        }

        self.records = collected;
        self.current_time = Some(stop_time);
        self.presence = Presence::Present;
        self.emit();
        if !self.shared.pending() {
            // A play() issued while priming carries straight into Play.
            self.shared.request_state(self.resume_state());
        }
        Ok(())
    }

    async fn state_idle(&mut self) -> Result<()> {
        self.shared.is_playing.store(false, Ordering::SeqCst);
        self.presence = Presence::Present;
        self.refresh_buffer_progress().await;
        self.emit();

        let token = CancellationToken::new();
        *lock(&self.shared.abort) = Some(token.clone());

        let shared = self.shared.clone();
        let mut progress_rx = self.progress_rx.take();
        let mut poll = tokio::time::interval(IDLE_RANGE_POLL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        poll.tick().await;

        enum Wake {
            Cancelled,
            EmitRequest,
            Preload(Option<PreloadProgress>),
            RangePoll,
        }
        loop {
            let progress = async {
                match progress_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };
            let wake = tokio::select! {
                _ = token.cancelled() => Wake::Cancelled,
                _ = shared.emit_request.notified() => Wake::EmitRequest,
                update = progress => Wake::Preload(update),
                _ = poll.tick() => Wake::RangePoll,
            };
            match wake {
                Wake::Cancelled => break,
                Wake::EmitRequest => self.emit(),
                Wake::Preload(Some(p)) => {
                    self.apply_preload_progress(p);
                    self.emit();
                }
                Wake::Preload(None) => progress_rx = None,
                Wake::RangePoll => {
                    let before = self.progress.clone();
                    self.refresh_buffer_progress().await;
                    if self.progress != before {
                        self.emit();
                    }
                }
            }
        }
        self.progress_rx = progress_rx;
        *lock(&self.shared.abort) = None;
        Ok(())
    }

    async fn state_play(&mut self) -> Result<()> {
        self.presence = Presence::Present;
        let generation = lock(&self.shared.topics).generation;
        while self.shared.is_playing.load(Ordering::SeqCst) && !self.shared.pending() {
            let (_, end) = self.bounds()?;
            let current = self
                .current_time
                .ok_or_else(|| Error::invariant("playing without a current time"))?;
            if current >= end {
                debug!("end of log");
                self.shared.reset_tick();
                self.shared.request_state(State::Idle);
                return Ok(());
            }

            let frame_start = Instant::now();
            self.tick().await?;
            if self.shared.pending() {
                return Ok(());
            }
            self.refresh_buffer_progress().await;
            if let Some(rx) = self.progress_rx.as_mut() {
                while let Ok(p) = rx.try_recv() {
                    self.progress.preloaded_ranges = p.fully_loaded_ranges;
                    self.progress.preloaded_bytes = p.preloaded_bytes;
                }
            }
            if let (Some(preloader), Some(t)) = (&self.preloader, self.current_time) {
                preloader.set_active_time(t);
            }
            if lock(&self.shared.topics).generation != generation {
                self.saved_record = None;
                self.shared.request_state(State::ResetIterator);
                return Ok(());
            }

            let elapsed = frame_start.elapsed();
            if elapsed < FRAME_DURATION {
                tokio::time::sleep(FRAME_DURATION - elapsed).await;
            }
        }
        if !self.shared.pending() {
            // A pause that landed before this state was entered leaves
            // no successor queued; the driver must not park here.
            self.shared.request_state(State::Idle);
        }
        Ok(())
    }

    async fn tick(&mut self) -> Result<()> {
        let (start, end) = self.bounds()?;
        let speed = *lock(&self.shared.speed);
        let window_ms = {
            let mut tick = lock(&self.shared.tick);
            let now = Instant::now();
            let elapsed_ms = tick
                .last_tick
                .map(|t| now.duration_since(t).as_secs_f64() * 1000.0)
                .unwrap_or(FIRST_TICK_MS);
            tick.last_tick = Some(now);
            let mut window = (elapsed_ms * speed).min(MAX_TICK_MS);
            if let Some(prev) = tick.smoothed_window_ms {
                window = prev * TICK_SMOOTHING + window * (1.0 - TICK_SMOOTHING);
            }
            tick.smoothed_window_ms = Some(window);
            window
        };
        let current = self
            .current_time
            .ok_or_else(|| Error::invariant("tick without a current time"))?;
        let window_end = current
            .saturating_add_nanos((window_ms * 1e6) as u64)
            .clamp(start, end);

        let mut collected: Vec<Record> = Vec::new();
        if let Some(saved) = self.saved_record.take() {
            match saved.time() {
                Some(t) if t > window_end => {
                    // Still ahead of the window; nothing becomes current.
                    self.saved_record = Some(saved);
                    self.records = Vec::new();
                    self.current_time = Some(window_end);
                    self.emit();
                    return Ok(());
                }
                _ => collected.push(saved),
            }
        }

        let mut iterator = self
            .iterator
            .take()
            .ok_or_else(|| Error::invariant("no active playback iterator"))?;
        let stall = tokio::time::sleep(TICK_STALL);
        tokio::pin!(stall);
        let mut slow = false;
        let outcome = loop {
            tokio::select! {
                _ = &mut stall, if !slow => {
                    slow = true;
                    self.presence = Presence::Buffering;
                    self.emit();
                }
                next = iterator.next() => match next {
                    Err(e) => break Err(e),
                    Ok(None) => break Ok(()),
                    Ok(Some(record)) => {
                        if self.shared.pending() {
                            break Ok(());
                        }
                        match record.time() {
                            Some(t) if t > window_end => {
                                self.saved_record = Some(record);
                                break Ok(());
                            }
                            _ => collected.push(record),
                        }
                    }
                }
            }
        };
        self.iterator = Some(iterator);
        self.presence = Presence::Present;
        outcome?;
        if self.shared.pending() {
            return Ok(());
        }

        self.records = collected;
        self.current_time = Some(window_end);
        self.emit();
        Ok(())
    }

    async fn state_seek_backfill(&mut self) -> Result<()> {
        let (start, end) = self.bounds()?;
        let Some(target) = *lock(&self.shared.seek_target) else {
            self.shared
                .request_state(self.resume_state());
            return Ok(());
        };
        let target = target.clamp(start, end);
        debug!(target = %target, "seeking");
        self.saved_record = None;

        let token = CancellationToken::new();
        *lock(&self.shared.abort) = Some(token.clone());

        let buffer = self.buffer.clone();
        let topics = self.subscribed();
        let backfill = buffer.get_backfill_messages(BackfillArgs { topics, time: target });
        tokio::pin!(backfill);
        let ack = tokio::time::sleep(SEEK_ACK_DELAY);
        tokio::pin!(ack);
        let mut acked = false;
        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => break None,
                _ = &mut ack, if !acked => {
                    // Acknowledge slow seeks so the UI can show the
                    // target position while the read completes.
                    acked = true;
                    self.presence = Presence::Buffering;
                    self.records = Vec::new();
                    self.current_time = Some(target);
                    self.emit();
                }
                result = &mut backfill => break Some(result),
            }
        };
        *lock(&self.shared.abort) = None;
        // Keep the target only if another seek is already queued.
        if *lock(&self.shared.next_state) != Some(State::SeekBackfill) {
            *lock(&self.shared.seek_target) = None;
        }

        let Some(result) = outcome else {
            debug!("seek superseded");
            return Ok(());
        };
        if self.shared.pending() {
            return Ok(());
        }
        let records = result?;

        if let Some(preloader) = &self.preloader {
            preloader.set_active_time(target);
        }
        self.records = records.into_iter().map(Record::Data).collect();
        self.current_time = Some(target);
        self.presence = Presence::Present;
        self.emit();

        self.reset_iterator().await?;
        if !self.shared.pending() {
            self.shared.request_state(self.resume_state());
        }
        Ok(())
    }

    async fn state_reset_iterator(&mut self) -> Result<()> {
        self.reset_iterator().await?;
        if !self.shared.pending() {
            self.shared.request_state(self.resume_state());
        }
        Ok(())
    }

    async fn reset_iterator(&mut self) -> Result<()> {
        let current = self
            .current_time
            .ok_or_else(|| Error::invariant("resetting iterator without a position"))?;
        let next = current.saturating_add_nanos(1);
        self.iterator = None;
        debug!(from = %next, "rebuilding playback iterator");
        let iterator = self
            .buffer
            .iterate(IteratorArgs {
                topics: self.subscribed(),
                start: Some(next),
                end: None,
                hint: ConsumptionHint::Partial,
            })
            .await?;
        self.iterator = Some(iterator);
        Ok(())
    }

    fn resume_state(&self) -> State {
        if self.shared.is_playing.load(Ordering::SeqCst) {
            State::Play
        } else {
            State::Idle
        }
    }

    async fn state_close(&mut self) {
        debug!("closing");
        self.shared.is_playing.store(false, Ordering::SeqCst);
        if let Some(preloader) = &self.preloader {
            preloader.stop();
        }
        *lock(&self.shared.preloader) = None;
        if let Some(task) = self.preload_task.take() {
            let _ = task.await;
        }
        self.buffer.stop().await;
        self.iterator = None;
    }

    fn apply_preload_progress(&mut self, p: PreloadProgress) {
        self.progress.preloaded_ranges = p.fully_loaded_ranges;
        self.progress.preloaded_bytes = p.preloaded_bytes;
    }

    async fn refresh_buffer_progress(&mut self) {
        self.progress.buffered_ranges = self.buffer.loaded_ranges().await;
        self.progress.buffered_bytes = self.buffer.cached_bytes().await;
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
