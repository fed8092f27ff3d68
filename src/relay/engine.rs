//! Relay lifecycle: install, diff and the per-relay state machine.
//!
//! Each relay runs as one cooperative client. Configuration diffs never
//! touch a running connection directly; they install `new_details` on
//! the live record and wake the client, which swaps them in at the top
//! of its next visit. Actual connecting happens on a detached task
//! because it blocks, with a global cap so a flapping master cannot
//! absorb every worker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::connection::{OpenOutcome, OpenRequest, UpstreamSource, open_relay};
use super::Relay;
use crate::config::MountConfig;
use crate::source::{MountRegistry, Source};
use crate::worker::{Client, ClientHandle, Control, Tick, WorkerPool};

/// Upstreams a relay is given to prove itself before skips are cleared.
const QUICK_DEATH: Duration = Duration::from_secs(60);

/// Guard around the global count of relays mid-connect.
#[derive(Debug)]
pub struct RelayStarts {
    connecting: Mutex<u32>,
    slowdown: AtomicU32,
    cap: u32,
}

impl RelayStarts {
    /// Creates the guard with the given concurrent-connect cap.
    pub fn new(cap: u32) -> Self {
        Self {
            connecting: Mutex::new(0),
            slowdown: AtomicU32::new(0),
            cap,
        }
    }

    /// Claims a connect slot; false when the cap is reached.
    pub fn try_begin(&self) -> bool {
        let mut connecting = self.connecting.lock().expect("relay start lock poisoned");
        if *connecting >= self.cap {
            return false;
        }
        *connecting += 1;
        true
    }

    /// Returns a connect slot.
    pub fn end(&self) {
        let mut connecting = self.connecting.lock().expect("relay start lock poisoned");
        *connecting = connecting.saturating_sub(1);
    }

    /// Relays currently holding a connect slot.
    pub fn connecting(&self) -> u32 {
        *self.connecting.lock().expect("relay start lock poisoned")
    }

    /// Bumps the new-connection slowdown counter, capped.
    pub fn note_slowdown(&self) {
        let _ = self
            .slowdown
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < 5).then_some(n + 1)
            });
    }

    /// Current slowdown counter.
    pub fn slowdown(&self) -> u32 {
        self.slowdown.load(Ordering::Relaxed)
    }
}

/// Shared collaborators every relay task needs.
#[derive(Debug)]
pub struct RelayContext {
    /// Mount registry for source reservation.
    pub mounts: Arc<MountRegistry>,
    /// Global connect cap.
    pub starts: Arc<RelayStarts>,
    /// `User-Agent` for upstream requests.
    pub user_agent: String,
    /// Settings applied to relayed mounts.
    pub mount_cfg: MountConfig,
    /// Byte cap for each source's block queue.
    pub queue_bytes: usize,
}

struct RelaySlot {
    localmount: String,
    relay: Arc<Mutex<Relay>>,
    handle: ClientHandle,
}

/// Diff-driven owner of the live relay sets.
pub struct RelayEngine {
    ctx: Arc<RelayContext>,
    pool: Arc<WorkerPool>,
    relays: Mutex<Vec<RelaySlot>>,
    master_relays: Mutex<Vec<RelaySlot>>,
}

impl RelayEngine {
    /// Creates an engine scheduling its relays on `pool`.
    pub fn new(ctx: Arc<RelayContext>, pool: Arc<WorkerPool>) -> Self {
        Self {
            ctx,
            pool,
            relays: Mutex::new(Vec::new()),
            master_relays: Mutex::new(Vec::new()),
        }
    }

    /// Applies a new configured relay set.
    pub fn update_relays(&self, candidates: Vec<Relay>) {
        self.apply(&self.relays, candidates);
    }

    /// Applies a freshly polled master relay set.
    pub fn update_master_relays(&self, candidates: Vec<Relay>) {
        self.apply(&self.master_relays, candidates);
    }

    /// Looks up a live relay record by local mount.
    pub fn find(&self, localmount: &str) -> Option<Arc<Mutex<Relay>>> {
        for list in [&self.relays, &self.master_relays] {
            let list = list.lock().expect("relay list poisoned");
            if let Some(slot) = list.iter().find(|s| s.localmount == localmount) {
                return Some(Arc::clone(&slot.relay));
            }
        }
        None
    }

    /// Number of live relays across both sets.
    pub fn relay_count(&self) -> usize {
        self.relays.lock().expect("relay list poisoned").len()
            + self.master_relays.lock().expect("relay list poisoned").len()
    }

    /// Flips a relay between enabled and disabled, waking its client.
    /// Returns the new running state.
    pub fn toggle(&self, localmount: &str) -> Option<bool> {
        for list in [&self.relays, &self.master_relays] {
            let list = list.lock().expect("relay list poisoned");
            if let Some(slot) = list.iter().find(|s| s.localmount == localmount) {
                let running = {
                    let mut relay = slot.relay.lock().expect("relay poisoned");
                    relay.running = !relay.running;
                    relay.running
                };
                slot.handle.wake();
                return Some(running);
            }
        }
        None
    }

    /// Marks every relay for cleanup, used at shutdown.
    pub fn shutdown_all(&self) {
        tracing::info!("shutting down current relays");
        for list in [&self.relays, &self.master_relays] {
            let mut list = list.lock().expect("relay list poisoned");
            for slot in list.drain(..) {
                slot.relay.lock().expect("relay poisoned").cleanup = true;
                slot.handle.wake();
            }
        }
    }

    /// One diff pass over a relay list: new entries are installed,
    /// changed ones get `new_details`, absent ones are cleaned up.
    /// Applying the same set twice causes no restarts.
    fn apply(&self, list: &Mutex<Vec<RelaySlot>>, candidates: Vec<Relay>) {
        let names: Vec<String> = candidates.iter().map(|c| c.localmount.clone()).collect();
        let mut list = list.lock().expect("relay list poisoned");

        for candidate in candidates {
            if let Some(slot) = list.iter().find(|s| s.localmount == candidate.localmount) {
                let restart = {
                    let mut relay = slot.relay.lock().expect("relay poisoned");
                    if relay.needs_restart(&candidate) {
                        tracing::info!(
                            "relay details changed on \"{}\", restarting",
                            relay.localmount
                        );
                        relay.new_details = Some(Box::new(candidate.copy_config()));
                        true
                    } else {
                        false
                    }
                };
                if restart {
                    slot.handle.wake();
                }
            } else {
                list.push(self.install(candidate.copy_config()));
            }
        }

        list.retain(|slot| {
            if names.iter().any(|n| n == &slot.localmount) {
                return true;
            }
            tracing::info!("relay shutdown request on \"{}\"", slot.localmount);
            slot.relay.lock().expect("relay poisoned").cleanup = true;
            slot.handle.wake();
            false
        });
    }

    fn install(&self, relay: Relay) -> RelaySlot {
        tracing::debug!("adding relay client for {}", relay.localmount);
        let localmount = relay.localmount.clone();
        let relay = Arc::new(Mutex::new(relay));
        let task_relay = Arc::clone(&relay);
        let ctx = Arc::clone(&self.ctx);
        let handle = self
            .pool
            .add_client(move |handle| Box::new(RelayTask::new(task_relay, ctx, handle)));
        RelaySlot {
            localmount,
            relay,
            handle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Init,
    Startup,
    Connecting,
    Reading,
}

/// Cooperative client driving one relay through its lifecycle.
pub(crate) struct RelayTask {
    relay: Arc<Mutex<Relay>>,
    ctx: Arc<RelayContext>,
    handle: ClientHandle,
    state: RelayState,
    source: Option<Arc<Mutex<Source>>>,
    upstream: Option<UpstreamSource>,
    pending: Arc<Mutex<Option<OpenOutcome>>>,
    con_time: Option<Instant>,
    drain_start: Option<Instant>,
    restart_now: bool,
}

impl RelayTask {
    pub(crate) fn new(
        relay: Arc<Mutex<Relay>>,
        ctx: Arc<RelayContext>,
        handle: ClientHandle,
    ) -> Self {
        Self {
            relay,
            ctx,
            handle,
            state: RelayState::Init,
            source: None,
            upstream: None,
            pending: Arc::new(Mutex::new(None)),
            con_time: None,
            drain_start: None,
            restart_now: false,
        }
    }

    /// Swaps in replacement details installed by a diff pass. A live
    /// connection is ended so the new masters take over.
    fn pickup_new_details(&mut self) {
        let relay_arc = Arc::clone(&self.relay);
        let mut relay = relay_arc.lock().expect("relay poisoned");
        if let Some(new) = relay.new_details.take() {
            tracing::info!("detected change in relay details for {}", relay.localmount);
            *relay = *new;
            if self.upstream.is_some() {
                self.restart_now = true;
                if let Some(source) = &self.source {
                    source.lock().expect("source poisoned").flags.running = false;
                }
            }
        }
    }

    fn init_tick(&mut self, tick: &Tick) -> Control {
        if self.source.is_none() {
            let localmount = self
                .relay
                .lock()
                .expect("relay poisoned")
                .localmount
                .clone();
            match self
                .ctx
                .mounts
                .reserve(&localmount, "audio/mpeg", 0, self.ctx.queue_bytes)
            {
                Some(source) => self.source = Some(source),
                None => {
                    tracing::info!("new relay but source \"{localmount}\" exists, waiting");
                    return Control::Reschedule(Duration::from_secs(2));
                }
            }
        }
        let (running, on_demand) = {
            let relay = self.relay.lock().expect("relay poisoned");
            (relay.running, relay.on_demand)
        };
        if !running {
            return Control::Reschedule(Duration::from_secs(3600));
        }
        if on_demand {
            if let Some(source) = &self.source {
                source.lock().expect("source poisoned").flags.on_demand = true;
            }
        }
        self.state = RelayState::Startup;
        self.startup_tick(tick)
    }

    fn startup_tick(&mut self, _tick: &Tick) -> Control {
        let (localmount, on_demand) = {
            let mut relay = self.relay.lock().expect("relay poisoned");
            if relay.cleanup {
                tracing::debug!("cleanup detected on {}", relay.localmount);
                relay.running = false;
            }
            if !relay.running {
                self.state = RelayState::Reading;
                return Control::Reschedule(Duration::from_millis(20));
            }
            (relay.localmount.clone(), relay.on_demand)
        };

        if on_demand {
            let listeners = self
                .source
                .as_ref()
                .map_or(0, |s| s.lock().expect("source poisoned").listeners);
            if listeners == 0 {
                return Control::Reschedule(Duration::from_secs(60));
            }
            tracing::info!("starting on-demand relay {localmount}");
        }

        // limit the number of relays starting up at the same time
        if !self.ctx.starts.try_begin() {
            self.ctx.starts.note_slowdown();
            return Control::Reschedule(Duration::from_millis(200));
        }

        let request = {
            let relay = self.relay.lock().expect("relay poisoned");
            OpenRequest {
                localmount: relay.localmount.clone(),
                masters: relay.masters.clone(),
                credentials: relay.username.clone().zip(relay.password.clone()),
                mp3metadata: relay.mp3metadata,
                user_agent: self.ctx.user_agent.clone(),
            }
        };
        if let Some(source) = &self.source {
            source.lock().expect("source poisoned").flags.pause_listeners = true;
        }
        tracing::info!("starting relayed source at mountpoint \"{localmount}\"");

        let pending = Arc::clone(&self.pending);
        let starts = Arc::clone(&self.ctx.starts);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let outcome = open_relay(&request).await;
            *pending.lock().expect("pending poisoned") = Some(outcome);
            starts.end();
            handle.wake();
        });
        self.state = RelayState::Connecting;
        Control::Reschedule(Duration::from_secs(1))
    }

    fn connecting_tick(&mut self, tick: &Tick) -> Control {
        let Some(outcome) = self.pending.lock().expect("pending poisoned").take() else {
            return Control::Reschedule(Duration::from_millis(200));
        };
        let on_demand = {
            let mut relay = self.relay.lock().expect("relay poisoned");
            for &at in &outcome.skipped {
                if let Some(master) = relay.masters.get_mut(at) {
                    master.skip = true;
                }
            }
            relay.in_use = outcome.in_use;
            relay.on_demand
        };

        match outcome.upstream {
            Some(upstream) => {
                if let Some(source) = &self.source {
                    let mut source = source.lock().expect("source poisoned");
                    source.clear();
                    source.attach_upstream(
                        &upstream.content_type,
                        upstream.icy_metaint,
                        &self.ctx.mount_cfg,
                    );
                }
                self.upstream = Some(upstream);
                self.con_time = Some(tick.now);
                self.state = RelayState::Reading;
                Control::Reschedule(Duration::ZERO)
            }
            None => {
                if let Some(source) = &self.source {
                    let mut source = source.lock().expect("source poisoned");
                    if on_demand {
                        source.flags.on_demand = false;
                    }
                    source.flags.pause_listeners = false;
                    tracing::info!(
                        "listener count remaining on {} is {}",
                        source.mount(),
                        source.listeners
                    );
                }
                self.relay.lock().expect("relay poisoned").in_use = None;
                self.state = RelayState::Reading;
                Control::Reschedule(Duration::ZERO)
            }
        }
    }

    fn read_tick(&mut self, tick: &Tick) -> Control {
        let Some(source_arc) = self.source.clone() else {
            return Control::Remove;
        };
        let relay_arc = Arc::clone(&self.relay);
        let mut source = source_arc.lock().expect("source poisoned");
        let mut relay = relay_arc.lock().expect("relay poisoned");

        if source.flags.running {
            if relay.cleanup {
                relay.running = false;
            }
            if !relay.running {
                source.flags.running = false;
            }
            if relay.on_demand
                && source.listeners == 0
                && source.ingest.read_bytes_total() > 1_000_000
            {
                source.flags.running = false;
            }
            if source.flags.running {
                if let Some(upstream) = self.upstream.as_mut() {
                    let _ = source.read(upstream);
                }
                return Control::Reschedule(Duration::from_millis(5));
            }
        }

        if !source.flags.terminating {
            // once-through shutdown decisions
            let mut fallback = true;
            if let Some(connected) = self.con_time {
                if relay.running && relay.in_use.is_some() {
                    fallback = false;
                }
                if tick.now.duration_since(connected) < QUICK_DEATH {
                    tracing::warn!(
                        "stream for {} died too quickly, skipping server for now",
                        relay.localmount
                    );
                    mark_in_use_skipped(&mut relay);
                } else {
                    relay.reset_skips();
                }
                if source.flags.timeout {
                    tracing::warn!(
                        "stream for {} timed out, skipping server for now",
                        relay.localmount
                    );
                    mark_in_use_skipped(&mut relay);
                }
            }
            if !relay.running {
                source.flags.pause_listeners = false;
            }
            source.shutdown(fallback);
            self.drain_start = Some(tick.now);
        }

        if source.termination_count > 0 && source.termination_count <= source.listeners {
            // paced wait while listeners drain
            let mut delay = Duration::from_millis(150);
            if self
                .drain_start
                .is_some_and(|since| tick.now.duration_since(since) > Duration::from_secs(2))
            {
                delay += Duration::from_millis(400);
                tracing::warn!(
                    "counts are {} and {} ({})",
                    source.termination_count,
                    source.listeners,
                    source.mount()
                );
            }
            return Control::Reschedule(delay);
        }
        tracing::debug!("all listeners have now been checked on {}", relay.localmount);
        self.drain_start = None;
        self.upstream = None;
        source.flags.terminating = false;
        source.flags.listeners_sync = false;

        if relay.cleanup {
            if source.listeners > 0 {
                tracing::info!(
                    "listeners on terminating relay {}, rechecking",
                    relay.localmount
                );
                source.termination_count = source.listeners;
                source.flags.pause_listeners = false;
                source.flags.listeners_sync = true;
                return Control::Reschedule(Duration::from_millis(150));
            }
            tracing::info!("shutting down relay {}", relay.localmount);
            let mount = source.mount().to_string();
            drop(source);
            self.ctx.mounts.release(&mount);
            self.source = None;
            return Control::Remove;
        }

        self.state = RelayState::Startup;
        let control = if relay.running {
            if self.restart_now || (self.con_time.is_some() && relay.in_use.is_some()) {
                tracing::info!("standing by to restart relay on {}", relay.localmount);
                if relay.on_demand && source.listeners == 0 {
                    relay.reset_skips();
                }
                source.clear();
                self.restart_now = false;
                self.state = RelayState::Init;
                Control::Reschedule(Duration::ZERO)
            } else {
                tracing::info!(
                    "standing by to restart relay on {} in {} seconds",
                    relay.localmount,
                    relay.interval.as_secs()
                );
                source.flags.on_demand = false;
                relay.reset_skips();
                source.clear();
                Control::Reschedule(relay.interval)
            }
        } else {
            tracing::info!("relay {} is disabled", relay.localmount);
            source.flags.on_demand = false;
            relay.reset_skips();
            source.clear();
            Control::Reschedule(Duration::from_secs(3600))
        };
        self.con_time = None;
        control
    }
}

fn mark_in_use_skipped(relay: &mut Relay) {
    if let Some(at) = relay.in_use {
        if let Some(master) = relay.masters.get_mut(at) {
            master.skip = true;
        }
    }
}

impl Client for RelayTask {
    fn process(&mut self, tick: &Tick) -> Control {
        self.pickup_new_details();
        match self.state {
            RelayState::Init => self.init_tick(tick),
            RelayState::Startup => self.startup_tick(tick),
            RelayState::Connecting => self.connecting_tick(tick),
            RelayState::Reading => self.read_tick(tick),
        }
    }
}
