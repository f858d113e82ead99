use crate::lease::{LeaseRelease, SuspendLease};
use crate::scheduler::{ActionId, DeferredActionScheduler, JobHandle, SchedulingFailure};
use keycombo_core::error::ConfigError;
use keycombo_core::ipc::{ComboPhase, ComboStatus};
use keycombo_core::keys;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace};

/// Callbacks run on the worker when the combo is held and when it is let go.
pub trait ComboActions: Send + Sync + 'static {
    fn on_held(&self);
    fn on_released(&self);
}

#[derive(Error, Debug)]
pub enum ComboError {
    #[error("invalid combo: {0}")]
    Config(#[from] ConfigError),

    #[error("could not schedule {action} action: {source}")]
    Scheduling {
        action: ActionId,
        #[source]
        source: SchedulingFailure,
    },

    #[error("failed to start worker thread: {0}")]
    Worker(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    /// Must be pressed for the combo to hold.
    Down,
    /// Must stay released; pressing it breaks the combo.
    Up,
}

/// Which codes the combo watches and in what role. Fixed after construction.
#[derive(Debug, Clone)]
pub struct TrackedKeySet {
    roles: HashMap<u16, KeyRole>,
    target: usize,
}

impl TrackedKeySet {
    pub fn new(down: &[u16], up: &[u16]) -> Result<Self, ConfigError> {
        let mut roles = HashMap::new();
        for &code in down {
            roles.insert(code, KeyRole::Down);
        }
        let target = roles.len();
        if target == 0 {
            return Err(ConfigError::EmptyDownSet);
        }
        for &code in up {
            if roles.get(&code) == Some(&KeyRole::Down) {
                return Err(ConfigError::Overlap { code });
            }
            roles.insert(code, KeyRole::Up);
        }
        Ok(Self { roles, target })
    }

    pub fn role(&self, code: u16) -> Option<KeyRole> {
        self.roles.get(&code).copied()
    }

    pub fn contains(&self, code: u16) -> bool {
        self.roles.contains_key(&code)
    }

    /// Number of distinct down keys.
    pub fn target(&self) -> usize {
        self.target
    }

    pub fn codes(&self) -> impl Iterator<Item = u16> + '_ {
        self.roles.keys().copied()
    }
}

/// Everything guarded by the state lock.
#[derive(Debug)]
struct LiveState {
    pressed: HashSet<u16>,
    down_count: usize,
    up_count: usize,
    phase: ComboPhase,
    /// Delayed held action, until it is canceled or fires.
    pending: Option<JobHandle>,
    /// Bumped on every arming so a stale held action can tell it lost the race.
    generation: u64,
    closed: bool,
}

impl LiveState {
    fn new() -> Self {
        Self {
            pressed: HashSet::new(),
            down_count: 0,
            up_count: 0,
            phase: ComboPhase::Idle,
            pending: None,
            generation: 0,
            closed: false,
        }
    }
}

/// Collaborators the state machine schedules work on.
pub struct ComboResources {
    pub scheduler: Arc<DeferredActionScheduler>,
    /// Held from arming until the combo breaks.
    pub held_lease: Arc<SuspendLease>,
    /// Held by each posted released action until it has run.
    pub up_lease: Arc<SuspendLease>,
    pub actions: Arc<dyn ComboActions>,
}

pub struct ComboStateMachine {
    keys: Arc<TrackedKeySet>,
    dwell: Duration,
    state: Mutex<LiveState>,
    scheduler: Arc<DeferredActionScheduler>,
    held_lease: Arc<SuspendLease>,
    up_lease: Arc<SuspendLease>,
    actions: Arc<dyn ComboActions>,
    held_fired: AtomicU64,
    released_fired: AtomicU64,
}

impl ComboStateMachine {
    pub fn configure(
        down: &[u16],
        up: &[u16],
        dwell: Duration,
        resources: ComboResources,
    ) -> Result<Arc<Self>, ConfigError> {
        let keys = TrackedKeySet::new(down, up)?;
        Ok(Arc::new(Self {
            keys: Arc::new(keys),
            dwell,
            state: Mutex::new(LiveState::new()),
            scheduler: resources.scheduler,
            held_lease: resources.held_lease,
            up_lease: resources.up_lease,
            actions: resources.actions,
            held_fired: AtomicU64::new(0),
            released_fired: AtomicU64::new(0),
        }))
    }

    pub fn keys(&self) -> &Arc<TrackedKeySet> {
        &self.keys
    }

    pub fn phase(&self) -> ComboPhase {
        self.state.lock().phase
    }

    /// Feed one key transition. Returns the action newly scheduled by it, if any.
    ///
    /// Never blocks beyond the state lock; callbacks run later on the worker.
    pub fn on_key_event(
        self: &Arc<Self>,
        code: u16,
        pressed: bool,
    ) -> Result<Option<ActionId>, ComboError> {
        let Some(role) = self.keys.role(code) else {
            return Ok(None);
        };

        let mut state = self.state.lock();
        if state.closed {
            return Ok(None);
        }
        if state.pressed.contains(&code) == pressed {
            trace!(code, pressed, "duplicate key event");
            return Ok(None);
        }

        if pressed {
            state.pressed.insert(code);
        } else {
            state.pressed.remove(&code);
        }
        match (role, pressed) {
            (KeyRole::Down, true) => state.down_count += 1,
            (KeyRole::Down, false) => state.down_count -= 1,
            (KeyRole::Up, true) => state.up_count += 1,
            (KeyRole::Up, false) => state.up_count -= 1,
        }
        trace!(
            code,
            key = keys::key_name(code).unwrap_or("?"),
            pressed,
            down = state.down_count,
            up = state.up_count,
            "tracked key changed"
        );

        let satisfied = state.down_count == self.keys.target() && state.up_count == 0;
        match (satisfied, state.phase) {
            (true, ComboPhase::Idle) => self.arm(&mut state),
            // every tracked bit is pinned while satisfied, so any accepted flip breaks it
            (true, _) => Ok(None),
            (false, ComboPhase::Arming | ComboPhase::Held) => self.disarm(&mut state),
            (false, ComboPhase::Idle) => Ok(None),
        }
    }

    fn arm(self: &Arc<Self>, state: &mut LiveState) -> Result<Option<ActionId>, ComboError> {
        self.held_lease.acquire();
        state.generation += 1;
        let generation = state.generation;

        let machine = Arc::downgrade(self);
        let job = Box::new(move || {
            if let Some(machine) = machine.upgrade() {
                machine.held_fired(generation);
            }
        });

        match self.scheduler.schedule_delayed(ActionId::Held, self.dwell, job) {
            Ok(handle) => {
                state.pending = Some(handle);
                state.phase = ComboPhase::Arming;
                debug!(dwell_ms = self.dwell.as_millis() as u64, "combo satisfied, arming");
                Ok(Some(ActionId::Held))
            }
            Err(source) => {
                self.held_lease.release();
                error!(error = %source, "failed to arm combo");
                Err(ComboError::Scheduling {
                    action: ActionId::Held,
                    source,
                })
            }
        }
    }

    fn disarm(self: &Arc<Self>, state: &mut LiveState) -> Result<Option<ActionId>, ComboError> {
        let was = state.phase;
        state.phase = ComboPhase::Idle;

        let canceled = state
            .pending
            .take()
            .map_or(false, |handle| self.scheduler.cancel(&handle));
        if canceled {
            self.held_lease.release();
            debug!("combo broke before dwell elapsed");
            return Ok(None);
        }

        // The held action started or ran, so its released counterpart must run too.
        // The guard travels with the job: if the job is rejected it is dropped here
        // and the up lease goes with it.
        self.up_lease.acquire();
        let release = LeaseRelease(Arc::clone(&self.up_lease));
        let machine = Arc::clone(self);
        let job = Box::new(move || {
            machine.released_fired();
            drop(release);
        });
        let result = self.scheduler.schedule_immediate(ActionId::Released, job);
        self.held_lease.release();

        match result {
            Ok(_) => {
                debug!(from = %was, "combo broke, released action posted");
                Ok(Some(ActionId::Released))
            }
            Err(source) => {
                error!(error = %source, "failed to post released action");
                Err(ComboError::Scheduling {
                    action: ActionId::Released,
                    source,
                })
            }
        }
    }

    /// Worker side of the delayed held action.
    fn held_fired(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.phase == ComboPhase::Arming && state.generation == generation {
                state.phase = ComboPhase::Held;
                state.pending = None;
            } else {
                debug!(generation, "held action started after its combo broke");
            }
        }

        self.held_fired.fetch_add(1, Ordering::Relaxed);
        info!("combo held, running held action");
        self.actions.on_held();
    }

    /// Worker side of the immediate released action.
    fn released_fired(&self) {
        self.released_fired.fetch_add(1, Ordering::Relaxed);
        info!("combo released, running released action");
        self.actions.on_released();
    }

    /// Stop reacting to events and drop the pending held action.
    ///
    /// A combo that is held stays un-released: no released action is synthesized.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(handle) = state.pending.take() {
            self.scheduler.cancel(&handle);
        }
        if state.phase != ComboPhase::Idle {
            self.held_lease.release();
            state.phase = ComboPhase::Idle;
        }
    }

    pub fn status(&self) -> ComboStatus {
        let state = self.state.lock();
        ComboStatus {
            phase: state.phase,
            down_pressed: state.down_count,
            down_target: self.keys.target(),
            up_pressed: state.up_count,
            held_leases: self.held_lease.held(),
            up_leases: self.up_lease.held(),
            held_fired: self.held_fired.load(Ordering::Relaxed),
            released_fired: self.released_fired.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn check_tally(&self) {
        let state = self.state.lock();
        let down = state
            .pressed
            .iter()
            .filter(|c| self.keys.role(**c) == Some(KeyRole::Down))
            .count();
        let up = state
            .pressed
            .iter()
            .filter(|c| self.keys.role(**c) == Some(KeyRole::Up))
            .count();
        assert_eq!(state.down_count, down, "down tally drifted");
        assert_eq!(state.up_count, up, "up tally drifted");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::mpsc;

    /// Forwards every callback to a channel so tests can wait on them.
    pub struct RecordingActions {
        tx: Mutex<mpsc::Sender<ActionId>>,
    }

    impl RecordingActions {
        pub fn new() -> (Arc<Self>, mpsc::Receiver<ActionId>) {
            let (tx, rx) = mpsc::channel();
            (Arc::new(Self { tx: Mutex::new(tx) }), rx)
        }
    }

    impl ComboActions for RecordingActions {
        fn on_held(&self) {
            let _ = self.tx.lock().send(ActionId::Held);
        }

        fn on_released(&self) {
            let _ = self.tx.lock().send(ActionId::Released);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingActions;
    use super::*;
    use crate::lease::testing::CountingBlocker;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    const KEY_A: u16 = 30;
    const KEY_B: u16 = 48;
    const KEY_C: u16 = 46;
    const KEY_U: u16 = 22; // up-set key
    const KEY_F: u16 = 33; // untracked

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        machine: Arc<ComboStateMachine>,
        scheduler: Arc<DeferredActionScheduler>,
        held_lease: Arc<SuspendLease>,
        up_lease: Arc<SuspendLease>,
        blocker: Arc<CountingBlocker>,
        rx: mpsc::Receiver<ActionId>,
    }

    impl Harness {
        fn press(&self, code: u16) -> Option<ActionId> {
            self.machine.on_key_event(code, true).unwrap()
        }

        fn release(&self, code: u16) -> Option<ActionId> {
            self.machine.on_key_event(code, false).unwrap()
        }

        fn leases(&self) -> (usize, usize) {
            (self.held_lease.held(), self.up_lease.held())
        }

        fn expect_callback(&self) -> ActionId {
            self.rx.recv_timeout(WAIT).expect("callback should fire")
        }

        fn expect_quiet(&self, for_: Duration) {
            assert!(self.rx.recv_timeout(for_).is_err(), "no callback expected");
        }
    }

    fn harness(down: &[u16], up: &[u16], dwell_ms: u64) -> Harness {
        harness_with_capacity(down, up, dwell_ms, 8)
    }

    fn harness_with_capacity(down: &[u16], up: &[u16], dwell_ms: u64, capacity: usize) -> Harness {
        let blocker = Arc::new(CountingBlocker::default());
        let scheduler = Arc::new(DeferredActionScheduler::new(capacity).unwrap());
        let held_lease = Arc::new(SuspendLease::new("combo", blocker.clone()));
        let up_lease = Arc::new(SuspendLease::new("combo_up", blocker.clone()));
        let (actions, rx) = RecordingActions::new();
        let machine = ComboStateMachine::configure(
            down,
            up,
            Duration::from_millis(dwell_ms),
            ComboResources {
                scheduler: scheduler.clone(),
                held_lease: held_lease.clone(),
                up_lease: up_lease.clone(),
                actions,
            },
        )
        .unwrap();
        Harness {
            machine,
            scheduler,
            held_lease,
            up_lease,
            blocker,
            rx,
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn noop_job() -> crate::scheduler::Job {
        Box::new(|| {})
    }

    // --- configuration ---

    #[test]
    fn tracked_set_rejects_empty_down_keys() {
        assert_eq!(
            TrackedKeySet::new(&[], &[KEY_U]).unwrap_err(),
            ConfigError::EmptyDownSet
        );
    }

    #[test]
    fn tracked_set_rejects_overlap() {
        assert_eq!(
            TrackedKeySet::new(&[KEY_A, KEY_B], &[KEY_B]).unwrap_err(),
            ConfigError::Overlap { code: KEY_B }
        );
    }

    #[test]
    fn duplicate_down_keys_count_once() {
        let keys = TrackedKeySet::new(&[KEY_A, KEY_A, KEY_B], &[]).unwrap();
        assert_eq!(keys.target(), 2);
        assert_eq!(keys.role(KEY_A), Some(KeyRole::Down));
        assert_eq!(keys.role(KEY_F), None);
    }

    #[test]
    fn configure_surfaces_config_errors() {
        let blocker = Arc::new(CountingBlocker::default());
        let (actions, _rx) = RecordingActions::new();
        let result = ComboStateMachine::configure(
            &[],
            &[],
            Duration::ZERO,
            ComboResources {
                scheduler: Arc::new(DeferredActionScheduler::new(1).unwrap()),
                held_lease: Arc::new(SuspendLease::new("a", blocker.clone())),
                up_lease: Arc::new(SuspendLease::new("b", blocker)),
                actions,
            },
        );
        assert!(matches!(result, Err(ConfigError::EmptyDownSet)));
    }

    // --- event filtering ---

    #[test]
    fn untracked_keys_are_ignored() {
        let h = harness(&[KEY_A], &[], 1000);
        assert_eq!(h.press(KEY_F), None);
        assert_eq!(h.machine.status().down_pressed, 0);
        assert_eq!(h.machine.phase(), ComboPhase::Idle);
    }

    #[test]
    fn duplicate_events_change_nothing() {
        let h = harness(&[KEY_A, KEY_B], &[], 1000);
        h.press(KEY_A);
        assert_eq!(h.press(KEY_A), None);
        assert_eq!(h.machine.status().down_pressed, 1);
        assert_eq!(h.release(KEY_B), None, "release of an unpressed key is a duplicate");
        assert_eq!(h.machine.status().down_pressed, 1);
        h.machine.check_tally();
    }

    #[test]
    fn repeated_press_while_arming_does_not_rearm() {
        let h = harness(&[KEY_A], &[], 1000);
        assert_eq!(h.press(KEY_A), Some(ActionId::Held));
        assert_eq!(h.press(KEY_A), None);
        assert_eq!(h.scheduler.pending(), 1);
        assert_eq!(h.leases(), (1, 0));
    }

    // --- arming and firing ---

    #[test]
    fn full_combo_arms_and_takes_lease() {
        let h = harness(&[KEY_A, KEY_B], &[], 1000);
        assert_eq!(h.press(KEY_B), None);
        assert_eq!(h.press(KEY_A), Some(ActionId::Held));
        assert_eq!(h.machine.phase(), ComboPhase::Arming);
        assert_eq!(h.leases(), (1, 0));
        assert!(h.blocker.blocked("combo"));
    }

    #[test]
    fn held_fires_once_after_dwell() {
        let h = harness(&[KEY_A, KEY_B], &[], 60);
        let start = Instant::now();
        h.press(KEY_A);
        h.press(KEY_B);
        assert_eq!(h.expect_callback(), ActionId::Held);
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert!(wait_for(|| h.machine.phase() == ComboPhase::Held));
        h.expect_quiet(Duration::from_millis(150));
        assert_eq!(h.leases(), (1, 0), "lease stays held until the combo breaks");
        assert_eq!(h.machine.status().held_fired, 1);
    }

    #[test]
    fn break_before_dwell_cancels_cleanly() {
        let h = harness(&[KEY_A, KEY_B], &[], 100);
        h.press(KEY_A);
        h.press(KEY_B);
        assert_eq!(h.release(KEY_B), None);
        assert_eq!(h.machine.phase(), ComboPhase::Idle);
        assert_eq!(h.leases(), (0, 0));
        assert!(!h.blocker.blocked("combo"));
        h.expect_quiet(Duration::from_millis(250));
    }

    #[test]
    fn break_after_held_fires_released_once() {
        let h = harness(&[KEY_A, KEY_B], &[], 20);
        h.press(KEY_A);
        h.press(KEY_B);
        assert_eq!(h.expect_callback(), ActionId::Held);
        assert!(wait_for(|| h.machine.phase() == ComboPhase::Held));

        assert_eq!(h.release(KEY_A), Some(ActionId::Released));
        assert_eq!(h.machine.phase(), ComboPhase::Idle);
        assert_eq!(h.expect_callback(), ActionId::Released);
        assert!(wait_for(|| h.leases() == (0, 0)));

        // further breaks of an idle combo do nothing
        assert_eq!(h.release(KEY_B), None);
        h.expect_quiet(Duration::from_millis(100));
        assert_eq!(h.machine.status().released_fired, 1);
    }

    // --- up keys ---

    #[test]
    fn up_key_held_prevents_arming() {
        let h = harness(&[KEY_A, KEY_B], &[KEY_U], 20);
        h.press(KEY_U);
        h.press(KEY_A);
        assert_eq!(h.press(KEY_B), None);
        assert_eq!(h.machine.phase(), ComboPhase::Idle);

        assert_eq!(h.release(KEY_U), Some(ActionId::Held), "releasing the up key completes the combo");
        assert_eq!(h.expect_callback(), ActionId::Held);
    }

    #[test]
    fn up_key_breaks_arming_combo() {
        let h = harness(&[KEY_A, KEY_B], &[KEY_U], 200);
        h.press(KEY_A);
        h.press(KEY_B);
        assert_eq!(h.press(KEY_U), None);
        assert_eq!(h.machine.phase(), ComboPhase::Idle);
        assert_eq!(h.leases(), (0, 0));
        h.expect_quiet(Duration::from_millis(300));
    }

    #[test]
    fn up_key_breaks_held_combo() {
        let h = harness(&[KEY_A, KEY_B], &[KEY_U], 20);
        h.press(KEY_A);
        h.press(KEY_B);
        assert_eq!(h.expect_callback(), ActionId::Held);
        assert!(wait_for(|| h.machine.phase() == ComboPhase::Held));

        assert_eq!(h.press(KEY_U), Some(ActionId::Released));
        assert_eq!(h.expect_callback(), ActionId::Released);
        assert!(wait_for(|| h.leases() == (0, 0)));
    }

    // --- timing scenario ---

    #[test]
    fn bounce_then_hold_then_release() {
        let h = harness(&[KEY_A, KEY_B], &[], 200);
        h.press(KEY_A);
        h.press(KEY_B);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(h.release(KEY_B), None, "clean cancel");
        assert_eq!(h.leases(), (0, 0));

        thread::sleep(Duration::from_millis(10));
        let rearmed = Instant::now();
        assert_eq!(h.press(KEY_B), Some(ActionId::Held));
        assert_eq!(h.expect_callback(), ActionId::Held);
        assert!(rearmed.elapsed() >= Duration::from_millis(200), "dwell restarts on re-arm");
        assert!(wait_for(|| h.machine.phase() == ComboPhase::Held));

        assert_eq!(h.release(KEY_A), Some(ActionId::Released));
        assert_eq!(h.expect_callback(), ActionId::Released);
        assert!(wait_for(|| h.leases() == (0, 0)));
        h.expect_quiet(Duration::from_millis(100));

        let status = h.machine.status();
        assert_eq!((status.held_fired, status.released_fired), (1, 1));
    }

    #[test]
    fn rapid_bouncing_never_fires_or_leaks() {
        let h = harness(&[KEY_A, KEY_B], &[], 100);
        h.press(KEY_A);
        for _ in 0..50 {
            h.press(KEY_B);
            h.release(KEY_B);
        }
        assert_eq!(h.scheduler.pending(), 0);
        assert_eq!(h.leases(), (0, 0));
        h.expect_quiet(Duration::from_millis(200));
    }

    #[test]
    fn tally_matches_pressed_keys_for_any_sequence() {
        let h = harness(&[KEY_A, KEY_B, KEY_C], &[KEY_U], 60_000);
        let codes = [KEY_A, KEY_B, KEY_C, KEY_U, KEY_F];
        let mut seed: u32 = 0x2545_f491;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let code = codes[(seed % codes.len() as u32) as usize];
            let pressed = seed & 0x100 != 0;
            h.machine.on_key_event(code, pressed).unwrap();
            h.machine.check_tally();

            let status = h.machine.status();
            let satisfied = status.down_pressed == 3 && status.up_pressed == 0;
            assert_eq!(satisfied, status.phase == ComboPhase::Arming);
            assert_eq!(status.held_leases, usize::from(satisfied));
        }
        h.machine.shutdown();
        assert_eq!(h.leases(), (0, 0));
    }

    // --- scheduling failures ---

    #[test]
    fn arm_failure_leaves_no_lease() {
        let h = harness_with_capacity(&[KEY_A, KEY_B], &[], 20, 1);
        let blocker_job = h
            .scheduler
            .schedule_delayed(ActionId::Held, Duration::from_secs(60), noop_job())
            .unwrap();

        h.press(KEY_A);
        let err = h.machine.on_key_event(KEY_B, true).unwrap_err();
        assert!(matches!(
            err,
            ComboError::Scheduling {
                action: ActionId::Held,
                source: SchedulingFailure::QueueFull { .. }
            }
        ));
        assert_eq!(h.machine.phase(), ComboPhase::Idle);
        assert_eq!(h.leases(), (0, 0));
        assert!(!h.blocker.blocked("combo"));

        // the next break is a plain no-op
        assert_eq!(h.release(KEY_B), None);
        assert!(h.scheduler.cancel(&blocker_job));
    }

    #[test]
    fn release_failure_leaves_no_lease() {
        let h = harness_with_capacity(&[KEY_A], &[], 0, 1);
        h.press(KEY_A);
        assert_eq!(h.expect_callback(), ActionId::Held);
        assert!(wait_for(|| h.machine.phase() == ComboPhase::Held));
        h.scheduler
            .schedule_delayed(ActionId::Held, Duration::from_secs(60), noop_job())
            .unwrap();

        let err = h.machine.on_key_event(KEY_A, false).unwrap_err();
        assert!(matches!(
            err,
            ComboError::Scheduling {
                action: ActionId::Released,
                ..
            }
        ));
        assert_eq!(h.machine.phase(), ComboPhase::Idle);
        assert_eq!(h.leases(), (0, 0));
        h.expect_quiet(Duration::from_millis(50));
    }

    // --- races and teardown ---

    #[test]
    fn stale_held_action_does_not_mark_held() {
        let h = harness(&[KEY_A], &[], 60_000);
        h.press(KEY_A);
        let stale = h.machine.state.lock().generation - 1;
        h.machine.held_fired(stale);
        assert_eq!(h.machine.phase(), ComboPhase::Arming);
        assert_eq!(h.expect_callback(), ActionId::Held, "a started action still runs");
        h.machine.shutdown();
    }

    #[test]
    fn break_while_held_action_runs_posts_released_after_it() {
        // on_held blocks until released, simulating a break that loses the cancel race
        struct Gate {
            started: Mutex<mpsc::Sender<()>>,
            go: Mutex<mpsc::Receiver<()>>,
            log: Mutex<mpsc::Sender<ActionId>>,
        }
        impl ComboActions for Gate {
            fn on_held(&self) {
                let _ = self.started.lock().send(());
                let _ = self.go.lock().recv();
                let _ = self.log.lock().send(ActionId::Held);
            }
            fn on_released(&self) {
                let _ = self.log.lock().send(ActionId::Released);
            }
        }

        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel();
        let (log_tx, log_rx) = mpsc::channel();
        let blocker = Arc::new(CountingBlocker::default());
        let held_lease = Arc::new(SuspendLease::new("combo", blocker.clone()));
        let up_lease = Arc::new(SuspendLease::new("combo_up", blocker));
        let machine = ComboStateMachine::configure(
            &[KEY_A],
            &[],
            Duration::ZERO,
            ComboResources {
                scheduler: Arc::new(DeferredActionScheduler::new(4).unwrap()),
                held_lease: held_lease.clone(),
                up_lease: up_lease.clone(),
                actions: Arc::new(Gate {
                    started: Mutex::new(started_tx),
                    go: Mutex::new(go_rx),
                    log: Mutex::new(log_tx),
                }),
            },
        )
        .unwrap();

        machine.on_key_event(KEY_A, true).unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(
            machine.on_key_event(KEY_A, false).unwrap(),
            Some(ActionId::Released)
        );
        assert_eq!(held_lease.held(), 0);
        assert_eq!(up_lease.held(), 1, "up lease covers the posted action");

        go_tx.send(()).unwrap();
        assert_eq!(log_rx.recv_timeout(WAIT), Ok(ActionId::Held));
        assert_eq!(log_rx.recv_timeout(WAIT), Ok(ActionId::Released));
        assert!(wait_for(|| up_lease.held() == 0));
    }

    #[test]
    fn shutdown_while_arming_releases_lease_and_never_fires() {
        let h = harness(&[KEY_A], &[], 80);
        h.press(KEY_A);
        h.machine.shutdown();
        assert_eq!(h.machine.phase(), ComboPhase::Idle);
        assert_eq!(h.leases(), (0, 0));
        assert_eq!(h.scheduler.pending(), 0);
        h.expect_quiet(Duration::from_millis(200));

        // events after shutdown are ignored
        assert_eq!(h.release(KEY_A), None);
        assert_eq!(h.press(KEY_A), None);
        assert_eq!(h.leases(), (0, 0));
    }

    #[test]
    fn shutdown_while_held_does_not_synthesize_release() {
        let h = harness(&[KEY_A], &[], 0);
        h.press(KEY_A);
        assert_eq!(h.expect_callback(), ActionId::Held);
        assert!(wait_for(|| h.machine.phase() == ComboPhase::Held));
        h.machine.shutdown();
        assert_eq!(h.leases(), (0, 0));
        h.expect_quiet(Duration::from_millis(100));
    }
}
