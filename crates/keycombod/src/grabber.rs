use crate::driver::EventSource;
use crate::state_machine::TrackedKeySet;
use anyhow::{Context, Result};
use evdev::{Device, EventType, InputEvent, Key};
use futures::StreamExt;
use inotify::{EventMask, Inotify, WatchMask};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INPUT_DIR: &str = "/dev/input";

/// Time for udev to finish setting up a new node before we open it.
const HOTPLUG_SETTLE: Duration = Duration::from_millis(200);

/// A tracked key transition from one input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub device_idx: usize,
    pub code: u16,
    pub pressed: bool,
}

/// Map a raw event to a tracked key transition. Auto-repeat counts as pressed.
pub fn key_event(device_idx: usize, event: &InputEvent, keys: &TrackedKeySet) -> Option<KeyEvent> {
    if event.event_type() != EventType::KEY || !keys.contains(event.code()) {
        return None;
    }
    Some(KeyEvent {
        device_idx,
        code: event.code(),
        pressed: event.value() != 0,
    })
}

/// Tracked keys one device currently reports as down.
#[derive(Debug)]
pub struct DeviceKeys {
    device_idx: usize,
    down: HashSet<u16>,
}

impl DeviceKeys {
    pub fn new(device_idx: usize) -> Self {
        Self {
            device_idx,
            down: HashSet::new(),
        }
    }

    /// Record keys already down at attach. Returns the presses to forward.
    pub fn seed(&mut self, codes: impl IntoIterator<Item = u16>, keys: &TrackedKeySet) -> Vec<KeyEvent> {
        let mut presses = Vec::new();
        for code in codes {
            if keys.contains(code) && self.down.insert(code) {
                presses.push(KeyEvent {
                    device_idx: self.device_idx,
                    code,
                    pressed: true,
                });
            }
        }
        presses
    }

    pub fn track(&mut self, ev: &KeyEvent) {
        if ev.pressed {
            self.down.insert(ev.code);
        } else {
            self.down.remove(&ev.code);
        }
    }

    /// Releases for every key still down, in code order. Leaves the set empty.
    pub fn drain(&mut self) -> Vec<KeyEvent> {
        let mut codes: Vec<u16> = self.down.drain().collect();
        codes.sort_unstable();
        codes
            .into_iter()
            .map(|code| KeyEvent {
                device_idx: self.device_idx,
                code,
                pressed: false,
            })
            .collect()
    }
}

pub fn is_event_node(name: &str) -> bool {
    name.strip_prefix("event")
        .map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// A device is interesting if it can report at least one tracked key.
fn reports_tracked_key(dev: &Device, keys: &TrackedKeySet) -> bool {
    let Some(supported) = dev.supported_keys() else {
        return false;
    };
    keys.codes().any(|code| supported.contains(Key::new(code)))
}

/// Find input devices under /dev/input/ that report any tracked key.
pub fn find_devices(keys: &TrackedKeySet) -> Result<Vec<PathBuf>> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir(INPUT_DIR).context("reading /dev/input")? {
        let entry = entry?;
        let path = entry.path();

        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if !is_event_node(name) {
            continue;
        }

        match Device::open(&path) {
            Ok(dev) => {
                if reports_tracked_key(&dev, keys) {
                    info!(path = %path.display(), name = ?dev.name(), "found input device");
                    devices.push(path);
                }
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping device");
            }
        }
    }

    Ok(devices)
}

/// Observe one device and forward tracked key transitions.
///
/// The device is not grabbed, other consumers still see every event. Keys that
/// are down when we attach are reported as presses, and keys still down when the
/// device goes away are reported as releases.
pub async fn watch_device(
    path: &Path,
    device_idx: usize,
    keys: &TrackedKeySet,
    tx: &mpsc::UnboundedSender<KeyEvent>,
) -> Result<()> {
    let dev = Device::open(path).with_context(|| format!("opening {}", path.display()))?;
    if !reports_tracked_key(&dev, keys) {
        debug!(path = %path.display(), "device reports no tracked key");
        return Ok(());
    }

    let dev_name = dev.name().unwrap_or("unknown").to_string();
    info!(device = %dev_name, path = %path.display(), "watching device");

    let mut down = DeviceKeys::new(device_idx);
    match dev.get_key_state() {
        Ok(state) => {
            for ev in down.seed(state.iter().map(|k| k.code()), keys) {
                let _ = tx.send(ev);
            }
        }
        Err(e) => debug!(device = %dev_name, error = %e, "could not read key state"),
    }

    let mut stream = dev.into_event_stream().context("creating event stream")?;

    loop {
        match stream.next_event().await {
            Ok(event) => {
                let Some(ev) = key_event(device_idx, &event, keys) else {
                    continue;
                };
                down.track(&ev);
                if tx.send(ev).is_err() {
                    // Receiver dropped, shut down
                    return Ok(());
                }
            }
            Err(e) => {
                warn!(device = %dev_name, error = %e, "device error, stopping watch");
                break;
            }
        }
    }

    for ev in down.drain() {
        let _ = tx.send(ev);
    }

    Ok(())
}

struct FeedState {
    keys: Arc<TrackedKeySet>,
    tx: mpsc::UnboundedSender<KeyEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Node path to the index of the watch currently bound to it.
    attached: Mutex<HashMap<PathBuf, usize>>,
    next_idx: AtomicUsize,
}

impl FeedState {
    fn attach(self: &Arc<Self>, path: PathBuf) {
        let device_idx = {
            let mut attached = self.attached.lock();
            if let Some(idx) = attached.get(&path) {
                debug!(path = %path.display(), device = idx, "already watching, skipping attach");
                return;
            }
            let device_idx = self.next_idx.fetch_add(1, Ordering::Relaxed);
            attached.insert(path.clone(), device_idx);
            device_idx
        };

        let feed = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = watch_device(&path, device_idx, &feed.keys, &feed.tx).await {
                warn!(path = %path.display(), error = %e, "device watch failed");
            }
            feed.detach(&path, device_idx);
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Forget `path` if it is still bound to `device_idx`. A node recreated under the
    /// same path keeps its newer binding.
    fn detach(&self, path: &Path, device_idx: usize) -> bool {
        let mut attached = self.attached.lock();
        if attached.get(path) == Some(&device_idx) {
            attached.remove(path);
            true
        } else {
            false
        }
    }

    /// The node was removed; let a node created under the same path attach again.
    fn forget(&self, path: &Path) {
        if let Some(idx) = self.attached.lock().remove(path) {
            debug!(path = %path.display(), device = idx, "input device removed");
        }
    }
}

/// Watch /dev/input for new event nodes and attach them.
async fn watch_hotplug(feed: Arc<FeedState>) -> Result<()> {
    let inotify = Inotify::init().context("initializing inotify")?;
    inotify
        .watches()
        .add(INPUT_DIR, WatchMask::CREATE | WatchMask::DELETE)
        .context("watching /dev/input")?;
    let mut events = inotify
        .into_event_stream([0u8; 1024])
        .context("creating inotify stream")?;

    while let Some(event) = events.next().await {
        let event = event.context("reading inotify event")?;
        let Some(name) = event.name.as_ref().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_event_node(name) {
            continue;
        }
        let path = Path::new(INPUT_DIR).join(name);

        if event.mask.contains(EventMask::DELETE) {
            feed.forget(&path);
            continue;
        }

        // udev may not have applied permissions yet
        tokio::time::sleep(HOTPLUG_SETTLE).await;
        debug!(node = name, "input device appeared");
        feed.attach(path);
    }

    Ok(())
}

/// All evdev devices carrying tracked keys, plus the hot-plug watcher.
pub struct DeviceFeed {
    state: Arc<FeedState>,
    hotplug: Option<JoinHandle<()>>,
}

impl DeviceFeed {
    /// Attach to current devices and start watching for new ones.
    /// Must be called from within a tokio runtime.
    pub fn start(keys: Arc<TrackedKeySet>, tx: mpsc::UnboundedSender<KeyEvent>) -> Result<Self> {
        let devices = find_devices(&keys)?;
        let state = Arc::new(FeedState {
            keys,
            tx,
            tasks: Mutex::new(Vec::new()),
            attached: Mutex::new(HashMap::new()),
            next_idx: AtomicUsize::new(0),
        });
        for path in devices {
            state.attach(path);
        }

        let hotplug_state = Arc::clone(&state);
        let hotplug = tokio::spawn(async move {
            if let Err(e) = watch_hotplug(hotplug_state).await {
                warn!(error = %e, "hot-plug watcher stopped");
            }
        });

        Ok(Self {
            state,
            hotplug: Some(hotplug),
        })
    }

    pub fn device_count(&self) -> usize {
        self.state.attached.lock().len()
    }
}

impl EventSource for DeviceFeed {
    fn deregister(&mut self) {
        if let Some(hotplug) = self.hotplug.take() {
            hotplug.abort();
        }
        let tasks = std::mem::take(&mut *self.state.tasks.lock());
        info!(devices = tasks.len(), "detaching from input devices");
        for task in tasks {
            task.abort();
        }
    }
}
