//! Texture admission and throttling
//!
//! Process-wide state shared by every concurrently loading model: one
//! FIFO admission queue bounded by a concurrency ceiling, and one memory
//! budget divided across the estimated texture count. One model's
//! textures can therefore be throttled by another's in-flight requests;
//! that is intentional, it bounds total device memory.
//!
//! Failures never starve the queue: success or not, the slot is
//! released, the next request admitted, and the ticket resolves with
//! `None` so the owning material renders without that map.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use image::{imageops::FilterType, DynamicImage};
use parking_lot::Mutex;

use crate::config::TextureConfig;
use crate::source::ResourceSource;

/// Decoded RGBA8 texture ready for upload
#[derive(Clone, Debug)]
pub struct TextureAsset {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    /// Raw RGBA pixel data, `width * height * 4` bytes
    pub data: Vec<u8>,
    pub srgb: bool,
}

/// Per-request decode options
#[derive(Clone, Copy, Debug)]
pub struct TextureOptions {
    pub srgb: bool,
}

impl Default for TextureOptions {
    fn default() -> Self {
        Self { srgb: true }
    }
}

type Resolved = Option<Arc<TextureAsset>>;

/// Completion handle for one texture request
pub struct TextureTicket {
    rx: Receiver<Resolved>,
    done: Option<Resolved>,
}

impl TextureTicket {
    /// Poll for the result without blocking
    pub fn try_resolve(&mut self) -> Option<Resolved> {
        if self.done.is_none() {
            self.done = self.rx.try_recv().ok();
        }
        self.done.clone()
    }

    /// Wait for the result up to `timeout`
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Resolved> {
        if self.done.is_none() {
            self.done = self.rx.recv_timeout(timeout).ok();
        }
        self.done.clone()
    }
}

struct Slot {
    resolved: Option<Resolved>,
    waiters: Vec<Sender<Resolved>>,
}

struct QueuedFetch {
    uri: String,
    options: TextureOptions,
    source: Arc<dyn ResourceSource>,
}

struct ThrottleState {
    in_flight: usize,
    high_water: usize,
    queue: VecDeque<QueuedFetch>,
    slots: HashMap<String, Slot>,
    estimated_textures: usize,
    pixel_budget: u64,
    resolved: u64,
    failed: u64,
}

/// Process-wide texture admission state
pub struct TextureThrottler {
    config: TextureConfig,
    state: Mutex<ThrottleState>,
}

impl TextureThrottler {
    pub fn new(config: TextureConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(ThrottleState {
                in_flight: 0,
                high_water: 0,
                queue: VecDeque::new(),
                slots: HashMap::new(),
                estimated_textures: 0,
                pixel_budget: u64::MAX,
                resolved: 0,
                failed: 0,
            }),
        })
    }

    /// Request a texture. The first request for a uri creates its slot
    /// and enqueues a fetch; later requests share the same resolution.
    pub fn request(
        self: &Arc<Self>,
        uri: impl Into<String>,
        options: TextureOptions,
        source: Arc<dyn ResourceSource>,
    ) -> TextureTicket {
        let uri = uri.into();
        let (tx, rx) = bounded(1);
        let mut state = self.state.lock();
        match state.slots.get_mut(&uri) {
            Some(slot) => match &slot.resolved {
                Some(resolved) => {
                    let _ = tx.send(resolved.clone());
                }
                None => slot.waiters.push(tx),
            },
            None => {
                state.slots.insert(
                    uri.clone(),
                    Slot {
                        resolved: None,
                        waiters: vec![tx],
                    },
                );
                let fetch = QueuedFetch {
                    uri,
                    options,
                    source,
                };
                if state.in_flight < self.config.ceiling {
                    self.spawn_fetch(&mut state, fetch);
                } else {
                    state.queue.push_back(fetch);
                }
            }
        }
        TextureTicket { rx, done: None }
    }

    /// Adjust the estimated texture count; the per-texture pixel budget
    /// is recomputed from `memory_budget / (count * 4)`
    pub fn add_estimated(&self, count: usize) {
        let mut state = self.state.lock();
        state.estimated_textures += count;
        Self::recompute_budget(&self.config, &mut state);
    }

    pub fn remove_estimated(&self, count: usize) {
        let mut state = self.state.lock();
        state.estimated_textures = state.estimated_textures.saturating_sub(count);
        Self::recompute_budget(&self.config, &mut state);
    }

    fn recompute_budget(config: &TextureConfig, state: &mut ThrottleState) {
        state.pixel_budget = if state.estimated_textures == 0 {
            u64::MAX
        } else {
            (config.memory_budget_bytes / (state.estimated_textures as u64 * 4)).max(1)
        };
        log::debug!(
            "texture budget: {} estimated, {} pixels each",
            state.estimated_textures,
            state.pixel_budget
        );
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Highest concurrent in-flight count observed
    pub fn high_water(&self) -> usize {
        self.state.lock().high_water
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn resolved_count(&self) -> u64 {
        self.state.lock().resolved
    }

    pub fn failed_count(&self) -> u64 {
        self.state.lock().failed
    }

    pub fn pixel_budget(&self) -> u64 {
        self.state.lock().pixel_budget
    }

    /// Drop a model's slots on unload. In-flight fetches for other
    /// models are unaffected.
    pub fn dispose_slots(&self, uris: &[String]) {
        let mut state = self.state.lock();
        for uri in uris {
            state.slots.remove(uri);
        }
    }

    fn spawn_fetch(self: &Arc<Self>, state: &mut ThrottleState, fetch: QueuedFetch) {
        state.in_flight += 1;
        state.high_water = state.high_water.max(state.in_flight);
        let budget = state.pixel_budget;
        let uri = fetch.uri.clone();
        let throttler = self.clone();
        let spawned = thread::Builder::new().name("strata-texture".into()).spawn(
            move || {
                let result = fetch_and_decode(&fetch, budget);
                throttler.finish(&fetch.uri, result);
            },
        );
        if let Err(e) = spawned {
            log::warn!("texture fetch thread failed to start: {e}");
            state.in_flight -= 1;
            Self::resolve_slot(state, &uri, None);
        }
    }

    fn finish(self: &Arc<Self>, uri: &str, result: Option<TextureAsset>) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        Self::resolve_slot(&mut state, uri, result.map(Arc::new));
        // The freed slot admits the next queued request, failures
        // included.
        while state.in_flight < self.config.ceiling {
            let Some(next) = state.queue.pop_front() else {
                break;
            };
            self.spawn_fetch(&mut state, next);
        }
    }

    fn resolve_slot(state: &mut ThrottleState, uri: &str, resolved: Resolved) {
        if resolved.is_some() {
            state.resolved += 1;
        } else {
            state.failed += 1;
        }
        if let Some(slot) = state.slots.get_mut(uri) {
            slot.resolved = Some(resolved.clone());
            for waiter in slot.waiters.drain(..) {
                let _ = waiter.send(resolved.clone());
            }
        }
    }
}

fn fetch_and_decode(fetch: &QueuedFetch, pixel_budget: u64) -> Option<TextureAsset> {
    let uri = fetch.source.resolve(&fetch.uri);
    let bytes = match fetch.source.fetch(&uri) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("texture fetch failed: {e}");
            return None;
        }
    };
    let image = match image::load_from_memory(&bytes) {
        Ok(image) => image,
        Err(e) => {
            log::warn!("texture decode failed for {uri}: {e}");
            return None;
        }
    };
    let image = constrain_to_budget(image, pixel_budget);
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    Some(TextureAsset {
        uri: fetch.uri.clone(),
        width,
        height,
        data: rgba.into_raw(),
        srgb: fetch.options.srgb,
    })
}

/// Downsample an image whose pixel area exceeds the budget to the
/// largest power-of-two size that fits, by progressive halving
pub(crate) fn constrain_to_budget(image: DynamicImage, max_pixels: u64) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    if u64::from(width) * u64::from(height) <= max_pixels {
        return image;
    }
    let mut target_w = previous_power_of_two(width);
    let mut target_h = previous_power_of_two(height);
    while u64::from(target_w) * u64::from(target_h) > max_pixels
        && (target_w > 1 || target_h > 1)
    {
        target_w = (target_w / 2).max(1);
        target_h = (target_h / 2).max(1);
    }
    log::debug!(
        "downsampling {width}x{height} to {target_w}x{target_h} (budget {max_pixels} px)"
    );
    image.resize_exact(target_w, target_h, FilterType::Lanczos3)
}

fn previous_power_of_two(value: u32) -> u32 {
    if value == 0 {
        1
    } else {
        1 << (31 - value.leading_zeros())
    }
}
