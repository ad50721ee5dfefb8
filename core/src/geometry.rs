use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::Duration;
use tokio::time::Instant;

/// Cached sizes are trusted for this long; entries are evicted lazily on
/// the read path rather than by a background sweep.
const SIZE_CACHE_TTL: Duration = Duration::from_secs(12 * 60 * 60); // 12h

/// Extra columns added to any cache-derived bootstrap size. Downstream
/// renderers were observed to lose line-wrapping correctness when the
/// width grew by 2-3 columns after bootstrap, so we over-allocate up
/// front. Distinct from [`MEASURED_EDGE_GUARD_COLS`]; keep both.
const BOOTSTRAP_MARGIN_COLS: u16 = 2;

/// Columns shaved off a live-measured size before spawning, guarding the
/// right render edge. A live measurement is already trustworthy, so it
/// gets this small fixed guard instead of the bootstrap margin.
const MEASURED_EDGE_GUARD_COLS: u16 = 2;

const MIN_BOOTSTRAP_COLS: u16 = 100;
const MAX_BOOTSTRAP_COLS: u16 = 280;
const MIN_BOOTSTRAP_ROWS: u16 = 28;
const MAX_BOOTSTRAP_ROWS: u16 = 90;

/// Assumed display when no viewport source is wired up.
const FALLBACK_VIEWPORT: ViewportSize = ViewportSize {
    width: 1440,
    height: 900,
};

/// Keys carrying this suffix identify secondary/bottom panes, which are
/// poor size hints for a brand-new primary terminal.
pub const SECONDARY_PANE_SUFFIX: &str = ":bottom";

/// Terminal dimensions safe to hand to a PTY allocator: `cols >= 2` and
/// `rows >= 1` are enforced by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnSize {
    cols: u16,
    rows: u16,
}

impl SpawnSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols: cols.max(2),
            rows: rows.max(1),
        }
    }

    pub fn cols(self) -> u16 {
        self.cols
    }

    pub fn rows(self) -> u16 {
        self.rows
    }
}

/// A size reported by a live, mounted UI surface. Both dimensions are
/// required; a partial measurement is no measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasuredSize {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

/// Optional collaborator supplying the current display size for the
/// last-resort bootstrap heuristic.
pub trait ViewportSource: Send + Sync {
    fn viewport_size(&self) -> Option<ViewportSize>;
}

#[derive(Debug, Clone, Copy)]
struct SizeCacheEntry {
    cols: u16,
    rows: u16,
    recorded_at: Instant,
}

/// Request for the size a new pairing should be spawned at.
#[derive(Debug, Clone, Copy)]
pub struct SpawnSizeRequest<'a> {
    pub key: &'a str,
    /// Live measurement from an already-mounted surface, when available.
    pub measured: Option<MeasuredSize>,
    /// Sibling terminal to borrow a size hint from (e.g. the project's
    /// orchestrator terminal) when `key` itself has no cached size.
    pub related_key: Option<&'a str>,
}

/// Predicts terminal geometry before the owning UI surface mounts, so the
/// PTY can be allocated at (close to) its final size and visible reflow
/// is minimized.
#[derive(Default)]
pub struct TerminalGeometryResolver {
    cache: Mutex<IndexMap<String, SizeCacheEntry>>,
    viewport: Option<Arc<dyn ViewportSource>>,
}

impl TerminalGeometryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_viewport_source(viewport: Arc<dyn ViewportSource>) -> Self {
        Self {
            cache: Mutex::new(IndexMap::new()),
            viewport: Some(viewport),
        }
    }

    /// Unconditionally overwrite the cached size for `key`, stamping it
    /// with the current time.
    pub fn record_size(&self, key: &str, cols: u16, rows: u16) {
        let entry = SizeCacheEntry {
            cols,
            rows,
            recorded_at: Instant::now(),
        };
        self.lock().insert(key.to_string(), entry);
    }

    /// Cached size for `key`, if recorded within the TTL. A stale entry
    /// is evicted here, on read.
    pub fn get_size(&self, key: &str) -> Option<(u16, u16)> {
        let now = Instant::now();
        let mut cache = self.lock();
        match cache.get(key) {
            Some(entry) if now.duration_since(entry.recorded_at) <= SIZE_CACHE_TTL => {
                Some((entry.cols, entry.rows))
            }
            Some(_) => {
                cache.shift_remove(key);
                None
            }
            None => None,
        }
    }

    /// Best `{cols, rows}` estimate for a pairing that has never been
    /// measured: exact cache hit, then the related key, then the first
    /// live primary-terminal entry, then a viewport-derived heuristic.
    /// Cache-derived results get the bootstrap column margin; everything
    /// is clamped to the bootstrap bounds.
    pub fn best_bootstrap_size(&self, key: &str, related_key: Option<&str>) -> SpawnSize {
        if let Some((cols, rows)) = self.get_size(key) {
            return clamp_bootstrap(cols.saturating_add(BOOTSTRAP_MARGIN_COLS), rows);
        }
        if let Some(related) = related_key {
            if let Some((cols, rows)) = self.get_size(related) {
                return clamp_bootstrap(cols.saturating_add(BOOTSTRAP_MARGIN_COLS), rows);
            }
        }
        if let Some((cols, rows)) = self.first_live_primary_entry() {
            return clamp_bootstrap(cols.saturating_add(BOOTSTRAP_MARGIN_COLS), rows);
        }
        self.viewport_estimate()
    }

    /// Size to allocate the PTY at. A live measurement wins and only
    /// loses the fixed right-edge guard; otherwise the bootstrap chain
    /// decides. The `cols >= 2` floor holds on both paths.
    pub fn compute_spawn_size(&self, request: SpawnSizeRequest<'_>) -> SpawnSize {
        match request.measured {
            Some(measured) => SpawnSize::new(
                measured.cols.saturating_sub(MEASURED_EDGE_GUARD_COLS),
                measured.rows,
            ),
            None => self.best_bootstrap_size(request.key, request.related_key),
        }
    }

    /// Test hook: drop every cached entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Scan insertion order for the first non-expired entry whose key
    /// denotes a primary terminal. Expired entries encountered along the
    /// way are evicted as a side effect.
    fn first_live_primary_entry(&self) -> Option<(u16, u16)> {
        let now = Instant::now();
        let mut cache = self.lock();
        let mut stale: Vec<String> = Vec::new();
        let mut found = None;
        for (key, entry) in cache.iter() {
            if now.duration_since(entry.recorded_at) > SIZE_CACHE_TTL {
                stale.push(key.clone());
                continue;
            }
            if is_primary_key(key) {
                found = Some((entry.cols, entry.rows));
                break;
            }
        }
        for key in stale {
            cache.shift_remove(&key);
        }
        found
    }

    fn viewport_estimate(&self) -> SpawnSize {
        let viewport = self
            .viewport
            .as_ref()
            .and_then(|source| source.viewport_size())
            .unwrap_or(FALLBACK_VIEWPORT);
        let cols = ((f64::from(viewport.width) - 360.0) / 8.5).floor();
        let rows = ((f64::from(viewport.height) - 280.0) / 17.0).floor();
        SpawnSize::new(
            cols.clamp(f64::from(MIN_BOOTSTRAP_COLS), f64::from(MAX_BOOTSTRAP_COLS)) as u16,
            rows.clamp(f64::from(MIN_BOOTSTRAP_ROWS), f64::from(MAX_BOOTSTRAP_ROWS)) as u16,
        )
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, SizeCacheEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_primary_key(key: &str) -> bool {
    !key.ends_with(SECONDARY_PANE_SUFFIX)
}

fn clamp_bootstrap(cols: u16, rows: u16) -> SpawnSize {
    SpawnSize::new(
        cols.clamp(MIN_BOOTSTRAP_COLS, MAX_BOOTSTRAP_COLS),
        rows.clamp(MIN_BOOTSTRAP_ROWS, MAX_BOOTSTRAP_ROWS),
    )
}
