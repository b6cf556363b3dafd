use std::{env, time::Duration};

use tracing::{info, warn};

/// Which layer wins when two layers compete for the last fitting plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TieBreak {
    /// Larger on-screen area first, then tighter requirements, then z-order
    #[default]
    Area,
    /// Front-most layer first, then larger area
    ZOrder,
    /// Tighter requirements first, then larger area, then z-order
    CapabilityFit,
}

impl TieBreak {
    fn parse(value: &str) -> Option<TieBreak> {
        match &*value.to_lowercase() {
            "area" => Some(TieBreak::Area),
            "zorder" | "z-order" => Some(TieBreak::ZOrder),
            "capability" | "capability-fit" => Some(TieBreak::CapabilityFit),
            _ => None,
        }
    }
}

/// Tunables of the [`DrmCompositor`](super::DrmCompositor)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositorConfig {
    /// Plane contention policy of the planner
    pub tie_break: TieBreak,
    /// Upper bound of overlay planes used per display
    pub max_overlays: Option<usize>,
    /// Whether cursor buffers may use cursor planes
    pub use_cursor_plane: bool,
    /// How long to wait for a commit to complete before reporting a stall
    pub commit_timeout: Duration,
    /// Consecutive stalls after which an in-flight commit is given up
    pub stall_limit: u32,
    /// How long to wait for an acquire fence if planes cannot wait on it
    pub fence_timeout: Duration,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        CompositorConfig {
            tie_break: TieBreak::default(),
            max_overlays: None,
            use_cursor_plane: true,
            commit_timeout: Duration::from_millis(100),
            stall_limit: 3,
            fence_timeout: Duration::from_millis(50),
        }
    }
}

fn flag(value: &str) -> bool {
    let value = value.to_lowercase();
    value == "1" || value == "true" || value == "yes" || value == "y"
}

impl CompositorConfig {
    /// Default configuration with environment overrides applied
    ///
    /// - `HWC_TIE_BREAK`: `area`, `zorder` or `capability`
    /// - `HWC_MAX_OVERLAYS`: maximum number of overlay planes per display
    /// - `HWC_DISABLE_CURSOR_PLANE`: `1`, `true`, `yes` or `y`
    /// - `HWC_COMMIT_TIMEOUT_MS`: commit completion timeout in milliseconds
    /// - `HWC_STALL_LIMIT`: consecutive timeouts before a commit is given up
    ///
    /// Unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = var("HWC_TIE_BREAK") {
            match TieBreak::parse(&value) {
                Some(tie_break) => {
                    info!(?tie_break, "HWC_TIE_BREAK is set");
                    self.tie_break = tie_break;
                }
                None => warn!("Ignoring unknown HWC_TIE_BREAK value: {}", value),
            }
        }

        if let Some(value) = var("HWC_MAX_OVERLAYS") {
            match value.parse::<usize>() {
                Ok(max) => self.max_overlays = Some(max),
                Err(err) => warn!("Ignoring HWC_MAX_OVERLAYS={}: {}", value, err),
            }
        }

        if let Some(value) = var("HWC_DISABLE_CURSOR_PLANE") {
            if flag(&value) {
                info!("HWC_DISABLE_CURSOR_PLANE is set. Not using cursor planes.");
                self.use_cursor_plane = false;
            }
        }

        if let Some(value) = var("HWC_COMMIT_TIMEOUT_MS") {
            match value.parse::<u64>() {
                Ok(ms) if ms > 0 => self.commit_timeout = Duration::from_millis(ms),
                _ => warn!("Ignoring invalid HWC_COMMIT_TIMEOUT_MS value: {}", value),
            }
        }

        if let Some(value) = var("HWC_STALL_LIMIT") {
            match value.parse::<u32>() {
                Ok(limit) if limit > 0 => self.stall_limit = limit,
                _ => warn!("Ignoring invalid HWC_STALL_LIMIT value: {}", value),
            }
        }

        self
    }
}
