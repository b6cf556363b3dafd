use std::fmt;

use crate::backend::drm::ModeId;

/// Mode type bit flagging the sink's preferred mode
pub const MODE_TYPE_PREFERRED: u32 = 1 << 3;
/// Mode type bit flagging modes supplied by the driver
pub const MODE_TYPE_DRIVER: u32 = 1 << 6;

/// Display timings as reported by the device
///
/// Two modes are equal if their timings are equal, regardless of name or type.
#[derive(Clone)]
pub struct ModeInfo {
    /// Pixel clock in kHz
    pub clock: u32,
    /// Horizontal active pixels
    pub hdisplay: u16,
    /// Horizontal sync start
    pub hsync_start: u16,
    /// Horizontal sync end
    pub hsync_end: u16,
    /// Horizontal total
    pub htotal: u16,
    /// Horizontal skew
    pub hskew: u16,
    /// Vertical active lines
    pub vdisplay: u16,
    /// Vertical sync start
    pub vsync_start: u16,
    /// Vertical sync end
    pub vsync_end: u16,
    /// Vertical total
    pub vtotal: u16,
    /// Vertical scan
    pub vscan: u16,
    /// Nominal refresh rate in Hz
    pub vrefresh: u32,
    /// Mode flags (sync polarity, interlacing, ...)
    pub flags: u32,
    /// Mode type bits
    pub mode_type: u32,
    /// Name of the mode
    pub name: String,
}

impl ModeInfo {
    /// Create a mode with simple timings for the given resolution and refresh rate
    ///
    /// Blanking intervals follow reduced-blanking proportions.
    pub fn with_resolution(width: u16, height: u16, refresh: u32) -> ModeInfo {
        let htotal = width + 160;
        let vtotal = height + 30;
        let clock = (htotal as u64 * vtotal as u64 * refresh as u64 / 1000) as u32;
        ModeInfo {
            clock,
            hdisplay: width,
            hsync_start: width + 48,
            hsync_end: width + 80,
            htotal,
            hskew: 0,
            vdisplay: height,
            vsync_start: height + 3,
            vsync_end: height + 9,
            vtotal,
            vscan: 0,
            vrefresh: refresh,
            flags: 0,
            mode_type: MODE_TYPE_DRIVER,
            name: format!("{}x{}", width, height),
        }
    }

    /// Mark this mode as the preferred one
    pub fn preferred(mut self) -> Self {
        self.mode_type |= MODE_TYPE_PREFERRED;
        self
    }

    /// Active area as (width, height)
    pub fn size(&self) -> (u16, u16) {
        (self.hdisplay, self.vdisplay)
    }

    /// Whether the sink flags this mode as preferred
    pub fn is_preferred(&self) -> bool {
        self.mode_type & MODE_TYPE_PREFERRED != 0
    }

    /// Refresh rate derived from the timings in mHz
    pub fn refresh_rate_millihz(&self) -> u32 {
        if self.htotal == 0 || self.vtotal == 0 {
            return self.vrefresh * 1000;
        }
        let clock_millihz = self.clock as u64 * 1_000_000;
        let htotal = self.htotal as u64;
        let vtotal = self.vtotal as u64;
        (((clock_millihz / htotal) + (vtotal / 2)) / vtotal) as u32
    }
}

impl PartialEq for ModeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.clock == other.clock
            && self.hdisplay == other.hdisplay
            && self.hsync_start == other.hsync_start
            && self.hsync_end == other.hsync_end
            && self.htotal == other.htotal
            && self.hskew == other.hskew
            && self.vdisplay == other.vdisplay
            && self.vsync_start == other.vsync_start
            && self.vsync_end == other.vsync_end
            && self.vtotal == other.vtotal
            && self.vscan == other.vscan
            && self.vrefresh == other.vrefresh
            && self.flags == other.flags
    }
}

impl Eq for ModeInfo {}

impl fmt::Debug for ModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" {}x{}@{:.2}",
            self.name,
            self.hdisplay,
            self.vdisplay,
            self.refresh_rate_millihz() as f64 / 1000.0
        )
    }
}

#[cfg(feature = "backend_drm")]
impl From<drm::control::Mode> for ModeInfo {
    fn from(mode: drm::control::Mode) -> Self {
        let (hdisplay, vdisplay) = mode.size();
        let (hsync_start, hsync_end, htotal) = mode.hsync();
        let (vsync_start, vsync_end, vtotal) = mode.vsync();
        ModeInfo {
            clock: mode.clock(),
            hdisplay,
            hsync_start,
            hsync_end,
            htotal,
            hskew: mode.hskew(),
            vdisplay,
            vsync_start,
            vsync_end,
            vtotal,
            vscan: mode.vscan(),
            vrefresh: mode.vrefresh(),
            flags: mode.flags().bits(),
            mode_type: mode.mode_type().bits(),
            name: mode.name().to_string_lossy().into_owned(),
        }
    }
}

#[cfg(feature = "backend_drm")]
impl From<&ModeInfo> for drm::control::Mode {
    fn from(mode: &ModeInfo) -> Self {
        let mut name = [0; 32];
        for (dst, src) in name.iter_mut().zip(mode.name.bytes().take(31)) {
            *dst = src as _;
        }
        drm_ffi::drm_mode_modeinfo {
            clock: mode.clock,
            hdisplay: mode.hdisplay,
            hsync_start: mode.hsync_start,
            hsync_end: mode.hsync_end,
            htotal: mode.htotal,
            hskew: mode.hskew,
            vdisplay: mode.vdisplay,
            vsync_start: mode.vsync_start,
            vsync_end: mode.vsync_end,
            vtotal: mode.vtotal,
            vscan: mode.vscan,
            vrefresh: mode.vrefresh,
            flags: mode.flags,
            type_: mode.mode_type,
            name,
        }
        .into()
    }
}

/// A mode as tracked by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mode {
    id: ModeId,
    info: ModeInfo,
}

impl Mode {
    pub(super) fn new(id: ModeId, info: ModeInfo) -> Self {
        Mode { id, info }
    }

    /// Registry-assigned identifier
    pub fn id(&self) -> ModeId {
        self.id
    }

    /// Timings of this mode
    pub fn info(&self) -> &ModeInfo {
        &self.info
    }
}
