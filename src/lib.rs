#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like HDMI
#![allow(clippy::upper_case_acronyms)]

//! # hwcomposer: hardware composition for kms devices
//!
//! This crate takes the layer stack of a frame (buffers with placement, transform,
//! blending and fences), decides which layers can be scanned out directly by the
//! hardware planes of a display, reports the rest back for gpu composition and
//! commits the result to the kernel atomically.
//!
//! ## Structure of the crate
//!
//! - [`backend`] contains everything talking to the hardware: buffer import,
//!   fences, the device topology and the compositor itself, see
//!   [`backend::drm::compositor`].
//! - [`utils`] contains geometry helpers and file descriptor wrappers.
//!
//! Every display is driven by its own worker thread, so a slow or stalled
//! display never delays the others.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```
//!
//! ### Configuration
//!
//! [`CompositorConfig::from_env`](backend::drm::compositor::CompositorConfig::from_env)
//! reads the following environment variables:
//!
//! - `HWC_TIE_BREAK`: `area`, `zorder` or `capability`
//! - `HWC_MAX_OVERLAYS`: maximum number of overlay planes used per display
//! - `HWC_DISABLE_CURSOR_PLANE`: never put layers on cursor planes
//! - `HWC_COMMIT_TIMEOUT_MS`: how long a display waits for a commit to complete

pub mod backend;
pub mod utils;
