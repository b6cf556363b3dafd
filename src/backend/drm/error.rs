use std::{io, path::PathBuf};

use super::{ConnectorId, CrtcId, DisplayId, EncoderId, ModeId, ObjectId, PlaneId};
use crate::backend::allocator::ImportError;

/// Error returned by a [`DisplayDevice`](super::DisplayDevice) operation
#[derive(thiserror::Error, Debug)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

/// Outcome of a failed commit on the device level
#[derive(thiserror::Error, Debug)]
pub enum CommitError {
    /// The device refused the requested configuration
    #[error("The device rejected the commit: {0}")]
    Rejected(#[source] io::Error),
    /// The device could not be reached
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// Errors thrown by the [`ResourceRegistry`](super::ResourceRegistry)
/// and the [`DrmCompositor`](super::DrmCompositor).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Enumerating the device topology failed or returned a malformed topology
    #[error("Failed to query the device topology: {errmsg}")]
    DeviceQuery {
        /// Error message associated to the failure
        errmsg: &'static str,
        /// Underlying device error, if any
        #[source]
        source: Option<AccessError>,
    },
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// The device is missing a required property
    #[error("The device is missing a required property '{name}' for object ({handle:?})")]
    UnknownProperty {
        /// Object missing the property
        handle: ObjectId,
        /// Property name
        name: &'static str,
    },
    /// The connector is not known to the registry
    #[error("Unknown connector `{0:?}`")]
    UnknownConnector(ConnectorId),
    /// The encoder is not known to the registry
    #[error("Unknown encoder `{0:?}`")]
    UnknownEncoder(EncoderId),
    /// The crtc is not known to the registry
    #[error("Unknown crtc `{0:?}`")]
    UnknownCrtc(CrtcId),
    /// The plane is not known to the registry
    #[error("Unknown plane `{0:?}`")]
    UnknownPlane(PlaneId),
    /// The mode does not belong to the display's connector
    #[error("Unknown mode `{0:?}`")]
    UnknownMode(ModeId),
    /// No display compositor exists for the display
    #[error("Unknown display `{0:?}`")]
    UnknownDisplay(DisplayId),
    /// No encoder can drive the connector
    #[error("No encoder found for connector `{connector:?}`")]
    NoSuitableEncoder {
        /// Connector
        connector: ConnectorId,
    },
    /// Every crtc the connector's encoders can drive is in use
    #[error("No free crtc found for connector `{connector:?}`")]
    NoSuitableCrtc {
        /// Connector
        connector: ConnectorId,
    },
    /// A composition is already waiting to be applied on the display
    #[error("Display `{0:?}` already has a pending composition")]
    Busy(DisplayId),
    /// The device refused the commit; the composition was discarded
    #[error("Commit on crtc `{crtc:?}` was rejected")]
    CommitRejected {
        /// Crtc the commit was issued for
        crtc: CrtcId,
        /// Error returned by the device
        #[source]
        source: io::Error,
    },
    /// The composition was discarded by clearing its display
    #[error("Composition for display `{0:?}` was discarded")]
    Discarded(DisplayId),
    /// The previous commit of the display never completed and was given up
    #[error("Display `{0:?}` stalled, previous commit never completed")]
    Stalled(DisplayId),
    /// The connector does not expose the optional property
    #[error("Connector `{connector:?}` does not support '{name}'")]
    Unsupported {
        /// Connector
        connector: ConnectorId,
        /// Property name
        name: &'static str,
    },
    /// Importing a buffer failed
    #[error(transparent)]
    Import(#[from] ImportError),
}

impl Error {
    /// Map a device level commit failure for `crtc`
    pub(crate) fn from_commit(crtc: CrtcId, err: CommitError) -> Error {
        match err {
            CommitError::Rejected(source) => Error::CommitRejected { crtc, source },
            CommitError::Access(err) => Error::Access(err),
        }
    }
}
