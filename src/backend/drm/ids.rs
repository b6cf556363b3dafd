//! Identifiers of kernel mode-setting objects
//!
//! All cross references between resources are plain identifiers resolved
//! through the owning registry.

use std::fmt;

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal $(, $handle:ty)?) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for u32 {
            #[inline]
            fn from(id: $name) -> u32 {
                id.0
            }
        }

        $(
            #[cfg(feature = "backend_drm")]
            impl From<$handle> for $name {
                #[inline]
                fn from(handle: $handle) -> Self {
                    $name(u32::from(handle))
                }
            }

            #[cfg(feature = "backend_drm")]
            impl TryFrom<$name> for $handle {
                type Error = $name;

                #[inline]
                fn try_from(id: $name) -> Result<Self, Self::Error> {
                    drm::control::from_u32(id.0).ok_or(id)
                }
            }
        )?
    };
}

resource_id!(
    /// Identifier of a connector
    ConnectorId, "connector", drm::control::connector::Handle
);
resource_id!(
    /// Identifier of an encoder
    EncoderId, "encoder", drm::control::encoder::Handle
);
resource_id!(
    /// Identifier of a crtc
    CrtcId, "crtc", drm::control::crtc::Handle
);
resource_id!(
    /// Identifier of a plane
    PlaneId, "plane", drm::control::plane::Handle
);
resource_id!(
    /// Identifier of an object property
    PropertyId, "property", drm::control::property::Handle
);
resource_id!(
    /// Identifier of a framebuffer
    FramebufferId, "framebuffer", drm::control::framebuffer::Handle
);
resource_id!(
    /// Registry-assigned identifier of a mode
    ///
    /// Stays stable across re-enumeration as long as the mode's timings do.
    ModeId, "mode"
);
resource_id!(
    /// Logical display index
    DisplayId, "display"
);

/// Any mode-setting object properties can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    /// A connector
    Connector(ConnectorId),
    /// A crtc
    Crtc(CrtcId),
    /// A plane
    Plane(PlaneId),
}

impl ObjectId {
    /// Raw kernel id of the object
    pub fn raw(&self) -> u32 {
        match self {
            ObjectId::Connector(id) => id.0,
            ObjectId::Crtc(id) => id.0,
            ObjectId::Plane(id) => id.0,
        }
    }
}

impl From<ConnectorId> for ObjectId {
    fn from(id: ConnectorId) -> Self {
        ObjectId::Connector(id)
    }
}

impl From<CrtcId> for ObjectId {
    fn from(id: CrtcId) -> Self {
        ObjectId::Crtc(id)
    }
}

impl From<PlaneId> for ObjectId {
    fn from(id: PlaneId) -> Self {
        ObjectId::Plane(id)
    }
}
