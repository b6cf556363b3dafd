//! Opaque graphics-buffer handles as handed in by the buffer producer
//!
//! A [`BufferHandle`] describes the memory of one buffer: its size, pixel format,
//! modifier and up to [`MAX_PLANES`] planes, each a dmabuf file descriptor with
//! offset and stride. Handles act like smart pointers and can be freely cloned.
//! Use [`BufferHandle::try_clone_owned`] to obtain a copy that owns duplicated
//! descriptors and stays valid after the producer closed its own.

use std::{
    hash::{Hash, Hasher},
    io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use smallvec::SmallVec;

use super::{BufferUsage, Fourcc, Modifier};
use crate::utils::{Buffer as BufferCoords, Size};

/// Maximum amount of planes this implementation supports
pub const MAX_PLANES: usize = 4;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct BufferHandleInternal {
    id: u64,
    size: Size<i32, BufferCoords>,
    format: Fourcc,
    modifier: Modifier,
    usage: BufferUsage,
    planes: SmallVec<[HandlePlane; MAX_PLANES]>,
}

/// One memory plane of a buffer
#[derive(Debug)]
pub struct HandlePlane {
    fd: OwnedFd,
    /// Offset from the start of the fd
    pub offset: u32,
    /// Stride of this plane in bytes
    pub stride: u32,
}

impl AsFd for HandlePlane {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Strong reference to a buffer handle
#[derive(Debug, Clone)]
pub struct BufferHandle(Arc<BufferHandleInternal>);

impl PartialEq for BufferHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for BufferHandle {}

impl Hash for BufferHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}

/// Builder for [`BufferHandle`]s
#[derive(Debug)]
pub struct BufferHandleBuilder {
    internal: BufferHandleInternal,
}

impl BufferHandleBuilder {
    /// Add a plane to the constructed handle
    ///
    /// Returns `false` if [`MAX_PLANES`] planes were already added.
    pub fn add_plane(&mut self, fd: OwnedFd, offset: u32, stride: u32) -> bool {
        if self.internal.planes.len() == MAX_PLANES {
            return false;
        }
        self.internal.planes.push(HandlePlane { fd, offset, stride });
        true
    }

    /// Set the usage flags the producer allocated the buffer with
    pub fn usage(mut self, usage: BufferUsage) -> Self {
        self.internal.usage = usage;
        self
    }

    /// Build a `BufferHandle` out of the provided parameters and planes
    ///
    /// Returns `None` if the builder has no planes attached.
    pub fn build(self) -> Option<BufferHandle> {
        if self.internal.planes.is_empty() {
            return None;
        }
        Some(BufferHandle(Arc::new(self.internal)))
    }
}

impl BufferHandle {
    /// Create a new builder
    pub fn builder(size: impl Into<Size<i32, BufferCoords>>, format: Fourcc, modifier: Modifier) -> BufferHandleBuilder {
        BufferHandleBuilder {
            internal: BufferHandleInternal {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                size: size.into(),
                format,
                modifier,
                usage: BufferUsage::empty(),
                planes: SmallVec::new(),
            },
        }
    }

    /// Identifier of the underlying buffer memory
    ///
    /// Owned copies share the id of the handle they were created from.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Size of the buffer
    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.0.size
    }

    /// Pixel format of the buffer
    pub fn format(&self) -> Fourcc {
        self.0.format
    }

    /// Format modifier of the buffer
    pub fn modifier(&self) -> Modifier {
        self.0.modifier
    }

    /// Usage flags of the buffer
    pub fn usage(&self) -> BufferUsage {
        self.0.usage
    }

    /// The planes of this buffer
    pub fn planes(&self) -> &[HandlePlane] {
        &self.0.planes
    }

    /// Create a copy of this handle owning duplicates of all plane descriptors
    pub fn try_clone_owned(&self) -> io::Result<BufferHandle> {
        let planes = self
            .0
            .planes
            .iter()
            .map(|plane| {
                Ok(HandlePlane {
                    fd: plane.fd.try_clone()?,
                    offset: plane.offset,
                    stride: plane.stride,
                })
            })
            .collect::<io::Result<SmallVec<_>>>()?;

        Ok(BufferHandle(Arc::new(BufferHandleInternal {
            id: self.0.id,
            size: self.0.size,
            format: self.0.format,
            modifier: self.0.modifier,
            usage: self.0.usage,
            planes,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sync::signaled_fence;

    fn handle() -> BufferHandle {
        let mut builder = BufferHandle::builder((64, 64), Fourcc::Argb8888, Modifier::Linear);
        assert!(builder.add_plane(signaled_fence().unwrap(), 0, 256));
        builder.build().unwrap()
    }

    #[test]
    fn builder_requires_planes() {
        let builder = BufferHandle::builder((64, 64), Fourcc::Argb8888, Modifier::Linear);
        assert!(builder.build().is_none());
    }

    #[test]
    fn builder_limits_planes() {
        let mut builder = BufferHandle::builder((64, 64), Fourcc::Nv12, Modifier::Linear);
        for _ in 0..MAX_PLANES {
            assert!(builder.add_plane(signaled_fence().unwrap(), 0, 64));
        }
        assert!(!builder.add_plane(signaled_fence().unwrap(), 0, 64));
    }

    #[test]
    fn owned_copy_keeps_identity() {
        let original = handle();
        let copy = original.try_clone_owned().unwrap();
        assert_eq!(original.id(), copy.id());
        assert_ne!(original, copy);
        assert_eq!(copy.planes()[0].stride, 256);
    }
}
