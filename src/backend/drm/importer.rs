//! [`Importer`] turning dmabuf-backed [`BufferHandle`]s into drm framebuffers

use std::{
    collections::{hash_map::Entry, HashMap},
    os::unix::io::AsFd,
    sync::Mutex,
};

use drm::buffer::{Handle as GemHandle, PlanarBuffer};
use drm::control::{Device as ControlDevice, FbCmd2Flags};
use tracing::{debug, trace, warn};

use super::{device::DrmDeviceFd, FramebufferId};
use crate::backend::allocator::{
    BufferHandle, BufferObject, Fourcc, ImportError, Importer, Modifier, MAX_PLANES,
};
use crate::utils::DevPath;

struct ImportedPlanes<'a> {
    handle: &'a BufferHandle,
    gem_handles: [Option<GemHandle>; MAX_PLANES],
}

impl PlanarBuffer for ImportedPlanes<'_> {
    fn size(&self) -> (u32, u32) {
        let size = self.handle.size();
        (size.w as u32, size.h as u32)
    }

    fn format(&self) -> Fourcc {
        self.handle.format()
    }

    fn modifier(&self) -> Option<Modifier> {
        match self.handle.modifier() {
            Modifier::Invalid => None,
            modifier => Some(modifier),
        }
    }

    fn pitches(&self) -> [u32; 4] {
        let mut pitches = [0; 4];
        for (idx, plane) in self.handle.planes().iter().enumerate() {
            pitches[idx] = plane.stride;
        }
        pitches
    }

    fn handles(&self) -> [Option<GemHandle>; 4] {
        self.gem_handles
    }

    fn offsets(&self) -> [u32; 4] {
        let mut offsets = [0; 4];
        for (idx, plane) in self.handle.planes().iter().enumerate() {
            offsets[idx] = plane.offset;
        }
        offsets
    }
}

/// Bytes per pixel of the first plane of packed formats
fn bytes_per_pixel(format: Fourcc) -> Option<u32> {
    Some(match format {
        Fourcc::C8 | Fourcc::R8 => 1,
        Fourcc::Rgb565 | Fourcc::Bgr565 | Fourcc::Rg88 | Fourcc::Gr88 => 2,
        Fourcc::Rgb888 | Fourcc::Bgr888 => 3,
        Fourcc::Argb8888
        | Fourcc::Xrgb8888
        | Fourcc::Abgr8888
        | Fourcc::Xbgr8888
        | Fourcc::Rgba8888
        | Fourcc::Rgbx8888
        | Fourcc::Bgra8888
        | Fourcc::Bgrx8888
        | Fourcc::Argb2101010
        | Fourcc::Xrgb2101010
        | Fourcc::Abgr2101010
        | Fourcc::Xbgr2101010 => 4,
        Fourcc::Abgr16161616f | Fourcc::Xbgr16161616f => 8,
        _ => return None,
    })
}

/// Imports dmabufs of a drm device as framebuffers
///
/// Gem handles are shared by all buffers backed by the same memory, so they are
/// reference counted and closed once the last buffer using them is released.
#[derive(Debug)]
pub struct DrmImporter {
    fd: DrmDeviceFd,
    gem_handles: Mutex<HashMap<u32, (GemHandle, usize)>>,
}

impl DrmImporter {
    /// Create an importer for the device behind `fd`
    pub fn new(fd: DrmDeviceFd) -> DrmImporter {
        DrmImporter {
            fd,
            gem_handles: Mutex::new(HashMap::new()),
        }
    }

    fn validate(&self, handle: &BufferHandle) -> Result<(), ImportError> {
        let planes = handle.planes();
        if planes.is_empty() {
            return Err(ImportError::NoPlanes);
        }
        if let Some((plane, stride)) = planes
            .iter()
            .enumerate()
            .map(|(idx, plane)| (idx, plane.stride))
            .find(|(_, stride)| *stride == 0)
        {
            return Err(ImportError::InvalidStride { plane, stride });
        }
        // linear packed buffers must hold at least one row of pixels per stride
        if handle.modifier() == Modifier::Linear {
            if let Some(bpp) = bytes_per_pixel(handle.format()) {
                let stride = planes[0].stride;
                if stride < handle.size().w as u32 * bpp {
                    return Err(ImportError::InvalidStride { plane: 0, stride });
                }
            }
        }
        Ok(())
    }

    fn ref_gem_handle(&self, gem: GemHandle) {
        let mut handles = self.gem_handles.lock().unwrap();
        handles.entry(u32::from(gem)).or_insert((gem, 0)).1 += 1;
    }

    fn unref_gem_handle(&self, raw: u32) -> Result<(), ImportError> {
        let mut handles = self.gem_handles.lock().unwrap();
        let Entry::Occupied(mut entry) = handles.entry(raw) else {
            return Ok(());
        };
        entry.get_mut().1 -= 1;
        if entry.get().1 > 0 {
            return Ok(());
        }
        let (gem, _) = entry.remove();
        trace!(gem = raw, "Closing gem handle");
        self.fd.close_buffer(gem).map_err(|source| ImportError::Access {
            errmsg: "Failed to close gem handle",
            source,
        })
    }
}

impl Importer for DrmImporter {
    #[profiling::function]
    fn import_buffer(&self, handle: &BufferHandle) -> Result<BufferObject, ImportError> {
        self.validate(handle)?;

        let mut gem_handles = [None; MAX_PLANES];
        for (idx, plane) in handle.planes().iter().enumerate() {
            match self.fd.prime_fd_to_buffer(plane.as_fd()) {
                Ok(gem) => {
                    self.ref_gem_handle(gem);
                    gem_handles[idx] = Some(gem);
                }
                Err(source) => {
                    for gem in gem_handles.iter().flatten() {
                        let _ = self.unref_gem_handle(u32::from(*gem));
                    }
                    return Err(ImportError::Access {
                        errmsg: "Failed to import dmabuf",
                        source,
                    });
                }
            }
        }

        let planes = ImportedPlanes { handle, gem_handles };
        let flags = if planes.modifier().is_some() {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        let framebuffer = match self.fd.add_planar_framebuffer(&planes, flags) {
            Ok(fb) => fb,
            Err(source) => {
                debug!(
                    "Failed to add framebuffer for {:?} on {:?}: {}",
                    handle.format(),
                    self.fd.dev_path(),
                    source
                );
                for gem in gem_handles.iter().flatten() {
                    let _ = self.unref_gem_handle(u32::from(*gem));
                }
                return Err(match source.raw_os_error() {
                    Some(libc::EINVAL) => ImportError::UnsupportedFormat(handle.format()),
                    _ => ImportError::Access {
                        errmsg: "Failed to add framebuffer",
                        source,
                    },
                });
            }
        };

        Ok(BufferObject {
            buffer_id: handle.id(),
            size: handle.size(),
            format: handle.format(),
            modifier: handle.modifier(),
            pitches: planes.pitches(),
            offsets: planes.offsets(),
            gem_handles: gem_handles.map(|gem| gem.map(u32::from).unwrap_or(0)),
            framebuffer: framebuffer.into(),
        })
    }

    fn release_buffer(&self, bo: BufferObject) -> Result<(), ImportError> {
        let framebuffer: drm::control::framebuffer::Handle =
            bo.framebuffer.try_into().map_err(|id: FramebufferId| ImportError::Access {
                errmsg: "Invalid framebuffer",
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{:?}", id)),
            })?;
        let destroyed = self.fd.destroy_framebuffer(framebuffer);

        let mut result = Ok(());
        for raw in bo.gem_handles.iter().copied().filter(|raw| *raw != 0) {
            if let Err(err) = self.unref_gem_handle(raw) {
                warn!("{}", err);
                result = Err(err);
            }
        }

        destroyed.map_err(|source| ImportError::Access {
            errmsg: "Failed to destroy framebuffer",
            source,
        })?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::bytes_per_pixel;
    use crate::backend::allocator::Fourcc;

    #[test]
    fn packed_format_sizes() {
        assert_eq!(bytes_per_pixel(Fourcc::Argb8888), Some(4));
        assert_eq!(bytes_per_pixel(Fourcc::Rgb565), Some(2));
        assert_eq!(bytes_per_pixel(Fourcc::Nv12), None);
    }
}
