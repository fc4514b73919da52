//! Shared-memory pixel storage.
//!
//! A [`ShmPool`] is an anonymous memfd mapped read/write on our side; the fd
//! is handed to the server so it can map the same pages. Buffers are carved
//! out of pools by the surface layer, one pool per buffer in the common case
//! and a larger reusable arena while an interactive resize is in progress.

use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::slice;

use rustix::fs::MemfdFlags;
use rustix::mm::{MapFlags, ProtFlags};

use crate::utils::Rectangle;

/// Pixel formats the software renderer can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// 32-bit premultiplied ARGB.
    Argb8888,
    /// 32-bit RGB, high byte ignored.
    Xrgb8888,
    /// 16-bit RGB, 5-6-5.
    Rgb565,
}

impl Format {
    pub fn bytes_per_pixel(self) -> i32 {
        match self {
            Format::Argb8888 | Format::Xrgb8888 => 4,
            Format::Rgb565 => 2,
        }
    }

    /// Row stride for `width` pixels, rounded up to 4-byte alignment.
    pub fn stride(self, width: i32) -> i32 {
        (width * self.bytes_per_pixel() + 3) & !3
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("failed to create shared memory: {0}")]
    Create(#[source] rustix::io::Errno),
    #[error("failed to map shared memory: {0}")]
    Map(#[source] rustix::io::Errno),
    #[error("invalid pool size {0}")]
    InvalidSize(usize),
}

#[derive(Debug)]
struct MemMap {
    ptr: NonNull<u8>,
    len: usize,
}

impl MemMap {
    fn new(fd: BorrowedFd<'_>, len: usize) -> Result<MemMap, ShmError> {
        // Safety: mapping a fresh range chosen by the kernel; the fd backs
        // at least `len` bytes because the pool truncates before mapping.
        let ptr = unsafe {
            rustix::mm::mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
        }
        .map_err(ShmError::Map)?;
        Ok(MemMap {
            ptr: NonNull::new(ptr.cast()).expect("mmap returned null"),
            len,
        })
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // Safety: the mapping is private to this pool on our side and lives
        // as long as `self`; the borrow checker pins the lifetime.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        // Safety: unmapping a mapping we own.
        let _ = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

/// A memfd-backed pool of pixel storage shared with the server.
#[derive(Debug)]
pub struct ShmPool {
    fd: OwnedFd,
    map: MemMap,
}

impl ShmPool {
    pub fn new(size: usize) -> Result<ShmPool, ShmError> {
        if size == 0 {
            return Err(ShmError::InvalidSize(size));
        }
        let fd = rustix::fs::memfd_create("toykit-shm", MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING)
            .map_err(ShmError::Create)?;
        rustix::fs::ftruncate(&fd, size as u64).map_err(ShmError::Create)?;
        let map = MemMap::new(fd.as_fd(), size)?;
        tracing::trace!(size, "created shm pool");
        Ok(ShmPool { fd, map })
    }

    pub fn size(&self) -> usize {
        self.map.len
    }

    /// Grow the pool. Shrinking is not supported; the server may still hold
    /// buffers into the tail of the old range.
    pub fn grow(&mut self, size: usize) -> Result<(), ShmError> {
        if size <= self.map.len {
            return Ok(());
        }
        rustix::fs::ftruncate(&self.fd, size as u64).map_err(ShmError::Create)?;
        self.map = MemMap::new(self.fd.as_fd(), size)?;
        Ok(())
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.map.bytes_mut()
    }
}

/// A ready-to-draw view over one buffer's pixels.
///
/// This is the 2D drawing capability handed to widget redraw handlers. It
/// deliberately knows nothing about paths or text; renderers layer on top of
/// the raw pixel access.
#[derive(Debug)]
pub struct Canvas<'a> {
    data: &'a mut [u8],
    width: i32,
    height: i32,
    stride: i32,
    format: Format,
}

impl<'a> Canvas<'a> {
    pub(crate) fn new(data: &'a mut [u8], width: i32, height: i32, stride: i32, format: Format) -> Canvas<'a> {
        debug_assert!(data.len() >= (stride * height) as usize);
        Canvas {
            data,
            width,
            height,
            stride,
            format,
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn stride(&self) -> i32 {
        self.stride
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Raw pixel bytes, `stride * height` long.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        self.data
    }

    /// Fill the whole canvas with an `0xAARRGGBB` color.
    pub fn fill(&mut self, color: u32) {
        self.fill_rect(Rectangle::new(0, 0, self.width, self.height), color);
    }

    /// Fill a rectangle, clipped to the canvas, with an `0xAARRGGBB` color.
    pub fn fill_rect(&mut self, rect: Rectangle, color: u32) {
        let x0 = rect.x.max(0);
        let y0 = rect.y.max(0);
        let x1 = (rect.x + rect.width).min(self.width);
        let y1 = (rect.y + rect.height).min(self.height);
        if x0 >= x1 || y0 >= y1 {
            return;
        }
        match self.format {
            Format::Argb8888 | Format::Xrgb8888 => {
                let px = color.to_le_bytes();
                for y in y0..y1 {
                    let row = (y * self.stride) as usize;
                    for x in x0..x1 {
                        let off = row + (x * 4) as usize;
                        self.data[off..off + 4].copy_from_slice(&px);
                    }
                }
            }
            Format::Rgb565 => {
                let r = ((color >> 16) & 0xff) >> 3;
                let g = ((color >> 8) & 0xff) >> 2;
                let b = (color & 0xff) >> 3;
                let px = (((r << 11) | (g << 5) | b) as u16).to_le_bytes();
                for y in y0..y1 {
                    let row = (y * self.stride) as usize;
                    for x in x0..x1 {
                        let off = row + (x * 2) as usize;
                        self.data[off..off + 2].copy_from_slice(&px);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_mapped_and_writable() {
        let mut pool = ShmPool::new(4096).unwrap();
        pool.bytes_mut()[0] = 0xab;
        pool.bytes_mut()[4095] = 0xcd;
        assert_eq!(pool.size(), 4096);
    }

    #[test]
    fn pool_grows_but_never_shrinks() {
        let mut pool = ShmPool::new(4096).unwrap();
        pool.grow(8192).unwrap();
        assert_eq!(pool.size(), 8192);
        pool.grow(1024).unwrap();
        assert_eq!(pool.size(), 8192);
    }

    #[test]
    fn canvas_fill_respects_stride_and_clip() {
        let mut bytes = vec![0u8; (Format::Argb8888.stride(4) * 4) as usize];
        let stride = Format::Argb8888.stride(4);
        let mut canvas = Canvas::new(&mut bytes, 4, 4, stride, Format::Argb8888);
        canvas.fill_rect(Rectangle::new(2, 2, 10, 10), 0xff00ff00);
        let px = |x: i32, y: i32| {
            let off = (y * stride + x * 4) as usize;
            u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
        };
        assert_eq!(px(1, 1), 0);
        assert_eq!(px(2, 2), 0xff00ff00);
        assert_eq!(px(3, 3), 0xff00ff00);
    }

    #[test]
    fn rgb565_stride_is_aligned() {
        assert_eq!(Format::Rgb565.stride(3), 8);
        assert_eq!(Format::Argb8888.stride(3), 12);
    }
}
