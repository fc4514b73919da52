//! One protocol drawable plus its buffer-production state.
//!
//! A [`Surface`] owns a buffer-producing strategy: either software rendering
//! into a small pool of shared-memory buffers ("leaves"), or a GPU backing
//! injected by the application. The strategy is asked to `prepare` a drawable
//! before painting and to `swap` it to the server afterwards; the server
//! reports buffers back as reusable through release events.

use std::fmt;

use crate::protocol::{BufferId, CallbackId, Connection, SurfaceId};
use crate::shm::{Canvas, Format, ShmError, ShmPool};
use crate::utils::{Rectangle, Size, Transform};
use crate::widget::WidgetId;

/// Number of buffer slots backing a software-rendered surface.
///
/// Two are enough for steady-state double buffering; the third absorbs the
/// server holding on to a buffer one frame longer than usual.
pub(crate) const MAX_LEAVES: usize = 3;

/// Arena size used while an interactive resize is in progress. Mapping a new
/// pool in the server on every intermediate size is relatively expensive, so
/// allocation switches to one large reusable pool instead.
const RESIZE_ARENA_BYTES: usize = 6 * 1024 * 1024;

bitflags::bitflags! {
    /// Hints influencing buffer format and allocation behavior.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SurfaceHints: u32 {
        /// The surface never shows translucent pixels.
        const OPAQUE = 0x1;
        /// Prefer 16-bit buffers when the server supports them.
        const PREFER_RGB565 = 0x2;
        /// Part of a continuous resize; allocate from the resize arena.
        const RESIZE = 0x4;
    }
}

/// What `prepare` produced for the painting pass.
pub enum Drawable<'a> {
    /// CPU-accessible pixels to draw into.
    Pixels(Canvas<'a>),
    /// The drawable lives in a GPU context; paint through `acquire`/`release`.
    External,
}

impl fmt::Debug for Drawable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Drawable::Pixels(c) => f.debug_tuple("Drawable::Pixels").field(c).finish(),
            Drawable::External => f.write_str("Drawable::External"),
        }
    }
}

/// A GPU-backed buffer producer, injected at surface setup.
///
/// The toolkit does not manage GPU contexts; it only calls through this trait
/// at the same points of the redraw cycle where the software path allocates
/// and submits shared-memory buffers.
pub trait GpuBacking {
    /// Ensure the backing matches `size` (buffer coordinates).
    fn prepare(&mut self, conn: &mut dyn Connection, size: Size);
    /// Submit the current back buffer; returns the submitted size in buffer
    /// coordinates.
    fn swap(&mut self, conn: &mut dyn Connection, surface: SurfaceId) -> Size;
    /// Make the backing current for external rendering.
    fn acquire(&mut self) -> bool;
    /// Return control of the backing to the toolkit.
    fn release(&mut self);
    /// Tear down any server-side objects.
    fn destroy(&mut self, conn: &mut dyn Connection);
}

#[derive(Debug)]
struct BufferRecord {
    id: BufferId,
    width: i32,
    height: i32,
    stride: i32,
    format: Format,
    in_arena: bool,
}

#[derive(Debug, Default)]
struct Leaf {
    /// Dedicated pool sized exactly for the current buffer.
    pool: Option<ShmPool>,
    /// Large reusable pool, present only during continuous resizes.
    arena: Option<ShmPool>,
    buffer: Option<BufferRecord>,
    busy: bool,
}

impl Leaf {
    fn has_storage(&self) -> bool {
        self.buffer.is_some()
    }

    fn release(&mut self, conn: &mut dyn Connection) {
        if let Some(rec) = self.buffer.take() {
            conn.destroy_buffer(rec.id);
        }
        self.pool = None;
        self.arena = None;
        self.busy = false;
    }
}

/// The software buffer producer: a fixed pool of shared-memory leaves.
pub(crate) struct ShmBacking {
    surface: SurfaceId,
    dx: i32,
    dy: i32,
    leaves: [Leaf; MAX_LEAVES],
    current: Option<usize>,
}

impl ShmBacking {
    pub(crate) fn new(surface: SurfaceId) -> ShmBacking {
        ShmBacking {
            surface,
            dx: 0,
            dy: 0,
            leaves: Default::default(),
            current: None,
        }
    }

    fn pick_format(hints: SurfaceHints, conn: &dyn Connection) -> Format {
        if hints.contains(SurfaceHints::PREFER_RGB565) && conn.supports_format(Format::Rgb565) {
            Format::Rgb565
        } else if hints.contains(SurfaceHints::OPAQUE) {
            Format::Xrgb8888
        } else {
            Format::Argb8888
        }
    }

    /// Pick a leaf and make sure it holds storage of the requested size.
    ///
    /// Exhaustion of the leaf pool is a hard failure: every buffer is held by
    /// the server and waiting for one back without returning to the event
    /// loop would deadlock the process. Painting code treats the returned
    /// canvas as valid until the matching `swap`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn prepare(
        &mut self,
        conn: &mut dyn Connection,
        dx: i32,
        dy: i32,
        size: Size,
        hints: SurfaceHints,
        transform: Transform,
        scale: i32,
    ) -> Result<Canvas<'_>, ShmError> {
        self.dx = dx;
        self.dy = dy;

        // Prefer a free leaf that already has storage.
        let mut picked = None;
        for (i, leaf) in self.leaves.iter().enumerate() {
            if leaf.busy {
                continue;
            }
            if picked.is_none() || leaf.has_storage() {
                picked = Some(i);
            }
        }
        let Some(i) = picked else {
            tracing::error!(surface = ?self.surface, "all buffers are held by the server");
            panic!("shm surface: all buffers are held by the server");
        };
        let resize_hint = hints.contains(SurfaceHints::RESIZE);
        let leaf = &mut self.leaves[i];

        // Leaving a resize: drop the arena-backed storage outright.
        if !resize_hint && leaf.arena.is_some() {
            leaf.release(conn);
        }

        let buffer_size = transform.surface_to_buffer(scale, size);
        let format = Self::pick_format(hints, conn);

        let matches = leaf.buffer.as_ref().is_some_and(|rec| {
            rec.width == buffer_size.width && rec.height == buffer_size.height && rec.format == format
        });
        if !matches {
            if let Some(rec) = leaf.buffer.take() {
                conn.destroy_buffer(rec.id);
                if !rec.in_arena {
                    leaf.pool = None;
                }
            }

            let stride = format.stride(buffer_size.width);
            let len = (stride * buffer_size.height) as usize;
            let in_arena = if resize_hint {
                match leaf.arena.as_mut() {
                    Some(arena) => arena.grow(len)?,
                    None => leaf.arena = Some(ShmPool::new(RESIZE_ARENA_BYTES.max(len))?),
                }
                true
            } else {
                leaf.pool = Some(ShmPool::new(len)?);
                false
            };
            let pool = if in_arena {
                leaf.arena.as_ref().unwrap()
            } else {
                leaf.pool.as_ref().unwrap()
            };
            let id = conn.create_buffer(pool.fd(), 0, buffer_size.width, buffer_size.height, stride, format);
            leaf.buffer = Some(BufferRecord {
                id,
                width: buffer_size.width,
                height: buffer_size.height,
                stride,
                format,
                in_arena,
            });
        }

        self.current = Some(i);
        let leaf = &mut self.leaves[i];
        let rec = leaf.buffer.as_ref().unwrap();
        let (width, height, stride, format) = (rec.width, rec.height, rec.stride, rec.format);
        let len = (stride * height) as usize;
        let pool = if rec.in_arena {
            leaf.arena.as_mut().unwrap()
        } else {
            leaf.pool.as_mut().unwrap()
        };
        Ok(Canvas::new(&mut pool.bytes_mut()[..len], width, height, stride, format))
    }

    /// Submit the prepared leaf. Returns the size the server will display, in
    /// surface coordinates.
    pub(crate) fn swap(&mut self, conn: &mut dyn Connection, transform: Transform, scale: i32) -> Option<Size> {
        let i = self.current.take()?;
        let leaf = &mut self.leaves[i];
        let rec = leaf.buffer.as_ref()?;
        let server = transform.buffer_to_surface(scale, Size::new(rec.width, rec.height));
        conn.attach(self.surface, Some(rec.id), self.dx, self.dy);
        conn.damage(self.surface, Rectangle::from_size(server));
        conn.commit(self.surface);
        leaf.busy = true;
        Some(server)
    }

    pub(crate) fn has_current(&self) -> bool {
        self.current.is_some()
    }

    /// The server released a buffer. Matched by buffer identity: the leaf may
    /// have been reallocated since the submit that this release answers.
    pub(crate) fn buffer_released(&mut self, conn: &mut dyn Connection, buffer: BufferId) -> bool {
        let Some(released) = self
            .leaves
            .iter_mut()
            .find(|l| l.buffer.as_ref().is_some_and(|rec| rec.id == buffer))
        else {
            return false;
        };
        released.busy = false;

        // Leave one free leaf with storage, release the others.
        let mut free_found = false;
        for leaf in &mut self.leaves {
            if !leaf.has_storage() || leaf.busy {
                continue;
            }
            if !free_found {
                free_found = true;
            } else {
                leaf.release(conn);
            }
        }
        true
    }

    pub(crate) fn destroy(&mut self, conn: &mut dyn Connection) {
        for leaf in &mut self.leaves {
            leaf.release(conn);
        }
        self.current = None;
    }

    #[cfg(test)]
    pub(crate) fn leaf_states(&self) -> [(bool, bool); MAX_LEAVES] {
        let mut out = [(false, false); MAX_LEAVES];
        for (i, leaf) in self.leaves.iter().enumerate() {
            out[i] = (leaf.has_storage(), leaf.busy);
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn current_buffer(&self) -> Option<BufferId> {
        self.current
            .and_then(|i| self.leaves[i].buffer.as_ref())
            .map(|rec| rec.id)
    }
}

impl fmt::Debug for ShmBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmBacking")
            .field("surface", &self.surface)
            .field("current", &self.current)
            .field("leaves", &self.leaves)
            .finish()
    }
}

/// The buffer-production strategy of a surface.
pub(crate) enum BufferStrategy {
    Shm(ShmBacking),
    Gpu(Box<dyn GpuBacking>),
}

impl fmt::Debug for BufferStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferStrategy::Shm(s) => f.debug_tuple("Shm").field(s).finish(),
            BufferStrategy::Gpu(_) => f.write_str("Gpu(..)"),
        }
    }
}

impl BufferStrategy {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn prepare(
        &mut self,
        conn: &mut dyn Connection,
        dx: i32,
        dy: i32,
        size: Size,
        hints: SurfaceHints,
        transform: Transform,
        scale: i32,
    ) -> Result<Drawable<'_>, ShmError> {
        match self {
            BufferStrategy::Shm(shm) => Ok(Drawable::Pixels(
                shm.prepare(conn, dx, dy, size, hints, transform, scale)?,
            )),
            BufferStrategy::Gpu(gpu) => {
                gpu.prepare(conn, transform.surface_to_buffer(scale, size));
                Ok(Drawable::External)
            }
        }
    }

    pub(crate) fn swap(
        &mut self,
        conn: &mut dyn Connection,
        surface: SurfaceId,
        transform: Transform,
        scale: i32,
    ) -> Option<Size> {
        match self {
            BufferStrategy::Shm(shm) => shm.swap(conn, transform, scale),
            BufferStrategy::Gpu(gpu) => {
                let size = gpu.swap(conn, surface);
                Some(transform.buffer_to_surface(scale, size))
            }
        }
    }

    /// Make the surface current in the external rendering context.
    /// Always fails for the software strategy.
    pub(crate) fn acquire(&mut self) -> bool {
        match self {
            BufferStrategy::Shm(_) => false,
            BufferStrategy::Gpu(gpu) => gpu.acquire(),
        }
    }

    pub(crate) fn release(&mut self) {
        if let BufferStrategy::Gpu(gpu) = self {
            gpu.release();
        }
    }

    pub(crate) fn buffer_released(&mut self, conn: &mut dyn Connection, buffer: BufferId) -> bool {
        match self {
            BufferStrategy::Shm(shm) => shm.buffer_released(conn, buffer),
            BufferStrategy::Gpu(_) => false,
        }
    }

    pub(crate) fn destroy(&mut self, conn: &mut dyn Connection) {
        match self {
            BufferStrategy::Shm(shm) => shm.destroy(conn),
            BufferStrategy::Gpu(gpu) => gpu.destroy(conn),
        }
    }
}

/// One protocol drawable belonging to a window, either the main surface or a
/// sub-surface.
#[derive(Debug)]
pub struct Surface {
    pub(crate) id: SurfaceId,
    /// `None` only transiently, while a redraw pass holds the strategy.
    pub(crate) strategy: Option<BufferStrategy>,
    pub(crate) root_widget: WidgetId,
    /// Current logical geometry.
    pub(crate) allocation: Rectangle,
    /// Last size the server acknowledged through a swap.
    pub(crate) server_allocation: Size,
    pub(crate) buffer_transform: Transform,
    pub(crate) buffer_scale: i32,
    pub(crate) hints: SurfaceHints,
    /// At most one outstanding frame callback at any time.
    pub(crate) frame_cb: Option<CallbackId>,
    pub(crate) redraw_needed: bool,
    /// A buffer has been prepared and awaits the flush pass.
    pub(crate) prepared: bool,
    pub(crate) subsurface: bool,
    pub(crate) synchronized: bool,
    pub(crate) synchronized_default: bool,
    pub(crate) opaque_region: Option<Rectangle>,
    pub(crate) input_region: Option<Rectangle>,
    /// Presentation time reported with the last frame callback.
    pub(crate) last_time: u32,
}

impl Surface {
    pub(crate) fn new(id: SurfaceId, root_widget: WidgetId, hints: SurfaceHints) -> Surface {
        Surface {
            id,
            strategy: Some(BufferStrategy::Shm(ShmBacking::new(id))),
            root_widget,
            allocation: Rectangle::default(),
            server_allocation: Size::default(),
            buffer_transform: Transform::Normal,
            buffer_scale: 1,
            hints,
            frame_cb: None,
            redraw_needed: false,
            prepared: false,
            subsurface: false,
            synchronized: false,
            synchronized_default: false,
            opaque_region: None,
            input_region: None,
            last_time: 0,
        }
    }

    /// Submit accumulated region state and the prepared buffer, if any.
    pub(crate) fn flush(&mut self, conn: &mut dyn Connection) {
        if !self.prepared {
            return;
        }
        conn.set_opaque_region(self.id, self.opaque_region);
        conn.set_input_region(self.id, self.input_region);
        if let Some(strategy) = self.strategy.as_mut() {
            if let Some(server) = strategy.swap(conn, self.id, self.buffer_transform, self.buffer_scale) {
                self.server_allocation = server;
            }
        }
        self.prepared = false;
    }

    pub(crate) fn set_synchronized(&mut self, conn: &mut dyn Connection, sync: bool) {
        if !self.subsurface || self.synchronized == sync {
            return;
        }
        conn.subsurface_set_sync(self.id, sync);
        self.synchronized = sync;
    }
}
