//! The boundary to the display-server protocol.
//!
//! The toolkit never speaks a wire format itself. Everything it needs from
//! the compositor side is expressed through the [`Connection`] trait, which a
//! transport implementation provides, and the [`Event`] enum, which the
//! transport delivers back. All requests and events are object-based: the
//! transport hands out opaque ids for surfaces, buffers and callbacks, and
//! the toolkit refers to them by id from then on.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{BorrowedFd, OwnedFd};

use crate::shm::Format;
use crate::utils::{Rectangle, Serial};

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);
    };
}

object_id!(
    /// A protocol-level drawable object.
    SurfaceId
);
object_id!(
    /// A pixel buffer known to the server.
    BufferId
);
object_id!(
    /// A one-shot callback object (frame or sync round-trip).
    CallbackId
);
object_id!(
    /// A display output advertised by the server.
    OutputId
);
object_id!(
    /// A physical seat advertised by the server.
    SeatId
);
object_id!(
    /// An in-progress drag or clipboard transfer offered to us.
    OfferId
);
object_id!(
    /// A drag or clipboard transfer we are offering.
    SourceId
);

/// Linux evdev button code for the left mouse button.
pub const BTN_LEFT: u32 = 0x110;
/// Linux evdev button code for the right mouse button.
pub const BTN_RIGHT: u32 = 0x111;
/// Linux evdev button code for the middle mouse button.
pub const BTN_MIDDLE: u32 = 0x112;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Pressed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Pressed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Vertical,
    Horizontal,
}

bitflags::bitflags! {
    /// Which window edges take part in an interactive resize.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResizeEdge: u32 {
        const TOP = 0x1;
        const BOTTOM = 0x2;
        const LEFT = 0x4;
        const RIGHT = 0x8;
    }
}

/// Fatal transport failures. Anything surfacing here tears down the event
/// loop; per-operation problems are reported through [`Event`]s instead.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("the server closed the connection")]
    Hangup,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Requests the toolkit issues towards the server.
///
/// Implementations are expected to be non-blocking: requests are queued and
/// pushed out by [`Connection::flush`].
pub trait Connection {
    fn create_surface(&mut self) -> SurfaceId;
    fn destroy_surface(&mut self, surface: SurfaceId);

    /// Turn `surface` into a sub-surface of `parent`.
    fn create_subsurface(&mut self, surface: SurfaceId, parent: SurfaceId);
    fn subsurface_set_position(&mut self, surface: SurfaceId, x: i32, y: i32);
    fn subsurface_set_sync(&mut self, surface: SurfaceId, sync: bool);

    /// Create a buffer over `len` bytes at `offset` into the shared memory
    /// behind `fd`. The fd stays owned by the caller.
    #[allow(clippy::too_many_arguments)]
    fn create_buffer(
        &mut self,
        fd: BorrowedFd<'_>,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: Format,
    ) -> BufferId;
    fn destroy_buffer(&mut self, buffer: BufferId);

    fn attach(&mut self, surface: SurfaceId, buffer: Option<BufferId>, dx: i32, dy: i32);
    fn damage(&mut self, surface: SurfaceId, rect: Rectangle);
    fn set_opaque_region(&mut self, surface: SurfaceId, region: Option<Rectangle>);
    fn set_input_region(&mut self, surface: SurfaceId, region: Option<Rectangle>);
    fn commit(&mut self, surface: SurfaceId);

    /// Request a frame callback; completion arrives as [`Event::FrameDone`].
    fn frame(&mut self, surface: SurfaceId) -> CallbackId;
    /// Destroy an outstanding frame callback without waiting for it.
    fn cancel_frame(&mut self, callback: CallbackId);
    /// Request a round-trip marker; completion arrives as [`Event::SyncDone`].
    fn sync(&mut self) -> CallbackId;

    fn supports_format(&self, format: Format) -> bool;

    fn set_title(&mut self, surface: SurfaceId, title: &str);
    fn set_toplevel(&mut self, surface: SurfaceId);
    fn set_fullscreen(&mut self, surface: SurfaceId);
    fn set_maximized(&mut self, surface: SurfaceId);
    fn set_minimized(&mut self, surface: SurfaceId);
    fn set_transient(&mut self, surface: SurfaceId, parent: SurfaceId, x: i32, y: i32, inactive: bool);
    #[allow(clippy::too_many_arguments)]
    fn set_popup(
        &mut self,
        surface: SurfaceId,
        parent: SurfaceId,
        seat: SeatId,
        serial: Serial,
        x: i32,
        y: i32,
    );

    fn start_move(&mut self, surface: SurfaceId, seat: SeatId, serial: Serial);
    fn start_resize(&mut self, surface: SurfaceId, seat: SeatId, serial: Serial, edges: ResizeEdge);

    /// Set the cursor image for a seat; `None` hides the cursor.
    fn set_cursor(&mut self, seat: SeatId, serial: Serial, cursor: Option<cursor_icon::CursorIcon>);

    fn accept_offer(&mut self, offer: OfferId, serial: Serial, mime: Option<&str>);
    /// Ask the sender to write `mime` data into `fd`; the fd is handed off to
    /// the transport (and from there to the sender).
    fn receive_offer(&mut self, offer: OfferId, mime: &str, fd: OwnedFd);
    fn destroy_offer(&mut self, offer: OfferId);

    fn create_source(&mut self, mimes: &[String]) -> SourceId;
    fn destroy_source(&mut self, source: SourceId);
    fn set_selection(&mut self, seat: SeatId, source: Option<SourceId>, serial: Serial);
    fn start_drag(
        &mut self,
        source: SourceId,
        origin: SurfaceId,
        icon: Option<SurfaceId>,
        seat: SeatId,
        serial: Serial,
    );

    /// Dynamic access to the concrete transport, for transport-specific
    /// extensions.
    fn as_any(&mut self) -> &mut dyn std::any::Any;

    /// The fd to watch for readability, if the transport is fd-backed.
    fn readiness_fd(&self) -> Option<BorrowedFd<'_>>;
    /// Push queued requests out to the server.
    fn flush(&mut self) -> Result<(), ConnectionError>;
    /// Drain events the transport has already received into `events`.
    fn dispatch_pending(&mut self, events: &mut VecDeque<Event>) -> Result<(), ConnectionError>;
}

/// Events delivered by the transport, in the order the server sent them.
#[derive(Debug)]
pub enum Event {
    SeatAdded {
        seat: SeatId,
    },
    SeatRemoved {
        seat: SeatId,
    },
    OutputAdded {
        output: OutputId,
    },
    OutputGeometry {
        output: OutputId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        transform: crate::utils::Transform,
    },
    OutputScale {
        output: OutputId,
        scale: i32,
    },
    OutputRemoved {
        output: OutputId,
    },
    SurfaceEnterOutput {
        surface: SurfaceId,
        output: OutputId,
    },
    SurfaceLeaveOutput {
        surface: SurfaceId,
        output: OutputId,
    },

    /// The server proposes a new size for a window surface.
    Configure {
        surface: SurfaceId,
        edges: ResizeEdge,
        width: i32,
        height: i32,
    },
    /// A popup (menu) was dismissed by the server.
    PopupDone {
        surface: SurfaceId,
    },
    FrameDone {
        surface: SurfaceId,
        callback: CallbackId,
        time: u32,
    },
    SyncDone {
        callback: CallbackId,
    },
    BufferReleased {
        buffer: BufferId,
    },

    PointerEnter {
        seat: SeatId,
        serial: Serial,
        surface: SurfaceId,
        x: f64,
        y: f64,
    },
    PointerLeave {
        seat: SeatId,
        serial: Serial,
        surface: SurfaceId,
    },
    PointerMotion {
        seat: SeatId,
        time: u32,
        x: f64,
        y: f64,
    },
    PointerButton {
        seat: SeatId,
        serial: Serial,
        time: u32,
        button: u32,
        state: ButtonState,
    },
    PointerAxis {
        seat: SeatId,
        time: u32,
        axis: Axis,
        value: f64,
    },

    /// A compiled keymap, mappable from `fd`.
    Keymap {
        seat: SeatId,
        fd: OwnedFd,
        size: usize,
    },
    KeyboardEnter {
        seat: SeatId,
        serial: Serial,
        surface: SurfaceId,
    },
    KeyboardLeave {
        seat: SeatId,
        serial: Serial,
        surface: SurfaceId,
    },
    Key {
        seat: SeatId,
        serial: Serial,
        time: u32,
        key: u32,
        state: KeyState,
    },
    Modifiers {
        seat: SeatId,
        serial: Serial,
        depressed: u32,
        latched: u32,
        locked: u32,
        group: u32,
    },

    TouchDown {
        seat: SeatId,
        serial: Serial,
        time: u32,
        surface: SurfaceId,
        id: i32,
        x: f64,
        y: f64,
    },
    TouchUp {
        seat: SeatId,
        serial: Serial,
        time: u32,
        id: i32,
    },
    TouchMotion {
        seat: SeatId,
        time: u32,
        id: i32,
        x: f64,
        y: f64,
    },
    TouchFrame {
        seat: SeatId,
    },
    TouchCancel {
        seat: SeatId,
    },

    /// A new data offer object; mime types follow as [`Event::OfferMime`].
    OfferAdded {
        seat: SeatId,
        offer: OfferId,
    },
    OfferMime {
        offer: OfferId,
        mime: String,
    },
    DragEnter {
        seat: SeatId,
        serial: Serial,
        surface: SurfaceId,
        x: f64,
        y: f64,
        offer: Option<OfferId>,
    },
    DragMotion {
        seat: SeatId,
        time: u32,
        x: f64,
        y: f64,
    },
    DragLeave {
        seat: SeatId,
    },
    Drop {
        seat: SeatId,
    },
    Selection {
        seat: SeatId,
        offer: Option<OfferId>,
    },

    /// The receiving side wants `mime` written into `fd`.
    SourceSend {
        source: SourceId,
        mime: String,
        fd: OwnedFd,
    },
    SourceCancelled {
        source: SourceId,
    },
}
