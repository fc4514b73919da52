#![warn(rust_2018_idioms)]

//! # Toykit: a client-side windowing toolkit
//!
//! This crate is a small toolkit for building clients of a Wayland-style
//! display protocol: windows with optional client-side decorations, a widget
//! tree with per-event handlers, shared-memory buffer pools, seats with
//! pointer/keyboard/touch dispatch, and copy-paste / drag-and-drop transfers.
//!
//! ## Structure of the crate
//!
//! - [`display`] owns the protocol connection and the object arenas; every
//!   toolkit operation is a method on [`display::Display`].
//! - [`protocol`] is the injected transport boundary: the [`protocol::Connection`]
//!   trait and the [`protocol::Event`] stream the toolkit consumes.
//! - [`window`], [`widget`], [`surface`], [`shm`] and [`frame`] make up the
//!   rendering side: scheduling, hit-testing, buffer management and
//!   decorations.
//! - [`seat`], [`data_device`] and [`output`] cover input dispatch, data
//!   transfers and output scale tracking.
//! - [`launcher`] is the control protocol spoken with the privileged session
//!   launcher, independent of the rest of the toolkit.
//!
//! ## The event loop and state handling
//!
//! The toolkit is built around [`calloop`], a callback-oriented event loop.
//! All state lives in one [`display::Display`] value that is handed to every
//! callback as `&mut Display`; handlers are plain `FnMut` closures and can
//! call back into any toolkit operation without synchronization, as callback
//! invocation is always sequential.
//!
//! Widgets and windows carry an optional user-data payload. Handlers receive
//! it as `&mut dyn Any`, which keeps application state next to the object it
//! belongs to instead of in a shared container.
//!
//! ## Logging
//!
//! The toolkit logs through [`tracing`]; install a `tracing-subscriber` in
//! the application to see diagnostics.

pub mod data_device;
pub mod display;
pub mod frame;
pub mod launcher;
pub mod output;
pub mod protocol;
pub mod seat;
pub mod shm;
pub mod surface;
pub mod utils;
pub mod widget;
pub mod window;

pub use display::Display;
pub use window::{Window, WindowId, WindowKind};
pub use widget::WidgetId;
pub use seat::InputId;
