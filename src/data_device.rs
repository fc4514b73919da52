//! Drag-and-drop and selection transfers.
//!
//! Offers arrive from the server with a list of mime types and are shared
//! between the seat that owns them and any reads still in flight; the server
//! object is destroyed only when the last reference drops. Receiving data is
//! asynchronous: we pass the write end of a pipe to the sender and read our
//! end through the event loop until a zero-length read marks the end of the
//! stream.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::AsFd;
use std::rc::Rc;

use calloop::PostAction;
use rustix::pipe::{pipe_with, PipeFlags};

use crate::display::Display;
use crate::protocol::{OfferId, SeatId, SourceId, SurfaceId};
use crate::seat::InputId;
use crate::utils::Serial;

/// Mime type of the demo drag payload (a flower: seed plus grab offset).
pub const FLOWER_MIME: &str = "application/x-wayland-dnd-flower";
/// Plain-text mime type used for selections.
pub const TEXT_MIME: &str = "text/plain;charset=utf-8";

/// A transfer offered to us by another client.
#[derive(Debug)]
pub struct DataOffer {
    id: OfferId,
    input: InputId,
    types: RefCell<Vec<String>>,
    x: Cell<f64>,
    y: Cell<f64>,
}

impl DataOffer {
    pub fn id(&self) -> OfferId {
        self.id
    }

    pub fn input(&self) -> InputId {
        self.input
    }

    pub fn types(&self) -> Vec<String> {
        self.types.borrow().clone()
    }

    pub fn has_type(&self, mime: &str) -> bool {
        self.types.borrow().iter().any(|t| t == mime)
    }

    /// Last known drag position, surface-local.
    pub fn position(&self) -> (f64, f64) {
        (self.x.get(), self.y.get())
    }
}

pub(crate) struct OfferEntry {
    pub(crate) offer: Rc<DataOffer>,
    /// Pipe reads in flight, each keeping the server object alive.
    pub(crate) reads: u32,
}

/// Called with each chunk read from the sender; the final call passes an
/// empty slice.
pub type DataReadHandler = Box<dyn FnMut(&mut Display, OfferId, &[u8])>;

pub type SourceSendHandler = Box<dyn FnMut(&mut Display, SourceId, &str, std::os::unix::io::OwnedFd)>;
pub type SourceCancelHandler = Box<dyn FnMut(&mut Display, SourceId)>;

pub(crate) struct DataSource {
    pub(crate) send: Option<SourceSendHandler>,
    pub(crate) cancelled: Option<SourceCancelHandler>,
}

impl Display {
    pub(crate) fn handle_offer_added(&mut self, seat: SeatId, offer: OfferId) {
        let Some(&input) = self.seat_inputs.get(&seat) else {
            tracing::warn!(?seat, "offer from unknown seat");
            return;
        };
        self.offers.insert(
            offer,
            OfferEntry {
                offer: Rc::new(DataOffer {
                    id: offer,
                    input,
                    types: RefCell::new(Vec::new()),
                    x: Cell::new(0.0),
                    y: Cell::new(0.0),
                }),
                reads: 0,
            },
        );
    }

    pub(crate) fn handle_offer_mime(&mut self, offer: OfferId, mime: String) {
        if let Some(entry) = self.offers.get(&offer) {
            entry.offer.types.borrow_mut().push(mime);
        }
    }

    pub(crate) fn handle_drag_enter(
        &mut self,
        seat: SeatId,
        serial: Serial,
        surface: SurfaceId,
        x: f64,
        y: f64,
        offer: Option<OfferId>,
    ) {
        self.serial = serial;
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let window = self.surface_windows.get(&surface).copied();
        let new = offer.and_then(|id| self.offers.get(&id)).map(|e| e.offer.clone());
        let old = {
            let Some(inp) = self.inputs.get_mut(&input) else {
                return;
            };
            inp.drag_window = window;
            std::mem::replace(&mut inp.drag_offer, new.clone())
        };
        if let Some(old) = old {
            let id = old.id;
            drop(old);
            self.maybe_destroy_offer(id);
        }
        if let (Some(window), Some(offer)) = (window, new) {
            offer.x.set(x);
            offer.y.set(y);
            let types = offer.types();
            self.fire_window_data(window, input, x, y, &types);
        }
    }

    pub(crate) fn handle_drag_motion(&mut self, seat: SeatId, _time: u32, x: f64, y: f64) {
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let Some(inp) = self.inputs.get(&input) else {
            return;
        };
        let (Some(window), Some(offer)) = (inp.drag_window, inp.drag_offer.clone()) else {
            return;
        };
        offer.x.set(x);
        offer.y.set(y);
        let types = offer.types();
        self.fire_window_data(window, input, x, y, &types);
    }

    pub(crate) fn handle_drag_leave(&mut self, seat: SeatId) {
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let old = {
            let Some(inp) = self.inputs.get_mut(&input) else {
                return;
            };
            inp.drag_window = None;
            inp.drag_offer.take()
        };
        if let Some(old) = old {
            let id = old.id;
            drop(old);
            self.maybe_destroy_offer(id);
        }
    }

    pub(crate) fn handle_drop(&mut self, seat: SeatId) {
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let Some(inp) = self.inputs.get(&input) else {
            return;
        };
        let (Some(window), Some(offer)) = (inp.drag_window, inp.drag_offer.clone()) else {
            return;
        };
        let (x, y) = offer.position();
        self.fire_window_drop(window, input, x, y);
    }

    pub(crate) fn handle_selection(&mut self, seat: SeatId, offer: Option<OfferId>) {
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let new = offer.and_then(|id| self.offers.get(&id)).map(|e| e.offer.clone());
        let old = {
            let Some(inp) = self.inputs.get_mut(&input) else {
                return;
            };
            std::mem::replace(&mut inp.selection_offer, new)
        };
        if let Some(old) = old {
            let id = old.id;
            drop(old);
            self.maybe_destroy_offer(id);
        }
    }

    /// Destroy the server-side offer once nothing references it: no seat
    /// holds it and no read is in flight.
    pub(crate) fn maybe_destroy_offer(&mut self, offer: OfferId) {
        let Some(entry) = self.offers.get(&offer) else {
            return;
        };
        if entry.reads == 0 && Rc::strong_count(&entry.offer) == 1 {
            self.offers.remove(&offer);
            self.conn.destroy_offer(offer);
        }
    }

    pub fn input_drag_offer(&self, input: InputId) -> Option<Rc<DataOffer>> {
        self.inputs.get(&input).and_then(|i| i.drag_offer.clone())
    }

    pub fn input_selection(&self, input: InputId) -> Option<Rc<DataOffer>> {
        self.inputs.get(&input).and_then(|i| i.selection_offer.clone())
    }

    /// Tell the sender which mime type we would accept from the current drag
    /// offer; `None` rejects the drag.
    pub fn offer_accept(&mut self, input: InputId, mime: Option<&str>) {
        let Some(offer) = self.input_drag_offer(input) else {
            return;
        };
        let serial = self.serial;
        self.conn.accept_offer(offer.id, serial, mime);
    }

    /// Start an asynchronous read of `mime` data from `offer`.
    ///
    /// `handler` runs once per chunk as the sender writes, and a final time
    /// with an empty slice when the stream ends. The offer stays alive until
    /// that final call even if the seat drops it meanwhile.
    pub fn offer_receive(
        &mut self,
        offer: OfferId,
        mime: &str,
        mut handler: DataReadHandler,
    ) -> io::Result<()> {
        let Some(entry) = self.offers.get_mut(&offer) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown data offer"));
        };
        let (read_fd, write_fd) = pipe_with(PipeFlags::CLOEXEC)?;
        entry.reads += 1;
        self.conn.receive_offer(offer, mime, write_fd);
        let watched = self.watch_fd(read_fd, move |display, fd| {
            let mut buf = [0u8; 4096];
            match rustix::io::read(fd, &mut buf) {
                Ok(0) => {
                    handler(display, offer, &[]);
                    display.offer_read_done(offer);
                    PostAction::Remove
                }
                Ok(n) => {
                    handler(display, offer, &buf[..n]);
                    PostAction::Continue
                }
                Err(rustix::io::Errno::AGAIN) => PostAction::Continue,
                Err(err) => {
                    tracing::warn!(?offer, %err, "data offer read failed");
                    handler(display, offer, &[]);
                    display.offer_read_done(offer);
                    PostAction::Remove
                }
            }
        });
        if watched.is_none() {
            self.offer_read_done(offer);
            return Err(io::Error::new(io::ErrorKind::Other, "failed to watch pipe"));
        }
        Ok(())
    }

    fn offer_read_done(&mut self, offer: OfferId) {
        if let Some(entry) = self.offers.get_mut(&offer) {
            entry.reads = entry.reads.saturating_sub(1);
        }
        self.maybe_destroy_offer(offer);
    }

    /// Offer data of the given mime types to other clients.
    pub fn create_data_source(
        &mut self,
        mimes: &[String],
        send: SourceSendHandler,
        cancelled: SourceCancelHandler,
    ) -> SourceId {
        let source = self.conn.create_source(mimes);
        self.sources.insert(
            source,
            DataSource {
                send: Some(send),
                cancelled: Some(cancelled),
            },
        );
        source
    }

    pub fn destroy_data_source(&mut self, source: SourceId) {
        if self.sources.remove(&source).is_some() {
            self.conn.destroy_source(source);
        }
    }

    pub fn input_set_selection(&mut self, input: InputId, source: Option<SourceId>) {
        let Some(inp) = self.inputs.get(&input) else {
            return;
        };
        let seat = inp.seat;
        let serial = self.serial;
        self.conn.set_selection(seat, source, serial);
    }

    /// Begin a drag from `window` with `input`'s most recent implicit grab.
    pub fn window_start_drag(
        &mut self,
        window: crate::window::WindowId,
        input: InputId,
        source: SourceId,
        icon: Option<SurfaceId>,
    ) {
        let Some(inp) = self.inputs.get(&input) else {
            return;
        };
        let seat = inp.seat;
        let origin = self.window_main_surface(window);
        let serial = self.serial;
        self.conn.start_drag(source, origin, icon, seat, serial);
    }

    pub(crate) fn handle_source_send(&mut self, source: SourceId, mime: String, fd: std::os::unix::io::OwnedFd) {
        let Some(mut handler) = self.sources.get_mut(&source).and_then(|s| s.send.take()) else {
            return;
        };
        handler(self, source, &mime, fd);
        if let Some(s) = self.sources.get_mut(&source) {
            if s.send.is_none() {
                s.send = Some(handler);
            }
        }
    }

    pub(crate) fn handle_source_cancelled(&mut self, source: SourceId) {
        let handler = self.sources.get_mut(&source).and_then(|s| s.cancelled.take());
        if let Some(mut handler) = handler {
            handler(self, source);
        }
        self.destroy_data_source(source);
    }
}
