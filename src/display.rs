//! The display: connection, event loop glue and object arenas.
//!
//! Everything in the toolkit hangs off [`Display`]: windows, widgets, inputs,
//! outputs and data transfers all live in arenas here and reference each
//! other by id. The toolkit is single threaded; handlers run on the loop and
//! get `&mut Display` back, so they can call any toolkit operation directly.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::{AsFd, OwnedFd};

use calloop::generic::Generic;
use calloop::{EventLoop, Interest, LoopHandle, Mode, PostAction, RegistrationToken};

use crate::data_device::{DataSource, OfferEntry};
use crate::output::Output;
use crate::protocol::{
    CallbackId, Connection, ConnectionError, Event, OfferId, SeatId, SourceId, SurfaceId,
};
use crate::seat::{Input, InputId};
use crate::utils::Serial;
use crate::widget::{Widget, WidgetId};
use crate::window::{Window, WindowId};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("event loop failed: {0}")]
    Loop(#[from] calloop::Error),
}

pub struct Display {
    pub(crate) conn: Box<dyn Connection>,
    pub(crate) handle: LoopHandle<'static, Display>,
    pub(crate) running: bool,
    /// Serial of the most recent input event, used for requests that need
    /// proof of recent interaction.
    pub(crate) serial: Serial,

    next_window: u64,
    next_widget: u64,
    next_input: u32,

    pub(crate) windows: HashMap<WindowId, Window>,
    pub(crate) widgets: HashMap<WidgetId, Widget>,
    pub(crate) surface_windows: HashMap<SurfaceId, WindowId>,
    pub(crate) inputs: HashMap<InputId, Input>,
    pub(crate) seat_inputs: HashMap<SeatId, InputId>,
    pub(crate) outputs: HashMap<crate::protocol::OutputId, Output>,
    pub(crate) offers: HashMap<OfferId, OfferEntry>,
    pub(crate) sources: HashMap<SourceId, DataSource>,
    /// Round trips in flight, mapped back to the waiting window.
    pub(crate) sync_waits: HashMap<CallbackId, WindowId>,

    /// Idle tasks, drained last-in first-out before the loop blocks.
    deferred: Vec<Box<dyn FnOnce(&mut Display)>>,
    events: VecDeque<Event>,
    pub(crate) tooltip_timer: Option<RegistrationToken>,
}

impl Display {
    pub fn new(conn: Box<dyn Connection>, handle: LoopHandle<'static, Display>) -> Display {
        let mut display = Display {
            conn,
            handle,
            running: true,
            serial: Serial(0),
            next_window: 0,
            next_widget: 0,
            next_input: 0,
            windows: HashMap::new(),
            widgets: HashMap::new(),
            surface_windows: HashMap::new(),
            inputs: HashMap::new(),
            seat_inputs: HashMap::new(),
            outputs: HashMap::new(),
            offers: HashMap::new(),
            sources: HashMap::new(),
            sync_waits: HashMap::new(),
            deferred: Vec::new(),
            events: VecDeque::new(),
            tooltip_timer: None,
        };
        display.register_connection();
        display
    }

    /// Wake the loop whenever the transport has data to read.
    fn register_connection(&mut self) {
        let fd = match self.conn.readiness_fd() {
            Some(fd) => match fd.try_clone_to_owned() {
                Ok(fd) => fd,
                Err(err) => {
                    tracing::error!(%err, "failed to clone connection fd");
                    return;
                }
            },
            None => return,
        };
        let source = Generic::new(fd, Interest::READ, Mode::Level);
        let registered = self
            .handle
            .insert_source(source, |_, _, display: &mut Display| {
                if let Err(err) = display.dispatch_protocol() {
                    tracing::error!(%err, "connection lost");
                    display.exit();
                    return Ok(PostAction::Remove);
                }
                Ok(PostAction::Continue)
            });
        if let Err(err) = registered {
            tracing::error!(%err, "failed to register connection with the loop");
        }
    }

    pub(crate) fn next_window_id(&mut self) -> u64 {
        self.next_window += 1;
        self.next_window
    }

    pub(crate) fn next_widget_id(&mut self) -> u64 {
        self.next_widget += 1;
        self.next_widget
    }

    pub(crate) fn next_input_id(&mut self) -> u32 {
        self.next_input += 1;
        self.next_input
    }

    /// Stop the loop after the current iteration.
    pub fn exit(&mut self) {
        self.running = false;
    }

    pub fn running(&self) -> bool {
        self.running
    }

    /// Queue a task to run once the current event has been fully handled.
    /// Tasks run last-in first-out.
    pub fn defer(&mut self, task: impl FnOnce(&mut Display) + 'static) {
        self.deferred.push(Box::new(task));
    }

    /// Push queued requests out to the server now instead of waiting for the
    /// loop to do it before blocking.
    pub fn flush(&mut self) -> Result<(), ConnectionError> {
        self.conn.flush()
    }

    pub(crate) fn run_deferred(&mut self) {
        while let Some(task) = self.deferred.pop() {
            task(self);
        }
    }

    /// Register a level-triggered read watch on `fd`, owned by the loop.
    /// Return [`PostAction::Remove`] from the callback, or call
    /// [`Display::unwatch_fd`], to drop the watch.
    pub fn watch_fd<F>(&mut self, fd: OwnedFd, mut callback: F) -> Option<RegistrationToken>
    where
        F: FnMut(&mut Display, std::os::unix::io::BorrowedFd<'_>) -> PostAction + 'static,
    {
        let source = Generic::new(fd, Interest::READ, Mode::Level);
        let registered = self
            .handle
            .insert_source(source, move |_, fd, display: &mut Display| {
                Ok(callback(display, fd.as_fd()))
            });
        match registered {
            Ok(token) => Some(token),
            Err(err) => {
                tracing::error!(%err, "failed to watch fd");
                None
            }
        }
    }

    pub fn unwatch_fd(&mut self, token: RegistrationToken) {
        self.handle.remove(token);
    }

    fn dispatch_protocol(&mut self) -> Result<(), ConnectionError> {
        let mut events = std::mem::take(&mut self.events);
        self.conn.dispatch_pending(&mut events)?;
        while let Some(event) = events.pop_front() {
            self.handle_event(event);
        }
        self.events = events;
        Ok(())
    }

    /// Drive the toolkit until [`Display::exit`] is called or the connection
    /// goes away.
    pub fn run(&mut self, event_loop: &mut EventLoop<'static, Display>) -> Result<(), RunError> {
        while self.running {
            self.dispatch_protocol()?;
            self.run_deferred();
            if !self.running {
                break;
            }
            self.conn.flush()?;
            event_loop.dispatch(None, self)?;
        }
        Ok(())
    }

    pub(crate) fn handle_event(&mut self, event: Event) {
        match event {
            Event::SeatAdded { seat } => self.handle_seat_added(seat),
            Event::SeatRemoved { seat } => self.handle_seat_removed(seat),

            Event::OutputAdded { output } => {
                self.outputs.insert(output, Output::new(output));
            }
            Event::OutputGeometry {
                output,
                x,
                y,
                width,
                height,
                transform,
            } => {
                if let Some(o) = self.outputs.get_mut(&output) {
                    o.allocation = crate::utils::Rectangle::new(x, y, width, height);
                    o.transform = transform;
                }
            }
            Event::OutputScale { output, scale } => {
                if let Some(o) = self.outputs.get_mut(&output) {
                    o.scale = scale;
                }
                self.output_scale_changed(output);
            }
            Event::OutputRemoved { output } => {
                self.outputs.remove(&output);
                self.output_scale_changed(output);
            }
            Event::SurfaceEnterOutput { surface, output } => {
                self.surface_entered_output(surface, output)
            }
            Event::SurfaceLeaveOutput { surface, output } => {
                self.surface_left_output(surface, output)
            }

            Event::Configure {
                surface,
                edges,
                width,
                height,
            } => self.handle_configure(surface, edges, width, height),
            Event::PopupDone { surface } => self.handle_popup_done(surface),
            Event::FrameDone {
                surface,
                callback,
                time,
            } => self.handle_frame_done(surface, callback, time),
            Event::SyncDone { callback } => self.handle_sync_done(callback),
            Event::BufferReleased { buffer } => self.handle_buffer_released(buffer),

            Event::PointerEnter {
                seat,
                serial,
                surface,
                x,
                y,
            } => self.handle_pointer_enter(seat, serial, surface, x, y),
            Event::PointerLeave { seat, serial, .. } => self.handle_pointer_leave(seat, serial),
            Event::PointerMotion { seat, time, x, y } => {
                self.handle_pointer_motion(seat, time, x, y)
            }
            Event::PointerButton {
                seat,
                serial,
                time,
                button,
                state,
            } => self.handle_pointer_button(seat, serial, time, button, state),
            Event::PointerAxis {
                seat,
                time,
                axis,
                value,
            } => self.handle_pointer_axis(seat, time, axis, value),

            Event::Keymap { seat, fd, size } => self.handle_keymap(seat, fd, size),
            Event::KeyboardEnter {
                seat,
                serial,
                surface,
            } => self.handle_keyboard_enter(seat, serial, surface),
            Event::KeyboardLeave {
                seat,
                serial,
                surface,
            } => self.handle_keyboard_leave(seat, serial, surface),
            Event::Key {
                seat,
                serial,
                time,
                key,
                state,
            } => self.handle_key(seat, serial, time, key, state),
            Event::Modifiers {
                seat,
                serial,
                depressed,
                latched,
                locked,
                group,
            } => self.handle_modifiers(seat, serial, depressed, latched, locked, group),

            Event::TouchDown {
                seat,
                serial,
                time,
                surface,
                id,
                x,
                y,
            } => self.handle_touch_down(seat, serial, time, surface, id, x, y),
            Event::TouchUp {
                seat,
                serial,
                time,
                id,
            } => self.handle_touch_up(seat, serial, time, id),
            Event::TouchMotion { seat, time, id, x, y } => {
                self.handle_touch_motion(seat, time, id, x, y)
            }
            Event::TouchFrame { seat } => self.handle_touch_frame(seat),
            Event::TouchCancel { seat } => self.handle_touch_cancel(seat),

            Event::OfferAdded { seat, offer } => self.handle_offer_added(seat, offer),
            Event::OfferMime { offer, mime } => self.handle_offer_mime(offer, mime),
            Event::DragEnter {
                seat,
                serial,
                surface,
                x,
                y,
                offer,
            } => self.handle_drag_enter(seat, serial, surface, x, y, offer),
            Event::DragMotion { seat, time, x, y } => self.handle_drag_motion(seat, time, x, y),
            Event::DragLeave { seat } => self.handle_drag_leave(seat),
            Event::Drop { seat } => self.handle_drop(seat),
            Event::Selection { seat, offer } => self.handle_selection(seat, offer),

            Event::SourceSend { source, mime, fd } => self.handle_source_send(source, mime, fd),
            Event::SourceCancelled { source } => self.handle_source_cancelled(source),
        }
    }
}

#[cfg(test)]
impl Display {
    /// A display without a live loop, for state-machine tests. Timers and fd
    /// watches register but never fire.
    pub(crate) fn new_for_tests(conn: crate::protocol::test::FakeConnection) -> Display {
        let event_loop = EventLoop::<Display>::try_new().unwrap();
        let display = Display::new(Box::new(conn), event_loop.handle());
        std::mem::forget(event_loop);
        display
    }

    pub(crate) fn fake(&mut self) -> &mut crate::protocol::test::FakeConnection {
        self.conn
            .as_any()
            .downcast_mut()
            .expect("tests run against the recording transport")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test::{FakeConnection, Request};

    #[test]
    fn deferred_tasks_run_last_in_first_out() {
        let mut display = Display::new_for_tests(FakeConnection::new());
        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let o = order.clone();
            display.defer(move |_| o.borrow_mut().push(name));
        }
        display.run_deferred();
        assert_eq!(*order.borrow(), vec!["c", "b", "a"]);
    }

    #[test]
    fn tasks_deferred_while_draining_run_before_older_ones() {
        let mut display = Display::new_for_tests(FakeConnection::new());
        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let o1 = order.clone();
        display.defer(move |_| o1.borrow_mut().push("first"));
        let o2 = order.clone();
        let o3 = order.clone();
        display.defer(move |display| {
            o2.borrow_mut().push("second");
            display.defer(move |_| o3.borrow_mut().push("nested"));
        });
        display.run_deferred();
        assert_eq!(*order.borrow(), vec!["second", "nested", "first"]);
    }

    #[test]
    fn destroying_the_last_window_exits() {
        let mut display = Display::new_for_tests(FakeConnection::new());
        let a = display.create_window();
        let b = display.create_window();
        display.destroy_window(a);
        assert!(display.running());
        display.destroy_window(b);
        assert!(!display.running());
    }

    #[test]
    fn run_drains_queued_protocol_events_and_deferred_work() {
        let mut event_loop = EventLoop::<Display>::try_new().unwrap();
        let mut display = Display::new(Box::new(FakeConnection::new()), event_loop.handle());
        let window = display.create_window();
        let surface = display.window_main_surface(window);
        display.fake().queued.push_back(Event::Configure {
            surface,
            edges: crate::protocol::ResizeEdge::empty(),
            width: 320,
            height: 240,
        });
        // Exit once the resize has been committed, from inside the loop.
        display.defer(|display: &mut Display| display.exit());
        display.run(&mut event_loop).unwrap();
        assert_eq!(
            display.windows[&window].allocation.size(),
            crate::utils::Size::new(320, 240)
        );
        assert!(display.fake().count(|r| matches!(r, Request::Commit(_))) >= 1);
    }
}
