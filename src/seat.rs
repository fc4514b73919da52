//! Seats: pointer, keyboard and touch state per physical seat.
//!
//! Pointer events resolve to a focus widget by hit-testing; a button press
//! starts an implicit grab that redirects all pointer dispatch (including
//! synthetic enter/leave) to the grabbed widget until the same button is
//! released. Keyboard events are translated through an xkb keymap when the
//! server has provided one, and a single key repeats on a timer until it is
//! released or focus moves away.

use std::rc::Rc;
use std::time::Duration;

use calloop::timer::{TimeoutAction, Timer};
use calloop::RegistrationToken;
use cursor_icon::CursorIcon;
use smallvec::SmallVec;
use xkbcommon::xkb;

use crate::data_device::DataOffer;
use crate::display::Display;
use crate::protocol::{Axis, ButtonState, KeyState, SeatId, SurfaceId};
use crate::utils::Serial;
use crate::widget::WidgetId;
use crate::window::WindowId;

const REPEAT_DELAY: Duration = Duration::from_millis(400);
const REPEAT_PERIOD: Duration = Duration::from_millis(25);

/// Raw keycode offset between evdev and xkb keycodes.
const KEYCODE_OFFSET: u32 = 8;

/// Arena id of an input seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputId(pub(crate) u32);

bitflags::bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Modifiers: u32 {
        const SHIFT = 0x1;
        const CTRL = 0x2;
        const ALT = 0x4;
    }
}

pub(crate) struct XkbState {
    state: xkb::State,
    keymap: xkb::Keymap,
}

impl XkbState {
    fn from_keymap_fd(fd: std::os::unix::io::OwnedFd, size: usize) -> Option<XkbState> {
        let text = read_keymap(fd, size)?;
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_string(
            &context,
            text,
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )?;
        let state = xkb::State::new(&keymap);
        Some(XkbState { state, keymap })
    }

    fn sym_for_key(&self, key: u32) -> u32 {
        self.state
            .key_get_one_sym((key + KEYCODE_OFFSET).into())
            .raw()
    }

    fn key_repeats(&self, key: u32) -> bool {
        self.keymap.key_repeats((key + KEYCODE_OFFSET).into())
    }

    fn update(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) -> Modifiers {
        self.state.update_mask(depressed, latched, locked, 0, 0, group);
        let mut modifiers = Modifiers::empty();
        for (name, flag) in [
            (xkb::MOD_NAME_SHIFT, Modifiers::SHIFT),
            (xkb::MOD_NAME_CTRL, Modifiers::CTRL),
            (xkb::MOD_NAME_ALT, Modifiers::ALT),
        ] {
            if self.state.mod_name_is_active(name, xkb::STATE_MODS_EFFECTIVE) {
                modifiers |= flag;
            }
        }
        modifiers
    }
}

fn read_keymap(fd: std::os::unix::io::OwnedFd, size: usize) -> Option<String> {
    use rustix::mm::{MapFlags, ProtFlags};
    if size == 0 {
        return None;
    }
    // Safety: mapping read-only pages the server shared with us.
    let ptr = unsafe { rustix::mm::mmap(std::ptr::null_mut(), size, ProtFlags::READ, MapFlags::PRIVATE, &fd, 0) }
        .ok()?;
    let bytes = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), size) };
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(size);
    let text = std::str::from_utf8(&bytes[..end]).ok().map(str::to_owned);
    // Safety: unmapping what we just mapped.
    let _ = unsafe { rustix::mm::munmap(ptr, size) };
    text
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TouchPoint {
    pub(crate) id: i32,
    pub(crate) widget: WidgetId,
    pub(crate) x: f64,
    pub(crate) y: f64,
}

#[derive(Debug, Clone, Copy)]
struct RepeatKey {
    key: u32,
    sym: Option<u32>,
    time: u32,
}

pub struct Input {
    pub(crate) id: InputId,
    pub(crate) seat: SeatId,

    pub(crate) pointer_surface: Option<SurfaceId>,
    pub(crate) focus_widget: Option<WidgetId>,
    /// Grabbed widget and the button that started the grab.
    pub(crate) grab: Option<(WidgetId, u32)>,
    pub(crate) sx: f64,
    pub(crate) sy: f64,
    pub(crate) pointer_enter_serial: Serial,
    pub(crate) current_cursor: Option<CursorIcon>,
    cursor_dirty: bool,

    pub(crate) keyboard_window: Option<WindowId>,
    pub(crate) xkb: Option<XkbState>,
    pub(crate) modifiers: Modifiers,
    repeat: Option<RepeatKey>,
    repeat_timer: Option<RegistrationToken>,

    pub(crate) touch_points: SmallVec<[TouchPoint; 4]>,

    pub(crate) drag_window: Option<WindowId>,
    pub(crate) drag_offer: Option<Rc<DataOffer>>,
    pub(crate) selection_offer: Option<Rc<DataOffer>>,
}

impl Input {
    fn new(id: InputId, seat: SeatId) -> Input {
        Input {
            id,
            seat,
            pointer_surface: None,
            focus_widget: None,
            grab: None,
            sx: 0.0,
            sy: 0.0,
            pointer_enter_serial: Serial(0),
            current_cursor: None,
            cursor_dirty: true,
            keyboard_window: None,
            xkb: None,
            modifiers: Modifiers::empty(),
            repeat: None,
            repeat_timer: None,
            touch_points: SmallVec::new(),
            drag_window: None,
            drag_offer: None,
            selection_offer: None,
        }
    }
}

impl Display {
    pub(crate) fn handle_seat_added(&mut self, seat: SeatId) {
        let id = InputId(self.next_input_id());
        tracing::debug!(?seat, input = ?id, "seat added");
        self.inputs.insert(id, Input::new(id, seat));
        self.seat_inputs.insert(seat, id);
    }

    pub(crate) fn handle_seat_removed(&mut self, seat: SeatId) {
        let Some(id) = self.seat_inputs.remove(&seat) else {
            return;
        };
        let Some(mut input) = self.inputs.remove(&id) else {
            return;
        };
        if let Some(token) = input.repeat_timer.take() {
            self.handle.remove(token);
        }
        let held: Vec<_> = input
            .drag_offer
            .take()
            .into_iter()
            .chain(input.selection_offer.take())
            .map(|o| o.id())
            .collect();
        drop(input);
        for offer in held {
            self.maybe_destroy_offer(offer);
        }
    }

    pub fn input_modifiers(&self, input: InputId) -> Modifiers {
        self.inputs.get(&input).map(|i| i.modifiers).unwrap_or_default()
    }

    pub fn input_pointer_position(&self, input: InputId) -> (f64, f64) {
        self.inputs.get(&input).map(|i| (i.sx, i.sy)).unwrap_or((0.0, 0.0))
    }

    pub fn input_grab_widget(&self, input: InputId) -> Option<WidgetId> {
        self.inputs.get(&input).and_then(|i| i.grab).map(|(w, _)| w)
    }

    /// Drop every reference an input may hold into a dying widget.
    pub(crate) fn forget_widget(&mut self, widget: WidgetId) {
        for input in self.inputs.values_mut() {
            if input.focus_widget == Some(widget) {
                input.focus_widget = None;
            }
            if input.grab.map(|(w, _)| w) == Some(widget) {
                input.grab = None;
            }
            input.touch_points.retain(|p| p.widget != widget);
        }
    }

    /// Move pointer focus, firing leave/enter. While a grab is held, focus is
    /// pinned to the grab widget and requested changes are ignored.
    fn set_focus_widget(&mut self, input: InputId, widget: Option<WidgetId>) {
        let (old, target) = {
            let Some(inp) = self.inputs.get(&input) else {
                return;
            };
            let target = match inp.grab {
                Some((grabbed, _)) => {
                    if widget.is_some() && widget != Some(grabbed) {
                        return;
                    }
                    widget
                }
                None => widget,
            };
            (inp.focus_widget, target)
        };
        if old == target {
            return;
        }
        if let Some(old) = old {
            if let Some(inp) = self.inputs.get_mut(&input) {
                inp.focus_widget = None;
            }
            self.fire_widget_leave(old, input);
        }
        if let Some(new) = target {
            let (x, y) = self.input_pointer_position(input);
            if let Some(inp) = self.inputs.get_mut(&input) {
                inp.focus_widget = Some(new);
            }
            let cursor = self.fire_widget_enter(new, input, x, y);
            self.apply_cursor(input, new, cursor);
        }
    }

    fn widget_under_pointer(&self, input: InputId) -> Option<WidgetId> {
        let inp = self.inputs.get(&input)?;
        let surface = inp.pointer_surface?;
        let root = self.surface_root_widget(surface)?;
        self.widget_at(root, inp.sx, inp.sy)
    }

    fn apply_cursor(&mut self, input: InputId, widget: WidgetId, from_handler: Option<CursorIcon>) {
        let cursor = from_handler.or_else(|| self.widgets.get(&widget).map(|w| w.default_cursor));
        let Some(inp) = self.inputs.get_mut(&input) else {
            return;
        };
        if inp.current_cursor == cursor && !inp.cursor_dirty {
            return;
        }
        inp.current_cursor = cursor;
        inp.cursor_dirty = false;
        let (seat, serial) = (inp.seat, inp.pointer_enter_serial);
        self.conn.set_cursor(seat, serial, cursor);
    }

    pub(crate) fn handle_pointer_enter(
        &mut self,
        seat: SeatId,
        serial: Serial,
        surface: SurfaceId,
        x: f64,
        y: f64,
    ) {
        self.serial = serial;
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        if let Some(inp) = self.inputs.get_mut(&input) {
            inp.pointer_surface = Some(surface);
            inp.pointer_enter_serial = serial;
            inp.cursor_dirty = true;
            inp.sx = x;
            inp.sy = y;
        }
        let widget = self.widget_under_pointer(input);
        self.set_focus_widget(input, widget);
    }

    pub(crate) fn handle_pointer_leave(&mut self, seat: SeatId, serial: Serial) {
        self.serial = serial;
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        self.set_focus_widget(input, None);
        if let Some(inp) = self.inputs.get_mut(&input) {
            inp.pointer_surface = None;
        }
        self.tooltip_hover(input, None);
    }

    pub(crate) fn handle_pointer_motion(&mut self, seat: SeatId, time: u32, x: f64, y: f64) {
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let grabbed = {
            let Some(inp) = self.inputs.get_mut(&input) else {
                return;
            };
            inp.sx = x;
            inp.sy = y;
            inp.grab.is_some()
        };
        if !grabbed {
            let widget = self.widget_under_pointer(input);
            self.set_focus_widget(input, widget);
        }
        let target = self
            .inputs
            .get(&input)
            .and_then(|i| i.grab.map(|(w, _)| w).or(i.focus_widget));
        if let Some(widget) = target {
            let cursor = self.fire_widget_motion(widget, input, time, x, y);
            if !grabbed {
                self.apply_cursor(input, widget, cursor);
            }
        }
        if !grabbed {
            // Dwell restarts on every motion; the tooltip only shows after
            // the pointer has settled.
            let hover = self.inputs.get(&input).and_then(|i| i.focus_widget);
            self.tooltip_hover(input, hover);
        }
    }

    pub(crate) fn handle_pointer_button(
        &mut self,
        seat: SeatId,
        serial: Serial,
        time: u32,
        button: u32,
        state: ButtonState,
    ) {
        self.serial = serial;
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        // A press on a focused widget starts the implicit grab before the
        // event is delivered.
        if state == ButtonState::Pressed {
            if let Some(inp) = self.inputs.get_mut(&input) {
                if inp.grab.is_none() {
                    if let Some(focus) = inp.focus_widget {
                        inp.grab = Some((focus, button));
                    }
                }
            }
        }
        let target = self
            .inputs
            .get(&input)
            .and_then(|i| i.grab.map(|(w, _)| w).or(i.focus_widget));
        if let Some(widget) = target {
            self.fire_widget_button(widget, input, time, button, state);
        }
        if state == ButtonState::Released {
            let ungrab = self
                .inputs
                .get(&input)
                .and_then(|i| i.grab)
                .is_some_and(|(_, b)| b == button);
            if ungrab {
                if let Some(inp) = self.inputs.get_mut(&input) {
                    inp.grab = None;
                }
                // Re-resolve focus under the pointer now that the grab ended.
                let widget = self.widget_under_pointer(input);
                self.set_focus_widget(input, widget);
            }
        }
    }

    pub(crate) fn handle_pointer_axis(&mut self, seat: SeatId, time: u32, axis: Axis, value: f64) {
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let target = self
            .inputs
            .get(&input)
            .and_then(|i| i.grab.map(|(w, _)| w).or(i.focus_widget));
        if let Some(widget) = target {
            self.fire_widget_axis(widget, input, time, axis, value);
        }
    }

    pub(crate) fn handle_keymap(&mut self, seat: SeatId, fd: std::os::unix::io::OwnedFd, size: usize) {
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let xkb = XkbState::from_keymap_fd(fd, size);
        if xkb.is_none() {
            tracing::warn!(?seat, "failed to compile keymap, key symbols unavailable");
        }
        if let Some(inp) = self.inputs.get_mut(&input) {
            inp.xkb = xkb;
        }
    }

    pub(crate) fn handle_keyboard_enter(&mut self, seat: SeatId, serial: Serial, surface: SurfaceId) {
        self.serial = serial;
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let Some(&window) = self.surface_windows.get(&surface) else {
            return;
        };
        if let Some(inp) = self.inputs.get_mut(&input) {
            inp.keyboard_window = Some(window);
        }
        let gained = {
            let Some(w) = self.windows.get_mut(&window) else {
                return;
            };
            w.focus_count += 1;
            w.focus_count == 1
        };
        if gained {
            self.fire_window_keyboard_focus(window, Some(input));
        }
    }

    pub(crate) fn handle_keyboard_leave(&mut self, seat: SeatId, serial: Serial, surface: SurfaceId) {
        self.serial = serial;
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        self.stop_repeat(input);
        if let Some(inp) = self.inputs.get_mut(&input) {
            inp.keyboard_window = None;
        }
        let Some(&window) = self.surface_windows.get(&surface) else {
            return;
        };
        let lost = {
            let Some(w) = self.windows.get_mut(&window) else {
                return;
            };
            w.focus_count = w.focus_count.saturating_sub(1);
            w.focus_count == 0
        };
        if lost {
            self.fire_window_keyboard_focus(window, None);
        }
    }

    pub(crate) fn handle_key(&mut self, seat: SeatId, serial: Serial, time: u32, key: u32, state: KeyState) {
        self.serial = serial;
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let (window, sym, repeats, modifiers) = {
            let Some(inp) = self.inputs.get(&input) else {
                return;
            };
            let Some(window) = inp.keyboard_window else {
                return;
            };
            // Translation is additive: without a keymap, events are still
            // delivered, just without a symbol.
            let sym = inp.xkb.as_ref().map(|x| x.sym_for_key(key));
            let repeats = inp.xkb.as_ref().map(|x| x.key_repeats(key)).unwrap_or(true);
            (window, sym, repeats, inp.modifiers)
        };

        match state {
            KeyState::Pressed => {
                if self.handle_key_shortcut(window, sym, modifiers) {
                    self.stop_repeat(input);
                    return;
                }
                if repeats {
                    self.start_repeat(input, RepeatKey { key, sym, time });
                }
            }
            KeyState::Released => {
                let repeating = self
                    .inputs
                    .get(&input)
                    .and_then(|i| i.repeat)
                    .is_some_and(|r| r.key == key);
                if repeating {
                    self.stop_repeat(input);
                }
            }
        }
        self.fire_window_key(window, input, time, key, sym, state);
    }

    fn handle_key_shortcut(&mut self, window: WindowId, sym: Option<u32>, modifiers: Modifiers) -> bool {
        let Some(sym) = sym else {
            return false;
        };
        let alt = modifiers.contains(Modifiers::ALT);
        match sym {
            xkb::keysyms::KEY_F4 if alt => {
                self.window_close(window);
                true
            }
            xkb::keysyms::KEY_F11 => {
                self.window_toggle_fullscreen(window);
                true
            }
            xkb::keysyms::KEY_F5 if alt => {
                self.window_toggle_maximized(window);
                true
            }
            _ => false,
        }
    }

    fn start_repeat(&mut self, input: InputId, key: RepeatKey) {
        self.stop_repeat(input);
        let timer = Timer::from_duration(REPEAT_DELAY);
        let token = self.handle.insert_source(timer, move |_, _, display: &mut Display| {
            display.repeat_key(input);
            TimeoutAction::ToDuration(REPEAT_PERIOD)
        });
        match token {
            Ok(token) => {
                if let Some(inp) = self.inputs.get_mut(&input) {
                    inp.repeat = Some(key);
                    inp.repeat_timer = Some(token);
                }
            }
            Err(err) => tracing::error!(%err, "failed to arm key repeat timer"),
        }
    }

    fn stop_repeat(&mut self, input: InputId) {
        let Some(inp) = self.inputs.get_mut(&input) else {
            return;
        };
        inp.repeat = None;
        if let Some(token) = inp.repeat_timer.take() {
            self.handle.remove(token);
        }
    }

    fn repeat_key(&mut self, input: InputId) {
        let Some(inp) = self.inputs.get(&input) else {
            return;
        };
        let (Some(repeat), Some(window)) = (inp.repeat, inp.keyboard_window) else {
            return;
        };
        self.fire_window_key(window, input, repeat.time, repeat.key, repeat.sym, KeyState::Pressed);
    }

    pub(crate) fn handle_modifiers(
        &mut self,
        seat: SeatId,
        serial: Serial,
        depressed: u32,
        latched: u32,
        locked: u32,
        group: u32,
    ) {
        self.serial = serial;
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        if let Some(inp) = self.inputs.get_mut(&input) {
            if let Some(xkb) = inp.xkb.as_mut() {
                inp.modifiers = xkb.update(depressed, latched, locked, group);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn handle_touch_down(
        &mut self,
        seat: SeatId,
        serial: Serial,
        time: u32,
        surface: SurfaceId,
        id: i32,
        x: f64,
        y: f64,
    ) {
        self.serial = serial;
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let Some(root) = self.surface_root_widget(surface) else {
            return;
        };
        let Some(widget) = self.widget_at(root, x, y) else {
            return;
        };
        if let Some(inp) = self.inputs.get_mut(&input) {
            inp.touch_points.push(TouchPoint { id, widget, x, y });
        }
        self.fire_widget_touch_down(widget, input, serial, time, id, x, y);
    }

    pub(crate) fn handle_touch_up(&mut self, seat: SeatId, serial: Serial, time: u32, id: i32) {
        self.serial = serial;
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let point = {
            let Some(inp) = self.inputs.get_mut(&input) else {
                return;
            };
            let Some(index) = inp.touch_points.iter().position(|p| p.id == id) else {
                return;
            };
            inp.touch_points.remove(index)
        };
        self.fire_widget_touch_up(point.widget, input, serial, time, id);
    }

    pub(crate) fn handle_touch_motion(&mut self, seat: SeatId, time: u32, id: i32, x: f64, y: f64) {
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let widget = {
            let Some(inp) = self.inputs.get_mut(&input) else {
                return;
            };
            let Some(point) = inp.touch_points.iter_mut().find(|p| p.id == id) else {
                return;
            };
            point.x = x;
            point.y = y;
            point.widget
        };
        self.fire_widget_touch_motion(widget, input, time, id, x, y);
    }

    pub(crate) fn handle_touch_frame(&mut self, seat: SeatId) {
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let widgets: Vec<_> = self
            .inputs
            .get(&input)
            .map(|i| i.touch_points.iter().map(|p| p.widget).collect())
            .unwrap_or_default();
        for widget in widgets {
            self.fire_widget_touch_frame(widget, input);
        }
    }

    pub(crate) fn handle_touch_cancel(&mut self, seat: SeatId) {
        let Some(&input) = self.seat_inputs.get(&seat) else {
            return;
        };
        let points = self
            .inputs
            .get_mut(&input)
            .map(|i| std::mem::take(&mut i.touch_points))
            .unwrap_or_default();
        for point in points {
            self.fire_widget_touch_cancel(point.widget, input);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test::{FakeConnection, Request};
    use crate::protocol::{Event, BTN_LEFT, BTN_RIGHT};
    use crate::utils::Rectangle;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Log(Rc<RefCell<Vec<String>>>);

    fn setup() -> (Display, SeatId, WidgetId, WidgetId, WidgetId) {
        let mut display = Display::new_for_tests(FakeConnection::new());
        let window = display.create_window();
        let root = display.window_root_widget(window);
        display.widget_set_allocation(root, Rectangle::new(0, 0, 200, 200));
        let left = display.add_widget(root);
        display.widget_set_allocation(left, Rectangle::new(0, 0, 100, 200));
        let right = display.add_widget(root);
        display.widget_set_allocation(right, Rectangle::new(100, 0, 100, 200));

        let seat = SeatId(1);
        display.handle_event(Event::SeatAdded { seat });
        (display, seat, root, left, right)
    }

    fn log_events(display: &mut Display, widget: WidgetId, name: &'static str, log: &Log) {
        let l = log.0.clone();
        display.widget_set_enter_handler(
            widget,
            Box::new(move |_, _, _, _, _, _| {
                l.borrow_mut().push(format!("enter {name}"));
                None
            }),
        );
        let l = log.0.clone();
        display.widget_set_leave_handler(
            widget,
            Box::new(move |_, _, _, _| {
                l.borrow_mut().push(format!("leave {name}"));
            }),
        );
        let l = log.0.clone();
        display.widget_set_button_handler(
            widget,
            Box::new(move |_, _, _, _, _, state, _| {
                l.borrow_mut().push(format!("button {name} {state:?}"));
            }),
        );
        let l = log.0.clone();
        display.widget_set_motion_handler(
            widget,
            Box::new(move |_, _, _, _, _, _, _| {
                l.borrow_mut().push(format!("motion {name}"));
                None
            }),
        );
    }

    fn enter(display: &mut Display, seat: SeatId, x: f64, y: f64) {
        let surface = {
            let window = *display.windows.keys().next().unwrap();
            display.window_main_surface(window)
        };
        display.handle_event(Event::PointerEnter {
            seat,
            serial: Serial(10),
            surface,
            x,
            y,
        });
    }

    #[test]
    fn grab_redirects_dispatch_until_release() {
        let (mut display, seat, _root, left, right) = setup();
        let log = Log::default();
        log_events(&mut display, left, "left", &log);
        log_events(&mut display, right, "right", &log);

        enter(&mut display, seat, 50.0, 50.0);
        display.handle_event(Event::PointerButton {
            seat,
            serial: Serial(11),
            time: 1,
            button: BTN_LEFT,
            state: ButtonState::Pressed,
        });
        // Move over the other widget while grabbed: no leave/enter, motion
        // still goes to the grab widget.
        display.handle_event(Event::PointerMotion {
            seat,
            time: 2,
            x: 150.0,
            y: 50.0,
        });
        display.handle_event(Event::PointerButton {
            seat,
            serial: Serial(12),
            time: 3,
            button: BTN_LEFT,
            state: ButtonState::Released,
        });

        assert_eq!(
            *log.0.borrow(),
            vec![
                "enter left",
                "button left Pressed",
                "motion left",
                "button left Released",
                // Focus re-resolves under the pointer after the grab ends.
                "leave left",
                "enter right",
            ]
        );
    }

    #[test]
    fn mismatched_button_release_keeps_the_grab() {
        let (mut display, seat, _root, left, _right) = setup();
        enter(&mut display, seat, 50.0, 50.0);
        display.handle_event(Event::PointerButton {
            seat,
            serial: Serial(11),
            time: 1,
            button: BTN_LEFT,
            state: ButtonState::Pressed,
        });
        display.handle_event(Event::PointerButton {
            seat,
            serial: Serial(12),
            time: 2,
            button: BTN_RIGHT,
            state: ButtonState::Released,
        });
        let input = display.seat_inputs[&seat];
        assert_eq!(display.input_grab_widget(input), Some(left));
        display.handle_event(Event::PointerButton {
            seat,
            serial: Serial(13),
            time: 3,
            button: BTN_LEFT,
            state: ButtonState::Released,
        });
        assert_eq!(display.input_grab_widget(input), None);
    }

    #[test]
    fn motion_across_widgets_moves_focus_when_ungrabbed() {
        let (mut display, seat, _root, left, right) = setup();
        let log = Log::default();
        log_events(&mut display, left, "left", &log);
        log_events(&mut display, right, "right", &log);

        enter(&mut display, seat, 50.0, 50.0);
        display.handle_event(Event::PointerMotion {
            seat,
            time: 1,
            x: 150.0,
            y: 50.0,
        });
        assert_eq!(
            *log.0.borrow(),
            vec!["enter left", "leave left", "enter right", "motion right"]
        );
    }

    #[test]
    fn cursor_is_set_from_widget_default_and_not_resent() {
        let (mut display, seat, _root, left, _right) = setup();
        display.widget_set_default_cursor(left, CursorIcon::Text);
        enter(&mut display, seat, 50.0, 50.0);
        display.handle_event(Event::PointerMotion {
            seat,
            time: 1,
            x: 60.0,
            y: 50.0,
        });
        let cursors: Vec<_> = display
            .fake()
            .requests
            .iter()
            .filter_map(|r| match r {
                Request::SetCursor { cursor, .. } => Some(*cursor),
                _ => None,
            })
            .collect();
        assert_eq!(cursors, vec![Some(CursorIcon::Text)]);
    }

    #[test]
    fn touch_points_are_tracked_per_id() {
        let (mut display, seat, _root, left, right) = setup();
        let window = *display.windows.keys().next().unwrap();
        let surface = display.window_main_surface(window);
        display.handle_event(Event::TouchDown {
            seat,
            serial: Serial(20),
            time: 1,
            surface,
            id: 0,
            x: 50.0,
            y: 50.0,
        });
        display.handle_event(Event::TouchDown {
            seat,
            serial: Serial(21),
            time: 2,
            surface,
            id: 1,
            x: 150.0,
            y: 50.0,
        });
        let input = display.seat_inputs[&seat];
        assert_eq!(display.inputs[&input].touch_points.len(), 2);
        assert_eq!(display.inputs[&input].touch_points[0].widget, left);
        assert_eq!(display.inputs[&input].touch_points[1].widget, right);

        display.handle_event(Event::TouchUp {
            seat,
            serial: Serial(22),
            time: 3,
            id: 0,
        });
        assert_eq!(display.inputs[&input].touch_points.len(), 1);
        display.handle_event(Event::TouchCancel { seat });
        assert!(display.inputs[&input].touch_points.is_empty());
    }

    #[test]
    fn key_without_keymap_is_still_delivered() {
        let (mut display, seat, _root, _left, _right) = setup();
        let window = *display.windows.keys().next().unwrap();
        let surface = display.window_main_surface(window);
        let keys = Rc::new(RefCell::new(Vec::new()));
        let k = keys.clone();
        display.window_set_key_handler(
            window,
            Box::new(move |_, _, _, _time, key, sym, state, _| {
                k.borrow_mut().push((key, sym, state));
            }),
        );
        display.handle_event(Event::KeyboardEnter {
            seat,
            serial: Serial(30),
            surface,
        });
        display.handle_event(Event::Key {
            seat,
            serial: Serial(31),
            time: 1,
            key: 30,
            state: KeyState::Pressed,
        });
        assert_eq!(*keys.borrow(), vec![(30, None, KeyState::Pressed)]);
    }

    #[test]
    fn key_repeat_fires_after_delay_and_stops_on_release() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let mut event_loop = calloop::EventLoop::<Display>::try_new().unwrap();
        let mut display = Display::new(Box::new(FakeConnection::new()), event_loop.handle());
        let window = display.create_window();
        let surface = display.window_main_surface(window);
        let seat = SeatId(1);
        display.handle_event(Event::SeatAdded { seat });
        display.handle_event(Event::KeyboardEnter {
            seat,
            serial: Serial(1),
            surface,
        });

        let count = Rc::new(std::cell::Cell::new(0u32));
        let c = count.clone();
        display.window_set_key_handler(
            window,
            Box::new(move |_, _, _, _, _, _, state, _| {
                if state == KeyState::Pressed {
                    c.set(c.get() + 1);
                }
            }),
        );
        display.handle_event(Event::Key {
            seat,
            serial: Serial(2),
            time: 1,
            key: 30,
            state: KeyState::Pressed,
        });
        assert_eq!(count.get(), 1);

        let start = std::time::Instant::now();
        while count.get() < 3 && start.elapsed() < Duration::from_secs(2) {
            event_loop
                .dispatch(Some(Duration::from_millis(50)), &mut display)
                .unwrap();
        }
        assert!(count.get() >= 3, "repeat never fired");

        display.handle_event(Event::Key {
            seat,
            serial: Serial(3),
            time: 2,
            key: 30,
            state: KeyState::Released,
        });
        let after_release = count.get();
        for _ in 0..3 {
            event_loop
                .dispatch(Some(Duration::from_millis(40)), &mut display)
                .unwrap();
        }
        assert_eq!(count.get(), after_release);
    }

    #[test]
    fn keyboard_focus_fires_once_per_window() {
        let (mut display, seat, _root, _left, _right) = setup();
        let window = *display.windows.keys().next().unwrap();
        let surface = display.window_main_surface(window);
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        display.window_set_keyboard_focus_handler(
            window,
            Box::new(move |_, _, input, _| {
                l.borrow_mut().push(input.is_some());
            }),
        );
        display.handle_event(Event::KeyboardEnter {
            seat,
            serial: Serial(1),
            surface,
        });
        display.handle_event(Event::KeyboardLeave {
            seat,
            serial: Serial(2),
            surface,
        });
        assert_eq!(*log.borrow(), vec![true, false]);
    }
}
