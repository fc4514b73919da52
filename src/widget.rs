//! The widget tree.
//!
//! Widgets are rectangles inside a window that receive input and paint
//! themselves during the redraw pass. They carry no rendering state of their
//! own; behavior is attached as boxed closures per event kind, each invoked
//! with the root [`Display`] context, the widget id and the widget's user
//! data. Widgets live in a flat arena on the display and form a tree through
//! parent/child ids, so handlers are free to create and destroy widgets while
//! one of them is being dispatched.

use std::any::Any;

use cursor_icon::CursorIcon;

use crate::display::Display;
use crate::protocol::{Axis, ButtonState, SurfaceId};
use crate::seat::InputId;
use crate::surface::Drawable;
use crate::utils::{Rectangle, Serial};
use crate::window::WindowId;

/// Arena id of a widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WidgetId(pub(crate) u64);

pub type ResizeHandler = Box<dyn FnMut(&mut Display, WidgetId, i32, i32, &mut dyn Any)>;
pub type RedrawHandler = Box<dyn FnMut(&mut Display, WidgetId, &mut Drawable<'_>, &mut dyn Any)>;
pub type EnterHandler =
    Box<dyn FnMut(&mut Display, WidgetId, InputId, f64, f64, &mut dyn Any) -> Option<CursorIcon>>;
pub type LeaveHandler = Box<dyn FnMut(&mut Display, WidgetId, InputId, &mut dyn Any)>;
pub type MotionHandler =
    Box<dyn FnMut(&mut Display, WidgetId, InputId, u32, f64, f64, &mut dyn Any) -> Option<CursorIcon>>;
pub type ButtonHandler =
    Box<dyn FnMut(&mut Display, WidgetId, InputId, u32, u32, ButtonState, &mut dyn Any)>;
pub type AxisHandler = Box<dyn FnMut(&mut Display, WidgetId, InputId, u32, Axis, f64, &mut dyn Any)>;
pub type TouchDownHandler =
    Box<dyn FnMut(&mut Display, WidgetId, InputId, Serial, u32, i32, f64, f64, &mut dyn Any)>;
pub type TouchUpHandler = Box<dyn FnMut(&mut Display, WidgetId, InputId, Serial, u32, i32, &mut dyn Any)>;
pub type TouchMotionHandler =
    Box<dyn FnMut(&mut Display, WidgetId, InputId, u32, i32, f64, f64, &mut dyn Any)>;
pub type TouchFrameHandler = Box<dyn FnMut(&mut Display, WidgetId, InputId, &mut dyn Any)>;
pub type TouchCancelHandler = Box<dyn FnMut(&mut Display, WidgetId, InputId, &mut dyn Any)>;

#[derive(Default)]
pub(crate) struct WidgetHandlers {
    pub(crate) resize: Option<ResizeHandler>,
    pub(crate) redraw: Option<RedrawHandler>,
    pub(crate) enter: Option<EnterHandler>,
    pub(crate) leave: Option<LeaveHandler>,
    pub(crate) motion: Option<MotionHandler>,
    pub(crate) button: Option<ButtonHandler>,
    pub(crate) axis: Option<AxisHandler>,
    pub(crate) touch_down: Option<TouchDownHandler>,
    pub(crate) touch_up: Option<TouchUpHandler>,
    pub(crate) touch_motion: Option<TouchMotionHandler>,
    pub(crate) touch_frame: Option<TouchFrameHandler>,
    pub(crate) touch_cancel: Option<TouchCancelHandler>,
}

pub struct Widget {
    pub(crate) id: WidgetId,
    pub(crate) window: WindowId,
    /// The surface this widget paints to. Children default to the parent's
    /// surface; sub-surface roots start a new one.
    pub(crate) surface: SurfaceId,
    pub(crate) parent: Option<WidgetId>,
    pub(crate) children: Vec<WidgetId>,
    pub(crate) allocation: Rectangle,
    pub(crate) opaque: bool,
    pub(crate) default_cursor: CursorIcon,
    pub(crate) tooltip: Option<String>,
    pub(crate) handlers: WidgetHandlers,
    pub(crate) user_data: Option<Box<dyn Any>>,
}

impl Widget {
    pub(crate) fn new(id: WidgetId, window: WindowId, surface: SurfaceId, parent: Option<WidgetId>) -> Widget {
        Widget {
            id,
            window,
            surface,
            parent,
            children: Vec::new(),
            allocation: Rectangle::default(),
            opaque: false,
            default_cursor: CursorIcon::Default,
            tooltip: None,
            handlers: WidgetHandlers::default(),
            user_data: None,
        }
    }
}

/// Take a handler slot and the user data out of a widget, run the closure,
/// and put both back unless the closure replaced them or destroyed the
/// widget.
macro_rules! fire {
    ($self:ident, $widget:expr, $slot:ident, |$h:ident, $payload:ident| $body:expr) => {{
        let taken = $self
            .widgets
            .get_mut(&$widget)
            .and_then(|w| w.handlers.$slot.take().map(|h| (h, w.user_data.take())));
        match taken {
            Some((mut $h, mut data)) => {
                let mut unit = ();
                let result = {
                    let fallback: &mut dyn Any = &mut unit;
                    let $payload: &mut dyn Any = data.as_deref_mut().unwrap_or(fallback);
                    $body
                };
                if let Some(w) = $self.widgets.get_mut(&$widget) {
                    if w.handlers.$slot.is_none() {
                        w.handlers.$slot = Some($h);
                    }
                    if w.user_data.is_none() {
                        w.user_data = data;
                    }
                }
                result
            }
            None => Default::default(),
        }
    }};
}

macro_rules! handler_setters {
    ($($fn_name:ident => $slot:ident: $ty:ty,)*) => {
        impl Display {
            $(
                pub fn $fn_name(&mut self, widget: WidgetId, handler: $ty) {
                    if let Some(w) = self.widgets.get_mut(&widget) {
                        w.handlers.$slot = Some(handler);
                    }
                }
            )*
        }
    };
}

handler_setters! {
    widget_set_resize_handler => resize: ResizeHandler,
    widget_set_redraw_handler => redraw: RedrawHandler,
    widget_set_enter_handler => enter: EnterHandler,
    widget_set_leave_handler => leave: LeaveHandler,
    widget_set_motion_handler => motion: MotionHandler,
    widget_set_button_handler => button: ButtonHandler,
    widget_set_axis_handler => axis: AxisHandler,
    widget_set_touch_down_handler => touch_down: TouchDownHandler,
    widget_set_touch_up_handler => touch_up: TouchUpHandler,
    widget_set_touch_motion_handler => touch_motion: TouchMotionHandler,
    widget_set_touch_frame_handler => touch_frame: TouchFrameHandler,
    widget_set_touch_cancel_handler => touch_cancel: TouchCancelHandler,
}

impl Display {
    pub(crate) fn new_widget(
        &mut self,
        window: WindowId,
        surface: SurfaceId,
        parent: Option<WidgetId>,
    ) -> WidgetId {
        let id = WidgetId(self.next_widget_id());
        self.widgets.insert(id, Widget::new(id, window, surface, parent));
        if let Some(parent) = parent {
            if let Some(p) = self.widgets.get_mut(&parent) {
                p.children.push(id);
            }
        }
        id
    }

    /// Create a child widget on the same surface as `parent`.
    pub fn add_widget(&mut self, parent: WidgetId) -> WidgetId {
        let (window, surface) = {
            let p = &self.widgets[&parent];
            (p.window, p.surface)
        };
        self.new_widget(window, surface, Some(parent))
    }

    /// Destroy a widget and its subtree. Any input focus or grab pointing
    /// into the subtree is dropped. A sub-surface dies with its root widget;
    /// the main surface is torn down only by `destroy_window`.
    pub fn destroy_widget(&mut self, widget: WidgetId) {
        let Some(w) = self.widgets.remove(&widget) else {
            return;
        };
        if let Some(parent) = w.parent {
            if let Some(p) = self.widgets.get_mut(&parent) {
                p.children.retain(|&c| c != widget);
            }
        }
        let (window, surface) = (w.window, w.surface);
        for child in w.children {
            // The child's parent link is already gone with `w`.
            self.destroy_subtree(child);
        }
        self.forget_widget(widget);
        self.drop_subsurface_rooted_at(window, surface, widget);
    }

    fn destroy_subtree(&mut self, widget: WidgetId) {
        let Some(w) = self.widgets.remove(&widget) else {
            return;
        };
        for child in w.children {
            self.destroy_subtree(child);
        }
        self.forget_widget(widget);
    }

    pub fn widget_allocation(&self, widget: WidgetId) -> Rectangle {
        self.widgets.get(&widget).map(|w| w.allocation).unwrap_or_default()
    }

    pub fn widget_set_allocation(&mut self, widget: WidgetId, allocation: Rectangle) {
        let Some(w) = self.widgets.get_mut(&widget) else {
            return;
        };
        w.allocation = allocation;
        let (window, surface) = (w.window, w.surface);
        // A surface root sizes its surface; for sub-surfaces the allocation
        // also positions them within the parent.
        if let Some(s) = self
            .windows
            .get_mut(&window)
            .and_then(|win| win.surfaces.iter_mut().find(|s| s.id == surface))
        {
            if s.root_widget == widget {
                s.allocation = Rectangle::from_size(allocation.size());
                if s.subsurface {
                    self.conn.subsurface_set_position(surface, allocation.x, allocation.y);
                }
            }
        }
    }

    pub fn widget_set_opaque(&mut self, widget: WidgetId, opaque: bool) {
        if let Some(w) = self.widgets.get_mut(&widget) {
            w.opaque = opaque;
        }
    }

    pub fn widget_set_default_cursor(&mut self, widget: WidgetId, cursor: CursorIcon) {
        if let Some(w) = self.widgets.get_mut(&widget) {
            w.default_cursor = cursor;
        }
    }

    pub fn widget_set_tooltip(&mut self, widget: WidgetId, text: Option<String>) {
        if let Some(w) = self.widgets.get_mut(&widget) {
            w.tooltip = text;
        }
    }

    pub fn widget_set_user_data(&mut self, widget: WidgetId, data: Box<dyn Any>) {
        if let Some(w) = self.widgets.get_mut(&widget) {
            w.user_data = Some(data);
        }
    }

    pub fn widget_user_data<T: Any>(&mut self, widget: WidgetId) -> Option<&mut T> {
        self.widgets
            .get_mut(&widget)
            .and_then(|w| w.user_data.as_deref_mut())
            .and_then(|d| d.downcast_mut())
    }

    pub(crate) fn widget_window(&self, widget: WidgetId) -> Option<WindowId> {
        self.widgets.get(&widget).map(|w| w.window)
    }

    pub(crate) fn widget_surface(&self, widget: WidgetId) -> Option<SurfaceId> {
        self.widgets.get(&widget).map(|w| w.surface)
    }

    /// The deepest widget under `(x, y)`, starting at `root`. Later siblings
    /// paint on top and therefore win.
    pub(crate) fn widget_at(&self, root: WidgetId, x: f64, y: f64) -> Option<WidgetId> {
        let w = self.widgets.get(&root)?;
        if !w.allocation.contains(x, y) {
            return None;
        }
        let mut found = root;
        for &child in &w.children {
            if self.widgets.get(&child).map(|c| c.surface) != Some(w.surface) {
                continue;
            }
            if let Some(hit) = self.widget_at(child, x, y) {
                found = hit;
            }
        }
        Some(found)
    }

    pub(crate) fn fire_widget_resize(&mut self, widget: WidgetId, width: i32, height: i32) {
        fire!(self, widget, resize, |h, data| h(self, widget, width, height, data))
    }

    pub(crate) fn fire_widget_redraw(&mut self, widget: WidgetId, drawable: &mut Drawable<'_>) {
        fire!(self, widget, redraw, |h, data| h(self, widget, drawable, data))
    }

    pub(crate) fn fire_widget_enter(
        &mut self,
        widget: WidgetId,
        input: InputId,
        x: f64,
        y: f64,
    ) -> Option<CursorIcon> {
        fire!(self, widget, enter, |h, data| h(self, widget, input, x, y, data))
    }

    pub(crate) fn fire_widget_leave(&mut self, widget: WidgetId, input: InputId) {
        fire!(self, widget, leave, |h, data| h(self, widget, input, data))
    }

    pub(crate) fn fire_widget_motion(
        &mut self,
        widget: WidgetId,
        input: InputId,
        time: u32,
        x: f64,
        y: f64,
    ) -> Option<CursorIcon> {
        fire!(self, widget, motion, |h, data| h(self, widget, input, time, x, y, data))
    }

    pub(crate) fn fire_widget_button(
        &mut self,
        widget: WidgetId,
        input: InputId,
        time: u32,
        button: u32,
        state: ButtonState,
    ) {
        fire!(self, widget, button, |h, data| h(
            self, widget, input, time, button, state, data
        ))
    }

    pub(crate) fn fire_widget_axis(
        &mut self,
        widget: WidgetId,
        input: InputId,
        time: u32,
        axis: Axis,
        value: f64,
    ) {
        fire!(self, widget, axis, |h, data| h(self, widget, input, time, axis, value, data))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn fire_widget_touch_down(
        &mut self,
        widget: WidgetId,
        input: InputId,
        serial: Serial,
        time: u32,
        id: i32,
        x: f64,
        y: f64,
    ) {
        fire!(self, widget, touch_down, |h, data| h(
            self, widget, input, serial, time, id, x, y, data
        ))
    }

    pub(crate) fn fire_widget_touch_up(
        &mut self,
        widget: WidgetId,
        input: InputId,
        serial: Serial,
        time: u32,
        id: i32,
    ) {
        fire!(self, widget, touch_up, |h, data| h(
            self, widget, input, serial, time, id, data
        ))
    }

    pub(crate) fn fire_widget_touch_motion(
        &mut self,
        widget: WidgetId,
        input: InputId,
        time: u32,
        id: i32,
        x: f64,
        y: f64,
    ) {
        fire!(self, widget, touch_motion, |h, data| h(
            self, widget, input, time, id, x, y, data
        ))
    }

    pub(crate) fn fire_widget_touch_frame(&mut self, widget: WidgetId, input: InputId) {
        fire!(self, widget, touch_frame, |h, data| h(self, widget, input, data))
    }

    pub(crate) fn fire_widget_touch_cancel(&mut self, widget: WidgetId, input: InputId) {
        fire!(self, widget, touch_cancel, |h, data| h(self, widget, input, data))
    }
}
