//! Windows: surface collections, the redraw/resize scheduler and
//! decorations.
//!
//! A window owns its main surface and any sub-surfaces, each with a widget
//! tree rooted on it. Redraw and resize are driven by flags and a deferred
//! idle task so that any number of damage sources within one loop iteration
//! collapse into a single repaint, resizes are throttled against the server's
//! frame pacing, and nothing is repainted while a state-change round trip is
//! in flight.

use std::any::Any;

use crate::display::Display;
use crate::frame::{Frame, FrameButtons, FrameFlags, FrameLocation, FrameStatus, FrameTheme};
use crate::protocol::{ButtonState, KeyState, OutputId, ResizeEdge, SurfaceId, BTN_LEFT};
use crate::seat::InputId;
use crate::surface::{BufferStrategy, Drawable, GpuBacking, Surface, SurfaceHints};
use crate::utils::{Rectangle, Size};
use crate::widget::WidgetId;
use cursor_icon::CursorIcon;

/// Arena id of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub(crate) u64);

/// Smallest size a decorated window may take.
const MIN_DECORATED_SIZE: Size = Size::new(200, 200);

const MENU_ENTRY_HEIGHT: i32 = 20;
const MENU_WIDTH: i32 = 150;

const TOOLTIP_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Toplevel,
    Fullscreen,
    Maximized,
    Transient,
    Menu,
    /// No server-side role; used for drag icons and the like.
    Custom,
}

#[allow(clippy::type_complexity)]
pub type KeyHandler =
    Box<dyn FnMut(&mut Display, WindowId, InputId, u32, u32, Option<u32>, KeyState, &mut dyn Any)>;
pub type KeyboardFocusHandler = Box<dyn FnMut(&mut Display, WindowId, Option<InputId>, &mut dyn Any)>;
#[allow(clippy::type_complexity)]
pub type DataHandler = Box<dyn FnMut(&mut Display, WindowId, InputId, f64, f64, &[String], &mut dyn Any)>;
pub type DropHandler = Box<dyn FnMut(&mut Display, WindowId, InputId, f64, f64, &mut dyn Any)>;
pub type CloseHandler = Box<dyn FnMut(&mut Display, WindowId, &mut dyn Any)>;
pub type FullscreenHandler = Box<dyn FnMut(&mut Display, WindowId, bool, &mut dyn Any)>;
pub type MaximizedHandler = Box<dyn FnMut(&mut Display, WindowId, bool, &mut dyn Any)>;
pub type TooltipHandler = Box<dyn FnMut(&mut Display, WindowId, WidgetId, &str, f64, f64, &mut dyn Any)>;
/// Called with the chosen menu entry, or `None` when the menu is dismissed.
pub type MenuHandler = Box<dyn FnMut(&mut Display, WindowId, Option<usize>)>;

#[derive(Default)]
pub(crate) struct WindowHandlers {
    key: Option<KeyHandler>,
    keyboard_focus: Option<KeyboardFocusHandler>,
    data: Option<DataHandler>,
    drop: Option<DropHandler>,
    close: Option<CloseHandler>,
    fullscreen: Option<FullscreenHandler>,
    maximized: Option<MaximizedHandler>,
    tooltip: Option<TooltipHandler>,
}

pub(crate) struct WindowFrame {
    pub(crate) engine: Frame,
    /// The decoration widget, root of the main surface.
    pub(crate) widget: WidgetId,
    /// The application's content widget, child of the decoration.
    pub(crate) content: WidgetId,
}

pub struct Window {
    pub(crate) id: WindowId,
    /// `[0]` is the main surface.
    pub(crate) surfaces: Vec<Surface>,
    pub(crate) kind: WindowKind,
    pub(crate) title: String,
    pub(crate) frame: Option<WindowFrame>,
    pub(crate) allocation: Rectangle,
    pub(crate) saved_allocation: Rectangle,
    pub(crate) min_allocation: Size,
    pub(crate) pending_allocation: Option<Size>,
    pub(crate) resize_edges: ResizeEdge,
    /// An interactive resize is in progress; buffers come from the arena.
    pub(crate) resizing: bool,
    pub(crate) redraw_needed: bool,
    pub(crate) redraw_task_scheduled: bool,
    pub(crate) resize_needed: bool,
    /// Outstanding state-change round trips; repaints wait for zero.
    pub(crate) configure_requests: u32,
    pub(crate) focus_count: u32,
    pub(crate) outputs: Vec<OutputId>,
    pub(crate) handlers: WindowHandlers,
    pub(crate) user_data: Option<Box<dyn Any>>,
}

impl Window {
    /// Whether decorations take part in layout right now.
    fn decorated(&self) -> bool {
        self.frame.is_some() && self.kind != WindowKind::Fullscreen
    }
}

struct MenuState {
    entries: Vec<String>,
    hover: Option<usize>,
    handler: Option<MenuHandler>,
    parent: WindowId,
}

macro_rules! fire_win {
    ($self:ident, $window:expr, $slot:ident, |$h:ident, $payload:ident| $body:expr) => {{
        let taken = $self
            .windows
            .get_mut(&$window)
            .and_then(|w| w.handlers.$slot.take().map(|h| (h, w.user_data.take())));
        if let Some((mut $h, mut data)) = taken {
            let mut unit = ();
            {
                let fallback: &mut dyn Any = &mut unit;
                let $payload: &mut dyn Any = data.as_deref_mut().unwrap_or(fallback);
                $body;
            }
            if let Some(w) = $self.windows.get_mut(&$window) {
                if w.handlers.$slot.is_none() {
                    w.handlers.$slot = Some($h);
                }
                if w.user_data.is_none() {
                    w.user_data = data;
                }
            }
        }
    }};
}

macro_rules! window_handler_setters {
    ($($fn_name:ident => $slot:ident: $ty:ty,)*) => {
        impl Display {
            $(
                pub fn $fn_name(&mut self, window: WindowId, handler: $ty) {
                    if let Some(w) = self.windows.get_mut(&window) {
                        w.handlers.$slot = Some(handler);
                    }
                }
            )*
        }
    };
}

window_handler_setters! {
    window_set_key_handler => key: KeyHandler,
    window_set_keyboard_focus_handler => keyboard_focus: KeyboardFocusHandler,
    window_set_data_handler => data: DataHandler,
    window_set_drop_handler => drop: DropHandler,
    window_set_close_handler => close: CloseHandler,
    window_set_fullscreen_handler => fullscreen: FullscreenHandler,
    window_set_maximized_handler => maximized: MaximizedHandler,
    window_set_tooltip_handler => tooltip: TooltipHandler,
}

impl Display {
    fn new_window(&mut self, kind: WindowKind) -> WindowId {
        let id = WindowId(self.next_window_id());
        let surface_id = self.conn.create_surface();
        let root = self.new_widget(id, surface_id, None);
        let window = Window {
            id,
            surfaces: vec![Surface::new(surface_id, root, SurfaceHints::empty())],
            kind,
            title: String::new(),
            frame: None,
            allocation: Rectangle::default(),
            saved_allocation: Rectangle::default(),
            min_allocation: Size::default(),
            pending_allocation: None,
            resize_edges: ResizeEdge::empty(),
            resizing: false,
            redraw_needed: false,
            redraw_task_scheduled: false,
            resize_needed: false,
            configure_requests: 0,
            focus_count: 0,
            outputs: Vec::new(),
            handlers: WindowHandlers::default(),
            user_data: None,
        };
        self.windows.insert(id, window);
        self.surface_windows.insert(surface_id, id);
        id
    }

    /// Create an undecorated toplevel window.
    pub fn create_window(&mut self) -> WindowId {
        let id = self.new_window(WindowKind::Toplevel);
        let surface = self.window_main_surface(id);
        self.conn.set_toplevel(surface);
        id
    }

    /// Create a window with no server-side role, e.g. a drag icon.
    pub fn create_custom_window(&mut self) -> WindowId {
        self.new_window(WindowKind::Custom)
    }

    /// Create a transient window positioned relative to `parent`.
    pub fn create_transient_window(&mut self, parent: WindowId, x: i32, y: i32, inactive: bool) -> WindowId {
        let parent_surface = self.window_main_surface(parent);
        let id = self.new_window(WindowKind::Transient);
        let surface = self.window_main_surface(id);
        self.conn.set_transient(surface, parent_surface, x, y, inactive);
        id
    }

    pub fn destroy_window(&mut self, window: WindowId) {
        let Some(mut win) = self.windows.remove(&window) else {
            return;
        };
        let roots: Vec<_> = win.surfaces.iter().map(|s| s.root_widget).collect();
        for surface in &mut win.surfaces {
            if let Some(cb) = surface.frame_cb.take() {
                self.conn.cancel_frame(cb);
            }
            if let Some(mut strategy) = surface.strategy.take() {
                strategy.destroy(self.conn.as_mut());
            }
            self.surface_windows.remove(&surface.id);
            self.conn.destroy_surface(surface.id);
        }
        self.sync_waits.retain(|_, w| *w != window);
        drop(win);
        for root in roots {
            self.destroy_widget(root);
        }
        if self.windows.is_empty() {
            self.exit();
        }
    }

    pub fn window_main_surface(&self, window: WindowId) -> SurfaceId {
        self.windows[&window].surfaces[0].id
    }

    /// The widget applications should build their content under: the content
    /// widget when decorated, the main surface root otherwise.
    pub fn window_root_widget(&self, window: WindowId) -> WidgetId {
        let win = &self.windows[&window];
        match &win.frame {
            Some(frame) => frame.content,
            None => win.surfaces[0].root_widget,
        }
    }

    pub fn window_kind(&self, window: WindowId) -> WindowKind {
        self.windows[&window].kind
    }

    pub fn window_user_data<T: Any>(&mut self, window: WindowId) -> Option<&mut T> {
        self.windows
            .get_mut(&window)
            .and_then(|w| w.user_data.as_deref_mut())
            .and_then(|d| d.downcast_mut())
    }

    pub fn window_set_user_data(&mut self, window: WindowId, data: Box<dyn Any>) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.user_data = Some(data);
        }
    }

    pub fn window_set_title(&mut self, window: WindowId, title: &str) {
        let Some(win) = self.windows.get_mut(&window) else {
            return;
        };
        win.title = title.to_owned();
        let surface = win.surfaces[0].id;
        if let Some(frame) = win.frame.as_mut() {
            frame.engine.set_title(title);
        }
        self.conn.set_title(surface, title);
        self.window_schedule_redraw(window);
    }

    pub fn window_set_minimum_size(&mut self, window: WindowId, size: Size) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.min_allocation = size;
        }
    }

    /// Mark one surface hint set, e.g. opaque content.
    pub fn window_set_surface_hints(&mut self, window: WindowId, hints: SurfaceHints) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.surfaces[0].hints = hints;
        }
    }

    /// Replace the main surface's software rendering with a GPU backing.
    pub fn window_set_gpu_backing(&mut self, window: WindowId, backing: Box<dyn GpuBacking>) {
        let Some(w) = self.windows.get_mut(&window) else {
            return;
        };
        if let Some(mut old) = w.surfaces[0].strategy.take() {
            old.destroy(self.conn.as_mut());
        }
        if let Some(w) = self.windows.get_mut(&window) {
            w.surfaces[0].strategy = Some(BufferStrategy::Gpu(backing));
        }
    }

    /// Make the window's backing current for external rendering. Fails for
    /// software-rendered windows.
    pub fn window_acquire_backing(&mut self, window: WindowId) -> bool {
        self.windows
            .get_mut(&window)
            .and_then(|w| w.surfaces[0].strategy.as_mut())
            .map(|s| s.acquire())
            .unwrap_or(false)
    }

    pub fn window_release_backing(&mut self, window: WindowId) {
        if let Some(s) = self
            .windows
            .get_mut(&window)
            .and_then(|w| w.surfaces[0].strategy.as_mut())
        {
            s.release();
        }
    }

    /// Add a sub-surface with its own widget tree; returns its root widget.
    pub fn window_add_subsurface(&mut self, window: WindowId, synchronized: bool) -> WidgetId {
        let parent = self.window_main_surface(window);
        let surface_id = self.conn.create_surface();
        self.conn.create_subsurface(surface_id, parent);
        self.conn.subsurface_set_sync(surface_id, synchronized);
        let root = self.new_widget(window, surface_id, None);
        let mut surface = Surface::new(surface_id, root, SurfaceHints::empty());
        surface.subsurface = true;
        surface.synchronized = synchronized;
        surface.synchronized_default = synchronized;
        if let Some(w) = self.windows.get_mut(&window) {
            w.surfaces.push(surface);
        }
        self.surface_windows.insert(surface_id, window);
        root
    }

    pub fn subsurface_set_position(&mut self, widget: WidgetId, x: i32, y: i32) {
        if let Some(surface) = self.widget_surface(widget) {
            self.conn.subsurface_set_position(surface, x, y);
        }
    }

    /// Tear down the sub-surface whose root widget was just destroyed. The
    /// main surface (index 0) outlives its root widget.
    pub(crate) fn drop_subsurface_rooted_at(
        &mut self,
        window: WindowId,
        surface: SurfaceId,
        root: WidgetId,
    ) {
        let mut removed = {
            let Some(w) = self.windows.get_mut(&window) else {
                return;
            };
            let Some(index) = w
                .surfaces
                .iter()
                .position(|s| s.id == surface && s.root_widget == root)
            else {
                return;
            };
            if index == 0 {
                return;
            }
            w.surfaces.remove(index)
        };
        if let Some(cb) = removed.frame_cb.take() {
            self.conn.cancel_frame(cb);
        }
        if let Some(mut strategy) = removed.strategy.take() {
            strategy.destroy(self.conn.as_mut());
        }
        self.surface_windows.remove(&surface);
        self.conn.destroy_surface(surface);
    }

    // ---- scheduler ----

    pub(crate) fn schedule_widget_redraw(&mut self, widget: WidgetId) {
        let Some(w) = self.widgets.get(&widget) else {
            return;
        };
        let (window, surface) = (w.window, w.surface);
        if let Some(win) = self.windows.get_mut(&window) {
            if let Some(s) = win.surfaces.iter_mut().find(|s| s.id == surface) {
                s.redraw_needed = true;
            }
        }
        self.schedule_redraw_task(window);
    }

    /// Repaint every surface of the window on the next idle pass.
    pub fn window_schedule_redraw(&mut self, window: WindowId) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.redraw_needed = true;
        }
        self.schedule_redraw_task(window);
    }

    fn schedule_redraw_task(&mut self, window: WindowId) {
        let Some(w) = self.windows.get_mut(&window) else {
            return;
        };
        // While a state-change round trip is pending, repaints hold off; the
        // sync completion reschedules.
        if w.configure_requests > 0 || w.redraw_task_scheduled {
            return;
        }
        w.redraw_task_scheduled = true;
        self.defer(move |display| display.idle_redraw(window));
    }

    /// Request a new size for the window (outer size when decorated).
    pub fn window_schedule_resize(&mut self, window: WindowId, width: i32, height: i32) {
        let Some(w) = self.windows.get_mut(&window) else {
            return;
        };
        let mut min = w.min_allocation;
        if w.decorated() {
            min.width = min.width.max(MIN_DECORATED_SIZE.width);
            min.height = min.height.max(MIN_DECORATED_SIZE.height);
        }
        let size = Size::new(width.max(min.width.max(1)), height.max(min.height.max(1)));
        w.pending_allocation = Some(size);
        w.resize_needed = true;
        w.redraw_needed = true;
        self.schedule_redraw_task(window);
    }

    fn idle_redraw(&mut self, window: WindowId) {
        let (resize_needed, throttled) = {
            let Some(w) = self.windows.get_mut(&window) else {
                return;
            };
            w.redraw_task_scheduled = false;
            if w.configure_requests > 0 {
                return;
            }
            (w.resize_needed, w.surfaces[0].frame_cb.is_some())
        };
        if resize_needed {
            // Resizes ride the server's frame pacing: while the last frame
            // has not been presented, hold on to the new size. The frame
            // callback completion reschedules this task.
            if throttled {
                return;
            }
            self.idle_resize(window);
        }

        let count = self.windows.get(&window).map(|w| w.surfaces.len()).unwrap_or(0);
        for index in 0..count {
            self.surface_redraw(window, index);
        }
        if let Some(w) = self.windows.get_mut(&window) {
            w.redraw_needed = false;
        }
        self.window_flush(window);
    }

    fn idle_resize(&mut self, window: WindowId) {
        let (size, decorated) = {
            let Some(w) = self.windows.get_mut(&window) else {
                return;
            };
            w.resize_needed = false;
            let size = w.pending_allocation.take().unwrap_or(w.allocation.size());
            w.allocation = Rectangle::from_size(size);
            w.surfaces[0].allocation = Rectangle::from_size(size);
            (size, w.decorated())
        };

        if decorated {
            let (frame_widget, content, interior) = {
                let Some(w) = self.windows.get_mut(&window) else {
                    return;
                };
                let Some(frame) = w.frame.as_mut() else {
                    return;
                };
                frame.engine.resize(size.width, size.height);
                (frame.widget, frame.content, frame.engine.interior())
            };
            self.widget_set_allocation(frame_widget, Rectangle::from_size(size));
            self.widget_set_allocation(content, interior);
            self.fire_widget_resize(content, interior.width, interior.height);
        } else {
            let root = self.windows[&window].surfaces[0].root_widget;
            if let Some(frame) = self.windows.get_mut(&window).and_then(|w| w.frame.as_mut()) {
                // Fullscreen with decorations created: content covers all.
                let content = frame.content;
                self.widget_set_allocation(root, Rectangle::from_size(size));
                self.widget_set_allocation(content, Rectangle::from_size(size));
                self.fire_widget_resize(content, size.width, size.height);
            } else {
                self.widget_set_allocation(root, Rectangle::from_size(size));
                self.fire_widget_resize(root, size.width, size.height);
            }
        }
    }

    fn surface_redraw(&mut self, window: WindowId, index: usize) {
        let whole = self.windows.get(&window).map(|w| w.redraw_needed).unwrap_or(false);
        let (surface_id, root, size, hints, transform, scale) = {
            let Some(w) = self.windows.get_mut(&window) else {
                return;
            };
            let resizing = w.resizing;
            let Some(surface) = w.surfaces.get_mut(index) else {
                return;
            };
            if !whole && !surface.redraw_needed {
                return;
            }
            if let Some(cb) = surface.frame_cb {
                if !whole {
                    // Wait for the outstanding frame; the flag stays set and
                    // the completion will reschedule.
                    return;
                }
                surface.frame_cb = None;
                self.conn.cancel_frame(cb);
            }
            let Some(w) = self.windows.get_mut(&window) else {
                return;
            };
            let surface = &mut w.surfaces[index];
            surface.frame_cb = Some(self.conn.frame(surface.id));
            surface.redraw_needed = false;
            let mut hints = surface.hints;
            if resizing {
                hints |= SurfaceHints::RESIZE;
            }
            (
                surface.id,
                surface.root_widget,
                surface.allocation.size(),
                hints,
                surface.buffer_transform,
                surface.buffer_scale,
            )
        };
        if !size.is_valid() {
            return;
        }

        let Some(mut strategy) = self
            .windows
            .get_mut(&window)
            .and_then(|w| w.surfaces.get_mut(index))
            .and_then(|s| s.strategy.take())
        else {
            return;
        };
        match strategy.prepare(self.conn.as_mut(), 0, 0, size, hints, transform, scale) {
            Ok(mut drawable) => {
                for widget in self.surface_widgets_preorder(root, surface_id) {
                    self.fire_widget_redraw(widget, &mut drawable);
                }
            }
            Err(err) => {
                tracing::error!(?surface_id, %err, "failed to prepare buffer");
            }
        }
        let (opaque, input) = self.surface_regions(window, index, root, surface_id, size, hints);
        if let Some(surface) = self
            .windows
            .get_mut(&window)
            .and_then(|w| w.surfaces.get_mut(index))
        {
            surface.strategy = Some(strategy);
            surface.prepared = true;
            surface.opaque_region = opaque;
            surface.input_region = input;
        }
    }

    /// Regions to publish with the next flush. Decorations claim the whole
    /// frame for both; otherwise the opaque region comes from the largest
    /// opaque widget. It may under-claim, but must never cover translucent
    /// pixels.
    fn surface_regions(
        &mut self,
        window: WindowId,
        index: usize,
        root: WidgetId,
        surface: SurfaceId,
        size: Size,
        hints: SurfaceHints,
    ) -> (Option<Rectangle>, Option<Rectangle>) {
        if index == 0 {
            if let Some(w) = self.windows.get_mut(&window) {
                if w.decorated() {
                    if let Some(frame) = w.frame.as_mut() {
                        return (
                            Some(frame.engine.opaque_rect()),
                            Some(frame.engine.input_rect()),
                        );
                    }
                }
            }
        }
        if hints.contains(SurfaceHints::OPAQUE) {
            return (Some(Rectangle::from_size(size)), None);
        }
        let mut best: Option<Rectangle> = None;
        for id in self.surface_widgets_preorder(root, surface) {
            let Some(w) = self.widgets.get(&id) else {
                continue;
            };
            if !w.opaque {
                continue;
            }
            let r = w.allocation;
            if best.map_or(true, |b| r.width * r.height > b.width * b.height) {
                best = Some(r);
            }
        }
        (best, None)
    }

    /// Pre-order traversal of one surface's widgets; children on other
    /// surfaces paint with their own surface.
    fn surface_widgets_preorder(&self, root: WidgetId, surface: SurfaceId) -> Vec<WidgetId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(w) = self.widgets.get(&id) else {
                continue;
            };
            if w.surface != surface {
                continue;
            }
            out.push(id);
            for &child in w.children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    /// Submit every prepared surface. Sub-surfaces go first so their state
    /// latches with the main surface commit.
    fn window_flush(&mut self, window: WindowId) {
        let Some(w) = self.windows.get_mut(&window) else {
            return;
        };
        for index in (0..w.surfaces.len()).rev() {
            let surface = &mut w.surfaces[index];
            surface.flush(self.conn.as_mut());
            let default = surface.synchronized_default;
            surface.set_synchronized(self.conn.as_mut(), default);
        }
    }

    pub(crate) fn handle_frame_done(
        &mut self,
        surface: SurfaceId,
        callback: crate::protocol::CallbackId,
        time: u32,
    ) {
        let Some(&window) = self.surface_windows.get(&surface) else {
            return;
        };
        let pending = {
            let Some(w) = self.windows.get_mut(&window) else {
                return;
            };
            let Some(s) = w.surfaces.iter_mut().find(|s| s.id == surface) else {
                return;
            };
            if s.frame_cb != Some(callback) {
                tracing::warn!(?surface, "stale frame callback");
                return;
            }
            s.frame_cb = None;
            s.last_time = time;
            s.redraw_needed || w.redraw_needed || w.resize_needed
        };
        if pending {
            self.schedule_redraw_task(window);
        }
    }

    pub(crate) fn handle_sync_done(&mut self, callback: crate::protocol::CallbackId) {
        let Some(window) = self.sync_waits.remove(&callback) else {
            return;
        };
        let pending = {
            let Some(w) = self.windows.get_mut(&window) else {
                return;
            };
            w.configure_requests = w.configure_requests.saturating_sub(1);
            w.configure_requests == 0
                && (w.redraw_needed || w.resize_needed || w.surfaces.iter().any(|s| s.redraw_needed))
        };
        if pending {
            self.schedule_redraw_task(window);
        }
    }

    pub(crate) fn handle_configure(
        &mut self,
        surface: SurfaceId,
        edges: ResizeEdge,
        width: i32,
        height: i32,
    ) {
        let Some(&window) = self.surface_windows.get(&surface) else {
            return;
        };
        if let Some(w) = self.windows.get_mut(&window) {
            w.resize_edges = edges;
            w.resizing = !edges.is_empty();
        }
        if width > 0 && height > 0 {
            self.window_schedule_resize(window, width, height);
        }
    }

    /// Issue a round trip and block repaints until it completes.
    fn window_sync_configure(&mut self, window: WindowId) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.configure_requests += 1;
        }
        let callback = self.conn.sync();
        self.sync_waits.insert(callback, window);
    }

    // ---- window state ----

    pub fn window_set_fullscreen(&mut self, window: WindowId, fullscreen: bool) {
        let Some(w) = self.windows.get_mut(&window) else {
            return;
        };
        if fullscreen == (w.kind == WindowKind::Fullscreen) {
            return;
        }
        let surface = w.surfaces[0].id;
        if fullscreen {
            w.saved_allocation = w.allocation;
            w.kind = WindowKind::Fullscreen;
            self.conn.set_fullscreen(surface);
        } else {
            w.kind = WindowKind::Toplevel;
            let restore = w.saved_allocation.size();
            self.conn.set_toplevel(surface);
            if restore.is_valid() {
                self.window_schedule_resize(window, restore.width, restore.height);
            }
        }
        self.window_sync_configure(window);
        fire_win!(self, window, fullscreen, |h, data| h(self, window, fullscreen, data));
    }

    pub fn window_toggle_fullscreen(&mut self, window: WindowId) {
        let Some(w) = self.windows.get(&window) else {
            return;
        };
        let fullscreen = w.kind == WindowKind::Fullscreen;
        self.window_set_fullscreen(window, !fullscreen);
    }

    pub fn window_set_maximized(&mut self, window: WindowId, maximized: bool) {
        let Some(w) = self.windows.get_mut(&window) else {
            return;
        };
        if maximized == (w.kind == WindowKind::Maximized) {
            return;
        }
        let surface = w.surfaces[0].id;
        if maximized {
            w.saved_allocation = w.allocation;
            w.kind = WindowKind::Maximized;
            if let Some(frame) = w.frame.as_mut() {
                frame.engine.set_flags(FrameFlags::MAXIMIZED);
            }
            self.conn.set_maximized(surface);
        } else {
            w.kind = WindowKind::Toplevel;
            let restore = w.saved_allocation.size();
            if let Some(frame) = w.frame.as_mut() {
                frame.engine.unset_flags(FrameFlags::MAXIMIZED);
            }
            self.conn.set_toplevel(surface);
            if restore.is_valid() {
                self.window_schedule_resize(window, restore.width, restore.height);
            }
        }
        self.window_sync_configure(window);
        fire_win!(self, window, maximized, |h, data| h(self, window, maximized, data));
    }

    /// Ask the server to minimize the window. Unlike fullscreen and maximize
    /// this is fire-and-forget: no state is saved because the window comes
    /// back with its current allocation.
    pub fn window_set_minimized(&mut self, window: WindowId) {
        let Some(w) = self.windows.get(&window) else {
            return;
        };
        self.conn.set_minimized(w.surfaces[0].id);
    }

    pub fn window_toggle_maximized(&mut self, window: WindowId) {
        let Some(w) = self.windows.get(&window) else {
            return;
        };
        let maximized = w.kind == WindowKind::Maximized;
        self.window_set_maximized(window, !maximized);
    }

    /// Close the window: the application handler decides, or the window is
    /// destroyed outright.
    pub fn window_close(&mut self, window: WindowId) {
        let has_handler = self
            .windows
            .get(&window)
            .map(|w| w.handlers.close.is_some())
            .unwrap_or(false);
        if has_handler {
            fire_win!(self, window, close, |h, data| h(self, window, data));
        } else {
            self.destroy_window(window);
        }
    }

    pub(crate) fn fire_window_key(
        &mut self,
        window: WindowId,
        input: InputId,
        time: u32,
        key: u32,
        sym: Option<u32>,
        state: KeyState,
    ) {
        fire_win!(self, window, key, |h, data| h(
            self, window, input, time, key, sym, state, data
        ));
    }

    pub(crate) fn fire_window_keyboard_focus(&mut self, window: WindowId, input: Option<InputId>) {
        let active = input.is_some();
        if let Some(frame) = self.windows.get_mut(&window).and_then(|w| w.frame.as_mut()) {
            if active {
                frame.engine.set_flags(FrameFlags::ACTIVE);
            } else {
                frame.engine.unset_flags(FrameFlags::ACTIVE);
            }
            let widget = frame.widget;
            self.schedule_widget_redraw(widget);
        }
        fire_win!(self, window, keyboard_focus, |h, data| h(self, window, input, data));
    }

    pub(crate) fn fire_window_data(
        &mut self,
        window: WindowId,
        input: InputId,
        x: f64,
        y: f64,
        types: &[String],
    ) {
        fire_win!(self, window, data, |h, payload| h(
            self, window, input, x, y, types, payload
        ));
    }

    pub(crate) fn fire_window_drop(&mut self, window: WindowId, input: InputId, x: f64, y: f64) {
        fire_win!(self, window, drop, |h, data| h(self, window, input, x, y, data));
    }

    pub(crate) fn surface_root_widget(&self, surface: SurfaceId) -> Option<WidgetId> {
        let window = self.surface_windows.get(&surface)?;
        let w = self.windows.get(window)?;
        w.surfaces.iter().find(|s| s.id == surface).map(|s| s.root_widget)
    }

    pub(crate) fn handle_buffer_released(&mut self, buffer: crate::protocol::BufferId) {
        let mut strategies: Vec<(WindowId, usize)> = Vec::new();
        for (&id, w) in &self.windows {
            for index in 0..w.surfaces.len() {
                strategies.push((id, index));
            }
        }
        for (window, index) in strategies {
            let Some(mut strategy) = self
                .windows
                .get_mut(&window)
                .and_then(|w| w.surfaces.get_mut(index))
                .and_then(|s| s.strategy.take())
            else {
                continue;
            };
            let matched = strategy.buffer_released(self.conn.as_mut(), buffer);
            if let Some(s) = self
                .windows
                .get_mut(&window)
                .and_then(|w| w.surfaces.get_mut(index))
            {
                s.strategy = Some(strategy);
            }
            if matched {
                return;
            }
        }
        tracing::warn!(?buffer, "release for unknown buffer");
    }

    // ---- decorations ----

    /// Add or remove client-side decorations around the content.
    pub fn window_set_decorated(&mut self, window: WindowId, decorated: bool) {
        let has = self.windows.get(&window).map(|w| w.frame.is_some()).unwrap_or(false);
        if decorated == has {
            return;
        }
        if decorated {
            self.window_create_frame(window);
        } else {
            self.window_remove_frame(window);
        }
        self.window_schedule_redraw(window);
    }

    fn window_create_frame(&mut self, window: WindowId) {
        let (surface_id, content, title, size) = {
            let Some(w) = self.windows.get(&window) else {
                return;
            };
            (
                w.surfaces[0].id,
                w.surfaces[0].root_widget,
                w.title.clone(),
                w.allocation.size(),
            )
        };
        // The decoration widget becomes the new surface root; the old root
        // is reparented under it as the content widget.
        let frame_widget = self.new_widget(window, surface_id, None);
        if let Some(c) = self.widgets.get_mut(&content) {
            c.parent = Some(frame_widget);
        }
        if let Some(f) = self.widgets.get_mut(&frame_widget) {
            f.children.push(content);
        }
        let mut engine = Frame::new(
            FrameTheme::default(),
            size.width.max(1),
            size.height.max(1),
            FrameButtons::CLOSE | FrameButtons::MAXIMIZE | FrameButtons::MINIMIZE,
            &title,
        );
        let interior = engine.interior();
        if let Some(w) = self.windows.get_mut(&window) {
            w.surfaces[0].root_widget = frame_widget;
            w.frame = Some(WindowFrame {
                engine,
                widget: frame_widget,
                content,
            });
        }
        self.widget_set_allocation(frame_widget, Rectangle::from_size(size));
        self.widget_set_allocation(content, interior);
        self.install_frame_handlers(frame_widget);
    }

    fn window_remove_frame(&mut self, window: WindowId) {
        let Some(frame) = self.windows.get_mut(&window).and_then(|w| w.frame.take()) else {
            return;
        };
        if let Some(c) = self.widgets.get_mut(&frame.content) {
            c.parent = None;
        }
        if let Some(w) = self.windows.get_mut(&window) {
            w.surfaces[0].root_widget = frame.content;
        }
        if let Some(f) = self.widgets.get_mut(&frame.widget) {
            f.children.retain(|&c| c != frame.content);
        }
        self.destroy_widget(frame.widget);
    }

    fn frame_cursor(location: FrameLocation) -> CursorIcon {
        match location {
            FrameLocation::Resizing(edges) => match (
                edges.contains(ResizeEdge::TOP),
                edges.contains(ResizeEdge::BOTTOM),
                edges.contains(ResizeEdge::LEFT),
                edges.contains(ResizeEdge::RIGHT),
            ) {
                (true, _, true, _) => CursorIcon::NwResize,
                (true, _, _, true) => CursorIcon::NeResize,
                (_, true, true, _) => CursorIcon::SwResize,
                (_, true, _, true) => CursorIcon::SeResize,
                (true, ..) => CursorIcon::NResize,
                (_, true, ..) => CursorIcon::SResize,
                (_, _, true, _) => CursorIcon::WResize,
                (_, _, _, true) => CursorIcon::EResize,
                _ => CursorIcon::Default,
            },
            _ => CursorIcon::Default,
        }
    }

    fn install_frame_handlers(&mut self, frame_widget: WidgetId) {
        self.widget_set_enter_handler(
            frame_widget,
            Box::new(|display, widget, input, x, y, _| {
                let window = display.widget_window(widget)?;
                let location = display
                    .windows
                    .get_mut(&window)?
                    .frame
                    .as_mut()?
                    .engine
                    .pointer_enter(input.0 as u64, x, y);
                display.drain_frame_status(window, input);
                Some(Self::frame_cursor(location))
            }),
        );
        self.widget_set_motion_handler(
            frame_widget,
            Box::new(|display, widget, input, _time, x, y, _| {
                let window = display.widget_window(widget)?;
                let location = display
                    .windows
                    .get_mut(&window)?
                    .frame
                    .as_mut()?
                    .engine
                    .pointer_motion(input.0 as u64, x, y);
                display.drain_frame_status(window, input);
                Some(Self::frame_cursor(location))
            }),
        );
        self.widget_set_leave_handler(
            frame_widget,
            Box::new(|display, widget, input, _| {
                let Some(window) = display.widget_window(widget) else {
                    return;
                };
                if let Some(frame) = display.windows.get_mut(&window).and_then(|w| w.frame.as_mut()) {
                    frame.engine.pointer_leave(input.0 as u64);
                }
                display.drain_frame_status(window, input);
            }),
        );
        self.widget_set_button_handler(
            frame_widget,
            Box::new(|display, widget, input, _time, button, state, _| {
                let Some(window) = display.widget_window(widget) else {
                    return;
                };
                if let Some(frame) = display.windows.get_mut(&window).and_then(|w| w.frame.as_mut()) {
                    let location = frame.engine.pointer_button(input.0 as u64, button, state);
                    if let FrameLocation::Resizing(edges) = location {
                        if let Some(w) = display.windows.get_mut(&window) {
                            w.resize_edges = edges;
                        }
                    }
                }
                display.drain_frame_status(window, input);
            }),
        );
        self.widget_set_touch_down_handler(
            frame_widget,
            Box::new(|display, widget, input, _serial, _time, id, x, y, _| {
                let Some(window) = display.widget_window(widget) else {
                    return;
                };
                if let Some(frame) = display.windows.get_mut(&window).and_then(|w| w.frame.as_mut()) {
                    let location = frame.engine.touch_down(input.0 as u64, id, x, y);
                    if let FrameLocation::Resizing(edges) = location {
                        if let Some(w) = display.windows.get_mut(&window) {
                            w.resize_edges = edges;
                        }
                    }
                }
                display.drain_frame_status(window, input);
            }),
        );
        self.widget_set_touch_up_handler(
            frame_widget,
            Box::new(|display, widget, input, _serial, _time, id, _| {
                let Some(window) = display.widget_window(widget) else {
                    return;
                };
                if let Some(frame) = display.windows.get_mut(&window).and_then(|w| w.frame.as_mut()) {
                    frame.engine.touch_up(input.0 as u64, id);
                }
                display.drain_frame_status(window, input);
            }),
        );
        self.widget_set_redraw_handler(
            frame_widget,
            Box::new(|display, widget, drawable, _| {
                let Some(window) = display.widget_window(widget) else {
                    return;
                };
                display.draw_frame(window, drawable);
            }),
        );
    }

    fn draw_frame(&mut self, window: WindowId, drawable: &mut Drawable<'_>) {
        let Drawable::Pixels(canvas) = drawable else {
            return;
        };
        let Some(frame) = self.windows.get_mut(&window).and_then(|w| w.frame.as_mut()) else {
            return;
        };
        let active = frame.engine.flags().contains(FrameFlags::ACTIVE);
        let interior = frame.engine.interior();
        let titlebar = if active { 0xff285577 } else { 0xff666666 };
        canvas.fill(0xff333333);
        canvas.fill_rect(
            Rectangle::new(interior.x, 0, interior.width, interior.y),
            titlebar,
        );
    }

    fn drain_frame_status(&mut self, window: WindowId, input: InputId) {
        let Some(frame) = self.windows.get_mut(&window).and_then(|w| w.frame.as_mut()) else {
            return;
        };
        let status = frame.engine.status();
        frame.engine.status_clear(status);
        if status.is_empty() {
            return;
        }
        let frame_widget = frame.widget;
        let surface = self.window_main_surface(window);
        let (seat, serial) = match self.inputs.get(&input) {
            Some(inp) => (inp.seat, self.serial),
            None => return,
        };
        if status.contains(FrameStatus::REPAINT) {
            self.schedule_widget_redraw(frame_widget);
        }
        if status.contains(FrameStatus::MOVE) {
            self.conn.start_move(surface, seat, serial);
        }
        if status.contains(FrameStatus::RESIZE) {
            let edges = self.windows.get(&window).map(|w| w.resize_edges).unwrap_or_default();
            self.conn.start_resize(surface, seat, serial, edges);
        }
        if status.contains(FrameStatus::MAXIMIZE) {
            self.window_toggle_maximized(window);
        }
        if status.contains(FrameStatus::MINIMIZE) {
            self.window_set_minimized(window);
        }
        if status.contains(FrameStatus::MENU) {
            let (x, y) = self.input_pointer_position(input);
            self.window_show_frame_menu(window, input, x as i32, y as i32);
        }
        if status.contains(FrameStatus::CLOSE) {
            self.window_close(window);
        }
    }

    // ---- menus ----

    /// Pop up a menu at `(x, y)` relative to `parent`'s main surface. The
    /// handler fires with the selected entry index, or `None` on dismissal.
    pub fn window_show_menu(
        &mut self,
        parent: WindowId,
        input: InputId,
        x: i32,
        y: i32,
        entries: Vec<String>,
        handler: MenuHandler,
    ) -> WindowId {
        let parent_surface = self.window_main_surface(parent);
        let menu = self.new_window(WindowKind::Menu);
        let surface = self.window_main_surface(menu);
        let (seat, serial) = match self.inputs.get(&input) {
            Some(inp) => (inp.seat, self.serial),
            None => {
                self.destroy_window(menu);
                return parent;
            }
        };
        self.conn.set_popup(surface, parent_surface, seat, serial, x, y);

        let height = MENU_ENTRY_HEIGHT * entries.len().max(1) as i32;
        let root = self.windows[&menu].surfaces[0].root_widget;
        self.widget_set_user_data(
            root,
            Box::new(MenuState {
                entries,
                hover: None,
                handler: Some(handler),
                parent,
            }),
        );
        self.install_menu_handlers(root, menu);
        self.window_schedule_resize(menu, MENU_WIDTH, height);
        menu
    }

    fn window_show_frame_menu(&mut self, window: WindowId, input: InputId, x: i32, y: i32) {
        let entries = vec!["Close".to_owned(), "Maximize".to_owned(), "Fullscreen".to_owned()];
        self.window_show_menu(
            window,
            input,
            x,
            y,
            entries,
            Box::new(|display, parent, index| match index {
                Some(0) => display.window_close(parent),
                Some(1) => display.window_toggle_maximized(parent),
                Some(2) => display.window_toggle_fullscreen(parent),
                _ => {}
            }),
        );
    }

    fn install_menu_handlers(&mut self, root: WidgetId, menu: WindowId) {
        self.widget_set_redraw_handler(
            root,
            Box::new(move |display, widget, drawable, data| {
                let Drawable::Pixels(canvas) = drawable else {
                    return;
                };
                let Some(state) = data.downcast_mut::<MenuState>() else {
                    return;
                };
                canvas.fill(0xff444444);
                if let Some(hover) = state.hover {
                    canvas.fill_rect(
                        Rectangle::new(
                            0,
                            hover as i32 * MENU_ENTRY_HEIGHT,
                            display.widget_allocation(widget).width,
                            MENU_ENTRY_HEIGHT,
                        ),
                        0xff285577,
                    );
                }
            }),
        );
        self.widget_set_motion_handler(
            root,
            Box::new(move |display, widget, _input, _time, _x, y, data| {
                let Some(state) = data.downcast_mut::<MenuState>() else {
                    return None;
                };
                let index = (y as i32 / MENU_ENTRY_HEIGHT).max(0) as usize;
                let hover = (index < state.entries.len()).then_some(index);
                if state.hover != hover {
                    state.hover = hover;
                    display.schedule_widget_redraw(widget);
                }
                Some(CursorIcon::Default)
            }),
        );
        self.widget_set_button_handler(
            root,
            Box::new(move |display, _widget, _input, _time, button, state, data| {
                if button != BTN_LEFT || state != ButtonState::Released {
                    return;
                }
                let Some(menu_state) = data.downcast_mut::<MenuState>() else {
                    return;
                };
                let choice = menu_state.hover;
                let parent = menu_state.parent;
                let handler = menu_state.handler.take();
                display.destroy_window(menu);
                if let Some(mut handler) = handler {
                    handler(display, parent, choice);
                }
            }),
        );
    }

    pub(crate) fn handle_popup_done(&mut self, surface: SurfaceId) {
        let Some(&window) = self.surface_windows.get(&surface) else {
            return;
        };
        if self.windows.get(&window).map(|w| w.kind) != Some(WindowKind::Menu) {
            return;
        }
        let root = self.windows[&window].surfaces[0].root_widget;
        let taken = self
            .widgets
            .get_mut(&root)
            .and_then(|w| w.user_data.as_deref_mut())
            .and_then(|d| d.downcast_mut::<MenuState>())
            .map(|state| (state.parent, state.handler.take()));
        self.destroy_window(window);
        if let Some((parent, Some(mut handler))) = taken {
            handler(self, parent, None);
        }
    }

    // ---- tooltips ----

    /// Track pointer dwell for tooltips: arriving over (or moving within) a
    /// widget that carries tooltip text restarts the timer; anything else
    /// cancels it.
    pub(crate) fn tooltip_hover(&mut self, input: InputId, widget: Option<WidgetId>) {
        if let Some(token) = self.tooltip_timer.take() {
            self.handle.remove(token);
        }
        let Some(widget) = widget else {
            return;
        };
        if self.widgets.get(&widget).and_then(|w| w.tooltip.as_ref()).is_none() {
            return;
        }
        let timer = calloop::timer::Timer::from_duration(TOOLTIP_DELAY);
        let token = self
            .handle
            .insert_source(timer, move |_, _, display: &mut Display| {
                display.tooltip_timer = None;
                display.show_tooltip(input, widget);
                calloop::timer::TimeoutAction::Drop
            });
        match token {
            Ok(token) => self.tooltip_timer = Some(token),
            Err(err) => tracing::error!(%err, "failed to arm tooltip timer"),
        }
    }

    fn show_tooltip(&mut self, input: InputId, widget: WidgetId) {
        let Some(window) = self.widget_window(widget) else {
            return;
        };
        let Some(text) = self.widgets.get(&widget).and_then(|w| w.tooltip.clone()) else {
            return;
        };
        let (x, y) = self.input_pointer_position(input);
        fire_win!(self, window, tooltip, |h, data| h(
            self, window, widget, &text, x, y, data
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test::{FakeConnection, Request};
    use crate::protocol::{CallbackId, Event};
    use crate::utils::Serial;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn setup() -> (Display, WindowId) {
        let mut display = Display::new_for_tests(FakeConnection::new());
        let window = display.create_window();
        display.window_schedule_resize(window, 300, 200);
        display.run_deferred();
        // Retire the initial frame callback so tests start unthrottled.
        frame_done(&mut display, window);
        display.run_deferred();
        display.fake().requests.clear();
        (display, window)
    }

    fn frame_done(display: &mut Display, window: WindowId) {
        let surface = display.window_main_surface(window);
        let callback = display.fake().last_frame_callback().unwrap();
        display.handle_event(Event::FrameDone {
            surface,
            callback,
            time: 16,
        });
    }

    #[test]
    fn multiple_damage_sources_collapse_into_one_repaint() {
        let (mut display, window) = setup();
        let root = display.window_root_widget(window);
        let child = display.add_widget(root);
        display.widget_set_allocation(child, Rectangle::new(0, 0, 50, 50));

        display.schedule_widget_redraw(root);
        display.schedule_widget_redraw(child);
        display.window_schedule_redraw(window);
        display.run_deferred();

        assert_eq!(display.fake().count(|r| matches!(r, Request::Commit(_))), 1);
        assert_eq!(display.fake().count(|r| matches!(r, Request::Frame { .. })), 1);
    }

    #[test]
    fn at_most_one_frame_callback_is_outstanding() {
        let (mut display, window) = setup();
        let root = display.window_root_widget(window);

        display.schedule_widget_redraw(root);
        display.run_deferred();
        assert_eq!(display.fake().count(|r| matches!(r, Request::Frame { .. })), 1);

        // Surface-level damage while a frame is outstanding waits.
        display.schedule_widget_redraw(root);
        display.run_deferred();
        assert_eq!(display.fake().count(|r| matches!(r, Request::Frame { .. })), 1);
        assert_eq!(display.fake().count(|r| matches!(r, Request::CancelFrame(_))), 0);

        // A whole-window repaint may cancel and replace the callback.
        display.window_schedule_redraw(window);
        display.run_deferred();
        assert_eq!(display.fake().count(|r| matches!(r, Request::CancelFrame(_))), 1);
        assert_eq!(display.fake().count(|r| matches!(r, Request::Frame { .. })), 2);
    }

    #[test]
    fn deferred_surface_damage_repaints_after_frame_done() {
        let (mut display, window) = setup();
        let root = display.window_root_widget(window);

        display.schedule_widget_redraw(root);
        display.run_deferred();
        display.schedule_widget_redraw(root);
        display.run_deferred();
        assert_eq!(display.fake().count(|r| matches!(r, Request::Commit(_))), 1);

        frame_done(&mut display, window);
        display.run_deferred();
        assert_eq!(display.fake().count(|r| matches!(r, Request::Commit(_))), 2);
    }

    #[test]
    fn resize_waits_for_the_outstanding_frame() {
        let (mut display, window) = setup();
        let root = display.window_root_widget(window);
        display.schedule_widget_redraw(root);
        display.run_deferred();
        let commits = display.fake().count(|r| matches!(r, Request::Commit(_)));

        display.window_schedule_resize(window, 400, 300);
        display.run_deferred();
        // Still throttled: the last frame has not been presented.
        assert_eq!(display.fake().count(|r| matches!(r, Request::Commit(_))), commits);
        assert_eq!(display.windows[&window].allocation.size(), Size::new(300, 200));

        frame_done(&mut display, window);
        display.run_deferred();
        assert_eq!(display.windows[&window].allocation.size(), Size::new(400, 300));
        assert!(display.fake().count(|r| matches!(r, Request::Commit(_))) > commits);
    }

    #[test]
    fn repaints_hold_while_a_configure_round_trip_is_pending() {
        let (mut display, window) = setup();
        display.window_set_fullscreen(window, true);
        assert_eq!(display.windows[&window].configure_requests, 1);

        display.window_schedule_redraw(window);
        display.run_deferred();
        assert_eq!(display.fake().count(|r| matches!(r, Request::Commit(_))), 0);

        let callback = display
            .fake()
            .requests
            .iter()
            .find_map(|r| match r {
                Request::Sync(cb) => Some(*cb),
                _ => None,
            })
            .unwrap();
        display.handle_event(Event::SyncDone { callback });
        display.run_deferred();
        assert_eq!(display.fake().count(|r| matches!(r, Request::Commit(_))), 1);
    }

    #[test]
    fn decorated_window_clamps_to_minimum_size() {
        let (mut display, window) = setup();
        display.window_set_decorated(window, true);
        display.run_deferred();
        frame_done(&mut display, window);
        display.window_schedule_resize(window, 50, 50);
        display.run_deferred();
        assert_eq!(display.windows[&window].allocation.size(), Size::new(200, 200));
    }

    #[test]
    fn configure_resizes_and_tracks_edges() {
        let (mut display, window) = setup();
        let surface = display.window_main_surface(window);
        display.handle_event(Event::Configure {
            surface,
            edges: ResizeEdge::RIGHT | ResizeEdge::BOTTOM,
            width: 500,
            height: 400,
        });
        display.run_deferred();
        assert_eq!(display.windows[&window].allocation.size(), Size::new(500, 400));
        assert!(display.windows[&window].resizing);
    }

    #[test]
    fn fullscreen_saves_and_restores_the_allocation() {
        let (mut display, window) = setup();
        display.window_set_fullscreen(window, true);
        // Resolve the round trip, then apply the server-size configure.
        let sync = |d: &mut Display| {
            let cb = d
                .fake()
                .requests
                .iter()
                .rev()
                .find_map(|r| match r {
                    Request::Sync(cb) => Some(*cb),
                    _ => None,
                })
                .unwrap();
            d.handle_event(Event::SyncDone { callback: cb });
        };
        sync(&mut display);
        let surface = display.window_main_surface(window);
        display.handle_event(Event::Configure {
            surface,
            edges: ResizeEdge::empty(),
            width: 1920,
            height: 1080,
        });
        display.run_deferred();
        assert_eq!(display.windows[&window].allocation.size(), Size::new(1920, 1080));
        frame_done(&mut display, window);

        display.window_set_fullscreen(window, false);
        sync(&mut display);
        display.run_deferred();
        assert_eq!(display.windows[&window].allocation.size(), Size::new(300, 200));
        assert_eq!(display.windows[&window].kind, WindowKind::Toplevel);
    }

    #[test]
    fn redraw_traversal_is_preorder_within_one_surface() {
        let (mut display, window) = setup();
        let root = display.window_root_widget(window);
        let a = display.add_widget(root);
        let b = display.add_widget(root);
        let a1 = display.add_widget(a);
        let sub = display.window_add_subsurface(window, false);
        display.widget_set_allocation(sub, Rectangle::new(10, 10, 20, 20));

        let order = Rc::new(RefCell::new(Vec::new()));
        for (widget, name) in [(root, "root"), (a, "a"), (b, "b"), (a1, "a1"), (sub, "sub")] {
            let o = order.clone();
            display.widget_set_redraw_handler(
                widget,
                Box::new(move |_, _, _, _| {
                    o.borrow_mut().push(name);
                }),
            );
        }
        display.window_schedule_redraw(window);
        display.run_deferred();
        // The sub-surface root paints for its own surface, after the main
        // surface's tree.
        assert_eq!(*order.borrow(), vec!["root", "a", "a1", "b", "sub"]);
    }

    #[test]
    fn destroying_a_subsurface_root_tears_down_its_surface() {
        let (mut display, window) = setup();
        let sub = display.window_add_subsurface(window, false);
        let sub_surface = display.widget_surface(sub).unwrap();
        assert_eq!(display.windows[&window].surfaces.len(), 2);

        display.destroy_widget(sub);
        assert_eq!(display.windows[&window].surfaces.len(), 1);
        assert!(!display.surface_windows.contains_key(&sub_surface));
        assert_eq!(
            display.fake().count(|r| matches!(r, Request::DestroySurface(_))),
            1
        );

        // A whole-window repaint only touches the surviving surface.
        display.window_schedule_redraw(window);
        display.run_deferred();
        assert_eq!(display.fake().count(|r| matches!(r, Request::Commit(_))), 1);
    }

    #[test]
    fn opaque_widget_region_is_published_on_flush() {
        let (mut display, window) = setup();
        let root = display.window_root_widget(window);
        display.widget_set_opaque(root, true);
        display.window_schedule_redraw(window);
        display.run_deferred();
        let region = display.fake().requests.iter().rev().find_map(|r| match r {
            Request::OpaqueRegion { region, .. } => Some(*region),
            _ => None,
        });
        assert_eq!(region, Some(Some(Rectangle::new(0, 0, 300, 200))));
    }

    #[test]
    fn decorations_claim_the_whole_frame_for_opaque_and_input() {
        let (mut display, window) = setup();
        display.window_set_decorated(window, true);
        display.run_deferred();
        let opaque = display.fake().requests.iter().rev().find_map(|r| match r {
            Request::OpaqueRegion { region, .. } => Some(*region),
            _ => None,
        });
        let input = display.fake().requests.iter().rev().find_map(|r| match r {
            Request::InputRegion { region, .. } => Some(*region),
            _ => None,
        });
        let full = Some(Rectangle::new(0, 0, 300, 200));
        assert_eq!(opaque, Some(full));
        assert_eq!(input, Some(full));
    }

    #[test]
    fn frame_close_button_closes_the_window() {
        let (mut display, window) = setup();
        display.window_set_decorated(window, true);
        display.run_deferred();
        let closed = Rc::new(std::cell::Cell::new(false));
        let c = closed.clone();
        display.window_set_close_handler(
            window,
            Box::new(move |_, _, _| {
                c.set(true);
            }),
        );

        let seat = crate::protocol::SeatId(1);
        display.handle_event(Event::SeatAdded { seat });
        let surface = display.window_main_surface(window);
        // Find the close button: rightmost button in the titlebar.
        let (bx, by) = {
            let w = display.windows.get_mut(&window).unwrap();
            let frame = w.frame.as_mut().unwrap();
            let interior = frame.engine.interior();
            (frame.engine.width() as f64 - 14.0, interior.y as f64 / 2.0)
        };
        display.handle_event(Event::PointerEnter {
            seat,
            serial: Serial(1),
            surface,
            x: bx,
            y: by,
        });
        display.handle_event(Event::PointerButton {
            seat,
            serial: Serial(2),
            time: 1,
            button: BTN_LEFT,
            state: ButtonState::Pressed,
        });
        display.handle_event(Event::PointerButton {
            seat,
            serial: Serial(3),
            time: 2,
            button: BTN_LEFT,
            state: ButtonState::Released,
        });
        assert!(closed.get());
    }

    #[test]
    fn titlebar_drag_starts_a_move() {
        let (mut display, window) = setup();
        display.window_set_decorated(window, true);
        display.run_deferred();
        let seat = crate::protocol::SeatId(1);
        display.handle_event(Event::SeatAdded { seat });
        let surface = display.window_main_surface(window);
        display.handle_event(Event::PointerEnter {
            seat,
            serial: Serial(1),
            surface,
            x: 50.0,
            y: 15.0,
        });
        display.handle_event(Event::PointerButton {
            seat,
            serial: Serial(2),
            time: 1,
            button: BTN_LEFT,
            state: ButtonState::Pressed,
        });
        assert_eq!(display.fake().count(|r| matches!(r, Request::StartMove { .. })), 1);
    }

    #[test]
    fn stale_frame_callback_is_ignored() {
        let (mut display, window) = setup();
        let root = display.window_root_widget(window);
        display.schedule_widget_redraw(root);
        display.run_deferred();
        let surface = display.window_main_surface(window);
        display.handle_event(Event::FrameDone {
            surface,
            callback: CallbackId(9999),
            time: 1,
        });
        // The real callback must still be outstanding.
        assert!(display.windows[&window].surfaces[0].frame_cb.is_some());
    }

    #[test]
    fn tooltip_fires_after_dwell_and_leave_cancels_the_timer() {
        init_logging();
        let mut event_loop = calloop::EventLoop::<Display>::try_new().unwrap();
        let mut display = Display::new(Box::new(FakeConnection::new()), event_loop.handle());
        let window = display.create_window();
        display.window_schedule_resize(window, 300, 200);
        display.run_deferred();
        let root = display.window_root_widget(window);
        display.widget_set_tooltip(root, Some("hint".to_owned()));
        let shown = Rc::new(std::cell::Cell::new(0u32));
        let s = shown.clone();
        display.window_set_tooltip_handler(
            window,
            Box::new(move |_, _, _, text, _, _, _| {
                assert_eq!(text, "hint");
                s.set(s.get() + 1);
            }),
        );

        let seat = crate::protocol::SeatId(1);
        display.handle_event(Event::SeatAdded { seat });
        let surface = display.window_main_surface(window);
        display.handle_event(Event::PointerEnter {
            seat,
            serial: Serial(1),
            surface,
            x: 10.0,
            y: 10.0,
        });
        display.handle_event(Event::PointerMotion {
            seat,
            time: 0,
            x: 10.0,
            y: 10.0,
        });
        assert!(display.tooltip_timer.is_some());

        // Leaving cancels the dwell outright.
        display.handle_event(Event::PointerLeave {
            seat,
            serial: Serial(2),
            surface,
        });
        assert!(display.tooltip_timer.is_none());

        display.handle_event(Event::PointerEnter {
            seat,
            serial: Serial(3),
            surface,
            x: 10.0,
            y: 10.0,
        });
        display.handle_event(Event::PointerMotion {
            seat,
            time: 1,
            x: 10.0,
            y: 10.0,
        });
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3);
        while shown.get() == 0 && std::time::Instant::now() < deadline {
            event_loop
                .dispatch(Some(std::time::Duration::from_millis(50)), &mut display)
                .unwrap();
        }
        assert_eq!(shown.get(), 1);
    }

    #[test]
    fn menu_selection_fires_handler_and_destroys_the_menu() {
        let (mut display, window) = setup();
        let seat = crate::protocol::SeatId(1);
        display.handle_event(Event::SeatAdded { seat });
        let input = display.seat_inputs[&seat];

        let picked = Rc::new(RefCell::new(None));
        let p = picked.clone();
        let menu = display.window_show_menu(
            window,
            input,
            10,
            10,
            vec!["one".into(), "two".into()],
            Box::new(move |_, _, index| {
                *p.borrow_mut() = Some(index);
            }),
        );
        display.run_deferred();
        let menu_surface = display.window_main_surface(menu);
        display.handle_event(Event::PointerEnter {
            seat,
            serial: Serial(5),
            surface: menu_surface,
            x: 10.0,
            y: 30.0,
        });
        display.handle_event(Event::PointerMotion {
            seat,
            time: 1,
            x: 10.0,
            y: 30.0,
        });
        display.handle_event(Event::PointerButton {
            seat,
            serial: Serial(6),
            time: 2,
            button: BTN_LEFT,
            state: ButtonState::Pressed,
        });
        display.handle_event(Event::PointerButton {
            seat,
            serial: Serial(7),
            time: 3,
            button: BTN_LEFT,
            state: ButtonState::Released,
        });
        assert_eq!(*picked.borrow(), Some(Some(1)));
        assert!(!display.windows.contains_key(&menu));
    }

    #[test]
    fn popup_done_dismisses_the_menu() {
        let (mut display, window) = setup();
        let seat = crate::protocol::SeatId(1);
        display.handle_event(Event::SeatAdded { seat });
        let input = display.seat_inputs[&seat];
        let picked = Rc::new(RefCell::new(None));
        let p = picked.clone();
        let menu = display.window_show_menu(
            window,
            input,
            0,
            0,
            vec!["one".into()],
            Box::new(move |_, _, index| {
                *p.borrow_mut() = Some(index);
            }),
        );
        let menu_surface = display.window_main_surface(menu);
        display.handle_event(Event::PopupDone { surface: menu_surface });
        assert_eq!(*picked.borrow(), Some(None));
        assert!(!display.windows.contains_key(&menu));
    }
}
