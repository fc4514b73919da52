//! Decoration frame engine.
//!
//! A [`Frame`] is pure bookkeeping for client-side decorations: it knows the
//! outer size of a decorated window, where the titlebar, buttons and resize
//! edges are, and which pointer or touch point is interacting with what. It
//! never draws and never talks to the server; the window layer drains its
//! [`FrameStatus`] bits and turns them into moves, resizes and button
//! actions. Geometry is memoized and recomputed lazily when the size, flags
//! or button set change.

use smallvec::SmallVec;

use crate::protocol::{ButtonState, ResizeEdge, BTN_LEFT, BTN_RIGHT};
use crate::utils::{Rectangle, Size};

bitflags::bitflags! {
    /// Pending actions accumulated by interaction, drained by the owner.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FrameStatus: u32 {
        const REPAINT = 0x1;
        const MINIMIZE = 0x2;
        const MAXIMIZE = 0x4;
        const CLOSE = 0x8;
        const MENU = 0x10;
        const MOVE = 0x20;
        const RESIZE = 0x40;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// The window holds keyboard focus; drawn highlighted.
        const ACTIVE = 0x1;
        /// Maximized windows have no resize borders.
        const MAXIMIZED = 0x2;
    }
}

bitflags::bitflags! {
    /// Which titlebar buttons the frame shows.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FrameButtons: u32 {
        const CLOSE = 0x1;
        const MAXIMIZE = 0x2;
        const MINIMIZE = 0x4;
    }
}

/// What part of the frame a point falls on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLocation {
    /// Outside the frame entirely.
    Exterior,
    /// The client content area.
    Interior,
    Titlebar,
    Resizing(ResizeEdge),
}

/// Metrics of the decoration. All in surface coordinates.
#[derive(Debug, Clone, Copy)]
pub struct FrameTheme {
    pub border: i32,
    pub titlebar_height: i32,
    pub button_size: i32,
    pub button_gap: i32,
    /// Extra reach of the corner resize areas along the edges.
    pub corner_grip: i32,
}

impl Default for FrameTheme {
    fn default() -> FrameTheme {
        FrameTheme {
            border: 4,
            titlebar_height: 24,
            button_size: 16,
            button_gap: 6,
            corner_grip: 12,
        }
    }
}

#[derive(Debug)]
struct FrameButton {
    action: FrameStatus,
    allocation: Rectangle,
    hover_count: u32,
    press_count: u32,
}

#[derive(Debug)]
struct PointerRecord {
    id: u64,
    x: f64,
    y: f64,
    hover: Option<usize>,
    /// Button index pressed by this pointer, if any.
    pressed: Option<usize>,
}

#[derive(Debug)]
struct TouchRecord {
    id: u64,
    touch_id: i32,
    button: Option<usize>,
}

#[derive(Debug)]
pub struct Frame {
    theme: FrameTheme,
    width: i32,
    height: i32,
    flags: FrameFlags,
    title: String,
    buttons: SmallVec<[FrameButton; 3]>,
    pointers: SmallVec<[PointerRecord; 1]>,
    touches: SmallVec<[TouchRecord; 2]>,
    status: FrameStatus,
    geometry_dirty: bool,
    interior: Rectangle,
}

impl Frame {
    /// Create a frame with the given outer size.
    pub fn new(theme: FrameTheme, width: i32, height: i32, buttons: FrameButtons, title: &str) -> Frame {
        let mut list = SmallVec::new();
        // Right-to-left order in the titlebar.
        for (flag, action) in [
            (FrameButtons::CLOSE, FrameStatus::CLOSE),
            (FrameButtons::MAXIMIZE, FrameStatus::MAXIMIZE),
            (FrameButtons::MINIMIZE, FrameStatus::MINIMIZE),
        ] {
            if buttons.contains(flag) {
                list.push(FrameButton {
                    action,
                    allocation: Rectangle::default(),
                    hover_count: 0,
                    press_count: 0,
                });
            }
        }
        Frame {
            theme,
            width,
            height,
            flags: FrameFlags::empty(),
            title: title.to_owned(),
            buttons: list,
            pointers: SmallVec::new(),
            touches: SmallVec::new(),
            status: FrameStatus::REPAINT,
            geometry_dirty: true,
            interior: Rectangle::default(),
        }
    }

    fn effective_border(&self) -> i32 {
        if self.flags.contains(FrameFlags::MAXIMIZED) {
            0
        } else {
            self.theme.border
        }
    }

    fn refresh_geometry(&mut self) {
        if !self.geometry_dirty {
            return;
        }
        let border = self.effective_border();
        let titlebar = self.theme.titlebar_height;
        self.interior = Rectangle::new(
            border,
            border + titlebar,
            self.width - 2 * border,
            self.height - 2 * border - titlebar,
        );
        let mut x = self.width - border - self.theme.button_gap - self.theme.button_size;
        let y = border + (titlebar - self.theme.button_size) / 2;
        for button in &mut self.buttons {
            button.allocation = Rectangle::new(x, y, self.theme.button_size, self.theme.button_size);
            x -= self.theme.button_size + self.theme.button_gap;
        }
        self.geometry_dirty = false;
    }

    pub fn resize(&mut self, width: i32, height: i32) {
        if self.width == width && self.height == height {
            return;
        }
        self.width = width;
        self.height = height;
        self.geometry_dirty = true;
        self.status |= FrameStatus::REPAINT;
    }

    /// Resize so the interior ends up `width` x `height`.
    pub fn resize_inside(&mut self, width: i32, height: i32) {
        let border = self.effective_border();
        self.resize(
            width + 2 * border,
            height + 2 * border + self.theme.titlebar_height,
        );
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn interior(&mut self) -> Rectangle {
        self.refresh_geometry();
        self.interior
    }

    /// The region that should accept input: the whole frame.
    pub fn input_rect(&mut self) -> Rectangle {
        Rectangle::new(0, 0, self.width, self.height)
    }

    /// The region the owner may mark opaque: the decorations are always drawn
    /// solid, so this is the full frame.
    pub fn opaque_rect(&mut self) -> Rectangle {
        Rectangle::new(0, 0, self.width, self.height)
    }

    pub fn set_title(&mut self, title: &str) {
        if self.title != title {
            self.title = title.to_owned();
            self.status |= FrameStatus::REPAINT;
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_flags(&mut self, flags: FrameFlags) {
        if self.flags.contains(flags) {
            return;
        }
        self.flags |= flags;
        if flags.contains(FrameFlags::MAXIMIZED) {
            self.geometry_dirty = true;
        }
        self.status |= FrameStatus::REPAINT;
    }

    pub fn unset_flags(&mut self, flags: FrameFlags) {
        if (self.flags & flags).is_empty() {
            return;
        }
        self.flags &= !flags;
        if flags.contains(FrameFlags::MAXIMIZED) {
            self.geometry_dirty = true;
        }
        self.status |= FrameStatus::REPAINT;
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn status(&self) -> FrameStatus {
        self.status
    }

    pub fn status_clear(&mut self, status: FrameStatus) {
        self.status &= !status;
    }

    fn button_at(&mut self, x: f64, y: f64) -> Option<usize> {
        self.refresh_geometry();
        self.buttons.iter().position(|b| b.allocation.contains(x, y))
    }

    /// Classify a point. Buttons sit inside the titlebar and report as
    /// titlebar here; interaction entry points check them first.
    pub fn location_at(&mut self, x: f64, y: f64) -> FrameLocation {
        self.refresh_geometry();
        if x < 0.0 || y < 0.0 || x >= self.width as f64 || y >= self.height as f64 {
            return FrameLocation::Exterior;
        }
        if self.interior.contains(x, y) {
            return FrameLocation::Interior;
        }
        let border = self.effective_border() as f64;
        if border > 0.0 {
            let mut edges = ResizeEdge::empty();
            let grip = (border + self.theme.corner_grip as f64).max(border);
            if x < border {
                edges |= ResizeEdge::LEFT;
            } else if x >= self.width as f64 - border {
                edges |= ResizeEdge::RIGHT;
            }
            if y < border {
                edges |= ResizeEdge::TOP;
            } else if y >= self.height as f64 - border {
                edges |= ResizeEdge::BOTTOM;
            }
            if !edges.is_empty() {
                // Widen corners: an edge hit near a corner drags both edges.
                if edges.intersects(ResizeEdge::LEFT | ResizeEdge::RIGHT) {
                    if y < grip {
                        edges |= ResizeEdge::TOP;
                    } else if y >= self.height as f64 - grip {
                        edges |= ResizeEdge::BOTTOM;
                    }
                }
                if edges.intersects(ResizeEdge::TOP | ResizeEdge::BOTTOM) {
                    if x < grip {
                        edges |= ResizeEdge::LEFT;
                    } else if x >= self.width as f64 - grip {
                        edges |= ResizeEdge::RIGHT;
                    }
                }
                return FrameLocation::Resizing(edges);
            }
        }
        FrameLocation::Titlebar
    }

    fn set_hover(&mut self, pointer: usize, hover: Option<usize>) {
        let old = self.pointers[pointer].hover;
        if old == hover {
            return;
        }
        if let Some(i) = old {
            self.buttons[i].hover_count = self.buttons[i].hover_count.saturating_sub(1);
        }
        if let Some(i) = hover {
            self.buttons[i].hover_count = self.buttons[i].hover_count.saturating_add(1);
        }
        self.pointers[pointer].hover = hover;
        self.status |= FrameStatus::REPAINT;
    }

    pub fn pointer_enter(&mut self, id: u64, x: f64, y: f64) -> FrameLocation {
        self.pointers.push(PointerRecord {
            id,
            x,
            y,
            hover: None,
            pressed: None,
        });
        self.pointer_motion(id, x, y)
    }

    pub fn pointer_motion(&mut self, id: u64, x: f64, y: f64) -> FrameLocation {
        let Some(pointer) = self.pointers.iter().position(|p| p.id == id) else {
            return self.location_at(x, y);
        };
        self.pointers[pointer].x = x;
        self.pointers[pointer].y = y;
        let hover = self.button_at(x, y);
        self.set_hover(pointer, hover);
        self.location_at(x, y)
    }

    pub fn pointer_leave(&mut self, id: u64) {
        let Some(pointer) = self.pointers.iter().position(|p| p.id == id) else {
            return;
        };
        self.set_hover(pointer, None);
        if let Some(i) = self.pointers[pointer].pressed {
            self.buttons[i].press_count = self.buttons[i].press_count.saturating_sub(1);
            self.status |= FrameStatus::REPAINT;
        }
        self.pointers.remove(pointer);
    }

    /// Feed a pointer button event. The returned location tells the caller
    /// where the interaction happened (to pass resize edges along).
    pub fn pointer_button(&mut self, id: u64, button: u32, state: ButtonState) -> FrameLocation {
        let Some(pointer) = self.pointers.iter().position(|p| p.id == id) else {
            return FrameLocation::Exterior;
        };
        let (x, y) = (self.pointers[pointer].x, self.pointers[pointer].y);
        let location = self.location_at(x, y);
        match (button, state) {
            (BTN_LEFT, ButtonState::Pressed) => {
                if let Some(i) = self.button_at(x, y) {
                    self.pointers[pointer].pressed = Some(i);
                    self.buttons[i].press_count = self.buttons[i].press_count.saturating_add(1);
                    self.status |= FrameStatus::REPAINT;
                } else {
                    match location {
                        FrameLocation::Titlebar => self.status |= FrameStatus::MOVE,
                        FrameLocation::Resizing(_) => self.status |= FrameStatus::RESIZE,
                        _ => {}
                    }
                }
            }
            (BTN_LEFT, ButtonState::Released) => {
                if let Some(i) = self.pointers[pointer].pressed.take() {
                    self.buttons[i].press_count = self.buttons[i].press_count.saturating_sub(1);
                    self.status |= FrameStatus::REPAINT;
                    // Releasing over the pressed button triggers its action.
                    if self.button_at(x, y) == Some(i) {
                        self.status |= self.buttons[i].action;
                    }
                }
            }
            (BTN_RIGHT, ButtonState::Pressed) => {
                if location == FrameLocation::Titlebar {
                    self.status |= FrameStatus::MENU;
                }
            }
            _ => {}
        }
        location
    }

    /// The position of the pointer that most recently posted a status, used
    /// by the owner to place menus.
    pub fn pointer_position(&self, id: u64) -> Option<(f64, f64)> {
        self.pointers.iter().find(|p| p.id == id).map(|p| (p.x, p.y))
    }

    pub fn touch_down(&mut self, id: u64, touch_id: i32, x: f64, y: f64) -> FrameLocation {
        let location = self.location_at(x, y);
        let button = self.button_at(x, y);
        if let Some(i) = button {
            self.buttons[i].press_count = self.buttons[i].press_count.saturating_add(1);
            self.status |= FrameStatus::REPAINT;
        } else {
            match location {
                FrameLocation::Titlebar => self.status |= FrameStatus::MOVE,
                FrameLocation::Resizing(_) => self.status |= FrameStatus::RESIZE,
                _ => {}
            }
        }
        self.touches.push(TouchRecord { id, touch_id, button });
        location
    }

    pub fn touch_up(&mut self, id: u64, touch_id: i32) {
        let Some(touch) = self
            .touches
            .iter()
            .position(|t| t.id == id && t.touch_id == touch_id)
        else {
            return;
        };
        if let Some(i) = self.touches[touch].button {
            self.buttons[i].press_count = self.buttons[i].press_count.saturating_sub(1);
            self.status |= self.buttons[i].action | FrameStatus::REPAINT;
        }
        self.touches.remove(touch);
    }

    #[cfg(test)]
    fn button_counts(&self) -> Vec<(u32, u32)> {
        self.buttons.iter().map(|b| (b.hover_count, b.press_count)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        let mut f = Frame::new(
            FrameTheme::default(),
            400,
            300,
            FrameButtons::CLOSE | FrameButtons::MAXIMIZE,
            "demo",
        );
        f.status_clear(FrameStatus::all());
        f
    }

    fn close_button_center(f: &mut Frame) -> (f64, f64) {
        f.refresh_geometry();
        let a = f.buttons[0].allocation;
        ((a.x + a.width / 2) as f64, (a.y + a.height / 2) as f64)
    }

    #[test]
    fn interior_and_titlebar_classification() {
        let mut f = frame();
        assert_eq!(f.location_at(200.0, 150.0), FrameLocation::Interior);
        assert_eq!(f.location_at(100.0, 15.0), FrameLocation::Titlebar);
        assert_eq!(f.location_at(-1.0, 10.0), FrameLocation::Exterior);
        assert_eq!(f.location_at(450.0, 10.0), FrameLocation::Exterior);
    }

    #[test]
    fn edges_and_corners_resolve_to_resize_edges() {
        let mut f = frame();
        assert_eq!(
            f.location_at(1.0, 150.0),
            FrameLocation::Resizing(ResizeEdge::LEFT)
        );
        assert_eq!(
            f.location_at(399.0, 299.0),
            FrameLocation::Resizing(ResizeEdge::BOTTOM | ResizeEdge::RIGHT)
        );
        assert_eq!(
            f.location_at(1.0, 1.0),
            FrameLocation::Resizing(ResizeEdge::TOP | ResizeEdge::LEFT)
        );
        // Near a corner, an edge hit drags both edges.
        assert_eq!(
            f.location_at(1.0, 290.0),
            FrameLocation::Resizing(ResizeEdge::LEFT | ResizeEdge::BOTTOM)
        );
    }

    #[test]
    fn maximized_frame_has_no_resize_edges() {
        let mut f = frame();
        f.set_flags(FrameFlags::MAXIMIZED);
        assert_eq!(f.location_at(1.0, 150.0), FrameLocation::Interior);
        assert_eq!(f.location_at(1.0, 1.0), FrameLocation::Titlebar);
    }

    #[test]
    fn press_release_over_button_posts_its_action() {
        let mut f = frame();
        let (x, y) = close_button_center(&mut f);
        f.pointer_enter(1, x, y);
        f.pointer_button(1, BTN_LEFT, ButtonState::Pressed);
        assert!(!f.status().contains(FrameStatus::CLOSE));
        assert!(!f.status().contains(FrameStatus::MOVE));
        f.pointer_button(1, BTN_LEFT, ButtonState::Released);
        assert!(f.status().contains(FrameStatus::CLOSE));
    }

    #[test]
    fn release_away_from_pressed_button_cancels() {
        let mut f = frame();
        let (x, y) = close_button_center(&mut f);
        f.pointer_enter(1, x, y);
        f.pointer_button(1, BTN_LEFT, ButtonState::Pressed);
        f.pointer_motion(1, 200.0, 150.0);
        f.pointer_button(1, BTN_LEFT, ButtonState::Released);
        assert!(!f.status().contains(FrameStatus::CLOSE));
        assert_eq!(f.button_counts()[0].1, 0);
    }

    #[test]
    fn titlebar_press_posts_move_and_edge_press_posts_resize() {
        let mut f = frame();
        f.pointer_enter(1, 100.0, 15.0);
        let loc = f.pointer_button(1, BTN_LEFT, ButtonState::Pressed);
        assert_eq!(loc, FrameLocation::Titlebar);
        assert!(f.status().contains(FrameStatus::MOVE));

        f.pointer_motion(1, 1.0, 150.0);
        let loc = f.pointer_button(1, BTN_LEFT, ButtonState::Pressed);
        assert_eq!(loc, FrameLocation::Resizing(ResizeEdge::LEFT));
        assert!(f.status().contains(FrameStatus::RESIZE));
    }

    #[test]
    fn right_click_titlebar_posts_menu() {
        let mut f = frame();
        f.pointer_enter(1, 100.0, 15.0);
        f.pointer_button(1, BTN_RIGHT, ButtonState::Pressed);
        assert!(f.status().contains(FrameStatus::MENU));
    }

    #[test]
    fn hover_counts_saturate_across_pointers() {
        let mut f = frame();
        let (x, y) = close_button_center(&mut f);
        f.pointer_enter(1, x, y);
        f.pointer_enter(2, x, y);
        assert_eq!(f.button_counts()[0].0, 2);
        f.pointer_leave(1);
        f.pointer_leave(2);
        assert_eq!(f.button_counts()[0].0, 0);
        // A stray leave must not underflow.
        f.pointer_enter(3, x, y);
        f.pointer_leave(3);
        f.pointer_leave(3);
        assert_eq!(f.button_counts()[0].0, 0);
    }

    #[test]
    fn touch_on_button_fires_on_up() {
        let mut f = frame();
        let (x, y) = close_button_center(&mut f);
        f.touch_down(7, 0, x, y);
        assert!(!f.status().contains(FrameStatus::CLOSE));
        f.touch_up(7, 0);
        assert!(f.status().contains(FrameStatus::CLOSE));
    }

    #[test]
    fn status_drains_selectively() {
        let mut f = frame();
        f.pointer_enter(1, 100.0, 15.0);
        f.pointer_button(1, BTN_LEFT, ButtonState::Pressed);
        f.set_title("other");
        assert!(f.status().contains(FrameStatus::MOVE | FrameStatus::REPAINT));
        f.status_clear(FrameStatus::MOVE);
        assert!(!f.status().contains(FrameStatus::MOVE));
        assert!(f.status().contains(FrameStatus::REPAINT));
    }

    #[test]
    fn resize_inside_round_trips_interior() {
        let mut f = frame();
        f.resize_inside(640, 480);
        let interior = f.interior();
        assert_eq!(interior.width, 640);
        assert_eq!(interior.height, 480);
    }

    #[test]
    fn geometry_is_memoized_until_dirty() {
        let mut f = frame();
        let a = f.interior();
        assert_eq!(f.interior(), a);
        f.resize(500, 400);
        let b = f.interior();
        assert_ne!(a, b);
        assert_eq!(b.width, 500 - 2 * FrameTheme::default().border);
    }
}
