//! Display outputs and per-window output tracking.
//!
//! The server tells us which outputs each surface currently intersects; a
//! window renders at the highest scale among them so it never looks blurry on
//! the sharpest output it touches.

use crate::display::Display;
use crate::protocol::{OutputId, SurfaceId};
use crate::utils::{Rectangle, Transform};

#[derive(Debug)]
pub struct Output {
    pub(crate) id: OutputId,
    pub(crate) allocation: Rectangle,
    pub(crate) scale: i32,
    pub(crate) transform: Transform,
}

impl Output {
    pub(crate) fn new(id: OutputId) -> Output {
        Output {
            id,
            allocation: Rectangle::default(),
            scale: 1,
            transform: Transform::Normal,
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn allocation(&self) -> Rectangle {
        self.allocation
    }

    pub fn scale(&self) -> i32 {
        self.scale
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }
}

impl Display {
    pub fn output_scale(&self, output: OutputId) -> i32 {
        self.outputs.get(&output).map(|o| o.scale).unwrap_or(1)
    }

    pub(crate) fn surface_entered_output(&mut self, surface: SurfaceId, output: OutputId) {
        let Some(window) = self.surface_windows.get(&surface).copied() else {
            return;
        };
        if let Some(w) = self.windows.get_mut(&window) {
            if !w.outputs.contains(&output) {
                w.outputs.push(output);
            }
        }
        self.window_rescale(window);
    }

    pub(crate) fn surface_left_output(&mut self, surface: SurfaceId, output: OutputId) {
        let Some(window) = self.surface_windows.get(&surface).copied() else {
            return;
        };
        if let Some(w) = self.windows.get_mut(&window) {
            w.outputs.retain(|&o| o != output);
        }
        self.window_rescale(window);
    }

    pub(crate) fn output_scale_changed(&mut self, output: OutputId) {
        let affected: Vec<_> = self
            .windows
            .iter()
            .filter(|(_, w)| w.outputs.contains(&output))
            .map(|(&id, _)| id)
            .collect();
        for window in affected {
            self.window_rescale(window);
        }
    }

    /// Recompute a window's buffer scale from the outputs it intersects.
    fn window_rescale(&mut self, window: crate::window::WindowId) {
        let Some(w) = self.windows.get(&window) else {
            return;
        };
        let scale = w
            .outputs
            .iter()
            .filter_map(|o| self.outputs.get(o))
            .map(|o| o.scale)
            .max()
            .unwrap_or(1);
        let changed = {
            let Some(w) = self.windows.get_mut(&window) else {
                return;
            };
            let mut changed = false;
            for surface in &mut w.surfaces {
                if surface.buffer_scale != scale {
                    surface.buffer_scale = scale;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            tracing::debug!(?window, scale, "window buffer scale changed");
            self.window_schedule_redraw(window);
        }
    }
}
