//! Common renderer trait for all systems
//!
//! A system keeps its display hardware state (character RAM, registers) and hands
//! rasterization to a renderer that owns the framebuffer:
//!
//! ```text
//! System (state management) -> Renderer trait -> Frame
//! ```
//!
//! ```rust,ignore
//! use emu_core::renderer::Renderer;
//! use emu_core::types::Frame;
//!
//! struct PanelRenderer {
//!     frame: Frame,
//! }
//!
//! impl Renderer for PanelRenderer {
//!     fn get_frame(&self) -> &Frame {
//!         &self.frame
//!     }
//!
//!     fn clear(&mut self, color: u32) {
//!         self.frame.pixels.fill(color);
//!     }
//!
//!     fn reset(&mut self) {
//!         self.clear(0xFF000000);
//!     }
//!
//!     fn name(&self) -> &str {
//!         "Panel Renderer"
//!     }
//!
//!     fn resize(&mut self, width: u32, height: u32) {
//!         self.frame = Frame::new(width, height);
//!     }
//! }
//! ```

use crate::types::Frame;

/// Common renderer trait for all emulated graphics systems
pub trait Renderer: Send {
    /// Get the current framebuffer (read-only)
    fn get_frame(&self) -> &Frame;

    /// Clear the framebuffer with a solid color
    ///
    /// # Arguments
    /// * `color` - ARGB8888 color value (0xAARRGGBB)
    fn clear(&mut self, color: u32);

    /// Reset the renderer to its initial state
    fn reset(&mut self);

    /// Get the name of this renderer (for debugging/UI)
    fn name(&self) -> &str;

    /// Resize the renderer to new dimensions, discarding the old framebuffer
    fn resize(&mut self, width: u32, height: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockRenderer {
        frame: Frame,
    }

    impl Renderer for MockRenderer {
        fn get_frame(&self) -> &Frame {
            &self.frame
        }

        fn clear(&mut self, color: u32) {
            self.frame.pixels.fill(color);
        }

        fn reset(&mut self) {
            self.clear(0xFF000000);
        }

        fn resize(&mut self, width: u32, height: u32) {
            self.frame = Frame::new(width, height);
        }

        fn name(&self) -> &str {
            "Mock Renderer"
        }
    }

    #[test]
    fn test_renderer_clear_and_reset() {
        let mut renderer = MockRenderer {
            frame: Frame::new(96, 16),
        };
        renderer.clear(0xFFFF0000);
        assert!(renderer.get_frame().pixels.iter().all(|&p| p == 0xFFFF0000));

        renderer.reset();
        assert!(renderer.get_frame().pixels.iter().all(|&p| p == 0xFF000000));
        assert_eq!(renderer.name(), "Mock Renderer");
    }

    #[test]
    fn test_renderer_resize() {
        let mut renderer = MockRenderer {
            frame: Frame::new(96, 16),
        };
        renderer.resize(192, 32);
        let frame = renderer.get_frame();
        assert_eq!((frame.width, frame.height), (192, 32));
        assert_eq!(frame.pixels.len(), 192 * 32);
    }
}
