//! Video geometry types

use serde::{Deserialize, Serialize};

/// Frame resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// 300x300, the capture size the face models are tuned for
    pub const SQUARE_300: Resolution = Resolution {
        width: 300,
        height: 300,
    };

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Byte length of an RGBA buffer at this resolution
    pub fn rgba_len(&self) -> usize {
        self.pixel_count() * 4
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::SQUARE_300
    }
}
