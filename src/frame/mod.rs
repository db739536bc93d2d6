mod sink;
mod source;

pub use sink::{SinkError, StreamSink};
pub use source::{FrameError, FrameSource};

/// Raw frames are always interleaved BGR.
pub const CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    width: u32,
    height: u32,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame_byte_size(&self) -> usize {
        self.width as usize * self.height as usize * CHANNELS
    }
}

impl std::fmt::Display for FrameGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One decoded image of exactly `geometry.frame_byte_size()` bytes.
#[derive(Debug, Clone)]
pub struct RawFrame {
    data: Vec<u8>,
    geometry: FrameGeometry,
}

impl RawFrame {
    /// Returns the buffer back when its length does not match the geometry.
    pub fn new(data: Vec<u8>, geometry: FrameGeometry) -> Result<Self, Vec<u8>> {
        if data.len() != geometry.frame_byte_size() {
            return Err(data);
        }
        Ok(Self { data, geometry })
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
