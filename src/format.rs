//! Source and destination format definitions
//!
//! Source (bitstream) formats identify the coded-data layout a stateless
//! decoder consumes; destination formats describe the raw picture layout it
//! produces. Both are identified on the wire by FourCC codes.

use serde::{Deserialize, Serialize};
use std::fmt;

const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// Coded (source) pixel format for stateless decoding
///
/// Each variant corresponds to a slice/frame-level bitstream format where all
/// reference and context data is supplied per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// H.264 / AVC slice data
    H264Slice,
    /// H.265 / HEVC slice data
    HevcSlice,
    /// VP8 frame data
    Vp8Frame,
    /// VP9 frame data
    Vp9Frame,
    /// AV1 frame data
    Av1Frame,
    /// MPEG-2 slice data
    Mpeg2Slice,
}

impl PixelFormat {
    /// FourCC code for this format
    pub fn fourcc(&self) -> u32 {
        match self {
            PixelFormat::H264Slice => fourcc(b'S', b'2', b'6', b'4'),
            PixelFormat::HevcSlice => fourcc(b'S', b'2', b'6', b'5'),
            PixelFormat::Vp8Frame => fourcc(b'V', b'P', b'8', b'F'),
            PixelFormat::Vp9Frame => fourcc(b'V', b'P', b'9', b'F'),
            PixelFormat::Av1Frame => fourcc(b'A', b'V', b'1', b'F'),
            PixelFormat::Mpeg2Slice => fourcc(b'M', b'G', b'2', b'S'),
        }
    }

    /// Look up a format by FourCC code
    pub fn from_fourcc(code: u32) -> Option<Self> {
        [
            PixelFormat::H264Slice,
            PixelFormat::HevcSlice,
            PixelFormat::Vp8Frame,
            PixelFormat::Vp9Frame,
            PixelFormat::Av1Frame,
            PixelFormat::Mpeg2Slice,
        ]
        .into_iter()
        .find(|f| f.fourcc() == code)
    }

    /// Default size for a source buffer holding one coded frame
    ///
    /// Coded frames are far smaller than raw ones but their size is
    /// unpredictable; entries grow on demand, so this only has to be a
    /// reasonable starting point.
    pub fn default_buffer_size(&self, width: u32, height: u32) -> usize {
        let raw = width as usize * height as usize;
        (raw / 2).max(64 * 1024)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::H264Slice => "h264-slice",
            PixelFormat::HevcSlice => "hevc-slice",
            PixelFormat::Vp8Frame => "vp8-frame",
            PixelFormat::Vp9Frame => "vp9-frame",
            PixelFormat::Av1Frame => "av1-frame",
            PixelFormat::Mpeg2Slice => "mpeg2-slice",
        };
        write!(f, "{}", name)
    }
}

/// Raw (destination) picture format
///
/// The "Mplane" variants split planes across separate memory buffers; the
/// others pack all planes into one contiguous buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RtFormat {
    /// 8-bit YUV 4:2:0, interleaved UV, single buffer
    Nv12,
    /// 8-bit YUV 4:2:0, interleaved UV, Y and UV in separate buffers
    Nv12Mplane,
    /// 10-bit YUV 4:2:0, interleaved UV, single buffer
    P010,
    /// Planar 8-bit YUV 4:2:0, single buffer
    Yuv420,
    /// Planar 8-bit YUV 4:2:0, three separate buffers
    Yuv420Mplane,
}

impl RtFormat {
    /// FourCC code for this format
    pub fn fourcc(&self) -> u32 {
        match self {
            RtFormat::Nv12 => fourcc(b'N', b'V', b'1', b'2'),
            RtFormat::Nv12Mplane => fourcc(b'N', b'M', b'1', b'2'),
            RtFormat::P010 => fourcc(b'P', b'0', b'1', b'0'),
            RtFormat::Yuv420 => fourcc(b'Y', b'U', b'1', b'2'),
            RtFormat::Yuv420Mplane => fourcc(b'Y', b'M', b'1', b'2'),
        }
    }

    /// Look up a format by FourCC code
    pub fn from_fourcc(code: u32) -> Option<Self> {
        [
            RtFormat::Nv12,
            RtFormat::Nv12Mplane,
            RtFormat::P010,
            RtFormat::Yuv420,
            RtFormat::Yuv420Mplane,
        ]
        .into_iter()
        .find(|f| f.fourcc() == code)
    }

    /// Number of separate memory planes (buffers) per picture
    pub fn num_planes(&self) -> usize {
        match self {
            RtFormat::Nv12 | RtFormat::P010 | RtFormat::Yuv420 => 1,
            RtFormat::Nv12Mplane => 2,
            RtFormat::Yuv420Mplane => 3,
        }
    }

    /// Bytes per luma sample (2 for the 10-bit-in-16 formats)
    fn bytes_per_sample(&self) -> usize {
        match self {
            RtFormat::P010 => 2,
            _ => 1,
        }
    }

    /// Calculate the per-plane memory layout for a picture of the given size
    pub fn plane_layout(&self, width: u32, height: u32) -> Vec<PlaneLayout> {
        let w = width as usize * self.bytes_per_sample();
        let h = height as usize;

        match self {
            RtFormat::Nv12 | RtFormat::P010 => {
                // Y followed by interleaved UV in one buffer
                vec![PlaneLayout {
                    stride: w,
                    size: w * h + w * (h / 2),
                }]
            }
            RtFormat::Nv12Mplane => vec![
                PlaneLayout { stride: w, size: w * h },
                PlaneLayout { stride: w, size: w * (h / 2) },
            ],
            RtFormat::Yuv420 => {
                // Y, U, V packed into one buffer
                vec![PlaneLayout {
                    stride: w,
                    size: w * h + (w / 2) * (h / 2) * 2,
                }]
            }
            RtFormat::Yuv420Mplane => vec![
                PlaneLayout { stride: w, size: w * h },
                PlaneLayout { stride: w / 2, size: (w / 2) * (h / 2) },
                PlaneLayout { stride: w / 2, size: (w / 2) * (h / 2) },
            ],
        }
    }

    /// Total bytes for one picture across all planes
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        self.plane_layout(width, height).iter().map(|p| p.size).sum()
    }
}

impl fmt::Display for RtFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RtFormat::Nv12 => "nv12",
            RtFormat::Nv12Mplane => "nv12m",
            RtFormat::P010 => "p010",
            RtFormat::Yuv420 => "yuv420",
            RtFormat::Yuv420Mplane => "yuv420m",
        };
        write!(f, "{}", name)
    }
}

/// Memory layout of one plane within a destination picture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Bytes per row
    pub stride: usize,
    /// Total bytes in the plane
    pub size: usize,
}

/// Negotiated source format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcFormat {
    /// Coded data format
    pub pixel_format: PixelFormat,
    /// Coded width
    pub width: u32,
    /// Coded height
    pub height: u32,
    /// Size of each source buffer
    pub buffer_size: usize,
}

/// Negotiated destination format
///
/// Width and height are what the device granted, which may differ from what
/// was requested (alignment); the granted values are authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DstFormat {
    /// Raw picture format
    pub rt_format: RtFormat,
    /// Granted width
    pub width: u32,
    /// Granted height
    pub height: u32,
    /// Per-plane layout
    pub planes: Vec<PlaneLayout>,
}

impl DstFormat {
    /// Build a destination format from granted dimensions
    pub fn new(rt_format: RtFormat, width: u32, height: u32) -> Self {
        DstFormat {
            rt_format,
            width,
            height,
            planes: rt_format.plane_layout(width, height),
        }
    }

    /// Expected size of the given memory plane
    pub fn plane_size(&self, plane: usize) -> Option<usize> {
        self.planes.get(plane).map(|p| p.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_round_trip() {
        for pf in [
            PixelFormat::H264Slice,
            PixelFormat::HevcSlice,
            PixelFormat::Vp8Frame,
            PixelFormat::Vp9Frame,
            PixelFormat::Av1Frame,
            PixelFormat::Mpeg2Slice,
        ] {
            assert_eq!(PixelFormat::from_fourcc(pf.fourcc()), Some(pf));
        }
        assert_eq!(PixelFormat::from_fourcc(0), None);
    }

    #[test]
    fn test_nv12_layout() {
        let planes = RtFormat::Nv12.plane_layout(1920, 1080);
        assert_eq!(planes.len(), 1);
        assert_eq!(planes[0].stride, 1920);
        assert_eq!(planes[0].size, 1920 * 1080 * 3 / 2);
    }

    #[test]
    fn test_nv12m_layout() {
        let planes = RtFormat::Nv12Mplane.plane_layout(1920, 1080);
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0].size, 1920 * 1080);
        assert_eq!(planes[1].size, 1920 * 540);
    }

    #[test]
    fn test_yuv420m_layout() {
        let planes = RtFormat::Yuv420Mplane.plane_layout(1280, 720);
        assert_eq!(planes.len(), 3);
        assert_eq!(planes[0].stride, 1280);
        assert_eq!(planes[1].stride, 640);
        assert_eq!(planes[1].size, 640 * 360);
        assert_eq!(
            RtFormat::Yuv420Mplane.frame_size(1280, 720),
            1280 * 720 * 3 / 2
        );
    }

    #[test]
    fn test_p010_layout() {
        let planes = RtFormat::P010.plane_layout(1920, 1080);
        assert_eq!(planes[0].stride, 3840);
        assert_eq!(planes[0].size, 1920 * 1080 * 3);
    }

    #[test]
    fn test_dst_format_plane_size() {
        let fmt = DstFormat::new(RtFormat::Nv12Mplane, 1920, 1080);
        assert_eq!(fmt.plane_size(0), Some(1920 * 1080));
        assert_eq!(fmt.plane_size(1), Some(1920 * 540));
        assert_eq!(fmt.plane_size(2), None);
    }
}
