//! vidreq-probe - inspect a request-based stateless decode device
//!
//! # Usage
//!
//! ```bash
//! # Probe a real decoder
//! vidreq-probe /dev/video19 /dev/media0
//!
//! # Probe the built-in emulated device
//! vidreq-probe --emulated
//!
//! # JSON output
//! vidreq-probe --emulated --format json
//! ```

use clap::{Parser, ValueEnum};
use std::process;
use std::sync::Arc;
use vidreq_lib::device::ctrl;
use vidreq_lib::{DecodeDevice, QueryExtControl, SoftwareDevice};

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable text output (default)
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "vidreq-probe")]
#[command(about = "Probe a stateless decode device's formats and controls", long_about = None)]
#[command(version)]
struct Args {
    /// Video device node (e.g. /dev/video19)
    #[arg(value_name = "VIDEO", required_unless_present = "emulated")]
    video: Option<String>,

    /// Media device node (e.g. /dev/media0)
    #[arg(value_name = "MEDIA", required_unless_present = "emulated")]
    media: Option<String>,

    /// Probe the built-in emulated device instead of real hardware
    #[arg(short, long)]
    emulated: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Control ids worth probing on a stateless decoder
const PROBE_CTRLS: &[u32] = &[
    ctrl::H264_DECODE_MODE,
    ctrl::H264_START_CODE,
    ctrl::H264_SPS,
    ctrl::H264_PPS,
    ctrl::H264_SCALING_MATRIX,
    ctrl::H264_SLICE_PARAMS,
    ctrl::H264_DECODE_PARAMS,
    ctrl::VP8_FRAME,
    ctrl::MPEG2_SEQUENCE,
    ctrl::MPEG2_PICTURE,
];

fn open_device(args: &Args) -> vidreq_lib::Result<Arc<dyn DecodeDevice>> {
    if args.emulated {
        return Ok(Arc::new(SoftwareDevice::new()?));
    }
    let video = args.video.clone().expect("clap enforces VIDEO");
    let media = args.media.clone().expect("clap enforces MEDIA");
    open_real(&video, &media)
}

fn open_real(video: &str, media: &str) -> vidreq_lib::Result<Arc<dyn DecodeDevice>> {
    #[cfg(feature = "v4l2")]
    {
        Ok(Arc::new(vidreq_lib::V4l2Device::open(video, media)?))
    }
    #[cfg(not(feature = "v4l2"))]
    {
        let _ = (video, media);
        Err(vidreq_lib::Error::unsupported_buffer(
            "built without the v4l2 feature; only --emulated is available",
        ))
    }
}

fn main() {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let device = match open_device(&args) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error: failed to open device: {}", e);
            process::exit(1);
        }
    };

    let src_formats = device.enum_src_formats().unwrap_or_default();
    let dst_formats = device.enum_dst_formats().unwrap_or_default();

    let mut controls = Vec::new();
    for &id in PROBE_CTRLS {
        let mut q = [QueryExtControl::new(id)];
        if device.query_ext_ctrls(&mut q).is_ok() {
            controls.push(q[0].clone());
        }
    }

    match args.format {
        OutputFormat::Text => {
            println!("Driver: {}", device.driver());
            println!("Coded formats:");
            for f in &src_formats {
                println!("  {} ({:#010x})", f, f.fourcc());
            }
            println!("Raw formats:");
            for f in &dst_formats {
                println!("  {} ({:#010x})", f, f.fourcc());
            }
            println!("Decode controls:");
            for c in &controls {
                println!("  {:#010x}  {}  ({} bytes)", c.id, c.name, c.elem_size);
            }
        }
        OutputFormat::Json => {
            let doc = serde_json::json!({
                "driver": device.driver(),
                "coded_formats": src_formats,
                "raw_formats": dst_formats,
                "controls": controls
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "id": c.id,
                            "name": c.name,
                            "elem_size": c.elem_size,
                        })
                    })
                    .collect::<Vec<_>>(),
            });
            match serde_json::to_string_pretty(&doc) {
                Ok(s) => println!("{}", s),
                Err(e) => {
                    eprintln!("Error: JSON encoding failed: {}", e);
                    process::exit(1);
                }
            }
        }
    }
}
