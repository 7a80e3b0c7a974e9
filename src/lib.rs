//! # Frame Relay
//!
//! Local capture relay: a browser (or any HTTP client) posts captured
//! frames one request at a time, and the relay pipes them into an external
//! encoder, producing one video file per recording.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      frame-relay                         │
//! │  ┌──────────────────┐     ┌────────────────────────────┐ │
//! │  │ listener         │────►│ web (axum)                 │ │
//! │  │ first free port  │     │ framing checks, CORS       │ │
//! │  └──────────────────┘     └─────┬──────────────┬───────┘ │
//! │                  control (JSON) │              │ frames  │
//! │                                 ▼              ▼         │
//! │  ┌─────────────────────────────────────────────────────┐ │
//! │  │ SessionController                                   │ │
//! │  │  Idle | Recording { EncoderAdapter }                │ │
//! │  └───────────────────────────┬─────────────────────────┘ │
//! │                              │ stdin pipe (raw RGBA)     │
//! └──────────────────────────────┼───────────────────────────┘
//!                                ▼
//!                         ffmpeg ──► capture-XXXX.mkv
//! ```
//!
//! ## Key Components
//!
//! - [`session::SessionController`] - the one recording session
//! - [`encoder::EncoderAdapter`] - one encoder subprocess and its pipe
//! - [`frame::FramePayload`] - image or raw request bodies to RGBA frames
//! - [`web::Web`] - HTTP routing
//! - [`listener::bind_first_available`] - port bootstrap
//!
//! ## Command-Line Interface
//!
//! See [`Cli`]. Key options:
//!
//! - `-p, --port` - candidate ports, tried in order (default: 8020-8024)
//! - `--ffmpeg-executable` - encoder binary, looked up on `PATH`
//! - `-o, --output-dir` - where finished recordings go
//! - `-v` - increase verbosity (use multiple times)

use clap::Parser;
use miette::Diagnostic;
use std::{
    io,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;

pub mod encoder;
pub mod frame;
pub mod listener;
pub mod session;
pub mod web;

use encoder::{EncoderSettings, Ffmpeg};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the HTTP control protocol, reported by `ping`
pub const PROTOCOL_VERSION: u32 = 1;

pub const DEFAULT_PORTS: [u16; 5] = [8020, 8021, 8022, 8023, 8024];

pub const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Cannot find encoder '{path}'")]
    #[diagnostic(help("install ffmpeg and add it to PATH, or pass --ffmpeg-executable"))]
    EncoderNotFound {
        path: PathBuf,
        #[source]
        source: which::Error,
    },
    #[error("Cannot create output directory '{path}'")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Ports to try for the web server, first free one wins
    #[arg(short, long = "port", value_name = "PORT", num_args = 1.., default_values_t = DEFAULT_PORTS)]
    pub ports: Vec<u16>,

    /// Address to listen on
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub address: IpAddr,

    /// Location of the ffmpeg executable, searched on PATH if not a path
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg_executable: PathBuf,

    /// Directory for finished recordings (default: system temp directory)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Largest request body accepted, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Seconds to wait for requests and the encoder when stopping
    #[arg(long, default_value_t = 30)]
    pub shutdown_timeout: u64,
}

impl Cli {
    /// Resolve the encoder and output directory.
    pub fn encoder_settings(&self) -> Result<EncoderSettings, ConfigError> {
        let executable =
            which::which(&self.ffmpeg_executable).map_err(|source| ConfigError::EncoderNotFound {
                path: self.ffmpeg_executable.clone(),
                source,
            })?;
        log::info!("Using encoder {}", executable.display());

        if let Some(dir) = &self.output_dir {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::OutputDir {
                path: dir.clone(),
                source,
            })?;
        }

        Ok(EncoderSettings {
            command: Arc::new(Ffmpeg::new(executable)),
            output_dir: self.output_dir.clone(),
        })
    }
}
