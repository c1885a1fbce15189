//! PrintPilot PDF Compositor Library
//!
//! Places customer artwork underneath a print template PDF by driving
//! external tools (qpdf, pdftk, Ghostscript, ImageMagick). Each strategy is
//! tried in turn until one yields a valid PDF.
//!
//! ## Module Overview
//!
//! - `compositor`: page probing, layer inspection and the strategy cascade
//! - `strategy`: the compositing strategies and their tool invocations
//! - `tools`: external process execution and tool availability probes
//! - `layers`: optional content group listing from qpdf JSON
//! - `validation`: upload and parameter checks
//! - `job`, `store`: job records kept in memory or Redis
//! - `server`, `error`: the HTTP API
//! - `telemetry`: logging and OpenTelemetry setup
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use pdf_compositor::{
//!     compositor::{CompositeRequest, Compositor},
//!     tools::{ProcessRunner, ToolPaths},
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let compositor = Compositor::new(
//!     Arc::new(ProcessRunner::new()),
//!     ToolPaths::default(),
//!     Duration::from_secs(120),
//!     std::env::temp_dir(),
//! );
//!
//! let outcome = compositor.composite(&CompositeRequest {
//!     template: "mug-template.pdf".into(),
//!     artwork: "artwork.png".into(),
//!     output: "mug-print.pdf".into(),
//!     layer_name: "ARTWORK HERE".to_string(),
//!     dpi: 300,
//!     strategy: None,
//! });
//! assert!(outcome.is_ok());
//! ```

pub mod compositor;
pub mod config;
pub mod error;
pub mod job;
pub mod layers;
pub mod server;
pub mod store;
pub mod strategy;
pub mod telemetry;
pub mod tools;
pub mod validation;
