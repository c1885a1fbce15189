//! Artwork-into-template compositing via an external tool cascade.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::layers::{self, LayerError, LayerReport};
use crate::strategy::{first_frame, PageSize, PlanContext, Strategy};
use crate::tools::{self, Invocation, Tool, ToolError, ToolOutput, ToolPaths, ToolRunner, ToolStatus};

/// A valid PDF carries its header within the first 1024 bytes.
pub const PDF_HEADER_WINDOW: usize = 1024;

/// qpdf exit status meaning "succeeded with warnings".
const QPDF_WARNING_EXIT: i32 = 3;

/// Ghostscript program printing the page count and the first page's
/// MediaBox and rotation, one labelled line each.
const PAGE_PROBE_PROGRAM: &str = "File (r) file runpdfbegin \
(pages: ) print pdfpagecount == \
1 pdfgetpage dup (mediabox: ) print /MediaBox pget pop == \
(rotate: ) print /Rotate pget { == } { 0 == } ifelse quit";

/// One composite run.
#[derive(Debug, Clone)]
pub struct CompositeRequest {
    pub template: PathBuf,
    pub artwork: PathBuf,
    pub output: PathBuf,
    pub layer_name: String,
    pub dpi: u32,
    /// Run only this strategy instead of the whole cascade.
    pub strategy: Option<Strategy>,
}

/// Result of trying one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyAttempt {
    pub strategy: Strategy,
    pub succeeded: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The template as a viewer shows it: first-page size with rotation
/// applied, and the number of pages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemplateGeometry {
    pub page: PageSize,
    pub page_count: u32,
}

/// What a successful composite produced.
#[derive(Debug, Clone)]
pub struct CompositeOutcome {
    pub strategy: Strategy,
    pub page_size: PageSize,
    pub page_count: u32,
    pub layers: Option<LayerReport>,
    pub attempts: Vec<StrategyAttempt>,
    pub output_bytes: u64,
}

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("could not determine template page size: {}", .reasons.join("; "))]
    PageSize { reasons: Vec<String> },

    #[error("all compositing strategies failed: {}", summarize(.attempts))]
    AllStrategiesFailed { attempts: Vec<StrategyAttempt> },

    #[error("layer inspection failed: {0}")]
    Layers(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CompositeError {
    pub fn attempts(&self) -> &[StrategyAttempt] {
        match self {
            CompositeError::AllStrategiesFailed { attempts } => attempts,
            _ => &[],
        }
    }
}

fn summarize(attempts: &[StrategyAttempt]) -> String {
    attempts
        .iter()
        .map(|a| {
            format!(
                "{} ({})",
                a.strategy,
                a.error.as_deref().unwrap_or("no error recorded")
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Drives the external tools for page probing, layer inspection and the
/// compositing cascade.
///
/// All methods block on child processes; async callers should run them on
/// the blocking pool.
pub struct Compositor {
    runner: Arc<dyn ToolRunner>,
    paths: ToolPaths,
    timeout: Duration,
    scratch_root: PathBuf,
}

impl Compositor {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        paths: ToolPaths,
        timeout: Duration,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            paths,
            timeout,
            scratch_root: scratch_root.into(),
        }
    }

    pub fn paths(&self) -> &ToolPaths {
        &self.paths
    }

    /// Composites the artwork under the template's first page.
    ///
    /// Strategies run in cascade order until one writes a file that looks
    /// like a PDF. A strategy's failure is recorded and the next one is tried.
    ///
    /// # Errors
    ///
    /// - `PageSize` when neither Ghostscript nor ImageMagick can measure page 1
    /// - `AllStrategiesFailed` when no strategy produced a PDF
    pub fn composite(&self, request: &CompositeRequest) -> Result<CompositeOutcome, CompositeError> {
        info!(
            template = %request.template.display(),
            artwork = %request.artwork.display(),
            layer = %request.layer_name,
            dpi = request.dpi,
            "Starting composite"
        );

        let geometry = self.measure(&request.template)?;
        info!(
            page_size = %geometry.page,
            page_count = geometry.page_count,
            "Template measured"
        );

        let layers = match self.inspect_layers(&request.template, &request.layer_name) {
            Ok(report) => {
                if report.target_found {
                    info!(layer = %report.target, count = report.layers.len(), "Target layer present in template");
                } else {
                    warn!(
                        layer = %report.target,
                        count = report.layers.len(),
                        "Target layer not found; artwork will be placed without a layer"
                    );
                }
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "Layer inspection unavailable");
                None
            }
        };

        let strategies: Vec<Strategy> = match request.strategy {
            Some(forced) => vec![forced],
            None => Strategy::CASCADE.to_vec(),
        };

        let mut attempts = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let started = Instant::now();
            let result = self.attempt(strategy, request, geometry);
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(output_bytes) => {
                    attempts.push(StrategyAttempt {
                        strategy,
                        succeeded: true,
                        duration_ms,
                        error: None,
                    });
                    info!(
                        strategy = %strategy,
                        duration_ms,
                        output_bytes,
                        "Composite complete"
                    );
                    return Ok(CompositeOutcome {
                        strategy,
                        page_size: geometry.page,
                        page_count: geometry.page_count,
                        layers,
                        attempts,
                        output_bytes,
                    });
                }
                Err(error) => {
                    warn!(strategy = %strategy, duration_ms, error = %error, "Strategy failed, falling back");
                    attempts.push(StrategyAttempt {
                        strategy,
                        succeeded: false,
                        duration_ms,
                        error: Some(error),
                    });
                }
            }
        }

        Err(CompositeError::AllStrategiesFailed { attempts })
    }

    /// Runs one strategy in its own scratch directory and returns the
    /// output size on success.
    fn attempt(
        &self,
        strategy: Strategy,
        request: &CompositeRequest,
        geometry: TemplateGeometry,
    ) -> Result<u64, String> {
        let scratch = tempfile::Builder::new()
            .prefix("strategy-")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| format!("scratch directory: {}", e))?;

        match std::fs::remove_file(&request.output) {
            Ok(()) => debug!(output = %request.output.display(), "Removed stale output"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(format!("could not clear output: {}", e)),
        }

        let ctx = PlanContext {
            paths: &self.paths,
            timeout: self.timeout,
            template: &request.template,
            artwork: &request.artwork,
            output: &request.output,
            scratch_dir: scratch.path(),
            page: geometry.page,
            page_count: geometry.page_count,
            dpi: request.dpi,
        };

        for invocation in strategy.plan(&ctx) {
            self.run_step(&invocation).map_err(|e| e.to_string())?;
        }

        verify_pdf(&request.output)
    }

    /// Runs one invocation, absorbing the tool quirks the cascade tolerates:
    /// ImageMagick 6 installs only `convert`, and qpdf exits 3 on warnings.
    fn run_step(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError> {
        match self.runner.run(invocation) {
            Err(e) if e.is_not_found() && invocation.tool == Tool::ImageMagick => {
                info!(
                    program = %invocation.program,
                    fallback = %self.paths.convert,
                    "ImageMagick 7 not found, retrying with legacy binary"
                );
                let legacy = invocation.retarget(Tool::ImageMagickLegacy, self.paths.convert.clone());
                self.runner.run(&legacy)
            }
            Err(ToolError::Failed {
                tool: Tool::Qpdf,
                code: Some(QPDF_WARNING_EXIT),
                stderr,
            }) => {
                warn!(stderr = %stderr, "qpdf finished with warnings");
                Ok(ToolOutput {
                    stderr,
                    ..ToolOutput::default()
                })
            }
            other => other,
        }
    }

    /// Measures the template: first-page size in points and page count.
    ///
    /// Ghostscript reads the MediaBox, `/Rotate` and page count directly.
    /// If that fails ImageMagick renders the page at 72 DPI (already rotated)
    /// and qpdf counts the pages.
    pub fn measure(&self, template: &Path) -> Result<TemplateGeometry, CompositeError> {
        let mut reasons = Vec::new();

        let gs = Invocation::new(Tool::Ghostscript, self.paths.program(Tool::Ghostscript), self.timeout)
            .arg("-q")
            .arg("-dNODISPLAY")
            .arg("-dSAFER")
            .arg("-dBATCH")
            .arg("-dNOPAUSE")
            .joined_arg("--permit-file-read=", template)
            .joined_arg("-sFile=", template)
            .arg("-c")
            .arg(PAGE_PROBE_PROGRAM);

        match self.run_step(&gs) {
            Ok(output) => match parse_page_probe(&output.stdout) {
                Some(geometry) => return Ok(geometry),
                None => reasons.push(format!("ghostscript printed no MediaBox: {}", output.stdout.trim())),
            },
            Err(e) => reasons.push(e.to_string()),
        }

        let magick = Invocation::new(Tool::ImageMagick, self.paths.program(Tool::ImageMagick), self.timeout)
            .arg("-density")
            .arg("72")
            .arg(first_frame(template))
            .arg("-format")
            .arg("%w %h")
            .arg("info:");

        match self.run_step(&magick) {
            Ok(output) => match parse_dimensions(&output.stdout) {
                Some(page) => {
                    return Ok(TemplateGeometry {
                        page,
                        page_count: self.count_pages(template),
                    })
                }
                None => reasons.push(format!("imagemagick printed no size: {}", output.stdout.trim())),
            },
            Err(e) => reasons.push(e.to_string()),
        }

        Err(CompositeError::PageSize { reasons })
    }

    /// Page count from qpdf, or 1 when qpdf cannot tell.
    fn count_pages(&self, template: &Path) -> u32 {
        let qpdf = Invocation::new(Tool::Qpdf, self.paths.program(Tool::Qpdf), self.timeout)
            .arg("--show-npages")
            .arg(template);

        let counted = self
            .run_step(&qpdf)
            .map_err(|e| e.to_string())
            .and_then(|output| {
                output
                    .stdout
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| format!("unexpected page count '{}': {}", output.stdout.trim(), e))
            });

        match counted {
            Ok(count) => count.max(1),
            Err(e) => {
                warn!(error = %e, "Could not count template pages, assuming one");
                1
            }
        }
    }

    /// Lists the template's optional content groups and looks up `target`.
    pub fn inspect_layers(&self, template: &Path, target: &str) -> Result<LayerReport, CompositeError> {
        let mut last_error = None;

        for invocation in layers::dump_invocations(&self.paths, template, self.timeout) {
            let parsed = self
                .run_step(&invocation)
                .map_err(|e| e.to_string())
                .and_then(|output| layers::parse_qpdf_json(&output.stdout).map_err(|e: LayerError| e.to_string()));

            match parsed {
                Ok(found) => return Ok(LayerReport::new(found, target)),
                Err(e) => {
                    debug!(error = %e, "qpdf layer dump attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(CompositeError::Layers(
            last_error.unwrap_or_else(|| "no layer dump attempted".to_string()),
        ))
    }

    /// Reports which external tools are usable on this host.
    pub fn tool_status(&self) -> Vec<ToolStatus> {
        tools::probe_all(self.runner.as_ref(), &self.paths, self.timeout)
    }
}

/// Strategies whose tools are all available. ImageMagick counts as
/// available when either its current or legacy binary is.
pub fn runnable_strategies(statuses: &[ToolStatus]) -> Vec<Strategy> {
    let available = |tool: Tool| {
        statuses.iter().any(|s| {
            s.available
                && (s.tool == tool || (tool == Tool::ImageMagick && s.tool == Tool::ImageMagickLegacy))
        })
    };

    Strategy::CASCADE
        .into_iter()
        .filter(|strategy| strategy.required_tools().iter().all(|&tool| available(tool)))
        .collect()
}

/// Checks that `path` is a non-empty file with a PDF header.
pub fn verify_pdf(path: &Path) -> Result<u64, String> {
    let mut file = File::open(path).map_err(|e| format!("no output written: {}", e))?;
    let size = file
        .metadata()
        .map_err(|e| format!("output unreadable: {}", e))?
        .len();
    if size == 0 {
        return Err("output is empty".to_string());
    }

    let mut head = Vec::with_capacity(PDF_HEADER_WINDOW);
    file.by_ref()
        .take(PDF_HEADER_WINDOW as u64)
        .read_to_end(&mut head)
        .map_err(|e| format!("output unreadable: {}", e))?;

    if !has_pdf_header(&head) {
        return Err("output is not a PDF".to_string());
    }
    Ok(size)
}

/// Whether `%PDF-` appears within the header window.
pub fn has_pdf_header(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(PDF_HEADER_WINDOW)];
    window.windows(5).any(|w| w == b"%PDF-")
}

/// Parses the labelled output of the Ghostscript page probe.
///
/// Only the MediaBox is required; a missing page count means one page and a
/// missing rotation means none.
pub fn parse_page_probe(stdout: &str) -> Option<TemplateGeometry> {
    let mut page = None;
    let mut page_count = 1;
    let mut rotate = 0;

    for line in stdout.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("pages:") {
            if let Ok(count) = value.trim().parse::<u32>() {
                page_count = count.max(1);
            }
        } else if let Some(value) = line.strip_prefix("rotate:") {
            rotate = value.trim().parse::<i64>().unwrap_or(0);
        } else if page.is_none() {
            if let Some(start) = line.find('[') {
                page = parse_mediabox(&line[start..]);
            }
        }
    }

    Some(TemplateGeometry {
        page: page?.rotated(rotate),
        page_count,
    })
}

/// Parses Ghostscript's `[llx lly urx ury]` MediaBox print.
pub fn parse_mediabox(stdout: &str) -> Option<PageSize> {
    let line = stdout.lines().map(str::trim).find(|l| l.starts_with('['))?;
    let inner = line.trim_start_matches('[').trim_end_matches(']');
    let numbers: Vec<f64> = inner
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if numbers.len() != 4 {
        return None;
    }
    let width = (numbers[2] - numbers[0]).abs();
    let height = (numbers[3] - numbers[1]).abs();
    positive(width, height)
}

/// Parses ImageMagick's `%w %h` output.
pub fn parse_dimensions(stdout: &str) -> Option<PageSize> {
    let mut parts = stdout.split_whitespace();
    let width: f64 = parts.next()?.parse().ok()?;
    let height: f64 = parts.next()?.parse().ok()?;
    positive(width, height)
}

fn positive(width: f64, height: f64) -> Option<PageSize> {
    (width > 0.0 && height > 0.0 && width.is_finite() && height.is_finite())
        .then(|| PageSize::new(width, height))
}
