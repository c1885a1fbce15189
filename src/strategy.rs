//! Compositing strategies, tried in order until one produces a PDF.
//!
//! The vector strategies come first: they leave the template's content
//! streams and optional content groups untouched and only slip an artwork
//! page underneath. The raster strategies are the last resort and flatten
//! the first page into an image.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::tools::{Invocation, Tool, ToolPaths};

/// PDF user space units per inch.
const POINTS_PER_INCH: f64 = 72.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// ImageMagick builds an artwork page, qpdf underlays it.
    QpdfUnderlay,
    /// ImageMagick builds an artwork page, pdftk uses it as a background.
    PdftkBackground,
    /// Ghostscript rasterizes the template, ImageMagick composites.
    GhostscriptRaster,
    /// ImageMagick reads the template and composites in one pass.
    #[serde(rename = "imagemagick_direct")]
    ImageMagickDirect,
}

impl Strategy {
    /// Default cascade order.
    pub const CASCADE: [Strategy; 4] = [
        Strategy::QpdfUnderlay,
        Strategy::PdftkBackground,
        Strategy::GhostscriptRaster,
        Strategy::ImageMagickDirect,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::QpdfUnderlay => "qpdf_underlay",
            Strategy::PdftkBackground => "pdftk_background",
            Strategy::GhostscriptRaster => "ghostscript_raster",
            Strategy::ImageMagickDirect => "imagemagick_direct",
        }
    }

    /// Whether the template stays vector (and keeps its layers).
    pub fn preserves_vector(self) -> bool {
        matches!(self, Strategy::QpdfUnderlay | Strategy::PdftkBackground)
    }

    /// Tools the strategy needs. `ImageMagick` is satisfied by either binary.
    ///
    /// The raster strategies also run qpdf to put pages 2 onward back when
    /// the template has more than one page.
    pub fn required_tools(self) -> &'static [Tool] {
        match self {
            Strategy::QpdfUnderlay => &[Tool::ImageMagick, Tool::Qpdf],
            Strategy::PdftkBackground => &[Tool::ImageMagick, Tool::Pdftk],
            Strategy::GhostscriptRaster => &[Tool::Ghostscript, Tool::ImageMagick],
            // ImageMagick delegates PDF reading to Ghostscript.
            Strategy::ImageMagickDirect => &[Tool::ImageMagick, Tool::Ghostscript],
        }
    }

    /// Builds the ordered tool invocations for this strategy.
    pub fn plan(self, ctx: &PlanContext<'_>) -> Vec<Invocation> {
        match self {
            Strategy::QpdfUnderlay => {
                let page = ctx.scratch("artwork-page.pdf");
                vec![
                    ctx.artwork_page(&page, false),
                    ctx.invocation(Tool::Qpdf)
                        .arg(ctx.template)
                        .arg("--underlay")
                        .arg(&page)
                        .arg("--to=1")
                        .arg("--")
                        .arg(ctx.output),
                ]
            }
            Strategy::PdftkBackground => {
                let page = ctx.scratch("artwork-page.pdf");
                vec![
                    ctx.artwork_page(&page, true),
                    // multibackground repeats its last page over any remaining
                    // template pages, so the background is padded with blanks.
                    ctx.invocation(Tool::Pdftk)
                        .arg(ctx.template)
                        .arg("multibackground")
                        .arg(&page)
                        .arg("output")
                        .arg(ctx.output),
                ]
            }
            Strategy::GhostscriptRaster => {
                let raster = ctx.scratch("template.png");
                let first_page = ctx.first_page_target();
                let (w, h) = ctx.page.pixels(ctx.dpi);
                let mut plan = vec![
                    ctx.invocation(Tool::Ghostscript)
                        .arg("-q")
                        .arg("-dSAFER")
                        .arg("-dBATCH")
                        .arg("-dNOPAUSE")
                        .arg("-sDEVICE=pngalpha")
                        .arg(format!("-r{}", ctx.dpi))
                        .arg("-dFirstPage=1")
                        .arg("-dLastPage=1")
                        .joined_arg("-sOutputFile=", &raster)
                        .arg(ctx.template),
                    ctx.invocation(Tool::ImageMagick)
                        .arg("(")
                        .arg(first_frame(ctx.artwork))
                        .arg("-resize")
                        .arg(exact_geometry(w, h))
                        .arg(")")
                        .arg("(")
                        .arg(&raster)
                        .arg("-resize")
                        .arg(exact_geometry(w, h))
                        .arg(")")
                        .arg("-composite")
                        .arg("-units")
                        .arg("PixelsPerInch")
                        .arg("-density")
                        .arg(ctx.dpi.to_string())
                        .arg(&first_page),
                ];
                plan.extend(ctx.reattach_pages(&first_page));
                plan
            }
            Strategy::ImageMagickDirect => {
                let first_page = ctx.first_page_target();
                let (w, h) = ctx.page.pixels(ctx.dpi);
                let mut plan = vec![ctx
                    .invocation(Tool::ImageMagick)
                    .arg("(")
                    .arg(first_frame(ctx.artwork))
                    .arg("-resize")
                    .arg(exact_geometry(w, h))
                    .arg(")")
                    .arg("(")
                    .arg("-density")
                    .arg(ctx.dpi.to_string())
                    .arg("-background")
                    .arg("none")
                    .arg(first_frame(ctx.template))
                    .arg("-resize")
                    .arg(exact_geometry(w, h))
                    .arg(")")
                    .arg("-composite")
                    .arg("-units")
                    .arg("PixelsPerInch")
                    .arg("-density")
                    .arg(ctx.dpi.to_string())
                    .arg(&first_page)];
                plan.extend(ctx.reattach_pages(&first_page));
                plan
            }
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Strategy::CASCADE
            .into_iter()
            .find(|strategy| strategy.as_str() == wanted)
            .ok_or_else(|| UnknownStrategy(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown strategy '{0}' (expected one of: qpdf_underlay, pdftk_background, ghostscript_raster, imagemagick_direct)")]
pub struct UnknownStrategy(pub String);

/// Template page dimensions in PDF points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width_pt: f64,
    pub height_pt: f64,
}

impl PageSize {
    pub fn new(width_pt: f64, height_pt: f64) -> Self {
        Self {
            width_pt,
            height_pt,
        }
    }

    /// The page as displayed under a `/Rotate` of `degrees`.
    pub fn rotated(self, degrees: i64) -> Self {
        if (degrees.rem_euclid(360) / 90) % 2 == 1 {
            Self::new(self.height_pt, self.width_pt)
        } else {
            self
        }
    }

    /// Pixel dimensions of the page rendered at `dpi`.
    pub fn pixels(&self, dpi: u32) -> (u32, u32) {
        let scale = f64::from(dpi) / POINTS_PER_INCH;
        let px = |pt: f64| ((pt * scale).round() as u32).max(1);
        (px(self.width_pt), px(self.height_pt))
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}x{:.2}pt", self.width_pt, self.height_pt)
    }
}

/// Inputs shared by every strategy's plan.
#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    pub paths: &'a ToolPaths,
    pub timeout: Duration,
    pub template: &'a Path,
    pub artwork: &'a Path,
    pub output: &'a Path,
    /// Private scratch directory for intermediate files.
    pub scratch_dir: &'a Path,
    pub page: PageSize,
    /// Pages in the template. Only the first receives the artwork.
    pub page_count: u32,
    pub dpi: u32,
}

impl PlanContext<'_> {
    fn invocation(&self, tool: Tool) -> Invocation {
        Invocation::new(tool, self.paths.program(tool), self.timeout)
    }

    fn scratch(&self, name: &str) -> PathBuf {
        self.scratch_dir.join(name)
    }

    /// PDF holding the artwork stretched to the template page size. With
    /// `pad`, one transparent page follows for every other template page.
    fn artwork_page(&self, page_path: &Path, pad: bool) -> Invocation {
        let (w, h) = self.page.pixels(self.dpi);
        let mut invocation = self
            .invocation(Tool::ImageMagick)
            .arg(first_frame(self.artwork))
            .arg("-resize")
            .arg(exact_geometry(w, h));

        if pad && self.page_count > 1 {
            invocation = invocation
                .arg("(")
                .arg("-size")
                .arg(format!("{}x{}", w, h))
                .arg("xc:none");
            if self.page_count > 2 {
                invocation = invocation
                    .arg("-duplicate")
                    .arg((self.page_count - 2).to_string());
            }
            invocation = invocation.arg(")");
        }

        invocation
            .arg("-units")
            .arg("PixelsPerInch")
            .arg("-density")
            .arg(self.dpi.to_string())
            .arg(page_path)
    }

    /// Where the raster strategies write the composited first page.
    fn first_page_target(&self) -> PathBuf {
        if self.page_count > 1 {
            self.scratch("first-page.pdf")
        } else {
            self.output.to_path_buf()
        }
    }

    /// Rebuilds the full document from the composited first page and the
    /// template's remaining pages. Nothing to do for one-page templates.
    fn reattach_pages(&self, first_page: &Path) -> Option<Invocation> {
        (self.page_count > 1).then(|| {
            self.invocation(Tool::Qpdf)
                .arg(self.template)
                .arg("--pages")
                .arg(first_page)
                .arg("1")
                .arg(self.template)
                .arg("2-z")
                .arg("--")
                .arg(self.output)
        })
    }
}

/// ImageMagick geometry that ignores aspect ratio.
fn exact_geometry(width: u32, height: u32) -> String {
    format!("{}x{}!", width, height)
}

/// ImageMagick frame selector for the first page or frame of a file.
pub(crate) fn first_frame(path: &Path) -> std::ffi::OsString {
    let mut selected = path.as_os_str().to_os_string();
    selected.push("[0]");
    selected
}
