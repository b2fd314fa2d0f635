//! PDF ingestion: rasterise pages and crop embedded figures via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state; its bindings cannot
//! be driven from async contexts. `tokio::task::spawn_blocking` moves
//! the work onto the blocking thread pool so reactor threads never stall
//! during CPU-heavy rasterisation. Each call opens the document fresh;
//! pdfium handles are not `Send`, so nothing pdfium-owned crosses a task
//! boundary.
//!
//! ## Coordinate systems
//!
//! PDF coordinates are points (1/72 inch) with the origin at the
//! bottom-left. Everything downstream works in raster pixels with the
//! origin at the top-left, so figure bounds are flipped vertically and
//! scaled by `dpi / 72` here, once.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Pdf2HtmlError;

/// One embedded raster image cropped from a page.
#[derive(Debug, Clone)]
pub struct Figure {
    /// Stable, monotonically increasing index within the page.
    pub index: usize,
    /// `(x0, y0, x1, y1)` in page-raster pixels, origin top-left.
    pub bbox: (f32, f32, f32, f32),
    /// Re-encoded PNG bytes of the figure.
    pub image_bytes: Vec<u8>,
    pub mime_type: String,
    /// `data:<mime>;base64,…` form ready for an `<img src>` attribute.
    pub data_uri: String,
}

/// Everything the pipeline needs for one page, produced once.
#[derive(Debug, Clone)]
pub struct PageAssets {
    /// Zero-based page index.
    pub page_index: usize,
    pub width_px: u32,
    pub height_px: u32,
    /// Where the lossless page raster was persisted (`page_NNN.png`).
    pub page_image_path: PathBuf,
    /// Base64 PNG of the page raster, ready for model transport.
    pub page_image_b64: String,
    /// Figures in index order.
    pub figures: Vec<Figure>,
}

/// Opens a PDF and produces [`PageAssets`] per page. Pure I/O + pdfium:
/// no network, no model calls.
pub struct Ingestor {
    pdf_path: PathBuf,
    dpi: u32,
    output_dir: PathBuf,
}

impl Ingestor {
    /// Validate the input file and prepare the output directory.
    ///
    /// Checks existence and the `%PDF` magic bytes up front so callers get
    /// a meaningful error instead of a pdfium crash.
    pub fn new(
        pdf_path: impl Into<PathBuf>,
        dpi: u32,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, Pdf2HtmlError> {
        let pdf_path = pdf_path.into();
        if !pdf_path.exists() {
            return Err(Pdf2HtmlError::FileNotFound { path: pdf_path });
        }
        let mut magic = [0u8; 4];
        match std::fs::File::open(&pdf_path) {
            Ok(mut f) => {
                use std::io::Read;
                if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
                    return Err(Pdf2HtmlError::NotAPdf {
                        path: pdf_path,
                        magic,
                    });
                }
            }
            Err(_) => return Err(Pdf2HtmlError::FileNotFound { path: pdf_path }),
        }

        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir).map_err(|e| Pdf2HtmlError::OutputWriteFailed {
            path: output_dir.clone(),
            source: e,
        })?;

        Ok(Self {
            pdf_path,
            dpi,
            output_dir,
        })
    }

    /// Total number of pages in the document.
    pub async fn page_count(&self) -> Result<usize, Pdf2HtmlError> {
        let path = self.pdf_path.clone();
        tokio::task::spawn_blocking(move || {
            let pdfium = bind_pdfium()?;
            let document = open_document(&pdfium, &path)?;
            Ok(document.pages().len() as usize)
        })
        .await
        .map_err(|e| Pdf2HtmlError::Internal(format!("page count task panicked: {e}")))?
    }

    /// Rasterise one page and crop its embedded figures.
    pub async fn extract_page(&self, page_index: usize) -> Result<PageAssets, Pdf2HtmlError> {
        let path = self.pdf_path.clone();
        let dpi = self.dpi;
        let out_dir = self.output_dir.clone();
        tokio::task::spawn_blocking(move || extract_page_blocking(&path, page_index, dpi, &out_dir))
            .await
            .map_err(|e| Pdf2HtmlError::Internal(format!("ingest task panicked: {e}")))?
    }
}

/// Bind the pdfium library.
///
/// `PDFIUM_LIB_PATH` wins when set; otherwise the library is looked up
/// next to the executable and then system-wide.
pub fn bind_pdfium() -> Result<Pdfium, Pdf2HtmlError> {
    if let Ok(path) = std::env::var("PDFIUM_LIB_PATH") {
        match Pdfium::bind_to_library(&path) {
            Ok(bindings) => return Ok(Pdfium::new(bindings)),
            Err(e) => warn!("PDFIUM_LIB_PATH '{path}' did not bind ({e:?}); falling back to lookup"),
        }
    }
    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map(Pdfium::new)
        .map_err(|e| Pdf2HtmlError::PdfiumUnavailable {
            detail: format!("{e:?}"),
        })
}

fn open_document<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
) -> Result<PdfDocument<'a>, Pdf2HtmlError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| Pdf2HtmlError::CorruptPdf {
            path: path.to_path_buf(),
            detail: format!("{e:?}"),
        })
}

fn extract_page_blocking(
    pdf_path: &Path,
    page_index: usize,
    dpi: u32,
    output_dir: &Path,
) -> Result<PageAssets, Pdf2HtmlError> {
    let pdfium = bind_pdfium()?;
    let document = open_document(&pdfium, pdf_path)?;
    let pages = document.pages();
    let total = pages.len() as usize;
    if page_index >= total {
        return Err(Pdf2HtmlError::PageOutOfRange {
            page: page_index + 1,
            total,
        });
    }

    let page = pages
        .get(page_index as u16)
        .map_err(|e| Pdf2HtmlError::RasterisationFailed {
            page: page_index + 1,
            detail: format!("{e:?}"),
        })?;

    // PDF native resolution is 72 DPI.
    let zoom = dpi as f32 / 72.0;
    let render_config = PdfRenderConfig::new().scale_page_by_factor(zoom);

    let bitmap =
        page.render_with_config(&render_config)
            .map_err(|e| Pdf2HtmlError::RasterisationFailed {
                page: page_index + 1,
                detail: format!("{e:?}"),
            })?;
    let page_image = bitmap.as_image();
    let (width_px, height_px) = (page_image.width(), page_image.height());

    let png_bytes = encode_png(&page_image).map_err(|e| Pdf2HtmlError::RasterisationFailed {
        page: page_index + 1,
        detail: format!("PNG encoding failed: {e}"),
    })?;
    let page_image_path = output_dir.join(format!("page_{page_index:03}.png"));
    std::fs::write(&page_image_path, &png_bytes).map_err(|e| Pdf2HtmlError::OutputWriteFailed {
        path: page_image_path.clone(),
        source: e,
    })?;
    let page_image_b64 = STANDARD.encode(&png_bytes);

    let page_height_pts = page.height().value;
    let figures = extract_figures(&page, page_index, zoom, page_height_pts);

    info!(
        "page {}: {}x{} px, {} figures",
        page_index + 1,
        width_px,
        height_px,
        figures.len()
    );

    Ok(PageAssets {
        page_index,
        width_px,
        height_px,
        page_image_path,
        page_image_b64,
        figures,
    })
}

/// Crop every raster image object on the page.
///
/// A figure whose stream cannot be decoded is skipped with a warning; the
/// page still converts, the generator simply gets one placeholder fewer.
fn extract_figures(
    page: &PdfPage<'_>,
    page_index: usize,
    zoom: f32,
    page_height_pts: f32,
) -> Vec<Figure> {
    let mut figures = Vec::new();

    for object in page.objects().iter() {
        let Some(image_object) = object.as_image_object() else {
            continue;
        };

        let image = match image_object.get_raw_image() {
            Ok(img) => img,
            Err(e) => {
                warn!(
                    "page {}: skipping figure {} (undecodable image stream: {e:?})",
                    page_index + 1,
                    figures.len()
                );
                continue;
            }
        };

        let bbox = match image_object.bounds() {
            Ok(bounds) => {
                let x0 = bounds.left().value * zoom;
                let x1 = bounds.right().value * zoom;
                // PDF origin is bottom-left; raster origin is top-left.
                let y0 = (page_height_pts - bounds.top().value) * zoom;
                let y1 = (page_height_pts - bounds.bottom().value) * zoom;
                (x0, y0, x1, y1)
            }
            Err(e) => {
                warn!(
                    "page {}: skipping figure {} (no bounds: {e:?})",
                    page_index + 1,
                    figures.len()
                );
                continue;
            }
        };

        let image_bytes = match encode_png(&image) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "page {}: skipping figure {} (PNG encode failed: {e})",
                    page_index + 1,
                    figures.len()
                );
                continue;
            }
        };

        let index = figures.len();
        let data_uri = format!("data:image/png;base64,{}", STANDARD.encode(&image_bytes));
        debug!(
            "page {}: figure {} at ({:.0},{:.0})-({:.0},{:.0})",
            page_index + 1,
            index,
            bbox.0,
            bbox.1,
            bbox.2,
            bbox.3
        );

        figures.push(Figure {
            index,
            bbox,
            image_bytes,
            mime_type: "image/png".into(),
            data_uri,
        });
    }

    figures
}

/// Lossless PNG encoding; text crispness matters more than file size for
/// vision-model accuracy.
fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_file() {
        let err = Ingestor::new("/nonexistent/doc.pdf", 300, std::env::temp_dir());
        assert!(matches!(err, Err(Pdf2HtmlError::FileNotFound { .. })));
    }

    #[test]
    fn rejects_non_pdf_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.pdf");
        std::fs::write(&path, b"<html>not a pdf</html>").unwrap();
        let err = Ingestor::new(&path, 300, dir.path());
        assert!(matches!(err, Err(Pdf2HtmlError::NotAPdf { .. })));
    }

    #[test]
    fn encode_png_produces_decodable_bytes() {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            4,
            4,
            image::Rgba([255, 0, 0, 255]),
        ));
        let bytes = encode_png(&img).unwrap();
        assert!(image::load_from_memory(&bytes).is_ok());
    }
}
