//! Document orchestration: the per-page refinement loop.
//!
//! ## The state machine
//!
//! ```text
//!   START → GENERATE → RENDER → JUDGE → DECIDE
//!                                        ├── accept  → COMMIT → END
//!                                        └── refine  → GENERATE (N+1)
//!
//!   Any stage may fail → record a zero-signal iteration → DECIDE
//! ```
//!
//! The cycle is explicit state, not control flow: every iteration persists
//! its HTML, raster, and feedback before the decision step runs, so a
//! crash or cancellation leaves a readable trail and a re-run can skip
//! completed pages. Acceptance requires the composite to meet the target
//! *and* the verification gate (when enabled) to agree; a page that never
//! gets there is promoted best-effort — highest score wins, latest
//! iteration breaks ties — with `success = false`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::analysis::{analyze_document, build_prompt_addendum, DocumentAnalysis};
use crate::config::{ConversionConfig, PageSelection};
use crate::error::{IterationError, Pdf2HtmlError};
use crate::output::{ConversionOutcome, ConversionSummary, IterationRecord, PageResult};
use crate::pipeline::generate;
use crate::pipeline::ingest::{Ingestor, PageAssets};
use crate::pipeline::judge::JudgeFeedback;
use crate::pipeline::multi_judge::MultiJudge;
use crate::pipeline::render::{ChromiumRenderer, Renderer};
use crate::provider::{self, VisionModel};

/// Convert a PDF document to per-page HTML.
///
/// This is the primary entry point. Returns `Ok` even when some pages end
/// best-effort (check [`ConversionOutcome::all_passed`]); only input,
/// credential, config, and output-write problems are `Err`.
pub async fn convert(
    pdf_path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionOutcome, Pdf2HtmlError> {
    let start = Instant::now();
    let pdf_path = pdf_path.as_ref();
    let stem = pdf_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let document_dir = config.output_dir.join(&stem);
    info!("converting {} → {}", pdf_path.display(), document_dir.display());

    let ingestor = Ingestor::new(pdf_path, config.dpi, &document_dir)?;
    let total_pages = ingestor.page_count().await?;
    let indices = config.pages.to_indices(total_pages);
    if indices.is_empty() {
        let first_requested = match &config.pages {
            PageSelection::Single(page) => *page,
            PageSelection::Range(first, _) => *first,
            PageSelection::Set(pages) => pages.iter().copied().min().unwrap_or(1),
            PageSelection::All => 1,
        };
        return Err(Pdf2HtmlError::PageOutOfRange {
            page: first_requested,
            total: total_pages,
        });
    }
    debug!("selected {} of {} pages", indices.len(), total_pages);

    // Idempotence: pages whose directory already holds a final.html are
    // skipped outright unless forced, leaving their file set untouched.
    let mut skipped = Vec::new();
    let mut to_process = Vec::new();
    for &idx in &indices {
        let done = page_dir(&document_dir, idx).join("final.html").exists();
        if done && !config.force {
            skipped.push(idx);
        } else {
            to_process.push(idx);
        }
    }

    if let Some(ref hook) = config.progress {
        hook.on_document_start(indices.len());
    }
    for &idx in &skipped {
        info!("page {}: final.html exists, skipping (use force to redo)", idx + 1);
        if let Some(ref hook) = config.progress {
            hook.on_page_skipped(idx + 1, indices.len());
        }
    }

    if to_process.is_empty() {
        if let Some(ref hook) = config.progress {
            hook.on_document_complete(0, 0);
        }
        let analysis = load_persisted_analysis(&document_dir).unwrap_or_default();
        return Ok(ConversionOutcome {
            document_dir,
            analysis,
            pages: Vec::new(),
            summary: ConversionSummary {
                total_pages,
                skipped_pages: skipped.len(),
                total_duration_ms: start.elapsed().as_millis() as u64,
                ..ConversionSummary::default()
            },
        });
    }

    // Rasterise every requested page up front; the analyzer samples from
    // the same assets the loop consumes.
    let mut assets = Vec::with_capacity(to_process.len());
    for &idx in &to_process {
        assets.push(ingestor.extract_page(idx).await?);
    }

    // Resolve models: pre-built overrides first, then the environment.
    let generator: Arc<dyn VisionModel> = match &config.generator {
        Some(m) => Arc::clone(m),
        None => provider::generator_from_env(
            config.generator_model.as_deref(),
            config.api_timeout_secs,
        )?,
    };
    let (judge_a, judge_b) = match (&config.judge_a, &config.judge_b) {
        (Some(a), b) => (Arc::clone(a), b.clone()),
        (None, _) => {
            let (a, b) =
                provider::judges_from_env(config.judge_model.as_deref(), config.api_timeout_secs)?;
            (a, config.judge_b.clone().or(b))
        }
    };
    let multi_judge = MultiJudge::new(judge_a, judge_b, config);
    let renderer: Arc<dyn Renderer> =
        Arc::new(ChromiumRenderer::new(config.viewport, config.render_timeout_secs));

    // Document analysis: once per document, reused across re-runs.
    let analysis = match load_persisted_analysis(&document_dir) {
        Some(existing) if !config.force => existing,
        _ => {
            let samples: Vec<&PageAssets> = assets.iter().collect();
            let analysis = analyze_document(&generator, &samples, config).await;
            write_json(&document_dir.join("document_analysis.json"), &analysis).await?;
            analysis
        }
    };
    let addendum = build_prompt_addendum(&analysis);
    write_text(&document_dir.join("custom_prompt.md"), &addendum).await?;

    // The per-page loop: one page at a time, one iteration at a time.
    let mut pages = Vec::with_capacity(assets.len());
    for page_assets in &assets {
        if config.cancel.load(Ordering::SeqCst) {
            warn!("cancellation requested; stopping before page {}", page_assets.page_index + 1);
            break;
        }
        if let Some(ref hook) = config.progress {
            hook.on_page_start(page_assets.page_index + 1, indices.len());
        }
        let dir = page_dir(&document_dir, page_assets.page_index);
        let result = process_page(
            page_assets,
            &dir,
            &generator,
            &multi_judge,
            &renderer,
            &analysis,
            &addendum,
            config,
        )
        .await?;
        if let Some(ref hook) = config.progress {
            hook.on_page_complete(
                result.page_index + 1,
                indices.len(),
                result.success,
                result.final_score,
                result.iterations_run,
            );
        }
        pages.push(result);
    }

    let passed = pages.iter().filter(|p| p.success).count();
    let processed = pages.len();
    let summary = ConversionSummary {
        total_pages,
        processed_pages: processed,
        passed_pages: passed,
        best_effort_pages: processed - passed,
        skipped_pages: skipped.len(),
        average_iterations: if processed == 0 {
            0.0
        } else {
            pages.iter().map(|p| p.iterations_run as f32).sum::<f32>() / processed as f32
        },
        total_duration_ms: start.elapsed().as_millis() as u64,
    };
    info!(
        "document complete: {}/{} pages passed, avg {:.1} iterations",
        passed, processed, summary.average_iterations
    );
    if let Some(ref hook) = config.progress {
        hook.on_document_complete(processed, passed);
    }

    Ok(ConversionOutcome {
        document_dir,
        analysis,
        pages,
        summary,
    })
}

/// Run the per-page state machine for one page.
///
/// Public so embedders (and the integration tests) can drive the loop
/// with their own assets, models, and renderer. Only output-write
/// failures are `Err`; everything model- or browser-shaped is absorbed
/// into the iteration history.
#[allow(clippy::too_many_arguments)]
pub async fn process_page(
    assets: &PageAssets,
    page_dir: &Path,
    generator: &Arc<dyn VisionModel>,
    multi_judge: &MultiJudge,
    renderer: &Arc<dyn Renderer>,
    analysis: &DocumentAnalysis,
    addendum: &str,
    config: &ConversionConfig,
) -> Result<PageResult, Pdf2HtmlError> {
    tokio::fs::create_dir_all(page_dir)
        .await
        .map_err(|e| Pdf2HtmlError::OutputWriteFailed {
            path: page_dir.to_path_buf(),
            source: e,
        })?;

    let page_num = assets.page_index + 1;
    let mut history: Vec<IterationRecord> = Vec::new();
    let mut current_html: Option<String> = None;
    let mut prior_feedback: Option<JudgeFeedback> = None;
    let mut accepted: Option<u32> = None;

    for iteration in 1..=config.max_retries {
        if config.cancel.load(Ordering::SeqCst) {
            warn!("page {page_num}: cancelled at iteration boundary {iteration}");
            break;
        }
        debug!("page {page_num}: iteration {iteration}/{}", config.max_retries);

        let html_path = page_dir.join(format!("iteration_{iteration:02}.html"));
        let rendered_path = page_dir.join(format!("rendered_{iteration:02}.png"));
        let feedback_path = page_dir.join(format!("feedback_{iteration:02}.json"));

        // ── GENERATE ─────────────────────────────────────────────────────
        let generated = match (&current_html, &prior_feedback) {
            (Some(html), Some(feedback)) => {
                generate::refine(generator, html, assets, feedback, addendum, config, iteration)
                    .await
            }
            _ => generate::generate_initial(generator, assets, addendum, config, iteration).await,
        };
        let html = match generated {
            Ok(html) => html,
            Err(e) => {
                warn!("page {page_num}: {e}");
                record_failed_iteration(
                    &mut history,
                    iteration,
                    html_path,
                    &feedback_path,
                    e,
                    config,
                    page_num,
                )
                .await?;
                continue;
            }
        };
        write_text(&html_path, &html).await?;

        // ── RENDER ───────────────────────────────────────────────────────
        if let Err(failure) = renderer.render(&html, &rendered_path).await {
            let e = IterationError::Render {
                iteration,
                detail: failure.to_string(),
            };
            warn!("page {page_num}: {e}");
            record_failed_iteration(
                &mut history,
                iteration,
                html_path,
                &feedback_path,
                e,
                config,
                page_num,
            )
            .await?;
            // Keep the HTML: once a later judge verdict exists, refinement
            // can build on it instead of starting over.
            current_html = Some(html);
            continue;
        }

        // ── JUDGE ────────────────────────────────────────────────────────
        let rendered_bytes =
            tokio::fs::read(&rendered_path)
                .await
                .map_err(|e| Pdf2HtmlError::OutputWriteFailed {
                    path: rendered_path.clone(),
                    source: e,
                })?;
        let rendered_b64 = STANDARD.encode(&rendered_bytes);
        let feedback = multi_judge
            .evaluate(&assets.page_image_b64, &rendered_b64, analysis.has_equations, config)
            .await;
        write_json(&feedback_path, &feedback).await?;

        info!(
            "page {page_num} iteration {iteration}: fidelity {} (text {}, layout {}, eq {}, color {}){}",
            feedback.fidelity_score,
            feedback.text_accuracy_score,
            feedback.layout_score,
            feedback.equation_score,
            feedback.color_match_score,
            if feedback.judges_disagree { " [judges disagree]" } else { "" },
        );
        if let Some(ref hook) = config.progress {
            hook.on_iteration(page_num, iteration, config.max_retries, Some(feedback.fidelity_score));
        }

        history.push(IterationRecord {
            iteration,
            html_path: html_path.clone(),
            rendered_image_path: Some(rendered_path),
            feedback: feedback.clone(),
            error: None,
        });

        // ── DECIDE ───────────────────────────────────────────────────────
        let meets_target = feedback.fidelity_score >= config.target_score;
        let gate_agrees = !feedback.gate_failed;
        current_html = Some(html);
        prior_feedback = Some(feedback);
        if meets_target && gate_agrees {
            accepted = Some(iteration);
            break;
        }
        if meets_target {
            info!("page {page_num}: target met but verification gate disagreed; refining");
        }
    }

    // ── COMMIT ───────────────────────────────────────────────────────────
    let final_html_path = page_dir.join("final.html");
    let committed = match accepted {
        Some(n) => history.iter().find(|r| r.iteration == n),
        // Best-effort promotion: highest composite, latest wins ties, but
        // only iterations that actually produced HTML are candidates.
        None => IterationRecord::best_of(&history),
    };

    let final_score = match committed {
        Some(record) => {
            tokio::fs::copy(&record.html_path, &final_html_path)
                .await
                .map_err(|e| Pdf2HtmlError::OutputWriteFailed {
                    path: final_html_path.clone(),
                    source: e,
                })?;
            record.feedback.fidelity_score
        }
        None => {
            warn!("page {page_num}: no iteration produced HTML; nothing to commit");
            0
        }
    };

    let result = PageResult {
        page_index: assets.page_index,
        success: accepted.is_some(),
        final_score,
        iterations_run: history.len() as u32,
        final_html_path,
        history,
    };
    write_json(&page_dir.join("result.json"), &result).await?;
    Ok(result)
}

/// Persist a zero-signal iteration: feedback carries the failure as its
/// one critical error so a later refinement can react to it.
async fn record_failed_iteration(
    history: &mut Vec<IterationRecord>,
    iteration: u32,
    html_path: PathBuf,
    feedback_path: &Path,
    error: IterationError,
    config: &ConversionConfig,
    page_num: usize,
) -> Result<(), Pdf2HtmlError> {
    let feedback = JudgeFeedback::failure(format!("ERROR: {error}"), "");
    write_json(feedback_path, &feedback).await?;
    if let Some(ref hook) = config.progress {
        hook.on_iteration(page_num, iteration, config.max_retries, None);
    }
    history.push(IterationRecord {
        iteration,
        html_path,
        rendered_image_path: None,
        feedback,
        error: Some(error),
    });
    Ok(())
}

fn page_dir(document_dir: &Path, page_index: usize) -> PathBuf {
    document_dir.join(format!("page_{page_index:03}"))
}

fn load_persisted_analysis(document_dir: &Path) -> Option<DocumentAnalysis> {
    let raw = std::fs::read_to_string(document_dir.join("document_analysis.json")).ok()?;
    serde_json::from_str(&raw).ok()
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Pdf2HtmlError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Pdf2HtmlError::Internal(format!("serialize {}: {e}", path.display())))?;
    write_text(path, &json).await
}

async fn write_text(path: &Path, content: &str) -> Result<(), Pdf2HtmlError> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| Pdf2HtmlError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
}
