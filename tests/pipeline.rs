//! End-to-end tests of the per-page state machine with scripted models
//! and a stub renderer.
//!
//! Every model- and browser-shaped dependency is replaced by a scripted
//! double, so these tests exercise the real loop: persistence layout,
//! accept/refine/best-effort decisions, render-failure budgeting, the
//! verification gate, and the consensus annotation.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pdf2html::pipeline::ingest::PageAssets;
use pdf2html::pipeline::multi_judge::MultiJudge;
use pdf2html::pipeline::render::{RenderFailure, Renderer};
use pdf2html::process_page;
use pdf2html::provider::{Part, ProviderError, VisionRequest};
use pdf2html::{ConversionConfig, DocumentAnalysis, VisionModel};

// ── Scripted doubles ─────────────────────────────────────────────────────

/// Dispatches on the prompt text to play the right role, popping scripted
/// replies and falling back to benign defaults when a queue runs dry.
struct ScriptedModel {
    name: String,
    generator: Mutex<VecDeque<String>>,
    judge: Mutex<VecDeque<String>>,
    specialist: Mutex<VecDeque<String>>,
    verify: Mutex<VecDeque<String>>,
}

impl ScriptedModel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            generator: Mutex::new(VecDeque::new()),
            judge: Mutex::new(VecDeque::new()),
            specialist: Mutex::new(VecDeque::new()),
            verify: Mutex::new(VecDeque::new()),
        }
    }

    fn push_judge(&self, reply: String) {
        self.judge.lock().unwrap().push_back(reply);
    }

    fn push_specialist(&self, reply: String) {
        self.specialist.lock().unwrap().push_back(reply);
    }

    fn push_verify(&self, reply: String) {
        self.verify.lock().unwrap().push_back(reply);
    }
}

fn judge_reply(text: u8, layout: u8, color: u8, eq: u8) -> String {
    format!(
        r#"{{"text_accuracy_score": {text}, "layout_score": {layout},
            "color_match_score": {color}, "equation_score": {eq},
            "preserved_correctly": ["layout structure"],
            "critical_errors": ["ERROR: spacing off | FIX: adjust margins"]}}"#
    )
}

fn verify_reply(recommendation: &str) -> String {
    format!(
        r#"{{"verified": true, "confidence": 90, "issues_found": [], "recommendation": "{recommendation}"}}"#
    )
}

const DEFAULT_HTML: &str = "<!DOCTYPE html><html><head><title>p</title></head><body>page body</body></html>";

#[async_trait]
impl VisionModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &VisionRequest) -> Result<String, ProviderError> {
        let prompt: String = request
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                Part::Image(_) => None,
            })
            .collect();

        let (queue, fallback) = if prompt.contains("MATHEMATICS SPECIALIST") {
            (
                &self.specialist,
                r#"{"equation_fidelity_score": 100, "has_equations": false, "ascii_art_detected": false, "equation_errors": []}"#.to_string(),
            )
        } else if prompt.contains("FINAL VERIFICATION") {
            (&self.verify, verify_reply("accept"))
        } else if prompt.contains("QA visual engineer") {
            (&self.judge, judge_reply(90, 90, 90, 90))
        } else {
            (&self.generator, DEFAULT_HTML.to_string())
        };

        Ok(queue.lock().unwrap().pop_front().unwrap_or(fallback))
    }
}

/// Renderer double: writes stub bytes, optionally failing the first N
/// calls to simulate browser timeouts.
struct StubRenderer {
    fail_first: usize,
    calls: AtomicUsize,
}

impl StubRenderer {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            fail_first: 0,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing_first(n: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_first: n,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Renderer for StubRenderer {
    async fn render(&self, _html: &str, output_path: &Path) -> Result<(), RenderFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(RenderFailure {
                detail: "navigation timed out after 30s".into(),
            });
        }
        tokio::fs::write(output_path, b"stub png bytes")
            .await
            .map_err(|e| RenderFailure {
                detail: e.to_string(),
            })?;
        Ok(())
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

fn assets(dir: &Path) -> PageAssets {
    let image_path = dir.join("page_000.png");
    std::fs::write(&image_path, b"stub source raster").unwrap();
    PageAssets {
        page_index: 0,
        width_px: 1000,
        height_px: 1400,
        page_image_path: image_path,
        page_image_b64: STANDARD.encode(b"stub source raster"),
        figures: Vec::new(),
    }
}

fn config(target: u8, max_retries: u32) -> ConversionConfig {
    ConversionConfig::builder()
        .target_score(target)
        .max_retries(max_retries)
        .call_retries(0)
        .retry_backoff_ms(1)
        .build()
        .unwrap()
}

struct Harness {
    generator: Arc<ScriptedModel>,
    judge: Arc<ScriptedModel>,
    config: ConversionConfig,
}

impl Harness {
    fn new(config: ConversionConfig) -> Self {
        Self {
            generator: Arc::new(ScriptedModel::new("stub:generator")),
            judge: Arc::new(ScriptedModel::new("stub:judge-a")),
            config,
        }
    }

    async fn run(&self, dir: &Path, renderer: Arc<StubRenderer>) -> pdf2html::PageResult {
        let generator: Arc<dyn VisionModel> = self.generator.clone();
        let judge_a: Arc<dyn VisionModel> = self.judge.clone();
        let multi_judge = MultiJudge::new(judge_a, None, &self.config);
        let renderer: Arc<dyn Renderer> = renderer;
        let analysis = DocumentAnalysis::default();
        process_page(
            &assets(dir),
            &dir.join("page_000"),
            &generator,
            &multi_judge,
            &renderer,
            &analysis,
            "",
            &self.config,
        )
        .await
        .expect("process_page should only fail on I/O errors")
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn accepts_first_iteration_above_target() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(config(85, 5));
    harness.judge.push_judge(judge_reply(95, 90, 90, 100));

    let result = harness.run(dir.path(), StubRenderer::ok()).await;

    assert!(result.success);
    assert_eq!(result.iterations_run, 1);
    // 0.50·95 + 0.30·90 + 0.15·100 + 0.05·90 = 94
    assert_eq!(result.final_score, 94);

    let page_dir = dir.path().join("page_000");
    let final_html = std::fs::read(page_dir.join("final.html")).unwrap();
    let iter_html = std::fs::read(page_dir.join("iteration_01.html")).unwrap();
    assert_eq!(final_html, iter_html, "final.html must be byte-identical");
    assert!(page_dir.join("rendered_01.png").exists());
    assert!(page_dir.join("feedback_01.json").exists());
    assert!(page_dir.join("result.json").exists());
}

#[tokio::test]
async fn best_effort_promotes_highest_scoring_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(config(95, 3));
    // Uniform subscores make the composite equal the subscore.
    harness.judge.push_judge(judge_reply(60, 60, 60, 60));
    harness.judge.push_judge(judge_reply(75, 75, 75, 75));
    harness.judge.push_judge(judge_reply(70, 70, 70, 70));

    let result = harness.run(dir.path(), StubRenderer::ok()).await;

    assert!(!result.success, "target 95 was never reached");
    assert_eq!(result.iterations_run, 3);
    assert_eq!(result.final_score, 75);

    let page_dir = dir.path().join("page_000");
    let final_html = std::fs::read(page_dir.join("final.html")).unwrap();
    let best_html = std::fs::read(page_dir.join("iteration_02.html")).unwrap();
    assert_eq!(final_html, best_html, "iteration 2 scored highest");
}

#[tokio::test]
async fn iteration_budget_is_a_hard_bound() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(config(100, 4));
    // Target 100 with 90-score replies: the loop must run the full budget.
    let result = harness.run(dir.path(), StubRenderer::ok()).await;
    assert_eq!(result.iterations_run, 4);
    assert!(!result.success);
}

#[tokio::test]
async fn target_zero_accepts_first_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(config(0, 5));
    harness.judge.push_judge(judge_reply(10, 10, 10, 10));

    let result = harness.run(dir.path(), StubRenderer::ok()).await;
    assert!(result.success);
    assert_eq!(result.iterations_run, 1);
}

#[tokio::test]
async fn max_retries_one_commits_sole_iteration_regardless_of_score() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(config(85, 1));
    harness.judge.push_judge(judge_reply(40, 40, 40, 40));

    let result = harness.run(dir.path(), StubRenderer::ok()).await;
    assert!(!result.success);
    assert_eq!(result.iterations_run, 1);

    let page_dir = dir.path().join("page_000");
    let final_html = std::fs::read(page_dir.join("final.html")).unwrap();
    let iter_html = std::fs::read(page_dir.join("iteration_01.html")).unwrap();
    assert_eq!(final_html, iter_html);
}

#[tokio::test]
async fn render_failure_is_a_zero_signal_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(config(85, 3));
    harness.judge.push_judge(judge_reply(95, 95, 95, 95));

    // First render times out; second succeeds and gets judged.
    let result = harness.run(dir.path(), StubRenderer::failing_first(1)).await;

    assert!(result.success);
    assert_eq!(result.iterations_run, 2);

    let page_dir = dir.path().join("page_000");
    // Iteration 1: HTML persisted, feedback zero-scored, no raster.
    assert!(page_dir.join("iteration_01.html").exists());
    assert!(!page_dir.join("rendered_01.png").exists());
    let feedback_1: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(page_dir.join("feedback_01.json")).unwrap())
            .unwrap();
    assert_eq!(feedback_1["fidelity_score"], 0);
    assert!(feedback_1["critical_errors"][0]
        .as_str()
        .unwrap()
        .contains("render failed"));
    assert!(result.history[0].error.is_some());

    // Iteration 2 proceeded normally and was committed.
    let final_html = std::fs::read(page_dir.join("final.html")).unwrap();
    let iter_2 = std::fs::read(page_dir.join("iteration_02.html")).unwrap();
    assert_eq!(final_html, iter_2);
}

#[tokio::test]
async fn verification_gate_rejection_forces_another_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(config(85, 5));
    // Both iterations meet the target; the gate only agrees the second time.
    harness.judge.push_judge(judge_reply(90, 90, 90, 90));
    harness.judge.push_judge(judge_reply(92, 92, 92, 92));
    harness.judge.push_verify(verify_reply("needs_refinement"));
    harness.judge.push_verify(verify_reply("accept"));

    let result = harness.run(dir.path(), StubRenderer::ok()).await;

    assert!(result.success);
    assert_eq!(result.iterations_run, 2);
    assert!(result.history[0].feedback.gate_failed);
    assert!(!result.history[1].feedback.gate_failed);
    assert_eq!(result.final_score, 92);
}

#[tokio::test]
async fn equation_specialist_caps_equation_subscore() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(85, 2);
    cfg.use_verification = false;
    let harness = Harness::new(cfg);

    // General judge is happy, but the specialist sees ASCII-art math.
    harness.judge.push_judge(judge_reply(95, 95, 95, 95));
    harness.judge.push_specialist(
        r#"{"equation_fidelity_score": 70, "has_equations": true,
            "ascii_art_detected": true,
            "equation_errors": ["Equation 2 is plain text 'a/b'"]}"#
            .to_string(),
    );

    let generator: Arc<dyn VisionModel> = harness.generator.clone();
    let judge_a: Arc<dyn VisionModel> = harness.judge.clone();
    let multi_judge = MultiJudge::new(judge_a, None, &harness.config);
    let renderer: Arc<dyn Renderer> = StubRenderer::ok();
    let analysis = DocumentAnalysis {
        has_equations: true,
        ..DocumentAnalysis::default()
    };
    let result = process_page(
        &assets(dir.path()),
        &dir.path().join("page_000"),
        &generator,
        &multi_judge,
        &renderer,
        &analysis,
        "",
        &harness.config,
    )
    .await
    .unwrap();

    let first = &result.history[0].feedback;
    assert!(first.equation_score <= 40, "cap must apply: {}", first.equation_score);
    assert!(first.ascii_art_detected);
    // 0.50·95 + 0.30·95 + 0.15·40 + 0.05·95 = 86.75 → 87… still ≥ 85, but
    // with the capped subscore the law must hold exactly:
    assert_eq!(
        first.fidelity_score,
        pdf2html::pipeline::judge::composite_score(95, 95, first.equation_score, 95)
    );
}

#[tokio::test]
async fn cross_model_disagreement_annotates_without_changing_decision() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(75, 1);
    cfg.use_verification = false;
    let harness = Harness::new(cfg.clone());
    harness.judge.push_judge(judge_reply(90, 90, 90, 90));

    let judge_b = Arc::new(ScriptedModel::new("stub:judge-b"));
    judge_b.push_judge(judge_reply(70, 70, 70, 70));

    let generator: Arc<dyn VisionModel> = harness.generator.clone();
    let a: Arc<dyn VisionModel> = harness.judge.clone();
    let b: Arc<dyn VisionModel> = judge_b;
    let multi_judge = MultiJudge::new(a, Some(b), &cfg);
    let renderer: Arc<dyn Renderer> = StubRenderer::ok();
    let analysis = DocumentAnalysis::default();
    let result = process_page(
        &assets(dir.path()),
        &dir.path().join("page_000"),
        &generator,
        &multi_judge,
        &renderer,
        &analysis,
        "",
        &cfg,
    )
    .await
    .unwrap();

    let feedback = &result.history[0].feedback;
    assert!(feedback.judges_disagree, "20-point composite gap");
    // Weighted 50/50 combination: 80 ≥ target 75 → accepted anyway.
    assert_eq!(feedback.fidelity_score, 80);
    assert!(result.success);
}

#[tokio::test]
async fn persistence_is_monotone_across_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(config(95, 3));

    let result = harness.run(dir.path(), StubRenderer::ok()).await;
    let page_dir = dir.path().join("page_000");

    for k in 1..=result.iterations_run {
        assert!(page_dir.join(format!("iteration_{k:02}.html")).exists());
        assert!(page_dir.join(format!("rendered_{k:02}.png")).exists());
        assert!(page_dir.join(format!("feedback_{k:02}.json")).exists());
    }
    assert!(!page_dir
        .join(format!("iteration_{:02}.html", result.iterations_run + 1))
        .exists());
}

#[tokio::test]
async fn persisted_feedback_obeys_composite_law() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(config(95, 2));
    harness.judge.push_judge(judge_reply(88, 72, 64, 100));
    harness.judge.push_judge(judge_reply(91, 85, 70, 100));

    let result = harness.run(dir.path(), StubRenderer::ok()).await;
    let page_dir = dir.path().join("page_000");

    for k in 1..=result.iterations_run {
        let raw = std::fs::read_to_string(page_dir.join(format!("feedback_{k:02}.json"))).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let expected = pdf2html::pipeline::judge::composite_score(
            v["text_accuracy_score"].as_u64().unwrap() as u8,
            v["layout_score"].as_u64().unwrap() as u8,
            v["equation_score"].as_u64().unwrap() as u8,
            v["color_match_score"].as_u64().unwrap() as u8,
        );
        assert_eq!(v["fidelity_score"].as_u64().unwrap() as u8, expected);
    }
}
