//! Progress-hook trait for per-page and per-iteration events.
//!
//! Inject an `Arc<dyn ProgressHook>` via
//! [`crate::config::ConversionConfigBuilder::progress`] to receive
//! real-time events as the loop works through pages. The callback approach
//! keeps the library ignorant of how the host application communicates —
//! a terminal progress bar, a channel, a database row — while the CLI
//! renders them with indicatif.
//!
//! All methods default to no-ops so implementations override only what
//! they care about. The loop processes pages sequentially, so calls arrive
//! in order, but implementations must still be `Send + Sync`.

/// Events emitted by the conversion loop.
pub trait ProgressHook: Send + Sync {
    /// Called once after the page selection is resolved.
    fn on_document_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called before a page enters the refinement loop.
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called because a page's directory already held a `final.html`.
    fn on_page_skipped(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called after each iteration's judge verdict.
    ///
    /// `score` is `None` when the iteration failed before judging.
    fn on_iteration(&self, page_num: usize, iteration: u32, max_retries: u32, score: Option<u8>) {
        let _ = (page_num, iteration, max_retries, score);
    }

    /// Called when a page commits its final artifact.
    fn on_page_complete(
        &self,
        page_num: usize,
        total_pages: usize,
        success: bool,
        score: u8,
        iterations: u32,
    ) {
        let _ = (page_num, total_pages, success, score, iterations);
    }

    /// Called once after the last page.
    fn on_document_complete(&self, processed: usize, passed: usize) {
        let _ = (processed, passed);
    }
}

/// No-op hook used when no callback is configured.
pub struct NoopProgressHook;

impl ProgressHook for NoopProgressHook {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        iterations: AtomicUsize,
        completions: AtomicUsize,
    }

    impl ProgressHook for Counting {
        fn on_iteration(&self, _p: usize, _i: u32, _m: u32, _s: Option<u8>) {
            self.iterations.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _p: usize, _t: usize, _ok: bool, _s: u8, _i: u32) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_hook_does_not_panic() {
        let hook = NoopProgressHook;
        hook.on_document_start(3);
        hook.on_page_start(1, 3);
        hook.on_iteration(1, 1, 5, Some(90));
        hook.on_iteration(1, 2, 5, None);
        hook.on_page_complete(1, 3, true, 90, 2);
        hook.on_page_skipped(2, 3);
        hook.on_document_complete(2, 1);
    }

    #[test]
    fn hook_works_behind_arc_dyn() {
        let counting = Arc::new(Counting {
            iterations: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
        });
        let hook: Arc<dyn ProgressHook> = counting.clone();
        hook.on_iteration(1, 1, 5, Some(50));
        hook.on_page_complete(1, 1, false, 50, 1);
        assert_eq!(counting.iterations.load(Ordering::SeqCst), 1);
        assert_eq!(counting.completions.load(Ordering::SeqCst), 1);
    }
}
