//! Stress run: ownership forest + concurrent readers vs. queued writes.
//!
//! Every structural property is checked while the run executes: each node
//! verifies its children were disposed before it, and every read verifies
//! it never observes a write in progress.

use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_app::Application;
use tether_core::{erase, Disposable, DisposableRef, TetherError, TetherResult};
use tether_promise::collect_results;

#[derive(Debug, Clone)]
pub struct StressParams {
    pub roots: usize,
    pub depth: usize,
    pub fanout: usize,
    pub readers: usize,
    pub reads_per_reader: usize,
    pub writes: usize,
}

/// Raw measurements of one run.
#[derive(Debug, Clone, Default)]
pub struct StressOutcome {
    pub nodes: usize,
    pub build_time: Duration,
    pub reads: u64,
    pub writes_completed: usize,
    pub exclusion_violations: usize,
    pub rw_time: Duration,
    pub disposed: usize,
    pub order_violations: usize,
    pub dispose_failures: Vec<String>,
    pub teardown_time: Duration,
}

// ---------------------------------------------------------------------------
// Forest
// ---------------------------------------------------------------------------

struct StressNode {
    name: String,
    children: Mutex<Vec<Arc<StressNode>>>,
    disposed: AtomicBool,
    checks: Arc<DisposeChecks>,
}

#[derive(Default)]
struct DisposeChecks {
    disposed: AtomicUsize,
    order_violations: AtomicUsize,
}

impl StressNode {
    fn new(name: String, checks: &Arc<DisposeChecks>) -> Arc<Self> {
        Arc::new(Self {
            name,
            children: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            checks: checks.clone(),
        })
    }
}

impl Disposable for StressNode {
    fn dispose(&self) {
        let early = self
            .children
            .lock()
            .iter()
            .filter(|c| !c.disposed.load(Ordering::SeqCst))
            .count();
        if early > 0 {
            self.checks.order_violations.fetch_add(early, Ordering::Relaxed);
        }
        if self.disposed.swap(true, Ordering::SeqCst) {
            // Disposed twice.
            self.checks.order_violations.fetch_add(1, Ordering::Relaxed);
        }
        self.checks.disposed.fetch_add(1, Ordering::Relaxed);
    }

    fn debug_name(&self) -> String {
        self.name.clone()
    }
}

/// Builds one tree of `depth` levels below `top`, iteratively.
fn build_tree(
    app: &Application,
    top: &Arc<StressNode>,
    depth: usize,
    fanout: usize,
    checks: &Arc<DisposeChecks>,
) -> TetherResult<usize> {
    let mut created = 0;
    let mut stack = vec![(top.clone(), 0usize)];
    while let Some((parent, level)) = stack.pop() {
        if level == depth {
            continue;
        }
        let parent_ref = erase(&parent);
        for i in 0..fanout {
            let child = StressNode::new(format!("{}.{i}", parent.name), checks);
            app.disposer().register(&parent_ref, &erase(&child))?;
            parent.children.lock().push(child.clone());
            created += 1;
            stack.push((child, level + 1));
        }
    }
    Ok(created)
}

// ---------------------------------------------------------------------------
// Readers and writers
// ---------------------------------------------------------------------------

/// Two counters a write action bumps one after the other. A reader that
/// sees them differ has overlapped a write.
#[derive(Default)]
struct Ledger {
    head: AtomicU64,
    tail: AtomicU64,
}

fn run_readers_and_writes(app: &Application, params: &StressParams) -> TetherResult<(u64, usize, usize)> {
    let ledger = Arc::new(Ledger::default());
    let violations = Arc::new(AtomicUsize::new(0));

    let pending: Vec<_> = (0..params.writes)
        .map(|_| {
            let ledger = ledger.clone();
            app.write_thread().push_write_action(move || {
                ledger.head.fetch_add(1, Ordering::SeqCst);
                std::thread::yield_now();
                ledger.tail.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    let rule = app.access().clone();
    let reads = AtomicU64::new(0);
    (0..params.readers)
        .into_par_iter()
        .try_for_each(|_| -> TetherResult<()> {
            for _ in 0..params.reads_per_reader {
                rule.run_cancellable_read(|progress| {
                    let head = ledger.head.load(Ordering::SeqCst);
                    progress.check_canceled()?;
                    let tail = ledger.tail.load(Ordering::SeqCst);
                    if head != tail {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(())
                })?;
                reads.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        })?;

    let completed = collect_results(pending)
        .blocking_get(None)
        .map_err(|e| TetherError::Internal(format!("write actions: {e}")))?
        .len();

    Ok((
        reads.load(Ordering::Relaxed),
        completed,
        violations.load(Ordering::Relaxed),
    ))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(app: &Application, params: &StressParams) -> TetherResult<StressOutcome> {
    let checks = Arc::new(DisposeChecks::default());

    // Build: one scope per root under the application, trees built in parallel.
    let t0 = Instant::now();
    let tops: Vec<Arc<StressNode>> = (0..params.roots)
        .map(|r| StressNode::new(format!("root-{r}"), &checks))
        .collect();
    for top in &tops {
        app.disposer().register(app.root(), &erase(top))?;
    }
    let below: usize = tops
        .par_iter()
        .map(|top| build_tree(app, top, params.depth, params.fanout, &checks))
        .collect::<TetherResult<Vec<usize>>>()?
        .into_iter()
        .sum();
    let nodes = tops.len() + below;
    let build_time = t0.elapsed();
    tracing::info!(nodes, elapsed_ms = build_time.as_millis(), "forest built");

    // Readers vs. writes.
    let t1 = Instant::now();
    let (reads, writes_completed, exclusion_violations) = run_readers_and_writes(app, params)?;
    let rw_time = t1.elapsed();
    tracing::info!(
        reads,
        writes = writes_completed,
        exclusion_violations,
        elapsed_ms = rw_time.as_millis(),
        "readers and writes done"
    );

    // Teardown, one root at a time, last registered first.
    let t2 = Instant::now();
    let mut dispose_failures = Vec::new();
    for top in tops.iter().rev() {
        let top: DisposableRef = erase(top);
        match app.disposer().dispose(&top, false) {
            Ok(()) => {}
            Err(TetherError::DisposeFailed(mut failures)) => dispose_failures.append(&mut failures),
            Err(e) => return Err(e),
        }
    }
    let teardown_time = t2.elapsed();
    let disposed = checks.disposed.load(Ordering::Relaxed);
    let order_violations = checks.order_violations.load(Ordering::Relaxed);
    tracing::info!(
        disposed,
        order_violations,
        elapsed_ms = teardown_time.as_millis(),
        "forest disposed"
    );

    Ok(StressOutcome {
        nodes,
        build_time,
        reads,
        writes_completed,
        exclusion_violations,
        rw_time,
        disposed,
        order_violations,
        dispose_failures,
        teardown_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_app::AppConfig;

    fn small() -> StressParams {
        StressParams {
            roots: 3,
            depth: 3,
            fanout: 2,
            readers: 4,
            reads_per_reader: 50,
            writes: 25,
        }
    }

    #[test]
    fn small_run_is_clean() {
        let app = Application::start(AppConfig::default()).unwrap();
        let outcome = run(&app, &small()).unwrap();

        // 3 roots * (1 + 2 + 4 + 8)
        assert_eq!(outcome.nodes, 45);
        assert_eq!(outcome.disposed, 45);
        assert_eq!(outcome.order_violations, 0);
        assert_eq!(outcome.exclusion_violations, 0);
        assert_eq!(outcome.reads, 200);
        assert_eq!(outcome.writes_completed, 25);
        assert!(outcome.dispose_failures.is_empty());
        assert!(app.shutdown().unwrap().is_clean());
    }

    #[test]
    fn zero_depth_is_just_roots() {
        let app = Application::start(AppConfig::default()).unwrap();
        let params = StressParams {
            depth: 0,
            writes: 0,
            readers: 0,
            ..small()
        };
        let outcome = run(&app, &params).unwrap();
        assert_eq!(outcome.nodes, 3);
        assert_eq!(outcome.disposed, 3);
        assert_eq!(outcome.writes_completed, 0);
        assert!(app.shutdown().unwrap().is_clean());
    }
}
