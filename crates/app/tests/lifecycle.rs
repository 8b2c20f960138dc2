//! Application lifecycle end to end.

use std::future::IntoFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_app::{AppConfig, Application};
use tether_core::{erase, Disposable, TetherError};
use tether_promise::{AsyncPromise, PromiseError};

/// Counts edits and dispose calls.
#[derive(Default)]
struct Document {
    edits: AtomicUsize,
    disposed: AtomicUsize,
}

impl Disposable for Document {
    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }

    fn debug_name(&self) -> String {
        "Document".into()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn awaited_promise_is_cancelled_by_scope_dispose() {
    let app = Application::start(AppConfig::default()).unwrap();
    let scope = app.new_child("editor").unwrap();

    let pending: AsyncPromise<String> = AsyncPromise::new();
    app.cancel_on_dispose(&pending, &scope).unwrap();
    let waiter = tokio::spawn(pending.clone().into_future());

    tokio::time::sleep(Duration::from_millis(10)).await;
    app.disposer().dispose(&scope, false).unwrap();

    assert!(matches!(waiter.await.unwrap(), Err(PromiseError::Cancelled)));
    assert!(app.shutdown().unwrap().is_clean());
}

#[tokio::test]
async fn services_edit_through_write_thread() {
    let app = Application::start(AppConfig::default()).unwrap();
    let doc = Arc::new(Document::default());
    app.register_disposable_service(doc.clone()).unwrap();

    let writes: Vec<_> = (0..20)
        .map(|_| {
            let doc = app.service::<Document>().unwrap();
            app.write_thread()
                .push_write_action(move || doc.edits.fetch_add(1, Ordering::SeqCst))
        })
        .collect();
    for w in writes {
        w.await.unwrap();
    }

    let reader = app.access().clone();
    let seen = reader.read(|| Ok::<_, TetherError>(doc.edits.load(Ordering::SeqCst)));
    assert_eq!(seen.unwrap(), 20);

    let report = app.shutdown().unwrap();
    assert_eq!(report.writes.completed, 20);
    assert_eq!(doc.disposed.load(Ordering::SeqCst), 1);
    assert!(report.is_clean());
}

#[test]
fn write_after_shutdown_is_cancelled() {
    let app = Application::start(AppConfig::default()).unwrap();
    let wt = app.write_thread().clone();
    let doc = erase(&Arc::new(Document::default()));
    app.disposer().register(app.root(), &doc).unwrap();
    app.shutdown().unwrap();

    assert!(!wt.is_running());
    assert!(wt.push_write_action(|| 1u8).is_cancelled());
    assert!(matches!(
        wt.run_and_wait(|| 1u8),
        Err(TetherError::WriteThreadStopped)
    ));
}
