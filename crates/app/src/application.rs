//! The application context.
//!
//! Everything that would otherwise be a process-wide singleton lives here:
//! the disposer, the root disposable, the access rule with its write
//! thread, and the service registry. `start` and `shutdown` are the only
//! lifecycle entry points.

use crate::config::AppConfig;
use parking_lot::RwLock;
use serde::Serialize;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tether_access::{AccessRule, AccessStats, WriteStats, WriteThread};
use tether_core::{erase, Disposable, DisposableRef, TetherError, TetherResult};
use tether_disposer::{new_disposable, Disposer};
use tether_promise::{AsyncPromise, CancelOnDispose, PromiseError};
use tracing::{debug, info, warn};

struct ServiceSlot {
    name: &'static str,
    service: Arc<dyn Any + Send + Sync>,
}

/// What `shutdown` observed.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub uptime_ms: u64,
    /// Services that were registered at shutdown.
    pub services: usize,
    /// Panics caught while tearing down the root subtree.
    pub dispose_failures: Vec<String>,
    pub leak_check_ran: bool,
    /// Roots still in the ownership tree after teardown.
    pub leaked_roots: Vec<String>,
    pub writes: WriteStats,
    pub access: AccessStats,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.dispose_failures.is_empty() && self.leaked_roots.is_empty()
    }
}

pub struct Application {
    config: AppConfig,
    disposer: Arc<Disposer>,
    root: DisposableRef,
    write_thread: Arc<WriteThread>,
    services: RwLock<HashMap<TypeId, ServiceSlot>>,
    started: Instant,
}

impl Application {
    pub fn start(config: AppConfig) -> TetherResult<Self> {
        let disposer = Arc::new(Disposer::new(config.disposer.clone()));
        let root = new_disposable("application");
        let write_thread = Arc::new(WriteThread::start(AccessRule::new(config.access.clone()))?);

        info!(
            write_thread = %config.access.write_thread_name,
            debug_disposer = config.disposer.debug_mode,
            "application started"
        );
        Ok(Self {
            config,
            disposer,
            root,
            write_thread,
            services: RwLock::new(HashMap::new()),
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn disposer(&self) -> &Arc<Disposer> {
        &self.disposer
    }

    /// Parent of everything that should live exactly as long as the
    /// application.
    pub fn root(&self) -> &DisposableRef {
        &self.root
    }

    pub fn access(&self) -> &Arc<AccessRule> {
        self.write_thread.rule()
    }

    pub fn write_thread(&self) -> &Arc<WriteThread> {
        &self.write_thread
    }

    /// Creates a named scope owned by the root.
    pub fn new_child(&self, name: impl Into<String>) -> TetherResult<DisposableRef> {
        self.disposer.new_disposable_under(&self.root, name)
    }

    // -----------------------------------------------------------------------
    // Services
    // -----------------------------------------------------------------------

    /// Registers the single instance of `T`. A second registration for the
    /// same type fails.
    pub fn register_service<T: Send + Sync + 'static>(&self, service: Arc<T>) -> TetherResult<()> {
        let mut services = self.services.write();
        ensure_vacant::<T>(&services)?;
        insert_service(&mut services, service);
        Ok(())
    }

    /// Registers a service that is also owned by the root, so it is
    /// disposed at shutdown after everything registered later. A duplicate
    /// is rejected before the tree sees it.
    pub fn register_disposable_service<T: Disposable>(&self, service: Arc<T>) -> TetherResult<()> {
        // Held across both steps so a racing registration cannot slip in between.
        let mut services = self.services.write();
        ensure_vacant::<T>(&services)?;
        self.disposer.register(&self.root, &erase(&service))?;
        insert_service(&mut services, service);
        Ok(())
    }

    /// Looks up the instance of `T`. A missing service is a wiring bug and
    /// the error is fatal.
    pub fn service<T: Send + Sync + 'static>(&self) -> TetherResult<Arc<T>> {
        let service = self
            .services
            .read()
            .get(&TypeId::of::<T>())
            .map(|slot| slot.service.clone());
        match service {
            Some(service) => service
                .downcast::<T>()
                .map_err(|_| TetherError::Internal(format!("service slot for {} holds another type", type_name::<T>()))),
            None => Err(TetherError::ServiceNotRegistered(type_name::<T>())),
        }
    }

    pub fn has_service<T: Send + Sync + 'static>(&self) -> bool {
        self.services.read().contains_key(&TypeId::of::<T>())
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.services.read().values().map(|s| s.name).collect();
        names.sort_unstable();
        names
    }

    // -----------------------------------------------------------------------
    // Promise glue
    // -----------------------------------------------------------------------

    /// Cancels `promise` when `parent` is disposed. Once the promise
    /// completes on its own, the link is removed from the tree. A parent that
    /// is already gone cancels the promise immediately.
    pub fn cancel_on_dispose<T: Clone + Send + 'static>(
        &self,
        promise: &AsyncPromise<T>,
        parent: &DisposableRef,
    ) -> TetherResult<()> {
        if promise.is_done() {
            return Ok(());
        }
        let link = erase(&CancelOnDispose::new(promise));
        match self.disposer.register(parent, &link) {
            Ok(()) => {}
            Err(TetherError::ParentDisposed(name)) => {
                debug!(parent = %name, "parent already disposed; cancelling promise");
                promise.cancel();
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let disposer: Weak<Disposer> = Arc::downgrade(&self.disposer);
        promise.on_processed(move |_: &Result<T, PromiseError>| {
            if let Some(disposer) = disposer.upgrade() {
                if let Err(e) = disposer.dispose(&link, false) {
                    warn!(error = %e, "releasing cancel-on-dispose link failed");
                }
            }
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Tears the application down: the root subtree first (while the write
    /// thread still accepts work), then the write thread, then the leak
    /// check.
    pub fn shutdown(self) -> TetherResult<ShutdownReport> {
        info!("application shutting down");

        let dispose_failures = match self.disposer.dispose(&self.root, false) {
            Ok(()) => Vec::new(),
            Err(TetherError::DisposeFailed(failures)) => failures,
            Err(e) => return Err(e),
        };

        let services = {
            let mut services = self.services.write();
            let n = services.len();
            services.clear();
            n
        };

        self.write_thread.shutdown()?;

        let (leak_check_ran, leaked_roots) = if self.config.leak_check_on_shutdown {
            match self.disposer.assert_is_empty() {
                Ok(()) => (true, Vec::new()),
                Err(TetherError::LeakedRoots(roots)) => (true, roots),
                Err(e) => return Err(e),
            }
        } else {
            (false, Vec::new())
        };

        let report = ShutdownReport {
            uptime_ms: self.started.elapsed().as_millis() as u64,
            services,
            dispose_failures,
            leak_check_ran,
            leaked_roots,
            writes: self.write_thread.stats(),
            access: self.write_thread.rule().stats(),
        };
        if report.is_clean() {
            info!(uptime_ms = report.uptime_ms, "application stopped");
        } else {
            warn!(
                dispose_failures = report.dispose_failures.len(),
                leaked_roots = report.leaked_roots.len(),
                "application stopped with problems"
            );
        }
        Ok(report)
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("services", &self.service_names())
            .field("tree_size", &self.disposer.tree_size())
            .field("write_thread", &self.write_thread)
            .finish()
    }
}

fn ensure_vacant<T: 'static>(services: &HashMap<TypeId, ServiceSlot>) -> TetherResult<()> {
    if services.contains_key(&TypeId::of::<T>()) {
        return Err(TetherError::DuplicateKey {
            parent: "application services".to_string(),
            key: type_name::<T>().to_string(),
        });
    }
    Ok(())
}

fn insert_service<T: Send + Sync + 'static>(services: &mut HashMap<TypeId, ServiceSlot>, service: Arc<T>) {
    services.insert(
        TypeId::of::<T>(),
        ServiceSlot {
            name: type_name::<T>(),
            service,
        },
    );
    debug!(service = type_name::<T>(), "service registered");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tether_core::{OnDispose, PromiseStatus};

    struct Index {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Disposable for Index {
        fn dispose(&self) {
            self.log.lock().push("index");
        }
    }

    struct Clock;

    #[test]
    fn service_lookup() {
        let app = Application::start(AppConfig::default()).unwrap();
        app.register_service(Arc::new(Clock)).unwrap();
        assert!(app.service::<Clock>().is_ok());
        assert!(app.has_service::<Clock>());

        let missing = app.service::<String>().unwrap_err();
        assert!(matches!(missing, TetherError::ServiceNotRegistered(_)));
        assert!(missing.is_fatal());

        assert!(matches!(
            app.register_service(Arc::new(Clock)),
            Err(TetherError::DuplicateKey { .. })
        ));
        let report = app.shutdown().unwrap();
        assert_eq!(report.services, 1);
        assert!(report.is_clean());
    }

    #[test]
    fn disposable_services_torn_down_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let app = Application::start(AppConfig::default()).unwrap();
        app.register_disposable_service(Arc::new(Index { log: log.clone() }))
            .unwrap();
        let l = log.clone();
        let later = erase(&OnDispose::new("later", move || l.lock().push("later")));
        app.disposer().register(app.root(), &later).unwrap();

        let report = app.shutdown().unwrap();
        assert_eq!(*log.lock(), vec!["later", "index"]);
        assert!(report.leak_check_ran);
        assert!(report.is_clean());
    }

    #[test]
    fn rejected_disposable_service_stays_out_of_tree() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let app = Application::start(AppConfig::default()).unwrap();
        app.register_disposable_service(Arc::new(Index { log: log.clone() }))
            .unwrap();
        let second = Arc::new(Index { log: log.clone() });
        assert!(matches!(
            app.register_disposable_service(second.clone()),
            Err(TetherError::DuplicateKey { .. })
        ));
        assert_eq!(app.disposer().children_of(app.root()).len(), 1);

        app.shutdown().unwrap();
        assert_eq!(*log.lock(), vec!["index"]);
    }

    #[test]
    fn dispose_can_still_write_during_shutdown() {
        let app = Application::start(AppConfig::default()).unwrap();
        let wt = app.write_thread().clone();
        let flushed = Arc::new(Mutex::new(None));
        let f = flushed.clone();
        let flush = erase(&OnDispose::new("flush", move || {
            *f.lock() = Some(wt.run_and_wait(|| 99u32));
        }));
        app.disposer().register(app.root(), &flush).unwrap();

        let report = app.shutdown().unwrap();
        assert!(matches!(*flushed.lock(), Some(Ok(99))));
        assert_eq!(report.writes.completed, 1);
    }

    #[test]
    fn leaks_are_reported() {
        let app = Application::start(AppConfig::default()).unwrap();
        let stray = new_disposable("stray");
        let child = new_disposable("child");
        app.disposer().register(&stray, &child).unwrap();

        let report = app.shutdown().unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.leaked_roots, vec!["stray".to_string()]);
    }

    #[test]
    fn leak_check_can_be_disabled() {
        let config = AppConfig {
            leak_check_on_shutdown: false,
            ..AppConfig::default()
        };
        let app = Application::start(config).unwrap();
        let stray = new_disposable("stray");
        let child = new_disposable("child");
        app.disposer().register(&stray, &child).unwrap();

        let report = app.shutdown().unwrap();
        assert!(!report.leak_check_ran);
        assert!(report.is_clean());
    }

    #[test]
    fn cancel_on_dispose_links() {
        let app = Application::start(AppConfig::default()).unwrap();
        let scope = app.new_child("request").unwrap();

        let finished: AsyncPromise<u8> = AsyncPromise::new();
        app.cancel_on_dispose(&finished, &scope).unwrap();
        assert_eq!(app.disposer().children_of(&scope).len(), 1);
        finished.set_result(1);
        assert!(app.disposer().children_of(&scope).is_empty());

        let pending: AsyncPromise<u8> = AsyncPromise::new();
        app.cancel_on_dispose(&pending, &scope).unwrap();
        app.disposer().dispose(&scope, false).unwrap();
        assert_eq!(pending.status(), PromiseStatus::Cancelled);

        let late: AsyncPromise<u8> = AsyncPromise::new();
        app.cancel_on_dispose(&late, &scope).unwrap();
        assert!(late.is_cancelled());

        assert!(app.shutdown().unwrap().is_clean());
    }
}
