//! Registry of targets, keyed by target id and created lazily.

use crate::target::{LeaseObserver, Target, TargetConfig};
use crate::token::{TokenEntry, TokenTable};
use crate::{CoreError, read, write};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::runtime::Handle;
use tracing::info;

/// Owns every `Target` and the single `TokenTable` they share, so a bare
/// token is resolvable without knowing its target in advance.
///
/// Targets are never removed from the registry; `shutdown` tears them all
/// down in place.
pub struct TargetManager {
    config: TargetConfig,
    tokens: Arc<TokenTable>,
    runtime: Handle,
    observer: Option<Arc<dyn LeaseObserver>>,
    targets: RwLock<HashMap<String, Arc<Target>>>,
}

impl fmt::Debug for TargetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetManager")
            .field("config", &self.config)
            .field("targets", &read(&self.targets).len())
            .field("tokens", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

impl TargetManager {
    /// Expiration timers of every target are spawned on `runtime`.
    pub fn new(config: TargetConfig, runtime: Handle) -> Self {
        Self {
            config,
            tokens: Arc::new(TokenTable::new()),
            runtime,
            observer: None,
            targets: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LeaseObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn tokens(&self) -> &Arc<TokenTable> {
        &self.tokens
    }

    pub fn get_or_create_target(&self, target_id: &str) -> Arc<Target> {
        if let Some(target) = read(&self.targets).get(target_id) {
            return target.clone();
        }
        write(&self.targets)
            .entry(target_id.to_string())
            .or_insert_with(|| {
                info!(target_id, "target created");
                Target::new(
                    target_id,
                    self.config.clone(),
                    self.tokens.clone(),
                    self.runtime.clone(),
                    self.observer.clone(),
                )
            })
            .clone()
    }

    /// Lookup without creation.
    pub fn target(&self, target_id: &str) -> Option<Arc<Target>> {
        read(&self.targets).get(target_id).cloned()
    }

    pub fn add_stream_to_target(
        &self,
        target_id: &str,
        stream_id: &str,
        priority: f64,
    ) -> Result<(), CoreError> {
        self.get_or_create_target(target_id)
            .add_stream(stream_id, priority)
    }

    pub fn find_lease(&self, token: &str) -> Result<TokenEntry, CoreError> {
        self.tokens.find(token)
    }

    /// Target ids in sorted order.
    pub fn target_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.targets).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Tear down every target. The registry lock is released before any
    /// target lock is taken.
    pub fn shutdown(&self) {
        let targets: Vec<Arc<Target>> = read(&self.targets).values().cloned().collect();
        for target in targets {
            target.die();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SessionSnapshot;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::time::Duration;

    fn manager(expiration: Duration) -> TargetManager {
        TargetManager::new(TargetConfig { expiration }, Handle::current())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn targets_are_created_once() {
        let manager = manager(Duration::from_secs(60));
        let first = manager.get_or_create_target("t-1");
        let second = manager.get_or_create_target("t-1");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.target("t-2").is_none());
        manager
            .add_stream_to_target("t-2", "s-1", 0.0)
            .expect("add creates target");
        assert_eq!(manager.target_ids(), vec!["t-1", "t-2"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tokens_resolve_across_targets() {
        let manager = manager(Duration::from_secs(60));
        manager.add_stream_to_target("t-a", "s-a", 0.0).expect("add");
        manager.add_stream_to_target("t-b", "s-b", 0.0).expect("add");
        let a = manager
            .get_or_create_target("t-a")
            .activate_stream("donor", "openmm")
            .expect("activate");
        let b = manager
            .get_or_create_target("t-b")
            .activate_stream("donor", "openmm")
            .expect("activate");

        let resolved = manager.find_lease(&a.token).expect("resolves");
        assert_eq!((resolved.target_id.as_str(), resolved.stream_id.as_str()), ("t-a", "s-a"));
        let resolved = manager.find_lease(&b.token).expect("resolves");
        assert_eq!((resolved.target_id.as_str(), resolved.stream_id.as_str()), ("t-b", "s-b"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_activation_is_a_bijection() {
        let manager = manager(Duration::from_secs(60));
        let queued: BTreeSet<String> = (0..32).map(|i| format!("s-{i:02}")).collect();
        for id in &queued {
            manager.add_stream_to_target("t-1", id, 0.0).expect("add");
        }
        let target = manager.get_or_create_target("t-1");

        let leases = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for i in 0..queued.len() {
                let (target, leases) = (&target, &leases);
                scope.spawn(move || {
                    let lease = target
                        .activate_stream(&format!("donor-{i}"), "openmm")
                        .expect("one stream per caller");
                    leases.lock().expect("lock").push(lease);
                });
            }
        });

        let leases = leases.into_inner().expect("lock");
        let streams: BTreeSet<String> = leases.iter().map(|l| l.stream_id.clone()).collect();
        let tokens: BTreeSet<String> = leases.iter().map(|l| l.token.clone()).collect();
        assert_eq!(streams, queued);
        assert_eq!(tokens.len(), queued.len());
        for lease in &leases {
            assert_eq!(
                manager.find_lease(&lease.token).expect("resolves").stream_id,
                lease.stream_id
            );
        }
        assert!(target.inactive_streams().expect("alive").is_empty());
    }

    #[derive(Default)]
    struct Recorder {
        expired: Mutex<Vec<(String, String)>>,
    }

    impl LeaseObserver for Recorder {
        fn lease_expired(&self, target_id: &str, stream_id: &str, _snapshot: &SessionSnapshot) {
            self.expired
                .lock()
                .expect("lock")
                .push((target_id.to_string(), stream_id.to_string()));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn observer_hears_expirations_only() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager(Duration::from_millis(150)).with_observer(recorder.clone());
        manager.add_stream_to_target("t-1", "s-1", 0.0).expect("add");
        manager.add_stream_to_target("t-1", "s-2", 0.0).expect("add");
        let target = manager.get_or_create_target("t-1");
        let first = target.activate_stream("donor", "openmm").expect("activate");
        target.activate_stream("donor", "openmm").expect("activate");
        target.deactivate_stream(&first.stream_id).expect("stop");

        tokio::time::sleep(Duration::from_millis(600)).await;

        let expired = recorder.expired.lock().expect("lock").clone();
        assert_eq!(expired.len(), 1);
        assert_ne!(expired[0].1, first.stream_id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_kills_every_target() {
        let manager = manager(Duration::from_secs(60));
        manager.add_stream_to_target("t-1", "s-1", 0.0).expect("add");
        manager.add_stream_to_target("t-2", "s-2", 0.0).expect("add");
        manager.shutdown();
        for id in manager.target_ids() {
            let target = manager.target(&id).expect("registered");
            assert!(!target.is_alive());
        }
    }
}
