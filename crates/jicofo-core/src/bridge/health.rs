//! Per-bridge periodic health probe with one retry (component C5).
//!
//! Task lifecycle mirrors `registrar-core`'s `RegistrationManager`: a
//! `running` flag plus a stored `JoinHandle`, started on bridge-up and
//! cancelled on bridge-down so a restart never leaks a task.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::registry::BridgeRegistry;

/// Outcome of one `checkHealth` RPC (§6 item 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckOutcome {
    Ok,
    /// `condition` is the error condition string (e.g. `internal-server-error`).
    Error(String),
    Timeout,
}

/// §6 item 5: `checkHealth(bridgeJid, timeout) -> ok | error(condition) | timeout`.
#[async_trait::async_trait]
pub trait HealthCheckAdapter: Send + Sync {
    async fn check_health(&self, bridge_jid: &str, timeout: Duration) -> HealthCheckOutcome;

    /// Whether the bridge advertises the health-check capability at all.
    fn supports_health_check(&self, bridge_jid: &str) -> bool;
}

fn condition_is_fatal(condition: &str) -> bool {
    condition == "internal-server-error" || condition == "service-unavailable"
}

pub struct HealthCheckerConfig {
    pub interval: Duration,
    pub request_timeout: Duration,
    pub second_chance_delay: Duration,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        let interval = Duration::from_millis(10_000);
        Self {
            interval,
            request_timeout: Duration::from_millis(5_000),
            second_chance_delay: interval / 2,
        }
    }
}

/// Owns one periodic task per bridge.
pub struct HealthChecker<A: HealthCheckAdapter + 'static> {
    adapter: Arc<A>,
    registry: Arc<BridgeRegistry>,
    config: HealthCheckerConfig,
    tasks: DashMap<String, JoinHandle<()>>,
    running: Arc<RwLock<bool>>,
}

impl<A: HealthCheckAdapter + 'static> HealthChecker<A> {
    pub fn new(adapter: Arc<A>, registry: Arc<BridgeRegistry>, config: HealthCheckerConfig) -> Self {
        Self {
            adapter,
            registry,
            config,
            tasks: DashMap::new(),
            running: Arc::new(RwLock::new(true)),
        }
    }

    /// Starts the periodic probe for `bridge_jid`. Call on bridge-up.
    pub fn start_for_bridge(&self, bridge_jid: &str) {
        if self.tasks.contains_key(bridge_jid) {
            return;
        }
        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let running = self.running.clone();
        let interval = self.config.interval;
        let request_timeout = self.config.request_timeout;
        let second_chance_delay = self.config.second_chance_delay;
        let jid = bridge_jid.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !*running.read().await {
                    break;
                }
                run_probe(&*adapter, &registry, &jid, request_timeout, second_chance_delay).await;
            }
        });

        self.tasks.insert(bridge_jid.to_string(), handle);
    }

    /// Cancels the task for `bridge_jid`. Call on bridge-down.
    pub fn stop_for_bridge(&self, bridge_jid: &str) {
        if let Some((_, handle)) = self.tasks.remove(bridge_jid) {
            handle.abort();
        }
    }

    pub async fn shutdown(&self) {
        *self.running.write().await = false;
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// One fire of the periodic task: probe, and on no-reply, sleep the
/// second-chance delay and retry exactly once (§4.5, §8 S6).
async fn run_probe<A: HealthCheckAdapter>(
    adapter: &A,
    registry: &BridgeRegistry,
    bridge_jid: &str,
    request_timeout: Duration,
    second_chance_delay: Duration,
) {
    if !adapter.supports_health_check(bridge_jid) {
        return;
    }

    match adapter.check_health(bridge_jid, request_timeout).await {
        HealthCheckOutcome::Ok => {}
        HealthCheckOutcome::Error(condition) if condition_is_fatal(&condition) => {
            registry.report_health_check_failed(bridge_jid);
        }
        HealthCheckOutcome::Error(condition) => {
            tracing::warn!(bridge = bridge_jid, condition, "non-fatal health-check error");
        }
        HealthCheckOutcome::Timeout => {
            tokio::time::sleep(second_chance_delay).await;
            match adapter.check_health(bridge_jid, request_timeout).await {
                HealthCheckOutcome::Ok => {}
                HealthCheckOutcome::Error(condition) if condition_is_fatal(&condition) => {
                    registry.report_health_check_failed(bridge_jid);
                }
                HealthCheckOutcome::Error(condition) => {
                    tracing::warn!(bridge = bridge_jid, condition, "non-fatal health-check error on retry");
                }
                HealthCheckOutcome::Timeout => {
                    registry.report_health_check_failed(bridge_jid);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyAdapter {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl HealthCheckAdapter for FlakyAdapter {
        async fn check_health(&self, _bridge_jid: &str, _timeout: Duration) -> HealthCheckOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            HealthCheckOutcome::Timeout
        }

        fn supports_health_check(&self, _bridge_jid: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn timeout_then_retry_timeout_publishes_health_failed_once() {
        let registry = Arc::new(BridgeRegistry::new(Duration::from_millis(300_000)));
        registry.add_bridge("b1", None);
        let adapter = Arc::new(FlakyAdapter { calls: AtomicUsize::new(0) });
        let mut events = registry.subscribe();

        run_probe(&*adapter, &registry, "b1", Duration::from_millis(10), Duration::from_millis(10)).await;

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
        let event = events.try_recv().unwrap();
        assert!(matches!(event, crate::events::BridgeEvent::HealthCheckFailed { .. }));
        assert!(!registry.get("b1").unwrap().is_operational(Duration::from_millis(300_000)));
    }

    struct UnsupportedAdapter;

    #[async_trait::async_trait]
    impl HealthCheckAdapter for UnsupportedAdapter {
        async fn check_health(&self, _bridge_jid: &str, _timeout: Duration) -> HealthCheckOutcome {
            panic!("should not be called when capability is unsupported");
        }

        fn supports_health_check(&self, _bridge_jid: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn skips_probe_when_capability_unsupported() {
        let registry = Arc::new(BridgeRegistry::new(Duration::from_millis(300_000)));
        registry.add_bridge("b1", None);
        run_probe(&UnsupportedAdapter, &registry, "b1", Duration::from_millis(10), Duration::from_millis(10)).await;
        assert!(registry.get("b1").unwrap().is_operational(Duration::from_millis(300_000)));
    }

    #[tokio::test]
    async fn stop_for_bridge_aborts_task() {
        let registry = Arc::new(BridgeRegistry::new(Duration::from_millis(300_000)));
        registry.add_bridge("b1", None);
        let adapter = Arc::new(FlakyAdapter { calls: AtomicUsize::new(0) });
        let checker = HealthChecker::new(adapter, registry, HealthCheckerConfig {
            interval: Duration::from_millis(5),
            request_timeout: Duration::from_millis(5),
            second_chance_delay: Duration::from_millis(5),
        });

        checker.start_for_bridge("b1");
        assert_eq!(checker.active_task_count(), 1);
        checker.stop_for_bridge("b1");
        assert_eq!(checker.active_task_count(), 0);
    }
}
