//! The top-level `Agent` facade: wires the Egress Client, Request Tracer,
//! and every collector behind a single `configure`/`start`/`stop` surface
//! gated by [`apm_telemetry::CollectorToggles`].

use std::sync::Arc;
use std::time::Duration;

use apm_core::CallStack;
use apm_telemetry::{AgentConfig, EgressClient};
use tokio::task::JoinHandle;

use crate::collectors::cpu_profile::CpuProfileCollector;
use crate::collectors::db::DbCollector;
use crate::collectors::deprecated::DeprecatedApiCollector;
use crate::collectors::dns::DnsCollector;
use crate::collectors::env::EnvCollector;
use crate::collectors::job::{JobMonitor, NullJobAdapter};
use crate::collectors::log::LogCollector;
use crate::collectors::observer::ObserverCollector;
use crate::collectors::outbound_http::OutboundHttpCollector;
use crate::collectors::publication::PublicationCollector;
use crate::collectors::queue_wait::QueueWaitCollector;
use crate::collectors::system_metrics::SystemMetricsCollector;
use crate::collector::{Collector, LifecycleGuard};
use crate::error::AgentResult;
use crate::tracer::RequestTracer;

/// The assembled in-process APM agent (spec §1's overall system). Holds
/// every collector and the egress client, none of which do anything until
/// [`Agent::start`] is called.
#[derive(Clone)]
pub struct Agent {
    config: Arc<AgentConfig>,
    egress: EgressClient,
    call_stack: CallStack,
    tracer: RequestTracer,
    queue_wait: Arc<QueueWaitCollector>,
    db: DbCollector,
    observer: Arc<ObserverCollector>,
    dns: Arc<DnsCollector>,
    env: Arc<EnvCollector>,
    deprecated_apis: Arc<DeprecatedApiCollector>,
    outbound_http: Arc<OutboundHttpCollector>,
    publications: Arc<PublicationCollector>,
    jobs: Arc<JobMonitor<NullJobAdapter>>,
    cpu_profile: Arc<CpuProfileCollector>,
    log: Arc<LogCollector>,
    system_metrics: Arc<SystemMetricsCollector>,
    background: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
    guard: Arc<LifecycleGuard>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").field("endpoint", &self.config.endpoint).finish()
    }
}

impl Agent {
    /// Validate `config` and assemble an agent. Fails fast on invalid
    /// configuration (spec §7); nothing is started yet.
    pub fn configure(config: AgentConfig) -> AgentResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let egress = EgressClient::new((*config).clone())?;
        let call_stack = CallStack::new();
        let queue_wait = Arc::new(QueueWaitCollector::new());
        let tracer = RequestTracer::new(call_stack.clone(), egress.clone(), config.clone(), queue_wait.clone());
        let app_version = if config.app_version.is_empty() { None } else { Some(config.app_version.clone()) };

        Ok(Self {
            config,
            egress,
            call_stack,
            tracer,
            queue_wait,
            db: DbCollector::default(),
            observer: Arc::new(ObserverCollector::new()),
            dns: Arc::new(DnsCollector::new()),
            env: Arc::new(EnvCollector::new(config.host.clone(), app_version)),
            deprecated_apis: Arc::new(DeprecatedApiCollector::new()),
            outbound_http: Arc::new(OutboundHttpCollector::new()),
            publications: Arc::new(PublicationCollector::new()),
            jobs: Arc::new(JobMonitor::new(NullJobAdapter)),
            cpu_profile: Arc::new(CpuProfileCollector::default()),
            log: Arc::new(LogCollector::new()),
            system_metrics: Arc::new(SystemMetricsCollector::new()),
            background: Arc::new(parking_lot::Mutex::new(Vec::new())),
            guard: Arc::new(LifecycleGuard::default()),
        })
    }

    /// The Request Tracer, for wrapping handlers.
    #[must_use]
    pub fn tracer(&self) -> &RequestTracer {
        &self.tracer
    }

    /// The process-wide Queue Wait Collector, for the host integration to
    /// stamp inbound messages against.
    #[must_use]
    pub fn queue_wait(&self) -> &Arc<QueueWaitCollector> {
        &self.queue_wait
    }

    /// Start the egress client and every enabled collector, plus the
    /// background sweep/emission timers (spec §4.4). Idempotent: a second
    /// call while already running is a no-op logged at debug level, the
    /// same contract every individual collector's `start()` already
    /// honors — otherwise the background timers below would be spawned
    /// twice, doubling sweep/emit frequency.
    pub fn start(&self) {
        if !self.guard.begin_start() {
            tracing::debug!("agent already started");
            return;
        }

        self.egress.start();

        let toggles = self.config.collectors;
        if toggles.database {
            self.db.start();
        }
        if toggles.queue_wait {
            self.queue_wait.start();
            self.spawn_sweep(self.queue_wait.clone(), |c| c.sweep(), self.config.intervals.message_cache_sweep);
        }
        if toggles.observer {
            self.observer.start();
            self.spawn_sweep(self.observer.clone(), |c| c.sweep(), self.config.intervals.observer);
        }
        if toggles.dns {
            self.dns.start();
            self.spawn_emit(self.dns.clone(), self.egress.clone(), |c, e| c.emit(e), self.config.intervals.system_metrics);
        }
        if toggles.env {
            self.env.start();
            self.spawn_emit(self.env.clone(), self.egress.clone(), |c, e| c.emit(e), self.config.intervals.system_metrics);
        }
        if toggles.deprecated_apis {
            self.deprecated_apis.start();
            self.spawn_emit(self.deprecated_apis.clone(), self.egress.clone(), |c, e| c.emit(e), self.config.intervals.system_metrics);
        }
        if toggles.outbound_http {
            self.outbound_http.start();
            self.spawn_emit(self.outbound_http.clone(), self.egress.clone(), |c, e| c.emit(e), self.config.intervals.system_metrics);
        }
        if toggles.publications {
            self.publications.start();
            self.spawn_emit(self.publications.clone(), self.egress.clone(), |c, e| c.emit(e), self.config.intervals.system_metrics);
        }
        if toggles.jobs {
            self.jobs.start();
            self.spawn_emit(self.jobs.clone(), self.egress.clone(), |c, e| c.emit(e), self.config.intervals.system_metrics);
        }
        if toggles.cpu_profile {
            self.cpu_profile.start();
        }
        if toggles.log {
            self.log.start();
            self.spawn_emit(self.log.clone(), self.egress.clone(), |c, e| c.emit(e), self.config.intervals.system_metrics);
        }

        // Resource metrics are kept regardless of `CollectorToggles` (spec
        // §4.2's "errors, system metrics, and operational counters are
        // always kept").
        self.system_metrics.start();
        self.spawn_emit(self.system_metrics.clone(), self.egress.clone(), |c, e| c.emit(e), self.config.intervals.system_metrics);

        let call_stack = self.call_stack.clone();
        let interval = self.config.intervals.call_stack_sweep;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                call_stack.sweep_stale();
            }
        });
        self.background.lock().push(handle);
    }

    fn spawn_sweep<T: Send + Sync + 'static>(&self, target: Arc<T>, sweep: impl Fn(&T) + Send + Sync + 'static, interval: Duration) {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                sweep(&target);
            }
        });
        self.background.lock().push(handle);
    }

    fn spawn_emit<T: Send + Sync + 'static>(
        &self,
        target: Arc<T>,
        egress: EgressClient,
        emit: impl Fn(&T, &EgressClient) + Send + Sync + 'static,
        interval: Duration,
    ) {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                emit(&target, &egress);
            }
        });
        self.background.lock().push(handle);
    }

    /// Stop every collector and the egress client, cancel all background
    /// timers (spec §6's operator contract: the host calls this from its
    /// shutdown path). Idempotent, matching `start()`.
    pub fn stop(&self) {
        if !self.guard.begin_stop() {
            tracing::debug!("agent already stopped");
            return;
        }

        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        self.db.stop();
        self.queue_wait.stop();
        self.observer.stop();
        self.dns.stop();
        self.env.stop();
        self.deprecated_apis.stop();
        self.outbound_http.stop();
        self.publications.stop();
        self.jobs.stop();
        self.cpu_profile.stop();
        self.log.stop();
        self.system_metrics.stop();
        self.egress.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn configure_rejects_missing_api_key() {
        let config = AgentConfig::builder().build().unwrap_err();
        let _ = config;
    }

    #[tokio::test]
    async fn start_stop_is_idempotent_across_all_collectors() {
        let config = AgentConfig::builder().api_key("k").endpoint("http://127.0.0.1:1").build().unwrap();
        let agent = Agent::configure(config).unwrap();
        agent.start();
        agent.start();
        agent.stop();
        agent.stop();
    }

    #[tokio::test]
    async fn second_start_does_not_double_the_background_timers() {
        let config = AgentConfig::builder().api_key("k").endpoint("http://127.0.0.1:1").build().unwrap();
        let agent = Agent::configure(config).unwrap();
        agent.start();
        let count_after_first = agent.background.lock().len();
        agent.start();
        let count_after_second = agent.background.lock().len();
        assert_eq!(count_after_first, count_after_second);
        agent.stop();
    }
}
