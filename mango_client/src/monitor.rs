use crate::api::{HealthResponse, InferenceApi};
use crate::config::{BackendConfig, MonitorConfig};
use crate::error::ApiError;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const CONNECTIVITY_BUFFER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineReason {
    /// The health request ran past its deadline. The backend may be cold-starting.
    TimedOut,
    /// Connection refused or the host could not be resolved.
    Unreachable,
    /// The backend answered, but not with a usable health payload.
    BadResponse,
    /// The host reported that it lost network connectivity.
    NoConnectivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Availability {
    Unknown,
    Checking,
    OnlineWarm,
    OnlineCold,
    Offline(OfflineReason),
}

impl Availability {
    pub fn is_online(&self) -> bool {
        matches!(self, Availability::OnlineWarm | Availability::OnlineCold)
    }

    pub fn may_be_starting(&self) -> bool {
        matches!(self, Availability::Offline(OfflineReason::TimedOut))
    }
}

/// Advisory view of the backend. Nothing in the client is gated on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub availability: Availability,
    pub model_loaded: bool,
    pub last_check: Option<SystemTime>,
    pub error: Option<String>,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self {
            availability: Availability::Unknown,
            model_loaded: false,
            last_check: None,
            error: None,
        }
    }
}

impl ServerStatus {
    pub fn is_online(&self) -> bool {
        self.availability.is_online()
    }

    pub fn is_warm(&self) -> bool {
        self.availability == Availability::OnlineWarm
    }

    fn online(health: &HealthResponse) -> Self {
        let availability = if health.is_healthy() {
            Availability::OnlineWarm
        } else {
            Availability::OnlineCold
        };
        Self {
            availability,
            model_loaded: health.model_loaded,
            last_check: Some(SystemTime::now()),
            error: None,
        }
    }

    fn offline(reason: OfflineReason, error: String) -> Self {
        Self {
            availability: Availability::Offline(reason),
            model_loaded: false,
            last_check: Some(SystemTime::now()),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

fn classify_failure(err: &ApiError) -> ServerStatus {
    match err {
        ApiError::Timeout => ServerStatus::offline(
            OfflineReason::TimedOut,
            "Server not responding (may be starting up)".to_string(),
        ),
        ApiError::Network { .. } | ApiError::Cancelled => ServerStatus::offline(
            OfflineReason::Unreachable,
            "Cannot connect to server".to_string(),
        ),
        ApiError::Server { status, .. } => ServerStatus::offline(
            OfflineReason::BadResponse,
            format!("Server returned status {}", status),
        ),
        ApiError::Malformed(message) => ServerStatus::offline(
            OfflineReason::BadResponse,
            format!("Unexpected health response: {}", message),
        ),
    }
}

/// Polls the backend health route on a fixed interval and publishes the
/// result through a watch channel.
pub struct AvailabilityMonitor {
    api: Arc<dyn InferenceApi>,
    check_interval: Duration,
    recheck_delay: Duration,
    reconnect_delay: Duration,
    health_timeout: Duration,
    warmup_timeout: Duration,
    warmup_attempts: u32,
    status_tx: watch::Sender<ServerStatus>,
    connectivity_tx: mpsc::Sender<Connectivity>,
    connectivity_rx: Mutex<Option<mpsc::Receiver<Connectivity>>>,
}

impl AvailabilityMonitor {
    pub fn new(api: Arc<dyn InferenceApi>, monitor: &MonitorConfig, backend: &BackendConfig) -> Self {
        let (status_tx, _) = watch::channel(ServerStatus::default());
        let (connectivity_tx, connectivity_rx) = mpsc::channel(CONNECTIVITY_BUFFER);
        Self {
            api,
            check_interval: monitor.check_interval(),
            recheck_delay: monitor.recheck_delay(),
            reconnect_delay: monitor.reconnect_delay(),
            health_timeout: backend.health_check_timeout(),
            warmup_timeout: backend.warmup_timeout(),
            warmup_attempts: monitor.warmup_attempts.max(1),
            status_tx,
            connectivity_tx,
            connectivity_rx: Mutex::new(Some(connectivity_rx)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> ServerStatus {
        self.status_tx.borrow().clone()
    }

    /// Queues a connectivity change for the running monitor. Returns false if
    /// the monitor is not listening anymore.
    pub fn notify_connectivity(&self, event: Connectivity) -> bool {
        match self.connectivity_tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Dropping connectivity event {:?}: {}", event, e);
                false
            }
        }
    }

    /// Runs one health check. Always resolves within the health-check timeout.
    pub async fn check_now(&self) -> ServerStatus {
        self.status_tx
            .send_modify(|status| status.availability = Availability::Checking);

        let status = match tokio::time::timeout(self.health_timeout, self.api.health()).await {
            Ok(Ok(health)) => ServerStatus::online(&health),
            Ok(Err(err)) => {
                tracing::warn!("Health check failed: {}", err);
                classify_failure(&err)
            }
            Err(_) => {
                tracing::warn!("Health check timed out after {:?}", self.health_timeout);
                classify_failure(&ApiError::Timeout)
            }
        };

        tracing::debug!("Server availability: {:?}", status.availability);
        self.status_tx.send_replace(status.clone());
        status
    }

    /// Startup check. If the backend does not answer, hit the root route to
    /// wake it and check again, backing off between attempts.
    pub async fn warm_up(&self) -> ServerStatus {
        let mut status = self.check_now().await;
        let mut retry_delay = self.recheck_delay;

        for attempt in 1..=self.warmup_attempts {
            if status.is_online() {
                return status;
            }

            tracing::info!(
                "Backend not ready, sending warm-up request (attempt {}/{})",
                attempt,
                self.warmup_attempts
            );
            match tokio::time::timeout(self.warmup_timeout, self.api.wake()).await {
                Ok(Ok(())) => {
                    tokio::time::sleep(self.recheck_delay).await;
                    status = self.check_now().await;
                    continue;
                }
                Ok(Err(err)) => tracing::warn!("Warm-up request failed: {}", err),
                Err(_) => {
                    tracing::warn!("Warm-up request timed out after {:?}", self.warmup_timeout)
                }
            }

            if attempt < self.warmup_attempts {
                let jitter = rand::random::<f32>() * 0.2 + 0.9;
                tokio::time::sleep(retry_delay.mul_f32(jitter)).await;
                retry_delay = (retry_delay * 2).min(self.check_interval);
            }
        }
        status
    }

    fn mark_disconnected(&self) {
        tracing::warn!("Network connectivity lost");
        self.status_tx.send_replace(ServerStatus::offline(
            OfflineReason::NoConnectivity,
            "No internet connection".to_string(),
        ));
    }

    /// Drives the monitor until a shutdown signal arrives.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut connectivity_rx = self.connectivity_rx.lock().take();
        if connectivity_rx.is_none() {
            tracing::warn!("Availability monitor is already running");
            return;
        }

        if until_shutdown(&mut shutdown_rx, self.warm_up()).await.is_none() {
            return;
        }

        let mut ticker = interval_at(Instant::now() + self.check_interval, self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    tracing::info!("Availability monitor received shutdown signal");
                    break;
                }
                event = recv_connectivity(&mut connectivity_rx) => match event {
                    Some(Connectivity::Offline) => self.mark_disconnected(),
                    Some(Connectivity::Online) => {
                        tracing::info!("Network connectivity restored, re-checking server");
                        let delay = self.reconnect_delay;
                        if !self
                            .interruptible_check(delay, &mut shutdown_rx, &mut connectivity_rx)
                            .await
                        {
                            break;
                        }
                        ticker.reset();
                    }
                    None => connectivity_rx = None,
                },
                _ = ticker.tick() => {
                    let delay = Duration::ZERO;
                    if !self
                        .interruptible_check(delay, &mut shutdown_rx, &mut connectivity_rx)
                        .await
                    {
                        break;
                    }
                }
            }
        }
        tracing::info!("Availability monitor stopped");
    }

    async fn delayed_check(&self, delay: Duration) -> ServerStatus {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_now().await
    }

    /// Runs a health check that connectivity events can interrupt: going
    /// offline abandons it, coming back online restarts it after the
    /// reconnect delay. Returns false on shutdown.
    async fn interruptible_check(
        &self,
        delay: Duration,
        shutdown_rx: &mut broadcast::Receiver<()>,
        connectivity_rx: &mut Option<mpsc::Receiver<Connectivity>>,
    ) -> bool {
        let check = self.delayed_check(delay);
        tokio::pin!(check);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    tracing::info!("Availability monitor received shutdown signal");
                    return false;
                }
                event = recv_connectivity(connectivity_rx) => match event {
                    Some(Connectivity::Offline) => {
                        self.mark_disconnected();
                        return true;
                    }
                    Some(Connectivity::Online) => {
                        check.set(self.delayed_check(self.reconnect_delay));
                    }
                    None => *connectivity_rx = None,
                },
                _ = &mut check => return true,
            }
        }
    }
}

async fn recv_connectivity(rx: &mut Option<mpsc::Receiver<Connectivity>>) -> Option<Connectivity> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn until_shutdown<F: Future>(
    shutdown_rx: &mut broadcast::Receiver<()>,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown_rx.recv() => None,
        output = fut => Some(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FrameResponse, PendingUpload, PredictResponse, VideoResponse};
    use crate::bounding_box::LabelCounts;
    use crate::cancel::CancelToken;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy)]
    enum Health {
        Warm,
        Cold,
        Refused,
        Hang,
    }

    struct HealthApi {
        script: Mutex<VecDeque<Health>>,
        fallback: Health,
        health_calls: AtomicUsize,
        wake_calls: AtomicUsize,
        refuse_wake: bool,
    }

    impl HealthApi {
        fn new(script: Vec<Health>, fallback: Health) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                health_calls: AtomicUsize::new(0),
                wake_calls: AtomicUsize::new(0),
                refuse_wake: false,
            })
        }
    }

    #[async_trait]
    impl InferenceApi for HealthApi {
        async fn health(&self) -> Result<HealthResponse, ApiError> {
            self.health_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front().unwrap_or(self.fallback);
            match next {
                Health::Warm => Ok(HealthResponse {
                    status: "healthy".into(),
                    model_loaded: true,
                }),
                Health::Cold => Ok(HealthResponse {
                    status: "loading".into(),
                    model_loaded: false,
                }),
                Health::Refused => Err(ApiError::Network {
                    message: "connection refused".into(),
                    refused: true,
                }),
                Health::Hang => std::future::pending().await,
            }
        }

        async fn wake(&self) -> Result<(), ApiError> {
            self.wake_calls.fetch_add(1, Ordering::SeqCst);
            if self.refuse_wake {
                return Err(ApiError::Network {
                    message: "connection refused".into(),
                    refused: true,
                });
            }
            Ok(())
        }

        async fn predict(
            &self,
            _upload: PendingUpload,
            _cancel: &CancelToken,
        ) -> Result<PredictResponse, ApiError> {
            unimplemented!()
        }

        async fn predict_frame(&self, _upload: PendingUpload) -> Result<FrameResponse, ApiError> {
            unimplemented!()
        }

        async fn predict_video(&self, _upload: PendingUpload) -> Result<VideoResponse, ApiError> {
            unimplemented!()
        }

        async fn fetch_image(
            &self,
            _image_url: &str,
            _cancel: &CancelToken,
        ) -> Result<Bytes, ApiError> {
            unimplemented!()
        }

        async fn recommendation(
            &self,
            _counts: LabelCounts,
            _cancel: &CancelToken,
        ) -> Result<String, ApiError> {
            unimplemented!()
        }

        async fn chat(&self, _question: &str) -> Result<String, ApiError> {
            unimplemented!()
        }
    }

    fn monitor(api: Arc<HealthApi>, check_interval_ms: u64) -> Arc<AvailabilityMonitor> {
        monitor_with_reconnect_delay(api, check_interval_ms, 5)
    }

    fn monitor_with_reconnect_delay(
        api: Arc<HealthApi>,
        check_interval_ms: u64,
        reconnect_delay_ms: u64,
    ) -> Arc<AvailabilityMonitor> {
        let monitor_config = MonitorConfig {
            check_interval_ms,
            recheck_delay_ms: 5,
            reconnect_delay_ms,
            warmup_attempts: 2,
        };
        let mut backend = BackendConfig::new("http://127.0.0.1:9");
        backend.health_check_timeout_ms = 50;
        backend.warmup_timeout_ms = 50;
        Arc::new(AvailabilityMonitor::new(api, &monitor_config, &backend))
    }

    #[tokio::test]
    async fn test_hung_health_check_resolves_to_timeout() {
        let monitor = monitor(HealthApi::new(vec![], Health::Hang), 60_000);
        assert_eq!(monitor.status().availability, Availability::Unknown);

        let checking = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.check_now().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(monitor.status().availability, Availability::Checking);

        let status = tokio::time::timeout(Duration::from_millis(500), checking)
            .await
            .expect("health check must not hang")
            .unwrap();
        assert_eq!(
            status.availability,
            Availability::Offline(OfflineReason::TimedOut)
        );
        assert!(status.availability.may_be_starting());
        assert_eq!(
            status.error.as_deref(),
            Some("Server not responding (may be starting up)")
        );
    }

    #[tokio::test]
    async fn test_warm_and_cold_backends() {
        let monitor = monitor(HealthApi::new(vec![Health::Warm, Health::Cold], Health::Warm), 60_000);

        let warm = monitor.check_now().await;
        assert!(warm.is_warm());
        assert!(warm.model_loaded);
        assert!(warm.last_check.is_some());

        let cold = monitor.check_now().await;
        assert_eq!(cold.availability, Availability::OnlineCold);
        assert!(cold.is_online());
        assert!(!cold.is_warm());
    }

    #[tokio::test]
    async fn test_refusal_is_not_reported_as_starting_up() {
        let monitor = monitor(HealthApi::new(vec![], Health::Refused), 60_000);
        let status = monitor.check_now().await;

        assert_eq!(
            status.availability,
            Availability::Offline(OfflineReason::Unreachable)
        );
        assert!(!status.availability.may_be_starting());
        assert_eq!(status.error.as_deref(), Some("Cannot connect to server"));
    }

    #[tokio::test]
    async fn test_warm_up_wakes_backend_and_rechecks() {
        let api = HealthApi::new(vec![Health::Refused], Health::Warm);
        let monitor = monitor(api.clone(), 60_000);

        let status = monitor.warm_up().await;
        assert!(status.is_warm());
        assert_eq!(api.wake_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.health_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_warm_up_gives_up_after_configured_attempts() {
        let api = Arc::new(HealthApi {
            script: Mutex::new(VecDeque::new()),
            fallback: Health::Refused,
            health_calls: AtomicUsize::new(0),
            wake_calls: AtomicUsize::new(0),
            refuse_wake: true,
        });
        let monitor = monitor(api.clone(), 60_000);

        let status = monitor.warm_up().await;
        assert_eq!(
            status.availability,
            Availability::Offline(OfflineReason::Unreachable)
        );
        assert_eq!(api.wake_calls.load(Ordering::SeqCst), 2);
        assert_eq!(api.health_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_warm_up_skips_wake_when_online() {
        let api = HealthApi::new(vec![], Health::Warm);
        let monitor = monitor(api.clone(), 60_000);

        monitor.warm_up().await;
        assert_eq!(api.wake_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connectivity_events_drive_rechecks() {
        let api = HealthApi::new(vec![], Health::Warm);
        let monitor = monitor(api.clone(), 60_000);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut status_rx = monitor.subscribe();

        let handle = tokio::spawn(monitor.clone().run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(monitor.status().is_warm());
        let calls_after_startup = api.health_calls.load(Ordering::SeqCst);

        assert!(monitor.notify_connectivity(Connectivity::Offline));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            monitor.status().availability,
            Availability::Offline(OfflineReason::NoConnectivity)
        );

        assert!(monitor.notify_connectivity(Connectivity::Online));
        tokio::time::timeout(Duration::from_millis(500), async {
            while !status_rx.borrow_and_update().is_warm() {
                status_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("monitor should re-check after reconnecting");
        assert_eq!(
            api.health_calls.load(Ordering::SeqCst),
            calls_after_startup + 1
        );

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("monitor should stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_going_offline_abandons_pending_reconnect_check() {
        let api = HealthApi::new(vec![], Health::Warm);
        let monitor = monitor_with_reconnect_delay(api.clone(), 60_000, 200);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(monitor.clone().run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(monitor.status().is_warm());
        let calls_after_startup = api.health_calls.load(Ordering::SeqCst);

        assert!(monitor.notify_connectivity(Connectivity::Online));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(monitor.notify_connectivity(Connectivity::Offline));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            monitor.status().availability,
            Availability::Offline(OfflineReason::NoConnectivity)
        );

        // Well past the reconnect delay: the abandoned check never ran.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            monitor.status().availability,
            Availability::Offline(OfflineReason::NoConnectivity)
        );
        assert_eq!(api.health_calls.load(Ordering::SeqCst), calls_after_startup);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("monitor should stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_periodic_checks_follow_interval() {
        let api = HealthApi::new(vec![], Health::Cold);
        let monitor = monitor(api.clone(), 20);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(monitor.clone().run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(110)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        // Cold backends count as online, so warm-up does not wake them.
        assert_eq!(api.wake_calls.load(Ordering::SeqCst), 0);
        assert!(api.health_calls.load(Ordering::SeqCst) >= 3);
    }
}
