use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use coordinator_domain::events::CoordinationEvent;
use coordinator_domain::ports::EventBus;
use coordinator_errors::{CoordinationError, CoordinationResult};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - calls are blocked
    Open,
    /// Circuit is half-open - testing if the operation has recovered
    HalfOpen,
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Number of consecutive failures
    pub consecutive_failures: usize,
    /// Number of consecutive successes
    pub consecutive_successes: usize,
    /// Total calls made
    pub total_calls: u64,
    /// Total successful calls
    pub successful_calls: u64,
    /// Total failed calls
    pub failed_calls: u64,
    /// Calls rejected while open or over the half-open probe limit
    pub rejected_calls: u64,
    /// Probe calls currently in flight during half-open
    pub half_open_probes: usize,
    /// Last failure time
    pub last_failure_time: Option<Instant>,
    /// Last state change time
    pub last_state_change: Instant,
}

impl CircuitBreakerStats {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            half_open_probes: 0,
            last_failure_time: None,
            last_state_change: Instant::now(),
        }
    }

    /// Calculate failure rate
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failed_calls as f64 / self.total_calls as f64
        }
    }
}

/// Serializable per-breaker summary for aggregate metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSummary {
    pub name: String,
    pub state: CircuitState,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub consecutive_failures: usize,
}

/// Circuit breaker - isolates a failing operation until it is likely to
/// succeed again, so downstream failures do not cascade.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    stats: Arc<RwLock<CircuitBreakerStats>>,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for a named operation
    pub fn new<S: Into<String>>(name: S, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            stats: Arc::new(RwLock::new(CircuitBreakerStats::new())),
            event_bus: None,
        }
    }

    /// Create a breaker that publishes `circuit:opened` / `circuit:closed`
    pub fn with_event_bus<S: Into<String>>(
        name: S,
        config: CircuitBreakerConfig,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            stats: Arc::new(RwLock::new(CircuitBreakerStats::new())),
            event_bus: Some(event_bus),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// Rejected calls fail with `CircuitBreakerOpen` without invoking the
    /// operation; other errors are re-thrown unchanged.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> CoordinationResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CoordinationResult<T>>,
    {
        self.try_acquire().await?;

        match operation().await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(error) => {
                self.record_failure().await;
                Err(error)
            }
        }
    }

    /// Check if the call may proceed, transitioning Open -> HalfOpen when
    /// the open timeout has elapsed.
    async fn try_acquire(&self) -> CoordinationResult<()> {
        let mut stats = self.stats.write().await;

        match stats.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if stats.last_state_change.elapsed() >= self.config.timeout {
                    debug!(breaker = %self.name, "熔断器超时窗口结束，进入半开态");
                    stats.state = CircuitState::HalfOpen;
                    stats.last_state_change = Instant::now();
                    stats.consecutive_successes = 0;
                    stats.half_open_probes = 1;
                    Ok(())
                } else {
                    stats.rejected_calls += 1;
                    Err(CoordinationError::CircuitBreakerOpen {
                        name: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if stats.half_open_probes < self.config.half_open_limit {
                    stats.half_open_probes += 1;
                    Ok(())
                } else {
                    stats.rejected_calls += 1;
                    Err(CoordinationError::CircuitBreakerOpen {
                        name: self.name.clone(),
                    })
                }
            }
        }
    }

    /// Record successful call
    async fn record_success(&self) {
        let transition = {
            let mut stats = self.stats.write().await;

            stats.total_calls += 1;
            stats.successful_calls += 1;
            stats.consecutive_successes += 1;
            stats.consecutive_failures = 0;

            if stats.state == CircuitState::HalfOpen {
                stats.half_open_probes = stats.half_open_probes.saturating_sub(1);
                if stats.consecutive_successes >= self.config.success_threshold {
                    stats.state = CircuitState::Closed;
                    stats.last_state_change = Instant::now();
                    stats.half_open_probes = 0;
                    Some(CircuitState::Closed)
                } else {
                    None
                }
            } else {
                None
            }
        };

        if transition.is_some() {
            debug!(breaker = %self.name, "熔断器恢复，回到闭合态");
            self.emit_transition(CircuitState::Closed).await;
        }
    }

    /// Record failed call
    async fn record_failure(&self) {
        let transition = {
            let mut stats = self.stats.write().await;

            stats.total_calls += 1;
            stats.failed_calls += 1;
            stats.consecutive_failures += 1;
            stats.consecutive_successes = 0;
            stats.last_failure_time = Some(Instant::now());

            match stats.state {
                CircuitState::Closed => {
                    if stats.consecutive_failures >= self.config.failure_threshold {
                        stats.state = CircuitState::Open;
                        stats.last_state_change = Instant::now();
                        Some(CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    // 半开态下任何失败立即重新熔断并重置超时窗口
                    stats.half_open_probes = stats.half_open_probes.saturating_sub(1);
                    stats.state = CircuitState::Open;
                    stats.last_state_change = Instant::now();
                    Some(CircuitState::Open)
                }
                // 迟到的半开探测结果，状态已经是Open，只计数
                CircuitState::Open => None,
            }
        };

        if transition.is_some() {
            warn!(breaker = %self.name, "连续失败达到阈值，熔断器打开");
            self.emit_transition(CircuitState::Open).await;
        }
    }

    async fn emit_transition(&self, state: CircuitState) {
        if let Some(bus) = &self.event_bus {
            let event = match state {
                CircuitState::Open => CoordinationEvent::CircuitOpened {
                    name: self.name.clone(),
                    occurred_at: Utc::now(),
                },
                CircuitState::Closed => CoordinationEvent::CircuitClosed {
                    name: self.name.clone(),
                    occurred_at: Utc::now(),
                },
                CircuitState::HalfOpen => return,
            };
            if let Err(e) = bus.publish(event).await {
                warn!(breaker = %self.name, "熔断器事件发布失败: {}", e);
            }
        }
    }

    /// Get current circuit state.
    ///
    /// An open breaker whose timeout has elapsed reports HalfOpen even
    /// before the first probe call performs the actual transition.
    pub async fn state(&self) -> CircuitState {
        let stats = self.stats.read().await;
        if stats.state == CircuitState::Open
            && stats.last_state_change.elapsed() >= self.config.timeout
        {
            return CircuitState::HalfOpen;
        }
        stats.state
    }

    /// Get circuit breaker statistics
    pub async fn stats(&self) -> CircuitBreakerStats {
        self.stats.read().await.clone()
    }

    /// Reset circuit breaker to closed state
    pub async fn reset(&self) {
        let mut stats = self.stats.write().await;
        *stats = CircuitBreakerStats::new();
    }

    /// Force open circuit (for testing or maintenance)
    pub async fn force_open(&self) {
        let mut stats = self.stats.write().await;
        stats.state = CircuitState::Open;
        stats.last_state_change = Instant::now();
    }

    /// Force close circuit (for testing or recovery)
    pub async fn force_close(&self) {
        let mut stats = self.stats.write().await;
        stats.state = CircuitState::Closed;
        stats.last_state_change = Instant::now();
        stats.consecutive_failures = 0;
        stats.half_open_probes = 0;
    }
}

/// Circuit breaker manager - lazily creates one named breaker per protected
/// operation and exposes aggregate metrics. Breakers are never destroyed
/// except by explicit reset.
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            event_bus: None,
        }
    }

    pub fn with_event_bus(default_config: CircuitBreakerConfig, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            event_bus: Some(event_bus),
        }
    }

    /// Get the breaker for a named operation, creating it on first use
    pub async fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(name) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = %name, "创建新的熔断器");
                let breaker = match &self.event_bus {
                    Some(bus) => CircuitBreaker::with_event_bus(
                        name,
                        self.default_config.clone(),
                        bus.clone(),
                    ),
                    None => CircuitBreaker::new(name, self.default_config.clone()),
                };
                Arc::new(breaker)
            })
            .clone()
    }

    /// Execute an operation through its named breaker
    pub async fn execute<F, Fut, T>(&self, name: &str, operation: F) -> CoordinationResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CoordinationResult<T>>,
    {
        let breaker = self.get_or_create(name).await;
        breaker.execute(operation).await
    }

    pub async fn get_state(&self, name: &str) -> Option<CircuitState> {
        let breaker = {
            let breakers = self.breakers.read().await;
            breakers.get(name).cloned()
        };
        match breaker {
            Some(breaker) => Some(breaker.state().await),
            None => None,
        }
    }

    /// Names of breakers currently not closed
    pub async fn open_breakers(&self) -> Vec<String> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        let mut open = Vec::new();
        for breaker in breakers {
            if breaker.state().await != CircuitState::Closed {
                open.push(breaker.name().to_string());
            }
        }
        open.sort();
        open
    }

    /// Aggregate per-breaker summaries, sorted by name
    pub async fn summaries(&self) -> Vec<CircuitBreakerSummary> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            let stats = breaker.stats().await;
            summaries.push(CircuitBreakerSummary {
                name: breaker.name().to_string(),
                state: stats.state,
                total_calls: stats.total_calls,
                successful_calls: stats.successful_calls,
                failed_calls: stats.failed_calls,
                rejected_calls: stats.rejected_calls,
                consecutive_failures: stats.consecutive_failures,
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Reset a named breaker; returns false when it does not exist
    pub async fn reset(&self, name: &str) -> bool {
        let breaker = {
            let breakers = self.breakers.read().await;
            breakers.get(name).cloned()
        };
        match breaker {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => false,
        }
    }

    pub async fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }
}
