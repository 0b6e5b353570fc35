//! 协调核心配置模型
//!
//! 仅定义配置结构与校验；从文件/环境变量加载由上层组合根负责。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use coordinator_errors::{CoordinationError, CoordinationResult};

/// 配置校验
pub trait ConfigValidator {
    fn validate(&self) -> CoordinationResult<()>;
}

/// 协调核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// 重试策略
    pub retry: RetryConfig,
    /// 是否启用后台死锁检测
    pub deadlock_detection: bool,
    /// 死锁检测间隔（毫秒）
    pub deadlock_detection_interval_ms: u64,
    /// 资源获取等待超时（毫秒）
    pub resource_timeout_ms: u64,
    /// 消息应答等待超时（毫秒）
    pub message_timeout_ms: u64,
    /// 维护任务执行间隔（毫秒）
    pub maintenance_interval_ms: u64,
    /// 终态任务记录保留时间（毫秒），窗口内重复的终态调用保持幂等
    pub task_retention_ms: u64,
    /// 已裁决冲突保留时间（毫秒）
    pub conflict_retention_ms: u64,
    /// 工作窃取
    pub work_stealing: WorkStealingConfig,
    /// 熔断器缺省配置
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            deadlock_detection: true,
            deadlock_detection_interval_ms: 10_000, // 10秒检测一次
            resource_timeout_ms: 60_000,            // 1分钟资源等待上限
            message_timeout_ms: 30_000,
            maintenance_interval_ms: 60_000,
            task_retention_ms: 300_000, // 终态保留5分钟
            conflict_retention_ms: 300_000,
            work_stealing: WorkStealingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl CoordinationConfig {
    pub fn resource_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_timeout_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn deadlock_detection_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock_detection_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

impl ConfigValidator for CoordinationConfig {
    fn validate(&self) -> CoordinationResult<()> {
        if self.resource_timeout_ms == 0 {
            return Err(CoordinationError::config_error("resource_timeout_ms 必须大于0"));
        }
        if self.message_timeout_ms == 0 {
            return Err(CoordinationError::config_error("message_timeout_ms 必须大于0"));
        }
        if self.deadlock_detection && self.deadlock_detection_interval_ms == 0 {
            return Err(CoordinationError::config_error(
                "启用死锁检测时 deadlock_detection_interval_ms 必须大于0",
            ));
        }
        self.retry.validate()?;
        self.work_stealing.validate()?;
        self.circuit_breaker.validate()?;
        Ok(())
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大重试次数
    pub max_retries: u32,
    /// 基础重试间隔（毫秒）
    pub retry_delay_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_retry_delay_ms: u64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 60_000, // 1分钟上限
            jitter_factor: 0.1,         // 10%的随机抖动
        }
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> CoordinationResult<()> {
        if self.retry_delay_ms == 0 {
            return Err(CoordinationError::config_error("retry_delay_ms 必须大于0"));
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(CoordinationError::config_error(
                "max_retry_delay_ms 不能小于 retry_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(CoordinationError::config_error(
                "jitter_factor 必须在 0.0 到 1.0 之间",
            ));
        }
        Ok(())
    }
}

/// 工作窃取配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkStealingConfig {
    pub enabled: bool,
    /// 窃取周期间隔（毫秒）
    pub steal_interval_ms: u64,
    /// 负载超过均值的该倍数即视为过载
    pub steal_threshold: f64,
    /// 单个周期最多迁移的任务数
    pub max_steal_batch: usize,
    /// 负载上报过期时间（秒），过期记录不参与窃取决策
    pub workload_stale_seconds: i64,
}

impl Default for WorkStealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            steal_interval_ms: 5_000,
            steal_threshold: 1.5,
            max_steal_batch: 3,
            workload_stale_seconds: 120,
        }
    }
}

impl ConfigValidator for WorkStealingConfig {
    fn validate(&self) -> CoordinationResult<()> {
        if self.steal_threshold <= 1.0 {
            return Err(CoordinationError::config_error(
                "steal_threshold 必须大于1.0",
            ));
        }
        if self.enabled && self.steal_interval_ms == 0 {
            return Err(CoordinationError::config_error(
                "启用工作窃取时 steal_interval_ms 必须大于0",
            ));
        }
        if self.max_steal_batch == 0 {
            return Err(CoordinationError::config_error("max_steal_batch 必须大于0"));
        }
        Ok(())
    }
}

/// 熔断器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// 连续失败该次数后熔断
    pub failure_threshold: usize,
    /// 半开态连续成功该次数后恢复
    pub success_threshold: usize,
    /// 熔断后进入半开态前的等待时间
    pub timeout: Duration,
    /// 半开态允许的并发探测调用数
    pub half_open_limit: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(60),
            half_open_limit: 2,
        }
    }
}

impl ConfigValidator for CircuitBreakerConfig {
    fn validate(&self) -> CoordinationResult<()> {
        if self.failure_threshold == 0 {
            return Err(CoordinationError::config_error(
                "failure_threshold 必须大于0",
            ));
        }
        if self.success_threshold == 0 {
            return Err(CoordinationError::config_error(
                "success_threshold 必须大于0",
            ));
        }
        if self.half_open_limit == 0 {
            return Err(CoordinationError::config_error("half_open_limit 必须大于0"));
        }
        if self.timeout.is_zero() {
            return Err(CoordinationError::config_error("timeout 必须大于0"));
        }
        Ok(())
    }
}
