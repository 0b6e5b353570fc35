use thiserror::Error;


#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("任务 {id} 已被调度")]
    TaskAlreadyScheduled { id: String },
    #[error("Agent未找到: {id}")]
    AgentNotFound { id: String },
    #[error("没有满足任务 {task_id} 能力要求的可用Agent")]
    NoEligibleAgent { task_id: String },
    #[error("资源锁错误: 资源 {resource_id} - {reason}")]
    ResourceLock { resource_id: String, reason: String },
    #[error("检测到死锁: 涉及Agent {agents:?}, 资源 {resources:?}")]
    Deadlock {
        agents: Vec<String>,
        resources: Vec<String>,
    },
    #[error("任务执行超时: {task_id}")]
    TaskTimeout { task_id: String },
    #[error("无效的任务依赖: 任务 {task_id} - {reason}")]
    TaskDependency { task_id: String, reason: String },
    #[error("熔断器 {name} 处于打开状态，调用被拒绝")]
    CircuitBreakerOpen { name: String },
    #[error("冲突 {conflict_id} 无法裁决: {reason}")]
    ConflictUnresolved {
        conflict_id: String,
        reason: String,
    },
    #[error("冲突未找到: {id}")]
    ConflictNotFound { id: String },
    #[error("消息路由错误: {0}")]
    MessageRouting(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;

impl CoordinationError {
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn agent_not_found<S: Into<String>>(id: S) -> Self {
        Self::AgentNotFound { id: id.into() }
    }
    pub fn resource_lock<S: Into<String>, R: Into<String>>(resource_id: S, reason: R) -> Self {
        Self::ResourceLock {
            resource_id: resource_id.into(),
            reason: reason.into(),
        }
    }
    pub fn dependency<S: Into<String>, R: Into<String>>(task_id: S, reason: R) -> Self {
        Self::TaskDependency {
            task_id: task_id.into(),
            reason: reason.into(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// 熔断拒绝属于快速失败，单独识别，不计入任务重试次数
    pub fn is_circuit_rejection(&self) -> bool {
        matches!(self, CoordinationError::CircuitBreakerOpen { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::MessageRouting(_)
                | CoordinationError::Timeout(_)
                | CoordinationError::TaskTimeout { .. }
                | CoordinationError::ResourceLock { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinationError::Internal(_) | CoordinationError::Configuration(_)
        )
    }

    pub fn user_message(&self) -> &str {
        match self {
            CoordinationError::TaskNotFound { .. } => "请求的任务不存在",
            CoordinationError::TaskAlreadyScheduled { .. } => "任务已在调度中，请勿重复提交",
            CoordinationError::AgentNotFound { .. } => "请求的Agent不存在",
            CoordinationError::ResourceLock { .. } => "资源获取失败，请稍后重试",
            CoordinationError::Deadlock { .. } => "检测到资源死锁，请求已被中止",
            CoordinationError::TaskTimeout { .. } => "任务执行超时",
            CoordinationError::TaskDependency { .. } => "任务依赖配置有误",
            CoordinationError::CircuitBreakerOpen { .. } => "下游服务暂时不可用，请稍后重试",
            CoordinationError::Timeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(err: serde_json::Error) -> Self {
        CoordinationError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for CoordinationError {
    fn from(err: anyhow::Error) -> Self {
        CoordinationError::Internal(err.to_string())
    }
}
