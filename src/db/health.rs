//! 数据源健康检查

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 默认的健康检查超时时间
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_millis(1000);

/// 健康探针，例如执行一次 `SELECT 1`
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// 执行一次探测
    async fn probe(&self) -> anyhow::Result<()>;
}

/// 健康状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HealthStatus {
    /// 正常
    Up,
    /// 异常
    Down { error: String },
}

impl HealthStatus {
    /// 判断状态是否为健康
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Up)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Up => write!(f, "正常"),
            HealthStatus::Down { error } => write!(f, "异常: {}", error),
        }
    }
}

/// 带超时的健康检查
///
/// # 参数
/// * `probe` - 健康探针
/// * `timeout` - 超时时间
///
/// # 返回
/// * `HealthStatus` - 探测失败或超时为 `Down`
pub async fn check_health<P: HealthProbe + ?Sized>(probe: &P, timeout: Duration) -> HealthStatus {
    match tokio::time::timeout(timeout, probe.probe()).await {
        Ok(Ok(())) => HealthStatus::Up,
        Ok(Err(e)) => HealthStatus::Down {
            error: format!("{:#}", e),
        },
        Err(_) => HealthStatus::Down {
            error: format!("健康检查超时 ({}ms)", timeout.as_millis()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Option<&'static str>);

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn probe(&self) -> anyhow::Result<()> {
            match self.0 {
                None => Ok(()),
                Some(message) => Err(anyhow::anyhow!(message)),
            }
        }
    }

    struct SlowProbe;

    #[async_trait]
    impl HealthProbe for SlowProbe {
        async fn probe(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_probe_results() {
        assert!(check_health(&FixedProbe(None), DEFAULT_HEALTH_TIMEOUT)
            .await
            .is_healthy());

        let down = check_health(&FixedProbe(Some("connection refused")), DEFAULT_HEALTH_TIMEOUT).await;
        assert_eq!(
            down,
            HealthStatus::Down {
                error: "connection refused".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let status = check_health(&SlowProbe, Duration::from_millis(20)).await;
        assert!(matches!(status, HealthStatus::Down { ref error } if error.contains("20ms")));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(HealthStatus::Down {
            error: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "down");
        assert_eq!(json["error"], "boom");
    }
}
