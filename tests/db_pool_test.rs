//! 存储层协作者测试：组件按配置值获取数据源

use async_trait::async_trait;
use config_relay::db::{
    check_health, ConnectionPool, ConnectionTarget, DataSourceFactory, DbConfig, HealthProbe,
    HealthStatus, DEFAULT_HEALTH_TIMEOUT,
};
use config_relay::{ConfigSnapshot, ConfigSource, Document, Reconfigurable, Relay};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => panic!("test document must be an object"),
    }
}

/// 模拟的数据源，只记录连接目标
struct FakeDataSource {
    target: ConnectionTarget,
    reachable: AtomicBool,
}

#[async_trait]
impl HealthProbe for FakeDataSource {
    async fn probe(&self) -> anyhow::Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            anyhow::bail!("connection refused: {}", self.target)
        }
    }
}

struct FakeFactory;

impl DataSourceFactory for FakeFactory {
    type DataSource = FakeDataSource;

    fn create(&self, config: &DbConfig) -> anyhow::Result<FakeDataSource> {
        Ok(FakeDataSource {
            target: config.connection_target(),
            reachable: AtomicBool::new(true),
        })
    }
}

/// 使用数据库的组件
struct Repository {
    pool: Arc<ConnectionPool<FakeFactory>>,
}

#[async_trait]
impl Reconfigurable for Repository {
    type State = Arc<FakeDataSource>;

    fn name(&self) -> &str {
        "repository"
    }

    async fn read_configuration(
        &self,
        conf: &ConfigSnapshot,
        _previous: Option<&Arc<FakeDataSource>>,
        _force: bool,
    ) -> anyhow::Result<Arc<FakeDataSource>> {
        let config = DbConfig::from_snapshot(conf, "db")?;
        self.pool.data_source(&config)
    }
}

#[tokio::test]
async fn test_new_config_value_gets_separate_pool() {
    let relay = Relay::default();
    let _handle = relay
        .start_source(
            ConfigSource::builder()
                .base(doc(json!({
                    "db": {"host": "db1", "database": "app", "user": "app"}
                })))
                .build(),
        )
        .await
        .unwrap();

    let pool = Arc::new(ConnectionPool::new(FakeFactory));
    let unit = relay.unit(Repository {
        pool: Arc::clone(&pool),
    });
    unit.start().await.unwrap();

    let first = unit.state().await.unwrap();
    assert_eq!(
        first.target,
        ConnectionTarget::Tcp {
            host: "db1".to_string(),
            port: 5432
        }
    );

    relay.distributor().on_snapshot(doc(json!({
        "db": {"host": "db1", "database": "app", "user": "app", "socket_file": "/run/pg.sock"}
    })));

    tokio::time::timeout(Duration::from_secs(5), async {
        while unit.applied_version() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let second = unit.state().await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(pool.len(), 2);
    assert!(matches!(second.target, ConnectionTarget::Socket { .. }));
}

#[tokio::test]
async fn test_health_of_pooled_source() {
    let pool = ConnectionPool::new(FakeFactory);
    let config: DbConfig =
        serde_json::from_value(json!({"host": "db", "database": "app", "user": "app"})).unwrap();

    let source = pool.data_source(&config).unwrap();
    assert_eq!(
        check_health(source.as_ref(), DEFAULT_HEALTH_TIMEOUT).await,
        HealthStatus::Up
    );

    source.reachable.store(false, Ordering::SeqCst);
    let status = check_health(source.as_ref(), DEFAULT_HEALTH_TIMEOUT).await;
    assert!(!status.is_healthy());

    assert!(pool.close_data_source(&config));
    assert!(pool.is_empty());
}
