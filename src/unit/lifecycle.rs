//! 组件生命周期
//!
//! `Uninitialized -> Starting -> Running -> Stopped`，运行中的重配置不是状态转换。

use crate::bus::{Bus, SubscriptionHandle, CONFIG_CHANGE_ADDRESS, CONFIG_CURRENT_ADDRESS};
use crate::config::snapshot::ConfigSnapshot;
use crate::distributor::FetchRequest;
use crate::error::UnitError;
use crate::logging::LoggingSystem;
use crate::unit::dispatch::{run_dispatcher, WorkerPool};
use crate::unit::{Reconfigurable, StartupPolicy, UnitOptions, UnitPhase};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// 一次配置应用失败的原因
pub(crate) enum ApplyFailure {
    /// 处理器返回错误
    Handler(anyhow::Error),
    /// 处理器 panic
    Panicked,
    /// 调度本身出错（处理器任务被取消）
    Dispatch(JoinError),
}

impl ApplyFailure {
    fn into_error(self) -> anyhow::Error {
        match self {
            ApplyFailure::Handler(e) => e,
            ApplyFailure::Panicked => anyhow::anyhow!("配置处理器发生 panic"),
            ApplyFailure::Dispatch(e) => anyhow::Error::new(e).context("配置处理任务被取消"),
        }
    }
}

#[derive(Default)]
pub(crate) struct StatCounters {
    pub(crate) applied: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) skipped: AtomicU64,
    pub(crate) dispatch_failures: AtomicU64,
}

/// 组件统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitStats {
    /// 成功应用的次数（含首次）
    pub applied: u64,
    /// 处理器失败的次数
    pub failed: u64,
    /// 因版本过期或被更新快照合并而未应用的快照数
    pub skipped: u64,
    /// 调度失败的次数
    pub dispatch_failures: u64,
}

/// 组件与其调度任务共享的部分
pub(crate) struct UnitShared<R: Reconfigurable> {
    handler: R,
    state: RwLock<Option<Arc<R::State>>>,
    last_applied: Mutex<Option<ConfigSnapshot>>,
    applied_version: AtomicU64,
    stopped: AtomicBool,
    pub(crate) stats: StatCounters,
}

impl<R: Reconfigurable> UnitShared<R> {
    pub(crate) fn name(&self) -> &str {
        self.handler.name()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn applied_version(&self) -> u64 {
        self.applied_version.load(Ordering::SeqCst)
    }

    /// 快照是否不比已应用的配置更新
    pub(crate) fn is_stale(&self, snapshot: &ConfigSnapshot) -> bool {
        self.last_applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|applied| !snapshot.supersedes(applied))
    }

    /// 在独立任务中运行处理器，成功时整体替换状态
    ///
    /// 提交发生在处理器任务内部，调用方放弃等待时已开始的应用仍会完成；
    /// 只有启动被放弃时首次应用的结果才会被丢弃。
    pub(crate) async fn apply(
        self: &Arc<Self>,
        snapshot: ConfigSnapshot,
        force: bool,
    ) -> Result<(), ApplyFailure> {
        let shared = Arc::clone(self);
        let snapshot_meta = snapshot.clone();
        let task = tokio::spawn(async move {
            let previous = shared.state.read().await.clone();
            let state = shared
                .handler
                .read_configuration(&snapshot, previous.as_deref(), force)
                .await?;
            if force && shared.is_stopped() {
                debug!("组件 {} 的启动已被放弃，丢弃首次应用的结果", shared.name());
                return Ok(());
            }
            shared.commit(state, &snapshot).await;
            Ok::<(), anyhow::Error>(())
        });

        let outcome = match task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(ApplyFailure::Handler(e))
            }
            Err(e) if e.is_panic() => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(ApplyFailure::Panicked)
            }
            Err(e) => Err(ApplyFailure::Dispatch(e)),
        };
        if outcome.is_err() {
            LoggingSystem::snapshot_log(self.name(), &snapshot_meta, false);
        }
        outcome
    }

    async fn commit(&self, state: R::State, snapshot: &ConfigSnapshot) {
        let mut slot = self.state.write().await;
        *slot = Some(Arc::new(state));
        *self.last_applied.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        self.stats.applied.fetch_add(1, Ordering::Relaxed);
        self.applied_version
            .store(snapshot.version(), Ordering::SeqCst);
        drop(slot);
        LoggingSystem::snapshot_log(self.name(), snapshot, true);
    }
}

/// 可重配置组件
pub struct Unit<R: Reconfigurable> {
    shared: Arc<UnitShared<R>>,
    bus: Bus,
    pool: WorkerPool,
    options: UnitOptions,
    phase: Mutex<UnitPhase>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl<R: Reconfigurable> Unit<R> {
    /// 创建新的组件
    ///
    /// # 参数
    /// * `handler` - 配置处理逻辑
    /// * `bus` - 连接分发器的总线
    /// * `pool` - 共享的重载工作池
    /// * `options` - 组件选项
    pub fn new(handler: R, bus: &Bus, pool: WorkerPool, options: UnitOptions) -> Self {
        Self {
            shared: Arc::new(UnitShared {
                handler,
                state: RwLock::new(None),
                last_applied: Mutex::new(None),
                applied_version: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                stats: StatCounters::default(),
            }),
            bus: bus.clone(),
            pool,
            options,
            phase: Mutex::new(UnitPhase::Uninitialized),
            subscription: Mutex::new(None),
        }
    }

    /// 组件名称
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// 配置处理逻辑
    pub fn handler(&self) -> &R {
        &self.shared.handler
    }

    /// 当前阶段
    pub async fn phase(&self) -> UnitPhase {
        *self.lock_phase()
    }

    fn lock_phase(&self) -> std::sync::MutexGuard<'_, UnitPhase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 最近一次成功应用的状态
    pub async fn state(&self) -> Option<Arc<R::State>> {
        self.shared.state.read().await.clone()
    }

    /// 最近一次成功应用的配置版本（部署配置为 0）
    pub fn applied_version(&self) -> u64 {
        self.shared.applied_version()
    }

    /// 统计信息
    pub fn stats(&self) -> UnitStats {
        let stats = &self.shared.stats;
        UnitStats {
            applied: stats.applied.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            skipped: stats.skipped.load(Ordering::Relaxed),
            dispatch_failures: stats.dispatch_failures.load(Ordering::Relaxed),
        }
    }

    /// 启动组件
    ///
    /// 首次应用配置失败会使启动失败（`FailFast` 策略），组件不会在没有有效配置的情况下进入运行状态。
    /// 返回的 future 在完成前被丢弃时，组件直接进入 `Stopped`。
    pub async fn start(&self) -> Result<(), UnitError> {
        {
            let mut phase = self.lock_phase();
            if *phase != UnitPhase::Uninitialized {
                return Err(UnitError::InvalidTransition {
                    unit: self.name().to_string(),
                    from: phase.to_string(),
                    action: "start",
                });
            }
            *phase = UnitPhase::Starting;
        }

        info!("启动组件: {}", self.name());
        let mut guard = StartGuard {
            unit: self,
            armed: true,
        };
        let result = self.initialize().await;
        guard.armed = false;

        match result {
            Ok(subscription) => {
                self.store_subscription(subscription.handle());
                tokio::spawn(run_dispatcher(
                    Arc::clone(&self.shared),
                    subscription,
                    self.pool.clone(),
                ));
                *self.lock_phase() = UnitPhase::Running;
                info!("组件 {} 已进入运行状态", self.name());
                Ok(())
            }
            Err(e) => {
                self.shared.stopped.store(true, Ordering::SeqCst);
                *self.lock_phase() = UnitPhase::Stopped;
                error!("组件 {} 启动失败: {}", self.name(), e);
                Err(e)
            }
        }
    }

    /// 获取并应用初始配置，成功后返回配置变更订阅
    async fn initialize(&self) -> Result<crate::bus::Subscription<ConfigSnapshot>, UnitError> {
        let capacity = self.options.queue_capacity;

        let (snapshot, subscription) = match self.options.explicit_config() {
            Some(document) => {
                info!("组件 {} 使用部署时提供的配置", self.name());
                (ConfigSnapshot::new(document.clone()), None)
            }
            None => {
                // 先订阅再获取，获取期间发布的变更在队列中等待，不会丢失
                let subscription = self.bus.subscribe(CONFIG_CHANGE_ADDRESS, capacity);
                debug!("组件 {} 向分发器请求当前配置", self.name());
                let snapshot = self
                    .bus
                    .request::<FetchRequest, ConfigSnapshot>(
                        CONFIG_CURRENT_ADDRESS,
                        FetchRequest,
                        self.options.fetch_timeout,
                    )
                    .await
                    .map_err(|source| UnitError::Fetch {
                        unit: self.name().to_string(),
                        source,
                    })?;
                (ConfigSnapshot::clone(&snapshot), Some(subscription))
            }
        };

        if let Err(failure) = self.shared.apply(snapshot, true).await {
            let source = failure.into_error();
            match self.options.policy {
                StartupPolicy::FailFast => {
                    return Err(UnitError::InitialApply {
                        unit: self.name().to_string(),
                        source,
                    });
                }
                StartupPolicy::Lenient => {
                    warn!(
                        "组件 {} 首次应用配置失败，等待下一次配置变更: {:#}",
                        self.name(),
                        source
                    );
                }
            }
        }

        Ok(subscription.unwrap_or_else(|| self.bus.subscribe(CONFIG_CHANGE_ADDRESS, capacity)))
    }

    fn store_subscription(&self, handle: SubscriptionHandle) {
        let mut slot = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(handle);
    }

    fn release_subscription(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let handle = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.unsubscribe();
        }
    }

    /// 停止组件
    ///
    /// 注销订阅后不再调用处理器；已经开始的处理器调用不会被取消。
    pub async fn stop(&self) -> Result<(), UnitError> {
        let mut phase = self.lock_phase();
        match *phase {
            UnitPhase::Stopped => return Ok(()),
            UnitPhase::Starting => {
                return Err(UnitError::InvalidTransition {
                    unit: self.name().to_string(),
                    from: phase.to_string(),
                    action: "stop",
                });
            }
            UnitPhase::Uninitialized | UnitPhase::Running => {}
        }

        self.release_subscription();
        *phase = UnitPhase::Stopped;
        info!("组件 {} 已停止", self.name());
        Ok(())
    }
}

/// 启动过程中 future 被丢弃时把组件置为停止
struct StartGuard<'a, R: Reconfigurable> {
    unit: &'a Unit<R>,
    armed: bool,
}

impl<R: Reconfigurable> Drop for StartGuard<'_, R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.unit.shared.stopped.store(true, Ordering::SeqCst);
        let mut phase = self.unit.lock_phase();
        if *phase == UnitPhase::Starting {
            *phase = UnitPhase::Stopped;
            warn!("组件 {} 的启动被取消，已停止", self.unit.name());
        }
    }
}

impl<R: Reconfigurable> Drop for Unit<R> {
    fn drop(&mut self) {
        self.release_subscription();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::snapshot::Document;
    use crate::distributor::Distributor;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("test document must be an object"),
        }
    }

    /// 记录每次调用的 foo 值和 force 标志
    struct FooUnit {
        calls: Mutex<Vec<(String, bool)>>,
        delay: Duration,
    }

    impl FooUnit {
        fn new() -> Self {
            Self::slow(Duration::ZERO)
        }

        fn slow(delay: Duration) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                delay,
            }
        }

        fn calls(&self) -> Vec<(String, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Reconfigurable for FooUnit {
        type State = String;

        fn name(&self) -> &str {
            "foo-unit"
        }

        async fn read_configuration(
            &self,
            conf: &ConfigSnapshot,
            _previous: Option<&String>,
            force: bool,
        ) -> anyhow::Result<String> {
            let foo = conf
                .get_str("foo")
                .ok_or_else(|| anyhow::anyhow!("missing foo"))?
                .to_string();
            self.calls.lock().unwrap().push((foo.clone(), force));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if foo == "explode" {
                panic!("handler panic");
            }
            Ok(foo)
        }
    }

    async fn wait_for_version<R: Reconfigurable>(unit: &Unit<R>, version: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while unit.applied_version() < version {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("unit did not reach version in time");
    }

    async fn wait_for_failures<R: Reconfigurable>(unit: &Unit<R>, failed: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while unit.stats().failed < failed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("unit did not record failure in time");
    }

    #[tokio::test]
    async fn test_start_applies_with_force() {
        let bus = Bus::new();
        let _distributor = Distributor::with_value(&bus, doc(json!({"foo": "bar"})));
        let unit = Unit::new(FooUnit::new(), &bus, WorkerPool::new(2), UnitOptions::default());

        unit.start().await.unwrap();
        assert_eq!(unit.phase().await, UnitPhase::Running);
        assert_eq!(unit.state().await.unwrap().as_str(), "bar");
        assert_eq!(unit.handler().calls(), vec![("bar".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let bus = Bus::new();
        let _distributor = Distributor::with_value(&bus, doc(json!({"foo": "bar"})));
        let unit = Unit::new(FooUnit::new(), &bus, WorkerPool::new(2), UnitOptions::default());

        unit.start().await.unwrap();
        assert!(matches!(
            unit.start().await,
            Err(UnitError::InvalidTransition { action: "start", .. })
        ));
    }

    #[tokio::test]
    async fn test_initial_failure_stops_unit() {
        let bus = Bus::new();
        let _distributor = Distributor::with_value(&bus, doc(json!({"other": 1})));
        let unit = Unit::new(FooUnit::new(), &bus, WorkerPool::new(2), UnitOptions::default());

        assert!(matches!(
            unit.start().await,
            Err(UnitError::InitialApply { .. })
        ));
        assert_eq!(unit.phase().await, UnitPhase::Stopped);
        assert!(unit.state().await.is_none());
        assert_eq!(bus.subscriber_count(CONFIG_CHANGE_ADDRESS), 0);
    }

    #[tokio::test]
    async fn test_lenient_policy_runs_without_state() {
        let bus = Bus::new();
        let distributor = Distributor::with_value(&bus, doc(json!({"other": 1})));
        let options = UnitOptions::default().with_policy(StartupPolicy::Lenient);
        let unit = Unit::new(FooUnit::new(), &bus, WorkerPool::new(2), options);

        unit.start().await.unwrap();
        assert_eq!(unit.phase().await, UnitPhase::Running);
        assert!(unit.state().await.is_none());

        distributor.on_snapshot(doc(json!({"foo": "late"})));
        wait_for_version(&unit, 2).await;
        assert_eq!(unit.state().await.unwrap().as_str(), "late");
    }

    #[tokio::test]
    async fn test_fetch_without_distributor_fails() {
        let bus = Bus::new();
        let unit = Unit::new(FooUnit::new(), &bus, WorkerPool::new(2), UnitOptions::default());

        assert!(matches!(
            unit.start().await,
            Err(UnitError::Fetch { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let bus = Bus::new();
        let _distributor = Distributor::new(&bus);
        let options = UnitOptions::default().with_fetch_timeout(Duration::from_millis(20));
        let unit = Unit::new(FooUnit::new(), &bus, WorkerPool::new(2), options);

        match unit.start().await {
            Err(UnitError::Fetch { source, .. }) => {
                assert!(matches!(source, crate::error::BusError::Timeout { .. }))
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_state() {
        let bus = Bus::new();
        let distributor = Distributor::with_value(&bus, doc(json!({"foo": "bar"})));
        let unit = Unit::new(FooUnit::new(), &bus, WorkerPool::new(2), UnitOptions::default());
        unit.start().await.unwrap();

        distributor.on_snapshot(doc(json!({"nothing": true})));
        wait_for_failures(&unit, 1).await;
        assert_eq!(unit.state().await.unwrap().as_str(), "bar");
        assert_eq!(unit.applied_version(), 1);
        assert_eq!(unit.phase().await, UnitPhase::Running);

        distributor.on_snapshot(doc(json!({"foo": "explode"})));
        wait_for_failures(&unit, 2).await;
        assert_eq!(unit.state().await.unwrap().as_str(), "bar");

        distributor.on_snapshot(doc(json!({"foo": "recovered"})));
        wait_for_version(&unit, 4).await;
        assert_eq!(unit.state().await.unwrap().as_str(), "recovered");
        assert_eq!(unit.stats().failed, 2);
    }

    #[tokio::test]
    async fn test_reloads_are_applied_in_order() {
        let bus = Bus::new();
        let distributor = Distributor::with_value(&bus, doc(json!({"foo": "v1"})));
        let unit = Unit::new(FooUnit::new(), &bus, WorkerPool::new(1), UnitOptions::default());
        unit.start().await.unwrap();

        for n in 2..=6 {
            distributor.on_snapshot(doc(json!({"foo": format!("v{}", n)})));
        }
        wait_for_version(&unit, 6).await;

        let seen: Vec<String> = unit.handler().calls().into_iter().map(|(foo, _)| foo).collect();
        assert_eq!(seen, vec!["v1", "v2", "v3", "v4", "v5", "v6"]);
        assert!(unit.handler().calls()[1..].iter().all(|(_, force)| !force));
    }

    #[tokio::test]
    async fn test_stop_ends_delivery() {
        let bus = Bus::new();
        let distributor = Distributor::with_value(&bus, doc(json!({"foo": "bar"})));
        let unit = Unit::new(FooUnit::new(), &bus, WorkerPool::new(2), UnitOptions::default());
        unit.start().await.unwrap();

        unit.stop().await.unwrap();
        assert_eq!(unit.phase().await, UnitPhase::Stopped);
        assert_eq!(bus.subscriber_count(CONFIG_CHANGE_ADDRESS), 0);

        distributor.on_snapshot(doc(json!({"foo": "ignored"})));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(unit.state().await.unwrap().as_str(), "bar");
        assert_eq!(unit.handler().calls().len(), 1);

        // 重复停止是幂等的
        unit.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_start_stops_unit() {
        let bus = Bus::new();
        let distributor = Distributor::new(&bus);
        let unit = Unit::new(FooUnit::new(), &bus, WorkerPool::new(2), UnitOptions::default());

        let result = tokio::time::timeout(Duration::from_millis(50), unit.start()).await;
        assert!(result.is_err());
        assert_eq!(unit.phase().await, UnitPhase::Stopped);
        assert_eq!(bus.subscriber_count(CONFIG_CHANGE_ADDRESS), 0);

        unit.stop().await.unwrap();
        assert!(matches!(
            unit.start().await,
            Err(UnitError::InvalidTransition { action: "start", .. })
        ));

        // 被放弃的获取在配置到达后完成，但结果不会提交
        distributor.on_snapshot(doc(json!({"foo": "late"})));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(unit.state().await.is_none());
        assert_eq!(unit.applied_version(), 0);
    }

    #[tokio::test]
    async fn test_reloads_during_fetch_are_not_rolled_back() {
        let bus = Bus::new();
        let distributor = Distributor::new(&bus);
        let unit = Arc::new(Unit::new(
            FooUnit::new(),
            &bus,
            WorkerPool::new(2),
            UnitOptions::default(),
        ));

        let starting = tokio::spawn({
            let unit = Arc::clone(&unit);
            async move { unit.start().await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.subscriber_count(CONFIG_CHANGE_ADDRESS) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("unit did not subscribe in time");

        distributor.on_snapshot(doc(json!({"foo": "v1"})));
        distributor.on_snapshot(doc(json!({"foo": "v2"})));
        starting.await.unwrap().unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while unit.stats().skipped < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queued snapshots were not skipped in time");

        assert_eq!(unit.handler().calls(), vec![("v2".to_string(), true)]);
        assert_eq!(unit.applied_version(), 2);
        assert_eq!(unit.stats().skipped, 2);
        assert_eq!(unit.state().await.unwrap().as_str(), "v2");
    }

    #[tokio::test]
    async fn test_burst_of_reloads_converges_on_latest() {
        let bus = Bus::new();
        let distributor = Distributor::with_value(&bus, doc(json!({"foo": "v1"})));
        let options = UnitOptions::default().with_queue_capacity(2);
        let unit = Unit::new(
            FooUnit::slow(Duration::from_millis(50)),
            &bus,
            WorkerPool::new(1),
            options,
        );
        unit.start().await.unwrap();

        for n in 2..=6 {
            distributor.on_snapshot(doc(json!({"foo": format!("v{}", n)})));
        }
        wait_for_version(&unit, 6).await;

        assert_eq!(unit.state().await.unwrap().as_str(), "v6");
        let stats = unit.stats();
        assert_eq!(stats.dispatch_failures, 0);
        assert_eq!(stats.applied + stats.skipped, 6);
        assert!(stats.skipped > 0);
    }
}
