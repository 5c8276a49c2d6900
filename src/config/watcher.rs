//! 配置文件监控模块
//!
//! 监控被标记为 watched 的文件存储，检测到变更时发出事件，由配置源负责完整重新合并

use crate::error::SourceError;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 存储变更事件
#[derive(Debug, Clone)]
pub struct StoreChangeEvent {
    /// 发生变更的存储名称
    pub store: String,
    /// 发生变更的文件路径
    pub path: PathBuf,
    /// 检测时间
    pub timestamp: Instant,
}

/// 需要监控的存储文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    /// 存储名称
    pub store: String,
    /// 文件路径
    pub path: PathBuf,
    /// 存储是否可选；可选存储的目录不存在时跳过监控而不是报错
    pub optional: bool,
}

impl WatchedFile {
    /// 必需存储的监控项
    pub fn new(store: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            store: store.into(),
            path: path.into(),
            optional: false,
        }
    }

    /// 设置是否可选
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }
}

#[derive(Debug, Clone)]
struct WatchTarget {
    store: String,
    path: PathBuf,
    /// 规范化后的路径，事件中的路径可能已被解析过符号链接
    canonical: Option<PathBuf>,
}

impl WatchTarget {
    fn matches(&self, path: &Path) -> bool {
        path == self.path || self.canonical.as_deref() == Some(path)
    }
}

/// 存储文件监控器
pub struct StoreWatcher {
    /// 文件系统监控器
    watcher: Option<RecommendedWatcher>,
    /// 被监控的目录
    directories: Vec<PathBuf>,
}

impl StoreWatcher {
    /// 为给定的存储文件启动监控
    ///
    /// 监控的是文件所在目录，这样文件被替换或重新创建时也能收到事件。
    /// 可选存储的目录不存在时只记录警告，必需存储的目录不存在则返回错误。
    ///
    /// # 返回
    /// * `Result<(Self, mpsc::UnboundedReceiver<StoreChangeEvent>)>` - 监控器和事件接收器
    pub fn start(
        files: Vec<WatchedFile>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StoreChangeEvent>), SourceError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut targets = Vec::with_capacity(files.len());
        for file in files {
            if file.optional && !watch_directory(&file.path).is_dir() {
                warn!(
                    "可选配置存储 {} 的目录不存在，不监控: {}",
                    file.store,
                    file.path.display()
                );
                continue;
            }
            let canonical = canonical_target(&file.path);
            targets.push(WatchTarget {
                store: file.store,
                path: file.path,
                canonical,
            });
        }

        let handler_targets = targets.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !is_relevant_kind(&event.kind) {
                        return;
                    }
                    for target in &handler_targets {
                        if event.paths.iter().any(|p| target.matches(p)) {
                            debug!("检测到配置文件变更事件: {:?}", event);
                            let change = StoreChangeEvent {
                                store: target.store.clone(),
                                path: target.path.clone(),
                                timestamp: Instant::now(),
                            };
                            if tx.send(change).is_err() {
                                debug!("变更事件接收端已关闭");
                            }
                        }
                    }
                }
                Err(e) => error!("文件监控事件错误: {}", e),
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(1)),
        )
        .map_err(|e| SourceError::Watch {
            store: "*".to_string(),
            reason: format!("创建文件监控器失败: {}", e),
        })?;

        let mut directories = Vec::new();
        let mut seen = HashSet::new();
        for target in &targets {
            let dir = watch_directory(&target.path);
            if !seen.insert(dir.clone()) {
                continue;
            }
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|e| SourceError::Watch {
                    store: target.store.clone(),
                    reason: format!("监控目录失败 {}: {}", dir.display(), e),
                })?;
            info!("启动配置文件监控: {}", target.path.display());
            directories.push(dir);
        }

        Ok((
            Self {
                watcher: Some(watcher),
                directories,
            },
            rx,
        ))
    }

    /// 被监控的目录
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// 停止监控
    pub fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            for dir in &self.directories {
                if let Err(e) = watcher.unwatch(dir) {
                    debug!("取消目录监控失败 {}: {}", dir.display(), e);
                }
            }
            info!("配置文件监控已停止");
        }
    }
}

impl Drop for StoreWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 检查是否是我们关心的事件类型
fn is_relevant_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}

fn watch_directory(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn canonical_target(path: &Path) -> Option<PathBuf> {
    let dir = std::fs::canonicalize(watch_directory(path)).ok()?;
    Some(dir.join(path.file_name()?))
}
