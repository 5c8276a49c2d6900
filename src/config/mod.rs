//! 配置模块
//!
//! 配置快照、配置存储、存储合并与文件监控，以及中继自身的运行参数。

pub mod settings;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod watcher;

// 重新导出主要类型
pub use settings::{default_settings_path, RelaySettings, SettingsLoader};
pub use snapshot::{deep_merge, ConfigSnapshot, Document};
pub use source::{merge, ConfigSource, ConfigSourceBuilder, SourceHandle};
pub use store::{FileStore, MemoryStore, Store, StoreFormat};
pub use watcher::{StoreChangeEvent, StoreWatcher, WatchedFile};
