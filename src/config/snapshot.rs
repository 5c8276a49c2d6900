//! 配置快照
//!
//! 一次完整合并得到的不可变配置文档。快照通过 `Arc` 共享，克隆只增加引用计数，
//! 不提供任何原地修改的接口。

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// 配置文档类型（键为字符串，值为标量、嵌套文档或序列）
pub type Document = Map<String, Value>;

struct SnapshotInner {
    document: Document,
    version: u64,
    produced_at: DateTime<Utc>,
}

/// 不可变配置快照
#[derive(Clone)]
pub struct ConfigSnapshot {
    inner: Arc<SnapshotInner>,
}

impl ConfigSnapshot {
    /// 创建未经分发器编号的快照（版本号为 0）
    pub fn new(document: Document) -> Self {
        Self::stamped(document, 0)
    }

    /// 创建带版本号的快照，版本号由分发器分配
    pub(crate) fn stamped(document: Document, version: u64) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                document,
                version,
                produced_at: Utc::now(),
            }),
        }
    }

    /// 从 JSON 值创建快照，根节点必须是对象
    pub fn from_value(value: Value) -> anyhow::Result<Self> {
        match value {
            Value::Object(document) => Ok(Self::new(document)),
            other => Err(anyhow!("配置根节点必须是对象，实际为: {}", kind_of(&other))),
        }
    }

    /// 快照版本号
    pub fn version(&self) -> u64 {
        self.inner.version
    }

    /// 快照生成时间
    pub fn produced_at(&self) -> DateTime<Utc> {
        self.inner.produced_at
    }

    /// 完整配置文档
    pub fn document(&self) -> &Document {
        &self.inner.document
    }

    /// 文档是否为空
    pub fn is_empty(&self) -> bool {
        self.inner.document.is_empty()
    }

    /// 是否比另一个快照更新
    pub fn supersedes(&self, other: &ConfigSnapshot) -> bool {
        self.version() > other.version()
    }

    /// 按点分路径读取值，例如 `"db.host"` 或 `"servers.0.port"`
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.').filter(|p| !p.is_empty());
        let first = parts.next()?;
        let mut current = self.inner.document.get(first)?;

        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }

    /// 按路径读取字符串值
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// 将路径下的配置节绑定为具体类型，未知字段被忽略
    pub fn bind<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let section = self
            .get(path)
            .ok_or_else(|| anyhow!("配置节不存在: {}", path))?;
        serde_json::from_value(section.clone()).with_context(|| format!("配置节 {} 绑定失败", path))
    }

    /// 将整个文档绑定为具体类型
    pub fn bind_root<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(Value::Object(self.inner.document.clone()))
            .context("配置文档绑定失败")
    }
}

impl fmt::Debug for ConfigSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSnapshot")
            .field("version", &self.inner.version)
            .field("produced_at", &self.inner.produced_at)
            .field("keys", &self.inner.document.len())
            .finish()
    }
}

/// 深度合并：`overlay` 的叶子值覆盖 `base`，嵌套对象递归合并，数组与标量整体替换
pub fn deep_merge(base: &mut Document, overlay: Document) {
    for (key, value) in overlay {
        match value {
            Value::Object(incoming) => {
                if let Some(Value::Object(existing)) = base.get_mut(&key) {
                    deep_merge(existing, incoming);
                    continue;
                }
                base.insert(key, Value::Object(incoming));
            }
            value => {
                base.insert(key, value);
            }
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("test document must be an object"),
        }
    }

    #[test]
    fn test_deep_merge_overrides_leaves() {
        let mut base = doc(json!({"foo": "bar", "db": {"host": "localhost", "port": 5432}}));
        deep_merge(&mut base, doc(json!({"db": {"host": "db.internal"}})));

        assert_eq!(base["foo"], "bar");
        assert_eq!(base["db"]["host"], "db.internal");
        assert_eq!(base["db"]["port"], 5432);
    }

    #[test]
    fn test_deep_merge_replaces_arrays_and_type_changes() {
        let mut base = doc(json!({"hosts": ["a", "b"], "limits": {"max": 1}}));
        deep_merge(&mut base, doc(json!({"hosts": ["c"], "limits": 10})));

        assert_eq!(base["hosts"], json!(["c"]));
        assert_eq!(base["limits"], 10);
    }

    #[test]
    fn test_get_with_paths() {
        let snapshot =
            ConfigSnapshot::from_value(json!({"db": {"hosts": [{"name": "primary"}]}})).unwrap();

        assert_eq!(snapshot.get_str("db.hosts.0.name"), Some("primary"));
        assert!(snapshot.get("db.hosts.1").is_none());
        assert!(snapshot.get("db.missing").is_none());
        assert!(snapshot.get("").is_none());
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(ConfigSnapshot::from_value(json!([1, 2])).is_err());
        assert!(ConfigSnapshot::from_value(json!("foo")).is_err());
        assert!(ConfigSnapshot::from_value(json!({})).unwrap().is_empty());
    }

    #[test]
    fn test_bind_section_ignores_unknown_fields() {
        #[derive(Debug, Deserialize)]
        struct Limits {
            max_connections: u32,
        }

        let snapshot = ConfigSnapshot::from_value(
            json!({"limits": {"max_connections": 8, "unrelated": true}}),
        )
        .unwrap();

        let limits: Limits = snapshot.bind("limits").unwrap();
        assert_eq!(limits.max_connections, 8);
        assert!(snapshot.bind::<Limits>("missing").is_err());
    }

    #[test]
    fn test_supersedes_by_version() {
        let older = ConfigSnapshot::stamped(Document::new(), 1);
        let newer = ConfigSnapshot::stamped(Document::new(), 2);

        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
        assert!(!older.supersedes(&older.clone()));
    }
}
