//! 配置存储
//!
//! 每个存储提供一份局部配置文档，并带有合并优先级（rank）。
//! 低 rank 先合并，高 rank 的叶子值覆盖低 rank。

use crate::config::snapshot::Document;
use crate::error::SourceError;
use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};

/// 匹配 ${VAR_NAME} 格式的环境变量
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("环境变量正则表达式无效")
});

/// 配置存储 trait
#[async_trait]
pub trait Store: Send + Sync {
    /// 存储名称（用于日志和错误信息）
    fn name(&self) -> &str;

    /// 合并优先级，越大越后合并
    fn rank(&self) -> i32;

    /// 读取局部配置文档
    async fn read(&self) -> Result<Document, SourceError>;

    /// 需要监控的文件路径，静态存储返回 None
    fn watch_path(&self) -> Option<&Path> {
        None
    }

    /// 缺失时是否视为空文档
    fn is_optional(&self) -> bool {
        false
    }
}

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFormat {
    /// JSON 文档
    Json,
    /// TOML 文档
    Toml,
}

impl StoreFormat {
    /// 根据文件扩展名推断格式
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(StoreFormat::Json),
            "toml" => Some(StoreFormat::Toml),
            _ => None,
        }
    }

    /// 将文本解析为配置文档
    pub fn parse(&self, store: &str, content: &str) -> Result<Document, SourceError> {
        let parse_error = |reason: String| SourceError::Parse {
            store: store.to_string(),
            reason,
        };

        // 空文件视为空文档
        if content.trim().is_empty() {
            return Ok(Document::new());
        }

        match self {
            StoreFormat::Json => match serde_json::from_str::<Value>(content) {
                Ok(Value::Object(document)) => Ok(document),
                Ok(_) => Err(parse_error("JSON 根节点必须是对象".to_string())),
                Err(e) => Err(parse_error(format!("JSON解析失败: {}", e))),
            },
            StoreFormat::Toml => {
                let table: toml::Table = toml::from_str(content)
                    .map_err(|e| parse_error(format!("TOML解析失败: {}", e)))?;
                Ok(toml_table_to_document(&table))
            }
        }
    }
}

/// 将 TOML 表转换为 JSON 文档
fn toml_table_to_document(table: &toml::Table) -> Document {
    table
        .iter()
        .map(|(k, v)| (k.clone(), toml_to_json(v)))
        .collect()
}

fn toml_to_json(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::Number(serde_json::Number::from(*i)),
        toml::Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Array(arr) => Value::Array(arr.iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(toml_table_to_document(table)),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
    }
}

/// 替换字符串中的 ${VAR} 环境变量
///
/// # 返回
/// * `Err(var)` - 第一个未定义的变量名
pub(crate) fn substitute_env_vars(content: &str) -> Result<String, String> {
    let mut missing: Option<String> = None;

    let result = ENV_VAR_PATTERN.replace_all(content, |caps: &Captures<'_>| {
        match std::env::var(&caps[1]) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| caps[1].to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var) => Err(var),
        None => Ok(result.into_owned()),
    }
}

/// 直接提供的内存配置存储（静态，只读一次）
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    rank: i32,
    document: Document,
}

impl MemoryStore {
    /// 用现成的文档创建存储
    pub fn new(name: impl Into<String>, rank: i32, document: Document) -> Self {
        Self {
            name: name.into(),
            rank,
            document,
        }
    }

    /// 解析内嵌文本（例如 `include_str!` 得到的默认配置）
    pub fn parse(
        name: impl Into<String>,
        rank: i32,
        format: StoreFormat,
        content: &str,
    ) -> Result<Self, SourceError> {
        let name = name.into();
        let document = format.parse(&name, content)?;
        Ok(Self::new(name, rank, document))
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> i32 {
        self.rank
    }

    async fn read(&self) -> Result<Document, SourceError> {
        Ok(self.document.clone())
    }
}

/// 文件配置存储
#[derive(Debug, Clone)]
pub struct FileStore {
    name: String,
    rank: i32,
    path: PathBuf,
    format: Option<StoreFormat>,
    optional: bool,
    watched: bool,
    env_substitution: bool,
}

impl FileStore {
    /// 创建新的文件存储，默认必需、监控变更、不替换环境变量
    pub fn new<P: AsRef<Path>>(path: P, rank: i32) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            rank,
            path,
            format: None,
            optional: false,
            watched: true,
            env_substitution: false,
        }
    }

    /// 设置存储名称
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 显式指定文件格式
    pub fn with_format(mut self, format: StoreFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// 文件缺失时是否视为空文档
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// 是否监控文件变更
    pub fn watched(mut self, watched: bool) -> Self {
        self.watched = watched;
        self
    }

    /// 是否启用环境变量替换
    pub fn with_env_substitution(mut self, enabled: bool) -> Self {
        self.env_substitution = enabled;
        self
    }

    /// 文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn resolve_format(&self) -> StoreFormat {
        // 无法识别的扩展名按 JSON 处理
        self.format
            .or_else(|| StoreFormat::from_path(&self.path))
            .unwrap_or(StoreFormat::Json)
    }

    fn unavailable(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Unavailable {
            store: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Store for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> i32 {
        self.rank
    }

    async fn read(&self) -> Result<Document, SourceError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.optional {
                    debug!("可选配置文件不存在，视为空文档: {}", self.path.display());
                    return Ok(Document::new());
                }
                return Err(self.unavailable(format!("文件不存在: {}", self.path.display())));
            }
            Err(e) => return Err(self.unavailable(format!("读取文件失败: {}", e))),
        };

        let content = if self.env_substitution {
            substitute_env_vars(&content).map_err(|var| SourceError::EnvVar {
                store: self.name.clone(),
                var,
            })?
        } else {
            content
        };

        let document = self.resolve_format().parse(&self.name, &content)?;
        info!("成功读取配置文件: {}", self.path.display());
        Ok(document)
    }

    fn watch_path(&self) -> Option<&Path> {
        self.watched.then_some(self.path.as_path())
    }

    fn is_optional(&self) -> bool {
        self.optional
    }
}
