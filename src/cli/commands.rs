//! 命令处理逻辑
//!
//! 实现各种CLI命令的处理逻辑

use crate::cli::args::{Args, Commands, OutputFormat};
use crate::config::settings::{RelaySettings, SettingsLoader};
use crate::config::snapshot::ConfigSnapshot;
use crate::config::source::ConfigSource;
use crate::error::Result;
use crate::relay::Relay;
use crate::unit::Reconfigurable;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use tracing::info;

/// 命令处理器trait
#[async_trait]
pub trait Command: Send + Sync {
    /// 执行命令
    async fn execute(&self, args: &Args) -> Result<()>;
}

/// 读取命令行指定（或默认位置）的运行参数
pub async fn load_settings(args: &Args) -> Result<RelaySettings> {
    let path = args.get_settings_path();
    Ok(SettingsLoader::default().load_from_file(&path).await?)
}

/// 取出快照中某个路径下的配置，路径为空时返回整个文档
fn select_slice(snapshot: &ConfigSnapshot, path: Option<&str>) -> Result<Value> {
    match path {
        None => Ok(Value::Object(snapshot.document().clone())),
        Some(path) => snapshot
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("配置中不存在路径: {}", path).into()),
    }
}

fn print_json(value: &Value, compact: bool) -> Result<()> {
    let text = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{}", text);
    Ok(())
}

/// 合并命令
pub struct MergeCommand;

#[async_trait]
impl Command for MergeCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        if let Commands::Merge {
            defaults,
            override_file,
            path,
            compact,
        } = &args.command
        {
            let source = if defaults.is_some() || override_file.is_some() {
                let mut builder = ConfigSource::builder();
                if let Some(defaults) = defaults {
                    builder = builder.defaults_file(defaults);
                }
                if let Some(override_file) = override_file {
                    builder = builder.override_file(override_file);
                }
                builder.build()
            } else {
                load_settings(args).await?.config_source()
            };

            let snapshot = ConfigSnapshot::new(source.merge().await?);
            let value = select_slice(&snapshot, path.as_deref())?;
            print_json(&value, *compact)?;
        }
        Ok(())
    }
}

/// 打印每一次应用的配置的组件
pub struct PrintingUnit {
    path: Option<String>,
}

impl PrintingUnit {
    /// 创建组件，`path` 为空时打印整个配置
    pub fn new(path: Option<String>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Reconfigurable for PrintingUnit {
    type State = Value;

    fn name(&self) -> &str {
        "printer"
    }

    async fn read_configuration(
        &self,
        conf: &ConfigSnapshot,
        previous: Option<&Value>,
        force: bool,
    ) -> anyhow::Result<Value> {
        let slice = select_slice(conf, self.path.as_deref())?;
        if force || previous != Some(&slice) {
            println!(
                "# 配置版本 {} ({})",
                conf.version(),
                conf.produced_at().to_rfc3339()
            );
            println!("{}", serde_json::to_string_pretty(&slice)?);
        }
        Ok(slice)
    }
}

/// 监控命令
pub struct WatchCommand;

#[async_trait]
impl Command for WatchCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        if let Commands::Watch { path } = &args.command {
            let settings = load_settings(args).await?;
            let relay = Relay::from_settings(&settings);

            let mut handle = relay.start_source(settings.config_source()).await?;
            let unit = relay.unit(PrintingUnit::new(path.clone()));
            unit.start().await?;
            info!("配置中继已启动，按 Ctrl-C 停止");

            tokio::signal::ctrl_c().await?;
            info!("收到中断信号，正在停止...");

            unit.stop().await?;
            handle.stop();

            let stats = unit.stats();
            info!(
                "配置中继已停止: 应用 {} 次，失败 {} 次，跳过 {} 次",
                stats.applied, stats.failed, stats.skipped
            );
        }
        Ok(())
    }
}

/// 验证命令
pub struct ValidateCommand;

#[async_trait]
impl Command for ValidateCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        if let Commands::Validate {
            settings_path,
            check_stores,
            verbose,
        } = &args.command
        {
            let path = settings_path
                .clone()
                .unwrap_or_else(|| args.get_settings_path());
            self.validate_settings_file(&path, *check_stores, *verbose)
                .await
        } else {
            Ok(())
        }
    }
}

impl ValidateCommand {
    /// 验证运行参数文件
    async fn validate_settings_file(
        &self,
        path: &Path,
        check_stores: bool,
        verbose: bool,
    ) -> Result<()> {
        println!("验证运行参数文件: {}", path.display());
        let settings = SettingsLoader::default().load_from_file(path).await?;
        println!("✓ 运行参数验证通过");

        if verbose {
            let show = |p: &Option<std::path::PathBuf>| {
                p.as_ref()
                    .map_or_else(|| "-".to_string(), |p| p.display().to_string())
            };
            println!("  默认配置: {}", show(&settings.defaults_path));
            println!(
                "  覆盖配置: {}{}",
                show(&settings.override_path),
                if settings.override_optional { "（可选）" } else { "" }
            );
            println!("  防抖动: {}ms", settings.debounce_ms);
            println!("  最大并发重载: {}", settings.max_concurrent_reloads);
            println!("  队列容量: {}", settings.queue_capacity);
            println!(
                "  获取超时: {}",
                settings
                    .fetch_timeout_ms
                    .map_or_else(|| "不限".to_string(), |ms| format!("{}ms", ms))
            );
            println!("  日志级别: {}", settings.log_level);
        }

        if check_stores {
            let document = settings.config_source().merge().await?;
            println!("✓ 配置存储合并成功，顶层键 {} 个", document.len());
        }

        Ok(())
    }
}

/// 版本命令
pub struct VersionCommand;

#[async_trait]
impl Command for VersionCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        if let Commands::Version { format } = &args.command {
            match format {
                OutputFormat::Json => {
                    let version_info = serde_json::json!({
                        "name": crate::APP_NAME,
                        "version": crate::VERSION,
                        "description": crate::APP_DESCRIPTION
                    });
                    println!("{}", serde_json::to_string_pretty(&version_info)?);
                }
                OutputFormat::Text => {
                    println!("{} v{}", crate::APP_NAME, crate::VERSION);
                    println!("{}", crate::APP_DESCRIPTION);
                }
            }
        }
        Ok(())
    }
}

/// 按子命令执行
pub async fn execute_command(args: &Args) -> Result<()> {
    let command: Box<dyn Command> = match &args.command {
        Commands::Merge { .. } => Box::new(MergeCommand),
        Commands::Watch { .. } => Box::new(WatchCommand),
        Commands::Validate { .. } => Box::new(ValidateCommand),
        Commands::Version { .. } => Box::new(VersionCommand),
    };
    command.execute(args).await
}
