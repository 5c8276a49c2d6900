//! Config Relay 主程序入口
//!
//! 进程内配置分发与热重载

use anyhow::{Context, Result};
use clap::Parser;
use config_relay::cli::args::{Args, Commands};
use config_relay::cli::execute_command;
use config_relay::config::SettingsLoader;
use config_relay::logging::LoggingSystem;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Args::parse();

    // 运行参数中的日志设置；读取失败时由具体命令报告错误
    let settings = match &args.command {
        Commands::Version { .. } => None,
        _ => SettingsLoader::default()
            .load_from_file(args.get_settings_path())
            .await
            .ok(),
    };

    let _logging_system = LoggingSystem::setup_logging(args.log_config(settings.as_ref()))
        .context("初始化日志系统失败")?;

    info!("Config Relay v{} 启动", config_relay::VERSION);

    // 执行命令
    if let Err(e) = execute_command(&args).await {
        error!("命令执行失败: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
