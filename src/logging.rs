use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统
///
/// 指定 `log_file` 时日志按天滚动写入文件，返回的 guard 需要在进程退出前保持存活。
pub fn init_logging(
    log_level: &str,
    log_format: Option<&str>,
    log_file: Option<&str>,
    quiet: bool,
) -> Result<Option<WorkerGuard>> {
    // 如果静默模式，只输出错误
    let level = if quiet { "error" } else { log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard, ansi) = match log_file {
        Some(file) => {
            let path = Path::new(file);
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("无效的日志文件路径: {}", file))?;

            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), None, true),
    };

    match log_format {
        Some("json") => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(writer))
                .try_init()?;
        }
        Some("pretty") | Some("dev") => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_ansi(ansi).with_writer(writer))
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_ansi(ansi).with_writer(writer))
                .try_init()?;
        }
    }

    Ok(guard)
}
