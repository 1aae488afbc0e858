use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/** \brief 文件日志的写入守卫，进程存活期间保持。 */
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

pub const LOG_DIR: &str = "logs";
pub const LOG_FILE: &str = "lucidselect.log";

/**
 * \brief 初始化日志：始终输出到 stderr；开启遥测时额外写入 logs/lucidselect.log。
 * \details 级别由 `RUST_LOG` 控制，默认 info。重复调用不会报错。
 */
pub fn init(file_logging: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let file_layer = if file_logging {
        std::fs::create_dir_all(LOG_DIR)?;
        let appender = tracing_appender::rolling::never(LOG_DIR, LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        if FILE_GUARD.set(guard).is_err() {
            return Ok(());
        }
        Some(fmt::layer().with_writer(writer).with_ansi(false))
    } else {
        None
    };

    // 已有全局 subscriber 时（例如测试中重复初始化）保持原样
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Ok(())
}
