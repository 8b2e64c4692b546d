pub mod config;

use tracing::metadata::LevelFilter;
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::fmt::format::{FmtSpan, Format};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;

use crate::config::{config, LogFormat};

pub fn init_logging(name: &str) -> Option<WorkerGuard> {
    init_logging_with_filter(
        name,
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    )
}

macro_rules! register_log {
    ($e: expr, $nonblocking: expr, $filter: expr) => {{
        let layer = $e;
        let result = if let Some(nonblocking) = $nonblocking {
            tracing::subscriber::set_global_default(
                Registry::default().with(layer.with_writer(nonblocking).with_filter($filter)),
            )
        } else {
            tracing::subscriber::set_global_default(
                Registry::default().with(layer.with_writer(std::io::stderr).with_filter($filter)),
            )
        };

        if let Err(e) = result {
            eprintln!("Unable to set global log subscriber: {}", e);
        }
    }};
}

/// Installs the global tracing subscriber in the format chosen by
/// `logging.format`, plus a panic hook that reports through tracing. The
/// returned guard must be held for the life of the process when nonblocking
/// logging is enabled.
pub fn init_logging_with_filter(name: &str, filter: EnvFilter) -> Option<WorkerGuard> {
    let logging = config().logging.clone();

    let (nonblocking, guard) = if logging.nonblocking {
        let (nonblocking, guard) = NonBlockingBuilder::default()
            .buffered_lines_limit(logging.buffered_lines_limit)
            .finish(std::io::stderr());
        (Some(nonblocking), Some(guard))
    } else {
        (None, None)
    };

    match logging.format {
        LogFormat::Plaintext => {
            register_log!(
                tracing_subscriber::fmt::layer()
                    .with_line_number(logging.enable_file_line)
                    .with_file(logging.enable_file_name)
                    .with_span_events(FmtSpan::NONE),
                nonblocking,
                filter
            )
        }
        LogFormat::Logfmt => {
            register_log!(
                tracing_subscriber::fmt::layer()
                    .with_line_number(logging.enable_file_line)
                    .with_file(logging.enable_file_name)
                    .event_format(tracing_logfmt::EventsFormatter::default())
                    .fmt_fields(tracing_logfmt::FieldsFormatter::default()),
                nonblocking,
                filter
            )
        }
        LogFormat::Json => {
            register_log!(
                tracing_subscriber::fmt::layer()
                    .with_line_number(logging.enable_file_line)
                    .with_file(logging.enable_file_name)
                    .event_format(Format::default().json()),
                nonblocking,
                filter
            )
        }
    }

    std::panic::set_hook(Box::new(|panic| {
        if let Some(location) = panic.location() {
            tracing::error!(
                message = %panic,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            );
        } else {
            tracing::error!(message = %panic);
        }
    }));

    tracing::info!("initialized logging for {}", name);
    guard
}
