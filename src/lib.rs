pub mod agent_core;
pub mod stream;

pub use agent_core::{
    AgentConfig, AgentError, RateGovernor, Tool, ToolDispatcher, ToolRegistry, TurnLoop,
    TurnOutcome,
};
pub use stream::{HttpTransport, StreamError, StreamEvent, ToolCall, ToolResult, Transport};

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::fmt::MakeWriter;

use agent_core::config::LoggingConfig;

/// Return the platform-standard data directory for toolstream.
///
/// - macOS: `~/Library/Application Support/toolstream/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolstream\`
/// - Linux: `$XDG_DATA_HOME/toolstream/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolstream/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolstream");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolstream")
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `logging.filter`. With `logging.file`
/// set, the existing file is rotated (keeping the last 3) and every line is
/// flushed as it is written; otherwise logs go to stderr.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), AgentError> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| AgentError::Config {
            reason: format!("invalid log filter '{}': {e}", config.filter),
        })?;

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let log_path = config.file_path();
    let installed = match (&log_path, config.json) {
        (Some(path), json) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            rotate_log_file(path, 3);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let writer = FlushingWriter::new(file);
            let builder = builder.with_writer(writer).with_ansi(false);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        (None, true) => builder.with_writer(std::io::stderr).json().try_init(),
        (None, false) => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| AgentError::Config {
        reason: format!("failed to install tracing subscriber: {e}"),
    })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== toolstream starting ==="
    );
    Ok(())
}

/// Shift `path` to `path.1`, `path.1` to `path.2` and so on, dropping `path.{keep}`.
fn rotate_log_file(path: &Path, keep: u32) {
    let numbered = |n: u32| PathBuf::from(format!("{}.{n}", path.display()));

    let _ = std::fs::remove_file(numbered(keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(numbered(n), numbered(n + 1));
    }
    if path.exists() {
        let _ = std::fs::rename(path, numbered(1));
    }
}

/// Log file writer shared by every subscriber thread; flushes each write.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn locked(&self) -> io::Result<MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.locked()?;
        let written = file.write(buf)?;
        file.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.locked()?.flush()
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
