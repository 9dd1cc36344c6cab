use tokio::sync::broadcast;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Fans formatted log lines into a broadcast channel so live tails can
/// follow the runtime, optionally mirroring them to stdout.
#[derive(Clone)]
pub struct BroadcastMakeWriter {
    pub sender: broadcast::Sender<String>,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for BroadcastMakeWriter {
    type Writer = BroadcastWriter;

    fn make_writer(&'a self) -> Self::Writer {
        BroadcastWriter {
            sender: self.sender.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub struct BroadcastWriter {
    sender: broadcast::Sender<String>,
    suppress_stdout: bool,
}

impl std::io::Write for BroadcastWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf).to_string();
        let _ = self.sender.send(line); // no receivers is fine
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Install the global subscriber. Returns the log broadcast sender; a second
/// call in the same process keeps the first subscriber.
pub fn init_logging(level: tracing::Level, suppress_stdout: bool) -> broadcast::Sender<String> {
    let (log_tx, _) = broadcast::channel::<String>(500);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(BroadcastMakeWriter {
            sender: log_tx.clone(),
            suppress_stdout,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_tx
}
