use std::env;
use std::io::Write;

use tracing_subscriber::fmt::fmt;
use tracing_subscriber::fmt::time::UtcTime;

#[derive(Debug, Default)]
pub struct Config {
    pub backtraces: bool,
    pub tracing: bool,
    /// Writes the log output to stdout instead of discarding it.
    pub verbose: bool,
}

pub fn init(config: Config) {
    if config.backtraces {
        // SAFETY: called once from `main`, before the runtime spawns any tasks.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    if !config.tracing {
        return;
    }

    let rust_log = if config.verbose {
        "INFO,callonce=debug"
    } else {
        "INFO,callonce=trace"
    };
    let subscriber = fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(rust_log)
        // this should mimic the settings used in production:
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true);

    if config.verbose {
        subscriber.with_writer(std::io::stdout).init();
    } else {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        subscriber.with_writer(|| NoopWriter).init();
    }
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
