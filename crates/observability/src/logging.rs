//! Subscriber installation.
//!
//! Lines are JSON by default. Besides its own fields every line carries the
//! innermost span (`span`) and, with [`LogConfig::with_span_list`], the whole
//! span stack (`spans`). Consumers handle each entry inside a `consume` span
//! naming the subscription and the entry, and commands run inside a span
//! naming the command id. A failure logged deep inside a handler therefore
//! points back at the event or command that caused it without every call site
//! repeating those fields.

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable selecting the line format.
pub const FORMAT_ENV: &str = "EVENTLINE_LOG_FORMAT";

/// How each log line is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    /// Human readable single lines, for local runs.
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "compact" | "text" => Some(LogFormat::Compact),
            _ => None,
        }
    }
}

/// Filter and format of the process-wide subscriber.
#[derive(Debug, Clone)]
pub struct LogConfig {
    directive: String,
    format: LogFormat,
    span_list: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info")
    }
}

impl LogConfig {
    pub fn new(directive: impl Into<String>) -> Self {
        Self {
            directive: directive.into(),
            format: LogFormat::default(),
            span_list: false,
        }
    }

    /// `RUST_LOG` replaces `default_directive`; [`FORMAT_ENV`] picks the format.
    pub fn from_env(default_directive: &str) -> Self {
        Self::from_lookup(default_directive, |key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(default_directive: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let directive = lookup(EnvFilter::DEFAULT_ENV)
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| default_directive.to_string());
        let format = lookup(FORMAT_ENV)
            .and_then(|f| LogFormat::parse(&f))
            .unwrap_or_default();
        Self::new(directive).with_format(format)
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Emit the full span stack on JSON lines, outermost first.
    pub fn with_span_list(mut self, enabled: bool) -> Self {
        self.span_list = enabled;
        self
    }

    pub fn directive(&self) -> &str {
        &self.directive
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }
}

/// Build a subscriber for `config` that writes to `writer`.
pub fn subscriber<W>(config: &LogConfig, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.directive))
        .with_timer(SystemTime)
        .with_target(false)
        .with_writer(writer);

    match config.format {
        LogFormat::Json => Box::new(
            builder
                .json()
                .with_current_span(true)
                .with_span_list(config.span_list)
                .finish(),
        ),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    }
}

/// Install the process-wide subscriber on stdout.
///
/// Returns `false` when one is already installed; the first one stays.
pub fn install(config: &LogConfig) -> bool {
    subscriber(config, std::io::stdout).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn lines(&self) -> Vec<serde_json::Value> {
            let raw = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
            raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
        }
    }

    fn capture(config: &LogConfig) -> (Captured, Box<dyn Subscriber + Send + Sync>) {
        let out = Captured::default();
        let writer = out.clone();
        (out, subscriber(config, move || writer.clone()))
    }

    #[test]
    fn environment_overrides_directive_and_format() {
        let env = HashMap::from([
            ("RUST_LOG", "eventline_infra=trace"),
            (FORMAT_ENV, "Compact"),
        ]);
        let config = LogConfig::from_lookup("info", |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.directive(), "eventline_infra=trace");
        assert_eq!(config.format(), LogFormat::Compact);

        let config = LogConfig::from_lookup("warn", |k| {
            (k == FORMAT_ENV).then(|| "yaml".to_string())
        });
        assert_eq!(config.directive(), "warn");
        assert_eq!(config.format(), LogFormat::Json);
    }

    #[test]
    fn json_lines_carry_the_enclosing_span() {
        let (out, subscriber) = capture(&LogConfig::new("debug"));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("consume", subscription = "billing", entry = "#7@paid");
            let _entered = span.enter();
            tracing::warn!(handler = "ledger", "handler failed");
            tracing::trace!("filtered out");
        });

        let lines = out.lines();
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line["level"], "WARN");
        assert_eq!(line["fields"]["message"], "handler failed");
        assert_eq!(line["fields"]["handler"], "ledger");
        assert_eq!(line["span"]["name"], "consume");
        assert_eq!(line["span"]["subscription"], "billing");
        assert_eq!(line["span"]["entry"], "#7@paid");
        assert!(line.get("spans").is_none());
    }

    #[test]
    fn span_list_names_every_enclosing_span() {
        let (out, subscriber) = capture(&LogConfig::new("info").with_span_list(true));

        tracing::subscriber::with_default(subscriber, || {
            let outer = tracing::info_span!("catch_up", subscription = "billing");
            let _outer = outer.enter();
            let inner = tracing::info_span!("consume", entry = "#8@refunded");
            let _inner = inner.enter();
            tracing::info!("delivered");
        });

        let lines = out.lines();
        let names: Vec<_> = lines[0]["spans"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["catch_up", "consume"]);
        assert_eq!(lines[0]["span"]["name"], "consume");
    }

    #[test]
    fn repeated_install_keeps_the_first_subscriber() {
        install(&LogConfig::new("debug"));
        assert!(!install(&LogConfig::new("warn")));
        crate::init();
        tracing::info!(attempt = 3, "still logging");
    }
}
