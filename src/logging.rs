//! Structured logging for a binary hosting this crate.
//!
//! The dispatch core itself never installs a subscriber — it only emits
//! `tracing` spans/events (queue construction, admission decisions, dispose,
//! fast-restart), which are inert until a subscriber exists. A hosting binary
//! opts in by calling [`init_tracing_with_style`] once at startup.

use std::env;
use std::fmt;
use std::io::IsTerminal as _;
use std::sync::OnceLock;

static ANSI_ENABLED: OnceLock<bool> = OnceLock::new();

fn should_enable_ansi() -> bool {
    match env::var("PIPQUEUE_COLOR").ok().as_deref() {
        Some("always") => return true,
        Some("never") => return false,
        _ => {}
    }
    if env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if matches!(env::var("CLICOLOR_FORCE").ok().as_deref(), Some("1")) {
        return true;
    }
    if matches!(env::var("CLICOLOR").ok().as_deref(), Some("0")) {
        return false;
    }
    std::io::stdout().is_terminal()
}

/// Installs a global `tracing` subscriber with the core's own formatter.
///
/// Respects `RUST_LOG` (via `EnvFilter`), falling back to `info`. Idempotent
/// in the sense that a second call is a harmless no-op if a subscriber is
/// already installed (the underlying `try_init` error is ignored).
pub fn init_tracing_with_style() {
    let ansi = should_enable_ansi();
    let _ = ANSI_ENABLED.set(ansi);
    #[allow(deprecated)]
    {
        colored::control::set_override(ansi);
    }

    use tracing_subscriber::{EnvFilter, fmt::time::UtcTime};
    let formatter = DispatchFormatter {
        ansi,
        timer: UtcTime::rfc_3339(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .event_format(formatter)
        .try_init();
}

pub fn ansi_enabled() -> bool {
    *ANSI_ENABLED.get().unwrap_or(&false)
}

use colored::Colorize;
use tracing::Event;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

#[derive(Clone)]
struct DispatchFormatter<T> {
    ansi: bool,
    timer: T,
}

impl<S, N, T> FormatEvent<S, N> for DispatchFormatter<T>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
    T: FormatTime + Send + Sync,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        self.timer.format_time(&mut writer)?;
        write!(writer, " ")?;

        let meta = event.metadata();
        let level = meta.level();
        let target = meta.target();
        let file = meta.file().unwrap_or("?");
        let line = meta
            .line()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "?".into());

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let message = visitor.take_message();
        let kv = visitor.format_kv();

        let (lvl_colored, width) = match *level {
            tracing::Level::ERROR => ("ERROR".red().bold().to_string(), 5),
            tracing::Level::WARN => ("WARN".yellow().bold().to_string(), 4),
            tracing::Level::INFO => ("INFO".green().bold().to_string(), 4),
            tracing::Level::DEBUG => ("DEBUG".blue().bold().to_string(), 5),
            tracing::Level::TRACE => ("TRACE".magenta().bold().to_string(), 5),
        };
        let lvl_padded = if self.ansi {
            format!("{lvl_colored: <width$}")
        } else {
            format!("{:<width$}", level, width = width)
        };

        let src = if self.ansi {
            format!("{}:{}", file, line).dimmed().to_string()
        } else {
            format!("{}:{}", file, line)
        };

        let target_s = if self.ansi {
            target.dimmed().to_string()
        } else {
            target.to_string()
        };

        write!(writer, "{} {}: {} ", lvl_padded, target_s, src)?;

        if let Some(msg) = message {
            write!(writer, "{}", msg)?;
            if !kv.is_empty() {
                write!(writer, " {}", kv)?;
            }
        } else if !kv.is_empty() {
            write!(writer, "{}", kv)?;
        }

        if let Some(curr) = ctx.lookup_current() {
            let scope = curr.scope();
            let spans: Vec<_> = scope.from_root().collect();
            if !spans.is_empty() {
                write!(writer, " ")?;
                if self.ansi {
                    write!(writer, "{}", "[".dimmed())?;
                } else {
                    write!(writer, "[")?;
                }
                for (i, span) in spans.iter().enumerate() {
                    if i > 0 {
                        if self.ansi {
                            write!(writer, "{}", ", ".dimmed())?;
                        } else {
                            write!(writer, ", ")?;
                        }
                    }
                    let name = span.name();
                    if self.ansi {
                        write!(writer, "{}", name.cyan())?;
                    } else {
                        write!(writer, "{}", name)?;
                    }
                }
                if self.ansi {
                    write!(writer, "{}", "]".dimmed())?;
                } else {
                    write!(writer, "]")?;
                }
            }
        }

        writeln!(writer)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<String>,
}

impl FieldVisitor {
    fn take_message(&mut self) -> Option<String> {
        self.message.take()
    }
    fn format_kv(&self) -> String {
        if self.fields.is_empty() {
            String::new()
        } else {
            self.fields.join(" ")
        }
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push(format!("{}=\"{}\"", field.name(), value));
        }
    }
}
