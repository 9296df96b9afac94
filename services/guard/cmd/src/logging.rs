use guard_session::CONNECTION_SPAN;
use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 16;
const LOG_LEVEL_WIDTH: usize = 7;

/// `[timestamp] [component] [level] {connection} message` formatter.
///
/// Events may carry a `component` field (`info!(component = "server", ...)`);
/// otherwise the service name is printed. Events emitted inside a device
/// connection span get that span's fields (peer, device, connection id) in
/// braces; an event's own `device_id` field is used when no span is open.
pub struct GuardLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl GuardLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    pub fn color_enabled(&self) -> bool {
        self.color_enabled
    }

    fn format_component(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let head: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", head)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };

        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH)
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for GuardLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let color = self.color_for_level(level);
        let reset = if self.color_enabled { COLOR_RESET } else { "" };
        let cyan = if self.color_enabled { COLOR_CYAN } else { "" };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan,
            timestamp,
            self.format_component(visitor.component.as_deref()),
            color,
            self.format_log_level(level),
            reset
        )?;

        match connection_context(ctx) {
            Some(fields) => write!(writer, "{{{}}} ", fields)?,
            None => {
                if let Some(device_id) = &visitor.device_id {
                    write!(writer, "{{device_id={}}} ", device_id)?;
                }
            }
        }

        writeln!(writer, "{}{}", visitor.message, reset)
    }
}

/// Fields of the innermost connection span the event was emitted in.
fn connection_context<S, N>(ctx: &FmtContext<'_, S, N>) -> Option<String>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let scope = ctx.event_scope()?;
    let span = scope.into_iter().find(|span| span.name() == CONNECTION_SPAN)?;
    let extensions = span.extensions();
    let fields = extensions.get::<FormattedFields<N>>()?;
    if fields.is_empty() {
        None
    } else {
        Some(fields.to_string())
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    device_id: Option<String>,
}

fn unquote(value: String) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => value,
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = unquote(format!("{:?}", value)),
            "component" => self.component = Some(unquote(format!("{:?}", value))),
            "device_id" => self.device_id = Some(unquote(format!("{:?}", value))),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            "device_id" => self.device_id = Some(value.to_string()),
            _ => {}
        }
    }
}

fn is_terminal() -> bool {
    if std::env::var("TERM").unwrap_or_default() == "dumb" {
        return false;
    }
    std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::{info, info_span};

    #[derive(Clone)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_lines(emit: impl FnOnce()) -> Vec<String> {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Capture(buf.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .event_format(plain("guard"))
            .finish();
        tracing::subscriber::with_default(subscriber, emit);

        let out = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        out.lines().map(str::to_string).collect()
    }

    fn plain(service: &str) -> GuardLogFormatter {
        GuardLogFormatter {
            service_name: service.to_string(),
            color_enabled: false,
        }
    }

    #[test]
    fn test_component_padding() {
        let formatter = plain("guard");
        assert_eq!(formatter.format_component(None), format!("{:<16}", "guard"));
        assert_eq!(
            formatter.format_component(Some("server")).trim_end(),
            "guard-server"
        );

        let long = formatter.format_component(Some("notification-listener"));
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_plain_output_has_no_colors() {
        let formatter = plain("guard");
        assert_eq!(formatter.color_for_level(&tracing::Level::ERROR), "");
        assert!(formatter
            .format_log_level(&tracing::Level::WARN)
            .starts_with("⚠ WARN"));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"client\"".to_string()), "client");
        assert_eq!(unquote("42".to_string()), "42");
    }

    #[test]
    fn test_connection_span_fields_are_printed() {
        let lines = capture_lines(|| {
            let span = info_span!(CONNECTION_SPAN, device_id = "laptop-1", conn_id = 7u64);
            let _entered = span.enter();
            info!(component = "notify", "Greeting sent");
        });

        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert!(line.contains("[guard-notify"));
        assert!(line.contains("laptop-1"));
        assert!(line.contains("conn_id=7"));
        assert!(line.ends_with("Greeting sent"));
    }

    #[test]
    fn test_event_device_id_without_span() {
        let lines = capture_lines(|| {
            info!(device_id = "kiosk-2", "Device registered");
            info!("Listener running");
        });

        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("{device_id=kiosk-2} Device registered"));
        assert!(!lines[1].contains('{'));
    }
}
