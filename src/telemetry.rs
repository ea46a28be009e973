use std::fmt;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::{fmt as fmt_layer, prelude::*, EnvFilter, Layer};

/// Receives every diagnostic line: the message and its context (the module
/// that emitted it).
pub type Sink = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Forwards events to a registered [`Sink`].
pub struct SinkLayer {
    sink: Sink,
}

impl SinkLayer {
    pub fn new(sink: Sink) -> Self {
        SinkLayer { sink }
    }
}

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        (self.sink)(&visitor.line, event.metadata().target());
    }
}

/// Flattens an event into `message key=value ...`.
#[derive(Default)]
struct MessageVisitor {
    line: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        use std::fmt::Write;

        if !self.line.is_empty() {
            self.line.push(' ');
        }
        let _ = if field.name() == "message" {
            write!(self.line, "{:?}", value)
        } else {
            write!(self.line, "{}={:?}", field.name(), value)
        };
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if !self.line.is_empty() {
            self.line.push(' ');
        }
        if field.name() != "message" {
            self.line.push_str(field.name());
            self.line.push('=');
        }
        self.line.push_str(value);
    }
}

pub fn init(sink: Option<Sink>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("seqsched=info"))?;

    let registry = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer::Layer::default())
        .with(sink.map(SinkLayer::new));

    #[cfg(feature = "jaeger")]
    let registry = registry.with(jaeger_layer()?);

    registry.try_init()?;

    Ok(())
}

#[cfg(feature = "jaeger")]
fn jaeger_layer<S>() -> Result<impl Layer<S>, Box<dyn std::error::Error + Send + Sync>>
where
    S: Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    use opentelemetry::global;

    global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

    let tracer = opentelemetry_jaeger::new_collector_pipeline()
        .with_endpoint("http://jaeger:14268/api/traces")
        .with_service_name("seqsched")
        .with_isahc()
        .with_timeout(std::time::Duration::from_secs(2))
        .install_batch(opentelemetry::runtime::Tokio)?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

pub fn shutdown() {
    #[cfg(feature = "jaeger")]
    opentelemetry::global::shutdown_tracer_provider();
}
