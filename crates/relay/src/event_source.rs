//! Feeds the event bus from a stream of newline delimited JSON events.

use {
    crate::event_bus::EventBus,
    anyhow::{Context, Result},
    model::event::Event,
    std::path::{Path, PathBuf},
    tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader},
};

/// Reading from this path means reading from stdin.
pub const STDIN: &str = "-";

pub struct EventSource {
    path: PathBuf,
}

impl EventSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Publishes every event of the stream until it ends. Returns the number
    /// of published events.
    pub async fn forward(&self, bus: &EventBus) -> Result<usize> {
        if self.path == Path::new(STDIN) {
            tracing::info!("reading events from stdin");
            return forward_lines(BufReader::new(tokio::io::stdin()), bus).await;
        }
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("open event source {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), "reading events");
        forward_lines(BufReader::new(file), bus).await
    }
}

async fn forward_lines(reader: impl AsyncBufRead + Unpin, bus: &EventBus) -> Result<usize> {
    let mut lines = reader.lines();
    let mut published = 0;
    let mut line_number = 0_usize;
    while let Some(line) = lines.next_line().await.context("read event")? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event = match serde_json::from_str::<Event>(line) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(?err, line = line_number, "skipping malformed event");
                Metrics::get().malformed_events.inc();
                continue;
            }
        };
        bus.publish(event).await?;
        published += 1;
    }
    tracing::info!(published, "event source ended");
    Ok(published)
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "event_source")]
struct Metrics {
    /// Lines of the event stream that could not be parsed.
    malformed_events: prometheus::IntCounter,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::event_bus::Subscriber,
        model::event::{BlockEnd, EventKind},
        std::sync::{Arc, Mutex},
    };

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    #[async_trait::async_trait]
    impl Subscriber for Recorder {
        async fn on_success(&self, event: &Event) -> Result<()> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn skips_malformed_lines() {
        let input = concat!(
            r#"{"type":"blockEnd","blockNumber":1,"blockHash":"#,
            r#""0x0000000000000000000000000000000000000000000000000000000000000001"}"#,
            "\n",
            "\n",
            r#"{"type":"blockEnd","blockNumber":"#,
            "\n",
            r#"{"type":"unknown"}"#,
            "\n",
            r#"{"type":"blockEnd","blockNumber":2,"blockHash":"#,
            r#""0x0000000000000000000000000000000000000000000000000000000000000002"}"#,
        );
        let bus = EventBus::new(4);
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(EventKind::BlockEnd, recorder.clone());

        let published = forward_lines(input.as_bytes(), &bus).await.unwrap();
        bus.shutdown().await;

        assert_eq!(published, 2);
        let blocks = recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|event| match event {
                Event::BlockEnd(BlockEnd { block_number, .. }) => *block_number,
                _ => unreachable!(),
            })
            .collect::<Vec<_>>();
        assert_eq!(blocks, [1, 2]);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let bus = EventBus::new(1);
        let source = EventSource::new(PathBuf::from("/nonexistent/relay/events.ndjson"));
        assert!(source.forward(&bus).await.is_err());
    }
}
