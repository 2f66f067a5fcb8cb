//! Tracing layer that renders events into the journal.

use std::fmt::{self, Write};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use super::line::{BoundedLine, MESSAGE_CAPACITY};
use super::sink::Priority;
use super::Journal;

/// Routes every enabled tracing event to a [`Journal`].
///
/// The message is rendered first, then the structured fields as
/// `key=value` pairs, all within one bounded line.
pub struct JournalLayer {
    journal: Arc<Journal>,
}

impl JournalLayer {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self { journal }
    }
}

impl<S: Subscriber> Layer<S> for JournalLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let mut line = visitor.message;
        line.push_str(visitor.fields.as_str());

        let priority = Priority::from(*event.metadata().level());
        self.journal.dispatch(priority, line.as_str());
    }
}

#[derive(Default)]
struct LineVisitor {
    message: BoundedLine<MESSAGE_CAPACITY>,
    fields: BoundedLine<MESSAGE_CAPACITY>,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::sink::{Channel, Sink};
    use std::io;
    use std::sync::Mutex;
    use tracing_subscriber::layer::SubscriberExt;

    struct Capture(Arc<Mutex<Vec<(Priority, String)>>>);

    impl Sink for Capture {
        fn channel(&self) -> Channel {
            Channel::Console
        }

        fn write_line(&self, priority: Priority, message: &str) -> io::Result<()> {
            self.0.lock().unwrap().push((priority, message.to_string()));
            Ok(())
        }
    }

    #[test]
    fn test_event_rendering() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let journal = Arc::new(Journal::new(vec![Box::new(Capture(Arc::clone(&lines)))]));
        let subscriber = tracing_subscriber::registry().with(JournalLayer::new(journal));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(path = %"/sys", errno = 19, "mount failed");
            tracing::info!("wrapper starting");
        });

        let lines = lines.lock().unwrap();
        assert_eq!(
            lines[0],
            (Priority::Warning, "mount failed path=/sys errno=19".to_string())
        );
        assert_eq!(lines[1], (Priority::Info, "wrapper starting".to_string()));
    }
}
