use smtp_blast::{Event, Reporter};

/// Prints one line per send outcome on stdout. Connection trouble goes to
/// stderr.
pub(crate) struct ConsoleReporter;

impl ConsoleReporter {
    fn event_connected(&self, worker: &str) {
        tracing::debug!(worker, "connected to server");
    }
    fn event_closed(&self, worker: &str) {
        tracing::debug!(worker, "connection closed");
    }
    fn event_connection_failed(&self, worker: &str, error: &smtp_blast::Error) {
        eprintln!("thread {} could not connect: {}", worker, error);
    }
    fn event_mail_sent(&self, sequence: u64, worker: &str) {
        println!("Successfully sent email #{} from thread {}", sequence, worker);
    }
    fn event_mail_failed(&self, sequence: u64, worker: &str, error: &smtp_blast::Error) {
        println!(
            "Error sending email #{} from thread {}: {}",
            sequence, worker, error
        );
    }
}

impl Reporter for ConsoleReporter {
    fn event(&self, event: Event) {
        match event {
            Event::Connected { worker } => self.event_connected(&worker),
            Event::ConnectFailed { worker, error } => {
                self.event_connection_failed(&worker, &error)
            }
            Event::Sent { sequence, worker } => self.event_mail_sent(sequence, &worker),
            Event::Failed {
                sequence,
                worker,
                error,
            } => self.event_mail_failed(sequence, &worker, &error),
            Event::Closed { worker } => self.event_closed(&worker),
        }
    }
}
