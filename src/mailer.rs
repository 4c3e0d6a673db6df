//! Notifying repository administrators.
//!
//! Actual mail delivery belongs to the surrounding infrastructure; the engine
//! emits structured notification events and an external agent (or a human
//! tailing the log) takes it from there.

use tracing::warn;

/// Emits admin notifications.
pub trait Mailer: Send + Sync {
    /// Tell `recipients` that something needs their attention.
    fn send(&self, recipients: &[String], subject: &str, body: &str);
}

/// A mailer that emits notifications as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMailer;

impl Mailer for LoggingMailer {
    fn send(&self, recipients: &[String], subject: &str, body: &str) {
        warn!(
            recipients = %recipients.join(", "),
            subject,
            "admin notification: {body}"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Mailer;
    use std::sync::{Arc, Mutex};

    /// Records every notification for assertions.
    #[derive(Debug, Default, Clone)]
    pub struct RecordingMailer {
        pub sent: Arc<Mutex<Vec<(Vec<String>, String)>>>,
    }

    impl Mailer for RecordingMailer {
        fn send(&self, recipients: &[String], subject: &str, _body: &str) {
            self.sent
                .lock()
                .expect("mailer lock")
                .push((recipients.to_vec(), subject.to_owned()));
        }
    }
}
