//! Notification collaborator.

use log::info;

/// Surfaces a newly persisted inbound message to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str, channel_id: &str);
}

/// Notifier that writes to the log; used when no platform notifier is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str, channel_id: &str) {
        info!("[{}] {}: {}", channel_id, title, body);
    }
}
