//! Toast/sound alert delivery (Section 4.3.4, 9).
//!
//! Presentation of the notification is out of core scope (Section 1);
//! this trait only specifies "delivered or not". The `log` channel is
//! handled separately, in-process, by the ALERT worker itself.

use async_trait::async_trait;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, title: &str, message: &str) -> bool;
    async fn play_sound(&self, sound: &str) -> bool;
}

pub struct DesktopAlertSink;

#[async_trait]
impl AlertSink for DesktopAlertSink {
    async fn notify(&self, title: &str, message: &str) -> bool {
        let title = title.to_string();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || {
            notify_rust::Notification::new()
                .summary(&title)
                .body(&message)
                .show()
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }

    async fn play_sound(&self, sound: &str) -> bool {
        if sound == "none" {
            return true;
        }
        let title = "orcd alert".to_string();
        let sound = sound.to_string();
        tokio::task::spawn_blocking(move || {
            notify_rust::Notification::new()
                .summary(&title)
                .sound_name(&sound)
                .show()
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }
}

/// In-memory fake used in tests so the worker suite runs headless.
#[derive(Default)]
pub struct FakeAlertSink {
    pub delivered: std::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl AlertSink for FakeAlertSink {
    async fn notify(&self, title: &str, message: &str) -> bool {
        self.delivered
            .lock()
            .expect("fake alert sink lock poisoned")
            .push((title.to_string(), message.to_string()));
        true
    }

    async fn play_sound(&self, _sound: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_sink_records_notifications() {
        let sink = FakeAlertSink::default();
        assert!(sink.notify("title", "message").await);
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }
}
