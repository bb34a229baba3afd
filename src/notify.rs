//! User notification channel.
//!
//! Notifications are fire-and-forget. A `dedup_key` collapses repeated
//! notifications about the same thing (e.g. one queued operation id) into a
//! single visible message.

use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            dedup_key: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Error, message)
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Oldest dedup keys are forgotten past this many
const SEEN_KEY_CAPACITY: usize = 512;

/// Keys in insertion order, bounded by [`SEEN_KEY_CAPACITY`]
#[derive(Debug, Default)]
struct KeyWindow {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl KeyWindow {
    fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }

        if self.order.len() >= SEEN_KEY_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }

        self.keys.insert(key.to_string());
        self.order.push_back(key.to_string());
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Tracks which dedup keys have recently been shown
#[derive(Debug, Default)]
struct SeenKeys(Mutex<KeyWindow>);

impl SeenKeys {
    /// Returns false if `notification` repeats a recently seen key
    fn first_sighting(&self, notification: &Notification) -> bool {
        let Some(key) = &notification.dedup_key else {
            return true;
        };

        match self.0.lock() {
            Ok(mut seen) => seen.insert(key),
            Err(poisoned) => poisoned.into_inner().insert(key),
        }
    }
}

/// Writes notifications to stderr so stdout stays machine readable.
#[derive(Debug, Default)]
pub struct ConsoleNotifier {
    seen: SeenKeys,
    quiet: bool,
}

impl ConsoleNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress output, still logging each notification
    pub fn quiet() -> Self {
        Self {
            seen: SeenKeys::default(),
            quiet: true,
        }
    }
}

impl Notifier for ConsoleNotifier {
    fn notify(&self, notification: Notification) {
        if !self.seen.first_sighting(&notification) {
            return;
        }

        tracing::debug!(
            level = %notification.level,
            dedup_key = ?notification.dedup_key,
            "{}",
            notification.message
        );

        if !self.quiet {
            eprintln!("[{}] {}", notification.level, notification.message);
        }
    }
}

/// Collects notifications in memory; same-key notifications collapse into one.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    seen: SeenKeys,
    delivered: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        match self.delivered.lock() {
            Ok(delivered) => delivered.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.notifications().into_iter().map(|n| n.message).collect()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: Notification) {
        if !self.seen.first_sighting(&notification) {
            return;
        }

        match self.delivered.lock() {
            Ok(mut delivered) => delivered.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_collapses() {
        let notifier = MemoryNotifier::new();
        notifier.notify(Notification::info("Queued for later sync").with_dedup_key("op-1"));
        notifier.notify(Notification::info("Queued for later sync").with_dedup_key("op-1"));
        notifier.notify(Notification::info("Queued for later sync").with_dedup_key("op-2"));

        assert_eq!(notifier.notifications().len(), 2);
    }

    #[test]
    fn test_keyless_notifications_never_collapse() {
        let notifier = MemoryNotifier::new();
        notifier.notify(Notification::success("2 operations synced"));
        notifier.notify(Notification::success("2 operations synced"));

        assert_eq!(notifier.messages(), vec!["2 operations synced", "2 operations synced"]);
    }

    #[test]
    fn test_notification_constructors() {
        let n = Notification::warning("1 failed, will retry");
        assert_eq!(n.level, NotificationLevel::Warning);
        assert!(n.dedup_key.is_none());

        let n = Notification::error("boom").with_dedup_key("k");
        assert_eq!(n.level, NotificationLevel::Error);
        assert_eq!(n.dedup_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_notification_serializes_lowercase_level() {
        let json = serde_json::to_value(Notification::info("hello")).unwrap();
        assert_eq!(json, serde_json::json!({"level": "info", "message": "hello"}));
    }

    #[test]
    fn test_console_notifier_dedups() {
        let notifier = ConsoleNotifier::quiet();
        let n = Notification::info("queued").with_dedup_key("op-1");
        assert!(notifier.seen.first_sighting(&n));
        assert!(!notifier.seen.first_sighting(&n));
        notifier.notify(Notification::info("no key"));
    }

    #[test]
    fn test_seen_keys_are_bounded() {
        let seen = SeenKeys::default();
        for i in 0..=SEEN_KEY_CAPACITY {
            let n = Notification::info("queued").with_dedup_key(format!("op-{}", i));
            assert!(seen.first_sighting(&n));
        }

        assert_eq!(seen.0.lock().unwrap().len(), SEEN_KEY_CAPACITY);

        // op-0 was evicted, the newest key is still remembered
        let oldest = Notification::info("queued").with_dedup_key("op-0");
        let newest = Notification::info("queued")
            .with_dedup_key(format!("op-{}", SEEN_KEY_CAPACITY));
        assert!(!seen.first_sighting(&newest));
        assert!(seen.first_sighting(&oldest));
    }
}
