//! Fixed registry of notification channels.

use keel_core::{Notifier, NotifierKind};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::channels::{ChatNotifier, EmailNotifier, IrcNotifier, WebhookNotifier};

/// Channels available to projects, keyed by kind.
#[derive(Clone, Default)]
pub struct NotifierRegistry {
    channels: BTreeMap<NotifierKind, Arc<dyn Notifier>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in channel for each enabled kind.
    pub fn with_enabled(kinds: &[NotifierKind]) -> Self {
        let mut registry = Self::new();
        for kind in kinds {
            let notifier: Arc<dyn Notifier> = match kind {
                NotifierKind::Email => Arc::new(EmailNotifier::new()),
                NotifierKind::Irc => Arc::new(IrcNotifier::new()),
                NotifierKind::Chat => Arc::new(ChatNotifier::new()),
                NotifierKind::Webhook => Arc::new(WebhookNotifier::new()),
            };
            registry.register(notifier);
        }
        registry
    }

    /// Add or replace the channel for `notifier.kind()`.
    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.channels.insert(notifier.kind(), notifier);
    }

    pub fn get(&self, kind: NotifierKind) -> Option<&Arc<dyn Notifier>> {
        self.channels.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = NotifierKind> + '_ {
        self.channels.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_enabled() {
        let registry = NotifierRegistry::with_enabled(&[NotifierKind::Chat, NotifierKind::Email]);
        assert_eq!(
            registry.kinds().collect::<Vec<_>>(),
            vec![NotifierKind::Email, NotifierKind::Chat]
        );
        assert_eq!(registry.get(NotifierKind::Chat).unwrap().kind(), NotifierKind::Chat);
        assert!(registry.get(NotifierKind::Irc).is_none());
    }
}
