// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The seam between the recorder and the surrounding voice client.
//!
//! The TeamSpeak protocol layer is outside this crate; it hands over decoded
//! PCM tagged with a client id plus membership events. The recorder consumes
//! that through [`ChannelSource`] (pull: identities and membership snapshots)
//! and [`ChannelEventBus`] (push: PCM and lifecycle events), keeping the
//! returned [`Subscription`] handles until dispose.

use std::sync::{Arc, Mutex, Weak};

use tsrec_core::types::Participant;

/// Identifier the voice client tags decoded PCM with.
pub type ClientId = u32;

/// Pull-side view of the bot's voice channel.
pub trait ChannelSource: Send + Sync + 'static {
    /// Resolves a client to a stable uid and display name, when known.
    fn identity(&self, client: ClientId) -> Option<Participant>;

    /// Whether the client currently shares the bot's voice channel.
    fn in_bot_channel(&self, client: ClientId) -> bool;

    /// Every other client in the bot's channel; the bot itself is excluded.
    fn channel_clients(&self) -> Vec<Participant>;
}

/// Push-side events delivered by the voice client.
pub trait ChannelEvents: Send + Sync {
    /// One chunk of decoded PCM (interleaved 16-bit LE) from `client`.
    fn pcm(&self, client: ClientId, pcm: &[u8]);

    fn connected(&self);
    fn disconnected(&self);

    /// Channel membership changed (join, leave, move).
    fn participants_changed(&self);
}

type SubscriberList = Mutex<Vec<(u64, Weak<dyn ChannelEvents>)>>;

/// Fan-out point the voice client drives.
///
/// Handlers register through [`subscribe`](Self::subscribe) and are dropped
/// either by releasing the [`Subscription`] or by the subscriber itself going
/// away (registrations are weak).
#[derive(Default)]
pub struct ChannelEventBus {
    subscribers: Arc<SubscriberList>,
    next_id: Mutex<u64>,
}

impl ChannelEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler and returns the handle that removes it again.
    pub fn subscribe(&self, handler: Weak<dyn ChannelEvents>) -> Subscription {
        let id = {
            #[allow(clippy::unwrap_used)] // Mutex poisoning is a fatal error
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            *next
        };
        self.lock().push((id, handler));

        let subscribers = Arc::downgrade(&self.subscribers);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(list) = subscribers.upgrade() {
                    #[allow(clippy::unwrap_used)]
                    list.lock().unwrap().retain(|(sub_id, _)| *sub_id != id);
                }
            })),
        }
    }

    pub fn emit_pcm(&self, client: ClientId, pcm: &[u8]) {
        self.for_each(|h| h.pcm(client, pcm));
    }

    pub fn emit_connected(&self) {
        self.for_each(|h| h.connected());
    }

    pub fn emit_disconnected(&self) {
        self.for_each(|h| h.disconnected());
    }

    pub fn emit_participants_changed(&self) {
        self.for_each(|h| h.participants_changed());
    }

    fn for_each(&self, f: impl Fn(&dyn ChannelEvents)) {
        let handlers: Vec<Arc<dyn ChannelEvents>> = {
            let mut list = self.lock();
            list.retain(|(_, weak)| weak.strong_count() > 0);
            list.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        for handler in handlers {
            f(handler.as_ref());
        }
    }

    #[allow(clippy::unwrap_used)] // Mutex poisoning is a fatal error
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Weak<dyn ChannelEvents>)>> {
        self.subscribers.lock().unwrap()
    }
}

/// Removes its registration when released (or dropped).
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        pcm_calls: AtomicUsize,
    }

    impl ChannelEvents for Counter {
        fn pcm(&self, _client: ClientId, _pcm: &[u8]) {
            self.pcm_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn connected(&self) {}
        fn disconnected(&self) {}
        fn participants_changed(&self) {}
    }

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let bus = ChannelEventBus::new();
        let counter = Arc::new(Counter { pcm_calls: AtomicUsize::new(0) });
        let weak: Weak<dyn ChannelEvents> = {
            let arc: Arc<dyn ChannelEvents> = counter.clone();
            Arc::downgrade(&arc)
        };
        let sub = bus.subscribe(weak);

        bus.emit_pcm(1, &[0, 0]);
        assert_eq!(counter.pcm_calls.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        bus.emit_pcm(1, &[0, 0]);
        assert_eq!(counter.pcm_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dead_subscribers_are_pruned() {
        let bus = ChannelEventBus::new();
        let counter = Arc::new(Counter { pcm_calls: AtomicUsize::new(0) });
        let arc: Arc<dyn ChannelEvents> = counter.clone();
        let _sub = bus.subscribe(Arc::downgrade(&arc));
        drop(arc);
        drop(counter);
        bus.emit_pcm(1, &[]);
    }
}
