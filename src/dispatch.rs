// Per-stream handler registry and lock-free dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use ahash::AHashMap;
use tracing::warn;

/// Callback for frames of one specific stream: `(nonce, card_index, payload)`.
pub type PacketCallback = Box<dyn Fn(u64, usize, &[u8]) + Send + Sync>;

/// Callback raised when a new session is detected.
pub type SessionCallback = Box<dyn Fn() + Send + Sync>;

/// Callback for every validated frame regardless of stream:
/// `(nonce, card_index, radio_port_byte, payload)`.
pub type AnyPacketCallback = Box<dyn Fn(u64, usize, u8, &[u8]) + Send + Sync>;

/// Receiver registration for one multiplexed stream.
pub struct StreamRxHandler {
    pub stream_index: u8,
    pub on_packet: PacketCallback,
    pub on_new_session: SessionCallback,
}

impl StreamRxHandler {
    pub fn new<P, S>(stream_index: u8, on_packet: P, on_new_session: S) -> Self
    where
        P: Fn(u64, usize, &[u8]) + Send + Sync + 'static,
        S: Fn() + Send + Sync + 'static,
    {
        Self {
            stream_index,
            on_packet: Box::new(on_packet),
            on_new_session: Box::new(on_new_session),
        }
    }
}

#[derive(Default)]
struct Registry {
    by_stream: AHashMap<u8, Arc<StreamRxHandler>>,
    any: Option<Arc<AnyPacketCallback>>,
}

/// Handler registry with copy-on-write snapshots.
///
/// Registration replaces the registry `Arc` under a short lock; dispatch
/// clones the current `Arc` and runs every callback without holding it, so
/// producers registering handlers never wait on user callbacks.
pub struct Dispatcher {
    registry: Mutex<Arc<Registry>>,
    callback_panics: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Arc::new(Registry::default())),
            callback_panics: AtomicU64::new(0),
        }
    }

    /// Registers a stream handler, replacing any handler already bound to
    /// the same stream index.
    pub fn register_stream_handler(&self, handler: StreamRxHandler) {
        self.mutate(|registry| {
            registry
                .by_stream
                .insert(handler.stream_index, Arc::new(handler));
        });
    }

    /// Removes the handler for a stream index, if any.
    pub fn unregister_stream_handler(&self, stream_index: u8) {
        self.mutate(|registry| {
            registry.by_stream.remove(&stream_index);
        });
    }

    /// Registers the generic callback invoked for every validated frame.
    pub fn register_any_callback<F>(&self, callback: F)
    where
        F: Fn(u64, usize, u8, &[u8]) + Send + Sync + 'static,
    {
        let callback: AnyPacketCallback = Box::new(callback);
        self.mutate(|registry| {
            registry.any = Some(Arc::new(callback));
        });
    }

    fn mutate(&self, apply: impl FnOnce(&mut Registry)) {
        let mut guard = self.registry.lock().expect("dispatcher registry poisoned");
        let mut next = Registry {
            by_stream: guard.by_stream.clone(),
            any: guard.any.clone(),
        };
        apply(&mut next);
        *guard = Arc::new(next);
    }

    fn snapshot(&self) -> Arc<Registry> {
        Arc::clone(&self.registry.lock().expect("dispatcher registry poisoned"))
    }

    /// Delivers one validated frame: stream-specific handler first, then the
    /// generic callback.
    pub fn dispatch_packet(
        &self,
        nonce: u64,
        card_index: usize,
        radio_port: u8,
        stream_index: u8,
        payload: &[u8],
    ) {
        let registry = self.snapshot();
        if let Some(handler) = registry.by_stream.get(&stream_index) {
            self.isolated(stream_index, || {
                (handler.on_packet)(nonce, card_index, payload)
            });
        }
        if let Some(any) = &registry.any {
            self.isolated(stream_index, || {
                (any.as_ref())(nonce, card_index, radio_port, payload)
            });
        }
    }

    /// Notifies every registered handler of a new session.
    pub fn dispatch_new_session(&self) {
        let registry = self.snapshot();
        for handler in registry.by_stream.values() {
            self.isolated(handler.stream_index, || (handler.on_new_session)());
        }
    }

    /// Total callback panics swallowed at the dispatch boundary.
    pub fn callback_panics(&self) -> u64 {
        self.callback_panics.load(Ordering::Relaxed)
    }

    // User callbacks must not unwind into the receive loop.
    fn isolated(&self, stream_index: u8, call: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(call)).is_err() {
            self.callback_panics.fetch_add(1, Ordering::Relaxed);
            warn!(stream_index, "rx callback panicked; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn specific_handler_then_generic_callback() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&order);
        dispatcher.register_stream_handler(StreamRxHandler::new(
            7,
            move |nonce, card, payload| {
                seen.lock()
                    .unwrap()
                    .push(format!("stream:{nonce}:{card}:{:?}", payload));
            },
            || {},
        ));
        let seen = Arc::clone(&order);
        dispatcher.register_any_callback(move |nonce, _card, port, _payload| {
            seen.lock().unwrap().push(format!("any:{nonce}:{port}"));
        });

        dispatcher.dispatch_packet(3, 1, 0x07, 7, b"xy");
        let order = order.lock().unwrap();
        assert_eq!(order.len(), 2);
        assert!(order[0].starts_with("stream:3:1"));
        assert!(order[1].starts_with("any:3:7"));
    }

    #[test]
    fn registering_same_stream_replaces() {
        let dispatcher = Dispatcher::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        dispatcher.register_stream_handler(StreamRxHandler::new(
            1,
            move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        ));
        let counter = Arc::clone(&second);
        dispatcher.register_stream_handler(StreamRxHandler::new(
            1,
            move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        ));

        dispatcher.dispatch_packet(0, 0, 0x01, 1, b"a");
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_stream_is_silent() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.register_stream_handler(StreamRxHandler::new(
            2,
            move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        ));
        dispatcher.unregister_stream_handler(2);
        dispatcher.dispatch_packet(0, 0, 0x02, 2, b"a");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn new_session_reaches_every_handler() {
        let dispatcher = Dispatcher::new();
        let sessions = Arc::new(AtomicUsize::new(0));
        for stream in [1u8, 2, 3] {
            let counter = Arc::clone(&sessions);
            dispatcher.register_stream_handler(StreamRxHandler::new(
                stream,
                |_, _, _| {},
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }
        dispatcher.dispatch_new_session();
        assert_eq!(sessions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_stream_handler(StreamRxHandler::new(
            9,
            |_, _, _| panic!("user bug"),
            || {},
        ));
        dispatcher.dispatch_packet(0, 0, 0x09, 9, b"a");
        assert_eq!(dispatcher.callback_panics(), 1);
    }
}
