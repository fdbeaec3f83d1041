//! Publish/subscribe channels with optional deferred delivery on the host thread.

use anyhow::Result;
use jsh_types::JshError;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::debug;

use crate::wake::WakePipe;

/// Opaque handle returned by [`EventChannel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionKey(u64);

type Callback<T> = dyn Fn(&T) + Send + Sync;

struct Subscriber<T> {
    key: SubscriptionKey,
    active: AtomicBool,
    callback: Box<Callback<T>>,
}

struct ChannelInner<T> {
    subscribers: Mutex<Vec<Arc<Subscriber<T>>>>,
    next_key: AtomicU64,
}

/// A thread-safe list of callbacks for one event type.
///
/// Publishing snapshots the subscriber list and releases the lock before any
/// callback runs, so callbacks may subscribe or unsubscribe freely.
pub struct EventChannel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        EventChannel {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for EventChannel<T> {
    fn default() -> Self {
        EventChannel {
            inner: Arc::new(ChannelInner {
                subscribers: Mutex::new(Vec::new()),
                next_key: AtomicU64::new(1),
            }),
        }
    }
}

impl<T> std::fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<T> EventChannel<T> {
    pub fn new() -> Self {
        EventChannel::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionKey
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let key = SubscriptionKey(self.inner.next_key.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.lock().push(Arc::new(Subscriber {
            key,
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        }));
        key
    }

    /// Returns false if `key` was not subscribed.
    pub fn unsubscribe(&self, key: SubscriptionKey) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        match subscribers.iter().position(|s| s.key == key) {
            Some(index) => {
                let removed = subscribers.remove(index);
                removed.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe_all(&self) {
        let mut subscribers = self.inner.subscribers.lock();
        for subscriber in subscribers.drain(..) {
            subscriber.active.store(false, Ordering::Release);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every subscriber on the calling thread, in registration order.
    pub fn publish(&self, event: &T) {
        let snapshot: Vec<Arc<Subscriber<T>>> = self.inner.subscribers.lock().clone();
        for subscriber in snapshot {
            // unsubscribed by an earlier callback of this same publish
            if subscriber.active.load(Ordering::Acquire) {
                (subscriber.callback)(event);
            }
        }
    }
}

impl<T: Send + 'static> EventChannel<T> {
    /// Queue delivery on `dispatcher`'s host thread.
    pub fn publish_deferred(&self, dispatcher: &Dispatcher, event: T) {
        let channel = self.clone();
        dispatcher.post(move || channel.publish(&event));
    }
}

type Delivery = Box<dyn FnOnce() + Send>;

struct DispatchInner {
    queue: Mutex<VecDeque<Delivery>>,
    wake: WakePipe,
    host: ThreadId,
}

/// Process-side delivery queue flushed on a single host thread.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatchInner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("host", &self.inner.host)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Dispatcher {
    /// The calling thread becomes the host thread.
    pub fn new() -> Result<Self> {
        Ok(Dispatcher {
            inner: Arc::new(DispatchInner {
                queue: Mutex::new(VecDeque::new()),
                wake: WakePipe::new()?,
                host: thread::current().id(),
            }),
        })
    }

    pub fn is_host_thread(&self) -> bool {
        thread::current().id() == self.inner.host
    }

    /// Readable whenever deliveries (or a SIGCHLD) are pending; suitable for an
    /// external event loop.
    pub fn wake_fd(&self) -> RawFd {
        self.inner.wake.read_fd()
    }

    pub(crate) fn wake_write_fd(&self) -> RawFd {
        self.inner.wake.write_fd()
    }

    pub(crate) fn wake(&self) {
        self.inner.wake.wake();
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn post<F>(&self, delivery: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.queue.lock().push_back(Box::new(delivery));
        self.inner.wake.wake();
    }

    /// Block until woken or `timeout` elapses (`None` waits forever). Returns
    /// true if a wakeup was consumed.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.pending() > 0 {
            self.inner.wake.drain();
            return Ok(true);
        }
        let timeout = timeout
            .map(|t| t.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);
        let mut fds = [PollFd::new(self.inner.wake.read_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => {
                self.inner.wake.drain();
                Ok(true)
            }
            Err(Errno::EINTR) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Run every queued delivery, including ones queued while flushing.
    pub fn flush(&self) -> Result<usize> {
        if !self.is_host_thread() {
            return Err(JshError::NotHostThread.into());
        }
        let mut delivered = 0;
        loop {
            let batch: VecDeque<Delivery> = std::mem::take(&mut *self.inner.queue.lock());
            if batch.is_empty() {
                break;
            }
            for delivery in batch {
                delivery();
                delivered += 1;
            }
        }
        if delivered > 0 {
            debug!("dispatcher flushed {} deliveries", delivered);
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn init() {
        let _ = tracing_subscriber::fmt::try_init();
    }

    #[test]
    fn direct_publish_in_registration_order() {
        init();
        let channel: EventChannel<u32> = EventChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            channel.subscribe(move |v: &u32| seen.lock().push(format!("{tag}{v}")));
        }
        channel.publish(&1);
        assert_eq!(*seen.lock(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn unsubscribe_from_inside_callback() {
        init();
        let channel: EventChannel<u32> = EventChannel::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = Arc::new(Mutex::new(None));

        let cb_channel = channel.clone();
        let cb_calls = Arc::clone(&calls);
        let cb_key = Arc::clone(&key);
        let k = channel.subscribe(move |_| {
            cb_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(k) = cb_key.lock().take() {
                assert!(cb_channel.unsubscribe(k));
            }
        });
        *key.lock() = Some(k);

        channel.publish(&1);
        channel.publish(&2);
        channel.publish(&3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(channel.is_empty());
        assert!(!channel.unsubscribe(k));
    }

    #[test]
    fn subscriber_removed_mid_publish_is_skipped() {
        init();
        let channel: EventChannel<()> = EventChannel::new();
        let later_calls = Arc::new(AtomicUsize::new(0));
        let later_key = Arc::new(Mutex::new(None));

        let first_channel = channel.clone();
        let first_key = Arc::clone(&later_key);
        channel.subscribe(move |_| {
            if let Some(k) = *first_key.lock() {
                first_channel.unsubscribe(k);
            }
        });
        let counter = Arc::clone(&later_calls);
        let k = channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        *later_key.lock() = Some(k);

        channel.publish(&());
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribe_from_inside_callback() {
        init();
        let channel: EventChannel<u8> = EventChannel::new();
        let inner = channel.clone();
        channel.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        channel.publish(&0);
        channel.publish(&0);
        assert_eq!(channel.len(), 3);
        channel.unsubscribe_all();
        assert!(channel.is_empty());
    }

    #[test]
    fn deferred_delivery_runs_on_host_thread() {
        init();
        let dispatcher = Dispatcher::new().unwrap();
        let channel: EventChannel<String> = EventChannel::new();
        let host = thread::current().id();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.subscribe(move |s: &String| {
            assert_eq!(thread::current().id(), host);
            sink.lock().push(s.clone());
        });

        let producer_channel = channel.clone();
        let producer_dispatcher = dispatcher.clone();
        thread::spawn(move || {
            for i in 0..5 {
                producer_channel.publish_deferred(&producer_dispatcher, format!("e{i}"));
            }
            assert!(producer_dispatcher.flush().is_err());
        })
        .join()
        .unwrap();

        assert!(seen.lock().is_empty());
        assert!(dispatcher.wait(Some(Duration::from_secs(1))).unwrap());
        assert_eq!(dispatcher.flush().unwrap(), 5);
        assert_eq!(*seen.lock(), vec!["e0", "e1", "e2", "e3", "e4"]);
    }

    #[test]
    fn flush_drains_deliveries_posted_while_flushing() {
        init();
        let dispatcher = Dispatcher::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let d = dispatcher.clone();
        let c = Arc::clone(&count);
        dispatcher.post(move || {
            c.fetch_add(1, Ordering::SeqCst);
            let c2 = Arc::clone(&c);
            d.post(move || {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });
        assert_eq!(dispatcher.flush().unwrap(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.pending(), 0);
    }
}
