use parking_lot::Mutex;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// An insertion-ordered set of observers.
///
/// Components hand out a [`Subscription`] per observer; events are
/// delivered in subscription order and an observer may drop its
/// subscription from inside a delivery without upsetting the iteration
/// (delivery walks a snapshot of the list).
pub struct Subscriptions<T: ?Sized> {
    list: Arc<Mutex<Vec<(u64, Arc<T>)>>>,
    next: AtomicU64,
}

impl<T: ?Sized> Default for Subscriptions<T> {
    fn default() -> Self {
        Self {
            list: Arc::new(Mutex::new(Vec::new())),
            next: AtomicU64::new(1),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Subscriptions<T> {
    pub fn subscribe(&self, observer: Arc<T>) -> Subscription {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.list.lock().push((id, observer));

        let list = self.list.clone();
        Subscription {
            cancel: Some(Box::new(move || {
                list.lock().retain(|(i, _)| *i != id);
            })),
        }
    }

    /// deliver to every current observer, in subscription order.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<T>)) {
        let snapshot: Vec<_> = self.list.lock().clone();
        for (_, observer) in snapshot.iter() {
            f(observer);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    pub fn clear(&self) {
        self.list.lock().clear();
    }
}

/// Cancel-handle for one observer registration.
///
/// Cancelling twice is harmless; dropping the handle cancels too.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_in_subscription_order() {
        let subs: Subscriptions<Mutex<Vec<u32>>> = Subscriptions::default();
        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));

        let _sa = subs.subscribe(a.clone());
        let _sb = subs.subscribe(b.clone());

        let mut order = Vec::new();
        subs.for_each(|sink| {
            let tag = if Arc::ptr_eq(sink, &a) { 0 } else { 1 };
            order.push(tag);
            sink.lock().push(tag);
        });

        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let subs: Subscriptions<Mutex<Vec<u32>>> = Subscriptions::default();
        let sink = Arc::new(Mutex::new(Vec::new()));

        let mut sub = subs.subscribe(sink);
        sub.cancel();
        sub.cancel();
        assert!(subs.is_empty());
    }
}
