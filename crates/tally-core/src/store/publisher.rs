use crossbeam_channel::{Receiver, Sender, TryRecvError};

pub type SubscriptionId = u64;

type Filter<T> = Box<dyn Fn(&T) -> bool + Send>;

struct Subscriber<T> {
    id: SubscriptionId,
    tx: Sender<T>,
    filter: Option<Filter<T>>,
}

/// Fan-out subject. Every subscriber receives its own clone of each
/// published event over an unbounded channel, in publish order.
///
/// Subscribers whose `Subscription` has been dropped are pruned on the
/// next `publish`.
pub struct Publisher<T> {
    subscribers: Vec<Subscriber<T>>,
    next_id: SubscriptionId,
}

impl<T: Clone> Publisher<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 1,
        }
    }

    /// Receive every published event.
    pub fn subscribe(&mut self) -> Subscription<T> {
        self.add(None)
    }

    /// Receive only events for which `filter` returns true.
    pub fn subscribe_filtered<F>(&mut self, filter: F) -> Subscription<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        self.add(Some(Box::new(filter)))
    }

    fn add(&mut self, filter: Option<Filter<T>>) -> Subscription<T> {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(Subscriber { id, tx, filter });
        Subscription { id, rx }
    }

    /// Returns false if the id was unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Deliver `event` to every matching subscriber. Returns the number of
    /// subscribers that received it.
    pub fn publish(&mut self, event: &T) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|s| {
            if let Some(filter) = &s.filter {
                if !filter(event) {
                    return true;
                }
            }
            match s.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // Receiver dropped
                Err(_) => false,
            }
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl<T: Clone> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a `Publisher` subscription.
pub struct Subscription<T> {
    id: SubscriptionId,
    rx: Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next pending event, if any. Never blocks.
    pub fn try_recv(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// All pending events, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
