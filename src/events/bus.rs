//! Publish-subscribe message bus.
//!
//! Publishing is thread-safe; dispatch happens on a single thread via
//! [`MessageBus::process_messages`], called once per frame. Locks are
//! never held across user callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::message::{EventCategory, EventMessage, MessageType};
use super::queue::PreAllocatedQueue;

/// Handler callback. Returns true if the message was handled; dispatch
/// continues to later subscribers either way, the flag feeds statistics.
pub type MessageHandler = Box<dyn Fn(&EventMessage) -> bool + Send + Sync>;

/// Monotonically issued subscription identifier.
pub type SubscriptionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterMode {
    All,
    Type(MessageType),
    Category(EventCategory),
}

struct Subscription {
    id: SubscriptionId,
    filter: FilterMode,
    handler: MessageHandler,
}

/// Bus statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub total_published: u64,
    pub total_processed: u64,
    pub current_queue_len: usize,
    pub published_by_type: HashMap<MessageType, u64>,
    pub type_filter_hits: u64,
    pub category_filter_hits: u64,
    pub max_queue_len_reached: usize,
    pub capacity_warning_count: u32,
}

struct BusState {
    queue: PreAllocatedQueue<EventMessage>,
    expected_capacity: usize,
    warning_threshold: usize,
    warning_logged: bool,
}

/// Single-threaded-dispatch, multi-threaded-publish message bus.
pub struct MessageBus {
    state: Mutex<BusState>,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    stats: Mutex<BusStats>,
    next_subscription_id: Mutex<SubscriptionId>,
    logging_enabled: std::sync::atomic::AtomicBool,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

const DEFAULT_EXPECTED_CAPACITY: usize = 1024;

impl MessageBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                queue: PreAllocatedQueue::new(),
                expected_capacity: DEFAULT_EXPECTED_CAPACITY,
                warning_threshold: DEFAULT_EXPECTED_CAPACITY * 8 / 10,
                warning_logged: false,
            }),
            subscriptions: Mutex::new(Vec::new()),
            stats: Mutex::new(BusStats::default()),
            next_subscription_id: Mutex::new(1),
            logging_enabled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Subscription management
    // ------------------------------------------------------------------

    fn subscribe_with(&self, filter: FilterMode, handler: MessageHandler) -> SubscriptionId {
        let mut next = self.next_subscription_id.lock();
        let id = *next;
        *next += 1;
        drop(next);

        self.subscriptions.lock().push(Arc::new(Subscription {
            id,
            filter,
            handler,
        }));
        id
    }

    /// Subscribe to a specific message type.
    pub fn subscribe(
        &self,
        type_id: MessageType,
        handler: impl Fn(&EventMessage) -> bool + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe_with(FilterMode::Type(type_id), Box::new(handler))
    }

    /// Subscribe to all message types.
    pub fn subscribe_all(
        &self,
        handler: impl Fn(&EventMessage) -> bool + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe_with(FilterMode::All, Box::new(handler))
    }

    /// Subscribe to messages matching any of the given category flags.
    pub fn subscribe_categories(
        &self,
        categories: EventCategory,
        handler: impl Fn(&EventMessage) -> bool + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe_with(FilterMode::Category(categories), Box::new(handler))
    }

    /// Subscribe to a single category flag.
    pub fn subscribe_category(
        &self,
        category: EventCategory,
        handler: impl Fn(&EventMessage) -> bool + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe_categories(category, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().retain(|s| s.id != id);
    }

    pub fn unsubscribe_all(&self) {
        self.subscriptions.lock().clear();
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Publish a message for dispatch during the next
    /// [`process_messages`](Self::process_messages). Thread-safe.
    pub fn publish(&self, message: EventMessage) {
        if self.logging_enabled.load(std::sync::atomic::Ordering::Relaxed) {
            log::trace!("bus publish: type={} {:?}", message.type_id, message.payload);
        }
        let type_id = message.type_id;

        let queue_len = {
            let mut state = self.state.lock();
            state.queue.push(message);
            let len = state.queue.len();
            if len > state.warning_threshold && !state.warning_logged {
                state.warning_logged = true;
                self.stats.lock().capacity_warning_count += 1;
                log::warn!(
                    "message queue at {} of {} expected capacity",
                    len,
                    state.expected_capacity
                );
            }
            len
        };

        let mut stats = self.stats.lock();
        stats.total_published += 1;
        *stats.published_by_type.entry(type_id).or_insert(0) += 1;
        stats.current_queue_len = queue_len;
        stats.max_queue_len_reached = stats.max_queue_len_reached.max(queue_len);
    }

    /// Dispatch synchronously, bypassing the queue. Use sparingly.
    pub fn publish_immediate(&self, message: &EventMessage) {
        self.dispatch(message);
        let mut stats = self.stats.lock();
        stats.total_published += 1;
        stats.total_processed += 1;
        *stats.published_by_type.entry(message.type_id).or_insert(0) += 1;
    }

    // ------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------

    /// Dispatch all queued messages in FIFO order. Call once per frame
    /// on the dispatch thread.
    pub fn process_messages(&self) {
        // Swap the live queue out so publishers are never blocked by
        // subscriber callbacks.
        let mut local = PreAllocatedQueue::new();
        {
            let mut state = self.state.lock();
            state.queue.swap(&mut local);
        }

        let mut processed = 0u64;
        while let Some(message) = local.pop() {
            self.dispatch(&message);
            processed += 1;
        }

        // Hand the (now drained, still allocated) storage back if the
        // live queue picked up nothing meanwhile.
        {
            let mut state = self.state.lock();
            if state.queue.capacity() < local.capacity() && state.queue.is_empty() {
                local.clear();
                state.queue.swap(&mut local);
            }
            let len = state.queue.len();
            let mut stats = self.stats.lock();
            stats.total_processed += processed;
            stats.current_queue_len = len;
        }
    }

    fn dispatch(&self, message: &EventMessage) {
        // Snapshot the subscription list under the lock, then call the
        // handlers outside of it. Locks are never held across user
        // callbacks.
        let subscriptions: Vec<Arc<Subscription>> = self.subscriptions.lock().clone();

        let mut type_hits = 0u64;
        let mut category_hits = 0u64;
        for subscription in subscriptions.iter() {
            let matches = match subscription.filter {
                FilterMode::All => true,
                FilterMode::Type(type_id) => {
                    let hit = type_id == message.type_id;
                    if hit {
                        type_hits += 1;
                    }
                    hit
                }
                FilterMode::Category(categories) => {
                    let hit = categories.intersects(message.categories);
                    if hit {
                        category_hits += 1;
                    }
                    hit
                }
            };
            if matches {
                (subscription.handler)(message);
            }
        }

        if type_hits > 0 || category_hits > 0 {
            let mut stats = self.stats.lock();
            stats.type_filter_hits += type_hits;
            stats.category_filter_hits += category_hits;
        }
    }

    /// Drop all queued messages without dispatching.
    pub fn clear_queue(&self) {
        self.state.lock().queue.clear();
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    // ------------------------------------------------------------------
    // Capacity and statistics
    // ------------------------------------------------------------------

    /// Pre-allocate queue storage. A good heuristic is three events per
    /// node per frame.
    pub fn reserve(&self, capacity: usize) {
        self.state.lock().queue.reserve(capacity);
    }

    pub fn queue_capacity(&self) -> usize {
        self.state.lock().queue.capacity()
    }

    /// Times the queue grew at runtime. Non-zero means `reserve` was
    /// called with too small a capacity.
    pub fn queue_growth_count(&self) -> usize {
        self.state.lock().queue.growth_count()
    }

    /// Set the capacity above whose 80% a one-shot warning is logged.
    pub fn set_expected_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.expected_capacity = capacity;
        state.warning_threshold = capacity * 8 / 10;
        state.warning_logged = false;
    }

    pub fn expected_capacity(&self) -> usize {
        self.state.lock().expected_capacity
    }

    pub fn stats(&self) -> BusStats {
        // Lock order: state before stats, matching the publish path.
        let queue_len = self.state.lock().queue.len();
        let mut stats = self.stats.lock().clone();
        stats.current_queue_len = queue_len;
        stats
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = BusStats::default();
        self.state.lock().queue.reset_stats();
    }

    pub fn set_logging_enabled(&self, enabled: bool) {
        self.logging_enabled
            .store(enabled, std::sync::atomic::Ordering::Relaxed);
    }
}

/// RAII subscription set: unsubscribes everything it tracks on drop.
#[derive(Default)]
pub struct ScopedSubscriptions {
    bus: Option<Weak<MessageBus>>,
    ids: Vec<SubscriptionId>,
}

impl ScopedSubscriptions {
    pub fn new(bus: &Arc<MessageBus>) -> Self {
        Self {
            bus: Some(Arc::downgrade(bus)),
            ids: Vec::new(),
        }
    }

    pub fn track(&mut self, id: SubscriptionId) {
        self.ids.push(id);
    }

    pub fn has_subscriptions(&self) -> bool {
        !self.ids.is_empty()
    }

    pub fn bus(&self) -> Option<Arc<MessageBus>> {
        self.bus.as_ref().and_then(Weak::upgrade)
    }

    pub fn unsubscribe_all(&mut self) {
        if let Some(bus) = self.bus() {
            for id in self.ids.drain(..) {
                bus.unsubscribe(id);
            }
        } else {
            self.ids.clear();
        }
    }
}

impl Drop for ScopedSubscriptions {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::message::message_type;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_type_filtered_subscription() {
        let bus = MessageBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        bus.subscribe(message_type::FRAME_START, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            true
        });

        bus.publish(EventMessage::frame_start(0));
        bus.publish(EventMessage::frame_end(0, 0.5, 0.5));
        bus.process_messages();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_category_mask_subscription() {
        let bus = MessageBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        bus.subscribe_categories(EventCategory::BUDGET, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            true
        });

        bus.publish(EventMessage::gpu_over_budget(0, 1.1));
        bus.publish(EventMessage::frame_start(0));
        bus.publish(EventMessage::cpu_over_budget(0, 1.3));
        bus.process_messages();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fifo_dispatch_order() {
        let bus = MessageBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();

        bus.subscribe_all(move |msg| {
            order_clone.lock().push(msg.type_id);
            true
        });

        for type_id in [5u32, 1, 9, 3] {
            bus.publish(EventMessage::new(type_id, EventCategory::DIAGNOSTIC, 0));
        }
        bus.process_messages();

        assert_eq!(*order.lock(), vec![5, 1, 9, 3]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = MessageBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        let id = bus.subscribe_all(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            true
        });
        bus.publish(EventMessage::frame_start(0));
        bus.process_messages();
        bus.unsubscribe(id);
        bus.publish(EventMessage::frame_start(1));
        bus.process_messages();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_publish_immediate_bypasses_queue() {
        let bus = MessageBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        bus.subscribe_all(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            true
        });

        bus.publish_immediate(&EventMessage::frame_start(0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.queued_count(), 0);
    }

    #[test]
    fn test_stats_track_published_and_processed() {
        let bus = MessageBus::new();
        bus.publish(EventMessage::frame_start(0));
        bus.publish(EventMessage::frame_start(1));
        bus.process_messages();

        let stats = bus.stats();
        assert_eq!(stats.total_published, 2);
        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.published_by_type[&message_type::FRAME_START], 2);
    }

    #[test]
    fn test_scoped_subscriptions_unsubscribe_on_drop() {
        let bus = Arc::new(MessageBus::new());
        {
            let mut scoped = ScopedSubscriptions::new(&bus);
            scoped.track(bus.subscribe_all(|_| true));
            assert_eq!(bus.subscription_count(), 1);
        }
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_threaded_publish() {
        let bus = Arc::new(MessageBus::new());
        bus.reserve(256);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let bus = bus.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..32 {
                    bus.publish(EventMessage::new(100 + i, EventCategory::DIAGNOSTIC, 1));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(bus.queued_count(), 128);
        bus.process_messages();
        assert_eq!(bus.queued_count(), 0);
    }
}
