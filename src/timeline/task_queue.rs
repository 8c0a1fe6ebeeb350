//! Budget-aware priority task queue.
//!
//! Single-threaded: lives inside the graph's execute loop, so no lock
//! is required. Tasks carry cost estimates; the queue enforces the
//! frame budget at enqueue time and executes in priority order with a
//! stable insertion-order tie-break.

use std::sync::Arc;

use parking_lot::Mutex;

use super::budget::TaskBudget;
use super::capacity::TimelineCapacityTracker;

/// One queued task with its scheduling metadata.
#[derive(Debug, Clone)]
pub struct TaskSlot<T> {
    pub data: T,
    /// Execution priority; 255 is highest.
    pub priority: u8,
    /// GPU time estimate in nanoseconds.
    pub estimated_cost_ns: u64,
    /// Memory estimate in bytes.
    pub estimated_memory_bytes: u64,
    pub(crate) insertion_order: u32,
}

impl<T> TaskSlot<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            priority: 0,
            estimated_cost_ns: 0,
            estimated_memory_bytes: 0,
            insertion_order: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cost(mut self, estimated_cost_ns: u64) -> Self {
        self.estimated_cost_ns = estimated_cost_ns;
        self
    }
}

/// Callback invoked in lenient mode when a task overflows the budget.
/// Arguments: (projected_total_ns, budget_ns, task_cost_ns).
pub type BudgetWarningCallback = Box<dyn FnMut(u64, u64, u64)>;

/// Budget-aware priority queue of tasks.
pub struct TaskQueue<T> {
    slots: Vec<TaskSlot<T>>,
    active_count: u32,
    total_estimated_cost_ns: u64,
    budget: TaskBudget,
    next_insertion_order: u32,
    needs_sort: bool,
    warning_callback: Option<BudgetWarningCallback>,
    capacity_tracker: Option<Arc<Mutex<TimelineCapacityTracker>>>,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            active_count: 0,
            total_estimated_cost_ns: 0,
            budget: TaskBudget::FPS60_STRICT,
            next_insertion_order: 0,
            needs_sort: false,
            warning_callback: None,
            capacity_tracker: None,
        }
    }

    pub fn set_budget(&mut self, budget: TaskBudget) {
        self.budget = budget;
    }

    /// Shortcut: set a strict frame budget.
    pub fn set_frame_budget(&mut self, budget_ns: u64) {
        self.budget =
            TaskBudget::new(budget_ns, super::budget::BudgetOverflowMode::Strict);
    }

    pub fn budget(&self) -> &TaskBudget {
        &self.budget
    }

    /// Set the warning callback for lenient-mode overflow.
    pub fn set_warning_callback(&mut self, callback: impl FnMut(u64, u64, u64) + 'static) {
        self.warning_callback = Some(Box::new(callback));
    }

    fn warn(&mut self, projected_total: u64, budget: u64, task_cost: u64) {
        log::warn!(
            "task budget overflow: projected {projected_total} ns exceeds {budget} ns \
             (task cost {task_cost} ns)"
        );
        if let Some(callback) = &mut self.warning_callback {
            callback(projected_total, budget, task_cost);
        }
    }

    /// Attempt to enqueue within budget constraints.
    ///
    /// Strict mode rejects tasks whose cost would push the running
    /// total past the budget; lenient mode always accepts and warns on
    /// overflow. Zero-cost tasks are always accepted. Addition is
    /// overflow-safe.
    pub fn try_enqueue(&mut self, slot: TaskSlot<T>) -> bool {
        let budget_ns = self.budget.gpu_time_budget_ns;
        let task_cost = slot.estimated_cost_ns;

        if budget_ns == 0 && task_cost > 0 {
            if self.budget.is_strict() {
                return false;
            }
            self.warn(task_cost, 0, task_cost);
            self.enqueue_unchecked(slot);
            return true;
        }

        let Some(new_total) = self.total_estimated_cost_ns.checked_add(task_cost) else {
            if self.budget.is_strict() {
                return false;
            }
            self.warn(u64::MAX, budget_ns, task_cost);
            self.enqueue_unchecked(slot);
            return true;
        };

        if new_total > budget_ns {
            if self.budget.is_strict() {
                return false;
            }
            self.warn(new_total, budget_ns, task_cost);
        }

        self.push(slot, new_total);
        true
    }

    /// Enqueue without budget checking, for mandatory tasks.
    pub fn enqueue_unchecked(&mut self, slot: TaskSlot<T>) {
        let new_total = self
            .total_estimated_cost_ns
            .saturating_add(slot.estimated_cost_ns);
        self.push(slot, new_total);
    }

    fn push(&mut self, mut slot: TaskSlot<T>, new_total: u64) {
        slot.insertion_order = self.next_insertion_order;
        self.next_insertion_order += 1;
        self.slots.push(slot);
        self.total_estimated_cost_ns = new_total;
        self.active_count += 1;
        self.needs_sort = true;
    }

    /// Execute all queued tasks from highest priority to lowest; equal
    /// priorities keep insertion order. No-op on an empty queue.
    pub fn execute(&mut self, mut executor: impl FnMut(&T)) {
        if self.slots.is_empty() {
            return;
        }
        self.sort_if_needed();
        for slot in &self.slots {
            executor(&slot.data);
        }
    }

    /// Execute and deliver the full slot, including priority and cost
    /// metadata.
    pub fn execute_with_metadata(&mut self, mut executor: impl FnMut(&TaskSlot<T>)) {
        if self.slots.is_empty() {
            return;
        }
        self.sort_if_needed();
        for slot in &self.slots {
            executor(slot);
        }
    }

    fn sort_if_needed(&mut self) {
        if !self.needs_sort {
            return;
        }
        self.slots.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.insertion_order.cmp(&b.insertion_order))
        });
        self.needs_sort = false;
    }

    /// Clear all queued tasks and reset state. Idempotent.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.active_count = 0;
        self.total_estimated_cost_ns = 0;
        self.next_insertion_order = 0;
        self.needs_sort = false;
    }

    pub fn queued_count(&self) -> u32 {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    /// O(1): cached, not computed.
    pub fn total_estimated_cost(&self) -> u64 {
        self.total_estimated_cost_ns
    }

    /// Nanoseconds remaining before the budget is exhausted; saturates
    /// at zero.
    pub fn remaining_budget(&self) -> u64 {
        self.budget
            .gpu_time_budget_ns
            .saturating_sub(self.total_estimated_cost_ns)
    }

    pub fn is_budget_exhausted(&self) -> bool {
        self.total_estimated_cost_ns >= self.budget.gpu_time_budget_ns
    }

    pub fn reserve(&mut self, capacity: usize) {
        self.slots.reserve(capacity);
    }

    // ------------------------------------------------------------------
    // Capacity tracker integration
    // ------------------------------------------------------------------

    /// Link a capacity tracker so actual costs feed adaptive scheduling.
    pub fn set_capacity_tracker(&mut self, tracker: Arc<Mutex<TimelineCapacityTracker>>) {
        self.capacity_tracker = Some(tracker);
    }

    pub fn capacity_tracker(&self) -> Option<&Arc<Mutex<TimelineCapacityTracker>>> {
        self.capacity_tracker.as_ref()
    }

    /// Record the measured cost of an executed slot, forwarding it to
    /// the linked tracker.
    pub fn record_actual_cost(&mut self, slot_index: u32, actual_ns: u64) {
        let Some(tracker) = &self.capacity_tracker else {
            return;
        };
        let mut tracker = tracker.lock();
        tracker.record_gpu_time(0, actual_ns);
        if let Some(slot) = self.slots.get(slot_index as usize) {
            tracker.record_prediction_indexed(slot_index, slot.estimated_cost_ns, actual_ns);
        }
    }

    /// Check against the tracker's measured remaining budget instead of
    /// the estimate-based one. Falls back to the estimate check when no
    /// tracker is linked.
    pub fn can_enqueue_with_measured_budget(&self, slot: &TaskSlot<T>) -> bool {
        match &self.capacity_tracker {
            Some(tracker) => tracker.lock().gpu_remaining_budget(0) >= slot.estimated_cost_ns,
            None => self.remaining_budget() >= slot.estimated_cost_ns,
        }
    }
}
