//! Multi-device timeline capacity tracking and adaptive scheduling.
//!
//! Bridges budget planning (estimates) with runtime execution
//! (measurements): one [`DeviceTimeline`] per GPU queue and per CPU
//! thread, a bounded frame history, prediction-error learning and a
//! damped-hysteresis task-count scale.
//!
//! GPU timestamp queries have inherent latency; measurements recorded
//! here must come from queries the caller has already synchronized on
//! (fence wait). Utilization may therefore reflect N-frame-delayed
//! readings, which is acceptable for trend-based adaptation.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::prediction::{
    GlobalPredictionStats, PredictionErrorTracker, PredictionTrackerConfig, TaskPredictionStats,
};
use crate::events::{message_type, EventMessage, MessageBus, ScopedSubscriptions};

/// Per-device timeline: budget, measurement and utilization for one GPU
/// queue or CPU thread.
#[derive(Debug, Clone, Default)]
pub struct DeviceTimeline {
    pub budget_ns: u64,
    pub measured_ns: u64,
    pub remaining_ns: u64,
    pub utilization: f32,
    pub exceeded_budget: bool,
    pub frame_number: u32,
    pub task_count: u32,
}

impl DeviceTimeline {
    fn with_budget(budget_ns: u64) -> Self {
        Self {
            budget_ns,
            remaining_ns: budget_ns,
            ..Default::default()
        }
    }

    /// Reset measurements for a new frame, preserving the budget.
    pub fn reset(&mut self) {
        self.measured_ns = 0;
        self.remaining_ns = self.budget_ns;
        self.utilization = 0.0;
        self.exceeded_budget = false;
        self.task_count = 0;
    }

    /// Recompute utilization after measurements.
    pub fn compute_utilization(&mut self) {
        if self.budget_ns > 0 {
            self.utilization = self.measured_ns as f32 / self.budget_ns as f32;
            self.exceeded_budget = self.utilization > 1.0;
            self.remaining_ns = self.budget_ns.saturating_sub(self.measured_ns);
        } else {
            self.utilization = 0.0;
            self.exceeded_budget = false;
            self.remaining_ns = 0;
        }
    }
}

/// Which device class is the frame's primary bottleneck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bottleneck {
    None,
    Gpu,
    Cpu,
    Unknown,
}

const BOTTLENECK_THRESHOLD: f32 = 0.90;

/// System-wide timeline snapshot: all GPU queues and CPU threads.
#[derive(Debug, Clone, Default)]
pub struct SystemTimeline {
    pub gpu_queues: Vec<DeviceTimeline>,
    pub cpu_threads: Vec<DeviceTimeline>,
    pub frame_number: u32,
}

impl SystemTimeline {
    /// Device class with the highest utilization above the 90%
    /// threshold; `Unknown` when nothing is tracked.
    pub fn bottleneck(&self) -> Bottleneck {
        if self.gpu_queues.is_empty() && self.cpu_threads.is_empty() {
            return Bottleneck::Unknown;
        }

        let mut max_util = 0.0f32;
        let mut result = Bottleneck::None;
        for gpu in &self.gpu_queues {
            if gpu.utilization > BOTTLENECK_THRESHOLD && gpu.utilization > max_util {
                max_util = gpu.utilization;
                result = Bottleneck::Gpu;
            }
        }
        for cpu in &self.cpu_threads {
            if cpu.utilization > BOTTLENECK_THRESHOLD && cpu.utilization > max_util {
                max_util = cpu.utilization;
                result = Bottleneck::Cpu;
            }
        }
        result
    }

    pub fn max_gpu_utilization(&self) -> f32 {
        self.gpu_queues
            .iter()
            .map(|t| t.utilization)
            .fold(0.0, f32::max)
    }

    pub fn max_cpu_utilization(&self) -> f32 {
        self.cpu_threads
            .iter()
            .map(|t| t.utilization)
            .fold(0.0, f32::max)
    }

    pub fn total_gpu_time(&self) -> u64 {
        self.gpu_queues.iter().map(|t| t.measured_ns).sum()
    }

    pub fn total_cpu_time(&self) -> u64 {
        self.cpu_threads.iter().map(|t| t.measured_ns).sum()
    }

    pub fn reset(&mut self) {
        for gpu in &mut self.gpu_queues {
            gpu.reset();
        }
        for cpu in &mut self.cpu_threads {
            cpu.reset();
        }
    }

    pub fn compute_utilizations(&mut self) {
        for gpu in &mut self.gpu_queues {
            gpu.compute_utilization();
        }
        for cpu in &mut self.cpu_threads {
            cpu.compute_utilization();
        }
    }
}

/// Configuration for capacity tracking.
#[derive(Debug, Clone)]
pub struct CapacityTrackerConfig {
    pub num_gpu_queues: u32,
    pub num_cpu_threads: u32,

    /// Per-queue GPU frame budget.
    pub gpu_time_budget_ns: u64,
    /// Per-thread CPU frame budget.
    pub cpu_time_budget_ns: u64,

    pub history_depth: u32,
    pub max_history_depth: u32,

    /// Add work only while max utilization is below this.
    pub adaptive_threshold: f32,
    pub enable_adaptive_scheduling: bool,

    /// Max scale change per frame.
    pub hysteresis_damping: f32,
    /// No change within this band around full utilization.
    pub hysteresis_deadband: f32,
}

impl Default for CapacityTrackerConfig {
    fn default() -> Self {
        Self {
            num_gpu_queues: 1,
            num_cpu_threads: 1,
            gpu_time_budget_ns: 16_666_666,
            cpu_time_budget_ns: 8_000_000,
            history_depth: 60,
            max_history_depth: 300,
            adaptive_threshold: 0.90,
            enable_adaptive_scheduling: true,
            hysteresis_damping: 0.10,
            hysteresis_deadband: 0.05,
        }
    }
}

/// Runtime capacity tracker with adaptive scheduling.
pub struct TimelineCapacityTracker {
    config: CapacityTrackerConfig,
    current_frame: SystemTimeline,
    history: VecDeque<SystemTimeline>,
    frame_counter: u32,
    prediction_tracker: PredictionErrorTracker,
    bus: Option<Weak<MessageBus>>,
}

impl TimelineCapacityTracker {
    pub fn new(config: CapacityTrackerConfig) -> Self {
        let current_frame = SystemTimeline {
            gpu_queues: (0..config.num_gpu_queues)
                .map(|_| DeviceTimeline::with_budget(config.gpu_time_budget_ns))
                .collect(),
            cpu_threads: (0..config.num_cpu_threads)
                .map(|_| DeviceTimeline::with_budget(config.cpu_time_budget_ns))
                .collect(),
            frame_number: 0,
        };
        Self {
            config,
            current_frame,
            history: VecDeque::new(),
            frame_counter: 0,
            prediction_tracker: PredictionErrorTracker::new(PredictionTrackerConfig::default()),
            bus: None,
        }
    }

    // ------------------------------------------------------------------
    // Frame lifecycle
    // ------------------------------------------------------------------

    /// Reset measurements for a new frame; budgets are preserved.
    pub fn begin_frame(&mut self) {
        self.current_frame.reset();
        self.current_frame.frame_number = self.frame_counter;
    }

    /// Compute utilization, snapshot into history, advance the frame
    /// counter and publish budget events.
    pub fn end_frame(&mut self) {
        self.current_frame.compute_utilizations();

        let depth = self
            .config
            .history_depth
            .min(self.config.max_history_depth) as usize;
        self.history.push_back(self.current_frame.clone());
        while self.history.len() > depth {
            self.history.pop_front();
        }

        self.publish_budget_events();
        self.frame_counter += 1;
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    // ------------------------------------------------------------------
    // Measurement recording
    // ------------------------------------------------------------------

    /// Accumulate measured GPU time for one queue.
    pub fn record_gpu_time(&mut self, queue_index: u32, nanoseconds: u64) {
        if let Some(queue) = self.current_frame.gpu_queues.get_mut(queue_index as usize) {
            queue.measured_ns = queue.measured_ns.saturating_add(nanoseconds);
            queue.task_count += 1;
            queue.compute_utilization();
        }
    }

    /// Accumulate measured CPU time for one thread.
    pub fn record_cpu_time(&mut self, thread_index: u32, nanoseconds: u64) {
        if let Some(thread) = self.current_frame.cpu_threads.get_mut(thread_index as usize) {
            thread.measured_ns = thread.measured_ns.saturating_add(nanoseconds);
            thread.task_count += 1;
            thread.compute_utilization();
        }
    }

    // ------------------------------------------------------------------
    // Capacity queries
    // ------------------------------------------------------------------

    pub fn current_timeline(&self) -> &SystemTimeline {
        &self.current_frame
    }

    /// Remaining budget for one queue; zero when over budget or the
    /// index is invalid.
    pub fn gpu_remaining_budget(&self, queue_index: u32) -> u64 {
        self.current_frame
            .gpu_queues
            .get(queue_index as usize)
            .map(|t| t.remaining_ns)
            .unwrap_or(0)
    }

    /// Smallest remaining GPU budget across queues.
    pub fn min_gpu_remaining_budget(&self) -> u64 {
        self.current_frame
            .gpu_queues
            .iter()
            .map(|t| t.remaining_ns)
            .min()
            .unwrap_or(0)
    }

    pub fn cpu_remaining_budget(&self, thread_index: u32) -> u64 {
        self.current_frame
            .cpu_threads
            .get(thread_index as usize)
            .map(|t| t.remaining_ns)
            .unwrap_or(0)
    }

    pub fn min_cpu_remaining_budget(&self) -> u64 {
        self.current_frame
            .cpu_threads
            .iter()
            .map(|t| t.remaining_ns)
            .min()
            .unwrap_or(0)
    }

    /// True while the most loaded GPU queue is below the adaptive
    /// threshold.
    pub fn can_schedule_more_work(&self) -> bool {
        self.current_frame.max_gpu_utilization() < self.config.adaptive_threshold
    }

    /// True if any queue or thread exceeded its budget.
    pub fn is_over_budget(&self) -> bool {
        self.current_frame
            .gpu_queues
            .iter()
            .chain(self.current_frame.cpu_threads.iter())
            .any(|t| t.exceeded_budget)
    }

    // ------------------------------------------------------------------
    // Adaptive scheduling
    // ------------------------------------------------------------------

    /// How many additional tasks of the given cost fit this frame.
    /// Zero once utilization crosses the adaptive threshold.
    pub fn suggest_additional_tasks(&self, estimated_cost_per_task_ns: u64) -> u32 {
        if estimated_cost_per_task_ns == 0 {
            return 0;
        }
        if self.current_frame.max_gpu_utilization() >= self.config.adaptive_threshold {
            return 0;
        }
        (self.min_gpu_remaining_budget() / estimated_cost_per_task_ns) as u32
    }

    /// Scale factor for next frame's task count, with damped
    /// hysteresis: inside the deadband around full utilization return
    /// 1.0, otherwise the proportional response clamped so the scale
    /// never moves by more than the damping per frame.
    pub fn compute_task_count_scale(&self) -> f32 {
        let utilization = self.current_frame.max_gpu_utilization();
        let deadband = self.config.hysteresis_deadband;
        let damping = self.config.hysteresis_damping;

        if (utilization - 1.0).abs() < deadband {
            return 1.0;
        }
        (1.0 + (1.0 - utilization)).clamp(1.0 - damping, 1.0 + damping)
    }

    // ------------------------------------------------------------------
    // Historical statistics
    // ------------------------------------------------------------------

    pub fn average_gpu_utilization(&self, frame_count: u32) -> f32 {
        self.average_utilization(frame_count, true)
    }

    pub fn average_cpu_utilization(&self, frame_count: u32) -> f32 {
        self.average_utilization(frame_count, false)
    }

    fn average_utilization(&self, frame_count: u32, use_gpu: bool) -> f32 {
        let count = (frame_count as usize).min(self.history.len());
        if count == 0 {
            return 0.0;
        }
        let sum: f32 = self
            .history
            .iter()
            .rev()
            .take(count)
            .map(|frame| {
                if use_gpu {
                    frame.max_gpu_utilization()
                } else {
                    frame.max_cpu_utilization()
                }
            })
            .sum();
        sum / count as f32
    }

    /// Most recent frame at the back.
    pub fn history(&self) -> &VecDeque<SystemTimeline> {
        &self.history
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Update the GPU budget for all queues.
    pub fn set_gpu_budget(&mut self, nanoseconds: u64) {
        self.config.gpu_time_budget_ns = nanoseconds;
        for queue in &mut self.current_frame.gpu_queues {
            queue.budget_ns = nanoseconds;
        }
    }

    /// Update the GPU budget for one queue.
    pub fn set_gpu_queue_budget(&mut self, queue_index: u32, nanoseconds: u64) {
        if let Some(queue) = self.current_frame.gpu_queues.get_mut(queue_index as usize) {
            queue.budget_ns = nanoseconds;
        }
    }

    /// Update the CPU budget for all threads.
    pub fn set_cpu_budget(&mut self, nanoseconds: u64) {
        self.config.cpu_time_budget_ns = nanoseconds;
        for thread in &mut self.current_frame.cpu_threads {
            thread.budget_ns = nanoseconds;
        }
    }

    /// Update the CPU budget for one thread.
    pub fn set_cpu_thread_budget(&mut self, thread_index: u32, nanoseconds: u64) {
        if let Some(thread) = self.current_frame.cpu_threads.get_mut(thread_index as usize) {
            thread.budget_ns = nanoseconds;
        }
    }

    pub fn set_adaptive_scheduling(&mut self, enabled: bool) {
        self.config.enable_adaptive_scheduling = enabled;
    }

    pub fn config(&self) -> &CapacityTrackerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Prediction error tracking
    // ------------------------------------------------------------------

    pub fn record_prediction(&mut self, task_id: &str, estimated_ns: u64, actual_ns: u64) {
        self.prediction_tracker
            .record_prediction(task_id, estimated_ns, actual_ns, self.frame_counter);
    }

    pub fn record_prediction_indexed(&mut self, task_index: u32, estimated_ns: u64, actual_ns: u64) {
        self.prediction_tracker.record_prediction_indexed(
            task_index,
            estimated_ns,
            actual_ns,
            self.frame_counter,
        );
    }

    pub fn correction_factor(&self, task_id: &str) -> f32 {
        self.prediction_tracker.correction_factor(task_id)
    }

    /// Apply the learned correction to an estimate.
    pub fn corrected_estimate(&self, task_id: &str, estimated_ns: u64) -> u64 {
        (estimated_ns as f32 * self.prediction_tracker.correction_factor(task_id)) as u64
    }

    pub fn prediction_stats(&self, task_id: &str) -> Option<&TaskPredictionStats> {
        self.prediction_tracker.task_stats(task_id)
    }

    pub fn global_prediction_stats(&self) -> GlobalPredictionStats {
        self.prediction_tracker.global_stats()
    }

    pub fn prediction_tracker(&self) -> &PredictionErrorTracker {
        &self.prediction_tracker
    }

    pub fn prediction_tracker_mut(&mut self) -> &mut PredictionErrorTracker {
        &mut self.prediction_tracker
    }

    // ------------------------------------------------------------------
    // Event-driven lifecycle
    // ------------------------------------------------------------------

    /// Attach a bus for budget-event publication at frame end.
    pub fn set_message_bus(&mut self, bus: &Arc<MessageBus>) {
        self.bus = Some(Arc::downgrade(bus));
    }

    /// Subscribe a shared tracker to frame events so its lifecycle is
    /// driven by the bus: frame-start runs `begin_frame`, frame-end
    /// runs `end_frame`. Dropping the returned set unsubscribes.
    pub fn subscribe_frame_events(
        shared: &Arc<Mutex<TimelineCapacityTracker>>,
        bus: &Arc<MessageBus>,
    ) -> ScopedSubscriptions {
        shared.lock().set_message_bus(bus);

        let mut subscriptions = ScopedSubscriptions::new(bus);

        let tracker = shared.clone();
        subscriptions.track(bus.subscribe(message_type::FRAME_START, move |_| {
            tracker.lock().begin_frame();
            true
        }));

        let tracker = shared.clone();
        subscriptions.track(bus.subscribe(message_type::FRAME_END, move |_| {
            tracker.lock().end_frame();
            true
        }));

        subscriptions
    }

    fn publish_budget_events(&self) {
        let Some(bus) = self.bus.as_ref().and_then(Weak::upgrade) else {
            return;
        };

        for (index, queue) in self.current_frame.gpu_queues.iter().enumerate() {
            if queue.exceeded_budget {
                bus.publish(EventMessage::gpu_over_budget(index as u32, queue.utilization));
            }
        }
        for (index, thread) in self.current_frame.cpu_threads.iter().enumerate() {
            if thread.exceeded_budget {
                bus.publish(EventMessage::cpu_over_budget(
                    index as u32,
                    thread.utilization,
                ));
            }
        }

        let max_util = self.current_frame.max_gpu_utilization();
        if self.config.enable_adaptive_scheduling && max_util < self.config.adaptive_threshold {
            bus.publish(EventMessage::utilization_below_adaptive(
                max_util,
                self.config.adaptive_threshold,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> TimelineCapacityTracker {
        TimelineCapacityTracker::new(CapacityTrackerConfig::default())
    }

    #[test]
    fn test_utilization_and_remaining() {
        let mut t = tracker();
        t.begin_frame();
        t.record_gpu_time(0, 8_333_333);
        let timeline = t.current_timeline();
        assert!((timeline.gpu_queues[0].utilization - 0.5).abs() < 0.01);
        assert_eq!(t.gpu_remaining_budget(0), 16_666_666 - 8_333_333);
    }

    #[test]
    fn test_over_budget_detection() {
        let mut t = tracker();
        t.begin_frame();
        t.record_gpu_time(0, 20_000_000);
        assert!(t.is_over_budget());
        assert_eq!(t.gpu_remaining_budget(0), 0);
    }

    #[test]
    fn test_bottleneck_classification() {
        let mut t = TimelineCapacityTracker::new(CapacityTrackerConfig {
            num_gpu_queues: 2,
            ..Default::default()
        });
        t.begin_frame();
        assert_eq!(t.current_timeline().bottleneck(), Bottleneck::None);

        t.record_gpu_time(1, 16_000_000);
        assert_eq!(t.current_timeline().bottleneck(), Bottleneck::Gpu);

        let mut cpu_bound = tracker();
        cpu_bound.begin_frame();
        cpu_bound.record_cpu_time(0, 7_900_000);
        assert_eq!(cpu_bound.current_timeline().bottleneck(), Bottleneck::Cpu);
    }

    #[test]
    fn test_bottleneck_unknown_without_devices() {
        let timeline = SystemTimeline::default();
        assert_eq!(timeline.bottleneck(), Bottleneck::Unknown);
    }

    #[test]
    fn test_scale_within_deadband() {
        let mut t = tracker();
        t.begin_frame();
        t.record_gpu_time(0, 16_000_000); // ~96% utilization
        assert_eq!(t.compute_task_count_scale(), 1.0);
    }

    #[test]
    fn test_scale_clamped_by_damping() {
        let mut t = tracker();
        t.begin_frame();
        t.record_gpu_time(0, 4_000_000); // ~24%: wants more work
        let scale = t.compute_task_count_scale();
        assert!((scale - 1.10).abs() < 1e-6);

        t.begin_frame();
        t.record_gpu_time(0, 33_000_000); // ~198%: wants less
        let scale = t.compute_task_count_scale();
        assert!((scale - 0.90).abs() < 1e-6);
    }

    #[test]
    fn test_scale_damping_bound_over_random_utilizations() {
        let mut t = tracker();
        let damping = t.config().hysteresis_damping;
        for measured in [0u64, 1_000_000, 9_000_000, 17_000_000, 60_000_000] {
            t.begin_frame();
            t.record_gpu_time(0, measured);
            let scale = t.compute_task_count_scale();
            assert!(
                (scale - 1.0).abs() <= damping + 1e-6,
                "scale {scale} violates damping bound"
            );
        }
    }

    #[test]
    fn test_suggest_additional_tasks() {
        let mut t = tracker();
        t.begin_frame();
        t.record_gpu_time(0, 6_666_666);
        // ~10ms remaining at 2ms per task.
        assert_eq!(t.suggest_additional_tasks(2_000_000), 5);

        t.record_gpu_time(0, 10_000_000); // now above the 90% threshold
        assert_eq!(t.suggest_additional_tasks(2_000_000), 0);
    }

    #[test]
    fn test_history_bounded() {
        let mut t = TimelineCapacityTracker::new(CapacityTrackerConfig {
            history_depth: 3,
            ..Default::default()
        });
        for _ in 0..10 {
            t.begin_frame();
            t.end_frame();
        }
        assert_eq!(t.history().len(), 3);
        assert_eq!(t.frame_counter(), 10);
    }

    #[test]
    fn test_rolling_average() {
        let mut t = tracker();
        for measured in [4_166_666u64, 8_333_333, 12_500_000] {
            t.begin_frame();
            t.record_gpu_time(0, measured);
            t.end_frame();
        }
        let avg = t.average_gpu_utilization(3);
        assert!((avg - 0.5).abs() < 0.01, "got {avg}");
    }

    #[test]
    fn test_budget_events_published_at_frame_end() {
        let bus = Arc::new(MessageBus::new());
        let shared = Arc::new(Mutex::new(tracker()));
        shared.lock().set_message_bus(&bus);

        let over_budget = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let over_clone = over_budget.clone();
        bus.subscribe(message_type::GPU_OVER_BUDGET, move |_| {
            over_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            true
        });

        {
            let mut t = shared.lock();
            t.begin_frame();
            t.record_gpu_time(0, 30_000_000);
            t.end_frame();
        }
        bus.process_messages();
        assert_eq!(over_budget.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_frame_event_subscription_drives_lifecycle() {
        let bus = Arc::new(MessageBus::new());
        let shared = Arc::new(Mutex::new(tracker()));
        let _subs = TimelineCapacityTracker::subscribe_frame_events(&shared, &bus);

        bus.publish(EventMessage::frame_start(0));
        bus.publish(EventMessage::frame_end(0, 0.0, 0.0));
        bus.process_messages();

        assert_eq!(shared.lock().frame_counter(), 1);
    }

    #[test]
    fn test_prediction_delegation() {
        let mut t = tracker();
        for _ in 0..15 {
            t.record_prediction("shadowMap", 2_000_000, 2_500_000);
        }
        let correction = t.correction_factor("shadowMap");
        assert!(correction > 1.24 && correction < 1.26);
        let corrected = t.corrected_estimate("shadowMap", 2_000_000);
        assert!((2_480_000..2_520_000).contains(&corrected));
    }
}
