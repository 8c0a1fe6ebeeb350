//! Prediction-error learning for task cost estimates.
//!
//! Records estimate-vs-actual pairs per task identifier and derives a
//! smoothed correction factor for future estimates.

use std::collections::{HashMap, VecDeque};

/// One estimate-vs-actual measurement.
#[derive(Debug, Clone, Copy)]
pub struct PredictionError {
    pub estimated_ns: u64,
    pub actual_ns: u64,
    /// Signed error: actual - estimated. Positive means underestimate.
    pub error_ns: i64,
    /// actual / estimated; 1.0 is a perfect estimate.
    pub error_ratio: f32,
    pub frame_number: u32,
}

impl PredictionError {
    fn new(estimated_ns: u64, actual_ns: u64, frame_number: u32) -> Self {
        let error_ns = actual_ns as i64 - estimated_ns as i64;
        let error_ratio = if estimated_ns > 0 {
            actual_ns as f32 / estimated_ns as f32
        } else if actual_ns > 0 {
            10.0
        } else {
            1.0
        };
        Self {
            estimated_ns,
            actual_ns,
            error_ns,
            error_ratio,
            frame_number,
        }
    }
}

/// Rolling statistics for one task identifier's prediction accuracy.
#[derive(Debug, Clone)]
pub struct TaskPredictionStats {
    pub task_id: String,
    pub sample_count: u32,
    pub window_size: u32,

    pub mean_error_ratio: f32,
    pub variance_ratio: f32,
    pub stddev_ratio: f32,

    /// Positive means consistent underestimation.
    pub bias_direction: f32,
    /// 0..=1; higher means the bias is consistent.
    pub bias_confidence: f32,

    /// Smoothed multiplier for future estimates, clamped to [0.5, 2.0].
    pub correction_factor: f32,

    pub mean_error_ns: i64,
    pub mean_abs_error_ns: u64,

    history: VecDeque<PredictionError>,
}

impl TaskPredictionStats {
    fn new(task_id: String, window_size: u32) -> Self {
        Self {
            task_id,
            sample_count: 0,
            window_size,
            mean_error_ratio: 1.0,
            variance_ratio: 0.0,
            stddev_ratio: 0.0,
            bias_direction: 0.0,
            bias_confidence: 0.0,
            correction_factor: 1.0,
            mean_error_ns: 0,
            mean_abs_error_ns: 0,
            history: VecDeque::new(),
        }
    }

    fn add_sample(&mut self, error: PredictionError) {
        self.history.push_back(error);
        self.sample_count += 1;
        while self.history.len() > self.window_size as usize {
            self.history.pop_front();
        }
        self.recompute();
    }

    /// Recompute statistics over the window using Welford's online
    /// algorithm for numerically stable mean and variance.
    fn recompute(&mut self) {
        if self.history.is_empty() {
            return;
        }

        let mut mean = 0.0f64;
        let mut m2 = 0.0f64;
        let mut total_error: i64 = 0;
        let mut total_abs_error: u64 = 0;
        let mut n = 0usize;

        for error in &self.history {
            n += 1;
            let ratio = error.error_ratio as f64;
            let delta = ratio - mean;
            mean += delta / n as f64;
            m2 += delta * (ratio - mean);

            total_error += error.error_ns;
            total_abs_error += error.error_ns.unsigned_abs();
        }

        self.mean_error_ratio = mean as f32;
        self.variance_ratio = if n > 1 { (m2 / (n - 1) as f64) as f32 } else { 0.0 };
        self.stddev_ratio = self.variance_ratio.sqrt();
        self.mean_error_ns = total_error / n as i64;
        self.mean_abs_error_ns = total_abs_error / n as u64;

        self.bias_direction = self.mean_error_ratio - 1.0;
        self.bias_confidence = if self.bias_direction.abs() > 0.001 {
            if self.stddev_ratio < 1e-3 {
                1.0
            } else {
                (self.bias_direction.abs() / self.stddev_ratio / 3.0).clamp(0.0, 1.0)
            }
        } else {
            0.0
        };

        // Seed the correction from the first observation, then smooth
        // toward the rolling mean so a few outliers cannot swing it.
        let target = self.mean_error_ratio;
        self.correction_factor = if self.sample_count <= 1 {
            target.clamp(0.5, 2.0)
        } else {
            (self.correction_factor * 0.9 + target * 0.1).clamp(0.5, 2.0)
        };
    }

    /// Enough samples to trust the correction factor.
    pub fn has_reliable_stats(&self) -> bool {
        self.sample_count >= 10 && self.history.len() >= 10
    }

    pub fn last_error(&self) -> Option<&PredictionError> {
        self.history.back()
    }

    pub fn window_len(&self) -> usize {
        self.history.len()
    }
}

/// Aggregated statistics across all tracked task types.
#[derive(Debug, Clone, Default)]
pub struct GlobalPredictionStats {
    pub total_samples: u32,
    pub task_type_count: u32,
    pub global_mean_error_ratio: f32,
    pub overestimate_percent: f32,
    pub underestimate_percent: f32,
    pub accurate_percent: f32,
    pub total_bias_ns: i64,
}

/// Configuration for the tracker.
#[derive(Debug, Clone)]
pub struct PredictionTrackerConfig {
    /// Rolling window per task type.
    pub window_size: u32,
    /// Unique task types tracked before eviction.
    pub max_task_types: u32,
    /// Ratio band treated as "accurate".
    pub accuracy_threshold: f32,
}

impl Default for PredictionTrackerConfig {
    fn default() -> Self {
        Self {
            window_size: 60,
            max_task_types: 64,
            accuracy_threshold: 0.10,
        }
    }
}

/// Tracks prediction errors per task identifier.
#[derive(Debug, Default)]
pub struct PredictionErrorTracker {
    config: PredictionTrackerConfig,
    task_stats: HashMap<String, TaskPredictionStats>,

    total_samples: u32,
    total_bias_ns: i64,
    overestimate_count: u32,
    underestimate_count: u32,
    accurate_count: u32,
}

impl PredictionErrorTracker {
    pub fn new(config: PredictionTrackerConfig) -> Self {
        Self {
            config,
            task_stats: HashMap::new(),
            total_samples: 0,
            total_bias_ns: 0,
            overestimate_count: 0,
            underestimate_count: 0,
            accurate_count: 0,
        }
    }

    /// Record one estimate-vs-actual pair.
    pub fn record_prediction(
        &mut self,
        task_id: &str,
        estimated_ns: u64,
        actual_ns: u64,
        frame_number: u32,
    ) {
        let error = PredictionError::new(estimated_ns, actual_ns, frame_number);

        self.entry(task_id).add_sample(error);

        self.total_samples += 1;
        self.total_bias_ns += error.error_ns;

        let threshold = self.config.accuracy_threshold;
        if error.error_ratio > 1.0 + threshold {
            self.underestimate_count += 1;
        } else if error.error_ratio < 1.0 - threshold {
            self.overestimate_count += 1;
        } else {
            self.accurate_count += 1;
        }
    }

    /// Record with a numeric task index instead of a name.
    pub fn record_prediction_indexed(
        &mut self,
        task_index: u32,
        estimated_ns: u64,
        actual_ns: u64,
        frame_number: u32,
    ) {
        let task_id = format!("task_{task_index}");
        self.record_prediction(&task_id, estimated_ns, actual_ns, frame_number);
    }

    fn entry(&mut self, task_id: &str) -> &mut TaskPredictionStats {
        if !self.task_stats.contains_key(task_id) {
            // Evict the least-sampled entry once the type limit is hit.
            if self.task_stats.len() >= self.config.max_task_types as usize {
                if let Some(evict) = self
                    .task_stats
                    .iter()
                    .min_by_key(|(_, stats)| stats.sample_count)
                    .map(|(id, _)| id.clone())
                {
                    log::debug!("evicting prediction stats for '{evict}'");
                    self.task_stats.remove(&evict);
                }
            }
            self.task_stats.insert(
                task_id.to_string(),
                TaskPredictionStats::new(task_id.to_string(), self.config.window_size),
            );
        }
        self.task_stats.get_mut(task_id).unwrap()
    }

    pub fn task_stats(&self, task_id: &str) -> Option<&TaskPredictionStats> {
        self.task_stats.get(task_id)
    }

    /// Correction multiplier for a task type's estimates. Returns 1.0
    /// until the statistics are reliable.
    pub fn correction_factor(&self, task_id: &str) -> f32 {
        match self.task_stats.get(task_id) {
            Some(stats) if stats.has_reliable_stats() => stats.correction_factor,
            _ => 1.0,
        }
    }

    pub fn bias_direction(&self, task_id: &str) -> f32 {
        self.task_stats
            .get(task_id)
            .map(|s| s.bias_direction)
            .unwrap_or(0.0)
    }

    pub fn mean_absolute_error(&self, task_id: &str) -> u64 {
        self.task_stats
            .get(task_id)
            .map(|s| s.mean_abs_error_ns)
            .unwrap_or(0)
    }

    pub fn has_reliable_stats(&self, task_id: &str) -> bool {
        self.task_stats
            .get(task_id)
            .is_some_and(|s| s.has_reliable_stats())
    }

    pub fn global_stats(&self) -> GlobalPredictionStats {
        let mut global = GlobalPredictionStats {
            total_samples: self.total_samples,
            task_type_count: self.task_stats.len() as u32,
            total_bias_ns: self.total_bias_ns,
            ..Default::default()
        };

        if self.total_samples > 0 {
            let total = self.total_samples as f32;
            global.overestimate_percent = self.overestimate_count as f32 / total * 100.0;
            global.underestimate_percent = self.underestimate_count as f32 / total * 100.0;
            global.accurate_percent = self.accurate_count as f32 / total * 100.0;
        }

        if !self.task_stats.is_empty() {
            let sum: f32 = self.task_stats.values().map(|s| s.mean_error_ratio).sum();
            global.global_mean_error_ratio = sum / self.task_stats.len() as f32;
        } else {
            global.global_mean_error_ratio = 1.0;
        }

        global
    }

    pub fn task_type_count(&self) -> u32 {
        self.task_stats.len() as u32
    }

    pub fn total_samples(&self) -> u32 {
        self.total_samples
    }

    pub fn tracked_task_ids(&self) -> Vec<&str> {
        self.task_stats.keys().map(String::as_str).collect()
    }

    pub fn config(&self) -> &PredictionTrackerConfig {
        &self.config
    }

    pub fn set_window_size(&mut self, window_size: u32) {
        self.config.window_size = window_size;
        for stats in self.task_stats.values_mut() {
            stats.window_size = window_size;
        }
    }

    pub fn clear(&mut self) {
        self.task_stats.clear();
        self.total_samples = 0;
        self.total_bias_ns = 0;
        self.overestimate_count = 0;
        self.underestimate_count = 0;
        self.accurate_count = 0;
    }

    pub fn clear_task(&mut self, task_id: &str) {
        self.task_stats.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correction_factor_unreliable_below_ten_samples() {
        let mut tracker = PredictionErrorTracker::new(PredictionTrackerConfig::default());
        for frame in 0..9 {
            tracker.record_prediction("shadow", 2_000_000, 2_500_000, frame);
        }
        assert_eq!(tracker.correction_factor("shadow"), 1.0);
    }

    #[test]
    fn test_correction_factor_converges() {
        let mut tracker = PredictionErrorTracker::new(PredictionTrackerConfig::default());
        for frame in 0..15 {
            tracker.record_prediction("shadowMap", 2_000_000, 2_500_000, frame);
        }
        let correction = tracker.correction_factor("shadowMap");
        assert!(correction > 1.24 && correction < 1.26, "got {correction}");

        let corrected = (2_000_000.0 * correction) as u64;
        assert!((2_480_000..2_520_000).contains(&corrected), "got {corrected}");
    }

    #[test]
    fn test_correction_factor_clamped() {
        let mut tracker = PredictionErrorTracker::new(PredictionTrackerConfig::default());
        for frame in 0..200 {
            tracker.record_prediction("wild", 1_000, 100_000, frame);
        }
        assert!(tracker.correction_factor("wild") <= 2.0);

        for frame in 0..200 {
            tracker.record_prediction("tiny", 100_000, 1_000, frame);
        }
        assert!(tracker.correction_factor("tiny") >= 0.5);
    }

    #[test]
    fn test_bias_confidence_perfect_consistency() {
        let mut tracker = PredictionErrorTracker::new(PredictionTrackerConfig::default());
        for frame in 0..20 {
            tracker.record_prediction("steady", 1_000_000, 1_200_000, frame);
        }
        let stats = tracker.task_stats("steady").unwrap();
        assert!((stats.bias_direction - 0.2).abs() < 1e-4);
        assert_eq!(stats.bias_confidence, 1.0);
    }

    #[test]
    fn test_zero_estimate_ratio_rule() {
        let mut tracker = PredictionErrorTracker::new(PredictionTrackerConfig::default());
        tracker.record_prediction("zero", 0, 5_000, 0);
        let stats = tracker.task_stats("zero").unwrap();
        assert_eq!(stats.last_error().unwrap().error_ratio, 10.0);

        tracker.record_prediction("both_zero", 0, 0, 0);
        let stats = tracker.task_stats("both_zero").unwrap();
        assert_eq!(stats.last_error().unwrap().error_ratio, 1.0);
    }

    #[test]
    fn test_eviction_drops_least_sampled() {
        let config = PredictionTrackerConfig {
            max_task_types: 2,
            ..Default::default()
        };
        let mut tracker = PredictionErrorTracker::new(config);
        tracker.record_prediction("a", 100, 100, 0);
        tracker.record_prediction("a", 100, 100, 1);
        tracker.record_prediction("b", 100, 100, 0);
        tracker.record_prediction("c", 100, 100, 0);

        assert_eq!(tracker.task_type_count(), 2);
        assert!(tracker.task_stats("a").is_some());
        assert!(tracker.task_stats("b").is_none());
    }

    #[test]
    fn test_global_stats_categorization() {
        let mut tracker = PredictionErrorTracker::new(PredictionTrackerConfig::default());
        tracker.record_prediction("under", 100, 200, 0); // underestimate
        tracker.record_prediction("over", 200, 100, 0); // overestimate
        tracker.record_prediction("good", 100, 105, 0); // accurate

        let global = tracker.global_stats();
        assert_eq!(global.total_samples, 3);
        assert_eq!(global.task_type_count, 3);
        assert!((global.underestimate_percent - 33.333).abs() < 0.01);
        assert!((global.accurate_percent - 33.333).abs() < 0.01);
    }

    #[test]
    fn test_window_bounds_history() {
        let config = PredictionTrackerConfig {
            window_size: 5,
            ..Default::default()
        };
        let mut tracker = PredictionErrorTracker::new(config);
        for frame in 0..20 {
            tracker.record_prediction("windowed", 100, 110, frame);
        }
        let stats = tracker.task_stats("windowed").unwrap();
        assert_eq!(stats.window_len(), 5);
        assert_eq!(stats.sample_count, 20);
    }
}
