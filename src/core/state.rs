use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Persisted progress of a generation run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AssemblyState {
    pub output_path: String,
    pub completed_segment_count: usize,
    pub total_segment_count: usize,
    pub voice_assignments: BTreeMap<String, String>,
    pub cumulative_duration_ms: u64,
    /// PCM frames in the output file when this state was written.
    #[serde(default)]
    pub committed_frames: u64,
    #[serde(default)]
    pub error_log: Vec<ErrorEntry>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorEntry {
    pub segment_index: usize,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot handed to progress callbacks after each segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GenerationStats {
    pub completed: usize,
    pub total: usize,
    pub cumulative_duration_ms: u64,
    pub elapsed: Duration,
}

impl GenerationStats {
    /// Remaining time extrapolated from the average time per segment processed in this run.
    pub fn eta(&self, processed_this_run: usize) -> Option<Duration> {
        if processed_this_run == 0 || self.completed >= self.total {
            return None;
        }
        let per_segment = self.elapsed / processed_this_run as u32;
        Some(per_segment * (self.total - self.completed) as u32)
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 * 100.0 / self.total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_json_layout() {
        let mut voices = BTreeMap::new();
        voices.insert("Alice".to_string(), "Kore".to_string());
        let state = AssemblyState {
            output_path: "book.wav".to_string(),
            completed_segment_count: 3,
            total_segment_count: 10,
            voice_assignments: voices,
            cumulative_duration_ms: 4200,
            committed_frames: 100_800,
            error_log: vec![],
            last_updated: Utc::now(),
        };

        let value = serde_json::to_value(&state).unwrap();
        for key in [
            "output_path",
            "completed_segment_count",
            "total_segment_count",
            "voice_assignments",
            "cumulative_duration_ms",
            "error_log",
            "last_updated",
        ] {
            assert!(value.get(key).is_some(), "missing key {}", key);
        }

        let back: AssemblyState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_eta_and_percent() {
        let stats = GenerationStats {
            completed: 4,
            total: 8,
            cumulative_duration_ms: 0,
            elapsed: Duration::from_secs(8),
        };
        assert_eq!(stats.eta(4), Some(Duration::from_secs(8)));
        assert_eq!(stats.eta(0), None);
        assert!((stats.percent() - 50.0).abs() < f64::EPSILON);
    }
}
