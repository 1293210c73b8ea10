use crate::core::BlockHeader;
use log::info;
use serde::{Deserialize, Serialize};

/// Retargeting rules.
///
/// Difficulty is re-evaluated once every `window` blocks by comparing the
/// time the last `window` blocks took against `target_window_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DifficultyPolicy {
    pub window: u64,
    pub target_window_secs: u64,
    // Elapsed time within this percentage of the target counts as on time
    pub tolerance_percent: u64,
    pub step: u32,
    pub floor: u32,
    pub initial: u32,
    pub max: u32,
}

impl Default for DifficultyPolicy {
    fn default() -> Self {
        DifficultyPolicy {
            window: 10,
            target_window_secs: 300,
            tolerance_percent: 10,
            step: 1,
            floor: 1,
            initial: 16,
            max: 255,
        }
    }
}

impl DifficultyPolicy {
    pub fn target_window_ms(&self) -> u64 {
        self.target_window_secs.saturating_mul(1000)
    }

    /// Whether a block may claim `difficulty` at all
    pub fn allows(&self, difficulty: u32) -> bool {
        (self.floor..=self.max).contains(&difficulty)
    }
}

/// Difficulty adjustment algorithm for maintaining consistent block times
pub struct DifficultyAdjustment;

impl DifficultyAdjustment {
    /// Difficulty for the block after the last header in `history`.
    ///
    /// `history` is in chain order and ends at the current tip. Only the last
    /// `policy.window` headers are looked at.
    pub fn next_difficulty(history: &[BlockHeader], policy: &DifficultyPolicy) -> u32 {
        let tip = match history.last() {
            Some(tip) => tip,
            None => return policy.initial,
        };
        // Genesis carries difficulty 0, its successor starts at the initial value
        if tip.get_index() == 0 {
            return policy.initial;
        }
        let current = tip.get_difficulty().clamp(policy.floor, policy.max);

        let window = policy.window.max(2);
        let next_height = tip.get_index() + 1;
        if next_height % window != 0 {
            return current;
        }

        let start = history.len().saturating_sub(window as usize);
        let first = &history[start];
        // The genesis timestamp is fixed, so a window touching it says nothing
        if first.get_index() == 0 || history.len() - start < window as usize {
            return current;
        }

        let actual = tip.get_timestamp().saturating_sub(first.get_timestamp()).max(0) as u64;
        let target = policy.target_window_ms();
        let next = Self::adjust(current, actual, target, policy);

        if next != current {
            info!(
                "Difficulty adjustment at height {next_height}: {current} -> {next} (actual: {actual}ms, target: {target}ms)"
            );
        }
        next
    }

    /// One step up when `actual` is below the tolerance band, one step down
    /// when above it, clamped to `[floor, max]`
    pub fn adjust(current: u32, actual_ms: u64, target_ms: u64, policy: &DifficultyPolicy) -> u32 {
        let lower = target_ms.saturating_mul(100 - policy.tolerance_percent.min(100)) / 100;
        let upper = target_ms.saturating_mul(100 + policy.tolerance_percent) / 100;

        let next = if actual_ms < lower {
            current.saturating_add(policy.step)
        } else if actual_ms > upper {
            current.saturating_sub(policy.step)
        } else {
            current
        };
        next.clamp(policy.floor, policy.max)
    }
}
