//! Leveling curve and the precomputed cumulative-XP table
//!
//! The per-level cost grows piecewise: linear through level 20, then
//! polynomial with a steeper exponent past levels 100 and 500. The table is
//! built once and answers level lookups with a binary search.

use super::{MAX_LEVEL, MIN_LEVEL};

/// XP needed to go from `level - 1` to `level`.
pub fn xp_required(level: u32) -> i64 {
    let l = level as f64;
    match level {
        0..=1 => 0,
        2..=20 => level as i64 * 50,
        // L^1.5 as L * sqrt(L) keeps perfect squares exact
        21..=100 => (50.0 * l * l.sqrt()).floor() as i64,
        101..=500 => (50.0 * l.powf(1.8)).floor() as i64,
        _ => 50 * (level as i64) * (level as i64),
    }
}

/// Cumulative XP thresholds for every level up to the cap.
#[derive(Debug, Clone)]
pub struct LevelTable {
    /// `cumulative[L]` is the total XP at which level `L` is reached
    cumulative: Vec<i64>,
}

impl LevelTable {
    pub fn new() -> Self {
        let mut cumulative = Vec::with_capacity(MAX_LEVEL as usize + 1);
        cumulative.push(0);
        for level in 1..=MAX_LEVEL {
            let prev = cumulative[level as usize - 1];
            cumulative.push(prev + xp_required(level));
        }
        Self { cumulative }
    }

    /// Total XP at which `level` is reached (clamped to the table range).
    pub fn xp_for_level(&self, level: u32) -> i64 {
        self.cumulative[level.min(MAX_LEVEL) as usize]
    }

    /// Largest level whose threshold is at most `xp`, clamped to `[1, 1000]`.
    pub fn level_from_xp(&self, xp: i64) -> u32 {
        if xp <= 0 {
            return MIN_LEVEL;
        }
        let reached = self.cumulative.partition_point(|&threshold| threshold <= xp);
        (reached.saturating_sub(1) as u32).clamp(MIN_LEVEL, MAX_LEVEL)
    }

    /// Fraction of the way from the current level to the next, in `[0, 1]`.
    pub fn progress_to_next_level(&self, xp: i64) -> f64 {
        let level = self.level_from_xp(xp);
        if level >= MAX_LEVEL {
            return 1.0;
        }
        let base = self.cumulative[level as usize];
        let next = self.cumulative[level as usize + 1];
        ((xp - base) as f64 / (next - base) as f64).clamp(0.0, 1.0)
    }

    /// XP still missing to reach the next level; 0 at the cap.
    pub fn xp_to_next_level(&self, xp: i64) -> i64 {
        let level = self.level_from_xp(xp);
        if level >= MAX_LEVEL {
            return 0;
        }
        (self.cumulative[level as usize + 1] - xp.max(0)).max(0)
    }
}

impl Default for LevelTable {
    fn default() -> Self {
        Self::new()
    }
}
