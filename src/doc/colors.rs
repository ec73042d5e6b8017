//! Caret color assignment.

use std::collections::HashMap;

/// The fixed caret palette. Hues are spread so adjacent assignments stay
/// visually distinct.
pub const CARET_PALETTE: [&str; 16] = [
    "#e6194b", "#3cb44b", "#dba400", "#4363d8", "#f58231", "#911eb4",
    "#46f0f0", "#f032e6", "#8a9a18", "#205375", "#008080", "#9a6324",
    "#800000", "#2a9d3c", "#808000", "#000075",
];

/// Least-recently-used color picker over the fixed palette, preferring
/// colors disjoint from currently-active sessions.
pub struct ColorPicker {
    /// session id → palette index
    assigned: HashMap<String, usize>,
    last_used: [u64; CARET_PALETTE.len()],
    tick: u64,
}

impl Default for ColorPicker {
    fn default() -> Self {
        Self::new()
    }
}

impl ColorPicker {
    pub fn new() -> Self {
        Self {
            assigned: HashMap::new(),
            last_used: [0; CARET_PALETTE.len()],
            tick: 0,
        }
    }

    /// Assign a color to a session. Idempotent per session. Picks the
    /// least-recently-used color among those no active session holds;
    /// with the palette exhausted, the least-recently-used color overall.
    pub fn acquire(&mut self, session_id: &str) -> &'static str {
        if let Some(&idx) = self.assigned.get(session_id) {
            return CARET_PALETTE[idx];
        }
        let in_use: Vec<usize> = self.assigned.values().copied().collect();
        let candidates = (0..CARET_PALETTE.len()).filter(|i| !in_use.contains(i));
        let idx = candidates
            .min_by_key(|&i| self.last_used[i])
            .unwrap_or_else(|| {
                (0..CARET_PALETTE.len())
                    .min_by_key(|&i| self.last_used[i])
                    .expect("palette is non-empty")
            });
        self.tick += 1;
        self.last_used[idx] = self.tick;
        self.assigned.insert(session_id.to_string(), idx);
        CARET_PALETTE[idx]
    }

    pub fn release(&mut self, session_id: &str) {
        self.assigned.remove(session_id);
    }

    pub fn active_count(&self) -> usize {
        self.assigned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_idempotent() {
        let mut picker = ColorPicker::new();
        let a = picker.acquire("s1");
        assert_eq!(picker.acquire("s1"), a);
        assert_eq!(picker.active_count(), 1);
    }

    #[test]
    fn test_distinct_until_exhausted() {
        let mut picker = ColorPicker::new();
        let mut seen = std::collections::BTreeSet::new();
        for n in 0..CARET_PALETTE.len() {
            assert!(seen.insert(picker.acquire(&format!("s{n}"))));
        }
        // Seventeenth session shares the least-recently-used color.
        let overflow = picker.acquire("s16");
        assert!(seen.contains(overflow));
    }

    #[test]
    fn test_release_recycles_lru() {
        let mut picker = ColorPicker::new();
        let first = picker.acquire("s1");
        let _second = picker.acquire("s2");
        picker.release("s1");

        // s1's color is free again, and because every other free color is
        // untouched (tick 0) one of those wins first; fill the palette to
        // force reuse.
        for n in 3..=16 {
            picker.acquire(&format!("s{n}"));
        }
        assert_eq!(picker.acquire("s17"), first);
    }

    #[test]
    fn test_palette_is_valid() {
        for color in CARET_PALETTE {
            assert_eq!(color.len(), 7);
            assert!(color.starts_with('#'));
            assert!(color[1..]
                .bytes()
                .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        }
        let unique: std::collections::BTreeSet<_> = CARET_PALETTE.iter().collect();
        assert_eq!(unique.len(), CARET_PALETTE.len());
    }
}
