//! Discovery table for button presses with no configured button.

use crate::domain::model::LearnedButton;
use crate::domain::registry::Registry;

impl Registry {
    /// Counts one unmapped press of `(switch, mask)`.
    ///
    /// A new pair starts at count 1; a repeat increments the count and
    /// refreshes `last_seen_ms` and the reporting controller.  Entries are
    /// only removed by an explicit delete or by configuring the button.
    pub fn record_learned_press(
        &mut self,
        controller_id: Option<&str>,
        switch: u32,
        mask: u8,
        now_ms: u64,
    ) -> LearnedButton {
        let key = LearnedButton::key(switch, mask);
        let entry = self
            .learned
            .entry(key.clone())
            .and_modify(|e| {
                e.count = e.count.saturating_add(1);
                e.last_seen_ms = now_ms;
            })
            .or_insert_with(|| LearnedButton {
                id: key,
                switch,
                mask,
                controller_id: None,
                count: 1,
                first_seen_ms: now_ms,
                last_seen_ms: now_ms,
            });
        if let Some(id) = controller_id {
            entry.controller_id = Some(id.to_string());
        }
        entry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ButtonInput, SwitchInput};

    #[test]
    fn test_repeat_press_increments_count() {
        // Arrange
        let mut reg = Registry::new();

        // Act
        let first = reg.record_learned_press(Some("c"), 7, 4, 1_000);
        let second = reg.record_learned_press(Some("c"), 7, 4, 2_500);

        // Assert
        assert_eq!(first.count, 1);
        assert_eq!(second.id, "7:4");
        assert_eq!(second.count, 2);
        assert_eq!(second.first_seen_ms, 1_000);
        assert_eq!(second.last_seen_ms, 2_500);
        assert_eq!(reg.learned_buttons().count(), 1);
    }

    #[test]
    fn test_latest_controller_is_kept() {
        let mut reg = Registry::new();
        reg.record_learned_press(Some("a"), 1, 1, 0);
        let entry = reg.record_learned_press(Some("b"), 1, 1, 1);
        assert_eq!(entry.controller_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_configuring_button_adopts_learned_entry() {
        // Arrange
        let mut reg = Registry::new();
        reg.record_learned_press(None, 7, 4, 0);
        reg.upsert_switch(SwitchInput { switch: Some(7), ..Default::default() })
            .expect("switch");

        // Act
        reg.upsert_button(ButtonInput { switch: Some(7), mask: 4, ..Default::default() })
            .expect("button");

        // Assert
        assert!(reg.learned_button("7:4").is_none());
    }
}
