//! Bus statistics: raw counters plus derived percentages.
//!
//! Counters are tracked per phase (errors) and per trigger (resets)
//! rather than as a single generic failure count. Percentages are never
//! stored — they are computed from the raw integers at read time, so a
//! reader thread snapshotting the counters never races the writer over a
//! derived float.

/// Raw, monotonically increasing protocol counters.
///
/// Aggregate fields (`total`, `passive`, `active`, `request_total`,
/// `errors_*`, `resets_total`) are deliberately not stored here; they are
/// recomputed as sums of the finer-grained fields on every
/// [`Counters::snapshot`] call instead of being incremented separately,
/// which also sidesteps them ever drifting out of sync with their parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub passive_ms: u32,
    pub passive_mm: u32,
    pub passive_bc: u32,
    pub passive_ms_at_me: u32,
    pub passive_mm_at_me: u32,

    pub active_ms: u32,
    pub active_mm: u32,
    pub active_bc: u32,

    // Errors per phase, split passive (overheard, not ours) / reactive
    // (addressed to us, we answer) / active (we initiated), one bucket
    // per acknowledge-phase failure site.
    pub errors_passive_master: u32,
    pub errors_passive_master_ack: u32,
    pub errors_passive_slave: u32,
    pub errors_passive_slave_ack: u32,

    pub errors_reactive_master: u32,
    pub errors_reactive_master_ack: u32,
    pub errors_reactive_slave: u32,
    pub errors_reactive_slave_ack: u32,

    pub errors_active_master_ack: u32,
    pub errors_active_slave: u32,
    pub errors_active_slave_ack: u32,

    // Resets per trigger (see DESIGN.md for why a generic, untriggered
    // passive-reset bucket isn't carried here).
    pub resets_passive_00: u32,
    pub resets_passive_0704: u32,
    pub resets_active: u32,

    pub request_won: u32,
    pub request_won_1: u32,
    pub request_won_2: u32,
    pub request_retry: u32,
    pub request_lost: u32,
    pub request_lost_1: u32,
    pub request_lost_2: u32,
    pub request_error: u32,
}

/// A read-only snapshot of [`Counters`] with aggregate and percentage
/// fields derived from the raw counts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CountersSnapshot {
    pub raw: Counters,

    pub total: u32,
    pub passive: u32,
    pub active: u32,
    pub request_total: u32,

    pub errors_passive: u32,
    pub errors_reactive: u32,
    pub errors_active: u32,
    pub errors_total: u32,

    pub resets_total: u32,

    pub passive_percent: f32,
    pub active_percent: f32,
    pub failure_percent: f32,
    pub request_won_percent: f32,
    pub request_lost_percent: f32,
    pub request_error_percent: f32,
}

impl Counters {
    /// A zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes a [`CountersSnapshot`] with all aggregate and percentage
    /// fields derived from the current raw counts. Percentages of a
    /// zero-total counter set are `0.0`, not `NaN`.
    pub fn snapshot(&self) -> CountersSnapshot {
        let pct = |part: u32, whole: u32| -> f32 {
            if whole == 0 {
                0.0
            } else {
                (part as f32 / whole as f32) * 100.0
            }
        };

        let passive = self.passive_ms + self.passive_mm + self.passive_bc + self.passive_ms_at_me
            + self.passive_mm_at_me;
        let active = self.active_ms + self.active_mm + self.active_bc;
        let total = passive + active;
        let request_total = self.request_won + self.request_lost + self.request_error;

        let errors_passive = self.errors_passive_master
            + self.errors_passive_master_ack
            + self.errors_passive_slave
            + self.errors_passive_slave_ack;
        let errors_reactive = self.errors_reactive_master
            + self.errors_reactive_master_ack
            + self.errors_reactive_slave
            + self.errors_reactive_slave_ack;
        let errors_active = self.errors_active_master_ack + self.errors_active_slave + self.errors_active_slave_ack;
        let errors_total = errors_passive + errors_reactive + errors_active;

        let resets_total = self.resets_passive_00 + self.resets_passive_0704 + self.resets_active;

        CountersSnapshot {
            raw: *self,
            total,
            passive,
            active,
            request_total,
            errors_passive,
            errors_reactive,
            errors_active,
            errors_total,
            resets_total,
            passive_percent: pct(passive, total),
            active_percent: pct(active, total),
            failure_percent: pct(errors_total, total),
            request_won_percent: pct(self.request_won, request_total),
            request_lost_percent: pct(self.request_lost, request_total),
            request_error_percent: pct(self.request_error, request_total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentages_of_empty_counters_are_zero() {
        let c = Counters::new();
        let snap = c.snapshot();
        assert_eq!(snap.passive_percent, 0.0);
        assert_eq!(snap.request_won_percent, 0.0);
    }

    #[test]
    fn percentages_are_derived_correctly() {
        let mut c = Counters::new();
        c.passive_ms = 3;
        c.active_ms = 1;
        let snap = c.snapshot();
        assert_eq!(snap.total, 4);
        assert_eq!(snap.passive_percent, 75.0);
        assert_eq!(snap.active_percent, 25.0);
    }

    #[test]
    fn request_percentages_use_request_total_not_message_total() {
        let mut c = Counters::new();
        c.passive_ms = 100;
        c.request_won = 3;
        c.request_lost = 1;
        let snap = c.snapshot();
        assert_eq!(snap.request_total, 4);
        assert_eq!(snap.request_won_percent, 75.0);
    }

    #[test]
    fn errors_and_resets_aggregate_across_their_buckets() {
        let mut c = Counters::new();
        c.errors_passive_master = 1;
        c.errors_reactive_slave_ack = 2;
        c.errors_active_slave = 3;
        c.resets_passive_00 = 1;
        c.resets_passive_0704 = 1;
        c.resets_active = 2;

        let snap = c.snapshot();
        assert_eq!(snap.errors_passive, 1);
        assert_eq!(snap.errors_reactive, 2);
        assert_eq!(snap.errors_active, 3);
        assert_eq!(snap.errors_total, 6);
        assert_eq!(snap.resets_total, 4);
    }
}
