// Copyright The Dyntrans Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Translation counters, kept per thread and reported at flush.

use log::info;

/// Counters for one thread's translator.
///
/// The probe histogram mirrors how far insertions landed from their home
/// slot; a fattening tail is the early warning that the mapping table is
/// filling up.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct TransStats {
    /// Translated units.
    pub translations: u64,
    /// Mapping-table lookups that took the slow (non-assembly) path.
    pub slow_lookups: u64,
    /// Insertions landing on their home slot.
    pub probe_direct: u64,
    /// Insertions displaced by one slot.
    pub probe_1: u64,
    /// Insertions displaced by two slots.
    pub probe_2: u64,
    /// Insertions displaced by three or four slots.
    pub probe_le4: u64,
    /// Insertions displaced by five to eight slots.
    pub probe_le8: u64,
    /// Insertions displaced further than eight slots.
    pub probe_gt8: u64,
}

impl TransStats {
    /// Accounts one insertion's probe displacement.
    pub fn record_probe(&mut self, displacement: usize) {
        match displacement {
            0 => self.probe_direct += 1,
            1 => self.probe_1 += 1,
            2 => self.probe_2 += 1,
            3..=4 => self.probe_le4 += 1,
            5..=8 => self.probe_le8 += 1,
            _ => self.probe_gt8 += 1,
        }
    }

    /// Logs the counters. Called when a flush retires the cache they
    /// describe.
    pub fn report(&self) {
        info!(
            "{} units translated, {} slow lookups; insert displacement 0/1/2/<=4/<=8/>8: \
             {}/{}/{}/{}/{}/{}",
            self.translations,
            self.slow_lookups,
            self.probe_direct,
            self.probe_1,
            self.probe_2,
            self.probe_le4,
            self.probe_le8,
            self.probe_gt8,
        );
    }
}
