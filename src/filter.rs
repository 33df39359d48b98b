//! Entry filtering.
//!
//! A filter is a pure predicate over a finished entry; an entry is emitted
//! only if every installed filter accepts it. Filters are identified by a
//! small closed enum so they can be named from the monitor and the command
//! line.

use crate::types::Entry;

/// Address-range service backing the [`TraceFilter::MemRegions`] filter.
///
/// Implemented by the emulator's debug-range infrastructure; an empty range
/// set matches every address.
pub trait AddressRanges: Send + Sync {
    fn is_empty(&self) -> bool;
    fn contains(&self, addr: u64) -> bool;
}

impl AddressRanges for Vec<std::ops::Range<u64>> {
    fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    fn contains(&self, addr: u64) -> bool {
        self.iter().any(|range| range.contains(&addr))
    }
}

/// Range service for configurations without address filtering.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRegions;

impl AddressRanges for NoRegions {
    fn is_empty(&self) -> bool {
        true
    }

    fn contains(&self, _addr: u64) -> bool {
        false
    }
}

/// Available entry filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFilter {
    /// Keep entries whose PC or any memory access falls inside the
    /// configured debug regions. Matches everything when no regions are set.
    MemRegions,
    /// Keep only entries that carry at least one event.
    Events,
}

impl TraceFilter {
    fn matches(self, regions: &dyn AddressRanges, entry: &Entry) -> bool {
        match self {
            TraceFilter::MemRegions => {
                if regions.is_empty() {
                    return true;
                }
                regions.contains(entry.pc) || entry.mem.iter().any(|m| regions.contains(m.addr))
            }
            TraceFilter::Events => !entry.events.is_empty(),
        }
    }
}

/// Ordered per-CPU filter list.
#[derive(Debug, Default)]
pub struct FilterSet {
    filters: Vec<TraceFilter>,
}

impl FilterSet {
    /// Append a filter. Duplicates are ignored.
    pub fn add(&mut self, filter: TraceFilter) {
        if !self.filters.contains(&filter) {
            self.filters.push(filter);
        }
    }

    /// Remove a filter, keeping the remaining ones in order.
    pub fn remove(&mut self, filter: TraceFilter) {
        self.filters.retain(|f| *f != filter);
    }

    /// Evaluate filters in order; the first rejection wins and later filters
    /// are not consulted.
    pub fn accepts(&self, regions: &dyn AddressRanges, entry: &Entry) -> bool {
        self.filters.iter().all(|f| f.matches(regions, entry))
    }

    pub fn iter(&self) -> impl Iterator<Item = TraceFilter> + '_ {
        self.filters.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, MemAccess, MemValue, MemoryRecord, TraceStateChange, PADDR_NONE};

    fn entry_with_mem(pc: u64, addr: u64) -> Entry {
        let mut entry = Entry::default();
        entry.pc = pc;
        entry.mem.push(MemoryRecord {
            access: MemAccess::Load,
            op: None,
            addr,
            paddr: PADDR_NONE,
            value: MemValue::Int { value: 0 },
        });
        entry
    }

    #[test]
    fn test_mem_regions_empty_matches_all() {
        let entry = entry_with_mem(0xdead, 0xbeef);
        assert!(TraceFilter::MemRegions.matches(&NoRegions, &entry));
    }

    #[test]
    fn test_mem_regions_matches_pc_or_access() {
        let regions: Vec<std::ops::Range<u64>> = vec![0x1000..0x2000];
        assert!(TraceFilter::MemRegions.matches(&regions, &entry_with_mem(0x1800, 0x0)));
        assert!(TraceFilter::MemRegions.matches(&regions, &entry_with_mem(0x0, 0x1234)));
        assert!(!TraceFilter::MemRegions.matches(&regions, &entry_with_mem(0x0, 0x9000)));
    }

    #[test]
    fn test_events_filter() {
        let mut entry = Entry::default();
        assert!(!TraceFilter::Events.matches(&NoRegions, &entry));
        entry.events.push(Event::State {
            next: TraceStateChange::Flush,
            pc: 0,
        });
        assert!(TraceFilter::Events.matches(&NoRegions, &entry));
    }

    #[test]
    fn test_filter_set_dedup_and_ordered_remove() {
        let mut set = FilterSet::default();
        set.add(TraceFilter::MemRegions);
        set.add(TraceFilter::Events);
        set.add(TraceFilter::MemRegions);
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![TraceFilter::MemRegions, TraceFilter::Events]
        );

        set.remove(TraceFilter::MemRegions);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![TraceFilter::Events]);
    }

    #[test]
    fn test_filter_set_rejects_on_first_failure() {
        let mut set = FilterSet::default();
        set.add(TraceFilter::Events);
        let entry = Entry::default();
        assert!(!set.accepts(&NoRegions, &entry));
    }
}
