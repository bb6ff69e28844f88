// SPDX-License-Identifier: MPL-2.0

use super::region::LayoutRegion;
use crate::prelude::*;

/// A walker over a decoded region table.
///
/// The first failed expectation is recorded and every later call becomes a
/// no-op, so a walk can run to completion and report its first error at
/// the end. Expectations may be probes (`expect` false): a missing region
/// or a kind mismatch then simply answers `false` without spoiling the
/// iterator, which is how trailing zone regions are counted.
#[derive(Clone)]
pub(crate) struct RegionIterator<'a> {
    regions: &'a [LayoutRegion],
    next_region: usize,
    next_block: BlockCount,
    error: Option<&'static str>,
}

impl<'a> RegionIterator<'a> {
    pub fn new(regions: &'a [LayoutRegion], first_block: BlockCount) -> Self {
        RegionIterator {
            regions,
            next_region: 0,
            next_block: first_block,
            error: None,
        }
    }

    pub fn next_block(&self) -> BlockCount {
        self.next_block
    }

    /// Moves the block cursor; converted layouts skip the volume shift.
    pub fn advance_block(&mut self, num_blocks: BlockCount) {
        self.next_block = self.next_block.wrapping_add(num_blocks);
    }

    pub fn set_next_block(&mut self, next_block: BlockCount) {
        self.next_block = next_block;
    }

    pub fn has_remaining_regions(&self) -> bool {
        self.next_region < self.regions.len()
    }

    pub fn record_error(&mut self, msg: &'static str) {
        error!("{msg}");
        if self.error.is_none() {
            self.error = Some(msg);
        }
    }

    /// Checks the next region against expectations and consumes it on a
    /// match.
    ///
    /// With `expect` set, a missing region or a wrong kind records an
    /// error; as a probe they just answer `None`. A region at the wrong
    /// offset or with the wrong instance is always an error. A non-zero
    /// `num_blocks` also checks the region size.
    pub fn expect(
        &mut self,
        expect: bool,
        num_blocks: BlockCount,
        kind: u16,
        instance: u16,
    ) -> Option<LayoutRegion> {
        if self.error.is_some() {
            return None;
        }

        let Some(region) = self.regions.get(self.next_region) else {
            if expect {
                self.record_error("ran out of layout regions in region table");
            }
            return None;
        };

        if region.start_block != self.next_block {
            self.record_error("layout region not at expected offset");
            return None;
        }

        if region.kind != kind {
            if expect {
                self.record_error("layout region has incorrect kind");
            }
            return None;
        }

        if region.instance != instance {
            self.record_error("layout region has incorrect instance");
            return None;
        }

        if num_blocks > 0 && region.num_blocks != num_blocks {
            self.record_error("layout region size is incorrect");
            return None;
        }

        self.next_block = self.next_block.wrapping_add(region.num_blocks);
        self.next_region += 1;
        Some(*region)
    }

    pub fn result(&self) -> Result<()> {
        match self.error {
            Some(msg) => Err(Error::with_msg(UnexpectedResult, msg)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::region::{
        RL_KIND_HEADER, RL_KIND_SCRATCH, RL_KIND_VOLUME_INDEX, SOLE_INSTANCE, setup_layout,
    };

    fn sample_regions() -> Vec<LayoutRegion> {
        let mut next_block = 10;
        vec![
            setup_layout(&mut next_block, 1, RL_KIND_HEADER, SOLE_INSTANCE),
            setup_layout(&mut next_block, 2, RL_KIND_VOLUME_INDEX, 0),
            setup_layout(&mut next_block, 2, RL_KIND_VOLUME_INDEX, 1),
            setup_layout(&mut next_block, 3, RL_KIND_SCRATCH, SOLE_INSTANCE),
        ]
    }

    #[test]
    fn walks_a_well_formed_table() {
        let regions = sample_regions();
        let mut iter = RegionIterator::new(&regions, 10);
        let header = iter.expect(true, 1, RL_KIND_HEADER, SOLE_INSTANCE).unwrap();
        assert_eq!(header.start_block, 10);

        // Count the zone regions with probes, as reconstruction does.
        let mut probe = iter.clone();
        let mut zones = 0;
        while probe.expect(false, 0, RL_KIND_VOLUME_INDEX, zones).is_some() {
            zones += 1;
        }
        assert_eq!(zones, 2);

        for zone in 0..zones {
            iter.expect(true, 0, RL_KIND_VOLUME_INDEX, zone).unwrap();
        }
        iter.expect(true, 0, RL_KIND_SCRATCH, SOLE_INSTANCE).unwrap();
        assert!(!iter.has_remaining_regions());
        assert_eq!(iter.next_block(), 18);
        iter.result().unwrap();
    }

    #[test]
    fn first_error_sticks() {
        let regions = sample_regions();
        let mut iter = RegionIterator::new(&regions, 10);
        assert!(iter.expect(true, 1, RL_KIND_SCRATCH, SOLE_INSTANCE).is_none());
        // The iterator is now inert, even for valid expectations.
        assert!(iter.expect(true, 1, RL_KIND_HEADER, SOLE_INSTANCE).is_none());
        assert!(iter.result().is_err());
    }

    #[test]
    fn probe_misses_do_not_record_errors() {
        let regions = sample_regions();
        let mut iter = RegionIterator::new(&regions, 10);
        assert!(iter.expect(false, 0, RL_KIND_SCRATCH, SOLE_INSTANCE).is_none());
        iter.result().unwrap();
    }

    #[test]
    fn wrong_offset_is_an_error_even_for_probes() {
        let regions = sample_regions();
        let mut iter = RegionIterator::new(&regions, 99);
        assert!(iter.expect(false, 0, RL_KIND_HEADER, SOLE_INSTANCE).is_none());
        assert!(iter.result().is_err());
    }
}
