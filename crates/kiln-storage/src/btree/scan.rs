//! Ordered forward scan between two index positions.

use kiln_common::Result;

use super::node::NodeHandle;
use super::tree::BTreeIndex;
use super::LEAF_HEADER_PAGE;
use crate::rid::{Iid, Rid};

/// Lazy forward cursor yielding rids in key order from `begin` (inclusive)
/// to `end` (exclusive).
///
/// The cursor keeps a pin and a read latch on the leaf it currently stands
/// in and moves to the successor hand-over-hand: the next leaf's latch is
/// acquired before the current one is released, so no key range between
/// the two can change under it mid-step. Everything is released when the
/// scan is dropped.
pub struct IndexScan<'a> {
    tree: &'a BTreeIndex,
    /// Current leaf, pinned and read-latched. None once exhausted.
    leaf: Option<NodeHandle<'a>>,
    iid: Iid,
    end: Iid,
    /// Last key yielded, kept to resume above it after a contended leaf
    /// transition (a rebalance may have shifted it into the successor).
    last_key: Vec<u8>,
    have_last: bool,
    done: bool,
}

impl<'a> IndexScan<'a> {
    /// Opens a cursor at `begin`. An invalid or empty range starts
    /// exhausted.
    pub(crate) fn new(tree: &'a BTreeIndex, begin: Iid, end: Iid) -> Result<Self> {
        let mut scan = Self {
            tree,
            leaf: None,
            iid: begin,
            end,
            last_key: Vec::new(),
            have_last: false,
            done: false,
        };
        if begin == Iid::INVALID || end == Iid::INVALID || begin == end {
            scan.done = true;
            return Ok(scan);
        }
        let leaf = tree.fetch_node(begin.page_num)?;
        leaf.frame().latch_read();
        scan.leaf = Some(leaf);
        Ok(scan)
    }

    /// Current position of the cursor.
    pub fn position(&self) -> Iid {
        self.iid
    }

    /// Returns true once the cursor is exhausted.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn release(&mut self) {
        if let Some(leaf) = self.leaf.take() {
            leaf.frame().unlatch_read();
            self.tree.unpin(&leaf, false);
        }
        self.done = true;
    }

    fn step(&mut self) -> Result<Option<Rid>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if self.iid == self.end {
                self.release();
                return Ok(None);
            }
            let leaf = match self.leaf {
                Some(leaf) => leaf,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };

            let slot = self.iid.slot_num as usize;
            if slot < leaf.num_keys() {
                let rid = leaf.rid(slot);
                self.last_key.clear();
                self.last_key.extend_from_slice(leaf.key(slot));
                self.have_last = true;
                self.iid.slot_num += 1;
                return Ok(Some(rid));
            }

            // Past the last slot: couple onto the successor leaf. Pin it
            // before anything else so it cannot be deleted out from under
            // the cursor.
            let next_no = leaf.next_leaf();
            if next_no == LEAF_HEADER_PAGE {
                self.release();
                return Ok(None);
            }
            let next = match self.tree.fetch_node(next_no) {
                Ok(next) => next,
                Err(e) => {
                    self.release();
                    return Err(e);
                }
            };
            let mut start = 0usize;
            if next.frame().try_latch_read() {
                leaf.frame().unlatch_read();
                self.tree.unpin(&leaf, false);
            } else {
                // A writer is coupling right-to-left through this pair of
                // leaves (sibling rebalance); blocking while we hold the
                // current latch could deadlock against it. Our pin on the
                // successor keeps its contents addressable even if the
                // writer merges it away in the gap.
                leaf.frame().unlatch_read();
                self.tree.unpin(&leaf, false);
                next.frame().latch_read();
                // The gap may have shifted already-yielded keys into the
                // successor's head; resume strictly above the last one.
                if self.have_last
                    && next.num_keys() > 0
                    && self
                        .tree
                        .meta
                        .schema
                        .compare(next.key(0), &self.last_key)
                        != std::cmp::Ordering::Greater
                {
                    start = next.upper_bound(&self.last_key);
                }
            }
            self.leaf = Some(next);
            self.iid = Iid::new(next_no, start as u32);
        }
    }
}

impl Iterator for IndexScan<'_> {
    type Item = Result<Rid>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(rid)) => Some(Ok(rid)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for IndexScan<'_> {
    fn drop(&mut self) {
        if let Some(leaf) = self.leaf.take() {
            leaf.frame().unlatch_read();
            self.tree.unpin(&leaf, false);
        }
    }
}
