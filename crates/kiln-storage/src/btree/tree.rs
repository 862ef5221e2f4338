//! Concurrent B+ tree index over buffer-pool pages.
//!
//! One index lives in one file: page 0 holds the [`FileHeader`], page 1 the
//! leaf-ring sentinel, pages from 2 up the tree nodes. Multiple threads
//! operate on the same tree simultaneously under the latch-crabbing
//! protocol implemented by [`BTreeIndex::find_leaf`]: readers couple child
//! read latches downward, writers keep a bag of exclusive latches that is
//! collapsed whenever a child proves safe and released in one pass at the
//! end of the operation.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};

use kiln_buffer::{BufferPool, EvictedPage};
use kiln_common::page::{PageId, NO_PAGE, PAGE_SIZE};
use kiln_common::{KilnError, Result};

use super::header::FileHeader;
use super::keys::KeySchema;
use super::node::NodeHandle;
use super::scan::IndexScan;
use super::{node_capacity, Operation, FILE_HEADER_PAGE, LEAF_HEADER_PAGE};
use crate::disk::DiskManager;
use crate::rid::{Iid, Rid};
use crate::txn::Transaction;

/// In-memory mirror of the index metadata plus the derived node geometry.
///
/// The mutable fields shadow the persistent [`FileHeader`] and are written
/// back by [`BTreeIndex::flush`]. `root_page` only changes under the root
/// latch; the leaf-boundary fields change under the latches of the leaves
/// involved.
pub(crate) struct TreeMeta {
    pub(crate) schema: KeySchema,
    /// Maximum keys per node; a node reaching this count must split.
    pub(crate) max_size: usize,
    /// Underflow threshold for non-root nodes.
    pub(crate) min_size: usize,
    pub(crate) root_page: AtomicU32,
    pub(crate) first_leaf: AtomicU32,
    pub(crate) last_leaf: AtomicU32,
    pub(crate) num_pages: AtomicU32,
}

impl TreeMeta {
    pub(crate) fn new(schema: KeySchema) -> Result<Self> {
        let max_size = node_capacity(schema.key_len());
        // Below order 4 a capacity-full split cannot keep the one-insert
        // safety margin the crab release relies on
        if max_size < 4 {
            return Err(KilnError::InvalidParameter {
                name: "btree_order".to_string(),
                value: max_size.to_string(),
            });
        }
        let min_size = max_size.div_ceil(2);
        Ok(Self {
            schema,
            max_size,
            min_size,
            root_page: AtomicU32::new(NO_PAGE),
            first_leaf: AtomicU32::new(LEAF_HEADER_PAGE),
            last_leaf: AtomicU32::new(LEAF_HEADER_PAGE),
            num_pages: AtomicU32::new(0),
        })
    }
}

/// A persistent, concurrent B+ tree mapping fixed-width composite keys to
/// record identifiers.
pub struct BTreeIndex {
    file_id: u32,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    pub(crate) meta: TreeMeta,
    /// Guards `root_page` mutation and the empty-tree transition. Locked
    /// and unlocked across scopes by the crabbing protocol, tracked by the
    /// `root_latched` flag that `find_leaf` hands back.
    root_latch: RawMutex,
    /// Serializes buffer-pool misses so two loaders cannot race on the
    /// same page.
    load_latch: Mutex<()>,
}

impl BTreeIndex {
    /// Formats a fresh index file: header in page 0, leaf-ring sentinel in
    /// page 1, empty tree.
    pub fn create(
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        file_id: u32,
        schema: KeySchema,
    ) -> Result<Self> {
        if disk.num_pages(file_id)? != 0 {
            return Err(KilnError::IoError(format!(
                "index file {file_id} is not empty"
            )));
        }

        let meta = TreeMeta::new(schema)?;
        meta.num_pages.store(2, Ordering::Release);
        let tree = Self {
            file_id,
            disk,
            pool,
            meta,
            root_latch: RawMutex::INIT,
            load_latch: Mutex::new(()),
        };

        let header_pid = tree.disk.allocate_page(file_id)?;
        let sentinel_pid = tree.disk.allocate_page(file_id)?;
        debug_assert_eq!(header_pid.page_num, FILE_HEADER_PAGE);
        debug_assert_eq!(sentinel_pid.page_num, LEAF_HEADER_PAGE);

        // The sentinel closes the (still empty) leaf ring onto itself
        let (frame, evicted) = tree.pool.new_page(sentinel_pid)?;
        tree.writeback(evicted)?;
        let sentinel = NodeHandle::new(frame, &tree.meta, LEAF_HEADER_PAGE);
        sentinel.init(true);
        sentinel.set_prev_leaf(LEAF_HEADER_PAGE);
        sentinel.set_next_leaf(LEAF_HEADER_PAGE);
        tree.pool.unpin_page(sentinel_pid, true);
        tree.pool.flush_page(sentinel_pid, |pid, data| {
            write_page_bytes(&tree.disk, pid, data)
        })?;

        tree.write_header()?;
        log::info!(
            "created index file {file_id} (order {}, key length {})",
            tree.meta.max_size,
            tree.meta.schema.key_len()
        );
        Ok(tree)
    }

    /// Opens an existing index file, reconstructing the metadata from its
    /// header page.
    pub fn open(disk: Arc<DiskManager>, pool: Arc<BufferPool>, file_id: u32) -> Result<Self> {
        let buf = disk.read_page(PageId::new(file_id, FILE_HEADER_PAGE))?;
        let header = FileHeader::from_bytes(&buf)?;

        let schema = KeySchema::new(header.columns.clone())?;
        let meta = TreeMeta::new(schema)?;
        if meta.max_size != header.btree_order as usize {
            return Err(KilnError::BTreeCorrupted(format!(
                "stored order {} does not match computed order {}",
                header.btree_order, meta.max_size
            )));
        }
        meta.root_page.store(header.root_page, Ordering::Release);
        meta.first_leaf.store(header.first_leaf, Ordering::Release);
        meta.last_leaf.store(header.last_leaf, Ordering::Release);
        meta.num_pages.store(header.num_pages, Ordering::Release);

        // Seed the allocation cursor; deleted pages stay as holes, so the
        // cursor never moves backwards.
        disk.set_num_pages(file_id, header.num_pages)?;
        log::info!("opened index file {file_id} ({} pages)", header.num_pages);

        Ok(Self {
            file_id,
            disk,
            pool,
            meta,
            root_latch: RawMutex::INIT,
            load_latch: Mutex::new(()),
        })
    }

    /// Returns the file this index lives in.
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Returns the key schema.
    pub fn schema(&self) -> &KeySchema {
        &self.meta.schema
    }

    /// Returns the maximum number of keys per node.
    pub fn order(&self) -> usize {
        self.meta.max_size
    }

    /// Returns true when the tree holds no keys at all.
    pub fn is_empty(&self) -> bool {
        self.meta.root_page.load(Ordering::Acquire) == NO_PAGE
    }

    /// Writes the header and every dirty page back to disk.
    pub fn flush(&self) -> Result<()> {
        self.write_header()?;
        self.pool
            .flush_all(|pid, data| write_page_bytes(&self.disk, pid, data))?;
        self.disk.flush()
    }

    fn write_header(&self) -> Result<()> {
        let header = FileHeader {
            page_size: PAGE_SIZE as u32,
            btree_order: self.meta.max_size as u32,
            num_pages: self.meta.num_pages.load(Ordering::Acquire),
            root_page: self.meta.root_page.load(Ordering::Acquire),
            first_leaf: self.meta.first_leaf.load(Ordering::Acquire),
            last_leaf: self.meta.last_leaf.load(Ordering::Acquire),
            key_len: self.meta.schema.key_len() as u32,
            columns: self.meta.schema.columns().to_vec(),
        };
        self.disk
            .write_page(self.page_id(FILE_HEADER_PAGE), &header.to_bytes())
    }

    // =========================================================================
    // Page plumbing
    // =========================================================================

    #[inline]
    fn page_id(&self, page_no: u32) -> PageId {
        PageId::new(self.file_id, page_no)
    }

    fn writeback(&self, evicted: Option<EvictedPage>) -> Result<()> {
        if let Some(page) = evicted {
            self.disk.write_page(page.page_id, &page.data)?;
        }
        Ok(())
    }

    /// Fetches a node page, pinning it. Reads through to disk on a pool
    /// miss.
    pub(crate) fn fetch_node(&self, page_no: u32) -> Result<NodeHandle<'_>> {
        let pid = self.page_id(page_no);
        if let Some(frame) = self.pool.fetch_page(pid) {
            return Ok(NodeHandle::new(frame, &self.meta, page_no));
        }

        // Miss path: serialize loaders, then re-check, so a racing fetch
        // can never clobber a page another thread already loaded and is
        // mutating under latch.
        let _guard = self.load_latch.lock();
        if let Some(frame) = self.pool.fetch_page(pid) {
            return Ok(NodeHandle::new(frame, &self.meta, page_no));
        }
        let data = self.disk.read_page(pid)?;
        let (frame, evicted) = self.pool.load_page(pid, &data)?;
        self.writeback(evicted)?;
        Ok(NodeHandle::new(frame, &self.meta, page_no))
    }

    /// Allocates a fresh node page, pinned and zeroed.
    fn new_node(&self) -> Result<NodeHandle<'_>> {
        let pid = self.disk.allocate_page(self.file_id)?;
        let (frame, evicted) = self.pool.new_page(pid)?;
        self.writeback(evicted)?;
        self.meta.num_pages.fetch_add(1, Ordering::AcqRel);
        Ok(NodeHandle::new(frame, &self.meta, pid.page_num))
    }

    #[inline]
    pub(crate) fn unpin(&self, node: &NodeHandle<'_>, dirty: bool) {
        self.pool.unpin_page(self.page_id(node.page_no()), dirty);
    }

    #[inline]
    fn mark_dirty(&self, node: &NodeHandle<'_>) {
        self.pool.mark_dirty(self.page_id(node.page_no()));
    }

    fn lock_root(&self) {
        self.root_latch.lock();
    }

    fn unlock_root(&self) {
        // The crabbing protocol guarantees the current thread locked it
        unsafe { self.root_latch.unlock() };
    }

    /// Releases every write latch in the transaction's latch bag, then
    /// unpins the pages. Unlatch strictly before unpin: once the pin drops
    /// the pool may evict the frame.
    fn release_latch_bag(&self, txn: &Transaction) {
        for pid in txn.take_index_latched_pages() {
            if let Some(frame) = self.pool.peek_frame(pid) {
                frame.unlatch_write();
            }
            self.pool.unpin_page(pid, false);
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.meta.schema.key_len() {
            return Err(KilnError::InvalidParameter {
                name: "key length".to_string(),
                value: key.len().to_string(),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Latch-crab descent
    // =========================================================================

    /// Descends from the root to the leaf responsible for `key` under the
    /// latch regime of `op`.
    ///
    /// Readers couple downward: child read latch first, then parent
    /// release. Writers take write latches into the transaction's latch
    /// bag and collapse the bag (ancestors plus the root latch) whenever
    /// the child is safe for `op`. With `find_first` the descent is forced
    /// through child 0 at every level and never collapses, because the
    /// path does not reflect the real key.
    ///
    /// Returns the leaf with its latch held, plus whether the root latch
    /// is still held by this operation.
    fn find_leaf(
        &self,
        key: &[u8],
        op: Operation,
        txn: &Transaction,
        find_first: bool,
    ) -> Result<(NodeHandle<'_>, bool)> {
        debug_assert!(!self.is_empty());
        let write_op = matches!(op, Operation::Insert | Operation::Delete);

        // Taking the root latch before resolving the root page keeps a
        // concurrent root split from handing us a stale root.
        self.lock_root();
        let mut root_latched = true;

        let root_no = self.meta.root_page.load(Ordering::Acquire);
        let mut node = match self.fetch_node(root_no) {
            Ok(node) => node,
            Err(e) => {
                self.unlock_root();
                return Err(e);
            }
        };

        if write_op {
            node.frame().latch_write();
            txn.append_index_latched_page(self.page_id(root_no));
        } else {
            node.frame().latch_read();
            self.unlock_root();
            root_latched = false;
        }

        while !node.is_leaf() {
            let child_no = if find_first {
                node.child(0)
            } else {
                node.internal_lookup(key, op)
            };

            let child = match self.fetch_node(child_no) {
                Ok(child) => child,
                Err(e) => {
                    if write_op {
                        self.release_latch_bag(txn);
                        if root_latched {
                            self.unlock_root();
                        }
                    } else {
                        node.frame().unlatch_read();
                        self.unpin(&node, false);
                    }
                    return Err(e);
                }
            };

            if write_op {
                child.frame().latch_write();
                if !find_first && child.is_safe(op) {
                    self.release_latch_bag(txn);
                    if root_latched {
                        self.unlock_root();
                        root_latched = false;
                    }
                }
                txn.append_index_latched_page(self.page_id(child_no));
            } else {
                child.frame().latch_read();
                node.frame().unlatch_read();
                self.unpin(&node, false);
            }

            node = child;
        }

        Ok((node, root_latched))
    }

    // =========================================================================
    // Point lookup
    // =========================================================================

    /// Returns the rids stored under `key` (at most one; the index is
    /// unique).
    pub fn get_value(&self, key: &[u8], txn: &Transaction) -> Result<Vec<Rid>> {
        self.check_key(key)?;
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let (leaf, _) = self.find_leaf(key, Operation::Find, txn, false)?;

        if let Some(rid) = leaf.leaf_lookup(key) {
            leaf.frame().unlatch_read();
            self.unpin(&leaf, false);
            return Ok(vec![rid]);
        }

        // A racing split can strand an equal key at the head of the next
        // leaf before the separators catch up.
        if leaf.page_no() == self.meta.last_leaf.load(Ordering::Acquire) {
            leaf.frame().unlatch_read();
            self.unpin(&leaf, false);
            return Ok(Vec::new());
        }
        let next = match self.fetch_node(leaf.next_leaf()) {
            Ok(next) => next,
            Err(e) => {
                leaf.frame().unlatch_read();
                self.unpin(&leaf, false);
                return Err(e);
            }
        };
        // Couple forward without waiting while the leaf latch is held: a
        // sibling rebalance latches right-to-left and would deadlock with
        // us. The pin taken above keeps the successor addressable.
        if next.frame().try_latch_read() {
            leaf.frame().unlatch_read();
            self.unpin(&leaf, false);
        } else {
            leaf.frame().unlatch_read();
            self.unpin(&leaf, false);
            next.frame().latch_read();
        }
        let hit = next.num_keys() > 0
            && self.meta.schema.compare(next.key(0), key) == CmpOrdering::Equal;
        let rid = if hit { Some(next.rid(0)) } else { None };
        next.frame().unlatch_read();
        self.unpin(&next, false);
        Ok(rid.into_iter().collect())
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts a key/rid pair. Returns the leaf page that received the
    /// pair, or None if the key already exists.
    pub fn insert_entry(&self, key: &[u8], rid: Rid, txn: &Transaction) -> Result<Option<u32>> {
        self.check_key(key)?;

        if self.is_empty() {
            self.lock_root();
            if self.is_empty() {
                let result = self.create_new_tree(key, rid);
                self.unlock_root();
                return result.map(Some);
            }
            // Lost the race to another writer; insert normally.
            self.unlock_root();
        }

        // Probe the first leaf: an insert below the current global minimum
        // must descend the leftmost path under full crabbing, because the
        // real key routes nowhere yet.
        let first = self.fetch_node(self.meta.first_leaf.load(Ordering::Acquire))?;
        first.frame().latch_read();
        let cmp = if first.num_keys() == 0 {
            CmpOrdering::Greater
        } else {
            self.meta.schema.compare(first.key(0), key)
        };
        first.frame().unlatch_read();
        self.unpin(&first, false);

        if cmp == CmpOrdering::Equal {
            return Ok(None);
        }
        let find_first = cmp == CmpOrdering::Greater;

        let (leaf, root_latched) = self.find_leaf(key, Operation::Insert, txn, find_first)?;
        let result = self.insert_in_leaf(&leaf, key, rid, txn);
        self.release_latch_bag(txn);
        if root_latched {
            self.unlock_root();
        }
        result
    }

    fn insert_in_leaf(
        &self,
        leaf: &NodeHandle<'_>,
        key: &[u8],
        rid: Rid,
        txn: &Transaction,
    ) -> Result<Option<u32>> {
        let mut target = *leaf;

        // A coalesce can leave a leaf exactly at capacity. Duplicates are
        // still answered in place; anything else makes room first and then
        // routes the key into the surviving half.
        if target.is_full() {
            if target.leaf_lookup(key).is_some() {
                return Ok(None);
            }
            let new_leaf = self.split_leaf(&target, txn)?;
            if self.meta.schema.compare(key, new_leaf.key(0)) != CmpOrdering::Less {
                target = new_leaf;
            }
        }

        let before = target.num_keys();
        if target.insert(key, rid)? == before {
            return Ok(None);
        }
        self.mark_dirty(&target);
        self.maintain_parent(&target)?;

        if target.is_full() {
            self.split_leaf(&target, txn)?;
        }
        Ok(Some(target.page_no()))
    }

    /// Splits a full leaf, publishes the separator to its parent, and
    /// maintains the rightmost-leaf pointer. The new right sibling comes
    /// back write-latched, tracked in the latch bag.
    fn split_leaf(&self, leaf: &NodeHandle<'_>, txn: &Transaction) -> Result<NodeHandle<'_>> {
        let new_leaf = self.split(leaf)?;
        self.mark_dirty(leaf);
        self.mark_dirty(&new_leaf);
        txn.append_index_latched_page(self.page_id(new_leaf.page_no()));
        let sep = Bytes::copy_from_slice(new_leaf.key(0));
        self.insert_into_parent(leaf, &sep, &new_leaf, txn)?;
        if new_leaf.next_leaf() == LEAF_HEADER_PAGE {
            self.meta.last_leaf.store(new_leaf.page_no(), Ordering::Release);
        }
        Ok(new_leaf)
    }

    /// Splits a full node, moving its upper half into a fresh right
    /// sibling. The new node comes back write-latched and pinned; the
    /// caller owns both.
    fn split(&self, node: &NodeHandle<'_>) -> Result<NodeHandle<'_>> {
        let new_node = self.new_node()?;
        new_node.frame().latch_write();
        new_node.init(node.is_leaf());
        new_node.set_parent_page_no(node.parent_page_no());

        if node.is_leaf() {
            // Stitch into the leaf ring; the old successor may be the
            // sentinel, which is a regular fetchable page
            new_node.set_prev_leaf(node.page_no());
            new_node.set_next_leaf(node.next_leaf());
            node.set_next_leaf(new_node.page_no());

            let next = self.fetch_node(new_node.next_leaf())?;
            next.frame().latch_write();
            next.set_prev_leaf(new_node.page_no());
            next.frame().unlatch_write();
            self.unpin(&next, true);
        }

        let split_point = self.meta.min_size;
        let move_count = node.num_keys() - split_point;
        new_node.insert_pairs(
            0,
            node.keys_range(split_point, move_count),
            &node.rids_range(split_point, move_count),
        )?;
        node.set_num_keys(split_point);

        if !new_node.is_leaf() {
            for idx in 0..new_node.num_keys() {
                self.maintain_child(&new_node, idx)?;
            }
        }

        Ok(new_node)
    }

    /// Publishes a split to the parent: inserts `(sep, new_node)` right
    /// after the old node's slot, splitting the parent recursively when it
    /// overflows, or growing a new root when the old node was the root.
    fn insert_into_parent(
        &self,
        old_node: &NodeHandle<'_>,
        sep: &[u8],
        new_node: &NodeHandle<'_>,
        txn: &Transaction,
    ) -> Result<()> {
        if old_node.is_root() {
            let new_root = self.new_node()?;
            new_root.init(false);
            old_node.set_parent_page_no(new_root.page_no());
            new_node.set_parent_page_no(new_root.page_no());

            new_root.insert_pair(0, old_node.key(0), Rid::new(old_node.page_no(), 0))?;
            new_root.insert_pair(1, sep, Rid::new(new_node.page_no(), 0))?;

            // Writers are parked on the root latch, which this operation
            // still holds: the root was never safe for it
            self.meta
                .root_page
                .store(new_root.page_no(), Ordering::Release);
            self.unpin(&new_root, true);
            return Ok(());
        }

        let mut parent = self.fetch_node(old_node.parent_page_no())?;

        // A coalesce can leave the parent exactly at capacity; split it
        // before publishing the separator. The split may move old_node
        // under the new right half, so re-resolve the parent afterwards.
        if parent.is_full() {
            let result = (|| {
                let new_parent = self.split(&parent)?;
                self.mark_dirty(&new_parent);
                txn.append_index_latched_page(self.page_id(new_parent.page_no()));
                let parent_sep = Bytes::copy_from_slice(new_parent.key(0));
                self.insert_into_parent(&parent, &parent_sep, &new_parent, txn)
            })();
            self.unpin(&parent, true);
            result?;
            parent = self.fetch_node(old_node.parent_page_no())?;
        }

        let result = (|| {
            let rank = parent.find_child(old_node.page_no()).ok_or_else(|| {
                KilnError::BTreeCorrupted(format!(
                    "page {} missing from its parent {}",
                    old_node.page_no(),
                    parent.page_no()
                ))
            })?;
            parent.insert_pair(rank + 1, sep, Rid::new(new_node.page_no(), 0))?;
            if parent.is_full() {
                let new_parent = self.split(&parent)?;
                self.mark_dirty(&new_parent);
                txn.append_index_latched_page(self.page_id(new_parent.page_no()));
                let parent_sep = Bytes::copy_from_slice(new_parent.key(0));
                self.insert_into_parent(&parent, &parent_sep, &new_parent, txn)?;
            }
            Ok(())
        })();
        self.unpin(&parent, true);
        result
    }

    /// Seeds an empty tree with a single leaf root holding one pair.
    /// Caller holds the root latch.
    fn create_new_tree(&self, key: &[u8], rid: Rid) -> Result<u32> {
        debug_assert!(self.is_empty());
        let root = self.new_node()?;
        root.init(true);

        let sentinel = self.fetch_node(LEAF_HEADER_PAGE)?;
        sentinel.set_prev_leaf(root.page_no());
        sentinel.set_next_leaf(root.page_no());
        root.set_prev_leaf(LEAF_HEADER_PAGE);
        root.set_next_leaf(LEAF_HEADER_PAGE);
        self.unpin(&sentinel, true);

        self.meta.first_leaf.store(root.page_no(), Ordering::Release);
        self.meta.last_leaf.store(root.page_no(), Ordering::Release);

        root.insert_pair(0, key, rid)?;
        self.meta.root_page.store(root.page_no(), Ordering::Release);
        let page_no = root.page_no();
        self.unpin(&root, true);
        Ok(page_no)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Deletes the pair with the given key. Returns false when the key is
    /// not present.
    pub fn delete_entry(&self, key: &[u8], txn: &Transaction) -> Result<bool> {
        self.check_key(key)?;
        if self.is_empty() {
            return Ok(false);
        }

        // Same probe as insert: a delete of the global minimum must keep
        // the full path latched to fix the separator copies on the way up.
        let first = self.fetch_node(self.meta.first_leaf.load(Ordering::Acquire))?;
        first.frame().latch_read();
        let cmp = if first.num_keys() == 0 {
            CmpOrdering::Greater
        } else {
            self.meta.schema.compare(first.key(0), key)
        };
        first.frame().unlatch_read();
        self.unpin(&first, false);

        if cmp == CmpOrdering::Greater {
            // Below the global minimum: cannot exist
            return Ok(false);
        }
        let find_first = cmp == CmpOrdering::Equal;

        let (leaf, root_latched) = self.find_leaf(key, Operation::Delete, txn, find_first)?;
        let result = self.delete_in_leaf(&leaf, key, txn);
        self.release_latch_bag(txn);
        // Pages emptied by a coalesce go away only now, with every latch
        // dropped
        for pid in txn.take_index_deleted_pages() {
            self.pool.delete_page(pid);
        }
        if root_latched {
            self.unlock_root();
        }
        result
    }

    fn delete_in_leaf(&self, leaf: &NodeHandle<'_>, key: &[u8], txn: &Transaction) -> Result<bool> {
        let before = leaf.num_keys();
        if leaf.remove(key) == before {
            return Ok(false);
        }
        self.mark_dirty(leaf);
        self.maintain_parent(leaf)?;
        self.coalesce_or_redistribute(*leaf, txn)?;
        Ok(true)
    }

    /// Rebalances `node` after a removal. Returns true when `node` itself
    /// was emptied and queued for deletion.
    fn coalesce_or_redistribute(&self, node: NodeHandle<'_>, txn: &Transaction) -> Result<bool> {
        if node.is_root() {
            let deleted = self.adjust_root(&node)?;
            if deleted {
                txn.append_index_deleted_page(self.page_id(node.page_no()));
            }
            return Ok(deleted);
        }
        if node.num_keys() >= self.meta.min_size {
            return Ok(false);
        }

        let parent = self.fetch_node(node.parent_page_no())?;
        let result = self.rebalance_with_sibling(node, &parent, txn);
        match result {
            Ok(coalesced) => {
                self.unpin(&parent, coalesced);
                Ok(coalesced)
            }
            Err(e) => {
                self.unpin(&parent, false);
                Err(e)
            }
        }
    }

    fn rebalance_with_sibling(
        &self,
        node: NodeHandle<'_>,
        parent: &NodeHandle<'_>,
        txn: &Transaction,
    ) -> Result<bool> {
        let node_rank = parent.find_child(node.page_no()).ok_or_else(|| {
            KilnError::BTreeCorrupted(format!(
                "page {} missing from its parent {}",
                node.page_no(),
                parent.page_no()
            ))
        })?;
        // Prefer the left sibling
        let sibling_rank = if node_rank > 0 {
            node_rank - 1
        } else {
            node_rank + 1
        };

        let sibling = self.fetch_node(parent.child(sibling_rank))?;
        sibling.frame().latch_write();

        // With an odd order the merged node may land exactly at capacity;
        // the insert path makes room again before touching such a node
        if node.num_keys() + sibling.num_keys() >= 2 * self.meta.min_size {
            let result = self.redistribute(&sibling, &node, parent, node_rank);
            sibling.frame().unlatch_write();
            self.unpin(&sibling, true);
            result?;
            return Ok(false);
        }

        // The sibling survives the merge and must be released uniformly
        // with the rest of the path
        txn.append_index_latched_page(self.page_id(sibling.page_no()));
        self.coalesce(sibling, node, parent, node_rank, txn)?;
        Ok(true)
    }

    /// Moves one pair across the boundary between `node` and its sibling
    /// and refreshes the parent separator.
    ///
    /// `index` is the node's slot in the parent: 0 means the sibling is
    /// the right neighbor (take its first pair), otherwise the sibling is
    /// the left neighbor (take its last pair).
    fn redistribute(
        &self,
        sibling: &NodeHandle<'_>,
        node: &NodeHandle<'_>,
        parent: &NodeHandle<'_>,
        index: usize,
    ) -> Result<()> {
        if index == 0 {
            node.insert_pair(node.num_keys(), sibling.key(0), sibling.rid(0))?;
            sibling.erase_pair(0);
            parent.set_key(1, sibling.key(0));
            self.maintain_child(node, node.num_keys() - 1)?;
        } else {
            let last = sibling.num_keys() - 1;
            node.insert_pair(0, sibling.key(last), sibling.rid(last))?;
            sibling.erase_pair(last);
            parent.set_key(index, node.key(0));
            self.maintain_child(node, 0)?;
        }
        self.mark_dirty(node);
        self.mark_dirty(parent);
        Ok(())
    }

    /// Merges `node` into its sibling and erases the separator. The right
    /// node of the pair always dies; recurses upward when the parent
    /// underflows in turn.
    fn coalesce<'a>(
        &self,
        mut neighbor: NodeHandle<'a>,
        mut node: NodeHandle<'a>,
        parent: &NodeHandle<'_>,
        index: usize,
        txn: &Transaction,
    ) -> Result<bool> {
        // Normalize so the neighbor is the left node and `node` dies
        let mut index = index;
        if index == 0 {
            std::mem::swap(&mut neighbor, &mut node);
            index = 1;
        }

        let prev_size = neighbor.num_keys();
        neighbor.insert_pairs(
            prev_size,
            node.keys_range(0, node.num_keys()),
            &node.rids_range(0, node.num_keys()),
        )?;
        if !neighbor.is_leaf() {
            for idx in prev_size..neighbor.num_keys() {
                self.maintain_child(&neighbor, idx)?;
            }
        }

        if node.is_leaf() {
            self.erase_leaf(&node)?;
            if node.next_leaf() == LEAF_HEADER_PAGE {
                self.meta
                    .last_leaf
                    .store(neighbor.page_no(), Ordering::Release);
            }
        }

        txn.append_index_deleted_page(self.page_id(node.page_no()));
        self.meta.num_pages.fetch_sub(1, Ordering::AcqRel);
        self.mark_dirty(&neighbor);

        parent.erase_pair(index);
        self.mark_dirty(parent);
        if parent.num_keys() < self.meta.min_size {
            return self.coalesce_or_redistribute(*parent, txn);
        }
        Ok(false)
    }

    /// Shrinks the tree at the root after a removal. An internal root left
    /// with a single child hands the root role to that child; an emptied
    /// leaf root leaves the tree empty. Returns whether the old root page
    /// should be deleted.
    fn adjust_root(&self, old_root: &NodeHandle<'_>) -> Result<bool> {
        if !old_root.is_leaf() && old_root.num_keys() == 1 {
            let child_no = old_root.child(0);
            let new_root = self.fetch_node(child_no)?;
            new_root.set_parent_page_no(NO_PAGE);
            self.meta.root_page.store(child_no, Ordering::Release);
            self.meta.num_pages.fetch_sub(1, Ordering::AcqRel);
            self.unpin(&new_root, true);
            return Ok(true);
        }
        if old_root.is_leaf() && old_root.num_keys() == 0 {
            self.erase_leaf(old_root)?;
            self.meta.num_pages.fetch_sub(1, Ordering::AcqRel);
            self.meta.root_page.store(NO_PAGE, Ordering::Release);
            self.meta
                .first_leaf
                .store(LEAF_HEADER_PAGE, Ordering::Release);
            self.meta
                .last_leaf
                .store(LEAF_HEADER_PAGE, Ordering::Release);
            return Ok(true);
        }
        Ok(false)
    }

    /// Unlinks a dying leaf from the leaf ring.
    ///
    /// No latches here: on the coalesce path the left neighbor is already
    /// write-latched by this operation, and the emptied-root path runs
    /// under the root latch with no other leaves left.
    fn erase_leaf(&self, leaf: &NodeHandle<'_>) -> Result<()> {
        debug_assert!(leaf.is_leaf());

        let prev = self.fetch_node(leaf.prev_leaf())?;
        prev.set_next_leaf(leaf.next_leaf());
        self.unpin(&prev, true);

        let next = self.fetch_node(leaf.next_leaf())?;
        next.set_prev_leaf(leaf.prev_leaf());
        self.unpin(&next, true);
        Ok(())
    }

    // =========================================================================
    // Separator maintenance
    // =========================================================================

    /// Walks up from `node` refreshing each ancestor's copy of its
    /// subtree's first key, stopping at the first ancestor whose copy
    /// already matches.
    fn maintain_parent(&self, node: &NodeHandle<'_>) -> Result<()> {
        let mut curr = *node;
        let mut curr_owned = false;
        loop {
            let parent_no = curr.parent_page_no();
            if parent_no == NO_PAGE {
                break;
            }
            let parent = self.fetch_node(parent_no)?;
            let rank = match parent.find_child(curr.page_no()) {
                Some(rank) => rank,
                None => {
                    self.unpin(&parent, false);
                    if curr_owned {
                        self.unpin(&curr, false);
                    }
                    return Err(KilnError::BTreeCorrupted(format!(
                        "page {} missing from its parent {parent_no}",
                        curr.page_no()
                    )));
                }
            };
            if parent.key(rank) == curr.key(0) {
                self.unpin(&parent, false);
                break;
            }
            parent.set_key(rank, curr.key(0));
            self.mark_dirty(&parent);

            if curr_owned {
                self.unpin(&curr, false);
            }
            curr = parent;
            curr_owned = true;
        }
        if curr_owned {
            self.unpin(&curr, false);
        }
        Ok(())
    }

    /// Repoints the parent back-reference of the idx-th child of `node`.
    fn maintain_child(&self, node: &NodeHandle<'_>, idx: usize) -> Result<()> {
        if node.is_leaf() {
            return Ok(());
        }
        let child = self.fetch_node(node.child(idx))?;
        child.set_parent_page_no(node.page_no());
        self.unpin(&child, true);
        Ok(())
    }

    // =========================================================================
    // Scan positions
    // =========================================================================

    /// Position of the first key `>= key`, or `leaf_end` past the last
    /// key.
    pub fn lower_bound(&self, key: &[u8], txn: &Transaction) -> Result<Iid> {
        self.check_key(key)?;
        if self.is_empty() {
            return Ok(Iid::INVALID);
        }
        let (leaf, _) = self.find_leaf(key, Operation::FindLower, txn, false)?;
        let pos = leaf.lower_bound(key);
        let iid = self.boundary_iid(&leaf, pos)?;
        leaf.frame().unlatch_read();
        self.unpin(&leaf, false);
        Ok(iid)
    }

    /// Position of the first key `> key`, or `leaf_end` past the last key.
    pub fn upper_bound(&self, key: &[u8], txn: &Transaction) -> Result<Iid> {
        self.check_key(key)?;
        if self.is_empty() {
            return Ok(Iid::INVALID);
        }
        let (leaf, _) = self.find_leaf(key, Operation::FindUpper, txn, false)?;
        let mut pos = leaf.upper_bound(key);
        // The routed leaf may start strictly above the key; everything in
        // it qualifies then
        if leaf.num_keys() == 0
            || self.meta.schema.compare(leaf.key(0), key) == CmpOrdering::Greater
        {
            pos = 0;
        }
        let iid = self.boundary_iid(&leaf, pos)?;
        leaf.frame().unlatch_read();
        self.unpin(&leaf, false);
        Ok(iid)
    }

    /// Normalizes a one-past-the-last-slot position onto the next leaf
    /// (or the global end position in the last leaf).
    fn boundary_iid(&self, leaf: &NodeHandle<'_>, pos: usize) -> Result<Iid> {
        if pos == leaf.num_keys() {
            if self.meta.last_leaf.load(Ordering::Acquire) == leaf.page_no() {
                self.leaf_end()
            } else {
                Ok(Iid::new(leaf.next_leaf(), 0))
            }
        } else {
            Ok(Iid::new(leaf.page_no(), pos as u32))
        }
    }

    /// One-past-the-end position of the whole index.
    pub fn leaf_end(&self) -> Result<Iid> {
        let last_no = self.meta.last_leaf.load(Ordering::Acquire);
        let node = self.fetch_node(last_no)?;
        let iid = Iid::new(last_no, node.num_keys() as u32);
        self.unpin(&node, false);
        Ok(iid)
    }

    /// First position of the whole index.
    pub fn leaf_begin(&self) -> Result<Iid> {
        Ok(Iid::new(self.meta.first_leaf.load(Ordering::Acquire), 0))
    }

    /// Resolves a scan position to its stored rid.
    pub fn get_rid(&self, iid: Iid) -> Result<Rid> {
        let node = self.fetch_node(iid.page_num)?;
        node.frame().latch_read();
        let result = if (iid.slot_num as usize) < node.num_keys() {
            Ok(node.rid(iid.slot_num as usize))
        } else {
            Err(KilnError::BadSlot {
                pos: iid.slot_num as usize,
                num_keys: node.num_keys(),
            })
        };
        node.frame().unlatch_read();
        self.unpin(&node, false);
        result
    }

    // =========================================================================
    // Integrity checking
    // =========================================================================

    /// Validates the structural invariants of the whole tree: per-node key
    /// ordering and size bounds, separator/subtree-minimum agreement,
    /// parent back-references, and the leaf ring.
    ///
    /// Walks every page without latches; callers must quiesce writers
    /// first. Intended for tests and offline tooling.
    pub fn check_integrity(&self) -> Result<()> {
        if self.is_empty() {
            let sentinel = self.fetch_node(LEAF_HEADER_PAGE)?;
            let trivial = sentinel.prev_leaf() == LEAF_HEADER_PAGE
                && sentinel.next_leaf() == LEAF_HEADER_PAGE;
            self.unpin(&sentinel, false);
            if !trivial {
                return Err(KilnError::BTreeCorrupted(
                    "empty tree with a non-trivial leaf ring".to_string(),
                ));
            }
            return Ok(());
        }

        let root_no = self.meta.root_page.load(Ordering::Acquire);
        let mut leaves = Vec::new();
        self.check_subtree(root_no, NO_PAGE, &mut leaves)?;

        // The leaf ring must visit exactly the leaves found by the
        // descent, in order, closing back through the sentinel.
        if self.meta.first_leaf.load(Ordering::Acquire) != leaves[0]
            || self.meta.last_leaf.load(Ordering::Acquire) != *leaves.last().unwrap_or(&NO_PAGE)
        {
            return Err(KilnError::BTreeCorrupted(
                "leaf boundary metadata does not match the tree".to_string(),
            ));
        }
        let mut prev_no = LEAF_HEADER_PAGE;
        let sentinel = self.fetch_node(LEAF_HEADER_PAGE)?;
        let mut curr_no = sentinel.next_leaf();
        let sentinel_prev = sentinel.prev_leaf();
        self.unpin(&sentinel, false);
        for &expected in &leaves {
            if curr_no != expected {
                return Err(KilnError::BTreeCorrupted(format!(
                    "leaf ring visits {curr_no}, tree order expects {expected}"
                )));
            }
            let leaf = self.fetch_node(curr_no)?;
            let prev_ok = leaf.prev_leaf() == prev_no;
            let next_no = leaf.next_leaf();
            self.unpin(&leaf, false);
            if !prev_ok {
                return Err(KilnError::BTreeCorrupted(format!(
                    "leaf {curr_no} has a broken prev pointer"
                )));
            }
            prev_no = curr_no;
            curr_no = next_no;
        }
        if curr_no != LEAF_HEADER_PAGE || sentinel_prev != prev_no {
            return Err(KilnError::BTreeCorrupted(
                "leaf ring does not close through the sentinel".to_string(),
            ));
        }
        Ok(())
    }

    /// Recursive helper for [`check_integrity`]: verifies one subtree and
    /// returns its (min, max) keys while collecting leaves in key order.
    fn check_subtree(
        &self,
        page_no: u32,
        expected_parent: u32,
        leaves: &mut Vec<u32>,
    ) -> Result<(Bytes, Bytes)> {
        let node = self.fetch_node(page_no)?;
        let result = (|| {
            if node.parent_page_no() != expected_parent {
                return Err(KilnError::BTreeCorrupted(format!(
                    "page {page_no} has parent {}, expected {expected_parent}",
                    node.parent_page_no()
                )));
            }

            let n = node.num_keys();
            let is_root = expected_parent == NO_PAGE;
            // With min_size rounded up, a split's right node holds
            // max_size - min_size keys and a coalesce may fill a node to
            // 2 * min_size - 1; for an even order both collapse to the
            // half-full bounds.
            let floor = if is_root {
                if node.is_leaf() {
                    1
                } else {
                    2
                }
            } else {
                self.meta.max_size - self.meta.min_size
            };
            let ceiling = 2 * self.meta.min_size - 1;
            if n < floor || n > ceiling {
                return Err(KilnError::BTreeCorrupted(format!(
                    "page {page_no} holds {n} keys outside [{floor}, {ceiling}]"
                )));
            }

            for i in 1..n {
                if self.meta.schema.compare(node.key(i - 1), node.key(i)) != CmpOrdering::Less {
                    return Err(KilnError::BTreeCorrupted(format!(
                        "page {page_no} keys not strictly ascending at slot {i}"
                    )));
                }
            }

            if node.is_leaf() {
                leaves.push(page_no);
                return Ok((
                    Bytes::copy_from_slice(node.key(0)),
                    Bytes::copy_from_slice(node.key(n - 1)),
                ));
            }

            let mut subtree_min: Option<Bytes> = None;
            let mut prev_max: Option<Bytes> = None;
            for i in 0..n {
                let (child_min, child_max) = self.check_subtree(node.child(i), page_no, leaves)?;
                if node.key(i) != &child_min[..] {
                    return Err(KilnError::BTreeCorrupted(format!(
                        "page {page_no} separator {i} does not equal its subtree minimum"
                    )));
                }
                if let Some(prev) = &prev_max {
                    if self.meta.schema.compare(prev, &child_min) != CmpOrdering::Less {
                        return Err(KilnError::BTreeCorrupted(format!(
                            "page {page_no} subtrees {i} and {} overlap",
                            i - 1
                        )));
                    }
                }
                if subtree_min.is_none() {
                    subtree_min = Some(child_min);
                }
                prev_max = Some(child_max);
            }
            let min = subtree_min.ok_or_else(|| {
                KilnError::BTreeCorrupted(format!("internal page {page_no} has no children"))
            })?;
            let max = prev_max.ok_or_else(|| {
                KilnError::BTreeCorrupted(format!("internal page {page_no} has no children"))
            })?;
            Ok((min, max))
        })();
        self.unpin(&node, false);
        result
    }

    /// Builds a forward scan over `[lower, upper]` with per-bound
    /// inclusivity. Open bounds scan from the first or to the last key.
    pub fn scan_range(
        &self,
        lower: Option<&[u8]>,
        lower_inclusive: bool,
        upper: Option<&[u8]>,
        upper_inclusive: bool,
        txn: &Transaction,
    ) -> Result<IndexScan<'_>> {
        let begin = match lower {
            Some(key) if lower_inclusive => self.lower_bound(key, txn)?,
            Some(key) => self.upper_bound(key, txn)?,
            None => self.leaf_begin()?,
        };
        let end = match upper {
            Some(key) if upper_inclusive => self.upper_bound(key, txn)?,
            Some(key) => self.lower_bound(key, txn)?,
            None => self.leaf_end()?,
        };
        IndexScan::new(self, begin, end)
    }
}

fn write_page_bytes(disk: &DiskManager, pid: PageId, data: &[u8]) -> Result<()> {
    let buf: &[u8; PAGE_SIZE] = data
        .try_into()
        .map_err(|_| KilnError::PageSizeMismatch {
            expected: PAGE_SIZE,
            actual: data.len(),
        })?;
    disk.write_page(pid, buf)
}
