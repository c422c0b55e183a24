// # Range cursors
//
// Cursors fetch entries in batches. Each batch re-descends from the root
// using the last-seen key, so a cursor never holds a path of pins across
// calls; while filling a batch at most one leaf is read-pinned at a time
// (internal buckets are copied and released before the child loads).
// Mutations between batches are therefore visible, never blocking.

use std::collections::VecDeque;
use std::ops::Bound;

use crate::common::PageIndex;
use crate::error::Result;
use crate::page::PageView;

use super::bucket;
use super::tree::{preprocess_key, PrefixBTree, ROOT_PAGE};

const DEFAULT_PREFETCH: usize = 64;

/// Batched, re-descending cursor over a key range.
pub struct TreeCursor<'t> {
    tree: &'t PrefixBTree,
    ascending: bool,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    /// Last key handed out; the next batch resumes strictly past it.
    resume: Option<Vec<u8>>,
    batch: VecDeque<(Vec<u8>, Vec<u8>)>,
    done: bool,
    prefetch: usize,
}

impl<'t> TreeCursor<'t> {
    pub(super) fn new(
        tree: &'t PrefixBTree,
        ascending: bool,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> Self {
        Self {
            tree,
            ascending,
            lower,
            upper,
            resume: None,
            batch: VecDeque::new(),
            done: false,
            prefetch: DEFAULT_PREFETCH,
        }
    }

    /// Hint for how many entries each re-descent gathers.
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn next_entry(&mut self) -> Result<Option<(String, Vec<u8>)>> {
        if self.batch.is_empty() && !self.done {
            self.fill_batch()?;
        }
        match self.batch.pop_front() {
            None => Ok(None),
            Some((key, value)) => {
                self.resume = Some(key.clone());
                Ok(Some((String::from_utf8_lossy(&key).into_owned(), value)))
            }
        }
    }

    /// Drain the remaining entries. Test and bulk-read convenience.
    pub fn collect_all(mut self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next_entry()? {
            out.push(entry);
        }
        Ok(out)
    }

    fn fill_batch(&mut self) -> Result<()> {
        let _guard = self.tree.read_guard();
        let engine = self.tree.engine().clone();
        let _lock = engine.locks().shared(self.tree.file_id());

        let (entries, exhausted) = if self.ascending {
            let lower = match &self.resume {
                Some(key) => Bound::Excluded(key.clone()),
                None => self.lower.clone(),
            };
            walk_ascending(self.tree, &lower, &self.upper, self.prefetch)?
        } else {
            let upper = match &self.resume {
                Some(key) => Bound::Excluded(key.clone()),
                None => self.upper.clone(),
            };
            walk_descending(self.tree, &self.lower, &upper, self.prefetch)?
        };
        self.done = exhausted;
        self.batch = entries.into();
        Ok(())
    }
}

fn below_lower(key: &[u8], lower: &Bound<Vec<u8>>) -> bool {
    match lower {
        Bound::Unbounded => false,
        Bound::Included(b) => key < b.as_slice(),
        Bound::Excluded(b) => key <= b.as_slice(),
    }
}

fn above_upper(key: &[u8], upper: &Bound<Vec<u8>>) -> bool {
    match upper {
        Bound::Unbounded => false,
        Bound::Included(b) => key > b.as_slice(),
        Bound::Excluded(b) => key >= b.as_slice(),
    }
}

/// One traversal level held in memory: the ordered child list and the next
/// slot to visit. The source page's pin is released before descending.
struct WalkLevel {
    children: Vec<PageIndex>,
    next_slot: usize,
}

fn children_of(view: &impl PageView) -> Vec<PageIndex> {
    let count = bucket::entry_count(view);
    (0..=count).map(|s| bucket::child_at_slot(view, s)).collect()
}

fn walk_ascending(
    tree: &PrefixBTree,
    lower: &Bound<Vec<u8>>,
    upper: &Bound<Vec<u8>>,
    limit: usize,
) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, bool)> {
    let engine = tree.engine().clone();
    let cache = engine.cache();
    let mut out = Vec::new();
    let mut stack: Vec<WalkLevel> = Vec::new();
    let mut current = ROOT_PAGE;

    'descend: loop {
        let page = cache.load_for_read(tree.file_id(), current)?;
        if !bucket::is_leaf(&page) {
            let children = children_of(&page);
            let slot = match lower {
                Bound::Unbounded => 0,
                Bound::Included(key) | Bound::Excluded(key) => bucket::child_slot_for(&page, key),
            };
            drop(page);
            stack.push(WalkLevel {
                children,
                next_slot: slot + 1,
            });
            current = stack.last().expect("just pushed").children[slot];
            continue 'descend;
        }

        // Leaf reached; from here alternate collect / advance.
        let mut leaf = page;
        loop {
            let count = bucket::entry_count(&leaf);
            for i in 0..count {
                let key = bucket::entry_key(&leaf, i);
                if below_lower(&key, lower) {
                    continue;
                }
                if above_upper(&key, upper) {
                    return Ok((out, true));
                }
                let value = tree.materialize_value(bucket::leaf_value(&leaf, i))?;
                out.push((key, value));
                if out.len() >= limit {
                    return Ok((out, false));
                }
            }
            drop(leaf);

            // Pop to the nearest ancestor with an unvisited right subtree
            // and descend leftmost below it.
            let mut next = None;
            while let Some(level) = stack.last_mut() {
                if level.next_slot < level.children.len() {
                    next = Some(level.children[level.next_slot]);
                    level.next_slot += 1;
                    break;
                }
                stack.pop();
            }
            let Some(mut child) = next else {
                return Ok((out, true));
            };
            loop {
                let page = cache.load_for_read(tree.file_id(), child)?;
                if bucket::is_leaf(&page) {
                    leaf = page;
                    break;
                }
                let children = children_of(&page);
                drop(page);
                child = children[0];
                stack.push(WalkLevel {
                    children,
                    next_slot: 1,
                });
            }
        }
    }
}

fn walk_descending(
    tree: &PrefixBTree,
    lower: &Bound<Vec<u8>>,
    upper: &Bound<Vec<u8>>,
    limit: usize,
) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, bool)> {
    let engine = tree.engine().clone();
    let cache = engine.cache();
    let mut out = Vec::new();
    let mut stack: Vec<WalkLevel> = Vec::new();
    let mut current = ROOT_PAGE;

    'descend: loop {
        let page = cache.load_for_read(tree.file_id(), current)?;
        if !bucket::is_leaf(&page) {
            let children = children_of(&page);
            let slot = match upper {
                Bound::Unbounded => children.len() - 1,
                Bound::Included(key) | Bound::Excluded(key) => bucket::child_slot_for(&page, key),
            };
            drop(page);
            stack.push(WalkLevel {
                children,
                // For the downward walk `next_slot` is the slot to visit
                // after this subtree, counting down (one past = none).
                next_slot: slot,
            });
            current = stack.last().expect("just pushed").children[slot];
            continue 'descend;
        }

        let mut leaf = page;
        loop {
            let count = bucket::entry_count(&leaf);
            for i in (0..count).rev() {
                let key = bucket::entry_key(&leaf, i);
                if above_upper(&key, upper) {
                    continue;
                }
                if below_lower(&key, lower) {
                    return Ok((out, true));
                }
                let value = tree.materialize_value(bucket::leaf_value(&leaf, i))?;
                out.push((key, value));
                if out.len() >= limit {
                    return Ok((out, false));
                }
            }
            drop(leaf);

            let mut next = None;
            while let Some(level) = stack.last_mut() {
                if level.next_slot > 0 {
                    level.next_slot -= 1;
                    next = Some(level.children[level.next_slot]);
                    break;
                }
                stack.pop();
            }
            let Some(mut child) = next else {
                return Ok((out, true));
            };
            loop {
                let page = cache.load_for_read(tree.file_id(), child)?;
                if bucket::is_leaf(&page) {
                    leaf = page;
                    break;
                }
                let children = children_of(&page);
                drop(page);
                let last = children.len() - 1;
                child = children[last];
                stack.push(WalkLevel {
                    children,
                    next_slot: last,
                });
            }
        }
    }
}

impl PrefixBTree {
    /// Entries with `from <= key <= to` (bounds adjustable), in either
    /// direction.
    pub fn iterate_entries_between(
        &self,
        from: &str,
        from_inclusive: bool,
        to: &str,
        to_inclusive: bool,
        ascending: bool,
    ) -> TreeCursor<'_> {
        let lower = if from_inclusive {
            Bound::Included(preprocess_key(from))
        } else {
            Bound::Excluded(preprocess_key(from))
        };
        let upper = if to_inclusive {
            Bound::Included(preprocess_key(to))
        } else {
            Bound::Excluded(preprocess_key(to))
        };
        TreeCursor::new(self, ascending, lower, upper)
    }

    /// Entries below `to`.
    pub fn iterate_entries_minor(
        &self,
        to: &str,
        inclusive: bool,
        ascending: bool,
    ) -> TreeCursor<'_> {
        let upper = if inclusive {
            Bound::Included(preprocess_key(to))
        } else {
            Bound::Excluded(preprocess_key(to))
        };
        TreeCursor::new(self, ascending, Bound::Unbounded, upper)
    }

    /// Entries above `from`.
    pub fn iterate_entries_major(
        &self,
        from: &str,
        inclusive: bool,
        ascending: bool,
    ) -> TreeCursor<'_> {
        let lower = if inclusive {
            Bound::Included(preprocess_key(from))
        } else {
            Bound::Excluded(preprocess_key(from))
        };
        TreeCursor::new(self, ascending, lower, Bound::Unbounded)
    }

    /// Every entry, in key order.
    pub fn cursor(&self, ascending: bool) -> TreeCursor<'_> {
        TreeCursor::new(self, ascending, Bound::Unbounded, Bound::Unbounded)
    }

    pub fn first_key(&self) -> Result<Option<String>> {
        let mut cursor = self.cursor(true).with_prefetch(1);
        Ok(cursor.next_entry()?.map(|(key, _)| key))
    }

    pub fn last_key(&self) -> Result<Option<String>> {
        let mut cursor = self.cursor(false).with_prefetch(1);
        Ok(cursor.next_entry()?.map(|(key, _)| key))
    }
}
