//! String search index: a B-tree of records ordered by a key field.
//!
//! Keys are ordered case-insensitively first, then case-sensitively, then by
//! address, so equal keys on different records stay distinct. Queries walk
//! the case-folded range and apply exact case and type filters afterwards.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use rustc_hash::FxHasher;

use crate::db::{Nd, ResultKey};
use crate::primitives::store::{PTR_SIZE, ROOT_SLOTS};
use crate::types::{Address, NdError, Result, TypeTag};

use super::btree::{BTree, BTreeComparator, BTreeStats, BTreeStatsSnapshot, BTreeVisitor};
use super::field::FieldString;
use super::schema::{FieldHooks, FieldSlot, StructDef};

const FIND_ALL: &str = "search.find_all";

fn fold(s: &str) -> impl Iterator<Item = char> + '_ {
    s.chars().flat_map(char::to_lowercase)
}

/// Case-insensitive order, with exact order as the tie-breaker.
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    fold(a).cmp(fold(b)).then_with(|| a.cmp(b))
}

/// What to look for in a search index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SearchCriteria {
    pattern: String,
    prefix: bool,
    case_sensitive: bool,
    type_tag: Option<TypeTag>,
}

impl SearchCriteria {
    /// Matches keys equal to `pattern`.
    pub fn exact(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Self::default()
        }
    }

    /// Matches keys starting with `pattern`.
    pub fn prefix(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            prefix: true,
            ..Self::default()
        }
    }

    /// Compares case-sensitively when set.
    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Keeps only node records assignable to the schema registered under `tag`.
    pub fn of_type(mut self, tag: TypeTag) -> Self {
        self.type_tag = Some(tag);
        self
    }

    /// The pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Returns true for prefix queries.
    pub fn is_prefix(&self) -> bool {
        self.prefix
    }

    /// Returns true for case-sensitive queries.
    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Required type tag, if any.
    pub fn type_tag(&self) -> Option<TypeTag> {
        self.type_tag
    }

    fn placement(&self, folded_pattern: &[char], key: &str) -> Ordering {
        if self.prefix {
            fold(key)
                .take(folded_pattern.len())
                .cmp(folded_pattern.iter().copied())
        } else {
            fold(key).cmp(folded_pattern.iter().copied())
        }
    }

    fn accepts(&self, nd: &Nd, record: Address, key: &str) -> Result<bool> {
        if self.case_sensitive {
            let matched = if self.prefix {
                key.starts_with(&self.pattern)
            } else {
                key == self.pattern
            };
            if !matched {
                return Ok(false);
            }
        }
        match self.type_tag {
            Some(tag) => nd.is_instance_of(record, tag),
            None => Ok(true),
        }
    }
}

struct KeyOrder {
    key: FieldString,
}

impl BTreeComparator for KeyOrder {
    fn compare(&self, nd: &Nd, a: Address, b: Address) -> Result<Ordering> {
        let ka = self.key.get(nd, a)?;
        let kb = self.key.get(nd, b)?;
        Ok(compare_keys(&ka, &kb).then(a.cmp(&b)))
    }
}

struct CriteriaVisitor<'c, F> {
    criteria: &'c SearchCriteria,
    folded: Vec<char>,
    key: &'c FieldString,
    on_match: F,
}

impl<F> BTreeVisitor for CriteriaVisitor<'_, F>
where
    F: FnMut(Address) -> Result<bool>,
{
    fn compare(&mut self, nd: &Nd, record: Address) -> Result<Ordering> {
        let key = self.key.get(nd, record)?;
        Ok(self.criteria.placement(&self.folded, &key))
    }

    fn visit(&mut self, nd: &Nd, record: Address) -> Result<bool> {
        let key = self.key.get(nd, record)?;
        if self.criteria.accepts(nd, record, &key)? {
            (self.on_match)(record)
        } else {
            Ok(true)
        }
    }
}

/// A cached `find_all` result with the query it answers.
struct CachedFind {
    root_slot: usize,
    field: u32,
    criteria: SearchCriteria,
    found: Vec<Address>,
}

/// Index over every record whose [`FieldSearchKey`] is set.
///
/// The tree's root pointer lives in a field of a holder record; the holder is
/// found through one of the database root slots so key updates can reach it.
#[derive(Clone)]
pub struct FieldSearchIndex {
    root: FieldSlot,
    root_slot: usize,
    key: FieldString,
    stats: Arc<BTreeStats>,
}

impl FieldSearchIndex {
    /// Makes `holder` the record carrying this index.
    pub fn attach(&self, nd: &Nd, holder: Address) -> Result<()> {
        nd.check_write();
        nd.set_root(self.root_slot, holder)
    }

    /// The record carrying this index, null if none is attached.
    pub fn holder(&self, nd: &Nd) -> Result<Address> {
        nd.root(self.root_slot)
    }

    fn tree(&self, nd: &Nd) -> Result<Option<BTree>> {
        let holder = self.holder(nd)?;
        if holder.is_null() {
            return Ok(None);
        }
        Ok(Some(self.tree_at(holder)?))
    }

    fn tree_at(&self, holder: Address) -> Result<BTree> {
        Ok(BTree::new(
            self.root.at(holder)?,
            Arc::new(KeyOrder {
                key: self.key.clone(),
            }),
            Arc::clone(&self.stats),
        ))
    }

    fn attached_tree(&self, nd: &Nd) -> Result<BTree> {
        self.tree(nd)?
            .ok_or(NdError::Invalid("search index has no holder record"))
    }

    /// Calls `on_match` for each matching record in index order until it returns false.
    pub fn visit<F>(&self, nd: &Nd, criteria: &SearchCriteria, on_match: F) -> Result<()>
    where
        F: FnMut(Address) -> Result<bool>,
    {
        nd.check_read();
        let tree = self.attached_tree(nd)?;
        let mut visitor = CriteriaVisitor {
            criteria,
            folded: fold(&criteria.pattern).collect(),
            key: &self.key,
            on_match,
        };
        tree.accept(nd, &mut visitor)
    }

    /// First matching record in index order.
    pub fn find_first(&self, nd: &Nd, criteria: &SearchCriteria) -> Result<Option<Address>> {
        let mut found = None;
        self.visit(nd, criteria, |record| {
            found = Some(record);
            Ok(false)
        })?;
        Ok(found)
    }

    /// Every matching record in index order. Results are cached until the
    /// index changes or the current lock is released.
    pub fn find_all(&self, nd: &Nd, criteria: &SearchCriteria) -> Result<Vec<Address>> {
        let key = self.cache_key(nd, criteria)?;
        let field = self.root.offset()?;
        if let Some(hit) = nd.cached_result::<CachedFind>(&key) {
            // the key is a hash; a hit only counts for the same query
            if hit.root_slot == self.root_slot && hit.field == field && hit.criteria == *criteria {
                return Ok(hit.found.clone());
            }
        }
        let found = self.find_all_limited(nd, criteria, usize::MAX)?;
        nd.cache_result(
            key,
            Arc::new(CachedFind {
                root_slot: self.root_slot,
                field,
                criteria: criteria.clone(),
                found: found.clone(),
            }),
        );
        Ok(found)
    }

    /// At most `limit` matching records in index order.
    pub fn find_all_limited(
        &self,
        nd: &Nd,
        criteria: &SearchCriteria,
        limit: usize,
    ) -> Result<Vec<Address>> {
        let mut found = Vec::new();
        if limit == 0 {
            return Ok(found);
        }
        self.visit(nd, criteria, |record| {
            found.push(record);
            Ok(found.len() < limit)
        })?;
        Ok(found)
    }

    /// Highest-ranked matching record. Ties keep the earliest in index order.
    pub fn find_best<R>(
        &self,
        nd: &Nd,
        criteria: &SearchCriteria,
        mut rank: R,
    ) -> Result<Option<Address>>
    where
        R: FnMut(&Nd, Address) -> Result<i64>,
    {
        let mut best: Option<(i64, Address)> = None;
        self.visit(nd, criteria, |record| {
            let score = rank(nd, record)?;
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, record));
            }
            Ok(true)
        })?;
        Ok(best.map(|(_, record)| record))
    }

    /// Runs a custom visitor over the whole tree.
    pub fn accept(&self, nd: &Nd, visitor: &mut dyn BTreeVisitor) -> Result<()> {
        nd.check_read();
        self.attached_tree(nd)?.accept(nd, visitor)
    }

    /// Number of indexed records.
    pub fn size(&self, nd: &Nd) -> Result<usize> {
        nd.check_read();
        match self.tree(nd)? {
            Some(tree) => Ok(tree.addresses(nd)?.len()),
            None => Ok(0),
        }
    }

    /// Tree maintenance counters for this index.
    pub fn stats(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    fn cache_key(&self, nd: &Nd, criteria: &SearchCriteria) -> Result<ResultKey> {
        let mut hasher = FxHasher::default();
        self.root_slot.hash(&mut hasher);
        self.root.offset()?.hash(&mut hasher);
        criteria.hash(&mut hasher);
        Ok(ResultKey::new(FIND_ALL, self.holder(nd)?, hasher.finish()))
    }
}

impl FieldHooks for FieldSearchIndex {
    fn destruct(&self, nd: &Nd, record: Address) -> Result<()> {
        self.tree_at(record)?.destruct(nd)?;
        if nd.root(self.root_slot)? == record {
            nd.set_root(self.root_slot, Address::NULL)?;
        }
        nd.clear_result_cache();
        Ok(())
    }
}

/// String field whose records are kept in a paired [`FieldSearchIndex`].
#[derive(Clone)]
pub struct FieldSearchKey {
    string: FieldString,
    index: Arc<OnceLock<FieldSearchIndex>>,
}

impl FieldSearchKey {
    /// Bytes the field occupies.
    pub const RECORD_SIZE: u32 = PTR_SIZE;

    /// Reads the key; unset reads as empty.
    pub fn get(&self, nd: &Nd, record: Address) -> Result<String> {
        self.string.get(nd, record)
    }

    /// Sets the key and repositions the record in the index. An empty key
    /// removes the record from the index.
    pub fn put(&self, nd: &Nd, record: Address, value: &str) -> Result<()> {
        nd.check_write();
        let current = self.string.get(nd, record)?;
        if current == value {
            return Ok(());
        }
        let index = self
            .index
            .get()
            .ok_or_else(|| NdError::definition("search key used before it was paired"))?;
        let tree = index.attached_tree(nd)?;
        if !current.is_empty() {
            tree.delete(nd, record)?;
        }
        self.string.put(nd, record, value)?;
        if !value.is_empty() {
            tree.insert(nd, record)?;
        }
        nd.clear_result_cache();
        Ok(())
    }
}

impl FieldHooks for FieldSearchKey {
    fn destruct(&self, nd: &Nd, record: Address) -> Result<()> {
        if let Some(index) = self.index.get() {
            if !self.string.block(nd, record)?.is_null() {
                if let Some(tree) = index.tree(nd)? {
                    tree.delete(nd, record)?;
                    nd.clear_result_cache();
                }
            }
        }
        self.string.destruct(nd, record)
    }
}

impl StructDef {
    /// Appends an indexed string key. Pair it with [`StructDef::add_search_index`].
    pub fn add_search_key(&self) -> Result<FieldSearchKey> {
        let field = FieldSearchKey {
            string: FieldString::new(self.reserve(FieldSearchKey::RECORD_SIZE)?),
            index: Arc::new(OnceLock::new()),
        };
        self.register_hooks(Arc::new(field.clone()))?;
        Ok(field)
    }

    /// Appends the index over `key`; the holder record is published in database root `root_slot`.
    pub fn add_search_index(
        &self,
        key: &FieldSearchKey,
        root_slot: usize,
    ) -> Result<FieldSearchIndex> {
        if root_slot >= ROOT_SLOTS {
            return Err(NdError::definition(format!(
                "root slot {root_slot} out of range (0..{ROOT_SLOTS})"
            )));
        }
        if key.index.get().is_some() {
            return Err(NdError::definition("search key is already indexed"));
        }
        let index = FieldSearchIndex {
            root: self.reserve(PTR_SIZE)?,
            root_slot,
            key: key.string.clone(),
            stats: Arc::new(BTreeStats::default()),
        };
        key.index
            .set(index.clone())
            .map_err(|_| NdError::definition("search key is already indexed"))?;
        self.register_hooks(Arc::new(index.clone()))?;
        Ok(index)
    }
}
