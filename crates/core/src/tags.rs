//! Tag algebra: canonical tag sets, weighted tag sets and tag rules.
//!
//! A tag is an opaque 64-bit id interned from a case-folded, trimmed,
//! non-empty string; 0 is reserved for invalid. A tag set is canonical
//! when strictly ascending with no duplicates, and every public
//! operation here both requires and preserves that form.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

pub type TagId = u64;

/// Maps tag names to interned ids and back. Implemented by the DB-backed
/// interner and by [`MemTagSource`] for tests.
#[async_trait]
pub trait TagSource: Send + Sync {
    async fn get(&self, name: &str) -> Result<TagId>;
    async fn name(&self, id: TagId) -> Result<String>;
}

// --- tag sets ---

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(Vec<TagId>);

impl TagSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Canonicalizes: sorts, removes duplicates and the reserved 0 id.
    pub fn fix(mut self) -> Self {
        self.0.sort_unstable();
        self.0.dedup();
        self.0.retain(|&t| t != 0);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[TagId] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TagId> {
        self.0.iter()
    }

    pub fn has(&self, want: TagId) -> bool {
        want != 0 && self.0.binary_search(&want).is_ok()
    }

    /// True if the two sets share at least one tag.
    pub fn contains(&self, other: &TagSet) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let (mut l, mut r) = (0, 0);
        while l < self.0.len() && r < other.0.len() {
            match self.0[l].cmp(&other.0[r]) {
                std::cmp::Ordering::Less => l += 1,
                std::cmp::Ordering::Greater => r += 1,
                std::cmp::Ordering::Equal => return true,
            }
        }
        false
    }

    /// True if every member of `self` is in `other`.
    pub fn subset_of(&self, other: &TagSet) -> bool {
        self.0.iter().all(|t| other.has(*t))
    }

    /// Adds a single tag, keeping the set canonical. 0 is ignored.
    pub fn add(mut self, tag: TagId) -> Self {
        if tag == 0 {
            return self;
        }
        if let Err(pos) = self.0.binary_search(&tag) {
            self.0.insert(pos, tag);
        }
        self
    }

    /// Union of two canonical sets.
    pub fn combine(self, other: &TagSet) -> Self {
        if other.is_empty() {
            return self;
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut out = Vec::with_capacity(self.0.len() + other.0.len());
        out.extend_from_slice(&self.0);
        out.extend_from_slice(&other.0);
        TagSet(out).fix()
    }
}

impl From<Vec<TagId>> for TagSet {
    fn from(v: Vec<TagId>) -> Self {
        TagSet(v).fix()
    }
}

impl FromIterator<TagId> for TagSet {
    fn from_iter<I: IntoIterator<Item = TagId>>(iter: I) -> Self {
        TagSet(iter.into_iter().collect()).fix()
    }
}


// --- weighted tag sets ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagWeight {
    pub tag: TagId,
    pub weight: i64,
}

/// A weighted tag set: canonical by tag id; duplicates sum their weights
/// on normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagWeights(Vec<TagWeight>);

impl TagWeights {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn fix(mut self) -> Self {
        self.0.sort_by_key(|tw| tw.tag);
        let mut out: Vec<TagWeight> = Vec::with_capacity(self.0.len());
        for tw in self.0 {
            match out.last_mut() {
                Some(last) if last.tag == tw.tag => last.weight += tw.weight,
                _ => out.push(tw),
            }
        }
        TagWeights(out)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TagWeight> {
        self.0.iter()
    }

    /// Total weight of the given tags under this weight map.
    pub fn weight_of(&self, tags: &TagSet) -> i64 {
        if self.is_empty() || tags.is_empty() {
            return 0;
        }
        let (mut w, mut t) = (0, 0);
        let mut total = 0i64;
        let set = tags.as_slice();
        while w < self.0.len() && t < set.len() {
            match self.0[w].tag.cmp(&set[t]) {
                std::cmp::Ordering::Less => w += 1,
                std::cmp::Ordering::Greater => t += 1,
                std::cmp::Ordering::Equal => {
                    total += self.0[w].weight;
                    w += 1;
                    t += 1;
                }
            }
        }
        total
    }

    /// Union of two canonical weight maps; shared tags sum weights.
    pub fn combine(self, other: &TagWeights) -> Self {
        if other.is_empty() {
            return self;
        }
        let mut all = self.0;
        all.extend_from_slice(&other.0);
        TagWeights(all).fix()
    }
}

impl From<Vec<(TagId, i64)>> for TagWeights {
    fn from(v: Vec<(TagId, i64)>) -> Self {
        TagWeights(v.into_iter().map(|(tag, weight)| TagWeight { tag, weight }).collect()).fix()
    }
}


// --- tag rules ---

/// A named rule that conditionally emits its `give` tag.
///
/// Fires iff (any empty or at least one member present) and (all empty or
/// fully present) and (none empty or fully absent). A rule must carry at
/// least one predicate tag; the same tag may not appear in two lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRule {
    give: TagId,
    any: TagSet,
    all: TagSet,
    none: TagSet,
}

impl TagRule {
    pub fn new(give: TagId, any: TagSet, all: TagSet, none: TagSet) -> Result<Self> {
        let any = any.fix();
        let all = all.fix();
        let none = none.fix();
        if any.is_empty() && all.is_empty() && none.is_empty() {
            return Err(Error::Config(format!("no tags in tag rule {give}")));
        }
        if any.contains(&all) || any.contains(&none) || all.contains(&none) {
            return Err(Error::Config(format!(
                "duplicate tag across predicates in tag rule {give}"
            )));
        }
        Ok(TagRule { give, any, all, none })
    }

    pub fn give(&self) -> TagId {
        self.give
    }

    /// Whether the rule fires against a canonical tag set.
    pub fn fire(&self, tags: &TagSet) -> bool {
        if !self.any.is_empty() && !tags.contains(&self.any) {
            return false;
        }
        if !self.all.is_empty() && !self.all.subset_of(tags) {
            return false;
        }
        if !self.none.is_empty() && tags.contains(&self.none) {
            return false;
        }
        true
    }
}

/// Ordered rules; later rules observe tags added by earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagRules(Vec<TagRule>);

impl TagRules {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, rule: TagRule) {
        self.0.push(rule);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TagRule> {
        self.0.iter()
    }

    /// Appends the other rule list after this one.
    pub fn combine(mut self, other: &TagRules) -> Self {
        self.0.extend(other.0.iter().cloned());
        self
    }

    pub fn apply(&self, mut tags: TagSet) -> TagSet {
        for rule in &self.0 {
            if rule.fire(&tags) {
                tags = tags.add(rule.give);
            }
        }
        tags
    }
}


// --- configuration shapes ---

/// Raw tag rule as it appears in configuration documents.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfTagRule {
    pub tag: String,
    #[serde(default)]
    pub any: Vec<String>,
    #[serde(default)]
    pub all: Vec<String>,
    #[serde(default)]
    pub none: Vec<String>,
}

pub type ConfTagWeights = BTreeMap<String, i64>;

pub async fn strings_to_tags(names: &[String], tm: &dyn TagSource) -> Result<TagSet> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        out.push(tm.get(name).await?);
    }
    Ok(TagSet(out).fix())
}

pub async fn rule_from_conf(conf: &ConfTagRule, tm: &dyn TagSource) -> Result<TagRule> {
    let give = tm.get(&conf.tag).await?;
    let any = strings_to_tags(&conf.any, tm).await?;
    let all = strings_to_tags(&conf.all, tm).await?;
    let none = strings_to_tags(&conf.none, tm).await?;
    TagRule::new(give, any, all, none)
}

pub async fn rules_from_conf(conf: &[ConfTagRule], tm: &dyn TagSource) -> Result<TagRules> {
    let mut rules = TagRules::new();
    for ctr in conf {
        rules.push(rule_from_conf(ctr, tm).await?);
    }
    Ok(rules)
}

pub async fn weights_from_conf(conf: &ConfTagWeights, tm: &dyn TagSource) -> Result<TagWeights> {
    let mut out = Vec::with_capacity(conf.len());
    for (name, weight) in conf {
        out.push(TagWeight {
            tag: tm.get(name).await?,
            weight: *weight,
        });
    }
    Ok(TagWeights(out).fix())
}

/// A match-only rule built from optional any/all/none lists, as profiles
/// carry them. All three empty means "match everything" (`None`).
pub async fn match_rule_from_conf(
    any: &[String],
    all: &[String],
    none: &[String],
    tm: &dyn TagSource,
) -> Result<Option<TagRule>> {
    if any.is_empty() && all.is_empty() && none.is_empty() {
        return Ok(None);
    }
    let any = strings_to_tags(any, tm).await?;
    let all = strings_to_tags(all, tm).await?;
    let none = strings_to_tags(none, tm).await?;
    // The give tag is never emitted for a match rule, so 0 stands in.
    Ok(Some(TagRule { give: 0, any, all, none }))
}


// --- tag file loading ---

const MAX_TAG_LEN: usize = 100;

/// Parses tag-file content: one tag per line, trimmed; empty and
/// over-long lines are dropped.
pub fn tag_lines(content: &str) -> Vec<&str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.len() <= MAX_TAG_LEN)
        .collect()
}

/// Loads a sidecar or per-directory tag file into a canonical set,
/// dropping tags the interner maps to 0.
pub async fn load_tag_file(path: &std::path::Path, tm: &dyn TagSource) -> Result<TagSet> {
    let content = std::fs::read_to_string(path)?;
    let mut tags = TagSet::new();
    for raw in tag_lines(&content) {
        let id = tm.get(raw).await?;
        tags = tags.add(id);
    }
    Ok(tags.fix())
}


// --- in-memory interner ---

/// In-memory interner: monotonic ids per distinct folded name. Backs the
/// test suite and any run that does not need persistent tag ids.
#[derive(Default)]
pub struct MemTagSource {
    state: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    ids: HashMap<String, TagId>,
    names: Vec<String>,
}

impl MemTagSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TagSource for MemTagSource {
    async fn get(&self, name: &str) -> Result<TagId> {
        let folded = name.trim().to_lowercase();
        if folded.is_empty() {
            return Err(Error::Config("empty tag".into()));
        }
        let mut state = self.state.lock().expect("mem tag source poisoned");
        if let Some(id) = state.ids.get(&folded) {
            return Ok(*id);
        }
        state.names.push(folded.clone());
        let id = state.names.len() as TagId;
        state.ids.insert(folded, id);
        Ok(id)
    }

    async fn name(&self, id: TagId) -> Result<String> {
        if id == 0 {
            return Err(Error::Config("empty id".into()));
        }
        let state = self.state.lock().expect("mem tag source poisoned");
        state
            .names
            .get(id as usize - 1)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown tag id {id}")))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ts(v: &[TagId]) -> TagSet {
        TagSet(v.to_vec()).fix()
    }

    #[test]
    fn contains_matches_intersection() {
        let left = ts(&[4, 2, 10, 21, 24, 3]);
        let a = ts(&[5, 9, 1, 6]);
        let b = ts(&[31, 7, 18, 33, 9, 5]);
        let c = ts(&[30, 22, 18, 2]);

        assert!(!left.contains(&a));
        assert!(!a.contains(&left));
        assert!(!left.contains(&b));
        assert!(!b.contains(&left));
        assert!(left.contains(&c));
        assert!(c.contains(&left));
    }

    #[test]
    fn has_finds_members() {
        let tags = ts(&[4, 2, 8, 20, 30, 3]);
        assert!(!tags.has(5));
        assert!(tags.has(8));
        assert!(!tags.has(22));
        assert!(tags.has(30));
        assert!(!tags.has(0));
    }

    #[test]
    fn equal_is_permutation_equality() {
        let left = ts(&[1, 2, 3, 4]);
        assert_eq!(left, ts(&[3, 2, 4, 1]));
        assert_ne!(left, ts(&[1, 5, 4, 3]));
        assert_ne!(left, ts(&[1, 4, 3, 3]));
        assert_eq!(ts(&[]), ts(&[]));
    }

    #[test]
    fn add_keeps_canonical() {
        let tags = ts(&[5, 9]).add(7).add(7).add(0).add(1);
        assert_eq!(tags.as_slice(), &[1, 5, 7, 9]);
    }

    #[test]
    fn combine_unions() {
        let a = ts(&[1, 3, 5]);
        let b = ts(&[2, 3, 6]);
        assert_eq!(a.clone().combine(&b).as_slice(), &[1, 2, 3, 5, 6]);
        assert_eq!(a.clone().combine(&ts(&[])), a);
        assert_eq!(ts(&[]).combine(&b), b);
    }

    #[test]
    fn weights_fix_sums_duplicates() {
        let tw = TagWeights::from(vec![(3, 4), (1, 2), (3, 2), (2, -1)]);
        let parts: Vec<(TagId, i64)> = tw.iter().map(|w| (w.tag, w.weight)).collect();
        assert_eq!(parts, vec![(1, 2), (2, -1), (3, 6)]);
    }

    #[test]
    fn weight_of_sums_present_tags() {
        let tw = TagWeights::from(vec![(1, 5), (3, -2), (9, 10)]);
        assert_eq!(tw.weight_of(&ts(&[1, 3])), 3);
        assert_eq!(tw.weight_of(&ts(&[9])), 10);
        assert_eq!(tw.weight_of(&ts(&[2, 4])), 0);
        assert_eq!(tw.weight_of(&ts(&[])), 0);
    }

    #[test]
    fn rule_needs_a_predicate() {
        assert!(TagRule::new(1, ts(&[]), ts(&[]), ts(&[])).is_err());
        assert!(TagRule::new(1, ts(&[2]), ts(&[2]), ts(&[])).is_err());
    }

    #[test]
    fn rule_any_fires_on_intersection() {
        let rule = TagRule::new(9, ts(&[1, 2]), ts(&[]), ts(&[])).unwrap();
        assert!(rule.fire(&ts(&[2, 5])));
        assert!(!rule.fire(&ts(&[5, 6])));
        assert!(!rule.fire(&ts(&[])));
    }

    #[test]
    fn rule_all_requires_full_subset() {
        let rule = TagRule::new(9, ts(&[]), ts(&[1, 2, 8]), ts(&[])).unwrap();
        assert!(rule.fire(&ts(&[1, 2, 8, 9])));
        assert!(!rule.fire(&ts(&[1, 2])));
        // An input exhausted before the last all-tag must not fire.
        assert!(!rule.fire(&ts(&[1, 2, 3])));
        assert!(!rule.fire(&ts(&[])));
    }

    #[test]
    fn rule_none_fires_on_disjoint() {
        let rule = TagRule::new(9, ts(&[]), ts(&[]), ts(&[4, 5])).unwrap();
        assert!(rule.fire(&ts(&[1, 2])));
        assert!(rule.fire(&ts(&[])));
        assert!(!rule.fire(&ts(&[5])));
    }

    #[test]
    fn rule_predicates_and_together() {
        let rule = TagRule::new(9, ts(&[1, 2]), ts(&[3]), ts(&[4])).unwrap();
        assert!(rule.fire(&ts(&[1, 3])));
        assert!(!rule.fire(&ts(&[1])));
        assert!(!rule.fire(&ts(&[3])));
        assert!(!rule.fire(&ts(&[1, 3, 4])));
    }

    #[test]
    fn rules_apply_in_order() {
        // First rule gives 10, second depends on it.
        let mut rules = TagRules::new();
        rules.push(TagRule::new(10, ts(&[1]), ts(&[]), ts(&[])).unwrap());
        rules.push(TagRule::new(11, ts(&[]), ts(&[10]), ts(&[])).unwrap());
        let out = rules.apply(ts(&[1]));
        assert_eq!(out.as_slice(), &[1, 10, 11]);

        // Reversed order: the dependent rule never sees its input.
        let mut rev = TagRules::new();
        rev.push(TagRule::new(11, ts(&[]), ts(&[10]), ts(&[])).unwrap());
        rev.push(TagRule::new(10, ts(&[1]), ts(&[]), ts(&[])).unwrap());
        let out = rev.apply(ts(&[1]));
        assert_eq!(out.as_slice(), &[1, 10]);
    }

    #[test]
    fn tag_lines_filters() {
        let content = "sun\n  mountain \n\n \t\n";
        assert_eq!(tag_lines(content), vec!["sun", "mountain"]);
        let long = format!("{}\nok", "x".repeat(101));
        assert_eq!(tag_lines(&long), vec!["ok"]);
        // No trailing newline still yields the last tag.
        assert_eq!(tag_lines("a\nb"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn mem_source_interns_and_reverses() {
        let tm = MemTagSource::new();
        let a = tm.get("  Sun ").await.unwrap();
        let b = tm.get("sun").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(tm.name(a).await.unwrap(), "sun");
        assert!(tm.get("  ").await.is_err());
        assert!(tm.name(0).await.is_err());
    }

    proptest! {
        #[test]
        fn fix_is_sorted_and_unique(v in proptest::collection::vec(0u64..500, 0..40)) {
            let fixed = TagSet(v).fix();
            let s = fixed.as_slice();
            prop_assert!(s.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(!s.contains(&0));
        }

        #[test]
        fn combine_commutes(
            a in proptest::collection::vec(1u64..200, 0..30),
            b in proptest::collection::vec(1u64..200, 0..30),
        ) {
            let (a, b) = (TagSet(a).fix(), TagSet(b).fix());
            prop_assert_eq!(a.clone().combine(&b), b.clone().combine(&a));
        }

        #[test]
        fn contains_iff_shared_member(
            a in proptest::collection::vec(1u64..60, 0..20),
            b in proptest::collection::vec(1u64..60, 0..20),
        ) {
            let (a, b) = (TagSet(a).fix(), TagSet(b).fix());
            let shared = a.iter().any(|t| b.has(*t));
            prop_assert_eq!(a.contains(&b), shared);
        }

        #[test]
        fn fix_equality_is_multiset_identity(
            v in proptest::collection::vec(1u64..100, 0..30),
            seed in 0u64..1000,
        ) {
            // Any permutation of the same values fixes to the same set.
            let mut shuffled = v.clone();
            let mut state = seed;
            for i in (1..shuffled.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                let j = (state % (i as u64 + 1)) as usize;
                shuffled.swap(i, j);
            }
            prop_assert_eq!(TagSet(v).fix(), TagSet(shuffled).fix());
        }
    }
}
