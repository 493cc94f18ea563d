#![allow(missing_docs)]

use std::cmp::Ordering;

use pdom::{
    storage::{
        btree::BTreeVisitor, compare_keys, FieldInt, FieldSearchIndex, FieldSearchKey, StructDef,
    },
    types::{Address, NdError, Result, TypeTag},
    CancelToken, Nd, NdOptions, SearchCriteria, TypeRegistry,
};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const CATALOG: TypeTag = TypeTag(1);
const ITEM: TypeTag = TypeTag(2);
const SPECIAL: TypeTag = TypeTag(3);

struct Catalog {
    nd: Nd,
    name: FieldSearchKey,
    by_name: FieldSearchIndex,
    score: FieldInt,
}

impl Catalog {
    fn item(&self, tag: TypeTag, name: &str, score: i32) -> Result<Address> {
        let item = self.nd.create_node(tag)?.address();
        self.score.put(&self.nd, item, score)?;
        self.name.put(&self.nd, item, name)?;
        Ok(item)
    }

    fn names(&self, found: &[Address]) -> Result<Vec<String>> {
        found.iter().map(|a| self.name.get(&self.nd, *a)).collect()
    }
}

fn catalog() -> Result<Catalog> {
    let item = StructDef::create_node("Item", ITEM, None)?;
    let name = item.add_search_key()?;
    let score = item.add_int()?;
    let special = StructDef::create_node("Special", SPECIAL, Some(&item))?;
    let holder = StructDef::create_node("Catalog", CATALOG, None)?;
    let by_name = holder.add_search_index(&name, 0)?;
    item.done()?;
    special.done()?;
    holder.done()?;
    let registry = TypeRegistry::builder()
        .register(&holder)?
        .register(&item)?
        .register(&special)?
        .build();
    let nd = Nd::in_memory(registry, NdOptions::strict())?;
    let guard = nd.write(&CancelToken::new())?;
    let root = nd.create_node(CATALOG)?.address();
    by_name.attach(&nd, root)?;
    guard.release()?;
    Ok(Catalog {
        nd,
        name,
        by_name,
        score,
    })
}

#[test]
fn prefix_query_honours_case_sensitivity() -> Result<()> {
    let c = catalog()?;
    let guard = c.nd.write(&CancelToken::new())?;
    for name in ["Foo", "foo", "Bar"] {
        c.item(ITEM, name, 0)?;
    }
    guard.release()?;

    let _read = c.nd.read();
    let insensitive = c.by_name.find_all(&c.nd, &SearchCriteria::prefix("Fo"))?;
    assert_eq!(c.names(&insensitive)?, vec!["Foo", "foo"]);
    let sensitive = c
        .by_name
        .find_all(&c.nd, &SearchCriteria::prefix("Fo").case_sensitive(true))?;
    assert_eq!(c.names(&sensitive)?, vec!["Foo"]);
    assert_eq!(c.by_name.size(&c.nd)?, 3);
    Ok(())
}

#[test]
fn exact_lookup_and_first_match() -> Result<()> {
    let c = catalog()?;
    let _guard = c.nd.write(&CancelToken::new())?;
    let apple = c.item(ITEM, "apple", 0)?;
    c.item(ITEM, "Apple", 0)?;
    c.item(ITEM, "applesauce", 0)?;

    let exact = c.by_name.find_all(&c.nd, &SearchCriteria::exact("APPLE"))?;
    assert_eq!(c.names(&exact)?, vec!["Apple", "apple"]);
    let first = c
        .by_name
        .find_first(&c.nd, &SearchCriteria::exact("apple").case_sensitive(true))?;
    assert_eq!(first, Some(apple));
    assert_eq!(c.by_name.find_first(&c.nd, &SearchCriteria::exact("pear"))?, None);
    Ok(())
}

#[test]
fn best_match_uses_the_rank() -> Result<()> {
    let c = catalog()?;
    let _guard = c.nd.write(&CancelToken::new())?;
    c.item(ITEM, "tea", 3)?;
    let best = c.item(ITEM, "teapot", 9)?;
    c.item(ITEM, "teal", 9)?;
    c.item(ITEM, "coffee", 100)?;
    let score = c.score.clone();
    let found = c
        .by_name
        .find_best(&c.nd, &SearchCriteria::prefix("tea"), |nd, a| {
            Ok(i64::from(score.get(nd, a)?))
        })?;
    // "teal" sorts before "teapot", so the tie keeps "teal"
    assert_eq!(c.name.get(&c.nd, found.expect("a match"))?, "teal");
    assert_ne!(found, Some(best));
    Ok(())
}

#[test]
fn limited_results_stop_early() -> Result<()> {
    let c = catalog()?;
    let _guard = c.nd.write(&CancelToken::new())?;
    for i in 0..10 {
        c.item(ITEM, &format!("row{i:02}"), i)?;
    }
    let first_three = c
        .by_name
        .find_all_limited(&c.nd, &SearchCriteria::prefix("row"), 3)?;
    assert_eq!(c.names(&first_three)?, vec!["row00", "row01", "row02"]);
    assert!(c
        .by_name
        .find_all_limited(&c.nd, &SearchCriteria::prefix("row"), 0)?
        .is_empty());
    Ok(())
}

#[test]
fn type_filter_includes_subtypes_only_when_asked() -> Result<()> {
    let c = catalog()?;
    let _guard = c.nd.write(&CancelToken::new())?;
    let plain = c.item(ITEM, "widget", 0)?;
    let special = c.item(SPECIAL, "widget", 0)?;
    let all = c
        .by_name
        .find_all(&c.nd, &SearchCriteria::exact("widget").of_type(ITEM))?;
    assert_eq!(all.len(), 2);
    assert!(all.contains(&plain) && all.contains(&special));
    let only_special = c
        .by_name
        .find_all(&c.nd, &SearchCriteria::exact("widget").of_type(SPECIAL))?;
    assert_eq!(only_special, vec![special]);
    Ok(())
}

#[test]
fn find_all_is_cached_until_the_index_changes() -> Result<()> {
    let c = catalog()?;
    let _guard = c.nd.write(&CancelToken::new())?;
    let a = c.item(ITEM, "alpha", 0)?;
    let criteria = SearchCriteria::prefix("al");
    assert_eq!(c.by_name.find_all(&c.nd, &criteria)?, vec![a]);
    let (hits, _) = c.nd.cache_counters();
    assert_eq!(c.by_name.find_all(&c.nd, &criteria)?, vec![a]);
    assert_eq!(c.nd.cache_counters().0, hits + 1);

    let b = c.item(ITEM, "almond", 0)?;
    assert_eq!(c.nd.cached_results(), 0);
    assert_eq!(c.by_name.find_all(&c.nd, &criteria)?, vec![b, a]);
    Ok(())
}

#[test]
fn renaming_and_deleting_keep_the_index_in_step() -> Result<()> {
    let c = catalog()?;
    let guard = c.nd.write(&CancelToken::new())?;
    let x = c.item(ITEM, "xenon", 0)?;
    let y = c.item(ITEM, "yttrium", 0)?;
    c.name.put(&c.nd, x, "argon")?;
    assert!(c.by_name.find_first(&c.nd, &SearchCriteria::exact("xenon"))?.is_none());
    assert_eq!(c.by_name.find_first(&c.nd, &SearchCriteria::exact("argon"))?, Some(x));

    c.name.put(&c.nd, y, "")?;
    assert_eq!(c.by_name.size(&c.nd)?, 1);
    c.nd.delete(x)?;
    assert_eq!(c.by_name.size(&c.nd)?, 0);
    c.nd.delete(y)?;
    guard.release()
}

#[test]
fn deleting_the_holder_releases_the_tree() -> Result<()> {
    let c = catalog()?;
    let guard = c.nd.write(&CancelToken::new())?;
    let baseline = c.nd.store_stats().map(|s| s.live_blocks);
    let mut items = Vec::new();
    for i in 0..50 {
        items.push(c.item(ITEM, &format!("k{i}"), 0)?);
    }
    let holder = c.by_name.holder(&c.nd)?;
    c.nd.delete(holder)?;
    assert!(c.by_name.holder(&c.nd)?.is_null());
    assert_eq!(c.by_name.size(&c.nd)?, 0);
    assert!(matches!(
        c.by_name.find_all(&c.nd, &SearchCriteria::prefix("k")),
        Err(NdError::Invalid(_))
    ));
    // index nodes and the holder are gone; items and their keys remain
    let live = c.nd.store_stats().map(|s| s.live_blocks);
    assert_eq!(live, baseline.map(|b| b - 1 + 2 * items.len() as u64));
    guard.release()
}

struct CountAll(usize);

impl BTreeVisitor for CountAll {
    fn compare(&mut self, _nd: &Nd, _record: Address) -> Result<Ordering> {
        Ok(Ordering::Equal)
    }

    fn visit(&mut self, _nd: &Nd, _record: Address) -> Result<bool> {
        self.0 += 1;
        Ok(true)
    }
}

#[test]
fn random_workload_matches_a_sorted_model() -> Result<()> {
    let c = catalog()?;
    let guard = c.nd.write(&CancelToken::new())?;
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let alphabet = ['a', 'B', 'c', 'D'];
    let mut live: Vec<(String, Address)> = Vec::new();
    for _ in 0..400 {
        let len = rng.gen_range(1..5);
        let key: String = (0..len)
            .map(|_| *alphabet.choose(&mut rng).unwrap_or(&'a'))
            .collect();
        let address = c.item(ITEM, &key, 0)?;
        live.push((key, address));
    }
    live.shuffle(&mut rng);
    for (_, address) in live.drain(..200) {
        c.nd.delete(address)?;
    }
    live.sort_by(|(ka, a), (kb, b)| compare_keys(ka, kb).then(a.cmp(b)));

    for prefix in ["a", "b", "Ca", "dd", ""] {
        let expected: Vec<Address> = live
            .iter()
            .filter(|(k, _)| k.to_lowercase().starts_with(&prefix.to_lowercase()))
            .map(|(_, a)| *a)
            .collect();
        let found = c.by_name.find_all(&c.nd, &SearchCriteria::prefix(prefix))?;
        assert_eq!(found, expected, "prefix {prefix:?}");
    }

    let mut counter = CountAll(0);
    c.by_name.accept(&c.nd, &mut counter)?;
    assert_eq!(counter.0, live.len());
    let stats = c.by_name.stats();
    assert_eq!(stats.inserts, 400);
    assert_eq!(stats.deletes, 200);
    assert!(stats.splits > 0);
    guard.release()
}

#[test]
fn index_pairing_errors() -> Result<()> {
    let item = StructDef::create_node("Item", ITEM, None)?;
    let key = item.add_search_key()?;
    let holder = StructDef::create_node("Holder", CATALOG, None)?;
    assert!(matches!(
        holder.add_search_index(&key, 99),
        Err(NdError::SchemaDefinition(_))
    ));
    holder.add_search_index(&key, 1)?;
    assert!(matches!(
        holder.add_search_index(&key, 2),
        Err(NdError::SchemaDefinition(_))
    ));
    Ok(())
}
