#![allow(missing_docs)]

use pdom::{
    storage::{FieldDouble, FieldInt, FieldLong, FieldString, StructDef},
    types::{NdError, Result, TypeTag},
    CancelToken, Nd, NdOptions, TypeRegistry,
};
use proptest::prelude::*;

fn nd(registry: TypeRegistry) -> Result<Nd> {
    Nd::in_memory(registry, NdOptions::strict())
}

#[test]
fn point_scenario() -> Result<()> {
    let point = StructDef::create("Point", None);
    let x = point.add_int()?;
    let y = point.add_int()?;
    point.done()?;
    assert_eq!(point.size()?, 2 * FieldInt::RECORD_SIZE);

    let nd = nd(TypeRegistry::builder().build())?;
    let guard = nd.write(&CancelToken::new())?;
    let p = nd.create(&point)?;
    x.put(&nd, p, 3)?;
    y.put(&nd, p, 4)?;
    assert_eq!(x.get(&nd, p)?, 3);
    assert_eq!(y.get(&nd, p)?, 4);
    guard.release()
}

#[test]
fn offsets_are_contiguous_across_a_hierarchy() -> Result<()> {
    let base = StructDef::create_abstract("Named", None)?;
    let name = base.add_string()?;
    let rank = base.add_short()?;
    let leaf = StructDef::create_node("Leaf", TypeTag(3), Some(&base))?;
    let weight = leaf.add_double()?;
    let id = leaf.add_long()?;
    // leaf declared done before its parent
    leaf.done()?;
    assert!(!leaf.is_frozen());
    base.done()?;
    assert!(leaf.is_frozen());

    let parent_size = base.size()?;
    assert_eq!(name.offset()?, 2);
    assert_eq!(rank.offset()?, 2 + FieldString::RECORD_SIZE);
    assert_eq!(parent_size, 2 + FieldString::RECORD_SIZE + 2);
    assert_eq!(weight.offset()?, parent_size);
    assert_eq!(id.offset()?, parent_size + FieldDouble::RECORD_SIZE);
    assert_eq!(
        leaf.size()?,
        parent_size + FieldDouble::RECORD_SIZE + FieldLong::RECORD_SIZE
    );
    Ok(())
}

#[test]
fn frozen_schema_rejects_every_mutation() -> Result<()> {
    let def = StructDef::create_node("Frozen", TypeTag(5), None)?;
    def.add_byte()?;
    def.done()?;
    for attempt in [
        def.add_char().map(|_| ()),
        def.add_float().map(|_| ()),
        def.add_pointer().map(|_| ()),
        def.add_string().map(|_| ()),
        def.use_standard_ref_counting(),
        def.set_destructor(|_, _| Ok(())),
        def.done(),
    ] {
        assert!(matches!(attempt, Err(NdError::SchemaFrozen(ref name)) if name == "Frozen"));
    }
    Ok(())
}

#[test]
fn fields_cannot_be_used_before_done() -> Result<()> {
    let def = StructDef::create("Pending", None);
    let v = def.add_int()?;
    assert!(matches!(v.offset(), Err(NdError::SchemaDefinition(_))));
    assert!(matches!(def.size(), Err(NdError::SchemaDefinition(_))));
    Ok(())
}

#[test]
fn destructors_run_before_field_cleanup() -> Result<()> {
    use std::sync::{Arc, Mutex};

    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let base = StructDef::create_abstract("Base", None)?;
    let label = base.add_string()?;
    {
        let seen = Arc::clone(&seen);
        let label = label.clone();
        base.set_destructor(move |nd, address| {
            seen.lock().unwrap().push(format!("base:{}", label.get(nd, address)?));
            Ok(())
        })?;
    }
    base.done()?;
    let item = StructDef::create_node("Item", TypeTag(9), Some(&base))?;
    {
        let seen = Arc::clone(&seen);
        item.set_destructor(move |_, _| {
            seen.lock().unwrap().push("item".to_string());
            Ok(())
        })?;
    }
    item.done()?;
    assert!(item.has_destructor());

    let registry = TypeRegistry::builder().register(&item)?.build();
    let nd = nd(registry)?;
    let guard = nd.write(&CancelToken::new())?;
    let node = nd.create_node(TypeTag(9))?;
    label.put(&nd, node.address(), "x")?;
    nd.delete(node.address())?;
    guard.release()?;
    assert_eq!(*seen.lock().unwrap(), vec!["item".to_string(), "base:x".to_string()]);
    Ok(())
}

#[test]
fn strings_are_released_with_the_record() -> Result<()> {
    let def = StructDef::create_node("Doc", TypeTag(2), None)?;
    let title = def.add_string()?;
    let body = def.add_string()?;
    def.done()?;
    let nd = nd(TypeRegistry::builder().register(&def)?.build())?;
    let guard = nd.write(&CancelToken::new())?;
    let baseline = nd.store_stats().map(|s| s.live_blocks);
    let doc = nd.create_node(TypeTag(2))?;
    title.put(&nd, doc.address(), "Title")?;
    body.put(&nd, doc.address(), "ünïcödé body")?;
    assert_eq!(body.get(&nd, doc.address())?, "ünïcödé body");
    doc.delete()?;
    assert_eq!(nd.store_stats().map(|s| s.live_blocks), baseline);
    guard.release()
}

struct Wide {
    nd: Nd,
    def: StructDef,
    b: pdom::storage::FieldByte,
    c: pdom::storage::FieldChar,
    s: pdom::storage::FieldShort,
    i: FieldInt,
    l: FieldLong,
    f: pdom::storage::FieldFloat,
    d: FieldDouble,
    t: FieldString,
}

fn wide() -> Result<Wide> {
    let def = StructDef::create("Wide", None);
    let b = def.add_byte()?;
    let c = def.add_char()?;
    let s = def.add_short()?;
    let i = def.add_int()?;
    let l = def.add_long()?;
    let f = def.add_float()?;
    let d = def.add_double()?;
    let t = def.add_string()?;
    def.done()?;
    Ok(Wide {
        nd: nd(TypeRegistry::builder().build())?,
        def,
        b,
        c,
        s,
        i,
        l,
        f,
        d,
        t,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_width_round_trips(
        b in any::<u8>(),
        c in any::<u16>(),
        s in any::<i16>(),
        i in any::<i32>(),
        l in any::<i64>(),
        f in any::<f32>().prop_filter("NaN never compares equal", |v| !v.is_nan()),
        d in any::<f64>().prop_filter("NaN never compares equal", |v| !v.is_nan()),
        t in "\\PC{0,40}",
    ) {
        let w = wide().unwrap();
        let _guard = w.nd.write(&CancelToken::new()).unwrap();
        let r = w.nd.create(&w.def).unwrap();
        w.b.put(&w.nd, r, b).unwrap();
        w.c.put(&w.nd, r, c).unwrap();
        w.s.put(&w.nd, r, s).unwrap();
        w.i.put(&w.nd, r, i).unwrap();
        w.l.put(&w.nd, r, l).unwrap();
        w.f.put(&w.nd, r, f).unwrap();
        w.d.put(&w.nd, r, d).unwrap();
        w.t.put(&w.nd, r, &t).unwrap();
        prop_assert_eq!(w.b.get(&w.nd, r).unwrap(), b);
        prop_assert_eq!(w.c.get(&w.nd, r).unwrap(), c);
        prop_assert_eq!(w.s.get(&w.nd, r).unwrap(), s);
        prop_assert_eq!(w.i.get(&w.nd, r).unwrap(), i);
        prop_assert_eq!(w.l.get(&w.nd, r).unwrap(), l);
        prop_assert_eq!(w.f.get(&w.nd, r).unwrap(), f);
        prop_assert_eq!(w.d.get(&w.nd, r).unwrap(), d);
        prop_assert_eq!(w.t.get(&w.nd, r).unwrap(), t);
    }
}
