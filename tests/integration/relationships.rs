#![allow(missing_docs)]

use std::collections::BTreeMap;

use pdom::{
    storage::{FieldManyToOne, FieldOneToMany, FieldOneToOne, FieldOneToOneBackpointer, StructDef},
    types::{Address, NdError, Result, TypeTag},
    CancelToken, Nd, NdOptions, Ownership, TypeRegistry,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const PARENT: TypeTag = TypeTag(1);
const CHILD: TypeTag = TypeTag(2);

struct Family {
    nd: Nd,
    parent: FieldManyToOne,
    children: FieldOneToMany,
}

fn family() -> Result<Family> {
    let parent_def = StructDef::create_node("Parent", PARENT, None)?;
    let child_def = StructDef::create_node("Child", CHILD, None)?;
    let parent = child_def.add_many_to_one(Ownership::None)?;
    let children = parent_def.add_one_to_many(&parent)?;
    parent_def.done()?;
    child_def.done()?;
    let registry = TypeRegistry::builder()
        .register(&parent_def)?
        .register(&child_def)?
        .build();
    Ok(Family {
        nd: Nd::in_memory(registry, NdOptions::strict())?,
        parent,
        children,
    })
}

#[test]
fn link_and_unlink_scenario() -> Result<()> {
    let f = family()?;
    let nd = &f.nd;
    let guard = nd.write(&CancelToken::new())?;
    let p = nd.create_node(PARENT)?.address();
    let c1 = nd.create_node(CHILD)?.address();
    let c2 = nd.create_node(CHILD)?.address();

    f.parent.put(nd, c1, p)?;
    f.parent.put(nd, c2, p)?;
    assert_eq!(f.children.size(nd, p)?, 2);
    assert_eq!(f.parent.index(nd, c2)?, 1);

    f.parent.put(nd, c1, Address::NULL)?;
    assert_eq!(f.children.size(nd, p)?, 1);
    assert_eq!(f.children.addresses(nd, p)?, vec![c2]);
    assert!(!f.children.contains(nd, p, c1)?);
    assert!(f.children.contains(nd, p, c2)?);
    assert_eq!(f.parent.get(nd, c1)?, Address::NULL);
    assert_eq!(f.parent.index(nd, c1)?, 0);
    // c2 moved into the hole left by c1
    assert_eq!(f.parent.index(nd, c2)?, 0);
    guard.release()
}

#[test]
fn reassigning_moves_between_lists() -> Result<()> {
    let f = family()?;
    let nd = &f.nd;
    let _guard = nd.write(&CancelToken::new())?;
    let p1 = nd.create_node(PARENT)?.address();
    let p2 = nd.create_node(PARENT)?.address();
    let kids: Vec<Address> = (0..4)
        .map(|_| nd.create_node(CHILD).map(|n| n.address()))
        .collect::<Result<_>>()?;
    for kid in &kids {
        f.parent.put(nd, *kid, p1)?;
    }
    f.parent.put(nd, kids[1], p2)?;
    assert_eq!(f.children.size(nd, p1)?, 3);
    assert_eq!(f.children.addresses(nd, p2)?, vec![kids[1]]);
    // putting the same target again is a no-op
    f.parent.put(nd, kids[1], p2)?;
    assert_eq!(f.children.size(nd, p2)?, 1);
    for (i, kid) in f.children.addresses(nd, p1)?.into_iter().enumerate() {
        assert_eq!(f.parent.index(nd, kid)?, i as u32);
    }
    Ok(())
}

#[test]
fn deleting_the_target_clears_forward_pointers() -> Result<()> {
    let f = family()?;
    let nd = &f.nd;
    let guard = nd.write(&CancelToken::new())?;
    let p = nd.create_node(PARENT)?.address();
    let c = nd.create_node(CHILD)?.address();
    f.parent.put(nd, c, p)?;
    nd.delete(p)?;
    assert_eq!(f.parent.get(nd, c)?, Address::NULL);
    guard.release()?;
    let _read = nd.read();
    assert!(nd.load(c)?.is_some());
    Ok(())
}

#[test]
fn deleting_a_source_removes_it_from_the_list() -> Result<()> {
    let f = family()?;
    let nd = &f.nd;
    let _guard = nd.write(&CancelToken::new())?;
    let p = nd.create_node(PARENT)?.address();
    let a = nd.create_node(CHILD)?.address();
    let b = nd.create_node(CHILD)?.address();
    f.parent.put(nd, a, p)?;
    f.parent.put(nd, b, p)?;
    nd.delete(a)?;
    assert_eq!(f.children.addresses(nd, p)?, vec![b]);
    assert_eq!(f.parent.index(nd, b)?, 0);
    Ok(())
}

#[test]
fn random_relinking_keeps_cached_indices_exact() -> Result<()> {
    let f = family()?;
    let nd = &f.nd;
    let _guard = nd.write(&CancelToken::new())?;
    let parents: Vec<Address> = (0..5)
        .map(|_| nd.create_node(PARENT).map(|n| n.address()))
        .collect::<Result<_>>()?;
    let kids: Vec<Address> = (0..40)
        .map(|_| nd.create_node(CHILD).map(|n| n.address()))
        .collect::<Result<_>>()?;
    let mut model: BTreeMap<Address, Address> = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    for _ in 0..2_000 {
        let kid = kids[rng.gen_range(0..kids.len())];
        let target = if rng.gen_bool(0.2) {
            Address::NULL
        } else {
            parents[rng.gen_range(0..parents.len())]
        };
        f.parent.put(nd, kid, target)?;
        if target.is_null() {
            model.remove(&kid);
        } else {
            model.insert(kid, target);
        }
    }
    for p in &parents {
        let list = f.children.addresses(nd, *p)?;
        let expected = model.values().filter(|t| *t == p).count();
        assert_eq!(list.len(), expected);
        for (i, kid) in list.iter().enumerate() {
            assert_eq!(f.parent.get(nd, *kid)?, *p);
            assert_eq!(f.parent.index(nd, *kid)?, i as u32);
        }
    }
    Ok(())
}

#[test]
fn pairing_is_checked_at_definition_time() -> Result<()> {
    let a = StructDef::create_node("A", TypeTag(1), None)?;
    let b = StructDef::create_node("B", TypeTag(2), None)?;
    let forward = b.add_many_to_one(Ownership::None)?;
    a.add_one_to_many(&forward)?;
    assert!(matches!(
        a.add_owning_one_to_many(&forward),
        Err(NdError::SchemaDefinition(_))
    ));

    let one = b.add_one_to_one(Ownership::None)?;
    a.add_one_to_one_backpointer(&one)?;
    assert!(matches!(
        a.add_one_to_one_backpointer(&one),
        Err(NdError::SchemaDefinition(_))
    ));
    Ok(())
}

#[test]
fn unpaired_pointer_cannot_link() -> Result<()> {
    let a = StructDef::create_node("A", TypeTag(1), None)?;
    let lonely = a.add_many_to_one(Ownership::None)?;
    a.done()?;
    let nd = Nd::in_memory(TypeRegistry::builder().register(&a)?.build(), NdOptions::strict())?;
    let _guard = nd.write(&CancelToken::new())?;
    let x = nd.create_node(TypeTag(1))?.address();
    let y = nd.create_node(TypeTag(1))?.address();
    assert!(matches!(lonely.put(&nd, x, y), Err(NdError::SchemaDefinition(_))));
    Ok(())
}

struct Pair {
    nd: Nd,
    forward: FieldOneToOne,
    back: FieldOneToOneBackpointer,
}

fn pair(ownership: Ownership) -> Result<Pair> {
    let src = StructDef::create_node("Src", TypeTag(1), None)?;
    let dst = StructDef::create_node("Dst", TypeTag(2), None)?;
    let forward = src.add_one_to_one(ownership)?;
    let back = dst.add_one_to_one_backpointer(&forward)?;
    src.done()?;
    dst.done()?;
    let registry = TypeRegistry::builder().register(&src)?.register(&dst)?.build();
    Ok(Pair {
        nd: Nd::in_memory(registry, NdOptions::strict())?,
        forward,
        back,
    })
}

#[test]
fn one_to_one_steals_the_target() -> Result<()> {
    let p = pair(Ownership::None)?;
    let nd = &p.nd;
    let _guard = nd.write(&CancelToken::new())?;
    let a = nd.create_node(TypeTag(1))?.address();
    let b = nd.create_node(TypeTag(1))?.address();
    let t = nd.create_node(TypeTag(2))?.address();
    p.forward.put(nd, a, t)?;
    assert_eq!(p.back.get(nd, t)?, a);
    p.forward.put(nd, b, t)?;
    assert_eq!(p.back.get(nd, t)?, b);
    assert_eq!(p.forward.get(nd, a)?, Address::NULL);
    p.forward.put(nd, b, Address::NULL)?;
    assert_eq!(p.back.get(nd, t)?, Address::NULL);
    Ok(())
}

#[test]
fn deleting_one_to_one_target_clears_source() -> Result<()> {
    let p = pair(Ownership::None)?;
    let nd = &p.nd;
    let _guard = nd.write(&CancelToken::new())?;
    let a = nd.create_node(TypeTag(1))?.address();
    let t = nd.create_node(TypeTag(2))?.address();
    p.forward.put(nd, a, t)?;
    nd.delete(t)?;
    assert_eq!(p.forward.get(nd, a)?, Address::NULL);
    Ok(())
}
