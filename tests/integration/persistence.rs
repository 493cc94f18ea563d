#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use pdom::{
    storage::{FieldManyToOne, FieldOneToMany, FieldSearchIndex, FieldSearchKey, StructDef},
    types::{Address, NdError, Result, TypeTag},
    CancelToken, Nd, NdOptions, Ownership, SearchCriteria, TypeRegistry,
};
use tempfile::tempdir;

const TEAM: TypeTag = TypeTag(1);
const PLAYER: TypeTag = TypeTag(2);
const LEAGUE: TypeTag = TypeTag(3);

struct Roster {
    registry: TypeRegistry,
    team: FieldManyToOne,
    players: FieldOneToMany,
    name: FieldSearchKey,
    by_name: FieldSearchIndex,
}

// Rebuilt from scratch for every open, as a fresh process would.
fn roster() -> Result<Roster> {
    let team_def = StructDef::create_node("Team", TEAM, None)?;
    let player_def = StructDef::create_node("Player", PLAYER, None)?;
    let league_def = StructDef::create_node("League", LEAGUE, None)?;
    let name = player_def.add_search_key()?;
    let team = player_def.add_many_to_one(Ownership::None)?;
    let players = team_def.add_one_to_many(&team)?;
    let by_name = league_def.add_search_index(&name, 0)?;
    team_def.done()?;
    player_def.done()?;
    league_def.done()?;
    let registry = TypeRegistry::builder()
        .register(&team_def)?
        .register(&player_def)?
        .register(&league_def)?
        .build();
    Ok(Roster {
        registry,
        team,
        players,
        name,
        by_name,
    })
}

fn populate(path: &Path) -> Result<Address> {
    let r = roster()?;
    let nd = Nd::open(path, r.registry.clone(), NdOptions::strict())?;
    let mut guard = nd.write(&CancelToken::new())?;
    guard.set_flush(true);
    let league = nd.create_node(LEAGUE)?.address();
    r.by_name.attach(&nd, league)?;
    let team = nd.create_node(TEAM)?.address();
    nd.set_root(1, team)?;
    for name in ["Ana", "andre", "Bo", "Cy"] {
        let player = nd.create_node(PLAYER)?.address();
        r.name.put(&nd, player, name)?;
        r.team.put(&nd, player, team)?;
    }
    guard.release()?;
    nd.close()?;
    Ok(team)
}

#[test]
fn relationships_and_index_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("roster.pdom");
    let team = populate(&path)?;

    let r = roster()?;
    let nd = Nd::open(&path, r.registry.clone(), NdOptions::strict())?;
    let _read = nd.read();
    assert_eq!(nd.root(1)?, team);
    assert_eq!(r.players.size(&nd, team)?, 4);
    let found = r.by_name.find_all(&nd, &SearchCriteria::prefix("an"))?;
    let names: Vec<String> = found
        .iter()
        .map(|a| r.name.get(&nd, *a))
        .collect::<Result<_>>()?;
    assert_eq!(names, vec!["Ana", "andre"]);
    for player in found {
        assert_eq!(r.team.get(&nd, player)?, team);
    }
    Ok(())
}

#[test]
fn mutations_after_reopen_persist_again() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("roster.pdom");
    let team = populate(&path)?;

    {
        let r = roster()?;
        let options = NdOptions {
            flush_on_write_release: true,
            ..NdOptions::strict()
        };
        let nd = Nd::open(&path, r.registry.clone(), options)?;
        let guard = nd.write(&CancelToken::new())?;
        let bo = r
            .by_name
            .find_first(&nd, &SearchCriteria::exact("bo"))?
            .expect("Bo was indexed");
        nd.delete(bo)?;
        guard.release()?;
    }

    let r = roster()?;
    let nd = Nd::open(&path, r.registry.clone(), NdOptions::strict())?;
    let _read = nd.read();
    assert_eq!(r.players.size(&nd, team)?, 3);
    assert!(r.by_name.find_first(&nd, &SearchCriteria::exact("bo"))?.is_none());
    assert_eq!(r.by_name.size(&nd)?, 3);
    Ok(())
}

#[test]
fn unsupported_version_recreates_the_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("roster.pdom");
    populate(&path)?;

    let r = roster()?;
    let newer = NdOptions {
        min_version: 2,
        max_version: 2,
        current_version: 2,
        ..NdOptions::strict()
    };
    let nd = Nd::open(&path, r.registry.clone(), newer)?;
    assert_eq!(nd.version(), 2);
    let _read = nd.read();
    assert!(nd.root(1)?.is_null());
    assert_eq!(nd.store_stats().map(|s| s.live_blocks), Some(0));
    Ok(())
}

#[test]
fn damaged_data_is_reported_as_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("roster.pdom");
    populate(&path)?;

    let mut bytes = fs::read(&path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&path, &bytes)?;

    let r = roster()?;
    let err = Nd::open(&path, r.registry.clone(), NdOptions::strict()).unwrap_err();
    assert!(matches!(err, NdError::IndexCorrupt(_)), "{err}");
    Ok(())
}

#[test]
fn truncated_header_is_reported_as_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("short.pdom");
    fs::write(&path, b"PDOM")?;
    let r = roster()?;
    assert!(matches!(
        Nd::open(&path, r.registry.clone(), NdOptions::default()),
        Err(NdError::IndexCorrupt(_))
    ));
    Ok(())
}

#[test]
fn options_load_from_a_toml_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nd.toml");
    fs::write(
        &path,
        "max_version = 3\ncurrent_version = 2\ndebug_locks = true\nresult_cache_capacity = 16\n",
    )?;
    let options = NdOptions::load(&path)?;
    assert_eq!(options.min_version, 1);
    assert_eq!(options.max_version, 3);
    assert_eq!(options.current_version, 2);
    assert!(options.debug_locks);
    assert_eq!(options.result_cache_capacity, 16);
    assert_eq!(options.cancellation_check_interval_ms, 100);
    assert_eq!(NdOptions::from_toml_str(&options.to_toml_string()?)?, options);

    let r = roster()?;
    let nd = Nd::open(dir.path().join("fresh.pdom"), r.registry.clone(), options)?;
    assert_eq!(nd.version(), 2);
    Ok(())
}

#[test]
fn bad_options_are_config_errors() {
    for doc in [
        "max_version = \"three\"",
        "unknown_key = 1",
        "min_version = 4\nmax_version = 2",
        "current_version = 9",
    ] {
        assert!(
            matches!(NdOptions::from_toml_str(doc), Err(NdError::Config(_))),
            "{doc}"
        );
    }
}
