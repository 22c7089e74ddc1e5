//! Integration tests using the PermdTest harness

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FlakyStorage, PermdTest};
use permd::cache::Tristate;
use permd::commands::CommandResult;
use permd::export::{export_lines, export_to_file, import_file};
use permd::holder::PermissionHolder;
use permd::node::{unix_now, QueryContext};
use permd::storage::{MemoryStorage, SqliteStorage, Storage};
use permd::{Config, Engine};
use uuid::Uuid;

fn global() -> QueryContext {
    QueryContext::global()
}

async fn check(t: &PermdTest, uuid: Uuid, key: &str, ctx: &QueryContext) -> Tristate {
    let user = t.engine.users().get(uuid).expect("user not loaded");
    t.engine.has_permission(user.as_ref(), key, ctx)
}

#[tokio::test]
async fn test_exact_node_beats_heavier_wildcard() {
    let t = PermdTest::start().await;
    t.run("creategroup admin").await;
    t.run("group admin permission set weight.10").await;
    t.run("group admin permission set essentials.*").await;
    t.run("group default permission set essentials.help false").await;

    let uuid = t.login("alice").await;
    t.run(&format!("user {} parent add admin", uuid)).await;

    assert_eq!(check(&t, uuid, "essentials.help", &global()).await, Tristate::False);
    assert_eq!(check(&t, uuid, "essentials.home", &global()).await, Tristate::True);
    assert_eq!(check(&t, uuid, "other.thing", &global()).await, Tristate::Undefined);
}

#[tokio::test]
async fn test_wildcard_and_exact_on_one_holder() {
    let t = PermdTest::start().await;
    t.run("group default permission set a.*").await;
    t.run("group default permission set a.b false").await;
    let uuid = t.login("bob").await;

    assert_eq!(check(&t, uuid, "a.b", &global()).await, Tristate::False);
    assert_eq!(check(&t, uuid, "a.c", &global()).await, Tristate::True);
}

#[tokio::test]
async fn test_cascade_reaches_transitive_inheritors() {
    let t = PermdTest::start().await;
    t.run("creategroup g").await;
    t.run("creategroup g2").await;
    t.run("group g2 parent add g").await;

    let uuid = t.login("carol").await;
    t.run(&format!("user {} parent add g2", uuid)).await;
    assert_eq!(check(&t, uuid, "fly", &global()).await, Tristate::Undefined);

    t.run("group g permission set fly").await;
    assert_eq!(check(&t, uuid, "fly", &global()).await, Tristate::True);

    t.run("group g permission unset fly").await;
    assert_eq!(check(&t, uuid, "fly", &global()).await, Tristate::Undefined);
}

#[tokio::test]
async fn test_cycles_terminate() {
    let t = PermdTest::start().await;
    t.run("creategroup a").await;
    t.run("creategroup b").await;
    t.run("group a parent add b").await;
    t.run("group b parent add a").await;
    t.run("group b permission set from.b").await;
    t.run("group a permission set from.a").await;

    let uuid = t.login("dave").await;
    t.run(&format!("user {} parent add a", uuid)).await;
    assert_eq!(check(&t, uuid, "from.a", &global()).await, Tristate::True);
    assert_eq!(check(&t, uuid, "from.b", &global()).await, Tristate::True);

    // same answers as with the back edge removed
    t.run("group b parent remove a").await;
    assert_eq!(check(&t, uuid, "from.a", &global()).await, Tristate::True);
    assert_eq!(check(&t, uuid, "from.b", &global()).await, Tristate::True);
}

#[tokio::test]
async fn test_server_and_world_scoping() {
    let t = PermdTest::start().await;
    t.run("group default permission set build true survival").await;
    t.run("group default permission set chat").await;
    t.run("group default permission set nether.only true survival nether").await;
    let uuid = t.login("erin").await;

    let survival = QueryContext::server("survival");
    let creative = QueryContext::server("creative");
    assert_eq!(check(&t, uuid, "build", &survival).await, Tristate::True);
    assert_eq!(check(&t, uuid, "build", &creative).await, Tristate::Undefined);
    assert_eq!(check(&t, uuid, "chat", &survival).await, Tristate::True);
    assert_eq!(check(&t, uuid, "chat", &creative).await, Tristate::True);

    assert_eq!(check(&t, uuid, "nether.only", &survival).await, Tristate::Undefined);
    let nether = QueryContext::server("survival").with_world("nether");
    assert_eq!(check(&t, uuid, "nether.only", &nether).await, Tristate::True);
}

#[tokio::test]
async fn test_expired_nodes_never_apply() {
    let t = PermdTest::start().await;
    let uuid = t.login("frank").await;
    let soon = unix_now() + 2;
    t.run(&format!("user {} permission settemp vip.fly true {}", uuid, soon)).await;
    assert_eq!(check(&t, uuid, "vip.fly", &global()).await, Tristate::True);

    tokio::time::sleep(Duration::from_millis(3100)).await;
    // cache was built before expiry and nobody invalidated it
    assert_eq!(check(&t, uuid, "vip.fly", &global()).await, Tristate::Undefined);
}

#[tokio::test]
async fn test_concurrent_logins_share_one_load() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set_load_delay(Duration::from_millis(50));
    let engine = Arc::new(Engine::new(Config::default(), storage.clone()));
    engine.start().await.unwrap();
    let users = engine.users().clone();
    let uuid = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let users = users.clone();
        handles.push(tokio::spawn(async move {
            users.load_or_create_user(uuid, Some("grace")).await
        }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    assert!(outcomes.iter().all(|ok| *ok));
    assert_eq!(storage.user_loads(), 1);
}

#[tokio::test]
async fn test_failed_save_is_reported_and_rolled_back() {
    let t = PermdTest::start().await;
    t.run("creategroup admin").await;
    t.run("group admin permission set kept").await;

    t.storage.fail_saves_for("admin");
    let outcome = t.try_run("group admin permission set lost").await;
    assert_eq!(outcome.result, CommandResult::Failure);

    let admin = t.engine.group("admin").unwrap();
    assert_eq!(admin.nodes(), vec!["kept".parse::<permd::node::Node>().unwrap()]);

    // unrelated holders still save
    t.run("group default permission set fine").await;
    t.storage.heal();
    t.run("group admin permission set lost").await;
}

#[tokio::test]
async fn test_promotion_along_track() {
    let t = PermdTest::start().await;
    for group in ["member", "mod"] {
        t.run(&format!("creategroup {}", group)).await;
    }
    t.run("group mod permission set kick").await;
    t.run("createtrack staff").await;
    t.run("track staff append default").await;
    t.run("track staff append member").await;
    t.run("track staff append mod").await;

    let uuid = t.login("heidi").await;
    t.run(&format!("user {} promote staff", uuid)).await;
    t.run(&format!("user {} promote staff", uuid)).await;
    assert_eq!(check(&t, uuid, "kick", &global()).await, Tristate::True);

    let end = t.try_run(&format!("user {} promote staff", uuid)).await;
    assert_eq!(end.result, CommandResult::Failure);

    t.run("deletegroup member").await;
    let broken = t.try_run(&format!("user {} demote staff", uuid)).await;
    assert_eq!(broken.result, CommandResult::Failure);
    assert!(broken.detail.contains("member"), "{}", broken.detail);
}

#[tokio::test]
async fn test_meta_prefix_and_primary_group() {
    let t = PermdTest::start().await;
    t.run("creategroup admin").await;
    t.run("group admin permission set prefix.100.[Admin]").await;
    t.run("group default permission set prefix.1.[Member]").await;
    t.run("group default meta set rank 1").await;
    t.run("group admin meta set rank 10").await;

    let uuid = t.login("ivan").await;
    t.run(&format!("user {} parent add admin", uuid)).await;
    t.run(&format!("user {} switchprimarygroup admin", uuid)).await;

    let user = t.engine.users().get(uuid).unwrap();
    assert_eq!(user.primary_group(), "admin");
    let ctx = global();
    assert_eq!(t.engine.get_prefix(user.as_ref(), &ctx).as_deref(), Some("[Admin]"));
    // the primary group is visited first
    assert_eq!(t.engine.get_meta(user.as_ref(), "rank", &ctx).as_deref(), Some("10"));
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let t = PermdTest::start().await;
    t.run("creategroup admin").await;
    t.run("group admin permission set essentials.* true survival").await;
    t.run("group admin permission set weight.10").await;
    t.run("createtrack staff").await;
    t.run("track staff append default").await;
    t.run("track staff append admin").await;
    let expiry = unix_now() + 3600;

    let uuid = t.login("judy").await;
    t.run(&format!("user {} parent add admin", uuid)).await;
    t.run(&format!("user {} switchprimarygroup admin", uuid)).await;
    t.run(&format!("user {} parent remove default", uuid)).await;
    t.run(&format!("user {} permission settemp temp.perm true {}", uuid, expiry)).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.txt");
    assert!(export_to_file(&t.engine, &path).await.is_success());
    let again = export_to_file(&t.engine, &path).await;
    assert_eq!(again.result, CommandResult::InvalidArgs);

    let fresh = PermdTest::start().await;
    let report = import_file(&fresh.executor, &path).await.unwrap();
    assert_eq!(report.failed(), 0, "{:?}", report.failures);

    let original = export_lines(&t.engine).await.unwrap();
    let replayed = export_lines(&fresh.engine).await.unwrap();
    assert_eq!(original[1..], replayed[1..]);

    let stored = fresh.storage.load_user(uuid).await.unwrap().unwrap();
    assert_eq!(stored.primary_group, "admin");
    assert!(!stored.nodes.contains(&"group.default".parse().unwrap()));
}

#[tokio::test]
async fn test_restart_keeps_state() {
    let storage = Arc::new(FlakyStorage::default());
    let first = PermdTest::with_storage(Config::default(), storage.clone()).await;
    first.run("creategroup admin").await;
    first.run("group admin permission set fly").await;
    let uuid = first.login("kim").await;
    first.run(&format!("user {} parent add admin", uuid)).await;
    first.hooks.on_quit(uuid).await;

    let second = PermdTest::with_storage(Config::default(), storage).await;
    assert!(second.hooks.on_login(uuid, "kim").await);
    assert_eq!(check(&second, uuid, "fly", &global()).await, Tristate::True);
}

#[tokio::test]
async fn test_sqlite_file_backend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("perms.db");
    let path = path.to_str().unwrap().to_string();
    let uuid = Uuid::new_v4();

    {
        let storage = Arc::new(SqliteStorage::new(Some(path.as_str())).await.unwrap());
        let engine = Engine::new(Config::default(), storage);
        engine.start().await.unwrap();
        engine.create_group("admin").await.unwrap();
        let admin = engine.group("admin").unwrap();
        engine
            .set_node(
                &permd::holder::HolderRef::Group(admin),
                "survival/essentials.*".parse().unwrap(),
            )
            .await
            .unwrap();
        let user = engine.user(uuid).await.unwrap();
        engine
            .add_parent(&permd::holder::HolderRef::User(user), "admin", None, None)
            .await
            .unwrap();
    }

    let storage = Arc::new(SqliteStorage::new(Some(path.as_str())).await.unwrap());
    assert_eq!(storage.list_user_keys().await.unwrap(), vec![uuid]);
    let engine = Engine::new(Config::default(), storage);
    engine.start().await.unwrap();
    let user = engine.user(uuid).await.unwrap();
    assert_eq!(
        engine.has_permission(user.as_ref(), "essentials.home", &QueryContext::server("survival")),
        Tristate::True
    );
}

#[tokio::test]
async fn test_logout_unloads_but_keeps_data() {
    let t = PermdTest::start().await;
    let uuid = t.login("leo").await;
    t.run(&format!("user {} permission set keep.me", uuid)).await;
    assert!(t.engine.users().is_loaded(uuid));

    t.hooks.on_quit(uuid).await;
    assert!(!t.engine.users().is_loaded(uuid));

    let stored = t.storage.load_user(uuid).await.unwrap().unwrap();
    assert!(stored.nodes.contains(&"keep.me".parse().unwrap()));
    assert_eq!(stored.username.as_deref(), Some("leo"));
}
