use factbase::catalog;
use factbase::construct::{Database, PersistenceMode};
use factbase::datalog::Engine;
use factbase::datatype::Value;
use factbase::error::FactbaseError;

const SCHEMA: &str = "[{:db/ident :user/email :db/valueType :db.type/string}
                       {:db/ident :user/score :db/valueType :db.type/bigdec}
                       {:db/ident :user/joined :db/valueType :db.type/instant}
                       {:db/ident :user/friend :db/valueType :db.type/ref :db/cardinality :db.cardinality/many}]";

fn temp_path(name: &str) -> String {
    let path = std::env::temp_dir().join(name).to_string_lossy().to_string();
    let _ = std::fs::remove_file(&path);
    path
}

#[test]
fn in_memory_mode_has_no_ledger() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let engine = Engine::new(&db);
    engine.execute(SCHEMA).unwrap();
    engine.execute(r#"[{:user/email "a@x.com"}]"#).unwrap();
    assert!(db.persistor.lock().unwrap().current_superhash().is_none());
}

#[test]
fn file_mode_restores_facts_and_identities() {
    let path = temp_path("factbase_restore_test.db");
    let (sally, facts) = {
        let db = Database::new(PersistenceMode::File(path.clone())).expect("db");
        let engine = Engine::new(&db);
        engine.execute(SCHEMA).unwrap();
        engine
            .execute(
                r#"[{:db/id #db/id[:db.part/user -1] :user/email "sally@x.com" :user/score 12.50M
                     :user/joined #inst "2020-02-02T10:00:00" :user/friend #db/id[:db.part/user -2]}
                    {:db/id #db/id[:db.part/user -2] :user/email "frank@x.com"}]"#,
            )
            .unwrap();
        let result = engine
            .execute_collect(r#"[:find ?e :where [?e :user/email "sally@x.com"]]"#)
            .unwrap()
            .unwrap();
        (result.values()[0][0].clone(), db.fact_count().unwrap())
    };

    let db = Database::new(PersistenceMode::File(path.clone())).expect("reopened db");
    assert_eq!(db.fact_count().unwrap(), facts);
    let engine = Engine::new(&db);
    let result = engine
        .execute_collect(
            "[:find ?email :where [?e :user/score ?s] [(> ?s 12)] [?e :user/friend ?f] [?f :user/email ?email]]",
        )
        .unwrap()
        .unwrap();
    assert_eq!(result.values(), vec![vec![Value::String("frank@x.com".into())]]);

    // new things continue after the restored ones
    let report = db
        .insert(vec![factbase::transact::EntityMap::new().with(":user/email", "new@x.com")])
        .unwrap();
    let Value::Ref(sally) = sally else {
        panic!("expected an entity");
    };
    assert!(report.entities[0] > sally);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn file_mode_ledger_chains_and_verifies() {
    let path = temp_path("factbase_ledger_test.db");
    let head = {
        let db = Database::new(PersistenceMode::File(path.clone())).expect("db");
        let engine = Engine::new(&db);
        engine.execute(SCHEMA).unwrap();
        let after_schema = db.current_superhash().unwrap();
        assert!(after_schema.is_some(), "expected ledger head after a transaction");
        engine.execute(r#"[{:user/email "a@x.com"}]"#).unwrap();
        let head = db.current_superhash().unwrap();
        assert_ne!(head, after_schema);
        head
    };
    let db = Database::new(PersistenceMode::File(path.clone())).expect("reopened db");
    assert_eq!(db.current_superhash().unwrap(), head);
    let entries = db.persistor.lock().unwrap().verify_ledger(&db).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries.last().map(|e| e.superhash.clone()), head);
    let _ = std::fs::remove_file(&path);
}

fn tamper(path: &str, sql: &str) -> Result<(), FactbaseError> {
    {
        let db = Database::new(PersistenceMode::File(path.to_string())).expect("db");
        let engine = Engine::new(&db);
        engine.execute(SCHEMA).unwrap();
        engine.execute(r#"[{:user/email "a@x.com"}]"#).unwrap();
    }
    let connection = rusqlite::Connection::open(path).unwrap();
    assert_eq!(connection.execute(sql, []).unwrap(), 1);
    drop(connection);

    let db = Database::new(PersistenceMode::File(path.to_string())).expect("reopened db");
    let verified = db.persistor.lock().unwrap().verify_ledger(&db).map(|_| ());
    let _ = std::fs::remove_file(path);
    verified
}

#[test]
fn rewritten_fact_breaks_the_ledger() {
    let path = temp_path("factbase_tampered_fact.db");
    let err = tamper(
        &path,
        "update Fact set FactValue = 'evil@x.com' where FactValue = 'a@x.com'",
    )
    .unwrap_err();
    assert!(matches!(err, FactbaseError::DataCorruption { .. }));
}

#[test]
fn rewritten_superhash_breaks_the_chain() {
    let path = temp_path("factbase_tampered_superhash.db");
    let err = tamper(
        &path,
        "update Ledger set Superhash = 'forged'
            where Transaction_Identity = (select min(Transaction_Identity) from Ledger)",
    )
    .unwrap_err();
    match err {
        FactbaseError::DataCorruption { message } => assert!(message.contains("chain")),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn catalog_connections_share_a_database() {
    let uri = "factbase:mem://persistence-catalog";
    let first = catalog::connect(uri).unwrap();
    Engine::new(&first).execute(SCHEMA).unwrap();
    let second = catalog::connect(uri).unwrap();
    assert!(second.attribute(":user/email").unwrap().is_some());
}
