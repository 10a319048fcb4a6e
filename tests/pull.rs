use factbase::construct::{Database, PersistenceMode};
use factbase::datalog::Engine;
use factbase::datatype::{Cardinality, Value, ValueType};
use factbase::error::FactbaseError;
use factbase::query::{Pulled, PullElement, PullPattern, PulledValue};
use factbase::transact::{AttributeSpec, EntityMap};

fn setup() -> Engine<'static> {
    let db = Database::new(PersistenceMode::InMemory).unwrap();
    let engine = Engine::new(Box::leak(Box::new(db)));
    engine
        .execute(
            "[{:db/ident :user/email :db/valueType :db.type/string}
              {:db/ident :user/age :db/valueType :db.type/long}
              {:db/ident :user/friend :db/valueType :db.type/ref :db/cardinality :db.cardinality/many}]",
        )
        .unwrap();
    engine
}

#[test]
fn adults_pulled_with_email_and_age() {
    let engine = setup();
    engine
        .execute(
            r#"[{:user/email "sally@x.com" :user/age 34}
                {:user/email "frank@x.com" :user/age 14}]"#,
        )
        .unwrap();
    let result = engine
        .execute_collect(
            "[:find (pull ?e [:user/email :user/age]) :where [?e :user/age ?age] [(>= ?age 21)]]",
        )
        .unwrap()
        .unwrap();
    assert_eq!(result.row_count, 1);
    let sally = result.entities()[0];
    assert_eq!(sally.len(), 2);
    assert_eq!(sally.value(":user/email"), Some(&Value::String("sally@x.com".into())));
    assert_eq!(sally.value(":user/age"), Some(&Value::Long(34)));
    assert_eq!(result.columns, vec!["(pull ?e [:user/email :user/age])".to_string()]);
}

#[test]
fn pulling_declared_attributes_round_trips_the_inserted_map() {
    let db = Database::new(PersistenceMode::InMemory).unwrap();
    db.declare_attributes(vec![
        AttributeSpec::new(":item/name", ValueType::String, Cardinality::One),
        AttributeSpec::new(":item/price", ValueType::Long, Cardinality::One),
        AttributeSpec::new(":item/tags", ValueType::Keyword, Cardinality::Many),
        AttributeSpec::new(":item/discontinued", ValueType::Boolean, Cardinality::One),
    ])
    .unwrap();
    let report = db
        .insert(vec![EntityMap::new()
            .with(":item/name", "lamp")
            .with(":item/price", 40)
            .with_many(
                ":item/tags",
                vec![
                    factbase::datatype::Datum::Keyword(":home".into()),
                    factbase::datatype::Datum::Keyword(":light".into()),
                ],
            )
            .with(":item/discontinued", false)])
        .unwrap();
    let lamp = report.entities[0];
    let pulled = db
        .pull(
            lamp,
            &PullPattern::attributes(&[":db/id", ":item/name", ":item/price", ":item/tags", ":item/discontinued"]),
        )
        .unwrap();
    assert_eq!(pulled.id(), lamp);
    assert!(pulled.get(":db/id").is_none());
    assert_eq!(pulled.len(), 4);
    assert_eq!(pulled.value(":item/name"), Some(&Value::String("lamp".into())));
    assert_eq!(pulled.value(":item/price"), Some(&Value::Long(40)));
    assert_eq!(pulled.value(":item/discontinued"), Some(&Value::Boolean(false)));
    assert_eq!(
        pulled.values(":item/tags"),
        vec![&Value::Keyword(":home".into()), &Value::Keyword(":light".into())]
    );
    // the wildcard gives the same view
    assert_eq!(db.entity(lamp).unwrap().unwrap(), pulled);
}

#[test]
fn attributes_without_values_are_left_out() {
    let engine = setup();
    engine.execute(r#"[{:user/email "solo@x.com"}]"#).unwrap();
    let result = engine
        .execute_collect("[:find (pull ?e [:user/email :user/age]) :where [?e :user/email _]]")
        .unwrap()
        .unwrap();
    let solo = result.entities()[0];
    assert_eq!(solo.len(), 1);
    assert!(solo.get(":user/age").is_none());
}

#[test]
fn nested_pull_follows_references() {
    let engine = setup();
    engine
        .execute(
            r#"[{:db/id #db/id[:db.part/user -1] :user/email "sally@x.com" :user/friend #{#db/id[:db.part/user -2]}}
                {:db/id #db/id[:db.part/user -2] :user/email "frank@x.com" :user/age 14}]"#,
        )
        .unwrap();
    let result = engine
        .execute_collect(
            r#"[:find (pull ?e [:user/email {:user/friend [:user/email :user/age]}])
                :where [?e :user/email "sally@x.com"]]"#,
        )
        .unwrap()
        .unwrap();
    let sally = result.entities()[0];
    let Some(Pulled::Many(friends)) = sally.get(":user/friend") else {
        panic!("expected many friends");
    };
    let frank = match &friends[0] {
        PulledValue::Entity(frank) => frank,
        other => panic!("expected a pulled entity, got {:?}", other),
    };
    assert_eq!(frank.value(":user/email"), Some(&Value::String("frank@x.com".into())));
    assert_eq!(frank.value(":user/age"), Some(&Value::Long(14)));

    let json = result.to_json();
    assert_eq!(json["rows"][0][0][":user/friend"][0][":user/email"], "frank@x.com");
}

#[test]
fn nested_pull_needs_a_reference() {
    let engine = setup();
    let err = engine
        .execute_collect("[:find (pull ?e [{:user/email [*]}]) :where [?e :user/email _]]")
        .unwrap_err();
    assert!(matches!(err, FactbaseError::TypeMismatch(_)));
}

#[test]
fn wildcard_pull_without_facts_is_empty() {
    let db = Database::new(PersistenceMode::InMemory).unwrap();
    assert_eq!(db.entity(424242).unwrap(), None);
    let pulled = db.pull(424242, &PullPattern::new(vec![PullElement::Wildcard])).unwrap();
    assert!(pulled.is_empty());
}
