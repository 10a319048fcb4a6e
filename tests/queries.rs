use factbase::construct::{Database, PersistenceMode, Thing};
use factbase::datalog::{Engine, Outcome};
use factbase::datatype::Value;
use factbase::error::FactbaseError;
use factbase::query::{FindElement, Operator, Query, Term};

const SCHEMA: &str = "
    [{:db/ident :user/email :db/valueType :db.type/string}
     {:db/ident :user/age :db/valueType :db.type/long}
     {:db/ident :user/score :db/valueType :db.type/bigdec}
     {:db/ident :user/nickname :db/valueType :db.type/string}
     {:db/ident :user/joined :db/valueType :db.type/instant}]
";

fn setup() -> (Engine<'static>, Vec<Thing>) {
    let db = Database::new(PersistenceMode::InMemory).unwrap();
    let engine = Engine::new(Box::leak(Box::new(db)));
    engine.execute(SCHEMA).unwrap();
    let outcomes = engine
        .execute(
            r#"[{:user/email "sally@x.com" :user/age 34 :user/score 9.5M :user/joined #inst "2019-03-01"}
                {:user/email "frank@x.com" :user/age 14 :user/nickname "frankie"}
                {:user/email "ada@x.com" :user/age 21 :user/score 7 :user/joined #inst "2021-06-15T12:00:00Z"}
                {:user/nickname "ghost"}]"#,
        )
        .unwrap();
    let entities = match outcomes.into_iter().last() {
        Some(Outcome::Transacted(report)) => report.entities,
        other => panic!("expected a transaction report, got {:?}", other),
    };
    (engine, entities)
}

fn first_column(engine: &Engine, query: &str) -> Vec<Value> {
    engine
        .execute_collect(query)
        .expect("query ok")
        .expect("a result")
        .values()
        .into_iter()
        .map(|mut row| row.remove(0))
        .collect()
}

#[test]
fn wildcard_value_returns_every_holder_of_the_attribute() {
    let (engine, entities) = setup();
    let holders = first_column(&engine, "[:find ?e :where [?e :user/email _]]");
    assert_eq!(
        holders,
        vec![Value::Ref(entities[0]), Value::Ref(entities[1]), Value::Ref(entities[2])]
    );
    let nicknamed = first_column(&engine, "[:find ?e :where [?e :user/nickname]]");
    assert_eq!(nicknamed, vec![Value::Ref(entities[1]), Value::Ref(entities[3])]);
}

#[test]
fn numeric_predicate_filters_bindings() {
    let (engine, _) = setup();
    let adults = first_column(
        &engine,
        "[:find ?email :where [?e :user/age ?age] [(>= ?age 21)] [?e :user/email ?email]]",
    );
    assert_eq!(
        adults,
        vec![Value::String("ada@x.com".into()), Value::String("sally@x.com".into())]
    );
    let strictly = first_column(
        &engine,
        "[:find ?email :where [?e :user/age ?age] [(> ?age 21)] [?e :user/email ?email]]",
    );
    assert_eq!(strictly, vec![Value::String("sally@x.com".into())]);
}

#[test]
fn longs_and_decimals_compare_numerically() {
    let (engine, _) = setup();
    let high = first_column(
        &engine,
        "[:find ?email :where [?e :user/score ?s] [(> ?s 8)] [?e :user/email ?email]]",
    );
    assert_eq!(high, vec![Value::String("sally@x.com".into())]);
    let exact = first_column(&engine, "[:find ?e :where [?e :user/score 7]]");
    assert_eq!(exact.len(), 1);
}

#[test]
fn instants_compare_chronologically() {
    let (engine, _) = setup();
    let recent = first_column(
        &engine,
        r#"[:find ?email :where [?e :user/joined ?t] [(> ?t #inst "2020-01-01")] [?e :user/email ?email]]"#,
    );
    assert_eq!(recent, vec![Value::String("ada@x.com".into())]);
}

#[test]
fn constants_join_on_values() {
    let (engine, entities) = setup();
    let sally = first_column(&engine, r#"[:find ?e :where [?e :user/email "sally@x.com"]]"#);
    assert_eq!(sally, vec![Value::Ref(entities[0])]);
    let ages = first_column(
        &engine,
        &format!("[:find ?age :where [{} :user/age ?age]]", entities[1]),
    );
    assert_eq!(ages, vec![Value::Long(14)]);
}

#[test]
fn results_are_sets() {
    let (engine, _) = setup();
    // every adult has several facts, the projection keeps one row per age
    let ages = first_column(&engine, "[:find ?age :where [?e :user/age ?age] [?e ?a _]]");
    assert_eq!(ages, vec![Value::Long(14), Value::Long(21), Value::Long(34)]);
}

#[test]
fn attribute_variables_bind_attribute_entities() {
    let (engine, entities) = setup();
    let result = engine
        .execute_collect(&format!(
            "[:find ?ident :where [{} ?a _] [?a :db/ident ?ident]]",
            entities[1]
        ))
        .unwrap()
        .unwrap();
    let idents: Vec<Value> = result.values().into_iter().map(|mut r| r.remove(0)).collect();
    assert_eq!(
        idents,
        vec![
            Value::Keyword(":user/age".into()),
            Value::Keyword(":user/email".into()),
            Value::Keyword(":user/nickname".into()),
        ]
    );
}

#[test]
fn limit_truncates_and_flags() {
    let (engine, _) = setup();
    let result = engine
        .execute_collect("[:find ?e :where [?e :user/email _] :limit 2]")
        .unwrap()
        .unwrap();
    assert_eq!(result.row_count, 2);
    assert!(result.limited);
    let result = engine
        .execute_collect("[:find ?e :where [?e :user/email _] :limit 10]")
        .unwrap()
        .unwrap();
    assert_eq!(result.row_count, 3);
    assert!(!result.limited);
}

#[test]
fn unknown_attribute_in_a_pattern() {
    let (engine, _) = setup();
    let err = engine
        .execute_collect("[:find ?e :where [?e :user/shoe-size _]]")
        .unwrap_err();
    assert!(matches!(err, FactbaseError::UnknownAttribute(ref a) if a == ":user/shoe-size"));
    let err = engine
        .execute_collect("[:find (pull ?e [:user/shoe-size]) :where [?e :user/email _]]")
        .unwrap_err();
    assert!(matches!(err, FactbaseError::UnknownAttribute(_)));
}

#[test]
fn predicates_need_bound_variables() {
    let (engine, _) = setup();
    let err = engine
        .execute_collect("[:find ?e :where [(> ?age 21)] [?e :user/age ?age]]")
        .unwrap_err();
    assert!(matches!(err, FactbaseError::UnknownVariable(_)));
    let err = engine
        .execute_collect("[:find ?x :where [?e :user/age _]]")
        .unwrap_err();
    assert!(matches!(err, FactbaseError::UnknownVariable(_)));
}

#[test]
fn ordering_across_types_is_an_error() {
    let (engine, _) = setup();
    let err = engine
        .execute_collect("[:find ?e :where [?e :user/email ?m] [(< ?m 5)]]")
        .unwrap_err();
    assert!(matches!(err, FactbaseError::TypeMismatch(_)));
    // equality across types simply fails to match
    let none = first_column(&engine, "[:find ?e :where [?e :user/email ?m] [(= ?m 5)]]");
    assert!(none.is_empty());
}

#[test]
fn wildcard_in_a_predicate_is_rejected() {
    let (engine, _) = setup();
    let err = engine
        .execute_collect("[:find ?e :where [?e :user/age ?age] [(> _ 21)]]")
        .unwrap_err();
    assert!(matches!(err, FactbaseError::InvalidQuery(_)));
    assert!(err.is_rejection());
}

#[test]
fn queries_built_in_code() {
    let (engine, _) = setup();
    let query = Query::new(vec![FindElement::var("?email")])
        .pattern(Term::var("?e"), Term::attr(":user/age"), Term::var("?age"))
        .predicate(Operator::Lt, Term::var("?age"), Term::constant(18))
        .pattern(Term::var("?e"), Term::attr(":user/email"), Term::var("?email"));
    let result = engine
        .execute_collect(&query.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(result.values(), vec![vec![Value::String("frank@x.com".into())]]);
    assert_eq!(result.columns, vec!["?email".to_string()]);
}

#[test]
fn several_queries_in_one_script() {
    let (engine, _) = setup();
    let results = engine
        .execute_collect_multi(
            "[:find ?e :where [?e :user/email _]]
             ; a comment between commands
             [:find ?n :where [_ :user/nickname ?n]]",
        )
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].row_count, 3);
    assert_eq!(results[1].row_count, 2);
}
