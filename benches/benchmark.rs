use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use factbase::construct::{Database, PersistenceMode};
use factbase::datatype::{Cardinality, ValueType};
use factbase::query::{FindElement, Operator, PullPattern, Query, Term};
use factbase::transact::{AttributeSpec, EntityMap};

fn populated(entities: usize) -> Database {
    let db = Database::new(PersistenceMode::InMemory).unwrap();
    db.declare_attributes(vec![
        AttributeSpec::new(":user/email", ValueType::String, Cardinality::One),
        AttributeSpec::new(":user/age", ValueType::Long, Cardinality::One),
        AttributeSpec::new(":user/nickname", ValueType::String, Cardinality::One),
    ])
    .unwrap();
    let maps = (0..entities)
        .map(|i| {
            let map = EntityMap::new()
                .with(":user/email", format!("user{}@x.com", i))
                .with(":user/age", (i % 90) as i64);
            if i % 3 == 0 {
                map.with(":user/nickname", format!("nick{}", i))
            } else {
                map
            }
        })
        .collect();
    db.insert(maps).unwrap();
    db
}

fn criterion_benchmark(c: &mut Criterion) {
    let db = populated(10_000);

    let holders = Query::new(vec![FindElement::var("?e")])
        .pattern(Term::var("?e"), Term::attr(":user/nickname"), Term::Wildcard);
    c.bench_function("wildcard holders", |b| {
        b.iter(|| db.query(black_box(&holders)).unwrap())
    });

    let joined = Query::new(vec![FindElement::var("?e")])
        .pattern(Term::var("?e"), Term::attr(":user/nickname"), Term::Wildcard)
        .pattern(Term::var("?e"), Term::attr(":user/age"), Term::var("?age"))
        .predicate(Operator::Ge, Term::var("?age"), Term::constant(21));
    c.bench_function("join with predicate", |b| {
        b.iter(|| db.query(black_box(&joined)).unwrap())
    });

    let pulled = Query::new(vec![FindElement::pull(
        "?e",
        PullPattern::attributes(&[":user/email", ":user/age"]),
    )])
    .pattern(Term::var("?e"), Term::attr(":user/age"), Term::constant(42));
    c.bench_function("pull by value", |b| {
        b.iter(|| db.query(black_box(&pulled)).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
