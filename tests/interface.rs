use std::sync::Arc;

use factbase::construct::{Database, PersistenceMode};
use factbase::datalog::Outcome;
use factbase::error::FactbaseError;
use factbase::interface::ScriptInterface;

fn interface() -> ScriptInterface {
    let db = Database::new(PersistenceMode::InMemory).unwrap();
    let interface = ScriptInterface::new(Arc::new(db));
    interface
        .run_sync("[{:db/ident :user/email :db/valueType :db.type/string}]")
        .unwrap();
    interface
}

#[test]
fn background_script_streams_outcomes() {
    let interface = interface();
    let handle = interface
        .start(
            r#"[{:user/email "a@x.com"} {:user/email "b@x.com"}]
               [:find ?m :where [_ :user/email ?m]]"#
                .to_string(),
        )
        .unwrap();
    let outcomes: Vec<Outcome> = handle.outcomes.iter().collect();
    assert_eq!(handle.join().unwrap(), 2);
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(&outcomes[0], Outcome::Transacted(report) if report.entities.len() == 2));
    match &outcomes[1] {
        Outcome::Rows(result) => assert_eq!(result.row_count, 2),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(interface.running().unwrap(), 0);
}

#[test]
fn failing_script_reports_its_error() {
    let interface = interface();
    let handle = interface
        .start("[{:user/unknown 1}]".to_string())
        .unwrap();
    let err = handle.join().unwrap_err();
    assert!(matches!(err, FactbaseError::UndeclaredAttribute(_)));
}

#[test]
fn cancelling_an_unknown_script_is_a_no_op() {
    let interface = interface();
    let handle = interface.start("[:find ?m :where [_ :user/email ?m]]".to_string()).unwrap();
    let id = handle.id;
    let _ = handle.join();
    assert!(!interface.cancel(id).unwrap());
}
