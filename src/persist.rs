// used for persistence
use rusqlite::{params, Connection, Error, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;

// the ledger is a chain of transaction hashes
use chrono::NaiveDateTime;

use tracing::{debug, info, warn};

use crate::construct::{Attribute, Database, Fact, PersistenceMode, Thing};
use crate::datatype::{format_instant, parse_instant, Cardinality, Value, ValueType};
use crate::error::{FactbaseError, Result};

// ------------- Persistence -------------
#[derive(Debug)]
pub struct Persistor {
    // None when the database only lives in memory
    connection: Option<Connection>,
    superhash: Option<String>,
}

/// One verified row of the transaction ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub tx: Thing,
    pub instant: NaiveDateTime,
    pub hash: String,
    pub superhash: String,
}

impl Persistor {
    pub fn new(mode: &PersistenceMode) -> Result<Persistor> {
        let connection = match mode {
            PersistenceMode::InMemory => None,
            PersistenceMode::File(path) => Some(Connection::open(path)?),
        };
        if let Some(connection) = &connection {
            // The "STRICT" keyword introduced in 3.37.0 breaks JDBC connections, which makes
            // debugging using an external tool like DBeaver impossible
            connection.execute_batch(
                "
            create table if not exists Thing (
                Thing_Identity integer not null,
                constraint unique_and_referenceable_Thing_Identity primary key (
                    Thing_Identity
                )
            );-- STRICT;
            create table if not exists Attribute (
                Attribute_Identity integer not null,
                Ident text not null,
                ValueType text not null,
                Cardinality text not null,
                Doc text null,
                Reserved integer not null,
                constraint Attribute_is_Thing foreign key (
                    Attribute_Identity
                ) references Thing(Thing_Identity),
                constraint referenceable_Attribute_Identity primary key (
                    Attribute_Identity
                ),
                constraint unique_Ident unique (
                    Ident
                )
            );-- STRICT;
            create table if not exists Fact (
                Entity integer not null,
                Attribute integer not null,
                FactValue any null,
                Transaction_Identity integer not null,
                constraint Entity_is_Thing foreign key (
                    Entity
                ) references Thing(Thing_Identity),
                constraint Fact_has_Attribute foreign key (
                    Attribute
                ) references Attribute(Attribute_Identity),
                constraint unique_Fact unique (
                    Entity,
                    Attribute,
                    FactValue
                )
            );-- STRICT;
            create table if not exists Ledger (
                Transaction_Identity integer not null,
                TransactionTime text not null,
                Hash text not null,
                Superhash text not null,
                constraint Transaction_is_Thing foreign key (
                    Transaction_Identity
                ) references Thing(Thing_Identity),
                constraint referenceable_Transaction_Identity primary key (
                    Transaction_Identity
                )
            );-- STRICT;
            ",
            )?;
        }
        let mut persistor = Persistor {
            connection,
            superhash: None,
        };
        persistor.superhash = persistor.latest_superhash()?;
        Ok(persistor)
    }

    /// The head of the ledger chain. Always None for an in-memory database.
    pub fn current_superhash(&self) -> Option<String> {
        self.superhash.clone()
    }

    fn latest_superhash(&self) -> Result<Option<String>> {
        let Some(connection) = &self.connection else {
            return Ok(None);
        };
        let superhash = connection
            .prepare_cached(
                "
                select Superhash
                    from Ledger
                    order by Transaction_Identity desc
                    limit 1
            ",
            )?
            .query_row([], |r| r.get::<_, String>(0))
            .optional()?;
        Ok(superhash)
    }

    pub fn persist_thing(&mut self, thing: &Thing) -> Result<bool> {
        let Some(connection) = &self.connection else {
            return Ok(false);
        };
        let mut existing = false;
        match connection
            .prepare_cached(
                "
                select Thing_Identity
                    from Thing
                    where Thing_Identity = ?
            ",
            )?
            .query_row::<i64, _, _>(params![*thing as i64], |r| r.get(0))
        {
            Ok(_) => {
                existing = true;
            }
            Err(Error::QueryReturnedNoRows) => {
                connection
                    .prepare_cached(
                        "
                    insert into Thing (
                        Thing_Identity
                    ) values (?)
                ",
                    )?
                    .execute(params![*thing as i64])?;
            }
            Err(err) => {
                return Err(FactbaseError::Persistence(format!(
                    "Could not check if the thing '{}' is persisted: {}",
                    thing, err
                )));
            }
        }
        Ok(existing)
    }

    pub fn persist_attribute(&mut self, attribute: &Attribute) -> Result<bool> {
        let Some(connection) = &self.connection else {
            return Ok(false);
        };
        insert_attribute(connection, attribute)
    }

    /// Writes one committed batch atomically: its new things, attributes and
    /// facts, and a ledger row chaining the batch hash onto the previous one.
    pub fn persist_transaction(
        &mut self,
        tx: Thing,
        instant: &NaiveDateTime,
        things: &[Thing],
        attributes: &[Arc<Attribute>],
        facts: &[Arc<Fact>],
    ) -> Result<()> {
        let hash = transaction_hash(tx, instant, facts);
        let superhash = chain(self.superhash.as_deref(), &hash);
        if let Some(connection) = &mut self.connection {
            let transaction = connection.transaction()?;
            {
                let mut add_thing = transaction.prepare_cached(
                    "
                    insert or ignore into Thing (
                        Thing_Identity
                    ) values (?)
                ",
                )?;
                for thing in things {
                    add_thing.execute(params![*thing as i64])?;
                }
                for attribute in attributes {
                    insert_attribute(&transaction, attribute)?;
                }
                let mut add_fact = transaction.prepare_cached(
                    "
                    insert or ignore into Fact (
                        Entity,
                        Attribute,
                        FactValue,
                        Transaction_Identity
                    ) values (?, ?, ?, ?)
                ",
                )?;
                for fact in facts {
                    add_fact.execute(params![
                        fact.entity() as i64,
                        fact.attribute().attribute() as i64,
                        fact.value(),
                        fact.tx() as i64
                    ])?;
                }
                transaction
                    .prepare_cached(
                        "
                    insert into Ledger (
                        Transaction_Identity,
                        TransactionTime,
                        Hash,
                        Superhash
                    ) values (?, ?, ?, ?)
                ",
                    )?
                    .execute(params![tx as i64, format_instant(instant), &hash, &superhash])?;
            }
            transaction.commit()?;
            debug!(tx, facts = facts.len(), superhash = %superhash, "persisted transaction");
            self.superhash = Some(superhash);
        }
        Ok(())
    }

    pub fn restore_things(&self, db: &Database) -> Result<()> {
        let Some(connection) = &self.connection else {
            return Ok(());
        };
        let mut statement = connection.prepare_cached(
            "
            select Thing_Identity
                from Thing
        ",
        )?;
        let things = statement.query_map([], |row| row.get::<_, i64>(0))?;
        let mut generator = db.thing_generator.lock()?;
        for thing in things {
            generator.retain(thing? as Thing);
        }
        debug!(things = generator.len(), "restored things");
        Ok(())
    }

    pub fn restore_attributes(&self, db: &Database) -> Result<()> {
        let Some(connection) = &self.connection else {
            return Ok(());
        };
        let mut statement = connection.prepare_cached(
            "
            select Attribute_Identity, Ident, ValueType, Cardinality, Doc, Reserved
                from Attribute
        ",
        )?;
        let mut rows = statement.query([])?;
        let mut keeper = db.attribute_keeper.lock()?;
        while let Some(row) = rows.next()? {
            let ident: String = row.get(1)?;
            let value_type: String = row.get(2)?;
            let cardinality: String = row.get(3)?;
            let value_type = ValueType::from_ident(&value_type).ok_or_else(|| {
                FactbaseError::DataCorruption {
                    message: format!("attribute {} has unknown value type {}", ident, value_type),
                }
            })?;
            let cardinality = Cardinality::from_ident(&cardinality).ok_or_else(|| {
                FactbaseError::DataCorruption {
                    message: format!("attribute {} has unknown cardinality {}", ident, cardinality),
                }
            })?;
            keeper.keep(Attribute::new(
                row.get::<_, i64>(0)? as Thing,
                ident,
                value_type,
                cardinality,
                row.get(4)?,
                row.get(5)?,
            ));
        }
        debug!(attributes = keeper.len(), "restored attributes");
        Ok(())
    }

    pub fn restore_facts(&self, db: &Database) -> Result<()> {
        let Some(connection) = &self.connection else {
            return Ok(());
        };
        let mut statement = connection.prepare_cached(
            "
            select Entity, Attribute, FactValue, Transaction_Identity
                from Fact
        ",
        )?;
        let mut rows = statement.query([])?;
        let attributes = db.attribute_keeper.lock()?;
        let mut keeper = db.fact_keeper.lock()?;
        while let Some(row) = rows.next()? {
            let attribute: Thing = row.get::<_, i64>(1)? as Thing;
            let attribute = attributes.lookup(attribute).ok_or_else(|| {
                FactbaseError::DataCorruption {
                    message: format!("fact refers to unknown attribute {}", attribute),
                }
            })?;
            let value = Value::from_sql(attribute.value_type(), row.get_ref(2)?)?;
            keeper.keep(Fact::new(
                row.get::<_, i64>(0)? as Thing,
                attribute,
                value,
                row.get::<_, i64>(3)? as Thing,
            ));
        }
        info!(facts = keeper.len(), "restored facts");
        Ok(())
    }

    /// Recomputes every ledger hash from the stored facts and checks the
    /// chain. Returns the verified entries in transaction order.
    pub fn verify_ledger(&self, db: &Database) -> Result<Vec<LedgerEntry>> {
        let Some(connection) = &self.connection else {
            return Ok(Vec::new());
        };
        let mut by_tx: HashMap<Thing, Vec<Arc<Fact>>> = HashMap::new();
        for fact in db.fact_keeper.lock()?.iter() {
            by_tx.entry(fact.tx()).or_default().push(Arc::clone(fact));
        }
        let mut statement = connection.prepare_cached(
            "
            select Transaction_Identity, TransactionTime, Hash, Superhash
                from Ledger
                order by Transaction_Identity
        ",
        )?;
        let mut rows = statement.query([])?;
        let mut entries = Vec::new();
        let mut previous: Option<String> = None;
        while let Some(row) = rows.next()? {
            let tx = row.get::<_, i64>(0)? as Thing;
            let time: String = row.get(1)?;
            let instant = parse_instant(&time).ok_or_else(|| FactbaseError::DataCorruption {
                message: format!("transaction {} has invalid time '{}'", tx, time),
            })?;
            let stored_hash: String = row.get(2)?;
            let stored_superhash: String = row.get(3)?;
            let facts = by_tx.remove(&tx).unwrap_or_default();
            let hash = transaction_hash(tx, &instant, &facts);
            if hash != stored_hash {
                warn!(tx, "ledger hash mismatch");
                return Err(FactbaseError::DataCorruption {
                    message: format!("hash of transaction {} does not match its facts", tx),
                });
            }
            let superhash = chain(previous.as_deref(), &hash);
            if superhash != stored_superhash {
                warn!(tx, "ledger chain broken");
                return Err(FactbaseError::DataCorruption {
                    message: format!("ledger chain is broken at transaction {}", tx),
                });
            }
            previous = Some(superhash.clone());
            entries.push(LedgerEntry {
                tx,
                instant,
                hash,
                superhash,
            });
        }
        Ok(entries)
    }
}

fn insert_attribute(connection: &Connection, attribute: &Attribute) -> Result<bool> {
    let existing = connection
        .prepare_cached(
            "
            select Attribute_Identity
                from Attribute
                where Ident = ?
        ",
        )?
        .query_row::<i64, _, _>(params![attribute.ident()], |r| r.get(0))
        .optional()?
        .is_some();
    if !existing {
        connection
            .prepare_cached(
                "
                insert into Attribute (
                    Attribute_Identity,
                    Ident,
                    ValueType,
                    Cardinality,
                    Doc,
                    Reserved
                ) values (?, ?, ?, ?, ?, ?)
            ",
            )?
            .execute(params![
                attribute.attribute() as i64,
                attribute.ident(),
                attribute.value_type().ident(),
                attribute.cardinality().ident(),
                attribute.doc(),
                attribute.reserved()
            ])?;
    }
    Ok(existing)
}

// The hash covers the facts in a canonical order, so it does not depend on
// the order in which they were asserted.
fn transaction_hash(tx: Thing, instant: &NaiveDateTime, facts: &[Arc<Fact>]) -> String {
    let mut lines: Vec<String> = facts
        .iter()
        .map(|fact| {
            format!(
                "{}|{}|{}",
                fact.entity(),
                fact.attribute().ident(),
                fact.value()
            )
        })
        .collect();
    lines.sort();
    let mut hasher = blake3::Hasher::new();
    hasher.update(tx.to_string().as_bytes());
    hasher.update(format_instant(instant).as_bytes());
    for line in &lines {
        hasher.update(b"\n");
        hasher.update(line.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn chain(previous: Option<&str>, hash: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    if let Some(previous) = previous {
        hasher.update(previous.as_bytes());
    }
    hasher.update(hash.as_bytes());
    hasher.finalize().to_hex().to_string()
}
