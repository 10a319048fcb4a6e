//! Preparation of insertion batches and schema declarations.
//!
//! A batch is validated in full against the keepers before anything is
//! generated or stored. The outcome of a successful preparation is a plan in
//! which new entities are numbered slots; the database hands out permanent
//! things for the slots when it commits the plan.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::construct::{
    Attribute, AttributeKeeper, FactKeeper, Thing, ThingGenerator, DB_CARDINALITY, DB_DOC, DB_ID,
    DB_IDENT, DB_VALUE_TYPE,
};
use crate::datatype::{is_keyword, Cardinality, Datum, Value, ValueType};
use crate::error::{FactbaseError, Result};

/// Accepted in schema records for compatibility with older schema files, and ignored.
pub const DB_INSTALL_ATTRIBUTE: &str = ":db.install/_attribute";

// ------------- Schema records -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSpec {
    pub ident: String,
    pub value_type: ValueType,
    pub cardinality: Cardinality,
    pub doc: Option<String>,
}

impl AttributeSpec {
    pub fn new(ident: impl Into<String>, value_type: ValueType, cardinality: Cardinality) -> Self {
        Self {
            ident: ident.into(),
            value_type,
            cardinality,
            doc: None,
        }
    }
    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }
    /// Reads a schema record written as an entity map, such as
    /// `{:db/ident :user/email :db/valueType :db.type/string :db/cardinality :db.cardinality/one}`.
    /// A missing cardinality defaults to one.
    pub fn from_map(map: &EntityMap) -> Result<AttributeSpec> {
        let mut ident = None;
        let mut value_type = None;
        let mut cardinality = Cardinality::One;
        let mut doc = None;
        for (key, assignment) in map.assignments() {
            let datum = match assignment {
                Assignment::One(datum) => datum,
                Assignment::Many(_) => {
                    return Err(FactbaseError::CardinalityViolation(format!(
                        "{} takes a single value in a schema record",
                        key
                    )));
                }
            };
            match key.as_str() {
                DB_IDENT => ident = Some(keyword_of(key, datum)?),
                DB_VALUE_TYPE => {
                    let name = keyword_of(key, datum)?;
                    value_type = Some(ValueType::from_ident(&name).ok_or_else(|| {
                        FactbaseError::TypeMismatch(format!("unknown value type {}", name))
                    })?);
                }
                DB_CARDINALITY => {
                    let name = keyword_of(key, datum)?;
                    cardinality = Cardinality::from_ident(&name).ok_or_else(|| {
                        FactbaseError::TypeMismatch(format!("unknown cardinality {}", name))
                    })?;
                }
                DB_DOC => match datum {
                    Datum::String(s) => doc = Some(s.clone()),
                    other => {
                        return Err(FactbaseError::TypeMismatch(format!(
                            "{} must be a string, got {}",
                            DB_DOC, other
                        )));
                    }
                },
                DB_INSTALL_ATTRIBUTE => (),
                other => return Err(FactbaseError::UndeclaredAttribute(other.to_string())),
            }
        }
        let ident = ident.ok_or_else(|| {
            FactbaseError::TypeMismatch(format!("schema record without {}", DB_IDENT))
        })?;
        let value_type = value_type.ok_or_else(|| {
            FactbaseError::TypeMismatch(format!("{} declares no {}", ident, DB_VALUE_TYPE))
        })?;
        Ok(AttributeSpec {
            ident,
            value_type,
            cardinality,
            doc,
        })
    }
    fn describe(&self) -> String {
        format!("{} {}", self.value_type, self.cardinality)
    }
}

fn keyword_of(key: &str, datum: &Datum) -> Result<String> {
    match datum {
        Datum::Keyword(k) => Ok(k.clone()),
        other => Err(FactbaseError::TypeMismatch(format!(
            "{} must be a keyword, got {}",
            key, other
        ))),
    }
}

fn is_reserved(ident: &str) -> bool {
    ident.starts_with(":db/") || ident.starts_with(":db.")
}

// ------------- Entity maps -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    One(Datum),
    Many(Vec<Datum>),
}

impl Assignment {
    pub fn data(&self) -> &[Datum] {
        match self {
            Assignment::One(datum) => std::slice::from_ref(datum),
            Assignment::Many(data) => data,
        }
    }
}

/// An entity as written in an insertion batch: an optional `:db/id` (a
/// negative temporary id or an existing permanent id) and attribute
/// assignments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityMap {
    id: Option<Datum>,
    assignments: Vec<(String, Assignment)>,
}

impl EntityMap {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_id(mut self, id: impl Into<Datum>) -> Self {
        self.id = Some(id.into());
        self
    }
    pub fn with(self, ident: impl Into<String>, datum: impl Into<Datum>) -> Self {
        self.assign(ident.into(), Assignment::One(datum.into()))
    }
    pub fn with_many(self, ident: impl Into<String>, data: Vec<Datum>) -> Self {
        self.assign(ident.into(), Assignment::Many(data))
    }
    pub fn assign(mut self, ident: String, assignment: Assignment) -> Self {
        match (ident.as_str(), assignment) {
            (DB_ID, Assignment::One(datum)) => self.id = Some(datum),
            (_, assignment) => self.assignments.push((ident, assignment)),
        }
        self
    }
    pub fn id(&self) -> Option<&Datum> {
        self.id.as_ref()
    }
    pub fn assignments(&self) -> &[(String, Assignment)] {
        &self.assignments
    }
    pub fn get(&self, ident: &str) -> Option<&Assignment> {
        self.assignments
            .iter()
            .find(|(key, _)| key == ident)
            .map(|(_, assignment)| assignment)
    }
    /// Maps naming a `:db/ident` are attribute declarations.
    pub fn is_schema(&self) -> bool {
        self.get(DB_IDENT).is_some()
    }
}

// ------------- Reports -------------
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxReport {
    /// The transaction entity, None when the batch added nothing.
    pub tx: Option<Thing>,
    /// Temporary ids mapped to the permanent things they became.
    pub tempids: BTreeMap<i64, Thing>,
    /// One thing per map in the batch, in batch order.
    pub entities: Vec<Thing>,
    /// Number of facts added, including the transaction instant.
    pub datoms: usize,
}

impl TxReport {
    pub fn resolve_tempid(&self, tempid: i64) -> Option<Thing> {
        self.tempids.get(&tempid).copied()
    }
}

// ------------- Preparation -------------
/// Validates schema records against the kept attributes and returns the ones
/// that are new. Identical redeclarations are dropped.
pub fn prepare_schema(
    keeper: &AttributeKeeper,
    specs: Vec<AttributeSpec>,
) -> Result<Vec<AttributeSpec>> {
    let mut fresh: Vec<AttributeSpec> = Vec::new();
    for spec in specs {
        if !is_keyword(&spec.ident) {
            return Err(FactbaseError::TypeMismatch(format!(
                "attribute name {} is not a keyword",
                spec.ident
            )));
        }
        if is_reserved(&spec.ident) {
            return Err(FactbaseError::ReservedAttribute(spec.ident));
        }
        if let Some(existing) = keeper.get(&spec.ident) {
            if !existing.compatible_with(&spec) {
                return Err(FactbaseError::SchemaConflict {
                    existing: format!("{} {}", existing.value_type(), existing.cardinality()),
                    requested: spec.describe(),
                    ident: spec.ident,
                });
            }
            continue;
        }
        if let Some(seen) = fresh.iter().find(|seen| seen.ident == spec.ident) {
            if seen.value_type != spec.value_type || seen.cardinality != spec.cardinality {
                return Err(FactbaseError::SchemaConflict {
                    existing: seen.describe(),
                    requested: spec.describe(),
                    ident: spec.ident,
                });
            }
            continue;
        }
        fresh.push(spec);
    }
    Ok(fresh)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    New(usize),
    Existing(Thing),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Pending {
    Value(Value),
    Temp(i64),
}

enum Target {
    Temp(i64),
    Existing(Thing),
}

fn target_of(datum: &Datum) -> Result<Target> {
    match datum {
        Datum::TempId(n) | Datum::Long(n) if *n < 0 => Ok(Target::Temp(*n)),
        Datum::TempId(n) => Err(FactbaseError::InvalidTempId(format!(
            "{} is not negative",
            n
        ))),
        Datum::Long(n) if *n > 0 => Ok(Target::Existing(*n as Thing)),
        Datum::Long(n) => Err(FactbaseError::InvalidTempId(format!(
            "{} is neither a temporary nor a permanent id",
            n
        ))),
        other => Err(FactbaseError::TypeMismatch(format!(
            "{} cannot identify an entity",
            other
        ))),
    }
}

pub struct InsertPlan {
    new_entities: usize,
    tempids: BTreeMap<i64, usize>,
    entities: Vec<Slot>,
    facts: Vec<(Slot, Arc<Attribute>, Pending)>,
}

pub struct Resolved {
    pub facts: Vec<(Thing, Arc<Attribute>, Value)>,
    pub tempids: BTreeMap<i64, Thing>,
    pub entities: Vec<Thing>,
}

impl InsertPlan {
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
    pub fn new_entities(&self) -> usize {
        self.new_entities
    }
    /// Substitutes permanent things for the slots, `slots[i]` being the
    /// thing of the i-th new entity.
    pub fn resolve(&self, slots: &[Thing]) -> Resolved {
        let thing_of = |slot: &Slot| match slot {
            Slot::New(i) => slots[*i],
            Slot::Existing(thing) => *thing,
        };
        let tempids: BTreeMap<i64, Thing> = self
            .tempids
            .iter()
            .map(|(tempid, i)| (*tempid, slots[*i]))
            .collect();
        let facts = self
            .facts
            .iter()
            .map(|(slot, attribute, pending)| {
                let value = match pending {
                    Pending::Value(value) => value.clone(),
                    Pending::Temp(tempid) => Value::Ref(slots[self.tempids[tempid]]),
                };
                (thing_of(slot), Arc::clone(attribute), value)
            })
            .collect();
        Resolved {
            facts,
            tempids,
            entities: self.entities.iter().map(thing_of).collect(),
        }
    }
}

/// Validates an insertion batch and plans its facts.
pub fn prepare_insert(
    attributes: &AttributeKeeper,
    facts: &FactKeeper,
    generator: &ThingGenerator,
    maps: Vec<EntityMap>,
) -> Result<InsertPlan> {
    let mut plan = InsertPlan {
        new_entities: 0,
        tempids: BTreeMap::new(),
        entities: Vec::with_capacity(maps.len()),
        facts: Vec::new(),
    };

    // every map gets its slot first, so references may point forward in the batch
    for map in &maps {
        let slot = match map.id().map(target_of).transpose()? {
            None => {
                plan.new_entities += 1;
                Slot::New(plan.new_entities - 1)
            }
            Some(Target::Temp(tempid)) => {
                let next = plan.new_entities;
                let i = *plan.tempids.entry(tempid).or_insert(next);
                if i == next {
                    plan.new_entities += 1;
                }
                Slot::New(i)
            }
            Some(Target::Existing(thing)) => {
                generator.check(thing).ok_or_else(|| {
                    FactbaseError::UnresolvedReference(format!("entity {} does not exist", thing))
                })?;
                Slot::Existing(thing)
            }
        };
        plan.entities.push(slot);
    }

    let mut seen: HashSet<(Slot, Thing, Pending)> = HashSet::new();
    let mut single: HashMap<(Slot, Thing), Pending> = HashMap::new();
    for (map, slot) in maps.iter().zip(plan.entities.clone()) {
        for (ident, assignment) in map.assignments() {
            let attribute = attributes
                .get(ident)
                .ok_or_else(|| FactbaseError::UndeclaredAttribute(ident.clone()))?;
            if attribute.reserved() {
                return Err(FactbaseError::ReservedAttribute(ident.clone()));
            }
            let data = assignment.data();
            if attribute.cardinality() == Cardinality::One && data.len() > 1 {
                return Err(FactbaseError::CardinalityViolation(format!(
                    "{} holds one value, {} given",
                    ident,
                    data.len()
                )));
            }
            for datum in data {
                let pending = pending_value(&plan, generator, &attribute, datum)?;
                if attribute.cardinality() == Cardinality::One {
                    check_single(facts, &mut single, slot, &attribute, &pending)?;
                }
                if seen.insert((slot, attribute.attribute(), pending.clone())) {
                    plan.facts.push((slot, Arc::clone(&attribute), pending));
                }
            }
        }
    }
    Ok(plan)
}

fn pending_value(
    plan: &InsertPlan,
    generator: &ThingGenerator,
    attribute: &Attribute,
    datum: &Datum,
) -> Result<Pending> {
    if attribute.value_type() != ValueType::Ref {
        return Ok(Pending::Value(datum.coerce(attribute.value_type())?));
    }
    match target_of(datum)? {
        Target::Temp(tempid) => {
            if plan.tempids.contains_key(&tempid) {
                Ok(Pending::Temp(tempid))
            } else {
                Err(FactbaseError::UnresolvedReference(format!(
                    "temporary id {} in {} is not the id of any entity in the batch",
                    tempid,
                    attribute.ident()
                )))
            }
        }
        Target::Existing(thing) => generator
            .check(thing)
            .map(|thing| Pending::Value(Value::Ref(thing)))
            .ok_or_else(|| {
                FactbaseError::UnresolvedReference(format!(
                    "{} refers to entity {} which does not exist",
                    attribute.ident(),
                    thing
                ))
            }),
    }
}

fn check_single(
    facts: &FactKeeper,
    single: &mut HashMap<(Slot, Thing), Pending>,
    slot: Slot,
    attribute: &Arc<Attribute>,
    pending: &Pending,
) -> Result<()> {
    let violation = || {
        FactbaseError::CardinalityViolation(format!(
            "{} holds one value per entity",
            attribute.ident()
        ))
    };
    match single.get(&(slot, attribute.attribute())) {
        Some(other) if other != pending => return Err(violation()),
        Some(_) => return Ok(()),
        None => (),
    }
    if let Slot::Existing(thing) = slot {
        let existing = facts.values(thing, attribute.attribute());
        let unchanged = match pending {
            Pending::Value(value) => existing.iter().all(|v| v == value),
            Pending::Temp(_) => existing.is_empty(),
        };
        if !unchanged {
            return Err(violation());
        }
    }
    single.insert((slot, attribute.attribute()), pending.clone());
    Ok(())
}
