use std::sync::{Arc, Mutex};

// used to keep the one-to-one mapping between attribute idents and their things
use bimap::BiMap;

// other keepers use HashSet or HashMap
use core::hash::{BuildHasher, BuildHasherDefault, Hasher};
use std::collections::hash_map::RandomState;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::collections::hash_set::Iter;
use std::hash::Hash;
use seahash::SeaHasher;

// entity sets are bitmaps, so intersecting them is cheap
use roaring::RoaringTreemap;

// used to print out readable forms of a construct
use std::fmt;

use tracing::{debug, info};

// our own stuff that we need
use crate::datatype::{now, Cardinality, Value, ValueType};
use crate::error::{FactbaseError, Result};
use crate::persist::Persistor;
use crate::query::{self, PullElement, PullPattern, PulledEntity, Query, QueryResult};
use crate::transact::{self, AttributeSpec, EntityMap, TxReport};

// ------------- Thing -------------
pub type Thing = u64;

pub type ThingHasher = BuildHasherDefault<SeaHasher>;
pub type OtherHasher = BuildHasherDefault<SeaHasher>;

pub const GENESIS: Thing = 0;

#[derive(Debug)]
pub struct ThingGenerator {
    lower_bound: Thing,
    retained: HashSet<Thing, ThingHasher>,
}

impl ThingGenerator {
    pub fn new() -> Self {
        Self {
            lower_bound: GENESIS,
            retained: HashSet::<Thing, ThingHasher>::default(),
        }
    }
    // Things may be explicitly referenced, but only implicitly created.
    // Referencing 42 in a batch fails unless 42 already exists.
    // The retain function is necessary though, when restoring an existing
    // persisted database.
    pub fn retain(&mut self, t: Thing) {
        self.retained.insert(t);
        if t > self.lower_bound {
            self.lower_bound = t;
        }
    }
    pub fn check(&self, t: Thing) -> Option<Thing> {
        self.retained.get(&t).cloned()
    }
    /// The things the next `n` calls to generate will return.
    pub fn upcoming(&self, n: usize) -> Vec<Thing> {
        (1..=n as Thing).map(|i| self.lower_bound + i).collect()
    }
    pub fn generate(&mut self) -> Thing {
        self.lower_bound += 1;
        self.retained.insert(self.lower_bound);
        self.lower_bound
    }
    pub fn iter(&self) -> Iter<'_, Thing> {
        self.retained.iter()
    }
    pub fn len(&self) -> usize {
        self.retained.len()
    }
}

// ------------- Attribute -------------
#[derive(Eq, Debug)]
pub struct Attribute {
    attribute: Thing, // let it be a thing so we can "talk" about attributes using facts
    ident: String,
    value_type: ValueType,
    cardinality: Cardinality,
    doc: Option<String>,
    reserved: bool,
}

impl Attribute {
    pub fn new(
        attribute: Thing,
        ident: String,
        value_type: ValueType,
        cardinality: Cardinality,
        doc: Option<String>,
        reserved: bool,
    ) -> Self {
        Self {
            attribute,
            ident,
            value_type,
            cardinality,
            doc,
            reserved,
        }
    }
    // Fields are only exposed through getters, which keeps
    // attributes immutable once they have been kept.
    pub fn attribute(&self) -> Thing {
        self.attribute
    }
    pub fn ident(&self) -> &str {
        &self.ident
    }
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }
    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }
    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }
    pub fn reserved(&self) -> bool {
        self.reserved
    }
    /// Two declarations are compatible when they agree on type and cardinality.
    pub fn compatible_with(&self, spec: &AttributeSpec) -> bool {
        self.value_type == spec.value_type && self.cardinality == spec.cardinality
    }
}
impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        self.ident == other.ident
    }
}
impl Hash for Attribute {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ident.hash(state);
    }
}
impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} <{} {}>", self.ident, self.value_type, self.cardinality)
    }
}

pub const DB_IDENT: &str = ":db/ident";
pub const DB_VALUE_TYPE: &str = ":db/valueType";
pub const DB_CARDINALITY: &str = ":db/cardinality";
pub const DB_DOC: &str = ":db/doc";
pub const DB_TX_INSTANT: &str = ":db/txInstant";
pub const DB_ID: &str = ":db/id";

/// Attributes the store itself relies on. They are created on first use of a
/// database and cannot be redeclared or used in entity maps.
pub const RESERVED_ATTRIBUTES: [(&str, ValueType, &str); 5] = [
    (DB_IDENT, ValueType::Keyword, "The unique name of an attribute"),
    (DB_VALUE_TYPE, ValueType::Keyword, "The value type of an attribute"),
    (DB_CARDINALITY, ValueType::Keyword, "Whether an attribute holds one or many values"),
    (DB_DOC, ValueType::String, "Documentation string"),
    (DB_TX_INSTANT, ValueType::Instant, "The moment a transaction was committed"),
];

#[derive(Debug, Clone)]
pub struct AttributeKeeper {
    idents: BiMap<String, Thing>,
    kept: HashMap<Thing, Arc<Attribute>, ThingHasher>,
}
impl AttributeKeeper {
    pub fn new() -> Self {
        Self {
            idents: BiMap::new(),
            kept: HashMap::default(),
        }
    }
    pub fn keep(&mut self, attribute: Attribute) -> (Arc<Attribute>, bool) {
        if let Some(thing) = self.idents.get_by_left(attribute.ident()) {
            if let Some(kept) = self.kept.get(thing) {
                return (Arc::clone(kept), true);
            }
        }
        let thing = attribute.attribute();
        let kept = Arc::new(attribute);
        self.idents.insert(kept.ident().to_owned(), thing);
        self.kept.insert(thing, Arc::clone(&kept));
        (kept, false)
    }
    pub fn get(&self, ident: &str) -> Option<Arc<Attribute>> {
        self.idents
            .get_by_left(ident)
            .and_then(|thing| self.kept.get(thing))
            .map(Arc::clone)
    }
    pub fn lookup(&self, attribute: Thing) -> Option<Arc<Attribute>> {
        self.kept.get(&attribute).map(Arc::clone)
    }
    pub fn ident_of(&self, attribute: Thing) -> Option<&str> {
        self.idents.get_by_right(&attribute).map(String::as_str)
    }
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Attribute>> {
        self.kept.values()
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
}

// --------------- Fact ----------------
#[derive(Eq, Debug)]
pub struct Fact {
    entity: Thing,
    attribute: Arc<Attribute>,
    value: Value,
    tx: Thing, // the transaction that asserted the fact
}
impl Fact {
    pub fn new(entity: Thing, attribute: Arc<Attribute>, value: Value, tx: Thing) -> Fact {
        Self {
            entity,
            attribute,
            value,
            tx,
        }
    }
    pub fn entity(&self) -> Thing {
        self.entity
    }
    pub fn attribute(&self) -> Arc<Attribute> {
        Arc::clone(&self.attribute)
    }
    pub fn value(&self) -> &Value {
        &self.value
    }
    pub fn tx(&self) -> Thing {
        self.tx
    }
}
// The transaction is not part of a fact's identity: asserting the same
// (entity, attribute, value) twice yields one fact.
impl PartialEq for Fact {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.attribute.attribute() == other.attribute.attribute()
            && self.value == other.value
    }
}
impl Hash for Fact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.attribute.attribute().hash(state);
        self.value.hash(state);
    }
}
impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{} {} {} {}]",
            self.entity,
            self.attribute.ident(),
            self.value,
            self.tx
        )
    }
}

// ------------- Lookups -------------
#[derive(Debug)]
pub struct Lookup<K, V, H = RandomState> {
    index: HashMap<K, HashSet<V, OtherHasher>, H>,
}
impl<K: Eq + Hash, V: Eq + Hash, H: BuildHasher + Default> Lookup<K, V, H> {
    pub fn new() -> Self {
        Self {
            index: HashMap::<K, HashSet<V, OtherHasher>, H>::default(),
        }
    }
    pub fn insert(&mut self, key: K, value: V) {
        self.index.entry(key).or_default().insert(value);
    }
    pub fn lookup(&self, key: &K) -> Option<&HashSet<V, OtherHasher>> {
        self.index.get(key)
    }
}

#[derive(Debug)]
pub struct FactKeeper {
    kept: HashSet<Arc<Fact>, OtherHasher>,
    // lookups between things and facts (similar to database indexes)
    entity_to_fact_lookup: Lookup<Thing, Arc<Fact>, ThingHasher>,
    attribute_to_fact_lookup: Lookup<Thing, Arc<Fact>, ThingHasher>,
    attribute_value_to_fact_lookup: Lookup<(Thing, Value), Arc<Fact>, OtherHasher>,
    attribute_to_entities: HashMap<Thing, RoaringTreemap, ThingHasher>,
}
impl FactKeeper {
    pub fn new() -> Self {
        Self {
            kept: HashSet::default(),
            entity_to_fact_lookup: Lookup::new(),
            attribute_to_fact_lookup: Lookup::new(),
            attribute_value_to_fact_lookup: Lookup::new(),
            attribute_to_entities: HashMap::default(),
        }
    }
    pub fn keep(&mut self, fact: Fact) -> (Arc<Fact>, bool) {
        if let Some(kept) = self.kept.get(&fact) {
            return (Arc::clone(kept), true);
        }
        let kept = Arc::new(fact);
        let attribute = kept.attribute.attribute();
        self.kept.insert(Arc::clone(&kept));
        self.entity_to_fact_lookup
            .insert(kept.entity(), Arc::clone(&kept));
        self.attribute_to_fact_lookup
            .insert(attribute, Arc::clone(&kept));
        self.attribute_value_to_fact_lookup
            .insert((attribute, kept.value().clone()), Arc::clone(&kept));
        self.attribute_to_entities
            .entry(attribute)
            .or_default()
            .insert(kept.entity());
        (kept, false)
    }
    pub fn facts_of(&self, entity: Thing) -> impl Iterator<Item = &Arc<Fact>> {
        self.entity_to_fact_lookup
            .lookup(&entity)
            .into_iter()
            .flatten()
    }
    pub fn facts_with(&self, attribute: Thing) -> impl Iterator<Item = &Arc<Fact>> {
        self.attribute_to_fact_lookup
            .lookup(&attribute)
            .into_iter()
            .flatten()
    }
    pub fn facts_with_value(
        &self,
        attribute: Thing,
        value: &Value,
    ) -> impl Iterator<Item = &Arc<Fact>> {
        self.attribute_value_to_fact_lookup
            .lookup(&(attribute, value.clone()))
            .into_iter()
            .flatten()
    }
    /// The values an entity holds for an attribute, in value order.
    pub fn values(&self, entity: Thing, attribute: Thing) -> Vec<Value> {
        let values: BTreeSet<Value> = self
            .facts_of(entity)
            .filter(|fact| fact.attribute.attribute() == attribute)
            .map(|fact| fact.value().clone())
            .collect();
        values.into_iter().collect()
    }
    /// All entities that hold at least one value for the attribute.
    pub fn entities_with(&self, attribute: Thing) -> RoaringTreemap {
        self.attribute_to_entities
            .get(&attribute)
            .cloned()
            .unwrap_or_default()
    }
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Fact>> {
        self.kept.iter()
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
}

// ------------- Database -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

// This sets up the database with the necessary structures
#[derive(Debug)]
pub struct Database {
    // owns a thing generator
    pub thing_generator: Arc<Mutex<ThingGenerator>>,
    // owns keepers for the available constructs
    pub attribute_keeper: Arc<Mutex<AttributeKeeper>>,
    pub fact_keeper: Arc<Mutex<FactKeeper>>,
    // responsible for the the persistence layer
    pub persistor: Arc<Mutex<Persistor>>,
    // batches are prepared and committed one at a time
    writer: Mutex<()>,
}

impl Database {
    pub fn new(mode: PersistenceMode) -> Result<Database> {
        let persistor = Persistor::new(&mode)?;
        let database = Database {
            thing_generator: Arc::new(Mutex::new(ThingGenerator::new())),
            attribute_keeper: Arc::new(Mutex::new(AttributeKeeper::new())),
            fact_keeper: Arc::new(Mutex::new(FactKeeper::new())),
            persistor: Arc::new(Mutex::new(persistor)),
            writer: Mutex::new(()),
        };

        // Restore the existing database
        {
            let persistor = database.persistor.lock()?;
            persistor.restore_things(&database)?;
            persistor.restore_attributes(&database)?;
            persistor.restore_facts(&database)?;
        }

        // Reserve the attributes that schema declarations and
        // transactions are described with.
        for (ident, value_type, doc) in RESERVED_ATTRIBUTES {
            database.create_reserved_attribute(ident, value_type, doc)?;
        }
        info!(
            mode = ?mode,
            attributes = database.attribute_keeper.lock()?.len(),
            facts = database.fact_keeper.lock()?.len(),
            "database ready"
        );
        Ok(database)
    }
    // functions to access the owned generator and keepers
    pub fn thing_generator(&self) -> Arc<Mutex<ThingGenerator>> {
        Arc::clone(&self.thing_generator)
    }
    pub fn attribute_keeper(&self) -> Arc<Mutex<AttributeKeeper>> {
        Arc::clone(&self.attribute_keeper)
    }
    pub fn fact_keeper(&self) -> Arc<Mutex<FactKeeper>> {
        Arc::clone(&self.fact_keeper)
    }
    pub fn attribute(&self, ident: &str) -> Result<Option<Arc<Attribute>>> {
        Ok(self.attribute_keeper.lock()?.get(ident))
    }
    pub fn fact_count(&self) -> Result<usize> {
        Ok(self.fact_keeper.lock()?.len())
    }
    /// A copy of every fact currently held.
    pub fn facts(&self) -> Result<Vec<Arc<Fact>>> {
        Ok(self.fact_keeper.lock()?.iter().map(Arc::clone).collect())
    }
    pub fn current_superhash(&self) -> Result<Option<String>> {
        Ok(self.persistor.lock()?.current_superhash())
    }
    fn create_reserved_attribute(
        &self,
        ident: &str,
        value_type: ValueType,
        doc: &str,
    ) -> Result<()> {
        if self.attribute_keeper.lock()?.get(ident).is_some() {
            return Ok(());
        }
        let thing = self.thing_generator.lock()?.generate();
        let (kept, _) = self.attribute_keeper.lock()?.keep(Attribute::new(
            thing,
            ident.to_string(),
            value_type,
            Cardinality::One,
            Some(doc.to_string()),
            true,
        ));
        let mut persistor = self.persistor.lock()?;
        persistor.persist_thing(&thing)?;
        persistor.persist_attribute(&kept)?;
        Ok(())
    }

    /// Registers attribute declarations. Redeclaring an attribute identically
    /// is a no-op, redeclaring it with another type or cardinality is a
    /// schema conflict. Each new attribute becomes an entity described by
    /// facts on the reserved `:db/*` attributes.
    pub fn declare_attributes(&self, specs: Vec<AttributeSpec>) -> Result<TxReport> {
        let (declared, _) = self.transact(specs, Vec::new())?;
        Ok(declared)
    }

    /// Inserts a batch of entity maps. Temporary ids are replaced by permanent
    /// ones, consistently across the whole batch. Nothing is stored unless the
    /// whole batch validates.
    pub fn insert(&self, maps: Vec<EntityMap>) -> Result<TxReport> {
        let (_, inserted) = self.transact(Vec::new(), maps)?;
        Ok(inserted)
    }

    /// Declares attributes and inserts entity maps as one transaction. The
    /// entity maps may use the attributes declared alongside them. Both halves
    /// are validated before anything is kept, so a failure in either stores
    /// nothing. Returns the report of the declarations and of the insertion,
    /// sharing the transaction entity.
    pub fn transact(
        &self,
        specs: Vec<AttributeSpec>,
        maps: Vec<EntityMap>,
    ) -> Result<(TxReport, TxReport)> {
        let _writer = self.writer.lock()?;
        let mut declared = TxReport::default();
        let mut inserted = TxReport::default();
        let (tx, instant, things, attributes, facts) = {
            let mut attribute_keeper = self.attribute_keeper.lock()?;
            let mut fact_keeper = self.fact_keeper.lock()?;
            let mut generator = self.thing_generator.lock()?;

            let fresh = transact::prepare_schema(&attribute_keeper, specs)?;
            // the transaction entity comes first, then one entity per new attribute
            let upcoming = generator.upcoming(fresh.len() + 1);
            let mut staged = None;
            let mut attributes = Vec::with_capacity(fresh.len());
            if !fresh.is_empty() {
                let mut keeper = attribute_keeper.clone();
                for (spec, thing) in fresh.into_iter().zip(&upcoming[1..]) {
                    let (kept, _) = keeper.keep(Attribute::new(
                        *thing,
                        spec.ident,
                        spec.value_type,
                        spec.cardinality,
                        spec.doc,
                        false,
                    ));
                    attributes.push(kept);
                }
                staged = Some(keeper);
            }
            let plan = transact::prepare_insert(
                staged.as_ref().unwrap_or(&*attribute_keeper),
                &fact_keeper,
                &generator,
                maps,
            )?;
            if attributes.is_empty() && plan.is_empty() {
                debug!("batch added nothing");
                return Ok((declared, inserted));
            }

            // nothing below can be rejected
            let generated: Vec<Thing> = upcoming.iter().map(|_| generator.generate()).collect();
            if generated != upcoming {
                return Err(FactbaseError::Invariant(format!(
                    "generated {:?} where {:?} was planned",
                    generated, upcoming
                )));
            }
            let tx = upcoming[0];
            let slots: Vec<Thing> = (0..plan.new_entities())
                .map(|_| generator.generate())
                .collect();
            if let Some(keeper) = staged {
                *attribute_keeper = keeper;
            }
            let reserved = |ident: &str| {
                attribute_keeper.get(ident).ok_or_else(|| {
                    FactbaseError::Invariant(format!("reserved attribute {} missing", ident))
                })
            };
            let mut planned = Vec::new();
            for attribute in &attributes {
                let thing = attribute.attribute();
                let value_type = attribute.value_type().ident().to_string();
                let cardinality = attribute.cardinality().ident().to_string();
                let ident = attribute.ident().to_string();
                planned.push((thing, reserved(DB_IDENT)?, Value::Keyword(ident)));
                planned.push((thing, reserved(DB_VALUE_TYPE)?, Value::Keyword(value_type)));
                planned.push((thing, reserved(DB_CARDINALITY)?, Value::Keyword(cardinality)));
                if let Some(doc) = attribute.doc() {
                    planned.push((thing, reserved(DB_DOC)?, Value::String(doc.to_string())));
                }
            }
            let schema_datoms = planned.len();
            let resolved = plan.resolve(&slots);
            planned.extend(resolved.facts);
            let instant = now();
            planned.push((tx, reserved(DB_TX_INSTANT)?, Value::Instant(instant)));

            let mut facts = Vec::with_capacity(planned.len());
            for (entity, attribute, value) in planned {
                let (fact, previously_kept) =
                    fact_keeper.keep(Fact::new(entity, attribute, value, tx));
                if !previously_kept {
                    facts.push(fact);
                }
            }

            // the transaction instant is counted in the last report of the batch
            if !attributes.is_empty() {
                declared.tx = Some(tx);
                declared.entities = upcoming[1..].to_vec();
                declared.datoms = schema_datoms;
            }
            if plan.is_empty() {
                declared.datoms += 1;
            } else {
                inserted.tx = Some(tx);
                inserted.tempids = resolved.tempids;
                inserted.entities = resolved.entities;
                inserted.datoms = facts.len() - schema_datoms;
            }
            let mut things = upcoming;
            things.extend(slots);
            (tx, instant, things, attributes, facts)
        };
        self.persistor
            .lock()?
            .persist_transaction(tx, &instant, &things, &attributes, &facts)?;
        info!(
            tx,
            attributes = attributes.len(),
            entities = inserted.entities.len(),
            datoms = facts.len(),
            "transacted batch"
        );
        Ok((declared, inserted))
    }

    /// Evaluates a pattern query against every fact currently held.
    pub fn query(&self, query: &Query) -> Result<QueryResult> {
        let attributes = self.attribute_keeper.lock()?;
        let facts = self.fact_keeper.lock()?;
        query::evaluate(&attributes, &facts, query)
    }

    /// Expands an entity into a map of its attributes.
    pub fn pull(&self, entity: Thing, pattern: &PullPattern) -> Result<PulledEntity> {
        let attributes = self.attribute_keeper.lock()?;
        let facts = self.fact_keeper.lock()?;
        query::validate_pull(&attributes, pattern)?;
        query::pull(&attributes, &facts, entity, pattern)
    }

    /// The map view of an entity, or None when it holds no facts.
    pub fn entity(&self, entity: Thing) -> Result<Option<PulledEntity>> {
        let pulled = self.pull(entity, &PullPattern::new(vec![PullElement::Wildcard]))?;
        Ok(if pulled.is_empty() { None } else { Some(pulled) })
    }

    /// The entity as attribute idents mapped to their values, in the form
    /// used when inspecting raw data.
    pub fn facts_of(&self, entity: Thing) -> Result<BTreeMap<String, Vec<Value>>> {
        let keeper = self.fact_keeper.lock()?;
        let mut view: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for fact in keeper.facts_of(entity) {
            view.entry(fact.attribute.ident().to_string())
                .or_default()
                .push(fact.value().clone());
        }
        for values in view.values_mut() {
            values.sort();
        }
        Ok(view)
    }
}
