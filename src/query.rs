//! Conjunctive pattern queries over the fact set.
//!
//! A [`Query`] is an ordered list of clauses. Triple patterns `[e a v]` extend
//! the current bindings with every fact they match, predicates filter the
//! bindings. Evaluation is clause-ordered: a predicate can only use variables
//! bound by an earlier pattern. Results are duplicate free and ordered by
//! value, and a `pull` find element expands an entity into a map of its
//! attributes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use roaring::RoaringTreemap;

use crate::construct::{Attribute, AttributeKeeper, Fact, FactKeeper, OtherHasher, Thing, DB_ID};
use crate::datatype::{Cardinality, Datum, Value, ValueType};
use crate::error::{FactbaseError, Result};

// ------------- Query model -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Variable(String),
    Wildcard,
    Constant(Datum),
}

impl Term {
    /// A variable, written with or without its leading `?`.
    pub fn var(name: &str) -> Term {
        Term::Variable(name.trim_start_matches('?').to_string())
    }
    pub fn attr(ident: &str) -> Term {
        Term::Constant(Datum::Keyword(ident.to_string()))
    }
    pub fn constant(datum: impl Into<Datum>) -> Term {
        Term::Constant(datum.into())
    }
}
impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Term::Variable(name) => write!(f, "?{}", name),
            Term::Wildcard => write!(f, "_"),
            Term::Constant(datum) => write!(f, "{}", datum),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub entity: Term,
    pub attribute: Term,
    pub value: Term,
}
impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{} {} {}]", self.entity, self.attribute, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }
    pub fn from_symbol(symbol: &str) -> Option<Operator> {
        match symbol {
            "=" => Some(Operator::Eq),
            "!=" => Some(Operator::Ne),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Le),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Ge),
            _ => None,
        }
    }
    fn holds(&self, left: &Value, right: &Value) -> Result<bool> {
        use std::cmp::Ordering::*;
        Ok(match self {
            Operator::Eq => left.matches(right),
            Operator::Ne => !left.matches(right),
            Operator::Lt => left.compare(right)? == Less,
            Operator::Le => left.compare(right)? != Greater,
            Operator::Gt => left.compare(right)? == Greater,
            Operator::Ge => left.compare(right)? != Less,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub operator: Operator,
    pub left: Term,
    pub right: Term,
}
impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[({} {} {})]", self.operator.symbol(), self.left, self.right)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    Pattern(Pattern),
    Predicate(Predicate),
}
impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Clause::Pattern(p) => write!(f, "{}", p),
            Clause::Predicate(p) => write!(f, "{}", p),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullElement {
    Wildcard,
    Attribute(String),
    Nested(String, PullPattern),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullPattern {
    elements: Vec<PullElement>,
}

impl PullPattern {
    pub fn new(elements: Vec<PullElement>) -> Self {
        Self { elements }
    }
    pub fn attributes(idents: &[&str]) -> Self {
        Self::new(
            idents
                .iter()
                .map(|ident| PullElement::Attribute(ident.to_string()))
                .collect(),
        )
    }
    pub fn elements(&self) -> &[PullElement] {
        &self.elements
    }
}
impl fmt::Display for PullPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let elements: Vec<String> = self
            .elements
            .iter()
            .map(|element| match element {
                PullElement::Wildcard => "*".to_string(),
                PullElement::Attribute(ident) => ident.clone(),
                PullElement::Nested(ident, nested) => format!("{{{} {}}}", ident, nested),
            })
            .collect();
        write!(f, "[{}]", elements.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindElement {
    Variable(String),
    Pull(String, PullPattern),
}

impl FindElement {
    pub fn var(name: &str) -> FindElement {
        FindElement::Variable(name.trim_start_matches('?').to_string())
    }
    pub fn pull(name: &str, pattern: PullPattern) -> FindElement {
        FindElement::Pull(name.trim_start_matches('?').to_string(), pattern)
    }
    fn variable(&self) -> &str {
        match self {
            FindElement::Variable(name) | FindElement::Pull(name, _) => name,
        }
    }
}
impl fmt::Display for FindElement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FindElement::Variable(name) => write!(f, "?{}", name),
            FindElement::Pull(name, pattern) => write!(f, "(pull ?{} {})", name, pattern),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub find: Vec<FindElement>,
    pub clauses: Vec<Clause>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(find: Vec<FindElement>) -> Self {
        Self {
            find,
            clauses: Vec::new(),
            limit: None,
        }
    }
    pub fn pattern(mut self, entity: Term, attribute: Term, value: Term) -> Self {
        self.clauses.push(Clause::Pattern(Pattern {
            entity,
            attribute,
            value,
        }));
        self
    }
    pub fn predicate(mut self, operator: Operator, left: Term, right: Term) -> Self {
        self.clauses.push(Clause::Predicate(Predicate {
            operator,
            left,
            right,
        }));
        self
    }
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let find: Vec<String> = self.find.iter().map(ToString::to_string).collect();
        write!(f, "[:find {}", find.join(" "))?;
        if !self.clauses.is_empty() {
            let clauses: Vec<String> = self.clauses.iter().map(ToString::to_string).collect();
            write!(f, " :where {}", clauses.join(" "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " :limit {}", limit)?;
        }
        write!(f, "]")
    }
}

// ------------- Results -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PulledValue {
    Value(Value),
    Entity(PulledEntity),
}

impl PulledValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            PulledValue::Value(value) => Some(value),
            PulledValue::Entity(_) => None,
        }
    }
    pub fn as_entity(&self) -> Option<&PulledEntity> {
        match self {
            PulledValue::Entity(entity) => Some(entity),
            PulledValue::Value(_) => None,
        }
    }
    fn to_json(&self) -> serde_json::Value {
        match self {
            PulledValue::Value(value) => value.to_json(),
            PulledValue::Entity(entity) => entity.to_json(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pulled {
    One(PulledValue),
    Many(Vec<PulledValue>),
}

/// An entity expanded into its attributes. The identifier is kept apart from
/// the attribute map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledEntity {
    id: Thing,
    attributes: BTreeMap<String, Pulled>,
}

impl PulledEntity {
    pub fn id(&self) -> Thing {
        self.id
    }
    pub fn attributes(&self) -> &BTreeMap<String, Pulled> {
        &self.attributes
    }
    pub fn get(&self, ident: &str) -> Option<&Pulled> {
        self.attributes.get(ident)
    }
    /// The value of a cardinality-one attribute.
    pub fn value(&self, ident: &str) -> Option<&Value> {
        match self.attributes.get(ident)? {
            Pulled::One(pulled) => pulled.as_value(),
            Pulled::Many(_) => None,
        }
    }
    /// Every plain value held for an attribute, whatever its cardinality.
    pub fn values(&self, ident: &str) -> Vec<&Value> {
        match self.attributes.get(ident) {
            Some(Pulled::One(pulled)) => pulled.as_value().into_iter().collect(),
            Some(Pulled::Many(pulled)) => pulled.iter().filter_map(PulledValue::as_value).collect(),
            None => Vec::new(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
    pub fn len(&self) -> usize {
        self.attributes.len()
    }
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(DB_ID.to_string(), serde_json::Value::from(self.id));
        for (ident, pulled) in &self.attributes {
            let json = match pulled {
                Pulled::One(value) => value.to_json(),
                Pulled::Many(values) => {
                    serde_json::Value::Array(values.iter().map(PulledValue::to_json).collect())
                }
            };
            map.insert(ident.clone(), json);
        }
        serde_json::Value::Object(map)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Value(Value),
    Entity(PulledEntity),
}

impl Cell {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Cell::Value(value) => Some(value),
            Cell::Entity(_) => None,
        }
    }
    pub fn as_entity(&self) -> Option<&PulledEntity> {
        match self {
            Cell::Entity(entity) => Some(entity),
            Cell::Value(_) => None,
        }
    }
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Value(value) => value.to_json(),
            Cell::Entity(entity) => entity.to_json(),
        }
    }
}
impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Cell::Value(value) => write!(f, "{}", value),
            Cell::Entity(entity) => write!(f, "{}", entity.to_json()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub row_count: usize,
    /// True when the limit was reached.
    pub limited: bool,
}

impl QueryResult {
    /// The rows as plain values; pulled entities are given by their id.
    pub fn values(&self) -> Vec<Vec<Value>> {
        self.rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| match cell {
                        Cell::Value(value) => value.clone(),
                        Cell::Entity(entity) => Value::Ref(entity.id()),
                    })
                    .collect()
            })
            .collect()
    }
    /// Every pulled entity, in row order.
    pub fn entities(&self) -> Vec<&PulledEntity> {
        self.rows
            .iter()
            .flat_map(|row| row.iter().filter_map(Cell::as_entity))
            .collect()
    }
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "columns": self.columns,
            "rows": self
                .rows
                .iter()
                .map(|row| row.iter().map(Cell::to_json).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
            "row_count": self.row_count,
            "limited": self.limited,
        })
    }
}

// ------------- Compilation -------------
type Binding = HashMap<String, Value, OtherHasher>;

#[derive(Debug)]
enum Slot {
    Bind(String),
    Match(String),
    Any,
    Value(Value),
}

#[derive(Debug)]
enum AttributeSlot {
    Known(Arc<Attribute>),
    Bind(String),
    Match(String),
    Any,
}

#[derive(Debug)]
struct CompiledPattern {
    entity: Slot,
    attribute: AttributeSlot,
    value: Slot,
}

#[derive(Debug)]
struct CompiledPredicate {
    operator: Operator,
    left: Slot,
    right: Slot,
}

#[derive(Debug)]
enum CompiledClause {
    Pattern(CompiledPattern),
    Predicate(CompiledPredicate),
}

fn variable_slot(name: &str, bound: &mut HashSet<String>) -> Slot {
    if bound.insert(name.to_string()) {
        Slot::Bind(name.to_string())
    } else {
        Slot::Match(name.to_string())
    }
}

fn resolve_attribute(attributes: &AttributeKeeper, datum: &Datum) -> Result<Arc<Attribute>> {
    match datum {
        Datum::Keyword(ident) => attributes
            .get(ident)
            .ok_or_else(|| FactbaseError::UnknownAttribute(ident.clone())),
        Datum::Long(n) if *n > 0 => attributes
            .lookup(*n as Thing)
            .ok_or_else(|| FactbaseError::UnknownAttribute(n.to_string())),
        other => Err(FactbaseError::TypeMismatch(format!(
            "{} cannot name an attribute",
            other
        ))),
    }
}

fn entity_constant(attributes: &AttributeKeeper, datum: &Datum) -> Result<Value> {
    match datum {
        // an ident stands for the attribute entity it names
        Datum::Keyword(_) => Ok(Value::Ref(resolve_attribute(attributes, datum)?.attribute())),
        other => other.coerce(ValueType::Ref),
    }
}

fn value_constant(attribute: Option<&Arc<Attribute>>, datum: &Datum) -> Result<Value> {
    match attribute {
        Some(attribute) => datum.coerce(attribute.value_type()),
        None => datum.to_value().ok_or_else(|| {
            FactbaseError::TypeMismatch(format!("{} cannot be matched in a query", datum))
        }),
    }
}

fn compile(attributes: &AttributeKeeper, query: &Query) -> Result<Vec<CompiledClause>> {
    let mut bound: HashSet<String> = HashSet::new();
    let mut compiled = Vec::with_capacity(query.clauses.len());
    for clause in &query.clauses {
        match clause {
            Clause::Pattern(pattern) => {
                let entity = match &pattern.entity {
                    Term::Variable(name) => variable_slot(name, &mut bound),
                    Term::Wildcard => Slot::Any,
                    Term::Constant(datum) => Slot::Value(entity_constant(attributes, datum)?),
                };
                let attribute = match &pattern.attribute {
                    Term::Variable(name) => match variable_slot(name, &mut bound) {
                        Slot::Bind(name) => AttributeSlot::Bind(name),
                        Slot::Match(name) => AttributeSlot::Match(name),
                        _ => AttributeSlot::Any,
                    },
                    Term::Wildcard => AttributeSlot::Any,
                    Term::Constant(datum) => {
                        AttributeSlot::Known(resolve_attribute(attributes, datum)?)
                    }
                };
                let known = match &attribute {
                    AttributeSlot::Known(attribute) => Some(attribute),
                    _ => None,
                };
                let value = match &pattern.value {
                    Term::Variable(name) => variable_slot(name, &mut bound),
                    Term::Wildcard => Slot::Any,
                    Term::Constant(datum) => Slot::Value(value_constant(known, datum)?),
                };
                compiled.push(CompiledClause::Pattern(CompiledPattern {
                    entity,
                    attribute,
                    value,
                }));
            }
            Clause::Predicate(predicate) => {
                let operand = |term: &Term| -> Result<Slot> {
                    match term {
                        Term::Variable(name) if bound.contains(name) => {
                            Ok(Slot::Match(name.clone()))
                        }
                        Term::Variable(name) => Err(FactbaseError::UnknownVariable(format!(
                            "?{} is not bound before {}",
                            name, predicate
                        ))),
                        Term::Wildcard => Err(FactbaseError::InvalidQuery(format!(
                            "wildcard in predicate {}",
                            predicate
                        ))),
                        Term::Constant(datum) => Ok(Slot::Value(value_constant(None, datum)?)),
                    }
                };
                compiled.push(CompiledClause::Predicate(CompiledPredicate {
                    operator: predicate.operator,
                    left: operand(&predicate.left)?,
                    right: operand(&predicate.right)?,
                }));
            }
        }
    }
    for element in &query.find {
        if !bound.contains(element.variable()) {
            return Err(FactbaseError::UnknownVariable(format!(
                "?{} is never bound",
                element.variable()
            )));
        }
        if let FindElement::Pull(_, pattern) = element {
            validate_pull(attributes, pattern)?;
        }
    }
    Ok(compiled)
}

/// Checks that every attribute a pull pattern names is declared and that
/// nested patterns only follow references.
pub fn validate_pull(attributes: &AttributeKeeper, pattern: &PullPattern) -> Result<()> {
    for element in pattern.elements() {
        match element {
            PullElement::Wildcard => (),
            PullElement::Attribute(ident) if ident == DB_ID => (),
            PullElement::Attribute(ident) => {
                attributes
                    .get(ident)
                    .ok_or_else(|| FactbaseError::UnknownAttribute(ident.clone()))?;
            }
            PullElement::Nested(ident, nested) => {
                let attribute = attributes
                    .get(ident)
                    .ok_or_else(|| FactbaseError::UnknownAttribute(ident.clone()))?;
                if attribute.value_type() != ValueType::Ref {
                    return Err(FactbaseError::TypeMismatch(format!(
                        "{} is not a reference and cannot be pulled into",
                        ident
                    )));
                }
                validate_pull(attributes, nested)?;
            }
        }
    }
    Ok(())
}

// ------------- Evaluation -------------
fn thing_of(value: &Value) -> Option<Thing> {
    match value {
        Value::Ref(thing) => Some(*thing),
        Value::Long(n) if *n > 0 => Some(*n as Thing),
        _ => None,
    }
}

/// The value a slot stands for under the binding, if it is determined.
fn determined<'b>(slot: &'b Slot, binding: &'b Binding) -> Option<&'b Value> {
    match slot {
        Slot::Value(value) => Some(value),
        Slot::Match(name) => binding.get(name),
        Slot::Bind(_) | Slot::Any => None,
    }
}

/// Unifies a slot with a value of a candidate fact, binding where needed.
fn unify(slot: &Slot, value: &Value, binding: &mut Binding) -> bool {
    match slot {
        Slot::Any => true,
        Slot::Value(constant) => constant.matches(value),
        Slot::Match(name) => binding.get(name).is_some_and(|bound| bound.matches(value)),
        Slot::Bind(name) => {
            binding.insert(name.clone(), value.clone());
            true
        }
    }
}

fn match_pattern(
    attributes: &AttributeKeeper,
    facts: &FactKeeper,
    pattern: &CompiledPattern,
    bindings: Vec<Binding>,
) -> Vec<Binding> {
    let mut extended = Vec::new();
    for binding in bindings {
        let entity = match determined(&pattern.entity, &binding) {
            Some(value) => match thing_of(value) {
                Some(thing) => Some(thing),
                None => continue,
            },
            None => None,
        };
        let attribute = match &pattern.attribute {
            AttributeSlot::Known(attribute) => Some(Arc::clone(attribute)),
            AttributeSlot::Match(name) => {
                let named = binding.get(name).and_then(|value| match value {
                    Value::Keyword(ident) => attributes.get(ident),
                    other => thing_of(other).and_then(|thing| attributes.lookup(thing)),
                });
                match named {
                    Some(attribute) => Some(attribute),
                    None => continue,
                }
            }
            AttributeSlot::Bind(_) | AttributeSlot::Any => None,
        };

        // an attribute with no value constraint only asks which entities hold it
        if let (Some(attribute), Slot::Any) = (&attribute, &pattern.value) {
            let holders: RoaringTreemap = facts.entities_with(attribute.attribute());
            match entity {
                Some(thing) => {
                    if holders.contains(thing) {
                        extended.push(binding);
                    }
                }
                None => {
                    for thing in holders.iter() {
                        let mut candidate = binding.clone();
                        if unify(&pattern.entity, &Value::Ref(thing), &mut candidate) {
                            extended.push(candidate);
                        }
                    }
                }
            }
            continue;
        }

        let value = determined(&pattern.value, &binding).cloned();
        let candidates: Vec<&Arc<Fact>> = match (entity, &attribute, &value) {
            (Some(thing), _, _) => facts.facts_of(thing).collect(),
            (None, Some(attribute), Some(value))
                if value.value_type() == attribute.value_type() =>
            {
                facts.facts_with_value(attribute.attribute(), value).collect()
            }
            (None, Some(attribute), _) => facts.facts_with(attribute.attribute()).collect(),
            (None, None, _) => facts.iter().collect(),
        };
        for fact in candidates {
            if let Some(attribute) = &attribute {
                if fact.attribute().attribute() != attribute.attribute() {
                    continue;
                }
            }
            let mut candidate = binding.clone();
            let unified = unify(&pattern.entity, &Value::Ref(fact.entity()), &mut candidate)
                && match &pattern.attribute {
                    AttributeSlot::Bind(name) => {
                        candidate.insert(name.clone(), Value::Ref(fact.attribute().attribute()));
                        true
                    }
                    _ => true,
                }
                && unify(&pattern.value, fact.value(), &mut candidate);
            if unified {
                extended.push(candidate);
            }
        }
    }
    extended
}

fn filter_predicate(predicate: &CompiledPredicate, bindings: Vec<Binding>) -> Result<Vec<Binding>> {
    let mut kept = Vec::with_capacity(bindings.len());
    for binding in bindings {
        let (Some(left), Some(right)) = (
            determined(&predicate.left, &binding),
            determined(&predicate.right, &binding),
        ) else {
            continue;
        };
        if predicate.operator.holds(left, right)? {
            kept.push(binding);
        }
    }
    Ok(kept)
}

/// Evaluates a query against the kept facts.
pub fn evaluate(
    attributes: &AttributeKeeper,
    facts: &FactKeeper,
    query: &Query,
) -> Result<QueryResult> {
    let compiled = compile(attributes, query)?;
    let mut bindings: Vec<Binding> = vec![Binding::default()];
    for clause in &compiled {
        bindings = match clause {
            CompiledClause::Pattern(pattern) => match_pattern(attributes, facts, pattern, bindings),
            CompiledClause::Predicate(predicate) => filter_predicate(predicate, bindings)?,
        };
        if bindings.is_empty() {
            break;
        }
    }

    let mut tuples: BTreeSet<Vec<Value>> = BTreeSet::new();
    for binding in &bindings {
        let tuple: Option<Vec<Value>> = query
            .find
            .iter()
            .map(|element| binding.get(element.variable()).cloned())
            .collect();
        if let Some(tuple) = tuple {
            tuples.insert(tuple);
        }
    }
    let limited = query.limit.is_some_and(|limit| tuples.len() >= limit);
    let take = query.limit.unwrap_or(usize::MAX);

    let mut rows = Vec::new();
    for tuple in tuples.into_iter().take(take) {
        let mut row = Vec::with_capacity(tuple.len());
        for (element, value) in query.find.iter().zip(tuple) {
            row.push(match element {
                FindElement::Variable(_) => Cell::Value(value),
                FindElement::Pull(name, pattern) => {
                    let thing = thing_of(&value).ok_or_else(|| {
                        FactbaseError::TypeMismatch(format!(
                            "?{} is bound to {} which is not an entity",
                            name, value
                        ))
                    })?;
                    Cell::Entity(pull(attributes, facts, thing, pattern)?)
                }
            });
        }
        rows.push(row);
    }
    Ok(QueryResult {
        columns: query.find.iter().map(ToString::to_string).collect(),
        row_count: rows.len(),
        rows,
        limited,
    })
}

/// Expands an entity following a pull pattern. Attributes the entity holds
/// no value for are left out.
pub fn pull(
    attributes: &AttributeKeeper,
    facts: &FactKeeper,
    entity: Thing,
    pattern: &PullPattern,
) -> Result<PulledEntity> {
    let mut wanted: BTreeMap<String, Option<&PullPattern>> = BTreeMap::new();
    for element in pattern.elements() {
        match element {
            PullElement::Wildcard => {
                for fact in facts.facts_of(entity) {
                    wanted.entry(fact.attribute().ident().to_string()).or_insert(None);
                }
            }
            PullElement::Attribute(ident) if ident == DB_ID => (),
            PullElement::Attribute(ident) => {
                wanted.entry(ident.clone()).or_insert(None);
            }
            PullElement::Nested(ident, nested) => {
                wanted.insert(ident.clone(), Some(nested));
            }
        }
    }

    let mut pulled = BTreeMap::new();
    for (ident, nested) in wanted {
        let attribute = attributes
            .get(&ident)
            .ok_or_else(|| FactbaseError::UnknownAttribute(ident.clone()))?;
        let values = facts.values(entity, attribute.attribute());
        if values.is_empty() {
            continue;
        }
        let mut expanded = Vec::with_capacity(values.len());
        for value in values {
            expanded.push(match (nested, value.as_ref()) {
                (Some(nested), Some(thing)) => {
                    PulledValue::Entity(pull(attributes, facts, thing, nested)?)
                }
                _ => PulledValue::Value(value),
            });
        }
        let entry = match attribute.cardinality() {
            Cardinality::One => match expanded.into_iter().next() {
                Some(first) => Pulled::One(first),
                None => continue,
            },
            Cardinality::Many => Pulled::Many(expanded),
        };
        pulled.insert(ident, entry);
    }
    Ok(PulledEntity {
        id: entity,
        attributes: pulled,
    })
}
