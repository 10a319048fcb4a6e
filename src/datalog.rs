//! The datalog script language and the engine that runs it.
//!
//! A script is a sequence of commands. A vector of entity maps is a
//! transaction, a vector starting with `:find` is a query:
//!
//! ```text
//! ; declare, insert and ask
//! [{:db/ident :user/age :db/valueType :db.type/long}]
//! [{:db/id #db/id[:db.part/user -1] :user/age 31}]
//! [:find ?e :where [?e :user/age ?age] [(>= ?age 21)]]
//! ```
//!
//! Maps naming a `:db/ident` are attribute declarations. They are committed
//! together with the entity maps of the same transaction, and the entity
//! maps may use them.

use pest::error::LineColLocation;
use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;

use tracing::{debug, warn};

use crate::construct::Database;
use crate::datatype::{parse_instant, Datum, Decimal};
use crate::error::{FactbaseError, Result};
use crate::query::{FindElement, Operator, PullElement, PullPattern, Query, QueryResult, Term};
use crate::transact::{Assignment, AttributeSpec, EntityMap, TxReport};

#[derive(Parser)]
#[grammar = "datalog.pest"]
struct DatalogParser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Transact(Vec<EntityMap>),
    Query(Query),
}

/// What running a single command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Declared(TxReport),
    Transacted(TxReport),
    Rows(QueryResult),
}

impl Outcome {
    pub fn to_json(&self) -> serde_json::Value {
        let report = |kind: &str, report: &TxReport| {
            serde_json::json!({
                "kind": kind,
                "tx": report.tx,
                "tempids": report
                    .tempids
                    .iter()
                    .map(|(tempid, thing)| (tempid.to_string(), serde_json::Value::from(*thing)))
                    .collect::<serde_json::Map<_, _>>(),
                "entities": report.entities,
                "datoms": report.datoms,
            })
        };
        match self {
            Outcome::Declared(r) => report("declared", r),
            Outcome::Transacted(r) => report("transacted", r),
            Outcome::Rows(result) => {
                let mut json = result.to_json();
                if let Some(map) = json.as_object_mut() {
                    map.insert("kind".to_string(), serde_json::Value::from("rows"));
                }
                json
            }
        }
    }
}

// ------------- Parsing -------------
fn parse_error(e: pest::error::Error<Rule>) -> FactbaseError {
    let (line, col) = match e.line_col {
        LineColLocation::Pos((line, col)) => (line, col),
        LineColLocation::Span((line, col), _) => (line, col),
    };
    FactbaseError::Parse {
        message: e.variant.message().to_string(),
        line: Some(line),
        col: Some(col),
    }
}

fn invalid(pair: &Pair<Rule>, message: String) -> FactbaseError {
    let (line, col) = pair.as_span().start_pos().line_col();
    FactbaseError::Parse {
        message,
        line: Some(line),
        col: Some(col),
    }
}

/// Parses a whole script into its commands.
pub fn parse_script(script: &str) -> Result<Vec<Command>> {
    let mut pairs = DatalogParser::parse(Rule::script, script).map_err(parse_error)?;
    let mut commands = Vec::new();
    if let Some(root) = pairs.next() {
        for pair in root.into_inner() {
            match pair.as_rule() {
                Rule::transaction => commands.push(Command::Transact(build_transaction(pair)?)),
                Rule::query => commands.push(Command::Query(build_query(pair)?)),
                _ => (),
            }
        }
    }
    Ok(commands)
}

pub fn parse_query(text: &str) -> Result<Query> {
    let mut pairs = DatalogParser::parse(Rule::query_script, text).map_err(parse_error)?;
    let query = pairs
        .next()
        .and_then(|root| root.into_inner().find(|p| p.as_rule() == Rule::query))
        .ok_or_else(|| FactbaseError::Invariant("query script without a query".into()))?;
    build_query(query)
}

pub fn parse_transaction(text: &str) -> Result<Vec<EntityMap>> {
    let mut pairs = DatalogParser::parse(Rule::transaction_script, text).map_err(parse_error)?;
    let transaction = pairs
        .next()
        .and_then(|root| root.into_inner().find(|p| p.as_rule() == Rule::transaction))
        .ok_or_else(|| {
            FactbaseError::Invariant("transaction script without a transaction".into())
        })?;
    build_transaction(transaction)
}

fn build_transaction(pair: Pair<Rule>) -> Result<Vec<EntityMap>> {
    pair.into_inner().map(build_entity_map).collect()
}

fn build_entity_map(pair: Pair<Rule>) -> Result<EntityMap> {
    let mut map = EntityMap::new();
    for assignment in pair.into_inner() {
        let mut inner = assignment.into_inner();
        let (Some(key), Some(value)) = (inner.next(), inner.next()) else {
            continue;
        };
        let ident = key.as_str().to_string();
        if ident == crate::construct::DB_ID && value.as_rule() == Rule::temp_id {
            // a temp id without a number asks for a new entity, like no id at all
            if let Some(tempid) = temp_id(&value)? {
                map = map.with_id(Datum::TempId(tempid));
            }
            continue;
        }
        let assigned = match value.as_rule() {
            Rule::many => Assignment::Many(
                value.into_inner().map(build_datum).collect::<Result<_>>()?,
            ),
            _ => Assignment::One(build_datum(value)?),
        };
        map = map.assign(ident, assigned);
    }
    Ok(map)
}

fn temp_id(pair: &Pair<Rule>) -> Result<Option<i64>> {
    let mut inner = pair.clone().into_inner();
    let partition = inner.next().map(|p| p.as_str()).unwrap_or_default();
    if !partition.starts_with(":db.part/") {
        return Err(invalid(pair, format!("{} is not a partition", partition)));
    }
    inner.next().map(|n| integer(&n)).transpose()
}

fn integer(pair: &Pair<Rule>) -> Result<i64> {
    pair.as_str()
        .parse::<i64>()
        .map_err(|e| invalid(pair, format!("invalid integer {}: {}", pair.as_str(), e)))
}

fn unescape(pair: &Pair<Rule>) -> Result<String> {
    let raw = pair.as_str();
    let mut unescaped = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            unescaped.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => unescaped.push('\n'),
            Some('t') => unescaped.push('\t'),
            Some('r') => unescaped.push('\r'),
            Some('u') => {
                let mut code = code_unit(pair, &mut chars)?;
                // a high surrogate must be followed by its low half
                if (0xD800..0xDC00).contains(&code) {
                    let low = match (chars.next(), chars.next()) {
                        (Some('\\'), Some('u')) => code_unit(pair, &mut chars)?,
                        _ => 0,
                    };
                    if !(0xDC00..0xE000).contains(&low) {
                        return Err(invalid(pair, format!("unpaired surrogate \\u{:04X}", code)));
                    }
                    code = 0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00);
                }
                let decoded = char::from_u32(code)
                    .ok_or_else(|| invalid(pair, format!("invalid escape \\u{:04X}", code)))?;
                unescaped.push(decoded);
            }
            Some(other) => unescaped.push(other),
            None => (),
        }
    }
    Ok(unescaped)
}

fn code_unit(pair: &Pair<Rule>, chars: &mut std::str::Chars<'_>) -> Result<u32> {
    let digits: String = chars.by_ref().take(4).collect();
    if digits.len() != 4 {
        return Err(invalid(pair, format!("\\u needs four hex digits, got \"{}\"", digits)));
    }
    u32::from_str_radix(&digits, 16)
        .map_err(|_| invalid(pair, format!("\\u needs four hex digits, got \"{}\"", digits)))
}

fn string_of(pair: Pair<Rule>) -> Result<String> {
    pair.into_inner()
        .next()
        .map(|inner| unescape(&inner))
        .transpose()
        .map(Option::unwrap_or_default)
}

fn build_datum(pair: Pair<Rule>) -> Result<Datum> {
    Ok(match pair.as_rule() {
        Rule::string => Datum::String(string_of(pair)?),
        Rule::integer => Datum::Long(integer(&pair)?),
        Rule::decimal => Datum::Decimal(
            Decimal::parse(pair.as_str())
                .ok_or_else(|| invalid(&pair, format!("invalid decimal {}", pair.as_str())))?,
        ),
        Rule::boolean => Datum::Boolean(pair.as_str() == "true"),
        Rule::keyword => Datum::Keyword(pair.as_str().to_string()),
        Rule::instant => {
            let text = pair
                .clone()
                .into_inner()
                .next()
                .map(string_of)
                .transpose()?
                .unwrap_or_default();
            Datum::Instant(
                parse_instant(&text)
                    .ok_or_else(|| invalid(&pair, format!("invalid instant \"{}\"", text)))?,
            )
        }
        Rule::temp_id => match temp_id(&pair)? {
            Some(tempid) => Datum::TempId(tempid),
            None => {
                return Err(invalid(
                    &pair,
                    "a temporary id used as a value needs a number".to_string(),
                ));
            }
        },
        other => return Err(invalid(&pair, format!("unexpected {:?}", other))),
    })
}

fn build_term(pair: Pair<Rule>) -> Result<Term> {
    Ok(match pair.as_rule() {
        Rule::variable => Term::var(pair.as_str()),
        Rule::wildcard => Term::Wildcard,
        _ => Term::Constant(build_datum(pair)?),
    })
}

// an omitted term is a wildcard
fn next_term(pairs: &mut Pairs<Rule>) -> Result<Term> {
    Ok(pairs.next().map(build_term).transpose()?.unwrap_or(Term::Wildcard))
}

fn build_pull_pattern(pair: Pair<Rule>) -> Result<PullPattern> {
    let mut elements = Vec::new();
    for element in pair.into_inner() {
        elements.push(match element.as_rule() {
            Rule::pull_wildcard => PullElement::Wildcard,
            Rule::keyword => PullElement::Attribute(element.as_str().to_string()),
            Rule::nested_pull => {
                let mut inner = element.into_inner();
                let ident = inner.next().map(|p| p.as_str().to_string()).unwrap_or_default();
                let nested = match inner.next() {
                    Some(nested) => build_pull_pattern(nested)?,
                    None => PullPattern::default(),
                };
                PullElement::Nested(ident, nested)
            }
            _ => continue,
        });
    }
    Ok(PullPattern::new(elements))
}

fn build_query(pair: Pair<Rule>) -> Result<Query> {
    let mut query = Query::default();
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::find => {
                for element in part.into_inner() {
                    match element.as_rule() {
                        Rule::variable => query.find.push(FindElement::var(element.as_str())),
                        Rule::pull => {
                            let mut inner = element.into_inner();
                            let (Some(variable), Some(pattern)) = (inner.next(), inner.next())
                            else {
                                continue;
                            };
                            let pattern = build_pull_pattern(pattern)?;
                            query.find.push(FindElement::pull(variable.as_str(), pattern));
                        }
                        _ => (),
                    }
                }
            }
            Rule::where_clause => {
                for clause in part.into_inner() {
                    match clause.as_rule() {
                        Rule::pattern => {
                            let mut terms = clause.into_inner();
                            let entity = next_term(&mut terms)?;
                            let attribute = next_term(&mut terms)?;
                            let value = next_term(&mut terms)?;
                            query = query.pattern(entity, attribute, value);
                        }
                        Rule::predicate => {
                            let mut inner = clause.into_inner();
                            let operator = inner
                                .next()
                                .and_then(|op| Operator::from_symbol(op.as_str()))
                                .ok_or_else(|| {
                                    FactbaseError::Invariant("predicate without operator".into())
                                })?;
                            let left = next_term(&mut inner)?;
                            let right = next_term(&mut inner)?;
                            query = query.predicate(operator, left, right);
                        }
                        _ => (),
                    }
                }
            }
            Rule::limit => {
                if let Some(n) = part.into_inner().next() {
                    let limit = integer(&n)?;
                    query.limit = Some(usize::try_from(limit).map_err(|_| {
                        invalid(&n, format!("limit must not be negative, got {}", limit))
                    })?);
                }
            }
            _ => (),
        }
    }
    Ok(query)
}

// ------------- Engine -------------
pub struct Engine<'en> {
    database: &'en Database,
}

impl<'en> Engine<'en> {
    pub fn new(database: &'en Database) -> Self {
        Self { database }
    }

    /// Runs a single command.
    pub fn run(&self, command: Command) -> Result<Vec<Outcome>> {
        match command {
            Command::Query(query) => {
                debug!(query = %query, "running query");
                Ok(vec![Outcome::Rows(self.database.query(&query)?)])
            }
            Command::Transact(maps) => {
                let (schema, entities): (Vec<EntityMap>, Vec<EntityMap>) =
                    maps.into_iter().partition(EntityMap::is_schema);
                let specs = schema
                    .iter()
                    .map(AttributeSpec::from_map)
                    .collect::<Result<Vec<_>>>()?;
                let declaring = !specs.is_empty();
                let inserting = !entities.is_empty();
                let (declared, inserted) = self.database.transact(specs, entities)?;
                let mut outcomes = Vec::new();
                if declaring {
                    outcomes.push(Outcome::Declared(declared));
                }
                if inserting {
                    outcomes.push(Outcome::Transacted(inserted));
                }
                Ok(outcomes)
            }
        }
    }

    /// Runs every command of a script, handing each outcome to the sink as
    /// soon as it is available. The sink returns false to stop early.
    /// Returns the number of commands that ran.
    pub fn execute_with<F>(&self, script: &str, mut sink: F) -> Result<usize>
    where
        F: FnMut(Outcome) -> bool,
    {
        let commands = parse_script(script)?;
        let mut ran = 0;
        for command in commands {
            let outcomes = self.run(command).inspect_err(|e| {
                warn!(error = %e, command = ran, "command failed");
            })?;
            ran += 1;
            for outcome in outcomes {
                if !sink(outcome) {
                    debug!(ran, "script stopped by its consumer");
                    return Ok(ran);
                }
            }
        }
        Ok(ran)
    }

    pub fn execute(&self, script: &str) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        self.execute_with(script, |outcome| {
            outcomes.push(outcome);
            true
        })?;
        Ok(outcomes)
    }

    /// Runs a script and returns the result of its last query.
    pub fn execute_collect(&self, script: &str) -> Result<Option<QueryResult>> {
        Ok(self.execute_collect_multi(script)?.pop())
    }

    /// Runs a script and returns the result of every query, in order.
    pub fn execute_collect_multi(&self, script: &str) -> Result<Vec<QueryResult>> {
        Ok(self
            .execute(script)?
            .into_iter()
            .filter_map(|outcome| match outcome {
                Outcome::Rows(result) => Some(result),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_commas_are_whitespace() {
        let commands = parse_script(
            "; schema first\n[{:db/ident :user/email, :db/valueType :db.type/string}] ; trailing\n",
        )
        .unwrap();
        assert_eq!(commands.len(), 1);
        let Command::Transact(maps) = &commands[0] else {
            panic!("expected a transaction");
        };
        assert!(maps[0].is_schema());
    }

    #[test]
    fn temp_ids_and_literals() {
        let maps = parse_transaction(
            r#"[{:db/id #db/id[:db.part/user -1] :user/name "Sally \"S\"" :user/score 4.5M
                 :user/born #inst "1990-04-01" :user/tags #{"a" "b"} :user/friend #db/id[:db.part/user -2]}
                {:db/id #db/id[:db.part/user] :user/name "Anon"}]"#,
        )
        .unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].id(), Some(&Datum::TempId(-1)));
        assert_eq!(
            maps[0].get(":user/name"),
            Some(&Assignment::One(Datum::String("Sally \"S\"".into())))
        );
        assert_eq!(
            maps[0].get(":user/friend"),
            Some(&Assignment::One(Datum::TempId(-2)))
        );
        assert!(matches!(
            maps[0].get(":user/tags"),
            Some(Assignment::Many(tags)) if tags.len() == 2
        ));
        assert_eq!(maps[1].id(), None);
    }

    #[test]
    fn unicode_escapes_are_decoded() {
        let maps = parse_transaction(r#"[{:user/name "caf\u00e9 \ud83d\ude00"}]"#).unwrap();
        assert_eq!(
            maps[0].get(":user/name"),
            Some(&Assignment::One(Datum::String("caf\u{e9} \u{1f600}".into())))
        );
        for broken in [r#"[{:user/name "\u00g1"}]"#, r#"[{:user/name "\ud83d alone"}]"#] {
            let err = parse_transaction(broken).unwrap_err();
            assert!(matches!(err, FactbaseError::Parse { .. }), "{}", broken);
        }
    }

    #[test]
    fn bare_temp_id_as_value_is_rejected() {
        let err = parse_transaction("[{:user/friend #db/id[:db.part/user]}]").unwrap_err();
        assert!(matches!(err, FactbaseError::Parse { .. }));
    }

    #[test]
    fn query_with_predicate_pull_and_limit() {
        let query = parse_query(
            "[:find (pull ?e [:user/email {:user/friend [*]}]) ?age
              :where [?e :user/age ?age] [?e :user/email _] [(>= ?age 21)]
              :limit 5]",
        )
        .unwrap();
        assert_eq!(query.find.len(), 2);
        assert_eq!(query.clauses.len(), 3);
        assert_eq!(query.limit, Some(5));
        assert_eq!(
            query.to_string(),
            "[:find (pull ?e [:user/email {:user/friend [*]}]) ?age :where [?e :user/age ?age] [?e :user/email _] [(>= ?age 21)] :limit 5]"
        );
    }

    #[test]
    fn two_term_pattern_has_wildcard_value() {
        let query = parse_query("[:find ?e :where [?e :user/email]]").unwrap();
        assert_eq!(query.to_string(), "[:find ?e :where [?e :user/email _]]");
    }

    #[test]
    fn parse_errors_carry_a_position() {
        let err = parse_query("[:find ?e\n :where [?e :user/email ?v]").unwrap_err();
        match err {
            FactbaseError::Parse { line, .. } => assert_eq!(line, Some(2)),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
