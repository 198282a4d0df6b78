use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Number of positional value columns (`v0`..`v5`) a stored rule can carry.
pub const MAX_FIELDS: usize = 6;
pub const DEFAULT_TABLE_NAME: &str = "casbin_policy";
pub const FIELD_COLUMNS: [&str; MAX_FIELDS] = ["v0", "v1", "v2", "v3", "v4", "v5"];

const MAX_TABLE_NAME_LEN: usize = 63;
const ALL_RULE_TYPES: &str = "*";

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("config error: {0}")]
    Config(String),
    #[error("rule type must not be empty")]
    InvalidRuleType,
    #[error("rule of type {ptype} has {count} fields; at most {max} are supported", max = MAX_FIELDS)]
    TooManyFields { ptype: String, count: usize },
    #[error("{operation} received {old} old rules but {new} new rules")]
    Mismatch { operation: &'static str, old: usize, new: usize },
    #[error("storage error during {operation} (ptype {ptype}): {source}")]
    Storage {
        operation: &'static str,
        ptype: String,
        #[source]
        source: BoxError,
    },
    #[error("{operation} cancelled before completion")]
    Cancelled { operation: &'static str },
}

impl AdapterError {
    pub fn storage(
        operation: &'static str,
        ptype: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Storage { operation, ptype: ptype.into(), source: source.into() }
    }

    /// Storage failure for an operation that spans every rule type.
    pub fn storage_all(operation: &'static str, source: impl Into<BoxError>) -> Self {
        Self::storage(operation, ALL_RULE_TYPES, source)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// The model section a rule type belongs to: its first character (`p2` -> `p`).
#[must_use]
pub fn section_of(ptype: &str) -> &str {
    ptype.char_indices().nth(1).map_or(ptype, |(end, _)| &ptype[..end])
}

/// One stored rule: a rule type plus up to [`MAX_FIELDS`] positional values.
///
/// Slots past the populated prefix are `None` (absent). An empty string in a
/// populated slot is a real value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyRecord {
    ptype: String,
    values: [Option<String>; MAX_FIELDS],
}

impl PolicyRecord {
    /// Pack a rule's values into the fixed-width positional record.
    ///
    /// # Errors
    /// Returns [`AdapterError::InvalidRuleType`] for an empty rule type and
    /// [`AdapterError::TooManyFields`] when more than [`MAX_FIELDS`] values are given.
    pub fn encode<S: AsRef<str>>(ptype: &str, values: &[S]) -> Result<Self, AdapterError> {
        if ptype.is_empty() {
            return Err(AdapterError::InvalidRuleType);
        }
        if values.len() > MAX_FIELDS {
            return Err(AdapterError::TooManyFields {
                ptype: ptype.to_string(),
                count: values.len(),
            });
        }

        let mut slots: [Option<String>; MAX_FIELDS] = Default::default();
        for (slot, value) in slots.iter_mut().zip(values) {
            *slot = Some(value.as_ref().to_string());
        }

        Ok(Self { ptype: ptype.to_string(), values: slots })
    }

    /// Rebuild a record from raw column values as read back from storage.
    #[must_use]
    pub fn from_columns(ptype: String, values: [Option<String>; MAX_FIELDS]) -> Self {
        Self { ptype, values }
    }

    /// The populated prefix of the record, in field order.
    ///
    /// Rows written by other tools may leave a gap (`v1` NULL, `v2` set); a gap
    /// inside the prefix decodes as an empty string.
    #[must_use]
    pub fn decode(&self) -> Vec<String> {
        self.values[..self.present()]
            .iter()
            .map(|value| value.clone().unwrap_or_default())
            .collect()
    }

    #[must_use]
    pub fn ptype(&self) -> &str {
        &self.ptype
    }

    #[must_use]
    pub fn section(&self) -> &str {
        section_of(&self.ptype)
    }

    #[must_use]
    pub fn values(&self) -> &[Option<String>; MAX_FIELDS] {
        &self.values
    }

    #[must_use]
    pub fn field(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(Option::as_deref)
    }

    /// Count of populated fields.
    #[must_use]
    pub fn present(&self) -> usize {
        self.values.iter().rposition(Option::is_some).map_or(0, |last| last + 1)
    }
}

impl Display for PolicyRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ptype)?;
        for value in self.decode() {
            write!(f, ", {value}")?;
        }
        Ok(())
    }
}

/// Parse one line of a CSV policy file (`p, alice, data1, read`).
///
/// Blank lines and `#` comments yield `Ok(None)`.
///
/// # Errors
/// Returns an encoding error when the line carries too many fields.
pub fn parse_policy_line(line: &str) -> Result<Option<PolicyRecord>, AdapterError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut tokens = line.split(',').map(str::trim);
    let ptype = tokens.next().unwrap_or_default();
    let values = tokens.collect::<Vec<_>>();
    PolicyRecord::encode(ptype, &values).map(Some)
}

/// Encode a batch of rules sharing one rule type. Fails before anything is written.
///
/// # Errors
/// Returns the first encoding error.
pub fn encode_all<S: AsRef<str>>(
    ptype: &str,
    rules: &[Vec<S>],
) -> Result<Vec<PolicyRecord>, AdapterError> {
    rules.iter().map(|rule| PolicyRecord::encode(ptype, rule)).collect()
}

/// A filter value's constraint on one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldConstraint {
    Exact(String),
    /// Any non-NULL value, the empty string included.
    Wildcard,
}

impl FieldConstraint {
    // An empty filter value cannot be told apart from "don't care"; it always widens.
    fn from_filter_value(value: &str) -> Self {
        if value.is_empty() {
            Self::Wildcard
        } else {
            Self::Exact(value.to_string())
        }
    }

    #[must_use]
    pub fn matches(&self, stored: Option<&str>) -> bool {
        match (self, stored) {
            (Self::Exact(expected), Some(actual)) => expected == actual,
            (Self::Wildcard, Some(_)) => true,
            (_, None) => false,
        }
    }
}

/// Normalized per-field constraints of one filter call.
///
/// A field is in one of three states:
/// * constrained `Exact(v)`: the column must equal `v`;
/// * constrained `Wildcard`: the column must hold some value (NULL does not match);
/// * unconstrained (absent from the set): the column is not mentioned at all, so
///   NULL matches too.
///
/// The last two only differ on rows with NULL value columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintSet {
    fields: BTreeMap<usize, FieldConstraint>,
}

impl ConstraintSet {
    /// Compile a sparse filter: `values[i]` constrains field `field_index + i`.
    ///
    /// Contributions that land outside `0..MAX_FIELDS` are dropped, so a
    /// negative or large `field_index` is never an error.
    #[must_use]
    pub fn compile<S: AsRef<str>>(field_index: isize, values: &[S]) -> Self {
        let mut fields = BTreeMap::new();
        for (offset, value) in values.iter().enumerate() {
            let Some(position) =
                isize::try_from(offset).ok().and_then(|offset| field_index.checked_add(offset))
            else {
                break;
            };
            let Ok(position) = usize::try_from(position) else {
                continue;
            };
            if position >= MAX_FIELDS {
                break;
            }
            fields.insert(position, FieldConstraint::from_filter_value(value.as_ref()));
        }
        Self { fields }
    }

    /// Every populated field of `record` as a literal match; empty strings stay literal.
    #[must_use]
    pub fn exact(record: &PolicyRecord) -> Self {
        let fields = record
            .decode()
            .into_iter()
            .enumerate()
            .map(|(index, value)| (index, FieldConstraint::Exact(value)))
            .collect();
        Self { fields }
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&FieldConstraint> {
        self.fields.get(&index)
    }

    #[must_use]
    pub fn is_constrained(&self, index: usize) -> bool {
        self.fields.contains_key(&index)
    }

    /// Constraints in ascending field order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &FieldConstraint)> {
        self.fields.iter().map(|(index, constraint)| (*index, constraint))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Dialect {
    Sqlite,
    Postgres,
    Mysql,
    Mssql,
}

impl Dialect {
    /// Placeholder for the 1-based parameter `position`.
    #[must_use]
    pub fn placeholder(self, position: usize) -> String {
        match self {
            Self::Sqlite => format!("?{position}"),
            Self::Postgres => format!("${position}"),
            Self::Mysql => "?".to_string(),
            Self::Mssql => format!("@p{position}"),
        }
    }

    #[must_use]
    pub fn quote_ident(self, name: &str) -> String {
        match self {
            Self::Sqlite | Self::Postgres => format!("\"{name}\""),
            Self::Mysql => format!("`{name}`"),
            Self::Mssql => format!("[{name}]"),
        }
    }

    fn clear_table(self, table: &str) -> String {
        match self {
            // SQLite has no TRUNCATE; an unqualified DELETE takes the truncate fast path.
            Self::Sqlite => format!("DELETE FROM {table}"),
            Self::Postgres | Self::Mysql | Self::Mssql => format!("TRUNCATE TABLE {table}"),
        }
    }
}

/// One bound statement or statement fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause {
    RuleType(String),
    Equals { index: usize, value: String },
    MatchesAny { index: usize },
}

/// Conjunctive predicate over `ptype` and the value columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    clauses: Vec<Clause>,
}

impl Predicate {
    /// `ptype = t` followed by one clause per constrained field, ascending.
    #[must_use]
    pub fn build(ptype: &str, constraints: &ConstraintSet) -> Self {
        let mut clauses = Vec::with_capacity(constraints.len() + 1);
        clauses.push(Clause::RuleType(ptype.to_string()));
        for (index, constraint) in constraints.iter() {
            clauses.push(match constraint {
                FieldConstraint::Exact(value) => Clause::Equals { index, value: value.clone() },
                FieldConstraint::Wildcard => Clause::MatchesAny { index },
            });
        }
        Self { clauses }
    }

    #[must_use]
    pub fn filtered<S: AsRef<str>>(ptype: &str, field_index: isize, values: &[S]) -> Self {
        Self::build(ptype, &ConstraintSet::compile(field_index, values))
    }

    #[must_use]
    pub fn exact(record: &PolicyRecord) -> Self {
        Self::build(record.ptype(), &ConstraintSet::exact(record))
    }

    #[must_use]
    pub fn render(&self, dialect: Dialect) -> SqlFragment {
        self.render_from(dialect, 1)
    }

    /// Render with parameter numbering starting at `first_param`, for use
    /// after other bound parameters (e.g. an UPDATE's SET list).
    #[must_use]
    pub fn render_from(&self, dialect: Dialect, first_param: usize) -> SqlFragment {
        let mut parts = Vec::with_capacity(self.clauses.len());
        let mut params = Vec::new();
        for clause in &self.clauses {
            match clause {
                Clause::RuleType(ptype) => {
                    parts.push(format!("ptype = {}", dialect.placeholder(first_param + params.len())));
                    params.push(Some(ptype.clone()));
                }
                Clause::Equals { index, value } => {
                    parts.push(format!(
                        "{} = {}",
                        FIELD_COLUMNS[*index],
                        dialect.placeholder(first_param + params.len())
                    ));
                    params.push(Some(value.clone()));
                }
                Clause::MatchesAny { index } => {
                    parts.push(format!("{} LIKE '%'", FIELD_COLUMNS[*index]));
                }
            }
        }
        SqlFragment { sql: parts.join(" AND "), params }
    }

    /// Evaluate the predicate against an in-memory record, with the same
    /// NULL handling as the SQL rendering.
    #[must_use]
    pub fn matches(&self, record: &PolicyRecord) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::RuleType(ptype) => record.ptype() == ptype,
            Clause::Equals { index, value } => record.field(*index) == Some(value.as_str()),
            Clause::MatchesAny { index } => record.field(*index).is_some(),
        })
    }
}

/// Checks that a table name is safe to splice into SQL.
///
/// # Errors
/// Returns [`AdapterError::Config`] for empty, overlong, or non-identifier names.
pub fn validate_table_name(name: &str) -> Result<(), AdapterError> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || name.len() > MAX_TABLE_NAME_LEN {
        return Err(AdapterError::Config(format!("invalid table name: {name:?}")));
    }
    Ok(())
}

/// Statement text for the rule table in one dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStatements {
    table: String,
    dialect: Dialect,
}

impl TableStatements {
    /// # Errors
    /// Returns [`AdapterError::Config`] when `table_name` is not a plain identifier.
    pub fn new(table_name: &str, dialect: Dialect) -> Result<Self, AdapterError> {
        validate_table_name(table_name)?;
        Ok(Self { table: dialect.quote_ident(table_name), dialect })
    }

    #[must_use]
    pub fn select_all(&self) -> SqlFragment {
        SqlFragment {
            sql: format!(
                "SELECT ptype, {} FROM {} ORDER BY id",
                FIELD_COLUMNS.join(", "),
                self.table
            ),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn select(&self, predicate: &Predicate) -> SqlFragment {
        let filter = predicate.render(self.dialect);
        SqlFragment {
            sql: format!(
                "SELECT ptype, {} FROM {} WHERE {} ORDER BY id",
                FIELD_COLUMNS.join(", "),
                self.table,
                filter.sql
            ),
            params: filter.params,
        }
    }

    #[must_use]
    pub fn delete(&self, predicate: &Predicate) -> SqlFragment {
        let filter = predicate.render(self.dialect);
        SqlFragment {
            sql: format!("DELETE FROM {} WHERE {}", self.table, filter.sql),
            params: filter.params,
        }
    }

    #[must_use]
    pub fn insert(&self, record: &PolicyRecord) -> SqlFragment {
        let placeholders = (1..=MAX_FIELDS + 1)
            .map(|position| self.dialect.placeholder(position))
            .collect::<Vec<_>>();
        SqlFragment {
            sql: format!(
                "INSERT INTO {} (ptype, {}) VALUES ({})",
                self.table,
                FIELD_COLUMNS.join(", "),
                placeholders.join(", ")
            ),
            params: record_params(record),
        }
    }

    /// Overwrite every column of the rows matching `predicate` with `record`.
    #[must_use]
    pub fn update(&self, record: &PolicyRecord, predicate: &Predicate) -> SqlFragment {
        let assignments = std::iter::once("ptype")
            .chain(FIELD_COLUMNS)
            .enumerate()
            .map(|(offset, column)| format!("{column} = {}", self.dialect.placeholder(offset + 1)))
            .collect::<Vec<_>>();
        let filter = predicate.render_from(self.dialect, MAX_FIELDS + 2);

        let mut params = record_params(record);
        params.extend(filter.params);
        SqlFragment {
            sql: format!("UPDATE {} SET {} WHERE {}", self.table, assignments.join(", "), filter.sql),
            params,
        }
    }

    #[must_use]
    pub fn clear(&self) -> SqlFragment {
        SqlFragment { sql: self.dialect.clear_table(&self.table), params: Vec::new() }
    }
}

fn record_params(record: &PolicyRecord) -> Vec<Option<String>> {
    std::iter::once(Some(record.ptype().to_string())).chain(record.values().iter().cloned()).collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum Driver {
    Sqlite,
    Postgres,
    Mysql,
    Mssql,
}

impl Driver {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite3",
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Mssql => "mssql",
        }
    }

    /// Resolve a driver selector such as `sqlite3` or `postgres`.
    ///
    /// # Errors
    /// Returns [`AdapterError::Config`] for an unknown selector.
    pub fn parse(value: &str) -> Result<Self, AdapterError> {
        match value {
            "sqlite3" | "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            "mssql" | "sqlserver" => Ok(Self::Mssql),
            other => Err(AdapterError::Config(format!("unsupported driver: {other}"))),
        }
    }

    #[must_use]
    pub fn dialect(self) -> Dialect {
        match self {
            Self::Sqlite => Dialect::Sqlite,
            Self::Postgres => Dialect::Postgres,
            Self::Mysql => Dialect::Mysql,
            Self::Mssql => Dialect::Mssql,
        }
    }
}

impl TryFrom<String> for Driver {
    type Error = AdapterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Driver> for String {
    fn from(driver: Driver) -> Self {
        driver.as_str().to_string()
    }
}

impl Display for Driver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a full save replaces the table contents.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SaveMode {
    /// Clear and re-insert inside one transaction.
    #[default]
    Transactional,
    /// Clear, then insert in a second step. Readers in between see an empty table.
    TruncateThenInsert,
}

impl SaveMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transactional => "transactional",
            Self::TruncateThenInsert => "truncate-then-insert",
        }
    }
}

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdapterConfig {
    pub driver: Driver,
    pub dsn: String,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default)]
    pub save_mode: SaveMode,
}

impl AdapterConfig {
    #[must_use]
    pub fn new(driver: Driver, dsn: impl Into<String>) -> Self {
        Self {
            driver,
            dsn: dsn.into(),
            table_name: default_table_name(),
            save_mode: SaveMode::default(),
        }
    }

    #[must_use]
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    #[must_use]
    pub fn with_save_mode(mut self, save_mode: SaveMode) -> Self {
        self.save_mode = save_mode;
        self
    }

    /// Parse and validate a JSON adapter configuration.
    ///
    /// # Errors
    /// Returns [`AdapterError::Config`] for malformed JSON, an unknown driver,
    /// or an invalid table name.
    pub fn from_json(raw: &str) -> Result<Self, AdapterError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| AdapterError::Config(format!("invalid adapter config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`AdapterError::Config`] when the table name is not a plain identifier.
    pub fn validate(&self) -> Result<(), AdapterError> {
        validate_table_name(&self.table_name)
    }
}

/// Opens a store for one driver. Implemented once per engine the build links.
pub trait Connector {
    type Store: PolicyAdapter;

    fn driver(&self) -> Driver;

    /// # Errors
    /// Returns a config or storage error when the store cannot be opened.
    fn open(&self, config: &AdapterConfig) -> Result<Self::Store, AdapterError>;
}

/// Open `config` through `connector`, refusing configs for another engine.
///
/// # Errors
/// Returns [`AdapterError::Config`] on a driver mismatch or invalid config,
/// otherwise whatever the connector reports.
pub fn connect<C: Connector>(connector: &C, config: &AdapterConfig) -> Result<C::Store, AdapterError> {
    config.validate()?;
    if connector.driver() != config.driver {
        return Err(AdapterError::Config(format!(
            "no connector available for driver {}",
            config.driver
        )));
    }
    connector.open(config)
}

/// The authorization model's in-memory rule sets, as seen by an adapter.
pub trait PolicyModel {
    fn has_policy(&self, sec: &str, ptype: &str, rule: &[String]) -> bool;

    fn add_policy(&mut self, sec: &str, ptype: &str, rule: Vec<String>);

    /// Every rule of section `sec`, grouped by rule type in ascending order.
    fn policies(&self, sec: &str) -> Vec<(String, Vec<Vec<String>>)>;
}

/// Add a stored record to `model` unless the model already holds it.
pub fn load_record_into(model: &mut dyn PolicyModel, record: &PolicyRecord) {
    let rule = record.decode();
    let sec = record.section();
    if model.has_policy(sec, record.ptype(), &rule) {
        return;
    }
    model.add_policy(sec, record.ptype(), rule);
}

/// Every policy (`p`) rule followed by every role (`g`) rule held by `model`.
///
/// # Errors
/// Returns the first encoding error.
pub fn collect_model_records(model: &dyn PolicyModel) -> Result<Vec<PolicyRecord>, AdapterError> {
    let mut records = Vec::new();
    for sec in ["p", "g"] {
        for (ptype, rules) in model.policies(sec) {
            records.extend(encode_all(&ptype, &rules)?);
        }
    }
    Ok(records)
}

/// The adapter contract an authorization engine expects from a rule store.
pub trait PolicyAdapter {
    /// # Errors
    /// Returns a storage error when rows cannot be read.
    fn load_policy(&mut self, model: &mut dyn PolicyModel) -> Result<(), AdapterError>;

    /// # Errors
    /// Returns an encoding or storage error; nothing is written on encoding errors.
    fn save_policy(&mut self, model: &dyn PolicyModel) -> Result<(), AdapterError>;

    /// # Errors
    /// Returns an encoding or storage error.
    fn add_policy(&mut self, sec: &str, ptype: &str, rule: &[String]) -> Result<(), AdapterError>;

    /// # Errors
    /// Returns an encoding or storage error; no rule is added on failure.
    fn add_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        rules: &[Vec<String>],
    ) -> Result<(), AdapterError>;

    /// # Errors
    /// Returns an encoding or storage error.
    fn remove_policy(&mut self, sec: &str, ptype: &str, rule: &[String])
        -> Result<(), AdapterError>;

    /// # Errors
    /// Returns an encoding or storage error; no rule is removed on failure.
    fn remove_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        rules: &[Vec<String>],
    ) -> Result<(), AdapterError>;

    /// # Errors
    /// Returns a storage error. Matching nothing is not an error.
    fn remove_filtered_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        field_index: isize,
        field_values: &[String],
    ) -> Result<(), AdapterError>;

    /// # Errors
    /// Returns an encoding or storage error.
    fn update_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        old_rule: &[String],
        new_rule: &[String],
    ) -> Result<(), AdapterError>;

    /// # Errors
    /// Returns [`AdapterError::Mismatch`] when the lists differ in length, or an
    /// encoding or storage error; nothing is updated on failure.
    fn update_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        old_rules: &[Vec<String>],
        new_rules: &[Vec<String>],
    ) -> Result<(), AdapterError>;

    /// Replace every rule matching the filter with `new_rules`, returning the
    /// displaced rules in storage order.
    ///
    /// # Errors
    /// Returns an encoding or storage error; the store is unchanged on failure.
    fn update_filtered_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        new_rules: &[Vec<String>],
        field_index: isize,
        field_values: &[String],
    ) -> Result<Vec<Vec<String>>, AdapterError>;
}

/// Minimal in-memory [`PolicyModel`]: section -> rule type -> rules in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryModel {
    sections: BTreeMap<String, BTreeMap<String, Vec<Vec<String>>>>,
}

impl MemoryModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the rules of a CSV policy file.
    ///
    /// # Errors
    /// Returns an encoding error for a line with too many fields.
    pub fn from_csv(text: &str) -> Result<Self, AdapterError> {
        let mut model = Self::new();
        for line in text.lines() {
            if let Some(record) = parse_policy_line(line)? {
                load_record_into(&mut model, &record);
            }
        }
        Ok(model)
    }

    #[must_use]
    pub fn rules(&self, ptype: &str) -> &[Vec<String>] {
        self.sections
            .get(section_of(ptype))
            .and_then(|types| types.get(ptype))
            .map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.values().flat_map(BTreeMap::values).map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return the rules of `ptype` matching the filter.
    pub fn remove_filtered<S: AsRef<str>>(
        &mut self,
        ptype: &str,
        field_index: isize,
        values: &[S],
    ) -> Vec<Vec<String>> {
        let predicate = Predicate::filtered(ptype, field_index, values);
        let Some(rules) =
            self.sections.get_mut(section_of(ptype)).and_then(|types| types.get_mut(ptype))
        else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        rules.retain(|rule| {
            let matched = PolicyRecord::encode(ptype, rule)
                .is_ok_and(|record| predicate.matches(&record));
            if matched {
                removed.push(rule.clone());
            }
            !matched
        });
        removed
    }
}

impl PolicyModel for MemoryModel {
    fn has_policy(&self, sec: &str, ptype: &str, rule: &[String]) -> bool {
        self.sections
            .get(sec)
            .and_then(|types| types.get(ptype))
            .is_some_and(|rules| rules.iter().any(|existing| existing.as_slice() == rule))
    }

    fn add_policy(&mut self, sec: &str, ptype: &str, rule: Vec<String>) {
        self.sections
            .entry(sec.to_string())
            .or_default()
            .entry(ptype.to_string())
            .or_default()
            .push(rule);
    }

    fn policies(&self, sec: &str) -> Vec<(String, Vec<Vec<String>>)> {
        self.sections
            .get(sec)
            .map(|types| types.iter().map(|(ptype, rules)| (ptype.clone(), rules.clone())).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn record(ptype: &str, values: &[&str]) -> PolicyRecord {
        match PolicyRecord::encode(ptype, values) {
            Ok(record) => record,
            Err(err) => panic!("fixture rule {ptype} {values:?} failed to encode: {err}"),
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn encode_rejects_more_than_six_fields() {
        let err = PolicyRecord::encode("p", &["a", "b", "c", "d", "e", "f", "g"]);
        assert!(matches!(err, Err(AdapterError::TooManyFields { count: 7, .. })));
    }

    #[test]
    fn encode_rejects_empty_rule_type() {
        assert!(matches!(PolicyRecord::encode("", &["alice"]), Err(AdapterError::InvalidRuleType)));
    }

    #[test]
    fn empty_string_field_is_present_not_absent() {
        let rule = record("p", &["alice", "", "read"]);
        assert_eq!(rule.present(), 3);
        assert_eq!(rule.field(1), Some(""));
        assert_eq!(rule.field(3), None);
        assert_eq!(rule.decode(), strings(&["alice", "", "read"]));
    }

    #[test]
    fn trailing_empty_string_survives_decode() {
        let rule = record("p", &["alice", ""]);
        assert_eq!(rule.present(), 2);
        assert_eq!(rule.decode(), strings(&["alice", ""]));
    }

    #[test]
    fn decode_fills_interior_gaps_from_foreign_rows() {
        let rule = PolicyRecord::from_columns(
            "p".to_string(),
            [Some("alice".to_string()), None, Some("read".to_string()), None, None, None],
        );
        assert_eq!(rule.decode(), strings(&["alice", "", "read"]));
    }

    #[test]
    fn section_is_first_character_of_rule_type() {
        assert_eq!(section_of("p"), "p");
        assert_eq!(section_of("g2"), "g");
        assert_eq!(record("p3", &["x"]).section(), "p");
    }

    #[test]
    fn display_uses_csv_line_form() {
        assert_eq!(record("p", &["alice", "data1", "read"]).to_string(), "p, alice, data1, read");
    }

    #[test]
    fn parse_policy_line_skips_comments_and_blank_lines() -> Result<(), AdapterError> {
        assert_eq!(parse_policy_line("  ")?, None);
        assert_eq!(parse_policy_line("# p, alice")?, None);
        assert_eq!(parse_policy_line(" g ,alice,  data2_admin ")?, Some(record("g", &["alice", "data2_admin"])));
        Ok(())
    }

    #[test]
    fn compile_constrains_contiguous_range() {
        let set = ConstraintSet::compile(1, &["data1", "read"]);
        assert!(!set.is_constrained(0));
        assert_eq!(set.get(1), Some(&FieldConstraint::Exact("data1".to_string())));
        assert_eq!(set.get(2), Some(&FieldConstraint::Exact("read".to_string())));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn compile_drops_out_of_range_contributions() {
        let set = ConstraintSet::compile(-2, &["skip", "skip", "alice"]);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, &FieldConstraint::Exact("alice".to_string()))]);

        let set = ConstraintSet::compile(4, &["a", "b", "c", "d"]);
        assert_eq!(set.iter().map(|(index, _)| index).collect::<Vec<_>>(), vec![4, 5]);

        assert!(ConstraintSet::compile(6, &["a"]).is_empty());
        assert!(ConstraintSet::compile(isize::MAX, &["a", "b"]).is_empty());
        assert!(ConstraintSet::compile(isize::MIN, &["a"]).is_empty());
        assert!(ConstraintSet::compile::<&str>(0, &[]).is_empty());
    }

    #[test]
    fn empty_filter_value_compiles_to_wildcard() {
        let set = ConstraintSet::compile(0, &["", "data1"]);
        assert_eq!(set.get(0), Some(&FieldConstraint::Wildcard));
        assert!(FieldConstraint::Wildcard.matches(Some("")));
        assert!(FieldConstraint::Wildcard.matches(Some("alice")));
        assert!(!FieldConstraint::Wildcard.matches(None));
    }

    #[test]
    fn exact_constraints_keep_empty_strings_literal() {
        let set = ConstraintSet::exact(&record("p", &["alice", ""]));
        assert_eq!(set.get(1), Some(&FieldConstraint::Exact(String::new())));
        assert!(!set.is_constrained(2));
    }

    #[test]
    fn predicate_renders_in_ascending_field_order() {
        let predicate = Predicate::filtered("p", 0, &["alice", "", "read"]);
        let rendered = predicate.render(Dialect::Sqlite);
        assert_eq!(rendered.sql, "ptype = ?1 AND v0 = ?2 AND v1 LIKE '%' AND v2 = ?3");
        assert_eq!(
            rendered.params,
            vec![Some("p".to_string()), Some("alice".to_string()), Some("read".to_string())]
        );
    }

    #[test]
    fn predicate_placeholders_follow_dialect() {
        let predicate = Predicate::filtered("g", 1, &["data2_admin"]);
        assert_eq!(predicate.render(Dialect::Sqlite).sql, "ptype = ?1 AND v1 = ?2");
        assert_eq!(predicate.render(Dialect::Postgres).sql, "ptype = $1 AND v1 = $2");
        assert_eq!(predicate.render(Dialect::Mysql).sql, "ptype = ? AND v1 = ?");
        assert_eq!(predicate.render(Dialect::Mssql).sql, "ptype = @p1 AND v1 = @p2");
    }

    #[test]
    fn predicate_without_values_only_checks_rule_type() {
        let predicate = Predicate::filtered::<&str>("p", 0, &[]);
        assert_eq!(predicate.render(Dialect::Postgres).sql, "ptype = $1");
        assert!(predicate.matches(&record("p", &["anything"])));
        assert!(!predicate.matches(&record("p2", &["anything"])));
    }

    #[test]
    fn wildcard_rejects_null_but_unconstrained_accepts_it() {
        let short = record("p", &["alice"]);
        assert!(!Predicate::filtered("p", 0, &["alice", ""]).matches(&short));
        assert!(Predicate::filtered("p", 0, &["alice"]).matches(&short));
    }

    #[test]
    fn update_statement_numbers_filter_after_assignments() -> Result<(), AdapterError> {
        let statements = TableStatements::new("casbin_policy", Dialect::Postgres)?;
        let old = record("p", &["alice", "data1", "read"]);
        let new = record("p", &["alice", "data1", "write"]);
        let statement = statements.update(&new, &Predicate::exact(&old));
        assert_eq!(
            statement.sql,
            "UPDATE \"casbin_policy\" SET ptype = $1, v0 = $2, v1 = $3, v2 = $4, v3 = $5, v4 = $6, v5 = $7 \
             WHERE ptype = $8 AND v0 = $9 AND v1 = $10 AND v2 = $11"
        );
        assert_eq!(statement.params.len(), 11);
        assert_eq!(statement.params[4], None);
        Ok(())
    }

    #[test]
    fn clear_statement_follows_dialect() -> Result<(), AdapterError> {
        assert_eq!(TableStatements::new("rules", Dialect::Sqlite)?.clear().sql, "DELETE FROM \"rules\"");
        assert_eq!(TableStatements::new("rules", Dialect::Mysql)?.clear().sql, "TRUNCATE TABLE `rules`");
        assert_eq!(TableStatements::new("rules", Dialect::Mssql)?.clear().sql, "TRUNCATE TABLE [rules]");
        Ok(())
    }

    #[test]
    fn table_names_must_be_identifiers() {
        assert!(validate_table_name("casbin_policy").is_ok());
        assert!(validate_table_name("_rules2").is_ok());
        for bad in ["", "2rules", "rules; DROP TABLE x", "a-b", "\"quoted\""] {
            assert!(matches!(validate_table_name(bad), Err(AdapterError::Config(_))), "{bad}");
        }
        assert!(validate_table_name(&"t".repeat(64)).is_err());
    }

    #[test]
    fn unknown_driver_is_a_config_error() {
        assert!(matches!(Driver::parse("oracle"), Err(AdapterError::Config(_))));
        assert!(matches!(Driver::parse("sqlite3"), Ok(Driver::Sqlite)));
        assert!(matches!(Driver::parse("postgresql"), Ok(Driver::Postgres)));
    }

    #[test]
    fn config_from_json_applies_defaults() -> Result<(), AdapterError> {
        let config = AdapterConfig::from_json(r#"{"driver":"sqlite3","dsn":":memory:"}"#)?;
        assert_eq!(config, AdapterConfig::new(Driver::Sqlite, ":memory:"));
        assert_eq!(config.table_name, DEFAULT_TABLE_NAME);
        assert_eq!(config.save_mode, SaveMode::Transactional);

        let custom = AdapterConfig::from_json(
            r#"{"driver":"mysql","dsn":"root@/test","table_name":"rules","save_mode":"truncate-then-insert"}"#,
        )?;
        assert_eq!(custom.driver, Driver::Mysql);
        assert_eq!(custom.save_mode, SaveMode::TruncateThenInsert);
        Ok(())
    }

    #[test]
    fn config_from_json_rejects_bad_driver_and_table() {
        assert!(matches!(
            AdapterConfig::from_json(r#"{"driver":"oracle","dsn":"x"}"#),
            Err(AdapterError::Config(_))
        ));
        assert!(matches!(
            AdapterConfig::from_json(r#"{"driver":"sqlite3","dsn":"x","table_name":"bad name"}"#),
            Err(AdapterError::Config(_))
        ));
    }

    #[test]
    fn memory_model_loads_csv_and_skips_duplicates() -> Result<(), AdapterError> {
        let model = MemoryModel::from_csv(
            "p, alice, data1, read\np, alice, data1, read\n\ng, alice, data2_admin\n",
        )?;
        assert_eq!(model.rules("p"), &[strings(&["alice", "data1", "read"])]);
        assert_eq!(model.rules("g"), &[strings(&["alice", "data2_admin"])]);
        assert_eq!(model.len(), 2);
        Ok(())
    }

    #[test]
    fn collect_model_records_orders_policies_before_roles() -> Result<(), AdapterError> {
        let mut model = MemoryModel::new();
        model.add_policy("g", "g", strings(&["alice", "admin"]));
        model.add_policy("p", "p2", strings(&["bob", "data2"]));
        model.add_policy("p", "p", strings(&["alice", "data1", "read"]));

        let records = collect_model_records(&model)?;
        let types = records.iter().map(PolicyRecord::ptype).collect::<Vec<_>>();
        assert_eq!(types, vec!["p", "p2", "g"]);
        Ok(())
    }

    #[test]
    fn memory_model_remove_filtered_returns_removed_rules() -> Result<(), AdapterError> {
        let mut model = MemoryModel::from_csv(
            "p, alice, data1, read\np, bob, data2, write\np, data2_admin, data2, read\n",
        )?;
        let removed = model.remove_filtered("p", 1, &["data2"]);
        assert_eq!(removed, vec![strings(&["bob", "data2", "write"]), strings(&["data2_admin", "data2", "read"])]);
        assert_eq!(model.rules("p"), &[strings(&["alice", "data1", "read"])]);
        Ok(())
    }

    proptest! {
        #[test]
        fn property_decode_inverts_encode(
            ptype in "[pg][0-9]?",
            values in proptest::collection::vec(".{0,8}", 0..=MAX_FIELDS),
        ) {
            let encoded = PolicyRecord::encode(&ptype, &values);
            prop_assert!(encoded.is_ok());
            let encoded = encoded.unwrap_or_else(|_| unreachable!());
            prop_assert_eq!(encoded.present(), values.len());
            prop_assert_eq!(encoded.decode(), values);
        }
    }

    proptest! {
        #[test]
        fn property_compile_constrains_exactly_the_clamped_range(
            field_index in -8_isize..10,
            values in proptest::collection::vec("[a-z]{0,3}", 0..8),
        ) {
            let set = ConstraintSet::compile(field_index, &values);
            let len = isize::try_from(values.len()).unwrap_or(isize::MAX);
            for index in 0..MAX_FIELDS {
                let position = isize::try_from(index).unwrap_or(isize::MAX);
                let expected = field_index <= position && position < field_index + len;
                prop_assert_eq!(set.is_constrained(index), expected);
                if expected {
                    let offset = usize::try_from(position - field_index).unwrap_or(usize::MAX);
                    let value = &values[offset];
                    let constraint = set.get(index);
                    if value.is_empty() {
                        prop_assert_eq!(constraint, Some(&FieldConstraint::Wildcard));
                    } else {
                        prop_assert_eq!(constraint, Some(&FieldConstraint::Exact(value.clone())));
                    }
                }
            }
        }
    }

    proptest! {
        #[test]
        fn property_empty_filter_value_matches_any_stored_value(
            stored in "[a-z]{0,5}",
            field_index in 0_usize..3,
        ) {
            let mut values = vec!["x".to_string(); 3];
            values[field_index] = stored;
            let rule = PolicyRecord::encode("p", &values);
            prop_assert!(rule.is_ok());
            let rule = rule.unwrap_or_else(|_| unreachable!());

            let mut filter = values.clone();
            filter[field_index] = String::new();
            prop_assert!(Predicate::filtered("p", 0, &filter).matches(&rule));
        }
    }
}
