use std::path::Path;
use std::slice;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use policy_store_core::{
    collect_model_records, encode_all, load_record_into, AdapterConfig, AdapterError, Connector,
    Dialect, Driver, PolicyAdapter, PolicyModel, PolicyRecord, Predicate, SaveMode, SqlFragment,
    TableStatements, DEFAULT_TABLE_NAME,
};
use rusqlite::{params_from_iter, Connection, ErrorCode, TransactionBehavior};
use tracing::{debug, warn};

mod deadline;

pub use deadline::{DeadlineAdapter, DEFAULT_DEADLINE};

/// VM instructions between cancellation checks inside a running statement.
const PROGRESS_CHECK_OPS: i32 = 1_000;

const OPERATION_ACTIVE: u8 = 0;
const OPERATION_CANCELLED: u8 = 1;
const OPERATION_COMMITTED: u8 = 2;

const CONFIGURE_CONNECTION_SQL: &str = "PRAGMA journal_mode = WAL;
     PRAGMA busy_timeout = 5000;";

fn create_table_sql(table_name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table_name}\" (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ptype TEXT NOT NULL,
  v0 TEXT,
  v1 TEXT,
  v2 TEXT,
  v3 TEXT,
  v4 TEXT,
  v5 TEXT
);

CREATE INDEX IF NOT EXISTS \"idx_{table_name}_ptype\" ON \"{table_name}\"(ptype);"
    )
}

/// Operation name and rule type attached to every storage failure.
#[derive(Debug, Clone, Copy)]
struct Op<'a> {
    name: &'static str,
    ptype: &'a str,
}

impl<'a> Op<'a> {
    fn new(name: &'static str, ptype: &'a str) -> Self {
        Self { name, ptype }
    }

    fn all(name: &'static str) -> Op<'static> {
        Op { name, ptype: "*" }
    }

    fn fail(self, err: rusqlite::Error) -> AdapterError {
        if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
            return AdapterError::Cancelled { operation: self.name };
        }
        AdapterError::storage(self.name, self.ptype, err)
    }
}

/// Cancellation state of one store operation.
///
/// Cancelling and the operation's first commit race on one atomic, so exactly
/// one of them wins: a cancelled operation never commits, and an operation
/// that has committed can no longer be cancelled.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the operation has already committed.
    pub(crate) fn cancel(&self) -> bool {
        match self.0.compare_exchange(
            OPERATION_ACTIVE,
            OPERATION_CANCELLED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(current) => current == OPERATION_CANCELLED,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) == OPERATION_CANCELLED
    }

    fn claim_commit(&self) -> bool {
        match self.0.compare_exchange(
            OPERATION_ACTIVE,
            OPERATION_COMMITTED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(current) => current == OPERATION_COMMITTED,
        }
    }
}

/// Policy rule table backed by one `SQLite` connection.
pub struct SqliteRuleStore {
    conn: Connection,
    table_name: String,
    statements: TableStatements,
    save_mode: SaveMode,
    cancel: CancelToken,
}

impl SqliteRuleStore {
    /// Open a store on the default `casbin_policy` table, creating it if needed.
    ///
    /// # Errors
    /// Returns a storage error when the database cannot be opened or prepared.
    pub fn open(path: &Path) -> Result<Self, AdapterError> {
        Self::open_with_table(path, DEFAULT_TABLE_NAME)
    }

    /// Open a store on `table_name`, creating the table if needed.
    ///
    /// # Errors
    /// Returns a config error for an invalid table name (before any I/O), or a
    /// storage error when the database cannot be opened or prepared.
    pub fn open_with_table(path: &Path, table_name: &str) -> Result<Self, AdapterError> {
        let statements = TableStatements::new(table_name, Dialect::Sqlite)?;
        let op = Op::all("open");
        let conn = Connection::open(path).map_err(|err| op.fail(err))?;
        conn.execute_batch(CONFIGURE_CONNECTION_SQL).map_err(|err| op.fail(err))?;

        let store = Self {
            conn,
            table_name: table_name.to_string(),
            statements,
            save_mode: SaveMode::default(),
            cancel: CancelToken::new(),
        };
        store.ensure_table()?;
        debug!(path = %path.display(), table = table_name, "opened sqlite rule store");
        Ok(store)
    }

    /// Open the store a configuration describes.
    ///
    /// # Errors
    /// Returns a config error when the config is invalid or names another driver.
    pub fn from_config(config: &AdapterConfig) -> Result<Self, AdapterError> {
        config.validate()?;
        if config.driver != Driver::Sqlite {
            return Err(AdapterError::Config(format!(
                "sqlite store cannot open a {} config",
                config.driver
            )));
        }
        Ok(Self::open_with_table(Path::new(&config.dsn), &config.table_name)?
            .with_save_mode(config.save_mode))
    }

    #[must_use]
    pub fn with_save_mode(mut self, save_mode: SaveMode) -> Self {
        self.save_mode = save_mode;
        self
    }

    #[must_use]
    pub fn save_mode(&self) -> SaveMode {
        self.save_mode
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Bind the running operation's token: once it is cancelled, the current
    /// statement aborts at its next progress check and no write commits.
    pub(crate) fn install_cancel_token(&mut self, token: CancelToken) {
        let check = token.clone();
        self.conn.progress_handler(PROGRESS_CHECK_OPS, Some(move || check.is_cancelled()));
        self.cancel = token;
    }

    pub(crate) fn clear_cancel_token(&mut self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
        self.cancel = CancelToken::new();
    }

    /// Create the rule table and its `ptype` index when missing.
    ///
    /// # Errors
    /// Returns a storage error when the DDL fails.
    pub fn ensure_table(&self) -> Result<(), AdapterError> {
        self.conn
            .execute_batch(&create_table_sql(&self.table_name))
            .map_err(|err| Op::all("ensure_table").fail(err))
    }

    /// Every stored rule in storage order.
    ///
    /// # Errors
    /// Returns a storage error when rows cannot be read.
    pub fn load_records(&self) -> Result<Vec<PolicyRecord>, AdapterError> {
        select_records(&self.conn, &self.statements.select_all())
            .map_err(|err| Op::all("load_records").fail(err))
    }

    /// Rules matching a filter, in storage order, without modifying anything.
    ///
    /// # Errors
    /// Returns a storage error when rows cannot be read.
    pub fn select_filtered<S: AsRef<str>>(
        &self,
        ptype: &str,
        field_index: isize,
        values: &[S],
    ) -> Result<Vec<PolicyRecord>, AdapterError> {
        let predicate = Predicate::filtered(ptype, field_index, values);
        select_records(&self.conn, &self.statements.select(&predicate))
            .map_err(|err| Op::new("select_filtered", ptype).fail(err))
    }

    /// Insert `records` in one transaction.
    ///
    /// # Errors
    /// Returns a storage error; nothing is inserted on failure.
    pub fn insert_records(&mut self, records: &[PolicyRecord]) -> Result<usize, AdapterError> {
        let op = Op::new("insert_records", records.first().map_or("*", PolicyRecord::ptype));
        let inserts = self.insert_statements(records);
        let inserted = self.write(op, |conn, cancel| execute_all(conn, &inserts, op, cancel))?;
        debug!(operation = op.name, ptype = op.ptype, inserted, "inserted rules");
        Ok(inserted)
    }

    /// Replace the whole table with `records`.
    ///
    /// With [`SaveMode::Transactional`] the clear and the inserts commit together.
    /// With [`SaveMode::TruncateThenInsert`] the clear commits first, so a
    /// concurrent reader can observe an empty table and a failed insert leaves
    /// it empty.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn replace_all(&mut self, records: &[PolicyRecord]) -> Result<(), AdapterError> {
        let op = Op::all("replace_all");
        let clear = self.statements.clear();
        let inserts = self.insert_statements(records);

        match self.save_mode {
            SaveMode::Transactional => {
                self.write(op, |conn, cancel| {
                    execute_all(conn, slice::from_ref(&clear), op, cancel)?;
                    execute_all(conn, &inserts, op, cancel)
                })?;
            }
            SaveMode::TruncateThenInsert => {
                self.write(op, |conn, cancel| {
                    execute_all(conn, slice::from_ref(&clear), op, cancel)
                })?;
                self.write(op, |conn, cancel| execute_all(conn, &inserts, op, cancel))?;
            }
        }

        debug!(
            operation = op.name,
            save_mode = self.save_mode.as_str(),
            rows = records.len(),
            "replaced rule table"
        );
        Ok(())
    }

    /// Delete rows equal to `record` on its rule type and every populated field.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn delete_exact(&mut self, record: &PolicyRecord) -> Result<usize, AdapterError> {
        let op = Op::new("delete_exact", record.ptype());
        let delete = self.statements.delete(&Predicate::exact(record));
        let deleted =
            self.write(op, |conn, cancel| execute_all(conn, slice::from_ref(&delete), op, cancel))?;
        debug!(operation = op.name, ptype = op.ptype, deleted, "deleted rules");
        Ok(deleted)
    }

    /// [`Self::delete_exact`] for several rules in one transaction.
    ///
    /// # Errors
    /// Returns a storage error; nothing is deleted on failure.
    pub fn delete_exact_many(&mut self, records: &[PolicyRecord]) -> Result<usize, AdapterError> {
        let op = Op::new("delete_exact_many", records.first().map_or("*", PolicyRecord::ptype));
        let deletes = records
            .iter()
            .map(|record| self.statements.delete(&Predicate::exact(record)))
            .collect::<Vec<_>>();
        let deleted = self.write(op, |conn, cancel| execute_all(conn, &deletes, op, cancel))?;
        debug!(operation = op.name, ptype = op.ptype, deleted, "deleted rules");
        Ok(deleted)
    }

    /// Delete every rule of `ptype` matching the filter. Matching nothing is not an error.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn delete_filtered<S: AsRef<str>>(
        &mut self,
        ptype: &str,
        field_index: isize,
        values: &[S],
    ) -> Result<usize, AdapterError> {
        let op = Op::new("delete_filtered", ptype);
        let delete = self.statements.delete(&Predicate::filtered(ptype, field_index, values));
        let deleted =
            self.write(op, |conn, cancel| execute_all(conn, slice::from_ref(&delete), op, cancel))?;
        debug!(operation = op.name, ptype, field_index, deleted, "deleted filtered rules");
        Ok(deleted)
    }

    /// Overwrite rows equal to `old` with `new`.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn update_exact(
        &mut self,
        old: &PolicyRecord,
        new: &PolicyRecord,
    ) -> Result<usize, AdapterError> {
        let op = Op::new("update_exact", old.ptype());
        let update = self.statements.update(new, &Predicate::exact(old));
        let updated =
            self.write(op, |conn, cancel| execute_all(conn, slice::from_ref(&update), op, cancel))?;
        debug!(operation = op.name, ptype = op.ptype, updated, "updated rules");
        Ok(updated)
    }

    /// [`Self::update_exact`] for several `(old, new)` pairs in one transaction.
    ///
    /// # Errors
    /// Returns a storage error; nothing is updated on failure.
    pub fn update_exact_many(
        &mut self,
        pairs: &[(PolicyRecord, PolicyRecord)],
    ) -> Result<usize, AdapterError> {
        let op = Op::new("update_exact_many", pairs.first().map_or("*", |(old, _)| old.ptype()));
        let updates = pairs
            .iter()
            .map(|(old, new)| self.statements.update(new, &Predicate::exact(old)))
            .collect::<Vec<_>>();
        let updated = self.write(op, |conn, cancel| execute_all(conn, &updates, op, cancel))?;
        debug!(operation = op.name, ptype = op.ptype, updated, "updated rules");
        Ok(updated)
    }

    /// Atomically swap the rules matching a filter for `new_records`.
    ///
    /// Selects the matching rows, deletes them with the same predicate and
    /// inserts the replacements inside one transaction. Returns the displaced
    /// rows in storage order; on any failure the table is left untouched.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn replace_filtered<S: AsRef<str>>(
        &mut self,
        ptype: &str,
        new_records: &[PolicyRecord],
        field_index: isize,
        values: &[S],
    ) -> Result<Vec<PolicyRecord>, AdapterError> {
        let op = Op::new("replace_filtered", ptype);
        let predicate = Predicate::filtered(ptype, field_index, values);
        let select = self.statements.select(&predicate);
        let delete = self.statements.delete(&predicate);
        let inserts = self.insert_statements(new_records);

        let displaced = self.write(op, |conn, cancel| {
            let displaced = select_records(conn, &select).map_err(|err| op.fail(err))?;
            let deleted = execute_all(conn, slice::from_ref(&delete), op, cancel)?;
            if deleted != displaced.len() {
                warn!(
                    operation = op.name,
                    ptype,
                    selected = displaced.len(),
                    deleted,
                    "filtered delete removed a different row count than it selected"
                );
            }
            execute_all(conn, &inserts, op, cancel)?;
            Ok(displaced)
        })?;

        debug!(
            operation = op.name,
            ptype,
            field_index,
            displaced = displaced.len(),
            inserted = new_records.len(),
            "replaced filtered rules"
        );
        Ok(displaced)
    }

    /// Run `work` in one transaction guarded by the current cancellation token.
    fn write<T>(
        &mut self,
        op: Op<'_>,
        work: impl FnOnce(&Connection, &CancelToken) -> Result<T, AdapterError>,
    ) -> Result<T, AdapterError> {
        let cancel = self.cancel.clone();
        in_transaction(&mut self.conn, op, &cancel, |conn| work(conn, &cancel))
    }

    fn insert_statements(&self, records: &[PolicyRecord]) -> Vec<SqlFragment> {
        records.iter().map(|record| self.statements.insert(record)).collect()
    }
}

fn select_records(
    conn: &Connection,
    statement: &SqlFragment,
) -> rusqlite::Result<Vec<PolicyRecord>> {
    let mut stmt = conn.prepare_cached(&statement.sql)?;
    let rows = stmt.query_map(params_from_iter(&statement.params), |row| {
        Ok(PolicyRecord::from_columns(
            row.get(0)?,
            [row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?],
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

fn execute(conn: &Connection, statement: &SqlFragment) -> rusqlite::Result<usize> {
    conn.prepare_cached(&statement.sql)?.execute(params_from_iter(&statement.params))
}

fn execute_all(
    conn: &Connection,
    statements: &[SqlFragment],
    op: Op<'_>,
    cancel: &CancelToken,
) -> Result<usize, AdapterError> {
    let mut affected = 0;
    for statement in statements {
        if cancel.is_cancelled() {
            return Err(AdapterError::Cancelled { operation: op.name });
        }
        affected += execute(conn, statement).map_err(|err| op.fail(err))?;
    }
    Ok(affected)
}

/// Run `work` in an immediate transaction, committing on success and rolling
/// back before any error is returned. The commit only happens if `cancel` has
/// not been tripped; once claimed, the operation can no longer be cancelled.
fn in_transaction<T>(
    conn: &mut Connection,
    op: Op<'_>,
    cancel: &CancelToken,
    work: impl FnOnce(&Connection) -> Result<T, AdapterError>,
) -> Result<T, AdapterError> {
    if cancel.is_cancelled() {
        return Err(AdapterError::Cancelled { operation: op.name });
    }
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|err| op.fail(err))?;

    let outcome = work(&tx).and_then(|value| {
        if cancel.claim_commit() {
            Ok(value)
        } else {
            Err(AdapterError::Cancelled { operation: op.name })
        }
    });

    match outcome {
        Ok(value) => {
            tx.commit().map_err(|err| op.fail(err))?;
            Ok(value)
        }
        Err(err) => {
            warn!(operation = op.name, ptype = op.ptype, error = %err, "rolling back transaction");
            if let Err(rollback_err) = tx.rollback() {
                warn!(operation = op.name, error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

impl PolicyAdapter for SqliteRuleStore {
    fn load_policy(&mut self, model: &mut dyn PolicyModel) -> Result<(), AdapterError> {
        let records = self.load_records()?;
        for record in &records {
            load_record_into(model, record);
        }
        debug!(rows = records.len(), "loaded policy");
        Ok(())
    }

    fn save_policy(&mut self, model: &dyn PolicyModel) -> Result<(), AdapterError> {
        let records = collect_model_records(model)?;
        self.replace_all(&records)
    }

    fn add_policy(&mut self, _sec: &str, ptype: &str, rule: &[String]) -> Result<(), AdapterError> {
        let record = PolicyRecord::encode(ptype, rule)?;
        self.insert_records(slice::from_ref(&record)).map(|_| ())
    }

    fn add_policies(
        &mut self,
        _sec: &str,
        ptype: &str,
        rules: &[Vec<String>],
    ) -> Result<(), AdapterError> {
        let records = encode_all(ptype, rules)?;
        self.insert_records(&records).map(|_| ())
    }

    fn remove_policy(
        &mut self,
        _sec: &str,
        ptype: &str,
        rule: &[String],
    ) -> Result<(), AdapterError> {
        let record = PolicyRecord::encode(ptype, rule)?;
        self.delete_exact(&record).map(|_| ())
    }

    fn remove_policies(
        &mut self,
        _sec: &str,
        ptype: &str,
        rules: &[Vec<String>],
    ) -> Result<(), AdapterError> {
        let records = encode_all(ptype, rules)?;
        self.delete_exact_many(&records).map(|_| ())
    }

    fn remove_filtered_policy(
        &mut self,
        _sec: &str,
        ptype: &str,
        field_index: isize,
        field_values: &[String],
    ) -> Result<(), AdapterError> {
        self.delete_filtered(ptype, field_index, field_values).map(|_| ())
    }

    fn update_policy(
        &mut self,
        _sec: &str,
        ptype: &str,
        old_rule: &[String],
        new_rule: &[String],
    ) -> Result<(), AdapterError> {
        let old = PolicyRecord::encode(ptype, old_rule)?;
        let new = PolicyRecord::encode(ptype, new_rule)?;
        self.update_exact(&old, &new).map(|_| ())
    }

    fn update_policies(
        &mut self,
        _sec: &str,
        ptype: &str,
        old_rules: &[Vec<String>],
        new_rules: &[Vec<String>],
    ) -> Result<(), AdapterError> {
        if old_rules.len() != new_rules.len() {
            return Err(AdapterError::Mismatch {
                operation: "update_policies",
                old: old_rules.len(),
                new: new_rules.len(),
            });
        }
        let pairs = encode_all(ptype, old_rules)?
            .into_iter()
            .zip(encode_all(ptype, new_rules)?)
            .collect::<Vec<_>>();
        self.update_exact_many(&pairs).map(|_| ())
    }

    fn update_filtered_policies(
        &mut self,
        _sec: &str,
        ptype: &str,
        new_rules: &[Vec<String>],
        field_index: isize,
        field_values: &[String],
    ) -> Result<Vec<Vec<String>>, AdapterError> {
        let records = encode_all(ptype, new_rules)?;
        let displaced = self.replace_filtered(ptype, &records, field_index, field_values)?;
        Ok(displaced.iter().map(PolicyRecord::decode).collect())
    }
}

/// [`Connector`] for `SQLite`; the config's `dsn` is the database path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnector;

impl Connector for SqliteConnector {
    type Store = SqliteRuleStore;

    fn driver(&self) -> Driver {
        Driver::Sqlite
    }

    fn open(&self, config: &AdapterConfig) -> Result<Self::Store, AdapterError> {
        SqliteRuleStore::from_config(config)
    }
}
