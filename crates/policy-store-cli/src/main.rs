use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use policy_store_core::{
    connect, section_of, AdapterConfig, Driver, MemoryModel, PolicyRecord, SaveMode,
    DEFAULT_TABLE_NAME,
};
use policy_store_sqlite::{DeadlineAdapter, SqliteConnector};
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "psa")]
#[command(about = "Policy rule store adapter CLI")]
struct Cli {
    #[arg(long, default_value = "./policy_store.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = DEFAULT_TABLE_NAME)]
    table: String,

    /// Storage engine selector (`sqlite3`, `postgres`, `mysql`, `mssql`).
    #[arg(long, default_value = "sqlite3", value_parser = parse_driver)]
    driver: Driver,

    #[arg(long, value_enum, default_value_t = SaveModeArg::Transactional)]
    save_mode: SaveModeArg,

    /// Deadline applied to each store operation.
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SaveModeArg {
    Transactional,
    TruncateThenInsert,
}

impl From<SaveModeArg> for SaveMode {
    fn from(value: SaveModeArg) -> Self {
        match value {
            SaveModeArg::Transactional => Self::Transactional,
            SaveModeArg::TruncateThenInsert => Self::TruncateThenInsert,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the rule table if it does not exist.
    Init,
    /// Print stored rules in storage order.
    List(ListArgs),
    /// Replace every stored rule with the rules of a CSV policy file.
    Save(SaveArgs),
    Add(RuleArgs),
    Remove(RuleArgs),
    RemoveFiltered(FilterArgs),
    Update(UpdateArgs),
    UpdateFiltered(UpdateFilteredArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    ptype: Option<String>,
}

#[derive(Debug, Args)]
struct SaveArgs {
    #[arg(long)]
    policy: PathBuf,
}

#[derive(Debug, Args)]
struct RuleArgs {
    ptype: String,
    #[arg(allow_hyphen_values = true)]
    values: Vec<String>,
}

#[derive(Debug, Args)]
struct FilterArgs {
    ptype: String,
    #[arg(long, allow_hyphen_values = true)]
    field_index: isize,
    /// Filter values; an empty string matches any stored value.
    #[arg(allow_hyphen_values = true)]
    values: Vec<String>,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    ptype: String,
    #[arg(long, value_delimiter = ',')]
    old: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    new: Vec<String>,
}

#[derive(Debug, Args)]
struct UpdateFilteredArgs {
    ptype: String,
    #[arg(long, allow_hyphen_values = true)]
    field_index: isize,
    /// Replacement rule as comma-separated values; repeat for several rules.
    #[arg(long = "new", required = true)]
    new_rules: Vec<String>,
    #[arg(allow_hyphen_values = true, last = true)]
    values: Vec<String>,
}

fn parse_driver(raw: &str) -> Result<Driver, String> {
    Driver::parse(raw).map_err(|err| err.to_string())
}

fn split_rule(raw: &str) -> Vec<String> {
    raw.split(',').map(|value| value.trim().to_string()).collect()
}

fn rule_json(ptype: &str, rule: &[String]) -> Value {
    json!({ "ptype": ptype, "rule": rule })
}

fn record_json(record: &PolicyRecord) -> Value {
    rule_json(record.ptype(), &record.decode())
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn run(
    command: Command,
    adapter: &DeadlineAdapter,
    config: &AdapterConfig,
    deadline: Duration,
) -> Result<Value> {
    match command {
        Command::Init => Ok(json!({
            "db": config.dsn,
            "driver": config.driver.as_str(),
            "table": config.table_name,
            "save_mode": config.save_mode.as_str(),
        })),
        Command::List(args) => {
            let records = adapter.with_store(deadline, |store| store.load_records()).await?;
            let rules = records
                .iter()
                .filter(|record| match args.ptype.as_deref() {
                    Some(ptype) => record.ptype() == ptype,
                    None => true,
                })
                .map(record_json)
                .collect::<Vec<_>>();
            Ok(json!({ "count": rules.len(), "rules": rules }))
        }
        Command::Save(args) => {
            let text = fs::read_to_string(&args.policy)
                .with_context(|| format!("failed to read policy file {}", args.policy.display()))?;
            let model = MemoryModel::from_csv(&text)
                .with_context(|| format!("invalid policy file {}", args.policy.display()))?;
            adapter.save_policy(deadline, &model).await?;
            Ok(json!({ "saved": model.len(), "save_mode": config.save_mode.as_str() }))
        }
        Command::Add(args) => {
            let added = rule_json(&args.ptype, &args.values);
            adapter
                .add_policy(deadline, section_of(&args.ptype), &args.ptype, args.values)
                .await?;
            Ok(json!({ "added": added }))
        }
        Command::Remove(args) => {
            let removed = rule_json(&args.ptype, &args.values);
            adapter
                .remove_policy(deadline, section_of(&args.ptype), &args.ptype, args.values)
                .await?;
            Ok(json!({ "removed": removed }))
        }
        Command::RemoveFiltered(args) => {
            let FilterArgs { ptype, field_index, values } = args;
            let filter = json!({ "ptype": ptype, "field_index": field_index, "values": values });
            let removed = adapter
                .with_store(deadline, move |store| {
                    store.delete_filtered(&ptype, field_index, &values)
                })
                .await?;
            Ok(json!({ "filter": filter, "removed": removed }))
        }
        Command::Update(args) => {
            let old = rule_json(&args.ptype, &args.old);
            let new = rule_json(&args.ptype, &args.new);
            adapter
                .update_policy(deadline, section_of(&args.ptype), &args.ptype, args.old, args.new)
                .await?;
            Ok(json!({ "old": old, "new": new }))
        }
        Command::UpdateFiltered(args) => {
            let new_rules =
                args.new_rules.iter().map(String::as_str).map(split_rule).collect::<Vec<_>>();
            let inserted = new_rules.len();
            let displaced = adapter
                .update_filtered_policies(
                    deadline,
                    section_of(&args.ptype),
                    &args.ptype,
                    new_rules,
                    args.field_index,
                    args.values,
                )
                .await?;
            let displaced =
                displaced.iter().map(|rule| rule_json(&args.ptype, rule)).collect::<Vec<_>>();
            Ok(json!({ "displaced": displaced, "inserted": inserted }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AdapterConfig::new(cli.driver, cli.db.to_string_lossy())
        .with_table_name(cli.table.clone())
        .with_save_mode(cli.save_mode.into());
    let store = connect(&SqliteConnector, &config)
        .with_context(|| format!("failed to open policy store at {}", cli.db.display()))?;
    debug!(db = %cli.db.display(), table = %config.table_name, "policy store opened");

    let adapter = DeadlineAdapter::new(store);
    let deadline = Duration::from_millis(cli.timeout_ms);
    let output = run(cli.command, &adapter, &config, deadline).await?;
    emit_json(output)
}
