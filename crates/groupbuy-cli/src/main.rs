use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use groupbuy_api::{
    AddOutcome, BackendConfig, DynStore, GroupBuyApi, LedgerConfig, API_CONTRACT_VERSION,
};
use groupbuy_core::{Matrix, NewOrder, PersonId};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "gb")]
#[command(about = "Group-buy order ledger CLI")]
struct Cli {
    /// YAML config file. Without it the CSV backend in `--data-dir` is used.
    #[arg(long, global = true, conflicts_with = "data_dir")]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Track received flags per (person, item) instead of per person.
    #[arg(long, global = true, default_value_t = false)]
    per_item: bool,

    #[arg(long, global = true)]
    retention_days: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Item {
        #[command(subcommand)]
        command: Box<ItemCommand>,
    },
    Order {
        #[command(subcommand)]
        command: Box<OrderCommand>,
    },
    Matrix {
        #[command(subcommand)]
        command: Box<MatrixCommand>,
    },
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum ItemCommand {
    Add(ItemAddArgs),
    List,
    Totals,
}

#[derive(Debug, Args)]
struct ItemAddArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Subcommand)]
enum OrderCommand {
    Add(OrderAddArgs),
    List(OrderListArgs),
    Delete(OrderDeleteArgs),
}

#[derive(Debug, Args)]
struct OrderAddArgs {
    #[arg(long)]
    item: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    phone: String,
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    qty: i64,
}

#[derive(Debug, Args)]
struct OrderListArgs {
    #[arg(long)]
    item: Option<String>,
}

#[derive(Debug, Args)]
struct OrderDeleteArgs {
    #[arg(long)]
    person_id: String,
}

#[derive(Debug, Subcommand)]
enum MatrixCommand {
    Show,
    Apply(MatrixApplyArgs),
}

#[derive(Debug, Args)]
struct MatrixApplyArgs {
    /// JSON file holding an edited matrix, as printed by `matrix show`.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
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

fn resolve_config(cli: &Cli) -> Result<LedgerConfig> {
    LedgerConfig::resolve(cli.config.as_deref(), cli.data_dir.as_deref())?
        .with_overrides(cli.per_item, cli.retention_days)
}

fn open_api(config: &LedgerConfig) -> Result<GroupBuyApi<DynStore>> {
    Ok(GroupBuyApi::new(config.open_store()?, config.received_policy, config.retention()))
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    match cli.command {
        Command::Item { command } => run_item(*command, &mut open_api(&config)?),
        Command::Order { command } => run_order(*command, &mut open_api(&config)?),
        Command::Matrix { command } => run_matrix(*command, &mut open_api(&config)?),
        Command::Db { command } => run_db(*command, &config),
    }
}

fn emit_outcome<T: serde::Serialize>(outcome: &AddOutcome<T>) -> Result<()> {
    emit_json(serde_json::to_value(outcome)?)
}

fn run_item(command: ItemCommand, api: &mut GroupBuyApi<DynStore>) -> Result<()> {
    match command {
        ItemCommand::Add(args) => emit_outcome(&api.add_item(&args.name)?),
        ItemCommand::List => {
            let items = api.list_items()?;
            emit_json(serde_json::json!({ "items": items }))
        }
        ItemCommand::Totals => {
            let totals = api.item_totals()?;
            emit_json(serde_json::json!({ "totals": totals }))
        }
    }
}

fn run_order(command: OrderCommand, api: &mut GroupBuyApi<DynStore>) -> Result<()> {
    match command {
        OrderCommand::Add(args) => {
            let input = NewOrder {
                item_name: args.item,
                person_name: args.name,
                phone: args.phone,
                quantity: args.qty,
            };
            emit_outcome(&api.add_order(&input)?)
        }
        OrderCommand::List(args) => {
            let orders = api.list_orders(args.item.as_deref())?;
            emit_json(serde_json::json!({ "orders": orders }))
        }
        OrderCommand::Delete(args) => {
            let result = api.delete_person(&PersonId::from_stored(args.person_id))?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}

fn run_matrix(command: MatrixCommand, api: &mut GroupBuyApi<DynStore>) -> Result<()> {
    match command {
        MatrixCommand::Show => emit_json(serde_json::to_value(api.matrix()?)?),
        MatrixCommand::Apply(args) => {
            let body = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read matrix file {}", args.file.display()))?;
            // Extra envelope keys from `matrix show` output are ignored.
            let matrix: Matrix = serde_json::from_str(&body)
                .with_context(|| format!("{} is not a matrix", args.file.display()))?;
            emit_json(serde_json::to_value(api.apply_edits(&matrix)?)?)
        }
    }
}

fn run_db(command: DbCommand, config: &LedgerConfig) -> Result<()> {
    let BackendConfig::Sqlite { path } = &config.backend else {
        return Err(anyhow!(
            "db commands need the sqlite backend; configured backend is {}",
            config.backend.kind()
        ));
    };

    match command {
        DbCommand::SchemaVersion => {
            let status = groupbuy_api::schema_status(path)?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            emit_json(serde_json::to_value(groupbuy_api::migrate(path, args.dry_run)?)?)
        }
        DbCommand::IntegrityCheck => {
            emit_json(serde_json::to_value(groupbuy_api::integrity_check(path)?)?)
        }
    }
}
