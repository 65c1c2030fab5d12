// Ledger Audit - CLI
// Record ledger transactions, import bank statements, reconcile, verify the audit chain

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

use ledger_audit::{
    apply_reconciliation, get_all_ledger_transactions, get_audit_log, get_bank_lines,
    import_bank_lines, insert_ledger_transaction, load_bank_lines, load_exchange_rates, open_database,
    pending_bank_lines, set_exchange_rate, telemetry, unbacked_ledger_transactions, update_ledger_transaction,
    verify_audit_log, Config, LedgerError, NewTransaction, ReconciliationEngine,
};

#[derive(Parser)]
#[command(name = "ledger-audit", version, about = "Tamper-evident ledger with bank reconciliation.")]
struct Cli {
    /// Database file (overrides LEDGER_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and schema
    Init,
    /// Record a ledger transaction
    Add {
        #[command(flatten)]
        fields: TransactionArgs,
    },
    /// Edit a ledger transaction
    Update {
        id: i64,
        #[command(flatten)]
        fields: TransactionArgs,
    },
    /// Import a bank statement CSV (external_id,date,description,amount[,currency])
    Import {
        file: PathBuf,
        /// Currency for lines that carry none (defaults to LEDGER_BASE_CURRENCY)
        #[arg(long)]
        currency: Option<String>,
    },
    /// Match pending bank lines against unbacked ledger transactions
    Reconcile {
        #[arg(long)]
        threshold: Option<f64>,
        /// Show the pairing without saving it
        #[arg(long = "dry-run")]
        dry_run: bool,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Set the rate of a currency against the base currency
    Rate {
        currency: String,
        /// Base units per one unit of CURRENCY
        rate_to_base: f64,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Recompute every audit hash and check the links
    Verify,
    /// Audit history of one entity, newest first
    History { entity_type: String, entity_id: String },
    /// List ledger transactions and bank lines
    List,
}

#[derive(clap::Args)]
struct TransactionArgs {
    /// YYYY-MM-DD
    #[arg(long)]
    date: NaiveDate,
    #[arg(long)]
    description: String,
    #[arg(long, allow_negative_numbers = true)]
    amount: f64,
    #[arg(long)]
    currency: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    actor: Option<String>,
}

impl TransactionArgs {
    fn to_new_transaction(&self, base_currency: &str) -> NewTransaction {
        NewTransaction {
            date: self.date,
            description: self.description.clone(),
            amount: self.amount,
            currency: self.currency.clone().unwrap_or_else(|| base_currency.to_string()),
            category: self.category.clone(),
        }
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::from_env().context("Invalid configuration")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    telemetry::init_tracing(&config.log_level);

    let mut conn = open_database(&config.db_path)
        .with_context(|| format!("Failed to open database {:?}", config.db_path))?;

    match cli.command {
        Commands::Init => {
            println!("✓ Database initialized with WAL mode: {:?}", config.db_path);
            Ok(())
        }
        Commands::Add { fields } => run_add(&mut conn, &config, &fields),
        Commands::Update { id, fields } => run_update(&mut conn, &config, id, &fields),
        Commands::Import { file, currency } => {
            let currency = currency.unwrap_or_else(|| config.base_currency.clone());
            run_import(&mut conn, &file, &currency)
        }
        Commands::Reconcile { threshold, dry_run, actor } => {
            let threshold = threshold.unwrap_or(config.match_threshold);
            run_reconcile(&mut conn, &config, threshold, dry_run, actor.as_deref())
        }
        Commands::Rate { currency, rate_to_base, actor } => {
            set_exchange_rate(&mut conn, &config.base_currency, &currency, rate_to_base, actor.as_deref())?;
            println!(
                "✓ 1 {} = {} {}",
                currency.to_ascii_uppercase(),
                rate_to_base,
                config.base_currency
            );
            Ok(())
        }
        Commands::Verify => run_verify(&conn),
        Commands::History { entity_type, entity_id } => run_history(&conn, &entity_type, &entity_id),
        Commands::List => run_list(&conn, &config),
    }
}

fn run_add(conn: &mut Connection, config: &Config, fields: &TransactionArgs) -> Result<()> {
    let input = fields.to_new_transaction(&config.base_currency);
    let tx = insert_ledger_transaction(conn, &input, &config.base_currency, fields.actor.as_deref())
        .context("Failed to record transaction")?;
    println!(
        "✓ Transaction #{} recorded: {} {} {:.2} {} ({:.2} {})",
        tx.id, tx.date, tx.description, tx.amount, tx.currency, tx.base_amount, config.base_currency
    );
    Ok(())
}

fn run_update(conn: &mut Connection, config: &Config, id: i64, fields: &TransactionArgs) -> Result<()> {
    let input = fields.to_new_transaction(&config.base_currency);
    let tx = update_ledger_transaction(conn, id, &input, &config.base_currency, fields.actor.as_deref())
        .with_context(|| format!("Failed to update transaction #{id}"))?;
    println!(
        "✓ Transaction #{} updated: {} {} {:.2} {}",
        tx.id, tx.date, tx.description, tx.amount, tx.currency
    );
    Ok(())
}

fn run_import(conn: &mut Connection, file: &Path, currency: &str) -> Result<()> {
    println!("📂 Loading {:?}...", file);
    let lines = load_bank_lines(file, currency).with_context(|| format!("Failed to read {:?}", file))?;
    println!("✓ Loaded {} bank lines", lines.len());

    let inserted = import_bank_lines(conn, &lines)?;
    println!("✓ Imported {} new lines", inserted);
    if inserted < lines.len() {
        println!("✓ Skipped {} already imported", lines.len() - inserted);
    }
    Ok(())
}

fn run_reconcile(
    conn: &mut Connection,
    config: &Config,
    threshold: f64,
    dry_run: bool,
    actor: Option<&str>,
) -> Result<()> {
    let bank = pending_bank_lines(conn)?;
    let ledger = unbacked_ledger_transactions(conn)?;
    println!(
        "⚖️  Reconciling {} bank lines against {} ledger transactions (threshold {:.2})",
        bank.len(),
        ledger.len(),
        threshold
    );

    let engine = ReconciliationEngine::with_epsilon(config.amount_epsilon);
    let report = engine.reconcile(&bank, &ledger, threshold)?;

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for m in &report.matches {
        println!(
            "✓ {:<16} → #{:<5} score {:.2}  {} | {}",
            m.bank_line.external_id,
            m.ledger_transaction.id,
            m.score,
            m.bank_line.description,
            m.ledger_transaction.description
        );
    }
    for line in &report.unreconciled {
        println!("✗ {:<16} unreconciled  {} {:.2}", line.external_id, line.description, line.amount);
    }
    for tx in &report.unbacked {
        println!("· #{:<5} unbacked  {} {:.2}", tx.id, tx.description, tx.amount);
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{}", report.summary());

    if dry_run {
        println!("(dry run - nothing saved)");
        return Ok(());
    }

    let applied = apply_reconciliation(conn, &report, actor)?;
    println!("✓ Saved {} matches (run {})", applied, report.run_id);
    Ok(())
}

fn run_verify(conn: &Connection) -> Result<()> {
    match verify_audit_log(conn) {
        Ok(count) => {
            println!("✅ Audit chain intact: {} entries verified", count);
            Ok(())
        }
        Err(LedgerError::Integrity(err)) => {
            eprintln!("❌ Audit chain broken at entry index {} ({})", err.index, err.reason);
            eprintln!("   stored:   {}", err.stored);
            eprintln!("   expected: {}", err.expected);
            bail!("audit chain verification failed")
        }
        Err(e) => Err(e).context("Failed to read audit log"),
    }
}

fn run_history(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<()> {
    let entries = get_audit_log(conn, entity_type, entity_id)?;
    if entries.is_empty() {
        println!("No audit entries for {} {}", entity_type, entity_id);
        return Ok(());
    }

    for entry in entries {
        println!(
            "{}  {:<9} by {:<12} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.action,
            entry.actor_id.as_deref().unwrap_or("-"),
            entry.hash.get(..12).unwrap_or(&entry.hash)
        );
        if let Some(old) = &entry.old_values {
            println!("    old: {}", old);
        }
        if let Some(new) = &entry.new_values {
            println!("    new: {}", new);
        }
    }
    Ok(())
}

fn run_list(conn: &Connection, config: &Config) -> Result<()> {
    let ledger = get_all_ledger_transactions(conn)?;
    println!("📒 Ledger transactions ({})", ledger.len());
    for tx in &ledger {
        println!(
            "  #{:<5} {}  {:>12.2} {}  {:>12.2} {}  {}",
            tx.id, tx.date, tx.amount, tx.currency, tx.base_amount, config.base_currency, tx.description
        );
    }

    let rates = load_exchange_rates(conn, &config.base_currency)?;
    println!("\n💱 Exchange rates (base {})", rates.base_currency());
    for (currency, rate) in rates.rates() {
        println!("  {}  {}", currency, rate);
    }

    let bank = get_bank_lines(conn)?;
    println!("\n🏦 Bank lines ({})", bank.len());
    for record in &bank {
        let matched = record
            .matched_transaction_id
            .map(|id| format!("→ #{id}"))
            .unwrap_or_default();
        println!(
            "  {:<16} {}  {:>12.2} {}  {:<12} {} {}",
            record.line.external_id,
            record.line.date,
            record.line.amount,
            record.line.currency,
            record.status.as_str(),
            record.line.description,
            matched
        );
    }
    Ok(())
}
