use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use crate::db::Database;
use crate::license::{CustomerInfo, LicenseState};
use crate::model::{Category, Coordinate, ParcelInfo, ProductData, Unit, VineyardData};

pub mod backup;
pub mod db;
pub mod ledger;
pub mod license;
pub mod model;
pub mod report;

/// Spray chemical stock tracker: products, dosage coverage, vineyard
/// records and usage history, kept in a local SQLite file.
#[derive(Parser)]
#[command(name = "spray-stock", version)]
struct Cli {
    /// Database file (falls back to $SPRAY_STOCK_DB, then spray_stock.db)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the product stock list
    Product {
        #[command(subcommand)]
        command: ProductCommand,
    },
    /// Record spraying events and inspect usage history
    Usage {
        #[command(subcommand)]
        command: UsageCommand,
    },
    /// List products that cannot cover one Taral of treatment
    LowStock,
    /// Export the stock report with coverage metrics as CSV
    Report {
        /// Output file; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Create and restore backup files
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
    /// Manage vineyard records
    Vineyard {
        #[command(subcommand)]
        command: VineyardCommand,
    },
    /// Activate and inspect the local license
    License {
        #[command(subcommand)]
        command: LicenseCommand,
    },
}

#[derive(Args)]
struct ProductFields {
    #[arg(long)]
    name: String,
    #[arg(long, value_enum)]
    category: Category,
    #[arg(long)]
    quantity: f64,
    #[arg(long, value_enum)]
    unit: Unit,
    #[arg(long)]
    active_ingredient: String,
    /// Amount of product per 100 Lt of spray water
    #[arg(long)]
    dosage: f64,
}

impl ProductFields {
    fn into_data(self) -> ProductData {
        ProductData {
            name: self.name,
            category: self.category,
            quantity: self.quantity,
            unit: self.unit,
            active_ingredient: self.active_ingredient,
            dosage_per_hundred_lt: self.dosage,
        }
    }
}

#[derive(Subcommand)]
enum ProductCommand {
    Add(ProductFields),
    Update {
        id: Uuid,
        #[command(flatten)]
        fields: ProductFields,
    },
    Delete {
        id: Uuid,
    },
    List,
}

#[derive(Subcommand)]
enum UsageCommand {
    /// Record one spraying event and deduct stock
    Record {
        #[arg(long)]
        vineyard: Uuid,
        /// Liters of spray water used
        #[arg(long)]
        water: f64,
        /// Product ids applied; repeat for each product
        #[arg(long = "product", required = true)]
        products: Vec<Uuid>,
    },
    /// Show aggregated statistics
    Stats,
    List,
}

#[derive(Subcommand)]
enum BackupCommand {
    Export {
        /// Output file; a timestamped name in the working directory
        /// when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Restore {
        file: PathBuf,
    },
}

#[derive(Args)]
struct VineyardFields {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    block: String,
    #[arg(long, default_value = "")]
    parcel: String,
    #[arg(long, default_value = "")]
    grape_type: String,
    /// Boundary vertex as "lat,lng"; repeat per vertex
    #[arg(long = "coord", value_parser = parse_coordinate)]
    coordinates: Vec<Coordinate>,
}

impl VineyardFields {
    fn into_data(self) -> VineyardData {
        VineyardData {
            name: self.name,
            parcel_info: ParcelInfo {
                block: self.block,
                parcel: self.parcel,
            },
            coordinates: self.coordinates,
            grape_type: self.grape_type,
        }
    }
}

#[derive(Subcommand)]
enum VineyardCommand {
    Add(VineyardFields),
    Update {
        id: Uuid,
        #[command(flatten)]
        fields: VineyardFields,
    },
    Delete {
        id: Uuid,
    },
    List,
}

#[derive(Subcommand)]
enum LicenseCommand {
    /// Generate a key (operator-side helper)
    GenerateKey,
    Activate {
        key: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        company: Option<String>,
        /// Expiry date as YYYY-MM-DD; perpetual when omitted
        #[arg(long, value_parser = parse_expiry)]
        expires: Option<DateTime<Utc>>,
    },
    Status,
    Deactivate,
}

fn parse_coordinate(s: &str) -> std::result::Result<Coordinate, String> {
    let (lat, lng) = s
        .split_once(',')
        .ok_or_else(|| format!("expected \"lat,lng\", got \"{s}\""))?;
    let lat = lat.trim().parse::<f64>().map_err(|e| e.to_string())?;
    let lng = lng.trim().parse::<f64>().map_err(|e| e.to_string())?;
    Ok(Coordinate { lat, lng })
}

fn parse_expiry(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| e.to_string())?;
    let end_of_day = date
        .and_hms_opt(23, 59, 59)
        .ok_or_else(|| "invalid time of day".to_string())?;
    Ok(DateTime::from_naive_utc_and_offset(end_of_day, Utc))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let path = cli
        .db
        .or_else(|| std::env::var_os("SPRAY_STOCK_DB").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("spray_stock.db"));
    let db = Database::open(&path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    match cli.command {
        Command::License { command } => run_license(&db, command),
        command => {
            ensure_licensed(&db)?;
            run_data_command(&db, command)
        }
    }
}

/// Every data command runs behind the local license gate; a passing
/// check refreshes the offline grace window.
fn ensure_licensed(db: &Database) -> Result<()> {
    let mut state = db
        .load_license()
        .context("failed to load license state")?
        .unwrap_or_default();
    let fingerprint = license::machine_fingerprint();
    state
        .validate(&fingerprint, Utc::now())
        .context("license check failed (run `spray-stock license activate <KEY>`)")?;
    state.touch(Utc::now());
    db.save_license(&state)
        .context("failed to persist license check")?;
    Ok(())
}

fn persist(db: &Database, ledger: &crate::ledger::StockLedger) -> Result<()> {
    // The in-memory mutation already happened; a failure here means
    // "applied, not durable" and the caller may simply rerun the save.
    db.save_ledger(ledger).context("failed to persist ledger")
}

fn run_data_command(db: &Database, command: Command) -> Result<()> {
    let mut ledger = db.load_ledger().context("failed to load ledger")?;

    match command {
        Command::Product { command } => match command {
            ProductCommand::Add(fields) => {
                let product = ledger.add_product(fields.into_data())?;
                persist(db, &ledger)?;
                println!("added product {} ({})", product.name, product.id);
            }
            ProductCommand::Update { id, fields } => {
                let product = ledger.update_product(id, fields.into_data())?;
                persist(db, &ledger)?;
                println!("updated product {} ({})", product.name, product.id);
            }
            ProductCommand::Delete { id } => {
                ledger.delete_product(id)?;
                persist(db, &ledger)?;
                println!("deleted product {id}");
            }
            ProductCommand::List => {
                for p in ledger.products() {
                    println!(
                        "{}  {:<24} {:>10.2} {:<3} dosage {:>8.2}/100Lt  {:>6.1} Taral  [{}]",
                        p.id,
                        p.name,
                        p.quantity,
                        p.unit,
                        p.dosage_per_hundred_lt,
                        p.taral_count(),
                        p.category
                    );
                }
            }
        },

        Command::Usage { command } => match command {
            UsageCommand::Record {
                vineyard,
                water,
                products,
            } => {
                let name = ledger
                    .vineyard(vineyard)
                    .map(|v| v.name.clone())
                    .with_context(|| format!("no vineyard with id {vineyard}"))?;
                let record = ledger.record_usage(vineyard, &name, water, &products)?;
                persist(db, &ledger)?;
                println!(
                    "recorded {} Lt on '{}' using {} product(s)",
                    record.total_water_amount,
                    record.vineyard_name,
                    record.products.len()
                );
                for entry in &record.products {
                    println!(
                        "  {:<24} {:>10.2} {}",
                        entry.product_name, entry.calculated_usage, entry.unit
                    );
                }
            }
            UsageCommand::Stats => {
                let stats = ledger.usage_stats();
                println!("water per month:");
                for m in &stats.monthly_usage {
                    println!("  {:<16} {:>10.0} Lt", m.month, m.total_water);
                }
                println!("top products:");
                for t in &stats.top_products {
                    println!("  {:<24} {:>10.2} {}", t.name, t.total_usage, t.unit);
                }
            }
            UsageCommand::List => {
                for r in ledger.usage_records() {
                    println!(
                        "{}  {}  {:<20} {:>8.0} Lt  {} product(s)",
                        r.id,
                        r.date.format("%Y-%m-%d %H:%M"),
                        r.vineyard_name,
                        r.total_water_amount,
                        r.products.len()
                    );
                }
            }
        },

        Command::LowStock => {
            for p in ledger.low_stock_products() {
                println!(
                    "{:<24} {:>10.2} {} in stock, {:>10.2} {} needed for one Taral",
                    p.name,
                    p.quantity,
                    p.unit,
                    p.coverage_for_one_taral(),
                    p.unit
                );
            }
        }

        Command::Report { out } => match out {
            Some(path) => {
                let file = std::fs::File::create(&path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                report::write_stock_report_csv(&ledger, file)?;
                println!("report written to {}", path.display());
            }
            None => report::write_stock_report_csv(&ledger, std::io::stdout())?,
        },

        Command::Backup { command } => match command {
            BackupCommand::Export { out } => {
                let snapshot = backup::Backup::capture(&ledger);
                let path = out.unwrap_or_else(|| {
                    PathBuf::from(backup::Backup::default_file_name(snapshot.timestamp))
                });
                snapshot.write_to(&path)?;
                println!("backup written to {}", path.display());
            }
            BackupCommand::Restore { file } => {
                let parsed = backup::Backup::read_from(&file)?;
                ledger.replace_inventory(parsed.data.products, parsed.data.usage_records);
                persist(db, &ledger)?;
                println!(
                    "restored {} product(s) and {} usage record(s) from {}",
                    ledger.products().len(),
                    ledger.usage_records().len(),
                    file.display()
                );
            }
        },

        Command::Vineyard { command } => match command {
            VineyardCommand::Add(fields) => {
                let vineyard = ledger.add_vineyard(fields.into_data())?;
                persist(db, &ledger)?;
                println!(
                    "added vineyard {} ({}), area {:.0} m²",
                    vineyard.name, vineyard.id, vineyard.area
                );
            }
            VineyardCommand::Update { id, fields } => {
                let vineyard = ledger.update_vineyard(id, fields.into_data())?;
                persist(db, &ledger)?;
                println!(
                    "updated vineyard {} ({}), area {:.0} m²",
                    vineyard.name, vineyard.id, vineyard.area
                );
            }
            VineyardCommand::Delete { id } => {
                ledger.delete_vineyard(id)?;
                persist(db, &ledger)?;
                println!("deleted vineyard {id}");
            }
            VineyardCommand::List => {
                for v in ledger.vineyards() {
                    println!(
                        "{}  {:<20} {:>10.0} m²  block {}/{}  {}",
                        v.id,
                        v.name,
                        v.area,
                        v.parcel_info.block,
                        v.parcel_info.parcel,
                        v.grape_type
                    );
                }
            }
        },

        Command::License { .. } => unreachable!("handled before the license gate"),
    }

    Ok(())
}

fn run_license(db: &Database, command: LicenseCommand) -> Result<()> {
    match command {
        LicenseCommand::GenerateKey => {
            println!("{}", license::generate_key());
        }
        LicenseCommand::Activate {
            key,
            name,
            email,
            company,
            expires,
        } => {
            let mut state = db
                .load_license()
                .context("failed to load license state")?
                .unwrap_or_default();
            let customer = CustomerInfo {
                name,
                email,
                company,
            };
            let fingerprint = license::machine_fingerprint();
            let result = state.activate(&key, customer, expires, &fingerprint, Utc::now());
            // Failed attempts count against the throttle, so the state
            // is persisted on both outcomes.
            db.save_license(&state)
                .context("failed to persist license state")?;
            result?;
            println!("license activated on this machine");
        }
        LicenseCommand::Status => {
            let mut state: LicenseState = db
                .load_license()
                .context("failed to load license state")?
                .unwrap_or_default();
            let now = Utc::now();
            let activation_date = match state.validate(&license::machine_fingerprint(), now) {
                Ok(activation) => activation.activation_date,
                Err(e) => bail!("license: invalid ({e})"),
            };
            // A passing check restarts the offline grace window, same
            // as the gate in front of data commands.
            state.touch(now);
            db.save_license(&state)
                .context("failed to persist license check")?;
            println!("license: valid");
            println!("activated: {}", activation_date.format("%Y-%m-%d"));
            match state.remaining_days(now) {
                Some(days) => println!("expires in: {days} day(s)"),
                None => println!("expires in: never"),
            }
        }
        LicenseCommand::Deactivate => {
            db.clear_license().context("failed to clear license state")?;
            println!("license deactivated");
        }
    }
    Ok(())
}
