// DealGrid CLI - run the server, administer spreadsheets, drive the protocol

mod client;
mod exit_codes;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use dealgrid_core::{Column, ColumnType, Grant, PermissionLevel, RowData, Visibility};
use dealgrid_protocol::RejectReason;
use dealgrid_server::config::default_db_path;
use dealgrid_server::{ServerConfig, SessionServer, StoreAuthenticator};
use dealgrid_store::Store;

use client::{MutationResult, SessionClient, SessionError};
use exit_codes::{
    session_exit_code, EXIT_ERROR, EXIT_SESSION_CONFLICT, EXIT_SESSION_CONNECTION,
    EXIT_SESSION_PERMISSION, EXIT_SESSION_VALIDATION, EXIT_SUCCESS, EXIT_USAGE,
};

#[derive(Parser)]
#[command(name = "dealgrid")]
#[command(about = "Sales-pipeline tracker — collaborative spreadsheet server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session server
    Serve {
        /// TOML config file (all fields optional)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Database file (overrides config)
        #[arg(long, env = "DEALGRID_DB")]
        db: Option<PathBuf>,

        /// Listen address (overrides config)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Create the database, optionally seeded with a demo pipeline
    Init {
        #[arg(long, env = "DEALGRID_DB")]
        db: Option<PathBuf>,

        /// Seed demo users and a pipeline spreadsheet
        #[arg(long)]
        demo: bool,
    },

    /// Register a user and print their API token
    UserAdd {
        name: String,

        #[arg(long, env = "DEALGRID_DB")]
        db: Option<PathBuf>,
    },

    /// Create a spreadsheet owned by a user
    SheetCreate {
        /// Owner user name
        #[arg(long)]
        owner: String,

        /// Spreadsheet display name
        #[arg(long)]
        name: String,

        /// Make the spreadsheet viewable by any authenticated user
        #[arg(long)]
        public: bool,

        #[arg(long, env = "DEALGRID_DB")]
        db: Option<PathBuf>,
    },

    /// Add a column to a spreadsheet
    #[command(after_help = "\
Examples:
  dealgrid column-add <SHEET> --name Company --kind text --required
  dealgrid column-add <SHEET> --name DealValue --kind currency --min 0
  dealgrid column-add <SHEET> --name Stage --kind select --options Lead,Qualified,Won,Lost")]
    ColumnAdd {
        /// Spreadsheet id
        spreadsheet: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        kind: ColumnKindArg,

        #[arg(long)]
        required: bool,

        /// Options for select columns (comma-separated)
        #[arg(long)]
        options: Option<String>,

        /// Minimum for number/currency columns
        #[arg(long)]
        min: Option<f64>,

        /// Maximum for number/currency columns
        #[arg(long)]
        max: Option<f64>,

        /// Maximum length for text columns
        #[arg(long)]
        max_length: Option<usize>,

        #[arg(long, env = "DEALGRID_DB")]
        db: Option<PathBuf>,
    },

    /// Grant a collaborator access to a spreadsheet
    Grant {
        /// Spreadsheet id
        spreadsheet: String,

        /// Collaborator user name
        user: String,

        level: LevelArg,

        #[arg(long, env = "DEALGRID_DB")]
        db: Option<PathBuf>,
    },

    /// Show audit log entries
    Audit {
        /// Show entries for one record id instead of the newest overall
        #[arg(long)]
        record: Option<String>,

        /// How many recent entries to show
        #[arg(long, default_value_t = 20)]
        recent: u32,

        #[arg(long, env = "DEALGRID_DB")]
        db: Option<PathBuf>,
    },

    /// Join a spreadsheet and stream committed mutations as JSONL
    Watch {
        /// Spreadsheet id
        spreadsheet: String,

        #[arg(long, env = "DEALGRID_ADDR", default_value = "127.0.0.1:4650")]
        addr: String,

        #[arg(long, env = "DEALGRID_TOKEN")]
        token: String,
    },

    /// Fetch current rows as JSONL
    Fetch {
        /// Spreadsheet id
        spreadsheet: String,

        #[arg(long, env = "DEALGRID_ADDR", default_value = "127.0.0.1:4650")]
        addr: String,

        #[arg(long, env = "DEALGRID_TOKEN")]
        token: String,
    },

    /// Submit one row mutation
    #[command(after_help = "\
Examples:
  dealgrid mutate <SHEET> --set Company=Acme --set DealValue=5000
  dealgrid mutate <SHEET> --row <ROW> --expect 2 --set Stage=Won
  dealgrid mutate <SHEET> --row <ROW> --expect 2 --set CloseDate=null   # clear a field
  dealgrid mutate <SHEET> --row <ROW> --expect 3 --delete")]
    Mutate {
        /// Spreadsheet id
        spreadsheet: String,

        /// Row id (defaults to a fresh id, for creation)
        #[arg(long)]
        row: Option<String>,

        /// Version the row is expected to be at (0 = must not exist)
        #[arg(long, default_value_t = 0)]
        expect: u64,

        /// Field assignment, COL=VALUE. Values parse as JSON when possible
        /// ("null" clears the field); anything else is a string. Repeatable.
        #[arg(long = "set", value_name = "COL=VALUE")]
        set: Vec<String>,

        /// Delete the row instead of writing fields
        #[arg(long)]
        delete: bool,

        #[arg(long, env = "DEALGRID_ADDR", default_value = "127.0.0.1:4650")]
        addr: String,

        #[arg(long, env = "DEALGRID_TOKEN")]
        token: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColumnKindArg {
    Text,
    Number,
    Currency,
    Date,
    Boolean,
    Select,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LevelArg {
    View,
    Edit,
    Admin,
}

impl From<LevelArg> for PermissionLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::View => PermissionLevel::View,
            LevelArg::Edit => PermissionLevel::Edit,
            LevelArg::Admin => PermissionLevel::Admin,
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Serve { config, db, listen } => run_serve(config, db, listen),
        Commands::Init { db, demo } => run_init(db, demo),
        Commands::UserAdd { name, db } => run_user_add(&name, db),
        Commands::SheetCreate {
            owner,
            name,
            public,
            db,
        } => run_sheet_create(&owner, &name, public, db),
        Commands::ColumnAdd {
            spreadsheet,
            name,
            kind,
            required,
            options,
            min,
            max,
            max_length,
            db,
        } => run_column_add(
            &spreadsheet,
            &name,
            kind,
            required,
            options,
            min,
            max,
            max_length,
            db,
        ),
        Commands::Grant {
            spreadsheet,
            user,
            level,
            db,
        } => run_grant(&spreadsheet, &user, level, db),
        Commands::Audit { record, recent, db } => run_audit(record, recent, db),
        Commands::Watch {
            spreadsheet,
            addr,
            token,
        } => run_watch(&spreadsheet, &addr, &token),
        Commands::Fetch {
            spreadsheet,
            addr,
            token,
        } => run_fetch(&spreadsheet, &addr, &token),
        Commands::Mutate {
            spreadsheet,
            row,
            expect,
            set,
            delete,
            addr,
            token,
        } => run_mutate(&spreadsheet, row, expect, &set, delete, &addr, &token),
    };
    ExitCode::from(code)
}

fn resolve_db(db: Option<PathBuf>) -> PathBuf {
    db.unwrap_or_else(default_db_path)
}

fn open_store(db: Option<PathBuf>) -> Result<Store, u8> {
    let path = resolve_db(db);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                eprintln!("error: could not create {}: {}", parent.display(), e);
                return Err(EXIT_ERROR);
            }
        }
    }
    Store::open(&path).map_err(|e| {
        eprintln!("error: could not open database {}: {}", path.display(), e);
        EXIT_ERROR
    })
}

// ============================================================================
// Server
// ============================================================================

fn run_serve(config_path: Option<PathBuf>, db: Option<PathBuf>, listen: Option<String>) -> u8 {
    let mut config = match config_path {
        Some(path) => match ServerConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return EXIT_USAGE;
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(db) = db {
        config.db_path = db;
    }
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }

    // Ensure the database (and its parent directory) exists before serving
    if let Err(code) = open_store(Some(config.db_path.clone())) {
        return code;
    }

    let authenticator = Arc::new(StoreAuthenticator::new(config.db_path.clone()));
    let server = match SessionServer::start(&config, authenticator) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("error: could not start server: {}", e);
            return EXIT_ERROR;
        }
    };

    println!(
        "dealgrid listening on {} (db: {})",
        server.bound_addr(),
        config.db_path.display()
    );
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

// ============================================================================
// Admin
// ============================================================================

fn run_init(db: Option<PathBuf>, demo: bool) -> u8 {
    let store = match open_store(db.clone()) {
        Ok(store) => store,
        Err(code) => return code,
    };
    println!("database ready: {}", resolve_db(db).display());
    if !demo {
        return EXIT_SUCCESS;
    }

    let result = (|| -> Result<(), Box<dyn std::error::Error>> {
        let alice_token = dealgrid_server::generate_token();
        let bob_token = dealgrid_server::generate_token();
        let alice = store.create_user("alice", &alice_token)?;
        let bob = store.create_user("bob", &bob_token)?;

        let sheet = store.create_spreadsheet(alice, "Demo Pipeline", Visibility::Private)?;
        store.add_column(
            &Column::new(sheet.id, "Company", ColumnType::Text { max_length: None }, 0).required(),
        )?;
        store.add_column(&Column::new(
            sheet.id,
            "DealValue",
            ColumnType::Currency {
                min: Some(0.0),
                max: None,
            },
            1,
        ))?;
        store.add_column(&Column::new(
            sheet.id,
            "Stage",
            ColumnType::Select {
                options: vec![
                    "Lead".into(),
                    "Qualified".into(),
                    "Won".into(),
                    "Lost".into(),
                ],
            },
            2,
        ))?;
        store.add_column(&Column::new(sheet.id, "CloseDate", ColumnType::Date, 3))?;
        store.set_grant(&Grant {
            spreadsheet_id: sheet.id,
            user_id: bob,
            level: PermissionLevel::Edit,
        })?;

        println!("spreadsheet: {}", sheet.id);
        println!("alice (owner)  token: {}", alice_token);
        println!("bob   (edit)   token: {}", bob_token);
        Ok(())
    })();

    match result {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: demo seed failed: {}", e);
            EXIT_ERROR
        }
    }
}

fn run_user_add(name: &str, db: Option<PathBuf>) -> u8 {
    let store = match open_store(db) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let token = dealgrid_server::generate_token();
    match store.create_user(name, &token) {
        Ok(id) => {
            println!("user: {}", id);
            println!("token: {}", token);
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("error: could not create user: {}", e);
            EXIT_ERROR
        }
    }
}

fn run_sheet_create(owner: &str, name: &str, public: bool, db: Option<PathBuf>) -> u8 {
    let store = match open_store(db) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let owner_id = match store.user_by_name(owner) {
        Ok(Some(user)) => user.id,
        Ok(None) => {
            eprintln!("error: no such user: {}", owner);
            return EXIT_USAGE;
        }
        Err(e) => {
            eprintln!("error: {}", e);
            return EXIT_ERROR;
        }
    };
    let visibility = if public {
        Visibility::Public
    } else {
        Visibility::Private
    };
    match store.create_spreadsheet(owner_id, name, visibility) {
        Ok(sheet) => {
            println!("spreadsheet: {}", sheet.id);
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("error: could not create spreadsheet: {}", e);
            EXIT_ERROR
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_column_add(
    spreadsheet: &str,
    name: &str,
    kind: ColumnKindArg,
    required: bool,
    options: Option<String>,
    min: Option<f64>,
    max: Option<f64>,
    max_length: Option<usize>,
    db: Option<PathBuf>,
) -> u8 {
    let Ok(sheet_id) = Uuid::parse_str(spreadsheet) else {
        eprintln!("error: invalid spreadsheet id: {}", spreadsheet);
        return EXIT_USAGE;
    };
    let kind = match kind {
        ColumnKindArg::Text => ColumnType::Text { max_length },
        ColumnKindArg::Number => ColumnType::Number { min, max },
        ColumnKindArg::Currency => ColumnType::Currency { min, max },
        ColumnKindArg::Date => ColumnType::Date,
        ColumnKindArg::Boolean => ColumnType::Boolean,
        ColumnKindArg::Select => {
            let Some(options) = options else {
                eprintln!("error: --kind select requires --options");
                return EXIT_USAGE;
            };
            ColumnType::Select {
                options: options.split(',').map(|s| s.trim().to_string()).collect(),
            }
        }
    };

    let store = match open_store(db) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let position = match store.list_columns(sheet_id) {
        Ok(columns) => columns.last().map_or(0, |c| c.position + 1),
        Err(e) => {
            eprintln!("error: {}", e);
            return EXIT_ERROR;
        }
    };
    let mut column = Column::new(sheet_id, name, kind, position);
    if required {
        column = column.required();
    }
    match store.add_column(&column) {
        Ok(()) => {
            println!("column: {} (position {})", column.id, column.position);
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("error: could not add column: {}", e);
            EXIT_ERROR
        }
    }
}

fn run_grant(spreadsheet: &str, user: &str, level: LevelArg, db: Option<PathBuf>) -> u8 {
    let Ok(sheet_id) = Uuid::parse_str(spreadsheet) else {
        eprintln!("error: invalid spreadsheet id: {}", spreadsheet);
        return EXIT_USAGE;
    };
    let store = match open_store(db) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let user_id = match store.user_by_name(user) {
        Ok(Some(found)) => found.id,
        Ok(None) => {
            eprintln!("error: no such user: {}", user);
            return EXIT_USAGE;
        }
        Err(e) => {
            eprintln!("error: {}", e);
            return EXIT_ERROR;
        }
    };
    match store.set_grant(&Grant {
        spreadsheet_id: sheet_id,
        user_id,
        level: level.into(),
    }) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: could not set grant: {}", e);
            EXIT_ERROR
        }
    }
}

fn run_audit(record: Option<String>, recent: u32, db: Option<PathBuf>) -> u8 {
    let store = match open_store(db) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let entries = match &record {
        Some(record_id) => store.audit_for_record("rows", record_id),
        None => store.audit_recent(recent),
    };
    match entries {
        Ok(entries) => {
            for entry in entries {
                let line = serde_json::json!({
                    "id": entry.id,
                    "table": entry.table_name,
                    "record_id": entry.record_id,
                    "action": entry.action.as_str(),
                    "actor": entry.actor.to_string(),
                    "old_values": entry.old_values,
                    "new_values": entry.new_values,
                    "created_at": entry.created_at.to_rfc3339(),
                });
                println!("{}", line);
            }
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            EXIT_ERROR
        }
    }
}

// ============================================================================
// Protocol client commands
// ============================================================================

fn session_error_code(err: &SessionError) -> u8 {
    match err {
        SessionError::Server(e) => session_exit_code(&e.code),
        SessionError::Io(_) | SessionError::Closed => EXIT_SESSION_CONNECTION,
        SessionError::Protocol(_) => EXIT_ERROR,
    }
}

fn run_watch(spreadsheet: &str, addr: &str, token: &str) -> u8 {
    let mut client = match SessionClient::connect(addr, token) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {}", e);
            return session_error_code(&e);
        }
    };
    if let Err(e) = client.join(spreadsheet) {
        eprintln!("error: {}", e);
        return session_error_code(&e);
    }
    if let Err(e) = client.set_blocking_reads() {
        eprintln!("error: {}", e);
        return EXIT_SESSION_CONNECTION;
    }
    loop {
        match client.next_event() {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("error: {}", e);
                    return EXIT_ERROR;
                }
            },
            Err(e) => {
                eprintln!("error: {}", e);
                return session_error_code(&e);
            }
        }
    }
}

fn run_fetch(spreadsheet: &str, addr: &str, token: &str) -> u8 {
    let mut client = match SessionClient::connect(addr, token) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {}", e);
            return session_error_code(&e);
        }
    };
    match client.fetch_rows(spreadsheet) {
        Ok(rows) => {
            for row in rows.rows {
                match serde_json::to_string(&row) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return EXIT_ERROR;
                    }
                }
            }
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            session_error_code(&e)
        }
    }
}

fn run_mutate(
    spreadsheet: &str,
    row: Option<String>,
    expect: u64,
    set: &[String],
    delete: bool,
    addr: &str,
    token: &str,
) -> u8 {
    if delete && !set.is_empty() {
        eprintln!("error: --delete cannot be combined with --set");
        return EXIT_USAGE;
    }
    if !delete && set.is_empty() {
        eprintln!("error: nothing to do; pass --set or --delete");
        return EXIT_USAGE;
    }
    let row_data = if delete {
        None
    } else {
        match parse_set(set) {
            Ok(data) => Some(data),
            Err(e) => {
                eprintln!("error: {}", e);
                return EXIT_USAGE;
            }
        }
    };
    let row_id = row.unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut client = match SessionClient::connect(addr, token) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {}", e);
            return session_error_code(&e);
        }
    };
    // Join first: the commit broadcast is the success signal
    if let Err(e) = client.join(spreadsheet) {
        eprintln!("error: {}", e);
        return session_error_code(&e);
    }
    match client.mutate(spreadsheet, &row_id, expect, row_data) {
        Ok(MutationResult::Committed(commit)) => {
            match serde_json::to_string(&commit) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("error: {}", e);
                    return EXIT_ERROR;
                }
            }
            EXIT_SUCCESS
        }
        Ok(MutationResult::Rejected(rejected)) => {
            match serde_json::to_string(&rejected) {
                Ok(json) => eprintln!("{}", json),
                Err(e) => eprintln!("error: {}", e),
            }
            match rejected.reason {
                RejectReason::ValidationError { .. } => EXIT_SESSION_VALIDATION,
                RejectReason::ConflictError => EXIT_SESSION_CONFLICT,
                RejectReason::PermissionError => EXIT_SESSION_PERMISSION,
                RejectReason::PersistenceError => EXIT_ERROR,
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            session_error_code(&e)
        }
    }
}

/// Parse repeated `COL=VALUE` assignments into a row payload.
///
/// Values parse as JSON when possible (`5000` → number, `true` → boolean,
/// `null` → clear the field); anything else becomes a string.
fn parse_set(pairs: &[String]) -> Result<RowData, String> {
    let mut data = RowData::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(format!("'{}' is not COL=VALUE", pair));
        };
        if key.is_empty() {
            return Err(format!("'{}' has an empty column name", pair));
        }
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        data.insert(key.to_string(), value);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_set_json_and_strings() {
        let data = parse_set(&[
            "Company=Acme Corp".to_string(),
            "DealValue=5000".to_string(),
            "Active=true".to_string(),
            "CloseDate=null".to_string(),
        ])
        .unwrap();
        assert_eq!(data["Company"], json!("Acme Corp"));
        assert_eq!(data["DealValue"], json!(5000));
        assert_eq!(data["Active"], json!(true));
        assert_eq!(data["CloseDate"], json!(null));
    }

    #[test]
    fn test_parse_set_rejects_bad_pairs() {
        assert!(parse_set(&["no-equals".to_string()]).is_err());
        assert!(parse_set(&["=value".to_string()]).is_err());
    }

    #[test]
    fn test_quoted_value_stays_string() {
        let data = parse_set(&[r#"Note="5000""#.to_string()]).unwrap();
        assert_eq!(data["Note"], json!("5000"));
    }
}
