//! Operator tool: registers identities, records friendships and issues
//! handshake tokens against the relay's database.

use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use tandem::auth::TokenAuthority;
use tandem::config::{data_dir_from, parse_setting, KeyCustody, DATABASE_FILE};
use tandem::crypto::generate_keypair;
use tandem::storage::{now_millis, Storage, UserRow};

#[derive(Parser, Debug)]
#[command(name = "tandem-admin", version, about = "Manage tandem identities and friendships")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the database [env: TANDEM_HOME] [default: ~/.tandem]
    #[arg(long, short = 'd', global = true)]
    data_dir: Option<PathBuf>,

    /// Private key custody: escrowed | client-held [env: TANDEM_KEY_CUSTODY] [default: escrowed]
    #[arg(long, global = true)]
    key_custody: Option<String>,

    /// Secret for signing handshake tokens [env: TANDEM_JWT_SECRET]
    #[arg(long, global = true)]
    jwt_secret: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a key pair and register a new identity
    Register {
        /// Display name
        #[arg(long, short = 'n')]
        name: String,
    },
    /// Allow two identities to message each other
    Befriend { a: String, b: String },
    /// Issue a handshake token for an identity
    Token {
        user_id: String,
        /// Lifetime in hours; omit for a token that never expires
        #[arg(long)]
        ttl_hours: Option<u64>,
    },
}

fn main() {
    tandem::logging::init();
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let data_dir = data_dir_from(cli.data_dir);
    let storage = Storage::open(&data_dir.join(DATABASE_FILE))?;

    match cli.command {
        Command::Register { name } => {
            let custody: KeyCustody = parse_setting(cli.key_custody, "TANDEM_KEY_CUSTODY")?;
            let keypair = generate_keypair()?;
            let id = Uuid::new_v4().to_string();
            let escrowed = custody == KeyCustody::Escrowed;

            storage.insert_user(&UserRow {
                id: id.clone(),
                name,
                public_key: keypair.public_key.clone(),
                private_key: escrowed.then(|| keypair.private_key.clone()),
                created_at: now_millis(),
            })?;

            if escrowed {
                println!("{id}");
            } else {
                let key_dir = data_dir.join("keys");
                std::fs::create_dir_all(&key_dir)?;
                let key_file = key_dir.join(format!("{id}.json"));
                std::fs::write(&key_file, serde_json::to_vec_pretty(&keypair)?)?;
                println!("{id}");
                println!("private key written to {}", key_file.display());
            }
        }
        Command::Befriend { a, b } => {
            if storage.add_friendship(&a, &b)? {
                println!("{a} and {b} are now friends");
            } else {
                println!("{a} and {b} were already friends");
            }
        }
        Command::Token { user_id, ttl_hours } => {
            if storage.get_user(&user_id)?.is_none() {
                return Err(format!("unknown user {user_id}").into());
            }
            let secret = cli
                .jwt_secret
                .or_else(|| std::env::var("TANDEM_JWT_SECRET").ok())
                .ok_or("no signing secret: pass --jwt-secret or set TANDEM_JWT_SECRET")?;
            let authority = TokenAuthority::new(secret)?;
            let ttl = ttl_hours.map(|h| Duration::from_secs(h * 3600));
            println!("{}", authority.issue(&user_id, ttl)?);
        }
    }
    Ok(())
}
