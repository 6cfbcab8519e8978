mod paths;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use ll_crypto::Passphrase;
use ll_proto::MigrationMode;
use ll_store::classifier::classify_log;
use ll_store::{
    Credential, EncryptionGate, FileLogProvider, GateError, Handle, JsonRegistry, MigrationEngine, MigrationTarget,
    OpenMode, StoreConfig,
};
use ll_threshold::DeviceKeystore;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::paths::Layout;

const PASSPHRASE_ENV: &str = "LISTLOCK_PASSPHRASE";
const MIN_PASSPHRASE_LEN: usize = 12;

#[derive(Parser)]
#[command(name = "listlock")]
#[command(about = "Manage encrypted lists and this device's keys", long_about = None)]
struct Cli {
    /// Data directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered lists
    List,

    /// Create an empty unencrypted list
    Create { name: String },

    /// Superseded records of a list
    History { name: String },

    /// Inspect a list's log and report whether it looks encrypted
    Classify { name: String },

    /// Print a list's entries, asking for the passphrase if needed
    Show { name: String },

    /// Set one entry
    Put {
        name: String,
        key: String,
        /// JSON value
        value: String,
    },

    /// Move a list to passphrase encryption
    Encrypt {
        name: String,
        /// Write the encrypted copy under a new address
        #[arg(long)]
        relocate: bool,
    },

    /// Move a list back to plaintext
    Decrypt {
        name: String,
        /// Required: this weakens the list
        #[arg(long)]
        yes: bool,
    },

    /// Create this device's signing and agreement keys
    DeviceKeygen {
        #[arg(long)]
        device_id: String,
    },

    /// Print this device's public keys and fingerprint
    DeviceShow,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let cli = Cli::parse();
    let layout = Layout::new(cli.data_dir)?;
    std::fs::create_dir_all(layout.root())
        .with_context(|| format!("creating {}", layout.root().display()))?;

    match cli.command {
        Commands::DeviceKeygen { device_id } => device_keygen(&layout, &device_id),
        Commands::DeviceShow => device_show(&layout),
        command => run_store_command(&layout, command).await,
    }
}

async fn run_store_command(layout: &Layout, command: Commands) -> Result<()> {
    let gate = open_gate(layout)?;
    match command {
        Commands::List => {
            for record in gate.registry().list()? {
                let policy = record
                    .threshold_policy
                    .map(|p| format!(" {p}"))
                    .unwrap_or_default();
                println!(
                    "{:<24} {:<14} epoch {:<3}{} {}",
                    record.display_name, record.encryption_method, record.epoch, policy, record.address
                );
            }
        }
        Commands::Create { name } => {
            let record = gate.create(&name).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::History { name } => {
            let history = gate.registry().history(&name)?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Commands::Classify { name } => {
            let record = gate
                .registry()
                .resolve(&name)?
                .ok_or_else(|| anyhow!("no list named {name}"))?;
            let log = gate.logs().open(&record.address).await?;
            match classify_log(&log.entries().await?) {
                Ok(c) => println!(
                    "{}: encrypted={} confidence={:?} entries={}",
                    record.display_name, c.encrypted, c.confidence, c.entries
                ),
                Err(ambiguous) => println!("{}: ambiguous ({ambiguous})", record.display_name),
            }
        }
        Commands::Show { name } => {
            let handle = open_with_prompt(&gate, &name, OpenMode::ReadOnly).await?;
            for (key, value) in handle.entries().await? {
                println!("{key}\t{value}");
            }
        }
        Commands::Put { name, key, value } => {
            let value: serde_json::Value =
                serde_json::from_str(&value).with_context(|| format!("value for {key} is not JSON"))?;
            let handle = open_with_prompt(&gate, &name, OpenMode::ReadWrite).await?;
            handle.put(&key, value).await?;
        }
        Commands::Encrypt { name, relocate } => {
            open_with_prompt(&gate, &name, OpenMode::ReadOnly).await?;
            let passphrase = prompt_passphrase_twice("New list passphrase: ")?;
            let mode = if relocate {
                MigrationMode::Relocate
            } else {
                MigrationMode::PreserveAddress
            };
            let record = MigrationEngine::new(gate.clone())
                .migrate(&name, MigrationTarget::Password(passphrase), mode)
                .await?;
            info!(database = %name, address = %record.address, "list encrypted");
            println!("{} is now {} at {}", record.display_name, record.encryption_method, record.address);
        }
        Commands::Decrypt { name, yes } => {
            if !yes {
                bail!("decrypting stores every entry in plaintext; pass --yes to confirm");
            }
            open_with_prompt(&gate, &name, OpenMode::ReadOnly).await?;
            let record = MigrationEngine::new(gate.clone())
                .migrate_allowing_downgrade(&name, MigrationTarget::Unencrypted, MigrationMode::PreserveAddress)
                .await?;
            println!("{} is now {}", record.display_name, record.encryption_method);
        }
        Commands::DeviceKeygen { .. } | Commands::DeviceShow => {}
    }
    Ok(())
}

fn open_gate(layout: &Layout) -> Result<Arc<EncryptionGate>> {
    let config = StoreConfig::load(&layout.config())?;
    debug!(root = %layout.root().display(), threshold = config.threshold_enabled, "opening store");
    let registry = JsonRegistry::open(layout.registry())?;
    let logs = FileLogProvider::new(layout.logs())?;
    Ok(Arc::new(EncryptionGate::new(Arc::new(registry), Arc::new(logs), config)))
}

/// Open `name`, prompting for the passphrase until it unlocks or attempts run out.
async fn open_with_prompt(gate: &EncryptionGate, name: &str, mode: OpenMode) -> Result<Handle> {
    match gate.open(name, mode).await {
        Ok(handle) => return Ok(handle),
        Err(GateError::NeedsCredential { .. }) => {}
        Err(GateError::CeremonyError { phase }) => {
            bail!("{name} is threshold-encrypted and its last ceremony failed in {phase}")
        }
        Err(e) => return Err(e.into()),
    }
    let record = gate.registry().resolve(name)?;
    if record.is_some_and(|r| r.encryption_method == ll_proto::EncryptionMethod::ThresholdV1) {
        bail!("{name} is threshold-encrypted; unlock it from an enrolled device");
    }
    loop {
        let passphrase = prompt_passphrase(&format!("Passphrase for {name}: "), false)?;
        match gate.unlock(name, Credential::Passphrase(passphrase)).await {
            Ok(handle) => return Ok(handle),
            Err(GateError::WrongCredential { attempt, max }) if attempt < max => {
                eprintln!("wrong passphrase ({attempt}/{max})");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn device_keygen(layout: &Layout, device_id: &str) -> Result<()> {
    let keystore = DeviceKeystore::new(layout.device());
    if keystore.exists() {
        bail!("device keys already exist at {}", keystore.root().display());
    }
    let config = StoreConfig::load(&layout.config())?;
    let passphrase = prompt_passphrase_twice("Device passphrase: ")?;
    let identity = keystore.create(device_id, &passphrase, config.kdf)?;
    let keys = identity.public_keys();
    println!("device {} fingerprint {}", keys.device_id, keys.fingerprint());
    Ok(())
}

fn device_show(layout: &Layout) -> Result<()> {
    let keystore = DeviceKeystore::new(layout.device());
    if !keystore.exists() {
        bail!("no device keys; run device-keygen first");
    }
    let passphrase = prompt_passphrase("Device passphrase: ", false)?;
    let identity = keystore.unlock(&passphrase)?;
    println!("{}", serde_json::to_string_pretty(&identity.public_keys())?);
    println!("fingerprint {}", identity.public_keys().fingerprint());
    println!("stored shares {}", keystore.envelopes()?.len());
    Ok(())
}

fn prompt_passphrase(prompt: &str, enforce_length: bool) -> Result<Passphrase> {
    let value = match std::env::var(PASSPHRASE_ENV) {
        Ok(value) if !value.is_empty() => value,
        _ => rpassword::prompt_password(prompt).map_err(|e| anyhow!("passphrase prompt: {e}"))?,
    };
    if enforce_length && value.chars().count() < MIN_PASSPHRASE_LEN {
        bail!("passphrase too short; minimum {MIN_PASSPHRASE_LEN} characters");
    }
    Ok(Passphrase::new(value))
}

fn prompt_passphrase_twice(prompt: &str) -> Result<Passphrase> {
    if let Ok(value) = std::env::var(PASSPHRASE_ENV) {
        if !value.is_empty() {
            return prompt_passphrase(prompt, true);
        }
    }
    let first = prompt_passphrase(prompt, true)?;
    let second = rpassword::prompt_password("Confirm: ").map_err(|e| anyhow!("passphrase prompt: {e}"))?;
    if first.expose() != second {
        bail!("passphrases do not match");
    }
    Ok(first)
}
