//! cohort: operator CLI for the research data platform
//!
//! Commands:
//!   keygen       issue a study key pairing and storage key
//!   seal         encode a plaintext file the way a device uploads it
//!   decrypt      decrypt a device upload with a study private key
//!   ingest       run an upload through the server path into storage
//!   export       build an archive of stored chunks
//!   config show  print the active configuration
//!   status       check storage reachability and the chunk registry

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cohort_core::config::CohortConfig;
use cohort_crypto::{
    decode_base64, decrypt_device_file, encode_base64, generate_key_pairing,
    public_key_for_device, seal_file, DiagnosticContext, DiagnosticSink, FileDecryptError,
    JsonlSink, StudyKey, StudyPrivateKey, StudyPublicKey, TracingSink,
};
use cohort_export::{
    export, ChunkRegistry, EncryptedStoreSource, ExportOptions, ExportParams, MemoryRegistry,
    OutputMode, ProgressFn,
};
use cohort_ingest::{StaticKeys, UploadHandler, UploadOutcome, UploadRequest};
use cohort_storage::{
    build_from_core_config, check_health, probe_round_trip, Credentials, ObjectStore,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "cohort",
    version,
    about = "Research data platform operator CLI",
    long_about = "cohort: issue study keys, decrypt device uploads, ingest them and export archives"
)]
struct Cli {
    /// Path to cohort.toml configuration file
    #[arg(long, short = 'c', env = "COHORT_CONFIG", default_value = "/etc/cohort/cohort.toml")]
    config: PathBuf,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, env = "COHORT_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Issue a new study key pairing and at-rest storage key
    ///
    /// Writes `{study}.pem` (private), `{study}.pub.pem` and `{study}.key`
    /// into the output directory and prints the public key in device form.
    Keygen {
        /// Study identifier, used for file names
        study: String,
        /// Output directory
        #[arg(long, short = 'o', default_value = ".")]
        out: PathBuf,
        /// RSA modulus size (default: crypto.rsa_key_bits)
        #[arg(long)]
        bits: Option<usize>,
        /// Overwrite existing key files
        #[arg(long)]
        force: bool,
    },

    /// Encode a plaintext file in the device upload format
    Seal {
        /// Plaintext input, one record per line
        input: PathBuf,
        /// Study public key PEM
        #[arg(long)]
        public_key: PathBuf,
        /// Output path
        #[arg(long, short = 'o')]
        out: PathBuf,
    },

    /// Decrypt a device upload and write the recovered lines
    Decrypt {
        /// Uploaded file
        input: PathBuf,
        /// Study private key PEM
        #[arg(long, env = "COHORT_PRIVATE_KEY")]
        private_key: PathBuf,
        /// Participant the file came from (diagnostics only)
        #[arg(long, default_value = "unknown")]
        participant: String,
        /// Output path (default: stdout)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        /// Never copy line contents into diagnostics
        #[arg(long)]
        redact: bool,
    },

    /// Run an upload through decryption, storage and registration
    ///
    /// Storage credentials are read from COHORT_ACCESS_KEY_ID /
    /// COHORT_SECRET_ACCESS_KEY (or the AWS_* equivalents).
    Ingest {
        /// Uploaded file
        input: PathBuf,
        #[arg(long)]
        study: String,
        #[arg(long)]
        participant: String,
        /// File name as sent by the device (default: the input's name)
        #[arg(long)]
        name: Option<String>,
        /// Study private key PEM
        #[arg(long, env = "COHORT_PRIVATE_KEY")]
        private_key: PathBuf,
        /// Study storage key file
        #[arg(long, env = "COHORT_STUDY_KEY")]
        study_key: PathBuf,
        /// Chunk registry JSON file
        #[arg(long, env = "COHORT_REGISTRY")]
        registry: PathBuf,
    },

    /// Export stored chunks as a zip archive
    Export {
        #[arg(long)]
        study: String,
        /// Data streams, comma separated or a JSON array (default: all)
        #[arg(long)]
        streams: Option<String>,
        /// Participants, comma separated or a JSON array (default: all)
        #[arg(long)]
        users: Option<String>,
        /// Earliest time bin, inclusive (YYYY-MM-DDThh:mm:ss)
        #[arg(long)]
        start: Option<String>,
        /// Latest time bin, inclusive (YYYY-MM-DDThh:mm:ss)
        #[arg(long)]
        end: Option<String>,
        /// Manifest from a previous export; held chunks are skipped
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Write the manifest of this export here
        #[arg(long)]
        manifest_out: Option<PathBuf>,
        /// Study storage key file
        #[arg(long, env = "COHORT_STUDY_KEY")]
        study_key: PathBuf,
        /// Chunk registry JSON file
        #[arg(long, env = "COHORT_REGISTRY")]
        registry: PathBuf,
        /// Produce a plain data.zip without the embedded manifest
        #[arg(long)]
        download: bool,
        /// Output path (default: data.zip or export.zip)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show storage and registry status
    Status {
        /// Chunk registry JSON file
        #[arg(long, env = "COHORT_REGISTRY")]
        registry: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, from_file) = load_config(&cli.config).await?;

    let level = cli.log.as_deref().unwrap_or(&config.log.level);
    init_logging(level, &config.log.format);
    if !from_file {
        tracing::warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    match cli.command {
        Commands::Keygen { study, out, bits, force } => {
            cmd_keygen(&config, &study, &out, bits, force).await
        }
        Commands::Seal { input, public_key, out } => cmd_seal(&input, &public_key, &out).await,
        Commands::Decrypt { input, private_key, participant, out, redact } => {
            cmd_decrypt(&config, &input, &private_key, &participant, out.as_deref(), redact).await
        }
        Commands::Ingest {
            input,
            study,
            participant,
            name,
            private_key,
            study_key,
            registry,
        } => {
            cmd_ingest(
                &config,
                &input,
                &study,
                &participant,
                name,
                &private_key,
                &study_key,
                &registry,
            )
            .await
        }
        Commands::Export {
            study,
            streams,
            users,
            start,
            end,
            manifest,
            manifest_out,
            study_key,
            registry,
            download,
            out,
        } => {
            let params = ExportParams {
                study_id: study,
                data_streams: streams,
                user_ids: users,
                time_start: start,
                time_end: end,
                registry: match manifest {
                    Some(path) => Some(
                        tokio::fs::read_to_string(&path)
                            .await
                            .with_context(|| format!("reading manifest: {}", path.display()))?,
                    ),
                    None => None,
                },
            };
            cmd_export(
                &config,
                &params,
                &study_key,
                &registry,
                download,
                out.as_deref(),
                manifest_out.as_deref(),
            )
            .await
        }
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
        Commands::Status { registry } => cmd_status(&config, registry.as_deref()).await,
    }
}

// ── Config loading and logging ────────────────────────────────────────────────

/// Load the config file. The flag is false when the file was absent and
/// defaults are in use.
async fn load_config(path: &Path) -> Result<(CohortConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: CohortConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((CohortConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // logs go to stderr so decrypted output can be piped
    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn diagnostic_sink(config: &CohortConfig) -> Result<Arc<dyn DiagnosticSink>> {
    match &config.diagnostics.jsonl_path {
        Some(path) => {
            let sink = JsonlSink::open(path, config.diagnostics.record_line_errors)
                .with_context(|| format!("opening diagnostics file: {}", path.display()))?;
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(TracingSink)),
    }
}

async fn read_private_key(path: &Path) -> Result<StudyPrivateKey> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading private key: {}", path.display()))?;
    StudyPrivateKey::from_pem(&pem)
        .with_context(|| format!("loading private key: {}", path.display()))
}

async fn read_study_key(path: &Path) -> Result<StudyKey> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading study key: {}", path.display()))?;
    let bytes = decode_base64(text.as_bytes())
        .with_context(|| format!("decoding study key: {}", path.display()))?;
    StudyKey::from_slice(&bytes).with_context(|| format!("loading study key: {}", path.display()))
}

fn make_progress_bar(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("progress bar template")?
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn fmt_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Split plaintext into the records a device would seal one per line.
fn plaintext_lines(data: &[u8]) -> Vec<&[u8]> {
    data.split(|&b| b == b'\n')
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .filter(|l| !l.is_empty())
        .collect()
}

async fn write_new(path: &Path, contents: &[u8], force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

// ── `cohort keygen` ───────────────────────────────────────────────────────────

async fn cmd_keygen(
    config: &CohortConfig,
    study: &str,
    out: &Path,
    bits: Option<usize>,
    force: bool,
) -> Result<()> {
    let bits = bits.unwrap_or(config.crypto.rsa_key_bits);
    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("creating output dir: {}", out.display()))?;

    let pairing = tokio::task::spawn_blocking(move || generate_key_pairing(&mut OsRng, bits))
        .await
        .context("key generation task")??;
    let storage_key = StudyKey::generate(&mut OsRng);

    let private_path = out.join(format!("{study}.pem"));
    let public_path = out.join(format!("{study}.pub.pem"));
    let key_path = out.join(format!("{study}.key"));

    write_new(&private_path, pairing.private_pem.as_bytes(), force).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("restricting {}", private_path.display()))?;
        write_new(&key_path, encode_base64(storage_key.as_bytes()).as_bytes(), force).await?;
        tokio::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("restricting {}", key_path.display()))?;
    }
    #[cfg(not(unix))]
    write_new(&key_path, encode_base64(storage_key.as_bytes()).as_bytes(), force).await?;
    write_new(&public_path, pairing.public_pem.as_bytes(), force).await?;

    tracing::info!(study, bits, "issued study key pairing");
    println!("Keys for study {study} ({bits}-bit RSA):");
    println!("  private:     {}", private_path.display());
    println!("  public:      {}", public_path.display());
    println!("  storage key: {}", key_path.display());
    println!();
    println!("Device public key:");
    println!("{}", public_key_for_device(&pairing.public_pem));
    Ok(())
}

// ── `cohort seal` ─────────────────────────────────────────────────────────────

async fn cmd_seal(input: &Path, public_key: &Path, out: &Path) -> Result<()> {
    let pem = tokio::fs::read_to_string(public_key)
        .await
        .with_context(|| format!("reading public key: {}", public_key.display()))?;
    let public = StudyPublicKey::from_pem(&pem)?;
    let data = tokio::fs::read(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;

    let lines = plaintext_lines(&data);
    let sealed = seal_file(&mut OsRng, &public, &lines)?;
    tokio::fs::write(out, &sealed)
        .await
        .with_context(|| format!("writing {}", out.display()))?;

    println!("Sealed {} lines → {} ({})", lines.len(), out.display(), fmt_bytes(sealed.len()));
    Ok(())
}

// ── `cohort decrypt` ──────────────────────────────────────────────────────────

async fn cmd_decrypt(
    config: &CohortConfig,
    input: &Path,
    private_key: &Path,
    participant: &str,
    out: Option<&Path>,
    redact: bool,
) -> Result<()> {
    let private = read_private_key(private_key).await?;
    let data = tokio::fs::read(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let ctx = DiagnosticContext::new(participant, file_name).redacted(redact);
    let sink = diagnostic_sink(config)?;

    let (plaintext, result) = match decrypt_device_file(&ctx, &data, &private, sink.as_ref()) {
        Ok(result) => {
            eprintln!(
                "decrypted {} of {} data lines ({} errors)",
                result.decrypted_lines,
                result.total_lines.saturating_sub(1),
                result.error_count()
            );
            (result.plaintext, Ok(()))
        }
        Err(FileDecryptError::Aborted { kind, index, partial }) => {
            eprintln!(
                "stopped at line {index} ({kind}); {} lines recovered before it",
                partial.decrypted_lines
            );
            (
                partial.plaintext,
                Err(anyhow::anyhow!("decryption aborted at line {index}: {kind}")),
            )
        }
        Err(e) => return Err(e).with_context(|| format!("decrypting {}", input.display())),
    };

    match out {
        Some(path) => tokio::fs::write(path, &plaintext)
            .await
            .with_context(|| format!("writing {}", path.display()))?,
        None => {
            use std::io::Write;
            std::io::stdout()
                .write_all(&plaintext)
                .context("writing to stdout")?;
        }
    }
    result
}

// ── `cohort ingest` ───────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn cmd_ingest(
    config: &CohortConfig,
    input: &Path,
    study: &str,
    participant: &str,
    name: Option<String>,
    private_key: &Path,
    study_key: &Path,
    registry_path: &Path,
) -> Result<()> {
    let keys = StaticKeys::new().with_study(
        study,
        read_private_key(private_key).await?,
        read_study_key(study_key).await?,
    );
    let op = build_from_core_config(&config.storage, Credentials::from_env().as_ref())?;
    let registry = Arc::new(MemoryRegistry::open(registry_path)?);

    let handler = UploadHandler::new(
        Arc::new(keys),
        Arc::new(op),
        registry.clone(),
        diagnostic_sink(config)?,
        config.ingest.clone(),
    );

    let contents = tokio::fs::read(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let file_name = name.or_else(|| input.file_name().map(|n| n.to_string_lossy().to_string()));

    let outcome = handler
        .handle(UploadRequest {
            study_id: study.to_string(),
            participant_id: participant.to_string(),
            file_name,
            contents,
        })
        .await
        .context("server fault; the device would retry this upload")?;
    registry.flush()?;

    match &outcome {
        UploadOutcome::Accepted(chunk) => {
            println!("Stored {} ({})", chunk.storage_path, fmt_bytes(chunk.byte_size as usize));
            println!("{}", serde_json::to_string_pretty(chunk)?);
        }
        UploadOutcome::HandledBenign(reason) => {
            println!("Handled without storing: {reason:?}");
        }
        UploadOutcome::Rejected(reason) => {
            println!("Rejected: {reason:?}");
        }
    }
    println!(
        "Device should {} its copy",
        if outcome.device_should_delete() { "delete" } else { "keep" }
    );
    Ok(())
}

// ── `cohort export` ───────────────────────────────────────────────────────────

async fn cmd_export(
    config: &CohortConfig,
    params: &ExportParams,
    study_key: &Path,
    registry_path: &Path,
    download: bool,
    out: Option<&Path>,
    manifest_out: Option<&Path>,
) -> Result<()> {
    let query = params.to_query()?;
    let held = params.manifest()?;
    let registry = MemoryRegistry::open(registry_path)?;
    let chunks = registry.query(&query).await?;

    let mut options = ExportOptions::from_config(&config.export)?;
    if download {
        options.mode = OutputMode::Download;
    }

    let op = build_from_core_config(&config.storage, Credentials::from_env().as_ref())?;
    let store: Arc<dyn ObjectStore> = Arc::new(op);
    let source = Arc::new(EncryptedStoreSource::new(store, read_study_key(study_key).await?));

    let pb = make_progress_bar("export")?;
    let pb_clone = pb.clone();
    let progress: ProgressFn = Box::new(move |done, total, path| {
        pb_clone.set_length(total);
        pb_clone.set_position(done);
        pb_clone.set_message(path.to_string());
    });

    let archive = export(chunks, held.as_ref(), source, &options, Some(&progress)).await?;
    pb.finish_with_message("done".to_string());

    let out = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(archive.file_name.unwrap_or("export.zip")));
    tokio::fs::write(&out, &archive.bytes)
        .await
        .with_context(|| format!("writing archive: {}", out.display()))?;
    if let Some(path) = manifest_out {
        tokio::fs::write(path, archive.manifest.to_json())
            .await
            .with_context(|| format!("writing manifest: {}", path.display()))?;
    }

    println!();
    println!("Export complete → {}", out.display());
    println!("  included: {} chunks ({})", archive.manifest.len(), fmt_bytes(archive.bytes.len()));
    println!("  skipped:  {} chunks (already held)", archive.skipped);
    println!("  failed:   {} chunks", archive.failures.len());
    for failure in &archive.failures {
        println!("    {}: {}", failure.storage_path, failure.reason);
    }
    Ok(())
}

// ── `cohort config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &CohortConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `cohort status` ───────────────────────────────────────────────────────────

async fn cmd_status(config: &CohortConfig, registry: Option<&Path>) -> Result<()> {
    println!("Storage: {} backend", config.storage.backend);
    match config.storage.backend.as_str() {
        "s3" => println!(
            "  endpoint: {}  bucket: {}",
            config.storage.endpoint, config.storage.bucket
        ),
        "fs" => println!("  root: {}", config.storage.root.display()),
        _ => {}
    }

    match build_from_core_config(&config.storage, Credentials::from_env().as_ref()) {
        Ok(op) => {
            match check_health(&op).await {
                Ok(()) => println!("  reachable: yes"),
                Err(e) => println!("  reachable: no ({e})"),
            }
            match probe_round_trip(&op).await {
                Ok(()) => println!("  writable:  yes"),
                Err(e) => println!("  writable:  no ({e:#})"),
            }
        }
        Err(e) => println!("  unavailable: {e:#}"),
    }

    if let Some(path) = registry {
        let registry = MemoryRegistry::open(path)?;
        println!("Registry: {}", path.display());
        println!("  chunks: {}", registry.len());
    }

    match &config.diagnostics.jsonl_path {
        Some(path) => println!("Diagnostics: {}", path.display()),
        None => println!("Diagnostics: log only"),
    }
    Ok(())
}
