//! One-shot, resumable key-rotation tool: walks every `oauth_tokens` row,
//! decrypts at its stored encryption version, and re-encrypts under
//! whichever destination scheme the configured secrets resolve to (KMS
//! envelope encryption if `KMS_KEY_ID` is set, direct AEAD otherwise).
//! Safe to interrupt and rerun: rows already at the destination version are
//! left untouched.

use std::mem;
use std::sync::Arc;

use anyhow::Context as _;
use archiver::db::types::EncryptionVersion;
use archiver::db::Db;
use archiver::secret::SecretStore;
use archiver_log::{log, slog};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(about = "Re-encrypts oauth_tokens rows to the configured destination key scheme")]
struct Opts {
    #[structopt(long, short, parse(try_from_str = archiver::cli::Opts::parse_log_level))]
    verbose: Option<slog::Level>,

    #[structopt(long, env = "DB_DSN", default_value = "postgres://localhost/archiver")]
    db_dsn: String,

    #[structopt(long, env = "ENCRYPTION_KEY")]
    encryption_key: Option<String>,

    #[structopt(long, env = "KMS_KEY_ID")]
    kms_key_id: Option<String>,

    #[structopt(long, help = "Report what would change without writing anything")]
    dry_run: bool,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::from_args();
    mem::forget(archiver_log::init(opts.verbose));

    tokio::runtime::Runtime::new()
        .context("starting async runtime")?
        .block_on(run(opts))
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let db = Db::connect(&opts.db_dsn).await.context("connecting to database")?;

    let aead_key = opts
        .encryption_key
        .as_ref()
        .map(|b64| decode_aead_key(b64))
        .transpose()?;

    #[cfg(feature = "kms")]
    let kms: Option<(Arc<dyn archiver::secret::Kms>, String)> = if let Some(key_id) = &opts.kms_key_id {
        let aws_cfg = aws_config::load_from_env().await;
        let client = aws_sdk_kms::Client::new(&aws_cfg);
        Some((
            Arc::new(archiver::secret::kms::AwsKms::new(client)) as Arc<dyn archiver::secret::Kms>,
            key_id.clone(),
        ))
    } else {
        None
    };
    #[cfg(not(feature = "kms"))]
    let kms: Option<(Arc<dyn archiver::secret::Kms>, String)> = if opts.kms_key_id.is_some() {
        anyhow::bail!("KMS_KEY_ID set but this binary was built without the 'kms' feature");
    } else {
        None
    };

    let target_version = if kms.is_some() {
        EncryptionVersion::Envelope
    } else if aead_key.is_some() {
        EncryptionVersion::DirectAead
    } else {
        anyhow::bail!("neither ENCRYPTION_KEY nor KMS_KEY_ID is set; nothing to migrate to");
    };

    let store = SecretStore::new(aead_key, kms);

    let rows = db.list_tokens().await.context("listing oauth_tokens")?;
    log::info!("found {} token row(s); target version is {:?}", rows.len(), target_version);

    let mut migrated = 0_u32;
    let mut skipped = 0_u32;
    let mut failed = 0_u32;

    for row in rows {
        if row.encryption_version == target_version {
            skipped += 1;
            continue;
        }

        let result = migrate_row(&db, &store, &row, target_version, opts.dry_run).await;
        match result {
            Ok(()) => migrated += 1,
            Err(e) => {
                failed += 1;
                log::error!(
                    "failed to migrate token {}/{}: {}",
                    row.provider, row.channel, e,
                );
            }
        }
    }

    log::info!(
        "migration complete: migrated={} skipped={} failed={}{}",
        migrated, skipped, failed,
        if opts.dry_run { " (dry-run)" } else { "" },
    );

    if failed > 0 {
        anyhow::bail!("{failed} row(s) failed to migrate");
    }
    Ok(())
}

async fn migrate_row(
    db: &Db,
    store: &SecretStore,
    row: &archiver::db::types::OAuthTokenRow,
    target_version: EncryptionVersion,
    dry_run: bool,
) -> anyhow::Result<()> {
    let access_pt = store
        .decrypt(&row.ciphertext, row.encryption_version, "oauth-access-token")
        .await
        .context("decrypting access token")?;
    let refresh_pt = store
        .decrypt(&row.refresh_ciphertext, row.encryption_version, "oauth-refresh-token")
        .await
        .context("decrypting refresh token")?;

    if dry_run {
        log::info!(
            "(dry-run) would migrate {}/{} from {:?} to {:?}",
            row.provider, row.channel, row.encryption_version, target_version,
        );
        return Ok(());
    }

    let (access_ct, version, key_id) = store
        .encrypt(&access_pt, "oauth-access-token")
        .await
        .context("encrypting access token")?;
    let (refresh_ct, _version2, _key_id2) = store
        .encrypt(&refresh_pt, "oauth-refresh-token")
        .await
        .context("encrypting refresh token")?;

    db.upsert_token(
        &row.provider,
        &row.channel,
        &access_ct,
        &refresh_ct,
        row.expiry,
        &row.scope,
        encryption_version_to_i16(version),
        &key_id,
    )
    .await
    .context("writing migrated token back")?;

    log::info!("migrated {}/{} to {:?}", row.provider, row.channel, version);
    Ok(())
}

fn decode_aead_key(b64: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = BASE64.decode(b64).context("decoding ENCRYPTION_KEY")?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| anyhow::anyhow!("ENCRYPTION_KEY must decode to 32 bytes, got {}", v.len()))
}

fn encryption_version_to_i16(v: EncryptionVersion) -> i16 {
    match v {
        EncryptionVersion::Plaintext => 0,
        EncryptionVersion::DirectAead => 1,
        EncryptionVersion::Envelope => 2,
    }
}
