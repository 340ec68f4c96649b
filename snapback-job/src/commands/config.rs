use anyhow::Result;

use crate::config::Config;

const HIDDEN: &str = "***hidden***";

/// Print every setting the job reads, hiding credentials unless asked
pub fn show(show_secrets: bool) -> Result<()> {
    let config = Config::load()?;
    let secret = |value: &str| if show_secrets { value.to_string() } else { HIDDEN.to_string() };
    let or_unset = |value: Option<String>| value.unwrap_or_else(|| "✗ Not set".to_string());

    println!("Snapback Configuration");
    println!("{}", "=".repeat(80));
    println!();

    println!("Workload:");
    println!("  RESOURCE_ID               {}", config.workload);
    println!("  RESOURCE_NAMESPACE        {}", config.workload.namespace);
    println!("  RESOURCE_WAIT             {}", config.wait);
    println!();

    println!("Backup:");
    println!("  BACKUP_DIRECTORY          {}", config.backup_directory.display());
    println!("  BACKUP_SCRATCH_DIRECTORY  {}", config.scratch_directory.display());
    println!();

    println!("S3:");
    println!("  S3_ENDPOINT_URL           {}", or_unset(config.s3.endpoint.clone()));
    println!("  S3_UNSECURE               {}", config.s3.insecure);
    println!("  S3_REGION                 {}", config.s3.region);
    println!("  S3_BUCKET                 {}", config.s3.bucket);
    println!("  S3_ACCESS_KEY_ID          {}", secret(&config.s3.access_key_id));
    println!("  S3_SECRET_ACCESS_KEY      {}", secret(&config.s3.secret_access_key));
    println!("  S3_STORAGE_CLASS          {}", or_unset(config.s3.storage_class.clone()));
    println!(
        "  S3_ARCHIVE_LIFETIME       {}",
        config
            .s3
            .archive_lifetime
            .map(|lifetime| humantime::format_duration(lifetime).to_string())
            .unwrap_or_else(|| "forever".to_string())
    );
    println!();

    println!("Telegram:");
    match &config.telegram {
        Some(telegram) => {
            println!("  TELEGRAM_BOT_TOKEN        {}", secret(&telegram.bot_token));
            println!("  TELEGRAM_CHAT_ID          {}", telegram.chat_id);
        }
        None => println!("  TELEGRAM_BOT_TOKEN        ✗ Not set (notifications disabled)"),
    }
    println!();

    println!("Timeouts:");
    println!("  RUN_TIMEOUT               {}", humantime::format_duration(config.run_timeout));
    println!("  WAIT_TIMEOUT              {}", humantime::format_duration(config.wait_timeout));
    println!("  RESTORE_TIMEOUT           {}", humantime::format_duration(config.restore_timeout));

    Ok(())
}
