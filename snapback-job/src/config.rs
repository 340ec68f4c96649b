use std::path::PathBuf;
use std::time::Duration;

use snapback_models::WorkloadRef;
use snapback_workflow::storage::{parse_endpoint, S3Settings, DEFAULT_PART_SIZE};
use snapback_workflow::workflow::expiry;
use snapback_workflow::{Timeouts, UploadSettings, WaitOptions, WorkflowSettings};

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(180);
const DEFAULT_RESTORE_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// All invalid settings, reported together
#[derive(Debug, thiserror::Error)]
#[error("invalid config: {}", .0.join("; "))]
pub struct ConfigError(pub Vec<String>);

#[derive(Debug, Clone)]
pub struct Config {
    pub workload: WorkloadRef,
    pub wait: bool,
    pub backup_directory: PathBuf,
    pub scratch_directory: PathBuf,
    pub s3: S3Config,
    pub telegram: Option<TelegramConfig>,
    pub run_timeout: Duration,
    pub wait_timeout: Duration,
    pub restore_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub storage_class: Option<String>,
    pub insecure: bool,
    pub archive_lifetime: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source; blank values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut env = Reader {
            lookup: |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()),
            errors: Vec::new(),
        };

        let resource_id = env.required("RESOURCE_ID");
        let namespace = env.required("RESOURCE_NAMESPACE");
        let workload = match (&resource_id, &namespace) {
            (Some(id), Some(namespace)) => match WorkloadRef::parse(id, namespace) {
                Ok(workload) => Some(workload),
                Err(err) => {
                    env.errors.push(format!("RESOURCE_ID: {}", err));
                    None
                }
            },
            _ => None,
        };
        let wait = env.flag("RESOURCE_WAIT");

        let backup_directory = env.required("BACKUP_DIRECTORY").map(PathBuf::from);
        let scratch_directory = env
            .optional("BACKUP_SCRATCH_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        let insecure = env.flag("S3_UNSECURE");
        let endpoint = match env.optional("S3_ENDPOINT_URL").or_else(|| env.optional("S3_ENDPOINT")) {
            None => None,
            Some(raw) => match parse_endpoint(&raw, insecure) {
                Ok(url) => Some(url),
                Err(err) => {
                    env.errors.push(format!("S3_ENDPOINT_URL: {}", err));
                    None
                }
            },
        };
        let region = env.optional("S3_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string());
        let access_key_id = env.required("S3_ACCESS_KEY_ID");
        let secret_access_key = env.required("S3_SECRET_ACCESS_KEY");
        let bucket = env.required("S3_BUCKET");
        let storage_class = env.optional("S3_STORAGE_CLASS");
        let archive_lifetime = env
            .duration("S3_ARCHIVE_LIFETIME")
            .filter(|lifetime| !lifetime.is_zero());
        if let Some(lifetime) = archive_lifetime {
            if expiry(Some(lifetime)).is_none() {
                env.errors.push(format!(
                    "S3_ARCHIVE_LIFETIME: {} is beyond any representable expiry date",
                    humantime::format_duration(lifetime)
                ));
            }
        }

        let telegram = match env.optional("TELEGRAM_BOT_TOKEN") {
            None => None,
            Some(bot_token) => match env.required("TELEGRAM_CHAT_ID") {
                None => None,
                Some(raw) => match raw.parse::<i64>() {
                    Ok(0) | Err(_) => {
                        env.errors.push(format!("TELEGRAM_CHAT_ID: not a chat id: {:?}", raw));
                        None
                    }
                    Ok(chat_id) => Some(TelegramConfig { bot_token, chat_id }),
                },
            },
        };

        let run_timeout = env.duration("RUN_TIMEOUT").unwrap_or(DEFAULT_RUN_TIMEOUT);
        let wait_timeout = env.duration("WAIT_TIMEOUT").unwrap_or(DEFAULT_WAIT_TIMEOUT);
        let restore_timeout = env.duration("RESTORE_TIMEOUT").unwrap_or(DEFAULT_RESTORE_TIMEOUT);
        for (key, timeout) in [
            ("RUN_TIMEOUT", run_timeout),
            ("WAIT_TIMEOUT", wait_timeout),
            ("RESTORE_TIMEOUT", restore_timeout),
        ] {
            if timeout.is_zero() {
                env.errors.push(format!("{}: must be greater than zero", key));
            }
        }

        match (workload, backup_directory, access_key_id, secret_access_key, bucket) {
            (Some(workload), Some(backup_directory), Some(access_key_id), Some(secret_access_key), Some(bucket))
                if env.errors.is_empty() =>
            {
                Ok(Self {
                    workload,
                    wait,
                    backup_directory,
                    scratch_directory,
                    s3: S3Config {
                        endpoint,
                        region,
                        access_key_id,
                        secret_access_key,
                        bucket,
                        storage_class,
                        insecure,
                        archive_lifetime,
                    },
                    telegram,
                    run_timeout,
                    wait_timeout,
                    restore_timeout,
                })
            }
            _ => Err(ConfigError(env.errors)),
        }
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            workload: self.workload.clone(),
            wait: self.wait.then_some(WaitOptions {
                poll_interval: POLL_INTERVAL,
                timeout: self.wait_timeout,
            }),
            backup_directory: self.backup_directory.clone(),
            scratch_directory: self.scratch_directory.clone(),
            upload: UploadSettings {
                bucket: self.s3.bucket.clone(),
                storage_class: self.s3.storage_class.clone(),
                archive_lifetime: self.s3.archive_lifetime,
            },
            timeouts: Timeouts {
                run: self.run_timeout,
                restore: self.restore_timeout,
            },
        }
    }

    pub fn s3_settings(&self) -> S3Settings {
        S3Settings {
            endpoint_url: self.s3.endpoint.clone(),
            region: self.s3.region.clone(),
            access_key_id: self.s3.access_key_id.clone(),
            secret_access_key: self.s3.secret_access_key.clone(),
            part_size: DEFAULT_PART_SIZE,
        }
    }
}

struct Reader<F> {
    lookup: F,
    errors: Vec<String>,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn required(&mut self, key: &str) -> Option<String> {
        let value = self.optional(key);
        if value.is_none() {
            self.errors.push(format!("{} must be set", key));
        }
        value
    }

    fn flag(&mut self, key: &str) -> bool {
        match self.optional(key).map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("0") | Some("false") | Some("no") => false,
            Some("1") | Some("true") | Some("yes") => true,
            Some(other) => {
                self.errors.push(format!("{}: not a boolean: {:?}", key, other));
                false
            }
        }
    }

    fn duration(&mut self, key: &str) -> Option<Duration> {
        let raw = self.optional(key)?;
        match humantime::parse_duration(&raw) {
            Ok(duration) => Some(duration),
            Err(err) => {
                self.errors.push(format!("{}: {}", key, err));
                None
            }
        }
    }
}
