use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use expensa_core::config::{AppConfig, LoadOptions};
use serde::Serialize;
use serde_json::json;
use toml::Value;

use crate::commands::{CommandResult, EXIT_CONFIG};

#[derive(Debug, Serialize)]
struct ConfigField {
    key: &'static str,
    value: String,
    source: String,
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                EXIT_CONFIG,
            );
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let fields: Vec<ConfigField> = effective_values(&config)
        .into_iter()
        .map(|(key, env_keys, value)| ConfigField {
            key,
            value,
            source: field_source(
                key,
                env_keys,
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            ),
        })
        .collect();

    CommandResult::success_with(
        "config",
        "effective config (source precedence: env > file > default)",
        Some(json!({ "fields": fields })),
    )
}

type FieldRow = (&'static str, &'static [&'static str], String);

fn effective_values(config: &AppConfig) -> Vec<FieldRow> {
    let secret =
        if config.notifications.webhook_secret.is_some() { "<redacted>" } else { "<unset>" };

    vec![
        field("database.url", &["EXPENSA_DATABASE_URL"], config.database.url.clone()),
        field(
            "database.max_connections",
            &["EXPENSA_DATABASE_MAX_CONNECTIONS"],
            config.database.max_connections.to_string(),
        ),
        field(
            "database.timeout_secs",
            &["EXPENSA_DATABASE_TIMEOUT_SECS"],
            config.database.timeout_secs.to_string(),
        ),
        field(
            "server.bind_address",
            &["EXPENSA_SERVER_BIND_ADDRESS"],
            config.server.bind_address.clone(),
        ),
        field("server.port", &["EXPENSA_SERVER_PORT"], config.server.port.to_string()),
        field(
            "server.graceful_shutdown_secs",
            &["EXPENSA_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            config.server.graceful_shutdown_secs.to_string(),
        ),
        field(
            "engine.default_workflow_id",
            &["EXPENSA_ENGINE_DEFAULT_WORKFLOW_ID"],
            config.engine.default_workflow_id.clone().unwrap_or_else(|| "<unset>".to_string()),
        ),
        field(
            "engine.lookup_timeout_ms",
            &["EXPENSA_ENGINE_LOOKUP_TIMEOUT_MS"],
            config.engine.lookup_timeout_ms.to_string(),
        ),
        field(
            "engine.min_comment_length",
            &["EXPENSA_ENGINE_MIN_COMMENT_LENGTH"],
            config.engine.min_comment_length.to_string(),
        ),
        field(
            "engine.override_permission",
            &["EXPENSA_ENGINE_OVERRIDE_PERMISSION"],
            config.engine.override_permission.clone(),
        ),
        field(
            "scheduler.enabled",
            &["EXPENSA_SCHEDULER_ENABLED"],
            config.scheduler.enabled.to_string(),
        ),
        field(
            "scheduler.tick_interval_secs",
            &["EXPENSA_SCHEDULER_TICK_INTERVAL_SECS"],
            config.scheduler.tick_interval_secs.to_string(),
        ),
        field(
            "scheduler.batch_size",
            &["EXPENSA_SCHEDULER_BATCH_SIZE"],
            config.scheduler.batch_size.to_string(),
        ),
        field(
            "notifications.webhook_url",
            &["EXPENSA_NOTIFICATIONS_WEBHOOK_URL"],
            config.notifications.webhook_url.clone().unwrap_or_else(|| "<unset>".to_string()),
        ),
        field(
            "notifications.webhook_secret",
            &["EXPENSA_NOTIFICATIONS_WEBHOOK_SECRET"],
            secret.to_string(),
        ),
        field(
            "notifications.timeout_secs",
            &["EXPENSA_NOTIFICATIONS_TIMEOUT_SECS"],
            config.notifications.timeout_secs.to_string(),
        ),
        field(
            "logging.level",
            &["EXPENSA_LOGGING_LEVEL", "EXPENSA_LOG_LEVEL"],
            config.logging.level.clone(),
        ),
        field(
            "logging.format",
            &["EXPENSA_LOGGING_FORMAT", "EXPENSA_LOG_FORMAT"],
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
        ),
    ]
}

fn field(key: &'static str, env_keys: &'static [&'static str], value: String) -> FieldRow {
    (key, env_keys, value)
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("expensa.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/expensa.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}
