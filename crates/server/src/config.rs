use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Results page the OAuth callback redirects to, with `success` or
    /// `error=<tag>` appended.
    pub results_redirect_url: String,
    pub xero_client_id: String,
    pub xero_client_secret: String,
    pub xero_redirect_uri: String,
    pub xero_token_url: String,
    pub xero_connections_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/server.db".into(),
            results_redirect_url: "/integrations/xero".into(),
            xero_client_id: String::new(),
            xero_client_secret: String::new(),
            xero_redirect_uri: "http://127.0.0.1:8080/oauth/xero/callback".into(),
            xero_token_url: xero::DEFAULT_TOKEN_URL.into(),
            xero_connections_url: xero::DEFAULT_CONNECTIONS_URL.into(),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("results_redirect_url") {
                settings.results_redirect_url = v.clone();
            }
            if let Some(v) = file_cfg.get("xero_client_id") {
                settings.xero_client_id = v.clone();
            }
            if let Some(v) = file_cfg.get("xero_client_secret") {
                settings.xero_client_secret = v.clone();
            }
            if let Some(v) = file_cfg.get("xero_redirect_uri") {
                settings.xero_redirect_uri = v.clone();
            }
            if let Some(v) = file_cfg.get("xero_token_url") {
                settings.xero_token_url = v.clone();
            }
            if let Some(v) = file_cfg.get("xero_connections_url") {
                settings.xero_connections_url = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("RESULTS_REDIRECT_URL") {
        settings.results_redirect_url = v;
    }
    if let Ok(v) = std::env::var("APP__RESULTS_REDIRECT_URL") {
        settings.results_redirect_url = v;
    }

    if let Ok(v) = std::env::var("XERO_CLIENT_ID") {
        settings.xero_client_id = v;
    }
    if let Ok(v) = std::env::var("APP__XERO_CLIENT_ID") {
        settings.xero_client_id = v;
    }

    if let Ok(v) = std::env::var("XERO_CLIENT_SECRET") {
        settings.xero_client_secret = v;
    }
    if let Ok(v) = std::env::var("APP__XERO_CLIENT_SECRET") {
        settings.xero_client_secret = v;
    }

    if let Ok(v) = std::env::var("XERO_REDIRECT_URI") {
        settings.xero_redirect_uri = v;
    }
    if let Ok(v) = std::env::var("APP__XERO_REDIRECT_URI") {
        settings.xero_redirect_uri = v;
    }

    if let Ok(v) = std::env::var("XERO_TOKEN_URL") {
        settings.xero_token_url = v;
    }
    if let Ok(v) = std::env::var("XERO_CONNECTIONS_URL") {
        settings.xero_connections_url = v;
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}
