use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;
pub const DEFAULT_MAX_ROWS: u32 = 1000;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Google,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadsheetConfig {
    pub spreadsheet_id: String,
    #[serde(default = "default_helpers_sheet")]
    pub helpers_sheet: String,
    #[serde(default = "default_knowledge_files_sheet")]
    pub knowledge_files_sheet: String,
    #[serde(default = "default_max_rows")]
    pub max_rows: u32,
}

impl Default for SpreadsheetConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: String::new(),
            helpers_sheet: default_helpers_sheet(),
            knowledge_files_sheet: default_knowledge_files_sheet(),
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

fn default_helpers_sheet() -> String {
    "Current Helpers".to_string()
}

fn default_knowledge_files_sheet() -> String {
    "Knowledge Files".to_string()
}

const fn default_max_rows() -> u32 {
    DEFAULT_MAX_ROWS
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentsConfig {
    #[serde(default)]
    pub folder_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleApiConfig {
    pub sheets_base_url: String,
    pub drive_base_url: String,
    pub token_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Default for GoogleApiConfig {
    fn default() -> Self {
        Self {
            sheets_base_url: "https://sheets.googleapis.com".to_string(),
            drive_base_url: "https://www.googleapis.com".to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
            scopes: default_scopes(),
        }
    }
}

fn default_scopes() -> Vec<String> {
    vec![
        "https://www.googleapis.com/auth/spreadsheets".to_string(),
        "https://www.googleapis.com/auth/drive.readonly".to_string(),
    ]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub local_encryption_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub schema_version: u32,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub spreadsheet: SpreadsheetConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub google: GoogleApiConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            backend: BackendKind::Google,
            spreadsheet: SpreadsheetConfig::default(),
            documents: DocumentsConfig::default(),
            google: GoogleApiConfig::default(),
            security: SecurityConfig {
                local_encryption_enabled: false,
            },
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("config.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            let config = AppConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut config: AppConfig =
            serde_json::from_str(&raw).context("failed to parse app config json")?;
        if self.migrate(&mut config) {
            self.save(&config)?;
        }
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let text = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn migrate(&self, config: &mut AppConfig) -> bool {
        if config.schema_version >= CURRENT_SCHEMA_VERSION {
            return false;
        }

        warn!(
            from = config.schema_version,
            to = CURRENT_SCHEMA_VERSION,
            "migrating app config schema"
        );

        // v1 files predate scopes and the row bound.
        if config.google.scopes.is_empty() {
            config.google.scopes = default_scopes();
        }
        if config.spreadsheet.max_rows == 0 {
            config.spreadsheet.max_rows = DEFAULT_MAX_ROWS;
        }
        config.schema_version = CURRENT_SCHEMA_VERSION;
        true
    }
}
