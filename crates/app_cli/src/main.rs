mod prompt;

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Arg, ArgMatches, Command};
use config::{AppConfig, BackendKind, ConfigStore};
use core_orchestrator::{DocumentLookup, KnowledgeFileOverview, Orchestrator, PrefillOutcome, SheetLayout};
use core_types::{CompositeKey, HelperColumn, helper_header_row, knowledge_file_header_row};
use form_session::{FormError, FormField, HelperSession, KnowledgeChange};
use prompt::{Decision, Prompter};
use provider_google::{GoogleAuth, GoogleDriveStore, GoogleSheetsStore};
use storage_sqlite::SqliteSheetStore;
use token_cache::{TokenCache, TokenError, default_token_dir_from};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const PASSPHRASE_ENV: &str = "HELPER_LEDGER_TOKEN_PASSPHRASE";
const NO_MATCH: &str = "No matching entry found for the selected combination.";
const NO_ASSOCIATED: &str = "No helpers are currently associated with this knowledge file.";

fn cli() -> Command {
    Command::new("helper-ledger")
        .about("Browse and version helper configurations kept in a spreadsheet")
        .subcommand_required(true)
        .arg(
            Arg::new("backend")
                .long("backend")
                .global(true)
                .value_parser(["google", "local"])
                .help("Override the configured backend"),
        )
        .subcommand(
            Command::new("helpers")
                .about("Current Helpers sheet")
                .subcommand_required(true)
                .subcommand(
                    Command::new("options")
                        .about("List the selectable values for each key level")
                        .arg(Arg::new("name").long("name"))
                        .arg(Arg::new("type").long("type")),
                )
                .subcommand(
                    Command::new("latest")
                        .about("Show the newest version of one helper")
                        .arg(Arg::new("name").long("name").required(true))
                        .arg(Arg::new("type").long("type").required(true))
                        .arg(Arg::new("gai").long("gai").required(true)),
                )
                .subcommand(Command::new("edit").about("Interactively add a helper version")),
        )
        .subcommand(
            Command::new("files")
                .about("Knowledge Files sheet")
                .subcommand_required(true)
                .subcommand(Command::new("list").about("List known knowledge files"))
                .subcommand(
                    Command::new("show")
                        .about("Document link and helpers using one knowledge file")
                        .arg(Arg::new("name").required(true)),
                )
                .subcommand(
                    Command::new("record")
                        .about("Append a change note for a knowledge file")
                        .arg(Arg::new("name").required(true))
                        .arg(Arg::new("change").long("change").required(true)),
                ),
        )
        .subcommand(
            Command::new("auth")
                .about("Cached Google authorization")
                .subcommand_required(true)
                .subcommand(
                    Command::new("import")
                        .about("Cache an authorized-user token file")
                        .arg(Arg::new("path").required(true).value_parser(clap::value_parser!(PathBuf))),
                )
                .subcommand(Command::new("status").about("Show the cached token"))
                .subcommand(Command::new("clear").about("Forget the cached token")),
        )
        .subcommand(
            Command::new("config")
                .about("Application configuration")
                .subcommand_required(true)
                .subcommand(Command::new("show").about("Print the active configuration")),
        )
}

fn main() -> ExitCode {
    let matches = cli().get_matches();

    let mut data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    data_dir.push("helper_ledger");
    if let Err(err) = fs::create_dir_all(&data_dir) {
        eprintln!("failed to prepare data dir: {err}");
    }
    let _log_guard = init_local_logger(&data_dir.join("logs"));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to create tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&matches, &data_dir)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            eprintln!("warning: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(matches: &ArgMatches, data_dir: &Path) -> Result<()> {
    let config_store = ConfigStore::from_dir(data_dir.join("config"));
    let mut config = config_store.load_or_init()?;
    match matches.get_one::<String>("backend").map(String::as_str) {
        Some("local") => config.backend = BackendKind::Local,
        Some("google") => config.backend = BackendKind::Google,
        _ => {}
    }

    match matches.subcommand() {
        Some(("config", _)) => {
            println!("# {}", config_store.path().display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some(("auth", sub)) => auth(sub, &config, data_dir).await,
        Some(("helpers", sub)) => {
            let orchestrator = connect(&config, data_dir).await?;
            helpers(sub, &orchestrator).await
        }
        Some(("files", sub)) => {
            let orchestrator = connect(&config, data_dir).await?;
            files(sub, &orchestrator).await
        }
        _ => bail!("unknown command"),
    }
}

fn layout(config: &AppConfig) -> SheetLayout {
    SheetLayout {
        helpers_sheet: config.spreadsheet.helpers_sheet.clone(),
        knowledge_files_sheet: config.spreadsheet.knowledge_files_sheet.clone(),
        max_rows: config.spreadsheet.max_rows,
        documents_folder_id: config.documents.folder_id.clone(),
    }
}

fn token_cache(config: &AppConfig, data_dir: &Path) -> Result<TokenCache> {
    let passphrase = if config.security.local_encryption_enabled {
        Some(std::env::var(PASSPHRASE_ENV).map_err(|_| TokenError::MissingPassphrase)?)
    } else {
        None
    };
    Ok(TokenCache::new(default_token_dir_from(data_dir)).with_passphrase(passphrase))
}

async fn connect(config: &AppConfig, data_dir: &Path) -> Result<Orchestrator> {
    let layout = layout(config);
    match config.backend {
        BackendKind::Local => {
            let path = data_dir.join("helper_ledger.db");
            let store = SqliteSheetStore::connect(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            store
                .ensure_header(&layout.helpers_sheet, helper_header_row())
                .await?;
            store
                .ensure_header(&layout.knowledge_files_sheet, knowledge_file_header_row())
                .await?;
            info!(backend = "local", path = %path.display(), "connected to sheet store");
            Ok(Orchestrator::new(Arc::new(store), None, layout))
        }
        BackendKind::Google => {
            let spreadsheet_id = config.spreadsheet.spreadsheet_id.trim();
            if spreadsheet_id.is_empty() {
                bail!("no spreadsheet_id configured; set spreadsheet.spreadsheet_id in config.json");
            }
            let cache = token_cache(config, data_dir)?;
            let token = GoogleAuth::new(&config.google.token_uri)
                .authorized_token(&cache)
                .await?;
            let sheets = GoogleSheetsStore::new(
                &config.google.sheets_base_url,
                spreadsheet_id,
                &token.token,
            );
            let drive = GoogleDriveStore::new(&config.google.drive_base_url, &token.token);
            info!(backend = "google", fingerprint = %token.fingerprint(), "connected to sheet store");
            Ok(Orchestrator::new(Arc::new(sheets), Some(Arc::new(drive)), layout))
        }
    }
}

async fn helpers(matches: &ArgMatches, orchestrator: &Orchestrator) -> Result<()> {
    match matches.subcommand() {
        Some(("options", sub)) => {
            let mut key = CompositeKey::new();
            if let Some(name) = sub.get_one::<String>("name") {
                key = key.with_helper_name(name);
                if let Some(helper_type) = sub.get_one::<String>("type") {
                    key = key.with_helper_type(helper_type);
                }
            }
            let options = orchestrator.cascade_options(&key).await?;
            print_list(FormField::HelperName.label(), &options.helper_names);
            if key.helper_name.is_some() {
                print_list(FormField::HelperType.label(), &options.helper_types);
            }
            if key.helper_type.is_some() {
                print_list(FormField::Gai.label(), &options.gais);
            }
            Ok(())
        }
        Some(("latest", sub)) => {
            let arg = |name: &str| sub.get_one::<String>(name).cloned().unwrap_or_default();
            let key = CompositeKey::exact(arg("name"), arg("type"), arg("gai"));
            match orchestrator.latest(&key).await? {
                Some(record) => {
                    for column in HelperColumn::ALL {
                        println!("{}: {}", column.header(), record.get(column).unwrap_or_default());
                    }
                }
                None => println!("{NO_MATCH}"),
            }
            Ok(())
        }
        Some(("edit", _)) => {
            let stdin = io::stdin();
            let mut prompter = Prompter::new(stdin.lock(), io::stdout());
            edit_helper(orchestrator, &mut prompter).await
        }
        _ => bail!("unknown helpers command"),
    }
}

fn print_list(label: &str, values: &[String]) {
    println!("{label}:");
    for value in values {
        println!("  {value}");
    }
}

/// Runs one helper form until a version is appended. Cancelling a
/// confirmation goes back to editing with the entries kept.
async fn edit_helper<R: BufRead, W: Write>(
    orchestrator: &Orchestrator,
    prompter: &mut Prompter<R, W>,
) -> Result<()> {
    let mut session = HelperSession::new();
    loop {
        for field in [FormField::HelperName, FormField::HelperType, FormField::Gai] {
            let options = orchestrator.cascade_options(&session.inputs().key()).await?;
            let choices = match field {
                FormField::HelperName => &options.helper_names,
                FormField::HelperType => &options.helper_types,
                _ => &options.gais,
            };
            let current = session.inputs().get(field).to_string();
            let value = prompter.choose(field.label(), choices, &current)?;
            session.set_field(field, value)?;
        }

        if orchestrator.prefill(&mut session).await? == PrefillOutcome::NoMatch {
            prompter.say(NO_MATCH)?;
        }

        for field in FormField::ALL.into_iter().filter(|field| !field.is_key()) {
            let current = session.inputs().get(field).to_string();
            let value = prompter.ask(field.label(), &current)?;
            session.set_field(field, value)?;
        }

        match session.submit(orchestrator.now()) {
            Ok(_) => {}
            Err(err @ FormError::MissingFields(_)) => {
                prompter.say(format!("warning: {err}"))?;
                continue;
            }
            Err(err) => return Err(err.into()),
        }

        prompter.say("Please confirm the following details:")?;
        for (label, value) in session.confirmation_lines()? {
            prompter.say(format!("  {label}: {value}"))?;
        }
        loop {
            match prompter.decide("Add this entry?")? {
                Decision::Cancel => {
                    session.cancel()?;
                    break;
                }
                Decision::Confirm => match orchestrator.commit(&mut session).await {
                    Ok(_) => {
                        prompter.say("New row added successfully!")?;
                        return Ok(());
                    }
                    Err(err) => prompter.say(format!("warning: {err:#}"))?,
                },
            }
        }
    }
}

async fn files(matches: &ArgMatches, orchestrator: &Orchestrator) -> Result<()> {
    match matches.subcommand() {
        Some(("list", _)) => {
            for name in orchestrator.knowledge_file_names().await? {
                println!("{name}");
            }
            Ok(())
        }
        Some(("show", sub)) => {
            let name = sub.get_one::<String>("name").cloned().unwrap_or_default();
            let overview = orchestrator.knowledge_file_overview(&name).await?;
            for line in overview_lines(&overview) {
                println!("{line}");
            }
            Ok(())
        }
        Some(("record", sub)) => {
            let arg = |name: &str| sub.get_one::<String>(name).cloned().unwrap_or_default();
            let change = KnowledgeChange::new(arg("name"), arg("change"))?;
            let file_name = change.file_name.clone();
            orchestrator.record_knowledge_change(change).await?;
            println!("Recorded change for '{file_name}'.");
            Ok(())
        }
        _ => bail!("unknown files command"),
    }
}

fn overview_lines(overview: &KnowledgeFileOverview) -> Vec<String> {
    let mut lines = vec![format!("Knowledge file: {}", overview.file_name)];
    lines.push(match &overview.document {
        DocumentLookup::Found(link) => format!("Document: {}", link.web_view_link),
        DocumentLookup::NotFound => format!(
            "warning: File '{}' not found in the specified folder.",
            overview.file_name
        ),
        DocumentLookup::Unavailable { reason } => {
            format!("warning: document lookup unavailable: {reason}")
        }
    });
    if overview.associated_helpers.is_empty() {
        lines.push(NO_ASSOCIATED.to_string());
    } else {
        lines.push("Associated helpers:".to_string());
        lines.extend(overview.associated_helpers.iter().map(|name| format!("  {name}")));
    }
    lines
}

async fn auth(matches: &ArgMatches, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let cache = token_cache(config, data_dir)?;
    match matches.subcommand() {
        Some(("import", sub)) => {
            let Some(path) = sub.get_one::<PathBuf>("path") else {
                bail!("missing token file path");
            };
            let token = cache.import_file(path)?;
            println!("Imported token {}.", token.fingerprint());
            Ok(())
        }
        Some(("status", _)) => {
            match cache.load()? {
                Some(token) => {
                    println!("fingerprint: {}", token.fingerprint());
                    match token.expiry {
                        Some(expiry) => println!("expires: {}", expiry.to_rfc3339()),
                        None => println!("expires: never"),
                    }
                    println!("refreshable: {}", token.can_refresh());
                    println!("encrypted: {}", cache.is_encrypted_mode());
                }
                None => println!("{}", TokenError::NotAuthorized),
            }
            Ok(())
        }
        Some(("clear", _)) => {
            cache.clear()?;
            println!("Cached token removed.");
            Ok(())
        }
        _ => bail!("unknown auth command"),
    }
}

fn init_local_logger(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "helper_ledger.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,app_cli=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use core_types::{DocumentLink, RangeSpec, Row, TabularStore};

    use super::*;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| c.to_string()).collect()
    }

    async fn local_orchestrator() -> Orchestrator {
        let config = AppConfig::default();
        let layout = layout(&config);
        let store = SqliteSheetStore::in_memory().await.expect("store");
        store
            .ensure_header(&layout.helpers_sheet, helper_header_row())
            .await
            .expect("header");
        store
            .append_rows(
                &layout.helpers_sheet,
                &RangeSpec::helper_append(),
                vec![row(&["Tutor", "Chat", "GPT", "v1", "1", "Doc1", "Doc1", "2024-01-01", "Jan 01, 2024"])],
            )
            .await
            .expect("seed");
        Orchestrator::new(Arc::new(store), None, layout)
    }

    #[test]
    fn cli_parses_nested_commands() {
        let matches = cli()
            .try_get_matches_from(["helper-ledger", "--backend", "local", "files", "record", "Doc1", "--change", "typo"])
            .expect("parse");
        assert_eq!(matches.get_one::<String>("backend").map(String::as_str), Some("local"));
        let Some(("files", files)) = matches.subcommand() else {
            panic!("files subcommand");
        };
        let Some(("record", record)) = files.subcommand() else {
            panic!("record subcommand");
        };
        assert_eq!(record.get_one::<String>("change").map(String::as_str), Some("typo"));

        assert!(cli().try_get_matches_from(["helper-ledger", "helpers", "latest", "--name", "x"]).is_err());
        assert!(cli().try_get_matches_from(["helper-ledger", "--backend", "excel", "config", "show"]).is_err());
    }

    #[tokio::test]
    async fn edit_prefills_and_appends_new_version() {
        let orchestrator = local_orchestrator().await;
        let script = "1\n1\n1\nv2\n\n\n\ny\n";
        let mut prompter = Prompter::new(Cursor::new(script.as_bytes().to_vec()), Vec::new());
        edit_helper(&orchestrator, &mut prompter).await.expect("edit");

        let record = orchestrator
            .latest(&CompositeKey::exact("Tutor", "Chat", "GPT"))
            .await
            .expect("latest")
            .expect("record");
        assert_eq!(record.get(HelperColumn::CustomInstructions), Some("v2"));
        assert_eq!(record.get(HelperColumn::KnowledgeFileList), Some("Doc1"));
        assert_eq!(record.created_date(), Some("Jan 01, 2024"));
        assert_eq!(orchestrator.helper_rows().await.expect("rows").len(), 2);
    }

    #[tokio::test]
    async fn edit_warns_on_missing_fields_and_new_key() {
        let orchestrator = local_orchestrator().await;
        // New helper: no prefill, blank details rejected, then filled in and
        // cancelled once before confirming.
        let script = "Mentor\nChat\nGPT\n\n\n\n\n\n\n\nnotes\n2\nA,B\nA\nc\n\n\n\n\n\n\n\ny\n";
        let mut prompter = Prompter::new(Cursor::new(script.as_bytes().to_vec()), Vec::new());
        edit_helper(&orchestrator, &mut prompter).await.expect("edit");

        let record = orchestrator
            .latest(&CompositeKey::exact("Mentor", "Chat", "GPT"))
            .await
            .expect("latest")
            .expect("record");
        assert_eq!(record.get(HelperColumn::KnowledgeFileNum), Some("2"));
        assert_eq!(orchestrator.helper_rows().await.expect("rows").len(), 2);
    }

    #[test]
    fn overview_lines_report_missing_document_and_helpers() {
        let missing = KnowledgeFileOverview {
            file_name: "Doc9".to_string(),
            document: DocumentLookup::NotFound,
            associated_helpers: Vec::new(),
        };
        assert_eq!(
            overview_lines(&missing),
            vec![
                "Knowledge file: Doc9".to_string(),
                "warning: File 'Doc9' not found in the specified folder.".to_string(),
                NO_ASSOCIATED.to_string(),
            ]
        );

        let found = KnowledgeFileOverview {
            file_name: "Doc1".to_string(),
            document: DocumentLookup::Found(DocumentLink {
                id: "1".to_string(),
                web_view_link: "https://docs.example/1".to_string(),
            }),
            associated_helpers: vec!["Tutor".to_string()],
        };
        let lines = overview_lines(&found);
        assert_eq!(lines[1], "Document: https://docs.example/1");
        assert_eq!(lines[3], "  Tutor");
    }
}
