use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use core_resolver::{
    associated_helpers, distinct_values, helper_version_row, knowledge_change_row,
    latest_per_key, latest_record,
};
use core_types::{
    AppendReceipt, CompositeKey, DocumentLink, DocumentStore, HelperColumn, HelperDraft,
    HelperRecord, KnowledgeFileColumn, RangeSpec, Row, TabularStore,
};
use form_session::{HelperSession, KnowledgeChange};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SheetLayout {
    pub helpers_sheet: String,
    pub knowledge_files_sheet: String,
    pub max_rows: u32,
    pub documents_folder_id: String,
}

/// Choices for the three cascading selectors. Lower levels stay empty until
/// the level above is selected.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CascadeOptions {
    pub helper_names: Vec<String>,
    pub helper_types: Vec<String>,
    pub gais: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefillOutcome {
    NotNeeded,
    Loaded,
    NoMatch,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentLookup {
    Found(DocumentLink),
    NotFound,
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KnowledgeFileOverview {
    pub file_name: String,
    pub document: DocumentLookup,
    pub associated_helpers: Vec<String>,
}

pub struct Orchestrator {
    tables: Arc<dyn TabularStore>,
    documents: Option<Arc<dyn DocumentStore>>,
    layout: SheetLayout,
    clock: fn() -> NaiveDateTime,
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

impl Orchestrator {
    pub fn new(
        tables: Arc<dyn TabularStore>,
        documents: Option<Arc<dyn DocumentStore>>,
        layout: SheetLayout,
    ) -> Self {
        Self {
            tables,
            documents,
            layout,
            clock: local_now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    pub async fn helper_rows(&self) -> Result<Vec<Row>> {
        let sheet = &self.layout.helpers_sheet;
        self.tables
            .read_range(sheet, &RangeSpec::helper_rows(self.layout.max_rows))
            .await
            .with_context(|| format!("failed to read helpers from `{sheet}`"))
    }

    pub async fn knowledge_file_rows(&self) -> Result<Vec<Row>> {
        let sheet = &self.layout.knowledge_files_sheet;
        self.tables
            .read_range(sheet, &RangeSpec::knowledge_file_rows(self.layout.max_rows))
            .await
            .with_context(|| format!("failed to read knowledge files from `{sheet}`"))
    }

    pub async fn cascade_options(&self, key: &CompositeKey) -> Result<CascadeOptions> {
        let rows = self.helper_rows().await?;
        let mut options = CascadeOptions {
            helper_names: selectable(&rows, &CompositeKey::new(), HelperColumn::HelperName),
            ..Default::default()
        };
        if let Some(name) = key.helper_name.as_deref() {
            let by_name = CompositeKey::new().with_helper_name(name);
            options.helper_types = selectable(&rows, &by_name, HelperColumn::HelperType);
            if let Some(helper_type) = key.helper_type.as_deref() {
                let by_type = by_name.with_helper_type(helper_type);
                options.gais = selectable(&rows, &by_type, HelperColumn::Gai);
            }
        }
        Ok(options)
    }

    pub async fn latest(&self, key: &CompositeKey) -> Result<Option<HelperRecord>> {
        let rows = self.helper_rows().await?;
        Ok(latest_record(&rows, key))
    }

    pub async fn prefill(&self, session: &mut HelperSession) -> Result<PrefillOutcome> {
        let Some(key) = session.needs_prefill() else {
            return Ok(PrefillOutcome::NotNeeded);
        };
        let record = self.latest(&key).await?;
        session.apply_latest(&key, record.as_ref());
        Ok(match record {
            Some(_) => PrefillOutcome::Loaded,
            None => PrefillOutcome::NoMatch,
        })
    }

    pub async fn append_helper_version(&self, draft: HelperDraft) -> Result<AppendReceipt> {
        let sheet = &self.layout.helpers_sheet;
        let helper = draft.helper_name.clone();
        let row = helper_version_row(draft, self.now());
        let receipt = self
            .tables
            .append_rows(sheet, &RangeSpec::helper_append(), vec![row])
            .await
            .with_context(|| format!("failed to append helper `{helper}` to `{sheet}`"))?;
        info!(sheet = %sheet, helper = %helper, "appended helper version");
        Ok(receipt)
    }

    /// Appends the confirmed submission. The session only resets once the
    /// store accepted the row; on failure it stays in confirmation.
    pub async fn commit(&self, session: &mut HelperSession) -> Result<AppendReceipt> {
        let draft = session.pending()?.clone();
        let receipt = match self.append_helper_version(draft).await {
            Ok(receipt) => receipt,
            Err(err) => {
                warn!(session_id = %session.id(), error = %err, "helper commit failed");
                return Err(err);
            }
        };
        session.complete_commit()?;
        Ok(receipt)
    }

    pub async fn knowledge_file_names(&self) -> Result<Vec<String>> {
        let rows = self.knowledge_file_rows().await?;
        Ok(distinct_values(&rows, &[], KnowledgeFileColumn::FileName)
            .into_iter()
            .filter(|name| !name.trim().is_empty())
            .collect())
    }

    pub async fn record_knowledge_change(&self, change: KnowledgeChange) -> Result<AppendReceipt> {
        let sheet = &self.layout.knowledge_files_sheet;
        let file_name = change.file_name.clone();
        let row = knowledge_change_row(change.file_name, change.change_description, self.now());
        let receipt = self
            .tables
            .append_rows(sheet, &RangeSpec::knowledge_file_append(), vec![row.into_row()])
            .await
            .with_context(|| format!("failed to record change for `{file_name}`"))?;
        info!(sheet = %sheet, file = %file_name, "recorded knowledge file change");
        Ok(receipt)
    }

    /// Document link and associated helpers for one knowledge file. A failed
    /// document lookup is reported in the result, not as an error.
    pub async fn knowledge_file_overview(&self, file_name: &str) -> Result<KnowledgeFileOverview> {
        let (document, rows) = futures::join!(self.find_document(file_name), self.helper_rows());
        let current = latest_per_key(&rows?);
        Ok(KnowledgeFileOverview {
            file_name: file_name.to_string(),
            document,
            associated_helpers: associated_helpers(&current, file_name),
        })
    }

    async fn find_document(&self, file_name: &str) -> DocumentLookup {
        let Some(documents) = self.documents.as_ref() else {
            return DocumentLookup::Unavailable {
                reason: "no document store configured".to_string(),
            };
        };
        let folder = self.layout.documents_folder_id.as_str();
        if folder.is_empty() {
            return DocumentLookup::Unavailable {
                reason: "no documents folder configured".to_string(),
            };
        }
        match documents.find_document_by_name(folder, file_name).await {
            Ok(Some(link)) => DocumentLookup::Found(link),
            Ok(None) => DocumentLookup::NotFound,
            Err(err) => {
                warn!(file = %file_name, error = %err, "document lookup failed");
                DocumentLookup::Unavailable {
                    reason: err.to_string(),
                }
            }
        }
    }
}

fn selectable(rows: &[Row], key: &CompositeKey, target: HelperColumn) -> Vec<String> {
    distinct_values(rows, &key.constraints(), target)
        .into_iter()
        .filter(|value| !value.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use core_types::{HELPER_COLUMN_COUNT, helper_header_row, knowledge_file_header_row};
    use form_session::FormField;
    use storage_sqlite::SqliteSheetStore;

    use super::*;

    const HELPERS: &str = "Current Helpers";
    const FILES: &str = "Knowledge Files";

    fn fixed_now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 18)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .expect("now")
    }

    fn layout(folder: &str) -> SheetLayout {
        SheetLayout {
            helpers_sheet: HELPERS.to_string(),
            knowledge_files_sheet: FILES.to_string(),
            max_rows: 1000,
            documents_folder_id: folder.to_string(),
        }
    }

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| c.to_string()).collect()
    }

    async fn seeded_store() -> Arc<SqliteSheetStore> {
        let store = SqliteSheetStore::in_memory().await.expect("store");
        store
            .ensure_header(HELPERS, helper_header_row())
            .await
            .expect("helpers header");
        store
            .ensure_header(FILES, knowledge_file_header_row())
            .await
            .expect("files header");
        let rows = vec![
            row(&["Tutor", "Chat", "GPT", "v1", "1", "Doc1", "Doc1", "2024-01-01", "Jan 01, 2024"]),
            row(&["Tutor", "Chat", "GPT", "v2", "2", "Doc2, Doc3", "Doc2", "2024-06-15", "Jan 01, 2024"]),
            row(&["Tutor", "Agent", "Claude", "a1", "1", "Doc1", "", "2024-03-01", "Mar 01, 2024"]),
            row(&["Coach", "Chat", "GPT", "c1", "1", "Doc1,Doc2", "", "2024-02-01", "Feb 01, 2024"]),
        ];
        store
            .append_rows(HELPERS, &RangeSpec::helper_append(), rows)
            .await
            .expect("seed helpers");
        store
            .append_rows(
                FILES,
                &RangeSpec::knowledge_file_append(),
                vec![row(&["Doc1", "created", "Jan 01, 2024"]), row(&["Doc2", "created", "Jan 02, 2024"]), row(&["Doc1", "edited", "Feb 01, 2024"])],
            )
            .await
            .expect("seed files");
        Arc::new(store)
    }

    struct FakeDocuments;

    #[async_trait]
    impl DocumentStore for FakeDocuments {
        async fn find_document_by_name(
            &self,
            folder_id: &str,
            name: &str,
        ) -> Result<Option<DocumentLink>> {
            match name {
                "Doc1" => Ok(Some(DocumentLink {
                    id: format!("{folder_id}-doc1"),
                    web_view_link: "https://docs.example/doc1".to_string(),
                })),
                "Broken" => bail!("quota exceeded"),
                _ => Ok(None),
            }
        }
    }

    struct ReadOnlyStore(Arc<SqliteSheetStore>);

    #[async_trait]
    impl TabularStore for ReadOnlyStore {
        async fn read_range(&self, sheet: &str, range: &RangeSpec) -> Result<Vec<Row>> {
            self.0.read_range(sheet, range).await
        }

        async fn append_rows(
            &self,
            _sheet: &str,
            _range: &RangeSpec,
            _rows: Vec<Row>,
        ) -> Result<AppendReceipt> {
            bail!("403 insufficient permissions")
        }
    }

    #[tokio::test]
    async fn cascades_options_level_by_level() {
        let orchestrator = Orchestrator::new(seeded_store().await, None, layout(""));
        let top = orchestrator
            .cascade_options(&CompositeKey::new())
            .await
            .expect("options");
        assert_eq!(top.helper_names, vec!["Coach", "Tutor"]);
        assert!(top.helper_types.is_empty());

        let key = CompositeKey::new().with_helper_name("Tutor").with_helper_type("Chat");
        let nested = orchestrator.cascade_options(&key).await.expect("options");
        assert_eq!(nested.helper_types, vec!["Agent", "Chat"]);
        assert_eq!(nested.gais, vec!["GPT"]);
    }

    #[tokio::test]
    async fn latest_returns_newest_version_or_none() {
        let orchestrator = Orchestrator::new(seeded_store().await, None, layout(""));
        let record = orchestrator
            .latest(&CompositeKey::exact("Tutor", "Chat", "GPT"))
            .await
            .expect("latest")
            .expect("record");
        assert_eq!(record.get(HelperColumn::CustomInstructions), Some("v2"));
        assert_eq!(record.updated_date(), Some("Jun 15, 2024"));

        let missing = orchestrator
            .latest(&CompositeKey::exact("Tutor", "Chat", "Gemini"))
            .await
            .expect("latest");
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn append_is_purely_additive() {
        let store = seeded_store().await;
        let orchestrator =
            Orchestrator::new(store.clone(), None, layout("")).with_clock(fixed_now);
        let before = orchestrator.helper_rows().await.expect("before");

        let draft = HelperDraft {
            helper_name: "Tutor".into(),
            helper_type: "Chat".into(),
            gai: "GPT".into(),
            custom_instructions: "v3".into(),
            knowledge_file_num: "1".into(),
            knowledge_file_list: "Doc3".into(),
            modified_file_list: "Doc3".into(),
            created_date: "Jan 01, 2024".into(),
        };
        orchestrator
            .append_helper_version(draft.clone())
            .await
            .expect("append");

        let after = orchestrator.helper_rows().await.expect("after");
        assert_eq!(after.len(), before.len() + 1);
        assert_eq!(&after[..before.len()], &before[..]);
        let last = after.last().expect("last row");
        assert_eq!(last.len(), HELPER_COLUMN_COUNT);
        assert_eq!(last, &draft.into_row("Oct 18, 2026"));
    }

    fn morning() -> NaiveDateTime {
        fixed_now().date().and_hms_opt(9, 0, 0).expect("morning")
    }

    fn evening() -> NaiveDateTime {
        fixed_now().date().and_hms_opt(17, 0, 0).expect("evening")
    }

    #[tokio::test]
    async fn second_edit_on_same_day_is_current() {
        let store = seeded_store().await;
        let key = CompositeKey::exact("Tutor", "Chat", "GPT");
        let draft = |instructions: &str| HelperDraft {
            helper_name: "Tutor".into(),
            helper_type: "Chat".into(),
            gai: "GPT".into(),
            custom_instructions: instructions.into(),
            knowledge_file_num: "1".into(),
            knowledge_file_list: "Doc9".into(),
            modified_file_list: "Doc9".into(),
            created_date: "Jan 01, 2024".into(),
        };

        Orchestrator::new(store.clone(), None, layout(""))
            .with_clock(morning)
            .append_helper_version(draft("first edit"))
            .await
            .expect("first append");
        let orchestrator = Orchestrator::new(store, None, layout("")).with_clock(evening);
        let mut second = draft("second edit");
        second.knowledge_file_list = "Doc8".into();
        orchestrator
            .append_helper_version(second)
            .await
            .expect("second append");

        let record = orchestrator.latest(&key).await.expect("latest").expect("record");
        assert_eq!(record.get(HelperColumn::CustomInstructions), Some("second edit"));

        let doc9 = orchestrator.knowledge_file_overview("Doc9").await.expect("overview");
        assert!(doc9.associated_helpers.is_empty());
        let doc8 = orchestrator.knowledge_file_overview("Doc8").await.expect("overview");
        assert_eq!(doc8.associated_helpers, vec!["Tutor"]);
    }

    #[tokio::test]
    async fn session_commit_appends_and_resets() {
        let store = seeded_store().await;
        let orchestrator =
            Orchestrator::new(store.clone(), None, layout("")).with_clock(fixed_now);
        let mut session = HelperSession::new();
        session.set_field(FormField::HelperName, "Tutor").expect("name");
        session.set_field(FormField::HelperType, "Chat").expect("type");
        session.set_field(FormField::Gai, "GPT").expect("gai");

        let outcome = orchestrator.prefill(&mut session).await.expect("prefill");
        assert_eq!(outcome, PrefillOutcome::Loaded);
        assert_eq!(session.inputs().custom_instructions, "v2");
        assert_eq!(
            orchestrator.prefill(&mut session).await.expect("again"),
            PrefillOutcome::NotNeeded
        );

        session
            .set_field(FormField::CustomInstructions, "v3")
            .expect("edit");
        session.submit(orchestrator.now()).expect("submit");
        orchestrator.commit(&mut session).await.expect("commit");
        assert!(!session.is_confirming());
        assert!(orchestrator.commit(&mut session).await.is_err());

        let record = orchestrator
            .latest(&CompositeKey::exact("Tutor", "Chat", "GPT"))
            .await
            .expect("latest")
            .expect("record");
        assert_eq!(record.get(HelperColumn::CustomInstructions), Some("v3"));
        assert_eq!(record.created_date(), Some("Jan 01, 2024"));
        assert_eq!(record.updated_date(), Some("Oct 18, 2026"));
    }

    #[tokio::test]
    async fn failed_commit_keeps_confirmation() {
        let orchestrator = Orchestrator::new(
            Arc::new(ReadOnlyStore(seeded_store().await)),
            None,
            layout(""),
        );
        let mut session = HelperSession::new();
        session.set_field(FormField::HelperName, "New").expect("name");
        session.set_field(FormField::HelperType, "Chat").expect("type");
        session.set_field(FormField::Gai, "GPT").expect("gai");
        assert_eq!(
            orchestrator.prefill(&mut session).await.expect("prefill"),
            PrefillOutcome::NoMatch
        );
        for field in [
            FormField::CustomInstructions,
            FormField::KnowledgeFileNum,
            FormField::KnowledgeFileList,
            FormField::ModifiedFileList,
        ] {
            session.set_field(field, "x").expect("field");
        }
        session.submit(orchestrator.now()).expect("submit");

        let err = orchestrator.commit(&mut session).await.expect_err("must fail");
        assert!(format!("{err:#}").contains("insufficient permissions"));
        assert!(session.is_confirming());
    }

    #[tokio::test]
    async fn knowledge_files_list_and_record_changes() {
        let store = seeded_store().await;
        let orchestrator =
            Orchestrator::new(store.clone(), None, layout("")).with_clock(fixed_now);
        assert_eq!(
            orchestrator.knowledge_file_names().await.expect("names"),
            vec!["Doc1", "Doc2"]
        );

        let change = KnowledgeChange::new("Doc2", "rewrote summary").expect("change");
        orchestrator
            .record_knowledge_change(change)
            .await
            .expect("record");
        let rows = orchestrator.knowledge_file_rows().await.expect("rows");
        assert_eq!(
            rows.last(),
            Some(&row(&["Doc2", "rewrote summary", "Oct 18, 2026"]))
        );
    }

    #[tokio::test]
    async fn overview_uses_latest_versions_only() {
        let orchestrator = Orchestrator::new(
            seeded_store().await,
            Some(Arc::new(FakeDocuments)),
            layout("folder"),
        );
        let doc1 = orchestrator
            .knowledge_file_overview("Doc1")
            .await
            .expect("overview");
        assert_eq!(doc1.associated_helpers, vec!["Coach", "Tutor"]);
        assert!(matches!(doc1.document, DocumentLookup::Found(ref link) if link.id == "folder-doc1"));

        let doc3 = orchestrator
            .knowledge_file_overview("Doc3")
            .await
            .expect("overview");
        assert_eq!(doc3.associated_helpers, vec!["Tutor"]);
        assert_eq!(doc3.document, DocumentLookup::NotFound);

        let broken = orchestrator
            .knowledge_file_overview("Broken")
            .await
            .expect("overview");
        assert!(broken.associated_helpers.is_empty());
        assert!(matches!(broken.document, DocumentLookup::Unavailable { .. }));
    }
}
