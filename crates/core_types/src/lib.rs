use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One row as returned by a tabular store. Trailing empty cells may be absent.
pub type Row = Vec<String>;

pub const HELPER_COLUMN_COUNT: usize = 9;
pub const KNOWLEDGE_FILE_COLUMN_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Column(usize);

impl Column {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    pub fn letters(self) -> String {
        let mut n = self.0 + 1;
        let mut out = Vec::new();
        while n > 0 {
            let rem = (n - 1) % 26;
            out.push(b'A' + rem as u8);
            n = (n - 1) / 26;
        }
        out.reverse();
        String::from_utf8(out).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HelperColumn {
    HelperName,
    HelperType,
    Gai,
    CustomInstructions,
    KnowledgeFileNum,
    KnowledgeFileList,
    ModifiedFileList,
    UpdatedDate,
    CreatedDate,
}

impl HelperColumn {
    pub const ALL: [HelperColumn; HELPER_COLUMN_COUNT] = [
        HelperColumn::HelperName,
        HelperColumn::HelperType,
        HelperColumn::Gai,
        HelperColumn::CustomInstructions,
        HelperColumn::KnowledgeFileNum,
        HelperColumn::KnowledgeFileList,
        HelperColumn::ModifiedFileList,
        HelperColumn::UpdatedDate,
        HelperColumn::CreatedDate,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn header(self) -> &'static str {
        match self {
            HelperColumn::HelperName => "HelperName",
            HelperColumn::HelperType => "HelperType",
            HelperColumn::Gai => "GAI",
            HelperColumn::CustomInstructions => "CustomInstructions",
            HelperColumn::KnowledgeFileNum => "KnowledgeFileNum",
            HelperColumn::KnowledgeFileList => "KnowledgeFileList",
            HelperColumn::ModifiedFileList => "ModifiedFileList",
            HelperColumn::UpdatedDate => "UpdatedDate",
            HelperColumn::CreatedDate => "CreatedDate",
        }
    }
}

impl From<HelperColumn> for Column {
    fn from(value: HelperColumn) -> Self {
        Column::new(value.index())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KnowledgeFileColumn {
    FileName,
    ChangeDescription,
    Timestamp,
}

impl KnowledgeFileColumn {
    pub const ALL: [KnowledgeFileColumn; KNOWLEDGE_FILE_COLUMN_COUNT] = [
        KnowledgeFileColumn::FileName,
        KnowledgeFileColumn::ChangeDescription,
        KnowledgeFileColumn::Timestamp,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn header(self) -> &'static str {
        match self {
            KnowledgeFileColumn::FileName => "FileName",
            KnowledgeFileColumn::ChangeDescription => "ChangeDescription",
            KnowledgeFileColumn::Timestamp => "Timestamp",
        }
    }
}

impl From<KnowledgeFileColumn> for Column {
    fn from(value: KnowledgeFileColumn) -> Self {
        Column::new(value.index())
    }
}

pub fn helper_header_row() -> Row {
    HelperColumn::ALL
        .iter()
        .map(|column| column.header().to_string())
        .collect()
}

pub fn knowledge_file_header_row() -> Row {
    KnowledgeFileColumn::ALL
        .iter()
        .map(|column| column.header().to_string())
        .collect()
}

pub fn cell(row: &[String], column: impl Into<Column>) -> Option<&str> {
    row.get(column.into().index()).map(String::as_str)
}

/// (HelperName, HelperType, GAI). `None` leaves that column unconstrained.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub helper_name: Option<String>,
    pub helper_type: Option<String>,
    pub gai: Option<String>,
}

impl CompositeKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exact(
        helper_name: impl Into<String>,
        helper_type: impl Into<String>,
        gai: impl Into<String>,
    ) -> Self {
        Self {
            helper_name: Some(helper_name.into()),
            helper_type: Some(helper_type.into()),
            gai: Some(gai.into()),
        }
    }

    pub fn with_helper_name(mut self, value: impl Into<String>) -> Self {
        self.helper_name = Some(value.into());
        self
    }

    pub fn with_helper_type(mut self, value: impl Into<String>) -> Self {
        self.helper_type = Some(value.into());
        self
    }

    pub fn with_gai(mut self, value: impl Into<String>) -> Self {
        self.gai = Some(value.into());
        self
    }

    pub fn is_complete(&self) -> bool {
        self.helper_name.is_some() && self.helper_type.is_some() && self.gai.is_some()
    }

    pub fn constraints(&self) -> Vec<(Column, &str)> {
        [
            (HelperColumn::HelperName, self.helper_name.as_deref()),
            (HelperColumn::HelperType, self.helper_type.as_deref()),
            (HelperColumn::Gai, self.gai.as_deref()),
        ]
        .into_iter()
        .filter_map(|(column, value)| value.map(|value| (Column::from(column), value)))
        .collect()
    }

    pub fn matches(&self, row: &[String]) -> bool {
        self.constraints()
            .iter()
            .all(|(column, value)| cell(row, *column) == Some(*value))
    }
}

/// An A1-style rectangle. Open row bounds mean "whole column".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: Column,
    pub end: Column,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_row: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_row: Option<u32>,
}

impl RangeSpec {
    pub fn columns(start: impl Into<Column>, end: impl Into<Column>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            first_row: None,
            last_row: None,
        }
    }

    pub fn rows(
        start: impl Into<Column>,
        end: impl Into<Column>,
        first_row: u32,
        last_row: u32,
    ) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            first_row: Some(first_row),
            last_row: Some(last_row),
        }
    }

    pub fn helper_rows(max_rows: u32) -> Self {
        Self::rows(
            HelperColumn::HelperName,
            HelperColumn::CreatedDate,
            2,
            max_rows,
        )
    }

    pub fn helper_append() -> Self {
        Self::columns(HelperColumn::HelperName, HelperColumn::CreatedDate)
    }

    pub fn knowledge_file_rows(max_rows: u32) -> Self {
        Self::rows(
            KnowledgeFileColumn::FileName,
            KnowledgeFileColumn::Timestamp,
            2,
            max_rows,
        )
    }

    pub fn knowledge_file_append() -> Self {
        Self::columns(KnowledgeFileColumn::FileName, KnowledgeFileColumn::Timestamp)
    }

    pub fn width(&self) -> usize {
        self.end.index().saturating_sub(self.start.index()) + 1
    }

    pub fn to_a1(&self, sheet: &str) -> String {
        let start = match self.first_row {
            Some(row) => format!("{}{row}", self.start.letters()),
            None => self.start.letters(),
        };
        let end = match self.last_row {
            Some(row) => format!("{}{row}", self.end.letters()),
            None => self.end.letters(),
        };
        format!("{}!{start}:{end}", quote_sheet_name(sheet))
    }
}

pub fn quote_sheet_name(sheet: &str) -> String {
    format!("'{}'", sheet.replace('\'', "''"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelperRecord {
    fields: [Option<String>; HELPER_COLUMN_COUNT],
}

impl HelperRecord {
    /// Pads a short row with `None`; cells past column I are dropped.
    pub fn from_row(row: Row) -> Self {
        let mut fields: [Option<String>; HELPER_COLUMN_COUNT] = Default::default();
        for (slot, value) in fields.iter_mut().zip(row) {
            *slot = Some(value);
        }
        Self { fields }
    }

    pub fn get(&self, column: HelperColumn) -> Option<&str> {
        self.fields[column.index()].as_deref()
    }

    pub fn set(&mut self, column: HelperColumn, value: Option<String>) {
        self.fields[column.index()] = value;
    }

    pub fn helper_name(&self) -> Option<&str> {
        self.get(HelperColumn::HelperName)
    }

    pub fn updated_date(&self) -> Option<&str> {
        self.get(HelperColumn::UpdatedDate)
    }

    pub fn created_date(&self) -> Option<&str> {
        self.get(HelperColumn::CreatedDate)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelperDraft {
    pub helper_name: String,
    pub helper_type: String,
    pub gai: String,
    pub custom_instructions: String,
    pub knowledge_file_num: String,
    pub knowledge_file_list: String,
    pub modified_file_list: String,
    pub created_date: String,
}

impl HelperDraft {
    pub fn key(&self) -> CompositeKey {
        CompositeKey::exact(&self.helper_name, &self.helper_type, &self.gai)
    }

    pub fn into_row(self, updated_date: impl Into<String>) -> Row {
        vec![
            self.helper_name,
            self.helper_type,
            self.gai,
            self.custom_instructions,
            self.knowledge_file_num,
            self.knowledge_file_list,
            self.modified_file_list,
            updated_date.into(),
            self.created_date,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeFileRow {
    pub file_name: String,
    pub change_description: String,
    pub timestamp: String,
}

impl KnowledgeFileRow {
    pub fn into_row(self) -> Row {
        vec![self.file_name, self.change_description, self.timestamp]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentLink {
    pub id: String,
    pub web_view_link: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_range: Option<String>,
    pub updated_rows: u32,
}

#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn read_range(&self, sheet: &str, range: &RangeSpec) -> Result<Vec<Row>>;

    async fn append_rows(
        &self,
        sheet: &str,
        range: &RangeSpec,
        rows: Vec<Row>,
    ) -> Result<AppendReceipt>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_document_by_name(
        &self,
        folder_id: &str,
        name: &str,
    ) -> Result<Option<DocumentLink>>;
}
