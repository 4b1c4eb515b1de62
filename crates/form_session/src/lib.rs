use chrono::{NaiveDate, NaiveDateTime};
use core_resolver::format_display;
use core_types::{CompositeKey, HelperColumn, HelperDraft, HelperRecord};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormError {
    #[error("please fill in all fields (missing: {})", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("the form is waiting for confirmation; confirm or cancel first")]
    AwaitingConfirmation,
    #[error("there is no submission waiting for confirmation")]
    NotConfirming,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FormField {
    HelperName,
    HelperType,
    Gai,
    CustomInstructions,
    KnowledgeFileNum,
    KnowledgeFileList,
    ModifiedFileList,
}

impl FormField {
    pub const ALL: [FormField; 7] = [
        FormField::HelperName,
        FormField::HelperType,
        FormField::Gai,
        FormField::CustomInstructions,
        FormField::KnowledgeFileNum,
        FormField::KnowledgeFileList,
        FormField::ModifiedFileList,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            FormField::HelperName => "Helper Name",
            FormField::HelperType => "Helper Type",
            FormField::Gai => "GAI",
            FormField::CustomInstructions => "Custom Instructions",
            FormField::KnowledgeFileNum => "Knowledge File Number",
            FormField::KnowledgeFileList => "Knowledge File List",
            FormField::ModifiedFileList => "Modified File List",
        }
    }

    pub const fn is_key(self) -> bool {
        matches!(
            self,
            FormField::HelperName | FormField::HelperType | FormField::Gai
        )
    }
}

/// What the user has typed or selected so far. Blank selections are unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelperInputs {
    pub helper_name: String,
    pub helper_type: String,
    pub gai: String,
    pub custom_instructions: String,
    pub knowledge_file_num: String,
    pub knowledge_file_list: String,
    pub modified_file_list: String,
    pub created_date: String,
}

impl HelperInputs {
    pub fn get(&self, field: FormField) -> &str {
        match field {
            FormField::HelperName => &self.helper_name,
            FormField::HelperType => &self.helper_type,
            FormField::Gai => &self.gai,
            FormField::CustomInstructions => &self.custom_instructions,
            FormField::KnowledgeFileNum => &self.knowledge_file_num,
            FormField::KnowledgeFileList => &self.knowledge_file_list,
            FormField::ModifiedFileList => &self.modified_file_list,
        }
    }

    fn slot(&mut self, field: FormField) -> &mut String {
        match field {
            FormField::HelperName => &mut self.helper_name,
            FormField::HelperType => &mut self.helper_type,
            FormField::Gai => &mut self.gai,
            FormField::CustomInstructions => &mut self.custom_instructions,
            FormField::KnowledgeFileNum => &mut self.knowledge_file_num,
            FormField::KnowledgeFileList => &mut self.knowledge_file_list,
            FormField::ModifiedFileList => &mut self.modified_file_list,
        }
    }

    pub fn key(&self) -> CompositeKey {
        let selected = |value: &str| (!value.is_empty()).then(|| value.to_string());
        CompositeKey {
            helper_name: selected(&self.helper_name),
            helper_type: selected(&self.helper_type),
            gai: selected(&self.gai),
        }
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        FormField::ALL
            .into_iter()
            .filter(|field| self.get(*field).trim().is_empty())
            .map(FormField::label)
            .collect()
    }

    fn clear_details(&mut self) {
        self.custom_instructions.clear();
        self.knowledge_file_num.clear();
        self.knowledge_file_list.clear();
        self.modified_file_list.clear();
        self.created_date.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FormState {
    Editing,
    Confirming(HelperDraft),
}

#[derive(Debug, Clone)]
pub struct HelperSession {
    id: SessionId,
    inputs: HelperInputs,
    state: FormState,
    prefilled_for: Option<CompositeKey>,
}

impl Default for HelperSession {
    fn default() -> Self {
        Self::new()
    }
}

impl HelperSession {
    pub fn new() -> Self {
        Self {
            id: SessionId::new_v4(),
            inputs: HelperInputs::default(),
            state: FormState::Editing,
            prefilled_for: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn inputs(&self) -> &HelperInputs {
        &self.inputs
    }

    pub fn is_confirming(&self) -> bool {
        matches!(self.state, FormState::Confirming(_))
    }

    /// Changing a key field clears the selections below it and any values
    /// that were prefilled for the previous key.
    pub fn set_field(&mut self, field: FormField, value: impl Into<String>) -> Result<(), FormError> {
        if self.is_confirming() {
            return Err(FormError::AwaitingConfirmation);
        }
        let value = value.into();
        if self.inputs.get(field) == value {
            return Ok(());
        }
        *self.inputs.slot(field) = value;

        if field.is_key() {
            match field {
                FormField::HelperName => {
                    self.inputs.helper_type.clear();
                    self.inputs.gai.clear();
                }
                FormField::HelperType => self.inputs.gai.clear(),
                _ => {}
            }
            if self.prefilled_for.take().is_some() {
                self.inputs.clear_details();
            }
        }
        Ok(())
    }

    /// The complete key whose latest record has not been loaded yet.
    pub fn needs_prefill(&self) -> Option<CompositeKey> {
        if self.is_confirming() {
            return None;
        }
        let key = self.inputs.key();
        (key.is_complete() && self.prefilled_for.as_ref() != Some(&key)).then_some(key)
    }

    /// Loads the latest record for `key` into the detail fields. A missing
    /// record marks the key as loaded so a new helper can be entered.
    pub fn apply_latest(&mut self, key: &CompositeKey, record: Option<&HelperRecord>) {
        if self.is_confirming() || self.inputs.key() != *key {
            return;
        }
        if let Some(record) = record {
            let value = |column| record.get(column).unwrap_or_default().to_string();
            self.inputs.custom_instructions = value(HelperColumn::CustomInstructions);
            self.inputs.knowledge_file_num = value(HelperColumn::KnowledgeFileNum);
            self.inputs.knowledge_file_list = value(HelperColumn::KnowledgeFileList);
            self.inputs.modified_file_list = value(HelperColumn::ModifiedFileList);
            self.inputs.created_date = value(HelperColumn::CreatedDate);
        }
        debug!(session_id = %self.id, found = record.is_some(), "prefilled helper form");
        self.prefilled_for = Some(key.clone());
    }

    /// Validates and snapshots the inputs. A helper with no earlier version
    /// is created `now`.
    pub fn submit(&mut self, now: NaiveDateTime) -> Result<&HelperDraft, FormError> {
        if self.is_confirming() {
            return Err(FormError::AwaitingConfirmation);
        }
        let missing = self.inputs.missing_fields();
        if !missing.is_empty() {
            return Err(FormError::MissingFields(missing));
        }

        let inputs = &self.inputs;
        let created_date = if inputs.created_date.trim().is_empty() {
            format_display(now)
        } else {
            inputs.created_date.clone()
        };
        let draft = HelperDraft {
            helper_name: inputs.helper_name.clone(),
            helper_type: inputs.helper_type.clone(),
            gai: inputs.gai.clone(),
            custom_instructions: inputs.custom_instructions.clone(),
            knowledge_file_num: inputs.knowledge_file_num.clone(),
            knowledge_file_list: inputs.knowledge_file_list.clone(),
            modified_file_list: inputs.modified_file_list.clone(),
            created_date,
        };
        info!(session_id = %self.id, helper = %draft.helper_name, "helper form submitted for confirmation");
        self.state = FormState::Confirming(draft);
        self.pending()
    }

    pub fn pending(&self) -> Result<&HelperDraft, FormError> {
        match &self.state {
            FormState::Confirming(draft) => Ok(draft),
            FormState::Editing => Err(FormError::NotConfirming),
        }
    }

    pub fn cancel(&mut self) -> Result<(), FormError> {
        self.pending()?;
        self.state = FormState::Editing;
        debug!(session_id = %self.id, "helper confirmation cancelled");
        Ok(())
    }

    pub fn complete_commit(&mut self) -> Result<HelperDraft, FormError> {
        let state = std::mem::replace(&mut self.state, FormState::Editing);
        let FormState::Confirming(draft) = state else {
            return Err(FormError::NotConfirming);
        };
        self.inputs = HelperInputs::default();
        self.prefilled_for = None;
        info!(session_id = %self.id, helper = %draft.helper_name, "helper form committed");
        Ok(draft)
    }

    pub fn confirmation_lines(&self) -> Result<IndexMap<&'static str, String>, FormError> {
        let draft = self.pending()?;
        let mut lines = IndexMap::new();
        lines.insert(FormField::HelperName.label(), draft.helper_name.clone());
        lines.insert(FormField::HelperType.label(), draft.helper_type.clone());
        lines.insert(FormField::Gai.label(), draft.gai.clone());
        lines.insert(
            FormField::CustomInstructions.label(),
            draft.custom_instructions.clone(),
        );
        lines.insert(
            FormField::KnowledgeFileNum.label(),
            draft.knowledge_file_num.clone(),
        );
        lines.insert(
            FormField::KnowledgeFileList.label(),
            draft.knowledge_file_list.clone(),
        );
        lines.insert(
            FormField::ModifiedFileList.label(),
            draft.modified_file_list.clone(),
        );
        lines.insert("CreatedDate", confirmation_date(&draft.created_date));
        Ok(lines)
    }
}

/// Only the two spellings the sheet itself produces are reformatted.
pub fn confirmation_date(value: &str) -> String {
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return format_display(parsed);
    }
    match NaiveDate::parse_from_str(value, "%b %d, %Y") {
        Ok(date) => date.format(core_resolver::DISPLAY_FORMAT).to_string(),
        Err(_) => value.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeChange {
    pub file_name: String,
    pub change_description: String,
}

impl KnowledgeChange {
    pub fn new(
        file_name: impl Into<String>,
        change_description: impl Into<String>,
    ) -> Result<Self, FormError> {
        let file_name = file_name.into();
        let change_description = change_description.into();
        let mut missing = Vec::new();
        if file_name.trim().is_empty() {
            missing.push("Knowledge File");
        }
        if change_description.trim().is_empty() {
            missing.push("Change Description");
        }
        if !missing.is_empty() {
            return Err(FormError::MissingFields(missing));
        }
        Ok(Self {
            file_name,
            change_description,
        })
    }
}
