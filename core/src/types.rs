//! Domain types for the qdbapi client.
//!
//! # Design
//! Identifiers are newtypes so a record id can never be passed where a field
//! id is expected. Field/value lists are immutable values built per call; the
//! client keeps no accumulator between operations. Everything decoded from a
//! response is an owned value detached from the XML tree.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::xml::Element;

/// Opaque id of an application or table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DbId(pub String);

impl DbId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DbId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldId(pub u32);

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FieldId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(FieldId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(RecordId)
    }
}

/// Server-assigned version marker of a record. Opaque; only compared for
/// equality by the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateId(pub String);

impl UpdateId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authentication ticket. Never printed in full.
#[derive(Clone, PartialEq, Eq)]
pub struct Ticket(String);

impl Ticket {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ticket(***)")
    }
}

/// Result of `API_Authenticate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedIn {
    pub ticket: Ticket,
    pub user_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Fields and values
// ---------------------------------------------------------------------------

/// Reference to a field by id or by label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRef {
    Id(FieldId),
    Name(String),
}

impl From<FieldId> for FieldRef {
    fn from(id: FieldId) -> Self {
        FieldRef::Id(id)
    }
}

impl From<&str> for FieldRef {
    fn from(name: &str) -> Self {
        FieldRef::Name(name.to_string())
    }
}

/// A proposed value for one field of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub field: FieldRef,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Ordered field/value pairs for one record operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldValues(Vec<FieldValue>);

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<FieldRef>, value: impl Into<String>) -> Self {
        self.0.push(FieldValue {
            field: field.into(),
            value: value.into(),
            filename: None,
        });
        self
    }

    /// A file attachment value. `contents` is sent as given.
    pub fn with_file(
        mut self,
        field: impl Into<FieldRef>,
        filename: impl Into<String>,
        contents: impl Into<String>,
    ) -> Self {
        self.0.push(FieldValue {
            field: field.into(),
            value: contents.into(),
            filename: Some(filename.into()),
        });
        self
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FieldValue> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a FieldValues {
    type Item = &'a FieldValue;
    type IntoIter = std::slice::Iter<'a, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Field types accepted by `API_AddField`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Text,
    MultiText,
    Float,
    Currency,
    Rating,
    Checkbox,
    Date,
    Timestamp,
    Duration,
    Email,
    Phone,
    Url,
    File,
    UserId,
    Other(String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::Text => "text",
            FieldType::MultiText => "multitext",
            FieldType::Float => "float",
            FieldType::Currency => "currency",
            FieldType::Rating => "rating",
            FieldType::Checkbox => "checkbox",
            FieldType::Date => "date",
            FieldType::Timestamp => "timestamp",
            FieldType::Duration => "duration",
            FieldType::Email => "email",
            FieldType::Phone => "phone",
            FieldType::Url => "url",
            FieldType::File => "file",
            FieldType::UserId => "userid",
            FieldType::Other(s) => s,
        }
    }

    /// Whether the type can carry a choice list.
    pub fn supports_choices(&self) -> bool {
        matches!(
            self,
            FieldType::Text | FieldType::MultiText | FieldType::Float | FieldType::Currency | FieldType::Rating
        )
    }
}

impl FromStr for FieldType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "text" => FieldType::Text,
            "multitext" => FieldType::MultiText,
            "float" => FieldType::Float,
            "currency" => FieldType::Currency,
            "rating" => FieldType::Rating,
            "checkbox" => FieldType::Checkbox,
            "date" => FieldType::Date,
            "timestamp" => FieldType::Timestamp,
            "duration" => FieldType::Duration,
            "email" => FieldType::Email,
            "phone" => FieldType::Phone,
            "url" => FieldType::Url,
            "file" => FieldType::File,
            "userid" => FieldType::UserId,
            other => FieldType::Other(other.to_string()),
        })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schema entry for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub id: FieldId,
    pub label: String,
    pub field_type: FieldType,
    pub choices: Vec<String>,
}

/// Result of `API_AddField`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedField {
    pub id: FieldId,
    pub label: String,
}

/// Property changes for `API_SetFieldProperties`, applied in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldProperties(Vec<(String, String)>);

impl FieldProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(self, label: impl Into<String>) -> Self {
        self.property("label", label)
    }

    pub fn required(self, required: bool) -> Self {
        self.property("required", if required { "1" } else { "0" })
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((name.into(), value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Databases and schema
// ---------------------------------------------------------------------------

/// One entry of `API_GrantedDBs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSummary {
    pub dbid: DbId,
    pub name: String,
}

/// Result of `API_CreateDatabase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedDatabase {
    pub dbid: DbId,
    pub app_dbid: Option<DbId>,
}

/// Result of `API_GetDBInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbInfo {
    pub name: String,
    pub num_records: u64,
    pub last_rec_mod_time: Option<u64>,
    pub manager_id: Option<String>,
    pub manager_name: Option<String>,
    pub version: Option<String>,
}

/// A child table listed under an application's `chdbids`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildTable {
    pub name: String,
    pub dbid: DbId,
}

/// A saved query listed in a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDef {
    pub id: u32,
    pub name: String,
}

/// Result of `API_GetSchema`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    pub name: String,
    pub description: Option<String>,
    pub fields: Vec<FieldDescriptor>,
    pub child_tables: Vec<ChildTable>,
    pub queries: Vec<QueryDef>,
    pub variables: Vec<(String, String)>,
}

impl Schema {
    pub fn field(&self, id: FieldId) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn field_by_label(&self, label: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.label == label)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Identity and version of a record after it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub rid: RecordId,
    pub update_id: UpdateId,
}

/// Result of `API_EditRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditedRecord {
    pub fields_changed: u32,
    pub update_id: UpdateId,
}

/// One field of `API_GetRecordInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordField {
    pub id: FieldId,
    pub name: String,
    pub field_type: FieldType,
    pub value: String,
}

/// Result of `API_GetRecordInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub rid: RecordId,
    pub update_id: UpdateId,
    pub fields: Vec<RecordField>,
}

impl RecordInfo {
    pub fn value(&self, id: FieldId) -> Option<&str> {
        self.fields.iter().find(|f| f.id == id).map(|f| f.value.as_str())
    }
}

/// One record of a structured query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub rid: Option<RecordId>,
    pub update_id: Option<UpdateId>,
    pub values: Vec<(FieldId, String)>,
}

impl Record {
    pub fn value(&self, id: FieldId) -> Option<&str> {
        self.values.iter().find(|(f, _)| *f == id).map(|(_, v)| v.as_str())
    }

    pub(crate) fn from_element(element: &Element) -> Result<Self> {
        let rid = element
            .attr("rid")
            .map(|r| r.parse::<RecordId>())
            .transpose()
            .map_err(|_| Error::Deserialization(format!("bad record rid {:?}", element.attr("rid"))))?;
        let update_id = element.attr("update_id").map(|u| UpdateId(u.to_string()));
        let values = element
            .children_named("f")
            .map(|f| {
                let id = f
                    .attr("id")
                    .ok_or_else(|| Error::Deserialization("record value without id".to_string()))?
                    .parse::<FieldId>()
                    .map_err(|_| Error::Deserialization(format!("bad field id {:?}", f.attr("id"))))?;
                Ok((id, f.text.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rid,
            update_id,
            values,
        })
    }
}

/// Records of one `API_DoQuery` reply. Consumed once; to iterate again, issue
/// the query again.
#[derive(Debug)]
pub struct QueryResult {
    records: std::vec::IntoIter<Element>,
}

impl QueryResult {
    pub(crate) fn new(records: Vec<Element>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

impl Iterator for QueryResult {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next().map(|element| Record::from_element(&element))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}

/// Selection for `API_DoQuery`, `API_GenResultsTable` and `API_PurgeRecords`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    pub query: Option<String>,
    pub qid: Option<u32>,
    pub qname: Option<String>,
    pub clist: Vec<FieldId>,
    pub slist: Vec<FieldId>,
    pub options: Option<String>,
}

impl Query {
    /// Every record, default columns.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Default::default()
        }
    }

    pub fn saved(qid: u32) -> Self {
        Self {
            qid: Some(qid),
            ..Default::default()
        }
    }

    pub fn columns(mut self, clist: impl IntoIterator<Item = FieldId>) -> Self {
        self.clist = clist.into_iter().collect();
        self
    }

    pub fn sort_by(mut self, slist: impl IntoIterator<Item = FieldId>) -> Self {
        self.slist = slist.into_iter().collect();
        self
    }
}

/// Dot-joined field id list, e.g. `6.7.8`.
pub(crate) fn join_fids(fids: &[FieldId]) -> String {
    fids.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(".")
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// Record-level access granted by a permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    None,
    Owner,
    Group,
    Any,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::None => "none",
            AccessLevel::Owner => "owner",
            AccessLevel::Group => "group",
            AccessLevel::Any => "any",
        }
    }
}

impl FromStr for AccessLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "none" => Ok(AccessLevel::None),
            "owner" => Ok(AccessLevel::Owner),
            "group" => Ok(AccessLevel::Group),
            "any" => Ok(AccessLevel::Any),
            other => Err(Error::Deserialization(format!("unknown access level {other:?}"))),
        }
    }
}

/// Permissions of one principal on one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission {
    pub view: AccessLevel,
    pub modify: AccessLevel,
    pub create: bool,
    pub delete: AccessLevel,
    pub save_views: bool,
    pub admin: bool,
}

impl Default for Permission {
    fn default() -> Self {
        Self {
            view: AccessLevel::Any,
            modify: AccessLevel::Any,
            create: true,
            delete: AccessLevel::Any,
            save_views: true,
            admin: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering and pages
// ---------------------------------------------------------------------------

/// Output of `API_GenResultsTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultsFormat {
    Html,
    Csv,
    Tsv,
    JavaScript,
}

/// Page addressed by id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRef {
    Id(u32),
    Name(String),
}

impl From<&str> for PageRef {
    fn from(name: &str) -> Self {
        PageRef::Name(name.to_string())
    }
}

/// Kind of page stored by `API_AddReplaceDBPage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// XSL stylesheet or HTML page.
    Html,
    ExactForm,
}

impl PageType {
    pub fn code(self) -> &'static str {
        match self {
            PageType::Html => "1",
            PageType::ExactForm => "3",
        }
    }
}

// ---------------------------------------------------------------------------
// CSV import
// ---------------------------------------------------------------------------

/// Validated payload for `API_ImportFromCSV`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvImport {
    records: String,
    rows: usize,
    columns: Vec<FieldId>,
    skip_first: bool,
}

impl CsvImport {
    /// Rows may be separated by `\n` or `\r\n`; they are normalized to
    /// `\r\n`. Columns are comma-separated and map onto `columns` in order.
    /// Blank lines between rows are dropped. Line breaks inside a
    /// double-quoted cell belong to the cell and are kept as written.
    pub fn new(text: &str, columns: impl IntoIterator<Item = FieldId>) -> Result<Self> {
        let columns: Vec<FieldId> = columns.into_iter().collect();
        if columns.is_empty() {
            return Err(Error::InvalidRequest("CSV import needs at least one column".to_string()));
        }
        if text.contains('\r') && text.replace("\r\n", "").contains('\r') {
            return Err(Error::InvalidRequest("CSV rows must end with \\n or \\r\\n".to_string()));
        }
        let rows = split_csv_rows(text)?;
        if rows.is_empty() {
            return Err(Error::InvalidRequest("CSV import has no rows".to_string()));
        }
        Ok(Self {
            records: rows.join("\r\n"),
            rows: rows.len(),
            columns,
            skip_first: false,
        })
    }

    /// Treat the first row as a header.
    pub fn skip_first_row(mut self, skip: bool) -> Self {
        self.skip_first = skip;
        self
    }

    pub fn records(&self) -> &str {
        &self.records
    }

    pub fn columns(&self) -> &[FieldId] {
        &self.columns
    }

    pub fn skips_first_row(&self) -> bool {
        self.skip_first
    }

    /// Number of records, counting a multi-line quoted cell once.
    pub fn row_count(&self) -> usize {
        self.rows
    }
}

fn split_csv_rows(text: &str) -> Result<Vec<&str>> {
    let mut rows = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '\n' if !quoted => {
                let row = &text[start..i];
                rows.push(row.strip_suffix('\r').unwrap_or(row));
                start = i + 1;
            }
            _ => {}
        }
    }
    if quoted {
        return Err(Error::InvalidRequest("CSV has an unterminated quoted cell".to_string()));
    }
    rows.push(&text[start..]);
    rows.retain(|row| !row.trim().is_empty());
    Ok(rows)
}

/// Outcome of a CSV import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub input: u64,
    pub added: u64,
    pub updated: u64,
    /// Rows the service neither added nor updated (malformed or rejected).
    pub skipped: u64,
    pub records: Vec<RecordRef>,
}
