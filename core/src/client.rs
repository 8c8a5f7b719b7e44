//! Stateless request builder and response parser for every qdbapi action.
//!
//! # Design
//! `QuickBaseClient` holds only the base URL and carries no mutable state
//! between calls. Each operation is split into a `build_*` method that
//! produces an `ApiCall` and a `parse_*` method that consumes a `Response`.
//! Binding the call to a ticket and executing the round-trip is left to the
//! caller (see `Session`), which keeps this layer deterministic and free of
//! I/O. Every `parse_*` converts an embedded error code into `Err` before
//! looking at the payload.

use crate::error::{Error, Result};
use crate::request::{Action, ApiCall, Param, MAIN_DBID};
use crate::response::Response;
use crate::types::{
    join_fids, AccessLevel, AddedField, ChildTable, CreatedDatabase, CsvImport, DatabaseSummary, DbId, DbInfo,
    EditedRecord, FieldDescriptor, FieldId, FieldProperties, FieldRef, FieldType, FieldValues, ImportSummary,
    PageRef, PageType, Permission, Query, QueryDef, QueryResult, RecordField, RecordId, RecordInfo, RecordRef,
    ResultsFormat, Schema, SignedIn, Ticket, UpdateId,
};
use crate::xml::Element;

/// Builds qdbapi calls and decodes their replies.
#[derive(Debug, Clone)]
pub struct QuickBaseClient {
    base_url: String,
}

impl QuickBaseClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn call(&self, dbid: &str, action: Action) -> ApiCall {
        ApiCall::new(&self.base_url, dbid, action)
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    pub fn build_authenticate(&self, username: &str, password: &str, hours: Option<u32>) -> ApiCall {
        self.call(MAIN_DBID, Action::Authenticate)
            .param("username", username)
            .param("password", password)
            .param_opt("hours", hours.map(|h| h.to_string()))
    }

    pub fn parse_authenticate(&self, response: Response) -> Result<SignedIn> {
        let response = response.into_result()?;
        Ok(SignedIn {
            ticket: Ticket::new(response.required("ticket")?),
            user_id: response.field("userid").map(str::to_owned),
        })
    }

    pub fn build_sign_out(&self) -> ApiCall {
        self.call(MAIN_DBID, Action::SignOut)
    }

    pub fn parse_sign_out(&self, response: Response) -> Result<()> {
        response.into_result().map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Databases
    // -----------------------------------------------------------------------

    pub fn build_find_db_by_name(&self, name: &str) -> ApiCall {
        self.call(MAIN_DBID, Action::FindDbByName).param("dbname", name)
    }

    pub fn parse_find_db_by_name(&self, response: Response) -> Result<DbId> {
        let response = response.into_result()?;
        Ok(DbId::new(response.required("dbid")?))
    }

    pub fn build_granted_dbs(&self) -> ApiCall {
        self.call(MAIN_DBID, Action::GrantedDbs)
    }

    pub fn parse_granted_dbs(&self, response: Response) -> Result<Vec<DatabaseSummary>> {
        let response = response.into_result()?;
        response
            .children("databases")
            .map(|db| {
                Ok(DatabaseSummary {
                    dbid: DbId::new(required_child(db, "dbid")?),
                    name: db.child_text("dbname").unwrap_or_default().to_string(),
                })
            })
            .collect()
    }

    pub fn build_get_db_info(&self, dbid: &DbId) -> ApiCall {
        self.call(dbid.as_str(), Action::GetDbInfo)
    }

    pub fn parse_get_db_info(&self, response: Response) -> Result<DbInfo> {
        let response = response.into_result()?;
        Ok(DbInfo {
            name: response.required("dbname")?.to_string(),
            num_records: response.parse_field("numRecords")?,
            last_rec_mod_time: response
                .field("lastRecModTime")
                .and_then(|t| t.trim().parse().ok()),
            manager_id: response.field("mgrID").map(str::to_owned),
            manager_name: response.field("mgrName").map(str::to_owned),
            version: response.field("version").map(str::to_owned),
        })
    }

    pub fn build_get_schema(&self, dbid: &DbId) -> ApiCall {
        self.call(dbid.as_str(), Action::GetSchema)
    }

    pub fn parse_get_schema(&self, response: Response) -> Result<Schema> {
        let response = response.into_result()?;
        let table = response
            .root()?
            .child("table")
            .ok_or_else(|| Error::Deserialization("schema response is missing <table>".to_string()))?;
        parse_schema(table)
    }

    pub fn build_create_database(&self, name: &str, description: &str) -> ApiCall {
        self.call(MAIN_DBID, Action::CreateDatabase)
            .param("dbname", name)
            .param("dbdesc", description)
    }

    pub fn parse_create_database(&self, response: Response) -> Result<CreatedDatabase> {
        let response = response.into_result()?;
        Ok(CreatedDatabase {
            dbid: DbId::new(response.required("dbid")?),
            app_dbid: response.field("appdbid").map(DbId::from),
        })
    }

    /// Copy the structure of `source`, and its records when `keep_data`.
    pub fn build_clone_database(&self, source: &DbId, name: &str, description: &str, keep_data: bool) -> ApiCall {
        self.call(source.as_str(), Action::CloneDatabase)
            .param("newdbname", name)
            .param("newdbdesc", description)
            .flag("keepData", keep_data)
    }

    pub fn parse_clone_database(&self, response: Response) -> Result<DbId> {
        let response = response.into_result()?;
        Ok(DbId::new(response.required("newdbid")?))
    }

    pub fn build_delete_database(&self, dbid: &DbId) -> ApiCall {
        self.call(dbid.as_str(), Action::DeleteDatabase)
    }

    pub fn parse_delete_database(&self, response: Response) -> Result<()> {
        response.into_result().map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Fields
    // -----------------------------------------------------------------------

    pub fn build_add_field(&self, dbid: &DbId, label: &str, field_type: &FieldType) -> ApiCall {
        self.call(dbid.as_str(), Action::AddField)
            .param("label", label)
            .param("type", field_type.as_str())
    }

    pub fn parse_add_field(&self, response: Response) -> Result<AddedField> {
        let response = response.into_result()?;
        Ok(AddedField {
            id: response.parse_field("fid")?,
            label: response.field("label").unwrap_or_default().to_string(),
        })
    }

    pub fn build_delete_field(&self, dbid: &DbId, fid: FieldId) -> ApiCall {
        self.call(dbid.as_str(), Action::DeleteField).param("fid", fid.to_string())
    }

    pub fn parse_delete_field(&self, response: Response) -> Result<()> {
        response.into_result().map(|_| ())
    }

    pub fn build_set_field_properties(&self, dbid: &DbId, fid: FieldId, properties: &FieldProperties) -> ApiCall {
        properties.iter().fold(
            self.call(dbid.as_str(), Action::SetFieldProperties).param("fid", fid.to_string()),
            |call, (name, value)| call.param(name, value),
        )
    }

    pub fn parse_set_field_properties(&self, response: Response) -> Result<()> {
        response.into_result().map(|_| ())
    }

    pub fn build_field_add_choices<S: AsRef<str>>(&self, dbid: &DbId, fid: FieldId, choices: &[S]) -> ApiCall {
        choices.iter().fold(
            self.call(dbid.as_str(), Action::FieldAddChoices).param("fid", fid.to_string()),
            |call, choice| call.param("choice", choice.as_ref()),
        )
    }

    /// Number of choices actually added; duplicates are not counted.
    pub fn parse_field_add_choices(&self, response: Response) -> Result<u32> {
        response.into_result()?.parse_field("numadded")
    }

    pub fn build_field_remove_choices<S: AsRef<str>>(&self, dbid: &DbId, fid: FieldId, choices: &[S]) -> ApiCall {
        choices.iter().fold(
            self.call(dbid.as_str(), Action::FieldRemoveChoices).param("fid", fid.to_string()),
            |call, choice| call.param("choice", choice.as_ref()),
        )
    }

    pub fn parse_field_remove_choices(&self, response: Response) -> Result<u32> {
        response.into_result()?.parse_field("numremoved")
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    pub fn build_add_record(&self, dbid: &DbId, values: &FieldValues) -> ApiCall {
        with_field_values(self.call(dbid.as_str(), Action::AddRecord), values)
    }

    pub fn parse_add_record(&self, response: Response) -> Result<RecordRef> {
        let response = response.into_result()?;
        Ok(RecordRef {
            rid: response.parse_field("rid")?,
            update_id: UpdateId(response.required("update_id")?.to_string()),
        })
    }

    /// `expected_update_id`, when given, makes the service reject the edit if
    /// the record changed since that version was read.
    pub fn build_edit_record(
        &self,
        dbid: &DbId,
        rid: RecordId,
        values: &FieldValues,
        expected_update_id: Option<&UpdateId>,
    ) -> ApiCall {
        let call = self
            .call(dbid.as_str(), Action::EditRecord)
            .param("rid", rid.to_string())
            .param_opt("update_id", expected_update_id.map(|u| u.as_str()));
        with_field_values(call, values)
    }

    pub fn parse_edit_record(&self, response: Response) -> Result<EditedRecord> {
        let response = response.into_result()?;
        Ok(EditedRecord {
            fields_changed: response.parse_field("num_fields_changed")?,
            update_id: UpdateId(response.required("update_id")?.to_string()),
        })
    }

    pub fn build_delete_record(&self, dbid: &DbId, rid: RecordId) -> ApiCall {
        self.call(dbid.as_str(), Action::DeleteRecord).param("rid", rid.to_string())
    }

    pub fn parse_delete_record(&self, response: Response) -> Result<()> {
        response.into_result().map(|_| ())
    }

    /// Delete every record, or only those matching `query`.
    pub fn build_purge_records(&self, dbid: &DbId, query: Option<&Query>) -> ApiCall {
        let call = self.call(dbid.as_str(), Action::PurgeRecords);
        match query {
            Some(query) => with_query(call, query),
            None => call,
        }
    }

    pub fn parse_purge_records(&self, response: Response) -> Result<u64> {
        response.into_result()?.parse_field("num_records_deleted")
    }

    pub fn build_get_record_info(&self, dbid: &DbId, rid: RecordId) -> ApiCall {
        self.call(dbid.as_str(), Action::GetRecordInfo).param("rid", rid.to_string())
    }

    pub fn parse_get_record_info(&self, response: Response) -> Result<RecordInfo> {
        let response = response.into_result()?;
        let fields = response
            .root()?
            .children_named("field")
            .map(|f| {
                Ok(RecordField {
                    id: parse_child(f, "fid")?,
                    name: f.child_text("name").unwrap_or_default().to_string(),
                    field_type: f.child_text("type").unwrap_or_default().parse().unwrap_or(FieldType::Text),
                    value: f.child_text("value").unwrap_or_default().to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RecordInfo {
            rid: response.parse_field("rid")?,
            update_id: UpdateId(response.required("update_id")?.to_string()),
            fields,
        })
    }

    pub fn build_do_query(&self, dbid: &DbId, query: &Query) -> ApiCall {
        with_query(self.call(dbid.as_str(), Action::DoQuery), query)
            .param("fmt", "structured")
            .flag("includeRids", true)
    }

    pub fn parse_do_query(&self, response: Response) -> Result<QueryResult> {
        let mut root = response.into_result()?.into_root()?;
        let records = root
            .take_children("table/records")
            .into_iter()
            .filter(|e| e.name == "record")
            .collect();
        Ok(QueryResult::new(records))
    }

    pub fn build_get_num_records(&self, dbid: &DbId) -> ApiCall {
        self.call(dbid.as_str(), Action::GetNumRecords)
    }

    pub fn parse_get_num_records(&self, response: Response) -> Result<u64> {
        response.into_result()?.parse_field("num_records")
    }

    // -----------------------------------------------------------------------
    // Ownership and permissions
    // -----------------------------------------------------------------------

    pub fn build_change_record_owner(&self, dbid: &DbId, rid: RecordId, new_owner: &str) -> ApiCall {
        self.call(dbid.as_str(), Action::ChangeRecordOwner)
            .param("rid", rid.to_string())
            .param("newowner", new_owner)
    }

    pub fn parse_change_record_owner(&self, response: Response) -> Result<()> {
        response.into_result().map(|_| ())
    }

    pub fn build_change_permission(&self, dbid: &DbId, principal: &str, permission: &Permission) -> ApiCall {
        self.call(dbid.as_str(), Action::ChangePermission)
            .param("uname", principal)
            .param("view", permission.view.as_str())
            .param("modify", permission.modify.as_str())
            .param("create", bool_text(permission.create))
            .param("delete", permission.delete.as_str())
            .param("saveviews", bool_text(permission.save_views))
            .param("admin", bool_text(permission.admin))
    }

    /// The permission now in effect, as echoed by the service.
    pub fn parse_change_permission(&self, response: Response) -> Result<Permission> {
        let response = response.into_result()?;
        Ok(Permission {
            view: response.required("view")?.parse::<AccessLevel>()?,
            modify: response.required("modify")?.parse::<AccessLevel>()?,
            create: parse_bool(response.required("create")?),
            delete: response.required("delete")?.parse::<AccessLevel>()?,
            save_views: parse_bool(response.required("saveviews")?),
            admin: parse_bool(response.required("admin")?),
        })
    }

    // -----------------------------------------------------------------------
    // Rendering passthroughs
    // -----------------------------------------------------------------------

    pub fn build_get_record_as_html(&self, dbid: &DbId, rid: RecordId) -> ApiCall {
        self.call(dbid.as_str(), Action::GetRecordAsHtml).param("rid", rid.to_string())
    }

    pub fn parse_get_record_as_html(&self, response: Response) -> Result<String> {
        response.into_result()?.into_passthrough()
    }

    pub fn build_gen_results_table(&self, dbid: &DbId, query: &Query, format: ResultsFormat) -> ApiCall {
        let mut query = query.clone();
        let call = self.call(dbid.as_str(), Action::GenResultsTable);
        match format {
            ResultsFormat::Csv | ResultsFormat::Tsv => {
                let flag = if format == ResultsFormat::Csv { "csv" } else { "tsv" };
                query.options = Some(match query.options.take() {
                    Some(existing) => format!("{existing}.{flag}"),
                    None => flag.to_string(),
                });
                with_query(call, &query)
            }
            ResultsFormat::Html => with_query(call, &query).param("jht", "n"),
            ResultsFormat::JavaScript => with_query(call, &query).flag("jht", true),
        }
    }

    pub fn parse_gen_results_table(&self, response: Response) -> Result<String> {
        response.into_result()?.into_passthrough()
    }

    /// HTML form for adding a record, optionally prefilled with `defaults`.
    pub fn build_gen_add_record_form(&self, dbid: &DbId, defaults: &FieldValues) -> ApiCall {
        with_field_values(self.call(dbid.as_str(), Action::GenAddRecordForm), defaults)
    }

    pub fn parse_gen_add_record_form(&self, response: Response) -> Result<String> {
        response.into_result()?.into_passthrough()
    }

    // -----------------------------------------------------------------------
    // Pages
    // -----------------------------------------------------------------------

    /// Create the page, or replace it when `page` names an existing one.
    pub fn build_add_replace_db_page(&self, dbid: &DbId, page: &PageRef, page_type: PageType, body: &str) -> ApiCall {
        with_page(self.call(dbid.as_str(), Action::AddReplaceDbPage), page)
            .param("pagetype", page_type.code())
            .param("pagebody", body)
    }

    pub fn parse_add_replace_db_page(&self, response: Response) -> Result<u32> {
        response.into_result()?.parse_field("pageID")
    }

    pub fn build_get_db_page(&self, dbid: &DbId, page: &PageRef) -> ApiCall {
        with_page(self.call(dbid.as_str(), Action::GetDbPage), page)
    }

    pub fn parse_get_db_page(&self, response: Response) -> Result<String> {
        response.into_result()?.into_passthrough()
    }

    // -----------------------------------------------------------------------
    // Import
    // -----------------------------------------------------------------------

    pub fn build_import_from_csv(&self, dbid: &DbId, import: &CsvImport) -> ApiCall {
        self.call(dbid.as_str(), Action::ImportFromCsv)
            .cdata("records_csv", import.records())
            .param("clist", join_fids(import.columns()))
            .flag("skipfirst", import.skips_first_row())
    }

    pub fn parse_import_from_csv(&self, response: Response) -> Result<ImportSummary> {
        let response = response.into_result()?;
        let input: u64 = response.parse_field("num_recs_input")?;
        let added: u64 = response.parse_field("num_recs_added")?;
        let updated: u64 = match response.field("num_recs_updated") {
            Some(_) => response.parse_field("num_recs_updated")?,
            None => 0,
        };
        let records = response
            .children("rids")
            .map(|rid| {
                Ok(RecordRef {
                    rid: rid
                        .text
                        .parse()
                        .map_err(|_| Error::Deserialization(format!("bad imported rid {:?}", rid.text)))?,
                    update_id: UpdateId(rid.attr("update_id").unwrap_or_default().to_string()),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ImportSummary {
            input,
            added,
            updated,
            skipped: input.saturating_sub(added.saturating_add(updated)),
            records,
        })
    }
}

fn with_field_values(call: ApiCall, values: &FieldValues) -> ApiCall {
    values.iter().fold(call, |call, value| {
        let param = Param::text("field", value.value.as_str());
        let param = match &value.field {
            FieldRef::Id(id) => param.with_attr("fid", id.to_string()),
            FieldRef::Name(name) => param.with_attr("name", name.as_str()),
        };
        let param = match &value.filename {
            Some(filename) => param.with_attr("filename", filename.as_str()),
            None => param,
        };
        call.element(param)
    })
}

fn with_query(call: ApiCall, query: &Query) -> ApiCall {
    call.param_opt("query", query.query.as_deref())
        .param_opt("qid", query.qid.map(|q| q.to_string()))
        .param_opt("qname", query.qname.as_deref())
        .param_opt("clist", (!query.clist.is_empty()).then(|| join_fids(&query.clist)))
        .param_opt("slist", (!query.slist.is_empty()).then(|| join_fids(&query.slist)))
        .param_opt("options", query.options.as_deref())
}

fn with_page(call: ApiCall, page: &PageRef) -> ApiCall {
    match page {
        PageRef::Id(id) => call.param("pageid", id.to_string()),
        PageRef::Name(name) => call.param("pagename", name.as_str()),
    }
}

fn parse_schema(table: &Element) -> Result<Schema> {
    let fields = table
        .find("fields")
        .into_iter()
        .flat_map(|f| f.children_named("field"))
        .map(|field| {
            Ok(FieldDescriptor {
                id: parse_attr(field, "id")?,
                label: field.child_text("label").unwrap_or_default().to_string(),
                field_type: field
                    .attr("field_type")
                    .unwrap_or_default()
                    .parse()
                    .unwrap_or(FieldType::Text),
                choices: field
                    .find("choices")
                    .into_iter()
                    .flat_map(|c| c.children_named("choice"))
                    .map(|c| c.text.clone())
                    .collect(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let child_tables = table
        .find("chdbids")
        .into_iter()
        .flat_map(|c| c.children_named("chdbid"))
        .map(|c| ChildTable {
            name: c.attr("name").unwrap_or_default().to_string(),
            dbid: DbId::new(c.text.as_str()),
        })
        .collect();

    let queries = table
        .find("queries")
        .into_iter()
        .flat_map(|q| q.children_named("query"))
        .map(|q| {
            Ok(QueryDef {
                id: parse_attr(q, "id")?,
                name: q.child_text("qyname").unwrap_or_default().to_string(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let variables = table
        .find("variables")
        .into_iter()
        .flat_map(|v| v.children_named("var"))
        .map(|v| (v.attr("name").unwrap_or_default().to_string(), v.text.clone()))
        .collect();

    Ok(Schema {
        name: table.child_text("name").unwrap_or_default().to_string(),
        description: table.child_text("desc").map(str::to_owned),
        fields,
        child_tables,
        queries,
        variables,
    })
}

fn required_child<'a>(element: &'a Element, name: &str) -> Result<&'a str> {
    element
        .child_text(name)
        .ok_or_else(|| Error::Deserialization(format!("<{}> is missing <{name}>", element.name)))
}

fn parse_child<T: std::str::FromStr>(element: &Element, name: &str) -> Result<T> {
    let raw = required_child(element, name)?;
    raw.trim()
        .parse()
        .map_err(|_| Error::Deserialization(format!("<{name}> has unexpected value {raw:?}")))
}

fn parse_attr<T: std::str::FromStr>(element: &Element, name: &str) -> Result<T> {
    let raw = element
        .attr(name)
        .ok_or_else(|| Error::Deserialization(format!("<{}> is missing attribute {name}", element.name)))?;
    raw.trim()
        .parse()
        .map_err(|_| Error::Deserialization(format!("attribute {name} has unexpected value {raw:?}")))
}

fn bool_text(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim(), "true" | "1")
}
