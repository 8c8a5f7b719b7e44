//! In-memory service state and the behaviour of every action.
//!
//! `Backend::handle` is synchronous and independent of axum, so the router
//! only has to decode the body and lock the state.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use uuid::Uuid;

use crate::wire::{escape_html, ApiRequest, WireParam, Xml};

pub const DEMO_USER: &str = "demo@example.com";
pub const DEMO_PASSWORD: &str = "demo-password";
pub const OTHER_USER: &str = "colleague@example.com";
pub const OTHER_PASSWORD: &str = "colleague-password";
pub const DEMO_APP: &str = "Demo App";
pub const DEMO_APP_DBID: &str = "bqdemoapp";
pub const DEMO_TASKS_DBID: &str = "bqdemotsk";

const EPOCH_MS: u64 = 1_700_000_000_000;
const LAST_BUILTIN_FID: u32 = 5;
const RECORD_ID_FID: u32 = 3;

/// Rejection reported through `errcode` / `errtext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: u32,
    pub text: String,
    pub detail: Option<String>,
}

impl Fault {
    fn new(code: u32, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            detail: None,
        }
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Successful reply body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Elements placed inside the response envelope.
    Xml(String),
    /// A formatted document returned as is.
    Document { content_type: &'static str, body: String },
}

type Outcome = Result<Payload, Fault>;

#[derive(Debug, Clone)]
struct User {
    id: String,
    name: String,
    password: String,
}

#[derive(Debug, Clone)]
struct Field {
    id: u32,
    label: String,
    field_type: String,
    choices: Vec<String>,
    required: bool,
}

impl Field {
    fn new(id: u32, label: &str, field_type: &str) -> Self {
        Self {
            id,
            label: label.to_string(),
            field_type: field_type.to_string(),
            choices: Vec::new(),
            required: false,
        }
    }

    fn is_builtin(&self) -> bool {
        self.id <= LAST_BUILTIN_FID
    }

    fn supports_choices(&self) -> bool {
        matches!(
            self.field_type.as_str(),
            "text" | "multitext" | "float" | "currency" | "rating"
        )
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    owner: String,
    modified_by: String,
    created: u64,
    modified: u64,
    update_id: u64,
    values: BTreeMap<u32, String>,
}

#[derive(Debug, Clone)]
struct Page {
    id: u32,
    name: String,
    body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Grant {
    view: String,
    modify: String,
    create: String,
    delete: String,
    saveviews: String,
    admin: String,
}

impl Default for Grant {
    fn default() -> Self {
        Self {
            view: "any".to_string(),
            modify: "any".to_string(),
            create: "true".to_string(),
            delete: "any".to_string(),
            saveviews: "true".to_string(),
            admin: "false".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct SavedQuery {
    id: u32,
    name: String,
    filter: String,
}

#[derive(Debug, Clone)]
struct Table {
    name: String,
    description: String,
    parent: Option<String>,
    children: Vec<String>,
    manager: String,
    fields: Vec<Field>,
    next_fid: u32,
    records: BTreeMap<u64, StoredRecord>,
    next_rid: u64,
    pages: Vec<Page>,
    next_page: u32,
    grants: BTreeMap<String, Grant>,
    variables: Vec<(String, String)>,
    queries: Vec<SavedQuery>,
    last_mod: u64,
}

impl Table {
    fn new(name: &str, description: &str, manager: &str, now: u64) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parent: None,
            children: Vec::new(),
            manager: manager.to_string(),
            fields: vec![
                Field::new(1, "Date Created", "timestamp"),
                Field::new(2, "Date Modified", "timestamp"),
                Field::new(3, "Record ID#", "recordid"),
                Field::new(4, "Record Owner", "userid"),
                Field::new(5, "Last Modified By", "userid"),
            ],
            next_fid: LAST_BUILTIN_FID + 1,
            records: BTreeMap::new(),
            next_rid: 1,
            pages: vec![Page {
                id: 1,
                name: "Default Overview".to_string(),
                body: format!("<html><body><h1>{}</h1></body></html>", escape_html(name)),
            }],
            next_page: 2,
            grants: BTreeMap::new(),
            variables: Vec::new(),
            queries: vec![SavedQuery {
                id: 1,
                name: "List All".to_string(),
                filter: String::new(),
            }],
            last_mod: now,
        }
    }

    fn add_field(&mut self, label: &str, field_type: &str) -> u32 {
        let id = self.next_fid;
        self.next_fid += 1;
        self.fields.push(Field::new(id, label, field_type));
        id
    }

    fn user_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| !f.is_builtin())
    }

    fn field(&self, fid: u32) -> Result<&Field, Fault> {
        self.fields
            .iter()
            .find(|f| f.id == fid)
            .ok_or_else(|| Fault::new(31, "No such field").detail(format!("field {fid}")))
    }

    fn field_mut(&mut self, fid: u32) -> Result<&mut Field, Fault> {
        self.fields
            .iter_mut()
            .find(|f| f.id == fid)
            .ok_or_else(|| Fault::new(31, "No such field").detail(format!("field {fid}")))
    }

    /// Resolve `<field fid="..">` or `<field name="..">`.
    fn resolve(&self, param: &WireParam) -> Result<u32, Fault> {
        if let Some(fid) = param.attr("fid") {
            let fid = parse_value::<u32>("fid", fid)?;
            return self.field(fid).map(|f| f.id);
        }
        let name = param
            .attr("name")
            .ok_or_else(|| Fault::new(2, "Invalid input").detail("field without fid or name"))?;
        self.fields
            .iter()
            .find(|f| f.label.eq_ignore_ascii_case(name) || f.label.to_lowercase().replace(' ', "_") == name)
            .map(|f| f.id)
            .ok_or_else(|| Fault::new(31, "No such field").detail(name.to_string()))
    }

    fn record(&self, rid: u64) -> Result<&StoredRecord, Fault> {
        self.records
            .get(&rid)
            .ok_or_else(|| Fault::new(30, "No such record").detail(format!("record {rid}")))
    }

    fn value(&self, rid: u64, record: &StoredRecord, fid: u32) -> String {
        match fid {
            1 => record.created.to_string(),
            2 => record.modified.to_string(),
            3 => rid.to_string(),
            4 => record.owner.clone(),
            5 => record.modified_by.clone(),
            _ => record.values.get(&fid).cloned().unwrap_or_default(),
        }
    }

    /// Field values of `request`, rejecting built-in fields.
    fn submitted_values(&self, request: &ApiRequest) -> Result<Vec<(u32, String)>, Fault> {
        request
            .all("field")
            .map(|param| {
                let fid = self.resolve(param)?;
                let field = self.field(fid)?;
                if field.is_builtin() {
                    return Err(Fault::new(2, "Invalid input").detail(format!("field {fid} is read-only")));
                }
                let value = match (field.field_type.as_str(), param.attr("filename")) {
                    ("file", Some(filename)) => filename.to_string(),
                    _ => param.value.clone(),
                };
                Ok((fid, value))
            })
            .collect()
    }

    /// Record ids matching the query parameters of `request`, sorted.
    fn select(&self, request: &ApiRequest) -> Result<Vec<u64>, Fault> {
        let filter = if let Some(query) = request.get("query") {
            query.to_string()
        } else if let Some(qid) = request.get("qid") {
            let qid = parse_value::<u32>("qid", qid)?;
            self.queries
                .iter()
                .find(|q| q.id == qid)
                .map(|q| q.filter.clone())
                .ok_or_else(|| Fault::new(33, "No such query"))?
        } else if let Some(qname) = request.get("qname") {
            self.queries
                .iter()
                .find(|q| q.name == qname)
                .map(|q| q.filter.clone())
                .ok_or_else(|| Fault::new(33, "No such query"))?
        } else {
            String::new()
        };
        let conditions = parse_filter(&filter)?;
        for (_, condition) in &conditions {
            self.field(condition.fid)?;
        }

        let mut rids: Vec<u64> = self
            .records
            .iter()
            .filter(|(rid, record)| matches_filter(&conditions, |fid| self.value(**rid, record, fid)))
            .map(|(rid, _)| *rid)
            .collect();

        if let Some(slist) = request.get("slist") {
            let sort = parse_fids(slist)?;
            for fid in &sort {
                self.field(*fid)?;
            }
            rids.sort_by(|a, b| {
                let (ra, rb) = (&self.records[a], &self.records[b]);
                sort.iter()
                    .map(|fid| compare_values(&self.value(*a, ra, *fid), &self.value(*b, rb, *fid)))
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        Ok(rids)
    }

    /// Columns named by `clist`; user fields when absent.
    fn columns(&self, request: &ApiRequest) -> Result<Vec<u32>, Fault> {
        match request.get("clist") {
            Some("a") => Ok(self.fields.iter().map(|f| f.id).collect()),
            Some(clist) if !clist.trim().is_empty() => {
                let fids = parse_fids(clist)?;
                for fid in &fids {
                    self.field(*fid)?;
                }
                Ok(fids)
            }
            _ => {
                let fids: Vec<u32> = self.user_fields().map(|f| f.id).collect();
                Ok(if fids.is_empty() { vec![RECORD_ID_FID] } else { fids })
            }
        }
    }

    fn page(&self, request: &ApiRequest) -> Option<usize> {
        if let Some(id) = request.get("pageid") {
            let id = id.trim().parse::<u32>().ok()?;
            return self.pages.iter().position(|p| p.id == id);
        }
        let name = request.get("pagename")?;
        self.pages.iter().position(|p| p.name == name)
    }

    fn insert_record(&mut self, owner: &str, now: u64, values: Vec<(u32, String)>) -> (u64, u64) {
        let rid = self.next_rid;
        self.next_rid += 1;
        self.records.insert(
            rid,
            StoredRecord {
                owner: owner.to_string(),
                modified_by: owner.to_string(),
                created: now,
                modified: now,
                update_id: now,
                values: values.into_iter().collect(),
            },
        );
        self.last_mod = now;
        (rid, now)
    }
}

/// All users, tickets and tables of the mock service.
#[derive(Debug, Clone)]
pub struct Backend {
    users: Vec<User>,
    tickets: HashMap<String, String>,
    tables: BTreeMap<String, Table>,
    clock: u64,
    sign_outs: usize,
}

impl Default for Backend {
    fn default() -> Self {
        Self::seeded()
    }
}

impl Backend {
    /// Two users, and an application `Demo App` with a child table `Tasks`.
    pub fn seeded() -> Self {
        let demo = User {
            id: "56781234.demo".to_string(),
            name: DEMO_USER.to_string(),
            password: DEMO_PASSWORD.to_string(),
        };
        let other = User {
            id: "56785678.colleague".to_string(),
            name: OTHER_USER.to_string(),
            password: OTHER_PASSWORD.to_string(),
        };

        let mut app = Table::new(DEMO_APP, "Sample application", &demo.id, EPOCH_MS);
        app.children.push(DEMO_TASKS_DBID.to_string());
        app.variables.push(("release".to_string(), "1.0".to_string()));

        let mut tasks = Table::new("Tasks", "Work items", &demo.id, EPOCH_MS);
        tasks.parent = Some(DEMO_APP_DBID.to_string());
        let task = tasks.add_field("Task", "text");
        let status = tasks.add_field("Status", "text");
        if let Ok(field) = tasks.field_mut(status) {
            field.choices = vec!["Open".to_string(), "Done".to_string()];
        }
        tasks.queries.push(SavedQuery {
            id: 2,
            name: "Open Tasks".to_string(),
            filter: format!("{{'{status}'.EX.'Open'}}"),
        });
        for (n, (name, state)) in [("Write report", "Open"), ("File expenses", "Done")].into_iter().enumerate() {
            tasks.insert_record(
                &demo.id,
                EPOCH_MS + n as u64,
                vec![(task, name.to_string()), (status, state.to_string())],
            );
        }

        let mut tables = BTreeMap::new();
        tables.insert(DEMO_APP_DBID.to_string(), app);
        tables.insert(DEMO_TASKS_DBID.to_string(), tasks);

        Self {
            users: vec![demo, other],
            tickets: HashMap::new(),
            tables,
            clock: 0,
            sign_outs: 0,
        }
    }

    /// Number of successful `API_SignOut` calls served.
    pub fn sign_outs(&self) -> usize {
        self.sign_outs
    }

    pub fn active_tickets(&self) -> usize {
        self.tickets.len()
    }

    pub fn has_database(&self, dbid: &str) -> bool {
        self.tables.contains_key(dbid)
    }

    pub fn handle(&mut self, action: &str, dbid: &str, request: &ApiRequest) -> Outcome {
        self.clock += 1;
        if action == "API_Authenticate" {
            return self.authenticate(request);
        }
        let user = self.caller(request)?;
        match action {
            "API_SignOut" => self.sign_out(request),
            "API_FindDBByName" => self.find_db_by_name(request),
            "API_GrantedDBs" => self.granted_dbs(),
            "API_CreateDatabase" => self.create_database(&user, request),
            _ if dbid == "main" => Err(Fault::new(14, "Wrong dbid").detail(format!("{action} needs a table id"))),
            _ if !self.tables.contains_key(dbid) => {
                Err(Fault::new(32, "No such database").detail(dbid.to_string()))
            }
            _ => self.table_action(action, dbid, &user, request),
        }
    }

    fn now(&self) -> u64 {
        EPOCH_MS + self.clock
    }

    fn caller(&self, request: &ApiRequest) -> Result<String, Fault> {
        let ticket = request
            .ticket
            .as_deref()
            .ok_or_else(|| Fault::new(22, "Sign in required"))?;
        self.tickets
            .get(ticket)
            .cloned()
            .ok_or_else(|| Fault::new(4, "Bad or expired authentication ticket"))
    }

    fn user_named(&self, name: &str) -> Result<&User, Fault> {
        self.users
            .iter()
            .find(|u| u.name.eq_ignore_ascii_case(name) || u.id == name)
            .ok_or_else(|| Fault::new(2, "Invalid input").detail(format!("unknown user {name}")))
    }

    fn user_name(&self, id: &str) -> String {
        self.users
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn table(&self, dbid: &str) -> Result<&Table, Fault> {
        self.tables
            .get(dbid)
            .ok_or_else(|| Fault::new(32, "No such database").detail(dbid.to_string()))
    }

    fn table_mut(&mut self, dbid: &str) -> Result<&mut Table, Fault> {
        self.tables
            .get_mut(dbid)
            .ok_or_else(|| Fault::new(32, "No such database").detail(dbid.to_string()))
    }

    /// Managers of a table or of its application.
    fn is_manager(&self, dbid: &str, user: &str) -> bool {
        match self.tables.get(dbid) {
            Some(table) if table.manager == user => true,
            Some(table) => table
                .parent
                .as_deref()
                .and_then(|parent| self.tables.get(parent))
                .is_some_and(|app| app.manager == user),
            None => false,
        }
    }

    fn full_name(&self, table: &Table) -> String {
        match table.parent.as_deref().and_then(|p| self.tables.get(p)) {
            Some(app) => format!("{}: {}", app.name, table.name),
            None => table.name.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Service-wide actions
    // -----------------------------------------------------------------------

    fn authenticate(&mut self, request: &ApiRequest) -> Outcome {
        let username = required(request, "username")?;
        let password = request.get("password").unwrap_or_default();
        let user = self
            .users
            .iter()
            .find(|u| u.name.eq_ignore_ascii_case(username) && u.password == password)
            .ok_or_else(|| Fault::new(20, "Unknown username/password"))?;
        let user_id = user.id.clone();
        let ticket = Uuid::new_v4().simple().to_string();
        self.tickets.insert(ticket.clone(), user_id.clone());
        tracing::debug!(user = username, "ticket issued");
        xml(Xml::new().leaf("ticket", ticket).leaf("userid", user_id))
    }

    fn sign_out(&mut self, request: &ApiRequest) -> Outcome {
        if let Some(ticket) = request.ticket.as_deref() {
            self.tickets.remove(ticket);
        }
        self.sign_outs += 1;
        xml(Xml::new())
    }

    fn find_db_by_name(&self, request: &ApiRequest) -> Outcome {
        let name = required(request, "dbname")?;
        self.tables
            .iter()
            .find(|(_, t)| self.full_name(t) == name)
            .map(|(dbid, _)| xml(Xml::new().leaf("dbid", dbid)))
            .unwrap_or_else(|| Err(Fault::new(32, "No such database").detail(name.to_string())))
    }

    fn granted_dbs(&self) -> Outcome {
        let mut out = Xml::new();
        out.open("databases", &[]);
        for (dbid, table) in &self.tables {
            out.open("dbinfo", &[]);
            out.push_leaf("dbname", &[], &self.full_name(table));
            out.push_leaf("dbid", &[], dbid);
            out.close("dbinfo");
        }
        out.close("databases");
        xml(out)
    }

    fn create_database(&mut self, user: &str, request: &ApiRequest) -> Outcome {
        let name = required(request, "dbname")?;
        if name.trim().is_empty() {
            return Err(Fault::new(2, "Invalid input").detail("empty database name"));
        }
        let description = request.get("dbdesc").unwrap_or_default();
        let dbid = new_dbid();
        let table = Table::new(name, description, user, self.now());
        self.tables.insert(dbid.clone(), table);
        xml(Xml::new().leaf("dbid", dbid))
    }

    // -----------------------------------------------------------------------
    // Table actions
    // -----------------------------------------------------------------------

    fn table_action(&mut self, action: &str, dbid: &str, user: &str, request: &ApiRequest) -> Outcome {
        match action {
            "API_GetDBInfo" => self.get_db_info(dbid),
            "API_GetSchema" => self.get_schema(dbid),
            "API_CloneDatabase" => self.clone_database(dbid, user, request),
            "API_DeleteDatabase" => self.delete_database(dbid, user),
            "API_AddField" => self.add_field(dbid, request),
            "API_DeleteField" => self.delete_field(dbid, request),
            "API_SetFieldProperties" => self.set_field_properties(dbid, request),
            "API_FieldAddChoices" => self.change_choices(dbid, request, true),
            "API_FieldRemoveChoices" => self.change_choices(dbid, request, false),
            "API_AddRecord" => self.add_record(dbid, user, request),
            "API_EditRecord" => self.edit_record(dbid, user, request),
            "API_DeleteRecord" => self.delete_record(dbid, request),
            "API_PurgeRecords" => self.purge_records(dbid, request),
            "API_GetRecordInfo" => self.get_record_info(dbid, request),
            "API_DoQuery" => self.do_query(dbid, request),
            "API_GetNumRecords" => {
                let count = self.table(dbid)?.records.len();
                xml(Xml::new().leaf("num_records", count.to_string()))
            }
            "API_ChangeRecordOwner" => self.change_record_owner(dbid, user, request),
            "API_ChangePermission" => self.change_permission(dbid, user, request),
            "API_GetRecordAsHTML" => self.record_as_html(dbid, request),
            "API_GenResultsTable" => self.results_table(dbid, request),
            "API_GenAddRecordForm" => self.add_record_form(dbid, request),
            "API_AddReplaceDBPage" => self.add_replace_page(dbid, request),
            "API_GetDBPage" => {
                let table = self.table(dbid)?;
                let index = table.page(request).ok_or_else(|| Fault::new(81, "Page not found"))?;
                Ok(Payload::Document {
                    content_type: "text/html",
                    body: table.pages[index].body.clone(),
                })
            }
            "API_ImportFromCSV" => self.import_from_csv(dbid, user, request),
            other => Err(Fault::new(5, "Unimplemented operation").detail(other.to_string())),
        }
    }

    fn get_db_info(&self, dbid: &str) -> Outcome {
        let table = self.table(dbid)?;
        xml(Xml::new()
            .leaf("dbname", self.full_name(table))
            .leaf("lastRecModTime", table.last_mod.to_string())
            .leaf("numRecords", table.records.len().to_string())
            .leaf("mgrID", &table.manager)
            .leaf("mgrName", self.user_name(&table.manager))
            .leaf("version", "2.0"))
    }

    fn get_schema(&self, dbid: &str) -> Outcome {
        let table = self.table(dbid)?;
        let mut out = Xml::new();
        out.open("table", &[]);
        out.push_leaf("name", &[], &table.name);
        out.push_leaf("desc", &[], &table.description);
        out.open("variables", &[]);
        for (name, value) in &table.variables {
            out.push_leaf("var", &[("name", name.as_str())], value);
        }
        out.close("variables");
        out.open("chdbids", &[]);
        for child in &table.children {
            if let Some(t) = self.tables.get(child) {
                let alias = format!("_dbid_{}", t.name.to_lowercase().replace(' ', "_"));
                out.push_leaf("chdbid", &[("name", alias.as_str())], child);
            }
        }
        out.close("chdbids");
        out.open("queries", &[]);
        for query in &table.queries {
            let id = query.id.to_string();
            out.open("query", &[("id", id.as_str())]);
            out.push_leaf("qyname", &[], &query.name);
            out.close("query");
        }
        out.close("queries");
        out.open("fields", &[]);
        for field in &table.fields {
            let id = field.id.to_string();
            out.open("field", &[("id", id.as_str()), ("field_type", field.field_type.as_str())]);
            out.push_leaf("label", &[], &field.label);
            out.push_leaf("required", &[], if field.required { "1" } else { "0" });
            if !field.choices.is_empty() {
                out.open("choices", &[]);
                for choice in &field.choices {
                    out.push_leaf("choice", &[], choice);
                }
                out.close("choices");
            }
            out.close("field");
        }
        out.close("fields");
        out.close("table");
        xml(out)
    }

    fn clone_database(&mut self, dbid: &str, user: &str, request: &ApiRequest) -> Outcome {
        let name = required(request, "newdbname")?.to_string();
        let description = request.get("newdbdesc").unwrap_or_default().to_string();
        let keep_data = request.flag("keepData");
        let now = self.now();

        let mut copy = self.table(dbid)?.clone();
        copy.name = name;
        copy.description = description;
        copy.parent = None;
        copy.children.clear();
        copy.manager = user.to_string();
        copy.last_mod = now;
        if !keep_data {
            copy.records.clear();
        }

        let new_id = new_dbid();
        self.tables.insert(new_id.clone(), copy);
        xml(Xml::new().leaf("newdbid", new_id))
    }

    fn delete_database(&mut self, dbid: &str, user: &str) -> Outcome {
        if !self.is_manager(dbid, user) {
            return Err(Fault::new(3, "Insufficient permissions").detail("only the manager can delete"));
        }
        let table = self
            .tables
            .remove(dbid)
            .ok_or_else(|| Fault::new(32, "No such database"))?;
        for child in &table.children {
            self.tables.remove(child);
        }
        if let Some(parent) = table.parent.as_deref().and_then(|p| self.tables.get_mut(p)) {
            parent.children.retain(|c| c != dbid);
        }
        xml(Xml::new())
    }

    fn add_field(&mut self, dbid: &str, request: &ApiRequest) -> Outcome {
        let label = required(request, "label")?.to_string();
        let field_type = required(request, "type")?.trim().to_string();
        if label.trim().is_empty() || field_type.is_empty() {
            return Err(Fault::new(2, "Invalid input").detail("label and type are required"));
        }
        let table = self.table_mut(dbid)?;
        let fid = table.add_field(&label, &field_type);
        xml(Xml::new().leaf("fid", fid.to_string()).leaf("label", label))
    }

    fn delete_field(&mut self, dbid: &str, request: &ApiRequest) -> Outcome {
        let fid = parse_value::<u32>("fid", required(request, "fid")?)?;
        let table = self.table_mut(dbid)?;
        if table.field(fid)?.is_builtin() {
            return Err(Fault::new(2, "Invalid input").detail("built-in fields cannot be deleted"));
        }
        table.fields.retain(|f| f.id != fid);
        for record in table.records.values_mut() {
            record.values.remove(&fid);
        }
        xml(Xml::new())
    }

    fn set_field_properties(&mut self, dbid: &str, request: &ApiRequest) -> Outcome {
        let fid = parse_value::<u32>("fid", required(request, "fid")?)?;
        let table = self.table_mut(dbid)?;
        let field = table.field_mut(fid)?;
        for param in &request.params {
            match param.name.as_str() {
                "label" => field.label = param.value.clone(),
                "required" => field.required = matches!(param.value.trim(), "1" | "true"),
                _ => {}
            }
        }
        xml(Xml::new().leaf("fid", fid.to_string()))
    }

    fn change_choices(&mut self, dbid: &str, request: &ApiRequest, add: bool) -> Outcome {
        let fid = parse_value::<u32>("fid", required(request, "fid")?)?;
        let table = self.table_mut(dbid)?;
        let field = table.field_mut(fid)?;
        if !field.supports_choices() {
            return Err(Fault::new(10, "Invalid field type")
                .detail(format!("{} fields have no choices", field.field_type)));
        }
        let mut changed = 0u32;
        for choice in request.all("choice") {
            let present = field.choices.iter().position(|c| *c == choice.value);
            match (add, present) {
                (true, None) => {
                    field.choices.push(choice.value.clone());
                    changed += 1;
                }
                (false, Some(index)) => {
                    field.choices.remove(index);
                    changed += 1;
                }
                _ => {}
            }
        }
        let count = if add { "numadded" } else { "numremoved" };
        xml(Xml::new()
            .leaf("fid", fid.to_string())
            .leaf("fname", &field.label)
            .leaf(count, changed.to_string()))
    }

    fn add_record(&mut self, dbid: &str, user: &str, request: &ApiRequest) -> Outcome {
        let now = self.now();
        let table = self.table_mut(dbid)?;
        let values = table.submitted_values(request)?;
        if let Some(missing) = table
            .user_fields()
            .find(|f| f.required && !values.iter().any(|(fid, v)| *fid == f.id && !v.is_empty()))
        {
            return Err(Fault::new(51, "Missing required value").detail(missing.label.clone()));
        }
        let (rid, update_id) = table.insert_record(user, now, values);
        xml(Xml::new()
            .leaf("rid", rid.to_string())
            .leaf("update_id", update_id.to_string()))
    }

    fn edit_record(&mut self, dbid: &str, user: &str, request: &ApiRequest) -> Outcome {
        let rid = parse_value::<u64>("rid", required(request, "rid")?)?;
        let now = self.now();
        let table = self.table_mut(dbid)?;
        let values = table.submitted_values(request)?;
        let current = table.record(rid)?.update_id;
        if let Some(expected) = request.get("update_id") {
            if expected.trim() != current.to_string() {
                return Err(Fault::new(60, "Update conflict detected")
                    .detail(format!("record {rid} is at update {current}")));
            }
        }
        let record = table
            .records
            .get_mut(&rid)
            .ok_or_else(|| Fault::new(30, "No such record"))?;
        let mut changed = 0u32;
        for (fid, value) in values {
            if record.values.get(&fid) != Some(&value) {
                record.values.insert(fid, value);
                changed += 1;
            }
        }
        record.modified = now;
        record.modified_by = user.to_string();
        record.update_id = now;
        table.last_mod = now;
        xml(Xml::new()
            .leaf("rid", rid.to_string())
            .leaf("num_fields_changed", changed.to_string())
            .leaf("update_id", now.to_string()))
    }

    fn delete_record(&mut self, dbid: &str, request: &ApiRequest) -> Outcome {
        let rid = parse_value::<u64>("rid", required(request, "rid")?)?;
        let now = self.now();
        let table = self.table_mut(dbid)?;
        table
            .records
            .remove(&rid)
            .ok_or_else(|| Fault::new(30, "No such record"))?;
        table.last_mod = now;
        xml(Xml::new().leaf("rid", rid.to_string()))
    }

    fn purge_records(&mut self, dbid: &str, request: &ApiRequest) -> Outcome {
        let now = self.now();
        let table = self.table_mut(dbid)?;
        let doomed = table.select(request)?;
        for rid in &doomed {
            table.records.remove(rid);
        }
        if !doomed.is_empty() {
            table.last_mod = now;
        }
        xml(Xml::new().leaf("num_records_deleted", doomed.len().to_string()))
    }

    fn get_record_info(&self, dbid: &str, request: &ApiRequest) -> Outcome {
        let rid = parse_value::<u64>("rid", required(request, "rid")?)?;
        let table = self.table(dbid)?;
        let record = table.record(rid)?;
        let mut out = Xml::new()
            .leaf("rid", rid.to_string())
            .leaf("num_fields", table.fields.len().to_string())
            .leaf("update_id", record.update_id.to_string());
        for field in &table.fields {
            out.open("field", &[]);
            out.push_leaf("fid", &[], &field.id.to_string());
            out.push_leaf("name", &[], &field.label);
            out.push_leaf("type", &[], &field.field_type);
            out.push_leaf("value", &[], &table.value(rid, record, field.id));
            out.close("field");
        }
        xml(out)
    }

    fn do_query(&self, dbid: &str, request: &ApiRequest) -> Outcome {
        let table = self.table(dbid)?;
        let rids = table.select(request)?;
        let columns = table.columns(request)?;
        let include_rids = request.flag("includeRids");

        let mut out = Xml::new();
        out.open("table", &[]);
        out.push_leaf("name", &[], &table.name);
        out.open("records", &[]);
        for rid in rids {
            let record = table.record(rid)?;
            let rid_text = rid.to_string();
            let update_text = record.update_id.to_string();
            if include_rids {
                out.open("record", &[("rid", rid_text.as_str()), ("update_id", update_text.as_str())]);
            } else {
                out.open("record", &[]);
            }
            for fid in &columns {
                let id = fid.to_string();
                out.push_leaf("f", &[("id", id.as_str())], &table.value(rid, record, *fid));
            }
            out.close("record");
        }
        out.close("records");
        out.close("table");
        xml(out)
    }

    fn change_record_owner(&mut self, dbid: &str, user: &str, request: &ApiRequest) -> Outcome {
        let rid = parse_value::<u64>("rid", required(request, "rid")?)?;
        let new_owner = self.user_named(required(request, "newowner")?)?.id.clone();
        let is_manager = self.is_manager(dbid, user);
        let now = self.now();
        let table = self.table_mut(dbid)?;
        let record = table
            .records
            .get_mut(&rid)
            .ok_or_else(|| Fault::new(30, "No such record"))?;
        if record.owner != user && !is_manager {
            return Err(Fault::new(3, "Insufficient permissions").detail("only the owner or manager can reassign"));
        }
        record.owner = new_owner;
        record.modified = now;
        record.modified_by = user.to_string();
        record.update_id = now;
        xml(Xml::new())
    }

    fn change_permission(&mut self, dbid: &str, user: &str, request: &ApiRequest) -> Outcome {
        if !self.is_manager(dbid, user) {
            return Err(Fault::new(3, "Insufficient permissions").detail("only the manager can change permissions"));
        }
        let uname = required(request, "uname")?.to_string();
        let principal = self.user_named(&uname)?.id.clone();
        let table = self.table_mut(dbid)?;
        let mut grant = table.grants.get(&principal).cloned().unwrap_or_default();
        for (name, slot, allowed) in [
            ("view", &mut grant.view, ACCESS_LEVELS),
            ("modify", &mut grant.modify, ACCESS_LEVELS),
            ("create", &mut grant.create, BOOLEANS),
            ("delete", &mut grant.delete, ACCESS_LEVELS),
            ("saveviews", &mut grant.saveviews, BOOLEANS),
            ("admin", &mut grant.admin, BOOLEANS),
        ] {
            if let Some(value) = request.get(name) {
                let value = value.trim();
                if !allowed.contains(&value) {
                    return Err(Fault::new(2, "Invalid input").detail(format!("{name}={value}")));
                }
                *slot = value.to_string();
            }
        }
        table.grants.insert(principal, grant.clone());
        xml(Xml::new()
            .leaf("uname", uname)
            .leaf("view", grant.view)
            .leaf("modify", grant.modify)
            .leaf("create", grant.create)
            .leaf("delete", grant.delete)
            .leaf("saveviews", grant.saveviews)
            .leaf("admin", grant.admin))
    }

    // -----------------------------------------------------------------------
    // Rendered documents
    // -----------------------------------------------------------------------

    fn record_as_html(&self, dbid: &str, request: &ApiRequest) -> Outcome {
        let rid = parse_value::<u64>("rid", required(request, "rid")?)?;
        let table = self.table(dbid)?;
        let record = table.record(rid)?;
        let mut body = String::from("<html><body><table class=\"record\">");
        for field in table.user_fields() {
            body.push_str(&format!(
                "<tr><th>{}</th><td>{}</td></tr>",
                escape_html(&field.label),
                escape_html(&table.value(rid, record, field.id))
            ));
        }
        body.push_str("</table></body></html>");
        Ok(Payload::Document {
            content_type: "text/html",
            body,
        })
    }

    fn results_table(&self, dbid: &str, request: &ApiRequest) -> Outcome {
        let table = self.table(dbid)?;
        let rids = table.select(request)?;
        let columns = table.columns(request)?;
        let labels: Vec<String> = columns
            .iter()
            .map(|fid| table.field(*fid).map(|f| f.label.clone()))
            .collect::<Result<_, _>>()?;
        let rows: Vec<Vec<String>> = rids
            .iter()
            .map(|rid| {
                let record = &table.records[rid];
                columns.iter().map(|fid| table.value(*rid, record, *fid)).collect()
            })
            .collect();

        let options: Vec<&str> = request.get("options").unwrap_or_default().split('.').collect();
        if options.contains(&"csv") {
            let mut body = String::new();
            for row in std::iter::once(&labels).chain(rows.iter()) {
                let cells: Vec<String> = row.iter().map(|c| format!("\"{}\"", c.replace('"', "\"\""))).collect();
                body.push_str(&cells.join(","));
                body.push_str("\r\n");
            }
            return Ok(Payload::Document {
                content_type: "text/csv",
                body,
            });
        }
        if options.contains(&"tsv") {
            let mut body = String::new();
            for row in std::iter::once(&labels).chain(rows.iter()) {
                body.push_str(&row.join("\t"));
                body.push_str("\r\n");
            }
            return Ok(Payload::Document {
                content_type: "text/tab-separated-values",
                body,
            });
        }

        let mut html = String::from("<table><tr>");
        for label in &labels {
            html.push_str(&format!("<th>{}</th>", escape_html(label)));
        }
        html.push_str("</tr>");
        for row in &rows {
            html.push_str("<tr>");
            for cell in row {
                html.push_str(&format!("<td>{}</td>", escape_html(cell)));
            }
            html.push_str("</tr>");
        }
        html.push_str("</table>");

        if request.get("jht").map(str::trim) == Some("1") {
            return Ok(Payload::Document {
                content_type: "application/javascript",
                body: format!("document.write('{}');\n", html.replace('\'', "\\'")),
            });
        }
        Ok(Payload::Document {
            content_type: "text/html",
            body: format!("<html><body>{html}</body></html>"),
        })
    }

    fn add_record_form(&self, dbid: &str, request: &ApiRequest) -> Outcome {
        let table = self.table(dbid)?;
        let defaults: HashMap<u32, String> = table.submitted_values(request)?.into_iter().collect();
        let mut body = format!(
            "<html><body><form method=\"POST\" action=\"/db/{dbid}?act=API_AddRecord\"><h1>{}</h1>",
            escape_html(&table.name)
        );
        for field in table.user_fields() {
            let value = defaults.get(&field.id).map(String::as_str).unwrap_or_default();
            body.push_str(&format!("<label for=\"_fid_{0}\">{1}</label>", field.id, escape_html(&field.label)));
            if field.choices.is_empty() {
                body.push_str(&format!(
                    "<input type=\"text\" name=\"_fid_{}\" value=\"{}\"/>",
                    field.id,
                    escape_html(value)
                ));
            } else {
                body.push_str(&format!("<select name=\"_fid_{}\">", field.id));
                for choice in &field.choices {
                    let selected = if choice == value { " selected" } else { "" };
                    body.push_str(&format!("<option{selected}>{}</option>", escape_html(choice)));
                }
                body.push_str("</select>");
            }
        }
        body.push_str("<input type=\"submit\" value=\"Save\"/></form></body></html>");
        Ok(Payload::Document {
            content_type: "text/html",
            body,
        })
    }

    fn add_replace_page(&mut self, dbid: &str, request: &ApiRequest) -> Outcome {
        let body = required(request, "pagebody")?.to_string();
        let table = self.table_mut(dbid)?;
        let page_id = match (table.page(request), request.get("pageid"), request.get("pagename")) {
            (Some(index), _, _) => {
                table.pages[index].body = body;
                table.pages[index].id
            }
            (None, Some(_), _) => return Err(Fault::new(81, "Page not found")),
            (None, None, Some(name)) => {
                let id = table.next_page;
                table.next_page += 1;
                table.pages.push(Page {
                    id,
                    name: name.to_string(),
                    body,
                });
                id
            }
            (None, None, None) => {
                return Err(Fault::new(2, "Invalid input").detail("pageid or pagename is required"))
            }
        };
        xml(Xml::new().leaf("pageID", page_id.to_string()))
    }

    fn import_from_csv(&mut self, dbid: &str, user: &str, request: &ApiRequest) -> Outcome {
        let csv = required(request, "records_csv")?.to_string();
        let clist = parse_fids(required(request, "clist")?)?;
        let skip_first = request.flag("skipfirst");
        let now = self.now();
        let table = self.table_mut(dbid)?;
        for fid in &clist {
            table.field(*fid)?;
        }
        let key_column = clist.iter().position(|fid| *fid == RECORD_ID_FID);

        let rows: Vec<&str> = split_csv_rows(&csv).into_iter().skip(usize::from(skip_first)).collect();

        let (mut added, mut updated) = (0u64, 0u64);
        let mut out = Xml::new();
        out.open("rids", &[]);
        for row in &rows {
            let cells = split_csv_row(row);
            let values: Vec<(u32, String)> = clist
                .iter()
                .zip(cells.iter().chain(std::iter::repeat(&String::new())))
                .filter(|(fid, _)| **fid > LAST_BUILTIN_FID)
                .map(|(fid, cell)| (*fid, cell.clone()))
                .collect();
            let key = key_column
                .and_then(|i| cells.get(i))
                .and_then(|k| k.trim().parse::<u64>().ok());

            let (rid, update_id) = match key {
                Some(rid) => match table.records.get_mut(&rid) {
                    Some(record) => {
                        record.values.extend(values);
                        record.modified = now;
                        record.modified_by = user.to_string();
                        record.update_id = now;
                        updated += 1;
                        (rid, now)
                    }
                    None => continue,
                },
                None => {
                    added += 1;
                    table.insert_record(user, now, values)
                }
            };
            out.push_leaf("rid", &[("update_id", update_id.to_string().as_str())], &rid.to_string());
        }
        out.close("rids");
        table.last_mod = now;

        let mut head = Xml::new()
            .leaf("num_recs_input", rows.len().to_string())
            .leaf("num_recs_added", added.to_string())
            .leaf("num_recs_updated", updated.to_string());
        head.push_fragment(&out.into_string().map_err(unencodable)?);
        xml(head)
    }
}

const ACCESS_LEVELS: &[&str] = &["none", "owner", "group", "any"];
const BOOLEANS: &[&str] = &["true", "false"];

fn xml(out: Xml) -> Outcome {
    out.into_string().map(Payload::Xml).map_err(unencodable)
}

fn unencodable(error: String) -> Fault {
    Fault::new(1, "Unknown error").detail(format!("cannot encode reply: {error}"))
}

fn new_dbid() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("bq{}", &id[..8])
}

fn required<'a>(request: &'a ApiRequest, name: &str) -> Result<&'a str, Fault> {
    request
        .get(name)
        .ok_or_else(|| Fault::new(2, "Invalid input").detail(format!("missing parameter {name}")))
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T, Fault> {
    raw.trim()
        .parse()
        .map_err(|_| Fault::new(2, "Invalid input").detail(format!("bad {name} {raw:?}")))
}

fn parse_fids(list: &str) -> Result<Vec<u32>, Fault> {
    list.split('.')
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_value::<u32>("field id", s))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Join {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Condition {
    fid: u32,
    op: String,
    value: String,
}

/// Parse `{'6'.EX.'v'}AND{'7'.CT.'x'}`. Clauses combine left to right.
fn parse_filter(filter: &str) -> Result<Vec<(Join, Condition)>, Fault> {
    let bad = || Fault::new(2, "Invalid input").detail(format!("bad query {filter:?}"));
    let mut conditions = Vec::new();
    let mut rest = filter.trim();
    let mut join = Join::And;
    while !rest.is_empty() {
        let inner = rest.strip_prefix('{').ok_or_else(bad)?;
        let end = inner.find('}').ok_or_else(bad)?;
        let mut parts = inner[..end].splitn(3, '.');
        let (fid, op, value) = match (parts.next(), parts.next(), parts.next()) {
            (Some(fid), Some(op), Some(value)) => (fid, op, value),
            _ => return Err(bad()),
        };
        conditions.push((
            join,
            Condition {
                fid: parse_value(fid, unquote(fid))?,
                op: op.trim().to_ascii_uppercase(),
                value: unquote(value).to_string(),
            },
        ));
        rest = inner[end + 1..].trim_start();
        if rest.is_empty() {
            break;
        }
        let upper = rest.to_ascii_uppercase();
        if upper.starts_with("AND") {
            join = Join::And;
            rest = rest[3..].trim_start();
        } else if upper.starts_with("OR") {
            join = Join::Or;
            rest = rest[2..].trim_start();
        } else {
            return Err(bad());
        }
    }
    for (_, condition) in &conditions {
        if !matches!(
            condition.op.as_str(),
            "EX" | "XEX" | "CT" | "XCT" | "SW" | "XSW" | "LT" | "LTE" | "GT" | "GTE"
        ) {
            return Err(Fault::new(2, "Invalid input").detail(format!("unknown operator {}", condition.op)));
        }
    }
    Ok(conditions)
}

fn unquote(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .unwrap_or(raw)
}

fn matches_filter(conditions: &[(Join, Condition)], value_of: impl Fn(u32) -> String) -> bool {
    conditions.iter().fold(true, |acc, (join, condition)| {
        let hit = matches_condition(condition, &value_of(condition.fid));
        match join {
            Join::And => acc && hit,
            Join::Or => acc || hit,
        }
    })
}

fn matches_condition(condition: &Condition, actual: &str) -> bool {
    let (actual_lower, wanted_lower) = (actual.to_lowercase(), condition.value.to_lowercase());
    let ordering = compare_values(actual, &condition.value);
    match condition.op.as_str() {
        "EX" => actual_lower == wanted_lower,
        "XEX" => actual_lower != wanted_lower,
        "CT" => actual_lower.contains(&wanted_lower),
        "XCT" => !actual_lower.contains(&wanted_lower),
        "SW" => actual_lower.starts_with(&wanted_lower),
        "XSW" => !actual_lower.starts_with(&wanted_lower),
        "LT" => ordering.is_lt(),
        "LTE" => ordering.is_le(),
        "GT" => ordering.is_gt(),
        "GTE" => ordering.is_ge(),
        _ => false,
    }
}

/// Numeric when both sides parse as numbers, textual otherwise.
fn compare_values(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Split a CSV payload into non-blank rows. A line break inside a quoted
/// cell does not end the row.
fn split_csv_rows(csv: &str) -> Vec<&str> {
    let mut rows = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in csv.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '\n' if !quoted => {
                rows.push(csv[start..i].trim_end_matches('\r'));
                start = i + 1;
            }
            _ => {}
        }
    }
    rows.push(csv[start..].trim_end_matches('\r'));
    rows.retain(|row| !row.trim().is_empty());
    rows
}

/// Split one CSV row, honouring double-quoted cells.
fn split_csv_row(row: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = row.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => cells.push(std::mem::take(&mut cell)),
            c => cell.push(c),
        }
    }
    cells.push(cell);
    cells
}
