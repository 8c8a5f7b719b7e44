//! Authenticated session over a `Transport`.
//!
//! # Design
//! A `Session` owns the ticket obtained from `API_Authenticate` and binds it
//! to every call built by `QuickBaseClient`. Sign-out happens exactly once per
//! successful sign-in: `sign_out` consumes the session, and `Drop` covers
//! every other exit path (early return, `?`, panic). `with_session` is the
//! scoped form for callers that want the sign-out result reported.
//!
//! Opaque user data (`udata`) is attached to the next call only. Whatever the
//! service echoes back is kept until the next XML reply replaces it.

use std::fmt;

use tracing::{debug, info, trace, warn};

use crate::client::QuickBaseClient;
use crate::config::ClientOptions;
use crate::error::{Error, ErrorCode, Result};
use crate::request::ApiCall;
use crate::response::{check_udata, Response};
use crate::transport::Transport;
use crate::types::{
    AddedField, CreatedDatabase, CsvImport, DatabaseSummary, DbId, DbInfo, EditedRecord, FieldId, FieldProperties,
    FieldType, FieldValues, ImportSummary, PageRef, PageType, Permission, Query, QueryResult, RecordId, RecordInfo,
    RecordRef, ResultsFormat, Schema, Ticket, UpdateId,
};

/// Username and password for `API_Authenticate`.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A signed-in session. Signs out when dropped.
pub struct Session<T: Transport> {
    transport: T,
    client: QuickBaseClient,
    options: ClientOptions,
    username: String,
    ticket: Option<Ticket>,
    user_id: Option<String>,
    app_dbid: Option<DbId>,
    pending_udata: Option<String>,
    last_udata: Option<String>,
    last_error: Option<(ErrorCode, String)>,
}

impl<T: Transport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("base_url", &self.client.base_url())
            .field("username", &self.username)
            .field("ticket", &self.ticket)
            .field("app_dbid", &self.app_dbid)
            .finish()
    }
}

impl<T: Transport> Session<T> {
    /// Authenticate and, when `app_name` is given, resolve it to the active
    /// application. If resolving fails the fresh ticket is signed out before
    /// the error is returned.
    pub fn sign_in(
        transport: T,
        credentials: &Credentials,
        app_name: Option<&str>,
        options: ClientOptions,
    ) -> Result<Self> {
        let client = QuickBaseClient::new(&options.base_url());
        let mut session = Self {
            transport,
            client,
            username: credentials.username.clone(),
            options,
            ticket: None,
            user_id: None,
            app_dbid: None,
            pending_udata: None,
            last_udata: None,
            last_error: None,
        };

        let call = session.client.build_authenticate(
            &credentials.username,
            &credentials.password,
            session.options.ticket_hours,
        );
        let signed_in = session.perform(call, QuickBaseClient::parse_authenticate)?;
        session.ticket = Some(signed_in.ticket);
        session.user_id = signed_in.user_id;
        info!(user = %session.username, "signed in");

        if let Some(name) = app_name {
            // On error the session is dropped here, which signs out.
            let dbid = session.find_db_by_name(name)?;
            debug!(app = name, dbid = %dbid, "application resolved");
            session.app_dbid = Some(dbid);
        }
        Ok(session)
    }

    /// Sign out now and report the outcome.
    pub fn sign_out(mut self) -> Result<()> {
        self.end()
    }

    /// Give up the ticket without signing out. The caller becomes
    /// responsible for it.
    pub fn release(mut self) -> Option<Ticket> {
        self.ticket.take()
    }

    fn end(&mut self) -> Result<()> {
        if self.ticket.is_none() {
            return Ok(());
        }
        let call = self.client.build_sign_out();
        let result = self.perform(call, QuickBaseClient::parse_sign_out);
        self.ticket = None;
        if result.is_ok() {
            info!(user = %self.username, "signed out");
        }
        result
    }

    pub fn client(&self) -> &QuickBaseClient {
        &self.client
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn ticket(&self) -> Option<&Ticket> {
        self.ticket.as_ref()
    }

    /// Application resolved at sign-in, if any.
    pub fn app_dbid(&self) -> Option<&DbId> {
        self.app_dbid.as_ref()
    }

    pub fn set_app_dbid(&mut self, dbid: DbId) {
        self.app_dbid = Some(dbid);
    }

    /// Attach opaque data to the next call only.
    pub fn set_udata(&mut self, value: impl Into<String>) {
        self.pending_udata = Some(value.into());
    }

    /// User data echoed by the most recent XML reply.
    pub fn last_udata(&self) -> Option<&str> {
        self.last_udata.as_deref()
    }

    pub fn verify_udata(&self, expected: &str) -> Result<()> {
        check_udata(expected, self.last_udata())
    }

    /// Code and text of the most recent failed call, cleared by the next
    /// successful one.
    pub fn last_error(&self) -> Option<(ErrorCode, &str)> {
        self.last_error.as_ref().map(|(code, text)| (*code, text.as_str()))
    }

    /// Send an arbitrary call. With `throw_on_error` unset, a reply carrying
    /// an error code is returned as `Ok` and only recorded in `last_error`.
    pub fn execute(&mut self, call: ApiCall) -> Result<Response> {
        let response = self.round_trip(call)?;
        if self.options.throw_on_error {
            response.into_result()
        } else {
            Ok(response)
        }
    }

    fn perform<R>(&mut self, call: ApiCall, parse: impl FnOnce(&QuickBaseClient, Response) -> Result<R>) -> Result<R> {
        let response = self.round_trip(call)?;
        parse(&self.client, response)
    }

    fn round_trip(&mut self, call: ApiCall) -> Result<Response> {
        let action = call.action();
        let udata = self.pending_udata.take();
        debug!(%action, dbid = call.dbid(), "qdbapi call");

        let request = call.into_http(self.ticket.as_ref().map(Ticket::as_str), udata.as_deref())?;
        if self.options.log_traffic {
            if action.carries_secret() {
                info!(url = %request.url, %action, "request body withheld");
            } else {
                info!(url = %request.url, body = request.body.as_deref().unwrap_or_default(), "request");
            }
        }
        if self.options.trace {
            trace!(%action, url = %request.url, "sending");
        }

        let http = self.transport.execute(request)?;
        if self.options.trace {
            trace!(%action, status = http.status, bytes = http.body.len(), "received");
        }
        if self.options.log_traffic && !action.carries_secret() {
            info!(status = http.status, body = %http.body, "response");
        }

        let response = Response::from_http(http)?;
        if !response.is_passthrough() {
            self.last_udata = response.udata().map(str::to_owned);
        }
        if response.is_success() {
            self.last_error = None;
        } else {
            warn!(%action, code = %response.errcode(), errtext = response.errtext(), "API error");
            self.last_error = Some((response.errcode(), response.errtext().to_string()));
        }
        Ok(response)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub fn find_db_by_name(&mut self, name: &str) -> Result<DbId> {
        let call = self.client.build_find_db_by_name(name);
        self.perform(call, QuickBaseClient::parse_find_db_by_name)
    }

    pub fn granted_dbs(&mut self) -> Result<Vec<DatabaseSummary>> {
        let call = self.client.build_granted_dbs();
        self.perform(call, QuickBaseClient::parse_granted_dbs)
    }

    pub fn get_db_info(&mut self, dbid: &DbId) -> Result<DbInfo> {
        let call = self.client.build_get_db_info(dbid);
        self.perform(call, QuickBaseClient::parse_get_db_info)
    }

    pub fn get_schema(&mut self, dbid: &DbId) -> Result<Schema> {
        let call = self.client.build_get_schema(dbid);
        self.perform(call, QuickBaseClient::parse_get_schema)
    }

    pub fn create_database(&mut self, name: &str, description: &str) -> Result<CreatedDatabase> {
        let call = self.client.build_create_database(name, description);
        self.perform(call, QuickBaseClient::parse_create_database)
    }

    pub fn clone_database(&mut self, source: &DbId, name: &str, description: &str, keep_data: bool) -> Result<DbId> {
        let call = self.client.build_clone_database(source, name, description, keep_data);
        self.perform(call, QuickBaseClient::parse_clone_database)
    }

    pub fn delete_database(&mut self, dbid: &DbId) -> Result<()> {
        let call = self.client.build_delete_database(dbid);
        self.perform(call, QuickBaseClient::parse_delete_database)
    }

    pub fn add_field(&mut self, dbid: &DbId, label: &str, field_type: &FieldType) -> Result<AddedField> {
        let call = self.client.build_add_field(dbid, label, field_type);
        self.perform(call, QuickBaseClient::parse_add_field)
    }

    pub fn delete_field(&mut self, dbid: &DbId, fid: FieldId) -> Result<()> {
        let call = self.client.build_delete_field(dbid, fid);
        self.perform(call, QuickBaseClient::parse_delete_field)
    }

    pub fn set_field_properties(&mut self, dbid: &DbId, fid: FieldId, properties: &FieldProperties) -> Result<()> {
        let call = self.client.build_set_field_properties(dbid, fid, properties);
        self.perform(call, QuickBaseClient::parse_set_field_properties)
    }

    pub fn field_add_choices<S: AsRef<str>>(&mut self, dbid: &DbId, fid: FieldId, choices: &[S]) -> Result<u32> {
        let call = self.client.build_field_add_choices(dbid, fid, choices);
        self.perform(call, QuickBaseClient::parse_field_add_choices)
    }

    pub fn field_remove_choices<S: AsRef<str>>(&mut self, dbid: &DbId, fid: FieldId, choices: &[S]) -> Result<u32> {
        let call = self.client.build_field_remove_choices(dbid, fid, choices);
        self.perform(call, QuickBaseClient::parse_field_remove_choices)
    }

    pub fn add_record(&mut self, dbid: &DbId, values: &FieldValues) -> Result<RecordRef> {
        let call = self.client.build_add_record(dbid, values);
        self.perform(call, QuickBaseClient::parse_add_record)
    }

    pub fn edit_record(
        &mut self,
        dbid: &DbId,
        rid: RecordId,
        values: &FieldValues,
        expected_update_id: Option<&UpdateId>,
    ) -> Result<EditedRecord> {
        let call = self.client.build_edit_record(dbid, rid, values, expected_update_id);
        self.perform(call, QuickBaseClient::parse_edit_record)
    }

    pub fn delete_record(&mut self, dbid: &DbId, rid: RecordId) -> Result<()> {
        let call = self.client.build_delete_record(dbid, rid);
        self.perform(call, QuickBaseClient::parse_delete_record)
    }

    pub fn purge_records(&mut self, dbid: &DbId, query: Option<&Query>) -> Result<u64> {
        let call = self.client.build_purge_records(dbid, query);
        self.perform(call, QuickBaseClient::parse_purge_records)
    }

    pub fn get_record_info(&mut self, dbid: &DbId, rid: RecordId) -> Result<RecordInfo> {
        let call = self.client.build_get_record_info(dbid, rid);
        self.perform(call, QuickBaseClient::parse_get_record_info)
    }

    pub fn do_query(&mut self, dbid: &DbId, query: &Query) -> Result<QueryResult> {
        let call = self.client.build_do_query(dbid, query);
        self.perform(call, QuickBaseClient::parse_do_query)
    }

    pub fn get_num_records(&mut self, dbid: &DbId) -> Result<u64> {
        let call = self.client.build_get_num_records(dbid);
        self.perform(call, QuickBaseClient::parse_get_num_records)
    }

    pub fn change_record_owner(&mut self, dbid: &DbId, rid: RecordId, new_owner: &str) -> Result<()> {
        let call = self.client.build_change_record_owner(dbid, rid, new_owner);
        self.perform(call, QuickBaseClient::parse_change_record_owner)
    }

    pub fn change_permission(&mut self, dbid: &DbId, principal: &str, permission: &Permission) -> Result<Permission> {
        let call = self.client.build_change_permission(dbid, principal, permission);
        self.perform(call, QuickBaseClient::parse_change_permission)
    }

    pub fn get_record_as_html(&mut self, dbid: &DbId, rid: RecordId) -> Result<String> {
        let call = self.client.build_get_record_as_html(dbid, rid);
        self.perform(call, QuickBaseClient::parse_get_record_as_html)
    }

    pub fn gen_results_table(&mut self, dbid: &DbId, query: &Query, format: ResultsFormat) -> Result<String> {
        let call = self.client.build_gen_results_table(dbid, query, format);
        self.perform(call, QuickBaseClient::parse_gen_results_table)
    }

    pub fn gen_add_record_form(&mut self, dbid: &DbId, defaults: &FieldValues) -> Result<String> {
        let call = self.client.build_gen_add_record_form(dbid, defaults);
        self.perform(call, QuickBaseClient::parse_gen_add_record_form)
    }

    pub fn add_replace_db_page(&mut self, dbid: &DbId, page: &PageRef, page_type: PageType, body: &str) -> Result<u32> {
        let call = self.client.build_add_replace_db_page(dbid, page, page_type, body);
        self.perform(call, QuickBaseClient::parse_add_replace_db_page)
    }

    pub fn get_db_page(&mut self, dbid: &DbId, page: &PageRef) -> Result<String> {
        let call = self.client.build_get_db_page(dbid, page);
        self.perform(call, QuickBaseClient::parse_get_db_page)
    }

    pub fn import_from_csv(&mut self, dbid: &DbId, import: &CsvImport) -> Result<ImportSummary> {
        let call = self.client.build_import_from_csv(dbid, import);
        self.perform(call, QuickBaseClient::parse_import_from_csv)
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if let Err(e) = self.end() {
            warn!(user = %self.username, error = %e, "implicit sign-out failed");
        }
    }
}

/// Sign in, run `f`, and sign out on every exit path.
///
/// When both `f` and the sign-out fail, `f`'s error is returned and the
/// sign-out error is logged.
pub fn with_session<T, R, E, F>(
    transport: T,
    credentials: &Credentials,
    app_name: Option<&str>,
    options: ClientOptions,
    f: F,
) -> std::result::Result<R, E>
where
    T: Transport,
    E: From<Error>,
    F: FnOnce(&mut Session<T>) -> std::result::Result<R, E>,
{
    let mut session = Session::sign_in(transport, credentials, app_name, options)?;
    let outcome = f(&mut session);
    let signed_out = session.sign_out();
    match (outcome, signed_out) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(sign_out)) => {
            warn!(error = %sign_out, "sign-out after a failed operation also failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::http::{HttpRequest, HttpResponse};
    use crate::request::Action;

    /// Scripted service. Answers by action name and echoes `<udata>`.
    struct FakeService {
        sent: RefCell<Vec<HttpRequest>>,
        fail_app_lookup: bool,
        fail_sign_out: bool,
        reject_auth: bool,
        sign_outs: Cell<usize>,
    }

    impl FakeService {
        fn new() -> Self {
            Self {
                sent: RefCell::new(Vec::new()),
                fail_app_lookup: false,
                fail_sign_out: false,
                reject_auth: false,
                sign_outs: Cell::new(0),
            }
        }

        fn actions(&self) -> Vec<String> {
            self.sent
                .borrow()
                .iter()
                .filter_map(|r| r.header("QUICKBASE-ACTION").map(str::to_owned))
                .collect()
        }

        fn body(&self, index: usize) -> String {
            self.sent.borrow()[index].body.clone().unwrap_or_default()
        }
    }

    fn between<'a>(body: &'a str, open: &str, close: &str) -> Option<&'a str> {
        let start = body.find(open)? + open.len();
        let end = body[start..].find(close)? + start;
        Some(&body[start..end])
    }

    fn envelope(code: u32, udata: Option<&str>, payload: &str) -> HttpResponse {
        let udata = udata.map(|u| format!("<udata>{u}</udata>")).unwrap_or_default();
        HttpResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "text/xml".to_string())],
            body: format!("<qdbapi><errcode>{code}</errcode><errtext>text {code}</errtext>{udata}{payload}</qdbapi>"),
        }
    }

    impl Transport for FakeService {
        fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            let action = request.header("QUICKBASE-ACTION").unwrap_or_default().to_string();
            let body = request.body.clone().unwrap_or_default();
            self.sent.borrow_mut().push(request);
            let udata = between(&body, "<udata>", "</udata>");
            Ok(match action.as_str() {
                "API_Authenticate" if self.reject_auth => envelope(20, udata, ""),
                "API_Authenticate" => envelope(0, udata, "<ticket>T-1</ticket><userid>u.1</userid>"),
                "API_FindDBByName" if self.fail_app_lookup => envelope(32, udata, ""),
                "API_FindDBByName" => envelope(0, udata, "<dbid>app1</dbid>"),
                "API_SignOut" => {
                    self.sign_outs.set(self.sign_outs.get() + 1);
                    if self.fail_sign_out {
                        envelope(1, udata, "")
                    } else {
                        envelope(0, udata, "")
                    }
                }
                "API_EditRecord" => envelope(60, udata, ""),
                "API_GetNumRecords" => envelope(0, udata, "<num_records>3</num_records>"),
                _ => envelope(0, udata, ""),
            })
        }
    }

    fn credentials() -> Credentials {
        Credentials::new("demo@example.com", "s3cret")
    }

    #[test]
    fn sign_in_resolves_app_and_binds_ticket() {
        let fake = FakeService::new();
        let mut session = Session::sign_in(&fake, &credentials(), Some("Demo App"), ClientOptions::default()).unwrap();
        assert_eq!(session.app_dbid(), Some(&DbId::new("app1")));
        assert_eq!(session.user_id(), Some("u.1"));
        assert_eq!(session.get_num_records(&DbId::new("app1")).unwrap(), 3);
        session.sign_out().unwrap();

        assert_eq!(
            fake.actions(),
            vec!["API_Authenticate", "API_FindDBByName", "API_GetNumRecords", "API_SignOut"]
        );
        assert!(!fake.body(0).contains("<ticket>"));
        assert!(fake.body(2).contains("<ticket>T-1</ticket>"));
        assert_eq!(fake.sign_outs.get(), 1);
    }

    #[test]
    fn drop_signs_out_once() {
        let fake = FakeService::new();
        {
            let _session = Session::sign_in(&fake, &credentials(), None, ClientOptions::default()).unwrap();
        }
        assert_eq!(fake.sign_outs.get(), 1);
    }

    #[test]
    fn failed_app_lookup_still_signs_out() {
        let fake = FakeService {
            fail_app_lookup: true,
            ..FakeService::new()
        };
        let err = Session::sign_in(&fake, &credentials(), Some("Missing"), ClientOptions::default()).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(fake.sign_outs.get(), 1);
    }

    #[test]
    fn rejected_credentials_send_no_sign_out() {
        let fake = FakeService {
            reject_auth: true,
            ..FakeService::new()
        };
        let err = Session::sign_in(&fake, &credentials(), None, ClientOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
        assert_eq!(fake.sign_outs.get(), 0);
    }

    #[test]
    fn release_skips_sign_out() {
        let fake = FakeService::new();
        let session = Session::sign_in(&fake, &credentials(), None, ClientOptions::default()).unwrap();
        let ticket = session.release().unwrap();
        assert_eq!(ticket.as_str(), "T-1");
        assert_eq!(fake.sign_outs.get(), 0);
    }

    #[test]
    fn with_session_prefers_closure_error() {
        let fake = FakeService {
            fail_sign_out: true,
            ..FakeService::new()
        };
        let result: Result<()> = with_session(&fake, &credentials(), None, ClientOptions::default(), |s| {
            s.edit_record(&DbId::new("t1"), RecordId(1), &FieldValues::new(), None)
                .map(|_| ())
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(fake.sign_outs.get(), 1);
    }

    #[test]
    fn with_session_reports_sign_out_failure() {
        let fake = FakeService {
            fail_sign_out: true,
            ..FakeService::new()
        };
        let result: Result<u64> = with_session(&fake, &credentials(), None, ClientOptions::default(), |s| {
            s.get_num_records(&DbId::new("t1"))
        });
        assert!(matches!(result, Err(Error::Api { code: ErrorCode::UNKNOWN, .. })));
        assert_eq!(fake.sign_outs.get(), 1);
    }

    #[test]
    fn udata_applies_to_next_call_only() {
        let fake = FakeService::new();
        let mut session = Session::sign_in(&fake, &credentials(), None, ClientOptions::default()).unwrap();
        session.set_udata("corr-42");
        session.change_record_owner(&DbId::new("t1"), RecordId(1), "other").unwrap();
        assert_eq!(session.last_udata(), Some("corr-42"));
        session.verify_udata("corr-42").unwrap();
        assert!(matches!(
            session.verify_udata("something else"),
            Err(Error::Integrity { .. })
        ));

        session.get_num_records(&DbId::new("t1")).unwrap();
        assert_eq!(session.last_udata(), None);
        drop(session);

        assert!(fake.body(1).contains("<udata>corr-42</udata>"));
        assert!(!fake.body(2).contains("<udata>"));
    }

    #[test]
    fn padded_udata_verifies_unchanged() {
        let fake = FakeService::new();
        let mut session = Session::sign_in(&fake, &credentials(), None, ClientOptions::default()).unwrap();
        session.set_udata("  padded  ");
        session.get_num_records(&DbId::new("t1")).unwrap();
        assert_eq!(session.last_udata(), Some("  padded  "));
        session.verify_udata("  padded  ").unwrap();
        assert!(session.verify_udata("padded").is_err());
    }

    #[test]
    fn execute_without_throw_returns_error_state() {
        let fake = FakeService::new();
        let options = ClientOptions {
            throw_on_error: false,
            ..Default::default()
        };
        let mut session = Session::sign_in(&fake, &credentials(), None, options).unwrap();
        let call = session
            .client()
            .build_edit_record(&DbId::new("t1"), RecordId(1), &FieldValues::new(), None);
        let response = session.execute(call).unwrap();
        assert_eq!(response.errcode(), ErrorCode::UPDATE_CONFLICT);
        assert_eq!(session.last_error(), Some((ErrorCode::UPDATE_CONFLICT, "text 60")));

        // Typed operations always surface the error.
        let err = session
            .edit_record(&DbId::new("t1"), RecordId(1), &FieldValues::new(), None)
            .unwrap_err();
        assert!(err.is_conflict());

        session.get_num_records(&DbId::new("t1")).unwrap();
        assert_eq!(session.last_error(), None);
    }

    #[test]
    fn execute_with_throw_fails_on_error_code() {
        let fake = FakeService::new();
        let mut session = Session::sign_in(&fake, &credentials(), None, ClientOptions::default()).unwrap();
        let call = session
            .client()
            .build_edit_record(&DbId::new("t1"), RecordId(1), &FieldValues::new(), None);
        assert!(session.execute(call).unwrap_err().is_conflict());
        assert_eq!(session.last_error().map(|(code, _)| code), Some(ErrorCode::UPDATE_CONFLICT));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let rendered = format!("{:?}", credentials());
        assert!(rendered.contains("demo@example.com"));
        assert!(!rendered.contains("s3cret"));
        assert!(Action::Authenticate.carries_secret());
    }
}
