//! Wire-level request builder.
//!
//! An `ApiCall` is one qdbapi action aimed at one database endpoint with an
//! ordered list of parameters. It renders to an XML document of the form
//! `<qdbapi><ticket/><udata/>...params</qdbapi>` and is POSTed with the
//! action name in the `QUICKBASE-ACTION` header. Parameter order is kept
//! exactly as added because the service matches some parameters
//! positionally.

use std::fmt;

use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::{Error, Result};
use crate::http::{HttpMethod, HttpRequest};
use crate::xml;

/// Database id of the service-wide endpoint.
pub const MAIN_DBID: &str = "main";

/// qdbapi actions understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Authenticate,
    SignOut,
    FindDbByName,
    GrantedDbs,
    GetDbInfo,
    GetSchema,
    DoQuery,
    GetNumRecords,
    CreateDatabase,
    CloneDatabase,
    DeleteDatabase,
    AddField,
    DeleteField,
    SetFieldProperties,
    FieldAddChoices,
    FieldRemoveChoices,
    AddRecord,
    EditRecord,
    DeleteRecord,
    PurgeRecords,
    GetRecordInfo,
    ChangeRecordOwner,
    ChangePermission,
    GetRecordAsHtml,
    GenResultsTable,
    GenAddRecordForm,
    AddReplaceDbPage,
    GetDbPage,
    ImportFromCsv,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Authenticate => "API_Authenticate",
            Action::SignOut => "API_SignOut",
            Action::FindDbByName => "API_FindDBByName",
            Action::GrantedDbs => "API_GrantedDBs",
            Action::GetDbInfo => "API_GetDBInfo",
            Action::GetSchema => "API_GetSchema",
            Action::DoQuery => "API_DoQuery",
            Action::GetNumRecords => "API_GetNumRecords",
            Action::CreateDatabase => "API_CreateDatabase",
            Action::CloneDatabase => "API_CloneDatabase",
            Action::DeleteDatabase => "API_DeleteDatabase",
            Action::AddField => "API_AddField",
            Action::DeleteField => "API_DeleteField",
            Action::SetFieldProperties => "API_SetFieldProperties",
            Action::FieldAddChoices => "API_FieldAddChoices",
            Action::FieldRemoveChoices => "API_FieldRemoveChoices",
            Action::AddRecord => "API_AddRecord",
            Action::EditRecord => "API_EditRecord",
            Action::DeleteRecord => "API_DeleteRecord",
            Action::PurgeRecords => "API_PurgeRecords",
            Action::GetRecordInfo => "API_GetRecordInfo",
            Action::ChangeRecordOwner => "API_ChangeRecordOwner",
            Action::ChangePermission => "API_ChangePermission",
            Action::GetRecordAsHtml => "API_GetRecordAsHTML",
            Action::GenResultsTable => "API_GenResultsTable",
            Action::GenAddRecordForm => "API_GenAddRecordForm",
            Action::AddReplaceDbPage => "API_AddReplaceDBPage",
            Action::GetDbPage => "API_GetDBPage",
            Action::ImportFromCsv => "API_ImportFromCSV",
        }
    }

    /// Credentials travel in the body of this action, so it must never be
    /// logged verbatim.
    pub fn carries_secret(self) -> bool {
        matches!(self, Action::Authenticate)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of a single parameter element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Text(String),
    CData(String),
}

/// One `<name attr="...">value</name>` element in the request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub value: ParamValue,
}

impl Param {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            value: ParamValue::Text(value.into()),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    fn write_to(&self, writer: &mut Writer<Vec<u8>>) -> Result<()> {
        let start = BytesStart::new(self.name.as_str())
            .with_attributes(self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        write(writer, Event::Start(start))?;
        match &self.value {
            ParamValue::Text(text) => write(writer, Event::Text(BytesText::new(text)))?,
            ParamValue::CData(raw) => {
                for section in xml::cdata_sections(raw) {
                    write(writer, Event::CData(BytesCData::new(section)))?;
                }
            }
        }
        write(writer, Event::End(BytesEnd::new(self.name.as_str())))
    }
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| Error::InvalidRequest(format!("cannot encode request body: {e}")))
}

/// A single qdbapi call, not yet bound to a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    url: String,
    dbid: String,
    action: Action,
    params: Vec<Param>,
}

impl ApiCall {
    pub fn new(base_url: &str, dbid: &str, action: Action) -> Self {
        Self {
            url: format!("{base_url}/db/{dbid}"),
            dbid: dbid.to_string(),
            action,
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.push(Param::text(name, value));
        self
    }

    pub fn param_opt(self, name: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.param(name, value),
            None => self,
        }
    }

    /// Boolean flag encoded as `1` / `0`.
    pub fn flag(self, name: &str, value: bool) -> Self {
        self.param(name, if value { "1" } else { "0" })
    }

    pub fn cdata(mut self, name: &str, raw: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.to_string(),
            attributes: Vec::new(),
            value: ParamValue::CData(raw.into()),
        });
        self
    }

    pub fn element(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn dbid(&self) -> &str {
        &self.dbid
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// First text value of the parameter called `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|p| p.name == name).map(|p| match &p.value {
            ParamValue::Text(v) | ParamValue::CData(v) => v.as_str(),
        })
    }

    /// Render the request body. The ticket and user data lead the document.
    pub fn to_xml(&self, ticket: Option<&str>, udata: Option<&str>) -> Result<String> {
        let mut writer = Writer::new(Vec::new());
        write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        write(&mut writer, Event::Start(BytesStart::new("qdbapi")))?;
        if let Some(ticket) = ticket {
            Param::text("ticket", ticket).write_to(&mut writer)?;
        }
        if let Some(udata) = udata {
            Param::text("udata", udata).write_to(&mut writer)?;
        }
        for param in &self.params {
            param.write_to(&mut writer)?;
        }
        write(&mut writer, Event::End(BytesEnd::new("qdbapi")))?;
        String::from_utf8(writer.into_inner())
            .map_err(|e| Error::InvalidRequest(format!("request body is not UTF-8: {e}")))
    }

    pub fn into_http(self, ticket: Option<&str>, udata: Option<&str>) -> Result<HttpRequest> {
        let body = self.to_xml(ticket, udata)?;
        Ok(HttpRequest {
            method: HttpMethod::Post,
            url: self.url,
            headers: vec![
                ("content-type".to_string(), "application/xml".to_string()),
                ("QUICKBASE-ACTION".to_string(), self.action.as_str().to_string()),
            ],
            body: Some(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_ticket_udata_then_params_in_order() {
        let call = ApiCall::new("https://example.test", "bq2xk9ab", Action::EditRecord)
            .param("rid", "7")
            .param("update_id", "12")
            .element(Param::text("field", "b").with_attr("fid", "8"))
            .element(Param::text("field", "a").with_attr("fid", "6"));
        let xml = call.to_xml(Some("T1"), Some("corr")).unwrap();
        assert_eq!(
            xml,
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?><qdbapi>"#,
                "<ticket>T1</ticket><udata>corr</udata>",
                "<rid>7</rid><update_id>12</update_id>",
                r#"<field fid="8">b</field><field fid="6">a</field>"#,
                "</qdbapi>"
            )
        );
    }

    #[test]
    fn escapes_text_and_attributes() {
        let call = ApiCall::new("http://h", "x", Action::AddRecord)
            .element(Param::text("field", "a < b & c").with_attr("name", "Q&A"));
        let xml = call.to_xml(None, None).unwrap();
        assert!(xml.contains(r#"<field name="Q&amp;A">a &lt; b &amp; c</field>"#));
        assert!(!xml.contains("<ticket>"));
    }

    #[test]
    fn attribute_values_cannot_break_out_of_quotes() {
        let call = ApiCall::new("http://h", "x", Action::AddRecord).element(
            Param::text("field", "it's \"quoted\"").with_attr("filename", r#"a" evil="1"><x>.txt"#),
        );
        let xml = call.to_xml(None, None).unwrap();
        assert!(xml.contains(
            r#"<field filename="a&quot; evil=&quot;1&quot;&gt;&lt;x&gt;.txt">it&apos;s &quot;quoted&quot;</field>"#
        ));
        assert!(!xml.contains("<x>"));
    }

    #[test]
    fn empty_value_is_an_explicit_pair() {
        let xml = ApiCall::new("http://h", "x", Action::CreateDatabase)
            .param("dbdesc", "")
            .to_xml(None, None)
            .unwrap();
        assert!(xml.ends_with("<qdbapi><dbdesc></dbdesc></qdbapi>"));
    }

    #[test]
    fn cdata_param_is_not_escaped() {
        let call = ApiCall::new("http://h", "x", Action::ImportFromCsv).cdata("records_csv", "a,\"b&c\"\r\n");
        assert!(call
            .to_xml(None, None)
            .unwrap()
            .contains("<records_csv><![CDATA[a,\"b&c\"\r\n]]></records_csv>"));
        let split = ApiCall::new("http://h", "x", Action::ImportFromCsv).cdata("records_csv", "a]]>b");
        assert!(split
            .to_xml(None, None)
            .unwrap()
            .contains("<records_csv><![CDATA[a]]]]><![CDATA[>b]]></records_csv>"));
        assert_eq!(call.get("records_csv"), Some("a,\"b&c\"\r\n"));
    }

    #[test]
    fn into_http_posts_to_dbid_with_action_header() {
        let req = ApiCall::new("https://example.test", MAIN_DBID, Action::GrantedDbs)
            .into_http(Some("T"), None)
            .unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.url, "https://example.test/db/main");
        assert_eq!(req.header("QUICKBASE-ACTION"), Some("API_GrantedDBs"));
        assert_eq!(req.header("Content-Type"), Some("application/xml"));
    }

    #[test]
    fn optional_and_flag_params() {
        let call = ApiCall::new("http://h", "x", Action::CloneDatabase)
            .param_opt("newdbdesc", None::<String>)
            .param_opt("newdbname", Some("copy"))
            .flag("keepData", false);
        assert_eq!(call.get("newdbdesc"), None);
        assert_eq!(call.get("newdbname"), Some("copy"));
        assert_eq!(call.get("keepData"), Some("0"));
    }

    #[test]
    fn only_authenticate_carries_secret() {
        assert!(Action::Authenticate.carries_secret());
        assert!(!Action::SignOut.carries_secret());
        assert_eq!(Action::GetRecordAsHtml.to_string(), "API_GetRecordAsHTML");
    }
}
