//! Request decoding and reply encoding for the qdbapi wire format.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// One parameter element from a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireParam {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub value: String,
}

impl WireParam {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// Decoded `<qdbapi>` request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiRequest {
    pub ticket: Option<String>,
    pub udata: Option<String>,
    pub params: Vec<WireParam>,
}

impl ApiRequest {
    pub fn parse(body: &str) -> Result<Self, String> {
        let mut reader = Reader::from_str(body);

        let mut request = ApiRequest::default();
        let mut depth = 0usize;
        let mut current: Option<WireParam> = None;

        loop {
            match reader.read_event().map_err(|e| e.to_string())? {
                Event::Start(start) => {
                    depth += 1;
                    if depth == 1 {
                        if start.name().as_ref() != b"qdbapi" {
                            return Err("root element must be <qdbapi>".to_string());
                        }
                        continue;
                    }
                    if depth == 2 {
                        current = Some(param_from(&start)?);
                    }
                }
                Event::Empty(start) => {
                    if depth == 1 {
                        let param = param_from(&start)?;
                        request.push(param);
                    } else if depth == 0 && start.name().as_ref() != b"qdbapi" {
                        return Err("root element must be <qdbapi>".to_string());
                    }
                }
                Event::Text(text) => {
                    if let Some(param) = current.as_mut() {
                        param.value.push_str(&text.unescape().map_err(|e| e.to_string())?);
                    }
                }
                Event::CData(data) => {
                    if let Some(param) = current.as_mut() {
                        param.value.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::End(_) => {
                    if depth == 2 {
                        if let Some(param) = current.take() {
                            request.push(param);
                        }
                    }
                    depth = depth.saturating_sub(1);
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(request)
    }

    fn push(&mut self, param: WireParam) {
        match param.name.as_str() {
            "ticket" => self.ticket = Some(param.value),
            "udata" => self.udata = Some(param.value),
            _ => self.params.push(param),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|p| p.name == name).map(|p| p.value.as_str())
    }

    pub fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a WireParam> + 'a {
        self.params.iter().filter(move |p| p.name == name)
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(self.get(name).map(str::trim), Some("1" | "true"))
    }
}

fn param_from(start: &quick_xml::events::BytesStart<'_>) -> Result<WireParam, String> {
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        attributes.push((
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            attr.unescape_value().map_err(|e| e.to_string())?.into_owned(),
        ));
    }
    Ok(WireParam {
        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        attributes,
        value: String::new(),
    })
}

/// Incremental writer for reply payloads. The first write error is kept
/// and reported by `into_string`.
pub struct Xml {
    writer: Writer<Vec<u8>>,
    error: Option<String>,
}

impl Default for Xml {
    fn default() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
            error: None,
        }
    }
}

impl Xml {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaf(mut self, name: &str, text: impl AsRef<str>) -> Self {
        self.push_leaf(name, &[], text.as_ref());
        self
    }

    pub fn push_leaf(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) {
        self.open(name, attrs);
        self.write(Event::Text(BytesText::new(text)));
        self.close(name);
    }

    pub fn open(&mut self, name: &str, attrs: &[(&str, &str)]) {
        self.write(Event::Start(BytesStart::new(name).with_attributes(attrs.iter().copied())));
    }

    pub fn close(&mut self, name: &str) {
        self.write(Event::End(BytesEnd::new(name)));
    }

    /// Append a fragment produced by another `Xml`.
    pub fn push_fragment(&mut self, fragment: &str) {
        self.write(Event::Text(BytesText::from_escaped(fragment)));
    }

    fn write(&mut self, event: Event<'_>) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.writer.write_event(event) {
            self.error = Some(e.to_string());
        }
    }

    pub fn into_string(self) -> Result<String, String> {
        if let Some(error) = self.error {
            return Err(error);
        }
        String::from_utf8(self.writer.into_inner()).map_err(|e| e.to_string())
    }
}

/// Wrap a payload in the response envelope.
pub fn envelope(
    action: &str,
    errcode: u32,
    errtext: &str,
    errdetail: Option<&str>,
    udata: Option<&str>,
    payload: &str,
) -> Result<String, String> {
    let mut out = Xml::new();
    out.write(Event::Decl(BytesDecl::new("1.0", None, None)));
    out.write(Event::Text(BytesText::new("\n")));
    out.open("qdbapi", &[]);
    out.push_leaf("action", &[], action);
    out.push_leaf("errcode", &[], &errcode.to_string());
    out.push_leaf("errtext", &[], errtext);
    if let Some(detail) = errdetail {
        out.push_leaf("errdetail", &[], detail);
    }
    if let Some(udata) = udata {
        out.push_leaf("udata", &[], udata);
    }
    out.push_fragment(payload);
    out.close("qdbapi");
    out.into_string()
}

pub fn escape_html(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ticket_udata_and_ordered_params() {
        let request = ApiRequest::parse(
            r#"<?xml version="1.0" encoding="UTF-8"?><qdbapi><ticket>T</ticket><udata>u &amp; v</udata>
               <rid>3</rid><field fid="6">a</field><field name="Status">b</field><keepData>1</keepData></qdbapi>"#,
        )
        .unwrap();
        assert_eq!(request.ticket.as_deref(), Some("T"));
        assert_eq!(request.udata.as_deref(), Some("u & v"));
        assert_eq!(request.get("rid"), Some("3"));
        let fields: Vec<_> = request.all("field").collect();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].attr("fid"), Some("6"));
        assert_eq!(fields[1].attr("name"), Some("Status"));
        assert!(request.flag("keepData"));
    }

    #[test]
    fn cdata_payload_is_kept_verbatim() {
        let request =
            ApiRequest::parse("<qdbapi><records_csv><![CDATA[a,\"b&c\"\r\nd]]></records_csv></qdbapi>").unwrap();
        assert_eq!(request.get("records_csv"), Some("a,\"b&c\"\r\nd"));
    }

    #[test]
    fn empty_param_and_bad_root() {
        let request = ApiRequest::parse("<qdbapi><dbdesc/></qdbapi>").unwrap();
        assert_eq!(request.get("dbdesc"), Some(""));
        assert!(ApiRequest::parse("<other/>").is_err());
        assert!(ApiRequest::parse("<qdbapi><a></qdbapi>").is_err());
    }

    #[test]
    fn envelope_echoes_udata() {
        let body =
            envelope("API_GetNumRecords", 0, "No error", None, Some("x<y"), "<num_records>2</num_records>").unwrap();
        assert!(body.starts_with("<?xml version=\"1.0\"?>\n<qdbapi><action>API_GetNumRecords</action>"));
        assert!(!body.contains("<errdetail>"));
        assert!(body.contains("<udata>x&lt;y</udata>"));
        assert!(body.ends_with("<num_records>2</num_records></qdbapi>"));
    }

    #[test]
    fn padded_values_survive_parsing() {
        let request = ApiRequest::parse(
            "<qdbapi>\n  <udata>  padded  </udata>\n  <field fid=\"6\">  two spaces  </field>\n  <field fid=\"7\"> </field>\n</qdbapi>",
        )
        .unwrap();
        assert_eq!(request.udata.as_deref(), Some("  padded  "));
        let values: Vec<_> = request.all("field").map(|f| f.value.as_str()).collect();
        assert_eq!(values, vec!["  two spaces  ", " "]);
    }

    #[test]
    fn writer_escapes_attributes_and_text() {
        let mut out = Xml::new();
        out.open("record", &[("rid", "1\" x=\"2")]);
        out.push_leaf("f", &[("id", "6")], "<b>&'");
        out.close("record");
        assert_eq!(
            out.into_string().unwrap(),
            r#"<record rid="1&quot; x=&quot;2"><f id="6">&lt;b&gt;&amp;&apos;</f></record>"#
        );
    }
}
