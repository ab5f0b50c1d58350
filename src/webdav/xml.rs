//! Marshaling between WebDAV XML wire formats and typed structures:
//! multistatus (207) parsing, request body construction, lock token
//! extraction.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::reader::Reader;
use std::str;

use crate::errors::WebDavError;

/// Properties of a single resource reported in a multistatus response.
/// Only propstats with a 2xx status contribute property values.
#[derive(Debug, Clone, Default)]
pub struct ResourceProps {
    /// Raw href as sent by the server (still URL-encoded)
    pub href: String,
    pub display_name: Option<String>,
    pub content_length: Option<i64>,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub is_collection: bool,
    /// Status of the response element itself (DELETE/COPY/MOVE multistatus)
    pub status: Option<u16>,
    /// Worst non-2xx propstat status (PROPPATCH rejections land here)
    pub propstat_failure: Option<u16>,
}

impl ResourceProps {
    /// Href with percent-encoding removed.
    pub fn decoded_href(&self) -> String {
        urlencoding::decode(&self.href)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| self.href.clone())
    }

    /// Last path segment of the href, decoded.
    pub fn name(&self) -> String {
        if let Some(name) = &self.display_name {
            if !name.is_empty() {
                return name.clone();
            }
        }
        let decoded = self.decoded_href();
        decoded
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
            .to_string()
    }
}

/// The standard property set requested by every PROPFIND this crate sends.
pub const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
    <D:prop>
        <D:displayname/>
        <D:getcontentlength/>
        <D:getlastmodified/>
        <D:getcontenttype/>
        <D:getetag/>
        <D:resourcetype/>
        <D:creationdate/>
    </D:prop>
</D:propfind>"#;

/// In-flight state for one `<response>` element.
#[derive(Debug, Default)]
struct PendingResponse {
    props: ResourceProps,
    // Properties seen inside the current propstat, merged into `props`
    // only when its status turns out to be 2xx.
    staged: ResourceProps,
    propstat_status: Option<u16>,
}

/// Parses a multistatus document into one `ResourceProps` per response.
pub fn parse_multistatus(xml_text: &str) -> Result<Vec<ResourceProps>, WebDavError> {
    let mut reader = Reader::from_str(xml_text);
    reader.config_mut().trim_text(true);

    let mut resources = Vec::new();
    let mut current: Option<PendingResponse> = None;
    let mut current_element = String::new();
    let mut in_propstat = false;
    let mut in_resourcetype = false;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = local_name(&e)?;

                match name.as_str() {
                    "response" => {
                        current = Some(PendingResponse::default());
                    }
                    "propstat" => {
                        in_propstat = true;
                        if let Some(ref mut resp) = current {
                            resp.staged = ResourceProps::default();
                            resp.propstat_status = None;
                        }
                    }
                    "resourcetype" => {
                        in_resourcetype = true;
                    }
                    "collection" if in_resourcetype => {
                        if let Some(ref mut resp) = current {
                            resp.staged.is_collection = true;
                        }
                    }
                    _ => {
                        current_element = name;
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape()?.to_string();
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }

                if let Some(ref mut resp) = current {
                    match current_element.as_str() {
                        "href" => resp.props.href = text.to_string(),
                        "displayname" => resp.staged.display_name = Some(text.to_string()),
                        "getcontentlength" => resp.staged.content_length = text.parse().ok(),
                        "getlastmodified" => resp.staged.last_modified = parse_http_date(text),
                        "getcontenttype" => resp.staged.content_type = Some(text.to_string()),
                        "getetag" => resp.staged.etag = Some(text.to_string()),
                        "status" => {
                            let status = parse_status_line(text);
                            if in_propstat {
                                resp.propstat_status = status;
                            } else {
                                resp.props.status = status;
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name_end(&e)?;

                match name.as_str() {
                    "response" => {
                        if let Some(resp) = current.take() {
                            if !resp.props.href.is_empty() {
                                resources.push(resp.props);
                            }
                        }
                    }
                    "propstat" => {
                        in_propstat = false;
                        if let Some(ref mut resp) = current {
                            let ok = resp
                                .propstat_status
                                .map(|s| (200..300).contains(&s))
                                .unwrap_or(false);
                            if ok {
                                merge_props(&mut resp.props, std::mem::take(&mut resp.staged));
                            } else if let Some(status) = resp.propstat_status {
                                resp.props.propstat_failure = Some(
                                    resp.props.propstat_failure.map_or(status, |w| w.max(status)),
                                );
                            }
                        }
                    }
                    "resourcetype" => {
                        in_resourcetype = false;
                    }
                    _ => {}
                }

                current_element.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(WebDavError::Xml(e)),
            _ => {}
        }

        buf.clear();
    }

    Ok(resources)
}

fn merge_props(into: &mut ResourceProps, staged: ResourceProps) {
    if staged.display_name.is_some() {
        into.display_name = staged.display_name;
    }
    if staged.content_length.is_some() {
        into.content_length = staged.content_length;
    }
    if staged.content_type.is_some() {
        into.content_type = staged.content_type;
    }
    if staged.last_modified.is_some() {
        into.last_modified = staged.last_modified;
    }
    if staged.etag.is_some() {
        into.etag = staged.etag;
    }
    if staged.is_collection {
        into.is_collection = true;
    }
}

/// Builds a PROPPATCH body setting and removing dead properties in the
/// `DAV:` namespace.
pub fn proppatch_body(set: &[(&str, &str)], remove: &[&str]) -> String {
    let mut body = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<D:propertyupdate xmlns:D=\"DAV:\">",
    );

    if !set.is_empty() {
        body.push_str("<D:set><D:prop>");
        for (name, value) in set {
            body.push_str(&format!(
                "<D:{name}>{}</D:{name}>",
                quick_xml::escape::escape(*value)
            ));
        }
        body.push_str("</D:prop></D:set>");
    }

    if !remove.is_empty() {
        body.push_str("<D:remove><D:prop>");
        for name in remove {
            body.push_str(&format!("<D:{name}/>"));
        }
        body.push_str("</D:prop></D:remove>");
    }

    body.push_str("</D:propertyupdate>");
    body
}

/// Builds an exclusive write LOCK request body.
pub fn lock_body(owner: &str) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n",
            "<D:lockinfo xmlns:D=\"DAV:\">",
            "<D:lockscope><D:exclusive/></D:lockscope>",
            "<D:locktype><D:write/></D:locktype>",
            "<D:owner>{}</D:owner>",
            "</D:lockinfo>"
        ),
        quick_xml::escape::escape(owner)
    )
}

/// Extracts the lock token href from a LOCK response body.
pub fn parse_lock_token(xml_text: &str) -> Result<Option<String>, WebDavError> {
    let mut reader = Reader::from_str(xml_text);
    reader.config_mut().trim_text(true);

    let mut in_locktoken = false;
    let mut in_href = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(&e)?;
                match name.as_str() {
                    "locktoken" => in_locktoken = true,
                    "href" if in_locktoken => in_href = true,
                    _ => {}
                }
            }
            Ok(Event::Text(e)) if in_href => {
                return Ok(Some(e.unescape()?.trim().to_string()));
            }
            Ok(Event::End(e)) => {
                let name = local_name_end(&e)?;
                match name.as_str() {
                    "locktoken" => in_locktoken = false,
                    "href" => in_href = false,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(WebDavError::Xml(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(None)
}

fn local_name(e: &BytesStart) -> Result<String, WebDavError> {
    let qname = e.name();
    let local = qname.local_name();
    let name = str::from_utf8(local.as_ref())
        .map_err(|e| WebDavError::Config(format!("invalid UTF-8 in element name: {}", e)))?;
    Ok(name.to_string())
}

fn local_name_end(e: &BytesEnd) -> Result<String, WebDavError> {
    let qname = e.name();
    let local = qname.local_name();
    let name = str::from_utf8(local.as_ref())
        .map_err(|e| WebDavError::Config(format!("invalid UTF-8 in element name: {}", e)))?;
    Ok(name.to_string())
}

/// Pulls the numeric code out of a status line like `HTTP/1.1 200 OK`.
fn parse_status_line(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1).and_then(|s| s.parse().ok())
}

/// Parses the `getlastmodified` value. Servers send RFC 2822; some send
/// RFC 3339 or a bare GMT format.
pub fn parse_http_date(date_str: &str) -> Option<DateTime<Utc>> {
    if date_str.is_empty() {
        return None;
    }

    DateTime::parse_from_rfc2822(date_str)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            DateTime::parse_from_rfc3339(date_str)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(date_str, "%a, %d %b %Y %H:%M:%S GMT")
                .ok()
                .map(|ndt| DateTime::from_naive_utc_and_offset(ndt, Utc))
        })
}
