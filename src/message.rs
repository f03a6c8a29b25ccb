//! NETCONF message model: hello, rpc, rpc-reply and notification, plus the
//! capability set exchanged during hello.
//!
//! Outbound messages are built as XML strings; inbound messages are
//! classified and picked apart with a shallow scan so the payload subtrees
//! stay opaque to this crate and can be handed to an external XML/YANG layer.

use log::warn;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_derive::Deserialize;

use crate::error::{Error, Result};
use crate::xml;

/// Namespace of the hello, rpc and rpc-reply elements.
pub const BASE_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";
/// Namespace of notification elements (RFC 5277).
pub const NOTIF_NS: &str = "urn:ietf:params:xml:ns:netconf:notification:1.0";
/// Namespace of ietf-netconf-monitoring, home of `<get-schema>`.
pub const MONITORING_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring";

pub const CAP_BASE_10: &str = "urn:ietf:params:netconf:base:1.0";
pub const CAP_BASE_11: &str = "urn:ietf:params:netconf:base:1.1";
pub const CAP_WRITABLE_RUNNING: &str = "urn:ietf:params:netconf:capability:writable-running:1.0";
pub const CAP_CANDIDATE: &str = "urn:ietf:params:netconf:capability:candidate:1.0";
pub const CAP_CONFIRMED_COMMIT: &str = "urn:ietf:params:netconf:capability:confirmed-commit:1.1";
pub const CAP_ROLLBACK_ON_ERROR: &str =
    "urn:ietf:params:netconf:capability:rollback-on-error:1.0";
pub const CAP_VALIDATE: &str = "urn:ietf:params:netconf:capability:validate:1.1";
pub const CAP_STARTUP: &str = "urn:ietf:params:netconf:capability:startup:1.0";
pub const CAP_URL: &str = "urn:ietf:params:netconf:capability:url:1.0";
pub const CAP_XPATH: &str = "urn:ietf:params:netconf:capability:xpath:1.0";
pub const CAP_NOTIFICATION: &str = "urn:ietf:params:netconf:capability:notification:1.0";
pub const CAP_INTERLEAVE: &str = "urn:ietf:params:netconf:capability:interleave:1.0";
pub const CAP_WITH_DEFAULTS: &str = "urn:ietf:params:netconf:capability:with-defaults:1.0";

/// Ordered set of capability URIs (with their URI parameters) advertised in a
/// hello message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities(Vec<String>);

impl Capabilities {
    pub fn new(uris: Vec<String>) -> Capabilities {
        Capabilities(uris)
    }

    pub fn push(&mut self, uri: impl Into<String>) {
        self.0.push(uri.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Exact match against the URI with its parameters stripped.
    pub fn contains(&self, uri: &str) -> bool {
        self.0
            .iter()
            .any(|c| c.split('?').next().unwrap_or(c.as_str()) == uri)
    }

    pub fn has_base_10(&self) -> bool {
        self.contains(CAP_BASE_10)
    }

    pub fn has_base_11(&self) -> bool {
        self.contains(CAP_BASE_11)
    }

    /// Whether the peer implements ietf-netconf-monitoring, and with it
    /// `<get-schema>`.
    pub fn has_monitoring(&self) -> bool {
        self.0.iter().any(|c| c.starts_with(MONITORING_NS))
    }

    /// YANG modules announced through capability URI parameters, as
    /// `(module, revision)` pairs in advertisement order.
    pub fn modules(&self) -> Vec<(String, Option<String>)> {
        let mut out = Vec::new();
        for cap in &self.0 {
            let Some((_, query)) = cap.split_once('?') else { continue };
            let mut module = None;
            let mut revision = None;
            for kv in query.split('&') {
                match kv.split_once('=') {
                    Some(("module", v)) => module = Some(v.to_string()),
                    Some(("revision", v)) => revision = Some(v.to_string()),
                    _ => {}
                }
            }
            if let Some(m) = module {
                out.push((m, revision));
            }
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct HelloXml {
    #[serde(rename = "session-id")]
    session_id: Option<u32>,
    capabilities: CapabilityListXml,
}

#[derive(Debug, Deserialize)]
struct CapabilityListXml {
    capability: Vec<String>,
}

/// The first message each side sends: its capability list, plus the assigned
/// session-id when sent by a server.
#[derive(Clone, Debug)]
pub struct Hello {
    pub capabilities: Capabilities,
    pub session_id: Option<u32>,
}

impl Hello {
    pub fn new(capabilities: Capabilities, session_id: Option<u32>) -> Hello {
        Hello { capabilities, session_id }
    }

    pub fn parse(s: &str) -> Result<Hello> {
        let raw: HelloXml = xml::from_str(s.trim())?;
        let caps: Vec<String> =
            raw.capabilities.capability.iter().map(|c| c.trim().to_string()).collect();
        if caps.is_empty() {
            return Err(Error::MalformedXml("hello without capabilities".into()));
        }
        Ok(Hello { capabilities: Capabilities(caps), session_id: raw.session_id })
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(&format!("<hello xmlns=\"{BASE_NS}\">\n  <capabilities>\n"));
        for cap in self.capabilities.iter() {
            out.push_str(&format!("    <capability>{}</capability>\n", xml::escape(cap)));
        }
        out.push_str("  </capabilities>\n");
        if let Some(sid) = self.session_id {
            out.push_str(&format!("  <session-id>{sid}</session-id>\n"));
        }
        out.push_str("</hello>");
        out
    }
}

/// Configuration datastore addressed by an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Datastore {
    Running,
    Candidate,
    Startup,
    Url(String),
}

impl Datastore {
    fn to_xml(&self) -> String {
        match self {
            Datastore::Running => "<running/>".into(),
            Datastore::Candidate => "<candidate/>".into(),
            Datastore::Startup => "<startup/>".into(),
            Datastore::Url(u) => format!("<url>{}</url>", xml::escape(u)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditDefaultOp {
    Merge,
    Replace,
    None,
}

impl EditDefaultOp {
    fn as_str(&self) -> &'static str {
        match self {
            EditDefaultOp::Merge => "merge",
            EditDefaultOp::Replace => "replace",
            EditDefaultOp::None => "none",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditTestOpt {
    TestThenSet,
    Set,
    TestOnly,
}

impl EditTestOpt {
    fn as_str(&self) -> &'static str {
        match self {
            EditTestOpt::TestThenSet => "test-then-set",
            EditTestOpt::Set => "set",
            EditTestOpt::TestOnly => "test-only",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditErrOpt {
    StopOnError,
    ContinueOnError,
    RollbackOnError,
}

impl EditErrOpt {
    fn as_str(&self) -> &'static str {
        match self {
            EditErrOpt::StopOnError => "stop-on-error",
            EditErrOpt::ContinueOnError => "continue-on-error",
            EditErrOpt::RollbackOnError => "rollback-on-error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WithDefaults {
    ReportAll,
    ReportAllTagged,
    Trim,
    Explicit,
}

impl WithDefaults {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithDefaults::ReportAll => "report-all",
            WithDefaults::ReportAllTagged => "report-all-tagged",
            WithDefaults::Trim => "trim",
            WithDefaults::Explicit => "explicit",
        }
    }

    fn to_xml(self) -> String {
        format!(
            "<with-defaults xmlns=\"{}\">{}</with-defaults>",
            "urn:ietf:params:xml:ns:yang:ietf-netconf-with-defaults",
            self.as_str()
        )
    }
}

/// An outbound RPC. Filter and config parameters are complete XML elements
/// (`<filter>…</filter>`, `<config>…</config>`) supplied by the caller; this
/// crate does not interpret them.
#[derive(Clone, Debug)]
pub enum Rpc {
    /// User-defined operation, the complete XML subtree inside `<rpc>`.
    Generic { content: String },
    GetConfig {
        source: Datastore,
        filter: Option<String>,
        with_defaults: Option<WithDefaults>,
    },
    EditConfig {
        target: Datastore,
        default_op: Option<EditDefaultOp>,
        test_opt: Option<EditTestOpt>,
        err_opt: Option<EditErrOpt>,
        /// `<config>` element or `<url>` source.
        config: String,
    },
    CopyConfig {
        target: Datastore,
        source: Option<Datastore>,
        /// `<config>` element used as source when `source` is `None`.
        config: Option<String>,
    },
    DeleteConfig { target: Datastore },
    Lock { target: Datastore },
    Unlock { target: Datastore },
    Get {
        filter: Option<String>,
        with_defaults: Option<WithDefaults>,
    },
    KillSession { session_id: u32 },
    Commit {
        confirmed: bool,
        confirm_timeout: Option<u32>,
        persist: Option<String>,
        persist_id: Option<String>,
    },
    DiscardChanges,
    CancelCommit { persist_id: Option<String> },
    Validate {
        source: Option<Datastore>,
        config: Option<String>,
    },
    GetSchema {
        identifier: String,
        version: Option<String>,
        format: Option<String>,
    },
    CreateSubscription {
        stream: Option<String>,
        filter: Option<String>,
        start_time: Option<String>,
        stop_time: Option<String>,
    },
}

impl Rpc {
    /// Frame the operation into a complete `<rpc>` envelope.
    pub fn to_xml(&self, message_id: u64) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <rpc message-id=\"{message_id}\" xmlns=\"{BASE_NS}\">{}</rpc>",
            self.body_xml()
        )
    }

    fn body_xml(&self) -> String {
        match self {
            Rpc::Generic { content } => content.clone(),
            Rpc::GetConfig { source, filter, with_defaults } => {
                let mut b = format!("<get-config><source>{}</source>", source.to_xml());
                if let Some(f) = filter {
                    b.push_str(f);
                }
                if let Some(wd) = with_defaults {
                    b.push_str(&wd.to_xml());
                }
                b.push_str("</get-config>");
                b
            }
            Rpc::EditConfig { target, default_op, test_opt, err_opt, config } => {
                let mut b = format!("<edit-config><target>{}</target>", target.to_xml());
                if let Some(op) = default_op {
                    b.push_str(&format!(
                        "<default-operation>{}</default-operation>",
                        op.as_str()
                    ));
                }
                if let Some(t) = test_opt {
                    b.push_str(&format!("<test-option>{}</test-option>", t.as_str()));
                }
                if let Some(e) = err_opt {
                    b.push_str(&format!("<error-option>{}</error-option>", e.as_str()));
                }
                b.push_str(config);
                b.push_str("</edit-config>");
                b
            }
            Rpc::CopyConfig { target, source, config } => {
                let src = match (source, config) {
                    (Some(ds), _) => ds.to_xml(),
                    (None, Some(cfg)) => cfg.clone(),
                    (None, None) => String::new(),
                };
                format!(
                    "<copy-config><target>{}</target><source>{src}</source></copy-config>",
                    target.to_xml()
                )
            }
            Rpc::DeleteConfig { target } => {
                format!("<delete-config><target>{}</target></delete-config>", target.to_xml())
            }
            Rpc::Lock { target } => {
                format!("<lock><target>{}</target></lock>", target.to_xml())
            }
            Rpc::Unlock { target } => {
                format!("<unlock><target>{}</target></unlock>", target.to_xml())
            }
            Rpc::Get { filter, with_defaults } => {
                let mut b = String::from("<get>");
                if let Some(f) = filter {
                    b.push_str(f);
                }
                if let Some(wd) = with_defaults {
                    b.push_str(&wd.to_xml());
                }
                b.push_str("</get>");
                b
            }
            Rpc::KillSession { session_id } => {
                format!("<kill-session><session-id>{session_id}</session-id></kill-session>")
            }
            Rpc::Commit { confirmed, confirm_timeout, persist, persist_id } => {
                let mut b = String::from("<commit>");
                if *confirmed {
                    b.push_str("<confirmed/>");
                    if let Some(t) = confirm_timeout {
                        b.push_str(&format!("<confirm-timeout>{t}</confirm-timeout>"));
                    }
                    if let Some(p) = persist {
                        b.push_str(&format!("<persist>{}</persist>", xml::escape(p)));
                    }
                }
                if let Some(p) = persist_id {
                    b.push_str(&format!("<persist-id>{}</persist-id>", xml::escape(p)));
                }
                b.push_str("</commit>");
                b
            }
            Rpc::DiscardChanges => "<discard-changes/>".into(),
            Rpc::CancelCommit { persist_id } => match persist_id {
                Some(p) => format!(
                    "<cancel-commit><persist-id>{}</persist-id></cancel-commit>",
                    xml::escape(p)
                ),
                None => "<cancel-commit/>".into(),
            },
            Rpc::Validate { source, config } => {
                let src = match (source, config) {
                    (Some(ds), _) => ds.to_xml(),
                    (None, Some(cfg)) => cfg.clone(),
                    (None, None) => String::new(),
                };
                format!("<validate><source>{src}</source></validate>")
            }
            Rpc::GetSchema { identifier, version, format } => {
                let mut b = format!(
                    "<get-schema xmlns=\"{MONITORING_NS}\"><identifier>{}</identifier>",
                    xml::escape(identifier)
                );
                if let Some(v) = version {
                    b.push_str(&format!("<version>{}</version>", xml::escape(v)));
                }
                if let Some(f) = format {
                    b.push_str(&format!("<format>{}</format>", xml::escape(f)));
                }
                b.push_str("</get-schema>");
                b
            }
            Rpc::CreateSubscription { stream, filter, start_time, stop_time } => {
                let mut b = format!("<create-subscription xmlns=\"{NOTIF_NS}\">");
                if let Some(s) = stream {
                    b.push_str(&format!("<stream>{}</stream>", xml::escape(s)));
                }
                if let Some(f) = filter {
                    b.push_str(f);
                }
                if let Some(t) = start_time {
                    b.push_str(&format!("<startTime>{}</startTime>", xml::escape(t)));
                }
                if let Some(t) = stop_time {
                    b.push_str(&format!("<stopTime>{}</stopTime>", xml::escape(t)));
                }
                b.push_str("</create-subscription>");
                b
            }
        }
    }
}

/// An RPC received by a server session, kept as raw XML for the handler.
#[derive(Clone, Debug)]
pub struct ReceivedRpc {
    /// The message-id attribute, verbatim.
    pub message_id: String,
    /// Local name of the operation element.
    pub operation: String,
    /// The complete `<rpc>` element.
    pub xml: String,
}

/// `<rpc-error>` contents (RFC 6241 appendix A).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpcError {
    pub error_type: String,
    pub tag: String,
    pub severity: String,
    pub app_tag: Option<String>,
    pub path: Option<String>,
    pub message: Option<String>,
    /// `<session-id>` from error-info; the session holding a contested lock.
    pub session_id: Option<String>,
    pub bad_attr: Vec<String>,
    pub bad_elem: Vec<String>,
    pub bad_ns: Vec<String>,
    /// Raw error-info elements not covered by the fields above.
    pub other: Vec<String>,
}

impl RpcError {
    pub fn new(error_type: &str, tag: &str, severity: &str) -> RpcError {
        RpcError {
            error_type: error_type.into(),
            tag: tag.into(),
            severity: severity.into(),
            ..Default::default()
        }
    }

    /// The reply body for input that could not be parsed as an RPC.
    pub fn malformed_message() -> RpcError {
        RpcError::new("rpc", "malformed-message", "error")
    }

    pub fn with_message(mut self, message: impl Into<String>) -> RpcError {
        self.message = Some(message.into());
        self
    }

    fn to_xml(&self) -> String {
        let mut b = String::from("<rpc-error>");
        b.push_str(&format!("<error-type>{}</error-type>", xml::escape(&self.error_type)));
        b.push_str(&format!("<error-tag>{}</error-tag>", xml::escape(&self.tag)));
        b.push_str(&format!(
            "<error-severity>{}</error-severity>",
            xml::escape(&self.severity)
        ));
        if let Some(a) = &self.app_tag {
            b.push_str(&format!("<error-app-tag>{}</error-app-tag>", xml::escape(a)));
        }
        if let Some(p) = &self.path {
            b.push_str(&format!("<error-path>{}</error-path>", xml::escape(p)));
        }
        if let Some(m) = &self.message {
            b.push_str(&format!("<error-message>{}</error-message>", xml::escape(m)));
        }
        let has_info = self.session_id.is_some()
            || !self.bad_attr.is_empty()
            || !self.bad_elem.is_empty()
            || !self.bad_ns.is_empty()
            || !self.other.is_empty();
        if has_info {
            b.push_str("<error-info>");
            if let Some(sid) = &self.session_id {
                b.push_str(&format!("<session-id>{}</session-id>", xml::escape(sid)));
            }
            for a in &self.bad_attr {
                b.push_str(&format!("<bad-attribute>{}</bad-attribute>", xml::escape(a)));
            }
            for e in &self.bad_elem {
                b.push_str(&format!("<bad-element>{}</bad-element>", xml::escape(e)));
            }
            for n in &self.bad_ns {
                b.push_str(&format!("<bad-namespace>{}</bad-namespace>", xml::escape(n)));
            }
            for o in &self.other {
                b.push_str(o);
            }
            b.push_str("</error-info>");
        }
        b.push_str("</rpc-error>");
        b
    }
}

/// Payload of an rpc-reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyBody {
    Ok,
    /// Raw inner XML of the `<data>` element.
    Data(String),
    Errors(Vec<RpcError>),
}

#[derive(Clone, Debug)]
pub struct RpcReply {
    /// The message-id attribute, verbatim; empty when the peer omitted it.
    pub message_id: String,
    pub body: ReplyBody,
}

impl RpcReply {
    pub fn ok(message_id: impl Into<String>) -> RpcReply {
        RpcReply { message_id: message_id.into(), body: ReplyBody::Ok }
    }

    pub fn data(message_id: impl Into<String>, data: impl Into<String>) -> RpcReply {
        RpcReply { message_id: message_id.into(), body: ReplyBody::Data(data.into()) }
    }

    pub fn error(message_id: impl Into<String>, err: RpcError) -> RpcReply {
        RpcReply { message_id: message_id.into(), body: ReplyBody::Errors(vec![err]) }
    }

    /// Numeric message-id, when the attribute parses as one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.message_id.trim().parse().ok()
    }

    pub fn to_xml(&self) -> String {
        let body = match &self.body {
            ReplyBody::Ok => "<ok/>".to_string(),
            ReplyBody::Data(d) => format!("<data>{d}</data>"),
            ReplyBody::Errors(errs) => {
                errs.iter().map(|e| e.to_xml()).collect::<Vec<_>>().join("")
            }
        };
        format!(
            "<rpc-reply message-id=\"{}\" xmlns=\"{BASE_NS}\">{body}</rpc-reply>",
            xml::escape(&self.message_id)
        )
    }
}

/// An event notification (RFC 5277).
#[derive(Clone, Debug)]
pub struct Notification {
    pub event_time: String,
    /// The complete `<notification>` element.
    pub xml: String,
}

impl Notification {
    pub fn to_xml(event_time: &str, body: &str) -> String {
        format!(
            "<notification xmlns=\"{NOTIF_NS}\">\
             <eventTime>{}</eventTime>{body}</notification>",
            xml::escape(event_time)
        )
    }
}

/// A classified inbound message.
#[derive(Clone, Debug)]
pub enum Inbound {
    Hello(Hello),
    Rpc(ReceivedRpc),
    Reply(RpcReply),
    Notification(Notification),
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::MalformedXml(format!("attribute: {e}")))?;
        if attr.key.as_ref() == name {
            let v = attr
                .unescape_value()
                .map_err(|e| Error::MalformedXml(format!("attribute value: {e}")))?;
            return Ok(Some(v.into_owned()));
        }
    }
    Ok(None)
}

fn reader_for(s: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(s);
    let config = reader.config_mut();
    config.trim_text(true);
    reader
}

fn xml_err(e: quick_xml::Error) -> Error {
    Error::MalformedXml(e.to_string())
}

/// Local name of the first element in a fragment.
fn first_element(s: &str) -> Result<Option<String>> {
    let mut reader = reader_for(s);
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) | Event::Empty(e) => {
                return Ok(Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned()))
            }
            Event::Eof => return Ok(None),
            _ => continue,
        }
    }
}

/// Classify one complete inbound message.
pub(crate) fn classify(s: &str) -> Result<Inbound> {
    let s = s.trim();
    let mut reader = reader_for(s);
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"hello" => return Ok(Inbound::Hello(Hello::parse(s)?)),
                    b"rpc" => {
                        let message_id = attr_value(&e, b"message-id")?.unwrap_or_default();
                        let inner = reader.read_text(e.name()).map_err(xml_err)?;
                        let operation = first_element(&inner)?
                            .ok_or_else(|| Error::MalformedXml("rpc without operation".into()))?;
                        return Ok(Inbound::Rpc(ReceivedRpc {
                            message_id,
                            operation,
                            xml: s.to_string(),
                        }));
                    }
                    b"rpc-reply" => {
                        let message_id = attr_value(&e, b"message-id")?.unwrap_or_default();
                        let inner = reader.read_text(e.name()).map_err(xml_err)?;
                        let body = parse_reply_body(&inner)?;
                        return Ok(Inbound::Reply(RpcReply { message_id, body }));
                    }
                    b"notification" => {
                        let inner = reader.read_text(e.name()).map_err(xml_err)?;
                        let event_time = extract_event_time(&inner)?;
                        return Ok(Inbound::Notification(Notification {
                            event_time,
                            xml: s.to_string(),
                        }));
                    }
                    other => {
                        return Err(Error::MalformedXml(format!(
                            "unexpected root element <{}>",
                            String::from_utf8_lossy(other)
                        )))
                    }
                }
            }
            Event::Empty(e) => {
                return Err(Error::MalformedXml(format!(
                    "unexpected empty root element <{}/>",
                    String::from_utf8_lossy(e.local_name().as_ref())
                )))
            }
            Event::Eof => return Err(Error::MalformedXml("empty message".into())),
            _ => continue,
        }
    }
}

fn parse_reply_body(inner: &str) -> Result<ReplyBody> {
    let mut reader = reader_for(inner);
    let mut errors = Vec::new();
    let mut data: Option<String> = None;
    let mut saw_ok = false;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                let text = reader.read_text(e.name()).map_err(xml_err)?.into_owned();
                match name.as_slice() {
                    b"data" => data = Some(text),
                    b"rpc-error" => errors.push(parse_rpc_error(&text)?),
                    b"ok" => saw_ok = true,
                    _ => {}
                }
            }
            Event::Empty(e) => match e.local_name().as_ref() {
                b"ok" => saw_ok = true,
                b"data" => data = Some(String::new()),
                _ => {}
            },
            Event::Eof => break,
            _ => continue,
        }
    }
    if !errors.is_empty() {
        if saw_ok || data.is_some() {
            warn!("rpc-reply mixes rpc-error with ok/data; treating as error reply");
        }
        Ok(ReplyBody::Errors(errors))
    } else if let Some(d) = data {
        Ok(ReplyBody::Data(d))
    } else if saw_ok {
        Ok(ReplyBody::Ok)
    } else {
        // operation-specific reply content without a <data> wrapper
        Ok(ReplyBody::Data(inner.trim().to_string()))
    }
}

fn parse_rpc_error(inner: &str) -> Result<RpcError> {
    let mut err = RpcError::default();
    let mut reader = reader_for(inner);
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                let text = reader.read_text(e.name()).map_err(xml_err)?.into_owned();
                match name.as_slice() {
                    b"error-type" => err.error_type = text.trim().to_string(),
                    b"error-tag" => err.tag = text.trim().to_string(),
                    b"error-severity" => err.severity = text.trim().to_string(),
                    b"error-app-tag" => err.app_tag = Some(text.trim().to_string()),
                    b"error-path" => err.path = Some(text.trim().to_string()),
                    b"error-message" => err.message = Some(text.trim().to_string()),
                    b"error-info" => parse_error_info(&text, &mut err)?,
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => continue,
        }
    }
    Ok(err)
}

fn parse_error_info(inner: &str, err: &mut RpcError) -> Result<()> {
    let mut reader = reader_for(inner);
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                let text = reader.read_text(e.name()).map_err(xml_err)?.into_owned();
                match name.as_slice() {
                    b"session-id" => err.session_id = Some(text.trim().to_string()),
                    b"bad-attribute" => err.bad_attr.push(text.trim().to_string()),
                    b"bad-element" => err.bad_elem.push(text.trim().to_string()),
                    b"bad-namespace" => err.bad_ns.push(text.trim().to_string()),
                    other => {
                        let tag = String::from_utf8_lossy(other).into_owned();
                        err.other.push(format!("<{tag}>{text}</{tag}>"));
                    }
                }
            }
            Event::Eof => break,
            _ => continue,
        }
    }
    Ok(())
}

fn extract_event_time(inner: &str) -> Result<String> {
    let mut reader = reader_for(inner);
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) if e.local_name().as_ref() == b"eventTime" => {
                let text = reader.read_text(e.name()).map_err(xml_err)?;
                return Ok(text.trim().to_string());
            }
            Event::Start(e) => {
                reader.read_to_end(e.name()).map_err(xml_err)?;
            }
            Event::Eof => {
                return Err(Error::MalformedXml("notification without eventTime".into()))
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trip() {
        let hello = Hello::new(
            Capabilities::new(vec![CAP_BASE_10.into(), CAP_BASE_11.into()]),
            Some(7),
        );
        let xml = hello.to_xml();
        let parsed = Hello::parse(&xml).unwrap();
        assert_eq!(parsed.session_id, Some(7));
        assert!(parsed.capabilities.has_base_10());
        assert!(parsed.capabilities.has_base_11());
    }

    #[test]
    fn hello_without_capabilities_is_rejected() {
        let xml = format!("<hello xmlns=\"{BASE_NS}\"><capabilities></capabilities></hello>");
        assert!(Hello::parse(&xml).is_err());
    }

    #[test]
    fn capability_parameters_are_ignored_for_matching() {
        let caps = Capabilities::new(vec![format!(
            "{CAP_WITH_DEFAULTS}?basic-mode=explicit&also-supported=report-all"
        )]);
        assert!(caps.contains(CAP_WITH_DEFAULTS));
    }

    #[test]
    fn module_capabilities_parse() {
        let caps = Capabilities::new(vec![
            CAP_BASE_10.to_string(),
            format!("{MONITORING_NS}?module=ietf-netconf-monitoring&revision=2010-10-04"),
            "urn:example:mod?module=example".to_string(),
        ]);
        assert!(caps.has_monitoring());
        let mods = caps.modules();
        assert_eq!(
            mods,
            vec![
                ("ietf-netconf-monitoring".to_string(), Some("2010-10-04".to_string())),
                ("example".to_string(), None),
            ]
        );
    }

    #[test]
    fn lock_rpc_xml() {
        let rpc = Rpc::Lock { target: Datastore::Running };
        let xml = rpc.to_xml(1);
        assert!(xml.contains("<rpc message-id=\"1\""));
        assert!(xml.contains("<lock><target><running/></target></lock>"));
    }

    #[test]
    fn edit_config_rpc_xml() {
        let rpc = Rpc::EditConfig {
            target: Datastore::Candidate,
            default_op: Some(EditDefaultOp::Merge),
            test_opt: Some(EditTestOpt::TestThenSet),
            err_opt: Some(EditErrOpt::RollbackOnError),
            config: "<config><top xmlns=\"urn:x\"/></config>".into(),
        };
        let xml = rpc.to_xml(4);
        assert!(xml.contains("<default-operation>merge</default-operation>"));
        assert!(xml.contains("<test-option>test-then-set</test-option>"));
        assert!(xml.contains("<error-option>rollback-on-error</error-option>"));
        assert!(xml.contains("<config><top xmlns=\"urn:x\"/></config>"));
    }

    #[test]
    fn get_schema_rpc_xml() {
        let rpc = Rpc::GetSchema {
            identifier: "ietf-netconf".into(),
            version: Some("2011-06-01".into()),
            format: None,
        };
        let xml = rpc.to_xml(2);
        assert!(xml.contains(MONITORING_NS));
        assert!(xml.contains("<identifier>ietf-netconf</identifier>"));
        assert!(xml.contains("<version>2011-06-01</version>"));
    }

    #[test]
    fn classify_rpc() {
        let xml = format!(
            "<rpc message-id=\"101\" xmlns=\"{BASE_NS}\">\
             <get-config><source><running/></source></get-config></rpc>"
        );
        match classify(&xml).unwrap() {
            Inbound::Rpc(rpc) => {
                assert_eq!(rpc.message_id, "101");
                assert_eq!(rpc.operation, "get-config");
            }
            other => panic!("expected rpc, got {other:?}"),
        }
    }

    #[test]
    fn classify_ok_reply() {
        let xml = format!("<rpc-reply message-id=\"1\" xmlns=\"{BASE_NS}\"><ok/></rpc-reply>");
        match classify(&xml).unwrap() {
            Inbound::Reply(r) => {
                assert_eq!(r.numeric_id(), Some(1));
                assert_eq!(r.body, ReplyBody::Ok);
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn classify_data_reply() {
        let xml = format!(
            "<rpc-reply message-id=\"9\" xmlns=\"{BASE_NS}\">\
             <data><top><x>1</x></top></data></rpc-reply>"
        );
        match classify(&xml).unwrap() {
            Inbound::Reply(r) => {
                assert_eq!(r.body, ReplyBody::Data("<top><x>1</x></top>".into()));
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn classify_error_reply() {
        let xml = format!(
            "<rpc-reply message-id=\"3\" xmlns=\"{BASE_NS}\"><rpc-error>\
             <error-type>protocol</error-type>\
             <error-tag>lock-denied</error-tag>\
             <error-severity>error</error-severity>\
             <error-message>lock held</error-message>\
             <error-info><session-id>44</session-id></error-info>\
             </rpc-error></rpc-reply>"
        );
        match classify(&xml).unwrap() {
            Inbound::Reply(r) => match r.body {
                ReplyBody::Errors(errs) => {
                    assert_eq!(errs.len(), 1);
                    assert_eq!(errs[0].tag, "lock-denied");
                    assert_eq!(errs[0].severity, "error");
                    assert_eq!(errs[0].session_id.as_deref(), Some("44"));
                }
                other => panic!("expected errors, got {other:?}"),
            },
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let xml = format!(
            "<notification xmlns=\"{NOTIF_NS}\">\
             <eventTime>2024-01-01T00:00:00Z</eventTime>\
             <event xmlns=\"urn:x\"><up/></event></notification>"
        );
        match classify(&xml).unwrap() {
            Inbound::Notification(n) => {
                assert_eq!(n.event_time, "2024-01-01T00:00:00Z");
                assert!(n.xml.contains("<up/>"));
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn classify_rejects_mismatched_tags() {
        let xml = format!("<rpc message-id=\"1\" xmlns=\"{BASE_NS}\"><lock></rpc>");
        assert!(matches!(classify(&xml), Err(Error::MalformedXml(_))));
    }

    #[test]
    fn error_reply_to_xml() {
        let reply = RpcReply::error("5", RpcError::malformed_message());
        let xml = reply.to_xml();
        assert!(xml.contains("<error-tag>malformed-message</error-tag>"));
        assert!(xml.contains("message-id=\"5\""));
        match classify(&xml).unwrap() {
            Inbound::Reply(r) => match r.body {
                ReplyBody::Errors(errs) => assert_eq!(errs[0].tag, "malformed-message"),
                other => panic!("expected errors, got {other:?}"),
            },
            other => panic!("expected reply, got {other:?}"),
        }
    }
}
