//! Schema context seam.
//!
//! YANG parsing and validation live outside this crate; sessions only carry
//! an opaque [`SchemaContext`] handle and feed it module sources during the
//! handshake, either fetched from the peer with `<get-schema>` or loaded from
//! the context's own search path.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::message::{ReplyBody, Rpc};
use crate::session::Session;

/// Modules a client session cannot operate without.
pub(crate) const MANDATORY_MODULES: &[&str] = &["ietf-netconf"];

/// Opaque YANG schema context populated during the handshake. Possibly shared
/// between sessions.
pub trait SchemaContext: Send + Sync {
    fn has_module(&self, name: &str) -> bool;

    /// Hand the context a module source fetched from the peer.
    fn parse_module(&self, name: &str, revision: Option<&str>, yang: &str) -> Result<()>;

    /// Ask the context to find the module on its own search path.
    fn load_module(&self, name: &str, revision: Option<&str>) -> Result<()>;
}

/// File-based context: modules resolve to `<name>.yang` or
/// `<name>@<revision>.yang` under a search directory.
pub struct SearchPathSchemas {
    dir: PathBuf,
    loaded: Mutex<HashSet<String>>,
}

impl SearchPathSchemas {
    pub fn new(dir: impl Into<PathBuf>) -> Arc<SearchPathSchemas> {
        Arc::new(SearchPathSchemas { dir: dir.into(), loaded: Mutex::new(HashSet::new()) })
    }
}

impl SchemaContext for SearchPathSchemas {
    fn has_module(&self, name: &str) -> bool {
        self.loaded.lock().contains(name)
    }

    fn parse_module(&self, name: &str, _revision: Option<&str>, yang: &str) -> Result<()> {
        if yang.trim().is_empty() {
            return Err(Error::SchemaMissing(name.into()));
        }
        self.loaded.lock().insert(name.to_string());
        Ok(())
    }

    fn load_module(&self, name: &str, revision: Option<&str>) -> Result<()> {
        let mut candidates = vec![self.dir.join(format!("{name}.yang"))];
        if let Some(rev) = revision {
            candidates.insert(0, self.dir.join(format!("{name}@{rev}.yang")));
        }
        if candidates.iter().any(|p| p.is_file()) {
            self.loaded.lock().insert(name.to_string());
            Ok(())
        } else {
            Err(Error::SchemaMissing(name.into()))
        }
    }
}

fn strip_cdata(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("<![CDATA[")
        .and_then(|t| t.strip_suffix("]]>"))
        .unwrap_or(trimmed)
}

fn fetch_module(
    session: &Session,
    ctx: &Arc<dyn SchemaContext>,
    name: &str,
    revision: Option<&str>,
    timeout_ms: i32,
) -> Result<()> {
    let rpc = Rpc::GetSchema {
        identifier: name.to_string(),
        version: revision.map(|r| r.to_string()),
        format: Some("yang".to_string()),
    };
    let id = session.send_rpc_startup(&rpc, timeout_ms)?;
    let reply = session.recv_reply_startup(id, timeout_ms)?;
    match reply.body {
        ReplyBody::Data(data) => ctx.parse_module(name, revision, strip_cdata(&data)),
        _ => Err(Error::SchemaMissing(name.into())),
    }
}

/// Handshake step 5: make the session's schema context cover the modules the
/// peer announced. Fails only when a mandatory module stays missing.
pub(crate) fn populate(session: &Session, timeout_ms: i32) -> Result<()> {
    let Some(ctx) = session.schema().cloned() else {
        return Ok(());
    };
    let caps = session.capabilities();
    let use_get_schema = caps.has_monitoring();
    for (name, revision) in caps.modules() {
        if ctx.has_module(&name) {
            continue;
        }
        let result = if use_get_schema {
            fetch_module(session, &ctx, &name, revision.as_deref(), timeout_ms)
        } else {
            ctx.load_module(&name, revision.as_deref())
        };
        match result {
            Ok(()) => debug!("schema: module {name} available"),
            Err(e) => {
                if MANDATORY_MODULES.contains(&name.as_str()) {
                    return Err(Error::SchemaMissing(name));
                }
                warn!("schema: module {name} unavailable: {e}");
            }
        }
    }
    for name in MANDATORY_MODULES {
        if !ctx.has_module(name) && ctx.load_module(name, None).is_err() {
            return Err(Error::SchemaMissing((*name).into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_path_finds_revisioned_and_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ietf-netconf.yang"), "module ietf-netconf {}").unwrap();
        std::fs::write(dir.path().join("acme@2024-01-01.yang"), "module acme {}").unwrap();
        let ctx = SearchPathSchemas::new(dir.path());
        ctx.load_module("ietf-netconf", None).unwrap();
        ctx.load_module("acme", Some("2024-01-01")).unwrap();
        assert!(ctx.has_module("acme"));
        assert!(matches!(
            ctx.load_module("missing", None),
            Err(Error::SchemaMissing(_))
        ));
    }

    #[test]
    fn cdata_wrapper_is_stripped() {
        assert_eq!(strip_cdata("<![CDATA[module m {}]]>"), "module m {}");
        assert_eq!(strip_cdata("  module m {}  "), "module m {}");
    }
}
