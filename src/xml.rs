//! XML helpers shared by the message model and the handshake.

use std::borrow::Cow;

use crate::error::{Error, Result};

/// Deserialize an XML document into a typed struct.
pub fn from_str<'de, T>(s: &'de str) -> Result<T>
where
    T: serde::Deserialize<'de>,
{
    quick_xml::de::from_str(s).map_err(|e| Error::MalformedXml(format!("deserialize: {e}")))
}

/// Serialize a typed struct to an XML document.
pub fn to_string<T>(value: &T) -> Result<String>
where
    T: serde::Serialize,
{
    quick_xml::se::to_string(value).map_err(|e| Error::MalformedXml(format!("serialize: {e}")))
}

/// Escape text for use in XML content or attribute values.
pub fn escape(raw: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(raw)
}
