//! NOTIFY body codec.
//!
//! Event bodies are property sets:
//!
//! ```xml
//! <e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">
//!   <e:property><Status>1</Status></e:property>
//! </e:propertyset>
//! ```
//!
//! Reading matches element names without their namespace prefix, so bodies
//! from publishers that pick another prefix decode the same way.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::CodecError;
use crate::model::StateValues;

const EVENT_NAMESPACE: &str = "urn:schemas-upnp-org:event-1-0";

/// Encode evented values as a property set.
pub fn write_propertyset<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut body = String::from(r#"<?xml version="1.0" encoding="utf-8"?>"#);
    body.push_str(&format!(r#"<e:propertyset xmlns:e="{EVENT_NAMESPACE}">"#));
    for (name, value) in values {
        body.push_str("<e:property><");
        body.push_str(name);
        body.push('>');
        body.push_str(&escape(value.as_str()));
        body.push_str("</");
        body.push_str(name);
        body.push_str("></e:property>");
    }
    body.push_str("</e:propertyset>");
    body
}

/// Decode a property set into variable values.
pub fn read_propertyset(body: &str) -> Result<StateValues, CodecError> {
    if body.trim().is_empty() {
        return Err(CodecError::EmptyBody);
    }

    let malformed = |reason: String| CodecError::Malformed {
        reason,
        body: body.to_string(),
    };

    let mut reader = Reader::from_str(body);
    let mut values = StateValues::new();
    let mut depth = 0usize;
    let mut saw_root = false;
    let mut current: Option<String> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                depth += 1;
                let name = local_name(element.local_name().as_ref()).map_err(malformed)?;
                match depth {
                    1 => {
                        check_root(&name)?;
                        saw_root = true;
                    }
                    3 => {
                        current = Some(name);
                        text.clear();
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(element)) => {
                let name = local_name(element.local_name().as_ref()).map_err(malformed)?;
                match depth {
                    0 => {
                        check_root(&name)?;
                        saw_root = true;
                    }
                    2 => {
                        values.insert(name, String::new());
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(content)) => {
                if depth == 3 && current.is_some() {
                    let unescaped = content.unescape().map_err(|e| malformed(e.to_string()))?;
                    text.push_str(&unescaped);
                }
            }
            Ok(Event::CData(content)) => {
                if depth == 3 && current.is_some() {
                    let raw = content.into_inner();
                    text.push_str(&String::from_utf8_lossy(&raw));
                }
            }
            Ok(Event::End(_)) => {
                if depth == 3 {
                    if let Some(name) = current.take() {
                        values.insert(name, std::mem::take(&mut text));
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(malformed(e.to_string())),
        }
    }

    if !saw_root {
        return Err(malformed("no root element".to_string()));
    }
    Ok(values)
}

fn local_name(raw: &[u8]) -> Result<String, String> {
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|e| e.to_string())
}

fn check_root(name: &str) -> Result<(), CodecError> {
    if name == "propertyset" {
        Ok(())
    } else {
        Err(CodecError::UnexpectedRoot(name.to_string()))
    }
}
