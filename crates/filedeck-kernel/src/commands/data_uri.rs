//! `data:` URI decoding for `put` and `upload`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    /// Media type without parameters, `text/plain` when absent.
    pub mime: String,
    pub data: Vec<u8>,
}

impl DataUri {
    /// File name for an uploaded data URI: sanitized type plus extension.
    pub fn file_name(&self) -> String {
        let stem: String = self
            .mime
            .split('/')
            .next()
            .unwrap_or("file")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
            .collect();
        let stem = if stem.is_empty() { "file".to_string() } else { stem };
        match mime_guess::get_mime_extensions_str(&self.mime).and_then(|exts| exts.first()) {
            Some(ext) => format!("{stem}.{ext}"),
            None => stem,
        }
    }
}

/// Decode `data:[<mediatype>][;base64],<data>`. `None` if malformed.
pub fn decode(uri: &str) -> Option<DataUri> {
    let rest = uri.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mut parts = meta.split(';');
    let mime = parts.next().filter(|m| !m.is_empty()).unwrap_or("text/plain");
    let base64 = parts.any(|p| p.eq_ignore_ascii_case("base64"));
    let data = if base64 {
        STANDARD.decode(payload.trim()).ok()?
    } else {
        percent_decode(payload)?
    };
    Some(DataUri {
        mime: mime.to_ascii_lowercase(),
        data,
    })
}

fn percent_decode(s: &str) -> Option<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(out)
}
