//! The INI dialect used for `pg_rman.ini`-style files: `KEY = 'value'`
//! pairs grouped under `# comment` section headers, single-quoted values
//! with `\b \f \n \r \t \NNN` backslash escapes.

use std::collections::HashMap;
use std::fmt::Write as _;

use utils::error::{corrupted, RmanResult};

pub fn escape_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            0x08 => out.push_str("\\b"),
            0x0c => out.push_str("\\f"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\{b:03o}");
            }
        }
    }
    out
}

pub fn unescape_value(s: &str) -> RmanResult<String> {
    let mut out = String::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i] as char);
            i += 1;
            continue;
        }
        i += 1;
        let Some(&c) = bytes.get(i) else {
            return Err(corrupted("dangling backslash escape in INI value"));
        };
        match c {
            b'\\' => out.push('\\'),
            b'\'' => out.push('\''),
            b'b' => out.push('\u{08}'),
            b'f' => out.push('\u{0c}'),
            b'n' => out.push('\n'),
            b'r' => out.push('\r'),
            b't' => out.push('\t'),
            b'0'..=b'7' => {
                if i + 2 >= bytes.len() {
                    return Err(corrupted("truncated octal escape in INI value"));
                }
                let octal = std::str::from_utf8(&bytes[i..i + 3])
                    .map_err(|_| corrupted("invalid octal escape in INI value"))?;
                let value = u8::from_str_radix(octal, 8)
                    .map_err(|_| corrupted("invalid octal escape in INI value"))?;
                out.push(value as char);
                i += 2;
            }
            _ => return Err(corrupted("unrecognized backslash escape in INI value")),
        }
        i += 1;
    }
    Ok(out)
}

/// Parses `key = 'value'` lines into an order-preserving map; `#`
/// section-header and blank lines are skipped. Malformed lines fail
/// with `corrupted`.
pub fn parse(text: &str) -> RmanResult<HashMap<String, String>> {
    let mut map = HashMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, rest) = line
            .split_once('=')
            .ok_or_else(|| corrupted(format!("malformed INI line {}: {line:?}", lineno + 1)))?;
        let key = key.trim().to_string();
        let rest = rest.trim();
        let quoted = rest
            .strip_prefix('\'')
            .and_then(|r| r.strip_suffix('\''))
            .ok_or_else(|| corrupted(format!("unquoted INI value at line {}: {line:?}", lineno + 1)))?;
        map.insert(key, unescape_value(quoted)?);
    }
    Ok(map)
}

pub struct Writer {
    buf: String,
}

impl Writer {
    pub fn new() -> Writer {
        Writer { buf: String::new() }
    }

    pub fn section(&mut self, name: &str) {
        let _ = writeln!(self.buf, "# {name}");
    }

    pub fn kv(&mut self, key: &str, value: impl std::fmt::Display) {
        let _ = writeln!(self.buf, "{key} = '{}'", escape_value(&value.to_string()));
    }

    pub fn blank(&mut self) {
        self.buf.push('\n');
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        let s = "line1\nline2\ttab\\back'quote\x01";
        let escaped = escape_value(s);
        assert_eq!(unescape_value(&escaped).unwrap(), s);
    }

    #[test]
    fn parse_simple_file() {
        let text = "# configuration\nBACKUP_MODE = 'FULL'\nSTATUS = 'OK'\n\n# result\nSTART_LSN = '0/16001B8'\n";
        let map = parse(text).unwrap();
        assert_eq!(map.get("BACKUP_MODE").unwrap(), "FULL");
        assert_eq!(map.get("STATUS").unwrap(), "OK");
        assert_eq!(map.get("START_LSN").unwrap(), "0/16001B8");
    }

    #[test]
    fn rejects_unquoted_value() {
        assert!(parse("KEY = value\n").is_err());
    }

    #[test]
    fn writer_round_trips_through_parse() {
        let mut w = Writer::new();
        w.section("configuration");
        w.kv("BACKUP_MODE", "FULL");
        w.kv("NOTE", "weird \\ value");
        let text = w.finish();
        let map = parse(&text).unwrap();
        assert_eq!(map.get("BACKUP_MODE").unwrap(), "FULL");
        assert_eq!(map.get("NOTE").unwrap(), "weird \\ value");
    }
}
