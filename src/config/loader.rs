//! Mapping file loading
//!
//! The mapping file is line-oriented: each non-empty, non-`#` line is
//! `UDID:LOCAL_PORT` or `UDID:LOCAL_PORT:DEVICE_PORT`. The two-field form
//! forwards to device port 22 (ssh), matching what the relay is almost
//! always used for.

use std::path::Path;

use tracing::{debug, info};

use super::types::{Mapping, MappingEntry};
use crate::error::ConfigError;

/// Device port assumed when a mapping line omits the third field
const DEFAULT_DEVICE_PORT: u16 = 22;

/// Load the mapping from a file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or any line is
/// malformed. A parse error rejects the whole file; the caller decides
/// whether to keep a previously loaded mapping.
pub fn load_mapping(path: impl AsRef<Path>) -> Result<Mapping, ConfigError> {
    let path = path.as_ref();

    debug!("Loading mapping from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let mapping = parse_mapping_str(&contents)?;

    info!("Mapping loaded: {} entries from {:?}", mapping.len(), path);

    Ok(mapping)
}

/// Parse a mapping from its textual form
///
/// # Errors
///
/// Returns `ConfigError` on the first malformed line, invalid port, or
/// duplicate `(udid, local_port)` pair.
pub fn parse_mapping_str(contents: &str) -> Result<Mapping, ConfigError> {
    let mut entries = Vec::new();

    for (idx, raw) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split(':');
        let udid = fields.next().unwrap_or_default();
        let local = fields.next();
        let device = fields.next();

        if udid.is_empty() || local.is_none() || fields.next().is_some() {
            return Err(ConfigError::MalformedLine {
                line_no,
                line: line.to_string(),
            });
        }

        let local_port = parse_port(local.unwrap(), line_no)?;
        let device_port = match device {
            Some(field) => parse_port(field, line_no)?,
            None => DEFAULT_DEVICE_PORT,
        };

        entries.push(MappingEntry {
            udid: udid.to_string(),
            local_port,
            device_port,
        });
    }

    Mapping::new(entries)
}

fn parse_port(field: &str, line_no: usize) -> Result<u16, ConfigError> {
    match field.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort {
            line_no,
            value: field.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const UDID_A: &str = "00008120-000A1D0E3A88401E";

    #[test]
    fn test_parse_basic() {
        let mapping = parse_mapping_str(&format!("{UDID_A}:2222\n")).unwrap();
        let entry = mapping.entries().next().unwrap();
        assert_eq!(entry.udid, UDID_A);
        assert_eq!(entry.local_port, 2222);
        assert_eq!(entry.device_port, 22);
    }

    #[test]
    fn test_parse_explicit_device_port() {
        let mapping = parse_mapping_str(&format!("{UDID_A}:8080:80\n")).unwrap();
        let entry = mapping.entries().next().unwrap();
        assert_eq!(entry.local_port, 8080);
        assert_eq!(entry.device_port, 80);
    }

    #[test]
    fn test_parse_comments_and_blanks() {
        let text = format!(
            "# phones\n\n{UDID_A}:2222\n   \n# trailing comment\n{UDID_A}:8080:80\n"
        );
        let mapping = parse_mapping_str(&text).unwrap();
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn test_parse_malformed_lines() {
        assert!(matches!(
            parse_mapping_str("just-a-udid\n"),
            Err(ConfigError::MalformedLine { line_no: 1, .. })
        ));
        assert!(matches!(
            parse_mapping_str(":2222\n"),
            Err(ConfigError::MalformedLine { .. })
        ));
        assert!(matches!(
            parse_mapping_str("udid:1:2:3\n"),
            Err(ConfigError::MalformedLine { .. })
        ));
    }

    #[test]
    fn test_parse_invalid_ports() {
        assert!(matches!(
            parse_mapping_str("udid:0\n"),
            Err(ConfigError::InvalidPort { .. })
        ));
        assert!(matches!(
            parse_mapping_str("udid:65536\n"),
            Err(ConfigError::InvalidPort { .. })
        ));
        assert!(matches!(
            parse_mapping_str("udid:ssh\n"),
            Err(ConfigError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_parse_duplicate_pair() {
        let text = format!("{UDID_A}:2222\n{UDID_A}:2222:80\n");
        assert!(matches!(
            parse_mapping_str(&text),
            Err(ConfigError::DuplicateEntry { .. })
        ));
    }

    #[test]
    fn test_load_mapping_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{UDID_A}:2222").unwrap();
        let mapping = load_mapping(file.path()).unwrap();
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn test_load_mapping_missing_file() {
        let result = load_mapping("/nonexistent/gandalf/mappings");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }
}
