//! Command catalog
//!
//! The device's command set is defined by a table file shared with the
//! front-end firmware. Each record maps a command name to a service, a
//! firmware handler symbol, and the packed binary layouts of its arguments
//! and return values. Numeric command ids are assigned sequentially from
//! [`COMMAND_BASE_ID`] in table order, so the table's line order is part of
//! the wire protocol.
//!
//! The catalog is built once and is immutable afterwards; sessions take an
//! owned copy at construction.

use std::collections::HashMap;

use thiserror::Error;

use crate::layout::{ArgLayout, LayoutError};

/// Base value for sequentially assigned command ids.
///
/// 0x3030 is ASCII `"00"`, which keeps binary command headers legible in a
/// raw terminal dump.
pub const COMMAND_BASE_ID: u16 = 0x3030;

/// First (success) response-code byte; the codes are offset into the ASCII
/// lowercase range so they are legible in a raw dump.
pub const RESPONSE_CODE_BASE: u8 = b'a';

/// Which device service handles a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceId {
    /// Slow-control service: configuration and housekeeping.
    SlowControl,
    /// Data service: acquisition and readout.
    Data,
}

impl ServiceId {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "SERV_SLOW_CTRL" => Some(ServiceId::SlowControl),
            "SERV_DATA" => Some(ServiceId::Data),
            _ => None,
        }
    }
}

/// Single-byte outcome appended to every binary-mode reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = RESPONSE_CODE_BASE,
    InvalidArgumentCount,
    InvalidCommand,
    InvalidNumber,
    OutOfRange,
    CommandFailed,
    Busy,
    Timeout,
    BadCrc,
    InvalidUnpack,
    Waiting,
    ResponseTimeout,
    Invalid,
}

impl ResponseCode {
    /// Decode a raw response-code byte, if it is in the known range.
    pub fn from_byte(byte: u8) -> Option<Self> {
        const CODES: [ResponseCode; 13] = [
            ResponseCode::Ok,
            ResponseCode::InvalidArgumentCount,
            ResponseCode::InvalidCommand,
            ResponseCode::InvalidNumber,
            ResponseCode::OutOfRange,
            ResponseCode::CommandFailed,
            ResponseCode::Busy,
            ResponseCode::Timeout,
            ResponseCode::BadCrc,
            ResponseCode::InvalidUnpack,
            ResponseCode::Waiting,
            ResponseCode::ResponseTimeout,
            ResponseCode::Invalid,
        ];
        byte.checked_sub(RESPONSE_CODE_BASE)
            .and_then(|i| CODES.get(i as usize))
            .copied()
    }

    /// The wire byte for this code.
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// One immutable catalog entry.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Command name as written in the table (sent upper-cased in ASCII mode).
    pub name: String,
    /// Owning device service.
    pub service: ServiceId,
    /// Firmware handler symbol, kept for diagnostics.
    pub handler: String,
    /// Wire command id (base + table index).
    pub id: u16,
    /// Packed layout of the command's arguments.
    pub args: ArgLayout,
    /// Packed layout of the command's binary return values.
    pub ret: ArgLayout,
}

/// Catalog load and lookup failures.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("table line {line}: expected 5 fields, found {found}")]
    FieldCount { line: usize, found: usize },

    #[error("table line {line}: record is not brace-delimited")]
    Delimiters { line: usize },

    #[error("table line {line}: unknown service {service:?}")]
    UnknownService { line: usize, service: String },

    #[error("table line {line}: bad layout {fmt:?}")]
    Layout {
        line: usize,
        fmt: String,
        #[source]
        source: LayoutError,
    },

    #[error("table line {line}: duplicate command name {name:?}")]
    DuplicateName { line: usize, name: String },

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("unknown command id {0:#06x}")]
    UnknownCommandId(u16),
}

/// The immutable command table.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    specs: Vec<CommandSpec>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u16, usize>,
}

impl Catalog {
    /// Parse a command table.
    ///
    /// One record per non-comment line; ids are assigned in line order from
    /// [`COMMAND_BASE_ID`]. Reordering the table therefore changes the wire
    /// protocol — see the warning header in `device_commands.txt`.
    pub fn load(table: &str) -> Result<Self, CatalogError> {
        let mut specs = Vec::new();
        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();

        for (idx, raw_line) in table.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let record = line
                .strip_suffix(',')
                .unwrap_or(line)
                .trim();
            let inner = record
                .strip_prefix('{')
                .and_then(|r| r.strip_suffix('}'))
                .ok_or(CatalogError::Delimiters { line: line_no })?;

            let fields: Vec<&str> = inner.split(',').map(str::trim).collect();
            if fields.len() != 5 {
                return Err(CatalogError::FieldCount {
                    line: line_no,
                    found: fields.len(),
                });
            }

            let name = fields[0].trim_matches('"').to_string();
            let service = ServiceId::parse(fields[1]).ok_or_else(|| {
                CatalogError::UnknownService {
                    line: line_no,
                    service: fields[1].to_string(),
                }
            })?;
            let handler = fields[2].to_string();

            let args_fmt = fields[3].trim_matches('"');
            let args = ArgLayout::parse(args_fmt).map_err(|source| CatalogError::Layout {
                line: line_no,
                fmt: args_fmt.to_string(),
                source,
            })?;

            // The version reply predates the table's layout column and is
            // fixed in firmware: two 30-byte strings, each followed by a
            // status byte.
            let ret_fmt = if handler.eq_ignore_ascii_case("cmd_version") {
                "30sb30sb"
            } else {
                fields[4].trim_matches('"')
            };
            let ret = ArgLayout::parse(ret_fmt).map_err(|source| CatalogError::Layout {
                line: line_no,
                fmt: ret_fmt.to_string(),
                source,
            })?;

            let id = COMMAND_BASE_ID + specs.len() as u16;
            let key = name.to_ascii_lowercase();
            if by_name.insert(key, specs.len()).is_some() {
                return Err(CatalogError::DuplicateName {
                    line: line_no,
                    name,
                });
            }
            by_id.insert(id, specs.len());
            specs.push(CommandSpec {
                name,
                service,
                handler,
                id,
                args,
                ret,
            });
        }

        tracing::debug!(commands = specs.len(), "command catalog loaded");
        Ok(Self {
            specs,
            by_name,
            by_id,
        })
    }

    /// The builtin table shipped with the firmware tree.
    pub fn builtin() -> Self {
        Self::load(include_str!("device_commands.txt"))
            .expect("embedded command table is well-formed")
    }

    /// Number of commands in the catalog.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// True when the catalog holds no commands.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Iterate entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.specs.iter()
    }

    /// Look up a command by name, case-insensitively.
    pub fn by_name(&self, name: &str) -> Result<&CommandSpec, CatalogError> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .map(|&i| &self.specs[i])
            .ok_or_else(|| CatalogError::UnknownCommand(name.to_string()))
    }

    /// Look up a command by wire id.
    pub fn by_id(&self, id: u16) -> Result<&CommandSpec, CatalogError> {
        self.by_id
            .get(&id)
            .map(|&i| &self.specs[i])
            .ok_or(CatalogError::UnknownCommandId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
# comment
{"OK",         SERV_SLOW_CTRL, cmd_ok,         "",   ""},
{"BAUD",       SERV_SLOW_CTRL, cmd_baud,       "i",  ""},
{"SEND_BATCH", SERV_DATA,      cmd_send_batch, "iB", ""},
"#;

    #[test]
    fn ids_follow_table_order() {
        let catalog = Catalog::load(TABLE).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.by_name("ok").unwrap().id, COMMAND_BASE_ID);
        assert_eq!(catalog.by_name("baud").unwrap().id, COMMAND_BASE_ID + 1);
        assert_eq!(
            catalog.by_name("send_batch").unwrap().id,
            COMMAND_BASE_ID + 2
        );
    }

    #[test]
    fn name_lookup_is_case_insensitive() {
        let catalog = Catalog::load(TABLE).unwrap();
        assert_eq!(catalog.by_name("Send_Batch").unwrap().id, 0x3032);
        assert_eq!(catalog.by_name("SEND_BATCH").unwrap().id, 0x3032);
    }

    #[test]
    fn id_lookup() {
        let catalog = Catalog::load(TABLE).unwrap();
        assert_eq!(catalog.by_id(COMMAND_BASE_ID + 1).unwrap().name, "BAUD");
        assert!(matches!(
            catalog.by_id(0x4000),
            Err(CatalogError::UnknownCommandId(0x4000))
        ));
    }

    #[test]
    fn unknown_name_fails() {
        let catalog = Catalog::load(TABLE).unwrap();
        assert!(matches!(
            catalog.by_name("reboot"),
            Err(CatalogError::UnknownCommand(_))
        ));
    }

    #[test]
    fn wrong_field_count_fails() {
        let err = Catalog::load(r#"{"OK", SERV_SLOW_CTRL, cmd_ok, ""},"#).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::FieldCount { line: 1, found: 4 }
        ));
    }

    #[test]
    fn missing_braces_fail() {
        let err = Catalog::load(r#""OK", SERV_SLOW_CTRL, cmd_ok, "", """#).unwrap_err();
        assert!(matches!(err, CatalogError::Delimiters { line: 1 }));
    }

    #[test]
    fn unknown_service_fails() {
        let err =
            Catalog::load(r#"{"OK", SERV_FAST_CTRL, cmd_ok, "", ""},"#).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownService { .. }));
    }

    #[test]
    fn version_return_layout_is_overridden() {
        let table = r#"{"VERSION", SERV_SLOW_CTRL, cmd_version, "", ""},"#;
        let catalog = Catalog::load(table).unwrap();
        let version = catalog.by_name("version").unwrap();
        assert_eq!(version.ret.source(), "30sb30sb");
        assert_eq!(version.ret.packed_size(), 62);
    }

    #[test]
    fn builtin_table_parses() {
        let catalog = Catalog::builtin();
        assert!(!catalog.is_empty());
        // Commands the session special-cases must exist.
        for name in ["ok", "baud", "verbose", "asciimode", "binarymode", "send_batch"] {
            assert!(catalog.by_name(name).is_ok(), "missing {name}");
        }
        assert_eq!(
            catalog.by_name("send_batch").unwrap().args.packed_size(),
            5
        );
    }

    #[test]
    fn response_codes_start_at_lowercase_a() {
        assert_eq!(ResponseCode::Ok.byte(), b'a');
        assert_eq!(ResponseCode::from_byte(b'a'), Some(ResponseCode::Ok));
        assert_eq!(
            ResponseCode::from_byte(b'f'),
            Some(ResponseCode::CommandFailed)
        );
        assert_eq!(ResponseCode::from_byte(b'm'), Some(ResponseCode::Invalid));
        assert_eq!(ResponseCode::from_byte(b'n'), None);
        assert_eq!(ResponseCode::from_byte(0x00), None);
    }
}
