//! Column metadata: field type codes, column flags and the column
//! definition packet.

use s2wire_core::Result;

use crate::errors::protocol_error_with_data;
use crate::protocol::{PacketReader, charset};

/// Field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    /// Internal to the server, sent as DATE
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Map a wire type code; `None` for codes this client does not know.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// String and blob types: their bytes are text unless the column
    /// charset is binary.
    #[must_use]
    pub const fn is_text(self) -> bool {
        matches!(
            self,
            FieldType::VarChar
                | FieldType::Bit
                | FieldType::Enum
                | FieldType::Set
                | FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::VarString
                | FieldType::String
                | FieldType::Geometry
        )
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::NewDate
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
        )
    }

    /// SQL name of the type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time => "TIME",
            FieldType::DateTime => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
}

/// Column definition from a result set (protocol 4.1 layout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Catalog name (always "def")
    pub catalog: String,
    /// Schema (database) name
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    /// Original table name
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    /// Original column name
    pub org_name: String,
    /// Collation id of the column
    pub charset: u16,
    /// Maximum column length in bytes
    pub column_length: u32,
    /// Raw type code as sent by the server
    pub type_code: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// Parse a column definition packet.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let malformed = || protocol_error_with_data("Malformed column definition", payload);
        let mut reader = PacketReader::new(payload);

        let catalog = reader.read_lenenc_string().ok_or_else(malformed)?;
        let schema = reader.read_lenenc_string().ok_or_else(malformed)?;
        let table = reader.read_lenenc_string().ok_or_else(malformed)?;
        let org_table = reader.read_lenenc_string().ok_or_else(malformed)?;
        let name = reader.read_lenenc_string().ok_or_else(malformed)?;
        let org_name = reader.read_lenenc_string().ok_or_else(malformed)?;

        // Length of the fixed-size block (0x0c)
        reader.read_lenenc_int().ok_or_else(malformed)?;
        let charset = reader.read_u16_le().ok_or_else(malformed)?;
        let column_length = reader.read_u32_le().ok_or_else(malformed)?;
        let type_code = reader.read_u8().ok_or_else(malformed)?;
        let flags = reader.read_u16_le().ok_or_else(malformed)?;
        let decimals = reader.read_u8().ok_or_else(malformed)?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            type_code,
            flags,
            decimals,
        })
    }

    /// Known field type, if any.
    #[must_use]
    pub fn field_type(&self) -> Option<FieldType> {
        FieldType::from_code(self.type_code)
    }

    /// Whether the column uses the `binary` character set.
    #[must_use]
    pub const fn is_binary_charset(&self) -> bool {
        self.charset == charset::BINARY
    }

    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    /// Display length in characters.
    ///
    /// VAR_STRING lengths are reported in bytes, so they are divided by
    /// the maximum bytes per character of the column charset.
    #[must_use]
    pub fn display_length(&self) -> u32 {
        if self.type_code != FieldType::VarString.code() {
            return self.column_length;
        }
        let mblen = match charset::name_of(self.charset) {
            Some("utf8mb4") => 4,
            Some("utf8") => 3,
            _ => 1,
        };
        self.column_length / mblen
    }

    /// DB-API style column description.
    #[must_use]
    pub fn description(&self) -> ColumnDescription {
        ColumnDescription {
            name: self.name.clone(),
            type_code: self.type_code,
            display_size: None,
            internal_size: self.display_length(),
            precision: self.display_length(),
            scale: self.decimals,
            null_ok: !self.is_not_null(),
        }
    }
}

/// The seven-field column summary exposed by cursors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    pub type_code: u8,
    pub display_size: Option<u32>,
    pub internal_size: u32,
    pub precision: u32,
    pub scale: u8,
    pub null_ok: bool,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::PacketWriter;

    /// Encode a column definition the way a server would.
    pub(crate) fn column_packet(name: &str, field_type: FieldType, charset: u16, flags: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_lenenc_string("def");
        w.write_lenenc_string("app");
        w.write_lenenc_string("t");
        w.write_lenenc_string("t");
        w.write_lenenc_string(name);
        w.write_lenenc_string(name);
        w.write_lenenc_int(0x0c);
        w.write_u16_le(charset);
        w.write_u32_le(80);
        w.write_u8(field_type.code());
        w.write_u16_le(flags);
        w.write_u8(0);
        w.write_zeros(2);
        w.into_bytes()
    }

    #[test]
    fn test_parse_column_definition() {
        let packet = column_packet(
            "id",
            FieldType::LongLong,
            charset::BINARY,
            column_flags::NOT_NULL | column_flags::PRIMARY_KEY,
        );
        let col = ColumnDef::parse(&packet).unwrap();
        assert_eq!(col.catalog, "def");
        assert_eq!(col.schema, "app");
        assert_eq!(col.name, "id");
        assert_eq!(col.field_type(), Some(FieldType::LongLong));
        assert!(col.is_binary_charset());
        assert!(col.is_not_null());
        assert!(col.is_primary_key());
        assert!(!col.is_unsigned());
        assert!(!col.description().null_ok);
    }

    #[test]
    fn test_truncated_column_definition() {
        let packet = column_packet("id", FieldType::Long, 63, 0);
        let err = ColumnDef::parse(&packet[..packet.len() - 6]).unwrap_err();
        assert!(matches!(err, s2wire_core::Error::Protocol(_)));
    }

    #[test]
    fn test_unknown_type_code_is_kept() {
        let mut packet = column_packet("v", FieldType::String, 45, 0);
        // type code sits after lenenc(0x0c), charset and length
        let type_pos = packet.len() - 6;
        packet[type_pos] = 0xF2;
        let col = ColumnDef::parse(&packet).unwrap();
        assert_eq!(col.type_code, 0xF2);
        assert_eq!(col.field_type(), None);
    }

    #[test]
    fn test_display_length_divides_multibyte() {
        let packet = column_packet("s", FieldType::VarString, charset::UTF8MB4_GENERAL_CI, 0);
        let col = ColumnDef::parse(&packet).unwrap();
        assert_eq!(col.display_length(), 20);
    }

    #[test]
    fn test_field_type_categories() {
        assert!(FieldType::Blob.is_text());
        assert!(FieldType::VarString.is_text());
        assert!(!FieldType::Long.is_text());
        assert!(FieldType::Year.is_integer());
        assert!(FieldType::NewDate.is_temporal());
        assert_eq!(FieldType::from_code(0xF6), Some(FieldType::NewDecimal));
        assert_eq!(FieldType::NewDecimal.name(), "DECIMAL");
    }
}
