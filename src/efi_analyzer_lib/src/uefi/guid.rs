use crate::prelude::*;
use std::collections::HashMap;
use std::str::FromStr;

/// A UEFI Globally Unique Identifier.
///
/// In memory a GUID is stored as a little-endian `u32`, two little-endian `u16` and eight bytes.
/// It is displayed in the canonical upper-case form `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Default)]
#[serde(into = "String", try_from = "String")]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    /// The all-zero GUID.
    pub const ZERO: Guid = Guid::new(0, 0, 0, [0; 8]);

    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Guid {
        Guid {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// Decode a GUID from its in-memory representation.
    /// Returns `None` if less than 16 bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Option<Guid> {
        let bytes = bytes.get(..16)?;
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&bytes[8..16]);
        Some(Guid {
            data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_le_bytes([bytes[4], bytes[5]]),
            data3: u16::from_le_bytes([bytes[6], bytes[7]]),
            data4,
        })
    }

    /// The in-memory representation of the GUID.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.data1.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.data2.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.data3.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.data4);
        bytes
    }

    pub fn is_zero(&self) -> bool {
        *self == Guid::ZERO
    }

    /// Returns `false` for byte patterns that are almost never real GUIDs,
    /// i.e. all bytes zero or all bytes `0xFF`.
    pub fn is_plausible(&self) -> bool {
        let bytes = self.to_bytes();
        !(bytes.iter().all(|byte| *byte == 0) || bytes.iter().all(|byte| *byte == 0xff))
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1]
        )?;
        for byte in &self.data4[2..] {
            write!(formatter, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for Guid {
    type Err = Error;

    /// Parse the canonical string form of a GUID, optionally enclosed in braces.
    fn from_str(string: &str) -> Result<Guid, Error> {
        let trimmed = string.trim().trim_start_matches('{').trim_end_matches('}');
        let parts: Vec<&str> = trimmed.split('-').collect();
        let lengths: Vec<usize> = parts.iter().map(|part| part.len()).collect();
        if lengths != [8, 4, 4, 4, 12]
            || !trimmed.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
        {
            return Err(anyhow!("Malformed GUID string: {}", string));
        }
        let data1 = u32::from_str_radix(parts[0], 16)?;
        let data2 = u16::from_str_radix(parts[1], 16)?;
        let data3 = u16::from_str_radix(parts[2], 16)?;
        let tail = format!("{}{}", parts[3], parts[4]);
        let mut data4 = [0u8; 8];
        for (index, byte) in data4.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&tail[2 * index..2 * index + 2], 16)?;
        }
        Ok(Guid::new(data1, data2, data3, data4))
    }
}

impl From<Guid> for String {
    fn from(guid: Guid) -> String {
        guid.to_string()
    }
}

impl TryFrom<String> for Guid {
    type Error = Error;

    fn try_from(string: String) -> Result<Guid, Error> {
        string.parse()
    }
}

/// A lookup from GUID values to their symbolic names.
pub trait GuidDatabase: Sync {
    /// The name of the GUID, if it is known.
    fn name_of(&self, guid: &Guid) -> Option<&str>;
}

/// A GUID database parsed from a JSON file or built from the well-known GUIDs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuidDb {
    names: HashMap<Guid, String>,
}

impl GuidDb {
    /// Create an empty database.
    pub fn new() -> GuidDb {
        GuidDb::default()
    }

    /// Create a database containing the GUIDs the analyses themselves rely on.
    pub fn with_well_known() -> GuidDb {
        let mut database = GuidDb::new();
        for known in super::WELL_KNOWN_GUIDS {
            database.insert(known.name, known.guid);
        }
        for dispatch in super::SmiDispatchKind::ALL {
            database.insert(dispatch.guid_name(), dispatch.guid());
        }
        database
    }

    /// Add a named GUID. An existing name for the same GUID is kept.
    pub fn insert(&mut self, name: impl Into<String>, guid: Guid) {
        self.names.entry(guid).or_insert_with(|| name.into());
    }

    /// Add all GUIDs of the other database that are not yet contained in `self`.
    pub fn merge(&mut self, other: GuidDb) {
        for (guid, name) in other.names {
            self.names.entry(guid).or_insert(name);
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Parse a GUID database from JSON.
    ///
    /// The JSON value has to be an object mapping names to GUIDs.
    /// A GUID is either given as its canonical string
    /// or as an array `[data1, data2, data3, b0, ..., b7]` of eleven integers.
    pub fn from_json(value: &serde_json::Value) -> Result<GuidDb, Error> {
        let object = value
            .as_object()
            .context("The GUID database has to be a JSON object")?;
        let mut database = GuidDb::new();
        for (name, entry) in object {
            let guid = match entry {
                serde_json::Value::String(string) => string.parse()?,
                serde_json::Value::Array(values) => guid_from_array(values)
                    .with_context(|| format!("Malformed GUID for {}", name))?,
                _ => return Err(anyhow!("Malformed GUID for {}", name)),
            };
            database.insert(name.clone(), guid);
        }
        Ok(database)
    }

    /// Read and parse a GUID database file.
    pub fn from_file(path: &std::path::Path) -> Result<GuidDb, Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read GUID database {}", path.display()))?;
        GuidDb::from_json(&serde_json::from_str(&content)?)
    }
}

/// Build a GUID from the eleven integer components of the array form.
fn guid_from_array(values: &[serde_json::Value]) -> Result<Guid, Error> {
    if values.len() != 11 {
        return Err(anyhow!("Expected 11 GUID components, found {}", values.len()));
    }
    let numbers = values
        .iter()
        .map(|value| value.as_u64().context("GUID components have to be integers"))
        .collect::<Result<Vec<u64>, Error>>()?;
    let mut data4 = [0u8; 8];
    for (byte, value) in data4.iter_mut().zip(&numbers[3..]) {
        *byte = u8::try_from(*value)?;
    }
    Ok(Guid::new(
        u32::try_from(numbers[0])?,
        u16::try_from(numbers[1])?,
        u16::try_from(numbers[2])?,
        data4,
    ))
}

impl GuidDatabase for GuidDb {
    fn name_of(&self, guid: &Guid) -> Option<&str> {
        self.names.get(guid).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uefi::EFI_SMM_BASE2_PROTOCOL_GUID;

    #[test]
    fn display_and_parse() {
        let guid = EFI_SMM_BASE2_PROTOCOL_GUID;
        assert_eq!(guid.to_string(), "F4CCBFB7-F6E0-47FD-9DD4-10A8F150C191");
        assert_eq!(
            "{f4ccbfb7-f6e0-47fd-9dd4-10a8f150c191}".parse::<Guid>().unwrap(),
            guid
        );
        assert!("f4ccbfb7-f6e0-47fd-9dd4".parse::<Guid>().is_err());
        assert_eq!(
            serde_json::to_value(guid).unwrap(),
            serde_json::json!("F4CCBFB7-F6E0-47FD-9DD4-10A8F150C191")
        );
    }

    #[test]
    fn little_endian_bytes() {
        let guid = EFI_SMM_BASE2_PROTOCOL_GUID;
        let bytes = guid.to_bytes();
        assert_eq!(&bytes[..4], &[0xb7, 0xbf, 0xcc, 0xf4]);
        assert_eq!(Guid::from_bytes(&bytes), Some(guid));
        assert_eq!(Guid::from_bytes(&bytes[..15]), None);
        assert!(!Guid::from_bytes(&[0xff; 16]).unwrap().is_plausible());
        assert!(!Guid::ZERO.is_plausible());
    }

    #[test]
    fn database_from_json() {
        let json = serde_json::json!({
            "EFI_SMM_BASE2_PROTOCOL_GUID": [4107059127u64, 63200, 18429, 157, 212, 16, 168, 241, 80, 193, 145],
            "EFI_OTHER_GUID": "11111111-2222-3333-4444-555555555555",
        });
        let database = GuidDb::from_json(&json).unwrap();
        assert_eq!(database.len(), 2);
        assert_eq!(
            database.name_of(&EFI_SMM_BASE2_PROTOCOL_GUID),
            Some("EFI_SMM_BASE2_PROTOCOL_GUID")
        );
        assert!(GuidDb::from_json(&serde_json::json!({"X": [1, 2]})).is_err());
        assert!(GuidDb::from_json(&serde_json::json!([1])).is_err());
    }

    #[test]
    fn well_known_database() {
        let database = GuidDb::with_well_known();
        assert_eq!(
            database.name_of(&EFI_SMM_BASE2_PROTOCOL_GUID),
            Some("EFI_SMM_BASE2_PROTOCOL_GUID")
        );
        assert!(database.len() >= 16);
    }
}
