use crate::prelude::*;

/// Access permissions of a memory segment.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

/// A continuous segment of the loaded module image.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct Segment {
    #[serde(default)]
    pub name: String,
    /// The address of the first byte of the segment.
    pub start: u64,
    /// The contents of the segment
    pub bytes: Vec<u8>,
    pub permissions: Permissions,
}

impl Segment {
    /// Create a new segment.
    pub fn new(name: impl ToString, start: u64, bytes: Vec<u8>, permissions: Permissions) -> Segment {
        Segment {
            name: name.to_string(),
            start,
            bytes,
            permissions,
        }
    }

    /// The address one past the last byte of the segment.
    pub fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end()
    }

    /// Read `length` bytes starting at `address`.
    /// Returns `None` if the interval is not completely contained in the segment.
    pub fn read(&self, address: u64, length: usize) -> Option<&[u8]> {
        if !self.contains(address) {
            return None;
        }
        let offset = (address - self.start) as usize;
        self.bytes.get(offset..offset.checked_add(length)?)
    }

    /// Returns `true` if the segment contains executable code.
    pub fn is_code(&self) -> bool {
        self.permissions.execute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_inside_bounds_only() {
        let segment = Segment::new(
            ".data",
            0x2000,
            vec![1, 2, 3, 4],
            Permissions {
                read: true,
                write: true,
                execute: false,
            },
        );
        assert_eq!(segment.read(0x2001, 2), Some(&[2u8, 3][..]));
        assert_eq!(segment.read(0x2003, 2), None);
        assert_eq!(segment.read(0x1fff, 1), None);
        assert_eq!(segment.end(), 0x2004);
        assert!(!segment.is_code());
    }
}
