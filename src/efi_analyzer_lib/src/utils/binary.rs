//! Utility structs and functions which directly parse the binary file.

use crate::intermediate_representation::{MachineType, ModuleInfo, Permissions, Segment};
use crate::prelude::*;
use goblin::pe;

const IMAGE_SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// The information about a module that is read from its PE headers.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct ImageInfo {
    pub info: ModuleInfo,
    /// The non-discardable sections, mapped at their virtual addresses.
    pub segments: Vec<Segment>,
    /// The virtual address of the entry point.
    pub entry_point: u64,
}

/// Read the machine type, subsystem, image base, entry point and sections of a PE image.
///
/// TE images are not supported.
pub fn read_pe_header(binary: &[u8]) -> Result<ImageInfo, Error> {
    let pe_file = pe::PE::parse(binary).context("Could not parse the PE headers")?;
    let image_base = pe_file.image_base as u64;
    let mut info = ModuleInfo::new(MachineType::from_coff(pe_file.header.coff_header.machine));
    info.image_base = image_base;
    info.subsystem = pe_file
        .header
        .optional_header
        .map(|header| header.windows_fields.subsystem);
    let mut segments = Vec::new();
    for section in pe_file.sections.iter() {
        if section.characteristics & IMAGE_SCN_MEM_DISCARDABLE != 0 {
            continue;
        }
        segments.push(segment_from_section(binary, image_base, section)?);
    }
    if segments.is_empty() {
        return Err(anyhow!("No loadable sections found"));
    }
    Ok(ImageInfo {
        info,
        segments,
        entry_point: image_base + pe_file.entry as u64,
    })
}

/// Map a section to its virtual address.
/// Space of the section beyond its raw data is filled with zeros.
fn segment_from_section(
    binary: &[u8],
    image_base: u64,
    section: &pe::section_table::SectionTable,
) -> Result<Segment, Error> {
    let start = section.pointer_to_raw_data as usize;
    let end = start + section.size_of_raw_data as usize;
    let mut bytes = binary
        .get(start..end)
        .ok_or_else(|| anyhow!("Raw data of a section lies outside of the file"))?
        .to_vec();
    if section.virtual_size > section.size_of_raw_data {
        bytes.resize(section.virtual_size as usize, 0u8);
    }
    let permissions = Permissions {
        read: section.characteristics & IMAGE_SCN_MEM_READ != 0,
        write: section.characteristics & IMAGE_SCN_MEM_WRITE != 0,
        execute: section.characteristics & IMAGE_SCN_MEM_EXECUTE != 0,
    };
    let name = section.name().unwrap_or_default();
    Ok(Segment::new(
        name,
        image_base + section.virtual_address as u64,
        bytes,
        permissions,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(bytes: &mut [u8], offset: usize, value: &[u8]) {
        bytes[offset..offset + value.len()].copy_from_slice(value);
    }

    /// A PE32+ runtime driver with image base `0x10000`, a `.text` section at RVA `0x1000`
    /// and a discardable `.reloc` section.
    fn pe_runtime_driver() -> Vec<u8> {
        let mut bytes = vec![0u8; 0x600];
        put(&mut bytes, 0, b"MZ");
        put(&mut bytes, 0x3c, &0x80u32.to_le_bytes());
        let pe = 0x80;
        put(&mut bytes, pe, b"PE\0\0");
        let coff = pe + 4;
        put(&mut bytes, coff, &0x8664u16.to_le_bytes());
        put(&mut bytes, coff + 2, &2u16.to_le_bytes());
        put(&mut bytes, coff + 16, &0xf0u16.to_le_bytes());
        put(&mut bytes, coff + 18, &0x22u16.to_le_bytes());
        let optional = coff + 20;
        put(&mut bytes, optional, &0x20bu16.to_le_bytes());
        put(&mut bytes, optional + 16, &0x1010u32.to_le_bytes());
        put(&mut bytes, optional + 20, &0x1000u32.to_le_bytes());
        put(&mut bytes, optional + 24, &0x10000u64.to_le_bytes());
        put(&mut bytes, optional + 32, &0x1000u32.to_le_bytes());
        put(&mut bytes, optional + 36, &0x200u32.to_le_bytes());
        put(&mut bytes, optional + 56, &0x3000u32.to_le_bytes());
        put(&mut bytes, optional + 60, &0x200u32.to_le_bytes());
        put(&mut bytes, optional + 68, &12u16.to_le_bytes());
        put(&mut bytes, optional + 108, &16u32.to_le_bytes());
        let sections = optional + 0xf0;
        put(&mut bytes, sections, b".text\0\0\0");
        put(&mut bytes, sections + 8, &0x300u32.to_le_bytes());
        put(&mut bytes, sections + 12, &0x1000u32.to_le_bytes());
        put(&mut bytes, sections + 16, &0x200u32.to_le_bytes());
        put(&mut bytes, sections + 20, &0x200u32.to_le_bytes());
        put(&mut bytes, sections + 36, &0x6000_0020u32.to_le_bytes());
        let reloc = sections + 40;
        put(&mut bytes, reloc, b".reloc\0\0");
        put(&mut bytes, reloc + 8, &0x10u32.to_le_bytes());
        put(&mut bytes, reloc + 12, &0x2000u32.to_le_bytes());
        put(&mut bytes, reloc + 16, &0x200u32.to_le_bytes());
        put(&mut bytes, reloc + 20, &0x400u32.to_le_bytes());
        put(&mut bytes, reloc + 36, &0x4200_0040u32.to_le_bytes());
        put(&mut bytes, 0x200, &[0xc3]);
        bytes
    }

    #[test]
    fn runtime_driver_headers() {
        let image = read_pe_header(&pe_runtime_driver()).unwrap();
        assert_eq!(image.info.machine, MachineType::Amd64);
        assert!(image.info.is_runtime_driver());
        assert_eq!(image.info.image_base, 0x10000);
        assert_eq!(image.entry_point, 0x11010);
        assert_eq!(image.segments.len(), 1);
        let text = &image.segments[0];
        assert_eq!(text.name, ".text");
        assert_eq!(text.start, 0x11000);
        assert_eq!(text.bytes.len(), 0x300);
        assert_eq!(text.bytes[0], 0xc3);
        assert!(text.is_code());
        assert!(!text.permissions.write);
    }

    #[test]
    fn invalid_images() {
        assert!(read_pe_header(b"not a PE image").is_err());
        let mut truncated = pe_runtime_driver();
        truncated.truncate(0x300);
        assert!(read_pe_header(&truncated).is_err());
    }
}
