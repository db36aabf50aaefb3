//! Partition table parsing
//!
//! MBR: four 16-byte entries at offset 446 of sector 0, gated by the
//! 0x55AA boot signature. GPT: header at LBA 1 (backup at the last LBA),
//! CRC-verified per the UEFI specification, with the entry array read from
//! wherever the header points.

use log::warn;

use crate::error::{DriverError, DriverResult};
use super::crc32::crc32;

/// One discovered partition. `end_lba` is inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// 1-based partition number
    pub number: usize,
    pub start_lba: u64,
    pub end_lba: u64,
    /// MBR type byte ("0x83") or GPT type GUID
    pub type_tag: String,
    pub name: String,
}

const MBR_ENTRY_OFFSET: usize = 446;
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_MIN_HEADER_SIZE: u32 = 92;
const GPT_MIN_ENTRY_SIZE: u32 = 128;
const GPT_MAX_ENTRIES: u32 = 1024;

/// Sector reader the GPT parser pulls additional sectors through.
pub type SectorReader<'a> = dyn FnMut(u64, &mut [u8]) -> DriverResult<()> + 'a;

// ============================================================================
// MBR
// ============================================================================

/// Boot signature 0x55AA at offsets 510/511.
pub fn has_boot_signature(sector0: &[u8]) -> bool {
    sector0.len() >= 512 && sector0[510] == 0x55 && sector0[511] == 0xAA
}

/// True when any MBR slot carries the GPT protective type (0xEE).
pub fn has_protective_entry(sector0: &[u8]) -> bool {
    (0..4).any(|i| {
        let off = MBR_ENTRY_OFFSET + i * 16;
        sector0.len() >= off + 16 && sector0[off + 4] == MBR_TYPE_GPT_PROTECTIVE
    })
}

/// Parse the four MBR slots of sector 0. Empty slots (type 0) are skipped;
/// partition numbers stay 1-based slot indices.
pub fn parse_mbr(sector0: &[u8]) -> DriverResult<Vec<Partition>> {
    if !has_boot_signature(sector0) {
        return Err(DriverError::NotFound("no valid partition table".into()));
    }

    let mut partitions = Vec::new();
    for i in 0..4 {
        let off = MBR_ENTRY_OFFSET + i * 16;
        let entry = &sector0[off..off + 16];

        let part_type = entry[4];
        if part_type == 0 {
            continue;
        }

        let start_lba = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]) as u64;
        let sector_count = u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]) as u64;
        if sector_count == 0 {
            continue;
        }

        partitions.push(Partition {
            number: i + 1,
            start_lba,
            end_lba: start_lba + sector_count - 1,
            type_tag: format!("0x{:02x}", part_type),
            name: format!("partition{}", i + 1),
        });
    }
    Ok(partitions)
}

// ============================================================================
// GPT
// ============================================================================

#[derive(Debug, Clone)]
struct GptHeader {
    current_lba: u64,
    backup_lba: u64,
    entries_lba: u64,
    entry_count: u32,
    entry_size: u32,
    entries_crc: u32,
}

/// GPT sector 1 signature check, used to pick GPT over MBR on rescan.
pub fn has_gpt_signature(sector1: &[u8]) -> bool {
    sector1.len() >= 8 && &sector1[0..8] == GPT_SIGNATURE
}

fn parse_gpt_header(sector: &[u8], expected_lba: u64) -> DriverResult<GptHeader> {
    if !has_gpt_signature(sector) {
        return Err(DriverError::NotFound("GPT signature missing".into()));
    }

    let header_size = u32::from_le_bytes(sector[12..16].try_into().unwrap());
    if header_size < GPT_MIN_HEADER_SIZE || header_size as usize > sector.len() {
        return Err(DriverError::NotFound(format!(
            "implausible GPT header size {}",
            header_size
        )));
    }

    // The header CRC is computed with its own field zeroed.
    let stored_crc = u32::from_le_bytes(sector[16..20].try_into().unwrap());
    let mut image = sector[..header_size as usize].to_vec();
    image[16..20].fill(0);
    if crc32(&image) != stored_crc {
        return Err(DriverError::NotFound("GPT header CRC mismatch".into()));
    }

    let header = GptHeader {
        current_lba: u64::from_le_bytes(sector[24..32].try_into().unwrap()),
        backup_lba: u64::from_le_bytes(sector[32..40].try_into().unwrap()),
        entries_lba: u64::from_le_bytes(sector[72..80].try_into().unwrap()),
        entry_count: u32::from_le_bytes(sector[80..84].try_into().unwrap()),
        entry_size: u32::from_le_bytes(sector[84..88].try_into().unwrap()),
        entries_crc: u32::from_le_bytes(sector[88..92].try_into().unwrap()),
    };

    if header.current_lba != expected_lba {
        return Err(DriverError::NotFound(format!(
            "GPT header claims LBA {}, read from {}",
            header.current_lba, expected_lba
        )));
    }
    if header.entry_size < GPT_MIN_ENTRY_SIZE || header.entry_count > GPT_MAX_ENTRIES {
        return Err(DriverError::NotFound(format!(
            "implausible GPT entry layout ({} x {})",
            header.entry_count, header.entry_size
        )));
    }
    Ok(header)
}

/// Parse a GPT disk: primary header at LBA 1, falling back to the backup
/// header at the last LBA when the primary is damaged. The entry array CRC
/// must match in either case.
pub fn parse_gpt(
    read_sector: &mut SectorReader<'_>,
    sector_size: u32,
    capacity: u64,
) -> DriverResult<Vec<Partition>> {
    let mut sector = vec![0u8; sector_size as usize];
    read_sector(1, &mut sector)?;

    let header = match parse_gpt_header(&sector, 1) {
        Ok(header) => header,
        Err(primary_err) => {
            if capacity < 2 {
                return Err(primary_err);
            }
            warn!("primary GPT header invalid ({}), trying backup", primary_err);
            read_sector(capacity - 1, &mut sector)?;
            parse_gpt_header(&sector, capacity - 1)?
        }
    };

    let total = header.entry_count as usize * header.entry_size as usize;
    let nsectors = (total as u64).div_ceil(sector_size as u64);
    if header.entries_lba == 0 || header.entries_lba + nsectors > capacity {
        return Err(DriverError::NotFound("GPT entry array out of range".into()));
    }

    let mut array = vec![0u8; (nsectors * sector_size as u64) as usize];
    for i in 0..nsectors {
        let off = (i * sector_size as u64) as usize;
        read_sector(header.entries_lba + i, &mut array[off..off + sector_size as usize])?;
    }
    if crc32(&array[..total]) != header.entries_crc {
        return Err(DriverError::NotFound("GPT entry array CRC mismatch".into()));
    }

    let mut partitions = Vec::new();
    for idx in 0..header.entry_count as usize {
        let entry = &array[idx * header.entry_size as usize..(idx + 1) * header.entry_size as usize];
        let type_guid = &entry[0..16];
        if type_guid.iter().all(|&b| b == 0) {
            continue;
        }

        let first_lba = u64::from_le_bytes(entry[32..40].try_into().unwrap());
        let last_lba = u64::from_le_bytes(entry[40..48].try_into().unwrap());
        if last_lba < first_lba {
            continue;
        }

        partitions.push(Partition {
            number: idx + 1,
            start_lba: first_lba,
            end_lba: last_lba,
            type_tag: format_guid(type_guid),
            name: decode_utf16_name(&entry[56..header.entry_size.min(128) as usize]),
        });
    }

    // Ignore header.backup_lba here: the backup was only needed if the
    // primary failed verification above.
    let _ = header.backup_lba;
    Ok(partitions)
}

/// UEFI mixed-endian GUID text form: the first three fields are
/// little-endian, the rest is byte order.
fn format_guid(guid: &[u8]) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        u32::from_le_bytes(guid[0..4].try_into().unwrap()),
        u16::from_le_bytes(guid[4..6].try_into().unwrap()),
        u16::from_le_bytes(guid[6..8].try_into().unwrap()),
        guid[8], guid[9], guid[10], guid[11], guid[12], guid[13], guid[14], guid[15],
    )
}

/// GPT partition names are UTF-16LE, NUL-terminated within 72 bytes.
fn decode_utf16_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mbr_sector(entries: &[(u8, u32, u32)]) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        for (i, &(ptype, start, count)) in entries.iter().enumerate() {
            let off = MBR_ENTRY_OFFSET + i * 16;
            sector[off + 4] = ptype;
            sector[off + 8..off + 12].copy_from_slice(&start.to_le_bytes());
            sector[off + 12..off + 16].copy_from_slice(&count.to_le_bytes());
        }
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test]
    fn test_mbr_single_linux_partition() {
        // Scenario: type 0x83 at LBA 2048, 204800 sectors.
        let sector = mbr_sector(&[(0x83, 2048, 204800)]);
        let parts = parse_mbr(&sector).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].number, 1);
        assert_eq!(parts[0].start_lba, 2048);
        assert_eq!(parts[0].end_lba, 206847);
        assert_eq!(parts[0].type_tag, "0x83");
    }

    #[test]
    fn test_mbr_skips_empty_slots_keeps_numbers() {
        let sector = mbr_sector(&[(0, 0, 0), (0x0C, 64, 1000), (0, 0, 0), (0x83, 2048, 64)]);
        let parts = parse_mbr(&sector).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].number, 2);
        assert_eq!(parts[1].number, 4);
    }

    #[test]
    fn test_mbr_requires_boot_signature() {
        let mut sector = mbr_sector(&[(0x83, 2048, 64)]);
        sector[510] = 0;
        assert!(matches!(parse_mbr(&sector), Err(DriverError::NotFound(_))));
    }

    // ------------------------------------------------------------------
    // GPT fixtures
    // ------------------------------------------------------------------

    const LINUX_FS_GUID: [u8; 16] = [
        0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47,
        0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D, 0xE4,
    ];

    fn utf16_name(name: &str) -> [u8; 72] {
        let mut raw = [0u8; 72];
        for (i, unit) in name.encode_utf16().enumerate() {
            raw[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        raw
    }

    /// Build a whole-disk image carrying a valid GPT.
    fn gpt_disk(capacity: u64) -> Vec<u8> {
        let ss = 512usize;
        let mut disk = vec![0u8; capacity as usize * ss];

        // One entry: "root" from LBA 34 to 2081.
        let mut entry = vec![0u8; 128];
        entry[0..16].copy_from_slice(&LINUX_FS_GUID);
        entry[16..32].copy_from_slice(&[0x11; 16]);
        entry[32..40].copy_from_slice(&34u64.to_le_bytes());
        entry[40..48].copy_from_slice(&2081u64.to_le_bytes());
        entry[56..128].copy_from_slice(&utf16_name("root")[..72]);

        let mut array = vec![0u8; 128 * 128];
        array[..128].copy_from_slice(&entry);
        let entries_crc = crc32(&array);
        disk[2 * ss..2 * ss + array.len()].copy_from_slice(&array);

        // Header at LBA 1.
        let mut header = vec![0u8; 92];
        header[0..8].copy_from_slice(GPT_SIGNATURE);
        header[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes()); // revision
        header[12..16].copy_from_slice(&92u32.to_le_bytes());
        header[24..32].copy_from_slice(&1u64.to_le_bytes()); // current
        header[32..40].copy_from_slice(&(capacity - 1).to_le_bytes()); // backup
        header[40..48].copy_from_slice(&34u64.to_le_bytes()); // first usable
        header[48..56].copy_from_slice(&(capacity - 34).to_le_bytes()); // last usable
        header[72..80].copy_from_slice(&2u64.to_le_bytes()); // entries lba
        header[80..84].copy_from_slice(&128u32.to_le_bytes()); // entry count
        header[84..88].copy_from_slice(&128u32.to_le_bytes()); // entry size
        header[88..92].copy_from_slice(&entries_crc.to_le_bytes());
        let header_crc = crc32(&header);
        header[16..20].copy_from_slice(&header_crc.to_le_bytes());
        disk[ss..ss + 92].copy_from_slice(&header);

        // Backup header at the last LBA, pointing at the same array.
        let mut backup = header.clone();
        backup[16..20].fill(0);
        backup[24..32].copy_from_slice(&(capacity - 1).to_le_bytes());
        backup[32..40].copy_from_slice(&1u64.to_le_bytes());
        let backup_crc = crc32(&backup);
        backup[16..20].copy_from_slice(&backup_crc.to_le_bytes());
        let last = (capacity - 1) as usize * ss;
        disk[last..last + 92].copy_from_slice(&backup);

        // Protective MBR.
        disk[446 + 4] = 0xEE;
        disk[510] = 0x55;
        disk[511] = 0xAA;
        disk
    }

    fn reader(disk: &[u8]) -> impl FnMut(u64, &mut [u8]) -> DriverResult<()> + '_ {
        move |lba, buf: &mut [u8]| {
            let start = lba as usize * 512;
            buf.copy_from_slice(&disk[start..start + buf.len()]);
            Ok(())
        }
    }

    #[test]
    fn test_gpt_parse_valid_disk() {
        let disk = gpt_disk(4096);
        let mut read = reader(&disk);
        let parts = parse_gpt(&mut read, 512, 4096).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].number, 1);
        assert_eq!(parts[0].start_lba, 34);
        assert_eq!(parts[0].end_lba, 2081);
        assert_eq!(parts[0].name, "root");
        assert_eq!(parts[0].type_tag, "0fc63daf-8483-4772-8e79-3d69d8477de4");
    }

    #[test]
    fn test_gpt_backup_header_fallback() {
        let mut disk = gpt_disk(4096);
        // Corrupt the primary header signature.
        disk[512] ^= 0xFF;
        let mut read = reader(&disk);
        let parts = parse_gpt(&mut read, 512, 4096).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name, "root");
    }

    #[test]
    fn test_gpt_both_headers_bad() {
        let mut disk = gpt_disk(4096);
        disk[512] ^= 0xFF;
        let last = 4095 * 512;
        disk[last + 20] ^= 0xFF; // break backup header CRC
        let mut read = reader(&disk);
        assert!(parse_gpt(&mut read, 512, 4096).is_err());
    }

    #[test]
    fn test_gpt_entry_array_crc_checked() {
        let mut disk = gpt_disk(4096);
        disk[2 * 512] ^= 0xFF; // flip a bit in the first entry
        let mut read = reader(&disk);
        assert!(matches!(
            parse_gpt(&mut read, 512, 4096),
            Err(DriverError::NotFound(_))
        ));
    }

    #[test]
    fn test_protective_mbr_detected() {
        let disk = gpt_disk(4096);
        assert!(has_protective_entry(&disk[..512]));
        assert!(has_boot_signature(&disk[..512]));
        assert!(has_gpt_signature(&disk[512..1024]));
    }
}
