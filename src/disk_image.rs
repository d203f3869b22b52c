use std::fs::{File, OpenOptions};
use std::io::{Error, ErrorKind, Read, Result, Seek, SeekFrom, Write};
use std::collections::HashMap;
use std::path::Path;

/* Supported image containers:

    Raw (.dsk): flat concatenation of sectors in (track, head, sector)
        order, geometry detected from the file size.
    ImageDisk (.imd): comment header, then per-track records with a
        sector numbering map and per-sector status bytes. Read only.
    SIMH Altair: every sector is a 137-byte record on disk, 3-byte
        header + 128 data bytes + 6-byte trailer.

    Sector coordinates everywhere: 0-based track, 0-based head,
    1-based sector (the CP/M convention).
*/

// The CP/M "empty directory" fill byte
pub const FILL_BYTE: u8 = 0xE5;

const SIMH_RECORD_SIZE: u64 = 137;
const SIMH_DATA_OFFSET: u64 = 3;
const SIMH_DATA_SIZE: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskGeometry {
    pub tracks: u32,
    pub heads: u32,
    pub sectors_per_track: u32,
    pub sector_size: usize,
    pub reserved_tracks: u32,
}

impl DiskGeometry {
    pub const fn new(tracks: u32, heads: u32, spt: u32, sector_size: usize, reserved: u32) -> DiskGeometry {
        DiskGeometry {
            tracks,
            heads,
            sectors_per_track: spt,
            sector_size,
            reserved_tracks: reserved,
        }
    }

    pub fn total_sectors(&self) -> u64 {
        self.tracks as u64 * self.heads as u64 * self.sectors_per_track as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_sectors() * self.sector_size as u64
    }

    /// Linear sector index for 0-based track and head, 1-based sector.
    pub fn linear_index(&self, track: u32, head: u32, sector: u32) -> u64 {
        ((track as u64 * self.heads as u64 + head as u64) * self.sectors_per_track as u64)
            + (sector as u64 - 1)
    }

    pub fn check_coords(&self, track: u32, head: u32, sector: u32) -> Result<()> {
        if track >= self.tracks || head >= self.heads || sector < 1 || sector > self.sectors_per_track {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("sector out of range: track {} head {} sector {}", track, head, sector),
            ));
        }
        Ok(())
    }
}

pub const GEOM_SSSD_8INCH: DiskGeometry = DiskGeometry::new(77, 1, 26, 128, 2);
pub const GEOM_DSDD_8INCH: DiskGeometry = DiskGeometry::new(77, 2, 26, 256, 2);
pub const GEOM_SSSD_5INCH: DiskGeometry = DiskGeometry::new(40, 1, 18, 128, 2);
pub const GEOM_APPLE_II: DiskGeometry = DiskGeometry::new(35, 1, 16, 256, 3);
// The SIMH entries match raw files by total size, 137 bytes per record
const GEOM_SIMH_ALTAIR: DiskGeometry = DiskGeometry::new(77, 2, 32, 137, 2);
const GEOM_SIMH_LARGE: DiskGeometry = DiskGeometry::new(254, 1, 32, 137, 2);
const GEOM_ALTAIR_HDF: DiskGeometry = DiskGeometry::new(745, 1, 16, 128, 4);

const KNOWN_GEOMETRIES: [(DiskGeometry, &str); 7] = [
    (GEOM_SSSD_8INCH, "8\" SSSD"),
    (GEOM_DSDD_8INCH, "8\" DSDD"),
    (GEOM_SSSD_5INCH, "5.25\" SSSD"),
    (GEOM_APPLE_II, "Apple II"),
    (GEOM_SIMH_ALTAIR, "SIMH Altair"),
    (GEOM_SIMH_LARGE, "SIMH Large"),
    (GEOM_ALTAIR_HDF, "Altair HDF 1.5MB"),
];

/// Match a raw file size against the geometry table, then fall back to
/// dividing into 128-byte sectors at 26 per track.
pub fn auto_detect_geometry(file_size: u64) -> Option<DiskGeometry> {
    for (geom, _name) in &KNOWN_GEOMETRIES {
        if geom.total_bytes() == file_size {
            return Some(*geom);
        }
    }
    if file_size > 0 && file_size % 128 == 0 {
        let total_sectors = file_size / 128;
        if total_sectors % 26 == 0 {
            return Some(DiskGeometry::new((total_sectors / 26) as u32, 1, 26, 128, 2));
        }
    }
    None
}

fn is_simh_sized(file_size: u64) -> bool {
    if file_size == 0 || file_size % SIMH_RECORD_SIZE != 0 {
        return false;
    }
    let total_sectors = file_size / SIMH_RECORD_SIZE;
    total_sectors % 32 == 0 && total_sectors >= 32
}

/// Open a file read-write, falling back to read-only.
fn open_rw_or_ro(path: &str, read_only: bool) -> Result<(File, bool)> {
    if !read_only {
        if let Ok(file) = OpenOptions::new().read(true).write(true).open(path) {
            return Ok((file, false));
        }
    }
    let file = OpenOptions::new().read(true).open(path)?;
    Ok((file, true))
}

fn read_only_error(path: &str) -> Error {
    Error::new(ErrorKind::PermissionDenied, format!("{}: image is read-only", path))
}

//=============================================================================
// Raw sector image
//=============================================================================

pub struct RawImage {
    file: File,
    path: String,
    geometry: DiskGeometry,
    read_only: bool,
}

impl RawImage {
    pub fn open(path: &str, read_only: bool) -> Result<RawImage> {
        let (file, read_only) = open_rw_or_ro(path, read_only)?;
        let size = file.metadata()?.len();
        let geometry = auto_detect_geometry(size).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("{}: unrecognized raw image size {} bytes", path, size),
            )
        })?;
        Ok(RawImage {
            file,
            path: path.to_string(),
            geometry,
            read_only,
        })
    }

    /// Open with a caller-supplied geometry, skipping size detection.
    /// Used for hard-disk slice images addressed linearly.
    pub fn open_with_geometry(path: &str, geometry: DiskGeometry, read_only: bool) -> Result<RawImage> {
        let (file, read_only) = open_rw_or_ro(path, read_only)?;
        Ok(RawImage {
            file,
            path: path.to_string(),
            geometry,
            read_only,
        })
    }

    fn sector_offset(&self, track: u32, head: u32, sector: u32) -> u64 {
        self.geometry.linear_index(track, head, sector) * self.geometry.sector_size as u64
    }

    fn read_sector(&mut self, track: u32, head: u32, sector: u32) -> Result<Vec<u8>> {
        self.geometry.check_coords(track, head, sector)?;
        self.file.seek(SeekFrom::Start(self.sector_offset(track, head, sector)))?;
        let mut buffer = vec![FILL_BYTE; self.geometry.sector_size];
        read_up_to(&mut self.file, &mut buffer)?;
        Ok(buffer)
    }

    fn write_sector(&mut self, track: u32, head: u32, sector: u32, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(read_only_error(&self.path));
        }
        self.geometry.check_coords(track, head, sector)?;
        self.file.seek(SeekFrom::Start(self.sector_offset(track, head, sector)))?;
        self.file.write_all(&data[..self.geometry.sector_size.min(data.len())])?;
        self.file.flush()
    }
}

/// Read into the whole buffer, leaving the tail untouched on a short read.
fn read_up_to(file: &mut File, buffer: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buffer.len() {
        match file.read(&mut buffer[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

//=============================================================================
// ImageDisk (.IMD)
//=============================================================================

struct ImdTrack {
    sector_map: Vec<u8>,
    data: Vec<Vec<u8>>,
}

pub struct ImdImage {
    path: String,
    comment: String,
    geometry: DiskGeometry,
    // Indexed by cylinder * 2 + head
    tracks: HashMap<u32, ImdTrack>,
}

fn imd_sector_size(code: u8) -> usize {
    match code {
        0 => 128,
        1 => 256,
        2 => 512,
        3 => 1024,
        4 => 2048,
        5 => 4096,
        6 => 8192,
        _ => 128,
    }
}

impl ImdImage {
    pub fn open(path: &str) -> Result<ImdImage> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        Self::parse(&data, path)
    }

    pub fn parse(data: &[u8], path: &str) -> Result<ImdImage> {
        // ASCII comment terminated by 0x1A
        let comment_end = data
            .iter()
            .position(|&b| b == 0x1A)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "IMD: missing comment terminator"))?;
        let comment = String::from_utf8_lossy(&data[..comment_end]).into_owned();
        let mut pos = comment_end + 1;

        let mut tracks = HashMap::new();
        let mut max_cylinder = 0u32;
        let mut max_head = 0u32;
        let mut max_sectors = 0u32;
        let mut sector_size = 0usize;

        while pos < data.len() {
            let header = take(data, &mut pos, 5)?;
            let _mode = header[0];
            let cylinder = header[1] as u32;
            let head_flags = header[2];
            let sector_count = header[3] as usize;
            let this_size = imd_sector_size(header[4]);
            let physical_head = (head_flags & 0x01) as u32;

            let sector_map = take(data, &mut pos, sector_count)?.to_vec();
            if head_flags & 0x80 != 0 {
                take(data, &mut pos, sector_count)?; // cylinder map, unused
            }
            if head_flags & 0x40 != 0 {
                take(data, &mut pos, sector_count)?; // head map, unused
            }

            let mut sectors = Vec::with_capacity(sector_count);
            for _ in 0..sector_count {
                let status = take(data, &mut pos, 1)?[0];
                let payload = match status {
                    0x00 => vec![FILL_BYTE; this_size],
                    // Normal data, with deleted/error variants
                    0x01 | 0x03 | 0x05 | 0x07 => take(data, &mut pos, this_size)?.to_vec(),
                    // Compressed: one byte repeated to the sector size
                    0x02 | 0x04 | 0x06 | 0x08 => {
                        let fill = take(data, &mut pos, 1)?[0];
                        vec![fill; this_size]
                    }
                    other => {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            format!("IMD: unknown sector status 0x{:02x}", other),
                        ));
                    }
                };
                sectors.push(payload);
            }

            if cylinder > max_cylinder {
                max_cylinder = cylinder;
            }
            if physical_head > max_head {
                max_head = physical_head;
            }
            if sector_count as u32 > max_sectors {
                max_sectors = sector_count as u32;
            }
            if sector_size == 0 {
                sector_size = this_size;
            }

            tracks.insert(
                cylinder * 2 + physical_head,
                ImdTrack {
                    sector_map,
                    data: sectors,
                },
            );
        }

        Ok(ImdImage {
            path: path.to_string(),
            comment,
            geometry: DiskGeometry::new(
                max_cylinder + 1,
                max_head + 1,
                max_sectors,
                if sector_size > 0 { sector_size } else { 128 },
                2,
            ),
            tracks,
        })
    }

    #[allow(dead_code)]
    pub fn comment(&self) -> &str {
        &self.comment
    }

    fn read_sector(&self, track: u32, head: u32, sector: u32) -> Result<Vec<u8>> {
        let size = self.geometry.sector_size;
        let record = match self.tracks.get(&(track * 2 + head)) {
            Some(record) => record,
            // Track absent from the image: not an error, empty fill
            None => return Ok(vec![FILL_BYTE; size]),
        };
        let index = match record.sector_map.iter().position(|&id| id as u32 == sector) {
            Some(index) => index,
            None => return Ok(vec![FILL_BYTE; size]),
        };
        let mut buffer = vec![FILL_BYTE; size];
        let payload = &record.data[index];
        let n = payload.len().min(size);
        buffer[..n].copy_from_slice(&payload[..n]);
        Ok(buffer)
    }
}

fn take<'a>(data: &'a [u8], pos: &mut usize, count: usize) -> Result<&'a [u8]> {
    if *pos + count > data.len() {
        return Err(Error::new(ErrorKind::UnexpectedEof, "IMD: truncated file"));
    }
    let slice = &data[*pos..*pos + count];
    *pos += count;
    Ok(slice)
}

//=============================================================================
// SIMH Altair 137-byte-sectored image
//=============================================================================

pub struct SimhImage {
    file: File,
    path: String,
    geometry: DiskGeometry,
    read_only: bool,
}

impl SimhImage {
    pub fn open(path: &str, read_only: bool) -> Result<SimhImage> {
        let (file, read_only) = open_rw_or_ro(path, read_only)?;
        let size = file.metadata()?.len();
        if !is_simh_sized(size) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("{}: not a SIMH 137-byte-sectored image ({} bytes)", path, size),
            ));
        }
        let total_sectors = size / SIMH_RECORD_SIZE;
        Ok(SimhImage {
            file,
            path: path.to_string(),
            geometry: DiskGeometry::new((total_sectors / 32) as u32, 1, 32, SIMH_DATA_SIZE, 6),
            read_only,
        })
    }

    fn record_offset(&self, track: u32, head: u32, sector: u32) -> u64 {
        self.geometry.linear_index(track, head, sector) * SIMH_RECORD_SIZE
    }

    fn read_sector(&mut self, track: u32, head: u32, sector: u32) -> Result<Vec<u8>> {
        self.geometry.check_coords(track, head, sector)?;
        let offset = self.record_offset(track, head, sector);
        self.file.seek(SeekFrom::Start(offset + SIMH_DATA_OFFSET))?;
        let mut buffer = vec![FILL_BYTE; SIMH_DATA_SIZE];
        read_up_to(&mut self.file, &mut buffer)?;
        Ok(buffer)
    }

    /// Read-modify-write of the full 137-byte record so the on-disk
    /// header and trailer bytes survive.
    fn write_sector(&mut self, track: u32, head: u32, sector: u32, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(read_only_error(&self.path));
        }
        self.geometry.check_coords(track, head, sector)?;
        let offset = self.record_offset(track, head, sector);

        let mut record = [0u8; SIMH_RECORD_SIZE as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        let n = read_up_to(&mut self.file, &mut record)?;
        if n < SIMH_RECORD_SIZE as usize {
            // Fresh record: synthesize the header
            record = [0u8; SIMH_RECORD_SIZE as usize];
            record[0] = track as u8;
            record[1] = sector as u8;
        }
        let count = SIMH_DATA_SIZE.min(data.len());
        record[SIMH_DATA_OFFSET as usize..SIMH_DATA_OFFSET as usize + count]
            .copy_from_slice(&data[..count]);

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&record)?;
        self.file.flush()
    }
}

//=============================================================================
// In-memory image (front-ends that load disk bytes directly)
//=============================================================================

pub struct MemImage {
    name: String,
    content: Vec<u8>,
    geometry: DiskGeometry,
}

impl MemImage {
    pub fn from_bytes(name: &str, content: Vec<u8>) -> Result<MemImage> {
        let geometry = auto_detect_geometry(content.len() as u64).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("{}: unrecognized image size {} bytes", name, content.len()),
            )
        })?;
        Ok(MemImage {
            name: name.to_string(),
            content,
            geometry,
        })
    }

    pub fn with_geometry(name: &str, content: Vec<u8>, geometry: DiskGeometry) -> MemImage {
        MemImage {
            name: name.to_string(),
            content,
            geometry,
        }
    }

    fn read_sector(&self, track: u32, head: u32, sector: u32) -> Result<Vec<u8>> {
        self.geometry.check_coords(track, head, sector)?;
        let size = self.geometry.sector_size;
        let offset = (self.geometry.linear_index(track, head, sector) * size as u64) as usize;
        let mut buffer = vec![FILL_BYTE; size];
        if offset < self.content.len() {
            let n = size.min(self.content.len() - offset);
            buffer[..n].copy_from_slice(&self.content[offset..offset + n]);
        }
        Ok(buffer)
    }

    fn write_sector(&mut self, track: u32, head: u32, sector: u32, data: &[u8]) -> Result<()> {
        self.geometry.check_coords(track, head, sector)?;
        let size = self.geometry.sector_size;
        let offset = (self.geometry.linear_index(track, head, sector) * size as u64) as usize;
        if offset + size > self.content.len() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("{}: write past end of in-memory image", self.name),
            ));
        }
        let count = size.min(data.len());
        self.content[offset..offset + count].copy_from_slice(&data[..count]);
        Ok(())
    }
}

//=============================================================================
// Polymorphic front
//=============================================================================

pub enum DiskImage {
    Raw(RawImage),
    Imd(ImdImage),
    Simh(SimhImage),
    Mem(MemImage),
}

impl DiskImage {
    /// Open an image file, picking the backend from the extension and a
    /// file-size sniff: .imd is ImageDisk, a 137-byte-record size is
    /// SIMH, everything else is raw.
    pub fn open(path: &str, read_only: bool) -> Result<DiskImage> {
        let ext = Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if ext == "imd" {
            return Ok(DiskImage::Imd(ImdImage::open(path)?));
        }
        let size = std::fs::metadata(path)?.len();
        if is_simh_sized(size) {
            return Ok(DiskImage::Simh(SimhImage::open(path, read_only)?));
        }
        Ok(DiskImage::Raw(RawImage::open(path, read_only)?))
    }

    pub fn geometry(&self) -> &DiskGeometry {
        match self {
            DiskImage::Raw(img) => &img.geometry,
            DiskImage::Imd(img) => &img.geometry,
            DiskImage::Simh(img) => &img.geometry,
            DiskImage::Mem(img) => &img.geometry,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DiskImage::Raw(img) => &img.path,
            DiskImage::Imd(img) => &img.path,
            DiskImage::Simh(img) => &img.path,
            DiskImage::Mem(img) => &img.name,
        }
    }

    pub fn is_read_only(&self) -> bool {
        match self {
            DiskImage::Raw(img) => img.read_only,
            DiskImage::Imd(_) => true,
            DiskImage::Simh(img) => img.read_only,
            DiskImage::Mem(_) => false,
        }
    }

    pub fn read_sector(&mut self, track: u32, head: u32, sector: u32) -> Result<Vec<u8>> {
        match self {
            DiskImage::Raw(img) => img.read_sector(track, head, sector),
            DiskImage::Imd(img) => img.read_sector(track, head, sector),
            DiskImage::Simh(img) => img.read_sector(track, head, sector),
            DiskImage::Mem(img) => img.read_sector(track, head, sector),
        }
    }

    pub fn write_sector(&mut self, track: u32, head: u32, sector: u32, data: &[u8]) -> Result<()> {
        match self {
            DiskImage::Raw(img) => img.write_sector(track, head, sector, data),
            DiskImage::Imd(img) => Err(read_only_error(&img.path)),
            DiskImage::Simh(img) => img.write_sector(track, head, sector, data),
            DiskImage::Mem(img) => img.write_sector(track, head, sector, data),
        }
    }

    pub fn info(&self) -> String {
        let g = self.geometry();
        format!(
            "{} ({} tracks, {} heads, {} sectors/track, {} bytes/sector{})",
            self.name(),
            g.tracks,
            g.heads,
            g.sectors_per_track,
            g.sector_size,
            if self.is_read_only() { ", read-only" } else { "" }
        )
    }
}

//=============================================================================
// Hard-disk slice validation (RomWBW hd1k / hd512 layouts)
//=============================================================================

pub const HD1K_SINGLE_SIZE: u64 = 8 * 1024 * 1024;
pub const HD1K_PREFIX_SIZE: u64 = 1024 * 1024;
pub const HD512_SINGLE_SIZE: u64 = 8_716_288;

const PART_TYPE_ROMWBW: u8 = 0x2E;
const PART_TYPES_FAT: [u8; 4] = [0x06, 0x0B, 0x0C, 0x0E];

/// Geometry used for linearly addressed hard-disk units.
pub fn hd_geometry(size: u64) -> DiskGeometry {
    let tracks = (size / (512 * 16 * 16)).max(1) as u32;
    DiskGeometry::new(tracks, 16, 16, 512, 0)
}

/// A valid hard-disk image size: a single 8MB hd1k slice, a combo
/// image (1MB prefix plus whole slices), or hd512 slices.
pub fn is_hd_sized(size: u64) -> bool {
    size == HD1K_SINGLE_SIZE
        || (size > HD1K_PREFIX_SIZE && (size - HD1K_PREFIX_SIZE) % HD1K_SINGLE_SIZE == 0)
        || (size > 0 && size % HD512_SINGLE_SIZE == 0)
}

/// Validate a hard-disk image size. Returns the size, or a description
/// of why it is invalid.
pub fn validate_hd_image(path: &str) -> std::result::Result<u64, String> {
    let size = std::fs::metadata(path)
        .map_err(|e| format!("{}: {}", path, e))?
        .len();

    if size == HD1K_SINGLE_SIZE {
        if let Some(warning) = check_hd1k_mbr(path) {
            eprintln!("[DISK] {}: {}", path, warning);
        }
        return Ok(size);
    }
    if is_hd_sized(size) {
        return Ok(size);
    }
    Err(format!(
        "{}: invalid disk size {} (must be 8MB hd1k or 8.32MB hd512 slices)",
        path, size
    ))
}

/// Single-slice hd1k images sometimes carry a stale FAT MBR. Warn when
/// the MBR names no RomWBW partition and the first byte is not Z80
/// boot code (JR or JP).
fn check_hd1k_mbr(path: &str) -> Option<String> {
    let mut mbr = [0u8; 512];
    let mut file = File::open(path).ok()?;
    file.read_exact(&mut mbr).ok()?;
    check_mbr(&mbr)
}

pub fn check_mbr(mbr: &[u8; 512]) -> Option<String> {
    if mbr[510] != 0x55 || mbr[511] != 0xAA {
        return None; // no MBR, probably a raw slice
    }
    let mut has_romwbw = false;
    let mut has_fat = false;
    for p in 0..4 {
        let ptype = mbr[0x1BE + p * 16 + 4];
        if ptype == PART_TYPE_ROMWBW {
            has_romwbw = true;
        }
        if PART_TYPES_FAT.contains(&ptype) {
            has_fat = true;
        }
    }
    if has_romwbw {
        return None;
    }
    if has_fat {
        return Some(
            "WARNING: disk has FAT MBR but no RomWBW partition - may not work correctly".to_string(),
        );
    }
    if mbr[0] == 0x18 || mbr[0] == 0xC3 {
        return None; // Z80 boot code with a stale MBR signature
    }
    Some("WARNING: disk has MBR but no RomWBW partition (0x2E) - format may be invalid".to_string())
}

//=============================================================================
// Sector translation helpers
//=============================================================================

/// Standard 8" SSSD software skew (factor 6), as published in the XLT.
pub const SKEW_8INCH: [u8; 26] = [
    1, 7, 13, 19, 25, 5, 11, 17, 23, 3, 9, 15, 21,
    2, 8, 14, 20, 26, 6, 12, 18, 24, 4, 10, 16, 22,
];

/// Build a logical-to-physical translation table from a skew factor.
/// Physical slots step by `skew` modulo the track size, bumping past
/// already-assigned slots when the stepping collides.
#[allow(dead_code)]
pub fn build_skew_table(sectors: usize, first: u8, skew: usize) -> Vec<u8> {
    if skew == 0 {
        return (0..sectors).map(|i| i as u8 + first).collect();
    }
    let mut table = vec![0u8; sectors];
    let mut used = vec![false; sectors];
    let mut pos = 0usize;
    for entry in table.iter_mut() {
        while used[pos] {
            pos = (pos + 1) % sectors;
        }
        used[pos] = true;
        *entry = pos as u8 + first;
        pos = (pos + skew) % sectors;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> String {
        let mut path = std::env::temp_dir();
        path.push(format!("izcpm22_{}_{}", std::process::id(), name));
        path.to_string_lossy().into_owned()
    }

    fn write_temp(name: &str, content: &[u8]) -> String {
        let path = temp_path(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    #[test]
    fn raw_linear_offsets() {
        // 8" SSSD sized image with a recognizable byte per sector
        let geom = GEOM_SSSD_8INCH;
        let mut content = vec![0u8; geom.total_bytes() as usize];
        for (i, chunk) in content.chunks_mut(128).enumerate() {
            chunk[0] = (i % 251) as u8;
        }
        let path = write_temp("raw_linear.dsk", &content);

        let mut img = DiskImage::open(&path, true).unwrap();
        assert!(matches!(img, DiskImage::Raw(_)));
        assert_eq!(*img.geometry(), geom);
        for &(track, sector) in &[(0u32, 1u32), (0, 26), (1, 1), (76, 26), (40, 13)] {
            let index = geom.linear_index(track, 0, sector);
            let payload = img.read_sector(track, 0, sector).unwrap();
            assert_eq!(payload[0], (index % 251) as u8, "track {} sector {}", track, sector);
            assert_eq!(payload.len(), 128);
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn raw_short_read_fills_e5() {
        // Truncate the file one sector early
        let geom = GEOM_SSSD_8INCH;
        let content = vec![0x11u8; geom.total_bytes() as usize];
        let path = write_temp("raw_short.dsk", &content);
        {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.set_len(geom.total_bytes() - 64).unwrap();
        }
        // Size no longer matches: open with explicit geometry
        let mut img =
            DiskImage::Raw(RawImage::open_with_geometry(&path, geom, true).unwrap());
        let payload = img.read_sector(76, 0, 26).unwrap();
        assert_eq!(&payload[..64], &[0x11u8; 64][..]);
        assert_eq!(&payload[64..], &[FILL_BYTE; 64][..]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn raw_rejects_unrecognized_size() {
        let path = write_temp("raw_bad.dsk", &[0u8; 1000]);
        assert!(RawImage::open(&path, true).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn raw_out_of_range_coords() {
        let content = vec![0u8; GEOM_SSSD_8INCH.total_bytes() as usize];
        let path = write_temp("raw_range.dsk", &content);
        let mut img = DiskImage::open(&path, true).unwrap();
        assert!(img.read_sector(77, 0, 1).is_err());
        assert!(img.read_sector(0, 1, 1).is_err());
        assert!(img.read_sector(0, 0, 0).is_err());
        assert!(img.read_sector(0, 0, 27).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    fn build_imd(sectors: &[(u8, u8, &[u8])]) -> Vec<u8> {
        // One cylinder, one head, 128-byte sectors.
        // sectors: (id, status, payload-or-fill)
        let mut data = Vec::new();
        data.extend_from_slice(b"IMD 1.18: test image\r\n");
        data.push(0x1A);
        data.push(0x00); // mode
        data.push(0x00); // cylinder
        data.push(0x00); // head, no optional maps
        data.push(sectors.len() as u8);
        data.push(0x00); // size code 0 = 128
        for (id, _, _) in sectors {
            data.push(*id);
        }
        for (_, status, payload) in sectors {
            data.push(*status);
            data.extend_from_slice(payload);
        }
        data
    }

    #[test]
    fn imd_compressed_sector_expands() {
        let normal = [0x23u8; 128];
        let data = build_imd(&[(1, 0x02, &[0x5A]), (2, 0x01, &normal)]);
        let mut img = ImdImage::parse(&data, "test.imd").unwrap();
        assert_eq!(img.geometry.sector_size, 128);
        assert_eq!(img.geometry.sectors_per_track, 2);

        let payload = img.read_sector(0, 0, 1).unwrap();
        assert_eq!(payload, vec![0x5A; 128]);
        let payload = img.read_sector(0, 0, 2).unwrap();
        assert_eq!(payload, normal.to_vec());
        // Absent sector and absent track both fill with 0xE5
        assert_eq!(img.read_sector(0, 0, 9).unwrap(), vec![FILL_BYTE; 128]);
        assert_eq!(img.read_sector(5, 0, 1).unwrap(), vec![FILL_BYTE; 128]);
        // Writes are refused
        let mut img = DiskImage::Imd(img);
        assert!(img.write_sector(0, 0, 1, &[0u8; 128]).is_err());
    }

    #[test]
    fn imd_unavailable_sector_fills() {
        let data = build_imd(&[(1, 0x00, &[])]);
        let mut img = ImdImage::parse(&data, "test.imd").unwrap();
        assert_eq!(img.read_sector(0, 0, 1).unwrap(), vec![FILL_BYTE; 128]);
    }

    #[test]
    fn imd_truncated_fails() {
        let mut data = build_imd(&[(1, 0x01, &[0u8; 128])]);
        data.truncate(data.len() - 10);
        assert!(ImdImage::parse(&data, "test.imd").is_err());
        assert!(ImdImage::parse(b"no terminator here", "test.imd").is_err());
    }

    #[test]
    fn simh_write_preserves_record_framing() {
        // One track of 32 SIMH records with marked headers and trailers
        let mut content = Vec::new();
        for sector in 0..32u8 {
            let mut record = [0u8; 137];
            record[0] = 0; // track
            record[1] = sector + 1;
            record[2] = 0xEE;
            for b in record[3..131].iter_mut() {
                *b = 0x42;
            }
            for b in record[131..].iter_mut() {
                *b = 0x99;
            }
            content.extend_from_slice(&record);
        }
        let path = write_temp("simh.dsk", &content);

        let mut img = DiskImage::open(&path, false).unwrap();
        assert!(matches!(img, DiskImage::Simh(_)));
        assert_eq!(img.geometry().sector_size, 128);
        assert_eq!(img.geometry().sectors_per_track, 32);
        assert_eq!(img.geometry().reserved_tracks, 6);

        img.write_sector(0, 0, 5, &[0x77u8; 128]).unwrap();
        drop(img);

        let mut reread = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut reread).unwrap();
        let record = &reread[4 * 137..5 * 137];
        assert_eq!(record[0], 0); // header untouched
        assert_eq!(record[1], 5);
        assert_eq!(record[2], 0xEE);
        assert_eq!(&record[3..131], &[0x77u8; 128][..]);
        assert_eq!(&record[131..137], &[0x99u8; 6][..]); // trailer untouched
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn selection_policy_by_extension_and_size() {
        let imd = build_imd(&[(1, 0x02, &[0x00])]);
        let path = write_temp("select.imd", &imd);
        assert!(matches!(DiskImage::open(&path, true).unwrap(), DiskImage::Imd(_)));
        std::fs::remove_file(&path).unwrap();

        let raw = vec![0u8; GEOM_SSSD_5INCH.total_bytes() as usize];
        let path = write_temp("select.dsk", &raw);
        assert!(matches!(DiskImage::open(&path, true).unwrap(), DiskImage::Raw(_)));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn geometry_detection_table() {
        assert_eq!(auto_detect_geometry(256_256), Some(GEOM_SSSD_8INCH));
        assert_eq!(auto_detect_geometry(35 * 16 * 256), Some(GEOM_APPLE_II));
        // 128-byte 26-sector fallback
        let geom = auto_detect_geometry(26 * 128 * 10).unwrap();
        assert_eq!(geom.tracks, 10);
        assert_eq!(geom.sectors_per_track, 26);
        assert_eq!(auto_detect_geometry(1001), None);
    }

    #[test]
    fn mbr_checks() {
        let mut mbr = [0u8; 512];
        // No signature: fine
        assert!(check_mbr(&mbr).is_none());
        // Signature with a RomWBW partition: fine
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        mbr[0x1BE + 4] = 0x2E;
        assert!(check_mbr(&mbr).is_none());
        // FAT partition only: warn
        mbr[0x1BE + 4] = 0x0C;
        assert!(check_mbr(&mbr).unwrap().contains("FAT"));
        // No partitions but Z80 boot code: fine
        mbr[0x1BE + 4] = 0x00;
        mbr[0] = 0xC3;
        assert!(check_mbr(&mbr).is_none());
        mbr[0] = 0x00;
        assert!(check_mbr(&mbr).is_some());
    }

    #[test]
    fn hd_slice_sizes() {
        assert!(is_hd_sized(HD1K_SINGLE_SIZE));
        assert!(is_hd_sized(HD1K_PREFIX_SIZE + 3 * HD1K_SINGLE_SIZE));
        assert!(is_hd_sized(HD512_SINGLE_SIZE));
        assert!(is_hd_sized(2 * HD512_SINGLE_SIZE));
        assert!(!is_hd_sized(HD1K_SINGLE_SIZE - 512));
        let g = hd_geometry(HD1K_SINGLE_SIZE);
        assert_eq!(g.total_bytes(), HD1K_SINGLE_SIZE);
    }

    #[test]
    fn skew_table_matches_8inch_standard() {
        assert_eq!(build_skew_table(26, 1, 6), SKEW_8INCH.to_vec());
        assert_eq!(build_skew_table(4, 1, 0), vec![1, 2, 3, 4]);
    }
}
