use iz80::{Cpu, Reg16, Reg8};

use crate::banked_memory::BankedMemory;
use crate::boot::{self, CpmLayout};
use crate::console::Console;
use crate::disk_image::{DiskGeometry, DiskImage, MemImage, SKEW_8INCH};

/* BIOS area layout, relative to the computed BIOS base:

    +0x000  jump table, 17 entries of 3 bytes       protected
    +0x033  XLT, 26 bytes                           protected
    +0x04d  DPB per drive, 4 x 15 bytes             protected
    +0x089  DPH per drive, 4 x 16 bytes             scratch words, writable
    +0x0c9  DIRBUF, 128 bytes                       writable
    then per-drive CSV and ALV, sized from each drive's DPB.

    Each jump-table entry targets a trap address; the execution loop
    recognizes the trap range and services the call natively.
*/

pub const BIOS_TRAP_BASE: u16 = 0xFF00;
pub const BIOS_FUNC_COUNT: u16 = 17;
pub const MAX_DRIVES: usize = 4;

const JUMP_TABLE_SIZE: u16 = BIOS_FUNC_COUNT * 3;
const XLT_OFFSET: u16 = JUMP_TABLE_SIZE;
const DPB_OFFSET: u16 = XLT_OFFSET + 26;
const DPH_OFFSET: u16 = DPB_OFFSET + (MAX_DRIVES as u16) * 15;
const DIRBUF_OFFSET: u16 = DPH_OFFSET + (MAX_DRIVES as u16) * 16;
const WORK_OFFSET: u16 = DIRBUF_OFFSET + 128;

const BIOS_FUNC_NAMES: [&str; 17] = [
    "BOOT", "WBOOT", "CONST", "CONIN", "CONOUT", "LIST", "PUNCH", "READER", "HOME", "SELDSK",
    "SETTRK", "SETSEC", "SETDMA", "READ", "WRITE", "LISTST", "SECTRAN",
];

/// Disk Parameter Block fields, derived from an image geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dpb {
    pub spt: u16, // 128-byte records per track
    pub bsh: u8,
    pub blm: u8,
    pub exm: u8,
    pub dsm: u16,
    pub drm: u16,
    pub al0: u8,
    pub al1: u8,
    pub cks: u16,
    pub off: u16,
}

impl Dpb {
    pub fn for_geometry(geometry: &DiskGeometry) -> Dpb {
        let records_per_track =
            (geometry.sectors_per_track as usize * geometry.sector_size / 128) as u16;
        let data_tracks = geometry.tracks.saturating_sub(geometry.reserved_tracks) as u64;
        let data_bytes =
            data_tracks * geometry.heads as u64 * records_per_track as u64 * 128;

        // 1Kb blocks while the disk stays under 256 blocks, 2Kb beyond
        let mut block_size = 1024u64;
        if data_bytes / 1024 >= 257 {
            block_size = 2048;
        }
        let dsm = (data_bytes / block_size).saturating_sub(1) as u16;
        let drm: u16 = if dsm < 256 { 63 } else { 255 };

        let bsh = (block_size / 128).trailing_zeros() as u8;
        let blm = (block_size / 128 - 1) as u8;
        let exm = if dsm < 256 {
            (block_size / 1024 - 1) as u8
        } else {
            (block_size / 2048 - 1) as u8
        };

        // Directory allocation bitmap, one bit per block from the top
        let dir_blocks = ((drm as u64 + 1) * 32 / block_size).max(1) as u32;
        let mut al: u16 = 0;
        for bit in 0..dir_blocks.min(16) {
            al |= 0x8000 >> bit;
        }

        Dpb {
            spt: records_per_track,
            bsh,
            blm,
            exm,
            dsm,
            drm,
            al0: (al >> 8) as u8,
            al1: al as u8,
            cks: (drm + 1) / 4,
            off: geometry.reserved_tracks as u16,
        }
    }

    pub fn alv_size(&self) -> u16 {
        self.dsm / 8 + 1
    }

    pub fn write_to(&self, mem: &mut BankedMemory, addr: u16) {
        mem.store16(addr, self.spt);
        mem.store(addr + 2, self.bsh);
        mem.store(addr + 3, self.blm);
        mem.store(addr + 4, self.exm);
        mem.store16(addr + 5, self.dsm);
        mem.store16(addr + 7, self.drm);
        mem.store(addr + 9, self.al0);
        mem.store(addr + 10, self.al1);
        mem.store16(addr + 11, self.cks);
        mem.store16(addr + 13, self.off);
    }
}

pub enum BiosOutcome {
    Continue,
    WaitingForInput,
    Fatal(String),
}

pub struct BiosDispatch {
    drives: [Option<DiskImage>; MAX_DRIVES],
    dph_addr: [u16; MAX_DRIVES],
    current_drive: usize,
    current_track: u32,
    current_sector: u32,
    dma: u16,
    layout: CpmLayout,
    booted: bool,
    memory_loaded: bool,
    saved_system: Vec<u8>,
    pub waiting_for_input: bool,
    /// Write-protect the static BIOS tables: None = off,
    /// Some(true) = fatal violations, Some(false) = dropped writes.
    pub protect_tables: Option<bool>,
    pub trace: bool,
}

impl BiosDispatch {
    pub fn new() -> BiosDispatch {
        BiosDispatch {
            drives: [None, None, None, None],
            dph_addr: [0; MAX_DRIVES],
            current_drive: 0,
            current_track: 0,
            current_sector: 1,
            dma: boot::DEFAULT_DMA,
            layout: CpmLayout::from_ccp(0xDC00),
            booted: false,
            memory_loaded: false,
            saved_system: Vec::new(),
            waiting_for_input: false,
            protect_tables: Some(true),
            trace: false,
        }
    }

    #[allow(dead_code)]
    pub fn layout(&self) -> &CpmLayout {
        &self.layout
    }

    pub fn is_trap(&self, pc: u16) -> bool {
        self.booted && (BIOS_TRAP_BASE..BIOS_TRAP_BASE + BIOS_FUNC_COUNT).contains(&pc)
    }

    pub fn mount(&mut self, unit: usize, path: &str) -> Result<(), String> {
        if unit >= MAX_DRIVES {
            return Err(format!("Invalid drive number: {}", unit));
        }
        let image = DiskImage::open(path, false)
            .map_err(|e| format!("Failed to open disk image {}: {}", path, e))?;
        eprintln!("Drive {}: {}", (b'A' + unit as u8) as char, image.info());
        self.drives[unit] = Some(image);
        Ok(())
    }

    pub fn load_bytes(&mut self, unit: usize, name: &str, content: Vec<u8>) -> Result<(), String> {
        if unit >= MAX_DRIVES {
            return Err(format!("Invalid drive number: {}", unit));
        }
        let image = MemImage::from_bytes(name, content).map_err(|e| e.to_string())?;
        self.drives[unit] = Some(DiskImage::Mem(image));
        Ok(())
    }

    /// Mount an already-opened backend (front-ends that manage their
    /// own image opening).
    #[allow(dead_code)]
    pub fn mount_image(&mut self, unit: usize, image: DiskImage) -> Result<(), String> {
        if unit >= MAX_DRIVES {
            return Err(format!("Invalid drive number: {}", unit));
        }
        self.drives[unit] = Some(image);
        Ok(())
    }

    //=========================================================================
    // Boot paths
    //=========================================================================

    /// Cold boot from the reserved tracks of drive A.
    pub fn cold_boot(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory) -> Result<(), String> {
        let geometry = match self.drives[0] {
            Some(ref image) => *image.geometry(),
            None => return Err("No disk in drive A:".to_string()),
        };
        if is_simh_layout(&geometry) {
            return self.cold_boot_simh(cpu, mem);
        }

        let image = self.drives[0].as_mut().unwrap();
        let buffer = read_system_tracks(image);

        let hit = boot::find_ccp_signature(&buffer)
            .ok_or_else(|| "CCP signature not found in system tracks".to_string())?;
        let code_offset = hit.offset + 0x80;
        if code_offset >= buffer.len() {
            return Err("System area truncated after CCP header".to_string());
        }
        let base = match boot::scan_call_base(&buffer, code_offset) {
            Some(base) => {
                if base != hit.header_base {
                    eprintln!(
                        "CCP header says 0x{:04x}, code analysis says 0x{:04x}; using code base",
                        hit.header_base, base
                    );
                }
                base
            }
            None => hit.header_base,
        };
        let layout = CpmLayout::from_ccp(base);

        eprintln!(
            "CP/M layout: CCP=0x{:04x} BDOS=0x{:04x} BIOS=0x{:04x}",
            layout.ccp, layout.bdos, layout.bios
        );
        let system_size = (buffer.len() - code_offset)
            .min(boot::SYSTEM_SIZE as usize + 0x200)
            .min(0x10000 - base as usize);
        if self.trace {
            println!("BIOS: copying {} system bytes to 0x{:04x}", system_size, base);
        }
        for (i, &byte) in buffer[code_offset..code_offset + system_size].iter().enumerate() {
            mem.store(base.wrapping_add(i as u16), byte);
        }
        boot::patch_header_jumps(mem, &layout);

        self.layout = layout;
        self.memory_loaded = false;
        self.cache_system(mem);
        self.finish_cold_boot(cpu, mem);
        cpu.registers().set_pc(layout.cold_entry());
        cpu.registers().set16(Reg16::SP, layout.ccp);
        Ok(())
    }

    /// SIMH Altair system tracks interleave real content with blank
    /// sectors, and the CCP header can disagree with where the code was
    /// assembled to run. Collapse the non-blank sectors, then trust the
    /// CALL-target analysis over the header.
    fn cold_boot_simh(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory) -> Result<(), String> {
        let image = self.drives[0].as_mut().unwrap();
        eprintln!("Detected SIMH Altair disk layout");

        let (buffer, header_offset) = collapse_simh_tracks(image);
        let header_offset = header_offset.ok_or_else(|| "No CCP header found".to_string())?;
        let header_base =
            (buffer[header_offset + 1] as u16 | (buffer[header_offset + 2] as u16) << 8) - 0x5C;
        let system_start = header_offset + 128;

        let base = match boot::scan_call_base(&buffer, system_start) {
            Some(base) => base,
            None => header_base,
        };
        if base != header_base {
            eprintln!(
                "CCP header says 0x{:04x}, code analysis says 0x{:04x}; using code base",
                header_base, base
            );
        }
        let layout = CpmLayout::from_ccp(base);
        eprintln!(
            "CP/M layout: CCP=0x{:04x} BDOS=0x{:04x} BIOS=0x{:04x}",
            layout.ccp, layout.bdos, layout.bios
        );

        // Copy the system code, then lay the header over the first 128
        // bytes and correct its JP operands for the actual base.
        let system_size = (buffer.len() - system_start)
            .min(boot::SYSTEM_SIZE as usize)
            .min(0x10000 - base as usize);
        for (i, &byte) in buffer[system_start..system_start + system_size].iter().enumerate() {
            mem.store(base.wrapping_add(i as u16), byte);
        }
        for (i, &byte) in buffer[header_offset..header_offset + 128].iter().enumerate() {
            mem.store(base.wrapping_add(i as u16), byte);
        }
        boot::patch_header_jumps(mem, &layout);

        self.layout = layout;
        self.memory_loaded = false;
        self.cache_system(mem);
        self.finish_cold_boot(cpu, mem);
        cpu.registers().set_pc(layout.cold_entry());
        cpu.registers().set16(Reg16::SP, layout.ccp);
        Ok(())
    }

    /// Boot a MOVCPM memory image already loaded at 0x0100. The CCP
    /// lives at the fixed image offset 0x0980.
    pub fn boot_memory_image(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory) -> Result<(), String> {
        const CCP_SRC: u16 = 0x0980;
        if mem.load(CCP_SRC) != 0xC3 || mem.load(CCP_SRC + 3) != 0xC3 {
            return Err(format!(
                "CCP signature not found at 0x{:04x} in memory image",
                CCP_SRC
            ));
        }
        let cold = mem.load16(CCP_SRC + 1);
        if cold & 0xFF != 0x5C {
            return Err(format!("Memory image cold entry 0x{:04x} is not CCP-shaped", cold));
        }
        let base = cold - 0x5C;
        let layout = CpmLayout::from_ccp(base);
        eprintln!(
            "MOVCPM image layout: CCP=0x{:04x} BDOS=0x{:04x} BIOS=0x{:04x}",
            layout.ccp, layout.bdos, layout.bios
        );

        // Relocate through a scratch copy, the regions can overlap
        let mut system = vec![0u8; boot::SYSTEM_SIZE as usize];
        for (i, byte) in system.iter_mut().enumerate() {
            *byte = mem.load(CCP_SRC.wrapping_add(i as u16));
        }
        for (i, &byte) in system.iter().enumerate() {
            mem.store(base.wrapping_add(i as u16), byte);
        }
        self.saved_system = system;

        self.layout = layout;
        self.memory_loaded = true;
        self.finish_cold_boot(cpu, mem);
        cpu.registers().set_pc(layout.ccp);
        cpu.registers().set16(Reg16::SP, layout.ccp);
        Ok(())
    }

    fn cache_system(&mut self, mem: &BankedMemory) {
        let mut system = vec![0u8; boot::SYSTEM_SIZE as usize];
        for (i, byte) in system.iter_mut().enumerate() {
            *byte = mem.load(self.layout.ccp.wrapping_add(i as u16));
        }
        self.saved_system = system;
    }

    fn finish_cold_boot(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory) {
        boot::write_zero_page_cold(mem, &self.layout);
        boot::write_jump_table(mem, self.layout.bios, BIOS_TRAP_BASE);
        self.setup_disk_parameters(mem);
        boot::clear_default_dma(mem);
        if let Some(fatal) = self.protect_tables {
            mem.set_write_protection(self.layout.bios, self.layout.bios + DPH_OFFSET, fatal);
        }
        self.current_drive = 0;
        self.current_track = 0;
        self.current_sector = 1;
        self.dma = boot::DEFAULT_DMA;
        self.booted = true;
        cpu.registers().set16(Reg16::BC, 0x0000);
    }

    /// Warm boot: bring the system image back, rebuild the zero page,
    /// and hand control to the CCP. The current-drive nibble survives
    /// unless it names a drive that cannot exist.
    pub fn warm_boot(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory) {
        let loc4 = mem.load(boot::DRVUSER_ADDR);
        if (loc4 & 0x0F) as usize >= MAX_DRIVES {
            if self.trace {
                println!("BIOS: WBOOT drive nibble 0x{:02x} corrupt, reset to A:", loc4);
            }
            mem.store(boot::DRVUSER_ADDR, 0x00);
        }

        if self.memory_loaded {
            for (i, &byte) in self.saved_system.iter().enumerate() {
                mem.store(self.layout.ccp.wrapping_add(i as u16), byte);
            }
        } else if let Some(ref mut image) = self.drives[0] {
            // Re-read the CCP from the reserved tracks, same discovery
            // as cold boot; the cached copy covers an unreadable disk
            let ccp = self.layout.ccp;
            let layout = self.layout;
            let reloaded = if is_simh_layout(image.geometry()) {
                let (buffer, header_offset) = collapse_simh_tracks(image);
                match header_offset {
                    Some(header) => {
                        let code = header + 128;
                        let count = buffer.len().saturating_sub(code).min(boot::CCP_SIZE as usize);
                        for (i, &byte) in buffer[code..code + count].iter().enumerate() {
                            mem.store(ccp.wrapping_add(i as u16), byte);
                        }
                        for (i, &byte) in buffer[header..header + 128].iter().enumerate() {
                            mem.store(ccp.wrapping_add(i as u16), byte);
                        }
                        boot::patch_header_jumps(mem, &layout);
                        true
                    }
                    None => false,
                }
            } else {
                let buffer = read_system_tracks(image);
                match boot::find_ccp_signature(&buffer) {
                    Some(hit) if hit.offset + 0x80 < buffer.len() => {
                        let code = hit.offset + 0x80;
                        let count = (buffer.len() - code).min(boot::CCP_SIZE as usize);
                        for (i, &byte) in buffer[code..code + count].iter().enumerate() {
                            mem.store(ccp.wrapping_add(i as u16), byte);
                        }
                        boot::patch_header_jumps(mem, &layout);
                        true
                    }
                    _ => false,
                }
            };
            if !reloaded {
                for (i, &byte) in self.saved_system.iter().take(boot::CCP_SIZE as usize).enumerate()
                {
                    mem.store(ccp.wrapping_add(i as u16), byte);
                }
            }
        }

        boot::write_zero_page_vectors(mem, &self.layout);
        mem.store(boot::IOBYTE_ADDR, 0x00);
        boot::clear_default_dma(mem);
        self.dma = boot::DEFAULT_DMA;

        let drive = (mem.load(boot::DRVUSER_ADDR) & 0x0F) as usize;
        self.current_drive = drive;
        cpu.registers().set16(Reg16::BC, drive as u16);
        cpu.registers().set_pc(self.layout.ccp);
        cpu.registers().set16(Reg16::SP, self.layout.ccp);
    }

    //=========================================================================
    // Disk parameter tables
    //=========================================================================

    fn setup_disk_parameters(&mut self, mem: &mut BankedMemory) {
        let bios = self.layout.bios;
        let xlt_addr = bios + XLT_OFFSET;
        let dirbuf_addr = bios + DIRBUF_OFFSET;

        // XLT: published for 8" SSSD software skew, zeroed otherwise
        for (i, &entry) in SKEW_8INCH.iter().enumerate() {
            mem.store(xlt_addr + i as u16, entry);
        }

        // Per-drive CSV and ALV sized from each drive's DPB
        let mut work = bios + WORK_OFFSET;
        for unit in 0..MAX_DRIVES {
            let geometry = match self.drives[unit] {
                Some(ref image) => *image.geometry(),
                None => {
                    self.dph_addr[unit] = 0;
                    continue;
                }
            };
            let dpb = Dpb::for_geometry(&geometry);
            let dpb_addr = bios + DPB_OFFSET + (unit as u16) * 15;
            dpb.write_to(mem, dpb_addr);

            let csv_addr = work;
            work += dpb.cks;
            let alv_addr = work;
            work += dpb.alv_size();

            let uses_skew = geometry.sectors_per_track == 26 && geometry.sector_size == 128;
            let dph = bios + DPH_OFFSET + (unit as u16) * 16;
            mem.store16(dph, if uses_skew { xlt_addr } else { 0 });
            for scratch in 1..4 {
                mem.store16(dph + scratch * 2, 0);
            }
            mem.store16(dph + 8, dirbuf_addr);
            mem.store16(dph + 10, dpb_addr);
            mem.store16(dph + 12, csv_addr);
            mem.store16(dph + 14, alv_addr);
            self.dph_addr[unit] = dph;
        }
    }

    //=========================================================================
    // Trap dispatch
    //=========================================================================

    pub fn handle_trap(
        &mut self,
        pc: u16,
        cpu: &mut Cpu,
        mem: &mut BankedMemory,
        console: &mut Console,
    ) -> BiosOutcome {
        let func = (pc - BIOS_TRAP_BASE) as usize;
        if self.trace && func < BIOS_FUNC_NAMES.len() && func != 2 {
            // CONST polls constantly, skip it in traces
            println!("BIOS: {}", BIOS_FUNC_NAMES[func]);
        }

        match func {
            0 => {
                // BOOT
                if self.memory_loaded {
                    self.warm_boot(cpu, mem);
                } else if let Err(err) = self.cold_boot(cpu, mem) {
                    return BiosOutcome::Fatal(err);
                }
                return BiosOutcome::Continue;
            }
            1 => {
                // WBOOT
                self.warm_boot(cpu, mem);
                return BiosOutcome::Continue;
            }
            2 => {
                // CONST
                let a = if console.has_input() { 0xFF } else { 0x00 };
                cpu.registers().set8(Reg8::A, a);
            }
            3 => {
                // CONIN: suspend without advancing PC when the ring is
                // empty; the trap re-fires once the host feeds input.
                match console.pop_input() {
                    Some(byte) => {
                        self.waiting_for_input = false;
                        cpu.registers().set8(Reg8::A, byte & 0x7F);
                    }
                    None => {
                        self.waiting_for_input = true;
                        return BiosOutcome::WaitingForInput;
                    }
                }
            }
            4 => {
                // CONOUT
                let byte = cpu.registers().get8(Reg8::C);
                console.put_char(byte);
            }
            5 => {
                // LIST
                let byte = cpu.registers().get8(Reg8::C);
                console.printer_out(byte);
            }
            6 => {
                // PUNCH
                let byte = cpu.registers().get8(Reg8::C);
                console.aux_out(byte);
            }
            7 => {
                // READER
                let byte = console.aux_in();
                cpu.registers().set8(Reg8::A, byte);
            }
            8 => {
                // HOME
                self.current_track = 0;
            }
            9 => {
                // SELDSK
                let drive = cpu.registers().get8(Reg8::C) as usize;
                let logged_in = cpu.registers().get8(Reg8::E) & 0x01 != 0;
                if self.trace {
                    println!("BIOS: SELDSK {} (logged_in={})", drive, logged_in);
                }
                if drive < MAX_DRIVES && self.drives[drive].is_some() {
                    self.current_drive = drive;
                    cpu.registers().set16(Reg16::HL, self.dph_addr[drive]);
                } else {
                    cpu.registers().set16(Reg16::HL, 0);
                }
            }
            10 => {
                // SETTRK
                self.current_track = cpu.registers().get16(Reg16::BC) as u32;
            }
            11 => {
                // SETSEC
                self.current_sector = cpu.registers().get16(Reg16::BC) as u32;
            }
            12 => {
                // SETDMA
                self.dma = cpu.registers().get16(Reg16::BC);
            }
            13 => {
                // READ
                let status = self.disk_read(mem);
                cpu.registers().set8(Reg8::A, status);
            }
            14 => {
                // WRITE
                let status = self.disk_write(mem);
                cpu.registers().set8(Reg8::A, status);
            }
            15 => {
                // LISTST
                let a = if console.printer_ready() { 0xFF } else { 0x00 };
                cpu.registers().set8(Reg8::A, a);
            }
            16 => {
                // SECTRAN
                let logical = cpu.registers().get16(Reg16::BC);
                let xlt = cpu.registers().get16(Reg16::DE);
                let physical = if xlt == 0 {
                    logical + 1
                } else {
                    mem.load(xlt.wrapping_add(logical)) as u16
                };
                cpu.registers().set16(Reg16::HL, physical);
            }
            _ => {
                eprintln!("Unknown BIOS function {}", func);
            }
        }

        do_ret(cpu, mem);
        BiosOutcome::Continue
    }

    fn disk_read(&mut self, mem: &mut BankedMemory) -> u8 {
        let track = self.current_track;
        let sector = self.current_sector;
        let dma = self.dma;
        let trace = self.trace;
        let drive = self.current_drive;
        let image = match self.drives[drive] {
            Some(ref mut image) => image,
            None => return 1,
        };
        if trace {
            println!(
                "BIOS: READ drive={} track={} sector={} dma=0x{:04x}",
                drive, track, sector, dma
            );
        }
        match image.read_sector(track, 0, sector) {
            Ok(data) => {
                for (i, &byte) in data.iter().enumerate() {
                    mem.store(dma.wrapping_add(i as u16), byte);
                }
                0
            }
            Err(err) => {
                if trace {
                    println!("BIOS: READ failed: {}", err);
                }
                1
            }
        }
    }

    fn disk_write(&mut self, mem: &mut BankedMemory) -> u8 {
        let track = self.current_track;
        let sector = self.current_sector;
        let dma = self.dma;
        let trace = self.trace;
        let drive = self.current_drive;
        let image = match self.drives[drive] {
            Some(ref mut image) => image,
            None => return 1,
        };
        if image.is_read_only() {
            return 2;
        }
        if trace {
            println!(
                "BIOS: WRITE drive={} track={} sector={} dma=0x{:04x}",
                drive, track, sector, dma
            );
        }
        let size = image.geometry().sector_size;
        let mut data = vec![0u8; size];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = mem.load(dma.wrapping_add(i as u16));
        }
        match image.write_sector(track, 0, sector, &data) {
            Ok(()) => 0,
            Err(ref err) if err.kind() == std::io::ErrorKind::PermissionDenied => 2,
            Err(err) => {
                if trace {
                    println!("BIOS: WRITE failed: {}", err);
                }
                1
            }
        }
    }
}

fn is_simh_layout(geometry: &DiskGeometry) -> bool {
    geometry.sectors_per_track == 32 && geometry.sector_size == 128
}

/// Read the reserved tracks of a boot disk into a flat buffer, head 0,
/// stopping at the first read failure or at 8Kb.
fn read_system_tracks(image: &mut DiskImage) -> Vec<u8> {
    let geometry = *image.geometry();
    let mut buffer = vec![0u8; 8192];
    let mut loaded = 0usize;
    'tracks: for track in 0..geometry.reserved_tracks {
        for sector in 1..=geometry.sectors_per_track {
            if loaded + geometry.sector_size > buffer.len() {
                break 'tracks;
            }
            match image.read_sector(track, 0, sector) {
                Ok(data) => {
                    buffer[loaded..loaded + geometry.sector_size].copy_from_slice(&data);
                    loaded += geometry.sector_size;
                }
                Err(_) => break 'tracks,
            }
        }
    }
    buffer.truncate(loaded);
    buffer
}

/// Collapse the non-blank sectors of a SIMH system area into a
/// contiguous buffer, noting where the CCP header sector landed.
fn collapse_simh_tracks(image: &mut DiskImage) -> (Vec<u8>, Option<usize>) {
    let geometry = *image.geometry();
    let tracks = geometry.reserved_tracks.min(geometry.tracks);
    let mut buffer = Vec::with_capacity((tracks * geometry.sectors_per_track) as usize * 128);
    let mut header_offset: Option<usize> = None;
    for track in 0..tracks {
        for sector in 1..=geometry.sectors_per_track {
            let data = match image.read_sector(track, 0, sector) {
                Ok(data) => data,
                Err(_) => continue,
            };
            if boot::is_blank_sector(&data) {
                continue;
            }
            if header_offset.is_none() {
                // The header sits at the start of its sector
                if let Some(hit) = boot::find_ccp_header_loose(&data) {
                    if hit.offset == 0 {
                        header_offset = Some(buffer.len());
                    }
                }
            }
            buffer.extend_from_slice(&data);
        }
    }
    (buffer, header_offset)
}

/// Simulate the Z80 RET the trapped jump-table entry never executes.
pub fn do_ret(cpu: &mut Cpu, mem: &BankedMemory) {
    let sp = cpu.registers().get16(Reg16::SP);
    let ret = mem.load16(sp);
    cpu.registers().set16(Reg16::SP, sp.wrapping_add(2));
    cpu.registers().set_pc(ret);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_image::GEOM_SSSD_8INCH;

    #[test]
    fn dpb_for_8inch_sssd() {
        let dpb = Dpb::for_geometry(&GEOM_SSSD_8INCH);
        assert_eq!(
            dpb,
            Dpb {
                spt: 26,
                bsh: 3,
                blm: 7,
                exm: 0,
                dsm: 242,
                drm: 63,
                al0: 0xC0,
                al1: 0x00,
                cks: 16,
                off: 2,
            }
        );
        assert_eq!(dpb.alv_size(), 31);
    }

    #[test]
    fn dpb_for_large_image_uses_2k_blocks() {
        // Altair HDF geometry: 745 tracks, 16 x 128-byte sectors
        let geometry = DiskGeometry::new(745, 1, 16, 128, 4);
        let dpb = Dpb::for_geometry(&geometry);
        assert_eq!(dpb.bsh, 4);
        assert_eq!(dpb.blm, 15);
        assert_eq!(dpb.exm, 0);
        assert!(dpb.dsm >= 256);
        assert_eq!(dpb.drm, 255);
        assert_eq!(dpb.off, 4);
    }

    #[test]
    fn dpb_serialization() {
        let mut mem = BankedMemory::new();
        let dpb = Dpb::for_geometry(&GEOM_SSSD_8INCH);
        dpb.write_to(&mut mem, 0x4000);
        assert_eq!(mem.load16(0x4000), 26);
        assert_eq!(mem.load(0x4002), 3);
        assert_eq!(mem.load(0x4003), 7);
        assert_eq!(mem.load(0x4004), 0);
        assert_eq!(mem.load16(0x4005), 242);
        assert_eq!(mem.load16(0x4007), 63);
        assert_eq!(mem.load(0x4009), 0xC0);
        assert_eq!(mem.load(0x400A), 0x00);
        assert_eq!(mem.load16(0x400B), 16);
        assert_eq!(mem.load16(0x400D), 2);
    }

    #[test]
    fn ret_simulation_pops_stack() {
        let mut cpu = Cpu::new_z80();
        let mut mem = BankedMemory::new();
        mem.store16(0x8FFE, 0x1234);
        cpu.registers().set16(Reg16::SP, 0x8FFE);
        do_ret(&mut cpu, &mem);
        assert_eq!(cpu.registers().pc(), 0x1234);
        assert_eq!(cpu.registers().get16(Reg16::SP), 0x9000);
    }
}
