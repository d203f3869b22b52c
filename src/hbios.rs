use std::time::Instant;

use iz80::{Cpu, Reg16, Reg8};

use crate::banked_memory::BankedMemory;
use crate::console::Console;
use crate::cpm_bios::do_ret;
use crate::disk_image::{self, DiskImage, MemImage, RawImage};
use crate::rtc;

/* RomWBW HBIOS emulation.

    The whole API funnels through one trap address (0xFFF0 by default).
    The function code arrives in B, subfunction or unit in C, scalars
    in D/E, a 16-bit scalar or guest pointer in HL. Results: A is the
    status, data comes back in C, E, DE or HL depending on the call.

    Guest firmware may announce its life-cycle phase and per-class
    dispatch addresses through writes to port 0xEE. The addresses are
    recorded for debugging only; dispatch always happens by trap.
*/

pub const HBIOS_MAIN_ENTRY: u16 = 0xFFF0;
pub const SIGNAL_PORT: u8 = 0xEE;
pub const MAX_UNITS: usize = 16;

pub const HCB_BASE: u16 = 0x0100;
pub const HCB_APITYPE: u16 = 0x12;

// Result codes
pub const HBR_SUCCESS: u8 = 0x00;
pub const HBR_FAILED: u8 = 0xFF;
#[allow(dead_code)]
pub const HBR_PENDING: u8 = 0xFE;
pub const HBR_NODATA: u8 = 0xFD;

// Character I/O
const HBF_CIOIN: u8 = 0x00;
const HBF_CIOOUT: u8 = 0x01;
const HBF_CIOIST: u8 = 0x02;
const HBF_CIOOST: u8 = 0x03;
const HBF_CIOINIT: u8 = 0x04;
const HBF_CIOQUERY: u8 = 0x05;
const HBF_CIODEVICE: u8 = 0x06;

// Disk I/O
const HBF_DIOSTATUS: u8 = 0x10;
const HBF_DIORESET: u8 = 0x11;
const HBF_DIOREAD: u8 = 0x12;
const HBF_DIOWRITE: u8 = 0x13;
const HBF_DIOVERIFY: u8 = 0x14;
const HBF_DIOSENSE: u8 = 0x15;
const HBF_DIOCAP: u8 = 0x16;
const HBF_DIOGEOM: u8 = 0x17;
const HBF_DIOINIT: u8 = 0x18;
const HBF_DIOQUERY: u8 = 0x19;
const HBF_DIODEVICE: u8 = 0x1A;
const HBF_DIOFORMAT: u8 = 0x1B;
// Emulator extension: set the DMA buffer for DIOREAD/DIOWRITE
const HBF_DIOSETDMA: u8 = 0x1C;

// RTC
const HBF_RTCGETTIM: u8 = 0x20;
const HBF_RTCSETTIM: u8 = 0x21;
const HBF_RTCGETBYT: u8 = 0x22;
const HBF_RTCSETBYT: u8 = 0x23;
const HBF_RTCGETBLK: u8 = 0x24;
const HBF_RTCSETBLK: u8 = 0x25;
const HBF_RTCGETALA: u8 = 0x26;
const HBF_RTCSETALA: u8 = 0x27;
const HBF_RTCINIT: u8 = 0x28;
const HBF_RTCQUERY: u8 = 0x29;
const HBF_RTCDEVICE: u8 = 0x2A;

// DSKY keypad
const HBF_DSKYRESET: u8 = 0x30;
const HBF_DSKYSTATUS: u8 = 0x31;
const HBF_DSKYGETKEY: u8 = 0x32;
const HBF_DSKYDEVICE: u8 = 0x3A;

// Video display adapter
const HBF_VDAINIT: u8 = 0x40;
const HBF_VDAQUERY: u8 = 0x41;
const HBF_VDARESET: u8 = 0x42;
const HBF_VDADEVICE: u8 = 0x43;
const HBF_VDASCS: u8 = 0x44;
const HBF_VDASCP: u8 = 0x45;
const HBF_VDASAT: u8 = 0x46;
const HBF_VDASCO: u8 = 0x47;
const HBF_VDAWRC: u8 = 0x48;
const HBF_VDAFIL: u8 = 0x49;
const HBF_VDACPY: u8 = 0x4A;
const HBF_VDASCR: u8 = 0x4B;
const HBF_VDAKST: u8 = 0x4C;
const HBF_VDAKFL: u8 = 0x4D;
const HBF_VDAKRD: u8 = 0x4E;
const HBF_VDARDC: u8 = 0x4F;

// Sound
const HBF_SNDRESET: u8 = 0x50;
const HBF_SNDVOL: u8 = 0x51;
const HBF_SNDPER: u8 = 0x52;
const HBF_SNDNOTE: u8 = 0x53;
const HBF_SNDPLAY: u8 = 0x54;
const HBF_SNDQUERY: u8 = 0x55;
const HBF_SNDDUR: u8 = 0x56;
const HBF_SNDDEVICE: u8 = 0x57;
const HBF_SNDBEEP: u8 = 0x58;

// System
const HBF_SYSRESET: u8 = 0xF0;
const HBF_SYSVER: u8 = 0xF1;
const HBF_SYSSETBNK: u8 = 0xF2;
const HBF_SYSGETBNK: u8 = 0xF3;
const HBF_SYSSETCPY: u8 = 0xF4;
const HBF_SYSBNKCPY: u8 = 0xF5;
const HBF_SYSALLOC: u8 = 0xF6;
const HBF_SYSFREE: u8 = 0xF7;
const HBF_SYSGET: u8 = 0xF8;
const HBF_SYSSET: u8 = 0xF9;
const HBF_SYSPEEK: u8 = 0xFA;
const HBF_SYSPOKE: u8 = 0xFB;
const HBF_SYSINT: u8 = 0xFC;
// Emulator extension: boot a registered ROM application
const HBF_SYSBOOT: u8 = 0xFE;

// SYSGET subfunctions
const SYSGET_CIOCNT: u8 = 0x00;
const SYSGET_CIODEV: u8 = 0x01;
const SYSGET_DIOCNT: u8 = 0x10;
const SYSGET_DIODEV: u8 = 0x11;
const SYSGET_RTCCNT: u8 = 0x20;
const SYSGET_RTCDEV: u8 = 0x21;
const SYSGET_VDACNT: u8 = 0x40;
const SYSGET_VDADEV: u8 = 0x41;
const SYSGET_SNDCNT: u8 = 0x50;
const SYSGET_SNDDEV: u8 = 0x51;
const SYSGET_TIMER: u8 = 0xD0;
const SYSGET_SECS: u8 = 0xD1;
const SYSGET_BOOTINFO: u8 = 0xD2;
const SYSGET_CPUINFO: u8 = 0xF0;
const SYSGET_MEMINFO: u8 = 0xF1;
const SYSGET_BNKINFO: u8 = 0xF2;
// Emulator extension: list the mounted devices on the console
const SYSGET_DEVLIST: u8 = 0xFD;

// HBIOS version reported by SYSVER: 3.5
const HBIOS_VERSION: u8 = 0x35;

// Media ID reported for mounted units
const MID_HD: u8 = 0x04;

//=============================================================================
// Signal port (0xEE) state machine
//=============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalPhase {
    Off,
    Starting,
    PreInit,
    Ready,
}

enum SignalState {
    Idle,
    AddrLo(usize),
    AddrHi(usize, u8),
}

pub const SIGNAL_CLASS_NAMES: [&str; 6] = ["CIO", "DIO", "RTC", "SYS", "VDA", "SND"];

/// Records the guest firmware's life-cycle phase and published
/// per-class dispatch addresses. Visibility only; the execution loop
/// never routes through these addresses.
pub struct SignalPort {
    state: SignalState,
    pub phase: SignalPhase,
    dispatch: [u16; 6],
    pub trace: bool,
}

impl SignalPort {
    pub fn new() -> SignalPort {
        SignalPort {
            state: SignalState::Idle,
            phase: SignalPhase::Off,
            dispatch: [0; 6],
            trace: false,
        }
    }

    pub fn dispatch_addr(&self, class: usize) -> u16 {
        self.dispatch[class]
    }

    pub fn write(&mut self, value: u8) {
        match self.state {
            SignalState::Idle => match value {
                0x01 => {
                    self.phase = SignalPhase::Starting;
                    if self.trace {
                        println!("SIGNAL: firmware starting");
                    }
                }
                0xFE => {
                    self.phase = SignalPhase::PreInit;
                    if self.trace {
                        println!("SIGNAL: firmware preinit");
                    }
                }
                0xFF => {
                    self.phase = SignalPhase::Ready;
                    if self.trace {
                        println!("SIGNAL: firmware init complete");
                        for (class, name) in SIGNAL_CLASS_NAMES.iter().enumerate() {
                            if self.dispatch_addr(class) != 0 {
                                println!(
                                    "SIGNAL: {} handler at 0x{:04x}",
                                    name,
                                    self.dispatch_addr(class)
                                );
                            }
                        }
                    }
                }
                0x10..=0x15 => {
                    self.state = SignalState::AddrLo((value - 0x10) as usize);
                }
                _ => {
                    if self.trace {
                        println!("SIGNAL: ignored byte 0x{:02x}", value);
                    }
                }
            },
            SignalState::AddrLo(class) => {
                self.state = SignalState::AddrHi(class, value);
            }
            SignalState::AddrHi(class, lo) => {
                let addr = lo as u16 | (value as u16) << 8;
                self.dispatch[class] = addr;
                self.state = SignalState::Idle;
                if self.trace {
                    println!(
                        "SIGNAL: {} dispatch address 0x{:04x}",
                        SIGNAL_CLASS_NAMES[class], addr
                    );
                }
            }
        }
    }
}

//=============================================================================
// Dispatcher
//=============================================================================

pub struct RomApp {
    pub name: String,
    pub path: String,
    pub key: char,
}

pub enum HbiosOutcome {
    Continue,
    WaitingForInput,
    Reset(u8),
}

enum Action {
    Ret,
    NoRet,
    Waiting,
    Reset(u8),
}

pub struct HbiosDispatch {
    pub main_entry: u16,
    pub trapping_enabled: bool,
    pub waiting_for_input: bool,
    cur_bank: u8,
    copy_src_bank: u8,
    copy_dst_bank: u8,
    copy_count: u16,
    dio_dma: u16,
    vda_rows: u8,
    vda_cols: u8,
    vda_row: u8,
    vda_col: u8,
    vda_attr: u8,
    snd_volume: [u8; 4],
    snd_period: [u16; 4],
    snd_duration: u16,
    nvram: [u8; 256],
    disks: [Option<DiskImage>; MAX_UNITS],
    rom_apps: Vec<RomApp>,
    ram_bank_init: u16,
    boot_unit: u8,
    boot_slice: u8,
    timer_base: Instant,
    pub debug: bool,
}

impl HbiosDispatch {
    pub fn new() -> HbiosDispatch {
        HbiosDispatch {
            main_entry: HBIOS_MAIN_ENTRY,
            trapping_enabled: false,
            waiting_for_input: false,
            cur_bank: 0x80,
            copy_src_bank: 0x80,
            copy_dst_bank: 0x80,
            copy_count: 0,
            dio_dma: 0x0080,
            vda_rows: 25,
            vda_cols: 80,
            vda_row: 0,
            vda_col: 0,
            vda_attr: 0x07,
            snd_volume: [0; 4],
            snd_period: [0; 4],
            snd_duration: 100,
            nvram: [0; 256],
            disks: Default::default(),
            rom_apps: Vec::new(),
            ram_bank_init: 0,
            boot_unit: 0,
            boot_slice: 0,
            timer_base: Instant::now(),
            debug: false,
        }
    }

    pub fn is_trap(&self, pc: u16) -> bool {
        self.trapping_enabled && pc == self.main_entry
    }

    //=========================================================================
    // Disk units
    //=========================================================================

    pub fn mount(&mut self, unit: usize, path: &str) -> Result<(), String> {
        if unit >= MAX_UNITS {
            return Err(format!("Invalid HBIOS disk unit: {}", unit));
        }
        let size = disk_image::validate_hd_image(path)?;
        let image = RawImage::open_with_geometry(path, disk_image::hd_geometry(size), false)
            .map_err(|e| format!("Failed to open disk image {}: {}", path, e))?;
        let image = DiskImage::Raw(image);
        eprintln!("HBIOS unit {}: {}", unit, image.info());
        self.disks[unit] = Some(image);
        Ok(())
    }

    pub fn load_disk_bytes(&mut self, unit: usize, name: &str, content: Vec<u8>) -> Result<(), String> {
        if unit >= MAX_UNITS {
            return Err(format!("Invalid HBIOS disk unit: {}", unit));
        }
        let size = content.len() as u64;
        let image = if disk_image::is_hd_sized(size) {
            MemImage::with_geometry(name, content, disk_image::hd_geometry(size))
        } else {
            MemImage::from_bytes(name, content).map_err(|e| e.to_string())?
        };
        self.disks[unit] = Some(DiskImage::Mem(image));
        Ok(())
    }

    #[allow(dead_code)]
    pub fn close_disk(&mut self, unit: usize) {
        if unit < MAX_UNITS {
            self.disks[unit] = None;
        }
    }

    pub fn is_disk_loaded(&self, unit: usize) -> bool {
        unit < MAX_UNITS && self.disks[unit].is_some()
    }

    pub fn add_rom_app(&mut self, name: &str, path: &str, key: char) {
        self.rom_apps.push(RomApp {
            name: name.to_string(),
            path: path.to_string(),
            key: key.to_ascii_uppercase(),
        });
    }

    //=========================================================================
    // RomWBW pre-boot initialization
    //=========================================================================

    /// The full pre-boot sequence: patch the HCB, seed RAM bank 0x80,
    /// plant the ident block, then push the final HCB into shadow RAM
    /// so ROM-bank reads observe the patched bytes. Enables trapping.
    pub fn complete_init(&mut self, mem: &mut BankedMemory) {
        // APITYPE in the HCB must read as HBIOS (0x00), not UNA
        mem.write_rom((HCB_BASE + HCB_APITYPE) as usize, 0x00);

        // Page zero and HCB into RAM bank 0x80 for early access
        for addr in 0..0x200u16 {
            let byte = mem.read_bank(0x00, addr);
            mem.write_bank(0x80, addr, byte);
        }
        self.ram_bank_init |= 1 << 0;

        self.setup_ident(mem);

        // Shadow copy must come last so it captures the final bytes
        let saved_bank = mem.current_bank();
        mem.select_bank(0x00);
        for addr in 0..0x200u16 {
            let byte = mem.read_bank(0x00, addr);
            mem.store(addr, byte);
        }
        mem.select_bank(saved_bank);

        self.trapping_enabled = true;
        if self.debug {
            println!("HBIOS: initialization complete, trapping enabled");
        }
    }

    /// HBIOS ident block: 'W', ~'W', combined version byte. REBOOT and
    /// friends look for it at 0xFF00 (some builds at 0xFE00), with a
    /// pointer to it at 0xFFFC.
    fn setup_ident(&self, mem: &mut BankedMemory) {
        for &base in &[0xFF00u16, 0xFE00u16] {
            mem.write_bank(0x80, base, b'W');
            mem.write_bank(0x80, base + 1, !b'W');
            mem.write_bank(0x80, base + 2, HBIOS_VERSION);
        }
        mem.write_bank(0x80, 0xFFFC, 0x00);
        mem.write_bank(0x80, 0xFFFD, 0xFF);
    }

    /// Seed a RAM bank's page zero and HCB from ROM bank 0 on its first
    /// selection.
    fn init_ram_bank(&mut self, mem: &mut BankedMemory, bank: u8) -> bool {
        if bank & 0x80 == 0 || bank & 0x70 != 0 {
            return false;
        }
        let index = bank & 0x0F;
        if self.ram_bank_init & (1 << index) != 0 {
            return false;
        }
        if self.debug {
            println!("HBIOS: seeding RAM bank 0x{:02x} with page zero and HCB", bank);
        }
        for addr in 0..0x200u16 {
            let byte = mem.read_bank(0x00, addr);
            mem.write_bank(bank, addr, byte);
        }
        mem.write_bank(bank, HCB_BASE + HCB_APITYPE, 0x00);
        self.ram_bank_init |= 1 << index;
        true
    }

    //=========================================================================
    // Trap entry
    //=========================================================================

    pub fn handle(
        &mut self,
        cpu: &mut Cpu,
        mem: &mut BankedMemory,
        console: &mut Console,
    ) -> HbiosOutcome {
        let func = cpu.registers().get8(Reg8::B);
        if self.debug && func != HBF_CIOIST {
            println!(
                "HBIOS: B=0x{:02x} C=0x{:02x} DE=0x{:04x} HL=0x{:04x}",
                func,
                cpu.registers().get8(Reg8::C),
                cpu.registers().get16(Reg16::DE),
                cpu.registers().get16(Reg16::HL)
            );
        }

        let action = match func {
            0x00..=0x0F => self.handle_cio(func, cpu, console),
            0x10..=0x1F => self.handle_dio(func, cpu, mem),
            0x20..=0x2F => self.handle_rtc(func, cpu, mem),
            0x30..=0x3A => self.handle_dsky(func, cpu),
            0x40..=0x4F => self.handle_vda(func, cpu, console),
            0x50..=0x58 => self.handle_snd(func, cpu, console),
            0xF0..=0xFF => self.handle_sys(func, cpu, mem, console),
            _ => {
                eprintln!("HBIOS: unknown function 0x{:02x}", func);
                cpu.registers().set8(Reg8::A, HBR_FAILED);
                Action::Ret
            }
        };

        match action {
            Action::Ret => {
                do_ret(cpu, mem);
                HbiosOutcome::Continue
            }
            Action::NoRet => HbiosOutcome::Continue,
            Action::Waiting => {
                self.waiting_for_input = true;
                HbiosOutcome::WaitingForInput
            }
            Action::Reset(reset_type) => {
                if self.debug {
                    println!("HBIOS: SYSRESET type 0x{:02x}", reset_type);
                }
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                HbiosOutcome::Reset(reset_type)
            }
        }
    }

    //=========================================================================
    // Character I/O
    //=========================================================================

    fn handle_cio(&mut self, func: u8, cpu: &mut Cpu, console: &mut Console) -> Action {
        match func {
            HBF_CIOIN => match console.pop_input() {
                Some(byte) => {
                    self.waiting_for_input = false;
                    cpu.registers().set8(Reg8::E, byte);
                    cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                    Action::Ret
                }
                // Leave PC at the trap; the call re-fires once the
                // host pushes input.
                None => Action::Waiting,
            },
            HBF_CIOOUT => {
                let byte = cpu.registers().get8(Reg8::E);
                console.put_char(byte);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_CIOIST => {
                let pending = console.input_pending().min(255) as u8;
                cpu.registers().set8(Reg8::A, pending);
                Action::Ret
            }
            HBF_CIOOST => {
                cpu.registers().set8(Reg8::A, 1);
                Action::Ret
            }
            HBF_CIOINIT | HBF_CIOQUERY => {
                cpu.registers().set16(Reg16::DE, 0);
                cpu.registers().set16(Reg16::HL, 0);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_CIODEVICE => {
                cpu.registers().set8(Reg8::D, 0x00);
                cpu.registers().set8(Reg8::E, 0x00);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            _ => self.unknown(func, cpu),
        }
    }

    //=========================================================================
    // Disk I/O
    //=========================================================================

    fn handle_dio(&mut self, func: u8, cpu: &mut Cpu, mem: &mut BankedMemory) -> Action {
        let unit = cpu.registers().get8(Reg8::C) as usize;
        match func {
            HBF_DIOSTATUS | HBF_DIORESET | HBF_DIOVERIFY | HBF_DIOINIT | HBF_DIOFORMAT => {
                let status = if self.is_disk_loaded(unit) { HBR_SUCCESS } else { HBR_FAILED };
                cpu.registers().set8(Reg8::A, status);
                Action::Ret
            }
            HBF_DIOREAD => self.dio_transfer(unit, cpu, mem, false),
            HBF_DIOWRITE => self.dio_transfer(unit, cpu, mem, true),
            HBF_DIOSENSE => {
                if self.is_disk_loaded(unit) {
                    cpu.registers().set8(Reg8::E, MID_HD);
                    cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                } else {
                    cpu.registers().set8(Reg8::E, 0);
                    cpu.registers().set8(Reg8::A, HBR_FAILED);
                }
                Action::Ret
            }
            HBF_DIOCAP => {
                match self.disks[unit.min(MAX_UNITS - 1)] {
                    Some(ref image) if unit < MAX_UNITS => {
                        let sectors = image.geometry().total_sectors() as u32;
                        cpu.registers().set16(Reg16::DE, (sectors >> 16) as u16);
                        cpu.registers().set16(Reg16::HL, sectors as u16);
                        cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                    }
                    _ => {
                        cpu.registers().set16(Reg16::DE, 0);
                        cpu.registers().set16(Reg16::HL, 0);
                        cpu.registers().set8(Reg8::A, HBR_FAILED);
                    }
                }
                Action::Ret
            }
            HBF_DIOGEOM => {
                match self.disks[unit.min(MAX_UNITS - 1)] {
                    Some(ref image) if unit < MAX_UNITS => {
                        let g = image.geometry();
                        cpu.registers().set16(Reg16::HL, g.tracks as u16);
                        cpu.registers().set8(Reg8::D, g.heads as u8);
                        cpu.registers().set8(Reg8::E, g.sectors_per_track as u8);
                        cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                    }
                    _ => {
                        cpu.registers().set8(Reg8::A, HBR_FAILED);
                    }
                }
                Action::Ret
            }
            HBF_DIOQUERY => {
                cpu.registers().set16(Reg16::DE, 0);
                cpu.registers().set16(Reg16::HL, 0);
                let status = if self.is_disk_loaded(unit) { HBR_SUCCESS } else { HBR_FAILED };
                cpu.registers().set8(Reg8::A, status);
                Action::Ret
            }
            HBF_DIODEVICE => {
                cpu.registers().set8(Reg8::D, MID_HD);
                cpu.registers().set8(Reg8::E, unit as u8);
                let status = if self.is_disk_loaded(unit) { HBR_SUCCESS } else { HBR_FAILED };
                cpu.registers().set8(Reg8::A, status);
                Action::Ret
            }
            HBF_DIOSETDMA => {
                self.dio_dma = cpu.registers().get16(Reg16::HL);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            _ => self.unknown(func, cpu),
        }
    }

    /// DIOREAD/DIOWRITE: the 24-bit linear sector address arrives
    /// chained through D (high), E (mid) and L (low); the transfer buffer
    /// is the DMA address set by DIOSETDMA (default 0x0080).
    fn dio_transfer(&mut self, unit: usize, cpu: &mut Cpu, mem: &mut BankedMemory, write: bool) -> Action {
        let d = cpu.registers().get8(Reg8::D) as u32;
        let e = cpu.registers().get8(Reg8::E) as u32;
        let l = cpu.registers().get8(Reg8::L) as u32;
        let lba = d << 16 | e << 8 | l;
        let dma = self.dio_dma;
        let debug = self.debug;

        let image = match self.disks.get_mut(unit).and_then(|d| d.as_mut()) {
            Some(image) => image,
            None => {
                cpu.registers().set8(Reg8::A, HBR_FAILED);
                return Action::Ret;
            }
        };
        let g = *image.geometry();
        let per_track = g.heads as u64 * g.sectors_per_track as u64;
        let track = (lba as u64 / per_track) as u32;
        let rem = lba as u64 % per_track;
        let head = (rem / g.sectors_per_track as u64) as u32;
        let sector = (rem % g.sectors_per_track as u64) as u32 + 1;
        if debug {
            println!(
                "HBIOS: DIO{} unit={} lba={} (t={} h={} s={}) dma=0x{:04x}",
                if write { "WRITE" } else { "READ" },
                unit, lba, track, head, sector, dma
            );
        }

        let status = if write {
            let mut data = vec![0u8; g.sector_size];
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = mem.load(dma.wrapping_add(i as u16));
            }
            match image.write_sector(track, head, sector, &data) {
                Ok(()) => HBR_SUCCESS,
                Err(err) => {
                    if debug {
                        println!("HBIOS: DIOWRITE failed: {}", err);
                    }
                    HBR_FAILED
                }
            }
        } else {
            match image.read_sector(track, head, sector) {
                Ok(data) => {
                    for (i, &byte) in data.iter().enumerate() {
                        mem.store(dma.wrapping_add(i as u16), byte);
                    }
                    HBR_SUCCESS
                }
                Err(err) => {
                    if debug {
                        println!("HBIOS: DIOREAD failed: {}", err);
                    }
                    HBR_FAILED
                }
            }
        };
        cpu.registers().set8(Reg8::A, status);
        Action::Ret
    }

    //=========================================================================
    // Real-time clock
    //=========================================================================

    fn handle_rtc(&mut self, func: u8, cpu: &mut Cpu, mem: &mut BankedMemory) -> Action {
        match func {
            HBF_RTCGETTIM => {
                let buffer = cpu.registers().get16(Reg16::HL);
                for (i, &byte) in rtc::host_datetime_bcd().iter().enumerate() {
                    mem.store(buffer.wrapping_add(i as u16), byte);
                }
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_RTCSETTIM => {
                // The host clock stays authoritative
                if self.debug {
                    println!("HBIOS: RTCSETTIM ignored");
                }
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_RTCGETBYT => {
                let index = cpu.registers().get8(Reg8::C) as usize;
                let value = self.nvram[index];
                cpu.registers().set8(Reg8::E, value);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_RTCSETBYT => {
                let index = cpu.registers().get8(Reg8::C) as usize;
                self.nvram[index] = cpu.registers().get8(Reg8::E);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_RTCGETBLK => {
                let buffer = cpu.registers().get16(Reg16::HL);
                for (i, &byte) in self.nvram.iter().enumerate() {
                    mem.store(buffer.wrapping_add(i as u16), byte);
                }
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_RTCSETBLK => {
                let buffer = cpu.registers().get16(Reg16::HL);
                for i in 0..self.nvram.len() {
                    self.nvram[i] = mem.load(buffer.wrapping_add(i as u16));
                }
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_RTCGETALA | HBF_RTCSETALA => {
                cpu.registers().set8(Reg8::A, HBR_FAILED);
                Action::Ret
            }
            HBF_RTCINIT | HBF_RTCQUERY => {
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_RTCDEVICE => {
                cpu.registers().set8(Reg8::D, 0x20);
                cpu.registers().set8(Reg8::E, 0x00);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            _ => self.unknown(func, cpu),
        }
    }

    //=========================================================================
    // DSKY keypad (no hardware behind it)
    //=========================================================================

    fn handle_dsky(&mut self, func: u8, cpu: &mut Cpu) -> Action {
        match func {
            HBF_DSKYGETKEY => {
                cpu.registers().set8(Reg8::A, HBR_NODATA);
            }
            HBF_DSKYSTATUS => {
                cpu.registers().set8(Reg8::A, 0);
            }
            HBF_DSKYRESET..=HBF_DSKYDEVICE => {
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            _ => return self.unknown(func, cpu),
        }
        Action::Ret
    }

    //=========================================================================
    // Video display adapter
    //=========================================================================

    fn handle_vda(&mut self, func: u8, cpu: &mut Cpu, console: &mut Console) -> Action {
        match func {
            HBF_VDAINIT | HBF_VDARESET => {
                self.vda_row = 0;
                self.vda_col = 0;
                self.vda_attr = 0x07;
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_VDAQUERY => {
                cpu.registers().set8(Reg8::D, self.vda_rows);
                cpu.registers().set8(Reg8::E, self.vda_cols);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_VDADEVICE => {
                cpu.registers().set8(Reg8::D, 0x40);
                cpu.registers().set8(Reg8::E, 0x00);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_VDASCP => {
                self.vda_row = cpu.registers().get8(Reg8::D).min(self.vda_rows - 1);
                self.vda_col = cpu.registers().get8(Reg8::E).min(self.vda_cols - 1);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_VDASAT | HBF_VDASCO => {
                self.vda_attr = cpu.registers().get8(Reg8::E);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_VDAWRC => {
                // No cell grid is rendered; the character goes to the
                // console and the cursor advances.
                let byte = cpu.registers().get8(Reg8::E);
                console.put_char(byte);
                self.vda_col += 1;
                if self.vda_col >= self.vda_cols {
                    self.vda_col = 0;
                    self.vda_row = (self.vda_row + 1).min(self.vda_rows - 1);
                }
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_VDASCS | HBF_VDAFIL | HBF_VDACPY | HBF_VDASCR => {
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_VDAKST => {
                let pending = console.input_pending().min(255) as u8;
                cpu.registers().set8(Reg8::A, pending);
                Action::Ret
            }
            HBF_VDAKFL => {
                console.flush_input();
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_VDAKRD => match console.pop_input() {
                Some(byte) => {
                    self.waiting_for_input = false;
                    cpu.registers().set8(Reg8::E, byte);
                    cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                    Action::Ret
                }
                None => Action::Waiting,
            },
            HBF_VDARDC => {
                // No cell grid to read back; blank with the current
                // attribute
                cpu.registers().set8(Reg8::E, b' ');
                cpu.registers().set8(Reg8::D, self.vda_attr);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            _ => self.unknown(func, cpu),
        }
    }

    //=========================================================================
    // Sound
    //=========================================================================

    fn handle_snd(&mut self, func: u8, cpu: &mut Cpu, console: &mut Console) -> Action {
        let channel = (cpu.registers().get8(Reg8::C) & 0x03) as usize;
        match func {
            HBF_SNDRESET => {
                self.snd_volume = [0; 4];
                self.snd_period = [0; 4];
                self.snd_duration = 100;
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            HBF_SNDVOL => {
                self.snd_volume[channel] = cpu.registers().get8(Reg8::E);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            HBF_SNDPER | HBF_SNDNOTE => {
                self.snd_period[channel] = cpu.registers().get16(Reg16::HL);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            HBF_SNDDUR => {
                self.snd_duration = cpu.registers().get16(Reg16::HL);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            HBF_SNDPLAY => {
                if self.debug {
                    println!(
                        "HBIOS: SNDPLAY ch={} period={} vol={} dur={}",
                        channel, self.snd_period[channel], self.snd_volume[channel], self.snd_duration
                    );
                }
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            HBF_SNDQUERY => {
                cpu.registers().set16(Reg16::HL, self.snd_period[channel]);
                cpu.registers().set8(Reg8::E, self.snd_volume[channel]);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            HBF_SNDDEVICE => {
                cpu.registers().set8(Reg8::D, 0x50);
                cpu.registers().set8(Reg8::E, 0x00);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            HBF_SNDBEEP => {
                console.put_char(0x07);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            _ => return self.unknown(func, cpu),
        }
        Action::Ret
    }

    //=========================================================================
    // System
    //=========================================================================

    fn handle_sys(
        &mut self,
        func: u8,
        cpu: &mut Cpu,
        mem: &mut BankedMemory,
        console: &mut Console,
    ) -> Action {
        match func {
            HBF_SYSRESET => {
                let reset_type = cpu.registers().get8(Reg8::C);
                Action::Reset(reset_type)
            }
            HBF_SYSVER => {
                cpu.registers().set16(Reg16::HL, HBIOS_VERSION as u16);
                cpu.registers().set16(Reg16::DE, 0);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_SYSSETBNK => {
                let new_bank = cpu.registers().get8(Reg8::C);
                let previous = mem.current_bank();
                self.init_ram_bank(mem, new_bank);
                mem.select_bank(new_bank);
                self.cur_bank = new_bank;
                cpu.registers().set8(Reg8::C, previous);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_SYSGETBNK => {
                cpu.registers().set8(Reg8::C, mem.current_bank());
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_SYSSETCPY => {
                self.copy_dst_bank = cpu.registers().get8(Reg8::D);
                self.copy_src_bank = cpu.registers().get8(Reg8::E);
                self.copy_count = cpu.registers().get16(Reg16::HL);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_SYSBNKCPY => {
                // Pure host-side copy through the bank-qualified
                // accessors; the guest address space never switches.
                let src = cpu.registers().get16(Reg16::HL);
                let dst = cpu.registers().get16(Reg16::DE);
                for i in 0..self.copy_count {
                    let byte = mem.read_bank(self.copy_src_bank, src.wrapping_add(i));
                    mem.write_bank(self.copy_dst_bank, dst.wrapping_add(i), byte);
                }
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_SYSALLOC | HBF_SYSFREE => {
                if self.debug {
                    println!("HBIOS: SYSALLOC/SYSFREE not supported");
                }
                cpu.registers().set8(Reg8::A, HBR_FAILED);
                Action::Ret
            }
            HBF_SYSGET => self.handle_sysget(cpu, mem, console),
            HBF_SYSSET => {
                if self.debug {
                    println!("HBIOS: SYSSET 0x{:02x} accepted", cpu.registers().get8(Reg8::C));
                }
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_SYSPEEK => {
                let addr = cpu.registers().get16(Reg16::HL);
                let byte = mem.read_bank(self.cur_bank, addr);
                cpu.registers().set8(Reg8::E, byte);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_SYSPOKE => {
                let addr = cpu.registers().get16(Reg16::HL);
                let byte = cpu.registers().get8(Reg8::E);
                mem.write_bank(self.cur_bank, addr, byte);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_SYSINT => {
                cpu.registers().set8(Reg8::E, 0);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                Action::Ret
            }
            HBF_SYSBOOT => self.handle_sysboot(cpu, mem, console),
            _ => self.unknown(func, cpu),
        }
    }

    fn handle_sysget(&mut self, cpu: &mut Cpu, mem: &BankedMemory, console: &mut Console) -> Action {
        let sub = cpu.registers().get8(Reg8::C);
        match sub {
            SYSGET_CIOCNT | SYSGET_RTCCNT | SYSGET_VDACNT | SYSGET_SNDCNT => {
                cpu.registers().set8(Reg8::E, 1);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            SYSGET_DIOCNT => {
                let count = self.disks.iter().filter(|d| d.is_some()).count() as u8;
                cpu.registers().set8(Reg8::E, count);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            SYSGET_CIODEV | SYSGET_RTCDEV | SYSGET_VDADEV | SYSGET_SNDDEV => {
                let class = sub & 0xF0;
                cpu.registers().set8(Reg8::D, class);
                cpu.registers().set8(Reg8::E, 0);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            SYSGET_DIODEV => {
                let unit = cpu.registers().get8(Reg8::D) as usize;
                cpu.registers().set8(Reg8::D, MID_HD);
                cpu.registers().set8(Reg8::E, unit as u8);
                let status = if self.is_disk_loaded(unit) { HBR_SUCCESS } else { HBR_FAILED };
                cpu.registers().set8(Reg8::A, status);
            }
            SYSGET_TIMER => {
                let ms = self.timer_base.elapsed().as_millis() as u32;
                cpu.registers().set16(Reg16::DE, (ms >> 16) as u16);
                cpu.registers().set16(Reg16::HL, ms as u16);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            SYSGET_SECS => {
                let secs = self.timer_base.elapsed().as_secs() as u32;
                cpu.registers().set16(Reg16::DE, (secs >> 16) as u16);
                cpu.registers().set16(Reg16::HL, secs as u16);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            SYSGET_BOOTINFO => {
                cpu.registers().set8(Reg8::D, self.boot_unit);
                cpu.registers().set8(Reg8::E, self.boot_slice);
                cpu.registers().set8(Reg8::L, 0x00);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            SYSGET_CPUINFO => {
                cpu.registers().set8(Reg8::D, 0x00); // Z80 family
                cpu.registers().set8(Reg8::E, 8); // nominal MHz
                cpu.registers().set16(Reg16::HL, 8000); // kHz
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            SYSGET_MEMINFO => {
                cpu.registers().set8(Reg8::D, mem.rom_bank_count() as u8);
                cpu.registers().set8(Reg8::E, 16); // RAM banks
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            SYSGET_BNKINFO => {
                cpu.registers().set8(Reg8::D, 0x80); // BIOS bank
                cpu.registers().set8(Reg8::E, 0x8F); // user/common bank
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            SYSGET_DEVLIST => {
                self.write_device_list(console);
                cpu.registers().set8(Reg8::A, HBR_SUCCESS);
            }
            _ => {
                if self.debug {
                    println!("HBIOS: SYSGET 0x{:02x} unsupported", sub);
                }
                cpu.registers().set8(Reg8::A, HBR_FAILED);
            }
        }
        Action::Ret
    }

    fn write_device_list(&self, console: &mut Console) {
        for (unit, disk) in self.disks.iter().enumerate() {
            if let Some(ref image) = disk {
                console_write_str(console, &format!("DIO{}: {}\r\n", unit, image.name()));
            }
        }
        for app in &self.rom_apps {
            console_write_str(console, &format!("ROM {}: {}\r\n", app.key, app.name));
        }
    }

    /// Emulator back door: boot a registered ROM application named by a
    /// one-character string at HL. Device-name boots would need the
    /// whole RomWBW loader chain and are reported as failed.
    fn handle_sysboot(&mut self, cpu: &mut Cpu, mem: &mut BankedMemory, console: &mut Console) -> Action {
        let ptr = cpu.registers().get16(Reg16::HL);
        let mut name = String::new();
        for i in 0..16u16 {
            let byte = mem.load(ptr.wrapping_add(i));
            if byte == 0 || byte == 0x0D || byte == b' ' {
                break;
            }
            name.push((byte & 0x7F) as char);
        }

        if name.len() == 1 {
            let key = name.chars().next().map(|c| c.to_ascii_uppercase());
            let app = self
                .rom_apps
                .iter()
                .find(|app| Some(app.key) == key)
                .map(|app| (app.name.clone(), app.path.clone()));
            if let Some((app_name, path)) = app {
                match std::fs::read(&path) {
                    Ok(data) => {
                        console_write_str(console, &format!("Loading {}...\r\n", app_name));
                        for (i, &byte) in data.iter().enumerate() {
                            if 0x0100 + i > 0xFFFF {
                                break;
                            }
                            mem.store((0x0100 + i) as u16, byte);
                        }
                        cpu.registers().set_pc(0x0100);
                        cpu.registers().set8(Reg8::A, HBR_SUCCESS);
                        return Action::NoRet;
                    }
                    Err(err) => {
                        eprintln!("SYSBOOT: cannot load {}: {}", path, err);
                        cpu.registers().set8(Reg8::A, HBR_FAILED);
                        return Action::Ret;
                    }
                }
            }
        }

        eprintln!("SYSBOOT: no handler for '{}'", name);
        cpu.registers().set8(Reg8::A, HBR_FAILED);
        Action::Ret
    }

    fn unknown(&mut self, func: u8, cpu: &mut Cpu) -> Action {
        eprintln!("HBIOS: unknown function 0x{:02x}", func);
        cpu.registers().set8(Reg8::A, HBR_FAILED);
        Action::Ret
    }
}

fn console_write_str(console: &mut Console, s: &str) {
    for byte in s.bytes() {
        console.put_char(byte);
    }
}
