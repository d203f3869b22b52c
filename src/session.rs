use iz80::Cpu;

use crate::console::Console;
use crate::cpm_bios::{BiosDispatch, BiosOutcome};
use crate::hbios::{HbiosDispatch, HbiosOutcome};
use crate::machine::EmuMachine;

/* The session owns everything a front-end needs: the CPU, the banked
   memory behind the Machine trait, the console rings, and the two
   dispatchers. Front-ends create exactly one and drive it through the
   methods below; no emulator state lives outside the session.

   The execution loop compares the guest PC against the trap addresses
   before every step. That comparison is the only mechanism by which
   firmware calls reach the host. */

pub enum RunOutcome {
    /// The instruction budget ran out; call run() again
    Running,
    /// A console-input handler found the ring empty; feed input and
    /// re-enter, the trap re-fires
    WaitingForInput,
    /// The CPU executed HALT
    Halted,
    /// Unrecoverable (boot failure during a BOOT trap)
    Fatal(String),
}

pub struct Session {
    pub(crate) cpu: Cpu,
    pub(crate) machine: EmuMachine,
    pub(crate) console: Console,
    pub(crate) bios: Option<BiosDispatch>,
    pub(crate) hbios: Option<HbiosDispatch>,
    reset_hook: Option<Box<dyn FnMut(u8)>>,
    debug: bool,
}

impl Session {
    pub fn new(z80: bool) -> Session {
        Session {
            cpu: if z80 { Cpu::new_z80() } else { Cpu::new_8080() },
            machine: EmuMachine::new(),
            console: Console::new(),
            bios: None,
            hbios: None,
            reset_hook: None,
            debug: false,
        }
    }

    //=========================================================================
    // Console
    //=========================================================================

    pub fn push_console_byte(&mut self, byte: u8) {
        self.console.push_input(byte);
        if let Some(ref mut bios) = self.bios {
            bios.waiting_for_input = false;
        }
        if let Some(ref mut hbios) = self.hbios {
            hbios.waiting_for_input = false;
        }
    }

    #[allow(dead_code)]
    pub fn pop_console_output(&mut self) -> Option<u8> {
        self.console.pop_output()
    }

    pub fn drain_console_output(&mut self) -> Vec<u8> {
        self.console.drain_output()
    }

    pub fn console_mut(&mut self) -> &mut Console {
        &mut self.console
    }

    pub fn waiting_for_input(&self) -> bool {
        self.bios.as_ref().map_or(false, |b| b.waiting_for_input)
            || self.hbios.as_ref().map_or(false, |h| h.waiting_for_input)
    }

    //=========================================================================
    // Debug and hooks
    //=========================================================================

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
        if let Some(ref mut bios) = self.bios {
            bios.trace = debug;
        }
        if let Some(ref mut hbios) = self.hbios {
            hbios.debug = debug;
        }
    }

    #[allow(dead_code)]
    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn set_cpu_trace(&mut self, trace: bool) {
        self.cpu.set_trace(trace);
    }

    /// Called after the built-in SYSRESET handling (ROM bank 0, flushed
    /// console ring, PC 0), with the guest's reset type byte.
    pub fn set_reset_hook(&mut self, hook: Box<dyn FnMut(u8)>) {
        self.reset_hook = Some(hook);
    }

    //=========================================================================
    // CP/M BIOS mode
    //=========================================================================

    /// The BIOS dispatcher, created on first touch so mounts can happen
    /// before boot.
    pub fn bios(&mut self) -> &mut BiosDispatch {
        let debug = self.debug;
        self.bios.get_or_insert_with(|| {
            let mut bios = BiosDispatch::new();
            bios.trace = debug;
            bios
        })
    }

    /// Cold boot CP/M from the reserved tracks of drive A.
    pub fn boot_from_disk(&mut self) -> Result<(), String> {
        let bios = self.bios.as_mut().ok_or("No disks mounted")?;
        bios.cold_boot(&mut self.cpu, &mut self.machine.memory)
    }

    /// Load a MOVCPM memory image at 0x0100 and boot from it.
    pub fn load_memory_image(&mut self, image: &[u8]) -> Result<(), String> {
        let count = image.len().min(0x10000 - 0x0100);
        for (i, &byte) in image[..count].iter().enumerate() {
            self.machine.memory.store((0x0100 + i) as u16, byte);
        }
        eprintln!("Loaded {} bytes memory image at 0x0100", count);
        self.bios();
        let bios = self.bios.as_mut().unwrap();
        bios.boot_memory_image(&mut self.cpu, &mut self.machine.memory)
    }

    /// Mount a disk image. Routes to the HBIOS unit table when a ROM is
    /// loaded, the BIOS drive table otherwise.
    pub fn mount_disk(&mut self, unit: usize, path: &str) -> Result<(), String> {
        match self.hbios {
            Some(ref mut hbios) => hbios.mount(unit, path),
            None => self.bios().mount(unit, path),
        }
    }

    /// Hand the session a disk as bytes (browser-style front-ends).
    #[allow(dead_code)]
    pub fn load_disk_bytes(&mut self, unit: usize, name: &str, content: Vec<u8>) -> Result<(), String> {
        match self.hbios {
            Some(ref mut hbios) => hbios.load_disk_bytes(unit, name, content),
            None => self.bios().load_bytes(unit, name, content),
        }
    }

    //=========================================================================
    // RomWBW HBIOS mode
    //=========================================================================

    pub fn hbios(&mut self) -> &mut HbiosDispatch {
        let debug = self.debug;
        self.hbios.get_or_insert_with(|| {
            let mut hbios = HbiosDispatch::new();
            hbios.debug = debug;
            hbios
        })
    }

    /// Load a RomWBW ROM and enable the banked memory model.
    pub fn load_rom(&mut self, data: &[u8]) -> Result<(), String> {
        self.machine.memory.enable_banking();
        self.machine.memory.load_rom(data)?;
        self.hbios();
        Ok(())
    }

    /// Load a romldr ROM on top, preserving the resident bank 0.
    pub fn load_romldr(&mut self, data: &[u8]) -> Result<(), String> {
        self.machine.memory.load_rom_preserving_bank0(data)
    }

    /// Run the RomWBW pre-boot initialization and start the guest in
    /// ROM bank 0.
    pub fn start_romwbw(&mut self) {
        let hbios = self
            .hbios
            .as_mut()
            .expect("load_rom must run before start_romwbw");
        hbios.complete_init(&mut self.machine.memory);
        self.machine.memory.select_bank(0x00);
        self.cpu.registers().set_pc(0x0000);
    }

    //=========================================================================
    // Execution loop
    //=========================================================================

    /// Step the guest for at most `max_instructions`, servicing traps.
    /// The trap test is a pair of integer compares; this is the hot
    /// path and must stay that way.
    pub fn run(&mut self, max_instructions: u64) -> RunOutcome {
        let mut executed = 0u64;
        while executed < max_instructions {
            let pc = self.cpu.registers().pc();

            if let Some(ref mut hbios) = self.hbios {
                if hbios.is_trap(pc) {
                    let outcome =
                        hbios.handle(&mut self.cpu, &mut self.machine.memory, &mut self.console);
                    match outcome {
                        HbiosOutcome::Continue => {}
                        HbiosOutcome::WaitingForInput => return RunOutcome::WaitingForInput,
                        HbiosOutcome::Reset(reset_type) => self.reset(reset_type),
                    }
                    continue;
                }
            }

            if let Some(ref mut bios) = self.bios {
                if bios.is_trap(pc) {
                    match bios.handle_trap(pc, &mut self.cpu, &mut self.machine.memory, &mut self.console)
                    {
                        BiosOutcome::Continue => continue,
                        BiosOutcome::WaitingForInput => return RunOutcome::WaitingForInput,
                        BiosOutcome::Fatal(msg) => return RunOutcome::Fatal(msg),
                    }
                }
            }

            self.cpu.execute_instruction(&mut self.machine);
            executed += 1;
            if self.cpu.is_halted() {
                return RunOutcome::Halted;
            }
        }
        RunOutcome::Running
    }

    /// Run until the guest needs console input or halts.
    #[allow(dead_code)]
    pub fn run_until_idle(&mut self) -> RunOutcome {
        loop {
            match self.run(1_000_000) {
                RunOutcome::Running => continue,
                outcome => return outcome,
            }
        }
    }

    /// SYSRESET semantics: back to ROM bank 0, drop pending input, PC 0.
    fn reset(&mut self, reset_type: u8) {
        self.machine.memory.select_bank(0x00);
        self.console.flush_input();
        self.cpu.registers().set_pc(0x0000);
        if let Some(ref mut hbios) = self.hbios {
            hbios.waiting_for_input = false;
        }
        if let Some(ref mut bios) = self.bios {
            bios.waiting_for_input = false;
        }
        if let Some(ref mut hook) = self.reset_hook {
            hook(reset_type);
        }
    }
}
