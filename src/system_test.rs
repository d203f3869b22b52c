#[cfg(test)]
mod tests {
    use iz80::{Reg16, Reg8};
    use std::fs::File;
    use std::io::Write;

    use crate::banked_memory::BankedMemory;
    use crate::console::Console;
    use crate::cpm_bios::{BiosDispatch, BiosOutcome, BIOS_TRAP_BASE};
    use crate::session::{RunOutcome, Session};

    fn temp_path(name: &str) -> String {
        let mut path = std::env::temp_dir();
        path.push(format!("izcpm22_sys_{}_{}", std::process::id(), name));
        path.to_string_lossy().into_owned()
    }

    fn write_temp(name: &str, content: &[u8]) -> String {
        let path = temp_path(name);
        File::create(&path).unwrap().write_all(content).unwrap();
        path
    }

    /// An 8" SSSD boot image whose CCP claims (and uses) base 0x9A00.
    /// Track 0: sector 1 is loader junk, sector 2 carries the header
    /// copy, sector 3 starts the CCP proper (header again, then code
    /// with an internal CALL that pins the base).
    fn build_boot_image() -> Vec<u8> {
        let mut image = vec![0xE5u8; 256_256];
        for byte in image[0..128].iter_mut() {
            *byte = 0x00; // boot loader sector
        }
        let header: [u8; 6] = [0xC3, 0x5C, 0x9A, 0xC3, 0x58, 0x9A];
        let copyright = b"  Copyright (c) 1979, Digital Research  ";
        image[0x80..0x86].copy_from_slice(&header);
        image[0x88..0x88 + copyright.len()].copy_from_slice(copyright);
        // CCP image proper at sector 3
        image[0x100..0x106].copy_from_slice(&header);
        image[0x108..0x108 + copyright.len()].copy_from_slice(copyright);
        // CALL 0x9A08 inside the CCP code
        image[0x180] = 0xCD;
        image[0x181] = 0x08;
        image[0x182] = 0x9A;
        // Fill the rest of the system area with something non-blank
        for byte in image[0x200..0x1700].iter_mut() {
            *byte = 0x21;
        }
        image
    }

    fn booted_session() -> (Session, String) {
        let path = write_temp("boot.dsk", &build_boot_image());
        let mut session = Session::new(false);
        session.mount_disk(0, &path).unwrap();
        session.boot_from_disk().unwrap();
        (session, path)
    }

    fn call_bios(
        bios: &mut BiosDispatch,
        cpu: &mut iz80::Cpu,
        mem: &mut BankedMemory,
        console: &mut Console,
        func: u16,
    ) -> BiosOutcome {
        mem.store16(0x0F00, 0xBEEF);
        cpu.registers().set16(Reg16::SP, 0x0F00);
        bios.handle_trap(BIOS_TRAP_BASE + func, cpu, mem, console)
    }

    #[test]
    fn s1_raw_sector_read_to_dma() {
        // 256,256-byte image whose first sector counts 0x00..0x7F
        let mut content = vec![0xE5u8; 256_256];
        for (i, byte) in content[..128].iter_mut().enumerate() {
            *byte = i as u8;
        }
        let path = write_temp("s1.dsk", &content);

        let mut bios = BiosDispatch::new();
        bios.mount(0, &path).unwrap();
        let mut cpu = iz80::Cpu::new_8080();
        let mut mem = BankedMemory::new();
        let mut console = Console::new();

        // SELDSK 0 needs the DPH tables; cold boot is not required for
        // the disk path itself, SELDSK falls back to DPH 0
        cpu.registers().set8(Reg8::C, 0);
        cpu.registers().set8(Reg8::E, 0);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 9);

        cpu.registers().set16(Reg16::BC, 0);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 10); // SETTRK 0
        cpu.registers().set16(Reg16::BC, 1);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 11); // SETSEC 1
        cpu.registers().set16(Reg16::BC, 0x0080);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 12); // SETDMA
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 13); // READ

        assert_eq!(cpu.registers().get8(Reg8::A), 0);
        for i in 0..128u16 {
            assert_eq!(mem.load(0x0080 + i), i as u8);
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn s2_imd_compressed_sector_read() {
        // Two-sector IMD track, sector 1 compressed with fill 0x5A
        let mut imd = Vec::new();
        imd.extend_from_slice(b"IMD 1.18 test\r\n");
        imd.push(0x1A);
        imd.extend_from_slice(&[0x00, 0x00, 0x00, 0x02, 0x00]); // mode cyl head count size
        imd.extend_from_slice(&[0x01, 0x02]); // sector map
        imd.push(0x02); // sector 1: compressed
        imd.push(0x5A);
        imd.push(0x01); // sector 2: normal
        imd.extend_from_slice(&[0x11u8; 128]);
        let path = write_temp("s2.imd", &imd);

        let mut bios = BiosDispatch::new();
        bios.mount(0, &path).unwrap();
        let mut cpu = iz80::Cpu::new_8080();
        let mut mem = BankedMemory::new();
        let mut console = Console::new();

        cpu.registers().set8(Reg8::C, 0);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 9);
        cpu.registers().set16(Reg16::BC, 0);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 10);
        cpu.registers().set16(Reg16::BC, 1);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 11);
        cpu.registers().set16(Reg16::BC, 0x3000);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 12);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 13);

        assert_eq!(cpu.registers().get8(Reg8::A), 0);
        for i in 0..128u16 {
            assert_eq!(mem.load(0x3000 + i), 0x5A);
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn cold_boot_layout_and_zero_page() {
        let (mut session, path) = booted_session();
        let mem = &mut session.machine.memory;

        let layout = *session.bios.as_ref().unwrap().layout();
        assert_eq!(layout.ccp, 0x9A00);
        assert_eq!(layout.bdos, 0xA200);
        assert_eq!(layout.bios, 0xB000);

        // Zero page
        assert_eq!(mem.load(0x0000), 0xC3);
        assert_eq!(mem.load16(0x0001), 0xB003);
        assert_eq!(mem.load(0x0005), 0xC3);
        assert_eq!(mem.load16(0x0006), 0xA206);
        // CCP header relocated and patched
        assert_eq!(mem.load(0x9A00), 0xC3);
        assert_eq!(mem.load16(0x9A01), 0x9A5C);
        // Entry state
        assert_eq!(session.cpu.registers().pc(), 0x9A5C);
        assert_eq!(session.cpu.registers().get16(Reg16::SP), 0x9A00);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn s3_warm_boot_resets_corrupt_drive() {
        let (mut session, path) = booted_session();

        // Corrupt the drive nibble beyond the last drive
        session.machine.memory.store(0x0004, 0x0F);
        let bios = session.bios.as_mut().unwrap();
        bios.warm_boot(&mut session.cpu, &mut session.machine.memory);

        let mem = &session.machine.memory;
        assert_eq!(mem.load(0x0004), 0x00);
        assert_eq!(mem.load(0x0000), 0xC3);
        assert_eq!(mem.load16(0x0001), 0xB003);
        assert_eq!(mem.load(0x0005), 0xC3);
        assert_eq!(mem.load16(0x0006), 0xA206);
        assert_eq!(session.cpu.registers().pc(), 0x9A00);
        assert_eq!(session.cpu.registers().get16(Reg16::BC), 0x0000);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn warm_boot_preserves_valid_drive() {
        let (mut session, path) = booted_session();
        session.machine.memory.store(0x0004, 0x01); // B: is not mounted but can exist
        let bios = session.bios.as_mut().unwrap();
        bios.warm_boot(&mut session.cpu, &mut session.machine.memory);
        assert_eq!(session.machine.memory.load(0x0004), 0x01);
        assert_eq!(session.cpu.registers().get16(Reg16::BC), 0x0001);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn jump_table_traps_through_cpu() {
        // A guest CALL into the jump table must run the handler once
        // and resume right after the CALL.
        let (mut session, path) = booted_session();
        let bios_base = session.bios.as_ref().unwrap().layout().bios;

        // 0x0200: CALL LISTST; HALT
        let target = bios_base + 15 * 3;
        session.machine.memory.store(0x0200, 0xCD);
        session.machine.memory.store16(0x0201, target);
        session.machine.memory.store(0x0203, 0x76);
        session.cpu.registers().set_pc(0x0200);
        session.cpu.registers().set16(Reg16::SP, 0x0400);
        session.cpu.registers().set8(Reg8::A, 0x00);

        match session.run(100) {
            RunOutcome::Halted => {}
            _ => panic!("expected the guest to reach HALT"),
        }
        assert_eq!(session.cpu.registers().get8(Reg8::A), 0xFF); // LISTST
        assert_eq!(session.cpu.registers().pc(), 0x0203); // resumed after CALL
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn sectran_identity_through_cpu() {
        let (mut session, path) = booted_session();
        let bios_base = session.bios.as_ref().unwrap().layout().bios;

        let target = bios_base + 16 * 3;
        session.machine.memory.store(0x0200, 0xCD);
        session.machine.memory.store16(0x0201, target);
        session.machine.memory.store(0x0203, 0x76);
        session.cpu.registers().set_pc(0x0200);
        session.cpu.registers().set16(Reg16::SP, 0x0400);
        session.cpu.registers().set16(Reg16::BC, 5);
        session.cpu.registers().set16(Reg16::DE, 0); // XLT 0: identity + 1

        match session.run(100) {
            RunOutcome::Halted => {}
            _ => panic!("expected the guest to reach HALT"),
        }
        assert_eq!(session.cpu.registers().get16(Reg16::HL), 6);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn conin_echo_loop_suspends_and_resumes() {
        // Guest loop: CONIN, move to C, CONOUT, repeat
        let (mut session, path) = booted_session();
        let bios_base = session.bios.as_ref().unwrap().layout().bios;

        let conin = bios_base + 3 * 3;
        let conout = bios_base + 4 * 3;
        let mem = &mut session.machine.memory;
        mem.store(0x0200, 0xCD);
        mem.store16(0x0201, conin);
        mem.store(0x0203, 0x4F); // LD C,A
        mem.store(0x0204, 0xCD);
        mem.store16(0x0205, conout);
        mem.store(0x0207, 0xC3); // JP 0x0200
        mem.store16(0x0208, 0x0200);
        session.cpu.registers().set_pc(0x0200);
        session.cpu.registers().set16(Reg16::SP, 0x0400);

        match session.run(1000) {
            RunOutcome::WaitingForInput => {}
            _ => panic!("expected input suspension"),
        }
        assert!(session.waiting_for_input());

        session.push_console_byte(b'H');
        session.push_console_byte(b'I');
        match session.run(1000) {
            RunOutcome::WaitingForInput => {}
            _ => panic!("expected suspension after draining input"),
        }
        assert_eq!(session.drain_console_output(), b"HI".to_vec());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn write_to_read_only_image_reports_status_2() {
        let content = build_boot_image();
        let path = write_temp("ro.dsk", &content);

        let mut bios = BiosDispatch::new();
        let image = crate::disk_image::RawImage::open(&path, true).unwrap();
        bios.mount_image(0, crate::disk_image::DiskImage::Raw(image)).unwrap();
        let mut cpu = iz80::Cpu::new_8080();
        let mut mem = BankedMemory::new();
        let mut console = Console::new();

        cpu.registers().set8(Reg8::C, 0);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 9);
        cpu.registers().set16(Reg16::BC, 5);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 10);
        cpu.registers().set16(Reg16::BC, 1);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 11);
        call_bios(&mut bios, &mut cpu, &mut mem, &mut console, 14); // WRITE

        assert_eq!(cpu.registers().get8(Reg8::A), 2);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn seldsk_invalid_drive_returns_zero() {
        let (mut session, path) = booted_session();
        let bios = session.bios.as_mut().unwrap();

        session.cpu.registers().set8(Reg8::C, 2); // no disk in C:
        session.machine.memory.store16(0x0F00, 0xBEEF);
        session.cpu.registers().set16(Reg16::SP, 0x0F00);
        bios.handle_trap(
            BIOS_TRAP_BASE + 9,
            &mut session.cpu,
            &mut session.machine.memory,
            &mut session.console,
        );
        assert_eq!(session.cpu.registers().get16(Reg16::HL), 0);

        // Drive A has a DPH
        session.cpu.registers().set8(Reg8::C, 0);
        session.machine.memory.store16(0x0F00, 0xBEEF);
        session.cpu.registers().set16(Reg16::SP, 0x0F00);
        bios.handle_trap(
            BIOS_TRAP_BASE + 9,
            &mut session.cpu,
            &mut session.machine.memory,
            &mut session.console,
        );
        let dph = session.cpu.registers().get16(Reg16::HL);
        assert_ne!(dph, 0);
        // The DPH points at the drive's DPB, which carries the 8" SSSD
        // record count
        let dpb = session.machine.memory.load16(dph + 10);
        assert_eq!(session.machine.memory.load16(dpb), 26);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn s6_hbios_cioin_suspension_through_session() {
        let mut session = Session::new(true);
        session.load_rom(&vec![0u8; 0x8000]).unwrap();
        session.start_romwbw();

        // Call CIOIN at the trap with an empty ring
        let sp = 0x8F00u16;
        session.machine.memory.store16(sp, 0x4321);
        session.cpu.registers().set16(Reg16::SP, sp);
        session.cpu.registers().set8(Reg8::B, 0x00);
        session.cpu.registers().set8(Reg8::C, 0x00);
        session.cpu.registers().set_pc(0xFFF0);

        match session.run(10) {
            RunOutcome::WaitingForInput => {}
            _ => panic!("expected input suspension"),
        }
        assert!(session.waiting_for_input());
        assert_eq!(session.cpu.registers().pc(), 0xFFF0);

        session.push_console_byte(0x41);
        assert!(!session.waiting_for_input());
        match session.run(5) {
            RunOutcome::Running => {}
            _ => panic!("expected the guest to continue"),
        }
        assert_eq!(session.cpu.registers().get8(Reg8::E), 0x41);
        assert_eq!(session.cpu.registers().get8(Reg8::A), 0x00);
        // RET landed after the trap
        assert!(session.cpu.registers().pc() >= 0x4321);
    }

    #[test]
    fn hbios_sysreset_flushes_and_restarts() {
        let mut session = Session::new(true);
        session.load_rom(&vec![0u8; 0x8000]).unwrap();
        session.start_romwbw();
        let seen = std::rc::Rc::new(std::cell::Cell::new(0u8));
        let hook_seen = std::rc::Rc::clone(&seen);
        session.set_reset_hook(Box::new(move |t| hook_seen.set(t + 1)));

        session.machine.memory.select_bank(0x80);
        session.push_console_byte(0x55);
        session.machine.memory.store16(0x8F00, 0x4321);
        session.cpu.registers().set16(Reg16::SP, 0x8F00);
        session.cpu.registers().set8(Reg8::B, 0xF0);
        session.cpu.registers().set8(Reg8::C, 0x02);
        session.cpu.registers().set_pc(0xFFF0);

        session.run(1);
        assert_eq!(session.cpu.registers().pc(), 0x0001); // reset to 0, one NOP stepped
        assert_eq!(session.machine.memory.current_bank(), 0x00);
        assert!(!session.console.has_input());
        assert_eq!(seen.get(), 0x03);
    }

    #[test]
    fn boot_failure_is_surfaced_before_the_run_loop() {
        // A blank disk has no CCP signature
        let path = write_temp("blank.dsk", &vec![0xE5u8; 256_256]);
        let mut session = Session::new(false);
        session.mount_disk(0, &path).unwrap();
        let err = session.boot_from_disk().unwrap_err();
        assert!(err.contains("CCP signature"), "unexpected error: {}", err);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn memory_image_boot_relocates() {
        let mut session = Session::new(false);
        // MOVCPM image: CCP at image offset 0x0980 (memory 0x0980 once
        // loaded at 0x0100 - the image itself starts at its offset 0)
        let mut image = vec![0u8; 0x2000];
        // The loaded image lands at 0x0100, so image offset 0x0880
        // becomes memory 0x0980
        image[0x0880] = 0xC3;
        image[0x0881] = 0x5C;
        image[0x0882] = 0x90; // CCP at 0x9000
        image[0x0883] = 0xC3;
        image[0x0884] = 0x58;
        image[0x0885] = 0x90;
        session.load_memory_image(&image).unwrap();

        let layout = *session.bios.as_ref().unwrap().layout();
        assert_eq!(layout.ccp, 0x9000);
        assert_eq!(session.machine.memory.load(0x9000), 0xC3);
        assert_eq!(session.cpu.registers().pc(), 0x9000);
        assert_eq!(session.machine.memory.load16(0x0006), 0x9806);
    }

    #[test]
    fn boot_uses_copyright_marker() {
        // Without the Copyright text near the JP pair the image must
        // not boot (no false positives on random JP pairs)
        let mut image = build_boot_image();
        for byte in image[0x88..0xC8].iter_mut() {
            *byte = 0x20;
        }
        for byte in image[0x108..0x148].iter_mut() {
            *byte = 0x20;
        }
        let path = write_temp("nocopy.dsk", &image);
        let mut session = Session::new(false);
        session.mount_disk(0, &path).unwrap();
        assert!(session.boot_from_disk().is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn s4_banked_shadow_write_scenario() {
        let mut mem = BankedMemory::new();
        let mut rom = vec![0u8; crate::banked_memory::BANK_SIZE];
        rom[0x1234] = 0x10;
        mem.load_rom(&rom).unwrap();
        mem.enable_banking();

        mem.select_bank(0x00);
        mem.store(0x1234, 0xAA);
        assert_eq!(mem.load(0x1234), 0xAA);
        mem.select_bank(0x80);
        mem.store(0x1234, 0x55);
        mem.select_bank(0x00);
        assert_eq!(mem.load(0x1234), 0xAA);
    }

    #[test]
    fn simh_cold_boot_prefers_code_base() {
        // SIMH-layout image, header claims 0xDF00 but code CALLs into
        // 0xDC00: code analysis wins
        let mut image = vec![0u8; 137 * 32 * 77];
        let mut sectors: Vec<Vec<u8>> = Vec::new();
        // Sector with the stale header
        let mut header = vec![0u8; 128];
        header[0] = 0xC3;
        header[1] = 0x5C;
        header[2] = 0xDF;
        header[3] = 0xC3;
        header[4] = 0x58;
        header[5] = 0xDF;
        header[6] = 0x42;
        sectors.push(header);
        // System code with a CALL 0xDC10
        let mut code = vec![0x21u8; 128];
        code[0x10] = 0xCD;
        code[0x11] = 0x10;
        code[0x12] = 0xDC;
        sectors.push(code);

        for (i, sector) in sectors.iter().enumerate() {
            let offset = i * 137;
            image[offset] = 0; // track
            image[offset + 1] = (i + 1) as u8; // sector
            image[offset + 3..offset + 131].copy_from_slice(sector);
        }
        let path = write_temp("simh_boot.dsk", &image);

        let mut session = Session::new(false);
        session.mount_disk(0, &path).unwrap();
        session.boot_from_disk().unwrap();

        let layout = *session.bios.as_ref().unwrap().layout();
        assert_eq!(layout.ccp, 0xDC00);
        // Header was copied over the CCP base and patched
        let mem = &session.machine.memory;
        assert_eq!(mem.load(0xDC00), 0xC3);
        assert_eq!(mem.load16(0xDC01), 0xDC5C);
        assert_eq!(mem.load16(0xDC04), 0xDC58);
        assert_eq!(session.cpu.registers().pc(), 0xDC5C);
        std::fs::remove_file(&path).unwrap();
    }
}
