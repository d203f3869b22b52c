use clap::{App, Arg};

mod banked_memory;
mod boot;
mod config;
mod console;
mod cpm_bios;
mod disk_image;
mod hbios;
mod machine;
mod rtc;
mod session;

#[cfg(unix)]
mod console_unix;
#[cfg(windows)]
mod console_win;

#[cfg(test)]
mod system_test;

use self::config::{Config, CpuModel, ProtectMode};
use self::session::{RunOutcome, Session};

#[cfg(unix)]
use self::console_unix::HostConsole;
#[cfg(windows)]
use self::console_win::HostConsole;

fn main() {
    // Load configuration from file (or use defaults)
    let config = Config::load();
    let welcome = format!(
        "izcpm22 - CP/M 2.2 / RomWBW BIOS-level emulator\nConfiguration: {}",
        config.get_description()
    );

    // Parse arguments
    let matches = App::new(&welcome[..])
        .arg(Arg::with_name("DISKA")
            .help("Disk A: image file (.dsk, .imd, SIMH). Empty or $ to use config default")
            .required(false)
            .index(1))
        .arg(Arg::with_name("DISKB")
            .help("Disk B: image file. Empty to use config default")
            .required(false)
            .index(2))
        .arg(Arg::with_name("DISKC")
            .help("Disk C: image file")
            .required(false)
            .index(3))
        .arg(Arg::with_name("DISKD")
            .help("Disk D: image file")
            .required(false)
            .index(4))
        .arg(Arg::with_name("rom")
            .long("rom")
            .takes_value(true)
            .help("RomWBW ROM image; boots in HBIOS mode"))
        .arg(Arg::with_name("romldr")
            .long("romldr")
            .takes_value(true)
            .help("romldr ROM loaded on top, preserving bank 0"))
        .arg(Arg::with_name("load_memory")
            .long("load-memory")
            .takes_value(true)
            .help("Boot a MOVCPM memory image instead of a system disk"))
        .arg(Arg::with_name("z80")
            .long("z80")
            .help("Run a Z80 CPU"))
        .arg(Arg::with_name("i8080")
            .long("8080")
            .help("Run an 8080 CPU (default for CP/M)"))
        .arg(Arg::with_name("debug")
            .short("d")
            .long("debug")
            .help("Traces BIOS and HBIOS calls"))
        .arg(Arg::with_name("cpu_trace")
            .short("c")
            .long("cpu-trace")
            .help("Traces CPU instruction execution"))
        .arg(Arg::with_name("io_trace")
            .short("i")
            .long("io-trace")
            .help("Traces ports IN and OUT"))
        .arg(Arg::with_name("no_protect")
            .long("no-protect")
            .help("Disable write protection of the BIOS tables"))
        .arg(Arg::with_name("printer")
            .long("printer")
            .takes_value(true)
            .help("File receiving LIST device output"))
        .arg(Arg::with_name("aux_in")
            .long("aux-in")
            .takes_value(true)
            .help("File feeding the READER device"))
        .arg(Arg::with_name("aux_out")
            .long("aux-out")
            .takes_value(true)
            .help("File receiving PUNCH device output"))
        .get_matches();

    let rom_path = matches
        .value_of("rom")
        .map(|s| s.to_string())
        .or_else(|| config.rom_file.clone());
    let romldr_path = matches
        .value_of("romldr")
        .map(|s| s.to_string())
        .or_else(|| config.romldr_file.clone());
    let memory_image_path = matches
        .value_of("load_memory")
        .map(|s| s.to_string())
        .or_else(|| config.memory_image.clone());

    // Command line disk overrides (or use config defaults)
    let config_disks = config.disk_paths();
    let mut disk_paths: Vec<Option<String>> = Vec::new();
    for (i, arg_name) in ["DISKA", "DISKB", "DISKC", "DISKD"].iter().enumerate() {
        let path = matches
            .value_of(arg_name)
            .filter(|s| *s != "$")
            .map(|s| s.to_string())
            .or_else(|| config_disks[i].map(|s| s.to_string()));
        disk_paths.push(path);
    }

    let mut z80 = match config.cpu {
        CpuModel::I8080 => false,
        CpuModel::Z80 => true,
    };
    if matches.is_present("z80") {
        z80 = true;
    }
    if matches.is_present("i8080") {
        z80 = false;
    }
    if rom_path.is_some() && !z80 {
        eprintln!("RomWBW requires a Z80, overriding CPU selection");
        z80 = true;
    }

    let debug = matches.is_present("debug");
    let trace_cpu = matches.is_present("cpu_trace");
    let trace_io = matches.is_present("io_trace");

    println!("{}", welcome);

    // Init the session
    let mut session = Session::new(z80);
    session.set_debug(debug);
    session.set_cpu_trace(trace_cpu);
    session.machine.trace_io = trace_io;
    session.machine.signal.trace = debug;

    let console = session.console_mut();
    if let Some(path) = matches.value_of("printer").or(config.printer_file.as_deref()) {
        console.set_printer_file(path);
    }
    if let Some(path) = matches.value_of("aux_in").or(config.aux_in_file.as_deref()) {
        console.set_aux_in_file(path);
    }
    if let Some(path) = matches.value_of("aux_out").or(config.aux_out_file.as_deref()) {
        console.set_aux_out_file(path);
    }

    let protect = if matches.is_present("no_protect") {
        None
    } else {
        match config.write_protect {
            ProtectMode::Fatal => Some(true),
            ProtectMode::Warn => Some(false),
            ProtectMode::Off => None,
        }
    };

    // Boot
    if let Some(ref rom_path) = rom_path {
        let rom = match std::fs::read(rom_path) {
            Ok(rom) => rom,
            Err(err) => {
                eprintln!("Cannot read ROM {}: {}", rom_path, err);
                std::process::exit(1);
            }
        };
        if let Err(err) = session.load_rom(&rom) {
            eprintln!("{}", err);
            std::process::exit(1);
        }
        eprintln!("Loaded {} bytes ROM from {}", rom.len(), rom_path);

        if let Some(ref romldr_path) = romldr_path {
            match std::fs::read(romldr_path) {
                Ok(romldr) => {
                    if let Err(err) = session.load_romldr(&romldr) {
                        eprintln!("{}", err);
                        std::process::exit(1);
                    }
                    eprintln!("Loaded romldr from {} (bank 0 preserved)", romldr_path);
                }
                Err(err) => {
                    eprintln!("Cannot read romldr {}: {}", romldr_path, err);
                    std::process::exit(1);
                }
            }
        }

        for (unit, path) in disk_paths.iter().enumerate() {
            if let Some(path) = path {
                if let Err(err) = session.mount_disk(unit, path) {
                    eprintln!("{}", err);
                    std::process::exit(1);
                }
            }
        }
        for app in &config.rom_apps {
            let key = app.key.chars().next().unwrap_or(' ');
            session.hbios().add_rom_app(&app.name, &app.path, key);
        }
        session.start_romwbw();
    } else if let Some(ref image_path) = memory_image_path {
        session.bios().protect_tables = protect;
        for (unit, path) in disk_paths.iter().enumerate() {
            if let Some(path) = path {
                if let Err(err) = session.mount_disk(unit, path) {
                    eprintln!("{}", err);
                    std::process::exit(1);
                }
            }
        }
        let image = match std::fs::read(image_path) {
            Ok(image) => image,
            Err(err) => {
                eprintln!("Cannot read memory image {}: {}", image_path, err);
                std::process::exit(1);
            }
        };
        if let Err(err) = session.load_memory_image(&image) {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    } else {
        if disk_paths[0].is_none() {
            eprintln!("No boot source: give a disk image, --rom or --load-memory");
            std::process::exit(1);
        }
        session.bios().protect_tables = protect;
        for (unit, path) in disk_paths.iter().enumerate() {
            if let Some(path) = path {
                if let Err(err) = session.mount_disk(unit, path) {
                    eprintln!("{}", err);
                    std::process::exit(1);
                }
            }
        }
        if let Err(err) = session.boot_from_disk() {
            eprintln!("Cold boot failed: {}", err);
            std::process::exit(1);
        }
    }

    // Run, with the host terminal in raw mode from here on
    let mut host = HostConsole::new(config.ctrl_c_exit_count);
    let mut done = false;
    let mut failed = false;
    while !done {
        let outcome = session.run(50_000);

        let output = session.drain_console_output();
        host.write_all(&output);
        for byte in host.poll() {
            session.push_console_byte(byte);
        }
        if host.quit_requested {
            done = true;
        }

        match outcome {
            RunOutcome::Running => {}
            RunOutcome::WaitingForInput => {
                if session.waiting_for_input() {
                    // Nothing buffered yet, don't spin the host CPU
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }
            RunOutcome::Halted => {
                host.write_all(b"\r\n");
                eprintln!("HALT instruction, stopping");
                done = true;
            }
            RunOutcome::Fatal(msg) => {
                host.write_all(b"\r\n");
                eprintln!("{}", msg);
                done = true;
                failed = true;
            }
        }
    }

    let output = session.drain_console_output();
    host.write_all(&output);
    drop(host);
    if failed {
        std::process::exit(1);
    }
}
