use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Configuration file name
const CONFIG_FILE: &str = "izcpm22.toml";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CpuModel {
    /// Intel 8080 (the CP/M 2.2 baseline)
    I8080,
    /// Zilog Z80 (required for RomWBW)
    Z80,
}

impl Default for CpuModel {
    fn default() -> Self {
        CpuModel::I8080
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProtectMode {
    /// Abort with a diagnostic on a write into the BIOS tables
    Fatal,
    /// Drop the write and continue
    Warn,
    /// No write protection
    Off,
}

impl Default for ProtectMode {
    fn default() -> Self {
        ProtectMode::Fatal
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RomAppConfig {
    pub name: String,
    pub path: String,
    pub key: String,
}

/// Main configuration structure, loaded from izcpm22.toml
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// CPU flavor
    pub cpu: CpuModel,

    /// RomWBW ROM image; selects HBIOS mode when present
    pub rom_file: Option<String>,

    /// romldr ROM loaded on top, preserving bank 0
    pub romldr_file: Option<String>,

    /// MOVCPM memory image boot
    pub memory_image: Option<String>,

    /// Disk images for drives A: through D: (BIOS mode) or the first
    /// HBIOS units
    pub disk_a: Option<String>,
    pub disk_b: Option<String>,
    pub disk_c: Option<String>,
    pub disk_d: Option<String>,

    /// BIOS table write protection
    pub write_protect: ProtectMode,

    /// Consecutive ^C presses that terminate the emulator
    pub ctrl_c_exit_count: u32,

    /// LIST device output file
    pub printer_file: Option<String>,

    /// READER input file
    pub aux_in_file: Option<String>,

    /// PUNCH output file
    pub aux_out_file: Option<String>,

    /// ROM applications for the SYSBOOT back door
    pub rom_apps: Vec<RomAppConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cpu: CpuModel::default(),
            rom_file: None,
            romldr_file: None,
            memory_image: None,
            disk_a: None,
            disk_b: None,
            disk_c: None,
            disk_d: None,
            write_protect: ProtectMode::default(),
            ctrl_c_exit_count: 5,
            printer_file: None,
            aux_in_file: None,
            aux_out_file: None,
            rom_apps: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file, or return default if file doesn't exist
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_FILE)
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Config::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse {}: {}", path.display(), e);
                    eprintln!("Using default configuration.");
                    Config::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read {}: {}", path.display(), e);
                eprintln!("Using default configuration.");
                Config::default()
            }
        }
    }

    pub fn disk_paths(&self) -> [Option<&str>; 4] {
        [
            self.disk_a.as_deref(),
            self.disk_b.as_deref(),
            self.disk_c.as_deref(),
            self.disk_d.as_deref(),
        ]
    }

    /// Get a description of this configuration
    pub fn get_description(&self) -> String {
        let cpu = match self.cpu {
            CpuModel::I8080 => "8080",
            CpuModel::Z80 => "Z80",
        };
        if let Some(ref rom) = self.rom_file {
            format!("RomWBW HBIOS ({}, {})", rom, cpu)
        } else if let Some(ref image) = self.memory_image {
            format!("CP/M 2.2 memory image ({}, {})", image, cpu)
        } else {
            format!("CP/M 2.2 disk boot ({})", cpu)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_when_missing() {
        let config = Config::load_from_path("__no_such_config__.toml");
        assert_eq!(config.cpu, CpuModel::I8080);
        assert_eq!(config.ctrl_c_exit_count, 5);
        assert_eq!(config.write_protect, ProtectMode::Fatal);
        assert!(config.rom_file.is_none());
    }

    #[test]
    fn parse_romwbw_config() {
        let config: Config = toml::from_str(
            r#"
            cpu = "z80"
            rom_file = "roms/RCZ80_std.rom"
            write_protect = "warn"
            disk_a = "disks/hd1k_combo.img"

            [[rom_apps]]
            name = "BASIC"
            path = "roms/basic.sys"
            key = "B"
            "#,
        )
        .unwrap();
        assert_eq!(config.cpu, CpuModel::Z80);
        assert_eq!(config.rom_file.as_deref(), Some("roms/RCZ80_std.rom"));
        assert_eq!(config.write_protect, ProtectMode::Warn);
        assert_eq!(config.rom_apps.len(), 1);
        assert_eq!(config.rom_apps[0].key, "B");
        assert_eq!(config.disk_paths()[0], Some("disks/hd1k_combo.img"));
    }
}
