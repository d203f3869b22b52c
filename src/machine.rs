use iz80::Machine;

use crate::banked_memory::BankedMemory;
use crate::hbios::{SignalPort, SIGNAL_PORT};

/// The CPU-facing side of the session: banked memory behind the
/// `iz80::Machine` trait, plus the HBIOS signal port. No other I/O
/// ports exist; everything else reaches the host through traps.
pub struct EmuMachine {
    pub memory: BankedMemory,
    pub signal: SignalPort,
    pub trace_io: bool,
}

impl EmuMachine {
    pub fn new() -> EmuMachine {
        EmuMachine {
            memory: BankedMemory::new(),
            signal: SignalPort::new(),
            trace_io: false,
        }
    }
}

impl Machine for EmuMachine {
    fn peek(&mut self, address: u16) -> u8 {
        self.memory.load(address)
    }

    fn poke(&mut self, address: u16, value: u8) {
        self.memory.store(address, value);
    }

    fn port_out(&mut self, address: u16, value: u8) {
        let port = address as u8;
        if port == SIGNAL_PORT {
            self.signal.write(value);
        } else if self.trace_io {
            println!("OUT(0x{:02x}, 0x{:02x}) ignored", port, value);
        }
    }

    fn port_in(&mut self, address: u16) -> u8 {
        if self.trace_io {
            println!("IN(0x{:02x}) = 0x00", address as u8);
        }
        0x00
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hbios::SignalPhase;

    #[test]
    fn signal_port_is_wired() {
        let mut machine = EmuMachine::new();
        machine.port_out(0x00EE, 0x01);
        assert_eq!(machine.signal.phase, SignalPhase::Starting);
        machine.port_out(0x1234, 0x99); // other ports are ignored
        assert_eq!(machine.port_in(0x0010), 0x00);
    }

    #[test]
    fn peek_poke_reach_memory() {
        let mut machine = EmuMachine::new();
        machine.poke(0x2000, 0xAB);
        assert_eq!(machine.peek(0x2000), 0xAB);
    }
}
