use std::io::{stdin, stdout, Read, Write};

use termios::*;

const STDIN_FD: i32 = 0;

/// Host terminal in raw mode, feeding the session's console ring.
/// Restores the original terminal settings on drop.
pub struct HostConsole {
    initial_termios: Option<Termios>,
    ctrl_c_limit: u32,
    ctrl_c_run: u32,
    pub quit_requested: bool,
}

impl HostConsole {
    pub fn new(ctrl_c_limit: u32) -> HostConsole {
        let initial_termios = Termios::from_fd(STDIN_FD).ok();
        let console = HostConsole {
            initial_termios,
            ctrl_c_limit,
            ctrl_c_run: 0,
            quit_requested: false,
        };
        console.setup_host_terminal();
        console
    }

    fn setup_host_terminal(&self) {
        if let Some(mut raw) = self.initial_termios {
            raw.c_iflag &= !(IXON | ICRNL);
            // ISIG off so ^C reaches the guest instead of killing us
            raw.c_lflag &= !(ISIG | ECHO | ICANON | IEXTEN);
            raw.c_cc[VMIN] = 0;
            raw.c_cc[VTIME] = 0;
            let _ = tcsetattr(STDIN_FD, TCSANOW, &raw);
        }
    }

    /// Non-blocking read of whatever the terminal has. LF becomes CR
    /// for CP/M. A run of ^C long enough trips the quit flag; each ^C
    /// still passes through to the guest.
    pub fn poll(&mut self) -> Vec<u8> {
        let mut buf = [0u8; 100];
        let size = stdin().read(&mut buf).unwrap_or(0);
        let mut bytes = Vec::with_capacity(size);
        for &raw in &buf[..size] {
            let byte = match raw {
                0x0A => 0x0D,
                other => other,
            };
            if byte == 0x03 {
                self.ctrl_c_run += 1;
                if self.ctrl_c_run >= self.ctrl_c_limit {
                    eprintln!("\r\n[Exiting: {} consecutive ^C received]", self.ctrl_c_limit);
                    self.quit_requested = true;
                }
            } else {
                self.ctrl_c_run = 0;
            }
            bytes.push(byte);
        }
        bytes
    }

    pub fn write_all(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut out = stdout();
        let _ = out.write_all(bytes);
        let _ = out.flush();
    }
}

impl Drop for HostConsole {
    fn drop(&mut self) {
        if let Some(initial) = self.initial_termios {
            let _ = tcsetattr(STDIN_FD, TCSANOW, &initial);
        }
    }
}
