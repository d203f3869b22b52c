use std::io::{stdout, Write};

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::Console::*;

/// Host terminal in raw mode, feeding the session's console ring.
/// Restores the original console mode on drop.
pub struct HostConsole {
    stdin_handle: HANDLE,
    original_mode: u32,
    ctrl_c_limit: u32,
    ctrl_c_run: u32,
    pub quit_requested: bool,
}

impl HostConsole {
    pub fn new(ctrl_c_limit: u32) -> HostConsole {
        unsafe {
            let stdin_handle = GetStdHandle(STD_INPUT_HANDLE);
            let mut original_mode: u32 = 0;
            GetConsoleMode(stdin_handle, &mut original_mode);

            // Raw mode: no line input, no echo, no processed input so
            // ^C reaches the guest as a byte.
            SetConsoleMode(stdin_handle, ENABLE_WINDOW_INPUT);

            HostConsole {
                stdin_handle,
                original_mode,
                ctrl_c_limit,
                ctrl_c_run: 0,
                quit_requested: false,
            }
        }
    }

    /// Non-blocking drain of pending key-down events.
    pub fn poll(&mut self) -> Vec<u8> {
        let mut bytes = Vec::new();
        loop {
            let mut events_available: u32 = 0;
            unsafe {
                GetNumberOfConsoleInputEvents(self.stdin_handle, &mut events_available);
            }
            if events_available == 0 {
                break;
            }

            let mut record = [INPUT_RECORD {
                EventType: 0,
                Event: INPUT_RECORD_0 {
                    KeyEvent: KEY_EVENT_RECORD {
                        bKeyDown: 0,
                        wRepeatCount: 0,
                        wVirtualKeyCode: 0,
                        wVirtualScanCode: 0,
                        uChar: KEY_EVENT_RECORD_0 { UnicodeChar: 0 },
                        dwControlKeyState: 0,
                    },
                },
            }];
            let mut events_read: u32 = 0;
            unsafe {
                ReadConsoleInputW(self.stdin_handle, record.as_mut_ptr(), 1, &mut events_read);
            }
            if events_read == 0 {
                break;
            }
            if record[0].EventType != KEY_EVENT as u16 {
                continue;
            }
            let key_event = unsafe { record[0].Event.KeyEvent };
            if key_event.bKeyDown == 0 {
                continue;
            }

            let ch = unsafe { key_event.uChar.UnicodeChar };
            if ch == 0 {
                continue;
            }
            let byte = match ch as u8 {
                0x0A => 0x0D,
                other => other & 0x7F,
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
        unsafe {
            SetConsoleMode(self.stdin_handle, self.original_mode);
        }
    }
}
