//! Host terminal state around the emulator run.
//!
//! QEMU leaves the terminal in raw mode when it dies, so the run stage holds a
//! [`ConsoleGuard`] for the lifetime of the child. Dropping the guard restores
//! the terminal, on the error path too.

#[cfg(unix)]
use std::process::{Command, Stdio};

#[cfg(any(unix, windows))]
use tracing::warn;
use tracing::debug;

/// Save/restore of process-wide console state.
pub trait ConsoleMode {
    fn save(&mut self);
    fn restore(&mut self);
}

/// Restores the console when dropped.
pub struct ConsoleGuard<'a, C: ConsoleMode + ?Sized> {
    console: &'a mut C,
}

impl<'a, C: ConsoleMode + ?Sized> ConsoleGuard<'a, C> {
    pub fn acquire(console: &'a mut C) -> Self {
        console.save();
        Self { console }
    }
}

impl<C: ConsoleMode + ?Sized> Drop for ConsoleGuard<'_, C> {
    fn drop(&mut self) {
        self.console.restore();
    }
}

#[cfg(unix)]
type SavedMode = libc::termios;

/// Console input mode flags.
#[cfg(windows)]
type SavedMode = u32;

#[cfg(not(any(unix, windows)))]
type SavedMode = ();

/// The terminal attached to stdin.
///
/// On Unix the termios captured by `save` is written back on `restore`,
/// after a `stty sane` reset of the line discipline. On Windows the console
/// input mode is saved and restored.
#[derive(Default)]
pub struct HostConsole {
    saved: Option<SavedMode>,
}

impl HostConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a mode is held for the next restore.
    pub fn is_saved(&self) -> bool {
        self.saved.is_some()
    }
}

#[cfg(unix)]
impl ConsoleMode for HostConsole {
    fn save(&mut self) {
        let fd = libc::STDIN_FILENO;
        self.saved = None;
        if unsafe { libc::isatty(fd) } != 1 {
            debug!("stdin is not a terminal, console mode not saved");
            return;
        }
        let mut termios: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut termios) } != 0 {
            warn!(
                "Failed to read terminal attributes: {}",
                std::io::Error::last_os_error()
            );
            return;
        }
        debug!("Saved terminal attributes");
        self.saved = Some(termios);
    }

    fn restore(&mut self) {
        let status = Command::new("stty")
            .arg("sane")
            .stdin(Stdio::inherit())
            .stderr(Stdio::null())
            .status();
        debug!("Reset console with stty sane: {:?}", status);

        if let Some(termios) = self.saved.take() {
            let ret = unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &termios) };
            if ret != 0 {
                warn!(
                    "Failed to restore terminal settings: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(windows)]
mod win32 {
    pub type Handle = *mut core::ffi::c_void;

    pub const STD_INPUT_HANDLE: u32 = -10i32 as u32;

    #[link(name = "kernel32")]
    extern "system" {
        pub fn GetStdHandle(which: u32) -> Handle;
        pub fn GetConsoleMode(console: Handle, mode: *mut u32) -> i32;
        pub fn SetConsoleMode(console: Handle, mode: u32) -> i32;
    }
}

#[cfg(windows)]
impl ConsoleMode for HostConsole {
    fn save(&mut self) {
        self.saved = None;
        let mut mode = 0u32;
        let ok = unsafe {
            let handle = win32::GetStdHandle(win32::STD_INPUT_HANDLE);
            win32::GetConsoleMode(handle, &mut mode)
        };
        if ok == 0 {
            debug!("stdin is not a console, console mode not saved");
            return;
        }
        debug!("Saved console input mode {:#x}", mode);
        self.saved = Some(mode);
    }

    fn restore(&mut self) {
        let Some(mode) = self.saved.take() else {
            return;
        };
        let ok = unsafe {
            let handle = win32::GetStdHandle(win32::STD_INPUT_HANDLE);
            win32::SetConsoleMode(handle, mode)
        };
        if ok == 0 {
            warn!(
                "Failed to restore console input mode: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(any(unix, windows)))]
impl ConsoleMode for HostConsole {
    fn save(&mut self) {
        debug!("Console mode capture is not supported on this host");
    }

    fn restore(&mut self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::ConsoleMode;

    /// Counts save/restore calls.
    #[derive(Debug, Default)]
    pub struct FakeConsole {
        pub saves: usize,
        pub restores: usize,
    }

    impl ConsoleMode for FakeConsole {
        fn save(&mut self) {
            self.saves += 1;
        }

        fn restore(&mut self) {
            self.restores += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeConsole;
    use super::*;

    #[test]
    fn test_guard_restores_on_drop() {
        let mut console = FakeConsole::default();
        {
            let _guard = ConsoleGuard::acquire(&mut console);
        }
        assert_eq!(console.saves, 1);
        assert_eq!(console.restores, 1);
    }

    #[test]
    fn test_guard_restores_on_early_return() {
        fn failing(console: &mut FakeConsole) -> Result<(), String> {
            let _guard = ConsoleGuard::acquire(console);
            Err("emulator failed".to_string())
        }

        let mut console = FakeConsole::default();
        assert!(failing(&mut console).is_err());
        assert_eq!(console.restores, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_host_console_saves_termios_of_a_terminal() {
        let is_tty = unsafe { libc::isatty(libc::STDIN_FILENO) } == 1;
        let mut console = HostConsole::new();
        console.save();
        assert_eq!(console.is_saved(), is_tty);
        console.restore();
        assert!(!console.is_saved());
    }
}
