#[cfg(target_family = "unix")]
use std::io;

#[cfg(target_family = "unix")]
use nix::sys::signal::{self, Signal};
#[cfg(target_family = "unix")]
use nix::unistd::Pid;

/// Send a signal to every process in a group.
#[cfg(target_family = "unix")]
pub fn signal_process_group(pgid: u32, sig: Signal) -> io::Result<()> {
    signal::kill(Pid::from_raw(-(pgid as i32)), sig)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}

/// Whether any member of the process group is still alive.
#[cfg(target_family = "unix")]
pub fn process_group_alive(pgid: u32) -> bool {
    signal::kill(Pid::from_raw(-(pgid as i32)), None).is_ok()
}

#[cfg(all(test, target_family = "unix"))]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_group_alive() {
        let pgid = unsafe { libc::getpgid(0) };
        assert!(pgid > 0);
        assert!(process_group_alive(pgid as u32));
    }

    #[test]
    fn test_stale_process_group_not_alive() {
        assert!(!process_group_alive(9_999_999));
    }
}
