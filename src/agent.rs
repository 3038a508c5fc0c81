/// Protection-key cache served over a per-key local socket.
///
/// Each protected secret key gets its own agent, addressed by the hex of
/// the key file's Salt/IV under the runtime directory. Protocol: connect,
/// receive the 32-byte protection key, close. There is no framing, so the
/// transport must stay a local stream socket; the agent must never be
/// exposed beyond the machine.
#[cfg(unix)]
mod imp {
    use std::fs;
    use std::io::{ErrorKind, Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::os::unix::process::CommandExt;
    use std::path::{Path, PathBuf};
    use std::process::{Command, Stdio};

    use tracing::warn;
    use zeroize::Zeroize;

    use crate::config;
    use crate::crypto::sensitive::Sensitive32;
    use crate::error::{EnchiveError, Result};

    /// Socket name for the key whose Salt/IV is `iv`, under `dir`.
    pub fn socket_path_in(dir: &Path, iv: &[u8; 8]) -> PathBuf {
        let name: String = iv.iter().map(|b| format!("{b:02x}")).collect();
        dir.join(name)
    }

    /// Socket path in the runtime directory.
    pub fn socket_path(iv: &[u8; 8]) -> PathBuf {
        socket_path_in(&config::runtime_directory(), iv)
    }

    /// Ask a running agent for the protection key. Any failure, including a
    /// short read, means "no agent".
    pub fn read_key(iv: &[u8; 8]) -> Option<Sensitive32> {
        read_key_at(&socket_path(iv))
    }

    pub fn read_key_at(path: &Path) -> Option<Sensitive32> {
        let mut stream = UnixStream::connect(path).ok()?;
        let mut key = [0u8; 32];
        let mut filled = 0;
        while filled < key.len() {
            match stream.read(&mut key[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        if filled == key.len() {
            Some(Sensitive32::new(key))
        } else {
            key.zeroize();
            None
        }
    }

    /// Serve `key` on `path` until `timeout_secs` pass without a client.
    ///
    /// Clients are handled one at a time: accept, write the key, close.
    /// If another agent already holds the address, yield to it quietly.
    pub fn serve(key: &Sensitive32, path: &Path, timeout_secs: u32) -> Result<()> {
        unsafe {
            libc::umask(0o077);
        }
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = match UnixListener::bind(path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == ErrorKind::AddrInUse => return Ok(()),
            Err(e) => {
                return Err(EnchiveError::Open {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let timeout_ms = (i64::from(timeout_secs) * 1000).min(i64::from(i32::MAX)) as i32;
        loop {
            let mut pfd = libc::pollfd {
                fd: listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ready < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                let _ = fs::remove_file(path);
                return Err(err.into());
            }
            if ready == 0 {
                // Inactivity timeout: retire the socket and exit.
                let _ = fs::remove_file(path);
                return Ok(());
            }
            match listener.accept() {
                Ok((mut client, _)) => {
                    if let Err(e) = client.write_all(key.as_bytes()) {
                        warn!("agent write failed: {e}");
                    }
                }
                Err(e) => warn!("agent accept failed: {e}"),
            }
        }
    }

    /// Hand `key` to a freshly spawned, detached agent process. The key and
    /// Salt/IV travel over the child's stdin, never the command line.
    /// Returns false (after a warning) on any failure; callers proceed
    /// without a cache.
    pub fn spawn(key: &Sensitive32, iv: &[u8; 8], timeout_secs: u32) -> bool {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                warn!("could not locate own executable for agent: {e}");
                return false;
            }
        };
        let mut child = match Command::new(exe)
            .arg("agent")
            .arg("--timeout")
            .arg(timeout_secs.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!("could not spawn key agent: {e}");
                return false;
            }
        };
        let handed_off = match child.stdin.take() {
            Some(mut stdin) => stdin
                .write_all(iv)
                .and_then(|()| stdin.write_all(key.as_bytes()))
                .is_ok(),
            None => false,
        };
        if !handed_off {
            warn!("could not hand protection key to agent");
        }
        handed_off
    }

    /// Entry point of the hidden `agent` subcommand: receive Salt/IV and
    /// protection key from the parent, then serve until the timeout.
    pub fn run(timeout_secs: u32) -> Result<()> {
        let mut handoff = [0u8; 40];
        std::io::stdin().read_exact(&mut handoff)?;
        let mut iv = [0u8; 8];
        iv.copy_from_slice(&handoff[..8]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&handoff[8..]);
        handoff.zeroize();
        let key = Sensitive32::new(key);
        serve(&key, &socket_path(&iv), timeout_secs)
    }
}

#[cfg(unix)]
pub use imp::*;

#[cfg(not(unix))]
mod imp {
    use crate::crypto::sensitive::Sensitive32;
    use crate::error::{EnchiveError, Result};

    pub fn read_key(_iv: &[u8; 8]) -> Option<Sensitive32> {
        None
    }

    pub fn spawn(_key: &Sensitive32, _iv: &[u8; 8], _timeout_secs: u32) -> bool {
        false
    }

    pub fn run(_timeout_secs: u32) -> Result<()> {
        Err(EnchiveError::BadArgument(
            "the key agent is not supported on this platform".into(),
        ))
    }
}

#[cfg(not(unix))]
pub use imp::*;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::crypto::sensitive::Sensitive32;
    use std::time::Duration;

    #[test]
    fn test_socket_path_is_hex_of_iv() {
        let iv = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x22, 0x33];
        let path = socket_path_in(std::path::Path::new("/run/user/1000"), &iv);
        assert_eq!(path, std::path::PathBuf::from("/run/user/1000/deadbeef00112233"));
    }

    #[test]
    fn test_handshake_then_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0102030405060708");
        let key = Sensitive32::new([0x5A; 32]);

        let serve_path = path.clone();
        let serve_key = key.clone();
        let server = std::thread::spawn(move || serve(&serve_key, &serve_path, 1));

        // Give the listener a moment to bind.
        let mut received = None;
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(20));
            received = read_key_at(&path);
            if received.is_some() {
                break;
            }
        }
        let received = received.expect("agent never answered");
        assert_eq!(received.as_bytes(), key.as_bytes());

        // A second client within the window is served too.
        let again = read_key_at(&path).expect("agent gone too early");
        assert_eq!(again.as_bytes(), key.as_bytes());

        server.join().unwrap().unwrap();
        assert!(!path.exists());
        assert!(read_key_at(&path).is_none());
    }

    #[test]
    fn test_read_key_without_agent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_key_at(&dir.path().join("no-agent-here")).is_none());
    }
}
