#![allow(dead_code)]

use assert_cmd::Command;
use clap::Parser;
use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

pub const MONITOR_SOCKET: &str = "launcher_monitor.sock";

/// A launcher stand-in that answers one Stop.
pub struct FakeLauncher {
    pub dir: tempfile::TempDir,
    handle: Option<JoinHandle<Vec<u8>>>,
}

impl FakeLauncher {
    /// Listen in a fresh instance dir and reply with `reply`, or close the
    /// connection without replying when `None`.
    pub fn start(reply: Option<u8>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join(MONITOR_SOCKET)).unwrap();
        let handle = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut action = [0u8; 1];
            conn.read_exact(&mut action).unwrap();
            if let Some(reply) = reply {
                conn.write_all(&[reply]).unwrap();
            }
            action.to_vec()
        });
        Self {
            dir,
            handle: Some(handle),
        }
    }

    pub fn instance_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Bytes the client sent.
    pub fn received(mut self) -> Vec<u8> {
        self.handle.take().unwrap().join().unwrap()
    }
}

pub fn stop_cvd() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_stop_cvd"));
    cmd.timeout(Duration::from_secs(30));
    cmd.env_remove("HOME");
    cmd
}

/// Write a minimal global config link under `home` pointing at `instance_dir`.
pub fn link_instance(home: &Path, instance_dir: &Path) -> PathBuf {
    let args = cvd_launcher::LaunchArgs::try_parse_from([
        "launch_cvd".to_string(),
        "--instance-num=1".to_string(),
        format!("--home={}", home.display()),
        format!("--instance-dir={}", instance_dir.display()),
    ])
    .unwrap();
    let config = cvd_launcher::InstanceConfig::from_args(&args).unwrap();
    config.save().unwrap();
    config.link_global_config().unwrap();
    config.config_path()
}
