//! `stop_cvd`: ask a running launcher to tear its instance down.

use anyhow::{Context, bail};
use clap::Parser;
use cvd_launcher::InstanceConfig;
use cvd_launcher::control::{StopReply, stop_instance};
use cvd_shared::constants::files;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stop_cvd", version, about = "Stop a running Cuttlefish instance")]
struct Cli {
    /// Runtime directory of the instance to stop
    #[arg(long)]
    instance_dir: Option<PathBuf>,

    /// Home directory holding the last launched instance's configuration
    #[arg(long, env = "HOME")]
    home: Option<PathBuf>,
}

impl Cli {
    fn monitor_socket(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.instance_dir {
            return Ok(dir.join(files::LAUNCHER_MONITOR_SOCKET));
        }
        let home = self
            .home
            .as_deref()
            .context("Cannot determine home directory, pass --home")?;
        let config = InstanceConfig::load_global(home)
            .context("No instance directory given and no launched instance found")?;
        Ok(config.launcher_monitor_path())
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let socket = cli.monitor_socket()?;
    tracing::debug!(socket = %socket.display(), "Sending stop request");

    match stop_instance(&socket)? {
        StopReply::Acknowledged => {
            println!("Successfully stopped device");
            Ok(())
        }
        StopReply::ConnectionClosed => {
            println!("Launcher exited without replying, device stopped");
            Ok(())
        }
        StopReply::Refused => bail!("Launcher failed to stop the device"),
    }
}

fn main() {
    cvd_launcher::util::init_logging();
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
