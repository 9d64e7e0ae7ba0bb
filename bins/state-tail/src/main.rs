//! state-tail — follows a Manager NDJSON state log, pretty-printing each
//! decoded `StatePayload`. Poll-based, matching the project's other
//! long-lived loops rather than a filesystem-notify dependency.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use types::StatePayload;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "state-tail", about = "Follow a Manager state log")]
struct Args {
    /// Path to the NDJSON state log written by the Manager's state loop.
    path: PathBuf,

    /// Keep following the file for new lines instead of exiting at EOF.
    #[arg(long)]
    follow: bool,

    /// Create the file if it does not exist, instead of erroring out.
    #[arg(long)]
    create: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();

    if !args.path.exists() {
        if args.follow && args.create {
            std::fs::File::create(&args.path)
                .with_context(|| format!("creating {}", args.path.display()))?;
            info!(path = %args.path.display(), "created empty state log");
        } else {
            eprintln!("state log not found: {}", args.path.display());
            std::process::exit(1);
        }
    }

    let mut file =
        std::fs::File::open(&args.path).with_context(|| format!("opening {}", args.path.display()))?;
    file.seek(SeekFrom::End(0))?;

    let mut buf = String::new();
    loop {
        let mut chunk = String::new();
        let read = file.read_to_string(&mut chunk).unwrap_or(0);
        if read > 0 {
            buf.push_str(&chunk);
            while let Some(idx) = buf.find('\n') {
                let line = buf[..idx].to_string();
                buf.drain(..=idx);
                print_line(&line);
            }
        } else if !args.follow {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    Ok(())
}

fn print_line(line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let Ok(record) = serde_json::from_str::<serde_json::Value>(line) else {
        warn!("skipping malformed state log line");
        return;
    };
    let Some(state_value) = record.get("state") else {
        warn!("state log line missing 'state' field");
        return;
    };
    match serde_json::from_value::<StatePayload>(state_value.clone()) {
        Ok(payload) => {
            println!(
                "seq={:<6} t={:<14} pose=({:.2},{:.2},{:.2}) vel=(lin={:.2},ang={:.2}) ok={} msg={}",
                payload.seq,
                payload.sent_at_ms,
                payload.pose.x,
                payload.pose.y,
                payload.pose.heading,
                payload.velocity.linear,
                payload.velocity.angular,
                payload.status.ok,
                payload.status.msg,
            );
        }
        Err(e) => warn!(error = %e, "failed to decode StatePayload"),
    }
}
