//! Standalone host process: starts one dispatch fabric instance, wires its
//! `send` handler to a file-backed mailbox, and runs until `Ctrl+C`.

mod mailbox;

use std::path::PathBuf;
use std::sync::Arc;

use bridgefabric_core::{Fabric, FabricConfig};
use mailbox::MailboxDelivery;

struct Args {
    name: String,
    workspace_path: String,
    mailbox_path: Option<PathBuf>,
    preferred_port: Option<u16>,
}

fn parse_args() -> Args {
    let mut name = "untitled".to_string();
    let mut workspace_path = std::env::current_dir()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| "/untitled".to_string());
    let mut mailbox_path = None;
    let mut preferred_port = None;

    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--name" => {
                if let Some(v) = iter.next() {
                    name = v;
                }
            }
            "--workspace-path" => {
                if let Some(v) = iter.next() {
                    workspace_path = v;
                }
            }
            "--mailbox" => {
                if let Some(v) = iter.next() {
                    mailbox_path = Some(PathBuf::from(v));
                }
            }
            "--port" => {
                if let Some(v) = iter.next() {
                    match v.parse::<u16>() {
                        Ok(port) => preferred_port = Some(port),
                        Err(_) => eprintln!("ignoring invalid --port value: {v}"),
                    }
                }
            }
            other => {
                eprintln!("ignoring unrecognized argument: {other}");
            }
        }
    }

    Args {
        name,
        workspace_path,
        mailbox_path,
        preferred_port,
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = parse_args();
    let config = FabricConfig::default();

    let mailbox_path = args.mailbox_path.unwrap_or_else(|| {
        config
            .resolve_registry_dir()
            .unwrap_or_else(|_| std::env::temp_dir())
            .join("mailbox.jsonl")
    });

    let delivery = Arc::new(MailboxDelivery::new(mailbox_path));

    let fabric = match Fabric::start(
        args.name,
        args.workspace_path,
        config,
        delivery,
        args.preferred_port,
    )
    .await
    {
        Ok(fabric) => fabric,
        Err(e) => {
            log::error!("[daemon] failed to start fabric: {e}");
            std::process::exit(1);
        }
    };

    log::info!(
        "[daemon] instance {} ready on port {}",
        fabric.identity.id,
        fabric.identity.port().unwrap_or_default()
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("[daemon] failed to install Ctrl+C handler: {e}");
    }

    log::info!("[daemon] shutting down");
    fabric.shutdown().await;
}
