//! devbench CLI
//!
//! Operator tool for the shared hardware workbench.

use std::path::PathBuf;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use devbench::pipeline::FlashRequest;
use devbench::{Config, Event, SubscriberId, Workbench};

const USAGE: &str = "\
Usage: devbench <command> [args]

Commands:
  daemon                               Run rescans on a timer and on hardware triggers
  ensure <user>                        Provision the user's sandbox, print its port
  rescan                               Run one reconciliation pass
  flash <user> <sketch> <board> <port> Compile and flash a sketch
  compile <user> <sketch> <board>      Compile a sketch without flashing
  monitor <user> <port> [baud]         Stream a serial port until interrupted
  add-user <user>                      Register a user
  grant <user> <port> [hours]          Grant a port, optionally for a limited time
  revoke <user> <port>                 Revoke a grant
  devices                              List registered devices

Environment variables:
  DEVBENCH_CONFIG   Config file (default: /etc/devbench/devbench.toml)
  DEVBENCH_DEBUG=1  Enable debug logging";

#[tokio::main]
async fn main() {
    let level = if std::env::var("DEVBENCH_DEBUG").is_ok_and(|v| v == "1") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    };

    let config_path = std::env::var("DEVBENCH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/devbench/devbench.toml"));
    let bench = match Config::load(&config_path).and_then(Workbench::from_config) {
        Ok(bench) => bench,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&bench, command, &args[1..]).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run(bench: &Workbench, command: &str, args: &[String]) -> devbench::Result<()> {
    match (command, args) {
        ("daemon", []) => {
            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("shutting down");
                    cancel.cancel();
                }
            });
            bench.run_daemon(cancel).await
        }
        ("ensure", [user]) => {
            let port = bench.ensure(user).await?;
            println!("{}", port);
            Ok(())
        }
        ("rescan", []) => {
            let report = bench.rescan().await?;
            print_json(&report);
            Ok(())
        }
        ("flash", [user, sketch, board, port]) => {
            let subscriber = SubscriberId::new("cli");
            let printer = spawn_printer(bench.subscribe(subscriber.clone()));
            let request = FlashRequest {
                username: user.clone(),
                sketch: sketch.clone(),
                board: board.clone(),
                port: port.clone(),
            };
            let result = bench.flash(request, &subscriber).await;
            bench.disconnect(&subscriber).await;
            let _ = printer.await;
            result.map(|_| ())
        }
        ("compile", [user, sketch, board]) => {
            let report = bench.compile(user, sketch, board).await?;
            print_json(&report);
            if report.success {
                Ok(())
            } else {
                std::process::exit(report.exit_code.max(1));
            }
        }
        ("monitor", [user, port, rest @ ..]) if rest.len() <= 1 => {
            let baud = match rest.first() {
                Some(b) => Some(b.parse::<u32>().map_err(|_| {
                    devbench::Error::Config(format!("invalid baud rate '{}'", b))
                })?),
                None => None,
            };
            let subscriber = SubscriberId::new("cli");
            let printer = spawn_printer(bench.subscribe(subscriber.clone()));
            bench.monitor(&subscriber, user, port, baud).await?;
            let _ = tokio::signal::ctrl_c().await;
            bench.disconnect(&subscriber).await;
            let _ = printer.await;
            Ok(())
        }
        ("add-user", [user]) => {
            let record = bench.add_user(user).await?;
            print_json(&record);
            Ok(())
        }
        ("grant", [user, port, rest @ ..]) if rest.len() <= 1 => {
            let expires_at = match rest.first() {
                Some(h) => {
                    let hours = h.parse::<i64>().map_err(|_| {
                        devbench::Error::Config(format!("invalid duration '{}'", h))
                    })?;
                    Some(Utc::now() + Duration::hours(hours))
                }
                None => None,
            };
            bench.grant(user, port, expires_at).await
        }
        ("revoke", [user, port]) => {
            if !bench.revoke(user, port).await? {
                eprintln!("{} had no grant on {}", user, port);
            }
            Ok(())
        }
        ("devices", []) => {
            let devices = bench.registry().store().devices().await?;
            print_json(&devices);
            Ok(())
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    }
}

/// Prints events as JSON lines until the subscriber is disconnected.
fn spawn_printer(mut rx: mpsc::Receiver<Event>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_json(&event);
        }
    })
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::error!(error = %e, "failed to serialize output"),
    }
}
