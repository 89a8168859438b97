//! syncedit - collaborative plain-text editing without a server
//!
//! A line-oriented terminal client: joins a document by name on the local
//! network, prints remote changes and applies typed commands.

mod command;

use anyhow::Context;
use command::{Command, HELP};
use std::sync::Arc;
use syncedit::network::UdpBeacon;
use syncedit::{load_config, DocumentEvent, ReplicatedDocument};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();

    let document = std::env::args().nth(1).unwrap_or_else(|| cfg.document.clone());
    let network = cfg.network();
    network.validate()?;

    let beacon = UdpBeacon::bind(network.broadcast_addr, network.broadcast_port)
        .with_context(|| format!("failed to bind discovery port {}", network.broadcast_port))?;
    let doc = Arc::new(ReplicatedDocument::new(network, Arc::new(beacon)));

    let mut events = doc.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("missed {} document events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let joined = doc.connect(&document).await?;
    if joined {
        println!("joined '{}' as {}", document, describe_self(&doc));
    } else {
        println!("started '{}' as {}", document, describe_self(&doc));
    }
    println!("type 'help' for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<Command>() {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(e) = run(&doc, command) {
                    eprintln!("error: {}", e);
                }
            }
            Err(e) => eprintln!("{}", e),
        }
    }

    doc.close().await;
    tracing::info!("left '{}'", document);
    Ok(())
}

fn run(doc: &ReplicatedDocument, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Insert { offset, text } => doc.change_text(offset, 0, &text)?,
        Command::Delete { offset, length } => doc.change_text(offset, length, "")?,
        Command::Caret(position) => doc.change_caret_pos(position)?,
        Command::Show => println!("{}", doc.text()),
        Command::Peers => {
            println!("{} peer(s) editing", doc.peer_count());
            let mut carets: Vec<_> = doc.carets().into_iter().collect();
            carets.sort();
            for (peer, position) in carets {
                match position {
                    Some(position) => println!("  {} at {}", peer, position),
                    None => println!("  {} (no caret)", peer),
                }
            }
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
    Ok(())
}

fn describe_self(doc: &ReplicatedDocument) -> String {
    doc.self_id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn print_event(event: &DocumentEvent) {
    match event {
        DocumentEvent::TextChanged(text) => println!("--- document ---\n{}\n----------------", text),
        DocumentEvent::CaretChanged { peer, position: Some(position) } => {
            println!("{} moved caret to {}", peer, position)
        }
        DocumentEvent::CaretChanged { peer, position: None } => println!("{} cleared caret", peer),
        DocumentEvent::PeerCountChanged(count) => println!("{} peer(s) editing", count),
    }
}
