// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Standalone bridge daemon.
//!
//! Loads the YAML configuration, runs the phone/code/password login on
//! the terminal when no session is stored yet, then connects and prints
//! every neutral bridge event. The Matrix side is expected to embed the
//! library instead; this binary exists for development and smoke tests.
//!
//! ```sh
//! cargo run --bin matrigram -- config.yaml
//! ```

use std::collections::HashMap;
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::info;
use serde::Deserialize;
use tokio::sync::mpsc;

use matrigram::bridge::intent::{IntentError, MatrixMedia};
use matrigram::client::SessionParams;
use matrigram::login::{LoginStep, FIELD_CODE, FIELD_PASSWORD, FIELD_PHONE};
use matrigram::store::StoreBackend;
use matrigram::{BridgeEvent, Config, LoginFlow, MemoryStore, ScopedStore, SessionClient};

#[derive(Deserialize)]
struct DaemonConfig {
    #[serde(default)]
    log_level: Option<String>,
    bridge: Config,
}

/// Media intent for terminal runs: uploads are described, not stored.
struct TerminalMedia;

impl MatrixMedia for TerminalMedia {
    fn upload<'a>(
        &'a self,
        data: Vec<u8>,
        mime: &'a str,
        _filename: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String, IntentError>> {
        async move {
            info!("(media) received {} bytes of {mime}", data.len());
            Ok(format!("mxc://localhost/{}", data.len()))
        }
        .boxed()
    }

    fn download<'a>(&'a self, _uri: &'a str) -> BoxFuture<'a, Result<Vec<u8>, IntentError>> {
        async { Err(IntentError("terminal runs have no media repository".into())) }.boxed()
    }
}

fn prompt(question: &str) -> io::Result<String> {
    print!("{question}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn interactive_login(
    config: &Config,
    backend: Arc<dyn StoreBackend>,
) -> Result<i64, Box<dyn std::error::Error>> {
    let mut flow = LoginFlow::new(config.clone(), backend);

    let phone = prompt("Phone number")?;
    let mut step = flow
        .submit(&HashMap::from([(FIELD_PHONE.to_string(), phone)]))
        .await?;

    while step != LoginStep::Complete {
        let (field, question) = match step {
            LoginStep::Code => (FIELD_CODE, "Login code"),
            LoginStep::Password => (FIELD_PASSWORD, "2FA password"),
            _ => unreachable!("login flow cannot move backwards"),
        };
        let value = prompt(question)?;
        match flow.submit(&HashMap::from([(field.to_string(), value)])).await {
            Ok(next) => step = next,
            Err(e) if e.is_transient() => eprintln!("{e}, try again"),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(flow.user_id.expect("completed flow has a user id"))
}

async fn run(config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend: Arc<dyn StoreBackend> = Arc::new(MemoryStore::new());

    let user_id = interactive_login(&config.bridge, Arc::clone(&backend)).await?;
    println!("Logged in as {user_id}");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let client = SessionClient::new(SessionParams {
        user_id,
        config: config.bridge.clone(),
        store: ScopedStore::new(Arc::clone(&backend), user_id.to_string()),
        media: Arc::new(TerminalMedia),
        events: events_tx,
    });
    client.connect().await?;

    println!("Connected; printing bridge events (ctrl-c to stop)");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(BridgeEvent::Message(message)) => {
                    for part in &message.parts {
                        println!("[{}] {}: {}", message.portal, message.sender, part.body);
                    }
                }
                Some(event) => println!("{event:?}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect();
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config: DaemonConfig = serde_yaml::from_str(&std::fs::read_to_string(&path)?)?;

    let level = config
        .log_level
        .as_deref()
        .unwrap_or("info")
        .parse()
        .unwrap_or(log::LevelFilter::Info);
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .init()
        .expect("failed to set up logging");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config))
}
