// Copyright 2020 Joyent, Inc.

use std::env;
use std::process;
use std::sync::Mutex;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::json;
use slog::{info, o, Drain, Level, LevelFilter, Logger};
use uuid::Uuid;

use fast_messages::message::Event;
use fast_messages::server::{Server, ServerConfig};

static APP: &str = "msgserve";
const DEFAULT_PORT: u16 = 2030;
const DEFAULT_INTERVAL_MS: u64 = 1000;

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Run an event stream server that broadcasts heartbeat events")
        .version(crate_version!())
        .arg(
            Arg::with_name("port")
                .help("TCP port to listen on (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("interval")
                .help("Milliseconds between heartbeats (Default: 1000)")
                .long("interval")
                .short("i")
                .takes_value(true),
        )
        .get_matches()
}

fn log_level_from_env() -> Level {
    match env::var("LOG_LEVEL").ok() {
        None => Level::Info,
        Some(ref s) if s == "fatal" => Level::Critical,
        Some(s) => s.parse::<Level>().unwrap_or(Level::Info),
    }
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let port = value_t!(matches, "port", u16).unwrap_or(DEFAULT_PORT);
    let interval =
        value_t!(matches, "interval", u64).unwrap_or(DEFAULT_INTERVAL_MS);

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            log_level_from_env(),
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    );

    let server = Server::new(ServerConfig {
        server_id: Uuid::now_v7().to_string(),
        log: Some(root_log.clone()),
    });

    let addr = server.listen(port).await.unwrap_or_else(|e| {
        eprintln!("Failed to listen on port {}: {}", port, e);
        process::exit(1)
    });
    info!(root_log, "broadcasting heartbeats"; "address" => %addr);

    let mut seq = 0u64;
    loop {
        seq += 1;
        let event = Event {
            id: Some(seq),
            name: "heartbeat".to_string(),
            value: json!({ "seq": seq }),
            req_id: None,
            server_id: None,
        };
        if let Err(e) = server.send(event) {
            eprintln!("Failed to broadcast heartbeat: {}", e);
            process::exit(1)
        }
        tokio::time::sleep(Duration::from_millis(interval)).await;
    }
}
