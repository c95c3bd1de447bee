// Copyright 2020 Joyent, Inc.

use std::env;
use std::sync::Mutex;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{info, o, Drain, Level, LevelFilter, Logger};
use uuid::Uuid;

use fast_messages::client::{ClientConfig, ClientEvent, StreamClient};

static APP: &str = "msgsub";
static DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2030;

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Maintain a durable subscription and print received events")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for the event stream server")
                .long("host")
                .short("h")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for the event stream server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("client_id")
                .help("Identity presented to the server (Default: generated)")
                .long("client-id")
                .short("c")
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
    let host =
        String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u16).unwrap_or(DEFAULT_PORT);
    let client_id = matches
        .value_of("client_id")
        .map(String::from)
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            log_level_from_env(),
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    );

    let (client, mut events) = StreamClient::new(ClientConfig {
        client_id,
        host,
        port,
        log: Some(root_log.clone()),
    });
    client.connect();

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Connect => client.start(),
            ClientEvent::Start => info!(root_log, "stream started"),
            ClientEvent::Message(msg) => {
                println!(
                    "{}",
                    serde_json::to_string(&msg).unwrap_or_default()
                );
            }
            ClientEvent::StateChanged(state) => {
                info!(root_log, "state changed"; "state" => state);
            }
            ClientEvent::Close => break,
        }
    }
}
