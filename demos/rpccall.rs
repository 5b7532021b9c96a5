// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::Mutex;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{o, Drain, Level, LevelFilter, Logger};

use evolving_rpc::config::{ClientConfig, DistributedClientConfig};
use evolving_rpc::{Client, DistributedClient, RpcError};

static APP: &'static str = "rpccall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3302;
const DEFAULT_REGISTRY_PORT: u16 = 6601;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making an evolving-rpc method call")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 3302)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("registry_host")
                .help("Resolve the service through this registry center")
                .long("registry-host")
                .short("r")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("registry_port")
                .help("Registry center port (Default: 6601)")
                .long("registry-port")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Remote method, as Service.Method")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON-encoded request")
                .long("args")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Seconds to wait for the reply (Default: 10)")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("abandon")
                .help("Send the request without waiting for a reply")
                .long("abandon-immediately")
                .short("a")
                .takes_value(false),
        )
        .get_matches()
}

async fn call_direct(
    host: String,
    port: u16,
    method: &str,
    args: String,
    synchronous: bool,
    log: &Logger,
) -> Result<Option<bytes::Bytes>, RpcError> {
    let client = Client::connect(&ClientConfig::new(host, port), Some(log)).await?;
    let reply = client.execute_command(method, args, synchronous).await;
    client.close();
    reply
}

async fn call_distributed(
    registry: ClientConfig,
    method: &str,
    args: String,
    synchronous: bool,
    log: &Logger,
) -> Result<Option<bytes::Bytes>, RpcError> {
    let service = method.split('.').next().unwrap_or(method).to_string();
    let conf = DistributedClientConfig {
        registries: vec![registry],
        dependencies: vec![service.clone()],
        ..DistributedClientConfig::default()
    };
    let client = DistributedClient::connect(conf, Some(log)).await?;
    let reply = client
        .execute_command(&service, method, args, synchronous)
        .await;
    client.close();
    reply
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!(),
    );

    let method = String::from(matches.value_of("method").unwrap_or_else(|| {
        eprintln!("Failed to parse method argument as String");
        process::exit(1)
    }));
    let args = value_t!(matches, "args", serde_json::Value)
        .unwrap_or_else(|e| e.exit())
        .to_string();
    let wait = Duration::from_secs(value_t!(matches, "timeout", u64).unwrap_or(10));
    let synchronous = !matches.is_present("abandon");

    let call = async {
        match matches.value_of("registry_host") {
            Some(registry_host) => {
                let registry_port = value_t!(matches, "registry_port", u16)
                    .unwrap_or(DEFAULT_REGISTRY_PORT);
                let registry = ClientConfig::new(registry_host, registry_port);
                call_distributed(registry, &method, args, synchronous, &log).await
            }
            None => {
                let host =
                    String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
                let port = value_t!(matches, "port", u16).unwrap_or(DEFAULT_PORT);
                call_direct(host, port, &method, args, synchronous, &log).await
            }
        }
    };

    match tokio::time::timeout(wait, call).await {
        Ok(Ok(Some(body))) => println!("{}", String::from_utf8_lossy(&body)),
        Ok(Ok(None)) => println!("Sent {} request", method),
        Ok(Err(e)) => {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
        Err(_) => {
            eprintln!("Error: {}", RpcError::Timeout);
            process::exit(1)
        }
    }
}
