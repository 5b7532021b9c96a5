// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{error, info, o, Drain, Logger};

use evolving_rpc::config::RegistryConfig;
use evolving_rpc::{Server, ServiceRegistry};

static APP: &'static str = "registry_center";
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Registry center for evolving-rpc services")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("Address to listen on (Default: 0.0.0.0)")
                .long("host")
                .short("h")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port to listen on (Default: 6601)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("retention")
                .help("Seconds a Down endpoint is kept (Default: 30)")
                .long("retention")
                .short("r")
                .takes_value(true),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let mut conf = RegistryConfig::default();
    if let Some(host) = matches.value_of("host") {
        conf.bind_host = host.to_string();
    }
    if matches.is_present("port") {
        conf.bind_port =
            value_t!(matches, "port", u16).unwrap_or_else(|e| e.exit());
    }
    if matches.is_present("retention") {
        let secs =
            value_t!(matches, "retention", u64).unwrap_or_else(|e| e.exit());
        conf.retention = Duration::from_secs(secs);
    }

    let registry = Arc::new(ServiceRegistry::new(&conf, Some(&root_log)));
    registry.spawn_eviction();

    let snapshot_registry = Arc::clone(&registry);
    let snapshot_log = root_log.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
        loop {
            ticker.tick().await;
            info!(snapshot_log, "registry snapshot";
                "snapshot" => snapshot_registry.snapshot_json().to_string());
        }
    });

    let listener = Server::bind(conf.addr()).await.unwrap_or_else(|e| {
        error!(root_log, "failed to bind";
            "address" => conf.addr(), "err" => %e);
        process::exit(1)
    });
    Server::registry_center(registry, Some(&root_log))
        .serve(listener)
        .await;
}
