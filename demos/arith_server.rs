// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::Mutex;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_derive::{Deserialize, Serialize};
use slog::{error, o, Drain, Logger};

use evolving_rpc::config::ClientConfig;
use evolving_rpc::rpc_server::{DistributedServer, RpcServer};
use evolving_rpc::service::{MethodSet, RpcService};
use evolving_rpc::{Server, ServiceEndpoint};

static APP: &'static str = "arith_server";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3302;
const DEFAULT_REGISTRY_PORT: u16 = 6601;

#[derive(Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Args {
    a: i64,
    b: i64,
}

#[derive(Default, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Product {
    pro: i64,
}

#[derive(Default, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Quotient {
    quo: i64,
    rem: i64,
}

struct Arith;

impl RpcService for Arith {
    fn register_methods(methods: &mut MethodSet<Self>) {
        methods.add_method("Multiply", |_: &Arith, args: Args| Product {
            pro: args.a * args.b,
        });
        // A zero divisor panics; the caller gets the panic text back.
        methods.add_method("Divide", |_: &Arith, args: Args| Quotient {
            quo: args.a / args.b,
            rem: args.a % args.b,
        });
    }
}

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Serves the Arith service, optionally through a registry center")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("Address announced to the registry center")
                .long("host")
                .short("h")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port to serve on (Default: 3302)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("registry_host")
                .help("Registry center host; serve directly when absent")
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

    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u16).unwrap_or(DEFAULT_PORT);
    let addr = format!("0.0.0.0:{}", port);

    let listener = Server::bind(&addr).await.unwrap_or_else(|e| {
        error!(root_log, "failed to bind"; "address" => &addr, "err" => %e);
        process::exit(1)
    });

    match matches.value_of("registry_host") {
        Some(registry_host) => {
            let registry_port = value_t!(matches, "registry_port", u16)
                .unwrap_or(DEFAULT_REGISTRY_PORT);
            let endpoint = ServiceEndpoint::new("Arith", host, port, "json");
            let registry_conf = ClientConfig::new(registry_host, registry_port);

            let mut server =
                DistributedServer::new(endpoint, registry_conf, Some(&root_log));
            server.register(Arith).unwrap_or_else(|e| {
                error!(root_log, "failed to register service"; "err" => %e);
                process::exit(1)
            });
            if let Err(e) = server.serve(listener).await {
                error!(root_log, "failed to start"; "err" => %e);
                process::exit(1)
            }
        }
        None => {
            let mut server = RpcServer::new(Some(&root_log));
            server.register(Arith).unwrap_or_else(|e| {
                error!(root_log, "failed to register service"; "err" => %e);
                process::exit(1)
            });
            server.serve(listener).await;
        }
    }
}
