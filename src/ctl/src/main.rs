mod client;
mod commands;
mod config;

use std::env;

use hyper::{Method, StatusCode};
use serde_json::{json, Value};

use client::{Client, Error};
use commands::*;
use config::Config;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5000;

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  rewind-ctl list");
    eprintln!("  rewind-ctl get <id>");
    eprintln!("  rewind-ctl add <name> <age>");
    eprintln!("  rewind-ctl update <id> <name> <age>");
    eprintln!("  rewind-ctl delete <id>");
    eprintln!("  rewind-ctl restore <id>");
    eprintln!("  rewind-ctl undo <id>");
    eprintln!("  rewind-ctl redo <id>");
    eprintln!("  rewind-ctl history <id>");
    eprintln!();
    eprintln!("Cluster operations:");
    eprintln!("  rewind-ctl status                      - Replication status per node");
    eprintln!("  rewind-ctl replicate [node...]         - Full resync (all replicas if none given)");
    eprintln!("  rewind-ctl disconnect [node]           - Simulate failure (primary if none given)");
    eprintln!("  rewind-ctl reconnect [node]            - Reconnect a node (primary if none given)");
    eprintln!("  rewind-ctl restore-primary [node]      - Make <node> primary and mark it alive");
    eprintln!("  rewind-ctl whoami");
    eprintln!("  rewind-ctl metrics");
    eprintln!();
    eprintln!("Configuration:");
    eprintln!("  rewind-ctl use <host:port>             - Save default node to ~/.rewindrc");
    eprintln!("  rewind-ctl forget                      - Remove ~/.rewindrc");
    eprintln!();
    eprintln!("Environment variables (override ~/.rewindrc):");
    eprintln!("  REWIND_HOST      - Node host (default: 127.0.0.1)");
    eprintln!("  REWIND_HTTP_PORT - Node HTTP port (default: 5000)");
}

fn usage_error(message: &str) -> ! {
    eprintln!("Error: {}", message);
    print_usage();
    std::process::exit(1);
}

fn parse_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

/// Environment first, then ~/.rewindrc, then defaults
fn resolve_target(config: &Config) -> (String, u16) {
    let host = env::var("REWIND_HOST")
        .ok()
        .or_else(|| config.host.clone())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = match env::var("REWIND_HTTP_PORT") {
        Ok(port_str) => match port_str.parse() {
            Ok(p) => p,
            Err(e) => {
                eprintln!("Error: Invalid port number '{}': {}", port_str, e);
                std::process::exit(1);
            }
        },
        Err(_) => config.port.unwrap_or(DEFAULT_PORT),
    };

    (host, port)
}

fn arg<'a>(args: &'a [String], index: usize, what: &str) -> &'a str {
    match args.get(index) {
        Some(value) => value.as_str(),
        None => usage_error(&format!("missing {}", what)),
    }
}

fn record_path(args: &[String], suffix: &str) -> String {
    let id = arg(args, 2, "<id>");
    if id.parse::<u64>().is_err() {
        usage_error(&format!("invalid id '{}'", id));
    }
    format!("/people/{}{}", id, suffix)
}

fn record_body(name: &str, age: &str) -> Value {
    let age: i64 = match age.parse() {
        Ok(age) => age,
        Err(_) => usage_error(&format!("age must be a number, got '{}'", age)),
    };
    json!({ "name": name, "age": age })
}

fn node_body(args: &[String]) -> Option<Value> {
    args.get(2).map(|node| json!({ "node": node }))
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

/// Prints the body on success; on failure prints the server's error and exits
fn report(status: StatusCode, body: &Value) {
    if status.is_success() {
        if !body.is_null() {
            print_json(body);
        } else {
            println!("OK");
        }
        return;
    }

    let kind = body.get("kind").and_then(Value::as_str).unwrap_or("error");
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string());
    eprintln!("ERR {} ({}): {}", kind.to_uppercase(), status.as_u16(), message);
    std::process::exit(1);
}

async fn run(args: &[String]) -> Result<(), Error> {
    let command = args[1].as_str();

    match command {
        COMMAND_USE => {
            let target = arg(args, 2, "<host:port>");
            let Some((host, port)) = parse_target(target) else {
                usage_error(&format!("invalid target '{}'", target));
            };
            let config = Config {
                host: Some(host.clone()),
                port: Some(port),
            };
            config.save()?;
            println!("Default node set to {}:{}", host, port);
            return Ok(());
        }
        COMMAND_FORGET => {
            Config::delete()?;
            println!("Removed {}", Config::path()?.display());
            return Ok(());
        }
        _ => {}
    }

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: ignoring unreadable ~/.rewindrc: {}", e);
        Config::default()
    });
    let (host, port) = resolve_target(&config);
    let client = Client::new(&host, port);

    let (method, path, body) = match command {
        COMMAND_LIST => (Method::GET, "/people".to_string(), None),
        COMMAND_GET => (Method::GET, record_path(args, ""), None),
        COMMAND_ADD => {
            let body = record_body(arg(args, 2, "<name>"), arg(args, 3, "<age>"));
            (Method::POST, "/people".to_string(), Some(body))
        }
        COMMAND_UPDATE => {
            let path = record_path(args, "");
            let body = record_body(arg(args, 3, "<name>"), arg(args, 4, "<age>"));
            (Method::PUT, path, Some(body))
        }
        COMMAND_DELETE => (Method::DELETE, record_path(args, ""), None),
        COMMAND_RESTORE => (Method::POST, record_path(args, "/restore"), None),
        COMMAND_UNDO => (Method::POST, record_path(args, "/undo"), None),
        COMMAND_REDO => (Method::POST, record_path(args, "/redo"), None),
        COMMAND_HISTORY => (Method::GET, record_path(args, "/history"), None),
        COMMAND_STATUS => (Method::GET, "/replication-status".to_string(), None),
        COMMAND_REPLICATE => {
            let nodes: Vec<&String> = args[2..].iter().collect();
            (Method::POST, "/run-replication".to_string(), Some(json!({ "nodes": nodes })))
        }
        COMMAND_DISCONNECT => (Method::POST, "/failover/disconnect".to_string(), node_body(args)),
        COMMAND_RECONNECT => (Method::POST, "/failover/reconnect".to_string(), node_body(args)),
        COMMAND_RESTORE_PRIMARY => (Method::POST, "/restore-primary".to_string(), node_body(args)),
        COMMAND_WHOAMI => (Method::GET, "/whoami".to_string(), None),
        COMMAND_METRICS => {
            let (status, bytes) = client.send(Method::GET, "/metrics", None).await?;
            if !status.is_success() {
                eprintln!("ERR ({}): metrics unavailable", status.as_u16());
                std::process::exit(1);
            }
            print!("{}", String::from_utf8_lossy(&bytes));
            return Ok(());
        }
        other => usage_error(&format!("unknown command '{}'", other)),
    };

    let (status, value) = client.json(method, &path, body).await?;
    report(status, &value);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    if let Err(e) = run(&args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
