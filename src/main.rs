use anyhow::Result;
use chord::{is_address, Bucket, Config};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let config = Config::parse();

    let bucket = Bucket::listen(
        &config.bind,
        config.port,
        config.replicas,
        Duration::from_millis(config.stabilize_ms),
    )
    .await?;
    println!("{} listening on {}", bucket.id(), bucket.address());

    // topology transitions, printed as they happen
    let mut events = bucket.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("Event: {event}"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Some(introducer) = &config.join {
        if let Err(e) = bucket.join(introducer).await {
            eprintln!("ERR: Unable to join host '{introducer}': {e}");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print!("> ");
    std::io::stdout().flush()?;

    while let Some(line) = lines.next_line().await? {
        if !run_command(&bucket, line.trim()).await {
            break;
        }
        print!("> ");
        std::io::stdout().flush()?;
    }

    bucket.close();
    Ok(())
}

// returns false when the shell should exit
async fn run_command(bucket: &Arc<Bucket>, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return true;
    };
    let args: Vec<&str> = parts.collect();

    match command {
        "join" => match args.first() {
            Some(host) if is_address(host) => {
                if let Err(e) = bucket.join(host).await {
                    eprintln!("ERR: {e}");
                }
            }
            _ => print_help(),
        },

        "get" => match args.first() {
            Some(key) => match bucket.get(key).await {
                Ok(value) => println!("<Entry {key}> {}", String::from_utf8_lossy(&value)),
                Err(_) => eprintln!("<Entry {key}> undefined"),
            },
            None => print_help(),
        },

        "set" => match args.split_first() {
            Some((key, rest)) => {
                let value = rest.join(" ").into_bytes();
                if let Err(e) = bucket.set(key, value).await {
                    eprintln!("ERR: Unable to set key '{key}': {e}");
                }
            }
            None => print_help(),
        },

        "del" => match args.first() {
            Some(key) => {
                if let Err(e) = bucket.del(key).await {
                    eprintln!("ERR: Unable to delete key '{key}': {e}");
                }
            }
            None => print_help(),
        },

        "ping" => match args.first() {
            Some(host) if is_address(host) => match bucket.ping(host).await {
                Ok(elapsed) => {
                    println!("<Ping {host}> {:.3} ms", elapsed.as_secs_f64() * 1e3)
                }
                Err(e) => eprintln!("ERR: {e}"),
            },
            _ => print_help(),
        },

        "state" => {
            let fingers = args.contains(&"-f");
            let host = args.iter().find(|a| is_address(a)).copied();
            match bucket.state(host, fingers).await {
                Ok(state) => {
                    let predecessor = state
                        .predecessor
                        .map(|p| p.addr)
                        .unwrap_or_default();
                    println!("<Predecessor> {predecessor}");
                    println!("<Self> {}", state.addr);
                    for (i, successor) in state.successors.iter().enumerate() {
                        println!("<Successor {i}> {successor}");
                    }
                    for (i, finger) in state.fingers.iter().flatten().enumerate() {
                        println!("<Finger {i}> {finger}");
                    }
                }
                Err(e) => eprintln!("ERR: {e}"),
            }
        }

        "dump" => {
            let host = args.iter().find(|a| is_address(a)).copied();
            match bucket.dump(host).await {
                Ok(entries) => {
                    for (key, value) in entries {
                        println!("<Entry {key}> {}", String::from_utf8_lossy(&value));
                    }
                }
                Err(e) => eprintln!("ERR: {e}"),
            }
        }

        "quit" => {
            bucket.close();
            return false;
        }

        _ => print_help(),
    }
    true
}

fn print_help() {
    eprintln!("Commands:");
    eprintln!(" join <address>            Add this peer to a network.");
    eprintln!(" get <key>                 Read a value from network.");
    eprintln!(" set <key> [value]         Create/update a key in the network.");
    eprintln!(" del <key>                 Delete a key and value from the network.");
    eprintln!(" ping <address>            Ping a remote peer.");
    eprintln!(" state [address] [-f]      Print peer information and optional finger table.");
    eprintln!(" dump [address]            Print bucket contents.");
    eprintln!(" quit                      Leave the network and exit.");
    eprintln!(" help                      Show this screen.");
}
