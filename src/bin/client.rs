//! Standalone client binary for a rustcache server
//!
//! Provides a command-line interface for interacting with the server

use std::env;
use std::io::{self, Write};

use rustcache::{Client, ClientConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ClientConfig::default();
    if let Some(addr) = env::args().nth(1) {
        if let Some((host, port)) = addr.rsplit_once(':') {
            config.host = host.to_string();
            config.port = port.parse()?;
        }
    }

    println!("Connecting to rustcache at {}:{}...", config.host, config.port);
    let mut client = Client::connect(config).await?;
    println!("Connected! Type 'help' for available commands or 'quit' to exit.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        match input {
            "quit" | "exit" => {
                println!("Goodbye!");
                break;
            }
            "help" => {
                print_help();
            }
            _ => {
                if let Err(e) = handle_command(&client, input).await {
                    println!("Error: {}", e);
                }
            }
        }
    }

    client.stop().await?;
    Ok(())
}

async fn handle_command(client: &Client, input: &str) -> Result<(), Box<dyn std::error::Error>> {
    let parts: Vec<&str> = input.split_whitespace().collect();

    match parts.first() {
        Some(&"ping") => {
            client.ping().await?;
            println!("PONG");
        }
        Some(&"set") => {
            if parts.len() != 3 {
                println!("Usage: set <key> <value>");
                return Ok(());
            }

            client.set(parts[1], parts[2]).await?;
            println!("OK");
        }
        Some(&"get") => {
            if parts.len() != 2 {
                println!("Usage: get <key>");
                return Ok(());
            }

            match client.get(parts[1]).await {
                Ok(value) => println!("{}", value),
                Err(e) => println!("(error) {}", e),
            }
        }
        Some(&"delete") | Some(&"del") => {
            if parts.len() != 2 {
                println!("Usage: del <key>");
                return Ok(());
            }

            client.del(parts[1]).await?;
            println!("OK");
        }
        _ => {
            println!(
                "Unknown command: {}. Type 'help' for available commands.",
                parts[0]
            );
        }
    }

    Ok(())
}

fn print_help() {
    println!("Available commands:");
    println!("  ping               - Check the connection");
    println!("  set <key> <value>  - Set a key-value pair");
    println!("  get <key>          - Get value by key");
    println!("  del <key>          - Delete a key");
    println!("  help               - Show this help message");
    println!("  quit               - Exit the client");
}
