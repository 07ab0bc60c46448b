//! `conductor tools` and `conductor config`.

use conductor_agent::Orchestrator;
use conductor_core::{Config, ToolDescriptor};
use conductor_mcp::transport::from_config;
use conductor_mcp::{RpcConfig, Scope, ServerHandle};

/// Start every enabled server, print its tools and stop it again.
pub async fn list_tools(config: &Config) -> anyhow::Result<()> {
    let root = Scope::root();
    let rpc = RpcConfig::from(&config.rpc);
    let mut started = 0;

    for entry in config.enabled_servers() {
        let server = match from_config(entry) {
            Ok(server) => server,
            Err(e) => {
                eprintln!("{}: {}", entry.name, e);
                continue;
            }
        };

        match ServerHandle::start(server.as_ref(), rpc.clone(), &root).await {
            Ok(handle) => {
                started += 1;
                let info = handle.client().server_info();
                println!(
                    "{} ({} {})",
                    handle.name(),
                    info.name,
                    info.version.as_deref().unwrap_or("")
                );
                for tool in handle.client().tools() {
                    print_tool(tool);
                }
                handle.shutdown().await;
            }
            Err(e) => eprintln!("{}: {}", entry.name, e),
        }
    }

    if started == 0 {
        println!("No tool servers started.");
    }
    Ok(())
}

/// Print the aggregated catalog of a running orchestrator.
pub fn print_catalog(orchestrator: &Orchestrator) {
    let tools = orchestrator.all_tools();
    if tools.is_empty() {
        println!("No tools available.");
        return;
    }
    for server in orchestrator.servers() {
        println!("{}:", server.name());
        for tool in server.client().tools() {
            print_tool(tool);
        }
    }
}

pub fn show_config(config: &Config) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

fn print_tool(tool: &ToolDescriptor) {
    match &tool.description {
        Some(description) => println!("  {:<24} {}", tool.name, first_line(description)),
        None => println!("  {}", tool.name),
    }
    let required = tool.required_params();
    if !required.is_empty() {
        println!("  {:<24} requires: {}", "", required.join(", "));
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
