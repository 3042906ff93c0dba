use mh_domain::config::{Config, McpTransportKind};

/// Print the configured backends. Nothing is started.
pub fn list(config: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        let out = serde_json::to_string_pretty(&config.mcp.servers)?;
        println!("{out}");
        return Ok(());
    }

    if config.mcp.servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    println!("{:<20} {:<6} {:<6} {:<8} COMMAND", "NAME", "KIND", "AUTO", "RESTARTS");
    for (name, server) in &config.mcp.servers {
        let kind = match server.transport {
            McpTransportKind::Stdio => "stdio",
            McpTransportKind::Sse => "sse",
        };
        let restarts = if server.restart_on_failure {
            server.max_restarts.to_string()
        } else {
            "off".into()
        };
        let command = std::iter::once(server.command.as_str())
            .chain(server.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<20} {:<6} {:<6} {:<8} {command}",
            name,
            kind,
            if server.auto_start { "yes" } else { "no" },
            restarts,
        );
    }
    Ok(())
}
