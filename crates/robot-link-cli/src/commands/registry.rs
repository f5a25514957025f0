use colored::Colorize;

use robot_link::{LinkConfig, LinkResult, RegistryClient};

// ─── Robots ─────────────────────────────────────────────────────────────

pub async fn cmd_robots(config: &LinkConfig) -> LinkResult<()> {
    let registry = RegistryClient::new(config)?;
    let robots = registry.list_online_robots().await?;

    if robots.is_empty() {
        println!("{}", "No robots online.".yellow());
        return Ok(());
    }

    println!("\n{} ({})", "Online robots:".bright_blue(), robots.len());
    for robot in &robots {
        let kind = robot.robot_type.as_deref().unwrap_or("unknown");
        println!("  {} {}", robot.uuid.cyan(), kind.dimmed());
    }
    Ok(())
}

// ─── Register ───────────────────────────────────────────────────────────

pub async fn cmd_register(config: &LinkConfig, client_id: Option<&str>) -> LinkResult<()> {
    let client_id = client_id.unwrap_or(&config.client_id);
    let registry = RegistryClient::new(config)?;

    println!("Registering {}...", client_id.cyan());
    registry.register_client(client_id).await?;
    println!("{}", "Registered!".green());
    Ok(())
}
