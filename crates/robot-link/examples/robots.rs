//! List the robots currently online at the relay server.
//!
//! ```bash
//! ROBOT_LINK_SERVER_URL=http://localhost:8080 cargo run --example robots
//! ```

use robot_link::{LinkConfig, RegistryClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = LinkConfig::discover(None)?;
    let registry = RegistryClient::new(&config)?;

    registry.register_client(&config.client_id).await?;
    println!("Registered as {}", config.client_id);

    let robots = registry.list_online_robots().await?;
    if robots.is_empty() {
        println!("No robots online.");
    } else {
        println!("{} robot(s) online:", robots.len());
        for robot in &robots {
            println!(
                "  {} ({})",
                robot.uuid,
                robot.robot_type.as_deref().unwrap_or("unknown type")
            );
        }
    }
    Ok(())
}
