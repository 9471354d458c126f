use anyhow::Result;
use colored::Colorize;
use faultline::alerts::AlertChannel;
use faultline::Config;
use tracing::info;

/// Execute the config show command
///
/// Displays the effective configuration with alert destinations masked
pub fn show(cfg: &Config) -> Result<()> {
    info!("Displaying effective configuration");

    let sanitized = sanitize_secrets(cfg);

    println!("{}", "Current Configuration:".green().bold());
    println!();

    let toml_string = toml::to_string_pretty(&sanitized)?;
    println!("{}", toml_string);

    Ok(())
}

/// Execute the config validate command
///
/// Loading already validated the configuration; this prints a summary
pub fn validate(cfg: &Config) -> Result<()> {
    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!("  Capture: {}", if cfg.enabled { "enabled" } else { "disabled" });
    println!(
        "  Sample rates: errors {}, performance {}",
        cfg.sample_rate, cfg.performance_sample_rate
    );
    println!("  Ignored exception types: {}", cfg.ignored_exception_types.len());
    println!("  Ignored path patterns: {}", cfg.ignored_path_patterns.len());
    println!("  Buffer: {:?}, max {}", cfg.buffer_backend, cfg.buffer_max_size);
    println!("  Alert channels: {}", describe_channels(&cfg.alert_channels));

    info!("Configuration validation successful");
    Ok(())
}

/// Mask alert destinations for safe display
fn sanitize_secrets(cfg: &Config) -> Config {
    let mut sanitized = cfg.clone();

    for channel in &mut sanitized.alert_channels {
        match channel {
            AlertChannel::Webhook { url } => *url = mask_url(url),
            AlertChannel::Slack { webhook_url, .. } => *webhook_url = mask_url(webhook_url),
            AlertChannel::Email { .. } | AlertChannel::Log { .. } => {}
        }
    }

    sanitized
}

/// Keep scheme and host, hide the path that usually carries the token
///
/// Example: "https://hooks.slack.com/services/T0/B0/xyz" -> "https://hooks.slack.com/***"
fn mask_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let host = rest.split('/').next().unwrap_or_default();
            // Userinfo is a secret too
            let host = host.rsplit('@').next().unwrap_or(host);
            format!("{}://{}/***", scheme, host)
        }
        None => "***".to_string(),
    }
}

fn describe_channels(channels: &[AlertChannel]) -> String {
    if channels.is_empty() {
        return "none".to_string();
    }

    channels
        .iter()
        .map(|c| c.kind().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
