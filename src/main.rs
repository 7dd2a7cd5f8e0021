//! quillpress - manage and exercise blog plugins from the command line.
//!
//! Usage:
//!   quillpress list                      List installed plugins
//!   quillpress enable|disable <ID>       Toggle a plugin
//!   quillpress set <ID> KEY=VALUE...     Save plugin settings
//!   quillpress install <ZIP>             Install a plugin archive
//!   quillpress filter <HOOK> <TEXT>      Run text through a hook chain
//!   quillpress route <METHOD> <PATH>     Resolve a plugin route
//!   quillpress --help                    Show help

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, eyre};
use serde::Serialize;

use quillpress_plugin::{
    HookName, PluginManager, PluginRegistry, PluginSummary, ReloadSummary, RouteResponse,
    RuntimeConfig,
};

#[derive(Parser)]
#[command(
    name = "quillpress",
    version,
    about = "Manage quillpress blog plugins",
    long_about = "quillpress loads the plugins under a plugins directory (JavaScript or Rhai), \
                  lets you toggle, configure, install and delete them, and runs content \
                  through their hooks and routes the way the blog server would."
)]
struct Cli {
    /// Plugins directory (overrides the config file)
    #[arg(short, long, global = true)]
    plugins: Option<PathBuf>,

    /// Runtime configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every plugin, active or not
    List,

    /// Reload all plugins from disk and report the outcome
    Reload,

    /// Activate a plugin
    Enable {
        /// Plugin id
        id: String,
    },

    /// Deactivate a plugin
    Disable {
        /// Plugin id
        id: String,
    },

    /// Delete an inactive plugin's directory
    Delete {
        /// Plugin id
        id: String,
    },

    /// Install plugins from a zip archive
    Install {
        /// Archive to extract into the plugins directory
        archive: PathBuf,
    },

    /// Save plugin settings
    Set {
        /// Plugin id
        id: String,

        /// Settings as KEY=VALUE pairs
        #[arg(required = true)]
        values: Vec<String>,
    },

    /// Run text through every active plugin's hook
    Filter {
        /// Hook name (OnContentRender, OnMarkdown, OnRequest, OnResponse)
        hook: HookName,

        /// Input text
        text: String,
    },

    /// Check whether a plugin intercepts a request path
    Request {
        /// Request path
        path: String,
    },

    /// Notify plugins of a served page
    Respond {
        /// Request path
        path: String,

        /// Final page HTML
        html: String,
    },

    /// Resolve a plugin route
    Route {
        /// HTTP method
        method: String,

        /// Request path
        path: String,
    },

    /// List GET routes contributed by active plugins
    Routes,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    let registry = Arc::new(PluginRegistry::new(config));
    Arc::clone(&registry)
        .reload_async()
        .await
        .context("Failed to load plugins")?;
    let manager = PluginManager::new(Arc::clone(&registry));
    let format = cli.format;

    match cli.command {
        Command::List => print_list(&manager.list(), format)?,
        Command::Reload => {
            let summary = manager.reload().context("Reload failed")?;
            print_summary(&summary, format)?;
        }
        Command::Enable { id } => {
            let summary = manager.set_active(&id, true).context("Enable failed")?;
            print_summary(&summary, format)?;
        }
        Command::Disable { id } => {
            let summary = manager.set_active(&id, false).context("Disable failed")?;
            print_summary(&summary, format)?;
        }
        Command::Delete { id } => {
            let summary = manager.delete(&id).context("Delete failed")?;
            print_summary(&summary, format)?;
        }
        Command::Install { archive } => {
            let summary = manager
                .install_archive(&archive)
                .with_context(|| format!("Failed to install {}", archive.display()))?;
            print_summary(&summary, format)?;
        }
        Command::Set { id, values } => {
            let values = parse_assignments(&values)?;
            let summary = manager.save_settings(&id, &values).context("Saving settings failed")?;
            print_summary(&summary, format)?;
        }
        Command::Filter { hook, text } => {
            let output = registry.apply_filter(hook, &text);
            print_value(&output, format, |s| println!("{s}"))?;
        }
        Command::Request { path } => {
            let intercepted = registry.apply_request_filter(&path);
            print_value(&intercepted, format, |page| match page {
                Some(html) => println!("{html}"),
                None => eprintln!("Not intercepted: {path}"),
            })?;
        }
        Command::Respond { path, html } => {
            registry.apply_response_filter(&path, &html);
            eprintln!("Notified plugins of {path}");
        }
        Command::Route { method, path } => {
            let response = registry.match_route(&method, &path);
            print_value(&response, format, |response| match response {
                Some(response) => print_route(response),
                None => eprintln!("No plugin route for {method} {path}"),
            })?;
        }
        Command::Routes => {
            let routes = registry.active_routes();
            print_value(&routes, format, |routes| {
                for route in routes {
                    println!("{route}");
                }
            })?;
        }
    }

    registry.shutdown();
    Ok(())
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("quillpress={level},quillpress_plugin={level},plugin={level},warn"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("Invalid config file {}", path.display()))?,
        None => RuntimeConfig::default(),
    };

    Ok(match &cli.plugins {
        Some(dir) => config.with_plugin_dir(dir),
        None => config,
    })
}

/// Parse `KEY=VALUE` arguments.
fn parse_assignments(args: &[String]) -> Result<HashMap<String, String>> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| eyre!("Expected KEY=VALUE, got '{arg}'"))
        })
        .collect()
}

/// Print `value` as JSON, or with `text` in text mode.
fn print_value<T: Serialize>(value: &T, format: OutputFormat, text: impl FnOnce(&T)) -> Result<()> {
    match format {
        OutputFormat::Text => text(value),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn print_summary(summary: &ReloadSummary, format: OutputFormat) -> Result<()> {
    print_value(summary, format, |summary| {
        println!(
            "Generation {}: {} plugins, {} active, {} loaded",
            summary.generation, summary.discovered, summary.active, summary.loaded
        );
        for dir in &summary.skipped {
            println!("  skipped {dir}");
        }
    })
}

fn print_list(plugins: &[PluginSummary], format: OutputFormat) -> Result<()> {
    print_value(&plugins, format, |plugins| {
        if plugins.is_empty() {
            println!("No plugins installed.");
            return;
        }

        println!("{}", "─".repeat(70));
        println!(" {:<20} {:<10} {:<8} {:<8} {}", "ID", "VERSION", "ACTIVE", "ENGINE", "NAME");
        println!("{}", "─".repeat(70));
        for plugin in plugins.iter() {
            println!(
                " {:<20} {:<10} {:<8} {:<8} {}",
                truncate(&plugin.id, 20),
                truncate(&plugin.version, 10),
                if plugin.active { "yes" } else { "no" },
                plugin.engine.unwrap_or("-"),
                plugin.name
            );
            if !plugin.hooks.is_empty() {
                let hooks: Vec<_> = plugin.hooks.iter().map(HookName::name).collect();
                println!("   hooks:  {}", hooks.join(", "));
            }
            for route in &plugin.routes {
                println!("   route:  {} {} -> {}", route.method, route.path, route.handler);
            }
        }
    })
}

fn print_route(response: &RouteResponse) {
    match response {
        RouteResponse::TemplateView { template, fields } => {
            println!("template: {template}");
            let mut keys: Vec<_> = fields.keys().collect();
            keys.sort();
            for key in keys {
                let value = serde_json::to_string(&fields[key]).unwrap_or_default();
                println!("  {key} = {value}");
            }
        }
        RouteResponse::RawHtml { html } => println!("{html}"),
        RouteResponse::Data { value } => {
            println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
        }
    }
}

/// Truncate a string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 1).collect();
        format!("{kept}…")
    }
}
