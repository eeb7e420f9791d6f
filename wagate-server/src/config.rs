//! Server configuration and CLI argument parsing
//!
//! Settings come from:
//! - Command-line arguments
//! - Environment variables (with WAGATE_ prefix)
//! - An optional policy file overriding the per-category limits
//!
//! # Configuration Priority
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables
//! 3. Default values (lowest priority)
//!
//! # Example Usage
//!
//! ```bash
//! # Using CLI arguments
//! wagate --access-token EAAG... --phone-number-id 106540352242922
//!
//! # Using environment variables
//! export WAGATE_ACCESS_TOKEN=EAAG...
//! export WAGATE_PHONE_NUMBER_ID=106540352242922
//! export WAGATE_REAP_POLICY=settled
//! wagate --policy-file limits.toml
//! ```
//!
//! # Policy File
//!
//! Any format supported by the `config` crate (TOML, YAML, JSON). One table
//! per category; missing fields keep their defaults:
//!
//! ```toml
//! [messaging]
//! max_concurrent = 5
//! min_spacing_ms = 45000
//! reservoir = 80
//! refill_amount = 80
//! refill_interval_ms = 3600000
//! ```

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wagate::{Category, Policy, PolicyTable, ReapPolicy};

/// Main configuration structure for the server
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listener
    pub http: HttpConfig,
    /// Outbound WhatsApp Cloud API settings
    pub whatsapp: WhatsAppConfig,
    /// Limiter actor settings
    pub scheduler: SchedulerConfig,
    /// How far an event subscriber may lag before losing events
    pub event_capacity: usize,
    /// Logging level (error, warn, info, debug, trace)
    pub log_level: String,
}

/// HTTP listener configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Host address to bind to (e.g., "0.0.0.0")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

/// WhatsApp Cloud API configuration
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    /// Graph API root, without version
    pub base_url: String,
    /// Graph API version, e.g. "v21.0"
    pub api_version: String,
    pub access_token: String,
    /// Sending phone number; also the scope of its messaging limiters
    pub phone_number_id: String,
    pub business_account_id: Option<String>,
    /// Token expected by `GET /webhook` subscription verification
    pub verify_token: Option<String>,
}

/// Limiter actor configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub policies: PolicyTable,
    /// Channel buffer size for actor communication
    pub buffer_size: usize,
    /// How often idle limiters are reaped
    pub reap_interval: Duration,
    pub reap_policy: ReapPolicy,
    /// Give up on admission after this long; `None` waits forever
    pub queue_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            policies: PolicyTable::default(),
            buffer_size: 10_000,
            reap_interval: Duration::from_secs(3600),
            reap_policy: ReapPolicy::Idle,
            queue_timeout: None,
        }
    }
}

/// Command-line arguments for the server
///
/// All arguments can also be set via environment variables with the
/// WAGATE_ prefix. CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(
    name = "wagate",
    about = "Rate-limited gateway to the WhatsApp Cloud API",
    long_about = "Schedules outbound WhatsApp Cloud API traffic through per-phone-number and global token buckets, ingests webhooks and streams activity events.\n\nEnvironment variables with WAGATE_ prefix are supported. CLI arguments take precedence over environment variables."
)]
pub struct Args {
    // HTTP listener
    #[arg(
        long,
        value_name = "HOST",
        help = "HTTP host",
        default_value = "127.0.0.1",
        env = "WAGATE_HTTP_HOST"
    )]
    pub http_host: String,
    #[arg(
        long,
        value_name = "PORT",
        help = "HTTP port",
        default_value_t = 3000,
        env = "WAGATE_HTTP_PORT"
    )]
    pub http_port: u16,

    // WhatsApp Cloud API
    #[arg(
        long,
        value_name = "URL",
        help = "Graph API base URL",
        default_value = "https://graph.facebook.com",
        env = "WAGATE_API_BASE_URL"
    )]
    pub api_base_url: String,
    #[arg(
        long,
        value_name = "VERSION",
        help = "Graph API version",
        default_value = "v21.0",
        env = "WAGATE_API_VERSION"
    )]
    pub api_version: String,
    #[arg(
        long,
        value_name = "TOKEN",
        help = "Access token for the WhatsApp Business account",
        env = "WAGATE_ACCESS_TOKEN",
        hide_env_values = true
    )]
    pub access_token: Option<String>,
    #[arg(
        long,
        value_name = "ID",
        help = "Phone number id messages are sent from",
        env = "WAGATE_PHONE_NUMBER_ID"
    )]
    pub phone_number_id: Option<String>,
    #[arg(
        long,
        value_name = "ID",
        help = "WhatsApp Business account id",
        env = "WAGATE_BUSINESS_ACCOUNT_ID"
    )]
    pub business_account_id: Option<String>,
    #[arg(
        long,
        value_name = "TOKEN",
        help = "Verify token for webhook subscription",
        env = "WAGATE_VERIFY_TOKEN",
        hide_env_values = true
    )]
    pub verify_token: Option<String>,

    // Scheduler
    #[arg(
        long,
        value_name = "PATH",
        help = "File with per-category limit overrides",
        env = "WAGATE_POLICY_FILE"
    )]
    pub policy_file: Option<PathBuf>,
    #[arg(
        long,
        value_name = "SIZE",
        help = "Channel buffer size",
        default_value_t = 10_000,
        env = "WAGATE_BUFFER_SIZE"
    )]
    pub buffer_size: usize,
    #[arg(
        long,
        value_name = "SECS",
        help = "Interval between idle limiter sweeps (seconds)",
        default_value_t = 3600,
        env = "WAGATE_REAP_INTERVAL"
    )]
    pub reap_interval: u64,
    #[arg(
        long,
        value_name = "POLICY",
        help = "Which limiters a sweep removes: idle, settled",
        default_value = "idle",
        env = "WAGATE_REAP_POLICY"
    )]
    pub reap_policy: ReapPolicy,
    #[arg(
        long,
        value_name = "SECS",
        help = "Fail a queued request after this many seconds",
        env = "WAGATE_QUEUE_TIMEOUT"
    )]
    pub queue_timeout: Option<u64>,

    // General options
    #[arg(
        long,
        value_name = "SIZE",
        help = "Event channel capacity per subscriber",
        default_value_t = 1024,
        env = "WAGATE_EVENT_CAPACITY"
    )]
    pub event_capacity: usize,
    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level: error, warn, info, debug, trace",
        default_value = "info",
        env = "WAGATE_LOG_LEVEL"
    )]
    pub log_level: String,

    // Utility options
    #[arg(
        long,
        help = "List all environment variables and exit",
        action = clap::ArgAction::SetTrue
    )]
    pub list_env_vars: bool,
}

/// Limit overrides for one category; unset fields keep the current value
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicyOverride {
    pub max_concurrent: Option<u32>,
    pub min_spacing_ms: Option<u64>,
    pub reservoir: Option<u32>,
    pub refill_amount: Option<u32>,
    pub refill_interval_ms: Option<u64>,
}

impl PolicyOverride {
    pub fn apply(&self, base: Policy) -> Policy {
        Policy {
            max_concurrent: self.max_concurrent.unwrap_or(base.max_concurrent),
            min_spacing: self
                .min_spacing_ms
                .map_or(base.min_spacing, Duration::from_millis),
            reservoir_capacity: self.reservoir.unwrap_or(base.reservoir_capacity),
            refill_amount: self.refill_amount.unwrap_or(base.refill_amount),
            refill_interval: self
                .refill_interval_ms
                .map_or(base.refill_interval, Duration::from_millis),
        }
    }
}

/// Build a policy table from the defaults plus the overrides in `source`
pub fn load_policies<S>(source: S) -> Result<PolicyTable>
where
    S: config::Source + Send + Sync + 'static,
{
    let overrides: HashMap<String, PolicyOverride> = config::Config::builder()
        .add_source(source)
        .build()?
        .try_deserialize()?;

    let mut table = PolicyTable::default();
    for (name, policy) in &overrides {
        let category: Category = name.parse()?;
        let merged = policy.apply(*table.get(category));
        table
            .set(category, merged)
            .with_context(|| format!("Invalid limits for category {category}"))?;
    }
    Ok(table)
}

/// Load policies from a file whose format is inferred from its extension
pub fn load_policy_file(path: &Path) -> Result<PolicyTable> {
    load_policies(config::File::from(path))
        .with_context(|| format!("Failed to load policy file {}", path.display()))
}

impl Config {
    /// Build configuration from environment variables and CLI arguments
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The access token or phone number id is missing
    /// - The policy file cannot be read or holds invalid limits
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        if args.list_env_vars {
            Self::print_env_vars();
            std::process::exit(0);
        }

        Self::from_args(args)
    }

    /// Build configuration from already parsed arguments
    pub fn from_args(args: Args) -> Result<Self> {
        let policies = match &args.policy_file {
            Some(path) => load_policy_file(path)?,
            None => PolicyTable::default(),
        };

        let config = Config {
            http: HttpConfig {
                host: args.http_host,
                port: args.http_port,
            },
            whatsapp: WhatsAppConfig {
                base_url: args.api_base_url,
                api_version: args.api_version,
                access_token: args.access_token.unwrap_or_default(),
                phone_number_id: args.phone_number_id.unwrap_or_default(),
                business_account_id: args.business_account_id,
                verify_token: args.verify_token,
            },
            scheduler: SchedulerConfig {
                policies,
                buffer_size: args.buffer_size,
                reap_interval: Duration::from_secs(args.reap_interval),
                reap_policy: args.reap_policy,
                queue_timeout: args.queue_timeout.map(Duration::from_secs),
            },
            event_capacity: args.event_capacity,
            log_level: args.log_level,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()> {
        if self.whatsapp.access_token.is_empty() {
            return Err(anyhow!(
                "An access token is required.\n\n\
                Set it with --access-token or WAGATE_ACCESS_TOKEN.\n\n\
                For more information, try '--help'"
            ));
        }
        if self.whatsapp.phone_number_id.is_empty() {
            return Err(anyhow!(
                "A phone number id is required.\n\n\
                Set it with --phone-number-id or WAGATE_PHONE_NUMBER_ID.\n\n\
                For more information, try '--help'"
            ));
        }
        if self.scheduler.buffer_size == 0 {
            return Err(anyhow!("Buffer size must be greater than zero"));
        }
        if self.scheduler.reap_interval.is_zero() {
            return Err(anyhow!("Reap interval must be greater than zero"));
        }
        if self.scheduler.queue_timeout.is_some_and(|t| t.is_zero()) {
            return Err(anyhow!("Queue timeout must be greater than zero"));
        }
        Ok(())
    }

    /// Print all available environment variables and their descriptions
    fn print_env_vars() {
        println!("wagate Environment Variables");
        println!("============================");
        println!();
        println!("All environment variables use the WAGATE_ prefix.");
        println!("CLI arguments take precedence over environment variables.");
        println!();

        println!("HTTP Configuration:");
        println!("  WAGATE_HTTP_HOST=<host>               HTTP host [default: 127.0.0.1]");
        println!("  WAGATE_HTTP_PORT=<port>               HTTP port [default: 3000]");
        println!();

        println!("WhatsApp Cloud API:");
        println!(
            "  WAGATE_API_BASE_URL=<url>             Graph API base URL [default: https://graph.facebook.com]"
        );
        println!("  WAGATE_API_VERSION=<version>          Graph API version [default: v21.0]");
        println!("  WAGATE_ACCESS_TOKEN=<token>           Access token (required)");
        println!("  WAGATE_PHONE_NUMBER_ID=<id>           Sending phone number id (required)");
        println!("  WAGATE_BUSINESS_ACCOUNT_ID=<id>       WhatsApp Business account id");
        println!("  WAGATE_VERIFY_TOKEN=<token>           Webhook verify token");
        println!();

        println!("Scheduler Configuration:");
        println!("  WAGATE_POLICY_FILE=<path>             Per-category limit overrides");
        println!("  WAGATE_BUFFER_SIZE=<size>             Channel buffer size [default: 10000]");
        println!(
            "  WAGATE_REAP_INTERVAL=<secs>           Idle limiter sweep interval [default: 3600]"
        );
        println!("  WAGATE_REAP_POLICY=<policy>           idle, settled [default: idle]");
        println!("  WAGATE_QUEUE_TIMEOUT=<secs>           Admission deadline [default: none]");
        println!();

        println!("General Configuration:");
        println!("  WAGATE_EVENT_CAPACITY=<size>          Event channel capacity [default: 1024]");
        println!(
            "  WAGATE_LOG_LEVEL=<level>              Log level: error, warn, info, debug, trace [default: info]"
        );
        println!();

        println!("Examples:");
        println!("  export WAGATE_ACCESS_TOKEN=EAAG...");
        println!("  export WAGATE_PHONE_NUMBER_ID=106540352242922");
        println!("  wagate --http-port 8080 --policy-file limits.toml");
    }
}
