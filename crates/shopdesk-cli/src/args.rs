//! Command-line surface for `shopdesk`.

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "shopdesk", version, about = "Shop administration console", long_about = None)]
pub struct Cli {
    /// API base URL, overrides the config file
    #[arg(long, global = true, env = "SHOPDESK_BASE_URL")]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign in and persist the session
    Login {
        #[arg(long, env = "SHOPDESK_USERNAME")]
        username: Option<String>,
        /// Prompted for when unset. Hidden so it is passed through env, not history
        #[arg(long, hide = true, env = "SHOPDESK_PASSWORD")]
        password: Option<String>,
    },
    /// Sign out and clear the persisted session
    Logout,
    /// Show the signed-in account
    Whoami,
    /// Shop management
    Shops(ShopsArgs),
    /// Order lookup
    Orders(OrdersArgs),
    /// Redemption requests
    Redemptions(RedemptionsArgs),
    /// Print a list every time it changes
    Watch {
        resource: Resource,
        /// Seconds between refetches
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },
}

#[derive(Parser, Debug)]
pub struct ShopsArgs {
    #[command(subcommand)]
    pub action: ShopsCmd,
}

#[derive(Subcommand, Debug)]
pub enum ShopsCmd {
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Show {
        id: String,
    },
    Approve {
        id: String,
        #[arg(long)]
        note: Option<String>,
    },
}

#[derive(Parser, Debug)]
pub struct OrdersArgs {
    #[command(subcommand)]
    pub action: OrdersCmd,
}

#[derive(Subcommand, Debug)]
pub enum OrdersCmd {
    List {
        #[arg(long)]
        shop: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    Show {
        id: String,
    },
}

#[derive(Parser, Debug)]
pub struct RedemptionsArgs {
    #[command(subcommand)]
    pub action: RedemptionsCmd,
}

#[derive(Subcommand, Debug)]
pub enum RedemptionsCmd {
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Approve {
        id: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Shops,
    Orders,
    Redemptions,
}
