//! forexsim CLI - command line interface for the demo trading simulation.
//!
//! Every command prints a JSON `ApiResponse` on stdout; logs go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use forex_sim_core::{
    account::{FileStore, SignupRequest},
    engine::TradeRequest,
    ApiResponse, Direction, Plan, SimConfig, Simulation, User,
};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "forexsim")]
#[command(about = "Mock forex paper trading - demo accounts, positions and synthetic quotes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a demo account and log in
    Signup {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
        /// Password confirmation
        #[arg(short, long)]
        confirm: String,
    },
    /// Log in to an existing account
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    /// Log out of the current session
    Logout,
    /// Show the logged-in user
    Whoami,
    /// Show the trading account and book summary
    Account,
    /// Change the subscription plan
    Upgrade {
        /// free or elite
        #[arg(short, long, default_value = "elite")]
        plan: String,
    },
    /// Position commands
    Trade {
        #[command(subcommand)]
        action: TradeAction,
    },
    /// Show current quotes
    Quotes,
    /// Run the tick loop
    Run {
        /// Stop after this many ticks (runs until Ctrl-C otherwise)
        #[arg(short, long)]
        ticks: Option<u64>,
    },
}

#[derive(Subcommand)]
enum TradeAction {
    /// Open a position at the current quote
    Open {
        /// Instrument pair, e.g. EUR/USD
        #[arg(short = 'y', long)]
        pair: String,
        /// BUY or SELL
        #[arg(short, long)]
        direction: String,
        /// Lot size
        #[arg(short, long)]
        lots: f64,
        #[arg(long)]
        stop_loss: Option<f64>,
        #[arg(long)]
        take_profit: Option<f64>,
    },
    /// Close an open position at the current quote
    Close {
        #[arg(short, long)]
        id: String,
    },
    /// Replace stop-loss / take-profit on an open position
    Modify {
        #[arg(short, long)]
        id: String,
        #[arg(long)]
        stop_loss: Option<f64>,
        #[arg(long)]
        take_profit: Option<f64>,
    },
    /// List positions
    List {
        /// Include closed positions
        #[arg(short, long)]
        all: bool,
    },
}

/// Public view of a user, without the credential digest.
fn profile(user: &User) -> serde_json::Value {
    json!({
        "id": user.id,
        "name": user.display_name(),
        "email": user.email,
        "plan": user.plan,
        "createdAt": user.created_at,
    })
}

fn render<T: Serialize>(result: forex_sim_core::Result<T>) -> anyhow::Result<String> {
    let response = match result {
        Ok(data) => serde_json::to_value(ApiResponse::ok(data))?,
        Err(e) => serde_json::to_value(ApiResponse::<()>::err(e.to_string()))?,
    };
    Ok(serde_json::to_string_pretty(&response)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = SimConfig::load().context("loading configuration")?;
    let store = FileStore::new(&config.data_dir);
    let mut sim = Simulation::open(store, config).context("opening simulation data")?;

    let output = match cli.command {
        Commands::Signup {
            first_name,
            last_name,
            email,
            password,
            confirm,
        } => {
            let request = SignupRequest::new(&first_name, &last_name, &email, &password, &confirm);
            render(sim.signup(&request).map(|user| profile(&user)))?
        }
        Commands::Login { email, password } => {
            render(sim.login(&email, &password).map(|user| profile(&user)))?
        }
        Commands::Logout => render(sim.logout().map(|_| json!({ "message": "Logged out" })))?,
        Commands::Whoami => render(
            sim.accounts()
                .current_user()
                .map(profile)
                .ok_or(forex_sim_core::Error::NotAuthenticated),
        )?,
        Commands::Account => {
            let result = sim.account().and_then(|account| {
                let remaining = sim.trades_remaining()?;
                Ok(json!({
                    "account": account,
                    "tradesRemainingToday": remaining,
                    "book": sim.engine().summary(),
                }))
            });
            render(result)?
        }
        Commands::Upgrade { plan } => {
            let result = plan
                .parse::<Plan>()
                .and_then(|plan| sim.upgrade_plan(plan))
                .map(|user| profile(&user));
            render(result)?
        }
        Commands::Trade { action } => handle_trade(&mut sim, action)?,
        Commands::Quotes => render(Ok(sim.feed().quotes().to_vec()))?,
        Commands::Run { ticks } => {
            let result = sim
                .run_with(ticks, |report| {
                    for settlement in &report.settlements {
                        if let Ok(line) = serde_json::to_string(settlement) {
                            eprintln!("{}", line);
                        }
                    }
                })
                .await
                .map(|count| json!({ "ticks": count }));
            render(result)?
        }
    };

    println!("{}", output);
    Ok(())
}

fn handle_trade(sim: &mut Simulation<FileStore>, action: TradeAction) -> anyhow::Result<String> {
    let now = chrono::Utc::now();

    match action {
        TradeAction::Open {
            pair,
            direction,
            lots,
            stop_loss,
            take_profit,
        } => {
            let result = direction.parse::<Direction>().and_then(|direction| {
                let mut request = TradeRequest::new(&pair, direction, lots);
                request.stop_loss = stop_loss;
                request.take_profit = take_profit;
                sim.execute_trade(&request, now)
            });
            render(result)
        }
        TradeAction::Close { id } => render(sim.close_trade(&id, now).map(|settlement| {
            match settlement {
                Some(settlement) => json!({ "settlement": settlement }),
                None => json!({ "message": format!("No open position {}", id) }),
            }
        })),
        TradeAction::Modify {
            id,
            stop_loss,
            take_profit,
        } => render(sim.modify_trade(&id, stop_loss, take_profit)),
        TradeAction::List { all } => {
            let positions: Vec<_> = if all {
                sim.engine().positions().to_vec()
            } else {
                sim.engine().open_positions().into_iter().cloned().collect()
            };
            render(Ok(positions))
        }
    }
}
