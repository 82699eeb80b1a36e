use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use colizeum_core::api::{ApiConfig, ApiMode, User};
use colizeum_core::auth::{AuthError, CallbackStrategy, FileTokenVault, LoginOptions, Session};
use colizeum_core::config::{SdkConfig, StorageKey};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about = "Colizeum platform CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Authentication related commands
    #[command(subcommand)]
    Auth(AuthCommand),
    /// User account details
    #[command(subcommand)]
    User(UserCommand),
    /// Energy and currency balances
    #[command(subcommand)]
    Funds(FundsCommand),
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Sign in through the browser PKCE flow
    Login(LoginArgs),
    /// Revoke and forget stored tokens
    Logout,
}

#[derive(Args, Debug)]
struct LoginArgs {
    /// Print the authorization URL instead of opening a browser
    #[arg(long)]
    no_browser: bool,
    /// Give up waiting for the callback after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Show the signed-in account profile
    Me(OutputArgs),
}

#[derive(Subcommand, Debug)]
enum FundsCommand {
    /// Show the energy balance
    Energy(OutputArgs),
    /// Spend energy
    Consume(ConsumeArgs),
    /// Show the secondary currency balance
    Currency(OutputArgs),
    /// Show total earnings
    Earnings(OutputArgs),
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ConsumeArgs {
    /// Amount of energy to spend
    #[arg(long)]
    amount: i64,
    /// Token to draw the energy from
    #[arg(long = "token-id")]
    token_id: Option<String>,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Auth(cmd) => match cmd {
            AuthCommand::Login(args) => auth_login(args).await?,
            AuthCommand::Logout => auth_logout().await?,
        },
        Commands::User(cmd) => match cmd {
            UserCommand::Me(args) => user_me(args).await?,
        },
        Commands::Funds(cmd) => match cmd {
            FundsCommand::Energy(args) => funds_energy(args).await?,
            FundsCommand::Consume(args) => funds_consume(args).await?,
            FundsCommand::Currency(args) => funds_currency(args).await?,
            FundsCommand::Earnings(args) => funds_earnings(args).await?,
        },
    }
    Ok(())
}

async fn auth_login(args: LoginArgs) -> Result<()> {
    let mut session = open_session()?;
    let options = LoginOptions {
        open_browser: !args.no_browser,
        timeout: args.timeout.map(Duration::from_secs),
        ..Default::default()
    };
    let user = session
        .login(options, print_authorization_url)
        .await
        .context("login failed")?;

    let identity = user
        .username
        .clone()
        .or_else(|| user.email.clone())
        .unwrap_or_else(|| user.id.clone());
    println!("Signed in as {identity}.");
    Ok(())
}

async fn auth_logout() -> Result<()> {
    let mut session = open_session()?;
    session.logout().await.context("logout failed")?;
    println!("Signed out.");
    Ok(())
}

async fn user_me(args: OutputArgs) -> Result<()> {
    let session = open_signed_in_session().await?;
    let user = session.api().me().await.context("profile request failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&user)?);
    } else {
        render_user(&user);
    }
    Ok(())
}

async fn funds_energy(args: OutputArgs) -> Result<()> {
    let session = open_signed_in_session().await?;
    let energy = session.api().energy().await.context("energy request failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&energy)?);
        return Ok(());
    }

    println!("Energy: {}/{}", energy.total_energy, energy.max_energy);
    for token in &energy.tokens {
        let next = token
            .next_energy_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "  {}: {}/{} (+{} per {}s, next at {})",
            token.token_id,
            token.energy,
            token.max_energy,
            token.energy_regeneration_amount,
            token.energy_regeneration_rate,
            next
        );
    }
    Ok(())
}

async fn funds_consume(args: ConsumeArgs) -> Result<()> {
    let session = open_signed_in_session().await?;
    let result = session
        .api()
        .consume_energy(args.amount, args.token_id.as_deref())
        .await
        .context("energy consumption failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Remaining energy: {}", result.remaining_energy);
    }
    Ok(())
}

async fn funds_currency(args: OutputArgs) -> Result<()> {
    let session = open_signed_in_session().await?;
    let currency = session
        .api()
        .secondary_currency()
        .await
        .context("currency request failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&currency)?);
    } else {
        println!("Secondary currency: {}", currency.total);
    }
    Ok(())
}

async fn funds_earnings(args: OutputArgs) -> Result<()> {
    let session = open_signed_in_session().await?;
    let earnings = session
        .api()
        .earnings()
        .await
        .context("earnings request failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&earnings)?);
    } else {
        println!("Earnings: {}", earnings.total);
    }
    Ok(())
}

fn open_session() -> Result<Session<FileTokenVault>> {
    Session::new(build_config()?).context("unable to initialise session")
}

async fn open_signed_in_session() -> Result<Session<FileTokenVault>> {
    let session = open_session()?;
    let signed_in = { session.token_store().lock().await.exists() };
    if !signed_in {
        return Err(anyhow!("no tokens stored; run `colizeum auth login` first"));
    }
    Ok(session)
}

fn build_config() -> Result<SdkConfig> {
    let client_id = env::var("COLIZEUM_CLIENT_ID")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .context("COLIZEUM_CLIENT_ID is not set")?;
    let storage = StorageKey::from_env().context("storage key material missing")?;
    let mut config = SdkConfig::new(client_id, storage);

    if let Ok(port) = env::var("COLIZEUM_LOOPBACK_PORT") {
        if !port.trim().is_empty() {
            let port = port
                .trim()
                .parse()
                .context("invalid COLIZEUM_LOOPBACK_PORT")?;
            config = config.with_callback(CallbackStrategy::Loopback { port });
        }
    }

    let mut api = ApiConfig::default();
    if let Ok(base) = env::var("COLIZEUM_API_URL") {
        if !base.trim().is_empty() {
            api.base_url = Url::parse(base.trim()).context("invalid COLIZEUM_API_URL")?;
        }
    }
    if let Ok(mode) = env::var("COLIZEUM_API_MODE") {
        if !mode.trim().is_empty() {
            api.mode = parse_api_mode(&mode)?;
        }
    }
    config = config.with_api(api);

    if let Ok(profile) = env::var("COLIZEUM_PROFILE") {
        if !profile.trim().is_empty() {
            config = config.with_profile(profile.trim().to_owned());
        }
    }

    Ok(config)
}

fn parse_api_mode(raw: &str) -> Result<ApiMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "production" | "prod" => Ok(ApiMode::Production),
        "sandbox" => Ok(ApiMode::Sandbox),
        other => Err(anyhow!("unrecognized COLIZEUM_API_MODE '{other}'")),
    }
}

fn print_authorization_url(url: &Url) -> Result<(), AuthError> {
    println!("\nAuthorize the application by visiting:\n  {url}\n");
    Ok(())
}

fn render_user(user: &User) {
    println!("User ID  : {}", user.id);
    if let Some(username) = &user.username {
        println!("Username : {}", username);
    }
    if let Some(email) = &user.email {
        println!("Email    : {}", email);
    }
    println!("Created  : {}", user.created_at.to_rfc3339());
    println!(
        "Energy   : {}/{}",
        user.energy.total_energy, user.energy.max_energy
    );
    if !user.wallets.is_empty() {
        let addresses: Vec<&str> = user
            .wallets
            .iter()
            .map(|wallet| wallet.address.as_str())
            .collect();
        println!("Wallets  : {}", addresses.join(", "));
    }
}
